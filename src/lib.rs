use std::collections::BTreeSet;
use std::fmt;
use std::slice;

use bitflags::bitflags;

mod error;
mod parse;
pub mod policy;
pub mod probe;

pub use error::Error;
pub use error::Result;
pub use parse::normalize;
pub use parse::parse_line;
pub use parse::parse_memory_map;
pub use parse::parse_meminfo;
pub use parse::read_memory_map;
pub use parse::read_memory_map_path;
pub use parse::read_meminfo;
pub use parse::read_meminfo_path;
pub use parse::MemoryMapParser;
pub use parse::MeminfoParser;
pub use policy::at_risk;
pub use policy::max_accounted_vma_size;
pub use probe::probe_allocations;
pub use probe::ProbeOutcome;

/// A normalized kernel field value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Kilobytes, from any value carrying a `kB` unit.
    Quantity(u64),
    /// Tokens of a `VmFlags` field.
    Flags(FlagSet),
    Text(String),
}

impl Value {
    pub fn as_quantity(&self) -> Option<u64> {
        match self {
            Value::Quantity(kb) => Some(*kb),
            _ => None,
        }
    }

    pub fn as_flags(&self) -> Option<&FlagSet> {
        match self {
            Value::Flags(flags) => Some(flags),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Renders the value the way the kernel prints it, so that normalizing the
/// rendering yields the same value again.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Quantity(kb) => write!(f, "{} kB", kb),
            Value::Flags(flags) => fmt::Display::fmt(flags, f),
            Value::Text(text) => f.write_str(text),
        }
    }
}

/// The raw tokens of a `VmFlags` line, including ones [`VmFlags`] does not know.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlagSet(BTreeSet<String>);

impl FlagSet {
    pub fn parse(data: &str) -> Self {
        data.split_whitespace().map(str::to_owned).collect()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.0.contains(token)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Known flags only; unrecognized tokens are dropped.
    pub fn vm_flags(&self) -> VmFlags {
        self.iter()
            .filter_map(VmFlags::from_token)
            .fold(VmFlags::empty(), |acc, flag| acc | flag)
    }
}

impl FromIterator<String> for FlagSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, token) in self.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            f.write_str(token)?;
        }
        Ok(())
    }
}

/// One block of normalized kernel key/value text: a single VMA from a
/// memory map, or the whole of meminfo.
///
/// Fields keep the order the kernel printed them in. Inserting an existing
/// key replaces its value in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn insert(&mut self, key: String, value: Value) {
        match self.fields.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn quantity(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_quantity)
    }

    pub fn flags(&self, key: &str) -> Option<&FlagSet> {
        self.get(key).and_then(Value::as_flags)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_text)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> slice::Iter<'_, (String, Value)> {
        self.fields.iter()
    }

    /// `Size` of a VMA record, in kB.
    pub fn size(&self) -> Option<u64> {
        self.quantity("Size")
    }

    pub fn vm_flags(&self) -> Option<&FlagSet> {
        self.flags("VmFlags")
    }

    pub fn mem_total(&self) -> Option<u64> {
        self.quantity("MemTotal")
    }

    pub fn mem_free(&self) -> Option<u64> {
        self.quantity("MemFree")
    }

    pub fn mem_available(&self) -> Option<u64> {
        self.quantity("MemAvailable")
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut record = Self::default();
        for (key, value) in iter {
            record.insert(key, value);
        }
        record
    }
}

impl<'a> IntoIterator for &'a Record {
    type Item = &'a (String, Value);
    type IntoIter = slice::Iter<'a, (String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct VmFlags: u64 {
        /// readable
        const RD = 1 << 0;
        /// writable
        const WR = 1 << 1;
        /// executable
        const EX = 1 << 2;
        /// shared
        const SH = 1 << 3;
        /// may read
        const MR = 1 << 4;
        /// may write
        const MW = 1 << 5;
        /// may execute
        const ME = 1 << 6;
        /// may share
        const MS = 1 << 7;
        /// stack segment grows down
        const GD = 1 << 8;
        /// pure PFN range
        const PF = 1 << 9;
        /// disabled write to the mapped file
        const DW = 1 << 10;
        /// pages are locked in memory
        const LO = 1 << 11;
        /// memory mapped I/O area
        const IO = 1 << 12;
        /// sequential read advise provided
        const SR = 1 << 13;
        /// random read advise provided
        const RR = 1 << 14;
        /// do not copy area on fork
        const DC = 1 << 15;
        /// do not expand area on remapping
        const DE = 1 << 16;
        /// area is accountable: counts against the commit limit
        const AC = 1 << 17;
        /// swap space is not reserved for the area
        const NR = 1 << 18;
        /// area uses huge tlb pages
        const HT = 1 << 19;
        /// perform synchronous page faults
        const SF = 1 << 20;
        /// non-linear mapping (removed in Linux 4.0)
        const NL = 1 << 21;
        /// architecture specific flag
        const AR = 1 << 22;
        /// wipe on fork
        const WF = 1 << 23;
        /// do not include area into core dump
        const DD = 1 << 24;
        /// soft-dirty flag
        const SD = 1 << 25;
        /// mixed map area
        const MM = 1 << 26;
        /// huge page advise flag
        const HG = 1 << 27;
        /// no-huge page advise flag
        const NH = 1 << 28;
        /// mergeable advise flag
        const MG = 1 << 29;
        /// userfaultfd missing pages tracking
        const UM = 1 << 30;
        /// userfaultfd wprotect pages tracking
        const UW = 1 << 31;
        /// arm64 branch target identification
        const BT = 1 << 32;
        /// arm64 memory tagging enabled
        const MT = 1 << 33;
        /// shadow stack page
        const SS = 1 << 34;
        /// sealed
        const SL = 1 << 35;
    }
}

impl VmFlags {
    pub fn from_token(token: &str) -> Option<Self> {
        let flag = match token {
            "rd" => Self::RD,
            "wr" => Self::WR,
            "ex" => Self::EX,
            "sh" => Self::SH,
            "mr" => Self::MR,
            "mw" => Self::MW,
            "me" => Self::ME,
            "ms" => Self::MS,
            "gd" => Self::GD,
            "pf" => Self::PF,
            "dw" => Self::DW,
            "lo" => Self::LO,
            "io" => Self::IO,
            "sr" => Self::SR,
            "rr" => Self::RR,
            "dc" => Self::DC,
            "de" => Self::DE,
            "ac" => Self::AC,
            "nr" => Self::NR,
            "ht" => Self::HT,
            "sf" => Self::SF,
            "nl" => Self::NL,
            "ar" => Self::AR,
            "wf" => Self::WF,
            "dd" => Self::DD,
            "sd" => Self::SD,
            "mm" => Self::MM,
            "hg" => Self::HG,
            "nh" => Self::NH,
            "mg" => Self::MG,
            "um" => Self::UM,
            "uw" => Self::UW,
            "bt" => Self::BT,
            "mt" => Self::MT,
            "ss" => Self::SS,
            "sl" => Self::SL,
            _ => return None,
        };
        Some(flag)
    }
}
