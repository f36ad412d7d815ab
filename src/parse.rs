use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::Error;
use crate::FlagSet;
use crate::Record;
use crate::Result;
use crate::Value;

static KERNEL_INFO_LINE: OnceLock<Regex> = OnceLock::new();

fn kernel_info_line() -> &'static Regex {
    KERNEL_INFO_LINE
        .get_or_init(|| Regex::new(r"^([\w()]+):\W+(.+)").expect("kernel info line regex"))
}

/// Raw fields of one block in kernel order; a repeated key keeps its first
/// position and takes the latest value.
#[derive(Debug, Default)]
struct RawRecord(Vec<(String, String)>);

impl RawRecord {
    fn insert(&mut self, key: &str, value: &str) {
        match self.0.iter_mut().find(|(existing, _)| existing == key) {
            Some((_, slot)) => *slot = value.to_owned(),
            None => self.0.push((key.to_owned(), value.to_owned())),
        }
    }
}

/// Splits a `Key:   value` line shared by smaps and meminfo.
///
/// Returns `None` for anything else, most notably smaps mapping headers
/// such as `00400000-0040c000 r-xp 00000000 08:01 1048602  /bin/cat`.
pub fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_end_matches(['\n', '\r']);
    let captures = kernel_info_line().captures(line)?;
    let key = captures.get(1)?.as_str();
    let value = captures.get(2)?.as_str();
    Some((key, value))
}

/// Normalizes one raw field. A `kB` anywhere in the value makes it a
/// quantity; otherwise `VmFlags` becomes a flag set and everything else
/// stays text.
pub fn normalize(key: &str, value: &str) -> Result<Value> {
    if value.contains("kB") {
        let number = value.split_whitespace().next().unwrap_or_default();
        return number
            .parse::<u64>()
            .map(Value::Quantity)
            .map_err(|source| Error::MalformedQuantity {
                field: key.to_owned(),
                value: value.to_owned(),
                source,
            });
    }

    if key == "VmFlags" {
        return Ok(Value::Flags(FlagSet::parse(value)));
    }

    Ok(Value::Text(value.to_owned()))
}

fn finalize(raw: RawRecord) -> Result<Record> {
    raw.0
        .into_iter()
        .map(|(key, value)| {
            let value = normalize(&key, &value)?;
            Ok((key, value))
        })
        .collect()
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

/// Groups smaps text into one [`Record`] per mapping header.
///
/// Header lines only delimit records; their contents are not kept.
#[derive(Debug, Default)]
pub struct MemoryMapParser {
    line: usize,
    current: Option<RawRecord>,
    vmas: Vec<Record>,
}

impl MemoryMapParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: &str) -> Result<()> {
        self.line += 1;

        if is_blank(line) {
            return Ok(());
        }

        let Some((key, value)) = parse_line(line) else {
            if let Some(raw) = self.current.take() {
                self.vmas.push(finalize(raw)?);
            }
            self.current = Some(RawRecord::default());
            return Ok(());
        };

        match &mut self.current {
            Some(raw) => {
                raw.insert(key, value);
                Ok(())
            }
            None => Err(Error::UnexpectedKeyValueLine {
                line: self.line,
                text: line.trim_end_matches(['\n', '\r']).to_owned(),
            }),
        }
    }

    pub fn finish(mut self) -> Result<Vec<Record>> {
        if let Some(raw) = self.current.take() {
            self.vmas.push(finalize(raw)?);
        }
        tracing::debug!(vmas = self.vmas.len(), "parsed memory map");
        Ok(self.vmas)
    }
}

/// Accumulates meminfo text into a single [`Record`]; the last value of a
/// repeated key wins.
#[derive(Debug, Default)]
pub struct MeminfoParser {
    line: usize,
    raw: RawRecord,
}

impl MeminfoParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: &str) -> Result<()> {
        self.line += 1;

        if is_blank(line) {
            return Ok(());
        }

        let (key, value) = parse_line(line).ok_or_else(|| Error::InvalidMeminfoLine {
            line: self.line,
            text: line.trim_end_matches(['\n', '\r']).to_owned(),
        })?;
        self.raw.insert(key, value);
        Ok(())
    }

    pub fn finish(self) -> Result<Record> {
        let meminfo = finalize(self.raw)?;
        tracing::debug!(fields = meminfo.len(), "parsed meminfo");
        Ok(meminfo)
    }
}

pub fn parse_memory_map<I, S>(lines: I) -> Result<Vec<Record>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parser = MemoryMapParser::new();
    for line in lines {
        parser.push(line.as_ref())?;
    }
    parser.finish()
}

pub fn parse_meminfo<I, S>(lines: I) -> Result<Record>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parser = MeminfoParser::new();
    for line in lines {
        parser.push(line.as_ref())?;
    }
    parser.finish()
}

pub fn read_memory_map<R: BufRead>(reader: R) -> Result<Vec<Record>> {
    let mut parser = MemoryMapParser::new();
    for line in reader.lines() {
        parser.push(&line?)?;
    }
    parser.finish()
}

pub fn read_meminfo<R: BufRead>(reader: R) -> Result<Record> {
    let mut parser = MeminfoParser::new();
    for line in reader.lines() {
        parser.push(&line?)?;
    }
    parser.finish()
}

pub fn read_memory_map_path(path: &Path) -> Result<Vec<Record>> {
    let reader = File::open(path).map(BufReader::new)?;
    read_memory_map(reader)
}

pub fn read_meminfo_path(path: &Path) -> Result<Record> {
    let reader = File::open(path).map(BufReader::new)?;
    read_meminfo(reader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_line_key_value() {
        assert_eq!(parse_line("Size:                 48 kB"), Some(("Size", "48 kB")));
        assert_eq!(parse_line("Active(anon):     4096 kB\n"), Some(("Active(anon)", "4096 kB")));
        assert_eq!(parse_line("VmFlags: rd wr mr mw me ac sd "), Some(("VmFlags", "rd wr mr mw me ac sd ")));
        assert_eq!(parse_line("THPeligible:    0"), Some(("THPeligible", "0")));
    }

    #[test]
    fn parse_line_rejects_headers() {
        assert_eq!(parse_line("00400000-0040c000 r-xp 00000000 08:01 1048602    /bin/cat"), None);
        assert_eq!(parse_line("7ffd2c3e5000-7ffd2c406000 rw-p 00000000 00:00 0   [stack]"), None);
        assert_eq!(parse_line("Size 48 kB"), None);
        assert_eq!(parse_line("Two Words: 1"), None);
        assert_eq!(parse_line("Empty: "), None);
    }

    #[test]
    fn normalize_picks_variant_per_field() {
        assert_eq!(normalize("Rss", "44 kB").unwrap(), Value::Quantity(44));
        assert_eq!(
            normalize("VmFlags", "rd  wr ac").unwrap(),
            Value::Flags(FlagSet::parse("ac rd wr"))
        );
        assert_eq!(normalize("THPeligible", "0").unwrap(), Value::Text("0".to_owned()));
        assert_eq!(normalize("Name", "rd wr").unwrap(), Value::Text("rd wr".to_owned()));
    }

    #[test]
    fn normalize_quantity_wins_over_flags() {
        assert_eq!(normalize("VmFlags", "12 kB").unwrap(), Value::Quantity(12));
    }

    #[test]
    fn normalize_malformed_quantity() {
        let error = normalize("Size", "lots kB").unwrap_err();
        assert!(matches!(
            error,
            Error::MalformedQuantity { ref field, ref value, .. } if field == "Size" && value == "lots kB"
        ));
    }

    #[test]
    fn normalize_is_idempotent_on_rendering() {
        for (key, raw) in [("Size", "134217728 kB"), ("VmFlags", "wr rd ac rd")] {
            let once = normalize(key, raw).unwrap();
            let twice = normalize(key, &once.to_string()).unwrap();
            assert_eq!(once, twice, "key={key}");
        }
    }

    #[test]
    fn memory_map_header_at_end_yields_empty_record() {
        let vmas = parse_memory_map(["00400000-00401000 r--p 00000000 00:00 0"]).unwrap();
        assert_eq!(vmas, vec![Record::default()]);
    }

    #[test]
    fn memory_map_empty_input() {
        let vmas = parse_memory_map(Vec::<String>::new()).unwrap();
        assert!(vmas.is_empty());
    }

    #[test]
    fn memory_map_later_key_overwrites() {
        let vmas = parse_memory_map(["header", "Size: 4 kB", "Size: 8 kB"]).unwrap();
        assert_eq!(vmas[0].size(), Some(8));
        assert_eq!(vmas[0].len(), 1);
    }

    #[test]
    fn memory_map_keeps_kernel_field_order() {
        let vmas = parse_memory_map(["header", "Size: 4 kB", "Rss: 4 kB", "Anonymous: 0 kB", "VmFlags: rd"]).unwrap();
        let keys: Vec<&str> = vmas[0].iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, ["Size", "Rss", "Anonymous", "VmFlags"]);
    }

    #[test]
    fn memory_map_overwritten_value_is_not_normalized() {
        let vmas = parse_memory_map(["header", "Size: x kB", "Size: 8 kB"]).unwrap();
        assert_eq!(vmas[0].size(), Some(8));
    }

    #[test]
    fn memory_map_key_value_before_header() {
        let error = parse_memory_map(["", "MemTotal:  7941748 kB", "header"]).unwrap_err();
        assert!(matches!(
            error,
            Error::UnexpectedKeyValueLine { line: 2, ref text } if text == "MemTotal:  7941748 kB"
        ));
    }

    #[test]
    fn memory_map_malformed_quantity_discards_result() {
        let error = parse_memory_map(["header", "Size: x kB"]).unwrap_err();
        assert!(matches!(error, Error::MalformedQuantity { .. }));
    }

    #[test]
    fn meminfo_last_value_wins() {
        let meminfo = parse_meminfo(["MemFree:  1 kB", "MemFree:  2 kB", ""]).unwrap();
        assert_eq!(meminfo.mem_free(), Some(2));
        assert_eq!(meminfo.len(), 1);
    }

    #[test]
    fn meminfo_rejects_header() {
        let error = parse_meminfo(["MemFree:  1 kB", "00400000-00401000 r--p 00000000 00:00 0"]).unwrap_err();
        assert!(matches!(error, Error::InvalidMeminfoLine { line: 2, .. }));
    }

    #[test]
    fn readers_match_line_parsers() {
        let text = "00400000-00401000 r--p 00000000 00:00 0\nSize:  4 kB\nVmFlags: rd ac\n";
        let from_reader = read_memory_map(text.as_bytes()).unwrap();
        let from_lines = parse_memory_map(text.lines()).unwrap();
        assert_eq!(from_reader, from_lines);

        let meminfo = read_meminfo("MemTotal:  10 kB\r\nMemFree:  5 kB\r\n".as_bytes()).unwrap();
        assert_eq!(meminfo.mem_total(), Some(10));
        assert_eq!(meminfo.mem_free(), Some(5));
    }

    #[test]
    fn read_missing_path_is_io_error() {
        let error = read_meminfo_path(Path::new("/nonexistent/canfork/meminfo")).unwrap_err();
        assert!(matches!(error, Error::Io(_)));
    }
}
