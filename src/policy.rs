//! Fork feasibility: a fork needs commit headroom for the largest VMA that
//! the kernel accounts against the commit limit.

use crate::Error;
use crate::Record;
use crate::Result;
use crate::VmFlags;

/// Whether the kernel charges `vma` against the commit limit.
///
/// Only a record with neither `Size` nor `VmFlags` is skipped outright; any
/// other record must carry a `VmFlags` flag set.
fn is_accounted(vma: &Record) -> Result<bool> {
    if !vma.contains_key("Size") && !vma.contains_key("VmFlags") {
        return Ok(false);
    }
    let flags = vma
        .vm_flags()
        .ok_or(Error::MissingField { field: "VmFlags" })?;
    Ok(flags.vm_flags().contains(VmFlags::AC))
}

/// Largest `Size` among VMAs flagged `ac`, in kB, or `0` when none are.
pub fn max_accounted_vma_size(vmas: &[Record]) -> Result<u64> {
    let mut max = 0;
    for vma in vmas {
        if !is_accounted(vma)? {
            continue;
        }
        let size = vma.size().ok_or(Error::MissingField { field: "Size" })?;
        max = max.max(size);
    }
    tracing::debug!(max_vma = max, "computed largest accounted VMA");
    Ok(max)
}

/// Whether a fork is at risk: both sides in kB, equality is safe.
pub fn at_risk(max_vma: u64, mem_free: u64) -> bool {
    max_vma > mem_free
}
