//! Empirical check: reserve, without touching, address space the size of a
//! fork's worth of accounted memory.
//!
//! Reservations are private anonymous `MAP_NORESERVE` mappings that are
//! unmapped as soon as they are created. Only Linux provides this primitive
//! here; elsewhere every attempt is reported as failed.

use std::io;

/// 100%, 110%, ..., 200% of the baseline.
pub const DEFAULT_MULTIPLIERS: [u32; 11] = [100, 110, 120, 130, 140, 150, 160, 170, 180, 190, 200];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// Percentage of the baseline that was attempted.
    pub multiplier: u32,
    pub reserved: bool,
}

/// `floor(baseline * multiplier / 100)` in kB, or `None` on overflow.
pub fn candidate_kb(baseline_kb: u64, multiplier: u32) -> Option<u64> {
    baseline_kb
        .checked_mul(u64::from(multiplier))
        .map(|scaled| scaled / 100)
}

fn candidate_bytes(baseline_kb: u64, multiplier: u32) -> Option<usize> {
    candidate_kb(baseline_kb, multiplier)?
        .checked_mul(1024)
        .and_then(|bytes| usize::try_from(bytes).ok())
}

/// Attempts one reservation per multiplier, in order, releasing each before
/// the next. A rejected reservation is an outcome, not an error.
pub fn probe_allocations(baseline_kb: u64, multipliers: &[u32]) -> Vec<ProbeOutcome> {
    multipliers
        .iter()
        .map(|&multiplier| {
            let reserved = match candidate_bytes(baseline_kb, multiplier) {
                Some(len) => match Reservation::new(len) {
                    Ok(_reservation) => true,
                    Err(error) => {
                        tracing::warn!(multiplier, len, %error, "reservation rejected");
                        false
                    }
                },
                None => {
                    tracing::warn!(multiplier, baseline_kb, "reservation size overflows");
                    false
                }
            };
            tracing::debug!(multiplier, reserved, "probed reservation");
            ProbeOutcome { multiplier, reserved }
        })
        .collect()
}

/// An address space reservation, unmapped on drop.
#[cfg(target_os = "linux")]
struct Reservation {
    addr: *mut libc::c_void,
    len: usize,
}

#[cfg(target_os = "linux")]
impl Reservation {
    fn new(len: usize) -> io::Result<Self> {
        // SAFETY: no fixed address is requested, so the kernel only hands out
        // a fresh range and no existing mapping is affected.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { addr, len })
    }
}

#[cfg(target_os = "linux")]
impl Drop for Reservation {
    fn drop(&mut self) {
        // SAFETY: `addr` and `len` describe exactly the mapping created in
        // `new`, which is never read, written, or unmapped elsewhere.
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}

#[cfg(not(target_os = "linux"))]
struct Reservation;

#[cfg(not(target_os = "linux"))]
impl Reservation {
    fn new(_len: usize) -> io::Result<Self> {
        Err(io::ErrorKind::Unsupported.into())
    }
}
