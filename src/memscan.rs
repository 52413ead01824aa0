//! Memory scanning for known values.
//!
//! Used as a last-resort locator: when no code pattern reveals a global, its
//! address can be recovered by searching libc's data for a value the global
//! is known to hold.

use log::trace;

use crate::error::Result;
use crate::inferior::Inferior;
use crate::procfs::MemoryRegion;

/// Regions larger than this are never read in one piece.
const MAX_SCAN_SIZE: u64 = 256 * 1024 * 1024;

/// Scan a buffer for an exact byte sequence.
///
/// Returns offsets within the buffer where matches start.
pub fn scan_bytes(data: &[u8], needle: &[u8]) -> Vec<usize> {
    if needle.is_empty() || needle.len() > data.len() {
        return Vec::new();
    }
    data.windows(needle.len())
        .enumerate()
        .filter(|(_, w)| *w == needle)
        .map(|(i, _)| i)
        .collect()
}

/// Offsets of `value` stored as a little-endian `ptr_size` word at a
/// `ptr_size`-aligned offset.
pub fn scan_ptr(data: &[u8], value: u64, ptr_size: usize) -> Vec<usize> {
    let bytes = value.to_le_bytes();
    scan_bytes(data, &bytes[..ptr_size.min(8)])
        .into_iter()
        .filter(|off| off % ptr_size == 0)
        .collect()
}

/// Read `region` from the target and return the addresses of every aligned
/// pointer-sized word equal to `value`.
pub fn scan_region_for_ptr(
    inferior: &dyn Inferior,
    region: &MemoryRegion,
    value: u64,
) -> Result<Vec<u64>> {
    let size = region.size();
    if size == 0 || size > MAX_SCAN_SIZE {
        trace!("skipping scan of {} ({:#x} bytes)", region.label(), size);
        return Ok(Vec::new());
    }
    let start = region.start.addr();
    let data = inferior.read_bytes(start, size as usize)?;
    let ptr_size = inferior.arch().ptr_size() as usize;
    Ok(scan_ptr(&data, value, ptr_size)
        .into_iter()
        .map(|off| start + off as u64)
        .collect())
}
