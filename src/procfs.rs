//! Linux procfs utilities for inspecting a stopped target.
//!
//! Provides `/proc/[pid]/maps` parsing (the memory-region service the
//! allocator engine consumes), executable/library lookup, and the thread
//! count used to decide whether a thread-local arena may exist.

use nix::unistd::Pid;
use std::path::PathBuf;

use crate::error::Result;
use crate::types::VirtAddr;

/// A single memory region from `/proc/[pid]/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: VirtAddr,
    pub end: VirtAddr,
    pub perms: Permissions,
    pub offset: u64,
    pub pathname: String,
}

impl MemoryRegion {
    /// Anonymous region with no backing file, mostly for synthetic images.
    pub fn anonymous(start: u64, end: u64, pathname: &str) -> Self {
        Self {
            start: VirtAddr(start),
            end: VirtAddr(end),
            perms: Permissions {
                read: true,
                write: true,
                execute: false,
                private: true,
            },
            offset: 0,
            pathname: pathname.to_string(),
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start.addr() && addr < self.end.addr()
    }

    pub fn size(&self) -> u64 {
        self.end.addr() - self.start.addr()
    }

    /// Label as shown by vmmap-style listings (`[heap]`, library path, ...).
    pub fn label(&self) -> &str {
        &self.pathname
    }

    pub fn is_heap(&self) -> bool {
        self.pathname.ends_with("heap]")
    }
}

/// Memory region permissions (rwxp/s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub private: bool,
}

impl std::fmt::Display for Permissions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' },
            if self.private { 'p' } else { 's' },
        )
    }
}

/// Parse `/proc/[pid]/maps` into a list of memory regions.
pub fn read_memory_maps(pid: Pid) -> Result<Vec<MemoryRegion>> {
    let content = std::fs::read_to_string(format!("/proc/{}/maps", pid))?;
    Ok(parse_maps(&content))
}

/// Parse the contents of a maps file.
///
/// Separated from `read_memory_maps` for testability.
pub fn parse_maps(content: &str) -> Vec<MemoryRegion> {
    content.lines().filter_map(parse_map_line).collect()
}

fn parse_map_line(line: &str) -> Option<MemoryRegion> {
    // Format: 7f8a1000-7f8a2000 r-xp 00000000 08:01 12345  /lib/libc.so.6
    let mut parts = line.splitn(6, char::is_whitespace);

    let addr_range = parts.next()?;
    let perms_str = parts.next()?;
    let offset_str = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let pathname = parts.next().unwrap_or("").trim().to_string();

    let (start_str, end_str) = addr_range.split_once('-')?;
    let perms = perms_str.as_bytes();
    if perms.len() < 4 {
        return None;
    }

    Some(MemoryRegion {
        start: VirtAddr(u64::from_str_radix(start_str, 16).ok()?),
        end: VirtAddr(u64::from_str_radix(end_str, 16).ok()?),
        perms: Permissions {
            read: perms[0] == b'r',
            write: perms[1] == b'w',
            execute: perms[2] == b'x',
            private: perms[3] == b'p',
        },
        offset: u64::from_str_radix(offset_str, 16).ok()?,
        pathname,
    })
}

/// Get the executable path for a process via `/proc/[pid]/exe`.
pub fn get_exe_path(pid: Pid) -> Result<PathBuf> {
    let path = std::fs::read_link(format!("/proc/{}/exe", pid))?;
    Ok(path)
}

/// Number of threads of a process, from the entries of `/proc/[pid]/task`.
pub fn thread_count(pid: Pid) -> Result<usize> {
    Ok(std::fs::read_dir(format!("/proc/{}/task", pid))?.count())
}

/// Find the load base of a mapped object: the mapping of `path_suffix`
/// at file offset 0.
///
/// ELF symbol values are relative to this base for shared objects and
/// PIE executables.
pub fn find_load_address(maps: &[MemoryRegion], path_suffix: &str) -> Option<VirtAddr> {
    maps.iter()
        .find(|r| r.offset == 0 && r.pathname.ends_with(path_suffix))
        .map(|r| r.start)
}

/// Path of the first mapped file whose name looks like `stem` (e.g. `libc`
/// matches `libc.so.6` and `libc-2.31.so`).
pub fn find_library<'a>(maps: &'a [MemoryRegion], stem: &str) -> Option<&'a str> {
    maps.iter()
        .map(|r| r.pathname.as_str())
        .find(|p| {
            p.rsplit('/').next().is_some_and(|name| {
                name.strip_prefix(stem)
                    .is_some_and(|rest| rest.starts_with(".so") || rest.starts_with('-'))
            })
        })
}

/// Find which memory region contains a given address.
pub fn find_region_containing(maps: &[MemoryRegion], addr: VirtAddr) -> Option<&MemoryRegion> {
    maps.iter().find(|r| r.contains(addr.addr()))
}
