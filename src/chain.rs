//! Bounded traversal of free lists.
//!
//! Free-list links live in target memory and may be corrupted or actively
//! malicious, so every walk is capped by a hop limit and by repeat
//! detection, and a failed read simply ends the chain.

use log::trace;

use crate::inferior::Inferior;
use crate::layout::ArchLayout;

/// Default number of hops for a chain walk.
pub const DEFAULT_CHAIN_LIMIT: usize = 8;

/// `REVEAL_PTR`: decode a safe-linked pointer stored at `slot`.
pub fn reveal_ptr(stored: u64, slot: u64) -> u64 {
    stored ^ (slot >> 12)
}

/// `PROTECT_PTR`: encode `ptr` for storage at `slot`. Self-inverse with
/// [`reveal_ptr`].
pub fn protect_ptr(ptr: u64, slot: u64) -> u64 {
    ptr ^ (slot >> 12)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkOptions {
    /// Offset of the link field inside each node.
    pub offset: u64,
    /// Maximum number of hops.
    pub limit: usize,
    /// Stop when this address is reached, appending `hard_end`.
    pub hard_stop: Option<u64>,
    pub hard_end: u64,
    pub include_start: bool,
    /// Links are mangled with `PROTECT_PTR`.
    pub safe_linking: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: DEFAULT_CHAIN_LIMIT,
            hard_stop: None,
            hard_end: 0,
            include_start: true,
            safe_linking: false,
        }
    }
}

/// Follow the link at `offset` from `start`, collecting visited addresses.
///
/// The walk ends at a null link, an unreadable link, the hard stop, the
/// second visit of any address, or after `limit` hops. A chain that ends
/// on a null link carries that `0` as its last element.
pub fn walk(inferior: &dyn Inferior, arch: &ArchLayout, start: u64, opts: &WalkOptions) -> Vec<u64> {
    let mut result = Vec::new();
    if opts.include_start {
        result.push(start);
    }

    let mut addr = start;
    for _ in 0..opts.limit {
        if result.iter().filter(|&&a| a == addr).count() >= 2 {
            break;
        }
        if opts.hard_stop == Some(addr) {
            result.push(opts.hard_end);
            break;
        }
        if addr == 0 {
            break;
        }

        let slot = addr.wrapping_add(opts.offset) & arch.ptr_mask();
        let stored = match inferior.read_ptr(slot) {
            Ok(v) => v,
            Err(e) => {
                trace!("chain walk stopped at {:#x}: {}", slot, e);
                break;
            }
        };
        let next = if opts.safe_linking {
            reveal_ptr(stored, slot)
        } else {
            stored
        };
        addr = next & arch.ptr_mask();
        trace!("chain hop {:#x} -> {:#x}", slot, addr);
        result.push(addr);
    }

    result
}

/// Chain entries without the trailing terminator.
pub fn nodes(chain: &[u64]) -> &[u64] {
    match chain.last() {
        Some(0) => &chain[..chain.len() - 1],
        _ => chain,
    }
}

/// A doubly linked bin walked from both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinChain {
    pub fd: Vec<u64>,
    pub bk: Vec<u64>,
    /// The `fd` and `bk` walks disagree.
    pub corrupted: bool,
}

impl BinChain {
    /// Empty bins are reported as a single `0` placeholder.
    pub fn is_empty(&self) -> bool {
        matches!(self.fd.first(), None | Some(0))
    }
}

/// Compare the forward and backward walks of one bin.
///
/// Both walks start at the bin head and stop at the bin's own sentinel
/// (appending `0`). A well-formed list satisfies
/// `fd[..n-1] == reverse(bk[..m-2]) ++ [bk[m-2]]`.
pub fn check_double_linked(fd: Vec<u64>, bk: Vec<u64>) -> BinChain {
    if fd.len() == 2 && bk.len() == 2 && fd[0] == bk[0] {
        return BinChain {
            fd: vec![0],
            bk: vec![0],
            corrupted: false,
        };
    }

    let corrupted = if fd.is_empty() || bk.len() < 2 {
        true
    } else {
        let mut expected: Vec<u64> = bk[..bk.len() - 2].iter().rev().copied().collect();
        expected.push(bk[bk.len() - 2]);
        fd[..fd.len() - 1] != expected[..]
    };

    BinChain { fd, bk, corrupted }
}
