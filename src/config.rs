//! User-tunable settings for heap inspection.

use crate::chain::DEFAULT_CHAIN_LIMIT;
use crate::error::{Error, Result};
use crate::types::GlibcVersion;

/// Upper bound on arenas visited while following the arena ring.
pub const DEFAULT_MAX_ARENAS: usize = 64;

/// Address overrides and traversal limits.
///
/// Address overrides win over both symbol lookup and heuristics; a value of
/// 0 means "not set".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    pub main_arena: u64,
    pub thread_arena: u64,
    pub tcache: u64,
    pub mp: u64,
    pub global_max_fast: u64,
    /// Use this glibc version instead of the detected one.
    pub glibc_version: Option<GlibcVersion>,
    /// Force safe-linking decoding on or off.
    pub safe_linking: Option<bool>,
    /// Hop ceiling for every free-list walk.
    pub chain_limit: usize,
    pub max_arenas: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            main_arena: 0,
            thread_arena: 0,
            tcache: 0,
            mp: 0,
            global_max_fast: 0,
            glibc_version: None,
            safe_linking: None,
            chain_limit: DEFAULT_CHAIN_LIMIT,
            max_arenas: DEFAULT_MAX_ARENAS,
        }
    }
}

impl HeapConfig {
    /// Override value for `name`, if one is set.
    pub fn override_for(&self, name: &str) -> Option<u64> {
        let v = match name {
            "main_arena" => self.main_arena,
            "thread_arena" => self.thread_arena,
            "tcache" => self.tcache,
            "mp_" => self.mp,
            "global_max_fast" => self.global_max_fast,
            _ => 0,
        };
        (v != 0).then_some(v)
    }

    /// Set an override from a `name=0xADDR` style argument.
    pub fn set_override(&mut self, spec: &str) -> Result<()> {
        let (name, value) = spec
            .split_once('=')
            .ok_or_else(|| Error::Other(format!("expected NAME=ADDR, got '{}'", spec)))?;
        let addr = parse_addr(value)?;
        match name.trim() {
            "main_arena" => self.main_arena = addr,
            "thread_arena" => self.thread_arena = addr,
            "tcache" => self.tcache = addr,
            "mp_" | "mp" => self.mp = addr,
            "global_max_fast" => self.global_max_fast = addr,
            other => return Err(Error::Other(format!("unknown override '{}'", other))),
        }
        Ok(())
    }
}

/// Parse `0x`-prefixed hex or decimal.
pub fn parse_addr(s: &str) -> Result<u64> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| Error::Other(format!("invalid address: '{}'", s)))
}
