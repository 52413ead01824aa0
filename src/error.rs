use thiserror::Error;

use crate::types::Arch;

#[derive(Error, Debug)]
pub enum Error {
    /// A specific address could not be read from the target.
    #[error("cannot access memory at 0x{addr:x} ({len} bytes)")]
    MemoryUnreadable { addr: u64, len: usize },

    /// A symbol or debug type is absent.
    #[error("not found: {0}")]
    LookupNotFound(String),

    /// Every locator strategy failed for `quantity`.
    #[error(
        "{quantity} could not be found via heuristics for {arch} with glibc {glibc}; \
         set its address override manually, or report the issue with your libc.so.6 attached"
    )]
    HeuristicExhausted {
        quantity: &'static str,
        arch: Arch,
        glibc: String,
    },

    #[error("this glibc was not compiled with tcache support")]
    NoTcache,

    #[error("the heap is not initialized yet")]
    NotInitialized,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("ptrace error: {0}")]
    Ptrace(#[from] nix::errno::Errno),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
