use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Virtual address in the inspected process (post-ASLR).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub fn addr(self) -> u64 {
        self.0
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl std::ops::Add<u64> for VirtAddr {
    type Output = VirtAddr;
    fn add(self, rhs: u64) -> Self::Output {
        VirtAddr(self.0 + rhs)
    }
}

impl std::ops::Sub<u64> for VirtAddr {
    type Output = VirtAddr;
    fn sub(self, rhs: u64) -> Self::Output {
        VirtAddr(self.0 - rhs)
    }
}

/// Instruction-set family of the inspected process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    I386,
    Aarch64,
    /// 32-bit ARM (Thumb-2 glibc builds).
    Arm,
}

impl Arch {
    /// Pointer width in bytes.
    pub fn ptr_size(self) -> u64 {
        match self {
            Arch::X86_64 | Arch::Aarch64 => 8,
            Arch::I386 | Arch::Arm => 4,
        }
    }

    /// x86 targets keep thread-local variables *below* the TLS base,
    /// ARM targets above it.
    pub fn is_x86_family(self) -> bool {
        matches!(self, Arch::X86_64 | Arch::I386)
    }

    pub fn name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86-64",
            Arch::I386 => "i386",
            Arch::Aarch64 => "aarch64",
            Arch::Arm => "arm",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A glibc release number such as `2.35`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlibcVersion {
    pub major: u16,
    pub minor: u16,
}

impl GlibcVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Per-thread caches appeared in 2.26.
    pub fn has_tcache(self) -> bool {
        self >= Self::new(2, 26)
    }

    /// `PROTECT_PTR`/`REVEAL_PTR` pointer mangling appeared in 2.32.
    pub fn has_safe_linking(self) -> bool {
        self >= Self::new(2, 32)
    }

    /// `__malloc_hook` was removed in 2.34.
    pub fn has_malloc_hook(self) -> bool {
        self < Self::new(2, 34)
    }
}

impl fmt::Display for GlibcVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for GlibcVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::Other(format!("invalid glibc version: '{}'", s));
        let mut parts = s.trim().split('.');
        let major = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let minor = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        Ok(Self { major, minor })
    }
}

/// Format an optional version the way error messages want it.
pub fn version_or_unknown(version: Option<GlibcVersion>) -> String {
    version.map_or_else(|| "unknown".to_string(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_addr_display() {
        let addr = VirtAddr(0x400000);
        assert_eq!(format!("{}", addr), "0x400000");
    }

    #[test]
    fn virt_addr_arithmetic() {
        let addr = VirtAddr(0x1000);
        assert_eq!((addr + 0x10).addr(), 0x1010);
        assert_eq!((addr - 0x10).addr(), 0x0FF0);
    }

    #[test]
    fn arch_pointer_sizes() {
        assert_eq!(Arch::X86_64.ptr_size(), 8);
        assert_eq!(Arch::Aarch64.ptr_size(), 8);
        assert_eq!(Arch::I386.ptr_size(), 4);
        assert_eq!(Arch::Arm.ptr_size(), 4);
        assert!(Arch::I386.is_x86_family());
        assert!(!Arch::Arm.is_x86_family());
    }

    #[test]
    fn glibc_version_parse_and_order() {
        let v: GlibcVersion = "2.35".parse().unwrap();
        assert_eq!(v, GlibcVersion::new(2, 35));
        assert_eq!(v.to_string(), "2.35");
        assert!(GlibcVersion::new(2, 9) < GlibcVersion::new(2, 26));
        assert!("2".parse::<GlibcVersion>().is_err());
        assert!("two.35".parse::<GlibcVersion>().is_err());
    }

    #[test]
    fn glibc_feature_gates() {
        assert!(!GlibcVersion::new(2, 25).has_tcache());
        assert!(GlibcVersion::new(2, 26).has_tcache());
        assert!(!GlibcVersion::new(2, 31).has_safe_linking());
        assert!(GlibcVersion::new(2, 32).has_safe_linking());
        assert!(GlibcVersion::new(2, 33).has_malloc_hook());
        assert!(!GlibcVersion::new(2, 34).has_malloc_hook());
    }

    #[test]
    fn unknown_version_text() {
        assert_eq!(version_or_unknown(None), "unknown");
        assert_eq!(version_or_unknown(Some(GlibcVersion::new(2, 31))), "2.31");
    }
}
