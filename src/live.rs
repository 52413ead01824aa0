//! A Linux process as an [`Inferior`].
//!
//! Memory is read with `process_vm_readv` (falling back to
//! `/proc/[pid]/mem`), regions and threads come from procfs, symbols and
//! types from the libc mapped into the process. Attaching with ptrace
//! stops the process and gives access to the thread pointer.

use std::io::IoSliceMut;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::uio::{process_vm_readv, RemoteIoVec};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::disasm::{self, Instruction};
use crate::elf::{self, ElfFile};
use crate::error::{Error, Result};
use crate::inferior::Inferior;
use crate::layout::StructLayout;
use crate::procfs::{self, MemoryRegion};
use crate::typeinfo::TypeIndex;
use crate::types::{Arch, GlibcVersion, VirtAddr};

/// Longest x86 instruction.
const MAX_INSN_LEN: usize = 15;
/// Bytes decoded before the requested address for `include_preceding`.
const PRECEDING_BYTES: usize = 0x40;

pub struct LiveProcess {
    pid: Pid,
    arch: Arch,
    libc: Option<ElfFile>,
    types: Option<TypeIndex>,
    glibc: Option<GlibcVersion>,
    attached: bool,
}

impl LiveProcess {
    /// Attach with ptrace and wait for the process to stop.
    pub fn attach(pid: Pid) -> Result<Self> {
        ptrace::attach(pid)?;
        match waitpid(pid, None)? {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
            other => {
                let _ = ptrace::detach(pid, None);
                return Err(Error::Other(format!(
                    "unexpected status after attach: {:?}",
                    other
                )));
            }
        }
        let mut process = Self::open(pid)?;
        process.attached = true;
        Ok(process)
    }

    /// Inspect a process without stopping it. The thread pointer is only
    /// available once attached.
    pub fn open(pid: Pid) -> Result<Self> {
        let maps = procfs::read_memory_maps(pid)?;
        let arch = procfs::get_exe_path(pid)
            .ok()
            .and_then(|exe| ElfFile::load(&exe).ok())
            .and_then(|exe| exe.arch())
            .unwrap_or(Arch::X86_64);

        let libc_path = procfs::find_library(&maps, "libc").map(PathBuf::from);
        let libc = libc_path.as_deref().and_then(|path| load_libc(path, &maps));
        if libc_path.is_none() {
            warn!("no libc mapped in process {}", pid);
        }
        let types = match (&libc, &libc_path) {
            (Some(elf), Some(path)) => load_types(elf, path),
            _ => None,
        };
        let glibc = libc
            .as_ref()
            .and_then(ElfFile::glibc_version)
            .or_else(|| libc_path.as_deref().and_then(elf::glibc_version_from_path));
        debug!(
            "process {}: {} glibc {}, debug types {}",
            pid,
            arch,
            crate::types::version_or_unknown(glibc),
            if types.is_some() { "loaded" } else { "unavailable" }
        );

        Ok(LiveProcess {
            pid,
            arch,
            libc,
            types,
            glibc,
            attached: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Detach, letting the process continue.
    pub fn detach(mut self) -> Result<()> {
        self.attached = false;
        ptrace::detach(self.pid, None)?;
        Ok(())
    }

    fn read_proc_mem(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let unreadable = || Error::MemoryUnreadable { addr, len };
        let file = std::fs::File::open(format!("/proc/{}/mem", self.pid)).map_err(|_| unreadable())?;
        let mut buf = vec![0u8; len];
        file.read_exact_at(&mut buf, addr).map_err(|_| unreadable())?;
        Ok(buf)
    }
}

impl Drop for LiveProcess {
    fn drop(&mut self) {
        if self.attached {
            let _ = ptrace::detach(self.pid, None);
        }
    }
}

fn load_libc(path: &Path, maps: &[MemoryRegion]) -> Option<ElfFile> {
    let elf = match ElfFile::load(path) {
        Ok(elf) => elf,
        Err(e) => {
            warn!("cannot load {}: {}", path.display(), e);
            return None;
        }
    };
    let base = procfs::find_load_address(maps, path.to_str()?)?;
    Some(elf.with_load_base(base))
}

/// DWARF from the split debug file, else from libc itself.
fn load_types(libc: &ElfFile, path: &Path) -> Option<TypeIndex> {
    let candidates = libc.debug_file(path).into_iter().chain(Some(path.to_path_buf()));
    for candidate in candidates {
        match TypeIndex::load(&candidate) {
            Ok(index) => {
                debug!("libc types from {}", candidate.display());
                return Some(index);
            }
            Err(e) => debug!("no libc types in {}: {}", candidate.display(), e),
        }
    }
    None
}

impl Inferior for LiveProcess {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn glibc_version(&self) -> Option<GlibcVersion> {
        self.glibc
    }

    fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; len];
        let remote = [RemoteIoVec {
            base: addr as usize,
            len,
        }];
        match process_vm_readv(self.pid, &mut [IoSliceMut::new(&mut buf)], &remote) {
            Ok(n) if n == len => Ok(buf),
            _ => self.read_proc_mem(addr, len),
        }
    }

    fn resolve_symbol(&self, name: &str) -> Option<u64> {
        self.libc.as_ref()?.resolve(name)
    }

    fn symbol_at(&self, addr: u64) -> Option<String> {
        self.libc
            .as_ref()?
            .find_symbol_at(VirtAddr(addr))
            .map(|s| s.name.clone())
    }

    fn lookup_type(&self, name: &str) -> Option<StructLayout> {
        self.types.as_ref()?.struct_layout(name)
    }

    fn disassemble(&self, addr: u64, count: usize, include_preceding: bool) -> Result<Vec<Instruction>> {
        let bitness = match self.arch {
            Arch::X86_64 => 64,
            Arch::I386 => 32,
            other => return Err(Error::Unsupported(format!("disassembly for {}", other))),
        };
        let region = self
            .find_region(addr)
            .ok_or(Error::MemoryUnreadable { addr, len: 1 })?;
        let len = (count * MAX_INSN_LEN).min((region.end.addr() - addr) as usize);

        if include_preceding {
            let back = PRECEDING_BYTES.min((addr - region.start.addr()) as usize);
            let code = self.read_bytes(addr - back as u64, back + len)?;
            Ok(disasm::decode_x86_with_preceding(&code, addr, back, bitness, count))
        } else {
            let code = self.read_bytes(addr, len)?;
            Ok(disasm::decode_x86(&code, addr, bitness, count))
        }
    }

    fn memory_regions(&self) -> Result<Vec<MemoryRegion>> {
        procfs::read_memory_maps(self.pid)
    }

    #[cfg(target_arch = "x86_64")]
    fn thread_local_base(&self) -> Option<u64> {
        if !self.attached {
            return None;
        }
        let regs = ptrace::getregs(self.pid).ok()?;
        match self.arch {
            Arch::X86_64 => Some(regs.fs_base),
            // 32-bit tasks keep the TLS segment base in gs
            Arch::I386 => Some(regs.gs_base),
            _ => None,
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn thread_local_base(&self) -> Option<u64> {
        None
    }

    fn is_multithreaded(&self) -> bool {
        procfs::thread_count(self.pid).is_ok_and(|n| n > 1)
    }
}
