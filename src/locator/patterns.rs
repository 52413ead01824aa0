//! Instruction patterns that reveal allocator globals in stripped libcs.
//!
//! Each ISA gets one [`InsnPatterns`] strategy. A strategy only looks at a
//! slice of decoded instructions plus a [`MatchContext`] (the libc data
//! region that PC-relative and GOT-relative code refers to, and memory
//! access for literal pools); it never disassembles by itself.

use std::collections::{HashMap, HashSet};

use crate::disasm::{Instruction, MemOperand, Operand};
use crate::inferior::Inferior;
use crate::procfs::MemoryRegion;
use crate::types::Arch;

pub struct MatchContext<'a> {
    pub inferior: &'a dyn Inferior,
    /// Region containing `_IO_list_all`: libc's writable data.
    pub anchor: Option<MemoryRegion>,
}

impl<'a> MatchContext<'a> {
    pub fn new(inferior: &'a dyn Inferior, anchor: Option<MemoryRegion>) -> Self {
        Self { inferior, anchor }
    }

    fn anchor_start(&self) -> Option<u64> {
        self.anchor.as_ref().map(|r| r.start.addr())
    }

    fn anchor_end(&self) -> Option<u64> {
        self.anchor.as_ref().map(|r| r.end.addr())
    }

    fn read_i32(&self, addr: u64) -> Option<i64> {
        self.inferior.read_i32(addr).ok().map(i64::from)
    }

    fn read_i64(&self, addr: u64) -> Option<i64> {
        self.inferior.read_i64(addr).ok()
    }

    /// Value of a Thumb `ldr reg, [pc, #disp]` literal.
    fn pc_literal(&self, ldr: &Instruction) -> Option<i64> {
        let pc = (ldr.address + 4) & !3;
        self.read_i32(pc.wrapping_add_signed(ldr.disp()))
    }
}

/// One matcher per quantity the heuristic locator derives from code.
///
/// `thread_*_offset` results are offsets from the thread pointer; the rest
/// are absolute addresses.
pub trait InsnPatterns {
    /// `&main_arena` from `malloc_trim`.
    fn main_arena(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<u64>;

    /// TLS offset of `thread_arena` from `__libc_calloc`.
    fn thread_arena_offset(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<i64>;

    /// TLS offset of `tcache` from `__libc_malloc`.
    fn thread_cache_offset(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<i64>;

    /// `&mp_` from the threshold update in `__libc_free`.
    fn mp(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<u64>;

    /// `&global_max_fast` from the fast-path compare in `_int_malloc`.
    fn global_max_fast(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<u64>;

    fn call_mnemonic(&self) -> &'static str;

    /// Target of the first call after the prologue of `__libc_malloc`,
    /// which is `_int_malloc`.
    fn int_malloc_call(&self, insns: &[Instruction]) -> Option<u64> {
        insns
            .iter()
            .skip(5)
            .find(|i| i.is(self.call_mnemonic()))
            .and_then(|i| i.imm(0))
            .map(|t| t as u64)
    }
}

pub fn patterns_for(arch: Arch) -> &'static dyn InsnPatterns {
    match arch {
        Arch::X86_64 => &X86_64Patterns,
        Arch::I386 => &I386Patterns,
        Arch::Aarch64 => &Aarch64Patterns,
        Arch::Arm => &ArmPatterns,
    }
}

fn mem_at(insn: &Instruction, i: usize) -> Option<&MemOperand> {
    insn.operand(i).and_then(Operand::as_mem)
}

fn base_is(m: &MemOperand, reg: &str) -> bool {
    m.base.as_deref() == Some(reg)
}

fn rip_relative(m: &MemOperand) -> bool {
    base_is(m, "rip")
}

/// The second of the first two candidates: the stores to
/// `mp_.mmap_threshold` and `mp_` sit back to back. Advances only while the
/// end of the earlier store lies more than 0x10 bytes past the later one.
fn closest_pair<'a>(mut iter: impl Iterator<Item = &'a Instruction>) -> Option<&'a Instruction> {
    let mut first = iter.next()?;
    let mut second = iter.next()?;
    while first.next().saturating_sub(second.address) > 0x10 {
        first = second;
        second = iter.next()?;
    }
    Some(second)
}

pub struct X86_64Patterns;

impl InsnPatterns for X86_64Patterns {
    // lea reg, [rip + disp]
    fn main_arena(&self, insns: &[Instruction], _ctx: &MatchContext) -> Option<u64> {
        insns
            .iter()
            .find(|i| i.is("lea") && i.mem().is_some_and(|m| rip_relative(m) && m.disp > 0))
            .map(|i| i.next().wrapping_add_signed(i.disp()))
    }

    // mov rax, qword ptr [rip + disp]; mov reg, qword ptr fs:[rax]
    fn thread_arena_offset(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<i64> {
        let load = insns.windows(2).find_map(|w| {
            let got = w[0].reg(0) == Some("rax")
                && mem_at(&w[0], 1).is_some_and(|m| rip_relative(m) && m.size == 8 && m.disp > 0);
            let tls = w[1].operands.last().and_then(Operand::as_mem).is_some_and(|m| {
                m.segment.as_deref() == Some("fs")
                    && base_is(m, "rax")
                    && m.index.is_none()
                    && m.size == 8
            });
            (got && tls).then_some(&w[0])
        })?;
        ctx.read_i64(load.next().wrapping_add_signed(load.disp()))
    }

    // last `mov reg, qword ptr [rip + disp]` before the first fs-relative load
    fn thread_cache_offset(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<i64> {
        let mut found = None;
        for insn in insns {
            if mem_at(insn, 1).is_some_and(|m| rip_relative(m) && m.size == 8 && m.disp > 0) {
                found = Some(insn);
            }
            let fs_load = insn.operands.iter().skip(1).filter_map(Operand::as_mem).any(|m| {
                m.segment.as_deref() == Some("fs")
                    && m.base.as_deref().is_some_and(|b| b.starts_with('r'))
                    && m.size == 8
            });
            if fs_load {
                break;
            }
        }
        let load = found?;
        ctx.read_i64(load.next().wrapping_add_signed(load.disp()))
    }

    // mov qword ptr [rip + mmap_threshold], reg; mov qword ptr [rip + mp_], reg
    fn mp(&self, insns: &[Instruction], _ctx: &MatchContext) -> Option<u64> {
        let stores = insns.iter().filter(|i| {
            i.is("mov") && mem_at(i, 0).is_some_and(|m| rip_relative(m) && m.size == 8 && m.disp > 0)
        });
        closest_pair(stores).map(|i| i.next().wrapping_add_signed(i.disp()))
    }

    // cmp qword ptr [rip + disp], imm
    fn global_max_fast(&self, insns: &[Instruction], _ctx: &MatchContext) -> Option<u64> {
        insns
            .iter()
            .find(|i| i.is("cmp") && mem_at(i, 0).is_some_and(|m| rip_relative(m) && m.size == 8))
            .map(|i| i.next().wrapping_add_signed(i.disp()))
    }

    fn call_mnemonic(&self) -> &'static str {
        "call"
    }
}

/// i386 PIC code addresses libc data relative to a GOT register that holds
/// the start of the `_IO_list_all` region.
pub struct I386Patterns;

impl I386Patterns {
    fn mentions(insn: &Instruction, reg: &str) -> bool {
        insn.operands.iter().any(|op| match op {
            Operand::Reg(r) => r == reg,
            Operand::Mem(m) => base_is(m, reg) || m.index.as_deref() == Some(reg),
            Operand::Imm(_) => false,
        })
    }

    fn got_load(insn: &Instruction) -> bool {
        insn.is("mov")
            && mem_at(insn, 1).is_some_and(|m| {
                m.segment.is_none()
                    && m.size == 4
                    && m.base.as_deref().is_some_and(|b| b.starts_with('e'))
            })
    }
}

impl InsnPatterns for I386Patterns {
    // lea reg, [eax + disp]
    fn main_arena(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<u64> {
        let base = ctx.anchor_start()?;
        insns
            .iter()
            .find(|i| i.is("lea") && Self::mentions(i, "eax") && i.disp() > 0)
            .map(|i| base.wrapping_add_signed(i.disp()))
    }

    // mov eax, dword ptr [reg - disp]; then gs:[eax] or [reg + eax]
    fn thread_arena_offset(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<i64> {
        let base = ctx.anchor_start()?;
        let load = insns
            .windows(2)
            .filter(|w| {
                let got = Self::got_load(&w[0]) && w[0].reg(0) == Some("eax") && w[0].disp() < 0;
                let last = w[1].operands.last().and_then(Operand::as_mem);
                let seg = last.is_some_and(|m| {
                    m.segment.as_deref() == Some("gs") && base_is(m, "eax") && m.index.is_none()
                });
                let idx = last.is_some_and(|m| m.index.as_deref() == Some("eax"));
                got && w[1].is("mov") && (seg ^ idx)
            })
            .last()?;
        ctx.read_i32(base.wrapping_add_signed(load[0].disp()))
    }

    // Two code shapes: the last GOT load before the first gs:[reg] access, or
    // the first GOT load after `mov reg, gs:[0]`.
    fn thread_cache_offset(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<i64> {
        let mut found = None;
        let mut find_after = false;
        for insn in insns {
            if insn.disp() < 0 && Self::got_load(insn) {
                found = Some(insn);
                if find_after {
                    break;
                }
            }
            let gs_reg = insn.operands.iter().skip(1).filter_map(Operand::as_mem).any(|m| {
                m.segment.as_deref() == Some("gs")
                    && m.base.as_deref().is_some_and(|b| b.starts_with('e'))
                    && m.size == 4
            });
            let gs_zero = insn.operands.last().and_then(Operand::as_mem).is_some_and(|m| {
                m.segment.as_deref() == Some("gs")
                    && m.base.is_none()
                    && m.index.is_none()
                    && m.disp == 0
            });
            if gs_reg {
                break;
            } else if gs_zero && insn.is("mov") {
                find_after = true;
            }
        }
        let base = ctx.anchor_start()?;
        ctx.read_i32(base.wrapping_add_signed(found?.disp()))
    }

    // mov dword ptr [reg + mmap_threshold], r; mov dword ptr [reg + mp_], r
    fn mp(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<u64> {
        let base = ctx.anchor_start()?;
        let stores = insns.iter().filter(|i| {
            i.is("mov") && mem_at(i, 0).is_some_and(|m| m.size == 4 && m.disp > 0)
        });
        closest_pair(stores).map(|i| base.wrapping_add_signed(i.disp()))
    }

    // cmp reg, dword ptr [reg + disp]
    fn global_max_fast(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<u64> {
        let base = ctx.anchor_start()?;
        insns
            .iter()
            .find(|i| i.is("cmp") && i.mem().is_some_and(|m| m.size == 4))
            .map(|i| base.wrapping_add_signed(i.disp()))
    }

    fn call_mnemonic(&self) -> &'static str {
        "call"
    }
}

pub struct Aarch64Patterns;

impl Aarch64Patterns {
    /// `mrs reg, tpidr_el0` next to `adrp reg2, page; ldr reg2, [reg2, #off]`:
    /// the TLS offset is stored at `page + off`.
    fn tls_offset(insns: &[Instruction], ctx: &MatchContext) -> Option<i64> {
        let mrs = insns.iter().find(|i| i.is("mrs"))?;
        let mut min_distance = 0x1000u64;
        let mut nearest: Option<(usize, &Instruction)> = None;
        for (i, insn) in insns.iter().enumerate() {
            if insn.is("adrp") && mrs.address.abs_diff(insn.address) < min_distance {
                nearest = Some((i, insn));
                min_distance = mrs.address.abs_diff(insn.address);
            }
            if insn.address > mrs.address && insn.address - mrs.address > min_distance {
                break;
            }
        }
        let (idx, adrp) = nearest?;
        let page = adrp.imm(1)?;
        let ldr = insns[idx + 1..].iter().find(|i| i.is("ldr"))?;
        ctx.read_i64((page as u64).wrapping_add_signed(ldr.disp()))
    }
}

impl InsnPatterns for Aarch64Patterns {
    // adrp reg1, page; ...; add reg2, reg1, #off
    fn main_arena(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<u64> {
        let base = ctx.anchor_start()?;
        let mut reg: Option<&str> = None;
        for insn in insns.iter().skip(5) {
            if insn.is("add") && reg.is_some() && insn.reg(1) == reg {
                return insn.imm(2).map(|off| base.wrapping_add_signed(off));
            }
            if insn.is("adrp") && insn.imm(1) == Some(base as i64) {
                reg = insn.reg(0);
            }
        }
        None
    }

    fn thread_arena_offset(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<i64> {
        Self::tls_offset(insns, ctx)
    }

    // tcache is the second word of the TLS block found the same way
    fn thread_cache_offset(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<i64> {
        Self::tls_offset(insns, ctx).map(|off| off + 8)
    }

    // str reg2, [reg1, #off] with reg1 from `adrp reg1, page`
    fn mp(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<u64> {
        let base = ctx.anchor_start()?;
        let mut regs: HashSet<&str> = HashSet::new();
        for insn in insns {
            if insn.is("str") {
                if let Some(m) = insn.mem() {
                    if m.base.as_deref().is_some_and(|b| regs.contains(b)) {
                        return Some(base.wrapping_add_signed(m.disp));
                    }
                }
            } else if insn.is("adrp") && insn.imm(1) == Some(base as i64) {
                if let Some(r) = insn.reg(0) {
                    regs.insert(r);
                }
            }
        }
        None
    }

    // adrp reg, page; then `add reg2, reg, #off` (value at +8) or
    // `ldr reg2, [reg, #off]`
    fn global_max_fast(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<u64> {
        let base = ctx.anchor_end()?;
        let mut reg: Option<&str> = None;
        for insn in insns {
            if let Some(r) = reg {
                if insn.is("add") && insn.reg(1) == Some(r) {
                    if let Some(off) = insn.imm(2) {
                        return Some(base.wrapping_add_signed(off) + 8);
                    }
                } else if insn.is("ldr") && insn.mem().is_some_and(|m| base_is(m, r)) {
                    return Some(base.wrapping_add_signed(insn.disp()));
                }
            } else if insn.is("adrp") && insn.imm(1) == Some(base as i64) {
                reg = insn.reg(0);
            }
        }
        None
    }

    fn call_mnemonic(&self) -> &'static str {
        "bl"
    }
}

/// Thumb-2 code loads addresses from PC-relative literal pools and adds
/// `pc` (current instruction + 4) to them.
pub struct ArmPatterns;

impl ArmPatterns {
    fn is_add_pc(insn: &Instruction, reg: &str) -> bool {
        insn.is("add") && insn.reg(0) == Some(reg) && insn.reg(1) == Some("pc") && insn.operands.len() == 2
    }

    fn is_pc_load(insn: &Instruction) -> bool {
        insn.mnemonic.starts_with("ldr") && insn.mem().is_some_and(|m| base_is(m, "pc"))
    }

    /// `ldr reg, [pc, #lit]` before `mrc` (thread pointer), then
    /// `add reg, pc`: the TLS offset is stored at `add + 4 + *lit`.
    fn tls_offset(insns: &[Instruction], ctx: &MatchContext) -> Option<i64> {
        let mut found_mrc = false;
        let mut ldr: Option<&Instruction> = None;
        for insn in insns {
            if !found_mrc {
                if insn.is("mrc") {
                    found_mrc = true;
                } else if insn.is("ldr") {
                    ldr = Some(insn);
                }
                continue;
            }
            let load = ldr?;
            let reg = load.reg(0)?;
            if Self::is_add_pc(insn, reg) {
                let lit = ctx.pc_literal(load)?;
                return ctx.read_i32((insn.address + 4).wrapping_add_signed(lit));
            }
        }
        None
    }
}

impl InsnPatterns for ArmPatterns {
    // ldr.w reg, [pc, #lit]; add reg, pc
    fn main_arena(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<u64> {
        let mut ldrw: Option<&Instruction> = None;
        for insn in insns {
            match ldrw {
                None => {
                    if insn.is("ldr.w") {
                        ldrw = Some(insn);
                    }
                }
                Some(load) => {
                    if Self::is_add_pc(insn, load.reg(0)?) {
                        let lit = ctx.pc_literal(load)?;
                        return Some((insn.address + 4).wrapping_add_signed(lit));
                    }
                }
            }
        }
        None
    }

    fn thread_arena_offset(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<i64> {
        Self::tls_offset(insns, ctx)
    }

    fn thread_cache_offset(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<i64> {
        Self::tls_offset(insns, ctx).map(|off| off + 4)
    }

    // ldr reg, [pc, #lit]; add reg, pc; str r, [reg]
    fn mp(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<u64> {
        let mut loads: HashMap<&str, &Instruction> = HashMap::new();
        let mut adds: HashMap<&str, &Instruction> = HashMap::new();
        for insn in insns {
            if insn.is("str") {
                let Some(m) = insn.mem() else { continue };
                if m.disp != 0 || m.index.is_some() {
                    continue;
                }
                let Some(reg) = m.base.as_deref() else { continue };
                if let (Some(load), Some(add)) = (loads.get(reg), adds.get(reg)) {
                    let lit = ctx.pc_literal(load)?;
                    return Some((add.address + 4).wrapping_add_signed(lit));
                }
            } else if insn.is("add") {
                if let Some(reg) = insn.reg(0) {
                    if loads.contains_key(reg) && Self::is_add_pc(insn, reg) {
                        adds.insert(reg, insn);
                    }
                }
            } else if insn.is("ldr") && Self::is_pc_load(insn) {
                if let Some(reg) = insn.reg(0) {
                    loads.insert(reg, insn);
                }
            }
        }
        None
    }

    // ldr r3, [pc, #lit]; add r3, pc; ldr r3, [r3, #4]; cmp r3, #imm
    fn global_max_fast(&self, insns: &[Instruction], ctx: &MatchContext) -> Option<u64> {
        let mut ldr: Option<&Instruction> = None;
        for insn in insns {
            if let Some(load) = ldr {
                if load.reg(0).is_some_and(|r| Self::is_add_pc(insn, r)) {
                    let lit = ctx.pc_literal(load)?;
                    return Some((insn.address + 8).wrapping_add_signed(lit));
                }
            }
            if Self::is_pc_load(insn) {
                ldr = Some(insn);
            }
        }
        None
    }

    fn call_mnemonic(&self) -> &'static str {
        "bl"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockInferior;

    fn insn(addr: u64, len: u64, mnemonic: &str, ops: Vec<Operand>) -> Instruction {
        Instruction::new(addr, len, mnemonic, ops)
    }

    fn reg(r: &str) -> Operand {
        Operand::reg(r)
    }

    fn imm(v: i64) -> Operand {
        Operand::Imm(v)
    }

    fn seg_mem(seg: &str, base: Option<&str>, index: Option<&str>, disp: i64, size: u64) -> Operand {
        Operand::Mem(MemOperand {
            segment: Some(seg.to_string()),
            base: base.map(str::to_string),
            index: index.map(str::to_string),
            disp,
            size,
        })
    }

    fn nop(addr: u64) -> Instruction {
        insn(addr, 1, "nop", vec![])
    }

    const DATA: u64 = 0x7000_0000;

    fn ctx_inferior(arch: Arch) -> MockInferior {
        let mut m = MockInferior::new(arch, None);
        m.add_region(DATA, DATA + 0x4000, "libc.so.6");
        m
    }

    fn anchor(m: &MockInferior) -> MatchContext<'_> {
        MatchContext::new(m, m.find_region(DATA))
    }

    #[test]
    fn table_has_a_strategy_per_arch() {
        assert_eq!(patterns_for(Arch::X86_64).call_mnemonic(), "call");
        assert_eq!(patterns_for(Arch::I386).call_mnemonic(), "call");
        assert_eq!(patterns_for(Arch::Aarch64).call_mnemonic(), "bl");
        assert_eq!(patterns_for(Arch::Arm).call_mnemonic(), "bl");
    }

    #[test]
    fn x86_64_main_arena_from_lea() {
        let m = ctx_inferior(Arch::X86_64);
        let insns = vec![
            insn(0x1000, 4, "push", vec![reg("r12")]),
            insn(0x1004, 7, "lea", vec![reg("rax"), Operand::mem("rip", 0x2000, 0)]),
        ];
        assert_eq!(X86_64Patterns.main_arena(&insns, &anchor(&m)), Some(0x300b));
    }

    #[test]
    fn x86_64_thread_arena_offset() {
        let mut m = ctx_inferior(Arch::X86_64);
        // GOT slot holding the TLS offset
        m.write_ptr(0x2007 + 0x100, (-0x48i64) as u64);
        let insns = vec![
            nop(0x2000),
            insn(0x2000, 7, "mov", vec![reg("rax"), Operand::mem("rip", 0x100, 8)]),
            insn(0x2007, 4, "mov", vec![reg("rbx"), seg_mem("fs", Some("rax"), None, 0, 8)]),
        ];
        assert_eq!(X86_64Patterns.thread_arena_offset(&insns, &anchor(&m)), Some(-0x48));
    }

    #[test]
    fn x86_64_thread_cache_offset_takes_last_got_load() {
        let mut m = ctx_inferior(Arch::X86_64);
        m.write_ptr(0x3010 + 0x200, (-0x40i64) as u64);
        let insns = vec![
            insn(0x3000, 7, "mov", vec![reg("rdx"), Operand::mem("rip", 0x50, 8)]),
            insn(0x3009, 7, "mov", vec![reg("rax"), Operand::mem("rip", 0x200, 8)]),
            insn(0x3010, 4, "mov", vec![reg("rax"), seg_mem("fs", Some("rax"), None, 0, 8)]),
            insn(0x3014, 7, "mov", vec![reg("rcx"), Operand::mem("rip", 0x900, 8)]),
        ];
        // the second load ends at 0x3010
        assert_eq!(X86_64Patterns.thread_cache_offset(&insns, &anchor(&m)), Some(-0x40));
    }

    #[test]
    fn x86_64_mp_takes_second_store() {
        let m = ctx_inferior(Arch::X86_64);
        let store = |addr, disp| insn(addr, 7, "mov", vec![Operand::mem("rip", disp, 8), reg("rax")]);
        let insns = vec![
            store(0x1000, 0x500),
            store(0x1100, 0x600),
            store(0x1107, 0x700),
        ];
        assert_eq!(X86_64Patterns.mp(&insns, &anchor(&m)), Some(0x1107 + 0x600));
        assert_eq!(X86_64Patterns.mp(&insns[..1], &anchor(&m)), None);
    }

    #[test]
    fn x86_64_mp_skips_stores_listed_backwards() {
        let m = ctx_inferior(Arch::X86_64);
        let store = |addr, disp| insn(addr, 7, "mov", vec![Operand::mem("rip", disp, 8), reg("rax")]);
        let insns = vec![
            // a later block decoded ahead of the threshold update
            store(0x1200, 0x500),
            store(0x1000, 0x600),
            store(0x1007, 0x700),
        ];
        assert_eq!(X86_64Patterns.mp(&insns, &anchor(&m)), Some(0x100e + 0x700));
    }

    #[test]
    fn x86_64_int_malloc_and_global_max_fast() {
        let m = ctx_inferior(Arch::X86_64);
        let mut malloc: Vec<Instruction> = (0..5).map(|i| nop(0x1000 + i)).collect();
        malloc.push(insn(0x1005, 5, "call", vec![imm(0x4000)]));
        assert_eq!(X86_64Patterns.int_malloc_call(&malloc), Some(0x4000));
        // a call inside the first five instructions is ignored
        assert_eq!(X86_64Patterns.int_malloc_call(&malloc[..5]), None);

        let int_malloc = vec![
            insn(0x4000, 4, "push", vec![reg("r15")]),
            insn(0x4004, 8, "cmp", vec![Operand::mem("rip", 0x1234, 8), imm(0x1f)]),
        ];
        assert_eq!(
            X86_64Patterns.global_max_fast(&int_malloc, &anchor(&m)),
            Some(0x400c + 0x1234)
        );
    }

    #[test]
    fn i386_patterns_use_anchor_base() {
        let mut m = ctx_inferior(Arch::I386);
        let lea = vec![insn(0x1000, 6, "lea", vec![reg("edi"), Operand::mem("eax", 0x380, 0)])];
        assert_eq!(I386Patterns.main_arena(&lea, &anchor(&m)), Some(DATA + 0x380));

        let cmp = vec![insn(0x1000, 6, "cmp", vec![reg("edx"), Operand::mem("ebx", 0x3a0, 4)])];
        assert_eq!(I386Patterns.global_max_fast(&cmp, &anchor(&m)), Some(DATA + 0x3a0));

        m.write_u32(DATA + 0x10, (-0x18i32) as u32);
        let tls = vec![
            insn(0x2000, 6, "mov", vec![reg("eax"), Operand::mem("ebx", 0x10 - 0x100, 4)]),
            insn(0x2006, 6, "mov", vec![reg("eax"), Operand::mem("ebx", -0x100, 4)]),
            insn(0x200c, 3, "mov", vec![reg("edx"), seg_mem("gs", Some("eax"), None, 0, 4)]),
        ];
        // DATA - 0x100 is unreadable; only the second load pairs with gs:[eax]
        assert_eq!(I386Patterns.thread_arena_offset(&tls, &anchor(&m)), None);
        let tls = vec![
            insn(0x2006, 6, "mov", vec![reg("eax"), Operand::mem("ebx", 0x10 - 0x100, 4)]),
            insn(0x200c, 3, "mov", vec![reg("edx"), seg_mem("gs", Some("eax"), None, 0, 4)]),
        ];
        let shifted = MatchContext::new(
            &m,
            Some(MemoryRegion::anonymous(DATA + 0x100, DATA + 0x4000, "libc.so.6")),
        );
        assert_eq!(I386Patterns.thread_arena_offset(&tls, &shifted), Some(-0x18));
    }

    #[test]
    fn i386_thread_cache_after_gs_zero() {
        let mut m = ctx_inferior(Arch::I386);
        m.write_u32(DATA + 0x40, (-0x1ci32) as u32);
        let base = MemoryRegion::anonymous(DATA + 0x80, DATA + 0x4000, "libc.so.6");
        let insns = vec![
            insn(0x1000, 6, "mov", vec![reg("ecx"), Operand::mem("ebx", -0x80 + 0x20, 4)]),
            insn(0x1006, 6, "mov", vec![reg("esi"), seg_mem("gs", None, None, 0, 4)]),
            insn(0x100c, 6, "mov", vec![reg("eax"), Operand::mem("ebx", -0x40, 4)]),
            insn(0x1012, 6, "mov", vec![reg("eax"), Operand::mem("ebx", -0x8, 4)]),
        ];
        let ctx = MatchContext::new(&m, Some(base));
        assert_eq!(I386Patterns.thread_cache_offset(&insns, &ctx), Some(-0x1c));
    }

    #[test]
    fn aarch64_main_arena_and_mp() {
        let m = ctx_inferior(Arch::Aarch64);
        let mut insns: Vec<Instruction> = (0..5).map(|i| nop(0x1000 + i * 4)).collect();
        insns.push(insn(0x1014, 4, "adrp", vec![reg("x1"), imm(DATA as i64)]));
        insns.push(insn(0x1018, 4, "add", vec![reg("x0"), reg("x1"), imm(0xa98)]));
        assert_eq!(Aarch64Patterns.main_arena(&insns, &anchor(&m)), Some(DATA + 0xa98));

        let free = vec![
            insn(0x2000, 4, "str", vec![reg("x3"), Operand::mem("x9", 0x10, 8)]),
            insn(0x2004, 4, "adrp", vec![reg("x2"), imm(DATA as i64)]),
            insn(0x2008, 4, "str", vec![reg("x3"), Operand::mem("x2", 0x2b0, 8)]),
        ];
        assert_eq!(Aarch64Patterns.mp(&free, &anchor(&m)), Some(DATA + 0x2b0));
    }

    #[test]
    fn aarch64_tls_offsets() {
        let mut m = ctx_inferior(Arch::Aarch64);
        m.write_ptr(DATA + 0x1f0, 0x10);
        let insns = vec![
            insn(0x1000, 4, "adrp", vec![reg("x3"), imm(0x5000)]),
            insn(0x1004, 4, "adrp", vec![reg("x1"), imm(DATA as i64)]),
            insn(0x1008, 4, "mrs", vec![reg("x2"), reg("tpidr_el0")]),
            insn(0x100c, 4, "ldr", vec![reg("x1"), Operand::mem("x1", 0x1f0, 8)]),
        ];
        assert_eq!(Aarch64Patterns.thread_arena_offset(&insns, &anchor(&m)), Some(0x10));
        assert_eq!(Aarch64Patterns.thread_cache_offset(&insns, &anchor(&m)), Some(0x18));
    }

    #[test]
    fn aarch64_global_max_fast_uses_region_end() {
        let m = ctx_inferior(Arch::Aarch64);
        let end = (DATA + 0x4000) as i64;
        let add_form = vec![
            insn(0x1000, 4, "adrp", vec![reg("x0"), imm(end)]),
            insn(0x1004, 4, "add", vec![reg("x1"), reg("x0"), imm(0x60)]),
        ];
        assert_eq!(
            Aarch64Patterns.global_max_fast(&add_form, &anchor(&m)),
            Some(DATA + 0x4000 + 0x68)
        );
        let ldr_form = vec![
            insn(0x1000, 4, "adrp", vec![reg("x0"), imm(end)]),
            insn(0x1004, 4, "ldr", vec![reg("x1"), Operand::mem("x0", 0x60, 8)]),
        ];
        assert_eq!(
            Aarch64Patterns.global_max_fast(&ldr_form, &anchor(&m)),
            Some(DATA + 0x4000 + 0x60)
        );
    }

    #[test]
    fn arm_literal_pool_patterns() {
        let mut m = ctx_inferior(Arch::Arm);
        // literal for the ldr at 0x1000: pc = 0x1004, slot = 0x1004 + 0x20
        m.write_u32(0x1024, 0x3000);
        let main = vec![
            insn(0x1000, 4, "ldr.w", vec![reg("r3"), Operand::mem("pc", 0x20, 4)]),
            insn(0x1004, 2, "add", vec![reg("r3"), reg("pc")]),
        ];
        assert_eq!(ArmPatterns.main_arena(&main, &anchor(&m)), Some(0x1008 + 0x3000));

        let gmf = vec![
            insn(0x1000, 2, "ldr", vec![reg("r3"), Operand::mem("pc", 0x20, 4)]),
            insn(0x1002, 2, "add", vec![reg("r3"), reg("pc")]),
            insn(0x1004, 2, "ldr", vec![reg("r3"), Operand::mem("r3", 4, 4)]),
        ];
        assert_eq!(ArmPatterns.global_max_fast(&gmf, &anchor(&m)), Some(0x100a + 0x3000));

        let free = vec![
            insn(0x1000, 2, "ldr", vec![reg("r2"), Operand::mem("pc", 0x20, 4)]),
            insn(0x1002, 2, "add", vec![reg("r2"), reg("pc")]),
            insn(0x1004, 2, "str", vec![reg("r1"), Operand::mem("r2", 0, 4)]),
        ];
        assert_eq!(ArmPatterns.mp(&free, &anchor(&m)), Some(0x1006 + 0x3000));
    }

    #[test]
    fn arm_tls_offset_after_mrc() {
        let mut m = ctx_inferior(Arch::Arm);
        m.write_u32(0x1024, 0x100);
        // add at 0x1006: slot = 0x100a + 0x100
        m.write_u32(0x110a, 8);
        let insns = vec![
            insn(0x1000, 2, "ldr", vec![reg("r3"), Operand::mem("pc", 0x20, 4)]),
            insn(0x1002, 4, "mrc", vec![]),
            insn(0x1006, 2, "add", vec![reg("r3"), reg("pc")]),
        ];
        assert_eq!(ArmPatterns.thread_arena_offset(&insns, &anchor(&m)), Some(8));
        assert_eq!(ArmPatterns.thread_cache_offset(&insns, &anchor(&m)), Some(12));
    }
}
