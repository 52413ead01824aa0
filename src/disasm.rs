//! Instruction records and x86 decoding using iced-x86.
//!
//! The heuristic locator matches on structured operands rather than on
//! formatted text, so every decoded instruction carries both: the Intel
//! syntax string for display and a list of [`Operand`]s for matching.
//! ARM/AArch64 records use the same shape; they are produced by whatever
//! disassembler the host provides.

use iced_x86::{
    Decoder, DecoderOptions, Formatter, FormatterOutput, FormatterTextKind, IntelFormatter,
    OpKind, Register,
};

/// A memory operand: `segment:[base + index*scale + disp]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemOperand {
    /// Explicit segment override (`fs`, `gs`), if any.
    pub segment: Option<String>,
    pub base: Option<String>,
    pub index: Option<String>,
    /// Raw signed displacement as encoded. For `rip`/`pc` relative forms this
    /// is relative to the next (x86) or current+4 (ARM) instruction.
    pub disp: i64,
    /// Access size in bytes, 0 when unknown.
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(String),
    Imm(i64),
    Mem(MemOperand),
}

impl Operand {
    pub fn reg(name: &str) -> Self {
        Operand::Reg(name.to_string())
    }

    pub fn mem(base: &str, disp: i64, size: u64) -> Self {
        Operand::Mem(MemOperand {
            base: Some(base.to_string()),
            disp,
            size,
            ..Default::default()
        })
    }

    pub fn as_reg(&self) -> Option<&str> {
        match self {
            Operand::Reg(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_imm(&self) -> Option<i64> {
        match self {
            Operand::Imm(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_mem(&self) -> Option<&MemOperand> {
        match self {
            Operand::Mem(m) => Some(m),
            _ => None,
        }
    }
}

/// A single disassembled instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub length: u64,
    /// Lower-case mnemonic, e.g. `lea`, `ldr.w`.
    pub mnemonic: String,
    /// Formatted operand text.
    pub op_str: String,
    pub operands: Vec<Operand>,
}

impl Instruction {
    pub fn new(address: u64, length: u64, mnemonic: &str, operands: Vec<Operand>) -> Self {
        Self {
            address,
            length,
            mnemonic: mnemonic.to_string(),
            op_str: String::new(),
            operands,
        }
    }

    /// Address of the following instruction.
    pub fn next(&self) -> u64 {
        self.address + self.length
    }

    /// First memory operand.
    pub fn mem(&self) -> Option<&MemOperand> {
        self.operands.iter().find_map(Operand::as_mem)
    }

    /// Displacement of the memory operand, 0 when there is none.
    pub fn disp(&self) -> i64 {
        self.mem().map_or(0, |m| m.disp)
    }

    pub fn operand(&self, i: usize) -> Option<&Operand> {
        self.operands.get(i)
    }

    pub fn reg(&self, i: usize) -> Option<&str> {
        self.operand(i).and_then(Operand::as_reg)
    }

    pub fn imm(&self, i: usize) -> Option<i64> {
        self.operand(i).and_then(Operand::as_imm)
    }

    pub fn is(&self, mnemonic: &str) -> bool {
        self.mnemonic == mnemonic
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}: {} {}", self.address, self.mnemonic, self.op_str)
    }
}

/// Decode up to `count` x86 instructions from `code` mapped at `base_addr`.
///
/// `bitness` is 32 or 64. Decoding stops early at undecodable bytes.
pub fn decode_x86(code: &[u8], base_addr: u64, bitness: u32, count: usize) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(bitness, code, base_addr, DecoderOptions::NONE);
    let mut formatter = IntelFormatter::new();
    let mut output = FormatterOutputBuffer::new();
    let mut results = Vec::new();

    while decoder.can_decode() && results.len() < count {
        let insn = decoder.decode();
        if insn.is_invalid() {
            break;
        }

        output.clear();
        formatter.format_mnemonic(&insn, &mut output);
        let mnemonic = output.text().to_string();
        output.clear();
        formatter.format_all_operands(&insn, &mut output);

        results.push(Instruction {
            address: insn.ip(),
            length: insn.len() as u64,
            mnemonic,
            op_str: output.text().to_string(),
            operands: x86_operands(&insn, bitness),
        });
    }

    results
}

/// Decode `count` instructions at `addr`, preceded by the instructions that
/// lead up to it inside `code` (which starts `back` bytes before `addr`).
///
/// x86 cannot be decoded backwards, so this picks the earliest start offset
/// whose instruction stream lands exactly on `addr`.
pub fn decode_x86_with_preceding(
    code: &[u8],
    addr: u64,
    back: usize,
    bitness: u32,
    count: usize,
) -> Vec<Instruction> {
    let back = back.min(code.len());
    for skip in 0..back {
        let start = addr - (back - skip) as u64;
        let prefix = decode_x86(&code[skip..back], start, bitness, back);
        if prefix.last().is_some_and(|i| i.next() == addr) {
            let mut out = prefix;
            out.extend(decode_x86(&code[back..], addr, bitness, count));
            return out;
        }
    }
    decode_x86(&code[back..], addr, bitness, count)
}

fn x86_operands(insn: &iced_x86::Instruction, bitness: u32) -> Vec<Operand> {
    (0..insn.op_count())
        .map(|i| match insn.op_kind(i) {
            OpKind::Register => Operand::Reg(reg_name(insn.op_register(i))),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                Operand::Imm(insn.near_branch_target() as i64)
            }
            OpKind::Memory => Operand::Mem(x86_mem(insn, bitness)),
            OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Operand::Imm(insn.immediate(i) as i64),
            _ => Operand::Imm(0),
        })
        .collect()
}

fn x86_mem(insn: &iced_x86::Instruction, bitness: u32) -> MemOperand {
    let disp = if insn.is_ip_rel_memory_operand() {
        // iced resolves rip-relative operands to the absolute target
        insn.ip_rel_memory_address().wrapping_sub(insn.next_ip()) as i64
    } else if bitness == 32 {
        insn.memory_displacement32() as i32 as i64
    } else {
        insn.memory_displacement64() as i64
    };
    let opt = |r: Register| (r != Register::None).then(|| reg_name(r));
    MemOperand {
        segment: opt(insn.segment_prefix()),
        base: opt(insn.memory_base()),
        index: opt(insn.memory_index()),
        disp,
        size: insn.memory_size().size() as u64,
    }
}

fn reg_name(reg: Register) -> String {
    format!("{:?}", reg).to_lowercase()
}

/// Internal buffer for iced-x86 formatter output.
struct FormatterOutputBuffer {
    text: String,
}

impl FormatterOutputBuffer {
    fn new() -> Self {
        Self { text: String::new() }
    }

    fn clear(&mut self) {
        self.text.clear();
    }

    fn text(&self) -> &str {
        &self.text
    }
}

impl FormatterOutput for FormatterOutputBuffer {
    fn write(&mut self, text: &str, _kind: FormatterTextKind) {
        self.text.push_str(text);
    }
}
