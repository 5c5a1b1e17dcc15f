// This module builds the x86-64 instructions lir-emit needs on top of the iced-x86 library.
// Every helper returns an iced_x86::Instruction with an explicit Code, so the caller decides the
// exact form (rel8 or rel32 branch, imm8 or imm32 arithmetic) and the label offset estimates keep
// meaning something. encode() runs the iced-x86 Encoder for one instruction at a given address
// and reports where the memory displacement landed, which is how the assembler finds the disp32
// field of a RIP-relative data reference. Registers are AsmReg values numbered the hardware way
// (rax=0 .. r15=15 in the GP bank, xmm0..xmm15 in the FP bank) and are mapped onto iced-x86
// registers here. Branches, calls and RIP-relative operands take the absolute target address;
// the assembler passes the address that leaves the relative field zero and patches it later
// through its label table or its data fixups.

//! x86-64 instruction encoding using iced-x86.

use iced_x86::{Code, Encoder, IcedError, Instruction, MemoryOperand, Register};

use crate::core::error::EncodingError;
use crate::core::register::AsmReg;

pub const RAX: AsmReg = AsmReg::gp(0);
pub const RCX: AsmReg = AsmReg::gp(1);
pub const RDX: AsmReg = AsmReg::gp(2);
pub const RBX: AsmReg = AsmReg::gp(3);
pub const RSP: AsmReg = AsmReg::gp(4);
pub const RBP: AsmReg = AsmReg::gp(5);
pub const RSI: AsmReg = AsmReg::gp(6);
pub const RDI: AsmReg = AsmReg::gp(7);
pub const R8: AsmReg = AsmReg::gp(8);
pub const R9: AsmReg = AsmReg::gp(9);
pub const R10: AsmReg = AsmReg::gp(10);
pub const R11: AsmReg = AsmReg::gp(11);
pub const R12: AsmReg = AsmReg::gp(12);
pub const R13: AsmReg = AsmReg::gp(13);
pub const R14: AsmReg = AsmReg::gp(14);
pub const R15: AsmReg = AsmReg::gp(15);

pub const fn xmm(id: u8) -> AsmReg {
    AsmReg::fp(id)
}

const GP_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

const GP64_REGS: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

const XMM_REGS: [Register; 16] = [
    Register::XMM0,
    Register::XMM1,
    Register::XMM2,
    Register::XMM3,
    Register::XMM4,
    Register::XMM5,
    Register::XMM6,
    Register::XMM7,
    Register::XMM8,
    Register::XMM9,
    Register::XMM10,
    Register::XMM11,
    Register::XMM12,
    Register::XMM13,
    Register::XMM14,
    Register::XMM15,
];

/// Assembly name of a register (`rax`, `xmm3`).
pub fn reg_name(reg: AsmReg) -> String {
    match reg.bank {
        AsmReg::GP_BANK if reg.id < 16 => GP_NAMES[reg.id as usize].to_string(),
        AsmReg::FP_BANK if reg.id < 16 => format!("xmm{}", reg.id),
        _ => format!("r{}.{}", reg.bank, reg.id),
    }
}

/// Parse a register name as printed by [`reg_name`].
pub fn parse_reg(name: &str) -> Option<AsmReg> {
    if let Some(id) = GP_NAMES.iter().position(|&n| n == name) {
        return Some(AsmReg::gp(id as u8));
    }
    let id: u8 = name.strip_prefix("xmm")?.parse().ok()?;
    (id < 16).then_some(AsmReg::fp(id))
}

fn gp(reg: AsmReg, operation: &'static str) -> Result<Register, EncodingError> {
    GP64_REGS
        .get(reg.id as usize)
        .copied()
        .filter(|_| reg.is_gp())
        .ok_or(EncodingError::InvalidRegister { reg, operation })
}

fn fp(reg: AsmReg, operation: &'static str) -> Result<Register, EncodingError> {
    XMM_REGS
        .get(reg.id as usize)
        .copied()
        .filter(|_| reg.is_fp())
        .ok_or(EncodingError::InvalidRegister { reg, operation })
}

fn assembly_error(e: IcedError) -> EncodingError {
    EncodingError::Assembly(e.to_string())
}

/// Condition codes, numbered as in the `Jcc`/`SETcc` opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Condition {
    Overflow = 0x0,
    NoOverflow = 0x1,
    Below = 0x2,
    AboveEqual = 0x3,
    Equal = 0x4,
    NotEqual = 0x5,
    BelowEqual = 0x6,
    Above = 0x7,
    Sign = 0x8,
    NoSign = 0x9,
    Parity = 0xA,
    NoParity = 0xB,
    Less = 0xC,
    GreaterEqual = 0xD,
    LessEqual = 0xE,
    Greater = 0xF,
}

impl Condition {
    const ALL: [Condition; 16] = [
        Condition::Overflow,
        Condition::NoOverflow,
        Condition::Below,
        Condition::AboveEqual,
        Condition::Equal,
        Condition::NotEqual,
        Condition::BelowEqual,
        Condition::Above,
        Condition::Sign,
        Condition::NoSign,
        Condition::Parity,
        Condition::NoParity,
        Condition::Less,
        Condition::GreaterEqual,
        Condition::LessEqual,
        Condition::Greater,
    ];

    /// Conditions come in complementary pairs differing in the low bit.
    pub const fn negate(self) -> Self {
        Self::ALL[(self as u8 ^ 1) as usize]
    }

    pub const fn mnemonic(self) -> &'static str {
        match self {
            Condition::Overflow => "o",
            Condition::NoOverflow => "no",
            Condition::Below => "b",
            Condition::AboveEqual => "ae",
            Condition::Equal => "e",
            Condition::NotEqual => "ne",
            Condition::BelowEqual => "be",
            Condition::Above => "a",
            Condition::Sign => "s",
            Condition::NoSign => "ns",
            Condition::Parity => "p",
            Condition::NoParity => "np",
            Condition::Less => "l",
            Condition::GreaterEqual => "ge",
            Condition::LessEqual => "le",
            Condition::Greater => "g",
        }
    }

    pub fn from_mnemonic(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.mnemonic() == name)
    }

    const fn rel8_code(self) -> Code {
        match self {
            Condition::Overflow => Code::Jo_rel8_64,
            Condition::NoOverflow => Code::Jno_rel8_64,
            Condition::Below => Code::Jb_rel8_64,
            Condition::AboveEqual => Code::Jae_rel8_64,
            Condition::Equal => Code::Je_rel8_64,
            Condition::NotEqual => Code::Jne_rel8_64,
            Condition::BelowEqual => Code::Jbe_rel8_64,
            Condition::Above => Code::Ja_rel8_64,
            Condition::Sign => Code::Js_rel8_64,
            Condition::NoSign => Code::Jns_rel8_64,
            Condition::Parity => Code::Jp_rel8_64,
            Condition::NoParity => Code::Jnp_rel8_64,
            Condition::Less => Code::Jl_rel8_64,
            Condition::GreaterEqual => Code::Jge_rel8_64,
            Condition::LessEqual => Code::Jle_rel8_64,
            Condition::Greater => Code::Jg_rel8_64,
        }
    }

    const fn rel32_code(self) -> Code {
        match self {
            Condition::Overflow => Code::Jo_rel32_64,
            Condition::NoOverflow => Code::Jno_rel32_64,
            Condition::Below => Code::Jb_rel32_64,
            Condition::AboveEqual => Code::Jae_rel32_64,
            Condition::Equal => Code::Je_rel32_64,
            Condition::NotEqual => Code::Jne_rel32_64,
            Condition::BelowEqual => Code::Jbe_rel32_64,
            Condition::Above => Code::Ja_rel32_64,
            Condition::Sign => Code::Js_rel32_64,
            Condition::NoSign => Code::Jns_rel32_64,
            Condition::Parity => Code::Jp_rel32_64,
            Condition::NoParity => Code::Jnp_rel32_64,
            Condition::Less => Code::Jl_rel32_64,
            Condition::GreaterEqual => Code::Jge_rel32_64,
            Condition::LessEqual => Code::Jle_rel32_64,
            Condition::Greater => Code::Jg_rel32_64,
        }
    }
}

/// Bytes of one encoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedInst {
    bytes: Vec<u8>,
    displacement_offset: Option<u32>,
}

impl EncodedInst {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Offset of the memory displacement field within the instruction.
    pub fn displacement_offset(&self) -> Option<u32> {
        self.displacement_offset
    }
}

/// Encode `inst` as if placed at address `ip`.
pub fn encode(inst: &Instruction, ip: u64) -> Result<EncodedInst, EncodingError> {
    let mut encoder = Encoder::try_new(64).map_err(assembly_error)?;
    encoder.encode(inst, ip).map_err(assembly_error)?;
    let offsets = encoder.get_constant_offsets();
    let displacement_offset = offsets
        .has_displacement()
        .then(|| offsets.displacement_offset() as u32);
    Ok(EncodedInst {
        bytes: encoder.take_buffer(),
        displacement_offset,
    })
}

/// Memory operand `[base + index*scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    base: Register,
    index: Register,
    scale: u32,
    disp: i32,
}

impl Mem {
    pub fn base_disp(base: AsmReg, disp: i32) -> Result<Self, EncodingError> {
        Ok(Self {
            base: gp(base, "memory base")?,
            index: Register::None,
            scale: 1,
            disp,
        })
    }

    pub fn base_index(
        base: AsmReg,
        index: AsmReg,
        scale: u8,
        disp: i32,
    ) -> Result<Self, EncodingError> {
        let index_reg = gp(index, "memory index")?;
        if index_reg == Register::RSP {
            return Err(EncodingError::InvalidRegister {
                reg: index,
                operation: "memory index",
            });
        }
        if !matches!(scale, 1 | 2 | 4 | 8) {
            return Err(EncodingError::ImmediateOutOfRange {
                value: scale as i64,
                operation: "scale",
            });
        }
        Ok(Self {
            base: gp(base, "memory base")?,
            index: index_reg,
            scale: scale as u32,
            disp,
        })
    }

    fn operand(&self) -> MemoryOperand {
        // size 1 lets the encoder widen to disp32 when the value needs it
        let displ_size = if self.disp == 0 { 0 } else { 1 };
        MemoryOperand::with_base_index_scale_displ_size(
            self.base,
            self.index,
            self.scale,
            self.disp as i64,
            displ_size,
        )
    }
}

fn rip(target: u64) -> MemoryOperand {
    MemoryOperand::with_base_displ(Register::RIP, target as i64)
}

/// `mov dst, src` (64-bit).
pub fn mov_rr(dst: AsmReg, src: AsmReg) -> Result<Instruction, EncodingError> {
    Instruction::with2(Code::Mov_rm64_r64, gp(dst, "mov")?, gp(src, "mov")?)
        .map_err(assembly_error)
}

/// `mov dst, imm`, using the sign-extended imm32 form when possible.
pub fn mov_ri(dst: AsmReg, imm: i64) -> Result<Instruction, EncodingError> {
    let d = gp(dst, "mov")?;
    match i32::try_from(imm) {
        Ok(imm32) => Instruction::with2(Code::Mov_rm64_imm32, d, imm32),
        Err(_) => Instruction::with2(Code::Mov_r64_imm64, d, imm as u64),
    }
    .map_err(assembly_error)
}

/// `mov dst, qword [mem]`.
pub fn mov_rm(dst: AsmReg, mem: Mem) -> Result<Instruction, EncodingError> {
    Instruction::with2(Code::Mov_r64_rm64, gp(dst, "mov")?, mem.operand()).map_err(assembly_error)
}

/// `mov qword [mem], src`.
pub fn mov_mr(mem: Mem, src: AsmReg) -> Result<Instruction, EncodingError> {
    Instruction::with2(Code::Mov_rm64_r64, mem.operand(), gp(src, "mov")?).map_err(assembly_error)
}

/// `mov dst, qword [rip -> target]`.
pub fn mov_r_rip(dst: AsmReg, target: u64) -> Result<Instruction, EncodingError> {
    Instruction::with2(Code::Mov_r64_rm64, gp(dst, "mov")?, rip(target)).map_err(assembly_error)
}

/// `lea dst, [rip -> target]`.
pub fn lea_r_rip(dst: AsmReg, target: u64) -> Result<Instruction, EncodingError> {
    Instruction::with2(Code::Lea_r64_m, gp(dst, "lea")?, rip(target)).map_err(assembly_error)
}

/// `movsxd dst, dword [mem]`.
pub fn movsxd_rm(dst: AsmReg, mem: Mem) -> Result<Instruction, EncodingError> {
    Instruction::with2(Code::Movsxd_r64_rm32, gp(dst, "movsxd")?, mem.operand())
        .map_err(assembly_error)
}

/// `movsd xmm, qword [rip -> target]`.
pub fn movsd_x_rip(dst: AsmReg, target: u64) -> Result<Instruction, EncodingError> {
    Instruction::with2(Code::Movsd_xmm_xmmm64, fp(dst, "movsd")?, rip(target))
        .map_err(assembly_error)
}

/// `movss xmm, dword [rip -> target]`.
pub fn movss_x_rip(dst: AsmReg, target: u64) -> Result<Instruction, EncodingError> {
    Instruction::with2(Code::Movss_xmm_xmmm32, fp(dst, "movss")?, rip(target))
        .map_err(assembly_error)
}

/// `movsd xmm, qword [mem]`.
pub fn movsd_xm(dst: AsmReg, mem: Mem) -> Result<Instruction, EncodingError> {
    Instruction::with2(Code::Movsd_xmm_xmmm64, fp(dst, "movsd")?, mem.operand())
        .map_err(assembly_error)
}

/// `movsd qword [mem], xmm`.
pub fn movsd_mx(mem: Mem, src: AsmReg) -> Result<Instruction, EncodingError> {
    Instruction::with2(Code::Movsd_xmmm64_xmm, mem.operand(), fp(src, "movsd")?)
        .map_err(assembly_error)
}

/// `movq xmm, r64`.
pub fn movq_xr(dst: AsmReg, src: AsmReg) -> Result<Instruction, EncodingError> {
    Instruction::with2(Code::Movq_xmm_rm64, fp(dst, "movq")?, gp(src, "movq")?)
        .map_err(assembly_error)
}

/// `movq r64, xmm`.
pub fn movq_rx(dst: AsmReg, src: AsmReg) -> Result<Instruction, EncodingError> {
    Instruction::with2(Code::Movq_rm64_xmm, gp(dst, "movq")?, fp(src, "movq")?)
        .map_err(assembly_error)
}

fn alu_rr(
    code: Code,
    dst: AsmReg,
    src: AsmReg,
    operation: &'static str,
) -> Result<Instruction, EncodingError> {
    Instruction::with2(code, gp(dst, operation)?, gp(src, operation)?).map_err(assembly_error)
}

/// Picks the sign-extended imm8 form when the value fits.
fn alu_ri(
    codes: (Code, Code),
    dst: AsmReg,
    imm: i32,
    operation: &'static str,
) -> Result<Instruction, EncodingError> {
    let code = if i8::try_from(imm).is_ok() { codes.0 } else { codes.1 };
    Instruction::with2(code, gp(dst, operation)?, imm).map_err(assembly_error)
}

pub fn add_rr(dst: AsmReg, src: AsmReg) -> Result<Instruction, EncodingError> {
    alu_rr(Code::Add_rm64_r64, dst, src, "add")
}

pub fn sub_rr(dst: AsmReg, src: AsmReg) -> Result<Instruction, EncodingError> {
    alu_rr(Code::Sub_rm64_r64, dst, src, "sub")
}

pub fn xor_rr(dst: AsmReg, src: AsmReg) -> Result<Instruction, EncodingError> {
    alu_rr(Code::Xor_rm64_r64, dst, src, "xor")
}

pub fn cmp_rr(left: AsmReg, right: AsmReg) -> Result<Instruction, EncodingError> {
    alu_rr(Code::Cmp_rm64_r64, left, right, "cmp")
}

pub fn test_rr(left: AsmReg, right: AsmReg) -> Result<Instruction, EncodingError> {
    alu_rr(Code::Test_rm64_r64, left, right, "test")
}

/// `test qword [mem], reg`, the faulting access of a null check.
pub fn test_mr(mem: Mem, reg: AsmReg) -> Result<Instruction, EncodingError> {
    Instruction::with2(Code::Test_rm64_r64, mem.operand(), gp(reg, "test")?)
        .map_err(assembly_error)
}

pub fn add_ri(dst: AsmReg, imm: i32) -> Result<Instruction, EncodingError> {
    alu_ri((Code::Add_rm64_imm8, Code::Add_rm64_imm32), dst, imm, "add")
}

pub fn sub_ri(dst: AsmReg, imm: i32) -> Result<Instruction, EncodingError> {
    alu_ri((Code::Sub_rm64_imm8, Code::Sub_rm64_imm32), dst, imm, "sub")
}

pub fn cmp_ri(dst: AsmReg, imm: i32) -> Result<Instruction, EncodingError> {
    alu_ri((Code::Cmp_rm64_imm8, Code::Cmp_rm64_imm32), dst, imm, "cmp")
}

/// `call rel32`.
pub fn call_rel32(target: u64) -> Result<Instruction, EncodingError> {
    Instruction::with_branch(Code::Call_rel32_64, target).map_err(assembly_error)
}

/// `call r64`.
pub fn call_r(target: AsmReg) -> Result<Instruction, EncodingError> {
    Instruction::with1(Code::Call_rm64, gp(target, "call")?).map_err(assembly_error)
}

/// `jmp r64`.
pub fn jmp_r(target: AsmReg) -> Result<Instruction, EncodingError> {
    Instruction::with1(Code::Jmp_rm64, gp(target, "jmp")?).map_err(assembly_error)
}

/// `jmp rel8`; the displacement is the last byte.
pub fn jmp_rel8(target: u64) -> Result<Instruction, EncodingError> {
    Instruction::with_branch(Code::Jmp_rel8_64, target).map_err(assembly_error)
}

/// `jmp rel32`; the displacement is the last four bytes.
pub fn jmp_rel32(target: u64) -> Result<Instruction, EncodingError> {
    Instruction::with_branch(Code::Jmp_rel32_64, target).map_err(assembly_error)
}

/// `jcc rel8`.
pub fn jcc_rel8(cond: Condition, target: u64) -> Result<Instruction, EncodingError> {
    Instruction::with_branch(cond.rel8_code(), target).map_err(assembly_error)
}

/// `jcc rel32`.
pub fn jcc_rel32(cond: Condition, target: u64) -> Result<Instruction, EncodingError> {
    Instruction::with_branch(cond.rel32_code(), target).map_err(assembly_error)
}

pub fn ret() -> Instruction {
    Instruction::with(Code::Retnq)
}

pub fn hlt() -> Instruction {
    Instruction::with(Code::Hlt)
}

pub fn int3() -> Instruction {
    Instruction::with(Code::Int3)
}

/// Recommended multi-byte NOP sequences, indexed by length - 1.
const NOPS: [&[u8]; 9] = [
    &[0x90],
    &[0x66, 0x90],
    &[0x0F, 0x1F, 0x00],
    &[0x0F, 0x1F, 0x40, 0x00],
    &[0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
    &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
    &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// Fill `count` bytes with as few NOP instructions as possible.
pub fn nops(count: usize, out: &mut Vec<u8>) {
    let mut remaining = count;
    while remaining > 0 {
        let n = remaining.min(NOPS.len());
        out.extend_from_slice(NOPS[n - 1]);
        remaining -= n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::code_asm::*;
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    fn bytes(inst: Result<Instruction, EncodingError>) -> Vec<u8> {
        encode(&inst.unwrap(), 0).unwrap().as_slice().to_vec()
    }

    fn reference(f: impl FnOnce(&mut CodeAssembler) -> Result<(), IcedError>) -> Vec<u8> {
        let mut a = CodeAssembler::new(64).unwrap();
        f(&mut a).unwrap();
        a.assemble(0).unwrap()
    }

    fn decode_one(bytes: &[u8]) -> Instruction {
        let mut decoder = Decoder::new(64, bytes, DecoderOptions::NONE);
        let inst = decoder.decode();
        assert!(!inst.is_invalid(), "invalid encoding {bytes:02X?}");
        assert_eq!(inst.len(), bytes.len(), "trailing bytes in {bytes:02X?}");
        inst
    }

    #[test]
    fn test_register_moves_match_code_assembler() {
        assert_eq!(bytes(mov_rr(RAX, RBX)), reference(|a| a.mov(rax, rbx)));
        assert_eq!(bytes(mov_rr(R12, RDI)), reference(|a| a.mov(r12, rdi)));
        assert_eq!(bytes(movq_xr(xmm(2), RSI)), reference(|a| a.movq(xmm2, rsi)));
        assert_eq!(bytes(movq_rx(RDX, xmm(0))), reference(|a| a.movq(rdx, xmm0)));
    }

    #[test]
    fn test_memory_operands_match_code_assembler() {
        let mem = Mem::base_disp(RSP, 8).unwrap();
        assert_eq!(
            bytes(mov_mr(mem, RBX)),
            reference(|a| a.mov(qword_ptr(rsp + 8), rbx))
        );
        let mem = Mem::base_disp(RBP, 0).unwrap();
        assert_eq!(bytes(mov_rm(RAX, mem)), reference(|a| a.mov(rax, qword_ptr(rbp))));
        let mem = Mem::base_disp(R13, 0x200).unwrap();
        assert_eq!(
            bytes(movsd_xm(xmm(9), mem)),
            reference(|a| a.movsd_2(xmm9, qword_ptr(r13 + 0x200)))
        );
        let mem = Mem::base_index(RCX, RDX, 4, 0).unwrap();
        assert_eq!(
            bytes(movsxd_rm(RAX, mem)),
            reference(|a| a.movsxd(rax, dword_ptr(rcx + rdx * 4)))
        );
        let mem = Mem::base_disp(R12, 0).unwrap();
        assert_eq!(
            bytes(test_mr(mem, RAX)),
            reference(|a| a.test(qword_ptr(r12), rax))
        );
        assert!(Mem::base_index(RAX, RSP, 1, 0).is_err());
        assert!(Mem::base_index(RAX, RCX, 3, 0).is_err());
    }

    #[test]
    fn test_stack_adjust_picks_immediate_width() {
        assert_eq!(bytes(sub_ri(RSP, 24)), reference(|a| a.sub(rsp, 24)));
        assert_eq!(bytes(add_ri(RSP, 0x1000)), reference(|a| a.add(rsp, 0x1000)));
        assert_eq!(bytes(sub_ri(RSP, 24)).len(), 4);
        assert_eq!(bytes(add_ri(RSP, 0x1000)).len(), 7);
        assert_eq!(bytes(call_r(R11)), &[0x41, 0xFF, 0xD3]);
    }

    #[test]
    fn test_mov_immediate_forms() {
        let small = decode_one(&bytes(mov_ri(RCX, -1)));
        assert_eq!(small.code(), Code::Mov_rm64_imm32);
        assert_eq!(small.op0_register(), Register::RCX);

        let wide = decode_one(&bytes(mov_ri(R9, 0x0BAD_DECA_FFC0_FFEE)));
        assert_eq!(wide.code(), Code::Mov_r64_imm64);
        assert_eq!(wide.op0_register(), Register::R9);
        assert_eq!(wide.immediate64(), 0x0BAD_DECA_FFC0_FFEE);
    }

    #[test]
    fn test_rip_relative_forms_report_displacement() {
        for (inst, code) in [
            (movsd_x_rip(xmm(1), 0x100), Code::Movsd_xmm_xmmm64),
            (movss_x_rip(xmm(12), 0x100), Code::Movss_xmm_xmmm32),
            (mov_r_rip(R8, 0x100), Code::Mov_r64_rm64),
            (lea_r_rip(RAX, 0x100), Code::Lea_r64_m),
        ] {
            let enc = encode(&inst.unwrap(), 0x40).unwrap();
            let decoded = decode_one(enc.as_slice());
            assert_eq!(decoded.code(), code);
            assert!(decoded.is_ip_rel_memory_operand());
            // disp32 is the last field and points at the target
            let at = enc.displacement_offset().unwrap() as usize;
            assert_eq!(at, enc.len() - 4);
            let disp = i32::from_le_bytes(enc.as_slice()[at..].try_into().unwrap());
            assert_eq!(0x40 + enc.len() as i64 + disp as i64, 0x100);
        }
        let enc = encode(&mov_rr(RAX, RBX).unwrap(), 0).unwrap();
        assert_eq!(enc.displacement_offset(), None);
    }

    #[test]
    fn test_branch_forms() {
        let enc = |inst: Result<Instruction, EncodingError>, ip: u64| {
            encode(&inst.unwrap(), ip).unwrap().as_slice().to_vec()
        };
        assert_eq!(enc(jmp_rel8(0x12), 0x10), &[0xEB, 0x00]);
        assert_eq!(enc(jmp_rel32(0x15), 0x10), &[0xE9, 0, 0, 0, 0]);
        assert_eq!(enc(jcc_rel8(Condition::Less, 0x10), 0x10), &[0x7C, 0xFE]);
        assert_eq!(
            enc(jcc_rel32(Condition::NotEqual, 0x16), 0x10),
            &[0x0F, 0x85, 0, 0, 0, 0]
        );
        assert_eq!(enc(call_rel32(5), 0), &[0xE8, 0, 0, 0, 0]);
        assert!(encode(&jmp_rel8(0x200).unwrap(), 0).is_err());
        assert_eq!(Condition::Less.negate(), Condition::GreaterEqual);
        assert_eq!(Condition::Equal.negate(), Condition::NotEqual);
    }

    #[test]
    fn test_every_condition_has_matching_jcc() {
        for cond in Condition::ALL {
            let short = decode_one(&bytes(jcc_rel8(cond, 2)));
            let near = decode_one(&bytes(jcc_rel32(cond, 6)));
            assert_eq!(short.mnemonic(), near.mnemonic());
            assert_eq!(short.near_branch64(), 2);
            assert_eq!(short.len(), 2);
            assert_eq!(near.len(), 6);
        }
    }

    #[test]
    fn test_nops_decode() {
        for count in 1..=20 {
            let mut bytes = Vec::new();
            nops(count, &mut bytes);
            assert_eq!(bytes.len(), count);
            let mut decoder = Decoder::new(64, &bytes, DecoderOptions::NONE);
            for inst in &mut decoder {
                assert!(!inst.is_invalid());
                assert_eq!(inst.mnemonic(), Mnemonic::Nop);
            }
        }
    }

    #[test]
    fn test_register_names_round_trip() {
        assert_eq!(reg_name(R13), "r13");
        assert_eq!(parse_reg("xmm7"), Some(xmm(7)));
        assert_eq!(parse_reg("rsp"), Some(RSP));
        assert_eq!(parse_reg("xmm16"), None);
        assert!(mov_rr(xmm(0), RAX).is_err());
        assert!(movq_xr(RAX, RAX).is_err());
    }
}
