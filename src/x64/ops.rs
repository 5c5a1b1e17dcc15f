// This module defines X64Op, the closed set of x86-64 LIR instructions and the code each one
// emits through the compilation result builder. Control flow ops consult the builder for two
// decisions: whether an edge falls through to the next emitted block (then no jump is emitted at
// all) and whether the target label is close enough, in instructions, to try the short rel8
// encoding. The latter is only an estimate; a wrong guess surfaces as a range violation from the
// assembler and the driver re-emits the unit conservatively. Calls record their call annotation
// and exception edge, faulting memory accesses record implicit exceptions, constants that do not
// fit an immediate go through the data section with RIP-relative addressing, and the table
// switch appends an aligned table of 32-bit offsets that it announces as a jump table so
// verifiers skip it. Registers are already allocated, so every operand is a physical register.

//! x86-64 LIR instruction set.

use std::fmt;

use iced_x86::Instruction;

use crate::core::assembler::Assembler;
use crate::core::builder::CompilationResultBuilder;
use crate::core::data::Constant;
use crate::core::error::{EmitError, EmitResult, EncodingError};
use crate::core::lir::{Label, LabelRef, LirFrameState, LirOp};
use crate::core::register::AsmReg;
use crate::core::result::{CallTarget, InfopointReason, JumpTable};

use super::assembler::X64Assembler;
use super::calling_convention::SCRATCH_REGISTER;
use super::encoder::{self, reg_name, Condition, Mem, RAX};

/// Builds a RIP-relative load of the given absolute target.
type RipLoad = fn(AsmReg, u64) -> Result<Instruction, EncodingError>;

/// Instruction distance below which branches try the rel8 encoding.
pub const SHORT_BRANCH_LIR_DISTANCE: u32 = 16;

pub const JUMP_TABLE_ENTRY_SIZE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg(AsmReg),
    Imm(i32),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(reg) => write!(f, "{}", reg_name(*reg)),
            Operand::Imm(imm) => write!(f, "{imm}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Xor,
}

impl BinaryOp {
    pub fn mnemonic(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Xor => "xor",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum X64Op {
    /// Binds the label of a block or slow path.
    Label(Label),
    /// Unconditional edge to another block, elided on fallthrough.
    Jump(LabelRef),
    /// Jump to an arbitrary label, never elided.
    Goto(Label),
    Branch {
        cond: Condition,
        true_dest: LabelRef,
        false_dest: LabelRef,
        true_probability: f64,
    },
    /// Conditional jump into a slow path.
    BranchTo {
        cond: Condition,
        target: Label,
    },
    Compare {
        left: AsmReg,
        right: Operand,
    },
    Test {
        left: AsmReg,
        right: AsmReg,
    },
    Binary {
        op: BinaryOp,
        dst: AsmReg,
        src: Operand,
    },
    Move {
        dst: AsmReg,
        src: AsmReg,
    },
    LoadImm {
        dst: AsmReg,
        value: i64,
    },
    LoadConst {
        dst: AsmReg,
        constant: Constant,
    },
    /// 64-bit load; a state makes the access an implicit null check.
    Load {
        dst: AsmReg,
        base: AsmReg,
        disp: i32,
        state: Option<LirFrameState>,
    },
    Store {
        base: AsmReg,
        disp: i32,
        src: AsmReg,
        state: Option<LirFrameState>,
    },
    NullCheck {
        base: AsmReg,
        state: LirFrameState,
    },
    DirectCall {
        target: String,
        state: Option<LirFrameState>,
    },
    RuntimeCall {
        target: String,
        state: Option<LirFrameState>,
    },
    IndirectCall {
        target: AsmReg,
        state: Option<LirFrameState>,
    },
    Infopoint {
        reason: InfopointReason,
        state: LirFrameState,
    },
    TableSwitch {
        index: AsmReg,
        scratch: AsmReg,
        temp: AsmReg,
        low: i32,
        targets: Vec<LabelRef>,
        default: LabelRef,
    },
    Return,
    /// Unreachable code after a call that does not return.
    DeadEnd,
    Halt,
    Nop(u32),
    /// An instruction this backend refuses to compile.
    Bailout(String),
}

type Crb<'c, 'a> = &'c mut CompilationResultBuilder<'a, X64Op>;

fn use_short_branch(crb: &CompilationResultBuilder<'_, X64Op>, label: Label) -> bool {
    crb.current_inst()
        .is_some_and(|inst| crb.label_within_range(inst, label, SHORT_BRANCH_LIR_DISTANCE))
}

fn jump_to(crb: Crb<'_, '_>, label: Label) -> EmitResult<()> {
    let short = use_short_branch(crb, label);
    crb.asm_mut().jmp(label, short)?;
    Ok(())
}

fn jcc_to(crb: Crb<'_, '_>, cond: Condition, label: Label) -> EmitResult<()> {
    let short = use_short_branch(crb, label);
    crb.asm_mut().jcc(cond, label, short)?;
    Ok(())
}

impl X64Op {
    fn emit_branch(
        crb: Crb<'_, '_>,
        cond: Condition,
        true_dest: LabelRef,
        false_dest: LabelRef,
        true_probability: f64,
    ) -> EmitResult<()> {
        let true_label = crb.block_label(true_dest.target)?;
        let false_label = crb.block_label(false_dest.target)?;
        if crb.is_successor_edge(true_dest) {
            jcc_to(crb, cond.negate(), false_label)
        } else if crb.is_successor_edge(false_dest) {
            jcc_to(crb, cond, true_label)
        } else if true_probability < 0.5 {
            jcc_to(crb, cond.negate(), false_label)?;
            jump_to(crb, true_label)
        } else {
            jcc_to(crb, cond, true_label)?;
            jump_to(crb, false_label)
        }
    }

    fn emit_move(asm: &mut X64Assembler, dst: AsmReg, src: AsmReg) -> EmitResult<()> {
        match (dst.is_fp(), src.is_fp()) {
            (false, false) => asm.emit_enc(encoder::mov_rr(dst, src))?,
            (true, false) => asm.emit_enc(encoder::movq_xr(dst, src))?,
            (false, true) => asm.emit_enc(encoder::movq_rx(dst, src))?,
            (true, true) => {
                asm.emit_enc(encoder::movq_rx(SCRATCH_REGISTER, src))?;
                asm.emit_enc(encoder::movq_xr(dst, SCRATCH_REGISTER))?
            }
        };
        Ok(())
    }

    fn emit_load_const(crb: Crb<'_, '_>, dst: AsmReg, constant: &Constant) -> EmitResult<()> {
        if dst.is_fp() {
            let (address, load): (_, RipLoad) = match constant {
                Constant::Float(bits) => (
                    crb.as_float_const_ref(f32::from_bits(*bits))?,
                    encoder::movss_x_rip,
                ),
                Constant::Int(_) => (
                    crb.record_data_reference_in_code(constant.clone(), 4)?,
                    encoder::movss_x_rip,
                ),
                Constant::Double(bits) => (
                    crb.as_double_const_ref(f64::from_bits(*bits))?,
                    encoder::movsd_x_rip,
                ),
                Constant::Long(value) => (crb.as_long_const_ref(*value)?, encoder::movsd_x_rip),
                Constant::Bytes(_) => {
                    return Err(EmitError::contract(format!(
                        "byte blob cannot be loaded into {}",
                        reg_name(dst)
                    )))
                }
            };
            crb.asm_mut()
                .emit_data_ref(|target| load(dst, target), address)?;
            return Ok(());
        }
        match constant {
            Constant::Int(value) => {
                crb.asm_mut().emit_enc(encoder::mov_ri(dst, *value as i64))?;
            }
            Constant::Float(bits) => {
                crb.asm_mut().emit_enc(encoder::mov_ri(dst, *bits as i64))?;
            }
            Constant::Long(value) => {
                let address = crb.as_long_const_ref(*value)?;
                crb.asm_mut()
                    .emit_data_ref(|target| encoder::mov_r_rip(dst, target), address)?;
            }
            Constant::Double(bits) => {
                let address = crb.as_double_const_ref(f64::from_bits(*bits))?;
                crb.asm_mut()
                    .emit_data_ref(|target| encoder::mov_r_rip(dst, target), address)?;
            }
            Constant::Bytes(bytes) => {
                // the register receives the address of the blob
                let address = crb.record_bytes_reference_in_code(bytes, 8)?;
                crb.asm_mut()
                    .emit_data_ref(|target| encoder::lea_r_rip(dst, target), address)?;
            }
        }
        Ok(())
    }

    fn emit_table_switch(
        crb: Crb<'_, '_>,
        index: AsmReg,
        scratch: AsmReg,
        temp: AsmReg,
        low: i32,
        targets: &[LabelRef],
        default: LabelRef,
    ) -> EmitResult<()> {
        if targets.is_empty() {
            return Err(EmitError::contract("table switch without targets"));
        }
        let count = i32::try_from(targets.len())
            .map_err(|_| EmitError::contract("table switch too large"))?;
        let high = low
            .checked_add(count - 1)
            .ok_or_else(|| EmitError::contract("table switch key range overflows"))?;
        let labels = targets
            .iter()
            .map(|t| crb.block_label(t.target))
            .collect::<EmitResult<Vec<_>>>()?;
        let default_label = crb.block_label(default.target)?;

        let asm = crb.asm_mut();
        asm.emit_enc(encoder::mov_rr(temp, index))?;
        if low != 0 {
            asm.emit_enc(encoder::sub_ri(temp, low))?;
        }
        asm.emit_enc(encoder::cmp_ri(temp, count - 1))?;
        // unsigned compare also catches keys below `low`
        jcc_to(crb, Condition::Above, default_label)?;

        let asm = crb.asm_mut();
        asm.emit_relative(|target| encoder::lea_r_rip(scratch, target))?;
        let lea_end = asm.position();
        asm.emit_enc(encoder::movsxd_rm(temp, Mem::base_index(scratch, temp, 4, 0)?))?;
        asm.emit_enc(encoder::add_rr(scratch, temp))?;
        asm.emit_enc(encoder::jmp_r(scratch))?;
        asm.align(JUMP_TABLE_ENTRY_SIZE)?;
        let table_start = asm.position();
        asm.patch_i32(lea_end - 4, (table_start - lea_end) as i32);
        for label in labels {
            asm.table_entry(label, table_start)?;
        }
        crb.add_jump_table(JumpTable {
            position: table_start,
            low,
            high,
            entry_size: JUMP_TABLE_ENTRY_SIZE,
        })
    }
}

impl LirOp for X64Op {
    type Asm = X64Assembler;

    fn label(label: Label) -> Self {
        X64Op::Label(label)
    }

    fn bound_label(&self) -> Option<Label> {
        match self {
            X64Op::Label(label) => Some(*label),
            _ => None,
        }
    }

    fn may_emit_nothing(&self) -> bool {
        matches!(
            self,
            X64Op::Label(_) | X64Op::Jump(_) | X64Op::Infopoint { .. } | X64Op::DeadEnd
        )
    }

    fn class_name(&self) -> &'static str {
        match self {
            X64Op::Label(_) => "Label",
            X64Op::Jump(_) => "Jump",
            X64Op::Goto(_) => "Goto",
            X64Op::Branch { .. } => "Branch",
            X64Op::BranchTo { .. } => "BranchTo",
            X64Op::Compare { .. } => "Compare",
            X64Op::Test { .. } => "Test",
            X64Op::Binary { .. } => "Binary",
            X64Op::Move { .. } => "Move",
            X64Op::LoadImm { .. } => "LoadImm",
            X64Op::LoadConst { .. } => "LoadConst",
            X64Op::Load { .. } => "Load",
            X64Op::Store { .. } => "Store",
            X64Op::NullCheck { .. } => "NullCheck",
            X64Op::DirectCall { .. } => "DirectCall",
            X64Op::RuntimeCall { .. } => "RuntimeCall",
            X64Op::IndirectCall { .. } => "IndirectCall",
            X64Op::Infopoint { .. } => "Infopoint",
            X64Op::TableSwitch { .. } => "TableSwitch",
            X64Op::Return => "Return",
            X64Op::DeadEnd => "DeadEnd",
            X64Op::Halt => "Halt",
            X64Op::Nop(_) => "Nop",
            X64Op::Bailout(_) => "Bailout",
        }
    }

    fn emit_code(&self, crb: Crb<'_, '_>) -> EmitResult<()> {
        match self {
            X64Op::Label(label) => crb.asm_mut().bind(*label)?,
            X64Op::Jump(edge) => {
                if !crb.is_successor_edge(*edge) {
                    let label = crb.block_label(edge.target)?;
                    jump_to(crb, label)?;
                }
            }
            X64Op::Goto(label) => jump_to(crb, *label)?,
            X64Op::Branch {
                cond,
                true_dest,
                false_dest,
                true_probability,
            } => Self::emit_branch(crb, *cond, *true_dest, *false_dest, *true_probability)?,
            X64Op::BranchTo { cond, target } => jcc_to(crb, *cond, *target)?,
            X64Op::Compare { left, right } => {
                let inst = match right {
                    Operand::Reg(right) => encoder::cmp_rr(*left, *right),
                    Operand::Imm(imm) => encoder::cmp_ri(*left, *imm),
                };
                crb.asm_mut().emit_enc(inst)?;
            }
            X64Op::Test { left, right } => {
                crb.asm_mut().emit_enc(encoder::test_rr(*left, *right))?;
            }
            X64Op::Binary { op, dst, src } => {
                let inst = match (op, src) {
                    (BinaryOp::Add, Operand::Reg(src)) => encoder::add_rr(*dst, *src),
                    (BinaryOp::Sub, Operand::Reg(src)) => encoder::sub_rr(*dst, *src),
                    (BinaryOp::Xor, Operand::Reg(src)) => encoder::xor_rr(*dst, *src),
                    (BinaryOp::Add, Operand::Imm(imm)) => encoder::add_ri(*dst, *imm),
                    (BinaryOp::Sub, Operand::Imm(imm)) => encoder::sub_ri(*dst, *imm),
                    (BinaryOp::Xor, Operand::Imm(imm)) => {
                        return Err(EmitError::contract(format!(
                            "xor with immediate {imm} is not supported"
                        )))
                    }
                };
                crb.asm_mut().emit_enc(inst)?;
            }
            X64Op::Move { dst, src } => Self::emit_move(crb.asm_mut(), *dst, *src)?,
            X64Op::LoadImm { dst, value } => {
                crb.asm_mut().emit_enc(encoder::mov_ri(*dst, *value))?;
            }
            X64Op::LoadConst { dst, constant } => Self::emit_load_const(crb, *dst, constant)?,
            X64Op::Load {
                dst,
                base,
                disp,
                state,
            } => {
                let pos = crb.asm_mut().load(*dst, *base, *disp)?;
                if let Some(state) = state {
                    crb.record_implicit_exception(pos, state)?;
                }
            }
            X64Op::Store {
                base,
                disp,
                src,
                state,
            } => {
                let pos = crb.asm_mut().store(*base, *disp, *src)?;
                if let Some(state) = state {
                    crb.record_implicit_exception(pos, state)?;
                }
            }
            X64Op::NullCheck { base, state } => {
                let pos = crb
                    .asm_mut()
                    .emit_enc(encoder::test_mr(Mem::base_disp(*base, 0)?, RAX))?;
                crb.record_implicit_exception(pos, state)?;
            }
            X64Op::DirectCall { target, state } => {
                let (before, after) = crb.asm_mut().call_placeholder()?;
                crb.record_direct_call(
                    before,
                    after,
                    CallTarget::Method(target.clone()),
                    state.as_ref(),
                )?;
                crb.record_exception_handlers(after, state.as_ref())?;
            }
            X64Op::RuntimeCall { target, state } => {
                let (before, after) = crb.asm_mut().call_placeholder()?;
                crb.record_direct_call(
                    before,
                    after,
                    CallTarget::Runtime(target.clone()),
                    state.as_ref(),
                )?;
                crb.record_exception_handlers(after, state.as_ref())?;
            }
            X64Op::IndirectCall { target, state } => {
                let (before, after) = crb.asm_mut().call_reg(*target)?;
                crb.record_indirect_call(before, after, CallTarget::Indirect, state.as_ref())?;
                crb.record_exception_handlers(after, state.as_ref())?;
            }
            X64Op::Infopoint { reason, state } => {
                let pos = crb.position();
                crb.record_infopoint(pos, state, *reason)?;
            }
            X64Op::TableSwitch {
                index,
                scratch,
                temp,
                low,
                targets,
                default,
            } => Self::emit_table_switch(crb, *index, *scratch, *temp, *low, targets, *default)?,
            X64Op::Return => {
                crb.leave_frame()?;
                crb.frame_returned()?;
                crb.asm_mut().ret()?;
            }
            X64Op::DeadEnd => {
                if crb.options().trap_dead_ends {
                    crb.asm_mut().int3()?;
                }
            }
            X64Op::Halt => crb.asm_mut().halt()?,
            X64Op::Nop(count) => crb.asm_mut().nop(*count as usize),
            X64Op::Bailout(reason) => return Err(EmitError::bailout(reason.clone())),
        }
        Ok(())
    }
}

fn fmt_state(f: &mut fmt::Formatter<'_>, state: Option<&LirFrameState>) -> fmt::Result {
    let Some(state) = state else {
        return Ok(());
    };
    write!(f, " {{")?;
    if let Some(debug) = &state.debug_info {
        write!(f, " {debug}")?;
    }
    if let Some(handler) = state.exception_edge {
        write!(f, " handler={handler}")?;
    }
    if state.lazy {
        write!(f, " lazy")?;
    }
    if !state.valid_for_deoptimization {
        write!(f, " nodeopt")?;
    }
    write!(f, " }}")
}

fn fmt_mem(f: &mut fmt::Formatter<'_>, base: AsmReg, disp: i32) -> fmt::Result {
    if disp == 0 {
        write!(f, "[{}]", reg_name(base))
    } else {
        write!(f, "[{}{disp:+}]", reg_name(base))
    }
}

impl fmt::Display for X64Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            X64Op::Label(label) => write!(f, "{label}:"),
            X64Op::Jump(edge) => write!(f, "jump {}", edge.target),
            X64Op::Goto(label) => write!(f, "goto {label}"),
            X64Op::Branch {
                cond,
                true_dest,
                false_dest,
                true_probability,
            } => write!(
                f,
                "branch {} {} {} {true_probability}",
                cond.mnemonic(),
                true_dest.target,
                false_dest.target
            ),
            X64Op::BranchTo { cond, target } => {
                write!(f, "branchto {} {target}", cond.mnemonic())
            }
            X64Op::Compare { left, right } => write!(f, "cmp {}, {right}", reg_name(*left)),
            X64Op::Test { left, right } => {
                write!(f, "test {}, {}", reg_name(*left), reg_name(*right))
            }
            X64Op::Binary { op, dst, src } => {
                write!(f, "{} {}, {src}", op.mnemonic(), reg_name(*dst))
            }
            X64Op::Move { dst, src } => write!(f, "mov {}, {}", reg_name(*dst), reg_name(*src)),
            X64Op::LoadImm { dst, value } => write!(f, "movi {}, {value}", reg_name(*dst)),
            X64Op::LoadConst { dst, constant } => {
                write!(f, "const {}, {constant}", reg_name(*dst))
            }
            X64Op::Load {
                dst,
                base,
                disp,
                state,
            } => {
                write!(f, "load {}, ", reg_name(*dst))?;
                fmt_mem(f, *base, *disp)?;
                fmt_state(f, state.as_ref())
            }
            X64Op::Store {
                base,
                disp,
                src,
                state,
            } => {
                write!(f, "store ")?;
                fmt_mem(f, *base, *disp)?;
                write!(f, ", {}", reg_name(*src))?;
                fmt_state(f, state.as_ref())
            }
            X64Op::NullCheck { base, state } => {
                write!(f, "nullcheck {}", reg_name(*base))?;
                fmt_state(f, Some(state))
            }
            X64Op::DirectCall { target, state } => {
                write!(f, "call {target}")?;
                fmt_state(f, state.as_ref())
            }
            X64Op::RuntimeCall { target, state } => {
                write!(f, "rtcall {target}")?;
                fmt_state(f, state.as_ref())
            }
            X64Op::IndirectCall { target, state } => {
                write!(f, "icall {}", reg_name(*target))?;
                fmt_state(f, state.as_ref())
            }
            X64Op::Infopoint { reason, state } => {
                write!(f, "infopoint {reason:?}")?;
                fmt_state(f, Some(state))
            }
            X64Op::TableSwitch {
                index,
                low,
                targets,
                default,
                ..
            } => {
                write!(f, "switch {} from {low}:", reg_name(*index))?;
                for target in targets {
                    write!(f, " {}", target.target)?;
                }
                write!(f, " default {}", default.target)
            }
            X64Op::Return => write!(f, "ret"),
            X64Op::DeadEnd => write!(f, "deadend"),
            X64Op::Halt => write!(f, "halt"),
            X64Op::Nop(count) => write!(f, "nop {count}"),
            X64Op::Bailout(reason) => write!(f, "bailout \"{reason}\""),
        }
    }
}
