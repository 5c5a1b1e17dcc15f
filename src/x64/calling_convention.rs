// This module holds the System V AMD64 register conventions that code emission relies on.
// Registers are already allocated by the time LIR reaches the emitter, so the convention is
// consulted only where emission itself has to place values: the deoptimization stub frame
// contexts move the return values and the frame pointer into argument registers before calling
// into the runtime, and the prologue checks that the registers it saves are callee-saved. GP
// arguments go in RDI, RSI, RDX, RCX, R8, R9 and FP arguments in XMM0-XMM7; values come back in
// RAX and XMM0. RegisterConfig bundles these with the fixed registers of the target: the stack
// pointer as frame register and R11 as scratch.

//! System V x86-64 register conventions.

use crate::core::register::{AsmReg, RegBitSet};

use super::encoder::{R11, RAX, RSP};

/// Register banks for different register types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegBank {
    GeneralPurpose = 0,
    Xmm = 1,
}

impl RegBank {
    pub fn of(reg: AsmReg) -> Self {
        if reg.is_fp() {
            RegBank::Xmm
        } else {
            RegBank::GeneralPurpose
        }
    }
}

pub const GP_ARG_REGS: [AsmReg; 6] = [
    AsmReg::gp(7), // RDI
    AsmReg::gp(6), // RSI
    AsmReg::gp(2), // RDX
    AsmReg::gp(1), // RCX
    AsmReg::gp(8), // R8
    AsmReg::gp(9), // R9
];

pub const XMM_ARG_REGS: [AsmReg; 8] = [
    AsmReg::fp(0),
    AsmReg::fp(1),
    AsmReg::fp(2),
    AsmReg::fp(3),
    AsmReg::fp(4),
    AsmReg::fp(5),
    AsmReg::fp(6),
    AsmReg::fp(7),
];

/// RBX, RBP, R12-R15.
pub const CALLEE_SAVED_REGS: [AsmReg; 6] = [
    AsmReg::gp(3),
    AsmReg::gp(5),
    AsmReg::gp(12),
    AsmReg::gp(13),
    AsmReg::gp(14),
    AsmReg::gp(15),
];

/// Caller-saved register free for use inside a single instruction.
pub const SCRATCH_REGISTER: AsmReg = R11;

/// Fixed registers of the x86-64 target.
#[derive(Debug, Clone)]
pub struct RegisterConfig {
    frame_register: AsmReg,
    scratch_register: AsmReg,
    callee_saved: RegBitSet,
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            frame_register: RSP,
            scratch_register: SCRATCH_REGISTER,
            callee_saved: RegBitSet::from_regs(&CALLEE_SAVED_REGS),
        }
    }
}

impl RegisterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register addressing the frame; frames are rsp based.
    pub fn frame_register(&self) -> AsmReg {
        self.frame_register
    }

    pub fn scratch_register(&self) -> AsmReg {
        self.scratch_register
    }

    pub fn is_callee_saved(&self, reg: AsmReg) -> bool {
        self.callee_saved.contains(reg)
    }

    /// Register holding a returned value of `bank`.
    pub fn return_register(&self, bank: RegBank) -> AsmReg {
        match bank {
            RegBank::GeneralPurpose => RAX,
            RegBank::Xmm => AsmReg::fp(0),
        }
    }

    /// The first `count` argument registers of `bank`, in ABI order.
    pub fn argument_registers(&self, bank: RegBank, count: usize) -> Vec<AsmReg> {
        let regs: &[AsmReg] = match bank {
            RegBank::GeneralPurpose => &GP_ARG_REGS,
            RegBank::Xmm => &XMM_ARG_REGS,
        };
        regs.iter().take(count).copied().collect()
    }
}
