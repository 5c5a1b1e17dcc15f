// This module implements the x86-64 frame contexts. X64FrameContext is the regular rsp-based
// frame: the prologue drops the stack pointer by the frame size (the return address pushed by the
// caller completes the aligned frame), optionally fills the fresh frame with a poison pattern so
// reads of uninitialized slots stand out, and stores the callee-saved registers into their save
// slots at the top of the frame. The epilogue restores them and pops the frame. Both record the
// loader marks PROLOGUE_DECD_RSP, PROLOGUE_END, EPILOGUE_START, EPILOGUE_INCD_RSP and, from the
// returned() hook, EPILOGUE_END. The two deoptimization stub contexts wrap the regular one: the
// entry stub hands the values returned by the deoptimized callee and the original stack pointer
// to the runtime in the first three argument registers before building its frame; the exit stub
// switches to the stack pointer the runtime passes in, parks the floating point return value
// below its frame and reloads it into xmm0 once its frame is gone.

//! x86-64 prologue and epilogue emission.

use crate::core::builder::CompilationResultBuilder;
use crate::core::error::{EmitError, EmitResult};
use crate::core::frame::FrameContext;
use crate::core::register::AsmReg;
use crate::core::result::MarkId;

use super::assembler::X64Assembler;
use super::calling_convention::{RegBank, RegisterConfig};
use super::encoder::{self, RSP};
use super::ops::X64Op;

/// Pattern written over a fresh frame when stack zapping is on.
pub const STACK_ZAP_VALUE: i64 = 0x0BAD_DECA_FFC0_FFEE;

type Crb<'c, 'a> = &'c mut CompilationResultBuilder<'a, X64Op>;

fn comment(crb: Crb<'_, '_>, text: &str) -> EmitResult<()> {
    if crb.options().emit_lir_comments() {
        crb.block_comment(text)?;
    }
    Ok(())
}

/// Regular method frame addressed through rsp.
#[derive(Debug, Clone, Default)]
pub struct X64FrameContext {
    config: RegisterConfig,
}

impl X64FrameContext {
    pub fn new(config: RegisterConfig) -> Self {
        Self { config }
    }

    pub fn register_config(&self) -> &RegisterConfig {
        &self.config
    }
}

impl FrameContext<X64Op> for X64FrameContext {
    fn enter(&self, crb: Crb<'_, '_>) -> EmitResult<()> {
        let frame_map = crb.frame_map();
        if let Some(reg) = frame_map
            .callee_saved()
            .iter()
            .find(|&&reg| !self.config.is_callee_saved(reg))
        {
            return Err(EmitError::contract(format!(
                "{} is saved by the prologue but is not callee-saved",
                encoder::reg_name(*reg)
            )));
        }
        let frame_size = frame_map.frame_size() as i32;
        comment(crb, "[method prologue]")?;

        let asm: &mut X64Assembler = crb.asm_mut();
        if frame_size != 0 {
            asm.emit_enc(encoder::sub_ri(RSP, frame_size))?;
        }
        crb.record_mark_here(MarkId::PrologueDecdRsp)?;

        if crb.options().zap_stack_on_method_entry {
            let scratch = self.config.scratch_register();
            let asm = crb.asm_mut();
            asm.emit_enc(encoder::mov_ri(scratch, STACK_ZAP_VALUE))?;
            for slot in 0..frame_size / 8 {
                asm.store(RSP, slot * 8, scratch)?;
            }
        }

        for (i, &reg) in frame_map.callee_saved().iter().enumerate() {
            crb.asm_mut().store(RSP, frame_map.callee_save_offset(i), reg)?;
        }
        crb.record_mark_here(MarkId::PrologueEnd)?;
        Ok(())
    }

    fn leave(&self, crb: Crb<'_, '_>) -> EmitResult<()> {
        let frame_map = crb.frame_map();
        comment(crb, "[method epilogue]")?;
        crb.record_mark_here(MarkId::EpilogueStart)?;
        for (i, &reg) in frame_map.callee_saved().iter().enumerate() {
            crb.asm_mut().load(reg, RSP, frame_map.callee_save_offset(i))?;
        }
        let frame_size = frame_map.frame_size() as i32;
        if frame_size != 0 {
            crb.asm_mut().emit_enc(encoder::add_ri(RSP, frame_size))?;
        }
        crb.record_mark_here(MarkId::EpilogueIncdRsp)?;
        Ok(())
    }

    fn returned(&self, crb: Crb<'_, '_>) -> EmitResult<()> {
        crb.record_mark_here(MarkId::EpilogueEnd)?;
        Ok(())
    }
}

/// First three GP argument registers of the runtime calls the stubs make.
fn stub_arguments(config: &RegisterConfig) -> [AsmReg; 3] {
    let regs = config.argument_registers(RegBank::GeneralPurpose, 3);
    [regs[0], regs[1], regs[2]]
}

/// Frame of the stub entered when a callee returns into deoptimized code.
/// Passes the return values and the original stack pointer to the
/// runtime.
#[derive(Debug, Clone, Default)]
pub struct DeoptEntryStubContext {
    inner: X64FrameContext,
}

impl DeoptEntryStubContext {
    pub fn new(config: RegisterConfig) -> Self {
        Self {
            inner: X64FrameContext::new(config),
        }
    }
}

impl FrameContext<X64Op> for DeoptEntryStubContext {
    fn enter(&self, crb: Crb<'_, '_>) -> EmitResult<()> {
        let config = self.inner.register_config();
        let [arg0, arg1, arg2] = stub_arguments(config);
        let asm = crb.asm_mut();
        asm.emit_enc(encoder::mov_rr(arg1, config.return_register(RegBank::GeneralPurpose)))?;
        asm.emit_enc(encoder::movq_rx(arg2, config.return_register(RegBank::Xmm)))?;
        // last, so the moves above cannot clobber it
        asm.emit_enc(encoder::mov_rr(arg0, config.frame_register()))?;
        self.inner.enter(crb)
    }

    fn leave(&self, crb: Crb<'_, '_>) -> EmitResult<()> {
        self.inner.leave(crb)
    }

    fn returned(&self, crb: Crb<'_, '_>) -> EmitResult<()> {
        self.inner.returned(crb)
    }
}

/// Frame of the stub that resumes execution after deoptimization. Runs on
/// the stack pointer handed over in the first argument register and
/// preserves the floating point return value passed in the third.
#[derive(Debug, Clone, Default)]
pub struct DeoptExitStubContext {
    inner: X64FrameContext,
}

impl DeoptExitStubContext {
    /// Saved return value plus padding keeping rsp 16-byte aligned.
    const SAVE_AREA: i32 = 16;

    pub fn new(config: RegisterConfig) -> Self {
        Self {
            inner: X64FrameContext::new(config),
        }
    }
}

impl FrameContext<X64Op> for DeoptExitStubContext {
    fn enter(&self, crb: Crb<'_, '_>) -> EmitResult<()> {
        let config = self.inner.register_config();
        let [arg0, _, arg2] = stub_arguments(config);
        let asm = crb.asm_mut();
        asm.emit_enc(encoder::mov_rr(config.frame_register(), arg0))?;
        asm.emit_enc(encoder::sub_ri(RSP, Self::SAVE_AREA))?;
        asm.store(RSP, 0, arg2)?;
        self.inner.enter(crb)
    }

    fn leave(&self, crb: Crb<'_, '_>) -> EmitResult<()> {
        self.inner.leave(crb)?;
        let config = self.inner.register_config();
        let asm = crb.asm_mut();
        asm.load(config.return_register(RegBank::Xmm), RSP, 0)?;
        asm.emit_enc(encoder::add_ri(RSP, Self::SAVE_AREA))?;
        Ok(())
    }

    fn returned(&self, crb: Crb<'_, '_>) -> EmitResult<()> {
        self.inner.returned(crb)
    }
}
