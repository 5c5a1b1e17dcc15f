// This module describes the stack frame of the unit being emitted and the hook through which a
// target emits its prologue and epilogue. FrameMap is the finalized layout handed over by the
// register allocator: the frame size below the return address (spill slots, outgoing argument
// area and callee-saved save area, padded so the whole frame keeps the stack alignment), the list
// of callee-saved registers the unit must preserve and the size of the return address word.
// FrameContext is the per-target prologue/epilogue emitter with three one-shot callbacks: enter
// once at the start of the unit, then leave followed by returned on each exit path. The builder
// drives the callbacks through FramePhase so an out-of-order call is reported as a contract
// error instead of producing an unbalanced frame.

//! Frame layout and the prologue/epilogue hook.

use super::builder::CompilationResultBuilder;
use super::data::align_up;
use super::error::{EmitError, EmitResult};
use super::lir::LirOp;
use super::register::AsmReg;

/// Finalized frame layout of one compilation unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMap {
    /// Bytes reserved below the return address.
    frame_size: u32,
    return_address_size: u32,
    spill_size: u32,
    outgoing_arg_size: u32,
    callee_saved: Vec<AsmReg>,
}

impl FrameMap {
    pub const WORD_SIZE: u32 = 8;
    pub const STACK_ALIGNMENT: u32 = 16;

    /// Lay out a frame with `spill_size` bytes of spill slots and
    /// `outgoing_arg_size` bytes of outgoing stack arguments. A unit that
    /// needs no stack space at all reserves no frame.
    pub fn new(spill_size: u32, outgoing_arg_size: u32, callee_saved: Vec<AsmReg>) -> Self {
        let return_address_size = Self::WORD_SIZE;
        let save_area = callee_saved.len() as u32 * Self::WORD_SIZE;
        let raw = spill_size + outgoing_arg_size + save_area;
        let frame_size = if raw == 0 {
            0
        } else {
            align_up(raw + return_address_size, Self::STACK_ALIGNMENT) - return_address_size
        };
        Self {
            frame_size,
            return_address_size,
            spill_size,
            outgoing_arg_size,
            callee_saved,
        }
    }

    /// Frame with no slots at all; only the return address is on the stack.
    pub fn empty() -> Self {
        Self::new(0, 0, Vec::new())
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Frame size including the return address pushed by the caller.
    pub fn total_frame_size(&self) -> u32 {
        self.frame_size + self.return_address_size
    }

    pub fn spill_size(&self) -> u32 {
        self.spill_size
    }

    pub fn outgoing_arg_size(&self) -> u32 {
        self.outgoing_arg_size
    }

    pub fn has_callee_saved_registers(&self) -> bool {
        !self.callee_saved.is_empty()
    }

    pub fn callee_saved(&self) -> &[AsmReg] {
        &self.callee_saved
    }

    /// Stack-pointer relative offset of the save slot of the `index`th
    /// callee-saved register. Save slots sit at the top of the frame.
    pub fn callee_save_offset(&self, index: usize) -> i32 {
        (self.frame_size - (index as u32 + 1) * Self::WORD_SIZE) as i32
    }
}

/// Emits the target specific frame setup and teardown.
pub trait FrameContext<O: LirOp> {
    /// Reserve the frame, optionally poison it and save callee-saved
    /// registers.
    fn enter(&self, crb: &mut CompilationResultBuilder<'_, O>) -> EmitResult<()>;

    /// Mirror image of [`FrameContext::enter`], emitted before each return.
    fn leave(&self, crb: &mut CompilationResultBuilder<'_, O>) -> EmitResult<()>;

    /// Metadata hook marking where the epilogue logically ended.
    fn returned(&self, crb: &mut CompilationResultBuilder<'_, O>) -> EmitResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    NotEntered,
    Entered,
    Left,
    Returned,
}

impl FramePhase {
    pub fn on_enter(self) -> EmitResult<Self> {
        match self {
            FramePhase::NotEntered => Ok(FramePhase::Entered),
            other => Err(EmitError::contract(format!(
                "frame entered twice (phase {other:?})"
            ))),
        }
    }

    pub fn on_leave(self) -> EmitResult<Self> {
        match self {
            FramePhase::Entered | FramePhase::Returned => Ok(FramePhase::Left),
            other => Err(EmitError::contract(format!(
                "frame left in phase {other:?}"
            ))),
        }
    }

    pub fn on_returned(self) -> EmitResult<Self> {
        match self {
            FramePhase::Left => Ok(FramePhase::Returned),
            other => Err(EmitError::contract(format!(
                "return recorded in phase {other:?}"
            ))),
        }
    }
}
