// This module defines the architecture-neutral side of machine code assembly. The Assembler trait
// is what the compilation result builder needs from a target encoder: the current position,
// label binding, alignment padding, a halt instruction to terminate out-of-line code, a runtime
// call placeholder, reset for re-emission and a final close that resolves every outstanding
// fixup against the laid out data section. LabelTable implements the label bookkeeping shared by
// all targets: bound positions per label plus pending uses recorded at the offset of the field to
// patch. A use against an already bound label is patched immediately (backward branch); pending
// uses are patched when their label is bound (forward branch). Both paths range check the
// displacement against the field width and report BranchTargetOutOfBounds when it does not fit,
// which is what triggers the conservative re-emission.

//! Assembler abstraction and label fixup bookkeeping.

use log::trace;

use super::data::DataLayout;
use super::error::EncodingError;
use super::lir::Label;

/// Interface the compilation result builder drives.
pub trait Assembler {
    /// Offset at which the next byte is written.
    fn position(&self) -> u32;

    fn code(&self) -> &[u8];

    fn bind(&mut self, label: Label) -> Result<(), EncodingError>;

    fn label_position(&self, label: Label) -> Option<u32>;

    /// Pad with no-ops up to a multiple of `alignment`.
    fn align(&mut self, alignment: u32) -> Result<(), EncodingError>;

    /// Emit an instruction that stops execution if it is ever reached.
    fn halt(&mut self) -> Result<(), EncodingError>;

    /// Emit a call to a runtime routine whose address the loader fills in.
    /// Returns the offsets before and after the call instruction.
    fn runtime_call_placeholder(&mut self) -> Result<(u32, u32), EncodingError>;

    /// Resolve data references against `data` and return the final code.
    /// Fails if any referenced label was never bound.
    fn close(&mut self, data: &DataLayout) -> Result<Vec<u8>, EncodingError>;

    /// Drop all code, fixups and label bindings.
    fn reset(&mut self);
}

/// Encoding of a label reference field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// 8-bit pc-relative displacement.
    Rel8,
    /// 32-bit pc-relative displacement.
    Rel32,
    /// 32-bit offset of the target from a table base.
    TableEntry,
}

impl FixupKind {
    pub const fn bits(self) -> u8 {
        match self {
            FixupKind::Rel8 => 8,
            FixupKind::Rel32 | FixupKind::TableEntry => 32,
        }
    }
}

/// One reference to a label from the code buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelUse {
    /// Offset of the field to patch.
    pub at: u32,
    /// Displacement origin: end of the instruction for pc-relative
    /// kinds, table start for table entries.
    pub origin: u32,
    pub kind: FixupKind,
}

#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    positions: Vec<Option<u32>>,
    pending: Vec<(Label, LabelUse)>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self, label: Label) -> Option<u32> {
        self.positions.get(label.index()).copied().flatten()
    }

    pub fn bind(&mut self, label: Label, pos: u32, code: &mut [u8]) -> Result<(), EncodingError> {
        if self.position(label).is_some() {
            return Err(EncodingError::LabelAlreadyBound(label));
        }
        if self.positions.len() <= label.index() {
            self.positions.resize(label.index() + 1, None);
        }
        self.positions[label.index()] = Some(pos);
        trace!("bind {label} @ {pos}");

        let mut result = Ok(());
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].0 == label {
                let (_, use_) = self.pending.swap_remove(i);
                if result.is_ok() {
                    result = Self::patch(code, use_, pos);
                }
            } else {
                i += 1;
            }
        }
        result
    }

    /// Record a use of `label`, patching right away if it is bound.
    pub fn use_label(
        &mut self,
        label: Label,
        use_: LabelUse,
        code: &mut [u8],
    ) -> Result<(), EncodingError> {
        trace!("use {label} at {} ({:?})", use_.at, use_.kind);
        match self.position(label) {
            Some(target) => Self::patch(code, use_, target),
            None => {
                self.pending.push((label, use_));
                Ok(())
            }
        }
    }

    fn patch(code: &mut [u8], use_: LabelUse, target: u32) -> Result<(), EncodingError> {
        let displacement = target as i64 - use_.origin as i64;
        let at = use_.at as usize;
        let out_of_bounds = EncodingError::BranchTargetOutOfBounds {
            position: use_.at,
            displacement,
            bits: use_.kind.bits(),
        };
        match use_.kind {
            FixupKind::Rel8 => {
                let disp = i8::try_from(displacement).map_err(|_| out_of_bounds)?;
                code[at] = disp as u8;
            }
            FixupKind::Rel32 | FixupKind::TableEntry => {
                let disp = i32::try_from(displacement).map_err(|_| out_of_bounds)?;
                code[at..at + 4].copy_from_slice(&disp.to_le_bytes());
            }
        }
        Ok(())
    }

    /// First label that is still referenced but unbound.
    pub fn first_unresolved(&self) -> Option<Label> {
        self.pending.first().map(|(label, _)| *label)
    }

    pub fn reset(&mut self) {
        self.positions.clear();
        self.pending.clear();
    }
}
