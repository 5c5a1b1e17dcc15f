// This module implements X64Assembler, the x86-64 Assembler the compilation result builder
// drives. It encodes iced-x86 instructions at the current position, appends them to a flat code
// buffer and keeps the two kinds of outstanding references an emission pass can leave behind:
// label uses (branches and jump table entries) tracked by the shared LabelTable, and RIP-relative
// data references whose displacement is only known once the data section has been laid out
// after the code. Instructions with a pc-relative field are encoded so the field starts out zero;
// the label table or close() writes the real value. Branch helpers come in a short (rel8) and a
// near (rel32) flavor; the caller decides which one to use from the label offset estimates, and
// a short branch whose target turns out to be too far is reported as BranchTargetOutOfBounds by
// the label table. close() patches every data reference against the final layout and rejects
// code that still references an unbound label.

//! x86-64 assembler with label and data fixups.

use iced_x86::Instruction;
use log::trace;

use crate::core::assembler::{Assembler, FixupKind, LabelTable, LabelUse};
use crate::core::data::{DataAddress, DataLayout, DataRef};
use crate::core::error::EncodingError;
use crate::core::lir::Label;
use crate::core::register::AsmReg;

use super::encoder::{self, Condition, EncodedInst, Mem};

#[derive(Debug, Clone, Copy)]
struct DataFixup {
    /// Offset of the disp32 field.
    at: u32,
    /// End of the referencing instruction, the base of RIP addressing.
    next_pc: u32,
    reference: DataRef,
}

#[derive(Debug, Clone, Default)]
pub struct X64Assembler {
    code: Vec<u8>,
    labels: LabelTable,
    data_fixups: Vec<DataFixup>,
}

impl X64Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `inst` at the current position and return its start offset.
    pub fn emit(&mut self, inst: Instruction) -> Result<u32, EncodingError> {
        let start = self.position();
        let encoded = encoder::encode(&inst, start as u64)?;
        self.code.extend_from_slice(encoded.as_slice());
        Ok(start)
    }

    /// Fallible encodings go through here so callers can use `?` once.
    pub fn emit_enc(
        &mut self,
        inst: Result<Instruction, EncodingError>,
    ) -> Result<u32, EncodingError> {
        self.emit(inst?)
    }

    /// Emit an instruction with a pc-relative field that is patched later.
    /// `build` receives the absolute target; it is called once to size the
    /// instruction and once more with the target that encodes as zero.
    pub fn emit_relative(
        &mut self,
        build: impl Fn(u64) -> Result<Instruction, EncodingError>,
    ) -> Result<EncodedInst, EncodingError> {
        let ip = self.position() as u64;
        let len = encoder::encode(&build(ip)?, ip)?.len() as u64;
        let encoded = encoder::encode(&build(ip + len)?, ip)?;
        self.code.extend_from_slice(encoded.as_slice());
        Ok(encoded)
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Overwrite four already emitted bytes.
    pub fn patch_i32(&mut self, at: u32, value: i32) {
        let at = at as usize;
        self.code[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn use_label(&mut self, label: Label, kind: FixupKind) -> Result<(), EncodingError> {
        let end = self.position();
        let at = end - u32::from(kind.bits() / 8);
        self.labels
            .use_label(label, LabelUse { at, origin: end, kind }, &mut self.code)
    }

    /// Unconditional jump; `short` selects the rel8 encoding.
    pub fn jmp(&mut self, label: Label, short: bool) -> Result<(), EncodingError> {
        if short {
            self.emit_relative(encoder::jmp_rel8)?;
            self.use_label(label, FixupKind::Rel8)
        } else {
            self.emit_relative(encoder::jmp_rel32)?;
            self.use_label(label, FixupKind::Rel32)
        }
    }

    /// Conditional jump; `short` selects the rel8 encoding.
    pub fn jcc(&mut self, cond: Condition, label: Label, short: bool) -> Result<(), EncodingError> {
        if short {
            self.emit_relative(|target| encoder::jcc_rel8(cond, target))?;
            self.use_label(label, FixupKind::Rel8)
        } else {
            self.emit_relative(|target| encoder::jcc_rel32(cond, target))?;
            self.use_label(label, FixupKind::Rel32)
        }
    }

    /// Emit a table entry holding the offset of `label` from `table_start`.
    pub fn table_entry(&mut self, label: Label, table_start: u32) -> Result<(), EncodingError> {
        let at = self.position();
        self.code.extend_from_slice(&[0; 4]);
        self.labels.use_label(
            label,
            LabelUse {
                at,
                origin: table_start,
                kind: FixupKind::TableEntry,
            },
            &mut self.code,
        )
    }

    /// `lea dst, [rip + label]`.
    pub fn lea_label(&mut self, dst: AsmReg, label: Label) -> Result<(), EncodingError> {
        self.emit_relative(|target| encoder::lea_r_rip(dst, target))?;
        self.use_label(label, FixupKind::Rel32)
    }

    /// Emit a RIP-relative instruction whose disp32 addresses a data item.
    /// `address.instruction_start` must be the current position.
    pub fn emit_data_ref(
        &mut self,
        build: impl Fn(u64) -> Result<Instruction, EncodingError>,
        address: DataAddress,
    ) -> Result<(), EncodingError> {
        debug_assert_eq!(address.instruction_start, self.position());
        let start = self.position();
        let encoded = self.emit_relative(build)?;
        let offset = encoded.displacement_offset().ok_or_else(|| {
            EncodingError::Assembly("data reference without a memory displacement".into())
        })?;
        self.data_fixups.push(DataFixup {
            at: start + offset,
            next_pc: self.position(),
            reference: address.reference,
        });
        Ok(())
    }

    /// `call rel32` whose target the loader patches.
    pub fn call_placeholder(&mut self) -> Result<(u32, u32), EncodingError> {
        let before = self.position();
        self.emit_relative(encoder::call_rel32)?;
        Ok((before, self.position()))
    }

    pub fn call_reg(&mut self, target: AsmReg) -> Result<(u32, u32), EncodingError> {
        let before = self.emit_enc(encoder::call_r(target))?;
        Ok((before, self.position()))
    }

    /// Load a 64-bit register from `[base + disp]`.
    pub fn load(&mut self, dst: AsmReg, base: AsmReg, disp: i32) -> Result<u32, EncodingError> {
        let mem = Mem::base_disp(base, disp)?;
        if dst.is_fp() {
            self.emit_enc(encoder::movsd_xm(dst, mem))
        } else {
            self.emit_enc(encoder::mov_rm(dst, mem))
        }
    }

    /// Store a 64-bit register to `[base + disp]`.
    pub fn store(&mut self, base: AsmReg, disp: i32, src: AsmReg) -> Result<u32, EncodingError> {
        let mem = Mem::base_disp(base, disp)?;
        if src.is_fp() {
            self.emit_enc(encoder::movsd_mx(mem, src))
        } else {
            self.emit_enc(encoder::mov_mr(mem, src))
        }
    }

    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.emit(encoder::ret()).map(drop)
    }

    pub fn int3(&mut self) -> Result<(), EncodingError> {
        self.emit(encoder::int3()).map(drop)
    }

    pub fn nop(&mut self, count: usize) {
        encoder::nops(count, &mut self.code);
    }

    /// Offset at which `label` is bound, if it is.
    pub fn bound_position(&self, label: Label) -> Option<u32> {
        self.labels.position(label)
    }
}

impl Assembler for X64Assembler {
    fn position(&self) -> u32 {
        self.code.len() as u32
    }

    fn code(&self) -> &[u8] {
        &self.code
    }

    fn bind(&mut self, label: Label) -> Result<(), EncodingError> {
        let pos = self.position();
        self.labels.bind(label, pos, &mut self.code)
    }

    fn label_position(&self, label: Label) -> Option<u32> {
        self.labels.position(label)
    }

    fn align(&mut self, alignment: u32) -> Result<(), EncodingError> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(EncodingError::InvalidAlignment(alignment));
        }
        let misalignment = self.position() % alignment;
        if misalignment != 0 {
            self.nop((alignment - misalignment) as usize);
        }
        Ok(())
    }

    fn halt(&mut self) -> Result<(), EncodingError> {
        self.emit(encoder::hlt()).map(drop)
    }

    fn runtime_call_placeholder(&mut self) -> Result<(u32, u32), EncodingError> {
        self.call_placeholder()
    }

    fn close(&mut self, data: &DataLayout) -> Result<Vec<u8>, EncodingError> {
        if let Some(label) = self.labels.first_unresolved() {
            return Err(EncodingError::UnboundLabel(label));
        }
        for fixup in &self.data_fixups {
            let target = data.address_of(fixup.reference).ok_or_else(|| {
                EncodingError::ImmediateOutOfRange {
                    value: fixup.reference.index() as i64,
                    operation: "data reference",
                }
            })?;
            let disp = target as i64 - fixup.next_pc as i64;
            let disp = i32::try_from(disp).map_err(|_| EncodingError::ImmediateOutOfRange {
                value: disp,
                operation: "rip-relative displacement",
            })?;
            trace!("data {} @ {} -> {disp:+}", fixup.reference, fixup.at);
            let at = fixup.at as usize;
            self.code[at..at + 4].copy_from_slice(&disp.to_le_bytes());
        }
        Ok(self.code.clone())
    }

    fn reset(&mut self) {
        self.code.clear();
        self.labels.reset();
        self.data_fixups.clear();
    }
}
