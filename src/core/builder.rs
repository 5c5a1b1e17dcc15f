// This module implements CompilationResultBuilder, the orchestrator of code emission for one
// compilation unit. It owns the target Assembler and the CompilationResult being accumulated and
// borrows the finalized LIR, frame layout, frame context and options. emit_lir() walks the state
// machine Idle -> Prologue -> EmittingBlocks -> EmittingSlowPaths: the frame context emits the
// prologue, blocks are emitted in code emitting order (isolated loop headers get aligned), each
// instruction emits its bytes and calls back into the builder to record calls, marks, exception
// sites, infopoints and data references, and the queued slow paths are emitted afterwards, each
// terminated by a halt. finish() lays out the data section after the code, resolves the
// assembler's outstanding references, binds exception handler edges and closes the result
// (state Closed). Failures are classified on the way out of each instruction: range violations
// and bailouts pass through untouched, everything else becomes an internal error annotated with
// the block, instruction id, class name and printed instruction. Per-instruction verifiers check
// the bytes an instruction produced, skipping any jump table it appended. The builder also
// carries the label offset tracker that branch encoders consult, and the reset used by the
// conservative re-emission in the driver.

//! Compilation result builder.

use std::sync::Arc;

use hashbrown::HashMap;
use log::{debug, trace};

use super::assembler::Assembler;
use super::data::{Constant, DataAddress, DataRef};
use super::error::{EmitError, EmitResult};
use super::frame::{FrameContext, FrameMap, FramePhase};
use super::intern;
use super::label_offsets::LabelOffsets;
use super::lir::{
    Block, BlockId, DebugInfo, InstId, Label, LabelRef, Lir, LirFrameState, LirInstruction, LirOp,
    SlowPath, SourcePosition,
};
use super::options::EmitOptions;
use super::result::{
    BlockInfo, CallHandle, CallTarget, CompilationResult, InfopointReason, JumpTable, MarkHandle,
    MarkId,
};

/// Checks the machine code produced by a single instruction.
pub trait InstructionVerifier {
    /// `code` holds exactly the bytes of one instruction starting at
    /// `start`. An error message rejects them.
    fn verify(&self, class_name: &str, code: &[u8], start: u32) -> Result<(), String>;
}

/// Progress of the builder through one emission pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitState {
    Idle,
    Prologue,
    EmittingBlocks,
    EmittingSlowPaths,
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct ExceptionInfo {
    pc_offset: u32,
    handler: Label,
}

#[derive(Debug, Clone)]
struct PendingImplicitException {
    pc_offset: u32,
    debug_info: Option<DebugInfo>,
}

/// Runtime routine the dispatch stubs of lazily resolved implicit
/// exceptions call.
pub const IMPLICIT_EXCEPTION_STUB_TARGET: &str = "throw_implicit_exception";

pub struct CompilationResultBuilder<'a, O: LirOp> {
    asm: O::Asm,
    lir: &'a Lir<O>,
    frame_map: &'a FrameMap,
    frame_context: &'a dyn FrameContext<O>,
    options: &'a EmitOptions,
    result: CompilationResult,
    data_cache: HashMap<Arc<Constant>, DataRef>,
    verifiers: Vec<Box<dyn InstructionVerifier + 'a>>,
    label_offsets: LabelOffsets,
    state: EmitState,
    frame_phase: FramePhase,
    current_block_index: usize,
    current_inst: Option<InstId>,
    exception_infos: Vec<ExceptionInfo>,
    pending_implicit_exceptions: Vec<PendingImplicitException>,
    last_implicit_exception_offset: Option<u32>,
}

impl<'a, O: LirOp> CompilationResultBuilder<'a, O> {
    pub fn new(
        lir: &'a Lir<O>,
        frame_map: &'a FrameMap,
        frame_context: &'a dyn FrameContext<O>,
        asm: O::Asm,
        options: &'a EmitOptions,
    ) -> Self {
        let result = CompilationResult::new(lir.name())
            .with_total_frame_size(frame_map.total_frame_size());
        Self {
            asm,
            lir,
            frame_map,
            frame_context,
            options,
            result,
            data_cache: HashMap::new(),
            verifiers: Vec::new(),
            label_offsets: LabelOffsets::new(),
            state: EmitState::Idle,
            frame_phase: FramePhase::NotEntered,
            current_block_index: 0,
            current_inst: None,
            exception_infos: Vec::new(),
            pending_implicit_exceptions: Vec::new(),
            last_implicit_exception_offset: None,
        }
    }

    pub fn add_verifier(&mut self, verifier: Box<dyn InstructionVerifier + 'a>) {
        self.verifiers.push(verifier);
    }

    pub fn asm(&self) -> &O::Asm {
        &self.asm
    }

    pub fn asm_mut(&mut self) -> &mut O::Asm {
        &mut self.asm
    }

    pub fn position(&self) -> u32 {
        self.asm.position()
    }

    pub fn lir(&self) -> &'a Lir<O> {
        self.lir
    }

    pub fn frame_map(&self) -> &'a FrameMap {
        self.frame_map
    }

    pub fn options(&self) -> &'a EmitOptions {
        self.options
    }

    pub fn state(&self) -> EmitState {
        self.state
    }

    /// The result accumulated so far.
    pub fn result(&self) -> &CompilationResult {
        &self.result
    }

    /// Instruction currently being emitted.
    pub fn current_inst(&self) -> Option<InstId> {
        self.current_inst
    }

    pub fn set_total_frame_size(&mut self, size: u32) -> EmitResult<()> {
        self.result.set_total_frame_size(size)
    }

    pub fn set_min_data_section_item_alignment(&mut self, alignment: u32) -> EmitResult<()> {
        self.result.set_min_data_section_item_alignment(alignment)
    }

    pub fn record_mark(&mut self, pc_offset: u32, id: MarkId) -> EmitResult<MarkHandle> {
        self.result.record_mark(pc_offset, id)
    }

    /// Mark the current assembler position.
    pub fn record_mark_here(&mut self, id: MarkId) -> EmitResult<MarkHandle> {
        let pos = self.asm.position();
        self.result.record_mark(pos, id)
    }

    pub fn block_comment(&mut self, text: impl Into<String>) -> EmitResult<()> {
        let pos = self.asm.position();
        self.result.add_comment(pos, text)
    }

    /// Queue the exception edge of `state`, if any, for binding at finish.
    pub fn record_exception_handlers(
        &mut self,
        pc_offset: u32,
        state: Option<&LirFrameState>,
    ) -> EmitResult<()> {
        if let Some(handler) = state.and_then(|s| s.exception_edge) {
            self.exception_infos.push(ExceptionInfo { pc_offset, handler });
        }
        Ok(())
    }

    /// Record that the instruction at `pc_offset` may fault. Lazy states are
    /// resolved to an out-of-line dispatch stub after the slow paths.
    pub fn record_implicit_exception(
        &mut self,
        pc_offset: u32,
        state: &LirFrameState,
    ) -> EmitResult<()> {
        self.last_implicit_exception_offset = Some(pc_offset);
        if state.lazy {
            self.pending_implicit_exceptions
                .push(PendingImplicitException {
                    pc_offset,
                    debug_info: state.debug_info.clone(),
                });
            Ok(())
        } else {
            self.record_implicit_exception_at(pc_offset, pc_offset, state)
        }
    }

    pub fn record_implicit_exception_at(
        &mut self,
        pc_offset: u32,
        dispatch_offset: u32,
        state: &LirFrameState,
    ) -> EmitResult<()> {
        if state.exception_edge.is_some() {
            return Err(EmitError::contract(format!(
                "implicit exception at {pc_offset} also carries an explicit exception edge"
            )));
        }
        self.result
            .record_implicit_exception(pc_offset, dispatch_offset, state.debug_info.clone())
    }

    /// Offset passed to the last [`Self::record_implicit_exception`] call of
    /// the current pass.
    pub fn last_implicit_exception_offset(&self) -> Option<u32> {
        self.last_implicit_exception_offset
    }

    fn record_call(
        &mut self,
        pos_before: u32,
        pos_after: u32,
        target: CallTarget,
        state: Option<&LirFrameState>,
        direct: bool,
    ) -> EmitResult<CallHandle> {
        if pos_after <= pos_before {
            return Err(EmitError::contract(format!(
                "call range [{pos_before}, {pos_after}) is empty"
            )));
        }
        let debug_info = state.and_then(|s| s.debug_info.clone());
        let handle = self.result.record_call(
            pos_before,
            pos_after - pos_before,
            target,
            debug_info,
            direct,
        )?;
        if let Some(state) = state {
            let has_frame = state.debug_info.as_ref().is_some_and(|d| d.has_frame);
            if !state.valid_for_deoptimization && has_frame {
                self.result.set_invalid_for_deoptimization(handle)?;
            }
        }
        Ok(handle)
    }

    pub fn record_direct_call(
        &mut self,
        pos_before: u32,
        pos_after: u32,
        target: CallTarget,
        state: Option<&LirFrameState>,
    ) -> EmitResult<CallHandle> {
        self.record_call(pos_before, pos_after, target, state, true)
    }

    pub fn record_indirect_call(
        &mut self,
        pos_before: u32,
        pos_after: u32,
        target: CallTarget,
        state: Option<&LirFrameState>,
    ) -> EmitResult<CallHandle> {
        self.record_call(pos_before, pos_after, target, state, false)
    }

    /// Infopoints always need debug info.
    pub fn record_infopoint(
        &mut self,
        pos: u32,
        state: &LirFrameState,
        reason: InfopointReason,
    ) -> EmitResult<()> {
        let debug_info = state.debug_info.clone().ok_or_else(|| {
            EmitError::contract(format!("infopoint at {pos} without debug info"))
        })?;
        self.result.record_infopoint(pos, debug_info, reason)
    }

    pub fn record_source_mapping(
        &mut self,
        start: u32,
        end: u32,
        position: SourcePosition,
    ) -> EmitResult<()> {
        self.result.record_source_mapping(start, end, position)
    }

    pub fn add_jump_table(&mut self, table: JumpTable) -> EmitResult<()> {
        self.result.add_jump_table(table)
    }

    /// Data item for `constant`, shared by every request for an equal value
    /// during this compilation.
    pub fn create_data_item(&mut self, constant: Constant) -> EmitResult<DataRef> {
        let constant = intern::intern(constant);
        if let Some(&existing) = self.data_cache.get(&constant) {
            return Ok(existing);
        }
        let alignment = constant.natural_alignment();
        let reference = self
            .result
            .data_section_mut()?
            .insert(Arc::clone(&constant), alignment)?;
        trace!("new data item {reference}: {constant}");
        self.data_cache.insert(constant, reference);
        Ok(reference)
    }

    /// Reference a data item from the instruction about to be emitted.
    pub fn record_data_section_reference(&mut self, reference: DataRef) -> EmitResult<DataAddress> {
        let instruction_start = self.asm.position();
        self.result.record_data_patch(instruction_start, reference)?;
        Ok(DataAddress {
            reference,
            instruction_start,
        })
    }

    pub fn record_data_reference_in_code(
        &mut self,
        constant: Constant,
        alignment: u32,
    ) -> EmitResult<DataAddress> {
        debug!(
            "constant reference in code: pos = {}, data = {constant}",
            self.asm.position()
        );
        let reference = self.create_data_item(constant)?;
        self.record_data_item_reference(reference, alignment)
    }

    pub fn record_data_item_reference(
        &mut self,
        reference: DataRef,
        alignment: u32,
    ) -> EmitResult<DataAddress> {
        self.result
            .data_section_mut()?
            .update_alignment(reference, alignment)?;
        self.record_data_section_reference(reference)
    }

    /// Reference a raw byte blob. Blobs are never deduplicated.
    pub fn record_bytes_reference_in_code(
        &mut self,
        bytes: &[u8],
        alignment: u32,
    ) -> EmitResult<DataAddress> {
        debug!(
            "data reference in code: pos = {}, data = {bytes:?}",
            self.asm.position()
        );
        let constant = Arc::new(Constant::Bytes(bytes.into()));
        let reference = self.result.data_section_mut()?.insert(constant, alignment)?;
        self.record_data_section_reference(reference)
    }

    pub fn as_float_const_ref(&mut self, value: f32) -> EmitResult<DataAddress> {
        self.record_data_reference_in_code(Constant::float(value), 4)
    }

    pub fn as_double_const_ref(&mut self, value: f64) -> EmitResult<DataAddress> {
        self.record_data_reference_in_code(Constant::double(value), 8)
    }

    pub fn as_long_const_ref(&mut self, value: i64) -> EmitResult<DataAddress> {
        self.record_data_reference_in_code(Constant::Long(value), 8)
    }

    /// Label of a block, failing for deleted blocks.
    pub fn block_label(&self, block: BlockId) -> EmitResult<Label> {
        self.lir
            .block_label(block)
            .ok_or_else(|| EmitError::contract(format!("edge to deleted block {block}")))
    }

    /// Whether `edge` leaves the block being emitted for the block emitted
    /// right after it, so that falling through reaches the target.
    pub fn is_successor_edge(&self, edge: LabelRef) -> bool {
        let order = self.lir.code_emitting_order();
        if order.get(self.current_block_index) != Some(&edge.source) {
            return false;
        }
        order[self.current_block_index + 1..]
            .iter()
            .find(|&&id| !self.lir.is_block_deleted(id))
            .is_some_and(|&next| next == edge.target)
    }

    pub fn build_label_offsets(&mut self) {
        self.label_offsets = LabelOffsets::build(self.lir);
    }

    /// Whether `label` is bound fewer than `max_distance` instructions away
    /// from `inst`.
    pub fn label_within_range(&self, inst: InstId, label: Label, max_distance: u32) -> bool {
        self.label_offsets.within_range(inst, label, max_distance)
    }

    pub fn set_conservative_label_ranges(&mut self) {
        self.label_offsets.set_conservative();
    }

    pub fn uses_conservative_label_ranges(&self) -> bool {
        self.label_offsets.is_conservative()
    }

    /// Emit the epilogue through the frame context.
    pub fn leave_frame(&mut self) -> EmitResult<()> {
        self.frame_phase = self.frame_phase.on_leave()?;
        let frame_context = self.frame_context;
        frame_context.leave(self)
    }

    pub fn frame_returned(&mut self) -> EmitResult<()> {
        self.frame_phase = self.frame_phase.on_returned()?;
        let frame_context = self.frame_context;
        frame_context.returned(self)
    }

    /// Emit the whole unit: prologue, blocks in code emitting order, then
    /// slow paths.
    pub fn emit_lir(&mut self) -> EmitResult<()> {
        if self.state != EmitState::Idle {
            return Err(EmitError::contract(format!(
                "emit_lir called in state {:?}",
                self.state
            )));
        }
        self.current_block_index = 0;
        self.last_implicit_exception_offset = None;

        self.state = EmitState::Prologue;
        self.frame_phase = self.frame_phase.on_enter()?;
        let frame_context = self.frame_context;
        frame_context.enter(self)?;

        self.state = EmitState::EmittingBlocks;
        let lir = self.lir;
        let mut previous: Option<&Block<O>> = None;
        for (index, &block_id) in lir.code_emitting_order().iter().enumerate() {
            self.current_block_index = index;
            let Some(block) = lir.block(block_id) else {
                continue;
            };
            if block.aligned {
                if let Some(prev) = previous {
                    if !prev.has_successor(block.id) {
                        self.asm
                            .align(self.options.isolated_loop_header_alignment)?;
                    }
                }
            }
            let start = self.asm.position();
            self.emit_block(block)?;
            let end = self.asm.position();
            if self.options.print_block_info {
                self.result.add_block_info(BlockInfo {
                    id: block.id,
                    start,
                    end,
                    frequency: block.relative_frequency,
                    successors: block
                        .successors
                        .iter()
                        .map(|s| (s.target, s.probability))
                        .collect(),
                })?;
            }
            previous = Some(block);
        }

        self.state = EmitState::EmittingSlowPaths;
        for slow_path in lir.slow_paths() {
            self.emit_slow_path(slow_path).map_err(|e| {
                let what = match slow_path.origin {
                    Some((block, inst)) => format!("slow path for {block}@{inst} {}", slow_path.label),
                    None => format!("slow path {}", slow_path.label),
                };
                e.add_context("lir instruction", what)
            })?;
        }
        self.emit_implicit_exception_stubs()?;

        if self.frame_phase == FramePhase::Left {
            return Err(EmitError::internal(
                "epilogue emitted without a matching return",
            ));
        }
        self.current_block_index = 0;
        self.current_inst = None;
        self.last_implicit_exception_offset = None;
        Ok(())
    }

    fn emit_block(&mut self, block: &'a Block<O>) -> EmitResult<()> {
        let emit_comment = self.options.emit_lir_comments();
        if emit_comment {
            self.block_comment(format!("block {}", block.id))?;
        }
        for inst in &block.ops {
            if emit_comment {
                self.block_comment(format!("{} {}", inst.id, inst.op))?;
            }
            self.emit_op(inst).map_err(|e| {
                e.add_context("block", block.id.to_string())
                    .add_context("instruction id", inst.id.to_string())
                    .add_context("instruction class", inst.op.class_name())
                    .add_context(
                        "lir instruction",
                        format!("{}@{} {} {}", block.id, inst.id, inst.op.class_name(), inst.op),
                    )
            })?;
        }
        Ok(())
    }

    fn emit_slow_path(&mut self, slow_path: &'a SlowPath<O>) -> EmitResult<()> {
        debug!("emitting slow path {} at {}", slow_path.label, self.asm.position());
        for inst in &slow_path.ops {
            self.emit_op(inst)?;
        }
        // control never reaches past a slow path
        self.asm.halt()?;
        Ok(())
    }

    fn emit_op(&mut self, inst: &'a LirInstruction<O>) -> EmitResult<()> {
        let start = self.asm.position();
        self.current_inst = Some(inst.id);
        inst.op.emit_code(self).map_err(EmitError::into_internal)?;
        let mut end = self.asm.position();

        if end == start && !inst.op.may_emit_nothing() {
            return Err(EmitError::internal(format!(
                "{} emitted no code",
                inst.op.class_name()
            )));
        }
        if let Some(position) = &inst.position {
            self.record_source_mapping(start, end, position.clone())?;
        }
        if !self.verifiers.is_empty() && start < end {
            for table in self.result.jump_tables() {
                if table.position >= start && table.position < end {
                    end = table.position;
                }
            }
            let code = &self.asm.code()[start as usize..end as usize];
            for verifier in &self.verifiers {
                verifier
                    .verify(inst.op.class_name(), code, start)
                    .map_err(|message| {
                        EmitError::internal(format!("instruction verification failed: {message}"))
                    })?;
            }
        }
        Ok(())
    }

    /// Give each lazily recorded implicit exception a dispatch stub that
    /// calls the runtime and never returns.
    fn emit_implicit_exception_stubs(&mut self) -> EmitResult<()> {
        let pending = std::mem::take(&mut self.pending_implicit_exceptions);
        for exception in pending {
            let stub = self.asm.position();
            let (before, after) = self.asm.runtime_call_placeholder()?;
            let state = LirFrameState::new(exception.debug_info);
            self.record_direct_call(
                before,
                after,
                CallTarget::Runtime(IMPLICIT_EXCEPTION_STUB_TARGET.to_string()),
                Some(&state),
            )?;
            self.asm.halt()?;
            self.record_implicit_exception_at(exception.pc_offset, stub, &state)?;
        }
        Ok(())
    }

    /// Install code and data, bind exception handlers and close the result.
    pub fn finish(&mut self) -> EmitResult<()> {
        if self.state != EmitState::EmittingSlowPaths {
            return Err(EmitError::contract(format!(
                "finish called in state {:?}",
                self.state
            )));
        }
        let code_size = self.asm.position();
        let layout = self
            .result
            .data_section()
            .layout(code_size, self.result.min_data_section_item_alignment());
        let code = self.asm.close(&layout).map_err(|e| EmitError::from(e).into_internal())?;
        let data = self.result.data_section().build(&layout);
        self.result.set_target_code(code, data, layout)?;

        for info in std::mem::take(&mut self.exception_infos) {
            let handler_pos = self.asm.label_position(info.handler).ok_or_else(|| {
                EmitError::internal(format!(
                    "exception handler {} of {} was never bound",
                    info.handler, info.pc_offset
                ))
            })?;
            self.result.record_exception_handler(info.pc_offset, handler_pos)?;
        }

        self.result.close()?;
        self.state = EmitState::Closed;
        debug!(
            "closed {}: {} bytes code, {} bytes data, {} calls",
            self.result.name(),
            self.result.code_size(),
            self.result.data().len(),
            self.result.calls().len()
        );
        Ok(())
    }

    /// Throw away everything emitted so far so the unit can be emitted again.
    /// Conservative mode and the label offsets survive.
    pub fn reset_for_emitting_code(&mut self) {
        self.asm.reset();
        self.result.reset_for_emitting_code();
        self.exception_infos.clear();
        self.pending_implicit_exceptions.clear();
        self.data_cache.clear();
        self.current_block_index = 0;
        self.current_inst = None;
        self.last_implicit_exception_offset = None;
        self.frame_phase = FramePhase::NotEntered;
        self.state = EmitState::Idle;
    }

    /// The closed result. Fails unless [`Self::finish`] succeeded.
    pub fn into_result(self) -> EmitResult<CompilationResult> {
        if self.state != EmitState::Closed {
            return Err(EmitError::contract(format!(
                "no compilation result in state {:?}",
                self.state
            )));
        }
        Ok(self.result)
    }
}
