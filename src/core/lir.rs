// This module holds the finalized low-level instruction representation (LIR) that code emission
// consumes. A Lir is an arena of basic blocks indexed by BlockId; deleted blocks are kept as
// tombstones so block ids stay stable. Each block owns its ordered instructions, a successor list
// with branch probabilities, an alignment request and a diagnostic frequency. The code emitting
// order is a separate list of block ids computed upstream. Slow paths are out-of-line instruction
// lists emitted after all blocks. Every block and slow path starts with a label-binding
// instruction created through LirOp::label, so label positions are discovered by walking
// instructions the same way for blocks and slow paths. Instruction ids are dense across the
// whole unit. LirOp is the seam between the architecture-neutral builder and the per-target
// closed set of instruction variants.

//! Block-structured low-level instruction representation.

use std::fmt;

use super::assembler::Assembler;
use super::builder::CompilationResultBuilder;
use super::error::EmitResult;

/// Symbolic code address, bound exactly once per emission pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);

impl Label {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Dense instruction index, unique across blocks and slow paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

impl InstId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlowPathId(pub u32);

/// Position in the source program an instruction was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourcePosition {
    pub method: String,
    pub bci: i32,
}

impl SourcePosition {
    pub fn new(method: impl Into<String>, bci: i32) -> Self {
        Self {
            method: method.into(),
            bci,
        }
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.method, self.bci)
    }
}

/// Runtime state description attached to calls, safepoints and faulting
/// instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugInfo {
    pub position: SourcePosition,
    /// Whether a full interpreter frame can be rebuilt at this point.
    pub has_frame: bool,
}

impl DebugInfo {
    pub fn new(position: SourcePosition, has_frame: bool) -> Self {
        Self {
            position,
            has_frame,
        }
    }
}

impl fmt::Display for DebugInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.position)?;
        if self.has_frame {
            write!(f, " [frame]")?;
        }
        Ok(())
    }
}

/// Per-instruction state an emitting instruction hands to the builder when
/// recording calls and exceptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LirFrameState {
    pub debug_info: Option<DebugInfo>,
    /// Handler block entry for an explicit exception edge.
    pub exception_edge: Option<Label>,
    pub valid_for_deoptimization: bool,
    /// Fault site inside a composite operation; its dispatch offset is
    /// resolved after the main code stream is emitted.
    pub lazy: bool,
}

impl LirFrameState {
    pub fn new(debug_info: Option<DebugInfo>) -> Self {
        Self {
            debug_info,
            exception_edge: None,
            valid_for_deoptimization: true,
            lazy: false,
        }
    }

    pub fn with_exception_edge(mut self, handler: Label) -> Self {
        self.exception_edge = Some(handler);
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    pub fn invalid_for_deoptimization(mut self) -> Self {
        self.valid_for_deoptimization = false;
        self
    }

    pub fn has_debug_info(&self) -> bool {
        self.debug_info.is_some()
    }
}

/// Directed control-flow edge between two blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelRef {
    pub source: BlockId,
    pub target: BlockId,
}

impl LabelRef {
    pub const fn new(source: BlockId, target: BlockId) -> Self {
        Self { source, target }
    }
}

impl fmt::Display for LabelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.target)
    }
}

/// One instruction of the closed per-architecture instruction set.
pub trait LirOp: fmt::Display + Sized {
    type Asm: Assembler;

    /// Instruction that binds `label` at its position.
    fn label(label: Label) -> Self;

    fn emit_code(&self, crb: &mut CompilationResultBuilder<'_, Self>) -> EmitResult<()>;

    /// Short class name used in diagnostics and error context.
    fn class_name(&self) -> &'static str;

    fn bound_label(&self) -> Option<Label> {
        None
    }

    /// Whether producing zero bytes is legitimate for this instruction.
    fn may_emit_nothing(&self) -> bool {
        self.bound_label().is_some()
    }
}

#[derive(Debug, Clone)]
pub struct LirInstruction<O> {
    pub id: InstId,
    pub op: O,
    pub position: Option<SourcePosition>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Successor {
    pub target: BlockId,
    pub probability: f64,
}

#[derive(Debug, Clone)]
pub struct Block<O> {
    pub id: BlockId,
    pub label: Label,
    pub successors: Vec<Successor>,
    /// Requests start-of-block alignment (loop headers).
    pub aligned: bool,
    pub relative_frequency: f64,
    pub ops: Vec<LirInstruction<O>>,
}

impl<O> Block<O> {
    pub fn has_successor(&self, target: BlockId) -> bool {
        self.successors.iter().any(|s| s.target == target)
    }
}

/// Out-of-line code emitted once after all blocks and never fallen into.
#[derive(Debug, Clone)]
pub struct SlowPath<O> {
    pub id: SlowPathId,
    pub label: Label,
    /// Instruction whose emission queued this slow path.
    pub origin: Option<(BlockId, InstId)>,
    pub ops: Vec<LirInstruction<O>>,
}

/// Where a new instruction is appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertPoint {
    Block(BlockId),
    SlowPath(SlowPathId),
}

/// Finalized LIR for one compilation unit.
#[derive(Debug, Clone)]
pub struct Lir<O> {
    name: String,
    blocks: Vec<Option<Block<O>>>,
    code_emitting_order: Vec<BlockId>,
    slow_paths: Vec<SlowPath<O>>,
    num_labels: u32,
    num_insts: u32,
}

impl<O: LirOp> Lir<O> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blocks: Vec::new(),
            code_emitting_order: Vec::new(),
            slow_paths: Vec::new(),
            num_labels: 0,
            num_insts: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label::new(self.num_labels);
        self.num_labels += 1;
        label
    }

    /// Append a block to the arena and to the end of the emitting order.
    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let label = self.new_label();
        let label_op = self.next_inst(O::label(label), None);
        self.blocks.push(Some(Block {
            id,
            label,
            successors: Vec::new(),
            aligned: false,
            relative_frequency: 1.0,
            ops: vec![label_op],
        }));
        self.code_emitting_order.push(id);
        id
    }

    pub fn add_slow_path(&mut self, origin: Option<(BlockId, InstId)>) -> SlowPathId {
        let id = SlowPathId(self.slow_paths.len() as u32);
        let label = self.new_label();
        let label_op = self.next_inst(O::label(label), None);
        self.slow_paths.push(SlowPath {
            id,
            label,
            origin,
            ops: vec![label_op],
        });
        id
    }

    fn next_inst(&mut self, op: O, position: Option<SourcePosition>) -> LirInstruction<O> {
        let id = InstId(self.num_insts);
        self.num_insts += 1;
        LirInstruction { id, op, position }
    }

    /// Append an instruction. Returns `None` when the insert point names a
    /// deleted or unknown block.
    pub fn push(&mut self, at: InsertPoint, op: O) -> Option<InstId> {
        self.push_with_position(at, op, None)
    }

    pub fn push_with_position(
        &mut self,
        at: InsertPoint,
        op: O,
        position: Option<SourcePosition>,
    ) -> Option<InstId> {
        let exists = match at {
            InsertPoint::Block(b) => self.block(b).is_some(),
            InsertPoint::SlowPath(s) => self.slow_paths.get(s.0 as usize).is_some(),
        };
        if !exists {
            return None;
        }
        let inst = self.next_inst(op, position);
        let id = inst.id;
        match at {
            InsertPoint::Block(b) => self.block_mut(b)?.ops.push(inst),
            InsertPoint::SlowPath(s) => self.slow_paths.get_mut(s.0 as usize)?.ops.push(inst),
        }
        Some(id)
    }

    pub fn set_successors(&mut self, block: BlockId, successors: &[(BlockId, f64)]) {
        if let Some(b) = self.block_mut(block) {
            b.successors = successors
                .iter()
                .map(|&(target, probability)| Successor {
                    target,
                    probability,
                })
                .collect();
        }
    }

    pub fn set_aligned(&mut self, block: BlockId, aligned: bool) {
        if let Some(b) = self.block_mut(block) {
            b.aligned = aligned;
        }
    }

    pub fn set_relative_frequency(&mut self, block: BlockId, frequency: f64) {
        if let Some(b) = self.block_mut(block) {
            b.relative_frequency = frequency;
        }
    }

    /// Replace the emitting order. Ids of deleted blocks may remain in it;
    /// emission skips them.
    pub fn set_code_emitting_order(&mut self, order: Vec<BlockId>) {
        self.code_emitting_order = order;
    }

    /// Tombstone a block. Its id is never reused.
    pub fn delete_block(&mut self, block: BlockId) {
        if let Some(slot) = self.blocks.get_mut(block.index()) {
            *slot = None;
        }
    }
}

impl<O> Lir<O> {
    pub fn block(&self, id: BlockId) -> Option<&Block<O>> {
        self.blocks.get(id.index()).and_then(Option::as_ref)
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut Block<O>> {
        self.blocks.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn is_block_deleted(&self, id: BlockId) -> bool {
        self.block(id).is_none()
    }

    pub fn block_label(&self, id: BlockId) -> Option<Label> {
        self.block(id).map(|b| b.label)
    }

    pub fn code_emitting_order(&self) -> &[BlockId] {
        &self.code_emitting_order
    }

    /// Live blocks in emitting order.
    pub fn emitted_blocks(&self) -> impl Iterator<Item = &Block<O>> + '_ {
        self.code_emitting_order
            .iter()
            .filter_map(move |&id| self.block(id))
    }

    pub fn slow_paths(&self) -> &[SlowPath<O>] {
        &self.slow_paths
    }

    pub fn slow_path_label(&self, id: SlowPathId) -> Option<Label> {
        self.slow_paths.get(id.0 as usize).map(|s| s.label)
    }

    /// Attach the instruction that branches into a slow path, for error
    /// context.
    pub fn set_slow_path_origin(&mut self, id: SlowPathId, origin: (BlockId, InstId)) {
        if let Some(slow_path) = self.slow_paths.get_mut(id.0 as usize) {
            slow_path.origin = Some(origin);
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_labels(&self) -> u32 {
        self.num_labels
    }

    pub fn num_instructions(&self) -> u32 {
        self.num_insts
    }
}
