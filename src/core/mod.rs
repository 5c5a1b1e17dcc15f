// This module is the architecture-neutral core of lir-emit. It holds everything the emission
// of a compilation unit needs that does not depend on a target instruction set: the LIR data
// model (blocks, labels, slow paths, frame states), the CompilationResult aggregate with its
// annotations, the data section and the process-wide constant interning table, the Assembler
// trait with shared label fixup bookkeeping, the frame layout and FrameContext hook, the label
// offset tracker, the CompilationResultBuilder state machine and the driver that performs the
// conservative re-emission. Targets plug in by providing an Assembler, a closed LirOp
// instruction set and a FrameContext.

//! Architecture-neutral code emission infrastructure.
//!
//! # Key Components
//!
//! ## LIR (`lir`)
//! - Tombstoned block arena with a separate code emitting order
//! - Slow paths emitted after all blocks
//! - The `LirOp` trait implemented by each target's instruction set
//!
//! ## Compilation Result (`result`)
//! - Code, data section and frame size
//! - Marks, calls, implicit exceptions, infopoints, exception handlers,
//!   source mappings, comments, jump tables, data patches
//!
//! ## Builder and Driver (`builder`, `driver`)
//! - Block-by-block emission state machine
//! - Data item deduplication
//! - Conservative retry after a branch range violation

pub mod assembler;
pub mod builder;
pub mod data;
pub mod driver;
pub mod error;
pub mod frame;
pub mod intern;
pub mod label_offsets;
pub mod lir;
pub mod options;
pub mod register;
pub mod result;

pub use assembler::{Assembler, FixupKind, LabelTable, LabelUse};
pub use builder::{CompilationResultBuilder, EmitState, InstructionVerifier};
pub use data::{Constant, DataAddress, DataLayout, DataRef, DataSection};
pub use driver::{emit_code, emit_pass, PassOutcome};
pub use error::{EmitError, EmitResult, EncodingError, ErrorContext};
pub use frame::{FrameContext, FrameMap, FramePhase};
pub use intern::ConstantTable;
pub use label_offsets::LabelOffsets;
pub use lir::{
    BlockId, DebugInfo, InsertPoint, InstId, Label, LabelRef, Lir, LirFrameState, LirOp,
    SourcePosition,
};
pub use options::{DumpLevel, EmitOptions};
pub use register::{AsmReg, RegBitSet};
pub use result::{CallTarget, CompilationResult, InfopointReason, MarkId};
