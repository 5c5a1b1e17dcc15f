//! lir-emit - code emission for a compiler backend.
//!
//! Turns a finalized, block-structured low-level IR (LIR) with physical
//! registers and a known frame layout into an executable code blob plus the
//! metadata a runtime needs to run, deoptimize and unwind through it.
//!
//! # Primary Usage
//!
//! ```ignore
//! use lir_emit::lir_text::parse_lir;
//! use lir_emit::x64::X64Backend;
//! use lir_emit::core::EmitOptions;
//!
//! let unit = parse_lir(&std::fs::read_to_string("fib.lir")?)?;
//! let backend = X64Backend::new(EmitOptions::from_env()).with_verification(true);
//! let result = unit.emit(&backend)?;
//! println!("{}", lir_emit::x64::disasm::disassemble(&result));
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Target independent infrastructure (LIR model, compilation
//!   result, data section, builder, conservative re-emission)
//! - [`x64`] - x86-64 encoder, assembler, frame contexts and instruction set
//! - [`lir_text`] - Textual LIR used by tests and the command line tool

pub mod core;
pub mod lir_text;
pub mod x64;

pub use self::core::{
    CompilationResult, CompilationResultBuilder, EmitError, EmitOptions, EmitResult, FrameMap,
    Lir, LirOp,
};
pub use x64::{StubKind, X64Backend, X64Op};
