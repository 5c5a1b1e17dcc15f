//! x86-64 architecture-specific components.
//!
//! - Instruction encoding (`encoder`) and the assembler built on it
//! - System V register conventions and register configuration
//! - Frame contexts for methods and deoptimization stubs
//! - The closed LIR instruction set (`ops`)
//! - Decode-based instruction verification and annotated disassembly
//! - The backend entry point

pub mod assembler;
pub mod backend;
pub mod calling_convention;
pub mod disasm;
pub mod encoder;
pub mod frame;
pub mod ops;
pub mod verifier;

pub use assembler::X64Assembler;
pub use backend::{StubKind, X64Backend};
pub use calling_convention::{RegBank, RegisterConfig};
pub use encoder::Condition;
pub use frame::{DeoptEntryStubContext, DeoptExitStubContext, X64FrameContext};
pub use ops::{BinaryOp, Operand, X64Op};
pub use verifier::DecodeVerifier;
