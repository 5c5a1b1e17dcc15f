//! Textual LIR for tests and the command line driver.
//!
//! A small line-oriented format that describes one x86-64 compilation unit
//! without going through a register allocator. Registers are physical,
//! blocks and slow paths are named, and frame states are written inline.
//!
//! # Format
//!
//! ```text
//! ; Comments start with semicolon
//! unit fib
//! frame spill=16 outgoing=0 saved=rbx
//! stub method
//!
//! block entry -> loop 0.9, exit 0.1 freq=1.0:
//!     cmp rdi, 0
//!     branch e exit loop 0.1
//! block loop -> loop 0.9, exit 0.1 aligned:
//!     load rax, [rdi+8] { at fib@4 frame }
//!     call helper { at fib@7 frame handler=exit }   !fib@7
//!     sub rdi, 1
//!     branchto l deopt
//!     jump loop
//! block exit:
//!     ret
//! slowpath deopt:
//!     rtcall uncommon_trap { at fib@9 frame }
//!     halt
//! ```
//!
//! Blocks are emitted in declaration order unless an `order` line names
//! the order explicitly. `delete` tombstones a block after parsing; the
//! block keeps its place in the emitting order and is skipped.

use std::collections::HashMap;

use crate::core::error::EmitResult;
use crate::core::frame::FrameMap;
use crate::core::lir::{BlockId, Lir};
use crate::core::result::CompilationResult;
use crate::x64::backend::{StubKind, X64Backend};
use crate::x64::ops::X64Op;

pub mod parser;

pub use parser::parse_lir;

/// A parsed compilation unit.
pub struct LirUnit {
    pub lir: Lir<X64Op>,
    pub frame: FrameMap,
    pub kind: StubKind,
    pub block_names: HashMap<String, BlockId>,
}

impl LirUnit {
    pub fn block(&self, name: &str) -> Option<BlockId> {
        self.block_names.get(name).copied()
    }

    pub fn emit(&self, backend: &X64Backend) -> EmitResult<CompilationResult> {
        backend.emit(&self.lir, &self.frame, self.kind)
    }
}
