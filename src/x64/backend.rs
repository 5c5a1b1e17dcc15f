// This module is the x86-64 entry point of lir-emit. X64Backend pairs a finalized LIR with its
// frame layout and emits it into a CompilationResult: it picks the frame context for the kind of
// code being compiled (a regular method or one of the deoptimization stubs), creates the
// compilation result builder over a fresh X64Assembler, installs the decoding verifier when
// requested and runs the driver, which performs the single conservative re-emission if a short
// branch turns out to be out of range.

//! x86-64 backend.

use log::debug;

use crate::core::builder::CompilationResultBuilder;
use crate::core::driver;
use crate::core::error::EmitResult;
use crate::core::frame::{FrameContext, FrameMap};
use crate::core::lir::Lir;
use crate::core::options::EmitOptions;
use crate::core::result::CompilationResult;

use super::assembler::X64Assembler;
use super::calling_convention::RegisterConfig;
use super::frame::{DeoptEntryStubContext, DeoptExitStubContext, X64FrameContext};
use super::ops::X64Op;
use super::verifier::DecodeVerifier;

/// Kind of code unit, selecting the frame context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StubKind {
    #[default]
    Method,
    DeoptEntry,
    DeoptExit,
}

pub struct X64Backend {
    config: RegisterConfig,
    options: EmitOptions,
    verify: bool,
}

impl X64Backend {
    pub fn new(options: EmitOptions) -> Self {
        Self {
            config: RegisterConfig::new(),
            options,
            verify: false,
        }
    }

    /// Decode every instruction right after it is emitted.
    pub fn with_verification(mut self, enabled: bool) -> Self {
        self.verify = enabled;
        self
    }

    pub fn options(&self) -> &EmitOptions {
        &self.options
    }

    pub fn register_config(&self) -> &RegisterConfig {
        &self.config
    }

    fn frame_context(&self, kind: StubKind) -> Box<dyn FrameContext<X64Op>> {
        match kind {
            StubKind::Method => Box::new(X64FrameContext::new(self.config.clone())),
            StubKind::DeoptEntry => Box::new(DeoptEntryStubContext::new(self.config.clone())),
            StubKind::DeoptExit => Box::new(DeoptExitStubContext::new(self.config.clone())),
        }
    }

    /// Emit `lir` with the frame described by `frame_map`.
    pub fn emit(
        &self,
        lir: &Lir<X64Op>,
        frame_map: &FrameMap,
        kind: StubKind,
    ) -> EmitResult<CompilationResult> {
        debug!(
            "emitting {} ({kind:?}): {} blocks, {} slow paths, frame {}",
            lir.name(),
            lir.num_blocks(),
            lir.slow_paths().len(),
            frame_map.total_frame_size()
        );
        let frame_context = self.frame_context(kind);
        let mut crb = CompilationResultBuilder::new(
            lir,
            frame_map,
            frame_context.as_ref(),
            X64Assembler::new(),
            &self.options,
        );
        if self.verify {
            crb.add_verifier(Box::new(DecodeVerifier::new()));
        }
        driver::emit_code(crb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lir::InsertPoint;
    use crate::core::result::MarkId;
    use crate::x64::encoder::RBX;

    fn single_return(name: &str) -> Lir<X64Op> {
        let mut lir = Lir::new(name);
        let b0 = lir.add_block();
        lir.push(InsertPoint::Block(b0), X64Op::Return);
        lir
    }

    #[test]
    fn test_method_frame_marks() {
        let lir = single_return("m");
        let frame = FrameMap::new(16, 0, vec![RBX]);
        let result = X64Backend::new(EmitOptions::default())
            .with_verification(true)
            .emit(&lir, &frame, StubKind::Method)
            .unwrap();
        // sub rsp, 24; mov [rsp+16], rbx
        assert_eq!(result.mark_offset(&MarkId::PrologueDecdRsp), Some(4));
        assert_eq!(result.mark_offset(&MarkId::PrologueEnd), Some(9));
        assert_eq!(result.mark_offset(&MarkId::EpilogueStart), Some(9));
        assert_eq!(result.mark_offset(&MarkId::EpilogueIncdRsp), Some(18));
        assert_eq!(result.mark_offset(&MarkId::EpilogueEnd), Some(18));
        assert_eq!(result.code().last(), Some(&0xC3));
        assert_eq!(result.total_frame_size(), 32);
    }

    #[test]
    fn test_deopt_stub_prologues() {
        let lir = single_return("stub");
        let frame = FrameMap::empty();
        let backend = X64Backend::new(EmitOptions::default());

        let entry = backend.emit(&lir, &frame, StubKind::DeoptEntry).unwrap();
        // mov rsi, rax; movq rdx, xmm0; mov rdi, rsp
        assert_eq!(
            &entry.code()[..11],
            &[0x48, 0x89, 0xC6, 0x66, 0x48, 0x0F, 0x7E, 0xC2, 0x48, 0x89, 0xE7]
        );

        let exit = backend.emit(&lir, &frame, StubKind::DeoptExit).unwrap();
        // mov rsp, rdi; sub rsp, 16; mov [rsp], rdx
        assert_eq!(
            &exit.code()[..11],
            &[0x48, 0x89, 0xFC, 0x48, 0x83, 0xEC, 0x10, 0x48, 0x89, 0x14, 0x24]
        );
        // movsd xmm0, [rsp]; add rsp, 16; ret
        let tail = &exit.code()[exit.code().len() - 10..];
        assert_eq!(
            tail,
            &[0xF2, 0x0F, 0x10, 0x04, 0x24, 0x48, 0x83, 0xC4, 0x10, 0xC3]
        );
    }
}
