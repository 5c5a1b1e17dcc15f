//! Tests driving the compilation result builder directly.

use lir_emit::core::builder::{CompilationResultBuilder, EmitState, InstructionVerifier};
use lir_emit::core::driver::{emit_code, emit_pass, PassOutcome};
use lir_emit::core::lir::{
    DebugInfo, InsertPoint, LabelRef, Lir, LirFrameState, SourcePosition,
};
use lir_emit::core::{Constant, EmitError, EmitOptions, FrameMap};
use lir_emit::x64::encoder::{R11, RAX, RBX, RDI};
use lir_emit::x64::{
    Condition, DecodeVerifier, RegisterConfig, X64Assembler, X64FrameContext, X64Op,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// b0: load, call, branch; b1: ret; b2: ret
fn sample_lir() -> Lir<X64Op> {
    let mut lir = Lir::new("sample");
    let b0 = lir.add_block();
    let b1 = lir.add_block();
    let b2 = lir.add_block();
    lir.set_successors(b0, &[(b1, 0.5), (b2, 0.5)]);
    let state = LirFrameState::new(Some(DebugInfo::new(SourcePosition::new("sample", 3), true)));

    lir.push(
        InsertPoint::Block(b0),
        X64Op::LoadConst {
            dst: RAX,
            constant: Constant::double(2.0),
        },
    );
    lir.push(
        InsertPoint::Block(b0),
        X64Op::Load {
            dst: RAX,
            base: RDI,
            disp: 8,
            state: Some(state.clone()),
        },
    );
    lir.push(
        InsertPoint::Block(b0),
        X64Op::DirectCall {
            target: "callee".into(),
            state: Some(state),
        },
    );
    lir.push(
        InsertPoint::Block(b0),
        X64Op::Branch {
            cond: Condition::Equal,
            true_dest: LabelRef::new(b0, b2),
            false_dest: LabelRef::new(b0, b1),
            true_probability: 0.5,
        },
    );
    lir.push(InsertPoint::Block(b1), X64Op::Return);
    lir.push(InsertPoint::Block(b2), X64Op::Return);
    lir
}

#[test]
fn test_reset_then_emit_again_is_identical() {
    init_logging();
    let lir = sample_lir();
    let frame = FrameMap::new(0, 0, vec![RBX]);
    let context = X64FrameContext::new(RegisterConfig::new());
    let options = EmitOptions::default();
    let mut crb =
        CompilationResultBuilder::new(&lir, &frame, &context, X64Assembler::new(), &options);
    crb.build_label_offsets();

    assert_eq!(emit_pass(&mut crb).unwrap(), PassOutcome::Complete);
    assert_eq!(crb.state(), EmitState::Closed);
    let first_code = crb.result().code().to_vec();
    let first_calls = crb.result().calls().to_vec();
    let first_marks = crb.result().marks().to_vec();

    crb.reset_for_emitting_code();
    assert_eq!(crb.state(), EmitState::Idle);
    assert!(crb.result().code().is_empty());
    assert!(crb.result().data_section().is_empty());

    assert_eq!(emit_pass(&mut crb).unwrap(), PassOutcome::Complete);
    let result = crb.into_result().unwrap();
    assert_eq!(result.total_frame_size(), frame.total_frame_size());
    assert_eq!(result.code(), first_code.as_slice());
    assert_eq!(result.calls(), first_calls.as_slice());
    assert_eq!(result.marks(), first_marks.as_slice());
    assert_eq!(result.data_section().len(), 1);
    assert_eq!(result.implicit_exceptions().len(), 1);
}

#[test]
fn test_emit_lir_twice_without_reset_is_rejected() {
    let lir = sample_lir();
    let frame = FrameMap::empty();
    let context = X64FrameContext::new(RegisterConfig::new());
    let options = EmitOptions::default();
    let mut crb =
        CompilationResultBuilder::new(&lir, &frame, &context, X64Assembler::new(), &options);
    crb.emit_lir().unwrap();
    assert!(matches!(crb.emit_lir(), Err(EmitError::Contract(_))));
}

#[test]
fn test_into_result_before_finish_is_rejected() {
    let lir = sample_lir();
    let frame = FrameMap::empty();
    let context = X64FrameContext::new(RegisterConfig::new());
    let options = EmitOptions::default();
    let mut crb =
        CompilationResultBuilder::new(&lir, &frame, &context, X64Assembler::new(), &options);
    crb.emit_lir().unwrap();
    assert!(crb.into_result().is_err());
}

#[test]
fn test_saving_a_caller_saved_register_is_rejected() {
    let lir = sample_lir();
    let frame = FrameMap::new(0, 0, vec![R11]);
    let context = X64FrameContext::new(RegisterConfig::new());
    let options = EmitOptions::default();
    let crb = CompilationResultBuilder::new(&lir, &frame, &context, X64Assembler::new(), &options);
    match emit_code(crb) {
        Err(EmitError::Contract(message)) => assert!(message.contains("r11"), "{message}"),
        other => panic!("expected a contract error, got {other:?}"),
    }
}

struct RejectCalls;

impl InstructionVerifier for RejectCalls {
    fn verify(&self, class_name: &str, _code: &[u8], start: u32) -> Result<(), String> {
        if class_name == "DirectCall" {
            Err(format!("call at {start:#x} rejected"))
        } else {
            Ok(())
        }
    }
}

#[test]
fn test_verifier_failure_carries_instruction_context() {
    init_logging();
    let lir = sample_lir();
    let frame = FrameMap::empty();
    let context = X64FrameContext::new(RegisterConfig::new());
    let options = EmitOptions::default();
    let mut crb =
        CompilationResultBuilder::new(&lir, &frame, &context, X64Assembler::new(), &options);
    crb.add_verifier(Box::new(DecodeVerifier::new()));
    crb.add_verifier(Box::new(RejectCalls));

    let err = emit_code(crb).unwrap_err();
    assert!(
        err.to_string().contains("instruction verification failed: call at"),
        "{err}"
    );
    let context = err.context().unwrap();
    assert_eq!(context.get("block"), Some("B0"));
    assert_eq!(context.get("instruction class"), Some("DirectCall"));
    assert!(context.get("lir instruction").unwrap().contains("call callee"));
}

#[test]
fn test_slow_path_failure_names_its_origin() {
    let mut lir = Lir::new("slow");
    let b0 = lir.add_block();
    let slow = lir.add_slow_path(None);
    let target = lir.slow_path_label(slow).unwrap();
    let branch = lir
        .push(
            InsertPoint::Block(b0),
            X64Op::BranchTo {
                cond: Condition::Equal,
                target,
            },
        )
        .unwrap();
    lir.push(InsertPoint::Block(b0), X64Op::Return);
    lir.set_slow_path_origin(slow, (b0, branch));
    lir.push(InsertPoint::SlowPath(slow), X64Op::Nop(0));

    let frame = FrameMap::empty();
    let context = X64FrameContext::new(RegisterConfig::new());
    let options = EmitOptions::default();
    let crb = CompilationResultBuilder::new(&lir, &frame, &context, X64Assembler::new(), &options);
    let err = emit_code(crb).unwrap_err();
    let text = err.context().unwrap().get("lir instruction").unwrap().to_string();
    assert!(text.starts_with(&format!("slow path for B0@{branch}")), "{text}");
}
