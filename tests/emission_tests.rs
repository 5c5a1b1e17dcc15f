//! End-to-end emission of textual LIR units on x86-64.
//!
//! Each test parses a small unit, emits it with instruction verification
//! on and checks the code bytes and metadata of the closed result.

use iced_x86::{Decoder, DecoderOptions, Mnemonic, OpKind};

use lir_emit::core::result::{CallTarget, MarkId};
use lir_emit::core::{Constant, DumpLevel, EmitError, EmitOptions};
use lir_emit::lir_text::{parse_lir, LirUnit};
use lir_emit::x64::disasm::disassemble;
use lir_emit::x64::X64Backend;
use lir_emit::CompilationResult;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn parse(text: &str) -> LirUnit {
    parse_lir(text).unwrap_or_else(|e| panic!("failed to parse unit: {e}\n{text}"))
}

fn emit_with(text: &str, options: EmitOptions) -> Result<CompilationResult, EmitError> {
    init_logging();
    let backend = X64Backend::new(options).with_verification(true);
    parse(text).emit(&backend)
}

fn emit(text: &str) -> CompilationResult {
    emit_with(text, EmitOptions::default()).unwrap_or_else(|e| panic!("emission failed: {e}"))
}

fn mnemonics(code: &[u8]) -> Vec<Mnemonic> {
    Decoder::with_ip(64, code, 0, DecoderOptions::NONE)
        .into_iter()
        .map(|i| i.mnemonic())
        .collect()
}

#[test]
fn test_call_then_fallthrough_return() {
    let result = emit(
        "unit two\n\
         block b0 -> b1:\n\
         \x20 call target { at two@1 }\n\
         \x20 jump b1\n\
         block b1:\n\
         \x20 ret\n",
    );
    assert_eq!(result.code(), &[0xE8, 0, 0, 0, 0, 0xC3]);
    assert_eq!(result.calls().len(), 1);
    let call = &result.calls()[0];
    assert_eq!((call.pc_offset, call.size), (0, 5));
    assert_eq!(call.target, CallTarget::Method("target".into()));
    assert!(call.direct);
    assert_eq!(call.debug_info.as_ref().unwrap().position.bci, 1);

    assert_eq!(result.mark_offset(&MarkId::PrologueEnd), Some(0));
    assert_eq!(result.mark_offset(&MarkId::EpilogueStart), Some(5));
    assert_eq!(result.mark_offset(&MarkId::EpilogueEnd), Some(5));

    let text = disassemble(&result);
    assert!(!text.contains("jmp"), "{text}");
    assert_eq!(text.matches("; call target").count(), 1, "{text}");
}

#[test]
fn test_equal_constants_share_one_data_item() {
    let result = emit(
        "unit consts\n\
         block b0:\n\
         \x20 const xmm0, double 1.0\n\
         \x20 const xmm1, double 1.0\n\
         \x20 const rax, double 1.0\n\
         \x20 const xmm2, double -0.0\n\
         \x20 ret\n",
    );
    // 1.0 once, -0.0 is a distinct bit pattern
    assert_eq!(result.data_section().len(), 2);
    assert_eq!(result.data_patches().len(), 4);
    let first = result.data_patches()[0].reference;
    assert!(result.data_patches()[..3].iter().all(|p| p.reference == first));

    // every rip-relative load lands on the 8-byte aligned 1.0
    let layout = result.data_layout();
    let address = layout.address_of(first).unwrap();
    assert_eq!(address % 8, 0);
    assert!(address >= result.code_size());
    let image = result.image();
    assert_eq!(
        &image[address as usize..address as usize + 8],
        &1.0f64.to_le_bytes()
    );
    let mut decoder = Decoder::with_ip(64, result.code(), 0, DecoderOptions::NONE);
    for _ in 0..3 {
        let inst = decoder.decode();
        assert!(inst.is_ip_rel_memory_operand());
        assert_eq!(inst.ip_rel_memory_address(), address as u64);
    }
}

#[test]
fn test_byte_blob_is_not_deduplicated() {
    let result = emit(
        "unit blobs\n\
         block b0:\n\
         \x20 const rax, bytes 01 02 03\n\
         \x20 const rcx, bytes 01 02 03\n\
         \x20 ret\n",
    );
    assert_eq!(result.data_section().len(), 2);
    let layout = result.data_layout();
    for patch in result.data_patches() {
        assert_eq!(layout.address_of(patch.reference).unwrap() % 8, 0);
    }
}

fn short_branch_over(nop_bytes: u32) -> String {
    format!(
        "unit range\n\
         block b0 -> b1, b2:\n\
         \x20 test rax, rax\n\
         \x20 branch e b2 b1\n\
         block b1:\n\
         \x20 nop {nop_bytes}\n\
         \x20 ret\n\
         block b2:\n\
         \x20 ret\n"
    )
}

#[test]
fn test_short_branch_at_range_limit() {
    // jcc rel8 ends at 5; b2 starts at 5 + 126 + 1
    let result = emit(&short_branch_over(126));
    assert_eq!(&result.code()[3..5], &[0x74, 0x7F]);
    assert_eq!(result.code_size(), 133);
}

#[test]
fn test_out_of_range_branch_retries_conservatively() {
    let result = emit(&short_branch_over(127));
    // je rel32 over 127 bytes of nops and the ret of b1
    assert_eq!(&result.code()[3..5], &[0x0F, 0x84]);
    let rel = i32::from_le_bytes(result.code()[5..9].try_into().unwrap());
    assert_eq!(rel, 128);
    assert_eq!(result.code_size(), 138);
    // the failed attempt left nothing behind
    assert_eq!(result.marks().iter().filter(|m| m.id == MarkId::PrologueEnd).count(), 1);
    assert_eq!(result.marks().iter().filter(|m| m.id == MarkId::EpilogueEnd).count(), 2);
}

#[test]
fn test_branch_prefers_fallthrough_and_probability() {
    let unit = "unit br\n\
                block b0 -> b1, b2:\n\
                \x20 cmp rdi, 0\n\
                \x20 branch l b1 b2 PROB\n\
                block b3:\n\
                \x20 ret\n\
                block b1:\n\
                \x20 ret\n\
                block b2:\n\
                \x20 ret\n";

    // neither target follows: likely true edge gets the jcc
    let likely = emit(&unit.replace("PROB", "0.9"));
    let ops = mnemonics(likely.code());
    assert_eq!(&ops[..3], &[Mnemonic::Cmp, Mnemonic::Jl, Mnemonic::Jmp]);

    // unlikely true edge: negated jcc to the false target, jmp to true
    let unlikely = emit(&unit.replace("PROB", "0.1"));
    let ops = mnemonics(unlikely.code());
    assert_eq!(&ops[..3], &[Mnemonic::Cmp, Mnemonic::Jge, Mnemonic::Jmp]);

    // true target falls through: a single negated jcc
    let fallthrough = emit(
        "unit br\n\
         block b0 -> b1, b2:\n\
         \x20 cmp rdi, 0\n\
         \x20 branch l b1 b2 0.9\n\
         block b1:\n\
         \x20 ret\n\
         block b2:\n\
         \x20 ret\n",
    );
    let ops = mnemonics(fallthrough.code());
    assert_eq!(
        ops,
        vec![Mnemonic::Cmp, Mnemonic::Jge, Mnemonic::Ret, Mnemonic::Ret]
    );
}

#[test]
fn test_slow_paths_follow_blocks_and_halt() {
    let result = emit(
        "unit slow\n\
         block b0:\n\
         \x20 test rdi, rdi\n\
         \x20 branchto e trap\n\
         \x20 ret\n\
         slowpath trap:\n\
         \x20 rtcall uncommon_trap { at slow@3 frame }\n",
    );
    let code = result.code();
    assert_eq!(code.last(), Some(&0xF4));
    // slow path labels are never estimated, so the branch is near
    assert_eq!(&code[3..5], &[0x0F, 0x84]);
    let call = &result.calls()[0];
    assert_eq!(call.target, CallTarget::Runtime("uncommon_trap".into()));
    assert_eq!(call.pc_offset, 10);
    let rel = i32::from_le_bytes(code[5..9].try_into().unwrap());
    assert_eq!(9 + rel, 10);
}

#[test]
fn test_slow_path_goto_back_into_block() {
    let result = emit(
        "unit back\n\
         block b0:\n\
         \x20 branchto o fix\n\
         block b1:\n\
         \x20 ret\n\
         slowpath fix:\n\
         \x20 rtcall fixup\n\
         \x20 goto b1\n",
    );
    let ops = mnemonics(result.code());
    assert_eq!(
        ops,
        vec![Mnemonic::Jo, Mnemonic::Ret, Mnemonic::Call, Mnemonic::Jmp, Mnemonic::Hlt]
    );
}

#[test]
fn test_annotations_lie_within_code() {
    let result = emit_with(
        "unit annotated\n\
         frame spill=8 saved=rbx,r12\n\
         block b0 -> b1:\n\
         \x20 infopoint method_start { at annotated@0 frame }\n\
         \x20 load rax, [rdi+16] { at annotated@1 }   !annotated@1\n\
         \x20 nullcheck rsi { at annotated@2 lazy }\n\
         \x20 icall rax { at annotated@3 frame handler=b1 }\n\
         \x20 jump b1\n\
         block b1:\n\
         \x20 ret\n",
        EmitOptions::default().with_print_lir_with_assembly(true),
    )
    .unwrap();
    let size = result.code_size();
    assert!(result.marks().iter().all(|m| m.pc_offset <= size));
    assert!(result.calls().iter().all(|c| c.end_offset() <= size));
    assert!(result
        .implicit_exceptions()
        .iter()
        .all(|e| e.pc_offset < size && e.dispatch_offset < size));
    assert!(result.infopoints().iter().all(|i| i.pc_offset <= size));
    assert!(result.comments().iter().all(|c| c.pc_offset <= size));
    assert!(result
        .source_mappings()
        .iter()
        .all(|m| m.start < m.end && m.end <= size));
    assert!(result
        .exception_handlers()
        .iter()
        .all(|h| h.pc_offset <= size && h.handler_pos < size));

    assert_eq!(result.infopoints().len(), 1);
    assert_eq!(result.source_mappings().len(), 1);
    assert!(result.comments().iter().any(|c| c.text == "[method prologue]"));
    assert!(result.comments().iter().any(|c| c.text == "block B0"));
}

#[test]
fn test_lazy_implicit_exception_gets_dispatch_stub() {
    let result = emit(
        "unit lazy\n\
         block b0:\n\
         \x20 load rax, [rdi+8] { at lazy@2 lazy }\n\
         \x20 load rcx, [rdi] { at lazy@4 }\n\
         \x20 ret\n",
    );
    let exceptions = result.implicit_exceptions();
    assert_eq!(exceptions.len(), 2);

    // eager site dispatches to itself
    let eager = exceptions.iter().find(|e| e.dispatch_offset == e.pc_offset).unwrap();
    assert_eq!(eager.debug_info.as_ref().unwrap().position.bci, 4);

    // lazy site dispatches to a stub after the code: call + hlt
    let lazy = exceptions.iter().find(|e| e.dispatch_offset != e.pc_offset).unwrap();
    assert_eq!(lazy.pc_offset, 0);
    let stub = lazy.dispatch_offset as usize;
    assert_eq!(result.code()[stub], 0xE8);
    assert_eq!(result.code()[stub + 5], 0xF4);
    assert_eq!(stub + 6, result.code().len());
    assert_eq!(
        result.calls()[0].target,
        CallTarget::Runtime("throw_implicit_exception".into())
    );
}

#[test]
fn test_exception_handler_bound_after_call() {
    let result = emit(
        "unit handlers\n\
         block b0 -> b1, b2:\n\
         \x20 call may_throw { at handlers@1 frame handler=b2 }\n\
         \x20 jump b1\n\
         block b1:\n\
         \x20 ret\n\
         block b2:\n\
         \x20 movi rax, 0\n\
         \x20 ret\n",
    );
    let handlers = result.exception_handlers();
    assert_eq!(handlers.len(), 1);
    assert_eq!(handlers[0].pc_offset, 5);
    // call (5) + ret of b1 (1)
    assert_eq!(handlers[0].handler_pos, 6);
}

#[test]
fn test_jump_table_entries_point_at_targets() {
    let result = emit_with(
        "unit table\n\
         block b0 -> b1, b2, b3:\n\
         \x20 switch rdi, r11, r10, 3: b1 b2 b1 default b3\n\
         block b1:\n\
         \x20 movi rax, 1\n\
         \x20 ret\n\
         block b2:\n\
         \x20 movi rax, 2\n\
         \x20 ret\n\
         block b3:\n\
         \x20 xor rax, rax\n\
         \x20 ret\n",
        EmitOptions::default().with_block_info(true),
    )
    .unwrap();
    let tables = result.jump_tables();
    assert_eq!(tables.len(), 1);
    let table = &tables[0];
    assert_eq!((table.low, table.high, table.entry_size), (3, 5, 4));
    assert_eq!(table.position % 4, 0);

    let start_of = |id: u32| {
        result
            .block_infos()
            .iter()
            .find(|info| info.id.0 == id)
            .map(|info| info.start)
            .unwrap()
    };
    let code = result.code();
    let entries: Vec<u32> = code[table.position as usize..table.end() as usize]
        .chunks_exact(4)
        .map(|e| (table.position as i64 + i32::from_le_bytes(e.try_into().unwrap()) as i64) as u32)
        .collect();
    assert_eq!(entries, vec![start_of(1), start_of(2), start_of(1)]);

    // the lea of the dispatch sequence addresses the table
    let lea = Decoder::with_ip(64, code, 0, DecoderOptions::NONE)
        .into_iter()
        .find(|i| i.mnemonic() == Mnemonic::Lea)
        .unwrap();
    assert_eq!(lea.ip_rel_memory_address(), table.position as u64);

    let text = disassemble(&result);
    assert!(text.contains(";; jump table [3, 5]"), "{text}");
}

#[test]
fn test_zap_stack_fills_every_frame_word() {
    let unit = "unit zap\nframe spill=16\nblock b0:\n  ret\n";
    let result = emit_with(unit, EmitOptions::default().with_zap_stack(true)).unwrap();
    let start = result.mark_offset(&MarkId::PrologueDecdRsp).unwrap() as usize;
    let end = result.mark_offset(&MarkId::PrologueEnd).unwrap() as usize;
    let prologue: Vec<_> =
        Decoder::with_ip(64, &result.code()[start..end], start as u64, DecoderOptions::NONE)
            .into_iter()
            .collect();
    assert_eq!(prologue[0].immediate64(), 0x0BAD_DECA_FFC0_FFEE);
    let stores = prologue
        .iter()
        .filter(|i| i.mnemonic() == Mnemonic::Mov && i.op0_kind() == OpKind::Memory)
        .count();
    // 16 bytes of spill slots padded to a 24 byte frame
    assert_eq!(stores, 3);

    let plain = emit(unit);
    assert_eq!(plain.mark_offset(&MarkId::PrologueEnd), Some(4));
}

#[test]
fn test_block_info_csv() {
    let result = emit_with(
        "unit info\n\
         block b0 -> b1 1.0 freq=2.5:\n\
         \x20 jump b1\n\
         block b1:\n\
         \x20 ret\n",
        EmitOptions::default().with_block_info(true),
    )
    .unwrap();
    assert_eq!(
        result.block_info_csv(),
        "0, 0, 0, 2.500000, [(1, 1.000000)]\n1, 0, 1, 1.000000, []\n"
    );
    assert!(emit("unit info\nblock b0:\n ret\n").block_infos().is_empty());
}

#[test]
fn test_isolated_loop_header_is_aligned() {
    let unit = "unit loops\n\
                block b0 -> SUCC:\n\
                \x20 movi rax, 1\n\
                \x20 jump b2\n\
                block b1 aligned:\n\
                \x20 ret\n\
                block b2:\n\
                \x20 ret\n";
    let options = EmitOptions::default().with_block_info(true);
    let start_of_b1 = |result: &CompilationResult| result.block_infos()[1].start;

    // b1 is not reached from b0: padded to the loop header alignment
    let isolated = emit_with(&unit.replace("SUCC", "b2"), options.clone()).unwrap();
    assert_eq!(start_of_b1(&isolated), 16);
    let padding = &isolated.code()[9..16];
    assert!(mnemonics(padding).iter().all(|&m| m == Mnemonic::Nop));

    let wide = emit_with(
        &unit.replace("SUCC", "b2"),
        options.clone().with_loop_header_alignment(32),
    )
    .unwrap();
    assert_eq!(start_of_b1(&wide), 32);

    // reached from b0: no padding
    let reached = emit_with(&unit.replace("SUCC", "b1, b2"), options).unwrap();
    assert_eq!(start_of_b1(&reached), 9);
}

#[test]
fn test_deleted_blocks_are_skipped() {
    let result = emit(
        "unit skip\n\
         block b0 -> b2:\n\
         \x20 jump b2\n\
         block b1:\n\
         \x20 halt\n\
         block b2:\n\
         \x20 ret\n\
         delete b1\n",
    );
    // b2 follows b0 once b1 is gone, so the jump falls through
    assert_eq!(result.code(), &[0xC3]);
}

#[test]
fn test_deopt_stubs() {
    let entry = emit("unit entry\nstub deopt_entry\nblock b0:\n  rtcall unpack\n  ret\n");
    // mov rsi, rax; movq rdx, xmm0; mov rdi, rsp
    assert_eq!(
        &entry.code()[..11],
        &[0x48, 0x89, 0xC6, 0x66, 0x48, 0x0F, 0x7E, 0xC2, 0x48, 0x89, 0xE7]
    );
    assert_eq!(entry.mark_offset(&MarkId::PrologueEnd), Some(11));

    let exit = emit("unit exit\nstub deopt_exit\nblock b0:\n  ret\n");
    let ops = mnemonics(exit.code());
    assert_eq!(
        ops,
        vec![
            Mnemonic::Mov,
            Mnemonic::Sub,
            Mnemonic::Mov,
            Mnemonic::Movsd,
            Mnemonic::Add,
            Mnemonic::Ret
        ]
    );
}

#[test]
fn test_dump_level_never_changes_code_bytes() {
    let unit = "unit dead\nblock b0:\n  call never_returns\n  deadend\n";
    let quiet = emit(unit);
    assert_eq!(quiet.code_size(), 5);
    let verbose =
        emit_with(unit, EmitOptions::default().with_dump_level(DumpLevel::Verbose)).unwrap();
    assert_eq!(verbose.code(), quiet.code());
}

#[test]
fn test_dead_end_trap_option() {
    let unit = "unit dead\nblock b0:\n  call never_returns\n  deadend\n";
    let trapped = emit_with(unit, EmitOptions::default().with_trap_dead_ends(true)).unwrap();
    assert_eq!(trapped.code_size(), 6);
    assert_eq!(trapped.code().last(), Some(&0xCC));
}

fn invalid_for_deopt(call: &str) -> bool {
    let result = emit(&format!("unit deopt\nblock b0:\n  {call}\n  ret\n"));
    assert_eq!(result.calls().len(), 1);
    result.calls()[0].invalid_for_deoptimization
}

#[test]
fn test_nodeopt_call_with_frame_is_invalid_for_deoptimization() {
    assert!(invalid_for_deopt("call t { at d@1 frame nodeopt }"));
    assert!(invalid_for_deopt("icall rax { at d@1 frame nodeopt }"));
}

#[test]
fn test_nodeopt_call_without_frame_stays_valid_for_deoptimization() {
    assert!(!invalid_for_deopt("call t { at d@1 nodeopt }"));
    assert!(!invalid_for_deopt("icall rax { at d@1 nodeopt }"));
}

#[test]
fn test_calls_without_state_stay_valid_for_deoptimization() {
    assert!(!invalid_for_deopt("call t"));
    assert!(!invalid_for_deopt("icall rax"));
    assert!(!invalid_for_deopt("call t { at d@1 frame }"));
}

#[test]
fn test_implicit_exception_with_handler_is_contract_error() {
    let err = emit_with(
        "unit bad\n\
         block b0 -> b1:\n\
         \x20 load rax, [rdi] { at bad@1 handler=b1 }\n\
         \x20 ret\n\
         block b1:\n\
         \x20 ret\n",
        EmitOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, EmitError::Contract(_)), "{err}");
}

#[test]
fn test_edge_to_deleted_block_is_contract_error() {
    let err = emit_with(
        "unit bad\n\
         block b0:\n\
         \x20 jump b2\n\
         block b1:\n\
         \x20 ret\n\
         block b2:\n\
         \x20 ret\n\
         delete b2\n",
        EmitOptions::default(),
    )
    .unwrap_err();
    match err {
        EmitError::Contract(message) => assert!(message.contains("deleted block B2"), "{message}"),
        other => panic!("unexpected {other}"),
    }
}

#[test]
fn test_byte_blob_into_xmm_is_contract_error() {
    let err = emit_with(
        "unit bad\nblock b0:\n  const xmm0, bytes 00\n  ret\n",
        EmitOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, EmitError::Contract(_)), "{err}");
}

#[test]
fn test_bailout_is_not_wrapped() {
    let err = emit_with(
        "unit bail\nblock b0:\n  bailout \"unsupported intrinsic\"\n",
        EmitOptions::default(),
    )
    .unwrap_err();
    assert_eq!(err, EmitError::bailout("unsupported intrinsic"));
    assert!(err.context().is_none());
}

#[test]
fn test_empty_instruction_is_internal_error_with_context() {
    let err = emit_with("unit empty\nblock b0:\n  nop 0\n  ret\n", EmitOptions::default())
        .unwrap_err();
    let context = err.context().expect("internal error");
    assert_eq!(context.get("block"), Some("B0"));
    assert_eq!(context.get("instruction class"), Some("Nop"));
    assert!(context.get("instruction id").is_some());
    assert!(context.get("lir instruction").unwrap().contains("nop 0"));
    assert!(err.to_string().contains("Nop emitted no code"));
}

#[test]
fn test_constant_kinds_into_registers() {
    let result = emit(
        "unit kinds\n\
         block b0:\n\
         \x20 const rax, int 7\n\
         \x20 const xmm3, float 2.5\n\
         \x20 const rdx, long 0x123456789\n\
         \x20 ret\n",
    );
    let ops = mnemonics(result.code());
    assert_eq!(
        ops,
        vec![Mnemonic::Mov, Mnemonic::Movss, Mnemonic::Mov, Mnemonic::Ret]
    );
    // int stays an immediate; float and long come from the data section
    assert_eq!(result.data_section().len(), 2);
    let float = result
        .data_section()
        .iter()
        .find(|(_, item)| *item.constant == Constant::float(2.5))
        .map(|(r, _)| r)
        .unwrap();
    assert_eq!(result.data_layout().address_of(float).unwrap() % 4, 0);
}
