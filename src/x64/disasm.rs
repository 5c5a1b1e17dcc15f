// This module renders a closed CompilationResult as annotated x86-64 assembly for diagnostic
// tooling. Instructions are decoded with iced-x86 and printed in NASM syntax next to their offset
// and raw bytes. Code comments and marks recorded at an offset are printed on their own lines
// before the instruction at that offset; call sites, implicit exception sites and exception
// handler entries are appended to the instruction line. Inline jump tables are printed as their
// 32-bit entries instead of being decoded, and the data section follows the code, one line per
// item at its final address.

//! Annotated disassembly of emitted code.

use std::fmt::Write as _;

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, NasmFormatter};

use crate::core::result::CompilationResult;

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn annotate_offset(out: &mut String, result: &CompilationResult, pos: u32) {
    for comment in result.comments().iter().filter(|c| c.pc_offset == pos) {
        let _ = writeln!(out, "        ;; {}", comment.text);
    }
    for mark in result.marks().iter().filter(|m| m.pc_offset == pos) {
        let _ = writeln!(out, "        ;; mark {}", mark.id);
    }
}

fn instruction_notes(result: &CompilationResult, pos: u32) -> String {
    let mut notes = String::new();
    for call in result.calls().iter().filter(|c| c.pc_offset == pos) {
        let _ = write!(notes, " ; call {}", call.target);
        if let Some(debug) = &call.debug_info {
            let _ = write!(notes, " @ {debug}");
        }
    }
    for exception in result.implicit_exceptions().iter().filter(|e| e.pc_offset == pos) {
        let _ = write!(notes, " ; implicit exception -> {:#x}", exception.dispatch_offset);
    }
    for infopoint in result.infopoints().iter().filter(|i| i.pc_offset == pos) {
        let _ = write!(notes, " ; infopoint {:?} {}", infopoint.reason, infopoint.debug_info);
    }
    notes
}

/// Render code and data of `result` with its annotations.
pub fn disassemble(result: &CompilationResult) -> String {
    let mut out = String::new();
    let code = result.code();
    let _ = writeln!(
        out,
        "; {}: {} bytes code, {} bytes data, frame {}",
        result.name(),
        code.len(),
        result.data().len(),
        result.total_frame_size()
    );

    let mut formatter = NasmFormatter::new();
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let mut instruction = Instruction::default();
    let mut text = String::new();
    while decoder.can_decode() {
        let pos = decoder.position() as u32;
        annotate_offset(&mut out, result, pos);

        if let Some(table) = result.jump_tables().iter().find(|t| t.position == pos) {
            let end = (table.end() as usize).min(code.len());
            let _ = writeln!(out, "        ;; jump table [{}, {}]", table.low, table.high);
            for entry in code[pos as usize..end].chunks_exact(table.entry_size as usize) {
                let value = i32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
                let _ = writeln!(out, "{pos:06x}: {:<30} dd {value}", hex_bytes(entry));
            }
            if decoder.set_position(end).is_err() {
                break;
            }
            decoder.set_ip(end as u64);
            continue;
        }

        decoder.decode_out(&mut instruction);
        text.clear();
        formatter.format(&instruction, &mut text);
        let bytes = &code[pos as usize..pos as usize + instruction.len()];
        let _ = writeln!(
            out,
            "{pos:06x}: {:<30} {text}{}",
            hex_bytes(bytes),
            instruction_notes(result, pos)
        );
    }
    annotate_offset(&mut out, result, code.len() as u32);

    for handler in result.exception_handlers() {
        let _ = writeln!(
            out,
            "; exception handler {:#x} -> {:#x}",
            handler.pc_offset, handler.handler_pos
        );
    }

    let section = result.data_section();
    let layout = result.data_layout();
    if !section.is_empty() {
        let _ = writeln!(out, "; data @ {:#x}, align {}", layout.start, layout.alignment);
        for (reference, item) in section.iter() {
            let Some(address) = layout.address_of(reference) else {
                continue;
            };
            let _ = writeln!(
                out,
                "{address:06x}: {:<30} {reference} {}",
                hex_bytes(&item.constant.to_le_bytes()),
                item.constant
            );
        }
    }
    out
}
