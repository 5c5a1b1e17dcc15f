// This module defines CompilationResult, the aggregate produced by one emission pass: the final
// code bytes, the data section placed after the code, the frame size and every annotation keyed
// by code offset (marks, calls, implicit exceptions, infopoints, exception handlers, source
// mappings, comments, jump tables, data patches, block statistics). The result is mutable until
// close(); after that every mutator reports a contract error. close() also checks that each
// annotation offset lies inside the code buffer. reset_for_emitting_code() empties the result for
// a conservative re-emission while keeping its identity (name) and the frame metadata fixed
// before emission started.

//! The output aggregate of code emission.

use std::fmt::{self, Write as _};

use super::data::{DataLayout, DataRef, DataSection};
use super::error::{EmitError, EmitResult};
use super::lir::{BlockId, DebugInfo, SourcePosition};

/// Loader and runtime anchor points.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MarkId {
    /// Stack pointer has been decremented by the frame size.
    PrologueDecdRsp,
    PrologueEnd,
    EpilogueStart,
    /// Stack pointer has been incremented back.
    EpilogueIncdRsp,
    EpilogueEnd,
    Named(String),
}

impl fmt::Display for MarkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkId::PrologueDecdRsp => write!(f, "PROLOGUE_DECD_RSP"),
            MarkId::PrologueEnd => write!(f, "PROLOGUE_END"),
            MarkId::EpilogueStart => write!(f, "EPILOGUE_START"),
            MarkId::EpilogueIncdRsp => write!(f, "EPILOGUE_INCD_RSP"),
            MarkId::EpilogueEnd => write!(f, "EPILOGUE_END"),
            MarkId::Named(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mark {
    pub pc_offset: u32,
    pub id: MarkId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkHandle(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    Method(String),
    Runtime(String),
    /// Target held in a register, unknown statically.
    Indirect,
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallTarget::Method(name) => write!(f, "{name}"),
            CallTarget::Runtime(name) => write!(f, "runtime:{name}"),
            CallTarget::Indirect => write!(f, "<indirect>"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub pc_offset: u32,
    pub size: u32,
    pub target: CallTarget,
    pub debug_info: Option<DebugInfo>,
    pub direct: bool,
    /// Deoptimization must not resume at this call site.
    pub invalid_for_deoptimization: bool,
}

impl Call {
    pub fn end_offset(&self) -> u32 {
        self.pc_offset + self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallHandle(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImplicitException {
    pub pc_offset: u32,
    /// Where control continues when the instruction faults.
    pub dispatch_offset: u32,
    pub debug_info: Option<DebugInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfopointReason {
    Call,
    Safepoint,
    MethodStart,
    MethodEnd,
    BytecodePosition,
    Implicit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Infopoint {
    pub pc_offset: u32,
    pub debug_info: DebugInfo,
    pub reason: InfopointReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub pc_offset: u32,
    pub handler_pos: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMapping {
    pub start: u32,
    pub end: u32,
    pub position: SourcePosition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeComment {
    pub pc_offset: u32,
    pub text: String,
}

/// Inline table of branch targets emitted by a switch instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpTable {
    pub position: u32,
    pub low: i32,
    pub high: i32,
    pub entry_size: u32,
}

impl JumpTable {
    pub fn end(&self) -> u32 {
        let entries = (self.high as i64 - self.low as i64 + 1).max(0) as u32;
        self.position + entries * self.entry_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPatch {
    pub pc_offset: u32,
    pub reference: DataRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfo {
    pub id: BlockId,
    pub start: u32,
    pub end: u32,
    pub frequency: f64,
    pub successors: Vec<(BlockId, f64)>,
}

#[derive(Debug, Clone)]
pub struct CompilationResult {
    name: String,
    code: Vec<u8>,
    data: Vec<u8>,
    data_layout: DataLayout,
    data_section: DataSection,
    total_frame_size: u32,
    min_data_section_item_alignment: u32,
    marks: Vec<Mark>,
    calls: Vec<Call>,
    implicit_exceptions: Vec<ImplicitException>,
    infopoints: Vec<Infopoint>,
    exception_handlers: Vec<ExceptionHandler>,
    source_mappings: Vec<SourceMapping>,
    comments: Vec<CodeComment>,
    jump_tables: Vec<JumpTable>,
    data_patches: Vec<DataPatch>,
    block_infos: Vec<BlockInfo>,
    closed: bool,
}

impl CompilationResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: Vec::new(),
            data: Vec::new(),
            data_layout: DataLayout::default(),
            data_section: DataSection::new(),
            total_frame_size: 0,
            min_data_section_item_alignment: 1,
            marks: Vec::new(),
            calls: Vec::new(),
            implicit_exceptions: Vec::new(),
            infopoints: Vec::new(),
            exception_handlers: Vec::new(),
            source_mappings: Vec::new(),
            comments: Vec::new(),
            jump_tables: Vec::new(),
            data_patches: Vec::new(),
            block_infos: Vec::new(),
            closed: false,
        }
    }

    /// Fresh result for a unit whose frame size is already fixed.
    pub fn with_total_frame_size(mut self, size: u32) -> Self {
        self.total_frame_size = size;
        self
    }

    fn check_open(&self) -> EmitResult<()> {
        if self.closed {
            return Err(EmitError::contract(format!(
                "compilation result `{}` is closed",
                self.name
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn set_total_frame_size(&mut self, size: u32) -> EmitResult<()> {
        self.check_open()?;
        self.total_frame_size = size;
        Ok(())
    }

    pub fn total_frame_size(&self) -> u32 {
        self.total_frame_size
    }

    pub fn set_min_data_section_item_alignment(&mut self, alignment: u32) -> EmitResult<()> {
        self.check_open()?;
        super::data::check_alignment(alignment)?;
        self.min_data_section_item_alignment = alignment;
        Ok(())
    }

    pub fn min_data_section_item_alignment(&self) -> u32 {
        self.min_data_section_item_alignment
    }

    pub fn record_mark(&mut self, pc_offset: u32, id: MarkId) -> EmitResult<MarkHandle> {
        self.check_open()?;
        self.marks.push(Mark { pc_offset, id });
        Ok(MarkHandle(self.marks.len() - 1))
    }

    pub fn mark(&self, handle: MarkHandle) -> &Mark {
        &self.marks[handle.0]
    }

    pub fn record_call(
        &mut self,
        pc_offset: u32,
        size: u32,
        target: CallTarget,
        debug_info: Option<DebugInfo>,
        direct: bool,
    ) -> EmitResult<CallHandle> {
        self.check_open()?;
        self.calls.push(Call {
            pc_offset,
            size,
            target,
            debug_info,
            direct,
            invalid_for_deoptimization: false,
        });
        Ok(CallHandle(self.calls.len() - 1))
    }

    pub fn set_invalid_for_deoptimization(&mut self, handle: CallHandle) -> EmitResult<()> {
        self.check_open()?;
        self.calls[handle.0].invalid_for_deoptimization = true;
        Ok(())
    }

    pub fn call(&self, handle: CallHandle) -> &Call {
        &self.calls[handle.0]
    }

    pub fn record_implicit_exception(
        &mut self,
        pc_offset: u32,
        dispatch_offset: u32,
        debug_info: Option<DebugInfo>,
    ) -> EmitResult<()> {
        self.check_open()?;
        self.implicit_exceptions.push(ImplicitException {
            pc_offset,
            dispatch_offset,
            debug_info,
        });
        Ok(())
    }

    pub fn record_infopoint(
        &mut self,
        pc_offset: u32,
        debug_info: DebugInfo,
        reason: InfopointReason,
    ) -> EmitResult<()> {
        self.check_open()?;
        self.infopoints.push(Infopoint {
            pc_offset,
            debug_info,
            reason,
        });
        Ok(())
    }

    pub fn record_exception_handler(&mut self, pc_offset: u32, handler_pos: u32) -> EmitResult<()> {
        self.check_open()?;
        self.exception_handlers.push(ExceptionHandler {
            pc_offset,
            handler_pos,
        });
        Ok(())
    }

    pub fn record_source_mapping(
        &mut self,
        start: u32,
        end: u32,
        position: SourcePosition,
    ) -> EmitResult<()> {
        self.check_open()?;
        self.source_mappings.push(SourceMapping {
            start,
            end,
            position,
        });
        Ok(())
    }

    pub fn add_comment(&mut self, pc_offset: u32, text: impl Into<String>) -> EmitResult<()> {
        self.check_open()?;
        self.comments.push(CodeComment {
            pc_offset,
            text: text.into(),
        });
        Ok(())
    }

    pub fn add_jump_table(&mut self, table: JumpTable) -> EmitResult<()> {
        self.check_open()?;
        self.jump_tables.push(table);
        Ok(())
    }

    pub fn record_data_patch(&mut self, pc_offset: u32, reference: DataRef) -> EmitResult<()> {
        self.check_open()?;
        self.data_patches.push(DataPatch {
            pc_offset,
            reference,
        });
        Ok(())
    }

    pub fn add_block_info(&mut self, info: BlockInfo) -> EmitResult<()> {
        self.check_open()?;
        self.block_infos.push(info);
        Ok(())
    }

    pub fn data_section(&self) -> &DataSection {
        &self.data_section
    }

    pub fn data_section_mut(&mut self) -> EmitResult<&mut DataSection> {
        self.check_open()?;
        Ok(&mut self.data_section)
    }

    /// Install the final code and data bytes.
    pub fn set_target_code(
        &mut self,
        code: Vec<u8>,
        data: Vec<u8>,
        layout: DataLayout,
    ) -> EmitResult<()> {
        self.check_open()?;
        self.code = code;
        self.data = data;
        self.data_layout = layout;
        Ok(())
    }

    /// Freeze the result. Every annotation must address the code buffer.
    pub fn close(&mut self) -> EmitResult<()> {
        self.check_open()?;
        let len = self.code.len() as u32;
        let out_of_range = |what: &str, offset: u32| {
            EmitError::internal(format!(
                "{what} at offset {offset} is outside the code buffer of {len} bytes"
            ))
        };
        if let Some(m) = self.marks.iter().find(|m| m.pc_offset >= len) {
            return Err(out_of_range("mark", m.pc_offset));
        }
        if let Some(c) = self
            .calls
            .iter()
            .find(|c| c.size == 0 || c.end_offset() > len)
        {
            return Err(out_of_range("call", c.pc_offset));
        }
        if let Some(e) = self
            .implicit_exceptions
            .iter()
            .find(|e| e.pc_offset >= len || e.dispatch_offset >= len)
        {
            return Err(out_of_range("implicit exception", e.pc_offset));
        }
        if let Some(i) = self.infopoints.iter().find(|i| i.pc_offset >= len) {
            return Err(out_of_range("infopoint", i.pc_offset));
        }
        self.data_section.close();
        self.closed = true;
        Ok(())
    }

    /// Empty everything produced by an emission pass. Name, frame size and
    /// minimum data alignment survive.
    pub fn reset_for_emitting_code(&mut self) {
        self.code.clear();
        self.data.clear();
        self.data_layout = DataLayout::default();
        self.data_section.clear();
        self.marks.clear();
        self.calls.clear();
        self.implicit_exceptions.clear();
        self.infopoints.clear();
        self.exception_handlers.clear();
        self.source_mappings.clear();
        self.comments.clear();
        self.jump_tables.clear();
        self.data_patches.clear();
        self.block_infos.clear();
        self.closed = false;
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn code_size(&self) -> u32 {
        self.code.len() as u32
    }

    /// Data section bytes, to be placed at `data_layout().start`.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_layout(&self) -> &DataLayout {
        &self.data_layout
    }

    /// Code followed by the aligned data section, as a loader maps it.
    pub fn image(&self) -> Vec<u8> {
        let mut image = self.code.clone();
        if !self.data.is_empty() {
            image.resize(self.data_layout.start as usize, 0);
            image.extend_from_slice(&self.data);
        }
        image
    }

    pub fn marks(&self) -> &[Mark] {
        &self.marks
    }

    pub fn mark_offset(&self, id: &MarkId) -> Option<u32> {
        self.marks.iter().find(|m| &m.id == id).map(|m| m.pc_offset)
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn implicit_exceptions(&self) -> &[ImplicitException] {
        &self.implicit_exceptions
    }

    pub fn infopoints(&self) -> &[Infopoint] {
        &self.infopoints
    }

    pub fn exception_handlers(&self) -> &[ExceptionHandler] {
        &self.exception_handlers
    }

    pub fn source_mappings(&self) -> &[SourceMapping] {
        &self.source_mappings
    }

    pub fn comments(&self) -> &[CodeComment] {
        &self.comments
    }

    pub fn jump_tables(&self) -> &[JumpTable] {
        &self.jump_tables
    }

    pub fn data_patches(&self) -> &[DataPatch] {
        &self.data_patches
    }

    pub fn block_infos(&self) -> &[BlockInfo] {
        &self.block_infos
    }

    /// One line per emitted block:
    /// `id, startPC, endPC, freq, [(succId, probability),...]`.
    pub fn block_info_csv(&self) -> String {
        let mut out = String::new();
        for info in &self.block_infos {
            let _ = write!(
                out,
                "{}, {}, {}, {:.6}, [",
                info.id.0, info.start, info.end, info.frequency
            );
            for (i, (succ, prob)) in info.successors.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "({}, {:.6})", succ.0, prob);
            }
            out.push_str("]\n");
        }
        out
    }
}
