//! Line-oriented parser for textual LIR.
//!
//! Blocks and slow paths may be referenced before they are declared; the
//! first reference allocates the id and the declaration fills it in. A name
//! that is referenced but never declared is an error.

use std::collections::{HashMap, HashSet};

use crate::core::data::Constant;
use crate::core::frame::FrameMap;
use crate::core::lir::{
    BlockId, DebugInfo, InsertPoint, Label, LabelRef, Lir, LirFrameState, SlowPathId,
    SourcePosition,
};
use crate::core::register::AsmReg;
use crate::core::result::InfopointReason;
use crate::x64::backend::StubKind;
use crate::x64::encoder::{parse_reg, Condition};
use crate::x64::ops::{BinaryOp, Operand, X64Op};

use super::LirUnit;

/// Parse one compilation unit. Errors are prefixed with the line number.
pub fn parse_lir(text: &str) -> Result<LirUnit, String> {
    Parser::new(text).parse()
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    lir: Lir<X64Op>,
    named: bool,
    frame: FrameMap,
    kind: StubKind,
    blocks: HashMap<&'a str, BlockId>,
    declared_blocks: Vec<BlockId>,
    slow_paths: HashMap<&'a str, SlowPathId>,
    declared_slow_paths: HashSet<SlowPathId>,
    order: Option<Vec<BlockId>>,
    deleted: Vec<BlockId>,
    current: Option<InsertPoint>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            lir: Lir::new("unit"),
            named: false,
            frame: FrameMap::empty(),
            kind: StubKind::Method,
            blocks: HashMap::new(),
            declared_blocks: Vec::new(),
            slow_paths: HashMap::new(),
            declared_slow_paths: HashSet::new(),
            order: None,
            deleted: Vec::new(),
            current: None,
        }
    }

    fn parse(mut self) -> Result<LirUnit, String> {
        loop {
            self.skip_whitespace(true);
            if self.is_eof() {
                break;
            }
            let line = self.line();
            self.parse_line().map_err(|e| format!("line {line}: {e}"))?;
        }
        self.finish()
    }

    fn parse_line(&mut self) -> Result<(), String> {
        let word = self.read_identifier()?;
        match word {
            "unit" => self.parse_unit()?,
            "frame" => self.parse_frame()?,
            "stub" => self.parse_stub()?,
            "block" => self.parse_block()?,
            "slowpath" => self.parse_slow_path()?,
            "order" => {
                let mut order = Vec::new();
                while !self.at_line_end() {
                    let name = self.read_identifier()?;
                    order.push(self.block_id(name));
                }
                self.order = Some(order);
            }
            "delete" => {
                while !self.at_line_end() {
                    let name = self.read_identifier()?;
                    let id = self.block_id(name);
                    self.deleted.push(id);
                }
            }
            _ => self.parse_op(word)?,
        }
        self.expect_line_end()
    }

    fn finish(mut self) -> Result<LirUnit, String> {
        let mut undefined: Vec<&str> = self
            .blocks
            .iter()
            .filter(|(_, id)| !self.declared_blocks.contains(id))
            .map(|(name, _)| *name)
            .collect();
        undefined.extend(
            self.slow_paths
                .iter()
                .filter(|(_, id)| !self.declared_slow_paths.contains(id))
                .map(|(name, _)| *name),
        );
        undefined.sort_unstable();
        if let Some(name) = undefined.first() {
            return Err(format!("'{name}' is referenced but never defined"));
        }

        let order = self
            .order
            .take()
            .unwrap_or_else(|| self.declared_blocks.clone());
        self.lir.set_code_emitting_order(order);
        for &block in &self.deleted {
            self.lir.delete_block(block);
        }

        let block_names = self
            .blocks
            .iter()
            .map(|(name, &id)| (name.to_string(), id))
            .collect();
        Ok(LirUnit {
            lir: self.lir,
            frame: self.frame,
            kind: self.kind,
            block_names,
        })
    }

    // ---- headers ----

    fn parse_unit(&mut self) -> Result<(), String> {
        if self.named || !self.blocks.is_empty() || !self.slow_paths.is_empty() {
            return Err("'unit' must come first".to_string());
        }
        let name = self.read_symbol()?;
        self.lir = Lir::new(name);
        self.named = true;
        Ok(())
    }

    fn parse_frame(&mut self) -> Result<(), String> {
        let mut spill = 0;
        let mut outgoing = 0;
        let mut saved = Vec::new();
        while !self.at_line_end() {
            let key = self.read_identifier()?;
            self.expect('=')?;
            match key {
                "spill" => spill = self.read_u32()?,
                "outgoing" => outgoing = self.read_u32()?,
                "saved" => loop {
                    saved.push(self.read_reg()?);
                    if !self.try_read(',') {
                        break;
                    }
                },
                other => return Err(format!("unknown frame attribute '{other}'")),
            }
        }
        self.frame = FrameMap::new(spill, outgoing, saved);
        Ok(())
    }

    fn parse_stub(&mut self) -> Result<(), String> {
        self.kind = match self.read_identifier()? {
            "method" => StubKind::Method,
            "deopt_entry" => StubKind::DeoptEntry,
            "deopt_exit" => StubKind::DeoptExit,
            other => return Err(format!("unknown stub kind '{other}'")),
        };
        Ok(())
    }

    fn parse_block(&mut self) -> Result<(), String> {
        let name = self.read_identifier()?;
        let id = self.block_id(name);
        if self.declared_blocks.contains(&id) {
            return Err(format!("block '{name}' defined twice"));
        }
        self.declared_blocks.push(id);

        if self.try_read('-') {
            self.expect('>')?;
            let mut successors = Vec::new();
            loop {
                let target = self.read_identifier()?;
                let target = self.block_id(target);
                successors.push((target, self.read_optional_float()?));
                if !self.try_read(',') {
                    break;
                }
            }
            let even = 1.0 / successors.len() as f64;
            let successors: Vec<(BlockId, f64)> = successors
                .into_iter()
                .map(|(target, p)| (target, p.unwrap_or(even)))
                .collect();
            self.lir.set_successors(id, &successors);
        }

        while !self.try_read(':') {
            if self.at_line_end() {
                return Err("expected ':' after block header".to_string());
            }
            match self.read_identifier()? {
                "aligned" => self.lir.set_aligned(id, true),
                "freq" => {
                    self.expect('=')?;
                    let frequency = self.read_float()?;
                    self.lir.set_relative_frequency(id, frequency);
                }
                other => return Err(format!("unknown block attribute '{other}'")),
            }
        }
        self.current = Some(InsertPoint::Block(id));
        Ok(())
    }

    fn parse_slow_path(&mut self) -> Result<(), String> {
        let name = self.read_identifier()?;
        let id = self.slow_path_id(name);
        if !self.declared_slow_paths.insert(id) {
            return Err(format!("slow path '{name}' defined twice"));
        }
        self.expect(':')?;
        self.current = Some(InsertPoint::SlowPath(id));
        Ok(())
    }

    // ---- instructions ----

    fn parse_op(&mut self, mnemonic: &'a str) -> Result<(), String> {
        let at = self
            .current
            .ok_or_else(|| format!("'{mnemonic}' outside of a block"))?;
        let mut entered_slow_path = None;

        let op = match mnemonic {
            "jump" => {
                let target = self.read_identifier()?;
                X64Op::Jump(self.edge(target)?)
            }
            "goto" => {
                let target = self.read_identifier()?;
                X64Op::Goto(self.jump_target(target)?)
            }
            "branch" => {
                let cond = self.read_condition()?;
                let t = self.read_identifier()?;
                let true_dest = self.edge(t)?;
                let f = self.read_identifier()?;
                let false_dest = self.edge(f)?;
                X64Op::Branch {
                    cond,
                    true_dest,
                    false_dest,
                    true_probability: self.read_optional_float()?.unwrap_or(0.5),
                }
            }
            "branchto" => {
                let cond = self.read_condition()?;
                let name = self.read_identifier()?;
                let id = self.slow_path_id(name);
                entered_slow_path = Some(id);
                X64Op::BranchTo {
                    cond,
                    target: self.slow_path_label(name, id)?,
                }
            }
            "cmp" => {
                let left = self.read_reg()?;
                self.expect(',')?;
                X64Op::Compare {
                    left,
                    right: self.read_operand()?,
                }
            }
            "test" => {
                let left = self.read_reg()?;
                self.expect(',')?;
                X64Op::Test {
                    left,
                    right: self.read_reg()?,
                }
            }
            "add" | "sub" | "xor" => {
                let op = match mnemonic {
                    "add" => BinaryOp::Add,
                    "sub" => BinaryOp::Sub,
                    _ => BinaryOp::Xor,
                };
                let dst = self.read_reg()?;
                self.expect(',')?;
                X64Op::Binary {
                    op,
                    dst,
                    src: self.read_operand()?,
                }
            }
            "mov" => {
                let dst = self.read_reg()?;
                self.expect(',')?;
                X64Op::Move {
                    dst,
                    src: self.read_reg()?,
                }
            }
            "movi" => {
                let dst = self.read_reg()?;
                self.expect(',')?;
                X64Op::LoadImm {
                    dst,
                    value: self.read_int()?,
                }
            }
            "const" => {
                let dst = self.read_reg()?;
                self.expect(',')?;
                X64Op::LoadConst {
                    dst,
                    constant: self.read_constant()?,
                }
            }
            "load" => {
                let dst = self.read_reg()?;
                self.expect(',')?;
                let (base, disp) = self.read_address()?;
                X64Op::Load {
                    dst,
                    base,
                    disp,
                    state: self.read_optional_state()?,
                }
            }
            "store" => {
                let (base, disp) = self.read_address()?;
                self.expect(',')?;
                X64Op::Store {
                    base,
                    disp,
                    src: self.read_reg()?,
                    state: self.read_optional_state()?,
                }
            }
            "nullcheck" => X64Op::NullCheck {
                base: self.read_reg()?,
                state: self.read_state()?,
            },
            "call" => X64Op::DirectCall {
                target: self.read_symbol()?.to_string(),
                state: self.read_optional_state()?,
            },
            "rtcall" => X64Op::RuntimeCall {
                target: self.read_symbol()?.to_string(),
                state: self.read_optional_state()?,
            },
            "icall" => X64Op::IndirectCall {
                target: self.read_reg()?,
                state: self.read_optional_state()?,
            },
            "infopoint" => X64Op::Infopoint {
                reason: self.read_infopoint_reason()?,
                state: self.read_state()?,
            },
            "switch" => self.parse_switch()?,
            "ret" => X64Op::Return,
            "deadend" => X64Op::DeadEnd,
            "halt" => X64Op::Halt,
            "nop" => X64Op::Nop(self.read_u32()?),
            "bailout" => X64Op::Bailout(self.read_string()?),
            other => return Err(format!("unknown instruction '{other}'")),
        };

        let position = if self.try_read('!') {
            Some(self.read_position()?)
        } else {
            None
        };
        let inst = self
            .lir
            .push_with_position(at, op, position)
            .ok_or_else(|| format!("cannot append '{mnemonic}'"))?;

        if let (Some(slow_path), InsertPoint::Block(block)) = (entered_slow_path, at) {
            let has_origin = self
                .lir
                .slow_paths()
                .get(slow_path.0 as usize)
                .is_some_and(|s| s.origin.is_some());
            if !has_origin {
                self.lir.set_slow_path_origin(slow_path, (block, inst));
            }
        }
        Ok(())
    }

    /// `switch index, scratch, temp, low: t0 t1 ... default d`
    fn parse_switch(&mut self) -> Result<X64Op, String> {
        let index = self.read_reg()?;
        self.expect(',')?;
        let scratch = self.read_reg()?;
        self.expect(',')?;
        let temp = self.read_reg()?;
        self.expect(',')?;
        let low = self.read_i32()?;
        self.expect(':')?;

        let mut targets = Vec::new();
        loop {
            let name = self.read_identifier()?;
            if name == "default" {
                break;
            }
            targets.push(self.edge(name)?);
        }
        let name = self.read_identifier()?;
        let default = self.edge(name)?;
        Ok(X64Op::TableSwitch {
            index,
            scratch,
            temp,
            low,
            targets,
            default,
        })
    }

    // ---- names ----

    fn block_id(&mut self, name: &'a str) -> BlockId {
        if let Some(&id) = self.blocks.get(name) {
            return id;
        }
        let id = self.lir.add_block();
        self.blocks.insert(name, id);
        id
    }

    fn block_label(&mut self, name: &'a str) -> Result<Label, String> {
        let id = self.block_id(name);
        self.lir
            .block_label(id)
            .ok_or_else(|| format!("block '{name}' has no label"))
    }

    fn slow_path_id(&mut self, name: &'a str) -> SlowPathId {
        if let Some(&id) = self.slow_paths.get(name) {
            return id;
        }
        let id = self.lir.add_slow_path(None);
        self.slow_paths.insert(name, id);
        id
    }

    fn slow_path_label(&self, name: &str, id: SlowPathId) -> Result<Label, String> {
        self.lir
            .slow_path_label(id)
            .ok_or_else(|| format!("slow path '{name}' has no label"))
    }

    /// Target of a `goto`: a known slow path, otherwise a block.
    fn jump_target(&mut self, name: &'a str) -> Result<Label, String> {
        match self.slow_paths.get(name) {
            Some(&id) => self.slow_path_label(name, id),
            None => self.block_label(name),
        }
    }

    fn edge(&mut self, target: &'a str) -> Result<LabelRef, String> {
        let source = match self.current {
            Some(InsertPoint::Block(block)) => block,
            _ => return Err(format!("edge to '{target}' outside of a block")),
        };
        Ok(LabelRef::new(source, self.block_id(target)))
    }

    // ---- operands ----

    fn read_reg(&mut self) -> Result<AsmReg, String> {
        let name = self.read_identifier()?;
        parse_reg(name).ok_or_else(|| format!("unknown register '{name}'"))
    }

    fn read_operand(&mut self) -> Result<Operand, String> {
        match self.peek() {
            Some(c) if c.is_ascii_digit() || c == '-' => Ok(Operand::Imm(self.read_i32()?)),
            _ => Ok(Operand::Reg(self.read_reg()?)),
        }
    }

    /// `[base]`, `[base+disp]` or `[base-disp]`
    fn read_address(&mut self) -> Result<(AsmReg, i32), String> {
        self.expect('[')?;
        let base = self.read_reg()?;
        let disp = match self.peek() {
            Some('+') => {
                self.advance();
                self.read_i32()?
            }
            Some('-') => self.read_i32()?,
            _ => 0,
        };
        self.expect(']')?;
        Ok((base, disp))
    }

    fn read_condition(&mut self) -> Result<Condition, String> {
        let name = self.read_identifier()?;
        Condition::from_mnemonic(name).ok_or_else(|| format!("unknown condition '{name}'"))
    }

    fn read_constant(&mut self) -> Result<Constant, String> {
        match self.read_identifier()? {
            "int" => Ok(Constant::Int(self.read_i32()?)),
            "long" => Ok(Constant::Long(self.read_int()?)),
            "float" => Ok(Constant::float(self.read_float()? as f32)),
            "double" => Ok(Constant::double(self.read_float()?)),
            "bytes" => {
                let mut bytes = Vec::new();
                while !self.at_line_end() && self.peek() != Some('!') {
                    let token = self.read_while(|c| c.is_ascii_hexdigit());
                    let byte = u8::from_str_radix(token, 16)
                        .map_err(|_| format!("invalid byte '{token}'"))?;
                    bytes.push(byte);
                }
                if bytes.is_empty() {
                    return Err("empty byte constant".to_string());
                }
                Ok(Constant::Bytes(bytes.into_boxed_slice()))
            }
            other => Err(format!("unknown constant kind '{other}'")),
        }
    }

    fn read_infopoint_reason(&mut self) -> Result<InfopointReason, String> {
        match self.read_identifier()? {
            "call" => Ok(InfopointReason::Call),
            "safepoint" => Ok(InfopointReason::Safepoint),
            "method_start" => Ok(InfopointReason::MethodStart),
            "method_end" => Ok(InfopointReason::MethodEnd),
            "bytecode_position" => Ok(InfopointReason::BytecodePosition),
            "implicit" => Ok(InfopointReason::Implicit),
            other => Err(format!("unknown infopoint reason '{other}'")),
        }
    }

    /// `method@bci`
    fn read_position(&mut self) -> Result<SourcePosition, String> {
        let method = self.read_symbol()?;
        self.expect('@')?;
        let bci = self.read_i32()?;
        Ok(SourcePosition::new(method, bci))
    }

    /// `{ at m@bci frame handler=block lazy nodeopt }`, all attributes optional.
    fn read_state(&mut self) -> Result<LirFrameState, String> {
        self.expect('{')?;
        let mut position = None;
        let mut has_frame = false;
        let mut handler = None;
        let mut lazy = false;
        let mut deopt = true;
        while !self.try_read('}') {
            if self.at_line_end() {
                return Err("unterminated frame state".to_string());
            }
            match self.read_identifier()? {
                "at" => position = Some(self.read_position()?),
                "frame" => has_frame = true,
                "lazy" => lazy = true,
                "nodeopt" => deopt = false,
                "handler" => {
                    self.expect('=')?;
                    let name = self.read_identifier()?;
                    handler = Some(self.block_label(name)?);
                }
                other => return Err(format!("unknown frame state attribute '{other}'")),
            }
        }
        if has_frame && position.is_none() {
            return Err("'frame' requires a position".to_string());
        }

        let mut state = LirFrameState::new(position.map(|p| DebugInfo::new(p, has_frame)));
        if let Some(label) = handler {
            state = state.with_exception_edge(label);
        }
        if lazy {
            state = state.lazy();
        }
        if !deopt {
            state = state.invalid_for_deoptimization();
        }
        Ok(state)
    }

    fn read_optional_state(&mut self) -> Result<Option<LirFrameState>, String> {
        if self.peek() == Some('{') {
            self.read_state().map(Some)
        } else {
            Ok(None)
        }
    }

    fn read_string(&mut self) -> Result<String, String> {
        self.expect('"')?;
        let text = self.read_while(|c| c != '"' && c != '\n');
        self.expect('"')?;
        Ok(text.to_string())
    }

    // ---- numbers ----

    /// Signed decimal or `0x` hex. Hex literals are taken as 64-bit patterns.
    fn read_int(&mut self) -> Result<i64, String> {
        self.skip_whitespace(false);
        let negative = self.current_char() == Some('-');
        if negative {
            self.advance();
        }
        let token = self.read_while(|c| c.is_ascii_alphanumeric() || c == '_');
        if token.is_empty() {
            return Err("expected number".to_string());
        }
        let magnitude = match token.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => token.parse::<u64>(),
        }
        .map_err(|_| format!("invalid number '{token}'"))?;
        let value = magnitude as i64;
        Ok(if negative { value.wrapping_neg() } else { value })
    }

    fn read_i32(&mut self) -> Result<i32, String> {
        let value = self.read_int()?;
        i32::try_from(value).map_err(|_| format!("{value} does not fit in 32 bits"))
    }

    fn read_u32(&mut self) -> Result<u32, String> {
        let value = self.read_int()?;
        u32::try_from(value).map_err(|_| format!("{value} is not a valid size"))
    }

    fn read_float(&mut self) -> Result<f64, String> {
        self.skip_whitespace(false);
        let token =
            self.read_while(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-'));
        token
            .parse::<f64>()
            .map_err(|_| format!("invalid number '{token}'"))
    }

    fn read_optional_float(&mut self) -> Result<Option<f64>, String> {
        match self.peek() {
            Some(c) if c.is_ascii_digit() || c == '.' => self.read_float().map(Some),
            _ => Ok(None),
        }
    }

    // ---- cursor ----

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn line(&self) -> usize {
        self.text[..self.pos].matches('\n').count() + 1
    }

    /// Skip spaces and `;` comments. Newlines are only skipped when asked.
    fn skip_whitespace(&mut self, skip_newlines: bool) {
        while let Some(ch) = self.current_char() {
            match ch {
                '\n' if !skip_newlines => break,
                ';' => {
                    while let Some(c) = self.current_char() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                c if c.is_whitespace() => self.advance(),
                _ => break,
            }
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace(false);
        self.current_char()
    }

    fn at_line_end(&mut self) -> bool {
        matches!(self.peek(), None | Some('\n'))
    }

    fn expect_line_end(&mut self) -> Result<(), String> {
        match self.peek() {
            None => Ok(()),
            Some('\n') => {
                self.advance();
                Ok(())
            }
            Some(c) => Err(format!("unexpected '{c}' at end of line")),
        }
    }

    fn try_read(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<(), String> {
        if self.try_read(ch) {
            return Ok(());
        }
        match self.current_char() {
            Some(found) if found != '\n' => Err(format!("expected '{ch}', found '{found}'")),
            _ => Err(format!("expected '{ch}' before end of line")),
        }
    }

    fn read_while(&mut self, accept: impl Fn(char) -> bool) -> &'a str {
        let text = self.text;
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if !accept(ch) {
                break;
            }
            self.advance();
        }
        &text[start..self.pos]
    }

    fn read_identifier(&mut self) -> Result<&'a str, String> {
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            None | Some('\n') => return Err("expected identifier before end of line".to_string()),
            Some(c) => return Err(format!("expected identifier, found '{c}'")),
        }
        Ok(self.read_while(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.'))
    }

    /// Method or call target name: anything up to whitespace or a delimiter.
    fn read_symbol(&mut self) -> Result<&'a str, String> {
        self.skip_whitespace(false);
        let symbol = self.read_while(|c| !c.is_whitespace() && !"@{},;!\"".contains(c));
        if symbol.is_empty() {
            Err("expected name".to_string())
        } else {
            Ok(symbol)
        }
    }
}
