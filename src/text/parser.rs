//! Parser for textual function descriptions.

use super::{ParseError, ParseErrorKind};
use crate::core::error::CompileError;
use crate::core::function::{begin_function, Function, FunctionBuilder};
use crate::core::instruction::{JumpCondition, LoopCondition, MemoryOperand, Opcode, Operand};
use crate::core::types::{ArgType, Argument, WidthClass};
use crate::core::vreg::VirtualRegister;
use std::collections::HashMap;

/// Parse every function in `text`.
pub fn parse_module(text: &str) -> Result<Vec<Function>, ParseError> {
    Parser::new(text).parse()
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    functions: Vec<Function>,

    // Per-function register names
    registers: HashMap<&'a str, VirtualRegister>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            pos: 0,
            functions: Vec::new(),
            registers: HashMap::new(),
        }
    }

    fn parse(mut self) -> Result<Vec<Function>, ParseError> {
        self.skip_whitespace(true);
        while !self.is_eof() {
            let start = self.pos;
            let keyword = self.read_identifier()?;
            if keyword != "function" {
                return Err(self.expected_at(start, "'function'", format!("'{keyword}'")));
            }
            self.parse_function()?;
            self.skip_whitespace(true);
        }
        log::debug!("parsed {} functions", self.functions.len());
        Ok(self.functions)
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn current_char(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self, skip_newlines: bool) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                // Comment runs to the end of the line; the newline itself stays.
                while let Some(ch) = self.current_char() {
                    if ch == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else if ch.is_whitespace() {
                if ch == '\n' && !skip_newlines {
                    break;
                }
                self.advance();
            } else {
                break;
            }
        }
    }

    fn at_line_end(&mut self) -> bool {
        self.skip_whitespace(false);
        matches!(self.current_char(), None | Some('\n') | Some('}'))
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace(true);
        self.try_read_inline(ch)
    }

    fn try_read_inline(&mut self, ch: char) -> bool {
        self.skip_whitespace(false);
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<(), ParseError> {
        if !self.try_read(ch) {
            return Err(self.expected(&format!("'{ch}'")));
        }
        Ok(())
    }

    fn expect_inline(&mut self, ch: char) -> Result<(), ParseError> {
        if !self.try_read_inline(ch) {
            return Err(self.expected(&format!("'{ch}'")));
        }
        Ok(())
    }

    /// Consume `keyword` if it is the next whole word on this line.
    fn try_keyword(&mut self, keyword: &str) -> bool {
        self.skip_whitespace(false);
        let rest = &self.text[self.pos..];
        let whole = rest
            .strip_prefix(keyword)
            .is_some_and(|after| !after.starts_with(|c: char| c.is_alphanumeric() || c == '_'));
        if whole {
            self.pos += keyword.len();
        }
        whole
    }

    fn read_identifier(&mut self) -> Result<&'a str, ParseError> {
        self.skip_whitespace(true);
        let start = self.pos;
        match self.current_char() {
            Some(ch) if ch.is_alphabetic() || ch == '_' => {}
            _ => return Err(self.expected("identifier")),
        }
        while let Some(ch) = self.current_char() {
            if ch.is_alphanumeric() || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        Ok(&self.text[start..self.pos])
    }

    fn read_integer(&mut self) -> Result<i64, ParseError> {
        self.skip_whitespace(false);
        let start = self.pos;
        let negative = self.try_read_inline('-');
        let digits_start = self.pos;
        let hex = self.text[self.pos..].starts_with("0x") || self.text[self.pos..].starts_with("0X");
        if hex {
            self.pos += 2;
        }
        while let Some(ch) = self.current_char() {
            if ch.is_ascii_hexdigit() && (hex || ch.is_ascii_digit()) || ch == '_' {
                self.advance();
            } else {
                break;
            }
        }
        let literal = &self.text[start..self.pos];
        let digits: String = self.text[digits_start..self.pos]
            .trim_start_matches("0x")
            .trim_start_matches("0X")
            .chars()
            .filter(|&c| c != '_')
            .collect();
        let invalid = || ParseErrorKind::InvalidNumber(literal.to_string());
        if digits.is_empty() {
            return Err(self.error_at(start, invalid()));
        }
        let magnitude = u64::from_str_radix(&digits, if hex { 16 } else { 10 })
            .map_err(|_| self.error_at(start, invalid()))?;
        // Values up to u64::MAX are taken as their two's complement bit pattern.
        let value = if negative {
            if magnitude > i64::MIN.unsigned_abs() {
                return Err(self.error_at(start, invalid()));
            }
            (magnitude as i64).wrapping_neg()
        } else {
            magnitude as i64
        };
        Ok(value)
    }

    fn parse_function(&mut self) -> Result<(), ParseError> {
        let name = self.read_identifier()?;
        self.expect('(')?;
        let mut arguments = Vec::new();
        if !self.try_read(')') {
            loop {
                let arg_name = self.read_identifier()?;
                self.expect(':')?;
                let ty = self.parse_type()?;
                arguments.push(Argument::new(arg_name, ty));
                if self.try_read(')') {
                    break;
                }
                self.expect(',')?;
            }
        }
        self.skip_whitespace(true);
        let return_type = if self.text[self.pos..].starts_with("->") {
            self.pos += 2;
            Some(self.parse_type()?)
        } else {
            None
        };
        self.expect('{')?;

        self.registers.clear();
        let mut builder = begin_function(name, arguments, return_type);
        let close = self.parse_block(&mut builder)?;
        let function = builder
            .end_function()
            .map_err(|err| self.compile_error(close, err))?;
        log::debug!(
            "parsed function '{}' with {} items",
            function.name(),
            function.item_count()
        );
        self.functions.push(function);
        Ok(())
    }

    /// Parse statements up to and including the closing brace. Returns the
    /// position of the brace.
    fn parse_block(&mut self, builder: &mut FunctionBuilder) -> Result<usize, ParseError> {
        loop {
            self.skip_whitespace(true);
            let start = self.pos;
            if self.is_eof() {
                return Err(self.expected("'}'"));
            }
            if self.try_read('}') {
                return Ok(start);
            }
            self.parse_statement(builder, start)?;
            if !self.at_line_end() {
                return Err(self.expected("end of line"));
            }
        }
    }

    fn parse_statement(
        &mut self,
        builder: &mut FunctionBuilder,
        start: usize,
    ) -> Result<(), ParseError> {
        let word = self.read_identifier()?;
        match word {
            "reg" => {
                let name_start = self.pos;
                let name = self.read_identifier()?;
                self.expect_inline(':')?;
                let class = self.parse_class()?;
                if self.registers.contains_key(name) {
                    return Err(self.error_at(
                        name_start,
                        ParseErrorKind::DuplicateRegister(name.to_string()),
                    ));
                }
                let reg = builder.issue_register(class);
                self.registers.insert(name, reg);
            }
            "load" => {
                let destination = self.read_register()?;
                self.expect_inline(',')?;
                let arg_start = self.pos;
                let arg_name = self.read_identifier()?;
                let argument = builder.argument(arg_name).cloned().ok_or_else(|| {
                    self.error_at(arg_start, ParseErrorKind::UnknownArgument(arg_name.to_string()))
                })?;
                builder
                    .load_argument(&argument, destination)
                    .map_err(|err| self.compile_error(start, err))?;
            }
            "return" => {
                let value = if self.at_line_end() {
                    None
                } else {
                    Some(self.parse_operand()?)
                };
                builder
                    .ret(value)
                    .map_err(|err| self.compile_error(start, err))?;
            }
            "loop" => self.parse_loop(builder)?,
            mnemonic => {
                let opcode = Opcode::from_mnemonic(mnemonic).ok_or_else(|| {
                    self.error_at(start, ParseErrorKind::UnknownMnemonic(mnemonic.to_string()))
                })?;
                let operands = self.parse_operands()?;
                builder
                    .emit(opcode, operands)
                    .map_err(|err| self.compile_error(start, err))?;
            }
        }
        Ok(())
    }

    fn parse_loop(&mut self, builder: &mut FunctionBuilder) -> Result<(), ParseError> {
        let kind_start = self.pos;
        let kind = self.read_identifier()?;
        let condition = match kind {
            "countdown" => LoopCondition::CountDown(self.read_register()?),
            "while" => {
                let condition = self.read_condition()?;
                let lhs = self.parse_operand()?;
                self.expect_inline(',')?;
                let rhs = self.parse_operand()?;
                LoopCondition::Compare {
                    condition,
                    lhs,
                    rhs,
                }
            }
            "flags" => LoopCondition::Flags(self.read_condition()?),
            other => {
                return Err(self.error_at(kind_start, ParseErrorKind::UnknownLoop(other.to_string())))
            }
        };
        self.expect_inline('{')?;
        let handle = builder.begin_loop();
        let close = self.parse_block(builder)?;
        builder
            .end_loop(handle, condition)
            .map_err(|err| self.compile_error(close, err))
    }

    fn read_condition(&mut self) -> Result<JumpCondition, ParseError> {
        let start = self.pos;
        let word = self.read_identifier()?;
        JumpCondition::from_keyword(word)
            .ok_or_else(|| self.error_at(start, ParseErrorKind::UnknownCondition(word.to_string())))
    }

    fn read_register(&mut self) -> Result<VirtualRegister, ParseError> {
        self.skip_whitespace(false);
        let start = self.pos;
        let name = self.read_identifier()?;
        self.lookup_register(start, name)
    }

    fn lookup_register(&self, start: usize, name: &str) -> Result<VirtualRegister, ParseError> {
        self.registers.get(name).copied().ok_or_else(|| {
            self.error_at(start, ParseErrorKind::UndeclaredRegister(name.to_string()))
        })
    }

    fn parse_operands(&mut self) -> Result<Vec<Operand>, ParseError> {
        let mut operands = Vec::new();
        if self.at_line_end() {
            return Ok(operands);
        }
        loop {
            operands.push(self.parse_operand()?);
            if !self.try_read_inline(',') {
                return Ok(operands);
            }
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, ParseError> {
        self.skip_whitespace(false);
        let start = self.pos;
        match self.current_char() {
            Some('[') => Ok(Operand::Memory(self.parse_memory(None)?)),
            Some(ch) if ch == '-' || ch.is_ascii_digit() => {
                Ok(Operand::Immediate(self.read_integer()?))
            }
            Some(ch) if ch.is_alphabetic() || ch == '_' => {
                let word = self.read_identifier()?;
                match width_keyword(word) {
                    Some(width) => {
                        self.try_keyword("ptr");
                        Ok(Operand::Memory(self.parse_memory(Some(width))?))
                    }
                    None => Ok(Operand::Register(self.lookup_register(start, word)?)),
                }
            }
            _ => Err(self.expected("operand")),
        }
    }

    /// `[base (+ index(*scale))? (+|- disp)*]`
    fn parse_memory(&mut self, width: Option<WidthClass>) -> Result<MemoryOperand, ParseError> {
        self.expect_inline('[')?;
        let base = self.read_register()?;
        let mut index = None;
        let mut scale = 1u8;
        let mut displacement = 0i64;
        loop {
            if self.try_read_inline(']') {
                break;
            }
            let negative = if self.try_read_inline('+') {
                false
            } else if self.try_read_inline('-') {
                true
            } else {
                return Err(self.expected("'+', '-' or ']'"));
            };
            self.skip_whitespace(false);
            let start = self.pos;
            if self.current_char().is_some_and(|ch| ch.is_ascii_digit()) {
                let value = self.read_integer()?;
                let value = if negative { value.checked_neg() } else { Some(value) };
                displacement = value
                    .and_then(|v| displacement.checked_add(v))
                    .ok_or_else(|| {
                        self.error_at(start, ParseErrorKind::InvalidNumber(self.text[start..self.pos].to_string()))
                    })?;
            } else if negative || index.is_some() {
                return Err(self.expected("displacement"));
            } else {
                index = Some(self.read_register()?);
                if self.try_read_inline('*') {
                    let scale_start = self.pos;
                    let value = self.read_integer()?;
                    scale = u8::try_from(value).map_err(|_| {
                        self.error_at(scale_start, ParseErrorKind::InvalidNumber(value.to_string()))
                    })?;
                }
            }
        }
        let mut mem = match index {
            Some(index) => MemoryOperand::indexed(base, index, scale, displacement),
            None => MemoryOperand::base_disp(base, displacement),
        };
        if let Some(width) = width {
            mem = mem.sized(width);
        }
        Ok(mem)
    }

    fn parse_type(&mut self) -> Result<ArgType, ParseError> {
        if self.try_read('*') {
            return Ok(ArgType::ptr_to(self.parse_type()?));
        }
        let start = self.pos;
        let word = self.read_identifier()?;
        let ty = match word {
            "u8" => ArgType::U8,
            "u16" => ArgType::U16,
            "u32" => ArgType::U32,
            "u64" => ArgType::U64,
            "i8" => ArgType::I8,
            "i16" => ArgType::I16,
            "i32" => ArgType::I32,
            "i64" => ArgType::I64,
            "bool" => ArgType::Bool,
            "usize" => ArgType::USIZE,
            "isize" => ArgType::ISIZE,
            "f32" => ArgType::Float32,
            "f64" => ArgType::Float64,
            "m128" => ArgType::Vector128,
            "m256" => ArgType::Vector256,
            "ptr" => ArgType::ptr(),
            other => return Err(self.error_at(start, ParseErrorKind::UnknownType(other.to_string()))),
        };
        Ok(ty)
    }

    fn parse_class(&mut self) -> Result<WidthClass, ParseError> {
        self.skip_whitespace(false);
        let start = self.pos;
        let word = self.read_identifier()?;
        let class = match word {
            "gp8" => WidthClass::Gp8,
            "gp16" => WidthClass::Gp16,
            "gp32" => WidthClass::Gp32,
            "gp64" => WidthClass::Gp64,
            "xmm" => WidthClass::Xmm,
            "ymm" => WidthClass::Ymm,
            other => return Err(self.error_at(start, ParseErrorKind::UnknownClass(other.to_string()))),
        };
        Ok(class)
    }

    fn found(&self) -> String {
        match self.current_char() {
            None => "end of input".to_string(),
            Some('\n') => "end of line".to_string(),
            Some(ch) => format!("'{ch}'"),
        }
    }

    fn expected(&self, what: &str) -> ParseError {
        self.expected_at(self.pos, what, self.found())
    }

    fn expected_at(&self, pos: usize, what: &str, found: String) -> ParseError {
        self.error_at(
            pos,
            ParseErrorKind::Expected {
                expected: what.to_string(),
                found,
            },
        )
    }

    fn compile_error(&self, pos: usize, err: CompileError) -> ParseError {
        self.error_at(pos, ParseErrorKind::Compile(err))
    }

    fn error_at(&self, pos: usize, kind: ParseErrorKind) -> ParseError {
        let before = &self.text[..pos.min(self.text.len())];
        let line = before.matches('\n').count() + 1;
        let line_start = before.rfind('\n').map_or(0, |i| i + 1);
        let column = before[line_start..].chars().count() + 1;
        ParseError { line, column, kind }
    }
}

fn width_keyword(word: &str) -> Option<WidthClass> {
    let width = match word {
        "byte" => WidthClass::Gp8,
        "word" => WidthClass::Gp16,
        "dword" => WidthClass::Gp32,
        "qword" => WidthClass::Gp64,
        "xmmword" => WidthClass::Xmm,
        "ymmword" => WidthClass::Ymm,
        _ => return None,
    };
    Some(width)
}
