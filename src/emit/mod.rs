// This module renders an EncodedFunction as assembler source. The machine code is decoded
// back with iced-x86 and printed by the iced formatter for the requested dialect (GAS in
// AT&T syntax, NASM and MASM in Intel syntax), or by the Plan 9 renderer in `go` for Go
// assembly. Because every dialect starts from the same decoded bytes, all of them describe
// exactly the instructions that were encoded; branch targets are printed through a symbol
// resolver that maps label offsets back to loop label names. Each listing opens with a
// comment banner carrying the function prototype, the convention and the placement of every
// argument and of the return value. emit() is the single entry point that dispatches either
// to text rendering or to the object writer.

//! Assembler text emission.

pub mod go;

use crate::core::error::{CompileError, CompileResult};
use crate::core::types::{c_prototype, go_prototype};
use crate::object::{to_object, ObjectArtifact, ObjectFormat};
use crate::x64::calling_convention::CallingConvention;
use crate::x64::function_codegen::EncodedFunction;
use iced_x86::{
    Decoder, DecoderOptions, Formatter, GasFormatter, Instruction, MasmFormatter, NasmFormatter,
    NumberBase, OpKind, SymbolResolver, SymbolResult,
};
use std::collections::BTreeMap;
use std::fmt;

/// Assembler syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// GNU assembler, AT&T syntax.
    Gas,
    Nasm,
    Masm,
    /// Go (Plan 9) assembler.
    Go,
}

impl Dialect {
    pub const ALL: [Dialect; 4] = [Dialect::Gas, Dialect::Nasm, Dialect::Masm, Dialect::Go];

    pub fn name(self) -> &'static str {
        match self {
            Dialect::Gas => "gas",
            Dialect::Nasm => "nasm",
            Dialect::Masm => "masm",
            Dialect::Go => "go",
        }
    }

    pub fn from_name(name: &str) -> Option<Dialect> {
        Self::ALL.into_iter().find(|dialect| dialect.name() == name)
    }

    /// Line comment marker.
    pub fn comment(self) -> &'static str {
        match self {
            Dialect::Gas => "#",
            Dialect::Nasm | Dialect::Masm => ";",
            Dialect::Go => "//",
        }
    }

    /// Spelling of a function-local label.
    pub fn label(self, name: &str) -> String {
        match self {
            Dialect::Gas => format!(".L{name}"),
            Dialect::Nasm => format!(".{name}"),
            Dialect::Masm | Dialect::Go => name.to_string(),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Requested output of [`emit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text(Dialect),
    Object(ObjectFormat),
}

/// Result of [`emit`].
#[derive(Debug, Clone)]
pub enum Emitted {
    Text(String),
    Object(ObjectArtifact),
}

/// Render `encoded` in `mode`.
pub fn emit(encoded: &EncodedFunction, mode: OutputMode) -> CompileResult<Emitted> {
    match mode {
        OutputMode::Text(dialect) => to_text(encoded, dialect).map(Emitted::Text),
        OutputMode::Object(format) => {
            to_object(encoded, format, encoded.convention).map(Emitted::Object)
        }
    }
}

/// Render `encoded` as assembler source in `dialect`.
pub fn to_text(encoded: &EncodedFunction, dialect: Dialect) -> CompileResult<String> {
    if dialect == Dialect::Go && encoded.convention != CallingConvention::GoAmd64 {
        return Err(CompileError::UnsupportedTarget {
            function: encoded.name.clone(),
            reason: format!(
                "Go assembly needs the go convention, function was encoded for {}",
                encoded.convention
            ),
        });
    }
    let instructions = decode(encoded)?;
    let labels = label_names(encoded, dialect);
    let text = match dialect {
        Dialect::Go => go::render(encoded, &instructions, &labels)?,
        _ => render_iced(encoded, dialect, &instructions, &labels),
    };
    log::debug!(
        "{}: emitted {} lines of {dialect} assembly",
        encoded.name,
        text.lines().count()
    );
    Ok(text)
}

/// Decode the function's machine code back into instructions.
pub(crate) fn decode(encoded: &EncodedFunction) -> CompileResult<Vec<Instruction>> {
    let mut decoder = Decoder::with_ip(64, &encoded.code, 0, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut instruction = Instruction::default();
    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        if instruction.is_invalid() {
            return Err(CompileError::Assembly {
                function: encoded.name.clone(),
                reason: format!("undecodable bytes at offset {}", instruction.ip()),
            });
        }
        instructions.push(instruction);
    }
    Ok(instructions)
}

/// Dialect label names by code offset, in label order.
pub(crate) fn label_names(encoded: &EncodedFunction, dialect: Dialect) -> BTreeMap<u64, Vec<String>> {
    let mut labels: BTreeMap<u64, Vec<String>> = BTreeMap::new();
    for entry in encoded.labels.iter() {
        labels
            .entry(entry.offset)
            .or_default()
            .push(dialect.label(&entry.label.name()));
    }
    labels
}

/// Comment banner shared by every dialect.
pub(crate) fn banner(encoded: &EncodedFunction, dialect: Dialect) -> String {
    let c = dialect.comment();
    let prototype = match encoded.convention {
        CallingConvention::GoAmd64 => go_prototype(
            &encoded.name,
            &encoded.arguments,
            encoded.return_type.as_ref(),
        ),
        _ => None,
    }
    .unwrap_or_else(|| {
        c_prototype(
            &encoded.name,
            &encoded.arguments,
            encoded.return_type.as_ref(),
        )
    });

    let mut out = String::new();
    out += &format!("{c} Generated by portasm\n");
    out += &format!("{c} {prototype}\n");
    out += &format!(
        "{c} convention: {}, {} bytes\n",
        encoded.convention,
        encoded.size()
    );
    for (argument, location) in encoded.arguments.iter().zip(encoded.placement.arguments.iter()) {
        out += &format!("{c}   {}: {} in {location}\n", argument.name(), argument.ty());
    }
    if let (Some(ty), Some(location)) = (&encoded.return_type, &encoded.placement.ret) {
        out += &format!("{c}   return: {ty} in {location}\n");
    }
    out
}

/// Resolves near branch targets to label names.
struct LabelResolver {
    targets: BTreeMap<u64, String>,
}

impl SymbolResolver for LabelResolver {
    fn symbol(
        &mut self,
        instruction: &Instruction,
        _operand: u32,
        instruction_operand: Option<u32>,
        address: u64,
        _address_size: u32,
    ) -> Option<SymbolResult<'_>> {
        let operand = instruction_operand?;
        if instruction.op_kind(operand) != OpKind::NearBranch64 {
            return None;
        }
        self.targets
            .get(&address)
            .map(|name| SymbolResult::with_str(address, name.as_str()))
    }
}

fn render_iced(
    encoded: &EncodedFunction,
    dialect: Dialect,
    instructions: &[Instruction],
    labels: &BTreeMap<u64, Vec<String>>,
) -> String {
    let resolver = LabelResolver {
        targets: labels
            .iter()
            .filter_map(|(offset, names)| Some((*offset, names.first()?.clone())))
            .collect(),
    };
    let symbols: Option<Box<dyn SymbolResolver>> = Some(Box::new(resolver));
    let mut formatter: Box<dyn Formatter> = match dialect {
        Dialect::Nasm => Box::new(NasmFormatter::with_options(symbols, None)),
        Dialect::Masm => Box::new(MasmFormatter::with_options(symbols, None)),
        _ => Box::new(GasFormatter::with_options(symbols, None)),
    };
    let options = formatter.options_mut();
    options.set_number_base(NumberBase::Decimal);
    options.set_space_after_operand_separator(true);
    options.set_show_branch_size(false);
    options.set_gas_show_mnemonic_size_suffix(true);

    let name = &encoded.name;
    let mut out = banner(encoded, dialect);
    match dialect {
        Dialect::Nasm => {
            out.push_str("section .text\n");
            out += &format!("global {name}\n");
            out.push_str("align 16\n");
            out += &format!("{name}:\n");
        }
        Dialect::Masm => {
            out.push_str(".code\n");
            out += &format!("{name} PROC\n");
        }
        _ => {
            out.push_str("\t.text\n");
            out += &format!("\t.globl {name}\n");
            out.push_str("\t.p2align 4\n");
            out += &format!("{name}:\n");
        }
    }

    let mut line = String::new();
    for instruction in instructions {
        if let Some(names) = labels.get(&instruction.ip()) {
            for label in names {
                out += &format!("{label}:\n");
            }
        }
        line.clear();
        formatter.format(instruction, &mut line);
        out += &format!("\t{line}\n");
    }

    if dialect == Dialect::Masm {
        out += &format!("{name} ENDP\n");
        out.push_str("END\n");
    }
    out
}
