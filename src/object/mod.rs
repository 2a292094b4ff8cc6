// This module packages encoded functions into relocatable object files with the object
// crate. Every function lands in the .text section at a 16-byte aligned offset and gets a
// global function symbol; the object crate applies the platform symbol mangling (a leading
// underscore on Mach-O). ELF objects also carry an empty .note.GNU-stack section so linkers
// keep the stack non-executable. Next to the object bytes the writer produces an interop
// header: a C header for the C conventions, or a Go declaration stub for the Go convention.
// All functions in one object must share the writer's calling convention.

//! Object file output.

pub mod header;

use crate::core::error::{CompileError, CompileResult};
use crate::x64::calling_convention::CallingConvention;
use crate::x64::function_codegen::EncodedFunction;
use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};
use std::fmt;

/// Function alignment inside .text.
const FUNCTION_ALIGN: u64 = 16;

/// Default package for Go stubs.
pub const DEFAULT_GO_PACKAGE: &str = "main";

/// Object file container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectFormat {
    Elf,
    MachO,
    Coff,
    /// Recognised but not supported for x86-64.
    Xcoff,
}

impl ObjectFormat {
    pub const ALL: [ObjectFormat; 4] = [
        ObjectFormat::Elf,
        ObjectFormat::MachO,
        ObjectFormat::Coff,
        ObjectFormat::Xcoff,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ObjectFormat::Elf => "elf",
            ObjectFormat::MachO => "macho",
            ObjectFormat::Coff => "coff",
            ObjectFormat::Xcoff => "xcoff",
        }
    }

    pub fn from_name(name: &str) -> Option<ObjectFormat> {
        Self::ALL.into_iter().find(|format| format.name() == name)
    }

    /// Conventional object file extension.
    pub fn extension(self) -> &'static str {
        match self {
            ObjectFormat::Coff => "obj",
            _ => "o",
        }
    }

    fn binary_format(self) -> Option<BinaryFormat> {
        match self {
            ObjectFormat::Elf => Some(BinaryFormat::Elf),
            ObjectFormat::MachO => Some(BinaryFormat::MachO),
            ObjectFormat::Coff => Some(BinaryFormat::Coff),
            ObjectFormat::Xcoff => None,
        }
    }
}

impl fmt::Display for ObjectFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of interop header that accompanies an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    C,
    Go,
}

impl HeaderKind {
    pub fn for_convention(convention: CallingConvention) -> Self {
        if convention.is_c() {
            HeaderKind::C
        } else {
            HeaderKind::Go
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            HeaderKind::C => "h",
            HeaderKind::Go => "go",
        }
    }
}

/// Object bytes plus the matching interop header text.
#[derive(Debug, Clone)]
pub struct ObjectArtifact {
    pub format: ObjectFormat,
    pub bytes: Vec<u8>,
    pub header_kind: HeaderKind,
    pub header: String,
}

/// Collects encoded functions of one convention into one object file.
#[derive(Debug)]
pub struct ObjectWriter<'f> {
    format: ObjectFormat,
    convention: CallingConvention,
    go_package: String,
    functions: Vec<&'f EncodedFunction>,
}

impl<'f> ObjectWriter<'f> {
    pub fn new(format: ObjectFormat, convention: CallingConvention) -> Self {
        Self {
            format,
            convention,
            go_package: DEFAULT_GO_PACKAGE.to_string(),
            functions: Vec::new(),
        }
    }

    /// Package name written into Go stubs.
    pub fn with_go_package(mut self, package: impl Into<String>) -> Self {
        self.go_package = package.into();
        self
    }

    /// Queue a function. Its convention must match the writer's.
    pub fn add(&mut self, encoded: &'f EncodedFunction) -> CompileResult<()> {
        if self.format.binary_format().is_none() {
            return Err(unsupported(
                encoded,
                format!("{} objects cannot hold x86-64 code", self.format),
            ));
        }
        if encoded.convention != self.convention {
            return Err(unsupported(
                encoded,
                format!(
                    "encoded for {} but the object targets {}",
                    encoded.convention, self.convention
                ),
            ));
        }
        if self.functions.iter().any(|f| f.name == encoded.name) {
            return Err(unsupported(encoded, "symbol defined twice in one object".to_string()));
        }
        self.functions.push(encoded);
        Ok(())
    }

    /// Linker symbol for `encoded`. Body-less Go declarations resolve to the
    /// package-qualified name.
    pub fn symbol_name(&self, encoded: &EncodedFunction) -> String {
        match self.convention {
            CallingConvention::GoAmd64 => format!("{}.{}", self.go_package, encoded.name),
            _ => encoded.name.clone(),
        }
    }

    /// Write the object and its header.
    pub fn finish(self) -> CompileResult<ObjectArtifact> {
        let binary_format = self.format.binary_format().ok_or_else(|| {
            CompileError::UnsupportedTarget {
                function: String::new(),
                reason: format!("{} objects cannot hold x86-64 code", self.format),
            }
        })?;

        let mut obj = Object::new(binary_format, Architecture::X86_64, Endianness::Little);
        let text = obj.section_id(StandardSection::Text);
        for encoded in &self.functions {
            let offset = obj.append_section_data(text, &encoded.code, FUNCTION_ALIGN);
            let name = self.symbol_name(encoded);
            obj.add_symbol(Symbol {
                name: name.into_bytes(),
                value: offset,
                size: encoded.code.len() as u64,
                kind: SymbolKind::Text,
                scope: SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Section(text),
                flags: SymbolFlags::None,
            });
            log::debug!(
                "{}: placed {} bytes at .text+{offset:#x}",
                self.symbol_name(encoded),
                encoded.code.len()
            );
        }
        if binary_format == BinaryFormat::Elf {
            obj.add_section(Vec::new(), b".note.GNU-stack".to_vec(), SectionKind::Other);
        }
        let bytes = obj.write()?;

        let header_kind = HeaderKind::for_convention(self.convention);
        let header = match header_kind {
            HeaderKind::C => header::c_header(&self.functions),
            HeaderKind::Go => header::go_stub(&self.go_package, &self.functions)?,
        };
        log::info!(
            "wrote {} {} object with {} functions ({} bytes)",
            self.format,
            self.convention,
            self.functions.len(),
            bytes.len()
        );
        Ok(ObjectArtifact {
            format: self.format,
            bytes,
            header_kind,
            header,
        })
    }
}

fn unsupported(encoded: &EncodedFunction, reason: String) -> CompileError {
    CompileError::UnsupportedTarget {
        function: encoded.name.clone(),
        reason,
    }
}

/// Package a single encoded function.
pub fn to_object(
    encoded: &EncodedFunction,
    format: ObjectFormat,
    convention: CallingConvention,
) -> CompileResult<ObjectArtifact> {
    let mut writer = ObjectWriter::new(format, convention);
    writer.add(encoded)?;
    writer.finish()
}
