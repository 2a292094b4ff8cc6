// This module defines the semantic type model shared by every stage of portasm. ArgType
// describes what an argument or return value *means* (fixed-width integers, bool, pointer
// sized integers, pointers, floats and SIMD vectors) independently of where a calling
// convention puts it. WidthClass describes the storage class of a virtual register or memory
// access (8/16/32/64-bit general purpose, 128/256-bit vector). Argument binds a name and an
// ArgType at a fixed declaration position. The same descriptors drive placement, argument
// extension during expansion, prototype comments in assembler text and interop headers.

//! Semantic types, width classes and arguments.

use std::fmt;

/// Register bank a value lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegBank {
    GeneralPurpose = 0,
    Vector = 1,
}

/// Storage class of a register or memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WidthClass {
    Gp8,
    Gp16,
    Gp32,
    Gp64,
    Xmm,
    Ymm,
}

impl WidthClass {
    /// Width in bytes.
    pub const fn bytes(self) -> u32 {
        match self {
            WidthClass::Gp8 => 1,
            WidthClass::Gp16 => 2,
            WidthClass::Gp32 => 4,
            WidthClass::Gp64 => 8,
            WidthClass::Xmm => 16,
            WidthClass::Ymm => 32,
        }
    }

    pub const fn bank(self) -> RegBank {
        match self {
            WidthClass::Gp8 | WidthClass::Gp16 | WidthClass::Gp32 | WidthClass::Gp64 => {
                RegBank::GeneralPurpose
            }
            WidthClass::Xmm | WidthClass::Ymm => RegBank::Vector,
        }
    }

    /// General-purpose class holding exactly `bytes` bytes.
    pub const fn gp_for_bytes(bytes: u32) -> Option<WidthClass> {
        match bytes {
            1 => Some(WidthClass::Gp8),
            2 => Some(WidthClass::Gp16),
            4 => Some(WidthClass::Gp32),
            8 => Some(WidthClass::Gp64),
            _ => None,
        }
    }

    /// Keyword used for memory access widths in Intel-style listings.
    pub const fn ptr_keyword(self) -> &'static str {
        match self {
            WidthClass::Gp8 => "byte",
            WidthClass::Gp16 => "word",
            WidthClass::Gp32 => "dword",
            WidthClass::Gp64 => "qword",
            WidthClass::Xmm => "xmmword",
            WidthClass::Ymm => "ymmword",
        }
    }
}

impl fmt::Display for WidthClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WidthClass::Gp8 => "gp8",
            WidthClass::Gp16 => "gp16",
            WidthClass::Gp32 => "gp32",
            WidthClass::Gp64 => "gp64",
            WidthClass::Xmm => "xmm",
            WidthClass::Ymm => "ymm",
        };
        f.write_str(name)
    }
}

/// Semantic type of an argument or return value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArgType {
    /// Fixed-width integer of 1, 2, 4 or 8 bytes.
    Int { bytes: u8, signed: bool },
    Bool,
    /// Pointer-sized integer (`size_t` / `ptrdiff_t`, Go `uintptr` / `int`).
    Size { signed: bool },
    /// Pointer-sized opaque value, optionally typed for prototypes.
    Pointer(Option<Box<ArgType>>),
    Float32,
    Float64,
    Vector128,
    Vector256,
}

impl ArgType {
    pub const U8: ArgType = ArgType::Int { bytes: 1, signed: false };
    pub const U16: ArgType = ArgType::Int { bytes: 2, signed: false };
    pub const U32: ArgType = ArgType::Int { bytes: 4, signed: false };
    pub const U64: ArgType = ArgType::Int { bytes: 8, signed: false };
    pub const I8: ArgType = ArgType::Int { bytes: 1, signed: true };
    pub const I16: ArgType = ArgType::Int { bytes: 2, signed: true };
    pub const I32: ArgType = ArgType::Int { bytes: 4, signed: true };
    pub const I64: ArgType = ArgType::Int { bytes: 8, signed: true };
    pub const USIZE: ArgType = ArgType::Size { signed: false };
    pub const ISIZE: ArgType = ArgType::Size { signed: true };

    /// Untyped pointer.
    pub const fn ptr() -> ArgType {
        ArgType::Pointer(None)
    }

    /// Pointer to `pointee`.
    pub fn ptr_to(pointee: ArgType) -> ArgType {
        ArgType::Pointer(Some(Box::new(pointee)))
    }

    /// Size in bytes on x86-64.
    pub fn size(&self) -> u32 {
        match self {
            ArgType::Int { bytes, .. } => u32::from(*bytes),
            ArgType::Bool => 1,
            ArgType::Size { .. } | ArgType::Pointer(_) => 8,
            ArgType::Float32 => 4,
            ArgType::Float64 => 8,
            ArgType::Vector128 => 16,
            ArgType::Vector256 => 32,
        }
    }

    /// Natural alignment in bytes.
    pub fn align(&self) -> u32 {
        self.size()
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            ArgType::Int { signed: true, .. } | ArgType::Size { signed: true }
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ArgType::Float32 | ArgType::Float64)
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, ArgType::Vector128 | ArgType::Vector256)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, ArgType::Pointer(_))
    }

    pub fn bank(&self) -> RegBank {
        if self.is_float() || self.is_vector() {
            RegBank::Vector
        } else {
            RegBank::GeneralPurpose
        }
    }

    /// Narrowest register class able to hold the value.
    pub fn natural_class(&self) -> WidthClass {
        match self {
            ArgType::Float32 | ArgType::Float64 | ArgType::Vector128 => WidthClass::Xmm,
            ArgType::Vector256 => WidthClass::Ymm,
            other => WidthClass::gp_for_bytes(other.size()).unwrap_or(WidthClass::Gp64),
        }
    }

    /// Whether a register of `class` can receive this value.
    pub fn fits_in(&self, class: WidthClass) -> bool {
        class.bank() == self.bank() && class.bytes() >= self.natural_class().bytes()
    }

    /// Nearest fixed-width C type.
    pub fn c_type(&self) -> String {
        match self {
            ArgType::Int { bytes, signed } => {
                format!("{}int{}_t", if *signed { "" } else { "u" }, u32::from(*bytes) * 8)
            }
            ArgType::Bool => "bool".to_string(),
            ArgType::Size { signed: false } => "size_t".to_string(),
            ArgType::Size { signed: true } => "ptrdiff_t".to_string(),
            ArgType::Pointer(None) => "void*".to_string(),
            ArgType::Pointer(Some(pointee)) => format!("{}*", pointee.c_type()),
            ArgType::Float32 => "float".to_string(),
            ArgType::Float64 => "double".to_string(),
            ArgType::Vector128 => "__m128i".to_string(),
            ArgType::Vector256 => "__m256i".to_string(),
        }
    }

    /// Go spelling, if Go can express the type.
    pub fn go_type(&self) -> Option<String> {
        let name = match self {
            ArgType::Int { bytes, signed } => {
                format!("{}int{}", if *signed { "" } else { "u" }, u32::from(*bytes) * 8)
            }
            ArgType::Bool => "bool".to_string(),
            ArgType::Size { signed: false } => "uintptr".to_string(),
            ArgType::Size { signed: true } => "int".to_string(),
            ArgType::Pointer(None) => "unsafe.Pointer".to_string(),
            ArgType::Pointer(Some(pointee)) => format!("*{}", pointee.go_type()?),
            ArgType::Float32 => "float32".to_string(),
            ArgType::Float64 => "float64".to_string(),
            ArgType::Vector128 | ArgType::Vector256 => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgType::Int { bytes, signed } => {
                write!(f, "{}{}", if *signed { 'i' } else { 'u' }, u32::from(*bytes) * 8)
            }
            ArgType::Bool => f.write_str("bool"),
            ArgType::Size { signed: false } => f.write_str("usize"),
            ArgType::Size { signed: true } => f.write_str("isize"),
            ArgType::Pointer(None) => f.write_str("ptr"),
            ArgType::Pointer(Some(pointee)) => write!(f, "*{pointee}"),
            ArgType::Float32 => f.write_str("f32"),
            ArgType::Float64 => f.write_str("f64"),
            ArgType::Vector128 => f.write_str("m128"),
            ArgType::Vector256 => f.write_str("m256"),
        }
    }
}

/// A named, typed function argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Argument {
    name: String,
    ty: ArgType,
}

impl Argument {
    pub fn new(name: impl Into<String>, ty: ArgType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ty(&self) -> &ArgType {
        &self.ty
    }
}

/// Render `name(a: T, ...)`-style C prototype text.
pub fn c_prototype(name: &str, arguments: &[Argument], return_type: Option<&ArgType>) -> String {
    let ret = return_type.map_or_else(|| "void".to_string(), ArgType::c_type);
    let args = if arguments.is_empty() {
        "void".to_string()
    } else {
        arguments
            .iter()
            .map(|arg| format!("{} {}", arg.ty().c_type(), arg.name()))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!("{ret} {name}({args})")
}

/// Render a Go `func` declaration, if every type has a Go spelling.
pub fn go_prototype(
    name: &str,
    arguments: &[Argument],
    return_type: Option<&ArgType>,
) -> Option<String> {
    let mut args = Vec::with_capacity(arguments.len());
    for arg in arguments {
        args.push(format!("{} {}", arg.name(), arg.ty().go_type()?));
    }
    let mut decl = format!("func {name}({})", args.join(", "));
    if let Some(ret) = return_type {
        decl.push(' ');
        decl.push_str(&ret.go_type()?);
    }
    Some(decl)
}
