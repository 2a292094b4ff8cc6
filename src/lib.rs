//! portasm - a portable assembler for x86-64.
//!
//! Functions are written once against virtual registers and a small portable
//! instruction set, then lowered to machine code for a chosen calling
//! convention: arguments are placed by the convention, pseudo-instructions load
//! them and return results, registers are allocated by linear scan and the
//! result is encoded with iced-x86. Encoded functions can be rendered as
//! GAS, NASM, MASM or Go assembly, or written to ELF, Mach-O or COFF objects
//! together with a C header or Go declaration stub.
//!
//! # Primary Usage
//!
//! ```
//! use portasm::{begin_function, encode, to_text, ArgType, Argument, Architecture,
//!               CallingConvention, Dialect, Opcode, WidthClass};
//!
//! let f1 = Argument::new("f1", ArgType::U64);
//! let f2 = Argument::new("f2", ArgType::U16);
//! let mut b = begin_function("add", vec![f1.clone(), f2.clone()], Some(ArgType::U64));
//! let x = b.issue_register(WidthClass::Gp64);
//! let y = b.issue_register(WidthClass::Gp64);
//! b.load_argument(&f1, x)?;
//! b.load_argument(&f2, y)?;
//! b.emit(Opcode::Add, vec![x.into(), y.into()])?;
//! b.ret(Some(x.into()))?;
//! let function = b.end_function()?;
//!
//! let encoded = encode(&function, Architecture::X86_64, CallingConvention::GoAmd64)?;
//! let text = to_text(&encoded, Dialect::Go)?;
//! assert!(text.contains("ADDQ CX, AX"));
//! # Ok::<(), portasm::CompileError>(())
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Types, builder, instructions, registers, errors
//! - [`x64`] - Placement, expansion, allocation, encoding
//! - [`emit`] - Assembler text in four dialects
//! - [`object`] - Object files and interop headers
//! - [`text`] - Textual function descriptions
//! - [`module`] - Multi-function modules

pub mod core;
pub mod emit;
pub mod module;
pub mod object;
pub mod text;
pub mod x64;

pub use crate::core::{
    begin_function, end_function, ArgType, Architecture, Argument, CompileError, CompileResult,
    ErrorKind, ExternalDeclaration, Function, FunctionBuilder, JumpCondition, LoopCondition,
    MemoryOperand, Opcode, Operand, VirtualRegister, WidthClass,
};
pub use crate::emit::{emit, to_text, Dialect, Emitted, OutputMode};
pub use crate::module::Module;
pub use crate::object::{to_object, HeaderKind, ObjectArtifact, ObjectFormat, ObjectWriter};
pub use crate::text::{parse_module, ParseError};
pub use crate::x64::{encode, CallingConvention, EncodedFunction};
