//! Textual function descriptions.
//!
//! A small line-oriented language for writing portasm functions without the
//! Rust builder API. Each `function` block is replayed through the builder, so
//! everything the builder validates is validated here too and reported with
//! the line and column of the offending statement.
//!
//! ```text
//! ; comment
//! function sum(ptr: *u64, len: usize, cap: usize) -> u64 {
//!     reg p: gp64
//!     reg n: gp64
//!     reg acc: gp64
//!     load p, ptr
//!     load n, len
//!     xor acc, acc
//!     loop countdown n {
//!         add acc, qword [p]
//!         add p, 8
//!     }
//!     return acc
//! }
//! ```

mod parser;

pub use parser::parse_module;

use crate::core::error::CompileError;
use thiserror::Error;

/// What went wrong while parsing.
#[derive(Error, Debug)]
pub enum ParseErrorKind {
    #[error("expected {expected}, found {found}")]
    Expected { expected: String, found: String },

    #[error("unknown type '{0}'")]
    UnknownType(String),

    #[error("unknown register class '{0}'")]
    UnknownClass(String),

    #[error("unknown mnemonic '{0}'")]
    UnknownMnemonic(String),

    #[error("unknown condition '{0}'")]
    UnknownCondition(String),

    #[error("unknown loop kind '{0}'")]
    UnknownLoop(String),

    #[error("register '{0}' is not declared")]
    UndeclaredRegister(String),

    #[error("register '{0}' declared twice")]
    DuplicateRegister(String),

    #[error("function has no argument '{0}'")]
    UnknownArgument(String),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Parse failure with its source position (1-based).
#[derive(Error, Debug)]
#[error("line {line}, column {column}: {kind}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub kind: ParseErrorKind,
}

impl ParseError {
    /// The builder error behind this failure, if any.
    pub fn compile_error(&self) -> Option<&CompileError> {
        match &self.kind {
            ParseErrorKind::Compile(err) => Some(err),
            _ => None,
        }
    }
}
