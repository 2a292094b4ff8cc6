// This module defines the error types for portasm using the thiserror crate. CompileError is
// the single structured error returned by every stage: structural problems found while a
// function is being built, placement failures under a calling convention, pseudo-ops naming
// undeclared arguments, register exhaustion (there is no spilling), addressing modes out of
// range, operand combinations with no x86-64 encoding, unsupported target/format pairs,
// encoder and object-writer failures, and mismatches reported by the opt-in external
// signature check. Every variant carries the function name and, where one exists, the index
// of the offending instruction. ErrorKind gives callers a flat tag to match on.

//! Error types for portasm.
//!
//! One `CompileError` per failure class, from building a function through writing its object.

use crate::core::types::WidthClass;
use thiserror::Error;

/// What a structural error is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralIssue {
    /// Register was not issued by this function's builder.
    UnissuedRegister,
    /// Wrong number of operands for the opcode.
    Arity { expected: usize, found: usize },
    /// Immediate in destination position.
    ImmediateDestination,
    /// Memory base or index register is not a 64-bit GP register.
    AddressRegister { class: WidthClass },
    /// No register operand fixes the memory access width.
    MissingMemoryWidth,
    /// Pseudo-load destination cannot hold the argument.
    ArgumentWidth { argument: String, class: WidthClass },
    /// Returned value does not match the declared return type.
    ReturnValue { reason: String },
    /// Loop closed out of order or never closed.
    UnbalancedLoop,
    /// Non-void function without a trailing return.
    MissingReturn,
    /// Two arguments share a name.
    DuplicateArgument { argument: String },
}

impl std::fmt::Display for StructuralIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StructuralIssue::UnissuedRegister => {
                write!(f, "register used before it was issued in this function")
            }
            StructuralIssue::Arity { expected, found } => {
                write!(f, "expected {expected} operands, found {found}")
            }
            StructuralIssue::ImmediateDestination => write!(f, "immediate used as destination"),
            StructuralIssue::AddressRegister { class } => {
                write!(f, "address register must be gp64, found {class}")
            }
            StructuralIssue::MissingMemoryWidth => {
                write!(f, "memory operand needs an explicit access width")
            }
            StructuralIssue::ArgumentWidth { argument, class } => {
                write!(f, "argument '{argument}' does not fit in a {class} register")
            }
            StructuralIssue::ReturnValue { reason } => write!(f, "invalid return: {reason}"),
            StructuralIssue::UnbalancedLoop => write!(f, "loops are not properly nested"),
            StructuralIssue::MissingReturn => {
                write!(f, "function with a return type must end with a return")
            }
            StructuralIssue::DuplicateArgument { argument } => {
                write!(f, "argument '{argument}' declared twice")
            }
        }
    }
}

/// Flat error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Structural,
    Placement,
    UnknownArgument,
    ResourceExhaustion,
    AddressingRange,
    UnsupportedTarget,
    UnsupportedOperands,
    Assembly,
    Object,
    SignatureMismatch,
}

/// Main error type for portasm.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("{function}: {issue}{}", location(.instruction, .operand))]
    Structural {
        function: String,
        instruction: Option<usize>,
        operand: Option<usize>,
        issue: StructuralIssue,
    },

    #[error("{function}: {subject} of type {ty} has no placement under the {convention} convention")]
    Placement {
        function: String,
        /// Argument name, or `return value`.
        subject: String,
        ty: String,
        convention: &'static str,
    },

    #[error("{function}: instruction {instruction} loads unknown argument '{argument}'")]
    UnknownArgument {
        function: String,
        argument: String,
        instruction: usize,
    },

    #[error("{function}: instruction {instruction} needs more than {available} live {class} registers")]
    ResourceExhaustion {
        function: String,
        instruction: usize,
        class: WidthClass,
        available: u32,
    },

    #[error("{function}: instruction {instruction}: {reason}")]
    AddressingRange {
        function: String,
        instruction: usize,
        reason: String,
    },

    #[error("{function}: no encoding for instruction {instruction}{}: {reason}", location(&None, .operand))]
    UnsupportedOperands {
        function: String,
        instruction: usize,
        operand: Option<usize>,
        reason: String,
    },

    #[error("{function}: unsupported target: {reason}")]
    UnsupportedTarget { function: String, reason: String },

    #[error("{function}: assembly failed: {reason}")]
    Assembly { function: String, reason: String },

    #[error("object file write failed: {0}")]
    Object(#[from] object::write::Error),

    #[error("{function}: declaration does not match: {reason}")]
    SignatureMismatch { function: String, reason: String },
}

fn location(instruction: &Option<usize>, operand: &Option<usize>) -> String {
    match (*instruction, *operand) {
        (Some(i), Some(o)) => format!(" (instruction {i}, operand {o})"),
        (Some(i), None) => format!(" (instruction {i})"),
        (None, Some(o)) => format!(" (operand {o})"),
        (None, None) => String::new(),
    }
}

impl CompileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompileError::Structural { .. } => ErrorKind::Structural,
            CompileError::Placement { .. } => ErrorKind::Placement,
            CompileError::UnknownArgument { .. } => ErrorKind::UnknownArgument,
            CompileError::ResourceExhaustion { .. } => ErrorKind::ResourceExhaustion,
            CompileError::AddressingRange { .. } => ErrorKind::AddressingRange,
            CompileError::UnsupportedOperands { .. } => ErrorKind::UnsupportedOperands,
            CompileError::UnsupportedTarget { .. } => ErrorKind::UnsupportedTarget,
            CompileError::Assembly { .. } => ErrorKind::Assembly,
            CompileError::Object(_) => ErrorKind::Object,
            CompileError::SignatureMismatch { .. } => ErrorKind::SignatureMismatch,
        }
    }

    /// Name of the function the error belongs to, if any.
    pub fn function(&self) -> Option<&str> {
        match self {
            CompileError::Structural { function, .. }
            | CompileError::Placement { function, .. }
            | CompileError::UnknownArgument { function, .. }
            | CompileError::ResourceExhaustion { function, .. }
            | CompileError::AddressingRange { function, .. }
            | CompileError::UnsupportedOperands { function, .. }
            | CompileError::UnsupportedTarget { function, .. }
            | CompileError::Assembly { function, .. }
            | CompileError::SignatureMismatch { function, .. } => Some(function),
            CompileError::Object(_) => None,
        }
    }

    /// Index of the offending instruction, if any.
    pub fn instruction(&self) -> Option<usize> {
        match self {
            CompileError::Structural { instruction, .. } => *instruction,
            CompileError::UnknownArgument { instruction, .. }
            | CompileError::ResourceExhaustion { instruction, .. }
            | CompileError::AddressingRange { instruction, .. }
            | CompileError::UnsupportedOperands { instruction, .. } => Some(*instruction),
            _ => None,
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_message_carries_location() {
        let err = CompileError::Structural {
            function: "add".to_string(),
            instruction: Some(3),
            operand: Some(1),
            issue: StructuralIssue::UnissuedRegister,
        };
        let text = err.to_string();
        assert!(text.starts_with("add: register used before"));
        assert!(text.contains("instruction 3, operand 1"));
        assert_eq!(err.kind(), ErrorKind::Structural);
        assert_eq!(err.instruction(), Some(3));
    }

    #[test]
    fn test_placement_names_subject() {
        let err = CompileError::Placement {
            function: "f".to_string(),
            subject: "v".to_string(),
            ty: "m256".to_string(),
            convention: "go",
        };
        assert_eq!(
            err.to_string(),
            "f: v of type m256 has no placement under the go convention"
        );
        assert_eq!(err.function(), Some("f"));
    }
}
