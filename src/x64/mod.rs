//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Calling convention tables and argument placement
//! - Pseudo-instruction expansion
//! - Linear-scan register allocation
//! - Instruction selection and encoding using iced-x86
//! - The per-function encode pipeline

pub mod allocator;
pub mod calling_convention;
pub mod encoder;
pub mod expander;
pub mod function_codegen;
pub mod registers;

pub use calling_convention::{
    place, place_arguments, place_return, CallingConvention, FrameSummary, Location, Placement,
};
pub use function_codegen::{encode, EncodedFunction, LabelOffset};
