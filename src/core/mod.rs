// This module gathers the target-independent building blocks of portasm: the semantic type
// model (argument types, width classes), virtual registers and their per-function pool, the
// portable instruction set with memory operands and loop constructs, the function builder and
// the immutable Function it yields, physical register bookkeeping shared by the allocator,
// the per-encode arena session with its statistics, the target architecture enum, the opt-in
// external signature check and the error type used by every stage.

//! Core portasm infrastructure.
//!
//! # Key Components
//!
//! ## Functions (`function`, `instruction`, `vreg`, `types`)
//! - Explicit builder handle, no ambient current function
//! - Structural validation on every append
//!
//! ## Register bookkeeping (`register_file`)
//! - Bit sets over the general purpose and vector banks
//! - Allocation without eviction
//!
//! ## Session (`session`)
//! - One `bumpalo` arena per encode
//! - Encode statistics

pub mod declaration;
pub mod error;
pub mod function;
pub mod instruction;
pub mod register_file;
pub mod session;
pub mod target;
pub mod types;
pub mod vreg;

pub use declaration::ExternalDeclaration;
pub use error::{CompileError, CompileResult, ErrorKind, StructuralIssue};
pub use function::{begin_function, end_function, Function, FunctionBuilder, LoopHandle};
pub use instruction::{
    Item, ItemKind, JumpCondition, LabelRef, Loop, LoopCondition, LoopLabel, MemoryOperand,
    Opcode, Operand,
};
pub use register_file::{AsmReg, RegBitSet, RegisterFile};
pub use session::{EncodeSession, SessionStats};
pub use target::Architecture;
pub use types::{ArgType, Argument, RegBank, WidthClass};
pub use vreg::VirtualRegister;
