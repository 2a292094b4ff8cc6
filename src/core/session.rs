// This module provides the arena-based encode session used while one function is lowered to
// machine code. EncodeSession borrows a bumpalo arena that outlives every intermediate
// structure of the pipeline (expanded machine items, live intervals, the virtual to physical
// assignment table) so those structures share one lifetime and are released together when
// encode returns. Only the final EncodedFunction is copied out of the arena. The session
// also records per-function statistics (expanded items, allocated registers, encoded
// instructions by mnemonic, code size) which are logged at debug level.

//! Arena-based encode session.
//!
//! All per-function encode state lives in the session arena and shares its
//! lifetime; nothing allocated here survives the end of `encode`.

use crate::core::register_file::AsmReg;
use crate::core::vreg::VirtualRegister;
use bumpalo::Bump;
use hashbrown::{DefaultHashBuilder, HashMap};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

/// Virtual to physical mapping, allocated in the session arena.
pub type AssignmentMap<'arena> = HashMap<VirtualRegister, AsmReg, DefaultHashBuilder, &'arena Bump>;

/// Per-function encode session.
pub struct EncodeSession<'arena> {
    /// Arena allocator for encode objects.
    arena: &'arena Bump,

    /// Name of the function being encoded.
    function: &'arena str,

    /// Session statistics for debugging.
    stats: RefCell<SessionStats>,
}

impl<'arena> EncodeSession<'arena> {
    /// Create a new encode session for `function` in the given arena.
    pub fn new(arena: &'arena Bump, function: &str) -> Self {
        Self {
            arena,
            function: arena.alloc_str(function),
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Name of the function being encoded.
    pub fn function(&self) -> &'arena str {
        self.function
    }

    /// Empty assignment table in the arena.
    pub fn assignment_map(&self) -> AssignmentMap<'arena> {
        HashMap::new_in(self.arena)
    }

    /// Record the size of the expanded machine item stream.
    pub fn record_expanded(&self, items: usize) {
        self.stats.borrow_mut().machine_items = items;
    }

    /// Record register allocation.
    pub fn record_register_allocated(&self) {
        self.stats.borrow_mut().registers_allocated += 1;
    }

    /// Record a callee-saved register the frame preserves.
    pub fn record_callee_saved(&self) {
        self.stats.borrow_mut().callee_saved += 1;
    }

    /// Record an instruction handed to the encoder.
    pub fn record_instruction_encoded(&self, mnemonic: &str) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions_encoded += 1;
        *stats
            .instruction_counts
            .entry(mnemonic.to_string())
            .or_insert(0) += 1;
    }

    /// Record the final machine code size.
    pub fn record_code_size(&self, bytes: usize) {
        self.stats.borrow_mut().code_size = bytes;
    }

    /// Get encode statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Encode session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Machine items after pseudo-op expansion.
    pub machine_items: usize,

    /// Virtual registers bound to physical registers.
    pub registers_allocated: usize,

    /// Callee-saved registers preserved by the frame.
    pub callee_saved: usize,

    /// Number of instructions encoded.
    pub instructions_encoded: usize,

    /// Count of each mnemonic encoded.
    pub instruction_counts: BTreeMap<String, usize>,

    /// Machine code size in bytes.
    pub code_size: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Encode Session Statistics:")?;
        writeln!(f, "  Machine items: {}", self.machine_items)?;
        writeln!(f, "  Registers allocated: {}", self.registers_allocated)?;
        writeln!(f, "  Callee-saved registers: {}", self.callee_saved)?;
        writeln!(f, "  Instructions encoded: {}", self.instructions_encoded)?;
        writeln!(f, "  Code size: {} bytes", self.code_size)?;

        if !self.instruction_counts.is_empty() {
            writeln!(f, "  Instruction breakdown:")?;
            let mut sorted: Vec<_> = self.instruction_counts.iter().collect();
            sorted.sort_by_key(|(_, count)| std::cmp::Reverse(**count));

            for (mnemonic, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {mnemonic}: {count}")?;
            }
        }

        Ok(())
    }
}
