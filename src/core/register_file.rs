//! Physical register bookkeeping.
//!
//! This module implements the RegisterFile used by linear-scan allocation. It
//! tracks which physical registers are allocatable under the active calling
//! convention, which are currently held by a live interval, and which
//! were ever handed out (so the frame knows which callee-saved registers to
//! preserve). There is no eviction: a request that finds every candidate busy
//! fails and the caller reports resource exhaustion.

use crate::core::types::RegBank;

/// Number of register banks (general purpose, vector).
pub const REGISTER_BANKS: usize = 2;

/// Maximum number of registers per bank.
pub const MAX_REGISTERS_PER_BANK: usize = 16;

/// Type for register IDs within a bank.
pub type RegId = u8;

/// Physical register: bank plus hardware encoding number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsmReg {
    pub bank: RegBank,
    pub id: RegId,
}

impl AsmReg {
    pub const RAX: AsmReg = AsmReg::gp(0);
    pub const RCX: AsmReg = AsmReg::gp(1);
    pub const RDX: AsmReg = AsmReg::gp(2);
    pub const RBX: AsmReg = AsmReg::gp(3);
    pub const RSP: AsmReg = AsmReg::gp(4);
    pub const RBP: AsmReg = AsmReg::gp(5);
    pub const RSI: AsmReg = AsmReg::gp(6);
    pub const RDI: AsmReg = AsmReg::gp(7);
    pub const R8: AsmReg = AsmReg::gp(8);
    pub const R9: AsmReg = AsmReg::gp(9);
    pub const XMM0: AsmReg = AsmReg::vec(0);

    pub const fn new(bank: RegBank, id: RegId) -> Self {
        Self { bank, id }
    }

    /// General-purpose register by encoding number.
    pub const fn gp(id: RegId) -> Self {
        Self::new(RegBank::GeneralPurpose, id)
    }

    /// Vector register by encoding number.
    pub const fn vec(id: RegId) -> Self {
        Self::new(RegBank::Vector, id)
    }
}

/// Bit set for efficiently tracking register sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegBitSet {
    banks: [u64; REGISTER_BANKS],
}

impl RegBitSet {
    /// Create empty register set.
    pub const fn new() -> Self {
        Self {
            banks: [0; REGISTER_BANKS],
        }
    }

    pub fn from_regs(regs: &[AsmReg]) -> Self {
        let mut set = Self::new();
        for &reg in regs {
            set.set(reg);
        }
        set
    }

    /// Check if register is set.
    pub fn contains(&self, reg: AsmReg) -> bool {
        (self.banks[reg.bank as usize] & (1u64 << reg.id)) != 0
    }

    /// Set a register.
    pub fn set(&mut self, reg: AsmReg) {
        self.banks[reg.bank as usize] |= 1u64 << reg.id;
    }

    /// Clear a register.
    pub fn clear(&mut self, reg: AsmReg) {
        self.banks[reg.bank as usize] &= !(1u64 << reg.id);
    }

    /// Set union with another set.
    pub fn union(&mut self, other: &RegBitSet) {
        for i in 0..REGISTER_BANKS {
            self.banks[i] |= other.banks[i];
        }
    }

    /// Set intersection with another set.
    pub fn intersect(&mut self, other: &RegBitSet) {
        for i in 0..REGISTER_BANKS {
            self.banks[i] &= other.banks[i];
        }
    }

    /// Count number of set registers in bank.
    pub fn count_in_bank(&self, bank: RegBank) -> u32 {
        self.banks[bank as usize].count_ones()
    }

    /// Registers of `bank` in ascending encoding order.
    pub fn iter_bank(&self, bank: RegBank) -> impl Iterator<Item = AsmReg> + '_ {
        let mask = self.banks[bank as usize];
        (0..MAX_REGISTERS_PER_BANK as RegId)
            .filter(move |id| mask & (1u64 << id) != 0)
            .map(move |id| AsmReg::new(bank, id))
    }
}

/// RegisterFile tracks physical register ownership for a single function.
#[derive(Debug)]
pub struct RegisterFile {
    /// Registers available for allocation (excludes RSP and anything the convention reserves).
    allocatable: RegBitSet,
    /// Currently allocated registers.
    used: RegBitSet,
    /// Registers that have been handed out at least once.
    clobbered: RegBitSet,
}

impl RegisterFile {
    pub fn new(allocatable: RegBitSet) -> Self {
        Self {
            allocatable,
            used: RegBitSet::new(),
            clobbered: RegBitSet::new(),
        }
    }

    /// Allocate the first free register in `preference` order, skipping `exclude`.
    pub fn allocate_reg(&mut self, preference: &[AsmReg], exclude: &RegBitSet) -> Option<AsmReg> {
        let reg = preference.iter().copied().find(|&reg| {
            self.allocatable.contains(reg) && !self.used.contains(reg) && !exclude.contains(reg)
        })?;
        self.used.set(reg);
        self.clobbered.set(reg);
        Some(reg)
    }

    /// Release a register whose owner is no longer live.
    pub fn free_register(&mut self, reg: AsmReg) {
        self.used.clear(reg);
    }

    /// Registers handed out at any point.
    pub fn clobbered(&self) -> RegBitSet {
        self.clobbered
    }
}
