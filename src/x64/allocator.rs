// This module assigns physical registers to the virtual registers of an expanded function by
// linear scan over the machine item stream. Each virtual register gets one live interval from
// its first to its last occurrence. Loops stretch intervals: a register defined before a loop
// and still read inside it stays live up to the loop's back-edge branch, and a register whose
// first occurrence inside a loop is a read (so its value flows around the back-edge) is kept
// live for the whole loop. Both rules are applied until nothing changes, which covers nested
// loops. Incoming argument registers are fixed intervals from entry to the last load that
// reads them, stretched to the back-edge of every loop that contains that load; a virtual
// register whose interval overlaps one of them may not take that register. There is no spilling: when every allocatable register of the bank is busy the
// function fails with resource exhaustion naming the instruction that opened the interval.

//! Linear-scan register allocation.

use crate::core::error::{CompileError, CompileResult};
use crate::core::instruction::{LabelEdge, LabelRef, Opcode};
use crate::core::register_file::{AsmReg, RegBitSet, RegisterFile};
use crate::core::session::{AssignmentMap, EncodeSession};
use crate::core::types::{RegBank, WidthClass};
use crate::core::vreg::VirtualRegister;
use crate::x64::calling_convention::CCInfo;
use crate::x64::expander::{Expansion, MOperand, MachineItem, MachineOp};
use bumpalo::collections::Vec as BumpVec;
use hashbrown::HashMap;

/// Result of register allocation.
#[derive(Debug)]
pub struct Allocation<'a> {
    pub assignments: AssignmentMap<'a>,
    /// Every physical register handed out.
    pub clobbered: RegBitSet,
    /// Whether any 256-bit register is touched.
    pub uses_ymm: bool,
}

impl Allocation<'_> {
    pub fn get(&self, reg: VirtualRegister) -> Option<AsmReg> {
        self.assignments.get(&reg).copied()
    }
}

/// Live range of one virtual register, in stream positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LiveInterval {
    reg: VirtualRegister,
    start: usize,
    end: usize,
    /// First occurrence only writes the register.
    defined_first: bool,
    /// Body item that opened the interval.
    source: usize,
}

/// Allocate registers for `expansion` under the convention described by `info`.
pub fn allocate<'a>(
    session: &EncodeSession<'a>,
    expansion: &Expansion<'a>,
    info: &CCInfo,
) -> CompileResult<Allocation<'a>> {
    let loops = loop_ranges(expansion);
    let mut intervals = build_intervals(session, expansion);
    extend_over_loops(&mut intervals, &loops);
    let reserved = reserve_arguments(expansion, &loops);
    intervals.sort_by_key(|interval| (interval.start, interval.reg.index()));

    let uses_ymm = expansion.items.iter().any(|item| match item {
        MachineItem::Op { operands, .. } => operands.iter().any(|operand| {
            matches!(
                operand,
                MOperand::Virtual(_, WidthClass::Ymm) | MOperand::Physical(_, WidthClass::Ymm)
            )
        }),
        _ => false,
    });

    let mut file = RegisterFile::new(info.allocatable_regs);
    let mut assignments = session.assignment_map();
    let mut active: BumpVec<'a, (LiveInterval, AsmReg)> = BumpVec::new_in(session.arena());

    for interval in intervals.iter() {
        active.retain(|(live, reg)| {
            if live.end < interval.start {
                file.free_register(*reg);
                false
            } else {
                true
            }
        });

        let mut exclude = RegBitSet::new();
        for &(reg, last_use) in reserved.iter() {
            if last_use > interval.start {
                exclude.set(reg);
            }
        }

        let bank = interval.reg.bank();
        let reg = file
            .allocate_reg(info.order(bank), &exclude)
            .ok_or_else(|| CompileError::ResourceExhaustion {
                function: session.function().to_string(),
                instruction: interval.source,
                class: interval.reg.class(),
                available: info.capacity(bank),
            })?;
        log::trace!(
            "{}: {} [{}, {}] -> {}",
            session.function(),
            interval.reg,
            interval.start,
            interval.end,
            crate::x64::registers::register_name(reg, interval.reg.class())
        );
        session.record_register_allocated();
        assignments.insert(interval.reg, reg);
        active.push((*interval, reg));
    }

    let clobbered = file.clobbered();
    log::debug!(
        "{}: allocated {} registers ({} gp, {} vector)",
        session.function(),
        assignments.len(),
        clobbered.count_in_bank(RegBank::GeneralPurpose),
        clobbered.count_in_bank(RegBank::Vector)
    );
    Ok(Allocation {
        assignments,
        clobbered,
        uses_ymm,
    })
}

/// Whether operand 0 of `op` is written without being read.
fn writes_only_destination(op: MachineOp, operands: &[MOperand]) -> bool {
    match op {
        MachineOp::Movaps => true,
        MachineOp::Portable(opcode) => match opcode {
            Opcode::Mov
            | Opcode::Movzx
            | Opcode::Movsx
            | Opcode::Lea
            | Opcode::Movdqu
            | Opcode::Vmovdqu
            | Opcode::Vpaddd
            | Opcode::Vpaddq
            | Opcode::Vpxor => true,
            // Scalar loads from memory replace the whole register.
            Opcode::Movss | Opcode::Movsd => !matches!(operands.get(1), Some(MOperand::Virtual(..))),
            Opcode::Xor | Opcode::Sub | Opcode::Pxor => is_zeroing(op, operands),
            _ => false,
        },
        _ => false,
    }
}

/// `xor r, r` and friends, which ignore the old value of `r`.
fn is_zeroing(op: MachineOp, operands: &[MOperand]) -> bool {
    matches!(
        op,
        MachineOp::Portable(Opcode::Xor | Opcode::Sub | Opcode::Pxor)
    ) && matches!(
        (operands.first(), operands.get(1)),
        (Some(MOperand::Virtual(a, _)), Some(MOperand::Virtual(b, _))) if a == b
    )
}

fn build_intervals<'a>(
    session: &EncodeSession<'a>,
    expansion: &Expansion<'a>,
) -> BumpVec<'a, LiveInterval> {
    let mut slots: HashMap<VirtualRegister, usize> = HashMap::new();
    let mut intervals = BumpVec::new_in(session.arena());

    for (position, item) in expansion.items.iter().enumerate() {
        let MachineItem::Op {
            op,
            operands,
            source,
        } = item
        else {
            continue;
        };
        let defines = writes_only_destination(*op, operands);
        let zeroing = is_zeroing(*op, operands);
        for (i, operand) in operands.iter().enumerate() {
            // A register inside a memory operand is always read.
            let pure_write = defines && i == 0 && matches!(operand, MOperand::Virtual(..));
            for reg in operand.virtual_registers() {
                match slots.get(&reg) {
                    Some(&slot) => {
                        let interval: &mut LiveInterval = &mut intervals[slot];
                        interval.end = position;
                        if interval.start == position && !pure_write && !zeroing {
                            interval.defined_first = false;
                        }
                    }
                    None => {
                        slots.insert(reg, intervals.len());
                        intervals.push(LiveInterval {
                            reg,
                            start: position,
                            end: position,
                            defined_first: pure_write,
                            source: *source,
                        });
                    }
                }
            }
        }
    }
    intervals
}

/// Stream ranges `[begin label, back-edge branch]` of every loop.
fn loop_ranges(expansion: &Expansion<'_>) -> Vec<(usize, usize)> {
    let mut begins: HashMap<LabelRef, usize> = HashMap::new();
    let mut ranges = Vec::new();
    for (position, item) in expansion.items.iter().enumerate() {
        match item {
            MachineItem::Label(label) if label.edge == LabelEdge::Begin => {
                begins.insert(*label, position);
            }
            MachineItem::Branch { target, .. } => {
                if let Some(&begin) = begins.get(target) {
                    ranges.push((begin, position));
                }
            }
            _ => {}
        }
    }
    ranges
}

fn extend_over_loops(intervals: &mut [LiveInterval], loops: &[(usize, usize)]) {
    let mut changed = true;
    while changed {
        changed = false;
        for interval in intervals.iter_mut() {
            for &(begin, end) in loops {
                let enters = interval.start < begin && interval.end >= begin && interval.end < end;
                let carried =
                    interval.start > begin && interval.end <= end && !interval.defined_first;
                if enters {
                    interval.end = end;
                    changed = true;
                } else if carried {
                    interval.start = begin;
                    interval.end = end;
                    changed = true;
                }
            }
        }
    }
}

/// Argument registers with the position up to which they must keep the incoming value.
/// A load inside a loop runs again on every iteration.
fn reserve_arguments(expansion: &Expansion<'_>, loops: &[(usize, usize)]) -> Vec<(AsmReg, usize)> {
    expansion
        .argument_uses
        .iter()
        .map(|&(reg, last_use)| {
            let mut until = last_use;
            let mut changed = true;
            while changed {
                changed = false;
                for &(begin, end) in loops {
                    if until >= begin && until < end {
                        until = end;
                        changed = true;
                    }
                }
            }
            (reg, until)
        })
        .collect()
}
