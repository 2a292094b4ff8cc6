// This module defines the portable instruction model that function bodies are written in.
// Opcode is a mnemonic-level operation (add, move-zero-extend, compare, SIMD add, ...) that
// is independent of operand widths and of the final encoding; the encoder later picks one
// concrete x86-64 form per opcode/operand-kind combination. Operands are virtual registers,
// immediates or memory operands built from virtual registers. Body items are either plain
// instructions, the convention-aware pseudo-ops (argument load and return), or loops, which
// nest. Each item carries the index it was appended at so every later stage can point back
// at the exact instruction that failed.

//! Portable instructions, operands and control constructs.

use crate::core::types::{Argument, WidthClass};
use crate::core::vreg::VirtualRegister;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Mnemonic-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Mov,
    /// Move with zero extension.
    Movzx,
    /// Move with sign extension.
    Movsx,
    Lea,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Imul,
    Shl,
    Shr,
    Sar,
    Cmp,
    Test,
    Inc,
    Dec,
    Neg,
    Not,
    Movss,
    Movsd,
    Addss,
    Addsd,
    Subss,
    Subsd,
    Mulss,
    Mulsd,
    Movdqu,
    Paddd,
    Paddq,
    Pxor,
    Vmovdqu,
    Vpaddd,
    Vpaddq,
    Vpxor,
}

impl Opcode {
    pub const ALL: [Opcode; 35] = [
        Opcode::Mov,
        Opcode::Movzx,
        Opcode::Movsx,
        Opcode::Lea,
        Opcode::Add,
        Opcode::Sub,
        Opcode::And,
        Opcode::Or,
        Opcode::Xor,
        Opcode::Imul,
        Opcode::Shl,
        Opcode::Shr,
        Opcode::Sar,
        Opcode::Cmp,
        Opcode::Test,
        Opcode::Inc,
        Opcode::Dec,
        Opcode::Neg,
        Opcode::Not,
        Opcode::Movss,
        Opcode::Movsd,
        Opcode::Addss,
        Opcode::Addsd,
        Opcode::Subss,
        Opcode::Subsd,
        Opcode::Mulss,
        Opcode::Mulsd,
        Opcode::Movdqu,
        Opcode::Paddd,
        Opcode::Paddq,
        Opcode::Pxor,
        Opcode::Vmovdqu,
        Opcode::Vpaddd,
        Opcode::Vpaddq,
        Opcode::Vpxor,
    ];

    /// Number of operands the opcode takes.
    pub fn arity(self) -> usize {
        match self {
            Opcode::Inc | Opcode::Dec | Opcode::Neg | Opcode::Not => 1,
            Opcode::Vpaddd | Opcode::Vpaddq | Opcode::Vpxor => 3,
            _ => 2,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Mov => "mov",
            Opcode::Movzx => "movzx",
            Opcode::Movsx => "movsx",
            Opcode::Lea => "lea",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Imul => "imul",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
            Opcode::Sar => "sar",
            Opcode::Cmp => "cmp",
            Opcode::Test => "test",
            Opcode::Inc => "inc",
            Opcode::Dec => "dec",
            Opcode::Neg => "neg",
            Opcode::Not => "not",
            Opcode::Movss => "movss",
            Opcode::Movsd => "movsd",
            Opcode::Addss => "addss",
            Opcode::Addsd => "addsd",
            Opcode::Subss => "subss",
            Opcode::Subsd => "subsd",
            Opcode::Mulss => "mulss",
            Opcode::Mulsd => "mulsd",
            Opcode::Movdqu => "movdqu",
            Opcode::Paddd => "paddd",
            Opcode::Paddq => "paddq",
            Opcode::Pxor => "pxor",
            Opcode::Vmovdqu => "vmovdqu",
            Opcode::Vpaddd => "vpaddd",
            Opcode::Vpaddq => "vpaddq",
            Opcode::Vpxor => "vpxor",
        }
    }

    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        Opcode::ALL.into_iter().find(|op| op.mnemonic() == name)
    }

    /// Whether a memory operand at `position` needs an explicit width even
    /// when register operands are present.
    fn memory_width_always_required(self, position: usize) -> bool {
        matches!(self, Opcode::Movzx | Opcode::Movsx) && position == 1
    }

    /// Whether any memory operand of this opcode is an address only.
    pub fn memory_is_address(self) -> bool {
        self == Opcode::Lea
    }

    /// Operand position whose memory access width cannot be inferred, if any.
    pub fn memory_width_missing(self, operands: &[Operand]) -> Option<usize> {
        if self.memory_is_address() {
            return None;
        }
        let has_register = operands.iter().any(|op| matches!(op, Operand::Register(_)));
        operands.iter().enumerate().find_map(|(i, op)| match op {
            Operand::Memory(mem)
                if mem.size.is_none()
                    && (!has_register || self.memory_width_always_required(i)) =>
            {
                Some(i)
            }
            _ => None,
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Memory reference built from virtual registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryOperand {
    pub base: VirtualRegister,
    pub index: Option<VirtualRegister>,
    pub scale: u8,
    pub displacement: i64,
    /// Access width; required only when no register operand implies it.
    pub size: Option<WidthClass>,
}

impl MemoryOperand {
    /// `[base]`
    pub fn base(base: VirtualRegister) -> Self {
        Self {
            base,
            index: None,
            scale: 1,
            displacement: 0,
            size: None,
        }
    }

    /// `[base + displacement]`
    pub fn base_disp(base: VirtualRegister, displacement: i64) -> Self {
        Self {
            displacement,
            ..Self::base(base)
        }
    }

    /// `[base + index * scale + displacement]`
    pub fn indexed(
        base: VirtualRegister,
        index: VirtualRegister,
        scale: u8,
        displacement: i64,
    ) -> Self {
        Self {
            base,
            index: Some(index),
            scale,
            displacement,
            size: None,
        }
    }

    /// Attach an explicit access width.
    pub fn sized(mut self, size: WidthClass) -> Self {
        self.size = Some(size);
        self
    }

    pub fn registers(&self) -> impl Iterator<Item = VirtualRegister> + '_ {
        std::iter::once(self.base).chain(self.index)
    }
}

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Register(VirtualRegister),
    Immediate(i64),
    Memory(MemoryOperand),
}

impl Operand {
    /// Virtual registers mentioned by the operand.
    pub fn registers(&self) -> Vec<VirtualRegister> {
        match self {
            Operand::Register(reg) => vec![*reg],
            Operand::Immediate(_) => Vec::new(),
            Operand::Memory(mem) => mem.registers().collect(),
        }
    }
}

impl From<VirtualRegister> for Operand {
    fn from(reg: VirtualRegister) -> Self {
        Operand::Register(reg)
    }
}

impl From<MemoryOperand> for Operand {
    fn from(mem: MemoryOperand) -> Self {
        Operand::Memory(mem)
    }
}

impl From<i64> for Operand {
    fn from(imm: i64) -> Self {
        Operand::Immediate(imm)
    }
}

impl From<i32> for Operand {
    fn from(imm: i32) -> Self {
        Operand::Immediate(i64::from(imm))
    }
}

/// A concrete operation in a function body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
}

/// Branch conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpCondition {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Below,
    BelowEqual,
    Above,
    AboveEqual,
}

impl JumpCondition {
    pub fn keyword(self) -> &'static str {
        match self {
            JumpCondition::Equal => "eq",
            JumpCondition::NotEqual => "ne",
            JumpCondition::Less => "lt",
            JumpCondition::LessEqual => "le",
            JumpCondition::Greater => "gt",
            JumpCondition::GreaterEqual => "ge",
            JumpCondition::Below => "b",
            JumpCondition::BelowEqual => "be",
            JumpCondition::Above => "a",
            JumpCondition::AboveEqual => "ae",
        }
    }

    pub fn from_keyword(word: &str) -> Option<JumpCondition> {
        [
            JumpCondition::Equal,
            JumpCondition::NotEqual,
            JumpCondition::Less,
            JumpCondition::LessEqual,
            JumpCondition::Greater,
            JumpCondition::GreaterEqual,
            JumpCondition::Below,
            JumpCondition::BelowEqual,
            JumpCondition::Above,
            JumpCondition::AboveEqual,
        ]
        .into_iter()
        .find(|cond| cond.keyword() == word)
    }
}

/// Back-edge condition of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCondition {
    /// Skip the loop when the counter is zero, decrement it after each
    /// iteration and repeat while it is non-zero.
    CountDown(VirtualRegister),
    /// Repeat while `lhs <cond> rhs`.
    Compare {
        condition: JumpCondition,
        lhs: Operand,
        rhs: Operand,
    },
    /// Repeat while the flags left by the body satisfy the condition.
    Flags(JumpCondition),
}

static NEXT_LOOP_LABEL: AtomicU32 = AtomicU32::new(1);

/// Process-unique loop label id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopLabel(u32);

impl LoopLabel {
    pub(crate) fn fresh() -> Self {
        Self(NEXT_LOOP_LABEL.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(self) -> u32 {
        self.0
    }

    pub fn begin(self) -> LabelRef {
        LabelRef {
            label: self,
            edge: LabelEdge::Begin,
        }
    }

    pub fn end(self) -> LabelRef {
        LabelRef {
            label: self,
            edge: LabelEdge::End,
        }
    }
}

/// Which end of a loop a label marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LabelEdge {
    Begin,
    End,
}

/// A concrete label: one edge of one loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelRef {
    pub label: LoopLabel,
    pub edge: LabelEdge,
}

impl LabelRef {
    /// Dialect-neutral label name, e.g. `loop3_begin`.
    pub fn name(&self) -> String {
        match self.edge {
            LabelEdge::Begin => format!("loop{}_begin", self.label.0),
            LabelEdge::End => format!("loop{}_end", self.label.0),
        }
    }
}

/// Loop construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loop {
    pub label: LoopLabel,
    pub condition: LoopCondition,
    pub body: Vec<Item>,
    /// Index of the loop-closing item.
    pub end_index: usize,
}

/// Element of a function body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKind {
    Instruction(Instruction),
    LoadArgument {
        argument: Argument,
        destination: VirtualRegister,
    },
    Return(Option<Operand>),
    Loop(Loop),
}

/// Body element with its build-order index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub index: usize,
    pub kind: ItemKind,
}
