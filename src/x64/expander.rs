// This module lowers a finished Function into a flat stream of machine items for x86-64 under
// one resolved calling convention. Plain instructions pass through unchanged; the three
// pseudo-operations are expanded here. An argument load becomes a move from the argument's
// entry location (a physical argument register or a caller stack slot) into the destination,
// zero-extending unsigned and sign-extending signed narrower values, and relying on the
// implicit zero extension of 32-bit moves for u32 into 64-bit registers. A return moves the
// value into RAX/XMM0/YMM0 (widening 8 and 16-bit results to 32 bits) or stores it into the
// Go result slot, followed by an epilogue placeholder. Loops become begin/end labels around
// the body with the back-edge test and conditional branch. The stream still refers to
// virtual registers; prologue and epilogue are placeholders resolved once allocation has
// decided which callee-saved registers the frame must preserve. The item stream is allocated
// in the encode session arena.

//! Pseudo-instruction expansion.

use crate::core::error::{CompileError, CompileResult};
use crate::core::function::Function;
use crate::core::instruction::{
    Item, ItemKind, JumpCondition, LabelRef, Loop, LoopCondition, MemoryOperand, Opcode, Operand,
};
use crate::core::register_file::AsmReg;
use crate::core::session::EncodeSession;
use crate::core::types::{ArgType, Argument, RegBank, WidthClass};
use crate::core::vreg::VirtualRegister;
use crate::x64::calling_convention::{Location, Placement};
use bumpalo::collections::Vec as BumpVec;

/// Operation of a machine item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineOp {
    Portable(Opcode),
    /// Full-register vector move.
    Movaps,
    Push,
    Pop,
    Ret,
    Vzeroupper,
}

/// Operand of a machine item, before register allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MOperand {
    /// Virtual register viewed at a width class.
    Virtual(VirtualRegister, WidthClass),
    /// Fixed physical register.
    Physical(AsmReg, WidthClass),
    Immediate(i64),
    Memory(MemoryOperand),
    /// Caller stack slot, as a displacement from the entry stack pointer.
    Incoming { displacement: i64, size: WidthClass },
}

impl MOperand {
    fn from_operand(operand: &Operand) -> Self {
        match operand {
            Operand::Register(reg) => MOperand::Virtual(*reg, reg.class()),
            Operand::Immediate(imm) => MOperand::Immediate(*imm),
            Operand::Memory(mem) => MOperand::Memory(*mem),
        }
    }

    /// Virtual registers read or written through this operand.
    pub fn virtual_registers(&self) -> impl Iterator<Item = VirtualRegister> {
        let (a, b) = match self {
            MOperand::Virtual(reg, _) => (Some(*reg), None),
            MOperand::Memory(mem) => (Some(mem.base), mem.index),
            _ => (None, None),
        };
        a.into_iter().chain(b)
    }
}

/// One element of the expanded stream.
#[derive(Debug)]
pub enum MachineItem<'a> {
    Op {
        op: MachineOp,
        operands: BumpVec<'a, MOperand>,
        /// Index of the body item this came from.
        source: usize,
    },
    Label(LabelRef),
    Branch {
        condition: JumpCondition,
        target: LabelRef,
        source: usize,
    },
    Prologue,
    Epilogue {
        source: usize,
    },
}

/// Expanded function body.
#[derive(Debug)]
pub struct Expansion<'a> {
    pub items: BumpVec<'a, MachineItem<'a>>,
    /// Argument registers with the stream position of their last load.
    pub argument_uses: BumpVec<'a, (AsmReg, usize)>,
}

/// Expand `function` under a resolved placement.
pub fn expand<'a>(
    session: &EncodeSession<'a>,
    function: &Function,
    placement: &Placement,
) -> CompileResult<Expansion<'a>> {
    let mut expander = Expander {
        session,
        function,
        placement,
        items: BumpVec::new_in(session.arena()),
        argument_uses: BumpVec::new_in(session.arena()),
    };
    expander.items.push(MachineItem::Prologue);
    expander.expand_body(function.body())?;

    let returns_last = matches!(
        function.body().last(),
        Some(Item {
            kind: ItemKind::Return(_),
            ..
        })
    );
    if !returns_last {
        expander.items.push(MachineItem::Epilogue {
            source: function.item_count(),
        });
    }

    session.record_expanded(expander.items.len());
    log::trace!(
        "{}: expanded {} body items into {} machine items",
        function.name(),
        function.item_count(),
        expander.items.len()
    );
    Ok(Expansion {
        items: expander.items,
        argument_uses: expander.argument_uses,
    })
}

struct Expander<'s, 'a> {
    session: &'s EncodeSession<'a>,
    function: &'s Function,
    placement: &'s Placement,
    items: BumpVec<'a, MachineItem<'a>>,
    argument_uses: BumpVec<'a, (AsmReg, usize)>,
}

impl<'s, 'a> Expander<'s, 'a> {
    fn op(&mut self, op: MachineOp, operands: &[MOperand], source: usize) {
        let mut list = BumpVec::with_capacity_in(operands.len(), self.session.arena());
        list.extend_from_slice(operands);
        self.items.push(MachineItem::Op {
            op,
            operands: list,
            source,
        });
    }

    fn portable(&mut self, opcode: Opcode, operands: &[MOperand], source: usize) {
        self.op(MachineOp::Portable(opcode), operands, source);
    }

    fn expand_body(&mut self, body: &[Item]) -> CompileResult<()> {
        for item in body {
            match &item.kind {
                ItemKind::Instruction(inst) => {
                    let operands: Vec<MOperand> =
                        inst.operands.iter().map(MOperand::from_operand).collect();
                    self.portable(inst.opcode, &operands, item.index);
                }
                ItemKind::LoadArgument {
                    argument,
                    destination,
                } => self.load_argument(argument, *destination, item.index)?,
                ItemKind::Return(value) => self.ret(value.as_ref(), item.index)?,
                ItemKind::Loop(lp) => self.expand_loop(lp, item.index)?,
            }
        }
        Ok(())
    }

    fn expand_loop(&mut self, lp: &Loop, index: usize) -> CompileResult<()> {
        let begin = lp.label.begin();
        let end = lp.label.end();
        match lp.condition {
            LoopCondition::CountDown(counter) => {
                let n = MOperand::Virtual(counter, counter.class());
                self.portable(Opcode::Test, &[n, n], index);
                self.items.push(MachineItem::Branch {
                    condition: JumpCondition::Equal,
                    target: end,
                    source: index,
                });
                self.items.push(MachineItem::Label(begin));
                self.expand_body(&lp.body)?;
                self.portable(Opcode::Dec, &[n], lp.end_index);
                self.items.push(MachineItem::Branch {
                    condition: JumpCondition::NotEqual,
                    target: begin,
                    source: lp.end_index,
                });
            }
            LoopCondition::Compare {
                condition,
                lhs,
                rhs,
            } => {
                self.items.push(MachineItem::Label(begin));
                self.expand_body(&lp.body)?;
                self.portable(
                    Opcode::Cmp,
                    &[MOperand::from_operand(&lhs), MOperand::from_operand(&rhs)],
                    lp.end_index,
                );
                self.items.push(MachineItem::Branch {
                    condition,
                    target: begin,
                    source: lp.end_index,
                });
            }
            LoopCondition::Flags(condition) => {
                self.items.push(MachineItem::Label(begin));
                self.expand_body(&lp.body)?;
                self.items.push(MachineItem::Branch {
                    condition,
                    target: begin,
                    source: lp.end_index,
                });
            }
        }
        self.items.push(MachineItem::Label(end));
        Ok(())
    }

    fn load_argument(
        &mut self,
        argument: &Argument,
        destination: VirtualRegister,
        index: usize,
    ) -> CompileResult<()> {
        let location = self
            .function
            .argument_position(argument)
            .and_then(|position| self.placement.arguments.get(position))
            .copied()
            .ok_or_else(|| CompileError::UnknownArgument {
                function: self.function.name().to_string(),
                argument: argument.name().to_string(),
                instruction: index,
            })?;

        let ty = argument.ty();
        let source = match location {
            Location::Register { reg, class } => {
                self.argument_uses.push((reg, self.items.len()));
                MOperand::Physical(reg, class)
            }
            Location::Stack { .. } => MOperand::Incoming {
                displacement: location.entry_offset().unwrap_or_default(),
                size: ty.natural_class(),
            },
        };
        let from_stack = matches!(location, Location::Stack { .. });
        let dst_class = destination.class();

        match ty.bank() {
            RegBank::GeneralPurpose => {
                let size = ty.size();
                if dst_class.bytes() == size {
                    self.portable(
                        Opcode::Mov,
                        &[MOperand::Virtual(destination, dst_class), source],
                        index,
                    );
                } else if ty.is_signed() {
                    self.portable(
                        Opcode::Movsx,
                        &[MOperand::Virtual(destination, dst_class), source],
                        index,
                    );
                } else if size == 4 {
                    // 32-bit moves clear the upper half.
                    self.portable(
                        Opcode::Mov,
                        &[MOperand::Virtual(destination, WidthClass::Gp32), source],
                        index,
                    );
                } else {
                    self.portable(
                        Opcode::Movzx,
                        &[MOperand::Virtual(destination, dst_class), source],
                        index,
                    );
                }
            }
            RegBank::Vector => {
                let (op, view) = match (ty, from_stack) {
                    (ArgType::Vector256, _) => {
                        (MachineOp::Portable(Opcode::Vmovdqu), WidthClass::Ymm)
                    }
                    (_, false) => (MachineOp::Movaps, WidthClass::Xmm),
                    (ArgType::Float32, true) => {
                        (MachineOp::Portable(Opcode::Movss), WidthClass::Xmm)
                    }
                    (ArgType::Float64, true) => {
                        (MachineOp::Portable(Opcode::Movsd), WidthClass::Xmm)
                    }
                    (_, true) => (MachineOp::Portable(Opcode::Movdqu), WidthClass::Xmm),
                };
                self.op(op, &[MOperand::Virtual(destination, view), source], index);
            }
        }
        Ok(())
    }

    fn ret(&mut self, value: Option<&Operand>, index: usize) -> CompileResult<()> {
        let (Some(ty), Some(value)) = (self.function.return_type(), value) else {
            self.items.push(MachineItem::Epilogue { source: index });
            return Ok(());
        };
        let location = self.placement.ret.ok_or_else(|| CompileError::Placement {
            function: self.function.name().to_string(),
            subject: "return value".to_string(),
            ty: ty.to_string(),
            convention: "target",
        })?;

        match (location, value) {
            (Location::Register { reg, class }, Operand::Register(src)) => match ty.bank() {
                RegBank::GeneralPurpose => self.return_gp_register(ty, reg, *src, index),
                RegBank::Vector if class == WidthClass::Ymm => self.portable(
                    Opcode::Vmovdqu,
                    &[
                        MOperand::Physical(reg, WidthClass::Ymm),
                        MOperand::Virtual(*src, WidthClass::Ymm),
                    ],
                    index,
                ),
                RegBank::Vector => self.op(
                    MachineOp::Movaps,
                    &[
                        MOperand::Physical(reg, WidthClass::Xmm),
                        MOperand::Virtual(*src, WidthClass::Xmm),
                    ],
                    index,
                ),
            },
            (Location::Register { reg, .. }, Operand::Immediate(imm)) => {
                let (class, imm) = widen_immediate(ty, *imm);
                self.portable(
                    Opcode::Mov,
                    &[MOperand::Physical(reg, class), MOperand::Immediate(imm)],
                    index,
                );
            }
            (Location::Stack { .. }, Operand::Register(src)) => {
                let slot = MOperand::Incoming {
                    displacement: location.entry_offset().unwrap_or_default(),
                    size: ty.natural_class(),
                };
                let opcode = match ty {
                    ArgType::Float32 => Opcode::Movss,
                    ArgType::Float64 => Opcode::Movsd,
                    _ => Opcode::Mov,
                };
                let view = match ty.bank() {
                    RegBank::GeneralPurpose => ty.natural_class(),
                    RegBank::Vector => WidthClass::Xmm,
                };
                self.portable(opcode, &[slot, MOperand::Virtual(*src, view)], index);
            }
            (Location::Stack { .. }, Operand::Immediate(imm)) => {
                let class = ty.natural_class();
                let slot = MOperand::Incoming {
                    displacement: location.entry_offset().unwrap_or_default(),
                    size: class,
                };
                let imm = truncate_immediate(*imm, ty.size(), ty.is_signed());
                if i32::try_from(imm).is_ok() {
                    self.portable(Opcode::Mov, &[slot, MOperand::Immediate(imm)], index);
                } else {
                    // No 64-bit immediate store; go through RAX, which is dead on exit.
                    let rax = MOperand::Physical(AsmReg::RAX, WidthClass::Gp64);
                    self.portable(Opcode::Mov, &[rax, MOperand::Immediate(imm)], index);
                    self.portable(Opcode::Mov, &[slot, rax], index);
                }
            }
            (_, Operand::Memory(_)) => {
                return Err(CompileError::UnsupportedOperands {
                    function: self.function.name().to_string(),
                    instruction: index,
                    operand: Some(0),
                    reason: "memory operands cannot be returned directly".to_string(),
                })
            }
        }
        self.items.push(MachineItem::Epilogue { source: index });
        Ok(())
    }

    fn return_gp_register(
        &mut self,
        ty: &ArgType,
        reg: AsmReg,
        src: VirtualRegister,
        index: usize,
    ) {
        let size = ty.size();
        let natural = ty.natural_class();
        let (opcode, dst_class, src_class) = match size {
            8 => (Opcode::Mov, WidthClass::Gp64, WidthClass::Gp64),
            4 => (Opcode::Mov, WidthClass::Gp32, WidthClass::Gp32),
            _ if ty.is_signed() => (Opcode::Movsx, WidthClass::Gp32, natural),
            _ => (Opcode::Movzx, WidthClass::Gp32, natural),
        };
        self.portable(
            opcode,
            &[
                MOperand::Physical(reg, dst_class),
                MOperand::Virtual(src, src_class),
            ],
            index,
        );
    }
}

/// Truncate `imm` to `size` bytes and re-extend it according to `signed`.
fn truncate_immediate(imm: i64, size: u32, signed: bool) -> i64 {
    match (size, signed) {
        (1, true) => i64::from(imm as i8),
        (1, false) => i64::from(imm as u8),
        (2, true) => i64::from(imm as i16),
        (2, false) => i64::from(imm as u16),
        (4, true) => i64::from(imm as i32),
        (4, false) => i64::from(imm as u32),
        _ => imm,
    }
}

/// Register view and value for returning an immediate in RAX.
fn widen_immediate(ty: &ArgType, imm: i64) -> (WidthClass, i64) {
    let size = ty.size();
    if size == 8 {
        return (WidthClass::Gp64, imm);
    }
    let value = truncate_immediate(imm, size, ty.is_signed());
    // 8 and 16-bit results are widened to the 32-bit view.
    (WidthClass::Gp32, i64::from(value as u32 as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::core::function::begin_function;
    use crate::core::instruction::LabelEdge;
    use crate::x64::calling_convention::{place, CallingConvention};
    use bumpalo::Bump;

    fn ops(expansion: &Expansion<'_>) -> Vec<(MachineOp, Vec<MOperand>)> {
        expansion
            .items
            .iter()
            .filter_map(|item| match item {
                MachineItem::Op { op, operands, .. } => Some((*op, operands.to_vec())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_go_argument_loads_extend() {
        let f1 = Argument::new("f1", ArgType::U64);
        let f2 = Argument::new("f2", ArgType::U16);
        let mut b = begin_function("add", vec![f1.clone(), f2.clone()], Some(ArgType::U64));
        let x = b.issue_register(WidthClass::Gp64);
        let y = b.issue_register(WidthClass::Gp64);
        b.load_argument(&f1, x).unwrap();
        b.load_argument(&f2, y).unwrap();
        b.emit(Opcode::Add, vec![x.into(), y.into()]).unwrap();
        b.ret(Some(x.into())).unwrap();
        let func = b.end_function().unwrap();

        let arena = Bump::new();
        let session = EncodeSession::new(&arena, func.name());
        let placement = place(
            CallingConvention::GoAmd64,
            func.name(),
            func.arguments(),
            func.return_type(),
        )
        .unwrap();
        let expansion = expand(&session, &func, &placement).unwrap();
        let ops = ops(&expansion);

        assert_eq!(
            ops[0],
            (
                MachineOp::Portable(Opcode::Mov),
                vec![
                    MOperand::Virtual(x, WidthClass::Gp64),
                    MOperand::Incoming {
                        displacement: 8,
                        size: WidthClass::Gp64
                    }
                ]
            )
        );
        assert_eq!(
            ops[1],
            (
                MachineOp::Portable(Opcode::Movzx),
                vec![
                    MOperand::Virtual(y, WidthClass::Gp64),
                    MOperand::Incoming {
                        displacement: 16,
                        size: WidthClass::Gp16
                    }
                ]
            )
        );
        // Result slot follows the arguments.
        assert_eq!(
            ops[3].1[0],
            MOperand::Incoming {
                displacement: 24,
                size: WidthClass::Gp64
            }
        );
        assert!(expansion.argument_uses.is_empty());
        assert!(matches!(
            expansion.items.last(),
            Some(MachineItem::Epilogue { source: 3 })
        ));
    }

    #[test]
    fn test_sysv_u32_load_uses_32bit_move() {
        let a = Argument::new("a", ArgType::U32);
        let s = Argument::new("s", ArgType::I8);
        let mut b = begin_function("f", vec![a.clone(), s.clone()], None);
        let x = b.issue_register(WidthClass::Gp64);
        let y = b.issue_register(WidthClass::Gp64);
        b.load_argument(&a, x).unwrap();
        b.load_argument(&s, y).unwrap();
        let func = b.end_function().unwrap();

        let arena = Bump::new();
        let session = EncodeSession::new(&arena, "f");
        let placement = place(CallingConvention::SystemV, "f", func.arguments(), None).unwrap();
        let expansion = expand(&session, &func, &placement).unwrap();
        let ops = ops(&expansion);

        assert_eq!(
            ops[0].1,
            vec![
                MOperand::Virtual(x, WidthClass::Gp32),
                MOperand::Physical(AsmReg::RDI, WidthClass::Gp32)
            ]
        );
        assert_eq!(ops[1].0, MachineOp::Portable(Opcode::Movsx));
        assert_eq!(
            ops[1].1[1],
            MOperand::Physical(AsmReg::RSI, WidthClass::Gp8)
        );
        assert_eq!(expansion.argument_uses.len(), 2);
    }

    #[test]
    fn test_countdown_loop_shape() {
        let mut b = begin_function("f", vec![], None);
        let n = b.issue_register(WidthClass::Gp64);
        let handle = b.begin_loop();
        let label = handle.label();
        b.emit(Opcode::Inc, vec![n.into()]).unwrap();
        b.end_loop(handle, LoopCondition::CountDown(n)).unwrap();
        let func = b.end_function().unwrap();

        let arena = Bump::new();
        let session = EncodeSession::new(&arena, "f");
        let placement = place(CallingConvention::SystemV, "f", &[], None).unwrap();
        let expansion = expand(&session, &func, &placement).unwrap();

        let shape: Vec<String> = expansion
            .items
            .iter()
            .map(|item| match item {
                MachineItem::Op { op, .. } => format!("{op:?}"),
                MachineItem::Label(l) => format!("label {:?}", l.edge),
                MachineItem::Branch {
                    condition, target, ..
                } => format!("j{} {:?}", condition.keyword(), target.edge),
                MachineItem::Prologue => "prologue".to_string(),
                MachineItem::Epilogue { .. } => "epilogue".to_string(),
            })
            .collect();
        assert_eq!(
            shape,
            vec![
                "prologue",
                "Portable(Test)",
                "jeq End",
                "label Begin",
                "Portable(Inc)",
                "Portable(Dec)",
                "jne Begin",
                "label End",
                "epilogue",
            ]
        );
        assert!(expansion.items.iter().any(|item| matches!(
            item,
            MachineItem::Label(LabelRef { label: l, edge: LabelEdge::End }) if *l == label
        )));
    }

    #[test]
    fn test_unknown_argument() {
        let a = Argument::new("a", ArgType::U64);
        let stranger = Argument::new("b", ArgType::U64);
        let mut b = begin_function("f", vec![a], None);
        let x = b.issue_register(WidthClass::Gp64);
        b.load_argument(&stranger, x).unwrap();
        let func = b.end_function().unwrap();

        let arena = Bump::new();
        let session = EncodeSession::new(&arena, "f");
        let placement = place(CallingConvention::SystemV, "f", func.arguments(), None).unwrap();
        let err = expand(&session, &func, &placement).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownArgument);
        assert_eq!(err.instruction(), Some(0));
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn test_immediate_returns_widen() {
        assert_eq!(widen_immediate(&ArgType::I8, -1), (WidthClass::Gp32, -1));
        assert_eq!(widen_immediate(&ArgType::U16, -1), (WidthClass::Gp32, 0xFFFF));
        assert_eq!(
            widen_immediate(&ArgType::U64, i64::MAX),
            (WidthClass::Gp64, i64::MAX)
        );
        assert_eq!(truncate_immediate(0x1_0000_0001, 4, false), 1);
    }
}
