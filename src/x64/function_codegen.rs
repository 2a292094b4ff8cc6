// This module drives the encoding of one Function for x86-64. encode() opens a bumpalo arena
// and an EncodeSession for the function, places its signature under the requested calling
// convention, expands the pseudo-instructions, allocates registers, builds the frame from the
// callee-saved registers the allocation touched, and then walks the machine item stream:
// virtual operands are replaced by their physical registers, caller stack slots become
// RSP-relative memory operands adjusted for the pushes and the vector save area, prologue and
// epilogue placeholders become push/pop sequences (plus vzeroupper when 256-bit registers were
// used under a C convention), and loop labels that fall on the same instruction are merged
// because the assembler binds one label per instruction. Everything allocated during the
// encode lives in the arena and is released when encode returns; the EncodedFunction copies
// out the machine code, label offsets, signature, placement and frame summary.

//! Function encoding for x86-64.

use crate::core::error::{CompileError, CompileResult};
use crate::core::function::Function;
use crate::core::instruction::{LabelRef, Opcode};
use crate::core::register_file::AsmReg;
use crate::core::session::{EncodeSession, SessionStats};
use crate::core::target::Architecture;
use crate::core::types::{ArgType, Argument, WidthClass};
use crate::x64::allocator::{allocate, Allocation};
use crate::x64::calling_convention::{
    place, CallingConvention, FrameSummary, FunctionFrame, Placement,
};
use crate::x64::encoder::{MemRef, PhysOperand, X64Encoder};
use crate::x64::expander::{expand, MOperand, MachineItem, MachineOp};
use bumpalo::Bump;
use hashbrown::HashMap;

/// Offset of a loop label within the function's code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelOffset {
    pub label: LabelRef,
    pub offset: u64,
}

/// Machine code and metadata for one encoded function.
#[derive(Debug, Clone)]
pub struct EncodedFunction {
    pub name: String,
    pub architecture: Architecture,
    pub convention: CallingConvention,
    pub code: Vec<u8>,
    /// Label offsets, ordered by offset.
    pub labels: Vec<LabelOffset>,
    pub arguments: Vec<Argument>,
    pub return_type: Option<ArgType>,
    pub placement: Placement,
    pub frame: FrameSummary,
    pub stats: SessionStats,
}

impl EncodedFunction {
    /// Code size in bytes.
    pub fn size(&self) -> usize {
        self.code.len()
    }

    /// Labels bound to `offset`.
    pub fn labels_at(&self, offset: u64) -> impl Iterator<Item = LabelRef> + '_ {
        self.labels
            .iter()
            .filter(move |label| label.offset == offset)
            .map(|label| label.label)
    }

    /// Offset of `label`, if the function defines it.
    pub fn label_offset(&self, label: LabelRef) -> Option<u64> {
        self.labels
            .iter()
            .find(|entry| entry.label == label)
            .map(|entry| entry.offset)
    }
}

/// Encode `function` for `architecture` under `convention`.
pub fn encode(
    function: &Function,
    architecture: Architecture,
    convention: CallingConvention,
) -> CompileResult<EncodedFunction> {
    match architecture {
        Architecture::X86_64 => {}
    }
    let arena = Bump::new();
    let session = EncodeSession::new(&arena, function.name());

    let placement = place(
        convention,
        function.name(),
        function.arguments(),
        function.return_type(),
    )?;
    let expansion = expand(&session, function, &placement)?;
    let info = convention.info();
    let allocation = allocate(&session, &expansion, &info)?;
    // vzeroupper would clobber a 256-bit result in ymm0.
    let returns_ymm = matches!(function.return_type(), Some(ArgType::Vector256));
    let frame = FunctionFrame::build(
        &arena,
        &info,
        &allocation.clobbered,
        convention,
        allocation.uses_ymm && !returns_ymm,
    );
    for _ in frame.saved_registers.iter().chain(frame.saved_vectors.iter()) {
        session.record_callee_saved();
    }

    let aliases = merge_coinciding_labels(&expansion.items);
    let canonical = |label: &LabelRef| aliases.get(label).copied().unwrap_or(*label);

    let mut lowering = Lowering {
        session: &session,
        allocation: &allocation,
        frame: &frame,
        encoder: X64Encoder::new(&session)?,
    };
    for item in expansion.items.iter() {
        match item {
            MachineItem::Op {
                op,
                operands,
                source,
            } => lowering.op(*op, operands, *source)?,
            MachineItem::Label(label) => {
                if canonical(label) == *label {
                    lowering.encoder.place_label(*label)?;
                }
            }
            MachineItem::Branch {
                condition, target, ..
            } => lowering.encoder.branch(*condition, canonical(target))?,
            MachineItem::Prologue => lowering.prologue()?,
            MachineItem::Epilogue { source } => lowering.epilogue(*source)?,
        }
    }
    let encoded = lowering.encoder.finish()?;

    let mut labels: Vec<LabelOffset> = expansion
        .items
        .iter()
        .filter_map(|item| match item {
            MachineItem::Label(label) => Some(*label),
            _ => None,
        })
        .filter_map(|label| {
            let target = canonical(&label);
            encoded
                .labels
                .iter()
                .find(|(placed, _)| *placed == target)
                .map(|(_, offset)| LabelOffset {
                    label,
                    offset: *offset,
                })
        })
        .collect();
    labels.sort_by_key(|entry| (entry.offset, entry.label));

    let stats = session.stats();
    log::debug!(
        "{}: encoded {} bytes under {convention} ({} instructions, {} callee-saved)",
        function.name(),
        encoded.code.len(),
        stats.instructions_encoded,
        stats.callee_saved
    );
    log::trace!("{stats}");

    Ok(EncodedFunction {
        name: function.name().to_string(),
        architecture,
        convention,
        code: encoded.code,
        labels,
        arguments: function.arguments().to_vec(),
        return_type: function.return_type().cloned(),
        frame: frame.summary(&info, placement.stack_size),
        placement,
        stats,
    })
}

/// Map every label that shares its instruction with an earlier label onto
/// that earlier label.
fn merge_coinciding_labels(items: &[MachineItem<'_>]) -> HashMap<LabelRef, LabelRef> {
    let mut aliases = HashMap::new();
    let mut leader: Option<LabelRef> = None;
    for item in items {
        match item {
            MachineItem::Label(label) => match leader {
                Some(first) => {
                    aliases.insert(*label, first);
                }
                None => leader = Some(*label),
            },
            // Any other item separates label runs; only the prologue may be empty and it comes first.
            _ => leader = None,
        }
    }
    aliases
}

struct Lowering<'s, 'a> {
    session: &'s EncodeSession<'a>,
    allocation: &'s Allocation<'a>,
    frame: &'s FunctionFrame<'a>,
    encoder: X64Encoder<'s, 'a>,
}

impl<'s, 'a> Lowering<'s, 'a> {
    fn physical(&self, reg: crate::core::vreg::VirtualRegister, source: usize) -> CompileResult<AsmReg> {
        self.allocation
            .get(reg)
            .ok_or_else(|| CompileError::Assembly {
                function: self.session.function().to_string(),
                reason: format!("{reg} at instruction {source} has no register"),
            })
    }

    fn resolve(&self, operand: &MOperand, source: usize) -> CompileResult<PhysOperand> {
        Ok(match operand {
            MOperand::Virtual(reg, view) => PhysOperand::Reg(self.physical(*reg, source)?, *view),
            MOperand::Physical(reg, class) => PhysOperand::Reg(*reg, *class),
            MOperand::Immediate(imm) => PhysOperand::Imm(*imm),
            MOperand::Memory(mem) => PhysOperand::Mem(MemRef {
                base: self.physical(mem.base, source)?,
                index: match mem.index {
                    Some(index) => Some(self.physical(index, source)?),
                    None => None,
                },
                scale: mem.scale,
                displacement: mem.displacement,
                size: mem.size,
            }),
            MOperand::Incoming { displacement, size } => PhysOperand::Mem(MemRef::base_disp(
                AsmReg::RSP,
                self.frame.body_offset(*displacement),
                Some(*size),
            )),
        })
    }

    fn op(&mut self, op: MachineOp, operands: &[MOperand], source: usize) -> CompileResult<()> {
        let resolved = operands
            .iter()
            .map(|operand| self.resolve(operand, source))
            .collect::<CompileResult<Vec<_>>>()?;
        self.encoder.emit(op, &resolved, source)
    }

    fn vector_slot(index: usize) -> PhysOperand {
        PhysOperand::Mem(MemRef::base_disp(
            AsmReg::RSP,
            16 * index as i64,
            Some(WidthClass::Xmm),
        ))
    }

    fn prologue(&mut self) -> CompileResult<()> {
        for reg in self.frame.saved_registers.iter() {
            self.encoder
                .emit(MachineOp::Push, &[PhysOperand::Reg(*reg, WidthClass::Gp64)], 0)?;
        }
        let area = i64::from(self.frame.vector_area());
        if area > 0 {
            self.encoder.emit(
                MachineOp::Portable(Opcode::Sub),
                &[
                    PhysOperand::Reg(AsmReg::RSP, WidthClass::Gp64),
                    PhysOperand::Imm(area),
                ],
                0,
            )?;
            for (i, reg) in self.frame.saved_vectors.iter().enumerate() {
                self.encoder.emit(
                    MachineOp::Portable(Opcode::Movdqu),
                    &[Self::vector_slot(i), PhysOperand::Reg(*reg, WidthClass::Xmm)],
                    0,
                )?;
            }
        }
        Ok(())
    }

    fn epilogue(&mut self, source: usize) -> CompileResult<()> {
        let area = i64::from(self.frame.vector_area());
        if area > 0 {
            for (i, reg) in self.frame.saved_vectors.iter().enumerate() {
                self.encoder.emit(
                    MachineOp::Portable(Opcode::Movdqu),
                    &[PhysOperand::Reg(*reg, WidthClass::Xmm), Self::vector_slot(i)],
                    source,
                )?;
            }
            self.encoder.emit(
                MachineOp::Portable(Opcode::Add),
                &[
                    PhysOperand::Reg(AsmReg::RSP, WidthClass::Gp64),
                    PhysOperand::Imm(area),
                ],
                source,
            )?;
        }
        for reg in self.frame.saved_registers.iter().rev() {
            self.encoder.emit(
                MachineOp::Pop,
                &[PhysOperand::Reg(*reg, WidthClass::Gp64)],
                source,
            )?;
        }
        if self.frame.vzeroupper {
            self.encoder.emit(MachineOp::Vzeroupper, &[], source)?;
        }
        self.encoder.emit(MachineOp::Ret, &[], source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::core::function::begin_function;
    use crate::core::instruction::{JumpCondition, LoopCondition, MemoryOperand};

    fn add_function() -> Function {
        let f1 = Argument::new("f1", ArgType::U64);
        let f2 = Argument::new("f2", ArgType::U16);
        let mut b = begin_function("add", vec![f1.clone(), f2.clone()], Some(ArgType::U64));
        let x = b.issue_register(WidthClass::Gp64);
        let y = b.issue_register(WidthClass::Gp64);
        b.load_argument(&f1, x).unwrap();
        b.load_argument(&f2, y).unwrap();
        b.emit(Opcode::Add, vec![x.into(), y.into()]).unwrap();
        b.ret(Some(x.into())).unwrap();
        b.end_function().unwrap()
    }

    #[test]
    fn test_go_add_bytes() {
        let encoded = encode(&add_function(), Architecture::X86_64, CallingConvention::GoAmd64)
            .unwrap();
        let expected = [
            0x48, 0x8B, 0x44, 0x24, 0x08, // mov rax, [rsp+8]
            0x48, 0x0F, 0xB7, 0x4C, 0x24, 0x10, // movzx rcx, word [rsp+16]
            0x48, 0x01, 0xC8, // add rax, rcx
            0x48, 0x89, 0x44, 0x24, 0x18, // mov [rsp+24], rax
            0xC3, // ret
        ];
        assert_eq!(encoded.code, expected);
        assert_eq!(encoded.size(), expected.len());
        assert!(encoded.labels.is_empty());
        assert_eq!(encoded.frame.argument_stack, 24);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let func = add_function();
        let a = encode(&func, Architecture::X86_64, CallingConvention::SystemV).unwrap();
        let b = encode(&func, Architecture::X86_64, CallingConvention::SystemV).unwrap();
        assert_eq!(a.code, b.code);
        assert_eq!(a.labels, b.labels);
    }

    #[test]
    fn test_callee_saved_registers_are_preserved() {
        let mut b = begin_function("pressure", vec![], Some(ArgType::U64));
        let regs: Vec<_> = (0..11).map(|_| b.issue_register(WidthClass::Gp64)).collect();
        for (i, r) in regs.iter().enumerate() {
            b.emit(Opcode::Mov, vec![(*r).into(), (i as i64).into()]).unwrap();
        }
        for r in &regs[1..] {
            b.emit(Opcode::Add, vec![regs[0].into(), (*r).into()]).unwrap();
        }
        b.ret(Some(regs[0].into())).unwrap();
        let func = b.end_function().unwrap();

        let encoded = encode(&func, Architecture::X86_64, CallingConvention::SystemV).unwrap();
        // rax..r11 cover nine registers; rbx and r12 are callee-saved.
        assert_eq!(encoded.frame.saved_registers, vec![AsmReg::RBX, AsmReg::gp(12)]);
        assert_eq!(&encoded.code[..3], &[0x53, 0x41, 0x54]);
        assert_eq!(&encoded.code[encoded.size() - 4..], &[0x41, 0x5C, 0x5B, 0xC3]);
    }

    #[test]
    fn test_ymm_use_emits_vzeroupper() {
        let v = Argument::new("v", ArgType::Vector256);
        let mut b = begin_function("touch", vec![v.clone()], None);
        let x = b.issue_register(WidthClass::Ymm);
        b.load_argument(&v, x).unwrap();
        b.emit(Opcode::Vpaddd, vec![x.into(), x.into(), x.into()]).unwrap();
        let func = b.end_function().unwrap();

        let encoded = encode(&func, Architecture::X86_64, CallingConvention::SystemV).unwrap();
        assert!(encoded.frame.vzeroupper);
        assert_eq!(&encoded.code[encoded.size() - 4..], &[0xC5, 0xF8, 0x77, 0xC3]);
    }

    #[test]
    fn test_ymm_result_keeps_upper_half() {
        let v = Argument::new("v", ArgType::Vector256);
        let mut b = begin_function("double", vec![v.clone()], Some(ArgType::Vector256));
        let x = b.issue_register(WidthClass::Ymm);
        b.load_argument(&v, x).unwrap();
        b.emit(Opcode::Vpaddd, vec![x.into(), x.into(), x.into()]).unwrap();
        b.ret(Some(x.into())).unwrap();
        let func = b.end_function().unwrap();

        let encoded = encode(&func, Architecture::X86_64, CallingConvention::SystemV).unwrap();
        assert!(!encoded.frame.vzeroupper);
        assert_eq!(encoded.code.last(), Some(&0xC3));
        assert!(!encoded.code.windows(3).any(|w| w == [0xC5, 0xF8, 0x77]));
    }

    #[test]
    fn test_nested_loops_share_offsets() {
        let mut b = begin_function("nest", vec![], None);
        let i = b.issue_register(WidthClass::Gp64);
        let j = b.issue_register(WidthClass::Gp64);
        b.emit(Opcode::Mov, vec![i.into(), 3i64.into()]).unwrap();
        b.emit(Opcode::Mov, vec![j.into(), 0i64.into()]).unwrap();
        let outer = b.begin_loop();
        let inner = b.begin_loop();
        b.emit(Opcode::Inc, vec![j.into()]).unwrap();
        b.end_loop(
            inner,
            LoopCondition::Compare {
                condition: JumpCondition::Below,
                lhs: j.into(),
                rhs: 10i64.into(),
            },
        )
        .unwrap();
        b.emit(Opcode::Dec, vec![i.into()]).unwrap();
        b.end_loop(outer, LoopCondition::Flags(JumpCondition::NotEqual))
            .unwrap();
        let func = b.end_function().unwrap();
        let outer_label = outer_label_of(&func);

        let encoded = encode(&func, Architecture::X86_64, CallingConvention::SystemV).unwrap();
        assert_eq!(encoded.labels.len(), 4);
        let begins: Vec<_> = encoded
            .labels
            .iter()
            .filter(|entry| entry.label.edge == crate::core::instruction::LabelEdge::Begin)
            .collect();
        assert_eq!(begins[0].offset, begins[1].offset);
        assert_eq!(
            encoded.label_offset(outer_label.begin()),
            Some(begins[0].offset)
        );
    }

    fn outer_label_of(func: &Function) -> crate::core::instruction::LoopLabel {
        func.body()
            .iter()
            .find_map(|item| match &item.kind {
                crate::core::instruction::ItemKind::Loop(lp) => Some(lp.label),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_addressing_range_reports_instruction() {
        let mut b = begin_function("far", vec![], None);
        let p = b.issue_register(WidthClass::Gp64);
        let x = b.issue_register(WidthClass::Gp64);
        b.emit(Opcode::Mov, vec![p.into(), 0i64.into()]).unwrap();
        b.emit(
            Opcode::Mov,
            vec![x.into(), MemoryOperand::base_disp(p, 1 << 40).into()],
        )
        .unwrap();
        let func = b.end_function().unwrap();
        let err = encode(&func, Architecture::X86_64, CallingConvention::SystemV).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressingRange);
        assert_eq!(err.instruction(), Some(1));
    }
}
