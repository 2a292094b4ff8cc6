// This module turns resolved machine items into x86-64 machine code with iced-x86. Instruction
// selection maps each portable opcode and its physical operand combination (register,
// immediate, memory) to one concrete iced `Code`: the ALU group picks between the
// register/memory forms and the sign-extended imm8 or full-width immediate forms by operand
// width, MOV falls back to the 64-bit immediate form only when the value does not fit a
// sign-extended 32-bit immediate, MOVZX/MOVSX pick the source width form (and MOVSXD or a
// 32-bit MOV for 32-bit sources), and the SSE/AVX group checks that every vector operand has
// the width class the instruction requires. Combinations x86-64 cannot encode (two memory
// operands, 64-bit immediates outside MOV, register shift counts, mismatched widths) are
// reported as unsupported operands; memory operands whose scale or displacement cannot be
// encoded are reported as addressing range errors. Selected instructions are fed to a
// CodeAssembler together with the loop labels; the block encoder resolves every branch to
// its shortest form and reports the final offset of every label.

//! x86-64 instruction selection and encoding using iced-x86.

use crate::core::error::{CompileError, CompileResult};
use crate::core::instruction::{JumpCondition, LabelRef, Opcode};
use crate::core::register_file::AsmReg;
use crate::core::session::EncodeSession;
use crate::core::types::WidthClass;
use crate::x64::expander::MachineOp;
use crate::x64::registers::to_register;
use hashbrown::HashMap;
use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, Code, IcedError, Instruction, MemoryOperand, Register};

/// Operand after register allocation and frame resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysOperand {
    Reg(AsmReg, WidthClass),
    Imm(i64),
    Mem(MemRef),
}

/// Physical memory reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    pub base: AsmReg,
    pub index: Option<AsmReg>,
    pub scale: u8,
    pub displacement: i64,
    /// Access width, when the operand carries one.
    pub size: Option<WidthClass>,
}

impl MemRef {
    /// `[base + displacement]`.
    pub fn base_disp(base: AsmReg, displacement: i64, size: Option<WidthClass>) -> Self {
        Self {
            base,
            index: None,
            scale: 1,
            displacement,
            size,
        }
    }
}

/// Why an operand combination was refused.
#[derive(Debug)]
enum Rejection {
    Operands {
        operand: Option<usize>,
        reason: String,
    },
    Range(String),
    Iced(IcedError),
}

impl From<IcedError> for Rejection {
    fn from(e: IcedError) -> Self {
        Rejection::Iced(e)
    }
}

fn reject(operand: Option<usize>, reason: impl Into<String>) -> Rejection {
    Rejection::Operands {
        operand,
        reason: reason.into(),
    }
}

type Selected = Result<Instruction, Rejection>;

/// x86-64 instruction encoder for one function.
pub struct X64Encoder<'s, 'a> {
    session: &'s EncodeSession<'a>,
    /// Code assembler collecting the selected instructions.
    assembler: CodeAssembler,
    /// Assembler labels for the loop labels seen so far.
    labels: HashMap<LabelRef, CodeLabel>,
}

/// Final machine code and label offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCode {
    pub code: Vec<u8>,
    pub labels: Vec<(LabelRef, u64)>,
}

impl<'s, 'a> X64Encoder<'s, 'a> {
    /// Create a new x86-64 encoder.
    pub fn new(session: &'s EncodeSession<'a>) -> CompileResult<Self> {
        let assembler = CodeAssembler::new(64).map_err(|e| assembly_error(session, e))?;
        Ok(Self {
            session,
            assembler,
            labels: HashMap::new(),
        })
    }

    fn label(&mut self, label: LabelRef) -> CodeLabel {
        match self.labels.get(&label) {
            Some(code_label) => *code_label,
            None => {
                let code_label = self.assembler.create_label();
                self.labels.insert(label, code_label);
                code_label
            }
        }
    }

    /// Bind `label` to the next emitted instruction. At most one label may be
    /// placed per instruction; callers merge coinciding labels first.
    pub fn place_label(&mut self, label: LabelRef) -> CompileResult<()> {
        let mut code_label = self.label(label);
        self.assembler
            .set_label(&mut code_label)
            .map_err(|e| assembly_error(self.session, e))?;
        self.labels.insert(label, code_label);
        Ok(())
    }

    /// Select and append one instruction.
    pub fn emit(&mut self, op: MachineOp, operands: &[PhysOperand], source: usize) -> CompileResult<()> {
        let instruction = select(op, operands).map_err(|rejection| {
            let function = self.session.function().to_string();
            match rejection {
                Rejection::Operands { operand, reason } => CompileError::UnsupportedOperands {
                    function,
                    instruction: source,
                    operand,
                    reason,
                },
                Rejection::Range(reason) => CompileError::AddressingRange {
                    function,
                    instruction: source,
                    reason,
                },
                Rejection::Iced(e) => CompileError::UnsupportedOperands {
                    function,
                    instruction: source,
                    operand: None,
                    reason: e.to_string(),
                },
            }
        })?;
        self.session.record_instruction_encoded(&format!("{:?}", instruction.mnemonic()).to_lowercase());
        self.assembler
            .add_instruction(instruction)
            .map_err(|e| assembly_error(self.session, e))
    }

    /// Append a conditional branch to `target`.
    pub fn branch(&mut self, condition: JumpCondition, target: LabelRef) -> CompileResult<()> {
        let label = self.label(target);
        let (result, mnemonic) = match condition {
            JumpCondition::Equal => (self.assembler.je(label), "je"),
            JumpCondition::NotEqual => (self.assembler.jne(label), "jne"),
            JumpCondition::Less => (self.assembler.jl(label), "jl"),
            JumpCondition::LessEqual => (self.assembler.jle(label), "jle"),
            JumpCondition::Greater => (self.assembler.jg(label), "jg"),
            JumpCondition::GreaterEqual => (self.assembler.jge(label), "jge"),
            JumpCondition::Below => (self.assembler.jb(label), "jb"),
            JumpCondition::BelowEqual => (self.assembler.jbe(label), "jbe"),
            JumpCondition::Above => (self.assembler.ja(label), "ja"),
            JumpCondition::AboveEqual => (self.assembler.jae(label), "jae"),
        };
        self.session.record_instruction_encoded(mnemonic);
        result.map_err(|e| assembly_error(self.session, e))
    }

    /// Assemble at offset 0 and resolve the offsets of the placed labels.
    pub fn finish(mut self) -> CompileResult<EncodedCode> {
        let result = self
            .assembler
            .assemble_options(0, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)
            .map_err(|e| assembly_error(self.session, e))?;
        let mut labels = Vec::with_capacity(self.labels.len());
        for (label, code_label) in self.labels.iter() {
            let offset = result
                .label_ip(code_label)
                .map_err(|e| assembly_error(self.session, e))?;
            labels.push((*label, offset));
        }
        labels.sort_by_key(|(label, offset)| (*offset, *label));
        let code = result.inner.code_buffer;
        self.session.record_code_size(code.len());
        Ok(EncodedCode { code, labels })
    }
}

fn assembly_error(session: &EncodeSession<'_>, e: IcedError) -> CompileError {
    CompileError::Assembly {
        function: session.function().to_string(),
        reason: e.to_string(),
    }
}

/// Register, ALU and immediate forms of a two-operand integer instruction,
/// indexed by operand width (8, 16, 32, 64 bits).
struct AluForms {
    rm_r: [Code; 4],
    r_rm: [Code; 4],
    rm_imm: [Code; 4],
    /// Sign-extended imm8 forms for 16, 32 and 64 bits.
    rm_imm8: [Code; 3],
}

const ADD: AluForms = AluForms {
    rm_r: [Code::Add_rm8_r8, Code::Add_rm16_r16, Code::Add_rm32_r32, Code::Add_rm64_r64],
    r_rm: [Code::Add_r8_rm8, Code::Add_r16_rm16, Code::Add_r32_rm32, Code::Add_r64_rm64],
    rm_imm: [Code::Add_rm8_imm8, Code::Add_rm16_imm16, Code::Add_rm32_imm32, Code::Add_rm64_imm32],
    rm_imm8: [Code::Add_rm16_imm8, Code::Add_rm32_imm8, Code::Add_rm64_imm8],
};

const SUB: AluForms = AluForms {
    rm_r: [Code::Sub_rm8_r8, Code::Sub_rm16_r16, Code::Sub_rm32_r32, Code::Sub_rm64_r64],
    r_rm: [Code::Sub_r8_rm8, Code::Sub_r16_rm16, Code::Sub_r32_rm32, Code::Sub_r64_rm64],
    rm_imm: [Code::Sub_rm8_imm8, Code::Sub_rm16_imm16, Code::Sub_rm32_imm32, Code::Sub_rm64_imm32],
    rm_imm8: [Code::Sub_rm16_imm8, Code::Sub_rm32_imm8, Code::Sub_rm64_imm8],
};

const AND: AluForms = AluForms {
    rm_r: [Code::And_rm8_r8, Code::And_rm16_r16, Code::And_rm32_r32, Code::And_rm64_r64],
    r_rm: [Code::And_r8_rm8, Code::And_r16_rm16, Code::And_r32_rm32, Code::And_r64_rm64],
    rm_imm: [Code::And_rm8_imm8, Code::And_rm16_imm16, Code::And_rm32_imm32, Code::And_rm64_imm32],
    rm_imm8: [Code::And_rm16_imm8, Code::And_rm32_imm8, Code::And_rm64_imm8],
};

const OR: AluForms = AluForms {
    rm_r: [Code::Or_rm8_r8, Code::Or_rm16_r16, Code::Or_rm32_r32, Code::Or_rm64_r64],
    r_rm: [Code::Or_r8_rm8, Code::Or_r16_rm16, Code::Or_r32_rm32, Code::Or_r64_rm64],
    rm_imm: [Code::Or_rm8_imm8, Code::Or_rm16_imm16, Code::Or_rm32_imm32, Code::Or_rm64_imm32],
    rm_imm8: [Code::Or_rm16_imm8, Code::Or_rm32_imm8, Code::Or_rm64_imm8],
};

const XOR: AluForms = AluForms {
    rm_r: [Code::Xor_rm8_r8, Code::Xor_rm16_r16, Code::Xor_rm32_r32, Code::Xor_rm64_r64],
    r_rm: [Code::Xor_r8_rm8, Code::Xor_r16_rm16, Code::Xor_r32_rm32, Code::Xor_r64_rm64],
    rm_imm: [Code::Xor_rm8_imm8, Code::Xor_rm16_imm16, Code::Xor_rm32_imm32, Code::Xor_rm64_imm32],
    rm_imm8: [Code::Xor_rm16_imm8, Code::Xor_rm32_imm8, Code::Xor_rm64_imm8],
};

const CMP: AluForms = AluForms {
    rm_r: [Code::Cmp_rm8_r8, Code::Cmp_rm16_r16, Code::Cmp_rm32_r32, Code::Cmp_rm64_r64],
    r_rm: [Code::Cmp_r8_rm8, Code::Cmp_r16_rm16, Code::Cmp_r32_rm32, Code::Cmp_r64_rm64],
    rm_imm: [Code::Cmp_rm8_imm8, Code::Cmp_rm16_imm16, Code::Cmp_rm32_imm32, Code::Cmp_rm64_imm32],
    rm_imm8: [Code::Cmp_rm16_imm8, Code::Cmp_rm32_imm8, Code::Cmp_rm64_imm8],
};

const MOV_RM_R: [Code; 4] = [Code::Mov_rm8_r8, Code::Mov_rm16_r16, Code::Mov_rm32_r32, Code::Mov_rm64_r64];
const MOV_R_RM: [Code; 4] = [Code::Mov_r8_rm8, Code::Mov_r16_rm16, Code::Mov_r32_rm32, Code::Mov_r64_rm64];
const MOV_R_IMM: [Code; 3] = [Code::Mov_r8_imm8, Code::Mov_r16_imm16, Code::Mov_r32_imm32];
const MOV_RM_IMM: [Code; 4] = [Code::Mov_rm8_imm8, Code::Mov_rm16_imm16, Code::Mov_rm32_imm32, Code::Mov_rm64_imm32];

const TEST_RM_R: [Code; 4] = [Code::Test_rm8_r8, Code::Test_rm16_r16, Code::Test_rm32_r32, Code::Test_rm64_r64];
const TEST_RM_IMM: [Code; 4] = [Code::Test_rm8_imm8, Code::Test_rm16_imm16, Code::Test_rm32_imm32, Code::Test_rm64_imm32];

const IMUL_R_RM: [Code; 3] = [Code::Imul_r16_rm16, Code::Imul_r32_rm32, Code::Imul_r64_rm64];
const IMUL_R_RM_IMM8: [Code; 3] = [Code::Imul_r16_rm16_imm8, Code::Imul_r32_rm32_imm8, Code::Imul_r64_rm64_imm8];
const IMUL_R_RM_IMM: [Code; 3] = [Code::Imul_r16_rm16_imm16, Code::Imul_r32_rm32_imm32, Code::Imul_r64_rm64_imm32];

const SHL: [Code; 4] = [Code::Shl_rm8_imm8, Code::Shl_rm16_imm8, Code::Shl_rm32_imm8, Code::Shl_rm64_imm8];
const SHR: [Code; 4] = [Code::Shr_rm8_imm8, Code::Shr_rm16_imm8, Code::Shr_rm32_imm8, Code::Shr_rm64_imm8];
const SAR: [Code; 4] = [Code::Sar_rm8_imm8, Code::Sar_rm16_imm8, Code::Sar_rm32_imm8, Code::Sar_rm64_imm8];

const INC: [Code; 4] = [Code::Inc_rm8, Code::Inc_rm16, Code::Inc_rm32, Code::Inc_rm64];
const DEC: [Code; 4] = [Code::Dec_rm8, Code::Dec_rm16, Code::Dec_rm32, Code::Dec_rm64];
const NEG: [Code; 4] = [Code::Neg_rm8, Code::Neg_rm16, Code::Neg_rm32, Code::Neg_rm64];
const NOT: [Code; 4] = [Code::Not_rm8, Code::Not_rm16, Code::Not_rm32, Code::Not_rm64];

const LEA: [Code; 3] = [Code::Lea_r16_m, Code::Lea_r32_m, Code::Lea_r64_m];

/// Zero/sign extension by source width (8, 16) and destination width (16, 32, 64).
const MOVZX: [[Option<Code>; 3]; 2] = [
    [Some(Code::Movzx_r16_rm8), Some(Code::Movzx_r32_rm8), Some(Code::Movzx_r64_rm8)],
    [None, Some(Code::Movzx_r32_rm16), Some(Code::Movzx_r64_rm16)],
];
const MOVSX: [[Option<Code>; 3]; 2] = [
    [Some(Code::Movsx_r16_rm8), Some(Code::Movsx_r32_rm8), Some(Code::Movsx_r64_rm8)],
    [None, Some(Code::Movsx_r32_rm16), Some(Code::Movsx_r64_rm16)],
];

/// Load/store forms of a vector move: (register <- register/memory, memory <- register).
struct VectorMove {
    load: Code,
    store: Code,
}

const MOVSS: VectorMove = VectorMove { load: Code::Movss_xmm_xmmm32, store: Code::Movss_xmmm32_xmm };
const MOVSD: VectorMove = VectorMove { load: Code::Movsd_xmm_xmmm64, store: Code::Movsd_xmmm64_xmm };
const MOVDQU: VectorMove = VectorMove { load: Code::Movdqu_xmm_xmmm128, store: Code::Movdqu_xmmm128_xmm };
const MOVAPS: VectorMove = VectorMove { load: Code::Movaps_xmm_xmmm128, store: Code::Movaps_xmmm128_xmm };
const VMOVDQU_XMM: VectorMove = VectorMove {
    load: Code::VEX_Vmovdqu_xmm_xmmm128,
    store: Code::VEX_Vmovdqu_xmmm128_xmm,
};
const VMOVDQU_YMM: VectorMove = VectorMove {
    load: Code::VEX_Vmovdqu_ymm_ymmm256,
    store: Code::VEX_Vmovdqu_ymmm256_ymm,
};

fn width_index(class: WidthClass) -> Option<usize> {
    match class {
        WidthClass::Gp8 => Some(0),
        WidthClass::Gp16 => Some(1),
        WidthClass::Gp32 => Some(2),
        WidthClass::Gp64 => Some(3),
        WidthClass::Xmm | WidthClass::Ymm => None,
    }
}

fn register(reg: AsmReg, class: WidthClass, position: usize) -> Result<Register, Rejection> {
    to_register(reg, class).ok_or_else(|| reject(Some(position), format!("no {class} view of this register")))
}

/// Build the iced memory operand, checking that the addressing mode is encodable.
fn memory(mem: &MemRef, position: usize) -> Result<MemoryOperand, Rejection> {
    if !matches!(mem.scale, 1 | 2 | 4 | 8) {
        return Err(Rejection::Range(format!("scale {} is not 1, 2, 4 or 8", mem.scale)));
    }
    if mem.index.is_none() && mem.scale != 1 {
        return Err(Rejection::Range(format!("scale {} without an index register", mem.scale)));
    }
    if i32::try_from(mem.displacement).is_err() {
        return Err(Rejection::Range(format!(
            "displacement {} does not fit in 32 bits",
            mem.displacement
        )));
    }
    let base = register(mem.base, WidthClass::Gp64, position)?;
    let index = match mem.index {
        Some(index) if index == AsmReg::RSP => {
            return Err(reject(Some(position), "rsp cannot be an index register"))
        }
        Some(index) => register(index, WidthClass::Gp64, position)?,
        None => Register::None,
    };
    let displ_size = if mem.displacement == 0 {
        0
    } else if i8::try_from(mem.displacement).is_ok() {
        1
    } else {
        8
    };
    Ok(MemoryOperand::with_base_index_scale_displ_size(
        base,
        index,
        u32::from(mem.scale),
        mem.displacement,
        displ_size,
    ))
}

/// Immediate truncated to `class`, as the i32 iced expects, if it fits.
fn immediate(class: WidthClass, imm: i64) -> Option<i32> {
    match class {
        WidthClass::Gp8 if (-128..=255).contains(&imm) => Some(i32::from(imm as u8 as i8)),
        WidthClass::Gp16 if (-32768..=65535).contains(&imm) => Some(i32::from(imm as u16 as i16)),
        WidthClass::Gp32 if (i64::from(i32::MIN)..=i64::from(u32::MAX)).contains(&imm) => {
            Some(imm as u32 as i32)
        }
        WidthClass::Gp64 => i32::try_from(imm).ok(),
        _ => None,
    }
}

fn immediate_error(class: WidthClass, imm: i64, position: usize) -> Rejection {
    reject(
        Some(position),
        format!("immediate {imm} does not fit a {class} operation"),
    )
}

/// Width of the memory access; a register operand decides when present.
fn check_memory_width(mem: &MemRef, class: WidthClass, position: usize) -> Result<(), Rejection> {
    match mem.size {
        Some(size) if width_index(size).is_some() && size != class => Err(reject(
            Some(position),
            format!("memory operand is {size} but the operation is {class}"),
        )),
        _ => Ok(()),
    }
}

fn gp_class(operand: &PhysOperand, position: usize) -> Result<(WidthClass, usize), Rejection> {
    let class = match operand {
        PhysOperand::Reg(_, class) => *class,
        PhysOperand::Mem(MemRef { size: Some(size), .. }) => *size,
        PhysOperand::Mem(_) => return Err(reject(Some(position), "memory operand needs an access width")),
        PhysOperand::Imm(_) => return Err(reject(Some(position), "immediate operand has no width")),
    };
    let index = width_index(class)
        .ok_or_else(|| reject(Some(position), format!("{class} register in an integer operation")))?;
    Ok((class, index))
}

/// Width of a two-operand integer operation: the first register operand
/// decides, otherwise the destination's memory width.
fn operation_class(operands: &[PhysOperand]) -> Result<(WidthClass, usize), Rejection> {
    match operands.iter().position(|operand| matches!(operand, PhysOperand::Reg(..))) {
        Some(position) => gp_class(&operands[position], position),
        None => gp_class(&operands[0], 0),
    }
}

fn select(op: MachineOp, operands: &[PhysOperand]) -> Selected {
    match op {
        MachineOp::Portable(opcode) => select_portable(opcode, operands),
        MachineOp::Movaps => vector_move(&MOVAPS, WidthClass::Xmm, operands),
        MachineOp::Push | MachineOp::Pop => {
            let code = if op == MachineOp::Push { Code::Push_r64 } else { Code::Pop_r64 };
            match operands {
                [PhysOperand::Reg(reg, WidthClass::Gp64)] => {
                    Ok(Instruction::with1(code, register(*reg, WidthClass::Gp64, 0)?)?)
                }
                _ => Err(reject(Some(0), "push and pop take a 64-bit register")),
            }
        }
        MachineOp::Ret => Ok(Instruction::with(Code::Retnq)),
        MachineOp::Vzeroupper => Ok(Instruction::with(Code::VEX_Vzeroupper)),
    }
}

fn select_portable(opcode: Opcode, operands: &[PhysOperand]) -> Selected {
    if operands.len() != opcode.arity() {
        return Err(reject(
            None,
            format!("{opcode} takes {} operands, found {}", opcode.arity(), operands.len()),
        ));
    }
    match opcode {
        Opcode::Add => alu(&ADD, operands),
        Opcode::Sub => alu(&SUB, operands),
        Opcode::And => alu(&AND, operands),
        Opcode::Or => alu(&OR, operands),
        Opcode::Xor => alu(&XOR, operands),
        Opcode::Cmp => alu(&CMP, operands),
        Opcode::Mov => mov(operands),
        Opcode::Test => test(operands),
        Opcode::Imul => imul(operands),
        Opcode::Shl => shift(&SHL, operands),
        Opcode::Shr => shift(&SHR, operands),
        Opcode::Sar => shift(&SAR, operands),
        Opcode::Inc => unary(&INC, operands),
        Opcode::Dec => unary(&DEC, operands),
        Opcode::Neg => unary(&NEG, operands),
        Opcode::Not => unary(&NOT, operands),
        Opcode::Lea => lea(operands),
        Opcode::Movzx => extend(&MOVZX, false, operands),
        Opcode::Movsx => extend(&MOVSX, true, operands),
        Opcode::Movss => vector_move(&MOVSS, WidthClass::Xmm, operands),
        Opcode::Movsd => vector_move(&MOVSD, WidthClass::Xmm, operands),
        Opcode::Movdqu => vector_move(&MOVDQU, WidthClass::Xmm, operands),
        Opcode::Addss => sse(Code::Addss_xmm_xmmm32, operands),
        Opcode::Addsd => sse(Code::Addsd_xmm_xmmm64, operands),
        Opcode::Subss => sse(Code::Subss_xmm_xmmm32, operands),
        Opcode::Subsd => sse(Code::Subsd_xmm_xmmm64, operands),
        Opcode::Mulss => sse(Code::Mulss_xmm_xmmm32, operands),
        Opcode::Mulsd => sse(Code::Mulsd_xmm_xmmm64, operands),
        Opcode::Paddd => sse(Code::Paddd_xmm_xmmm128, operands),
        Opcode::Paddq => sse(Code::Paddq_xmm_xmmm128, operands),
        Opcode::Pxor => sse(Code::Pxor_xmm_xmmm128, operands),
        Opcode::Vmovdqu => vmovdqu(operands),
        Opcode::Vpaddd => avx3(Code::VEX_Vpaddd_xmm_xmm_xmmm128, Code::VEX_Vpaddd_ymm_ymm_ymmm256, operands),
        Opcode::Vpaddq => avx3(Code::VEX_Vpaddq_xmm_xmm_xmmm128, Code::VEX_Vpaddq_ymm_ymm_ymmm256, operands),
        Opcode::Vpxor => avx3(Code::VEX_Vpxor_xmm_xmm_xmmm128, Code::VEX_Vpxor_ymm_ymm_ymmm256, operands),
    }
}

fn same_width(dst: WidthClass, src: WidthClass) -> Result<(), Rejection> {
    if dst == src {
        Ok(())
    } else {
        Err(reject(Some(1), format!("operand widths differ: {dst} and {src}")))
    }
}

fn alu(forms: &AluForms, operands: &[PhysOperand]) -> Selected {
    let (class, w) = operation_class(operands)?;
    match (&operands[0], &operands[1]) {
        (PhysOperand::Reg(dst, _), PhysOperand::Reg(src, src_class)) => {
            same_width(class, *src_class)?;
            Ok(Instruction::with2(forms.rm_r[w], register(*dst, class, 0)?, register(*src, class, 1)?)?)
        }
        (PhysOperand::Reg(dst, _), PhysOperand::Mem(mem)) => {
            check_memory_width(mem, class, 1)?;
            Ok(Instruction::with2(forms.r_rm[w], register(*dst, class, 0)?, memory(mem, 1)?)?)
        }
        (PhysOperand::Mem(mem), PhysOperand::Reg(src, src_class)) => {
            check_memory_width(mem, *src_class, 0)?;
            Ok(Instruction::with2(forms.rm_r[w], memory(mem, 0)?, register(*src, class, 1)?)?)
        }
        (dst, PhysOperand::Imm(imm)) => {
            let value = immediate(class, *imm).ok_or_else(|| immediate_error(class, *imm, 1))?;
            let code = match w {
                0 => forms.rm_imm[0],
                _ if i8::try_from(value).is_ok() => forms.rm_imm8[w - 1],
                _ => forms.rm_imm[w],
            };
            match dst {
                PhysOperand::Reg(reg, _) => Ok(Instruction::with2(code, register(*reg, class, 0)?, value)?),
                PhysOperand::Mem(mem) => Ok(Instruction::with2(code, memory(mem, 0)?, value)?),
                PhysOperand::Imm(_) => Err(reject(Some(0), "immediate used as destination")),
            }
        }
        (PhysOperand::Mem(_), PhysOperand::Mem(_)) => Err(reject(Some(1), "two memory operands")),
        (PhysOperand::Imm(_), _) => Err(reject(Some(0), "immediate used as destination")),
    }
}

fn mov(operands: &[PhysOperand]) -> Selected {
    let (class, w) = operation_class(operands)?;
    match (&operands[0], &operands[1]) {
        (PhysOperand::Reg(dst, _), PhysOperand::Reg(src, src_class)) => {
            same_width(class, *src_class)?;
            Ok(Instruction::with2(MOV_RM_R[w], register(*dst, class, 0)?, register(*src, class, 1)?)?)
        }
        (PhysOperand::Reg(dst, _), PhysOperand::Mem(mem)) => {
            check_memory_width(mem, class, 1)?;
            Ok(Instruction::with2(MOV_R_RM[w], register(*dst, class, 0)?, memory(mem, 1)?)?)
        }
        (PhysOperand::Mem(mem), PhysOperand::Reg(src, src_class)) => {
            check_memory_width(mem, *src_class, 0)?;
            Ok(Instruction::with2(MOV_RM_R[w], memory(mem, 0)?, register(*src, class, 1)?)?)
        }
        (PhysOperand::Reg(dst, _), PhysOperand::Imm(imm)) => {
            let dst = register(*dst, class, 0)?;
            match immediate(class, *imm) {
                Some(value) if w == 3 => Ok(Instruction::with2(Code::Mov_rm64_imm32, dst, value)?),
                Some(value) => Ok(Instruction::with2(MOV_R_IMM[w], dst, value)?),
                None if w == 3 => Ok(Instruction::with2(Code::Mov_r64_imm64, dst, *imm)?),
                None => Err(immediate_error(class, *imm, 1)),
            }
        }
        (PhysOperand::Mem(mem), PhysOperand::Imm(imm)) => {
            let value = immediate(class, *imm).ok_or_else(|| immediate_error(class, *imm, 1))?;
            Ok(Instruction::with2(MOV_RM_IMM[w], memory(mem, 0)?, value)?)
        }
        (PhysOperand::Mem(_), PhysOperand::Mem(_)) => Err(reject(Some(1), "two memory operands")),
        (PhysOperand::Imm(_), _) => Err(reject(Some(0), "immediate used as destination")),
    }
}

fn test(operands: &[PhysOperand]) -> Selected {
    let (class, w) = operation_class(operands)?;
    match (&operands[0], &operands[1]) {
        (PhysOperand::Reg(a, _), PhysOperand::Reg(b, b_class)) => {
            same_width(class, *b_class)?;
            Ok(Instruction::with2(TEST_RM_R[w], register(*a, class, 0)?, register(*b, class, 1)?)?)
        }
        // TEST is symmetric; only the r/m, reg form exists.
        (PhysOperand::Reg(a, _), PhysOperand::Mem(mem)) => {
            check_memory_width(mem, class, 1)?;
            Ok(Instruction::with2(TEST_RM_R[w], memory(mem, 1)?, register(*a, class, 0)?)?)
        }
        (PhysOperand::Mem(mem), PhysOperand::Reg(b, b_class)) => {
            check_memory_width(mem, *b_class, 0)?;
            Ok(Instruction::with2(TEST_RM_R[w], memory(mem, 0)?, register(*b, class, 1)?)?)
        }
        (dst, PhysOperand::Imm(imm)) => {
            let value = immediate(class, *imm).ok_or_else(|| immediate_error(class, *imm, 1))?;
            match dst {
                PhysOperand::Reg(reg, _) => Ok(Instruction::with2(TEST_RM_IMM[w], register(*reg, class, 0)?, value)?),
                PhysOperand::Mem(mem) => Ok(Instruction::with2(TEST_RM_IMM[w], memory(mem, 0)?, value)?),
                PhysOperand::Imm(_) => Err(reject(Some(0), "immediate used as destination")),
            }
        }
        (PhysOperand::Mem(_), PhysOperand::Mem(_)) => Err(reject(Some(1), "two memory operands")),
        (PhysOperand::Imm(_), _) => Err(reject(Some(0), "immediate used as destination")),
    }
}

fn imul(operands: &[PhysOperand]) -> Selected {
    let PhysOperand::Reg(dst, class) = operands[0] else {
        return Err(reject(Some(0), "imul needs a register destination"));
    };
    let (_, w) = gp_class(&operands[0], 0)?;
    if w == 0 {
        return Err(reject(Some(0), "imul has no two-operand 8-bit form"));
    }
    let dst_reg = register(dst, class, 0)?;
    match &operands[1] {
        PhysOperand::Reg(src, src_class) => {
            same_width(class, *src_class)?;
            Ok(Instruction::with2(IMUL_R_RM[w - 1], dst_reg, register(*src, class, 1)?)?)
        }
        PhysOperand::Mem(mem) => {
            check_memory_width(mem, class, 1)?;
            Ok(Instruction::with2(IMUL_R_RM[w - 1], dst_reg, memory(mem, 1)?)?)
        }
        PhysOperand::Imm(imm) => {
            let value = immediate(class, *imm).ok_or_else(|| immediate_error(class, *imm, 1))?;
            let code = if i8::try_from(value).is_ok() {
                IMUL_R_RM_IMM8[w - 1]
            } else {
                IMUL_R_RM_IMM[w - 1]
            };
            Ok(Instruction::with3(code, dst_reg, dst_reg, value)?)
        }
    }
}

fn shift(codes: &[Code; 4], operands: &[PhysOperand]) -> Selected {
    let (class, w) = gp_class(&operands[0], 0)?;
    let count = match operands[1] {
        PhysOperand::Imm(count) if (0..=255).contains(&count) => count as i32,
        PhysOperand::Imm(count) => {
            return Err(reject(Some(1), format!("shift count {count} out of range")))
        }
        _ => return Err(reject(Some(1), "shift count must be an immediate")),
    };
    match &operands[0] {
        PhysOperand::Reg(reg, _) => Ok(Instruction::with2(codes[w], register(*reg, class, 0)?, count)?),
        PhysOperand::Mem(mem) => Ok(Instruction::with2(codes[w], memory(mem, 0)?, count)?),
        PhysOperand::Imm(_) => Err(reject(Some(0), "immediate used as destination")),
    }
}

fn unary(codes: &[Code; 4], operands: &[PhysOperand]) -> Selected {
    let (class, w) = gp_class(&operands[0], 0)?;
    match &operands[0] {
        PhysOperand::Reg(reg, _) => Ok(Instruction::with1(codes[w], register(*reg, class, 0)?)?),
        PhysOperand::Mem(mem) => Ok(Instruction::with1(codes[w], memory(mem, 0)?)?),
        PhysOperand::Imm(_) => Err(reject(Some(0), "immediate used as destination")),
    }
}

fn lea(operands: &[PhysOperand]) -> Selected {
    match (&operands[0], &operands[1]) {
        (PhysOperand::Reg(dst, class), PhysOperand::Mem(mem)) => match width_index(*class) {
            Some(w) if w > 0 => Ok(Instruction::with2(LEA[w - 1], register(*dst, *class, 0)?, memory(mem, 1)?)?),
            _ => Err(reject(Some(0), format!("lea cannot write a {class} register"))),
        },
        (PhysOperand::Reg(..), _) => Err(reject(Some(1), "lea needs a memory operand")),
        _ => Err(reject(Some(0), "lea needs a register destination")),
    }
}

fn extend(table: &[[Option<Code>; 3]; 2], signed: bool, operands: &[PhysOperand]) -> Selected {
    let PhysOperand::Reg(dst, dst_class) = operands[0] else {
        return Err(reject(Some(0), "extension needs a register destination"));
    };
    let (_, dst_w) = gp_class(&operands[0], 0)?;
    let (src_class, _) = gp_class(&operands[1], 1)?;
    let source = |class: WidthClass| -> Result<PhysOperand, Rejection> {
        match operands[1] {
            PhysOperand::Reg(src, _) => Ok(PhysOperand::Reg(src, class)),
            other => Ok(other),
        }
    };
    let narrower = |position: usize| {
        reject(
            Some(position),
            format!("cannot extend {src_class} into {dst_class}"),
        )
    };
    match src_class {
        WidthClass::Gp8 | WidthClass::Gp16 => {
            let row = if src_class == WidthClass::Gp8 { 0 } else { 1 };
            let code = dst_w
                .checked_sub(1)
                .and_then(|column| table[row][column])
                .ok_or_else(|| narrower(0))?;
            let dst = register(dst, dst_class, 0)?;
            match source(src_class)? {
                PhysOperand::Reg(src, class) => Ok(Instruction::with2(code, dst, register(src, class, 1)?)?),
                PhysOperand::Mem(mem) => Ok(Instruction::with2(code, dst, memory(&mem, 1)?)?),
                PhysOperand::Imm(_) => Err(reject(Some(1), "cannot extend an immediate")),
            }
        }
        WidthClass::Gp32 if dst_class == WidthClass::Gp64 => {
            let (code, dst) = if signed {
                (Code::Movsxd_r64_rm32, register(dst, WidthClass::Gp64, 0)?)
            } else {
                // Writing the 32-bit view clears the upper half.
                (Code::Mov_r32_rm32, register(dst, WidthClass::Gp32, 0)?)
            };
            match source(src_class)? {
                PhysOperand::Reg(src, class) => Ok(Instruction::with2(code, dst, register(src, class, 1)?)?),
                PhysOperand::Mem(mem) => Ok(Instruction::with2(code, dst, memory(&mem, 1)?)?),
                PhysOperand::Imm(_) => Err(reject(Some(1), "cannot extend an immediate")),
            }
        }
        _ => Err(narrower(1)),
    }
}

fn vector_register(operand: &PhysOperand, class: WidthClass, position: usize) -> Result<Register, Rejection> {
    match operand {
        PhysOperand::Reg(reg, reg_class) if *reg_class == class => register(*reg, class, position),
        PhysOperand::Reg(_, reg_class) => Err(reject(
            Some(position),
            format!("expected a {class} register, found {reg_class}"),
        )),
        _ => Err(reject(Some(position), format!("expected a {class} register"))),
    }
}

fn vector_move(forms: &VectorMove, class: WidthClass, operands: &[PhysOperand]) -> Selected {
    match (&operands[0], &operands[1]) {
        (PhysOperand::Mem(mem), src) => Ok(Instruction::with2(
            forms.store,
            memory(mem, 0)?,
            vector_register(src, class, 1)?,
        )?),
        (dst, PhysOperand::Mem(mem)) => Ok(Instruction::with2(
            forms.load,
            vector_register(dst, class, 0)?,
            memory(mem, 1)?,
        )?),
        (dst, src) => Ok(Instruction::with2(
            forms.load,
            vector_register(dst, class, 0)?,
            vector_register(src, class, 1)?,
        )?),
    }
}

fn sse(code: Code, operands: &[PhysOperand]) -> Selected {
    let dst = vector_register(&operands[0], WidthClass::Xmm, 0)?;
    match &operands[1] {
        PhysOperand::Mem(mem) => Ok(Instruction::with2(code, dst, memory(mem, 1)?)?),
        src => Ok(Instruction::with2(code, dst, vector_register(src, WidthClass::Xmm, 1)?)?),
    }
}

fn vector_class(operands: &[PhysOperand]) -> WidthClass {
    let ymm = operands
        .iter()
        .any(|operand| matches!(operand, PhysOperand::Reg(_, WidthClass::Ymm)));
    if ymm {
        WidthClass::Ymm
    } else {
        WidthClass::Xmm
    }
}

fn vmovdqu(operands: &[PhysOperand]) -> Selected {
    match vector_class(operands) {
        WidthClass::Ymm => vector_move(&VMOVDQU_YMM, WidthClass::Ymm, operands),
        _ => vector_move(&VMOVDQU_XMM, WidthClass::Xmm, operands),
    }
}

fn avx3(xmm: Code, ymm: Code, operands: &[PhysOperand]) -> Selected {
    let class = vector_class(operands);
    let code = if class == WidthClass::Ymm { ymm } else { xmm };
    let dst = vector_register(&operands[0], class, 0)?;
    let lhs = vector_register(&operands[1], class, 1)?;
    match &operands[2] {
        PhysOperand::Mem(mem) => Ok(Instruction::with3(code, dst, lhs, memory(mem, 2)?)?),
        rhs => Ok(Instruction::with3(code, dst, lhs, vector_register(rhs, class, 2)?)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    fn gp(reg: AsmReg) -> PhysOperand {
        PhysOperand::Reg(reg, WidthClass::Gp64)
    }

    fn encode_one(op: MachineOp, operands: &[PhysOperand]) -> CompileResult<Vec<u8>> {
        let arena = Bump::new();
        let session = EncodeSession::new(&arena, "t");
        let mut encoder = X64Encoder::new(&session)?;
        encoder.emit(op, operands, 0)?;
        Ok(encoder.finish()?.code)
    }

    fn portable(opcode: Opcode, operands: &[PhysOperand]) -> Vec<u8> {
        encode_one(MachineOp::Portable(opcode), operands).unwrap()
    }

    #[test]
    fn test_gp_register_forms() {
        // add rax, rbx
        assert_eq!(portable(Opcode::Add, &[gp(AsmReg::RAX), gp(AsmReg::RBX)]), vec![0x48, 0x01, 0xD8]);
        // mov rcx, rax
        assert_eq!(portable(Opcode::Mov, &[gp(AsmReg::RCX), gp(AsmReg::RAX)]), vec![0x48, 0x89, 0xC1]);
        // dec rcx
        assert_eq!(portable(Opcode::Dec, &[gp(AsmReg::RCX)]), vec![0x48, 0xFF, 0xC9]);
        // xor eax, eax
        let eax_reg = PhysOperand::Reg(AsmReg::RAX, WidthClass::Gp32);
        assert_eq!(portable(Opcode::Xor, &[eax_reg, eax_reg]), vec![0x31, 0xC0]);
    }

    #[test]
    fn test_immediate_forms() {
        // add rax, 1 uses the imm8 form
        assert_eq!(portable(Opcode::Add, &[gp(AsmReg::RAX), PhysOperand::Imm(1)]), vec![0x48, 0x83, 0xC0, 0x01]);
        // mov rax, 1 uses the sign-extended imm32 form
        assert_eq!(
            portable(Opcode::Mov, &[gp(AsmReg::RAX), PhysOperand::Imm(1)]),
            vec![0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00]
        );
        // mov rax, 1 << 40 needs imm64
        let code = portable(Opcode::Mov, &[gp(AsmReg::RAX), PhysOperand::Imm(1 << 40)]);
        assert_eq!(&code[..2], &[0x48, 0xB8]);
        assert_eq!(code.len(), 10);
        // add eax, 0xFFFFFFFF is add eax, -1
        let eax_reg = PhysOperand::Reg(AsmReg::RAX, WidthClass::Gp32);
        assert_eq!(portable(Opcode::Add, &[eax_reg, PhysOperand::Imm(0xFFFF_FFFF)]), vec![0x83, 0xC0, 0xFF]);
    }

    #[test]
    fn test_memory_operands() {
        // mov rax, [rsp+8]
        let slot = PhysOperand::Mem(MemRef::base_disp(AsmReg::RSP, 8, Some(WidthClass::Gp64)));
        assert_eq!(portable(Opcode::Mov, &[gp(AsmReg::RAX), slot]), vec![0x48, 0x8B, 0x44, 0x24, 0x08]);
        // movzx rax, word [rsp+16]
        let word = PhysOperand::Mem(MemRef::base_disp(AsmReg::RSP, 16, Some(WidthClass::Gp16)));
        assert_eq!(
            portable(Opcode::Movzx, &[gp(AsmReg::RAX), word]),
            vec![0x48, 0x0F, 0xB7, 0x44, 0x24, 0x10]
        );
    }

    #[test]
    fn test_unsupported_combinations() {
        let mem = PhysOperand::Mem(MemRef::base_disp(AsmReg::RAX, 0, Some(WidthClass::Gp64)));
        let err = encode_one(MachineOp::Portable(Opcode::Add), &[mem, mem]).unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::UnsupportedOperands);

        let err = encode_one(
            MachineOp::Portable(Opcode::Add),
            &[gp(AsmReg::RAX), PhysOperand::Imm(1 << 40)],
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::UnsupportedOperands);

        let err = encode_one(
            MachineOp::Portable(Opcode::Shl),
            &[gp(AsmReg::RAX), gp(AsmReg::RCX)],
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::UnsupportedOperands);

        let ymm = PhysOperand::Reg(AsmReg::vec(1), WidthClass::Ymm);
        let err = encode_one(MachineOp::Portable(Opcode::Paddd), &[ymm, ymm]).unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::UnsupportedOperands);
    }

    #[test]
    fn test_addressing_range() {
        let far = MemRef::base_disp(AsmReg::RAX, 1 << 33, Some(WidthClass::Gp64));
        let err = encode_one(
            MachineOp::Portable(Opcode::Mov),
            &[gp(AsmReg::RCX), PhysOperand::Mem(far)],
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::AddressingRange);

        let scaled = MemRef {
            base: AsmReg::RAX,
            index: Some(AsmReg::RCX),
            scale: 3,
            displacement: 0,
            size: Some(WidthClass::Gp64),
        };
        let err = encode_one(
            MachineOp::Portable(Opcode::Mov),
            &[gp(AsmReg::RDX), PhysOperand::Mem(scaled)],
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::core::error::ErrorKind::AddressingRange);
    }

    #[test]
    fn test_vector_forms() {
        let ymm0_reg = PhysOperand::Reg(AsmReg::vec(0), WidthClass::Ymm);
        let ymm1_reg = PhysOperand::Reg(AsmReg::vec(1), WidthClass::Ymm);
        // vpaddd ymm0, ymm0, ymm1
        assert_eq!(portable(Opcode::Vpaddd, &[ymm0_reg, ymm0_reg, ymm1_reg]), vec![0xC5, 0xFD, 0xFE, 0xC1]);
        assert_eq!(encode_one(MachineOp::Vzeroupper, &[]).unwrap(), vec![0xC5, 0xF8, 0x77]);
        assert_eq!(encode_one(MachineOp::Ret, &[]).unwrap(), vec![0xC3]);
        assert_eq!(encode_one(MachineOp::Push, &[gp(AsmReg::RBX)]).unwrap(), vec![0x53]);
    }

    #[test]
    fn test_labels_and_branches() {
        let arena = Bump::new();
        let session = EncodeSession::new(&arena, "t");
        let mut encoder = X64Encoder::new(&session).unwrap();
        let label = crate::core::instruction::LoopLabel::fresh();

        encoder.place_label(label.begin()).unwrap();
        encoder
            .emit(MachineOp::Portable(Opcode::Dec), &[gp(AsmReg::RCX)], 0)
            .unwrap();
        encoder.branch(JumpCondition::NotEqual, label.begin()).unwrap();
        encoder.place_label(label.end()).unwrap();
        encoder.emit(MachineOp::Ret, &[], 1).unwrap();
        let encoded = encoder.finish().unwrap();

        // dec rcx; jne -5 (short form); ret
        assert_eq!(encoded.code, vec![0x48, 0xFF, 0xC9, 0x75, 0xFB, 0xC3]);
        assert_eq!(encoded.labels, vec![(label.begin(), 0), (label.end(), 5)]);
        assert_eq!(session.stats().instructions_encoded, 3);
    }
}
