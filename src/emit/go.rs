// Go (Plan 9) assembly rendering. iced-x86 has no formatter for this syntax, so each decoded
// instruction is translated here: mnemonics take the Go spelling with a B/W/L/Q size suffix
// for general-purpose operations, operands are written source first (CMP keeps the Intel
// order, as the Go assembler expects), registers use the AX..R15 and X/Y names, and stack
// slots of the Go ABI are written as `name+offset(FP)` so `go vet` can match them against the
// Go declaration. An instruction without a Go spelling is emitted as raw BYTE directives.

//! Go assembler text.

use super::{banner, Dialect};
use crate::core::error::CompileResult;
use crate::core::types::{RegBank, WidthClass};
use crate::x64::calling_convention::Location;
use crate::x64::function_codegen::EncodedFunction;
use crate::x64::registers::from_register;
use iced_x86::{Instruction, Mnemonic, OpKind, Register};
use std::collections::BTreeMap;

const GP_NAMES: [&str; 16] = [
    "AX", "CX", "DX", "BX", "SP", "BP", "SI", "DI", "R8", "R9", "R10", "R11", "R12", "R13",
    "R14", "R15",
];

pub(crate) fn render(
    encoded: &EncodedFunction,
    instructions: &[Instruction],
    labels: &BTreeMap<u64, Vec<String>>,
) -> CompileResult<String> {
    let mut out = String::new();
    out.push_str("// Code generated by portasm. DO NOT EDIT.\n");
    out.push('\n');
    out.push_str(&banner(encoded, Dialect::Go));
    out.push('\n');
    out.push_str("#include \"textflag.h\"\n");
    out.push('\n');
    out += &format!(
        "TEXT ·{}(SB),NOSPLIT,$0-{}\n",
        encoded.name, encoded.placement.stack_size
    );

    let renderer = GoRenderer { encoded, labels };
    for instruction in instructions {
        if let Some(names) = labels.get(&instruction.ip()) {
            for label in names {
                out += &format!("{label}:\n");
            }
        }
        let line = renderer
            .instruction(instruction)
            .unwrap_or_else(|| renderer.raw_bytes(instruction));
        out += &format!("\t{line}\n");
    }
    Ok(out)
}

struct GoRenderer<'e> {
    encoded: &'e EncodedFunction,
    labels: &'e BTreeMap<u64, Vec<String>>,
}

impl GoRenderer<'_> {
    fn instruction(&self, ins: &Instruction) -> Option<String> {
        let mnemonic = self.mnemonic(ins)?;
        let mut operands = (0..ins.op_count())
            .map(|i| self.operand(ins, i))
            .collect::<Option<Vec<_>>>()?;
        if ins.mnemonic() != Mnemonic::Cmp {
            operands.reverse();
        }
        if operands.is_empty() {
            Some(mnemonic)
        } else {
            Some(format!("{mnemonic} {}", operands.join(", ")))
        }
    }

    fn mnemonic(&self, ins: &Instruction) -> Option<String> {
        let sized = |base: &str| -> Option<String> {
            Some(format!("{base}{}", suffix(operand_bytes(ins, 0)?)?))
        };
        let name = match ins.mnemonic() {
            Mnemonic::Mov => return sized("MOV"),
            Mnemonic::Add => return sized("ADD"),
            Mnemonic::Sub => return sized("SUB"),
            Mnemonic::And => return sized("AND"),
            Mnemonic::Or => return sized("OR"),
            Mnemonic::Xor => return sized("XOR"),
            Mnemonic::Cmp => return sized("CMP"),
            Mnemonic::Test => return sized("TEST"),
            Mnemonic::Shl => return sized("SHL"),
            Mnemonic::Shr => return sized("SHR"),
            Mnemonic::Sar => return sized("SAR"),
            Mnemonic::Inc => return sized("INC"),
            Mnemonic::Dec => return sized("DEC"),
            Mnemonic::Neg => return sized("NEG"),
            Mnemonic::Not => return sized("NOT"),
            Mnemonic::Lea => return sized("LEA"),
            Mnemonic::Imul if ins.op_count() == 3 => return sized("IMUL3"),
            Mnemonic::Imul => return sized("IMUL"),
            Mnemonic::Movzx => return extension(ins, "ZX"),
            Mnemonic::Movsx => return extension(ins, "SX"),
            Mnemonic::Movsxd => "MOVLQSX",
            Mnemonic::Push => "PUSHQ",
            Mnemonic::Pop => "POPQ",
            Mnemonic::Ret => "RET",
            Mnemonic::Vzeroupper => "VZEROUPPER",
            Mnemonic::Jmp => "JMP",
            Mnemonic::Je => "JEQ",
            Mnemonic::Jne => "JNE",
            Mnemonic::Jl => "JLT",
            Mnemonic::Jle => "JLE",
            Mnemonic::Jg => "JGT",
            Mnemonic::Jge => "JGE",
            Mnemonic::Jb => "JCS",
            Mnemonic::Jbe => "JLS",
            Mnemonic::Ja => "JHI",
            Mnemonic::Jae => "JCC",
            Mnemonic::Movss => "MOVSS",
            Mnemonic::Movsd => "MOVSD",
            Mnemonic::Addss => "ADDSS",
            Mnemonic::Addsd => "ADDSD",
            Mnemonic::Subss => "SUBSS",
            Mnemonic::Subsd => "SUBSD",
            Mnemonic::Mulss => "MULSS",
            Mnemonic::Mulsd => "MULSD",
            Mnemonic::Movaps => "MOVAPS",
            Mnemonic::Movdqu => "MOVOU",
            Mnemonic::Paddd => "PADDL",
            Mnemonic::Paddq => "PADDQ",
            Mnemonic::Pxor => "PXOR",
            Mnemonic::Vmovdqu => "VMOVDQU",
            Mnemonic::Vpaddd => "VPADDD",
            Mnemonic::Vpaddq => "VPADDQ",
            Mnemonic::Vpxor => "VPXOR",
            _ => return None,
        };
        Some(name.to_string())
    }

    fn operand(&self, ins: &Instruction, i: u32) -> Option<String> {
        match ins.op_kind(i) {
            OpKind::Register => register(ins.op_register(i)),
            OpKind::Memory => self.memory(ins),
            OpKind::NearBranch64 => self
                .labels
                .get(&ins.near_branch_target())
                .and_then(|names| names.first().cloned()),
            OpKind::Immediate8 => Some(format!("${}", ins.immediate8() as i8)),
            OpKind::Immediate16 => Some(format!("${}", ins.immediate16() as i16)),
            OpKind::Immediate32 => Some(format!("${}", ins.immediate32() as i32)),
            OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64
            | OpKind::Immediate64 => Some(format!("${}", ins.immediate(i) as i64)),
            _ => None,
        }
    }

    fn memory(&self, ins: &Instruction) -> Option<String> {
        let displacement = ins.memory_displacement64() as i64;
        let base = ins.memory_base();
        let index = ins.memory_index();
        if base == Register::RSP && index == Register::None {
            return Some(self.frame_slot(displacement));
        }
        let mut text = String::new();
        if displacement != 0 {
            text += &displacement.to_string();
        }
        if base != Register::None {
            text += &format!("({})", register(base)?);
        }
        if index != Register::None {
            text += &format!("({}*{})", register(index)?, ins.memory_index_scale());
        }
        Some(text)
    }

    /// Name a caller stack slot the way `go vet` expects.
    fn frame_slot(&self, displacement: i64) -> String {
        let frame = &self.encoded.frame;
        let pushed = frame.saved_registers.len() as i64 * 8 + i64::from(frame.vector_area);
        let offset = displacement - pushed - 8;
        let placement = &self.encoded.placement;
        let named = self
            .encoded
            .arguments
            .iter()
            .map(|argument| argument.name())
            .zip(placement.arguments.iter())
            .chain(placement.ret.iter().map(|location| ("ret", location)));
        for (name, location) in named {
            if let Location::Stack { offset: start, size } = *location {
                let start = i64::from(start);
                if (start..start + i64::from(size)).contains(&offset) {
                    return format!("{name}+{offset}(FP)");
                }
            }
        }
        format!("{displacement}(SP)")
    }

    fn raw_bytes(&self, ins: &Instruction) -> String {
        let start = ins.ip() as usize;
        let bytes = self
            .encoded
            .code
            .get(start..start + ins.len())
            .unwrap_or_default();
        bytes
            .iter()
            .map(|byte| format!("BYTE ${byte:#04x}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn register(register: Register) -> Option<String> {
    let (reg, class) = from_register(register)?;
    match reg.bank {
        RegBank::GeneralPurpose => GP_NAMES.get(reg.id as usize).map(|name| name.to_string()),
        RegBank::Vector if class == WidthClass::Ymm => Some(format!("Y{}", reg.id)),
        RegBank::Vector => Some(format!("X{}", reg.id)),
    }
}

fn suffix(bytes: usize) -> Option<char> {
    match bytes {
        1 => Some('B'),
        2 => Some('W'),
        4 => Some('L'),
        8 => Some('Q'),
        _ => None,
    }
}

/// Access width of operand `i` in bytes.
fn operand_bytes(ins: &Instruction, i: u32) -> Option<usize> {
    match ins.op_kind(i) {
        OpKind::Register => {
            let (_, class) = from_register(ins.op_register(i))?;
            Some(class.bytes() as usize)
        }
        OpKind::Memory => Some(ins.memory_size().size()),
        _ => None,
    }
}

/// MOVBQZX style names: source width, destination width, kind.
fn extension(ins: &Instruction, kind: &str) -> Option<String> {
    let to = suffix(operand_bytes(ins, 0)?)?;
    let from = suffix(operand_bytes(ins, 1)?)?;
    Some(format!("MOV{from}{to}{kind}"))
}
