//! Physical x86-64 register tables.
//!
//! Maps an [`AsmReg`] viewed at a [`WidthClass`] onto the iced-x86 register
//! and onto its Intel-syntax name.

use crate::core::register_file::AsmReg;
use crate::core::types::WidthClass;
use iced_x86::Register;

const GP64_REGS: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

const GP32_REGS: [Register; 16] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESP,
    Register::EBP,
    Register::ESI,
    Register::EDI,
    Register::R8D,
    Register::R9D,
    Register::R10D,
    Register::R11D,
    Register::R12D,
    Register::R13D,
    Register::R14D,
    Register::R15D,
];

const GP16_REGS: [Register; 16] = [
    Register::AX,
    Register::CX,
    Register::DX,
    Register::BX,
    Register::SP,
    Register::BP,
    Register::SI,
    Register::DI,
    Register::R8W,
    Register::R9W,
    Register::R10W,
    Register::R11W,
    Register::R12W,
    Register::R13W,
    Register::R14W,
    Register::R15W,
];

const GP8_REGS: [Register; 16] = [
    Register::AL,
    Register::CL,
    Register::DL,
    Register::BL,
    Register::SPL,
    Register::BPL,
    Register::SIL,
    Register::DIL,
    Register::R8L,
    Register::R9L,
    Register::R10L,
    Register::R11L,
    Register::R12L,
    Register::R13L,
    Register::R14L,
    Register::R15L,
];

const XMM_REGS: [Register; 16] = [
    Register::XMM0,
    Register::XMM1,
    Register::XMM2,
    Register::XMM3,
    Register::XMM4,
    Register::XMM5,
    Register::XMM6,
    Register::XMM7,
    Register::XMM8,
    Register::XMM9,
    Register::XMM10,
    Register::XMM11,
    Register::XMM12,
    Register::XMM13,
    Register::XMM14,
    Register::XMM15,
];

const YMM_REGS: [Register; 16] = [
    Register::YMM0,
    Register::YMM1,
    Register::YMM2,
    Register::YMM3,
    Register::YMM4,
    Register::YMM5,
    Register::YMM6,
    Register::YMM7,
    Register::YMM8,
    Register::YMM9,
    Register::YMM10,
    Register::YMM11,
    Register::YMM12,
    Register::YMM13,
    Register::YMM14,
    Register::YMM15,
];

const LOW_NAMES: [[&str; 8]; 4] = [
    ["rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi"],
    ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"],
    ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"],
    ["al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil"],
];

/// iced-x86 register for `reg` viewed at `class`, if the bank matches.
pub fn to_register(reg: AsmReg, class: WidthClass) -> Option<Register> {
    if reg.bank != class.bank() {
        return None;
    }
    let table = match class {
        WidthClass::Gp64 => &GP64_REGS,
        WidthClass::Gp32 => &GP32_REGS,
        WidthClass::Gp16 => &GP16_REGS,
        WidthClass::Gp8 => &GP8_REGS,
        WidthClass::Xmm => &XMM_REGS,
        WidthClass::Ymm => &YMM_REGS,
    };
    table.get(reg.id as usize).copied()
}

/// Physical register and width class of an iced-x86 register.
pub fn from_register(register: Register) -> Option<(AsmReg, WidthClass)> {
    let tables: [(&[Register; 16], WidthClass); 6] = [
        (&GP64_REGS, WidthClass::Gp64),
        (&GP32_REGS, WidthClass::Gp32),
        (&GP16_REGS, WidthClass::Gp16),
        (&GP8_REGS, WidthClass::Gp8),
        (&XMM_REGS, WidthClass::Xmm),
        (&YMM_REGS, WidthClass::Ymm),
    ];
    tables.iter().find_map(|(table, class)| {
        let id = table.iter().position(|&r| r == register)?;
        let bank = class.bank();
        Some((AsmReg::new(bank, id as u8), *class))
    })
}

/// Intel-syntax name of `reg` viewed at `class`.
pub fn register_name(reg: AsmReg, class: WidthClass) -> String {
    let (row, suffix) = match class {
        WidthClass::Xmm => return format!("xmm{}", reg.id),
        WidthClass::Ymm => return format!("ymm{}", reg.id),
        WidthClass::Gp64 => (0, ""),
        WidthClass::Gp32 => (1, "d"),
        WidthClass::Gp16 => (2, "w"),
        WidthClass::Gp8 => (3, "b"),
    };
    match LOW_NAMES[row].get(reg.id as usize) {
        Some(name) => (*name).to_string(),
        None => format!("r{}{suffix}", reg.id),
    }
}
