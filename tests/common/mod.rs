//! Shared test support: a small x86-64 interpreter over iced-x86 decoded
//! instructions, plus builders for the reference scenarios.
//!
//! The interpreter only knows the instructions portasm emits. It calls an
//! encoded function the way a caller of its convention would (arguments in
//! registers or caller stack slots, a return address on the stack), runs it to
//! the final `ret`, and checks that the stack pointer and every callee-saved
//! register come back unchanged.

#![allow(dead_code)]

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};
use portasm::core::types::RegBank;
use portasm::x64::calling_convention::Location;
use portasm::{
    begin_function, ArgType, Argument, EncodedFunction, Function, LoopCondition, MemoryOperand,
    Opcode, WidthClass,
};
use std::collections::HashMap;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const STACK_TOP: u64 = 0x7fff_0000;
const STACK_SIZE: u64 = 0x1_0000;
const HEAP_BASE: u64 = 0x1000_0000;
const RETURN_SENTINEL: u64 = 0x0bad_c0de;
const STEP_LIMIT: usize = 1_000_000;
const GARBAGE: u64 = 0x5a5a_5a5a_5a5a_5a5a;

/// Argument or result value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(u64),
    F32(f32),
    F64(f64),
    Vector(Vec<u8>),
}

impl Value {
    fn bytes(&self, size: usize) -> Vec<u8> {
        let mut bytes = match self {
            Value::Int(v) => v.to_le_bytes().to_vec(),
            Value::F32(v) => v.to_le_bytes().to_vec(),
            Value::F64(v) => v.to_le_bytes().to_vec(),
            Value::Vector(v) => v.clone(),
        };
        bytes.resize(size, 0);
        bytes
    }

    fn from_bytes(ty: &ArgType, bytes: &[u8]) -> Value {
        match ty {
            ArgType::Float32 => Value::F32(f32::from_le_bytes(bytes[..4].try_into().unwrap())),
            ArgType::Float64 => Value::F64(f64::from_le_bytes(bytes[..8].try_into().unwrap())),
            ArgType::Vector128 | ArgType::Vector256 => Value::Vector(bytes.to_vec()),
            _ => Value::Int(le(bytes)),
        }
    }
}

fn le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

fn sign_bit(size: usize) -> u64 {
    1u64 << (size * 8 - 1)
}

fn sign_extend(value: u64, size: usize) -> u64 {
    if size >= 8 {
        value
    } else if value & sign_bit(size) != 0 {
        value | !mask(size)
    } else {
        value & mask(size)
    }
}

/// Flat memory made of disjoint regions; touching anything else panics.
#[derive(Debug)]
pub struct Memory {
    regions: Vec<(u64, Vec<u8>)>,
    next: u64,
}

impl Memory {
    fn new() -> Self {
        Self {
            regions: vec![(STACK_TOP - STACK_SIZE, vec![0xcc; STACK_SIZE as usize])],
            next: HEAP_BASE,
        }
    }

    /// Map `bytes` at a fresh 16-byte aligned address.
    pub fn alloc(&mut self, bytes: &[u8]) -> u64 {
        let base = self.next;
        self.regions.push((base, bytes.to_vec()));
        self.next += (bytes.len() as u64).div_ceil(16) * 16 + 0x1000;
        base
    }

    fn locate(&self, addr: u64, len: usize) -> (usize, usize) {
        for (i, (base, data)) in self.regions.iter().enumerate() {
            if addr >= *base && addr + len as u64 <= *base + data.len() as u64 {
                return (i, (addr - base) as usize);
            }
        }
        panic!("access to unmapped memory {addr:#x}+{len}");
    }

    pub fn read(&self, addr: u64, len: usize) -> Vec<u8> {
        let (region, offset) = self.locate(addr, len);
        self.regions[region].1[offset..offset + len].to_vec()
    }

    pub fn write(&mut self, addr: u64, bytes: &[u8]) {
        let (region, offset) = self.locate(addr, bytes.len());
        self.regions[region].1[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn read_u64(&self, addr: u64, len: usize) -> u64 {
        le(&self.read(addr, len))
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    zf: bool,
    sf: bool,
    cf: bool,
    of: bool,
}

/// Resolved instruction operand.
#[derive(Debug, Clone, Copy)]
enum Place {
    Gp { index: usize, size: usize },
    Vec { index: usize, size: usize },
    Mem { addr: u64, size: usize },
    Imm(u64),
}

impl Place {
    fn size(&self) -> usize {
        match *self {
            Place::Gp { size, .. } | Place::Vec { size, .. } | Place::Mem { size, .. } => size,
            Place::Imm(_) => 8,
        }
    }
}

enum Control {
    Next,
    Jump(u64),
    Return,
}

/// Register file, flags and memory of the simulated CPU.
#[derive(Debug)]
pub struct Machine {
    pub gp: [u64; 16],
    pub vec: [[u8; 32]; 16],
    flags: Flags,
    pub memory: Memory,
    /// Instructions executed by the last call.
    pub steps: usize,
}

const RSP: usize = 4;

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self {
            gp: [0; 16],
            vec: [[0; 32]; 16],
            flags: Flags::default(),
            memory: Memory::new(),
            steps: 0,
        }
    }

    /// Call `encoded` with `args` and return its result.
    pub fn call(&mut self, encoded: &EncodedFunction, args: &[Value]) -> Option<Value> {
        assert_eq!(args.len(), encoded.arguments.len(), "argument count");
        for (i, reg) in self.gp.iter_mut().enumerate() {
            *reg = GARBAGE ^ (i as u64) << 8;
        }
        for (i, reg) in self.vec.iter_mut().enumerate() {
            *reg = [0xa0 | i as u8; 32];
        }

        // Entry state of a call: rsp + 8 is 16-byte aligned.
        let entry_rsp = STACK_TOP - 0x1000 - 8;
        self.gp[RSP] = entry_rsp;
        self.memory.write(entry_rsp, &RETURN_SENTINEL.to_le_bytes());

        for ((argument, location), value) in encoded
            .arguments
            .iter()
            .zip(&encoded.placement.arguments)
            .zip(args)
        {
            self.place_argument(argument.ty(), location, value, entry_rsp);
        }

        let info = encoded.convention.info();
        let saved_gp: Vec<(usize, u64)> = info
            .callee_saved_regs
            .iter_bank(RegBank::GeneralPurpose)
            .map(|reg| (reg.id as usize, self.gp[reg.id as usize]))
            .collect();
        let saved_vec: Vec<(usize, [u8; 16])> = info
            .callee_saved_regs
            .iter_bank(RegBank::Vector)
            .map(|reg| {
                let mut low = [0u8; 16];
                low.copy_from_slice(&self.vec[reg.id as usize][..16]);
                (reg.id as usize, low)
            })
            .collect();

        self.run(&encoded.code);

        assert_eq!(self.gp[RSP], entry_rsp + 8, "stack pointer not restored");
        for (index, value) in saved_gp {
            assert_eq!(self.gp[index], value, "callee-saved gp{index} clobbered");
        }
        for (index, value) in saved_vec {
            assert_eq!(&self.vec[index][..16], &value, "callee-saved xmm{index} clobbered");
        }

        let ty = encoded.return_type.as_ref()?;
        let location = encoded.placement.ret.as_ref()?;
        let size = ty.size() as usize;
        let bytes = match *location {
            Location::Register { reg, .. } if reg.bank == RegBank::GeneralPurpose => {
                (self.gp[reg.id as usize] & mask(size)).to_le_bytes()[..size.min(8)].to_vec()
            }
            Location::Register { reg, .. } => self.vec[reg.id as usize][..size].to_vec(),
            Location::Stack { offset, .. } => {
                self.memory.read(entry_rsp + 8 + u64::from(offset), size)
            }
        };
        Some(Value::from_bytes(ty, &bytes))
    }

    fn place_argument(&mut self, ty: &ArgType, location: &Location, value: &Value, entry_rsp: u64) {
        let size = ty.size() as usize;
        match *location {
            Location::Register { reg, .. } if reg.bank == RegBank::GeneralPurpose => {
                let bits = le(&value.bytes(size.min(8)));
                // Bits above the argument width are left as garbage.
                self.gp[reg.id as usize] = (GARBAGE & !mask(size)) | (bits & mask(size));
            }
            Location::Register { reg, .. } => {
                let bytes = value.bytes(size);
                self.vec[reg.id as usize][..size].copy_from_slice(&bytes);
            }
            Location::Stack { offset, .. } => {
                let bytes = value.bytes(size);
                self.memory.write(entry_rsp + 8 + u64::from(offset), &bytes);
            }
        }
    }

    fn run(&mut self, code: &[u8]) {
        let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
        let mut instructions = HashMap::new();
        for instruction in decoder.iter() {
            assert!(!instruction.is_invalid(), "undecodable bytes at {}", instruction.ip());
            instructions.insert(instruction.ip(), instruction);
        }

        let mut pc = 0u64;
        self.steps = 0;
        loop {
            self.steps += 1;
            assert!(self.steps < STEP_LIMIT, "step limit exceeded");
            let ins = *instructions
                .get(&pc)
                .unwrap_or_else(|| panic!("no instruction at {pc:#x}"));
            match self.exec(&ins) {
                Control::Next => pc = ins.next_ip(),
                Control::Jump(target) => pc = target,
                Control::Return => return,
            }
        }
    }

    fn place(&self, ins: &Instruction, i: u32) -> Place {
        match ins.op_kind(i) {
            OpKind::Register => {
                let reg = ins.op_register(i);
                if reg.is_gpr() {
                    Place::Gp {
                        index: reg.full_register().number(),
                        size: reg.size(),
                    }
                } else if reg.is_xmm() || reg.is_ymm() {
                    Place::Vec {
                        index: reg.number(),
                        size: reg.size(),
                    }
                } else {
                    panic!("unsupported register {reg:?}");
                }
            }
            OpKind::Memory => Place::Mem {
                addr: self.address(ins),
                size: ins.memory_size().size(),
            },
            OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Place::Imm(ins.immediate(i)),
            kind => panic!("unsupported operand kind {kind:?}"),
        }
    }

    fn address(&self, ins: &Instruction) -> u64 {
        let reg_value = |reg: Register| {
            if reg == Register::None {
                0
            } else {
                self.gp[reg.full_register().number()]
            }
        };
        reg_value(ins.memory_base())
            .wrapping_add(reg_value(ins.memory_index()).wrapping_mul(ins.memory_index_scale() as u64))
            .wrapping_add(ins.memory_displacement64())
    }

    fn read(&self, place: Place) -> u64 {
        match place {
            Place::Gp { index, size } => self.gp[index] & mask(size),
            Place::Vec { index, size } => le(&self.vec[index][..size.min(8)]),
            Place::Mem { addr, size } => self.memory.read_u64(addr, size.min(8)),
            Place::Imm(value) => value,
        }
    }

    fn write(&mut self, place: Place, value: u64) {
        match place {
            Place::Gp { index, size: 8 } => self.gp[index] = value,
            // 32-bit writes zero the upper half.
            Place::Gp { index, size: 4 } => self.gp[index] = value & mask(4),
            Place::Gp { index, size } => {
                self.gp[index] = (self.gp[index] & !mask(size)) | (value & mask(size))
            }
            Place::Mem { addr, size } => {
                self.memory.write(addr, &value.to_le_bytes()[..size.min(8)])
            }
            other => panic!("cannot write an integer to {other:?}"),
        }
    }

    fn read_bytes(&self, place: Place, len: usize) -> Vec<u8> {
        match place {
            Place::Vec { index, .. } => self.vec[index][..len].to_vec(),
            Place::Mem { addr, .. } => self.memory.read(addr, len),
            other => panic!("cannot read vector bytes from {other:?}"),
        }
    }

    /// Store `bytes`; `zero_upper` clears the rest of a vector register.
    fn write_bytes(&mut self, place: Place, bytes: &[u8], zero_upper: bool) {
        match place {
            Place::Vec { index, .. } => {
                if zero_upper {
                    self.vec[index] = [0; 32];
                }
                self.vec[index][..bytes.len()].copy_from_slice(bytes);
            }
            Place::Mem { addr, .. } => self.memory.write(addr, bytes),
            other => panic!("cannot write vector bytes to {other:?}"),
        }
    }

    fn set_result_flags(&mut self, result: u64, size: usize) {
        self.flags.zf = result & mask(size) == 0;
        self.flags.sf = result & sign_bit(size) != 0;
    }

    fn push(&mut self, value: u64) {
        self.gp[RSP] -= 8;
        self.memory.write(self.gp[RSP], &value.to_le_bytes());
    }

    fn pop(&mut self) -> u64 {
        let value = self.memory.read_u64(self.gp[RSP], 8);
        self.gp[RSP] += 8;
        value
    }

    fn condition(&self, mnemonic: Mnemonic) -> bool {
        let f = self.flags;
        match mnemonic {
            Mnemonic::Je => f.zf,
            Mnemonic::Jne => !f.zf,
            Mnemonic::Jl => f.sf != f.of,
            Mnemonic::Jle => f.zf || f.sf != f.of,
            Mnemonic::Jg => !f.zf && f.sf == f.of,
            Mnemonic::Jge => f.sf == f.of,
            Mnemonic::Jb => f.cf,
            Mnemonic::Jbe => f.cf || f.zf,
            Mnemonic::Ja => !f.cf && !f.zf,
            Mnemonic::Jae => !f.cf,
            other => panic!("not a conditional jump: {other:?}"),
        }
    }

    fn exec(&mut self, ins: &Instruction) -> Control {
        let mnemonic = ins.mnemonic();
        match mnemonic {
            Mnemonic::Ret => {
                let target = self.pop();
                return if target == RETURN_SENTINEL {
                    Control::Return
                } else {
                    Control::Jump(target)
                };
            }
            Mnemonic::Jmp => return Control::Jump(ins.near_branch_target()),
            Mnemonic::Je
            | Mnemonic::Jne
            | Mnemonic::Jl
            | Mnemonic::Jle
            | Mnemonic::Jg
            | Mnemonic::Jge
            | Mnemonic::Jb
            | Mnemonic::Jbe
            | Mnemonic::Ja
            | Mnemonic::Jae => {
                return if self.condition(mnemonic) {
                    Control::Jump(ins.near_branch_target())
                } else {
                    Control::Next
                };
            }
            Mnemonic::Vzeroupper => {
                for reg in self.vec.iter_mut() {
                    reg[16..].fill(0);
                }
                return Control::Next;
            }
            Mnemonic::Push => {
                let value = self.read(self.place(ins, 0));
                self.push(value);
                return Control::Next;
            }
            Mnemonic::Pop => {
                let value = self.pop();
                let dst = self.place(ins, 0);
                self.write(dst, value);
                return Control::Next;
            }
            _ => {}
        }

        let dst = self.place(ins, 0);
        let size = dst.size();
        match mnemonic {
            Mnemonic::Mov => {
                let value = self.read(self.place(ins, 1));
                self.write(dst, value & mask(size));
            }
            Mnemonic::Movzx => {
                let value = self.read(self.place(ins, 1));
                self.write(dst, value);
            }
            Mnemonic::Movsx | Mnemonic::Movsxd => {
                let src = self.place(ins, 1);
                let value = sign_extend(self.read(src), src.size());
                self.write(dst, value & mask(size));
            }
            Mnemonic::Lea => {
                let addr = self.address(ins);
                self.write(dst, addr & mask(size));
            }
            Mnemonic::Add | Mnemonic::Sub | Mnemonic::Cmp => {
                let a = self.read(dst);
                let b = self.read(self.place(ins, 1)) & mask(size);
                let (r, carry, overflow) = if mnemonic == Mnemonic::Add {
                    let r = a.wrapping_add(b) & mask(size);
                    (r, r < a, (!(a ^ b) & (a ^ r)) & sign_bit(size) != 0)
                } else {
                    let r = a.wrapping_sub(b) & mask(size);
                    (r, a < b, ((a ^ b) & (a ^ r)) & sign_bit(size) != 0)
                };
                self.flags.cf = carry;
                self.flags.of = overflow;
                self.set_result_flags(r, size);
                if mnemonic != Mnemonic::Cmp {
                    self.write(dst, r);
                }
            }
            Mnemonic::And | Mnemonic::Or | Mnemonic::Xor | Mnemonic::Test => {
                let a = self.read(dst);
                let b = self.read(self.place(ins, 1)) & mask(size);
                let r = match mnemonic {
                    Mnemonic::Or => a | b,
                    Mnemonic::Xor => a ^ b,
                    _ => a & b,
                };
                self.flags.cf = false;
                self.flags.of = false;
                self.set_result_flags(r, size);
                if mnemonic != Mnemonic::Test {
                    self.write(dst, r);
                }
            }
            Mnemonic::Inc | Mnemonic::Dec => {
                let a = self.read(dst);
                let r = if mnemonic == Mnemonic::Inc {
                    a.wrapping_add(1)
                } else {
                    a.wrapping_sub(1)
                } & mask(size);
                self.flags.of = if mnemonic == Mnemonic::Inc {
                    r == sign_bit(size)
                } else {
                    a == sign_bit(size)
                };
                self.set_result_flags(r, size);
                self.write(dst, r);
            }
            Mnemonic::Neg => {
                let a = self.read(dst);
                let r = a.wrapping_neg() & mask(size);
                self.flags.cf = a != 0;
                self.flags.of = a == sign_bit(size);
                self.set_result_flags(r, size);
                self.write(dst, r);
            }
            Mnemonic::Not => {
                let a = self.read(dst);
                self.write(dst, !a & mask(size));
            }
            Mnemonic::Imul => {
                let (a, b) = if ins.op_count() == 3 {
                    (self.read(self.place(ins, 1)), self.read(self.place(ins, 2)))
                } else {
                    (self.read(dst), self.read(self.place(ins, 1)))
                };
                let r = sign_extend(a & mask(size), size)
                    .wrapping_mul(sign_extend(b & mask(size), size));
                self.write(dst, r & mask(size));
            }
            Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar => {
                let limit = if size == 8 { 63 } else { 31 };
                let count = (self.read(self.place(ins, 1)) & limit) as u32;
                if count > 0 {
                    let a = self.read(dst);
                    let (r, carry) = match mnemonic {
                        Mnemonic::Shl => (
                            a.checked_shl(count).unwrap_or(0),
                            a.checked_shr((size as u32 * 8).wrapping_sub(count)).unwrap_or(0) & 1
                                != 0,
                        ),
                        Mnemonic::Shr => (a >> count, (a >> (count - 1)) & 1 != 0),
                        _ => {
                            let s = sign_extend(a, size) as i64;
                            ((s >> count) as u64, (s >> (count - 1)) & 1 != 0)
                        }
                    };
                    let r = r & mask(size);
                    self.flags.cf = carry;
                    self.set_result_flags(r, size);
                    self.write(dst, r);
                }
            }
            Mnemonic::Movss | Mnemonic::Movsd => {
                let width = if mnemonic == Mnemonic::Movss { 4 } else { 8 };
                let src = self.place(ins, 1);
                let bytes = self.read_bytes(src, width);
                match (dst, src) {
                    (Place::Vec { index, .. }, Place::Mem { .. }) => {
                        self.vec[index][..16].fill(0);
                        self.vec[index][..width].copy_from_slice(&bytes);
                    }
                    _ => self.write_bytes(dst, &bytes, false),
                }
            }
            Mnemonic::Movaps | Mnemonic::Movdqu | Mnemonic::Movups => {
                let bytes = self.read_bytes(self.place(ins, 1), 16);
                self.write_bytes(dst, &bytes, false);
            }
            Mnemonic::Vmovdqu => {
                let src = self.place(ins, 1);
                let width = src.size().max(size);
                let bytes = self.read_bytes(src, width);
                self.write_bytes(dst, &bytes, true);
            }
            Mnemonic::Paddd | Mnemonic::Paddq | Mnemonic::Pxor => {
                let a = self.read_bytes(dst, 16);
                let b = self.read_bytes(self.place(ins, 1), 16);
                let r = lanes(mnemonic, &a, &b);
                self.write_bytes(dst, &r, false);
            }
            Mnemonic::Vpaddd | Mnemonic::Vpaddq | Mnemonic::Vpxor => {
                let a = self.read_bytes(self.place(ins, 1), size);
                let b = self.read_bytes(self.place(ins, 2), size);
                let r = lanes(mnemonic, &a, &b);
                self.write_bytes(dst, &r, true);
            }
            Mnemonic::Addss | Mnemonic::Subss | Mnemonic::Mulss => {
                let a = f32::from_le_bytes(self.read_bytes(dst, 4).try_into().unwrap());
                let b = f32::from_le_bytes(self.read_bytes(self.place(ins, 1), 4).try_into().unwrap());
                let r = match mnemonic {
                    Mnemonic::Addss => a + b,
                    Mnemonic::Subss => a - b,
                    _ => a * b,
                };
                self.write_bytes(dst, &r.to_le_bytes(), false);
            }
            Mnemonic::Addsd | Mnemonic::Subsd | Mnemonic::Mulsd => {
                let a = f64::from_le_bytes(self.read_bytes(dst, 8).try_into().unwrap());
                let b = f64::from_le_bytes(self.read_bytes(self.place(ins, 1), 8).try_into().unwrap());
                let r = match mnemonic {
                    Mnemonic::Addsd => a + b,
                    Mnemonic::Subsd => a - b,
                    _ => a * b,
                };
                self.write_bytes(dst, &r.to_le_bytes(), false);
            }
            other => panic!("interpreter does not support {other:?}"),
        }
        Control::Next
    }
}

fn lanes(mnemonic: Mnemonic, a: &[u8], b: &[u8]) -> Vec<u8> {
    match mnemonic {
        Mnemonic::Paddd | Mnemonic::Vpaddd => a
            .chunks(4)
            .zip(b.chunks(4))
            .flat_map(|(x, y)| {
                let x = u32::from_le_bytes(x.try_into().unwrap());
                let y = u32::from_le_bytes(y.try_into().unwrap());
                x.wrapping_add(y).to_le_bytes()
            })
            .collect(),
        Mnemonic::Paddq | Mnemonic::Vpaddq => a
            .chunks(8)
            .zip(b.chunks(8))
            .flat_map(|(x, y)| {
                let x = u64::from_le_bytes(x.try_into().unwrap());
                let y = u64::from_le_bytes(y.try_into().unwrap());
                x.wrapping_add(y).to_le_bytes()
            })
            .collect(),
        _ => a.iter().zip(b).map(|(x, y)| x ^ y).collect(),
    }
}

/// Call `encoded` on a fresh machine.
pub fn call(encoded: &EncodedFunction, args: &[Value]) -> Option<Value> {
    Machine::new().call(encoded, args)
}

/// Scenario 1: `add(f1: u64, f2: u16) -> u64`.
pub fn add_function() -> Function {
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

/// Scenario 2: sum of a u16 field at +2 and a u64 field at +8 of a struct.
pub fn struct_sum_function() -> Function {
    let p = Argument::new("p", ArgType::ptr());
    let mut b = begin_function("field_sum", vec![p.clone()], Some(ArgType::U64));
    let base = b.issue_register(WidthClass::Gp64);
    let acc = b.issue_register(WidthClass::Gp64);
    b.load_argument(&p, base).unwrap();
    b.emit(
        Opcode::Movzx,
        vec![acc.into(), MemoryOperand::base_disp(base, 2).sized(WidthClass::Gp16).into()],
    )
    .unwrap();
    b.emit(Opcode::Add, vec![acc.into(), MemoryOperand::base_disp(base, 8).into()])
        .unwrap();
    b.ret(Some(acc.into())).unwrap();
    b.end_function().unwrap()
}

/// Struct for scenario 2: u16 at +2, u64 at +8.
pub fn struct_bytes(small: u16, large: u64) -> Vec<u8> {
    let mut bytes = vec![0xee; 16];
    bytes[2..4].copy_from_slice(&small.to_le_bytes());
    bytes[8..16].copy_from_slice(&large.to_le_bytes());
    bytes
}

/// Scenario 3: sum of a u64 slice given as (ptr, len, cap).
pub fn slice_sum_function() -> Function {
    let ptr = Argument::new("ptr", ArgType::ptr_to(ArgType::U64));
    let len = Argument::new("len", ArgType::USIZE);
    let cap = Argument::new("cap", ArgType::USIZE);
    let mut b = begin_function("sum", vec![ptr.clone(), len.clone(), cap], Some(ArgType::U64));
    let p = b.issue_register(WidthClass::Gp64);
    let n = b.issue_register(WidthClass::Gp64);
    let acc = b.issue_register(WidthClass::Gp64);
    b.load_argument(&ptr, p).unwrap();
    b.load_argument(&len, n).unwrap();
    b.emit(Opcode::Xor, vec![acc.into(), acc.into()]).unwrap();
    let handle = b.begin_loop();
    b.emit(Opcode::Add, vec![acc.into(), MemoryOperand::base(p).into()])
        .unwrap();
    b.emit(Opcode::Add, vec![p.into(), 8i64.into()]).unwrap();
    b.end_loop(handle, LoopCondition::CountDown(n)).unwrap();
    b.ret(Some(acc.into())).unwrap();
    b.end_function().unwrap()
}

/// Scenario 5: `rows * cols` via two nested countdown loops.
pub fn nested_loops_function() -> Function {
    let rows = Argument::new("rows", ArgType::U64);
    let cols = Argument::new("cols", ArgType::U64);
    let mut b = begin_function("grid", vec![rows.clone(), cols.clone()], Some(ArgType::U64));
    let r = b.issue_register(WidthClass::Gp64);
    let c = b.issue_register(WidthClass::Gp64);
    let inner = b.issue_register(WidthClass::Gp64);
    let acc = b.issue_register(WidthClass::Gp64);
    b.load_argument(&rows, r).unwrap();
    b.load_argument(&cols, c).unwrap();
    b.emit(Opcode::Xor, vec![acc.into(), acc.into()]).unwrap();
    let outer = b.begin_loop();
    b.emit(Opcode::Mov, vec![inner.into(), c.into()]).unwrap();
    let handle = b.begin_loop();
    b.emit(Opcode::Inc, vec![acc.into()]).unwrap();
    b.end_loop(handle, LoopCondition::CountDown(inner)).unwrap();
    b.end_loop(outer, LoopCondition::CountDown(r)).unwrap();
    b.ret(Some(acc.into())).unwrap();
    b.end_function().unwrap()
}

/// u64 values laid out little-endian.
pub fn u64_bytes(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
