// This module implements the calling-convention table for x86-64: Go ABI0 (every argument and
// the result on the caller's stack), System V AMD64 (integer arguments in RDI, RSI, RDX, RCX,
// R8, R9, float/vector arguments in XMM0-XMM7, YMM for 256-bit vectors, the rest on the stack)
// and Microsoft x64 (four positional register slots in RCX, RDX, R8, R9 or XMM0-XMM3, later
// arguments above the 32-byte shadow space). Each convention is a CCAssigner that places one
// argument or return value at a time, plus a CCInfo describing which registers the allocator
// may hand out, in which preference order, and which of them are callee-saved. FunctionFrame
// is the frame rule: after allocation it records the callee-saved registers that must be
// pushed (or, for vector registers under Microsoft x64, stored to a save area) and converts
// entry-relative stack offsets into offsets valid after the prologue. Adding a convention
// means adding an assigner and a CCInfo; the expander and encoder only talk to these types.

//! x86-64 calling conventions.
//!
//! Argument and return placement plus the frame rule for each supported ABI.

use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::{AsmReg, RegBitSet};
use crate::core::types::{ArgType, Argument, RegBank, WidthClass};
use crate::x64::registers::register_name;
use bumpalo::{collections::Vec as BumpVec, Bump};
use std::fmt;

/// Supported calling conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    /// Go ABI0: stack-passed arguments and results.
    GoAmd64,
    /// System V AMD64.
    SystemV,
    /// Microsoft x64.
    Microsoft,
}

impl CallingConvention {
    pub const ALL: [CallingConvention; 3] = [
        CallingConvention::GoAmd64,
        CallingConvention::SystemV,
        CallingConvention::Microsoft,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CallingConvention::GoAmd64 => "go",
            CallingConvention::SystemV => "sysv",
            CallingConvention::Microsoft => "ms",
        }
    }

    /// Whether this is a C calling convention.
    pub fn is_c(self) -> bool {
        !matches!(self, CallingConvention::GoAmd64)
    }

    /// Fresh argument assigner for this convention.
    pub fn assigner(self) -> Box<dyn CCAssigner> {
        match self {
            CallingConvention::GoAmd64 => Box::new(GoAssigner::new()),
            CallingConvention::SystemV => Box::new(SysVAssigner::new()),
            CallingConvention::Microsoft => Box::new(MsAssigner::new()),
        }
    }

    /// Register information for this convention.
    pub fn info(self) -> CCInfo {
        match self {
            CallingConvention::GoAmd64 => CCInfo::new(&GO_GP_ORDER, &VEC_ORDER, &[], 8),
            CallingConvention::SystemV => {
                CCInfo::new(&SYSV_GP_ORDER, &VEC_ORDER, &SYSV_CALLEE_SAVED, 16)
            }
            CallingConvention::Microsoft => {
                CCInfo::new(&MS_GP_ORDER, &VEC_ORDER, &MS_CALLEE_SAVED, 16)
            }
        }
    }
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where an argument or return value lives at function entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Register { reg: AsmReg, class: WidthClass },
    /// Offset from the first argument slot, i.e. from the entry stack pointer plus 8.
    Stack { offset: u32, size: u32 },
}

impl Location {
    pub fn register(&self) -> Option<AsmReg> {
        match self {
            Location::Register { reg, .. } => Some(*reg),
            Location::Stack { .. } => None,
        }
    }

    /// Displacement from the entry stack pointer.
    pub fn entry_offset(&self) -> Option<i64> {
        match self {
            Location::Register { .. } => None,
            Location::Stack { offset, .. } => Some(8 + i64::from(*offset)),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Register { reg, class } => f.write_str(&register_name(*reg, *class)),
            Location::Stack { offset, .. } => write!(f, "[rsp+{}]", 8 + offset),
        }
    }
}

/// Argument assignment filled in by a [`CCAssigner`].
#[derive(Debug, Clone, Copy)]
pub struct CCAssignment {
    /// Register bank this value belongs to.
    pub bank: RegBank,
    /// Size of the value in bytes.
    pub size: u32,
    /// Required alignment in bytes.
    pub align: u32,
    /// Register view the value arrives in.
    pub class: WidthClass,
    /// Whether the value is a SIMD vector.
    pub vector: bool,
    /// Assigned register (if any).
    pub reg: Option<AsmReg>,
    /// Stack offset (if assigned to stack).
    pub stack_off: Option<u32>,
}

impl CCAssignment {
    /// Create a new assignment for a value of type `ty`.
    pub fn new(ty: &ArgType) -> Self {
        Self {
            bank: ty.bank(),
            size: ty.size(),
            align: ty.align(),
            class: ty.natural_class(),
            vector: ty.is_vector(),
            reg: None,
            stack_off: None,
        }
    }

    /// Resolved location, if the assigner placed the value.
    pub fn location(&self) -> Option<Location> {
        match (self.reg, self.stack_off) {
            (Some(reg), _) => Some(Location::Register {
                reg,
                class: self.class,
            }),
            (None, Some(offset)) => Some(Location::Stack {
                offset,
                size: self.size,
            }),
            (None, None) => None,
        }
    }
}

/// Register information for a calling convention.
#[derive(Debug, Clone)]
pub struct CCInfo {
    /// Registers available for allocation.
    pub allocatable_regs: RegBitSet,
    /// Registers that must be preserved by callee.
    pub callee_saved_regs: RegBitSet,
    /// General-purpose allocation order, scratch registers first.
    pub gp_order: &'static [AsmReg],
    /// Vector allocation order, scratch registers first.
    pub vec_order: &'static [AsmReg],
    /// Stack alignment at call boundaries.
    pub stack_alignment: u32,
}

impl CCInfo {
    fn new(
        gp_order: &'static [AsmReg],
        vec_order: &'static [AsmReg],
        callee_saved: &[AsmReg],
        stack_alignment: u32,
    ) -> Self {
        let mut allocatable = RegBitSet::from_regs(gp_order);
        allocatable.union(&RegBitSet::from_regs(vec_order));
        Self {
            allocatable_regs: allocatable,
            callee_saved_regs: RegBitSet::from_regs(callee_saved),
            gp_order,
            vec_order,
            stack_alignment,
        }
    }

    /// Allocation order for `bank`.
    pub fn order(&self, bank: RegBank) -> &'static [AsmReg] {
        match bank {
            RegBank::GeneralPurpose => self.gp_order,
            RegBank::Vector => self.vec_order,
        }
    }

    /// Number of allocatable registers in `bank`.
    pub fn capacity(&self, bank: RegBank) -> u32 {
        self.allocatable_regs.count_in_bank(bank)
    }
}

static GO_GP_ORDER: [AsmReg; 14] = [
    AsmReg::gp(0),  // RAX
    AsmReg::gp(1),  // RCX
    AsmReg::gp(2),  // RDX
    AsmReg::gp(3),  // RBX
    AsmReg::gp(6),  // RSI
    AsmReg::gp(7),  // RDI
    AsmReg::gp(8),  // R8
    AsmReg::gp(9),  // R9
    AsmReg::gp(10), // R10
    AsmReg::gp(11), // R11
    AsmReg::gp(12), // R12
    AsmReg::gp(13), // R13
    AsmReg::gp(14), // R14
    AsmReg::gp(15), // R15
];

static SYSV_GP_ORDER: [AsmReg; 15] = [
    AsmReg::gp(0),  // RAX
    AsmReg::gp(1),  // RCX
    AsmReg::gp(2),  // RDX
    AsmReg::gp(6),  // RSI
    AsmReg::gp(7),  // RDI
    AsmReg::gp(8),  // R8
    AsmReg::gp(9),  // R9
    AsmReg::gp(10), // R10
    AsmReg::gp(11), // R11
    AsmReg::gp(3),  // RBX
    AsmReg::gp(12), // R12
    AsmReg::gp(13), // R13
    AsmReg::gp(14), // R14
    AsmReg::gp(15), // R15
    AsmReg::gp(5),  // RBP
];

static MS_GP_ORDER: [AsmReg; 15] = [
    AsmReg::gp(0),  // RAX
    AsmReg::gp(1),  // RCX
    AsmReg::gp(2),  // RDX
    AsmReg::gp(8),  // R8
    AsmReg::gp(9),  // R9
    AsmReg::gp(10), // R10
    AsmReg::gp(11), // R11
    AsmReg::gp(3),  // RBX
    AsmReg::gp(6),  // RSI
    AsmReg::gp(7),  // RDI
    AsmReg::gp(12), // R12
    AsmReg::gp(13), // R13
    AsmReg::gp(14), // R14
    AsmReg::gp(15), // R15
    AsmReg::gp(5),  // RBP
];

static VEC_ORDER: [AsmReg; 16] = [
    AsmReg::vec(0),
    AsmReg::vec(1),
    AsmReg::vec(2),
    AsmReg::vec(3),
    AsmReg::vec(4),
    AsmReg::vec(5),
    AsmReg::vec(6),
    AsmReg::vec(7),
    AsmReg::vec(8),
    AsmReg::vec(9),
    AsmReg::vec(10),
    AsmReg::vec(11),
    AsmReg::vec(12),
    AsmReg::vec(13),
    AsmReg::vec(14),
    AsmReg::vec(15),
];

const SYSV_CALLEE_SAVED: [AsmReg; 6] = [
    AsmReg::gp(3),  // RBX
    AsmReg::gp(5),  // RBP
    AsmReg::gp(12), // R12
    AsmReg::gp(13), // R13
    AsmReg::gp(14), // R14
    AsmReg::gp(15), // R15
];

const MS_CALLEE_SAVED: [AsmReg; 18] = [
    AsmReg::gp(3),  // RBX
    AsmReg::gp(5),  // RBP
    AsmReg::gp(6),  // RSI
    AsmReg::gp(7),  // RDI
    AsmReg::gp(12), // R12
    AsmReg::gp(13), // R13
    AsmReg::gp(14), // R14
    AsmReg::gp(15), // R15
    AsmReg::vec(6),
    AsmReg::vec(7),
    AsmReg::vec(8),
    AsmReg::vec(9),
    AsmReg::vec(10),
    AsmReg::vec(11),
    AsmReg::vec(12),
    AsmReg::vec(13),
    AsmReg::vec(14),
    AsmReg::vec(15),
];

/// Trait for calling convention argument assignment.
pub trait CCAssigner {
    /// Assign an argument. Leaves both `reg` and `stack_off` empty when the
    /// convention has no rule for the value.
    fn assign_arg(&mut self, arg: &mut CCAssignment);

    /// Assign a return value, after all arguments were assigned.
    fn assign_ret(&mut self, ret: &mut CCAssignment);

    /// Reset state for a new function.
    fn reset(&mut self);

    /// Bytes of caller stack used by arguments (and results, for stack conventions).
    fn stack_size(&self) -> u32;
}

/// Align a value up to the specified power-of-two alignment.
fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Go ABI0 assigner.
///
/// Every argument is laid out on the caller's stack at its natural alignment;
/// the result follows at the next 8-byte boundary.
#[derive(Debug, Default)]
pub struct GoAssigner {
    stack: u32,
}

impl GoAssigner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CCAssigner for GoAssigner {
    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        if arg.vector {
            return;
        }
        self.stack = align_up(self.stack, arg.align.max(1));
        arg.stack_off = Some(self.stack);
        self.stack += arg.size;
    }

    fn assign_ret(&mut self, ret: &mut CCAssignment) {
        if ret.vector {
            return;
        }
        self.stack = align_up(self.stack, 8);
        ret.stack_off = Some(self.stack);
        self.stack += ret.size;
    }

    fn reset(&mut self) {
        self.stack = 0;
    }

    fn stack_size(&self) -> u32 {
        align_up(self.stack, 8)
    }
}

/// System V x86-64 calling convention assigner.
///
/// - First 6 integer args in RDI, RSI, RDX, RCX, R8, R9
/// - First 8 floating-point or vector args in XMM0-XMM7 (YMM for 256-bit)
/// - Remaining args on stack
/// - Return values in RAX, XMM0 or YMM0
#[derive(Debug, Default)]
pub struct SysVAssigner {
    gp_cnt: usize,
    xmm_cnt: usize,
    stack: u32,
}

impl SysVAssigner {
    /// System V x86-64 GP argument registers.
    const GP_ARG_REGS: [AsmReg; 6] = [
        AsmReg::gp(7), // RDI
        AsmReg::gp(6), // RSI
        AsmReg::gp(2), // RDX
        AsmReg::gp(1), // RCX
        AsmReg::gp(8), // R8
        AsmReg::gp(9), // R9
    ];

    const XMM_ARG_COUNT: usize = 8;

    pub fn new() -> Self {
        Self::default()
    }
}

impl CCAssigner for SysVAssigner {
    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        match arg.bank {
            RegBank::GeneralPurpose if self.gp_cnt < Self::GP_ARG_REGS.len() => {
                arg.reg = Some(Self::GP_ARG_REGS[self.gp_cnt]);
                self.gp_cnt += 1;
            }
            RegBank::Vector if self.xmm_cnt < Self::XMM_ARG_COUNT => {
                arg.reg = Some(AsmReg::vec(self.xmm_cnt as u8));
                self.xmm_cnt += 1;
            }
            _ => {
                let slot = align_up(arg.size, 8);
                self.stack = align_up(self.stack, arg.align.max(8));
                arg.stack_off = Some(self.stack);
                self.stack += slot;
            }
        }
    }

    fn assign_ret(&mut self, ret: &mut CCAssignment) {
        ret.reg = Some(match ret.bank {
            RegBank::GeneralPurpose => AsmReg::RAX,
            RegBank::Vector => AsmReg::XMM0,
        });
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn stack_size(&self) -> u32 {
        align_up(self.stack, 16)
    }
}

/// Microsoft x64 calling convention assigner.
///
/// Arguments take positional slots: the first four in RCX, RDX, R8, R9 or
/// XMM0-XMM3, the rest in 8-byte slots above the 32-byte shadow space.
/// Vectors are passed by hidden reference and have no direct placement.
#[derive(Debug, Default)]
pub struct MsAssigner {
    position: u32,
}

impl MsAssigner {
    const GP_ARG_REGS: [AsmReg; 4] = [
        AsmReg::gp(1), // RCX
        AsmReg::gp(2), // RDX
        AsmReg::gp(8), // R8
        AsmReg::gp(9), // R9
    ];

    pub fn new() -> Self {
        Self::default()
    }
}

impl CCAssigner for MsAssigner {
    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        if arg.vector {
            self.position += 1;
            return;
        }
        let position = self.position;
        self.position += 1;
        match (arg.bank, Self::GP_ARG_REGS.get(position as usize)) {
            (RegBank::GeneralPurpose, Some(&reg)) => arg.reg = Some(reg),
            (RegBank::Vector, Some(_)) => arg.reg = Some(AsmReg::vec(position as u8)),
            // Slots 0..4 are the shadow space.
            (_, None) => arg.stack_off = Some(position * 8),
        }
    }

    fn assign_ret(&mut self, ret: &mut CCAssignment) {
        match ret.bank {
            RegBank::GeneralPurpose => ret.reg = Some(AsmReg::RAX),
            RegBank::Vector if ret.class == WidthClass::Xmm => ret.reg = Some(AsmReg::XMM0),
            RegBank::Vector => {}
        }
    }

    fn reset(&mut self) {
        self.position = 0;
    }

    fn stack_size(&self) -> u32 {
        align_up(self.position.max(4) * 8, 16)
    }
}

/// Resolved placement of a whole signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub arguments: Vec<Location>,
    pub ret: Option<Location>,
    /// Bytes of caller stack the signature occupies.
    pub stack_size: u32,
}

fn placement_error(
    function: &str,
    subject: &str,
    ty: &ArgType,
    convention: CallingConvention,
) -> CompileError {
    CompileError::Placement {
        function: function.to_string(),
        subject: subject.to_string(),
        ty: ty.to_string(),
        convention: convention.name(),
    }
}

/// Place an ordered argument list under `convention`.
pub fn place_arguments(
    convention: CallingConvention,
    function: &str,
    arguments: &[Argument],
) -> CompileResult<Vec<Location>> {
    let mut assigner = convention.assigner();
    assign_arguments(assigner.as_mut(), convention, function, arguments)
}

fn assign_arguments(
    assigner: &mut dyn CCAssigner,
    convention: CallingConvention,
    function: &str,
    arguments: &[Argument],
) -> CompileResult<Vec<Location>> {
    arguments
        .iter()
        .map(|arg| {
            let mut assignment = CCAssignment::new(arg.ty());
            assigner.assign_arg(&mut assignment);
            assignment
                .location()
                .ok_or_else(|| placement_error(function, arg.name(), arg.ty(), convention))
        })
        .collect()
}

/// Place the return value. Stack conventions put the result after the
/// arguments, so the argument list is needed as well.
pub fn place_return(
    convention: CallingConvention,
    function: &str,
    arguments: &[Argument],
    return_type: Option<&ArgType>,
) -> CompileResult<Option<Location>> {
    Ok(place(convention, function, arguments, return_type)?.ret)
}

/// Place arguments and return value together.
pub fn place(
    convention: CallingConvention,
    function: &str,
    arguments: &[Argument],
    return_type: Option<&ArgType>,
) -> CompileResult<Placement> {
    let mut assigner = convention.assigner();
    assigner.reset();
    let locations = assign_arguments(assigner.as_mut(), convention, function, arguments)?;
    let ret = match return_type {
        Some(ty) => {
            let mut assignment = CCAssignment::new(ty);
            assigner.assign_ret(&mut assignment);
            Some(
                assignment
                    .location()
                    .ok_or_else(|| placement_error(function, "return value", ty, convention))?,
            )
        }
        None => None,
    };
    let placement = Placement {
        arguments: locations,
        ret,
        stack_size: assigner.stack_size(),
    };
    log::debug!(
        "{function}: placed {} arguments under {convention}: {}",
        arguments.len(),
        placement
            .arguments
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(placement)
}

/// Function stack frame: callee-saved registers and their save area.
#[derive(Debug)]
pub struct FunctionFrame<'a> {
    /// General-purpose callee-saved registers, in push order.
    pub saved_registers: BumpVec<'a, AsmReg>,
    /// Vector callee-saved registers stored below the pushes.
    pub saved_vectors: BumpVec<'a, AsmReg>,
    /// Emit `vzeroupper` before returning.
    pub vzeroupper: bool,
}

impl<'a> FunctionFrame<'a> {
    /// Create a new function frame using the provided arena.
    pub fn new(arena: &'a Bump) -> Self {
        Self {
            saved_registers: BumpVec::new_in(arena),
            saved_vectors: BumpVec::new_in(arena),
            vzeroupper: false,
        }
    }

    /// Frame rule: preserve every callee-saved register that was allocated.
    pub fn build(
        arena: &'a Bump,
        info: &CCInfo,
        clobbered: &RegBitSet,
        convention: CallingConvention,
        uses_ymm: bool,
    ) -> Self {
        let mut frame = Self::new(arena);
        let mut saved = *clobbered;
        saved.intersect(&info.callee_saved_regs);
        for reg in saved.iter_bank(RegBank::GeneralPurpose) {
            frame.add_saved_register(reg);
        }
        frame.saved_vectors.extend(saved.iter_bank(RegBank::Vector));
        frame.vzeroupper = uses_ymm && convention.is_c();
        frame
    }

    /// Add a callee-saved register that needs preservation.
    pub fn add_saved_register(&mut self, reg: AsmReg) {
        if !self.saved_registers.contains(&reg) {
            self.saved_registers.push(reg);
        }
    }

    /// Bytes reserved below the pushes for vector saves.
    pub fn vector_area(&self) -> u32 {
        self.saved_vectors.len() as u32 * 16
    }

    /// Distance between the entry stack pointer and the body stack pointer.
    pub fn frame_size(&self) -> u32 {
        self.saved_registers.len() as u32 * 8 + self.vector_area()
    }

    /// Translate an entry-relative stack displacement to a body-relative one.
    pub fn body_offset(&self, entry_offset: i64) -> i64 {
        entry_offset + i64::from(self.frame_size())
    }

    /// Owned summary for the encoded function.
    pub fn summary(&self, info: &CCInfo, stack_size: u32) -> FrameSummary {
        FrameSummary {
            saved_registers: self.saved_registers.to_vec(),
            saved_vectors: self.saved_vectors.to_vec(),
            vector_area: self.vector_area(),
            vzeroupper: self.vzeroupper,
            stack_alignment: info.stack_alignment,
            argument_stack: stack_size,
        }
    }
}

/// Frame facts retained after encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSummary {
    pub saved_registers: Vec<AsmReg>,
    pub saved_vectors: Vec<AsmReg>,
    pub vector_area: u32,
    pub vzeroupper: bool,
    pub stack_alignment: u32,
    /// Caller stack bytes taken by arguments and stack results.
    pub argument_stack: u32,
}
