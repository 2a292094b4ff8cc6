// This module implements the function builder: the explicit, scoped construct through which
// a function body is accumulated. A FunctionBuilder is opened with a name, ordered typed
// arguments and an optional return type, owns the virtual register pool of the function,
// and records instructions, argument loads, returns and nested loops in build order. Every
// append is structurally validated on the spot (registers issued by this builder, opcode
// arity, no immediate destinations, 64-bit address registers, explicit memory widths where
// no register fixes them, argument and return width compatibility). end_function performs
// the whole-function checks (balanced loops, trailing return for non-void functions,
// distinct argument names) and yields an immutable Function. Nothing here knows about
// calling conventions or physical registers.

//! Function builder and the immutable function it produces.

use crate::core::error::{CompileError, CompileResult, StructuralIssue};
use crate::core::instruction::{
    Instruction, Item, ItemKind, Loop, LoopCondition, LoopLabel, Opcode, Operand,
};
use crate::core::types::{ArgType, Argument, RegBank, WidthClass};
use crate::core::vreg::{FunctionId, VRegPool, VirtualRegister};

/// Token for an open loop, returned by [`FunctionBuilder::begin_loop`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "an open loop must be closed with end_loop"]
pub struct LoopHandle {
    label: LoopLabel,
    depth: usize,
}

impl LoopHandle {
    pub fn label(&self) -> LoopLabel {
        self.label
    }
}

#[derive(Debug)]
struct OpenLoop {
    label: LoopLabel,
    index: usize,
    body: Vec<Item>,
}

/// Accumulates the body of one function.
#[derive(Debug)]
pub struct FunctionBuilder {
    name: String,
    arguments: Vec<Argument>,
    return_type: Option<ArgType>,
    pool: VRegPool,
    body: Vec<Item>,
    open_loops: Vec<OpenLoop>,
    next_index: usize,
}

/// Open a new function.
pub fn begin_function(
    name: impl Into<String>,
    arguments: Vec<Argument>,
    return_type: Option<ArgType>,
) -> FunctionBuilder {
    FunctionBuilder::new(name, arguments, return_type)
}

/// Close a function, performing whole-function validation.
pub fn end_function(builder: FunctionBuilder) -> CompileResult<Function> {
    builder.end_function()
}

impl FunctionBuilder {
    pub fn new(
        name: impl Into<String>,
        arguments: Vec<Argument>,
        return_type: Option<ArgType>,
    ) -> Self {
        Self {
            name: name.into(),
            arguments,
            return_type,
            pool: VRegPool::new(FunctionId::fresh()),
            body: Vec::new(),
            open_loops: Vec::new(),
            next_index: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    /// Look up a declared argument by name.
    pub fn argument(&self, name: &str) -> Option<&Argument> {
        self.arguments.iter().find(|arg| arg.name() == name)
    }

    pub fn return_type(&self) -> Option<&ArgType> {
        self.return_type.as_ref()
    }

    pub fn issue_register(&mut self, class: WidthClass) -> VirtualRegister {
        self.pool.issue(class)
    }

    /// Append a concrete instruction.
    pub fn emit(&mut self, opcode: Opcode, operands: Vec<Operand>) -> CompileResult<()> {
        let index = self.next_index;
        self.validate_operands(opcode, &operands, index)?;
        self.push(ItemKind::Instruction(Instruction { opcode, operands }));
        Ok(())
    }

    /// Append a load of `argument` into `destination`.
    pub fn load_argument(
        &mut self,
        argument: &Argument,
        destination: VirtualRegister,
    ) -> CompileResult<()> {
        let index = self.next_index;
        self.check_register(destination, index, 0)?;
        if !argument.ty().fits_in(destination.class()) {
            return Err(self.structural(
                Some(index),
                Some(0),
                StructuralIssue::ArgumentWidth {
                    argument: argument.name().to_string(),
                    class: destination.class(),
                },
            ));
        }
        self.push(ItemKind::LoadArgument {
            argument: argument.clone(),
            destination,
        });
        Ok(())
    }

    /// Append a return, with a value for non-void functions.
    pub fn ret(&mut self, value: Option<Operand>) -> CompileResult<()> {
        let index = self.next_index;
        let reason = match (&self.return_type, &value) {
            (None, None) => None,
            (None, Some(_)) => Some("function has no return type".to_string()),
            (Some(ty), None) => Some(format!("missing {ty} return value")),
            (Some(ty), Some(Operand::Register(reg))) => {
                self.check_register(*reg, index, 0)?;
                (!ty.fits_in(reg.class()))
                    .then(|| format!("{} register cannot return {ty}", reg.class()))
            }
            (Some(ty), Some(Operand::Immediate(_))) => (ty.bank() != RegBank::GeneralPurpose)
                .then(|| format!("immediate cannot return {ty}")),
            (Some(_), Some(Operand::Memory(_))) => {
                Some("memory operands cannot be returned directly".to_string())
            }
        };
        if let Some(reason) = reason {
            return Err(self.structural(Some(index), None, StructuralIssue::ReturnValue { reason }));
        }
        self.push(ItemKind::Return(value));
        Ok(())
    }

    /// Open a loop. Its label id is drawn here.
    pub fn begin_loop(&mut self) -> LoopHandle {
        let label = LoopLabel::fresh();
        let index = self.next_index;
        self.next_index += 1;
        self.open_loops.push(OpenLoop {
            label,
            index,
            body: Vec::new(),
        });
        LoopHandle {
            label,
            depth: self.open_loops.len(),
        }
    }

    /// Close the innermost open loop with its back-edge condition.
    pub fn end_loop(&mut self, handle: LoopHandle, condition: LoopCondition) -> CompileResult<()> {
        let index = self.next_index;
        let innermost = self.open_loops.last().map(|open| open.label);
        if innermost != Some(handle.label) || handle.depth != self.open_loops.len() {
            return Err(self.structural(Some(index), None, StructuralIssue::UnbalancedLoop));
        }
        match condition {
            LoopCondition::CountDown(counter) => {
                self.check_register(counter, index, 0)?;
                if counter.bank() != RegBank::GeneralPurpose {
                    return Err(self.structural(
                        Some(index),
                        Some(0),
                        StructuralIssue::AddressRegister {
                            class: counter.class(),
                        },
                    ));
                }
            }
            LoopCondition::Compare { lhs, rhs, .. } => {
                self.validate_operands(Opcode::Cmp, &[lhs, rhs], index)?;
            }
            LoopCondition::Flags(_) => {}
        }

        let Some(open) = self.open_loops.pop() else {
            return Err(self.structural(Some(index), None, StructuralIssue::UnbalancedLoop));
        };
        self.next_index += 1;
        let item = Item {
            index: open.index,
            kind: ItemKind::Loop(Loop {
                label: open.label,
                condition,
                body: open.body,
                end_index: index,
            }),
        };
        self.current_body().push(item);
        Ok(())
    }

    /// Finish the function.
    pub fn end_function(self) -> CompileResult<Function> {
        if !self.open_loops.is_empty() {
            return Err(self.structural(None, None, StructuralIssue::UnbalancedLoop));
        }
        for (i, arg) in self.arguments.iter().enumerate() {
            if self.arguments[..i].iter().any(|prev| prev.name() == arg.name()) {
                return Err(self.structural(
                    None,
                    None,
                    StructuralIssue::DuplicateArgument {
                        argument: arg.name().to_string(),
                    },
                ));
            }
        }
        let ends_with_return = matches!(
            self.body.last(),
            Some(Item {
                kind: ItemKind::Return(_),
                ..
            })
        );
        if self.return_type.is_some() && !ends_with_return {
            return Err(self.structural(None, None, StructuralIssue::MissingReturn));
        }

        log::debug!(
            "built function '{}': {} items, {} virtual registers",
            self.name,
            self.next_index,
            self.pool.len()
        );

        Ok(Function {
            id: self.pool.function(),
            name: self.name,
            arguments: self.arguments,
            return_type: self.return_type,
            body: self.body,
            register_count: self.pool.len(),
            item_count: self.next_index,
        })
    }

    fn push(&mut self, kind: ItemKind) {
        let index = self.next_index;
        self.next_index += 1;
        self.current_body().push(Item { index, kind });
    }

    fn current_body(&mut self) -> &mut Vec<Item> {
        match self.open_loops.last_mut() {
            Some(open) => &mut open.body,
            None => &mut self.body,
        }
    }

    fn structural(
        &self,
        instruction: Option<usize>,
        operand: Option<usize>,
        issue: StructuralIssue,
    ) -> CompileError {
        CompileError::Structural {
            function: self.name.clone(),
            instruction,
            operand,
            issue,
        }
    }

    fn check_register(
        &self,
        reg: VirtualRegister,
        instruction: usize,
        operand: usize,
    ) -> CompileResult<()> {
        if self.pool.owns(reg) {
            Ok(())
        } else {
            Err(self.structural(
                Some(instruction),
                Some(operand),
                StructuralIssue::UnissuedRegister,
            ))
        }
    }

    fn validate_operands(
        &self,
        opcode: Opcode,
        operands: &[Operand],
        index: usize,
    ) -> CompileResult<()> {
        if operands.len() != opcode.arity() {
            return Err(self.structural(
                Some(index),
                None,
                StructuralIssue::Arity {
                    expected: opcode.arity(),
                    found: operands.len(),
                },
            ));
        }
        if matches!(operands.first(), Some(Operand::Immediate(_))) {
            return Err(self.structural(Some(index), Some(0), StructuralIssue::ImmediateDestination));
        }
        for (position, operand) in operands.iter().enumerate() {
            match operand {
                Operand::Register(reg) => self.check_register(*reg, index, position)?,
                Operand::Immediate(_) => {}
                Operand::Memory(mem) => {
                    for reg in mem.registers() {
                        self.check_register(reg, index, position)?;
                        if reg.class() != WidthClass::Gp64 {
                            return Err(self.structural(
                                Some(index),
                                Some(position),
                                StructuralIssue::AddressRegister { class: reg.class() },
                            ));
                        }
                    }
                }
            }
        }
        if let Some(position) = opcode.memory_width_missing(operands) {
            return Err(self.structural(
                Some(index),
                Some(position),
                StructuralIssue::MissingMemoryWidth,
            ));
        }
        Ok(())
    }
}

/// A finished, immutable function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    id: FunctionId,
    name: String,
    arguments: Vec<Argument>,
    return_type: Option<ArgType>,
    body: Vec<Item>,
    register_count: usize,
    item_count: usize,
}

impl Function {
    pub fn id(&self) -> FunctionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    pub fn argument(&self, name: &str) -> Option<&Argument> {
        self.arguments.iter().find(|arg| arg.name() == name)
    }

    /// Declaration position of `argument`, if it belongs to this function.
    pub fn argument_position(&self, argument: &Argument) -> Option<usize> {
        self.arguments.iter().position(|arg| arg == argument)
    }

    pub fn return_type(&self) -> Option<&ArgType> {
        self.return_type.as_ref()
    }

    pub fn body(&self) -> &[Item] {
        &self.body
    }

    /// Number of virtual registers issued while building.
    pub fn register_count(&self) -> usize {
        self.register_count
    }

    /// Number of indices handed out to body items.
    pub fn item_count(&self) -> usize {
        self.item_count
    }
}
