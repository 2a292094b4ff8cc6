//! Virtual register pool.
//!
//! Every function under construction owns a [`VRegPool`] that issues
//! width-classed [`VirtualRegister`]s. A register remembers the identity of
//! the function that issued it, so a register leaking from one builder into
//! another is caught by structural validation instead of silently aliasing.

use crate::core::types::{RegBank, WidthClass};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_FUNCTION_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique identity of a function under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(u32);

impl FunctionId {
    pub(crate) fn fresh() -> Self {
        Self(NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Abstract register, bound to a physical register only during encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualRegister {
    function: FunctionId,
    index: u32,
    class: WidthClass,
}

impl VirtualRegister {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn class(&self) -> WidthClass {
        self.class
    }

    pub fn bank(&self) -> RegBank {
        self.class.bank()
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }
}

impl fmt::Display for VirtualRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}:{}", self.index, self.class)
    }
}

/// Issues virtual registers for one function.
#[derive(Debug)]
pub struct VRegPool {
    function: FunctionId,
    classes: Vec<WidthClass>,
}

impl VRegPool {
    pub fn new(function: FunctionId) -> Self {
        Self {
            function,
            classes: Vec::new(),
        }
    }

    pub fn issue(&mut self, class: WidthClass) -> VirtualRegister {
        let index = self.classes.len() as u32;
        self.classes.push(class);
        VirtualRegister {
            function: self.function,
            index,
            class,
        }
    }

    /// Whether `reg` was issued by this pool.
    pub fn owns(&self, reg: VirtualRegister) -> bool {
        reg.function == self.function
            && self
                .classes
                .get(reg.index as usize)
                .is_some_and(|&class| class == reg.class)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }
}
