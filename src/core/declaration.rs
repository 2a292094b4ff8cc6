//! Opt-in comparison of a hand-written external declaration against a function.
//!
//! Host-language stubs are written by hand and can drift from the generated
//! code. Nothing in the encode path calls [`ExternalDeclaration::check`]; it is
//! for build scripts that want to fail early on a stale stub.

use crate::core::error::{CompileError, CompileResult};
use crate::core::function::Function;
use crate::core::types::ArgType;

/// Signature as the host language declares it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalDeclaration {
    pub name: String,
    pub arguments: Vec<ArgType>,
    pub return_type: Option<ArgType>,
}

impl ExternalDeclaration {
    pub fn new(
        name: impl Into<String>,
        arguments: Vec<ArgType>,
        return_type: Option<ArgType>,
    ) -> Self {
        Self {
            name: name.into(),
            arguments,
            return_type,
        }
    }

    /// Declaration exactly matching `function`.
    pub fn of(function: &Function) -> Self {
        Self {
            name: function.name().to_string(),
            arguments: function.arguments().iter().map(|a| a.ty().clone()).collect(),
            return_type: function.return_type().cloned(),
        }
    }

    /// Report the first difference from `function`.
    pub fn check(&self, function: &Function) -> CompileResult<()> {
        let mismatch = |reason: String| CompileError::SignatureMismatch {
            function: function.name().to_string(),
            reason,
        };

        if self.name != function.name() {
            return Err(mismatch(format!("declared as '{}'", self.name)));
        }
        if self.arguments.len() != function.arguments().len() {
            return Err(mismatch(format!(
                "declared with {} arguments, defined with {}",
                self.arguments.len(),
                function.arguments().len()
            )));
        }
        for (position, (declared, defined)) in
            self.arguments.iter().zip(function.arguments()).enumerate()
        {
            if declared != defined.ty() {
                return Err(mismatch(format!(
                    "argument {position} ('{}') declared as {declared}, defined as {}",
                    defined.name(),
                    defined.ty()
                )));
            }
        }
        if self.return_type.as_ref() != function.return_type() {
            let show = |ty: Option<&ArgType>| ty.map_or_else(|| "void".to_string(), ToString::to_string);
            return Err(mismatch(format!(
                "returns {} but is defined to return {}",
                show(self.return_type.as_ref()),
                show(function.return_type())
            )));
        }
        Ok(())
    }
}
