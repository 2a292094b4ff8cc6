//! Multi-function modules.
//!
//! A [`Module`] is an ordered set of finished functions that are encoded under
//! one architecture and convention and written to a single object file. Each
//! function is encoded independently in its own arena, so
//! [`Module::encode_parallel`] simply spreads them over scoped threads.

use crate::core::error::{CompileError, CompileResult};
use crate::core::function::Function;
use crate::core::target::Architecture;
use crate::object::{ObjectArtifact, ObjectFormat, ObjectWriter};
use crate::x64::calling_convention::CallingConvention;
use crate::x64::function_codegen::{encode, EncodedFunction};
use std::thread;

/// Ordered collection of functions.
#[derive(Debug, Clone, Default)]
pub struct Module {
    functions: Vec<Function>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_functions(functions: Vec<Function>) -> Self {
        Self { functions }
    }

    pub fn add(&mut self, function: Function) {
        self.functions.push(function);
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Encode every function in order, stopping at the first failure.
    pub fn encode_all(
        &self,
        architecture: Architecture,
        convention: CallingConvention,
    ) -> CompileResult<Vec<EncodedFunction>> {
        self.functions
            .iter()
            .map(|function| encode(function, architecture, convention))
            .collect()
    }

    /// Encode every function on its own scoped thread. The result is the same
    /// as [`Module::encode_all`], including which error is reported.
    pub fn encode_parallel(
        &self,
        architecture: Architecture,
        convention: CallingConvention,
    ) -> CompileResult<Vec<EncodedFunction>> {
        let results: Vec<CompileResult<EncodedFunction>> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .functions
                .iter()
                .map(|function| scope.spawn(move || encode(function, architecture, convention)))
                .collect();
            handles
                .into_iter()
                .zip(&self.functions)
                .map(|(handle, function)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(CompileError::Assembly {
                            function: function.name().to_string(),
                            reason: "encoder thread panicked".to_string(),
                        })
                    })
                })
                .collect()
        });
        log::debug!("encoded {} functions in parallel", results.len());
        results.into_iter().collect()
    }

    /// Encode the module and write all functions into one object.
    pub fn to_object(
        &self,
        format: ObjectFormat,
        convention: CallingConvention,
        go_package: Option<&str>,
    ) -> CompileResult<ObjectArtifact> {
        let encoded = self.encode_all(Architecture::X86_64, convention)?;
        let mut writer = ObjectWriter::new(format, convention);
        if let Some(package) = go_package {
            writer = writer.with_go_package(package);
        }
        for function in &encoded {
            writer.add(function)?;
        }
        writer.finish()
    }
}
