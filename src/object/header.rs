//! Interop declarations for object files.
//!
//! C conventions get a header with fixed-width types and `extern "C"` guards;
//! Microsoft x64 functions are additionally tagged `ms_abi` so that non-Windows
//! compilers call them correctly. The Go convention gets a declaration stub
//! that the Go toolchain pairs with the assembled body.

use crate::core::error::{CompileError, CompileResult};
use crate::core::types::{c_prototype, go_prototype, ArgType};
use crate::x64::calling_convention::CallingConvention;
use crate::x64::function_codegen::EncodedFunction;

/// C header declaring every function.
pub fn c_header(functions: &[&EncodedFunction]) -> String {
    let vectors = functions.iter().any(|f| {
        f.arguments.iter().map(|a| a.ty()).chain(f.return_type.iter()).any(ArgType::is_vector)
    });
    let microsoft = functions
        .iter()
        .any(|f| f.convention == CallingConvention::Microsoft);

    let mut lines = vec![
        "/* Generated by portasm. */".to_string(),
        "#pragma once".to_string(),
        String::new(),
        "#include <stdbool.h>".to_string(),
        "#include <stddef.h>".to_string(),
        "#include <stdint.h>".to_string(),
    ];
    if vectors {
        lines.push("#include <immintrin.h>".to_string());
    }
    lines.push(String::new());
    if microsoft {
        lines.extend(
            [
                "#if defined(_WIN32)",
                "#define PORTASM_MS_ABI",
                "#else",
                "#define PORTASM_MS_ABI __attribute__((ms_abi))",
                "#endif",
                "",
            ]
            .map(String::from),
        );
    }
    lines.extend(["#ifdef __cplusplus", "extern \"C\" {", "#endif", ""].map(String::from));
    for f in functions {
        let prototype = c_prototype(&f.name, &f.arguments, f.return_type.as_ref());
        if f.convention == CallingConvention::Microsoft {
            lines.push(format!("PORTASM_MS_ABI {prototype};"));
        } else {
            lines.push(format!("{prototype};"));
        }
    }
    lines.extend(["", "#ifdef __cplusplus", "}", "#endif", ""].map(String::from));
    lines.join("\n")
}

/// Go file declaring every function for package `package`.
pub fn go_stub(package: &str, functions: &[&EncodedFunction]) -> CompileResult<String> {
    let mut declarations = Vec::with_capacity(functions.len());
    for f in functions {
        let declaration = go_prototype(&f.name, &f.arguments, f.return_type.as_ref())
            .ok_or_else(|| CompileError::UnsupportedTarget {
                function: f.name.clone(),
                reason: "signature has no Go spelling".to_string(),
            })?;
        declarations.push(declaration);
    }

    let mut out = format!("// Code generated by portasm. DO NOT EDIT.\n\npackage {package}\n");
    if declarations.iter().any(|d| d.contains("unsafe.Pointer")) {
        out += "\nimport \"unsafe\"\n";
    }
    for declaration in declarations {
        out += &format!("\n//go:noescape\n{declaration}\n");
    }
    Ok(out)
}
