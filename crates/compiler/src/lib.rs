//! HolyC compiler library.
//!
//! The pipeline runs source text through the preprocessor, lexer,
//! recursive-descent parser, semantic analyzer, HIR lowerer, and the
//! LLVM-IR text emitter. The emitted IR feeds either the AOT backend
//! (object emission and host link via clang) or the in-process JIT
//! session manager the `jit` and `repl` commands drive.
//!
//! ```rust
//! let ir = holycc::compile_to_ir("I64 Main() { return 2 + 3; }").unwrap();
//! assert!(ir.contains("define i64 @Main()"));
//! ```

pub mod ast;
pub mod backend;
pub mod builtins;
pub mod diag;
pub mod driver;
pub mod emit;
pub mod hir;
pub mod jit;
pub mod lexer;
pub mod lower;
pub mod parser;
pub mod preprocess;
pub mod repl;
pub mod sema;

pub use ast::{NodeKind, ParsedNode, TypedNode};
pub use backend::{BuildOptions, OptLevel};
pub use diag::{Diagnostic, Severity};
pub use emit::EmitOptions;
pub use hir::HirModule;
pub use preprocess::{PpMode, PpOptions};
pub use repl::{CellKind, Readiness, ReplEngine, ReplOptions};
pub use sema::SemaOptions;

/// Compile in-memory source through the whole front half of the
/// pipeline with default (strict, AOT) settings.
pub fn compile_to_ir(source: &str) -> Result<String, String> {
    compile_to_ir_with(source, "<memory>", true, PpMode::Aot)
}

/// Compile in-memory source to IR with explicit mode settings.
pub fn compile_to_ir_with(source: &str, file: &str, strict: bool, mode: PpMode) -> Result<String, String> {
    let pp_opts = PpOptions { mode, include_roots: Vec::new() };
    let processed = preprocess::preprocess_text(source, file, &pp_opts).map_err(|d| d.render())?;
    let parsed = parser::Parser::parse_source(&processed, file).map_err(|d| d.render())?;
    let typed = sema::analyze(&parsed, file, SemaOptions { strict }).map_err(|d| d.render())?;
    let module = lower::lower(&typed, file).map_err(|d| d.render())?;
    let emit_opts = EmitOptions {
        module_name: "holyc_module".to_string(),
        source_file: file.to_string(),
        jit: mode == PpMode::Jit,
        entry_wrap: None,
        module_tag: String::new(),
    };
    emit::emit(&module, &emit_opts).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_to_ir_smoke() {
        let ir = compile_to_ir("I64 Main() { return 2 + 3; }").unwrap();
        assert!(ir.contains("define i64 @Main()"));
        assert!(ir.contains("define i32 @main("));
    }

    #[test]
    fn test_compile_error_renders_diagnostic() {
        let err = compile_to_ir("I64 Main() { return nope; }").unwrap_err();
        assert!(err.contains("HC3001"));
        assert!(err.contains("<memory>"));
    }
}
