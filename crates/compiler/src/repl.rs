//! REPL engine: readiness, cell classification, prelude accumulation,
//! and execution against a JIT session.
//!
//! The engine is UI-free; the CLI owns line editing and the `:`-command
//! loop. Each completed buffer becomes a cell: declaration cells load a
//! module built from the accumulated prelude plus the cell, executable
//! cells wrap their statements in a synthesized function and run it in
//! the session without reset.

use crate::ast::{NodeKind, ParsedNode};
use crate::backend::OptLevel;
use crate::emit::{self, EmitOptions};
use crate::jit;
use crate::lower;
use crate::parser::Parser;
use crate::preprocess::{self, PpMode, PpOptions};
use crate::sema::{self, SemaOptions};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Complete,
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Declaration,
    Executable,
    Expression,
}

#[derive(Debug, Clone)]
pub struct ReplOptions {
    pub strict: bool,
    pub session: String,
    pub opt_level: OptLevel,
}

impl Default for ReplOptions {
    fn default() -> Self {
        ReplOptions { strict: true, session: "__repl__".to_string(), opt_level: OptLevel::O1 }
    }
}

pub struct ReplEngine {
    opts: ReplOptions,
    /// Rendered prelude declarations, first-seen order.
    decls: Vec<String>,
    seen: HashSet<String>,
}

impl ReplEngine {
    pub fn new(opts: ReplOptions) -> Self {
        ReplEngine { opts, decls: Vec::new(), seen: HashSet::new() }
    }

    pub fn session_name(&self) -> &str {
        &self.opts.session
    }

    /// Drop the session and the declaration catalog.
    pub fn reset(&mut self) {
        jit::reset(&self.opts.session);
        self.decls.clear();
        self.seen.clear();
    }

    // ==================================================================
    // Readiness
    // ==================================================================

    /// Decide whether a buffer is a complete cell or needs more input.
    pub fn readiness(buffer: &str) -> Readiness {
        let trimmed = buffer.trim();
        if trimmed.is_empty() {
            return Readiness::Complete;
        }
        if has_open_delimiters(buffer) {
            return Readiness::Incomplete;
        }
        // Trailing operator suggests continuation.
        if let Some(last) = trimmed.chars().next_back() {
            if matches!(last, '+' | '-' | '*' | '/' | '%' | '&' | '|' | '^' | '<' | '>' | '=' | ',' | '!') {
                return Readiness::Incomplete;
            }
        }
        // Parse probe: EOF-adjacent errors keep reading.
        let opts = PpOptions { mode: PpMode::Jit, include_roots: vec![] };
        let processed = match preprocess::preprocess_text(buffer, "<repl>", &opts) {
            Ok(p) => p,
            Err(_) => return Readiness::Complete, // surfaced at eval
        };
        match Parser::parse_source(&processed, "<repl>") {
            Ok(_) => Readiness::Complete,
            Err(diag) => {
                if diag.code == "HC2102" {
                    return Readiness::Incomplete;
                }
                let last_line = processed.lines().count();
                if diag.line >= last_line
                    && (diag.message.starts_with("expected")
                        || diag.message.contains("unexpected token in expression"))
                {
                    return Readiness::Incomplete;
                }
                Readiness::Complete
            }
        }
    }

    // ==================================================================
    // Classification
    // ==================================================================

    /// Classify a parsed cell. Mixed declaration/executable cells are
    /// rejected.
    pub fn classify(program: &ParsedNode) -> Result<CellKind, String> {
        let mut decls = 0usize;
        let mut execs = 0usize;
        let mut exprs = 0usize;
        for item in &program.children {
            match item.kind {
                NodeKind::FunctionDecl
                | NodeKind::VarDecl
                | NodeKind::VarDeclList
                | NodeKind::TypeAliasDecl
                | NodeKind::ClassDecl
                | NodeKind::LinkageDecl
                | NodeKind::StartLabel
                | NodeKind::EndLabel => decls += 1,
                NodeKind::EmptyStmt => {}
                NodeKind::ExprStmt => {
                    execs += 1;
                    exprs += 1;
                }
                _ => execs += 1,
            }
        }
        match (decls, execs) {
            (0, 0) => Ok(CellKind::Executable),
            (_, 0) => Ok(CellKind::Declaration),
            (0, _) => {
                if execs == 1 && exprs == 1 {
                    Ok(CellKind::Expression)
                } else {
                    Ok(CellKind::Executable)
                }
            }
            _ => Err("cells cannot mix declarations with executable statements".to_string()),
        }
    }

    // ==================================================================
    // Evaluation
    // ==================================================================

    /// Evaluate one complete cell. Returns the text to print for
    /// expression cells.
    pub fn eval(&mut self, cell: &str) -> Result<Option<String>, String> {
        let pp_opts = PpOptions { mode: PpMode::Jit, include_roots: vec![] };
        let processed =
            preprocess::preprocess_text(cell, "<repl>", &pp_opts).map_err(|d| d.render())?;
        if processed.trim().is_empty() {
            return Ok(None);
        }
        let parsed = Parser::parse_source(&processed, "<repl>").map_err(|d| d.render())?;
        let kind = Self::classify(&parsed)?;

        match kind {
            CellKind::Declaration => {
                self.load_declaration_cell(&processed, &parsed)?;
                Ok(None)
            }
            CellKind::Executable => {
                self.execute_cell(&processed, false)?;
                Ok(None)
            }
            CellKind::Expression => {
                let value = self.execute_cell(&processed, true)?;
                Ok(Some(format!("{}", value)))
            }
        }
    }

    fn compile_to_ir(&self, source: &str, opts: &EmitOptions) -> Result<String, String> {
        let parsed = Parser::parse_source(source, "<repl>").map_err(|d| d.render())?;
        let typed = sema::analyze(&parsed, "<repl>", SemaOptions { strict: self.opts.strict })
            .map_err(|d| d.render())?;
        let module = lower::lower(&typed, "<repl>").map_err(|d| d.render())?;
        emit::emit(&module, opts).map_err(|e| e.to_string())
    }

    fn load_declaration_cell(&mut self, processed: &str, parsed: &ParsedNode) -> Result<(), String> {
        let tag = jit::next_module_tag(&self.opts.session).map_err(|e| e.to_string())?;
        let source = format!("{}\n{}", self.prelude(), processed);
        let opts = EmitOptions {
            module_name: format!("repl_{}", tag),
            source_file: "<repl>".to_string(),
            jit: true,
            entry_wrap: None,
            module_tag: tag.clone(),
        };
        let ir = self.compile_to_ir(&source, &opts)?;
        jit::load(&self.opts.session, &tag, &ir).map_err(|e| e.to_string())?;

        // The cell is resident; grow the prelude monotonically.
        for decl in render_declarations(parsed) {
            if self.seen.insert(decl.clone()) {
                self.decls.push(decl);
            }
        }
        Ok(())
    }

    fn execute_cell(&mut self, processed: &str, expression: bool) -> Result<i64, String> {
        let n = jit::next_entry_index(&self.opts.session).map_err(|e| e.to_string())?;
        let tag = jit::next_module_tag(&self.opts.session).map_err(|e| e.to_string())?;
        let fn_name = format!("__holyc_repl_exec_{}", n);

        let body = if expression {
            let expr = processed.trim().trim_end_matches(';');
            format!("return {};", expr)
        } else {
            format!("{}\nreturn 0;", processed)
        };
        let source = format!("{}\nI64 {}() {{\n{}\n}}\n", self.prelude(), fn_name, body);

        let opts = EmitOptions {
            module_name: format!("repl_{}", tag),
            source_file: "<repl>".to_string(),
            jit: true,
            entry_wrap: Some((fn_name, n)),
            module_tag: tag.clone(),
        };
        let ir = self.compile_to_ir(&source, &opts)?;
        let entry = format!("__holyc_entry_{}", n);
        jit::execute(&self.opts.session, &tag, &ir, &entry, self.opts.opt_level, false)
            .map_err(|e| e.to_string())
    }

    /// The prelude carries every declaration visible so far.
    pub fn prelude(&self) -> String {
        self.decls.join("\n")
    }
}

fn has_open_delimiters(buffer: &str) -> bool {
    let mut paren = 0i64;
    let mut bracket = 0i64;
    let mut brace = 0i64;
    let mut chars = buffer.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '(' => paren += 1,
            ')' => paren -= 1,
            '[' => bracket += 1,
            ']' => bracket -= 1,
            '{' => brace += 1,
            '}' => brace -= 1,
            '"' | '\'' => {
                let quote = c;
                let mut closed = false;
                while let Some(inner) = chars.next() {
                    if inner == '\\' {
                        chars.next();
                        continue;
                    }
                    if inner == quote {
                        closed = true;
                        break;
                    }
                    if inner == '\n' {
                        break;
                    }
                }
                if !closed {
                    return true;
                }
            }
            '/' => {
                match chars.peek() {
                    Some('/') => {
                        // Line comment: skip to newline.
                        for inner in chars.by_ref() {
                            if inner == '\n' {
                                break;
                            }
                        }
                    }
                    Some('*') => {
                        chars.next();
                        let mut closed = false;
                        let mut prev = ' ';
                        for inner in chars.by_ref() {
                            if prev == '*' && inner == '/' {
                                closed = true;
                                break;
                            }
                            prev = inner;
                        }
                        if !closed {
                            return true;
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }
    paren > 0 || bracket > 0 || brace > 0
}

// ======================================================================
// Prelude rendering
// ======================================================================

/// Render the extern-visible form of each declaration in a cell:
/// typedefs, class bodies, extern globals, and function prototypes
/// (static functions stay module-private).
pub fn render_declarations(program: &ParsedNode) -> Vec<String> {
    let mut out = Vec::new();
    for item in &program.children {
        match item.kind {
            NodeKind::TypeAliasDecl => out.push(format!("typedef {};", item.text)),
            NodeKind::ClassDecl => {
                out.push(render_class(item));
                for decl in item.children.iter().filter(|c| c.kind == NodeKind::VarDecl) {
                    out.push(render_extern_global(decl));
                }
            }
            NodeKind::VarDecl => out.push(render_extern_global(item)),
            NodeKind::VarDeclList => {
                for decl in &item.children {
                    out.push(render_extern_global(decl));
                }
            }
            NodeKind::LinkageDecl => out.push(render_extern_global(item)),
            NodeKind::FunctionDecl => {
                let is_static = item
                    .children
                    .iter()
                    .any(|c| c.kind == NodeKind::DeclSpec && c.text == "static");
                if !is_static {
                    out.push(render_prototype(item));
                }
            }
            _ => {}
        }
    }
    out
}

fn decl_type_of(node: &ParsedNode) -> String {
    node.child_of(NodeKind::DeclType)
        .map(|t| t.text.clone())
        .unwrap_or_else(|| "I64".to_string())
}

fn render_extern_global(node: &ParsedNode) -> String {
    format!("extern {} {};", decl_type_of(node), node.text)
}

fn render_class(node: &ParsedNode) -> String {
    let is_union = node.children.iter().any(|c| c.kind == NodeKind::DeclSpec && c.text == "union");
    let keyword = if is_union { "union" } else { "class" };
    let mut body = String::new();
    for field in node.children.iter().filter(|c| c.kind == NodeKind::FieldDecl) {
        body.push_str(&format!(" {} {};", decl_type_of(field), field.text));
    }
    format!("{} {} {{{} }};", keyword, node.text, body)
}

fn render_prototype(node: &ParsedNode) -> String {
    let mut params = Vec::new();
    if let Some(list) = node.child_of(NodeKind::ParamList) {
        for param in &list.children {
            let mut text = format!("{} {}", decl_type_of(param), param.text);
            if let Some(default) = param.child_of(NodeKind::Default) {
                text.push('=');
                text.push_str(&render_expr(&default.children[0]));
            }
            params.push(text);
        }
    }
    format!("{} {}({});", decl_type_of(node), node.text, params.join(", "))
}

/// Re-render an expression subtree as source text (used for default
/// arguments carried into prototypes).
pub fn render_expr(node: &ParsedNode) -> String {
    match node.kind {
        NodeKind::Literal | NodeKind::Identifier => node.text.clone(),
        NodeKind::DollarExpr => "$".to_string(),
        NodeKind::UnaryExpr => format!("{}{}", node.text, render_expr(&node.children[0])),
        NodeKind::PostfixExpr => format!("{}{}", render_expr(&node.children[0]), node.text),
        NodeKind::BinaryExpr | NodeKind::AssignExpr => format!(
            "{} {} {}",
            render_expr(&node.children[0]),
            node.text,
            render_expr(&node.children[1])
        ),
        NodeKind::CastExpr => format!("({}){}", node.text, render_expr(&node.children[0])),
        NodeKind::MemberExpr => format!("{}.{}", render_expr(&node.children[0]), node.text),
        NodeKind::IndexExpr => format!("{}[{}]", render_expr(&node.children[0]), render_expr(&node.children[1])),
        NodeKind::CallExpr => {
            let args: Vec<String> = node.children[1].children.iter().map(render_expr).collect();
            format!("{}({})", render_expr(&node.children[0]), args.join(", "))
        }
        NodeKind::CommaExpr => {
            let parts: Vec<String> = node.children.iter().map(render_expr).collect();
            format!("({})", parts.join(", "))
        }
        _ => node.text.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> ParsedNode {
        let opts = PpOptions { mode: PpMode::Jit, include_roots: vec![] };
        let processed = preprocess::preprocess_text(src, "<repl>", &opts).unwrap();
        Parser::parse_source(&processed, "<repl>").unwrap()
    }

    #[test]
    fn test_readiness_complete_seeds() {
        for src in [
            "I64 Main() { return 2 + 3; }",
            "1 + 2;",
            "\"hello\\n\";",
            "class CPt { I64 x; };",
            "I64 x = 5;",
        ] {
            assert_eq!(ReplEngine::readiness(src), Readiness::Complete, "source: {}", src);
        }
    }

    #[test]
    fn test_readiness_incomplete_seeds() {
        for src in [
            "I64 F() {",
            "F(1,",
            "\"unterminated",
            "/* open comment",
            "1 +",
            "I64 x = ",
            "if (x) {",
        ] {
            assert_eq!(ReplEngine::readiness(src), Readiness::Incomplete, "source: {}", src);
        }
    }

    #[test]
    fn test_readiness_empty_is_complete() {
        assert_eq!(ReplEngine::readiness("   \n"), Readiness::Complete);
    }

    #[test]
    fn test_classify_declaration() {
        let p = parse("I64 F() { return 1; } I64 g;");
        assert_eq!(ReplEngine::classify(&p).unwrap(), CellKind::Declaration);
    }

    #[test]
    fn test_classify_expression() {
        let p = parse("1 + 2;");
        assert_eq!(ReplEngine::classify(&p).unwrap(), CellKind::Expression);
    }

    #[test]
    fn test_classify_executable() {
        let p = parse("I64 x; x = 1; \"v=%d\\n\", x;");
        // A cell with a local declaration statement and executable
        // statements is mixed only at the top level of declarations;
        // VarDecl counts as a declaration, so this is mixed.
        assert!(ReplEngine::classify(&p).is_err());
    }

    #[test]
    fn test_classify_statements_only() {
        let p = parse("\"hi\\n\"; \"there\\n\";");
        assert_eq!(ReplEngine::classify(&p).unwrap(), CellKind::Executable);
    }

    #[test]
    fn test_render_prototype_with_default() {
        let p = parse("U0 Show(U8 *name, U8 *ty=lastclass) { }");
        let decls = render_declarations(&p);
        assert_eq!(decls, vec!["U0 Show(U8* name, U8* ty=lastclass);"]);
    }

    #[test]
    fn test_render_class_and_trailing() {
        let p = parse("class CPt { I64 x; F64 w; } origin;");
        let decls = render_declarations(&p);
        assert_eq!(decls[0], "class CPt { I64 x; F64 w; };");
        assert_eq!(decls[1], "extern CPt origin;");
    }

    #[test]
    fn test_render_skips_static_functions() {
        let p = parse("static I64 Hidden() { return 1; } I64 Shown() { return 2; }");
        let decls = render_declarations(&p);
        assert_eq!(decls, vec!["I64 Shown();"]);
    }

    #[test]
    fn test_render_var_decl_list() {
        let p = parse("I64 a = 1, b = 2;");
        let decls = render_declarations(&p);
        assert_eq!(decls, vec!["extern I64 a;", "extern I64 b;"]);
    }

    #[test]
    fn test_prelude_dedup_monotonic() {
        let mut engine = ReplEngine::new(ReplOptions::default());
        let p = parse("I64 F() { return 1; }");
        for decl in render_declarations(&p) {
            if engine.seen.insert(decl.clone()) {
                engine.decls.push(decl);
            }
        }
        for decl in render_declarations(&p) {
            if engine.seen.insert(decl.clone()) {
                engine.decls.push(decl);
            }
        }
        assert_eq!(engine.decls.len(), 1);
    }

    #[test]
    fn test_render_expr_roundtrip() {
        let p = parse("I64 F(I64 a=1+2, U8 *s=NULL, I64 m=G(3)) { return 0; }");
        let decls = render_declarations(&p);
        assert_eq!(decls, vec!["I64 F(I64 a=1 + 2, U8* s=NULL, I64 m=G(3));"]);
    }
}
