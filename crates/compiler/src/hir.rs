//! High-level intermediate representation.
//!
//! Expressions keep the uniform kind/text/children/type record the typed
//! AST uses; statements are a proper sum type with per-kind fields. The
//! lowerer produces one `HirModule` per compilation, the IR emitter
//! consumes it.

use std::fmt::Write as _;

/// Expression kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HirExprKind {
    IntLiteral,
    FloatLiteral,
    StringLiteral,
    CharLiteral,
    Dollar,
    Var,
    Assign,
    Unary,
    Binary,
    Call,
    Cast,
    Postfix,
    Lane,
    Member,
    Index,
    Comma,
}

impl HirExprKind {
    pub fn name(self) -> &'static str {
        match self {
            HirExprKind::IntLiteral => "IntLiteral",
            HirExprKind::FloatLiteral => "FloatLiteral",
            HirExprKind::StringLiteral => "StringLiteral",
            HirExprKind::CharLiteral => "CharLiteral",
            HirExprKind::Dollar => "Dollar",
            HirExprKind::Var => "Var",
            HirExprKind::Assign => "Assign",
            HirExprKind::Unary => "Unary",
            HirExprKind::Binary => "Binary",
            HirExprKind::Call => "Call",
            HirExprKind::Cast => "Cast",
            HirExprKind::Postfix => "Postfix",
            HirExprKind::Lane => "Lane",
            HirExprKind::Member => "Member",
            HirExprKind::Index => "Index",
            HirExprKind::Comma => "Comma",
        }
    }
}

/// One HIR expression: operator/name/literal text, ordered children, and
/// the HolyC type computed by sema (or per call site for defaults).
#[derive(Debug, Clone, PartialEq)]
pub struct HirExpr {
    pub kind: HirExprKind,
    pub text: String,
    pub children: Vec<HirExpr>,
    pub ty: String,
}

impl HirExpr {
    pub fn new(kind: HirExprKind, text: impl Into<String>, ty: impl Into<String>) -> Self {
        HirExpr { kind, text: text.into(), children: Vec::new(), ty: ty.into() }
    }

    pub fn with_children(mut self, children: Vec<HirExpr>) -> Self {
        self.children = children;
        self
    }

    pub fn int(value: i64) -> Self {
        HirExpr::new(HirExprKind::IntLiteral, value.to_string(), "I64")
    }
}

/// Storage class of a variable declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Local,
    StaticLocal,
    Global,
    StaticGlobal,
}

/// Flag bits of one switch case: bit0 marks the null form (`case:`),
/// bit1 marks a range (`case lo ... hi:`), bit2 the default clause.
pub const CASE_FLAG_NULL: u8 = 1 << 0;
pub const CASE_FLAG_RANGE: u8 = 1 << 1;
pub const CASE_FLAG_DEFAULT: u8 = 1 << 2;

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub flags: u8,
    pub begin: Option<HirExpr>,
    pub end: Option<HirExpr>,
    pub body: Vec<HirStmt>,
}

/// HIR statements. `exception_region` on Throw is the id of the
/// enclosing try frame, or -1 outside any.
#[derive(Debug, Clone, PartialEq)]
pub enum HirStmt {
    VarDecl {
        name: String,
        ty: String,
        init: Option<HirExpr>,
        storage: StorageClass,
        const_init: bool,
    },
    Assign {
        op: String,
        target: HirExpr,
        value: HirExpr,
    },
    Return {
        value: Option<HirExpr>,
    },
    Expr {
        expr: HirExpr,
    },
    NoParenCall {
        name: String,
    },
    Print {
        format: HirExpr,
        args: Vec<HirExpr>,
    },
    Lock {
        body: Vec<HirStmt>,
    },
    Throw {
        payload: HirExpr,
        exception_region: i32,
    },
    TryCatch {
        region: i32,
        body: Vec<HirStmt>,
        catch: Vec<HirStmt>,
    },
    Break,
    Switch {
        cond: HirExpr,
        cases: Vec<SwitchCase>,
    },
    If {
        cond: HirExpr,
        then_body: Vec<HirStmt>,
        else_body: Vec<HirStmt>,
    },
    While {
        cond: HirExpr,
        body: Vec<HirStmt>,
    },
    DoWhile {
        cond: HirExpr,
        body: Vec<HirStmt>,
    },
    Label {
        name: String,
    },
    Goto {
        name: String,
    },
    InlineAsm {
        template: String,
        constraints: Vec<String>,
        operands: Vec<Option<HirExpr>>,
    },
    MetadataDecl {
        name: String,
        payload: String,
    },
    LinkageDecl {
        name: String,
        ty: String,
    },
}

/// Linkage of an emitted function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkageKind {
    Internal,
    External,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HirFunction {
    pub name: String,
    pub return_type: String,
    pub linkage: LinkageKind,
    pub params: Vec<(String, String)>,
    pub body: Vec<HirStmt>,
}

/// Prototype-only projection of a function.
#[derive(Debug, Clone, PartialEq)]
pub struct HirFunctionDecl {
    pub name: String,
    pub return_type: String,
    pub params: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HirReflectionField {
    pub aggregate: String,
    pub field: String,
    pub ty: String,
    pub annotations: Vec<String>,
}

/// Ordered reflection data: one row per aggregate field, plus the raw
/// type-alias strings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HirReflectionTable {
    pub fields: Vec<HirReflectionField>,
    pub aliases: Vec<String>,
}

/// Whether an aggregate row set describes a union (shared offset 0).
#[derive(Debug, Clone, PartialEq)]
pub struct HirAggregate {
    pub name: String,
    pub is_union: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HirModule {
    pub top_level_items: Vec<HirStmt>,
    pub functions: Vec<HirFunction>,
    pub function_decls: Vec<HirFunctionDecl>,
    pub aggregates: Vec<HirAggregate>,
    pub reflection: HirReflectionTable,
}

// ======================================================================
// Textual dump (the emit-hir command)
// ======================================================================

pub fn dump_module(module: &HirModule) -> String {
    let mut out = String::new();
    out.push_str("module:\n");
    for item in &module.top_level_items {
        dump_stmt(item, 1, &mut out);
    }
    for decl in &module.function_decls {
        let params: Vec<String> = decl.params.iter().map(|(ty, name)| format!("{} {}", ty, name)).collect();
        let _ = writeln!(out, "  FunctionDecl {} {}({})", decl.return_type, decl.name, params.join(", "));
    }
    for func in &module.functions {
        let params: Vec<String> = func.params.iter().map(|(ty, name)| format!("{} {}", ty, name)).collect();
        let linkage = match func.linkage {
            LinkageKind::Internal => "internal ",
            LinkageKind::External => "",
        };
        let _ = writeln!(out, "  Function {}{} {}({})", linkage, func.return_type, func.name, params.join(", "));
        for stmt in &func.body {
            dump_stmt(stmt, 2, &mut out);
        }
    }
    if !module.reflection.fields.is_empty() {
        out.push_str("  reflection:\n");
        for f in &module.reflection.fields {
            let _ = writeln!(out, "    {} {} {} [{}]", f.aggregate, f.field, f.ty, f.annotations.join(" "));
        }
    }
    out
}

fn indent(depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn dump_stmt(stmt: &HirStmt, depth: usize, out: &mut String) {
    indent(depth, out);
    match stmt {
        HirStmt::VarDecl { name, ty, init, storage, const_init } => {
            let _ = writeln!(out, "VarDecl {} {} storage={:?} const_init={}", ty, name, storage, const_init);
            if let Some(init) = init {
                dump_expr(init, depth + 1, out);
            }
        }
        HirStmt::Assign { op, target, value } => {
            let _ = writeln!(out, "Assign {}", op);
            dump_expr(target, depth + 1, out);
            dump_expr(value, depth + 1, out);
        }
        HirStmt::Return { value } => {
            out.push_str("Return\n");
            if let Some(value) = value {
                dump_expr(value, depth + 1, out);
            }
        }
        HirStmt::Expr { expr } => {
            out.push_str("Expr\n");
            dump_expr(expr, depth + 1, out);
        }
        HirStmt::NoParenCall { name } => {
            let _ = writeln!(out, "NoParenCall {}", name);
        }
        HirStmt::Print { format, args } => {
            out.push_str("Print\n");
            dump_expr(format, depth + 1, out);
            for arg in args {
                dump_expr(arg, depth + 1, out);
            }
        }
        HirStmt::Lock { body } => {
            out.push_str("Lock\n");
            for s in body {
                dump_stmt(s, depth + 1, out);
            }
        }
        HirStmt::Throw { payload, exception_region } => {
            let _ = writeln!(out, "Throw region={}", exception_region);
            dump_expr(payload, depth + 1, out);
        }
        HirStmt::TryCatch { region, body, catch } => {
            let _ = writeln!(out, "TryCatch region={}", region);
            indent(depth + 1, out);
            out.push_str("try:\n");
            for s in body {
                dump_stmt(s, depth + 2, out);
            }
            indent(depth + 1, out);
            out.push_str("catch:\n");
            for s in catch {
                dump_stmt(s, depth + 2, out);
            }
        }
        HirStmt::Break => out.push_str("Break\n"),
        HirStmt::Switch { cond, cases } => {
            out.push_str("Switch\n");
            dump_expr(cond, depth + 1, out);
            for case in cases {
                indent(depth + 1, out);
                let _ = writeln!(out, "case flags={}", case.flags);
                if let Some(b) = &case.begin {
                    dump_expr(b, depth + 2, out);
                }
                if let Some(e) = &case.end {
                    dump_expr(e, depth + 2, out);
                }
                for s in &case.body {
                    dump_stmt(s, depth + 2, out);
                }
            }
        }
        HirStmt::If { cond, then_body, else_body } => {
            out.push_str("If\n");
            dump_expr(cond, depth + 1, out);
            indent(depth + 1, out);
            out.push_str("then:\n");
            for s in then_body {
                dump_stmt(s, depth + 2, out);
            }
            if !else_body.is_empty() {
                indent(depth + 1, out);
                out.push_str("else:\n");
                for s in else_body {
                    dump_stmt(s, depth + 2, out);
                }
            }
        }
        HirStmt::While { cond, body } => {
            out.push_str("While\n");
            dump_expr(cond, depth + 1, out);
            for s in body {
                dump_stmt(s, depth + 1, out);
            }
        }
        HirStmt::DoWhile { cond, body } => {
            out.push_str("DoWhile\n");
            for s in body {
                dump_stmt(s, depth + 1, out);
            }
            dump_expr(cond, depth + 1, out);
        }
        HirStmt::Label { name } => {
            let _ = writeln!(out, "Label {}", name);
        }
        HirStmt::Goto { name } => {
            let _ = writeln!(out, "Goto {}", name);
        }
        HirStmt::InlineAsm { template, constraints, .. } => {
            let _ = writeln!(out, "InlineAsm \"{}\" [{}]", template, constraints.join(", "));
        }
        HirStmt::MetadataDecl { name, payload } => {
            let _ = writeln!(out, "MetadataDecl {} {}", name, payload);
        }
        HirStmt::LinkageDecl { name, ty } => {
            let _ = writeln!(out, "LinkageDecl {} {}", ty, name);
        }
    }
}

fn dump_expr(expr: &HirExpr, depth: usize, out: &mut String) {
    indent(depth, out);
    if expr.ty.is_empty() {
        let _ = writeln!(out, "{} {}", expr.kind.name(), expr.text);
    } else {
        let _ = writeln!(out, "{} {} : {}", expr.kind.name(), expr.text, expr.ty);
    }
    for child in &expr.children {
        dump_expr(child, depth + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_function() {
        let module = HirModule {
            functions: vec![HirFunction {
                name: "Main".to_string(),
                return_type: "I64".to_string(),
                linkage: LinkageKind::External,
                params: vec![],
                body: vec![HirStmt::Return { value: Some(HirExpr::int(0)) }],
            }],
            ..Default::default()
        };
        let dump = dump_module(&module);
        assert!(dump.contains("Function I64 Main()"));
        assert!(dump.contains("Return"));
        assert!(dump.contains("IntLiteral 0 : I64"));
    }

    #[test]
    fn test_case_flags() {
        assert_eq!(CASE_FLAG_NULL, 1);
        assert_eq!(CASE_FLAG_RANGE, 2);
    }
}
