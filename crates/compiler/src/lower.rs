//! Lowering from the typed AST to HIR.
//!
//! Signatures are collected before any body so calls lower direct even
//! ahead of the definition. Default arguments (including `lastclass`)
//! are materialized per call site, `for` reshapes into `While`, switch
//! clauses become flag/begin/end records with null-case chaining, and
//! try regions get monotonically increasing ids.

use crate::ast::{NodeKind, TypedNode};
use crate::builtins;
use crate::diag::Diagnostic;
use crate::hir::*;
use crate::lexer;
use crate::sema;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct LoweredParam {
    ty: String,
    name: String,
    default: Option<TypedNode>,
    /// Builtin defaults have no expression and fill with 0 / NULL.
    builtin_default: bool,
}

#[derive(Debug, Clone)]
struct LoweredSig {
    ret: String,
    params: Vec<LoweredParam>,
    imported: bool,
    has_body: bool,
}

pub struct Lowerer {
    file: String,
    functions: HashMap<String, LoweredSig>,
    /// Order of first reference for synthesized and imported prototypes.
    decl_order: Vec<String>,
    region_stack: Vec<i32>,
    next_region: i32,
}

/// Lower a typed program into an HIR module.
pub fn lower(typed: &TypedNode, file: &str) -> Result<HirModule, Diagnostic> {
    let mut lowerer = Lowerer::new(file);
    lowerer.run(typed)
}

impl Lowerer {
    fn new(file: &str) -> Self {
        Lowerer {
            file: file.to_string(),
            functions: HashMap::new(),
            decl_order: Vec::new(),
            region_stack: Vec::new(),
            next_region: 1,
        }
    }

    fn err(&self, code: &'static str, node: &TypedNode, msg: impl Into<String>) -> Diagnostic {
        Diagnostic::error(code, &self.file, node.line, node.column, msg)
    }

    fn run(&mut self, program: &TypedNode) -> Result<HirModule, Diagnostic> {
        // Signature pre-pass over every function declaration.
        for item in &program.children {
            if item.kind == NodeKind::FunctionDecl {
                self.collect_signature(item);
            }
        }

        let mut module = HirModule::default();
        for item in &program.children {
            match item.kind {
                NodeKind::FunctionDecl => {
                    if item.child_of(NodeKind::Block).is_some() {
                        module.functions.push(self.lower_function(item)?);
                    } else if !self.decl_order.contains(&item.text) {
                        self.decl_order.push(item.text.clone());
                    }
                }
                NodeKind::VarDecl => {
                    module.top_level_items.push(self.lower_var_decl(item, true)?);
                }
                NodeKind::VarDeclList => {
                    for decl in &item.children {
                        module.top_level_items.push(self.lower_var_decl(decl, true)?);
                    }
                }
                NodeKind::LinkageDecl => {
                    module.top_level_items.push(self.lower_linkage(item));
                }
                NodeKind::ClassDecl => {
                    self.lower_class(item, &mut module)?;
                }
                NodeKind::TypeAliasDecl => {
                    module.top_level_items.push(HirStmt::MetadataDecl {
                        name: "typedef".to_string(),
                        payload: item.text.clone(),
                    });
                    module.reflection.aliases.push(item.text.clone());
                }
                NodeKind::StartLabel | NodeKind::EndLabel => {
                    module.top_level_items.push(HirStmt::MetadataDecl {
                        name: item.text.clone(),
                        payload: String::new(),
                    });
                }
                NodeKind::EmptyStmt => {}
                _ => {
                    // Executable top-level statements run before Main via
                    // the module init function the emitter synthesizes.
                    for stmt in self.lower_stmt(item)? {
                        module.top_level_items.push(stmt);
                    }
                }
            }
        }

        // Prototypes, in first-reference order, for imported and
        // call-site-synthesized functions.
        for name in &self.decl_order {
            let sig = &self.functions[name];
            if !sig.has_body {
                module.function_decls.push(HirFunctionDecl {
                    name: name.clone(),
                    return_type: sig.ret.clone(),
                    params: sig.params.iter().map(|p| (p.ty.clone(), p.name.clone())).collect(),
                });
            }
        }
        Ok(module)
    }

    fn collect_signature(&mut self, node: &TypedNode) {
        let ret = node
            .child_of(NodeKind::DeclType)
            .map(|t| t.text.clone())
            .unwrap_or_else(|| "U0".to_string());
        let imported = node
            .children
            .iter()
            .any(|c| c.kind == NodeKind::DeclSpec && matches!(c.text.as_str(), "import" | "_import"));
        let has_body = node.child_of(NodeKind::Block).is_some();
        let mut params = Vec::new();
        if let Some(list) = node.child_of(NodeKind::ParamList) {
            for param in &list.children {
                let ty = param
                    .child_of(NodeKind::DeclType)
                    .map(|t| t.text.clone())
                    .unwrap_or_else(|| "I64".to_string());
                let default = param
                    .child_of(NodeKind::Default)
                    .and_then(|d| d.children.first())
                    .cloned();
                params.push(LoweredParam { ty, name: param.text.clone(), default, builtin_default: false });
            }
        }
        let entry = self.functions.entry(node.text.clone()).or_insert(LoweredSig {
            ret,
            params: Vec::new(),
            imported,
            has_body: false,
        });
        entry.params = params;
        entry.has_body |= has_body;
        entry.imported |= imported;
    }

    fn lookup_sig(&mut self, name: &str) -> Option<LoweredSig> {
        if let Some(sig) = self.functions.get(name) {
            return Some(sig.clone());
        }
        let b = builtins::builtin_fn(name)?;
        let sig = LoweredSig {
            ret: b.ret.to_string(),
            params: b
                .params
                .iter()
                .map(|p| LoweredParam {
                    ty: p.ty.to_string(),
                    name: p.name.to_string(),
                    default: None,
                    builtin_default: p.has_default,
                })
                .collect(),
            imported: true,
            has_body: true, // runtime declares are emitted unconditionally
        };
        self.functions.insert(name.to_string(), sig.clone());
        Some(sig)
    }

    fn lower_class(&mut self, node: &TypedNode, module: &mut HirModule) -> Result<(), Diagnostic> {
        let is_union = node.children.iter().any(|c| c.kind == NodeKind::DeclSpec && c.text == "union");
        module.top_level_items.push(HirStmt::MetadataDecl {
            name: node.text.clone(),
            payload: if is_union { "union".to_string() } else { "class".to_string() },
        });
        module.aggregates.push(HirAggregate { name: node.text.clone(), is_union });
        for field in node.children.iter().filter(|c| c.kind == NodeKind::FieldDecl) {
            let ty = field
                .child_of(NodeKind::DeclType)
                .map(|t| t.text.clone())
                .unwrap_or_else(|| "I64".to_string());
            let annotations = field
                .child_of(NodeKind::FieldMetaTokens)
                .map(|m| m.text.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default();
            module.reflection.fields.push(HirReflectionField {
                aggregate: node.text.clone(),
                field: field.text.clone(),
                ty,
                annotations,
            });
        }
        for decl in node.children.iter().filter(|c| c.kind == NodeKind::VarDecl) {
            module.top_level_items.push(self.lower_var_decl(decl, true)?);
        }
        Ok(())
    }

    fn lower_linkage(&mut self, node: &TypedNode) -> HirStmt {
        let ty = node
            .child_of(NodeKind::DeclType)
            .map(|t| t.text.clone())
            .unwrap_or_else(|| "I64".to_string());
        HirStmt::LinkageDecl { name: node.text.clone(), ty }
    }

    fn lower_function(&mut self, node: &TypedNode) -> Result<HirFunction, Diagnostic> {
        let sig = self.functions.get(&node.text).cloned().expect("collected");
        let is_static = node
            .children
            .iter()
            .any(|c| c.kind == NodeKind::DeclSpec && c.text == "static");
        let body = node.child_of(NodeKind::Block).expect("has body").clone();
        let stmts = self.lower_body(&body)?;
        Ok(HirFunction {
            name: node.text.clone(),
            return_type: sig.ret.clone(),
            linkage: if is_static { LinkageKind::Internal } else { LinkageKind::External },
            params: sig.params.iter().map(|p| (p.ty.clone(), p.name.clone())).collect(),
            body: stmts,
        })
    }

    fn lower_body(&mut self, block: &TypedNode) -> Result<Vec<HirStmt>, Diagnostic> {
        let mut stmts = Vec::new();
        for child in &block.children {
            stmts.extend(self.lower_stmt(child)?);
        }
        Ok(stmts)
    }

    /// Lower a statement node into zero or more HIR statements.
    fn lower_stmt(&mut self, node: &TypedNode) -> Result<Vec<HirStmt>, Diagnostic> {
        match node.kind {
            NodeKind::EmptyStmt => Ok(vec![]),
            NodeKind::Block => self.lower_body(node),
            NodeKind::VarDecl => Ok(vec![self.lower_var_decl(node, false)?]),
            NodeKind::VarDeclList => {
                let mut out = Vec::new();
                for decl in &node.children {
                    out.push(self.lower_var_decl(decl, false)?);
                }
                Ok(out)
            }
            NodeKind::LinkageDecl => Ok(vec![self.lower_linkage(node)]),
            NodeKind::ReturnStmt => {
                let value = match node.children.first() {
                    Some(v) => Some(self.lower_expr(v)?),
                    None => None,
                };
                Ok(vec![HirStmt::Return { value }])
            }
            NodeKind::BreakStmt => Ok(vec![HirStmt::Break]),
            NodeKind::LabelStmt => Ok(vec![HirStmt::Label { name: node.text.clone() }]),
            NodeKind::GotoStmt => Ok(vec![HirStmt::Goto { name: node.text.clone() }]),
            NodeKind::StartLabel | NodeKind::EndLabel => Ok(vec![HirStmt::MetadataDecl {
                name: node.text.clone(),
                payload: String::new(),
            }]),
            NodeKind::IfStmt => {
                let cond = self.lower_expr(&node.children[0])?;
                let then_body = self.lower_stmt_as_body(&node.children[1])?;
                let else_body = match node.children.get(2) {
                    Some(e) => self.lower_stmt_as_body(e)?,
                    None => vec![],
                };
                Ok(vec![HirStmt::If { cond, then_body, else_body }])
            }
            NodeKind::WhileStmt => {
                let cond = self.lower_expr(&node.children[0])?;
                let body = self.lower_stmt_as_body(&node.children[1])?;
                Ok(vec![HirStmt::While { cond, body }])
            }
            NodeKind::DoWhileStmt => {
                let body = self.lower_stmt_as_body(&node.children[0])?;
                let cond = self.lower_expr(&node.children[1])?;
                Ok(vec![HirStmt::DoWhile { cond, body }])
            }
            NodeKind::ForStmt => {
                // for(init; cond; inc) body => init; while(cond) { body; inc }
                let mut out = self.lower_stmt(&node.children[0])?;
                let cond = if node.children[1].kind == NodeKind::EmptyArg {
                    HirExpr::int(1)
                } else {
                    self.lower_expr(&node.children[1])?
                };
                let mut body = self.lower_stmt_as_body(&node.children[3])?;
                body.extend(self.lower_stmt(&node.children[2])?);
                out.push(HirStmt::While { cond, body });
                Ok(out)
            }
            NodeKind::SwitchStmt => self.lower_switch(node),
            NodeKind::TryStmt => {
                let region = self.next_region;
                self.next_region += 1;
                self.region_stack.push(region);
                let body = self.lower_stmt_as_body(&node.children[0])?;
                self.region_stack.pop();
                // The catch block lowers with the parent region on top so
                // a rethrow propagates outward.
                let catch = self.lower_stmt_as_body(&node.children[1])?;
                Ok(vec![HirStmt::TryCatch { region, body, catch }])
            }
            NodeKind::ThrowStmt => {
                let payload = self.lower_expr(&node.children[0])?;
                let region = self.region_stack.last().copied().unwrap_or(-1);
                Ok(vec![HirStmt::Throw { payload, exception_region: region }])
            }
            NodeKind::LockStmt => {
                let body = self.lower_stmt_as_body(&node.children[0])?;
                Ok(vec![HirStmt::Lock { body }])
            }
            NodeKind::AsmStmt => {
                let mut constraints = Vec::new();
                let mut operands = Vec::new();
                for arg in node.children.iter().filter(|c| c.kind == NodeKind::AsmArg) {
                    constraints.push(arg.text.clone());
                    match arg.children.first() {
                        Some(expr) => operands.push(Some(self.lower_expr(expr)?)),
                        None => operands.push(None),
                    }
                }
                Ok(vec![HirStmt::InlineAsm {
                    template: node.text.clone(),
                    constraints,
                    operands,
                }])
            }
            NodeKind::PrintStmt => self.lower_print(node),
            NodeKind::NoParenCallStmt => {
                if let Some(sig) = self.lookup_sig(&node.text) {
                    if !self.decl_order.contains(&node.text) && !self.functions[&node.text].has_body {
                        self.decl_order.push(node.text.clone());
                    }
                    if !sig.params.is_empty() {
                        // Defaults materialize exactly as at a written
                        // call site.
                        let mut args: Vec<HirExpr> = Vec::new();
                        for (i, param) in sig.params.iter().enumerate() {
                            let arg = self.materialize_default(node, &node.text, param, i, &args)?;
                            args.push(arg);
                        }
                        let call = HirExpr::new(HirExprKind::Call, node.text.clone(), sig.ret.clone())
                            .with_children(args);
                        return Ok(vec![HirStmt::Expr { expr: call }]);
                    }
                    Ok(vec![HirStmt::NoParenCall { name: node.text.clone() }])
                } else {
                    Ok(vec![HirStmt::Expr {
                        expr: HirExpr::new(HirExprKind::Var, node.text.clone(), "I64"),
                    }])
                }
            }
            NodeKind::ExprStmt => {
                let expr = &node.children[0];
                if expr.kind == NodeKind::AssignExpr {
                    let target = self.lower_expr(&expr.children[0])?;
                    let value = self.lower_expr(&expr.children[1])?;
                    Ok(vec![HirStmt::Assign { op: expr.text.clone(), target, value }])
                } else {
                    Ok(vec![HirStmt::Expr { expr: self.lower_expr(expr)? }])
                }
            }
            NodeKind::ClassDecl | NodeKind::TypeAliasDecl => {
                // Nested aggregate declarations contribute metadata only;
                // handled in run() for the top level.
                Err(self.err("HC4003", node, "aggregate declarations must appear at the top level"))
            }
            _ => Err(self.err(
                "HC4003",
                node,
                format!("statement shape {} cannot be lowered", node.kind.name()),
            )),
        }
    }

    fn lower_stmt_as_body(&mut self, node: &TypedNode) -> Result<Vec<HirStmt>, Diagnostic> {
        if node.kind == NodeKind::Block {
            self.lower_body(node)
        } else {
            self.lower_stmt(node)
        }
    }

    fn lower_var_decl(&mut self, node: &TypedNode, global: bool) -> Result<HirStmt, Diagnostic> {
        let ty = node
            .child_of(NodeKind::DeclType)
            .map(|t| t.text.clone())
            .unwrap_or_else(|| "I64".to_string());
        let is_static = node
            .children
            .iter()
            .any(|c| c.kind == NodeKind::DeclSpec && c.text == "static");
        let storage = match (global, is_static) {
            (true, true) => StorageClass::StaticGlobal,
            (true, false) => StorageClass::Global,
            (false, true) => StorageClass::StaticLocal,
            (false, false) => StorageClass::Local,
        };
        let init_node = node
            .children
            .iter()
            .find(|c| !matches!(c.kind, NodeKind::DeclSpec | NodeKind::DeclType));
        let init = match init_node {
            Some(expr) => Some(self.lower_expr(expr)?),
            None => None,
        };
        let const_init = init.as_ref().map(is_const_expr).unwrap_or(false);
        Ok(HirStmt::VarDecl { name: node.text.clone(), ty, init, storage, const_init })
    }

    fn lower_switch(&mut self, node: &TypedNode) -> Result<Vec<HirStmt>, Diagnostic> {
        let cond = self.lower_expr(&node.children[0])?;
        let mut cases: Vec<SwitchCase> = Vec::new();
        let mut prev_end: Option<HirExpr> = None;

        for clause in &node.children[1..] {
            match clause.kind {
                NodeKind::CaseClause => {
                    let (flags, begin, end, body_start) = match clause.text.as_str() {
                        "null" => {
                            // Chained: previous case end + 1, starting at 0.
                            let begin = match prev_end.clone() {
                                Some(prev) => HirExpr::new(HirExprKind::Binary, "+", "I64")
                                    .with_children(vec![prev, HirExpr::int(1)]),
                                None => HirExpr::int(0),
                            };
                            (CASE_FLAG_NULL, Some(begin), None, 0usize)
                        }
                        "range" => {
                            let lo = self.lower_expr(&clause.children[0])?;
                            let hi = self.lower_expr(&clause.children[1])?;
                            (CASE_FLAG_RANGE, Some(lo), Some(hi), 2usize)
                        }
                        _ => {
                            let value = self.lower_expr(&clause.children[0])?;
                            (0u8, Some(value), None, 1usize)
                        }
                    };
                    prev_end = end.clone().or_else(|| begin.clone());
                    let mut body = Vec::new();
                    for stmt in &clause.children[body_start..] {
                        body.extend(self.lower_stmt(stmt)?);
                    }
                    cases.push(SwitchCase { flags, begin, end, body });
                }
                NodeKind::DefaultClause => {
                    let mut body = Vec::new();
                    for stmt in &clause.children {
                        body.extend(self.lower_stmt(stmt)?);
                    }
                    cases.push(SwitchCase { flags: CASE_FLAG_DEFAULT, begin: None, end: None, body });
                }
                NodeKind::StartLabel | NodeKind::EndLabel => {}
                _ => {
                    return Err(self.err("HC4003", clause, "unexpected node inside switch"));
                }
            }
        }
        Ok(vec![HirStmt::Switch { cond, cases }])
    }

    fn lower_print(&mut self, node: &TypedNode) -> Result<Vec<HirStmt>, Diagnostic> {
        let first = &node.children[0];
        let is_empty_literal = first.kind == NodeKind::Literal
            && first.text.starts_with('"')
            && lexer::literal_inner(&first.text).is_empty();

        if is_empty_literal && node.children.len() > 1 {
            // Dynamic format forwarding.
            let format = self.lower_expr(&node.children[1])?;
            let mut args = Vec::new();
            for arg in &node.children[2..] {
                args.push(self.lower_expr(arg)?);
            }
            return Ok(vec![HirStmt::Print { format, args }]);
        }

        let format = self.lower_expr(first)?;
        let mut args = Vec::new();
        for arg in &node.children[1..] {
            args.push(self.lower_expr(arg)?);
        }
        Ok(vec![HirStmt::Print { format, args }])
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn lower_expr(&mut self, node: &TypedNode) -> Result<HirExpr, Diagnostic> {
        let ty = if node.ty.is_empty() { "Unknown".to_string() } else { node.ty.clone() };
        match node.kind {
            NodeKind::Literal => {
                let (kind, ty) = if node.text.starts_with('"') {
                    (HirExprKind::StringLiteral, "U8*".to_string())
                } else if node.text.starts_with('\'') {
                    (HirExprKind::CharLiteral, "I64".to_string())
                } else if node.text.contains('.') {
                    (HirExprKind::FloatLiteral, "F64".to_string())
                } else {
                    (HirExprKind::IntLiteral, if node.ty.is_empty() { "I64".to_string() } else { node.ty.clone() })
                };
                Ok(HirExpr::new(kind, node.text.clone(), ty))
            }
            NodeKind::Identifier => Ok(HirExpr::new(HirExprKind::Var, node.text.clone(), ty)),
            NodeKind::DollarExpr => Ok(HirExpr::new(HirExprKind::Dollar, "$", "I64")),
            NodeKind::UnaryExpr => {
                let child = self.lower_expr(&node.children[0])?;
                Ok(HirExpr::new(HirExprKind::Unary, node.text.clone(), ty).with_children(vec![child]))
            }
            NodeKind::PostfixExpr => {
                let child = self.lower_expr(&node.children[0])?;
                Ok(HirExpr::new(HirExprKind::Postfix, node.text.clone(), ty).with_children(vec![child]))
            }
            NodeKind::BinaryExpr => {
                let lhs = self.lower_expr(&node.children[0])?;
                let rhs = self.lower_expr(&node.children[1])?;
                Ok(HirExpr::new(HirExprKind::Binary, node.text.clone(), ty).with_children(vec![lhs, rhs]))
            }
            NodeKind::AssignExpr => {
                let lhs = self.lower_expr(&node.children[0])?;
                let rhs = self.lower_expr(&node.children[1])?;
                Ok(HirExpr::new(HirExprKind::Assign, node.text.clone(), ty).with_children(vec![lhs, rhs]))
            }
            NodeKind::CastExpr => {
                let child = self.lower_expr(&node.children[0])?;
                Ok(HirExpr::new(HirExprKind::Cast, node.text.clone(), ty).with_children(vec![child]))
            }
            NodeKind::CommaExpr => {
                let mut children = Vec::new();
                for child in &node.children {
                    children.push(self.lower_expr(child)?);
                }
                Ok(HirExpr::new(HirExprKind::Comma, "", ty).with_children(children))
            }
            NodeKind::LaneExpr => {
                let base = self.lower_expr(&node.children[0])?;
                let index = self.lower_expr(&node.children[1])?;
                Ok(HirExpr::new(HirExprKind::Lane, node.text.clone(), ty).with_children(vec![base, index]))
            }
            NodeKind::MemberExpr => {
                let base = self.lower_expr(&node.children[0])?;
                Ok(HirExpr::new(HirExprKind::Member, node.text.clone(), ty).with_children(vec![base]))
            }
            NodeKind::IndexExpr => {
                let base = self.lower_expr(&node.children[0])?;
                let index = self.lower_expr(&node.children[1])?;
                Ok(HirExpr::new(HirExprKind::Index, "", ty).with_children(vec![base, index]))
            }
            NodeKind::CallExpr => self.lower_call(node),
            NodeKind::EmptyArg => Err(self.err("HC4003", node, "stray empty argument")),
            _ => Err(self.err(
                "HC4003",
                node,
                format!("expression shape {} cannot be lowered", node.kind.name()),
            )),
        }
    }

    fn lower_call(&mut self, node: &TypedNode) -> Result<HirExpr, Diagnostic> {
        let callee = &node.children[0];
        let args_node = &node.children[1];
        let ty = if node.ty.is_empty() { "I64".to_string() } else { node.ty.clone() };

        // Direct calls: a known function name, or an unknown identifier
        // whose type does not look like a function pointer (those get a
        // signature synthesized from the call site).
        let direct_name = if callee.kind == NodeKind::Identifier {
            if callee.ty.starts_with("fn ") {
                Some(callee.text.clone())
            } else if sema::is_unknown(&callee.ty) && !callee.ty.contains('*') {
                Some(callee.text.clone())
            } else {
                None
            }
        } else {
            None
        };

        if let Some(name) = direct_name {
            let has_empty = args_node.children.iter().any(|a| a.kind == NodeKind::EmptyArg);
            let sig = match self.lookup_sig(&name) {
                Some(sig) => sig,
                None => {
                    // Synthesize a signature from the call site.
                    if has_empty {
                        return Err(self.err(
                            "HC4001",
                            node,
                            format!("call to unknown function '{}' cannot use defaulted arguments", name),
                        ));
                    }
                    let params = args_node
                        .children
                        .iter()
                        .enumerate()
                        .map(|(i, a)| LoweredParam {
                            ty: if a.ty.is_empty() || sema::is_unknown(&a.ty) { "I64".to_string() } else { a.ty.clone() },
                            name: format!("a{}", i),
                            default: None,
                            builtin_default: false,
                        })
                        .collect();
                    let sig = LoweredSig { ret: "I64".to_string(), params, imported: true, has_body: false };
                    self.functions.insert(name.clone(), sig.clone());
                    self.decl_order.push(name.clone());
                    sig
                }
            };
            if sig.imported && !sig.has_body && !self.decl_order.contains(&name) {
                self.decl_order.push(name.clone());
            }

            let mut lowered_args = Vec::new();
            for (i, param) in sig.params.iter().enumerate() {
                let provided = args_node.children.get(i);
                let use_default = match provided {
                    Some(arg) => arg.kind == NodeKind::EmptyArg,
                    None => true,
                };
                if !use_default {
                    lowered_args.push(self.lower_expr(provided.unwrap())?);
                    continue;
                }
                lowered_args.push(self.materialize_default(node, &name, param, i, &lowered_args)?);
            }
            // Extra positional args beyond the signature (synthesized
            // signatures grow from the first call site) pass through.
            for extra in args_node.children.iter().skip(sig.params.len()) {
                if extra.kind != NodeKind::EmptyArg {
                    lowered_args.push(self.lower_expr(extra)?);
                }
            }
            return Ok(HirExpr::new(HirExprKind::Call, name, ty).with_children(lowered_args));
        }

        // Indirect call: first child is the callee value.
        let mut children = vec![self.lower_expr(callee)?];
        for arg in &args_node.children {
            if arg.kind == NodeKind::EmptyArg {
                return Err(self.err("HC4001", node, "indirect calls cannot use defaulted arguments"));
            }
            children.push(self.lower_expr(arg)?);
        }
        Ok(HirExpr::new(HirExprKind::Call, "", ty).with_children(children))
    }

    /// Produce the value for an omitted argument: the parameter's default
    /// expression lowered inline, with `lastclass` resolving to the
    /// normalized aggregate name of the previous argument's type.
    fn materialize_default(
        &mut self,
        site: &TypedNode,
        fn_name: &str,
        param: &LoweredParam,
        index: usize,
        lowered_args: &[HirExpr],
    ) -> Result<HirExpr, Diagnostic> {
        if let Some(default) = param.default.clone() {
            if default.kind == NodeKind::Identifier && default.text == "lastclass" {
                let prev = lowered_args.last().ok_or_else(|| {
                    self.err(
                        "HC4002",
                        site,
                        format!("'lastclass' default of '{}' needs a preceding argument", fn_name),
                    )
                })?;
                let name = normalized_aggregate_name(&prev.ty);
                return Ok(HirExpr::new(HirExprKind::StringLiteral, format!("\"{}\"", name), "U8*"));
            }
            return self.lower_default_expr(&default);
        }
        if param.builtin_default {
            return Ok(HirExpr::new(HirExprKind::IntLiteral, "0", param.ty.clone()));
        }
        Err(self.err(
            "HC4001",
            site,
            format!("argument {} of '{}' has no default value", index + 1, fn_name),
        ))
    }

    /// Default expressions come through sema unanalyzed; literals type
    /// themselves, identifiers resolve later against globals/builtins.
    fn lower_default_expr(&mut self, node: &TypedNode) -> Result<HirExpr, Diagnostic> {
        match node.kind {
            NodeKind::Literal => {
                let (kind, ty) = if node.text.starts_with('"') {
                    (HirExprKind::StringLiteral, "U8*")
                } else if node.text.starts_with('\'') {
                    (HirExprKind::CharLiteral, "I64")
                } else if node.text.contains('.') {
                    (HirExprKind::FloatLiteral, "F64")
                } else {
                    (HirExprKind::IntLiteral, "I64")
                };
                Ok(HirExpr::new(kind, node.text.clone(), ty))
            }
            NodeKind::Identifier => Ok(HirExpr::new(HirExprKind::Var, node.text.clone(), "Unknown")),
            NodeKind::UnaryExpr | NodeKind::BinaryExpr | NodeKind::CastExpr | NodeKind::CommaExpr => {
                let kind = match node.kind {
                    NodeKind::UnaryExpr => HirExprKind::Unary,
                    NodeKind::BinaryExpr => HirExprKind::Binary,
                    NodeKind::CastExpr => HirExprKind::Cast,
                    _ => HirExprKind::Comma,
                };
                let mut children = Vec::new();
                for child in &node.children {
                    children.push(self.lower_default_expr(child)?);
                }
                let ty = if node.kind == NodeKind::CastExpr { node.text.clone() } else { "Unknown".to_string() };
                Ok(HirExpr::new(kind, node.text.clone(), ty).with_children(children))
            }
            _ => Err(self.err("HC4003", node, "unsupported default expression shape")),
        }
    }
}

/// Strip pointer markers to get the aggregate name `lastclass` reports.
fn normalized_aggregate_name(ty: &str) -> String {
    let mut base = ty;
    while let Some(stripped) = base.strip_suffix('*') {
        base = stripped;
    }
    base.to_string()
}

/// Constant initializers: literals, and unary/binary/cast/comma trees of
/// constants.
fn is_const_expr(expr: &HirExpr) -> bool {
    match expr.kind {
        HirExprKind::IntLiteral | HirExprKind::FloatLiteral | HirExprKind::CharLiteral | HirExprKind::StringLiteral => true,
        HirExprKind::Unary | HirExprKind::Binary | HirExprKind::Cast | HirExprKind::Comma => {
            expr.children.iter().all(is_const_expr)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::sema::{analyze, SemaOptions};

    fn lower_src(src: &str) -> HirModule {
        let parsed = Parser::parse_source(src, "t.HC").unwrap();
        let typed = analyze(&parsed, "t.HC", SemaOptions::default()).unwrap();
        lower(&typed, "t.HC").unwrap()
    }

    fn main_body(src: &str) -> Vec<HirStmt> {
        let module = lower_src(src);
        module.functions.into_iter().find(|f| f.name == "Main").unwrap().body
    }

    #[test]
    fn test_for_lowers_to_while() {
        let body = main_body("I64 Main() { I64 i; for (i = 0; i < 3; i++) { } return i; }");
        assert!(body.iter().any(|s| matches!(s, HirStmt::While { .. })));
        if let Some(HirStmt::While { body: wb, .. }) = body.iter().find(|s| matches!(s, HirStmt::While { .. })) {
            // Increment lands at the end of the loop body.
            assert!(matches!(wb.last(), Some(HirStmt::Expr { .. })));
        }
    }

    #[test]
    fn test_for_without_cond_uses_one() {
        let body = main_body("I64 Main() { for (;;) break; return 0; }");
        if let Some(HirStmt::While { cond, .. }) = body.iter().find(|s| matches!(s, HirStmt::While { .. })) {
            assert_eq!(cond.text, "1");
        } else {
            panic!("expected while");
        }
    }

    #[test]
    fn test_switch_null_case_chains() {
        let body = main_body(
            "I64 Main() { I64 x = 1; switch (x) { case 0: return 10; case: return 20; default: return 99; } }",
        );
        let switch = body.iter().find(|s| matches!(s, HirStmt::Switch { .. })).unwrap();
        if let HirStmt::Switch { cases, .. } = switch {
            assert_eq!(cases.len(), 3);
            assert_eq!(cases[0].flags, 0);
            assert_eq!(cases[1].flags, CASE_FLAG_NULL);
            // begin of the null case is previous end + 1
            let begin = cases[1].begin.as_ref().unwrap();
            assert_eq!(begin.kind, HirExprKind::Binary);
            assert_eq!(begin.text, "+");
            assert_eq!(begin.children[0].text, "0");
            assert_eq!(begin.children[1].text, "1");
            assert_eq!(cases[2].flags, CASE_FLAG_DEFAULT);
        }
    }

    #[test]
    fn test_switch_range_case() {
        let body = main_body("I64 Main() { I64 x = 3; switch (x) { case 2...5: return 1; } return 0; }");
        if let Some(HirStmt::Switch { cases, .. }) = body.iter().find(|s| matches!(s, HirStmt::Switch { .. })) {
            assert_eq!(cases[0].flags, CASE_FLAG_RANGE);
            assert!(cases[0].begin.is_some() && cases[0].end.is_some());
        } else {
            panic!("expected switch");
        }
    }

    #[test]
    fn test_try_regions_nest() {
        let body = main_body(
            "I64 Main() { try { try { throw(7); } catch { throw(8); } } catch { return 1; } return 0; }",
        );
        if let Some(HirStmt::TryCatch { region, body: tb, .. }) =
            body.iter().find(|s| matches!(s, HirStmt::TryCatch { .. }))
        {
            assert_eq!(*region, 1);
            if let Some(HirStmt::TryCatch { region: inner, body: ib, catch: ic }) =
                tb.iter().find(|s| matches!(s, HirStmt::TryCatch { .. }))
            {
                assert_eq!(*inner, 2);
                // Inner throw targets the inner region.
                if let Some(HirStmt::Throw { exception_region, .. }) = ib.first() {
                    assert_eq!(*exception_region, 2);
                }
                // The rethrow in the catch targets the outer region.
                if let Some(HirStmt::Throw { exception_region, .. }) = ic.first() {
                    assert_eq!(*exception_region, 1);
                }
            } else {
                panic!("expected nested try");
            }
        } else {
            panic!("expected try");
        }
    }

    #[test]
    fn test_throw_outside_try_region() {
        let body = main_body("I64 Main() { throw(3); return 0; }");
        if let Some(HirStmt::Throw { exception_region, .. }) = body.first() {
            assert_eq!(*exception_region, -1);
        } else {
            panic!("expected throw");
        }
    }

    #[test]
    fn test_default_arg_materialized() {
        let module = lower_src("I64 G(I64 a, I64 b=7) { return a+b; } I64 Main() { return G(1); }");
        let main = module.functions.iter().find(|f| f.name == "Main").unwrap();
        if let HirStmt::Return { value: Some(call) } = &main.body[0] {
            assert_eq!(call.kind, HirExprKind::Call);
            assert_eq!(call.children.len(), 2);
            assert_eq!(call.children[1].text, "7");
        } else {
            panic!("expected return of call");
        }
    }

    #[test]
    fn test_empty_arg_pulls_default() {
        let module = lower_src("I64 G(I64 a=5, I64 b=7) { return a+b; } I64 Main() { return G(,9); }");
        let main = module.functions.iter().find(|f| f.name == "Main").unwrap();
        if let HirStmt::Return { value: Some(call) } = &main.body[0] {
            assert_eq!(call.children[0].text, "5");
            assert_eq!(call.children[1].text, "9");
        } else {
            panic!("expected return of call");
        }
    }

    #[test]
    fn test_lastclass_resolves_to_aggregate_name() {
        let module = lower_src("U0 Show(U8 *name, U8 *ty=lastclass) { } I64 Main() { I64 x = 0; Show(&x); return 0; }");
        let main = module.functions.iter().find(|f| f.name == "Main").unwrap();
        let call = main
            .body
            .iter()
            .find_map(|s| match s {
                HirStmt::Expr { expr } if expr.kind == HirExprKind::Call => Some(expr),
                _ => None,
            })
            .unwrap();
        assert_eq!(call.children.len(), 2);
        assert_eq!(call.children[1].kind, HirExprKind::StringLiteral);
        assert_eq!(call.children[1].text, "\"I64\"");
    }

    #[test]
    fn test_unknown_callee_synthesized() {
        let module = lower_src("I64 Main() { return Mystery(1, 2); }");
        let decl = module.function_decls.iter().find(|d| d.name == "Mystery").unwrap();
        assert_eq!(decl.params.len(), 2);
        assert_eq!(decl.return_type, "I64");
    }

    #[test]
    fn test_class_reflection_rows() {
        let module = lower_src("class CPt { I64 x; I64 y fmt \"%x\"; };");
        assert_eq!(module.reflection.fields.len(), 2);
        assert_eq!(module.reflection.fields[0].aggregate, "CPt");
        assert_eq!(module.reflection.fields[1].annotations, vec!["fmt", "\"%x\""]);
        assert!(module
            .top_level_items
            .iter()
            .any(|s| matches!(s, HirStmt::MetadataDecl { name, .. } if name == "CPt")));
    }

    #[test]
    fn test_typedef_metadata_and_alias() {
        let module = lower_src("typedef I64 TInt;");
        assert!(module
            .top_level_items
            .iter()
            .any(|s| matches!(s, HirStmt::MetadataDecl { name, payload } if name == "typedef" && payload.contains("TInt"))));
        assert_eq!(module.reflection.aliases.len(), 1);
    }

    #[test]
    fn test_storage_classes() {
        let module = lower_src("I64 g = 1; static I64 sg = 2; U0 F() { I64 l; static I64 sl; }");
        let storages: Vec<StorageClass> = module
            .top_level_items
            .iter()
            .filter_map(|s| match s {
                HirStmt::VarDecl { storage, .. } => Some(*storage),
                _ => None,
            })
            .collect();
        assert_eq!(storages, vec![StorageClass::Global, StorageClass::StaticGlobal]);
        let f = module.functions.iter().find(|f| f.name == "F").unwrap();
        let locals: Vec<StorageClass> = f
            .body
            .iter()
            .filter_map(|s| match s {
                HirStmt::VarDecl { storage, .. } => Some(*storage),
                _ => None,
            })
            .collect();
        assert_eq!(locals, vec![StorageClass::Local, StorageClass::StaticLocal]);
    }

    #[test]
    fn test_const_init_detection() {
        let module = lower_src("I64 a = 2 + 3; U0 F(I64 p) { I64 b = p + 1; }");
        if let HirStmt::VarDecl { const_init, .. } = &module.top_level_items[0] {
            assert!(*const_init);
        }
        let f = module.functions.iter().find(|f| f.name == "F").unwrap();
        if let HirStmt::VarDecl { const_init, .. } = &f.body[0] {
            assert!(!*const_init);
        }
    }

    #[test]
    fn test_dynamic_print_forwarding() {
        let module = lower_src("U0 F(U8 *fmt) { \"\", fmt, 1; }");
        let f = module.functions.iter().find(|f| f.name == "F").unwrap();
        if let HirStmt::Print { format, args } = &f.body[0] {
            assert_eq!(format.kind, HirExprKind::Var);
            assert_eq!(args.len(), 1);
        } else {
            panic!("expected print");
        }
    }

    #[test]
    fn test_static_function_internal_linkage() {
        let module = lower_src("static I64 Helper() { return 1; } I64 Main() { return Helper(); }");
        let helper = module.functions.iter().find(|f| f.name == "Helper").unwrap();
        assert_eq!(helper.linkage, LinkageKind::Internal);
    }

    #[test]
    fn test_assignment_statement_shape() {
        let body = main_body("I64 Main() { I64 x; x = 3; x += 2; return x; }");
        let assigns: Vec<&str> = body
            .iter()
            .filter_map(|s| match s {
                HirStmt::Assign { op, .. } => Some(op.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(assigns, vec!["=", "+="]);
    }

    #[test]
    fn test_builtin_spawn_defaults_filled() {
        let body = main_body("U0 W(I64 a) { } I64 Main() { return Spawn(&W); }");
        if let Some(HirStmt::Return { value: Some(call) }) = body.first() {
            assert_eq!(call.text, "Spawn");
            assert_eq!(call.children.len(), 3);
            assert_eq!(call.children[1].text, "0");
            assert_eq!(call.children[2].text, "0");
        } else {
            panic!("expected spawn call");
        }
    }
}
