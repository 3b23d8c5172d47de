//! Semantic analysis: scopes, types, and shape checks.
//!
//! Consumes the untyped tree and produces a `TypedNode` tree in which
//! every expression carries its HolyC type string. Also enforces the
//! declaration rules (unique definitions, import linkage, aggregate
//! layout, label/goto legality, print-format and inline-asm contracts,
//! strict-mode modifier rejection).

use crate::ast::{NodeKind, ParsedNode, TypedNode};
use crate::builtins;
use crate::diag::Diagnostic;
use crate::lexer;
use std::collections::{HashMap, HashSet};

/// Analyzer configuration. Strict mode (the default) rejects the HolyC
/// compatibility modifiers; permissive mode strips them silently.
#[derive(Debug, Clone, Copy)]
pub struct SemaOptions {
    pub strict: bool,
}

impl Default for SemaOptions {
    fn default() -> Self {
        SemaOptions { strict: true }
    }
}

/// Modifiers rejected in strict mode, each with its own code.
const STRICT_REJECTED: &[(&str, &'static str)] = &[
    ("public", "HC3050"),
    ("interrupt", "HC3051"),
    ("noreg", "HC3052"),
    ("reg", "HC3053"),
    ("no_warn", "HC3054"),
    ("_extern", "HC3055"),
    ("_import", "HC3056"),
    ("_export", "HC3057"),
];

// ======================================================================
// Type string helpers (shared with lowering and emission)
// ======================================================================

pub fn is_pointer(ty: &str) -> bool {
    ty.ends_with('*')
}

pub fn strip_pointer(ty: &str) -> &str {
    ty.strip_suffix('*').unwrap_or(ty)
}

pub fn is_integral(ty: &str) -> bool {
    matches!(ty, "I8" | "U8" | "I16" | "U16" | "I32" | "U32" | "I64" | "U64" | "Bool" | "Bool(chained)")
}

pub fn is_unsigned(ty: &str) -> bool {
    matches!(ty, "U8" | "U16" | "U32" | "U64" | "Bool" | "Bool(chained)")
}

pub fn is_float(ty: &str) -> bool {
    ty == "F64"
}

pub fn is_numeric(ty: &str) -> bool {
    is_integral(ty) || is_float(ty)
}

pub fn is_unknown(ty: &str) -> bool {
    ty == "Unknown"
}

/// Scalar: usable as a condition or logical operand.
pub fn is_scalar(ty: &str) -> bool {
    is_numeric(ty) || is_pointer(ty) || is_unknown(ty)
}

/// Bit width of an integral type (Bool counts as one bit).
pub fn int_width(ty: &str) -> usize {
    match ty {
        "Bool" | "Bool(chained)" => 1,
        "I8" | "U8" => 8,
        "I16" | "U16" => 16,
        "I32" | "U32" => 32,
        _ => 64,
    }
}

/// Size estimate in bytes used for aggregate layout and pointer math.
pub fn size_of_scalar(ty: &str) -> usize {
    match ty {
        "Bool" | "I8" | "U8" => 1,
        "I16" | "U16" => 2,
        "I32" | "U32" => 4,
        _ => 8,
    }
}

/// Integer promotion: either side unsigned pulls the result to U64,
/// otherwise I64. A float operand promotes to F64.
pub fn promote(a: &str, b: &str) -> String {
    if is_float(a) || is_float(b) {
        return "F64".to_string();
    }
    if is_unsigned(a) || is_unsigned(b) {
        "U64".to_string()
    } else {
        "I64".to_string()
    }
}

/// Implicit convertibility: numeric to numeric, pointer to integral and
/// back, same-kind, or either side unknown.
pub fn convertible(from: &str, to: &str) -> bool {
    if is_unknown(from) || is_unknown(to) {
        return true;
    }
    // Function designators decay to code pointers.
    if from.starts_with("fn ") {
        return is_pointer(to) || is_integral(to) || from == to;
    }
    let from = if from == "Bool(chained)" { "Bool" } else { from };
    if from == to {
        return true;
    }
    if is_numeric(from) && is_numeric(to) {
        return true;
    }
    if (is_pointer(from) && is_integral(to)) || (is_integral(from) && is_pointer(to)) {
        return true;
    }
    if is_pointer(from) && is_pointer(to) {
        return true;
    }
    false
}

// ======================================================================
// Symbol information
// ======================================================================

/// One field of an aggregate layout.
#[derive(Debug, Clone)]
pub struct FieldLayout {
    pub name: String,
    pub ty: String,
    pub offset: usize,
    pub size: usize,
    pub meta: String,
}

/// Layout of a class or union: structs stack fields in declaration
/// order with no padding, unions share offset 0 and take the max size.
#[derive(Debug, Clone)]
pub struct ClassLayout {
    pub name: String,
    pub is_union: bool,
    pub fields: Vec<FieldLayout>,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct ParamSig {
    pub ty: String,
    pub name: String,
    pub has_default: bool,
}

#[derive(Debug, Clone)]
pub struct FunctionSig {
    pub ret: String,
    pub name: String,
    pub params: Vec<ParamSig>,
    pub imported: bool,
    pub has_body: bool,
}

struct LabelInfo {
    depth: usize,
    ordinal: usize,
    scope_id: usize,
}

struct GotoInfo {
    name: String,
    ordinal: usize,
    depth: usize,
    line: usize,
    column: usize,
}

struct InitInfo {
    ordinal: usize,
    scope_id: usize,
    name: String,
}

pub struct Analyzer {
    file: String,
    strict: bool,
    aggregates: HashMap<String, ClassLayout>,
    aliases: HashMap<String, String>,
    functions: HashMap<String, FunctionSig>,
    globals: HashMap<String, String>,
    scopes: Vec<HashMap<String, String>>,
    current_ret: String,
}

/// Analyze a parsed program, producing the typed tree.
pub fn analyze(program: &ParsedNode, file: &str, opts: SemaOptions) -> Result<TypedNode, Diagnostic> {
    let mut analyzer = Analyzer::new(file, opts);
    analyzer.run(program)
}

impl Analyzer {
    fn new(file: &str, opts: SemaOptions) -> Self {
        let mut aggregates = HashMap::new();
        for (name, fields) in builtins::BUILTIN_CLASSES {
            let mut layout = ClassLayout {
                name: name.to_string(),
                is_union: false,
                fields: Vec::new(),
                size: 0,
            };
            for f in *fields {
                let size = size_of_scalar(f.ty);
                layout.fields.push(FieldLayout {
                    name: f.name.to_string(),
                    ty: f.ty.to_string(),
                    offset: layout.size,
                    size,
                    meta: String::new(),
                });
                layout.size += size;
            }
            aggregates.insert(name.to_string(), layout);
        }
        Analyzer {
            file: file.to_string(),
            strict: opts.strict,
            aggregates,
            aliases: HashMap::new(),
            functions: HashMap::new(),
            globals: HashMap::new(),
            scopes: Vec::new(),
            current_ret: String::new(),
        }
    }

    fn err(&self, code: &'static str, node: &ParsedNode, msg: impl Into<String>) -> Diagnostic {
        Diagnostic::error(code, &self.file, node.line, node.column, msg)
    }

    fn run(&mut self, program: &ParsedNode) -> Result<TypedNode, Diagnostic> {
        // Collection passes before any body is analyzed: aggregates and
        // aliases first (types), then functions, then globals.
        for item in &program.children {
            match item.kind {
                NodeKind::ClassDecl => self.collect_class(item)?,
                NodeKind::TypeAliasDecl => self.collect_alias(item),
                _ => {}
            }
        }
        for item in &program.children {
            if item.kind == NodeKind::FunctionDecl {
                self.collect_function(item)?;
            }
        }
        for item in &program.children {
            match item.kind {
                NodeKind::VarDecl | NodeKind::LinkageDecl => self.collect_global(item)?,
                NodeKind::VarDeclList => {
                    for decl in &item.children {
                        self.collect_global(decl)?;
                    }
                }
                NodeKind::ClassDecl => {
                    for decl in item.children.iter().filter(|c| c.kind == NodeKind::VarDecl) {
                        self.collect_global(decl)?;
                    }
                }
                _ => {}
            }
        }

        let mut typed = TypedNode::from_parsed(program, "");
        for item in &program.children {
            typed.children.push(self.analyze_item(item)?);
        }
        Ok(typed)
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    fn check_specs(&self, node: &ParsedNode) -> Result<(), Diagnostic> {
        for spec in node.children.iter().filter(|c| c.kind == NodeKind::DeclSpec) {
            if let Some((name, code)) = STRICT_REJECTED.iter().find(|(n, _)| *n == spec.text) {
                if self.strict {
                    return Err(self.err(
                        *code,
                        spec,
                        format!("strict mode rejects the HolyC compatibility modifier '{}'", name),
                    ));
                }
            }
        }
        Ok(())
    }

    fn resolve_alias(&self, ty: &str) -> String {
        let stars = ty.chars().rev().take_while(|c| *c == '*').count();
        let base = &ty[..ty.len() - stars];
        match self.aliases.get(base) {
            Some(target) => format!("{}{}", target, &ty[ty.len() - stars..]),
            None => ty.to_string(),
        }
    }

    fn valid_type(&self, ty: &str) -> bool {
        let base = {
            let stars = ty.chars().rev().take_while(|c| *c == '*').count();
            &ty[..ty.len() - stars]
        };
        lexer::is_type_keyword(base) || self.aggregates.contains_key(base)
    }

    fn collect_alias(&mut self, node: &ParsedNode) {
        // The alias name is the last token of the typedef text.
        let mut parts: Vec<&str> = node.text.split_whitespace().collect();
        if parts.len() >= 2 {
            let name = parts.pop().unwrap().to_string();
            let target = parts.join("");
            self.aliases.insert(name, target);
        }
    }

    fn collect_class(&mut self, node: &ParsedNode) -> Result<(), Diagnostic> {
        let name = node.text.clone();
        if self.aggregates.contains_key(&name) {
            return Err(self.err("HC3006", node, format!("duplicate class/union definition '{}'", name)));
        }
        let is_union = node.children.iter().any(|c| c.kind == NodeKind::DeclSpec && c.text == "union");
        let mut layout = ClassLayout { name: name.clone(), is_union, fields: Vec::new(), size: 0 };
        for field in node.children.iter().filter(|c| c.kind == NodeKind::FieldDecl) {
            if layout.fields.iter().any(|f| f.name == field.text) {
                return Err(self.err(
                    "HC3007",
                    field,
                    format!("duplicate field '{}' in aggregate '{}'", field.text, name),
                ));
            }
            let raw_ty = field
                .child_of(NodeKind::DeclType)
                .map(|t| t.text.clone())
                .unwrap_or_else(|| "I64".to_string());
            let ty = self.resolve_alias(&raw_ty);
            let size = if is_pointer(&ty) {
                8
            } else {
                self.aggregates.get(ty.as_str()).map(|l| l.size).unwrap_or_else(|| size_of_scalar(&ty))
            };
            let offset = if is_union { 0 } else { layout.size };
            let meta = field
                .child_of(NodeKind::FieldMetaTokens)
                .map(|m| m.text.clone())
                .unwrap_or_default();
            layout.fields.push(FieldLayout { name: field.text.clone(), ty, offset, size, meta });
            if is_union {
                layout.size = layout.size.max(size);
            } else {
                layout.size += size;
            }
        }
        self.aggregates.insert(name, layout);
        Ok(())
    }

    fn collect_function(&mut self, node: &ParsedNode) -> Result<(), Diagnostic> {
        self.check_specs(node)?;
        let name = node.text.clone();
        let ret = self.resolve_alias(
            &node.child_of(NodeKind::DeclType).map(|t| t.text.clone()).unwrap_or_else(|| "U0".to_string()),
        );
        let imported = node
            .children
            .iter()
            .any(|c| c.kind == NodeKind::DeclSpec && matches!(c.text.as_str(), "import" | "_import"));
        let has_body = node.child_of(NodeKind::Block).is_some();

        if imported && has_body {
            return Err(self.err("HC3003", node, format!("import function '{}' must not have a body", name)));
        }

        let mut params = Vec::new();
        if let Some(list) = node.child_of(NodeKind::ParamList) {
            for param in &list.children {
                let ty = self.resolve_alias(
                    &param.child_of(NodeKind::DeclType).map(|t| t.text.clone()).unwrap_or_else(|| "I64".to_string()),
                );
                params.push(ParamSig {
                    ty,
                    name: param.text.clone(),
                    has_default: param.child_of(NodeKind::Default).is_some(),
                });
            }
        }

        if let Some(existing) = self.functions.get(&name) {
            if existing.has_body && has_body {
                return Err(self.err("HC3002", node, format!("duplicate definition of function '{}'", name)));
            }
            let same = existing.ret == ret
                && existing.params.len() == params.len()
                && existing.params.iter().zip(&params).all(|(a, b)| a.ty == b.ty);
            if !same {
                return Err(self.err(
                    "HC3004",
                    node,
                    format!("conflicting signatures for function '{}'", name),
                ));
            }
            if has_body {
                let entry = self.functions.get_mut(&name).unwrap();
                entry.has_body = true;
                entry.params = params;
            }
            return Ok(());
        }

        if self.globals.contains_key(&name) {
            return Err(self.err("HC3005", node, format!("symbol '{}' already declared as a global", name)));
        }

        self.functions.insert(name.clone(), FunctionSig { ret, name, params, imported, has_body });
        Ok(())
    }

    fn collect_global(&mut self, node: &ParsedNode) -> Result<(), Diagnostic> {
        self.check_specs(node)?;
        let name = node.text.clone();
        let ty = self.resolve_alias(
            &node.child_of(NodeKind::DeclType).map(|t| t.text.clone()).unwrap_or_else(|| "I64".to_string()),
        );
        if !self.valid_type(&ty) {
            return Err(self.err("HC3008", node, format!("unknown type '{}'", ty)));
        }
        if self.globals.contains_key(&name) || self.functions.contains_key(&name) {
            return Err(self.err(
                "HC3005",
                node,
                format!("duplicate global symbol '{}' (globals and functions share a namespace)", name),
            ));
        }
        self.globals.insert(name, ty);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Item analysis
    // ------------------------------------------------------------------

    fn analyze_item(&mut self, item: &ParsedNode) -> Result<TypedNode, Diagnostic> {
        match item.kind {
            NodeKind::FunctionDecl => self.analyze_function(item),
            _ => self.analyze_statement(item),
        }
    }

    fn analyze_function(&mut self, node: &ParsedNode) -> Result<TypedNode, Diagnostic> {
        let sig = self.functions.get(&node.text).cloned().expect("function was collected");
        self.current_ret = sig.ret.clone();

        let mut typed = TypedNode::from_parsed(node, "");
        for spec in node.children.iter().filter(|c| c.kind == NodeKind::DeclSpec) {
            if !self.strict && STRICT_REJECTED.iter().any(|(n, _)| *n == spec.text) {
                continue; // permissive mode strips them
            }
            typed.children.push(TypedNode::from_parsed(spec, ""));
        }
        if let Some(ret) = node.child_of(NodeKind::DeclType) {
            typed.children.push(TypedNode::from_parsed(ret, ""));
        }
        if let Some(list) = node.child_of(NodeKind::ParamList) {
            let mut typed_list = TypedNode::from_parsed(list, "");
            for param in &list.children {
                let mut tp = TypedNode::from_parsed(param, "");
                for child in &param.children {
                    // Default expressions are carried through unanalyzed;
                    // they are materialized per call site.
                    tp.children.push(copy_unanalyzed(child));
                }
                typed_list.children.push(tp);
            }
            typed.children.push(typed_list);
        }

        if let Some(body) = node.child_of(NodeKind::Block) {
            // Parameter scope.
            self.scopes.push(HashMap::new());
            for p in &sig.params {
                if !p.name.is_empty() {
                    self.scopes.last_mut().unwrap().insert(p.name.clone(), p.ty.clone());
                }
            }

            self.collect_labels(body, node)?;
            self.check_goto_legality(body)?;

            let typed_body = self.analyze_statement(body)?;
            typed.children.push(typed_body);

            self.scopes.pop();
        }
        Ok(typed)
    }

    /// First body pass: label definitions, duplicates rejected.
    fn collect_labels(&mut self, body: &ParsedNode, func: &ParsedNode) -> Result<(), Diagnostic> {
        let mut stack = vec![body];
        let mut seen: HashSet<String> = HashSet::new();
        while let Some(node) = stack.pop() {
            if node.kind == NodeKind::LabelStmt {
                if !seen.insert(node.text.clone()) {
                    return Err(self.err(
                        "HC3030",
                        node,
                        format!("duplicate label '{}' in function '{}'", node.text, func.text),
                    ));
                }
            }
            for child in &node.children {
                stack.push(child);
            }
        }
        Ok(())
    }

    /// Second body pass: positions of gotos, labels and initialized
    /// declarations, used to reject illegal jumps.
    fn check_goto_legality(&self, body: &ParsedNode) -> Result<(), Diagnostic> {
        let mut labels: HashMap<String, LabelInfo> = HashMap::new();
        let mut gotos: Vec<GotoInfo> = Vec::new();
        let mut inits: Vec<InitInfo> = Vec::new();
        let mut ordinal = 0usize;
        let mut next_scope = 1usize;
        collect_positions(body, 0, 0, &mut next_scope, &mut ordinal, &mut labels, &mut gotos, &mut inits);

        for g in &gotos {
            let label = match labels.get(&g.name) {
                Some(l) => l,
                None => {
                    return Err(Diagnostic::error(
                        "HC3033",
                        &self.file,
                        g.line,
                        g.column,
                        format!("goto target '{}' is not defined in this function", g.name),
                    ));
                }
            };
            if label.depth > g.depth {
                return Err(Diagnostic::error(
                    "HC3031",
                    &self.file,
                    g.line,
                    g.column,
                    format!("goto '{}' jumps into a deeper scope", g.name),
                ));
            }
            if label.ordinal > g.ordinal {
                for init in &inits {
                    if init.scope_id == label.scope_id
                        && init.ordinal > g.ordinal
                        && init.ordinal < label.ordinal
                    {
                        return Err(Diagnostic::error(
                            "HC3032",
                            &self.file,
                            g.line,
                            g.column,
                            format!(
                                "goto '{}' skips over the initialized declaration of '{}'",
                                g.name, init.name
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn analyze_statement(&mut self, node: &ParsedNode) -> Result<TypedNode, Diagnostic> {
        match node.kind {
            NodeKind::Block => {
                self.scopes.push(HashMap::new());
                let mut typed = TypedNode::from_parsed(node, "");
                for stmt in &node.children {
                    typed.children.push(self.analyze_statement(stmt)?);
                }
                self.scopes.pop();
                Ok(typed)
            }
            NodeKind::VarDecl => self.analyze_var_decl(node),
            NodeKind::VarDeclList => {
                let mut typed = TypedNode::from_parsed(node, "");
                for decl in &node.children {
                    typed.children.push(self.analyze_var_decl(decl)?);
                }
                Ok(typed)
            }
            NodeKind::LinkageDecl => {
                self.check_specs(node)?;
                Ok(copy_decl_shape(node))
            }
            NodeKind::ClassDecl => {
                // Layout was collected up front; trailing declarators are
                // analyzed so initializers get types.
                let mut typed = TypedNode::from_parsed(node, "");
                for child in &node.children {
                    match child.kind {
                        NodeKind::VarDecl => typed.children.push(self.analyze_var_decl_global(child)?),
                        _ => typed.children.push(copy_decl_shape(child)),
                    }
                }
                Ok(typed)
            }
            NodeKind::TypeAliasDecl | NodeKind::StartLabel | NodeKind::EndLabel | NodeKind::EmptyStmt => {
                Ok(TypedNode::from_parsed(node, ""))
            }
            NodeKind::LabelStmt => Ok(TypedNode::from_parsed(node, "")),
            NodeKind::GotoStmt => Ok(TypedNode::from_parsed(node, "")),
            NodeKind::BreakStmt => Ok(TypedNode::from_parsed(node, "")),
            NodeKind::ReturnStmt => {
                let mut typed = TypedNode::from_parsed(node, "");
                if let Some(value) = node.children.first() {
                    let tv = self.analyze_expr(value)?;
                    if self.current_ret == "U0" {
                        return Err(self.err("HC3010", node, "cannot return a value from a U0 function"));
                    }
                    if !convertible(&tv.ty, &self.current_ret) {
                        return Err(self.err(
                            "HC3010",
                            node,
                            format!("cannot convert return value of type {} to {}", tv.ty, self.current_ret),
                        ));
                    }
                    typed.children.push(tv);
                }
                Ok(typed)
            }
            NodeKind::IfStmt | NodeKind::WhileStmt => {
                let mut typed = TypedNode::from_parsed(node, "");
                let cond = self.analyze_expr(&node.children[0])?;
                if !is_scalar(&cond.ty) {
                    return Err(self.err("HC3010", &node.children[0], format!("condition has non-scalar type {}", cond.ty)));
                }
                typed.children.push(cond);
                for stmt in &node.children[1..] {
                    typed.children.push(self.analyze_statement(stmt)?);
                }
                Ok(typed)
            }
            NodeKind::DoWhileStmt => {
                let mut typed = TypedNode::from_parsed(node, "");
                typed.children.push(self.analyze_statement(&node.children[0])?);
                let cond = self.analyze_expr(&node.children[1])?;
                if !is_scalar(&cond.ty) {
                    return Err(self.err("HC3010", &node.children[1], format!("condition has non-scalar type {}", cond.ty)));
                }
                typed.children.push(cond);
                Ok(typed)
            }
            NodeKind::ForStmt => {
                self.scopes.push(HashMap::new());
                let mut typed = TypedNode::from_parsed(node, "");
                typed.children.push(self.analyze_statement(&node.children[0])?);
                if node.children[1].kind == NodeKind::EmptyArg {
                    typed.children.push(TypedNode::from_parsed(&node.children[1], ""));
                } else {
                    typed.children.push(self.analyze_expr(&node.children[1])?);
                }
                typed.children.push(self.analyze_statement(&node.children[2])?);
                typed.children.push(self.analyze_statement(&node.children[3])?);
                self.scopes.pop();
                Ok(typed)
            }
            NodeKind::SwitchStmt => self.analyze_switch(node),
            NodeKind::TryStmt => {
                let mut typed = TypedNode::from_parsed(node, "");
                typed.children.push(self.analyze_statement(&node.children[0])?);
                typed.children.push(self.analyze_statement(&node.children[1])?);
                Ok(typed)
            }
            NodeKind::ThrowStmt => {
                let payload = self.analyze_expr(&node.children[0])?;
                if !is_integral(&payload.ty) && !is_unknown(&payload.ty) {
                    return Err(self.err(
                        "HC3040",
                        node,
                        format!("throw payload must be integral, got {}", payload.ty),
                    ));
                }
                let mut typed = TypedNode::from_parsed(node, "");
                typed.children.push(payload);
                Ok(typed)
            }
            NodeKind::LockStmt => {
                let mut typed = TypedNode::from_parsed(node, "");
                typed.children.push(self.analyze_statement(&node.children[0])?);
                Ok(typed)
            }
            NodeKind::AsmStmt => self.analyze_asm(node),
            NodeKind::PrintStmt => self.analyze_print(node),
            NodeKind::NoParenCallStmt => {
                let name = &node.text;
                if let Some(sig) = self.lookup_function(name) {
                    if sig.params.iter().any(|p| !p.has_default) {
                        return Err(self.err(
                            "HC3012",
                            node,
                            format!("'{}' requires arguments and cannot be called without parentheses", name),
                        ));
                    }
                    return Ok(TypedNode::from_parsed(node, ""));
                }
                // A plain variable statement degenerates to an expression.
                let _ = self.type_of_identifier(node)?;
                Ok(TypedNode::from_parsed(node, ""))
            }
            NodeKind::ExprStmt => {
                let mut typed = TypedNode::from_parsed(node, "");
                typed.children.push(self.analyze_expr(&node.children[0])?);
                Ok(typed)
            }
            NodeKind::FunctionDecl => Err(self.err(
                "HC3002",
                node,
                "function definitions are only allowed at the top level",
            )),
            _ => {
                let mut typed = TypedNode::from_parsed(node, "");
                for child in &node.children {
                    typed.children.push(self.analyze_statement(child)?);
                }
                Ok(typed)
            }
        }
    }

    fn analyze_var_decl(&mut self, node: &ParsedNode) -> Result<TypedNode, Diagnostic> {
        if self.scopes.is_empty() {
            return self.analyze_var_decl_global(node);
        }
        self.check_specs(node)?;
        let ty = self.resolve_alias(
            &node.child_of(NodeKind::DeclType).map(|t| t.text.clone()).unwrap_or_else(|| "I64".to_string()),
        );
        if !self.valid_type(&ty) {
            return Err(self.err("HC3008", node, format!("unknown type '{}'", ty)));
        }
        let scope = self.scopes.last_mut().unwrap();
        if scope.contains_key(&node.text) {
            return Err(self.err("HC3009", node, format!("redeclaration of '{}' in the same scope", node.text)));
        }
        scope.insert(node.text.clone(), ty.clone());

        let mut typed = TypedNode::from_parsed(node, "");
        for child in &node.children {
            match child.kind {
                NodeKind::DeclSpec | NodeKind::DeclType => {
                    if !self.strict && STRICT_REJECTED.iter().any(|(n, _)| *n == child.text) {
                        continue;
                    }
                    typed.children.push(TypedNode::from_parsed(child, ""));
                }
                _ => {
                    let init = self.analyze_expr(child)?;
                    if !convertible(&init.ty, &ty) {
                        return Err(self.err(
                            "HC3010",
                            child,
                            format!("cannot initialize {} '{}' from {}", ty, node.text, init.ty),
                        ));
                    }
                    typed.children.push(init);
                }
            }
        }
        Ok(typed)
    }

    fn analyze_var_decl_global(&mut self, node: &ParsedNode) -> Result<TypedNode, Diagnostic> {
        let ty = self.resolve_alias(
            &node.child_of(NodeKind::DeclType).map(|t| t.text.clone()).unwrap_or_else(|| "I64".to_string()),
        );
        let mut typed = TypedNode::from_parsed(node, "");
        for child in &node.children {
            match child.kind {
                NodeKind::DeclSpec | NodeKind::DeclType => {
                    if !self.strict && STRICT_REJECTED.iter().any(|(n, _)| *n == child.text) {
                        continue;
                    }
                    typed.children.push(TypedNode::from_parsed(child, ""));
                }
                _ => {
                    let init = self.analyze_expr(child)?;
                    if !convertible(&init.ty, &ty) {
                        return Err(self.err(
                            "HC3010",
                            child,
                            format!("cannot initialize {} '{}' from {}", ty, node.text, init.ty),
                        ));
                    }
                    typed.children.push(init);
                }
            }
        }
        Ok(typed)
    }

    fn analyze_switch(&mut self, node: &ParsedNode) -> Result<TypedNode, Diagnostic> {
        let mut typed = TypedNode::from_parsed(node, "");
        let cond = self.analyze_expr(&node.children[0])?;
        if !is_integral(&cond.ty) && !is_unknown(&cond.ty) {
            return Err(self.err(
                "HC3010",
                &node.children[0],
                format!("switch condition must be integral, got {}", cond.ty),
            ));
        }
        typed.children.push(cond);

        for clause in &node.children[1..] {
            match clause.kind {
                NodeKind::CaseClause => {
                    let mut tc = TypedNode::from_parsed(clause, "");
                    let expr_count = match clause.text.as_str() {
                        "range" => 2,
                        "null" => 0,
                        _ => 1,
                    };
                    for (i, child) in clause.children.iter().enumerate() {
                        if i < expr_count {
                            let e = self.analyze_expr(child)?;
                            if !is_integral(&e.ty) && !is_unknown(&e.ty) {
                                return Err(self.err("HC3010", child, format!("case value must be integral, got {}", e.ty)));
                            }
                            tc.children.push(e);
                        } else {
                            tc.children.push(self.analyze_statement(child)?);
                        }
                    }
                    typed.children.push(tc);
                }
                NodeKind::DefaultClause => {
                    let mut tc = TypedNode::from_parsed(clause, "");
                    for child in &clause.children {
                        tc.children.push(self.analyze_statement(child)?);
                    }
                    typed.children.push(tc);
                }
                _ => typed.children.push(TypedNode::from_parsed(clause, "")),
            }
        }
        Ok(typed)
    }

    /// Inline asm: every non-literal operand must be preceded by an input
    /// constraint; output and clobber constraints take no operand.
    fn analyze_asm(&mut self, node: &ParsedNode) -> Result<TypedNode, Diagnostic> {
        let mut typed = TypedNode::from_parsed(node, "");
        for arg in &node.children {
            let constraint = &arg.text;
            let is_output = constraint.starts_with('=');
            let is_clobber = constraint.starts_with('~')
                || (constraint.starts_with('{') && constraint.ends_with('}'));
            let needs_operand = !is_output && !is_clobber;
            let mut ta = TypedNode::from_parsed(arg, "");
            match (needs_operand, arg.children.first()) {
                (true, Some(expr)) => {
                    ta.children.push(self.analyze_expr(expr)?);
                }
                (true, None) => {
                    return Err(self.err(
                        "HC3021",
                        arg,
                        format!("input constraint \"{}\" requires an operand expression", constraint),
                    ));
                }
                (false, Some(_)) => {
                    return Err(self.err(
                        "HC3021",
                        arg,
                        format!("constraint \"{}\" does not take an operand expression", constraint),
                    ));
                }
                (false, None) => {}
            }
            typed.children.push(ta);
        }
        Ok(typed)
    }

    fn analyze_print(&mut self, node: &ParsedNode) -> Result<TypedNode, Diagnostic> {
        let mut typed = TypedNode::from_parsed(node, "");
        let mut children = Vec::new();
        for child in &node.children {
            children.push(self.analyze_expr(child)?);
        }

        let first = &node.children[0];
        let is_string = first.kind == NodeKind::Literal && first.text.starts_with('"');
        if is_string {
            let inner = lexer::literal_inner(&first.text);
            if inner.is_empty() && node.children.len() > 1 {
                // Dynamic format forwarding: the second expression is the
                // format, remaining arguments are unchecked.
            } else {
                let classes = parse_format_classes(inner)
                    .map_err(|msg| self.err("HC3018", first, msg))?;
                let args = &children[1..];
                if classes.len() != args.len() {
                    return Err(self.err(
                        "HC3019",
                        node,
                        format!("format string expects {} argument(s), got {}", classes.len(), args.len()),
                    ));
                }
                for (class, arg) in classes.iter().zip(args) {
                    if !class.accepts(&arg.ty) {
                        return Err(self.err(
                            "HC3018",
                            node,
                            format!("format specifier {} does not accept an argument of type {}", class.describe(), arg.ty),
                        ));
                    }
                }
            }
        }
        typed.children = children;
        Ok(typed)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn lookup_local(&self, name: &str) -> Option<&String> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    fn lookup_function(&self, name: &str) -> Option<FunctionSig> {
        if let Some(sig) = self.functions.get(name) {
            return Some(sig.clone());
        }
        builtins::builtin_fn(name).map(|b| FunctionSig {
            ret: b.ret.to_string(),
            name: b.name.to_string(),
            params: b
                .params
                .iter()
                .map(|p| ParamSig { ty: p.ty.to_string(), name: p.name.to_string(), has_default: p.has_default })
                .collect(),
            imported: true,
            has_body: false,
        })
    }

    fn type_of_identifier(&self, node: &ParsedNode) -> Result<String, Diagnostic> {
        let name = &node.text;
        if let Some(ty) = self.lookup_local(name) {
            return Ok(ty.clone());
        }
        if let Some(ty) = self.globals.get(name) {
            return Ok(ty.clone());
        }
        if name == builtins::EXCEPTION_PAYLOAD_NAME {
            return Ok("I64".to_string());
        }
        if let Some(c) = builtins::builtin_const(name) {
            return Ok(c.ty.to_string());
        }
        if let Some(sig) = self.lookup_function(name) {
            return Ok(format!("fn {}", sig.ret));
        }
        Err(self.err("HC3001", node, format!("unknown identifier '{}'", name)))
    }

    fn analyze_expr(&mut self, node: &ParsedNode) -> Result<TypedNode, Diagnostic> {
        match node.kind {
            NodeKind::Literal => {
                let ty = if node.text.starts_with('"') {
                    "U8*"
                } else if node.text.starts_with('\'') {
                    "I64"
                } else if node.text.contains('.') {
                    "F64"
                } else {
                    "I64"
                };
                Ok(TypedNode::from_parsed(node, ty))
            }
            NodeKind::Identifier => {
                let ty = self.type_of_identifier(node)?;
                Ok(TypedNode::from_parsed(node, ty))
            }
            NodeKind::DollarExpr => Ok(TypedNode::from_parsed(node, "I64")),
            NodeKind::EmptyArg => Ok(TypedNode::from_parsed(node, "Unknown")),
            NodeKind::UnaryExpr => {
                let operand = self.analyze_expr(&node.children[0])?;
                let ty = match node.text.as_str() {
                    "&" => format!("{}*", operand.ty),
                    "*" => {
                        if is_pointer(&operand.ty) {
                            strip_pointer(&operand.ty).to_string()
                        } else if is_unknown(&operand.ty) {
                            "Unknown".to_string()
                        } else {
                            return Err(self.err(
                                "HC3011",
                                node,
                                format!("cannot dereference non-pointer type {}", operand.ty),
                            ));
                        }
                    }
                    "!" => {
                        if !is_scalar(&operand.ty) {
                            return Err(self.err("HC3011", node, format!("'!' needs a scalar operand, got {}", operand.ty)));
                        }
                        "Bool".to_string()
                    }
                    "~" => {
                        if !is_integral(&operand.ty) && !is_unknown(&operand.ty) {
                            return Err(self.err("HC3011", node, format!("'~' needs an integral operand, got {}", operand.ty)));
                        }
                        operand.ty.clone()
                    }
                    "+" | "-" => {
                        if !is_numeric(&operand.ty) && !is_unknown(&operand.ty) {
                            return Err(self.err(
                                "HC3011",
                                node,
                                format!("unary '{}' needs a numeric operand, got {}", node.text, operand.ty),
                            ));
                        }
                        operand.ty.clone()
                    }
                    "++" | "--" => {
                        if !is_numeric(&operand.ty) && !is_pointer(&operand.ty) && !is_unknown(&operand.ty) {
                            return Err(self.err("HC3011", node, format!("cannot apply '{}' to {}", node.text, operand.ty)));
                        }
                        operand.ty.clone()
                    }
                    other => {
                        return Err(self.err("HC3011", node, format!("unsupported unary operator '{}'", other)));
                    }
                };
                let mut typed = TypedNode::from_parsed(node, ty);
                typed.children.push(operand);
                Ok(typed)
            }
            NodeKind::PostfixExpr => {
                let operand = self.analyze_expr(&node.children[0])?;
                if !is_numeric(&operand.ty) && !is_pointer(&operand.ty) && !is_unknown(&operand.ty) {
                    return Err(self.err("HC3011", node, format!("cannot apply '{}' to {}", node.text, operand.ty)));
                }
                let mut typed = TypedNode::from_parsed(node, operand.ty.clone());
                typed.children.push(operand);
                Ok(typed)
            }
            NodeKind::BinaryExpr => self.analyze_binary(node),
            NodeKind::AssignExpr => {
                let lhs = self.analyze_expr(&node.children[0])?;
                let rhs = self.analyze_expr(&node.children[1])?;
                if !convertible(&rhs.ty, &lhs.ty) {
                    return Err(self.err(
                        "HC3010",
                        node,
                        format!("cannot assign {} to {}", rhs.ty, lhs.ty),
                    ));
                }
                if node.text != "=" && !is_numeric(&lhs.ty) && !is_pointer(&lhs.ty) && !is_unknown(&lhs.ty) {
                    return Err(self.err("HC3010", node, format!("compound assignment needs a scalar target, got {}", lhs.ty)));
                }
                let ty = lhs.ty.clone();
                let mut typed = TypedNode::from_parsed(node, ty);
                typed.children.push(lhs);
                typed.children.push(rhs);
                Ok(typed)
            }
            NodeKind::CastExpr => {
                let target = self.resolve_alias(&node.text);
                if !self.valid_type(&target) {
                    return Err(self.err("HC3008", node, format!("unknown cast target type '{}'", target)));
                }
                let operand = self.analyze_expr(&node.children[0])?;
                let mut typed = TypedNode::from_parsed(node, target.clone());
                typed.text = target;
                typed.children.push(operand);
                Ok(typed)
            }
            NodeKind::CommaExpr => {
                let mut typed = TypedNode::from_parsed(node, "");
                for child in &node.children {
                    typed.children.push(self.analyze_expr(child)?);
                }
                typed.ty = typed.children.last().map(|c| c.ty.clone()).unwrap_or_default();
                Ok(typed)
            }
            NodeKind::LaneExpr => self.analyze_lane(node),
            NodeKind::MemberExpr => {
                let base = self.analyze_expr(&node.children[0])?;
                let base_ty = self.resolve_alias(&base.ty);
                let ty = match self.aggregates.get(base_ty.as_str()) {
                    Some(layout) => match layout.fields.iter().find(|f| f.name == node.text) {
                        Some(field) => field.ty.clone(),
                        None => {
                            return Err(self.err(
                                "HC3017",
                                node,
                                format!("aggregate '{}' has no field '{}'", base_ty, node.text),
                            ));
                        }
                    },
                    None => "I64".to_string(),
                };
                let mut typed = TypedNode::from_parsed(node, ty);
                typed.children.push(base);
                Ok(typed)
            }
            NodeKind::IndexExpr => {
                let base = self.analyze_expr(&node.children[0])?;
                let index = self.analyze_expr(&node.children[1])?;
                if !is_integral(&index.ty) && !is_unknown(&index.ty) {
                    return Err(self.err("HC3010", node, format!("index must be integral, got {}", index.ty)));
                }
                let ty = if is_pointer(&base.ty) {
                    strip_pointer(&base.ty).to_string()
                } else if is_unknown(&base.ty) {
                    "Unknown".to_string()
                } else {
                    "I64".to_string()
                };
                let mut typed = TypedNode::from_parsed(node, ty);
                typed.children.push(base);
                typed.children.push(index);
                Ok(typed)
            }
            NodeKind::CallExpr => self.analyze_call(node),
            _ => Err(self.err("HC3001", node, format!("unexpected node in expression: {}", node.kind.name()))),
        }
    }

    fn analyze_binary(&mut self, node: &ParsedNode) -> Result<TypedNode, Diagnostic> {
        let lhs = self.analyze_expr(&node.children[0])?;
        let rhs = self.analyze_expr(&node.children[1])?;
        let op = node.text.as_str();

        let ty = match op {
            "+" | "-" => {
                if is_pointer(&lhs.ty) && is_pointer(&rhs.ty) {
                    if op == "-" {
                        "I64".to_string()
                    } else {
                        return Err(self.err("HC3010", node, "cannot add two pointers"));
                    }
                } else if is_pointer(&lhs.ty) {
                    if !is_integral(&rhs.ty) && !is_unknown(&rhs.ty) {
                        return Err(self.err("HC3010", node, format!("pointer {} needs an integral offset", op)));
                    }
                    lhs.ty.clone()
                } else if is_pointer(&rhs.ty) {
                    if op == "-" || (!is_integral(&lhs.ty) && !is_unknown(&lhs.ty)) {
                        return Err(self.err("HC3010", node, "invalid pointer arithmetic"));
                    }
                    rhs.ty.clone()
                } else {
                    self.numeric_operands(node, &lhs, &rhs)?;
                    promote(&lhs.ty, &rhs.ty)
                }
            }
            "*" | "/" => {
                self.numeric_operands(node, &lhs, &rhs)?;
                promote(&lhs.ty, &rhs.ty)
            }
            "%" | "&" | "|" | "^" | "<<" | ">>" => {
                for side in [&lhs, &rhs] {
                    if !is_integral(&side.ty) && !is_unknown(&side.ty) {
                        return Err(self.err(
                            "HC3010",
                            node,
                            format!("operator '{}' needs integral operands, got {}", op, side.ty),
                        ));
                    }
                }
                promote(&lhs.ty, &rhs.ty)
            }
            "<" | ">" | "<=" | ">=" | "==" | "!=" => {
                if !convertible(&lhs.ty, &rhs.ty) && !convertible(&rhs.ty, &lhs.ty) {
                    return Err(self.err(
                        "HC3010",
                        node,
                        format!("cannot compare {} with {}", lhs.ty, rhs.ty),
                    ));
                }
                // An immediate relational on the left marks a HolyC
                // comparison chain.
                let left_is_relational = node.children[0].kind == NodeKind::BinaryExpr
                    && matches!(node.children[0].text.as_str(), "<" | ">" | "<=" | ">=");
                if left_is_relational && matches!(op, "<" | ">" | "<=" | ">=") {
                    "Bool(chained)".to_string()
                } else {
                    "Bool".to_string()
                }
            }
            "&&" | "||" => {
                for side in [&lhs, &rhs] {
                    if !is_scalar(&side.ty) {
                        return Err(self.err(
                            "HC3010",
                            node,
                            format!("operator '{}' needs scalar operands, got {}", op, side.ty),
                        ));
                    }
                }
                "Bool".to_string()
            }
            other => {
                return Err(self.err("HC3010", node, format!("unsupported binary operator '{}'", other)));
            }
        };

        let mut typed = TypedNode::from_parsed(node, ty);
        typed.children.push(lhs);
        typed.children.push(rhs);
        Ok(typed)
    }

    fn numeric_operands(&self, node: &ParsedNode, lhs: &TypedNode, rhs: &TypedNode) -> Result<(), Diagnostic> {
        for side in [lhs, rhs] {
            if !is_numeric(&side.ty) && !is_unknown(&side.ty) {
                return Err(self.err(
                    "HC3010",
                    node,
                    format!("operator '{}' needs numeric operands, got {}", node.text, side.ty),
                ));
            }
        }
        Ok(())
    }

    fn analyze_lane(&mut self, node: &ParsedNode) -> Result<TypedNode, Diagnostic> {
        let base = self.analyze_expr(&node.children[0])?;
        let index = self.analyze_expr(&node.children[1])?;

        if !is_integral(&base.ty) && !is_unknown(&base.ty) {
            return Err(self.err(
                "HC3015",
                node,
                format!("lane access needs an integral base, got {}", base.ty),
            ));
        }
        if !is_integral(&index.ty) && !is_unknown(&index.ty) {
            return Err(self.err("HC3015", node, format!("lane index must be integral, got {}", index.ty)));
        }

        let sel = node.text.as_str();
        let lane_bits: usize = sel[1..].parse().unwrap_or(8);
        let base_bits = if is_unknown(&base.ty) { 64 } else { int_width(&base.ty) };
        if base_bits < 8 || base_bits % lane_bits != 0 {
            return Err(self.err(
                "HC3015",
                node,
                format!("lane selector {} does not divide the {}-bit base", sel, base_bits),
            ));
        }
        if node.children[1].kind == NodeKind::Literal && !node.children[1].text.contains('.') {
            let idx = lexer::parse_int_literal(&node.children[1].text);
            let count = (base_bits / lane_bits) as i64;
            if idx < 0 || idx >= count {
                return Err(self.err(
                    "HC3016",
                    node,
                    format!("lane index {} out of range for {} lanes", idx, count),
                ));
            }
        }
        let ty = if sel.starts_with('i') {
            format!("I{}", lane_bits)
        } else {
            format!("U{}", lane_bits)
        };
        let mut typed = TypedNode::from_parsed(node, ty);
        typed.children.push(base);
        typed.children.push(index);
        Ok(typed)
    }

    fn analyze_call(&mut self, node: &ParsedNode) -> Result<TypedNode, Diagnostic> {
        let callee_node = &node.children[0];
        let args_node = &node.children[1];

        // A direct identifier that names a known function (and is not
        // shadowed by a local) is a direct call.
        let direct = if callee_node.kind == NodeKind::Identifier
            && self.lookup_local(&callee_node.text).is_none()
            && self.globals.get(&callee_node.text).is_none()
        {
            self.lookup_function(&callee_node.text)
        } else {
            None
        };

        let typed_callee = if let Some(sig) = &direct {
            TypedNode::from_parsed(callee_node, format!("fn {}", sig.ret))
        } else if callee_node.kind == NodeKind::Identifier && self.type_of_identifier(callee_node).is_err() {
            // Unknown callee: the lowerer may synthesize a signature from
            // the call site, so this is not rejected here.
            TypedNode::from_parsed(callee_node, "Unknown")
        } else {
            self.analyze_expr(callee_node)?
        };

        let mut typed_args = TypedNode::from_parsed(args_node, "");
        for arg in &args_node.children {
            typed_args.children.push(self.analyze_expr(arg)?);
        }

        let ret = if let Some(sig) = direct {
            if typed_args.children.len() > sig.params.len() {
                return Err(self.err(
                    "HC3012",
                    node,
                    format!(
                        "'{}' takes {} argument(s), got {}",
                        sig.name,
                        sig.params.len(),
                        typed_args.children.len()
                    ),
                ));
            }
            for (i, param) in sig.params.iter().enumerate() {
                match typed_args.children.get(i) {
                    Some(arg) if arg.kind == NodeKind::EmptyArg => {
                        if !param.has_default {
                            return Err(self.err(
                                "HC3012",
                                node,
                                format!("argument {} of '{}' has no default and cannot be omitted", i + 1, sig.name),
                            ));
                        }
                    }
                    Some(arg) => {
                        if !convertible(&arg.ty, &param.ty) {
                            return Err(self.err(
                                "HC3013",
                                node,
                                format!(
                                    "argument {} of '{}': cannot convert {} to {}",
                                    i + 1,
                                    sig.name,
                                    arg.ty,
                                    param.ty
                                ),
                            ));
                        }
                    }
                    None => {
                        if !param.has_default {
                            return Err(self.err(
                                "HC3012",
                                node,
                                format!("missing argument {} of '{}'", i + 1, sig.name),
                            ));
                        }
                    }
                }
            }
            sig.ret
        } else {
            // Indirect call: infer from the callee expression type.
            match typed_callee.ty.strip_prefix("fn ") {
                Some(ret) => ret.to_string(),
                None => "I64".to_string(),
            }
        };

        let mut typed = TypedNode::from_parsed(node, ret);
        typed.children.push(typed_callee);
        typed.children.push(typed_args);
        Ok(typed)
    }
}

/// Recursive goto-legality position scan.
#[allow(clippy::too_many_arguments)]
fn collect_positions(
    node: &ParsedNode,
    depth: usize,
    scope_id: usize,
    next_scope: &mut usize,
    ordinal: &mut usize,
    labels: &mut HashMap<String, LabelInfo>,
    gotos: &mut Vec<GotoInfo>,
    inits: &mut Vec<InitInfo>,
) {
    *ordinal += 1;
    match node.kind {
        NodeKind::LabelStmt => {
            labels.insert(node.text.clone(), LabelInfo { depth, ordinal: *ordinal, scope_id });
        }
        NodeKind::GotoStmt => {
            gotos.push(GotoInfo {
                name: node.text.clone(),
                ordinal: *ordinal,
                depth,
                line: node.line,
                column: node.column,
            });
        }
        NodeKind::VarDecl => {
            let has_init = node
                .children
                .iter()
                .any(|c| !matches!(c.kind, NodeKind::DeclSpec | NodeKind::DeclType));
            if has_init {
                inits.push(InitInfo { ordinal: *ordinal, scope_id, name: node.text.clone() });
            }
        }
        _ => {}
    }
    if node.kind == NodeKind::Block {
        *next_scope += 1;
        let inner = *next_scope;
        for child in &node.children {
            collect_positions(child, depth + 1, inner, next_scope, ordinal, labels, gotos, inits);
        }
    } else {
        for child in &node.children {
            collect_positions(child, depth, scope_id, next_scope, ordinal, labels, gotos, inits);
        }
    }
}

/// Copy a subtree without analysis (used for default expressions, which
/// are typed per call site during lowering).
fn copy_unanalyzed(node: &ParsedNode) -> TypedNode {
    let mut typed = TypedNode::from_parsed(node, "");
    for child in &node.children {
        typed.children.push(copy_unanalyzed(child));
    }
    typed
}

fn copy_decl_shape(node: &ParsedNode) -> TypedNode {
    let mut typed = TypedNode::from_parsed(node, "");
    for child in &node.children {
        typed.children.push(copy_decl_shape(child));
    }
    typed
}

// ======================================================================
// Print format parsing
// ======================================================================

/// Type class one format specifier consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    Int,
    Float,
    Str,
    Ptr,
}

impl ArgClass {
    pub fn accepts(self, ty: &str) -> bool {
        if is_unknown(ty) {
            return true;
        }
        match self {
            ArgClass::Int => is_integral(ty),
            ArgClass::Float => is_numeric(ty),
            ArgClass::Str => is_pointer(ty),
            ArgClass::Ptr => is_pointer(ty) || is_integral(ty),
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ArgClass::Int => "%d-class",
            ArgClass::Float => "%f-class",
            ArgClass::Str => "%s",
            ArgClass::Ptr => "%p",
        }
    }
}

/// Parse a format string into the argument classes it consumes. `%z`
/// consumes two arguments (index and table); `*` width and `.*`
/// precision each consume one integer.
pub fn parse_format_classes(fmt: &str) -> Result<Vec<ArgClass>, String> {
    let chars: Vec<char> = fmt.chars().collect();
    let mut classes = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '%' {
            i += 1;
            continue;
        }
        i += 1;
        if i >= chars.len() {
            return Err("format string ends in '%'".to_string());
        }
        if chars[i] == '%' {
            i += 1;
            continue;
        }
        // Flags
        while i < chars.len() && matches!(chars[i], '-' | '+' | ' ' | '0' | '#' | '\'' | ',') {
            i += 1;
        }
        // Width
        if i < chars.len() && chars[i] == '*' {
            classes.push(ArgClass::Int);
            i += 1;
        } else {
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
        // Precision
        if i < chars.len() && chars[i] == '.' {
            i += 1;
            if i < chars.len() && chars[i] == '*' {
                classes.push(ArgClass::Int);
                i += 1;
            } else {
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
        }
        // Length modifiers
        while i < chars.len() && matches!(chars[i], 'h' | 'l' | 'j' | 't' | 'L' | 'q') {
            i += 1;
        }
        if i >= chars.len() {
            return Err("incomplete format specifier".to_string());
        }
        match chars[i] {
            'd' | 'i' | 'u' | 'x' | 'X' | 'o' | 'b' | 'c' => classes.push(ArgClass::Int),
            's' => classes.push(ArgClass::Str),
            'p' | 'P' => classes.push(ArgClass::Ptr),
            'z' => {
                classes.push(ArgClass::Int);
                classes.push(ArgClass::Ptr);
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' => classes.push(ArgClass::Float),
            other => return Err(format!("unknown format specifier '%{}'", other)),
        }
        i += 1;
    }
    Ok(classes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn analyze_src(src: &str) -> Result<TypedNode, Diagnostic> {
        let parsed = Parser::parse_source(src, "t.HC")?;
        analyze(&parsed, "t.HC", SemaOptions::default())
    }

    fn analyze_permissive(src: &str) -> Result<TypedNode, Diagnostic> {
        let parsed = Parser::parse_source(src, "t.HC")?;
        analyze(&parsed, "t.HC", SemaOptions { strict: false })
    }

    fn expr_ty(src: &str) -> String {
        // Wraps the expression so its type lands on the return child.
        let typed = analyze_src(&format!("I64 x; F64 f; U8 *s; I64 Probe() {{ return {}; }}", src)).unwrap();
        let f = typed.children.iter().find(|c| c.text == "Probe").unwrap();
        let block = f.child_of(NodeKind::Block).unwrap();
        block.children[0].children[0].ty.clone()
    }

    #[test]
    fn test_literal_types() {
        assert_eq!(expr_ty("42"), "I64");
        assert_eq!(expr_ty("'A'"), "I64");
        assert_eq!(expr_ty("1.5"), "F64");
    }

    #[test]
    fn test_string_literal_requires_pointer_context() {
        let typed = analyze_src("U8 *S() { return \"hi\"; }").unwrap();
        let f = &typed.children[0];
        let ret = &f.child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(ret.children[0].ty, "U8*");
    }

    #[test]
    fn test_promotion_prefers_unsigned() {
        let typed = analyze_src("U32 u; I64 F() { return u + 1; }").unwrap();
        let f = typed.children.iter().find(|c| c.kind == NodeKind::FunctionDecl).unwrap();
        let ret = &f.child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(ret.children[0].ty, "U64");
    }

    #[test]
    fn test_addr_and_deref() {
        assert_eq!(expr_ty("&x"), "I64*");
        assert_eq!(expr_ty("*s"), "U8");
    }

    #[test]
    fn test_deref_non_pointer_rejected() {
        let err = analyze_src("I64 F() { I64 v; return *v; }").unwrap_err();
        assert_eq!(err.code, "HC3011");
    }

    #[test]
    fn test_relational_bool_and_chain() {
        assert_eq!(expr_ty("x < 3"), "Bool");
        assert_eq!(expr_ty("1 < x < 3"), "Bool(chained)");
        assert_eq!(expr_ty("x == 3"), "Bool");
    }

    #[test]
    fn test_pointer_arithmetic() {
        assert_eq!(expr_ty("s + 1"), "U8*");
        assert_eq!(expr_ty("s - s"), "I64");
    }

    #[test]
    fn test_pointer_plus_pointer_rejected() {
        let err = analyze_src("U8 *a; U8 *b; I64 F() { return a + b; }").unwrap_err();
        assert_eq!(err.code, "HC3010");
    }

    #[test]
    fn test_logical_needs_scalar() {
        assert_eq!(expr_ty("x && s"), "Bool");
    }

    #[test]
    fn test_lane_types_and_bounds() {
        let typed = analyze_src("I64 F() { I64 v; return v.u8[1]; }").unwrap();
        let ret = &typed.children[0].child_of(NodeKind::Block).unwrap().children[1];
        assert_eq!(ret.children[0].ty, "U8");

        let err = analyze_src("I64 F() { I64 v; return v.u8[8]; }").unwrap_err();
        assert_eq!(err.code, "HC3016");

        let err = analyze_src("I64 F() { U8 v; return v.u16[0]; }").unwrap_err();
        assert_eq!(err.code, "HC3015");
    }

    #[test]
    fn test_lane_signed_variant() {
        let typed = analyze_src("I64 F() { I64 v; return v.i16[2]; }").unwrap();
        let ret = &typed.children[0].child_of(NodeKind::Block).unwrap().children[1];
        assert_eq!(ret.children[0].ty, "I16");
    }

    #[test]
    fn test_member_types() {
        let typed = analyze_src("class CPt { I64 x; F64 w; }; I64 F() { CPt p; return p.x; }").unwrap();
        let f = typed.children.iter().find(|c| c.kind == NodeKind::FunctionDecl).unwrap();
        let ret = &f.child_of(NodeKind::Block).unwrap().children[1];
        assert_eq!(ret.children[0].ty, "I64");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = analyze_src("class CPt { I64 x; }; I64 F() { CPt p; return p.zz; }").unwrap_err();
        assert_eq!(err.code, "HC3017");
    }

    #[test]
    fn test_union_layout() {
        let parsed = Parser::parse_source("union U { I64 a; I8 b; };", "t.HC").unwrap();
        let mut analyzer = Analyzer::new("t.HC", SemaOptions::default());
        analyzer.run(&parsed).unwrap();
        let layout = analyzer.aggregates.get("U").unwrap();
        assert!(layout.is_union);
        assert_eq!(layout.size, 8);
        assert!(layout.fields.iter().all(|f| f.offset == 0));
    }

    #[test]
    fn test_struct_layout_sequential_no_padding() {
        let parsed = Parser::parse_source("class C { I8 a; I64 b; I16 c; };", "t.HC").unwrap();
        let mut analyzer = Analyzer::new("t.HC", SemaOptions::default());
        analyzer.run(&parsed).unwrap();
        let layout = analyzer.aggregates.get("C").unwrap();
        assert_eq!(layout.fields[0].offset, 0);
        assert_eq!(layout.fields[1].offset, 1);
        assert_eq!(layout.fields[2].offset, 9);
        assert_eq!(layout.size, 11);
    }

    #[test]
    fn test_duplicate_function_rejected() {
        let err = analyze_src("I64 F() { return 1; } I64 F() { return 2; }").unwrap_err();
        assert_eq!(err.code, "HC3002");
    }

    #[test]
    fn test_prototype_then_definition_ok() {
        assert!(analyze_src("I64 F(I64 a); I64 F(I64 a) { return a; }").is_ok());
    }

    #[test]
    fn test_signature_conflict() {
        let err = analyze_src("I64 F(I64 a); I64 F(F64 a) { return 0; }").unwrap_err();
        assert_eq!(err.code, "HC3004");
    }

    #[test]
    fn test_import_with_body_rejected() {
        let err = analyze_src("import I64 Ext() { return 1; }").unwrap_err();
        assert_eq!(err.code, "HC3003");
    }

    #[test]
    fn test_global_function_namespace_shared() {
        let err = analyze_src("I64 F() { return 0; } I64 F;").unwrap_err();
        assert_eq!(err.code, "HC3005");
    }

    #[test]
    fn test_goto_rules() {
        assert!(analyze_src("U0 F() { again: goto again; }").is_ok());
        let err = analyze_src("U0 F() { goto missing; }").unwrap_err();
        assert_eq!(err.code, "HC3033");
        let err = analyze_src("U0 F() { goto inner; if (1) { inner: } }").unwrap_err();
        assert_eq!(err.code, "HC3031");
        let err = analyze_src("U0 F() { goto skip; I64 v = 3; skip: v = 1; }").unwrap_err();
        assert_eq!(err.code, "HC3032");
    }

    #[test]
    fn test_goto_backward_over_init_ok() {
        assert!(analyze_src("U0 F() { I64 v = 3; again: v = v - 1; if (v) goto again; }").is_ok());
    }

    #[test]
    fn test_duplicate_label() {
        let err = analyze_src("U0 F() { l: l: }").unwrap_err();
        assert_eq!(err.code, "HC3030");
    }

    #[test]
    fn test_strict_mode_rejections_each_code() {
        let cases = [
            ("public U0 F() {}", "HC3050"),
            ("interrupt U0 F() {}", "HC3051"),
            ("noreg U0 F() {}", "HC3052"),
            ("reg U0 F() {}", "HC3053"),
            ("no_warn U0 F() {}", "HC3054"),
            ("_extern U0 F();", "HC3055"),
            ("_import U0 F();", "HC3056"),
            ("_export U0 F() {}", "HC3057"),
        ];
        for (src, code) in cases {
            let err = analyze_src(src).unwrap_err();
            assert_eq!(err.code, code, "source: {}", src);
            assert!(err.message.contains('\''), "token embedded in message");
        }
    }

    #[test]
    fn test_permissive_mode_strips() {
        let typed = analyze_permissive("public U0 F() {}").unwrap();
        let f = &typed.children[0];
        assert!(f.children.iter().all(|c| c.kind != NodeKind::DeclSpec || c.text != "public"));
    }

    #[test]
    fn test_print_format_checking() {
        assert!(analyze_src("U0 F() { \"%d %s\\n\", 42, \"hi\"; }").is_ok());
        let err = analyze_src("U0 F() { \"%d\\n\"; }").unwrap_err();
        assert_eq!(err.code, "HC3019");
        let err = analyze_src("U0 F() { \"%s\\n\", 42; }").unwrap_err();
        assert_eq!(err.code, "HC3018");
        let err = analyze_src("U0 F() { \"%q\\n\", 1; }").unwrap_err();
        assert_eq!(err.code, "HC3018");
    }

    #[test]
    fn test_print_star_width_consumes_arg() {
        assert!(analyze_src("U0 F() { \"%*d\\n\", 8, 42; }").is_ok());
        assert!(analyze_src("U0 F() { \"%.*f\\n\", 2, 1.5; }").is_ok());
    }

    #[test]
    fn test_print_z_takes_two_args() {
        assert!(analyze_src("U0 F() { \"%z\\n\", 1, \"a\\0b\\0\"; }").is_ok());
        let err = analyze_src("U0 F() { \"%z\\n\", 1; }").unwrap_err();
        assert_eq!(err.code, "HC3019");
    }

    #[test]
    fn test_dynamic_format_forwarding() {
        assert!(analyze_src("U0 F(U8 *fmt) { \"\", fmt, 1, 2; }").is_ok());
    }

    #[test]
    fn test_throw_payload_integral() {
        assert!(analyze_src("U0 F() { throw(7); }").is_ok());
        let err = analyze_src("U0 F() { throw(1.5); }").unwrap_err();
        assert_eq!(err.code, "HC3040");
    }

    #[test]
    fn test_asm_constraint_pairing() {
        assert!(analyze_src("U0 F() { I64 v; asm(\"nop\", \"r\"(v), \"~{memory}\"); }").is_ok());
        let err = analyze_src("U0 F() { asm(\"nop\", \"r\"); }").unwrap_err();
        assert_eq!(err.code, "HC3021");
        let err = analyze_src("U0 F() { I64 v; asm(\"nop\", \"~{memory}\"(v)); }").unwrap_err();
        assert_eq!(err.code, "HC3021");
    }

    #[test]
    fn test_call_checks() {
        assert!(analyze_src("I64 G(I64 a, I64 b=2) { return a+b; } I64 F() { return G(1); }").is_ok());
        let err = analyze_src("I64 G(I64 a) { return a; } I64 F() { return G(); }").unwrap_err();
        assert_eq!(err.code, "HC3012");
        let err = analyze_src("I64 G(I64 a) { return a; } I64 F() { return G(1, 2); }").unwrap_err();
        assert_eq!(err.code, "HC3012");
    }

    #[test]
    fn test_empty_arg_requires_default() {
        assert!(analyze_src("I64 G(I64 a=1, I64 b=2) { return a+b; } I64 F() { return G(,5); }").is_ok());
        let err = analyze_src("I64 G(I64 a, I64 b) { return a+b; } I64 F() { return G(,5); }").unwrap_err();
        assert_eq!(err.code, "HC3012");
    }

    #[test]
    fn test_unknown_callee_tolerated() {
        // The lowerer synthesizes a signature from the call site.
        assert!(analyze_src("I64 F() { return Mystery(1, 2); }").is_ok());
    }

    #[test]
    fn test_unknown_identifier_rejected() {
        let err = analyze_src("I64 F() { return nope; }").unwrap_err();
        assert_eq!(err.code, "HC3001");
    }

    #[test]
    fn test_builtins_preseeded() {
        assert!(analyze_src("I64 F() { return TRUE + FALSE; }").is_ok());
        assert!(analyze_src("I64 F() { return PressAKey; }").is_ok());
        assert!(analyze_src("U8 *F() { return NULL; }").is_ok());
        assert!(analyze_src("I64 F() { return HolyC_Exception_Payload; }").is_ok());
    }

    #[test]
    fn test_spawn_defaults() {
        assert!(analyze_src("U0 W(I64 a) {} I64 F() { return Spawn(&W); }").is_ok());
    }

    #[test]
    fn test_typedef_alias_resolves() {
        assert!(analyze_src("typedef I64 TInt; I64 F() { TInt v = 3; return v; }").is_ok());
    }

    #[test]
    fn test_indirect_call_through_fn_type() {
        let typed = analyze_src("F64 G() { return 1.5; } F64 F() { return G(); }").unwrap();
        let f = typed.children.iter().find(|c| c.text == "F").unwrap();
        let ret = &f.child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(ret.children[0].ty, "F64");
    }

    #[test]
    fn test_switch_cond_integral() {
        let err = analyze_src("U0 F() { F64 f; switch (f) { case 0: break; } }").unwrap_err();
        assert_eq!(err.code, "HC3010");
    }

    #[test]
    fn test_format_class_table() {
        let classes = parse_format_classes("%d %5.2f %s %p %z %x %%").unwrap();
        assert_eq!(
            classes,
            vec![ArgClass::Int, ArgClass::Float, ArgClass::Str, ArgClass::Ptr, ArgClass::Int, ArgClass::Ptr, ArgClass::Int]
        );
    }
}
