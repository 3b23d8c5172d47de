//! LLVM IR generation via text.
//!
//! Produces opaque-pointer IR (LLVM 15+) as a plain string; clang
//! re-verifies whenever the text is consumed, and an internal structural
//! verifier runs over every emitted module first. Emission is fully
//! deterministic: name counters and insertion-ordered tables only.
//!
//! Layout notes: aggregates emit as packed structs so offsets match the
//! no-padding layout the analyzer computed; unions collapse to the
//! single largest member and every union field reads through offset 0.

use crate::builtins;
use crate::hir::*;
use crate::lexer;
use crate::sema;
use holyc_runtime::TRY_FRAME_BYTES;
use std::collections::HashMap;
use std::fmt::Write as _;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmitError {
    /// A logical error (bad shapes, unknown symbols, non-constant
    /// global initializers).
    #[error("irbuilder emit: {0}")]
    Logic(String),
    #[error("irbuilder emit: {0}")]
    Format(#[from] std::fmt::Error),
    #[error("irbuilder emit: module verification failed: {0}")]
    Verify(String),
}

/// Emission options. `entry_wrap` renames the entry function to
/// `__holyc_entry_target_<n>` and synthesizes `__holyc_entry_<n>()`.
#[derive(Debug, Clone)]
pub struct EmitOptions {
    pub module_name: String,
    pub source_file: String,
    /// JIT modules never get a host `main` wrapper.
    pub jit: bool,
    pub entry_wrap: Option<(String, usize)>,
    /// Distinguishes private globals when session modules are merged.
    pub module_tag: String,
}

impl Default for EmitOptions {
    fn default() -> Self {
        EmitOptions {
            module_name: "holyc_module".to_string(),
            source_file: "<memory>".to_string(),
            jit: false,
            entry_wrap: None,
            module_tag: String::new(),
        }
    }
}

/// The fixed runtime declaration block: every emitted module declares
/// this set, and the JIT resolves undefined symbols against it.
pub const RUNTIME_DECLS: &[(&str, &str)] = &[
    ("hc_runtime_abi_version", "declare i64 @hc_runtime_abi_version()"),
    ("hc_print_str", "declare void @hc_print_str(ptr)"),
    ("hc_put_char", "declare void @hc_put_char(i64)"),
    ("hc_print_fmt", "declare void @hc_print_fmt(ptr, ptr, i64)"),
    ("hc_try_push", "declare void @hc_try_push(ptr)"),
    ("hc_try_pop", "declare void @hc_try_pop(ptr)"),
    ("hc_throw_i64", "declare void @hc_throw_i64(i64)"),
    ("hc_exception_payload", "declare i64 @hc_exception_payload()"),
    ("hc_exception_active", "declare i64 @hc_exception_active()"),
    ("hc_try_depth", "declare i64 @hc_try_depth()"),
    ("hc_malloc", "declare ptr @hc_malloc(i64)"),
    ("hc_free", "declare void @hc_free(ptr)"),
    ("hc_memcpy", "declare ptr @hc_memcpy(ptr, ptr, i64)"),
    ("hc_memset", "declare ptr @hc_memset(ptr, i64, i64)"),
    ("hc_register_reflection_table", "declare void @hc_register_reflection_table(ptr, i64)"),
    ("hc_reflection_fields", "declare ptr @hc_reflection_fields()"),
    ("hc_reflection_field_count", "declare i64 @hc_reflection_field_count()"),
    ("hc_task_spawn", "declare i64 @hc_task_spawn(ptr, i64, ptr)"),
    ("hc_task_wait_all", "declare void @hc_task_wait_all()"),
    ("CallStkGrow", "declare i64 @CallStkGrow(i64, ptr, i64)"),
    ("Spawn", "declare i64 @Spawn(ptr, i64, ptr)"),
    ("JobQue", "declare i64 @JobQue(ptr, i64)"),
    ("JobResGet", "declare i64 @JobResGet(i64)"),
    ("HashFind", "declare ptr @HashFind(ptr, ptr, i64)"),
    ("MemberMetaData", "declare ptr @MemberMetaData(ptr, ptr)"),
    ("MemberMetaFind", "declare i64 @MemberMetaFind(ptr, ptr)"),
    ("PressAKey", "declare i64 @PressAKey()"),
    ("ClassRep", "declare void @ClassRep(ptr)"),
    ("_setjmp", "declare i32 @_setjmp(ptr) returns_twice"),
];

/// Symbol names of the runtime set (for the JIT resolution policy).
pub fn runtime_symbols() -> Vec<&'static str> {
    RUNTIME_DECLS.iter().map(|(name, _)| *name).collect()
}

/// An SSA value: its printable form, LLVM type, and HolyC type.
#[derive(Debug, Clone)]
struct Val {
    repr: String,
    llvm: String,
    hc: String,
}

impl Val {
    fn new(repr: impl Into<String>, llvm: impl Into<String>, hc: impl Into<String>) -> Self {
        Val { repr: repr.into(), llvm: llvm.into(), hc: hc.into() }
    }
}

/// An assignable location. Lanes carry the shift/mask recipe and write
/// back through their base place, which supports chained lane access.
#[derive(Debug, Clone)]
enum Place {
    Ptr { ptr: String, llvm: String, hc: String },
    Lane {
        base: Box<Place>,
        shift: String,
        base_bits: usize,
        lane_bits: usize,
        signed: bool,
        hc: String,
    },
}

impl Place {
    fn hc(&self) -> &str {
        match self {
            Place::Ptr { hc, .. } => hc,
            Place::Lane { hc, .. } => hc,
        }
    }
}

#[derive(Debug, Clone)]
struct FieldInfo {
    name: String,
    hc: String,
    index: usize,
}

#[derive(Debug, Clone)]
struct AggInfo {
    llvm_name: String,
    is_union: bool,
    fields: Vec<FieldInfo>,
    size: usize,
}

#[derive(Debug, Clone)]
struct FnInfo {
    symbol: String,
    ret: String,
    params: Vec<String>,
    internal: bool,
}

#[derive(Debug, Clone)]
struct Local {
    ptr: String,
    hc: String,
}

enum ConstVal {
    Int(i64),
    Float(f64),
    Str(String),
}

pub struct Emitter<'a> {
    module: &'a HirModule,
    opts: &'a EmitOptions,

    type_defs: String,
    globals_out: String,
    body: String,

    tmp: usize,
    blocks: usize,
    local_counter: usize,

    strings: Vec<(String, String)>,
    string_index: HashMap<String, usize>,

    aggregates: HashMap<String, AggInfo>,
    agg_order: Vec<String>,
    functions: HashMap<String, FnInfo>,
    globals: HashMap<String, String>,
    extra_decls: Vec<String>,

    // Per-function state
    allocas: String,
    code: String,
    current_block: String,
    terminated: bool,
    locals: HashMap<String, Local>,
    label_blocks: HashMap<String, String>,
    break_stack: Vec<String>,
    fn_ret: String,
    in_lock: bool,

    reflection_global: Option<(String, usize)>,
    init_fn: Option<String>,
    uses_refl_type: bool,
}

/// Emit a verified LLVM IR module for the lowered program.
pub fn emit(module: &HirModule, opts: &EmitOptions) -> Result<String, EmitError> {
    let mut e = Emitter::new(module, opts);
    e.build_aggregates()?;
    e.build_functions();
    e.emit_top_level()?;
    e.emit_functions()?;
    e.emit_wrappers()?;
    let text = e.assemble();
    verify_module(&text)?;
    Ok(text)
}

impl<'a> Emitter<'a> {
    fn new(module: &'a HirModule, opts: &'a EmitOptions) -> Self {
        Emitter {
            module,
            opts,
            type_defs: String::new(),
            globals_out: String::new(),
            body: String::new(),
            tmp: 0,
            blocks: 0,
            local_counter: 0,
            strings: Vec::new(),
            string_index: HashMap::new(),
            aggregates: HashMap::new(),
            agg_order: Vec::new(),
            functions: HashMap::new(),
            globals: HashMap::new(),
            extra_decls: Vec::new(),
            allocas: String::new(),
            code: String::new(),
            current_block: String::new(),
            terminated: false,
            locals: HashMap::new(),
            label_blocks: HashMap::new(),
            break_stack: Vec::new(),
            fn_ret: String::new(),
            in_lock: false,
            reflection_global: None,
            init_fn: None,
            uses_refl_type: false,
        }
    }

    fn logic(&self, msg: impl Into<String>) -> EmitError {
        EmitError::Logic(msg.into())
    }

    fn tag(&self) -> String {
        if self.opts.module_tag.is_empty() {
            String::new()
        } else {
            format!(".{}", self.opts.module_tag)
        }
    }

    // ==================================================================
    // Naming and small helpers
    // ==================================================================

    fn new_tmp(&mut self) -> String {
        self.tmp += 1;
        format!("%t{}", self.tmp)
    }

    fn new_block(&mut self, prefix: &str) -> String {
        self.blocks += 1;
        format!("{}.{}", prefix, self.blocks)
    }

    fn ins(&mut self, text: String) {
        if self.terminated {
            let dead = self.new_block("dead");
            self.start_block(&dead);
        }
        self.code.push_str("  ");
        self.code.push_str(&text);
        self.code.push('\n');
    }

    fn start_block(&mut self, label: &str) {
        self.code.push_str(label);
        self.code.push_str(":\n");
        self.current_block = label.to_string();
        self.terminated = false;
    }

    fn term(&mut self, text: String) {
        if self.terminated {
            let dead = self.new_block("dead");
            self.start_block(&dead);
        }
        self.code.push_str("  ");
        self.code.push_str(&text);
        self.code.push('\n');
        self.terminated = true;
    }

    fn br(&mut self, target: &str) {
        if !self.terminated {
            self.term(format!("br label %{}", target));
        }
    }

    /// LLVM type of a HolyC type string.
    fn llvm_ty(&self, hc: &str) -> String {
        if hc.ends_with('*') || hc.starts_with("fn ") {
            return "ptr".to_string();
        }
        match hc {
            "U0" => "void".to_string(),
            "Bool" | "Bool(chained)" => "i1".to_string(),
            "I8" | "U8" => "i8".to_string(),
            "I16" | "U16" => "i16".to_string(),
            "I32" | "U32" => "i32".to_string(),
            "I64" | "U64" | "Unknown" => "i64".to_string(),
            "F64" => "double".to_string(),
            name => match self.aggregates.get(name) {
                Some(info) => info.llvm_name.clone(),
                None => "i64".to_string(),
            },
        }
    }

    /// Byte size used for pointer arithmetic scaling.
    fn size_of(&self, hc: &str) -> usize {
        if hc.ends_with('*') || hc.starts_with("fn ") {
            return 8;
        }
        match self.aggregates.get(hc) {
            Some(info) => info.size.max(1),
            None => sema::size_of_scalar(hc),
        }
    }

    fn string_global(&mut self, content: &str) -> String {
        if let Some(&idx) = self.string_index.get(content) {
            return self.strings[idx].0.clone();
        }
        let name = format!("@.str{}.{}", self.tag(), self.strings.len());
        self.string_index.insert(content.to_string(), self.strings.len());
        self.strings.push((name.clone(), content.to_string()));
        name
    }

    // ==================================================================
    // Module-level preparation
    // ==================================================================

    /// Struct types from the reflection rows plus the pre-seeded runtime
    /// classes; unions collapse to their largest member.
    fn build_aggregates(&mut self) -> Result<(), EmitError> {
        let module = self.module;
        let mut union_flags: HashMap<&str, bool> = HashMap::new();
        for agg in &module.aggregates {
            if union_flags.insert(agg.name.as_str(), agg.is_union).is_some() {
                return Err(self.logic(format!("duplicate aggregate definition '{}'", agg.name)));
            }
        }

        // Program aggregates in declaration order.
        for agg in &module.aggregates {
            let rows: Vec<&HirReflectionField> = module
                .reflection
                .fields
                .iter()
                .filter(|f| f.aggregate == agg.name)
                .collect();
            self.install_aggregate(&agg.name, agg.is_union, rows.iter().map(|f| (f.field.as_str(), f.ty.as_str())));
        }
        // Runtime classes, only when not shadowed.
        for (name, fields) in builtins::BUILTIN_CLASSES {
            if !self.aggregates.contains_key(*name) {
                self.install_aggregate(name, false, fields.iter().map(|f| (f.name, f.ty)));
            }
        }

        for name in self.agg_order.clone() {
            let info = &self.aggregates[&name];
            let mut elems: Vec<String> = Vec::new();
            if info.is_union {
                // Single element: the largest field.
                let largest = info
                    .fields
                    .iter()
                    .max_by_key(|f| self.size_of(&f.hc))
                    .map(|f| self.llvm_ty(&f.hc))
                    .unwrap_or_else(|| "i64".to_string());
                elems.push(largest);
            } else {
                for f in &info.fields {
                    elems.push(self.llvm_ty(&f.hc));
                }
            }
            let _ = writeln!(self.type_defs, "{} = type <{{ {} }}>", info.llvm_name, elems.join(", "));
        }
        Ok(())
    }

    fn install_aggregate<'f>(&mut self, name: &str, is_union: bool, fields: impl Iterator<Item = (&'f str, &'f str)>) {
        let mut info = AggInfo {
            llvm_name: format!("%class.{}", name),
            is_union,
            fields: Vec::new(),
            size: 0,
        };
        for (idx, (fname, fty)) in fields.enumerate() {
            let fsize = if fty.ends_with('*') { 8 } else { sema::size_of_scalar(fty) };
            info.fields.push(FieldInfo {
                name: fname.to_string(),
                hc: fty.to_string(),
                index: if is_union { 0 } else { idx },
            });
            if is_union {
                info.size = info.size.max(fsize);
            } else {
                info.size += fsize;
            }
        }
        self.agg_order.push(name.to_string());
        self.aggregates.insert(name.to_string(), info);
    }

    fn build_functions(&mut self) {
        for (name, b) in builtins::BUILTIN_FNS.iter() {
            self.functions.insert(
                name.to_string(),
                FnInfo {
                    symbol: b.symbol.to_string(),
                    ret: b.ret.to_string(),
                    params: b.params.iter().map(|p| p.ty.to_string()).collect(),
                    internal: false,
                },
            );
        }
        let module = self.module;
        for decl in &module.function_decls {
            if self.functions.contains_key(&decl.name) {
                continue;
            }
            let params: Vec<String> = decl.params.iter().map(|(ty, _)| ty.clone()).collect();
            let param_tys: Vec<String> = params.iter().map(|p| self.llvm_ty(p)).collect();
            let decl_line = format!(
                "declare {} @{}({})",
                self.llvm_ty(&decl.return_type),
                decl.name,
                param_tys.join(", ")
            );
            self.extra_decls.push(decl_line);
            self.functions.insert(
                decl.name.clone(),
                FnInfo { symbol: decl.name.clone(), ret: decl.return_type.clone(), params, internal: false },
            );
        }
        for func in &module.functions {
            let symbol = match &self.opts.entry_wrap {
                Some((entry, n)) if *entry == func.name => format!("__holyc_entry_target_{}", n),
                _ => func.name.clone(),
            };
            self.functions.insert(
                func.name.clone(),
                FnInfo {
                    symbol,
                    ret: func.return_type.clone(),
                    params: func.params.iter().map(|(ty, _)| ty.clone()).collect(),
                    internal: func.linkage == LinkageKind::Internal,
                },
            );
        }
    }

    /// Globals, linkage declarations, metadata comments, the reflection
    /// table, and the list of statements for the module init function.
    fn emit_top_level(&mut self) -> Result<(), EmitError> {
        let module = self.module;
        // Globals whose initializers run in the module init function.
        let mut deferred: Vec<(&String, &String, &HirExpr)> = Vec::new();

        for item in &module.top_level_items {
            match item {
                HirStmt::VarDecl { name, ty, init, storage, const_init } => {
                    if self.globals.contains_key(name) {
                        return Err(self.logic(format!("duplicate global definition '{}'", name)));
                    }
                    let llvm = self.llvm_ty(ty);
                    let linkage = match storage {
                        StorageClass::StaticGlobal => "internal global",
                        _ => "global",
                    };
                    let init_text = match init {
                        Some(expr) if *const_init => self.const_global_init(expr, ty)?,
                        _ => self.zero_init(&llvm),
                    };
                    let _ = writeln!(self.globals_out, "@{} = {} {} {}", name, linkage, llvm, init_text);
                    self.globals.insert(name.clone(), ty.clone());
                    if let (Some(expr), false) = (init, *const_init) {
                        deferred.push((name, ty, expr));
                    }
                }
                HirStmt::LinkageDecl { name, ty } => {
                    if !self.globals.contains_key(name) {
                        let llvm = self.llvm_ty(ty);
                        let _ = writeln!(self.globals_out, "@{} = external global {}", name, llvm);
                        self.globals.insert(name.clone(), ty.clone());
                    }
                }
                HirStmt::MetadataDecl { name, payload } => {
                    let _ = writeln!(self.globals_out, "; metadata {} {}", name, payload);
                }
                _ => {
                    // Executable top-level statement: emitted into the
                    // init function after the globals exist.
                }
            }
        }

        // Reflection table.
        if !module.reflection.fields.is_empty() {
            self.uses_refl_type = true;
            let mut rows = Vec::new();
            for f in &module.reflection.fields {
                let agg = self.string_global(&f.aggregate);
                let field = self.string_global(&f.field);
                let ty = self.string_global(&f.ty);
                let ann = self.string_global(&f.annotations.join(" "));
                rows.push(format!(
                    "%HcReflField {{ ptr {}, ptr {}, ptr {}, ptr {} }}",
                    agg, field, ty, ann
                ));
            }
            let name = format!("@.hcrefl{}", self.tag());
            let _ = writeln!(
                self.globals_out,
                "{} = private unnamed_addr constant [{} x %HcReflField] [{}]",
                name,
                rows.len(),
                rows.join(", ")
            );
            self.reflection_global = Some((name, rows.len()));
        }

        // Module init function: deferred global stores plus executable
        // top-level statements, in source order.
        let has_exec = module.top_level_items.iter().any(|s| {
            !matches!(s, HirStmt::VarDecl { .. } | HirStmt::LinkageDecl { .. } | HirStmt::MetadataDecl { .. })
        });
        if !deferred.is_empty() || has_exec {
            let init_name = format!("__holyc_mod_init{}", self.tag());
            self.begin_function();
            self.fn_ret = "U0".to_string();
            for (name, ty, expr) in deferred {
                let v = self.emit_expr(expr)?;
                let v = self.coerce(v, ty)?;
                self.ins(format!("store {} {}, ptr @{}", v.llvm, v.repr, name));
            }
            for stmt in &module.top_level_items {
                if !matches!(stmt, HirStmt::VarDecl { .. } | HirStmt::LinkageDecl { .. } | HirStmt::MetadataDecl { .. }) {
                    self.emit_stmt(stmt)?;
                }
            }
            if !self.terminated {
                self.term("ret void".to_string());
            }
            let _ = writeln!(self.body, "define internal void @{}() {{", init_name);
            self.body.push_str("entry:\n");
            let allocas = std::mem::take(&mut self.allocas);
            let code = std::mem::take(&mut self.code);
            self.body.push_str(&allocas);
            self.body.push_str(&code);
            self.body.push_str("}\n\n");
            self.init_fn = Some(init_name);
        }
        Ok(())
    }

    fn zero_init(&self, llvm: &str) -> String {
        match llvm {
            "ptr" => "null".to_string(),
            "double" => "0.000000e+00".to_string(),
            l if l.starts_with("%class.") => "zeroinitializer".to_string(),
            _ => "0".to_string(),
        }
    }

    fn const_global_init(&mut self, expr: &HirExpr, ty: &str) -> Result<String, EmitError> {
        let value = self.const_eval(expr)?;
        let llvm = self.llvm_ty(ty);
        Ok(match value {
            ConstVal::Int(v) => {
                if llvm == "ptr" {
                    if v == 0 {
                        "null".to_string()
                    } else {
                        return Err(self.logic("non-null pointer global initializers are not constant"));
                    }
                } else if llvm == "double" {
                    double_repr(v as f64)
                } else {
                    truncate_to(v, &llvm).to_string()
                }
            }
            ConstVal::Float(v) => {
                if llvm == "double" {
                    double_repr(v)
                } else {
                    truncate_to(v as i64, &llvm).to_string()
                }
            }
            ConstVal::Str(content) => {
                let g = self.string_global(&content);
                if llvm != "ptr" {
                    return Err(self.logic("string initializer requires a pointer global"));
                }
                g
            }
        })
    }

    fn const_eval(&self, expr: &HirExpr) -> Result<ConstVal, EmitError> {
        match expr.kind {
            HirExprKind::IntLiteral => Ok(ConstVal::Int(lexer::parse_int_literal(&expr.text))),
            HirExprKind::CharLiteral => Ok(ConstVal::Int(lexer::char_literal_value(&expr.text))),
            HirExprKind::FloatLiteral => Ok(ConstVal::Float(lexer::parse_float_literal(&expr.text))),
            HirExprKind::StringLiteral => {
                Ok(ConstVal::Str(lexer::unescape(lexer::literal_inner(&expr.text))))
            }
            HirExprKind::Unary => {
                let v = self.const_eval(&expr.children[0])?;
                Ok(match (expr.text.as_str(), v) {
                    ("-", ConstVal::Int(v)) => ConstVal::Int(v.wrapping_neg()),
                    ("-", ConstVal::Float(v)) => ConstVal::Float(-v),
                    ("+", v) => v,
                    ("~", ConstVal::Int(v)) => ConstVal::Int(!v),
                    ("!", ConstVal::Int(v)) => ConstVal::Int((v == 0) as i64),
                    _ => return Err(self.logic("unsupported constant unary operator")),
                })
            }
            HirExprKind::Binary => {
                let a = self.const_eval(&expr.children[0])?;
                let b = self.const_eval(&expr.children[1])?;
                match (a, b) {
                    (ConstVal::Int(a), ConstVal::Int(b)) => Ok(ConstVal::Int(const_int_op(&expr.text, a, b)?)),
                    (ConstVal::Float(a), ConstVal::Float(b)) => Ok(ConstVal::Float(const_float_op(&expr.text, a, b)?)),
                    (ConstVal::Float(a), ConstVal::Int(b)) => {
                        Ok(ConstVal::Float(const_float_op(&expr.text, a, b as f64)?))
                    }
                    (ConstVal::Int(a), ConstVal::Float(b)) => {
                        Ok(ConstVal::Float(const_float_op(&expr.text, a as f64, b)?))
                    }
                    _ => Err(self.logic("unsupported constant operands")),
                }
            }
            HirExprKind::Cast => {
                let v = self.const_eval(&expr.children[0])?;
                let target = &expr.ty;
                Ok(match v {
                    ConstVal::Int(v) => {
                        if sema::is_float(target) {
                            ConstVal::Float(v as f64)
                        } else {
                            ConstVal::Int(v)
                        }
                    }
                    ConstVal::Float(v) => {
                        if sema::is_float(target) {
                            ConstVal::Float(v)
                        } else {
                            ConstVal::Int(v as i64)
                        }
                    }
                    s => s,
                })
            }
            HirExprKind::Comma => self.const_eval(expr.children.last().ok_or_else(|| self.logic("empty comma"))?),
            _ => Err(self.logic("initializer is not a constant expression")),
        }
    }

    // ==================================================================
    // Functions
    // ==================================================================

    fn begin_function(&mut self) {
        self.allocas = String::new();
        self.code = String::new();
        self.current_block = "entry".to_string();
        self.terminated = false;
        self.locals = HashMap::new();
        self.label_blocks = HashMap::new();
        self.break_stack = Vec::new();
        self.in_lock = false;
    }

    fn emit_functions(&mut self) -> Result<(), EmitError> {
        let module = self.module;
        for func in &module.functions {
            self.emit_function(func)?;
        }
        Ok(())
    }

    fn emit_function(&mut self, func: &HirFunction) -> Result<(), EmitError> {
        self.begin_function();
        self.fn_ret = func.return_type.clone();
        let info = self.functions.get(&func.name).cloned().expect("function installed");

        let mut param_sig = Vec::new();
        for (i, (ty, _)) in func.params.iter().enumerate() {
            let llvm = self.llvm_ty(ty);
            param_sig.push(format!("{} %p{}", llvm, i));
        }

        // Parameters land in entry-block allocas.
        for (i, (ty, name)) in func.params.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            let llvm = self.llvm_ty(ty);
            self.local_counter += 1;
            let ptr = format!("%{}.addr.{}", name, self.local_counter);
            let _ = writeln!(self.allocas, "  {} = alloca {}", ptr, llvm);
            self.ins(format!("store {} %p{}, ptr {}", llvm, i, ptr));
            self.locals.insert(name.clone(), Local { ptr, hc: ty.clone() });
        }

        for stmt in &func.body {
            self.emit_stmt(stmt)?;
        }
        if !self.terminated {
            self.emit_default_return();
        }

        let linkage = if info.internal { "internal " } else { "" };
        let _ = writeln!(
            self.body,
            "define {}{} @{}({}) {{",
            linkage,
            self.llvm_ty(&func.return_type),
            info.symbol,
            param_sig.join(", ")
        );
        self.body.push_str("entry:\n");
        let allocas = std::mem::take(&mut self.allocas);
        let code = std::mem::take(&mut self.code);
        self.body.push_str(&allocas);
        self.body.push_str(&code);
        self.body.push_str("}\n\n");
        Ok(())
    }

    fn emit_default_return(&mut self) {
        let ret = self.llvm_ty(&self.fn_ret.clone());
        match ret.as_str() {
            "void" => self.term("ret void".to_string()),
            "ptr" => self.term("ret ptr null".to_string()),
            "double" => self.term(format!("ret double {}", double_repr(0.0))),
            other => self.term(format!("ret {} 0", other)),
        }
    }

    // ==================================================================
    // Statements
    // ==================================================================

    fn emit_stmt(&mut self, stmt: &HirStmt) -> Result<(), EmitError> {
        match stmt {
            HirStmt::VarDecl { name, ty, init, storage, const_init } => {
                self.emit_local_decl(name, ty, init.as_ref(), *storage, *const_init)
            }
            HirStmt::Assign { op, target, value } => {
                self.emit_assignment(op, target, value)?;
                Ok(())
            }
            HirStmt::Return { value } => {
                match value {
                    Some(expr) => {
                        let v = self.emit_expr(expr)?;
                        let ret_ty = self.fn_ret.clone();
                        let v = self.coerce(v, &ret_ty)?;
                        self.term(format!("ret {} {}", v.llvm, v.repr));
                    }
                    None => {
                        if self.fn_ret == "U0" {
                            self.term("ret void".to_string());
                        } else {
                            self.emit_default_return();
                        }
                    }
                }
                Ok(())
            }
            HirStmt::Expr { expr } => {
                self.emit_expr(expr)?;
                Ok(())
            }
            HirStmt::NoParenCall { name } => {
                let info = self
                    .functions
                    .get(name)
                    .cloned()
                    .ok_or_else(|| self.logic(format!("unknown function '{}'", name)))?;
                let ret_llvm = self.llvm_ty(&info.ret);
                if ret_llvm == "void" {
                    self.ins(format!("call void @{}()", info.symbol));
                } else {
                    let t = self.new_tmp();
                    self.ins(format!("{} = call {} @{}()", t, ret_llvm, info.symbol));
                }
                Ok(())
            }
            HirStmt::Print { format, args } => self.emit_print(format, args),
            HirStmt::Lock { body } => {
                let prev = self.in_lock;
                self.in_lock = true;
                for s in body {
                    self.emit_stmt(s)?;
                }
                self.in_lock = prev;
                Ok(())
            }
            HirStmt::Throw { payload, .. } => {
                let v = self.emit_expr(payload)?;
                let v = self.coerce(v, "I64")?;
                self.ins(format!("call void @hc_throw_i64(i64 {})", v.repr));
                self.term("unreachable".to_string());
                Ok(())
            }
            HirStmt::TryCatch { region, body, catch } => self.emit_try(*region, body, catch),
            HirStmt::Break => {
                let target = self
                    .break_stack
                    .last()
                    .cloned()
                    .ok_or_else(|| self.logic("break outside of a loop or switch"))?;
                self.term(format!("br label %{}", target));
                Ok(())
            }
            HirStmt::Switch { cond, cases } => self.emit_switch(cond, cases),
            HirStmt::If { cond, then_body, else_body } => {
                let c = self.emit_expr(cond)?;
                let c = self.to_bool(c)?;
                let then_bb = self.new_block("if.then");
                let else_bb = self.new_block("if.else");
                let merge_bb = self.new_block("if.end");
                self.term(format!("br i1 {}, label %{}, label %{}", c.repr, then_bb, else_bb));

                self.start_block(&then_bb);
                for s in then_body {
                    self.emit_stmt(s)?;
                }
                self.br(&merge_bb);

                self.start_block(&else_bb);
                for s in else_body {
                    self.emit_stmt(s)?;
                }
                self.br(&merge_bb);

                self.start_block(&merge_bb);
                Ok(())
            }
            HirStmt::While { cond, body } => {
                let cond_bb = self.new_block("while.cond");
                let body_bb = self.new_block("while.body");
                let end_bb = self.new_block("while.end");
                self.br(&cond_bb);
                self.start_block(&cond_bb);
                let c = self.emit_expr(cond)?;
                let c = self.to_bool(c)?;
                self.term(format!("br i1 {}, label %{}, label %{}", c.repr, body_bb, end_bb));
                self.start_block(&body_bb);
                self.break_stack.push(end_bb.clone());
                for s in body {
                    self.emit_stmt(s)?;
                }
                self.break_stack.pop();
                self.br(&cond_bb);
                self.start_block(&end_bb);
                Ok(())
            }
            HirStmt::DoWhile { cond, body } => {
                let body_bb = self.new_block("do.body");
                let cond_bb = self.new_block("do.cond");
                let end_bb = self.new_block("do.end");
                self.br(&body_bb);
                self.start_block(&body_bb);
                self.break_stack.push(end_bb.clone());
                for s in body {
                    self.emit_stmt(s)?;
                }
                self.break_stack.pop();
                self.br(&cond_bb);
                self.start_block(&cond_bb);
                let c = self.emit_expr(cond)?;
                let c = self.to_bool(c)?;
                self.term(format!("br i1 {}, label %{}, label %{}", c.repr, body_bb, end_bb));
                self.start_block(&end_bb);
                Ok(())
            }
            HirStmt::Label { name } => {
                let block = self.label_block(name);
                self.br(&block);
                self.start_block(&block);
                Ok(())
            }
            HirStmt::Goto { name } => {
                let block = self.label_block(name);
                self.term(format!("br label %{}", block));
                Ok(())
            }
            HirStmt::InlineAsm { template, constraints, operands } => {
                let mut args = Vec::new();
                for op in operands.iter().flatten() {
                    let v = self.emit_expr(op)?;
                    args.push(format!("{} {}", v.llvm, v.repr));
                }
                self.ins(format!(
                    "call void asm sideeffect \"{}\", \"{}\"({})",
                    escape_ir_text(template),
                    escape_ir_text(&constraints.join(",")),
                    args.join(", ")
                ));
                Ok(())
            }
            HirStmt::MetadataDecl { .. } => Ok(()),
            HirStmt::LinkageDecl { name, ty } => {
                if !self.globals.contains_key(name) {
                    let llvm = self.llvm_ty(ty);
                    let _ = writeln!(self.globals_out, "@{} = external global {}", name, llvm);
                    self.globals.insert(name.clone(), ty.clone());
                }
                Ok(())
            }
        }
    }

    fn emit_local_decl(
        &mut self,
        name: &str,
        ty: &str,
        init: Option<&HirExpr>,
        storage: StorageClass,
        const_init: bool,
    ) -> Result<(), EmitError> {
        let llvm = self.llvm_ty(ty);
        match storage {
            StorageClass::StaticLocal | StorageClass::StaticGlobal => {
                self.local_counter += 1;
                let gname = format!("__holyc_static{}.{}.{}", self.tag(), name, self.local_counter);
                let init_text = match init {
                    Some(expr) if const_init => self.const_global_init(expr, ty)?,
                    Some(_) => {
                        return Err(self.logic(format!(
                            "static '{}' requires a constant initializer",
                            name
                        )));
                    }
                    None => self.zero_init(&llvm),
                };
                let _ = writeln!(self.globals_out, "@{} = internal global {} {}", gname, llvm, init_text);
                self.locals.insert(name.to_string(), Local { ptr: format!("@{}", gname), hc: ty.to_string() });
                Ok(())
            }
            _ => {
                self.local_counter += 1;
                let ptr = format!("%{}.addr.{}", name, self.local_counter);
                let _ = writeln!(self.allocas, "  {} = alloca {}", ptr, llvm);
                self.locals.insert(name.to_string(), Local { ptr: ptr.clone(), hc: ty.to_string() });
                if let Some(expr) = init {
                    let v = self.emit_expr(expr)?;
                    let v = self.coerce(v, ty)?;
                    self.ins(format!("store {} {}, ptr {}", v.llvm, v.repr, ptr));
                }
                Ok(())
            }
        }
    }

    fn label_block(&mut self, name: &str) -> String {
        if let Some(existing) = self.label_blocks.get(name) {
            return existing.clone();
        }
        let block = format!("user.{}", name);
        self.label_blocks.insert(name.to_string(), block.clone());
        block
    }

    fn emit_try(&mut self, region: i32, body: &[HirStmt], catch: &[HirStmt]) -> Result<(), EmitError> {
        let frame = format!("%try.frame.{}", region);
        let _ = writeln!(self.allocas, "  {} = alloca [{} x i8], align 16", frame, TRY_FRAME_BYTES);

        let body_bb = self.new_block("try.body");
        let catch_bb = self.new_block("try.catch");
        let end_bb = self.new_block("try.end");

        self.ins(format!("call void @hc_try_push(ptr {})", frame));
        let sj = self.new_tmp();
        self.ins(format!("{} = call i32 @_setjmp(ptr {})", sj, frame));
        let isz = self.new_tmp();
        self.ins(format!("{} = icmp eq i32 {}, 0", isz, sj));
        self.term(format!("br i1 {}, label %{}, label %{}", isz, body_bb, catch_bb));

        self.start_block(&body_bb);
        for s in body {
            self.emit_stmt(s)?;
        }
        if !self.terminated {
            self.ins(format!("call void @hc_try_pop(ptr {})", frame));
            self.term(format!("br label %{}", end_bb));
        }

        self.start_block(&catch_bb);
        for s in catch {
            self.emit_stmt(s)?;
        }
        self.br(&end_bb);

        self.start_block(&end_bb);
        Ok(())
    }

    fn emit_switch(&mut self, cond: &HirExpr, cases: &[SwitchCase]) -> Result<(), EmitError> {
        let cond_v = self.emit_expr(cond)?;
        let cmp_ty = sema::promote(&cond_v.hc, &cond_v.hc);
        let cond_v = self.coerce(cond_v, &cmp_ty)?;
        let unsigned = sema::is_unsigned(&cmp_ty);

        let end_bb = self.new_block("switch.end");
        let body_blocks: Vec<String> = (0..cases.len()).map(|i| self.new_block(&format!("case.body.{}", i))).collect();
        let check_indices: Vec<usize> = cases
            .iter()
            .enumerate()
            .filter(|(_, c)| c.flags & CASE_FLAG_DEFAULT == 0)
            .map(|(i, _)| i)
            .collect();
        let check_blocks: HashMap<usize, String> =
            check_indices.iter().map(|&i| (i, self.new_block(&format!("case.check.{}", i)))).collect();
        let default_idx = cases.iter().position(|c| c.flags & CASE_FLAG_DEFAULT != 0);
        let no_match: String = match default_idx {
            Some(i) => body_blocks[i].clone(),
            None => end_bb.clone(),
        };

        // Dispatch chain.
        match check_indices.first() {
            Some(&first) => {
                let target = check_blocks[&first].clone();
                self.term(format!("br label %{}", target));
            }
            None => {
                let target = no_match.clone();
                self.term(format!("br label %{}", target));
            }
        }

        for (pos, &i) in check_indices.iter().enumerate() {
            let check_bb = check_blocks[&i].clone();
            self.start_block(&check_bb);
            let case = &cases[i];
            let next: String = match check_indices.get(pos + 1) {
                Some(&n) => check_blocks[&n].clone(),
                None => no_match.clone(),
            };

            let matched = if case.flags & CASE_FLAG_RANGE != 0 {
                let lo = self.emit_case_value(case.begin.as_ref().unwrap(), &cmp_ty)?;
                let hi = self.emit_case_value(case.end.as_ref().unwrap(), &cmp_ty)?;
                let ge = self.new_tmp();
                let cmp_lo = if unsigned { "uge" } else { "sge" };
                let cmp_hi = if unsigned { "ule" } else { "sle" };
                self.ins(format!("{} = icmp {} {} {}, {}", ge, cmp_lo, cond_v.llvm, cond_v.repr, lo.repr));
                let le = self.new_tmp();
                self.ins(format!("{} = icmp {} {} {}, {}", le, cmp_hi, cond_v.llvm, cond_v.repr, hi.repr));
                let both = self.new_tmp();
                self.ins(format!("{} = and i1 {}, {}", both, ge, le));
                both
            } else {
                let value = self.emit_case_value(case.begin.as_ref().unwrap(), &cmp_ty)?;
                let eq = self.new_tmp();
                self.ins(format!("{} = icmp eq {} {}, {}", eq, cond_v.llvm, cond_v.repr, value.repr));
                eq
            };
            self.term(format!("br i1 {}, label %{}, label %{}", matched, body_blocks[i], next));
        }

        // Bodies in source order; fall-through goes to the next body.
        self.break_stack.push(end_bb.clone());
        for (i, case) in cases.iter().enumerate() {
            self.start_block(&body_blocks[i]);
            for s in &case.body {
                self.emit_stmt(s)?;
            }
            match body_blocks.get(i + 1) {
                Some(next_body) => {
                    let t = next_body.clone();
                    self.br(&t);
                }
                None => self.br(&end_bb),
            }
        }
        self.break_stack.pop();
        self.start_block(&end_bb);
        Ok(())
    }

    fn emit_case_value(&mut self, expr: &HirExpr, cmp_ty: &str) -> Result<Val, EmitError> {
        let v = self.emit_expr(expr)?;
        self.coerce(v, cmp_ty)
    }

    fn emit_print(&mut self, format: &HirExpr, args: &[HirExpr]) -> Result<(), EmitError> {
        // A lone char literal prints through hc_put_char.
        if format.kind == HirExprKind::CharLiteral && args.is_empty() {
            let value = lexer::char_literal_value(&format.text);
            self.ins(format!("call void @hc_put_char(i64 {})", value));
            return Ok(());
        }

        let fmt_classes = if format.kind == HirExprKind::StringLiteral {
            sema::parse_format_classes(lexer::literal_inner(&format.text)).ok()
        } else {
            None
        };

        let fmt_val = self.emit_expr(format)?;
        let fmt_val = self.coerce(fmt_val, "U8*")?;

        if args.is_empty() {
            self.ins(format!("call void @hc_print_fmt(ptr {}, ptr null, i64 0)", fmt_val.repr));
            return Ok(());
        }

        // Pack arguments into an entry-block i64 array.
        let n = args.len();
        self.local_counter += 1;
        let arr = format!("%print.args.{}", self.local_counter);
        let _ = writeln!(self.allocas, "  {} = alloca [{} x i64]", arr, n);

        for (i, arg) in args.iter().enumerate() {
            let v = self.emit_expr(arg)?;
            let wants_float = fmt_classes
                .as_ref()
                .and_then(|c| c.get(i))
                .map(|c| *c == sema::ArgClass::Float)
                .unwrap_or(sema::is_float(&v.hc));
            let packed = if wants_float {
                let d = self.coerce(v, "F64")?;
                let t = self.new_tmp();
                self.ins(format!("{} = bitcast double {} to i64", t, d.repr));
                Val::new(t, "i64", "I64")
            } else if v.llvm == "ptr" {
                let t = self.new_tmp();
                self.ins(format!("{} = ptrtoint ptr {} to i64", t, v.repr));
                Val::new(t, "i64", "I64")
            } else {
                self.coerce(v, "I64")?
            };
            let slot = self.new_tmp();
            self.ins(format!("{} = getelementptr [{} x i64], ptr {}, i64 0, i64 {}", slot, n, arr, i));
            self.ins(format!("store i64 {}, ptr {}", packed.repr, slot));
        }
        let first = self.new_tmp();
        self.ins(format!("{} = getelementptr [{} x i64], ptr {}, i64 0, i64 0", first, n, arr));
        self.ins(format!("call void @hc_print_fmt(ptr {}, ptr {}, i64 {})", fmt_val.repr, first, n));
        Ok(())
    }

    // ==================================================================
    // Expressions
    // ==================================================================

    fn emit_expr(&mut self, expr: &HirExpr) -> Result<Val, EmitError> {
        match expr.kind {
            HirExprKind::IntLiteral => {
                let v = lexer::parse_int_literal(&expr.text);
                if expr.ty.ends_with('*') {
                    if v == 0 {
                        Ok(Val::new("null", "ptr", expr.ty.clone()))
                    } else {
                        let t = self.new_tmp();
                        self.ins(format!("{} = inttoptr i64 {} to ptr", t, v));
                        Ok(Val::new(t, "ptr", expr.ty.clone()))
                    }
                } else {
                    let llvm = self.llvm_ty(&expr.ty);
                    Ok(Val::new(truncate_to(v, &llvm).to_string(), llvm, expr.ty.clone()))
                }
            }
            HirExprKind::FloatLiteral => {
                let v = lexer::parse_float_literal(&expr.text);
                Ok(Val::new(double_repr(v), "double", "F64"))
            }
            HirExprKind::CharLiteral => {
                Ok(Val::new(lexer::char_literal_value(&expr.text).to_string(), "i64", "I64"))
            }
            HirExprKind::StringLiteral => {
                let content = lexer::unescape(lexer::literal_inner(&expr.text));
                let g = self.string_global(&content);
                Ok(Val::new(g, "ptr", "U8*"))
            }
            HirExprKind::Dollar => Ok(Val::new("0", "i64", "I64")),
            HirExprKind::Var => self.emit_var(expr),
            HirExprKind::Unary => self.emit_unary(expr),
            HirExprKind::Postfix => self.emit_incdec(&expr.children[0], &expr.text, false),
            HirExprKind::Binary => self.emit_binary(expr),
            HirExprKind::Assign => {
                let target = expr.children[0].clone();
                let value = expr.children[1].clone();
                self.emit_assignment(&expr.text, &target, &value)
            }
            HirExprKind::Cast => {
                let v = self.emit_expr(&expr.children[0])?;
                self.coerce(v, &expr.ty)
            }
            HirExprKind::Comma => {
                let mut last = Val::new("0", "i64", "I64");
                for child in &expr.children {
                    last = self.emit_expr(child)?;
                }
                Ok(last)
            }
            HirExprKind::Lane | HirExprKind::Member | HirExprKind::Index => {
                let place = self.emit_place(expr)?;
                self.load_place(&place)
            }
            HirExprKind::Call => self.emit_call(expr),
        }
    }

    fn emit_var(&mut self, expr: &HirExpr) -> Result<Val, EmitError> {
        let name = &expr.text;
        if let Some(local) = self.locals.get(name).cloned() {
            let llvm = self.llvm_ty(&local.hc);
            let t = self.new_tmp();
            self.ins(format!("{} = load {}, ptr {}", t, llvm, local.ptr));
            return Ok(Val::new(t, llvm, local.hc));
        }
        if let Some(hc) = self.globals.get(name).cloned() {
            let llvm = self.llvm_ty(&hc);
            let t = self.new_tmp();
            self.ins(format!("{} = load {}, ptr @{}", t, llvm, name));
            return Ok(Val::new(t, llvm, hc));
        }
        if name == builtins::EXCEPTION_PAYLOAD_NAME {
            let t = self.new_tmp();
            self.ins(format!("{} = call i64 @hc_exception_payload()", t));
            return Ok(Val::new(t, "i64", "I64"));
        }
        if let Some(c) = builtins::builtin_const(name) {
            return Ok(match c.ty {
                "F64" => Val::new(double_repr(c.value as f64), "double", "F64"),
                ty if ty.ends_with('*') => Val::new("null", "ptr", ty),
                ty => Val::new(c.value.to_string(), "i64", ty),
            });
        }
        if let Some(info) = self.functions.get(name) {
            return Ok(Val::new(format!("@{}", info.symbol), "ptr", format!("fn {}", info.ret)));
        }
        Err(self.logic(format!("unknown identifier '{}'", name)))
    }

    fn emit_unary(&mut self, expr: &HirExpr) -> Result<Val, EmitError> {
        let op = expr.text.as_str();
        match op {
            "&" => {
                // Taking a function's address yields its code pointer.
                let child = &expr.children[0];
                if child.kind == HirExprKind::Var
                    && !self.locals.contains_key(&child.text)
                    && !self.globals.contains_key(&child.text)
                {
                    if let Some(info) = self.functions.get(&child.text) {
                        return Ok(Val::new(format!("@{}", info.symbol), "ptr", format!("fn {}*", info.ret)));
                    }
                }
                let place = self.emit_place(child)?;
                match place {
                    Place::Ptr { ptr, hc, .. } => Ok(Val::new(ptr, "ptr", format!("{}*", hc))),
                    Place::Lane { .. } => Err(self.logic("cannot take the address of a lane")),
                }
            }
            "*" => {
                let v = self.emit_expr(&expr.children[0])?;
                let pointee = sema::strip_pointer(&v.hc).to_string();
                let llvm = self.llvm_ty(&pointee);
                let t = self.new_tmp();
                self.ins(format!("{} = load {}, ptr {}", t, llvm, v.repr));
                Ok(Val::new(t, llvm, pointee))
            }
            "!" => {
                let v = self.emit_expr(&expr.children[0])?;
                let b = self.to_bool(v)?;
                let t = self.new_tmp();
                self.ins(format!("{} = xor i1 {}, true", t, b.repr));
                Ok(Val::new(t, "i1", "Bool"))
            }
            "~" => {
                let v = self.emit_expr(&expr.children[0])?;
                let t = self.new_tmp();
                self.ins(format!("{} = xor {} {}, -1", t, v.llvm, v.repr));
                Ok(Val::new(t, v.llvm, v.hc))
            }
            "+" => self.emit_expr(&expr.children[0]),
            "-" => {
                let v = self.emit_expr(&expr.children[0])?;
                let t = self.new_tmp();
                if v.llvm == "double" {
                    self.ins(format!("{} = fneg double {}", t, v.repr));
                } else {
                    self.ins(format!("{} = sub {} 0, {}", t, v.llvm, v.repr));
                }
                Ok(Val::new(t, v.llvm, v.hc))
            }
            "++" | "--" => self.emit_incdec(&expr.children[0], op, true),
            other => Err(self.logic(format!("unsupported unary operator '{}'", other))),
        }
    }

    /// Prefix/postfix increment and decrement; atomic inside lock blocks.
    fn emit_incdec(&mut self, operand: &HirExpr, op: &str, prefix: bool) -> Result<Val, EmitError> {
        let place = self.emit_place(operand)?;
        let hc = place.hc().to_string();
        let delta: i64 = if op == "++" { 1 } else { -1 };

        if self.in_lock {
            if let Place::Ptr { ptr, llvm, .. } = &place {
                if llvm != "ptr" && llvm != "double" {
                    let old = self.new_tmp();
                    let rmw = if delta > 0 { "add" } else { "sub" };
                    self.ins(format!("{} = atomicrmw {} ptr {}, {} 1 seq_cst", old, rmw, ptr, llvm));
                    if !prefix {
                        return Ok(Val::new(old, llvm.clone(), hc));
                    }
                    let t = self.new_tmp();
                    let add_op = if delta > 0 { "add" } else { "sub" };
                    self.ins(format!("{} = {} {} {}, 1", t, add_op, llvm, old));
                    return Ok(Val::new(t, llvm.clone(), hc));
                }
            }
        }

        let old = self.load_place(&place)?;
        let new = if sema::is_pointer(&hc) {
            let step = self.size_of(sema::strip_pointer(&hc)) as i64 * delta;
            let t = self.new_tmp();
            self.ins(format!("{} = getelementptr i8, ptr {}, i64 {}", t, old.repr, step));
            Val::new(t, "ptr", hc.clone())
        } else if old.llvm == "double" {
            let t = self.new_tmp();
            self.ins(format!("{} = fadd double {}, {}", t, old.repr, double_repr(delta as f64)));
            Val::new(t, "double", hc.clone())
        } else {
            let t = self.new_tmp();
            let op_name = if delta > 0 { "add" } else { "sub" };
            self.ins(format!("{} = {} {} {}, 1", t, op_name, old.llvm, old.repr));
            Val::new(t, old.llvm.clone(), hc.clone())
        };
        self.store_place(&place, new.clone())?;
        Ok(if prefix { new } else { old })
    }

    fn emit_binary(&mut self, expr: &HirExpr) -> Result<Val, EmitError> {
        let op = expr.text.as_str();
        if expr.ty == "Bool(chained)" {
            return self.emit_chain(expr);
        }
        match op {
            "&&" | "||" => return self.emit_logical(expr),
            _ => {}
        }

        let lhs = self.emit_expr(&expr.children[0])?;
        let rhs = self.emit_expr(&expr.children[1])?;

        match op {
            "+" | "-" if sema::is_pointer(&lhs.hc) && sema::is_pointer(&rhs.hc) => {
                // Pointer difference in bytes.
                let a = self.new_tmp();
                self.ins(format!("{} = ptrtoint ptr {} to i64", a, lhs.repr));
                let b = self.new_tmp();
                self.ins(format!("{} = ptrtoint ptr {} to i64", b, rhs.repr));
                let t = self.new_tmp();
                self.ins(format!("{} = sub i64 {}, {}", t, a, b));
                Ok(Val::new(t, "i64", "I64"))
            }
            "+" | "-" if sema::is_pointer(&lhs.hc) || sema::is_pointer(&rhs.hc) => {
                let (ptr, idx) = if sema::is_pointer(&lhs.hc) { (lhs, rhs) } else { (rhs, lhs) };
                let idx = self.coerce(idx, "I64")?;
                let size = self.size_of(sema::strip_pointer(&ptr.hc)) as i64;
                let scaled = self.new_tmp();
                self.ins(format!("{} = mul i64 {}, {}", scaled, idx.repr, size));
                let off = if op == "-" {
                    let n = self.new_tmp();
                    self.ins(format!("{} = sub i64 0, {}", n, scaled));
                    n
                } else {
                    scaled
                };
                let t = self.new_tmp();
                self.ins(format!("{} = getelementptr i8, ptr {}, i64 {}", t, ptr.repr, off));
                Ok(Val::new(t, "ptr", ptr.hc))
            }
            "+" | "-" | "*" | "/" | "%" => {
                let ty = &expr.ty;
                let l = self.coerce(lhs, ty)?;
                let r = self.coerce(rhs, ty)?;
                let t = self.new_tmp();
                if sema::is_float(ty) {
                    let fop = match op {
                        "+" => "fadd",
                        "-" => "fsub",
                        "*" => "fmul",
                        "/" => "fdiv",
                        _ => "frem",
                    };
                    self.ins(format!("{} = {} double {}, {}", t, fop, l.repr, r.repr));
                } else {
                    let unsigned = sema::is_unsigned(ty);
                    let iop = match op {
                        "+" => "add",
                        "-" => "sub",
                        "*" => "mul",
                        "/" => {
                            if unsigned {
                                "udiv"
                            } else {
                                "sdiv"
                            }
                        }
                        _ => {
                            if unsigned {
                                "urem"
                            } else {
                                "srem"
                            }
                        }
                    };
                    self.ins(format!("{} = {} {} {}, {}", t, iop, l.llvm, l.repr, r.repr));
                }
                Ok(Val::new(t, self.llvm_ty(ty), ty.clone()))
            }
            "&" | "|" | "^" | "<<" | ">>" => {
                let ty = &expr.ty;
                let l = self.coerce(lhs, ty)?;
                let r = self.coerce(rhs, ty)?;
                let t = self.new_tmp();
                let iop = match op {
                    "&" => "and",
                    "|" => "or",
                    "^" => "xor",
                    "<<" => "shl",
                    // Arithmetic right shift regardless of signedness,
                    // matching the original compiler.
                    _ => "ashr",
                };
                self.ins(format!("{} = {} {} {}, {}", t, iop, l.llvm, l.repr, r.repr));
                Ok(Val::new(t, l.llvm, ty.clone()))
            }
            "<" | ">" | "<=" | ">=" | "==" | "!=" => self.emit_compare(op, lhs, rhs),
            other => Err(self.logic(format!("unsupported binary operator '{}'", other))),
        }
    }

    fn emit_compare(&mut self, op: &str, lhs: Val, rhs: Val) -> Result<Val, EmitError> {
        if lhs.llvm == "ptr" || rhs.llvm == "ptr" {
            let l = self.coerce(lhs, "U64")?;
            let r = self.coerce(rhs, "U64")?;
            let cc = int_predicate(op, true);
            let t = self.new_tmp();
            self.ins(format!("{} = icmp {} i64 {}, {}", t, cc, l.repr, r.repr));
            return Ok(Val::new(t, "i1", "Bool"));
        }
        let common = sema::promote(&lhs.hc, &rhs.hc);
        let l = self.coerce(lhs, &common)?;
        let r = self.coerce(rhs, &common)?;
        let t = self.new_tmp();
        if sema::is_float(&common) {
            let cc = float_predicate(op);
            self.ins(format!("{} = fcmp {} double {}, {}", t, cc, l.repr, r.repr));
        } else {
            let cc = int_predicate(op, sema::is_unsigned(&common));
            self.ins(format!("{} = icmp {} {} {}, {}", t, cc, l.llvm, l.repr, r.repr));
        }
        Ok(Val::new(t, "i1", "Bool"))
    }

    /// HolyC comparison chains: `a < b < c` means `(a<b) && (b<c)` with
    /// each member evaluated once.
    fn emit_chain(&mut self, expr: &HirExpr) -> Result<Val, EmitError> {
        fn flatten<'e>(e: &'e HirExpr, members: &mut Vec<&'e HirExpr>, ops: &mut Vec<String>) {
            let relational = |x: &HirExpr| {
                x.kind == HirExprKind::Binary && matches!(x.text.as_str(), "<" | ">" | "<=" | ">=")
            };
            if relational(e) && relational(&e.children[0]) {
                flatten(&e.children[0], members, ops);
                ops.push(e.text.clone());
                members.push(&e.children[1]);
            } else {
                members.push(&e.children[0]);
                ops.push(e.text.clone());
                members.push(&e.children[1]);
            }
        }
        let mut members = Vec::new();
        let mut ops = Vec::new();
        flatten(expr, &mut members, &mut ops);

        let mut values = Vec::new();
        for m in &members {
            values.push(self.emit_expr(m)?);
        }
        let mut acc: Option<String> = None;
        for (i, op) in ops.iter().enumerate() {
            let cmp = self.emit_compare(op, values[i].clone(), values[i + 1].clone())?;
            acc = Some(match acc {
                None => cmp.repr,
                Some(prev) => {
                    let t = self.new_tmp();
                    self.ins(format!("{} = and i1 {}, {}", t, prev, cmp.repr));
                    t
                }
            });
        }
        Ok(Val::new(acc.unwrap_or_else(|| "true".to_string()), "i1", "Bool(chained)"))
    }

    fn emit_logical(&mut self, expr: &HirExpr) -> Result<Val, EmitError> {
        let is_and = expr.text == "&&";
        let lhs = self.emit_expr(&expr.children[0])?;
        let lhs = self.to_bool(lhs)?;
        let lhs_block = self.current_block.clone();

        let rhs_bb = self.new_block(if is_and { "land.rhs" } else { "lor.rhs" });
        let end_bb = self.new_block(if is_and { "land.end" } else { "lor.end" });
        if is_and {
            self.term(format!("br i1 {}, label %{}, label %{}", lhs.repr, rhs_bb, end_bb));
        } else {
            self.term(format!("br i1 {}, label %{}, label %{}", lhs.repr, end_bb, rhs_bb));
        }

        self.start_block(&rhs_bb);
        let rhs = self.emit_expr(&expr.children[1])?;
        let rhs = self.to_bool(rhs)?;
        let rhs_block = self.current_block.clone();
        self.term(format!("br label %{}", end_bb));

        self.start_block(&end_bb);
        let t = self.new_tmp();
        let short = if is_and { "false" } else { "true" };
        self.ins(format!(
            "{} = phi i1 [ {}, %{} ], [ {}, %{} ]",
            t, short, lhs_block, rhs.repr, rhs_block
        ));
        Ok(Val::new(t, "i1", "Bool"))
    }

    fn emit_call(&mut self, expr: &HirExpr) -> Result<Val, EmitError> {
        if !expr.text.is_empty() {
            // Direct call: arguments cast to the declared parameter types.
            let info = self
                .functions
                .get(&expr.text)
                .cloned()
                .ok_or_else(|| self.logic(format!("unknown function '{}'", expr.text)))?;
            let mut args = Vec::new();
            for (i, arg) in expr.children.iter().enumerate() {
                let v = self.emit_expr(arg)?;
                let v = match info.params.get(i) {
                    Some(pty) => self.coerce(v, &pty.clone())?,
                    None => v,
                };
                args.push(format!("{} {}", v.llvm, v.repr));
            }
            let ret_llvm = self.llvm_ty(&info.ret);
            if ret_llvm == "void" {
                self.ins(format!("call void @{}({})", info.symbol, args.join(", ")));
                return Ok(Val::new("0", "i64", "I64"));
            }
            let t = self.new_tmp();
            self.ins(format!("{} = call {} @{}({})", t, ret_llvm, info.symbol, args.join(", ")));
            return Ok(Val::new(t, ret_llvm, info.ret));
        }

        // Indirect call through a function pointer value.
        let callee = self.emit_expr(&expr.children[0])?;
        let mut args = Vec::new();
        for arg in &expr.children[1..] {
            let v = self.emit_expr(arg)?;
            args.push(format!("{} {}", v.llvm, v.repr));
        }
        let ret = if expr.ty.is_empty() { "I64".to_string() } else { expr.ty.clone() };
        let ret_llvm = self.llvm_ty(&ret);
        if ret_llvm == "void" {
            self.ins(format!("call void {}({})", callee.repr, args.join(", ")));
            return Ok(Val::new("0", "i64", "I64"));
        }
        let t = self.new_tmp();
        self.ins(format!("{} = call {} {}({})", t, ret_llvm, callee.repr, args.join(", ")));
        Ok(Val::new(t, ret_llvm, ret))
    }

    // ==================================================================
    // Assignment and places
    // ==================================================================

    fn emit_assignment(&mut self, op: &str, target: &HirExpr, value: &HirExpr) -> Result<Val, EmitError> {
        let place = self.emit_place(target)?;
        let target_hc = place.hc().to_string();

        if op == "=" {
            let v = self.emit_expr(value)?;
            let v = self.coerce(v, &target_hc)?;
            self.store_place(&place, v.clone())?;
            return Ok(v);
        }

        let bin_op = op.trim_end_matches('=');
        let rhs = self.emit_expr(value)?;

        // Atomic read-modify-write inside lock blocks.
        if self.in_lock {
            if let Place::Ptr { ptr, llvm, .. } = &place {
                if llvm != "ptr" && llvm != "double" {
                    let rhs = self.coerce(rhs, &target_hc)?;
                    let rmw = match bin_op {
                        "+" => Some("add"),
                        "-" => Some("sub"),
                        "&" => Some("and"),
                        "|" => Some("or"),
                        "^" => Some("xor"),
                        _ => None,
                    };
                    if let Some(rmw) = rmw {
                        let old = self.new_tmp();
                        self.ins(format!(
                            "{} = atomicrmw {} ptr {}, {} {} seq_cst",
                            old, rmw, ptr, llvm, rhs.repr
                        ));
                        let t = self.new_tmp();
                        let apply = match bin_op {
                            "+" => "add",
                            "-" => "sub",
                            "&" => "and",
                            "|" => "or",
                            _ => "xor",
                        };
                        self.ins(format!("{} = {} {} {}, {}", t, apply, llvm, old, rhs.repr));
                        return Ok(Val::new(t, llvm.clone(), target_hc));
                    }
                    return self.emit_cmpxchg_loop(&place, bin_op, rhs);
                }
            }
        }

        let old = self.load_place(&place)?;
        let synthetic = HirExpr::new(HirExprKind::Binary, bin_op, sema::promote(&old.hc, &rhs.hc));
        let combined = self.apply_binop(&synthetic, old, rhs)?;
        let combined = self.coerce(combined, &target_hc)?;
        self.store_place(&place, combined.clone())?;
        Ok(combined)
    }

    /// Sequentially consistent compare-exchange loop for compound ops
    /// without a native atomicrmw (mul, div, rem, shifts).
    fn emit_cmpxchg_loop(&mut self, place: &Place, bin_op: &str, rhs: Val) -> Result<Val, EmitError> {
        let (ptr, llvm, hc) = match place {
            Place::Ptr { ptr, llvm, hc } => (ptr.clone(), llvm.clone(), hc.clone()),
            Place::Lane { .. } => return Err(self.logic("atomic lane updates are not supported")),
        };
        let rhs = self.coerce(rhs, &hc)?;

        let align = match llvm.as_str() {
            "i8" => 1,
            "i16" => 2,
            "i32" => 4,
            _ => 8,
        };
        let start = self.new_tmp();
        self.ins(format!("{} = load atomic {}, ptr {} seq_cst, align {}", start, llvm, ptr, align));
        let pred = self.current_block.clone();
        let loop_bb = self.new_block("rmw.loop");
        let done_bb = self.new_block("rmw.done");
        self.term(format!("br label %{}", loop_bb));

        self.start_block(&loop_bb);
        let cur = self.new_tmp();
        let new = self.new_tmp();
        let pair = self.new_tmp();
        let got = self.new_tmp();
        let ok = self.new_tmp();
        let unsigned = sema::is_unsigned(&hc);
        let iop = match bin_op {
            "*" => "mul",
            "/" => {
                if unsigned {
                    "udiv"
                } else {
                    "sdiv"
                }
            }
            "%" => {
                if unsigned {
                    "urem"
                } else {
                    "srem"
                }
            }
            "<<" => "shl",
            ">>" => "ashr",
            other => return Err(self.logic(format!("unsupported atomic operator '{}='", other))),
        };
        self.ins(format!("{} = phi {} [ {}, %{} ], [ {}, %{} ]", cur, llvm, start, pred, got, loop_bb));
        self.ins(format!("{} = {} {} {}, {}", new, iop, llvm, cur, rhs.repr));
        self.ins(format!("{} = cmpxchg ptr {}, {} {}, {} {} seq_cst seq_cst", pair, ptr, llvm, cur, llvm, new));
        self.ins(format!("{} = extractvalue {{ {}, i1 }} {}, 0", got, llvm, pair));
        self.ins(format!("{} = extractvalue {{ {}, i1 }} {}, 1", ok, llvm, pair));
        self.term(format!("br i1 {}, label %{}, label %{}", ok, done_bb, loop_bb));

        self.start_block(&done_bb);
        Ok(Val::new(new, llvm, hc))
    }

    fn apply_binop(&mut self, shape: &HirExpr, lhs: Val, rhs: Val) -> Result<Val, EmitError> {
        // Reuses the binary emission path on already-computed values by
        // building a tiny wrapper expression around constants is not
        // possible, so the arithmetic is duplicated in compact form.
        let op = shape.text.as_str();
        if sema::is_pointer(&lhs.hc) && matches!(op, "+" | "-") {
            let idx = self.coerce(rhs, "I64")?;
            let size = self.size_of(sema::strip_pointer(&lhs.hc)) as i64;
            let scaled = self.new_tmp();
            self.ins(format!("{} = mul i64 {}, {}", scaled, idx.repr, size));
            let off = if op == "-" {
                let n = self.new_tmp();
                self.ins(format!("{} = sub i64 0, {}", n, scaled));
                n
            } else {
                scaled
            };
            let t = self.new_tmp();
            self.ins(format!("{} = getelementptr i8, ptr {}, i64 {}", t, lhs.repr, off));
            return Ok(Val::new(t, "ptr", lhs.hc));
        }
        let ty = shape.ty.clone();
        let l = self.coerce(lhs, &ty)?;
        let r = self.coerce(rhs, &ty)?;
        let t = self.new_tmp();
        if sema::is_float(&ty) {
            let fop = match op {
                "+" => "fadd",
                "-" => "fsub",
                "*" => "fmul",
                "/" => "fdiv",
                _ => "frem",
            };
            self.ins(format!("{} = {} double {}, {}", t, fop, l.repr, r.repr));
        } else {
            let unsigned = sema::is_unsigned(&ty);
            let iop = match op {
                "+" => "add",
                "-" => "sub",
                "*" => "mul",
                "/" => {
                    if unsigned {
                        "udiv"
                    } else {
                        "sdiv"
                    }
                }
                "%" => {
                    if unsigned {
                        "urem"
                    } else {
                        "srem"
                    }
                }
                "&" => "and",
                "|" => "or",
                "^" => "xor",
                "<<" => "shl",
                ">>" => "ashr",
                other => return Err(self.logic(format!("unsupported compound operator '{}='", other))),
            };
            self.ins(format!("{} = {} {} {}, {}", t, iop, l.llvm, l.repr, r.repr));
        }
        Ok(Val::new(t, self.llvm_ty(&ty), ty))
    }

    fn emit_place(&mut self, expr: &HirExpr) -> Result<Place, EmitError> {
        match expr.kind {
            HirExprKind::Var => {
                let name = &expr.text;
                if let Some(local) = self.locals.get(name).cloned() {
                    let llvm = self.llvm_ty(&local.hc);
                    return Ok(Place::Ptr { ptr: local.ptr, llvm, hc: local.hc });
                }
                if let Some(hc) = self.globals.get(name).cloned() {
                    let llvm = self.llvm_ty(&hc);
                    return Ok(Place::Ptr { ptr: format!("@{}", name), llvm, hc });
                }
                Err(self.logic(format!("cannot assign to '{}'", name)))
            }
            HirExprKind::Unary if expr.text == "*" => {
                let v = self.emit_expr(&expr.children[0])?;
                let pointee = sema::strip_pointer(&v.hc).to_string();
                let llvm = self.llvm_ty(&pointee);
                Ok(Place::Ptr { ptr: v.repr, llvm, hc: pointee })
            }
            HirExprKind::Member => {
                let base = self.emit_place(&expr.children[0])?;
                let (base_ptr, base_hc) = match &base {
                    Place::Ptr { ptr, hc, .. } => (ptr.clone(), hc.clone()),
                    Place::Lane { .. } => return Err(self.logic("cannot take a member of a lane")),
                };
                let info = self
                    .aggregates
                    .get(&base_hc)
                    .cloned()
                    .ok_or_else(|| self.logic(format!("member access on non-aggregate type '{}'", base_hc)))?;
                let field = info
                    .fields
                    .iter()
                    .find(|f| f.name == expr.text)
                    .cloned()
                    .ok_or_else(|| self.logic(format!("aggregate '{}' has no field '{}'", base_hc, expr.text)))?;
                let llvm = self.llvm_ty(&field.hc);
                if info.is_union {
                    // Every union member shares offset zero.
                    Ok(Place::Ptr { ptr: base_ptr, llvm, hc: field.hc })
                } else {
                    let t = self.new_tmp();
                    self.ins(format!(
                        "{} = getelementptr inbounds {}, ptr {}, i32 0, i32 {}",
                        t, info.llvm_name, base_ptr, field.index
                    ));
                    Ok(Place::Ptr { ptr: t, llvm, hc: field.hc })
                }
            }
            HirExprKind::Index => {
                let base = self.emit_expr(&expr.children[0])?;
                let idx = self.emit_expr(&expr.children[1])?;
                let idx = self.coerce(idx, "I64")?;
                let elem = sema::strip_pointer(&base.hc).to_string();
                let llvm = self.llvm_ty(&elem);
                let t = self.new_tmp();
                self.ins(format!("{} = getelementptr {}, ptr {}, i64 {}", t, llvm, base.repr, idx.repr));
                Ok(Place::Ptr { ptr: t, llvm, hc: elem })
            }
            HirExprKind::Lane => {
                let base = self.emit_place(&expr.children[0])?;
                let base_hc = base.hc().to_string();
                let base_bits = sema::int_width(&base_hc).max(8);
                let sel = expr.text.as_str();
                let lane_bits: usize = sel[1..].parse().unwrap_or(8);
                let signed = sel.starts_with('i');

                let idx = self.emit_expr(&expr.children[1])?;
                let base_llvm = format!("i{}", base_bits);
                let idx = self.coerce(idx, &base_hc)?;
                // Mask the index to the lane count so the shift stays in
                // range, then scale by the lane width.
                let lanes = (base_bits / lane_bits) as i64;
                let masked = self.new_tmp();
                self.ins(format!("{} = and {} {}, {}", masked, base_llvm, idx.repr, lanes - 1));
                let shift = self.new_tmp();
                self.ins(format!("{} = mul {} {}, {}", shift, base_llvm, masked, lane_bits));
                Ok(Place::Lane {
                    base: Box::new(base),
                    shift,
                    base_bits,
                    lane_bits,
                    signed,
                    hc: expr.ty.clone(),
                })
            }
            _ => Err(self.logic(format!("expression kind {} is not assignable", expr.kind.name()))),
        }
    }

    fn load_place(&mut self, place: &Place) -> Result<Val, EmitError> {
        match place {
            Place::Ptr { ptr, llvm, hc } => {
                let t = self.new_tmp();
                self.ins(format!("{} = load {}, ptr {}", t, llvm, ptr));
                Ok(Val::new(t, llvm.clone(), hc.clone()))
            }
            Place::Lane { base, shift, base_bits, lane_bits, signed, hc } => {
                let base_val = self.load_place(base)?;
                let b = format!("i{}", base_bits);
                let shifted = self.new_tmp();
                self.ins(format!("{} = lshr {} {}, {}", shifted, b, base_val.repr, shift));
                let value = if lane_bits == base_bits {
                    shifted
                } else {
                    let mask = lane_mask(*lane_bits);
                    let m = self.new_tmp();
                    self.ins(format!("{} = and {} {}, {}", m, b, shifted, mask));
                    m
                };
                let lane_llvm = format!("i{}", lane_bits);
                let result = if lane_bits == base_bits {
                    value
                } else {
                    let t = self.new_tmp();
                    self.ins(format!("{} = trunc {} {} to {}", t, b, value, lane_llvm));
                    t
                };
                let _ = signed;
                Ok(Val::new(result, lane_llvm, hc.clone()))
            }
        }
    }

    fn store_place(&mut self, place: &Place, value: Val) -> Result<(), EmitError> {
        match place {
            Place::Ptr { ptr, llvm, .. } => {
                self.ins(format!("store {} {}, ptr {}", llvm, value.repr, ptr));
                Ok(())
            }
            Place::Lane { base, shift, base_bits, lane_bits, .. } => {
                // Read-modify-write through the base lvalue.
                let old = self.load_place(base)?;
                let b = format!("i{}", base_bits);

                // Widen or narrow the stored value to the base width.
                let v = value;
                let v_at_base = if v.llvm == b {
                    v.repr
                } else {
                    let t = self.new_tmp();
                    let v_bits: usize = v.llvm.trim_start_matches('i').parse().unwrap_or(64);
                    if v_bits > *base_bits {
                        self.ins(format!("{} = trunc {} {} to {}", t, v.llvm, v.repr, b));
                    } else {
                        self.ins(format!("{} = zext {} {} to {}", t, v.llvm, v.repr, b));
                    }
                    t
                };

                let mask = lane_mask(*lane_bits);
                let vm = self.new_tmp();
                self.ins(format!("{} = and {} {}, {}", vm, b, v_at_base, mask));
                let ins_val = self.new_tmp();
                self.ins(format!("{} = shl {} {}, {}", ins_val, b, vm, shift));
                let mask_shifted = self.new_tmp();
                self.ins(format!("{} = shl {} {}, {}", mask_shifted, b, mask, shift));
                let inverted = self.new_tmp();
                self.ins(format!("{} = xor {} {}, -1", inverted, b, mask_shifted));
                let cleared = self.new_tmp();
                self.ins(format!("{} = and {} {}, {}", cleared, b, old.repr, inverted));
                let merged = self.new_tmp();
                self.ins(format!("{} = or {} {}, {}", merged, b, cleared, ins_val));
                self.store_place(base, Val::new(merged, b, old.hc))
            }
        }
    }

    // ==================================================================
    // Conversions
    // ==================================================================

    fn to_bool(&mut self, v: Val) -> Result<Val, EmitError> {
        match v.llvm.as_str() {
            "i1" => Ok(v),
            "double" => {
                let t = self.new_tmp();
                self.ins(format!("{} = fcmp une double {}, {}", t, v.repr, double_repr(0.0)));
                Ok(Val::new(t, "i1", "Bool"))
            }
            "ptr" => {
                let t = self.new_tmp();
                self.ins(format!("{} = icmp ne ptr {}, null", t, v.repr));
                Ok(Val::new(t, "i1", "Bool"))
            }
            llvm => {
                let t = self.new_tmp();
                self.ins(format!("{} = icmp ne {} {}, 0", t, llvm, v.repr));
                Ok(Val::new(t, "i1", "Bool"))
            }
        }
    }

    /// Convert a value to a target HolyC type. Widening follows the
    /// source signedness; int/pointer casts round-trip through
    /// ptrtoint/inttoptr.
    fn coerce(&mut self, v: Val, target_hc: &str) -> Result<Val, EmitError> {
        let target_llvm = self.llvm_ty(target_hc);
        if v.llvm == target_llvm {
            return Ok(Val::new(v.repr, v.llvm, target_hc.to_string()));
        }
        let t = self.new_tmp();
        match (v.llvm.as_str(), target_llvm.as_str()) {
            (_, "void") => Ok(v),
            ("ptr", "double") => Err(self.logic("cannot convert a pointer to F64")),
            ("double", "ptr") => Err(self.logic("cannot convert F64 to a pointer")),
            ("ptr", _) => {
                self.ins(format!("{} = ptrtoint ptr {} to {}", t, v.repr, target_llvm));
                Ok(Val::new(t, target_llvm, target_hc.to_string()))
            }
            (_, "ptr") => {
                if v.repr == "0" {
                    Ok(Val::new("null", "ptr", target_hc.to_string()))
                } else {
                    let wide = if v.llvm == "i64" {
                        v.repr.clone()
                    } else {
                        let w = self.new_tmp();
                        let ext = if sema::is_unsigned(&v.hc) || v.llvm == "i1" { "zext" } else { "sext" };
                        self.ins(format!("{} = {} {} {} to i64", w, ext, v.llvm, v.repr));
                        w
                    };
                    self.ins(format!("{} = inttoptr i64 {} to ptr", t, wide));
                    Ok(Val::new(t, "ptr", target_hc.to_string()))
                }
            }
            ("double", _) => {
                let op = if sema::is_unsigned(target_hc) { "fptoui" } else { "fptosi" };
                self.ins(format!("{} = {} double {} to {}", t, op, v.repr, target_llvm));
                Ok(Val::new(t, target_llvm, target_hc.to_string()))
            }
            (_, "double") => {
                let op = if sema::is_unsigned(&v.hc) || v.llvm == "i1" { "uitofp" } else { "sitofp" };
                self.ins(format!("{} = {} {} {} to double", t, op, v.llvm, v.repr));
                Ok(Val::new(t, "double", target_hc.to_string()))
            }
            (src, dst) => {
                let sw: usize = src.trim_start_matches('i').parse().unwrap_or(64);
                let dw: usize = dst.trim_start_matches('i').parse().unwrap_or(64);
                if sw > dw {
                    self.ins(format!("{} = trunc {} {} to {}", t, src, v.repr, dst));
                } else if sw < dw {
                    let ext = if sema::is_unsigned(&v.hc) || src == "i1" { "zext" } else { "sext" };
                    self.ins(format!("{} = {} {} {} to {}", t, ext, src, v.repr, dst));
                } else {
                    return Ok(Val::new(v.repr, dst.to_string(), target_hc.to_string()));
                }
                Ok(Val::new(t, dst.to_string(), target_hc.to_string()))
            }
        }
    }

    // ==================================================================
    // Wrappers and assembly
    // ==================================================================

    fn startup_calls(&mut self) {
        if let Some((name, count)) = self.reflection_global.clone() {
            self.ins(format!("call void @hc_register_reflection_table(ptr {}, i64 {})", name, count));
        }
        if let Some(init) = self.init_fn.clone() {
            self.ins(format!("call void @{}()", init));
        }
    }

    fn emit_wrappers(&mut self) -> Result<(), EmitError> {
        if let Some((entry, n)) = self.opts.entry_wrap.clone() {
            self.emit_entry_wrapper(&entry, n)?;
            return Ok(());
        }
        if self.opts.jit {
            return Ok(());
        }
        // Host main wrapper: only when the module defines a HolyC Main
        // and no host main of its own.
        let has_main = self.module.functions.iter().any(|f| f.name == "Main");
        let has_host_main = self.module.functions.iter().any(|f| f.name == "main");
        if !has_main || has_host_main {
            return Ok(());
        }
        let info = self.functions.get("Main").cloned().expect("Main installed");

        self.begin_function();
        self.fn_ret = "I64".to_string();
        self.startup_calls();
        let call = self.build_entry_call(&info, "%argc", "%argv")?;
        self.finish_i32_wrapper(call, &info)?;

        let _ = writeln!(self.body, "define i32 @main(i32 %argc, ptr %argv) {{");
        self.body.push_str("entry:\n");
        let allocas = std::mem::take(&mut self.allocas);
        let code = std::mem::take(&mut self.code);
        self.body.push_str(&allocas);
        self.body.push_str(&code);
        self.body.push_str("}\n\n");
        Ok(())
    }

    fn emit_entry_wrapper(&mut self, entry: &str, n: usize) -> Result<(), EmitError> {
        let info = self
            .functions
            .get(entry)
            .cloned()
            .ok_or_else(|| self.logic(format!("entry function '{}' is not defined", entry)))?;
        let argv0 = self.string_global("holyc-jit");

        self.begin_function();
        self.fn_ret = "I64".to_string();
        self.local_counter += 1;
        let argv = format!("%jit.argv.{}", self.local_counter);
        let _ = writeln!(self.allocas, "  {} = alloca [2 x ptr]", argv);
        let a0 = self.new_tmp();
        self.ins(format!("{} = getelementptr [2 x ptr], ptr {}, i64 0, i64 0", a0, argv));
        self.ins(format!("store ptr {}, ptr {}", argv0, a0));
        let a1 = self.new_tmp();
        self.ins(format!("{} = getelementptr [2 x ptr], ptr {}, i64 0, i64 1", a1, argv));
        self.ins(format!("store ptr null, ptr {}", a1));
        self.startup_calls();
        let call = self.build_entry_call(&info, "1", &argv)?;
        self.finish_i32_wrapper(call, &info)?;

        let _ = writeln!(self.body, "define i32 @__holyc_entry_{}() {{", n);
        self.body.push_str("entry:\n");
        let allocas = std::mem::take(&mut self.allocas);
        let code = std::mem::take(&mut self.code);
        self.body.push_str(&allocas);
        self.body.push_str(&code);
        self.body.push_str("}\n\n");
        Ok(())
    }

    /// Call the entry function passing argc/argv coerced per its
    /// declared parameters; further parameters fill with zeros.
    fn build_entry_call(&mut self, info: &FnInfo, argc_repr: &str, argv_repr: &str) -> Result<Option<Val>, EmitError> {
        let mut args = Vec::new();
        for (i, pty) in info.params.iter().enumerate() {
            let pty = pty.clone();
            let llvm = self.llvm_ty(&pty);
            let arg = match i {
                0 => {
                    let argc = Val::new(argc_repr, "i32", "I32");
                    let argc = if argc_repr.starts_with('%') {
                        argc
                    } else {
                        Val::new(argc_repr, "i64", "I64")
                    };
                    self.coerce(argc, &pty)?
                }
                1 => self.coerce(Val::new(argv_repr, "ptr", "U8**"), &pty)?,
                _ => Val::new(self.zero_init(&llvm), llvm.clone(), pty.clone()),
            };
            args.push(format!("{} {}", arg.llvm, arg.repr));
        }
        let ret_llvm = self.llvm_ty(&info.ret);
        if ret_llvm == "void" {
            self.ins(format!("call void @{}({})", info.symbol, args.join(", ")));
            Ok(None)
        } else {
            let t = self.new_tmp();
            self.ins(format!("{} = call {} @{}({})", t, ret_llvm, info.symbol, args.join(", ")));
            Ok(Some(Val::new(t, ret_llvm, info.ret.clone())))
        }
    }

    fn finish_i32_wrapper(&mut self, call: Option<Val>, _info: &FnInfo) -> Result<(), EmitError> {
        match call {
            None => self.term("ret i32 0".to_string()),
            Some(v) => {
                let v = self.coerce(v, "I32")?;
                self.term(format!("ret i32 {}", v.repr));
            }
        }
        Ok(())
    }

    fn assemble(&mut self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "; ModuleID = '{}'", self.opts.module_name);
        let _ = writeln!(out, "source_filename = \"{}\"", self.opts.source_file);
        out.push('\n');

        if self.uses_refl_type {
            out.push_str("%HcReflField = type { ptr, ptr, ptr, ptr }\n");
        }
        out.push_str(&self.type_defs);
        out.push('\n');

        for (_, decl) in RUNTIME_DECLS {
            out.push_str(decl);
            out.push('\n');
        }
        for decl in &self.extra_decls {
            out.push_str(decl);
            out.push('\n');
        }
        out.push('\n');

        out.push_str(&self.globals_out);
        for (name, content) in &self.strings {
            let bytes = content.as_bytes();
            let _ = writeln!(
                out,
                "{} = private unnamed_addr constant [{} x i8] c\"{}\\00\"",
                name,
                bytes.len() + 1,
                escape_ir_bytes(bytes)
            );
        }
        out.push('\n');
        out.push_str(&self.body);
        out
    }
}

// ======================================================================
// Free helpers
// ======================================================================

fn lane_mask(lane_bits: usize) -> i64 {
    if lane_bits >= 64 {
        -1
    } else {
        (1i64 << lane_bits) - 1
    }
}

fn int_predicate(op: &str, unsigned: bool) -> &'static str {
    match (op, unsigned) {
        ("==", _) => "eq",
        ("!=", _) => "ne",
        ("<", false) => "slt",
        ("<", true) => "ult",
        (">", false) => "sgt",
        (">", true) => "ugt",
        ("<=", false) => "sle",
        ("<=", true) => "ule",
        (">=", false) => "sge",
        _ => {
            if unsigned {
                "uge"
            } else {
                "sge"
            }
        }
    }
}

fn float_predicate(op: &str) -> &'static str {
    match op {
        "==" => "oeq",
        "!=" => "une",
        "<" => "olt",
        ">" => "ogt",
        "<=" => "ole",
        _ => "oge",
    }
}

/// Hex form LLVM accepts for double constants, exact for every value.
fn double_repr(v: f64) -> String {
    format!("0x{:016X}", v.to_bits())
}

fn truncate_to(v: i64, llvm: &str) -> i64 {
    match llvm {
        "i1" => (v != 0) as i64,
        "i8" => v as i8 as i64,
        "i16" => v as i16 as i64,
        "i32" => v as i32 as i64,
        _ => v,
    }
}

/// Escape bytes for a c"..." constant.
fn escape_ir_bytes(bytes: &[u8]) -> String {
    let mut out = String::new();
    for &b in bytes {
        match b {
            b'"' | b'\\' => out.push_str(&format!("\\{:02X}", b)),
            0x20..=0x7E => out.push(b as char),
            _ => out.push_str(&format!("\\{:02X}", b)),
        }
    }
    out
}

/// Escape text used inside an IR-level quoted string (asm templates and
/// constraint lists).
fn escape_ir_text(text: &str) -> String {
    escape_ir_bytes(text.as_bytes())
}

/// Structural verification of emitted IR text: balanced function bodies
/// where every basic block ends in exactly one terminator, and no
/// duplicated global definitions.
pub fn verify_module(text: &str) -> Result<(), EmitError> {
    let mut defined: Vec<&str> = Vec::new();
    let mut in_function = false;
    let mut last_was_terminator = true;
    let mut current_fn = "";

    for line in text.lines() {
        let trimmed = line.trim_end();
        if let Some(rest) = trimmed.strip_prefix("define ") {
            if in_function {
                return Err(EmitError::Verify(format!("nested define inside '{}'", current_fn)));
            }
            in_function = true;
            // The first block label follows immediately.
            last_was_terminator = true;
            current_fn = symbol_of(rest).unwrap_or("");
            if defined.contains(&current_fn) {
                return Err(EmitError::Verify(format!("duplicate definition of '@{}'", current_fn)));
            }
            defined.push(current_fn);
            continue;
        }
        if !in_function {
            if let Some(at) = trimmed.strip_prefix('@') {
                if let Some(eq) = at.find(" =") {
                    let name = &at[..eq];
                    if defined.contains(&name) {
                        return Err(EmitError::Verify(format!("duplicate definition of '@{}'", name)));
                    }
                    defined.push(name);
                }
            }
            continue;
        }
        if trimmed == "}" {
            if !last_was_terminator {
                return Err(EmitError::Verify(format!(
                    "function '@{}' falls off the end without a terminator",
                    current_fn
                )));
            }
            in_function = false;
            continue;
        }
        if trimmed.ends_with(':') && !trimmed.starts_with(' ') {
            if !last_was_terminator {
                return Err(EmitError::Verify(format!(
                    "block '{}' in '@{}' begins before the previous block terminated",
                    trimmed.trim_end_matches(':'),
                    current_fn
                )));
            }
            last_was_terminator = false;
            continue;
        }
        let inst = trimmed.trim_start();
        if inst.is_empty() {
            continue;
        }
        last_was_terminator = inst.starts_with("br ")
            || inst.starts_with("ret ")
            || inst == "ret void"
            || inst == "unreachable"
            || inst.starts_with("switch ");
    }
    if in_function {
        return Err(EmitError::Verify("unterminated function body".to_string()));
    }
    Ok(())
}

fn symbol_of(define_rest: &str) -> Option<&str> {
    let at = define_rest.find('@')?;
    let rest = &define_rest[at + 1..];
    let end = rest.find('(')?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::lower;
    use crate::parser::Parser;
    use crate::sema::{analyze, SemaOptions};

    fn emit_src(src: &str) -> String {
        emit_src_with(src, &EmitOptions::default())
    }

    fn emit_src_with(src: &str, opts: &EmitOptions) -> String {
        let parsed = Parser::parse_source(src, "t.HC").unwrap();
        let typed = analyze(&parsed, "t.HC", SemaOptions::default()).unwrap();
        let module = lower(&typed, "t.HC").unwrap();
        emit(&module, opts).unwrap()
    }

    #[test]
    fn test_arithmetic_module() {
        let ir = emit_src("I64 Main() { return 2 + 3 * 4; }");
        assert!(ir.contains("define i64 @Main()"));
        assert!(ir.contains("mul i64"));
        assert!(ir.contains("add i64"));
        assert!(ir.contains("define i32 @main(i32 %argc, ptr %argv)"));
    }

    #[test]
    fn test_emission_is_deterministic() {
        let src = "class CPt { I64 x; }; I64 g = 3; I64 Main() { \"%d\\n\", g; return 0; }";
        assert_eq!(emit_src(src), emit_src(src));
    }

    #[test]
    fn test_lane_read_write() {
        let ir = emit_src("I64 Main() { I64 v = 0; v.u8[1] = 0xAB; return v.u8[1]; }");
        assert!(ir.contains("lshr i64"));
        assert!(ir.contains("shl i64"));
        assert!(ir.contains("and i64"));
        // Cleared-mask write-back
        assert!(ir.contains("xor i64"));
    }

    #[test]
    fn test_lastclass_string_in_module() {
        let ir = emit_src("U0 Show(U8 *name, U8 *ty=lastclass) { } I64 Main() { I64 x = 0; Show(&x); return 0; }");
        assert!(ir.contains("c\"I64\\00\""));
    }

    #[test]
    fn test_lock_atomicrmw_seq_cst() {
        let ir = emit_src("I64 g; U0 F() { lock { g += 2; } }");
        assert!(ir.contains("atomicrmw add ptr @g, i64"));
        assert!(ir.contains("seq_cst"));
    }

    #[test]
    fn test_lock_incdec_atomic() {
        let ir = emit_src("I64 g; U0 F() { lock { g++; } }");
        assert!(ir.contains("atomicrmw add ptr @g, i64 1 seq_cst"));
    }

    #[test]
    fn test_lock_mul_uses_cmpxchg() {
        let ir = emit_src("I64 g; U0 F() { lock { g *= 3; } }");
        assert!(ir.contains("cmpxchg ptr @g"));
        assert!(ir.contains("seq_cst seq_cst"));
    }

    #[test]
    fn test_nonlock_assign_plain_store() {
        let ir = emit_src("I64 g; U0 F() { g += 2; }");
        assert!(!ir.contains("atomicrmw"));
        assert!(ir.contains("store i64"));
    }

    #[test]
    fn test_print_call_shapes() {
        let ir = emit_src("U0 Main() { \"hello\\n\"; }");
        assert!(ir.contains("call void @hc_print_fmt(ptr @.str.0, ptr null, i64 0)"));

        let ir = emit_src("U0 Main() { \"%d %s\\n\", 42, \"hi\"; }");
        assert!(ir.contains("alloca [2 x i64]"));
        assert!(ir.contains("call void @hc_print_fmt"));
    }

    #[test]
    fn test_char_print_uses_put_char() {
        let ir = emit_src("U0 Main() { 'A'; }");
        assert!(ir.contains("call void @hc_put_char(i64 65)"));
    }

    #[test]
    fn test_float_arg_bitcast() {
        let ir = emit_src("U0 Main() { \"%f\\n\", 1.5; }");
        assert!(ir.contains("bitcast double"));
    }

    #[test]
    fn test_try_throw_sequence() {
        let ir = emit_src("I64 Main() { try { throw(7); } catch { return 1; } return 0; }");
        assert!(ir.contains("call void @hc_try_push(ptr %try.frame.1)"));
        assert!(ir.contains("call i32 @_setjmp(ptr %try.frame.1)"));
        assert!(ir.contains("call void @hc_throw_i64(i64 7)"));
        assert!(ir.contains("unreachable"));
        assert!(ir.contains("call void @hc_try_pop"));
    }

    #[test]
    fn test_switch_chain_and_range() {
        let ir = emit_src(
            "I64 Main() { I64 x = 1; switch (x) { case 0: return 10; case 2...5: return 20; default: return 99; } }",
        );
        assert!(ir.contains("icmp eq i64"));
        assert!(ir.contains("icmp sge i64"));
        assert!(ir.contains("icmp sle i64"));
    }

    #[test]
    fn test_reflection_table_and_registration() {
        let ir = emit_src("class CPt { I64 x; F64 w; }; I64 Main() { return 0; }");
        assert!(ir.contains("%HcReflField = type { ptr, ptr, ptr, ptr }"));
        assert!(ir.contains("@.hcrefl = private unnamed_addr constant [2 x %HcReflField]"));
        assert!(ir.contains("call void @hc_register_reflection_table(ptr @.hcrefl, i64 2)"));
    }

    #[test]
    fn test_each_class_once_in_reflection() {
        let ir = emit_src("class A { I64 x; }; class B { I64 y; }; I64 Main() { return 0; }");
        assert_eq!(ir.matches("c\"A\\00\"").count(), 1);
        assert_eq!(ir.matches("c\"B\\00\"").count(), 1);
    }

    #[test]
    fn test_packed_struct_types() {
        let ir = emit_src("class C { I8 a; I64 b; }; I64 Main() { C c; return c.b; }");
        assert!(ir.contains("%class.C = type <{ i8, i64 }>"));
        assert!(ir.contains("getelementptr inbounds %class.C"));
    }

    #[test]
    fn test_union_collapses_to_largest() {
        let ir = emit_src("union U { I8 a; I64 b; }; I64 Main() { U u; return u.b; }");
        assert!(ir.contains("%class.U = type <{ i64 }>"));
    }

    #[test]
    fn test_ashr_for_right_shift() {
        let ir = emit_src("I64 Main() { U64 v = 16; return v >> 2; }");
        assert!(ir.contains("ashr"));
        assert!(!ir.contains("lshr i64 %t")); // only lanes use lshr
    }

    #[test]
    fn test_global_const_and_deferred_init() {
        let ir = emit_src("I64 a = 2 + 3; I64 F() { return 1; }");
        assert!(ir.contains("@a = global i64 5"));

        let ir = emit_src("I64 G() { return 4; } I64 b = G(); I64 Main() { return b; }");
        assert!(ir.contains("@b = global i64 0"));
        assert!(ir.contains("define internal void @__holyc_mod_init()"));
        assert!(ir.contains("call void @__holyc_mod_init()"));
    }

    #[test]
    fn test_static_global_internal() {
        let ir = emit_src("static I64 s = 2; I64 Main() { return s; }");
        assert!(ir.contains("@s = internal global i64 2"));
    }

    #[test]
    fn test_linkage_decl_external() {
        let ir = emit_src("extern I64 shared_counter; I64 Main() { return shared_counter; }");
        assert!(ir.contains("@shared_counter = external global i64"));
    }

    #[test]
    fn test_entry_wrapper_renames() {
        let opts = EmitOptions {
            jit: true,
            entry_wrap: Some(("Main".to_string(), 3)),
            module_tag: "m1".to_string(),
            ..Default::default()
        };
        let ir = emit_src_with("I64 Main() { return 42; }", &opts);
        assert!(ir.contains("define i64 @__holyc_entry_target_3()"));
        assert!(ir.contains("define i32 @__holyc_entry_3()"));
        assert!(ir.contains("c\"holyc-jit\\00\""));
        assert!(!ir.contains("define i32 @main("));
    }

    #[test]
    fn test_jit_mode_no_main_wrapper() {
        let opts = EmitOptions { jit: true, ..Default::default() };
        let ir = emit_src_with("I64 Main() { return 1; }", &opts);
        assert!(!ir.contains("define i32 @main("));
    }

    #[test]
    fn test_module_tag_namespaces_privates() {
        let opts = EmitOptions { jit: true, module_tag: "m7".to_string(), ..Default::default() };
        let ir = emit_src_with("U0 F() { \"x\"; }", &opts);
        assert!(ir.contains("@.str.m7.0"));
    }

    #[test]
    fn test_logical_short_circuit() {
        let ir = emit_src("I64 Main(I64 a, I64 b) { return a && b; }");
        assert!(ir.contains("land.rhs"));
        assert!(ir.contains("phi i1"));
    }

    #[test]
    fn test_chained_comparison_members_once() {
        let ir = emit_src("I64 Main(I64 x) { return 1 < x < 9; }");
        // Two comparisons, one and.
        assert!(ir.contains("and i1"));
        assert_eq!(ir.matches("icmp slt").count(), 2);
    }

    #[test]
    fn test_goto_labels() {
        let ir = emit_src("I64 Main() { I64 v; v = 0; again: v = v + 1; if (v < 3) goto again; return v; }");
        assert!(ir.contains("user.again:"));
        assert!(ir.contains("br label %user.again"));
    }

    #[test]
    fn test_spawn_call_through_declared_symbol() {
        let ir = emit_src("U0 W(I64 a) { } I64 Main() { Spawn(&W); return 0; }");
        assert!(ir.contains("call i64 @Spawn(ptr @W, i64 0, ptr null)"));
    }

    #[test]
    fn test_builtin_symbol_mapping() {
        let ir = emit_src("I64 Main() { U8 *p = MAlloc(8); Free(p); return 0; }");
        assert!(ir.contains("call ptr @hc_malloc(i64 8)"));
        assert!(ir.contains("call void @hc_free(ptr"));
    }

    #[test]
    fn test_exception_payload_reads_runtime() {
        let ir = emit_src("I64 Main() { return HolyC_Exception_Payload; }");
        assert!(ir.contains("call i64 @hc_exception_payload()"));
    }

    #[test]
    fn test_indirect_call() {
        let ir = emit_src("I64 Add2(I64 a) { return a + 2; } I64 Main() { U0 *fp = &Add2; return fp(5); }");
        assert!(ir.contains("call i64 %t"));
    }

    #[test]
    fn test_inline_asm() {
        let ir = emit_src("U0 Main() { I64 v = 1; asm(\"nop\", \"r\"(v)); }");
        assert!(ir.contains("call void asm sideeffect \"nop\", \"r\"(i64"));
    }

    #[test]
    fn test_verifier_accepts_emitted_modules() {
        let ir = emit_src("I64 Main() { if (1) return 1; return 2; }");
        assert!(verify_module(&ir).is_ok());
    }

    #[test]
    fn test_verifier_rejects_unterminated_block() {
        let bad = "define i64 @f() {\nentry:\n  %t1 = add i64 1, 2\nnext:\n  ret i64 0\n}\n";
        assert!(matches!(verify_module(bad), Err(EmitError::Verify(_))));
    }

    #[test]
    fn test_verifier_rejects_duplicate_definition() {
        let bad = "@g = global i64 0\n@g = global i64 1\n";
        assert!(matches!(verify_module(bad), Err(EmitError::Verify(_))));
    }

    #[test]
    fn test_default_return_synthesized() {
        let ir = emit_src("I64 F() { } U0 G() { }");
        assert!(ir.contains("ret i64 0"));
        assert!(ir.contains("ret void"));
    }

    #[test]
    fn test_member_through_pointer() {
        let ir = emit_src("class CPt { I64 x; I64 y; }; I64 Main() { CPt p; CPt *q = &p; return q->y; }");
        assert!(ir.contains("getelementptr inbounds %class.CPt, ptr %t"));
    }

    #[test]
    fn test_string_dedup() {
        let ir = emit_src("U0 Main() { \"abc\"; \"abc\"; }");
        assert_eq!(ir.matches("c\"abc\\00\"").count(), 1);
    }

    #[test]
    fn test_pointer_arithmetic_scales() {
        let ir = emit_src("I64 Main(I64 *p) { return *(p + 2); }");
        assert!(ir.contains("mul i64"));
        assert!(ir.contains("getelementptr i8, ptr"));
    }

    #[test]
    fn test_top_level_statement_in_init() {
        let ir = emit_src("I64 g; g = 5; I64 Main() { return g; }");
        assert!(ir.contains("define internal void @__holyc_mod_init()"));
    }
}
