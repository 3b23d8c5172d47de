//! HolyC preprocessor.
//!
//! Consumes raw source text and emits the expanded text the lexer sees.
//! Handles `#include`, `#define` (object- and function-like), the
//! conditional family (`#if`/`#ifdef`/`#ifndef`/`#elif`/`#else`/`#endif`,
//! plus the mode-driven `#ifjit`/`#ifaot`), `#assert`, and the `#exe`
//! mini-language. All failures are hard errors with `HC10xx` codes.

use crate::diag::Diagnostic;
use crate::lexer;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Maximum `#include` nesting depth.
const MAX_INCLUDE_DEPTH: usize = 64;

/// Whether the driver is preprocessing for the JIT or the AOT path.
/// `#ifjit` / `#ifaot` read this flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PpMode {
    Jit,
    Aot,
}

/// Preprocessor configuration.
#[derive(Debug, Clone)]
pub struct PpOptions {
    pub mode: PpMode,
    /// Extra include search roots, tried after the including file's
    /// directory.
    pub include_roots: Vec<PathBuf>,
}

impl Default for PpOptions {
    fn default() -> Self {
        PpOptions { mode: PpMode::Jit, include_roots: Vec::new() }
    }
}

#[derive(Debug, Clone)]
enum Macro {
    Object(String),
    Function { params: Vec<String>, body: String },
}

/// One entry of the conditional stack.
#[derive(Debug, Clone, Copy)]
struct CondFrame {
    parent_active: bool,
    branch_taken: bool,
    active: bool,
}

struct ExpandCtx<'a> {
    file: &'a str,
    dir: &'a str,
    line: usize,
}

pub struct Preprocessor {
    opts: PpOptions,
    macros: HashMap<String, Macro>,
    cond_stack: Vec<CondFrame>,
    /// Canonical paths of files currently being included, for cycle
    /// detection and the `HC1023` trace.
    include_stack: Vec<PathBuf>,
    include_names: Vec<String>,
    output: String,
}

/// Preprocess a file on disk.
pub fn preprocess_file(path: &Path, opts: &PpOptions) -> Result<String, Diagnostic> {
    let mut pp = Preprocessor::new(opts.clone());
    pp.run_file(path)?;
    Ok(pp.output)
}

/// Preprocess in-memory text (REPL cells). Includes resolve relative to
/// the current directory.
pub fn preprocess_text(source: &str, file: &str, opts: &PpOptions) -> Result<String, Diagnostic> {
    let mut pp = Preprocessor::new(opts.clone());
    let dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    pp.include_names.push(file.to_string());
    pp.process_text(source, file, &dir)?;
    pp.include_names.pop();
    if let Some(_frame) = pp.cond_stack.last() {
        return Err(Diagnostic::error("HC1002", file, 0, 0, "unterminated conditional block at end of input"));
    }
    Ok(pp.output)
}

impl Preprocessor {
    fn new(opts: PpOptions) -> Self {
        Preprocessor {
            opts,
            macros: HashMap::new(),
            cond_stack: Vec::new(),
            include_stack: Vec::new(),
            include_names: Vec::new(),
            output: String::new(),
        }
    }

    fn run_file(&mut self, path: &Path) -> Result<(), Diagnostic> {
        let display = path.display().to_string();
        if self.include_stack.len() >= MAX_INCLUDE_DEPTH {
            return Err(Diagnostic::error(
                "HC1024",
                &display,
                0,
                0,
                format!("include nesting deeper than {} levels", MAX_INCLUDE_DEPTH),
            ));
        }
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if self.include_stack.contains(&canonical) {
            let mut chain: Vec<String> = self.include_names.clone();
            chain.push(display.clone());
            return Err(Diagnostic::error("HC1023", &display, 0, 0, "include cycle detected")
                .with_help(format!("cycle: {}", chain.join(" -> "))));
        }
        let source = std::fs::read_to_string(path).map_err(|e| {
            Diagnostic::error("HC1025", &display, 0, 0, format!("cannot read include file: {}", e))
        })?;
        let dir = path.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| PathBuf::from("."));

        self.include_stack.push(canonical);
        self.include_names.push(display.clone());
        let depth_at_entry = self.cond_stack.len();
        let result = self.process_text(&source, &display, &dir);
        if result.is_ok() && self.cond_stack.len() != depth_at_entry {
            self.include_stack.pop();
            self.include_names.pop();
            return Err(Diagnostic::error("HC1002", &display, 0, 0, "unterminated conditional block at end of file"));
        }
        self.include_stack.pop();
        self.include_names.pop();
        result
    }

    fn active(&self) -> bool {
        self.cond_stack.iter().all(|f| f.active)
    }

    fn process_text(&mut self, source: &str, file: &str, dir: &Path) -> Result<(), Diagnostic> {
        let lines: Vec<&str> = source.lines().collect();
        let mut idx = 0;
        while idx < lines.len() {
            let raw = lines[idx];
            let lineno = idx + 1;
            let trimmed = raw.trim_start();

            if let Some(rest) = trimmed.strip_prefix('#') {
                let consumed = self.directive(rest.trim_start(), &lines, idx, file, dir)?;
                idx += consumed.max(1);
                continue;
            }

            if self.active() {
                let ctx = ExpandCtx { file, dir: &dir.display().to_string(), line: lineno };
                let mut active_set = HashSet::new();
                let expanded = self.expand(raw, &ctx, &mut active_set)?;
                self.output.push_str(&expanded);
                self.output.push('\n');
            }
            idx += 1;
        }
        Ok(())
    }

    /// Handle one directive. Returns how many input lines it consumed
    /// (more than one only for multi-line `#exe` blocks).
    fn directive(
        &mut self,
        body: &str,
        lines: &[&str],
        idx: usize,
        file: &str,
        dir: &Path,
    ) -> Result<usize, Diagnostic> {
        let lineno = idx + 1;
        let (name, rest) = split_directive(body);
        let rest = rest.trim();

        match name {
            "if" => {
                let parent = self.active();
                let cond = if parent { self.eval_condition(rest, file, lineno)? != 0 } else { false };
                self.cond_stack.push(CondFrame { parent_active: parent, branch_taken: cond, active: parent && cond });
            }
            "ifdef" | "ifndef" => {
                let parent = self.active();
                let defined = self.macros.contains_key(rest);
                let cond = if name == "ifdef" { defined } else { !defined };
                let cond = parent && cond;
                self.cond_stack.push(CondFrame { parent_active: parent, branch_taken: cond, active: cond });
            }
            "ifjit" | "ifaot" => {
                let parent = self.active();
                let cond = match (name, self.opts.mode) {
                    ("ifjit", PpMode::Jit) | ("ifaot", PpMode::Aot) => true,
                    _ => false,
                };
                let cond = parent && cond;
                self.cond_stack.push(CondFrame { parent_active: parent, branch_taken: cond, active: cond });
            }
            "elif" => {
                let frame = self.cond_stack.last().copied().ok_or_else(|| {
                    Diagnostic::error("HC1003", file, lineno, 1, "#elif without matching #if")
                })?;
                let active = if frame.branch_taken || !frame.parent_active {
                    false
                } else {
                    self.eval_condition(rest, file, lineno)? != 0
                };
                let top = self.cond_stack.last_mut().unwrap();
                top.active = active;
                top.branch_taken = frame.branch_taken || active;
            }
            "else" => {
                let top = self.cond_stack.last_mut().ok_or_else(|| {
                    Diagnostic::error("HC1003", file, lineno, 1, "#else without matching #if")
                })?;
                top.active = top.parent_active && !top.branch_taken;
                top.branch_taken = true;
            }
            "endif" => {
                if self.cond_stack.pop().is_none() {
                    return Err(Diagnostic::error("HC1003", file, lineno, 1, "#endif without matching #if"));
                }
            }
            "define" => {
                if self.active() {
                    self.define_macro(rest, file, lineno)?;
                }
            }
            "include" => {
                if self.active() {
                    self.include(rest, file, lineno, dir)?;
                }
            }
            "assert" => {
                if self.active() {
                    let value = self.eval_condition(rest, file, lineno)?;
                    if value == 0 {
                        return Err(Diagnostic::error(
                            "HC1040",
                            file,
                            lineno,
                            1,
                            format!("assertion failed: {}", rest),
                        ));
                    }
                }
            }
            "exe" => {
                return self.exe_block(lines, idx, file, dir);
            }
            _ => {
                return Err(Diagnostic::error(
                    "HC1001",
                    file,
                    lineno,
                    1,
                    format!("unrecognized preprocessor directive '#{}'", name),
                ));
            }
        }
        Ok(1)
    }

    fn define_macro(&mut self, rest: &str, file: &str, lineno: usize) -> Result<(), Diagnostic> {
        let mut chars = rest.char_indices().peekable();
        let mut name = String::new();
        while let Some(&(_, c)) = chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                name.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(Diagnostic::error("HC1030", file, lineno, 1, "malformed #define: missing macro name"));
        }
        // A '(' immediately after the name makes it function-like.
        if let Some(&(pos, '(')) = chars.peek() {
            let close = rest[pos..].find(')').ok_or_else(|| {
                Diagnostic::error("HC1030", file, lineno, 1, "malformed #define: unterminated parameter list")
            })?;
            let params: Vec<String> = rest[pos + 1..pos + close]
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            let body = rest[pos + close + 1..].trim().to_string();
            self.macros.insert(name, Macro::Function { params, body });
        } else {
            let body = rest[name.len()..].trim().to_string();
            self.macros.insert(name, Macro::Object(body));
        }
        Ok(())
    }

    fn include(&mut self, rest: &str, file: &str, lineno: usize, dir: &Path) -> Result<(), Diagnostic> {
        let path_str = rest
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .ok_or_else(|| {
                Diagnostic::error("HC1001", file, lineno, 1, "malformed #include: expected \"path\"")
            })?;
        // Relative to the including file first, then the configured roots.
        let mut candidates = vec![dir.join(path_str)];
        for root in &self.opts.include_roots {
            candidates.push(root.join(path_str));
        }
        let found = candidates.into_iter().find(|c| c.is_file());
        match found {
            Some(path) => self.run_file(&path),
            None => Err(Diagnostic::error(
                "HC1025",
                file,
                lineno,
                1,
                format!("include file \"{}\" not found", path_str),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Macro expansion
    // ------------------------------------------------------------------

    fn expand(&self, text: &str, ctx: &ExpandCtx, active: &mut HashSet<String>) -> Result<String, Diagnostic> {
        let chars: Vec<char> = text.chars().collect();
        let mut out = String::with_capacity(text.len());
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            // Strings and chars pass through untouched.
            if c == '"' || c == '\'' {
                let quote = c;
                out.push(c);
                i += 1;
                while i < chars.len() {
                    out.push(chars[i]);
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        out.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                    if chars[i] == quote {
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                continue;
            }
            if c.is_ascii_alphabetic() || c == '_' {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                if let Some(expansion) = builtin_macro(&ident, ctx) {
                    out.push_str(&expansion);
                    continue;
                }
                if active.contains(&ident) {
                    out.push_str(&ident);
                    continue;
                }
                match self.macros.get(&ident) {
                    Some(Macro::Object(body)) => {
                        active.insert(ident.clone());
                        let expanded = self.expand(body, ctx, active)?;
                        active.remove(&ident);
                        out.push_str(&expanded);
                    }
                    Some(Macro::Function { params, body }) => {
                        // Function-like macros require an argument list.
                        let mut j = i;
                        while j < chars.len() && chars[j].is_whitespace() {
                            j += 1;
                        }
                        if j >= chars.len() || chars[j] != '(' {
                            out.push_str(&ident);
                            continue;
                        }
                        let (args, after) = collect_macro_args(&chars, j, ctx.file, ctx.line)?;
                        if args.len() != params.len() {
                            return Err(Diagnostic::error(
                                "HC1032",
                                ctx.file,
                                ctx.line,
                                1,
                                format!(
                                    "macro '{}' expects {} argument(s), got {}",
                                    ident,
                                    params.len(),
                                    args.len()
                                ),
                            ));
                        }
                        let mut expanded_args = Vec::with_capacity(args.len());
                        for a in &args {
                            expanded_args.push(self.expand(a.trim(), ctx, active)?);
                        }
                        let substituted = substitute_params(body, params, &expanded_args);
                        active.insert(ident.clone());
                        let expanded = self.expand(&substituted, ctx, active)?;
                        active.remove(&ident);
                        out.push_str(&expanded);
                        i = after;
                    }
                    None => out.push_str(&ident),
                }
                continue;
            }
            out.push(c);
            i += 1;
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // #if expression evaluation
    // ------------------------------------------------------------------

    fn eval_condition(&self, expr: &str, file: &str, lineno: usize) -> Result<i64, Diagnostic> {
        // Resolve defined(X) before macro expansion so the operand is not
        // itself expanded.
        let resolved = self.resolve_defined(expr);
        let ctx = ExpandCtx { file, dir: "", line: lineno };
        let mut active = HashSet::new();
        let expanded = self.expand(&resolved, &ctx, &mut active)?;
        let tokens = lexer::tokenize(&expanded, file)
            .map_err(|e| Diagnostic::error("HC1010", file, lineno, 1, format!("bad #if expression: {}", e.message)))?;
        let mut eval = CondEval { tokens: &tokens, pos: 0, file, line: lineno };
        let value = eval.expr(0)?;
        if eval.pos != eval.tokens.len() {
            return Err(Diagnostic::error(
                "HC1010",
                file,
                lineno,
                1,
                format!("trailing tokens in #if expression near '{}'", eval.tokens[eval.pos].text),
            ));
        }
        Ok(value)
    }

    fn resolve_defined(&self, expr: &str) -> String {
        let mut out = String::new();
        let mut rest = expr;
        while let Some(pos) = rest.find("defined") {
            // Must sit on an identifier boundary ("undefined" is not it).
            let at_boundary = rest[..pos]
                .chars()
                .next_back()
                .map(|c| !c.is_ascii_alphanumeric() && c != '_')
                .unwrap_or(true);
            if !at_boundary {
                out.push_str(&rest[..pos + "defined".len()]);
                rest = &rest[pos + "defined".len()..];
                continue;
            }
            out.push_str(&rest[..pos]);
            let after = &rest[pos + "defined".len()..];
            let trimmed = after.trim_start();
            if let Some(inner) = trimmed.strip_prefix('(') {
                if let Some(close) = inner.find(')') {
                    let name = inner[..close].trim();
                    out.push_str(if self.macros.contains_key(name) { "1" } else { "0" });
                    rest = &inner[close + 1..];
                    continue;
                }
            }
            out.push_str("defined");
            rest = after;
        }
        out.push_str(rest);
        out
    }

    // ------------------------------------------------------------------
    // #exe mini-language
    // ------------------------------------------------------------------

    /// Process a `#exe { ... }` block starting on `lines[idx]`. Returns
    /// the number of consumed input lines.
    fn exe_block(&mut self, lines: &[&str], idx: usize, file: &str, dir: &Path) -> Result<usize, Diagnostic> {
        let lineno = idx + 1;
        // Gather text from the first '{' through its balanced '}'.
        let mut joined = String::new();
        let mut consumed = 0;
        let mut depth = 0i32;
        let mut started = false;
        let mut done = false;
        for (off, line) in lines[idx..].iter().enumerate() {
            let content = if off == 0 {
                match line.find("exe") {
                    Some(p) => &line[p + 3..],
                    None => line,
                }
            } else {
                line
            };
            for c in content.chars() {
                if !started {
                    if c == '{' {
                        started = true;
                        depth = 1;
                    }
                    continue;
                }
                match c {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            done = true;
                        }
                    }
                    _ => {}
                }
                if done {
                    break;
                }
                joined.push(c);
            }
            consumed = off + 1;
            if done {
                break;
            }
            joined.push('\n');
        }
        if !started || !done {
            return Err(Diagnostic::error("HC1020", file, lineno, 1, "#exe body must be one balanced { ... } block"));
        }
        if self.active() {
            self.run_exe(&joined, file, lineno, dir)?;
        }
        Ok(consumed)
    }

    fn run_exe(&mut self, body: &str, file: &str, lineno: usize, dir: &Path) -> Result<(), Diagnostic> {
        let ctx = ExpandCtx { file, dir: &dir.display().to_string(), line: lineno };
        let mut active = HashSet::new();
        let expanded = self.expand(body, &ctx, &mut active)?;
        let tokens = lexer::tokenize(&expanded, file)
            .map_err(|e| Diagnostic::error("HC1020", file, lineno, 1, format!("bad #exe body: {}", e.message)))?;
        let mut emitted = String::new();
        let mut interp = ExeInterp { tokens: &tokens, pos: 0, file, line: lineno };
        interp.run_statements(true, &mut emitted)?;
        self.output.push_str(&emitted);
        Ok(())
    }
}

/// Interpreter for the `#exe` statement list.
struct ExeInterp<'a> {
    tokens: &'a [lexer::Token],
    pos: usize,
    file: &'a str,
    line: usize,
}

impl<'a> ExeInterp<'a> {
    fn err(&self, code: &'static str, msg: String) -> Diagnostic {
        Diagnostic::error(code, self.file, self.line, 1, msg)
    }

    fn run_statements(&mut self, live: bool, out: &mut String) -> Result<(), Diagnostic> {
        while self.pos < self.tokens.len() {
            if self.tokens[self.pos].is("}") {
                return Ok(());
            }
            self.run_statement(live, out)?;
        }
        Ok(())
    }

    fn run_statement(&mut self, live: bool, out: &mut String) -> Result<(), Diagnostic> {
        let tok = &self.tokens[self.pos];
        if tok.is(";") {
            self.pos += 1;
            return Ok(());
        }
        if tok.is("if") {
            self.pos += 1;
            let cond = self.paren_condition()?;
            self.run_block_or_statement(live && cond != 0, out)?;
            if self.pos < self.tokens.len() && self.tokens[self.pos].is("else") {
                self.pos += 1;
                self.run_block_or_statement(live && cond == 0, out)?;
            }
            return Ok(());
        }
        if tok.kind == lexer::TokenKind::Ident {
            let name = tok.text.clone();
            self.pos += 1;
            if self.pos >= self.tokens.len() || !self.tokens[self.pos].is("(") {
                return Err(self.err("HC1019", format!("unsupported #exe statement '{}'", name)));
            }
            match name.as_str() {
                "StreamPrint" | "StreamDoc" | "StreamExePrint" => {
                    let text = self.string_args()?;
                    if live {
                        out.push_str(&text);
                    }
                }
                "Option" | "Cd" => {
                    self.skip_args()?;
                }
                _ => {
                    return Err(self.err("HC1019", format!("unsupported call '{}' in #exe block", name)));
                }
            }
            if self.pos < self.tokens.len() && self.tokens[self.pos].is(";") {
                self.pos += 1;
            }
            return Ok(());
        }
        Err(self.err("HC1019", format!("unsupported token '{}' in #exe block", tok.text)))
    }

    fn run_block_or_statement(&mut self, live: bool, out: &mut String) -> Result<(), Diagnostic> {
        if self.pos < self.tokens.len() && self.tokens[self.pos].is("{") {
            self.pos += 1;
            self.run_statements(live, out)?;
            if self.pos >= self.tokens.len() || !self.tokens[self.pos].is("}") {
                return Err(self.err("HC1020", "unbalanced braces in #exe block".to_string()));
            }
            self.pos += 1;
            Ok(())
        } else {
            self.run_statement(live, out)
        }
    }

    /// Evaluate `( expr )` with the `#if` expression language.
    fn paren_condition(&mut self) -> Result<i64, Diagnostic> {
        if self.pos >= self.tokens.len() || !self.tokens[self.pos].is("(") {
            return Err(self.err("HC1020", "expected '(' after if in #exe block".to_string()));
        }
        let start = self.pos;
        let mut depth = 0i32;
        while self.pos < self.tokens.len() {
            if self.tokens[self.pos].is("(") {
                depth += 1;
            } else if self.tokens[self.pos].is(")") {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            self.pos += 1;
        }
        if depth != 0 {
            return Err(self.err("HC1020", "unbalanced parentheses in #exe condition".to_string()));
        }
        let inner = &self.tokens[start + 1..self.pos];
        self.pos += 1; // consume ')'
        let mut eval = CondEval { tokens: inner, pos: 0, file: self.file, line: self.line };
        eval.expr(0)
    }

    /// Parse `( "lit" "lit" ... )`, concatenating string literals.
    fn string_args(&mut self) -> Result<String, Diagnostic> {
        self.pos += 1; // '('
        let mut text = String::new();
        let mut saw_literal = false;
        while self.pos < self.tokens.len() && !self.tokens[self.pos].is(")") {
            let tok = &self.tokens[self.pos];
            if tok.kind == lexer::TokenKind::Str {
                text.push_str(&lexer::unescape(lexer::literal_inner(&tok.text)));
                saw_literal = true;
            } else if !tok.is(",") {
                return Err(self.err("HC1019", "stream calls take string literal arguments".to_string()));
            }
            self.pos += 1;
        }
        if self.pos >= self.tokens.len() {
            return Err(self.err("HC1020", "unbalanced parentheses in #exe block".to_string()));
        }
        self.pos += 1; // ')'
        if !saw_literal {
            return Err(self.err("HC1019", "stream call requires a string literal".to_string()));
        }
        Ok(text)
    }

    fn skip_args(&mut self) -> Result<(), Diagnostic> {
        let mut depth = 0i32;
        while self.pos < self.tokens.len() {
            if self.tokens[self.pos].is("(") {
                depth += 1;
            } else if self.tokens[self.pos].is(")") {
                depth -= 1;
                if depth == 0 {
                    self.pos += 1;
                    return Ok(());
                }
            }
            self.pos += 1;
        }
        Err(self.err("HC1020", "unbalanced parentheses in #exe block".to_string()))
    }
}

/// Pratt evaluator for `#if` expressions over i64.
struct CondEval<'a> {
    tokens: &'a [lexer::Token],
    pos: usize,
    file: &'a str,
    line: usize,
}

impl<'a> CondEval<'a> {
    fn err(&self, msg: String) -> Diagnostic {
        Diagnostic::error("HC1010", self.file, self.line, 1, msg)
    }

    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(|t| t.text.as_str())
    }

    fn expr(&mut self, min_bp: u8) -> Result<i64, Diagnostic> {
        let mut lhs = self.primary()?;
        loop {
            let op = match self.peek() {
                Some(op) => op.to_string(),
                None => break,
            };
            let bp = match binary_bp(&op) {
                Some(bp) => bp,
                None => break,
            };
            if bp < min_bp {
                break;
            }
            self.pos += 1;
            let rhs = self.expr(bp + 1)?;
            lhs = apply_binary(&op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn primary(&mut self) -> Result<i64, Diagnostic> {
        let tok = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| self.err("unexpected end of #if expression".to_string()))?
            .clone();
        self.pos += 1;
        match tok.kind {
            lexer::TokenKind::Number => Ok(lexer::parse_int_literal(&tok.text)),
            // Unresolved identifiers default to 0.
            lexer::TokenKind::Ident => Ok(0),
            lexer::TokenKind::Char => Ok(lexer::char_literal_value(&tok.text)),
            lexer::TokenKind::Punct => match tok.text.as_str() {
                "(" => {
                    let value = self.expr(0)?;
                    if self.peek() != Some(")") {
                        return Err(self.err("expected ')' in #if expression".to_string()));
                    }
                    self.pos += 1;
                    Ok(value)
                }
                "!" => Ok((self.primary()? == 0) as i64),
                "-" => Ok(self.primary()?.wrapping_neg()),
                "+" => self.primary(),
                "~" => Ok(!self.primary()?),
                other => Err(self.err(format!("unexpected '{}' in #if expression", other))),
            },
            lexer::TokenKind::Str => Err(self.err("string literals are not allowed in #if expressions".to_string())),
        }
    }
}

fn binary_bp(op: &str) -> Option<u8> {
    Some(match op {
        "*" | "/" | "%" => 10,
        "+" | "-" => 9,
        "<<" | ">>" => 8,
        "<" | ">" | "<=" | ">=" => 7,
        "==" | "!=" => 6,
        "&" => 5,
        "^" => 4,
        "|" => 3,
        "&&" => 2,
        "||" => 1,
        _ => return None,
    })
}

fn apply_binary(op: &str, a: i64, b: i64) -> i64 {
    match op {
        "*" => a.wrapping_mul(b),
        "/" => {
            if b == 0 {
                0
            } else {
                a.wrapping_div(b)
            }
        }
        "%" => {
            if b == 0 {
                0
            } else {
                a.wrapping_rem(b)
            }
        }
        "+" => a.wrapping_add(b),
        "-" => a.wrapping_sub(b),
        "<<" => a.wrapping_shl(b as u32 & 63),
        ">>" => a.wrapping_shr(b as u32 & 63),
        "<" => (a < b) as i64,
        ">" => (a > b) as i64,
        "<=" => (a <= b) as i64,
        ">=" => (a >= b) as i64,
        "==" => (a == b) as i64,
        "!=" => (a != b) as i64,
        "&" => a & b,
        "^" => a ^ b,
        "|" => a | b,
        "&&" => (a != 0 && b != 0) as i64,
        "||" => (a != 0 || b != 0) as i64,
        _ => 0,
    }
}

fn split_directive(body: &str) -> (&str, &str) {
    let end = body
        .char_indices()
        .find(|(_, c)| !c.is_ascii_alphanumeric() && *c != '_')
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    (&body[..end], &body[end..])
}

/// Contextual and deterministic builtin macros.
fn builtin_macro(name: &str, ctx: &ExpandCtx) -> Option<String> {
    match name {
        "__FILE__" => Some(format!("\"{}\"", ctx.file)),
        "__DIR__" => Some(format!("\"{}\"", ctx.dir)),
        "__LINE__" => Some(ctx.line.to_string()),
        // Deterministic placeholders so emitted modules reproduce exactly.
        "__DATE__" => Some("\"Jan  1 1970\"".to_string()),
        "__TIME__" => Some("\"00:00:00\"".to_string()),
        "__CMD_LINE__" => Some("\"holycc\"".to_string()),
        _ => None,
    }
}

/// Collect the parenthesized arguments of a function-like macro starting
/// at `chars[open]` (which must be '('). Returns the argument texts and
/// the index just past the closing ')'.
fn collect_macro_args(
    chars: &[char],
    open: usize,
    file: &str,
    line: usize,
) -> Result<(Vec<String>, usize), Diagnostic> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut i = open;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '(' | '[' | '{' => {
                depth += 1;
                if depth > 1 {
                    current.push(c);
                }
            }
            ')' | ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    if !current.trim().is_empty() || !args.is_empty() {
                        args.push(current);
                    }
                    return Ok((args, i + 1));
                }
                current.push(c);
            }
            ',' if depth == 1 => {
                args.push(std::mem::take(&mut current));
            }
            '"' | '\'' => {
                let quote = c;
                current.push(c);
                i += 1;
                while i < chars.len() {
                    current.push(chars[i]);
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        current.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                    if chars[i] == quote {
                        break;
                    }
                    i += 1;
                }
            }
            _ => current.push(c),
        }
        i += 1;
    }
    Err(Diagnostic::error("HC1033", file, line, 1, "unterminated macro argument list"))
}

/// Substitute parameter names with argument texts at identifier
/// boundaries.
fn substitute_params(body: &str, params: &[String], args: &[String]) -> String {
    let chars: Vec<char> = body.chars().collect();
    let mut out = String::with_capacity(body.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' {
            let quote = c;
            out.push(c);
            i += 1;
            while i < chars.len() {
                out.push(chars[i]);
                if chars[i] == '\\' && i + 1 < chars.len() {
                    out.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                if chars[i] == quote {
                    i += 1;
                    break;
                }
                i += 1;
            }
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            match params.iter().position(|p| *p == ident) {
                Some(idx) => out.push_str(&args[idx]),
                None => out.push_str(&ident),
            }
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pp(source: &str) -> Result<String, Diagnostic> {
        preprocess_text(source, "test.HC", &PpOptions::default())
    }

    #[test]
    fn test_plain_text_passthrough() {
        assert_eq!(pp("I64 x;\n").unwrap(), "I64 x;\n");
    }

    #[test]
    fn test_object_macro() {
        let out = pp("#define N 5\nI64 x = N;\n").unwrap();
        assert_eq!(out, "I64 x = 5;\n");
    }

    #[test]
    fn test_function_macro() {
        let out = pp("#define SQ(a) ((a)*(a))\nI64 x = SQ(3);\n").unwrap();
        assert_eq!(out, "I64 x = ((3)*(3));\n");
    }

    #[test]
    fn test_function_macro_arity_mismatch() {
        let err = pp("#define F(a,b) a+b\nF(1);\n").unwrap_err();
        assert_eq!(err.code, "HC1032");
    }

    #[test]
    fn test_macro_reentrancy_guard() {
        // Self-referencing macro must not expand forever.
        let out = pp("#define X X+1\nI64 y = X;\n").unwrap();
        assert_eq!(out, "I64 y = X+1;\n");
    }

    #[test]
    fn test_conditionals() {
        let src = "#if 1\nA\n#else\nB\n#endif\n";
        assert_eq!(pp(src).unwrap(), "A\n");
        let src = "#if 0\nA\n#elif 2>1\nB\n#else\nC\n#endif\n";
        assert_eq!(pp(src).unwrap(), "B\n");
    }

    #[test]
    fn test_nested_conditionals() {
        let src = "#if 1\n#if 0\nX\n#endif\nY\n#endif\n";
        assert_eq!(pp(src).unwrap(), "Y\n");
    }

    #[test]
    fn test_unterminated_conditional() {
        let err = pp("#if 1\nA\n").unwrap_err();
        assert_eq!(err.code, "HC1002");
    }

    #[test]
    fn test_endif_without_if() {
        let err = pp("#endif\n").unwrap_err();
        assert_eq!(err.code, "HC1003");
    }

    #[test]
    fn test_defined_and_missing_macro_default() {
        let src = "#define HAVE 1\n#if defined(HAVE) && !defined(MISSING) && UNKNOWN == 0\nok\n#endif\n";
        assert_eq!(pp(src).unwrap(), "ok\n");
    }

    #[test]
    fn test_ifdef_ifndef() {
        let src = "#define A 1\n#ifdef A\nyes\n#endif\n#ifndef A\nno\n#endif\n";
        assert_eq!(pp(src).unwrap(), "yes\n");
    }

    #[test]
    fn test_mode_flags() {
        let src = "#ifjit\nJ\n#endif\n#ifaot\nA\n#endif\n";
        let jit = preprocess_text(src, "t.HC", &PpOptions { mode: PpMode::Jit, include_roots: vec![] }).unwrap();
        assert_eq!(jit, "J\n");
        let aot = preprocess_text(src, "t.HC", &PpOptions { mode: PpMode::Aot, include_roots: vec![] }).unwrap();
        assert_eq!(aot, "A\n");
    }

    #[test]
    fn test_assert() {
        assert!(pp("#assert 1+1==2\n").is_ok());
        let err = pp("#assert 1==2\n").unwrap_err();
        assert_eq!(err.code, "HC1040");
    }

    #[test]
    fn test_exe_stream_print() {
        let out = pp("#exe { StreamPrint(\"I64 g=7;\"); }\nI64 x;\n").unwrap();
        assert!(out.contains("I64 g=7;"));
        assert!(out.contains("I64 x;"));
    }

    #[test]
    fn test_exe_if_else() {
        let out = pp("#exe { if (1) { StreamPrint(\"yes\"); } else { StreamPrint(\"no\"); } }\n").unwrap();
        assert_eq!(out, "yes");
    }

    #[test]
    fn test_exe_rejects_unknown_call() {
        let err = pp("#exe { Delete(\"x\"); }\n").unwrap_err();
        assert_eq!(err.code, "HC1019");
    }

    #[test]
    fn test_exe_noop_calls() {
        let out = pp("#exe { Option(1, 2); Cd(\"..\"); }\nz;\n").unwrap();
        assert_eq!(out, "z;\n");
    }

    #[test]
    fn test_include_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.HC");
        let b = dir.path().join("b.HC");
        std::fs::write(&a, "#include \"b.HC\"\n").unwrap();
        std::fs::write(&b, "#include \"a.HC\"\n").unwrap();
        let err = preprocess_file(&a, &PpOptions::default()).unwrap_err();
        assert_eq!(err.code, "HC1023");
        let help = err.help.unwrap();
        assert!(help.contains("a.HC") && help.contains("b.HC"));
    }

    #[test]
    fn test_include_splices_content() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.HC");
        let b = dir.path().join("b.HC");
        std::fs::write(&a, "#include \"b.HC\"\nI64 x;\n").unwrap();
        std::fs::write(&b, "I64 g;\n").unwrap();
        let out = preprocess_file(&a, &PpOptions::default()).unwrap();
        assert_eq!(out, "I64 g;\nI64 x;\n");
    }

    #[test]
    fn test_include_missing() {
        let err = pp("#include \"no_such_file_here.HC\"\n").unwrap_err();
        assert_eq!(err.code, "HC1025");
    }

    #[test]
    fn test_line_macro() {
        let out = pp("a\nI64 l = __LINE__;\n").unwrap();
        assert_eq!(out, "a\nI64 l = 2;\n");
    }

    #[test]
    fn test_deterministic_placeholders() {
        let out = pp("__DATE__ __TIME__ __CMD_LINE__\n").unwrap();
        assert_eq!(out, "\"Jan  1 1970\" \"00:00:00\" \"holycc\"\n");
    }

    #[test]
    fn test_macros_not_expanded_in_strings() {
        let out = pp("#define N 5\n\"N\";\n").unwrap();
        assert_eq!(out, "\"N\";\n");
    }

    #[test]
    fn test_unknown_directive() {
        let err = pp("#pragma once\n").unwrap_err();
        assert_eq!(err.code, "HC1001");
    }
}
