//! Recursive-descent parser producing the untyped `ParsedNode` tree.
//!
//! Statements are dispatched off the leading token; expressions use a
//! Pratt ladder (comma lowest, postfix highest). Declarations are
//! recognized with bounded lookahead: type tokens, pointer markers, a
//! declarator, and balanced parentheses, then `{` or `;` selects a
//! function definition or prototype.

use crate::ast::{NodeKind, ParsedNode};
use crate::diag::Diagnostic;
use crate::lexer::{self, Token, TokenKind};

/// Storage / linkage specifier keywords accepted in declaration position.
/// Strict mode rejects most of these later, in semantic analysis.
const DECL_SPECS: &[&str] = &[
    "extern", "import", "static", "public", "interrupt", "noreg", "reg",
    "no_warn", "_extern", "_import", "_export",
];

const LINKAGE_SPECS: &[&str] = &["extern", "import", "_extern", "_import"];

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    file: String,
    anon_counter: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>, file: impl Into<String>) -> Self {
        Parser { tokens, pos: 0, file: file.into(), anon_counter: 0 }
    }

    /// Tokenize and parse a whole source text.
    pub fn parse_source(source: &str, file: &str) -> Result<ParsedNode, Diagnostic> {
        let tokens = lexer::tokenize(source, file)?;
        Parser::new(tokens, file).parse_program()
    }

    pub fn parse_program(&mut self) -> Result<ParsedNode, Diagnostic> {
        let mut program = ParsedNode::new(NodeKind::Program, "", 1, 1);
        while !self.at_eof() {
            program.push(self.parse_top_item()?);
        }
        Ok(program)
    }

    // ======================================================================
    // Token management
    // ======================================================================

    fn at_eof(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn check(&self, text: &str) -> bool {
        self.peek().map(|t| t.text == text).unwrap_or(false)
    }

    fn check_at(&self, offset: usize, text: &str) -> bool {
        self.peek_at(offset).map(|t| t.text == text).unwrap_or(false)
    }

    fn check_kind(&self, kind: TokenKind) -> bool {
        self.peek().map(|t| t.kind == kind).unwrap_or(false)
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        self.pos += 1;
        tok
    }

    fn pos_of(&self, offset_back: usize) -> (usize, usize) {
        let idx = self.pos.saturating_sub(offset_back).min(self.tokens.len().saturating_sub(1));
        match self.tokens.get(idx) {
            Some(t) => (t.line, t.column),
            None => (1, 1),
        }
    }

    fn here(&self) -> (usize, usize) {
        match self.peek() {
            Some(t) => (t.line, t.column),
            None => self.pos_of(1),
        }
    }

    fn expect(&mut self, text: &str) -> Result<Token, Diagnostic> {
        if self.check(text) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&format!("'{}'", text)))
        }
    }

    fn expect_ident(&mut self) -> Result<Token, Diagnostic> {
        if self.check_kind(TokenKind::Ident) {
            Ok(self.advance())
        } else {
            Err(self.unexpected("identifier"))
        }
    }

    fn unexpected(&self, expected: &str) -> Diagnostic {
        let (line, column) = self.here();
        match self.peek() {
            Some(tok) => Diagnostic::error(
                "HC2101",
                &self.file,
                line,
                column,
                format!("expected {}, found '{}'", expected, tok.text),
            ),
            None => Diagnostic::error(
                "HC2102",
                &self.file,
                line,
                column,
                format!("unexpected end of input, expected {}", expected),
            ),
        }
    }

    // ======================================================================
    // Declarations
    // ======================================================================

    fn parse_top_item(&mut self) -> Result<ParsedNode, Diagnostic> {
        if self.check("class") || self.check("union") {
            return self.parse_class_decl();
        }
        if self.check("typedef") {
            return self.parse_typedef();
        }
        if self.looks_like_function_decl() {
            return self.parse_function_decl();
        }
        self.parse_statement()
    }

    /// Lookahead: specifiers, type tokens, pointer markers, declarator,
    /// balanced parentheses, then `{` or `;` means a function.
    fn looks_like_function_decl(&self) -> bool {
        let mut i = self.pos;
        let at = |i: usize| self.tokens.get(i);
        while at(i).map(|t| DECL_SPECS.contains(&t.text.as_str())).unwrap_or(false) {
            i += 1;
        }
        // Return type: a type keyword or an identifier naming an aggregate.
        match at(i) {
            Some(t) if t.kind == TokenKind::Ident && !lexer::is_keyword(&t.text) => i += 1,
            Some(t) if lexer::is_type_keyword(&t.text) => i += 1,
            _ => return false,
        }
        while at(i).map(|t| t.text == "*").unwrap_or(false) {
            i += 1;
        }
        // Declarator name.
        match at(i) {
            Some(t) if t.kind == TokenKind::Ident && !lexer::is_keyword(&t.text) => i += 1,
            _ => return false,
        }
        if !at(i).map(|t| t.text == "(").unwrap_or(false) {
            return false;
        }
        let mut depth = 0i32;
        while let Some(t) = at(i) {
            match t.text.as_str() {
                "(" | "[" | "{" => depth += 1,
                ")" | "]" | "}" => {
                    depth -= 1;
                    if depth == 0 {
                        i += 1;
                        break;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        matches!(at(i).map(|t| t.text.as_str()), Some("{") | Some(";"))
    }

    fn parse_decl_specs(&mut self) -> Vec<ParsedNode> {
        let mut specs = Vec::new();
        while let Some(tok) = self.peek() {
            if DECL_SPECS.contains(&tok.text.as_str()) {
                let tok = self.advance();
                specs.push(ParsedNode::new(NodeKind::DeclSpec, tok.text, tok.line, tok.column));
            } else {
                break;
            }
        }
        specs
    }

    /// A base type: one type keyword or aggregate name, then `*` markers.
    fn parse_type_string(&mut self) -> Result<String, Diagnostic> {
        let base = self.expect_ident()?;
        let mut ty = base.text;
        while self.check("*") {
            self.advance();
            ty.push('*');
        }
        Ok(ty)
    }

    fn parse_function_decl(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        let specs = self.parse_decl_specs();
        let ret = self.parse_type_string()?;
        let name = self.expect_ident()?;

        let mut node = ParsedNode::new(NodeKind::FunctionDecl, name.text, line, column);
        node.children = specs;
        node.push(ParsedNode::new(NodeKind::DeclType, ret, line, column));

        self.expect("(")?;
        node.push(self.parse_param_list()?);
        self.expect(")")?;

        if self.check("{") {
            node.push(self.parse_block()?);
        } else {
            self.expect(";")?;
        }
        Ok(node)
    }

    /// ParamList: comma-delimited parameters with brace/bracket balancing;
    /// an `=` starts a default expression that is re-parsed on its own
    /// token stream.
    fn parse_param_list(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        let mut list = ParsedNode::new(NodeKind::ParamList, "", line, column);
        if self.check(")") {
            return Ok(list);
        }
        loop {
            list.push(self.parse_param()?);
            if self.check(",") {
                self.advance();
                continue;
            }
            break;
        }
        Ok(list)
    }

    fn parse_param(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        let ty = self.parse_type_string()?;
        let name = if self.check_kind(TokenKind::Ident) && !self.check(",") {
            self.advance().text
        } else {
            String::new()
        };
        let mut param = ParsedNode::new(NodeKind::Param, name, line, column);
        param.push(ParsedNode::new(NodeKind::DeclType, ty, line, column));

        if self.check("=") {
            self.advance();
            // Collect default tokens up to a top-level ',' or ')'.
            let mut collected: Vec<Token> = Vec::new();
            let mut depth = 0i32;
            while let Some(tok) = self.peek() {
                match tok.text.as_str() {
                    "(" | "[" | "{" => depth += 1,
                    ")" | "]" | "}" => {
                        if depth == 0 {
                            break;
                        }
                        depth -= 1;
                    }
                    "," if depth == 0 => break,
                    _ => {}
                }
                collected.push(self.advance());
            }
            if collected.is_empty() {
                return Err(self.unexpected("default expression"));
            }
            let mut sub = Parser::new(collected, self.file.clone());
            let expr = sub.parse_assign_expr()?;
            let mut default = ParsedNode::new(NodeKind::Default, "", line, column);
            default.push(expr);
            param.push(default);
        }
        Ok(param)
    }

    fn parse_typedef(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        self.expect("typedef")?;
        let mut parts = Vec::new();
        while !self.check(";") {
            if self.at_eof() {
                return Err(self.unexpected("';'"));
            }
            parts.push(self.advance().text);
        }
        self.expect(";")?;
        Ok(ParsedNode::new(NodeKind::TypeAliasDecl, parts.join(" "), line, column))
    }

    fn parse_class_decl(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        let keyword = self.advance(); // class | union
        let is_union = keyword.text == "union";

        let name = if self.check_kind(TokenKind::Ident) && !self.check("{") {
            self.advance().text
        } else {
            self.anon_counter += 1;
            format!("__holyc_anon_aggregate_{}", self.anon_counter)
        };

        let mut node = ParsedNode::new(NodeKind::ClassDecl, name.clone(), line, column);
        if is_union {
            node.push(ParsedNode::new(NodeKind::DeclSpec, "union", line, column));
        }

        self.expect("{")?;
        while !self.check("}") {
            if self.at_eof() {
                return Err(self.unexpected("'}'"));
            }
            node.push(self.parse_field_decl()?);
        }
        self.expect("}")?;

        // Optional trailing declarators, typed by the aggregate itself.
        while !self.check(";") {
            let (dl, dc) = self.here();
            let mut ty = name.clone();
            while self.check("*") {
                self.advance();
                ty.push('*');
            }
            let dname = self.expect_ident()?;
            let mut var = ParsedNode::new(NodeKind::VarDecl, dname.text, dl, dc);
            var.push(ParsedNode::new(NodeKind::DeclType, ty, dl, dc));
            if self.check("=") {
                self.advance();
                var.push(self.parse_assign_expr()?);
            }
            node.push(var);
            if self.check(",") {
                self.advance();
                continue;
            }
            break;
        }
        self.expect(";")?;
        Ok(node)
    }

    fn parse_field_decl(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        let ty = self.parse_type_string()?;
        let name = self.expect_ident()?;
        let mut field = ParsedNode::new(NodeKind::FieldDecl, name.text, line, column);
        field.push(ParsedNode::new(NodeKind::DeclType, ty, line, column));

        // Any tokens before ';' are carried as raw annotation metadata.
        let mut meta = Vec::new();
        while !self.check(";") {
            if self.at_eof() {
                return Err(self.unexpected("';'"));
            }
            meta.push(self.advance().text);
        }
        self.expect(";")?;
        if !meta.is_empty() {
            field.push(ParsedNode::new(NodeKind::FieldMetaTokens, meta.join(" "), line, column));
        }
        Ok(field)
    }

    /// Heuristic: does a statement position start a variable declaration?
    fn starts_declaration(&self) -> bool {
        let first = match self.peek() {
            Some(t) => t,
            None => return false,
        };
        if DECL_SPECS.contains(&first.text.as_str()) {
            return true;
        }
        if lexer::is_type_keyword(&first.text) {
            return true;
        }
        if first.kind != TokenKind::Ident || lexer::is_keyword(&first.text) {
            return false;
        }
        // `Foo x` or `Foo *x;` style aggregate declarations.
        let mut i = 1;
        while self.peek_at(i).map(|t| t.text == "*").unwrap_or(false) {
            i += 1;
        }
        let name_ok = self
            .peek_at(i)
            .map(|t| t.kind == TokenKind::Ident && !lexer::is_keyword(&t.text))
            .unwrap_or(false);
        if !name_ok {
            return false;
        }
        if i == 1 {
            // `Foo x` with no stars is unambiguous.
            return true;
        }
        matches!(
            self.peek_at(i + 1).map(|t| t.text.as_str()),
            Some(";") | Some("=") | Some(",")
        )
    }

    /// Variable declaration statement: one declarator or a comma list
    /// that inherits the leading type tokens.
    fn parse_var_decl_stmt(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        let specs = self.parse_decl_specs();
        let base_ty = self.parse_type_string()?;

        let mut decls = Vec::new();
        loop {
            let (dl, dc) = self.here();
            let mut ty = base_ty.clone();
            // Later declarators may add their own pointer markers.
            if !decls.is_empty() {
                while self.check("*") {
                    self.advance();
                    ty.push('*');
                }
            }
            let name = self.expect_ident()?;
            let mut var = ParsedNode::new(NodeKind::VarDecl, name.text, dl, dc);
            for spec in &specs {
                var.push(spec.clone());
            }
            var.push(ParsedNode::new(NodeKind::DeclType, ty, dl, dc));
            if self.check("=") {
                self.advance();
                var.push(self.parse_assign_expr()?);
            }
            decls.push(var);
            if self.check(",") {
                self.advance();
                continue;
            }
            break;
        }
        self.expect(";")?;

        let has_linkage = specs.iter().any(|s| LINKAGE_SPECS.contains(&s.text.as_str()));
        if decls.len() == 1 {
            let mut decl = decls.pop().unwrap();
            if has_linkage && decl.children.iter().all(|c| c.kind != NodeKind::BinaryExpr) {
                // An extern/import variable without a body of its own is a
                // pure linkage declaration.
                let has_init = decl
                    .children
                    .iter()
                    .any(|c| !matches!(c.kind, NodeKind::DeclSpec | NodeKind::DeclType));
                if !has_init {
                    decl.kind = NodeKind::LinkageDecl;
                }
            }
            Ok(decl)
        } else {
            let mut list = ParsedNode::new(NodeKind::VarDeclList, "", line, column);
            list.children = decls;
            Ok(list)
        }
    }

    // ======================================================================
    // Statements
    // ======================================================================

    fn parse_block(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        self.expect("{")?;
        let mut block = ParsedNode::new(NodeKind::Block, "", line, column);
        while !self.check("}") {
            if self.at_eof() {
                return Err(self.unexpected("'}'"));
            }
            block.push(self.parse_statement()?);
        }
        self.expect("}")?;
        Ok(block)
    }

    pub fn parse_statement(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        let tok = match self.peek() {
            Some(t) => t.clone(),
            None => return Err(self.unexpected("statement")),
        };

        match tok.text.as_str() {
            "{" => return self.parse_block(),
            ";" => {
                self.advance();
                return Ok(ParsedNode::new(NodeKind::EmptyStmt, "", line, column));
            }
            "if" => return self.parse_if(),
            "while" => return self.parse_while(),
            "do" => return self.parse_do_while(),
            "for" => return self.parse_for(),
            "switch" => return self.parse_switch(),
            "return" => {
                self.advance();
                let mut node = ParsedNode::new(NodeKind::ReturnStmt, "", line, column);
                if !self.check(";") {
                    node.push(self.parse_expr()?);
                }
                self.expect(";")?;
                return Ok(node);
            }
            "break" => {
                self.advance();
                self.expect(";")?;
                return Ok(ParsedNode::new(NodeKind::BreakStmt, "", line, column));
            }
            "continue" => {
                return Err(Diagnostic::error(
                    "HC2103",
                    &self.file,
                    line,
                    column,
                    "HolyC has no 'continue'; use goto with a label",
                ));
            }
            "goto" => {
                self.advance();
                let label = self.expect_ident()?;
                self.expect(";")?;
                return Ok(ParsedNode::new(NodeKind::GotoStmt, label.text, line, column));
            }
            "try" => {
                self.advance();
                let body = self.parse_block()?;
                self.expect("catch")?;
                let catch = self.parse_block()?;
                let mut node = ParsedNode::new(NodeKind::TryStmt, "", line, column);
                node.push(body);
                node.push(catch);
                return Ok(node);
            }
            "throw" => {
                self.advance();
                self.expect("(")?;
                let payload = self.parse_expr()?;
                self.expect(")")?;
                self.expect(";")?;
                let mut node = ParsedNode::new(NodeKind::ThrowStmt, "", line, column);
                node.push(payload);
                return Ok(node);
            }
            "lock" => {
                self.advance();
                let body = self.parse_block()?;
                let mut node = ParsedNode::new(NodeKind::LockStmt, "", line, column);
                node.push(body);
                return Ok(node);
            }
            "asm" => return self.parse_asm(),
            "class" | "union" => return self.parse_class_decl(),
            "typedef" => return self.parse_typedef(),
            _ => {}
        }

        // Labels: `name:` (start/end become metadata markers).
        if tok.kind == TokenKind::Ident && self.check_at(1, ":") && !self.check_at(1, "::") {
            self.advance();
            self.advance();
            let kind = match tok.text.as_str() {
                "start" => NodeKind::StartLabel,
                "end" => NodeKind::EndLabel,
                _ => NodeKind::LabelStmt,
            };
            return Ok(ParsedNode::new(kind, tok.text, line, column));
        }

        // Print statements open with a string or char literal.
        if tok.kind == TokenKind::Str || tok.kind == TokenKind::Char {
            return self.parse_print();
        }

        if self.starts_declaration() {
            return self.parse_var_decl_stmt();
        }

        // A lone identifier followed by ';' is a no-paren call.
        if tok.kind == TokenKind::Ident && !lexer::is_keyword(&tok.text) && self.check_at(1, ";") {
            self.advance();
            self.advance();
            return Ok(ParsedNode::new(NodeKind::NoParenCallStmt, tok.text, line, column));
        }

        let expr = self.parse_expr()?;
        self.expect(";")?;
        let mut node = ParsedNode::new(NodeKind::ExprStmt, "", line, column);
        node.push(expr);
        Ok(node)
    }

    fn parse_print(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        let mut node = ParsedNode::new(NodeKind::PrintStmt, "", line, column);
        loop {
            node.push(self.parse_assign_expr()?);
            if self.check(",") {
                self.advance();
                continue;
            }
            break;
        }
        self.expect(";")?;
        Ok(node)
    }

    fn parse_if(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        self.expect("if")?;
        self.expect("(")?;
        let cond = self.parse_expr()?;
        self.expect(")")?;
        let then = self.parse_statement()?;
        let mut node = ParsedNode::new(NodeKind::IfStmt, "", line, column);
        node.push(cond);
        node.push(then);
        if self.check("else") {
            self.advance();
            node.push(self.parse_statement()?);
        }
        Ok(node)
    }

    fn parse_while(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        self.expect("while")?;
        self.expect("(")?;
        let cond = self.parse_expr()?;
        self.expect(")")?;
        let body = self.parse_statement()?;
        let mut node = ParsedNode::new(NodeKind::WhileStmt, "", line, column);
        node.push(cond);
        node.push(body);
        Ok(node)
    }

    fn parse_do_while(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        self.expect("do")?;
        let body = self.parse_statement()?;
        self.expect("while")?;
        self.expect("(")?;
        let cond = self.parse_expr()?;
        self.expect(")")?;
        self.expect(";")?;
        let mut node = ParsedNode::new(NodeKind::DoWhileStmt, "", line, column);
        node.push(body);
        node.push(cond);
        Ok(node)
    }

    /// `for(init; cond; inc) body` with four fixed child slots; missing
    /// init/inc are EmptyStmt, a missing condition is EmptyArg.
    fn parse_for(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        self.expect("for")?;
        self.expect("(")?;

        let init = if self.check(";") {
            self.advance();
            ParsedNode::new(NodeKind::EmptyStmt, "", line, column)
        } else if self.starts_declaration() {
            self.parse_var_decl_stmt()?
        } else {
            let expr = self.parse_expr()?;
            self.expect(";")?;
            let mut s = ParsedNode::new(NodeKind::ExprStmt, "", line, column);
            s.push(expr);
            s
        };

        let cond = if self.check(";") {
            ParsedNode::new(NodeKind::EmptyArg, "", line, column)
        } else {
            self.parse_expr()?
        };
        self.expect(";")?;

        let inc = if self.check(")") {
            ParsedNode::new(NodeKind::EmptyStmt, "", line, column)
        } else {
            let expr = self.parse_expr()?;
            let mut s = ParsedNode::new(NodeKind::ExprStmt, "", line, column);
            s.push(expr);
            s
        };
        self.expect(")")?;

        let body = self.parse_statement()?;
        let mut node = ParsedNode::new(NodeKind::ForStmt, "", line, column);
        node.push(init);
        node.push(cond);
        node.push(inc);
        node.push(body);
        Ok(node)
    }

    /// Switch: clauses accept `case E:`, `case E ... F:`, the null form
    /// `case:`, plus `start:` / `end:` markers.
    fn parse_switch(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        self.expect("switch")?;
        self.expect("(")?;
        let cond = self.parse_expr()?;
        self.expect(")")?;
        self.expect("{")?;

        let mut node = ParsedNode::new(NodeKind::SwitchStmt, "", line, column);
        node.push(cond);

        while !self.check("}") {
            if self.at_eof() {
                return Err(self.unexpected("'}'"));
            }
            let (cl, cc) = self.here();
            if self.check("case") {
                self.advance();
                let mut clause;
                if self.check(":") {
                    self.advance();
                    clause = ParsedNode::new(NodeKind::CaseClause, "null", cl, cc);
                } else {
                    let lo = self.parse_assign_expr()?;
                    if self.check("...") {
                        self.advance();
                        let hi = self.parse_assign_expr()?;
                        clause = ParsedNode::new(NodeKind::CaseClause, "range", cl, cc);
                        clause.push(lo);
                        clause.push(hi);
                    } else {
                        clause = ParsedNode::new(NodeKind::CaseClause, "", cl, cc);
                        clause.push(lo);
                    }
                    self.expect(":")?;
                }
                self.collect_clause_body(&mut clause)?;
                node.push(clause);
            } else if self.check("default") {
                self.advance();
                self.expect(":")?;
                let mut clause = ParsedNode::new(NodeKind::DefaultClause, "", cl, cc);
                self.collect_clause_body(&mut clause)?;
                node.push(clause);
            } else if (self.check("start") || self.check("end")) && self.check_at(1, ":") {
                let tok = self.advance();
                self.advance();
                let kind = if tok.text == "start" { NodeKind::StartLabel } else { NodeKind::EndLabel };
                node.push(ParsedNode::new(kind, tok.text, cl, cc));
            } else {
                return Err(self.unexpected("'case', 'default' or '}'"));
            }
        }
        self.expect("}")?;
        Ok(node)
    }

    fn collect_clause_body(&mut self, clause: &mut ParsedNode) -> Result<(), Diagnostic> {
        loop {
            if self.check("}") || self.check("case") || self.check("default") {
                return Ok(());
            }
            if (self.check("start") || self.check("end")) && self.check_at(1, ":") {
                return Ok(());
            }
            if self.at_eof() {
                return Err(self.unexpected("'}'"));
            }
            clause.push(self.parse_statement()?);
        }
    }

    /// `asm { ... }` captures the raw body; `asm(template, cstr, ...)`
    /// pairs constraint strings with optional operand expressions.
    fn parse_asm(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        self.expect("asm")?;
        if self.check("{") {
            self.advance();
            let mut parts = Vec::new();
            let mut depth = 1i32;
            while depth > 0 {
                let tok = self.peek().ok_or_else(|| self.unexpected("'}'"))?;
                match tok.text.as_str() {
                    "{" => depth += 1,
                    "}" => {
                        depth -= 1;
                        if depth == 0 {
                            self.advance();
                            break;
                        }
                    }
                    _ => {}
                }
                parts.push(self.advance().text);
            }
            return Ok(ParsedNode::new(NodeKind::AsmStmt, parts.join(" "), line, column));
        }

        self.expect("(")?;
        let template = self.peek().cloned().ok_or_else(|| self.unexpected("string literal"))?;
        if template.kind != TokenKind::Str {
            return Err(self.unexpected("string literal template"));
        }
        self.advance();
        let mut node = ParsedNode::new(
            NodeKind::AsmStmt,
            lexer::literal_inner(&template.text).to_string(),
            line,
            column,
        );
        while self.check(",") {
            self.advance();
            let (al, ac) = self.here();
            let ctok = self.peek().cloned().ok_or_else(|| self.unexpected("constraint string"))?;
            if ctok.kind != TokenKind::Str {
                return Err(self.unexpected("constraint string"));
            }
            self.advance();
            let mut arg = ParsedNode::new(NodeKind::AsmArg, lexer::literal_inner(&ctok.text).to_string(), al, ac);
            if self.check("(") {
                self.advance();
                arg.push(self.parse_expr()?);
                self.expect(")")?;
            }
            node.push(arg);
        }
        self.expect(")")?;
        self.expect(";")?;
        Ok(node)
    }

    // ======================================================================
    // Expressions
    // ======================================================================

    /// Full expression, comma operator included.
    pub fn parse_expr(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        let first = self.parse_assign_expr()?;
        if !self.check(",") {
            return Ok(first);
        }
        let mut comma = ParsedNode::new(NodeKind::CommaExpr, "", line, column);
        comma.push(first);
        while self.check(",") {
            self.advance();
            comma.push(self.parse_assign_expr()?);
        }
        Ok(comma)
    }

    /// Assignment expression (no comma operator); right-associative.
    pub fn parse_assign_expr(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        let lhs = self.parse_binary_expr(1)?;
        if let Some(tok) = self.peek() {
            if is_assign_op(&tok.text) {
                let op = self.advance().text;
                let rhs = self.parse_assign_expr()?;
                let mut node = ParsedNode::new(NodeKind::AssignExpr, op, line, column);
                node.push(lhs);
                node.push(rhs);
                return Ok(node);
            }
            if tok.text == "?" {
                return Err(Diagnostic::error(
                    "HC2104",
                    &self.file,
                    tok.line,
                    tok.column,
                    "the '?:' ternary operator is not part of HolyC",
                ));
            }
        }
        Ok(lhs)
    }

    fn parse_binary_expr(&mut self, min_bp: u8) -> Result<ParsedNode, Diagnostic> {
        let mut lhs = self.parse_unary_expr()?;
        loop {
            let (op, bp) = match self.peek() {
                Some(tok) => match binary_bp(&tok.text) {
                    Some(bp) if bp >= min_bp => (tok.text.clone(), bp),
                    _ => break,
                },
                None => break,
            };
            let (line, column) = self.here();
            self.advance();
            let rhs = self.parse_binary_expr(bp + 1)?;
            let mut node = ParsedNode::new(NodeKind::BinaryExpr, op, line, column);
            node.push(lhs);
            node.push(rhs);
            lhs = node;
        }
        Ok(lhs)
    }

    fn parse_unary_expr(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        if let Some(tok) = self.peek() {
            match tok.text.as_str() {
                "+" | "-" | "!" | "~" | "&" | "*" | "++" | "--" => {
                    let op = self.advance().text;
                    let operand = self.parse_unary_expr()?;
                    let mut node = ParsedNode::new(NodeKind::UnaryExpr, op, line, column);
                    node.push(operand);
                    return Ok(node);
                }
                "(" => {
                    if let Some(ty) = self.try_cast_type() {
                        let operand = self.parse_unary_expr()?;
                        let mut node = ParsedNode::new(NodeKind::CastExpr, ty, line, column);
                        node.push(operand);
                        return Ok(node);
                    }
                }
                _ => {}
            }
        }
        let primary = self.parse_primary()?;
        self.parse_postfix(primary)
    }

    /// If the parenthesized tokens at the cursor look like a type and the
    /// token after ')' can begin a unary expression, consume them and
    /// return the type string. Pointer markers require a core type
    /// keyword base.
    fn try_cast_type(&mut self) -> Option<String> {
        let close = self.find_matching_paren(self.pos)?;
        let inner = &self.tokens[self.pos + 1..close];
        if inner.is_empty() {
            return None;
        }
        let base = &inner[0];
        let stars = inner[1..].iter().all(|t| t.text == "*");
        if !stars {
            return None;
        }
        let has_stars = inner.len() > 1;
        let base_ok = if has_stars {
            lexer::is_type_keyword(&base.text)
        } else {
            lexer::is_type_keyword(&base.text)
                || (base.kind == TokenKind::Ident && !lexer::is_keyword(&base.text))
        };
        if !base_ok {
            return None;
        }
        let next = self.tokens.get(close + 1)?;
        let begins_unary = match next.kind {
            TokenKind::Ident => !lexer::is_keyword(&next.text) || lexer::is_type_keyword(&next.text),
            TokenKind::Number | TokenKind::Str | TokenKind::Char => true,
            TokenKind::Punct => matches!(next.text.as_str(), "(" | "!" | "~" | "++" | "--" | "$"),
        };
        if !begins_unary {
            return None;
        }
        let mut ty = base.text.clone();
        for _ in 1..inner.len() {
            ty.push('*');
        }
        self.pos = close + 1;
        Some(ty)
    }

    fn find_matching_paren(&self, open: usize) -> Option<usize> {
        let mut depth = 0i32;
        for (i, tok) in self.tokens.iter().enumerate().skip(open) {
            match tok.text.as_str() {
                "(" => depth += 1,
                ")" => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
        None
    }

    fn parse_primary(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        let tok = self.peek().cloned().ok_or_else(|| {
            Diagnostic::error("HC2102", &self.file, line, column, "unexpected end of input in expression")
        })?;
        match tok.kind {
            TokenKind::Number => {
                self.advance();
                Ok(ParsedNode::new(NodeKind::Literal, tok.text, line, column))
            }
            TokenKind::Char => {
                self.advance();
                Ok(ParsedNode::new(NodeKind::Literal, tok.text, line, column))
            }
            TokenKind::Str => {
                self.advance();
                // Adjacent string literals concatenate at parse time.
                let mut inner = lexer::literal_inner(&tok.text).to_string();
                while self.check_kind(TokenKind::Str) {
                    let next = self.advance();
                    inner.push_str(lexer::literal_inner(&next.text));
                }
                Ok(ParsedNode::new(NodeKind::Literal, format!("\"{}\"", inner), line, column))
            }
            TokenKind::Ident if !lexer::is_keyword(&tok.text) || lexer::is_type_keyword(&tok.text) => {
                self.advance();
                Ok(ParsedNode::new(NodeKind::Identifier, tok.text, line, column))
            }
            TokenKind::Punct if tok.text == "$" => {
                self.advance();
                Ok(ParsedNode::new(NodeKind::DollarExpr, "$", line, column))
            }
            TokenKind::Punct if tok.text == "(" => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(")")?;
                Ok(expr)
            }
            _ => Err(Diagnostic::error(
                "HC2101",
                &self.file,
                line,
                column,
                format!("unexpected token in expression: '{}'", tok.text),
            )),
        }
    }

    fn parse_postfix(&mut self, mut base: ParsedNode) -> Result<ParsedNode, Diagnostic> {
        loop {
            let (line, column) = self.here();
            let tok = match self.peek() {
                Some(t) => t.clone(),
                None => return Ok(base),
            };
            match tok.text.as_str() {
                "(" => {
                    self.advance();
                    let args = self.parse_call_args()?;
                    self.expect(")")?;
                    let mut call = ParsedNode::new(NodeKind::CallExpr, "", line, column);
                    call.push(base);
                    call.push(args);
                    base = call;
                }
                "[" => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect("]")?;
                    let mut node = ParsedNode::new(NodeKind::IndexExpr, "", line, column);
                    node.push(base);
                    node.push(index);
                    base = node;
                }
                "." | "->" => {
                    let arrow = tok.text == "->";
                    self.advance();
                    let member = self.expect_ident()?;
                    // An arrow access reads through the pointer first.
                    let receiver = if arrow {
                        let mut deref = ParsedNode::new(NodeKind::UnaryExpr, "*", line, column);
                        deref.push(base);
                        deref
                    } else {
                        base
                    };
                    let lowered = member.text.to_ascii_lowercase();
                    if lexer::LANE_SELECTORS.contains(&lowered.as_str()) && self.check("[") {
                        self.advance();
                        let index = self.parse_expr()?;
                        self.expect("]")?;
                        let mut lane = ParsedNode::new(NodeKind::LaneExpr, lowered, line, column);
                        lane.push(receiver);
                        lane.push(index);
                        base = lane;
                    } else {
                        let mut node = ParsedNode::new(NodeKind::MemberExpr, member.text, line, column);
                        node.push(receiver);
                        base = node;
                    }
                }
                "++" | "--" => {
                    self.advance();
                    let mut node = ParsedNode::new(NodeKind::PostfixExpr, tok.text, line, column);
                    node.push(base);
                    base = node;
                }
                _ => return Ok(base),
            }
        }
    }

    /// Call arguments at assignment precedence; empty positions become
    /// EmptyArg sentinels so defaulted parameters can be filled later.
    fn parse_call_args(&mut self) -> Result<ParsedNode, Diagnostic> {
        let (line, column) = self.here();
        let mut args = ParsedNode::new(NodeKind::CallArgs, "", line, column);
        if self.check(")") {
            return Ok(args);
        }
        let mut expect_arg = true;
        loop {
            if self.check(")") {
                if expect_arg && !args.children.is_empty() {
                    let (l, c) = self.here();
                    args.push(ParsedNode::new(NodeKind::EmptyArg, "", l, c));
                }
                break;
            }
            if self.check(",") {
                if expect_arg {
                    let (l, c) = self.here();
                    args.push(ParsedNode::new(NodeKind::EmptyArg, "", l, c));
                }
                self.advance();
                expect_arg = true;
                continue;
            }
            args.push(self.parse_assign_expr()?);
            expect_arg = false;
        }
        Ok(args)
    }
}

fn is_assign_op(op: &str) -> bool {
    matches!(op, "=" | "+=" | "-=" | "*=" | "/=" | "%=" | "&=" | "|=" | "^=" | "<<=" | ">>=")
}

fn binary_bp(op: &str) -> Option<u8> {
    Some(match op {
        "||" => 1,
        "&&" => 2,
        "|" => 3,
        "^" => 4,
        "&" => 5,
        "==" | "!=" => 6,
        "<" | ">" | "<=" | ">=" => 7,
        "<<" | ">>" => 8,
        "+" | "-" => 9,
        "*" | "/" | "%" => 10,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> ParsedNode {
        Parser::parse_source(src, "t.HC").unwrap()
    }

    fn parse_err(src: &str) -> Diagnostic {
        Parser::parse_source(src, "t.HC").unwrap_err()
    }

    fn first(src: &str) -> ParsedNode {
        parse(src).children.into_iter().next().unwrap()
    }

    #[test]
    fn test_function_decl() {
        let f = first("I64 Main() { return 0; }");
        assert_eq!(f.kind, NodeKind::FunctionDecl);
        assert_eq!(f.text, "Main");
        assert_eq!(f.child_of(NodeKind::DeclType).unwrap().text, "I64");
        assert!(f.child_of(NodeKind::Block).is_some());
    }

    #[test]
    fn test_function_prototype() {
        let f = first("U0 Foo(I64 a);");
        assert_eq!(f.kind, NodeKind::FunctionDecl);
        assert!(f.child_of(NodeKind::Block).is_none());
    }

    #[test]
    fn test_param_default_reparsed() {
        let f = first("U0 Show(U8 *name, U8 *ty=lastclass);");
        let params = f.child_of(NodeKind::ParamList).unwrap();
        assert_eq!(params.children.len(), 2);
        let second = &params.children[1];
        let default = second.child_of(NodeKind::Default).unwrap();
        assert_eq!(default.children[0].kind, NodeKind::Identifier);
        assert_eq!(default.children[0].text, "lastclass");
    }

    #[test]
    fn test_var_decl_list_inherits_type() {
        let list = first("I64 a = 1, b, c = 3;");
        assert_eq!(list.kind, NodeKind::VarDeclList);
        assert_eq!(list.children.len(), 3);
        for decl in &list.children {
            assert_eq!(decl.child_of(NodeKind::DeclType).unwrap().text, "I64");
        }
        assert_eq!(list.children[1].text, "b");
    }

    #[test]
    fn test_pointer_declarator() {
        let v = first("U8 *p;");
        assert_eq!(v.kind, NodeKind::VarDecl);
        assert_eq!(v.child_of(NodeKind::DeclType).unwrap().text, "U8*");
    }

    #[test]
    fn test_class_with_trailing_declarator() {
        let c = first("class CPoint { I64 x; I64 y; } origin;");
        assert_eq!(c.kind, NodeKind::ClassDecl);
        assert_eq!(c.text, "CPoint");
        assert_eq!(c.children_kinds(NodeKind::FieldDecl), 2);
        let trailing = c.children.iter().find(|n| n.kind == NodeKind::VarDecl).unwrap();
        assert_eq!(trailing.text, "origin");
        assert_eq!(trailing.child_of(NodeKind::DeclType).unwrap().text, "CPoint");
    }

    #[test]
    fn test_anonymous_class_synthesizes_name() {
        let c = first("class { I64 v; } thing;");
        assert!(c.text.starts_with("__holyc_anon_aggregate_"));
    }

    #[test]
    fn test_union_marked() {
        let c = first("union UPack { I64 i; F64 f; };");
        assert!(c.children.iter().any(|n| n.kind == NodeKind::DeclSpec && n.text == "union"));
    }

    #[test]
    fn test_field_meta_tokens() {
        let c = first("class CDoc { I64 flags fmt \"%x\"; };");
        let field = c.child_of(NodeKind::FieldDecl).unwrap();
        let meta = field.child_of(NodeKind::FieldMetaTokens).unwrap();
        assert!(meta.text.contains("fmt"));
    }

    #[test]
    fn test_lane_expr() {
        let p = parse("I64 F() { return v.u8[1]; }");
        let ret = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        let lane = &ret.children[0];
        assert_eq!(lane.kind, NodeKind::LaneExpr);
        assert_eq!(lane.text, "u8");
        assert_eq!(lane.children[0].kind, NodeKind::Identifier);
    }

    #[test]
    fn test_lane_selector_case_insensitive() {
        let p = parse("I64 F() { return v.U8[0]; }");
        let ret = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(ret.children[0].text, "u8");
    }

    #[test]
    fn test_member_not_lane_without_bracket() {
        let p = parse("I64 F() { return s.u8; }");
        let ret = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(ret.children[0].kind, NodeKind::MemberExpr);
    }

    #[test]
    fn test_arrow_wraps_deref() {
        let p = parse("I64 F() { return p->x; }");
        let ret = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        let member = &ret.children[0];
        assert_eq!(member.kind, NodeKind::MemberExpr);
        assert_eq!(member.children[0].kind, NodeKind::UnaryExpr);
        assert_eq!(member.children[0].text, "*");
    }

    #[test]
    fn test_call_empty_arg_sentinels() {
        let p = parse("I64 F() { G(1,,3); }");
        let stmt = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        let call = &stmt.children[0];
        let args = &call.children[1];
        assert_eq!(args.children.len(), 3);
        assert_eq!(args.children[1].kind, NodeKind::EmptyArg);
    }

    #[test]
    fn test_trailing_empty_arg() {
        let p = parse("I64 F() { G(1,); }");
        let args = &p.children[0].child_of(NodeKind::Block).unwrap().children[0].children[0].children[1];
        assert_eq!(args.children.len(), 2);
        assert_eq!(args.children[1].kind, NodeKind::EmptyArg);
    }

    #[test]
    fn test_precedence() {
        // 2 + 3 * 4 parses as 2 + (3 * 4)
        let p = parse("I64 F() { return 2 + 3 * 4; }");
        let ret = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        let add = &ret.children[0];
        assert_eq!(add.text, "+");
        assert_eq!(add.children[1].text, "*");
    }

    #[test]
    fn test_assignment_right_assoc() {
        let p = parse("I64 F() { a = b = 1; }");
        let stmt = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        let outer = &stmt.children[0];
        assert_eq!(outer.kind, NodeKind::AssignExpr);
        assert_eq!(outer.children[1].kind, NodeKind::AssignExpr);
    }

    #[test]
    fn test_cast_expr() {
        let p = parse("I64 F() { return (U8)x; }");
        let ret = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(ret.children[0].kind, NodeKind::CastExpr);
        assert_eq!(ret.children[0].text, "U8");
    }

    #[test]
    fn test_pointer_cast_requires_core_type() {
        // (Foo*) is not treated as a cast, so this is a parse error on '*'.
        assert!(Parser::parse_source("I64 F() { return (Foo*)x; }", "t.HC").is_err());
        // (U8*) is.
        let p = parse("I64 F() { return (U8*)x; }");
        let ret = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(ret.children[0].text, "U8*");
    }

    #[test]
    fn test_paren_not_cast_before_operator() {
        let p = parse("I64 F() { return (a) + b; }");
        let ret = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(ret.children[0].kind, NodeKind::BinaryExpr);
    }

    #[test]
    fn test_switch_case_kinds() {
        let p = parse("I64 F(I64 x) { switch(x) { case 0: break; case: break; case 2...5: break; default: break; } }");
        let sw = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(sw.kind, NodeKind::SwitchStmt);
        let clauses: Vec<_> = sw.children[1..].iter().collect();
        assert_eq!(clauses[0].text, "");
        assert_eq!(clauses[1].text, "null");
        assert_eq!(clauses[2].text, "range");
        assert_eq!(clauses[2].children.len(), 3); // lo, hi, break
        assert_eq!(clauses[3].kind, NodeKind::DefaultClause);
    }

    #[test]
    fn test_switch_start_end_markers() {
        let p = parse("I64 F(I64 x) { switch(x) { start: case 0: break; end: } }");
        let sw = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert!(sw.children.iter().any(|c| c.kind == NodeKind::StartLabel));
        assert!(sw.children.iter().any(|c| c.kind == NodeKind::EndLabel));
    }

    #[test]
    fn test_print_statement() {
        let p = parse("U0 F() { \"%d %s\\n\", 42, \"hi\"; }");
        let print = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(print.kind, NodeKind::PrintStmt);
        assert_eq!(print.children.len(), 3);
        assert_eq!(print.children[0].kind, NodeKind::Literal);
    }

    #[test]
    fn test_adjacent_string_concat() {
        let p = parse("U0 F() { \"ab\" \"cd\"; }");
        let print = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(print.children[0].text, "\"abcd\"");
    }

    #[test]
    fn test_no_paren_call() {
        let p = parse("U0 F() { PressAKey; }");
        let stmt = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(stmt.kind, NodeKind::NoParenCallStmt);
        assert_eq!(stmt.text, "PressAKey");
    }

    #[test]
    fn test_labels_and_goto() {
        let p = parse("U0 F() { again: goto again; }");
        let block = p.children[0].child_of(NodeKind::Block).unwrap();
        assert_eq!(block.children[0].kind, NodeKind::LabelStmt);
        assert_eq!(block.children[1].kind, NodeKind::GotoStmt);
        assert_eq!(block.children[1].text, "again");
    }

    #[test]
    fn test_start_end_markers_top_level() {
        let p = parse("start: I64 x; end:");
        assert_eq!(p.children[0].kind, NodeKind::StartLabel);
        assert_eq!(p.children[2].kind, NodeKind::EndLabel);
    }

    #[test]
    fn test_try_throw() {
        let p = parse("I64 F() { try { throw(7); } catch { return 1; } }");
        let t = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(t.kind, NodeKind::TryStmt);
        assert_eq!(t.children.len(), 2);
        assert_eq!(t.children[0].children[0].kind, NodeKind::ThrowStmt);
    }

    #[test]
    fn test_asm_brace_form() {
        let p = parse("U0 F() { asm { MOV RAX , 1 } }");
        let a = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(a.kind, NodeKind::AsmStmt);
        assert!(a.text.contains("MOV"));
    }

    #[test]
    fn test_asm_constraint_form() {
        let p = parse("U0 F() { asm(\"nop\", \"r\"(x), \"~{memory}\"); }");
        let a = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(a.text, "nop");
        assert_eq!(a.children.len(), 2);
        assert_eq!(a.children[0].children.len(), 1);
        assert_eq!(a.children[1].children.len(), 0);
    }

    #[test]
    fn test_continue_rejected() {
        let err = parse_err("U0 F() { while (1) { continue; } }");
        assert_eq!(err.code, "HC2103");
    }

    #[test]
    fn test_ternary_rejected() {
        let err = parse_err("I64 F() { return a ? 1 : 2; }");
        assert_eq!(err.code, "HC2104");
    }

    #[test]
    fn test_linkage_decl() {
        let d = first("extern I64 counter;");
        assert_eq!(d.kind, NodeKind::LinkageDecl);
        assert_eq!(d.text, "counter");
    }

    #[test]
    fn test_extern_with_init_is_definition() {
        let d = first("extern I64 counter = 3;");
        assert_eq!(d.kind, NodeKind::VarDecl);
    }

    #[test]
    fn test_for_loop_shape() {
        let p = parse("I64 F() { for (i = 0; i < 3; i++) x += i; }");
        let f = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(f.kind, NodeKind::ForStmt);
        assert_eq!(f.children.len(), 4);
    }

    #[test]
    fn test_for_loop_empty_slots() {
        let p = parse("I64 F() { for (;;) break; }");
        let f = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(f.children[0].kind, NodeKind::EmptyStmt);
        assert_eq!(f.children[1].kind, NodeKind::EmptyArg);
        assert_eq!(f.children[2].kind, NodeKind::EmptyStmt);
    }

    #[test]
    fn test_comma_expr() {
        let p = parse("I64 F() { return (a, b, c); }");
        let ret = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(ret.children[0].kind, NodeKind::CommaExpr);
        assert_eq!(ret.children[0].children.len(), 3);
    }

    #[test]
    fn test_dollar_expr() {
        let p = parse("I64 F() { return $; }");
        let ret = &p.children[0].child_of(NodeKind::Block).unwrap().children[0];
        assert_eq!(ret.children[0].kind, NodeKind::DollarExpr);
    }

    impl ParsedNode {
        fn children_kinds(&self, kind: NodeKind) -> usize {
            self.children.iter().filter(|c| c.kind == kind).count()
        }
    }
}
