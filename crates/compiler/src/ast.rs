//! Untyped and typed syntax trees.
//!
//! Both trees share one uniform shape: a node kind, the raw text payload
//! (operator, name, or quoted literal), ordered children, and the source
//! position. The typed tree adds the computed HolyC type string. The
//! `ast-dump` command renders the typed tree one node per line.

/// Every node kind the parser can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Program,
    FunctionDecl,
    VarDecl,
    VarDeclList,
    Block,
    IfStmt,
    WhileStmt,
    DoWhileStmt,
    ForStmt,
    SwitchStmt,
    CaseClause,
    DefaultClause,
    StartLabel,
    EndLabel,
    LabelStmt,
    GotoStmt,
    ReturnStmt,
    BreakStmt,
    TryStmt,
    ThrowStmt,
    LockStmt,
    AsmStmt,
    ClassDecl,
    FieldDecl,
    FieldMetaTokens,
    TypeAliasDecl,
    LinkageDecl,
    ExprStmt,
    PrintStmt,
    NoParenCallStmt,
    EmptyStmt,
    Identifier,
    Literal,
    DollarExpr,
    UnaryExpr,
    BinaryExpr,
    AssignExpr,
    CastExpr,
    PostfixExpr,
    LaneExpr,
    MemberExpr,
    IndexExpr,
    CallExpr,
    CallArgs,
    EmptyArg,
    CommaExpr,
    Param,
    ParamList,
    Default,
    DeclType,
    DeclName,
    DeclSpec,
    AsmArg,
}

impl NodeKind {
    pub fn name(self) -> &'static str {
        match self {
            NodeKind::Program => "Program",
            NodeKind::FunctionDecl => "FunctionDecl",
            NodeKind::VarDecl => "VarDecl",
            NodeKind::VarDeclList => "VarDeclList",
            NodeKind::Block => "Block",
            NodeKind::IfStmt => "IfStmt",
            NodeKind::WhileStmt => "WhileStmt",
            NodeKind::DoWhileStmt => "DoWhileStmt",
            NodeKind::ForStmt => "ForStmt",
            NodeKind::SwitchStmt => "SwitchStmt",
            NodeKind::CaseClause => "CaseClause",
            NodeKind::DefaultClause => "DefaultClause",
            NodeKind::StartLabel => "StartLabel",
            NodeKind::EndLabel => "EndLabel",
            NodeKind::LabelStmt => "LabelStmt",
            NodeKind::GotoStmt => "GotoStmt",
            NodeKind::ReturnStmt => "ReturnStmt",
            NodeKind::BreakStmt => "BreakStmt",
            NodeKind::TryStmt => "TryStmt",
            NodeKind::ThrowStmt => "ThrowStmt",
            NodeKind::LockStmt => "LockStmt",
            NodeKind::AsmStmt => "AsmStmt",
            NodeKind::ClassDecl => "ClassDecl",
            NodeKind::FieldDecl => "FieldDecl",
            NodeKind::FieldMetaTokens => "FieldMetaTokens",
            NodeKind::TypeAliasDecl => "TypeAliasDecl",
            NodeKind::LinkageDecl => "LinkageDecl",
            NodeKind::ExprStmt => "ExprStmt",
            NodeKind::PrintStmt => "PrintStmt",
            NodeKind::NoParenCallStmt => "NoParenCallStmt",
            NodeKind::EmptyStmt => "EmptyStmt",
            NodeKind::Identifier => "Identifier",
            NodeKind::Literal => "Literal",
            NodeKind::DollarExpr => "DollarExpr",
            NodeKind::UnaryExpr => "UnaryExpr",
            NodeKind::BinaryExpr => "BinaryExpr",
            NodeKind::AssignExpr => "AssignExpr",
            NodeKind::CastExpr => "CastExpr",
            NodeKind::PostfixExpr => "PostfixExpr",
            NodeKind::LaneExpr => "LaneExpr",
            NodeKind::MemberExpr => "MemberExpr",
            NodeKind::IndexExpr => "IndexExpr",
            NodeKind::CallExpr => "CallExpr",
            NodeKind::CallArgs => "CallArgs",
            NodeKind::EmptyArg => "EmptyArg",
            NodeKind::CommaExpr => "CommaExpr",
            NodeKind::Param => "Param",
            NodeKind::ParamList => "ParamList",
            NodeKind::Default => "Default",
            NodeKind::DeclType => "DeclType",
            NodeKind::DeclName => "DeclName",
            NodeKind::DeclSpec => "DeclSpec",
            NodeKind::AsmArg => "AsmArg",
        }
    }
}

/// Untyped AST node, built by the parser and discarded once semantic
/// analysis has produced the typed tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedNode {
    pub kind: NodeKind,
    pub text: String,
    pub children: Vec<ParsedNode>,
    pub line: usize,
    pub column: usize,
}

impl ParsedNode {
    pub fn new(kind: NodeKind, text: impl Into<String>, line: usize, column: usize) -> Self {
        ParsedNode { kind, text: text.into(), children: Vec::new(), line, column }
    }

    pub fn with_children(mut self, children: Vec<ParsedNode>) -> Self {
        self.children = children;
        self
    }

    pub fn push(&mut self, child: ParsedNode) {
        self.children.push(child);
    }

    /// First child of the given kind, if any.
    pub fn child_of(&self, kind: NodeKind) -> Option<&ParsedNode> {
        self.children.iter().find(|c| c.kind == kind)
    }
}

/// Typed AST node: the parsed shape plus the computed HolyC type string
/// (empty on statements).
#[derive(Debug, Clone, PartialEq)]
pub struct TypedNode {
    pub kind: NodeKind,
    pub text: String,
    pub children: Vec<TypedNode>,
    pub line: usize,
    pub column: usize,
    pub ty: String,
}

impl TypedNode {
    pub fn new(kind: NodeKind, text: impl Into<String>, line: usize, column: usize, ty: impl Into<String>) -> Self {
        TypedNode { kind, text: text.into(), children: Vec::new(), line, column, ty: ty.into() }
    }

    pub fn from_parsed(node: &ParsedNode, ty: impl Into<String>) -> Self {
        TypedNode {
            kind: node.kind,
            text: node.text.clone(),
            children: Vec::new(),
            line: node.line,
            column: node.column,
            ty: ty.into(),
        }
    }

    pub fn child_of(&self, kind: NodeKind) -> Option<&TypedNode> {
        self.children.iter().find(|c| c.kind == kind)
    }

    pub fn children_of(&self, kind: NodeKind) -> impl Iterator<Item = &TypedNode> {
        self.children.iter().filter(move |c| c.kind == kind)
    }
}

/// Render the typed tree in the `ast-dump` format: two spaces per depth,
/// `NodeKind: <text> [type=<t>]` with the type suffix only when present.
pub fn dump_typed(node: &TypedNode) -> String {
    let mut out = String::new();
    dump_typed_into(node, 0, &mut out);
    out
}

fn dump_typed_into(node: &TypedNode, depth: usize, out: &mut String) {
    for _ in 0..depth {
        out.push_str("  ");
    }
    out.push_str(node.kind.name());
    out.push_str(": ");
    out.push_str(&node.text);
    if !node.ty.is_empty() {
        out.push_str(" [type=");
        out.push_str(&node.ty);
        out.push(']');
    }
    out.push('\n');
    for child in &node.children {
        dump_typed_into(child, depth + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_format() {
        let mut root = TypedNode::new(NodeKind::Program, "", 1, 1, "");
        let mut stmt = TypedNode::new(NodeKind::ExprStmt, "", 1, 1, "");
        stmt.children.push(TypedNode::new(NodeKind::Literal, "42", 1, 1, "I64"));
        root.children.push(stmt);
        let dump = dump_typed(&root);
        assert_eq!(dump, "Program: \n  ExprStmt: \n    Literal: 42 [type=I64]\n");
    }

    #[test]
    fn test_child_lookup() {
        let mut n = ParsedNode::new(NodeKind::VarDecl, "x", 1, 1);
        n.push(ParsedNode::new(NodeKind::DeclType, "I64", 1, 1));
        assert_eq!(n.child_of(NodeKind::DeclType).unwrap().text, "I64");
        assert!(n.child_of(NodeKind::Default).is_none());
    }
}
