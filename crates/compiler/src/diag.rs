//! Diagnostic records shared by every pipeline phase.
//!
//! Each phase reports its first fatal problem as a `Diagnostic` carrying a
//! stable `HCnnnn` code, a source position, and an optional remediation
//! hint. The driver renders diagnostics with [`Diagnostic::render`] and the
//! `Display` impl; nothing downstream of a failed phase runs.

use std::fmt;

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Note => "note",
        }
    }
}

/// A single diagnostic produced by a pipeline phase.
///
/// Codes are stable and unique: `HC10xx` preprocessor, `HC20xx` lexer,
/// `HC21xx` parser, `HC30xx` semantic analysis, `HC40xx` lowering.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub code: &'static str,
    pub severity: Severity,
    pub file: String,
    /// 1-indexed line; 0 when no position applies.
    pub line: usize,
    /// 1-indexed column; 0 when no position applies.
    pub column: usize,
    pub message: String,
    pub help: Option<String>,
}

impl Diagnostic {
    pub fn error(code: &'static str, file: impl Into<String>, line: usize, column: usize, message: impl Into<String>) -> Self {
        Diagnostic {
            code,
            severity: Severity::Error,
            file: file.into(),
            line,
            column,
            message: message.into(),
            help: None,
        }
    }

    /// Attach a remediation hint rendered on a trailing `help:` line.
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Render in the canonical form:
    /// `<severity>[<code>]: <file>:<line>:<col>: <msg>` plus an optional
    /// `help:` line.
    pub fn render(&self) -> String {
        let mut out = format!(
            "{}[{}]: {}:{}:{}: {}",
            self.severity.as_str(),
            self.code,
            self.file,
            self.line,
            self.column,
            self.message
        );
        if let Some(help) = &self.help {
            out.push_str("\nhelp: ");
            out.push_str(help);
        }
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl std::error::Error for Diagnostic {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_basic() {
        let d = Diagnostic::error("HC1023", "a.HC", 3, 7, "include cycle detected");
        assert_eq!(d.render(), "error[HC1023]: a.HC:3:7: include cycle detected");
    }

    #[test]
    fn test_render_with_help() {
        let d = Diagnostic::error("HC1023", "a.HC", 1, 1, "include cycle detected")
            .with_help("cycle: a.HC -> b.HC -> a.HC");
        assert!(d.render().ends_with("help: cycle: a.HC -> b.HC -> a.HC"));
    }
}
