//! Error diagnostics for user-facing error messages
//!
//! Everything that can go wrong between a live coder's keystrokes and the
//! output sink flows through one diagnostic type: parse failures, evaluation
//! failures, type mismatches, blown query budgets and sink rejections. The
//! policy is uniform: report, recover, keep playing.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagnosticKind {
    /// Malformed mini-notation; the pattern falls back to silence.
    Parse,
    /// Host expression failure; the previous pattern keeps playing.
    Eval,
    /// Combinator applied to an incompatible value; the hap is dropped.
    Type,
    /// A query blew its tick budget; the window is skipped.
    Timing,
    /// The output sink rejected an event; non-fatal.
    Sink,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiagnosticKind::Parse => "parse error",
            DiagnosticKind::Eval => "eval error",
            DiagnosticKind::Type => "type error",
            DiagnosticKind::Timing => "timing error",
            DiagnosticKind::Sink => "sink error",
        };
        write!(f, "{}", name)
    }
}

/// Diagnostic with an optional source span (byte offsets) and hint
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    pub span: Option<(usize, usize)>,
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            span: None,
            hint: None,
        }
    }

    pub fn parse(message: impl Into<String>, span: (usize, usize)) -> Self {
        Self::new(DiagnosticKind::Parse, message).with_span(span)
    }

    pub fn eval(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Eval, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(DiagnosticKind::Type, message)
    }

    pub fn with_span(mut self, span: (usize, usize)) -> Self {
        self.span = Some(span);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Render the diagnostic against its source with a caret line, for
    /// terminal display.
    pub fn render(&self, source: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!("{}: {}\n", self.kind, self.message));
        if let Some((begin, end)) = self.span {
            let begin = begin.min(source.len());
            let width = end.saturating_sub(begin).max(1);
            out.push_str(&format!("  {}\n", source));
            out.push_str(&format!("  {}{}\n", " ".repeat(begin), "^".repeat(width)));
        }
        if let Some(hint) = &self.hint {
            out.push_str(&format!("hint: {}\n", hint));
        }
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some((begin, end)) = self.span {
            write!(f, " (at {}..{})", begin, end)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nhint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostic {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_points_at_span() {
        let diag = Diagnostic::parse("unexpected ']'", (3, 4));
        let rendered = diag.render("bd ] sd");
        assert!(rendered.contains("parse error: unexpected ']'"));
        let caret_line = rendered.lines().nth(2).unwrap();
        assert_eq!(caret_line.find('^'), Some(2 + 3));
    }

    #[test]
    fn test_display_includes_hint() {
        let diag = Diagnostic::eval("unknown name 'fsat'").with_hint("did you mean 'fast'?");
        let text = diag.to_string();
        assert!(text.contains("eval error"));
        assert!(text.contains("did you mean"));
    }
}
