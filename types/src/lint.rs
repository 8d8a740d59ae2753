//! Lint message payloads and the text-edit shape used by formatting.
//!
//! Handlers report one-based lines and columns; the IDE façade converts to
//! zero-based LSP positions at the boundary.

use serde::{Deserialize, Serialize};

/// Severity of a lint message. Values mirror LSP: 1=Error, 2=Warning,
/// 3=Info, 4=Hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LintMessageSeverity {
    Error = 1,
    Warning = 2,
    Info = 3,
    Hint = 4,
}

impl LintMessageSeverity {
    /// Numeric LSP severity value.
    #[must_use]
    pub fn to_lsp(self) -> u8 {
        self as u8
    }

    /// Convert from LSP numeric severity.
    ///
    /// Returns `None` outside the LSP-defined range; callers decide the
    /// fallback policy.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Info),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Hint => "hint",
        }
    }
}

/// A position in a document. `line` and `column` are one-based as reported
/// by handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// A span between two positions, end-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[must_use]
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

/// A single message produced by a lint handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintMessage {
    pub range: Range,
    pub message: String,
    /// Rule identifier, e.g. "W291".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub severity: LintMessageSeverity,
    /// Name of the tool that produced the message.
    pub source: String,
}

impl LintMessage {
    /// Format as `line:col: severity: [source] message` for CLI output.
    #[must_use]
    pub fn display_line(&self) -> String {
        let code = self
            .code
            .as_deref()
            .map(|c| format!("{c} "))
            .unwrap_or_default();
        format!(
            "{}:{}: {}: [{}] {}{}",
            self.range.start.line,
            self.range.start.column,
            self.severity.label(),
            self.source,
            code,
            self.message,
        )
    }
}

/// A replacement of a document span, LSP-shaped with zero-based positions.
///
/// Formatting results become a single whole-document edit whose end position
/// is `(line_count, len(last_line))` regardless of trailing newline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEdit {
    pub range: Range,
    pub new_text: String,
}

impl TextEdit {
    /// Build a whole-document edit replacing `old_text` with `new_text`.
    #[must_use]
    pub fn whole_document(old_text: &str, new_text: String) -> Self {
        let line_count = old_text.lines().count() as u32;
        let last_line_len = old_text.lines().last().map_or(0, |l| l.chars().count()) as u32;
        Self {
            range: Range::new(
                Position::new(0, 0),
                Position::new(line_count, last_line_len),
            ),
            new_text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_lsp_roundtrip() {
        for value in 1..=4 {
            let severity = LintMessageSeverity::from_lsp(value).unwrap();
            assert_eq!(u64::from(severity.to_lsp()), value);
        }
        assert_eq!(LintMessageSeverity::from_lsp(0), None);
        assert_eq!(LintMessageSeverity::from_lsp(5), None);
    }

    #[test]
    fn display_line_with_code() {
        let msg = LintMessage {
            range: Range::new(Position::new(3, 7), Position::new(3, 12)),
            message: "trailing whitespace".to_string(),
            code: Some("W291".to_string()),
            severity: LintMessageSeverity::Warning,
            source: "burnish".to_string(),
        };
        assert_eq!(
            msg.display_line(),
            "3:7: warning: [burnish] W291 trailing whitespace"
        );
    }

    #[test]
    fn display_line_without_code() {
        let msg = LintMessage {
            range: Range::new(Position::new(1, 1), Position::new(1, 1)),
            message: "bad".to_string(),
            code: None,
            severity: LintMessageSeverity::Error,
            source: "x".to_string(),
        };
        assert_eq!(msg.display_line(), "1:1: error: [x] bad");
    }

    #[test]
    fn whole_document_edit_spans_all_lines() {
        let edit = TextEdit::whole_document("ab\ncdef\n", "x\n".to_string());
        assert_eq!(edit.range.start, Position::new(0, 0));
        assert_eq!(edit.range.end, Position::new(2, 4));
    }

    #[test]
    fn whole_document_edit_without_trailing_newline() {
        // End position equals (line_count, len(last_line)) either way.
        let edit = TextEdit::whole_document("ab\ncdef", "x".to_string());
        assert_eq!(edit.range.end, Position::new(2, 4));
    }

    #[test]
    fn whole_document_edit_empty_document() {
        let edit = TextEdit::whole_document("", "x".to_string());
        assert_eq!(edit.range.start, Position::new(0, 0));
        assert_eq!(edit.range.end, Position::new(0, 0));
    }
}
