//! Compile error taxonomy and rendering.
//!
//! Every error the compiler can report is a variant of `ErrorKind`; the
//! display strings are the user-visible message texts. A `CompileError`
//! pairs a kind with the file and position it was raised at, and renders as
//!
//! ```text
//! file.q:10:5: Unknown function 'prin', did you mean 'print'?
//!     prin("hi")
//!     ^
//! ```

use thiserror::Error;

use super::source::{Position, SourceFile};

/// All error conditions with their user-visible messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    // Lexical
    #[error("Unknown character '{0}'")]
    UnknownCharacter(char),
    #[error("Text literal is never terminated")]
    UnterminatedText,

    // Syntactic
    #[error("Missing opening bracket")]
    MissingOpeningBracket,
    #[error("Missing closing bracket")]
    MissingClosingBracket,
    #[error("Missing character '{0}'")]
    MissingCharacter(char),
    #[error("Missing function name")]
    MissingFunctionName,
    #[error("Missing range")]
    MissingRange,
    #[error("Missing start of range")]
    MissingRangeStart,
    #[error("Missing upper limit of range")]
    MissingRangeLimit,
    #[error("Unknown expression")]
    UnknownExpression,

    // Semantic
    #[error("Unknown function '{name}'{}", suggestion_text(.suggestion))]
    UnknownFunction {
        name: String,
        suggestion: Option<String>,
    },
    #[error("Unknown identifier '{name}'{}", suggestion_text(.suggestion))]
    UnknownIdentifier {
        name: String,
        suggestion: Option<String>,
    },
    #[error("Function '{name}' expects {required} parameters, got {given}")]
    ParameterCount {
        name: String,
        given: usize,
        required: usize,
    },
    #[error("Parameter '{parameter}' expects type '{expected}', got '{got}'")]
    InvalidType {
        got: String,
        expected: String,
        parameter: String,
    },
    #[error("Variable '{0}' has never been used")]
    VariableUnused(String),
    #[error("Function 'main' has not been defined")]
    MainMissing,

    // Resource
    #[error("Exceeded maximum number of variables")]
    ExceededMaxVariables,
}

fn suggestion_text(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(s) => format!(", did you mean '{}'?", s),
        None => String::new(),
    }
}

/// An `ErrorKind` raised at a position, before the file name is known.
///
/// The lexer and expression parser operate on token slices and only know
/// positions; the per-function compiler attaches the file name on the way
/// out.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{position}: {kind}")]
pub struct PositionedError {
    pub kind: ErrorKind,
    pub position: Position,
}

impl PositionedError {
    pub fn new(kind: ErrorKind, position: Position) -> Self {
        Self { kind, position }
    }

    pub fn in_file(self, file: impl Into<String>) -> CompileError {
        CompileError::new(self.kind, file, self.position)
    }
}

/// An `ErrorKind` located in a source file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{file}:{position}: {kind}")]
pub struct CompileError {
    pub kind: ErrorKind,
    pub file: String,
    pub position: Position,
}

impl CompileError {
    pub fn new(kind: ErrorKind, file: impl Into<String>, position: Position) -> Self {
        Self { kind, file: file.into(), position }
    }

    /// Render the error with the offending source line and a caret under
    /// the reported column.
    pub fn render(&self, source: &SourceFile) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "{}", self);

        if let Some(line) = source.line(self.position.line) {
            if !line.trim().is_empty() {
                let _ = writeln!(out, "    {}", line);
                let col = self.position.column.saturating_sub(1) as usize;
                let _ = writeln!(out, "    {}^", " ".repeat(col));
            }
        }

        out
    }
}

/// Everything that can stop a build: a located compile error, or an I/O
/// failure around the project directory and output file.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("{0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_texts() {
        let err = ErrorKind::UnknownFunction {
            name: "prin".into(),
            suggestion: Some("print".into()),
        };
        assert_eq!(err.to_string(), "Unknown function 'prin', did you mean 'print'?");

        let err = ErrorKind::UnknownFunction { name: "frobnicate".into(), suggestion: None };
        assert_eq!(err.to_string(), "Unknown function 'frobnicate'");

        assert_eq!(
            ErrorKind::VariableUnused("a".into()).to_string(),
            "Variable 'a' has never been used"
        );
        assert_eq!(
            ErrorKind::MainMissing.to_string(),
            "Function 'main' has not been defined"
        );
    }

    #[test]
    fn located_error_format() {
        let err = CompileError::new(
            ErrorKind::MissingClosingBracket,
            "main.q",
            Position::new(3, 12),
        );
        assert_eq!(err.to_string(), "main.q:3:12: Missing closing bracket");
    }

    #[test]
    fn snippet_with_caret() {
        let source = SourceFile::new("main.q".into(), "fn main() {\n\tprin(\"hi\")\n}\n".into());
        let err = CompileError::new(
            ErrorKind::UnknownFunction { name: "prin".into(), suggestion: Some("print".into()) },
            "main.q",
            Position::new(2, 2),
        );
        let rendered = err.render(&source);
        assert!(rendered.contains("main.q:2:2: Unknown function 'prin', did you mean 'print'?"));
        assert!(rendered.contains("prin(\"hi\")"));
        assert!(rendered.contains("^"));
    }
}
