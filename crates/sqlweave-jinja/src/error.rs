//! Template errors and source positions

use sqlweave_core::{Diagnostic, DiagnosticCode, Location, Severity};
use std::fmt;
use std::sync::Arc;

/// A point in a source file (1-indexed row and column)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Position {
    pub file: Arc<str>,
    pub row: usize,
    pub column: usize,
}

impl Position {
    pub fn new(file: impl Into<Arc<str>>, row: usize, column: usize) -> Self {
        Self {
            file: file.into(),
            row,
            column,
        }
    }

    /// Position used for values produced outside any source file
    pub fn builtin() -> Self {
        Self::new("<builtin>", 0, 0)
    }

    pub fn to_location(&self) -> Location {
        Location::with_position(self.file.to_string(), self.row, self.column)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.row, self.column)
    }
}

/// Error raised while lexing, parsing or interpreting a template
#[derive(Debug, Clone, thiserror::Error)]
pub enum TemplateError {
    #[error("{position}: {message}")]
    Lex { position: Position, message: String },

    #[error("{position}: expected {expected}, found {found}")]
    Parse {
        position: Position,
        expected: String,
        found: String,
    },

    #[error("{position}: {message}")]
    Eval { position: Position, message: String },

    #[error("{position}: compiler error: {message}")]
    Compiler { position: Position, message: String },

    #[error("dependency cycle detected while resolving `{unit}`")]
    Cycle { unit: String },
}

/// Result type used throughout the template engine
pub type Result<T> = std::result::Result<T, TemplateError>;

impl TemplateError {
    pub fn lex(position: &Position, message: impl Into<String>) -> Self {
        Self::Lex {
            position: position.clone(),
            message: message.into(),
        }
    }

    pub fn parse(
        position: &Position,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::Parse {
            position: position.clone(),
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub fn eval(position: &Position, message: impl Into<String>) -> Self {
        Self::Eval {
            position: position.clone(),
            message: message.into(),
        }
    }

    pub fn cycle(unit: impl Into<String>) -> Self {
        Self::Cycle { unit: unit.into() }
    }

    /// Source position, when the error has one
    pub fn position(&self) -> Option<&Position> {
        match self {
            Self::Lex { position, .. }
            | Self::Parse { position, .. }
            | Self::Eval { position, .. }
            | Self::Compiler { position, .. } => Some(position),
            Self::Cycle { .. } => None,
        }
    }

    /// Convert to a sqlweave diagnostic
    pub fn to_diagnostic(&self) -> Diagnostic {
        let diag = match self {
            Self::Lex { message, .. } => {
                Diagnostic::new(DiagnosticCode::TemplateLexError, Severity::Error, message.clone())
            }
            Self::Parse { expected, found, .. } => Diagnostic::new(
                DiagnosticCode::TemplateParseError,
                Severity::Error,
                format!("expected {}, found {}", expected, found),
            )
            .with_comparison(expected.clone(), found.clone()),
            Self::Eval { message, .. } => {
                Diagnostic::new(DiagnosticCode::TemplateEvalError, Severity::Error, message.clone())
            }
            Self::Compiler { message, .. } => Diagnostic::new(
                DiagnosticCode::TemplateCompilerError,
                Severity::Error,
                message.clone(),
            ),
            Self::Cycle { unit } => Diagnostic::new(
                DiagnosticCode::DependencyCycle,
                Severity::Error,
                format!("dependency cycle detected while resolving `{}`", unit),
            )
            .with_unit(unit.clone()),
        };

        match self.position() {
            Some(position) => diag.with_location(position.to_location()),
            None => diag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_message_has_position() {
        let err = TemplateError::parse(&Position::new("models/a.sql", 3, 14), "`%}`", "`)`");
        assert_eq!(err.to_string(), "models/a.sql:3:14: expected `%}`, found `)`");
    }

    #[test]
    fn diagnostic_carries_location() {
        let err = TemplateError::eval(&Position::new("models/a.sql", 1, 4), "unknown function `f`");
        let diag = err.to_diagnostic();

        assert_eq!(diag.code, DiagnosticCode::TemplateEvalError);
        assert_eq!(diag.location, Some(Location::with_position("models/a.sql", 1, 4)));
    }

    #[test]
    fn cycle_has_no_position() {
        let err = TemplateError::cycle("orders");
        assert!(err.position().is_none());
        assert_eq!(err.to_diagnostic().code, DiagnosticCode::DependencyCycle);
    }
}
