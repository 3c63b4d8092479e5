//! Diagnostic codes and error reporting
//!
//! IMPORTANT: Diagnostic codes are versioned and stable.
//! NEVER rename or remove codes - they are part of the public API.
//! Add new codes with new names only.

use serde::{Deserialize, Serialize};

/// Diagnostic code registry (v1)
///
/// These codes are STABLE and VERSIONED.
/// Do NOT rename or remove codes - only add new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosticCode {
    // Template language (1xxx)
    /// Unrecognized character inside a `{{ }}` / `{% %}` block
    TemplateLexError,

    /// Token stream does not match the template grammar
    TemplateParseError,

    /// Failure while interpreting a template (unknown name, bad argument, ...)
    TemplateEvalError,

    /// `exceptions.raise_compiler_error` was called by a template
    TemplateCompilerError,

    // Dependency graph (2xxx)
    /// A unit depends on itself through its upstream references
    DependencyCycle,

    /// A unit referenced by name does not exist in the project
    UnknownUnit,

    // Execution (3xxx)
    /// The execution action for a unit failed
    ExecutionFailed,

    // General warnings (9xxx)
    /// General informational message
    Info,

    /// General warning message
    Warning,
}

impl DiagnosticCode {
    /// Get the diagnostic code as a stable string identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TemplateLexError => "TEMPLATE_LEX_ERROR",
            Self::TemplateParseError => "TEMPLATE_PARSE_ERROR",
            Self::TemplateEvalError => "TEMPLATE_EVAL_ERROR",
            Self::TemplateCompilerError => "TEMPLATE_COMPILER_ERROR",
            Self::DependencyCycle => "DEPENDENCY_CYCLE",
            Self::UnknownUnit => "UNKNOWN_UNIT",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
        }
    }
}

impl std::fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Diagnostic severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational message
    Info,

    /// Warning - should be reviewed but not blocking
    Warn,

    /// Error - blocking issue that fails the build
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Source location in a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// File path relative to project root
    pub file: String,

    /// Optional line number (1-indexed)
    pub line: Option<usize>,

    /// Optional column number (1-indexed)
    pub column: Option<usize>,
}

impl Location {
    /// Create a new location with just a file path
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            line: None,
            column: None,
        }
    }

    /// Create a location with file, line, and column
    pub fn with_position(file: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            file: file.into(),
            line: Some(line),
            column: Some(column),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "{}:{}:{}", self.file, line, column),
            (Some(line), None) => write!(f, "{}:{}", self.file, line),
            _ => write!(f, "{}", self.file),
        }
    }
}

/// A diagnostic message with structured metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Stable diagnostic code
    pub code: DiagnosticCode,

    /// Severity level
    pub severity: Severity,

    /// Human-readable message
    pub message: String,

    /// Source location (best-effort)
    pub location: Option<Location>,

    /// Expected value (for parse diagnostics)
    pub expected: Option<String>,

    /// Actual value (for parse diagnostics)
    pub actual: Option<String>,

    /// Unit the diagnostic was raised for
    pub unit: Option<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with minimal fields
    pub fn new(code: DiagnosticCode, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            message: message.into(),
            location: None,
            expected: None,
            actual: None,
            unit: None,
        }
    }

    /// Set the location
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Set expected/actual values
    pub fn with_comparison(
        mut self,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }

    /// Set the offending unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.severity, self.code)?;
        if let Some(unit) = &self.unit {
            write!(f, " in {}", unit)?;
        }
        if let Some(location) = &self.location {
            write!(f, " at {}", location)?;
        }
        write!(f, ": {}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_code_stability() {
        // Ensure codes are stable strings
        assert_eq!(DiagnosticCode::TemplateParseError.as_str(), "TEMPLATE_PARSE_ERROR");
        assert_eq!(DiagnosticCode::DependencyCycle.as_str(), "DEPENDENCY_CYCLE");
    }

    #[test]
    fn diagnostic_serialization() {
        let diag = Diagnostic::new(
            DiagnosticCode::TemplateEvalError,
            Severity::Error,
            "unknown function `f`",
        )
        .with_location(Location::with_position("models/users.sql", 4, 12));

        let json = serde_json::to_string(&diag).unwrap();
        assert!(json.contains("TEMPLATE_EVAL_ERROR"));
        assert!(json.contains("error"));
    }

    #[test]
    fn diagnostic_display_includes_position() {
        let code = DiagnosticCode::TemplateLexError;
        let diag = Diagnostic::new(code, Severity::Error, "unexpected `$`")
            .with_unit("users")
            .with_location(Location::with_position("models/users.sql", 2, 7));

        assert_eq!(
            diag.to_string(),
            "error [TEMPLATE_LEX_ERROR] in users at models/users.sql:2:7: unexpected `$`"
        );
    }
}
