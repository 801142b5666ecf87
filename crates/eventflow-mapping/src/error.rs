use thiserror::Error;

use crate::statement::ValidationError;
use std::fmt;

/// Errors raised while validating or evaluating mapping statements
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    /// Statement is not of the form `LHS -> RHS` or uses an illegal namespace
    #[error("Invalid mapping statement: {0}")]
    InvalidStatement(String),

    /// Several statements failed validation at once
    #[error("{}", MultipleErrorsFormat(.0))]
    Validation(Vec<ValidationError>),

    /// Path cannot be parsed or addresses a forbidden location
    #[error("Invalid model path: {0}")]
    InvalidModelPath(String),

    /// `f:name(...)` refers to a function that was never registered
    #[error("Unknown pluggable function: {0}")]
    UnknownFunction(String),

    /// Operand of `and(...)`/`or(...)` is not a model variable
    #[error("'{0}' is not a model variable")]
    InvalidOperand(String),

    /// Text handed to the `b64` operator is not valid base64
    #[error("Invalid base64 text")]
    InvalidBase64,

    /// Argument list of an operator or producer is malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A pluggable function rejected its arguments
    #[error("Function {name} failed: {message}")]
    FunctionFailed {
        /// Registered function name
        name: String,
        /// Reason reported by the function
        message: String,
    },

    /// JSON conversion failure
    #[error("JSON error: {0}")]
    Json(String),
}

struct MultipleErrorsFormat<'a>(&'a [ValidationError]);

impl fmt::Display for MultipleErrorsFormat<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid mapping statements ({} issues):", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            write!(f, "\n  {}. {}", i + 1, err)?;
        }
        Ok(())
    }
}

impl MappingError {
    /// Build a function failure for the named plugin
    pub fn function_failed(name: &str, message: impl Into<String>) -> Self {
        MappingError::FunctionFailed {
            name: name.to_string(),
            message: message.into(),
        }
    }

    /// Stable identifier for this error kind
    pub fn error_code(&self) -> &'static str {
        match self {
            MappingError::InvalidStatement(_) => "ERR_MAPPING_INVALID_STATEMENT",
            MappingError::Validation(_) => "ERR_MAPPING_VALIDATION_MULTIPLE",
            MappingError::InvalidModelPath(_) => "ERR_MAPPING_INVALID_PATH",
            MappingError::UnknownFunction(_) => "ERR_MAPPING_UNKNOWN_FUNCTION",
            MappingError::InvalidOperand(_) => "ERR_MAPPING_INVALID_OPERAND",
            MappingError::InvalidBase64 => "ERR_MAPPING_INVALID_BASE64",
            MappingError::InvalidArgument(_) => "ERR_MAPPING_INVALID_ARGUMENT",
            MappingError::FunctionFailed { .. } => "ERR_MAPPING_FUNCTION_FAILED",
            MappingError::Json(_) => "ERR_MAPPING_JSON",
        }
    }
}

impl From<serde_json::Error> for MappingError {
    fn from(err: serde_json::Error) -> Self {
        MappingError::Json(err.to_string())
    }
}
