use eventflow_mapping::{MappingError, ValidationError};
use std::fmt;
use thiserror::Error;

/// Core error type for the Eventflow engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Flow template not registered
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Flow instance not found
    #[error("Flow instance not found: {0}")]
    FlowInstanceNotFound(String),

    /// Task name not defined in the flow
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Single validation failure
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Flow template failed validation
    #[error("{}", InvalidFlowFormat(.flow, .errors))]
    InvalidFlow {
        /// Flow id
        flow: String,
        /// Every problem found in the template
        errors: Vec<ValidationError>,
    },

    /// Decision value does not select a next task
    #[error("{0}")]
    InvalidDecision(String),

    /// Walking the parent chain revisited an instance
    #[error("Parent cycle detected at flow instance: {0}")]
    ParentCycle(String),

    /// Timer error
    #[error("Timer error: {0}")]
    TimerError(String),

    /// External state machine error
    #[error("State machine error: {0}")]
    StateMachineError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Mapping evaluation aborted
    #[error(transparent)]
    Mapping(#[from] MappingError),

    /// Input/output error
    #[error("Input/output error: {0}")]
    IOError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

struct InvalidFlowFormat<'a>(&'a str, &'a [ValidationError]);

impl fmt::Display for InvalidFlowFormat<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid flow {} ({} issues):", self.0, self.1.len())?;
        for (i, err) in self.1.iter().enumerate() {
            write!(f, "\n  {}. {}", i + 1, err)?;
        }
        Ok(())
    }
}

impl CoreError {
    /// HTTP-style status used when this error aborts a flow
    pub fn status(&self) -> i32 {
        match self {
            CoreError::FlowNotFound(_) | CoreError::FlowInstanceNotFound(_) => 404,
            CoreError::ValidationError(_) | CoreError::InvalidFlow { .. } => 400,
            CoreError::Mapping(MappingError::InvalidOperand(_))
            | CoreError::Mapping(MappingError::InvalidBase64) => 400,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::IOError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventflow_mapping::statement::error_codes;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_error_display() {
        let errors = vec![
            (CoreError::FlowNotFound("greetings".to_string()), "Flow not found: greetings"),
            (CoreError::FlowInstanceNotFound("f1".to_string()), "Flow instance not found: f1"),
            (CoreError::TaskNotFound("fetch".to_string()), "Task not found: fetch"),
            (CoreError::ValidationError("bad".to_string()), "Validation error: bad"),
            (
                CoreError::InvalidDecision("Task pick returned invalid decision (3)".to_string()),
                "Task pick returned invalid decision (3)",
            ),
            (CoreError::ParentCycle("f2".to_string()), "Parent cycle detected at flow instance: f2"),
            (CoreError::TimerError("no runtime".to_string()), "Timer error: no runtime"),
            (CoreError::StateMachineError("down".to_string()), "State machine error: down"),
            (CoreError::ConfigurationError("ttl".to_string()), "Configuration error: ttl"),
            (CoreError::Mapping(MappingError::InvalidBase64), "Invalid base64 text"),
            (CoreError::IOError("io_err".to_string()), "Input/output error: io_err"),
            (CoreError::SerializationError("ser".to_string()), "Serialization error: ser"),
            (CoreError::Other("other_err".to_string()), "other_err"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_invalid_flow_lists_every_issue() {
        let error = CoreError::InvalidFlow {
            flow: "checkout".to_string(),
            errors: vec![
                ValidationError::new(error_codes::INVALID_SYNTAX, "first").at("tasks.a"),
                ValidationError::new(error_codes::INVALID_SYNTAX, "second"),
            ],
        };
        let text = error.to_string();
        assert!(text.starts_with("Invalid flow checkout (2 issues):"));
        assert!(text.contains("first"));
        assert!(text.contains("second"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(CoreError::FlowNotFound("x".into()).status(), 404);
        assert_eq!(CoreError::Mapping(MappingError::InvalidBase64).status(), 400);
        assert_eq!(CoreError::InvalidDecision("x".into()).status(), 500);
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: CoreError = json_error.into();

        match error {
            CoreError::SerializationError(msg) => assert!(msg.contains("expected value")),
            _ => panic!("Expected SerializationError variant"),
        }
    }

    #[test]
    fn test_from_io_error() {
        let error: CoreError = IoError::new(ErrorKind::NotFound, "file not found").into();
        assert_eq!(error, CoreError::IOError("file not found".to_string()));
    }

    #[test]
    fn test_from_str() {
        let error: CoreError = "test error message".into();
        assert_eq!(error, CoreError::Other("test error message".to_string()));
    }
}
