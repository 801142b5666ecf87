//! Mapping statement syntax and load-time validation.
//!
//! A statement reads `LHS -> RHS`. When the text holds more than one `->`
//! the last one separates the two sides. Input and output statements accept
//! different namespaces:
//!
//! | side | input | output |
//! |---|---|---|
//! | LHS | `input`, `input.*`, `$...`, `model.*`, `error.*`, constants, `f:fn(...)` | input set plus `result`, `result.*`, `status`, `header`, `header.*`, `datatype` |
//! | RHS | payload path, `*`, `header`, `header.*`, `model.*`, `ext:*` | `output.*`, `model.*`, `ext:*`, `decision` |

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use std::error::Error;
use std::fmt;

use crate::error::MappingError;
use crate::model::{parse_path, MODEL, MODEL_NAMESPACE, PARENT, ROOT};

pub const MAP_TO: &str = "->";
pub const INPUT: &str = "input";
pub const INPUT_NAMESPACE: &str = "input.";
pub const ERROR_NAMESPACE: &str = "error.";
pub const OUTPUT_NAMESPACE: &str = "output.";
pub const EXT_NAMESPACE: &str = "ext:";
pub const RESULT: &str = "result";
pub const RESULT_NAMESPACE: &str = "result.";
pub const HEADER: &str = "header";
pub const HEADER_NAMESPACE: &str = "header.";
pub const STATUS: &str = "status";
pub const DATA_TYPE: &str = "datatype";
pub const DECISION: &str = "decision";
pub const JSON_PATH: &str = "$";
pub const WHOLE_PAYLOAD: &str = "*";
pub const MAP_TYPE: &str = "map(";
pub const CLOSE_BRACKET: &str = ")";

/// Prefixes of constant producers other than `map(...)`
pub const CONSTANT_PREFIXES: [&str; 8] = [
    "text(",
    "file(",
    "classpath(",
    "int(",
    "long(",
    "float(",
    "double(",
    "boolean(",
];

lazy_static! {
    static ref PLUGGABLE_FUNCTION: Regex =
        Regex::new(r"^f:(?P<name>[^()\s]+)\((?P<args>.*)\)$").unwrap();
}

/// Validation error codes
pub mod error_codes {
    /// Missing `->` or an empty side
    pub const INVALID_SYNTAX: &str = "ERR_MAPPING_VALIDATION_SYNTAX";

    /// Side uses a namespace that is not allowed in this direction
    pub const INVALID_NAMESPACE: &str = "ERR_MAPPING_VALIDATION_NAMESPACE";

    /// Bare `model`, bare `model.parent` or `model.root`, or an unparsable path
    pub const INVALID_MODEL_PATH: &str = "ERR_MAPPING_VALIDATION_MODEL_PATH";

    /// Inline map literal has empty or duplicated keys
    pub const INVALID_MAP_LITERAL: &str = "ERR_MAPPING_VALIDATION_MAP_LITERAL";

    /// Pluggable function used as a destination
    pub const INVALID_FUNCTION: &str = "ERR_MAPPING_VALIDATION_FUNCTION";

    /// `decision` destination on a task that is not a decision task
    pub const DECISION_NOT_ALLOWED: &str = "ERR_MAPPING_VALIDATION_DECISION";

    /// Both sides are identical
    pub const SELF_ASSIGNMENT: &str = "ERR_MAPPING_VALIDATION_SELF_ASSIGNMENT";
}

/// Represents a validation problem found in a mapping statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Error code (one of [`error_codes`])
    pub code: &'static str,

    /// Human-readable error message
    pub message: String,

    /// Optional location, e.g. `tasks.fetch.input[2]`
    pub path: Option<String>,
}

impl ValidationError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            path: None,
        }
    }

    pub fn at(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = &self.path {
            write!(f, "{}: {} (at {})", self.code, self.message, path)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl Error for ValidationError {}

/// A parsed `LHS -> RHS` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingStatement {
    pub lhs: String,
    pub rhs: String,
}

impl MappingStatement {
    /// Split on the last `->`; both sides are trimmed and must be non-empty.
    pub fn parse(text: &str) -> Result<Self, MappingError> {
        let sep = text
            .rfind(MAP_TO)
            .ok_or_else(|| MappingError::InvalidStatement(text.to_string()))?;
        let lhs = text[..sep].trim();
        let rhs = text[sep + MAP_TO.len()..].trim();
        if lhs.is_empty() || rhs.is_empty() {
            return Err(MappingError::InvalidStatement(text.to_string()));
        }
        Ok(Self {
            lhs: lhs.to_string(),
            rhs: rhs.to_string(),
        })
    }
}

impl fmt::Display for MappingStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.lhs, self.rhs)
    }
}

/// Whether `text` has the shape `f:name(...)`
pub fn is_pluggable_function(text: &str) -> bool {
    PLUGGABLE_FUNCTION.is_match(text.trim())
}

/// Split `f:name(a, b)` into the function name and trimmed argument paths.
pub fn plugin_call(text: &str) -> Option<(String, Vec<String>)> {
    let caps = PLUGGABLE_FUNCTION.captures(text.trim())?;
    let name = caps.name("name")?.as_str().to_string();
    let args = caps
        .name("args")
        .map(|m| {
            m.as_str()
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some((name, args))
}

/// Whether `text` is a constant producer such as `text(...)` or `map(...)`
pub fn is_constant(text: &str) -> bool {
    (text.starts_with(MAP_TYPE) || CONSTANT_PREFIXES.iter().any(|p| text.starts_with(p)))
        && text.ends_with(CLOSE_BRACKET)
}

/// Index of the type-cast colon in `model.path:type`, if any.
pub fn type_cast_index(text: &str) -> Option<usize> {
    if text.starts_with(MODEL_NAMESPACE) {
        text.find(':')
    } else {
        None
    }
}

fn check_model(side: &str) -> Result<(), ValidationError> {
    let first = side
        .split(|c: char| matches!(c, '!' | ':' | ' ' | '(' | ')'))
        .find(|p| !p.is_empty())
        .ok_or_else(|| {
            ValidationError::new(error_codes::INVALID_SYNTAX, format!("'{}' is empty", side))
        })?;
    if first == MODEL {
        return Err(ValidationError::new(
            error_codes::INVALID_MODEL_PATH,
            "the whole model namespace cannot be mapped",
        ));
    }
    if first.starts_with(MODEL_NAMESPACE) {
        let segments: Vec<&str> = first.split('.').filter(|s| !s.is_empty()).collect();
        let bare_parent = segments.len() == 2 && (segments[1] == PARENT || segments[1] == ROOT);
        if segments.len() == 1 || bare_parent {
            return Err(ValidationError::new(
                error_codes::INVALID_MODEL_PATH,
                format!("'{}' must address a key inside the namespace", first),
            ));
        }
    }
    Ok(())
}

fn valid_key_values(text: &str) -> bool {
    let Some(last) = text.rfind(CLOSE_BRACKET) else {
        return false;
    };
    if last < MAP_TYPE.len() {
        return false;
    }
    let inner = text[MAP_TYPE.len()..last].trim();
    if inner.contains('=') || inner.contains(',') {
        let pairs: Vec<&str> = inner.split(',').collect();
        let mut keys = HashSet::new();
        for kv in &pairs {
            let key = kv.split_once('=').map(|(k, _)| k).unwrap_or(kv).trim();
            if key.is_empty() {
                return false;
            }
            keys.insert(key);
        }
        keys.len() == pairs.len()
    } else {
        !inner.is_empty()
    }
}

fn common_lhs(lhs: &str) -> Result<(), ValidationError> {
    if lhs == INPUT
        || lhs.starts_with(INPUT_NAMESPACE)
        || lhs.starts_with(JSON_PATH)
        || lhs.starts_with(MODEL_NAMESPACE)
        || lhs.starts_with(ERROR_NAMESPACE)
    {
        return Ok(());
    }
    if lhs.starts_with(MAP_TYPE) && lhs.ends_with(CLOSE_BRACKET) {
        return if valid_key_values(lhs) {
            Ok(())
        } else {
            Err(ValidationError::new(
                error_codes::INVALID_MAP_LITERAL,
                format!("'{}' needs unique non-empty keys or one config reference", lhs),
            ))
        };
    }
    if is_constant(lhs) {
        return Ok(());
    }
    Err(ValidationError::new(
        error_codes::INVALID_NAMESPACE,
        format!("'{}' is not a valid source", lhs),
    ))
}

fn input_rhs(rhs: &str) -> Result<(), ValidationError> {
    if rhs == WHOLE_PAYLOAD
        || rhs.starts_with(MODEL_NAMESPACE)
        || rhs.starts_with(EXT_NAMESPACE)
        || rhs == HEADER
        || rhs.starts_with(HEADER_NAMESPACE)
    {
        return Ok(());
    }
    if rhs.starts_with(JSON_PATH) || is_constant(rhs) || parse_path(rhs).is_err() {
        return Err(ValidationError::new(
            error_codes::INVALID_NAMESPACE,
            format!("'{}' is not a valid destination", rhs),
        ));
    }
    Ok(())
}

fn output_rhs(rhs: &str, is_decision: bool) -> Result<(), ValidationError> {
    if rhs == DECISION {
        return if is_decision {
            Ok(())
        } else {
            Err(ValidationError::new(
                error_codes::DECISION_NOT_ALLOWED,
                "'decision' is only valid for decision tasks",
            ))
        };
    }
    if rhs.starts_with(OUTPUT_NAMESPACE)
        || rhs.starts_with(MODEL_NAMESPACE)
        || rhs.starts_with(EXT_NAMESPACE)
    {
        Ok(())
    } else {
        Err(ValidationError::new(
            error_codes::INVALID_NAMESPACE,
            format!("'{}' is not a valid destination", rhs),
        ))
    }
}

fn parse_for_validation(text: &str) -> Result<MappingStatement, ValidationError> {
    MappingStatement::parse(text).map_err(|_| {
        ValidationError::new(
            error_codes::INVALID_SYNTAX,
            format!("'{}' is not of the form LHS -> RHS", text),
        )
    })
}

fn check_sides(statement: &MappingStatement) -> Result<(), ValidationError> {
    if is_pluggable_function(&statement.rhs) {
        return Err(ValidationError::new(
            error_codes::INVALID_FUNCTION,
            "a pluggable function cannot be a destination",
        ));
    }
    check_model(&statement.lhs)?;
    check_model(&statement.rhs)?;
    if statement.lhs == statement.rhs {
        return Err(ValidationError::new(
            error_codes::SELF_ASSIGNMENT,
            format!("'{}' maps onto itself", statement.lhs),
        ));
    }
    Ok(())
}

/// Validate one input-mapping statement.
pub fn validate_input(text: &str) -> Result<MappingStatement, ValidationError> {
    let statement = parse_for_validation(text)?;
    check_sides(&statement)?;
    if !is_pluggable_function(&statement.lhs) {
        common_lhs(&statement.lhs)?;
    }
    input_rhs(&statement.rhs)?;
    Ok(statement)
}

/// Validate one output-mapping statement.
///
/// `decision` is only accepted as a destination when `is_decision` is set.
pub fn validate_output(text: &str, is_decision: bool) -> Result<MappingStatement, ValidationError> {
    let statement = parse_for_validation(text)?;
    check_sides(&statement)?;
    let lhs = statement.lhs.as_str();
    let extra = is_pluggable_function(lhs)
        || lhs == DATA_TYPE
        || lhs == RESULT
        || lhs.starts_with(RESULT_NAMESPACE)
        || lhs == STATUS
        || lhs == HEADER
        || lhs.starts_with(HEADER_NAMESPACE);
    if !extra {
        common_lhs(lhs)?;
    }
    output_rhs(&statement.rhs, is_decision)?;
    Ok(statement)
}
