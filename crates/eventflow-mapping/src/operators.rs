//! Type-cast operators applied through the `model.path:operator` suffix.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::MappingError;
use crate::model::{Lookup, MODEL_NAMESPACE};
use crate::value::Value;

const TEXT_TYPE: &str = "text(";
const TRUE: &str = "true";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Simple,
    Substring,
    Concat,
    And,
    Or,
    Boolean,
}

impl Operation {
    fn of(op: &str) -> Self {
        if op.starts_with("substring(") {
            Operation::Substring
        } else if op.starts_with("concat(") {
            Operation::Concat
        } else if op.starts_with("and(") {
            Operation::And
        } else if op.starts_with("or(") {
            Operation::Or
        } else if op.starts_with("boolean(") {
            Operation::Boolean
        } else {
            Operation::Simple
        }
    }
}

/// Failure inside an operator: soft ones fall back to the original value.
enum CastFailure {
    Soft(String),
    Hard(MappingError),
}

impl From<MappingError> for CastFailure {
    fn from(err: MappingError) -> Self {
        CastFailure::Hard(err)
    }
}

/// Apply a type-cast operator to `value`.
///
/// `source` resolves the `model.*` operands of `concat`, `and` and `or`.
/// Malformed arguments and out-of-range substrings are logged and the
/// untransformed value is returned. A non-model `and`/`or` operand and
/// invalid base64 text are returned as errors.
pub fn apply_type_cast(
    op: &str,
    value: Option<Value>,
    source: &dyn Lookup,
    path: &str,
) -> Result<Option<Value>, MappingError> {
    let op = op.trim();
    let outcome = match Operation::of(op) {
        Operation::Simple => simple(op, value.as_ref()).map(Some),
        operation => {
            if let (true, Some(open)) = (op.ends_with(')'), op.find('(')) {
                let command = op[open + 1..op.len() - 1].trim();
                match operation {
                    Operation::Substring => substring(value.as_ref(), command).map(|s| Some(Value::Text(s))),
                    Operation::Concat => concat(value.as_ref(), command, source).map(|s| Some(Value::Text(s))),
                    Operation::And | Operation::Or => {
                        logical(value.as_ref(), command, source, operation == Operation::And)
                            .map(|b| Some(Value::Bool(b)))
                    }
                    _ => boolean_match(value.as_ref(), command).map(|b| Some(Value::Bool(b))),
                }
            } else {
                Err(CastFailure::Soft("missing close bracket".to_string()))
            }
        }
    };
    match outcome {
        Ok(result) => Ok(result),
        Err(CastFailure::Soft(reason)) => {
            error!(operation = op, path, "Unable to do {} of {} - {}", op, path, reason);
            Ok(value)
        }
        Err(CastFailure::Hard(err)) => Err(err),
    }
}

fn simple(op: &str, value: Option<&Value>) -> Result<Value, CastFailure> {
    let null = Value::Null;
    let value = value.unwrap_or(&null);
    let converted = match op {
        "text" => Value::Text(value.to_text()),
        "binary" => Value::Bytes(binary_value(value)),
        "boolean" => Value::Bool(value.to_text().eq_ignore_ascii_case(TRUE)),
        "!" => Value::Bool(!value.to_text().eq_ignore_ascii_case(TRUE)),
        "int" => Value::Int(str_to_int(&value.to_text())),
        "long" => Value::Long(str_to_long(&value.to_text())),
        "float" => Value::Float(str_to_float(&value.to_text())),
        "double" => Value::Double(str_to_double(&value.to_text())),
        "uuid" => Value::Text(Uuid::new_v4().to_string()),
        "length" => Value::Int(length_of(value)),
        "b64" => b64(value)?,
        _ => {
            return Err(CastFailure::Soft(
                "matching type must be substring(start, end), concat, boolean, !, and, or, \
                 text, binary, int, long, float, double, length, uuid or b64"
                    .to_string(),
            ))
        }
    };
    Ok(converted)
}

/// Bytes as-is, text as UTF-8, anything else through its text form.
pub fn binary_value(value: &Value) -> Vec<u8> {
    match value {
        Value::Bytes(b) => b.clone(),
        Value::Text(s) => s.as_bytes().to_vec(),
        other => other.to_text().into_bytes(),
    }
}

/// Null is 0, bytes count bytes, text counts chars, lists count items.
pub fn length_of(value: &Value) -> i32 {
    let len = match value {
        Value::Null => 0,
        Value::Bytes(b) => b.len(),
        Value::Text(s) => s.chars().count(),
        Value::List(items) => items.len(),
        other => other.to_text().chars().count(),
    };
    i32::try_from(len).unwrap_or(i32::MAX)
}

/// Encode bytes to base64 text or decode base64 text to bytes.
pub fn b64(value: &Value) -> Result<Value, MappingError> {
    match value {
        Value::Bytes(b) => Ok(Value::Text(STANDARD.encode(b))),
        Value::Text(s) => STANDARD
            .decode(s.trim())
            .map(Value::Bytes)
            .map_err(|_| MappingError::InvalidBase64),
        other => Ok(other.clone()),
    }
}

fn substring(value: Option<&Value>, command: &str) -> Result<String, CastFailure> {
    let parts: Vec<&str> = command
        .split(|c| c == ',' || c == ' ')
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() || parts.len() > 2 {
        return Err(CastFailure::Soft("invalid syntax".to_string()));
    }
    let Some(Value::Text(text)) = value else {
        return Err(CastFailure::Soft("value is not a string".to_string()));
    };
    let chars: Vec<char> = text.chars().collect();
    let len = i64::try_from(chars.len()).unwrap_or(i64::MAX);
    let start = i64::from(str_to_int(parts[0]));
    let end = match parts.get(1) {
        Some(p) => i64::from(str_to_int(p)),
        None => len,
    };
    if end > start && start >= 0 && end <= len {
        // bounds checked above
        Ok(chars[start as usize..end as usize].iter().collect())
    } else {
        Err(CastFailure::Soft("index out of bound".to_string()))
    }
}

fn concat(value: Option<&Value>, command: &str, source: &dyn Lookup) -> Result<String, CastFailure> {
    let parts = tokenize_concat(command);
    if parts.is_empty() {
        return Err(CastFailure::Soft(
            "parameters must be model variables and/or text constants".to_string(),
        ));
    }
    let mut out = value.map(Value::to_text).unwrap_or_else(|| Value::Null.to_text());
    for part in parts {
        if let Some(literal) = part.strip_prefix(TEXT_TYPE).and_then(|p| p.strip_suffix(')')) {
            out.push_str(literal);
        } else if part.starts_with(MODEL_NAMESPACE) {
            let resolved = source.lookup(&part).unwrap_or(Value::Null);
            out.push_str(&resolved.to_text());
        }
    }
    Ok(out)
}

/// Split `text(a), model.b, text(c)` into its parameters.
///
/// An unrecognised parameter or a bare `model.` invalidates the whole list.
fn tokenize_concat(text: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut command = text.trim();
    while !command.is_empty() {
        if command.starts_with(MODEL_NAMESPACE) {
            match command.find(',') {
                None => {
                    result.push(command.to_string());
                    return result;
                }
                Some(sep) => {
                    let token = command[..sep].trim();
                    if token == MODEL_NAMESPACE {
                        return Vec::new();
                    }
                    result.push(token.to_string());
                    command = command[sep + 1..].trim();
                }
            }
        } else if command.starts_with(TEXT_TYPE) {
            let Some(close) = command.find(')') else {
                return Vec::new();
            };
            result.push(command[..=close].to_string());
            match command[close..].find(',') {
                None => return result,
                Some(sep) => command = command[close + sep + 1..].trim(),
            }
        } else {
            return Vec::new();
        }
    }
    result
}

fn logical(
    value: Option<&Value>,
    command: &str,
    source: &dyn Lookup,
    conjunction: bool,
) -> Result<bool, CastFailure> {
    if !(command.starts_with(MODEL_NAMESPACE) && command.len() > MODEL_NAMESPACE.len()) {
        return Err(MappingError::InvalidOperand(command.to_string()).into());
    }
    let left = value.map(Value::to_text).as_deref() == Some(TRUE);
    let right = source.lookup(command).map(|v| v.to_text()).as_deref() == Some(TRUE);
    Ok(if conjunction { left && right } else { left || right })
}

fn boolean_match(value: Option<&Value>, command: &str) -> Result<bool, CastFailure> {
    let parts: Vec<&str> = command
        .split(|c| c == ',' || c == '=')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() || parts.len() > 2 {
        return Err(CastFailure::Soft(format!("invalid syntax - got command: {}", command)));
    }
    let text = value.map(Value::to_text).unwrap_or_else(|| Value::Null.to_text());
    let condition = parts.len() == 1 || parts[1].eq_ignore_ascii_case(TRUE);
    Ok(if text == parts[0] { condition } else { !condition })
}

fn whole_part(text: &str) -> &str {
    let text = text.trim();
    match text.find('.') {
        Some(dot) if dot > 0 => &text[..dot],
        _ => text,
    }
}

/// Best-effort integer parse. Fractions are dropped; garbage becomes -1.
pub fn str_to_int(text: &str) -> i32 {
    whole_part(text).parse::<i32>().unwrap_or_else(|_| {
        warn!("Unable to convert '{}' to int", text);
        -1
    })
}

/// Best-effort long parse. Fractions are dropped; garbage becomes -1.
pub fn str_to_long(text: &str) -> i64 {
    whole_part(text).parse::<i64>().unwrap_or_else(|_| {
        warn!("Unable to convert '{}' to long", text);
        -1
    })
}

pub fn str_to_float(text: &str) -> f32 {
    text.trim().parse::<f32>().unwrap_or_else(|_| {
        warn!("Unable to convert '{}' to float", text);
        -1.0
    })
}

pub fn str_to_double(text: &str) -> f64 {
    text.trim().parse::<f64>().unwrap_or_else(|_| {
        warn!("Unable to convert '{}' to double", text);
        -1.0
    })
}
