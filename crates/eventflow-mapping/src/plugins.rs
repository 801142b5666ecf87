//! Pluggable functions invoked with `f:name(model.a, model.b)`.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::MappingError;
use crate::operators::{b64, binary_value, length_of, str_to_double, str_to_float, str_to_int, str_to_long};
use crate::value::Value;

/// A named value transform callable from mapping statements.
pub trait PluginFunction: Send + Sync {
    /// Name used after the `f:` prefix
    fn name(&self) -> &str;

    /// Compute a value from the resolved arguments. Missing arguments arrive as `Value::Null`.
    fn calculate(&self, args: &[Value]) -> Result<Value, MappingError>;
}

type Calculation = dyn Fn(&[Value]) -> Result<Value, MappingError> + Send + Sync;

/// Closure-backed plugin
pub struct FnPlugin {
    name: String,
    func: Box<Calculation>,
}

impl FnPlugin {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, MappingError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

impl fmt::Debug for FnPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPlugin").field("name", &self.name).finish()
    }
}

impl PluginFunction for FnPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn calculate(&self, args: &[Value]) -> Result<Value, MappingError> {
        (self.func)(args)
    }
}

/// Thread-safe registry of pluggable functions
#[derive(Default)]
pub struct PluginRegistry {
    functions: DashMap<String, Arc<dyn PluginFunction>>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

impl PluginRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with the built-in functions
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for &(name, func) in BUILTINS {
            registry.register(FnPlugin::new(name, move |args: &[Value]| func(name, args)));
        }
        registry
    }

    /// Register a function, replacing any previous one with the same name.
    pub fn register(&self, plugin: impl PluginFunction + 'static) {
        let name = plugin.name().to_string();
        debug!(function = %name, "Registering pluggable function");
        self.functions.insert(name, Arc::new(plugin));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PluginFunction>> {
        self.functions.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Sorted names of every registered function
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Run a registered function. An unknown name is an error.
    pub fn invoke(&self, name: &str, args: &[Value]) -> Result<Value, MappingError> {
        let plugin = self.get(name).ok_or_else(|| {
            error!("Pluggable function '{}' not found", name);
            MappingError::UnknownFunction(name.to_string())
        })?;
        plugin.calculate(args)
    }
}

type Builtin = fn(&str, &[Value]) -> Result<Value, MappingError>;

const BUILTINS: &[(&str, Builtin)] = &[
    ("add", add),
    ("subtract", subtract),
    ("multiply", multiply),
    ("div", divide),
    ("mod", modulus),
    ("increment", increment),
    ("decrement", decrement),
    ("eq", equals),
    ("gt", greater_than),
    ("lt", less_than),
    ("and", conjunction),
    ("or", disjunction),
    ("not", negation),
    ("isNull", is_null),
    ("notNull", not_null),
    ("ternary", ternary),
    ("uuid", generate_uuid),
    ("dateTime", date_time),
    ("concat", concat),
    ("length", length),
    ("text", to_text),
    ("int", to_int),
    ("long", to_long),
    ("float", to_float),
    ("double", to_double),
    ("binary", to_binary),
    ("substring", substring),
    ("boolean", to_boolean),
    ("b64", base64_codec),
    ("removeKey", remove_key),
    ("listOfMap", list_of_map),
    ("updateListOfMap", update_list_of_map),
];

fn promote(name: &str, value: &Value) -> Result<i64, MappingError> {
    value.to_long().ok_or_else(|| {
        MappingError::function_failed(name, format!("cannot use {} as a whole number", value.to_text()))
    })
}

fn promote_all(name: &str, args: &[Value]) -> Result<Vec<i64>, MappingError> {
    if args.is_empty() {
        return Err(MappingError::function_failed(name, "input is required"));
    }
    args.iter().map(|v| promote(name, v)).collect()
}

fn reduce(
    name: &str,
    args: &[Value],
    op: fn(i64, i64) -> Option<i64>,
) -> Result<Value, MappingError> {
    let numbers = promote_all(name, args)?;
    let mut iter = numbers.into_iter();
    let first = iter.next().unwrap_or_default();
    iter.try_fold(first, |acc, n| {
        op(acc, n).ok_or_else(|| MappingError::function_failed(name, "arithmetic overflow"))
    })
    .map(Value::Long)
}

fn check_divisors(name: &str, args: &[Value]) -> Result<(), MappingError> {
    for divisor in args.iter().skip(1) {
        if promote(name, divisor)? == 0 {
            return Err(MappingError::function_failed(name, "division by zero"));
        }
    }
    Ok(())
}

fn exactly<'a>(name: &str, args: &'a [Value], n: usize) -> Result<&'a [Value], MappingError> {
    if args.len() == n {
        Ok(args)
    } else {
        Err(MappingError::function_failed(
            name,
            format!("expected {} argument(s), got {}", n, args.len()),
        ))
    }
}

fn add(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    reduce(name, args, i64::checked_add)
}

fn subtract(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    reduce(name, args, i64::checked_sub)
}

fn multiply(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    reduce(name, args, i64::checked_mul)
}

fn divide(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    check_divisors(name, args)?;
    reduce(name, args, i64::checked_div)
}

fn modulus(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    check_divisors(name, args)?;
    reduce(name, args, i64::checked_rem)
}

fn increment(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let args = exactly(name, args, 1)?;
    let n = promote(name, &args[0])?;
    n.checked_add(1)
        .map(Value::Long)
        .ok_or_else(|| MappingError::function_failed(name, "arithmetic overflow"))
}

fn decrement(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let args = exactly(name, args, 1)?;
    let n = promote(name, &args[0])?;
    n.checked_sub(1)
        .map(Value::Long)
        .ok_or_else(|| MappingError::function_failed(name, "arithmetic overflow"))
}

fn equals(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    if args.len() < 2 {
        return Err(MappingError::function_failed(name, "at least two values are required"));
    }
    Ok(Value::Bool(args.windows(2).all(|pair| pair[0] == pair[1])))
}

fn compare(name: &str, args: &[Value], matches: fn(i64, i64) -> bool) -> Result<Value, MappingError> {
    let numbers = promote_all(name, args)?;
    let first = numbers[0];
    Ok(Value::Bool(numbers[1..].iter().all(|n| matches(first, *n))))
}

fn greater_than(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    compare(name, args, |a, b| a > b)
}

fn less_than(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    compare(name, args, |a, b| a < b)
}

fn as_boolean(name: &str, value: &Value) -> Result<bool, MappingError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Text(s) => Ok(s.eq_ignore_ascii_case("true")),
        other => Err(MappingError::function_failed(
            name,
            format!("cannot convert {} to boolean", other.to_text()),
        )),
    }
}

fn conjunction(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    if args.is_empty() {
        return Err(MappingError::function_failed(name, "input is required"));
    }
    let mut all = true;
    for arg in args {
        all &= as_boolean(name, arg)?;
    }
    Ok(Value::Bool(all))
}

fn disjunction(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    if args.is_empty() {
        return Err(MappingError::function_failed(name, "input is required"));
    }
    let mut any = false;
    for arg in args {
        any |= as_boolean(name, arg)?;
    }
    Ok(Value::Bool(any))
}

fn negation(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let args = exactly(name, args, 1)?;
    Ok(Value::Bool(!as_boolean(name, &args[0])?))
}

fn is_null(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let args = exactly(name, args, 1)?;
    Ok(Value::Bool(args[0].is_null()))
}

fn not_null(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let args = exactly(name, args, 1)?;
    Ok(Value::Bool(!args[0].is_null()))
}

fn ternary(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let args = exactly(name, args, 3)?;
    Ok(if as_boolean(name, &args[0])? {
        args[1].clone()
    } else {
        args[2].clone()
    })
}

fn generate_uuid(_name: &str, _args: &[Value]) -> Result<Value, MappingError> {
    Ok(Value::Text(Uuid::new_v4().to_string()))
}

fn date_time(_name: &str, _args: &[Value]) -> Result<Value, MappingError> {
    Ok(Value::Text(Utc::now().to_rfc3339()))
}

fn concat(_name: &str, args: &[Value]) -> Result<Value, MappingError> {
    Ok(Value::Text(
        args.iter()
            .filter(|v| !v.is_null())
            .map(Value::to_text)
            .collect(),
    ))
}

fn length(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let args = exactly(name, args, 1)?;
    Ok(Value::Int(length_of(&args[0])))
}

fn to_text(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let args = exactly(name, args, 1)?;
    Ok(Value::Text(args[0].to_text()))
}

fn to_int(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let args = exactly(name, args, 1)?;
    Ok(Value::Int(str_to_int(&args[0].to_text())))
}

fn to_long(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let args = exactly(name, args, 1)?;
    Ok(Value::Long(str_to_long(&args[0].to_text())))
}

fn to_double(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let args = exactly(name, args, 1)?;
    Ok(Value::Double(str_to_double(&args[0].to_text())))
}

fn to_float(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    convert_each(name, args, |v| Value::Float(str_to_float(&v.to_text())))
}

fn to_binary(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    convert_each(name, args, |v| Value::Bytes(binary_value(v)))
}

/// One argument converts to a value, several convert to a list.
fn convert_each(name: &str, args: &[Value], convert: fn(&Value) -> Value) -> Result<Value, MappingError> {
    match args {
        [] => Err(MappingError::function_failed(name, "input is required")),
        [single] => Ok(convert(single)),
        many => Ok(Value::List(many.iter().map(convert).collect())),
    }
}

/// `substring(text, start[, end])` over characters. Out-of-range indexes are an error.
fn substring(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let Some(first) = args.first() else {
        return Err(MappingError::function_failed(name, "input is required"));
    };
    let chars: Vec<char> = first.to_text().chars().collect();
    let len = chars.len() as i64;
    let index = |i: usize| args.get(i).map(|v| str_to_int(&v.to_text()) as i64).unwrap_or(-1);
    let (start, end) = (index(1), index(2));

    let out_of_bounds = (end >= 0 && end > len) || (start >= 0 && start > len) || (start >= 0 && end >= 0 && start > end);
    if out_of_bounds {
        return Err(MappingError::function_failed(
            name,
            format!("Substring indexes are out of bounds: [{}, {}]", start, end),
        ));
    }
    let slice = |from: i64, to: i64| chars[from as usize..to as usize].iter().collect::<String>();
    Ok(Value::Text(if start >= 0 && end >= 0 {
        slice(start, end)
    } else if start >= 0 && start < len {
        slice(start, len)
    } else {
        chars.iter().collect()
    }))
}

fn to_boolean(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let args = exactly(name, args, 1)?;
    Ok(Value::Bool(args[0].to_text().eq_ignore_ascii_case("true")))
}

fn base64_codec(name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let args = exactly(name, args, 1)?;
    b64(&args[0])
}

fn drop_keys(map: &BTreeMap<String, Value>, keys: &[String]) -> Value {
    let mut copy = map.clone();
    for key in keys {
        copy.remove(key);
    }
    Value::Map(copy)
}

/// First argument is a map or list of maps, the rest are keys to drop.
fn remove_key(_name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let Some((first, rest)) = args.split_first() else {
        return Ok(Value::Null);
    };
    if rest.is_empty() {
        return Ok(Value::Null);
    }
    let keys: Vec<String> = rest.iter().map(Value::to_text).collect();
    Ok(match first {
        Value::Map(map) => drop_keys(map, &keys),
        Value::List(items) => Value::List(
            items
                .iter()
                .map(|item| match item {
                    Value::Map(map) => drop_keys(map, &keys),
                    other => other.clone(),
                })
                .collect(),
        ),
        _ => Value::Null,
    })
}

/// First nested map holding a list, searched depth-first
fn find_map_of_lists(map: &BTreeMap<String, Value>) -> Option<&BTreeMap<String, Value>> {
    for value in map.values() {
        match value {
            Value::List(_) => return Some(map),
            Value::Map(inner) => return find_map_of_lists(inner),
            _ => {}
        }
    }
    None
}

/// Turn `{k: [a, b]}` into `[{k: a}, {k: b}]`, padding shorter lists by omission.
fn normalize(map: &BTreeMap<String, Value>) -> Vec<Value> {
    let rows = map
        .values()
        .filter_map(|v| match v {
            Value::List(items) => Some(items.len()),
            _ => None,
        })
        .max()
        .unwrap_or(0);
    (0..rows)
        .map(|i| {
            let row = map
                .iter()
                .filter_map(|(k, v)| match v {
                    Value::List(items) => items.get(i).map(|item| (k.clone(), item.clone())),
                    _ => None,
                })
                .collect();
            Value::Map(row)
        })
        .collect()
}

/// Maps of lists to merge into `rows` rows. Any malformed one voids the whole merge.
fn prepare_merge(rows: usize, rest: &[Value]) -> Vec<&BTreeMap<String, Value>> {
    let mut found = Vec::new();
    for arg in rest {
        let Value::Map(data) = arg else { continue };
        let Some(map) = find_map_of_lists(data) else { continue };
        let valid = map
            .values()
            .all(|v| matches!(v, Value::List(items) if items.len() == rows));
        if !valid {
            return Vec::new();
        }
        found.push(map);
    }
    found
}

fn merge(first: &[Value], additional: &[&BTreeMap<String, Value>]) -> Value {
    let mut copy = first.to_vec();
    for (i, row) in copy.iter_mut().enumerate() {
        let Value::Map(base) = row else { continue };
        for map in additional {
            for (key, value) in map.iter() {
                if let Value::List(items) = value {
                    if let Some(item) = items.get(i) {
                        base.insert(key.clone(), item.clone());
                    }
                }
            }
        }
    }
    Value::List(copy)
}

/// Map of lists to list of maps, merging any further maps of lists of the same length.
fn list_of_map(_name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let empty = Value::List(Vec::new());
    let Some(Value::Map(data)) = args.first() else {
        return Ok(empty);
    };
    let Some(map) = find_map_of_lists(data) else {
        return Ok(empty);
    };
    let first = normalize(map);
    if args.len() > 1 && !first.is_empty() {
        let additional = prepare_merge(first.len(), &args[1..]);
        return Ok(if additional.is_empty() { empty } else { merge(&first, &additional) });
    }
    Ok(Value::List(first))
}

/// Merge maps of lists into the list of maps given as first argument.
fn update_list_of_map(_name: &str, args: &[Value]) -> Result<Value, MappingError> {
    let empty = Value::List(Vec::new());
    let Some(Value::List(first)) = args.first() else {
        return Ok(empty);
    };
    let valid = args.len() > 1 && !first.is_empty() && first.iter().all(|v| matches!(v, Value::Map(_)));
    if !valid {
        return Ok(empty);
    }
    let additional = prepare_merge(first.len(), &args[1..]);
    Ok(if additional.is_empty() { empty } else { merge(first, &additional) })
}
