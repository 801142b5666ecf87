//! Tree-structured model store addressed with dot-bracket paths.
//!
//! Paths look like `model.order.items[2].sku`. A trailing `[]` appends to a
//! list on write. The `model.parent.*` and `model.root.*` namespaces resolve to
//! a shared tree owned by the root flow instance and aliased, never copied,
//! into every descendant.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::MappingError;
use crate::value::Value;

pub const MODEL: &str = "model";
pub const MODEL_NAMESPACE: &str = "model.";
pub const PARENT: &str = "parent";
pub const ROOT: &str = "root";

/// Shared cross-flow state. Always holds a `Value::Map`.
pub type SharedMap = Arc<RwLock<Value>>;

/// Read access to a namespace tree by full path.
pub trait Lookup {
    /// Resolve `path`, treating stored nulls as absent
    fn lookup(&self, path: &str) -> Option<Value>;
}

/// One step of a parsed path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
    /// `[]` suffix, write-only
    Append,
}

/// Parse `a.b[1].c` style paths.
pub fn parse_path(path: &str) -> Result<Vec<Segment>, MappingError> {
    let path = path.trim();
    let invalid = || MappingError::InvalidModelPath(path.to_string());
    if path.is_empty() {
        return Err(invalid());
    }
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if key.is_empty() {
            return Err(invalid());
        }
        segments.push(Segment::Key(key.to_string()));
        while !rest.is_empty() {
            if !rest.starts_with('[') {
                return Err(invalid());
            }
            let close = rest.find(']').ok_or_else(invalid)?;
            let inner = rest[1..close].trim();
            if inner.is_empty() {
                segments.push(Segment::Append);
            } else {
                let index = inner.parse::<usize>().map_err(|_| invalid())?;
                segments.push(Segment::Index(index));
            }
            rest = &rest[close + 1..];
        }
    }
    if let Some(pos) = segments.iter().position(|s| *s == Segment::Append) {
        if pos != segments.len() - 1 {
            return Err(invalid());
        }
    }
    Ok(segments)
}

/// Borrow the node addressed by `segments`.
pub fn get_in<'a>(root: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = match (segment, node) {
            (Segment::Key(k), Value::Map(map)) => map.get(k)?,
            (Segment::Index(i), Value::List(list)) => list.get(*i)?,
            _ => return None,
        };
    }
    Some(node)
}

/// Write `value` at `segments`, creating intermediate maps and lists.
pub fn set_in(node: &mut Value, segments: &[Segment], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    match first {
        Segment::Key(key) => {
            if !node.is_map() {
                *node = Value::map();
            }
            if let Value::Map(map) = node {
                let child = map.entry(key.clone()).or_insert(Value::Null);
                set_in(child, rest, value);
            }
        }
        Segment::Index(index) => {
            if !matches!(node, Value::List(_)) {
                *node = Value::List(Vec::new());
            }
            if let Value::List(list) = node {
                while list.len() <= *index {
                    list.push(Value::Null);
                }
                set_in(&mut list[*index], rest, value);
            }
        }
        Segment::Append => {
            if !matches!(node, Value::List(_)) {
                *node = Value::List(Vec::new());
            }
            if let Value::List(list) = node {
                list.push(value);
            }
        }
    }
}

/// Remove the node addressed by `segments`, returning it.
pub fn remove_in(root: &mut Value, segments: &[Segment]) -> Option<Value> {
    let (last, parents) = segments.split_last()?;
    let mut node = root;
    for segment in parents {
        node = match (segment, node) {
            (Segment::Key(k), Value::Map(map)) => map.get_mut(k)?,
            (Segment::Index(i), Value::List(list)) => list.get_mut(*i)?,
            _ => return None,
        };
    }
    match (last, node) {
        (Segment::Key(k), Value::Map(map)) => map.remove(k),
        (Segment::Index(i), Value::List(list)) if *i < list.len() => Some(list.remove(*i)),
        _ => None,
    }
}

/// Resolve a path against a plain tree, treating null as absent.
pub fn lookup_in(root: &Value, path: &str) -> Option<Value> {
    let segments = parse_path(path).ok()?;
    get_in(root, &segments).filter(|v| !v.is_null()).cloned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Local,
    Shared,
}

/// The live `model` namespace of one flow instance.
#[derive(Debug)]
pub struct ModelStore {
    local: RwLock<Value>,
    shared: SharedMap,
}

impl Default for ModelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelStore {
    /// Store owning a fresh shared tree (root instance)
    pub fn new() -> Self {
        Self::with_shared(Arc::new(RwLock::new(Value::map())))
    }

    /// Store aliasing an existing shared tree (sub-flow instance)
    pub fn with_shared(shared: SharedMap) -> Self {
        Self {
            local: RwLock::new(Value::map()),
            shared,
        }
    }

    /// Handle on the shared tree, for passing to child instances
    pub fn shared(&self) -> SharedMap {
        Arc::clone(&self.shared)
    }

    /// Whether two stores alias the same shared tree
    pub fn shares_with(&self, other: &ModelStore) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn route(path: &str) -> Result<(Scope, Vec<Segment>), MappingError> {
        let rest = path
            .trim()
            .strip_prefix(MODEL_NAMESPACE)
            .ok_or_else(|| MappingError::InvalidModelPath(path.to_string()))?;
        let mut segments = parse_path(rest)?;
        match segments.first() {
            Some(Segment::Key(k)) if k == PARENT || k == ROOT => {
                segments.remove(0);
                Ok((Scope::Shared, segments))
            }
            _ => Ok((Scope::Local, segments)),
        }
    }

    /// Read a `model.*` path. Stored nulls read as absent.
    pub fn get(&self, path: &str) -> Option<Value> {
        if path.trim() == MODEL {
            return Some(self.snapshot());
        }
        let (scope, segments) = Self::route(path).ok()?;
        let found = match scope {
            Scope::Local => get_in(&self.local.read(), &segments).cloned(),
            Scope::Shared => get_in(&self.shared.read(), &segments).cloned(),
        };
        found.filter(|v| !v.is_null())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Write a `model.*` path. The bare parent namespace cannot be replaced.
    pub fn set(&self, path: &str, value: impl Into<Value>) -> Result<(), MappingError> {
        let (scope, segments) = Self::route(path)?;
        if segments.is_empty() {
            return Err(MappingError::InvalidModelPath(path.to_string()));
        }
        match scope {
            Scope::Local => set_in(&mut self.local.write(), &segments, value.into()),
            Scope::Shared => set_in(&mut self.shared.write(), &segments, value.into()),
        }
        Ok(())
    }

    /// Remove a `model.*` path, returning the previous value.
    pub fn remove(&self, path: &str) -> Option<Value> {
        let (scope, segments) = Self::route(path).ok()?;
        match scope {
            Scope::Local => remove_in(&mut self.local.write(), &segments),
            Scope::Shared => remove_in(&mut self.shared.write(), &segments),
        }
    }

    /// Copy of the whole model, with the shared tree under `parent`.
    pub fn snapshot(&self) -> Value {
        let mut model = match &*self.local.read() {
            Value::Map(map) => map.clone(),
            _ => BTreeMap::new(),
        };
        model.insert(PARENT.to_string(), self.shared.read().clone());
        Value::Map(model)
    }
}

impl Lookup for ModelStore {
    fn lookup(&self, path: &str) -> Option<Value> {
        self.get(path)
    }
}
