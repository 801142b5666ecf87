//! External state machine for `ext:` mapping destinations
//!
//! Values written to `ext:key` outlive a single flow instance and are
//! scoped by the trace id of the request that produced them.

use async_trait::async_trait;
use dashmap::DashMap;
use eventflow_mapping::{ExtOp, Value};
use std::collections::HashMap;
use tracing::debug;

use crate::CoreError;

/// Key-value store scoped by trace id
#[async_trait]
pub trait ExternalStateMachine: Send + Sync {
    /// Store a value
    async fn put(&self, trace_id: &str, key: &str, value: Value) -> Result<(), CoreError>;

    /// Read a value
    async fn get(&self, trace_id: &str, key: &str) -> Result<Option<Value>, CoreError>;

    /// Delete a value
    async fn remove(&self, trace_id: &str, key: &str) -> Result<(), CoreError>;

    /// Delete everything stored for a trace
    async fn clear(&self, trace_id: &str) -> Result<(), CoreError> {
        debug!(trace_id, "Using default clear implementation (no-op)");
        Ok(())
    }
}

/// In-memory state machine for tests and single-node deployments
#[derive(Debug, Default)]
pub struct MemoryStateMachine {
    entries: DashMap<String, HashMap<String, Value>>,
}

impl MemoryStateMachine {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of traces holding at least one value
    pub fn trace_count(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl ExternalStateMachine for MemoryStateMachine {
    async fn put(&self, trace_id: &str, key: &str, value: Value) -> Result<(), CoreError> {
        self.entries
            .entry(trace_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, trace_id: &str, key: &str) -> Result<Option<Value>, CoreError> {
        Ok(self
            .entries
            .get(trace_id)
            .and_then(|scope| scope.get(key).cloned()))
    }

    async fn remove(&self, trace_id: &str, key: &str) -> Result<(), CoreError> {
        let now_empty = match self.entries.get_mut(trace_id) {
            Some(mut scope) => {
                scope.remove(key);
                scope.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.entries.remove_if(trace_id, |_, scope| scope.is_empty());
        }
        Ok(())
    }

    async fn clear(&self, trace_id: &str) -> Result<(), CoreError> {
        self.entries.remove(trace_id);
        Ok(())
    }
}

/// Apply the `ext:` writes of a mapping batch in order
pub async fn apply_ext_ops(
    machine: &dyn ExternalStateMachine,
    trace_id: &str,
    ops: &[ExtOp],
) -> Result<(), CoreError> {
    for op in ops {
        match op {
            ExtOp::Put { key, value } => machine.put(trace_id, key, value.clone()).await?,
            ExtOp::Remove { key } => machine.remove(trace_id, key).await?,
        }
    }
    Ok(())
}
