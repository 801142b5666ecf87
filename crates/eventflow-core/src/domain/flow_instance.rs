use crate::domain::flow::Flow;
use crate::domain::pipe::PipeInfo;
use crate::domain::registry::Flows;
use crate::domain::timeout;
use crate::CoreError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use eventflow_mapping::{ModelStore, Value};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Error payload delivered when a flow aborts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP-style status
    pub status: i32,
    /// Human-readable reason
    pub message: String,
    /// Always `"error"`
    #[serde(rename = "type")]
    pub kind: String,
}

impl ErrorResponse {
    /// Build an error payload
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            kind: "error".to_string(),
        }
    }

    /// Payload as a mapping value
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("status".to_string(), Value::Int(self.status));
        map.insert("message".to_string(), Value::Text(self.message.clone()));
        map.insert("type".to_string(), Value::Text(self.kind.clone()));
        Value::Map(map)
    }
}

#[derive(Debug, Default, Clone)]
struct TraceInfo {
    id: Option<String>,
    path: Option<String>,
}

/// Live execution of one flow template.
///
/// Every field is individually thread-safe: task callbacks may touch the
/// same instance from different workers at the same time.
#[derive(Debug)]
pub struct FlowInstance {
    /// Instance id, a UUID without dashes
    pub id: String,
    /// Correlation id of the original request
    pub cid: String,
    /// Reply address of the caller, if any
    pub reply_to: Option<String>,
    flow: Arc<Flow>,
    parent_id: Option<String>,
    model: ModelStore,
    input: RwLock<Value>,
    pipe_counter: AtomicI32,
    pipe_map: DashMap<i32, Arc<PipeInfo>>,
    pending_tasks: DashMap<String, usize>,
    trace: RwLock<TraceInfo>,
    start: DateTime<Utc>,
    responded: AtomicBool,
    running: AtomicBool,
    timeout_watcher: Mutex<Option<JoinHandle<()>>>,
}

impl FlowInstance {
    /// Create an instance and start its time-to-live watcher.
    ///
    /// With a `parent_id` the instance shares the parent namespace of the
    /// root of that parent's chain. Must be called inside a tokio runtime.
    pub fn new(
        flow: Arc<Flow>,
        cid: impl Into<String>,
        reply_to: Option<String>,
        parent_id: Option<&str>,
        flows: &Flows,
    ) -> Result<Arc<Self>, CoreError> {
        let id = Uuid::new_v4().simple().to_string();
        let cid = cid.into();

        let (model, parent_id) = match parent_id {
            Some(pid) if !pid.is_empty() => {
                let root = resolve_root(flows, pid)?;
                (ModelStore::with_shared(root.model.shared()), Some(root.id.clone()))
            }
            _ => (ModelStore::new(), None),
        };
        model.set("model.instance", id.as_str())?;
        model.set("model.cid", cid.as_str())?;
        model.set("model.flow", flow.id.as_str())?;

        let instance = Arc::new(Self {
            id,
            cid,
            reply_to,
            flow,
            parent_id,
            model,
            input: RwLock::new(Value::Null),
            pipe_counter: AtomicI32::new(0),
            pipe_map: DashMap::new(),
            pending_tasks: DashMap::new(),
            trace: RwLock::new(TraceInfo::default()),
            start: Utc::now(),
            responded: AtomicBool::new(false),
            running: AtomicBool::new(true),
            timeout_watcher: Mutex::new(None),
        });

        let watcher = timeout::spawn_watcher(&instance, flows.clone())?;
        *instance.timeout_watcher.lock() = Some(watcher);

        debug!(
            flow_id = %instance.flow.id,
            instance_id = %instance.id,
            parent_id = ?instance.parent_id,
            ttl_ms = instance.flow.ttl,
            "Flow instance created"
        );
        Ok(instance)
    }

    /// Flow template
    pub fn flow(&self) -> &Arc<Flow> {
        &self.flow
    }

    /// Live model
    pub fn model(&self) -> &ModelStore {
        &self.model
    }

    /// Root instance whose shared namespace this instance uses
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// Original request dataset
    pub fn input(&self) -> Value {
        self.input.read().clone()
    }

    /// Store the original request dataset
    pub fn set_input(&self, input: impl Into<Value>) {
        *self.input.write() = input.into();
    }

    /// Attach trace context and expose the trace id as `model.trace`
    pub fn set_trace(&self, trace_id: Option<String>, trace_path: Option<String>) -> Result<(), CoreError> {
        if let Some(id) = &trace_id {
            self.model.set("model.trace", id.as_str())?;
        }
        *self.trace.write() = TraceInfo {
            id: trace_id,
            path: trace_path,
        };
        Ok(())
    }

    /// Trace id, if any
    pub fn trace_id(&self) -> Option<String> {
        self.trace.read().id.clone()
    }

    /// Trace path, if any
    pub fn trace_path(&self) -> Option<String> {
        self.trace.read().path.clone()
    }

    /// Creation time
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start
    }

    /// Milliseconds since creation
    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.start).num_milliseconds()
    }

    /// Allocate the next pipe sequence number, starting at 1
    pub fn next_pipe_id(&self) -> i32 {
        self.pipe_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Register a pipeline or join under `seq`
    pub fn add_pipe(&self, seq: i32, pipe: PipeInfo) -> Arc<PipeInfo> {
        let pipe = Arc::new(pipe);
        self.pipe_map.insert(seq, Arc::clone(&pipe));
        pipe
    }

    /// Pipe registered under `seq`
    pub fn get_pipe(&self, seq: i32) -> Option<Arc<PipeInfo>> {
        self.pipe_map.get(&seq).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop the pipe registered under `seq`
    pub fn remove_pipe(&self, seq: i32) -> Option<Arc<PipeInfo>> {
        self.pipe_map.remove(&seq).map(|(_, pipe)| pipe)
    }

    /// Drop every pipe
    pub fn clear_pipes(&self) {
        self.pipe_map.clear();
    }

    /// Number of live pipes
    pub fn pipe_count(&self) -> usize {
        self.pipe_map.len()
    }

    /// Mark one run of a task as awaiting its result. Returns the number of runs in flight.
    pub fn add_pending(&self, name: impl Into<String>) -> usize {
        let mut runs = self.pending_tasks.entry(name.into()).or_insert(0);
        *runs += 1;
        *runs
    }

    /// Settle one run of a task. Returns `false` for a late or duplicate result.
    pub fn remove_pending(&self, name: &str) -> bool {
        let Some(mut runs) = self.pending_tasks.get_mut(name) else {
            return false;
        };
        if *runs == 0 {
            return false;
        }
        *runs -= 1;
        let settled = *runs == 0;
        drop(runs);
        if settled {
            self.pending_tasks.remove_if(name, |_, runs| *runs == 0);
        }
        true
    }

    /// Whether a task is awaiting its result
    pub fn is_pending(&self, name: &str) -> bool {
        self.pending_tasks.get(name).map(|runs| *runs > 0).unwrap_or(false)
    }

    /// Number of task runs awaiting results
    pub fn pending_count(&self) -> usize {
        self.pending_tasks.iter().map(|entry| *entry.value()).sum()
    }

    /// Whether the caller has not been answered yet
    pub fn is_not_responded(&self) -> bool {
        !self.responded.load(Ordering::Acquire)
    }

    /// Flip the responded latch. Returns `true` only for the caller that flipped it.
    pub fn try_respond(&self) -> bool {
        self.responded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Abort the flow with an error.
    ///
    /// Yields the error payload to deliver, or `None` when a response was
    /// already sent.
    pub fn abort(&self, status: i32, message: impl Into<String>) -> Option<ErrorResponse> {
        let message = message.into();
        if self.try_respond() {
            info!(
                flow_id = %self.flow.id,
                instance_id = %self.id,
                status,
                reason = %message,
                "Flow aborted"
            );
            Some(ErrorResponse::new(status, message))
        } else {
            debug!(instance_id = %self.id, status, "Abort ignored, already responded");
            None
        }
    }

    /// Whether the instance is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop the instance and cancel its timeout watcher. Idempotent.
    pub fn close(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(watcher) = self.timeout_watcher.lock().take() {
                watcher.abort();
            }
            debug!(instance_id = %self.id, "Flow instance closed");
        }
    }

    pub(crate) fn disarm_watcher(&self) {
        self.timeout_watcher.lock().take();
    }
}

fn resolve_root(flows: &Flows, parent_id: &str) -> Result<Arc<FlowInstance>, CoreError> {
    let mut visited = HashSet::new();
    let mut current = flows
        .get_flow_instance(parent_id)
        .ok_or_else(|| CoreError::FlowInstanceNotFound(parent_id.to_string()))?;
    loop {
        if !visited.insert(current.id.clone()) {
            return Err(CoreError::ParentCycle(current.id.clone()));
        }
        let next = match current.parent_id() {
            None => return Ok(current),
            Some(pid) => flows
                .get_flow_instance(pid)
                .ok_or_else(|| CoreError::FlowInstanceNotFound(pid.to_string()))?,
        };
        current = next;
    }
}
