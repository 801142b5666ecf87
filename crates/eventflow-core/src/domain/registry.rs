use crate::domain::flow::Flow;
use crate::domain::flow_instance::FlowInstance;
use crate::domain::timeout::FlowTimeoutHandler;
use crate::CoreError;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Default)]
struct FlowsInner {
    flows: DashMap<String, Arc<Flow>>,
    instances: DashMap<String, Arc<FlowInstance>>,
    timeout_handler: RwLock<Option<Arc<dyn FlowTimeoutHandler>>>,
}

/// Registry of flow templates and live flow instances.
///
/// Cloning is cheap and every clone sees the same registry.
#[derive(Clone, Default)]
pub struct Flows {
    inner: Arc<FlowsInner>,
}

impl fmt::Debug for Flows {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flows")
            .field("flows", &self.inner.flows.len())
            .field("instances", &self.inner.instances.len())
            .finish()
    }
}

impl Flows {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the receiver of flow timeouts
    pub fn set_timeout_handler(&self, handler: Arc<dyn FlowTimeoutHandler>) {
        *self.inner.timeout_handler.write() = Some(handler);
    }

    pub(crate) fn timeout_handler(&self) -> Option<Arc<dyn FlowTimeoutHandler>> {
        self.inner.timeout_handler.read().clone()
    }

    /// Register a flow template, replacing any with the same id
    pub fn add_flow(&self, flow: Flow) -> Arc<Flow> {
        let flow = Arc::new(flow);
        debug!(flow_id = %flow.id, tasks = flow.task_count(), "Flow registered");
        self.inner.flows.insert(flow.id.clone(), Arc::clone(&flow));
        flow
    }

    /// Validate a template, then register it
    pub fn load_flow(&self, flow: Flow) -> Result<Arc<Flow>, CoreError> {
        flow.validate()?;
        Ok(self.add_flow(flow))
    }

    /// Flow template by id
    pub fn get_flow(&self, id: &str) -> Option<Arc<Flow>> {
        self.inner.flows.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a template is registered
    pub fn flow_exists(&self, id: &str) -> bool {
        self.inner.flows.contains_key(id)
    }

    /// Registered template ids, sorted
    pub fn get_all_flows(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.flows.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Track a live instance
    pub fn add_flow_instance(&self, instance: Arc<FlowInstance>) {
        self.inner.instances.insert(instance.id.clone(), instance);
    }

    /// Live instance by id. An empty id is never found.
    pub fn get_flow_instance(&self, id: &str) -> Option<Arc<FlowInstance>> {
        if id.is_empty() {
            return None;
        }
        self.inner.instances.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live instances
    pub fn instance_count(&self) -> usize {
        self.inner.instances.len()
    }

    /// Stop tracking an instance. Idempotent.
    pub fn close_flow_instance(&self, id: &str) -> Option<Arc<FlowInstance>> {
        self.inner.instances.remove(id).map(|(_, instance)| instance)
    }

    /// Create, register and return an instance of a template
    pub fn create_instance(
        &self,
        flow: Arc<Flow>,
        cid: impl Into<String>,
        reply_to: Option<String>,
        parent_id: Option<&str>,
    ) -> Result<Arc<FlowInstance>, CoreError> {
        let instance = FlowInstance::new(flow, cid, reply_to, parent_id, self)?;
        self.add_flow_instance(Arc::clone(&instance));
        Ok(instance)
    }

    /// Create an instance of a registered template by id
    pub fn start_flow(
        &self,
        flow_id: &str,
        cid: impl Into<String>,
        reply_to: Option<String>,
        parent_id: Option<&str>,
    ) -> Result<Arc<FlowInstance>, CoreError> {
        let flow = self
            .get_flow(flow_id)
            .ok_or_else(|| CoreError::FlowNotFound(flow_id.to_string()))?;
        self.create_instance(flow, cid, reply_to, parent_id)
    }

    /// Finish an instance: log its outcome, close it and stop tracking it
    pub fn end_flow(&self, id: &str, success: bool) {
        if let Some(instance) = self.close_flow_instance(id) {
            info!(
                flow_id = %instance.flow().id,
                instance_id = %instance.id,
                success,
                elapsed_ms = instance.elapsed_ms(),
                "Flow finished"
            );
            instance.close();
        }
    }
}
