use crate::domain::flow_instance::{ErrorResponse, FlowInstance};
use crate::domain::registry::Flows;
use crate::CoreError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::warn;

/// Status delivered when a flow outlives its time-to-live
pub const TIMEOUT_STATUS: i32 = 408;

/// Receives flow timeouts, typically the scheduler that owns the caller's reply.
#[async_trait]
pub trait FlowTimeoutHandler: Send + Sync {
    /// Called once per expired instance, before it is closed and removed.
    ///
    /// `response` carries the 408 payload to send, or `None` when the
    /// caller was already answered.
    async fn on_timeout(&self, instance: Arc<FlowInstance>, response: Option<ErrorResponse>);
}

/// Spawn the watcher that expires `instance` after its flow's ttl.
pub(crate) fn spawn_watcher(instance: &Arc<FlowInstance>, flows: Flows) -> Result<JoinHandle<()>, CoreError> {
    let runtime = Handle::try_current().map_err(|e| CoreError::TimerError(e.to_string()))?;
    let ttl = instance.flow().ttl;
    let weak = Arc::downgrade(instance);

    Ok(runtime.spawn(async move {
        tokio::time::sleep(Duration::from_millis(ttl)).await;
        if let Some(instance) = weak.upgrade() {
            instance.disarm_watcher();
            expire(&flows, instance).await;
        }
    }))
}

async fn expire(flows: &Flows, instance: Arc<FlowInstance>) {
    if !instance.is_running() {
        return;
    }
    let ttl = instance.flow().ttl;
    warn!(
        flow_id = %instance.flow().id,
        instance_id = %instance.id,
        ttl_ms = ttl,
        "Flow expired"
    );
    let response = instance.abort(TIMEOUT_STATUS, format!("Flow timeout for {} ms", ttl));
    if let Some(handler) = flows.timeout_handler() {
        handler.on_timeout(Arc::clone(&instance), response).await;
    }
    flows.end_flow(&instance.id, false);
}
