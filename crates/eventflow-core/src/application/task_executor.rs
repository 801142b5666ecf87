use crate::application::routing::{
    continue_pipe, error_dataset, next_after, resolve_delay, resolve_exception_handler, NextTask,
};
use crate::domain::flow_instance::{ErrorResponse, FlowInstance};
use crate::domain::registry::Flows;
use crate::domain::shared_state::{apply_ext_ops, ExternalStateMachine};
use crate::domain::task::{Execution, Task};
use crate::CoreError;
use eventflow_mapping::{ExtOp, MappingEvaluator, TaskResult, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Everything a scheduler needs to invoke one task
#[derive(Debug, Clone)]
pub struct TaskCall {
    /// Task template
    pub task: Arc<Task>,
    /// Function to invoke
    pub route: String,
    /// Pipe sequence to hand back on completion
    pub seq: i32,
    /// Call body
    pub body: Value,
    /// Call headers
    pub headers: BTreeMap<String, String>,
    /// Milliseconds to wait before the call
    pub delay_ms: Option<u64>,
}

/// Reply produced by a response or end task
#[derive(Debug, Clone, PartialEq)]
pub struct FlowResponse {
    /// Reply status
    pub status: i32,
    /// Reply headers
    pub headers: BTreeMap<String, String>,
    /// Reply body
    pub body: Value,
}

impl FlowResponse {
    fn from_output(output: &Value) -> Self {
        let status = match output.as_map().and_then(|m| m.get("status")) {
            Some(v) => v.to_long().filter(|s| *s > 0).map(|s| s as i32).unwrap_or(200),
            None => 200,
        };
        let headers = output
            .as_map()
            .and_then(|m| m.get("header"))
            .and_then(Value::as_map)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.to_text())).collect())
            .unwrap_or_default();
        let body = output
            .as_map()
            .and_then(|m| m.get("body"))
            .cloned()
            .unwrap_or_default();
        Self { status, headers, body }
    }
}

/// What the scheduler does after a task completed
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Routing {
    /// Tasks to dispatch
    pub next: Vec<NextTask>,
    /// Reply to send to the caller
    pub response: Option<FlowResponse>,
    /// Error reply to send to the caller
    pub error: Option<ErrorResponse>,
    /// Whether the flow finished and left the registry
    pub finished: bool,
}

impl Routing {
    fn dispatch(next: Vec<NextTask>) -> Self {
        Self {
            next,
            ..Self::default()
        }
    }
}

/// Drives flow instances from one task to the next.
///
/// Performs no I/O of its own: the caller invokes the functions named by
/// each [`TaskCall`] and reports their results through [`TaskExecutor::complete`].
pub struct TaskExecutor {
    flows: Flows,
    evaluator: Arc<MappingEvaluator>,
    state_machine: Option<Arc<dyn ExternalStateMachine>>,
}

impl TaskExecutor {
    /// Executor over a registry and a mapping evaluator
    pub fn new(flows: Flows, evaluator: Arc<MappingEvaluator>) -> Self {
        Self {
            flows,
            evaluator,
            state_machine: None,
        }
    }

    /// Route `ext:` writes to an external state machine
    pub fn with_state_machine(mut self, state_machine: Arc<dyn ExternalStateMachine>) -> Self {
        self.state_machine = Some(state_machine);
        self
    }

    /// Registry this executor works on
    pub fn flows(&self) -> &Flows {
        &self.flows
    }

    /// Create an instance of a registered flow and return its first task
    pub fn start(
        &self,
        flow_id: &str,
        cid: &str,
        reply_to: Option<String>,
        parent_id: Option<&str>,
        input: Value,
    ) -> Result<(Arc<FlowInstance>, NextTask), CoreError> {
        let instance = self.flows.start_flow(flow_id, cid, reply_to, parent_id)?;
        instance.set_input(input);
        info!(flow_id, instance_id = %instance.id, cid, "Flow started");
        let first = NextTask::new(instance.flow().first_task.clone());
        Ok((instance, first))
    }

    /// Build the call for `next` and mark one run of it pending.
    ///
    /// Returns `None` when the instance has stopped. Branches reaching the
    /// same task each get their own run.
    pub async fn prepare(&self, instance: &FlowInstance, next: &NextTask) -> Result<Option<TaskCall>, CoreError> {
        if !instance.is_running() {
            return Ok(None);
        }
        let task = instance
            .flow()
            .task(&next.task)
            .cloned()
            .ok_or_else(|| CoreError::TaskNotFound(next.task.clone()))?;
        instance.add_pending(&task.service);

        let input = instance.input();
        let built = match self
            .evaluator
            .build_input(&task.input, instance.model(), &input, next.error.as_ref())
        {
            Ok(built) => built,
            Err(e) => {
                instance.remove_pending(&task.service);
                return Err(e.into());
            }
        };
        self.apply_ext(instance, &built.ext_ops).await?;

        let delay_ms = resolve_delay(&task, instance.model(), instance.flow().ttl);
        debug!(
            instance_id = %instance.id,
            task = %task.service,
            route = task.route(),
            seq = next.seq,
            delay_ms = ?delay_ms,
            "Task prepared"
        );
        Ok(Some(TaskCall {
            route: task.route().to_string(),
            seq: next.seq,
            body: built.body,
            headers: built.headers,
            delay_ms,
            task,
        }))
    }

    /// Fold a task result into the instance and decide what happens next
    pub async fn complete(&self, instance: &FlowInstance, task_name: &str, seq: i32, result: TaskResult) -> Routing {
        if !instance.is_running() {
            debug!(instance_id = %instance.id, task = task_name, "Result for a stopped flow ignored");
            return Routing::default();
        }
        if !instance.remove_pending(task_name) {
            debug!(instance_id = %instance.id, task = task_name, "Late or duplicate result ignored");
            return Routing::default();
        }
        let Some(task) = instance.flow().task(task_name).cloned() else {
            error!(instance_id = %instance.id, task = task_name, "Result for an undefined task");
            return self.abort(instance, 500, format!("Task {} not defined", task_name));
        };

        if result.status >= 400 {
            let message = match &result.body {
                Value::Map(map) => map.get("message").map(Value::to_text).unwrap_or_else(|| result.body.to_text()),
                other => other.to_text(),
            };
            warn!(
                instance_id = %instance.id,
                task = %task.service,
                status = result.status,
                reason = %message,
                "Task failed"
            );
            return self.fail(instance, &task, seq, result.status, message);
        }

        let input = instance.input();
        let output = match self
            .evaluator
            .apply_output(&task.output, instance.model(), &input, &result)
        {
            Ok(output) => output,
            Err(e) => {
                error!(instance_id = %instance.id, task = %task.service, error = %e, "Output mapping failed");
                let err = CoreError::from(e);
                return self.fail(instance, &task, seq, err.status(), err.to_string());
            }
        };
        if let Err(e) = self.apply_ext(instance, &output.ext_ops).await {
            return self.fail(instance, &task, seq, e.status(), e.to_string());
        }

        match continue_pipe(instance, seq) {
            Ok(Some(next)) => return Routing::dispatch(next),
            Ok(None) => {}
            Err(e) => return self.abort(instance, e.status(), e.to_string()),
        }

        let mut routing = Routing::default();
        if matches!(task.execution, Execution::Response | Execution::End) && instance.try_respond() {
            routing.response = Some(FlowResponse::from_output(&output.output));
        }
        if task.execution == Execution::End {
            self.flows.end_flow(&instance.id, true);
            routing.finished = true;
            return routing;
        }
        match next_after(instance, &task, output.decision.as_ref()) {
            Ok(next) => routing.next = next,
            Err(e) => {
                error!(instance_id = %instance.id, task = %task.service, error = %e, "Unable to route");
                let aborted = self.abort(instance, e.status(), e.to_string());
                routing.error = aborted.error;
                routing.finished = true;
            }
        }
        routing
    }

    /// Route a failure raised while preparing `next`
    pub fn fail_task(&self, instance: &FlowInstance, next: &NextTask, err: &CoreError) -> Routing {
        match instance.flow().task(&next.task).cloned() {
            Some(task) => self.fail(instance, &task, next.seq, err.status(), err.to_string()),
            None => self.abort(instance, err.status(), err.to_string()),
        }
    }

    fn fail(&self, instance: &FlowInstance, task: &Task, seq: i32, status: i32, message: String) -> Routing {
        match resolve_exception_handler(instance, task, seq) {
            Some(handler) if handler != task.service => {
                debug!(instance_id = %instance.id, task = %task.service, handler = %handler, "Routing to exception handler");
                Routing::dispatch(vec![NextTask::handler(handler, error_dataset(status, &message))])
            }
            _ => self.abort(instance, status, message),
        }
    }

    fn abort(&self, instance: &FlowInstance, status: i32, message: String) -> Routing {
        let error = instance.abort(status, message);
        self.flows.end_flow(&instance.id, false);
        Routing {
            error,
            finished: true,
            ..Routing::default()
        }
    }

    async fn apply_ext(&self, instance: &FlowInstance, ops: &[ExtOp]) -> Result<(), CoreError> {
        if ops.is_empty() {
            return Ok(());
        }
        let Some(machine) = &self.state_machine else {
            warn!(instance_id = %instance.id, count = ops.len(), "No external state machine for ext: writes");
            return Ok(());
        };
        let scope = instance.trace_id().unwrap_or_else(|| instance.id.clone());
        apply_ext_ops(machine.as_ref(), &scope, ops).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::Flow;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn executor(flow: Flow) -> TaskExecutor {
        let flows = Flows::new();
        flows.load_flow(flow).unwrap();
        TaskExecutor::new(flows, Arc::new(MappingEvaluator::default()))
    }

    fn hello() -> Flow {
        let mut flow = Flow::new("hello", "greet", 60_000);
        flow.add_task(
            Task::new("greet", Execution::End)
                .with_route("v1.greet")
                .with_input(["input.body.name -> name"])
                .with_output(["result.text -> output.body.message", "int(201) -> output.status"]),
        );
        flow
    }

    #[tokio::test]
    async fn test_single_task_flow() {
        let executor = executor(hello());
        let (instance, first) = executor
            .start("hello", "c-1", None, None, Value::from(json!({"body": {"name": "ada"}})))
            .unwrap();

        let call = executor.prepare(&instance, &first).await.unwrap().unwrap();
        assert_eq!(call.route, "v1.greet");
        assert_eq!(call.body.to_json(), json!({"name": "ada"}));
        assert!(instance.is_pending("greet"));

        let routing = executor
            .complete(&instance, "greet", call.seq, TaskResult::ok(json!({"text": "hi ada"})))
            .await;

        assert!(routing.finished);
        assert!(routing.next.is_empty());
        let response = routing.response.unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.body.to_json(), json!({"message": "hi ada"}));
        assert_eq!(executor.flows().instance_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_result_ignored() {
        let executor = executor(hello());
        let (instance, first) = executor.start("hello", "c-2", None, None, Value::Null).unwrap();
        executor.prepare(&instance, &first).await.unwrap();

        let result = TaskResult::ok(json!({"text": "x"}));
        let first_routing = executor.complete(&instance, "greet", 0, result.clone()).await;
        let second_routing = executor.complete(&instance, "greet", 0, result).await;

        assert!(first_routing.response.is_some());
        assert_eq!(second_routing, Routing::default());
    }

    #[tokio::test]
    async fn test_failure_without_handler_aborts() {
        let executor = executor(hello());
        let (instance, first) = executor.start("hello", "c-3", None, None, Value::Null).unwrap();
        executor.prepare(&instance, &first).await.unwrap();

        let routing = executor
            .complete(
                &instance,
                "greet",
                0,
                TaskResult::ok(json!({"message": "upstream down"})).with_status(503),
            )
            .await;

        assert_eq!(routing.error, Some(ErrorResponse::new(503, "upstream down")));
        assert!(routing.finished);
        assert!(!instance.is_running());
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let executor = executor(hello());
        let (instance, _) = executor.start("hello", "c-4", None, None, Value::Null).unwrap();
        let err = executor.prepare(&instance, &NextTask::new("ghost")).await.unwrap_err();
        assert_eq!(err, CoreError::TaskNotFound("ghost".to_string()));

        let routing = executor.fail_task(&instance, &NextTask::new("ghost"), &err);
        assert_eq!(routing.error, Some(ErrorResponse::new(500, "Task not found: ghost")));
    }
}
