use async_trait::async_trait;
use eventflow_core::{
    EngineConfig, ErrorResponse, Execution, ExternalStateMachine, Flow, FlowDocument, FlowInstance, FlowResponse,
    FlowTimeoutHandler, Flows, MemoryStateMachine, NextTask, PipelineInfo, Routing, Task, TaskCall, TaskExecutor,
};
use eventflow_mapping::{MappingEvaluator, TaskResult, Value};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

const ORDER_FLOW: &str = include_str!("fixtures/order.yaml");

fn order_flow() -> Flow {
    let document: FlowDocument = serde_yaml::from_str(ORDER_FLOW).unwrap();
    EngineConfig::default().flow_from_document(document)
}

fn executor_for(flow: Flow) -> TaskExecutor {
    eventflow_monitoring::init_test_tracing();
    let flows = Flows::new();
    flows.load_flow(flow).unwrap();
    TaskExecutor::new(flows, Arc::new(MappingEvaluator::default()))
}

#[derive(Debug, Default)]
struct Outcome {
    order: Vec<String>,
    response: Option<FlowResponse>,
    error: Option<ErrorResponse>,
}

/// Minimal scheduler: dispatch every next task in order until the flow finishes
async fn drive<F>(executor: &TaskExecutor, instance: &FlowInstance, first: NextTask, mut function: F) -> Outcome
where
    F: FnMut(&TaskCall) -> TaskResult,
{
    let mut outcome = Outcome::default();
    let mut queue = VecDeque::from([first]);
    while let Some(next) = queue.pop_front() {
        let call = match executor.prepare(instance, &next).await {
            Ok(Some(call)) => call,
            Ok(None) => continue,
            Err(e) => {
                let routing = executor.fail_task(instance, &next, &e);
                queue.extend(routing.next);
                outcome.error = outcome.error.or(routing.error);
                continue;
            }
        };
        outcome.order.push(call.task.service.clone());
        let result = function(&call);
        let routing = executor.complete(instance, &call.task.service, call.seq, result).await;
        outcome.response = outcome.response.or(routing.response);
        outcome.error = outcome.error.or(routing.error);
        if routing.finished {
            break;
        }
        queue.extend(routing.next);
    }
    outcome
}

fn order_functions(call: &TaskCall) -> TaskResult {
    match call.task.service.as_str() {
        "check" => {
            let qty = call.body.as_map().and_then(|m| m.get("qty")).and_then(Value::to_long).unwrap_or(0);
            TaskResult::ok(json!({"valid": qty > 0}))
        }
        "price" => TaskResult::ok(json!({"amount": 42})),
        "stock" => TaskResult::ok(json!({"available": true})),
        _ => TaskResult::ok(json!({})),
    }
}

#[test]
fn order_fixture_is_valid() {
    let flow = order_flow();
    assert!(flow.validate().is_ok());
    assert_eq!(flow.task_count(), 10);
    assert_eq!(flow.task("price").map(|t| t.route()), Some("v1.price"));
    assert_eq!(flow.task("price").map(|t| t.execution), Some(Execution::Sink));
}

#[tokio::test]
async fn order_flow_runs_fork_join_and_loop() {
    let executor = executor_for(order_flow());
    let (instance, first) = executor
        .start("order", "c-100", Some("reply.inbox".to_string()), None, Value::from(json!({"body": {"qty": 3}})))
        .unwrap();

    let outcome = drive(&executor, &instance, first, order_functions).await;

    assert_eq!(
        outcome.order,
        vec!["check", "split", "price", "stock", "merge", "pack", "label", "pack", "label", "done"]
    );
    let response = outcome.response.unwrap();
    assert_eq!(response.status, 201);
    assert_eq!(response.body.to_json(), json!({"amount": 42, "available": true, "passes": 2}));
    assert_eq!(outcome.error, None);
    assert_eq!(instance.pipe_count(), 0);
    assert!(!instance.is_running());
    assert_eq!(executor.flows().instance_count(), 0);
}

#[tokio::test]
async fn order_flow_takes_second_branch() {
    let executor = executor_for(order_flow());
    let (instance, first) = executor
        .start("order", "c-101", None, None, Value::from(json!({"body": {"qty": 0}})))
        .unwrap();

    let outcome = drive(&executor, &instance, first, order_functions).await;

    assert_eq!(outcome.order, vec!["check", "reject"]);
    let response = outcome.response.unwrap();
    assert_eq!(response.status, 400);
    assert_eq!(response.body.to_json(), json!({"message": "bad quantity"}));
}

#[tokio::test]
async fn failed_branch_routes_to_flow_exception_handler() {
    let executor = executor_for(order_flow());
    let (instance, first) = executor
        .start("order", "c-102", None, None, Value::from(json!({"body": {"qty": 1}})))
        .unwrap();

    let mut handler_body = None;
    let outcome = drive(&executor, &instance, first, |call| match call.task.service.as_str() {
        "stock" => TaskResult::ok(json!({"message": "warehouse offline"})).with_status(503),
        "recover" => {
            handler_body = Some(call.body.to_json());
            let reason = call.body.as_map().and_then(|m| m.get("reason")).cloned().unwrap_or_default();
            TaskResult::ok(json!({"reason": reason.to_json()}))
        }
        _ => order_functions(call),
    })
    .await;

    assert_eq!(outcome.order, vec!["check", "split", "price", "stock", "recover"]);
    assert_eq!(handler_body, Some(json!({"code": 503, "reason": "warehouse offline"})));
    let response = outcome.response.unwrap();
    assert_eq!(response.status, 502);
    assert_eq!(response.body.to_json(), json!({"reason": "warehouse offline"}));
    assert_eq!(instance.pipe_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_fork_results_trigger_join_once() {
    const BRANCHES: usize = 16;
    let branches: Vec<String> = (0..BRANCHES).map(|i| format!("b{}", i)).collect();
    let mut flow = Flow::new("fan", "split", 10_000);
    flow.add_task(Task::new("split", Execution::Fork).with_next(branches.clone()).with_join("merge"));
    for name in &branches {
        flow.add_task(Task::new(name.clone(), Execution::Sink));
    }
    flow.add_task(Task::new("merge", Execution::End));

    let executor = Arc::new(executor_for(flow));
    let (instance, first) = executor.start("fan", "c-200", None, None, Value::Null).unwrap();
    executor.prepare(&instance, &first).await.unwrap().unwrap();
    let routing = executor.complete(&instance, "split", 0, TaskResult::ok(json!({}))).await;
    assert_eq!(routing.next.len(), BRANCHES);

    let mut calls = Vec::new();
    for next in &routing.next {
        calls.push(executor.prepare(&instance, next).await.unwrap().unwrap());
    }

    let handles: Vec<_> = calls
        .into_iter()
        .map(|call| {
            let executor = Arc::clone(&executor);
            let instance = Arc::clone(&instance);
            tokio::spawn(async move {
                executor
                    .complete(&instance, &call.task.service, call.seq, TaskResult::ok(json!({})))
                    .await
            })
        })
        .collect();

    let mut joins = 0;
    for handle in handles {
        let routing = handle.await.unwrap();
        joins += routing.next.iter().filter(|n| n.task == "merge").count();
    }
    assert_eq!(joins, 1);
    assert_eq!(instance.pipe_count(), 0);
    executor.flows().end_flow(&instance.id, true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_responders_reply_once() {
    let executor = executor_for(order_flow());
    let (instance, _) = executor.start("order", "c-201", None, None, Value::Null).unwrap();

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let instance = Arc::clone(&instance);
            tokio::spawn(async move { instance.try_respond() })
        })
        .collect();
    let mut replies = 0;
    for handle in handles {
        if handle.await.unwrap() {
            replies += 1;
        }
    }

    assert_eq!(replies, 1);
    assert!(!instance.is_not_responded());
    executor.flows().end_flow(&instance.id, true);
}

#[test]
fn pipeline_cursor_saturates() {
    for k in 1usize..=4 {
        let steps: Vec<String> = (0..k).map(|i| format!("s{}", i)).collect();
        let task = Arc::new(Task::new("p", Execution::Pipeline).with_pipeline(steps).with_next(["done"]));
        let pipeline = PipelineInfo::new(task);

        for _ in 0..k + 5 {
            let n = pipeline.next_step();
            assert!(n < k as i32);
        }
        assert_eq!(pipeline.pointer(), k as i32 - 1);

        pipeline.set_completed();
        pipeline.reset_pointer();
        assert_eq!(pipeline.pointer(), 0);
        assert!(!pipeline.is_completed());
    }
}

#[tokio::test]
async fn and_or_cast_in_end_task() {
    let mut flow = Flow::new("logic", "answer", 10_000);
    flow.add_task(Task::new("answer", Execution::End).with_output([
        "model.positive:and(model.negative) -> output.body.and",
        "model.positive:or(model.negative) -> output.body.or",
    ]));
    let executor = executor_for(flow);
    let (instance, first) = executor.start("logic", "c-300", None, None, Value::Null).unwrap();
    instance.model().set("model.positive", true).unwrap();
    instance.model().set("model.negative", false).unwrap();

    let call = executor.prepare(&instance, &first).await.unwrap().unwrap();
    let routing = executor.complete(&instance, &call.task.service, call.seq, TaskResult::ok(Value::Null)).await;

    let response = routing.response.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body.to_json(), json!({"and": false, "or": true}));
}

#[tokio::test]
async fn ext_writes_are_scoped_by_trace() {
    let mut flow = Flow::new("audit", "record", 10_000);
    flow.add_task(
        Task::new("record", Execution::End).with_output(["result.id -> ext:last_order", "result.id -> output.body.id"]),
    );
    let machine = Arc::new(MemoryStateMachine::new());
    let flows = Flows::new();
    flows.load_flow(flow).unwrap();
    let executor = TaskExecutor::new(flows, Arc::new(MappingEvaluator::default()))
        .with_state_machine(Arc::clone(&machine) as Arc<dyn ExternalStateMachine>);

    let (instance, first) = executor.start("audit", "c-400", None, None, Value::Null).unwrap();
    instance.set_trace(Some("trace-9".to_string()), Some("POST /orders".to_string())).unwrap();
    let call = executor.prepare(&instance, &first).await.unwrap().unwrap();
    let routing = executor
        .complete(&instance, &call.task.service, call.seq, TaskResult::ok(json!({"id": "ord-7"})))
        .await;

    assert!(routing.finished);
    assert_eq!(machine.get("trace-9", "last_order").await.unwrap(), Some(Value::from("ord-7")));
    assert_eq!(machine.trace_count(), 1);
}

#[tokio::test]
async fn sibling_sub_flows_share_parent_namespace() {
    let executor = executor_for(order_flow());
    let (parent, _) = executor.start("order", "c-500", None, None, Value::Null).unwrap();
    let (left, _) = executor.start("order", "c-500", None, Some(parent.id.as_str()), Value::Null).unwrap();
    let (right, _) = executor.start("order", "c-500", None, Some(parent.id.as_str()), Value::Null).unwrap();

    left.model().set("model.parent.reserved", 5).unwrap();
    assert_eq!(right.model().get("model.parent.reserved"), Some(Value::Int(5)));
    assert_eq!(parent.model().get("model.parent.reserved"), Some(Value::Int(5)));
    right.model().set("model.local", 1).unwrap();
    assert_eq!(left.model().get("model.local"), None);

    for instance in [&left, &right, &parent] {
        executor.flows().end_flow(&instance.id, true);
    }
    assert_eq!(executor.flows().instance_count(), 0);
}

#[tokio::test]
async fn single_step_pipeline_runs_its_step_once() {
    let mut flow = Flow::new("single", "loop", 10_000);
    flow.add_task(Task::new("loop", Execution::Pipeline).with_pipeline(["only"]).with_next(["done"]));
    flow.add_task(Task::new("only", Execution::Sink));
    flow.add_task(Task::new("done", Execution::End));
    let executor = executor_for(flow);
    let (instance, first) = executor.start("single", "c-600", None, None, Value::Null).unwrap();

    let outcome = drive(&executor, &instance, first, |_| TaskResult::ok(json!({}))).await;

    assert_eq!(outcome.order, vec!["loop", "only", "done"]);
    assert_eq!(outcome.response.map(|r| r.status), Some(200));
    assert_eq!(instance.pipe_count(), 0);
}

#[tokio::test]
async fn single_step_for_loop_runs_once_per_pass() {
    let mut flow = Flow::new("single", "loop", 10_000);
    flow.add_task(
        Task::new("loop", Execution::Pipeline)
            .with_pipeline(["only"])
            .with_for(&["model.n", "0"], &["model.n", "<", "3"], &["model.n", "++"])
            .with_next(["done"]),
    );
    flow.add_task(Task::new("only", Execution::Sink));
    flow.add_task(Task::new("done", Execution::End).with_output(["model.n -> output.body.passes"]));
    let executor = executor_for(flow);
    let (instance, first) = executor.start("single", "c-601", None, None, Value::Null).unwrap();

    let outcome = drive(&executor, &instance, first, |_| TaskResult::ok(json!({}))).await;

    assert_eq!(outcome.order, vec!["loop", "only", "only", "only", "done"]);
    assert_eq!(outcome.response.unwrap().body.to_json(), json!({"passes": 3}));
}

#[tokio::test]
async fn while_loop_repeats_until_flag_clears() {
    let mut flow = Flow::new("poll", "loop", 10_000);
    flow.add_task(
        Task::new("loop", Execution::Pipeline)
            .with_pipeline(["fetch", "tally"])
            .with_while("model.again")
            .with_next(["done"]),
    );
    flow.add_task(Task::new("fetch", Execution::Sink).with_output(["result.more -> model.again"]));
    flow.add_task(Task::new("tally", Execution::Sink));
    flow.add_task(Task::new("done", Execution::End).with_output(["model.again -> output.body.again"]));
    let executor = executor_for(flow);
    let (instance, first) = executor.start("poll", "c-602", None, None, Value::Null).unwrap();
    instance.model().set("model.again", true).unwrap();

    let mut fetches = 0;
    let outcome = drive(&executor, &instance, first, |call| {
        if call.task.service == "fetch" {
            fetches += 1;
            return TaskResult::ok(json!({"more": fetches < 3}));
        }
        TaskResult::ok(json!({}))
    })
    .await;

    assert_eq!(
        outcome.order,
        vec!["loop", "fetch", "tally", "fetch", "tally", "fetch", "tally", "done"]
    );
    assert_eq!(outcome.response.unwrap().body.to_json(), json!({"again": false}));
    assert_eq!(instance.pipe_count(), 0);
}

#[tokio::test]
async fn continue_condition_skips_rest_of_pass() {
    let mut flow = Flow::new("skip", "loop", 10_000);
    flow.add_task(
        Task::new("loop", Execution::Pipeline)
            .with_pipeline(["a", "b", "c"])
            .with_for(&["model.n", "0"], &["model.n", "<", "2"], &["model.n", "++"])
            .with_condition("model.skip", "continue")
            .with_next(["done"]),
    );
    flow.add_task(Task::new("a", Execution::Sink).with_output(["result.skip -> model.skip"]));
    flow.add_task(Task::new("b", Execution::Sink));
    flow.add_task(Task::new("c", Execution::Sink));
    flow.add_task(Task::new("done", Execution::End).with_output(["model.n -> output.body.passes"]));
    let executor = executor_for(flow);
    let (instance, first) = executor.start("skip", "c-603", None, None, Value::Null).unwrap();

    let mut passes = 0;
    let outcome = drive(&executor, &instance, first, |call| {
        if call.task.service == "a" {
            passes += 1;
            return TaskResult::ok(json!({"skip": passes == 1}));
        }
        TaskResult::ok(json!({}))
    })
    .await;

    assert_eq!(outcome.order, vec!["loop", "a", "a", "b", "c", "done"]);
    assert_eq!(outcome.response.unwrap().body.to_json(), json!({"passes": 2}));
}

#[derive(Default)]
struct TimeoutRecorder {
    seen: Mutex<Vec<(String, Option<ErrorResponse>)>>,
}

#[async_trait]
impl FlowTimeoutHandler for TimeoutRecorder {
    async fn on_timeout(&self, instance: Arc<FlowInstance>, response: Option<ErrorResponse>) {
        self.seen.lock().push((instance.id.clone(), response));
    }
}

#[tokio::test]
async fn timeout_while_task_runs_replies_408_and_drops_late_result() {
    let mut flow = Flow::new("slow", "work", 50);
    flow.add_task(Task::new("work", Execution::Sequential).with_next(["done"]));
    flow.add_task(Task::new("done", Execution::End));
    let executor = executor_for(flow);
    let recorder = Arc::new(TimeoutRecorder::default());
    executor.flows().set_timeout_handler(recorder.clone());
    let (instance, first) = executor.start("slow", "c-604", None, None, Value::Null).unwrap();
    let call = executor.prepare(&instance, &first).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        recorder.seen.lock().clone(),
        vec![(instance.id.clone(), Some(ErrorResponse::new(408, "Flow timeout for 50 ms")))]
    );
    assert!(executor.flows().get_flow_instance(&instance.id).is_none());

    let routing = executor
        .complete(&instance, &call.task.service, call.seq, TaskResult::ok(json!({})))
        .await;
    assert_eq!(routing, Routing::default());
    assert!(executor.prepare(&instance, &NextTask::new("done")).await.unwrap().is_none());
}

#[tokio::test]
async fn parallel_branches_reaching_same_task_each_run_it() {
    let mut flow = Flow::new("spread", "spread", 10_000);
    flow.add_task(Task::new("spread", Execution::Parallel).with_next(["left", "right"]));
    flow.add_task(Task::new("left", Execution::Sequential).with_next(["notify"]));
    flow.add_task(Task::new("right", Execution::Sequential).with_next(["notify"]));
    flow.add_task(Task::new("notify", Execution::Sequential).with_next(["done"]));
    flow.add_task(Task::new("done", Execution::End));
    let executor = executor_for(flow);
    let (instance, first) = executor.start("spread", "c-605", None, None, Value::Null).unwrap();

    executor.prepare(&instance, &first).await.unwrap().unwrap();
    let branches = executor.complete(&instance, "spread", 0, TaskResult::ok(json!({}))).await.next;
    let mut calls = Vec::new();
    for next in &branches {
        calls.push(executor.prepare(&instance, next).await.unwrap().unwrap());
    }
    let mut notify = Vec::new();
    for call in &calls {
        let routing = executor.complete(&instance, &call.task.service, call.seq, TaskResult::ok(json!({}))).await;
        notify.extend(routing.next);
    }
    assert_eq!(notify.iter().map(|n| n.task.as_str()).collect::<Vec<_>>(), vec!["notify", "notify"]);

    let mut notify_calls = Vec::new();
    for next in &notify {
        notify_calls.push(executor.prepare(&instance, next).await.unwrap().unwrap());
    }
    assert_eq!(instance.pending_count(), 2);

    let mut done = 0;
    for call in &notify_calls {
        let routing = executor.complete(&instance, &call.task.service, call.seq, TaskResult::ok(json!({}))).await;
        done += routing.next.iter().filter(|n| n.task == "done").count();
    }
    assert_eq!(done, 2);
    assert_eq!(instance.pending_count(), 0);

    let duplicate = executor.complete(&instance, "notify", 0, TaskResult::ok(json!({}))).await;
    assert_eq!(duplicate, Routing::default());
    executor.flows().end_flow(&instance.id, true);
}
