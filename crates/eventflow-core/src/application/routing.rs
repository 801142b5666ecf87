//! Continuation rules applied after a task returns
//!
//! Given the task that finished and the pipe it ran under, these helpers
//! decide which task(s) run next and keep the instance's pipe map in step.

use crate::domain::flow_instance::FlowInstance;
use crate::domain::pipe::{JoinTaskInfo, PipeInfo, PipelineInfo};
use crate::domain::task::{Execution, LoopType, Task};
use crate::CoreError;
use eventflow_mapping::operators::str_to_int;
use eventflow_mapping::{ModelStore, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

const CONTINUE: &str = "continue";
const BREAK: &str = "break";

/// A task to dispatch next
#[derive(Debug, Clone, PartialEq)]
pub struct NextTask {
    /// Task name
    pub task: String,
    /// Pipe sequence the task runs under, 0 for none
    pub seq: i32,
    /// Error map for an exception handler
    pub error: Option<Value>,
}

impl NextTask {
    /// Task outside any pipe
    pub fn new(task: impl Into<String>) -> Self {
        Self::in_pipe(task, 0)
    }

    /// Task running under pipe `seq`
    pub fn in_pipe(task: impl Into<String>, seq: i32) -> Self {
        Self {
            task: task.into(),
            seq,
            error: None,
        }
    }

    /// Exception handler receiving `error`
    pub fn handler(task: impl Into<String>, error: Value) -> Self {
        Self {
            task: task.into(),
            seq: 0,
            error: Some(error),
        }
    }
}

/// Outcome of one pipeline decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStep {
    /// Run the next step of the current pass
    Next {
        /// Step name
        task: String,
        /// Pipe sequence
        seq: i32,
    },
    /// Start another pass at the first step
    Repeat {
        /// First step name
        task: String,
        /// Pipe sequence
        seq: i32,
    },
    /// Leave the pipeline
    Exit {
        /// Exit task, if the pipeline has one
        task: Option<String>,
    },
}

impl PipelineStep {
    /// Tasks to dispatch for this outcome
    pub fn into_next(self) -> Vec<NextTask> {
        match self {
            PipelineStep::Next { task, seq } | PipelineStep::Repeat { task, seq } => {
                vec![NextTask::in_pipe(task, seq)]
            }
            PipelineStep::Exit { task } => task.map(NextTask::new).into_iter().collect(),
        }
    }
}

/// Map a decision value to a 1-based branch index.
///
/// `true` selects branch 1 and `false` branch 2. Numbers below 1 select
/// branch 1. Anything else, or an index past the last branch, is invalid.
pub fn resolve_decision(task: &Task, value: Option<&Value>) -> Result<usize, CoreError> {
    let branches = task.next_steps.len();
    let value = value.filter(|v| !v.is_null());
    let number = match value {
        Some(Value::Bool(true)) => 1,
        Some(Value::Bool(false)) => 2,
        Some(v) => str_to_int(&v.to_text()).max(1) as usize,
        None => branches + 1,
    };
    if number > branches {
        let shown = value.map(Value::to_text).unwrap_or_else(|| "null".to_string());
        return Err(CoreError::InvalidDecision(format!(
            "Task {} returned invalid decision ({})",
            task.service, shown
        )));
    }
    Ok(number)
}

/// Tasks that follow `task` according to its execution kind.
///
/// Forks register a join in the instance pipe map and pipelines register
/// their cursor, so this is not free of side effects.
pub fn next_after(
    instance: &FlowInstance,
    task: &Arc<Task>,
    decision: Option<&Value>,
) -> Result<Vec<NextTask>, CoreError> {
    if task.is_pipeline() {
        return Ok(start_pipeline(instance, task)?.into_next());
    }
    let next = match task.execution {
        Execution::End | Execution::Sink => Vec::new(),
        Execution::Sequential | Execution::Response => {
            task.next_steps.first().map(NextTask::new).into_iter().collect()
        }
        Execution::Decision => {
            let n = resolve_decision(task, decision)?;
            vec![NextTask::new(&task.next_steps[n - 1])]
        }
        Execution::Parallel => task.next_steps.iter().map(NextTask::new).collect(),
        Execution::Fork => match &task.join_task {
            Some(join) if !task.next_steps.is_empty() => {
                let seq = instance.next_pipe_id();
                instance.add_pipe(seq, PipeInfo::Join(JoinTaskInfo::new(task.next_steps.len(), join)));
                debug!(
                    instance_id = %instance.id,
                    task = %task.service,
                    seq,
                    forks = task.next_steps.len(),
                    "Fork started"
                );
                task.next_steps.iter().map(|n| NextTask::in_pipe(n, seq)).collect()
            }
            _ => Vec::new(),
        },
        Execution::Pipeline => Vec::new(),
    };
    Ok(next)
}

/// Continue the pipe a finished task ran under.
///
/// Returns `None` when `seq` names no live pipe, in which case the task's own
/// execution kind applies.
pub fn continue_pipe(instance: &FlowInstance, seq: i32) -> Result<Option<Vec<NextTask>>, CoreError> {
    if seq <= 0 {
        return Ok(None);
    }
    let Some(pipe) = instance.get_pipe(seq) else {
        return Ok(None);
    };
    match &*pipe {
        PipeInfo::Join(join) => {
            if join.record_result() {
                instance.remove_pipe(seq);
                debug!(instance_id = %instance.id, seq, join_task = join.join_task(), "Join complete");
                Ok(Some(vec![NextTask::new(join.join_task())]))
            } else {
                Ok(Some(Vec::new()))
            }
        }
        PipeInfo::Pipeline(pipeline) => Ok(Some(advance_pipeline(instance, seq, pipeline)?.into_next())),
    }
}

/// Evaluate a pipeline task's entry condition and register its cursor
pub fn start_pipeline(instance: &FlowInstance, task: &Arc<Task>) -> Result<PipelineStep, CoreError> {
    let model = instance.model();
    let valid = match task.loop_type {
        LoopType::While => match &task.while_model_key {
            Some(key) => model_flag(model, key),
            None => true,
        },
        LoopType::For => {
            if task.init.len() == 2 && task.init[0].starts_with("model.") {
                model.set(&task.init[0], Value::Int(str_to_int(&task.init[1])))?;
            }
            for_condition(model, task)
        }
        LoopType::None => true,
    };
    if !valid || task.pipeline_steps.is_empty() {
        return Ok(PipelineStep::Exit {
            task: task.next_steps.first().cloned(),
        });
    }

    let seq = instance.next_pipe_id();
    let pipeline = PipelineInfo::new(Arc::clone(task));
    begin_pass(&pipeline);
    let first = pipeline.task_name(0).map(str::to_string);
    instance.add_pipe(seq, PipeInfo::Pipeline(pipeline));
    debug!(instance_id = %instance.id, task = %task.service, seq, first = ?first, "Pipeline begin");
    Ok(match first {
        Some(task) => PipelineStep::Next { task, seq },
        None => PipelineStep::Exit { task: None },
    })
}

/// Rewind to step 0. A one-step pipeline is complete as soon as that step is sent.
fn begin_pass(pipeline: &PipelineInfo) {
    pipeline.reset_pointer();
    if pipeline.is_singleton() {
        pipeline.set_completed();
    }
}

/// Move a pipeline forward after one of its steps finished
pub fn advance_pipeline(
    instance: &FlowInstance,
    seq: i32,
    pipeline: &PipelineInfo,
) -> Result<PipelineStep, CoreError> {
    if pipeline.is_completed() {
        return pipeline_completion(instance, seq, pipeline);
    }
    let n = pipeline.next_step();
    if pipeline.is_last_step(n) {
        pipeline.set_completed();
    }

    let model = instance.model();
    for condition in &pipeline.task().conditions {
        let (Some(key), Some(action)) = (condition.first(), condition.get(1)) else {
            continue;
        };
        if !model_flag(model, key) {
            continue;
        }
        match action.as_str() {
            BREAK => {
                model.remove(key);
                instance.remove_pipe(seq);
                debug!(instance_id = %instance.id, seq, condition = %key, "Pipeline break");
                return Ok(PipelineStep::Exit {
                    task: pipeline.exit_task().map(str::to_string),
                });
            }
            CONTINUE => {
                model.remove(key);
                pipeline.set_completed();
                debug!(instance_id = %instance.id, seq, condition = %key, "Pipeline continue");
                return pipeline_completion(instance, seq, pipeline);
            }
            other => warn!(instance_id = %instance.id, action = other, "Ignoring unknown pipeline condition"),
        }
    }

    Ok(match pipeline.task_name(n) {
        Some(task) => PipelineStep::Next {
            task: task.to_string(),
            seq,
        },
        None => PipelineStep::Exit {
            task: pipeline.exit_task().map(str::to_string),
        },
    })
}

fn pipeline_completion(
    instance: &FlowInstance,
    seq: i32,
    pipeline: &PipelineInfo,
) -> Result<PipelineStep, CoreError> {
    let task = pipeline.task();
    let model = instance.model();
    let iterate = match task.loop_type {
        LoopType::While => task
            .while_model_key
            .as_deref()
            .map(|key| model_flag(model, key))
            .unwrap_or(false),
        LoopType::For => {
            if let (Some(key), Some(command)) = (task.sequencer.first(), task.sequencer.get(1)) {
                let v = model_int(model, key);
                match command.as_str() {
                    "++" => model.set(key, Value::Int(v.saturating_add(1)))?,
                    "--" => model.set(key, Value::Int(v.saturating_sub(1)))?,
                    _ => {}
                }
            }
            for_condition(model, task)
        }
        LoopType::None => false,
    };

    if iterate {
        begin_pass(pipeline);
        if let Some(first) = pipeline.task_name(0) {
            debug!(instance_id = %instance.id, seq, first, "Pipeline repeat");
            return Ok(PipelineStep::Repeat {
                task: first.to_string(),
                seq,
            });
        }
    }
    instance.remove_pipe(seq);
    debug!(instance_id = %instance.id, seq, "Pipeline end");
    Ok(PipelineStep::Exit {
        task: pipeline.exit_task().map(str::to_string),
    })
}

fn model_flag(model: &ModelStore, key: &str) -> bool {
    matches!(model.get(key), Some(Value::Bool(true)))
}

fn model_int(model: &ModelStore, key: &str) -> i32 {
    match model.get(key) {
        Some(Value::Int(v)) => v,
        Some(other) => str_to_int(&other.to_text()),
        None => -1,
    }
}

fn for_condition(model: &ModelStore, task: &Task) -> bool {
    let [key, op, bound] = task.comparator.as_slice() else {
        return false;
    };
    let v = model_int(model, key);
    let bound = str_to_int(bound);
    match op.as_str() {
        "<" => v < bound,
        ">" => v > bound,
        ">=" => v >= bound,
        "<=" => v <= bound,
        _ => false,
    }
}

/// Exception handler for a failed task, task-level before flow-level.
///
/// Inside a pipe, a task-level handler drops only that pipe and anything
/// else clears every pipe of the instance.
pub fn resolve_exception_handler(instance: &FlowInstance, task: &Task, seq: i32) -> Option<String> {
    if seq > 0 {
        if task.exception_task.is_some() {
            instance.remove_pipe(seq);
        } else {
            instance.clear_pipes();
        }
    }
    task.exception_task
        .clone()
        .or_else(|| instance.flow().exception_task.clone())
}

/// Error map handed to an exception handler as the `error` namespace
pub fn error_dataset(status: i32, message: &str) -> Value {
    let mut map = BTreeMap::new();
    map.insert("code".to_string(), Value::Int(status));
    map.insert("message".to_string(), Value::Text(message.to_string()));
    Value::Map(map)
}

/// Delay before `task` runs, if it has a usable one
pub fn resolve_delay(task: &Task, model: &ModelStore, ttl: u64) -> Option<u64> {
    let delay = match (&task.delay, &task.delay_var) {
        (Some(delay), _) => *delay as i64,
        (None, Some(var)) => match model.get(var).and_then(|v| v.to_long()) {
            Some(delay) => delay,
            None => {
                warn!(task = %task.service, delay_var = %var, "Unable to schedule task - delay variable is not a number");
                return None;
            }
        },
        (None, None) => return None,
    };
    if delay > 0 && (delay as u64) < ttl {
        Some(delay as u64)
    } else {
        warn!(task = %task.service, delay, ttl, "Ignoring delay outside the flow time-to-live");
        None
    }
}
