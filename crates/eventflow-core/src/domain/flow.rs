use crate::domain::task::{Execution, LoopType, Task};
use crate::CoreError;
use eventflow_mapping::statement::{validate_input, validate_output};
use eventflow_mapping::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Default flow time-to-live in milliseconds
pub const DEFAULT_TTL_MS: u64 = 30_000;

/// Model variable prefix
const MODEL_PREFIX: &str = "model.";

/// Flow validation error codes
pub mod error_codes {
    /// Flow has no tasks, no end task or a bad `first_task`
    pub const INVALID_FLOW: &str = "ERR_FLOW_INVALID";

    /// A task name referenced by the flow does not exist
    pub const UNKNOWN_TASK: &str = "ERR_FLOW_UNKNOWN_TASK";

    /// Next-step list does not fit the execution kind
    pub const INVALID_NEXT_STEPS: &str = "ERR_FLOW_NEXT_STEPS";

    /// Pipeline loop or condition settings are malformed
    pub const INVALID_LOOP: &str = "ERR_FLOW_LOOP";

    /// Delay settings are out of range
    pub const INVALID_DELAY: &str = "ERR_FLOW_DELAY";
}

/// Serialized form of a flow template, as read from YAML or JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowDocument {
    /// Flow id
    pub id: String,

    /// Name of the task that starts the flow
    pub first_task: String,

    /// Name of the external state machine, if any
    #[serde(default)]
    pub external_state_machine: Option<String>,

    /// Time-to-live in milliseconds
    #[serde(default)]
    pub ttl: Option<u64>,

    /// Flow-level exception handler
    #[serde(default)]
    pub exception_task: Option<String>,

    /// Task list
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// Immutable flow template.
///
/// Built once at load time and shared read-only by every instance through
/// an `Arc<Flow>`.
#[derive(Debug, Clone)]
pub struct Flow {
    /// Flow id
    pub id: String,
    /// Name of the task that starts the flow
    pub first_task: String,
    /// Name of the external state machine, if any
    pub external_state_machine: Option<String>,
    /// Time-to-live in milliseconds
    pub ttl: u64,
    /// Flow-level exception handler
    pub exception_task: Option<String>,
    tasks: HashMap<String, Arc<Task>>,
}

impl Flow {
    /// Create an empty flow template
    pub fn new(id: impl Into<String>, first_task: impl Into<String>, ttl: u64) -> Self {
        Self {
            id: id.into(),
            first_task: first_task.into(),
            external_state_machine: None,
            ttl,
            exception_task: None,
            tasks: HashMap::new(),
        }
    }

    /// Build a template from its serialized form
    pub fn from_document(document: FlowDocument, default_ttl: u64) -> Self {
        let mut flow = Flow::new(document.id, document.first_task, document.ttl.unwrap_or(default_ttl));
        flow.external_state_machine = document.external_state_machine;
        flow.exception_task = document.exception_task;
        for task in document.tasks {
            flow.add_task(task);
        }
        flow
    }

    /// Set the flow-level exception handler
    pub fn with_exception(mut self, exception_task: impl Into<String>) -> Self {
        self.exception_task = Some(exception_task.into());
        self
    }

    /// Set the external state machine name
    pub fn with_external_state_machine(mut self, name: impl Into<String>) -> Self {
        self.external_state_machine = Some(name.into());
        self
    }

    /// Register a task under its service name, replacing any earlier one
    pub fn add_task(&mut self, task: Task) {
        self.tasks.insert(task.service.clone(), Arc::new(task));
    }

    /// Look up a task by name
    pub fn task(&self, name: &str) -> Option<&Arc<Task>> {
        self.tasks.get(name)
    }

    /// Number of tasks
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Task names, sorted
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check the template and report every problem at once
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut errors = Vec::new();

        if self.ttl == 0 {
            errors.push(ValidationError::new(error_codes::INVALID_FLOW, "ttl must be positive").at("ttl"));
        }
        if self.tasks.is_empty() {
            errors.push(ValidationError::new(error_codes::INVALID_FLOW, "Flow has no tasks").at("tasks"));
        }
        if !self.tasks.contains_key(&self.first_task) {
            errors.push(
                ValidationError::new(
                    error_codes::UNKNOWN_TASK,
                    format!("First task {} does not exist", self.first_task),
                )
                .at("first_task"),
            );
        }
        if let Some(handler) = &self.exception_task {
            self.check_reference(handler, "exception_task", &mut errors);
        }
        if !self.tasks.values().any(|t| t.execution == Execution::End) {
            errors.push(ValidationError::new(
                error_codes::INVALID_FLOW,
                "Flow must have at least one end task",
            ));
        }

        let mut names: Vec<&String> = self.tasks.keys().collect();
        names.sort();
        for name in names {
            if let Some(task) = self.tasks.get(name) {
                self.validate_task(task, &mut errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::InvalidFlow {
                flow: self.id.clone(),
                errors,
            })
        }
    }

    fn check_reference(&self, name: &str, path: &str, errors: &mut Vec<ValidationError>) {
        if !self.tasks.contains_key(name) {
            errors.push(
                ValidationError::new(error_codes::UNKNOWN_TASK, format!("Task {} does not exist", name))
                    .at(path),
            );
        }
    }

    fn validate_task(&self, task: &Task, errors: &mut Vec<ValidationError>) {
        let base = format!("tasks.{}", task.service);

        for (i, statement) in task.input.iter().enumerate() {
            if let Err(e) = validate_input(statement) {
                errors.push(e.at(format!("{}.input[{}]", base, i)));
            }
        }
        for (i, statement) in task.output.iter().enumerate() {
            if let Err(e) = validate_output(statement, task.is_decision()) {
                errors.push(e.at(format!("{}.output[{}]", base, i)));
            }
        }

        for (i, next) in task.next_steps.iter().enumerate() {
            self.check_reference(next, &format!("{}.next_steps[{}]", base, i), errors);
        }
        for (i, step) in task.pipeline_steps.iter().enumerate() {
            self.check_reference(step, &format!("{}.pipeline_steps[{}]", base, i), errors);
        }
        if let Some(handler) = &task.exception_task {
            self.check_reference(handler, &format!("{}.exception_task", base), errors);
        }

        let next_count = task.next_steps.len();
        let next_error = |message: String| {
            ValidationError::new(error_codes::INVALID_NEXT_STEPS, message).at(format!("{}.next_steps", base))
        };
        match task.execution {
            Execution::End | Execution::Sink => {}
            _ if next_count == 0 => errors.push(next_error(format!(
                "Task {} is missing a list of next tasks",
                task.service
            ))),
            Execution::Decision if next_count < 2 => errors.push(next_error(format!(
                "Decision task {} must have at least two next tasks",
                task.service
            ))),
            Execution::Sequential | Execution::Pipeline if next_count > 1 => errors.push(next_error(format!(
                "{} task {} expects one next task, found {}",
                task.execution.as_str(),
                task.service,
                next_count
            ))),
            _ if task.is_pipeline() && next_count > 1 => errors.push(next_error(format!(
                "Pipeline task {} expects one exit task, found {}",
                task.service, next_count
            ))),
            _ => {}
        }

        if task.execution == Execution::Fork {
            match &task.join_task {
                Some(join) => self.check_reference(join, &format!("{}.join_task", base), errors),
                None => errors.push(
                    ValidationError::new(
                        error_codes::INVALID_NEXT_STEPS,
                        format!("Fork task {} must have a join task", task.service),
                    )
                    .at(format!("{}.join_task", base)),
                ),
            }
        }

        if task.is_pipeline() {
            self.validate_pipeline(task, &base, errors);
        }

        if let Some(delay) = task.delay {
            if delay >= self.ttl {
                errors.push(
                    ValidationError::new(
                        error_codes::INVALID_DELAY,
                        format!("Delay {} ms of task {} must be less than ttl {} ms", delay, task.service, self.ttl),
                    )
                    .at(format!("{}.delay", base)),
                );
            }
        }
        if let Some(var) = &task.delay_var {
            if !is_model_key(var) {
                errors.push(
                    ValidationError::new(
                        error_codes::INVALID_DELAY,
                        format!("Delay variable {} must be a model variable", var),
                    )
                    .at(format!("{}.delay_var", base)),
                );
            }
        }
    }

    fn validate_pipeline(&self, task: &Task, base: &str, errors: &mut Vec<ValidationError>) {
        let loop_error = |message: String| {
            ValidationError::new(error_codes::INVALID_LOOP, message).at(base.to_string())
        };

        if task.pipeline_steps.is_empty() {
            errors.push(loop_error(format!("Pipeline task {} has no steps", task.service)));
        }

        for condition in &task.conditions {
            let valid = condition.len() == 2
                && is_model_key(&condition[0])
                && (condition[1] == "continue" || condition[1] == "break");
            if !valid {
                errors.push(loop_error(format!(
                    "Invalid condition {:?} in {}, expected [model.key, continue|break]",
                    condition, task.service
                )));
            }
        }

        match task.loop_type {
            LoopType::None => {}
            LoopType::While => {
                if !task.while_model_key.as_deref().map(is_model_key).unwrap_or(false) {
                    errors.push(loop_error(format!(
                        "While loop of {} needs a model variable to test",
                        task.service
                    )));
                }
            }
            LoopType::For => {
                let init_ok = task.init.is_empty() || (task.init.len() == 2 && is_model_key(&task.init[0]));
                let comparator_ok = task.comparator.len() == 3
                    && is_model_key(&task.comparator[0])
                    && matches!(task.comparator[1].as_str(), "<" | "<=" | ">" | ">=");
                let sequencer_ok = task.sequencer.len() == 2
                    && is_model_key(&task.sequencer[0])
                    && matches!(task.sequencer[1].as_str(), "++" | "--");
                if !init_ok || !comparator_ok || !sequencer_ok {
                    errors.push(loop_error(format!(
                        "Invalid for loop in {}, expected init [model.k, n], comparator [model.k, op, n] and sequencer [model.k, ++|--]",
                        task.service
                    )));
                }
            }
        }
    }
}

fn is_model_key(key: &str) -> bool {
    key.len() > MODEL_PREFIX.len() && key.starts_with(MODEL_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn greeting_flow() -> Flow {
        let mut flow = Flow::new("greetings", "greet", 10_000);
        flow.add_task(
            Task::new("greet", Execution::Decision)
                .with_input(["input.body.name -> name"])
                .with_output(["result.known -> decision"])
                .with_next(["welcome", "stranger"]),
        );
        flow.add_task(Task::new("welcome", Execution::End).with_output(["result -> output.body"]));
        flow.add_task(Task::new("stranger", Execution::End));
        flow
    }

    fn issues(flow: &Flow) -> Vec<String> {
        match flow.validate() {
            Err(CoreError::InvalidFlow { errors, .. }) => errors.into_iter().map(|e| e.message).collect(),
            other => panic!("expected invalid flow, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_flow() {
        let flow = greeting_flow();
        assert!(flow.validate().is_ok());
        assert_eq!(flow.task_count(), 3);
        assert_eq!(flow.task("greet").map(|t| t.route()), Some("greet"));
    }

    #[test]
    fn test_add_task_replaces_previous() {
        let mut flow = greeting_flow();
        flow.add_task(Task::new("stranger", Execution::End).with_route("v2.stranger"));
        assert_eq!(flow.task("stranger").map(|t| t.route()), Some("v2.stranger"));
        assert_eq!(flow.task_count(), 3);
    }

    #[test]
    fn test_collects_every_issue() {
        let mut flow = Flow::new("broken", "missing", 1_000);
        flow.add_task(Task::new("pick", Execution::Decision).with_next(["only"]));
        flow.add_task(Task::new("only", Execution::Sequential).with_delay(5_000));

        let found = issues(&flow);
        assert!(found.iter().any(|m| m.contains("First task missing")));
        assert!(found.iter().any(|m| m.contains("at least one end task")));
        assert!(found.iter().any(|m| m.contains("at least two next tasks")));
        assert!(found.iter().any(|m| m.contains("missing a list of next tasks")));
        assert!(found.iter().any(|m| m.contains("must be less than ttl")));
    }

    #[test]
    fn test_decision_output_only_on_decision_tasks() {
        let mut flow = greeting_flow();
        flow.add_task(Task::new("stranger", Execution::End).with_output(["model.x -> decision"]));
        let found = issues(&flow);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_fork_needs_join() {
        let mut flow = greeting_flow();
        flow.add_task(Task::new("greet", Execution::Fork).with_next(["welcome", "stranger"]));
        let found = issues(&flow);
        assert!(found.iter().any(|m| m.contains("must have a join task")));
    }

    #[test]
    fn test_pipeline_loop_syntax() {
        let mut flow = greeting_flow();
        flow.add_task(
            Task::new("greet", Execution::Pipeline)
                .with_pipeline(["welcome"])
                .with_next(["stranger"])
                .with_for(&["model.n", "0"], &["model.n", "!=", "3"], &["model.n", "++"])
                .with_condition("model.stop", "halt"),
        );
        let found = issues(&flow);
        assert!(found.iter().any(|m| m.contains("Invalid for loop")));
        assert!(found.iter().any(|m| m.contains("Invalid condition")));
    }

    #[test]
    fn test_delay_var_must_be_model_key() {
        let mut flow = greeting_flow();
        flow.add_task(Task::new("stranger", Execution::End).with_delay_var("delay"));
        let found = issues(&flow);
        assert!(found[0].contains("must be a model variable"));
    }

    #[test]
    fn test_from_document_applies_default_ttl() {
        let document: FlowDocument = serde_yaml::from_str(
            r#"
id: hello
first_task: hi
tasks:
  - service: hi
    execution: end
"#,
        )
        .unwrap();
        let flow = Flow::from_document(document, 5_000);
        assert_eq!(flow.ttl, 5_000);
        assert!(flow.validate().is_ok());
    }
}
