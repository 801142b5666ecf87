use serde::{Deserialize, Serialize};

/// How a task continues once its function returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Execution {
    /// Select exactly one next task from the decision value
    Decision,
    /// Reply to the caller, then continue with the next task
    Response,
    /// Reply to the caller and finish the flow
    End,
    /// Continue with the single next task
    #[default]
    Sequential,
    /// Start every next task concurrently
    Parallel,
    /// Start every next task and wait for all of them at the join task
    Fork,
    /// Run the pipeline steps in order, optionally looping
    Pipeline,
    /// No successors, used as a fork branch or pipeline step
    Sink,
}

impl Execution {
    /// Lower-case name as written in flow configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            Execution::Decision => "decision",
            Execution::Response => "response",
            Execution::End => "end",
            Execution::Sequential => "sequential",
            Execution::Parallel => "parallel",
            Execution::Fork => "fork",
            Execution::Pipeline => "pipeline",
            Execution::Sink => "sink",
        }
    }
}

/// Loop behaviour of a pipeline task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoopType {
    /// Run the steps once
    #[default]
    None,
    /// `for` loop driven by `init`, `comparator` and `sequencer`
    For,
    /// Repeat while `while_model_key` is true
    While,
}

/// Immutable node of a flow template.
///
/// Decision branches are addressed through `next_steps`: a decision value of
/// `n` selects `next_steps[n - 1]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    /// Unique name of the task inside its flow
    pub service: String,

    /// Function to invoke, defaults to `service`
    #[serde(default)]
    pub function_route: Option<String>,

    /// Continuation kind
    #[serde(default)]
    pub execution: Execution,

    /// Input data-mapping statements
    #[serde(default)]
    pub input: Vec<String>,

    /// Output data-mapping statements
    #[serde(default)]
    pub output: Vec<String>,

    /// Ordered next task names
    #[serde(default)]
    pub next_steps: Vec<String>,

    /// Steps of a pipeline task
    #[serde(default)]
    pub pipeline_steps: Vec<String>,

    /// Pipeline `[model.key, continue|break]` pairs checked before each step
    #[serde(default)]
    pub conditions: Vec<Vec<String>>,

    /// Task that receives control after every forked branch finished
    #[serde(default)]
    pub join_task: Option<String>,

    /// Task-level exception handler
    #[serde(default)]
    pub exception_task: Option<String>,

    /// Fixed delay in milliseconds before the task runs
    #[serde(default)]
    pub delay: Option<u64>,

    /// Model variable holding the delay in milliseconds
    #[serde(default)]
    pub delay_var: Option<String>,

    /// Pipeline loop kind
    #[serde(default)]
    pub loop_type: LoopType,

    /// Model key evaluated by a `while` loop
    #[serde(default)]
    pub while_model_key: Option<String>,

    /// `for` loop initializer `[model.key, value]`
    #[serde(default)]
    pub init: Vec<String>,

    /// `for` loop condition `[model.key, op, value]`
    #[serde(default)]
    pub comparator: Vec<String>,

    /// `for` loop step `[model.key, ++|--]`
    #[serde(default)]
    pub sequencer: Vec<String>,
}

impl Task {
    /// Create a task with no mappings and no successors
    pub fn new(service: impl Into<String>, execution: Execution) -> Self {
        Self {
            service: service.into(),
            function_route: None,
            execution,
            input: Vec::new(),
            output: Vec::new(),
            next_steps: Vec::new(),
            pipeline_steps: Vec::new(),
            conditions: Vec::new(),
            join_task: None,
            exception_task: None,
            delay: None,
            delay_var: None,
            loop_type: LoopType::None,
            while_model_key: None,
            init: Vec::new(),
            comparator: Vec::new(),
            sequencer: Vec::new(),
        }
    }

    /// Function route, falling back to the service name
    pub fn route(&self) -> &str {
        self.function_route.as_deref().unwrap_or(&self.service)
    }

    /// Whether completion runs the pipeline steps
    pub fn is_pipeline(&self) -> bool {
        self.execution == Execution::Pipeline || !self.pipeline_steps.is_empty()
    }

    /// Whether output statements may assign `decision`
    pub fn is_decision(&self) -> bool {
        self.execution == Execution::Decision
    }

    /// Set the function route
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.function_route = Some(route.into());
        self
    }

    /// Append input statements
    pub fn with_input<I, S>(mut self, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input.extend(statements.into_iter().map(Into::into));
        self
    }

    /// Append output statements
    pub fn with_output<I, S>(mut self, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output.extend(statements.into_iter().map(Into::into));
        self
    }

    /// Append next task names
    pub fn with_next<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next_steps.extend(names.into_iter().map(Into::into));
        self
    }

    /// Append pipeline steps
    pub fn with_pipeline<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pipeline_steps.extend(names.into_iter().map(Into::into));
        self
    }

    /// Add a pipeline `continue`/`break` condition
    pub fn with_condition(mut self, model_key: impl Into<String>, action: impl Into<String>) -> Self {
        self.conditions.push(vec![model_key.into(), action.into()]);
        self
    }

    /// Set the join task of a fork
    pub fn with_join(mut self, join_task: impl Into<String>) -> Self {
        self.join_task = Some(join_task.into());
        self
    }

    /// Set the task-level exception handler
    pub fn with_exception(mut self, exception_task: impl Into<String>) -> Self {
        self.exception_task = Some(exception_task.into());
        self
    }

    /// Set a fixed delay in milliseconds
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay = Some(delay_ms);
        self
    }

    /// Read the delay from a model variable
    pub fn with_delay_var(mut self, model_key: impl Into<String>) -> Self {
        self.delay_var = Some(model_key.into());
        self
    }

    /// Turn the pipeline into a `while` loop
    pub fn with_while(mut self, model_key: impl Into<String>) -> Self {
        self.loop_type = LoopType::While;
        self.while_model_key = Some(model_key.into());
        self
    }

    /// Turn the pipeline into a `for` loop
    pub fn with_for(mut self, init: &[&str], comparator: &[&str], sequencer: &[&str]) -> Self {
        self.loop_type = LoopType::For;
        self.init = init.iter().map(|s| s.to_string()).collect();
        self.comparator = comparator.iter().map(|s| s.to_string()).collect();
        self.sequencer = sequencer.iter().map(|s| s.to_string()).collect();
        self
    }
}
