/// Continuation rules for decisions, forks, pipelines and exceptions
pub mod routing;

/// Task preparation and completion service
pub mod task_executor;
