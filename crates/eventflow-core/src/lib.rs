//!
//! Eventflow Core - flow orchestration state for the Eventflow engine
//!
//! This crate holds the flow and task templates, the per-instance runtime
//! state, the registry of templates and live instances, and the rules that
//! pick the next task once a task returns. Task invocation itself belongs
//! to the caller.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - templates, instances and their bookkeeping
pub mod domain;

/// Application services - routing and task execution
pub mod application;

/// Engine configuration
pub mod config;

/// Error types
pub mod error;

// Re-export key types
pub use config::EngineConfig;
pub use error::CoreError;

pub use domain::flow::{Flow, FlowDocument, DEFAULT_TTL_MS};
pub use domain::flow_instance::{ErrorResponse, FlowInstance};
pub use domain::pipe::{JoinTaskInfo, PipeInfo, PipelineInfo};
pub use domain::registry::Flows;
pub use domain::shared_state::{apply_ext_ops, ExternalStateMachine, MemoryStateMachine};
pub use domain::task::{Execution, LoopType, Task};
pub use domain::timeout::{FlowTimeoutHandler, TIMEOUT_STATUS};

pub use application::routing::{NextTask, PipelineStep};
pub use application::task_executor::{FlowResponse, Routing, TaskCall, TaskExecutor};
