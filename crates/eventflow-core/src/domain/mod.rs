/// Task templates
pub mod task;

/// Flow templates and their validation
pub mod flow;

/// Pipeline and join bookkeeping
pub mod pipe;

/// Live flow instances
pub mod flow_instance;

/// Registry of templates and instances
pub mod registry;

/// External state machine
pub mod shared_state;

/// Flow time-to-live watcher
pub mod timeout;
