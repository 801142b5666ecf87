use crate::domain::task::Task;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Progress of one running pipeline.
///
/// The step pointer and the completed flag are atomics so that callbacks
/// of different steps can advance the same pipeline without a lock.
#[derive(Debug)]
pub struct PipelineInfo {
    task: Arc<Task>,
    ptr: AtomicI32,
    completed: AtomicBool,
}

impl PipelineInfo {
    /// Track a pipeline task, pointer at the first step
    pub fn new(task: Arc<Task>) -> Self {
        Self {
            task,
            ptr: AtomicI32::new(0),
            completed: AtomicBool::new(false),
        }
    }

    /// The pipeline task
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    fn last_index(&self) -> i32 {
        self.task.pipeline_steps.len() as i32 - 1
    }

    /// Advance the pointer, saturating at the last step, and return it
    pub fn next_step(&self) -> i32 {
        let last = self.last_index();
        let previous = self
            .ptr
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| Some((p + 1).min(last)))
            .unwrap_or_else(|p| p);
        (previous + 1).min(last)
    }

    /// Current pointer
    pub fn pointer(&self) -> i32 {
        self.ptr.load(Ordering::Acquire)
    }

    /// Step name at `n`, clamped into range
    pub fn task_name(&self, n: i32) -> Option<&str> {
        let steps = &self.task.pipeline_steps;
        if steps.is_empty() {
            return None;
        }
        let index = n.clamp(0, self.last_index()) as usize;
        steps.get(index).map(String::as_str)
    }

    /// Whether `n` addresses the final step
    pub fn is_last_step(&self, n: i32) -> bool {
        n >= self.last_index()
    }

    /// Rewind to the first step and clear the completed flag
    pub fn reset_pointer(&self) {
        self.completed.store(false, Ordering::Release);
        self.ptr.store(0, Ordering::Release);
    }

    /// Whether the pipeline has a single step
    pub fn is_singleton(&self) -> bool {
        self.task.pipeline_steps.len() == 1
    }

    /// Task that runs when the pipeline ends
    pub fn exit_task(&self) -> Option<&str> {
        self.task.next_steps.first().map(String::as_str)
    }

    /// Mark the current pass as finished
    pub fn set_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    /// Whether the current pass is finished
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

/// Join bookkeeping for a fork
#[derive(Debug)]
pub struct JoinTaskInfo {
    forks: usize,
    join_task: String,
    result_count: AtomicUsize,
}

impl JoinTaskInfo {
    /// Wait for `forks` branches before running `join_task`
    pub fn new(forks: usize, join_task: impl Into<String>) -> Self {
        Self {
            forks,
            join_task: join_task.into(),
            result_count: AtomicUsize::new(0),
        }
    }

    /// Record one branch result.
    ///
    /// Returns `true` for exactly one caller: the one that completes the set.
    pub fn record_result(&self) -> bool {
        self.result_count.fetch_add(1, Ordering::AcqRel) + 1 == self.forks
    }

    /// Number of branches that reported back
    pub fn result_count(&self) -> usize {
        self.result_count.load(Ordering::Acquire)
    }

    /// Number of forked branches
    pub fn forks(&self) -> usize {
        self.forks
    }

    /// Task that runs after the last branch
    pub fn join_task(&self) -> &str {
        &self.join_task
    }
}

/// Entry of an instance's pipe map
#[derive(Debug)]
pub enum PipeInfo {
    /// A running pipeline
    Pipeline(PipelineInfo),
    /// A fork waiting for its branches
    Join(JoinTaskInfo),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::Execution;
    use pretty_assertions::assert_eq;

    fn pipeline(steps: &[&str]) -> PipelineInfo {
        PipelineInfo::new(Arc::new(
            Task::new("loop", Execution::Pipeline)
                .with_pipeline(steps.iter().copied())
                .with_next(["exit"]),
        ))
    }

    #[test]
    fn test_next_step_saturates() {
        let info = pipeline(&["a", "b", "c"]);
        assert_eq!(info.next_step(), 1);
        assert_eq!(info.next_step(), 2);
        assert_eq!(info.next_step(), 2);
        assert_eq!(info.task_name(2), Some("c"));
        assert!(info.is_last_step(2));
    }

    #[test]
    fn test_reset_pointer() {
        let info = pipeline(&["a", "b"]);
        info.next_step();
        info.set_completed();
        info.reset_pointer();
        assert_eq!(info.pointer(), 0);
        assert!(!info.is_completed());
        assert_eq!(info.exit_task(), Some("exit"));
    }

    #[test]
    fn test_singleton_pipeline() {
        let info = pipeline(&["only"]);
        assert!(info.is_singleton());
        assert!(info.is_last_step(0));
        assert_eq!(info.next_step(), 0);
        assert_eq!(info.task_name(-4), Some("only"));
    }

    #[test]
    fn test_join_fires_once() {
        let join = JoinTaskInfo::new(3, "merge");
        let fired: Vec<bool> = (0..4).map(|_| join.record_result()).collect();
        assert_eq!(fired, vec![false, false, true, false]);
        assert_eq!(join.result_count(), 4);
        assert_eq!(join.join_task(), "merge");
    }
}
