//! Completion tracking for the tasks fanned out from one event.
//!
//! A [`ReplicationState`] is shared by every task spawned for one triggering
//! event. Each task reports its terminal outcome exactly once; when the last
//! one has reported and the dispatcher has marked fan-out complete, the
//! listener gets a final summary and waiters are released.

use crate::error::{ReplError, Result};
use crate::task::{PushOp, TaskId};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Terminal outcome of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The push reached the remote.
    Succeeded,
    /// Retries were exhausted or the task could not run.
    GivenUp {
        /// Final failure reason.
        reason: String,
    },
    /// The task was dropped before completing.
    Cancelled {
        /// True when shutdown released the task without draining it.
        interrupted: bool,
    },
}

/// Report of one finished task.
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Task identifier.
    pub task_id: TaskId,
    /// Destination name.
    pub destination: String,
    /// Source project.
    pub project: String,
    /// Concrete remote URL.
    pub url: String,
    /// What was pushed.
    pub op: PushOp,
    /// Attempts made.
    pub attempts: u32,
    /// How it ended.
    pub outcome: TaskOutcome,
}

/// Receives progress of a [`ReplicationState`].
pub trait PushResultListener: Send + Sync {
    /// One task finished.
    fn on_task_finished(&self, _result: &TaskResult) {}

    /// Every task of the event finished.
    fn on_all_finished(&self, _summary: &ReplicationSummary) {}
}

/// Listener that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl PushResultListener for NoopListener {}

/// Aggregated outcome of an event's tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationSummary {
    /// Tasks registered.
    pub scheduled: usize,
    /// Tasks that succeeded.
    pub succeeded: usize,
    /// Tasks that gave up.
    pub failed: usize,
    /// Tasks cancelled without shutdown involvement.
    pub cancelled: usize,
    /// Tasks released by shutdown.
    pub interrupted: usize,
}

impl ReplicationSummary {
    /// Every task succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.scheduled
    }
}

#[derive(Debug, Default)]
struct Progress {
    summary: ReplicationSummary,
    remaining: usize,
    all_scheduled: bool,
    finished: bool,
}

struct Inner {
    progress: Mutex<Progress>,
    listener: Arc<dyn PushResultListener>,
    done: watch::Sender<Option<ReplicationSummary>>,
}

/// Shared completion handle for one triggering event.
#[derive(Clone)]
pub struct ReplicationState {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let progress = self.inner.progress.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("ReplicationState")
            .field("remaining", &progress.remaining)
            .field("all_scheduled", &progress.all_scheduled)
            .field("summary", &progress.summary)
            .finish()
    }
}

impl Default for ReplicationState {
    fn default() -> Self {
        Self::noop()
    }
}

impl ReplicationState {
    /// Create a state reporting to `listener`.
    pub fn new(listener: Arc<dyn PushResultListener>) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                progress: Mutex::new(Progress::default()),
                listener,
                done,
            }),
        }
    }

    /// Create a state nobody listens to.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopListener))
    }

    /// Register one more task.
    pub(crate) fn add_task(&self) {
        let mut progress = self.lock();
        progress.summary.scheduled += 1;
        progress.remaining += 1;
    }

    /// No more tasks will be registered; completes immediately if none are outstanding.
    pub fn mark_all_scheduled(&self) {
        let summary = {
            let mut progress = self.lock();
            progress.all_scheduled = true;
            Self::take_completion(&mut progress)
        };
        if let Some(summary) = summary {
            self.publish(summary);
        }
    }

    /// Record a terminal outcome.
    pub(crate) fn task_finished(&self, result: &TaskResult) {
        let summary = {
            let mut progress = self.lock();
            if progress.remaining == 0 {
                return;
            }
            progress.remaining -= 1;
            match &result.outcome {
                TaskOutcome::Succeeded => progress.summary.succeeded += 1,
                TaskOutcome::GivenUp { .. } => progress.summary.failed += 1,
                TaskOutcome::Cancelled { interrupted: true } => progress.summary.interrupted += 1,
                TaskOutcome::Cancelled { interrupted: false } => progress.summary.cancelled += 1,
            }
            Self::take_completion(&mut progress)
        };
        self.inner.listener.on_task_finished(result);
        if let Some(summary) = summary {
            self.publish(summary);
        }
    }

    /// Current counters.
    pub fn summary(&self) -> ReplicationSummary {
        self.lock().summary
    }

    /// Tasks still outstanding.
    pub fn remaining(&self) -> usize {
        self.lock().remaining
    }

    /// All tasks finished and fan-out is complete.
    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Wait until every task finished, at most `timeout`.
    ///
    /// Fails with [`ReplError::Timeout`] when the time runs out and with
    /// [`ReplError::ShutdownInterrupted`] when shutdown released any task.
    pub async fn wait(&self, timeout: Duration) -> Result<ReplicationSummary> {
        let mut rx = self.inner.done.subscribe();
        let summary = match tokio::time::timeout(timeout, rx.wait_for(|s| s.is_some())).await {
            Ok(Ok(done)) => (*done).unwrap_or_default(),
            Ok(Err(_)) => return Err(ReplError::Shutdown),
            Err(_) => return Err(ReplError::Timeout { waited: timeout }),
        };
        if summary.interrupted > 0 {
            return Err(ReplError::ShutdownInterrupted);
        }
        Ok(summary)
    }

    /// Both handles track the same event.
    pub fn ptr_eq(&self, other: &ReplicationState) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.inner.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_completion(progress: &mut Progress) -> Option<ReplicationSummary> {
        if progress.all_scheduled && progress.remaining == 0 && !progress.finished {
            progress.finished = true;
            Some(progress.summary)
        } else {
            None
        }
    }

    fn publish(&self, summary: ReplicationSummary) {
        self.inner.listener.on_all_finished(&summary);
        self.inner.done.send_replace(Some(summary));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn result(outcome: TaskOutcome) -> TaskResult {
        TaskResult {
            task_id: TaskId(1),
            destination: "d".to_string(),
            project: "p".to_string(),
            url: "/g/p.git".to_string(),
            op: PushOp::FullSync,
            attempts: 1,
            outcome,
        }
    }

    #[derive(Default)]
    struct Counting {
        tasks: AtomicUsize,
        finals: AtomicUsize,
    }

    impl PushResultListener for Counting {
        fn on_task_finished(&self, _result: &TaskResult) {
            self.tasks.fetch_add(1, Ordering::SeqCst);
        }

        fn on_all_finished(&self, _summary: &ReplicationSummary) {
            self.finals.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_completes_after_last_task() {
        let listener = Arc::new(Counting::default());
        let state = ReplicationState::new(listener.clone());
        state.add_task();
        state.add_task();
        state.mark_all_scheduled();
        assert!(!state.is_finished());

        state.task_finished(&result(TaskOutcome::Succeeded));
        assert_eq!(state.remaining(), 1);
        state.task_finished(&result(TaskOutcome::GivenUp {
            reason: "down".to_string(),
        }));

        assert!(state.is_finished());
        assert_eq!(listener.tasks.load(Ordering::SeqCst), 2);
        assert_eq!(listener.finals.load(Ordering::SeqCst), 1);
        let summary = state.summary();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert!(!summary.all_succeeded());
    }

    #[test]
    fn test_not_finished_before_fan_out_complete() {
        let state = ReplicationState::noop();
        state.add_task();
        state.task_finished(&result(TaskOutcome::Succeeded));
        assert!(!state.is_finished());
        state.mark_all_scheduled();
        assert!(state.is_finished());
    }

    #[test]
    fn test_empty_fan_out_finishes_immediately() {
        let state = ReplicationState::noop();
        state.mark_all_scheduled();
        assert!(state.is_finished());
        assert_eq!(state.summary().scheduled, 0);
    }

    #[test]
    fn test_extra_reports_ignored() {
        let listener = Arc::new(Counting::default());
        let state = ReplicationState::new(listener.clone());
        state.add_task();
        state.mark_all_scheduled();
        state.task_finished(&result(TaskOutcome::Succeeded));
        state.task_finished(&result(TaskOutcome::Succeeded));
        assert_eq!(state.summary().succeeded, 1);
        assert_eq!(listener.finals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_returns_summary() {
        let state = ReplicationState::noop();
        state.add_task();
        state.mark_all_scheduled();
        let waiter = state.clone();
        let handle = tokio::spawn(async move { waiter.wait(Duration::from_secs(5)).await });
        state.task_finished(&result(TaskOutcome::Succeeded));
        let summary = handle.await.unwrap().unwrap();
        assert!(summary.all_succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let state = ReplicationState::noop();
        state.add_task();
        state.mark_all_scheduled();
        let err = state.wait(Duration::from_secs(3)).await.unwrap_err();
        assert!(matches!(err, ReplError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_wait_reports_interruption() {
        let state = ReplicationState::noop();
        state.add_task();
        state.mark_all_scheduled();
        state.task_finished(&result(TaskOutcome::Cancelled { interrupted: true }));
        let err = state.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ReplError::ShutdownInterrupted));
    }

    #[test]
    fn test_clones_share_progress() {
        let a = ReplicationState::noop();
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        a.add_task();
        assert_eq!(b.remaining(), 1);
        assert!(!a.ptr_eq(&ReplicationState::noop()));
    }
}
