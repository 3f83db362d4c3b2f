//! Replication tasks: one push of a project to one remote URL.

use crate::state::{ReplicationState, TaskOutcome, TaskResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// What a task pushes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ref", rename_all = "kebab-case")]
pub enum PushOp {
    /// Mirror every ref of the project.
    FullSync,
    /// Push one ref (deleting it remotely if it no longer exists).
    Ref(String),
    /// Point the remote's symbolic HEAD at a branch.
    Head(String),
    /// Delete the remote repository.
    DeleteProject,
}

impl PushOp {
    /// Coalescing scope of this operation.
    pub fn scope(&self) -> TaskScope {
        match self {
            PushOp::FullSync => TaskScope::All,
            PushOp::Ref(name) => TaskScope::Ref(name.clone()),
            PushOp::Head(_) => TaskScope::Head,
            PushOp::DeleteProject => TaskScope::Delete,
        }
    }

    /// Ref the operation is about, if any.
    pub fn ref_name(&self) -> Option<&str> {
        match self {
            PushOp::Ref(name) | PushOp::Head(name) => Some(name),
            PushOp::FullSync | PushOp::DeleteProject => None,
        }
    }
}

impl std::fmt::Display for PushOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushOp::FullSync => f.write_str("full-sync"),
            PushOp::Ref(name) => f.write_str(name),
            PushOp::Head(name) => write!(f, "HEAD -> {name}"),
            PushOp::DeleteProject => f.write_str("delete-project"),
        }
    }
}

/// Part of a project a task covers; tasks with equal keys are coalesced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskScope {
    /// Every ref.
    All,
    /// A single ref.
    Ref(String),
    /// The symbolic HEAD.
    Head,
    /// The repository itself.
    Delete,
}

/// Coalescing key: (project, remote URL, scope).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    /// Source project.
    pub project: String,
    /// Concrete remote URL.
    pub url: String,
    /// Covered scope.
    pub scope: TaskScope,
}

impl TaskKey {
    /// Key of the full sync covering this key's project and URL.
    pub fn full_sync(&self) -> TaskKey {
        TaskKey {
            project: self.project.clone(),
            url: self.url.clone(),
            scope: TaskScope::All,
        }
    }
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Waiting out the replication delay.
    Pending,
    /// Handed to the transport.
    Running,
    /// Waiting out the retry interval.
    RetryPending,
    /// Pushed.
    Done,
    /// Retries exhausted or fatal mismatch.
    GivenUp,
    /// Superseded or dropped by shutdown.
    Cancelled,
}

impl TaskState {
    /// No further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::GivenUp | TaskState::Cancelled)
    }
}

/// Operator view of a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    /// Task identifier.
    pub id: TaskId,
    /// Source project.
    pub project: String,
    /// Concrete remote URL.
    pub url: String,
    /// What is pushed.
    pub op: PushOp,
    /// Current state.
    pub state: TaskState,
    /// Attempts made so far.
    pub attempts: u32,
    /// Events coalesced into this task.
    pub waiters: usize,
    /// Last failure, if any.
    pub last_error: Option<String>,
}

/// One unit of replication work.
#[derive(Debug)]
pub struct ReplicationTask {
    id: TaskId,
    project: String,
    url: String,
    op: PushOp,
    created_at: Instant,
    attempts: u32,
    state: TaskState,
    waiters: Vec<ReplicationState>,
    last_error: Option<String>,
}

impl ReplicationTask {
    /// New pending task reporting to `state`.
    pub fn new(
        project: impl Into<String>,
        url: impl Into<String>,
        op: PushOp,
        state: ReplicationState,
    ) -> Self {
        state.add_task();
        Self {
            id: TaskId::next(),
            project: project.into(),
            url: url.into(),
            op,
            created_at: Instant::now(),
            attempts: 0,
            state: TaskState::Pending,
            waiters: vec![state],
            last_error: None,
        }
    }

    /// Task identifier.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Source project.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Concrete remote URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// What is pushed.
    pub fn op(&self) -> &PushOp {
        &self.op
    }

    /// When the oldest request folded into this task was made.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Last failure, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Coalescing key.
    pub fn key(&self) -> TaskKey {
        TaskKey {
            project: self.project.clone(),
            url: self.url.clone(),
            scope: self.op.scope(),
        }
    }

    /// Snapshot for operators.
    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id,
            project: self.project.clone(),
            url: self.url.clone(),
            op: self.op.clone(),
            state: self.state,
            attempts: self.attempts,
            waiters: self.waiters.len(),
            last_error: self.last_error.clone(),
        }
    }

    pub(crate) fn set_state(&mut self, state: TaskState) {
        self.state = state;
    }

    pub(crate) fn start_attempt(&mut self) {
        self.attempts += 1;
        self.state = TaskState::Running;
    }

    pub(crate) fn record_failure(&mut self, reason: String) {
        self.last_error = Some(reason);
    }

    /// Fold a later request for the same key into this task: the earliest
    /// creation time is kept and the later request's operation wins.
    pub(crate) fn merge(&mut self, later: ReplicationTask) {
        self.op = later.op.clone();
        self.absorb(later);
    }

    /// Take over another task's waiters without changing what is pushed.
    pub(crate) fn absorb(&mut self, mut other: ReplicationTask) {
        self.created_at = self.created_at.min(other.created_at);
        self.waiters.append(&mut other.waiters);
        other.state = TaskState::Cancelled;
    }

    /// Enter a terminal state and report it to every waiter.
    pub(crate) fn finish(mut self, destination: &str, outcome: TaskOutcome) -> TaskResult {
        self.state = match outcome {
            TaskOutcome::Succeeded => TaskState::Done,
            TaskOutcome::GivenUp { .. } => TaskState::GivenUp,
            TaskOutcome::Cancelled { .. } => TaskState::Cancelled,
        };
        let result = TaskResult {
            task_id: self.id,
            destination: destination.to_string(),
            project: std::mem::take(&mut self.project),
            url: std::mem::take(&mut self.url),
            op: self.op.clone(),
            attempts: self.attempts,
            outcome,
        };
        for waiter in self.waiters.drain(..) {
            waiter.task_finished(&result);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_registers_with_state() {
        let state = ReplicationState::noop();
        let task = ReplicationTask::new("p", "/g/p.git", PushOp::FullSync, state.clone());
        assert_eq!(state.remaining(), 1);
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.attempts(), 0);
        assert_eq!(task.key().scope, TaskScope::All);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_merge_keeps_earliest_time_and_latest_op() {
        let state = ReplicationState::noop();
        let mut first = ReplicationTask::new("p", "/g/p.git", PushOp::Head("refs/heads/a".into()), state.clone());
        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        let second = ReplicationTask::new("p", "/g/p.git", PushOp::Head("refs/heads/b".into()), state.clone());
        let created = first.created_at();

        first.merge(second);

        assert_eq!(first.created_at(), created);
        assert_eq!(first.op(), &PushOp::Head("refs/heads/b".into()));
        assert_eq!(first.info().waiters, 2);
    }

    #[test]
    fn test_finish_notifies_every_waiter() {
        let a = ReplicationState::noop();
        let b = ReplicationState::noop();
        let mut task = ReplicationTask::new("p", "/g/p.git", PushOp::Ref("refs/heads/x".into()), a.clone());
        task.absorb(ReplicationTask::new("p", "/g/p.git", PushOp::Ref("refs/heads/x".into()), b.clone()));
        a.mark_all_scheduled();
        b.mark_all_scheduled();

        task.start_attempt();
        let result = task.finish("dest", TaskOutcome::Succeeded);

        assert_eq!(result.attempts, 1);
        assert!(a.is_finished());
        assert!(b.is_finished());
    }

    #[test]
    fn test_scopes() {
        assert_eq!(PushOp::DeleteProject.scope(), TaskScope::Delete);
        assert_eq!(PushOp::Head("refs/heads/m".into()).scope(), TaskScope::Head);
        assert_eq!(
            PushOp::Ref("refs/heads/m".into()).scope(),
            TaskScope::Ref("refs/heads/m".into())
        );
        assert!(TaskState::GivenUp.is_terminal());
        assert!(!TaskState::RetryPending.is_terminal());
    }

    #[test]
    fn test_op_display() {
        assert_eq!(PushOp::Head("refs/heads/m".into()).to_string(), "HEAD -> refs/heads/m");
        assert_eq!(PushOp::FullSync.to_string(), "full-sync");
    }
}
