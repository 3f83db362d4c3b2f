//! Per-destination push scheduler.
//!
//! Every destination gets one worker task that owns its queue. Tasks wait out
//! the replication delay in a [`DelayQueue`], run on a [`JoinSet`] bounded by
//! the destination's thread budget and are retried per its [`RetryPolicy`]
//! until they succeed or the budget is spent. Tasks sharing a [`TaskKey`] are
//! coalesced while pending and never run concurrently.
//!
//! [`RetryPolicy`]: crate::retry::RetryPolicy

use crate::destination::{Destination, MAX_INTERVAL};
use crate::error::{ReplError, Result, TransportError};
use crate::state::TaskOutcome;
use crate::task::{ReplicationTask, TaskInfo, TaskKey, TaskScope, TaskState};
use crate::transport::{PushReport, PushRequest, PushTransport};
use futures::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, warn};

enum Command {
    Enqueue {
        task: ReplicationTask,
        immediate: bool,
    },
    Reparent(Arc<Destination>),
    Retire,
    Snapshot(oneshot::Sender<Vec<TaskInfo>>),
}

#[derive(Debug, Default)]
struct Counters {
    scheduled: AtomicU64,
    merged: AtomicU64,
    succeeded: AtomicU64,
    failed_attempts: AtomicU64,
    given_up: AtomicU64,
    cancelled: AtomicU64,
    pending: AtomicU64,
    in_flight: AtomicU64,
}

impl Counters {
    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn dec(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
    }
}

/// Counters of one scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Tasks handed to the scheduler.
    pub scheduled: u64,
    /// Tasks folded into an existing one.
    pub merged: u64,
    /// Tasks that reached the remote.
    pub succeeded: u64,
    /// Push attempts that failed.
    pub failed_attempts: u64,
    /// Tasks that gave up.
    pub given_up: u64,
    /// Tasks cancelled (superseded or interrupted).
    pub cancelled: u64,
    /// Tasks waiting for a delay or retry interval, or for a free slot.
    pub pending: u64,
    /// Tasks being pushed right now.
    pub in_flight: u64,
}

/// Handle to one destination's scheduler worker.
pub struct PushScheduler {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PushScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushScheduler")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PushScheduler {
    /// Start a worker for `destination`; it stops when `parent` is cancelled.
    pub fn spawn(
        destination: Arc<Destination>,
        transport: Arc<dyn PushTransport>,
        parent: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = parent.child_token();
        let counters = Arc::new(Counters::default());
        let name = destination.name().to_string();

        let worker = Worker {
            destination,
            transport,
            counters: counters.clone(),
            pending: HashMap::new(),
            ready: VecDeque::new(),
            running: HashMap::new(),
            timers: DelayQueue::new(),
            pushes: JoinSet::new(),
            push_ids: HashMap::new(),
            retired: false,
        };
        let handle = tokio::spawn(worker.run(rx, cancel.clone()));
        debug!(destination = %name, "push scheduler started");

        Self {
            name,
            commands: tx,
            counters,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Destination name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a task. `immediate` skips the replication delay.
    ///
    /// Never waits for the push. Fails with [`ReplError::Shutdown`] once the
    /// worker has stopped; the task is then reported as interrupted.
    pub fn enqueue(&self, task: ReplicationTask, immediate: bool) -> Result<()> {
        Counters::inc(&self.counters.pending);
        match self.commands.send(Command::Enqueue { task, immediate }) {
            Ok(()) => {
                Counters::inc(&self.counters.scheduled);
                Ok(())
            }
            Err(mpsc::error::SendError(cmd)) => {
                Counters::dec(&self.counters.pending);
                if let Command::Enqueue { task, .. } = cmd {
                    Counters::inc(&self.counters.cancelled);
                    task.finish(&self.name, TaskOutcome::Cancelled { interrupted: true });
                }
                Err(ReplError::Shutdown)
            }
        }
    }

    /// Swap in the reloaded destination; queued and running tasks are kept.
    pub(crate) fn reparent(&self, destination: Arc<Destination>) {
        let _ = self.commands.send(Command::Reparent(destination));
    }

    /// The destination was removed: running pushes finish, nothing else runs.
    pub(crate) fn retire(&self) {
        let _ = self.commands.send(Command::Retire);
    }

    /// Tasks currently known to the worker, running first.
    pub async fn queue_snapshot(&self) -> Vec<TaskInfo> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Snapshot(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Current counters.
    pub fn stats(&self) -> SchedulerStats {
        let c = &self.counters;
        SchedulerStats {
            scheduled: c.scheduled.load(Ordering::SeqCst),
            merged: c.merged.load(Ordering::SeqCst),
            succeeded: c.succeeded.load(Ordering::SeqCst),
            failed_attempts: c.failed_attempts.load(Ordering::SeqCst),
            given_up: c.given_up.load(Ordering::SeqCst),
            cancelled: c.cancelled.load(Ordering::SeqCst),
            pending: c.pending.load(Ordering::SeqCst),
            in_flight: c.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Nothing pending and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.counters.pending.load(Ordering::SeqCst) == 0
            && self.counters.in_flight.load(Ordering::SeqCst) == 0
    }

    /// The worker has exited.
    pub fn is_stopped(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(true, |h| h.is_finished())
    }

    /// Let queued work finish for up to `attempts` cycles of `cycle` each.
    ///
    /// Returns true when the queue emptied within the budget.
    pub async fn drain(&self, attempts: u32, cycle: Duration) -> bool {
        for attempt in 1..=attempts {
            if self.is_idle() {
                return true;
            }
            let stats = self.stats();
            info!(
                destination = %self.name,
                attempt,
                attempts,
                pending = stats.pending,
                in_flight = stats.in_flight,
                "draining replication queue"
            );
            tokio::time::sleep(cycle).await;
        }
        let idle = self.is_idle();
        if !idle {
            let stats = self.stats();
            warn!(
                destination = %self.name,
                attempts,
                pending = stats.pending,
                in_flight = stats.in_flight,
                "replication queue not empty after draining"
            );
        }
        idle
    }

    /// Stop the worker, interrupting everything still queued or running.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(destination = %self.name, error = %e, "push scheduler ended abnormally");
            }
        }
    }
}

struct PendingTask {
    task: ReplicationTask,
    timer: Option<delay_queue::Key>,
}

type PushOutcome = std::result::Result<PushReport, TransportError>;

struct Worker {
    destination: Arc<Destination>,
    transport: Arc<dyn PushTransport>,
    counters: Arc<Counters>,
    pending: HashMap<TaskKey, PendingTask>,
    /// Due tasks waiting for a free slot or for their key to stop running.
    ready: VecDeque<TaskKey>,
    running: HashMap<TaskKey, ReplicationTask>,
    timers: DelayQueue<TaskKey>,
    pushes: JoinSet<PushOutcome>,
    push_ids: HashMap<Id, TaskKey>,
    retired: bool,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        let mut open = true;
        loop {
            if self.retired && self.pending.is_empty() && self.running.is_empty() {
                debug!(destination = %self.destination.name(), "retired scheduler empty, exiting");
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cmd = rx.recv(), if open => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => {
                        open = false;
                        self.retired = true;
                    }
                },
                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    self.on_due(expired.into_inner());
                }
                Some(joined) = self.pushes.join_next_with_id(), if !self.pushes.is_empty() => {
                    self.on_push_done(joined);
                }
            }
            self.dispatch();
        }
        self.interrupt_all(&mut rx);
    }

    fn name(&self) -> &str {
        self.destination.name()
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Enqueue { task, immediate } => {
                if self.retired {
                    Counters::dec(&self.counters.pending);
                    self.give_up(task, self.removed_reason());
                } else {
                    self.accept(task, immediate);
                }
            }
            Command::Reparent(destination) => {
                info!(
                    destination = %destination.name(),
                    pending = self.pending.len(),
                    in_flight = self.running.len(),
                    "destination reloaded"
                );
                self.destination = destination;
            }
            Command::Retire => self.retire(),
            Command::Snapshot(reply) => {
                let mut infos: Vec<TaskInfo> = self.running.values().map(|t| t.info()).collect();
                let mut queued: Vec<TaskInfo> = self.pending.values().map(|p| p.task.info()).collect();
                infos.sort_by_key(|i| i.id);
                queued.sort_by_key(|i| i.id);
                infos.extend(queued);
                let _ = reply.send(infos);
            }
        }
    }

    fn accept(&mut self, task: ReplicationTask, immediate: bool) {
        let key = task.key();

        if let Some(existing) = self.pending.get_mut(&key) {
            debug!(
                destination = %self.destination.name(),
                project = %key.project,
                url = %key.url,
                op = %task.op(),
                "merged into pending task"
            );
            existing.task.merge(task);
            if immediate {
                if let Some(timer) = &existing.timer {
                    self.timers.reset(timer, Duration::ZERO);
                }
            }
            Counters::inc(&self.counters.merged);
            Counters::dec(&self.counters.pending);
            return;
        }

        if matches!(key.scope, TaskScope::Ref(_)) {
            if let Some(full) = self.pending.get_mut(&key.full_sync()) {
                debug!(
                    destination = %self.destination.name(),
                    project = %key.project,
                    url = %key.url,
                    op = %task.op(),
                    "covered by pending full sync"
                );
                full.task.absorb(task);
                Counters::inc(&self.counters.merged);
                Counters::dec(&self.counters.pending);
                return;
            }
        }

        if key.scope == TaskScope::Delete {
            self.cancel_superseded(&key);
        }

        let mut task = task;
        if key.scope == TaskScope::All {
            self.absorb_covered(&key, &mut task);
        }

        let delay = if immediate {
            Duration::ZERO
        } else {
            self.destination.replication_delay()
        };
        debug!(
            destination = %self.destination.name(),
            project = %key.project,
            url = %key.url,
            op = %task.op(),
            delay = ?delay,
            "task queued"
        );
        let timer = self.arm(&key, delay);
        self.pending.insert(
            key,
            PendingTask {
                task,
                timer: Some(timer),
            },
        );
    }

    fn arm(&mut self, key: &TaskKey, delay: Duration) -> delay_queue::Key {
        self.timers.insert(key.clone(), delay.min(MAX_INTERVAL))
    }

    /// A full sync pushes every ref and HEAD, so pending single-ref and HEAD
    /// tasks of the same repository ride along with it.
    fn absorb_covered(&mut self, full: &TaskKey, task: &mut ReplicationTask) {
        let covered: Vec<TaskKey> = self
            .pending
            .keys()
            .filter(|k| {
                k.project == full.project
                    && k.url == full.url
                    && matches!(k.scope, TaskScope::Ref(_) | TaskScope::Head)
            })
            .cloned()
            .collect();
        for key in covered {
            if let Some(entry) = self.remove_pending(&key) {
                debug!(
                    destination = %self.destination.name(),
                    project = %key.project,
                    url = %key.url,
                    op = %entry.task.op(),
                    "folded into new full sync"
                );
                task.absorb(entry.task);
                Counters::inc(&self.counters.merged);
            }
        }
    }

    /// A deletion makes queued pushes of the same repository pointless.
    fn cancel_superseded(&mut self, delete: &TaskKey) {
        let doomed: Vec<TaskKey> = self
            .pending
            .keys()
            .filter(|k| k.project == delete.project && k.url == delete.url && k.scope != TaskScope::Delete)
            .cloned()
            .collect();
        for key in doomed {
            if let Some(entry) = self.remove_pending(&key) {
                debug!(
                    destination = %self.destination.name(),
                    project = %key.project,
                    url = %key.url,
                    op = %entry.task.op(),
                    "superseded by project deletion"
                );
                Counters::inc(&self.counters.cancelled);
                entry
                    .task
                    .finish(self.destination.name(), TaskOutcome::Cancelled { interrupted: false });
            }
        }
    }

    fn remove_pending(&mut self, key: &TaskKey) -> Option<PendingTask> {
        let entry = self.pending.remove(key)?;
        if let Some(timer) = &entry.timer {
            self.timers.remove(timer);
        }
        self.ready.retain(|k| k != key);
        Counters::dec(&self.counters.pending);
        Some(entry)
    }

    fn retire(&mut self) {
        self.retired = true;
        let keys: Vec<TaskKey> = self.pending.keys().cloned().collect();
        info!(
            destination = %self.destination.name(),
            dropped = keys.len(),
            in_flight = self.running.len(),
            "destination removed from configuration"
        );
        for key in keys {
            if let Some(entry) = self.remove_pending(&key) {
                self.give_up(entry.task, self.removed_reason());
            }
        }
    }

    fn removed_reason(&self) -> String {
        ReplError::DestinationRemoved {
            name: self.destination.name().to_string(),
        }
        .to_string()
    }

    fn on_due(&mut self, key: TaskKey) {
        if let Some(entry) = self.pending.get_mut(&key) {
            entry.timer = None;
            self.ready.push_back(key);
        }
    }

    /// Would running `key` now overlap a push that is already running?
    ///
    /// A full sync or a deletion touches every ref of its repository, so it
    /// overlaps any other task for the same project and URL.
    fn conflicts(&self, key: &TaskKey) -> bool {
        let whole_repo = |scope: &TaskScope| matches!(scope, TaskScope::All | TaskScope::Delete);
        self.running.keys().any(|r| {
            r == key
                || (r.project == key.project
                    && r.url == key.url
                    && (whole_repo(&r.scope) || whole_repo(&key.scope)))
        })
    }

    fn dispatch(&mut self) {
        let mut blocked = VecDeque::new();
        while self.running.len() < self.destination.threads() {
            let Some(key) = self.ready.pop_front() else {
                break;
            };
            if self.conflicts(&key) {
                blocked.push_back(key);
                continue;
            }
            if let Some(entry) = self.pending.remove(&key) {
                self.run_one(key, entry.task);
            }
        }
        while let Some(key) = blocked.pop_back() {
            self.ready.push_front(key);
        }
    }

    fn run_one(&mut self, key: TaskKey, mut task: ReplicationTask) {
        if self.retired || !self.destination.serves(task.project(), task.url()) {
            Counters::dec(&self.counters.pending);
            let reason = if self.retired {
                self.removed_reason()
            } else {
                format!(
                    "{} no longer replicates {} to {}",
                    self.destination.name(),
                    task.project(),
                    task.url()
                )
            };
            self.give_up(task, reason);
            return;
        }

        task.start_attempt();
        Counters::inc(&self.counters.in_flight);
        Counters::dec(&self.counters.pending);
        debug!(
            destination = %self.destination.name(),
            project = %task.project(),
            url = %task.url(),
            op = %task.op(),
            attempt = task.attempts(),
            "push started"
        );

        let request = PushRequest::for_task(&task, &self.destination);
        let transport = self.transport.clone();
        let handle = self.pushes.spawn(async move { transport.push(&request).await });
        self.push_ids.insert(handle.id(), key.clone());
        self.running.insert(key, task);
    }

    fn on_push_done(&mut self, joined: std::result::Result<(Id, PushOutcome), JoinError>) {
        let (id, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                self.on_push_lost(e);
                return;
            }
        };
        let Some(key) = self.push_ids.remove(&id) else {
            return;
        };
        let Some(mut task) = self.running.remove(&key) else {
            return;
        };

        match result {
            Ok(report) => {
                info!(
                    destination = %self.destination.name(),
                    project = %task.project(),
                    url = %task.url(),
                    op = %task.op(),
                    attempt = task.attempts(),
                    updated = report.updated_refs,
                    deleted = report.deleted_refs,
                    "replication succeeded"
                );
                Counters::inc(&self.counters.succeeded);
                Counters::dec(&self.counters.in_flight);
                task.finish(self.destination.name(), TaskOutcome::Succeeded);
            }
            Err(err) => {
                Counters::inc(&self.counters.failed_attempts);
                task.record_failure(err.to_string());
                self.after_failure(key, task, err);
            }
        }
    }

    /// The push task panicked or was aborted; its task cannot be retried safely.
    fn on_push_lost(&mut self, e: JoinError) {
        let Some(key) = self.push_ids.remove(&e.id()) else {
            warn!(destination = %self.destination.name(), error = %e, "unknown push task ended");
            return;
        };
        let Some(task) = self.running.remove(&key) else {
            return;
        };
        Counters::inc(&self.counters.failed_attempts);
        Counters::dec(&self.counters.in_flight);
        let reason = if e.is_panic() {
            "push task panicked".to_string()
        } else {
            "push task aborted".to_string()
        };
        self.give_up(task, reason);
    }

    fn after_failure(&mut self, key: TaskKey, mut task: ReplicationTask, err: TransportError) {
        let attempts = task.attempts();
        if self.retired {
            Counters::dec(&self.counters.in_flight);
            self.give_up(task, format!("{}; {}", err, self.removed_reason()));
            return;
        }
        let retry = self.destination.retry();
        if !retry.allows_retry(attempts) {
            Counters::dec(&self.counters.in_flight);
            self.give_up(task, err.to_string());
            return;
        }

        if let Some(newer) = self.pending.get_mut(&key) {
            warn!(
                destination = %self.destination.name(),
                project = %key.project,
                url = %key.url,
                op = %task.op(),
                attempt = attempts,
                error = %err,
                "push failed, newer request already queued"
            );
            newer.task.absorb(task);
            Counters::inc(&self.counters.merged);
            Counters::dec(&self.counters.in_flight);
            return;
        }

        let delay = retry.delay_after(attempts);
        warn!(
            destination = %self.destination.name(),
            project = %key.project,
            url = %key.url,
            op = %task.op(),
            attempt = attempts,
            error = %err,
            retry_in = ?delay,
            "push failed, will retry"
        );
        task.set_state(TaskState::RetryPending);
        Counters::inc(&self.counters.pending);
        Counters::dec(&self.counters.in_flight);
        let timer = self.arm(&key, delay);
        self.pending.insert(
            key,
            PendingTask {
                task,
                timer: Some(timer),
            },
        );
    }

    fn give_up(&self, task: ReplicationTask, reason: String) {
        Counters::inc(&self.counters.given_up);
        error!(
            destination = %self.name(),
            project = %task.project(),
            url = %task.url(),
            ref_name = %task.op(),
            attempts = task.attempts(),
            reason = %reason,
            "replication GIVEN_UP"
        );
        task.finish(self.name(), TaskOutcome::GivenUp { reason });
    }

    fn interrupt(&self, task: ReplicationTask) {
        Counters::inc(&self.counters.cancelled);
        warn!(
            destination = %self.name(),
            project = %task.project(),
            url = %task.url(),
            op = %task.op(),
            state = ?task.state(),
            "replication interrupted by shutdown"
        );
        task.finish(self.name(), TaskOutcome::Cancelled { interrupted: true });
    }

    fn interrupt_all(&mut self, rx: &mut mpsc::UnboundedReceiver<Command>) {
        self.pushes.abort_all();
        self.push_ids.clear();
        rx.close();
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                Command::Enqueue { task, .. } => {
                    Counters::dec(&self.counters.pending);
                    self.interrupt(task);
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(Vec::new());
                }
                Command::Reparent(_) | Command::Retire => {}
            }
        }
        let running: Vec<ReplicationTask> = self.running.drain().map(|(_, t)| t).collect();
        for task in running {
            Counters::dec(&self.counters.in_flight);
            self.interrupt(task);
        }
        let pending: Vec<PendingTask> = self.pending.drain().map(|(_, p)| p).collect();
        for entry in pending {
            Counters::dec(&self.counters.pending);
            self.interrupt(entry.task);
        }
        self.ready.clear();
        self.timers.clear();
        debug!(destination = %self.name(), "push scheduler stopped");
    }
}
