//! The replication queue: entry point for repository events.
//!
//! Each event is fanned out to every destination replicating the project,
//! one task per resolved URL, all sharing a single [`ReplicationState`].
//! The queue reads the configuration snapshot installed by the controller and
//! never waits for a push.

use crate::destination::{Destination, ReplicationConfig};
use crate::error::{ReplError, Result};
use crate::scheduler::{PushScheduler, SchedulerStats};
use crate::state::ReplicationState;
use crate::task::{PushOp, ReplicationTask, TaskInfo};
use crate::url_template::validate_project_name;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Who the host notifies about a project deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifyHandling {
    /// Nobody.
    None,
    /// The owner only.
    Owner,
    /// Owner and reviewers.
    OwnerReviewers,
    /// Everyone.
    #[default]
    All,
}

/// A repository change raised by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ReplicationEvent {
    /// A project was created.
    ProjectCreated {
        /// Project name.
        project: String,
    },
    /// A ref was updated or deleted.
    RefUpdated {
        /// Project name.
        project: String,
        /// Updated ref.
        #[serde(rename = "ref")]
        ref_name: String,
        /// New object id, if the host reports it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_revision: Option<String>,
    },
    /// A branch was created.
    BranchCreated {
        /// Project name.
        project: String,
        /// New branch.
        #[serde(rename = "ref")]
        ref_name: String,
        /// Revision the branch starts at.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_revision: Option<String>,
    },
    /// The project's symbolic HEAD moved.
    HeadChanged {
        /// Project name.
        project: String,
        /// Branch HEAD now points at.
        new_head: String,
    },
    /// A project was deleted.
    ProjectDeleted {
        /// Project name.
        project: String,
        /// Notification policy of the deletion.
        #[serde(default)]
        notify: NotifyHandling,
    },
}

impl ReplicationEvent {
    /// Project the event is about.
    pub fn project(&self) -> &str {
        match self {
            ReplicationEvent::ProjectCreated { project }
            | ReplicationEvent::RefUpdated { project, .. }
            | ReplicationEvent::BranchCreated { project, .. }
            | ReplicationEvent::HeadChanged { project, .. }
            | ReplicationEvent::ProjectDeleted { project, .. } => project,
        }
    }
}

/// Configuration and schedulers the queue dispatches to.
#[derive(Debug, Default)]
pub(crate) struct Snapshot {
    pub(crate) config: Arc<ReplicationConfig>,
    pub(crate) schedulers: HashMap<String, Arc<PushScheduler>>,
}

/// Dispatches repository events to per-destination schedulers.
#[derive(Debug)]
pub struct ReplicationQueue {
    snapshot: RwLock<Arc<Snapshot>>,
    accepting: AtomicBool,
}

impl ReplicationQueue {
    pub(crate) fn new(snapshot: Snapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            accepting: AtomicBool::new(true),
        }
    }

    pub(crate) fn install(&self, snapshot: Snapshot) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshot);
    }

    pub(crate) fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn current(&self) -> Result<Arc<Snapshot>> {
        if !self.is_accepting() {
            return Err(ReplError::Shutdown);
        }
        Ok(self.snapshot())
    }

    /// New events are accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Configuration currently in force.
    pub fn config(&self) -> Arc<ReplicationConfig> {
        self.snapshot().config.clone()
    }

    /// Full-sync a new project to every destination replicating it.
    pub fn on_project_created(&self, project: &str) -> Result<ReplicationState> {
        self.fan_out(project, PushOp::FullSync, |_| true, ReplicationState::noop())
    }

    /// Push one updated ref.
    pub fn on_ref_updated(&self, project: &str, ref_name: &str) -> Result<ReplicationState> {
        self.fan_out(
            project,
            PushOp::Ref(ref_name.to_string()),
            |_| true,
            ReplicationState::noop(),
        )
    }

    /// Push a newly created branch.
    pub fn on_branch_created(&self, project: &str, ref_name: &str) -> Result<ReplicationState> {
        self.on_ref_updated(project, ref_name)
    }

    /// Move the remote HEAD; retried until the branch exists remotely.
    pub fn on_head_changed(&self, project: &str, new_head: &str) -> Result<ReplicationState> {
        self.fan_out(
            project,
            PushOp::Head(new_head.to_string()),
            |_| true,
            ReplicationState::noop(),
        )
    }

    /// Delete the project on destinations that replicate deletions.
    pub fn on_project_deleted(&self, project: &str, notify: NotifyHandling) -> Result<ReplicationState> {
        debug!(project, ?notify, "project deleted");
        self.fan_out(
            project,
            PushOp::DeleteProject,
            |d| d.replicate_project_deletions(),
            ReplicationState::noop(),
        )
    }

    /// Dispatch a typed event, reporting to `state`.
    pub fn on_event(&self, event: &ReplicationEvent, state: ReplicationState) -> Result<ReplicationState> {
        match event {
            ReplicationEvent::ProjectCreated { project } => {
                self.fan_out(project, PushOp::FullSync, |_| true, state)
            }
            ReplicationEvent::RefUpdated { project, ref_name, .. }
            | ReplicationEvent::BranchCreated { project, ref_name, .. } => {
                self.fan_out(project, PushOp::Ref(ref_name.clone()), |_| true, state)
            }
            ReplicationEvent::HeadChanged { project, new_head } => {
                self.fan_out(project, PushOp::Head(new_head.clone()), |_| true, state)
            }
            ReplicationEvent::ProjectDeleted { project, notify } => {
                debug!(project = %project, ?notify, "project deleted");
                self.fan_out(
                    project,
                    PushOp::DeleteProject,
                    |d| d.replicate_project_deletions(),
                    state,
                )
            }
        }
    }

    /// Full-sync `project` to the locations `url_or_pattern` selects.
    ///
    /// The pattern is a URL template, a literal URL, or `*` for every
    /// destination. Matching compares resolved locations, so a template and
    /// the literal URL it resolves to are equivalent. `now` skips the
    /// replication delay. Fails with [`ReplError::NoMatch`] without creating
    /// any task when nothing matches.
    pub fn schedule_full_sync(
        &self,
        project: &str,
        url_or_pattern: &str,
        state: ReplicationState,
        now: bool,
    ) -> Result<ReplicationState> {
        validate_project_name(project)?;
        let snapshot = self.current()?;
        let targets = snapshot.config.resolve(url_or_pattern, project)?;
        info!(project, pattern = url_or_pattern, targets = targets.len(), now, "full sync scheduled");
        let targets = targets
            .into_iter()
            .filter_map(|(dest, url)| Self::scheduler_for(&snapshot, &dest).map(|s| (s, url)))
            .collect();
        self.enqueue_all(project, PushOp::FullSync, targets, state, now)
    }

    /// Full-sync every listed project to every destination replicating it.
    pub fn replicate_all<I, S>(&self, projects: I) -> Result<ReplicationState>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let snapshot = self.current()?;
        let state = ReplicationState::noop();
        let mut targets = Vec::new();
        let mut names = Vec::new();
        for project in projects {
            let project = project.as_ref();
            if let Err(e) = validate_project_name(project) {
                warn!(project, error = %e, "skipping project");
                continue;
            }
            for (sched, url) in Self::targets(&snapshot, project, |_| true)? {
                targets.push((sched, url));
                names.push(project.to_string());
            }
        }
        let mut first_err = None;
        for ((sched, url), project) in targets.into_iter().zip(names) {
            let task = ReplicationTask::new(project, url, PushOp::FullSync, state.clone());
            if let Err(e) = sched.enqueue(task, false) {
                first_err.get_or_insert(e);
            }
        }
        state.mark_all_scheduled();
        match first_err {
            Some(e) => Err(e),
            None => Ok(state),
        }
    }

    /// Queued and running tasks per destination.
    pub async fn queue_info(&self) -> BTreeMap<String, Vec<TaskInfo>> {
        let snapshot = self.snapshot();
        let mut out = BTreeMap::new();
        for (name, sched) in &snapshot.schedulers {
            out.insert(name.clone(), sched.queue_snapshot().await);
        }
        out
    }

    /// Counters per destination.
    pub fn stats(&self) -> BTreeMap<String, SchedulerStats> {
        self.snapshot()
            .schedulers
            .iter()
            .map(|(name, sched)| (name.clone(), sched.stats()))
            .collect()
    }

    fn scheduler_for(snapshot: &Snapshot, dest: &Destination) -> Option<Arc<PushScheduler>> {
        let sched = snapshot.schedulers.get(dest.name()).cloned();
        if sched.is_none() {
            warn!(destination = %dest.name(), "no scheduler for destination");
        }
        sched
    }

    fn targets(
        snapshot: &Snapshot,
        project: &str,
        wanted: impl Fn(&Destination) -> bool,
    ) -> Result<Vec<(Arc<PushScheduler>, String)>> {
        let mut targets = Vec::new();
        for dest in snapshot.config.destinations_for(project) {
            if !wanted(dest.as_ref()) {
                debug!(destination = %dest.name(), project, "destination skips event");
                continue;
            }
            let Some(sched) = Self::scheduler_for(snapshot, &dest) else {
                continue;
            };
            for url in dest.resolve_urls(project)? {
                targets.push((sched.clone(), url));
            }
        }
        Ok(targets)
    }

    fn fan_out(
        &self,
        project: &str,
        op: PushOp,
        wanted: impl Fn(&Destination) -> bool,
        state: ReplicationState,
    ) -> Result<ReplicationState> {
        validate_project_name(project)?;
        let snapshot = self.current()?;
        let targets = Self::targets(&snapshot, project, wanted)?;
        debug!(project, op = %op, targets = targets.len(), "dispatching event");
        self.enqueue_all(project, op, targets, state, false)
    }

    fn enqueue_all(
        &self,
        project: &str,
        op: PushOp,
        targets: Vec<(Arc<PushScheduler>, String)>,
        state: ReplicationState,
        immediate: bool,
    ) -> Result<ReplicationState> {
        let mut first_err = None;
        for (sched, url) in targets {
            let task = ReplicationTask::new(project, url, op.clone(), state.clone());
            if let Err(e) = sched.enqueue(task, immediate) {
                first_err.get_or_insert(e);
            }
        }
        state.mark_all_scheduled();
        match first_err {
            Some(e) => Err(e),
            None => Ok(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;
    use crate::memory::{MemoryRepos, MemoryTransport};
    use crate::transport::PushTransport;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const CONFIG: &str = r#"
[remote.deleting]
url = "/a/${name}replica.git"
replicationDelay = 1
replicateProjectDeletions = true

[remote.keeping]
url = ["/b/${name}replica.git", "/c/${name}replica.git"]
replicationDelay = 1
projects = ["project", "other"]
"#;

    fn build(transport: Arc<MemoryTransport>, token: &CancellationToken) -> ReplicationQueue {
        let config = ReplicationConfig::load(&RawConfig::parse(CONFIG).unwrap()).unwrap();
        let transport: Arc<dyn PushTransport> = transport;
        let schedulers = config
            .destinations()
            .iter()
            .map(|d| {
                (
                    d.name().to_string(),
                    Arc::new(PushScheduler::spawn(d.clone(), transport.clone(), token)),
                )
            })
            .collect();
        ReplicationQueue::new(Snapshot {
            config: Arc::new(config),
            schedulers,
        })
    }

    fn transport() -> Arc<MemoryTransport> {
        let source = MemoryRepos::new();
        source.set_ref("project", "refs/heads/master", "c1");
        source.set_head("project", "refs/heads/master");
        source.set_ref("solo", "refs/heads/master", "c9");
        Arc::new(MemoryTransport::new(source, MemoryRepos::new()))
    }

    mod events {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_one_task_per_destination_url() {
            let transport = transport();
            let token = CancellationToken::new();
            let queue = build(transport.clone(), &token);

            let state = queue.on_project_created("project").unwrap();
            let summary = state.wait(Duration::from_secs(30)).await.unwrap();
            assert_eq!(summary.scheduled, 3);
            assert!(summary.all_succeeded());
            for url in ["/a/projectreplica.git", "/b/projectreplica.git", "/c/projectreplica.git"] {
                assert_eq!(transport.pushes_to(url), 1, "{url}");
            }
        }

        #[tokio::test(start_paused = true)]
        async fn test_allow_list_limits_fan_out() {
            let transport = transport();
            let token = CancellationToken::new();
            let queue = build(transport.clone(), &token);

            let state = queue.on_ref_updated("solo", "refs/heads/master").unwrap();
            let summary = state.wait(Duration::from_secs(30)).await.unwrap();
            assert_eq!(summary.scheduled, 1);
            assert_eq!(
                transport.remotes().get_ref("/a/soloreplica.git", "refs/heads/master").as_deref(),
                Some("c9")
            );
        }

        #[tokio::test(start_paused = true)]
        async fn test_deletion_only_where_enabled() {
            let transport = transport();
            let token = CancellationToken::new();
            let queue = build(transport.clone(), &token);
            queue
                .on_project_created("project")
                .unwrap()
                .wait(Duration::from_secs(30))
                .await
                .unwrap();

            let state = queue.on_project_deleted("project", NotifyHandling::None).unwrap();
            let summary = state.wait(Duration::from_secs(30)).await.unwrap();
            assert_eq!(summary.scheduled, 1);
            assert!(!transport.remotes().exists("/a/projectreplica.git"));
            assert!(transport.remotes().exists("/b/projectreplica.git"));
        }

        #[tokio::test(start_paused = true)]
        async fn test_typed_events_dispatch() {
            let transport = transport();
            let token = CancellationToken::new();
            let queue = build(transport.clone(), &token);
            let event: ReplicationEvent = serde_json::from_str(
                r#"{"type":"branch-created","project":"project","ref":"refs/heads/master"}"#,
            )
            .unwrap();
            assert_eq!(event.project(), "project");

            let state = queue.on_event(&event, ReplicationState::noop()).unwrap();
            assert_eq!(state.wait(Duration::from_secs(30)).await.unwrap().scheduled, 3);
        }

        #[test]
        fn test_deleted_event_defaults_notify() {
            let event: ReplicationEvent =
                serde_json::from_str(r#"{"type":"project-deleted","project":"p"}"#).unwrap();
            assert_eq!(
                event,
                ReplicationEvent::ProjectDeleted {
                    project: "p".to_string(),
                    notify: NotifyHandling::All,
                }
            );
        }

        #[tokio::test]
        async fn test_invalid_project_rejected() {
            let token = CancellationToken::new();
            let queue = build(transport(), &token);
            assert!(matches!(
                queue.on_project_created("../escape"),
                Err(ReplError::InvalidProjectName { .. })
            ));
        }

        #[tokio::test]
        async fn test_rejects_after_stop_accepting() {
            let token = CancellationToken::new();
            let queue = build(transport(), &token);
            queue.stop_accepting();
            assert!(matches!(
                queue.on_ref_updated("project", "refs/heads/master"),
                Err(ReplError::Shutdown)
            ));
        }
    }

    mod full_sync {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_template_and_literal_are_equivalent() {
            let transport = transport();
            let token = CancellationToken::new();
            let queue = build(transport.clone(), &token);

            for pattern in ["/b/${name}replica.git", "/b/projectreplica.git"] {
                let state = queue
                    .schedule_full_sync("project", pattern, ReplicationState::noop(), true)
                    .unwrap();
                let summary = state.wait(Duration::from_secs(5)).await.unwrap();
                assert_eq!(summary.scheduled, 1, "{pattern}");
            }
            assert_eq!(transport.pushes_to("/b/projectreplica.git"), 2);
            assert_eq!(transport.pushes_to("/c/projectreplica.git"), 0);
        }

        #[tokio::test]
        async fn test_no_match_creates_nothing() {
            let token = CancellationToken::new();
            let queue = build(transport(), &token);
            let state = ReplicationState::noop();
            let err = queue
                .schedule_full_sync("project", "/nowhere/${name}.git", state.clone(), true)
                .unwrap_err();
            assert!(matches!(err, ReplError::NoMatch { .. }));
            assert_eq!(state.summary().scheduled, 0);
            assert_eq!(queue.stats().values().map(|s| s.scheduled).sum::<u64>(), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn test_replicate_all() {
            let transport = transport();
            let token = CancellationToken::new();
            let queue = build(transport.clone(), &token);
            let state = queue.replicate_all(["project", "solo"]).unwrap();
            assert_eq!(state.wait(Duration::from_secs(30)).await.unwrap().scheduled, 4);
        }

        #[tokio::test(start_paused = true)]
        async fn test_queue_info_lists_pending() {
            let token = CancellationToken::new();
            let queue = build(transport(), &token);
            queue.on_ref_updated("project", "refs/heads/master").unwrap();
            let info = queue.queue_info().await;
            assert_eq!(info["deleting"].len(), 1);
            assert_eq!(info["keeping"].len(), 2);
        }
    }
}
