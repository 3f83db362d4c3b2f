//! Lifecycle of the configuration and of all push schedulers.
//!
//! The controller loads configuration, starts one scheduler per destination
//! and hands events to the [`ReplicationQueue`]. Reload and shutdown run in
//! one exclusive section: a reload swaps in a new configuration snapshot while
//! keeping every queued task, and shutdown drains each destination for its
//! configured number of attempts before interrupting what is left.

use crate::config::ConfigSource;
use crate::destination::ReplicationConfig;
use crate::error::{ReplError, Result};
use crate::queue::{ReplicationQueue, Snapshot};
use crate::scheduler::PushScheduler;
use crate::state::ReplicationState;
use crate::transport::PushTransport;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Controller lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerState {
    /// Accepting events.
    Running,
    /// Swapping configuration.
    Reloading,
    /// Draining destinations.
    ShuttingDown,
    /// Terminal.
    Stopped,
}

/// What a reload changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    /// Destinations that were started.
    pub added: Vec<String>,
    /// Destinations that were retired.
    pub removed: Vec<String>,
    /// Destinations whose queue carried over.
    pub kept: Vec<String>,
}

/// Drain result of one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainOutcome {
    /// Destination name.
    pub destination: String,
    /// Attempt budget that applied.
    pub attempts: u32,
    /// The queue emptied within the budget.
    pub drained: bool,
}

/// What shutdown did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Per-destination drain results.
    pub destinations: Vec<DrainOutcome>,
    /// Tasks interrupted when the schedulers stopped.
    pub interrupted: u64,
}

#[derive(Default)]
struct Lifecycle {
    fingerprint: Option<u64>,
    retired: Vec<Arc<PushScheduler>>,
    shutdown: Option<ShutdownReport>,
}

/// Owns configuration reloads and shutdown.
pub struct ReplicationController {
    source: Arc<dyn ConfigSource>,
    transport: Arc<dyn PushTransport>,
    queue: Arc<ReplicationQueue>,
    state: Mutex<ControllerState>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ReplicationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationController")
            .field("source", &self.source.describe())
            .field("state", &self.state())
            .finish()
    }
}

impl ReplicationController {
    /// Load configuration from `source` and start one scheduler per destination.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(source: Arc<dyn ConfigSource>, transport: Arc<dyn PushTransport>) -> Result<Arc<Self>> {
        let fingerprint = source.fingerprint();
        let config = ReplicationConfig::load(&source.load()?)?;
        let cancel = CancellationToken::new();
        let schedulers = config
            .destinations()
            .iter()
            .map(|d| {
                (
                    d.name().to_string(),
                    Arc::new(PushScheduler::spawn(d.clone(), transport.clone(), &cancel)),
                )
            })
            .collect::<HashMap<_, _>>();
        info!(
            source = %source.describe(),
            destinations = schedulers.len(),
            "replication started"
        );
        let queue = Arc::new(ReplicationQueue::new(Snapshot {
            config: Arc::new(config),
            schedulers,
        }));
        Ok(Arc::new(Self {
            source,
            transport,
            queue,
            state: Mutex::new(ControllerState::Running),
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                fingerprint,
                ..Default::default()
            }),
            cancel,
        }))
    }

    /// The event entry point.
    pub fn queue(&self) -> &Arc<ReplicationQueue> {
        &self.queue
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ControllerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Reload configuration now.
    ///
    /// Kept destinations keep their queues, new ones get a scheduler and removed
    /// ones finish their running pushes and then stop. A configuration error
    /// leaves the previous configuration in force.
    pub async fn force_reload(&self) -> Result<ReloadReport> {
        let mut life = self.lifecycle.lock().await;
        self.reload_locked(&mut life).await
    }

    /// Reload only if the source's fingerprint changed since the last load.
    pub async fn reload_if_changed(&self) -> Result<Option<ReloadReport>> {
        let mut life = self.lifecycle.lock().await;
        let current = self.source.fingerprint();
        if current.is_none() || current == life.fingerprint {
            return Ok(None);
        }
        self.reload_locked(&mut life).await.map(Some)
    }

    async fn reload_locked(&self, life: &mut Lifecycle) -> Result<ReloadReport> {
        if self.state() != ControllerState::Running {
            return Err(ReplError::Shutdown);
        }
        self.set_state(ControllerState::Reloading);
        let result = self.swap_config(life);
        self.set_state(ControllerState::Running);
        result
    }

    fn swap_config(&self, life: &mut Lifecycle) -> Result<ReloadReport> {
        let fingerprint = self.source.fingerprint();
        let config = match self.source.load().and_then(|raw| ReplicationConfig::load(&raw)) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    source = %self.source.describe(),
                    error = %e,
                    "reload failed, keeping previous configuration"
                );
                return Err(e);
            }
        };

        let old = self.queue.snapshot();
        let mut report = ReloadReport::default();
        let mut schedulers = HashMap::new();
        for dest in config.destinations() {
            let sched = match old.schedulers.get(dest.name()) {
                Some(sched) => {
                    sched.reparent(dest.clone());
                    report.kept.push(dest.name().to_string());
                    sched.clone()
                }
                None => {
                    report.added.push(dest.name().to_string());
                    Arc::new(PushScheduler::spawn(dest.clone(), self.transport.clone(), &self.cancel))
                }
            };
            schedulers.insert(dest.name().to_string(), sched);
        }
        for (name, sched) in &old.schedulers {
            if !schedulers.contains_key(name) {
                sched.retire();
                report.removed.push(name.clone());
                life.retired.push(sched.clone());
            }
        }
        life.retired.retain(|s| !s.is_stopped());

        self.queue.install(Snapshot {
            config: Arc::new(config),
            schedulers,
        });
        life.fingerprint = fingerprint;

        report.added.sort();
        report.removed.sort();
        report.kept.sort();
        info!(
            added = ?report.added,
            removed = ?report.removed,
            kept = ?report.kept,
            "configuration reloaded"
        );
        Ok(report)
    }

    /// Poll the source every `interval` and reload when it changed.
    ///
    /// Returns `None` when the configuration does not enable auto reload.
    pub fn spawn_auto_reload(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        if !self.queue.config().auto_reload() {
            return None;
        }
        let controller = Arc::clone(self);
        let cancel = self.cancel.child_token();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match controller.reload_if_changed().await {
                    Ok(_) => {}
                    Err(ReplError::Shutdown) => break,
                    Err(e) => debug!(error = %e, "auto reload skipped"),
                }
            }
            debug!("auto reload stopped");
        }))
    }

    /// Full-sync `projects` when the configuration asks for it at startup.
    pub fn replicate_on_startup<I, S>(&self, projects: I) -> Result<Option<ReplicationState>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if !self.queue.config().replicate_on_startup() {
            return Ok(None);
        }
        info!("replicating all projects on startup");
        self.queue.replicate_all(projects).map(Some)
    }

    /// Stop accepting events, drain every destination, then stop the schedulers.
    ///
    /// Later calls return the first call's report.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut life = self.lifecycle.lock().await;
        if let Some(report) = &life.shutdown {
            return report.clone();
        }
        self.set_state(ControllerState::ShuttingDown);
        self.queue.stop_accepting();

        let snapshot = self.queue.snapshot();
        let mut active: Vec<(Arc<PushScheduler>, u32, Duration)> = snapshot
            .schedulers
            .iter()
            .map(|(name, sched)| match snapshot.config.destination(name) {
                Some(dest) => (sched.clone(), dest.drain_queue_attempts(), dest.drain_cycle()),
                None => (sched.clone(), 0, Duration::from_secs(1)),
            })
            .collect();
        active.sort_by(|a, b| a.0.name().cmp(b.0.name()));
        info!(destinations = active.len(), "shutting down replication");

        let destinations = join_all(active.iter().map(|(sched, attempts, cycle)| async move {
            DrainOutcome {
                destination: sched.name().to_string(),
                attempts: *attempts,
                drained: sched.drain(*attempts, *cycle).await,
            }
        }))
        .await;

        let everything: Vec<Arc<PushScheduler>> = active
            .into_iter()
            .map(|(sched, _, _)| sched)
            .chain(life.retired.drain(..))
            .collect();
        let cancelled_before: u64 = everything.iter().map(|s| s.stats().cancelled).sum();
        join_all(everything.iter().map(|s| s.stop())).await;
        let cancelled_after: u64 = everything.iter().map(|s| s.stats().cancelled).sum();
        self.cancel.cancel();

        let report = ShutdownReport {
            destinations,
            interrupted: cancelled_after.saturating_sub(cancelled_before),
        };
        if report.interrupted > 0 {
            warn!(interrupted = report.interrupted, "replication stopped with unfinished tasks");
        } else {
            info!("replication stopped");
        }
        self.set_state(ControllerState::Stopped);
        life.shutdown = Some(report.clone());
        report
    }
}

impl Drop for ReplicationController {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
