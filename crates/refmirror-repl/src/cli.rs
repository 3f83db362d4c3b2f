//! Operator command line.

use crate::config::{FileConfigSource, RawConfig};
use crate::controller::ReplicationController;
use crate::destination::ReplicationConfig;
use crate::memory::{MemoryRepos, MemoryTransport, RepoContents};
use crate::queue::ReplicationEvent;
use crate::state::ReplicationState;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// `refmirror` arguments.
#[derive(Debug, Parser)]
#[command(name = "refmirror")]
#[command(about = "Push replication for mirrored git repositories", long_about = None)]
pub struct Cli {
    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// `refmirror` subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validate a configuration file and list its destinations.
    Check {
        /// Configuration file.
        #[arg(short, long, env = "REFMIRROR_CONFIG", default_value = "/etc/refmirror/replication.toml")]
        config: PathBuf,
    },
    /// Print the URLs a project replicates to.
    Resolve {
        /// Configuration file.
        #[arg(short, long, env = "REFMIRROR_CONFIG", default_value = "/etc/refmirror/replication.toml")]
        config: PathBuf,
        /// Project name.
        #[arg(short, long)]
        project: String,
        /// Only URLs matching this template or literal URL.
        #[arg(short, long)]
        url: Option<String>,
    },
    /// Feed events through the engine against in-memory repositories.
    Replay {
        /// Configuration file.
        #[arg(short, long, env = "REFMIRROR_CONFIG", default_value = "/etc/refmirror/replication.toml")]
        config: PathBuf,
        /// Events, one JSON object per line.
        #[arg(short, long)]
        events: PathBuf,
        /// Initial source repositories as a JSON object.
        #[arg(short, long)]
        source: Option<PathBuf>,
    },
}

#[derive(Debug, Serialize)]
struct ReplayOutput {
    remotes: BTreeMap<String, RepoContents>,
    pushes: usize,
    interrupted: u64,
}

impl Cli {
    /// Run the selected subcommand.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Check { ref config } => check(config),
            Command::Resolve {
                ref config,
                ref project,
                ref url,
            } => resolve(config, project, url.as_deref()),
            Command::Replay {
                ref config,
                ref events,
                ref source,
            } => replay(config, events, source.as_deref()).await,
        }
    }
}

fn load(path: &Path) -> Result<ReplicationConfig> {
    let raw = RawConfig::from_file(path).with_context(|| format!("reading {}", path.display()))?;
    ReplicationConfig::load(&raw).with_context(|| format!("validating {}", path.display()))
}

fn check(path: &Path) -> Result<()> {
    let config = load(path)?;
    println!("Configuration OK: {} destination(s)", config.destinations().len());
    for dest in config.destinations() {
        let urls: Vec<&str> = dest.urls().iter().map(|u| u.as_str()).collect();
        println!(
            "  {}: delay={}s retry={}s threads={} drain={} deletions={} urls={}",
            dest.name(),
            dest.replication_delay().as_secs(),
            dest.retry().interval.as_secs(),
            dest.threads(),
            dest.drain_queue_attempts(),
            dest.replicate_project_deletions(),
            urls.join(",")
        );
    }
    Ok(())
}

fn resolve(path: &Path, project: &str, url: Option<&str>) -> Result<()> {
    let config = load(path)?;
    for (dest, url) in config.resolve(url.unwrap_or("*"), project)? {
        println!("{}\t{}", dest.name(), url);
    }
    Ok(())
}

fn apply_to_source(source: &MemoryRepos, event: &ReplicationEvent) {
    match event {
        ReplicationEvent::ProjectCreated { project } => {
            source.create(project);
        }
        ReplicationEvent::RefUpdated {
            project,
            ref_name,
            new_revision,
        } => match new_revision {
            Some(oid) => source.set_ref(project, ref_name, oid),
            None => {
                source.delete_ref(project, ref_name);
            }
        },
        ReplicationEvent::BranchCreated {
            project,
            ref_name,
            from_revision: Some(oid),
        } => source.set_ref(project, ref_name, oid),
        ReplicationEvent::HeadChanged { project, new_head } => source.set_head(project, new_head),
        ReplicationEvent::ProjectDeleted { project, .. } => {
            source.remove(project);
        }
        ReplicationEvent::BranchCreated { .. } => {}
    }
}

async fn replay(config: &Path, events: &Path, source: Option<&Path>) -> Result<()> {
    let repos = match source {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let map: HashMap<String, RepoContents> =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
            MemoryRepos::from_map(map)
        }
        None => MemoryRepos::new(),
    };
    let transport = Arc::new(MemoryTransport::new(repos.clone(), MemoryRepos::new()));
    let controller = ReplicationController::start(
        Arc::new(FileConfigSource::new(config.to_path_buf())),
        transport.clone(),
    )?;

    let text = std::fs::read_to_string(events).with_context(|| format!("reading {}", events.display()))?;
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: ReplicationEvent = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: bad event", events.display(), line_no + 1))?;
        apply_to_source(&repos, &event);
        if let Err(e) = controller.queue().on_event(&event, ReplicationState::noop()) {
            tracing::warn!(line = line_no + 1, error = %e, "event not dispatched");
        }
    }

    let report = controller.shutdown().await;
    let output = ReplayOutput {
        remotes: transport.remotes().snapshot(),
        pushes: transport.push_log().len(),
        interrupted: report.interrupted,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
