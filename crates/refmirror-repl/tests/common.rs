//! Common fixtures for the replication integration tests.

#![allow(dead_code)]

use refmirror_repl::memory::{MemoryRepos, MemoryTransport};
use refmirror_repl::{ReplicationController, StaticConfigSource};
use std::sync::Arc;
use std::time::Duration;

/// Seconds before the first push attempt in test configurations.
pub const TEST_REPLICATION_DELAY: u64 = 1;
/// Minutes between attempts in test configurations.
pub const TEST_REPLICATION_RETRY: u64 = 1;

/// Long enough for one push including one retry.
pub fn test_timeout() -> Duration {
    Duration::from_secs(TEST_REPLICATION_DELAY + TEST_REPLICATION_RETRY * 60 + 1)
}

/// A `[remote.NAME]` section with the test delays unless `extra` sets them.
pub fn remote(name: &str, url: &str, extra: &str) -> String {
    let mut section = format!("[remote.{name}]\nurl = \"{url}\"\n");
    if !extra.contains("replicationDelay") {
        section.push_str(&format!("replicationDelay = {TEST_REPLICATION_DELAY}\n"));
    }
    if !extra.contains("replicationRetry") {
        section.push_str(&format!("replicationRetry = {TEST_REPLICATION_RETRY}\n"));
    }
    section.push_str(extra);
    section.push('\n');
    section
}

/// Location of a replica in the test layout.
pub fn replica_url(project: &str) -> String {
    format!("/srv/git/{project}replica.git")
}

/// Templated URL matching [`replica_url`].
pub const REPLICA_TEMPLATE: &str = "/srv/git/${name}replica.git";

/// Running engine over in-memory repositories.
pub struct Harness {
    pub source: MemoryRepos,
    pub transport: Arc<MemoryTransport>,
    pub config: Arc<StaticConfigSource>,
    pub controller: Arc<ReplicationController>,
}

impl Harness {
    /// Start the engine with `config` text.
    pub fn start(config: &str) -> Self {
        let source = MemoryRepos::new();
        let transport = Arc::new(MemoryTransport::new(source.clone(), MemoryRepos::new()));
        let config = Arc::new(StaticConfigSource::new(config));
        let controller = ReplicationController::start(config.clone(), transport.clone())
            .expect("test configuration is valid");
        Self {
            source,
            transport,
            config,
            controller,
        }
    }

    /// Create a project on the source with one commit on master.
    pub fn create_project(&self, project: &str) {
        self.source.set_ref(project, "refs/heads/master", "c0");
        self.source.set_head(project, "refs/heads/master");
    }

    /// Object id of a ref on the replica of `project`.
    pub fn replica_ref(&self, url: &str, ref_name: &str) -> Option<String> {
        self.transport.remotes().get_ref(url, ref_name)
    }
}
