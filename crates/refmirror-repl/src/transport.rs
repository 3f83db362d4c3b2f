//! The push transport seam.
//!
//! The engine only decides when and where to push; moving objects is left to
//! an implementation of [`PushTransport`]. An in-process implementation lives
//! in [`crate::memory`].

use crate::destination::Destination;
use crate::error::TransportError;
use crate::task::{PushOp, ReplicationTask};
use async_trait::async_trait;
use serde::Serialize;

/// Everything a transport needs to perform one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushRequest {
    /// Destination name.
    pub destination: String,
    /// Concrete remote URL.
    pub url: String,
    /// Source project.
    pub project: String,
    /// What to push.
    pub op: PushOp,
    /// Remove remote refs absent on the source during a full sync.
    pub mirror: bool,
    /// Create the remote repository when missing.
    pub create_missing: bool,
}

impl PushRequest {
    /// Request for one attempt of `task` against `destination`.
    pub fn for_task(task: &ReplicationTask, destination: &Destination) -> Self {
        Self {
            destination: destination.name().to_string(),
            url: task.url().to_string(),
            project: task.project().to_string(),
            op: task.op().clone(),
            mirror: destination.mirror(),
            create_missing: destination.create_missing_repositories(),
        }
    }
}

/// What a successful attempt changed on the remote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    /// Refs created or moved.
    pub updated_refs: usize,
    /// Refs removed.
    pub deleted_refs: usize,
    /// The remote repository had to be created.
    pub created_repository: bool,
}

/// Performs pushes against remote repositories.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    /// Perform one push attempt.
    ///
    /// Full syncs must replicate every ref of the project, not just one.
    async fn push(&self, request: &PushRequest) -> Result<PushReport, TransportError>;
}
