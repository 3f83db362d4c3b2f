#![warn(missing_docs)]

//! refmirror replication engine: delayed, retried and coalesced pushes of
//! repository changes to configured mirror destinations, with live reload and
//! drained shutdown.

pub mod cli;
pub mod config;
pub mod controller;
pub mod destination;
pub mod error;
pub mod memory;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod task;
pub mod transport;
pub mod url_template;

pub use config::{ConfigSource, FileConfigSource, RawConfig, StaticConfigSource};
pub use controller::{ControllerState, ReloadReport, ReplicationController, ShutdownReport};
pub use destination::{Destination, ReplicationConfig};
pub use error::{ReplError, Result, TransportError};
pub use queue::{NotifyHandling, ReplicationEvent, ReplicationQueue};
pub use state::{PushResultListener, ReplicationState, ReplicationSummary, TaskOutcome, TaskResult};
pub use task::{PushOp, ReplicationTask, TaskState};
pub use transport::{PushReport, PushRequest, PushTransport};
