//! Mirror a remote folder tree while stamping every PDF with a logo.
//!
//! [`Orchestrator::start`] renders the overlay, creates the destination
//! root and hands the rest to a background walker; progress is read back
//! with [`Orchestrator::progress`].

pub mod builder;
pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod pdf;
pub mod remote;
pub mod task;
pub mod transform;
pub mod walker;
pub mod watermark;

pub use config::{Config, MirrorOptions, RenderOptions, RetryPolicy};
pub use error::{Error, RemoteError, RenderError, Result, TransformError};
pub use job::{resolve_folder_ref, Orchestrator, ProgressReply};
pub use remote::{DriveClient, LocalTree, MemoryTree, Node, NodeKind, RemoteTree, TreeHandle};
pub use task::{TaskEntry, TaskId, TaskRegistry, TaskSnapshot, TaskStatus};
