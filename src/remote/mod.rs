//! Remote folder tree abstraction.
//!
//! The walker only needs five operations from a storage provider; anything
//! that can list, inspect, create folders, download and upload implements
//! [`RemoteTree`]. Credentials are the implementation's business.

mod drive;
mod local;
mod memory;

pub use self::drive::DriveClient;
pub use self::local::LocalTree;
pub use self::memory::MemoryTree;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
pub const PDF_MIME: &str = "application/pdf";

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;
pub type TreeHandle = Arc<dyn RemoteTree>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Folder,
    Document,
    Other,
}

impl NodeKind {
    pub fn from_mime(mime: &str) -> Self {
        match mime {
            FOLDER_MIME => NodeKind::Folder,
            PDF_MIME => NodeKind::Document,
            _ => NodeKind::Other,
        }
    }
}

/// Snapshot of one remote entry, fetched on demand and never cached across jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub parents: Vec<String>,
}

#[async_trait]
pub trait RemoteTree: Send + Sync {
    /// Immediate children of `folder_id`, in the provider's native order.
    async fn list_children(&self, folder_id: &str) -> RemoteResult<Vec<Node>>;

    async fn get_metadata(&self, id: &str) -> RemoteResult<Node>;

    /// Creates a folder and returns its id.
    async fn create_folder(&self, name: &str, parent_id: &str) -> RemoteResult<String>;

    async fn download(&self, file_id: &str) -> RemoteResult<Vec<u8>>;

    /// Uploads `bytes` as a new PDF and returns its id.
    async fn upload(&self, bytes: Vec<u8>, name: &str, parent_id: &str) -> RemoteResult<String>;
}
