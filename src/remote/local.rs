//! A local directory exposed as a remote tree, for offline runs.
//!
//! Node ids are `/`-separated paths relative to the root; the empty id is
//! the root itself. Ids are normalized, so `.` and `./a` name the same nodes
//! as `` and `a`. Directories are folders, `*.pdf` files are documents.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{Node, NodeKind, RemoteResult, RemoteTree};
use crate::error::RemoteError;

#[derive(Debug, Clone)]
pub struct LocalTree {
    root: PathBuf,
}

impl LocalTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, id: &str) -> RemoteResult<PathBuf> {
        let relative = Path::new(id);
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(RemoteError::Permanent(format!(
                        "path '{}' escapes the tree root",
                        id
                    )))
                }
            }
        }
        Ok(self.root.join(relative))
    }

    async fn node_for(&self, id: &str, path: &Path) -> RemoteResult<Node> {
        let meta = fs::metadata(path).await.map_err(|e| io_error(id, e))?;
        let name = if id.is_empty() {
            self.root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        Ok(Node {
            id: id.to_string(),
            kind: kind_of(&name, meta.is_dir()),
            name,
            parents: parent_id(id).into_iter().collect(),
        })
    }
}

fn kind_of(name: &str, is_dir: bool) -> NodeKind {
    if is_dir {
        NodeKind::Folder
    } else if Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
    {
        NodeKind::Document
    } else {
        NodeKind::Other
    }
}

fn parent_id(id: &str) -> Option<String> {
    if id.is_empty() {
        return None;
    }
    Some(id.rsplit_once('/').map(|(p, _)| p).unwrap_or("").to_string())
}

/// Drops `.` and empty segments. Escaping segments are rejected by `resolve`.
fn normalize(id: &str) -> String {
    id.split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn child_id(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

fn io_error(id: &str, err: std::io::Error) -> RemoteError {
    match err.kind() {
        ErrorKind::NotFound => RemoteError::NotFound(format!("'{}'", id)),
        ErrorKind::PermissionDenied => RemoteError::Auth(format!("'{}': {}", id, err)),
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {
            RemoteError::Transient(format!("'{}': {}", id, err))
        }
        _ => RemoteError::Permanent(format!("'{}': {}", id, err)),
    }
}

#[async_trait]
impl RemoteTree for LocalTree {
    async fn list_children(&self, folder_id: &str) -> RemoteResult<Vec<Node>> {
        let dir = self.resolve(folder_id)?;
        let folder_id = normalize(folder_id);
        let folder_id = folder_id.as_str();
        let mut entries = fs::read_dir(&dir).await.map_err(|e| io_error(folder_id, e))?;
        let mut nodes = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(folder_id, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| io_error(folder_id, e))?
                .is_dir();
            nodes.push(Node {
                id: child_id(folder_id, &name),
                kind: kind_of(&name, is_dir),
                name,
                parents: vec![folder_id.to_string()],
            });
        }
        // read_dir order is unspecified; sort for stable runs.
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    async fn get_metadata(&self, id: &str) -> RemoteResult<Node> {
        let path = self.resolve(id)?;
        self.node_for(&normalize(id), &path).await
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> RemoteResult<String> {
        let id = child_id(&normalize(parent_id), name);
        let path = self.resolve(&id)?;
        fs::create_dir(&path).await.map_err(|e| io_error(&id, e))?;
        Ok(id)
    }

    async fn download(&self, file_id: &str) -> RemoteResult<Vec<u8>> {
        let path = self.resolve(file_id)?;
        fs::read(&path).await.map_err(|e| io_error(file_id, e))
    }

    async fn upload(&self, bytes: Vec<u8>, name: &str, parent_id: &str) -> RemoteResult<String> {
        let id = child_id(&normalize(parent_id), name);
        let path = self.resolve(&id)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| io_error(&id, e))?;
        file.write_all(&bytes).await.map_err(|e| io_error(&id, e))?;
        file.flush().await.map_err(|e| io_error(&id, e))?;
        Ok(id)
    }
}
