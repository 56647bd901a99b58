//! In-memory remote tree for tests and dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{Node, NodeKind, RemoteResult, RemoteTree};
use crate::error::RemoteError;

#[derive(Default)]
struct State {
    nodes: HashMap<String, Node>,
    contents: HashMap<String, Vec<u8>>,
    children: HashMap<String, Vec<String>>,
    failures: HashMap<String, (u32, RemoteError)>,
    late_failures: HashMap<String, (u32, RemoteError)>,
    uploads: Vec<Node>,
    next_id: u64,
}

impl State {
    fn insert(&mut self, name: &str, kind: NodeKind, parent: &str) -> Node {
        self.next_id += 1;
        let node = Node {
            id: format!("n{}", self.next_id),
            name: name.to_string(),
            kind,
            parents: if parent.is_empty() {
                vec![]
            } else {
                vec![parent.to_string()]
            },
        };
        self.children
            .entry(parent.to_string())
            .or_default()
            .push(node.id.clone());
        self.nodes.insert(node.id.clone(), node.clone());
        node
    }

    fn take_failure(&mut self, key: &str) -> RemoteResult<()> {
        take_armed(&mut self.failures, key)
    }

    fn require_folder(&self, id: &str) -> RemoteResult<()> {
        if id.is_empty() {
            return Ok(());
        }
        match self.nodes.get(id) {
            Some(node) if node.kind == NodeKind::Folder => Ok(()),
            Some(_) => Err(RemoteError::Permanent(format!("{} is not a folder", id))),
            None => Err(RemoteError::NotFound(format!("folder {}", id))),
        }
    }
}

/// Consumes one armed failure for `key`, if any.
fn take_armed(armed: &mut HashMap<String, (u32, RemoteError)>, key: &str) -> RemoteResult<()> {
    let Some((remaining, err)) = armed.get_mut(key) else {
        return Ok(());
    };
    let err = err.clone();
    *remaining = remaining.saturating_sub(1);
    if *remaining == 0 {
        armed.remove(key);
    }
    Err(err)
}

/// Tree held in a hash map. The empty id is the top level.
///
/// Setup helpers are synchronous so tests can build fixtures before any
/// runtime exists. Every trait call is counted, failures can be armed per
/// id, and uploads can be held back by a semaphore to freeze a walk at a
/// known point.
#[derive(Default)]
pub struct MemoryTree {
    state: Mutex<State>,
    calls: AtomicUsize,
    upload_gate: Option<Arc<Semaphore>>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each upload consumes one permit from `gate` before it lands.
    pub fn with_upload_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.upload_gate = Some(gate);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned fixture only happens after a test already panicked.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_folder(&self, name: &str, parent: &str) -> String {
        self.lock().insert(name, NodeKind::Folder, parent).id
    }

    pub fn add_file(&self, name: &str, kind: NodeKind, bytes: Vec<u8>, parent: &str) -> String {
        let mut state = self.lock();
        let id = state.insert(name, kind, parent).id;
        state.contents.insert(id.clone(), bytes);
        id
    }

    /// Fails the next `times` calls keyed on `id` (the folder for listing
    /// and creation, the file for download, the parent for upload).
    pub fn fail_on(&self, id: &str, times: u32, err: RemoteError) {
        self.lock().failures.insert(id.to_string(), (times, err));
    }

    /// Makes the next `times` creations of a node called `name` land and
    /// then report `err`, like a response lost after the server committed.
    pub fn fail_after_commit(&self, name: &str, times: u32, err: RemoteError) {
        self.lock()
            .late_failures
            .insert(name.to_string(), (times, err));
    }

    pub fn children_of(&self, id: &str) -> Vec<Node> {
        let state = self.lock();
        state
            .children
            .get(id)
            .map(|ids| ids.iter().filter_map(|c| state.nodes.get(c).cloned()).collect())
            .unwrap_or_default()
    }

    pub fn find_child(&self, parent: &str, name: &str) -> Option<Node> {
        self.children_of(parent).into_iter().find(|n| n.name == name)
    }

    pub fn contents(&self, id: &str) -> Option<Vec<u8>> {
        self.lock().contents.get(id).cloned()
    }

    /// Uploaded nodes, in upload order.
    pub fn uploads(&self) -> Vec<Node> {
        self.lock().uploads.clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteTree for MemoryTree {
    async fn list_children(&self, folder_id: &str) -> RemoteResult<Vec<Node>> {
        self.record_call();
        {
            let mut state = self.lock();
            state.take_failure(folder_id)?;
            state.require_folder(folder_id)?;
        }
        Ok(self.children_of(folder_id))
    }

    async fn get_metadata(&self, id: &str) -> RemoteResult<Node> {
        self.record_call();
        let mut state = self.lock();
        state.take_failure(id)?;
        state
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("node {}", id)))
    }

    async fn create_folder(&self, name: &str, parent_id: &str) -> RemoteResult<String> {
        self.record_call();
        let mut state = self.lock();
        state.take_failure(parent_id)?;
        state.require_folder(parent_id)?;
        let id = state.insert(name, NodeKind::Folder, parent_id).id;
        take_armed(&mut state.late_failures, name)?;
        Ok(id)
    }

    async fn download(&self, file_id: &str) -> RemoteResult<Vec<u8>> {
        self.record_call();
        let mut state = self.lock();
        state.take_failure(file_id)?;
        state
            .contents
            .get(file_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("file {}", file_id)))
    }

    async fn upload(&self, bytes: Vec<u8>, name: &str, parent_id: &str) -> RemoteResult<String> {
        self.record_call();
        if let Some(gate) = &self.upload_gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| RemoteError::Permanent("upload gate closed".into()))?;
            permit.forget();
        }
        let mut state = self.lock();
        state.take_failure(parent_id)?;
        state.require_folder(parent_id)?;
        let node = state.insert(name, NodeKind::Document, parent_id);
        state.contents.insert(node.id.clone(), bytes);
        state.uploads.push(node.clone());
        take_armed(&mut state.late_failures, name)?;
        Ok(node.id)
    }
}
