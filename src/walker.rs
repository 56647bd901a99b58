//! Tree mirror walker.
//!
//! Runs in two passes. The survey lists every folder of the source tree once
//! and counts its nodes, so progress is measured against a global total and
//! never goes backwards. The mirror pass then replays those listings depth
//! first, in listing order, with an explicit stack instead of recursion:
//! a destination folder is always created before anything is uploaded into
//! it.
//!
//! The destination root may itself sit inside the source tree (a source at
//! the provider's top level); it is left out of both passes.
//!
//! Pause and cancel are checked before every child. A cancelled or failed
//! walk leaves whatever it already created in the destination tree.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{MirrorOptions, RetryPolicy};
use crate::error::{Error, RemoteError, Result};
use crate::remote::{Node, NodeKind, RemoteResult, TreeHandle};
use crate::task::{TaskEntry, TaskStatus};
use crate::transform::{self, Overlay};

/// Everything one background walk owns.
pub struct WalkJob {
    pub client: TreeHandle,
    pub source_root: String,
    pub dest_root: String,
    pub overlay: Arc<Overlay>,
    pub options: MirrorOptions,
    pub task: Arc<TaskEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    Cancelled,
}

/// Source folder listings gathered before mirroring starts.
#[derive(Debug, Default)]
struct Survey {
    listings: HashMap<String, Vec<Node>>,
    total: usize,
}

struct Frame {
    source: String,
    children: std::vec::IntoIter<Node>,
}

/// Launches the walk on the runtime and returns immediately.
///
/// The task always ends in a terminal status, including when the walk
/// itself panics.
pub fn spawn(job: WalkJob) -> JoinHandle<()> {
    let task = Arc::clone(&job.task);
    let span = info_span!("walk", task_id = %task.id());
    tokio::spawn(async move {
        let inner = tokio::spawn(run(job).instrument(span));
        if let Err(e) = inner.await {
            error!(task_id = %task.id(), "walker aborted: {}", e);
            task.finish(TaskStatus::Failed, Some(format!("walker aborted: {}", e)));
        }
    })
}

async fn run(job: WalkJob) {
    let task = Arc::clone(&job.task);
    info!(source = %job.source_root, dest = %job.dest_root, "mirror started");

    match Walker::new(&job).walk().await {
        Ok(Outcome::Completed) => {
            task.finish(TaskStatus::Completed, None);
            let snap = task.snapshot();
            info!(
                uploaded = snap.uploaded,
                skipped = snap.skipped,
                "mirror completed"
            );
        }
        Ok(Outcome::Cancelled) => {
            task.finish(TaskStatus::Cancelled, None);
            info!(processed = task.snapshot().processed, "mirror cancelled");
        }
        Err(e) => {
            error!("mirror failed: {}", e);
            task.finish(TaskStatus::Failed, Some(e.to_string()));
        }
    }
}

struct Walker<'a> {
    job: &'a WalkJob,
    retry: &'a RetryPolicy,
}

impl<'a> Walker<'a> {
    fn new(job: &'a WalkJob) -> Self {
        Self {
            job,
            retry: &job.options.retry,
        }
    }

    async fn walk(&self) -> Result<Outcome> {
        let Some(survey) = self.survey().await? else {
            return Ok(Outcome::Cancelled);
        };
        self.job.task.set_total(survey.total);
        debug!(total = survey.total, folders = survey.listings.len(), "survey done");
        self.mirror(survey).await
    }

    /// Lists the whole source tree. `None` means the task was cancelled.
    async fn survey(&self) -> Result<Option<Survey>> {
        let mut survey = Survey::default();
        let mut seen = HashSet::new();
        let mut pending = vec![self.job.source_root.clone()];

        while let Some(folder) = pending.pop() {
            if !seen.insert(folder.clone()) {
                continue;
            }
            if !self.job.task.checkpoint().await {
                return Ok(None);
            }
            let children: Vec<Node> = self
                .remote("list", &folder, || self.job.client.list_children(&folder))
                .await?
                .into_iter()
                .filter(|c| c.id != self.job.dest_root)
                .collect();
            pending.extend(
                children
                    .iter()
                    .filter(|c| c.kind == NodeKind::Folder)
                    .map(|c| c.id.clone()),
            );
            survey.total += children.len();
            survey.listings.insert(folder, children);
        }

        Ok(Some(survey))
    }

    async fn mirror(&self, survey: Survey) -> Result<Outcome> {
        let task = &self.job.task;
        let root = self.job.source_root.clone();

        let mut folder_map: HashMap<String, String> = HashMap::new();
        folder_map.insert(root.clone(), self.job.dest_root.clone());
        // Destination nodes this walk created; anything else found under a
        // destination folder is the landed result of a failed attempt.
        let mut created: HashSet<String> = HashSet::new();
        created.insert(self.job.dest_root.clone());

        let mut stack = vec![Frame {
            children: listing(&survey, &root),
            source: root,
        }];

        while let Some(frame) = stack.last_mut() {
            let Some(child) = frame.children.next() else {
                stack.pop();
                // A subfolder is done once its whole subtree is.
                if !stack.is_empty() {
                    task.advance(false, false);
                }
                continue;
            };

            if !task.checkpoint().await {
                return Ok(Outcome::Cancelled);
            }

            let dest = folder_map
                .get(&frame.source)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("destination for folder {}", frame.source)))?;

            match child.kind {
                NodeKind::Folder => {
                    let folder = self
                        .create("create folder", &dest, &child.name, &created, || {
                            self.job.client.create_folder(&child.name, &dest)
                        })
                        .await?;
                    debug!(source = %child.id, dest = %folder, name = %child.name, "folder mirrored");
                    created.insert(folder.clone());
                    folder_map.insert(child.id.clone(), folder);
                    stack.push(Frame {
                        children: listing(&survey, &child.id),
                        source: child.id,
                    });
                }
                NodeKind::Document => {
                    let uploaded = self.mirror_document(&child, &dest, &created).await?;
                    let done = uploaded.is_some();
                    created.extend(uploaded);
                    task.advance(done, !done);
                }
                NodeKind::Other => {
                    debug!(name = %child.name, "not a document, skipped");
                    task.advance(false, false);
                }
            }
        }

        Ok(Outcome::Completed)
    }

    /// Downloads, stamps and uploads one document. Returns the uploaded id,
    /// or `None` when the document could not be watermarked and was left out.
    async fn mirror_document(
        &self,
        doc: &Node,
        dest: &str,
        created: &HashSet<String>,
    ) -> Result<Option<String>> {
        let source = self
            .remote("download", &doc.name, || self.job.client.download(&doc.id))
            .await?;

        let overlay = Arc::clone(&self.job.overlay);
        let stamped = tokio::task::spawn_blocking(move || transform::apply(&source, &overlay)).await;
        let stamped = match stamped {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!(name = %doc.name, id = %doc.id, "skipping document: {}", e);
                return Ok(None);
            }
            Err(e) => {
                warn!(name = %doc.name, id = %doc.id, "skipping document, transform aborted: {}", e);
                return Ok(None);
            }
        };

        let name = self.job.options.output_name(&doc.name);
        let uploaded = self
            .create("upload", dest, &name, created, || {
                self.job.client.upload(stamped.clone(), &name, dest)
            })
            .await?;
        debug!(name = %name, id = %uploaded, "document mirrored");
        Ok(Some(uploaded))
    }

    /// Runs a non-idempotent call that creates `name` under `parent`.
    ///
    /// A transient failure may still have been committed remotely, so the
    /// parent is listed before each retry; a child called `name` that is not
    /// in `created` is that earlier attempt and is adopted instead of
    /// creating a duplicate.
    async fn create<F, Fut>(
        &self,
        action: &'static str,
        parent: &str,
        name: &str,
        created: &HashSet<String>,
        mut op: F,
    ) -> Result<String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<String>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            let err = match op().await {
                Ok(id) => return Ok(id),
                Err(e) => e,
            };
            if !err.is_transient() || attempt + 1 >= attempts {
                return Err(Error::Walk {
                    action,
                    target: name.to_string(),
                    source: err,
                });
            }
            let delay = self.retry.delay(attempt);
            warn!(action, attempt = attempt + 1, ?delay, "{}, checking before retry", err);
            tokio::time::sleep(delay).await;
            attempt += 1;

            let siblings = self
                .remote("list", parent, || self.job.client.list_children(parent))
                .await?;
            if let Some(landed) = siblings
                .into_iter()
                .find(|n| n.name == name && !created.contains(&n.id))
            {
                debug!(action, id = %landed.id, "earlier attempt had landed");
                return Ok(landed.id);
            }
        }
    }

    async fn remote<T, F, Fut>(&self, action: &'static str, target: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        with_retry(self.retry, action, op)
            .await
            .map_err(|source| Error::Walk {
                action,
                target: target.to_string(),
                source,
            })
    }
}

fn listing(survey: &Survey, folder: &str) -> std::vec::IntoIter<Node> {
    survey
        .listings
        .get(folder)
        .cloned()
        .unwrap_or_default()
        .into_iter()
}

/// Runs `op`, retrying transient failures with exponential backoff.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    action: &str,
    mut op: F,
) -> std::result::Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = policy.delay(attempt);
                warn!(action, attempt = attempt + 1, ?delay, "{}, retrying", e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay_ms: 1,
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(), "list", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RemoteError::Transient("503".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), _> = with_retry(&fast(), "list", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Transient("503".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_fail_immediately() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), _> = with_retry(&fast(), "upload", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Permanent("quota".into()))
        })
        .await;
        assert_eq!(result, Err(RemoteError::Permanent("quota".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
