//! Job orchestration: the submission and progress endpoints.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use tracing::{info, info_span, Instrument};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::remote::{NodeKind, TreeHandle};
use crate::task::{TaskEntry, TaskId, TaskRegistry, TaskSnapshot};
use crate::transform::Overlay;
use crate::walker::{self, WalkJob};
use crate::watermark;

/// Folder id carried by the usual Drive URL shapes.
static FOLDER_URL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"/folders/([A-Za-z0-9_-]+)",
        r"[?&]id=([A-Za-z0-9_-]+)",
        r"/d/([A-Za-z0-9_-]+)",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Accepts either a raw folder id or a URL embedding one. Anything no
/// pattern recognizes is taken literally; if it names nothing the lookup
/// reports it as not found.
pub fn resolve_folder_ref(input: &str) -> Result<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidReference(input.to_string()));
    }
    if !trimmed.contains("://") {
        return Ok(trimmed.to_string());
    }
    Ok(FOLDER_URL_PATTERNS
        .iter()
        .find_map(|re| re.captures(trimmed))
        .and_then(|caps| caps.get(1))
        .map_or(trimmed, |m| m.as_str())
        .to_string())
}

/// Answer of the progress endpoint. Unknown ids are a normal reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ProgressReply {
    Found(TaskSnapshot),
    UnknownTask {
        #[serde(rename = "taskId")]
        task_id: TaskId,
    },
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    registry: TaskRegistry,
    config: Arc<Config>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Result<Self> {
        Self::with_registry(config, TaskRegistry::new())
    }

    /// Shares an existing registry, e.g. between several front ends.
    pub fn with_registry(config: Config, registry: TaskRegistry) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            config: Arc::new(config),
        })
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validates the request, provisions the destination root and the
    /// overlay, registers a task and launches the walk. Returns as soon as
    /// the walk is running; all later failures land in the task.
    pub async fn start(&self, client: TreeHandle, source_ref: &str, logo: &[u8]) -> Result<TaskId> {
        let folder_id = resolve_folder_ref(source_ref)?;
        let retry = &self.config.mirror.retry;

        let source = walker::with_retry(retry, "metadata", || client.get_metadata(&folder_id)).await?;
        if source.kind != NodeKind::Folder {
            return Err(Error::NotFound(format!("folder {}", folder_id)));
        }

        // Rendered and parsed before anything is created remotely, so a bad
        // logo leaves no trace.
        let overlay = Overlay::parse(&watermark::render(logo, &self.config.render)?)?;

        // Not retried: a create that timed out may still have landed, and the
        // top level cannot be listed on every provider to find out.
        let dest_name = self.config.mirror.dest_root_name(&source.name);
        let dest_root = client.create_folder(&dest_name, "").await?;

        let task = self.registry.create();
        let task_id = task.id().clone();
        info_span!("job", task_id = %task_id).in_scope(|| {
            info!(source = %source.name, dest = %dest_name, "job submitted");
        });

        walker::spawn(WalkJob {
            client,
            source_root: source.id,
            dest_root,
            overlay: Arc::new(overlay),
            options: self.config.mirror.clone(),
            task,
        });

        Ok(task_id)
    }

    pub fn progress(&self, task_id: &TaskId) -> ProgressReply {
        match self.registry.snapshot(task_id) {
            Some(snapshot) => ProgressReply::Found(snapshot),
            None => ProgressReply::UnknownTask {
                task_id: task_id.clone(),
            },
        }
    }

    pub fn pause(&self, task_id: &TaskId) -> Result<TaskSnapshot> {
        let task = self.lookup(task_id)?;
        task.pause();
        Ok(task.snapshot())
    }

    pub fn resume(&self, task_id: &TaskId) -> Result<TaskSnapshot> {
        let task = self.lookup(task_id)?;
        task.resume();
        Ok(task.snapshot())
    }

    pub fn cancel(&self, task_id: &TaskId) -> Result<TaskSnapshot> {
        let task = self.lookup(task_id)?;
        task.cancel();
        Ok(task.snapshot())
    }

    /// Waits until the task reaches a terminal status.
    pub async fn wait(&self, task_id: &TaskId) -> Result<TaskSnapshot> {
        let task = self.lookup(task_id)?;
        Ok(task
            .finished()
            .instrument(info_span!("wait", task_id = %task_id))
            .await)
    }

    fn lookup(&self, task_id: &TaskId) -> Result<Arc<TaskEntry>> {
        self.registry
            .get(task_id)
            .ok_or_else(|| Error::UnknownTask(task_id.clone()))
    }
}
