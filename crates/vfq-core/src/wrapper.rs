//! Step-gated operations over one task-queue document.
//!
//! Every read-modify-write of the document happens under a named mutex keyed
//! by the document path. Inserts run the target queue's
//! `before_insert_steps` first and append only if all of them pass. Pops
//! persist the new working item before running `after_pop_steps`, whose
//! outcome never undoes the pop.

use crate::builtin::StepRouter;
use crate::config::Config;
use crate::error::{Result, VfError};
use crate::io;
use crate::mutex::MutexRegistry;
use crate::queue::{QueueItem, QueueSize, TaskQueueDocument, STATUS_WORKING};
use crate::step::{first_failure, Step, StepExecutionResult, StepRunner};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted {
        queue: String,
        item_id: String,
        step_results: Vec<StepExecutionResult>,
    },
    Rejected {
        queue: String,
        /// The failing step's own error and output, verbatim.
        reason: String,
        step_results: Vec<StepExecutionResult>,
    },
}

impl InsertOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted { .. })
    }

    pub fn step_results(&self) -> &[StepExecutionResult] {
        match self {
            InsertOutcome::Inserted { step_results, .. }
            | InsertOutcome::Rejected { step_results, .. } => step_results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopOutcome {
    pub queue: String,
    pub item: QueueItem,
    pub step_results: Vec<StepExecutionResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeekedItem {
    pub queue: String,
    pub item: QueueItem,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queues: Vec<QueueSize>,
    pub total_pending: usize,
    pub working_item: Option<String>,
}

pub struct TaskQueueWrapper {
    path: PathBuf,
    runner: Arc<dyn StepRunner>,
    locks: MutexRegistry,
    lock_timeout: Option<Duration>,
}

impl TaskQueueWrapper {
    pub fn new(path: impl Into<PathBuf>, runner: Arc<dyn StepRunner>) -> Self {
        Self {
            path: path.into(),
            runner,
            locks: MutexRegistry::new(),
            lock_timeout: None,
        }
    }

    /// Wrapper for the project at `root`, with built-in steps and the
    /// configured steps directory. `locks` is shared with the registry.
    pub fn open(root: &Path, config: &Config, locks: MutexRegistry) -> Self {
        let router = StepRouter::from_config(config, root, locks.clone());
        Self {
            path: config.task_queue_path(root),
            runner: Arc::new(router),
            locks,
            lock_timeout: config.timeouts.lock_timeout(),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_name(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    fn path_param(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub async fn load(&self) -> Result<TaskQueueDocument> {
        if !self.path.exists() {
            return Err(VfError::NotInitialized(self.path.display().to_string()));
        }
        io::read_json(&self.path).await
    }

    async fn save(&self, doc: &mut TaskQueueDocument) -> Result<()> {
        doc.refresh_metadata();
        io::write_json(&self.path, doc).await
    }

    // ---- init ----

    /// Write the default queue hierarchy unless a document exists. Returns
    /// true if written.
    pub async fn init(&self, theme: &str) -> Result<bool> {
        let name = self.lock_name();
        self.locks
            .with_lock_timeout(&name, self.lock_timeout, || self.init_locked(theme))
            .await?
    }

    async fn init_locked(&self, theme: &str) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        let mut doc = TaskQueueDocument::template(theme);
        self.save(&mut doc).await?;
        tracing::info!(path = %self.path.display(), "initialized task queue");
        Ok(true)
    }

    // ---- insert ----

    pub async fn insert(&self, queue: &str, item: QueueItem) -> Result<InsertOutcome> {
        let name = self.lock_name();
        self.locks
            .with_lock_timeout(&name, self.lock_timeout, move || {
                self.insert_locked(queue, item)
            })
            .await?
    }

    async fn insert_locked(&self, queue: &str, mut item: QueueItem) -> Result<InsertOutcome> {
        if item.id.trim().is_empty() {
            return Err(VfError::InvalidItem("item id must not be empty".to_string()));
        }
        let issues = item.sanitize_text();
        if !issues.is_empty() {
            tracing::warn!(queue, item = %item.id, ?issues, "item text sanitized");
        }

        let doc = self.load().await?;
        let steps = doc
            .queues
            .get(queue)
            .map(|q| q.before_insert_steps.clone())
            .ok_or_else(|| VfError::QueueNotFound(queue.to_string()))?;
        if doc.contains_item(&item.id) {
            return Err(VfError::DuplicateItem(item.id));
        }

        let params = vec![
            self.path_param(),
            queue.to_string(),
            serde_json::to_string(&item)?,
        ];
        let step_results = self.runner.execute_steps(&steps, &params).await;

        if let Some(failed) = first_failure(&step_results) {
            let reason = failed.reason();
            tracing::warn!(queue, item = %item.id, step = %failed.step_file, %reason, "insert rejected");
            return Ok(InsertOutcome::Rejected {
                queue: queue.to_string(),
                reason,
                step_results,
            });
        }

        // Steps may have touched the document; append to what is on disk now.
        let mut doc = self.load().await?;
        let target = doc
            .queues
            .get_mut(queue)
            .ok_or_else(|| VfError::QueueNotFound(queue.to_string()))?;
        let item_id = item.id.clone();
        target.items.push(item);
        self.save(&mut doc).await?;

        tracing::info!(queue, item = %item_id, "inserted");
        Ok(InsertOutcome::Inserted {
            queue: queue.to_string(),
            item_id,
            step_results,
        })
    }

    // ---- pop ----

    /// Remove the head of `queue`, or of the first non-empty queue by
    /// priority, and check it out as the working item. `Ok(None)` when there
    /// is nothing to pop.
    pub async fn pop(&self, queue: Option<&str>) -> Result<Option<PopOutcome>> {
        let name = self.lock_name();
        let popped = self
            .locks
            .with_lock_timeout(&name, self.lock_timeout, || self.pop_locked(queue))
            .await??;

        let Some((queue, item, steps)) = popped else {
            return Ok(None);
        };

        let params = vec![self.path_param(), queue.clone(), item.id.clone()];
        let step_results = self.runner.execute_steps(&steps, &params).await;
        if let Some(failed) = first_failure(&step_results) {
            tracing::warn!(
                queue = %queue,
                item = %item.id,
                step = %failed.step_file,
                "after-pop step failed"
            );
        }
        Ok(Some(PopOutcome {
            queue,
            item,
            step_results,
        }))
    }

    async fn pop_locked(
        &self,
        queue: Option<&str>,
    ) -> Result<Option<(String, QueueItem, Vec<Step>)>> {
        let mut doc = self.load().await?;
        if let Some(working) = &doc.working_item {
            return Err(VfError::WorkingItemBusy(working.id.clone()));
        }

        let queue_name = match queue {
            Some(q) if doc.queues.contains_key(q) => q.to_string(),
            Some(q) => return Err(VfError::QueueNotFound(q.to_string())),
            None => match doc.next_queue() {
                Some(q) => q.to_string(),
                None => return Ok(None),
            },
        };

        let Some(target) = doc.queues.get_mut(&queue_name) else {
            return Ok(None);
        };
        if target.items.is_empty() {
            return Ok(None);
        }
        let mut item = target.items.remove(0);
        let steps = target.after_pop_steps.clone();

        item.status = STATUS_WORKING.to_string();
        doc.working_item = Some(item.clone());
        self.save(&mut doc).await?;

        tracing::info!(queue = %queue_name, item = %item.id, "popped");
        Ok(Some((queue_name, item, steps)))
    }

    // ---- peek / status / complete ----

    /// Head of `queue`, or of the queue the next pop would take from.
    pub async fn peek(&self, queue: Option<&str>) -> Result<Option<PeekedItem>> {
        let doc = self.load().await?;
        let queue_name = match queue {
            Some(q) if doc.queues.contains_key(q) => q.to_string(),
            Some(q) => return Err(VfError::QueueNotFound(q.to_string())),
            None => match doc.next_queue() {
                Some(q) => q.to_string(),
                None => return Ok(None),
            },
        };
        Ok(doc
            .queues
            .get(&queue_name)
            .and_then(|q| q.items.first())
            .map(|item| PeekedItem {
                queue: queue_name.clone(),
                item: item.clone(),
            }))
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        let doc = self.load().await?;
        Ok(QueueStatus {
            queues: doc.queue_sizes(),
            total_pending: doc.total_items(),
            working_item: doc.working_item.as_ref().map(|w| w.id.clone()),
        })
    }

    /// Clear and return the working item.
    pub async fn complete(&self) -> Result<Option<QueueItem>> {
        let name = self.lock_name();
        self.locks
            .with_lock_timeout(&name, self.lock_timeout, || self.complete_locked())
            .await?
    }

    async fn complete_locked(&self) -> Result<Option<QueueItem>> {
        let mut doc = self.load().await?;
        let Some(item) = doc.working_item.take() else {
            return Ok(None);
        };
        self.save(&mut doc).await?;
        tracing::info!(item = %item.id, "completed");
        Ok(Some(item))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
