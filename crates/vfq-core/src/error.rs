use thiserror::Error;

#[derive(Debug, Error)]
pub enum VfError {
    #[error("task queue not initialized: {0} does not exist (run 'vfq init')")]
    NotInitialized(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("item already exists: {0}")]
    DuplicateItem(String),

    #[error("registry id already exists under '{kind}': {id}")]
    DuplicateRegistryId { kind: String, id: String },

    #[error("working item '{0}' is still checked out: complete it before popping again")]
    WorkingItemBusy(String),

    #[error("invalid path '{path}': {issues}")]
    InvalidPath { path: String, issues: String },

    #[error("invalid item: {0}")]
    InvalidItem(String),

    #[error("timed out after {seconds}s waiting for lock '{name}'")]
    LockTimeout { name: String, seconds: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VfError>;
