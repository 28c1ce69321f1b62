//! The shared NAME_ID registry: items grouped by kind, every mutation
//! serialized through a named mutex keyed by the registry file path.

use crate::error::{Result, VfError};
use crate::io;
use crate::mutex::MutexRegistry;
use crate::queue::now_timestamp;
use crate::sanitize;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryMetadata {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_version() -> String {
    crate::queue::DOCUMENT_VERSION.to_string()
}

impl Default for RegistryMetadata {
    fn default() -> Self {
        Self {
            version: default_version(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Empty on registration means "generate one".
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeEntries {
    #[serde(default)]
    pub items: Vec<RegistryEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NameIdDocument {
    #[serde(default)]
    pub metadata: RegistryMetadata,
    #[serde(default)]
    pub types: IndexMap<String, TypeEntries>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NameIdDocument {
    pub fn contains(&self, kind: &str, id: &str) -> bool {
        self.types
            .get(kind)
            .is_some_and(|t| t.items.iter().any(|e| e.id == id))
    }

    /// True when `id` is registered under any kind.
    pub fn contains_id(&self, id: &str) -> bool {
        self.types
            .values()
            .any(|t| t.items.iter().any(|e| e.id == id))
    }

    pub fn get(&self, kind: &str, id: &str) -> Option<&RegistryEntry> {
        self.types.get(kind)?.items.iter().find(|e| e.id == id)
    }

    /// Next free `<kind>_<NNN>` id.
    fn next_id(&self, kind: &str) -> Result<String> {
        let exhausted =
            || VfError::InvalidItem(format!("no free registry id left under '{kind}'"));
        let prefix = format!("{kind}_");
        let highest = self
            .types
            .get(kind)
            .map(|t| {
                t.items
                    .iter()
                    .filter_map(|e| e.id.strip_prefix(&prefix)?.parse::<u64>().ok())
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        let mut n = highest.checked_add(1).ok_or_else(exhausted)?;
        loop {
            let candidate = format!("{prefix}{n:03}");
            if !self.contains_id(&candidate) {
                return Ok(candidate);
            }
            n = n.checked_add(1).ok_or_else(exhausted)?;
        }
    }
}

// ---------------------------------------------------------------------------
// NameIdRegistry
// ---------------------------------------------------------------------------

/// Result of [`NameIdRegistry::register_from`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Created(String),
    /// The same id was already registered from the same source.
    Existing(String),
}

impl Registration {
    pub fn id(&self) -> &str {
        match self {
            Self::Created(id) | Self::Existing(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NameIdRegistry {
    path: PathBuf,
    locks: MutexRegistry,
    lock_timeout: Option<Duration>,
}

impl NameIdRegistry {
    pub fn new(path: impl Into<PathBuf>, locks: MutexRegistry) -> Self {
        Self {
            path: path.into(),
            locks,
            lock_timeout: None,
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

    /// Current document; an absent file reads as an empty registry.
    pub async fn load(&self) -> Result<NameIdDocument> {
        if !self.path.exists() {
            return Ok(NameIdDocument::default());
        }
        io::read_json(&self.path).await
    }

    /// Write an empty registry unless one exists. Returns true if written.
    pub async fn init(&self) -> Result<bool> {
        let name = self.lock_name();
        self.locks
            .with_lock_timeout(&name, self.lock_timeout, || self.init_locked())
            .await?
    }

    async fn init_locked(&self) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        io::write_json(&self.path, &NameIdDocument::default()).await?;
        Ok(true)
    }

    /// Append `entry` under `kind` and return its id. The read-modify-write
    /// runs under the registry's mutex.
    pub async fn register(&self, kind: &str, entry: RegistryEntry) -> Result<String> {
        let name = self.lock_name();
        self.locks
            .with_lock_timeout(&name, self.lock_timeout, move || {
                self.register_locked(kind, entry, None)
            })
            .await?
            .map(|r| r.id().to_string())
    }

    /// Like [`register`](Self::register), but an id already registered under
    /// `kind` whose `source_key` field equals this entry's is accepted as
    /// `Existing` instead of failing. Lets a rejected insert be retried.
    pub async fn register_from(
        &self,
        kind: &str,
        entry: RegistryEntry,
        source_key: &str,
    ) -> Result<Registration> {
        let name = self.lock_name();
        self.locks
            .with_lock_timeout(&name, self.lock_timeout, move || {
                self.register_locked(kind, entry, Some(source_key))
            })
            .await?
    }

    async fn register_locked(
        &self,
        kind: &str,
        mut entry: RegistryEntry,
        source_key: Option<&str>,
    ) -> Result<Registration> {
        let mut doc = self.load().await?;

        if entry.id.is_empty() {
            entry.id = doc.next_id(kind)?;
        } else if let Some(existing) = doc.get(kind, &entry.id) {
            let same_source = source_key.is_some_and(|key| {
                entry
                    .data
                    .get(key)
                    .is_some_and(|v| existing.data.get(key) == Some(v))
            });
            if same_source {
                tracing::debug!(kind, id = %entry.id, "already registered");
                return Ok(Registration::Existing(entry.id));
            }
            return Err(VfError::DuplicateRegistryId {
                kind: kind.to_string(),
                id: entry.id,
            });
        }

        entry.name = entry.name.take().map(|n| clean_text(&entry.id, "name", &n));
        entry.purpose = entry
            .purpose
            .take()
            .map(|p| clean_text(&entry.id, "purpose", &p));
        if entry.created_at.is_none() {
            entry.created_at = Some(now_timestamp());
        }

        let id = entry.id.clone();
        doc.types.entry(kind.to_string()).or_default().items.push(entry);
        io::write_json(&self.path, &doc).await?;
        tracing::info!(kind, id = %id, "registered");
        Ok(Registration::Created(id))
    }

    pub async fn contains(&self, kind: &str, id: &str) -> Result<bool> {
        Ok(self.load().await?.contains(kind, id))
    }

    pub async fn contains_id(&self, id: &str) -> Result<bool> {
        Ok(self.load().await?.contains_id(id))
    }

    /// `(kind, entry)` pairs, optionally limited to one kind.
    pub async fn list(&self, kind: Option<&str>) -> Result<Vec<(String, RegistryEntry)>> {
        let doc = self.load().await?;
        Ok(doc
            .types
            .into_iter()
            .filter(|(k, _)| kind.map_or(true, |want| want == k))
            .flat_map(|(k, t)| t.items.into_iter().map(move |e| (k.clone(), e)))
            .collect())
    }
}

fn clean_text(id: &str, field: &str, text: &str) -> String {
    let checked = sanitize::sanitize_purpose(text);
    if !checked.valid {
        tracing::warn!(id, field, issues = ?checked.issues, "registry text sanitized");
    }
    checked.sanitized
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn named(name: &str) -> RegistryEntry {
        RegistryEntry {
            name: Some(name.to_string()),
            ..RegistryEntry::default()
        }
    }

    #[tokio::test]
    async fn generates_sequential_ids_per_kind() {
        let dir = TempDir::new().unwrap();
        let reg = NameIdRegistry::new(dir.path().join("NAME_ID.vf.json"), MutexRegistry::new());

        assert_eq!(reg.register("user_story", named("login")).await.unwrap(), "user_story_001");
        assert_eq!(reg.register("user_story", named("logout")).await.unwrap(), "user_story_002");
        assert_eq!(reg.register("scenario", named("happy")).await.unwrap(), "scenario_001");

        let stories = reg.list(Some("user_story")).await.unwrap();
        assert_eq!(stories.len(), 2);
        assert_eq!(stories[1].1.name.as_deref(), Some("logout"));
        assert!(stories[0].1.created_at.is_some());
        assert_eq!(reg.list(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn supplied_id_must_be_unique_within_kind() {
        let dir = TempDir::new().unwrap();
        let reg = NameIdRegistry::new(dir.path().join("NAME_ID.vf.json"), MutexRegistry::new());
        let entry = RegistryEntry {
            id: "US-1".to_string(),
            ..named("login")
        };
        reg.register("user_story", entry.clone()).await.unwrap();
        let err = reg.register("user_story", entry).await.unwrap_err();
        assert!(matches!(err, VfError::DuplicateRegistryId { ref id, .. } if id == "US-1"));
        assert!(reg.contains("user_story", "US-1").await.unwrap());
        assert!(reg.contains_id("US-1").await.unwrap());
        assert!(!reg.contains("scenario", "US-1").await.unwrap());
    }

    #[tokio::test]
    async fn purpose_is_sanitized_on_the_way_in() {
        let dir = TempDir::new().unwrap();
        let reg = NameIdRegistry::new(dir.path().join("NAME_ID.vf.json"), MutexRegistry::new());
        let entry = RegistryEntry {
            purpose: Some("Track <b>login</b><script>alert(1)</script>".to_string()),
            ..named("login")
        };
        reg.register("user_story", entry).await.unwrap();
        let listed = reg.list(Some("user_story")).await.unwrap();
        let purpose = listed[0].1.purpose.clone().unwrap();
        assert!(!purpose.contains('<'));
        assert!(purpose.contains("login"));
    }

    #[tokio::test]
    async fn name_is_sanitized_on_the_way_in() {
        let dir = TempDir::new().unwrap();
        let reg = NameIdRegistry::new(dir.path().join("NAME_ID.vf.json"), MutexRegistry::new());
        let id = reg
            .register("scenario", named("<script>alert(1)</script>Happy <i>path</i>"))
            .await
            .unwrap();
        let listed = reg.list(Some("scenario")).await.unwrap();
        let name = listed[0].1.name.clone().unwrap();
        assert_eq!(listed[0].1.id, id);
        assert!(!name.contains('<'));
        assert!(!name.contains("alert"));
        assert!(name.contains("Happy"));
    }

    #[tokio::test]
    async fn register_from_same_source_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let reg = NameIdRegistry::new(dir.path().join("NAME_ID.vf.json"), MutexRegistry::new());
        let from = |queue: &str| {
            let mut entry = RegistryEntry {
                id: "ST-1".to_string(),
                ..named("checkout")
            };
            entry.data.insert("queue".to_string(), Value::from(queue));
            entry
        };

        let first = reg
            .register_from("system_test", from("system_tests_implement"), "queue")
            .await
            .unwrap();
        assert_eq!(first, Registration::Created("ST-1".to_string()));
        let again = reg
            .register_from("system_test", from("system_tests_implement"), "queue")
            .await
            .unwrap();
        assert_eq!(again, Registration::Existing("ST-1".to_string()));
        assert_eq!(reg.list(Some("system_test")).await.unwrap().len(), 1);

        let err = reg
            .register_from("system_test", from("integration_tests_implement"), "queue")
            .await
            .unwrap_err();
        assert!(matches!(err, VfError::DuplicateRegistryId { .. }));
        assert!(reg.register("system_test", from("system_tests_implement")).await.is_err());
    }

    #[tokio::test]
    async fn exhausted_id_space_fails_without_holding_the_lock() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("NAME_ID.vf.json");
        std::fs::write(
            &path,
            r#"{"types": {"scenario": {"items": [{"id": "scenario_18446744073709551615"}]}}}"#,
        )
        .unwrap();
        let reg = NameIdRegistry::new(&path, MutexRegistry::new())
            .with_lock_timeout(Some(Duration::from_secs(5)));

        let err = reg.register("scenario", named("one more")).await.unwrap_err();
        assert!(matches!(err, VfError::InvalidItem(ref msg) if msg.contains("scenario")));

        let entry = RegistryEntry {
            id: "scenario_manual".to_string(),
            ..named("explicit")
        };
        assert_eq!(reg.register("scenario", entry).await.unwrap(), "scenario_manual");
        assert_eq!(reg.list(Some("scenario")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_keys_are_preserved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("NAME_ID.vf.json");
        std::fs::write(
            &path,
            r#"{"metadata": {"version": "2.0.0", "owner": "qa"},
                "types": {"scenario": {"items": [{"id": "scenario_007", "tags": ["x"]}]}},
                "notes": "keep me"}"#,
        )
        .unwrap();
        let reg = NameIdRegistry::new(&path, MutexRegistry::new());
        assert_eq!(reg.register("scenario", named("next")).await.unwrap(), "scenario_008");

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["notes"], "keep me");
        assert_eq!(raw["metadata"]["owner"], "qa");
        assert_eq!(raw["metadata"]["version"], "2.0.0");
        assert_eq!(raw["types"]["scenario"]["items"][0]["tags"][0], "x");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_registrations_get_distinct_ids() {
        let dir = TempDir::new().unwrap();
        let reg = NameIdRegistry::new(dir.path().join("NAME_ID.vf.json"), MutexRegistry::new());
        reg.init().await.unwrap();

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let reg = reg.clone();
                tokio::spawn(async move {
                    reg.register("user_story", named(&format!("story {i}")))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut ids = BTreeSet::new();
        for h in handles {
            ids.insert(h.await.unwrap());
        }
        assert_eq!(ids.len(), 10);

        let stored = reg.list(Some("user_story")).await.unwrap();
        assert_eq!(stored.len(), 10);
        assert!(!reg.init().await.unwrap());
    }
}
