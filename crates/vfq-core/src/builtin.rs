//! In-process steps, dispatched by name ahead of the steps directory.
//!
//! Built-ins see the same positional parameters a step script would get:
//! before-insert steps receive `[task_queue_path, queue_name, item_json]`
//! and after-pop steps `[task_queue_path, queue_name, item_id]`.

use crate::config::Config;
use crate::executor::{script_name_from_content, StepFileExecutor};
use crate::io;
use crate::mutex::MutexRegistry;
use crate::queue::{QueueItem, TaskQueueDocument};
use crate::registry::{NameIdRegistry, Registration, RegistryEntry};
use crate::step::{message_result, Step, StepExecutionResult, StepRunner};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub const CHECK_ALL_OTHER_QUEUES_EMPTY: &str = "check_all_other_queues_empty";
pub const CHECK_CHILDREN_REGISTERED: &str = "check_children_registered";

/// Step name registering items of `kind`.
pub fn register_step_name(kind: &str) -> String {
    format!("register_{kind}_item")
}

#[async_trait]
pub trait BuiltinStep: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, params: &[String]) -> StepExecutionResult;
}

// ---- Parameter helpers ----

struct StepParams<'a> {
    task_queue_path: &'a str,
    queue_name: &'a str,
    payload: &'a str,
}

fn split_params(params: &[String]) -> Option<StepParams<'_>> {
    match params {
        [path, queue, payload, ..] => Some(StepParams {
            task_queue_path: path,
            queue_name: queue,
            payload,
        }),
        _ => None,
    }
}

fn missing_params(step: &str) -> StepExecutionResult {
    StepExecutionResult::failed(
        step,
        format!("{step} expects [task_queue_path, queue_name, item] parameters"),
        "",
    )
}

fn parse_item(step: &str, json: &str) -> Result<QueueItem, StepExecutionResult> {
    serde_json::from_str(json).map_err(|e| {
        StepExecutionResult::failed(step, format!("Item parameter is not valid JSON: {e}"), "")
    })
}

// ---------------------------------------------------------------------------
// check_all_other_queues_empty
// ---------------------------------------------------------------------------

/// Passes only when every queue except the target is empty.
pub struct CheckAllOtherQueuesEmpty;

#[async_trait]
impl BuiltinStep for CheckAllOtherQueuesEmpty {
    fn name(&self) -> &str {
        CHECK_ALL_OTHER_QUEUES_EMPTY
    }

    async fn run(&self, params: &[String]) -> StepExecutionResult {
        let Some(p) = split_params(params) else {
            return missing_params(self.name());
        };
        let doc: TaskQueueDocument = match io::read_json(Path::new(p.task_queue_path)).await {
            Ok(d) => d,
            Err(e) => {
                return StepExecutionResult::failed(
                    self.name(),
                    format!("Cannot read task queue: {e}"),
                    "",
                )
            }
        };

        let pending = doc.pending_except(p.queue_name);
        if pending.is_empty() {
            return StepExecutionResult::ok(self.name(), "All other queues are empty");
        }
        let summary = pending
            .iter()
            .map(|q| format!("{}: {} items", q.name, q.size))
            .collect::<Vec<_>>()
            .join(", ");
        StepExecutionResult::failed(
            self.name(),
            format!(
                "{} requires all other queues to be empty. Pending: {summary}",
                p.queue_name
            ),
            "",
        )
    }
}

// ---------------------------------------------------------------------------
// register_<kind>_item
// ---------------------------------------------------------------------------

/// Records the inserted item in the NAME_ID registry under its kind. A
/// registry id clash rejects the insert.
pub struct RegisterItem {
    name: String,
    kind: String,
    registry: NameIdRegistry,
}

impl RegisterItem {
    pub fn new(kind: &str, registry: NameIdRegistry) -> Self {
        Self {
            name: register_step_name(kind),
            kind: kind.to_string(),
            registry,
        }
    }
}

#[async_trait]
impl BuiltinStep for RegisterItem {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, params: &[String]) -> StepExecutionResult {
        let Some(p) = split_params(params) else {
            return missing_params(self.name());
        };
        let item = match parse_item(self.name(), p.payload) {
            Ok(i) => i,
            Err(result) => return result,
        };

        let mut data = Map::new();
        data.insert("queue".to_string(), Value::String(p.queue_name.to_string()));
        if !item.item_type.is_empty() {
            data.insert("item_type".to_string(), Value::String(item.item_type.clone()));
        }
        let entry = RegistryEntry {
            id: item.id.clone(),
            name: item.display_name().map(str::to_string),
            purpose: item.field("purpose").and_then(Value::as_str).map(str::to_string),
            created_at: None,
            data,
        };

        match self.registry.register_from(&self.kind, entry, "queue").await {
            Ok(Registration::Created(id)) => {
                StepExecutionResult::ok(self.name(), format!("Registered {} {id}", self.kind))
            }
            Ok(Registration::Existing(id)) => StepExecutionResult::ok(
                self.name(),
                format!("{} {id} already registered", self.kind),
            ),
            Err(e) => StepExecutionResult::failed(self.name(), e.to_string(), ""),
        }
    }
}

// ---------------------------------------------------------------------------
// check_children_registered
// ---------------------------------------------------------------------------

/// Fails while any id listed in the item's `children` is unregistered.
pub struct CheckChildrenRegistered {
    registry: NameIdRegistry,
}

impl CheckChildrenRegistered {
    pub fn new(registry: NameIdRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl BuiltinStep for CheckChildrenRegistered {
    fn name(&self) -> &str {
        CHECK_CHILDREN_REGISTERED
    }

    async fn run(&self, params: &[String]) -> StepExecutionResult {
        let Some(p) = split_params(params) else {
            return missing_params(self.name());
        };
        let item = match parse_item(self.name(), p.payload) {
            Ok(i) => i,
            Err(result) => return result,
        };
        let children: Vec<&str> = item
            .field("children")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let doc = match self.registry.load().await {
            Ok(d) => d,
            Err(e) => {
                return StepExecutionResult::failed(
                    self.name(),
                    format!("Cannot read registry: {e}"),
                    "",
                )
            }
        };
        let missing: Vec<&str> = children
            .into_iter()
            .filter(|id| !doc.contains_id(id))
            .collect();
        if missing.is_empty() {
            StepExecutionResult::ok(self.name(), "All children registered")
        } else {
            StepExecutionResult::failed(
                self.name(),
                format!("Unregistered children: {}", missing.join(", ")),
                "",
            )
        }
    }
}

// ---------------------------------------------------------------------------
// StepRouter
// ---------------------------------------------------------------------------

/// Runs built-ins by name and hands every other runnable step to the
/// steps-directory executor.
pub struct StepRouter {
    builtins: BTreeMap<String, Arc<dyn BuiltinStep>>,
    fallback: StepFileExecutor,
}

impl StepRouter {
    pub fn new(fallback: StepFileExecutor) -> Self {
        Self {
            builtins: BTreeMap::new(),
            fallback,
        }
    }

    /// Router with every built-in wired to the project's registry.
    pub fn from_config(config: &Config, root: &Path, locks: MutexRegistry) -> Self {
        let registry = NameIdRegistry::new(config.name_id_path(root), locks)
            .with_lock_timeout(config.timeouts.lock_timeout());
        let mut router = Self::new(StepFileExecutor::from_config(config, root))
            .with_builtin(Arc::new(CheckAllOtherQueuesEmpty))
            .with_builtin(Arc::new(CheckChildrenRegistered::new(registry.clone())));
        for kind in &config.registry_kinds {
            router = router.with_builtin(Arc::new(RegisterItem::new(kind, registry.clone())));
        }
        router
    }

    pub fn with_builtin(mut self, step: Arc<dyn BuiltinStep>) -> Self {
        self.builtins.insert(step.name().to_string(), step);
        self
    }

    pub fn builtin_names(&self) -> impl Iterator<Item = &str> {
        self.builtins.keys().map(String::as_str)
    }

    pub fn executor(&self) -> &StepFileExecutor {
        &self.fallback
    }

    /// True for a built-in or a resolvable step script.
    pub fn has_step(&self, name: &str) -> bool {
        self.builtins.contains_key(name) || self.fallback.step_file_exists(name)
    }

    fn builtin_for(&self, step: &Step) -> Option<&Arc<dyn BuiltinStep>> {
        match step {
            Step::Message { .. } => None,
            Step::Runnable {
                step_file: Some(name),
                ..
            } => self.builtins.get(name),
            Step::Runnable { content, .. } => {
                let derived = script_name_from_content(content);
                self.builtins.get(derived.trim_end_matches(".js"))
            }
        }
    }
}

#[async_trait]
impl StepRunner for StepRouter {
    async fn execute_step(&self, step: &Step, params: &[String]) -> StepExecutionResult {
        if let Step::Message { content, .. } = step {
            return message_result(content);
        }
        match self.builtin_for(step) {
            Some(builtin) => {
                tracing::debug!(step = builtin.name(), "running built-in step");
                builtin.run(params).await
            }
            None => self.fallback.execute_step(step, params).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Queue;
    use tempfile::TempDir;

    async fn write_doc(dir: &Path, sizes: &[(&str, usize)]) -> String {
        let mut doc = TaskQueueDocument::default();
        for (name, size) in sizes {
            let mut queue = Queue::default();
            for i in 0..*size {
                queue
                    .items
                    .push(QueueItem::new(format!("{name}-{i}"), "task", Value::Null));
            }
            doc.queues.insert(name.to_string(), queue);
        }
        let path = dir.join("TASK_QUEUE.vf.json");
        io::write_json(&path, &doc).await.unwrap();
        path.to_string_lossy().into_owned()
    }

    fn params(path: &str, queue: &str, payload: &str) -> Vec<String> {
        vec![path.to_string(), queue.to_string(), payload.to_string()]
    }

    #[tokio::test]
    async fn other_queues_must_be_empty() {
        let dir = TempDir::new().unwrap();
        let path = write_doc(
            dir.path(),
            &[("system_tests", 0), ("integration_tests", 1), ("unit_tests", 0)],
        )
        .await;

        let result = CheckAllOtherQueuesEmpty
            .run(&params(&path, "system_tests", "{}"))
            .await;
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("system_tests requires all other queues to be empty. Pending: integration_tests: 1 items")
        );

        let own = CheckAllOtherQueuesEmpty
            .run(&params(&path, "integration_tests", "{}"))
            .await;
        assert!(own.success, "{own:?}");
    }

    #[tokio::test]
    async fn too_few_params_fail_cleanly() {
        let result = CheckAllOtherQueuesEmpty.run(&["only".to_string()]).await;
        assert!(!result.success);
        assert_eq!(result.step_file, CHECK_ALL_OTHER_QUEUES_EMPTY);
    }

    #[tokio::test]
    async fn register_item_uses_item_id_and_rejects_repeats_from_other_queues() {
        let dir = TempDir::new().unwrap();
        let registry = NameIdRegistry::new(dir.path().join("NAME_ID.vf.json"), MutexRegistry::new());
        let step = RegisterItem::new("user_story", registry.clone());
        assert_eq!(step.name(), "register_user_story_item");

        let item = QueueItem::new("US-7", "user_story", Value::String("Login".into()));
        let json = serde_json::to_string(&item).unwrap();
        let first = step.run(&params("q.json", "user_story", &json)).await;
        assert!(first.success, "{first:?}");
        assert_eq!(first.output, "Registered user_story US-7");

        let listed = registry.list(Some("user_story")).await.unwrap();
        assert_eq!(listed[0].1.name.as_deref(), Some("Login"));
        assert_eq!(listed[0].1.data["queue"], "user_story");

        let retry = step.run(&params("q.json", "user_story", &json)).await;
        assert!(retry.success, "{retry:?}");
        assert_eq!(retry.output, "user_story US-7 already registered");
        assert_eq!(registry.list(Some("user_story")).await.unwrap().len(), 1);

        let elsewhere = step.run(&params("q.json", "scenarios", &json)).await;
        assert!(!elsewhere.success);
        assert!(elsewhere.error.unwrap().contains("US-7"));
    }

    #[tokio::test]
    async fn registered_name_is_sanitized() {
        let dir = TempDir::new().unwrap();
        let registry = NameIdRegistry::new(dir.path().join("NAME_ID.vf.json"), MutexRegistry::new());
        let step = RegisterItem::new("scenario", registry.clone());

        let item = QueueItem::new(
            "S-9",
            "scenario",
            Value::String("<script>steal()</script>Guest <b>checkout</b>".into()),
        );
        let json = serde_json::to_string(&item).unwrap();
        assert!(step.run(&params("q.json", "scenarios", &json)).await.success);

        let listed = registry.list(Some("scenario")).await.unwrap();
        assert_eq!(listed[0].1.name.as_deref(), Some("Guest checkout"));
    }

    #[tokio::test]
    async fn children_must_be_registered() {
        let dir = TempDir::new().unwrap();
        let registry = NameIdRegistry::new(dir.path().join("NAME_ID.vf.json"), MutexRegistry::new());
        registry
            .register(
                "scenario",
                RegistryEntry {
                    id: "S-1".into(),
                    ..RegistryEntry::default()
                },
            )
            .await
            .unwrap();

        let mut item = QueueItem::new("US-1", "user_story", Value::Null);
        item.extra
            .insert("children".into(), serde_json::json!(["S-1", "S-2", "S-3"]));
        let json = serde_json::to_string(&item).unwrap();

        let step = CheckChildrenRegistered::new(registry);
        let result = step.run(&params("q.json", "user_story", &json)).await;
        assert_eq!(result.error.as_deref(), Some("Unregistered children: S-2, S-3"));
    }

    #[tokio::test]
    async fn router_prefers_builtins_and_matches_derived_names() {
        let dir = TempDir::new().unwrap();
        let path = write_doc(dir.path(), &[("a", 1), ("b", 0)]).await;
        let router = StepRouter::new(StepFileExecutor::new(Some(dir.path().join("steps"))))
            .with_builtin(Arc::new(CheckAllOtherQueuesEmpty));

        assert!(router.has_step(CHECK_ALL_OTHER_QUEUES_EMPTY));
        assert!(!router.has_step("nope"));

        let by_content = Step::Runnable {
            content: "Check all other queues empty".into(),
            step_file: None,
        };
        let result = router.execute_step(&by_content, &params(&path, "b", "{}")).await;
        assert_eq!(
            result.error.as_deref(),
            Some("b requires all other queues to be empty. Pending: a: 1 items")
        );

        let missing = router
            .execute_step(&Step::runnable("", "nope"), &params(&path, "b", "{}"))
            .await;
        assert_eq!(missing.error.as_deref(), Some("Step file not found: nope"));
    }

    #[test]
    fn from_config_registers_every_kind() {
        let dir = TempDir::new().unwrap();
        let router = StepRouter::from_config(&Config::default(), dir.path(), MutexRegistry::new());
        let names: Vec<&str> = router.builtin_names().collect();
        assert!(names.contains(&"register_user_story_item"));
        assert!(names.contains(&"register_system_test_item"));
        assert!(names.contains(&CHECK_CHILDREN_REGISTERED));
        assert_eq!(names.len(), 6);
    }
}
