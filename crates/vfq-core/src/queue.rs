use crate::sanitize;
use crate::step::Step;
use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DOCUMENT_VERSION: &str = "1.0.0";
pub const STATUS_PENDING: &str = "pending";
pub const STATUS_WORKING: &str = "working";

/// RFC 3339 UTC timestamp with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// QueueItem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    #[serde(rename = "type", default)]
    pub item_type: String,
    /// Free text or structured JSON.
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QueueItem {
    pub fn new(id: impl Into<String>, item_type: impl Into<String>, content: Value) -> Self {
        Self {
            id: id.into(),
            item_type: item_type.into(),
            content,
            status: STATUS_PENDING.to_string(),
            created_at: now_timestamp(),
            extra: Map::new(),
        }
    }

    /// `content` when it is a string, else its `name` field when present.
    pub fn display_name(&self) -> Option<&str> {
        match &self.content {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => map.get("name").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Sanitize every string in `content` and the free-form fields in place.
    /// Returns the issues found, each prefixed with where it was found.
    pub fn sanitize_text(&mut self) -> Vec<String> {
        let mut issues = Vec::new();
        sanitize_value(&mut self.content, "content", &mut issues);
        for (key, value) in self.extra.iter_mut() {
            sanitize_value(value, key, &mut issues);
        }
        issues
    }

    /// Look a field up in the item's free-form fields, then inside
    /// structured `content`.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.extra
            .get(key)
            .or_else(|| self.content.as_object().and_then(|c| c.get(key)))
    }
}

fn sanitize_value(value: &mut Value, at: &str, issues: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            let checked = sanitize::sanitize_text(text);
            if !checked.valid {
                issues.extend(checked.issues.into_iter().map(|i| format!("{at}: {i}")));
                *text = checked.sanitized;
            }
        }
        Value::Array(values) => {
            for v in values {
                sanitize_value(v, at, issues);
            }
        }
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                sanitize_value(v, &format!("{at}.{key}"), issues);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Queue {
    #[serde(default)]
    pub items: Vec<QueueItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pop_comment: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before_insert_steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after_pop_steps: Vec<Step>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// TaskQueueDocument
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetadata {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub total_items: usize,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_version() -> String {
    DOCUMENT_VERSION.to_string()
}

impl Default for QueueMetadata {
    fn default() -> Self {
        Self {
            version: default_version(),
            created_at: String::new(),
            updated_at: String::new(),
            total_items: 0,
            extra: Map::new(),
        }
    }
}

/// The on-disk `TASK_QUEUE.vf.json` document. Keys this type does not model
/// are kept in `extra` fields and written back unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskQueueDocument {
    #[serde(default)]
    pub metadata: QueueMetadata,
    #[serde(default)]
    pub working_item: Option<QueueItem>,
    #[serde(default)]
    pub queues: IndexMap<String, Queue>,
    #[serde(default)]
    pub priority_order: Vec<String>,
    #[serde(default)]
    pub global_config: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Size of one queue, as reported by status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSize {
    pub name: String,
    pub size: usize,
}

impl TaskQueueDocument {
    pub fn total_items(&self) -> usize {
        self.queues.values().map(|q| q.items.len()).sum()
    }

    /// Stamp `updated_at` and recount `total_items`. Call after every
    /// mutation, before persisting.
    pub fn refresh_metadata(&mut self) {
        let now = now_timestamp();
        if self.metadata.created_at.is_empty() {
            self.metadata.created_at = now.clone();
        }
        self.metadata.updated_at = now;
        self.metadata.total_items = self.total_items();
    }

    /// True when `id` is queued anywhere or is the working item.
    pub fn contains_item(&self, id: &str) -> bool {
        self.working_item.as_ref().is_some_and(|w| w.id == id)
            || self
                .queues
                .values()
                .any(|q| q.items.iter().any(|i| i.id == id))
    }

    /// Queue names in pop precedence: `priority_order` entries that exist,
    /// then the rest in document order.
    pub fn ordered_queue_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .priority_order
            .iter()
            .map(String::as_str)
            .filter(|n| self.queues.contains_key(*n))
            .collect();
        for name in self.queues.keys() {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        names
    }

    /// First non-empty queue in pop precedence.
    pub fn next_queue(&self) -> Option<&str> {
        self.ordered_queue_names()
            .into_iter()
            .find(|n| self.queues.get(*n).is_some_and(|q| !q.items.is_empty()))
    }

    pub fn queue_sizes(&self) -> Vec<QueueSize> {
        self.ordered_queue_names()
            .into_iter()
            .map(|name| QueueSize {
                name: name.to_string(),
                size: self.queues.get(name).map_or(0, |q| q.items.len()),
            })
            .collect()
    }

    /// Non-empty queues other than `except`, in pop precedence.
    pub fn pending_except(&self, except: &str) -> Vec<QueueSize> {
        self.queue_sizes()
            .into_iter()
            .filter(|q| q.name != except && q.size > 0)
            .collect()
    }

    /// Fresh document with the standard twelve-queue hierarchy. `theme`
    /// fills the queue annotations.
    pub fn template(theme: &str) -> Self {
        let now = now_timestamp();
        let mut queues = IndexMap::new();
        for tmpl in QUEUE_TEMPLATES {
            let mut queue = Queue {
                insert_comment: Some(format!("📋 {}", tmpl.insert.replace("{theme}", theme))),
                pop_comment: Some(format!("🎯 {}", tmpl.pop.replace("{theme}", theme))),
                ..Queue::default()
            };
            if let Some(step_file) = tmpl.gate {
                queue
                    .before_insert_steps
                    .push(Step::runnable(gate_description(step_file), step_file));
            }
            if let Some(pop) = &queue.pop_comment {
                queue.after_pop_steps.push(Step::Message {
                    content: pop.clone(),
                    display: Some("always".to_string()),
                });
            }
            queues.insert(tmpl.name.to_string(), queue);
        }

        let mut metadata_extra = Map::new();
        metadata_extra.insert(
            "description".to_string(),
            Value::String(format!("Task queue hierarchy for {theme}")),
        );

        let mut global_config = Map::new();
        global_config.insert("seldom_display_default".to_string(), Value::from(5));
        global_config.insert("operation_counters".to_string(), Value::Object(Map::new()));

        let mut extra = Map::new();
        extra.insert("theme".to_string(), Value::String(theme.to_string()));

        Self {
            metadata: QueueMetadata {
                version: default_version(),
                created_at: now.clone(),
                updated_at: now,
                total_items: 0,
                extra: metadata_extra,
            },
            working_item: None,
            queues,
            priority_order: PRIORITY_ORDER.iter().map(|s| s.to_string()).collect(),
            global_config,
            extra,
        }
    }
}

// ---- Template ----

struct QueueTemplate {
    name: &'static str,
    insert: &'static str,
    pop: &'static str,
    gate: Option<&'static str>,
}

const QUEUE_TEMPLATES: &[QueueTemplate] = &[
    QueueTemplate {
        name: "adhoc_temp_user_request",
        insert: "Add urgent tasks specific to {theme}",
        pop: "Handle {theme} urgent request",
        gate: None,
    },
    QueueTemplate {
        name: "user_story",
        insert: "Add user stories for {theme} features",
        pop: "Implement {theme} user story",
        gate: Some("register_user_story_item"),
    },
    QueueTemplate {
        name: "scenarios",
        insert: "Add scenarios for {theme}",
        pop: "Process {theme} scenario",
        gate: Some("register_scenario_item"),
    },
    QueueTemplate {
        name: "environment_tests",
        insert: "Add environment tests for {theme}",
        pop: "Run {theme} environment test",
        gate: None,
    },
    QueueTemplate {
        name: "external_tests",
        insert: "Add external tests for {theme}",
        pop: "Run {theme} external test",
        gate: None,
    },
    QueueTemplate {
        name: "system_tests_implement",
        insert: "Add system tests for {theme}",
        pop: "Implement {theme} system test",
        gate: Some("register_system_test_item"),
    },
    QueueTemplate {
        name: "integration_tests_implement",
        insert: "Add integration tests for {theme}",
        pop: "Implement {theme} integration test",
        gate: Some("register_integration_test_item"),
    },
    QueueTemplate {
        name: "unit_tests",
        insert: "Add unit tests for {theme}",
        pop: "Implement {theme} unit test",
        gate: None,
    },
    QueueTemplate {
        name: "integration_tests_verify",
        insert: "Verify integration tests for {theme}",
        pop: "Verify {theme} integration test",
        gate: None,
    },
    QueueTemplate {
        name: "system_tests_verify",
        insert: "Verify system tests for {theme}",
        pop: "Verify {theme} system test",
        gate: None,
    },
    QueueTemplate {
        name: "coverage_duplication",
        insert: "Check coverage for {theme}",
        pop: "Analyze {theme} coverage",
        gate: Some("check_all_other_queues_empty"),
    },
    QueueTemplate {
        name: "retrospective",
        insert: "Add retrospective for {theme}",
        pop: "Process {theme} retrospective",
        gate: Some("check_all_other_queues_empty"),
    },
];

const PRIORITY_ORDER: &[&str] = &[
    "adhoc_temp_user_request",
    "environment_tests",
    "external_tests",
    "system_tests_implement",
    "integration_tests_implement",
    "unit_tests",
    "integration_tests_verify",
    "system_tests_verify",
    "scenarios",
    "user_story",
    "coverage_duplication",
    "retrospective",
];

fn gate_description(step_file: &str) -> String {
    let mut words = step_file.replace('_', " ");
    if let Some(first) = words.get(..1) {
        let upper = first.to_uppercase();
        words.replace_range(..1, &upper);
    }
    words
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> QueueItem {
        QueueItem::new(id, "task", Value::String(format!("do {id}")))
    }

    #[test]
    fn sanitize_text_cleans_content_and_fields() {
        let mut it = QueueItem::new(
            "T-1",
            "task",
            serde_json::json!({"name": "<script>x()</script>Login", "steps": ["<b>open</b>", 3]}),
        );
        it.extra.insert("note".into(), Value::String("<i>soon</i>".into()));
        it.extra.insert("points".into(), Value::from(5));

        let issues = it.sanitize_text();
        assert_eq!(it.content["name"], "Login");
        assert_eq!(it.content["steps"], serde_json::json!(["open", 3]));
        assert_eq!(it.extra["note"], "soon");
        assert_eq!(it.extra["points"], 5);
        assert!(issues.iter().any(|i| i.starts_with("content.name:")));
        assert!(issues.iter().any(|i| i.starts_with("note:")));

        let mut clean = item("T-2");
        assert!(clean.sanitize_text().is_empty());
        assert_eq!(clean.content, "do T-2");
    }

    #[test]
    fn template_has_twelve_queues_in_priority_order() {
        let doc = TaskQueueDocument::template("filesystem-mcp");
        assert_eq!(doc.queues.len(), 12);
        assert_eq!(doc.priority_order.len(), 12);
        assert!(doc.priority_order.iter().all(|n| doc.queues.contains_key(n)));
        assert_eq!(doc.queues.keys().next().map(String::as_str), Some("adhoc_temp_user_request"));

        let stories = &doc.queues["user_story"];
        assert_eq!(
            stories.insert_comment.as_deref(),
            Some("📋 Add user stories for filesystem-mcp features")
        );
        assert_eq!(
            stories.before_insert_steps,
            vec![Step::runnable("Register user story item", "register_user_story_item")]
        );
        assert_eq!(doc.global_config["seldom_display_default"], Value::from(5));
        assert_eq!(doc.extra["theme"], Value::String("filesystem-mcp".into()));
    }

    #[test]
    fn next_queue_follows_priority_then_document_order() {
        let mut doc = TaskQueueDocument::default();
        for name in ["a", "b", "c"] {
            doc.queues.insert(name.to_string(), Queue::default());
        }
        doc.priority_order = vec!["c".into(), "missing".into()];
        assert_eq!(doc.next_queue(), None);

        doc.queues["a"].items.push(item("1"));
        doc.queues["b"].items.push(item("2"));
        assert_eq!(doc.next_queue(), Some("a"));

        doc.queues["c"].items.push(item("3"));
        assert_eq!(doc.next_queue(), Some("c"));
        assert_eq!(doc.ordered_queue_names(), vec!["c", "a", "b"]);
    }

    #[test]
    fn pending_except_skips_named_and_empty_queues() {
        let mut doc = TaskQueueDocument::default();
        for name in ["system_tests", "integration_tests", "unit_tests"] {
            doc.queues.insert(name.to_string(), Queue::default());
        }
        doc.queues["integration_tests"].items.push(item("i1"));
        doc.queues["system_tests"].items.push(item("s1"));
        let pending = doc.pending_except("system_tests");
        assert_eq!(
            pending,
            vec![QueueSize {
                name: "integration_tests".into(),
                size: 1
            }]
        );
    }

    #[test]
    fn unknown_keys_survive_round_trip() {
        let json = r#"{
            "metadata": {"version": "1.0.0", "created_at": "x", "updated_at": "x", "total_items": 0, "description": "kept"},
            "working_item": null,
            "queues": {
                "zeta": {"items": [{"id": "1", "type": "task", "content": {"name": "n"}, "status": "pending", "created_at": "t", "priority": "high"}], "custom": true},
                "alpha": {"items": []}
            },
            "priority_order": ["alpha", "zeta"],
            "global_config": {"seldom_display_default": 5},
            "parentQueue": "../TASK_QUEUE.vf.json",
            "theme": "demo"
        }"#;
        let doc: TaskQueueDocument = serde_json::from_str(json).unwrap();
        assert_eq!(doc.queues.keys().collect::<Vec<_>>(), vec!["zeta", "alpha"]);
        assert_eq!(doc.queues["zeta"].items[0].field("priority"), Some(&Value::from("high")));
        assert_eq!(doc.queues["zeta"].items[0].display_name(), Some("n"));

        let back: Value = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["parentQueue"], "../TASK_QUEUE.vf.json");
        assert_eq!(back["metadata"]["description"], "kept");
        assert_eq!(back["queues"]["zeta"]["custom"], true);
        assert_eq!(back["queues"]["zeta"]["items"][0]["priority"], "high");
        assert!(back["working_item"].is_null());
    }

    #[test]
    fn refresh_counts_items_and_keeps_created_at() {
        let mut doc = TaskQueueDocument::template("t");
        let created = doc.metadata.created_at.clone();
        doc.queues["unit_tests"].items.push(item("u1"));
        doc.queues["unit_tests"].items.push(item("u2"));
        doc.refresh_metadata();
        assert_eq!(doc.metadata.total_items, 2);
        assert_eq!(doc.metadata.created_at, created);
        assert!(doc.contains_item("u2"));
        assert!(!doc.contains_item("u3"));
    }
}
