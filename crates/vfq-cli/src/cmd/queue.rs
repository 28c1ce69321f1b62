use crate::output::{print_json, print_step_results, print_table};
use anyhow::Context;
use clap::Subcommand;
use serde_json::{Map, Value};
use std::path::Path;
use vfq_core::{
    config::Config,
    mutex::MutexRegistry,
    queue::QueueItem,
    wrapper::{InsertOutcome, TaskQueueWrapper},
};

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// Insert an item after the queue's before-insert steps pass
    Insert {
        queue: String,
        /// Item content; a JSON object or array is stored structured
        #[arg(long)]
        content: String,
        /// Item id (default: a random UUID)
        #[arg(long)]
        id: Option<String>,
        /// Item type (default: the queue name)
        #[arg(long = "type")]
        item_type: Option<String>,
        /// Extra item field as key=value, repeatable
        #[arg(long = "field", value_name = "KEY=VALUE")]
        fields: Vec<String>,
    },
    /// Check out the next item as the working item
    Pop {
        /// Pop from this queue instead of the highest-priority one
        queue: Option<String>,
    },
    /// Show the next item without removing it
    Peek { queue: Option<String> },
    /// Per-queue sizes in priority order
    Status,
    /// Finish the working item
    Complete,
}

pub fn run(root: &Path, subcmd: QueueSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let wrapper = TaskQueueWrapper::open(root, &config, MutexRegistry::new());
    let rt = super::runtime()?;

    match subcmd {
        QueueSubcommand::Insert {
            queue,
            content,
            id,
            item_type,
            fields,
        } => {
            let item = build_item(&queue, &content, id, item_type, &fields)?;
            rt.block_on(insert(&wrapper, &queue, item, json))
        }
        QueueSubcommand::Pop { queue } => rt.block_on(pop(&wrapper, queue.as_deref(), json)),
        QueueSubcommand::Peek { queue } => rt.block_on(peek(&wrapper, queue.as_deref(), json)),
        QueueSubcommand::Status => rt.block_on(status(&wrapper, json)),
        QueueSubcommand::Complete => rt.block_on(complete(&wrapper, json)),
    }
}

// ---------------------------------------------------------------------------
// Item construction
// ---------------------------------------------------------------------------

/// Structured JSON when the text is an object or array, else plain text.
fn parse_value(text: &str) -> Value {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str(text) {
            return v;
        }
    }
    Value::String(text.to_string())
}

fn parse_field(raw: &str) -> anyhow::Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("field '{raw}' must be KEY=VALUE"))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("field '{raw}' has an empty key");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn build_item(
    queue: &str,
    content: &str,
    id: Option<String>,
    item_type: Option<String>,
    fields: &[String],
) -> anyhow::Result<QueueItem> {
    let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut item = QueueItem::new(
        id,
        item_type.unwrap_or_else(|| queue.to_string()),
        parse_value(content),
    );
    let mut extra = Map::new();
    for raw in fields {
        let (key, value) = parse_field(raw)?;
        extra.insert(key, value);
    }
    item.extra = extra;
    Ok(item)
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

async fn insert(
    wrapper: &TaskQueueWrapper,
    queue: &str,
    item: QueueItem,
    json: bool,
) -> anyhow::Result<()> {
    let outcome = wrapper
        .insert(queue, item)
        .await
        .with_context(|| format!("failed to insert into '{queue}'"))?;

    if json {
        print_json(&outcome)?;
    }
    match outcome {
        InsertOutcome::Inserted {
            item_id,
            step_results,
            ..
        } => {
            if !json {
                println!("Inserted [{item_id}] into {queue}");
                print_step_results(&step_results);
            }
            Ok(())
        }
        InsertOutcome::Rejected {
            reason,
            step_results,
            ..
        } => {
            if !json {
                print_step_results(&step_results);
            }
            anyhow::bail!("insert into '{queue}' rejected: {reason}")
        }
    }
}

async fn pop(wrapper: &TaskQueueWrapper, queue: Option<&str>, json: bool) -> anyhow::Result<()> {
    let popped = wrapper.pop(queue).await.context("failed to pop")?;
    if json {
        return print_json(&popped);
    }
    match popped {
        Some(p) => {
            println!("Working on [{}] from {}", p.item.id, p.queue);
            println!("{}", display_content(&p.item.content));
            print_step_results(&p.step_results);
        }
        None => println!("Nothing to pop."),
    }
    Ok(())
}

async fn peek(wrapper: &TaskQueueWrapper, queue: Option<&str>, json: bool) -> anyhow::Result<()> {
    let head = wrapper.peek(queue).await.context("failed to peek")?;
    if json {
        return print_json(&head);
    }
    match head {
        Some(h) => println!(
            "[{}] {} ({})",
            h.item.id,
            display_content(&h.item.content),
            h.queue
        ),
        None => println!("No items queued."),
    }
    Ok(())
}

async fn status(wrapper: &TaskQueueWrapper, json: bool) -> anyhow::Result<()> {
    let status = wrapper.status().await.context("failed to read task queue")?;
    if json {
        return print_json(&status);
    }
    let rows = status
        .queues
        .iter()
        .map(|q| vec![q.name.clone(), q.size.to_string()])
        .collect();
    print_table(&["QUEUE", "ITEMS"], rows);
    println!();
    println!("Total pending: {}", status.total_pending);
    match &status.working_item {
        Some(id) => println!("Working item:  {id}"),
        None => println!("Working item:  none"),
    }
    Ok(())
}

async fn complete(wrapper: &TaskQueueWrapper, json: bool) -> anyhow::Result<()> {
    let done = wrapper.complete().await.context("failed to complete")?;
    if json {
        return print_json(&done);
    }
    match done {
        Some(item) => println!("Completed [{}]", item.id),
        None => println!("No working item."),
    }
    Ok(())
}

fn display_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
