use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use vfq_core::{
    config::Config,
    mutex::MutexRegistry,
    registry::{NameIdRegistry, RegistryEntry},
};

#[derive(Subcommand)]
pub enum RegistrySubcommand {
    /// Register an item under a kind
    Register {
        kind: String,
        #[arg(long)]
        name: String,
        /// Explicit id (default: <kind>_<NNN>)
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        purpose: Option<String>,
    },
    /// List registered items
    List { kind: Option<String> },
}

pub fn run(root: &Path, subcmd: RegistrySubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let registry = NameIdRegistry::new(config.name_id_path(root), MutexRegistry::new())
        .with_lock_timeout(config.timeouts.lock_timeout());
    let rt = super::runtime()?;

    match subcmd {
        RegistrySubcommand::Register {
            kind,
            name,
            id,
            purpose,
        } => {
            let entry = RegistryEntry {
                id: id.unwrap_or_default(),
                name: Some(name),
                purpose,
                ..RegistryEntry::default()
            };
            let id = rt
                .block_on(registry.register(&kind, entry))
                .with_context(|| format!("failed to register {kind}"))?;
            if json {
                print_json(&serde_json::json!({ "kind": kind, "id": id }))?;
            } else {
                println!("Registered {kind} [{id}]");
            }
            Ok(())
        }
        RegistrySubcommand::List { kind } => {
            let entries = rt
                .block_on(registry.list(kind.as_deref()))
                .context("failed to read registry")?;
            if json {
                let value: Vec<_> = entries
                    .iter()
                    .map(|(kind, entry)| serde_json::json!({ "kind": kind, "entry": entry }))
                    .collect();
                return print_json(&value);
            }
            if entries.is_empty() {
                println!("No registered items.");
                return Ok(());
            }
            let rows = entries
                .into_iter()
                .map(|(kind, e)| {
                    vec![
                        kind,
                        e.id,
                        e.name.unwrap_or_default(),
                        e.purpose.unwrap_or_default(),
                    ]
                })
                .collect();
            print_table(&["KIND", "ID", "NAME", "PURPOSE"], rows);
            Ok(())
        }
    }
}
