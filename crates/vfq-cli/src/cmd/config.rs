use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use vfq_core::config::{Config, WarnLevel};
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration
    Show,
    /// Check file names, registry kinds and timeouts
    Validate,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(root, json),
        ConfigSubcommand::Validate => validate(root, json),
    }
}

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::read(root).context("failed to read config")?;
    if json {
        return print_json(&config);
    }
    println!("task_queue_file: {}", config.task_queue_file);
    println!("name_id_file:    {}", config.name_id_file);
    println!("steps_dir:       {}", config.resolve_steps_dir(root).display());
    println!("runtimes:        js={} python={}", config.runtimes.js, config.runtimes.python);
    println!(
        "timeouts:        step={}s lock={}s",
        config.timeouts.step_seconds, config.timeouts.lock_seconds
    );
    println!("registry_kinds:  {}", config.registry_kinds.join(", "));
    Ok(())
}

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::read(root).context("failed to read config")?;
    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings }))?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
