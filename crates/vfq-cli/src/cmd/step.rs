use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;
use vfq_core::{
    builtin::StepRouter,
    config::Config,
    mutex::MutexRegistry,
    step::{Step, StepRunner},
};

#[derive(Subcommand)]
pub enum StepSubcommand {
    /// Run one step by name with positional parameters
    Run {
        name: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        params: Vec<String>,
    },
    /// Check whether a step resolves to a built-in or a script
    Exists { name: String },
    /// List built-in steps and the scripts in the steps directory
    List,
}

pub fn run(root: &Path, subcmd: StepSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let router = StepRouter::from_config(&config, root, MutexRegistry::new());

    match subcmd {
        StepSubcommand::Run { name, params } => run_step(&router, &name, &params, json),
        StepSubcommand::Exists { name } => exists(&router, &name, json),
        StepSubcommand::List => list(&router, json),
    }
}

fn run_step(router: &StepRouter, name: &str, params: &[String], json: bool) -> anyhow::Result<()> {
    let rt = super::runtime()?;
    let result = rt.block_on(router.execute_step(&Step::runnable(name, name), params));

    if json {
        print_json(&result)?;
    } else if !result.output.is_empty() {
        println!("{}", result.output);
    }
    if !result.success {
        anyhow::bail!("step '{name}' failed: {}", result.reason());
    }
    Ok(())
}

fn exists(router: &StepRouter, name: &str, json: bool) -> anyhow::Result<()> {
    let found = router.has_step(name);
    if json {
        print_json(&serde_json::json!({ "name": name, "exists": found }))?;
    } else if found {
        println!("{name}: found");
    }
    if !found {
        anyhow::bail!("step '{name}' not found in {}", router.executor().steps_dir().display());
    }
    Ok(())
}

fn list(router: &StepRouter, json: bool) -> anyhow::Result<()> {
    let builtins: Vec<&str> = router.builtin_names().collect();
    let dir = router.executor().steps_dir();
    let mut scripts: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    scripts.sort();

    if json {
        return print_json(&serde_json::json!({
            "builtins": builtins,
            "steps_dir": dir.display().to_string(),
            "scripts": scripts,
        }));
    }
    println!("Built-in steps:");
    for name in &builtins {
        println!("  {name}");
    }
    println!("Scripts in {}:", dir.display());
    if scripts.is_empty() {
        println!("  (none)");
    }
    for name in &scripts {
        println!("  {name}");
    }
    Ok(())
}
