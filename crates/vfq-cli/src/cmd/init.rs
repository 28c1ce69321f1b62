use crate::output::print_json;
use anyhow::Context;
use vfq_core::{
    config::{Config, WarnLevel},
    io,
    mutex::MutexRegistry,
    paths,
    registry::NameIdRegistry,
    wrapper::TaskQueueWrapper,
};
use std::path::Path;

pub fn run(root: &Path, theme: Option<&str>, json: bool) -> anyhow::Result<()> {
    let theme = theme.map(str::to_string).unwrap_or_else(|| {
        root.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    });

    let vf_dir = paths::vf_dir(root);
    io::ensure_dir(&vf_dir).with_context(|| format!("failed to create {}", vf_dir.display()))?;

    let config_created = if paths::config_path(root).exists() {
        false
    } else {
        Config::default()
            .save(root)
            .context("failed to write config.yaml")?;
        true
    };
    let config = Config::load(root).context("failed to load config")?;

    let locks = MutexRegistry::new();
    let wrapper = TaskQueueWrapper::open(root, &config, locks.clone());
    let registry = NameIdRegistry::new(config.name_id_path(root), locks)
        .with_lock_timeout(config.timeouts.lock_timeout());

    let rt = super::runtime()?;
    let (queue_created, registry_created) = rt.block_on(async {
        let q = wrapper
            .init(&theme)
            .await
            .context("failed to write task queue")?;
        let r = registry.init().await.context("failed to write registry")?;
        anyhow::Ok((q, r))
    })?;

    let warnings = config.validate();

    if json {
        print_json(&serde_json::json!({
            "root": root.display().to_string(),
            "theme": theme,
            "config_created": config_created,
            "task_queue_created": queue_created,
            "registry_created": registry_created,
            "warnings": warnings,
        }))?;
    } else {
        println!("Initializing VF task queues in: {}", root.display());
        let report = |created: bool, name: &str| {
            let state = if created { "created:" } else { "exists: " };
            println!("  {state} {name}");
        };
        report(config_created, paths::CONFIG_FILE);
        report(queue_created, config.task_queue_file.as_str());
        report(registry_created, config.name_id_file.as_str());
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }
    Ok(())
}
