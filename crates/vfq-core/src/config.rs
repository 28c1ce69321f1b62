use crate::error::{Result, VfError};
use crate::paths;
use crate::sanitize;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

/// Interpreters used for runnable step scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_js_runtime")]
    pub js: String,
    #[serde(default = "default_python_runtime")]
    pub python: String,
}

fn default_js_runtime() -> String {
    "node".to_string()
}

fn default_python_runtime() -> String {
    "python3".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            js: default_js_runtime(),
            python: default_python_runtime(),
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutConfig
// ---------------------------------------------------------------------------

/// `0` disables the corresponding timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_step_seconds")]
    pub step_seconds: u64,
    #[serde(default = "default_lock_seconds")]
    pub lock_seconds: u64,
}

fn default_step_seconds() -> u64 {
    300
}

fn default_lock_seconds() -> u64 {
    60
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            step_seconds: default_step_seconds(),
            lock_seconds: default_lock_seconds(),
        }
    }
}

impl TimeoutConfig {
    pub fn step_timeout(&self) -> Option<Duration> {
        (self.step_seconds > 0).then(|| Duration::from_secs(self.step_seconds))
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_seconds > 0).then(|| Duration::from_secs(self.lock_seconds))
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_task_queue_file")]
    pub task_queue_file: String,
    #[serde(default = "default_name_id_file")]
    pub name_id_file: String,
    /// Explicit steps directory, relative to the project root. Discovered
    /// from the root upward when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps_dir: Option<String>,
    #[serde(default)]
    pub runtimes: RuntimeConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Item kinds that get a `register_<kind>_item` built-in step.
    #[serde(default = "default_registry_kinds")]
    pub registry_kinds: Vec<String>,
}

fn default_task_queue_file() -> String {
    paths::TASK_QUEUE_FILE.to_string()
}

fn default_name_id_file() -> String {
    paths::NAME_ID_FILE.to_string()
}

fn default_registry_kinds() -> Vec<String> {
    ["user_story", "scenario", "integration_test", "system_test"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            task_queue_file: default_task_queue_file(),
            name_id_file: default_name_id_file(),
            steps_dir: None,
            runtimes: RuntimeConfig::default(),
            timeouts: TimeoutConfig::default(),
            registry_kinds: default_registry_kinds(),
        }
    }
}

/// Problems that keep `value` from being joined onto the project root.
fn path_issues(value: &str) -> Vec<String> {
    let mut issues = sanitize::sanitize_path(value).issues;
    if Path::new(value).is_absolute() || value.starts_with('/') || value.starts_with('\\') {
        issues.push("Absolute paths are not allowed".to_string());
    }
    issues
}

impl Config {
    /// Load `.vf/config.yaml`, falling back to defaults when it is absent.
    /// Fails with `InvalidPath` if a configured file or directory would
    /// resolve outside the project root.
    pub fn load(root: &Path) -> Result<Self> {
        let config = Self::read(root)?;
        config.check_paths()?;
        Ok(config)
    }

    /// Parse `.vf/config.yaml` without checking its paths. Only for
    /// reporting on the file itself.
    pub fn read(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    /// Every configured path must stay relative and free of traversal.
    pub fn check_paths(&self) -> Result<()> {
        let configured = [
            Some(&self.task_queue_file),
            Some(&self.name_id_file),
            self.steps_dir.as_ref(),
        ];
        for value in configured.into_iter().flatten() {
            let issues = path_issues(value);
            if !issues.is_empty() {
                return Err(VfError::InvalidPath {
                    path: value.clone(),
                    issues: issues.join("; "),
                });
            }
        }
        Ok(())
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&paths::config_path(root), data.as_bytes())
    }

    pub fn task_queue_path(&self, root: &Path) -> PathBuf {
        root.join(&self.task_queue_file)
    }

    pub fn name_id_path(&self, root: &Path) -> PathBuf {
        root.join(&self.name_id_file)
    }

    /// Explicit steps directory, then discovery upward from `root`, then the
    /// fixed relative default.
    pub fn resolve_steps_dir(&self, root: &Path) -> PathBuf {
        if let Some(dir) = &self.steps_dir {
            return root.join(dir);
        }
        paths::discover_steps_dir(root).unwrap_or_else(|| paths::steps_dir(root))
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        let configured = [
            ("task_queue_file", Some(&self.task_queue_file)),
            ("name_id_file", Some(&self.name_id_file)),
            ("steps_dir", self.steps_dir.as_ref()),
        ];
        for (field, value) in configured {
            let Some(value) = value else { continue };
            let issues = path_issues(value);
            if !issues.is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("{field} '{value}' is unsafe: {}", issues.join("; ")),
                });
            }
        }

        for kind in &self.registry_kinds {
            if !sanitize::sanitize_file_name(kind).valid {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("registry kind '{kind}' contains invalid characters"),
                });
            }
        }

        if self.timeouts.step_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "step timeout disabled: a hung step script blocks its queue".to_string(),
            });
        }
        if self.timeouts.lock_seconds == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "lock timeout disabled: a stuck holder blocks waiters indefinitely"
                    .to_string(),
            });
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.runtimes.js, "node");
        assert_eq!(config.timeouts.step_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = "runtimes:\n  js: bun\ntimeouts:\n  lock_seconds: 0\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.runtimes.js, "bun");
        assert_eq!(config.runtimes.python, "python3");
        assert_eq!(config.timeouts.lock_timeout(), None);
        assert_eq!(config.task_queue_file, "TASK_QUEUE.vf.json");
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            steps_dir: Some("rules/steps".to_string()),
            ..Config::default()
        };
        config.save(dir.path()).unwrap();
        assert_eq!(Config::load(dir.path()).unwrap(), config);
    }

    #[test]
    fn explicit_steps_dir_wins_over_discovery() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("llm_rules/steps")).unwrap();
        let config = Config {
            steps_dir: Some("custom".to_string()),
            ..Config::default()
        };
        assert_eq!(config.resolve_steps_dir(dir.path()), dir.path().join("custom"));
        assert_eq!(
            Config::default().resolve_steps_dir(dir.path()),
            dir.path().join("llm_rules/steps")
        );
    }

    #[test]
    fn validate_flags_traversal_in_file_names() {
        let config = Config {
            task_queue_file: "../outside.json".to_string(),
            ..Config::default()
        };
        let warnings = config.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("task_queue_file")));
    }

    #[test]
    fn load_rejects_paths_outside_the_root() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".vf")).unwrap();
        std::fs::write(
            paths::config_path(dir.path()),
            "task_queue_file: ../escaped.json\n",
        )
        .unwrap();
        let err = Config::load(dir.path()).unwrap_err();
        assert!(matches!(err, VfError::InvalidPath { ref path, .. } if path == "../escaped.json"));

        // Reading for a report still works.
        assert_eq!(Config::read(dir.path()).unwrap().task_queue_file, "../escaped.json");

        for yaml in ["name_id_file: /tmp/NAME_ID.vf.json\n", "steps_dir: a/../../steps\n"] {
            std::fs::write(paths::config_path(dir.path()), yaml).unwrap();
            assert!(matches!(
                Config::load(dir.path()),
                Err(VfError::InvalidPath { .. })
            ));
        }
    }

    #[test]
    fn default_config_is_clean() {
        assert!(Config::default().validate().is_empty());
    }
}
