//! Resolution and execution of runnable step scripts.
//!
//! A runnable step names a script inside the steps directory. Resolution tries
//! `<name>.js`, then `<name>`, then `<name>.py`. `.js` scripts run under the
//! configured JS runtime, `.py` scripts under the configured Python runtime,
//! and anything else is executed directly. Parameters are passed as
//! positional arguments; the working directory is inherited.

use crate::config::{Config, RuntimeConfig};
use crate::paths;
use crate::sanitize;
use crate::step::{message_result, Step, StepExecutionResult, StepRunner};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const SCRIPT_SUFFIXES: &[&str] = &[".js", "", ".py"];

/// Compatibility shim for steps that carry no `step_file`: lower-case the
/// content, map every non-alphanumeric character to `_`, append `.js`.
pub fn script_name_from_content(content: &str) -> String {
    let stem: String = content
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{stem}.js")
}

#[derive(Debug, Clone)]
pub struct StepFileExecutor {
    steps_dir: PathBuf,
    runtimes: RuntimeConfig,
    timeout: Option<Duration>,
}

impl StepFileExecutor {
    /// Use `steps_dir` when given, else discover `llm_rules/steps` upward from
    /// the current directory, else fall back to the relative default.
    pub fn new(steps_dir: Option<PathBuf>) -> Self {
        let steps_dir = steps_dir.unwrap_or_else(|| {
            std::env::current_dir()
                .ok()
                .and_then(|cwd| paths::discover_steps_dir(&cwd))
                .unwrap_or_else(|| PathBuf::from(paths::STEPS_DIR))
        });
        Self {
            steps_dir,
            runtimes: RuntimeConfig::default(),
            timeout: None,
        }
    }

    pub fn from_config(config: &Config, root: &Path) -> Self {
        Self {
            steps_dir: config.resolve_steps_dir(root),
            runtimes: config.runtimes.clone(),
            timeout: config.timeouts.step_timeout(),
        }
    }

    pub fn with_runtimes(mut self, runtimes: RuntimeConfig) -> Self {
        self.runtimes = runtimes;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn steps_dir(&self) -> &Path {
        &self.steps_dir
    }

    /// Resolve `name` to an existing script, trying each suffix in order.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        SCRIPT_SUFFIXES
            .iter()
            .map(|suffix| self.steps_dir.join(format!("{name}{suffix}")))
            .find(|candidate| candidate.is_file())
    }

    pub fn step_file_exists(&self, name: &str) -> bool {
        sanitize::sanitize_path(name).valid && self.resolve(name).is_some()
    }

    async fn run_named(&self, name: &str, params: &[String]) -> StepExecutionResult {
        let checked = sanitize::sanitize_path(name);
        if !checked.valid {
            tracing::warn!(step = name, issues = ?checked.issues, "rejected step file name");
            return StepExecutionResult::failed(
                name,
                format!("Invalid step file name: {name}"),
                "",
            );
        }
        match self.resolve(name) {
            Some(script) => self.run_script(name, &script, params).await,
            None => StepExecutionResult::failed(name, format!("Step file not found: {name}"), ""),
        }
    }

    async fn run_from_content(&self, content: &str, params: &[String]) -> StepExecutionResult {
        let script_name = script_name_from_content(content);
        let stem = script_name.trim_end_matches(".js");
        match self.resolve(stem) {
            Some(script) => self.run_script(&script_name, &script, params).await,
            None => StepExecutionResult::failed(
                script_name.as_str(),
                format!("No script found for content: {content}"),
                "",
            ),
        }
    }

    /// `.js` and `.py` scripts go through their interpreter, looked up on
    /// `PATH`; anything else is executed directly.
    fn build_command(&self, script: &Path) -> std::result::Result<Command, String> {
        let runtime = match script.extension().and_then(|e| e.to_str()) {
            Some("js") => Some(&self.runtimes.js),
            Some("py") => Some(&self.runtimes.python),
            _ => None,
        };
        match runtime {
            Some(name) => {
                let interpreter =
                    which::which(name).map_err(|_| format!("Interpreter not found: {name}"))?;
                let mut cmd = Command::new(interpreter);
                cmd.arg(script);
                Ok(cmd)
            }
            None => Ok(Command::new(script)),
        }
    }

    async fn run_script(&self, id: &str, script: &Path, params: &[String]) -> StepExecutionResult {
        let mut cmd = match self.build_command(script) {
            Ok(c) => c,
            Err(e) => return StepExecutionResult::failed(id, e, ""),
        };
        cmd.args(params)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(step = id, script = %script.display(), "running step script");

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(step = id, error = %e, "failed to spawn step");
                return StepExecutionResult::failed(
                    id,
                    format!("Failed to start '{}': {e}", script.display()),
                    "",
                );
            }
        };

        let waited = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(r) => r,
                Err(_) => {
                    tracing::warn!(step = id, seconds = limit.as_secs(), "step timed out");
                    return StepExecutionResult::failed(
                        id,
                        format!("Step timed out after {}s: {id}", limit.as_secs()),
                        "",
                    );
                }
            },
            None => child.wait_with_output().await,
        };

        let output = match waited {
            Ok(o) => o,
            Err(e) => {
                return StepExecutionResult::failed(id, format!("Failed to wait for step: {e}"), "")
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if output.status.success() {
            StepExecutionResult::ok(id, stdout)
        } else {
            let error = if stderr.is_empty() {
                match output.status.code() {
                    Some(code) => format!("Process exited with code {code}"),
                    None => "Process terminated by signal".to_string(),
                }
            } else {
                stderr
            };
            tracing::debug!(step = id, %error, "step script failed");
            StepExecutionResult::failed(id, error, stdout)
        }
    }
}

#[async_trait]
impl StepRunner for StepFileExecutor {
    async fn execute_step(&self, step: &Step, params: &[String]) -> StepExecutionResult {
        match step {
            Step::Message { content, .. } => message_result(content),
            Step::Runnable {
                step_file: Some(name),
                ..
            } => self.run_named(name, params).await,
            Step::Runnable { content, .. } => self.run_from_content(content, params).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
