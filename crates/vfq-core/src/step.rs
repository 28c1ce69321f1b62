use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One entry of a queue's `before_insert_steps` / `after_pop_steps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Informational prompt for the operator; always succeeds.
    Message {
        #[serde(default)]
        content: String,
        /// Advisory hint such as `always` or `seldom`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display: Option<String>,
    },
    /// A script resolved by name inside the steps directory.
    Runnable {
        #[serde(default)]
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_file: Option<String>,
    },
}

impl Step {
    pub fn message(content: impl Into<String>) -> Self {
        Step::Message {
            content: content.into(),
            display: None,
        }
    }

    pub fn runnable(content: impl Into<String>, step_file: impl Into<String>) -> Self {
        Step::Runnable {
            content: content.into(),
            step_file: Some(step_file.into()),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Step::Message { content, .. } | Step::Runnable { content, .. } => content,
        }
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self, Step::Runnable { .. })
    }
}

// ---------------------------------------------------------------------------
// StepExecutionResult
// ---------------------------------------------------------------------------

/// Identifier reported for message steps, which resolve to no file.
pub const MESSAGE_STEP_ID: &str = "message";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "stepFile")]
    pub step_file: String,
}

impl StepExecutionResult {
    pub fn ok(step_file: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            step_file: step_file.into(),
        }
    }

    pub fn failed(
        step_file: impl Into<String>,
        error: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: Some(error.into()),
            step_file: step_file.into(),
        }
    }

    /// The step's own diagnostics: error first, then any distinct output.
    pub fn reason(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(err) = self.error.as_deref().filter(|e| !e.is_empty()) {
            parts.push(err);
        }
        if !self.output.is_empty() && !parts.contains(&self.output.as_str()) {
            parts.push(&self.output);
        }
        parts.join("\n")
    }
}

/// Result of a message step: its content, verbatim.
pub fn message_result(content: &str) -> StepExecutionResult {
    StepExecutionResult::ok(MESSAGE_STEP_ID, content)
}

/// First failed result in a step sequence, if any.
pub fn first_failure(results: &[StepExecutionResult]) -> Option<&StepExecutionResult> {
    results.iter().find(|r| !r.success)
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Resolves and runs steps. Failures are reported in the returned result,
/// never as a panic or error.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn execute_step(&self, step: &Step, params: &[String]) -> StepExecutionResult;

    /// Run `steps` in order, stopping right after the first failed runnable
    /// step.
    async fn execute_steps(&self, steps: &[Step], params: &[String]) -> Vec<StepExecutionResult> {
        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            let result = self.execute_step(step, params).await;
            let stop = step.is_runnable() && !result.success;
            results.push(result);
            if stop {
                tracing::debug!(step = step.content(), "step failed, stopping sequence");
                break;
            }
        }
        results
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records calls; runnable steps whose file is listed in `failing` fail.
    struct FakeRunner {
        failing: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StepRunner for FakeRunner {
        async fn execute_step(&self, step: &Step, _params: &[String]) -> StepExecutionResult {
            match step {
                Step::Message { content, .. } => message_result(content),
                Step::Runnable { step_file, .. } => {
                    let name = step_file.clone().unwrap_or_default();
                    self.calls.lock().unwrap().push(name.clone());
                    if self.failing.contains(&name.as_str()) {
                        StepExecutionResult::failed(name, "failed on purpose", "")
                    } else {
                        StepExecutionResult::ok(name, "ok")
                    }
                }
            }
        }
    }

    #[test]
    fn step_json_uses_type_tag() {
        let json = r#"[
            {"type": "runnable", "content": "Register user story", "step_file": "register_user_story_item"},
            {"type": "message", "content": "Do research and make scenarios", "display": "always"}
        ]"#;
        let steps: Vec<Step> = serde_json::from_str(json).unwrap();
        assert_eq!(
            steps[0],
            Step::runnable("Register user story", "register_user_story_item")
        );
        assert!(matches!(&steps[1], Step::Message { display: Some(d), .. } if d == "always"));

        let back = serde_json::to_string(&steps[1]).unwrap();
        assert!(back.contains("\"type\":\"message\""));
    }

    #[test]
    fn runnable_without_step_file_parses() {
        let step: Step =
            serde_json::from_str(r#"{"type": "runnable", "content": "Check queue empty"}"#).unwrap();
        assert!(matches!(step, Step::Runnable { step_file: None, .. }));
    }

    #[test]
    fn result_serializes_step_file_in_camel_case() {
        let json = serde_json::to_string(&StepExecutionResult::ok("a.js", "done")).unwrap();
        assert!(json.contains("\"stepFile\":\"a.js\""));
        assert!(!json.contains("error"));
    }

    #[test]
    fn reason_joins_error_and_output() {
        let r = StepExecutionResult::failed("x", "Process exited with code 1", "integration_tests: 1 items");
        assert_eq!(r.reason(), "Process exited with code 1\nintegration_tests: 1 items");
        let same = StepExecutionResult::failed("x", "boom", "boom");
        assert_eq!(same.reason(), "boom");
    }

    #[tokio::test]
    async fn sequence_stops_after_failed_runnable() {
        let runner = FakeRunner {
            failing: vec!["a"],
            calls: Mutex::new(Vec::new()),
        };
        let steps = vec![
            Step::runnable("A", "a"),
            Step::runnable("B", "b"),
            Step::message("never shown"),
        ];
        let results = runner.execute_steps(&steps, &[]).await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert_eq!(*runner.calls.lock().unwrap(), vec!["a".to_string()]);
        assert_eq!(first_failure(&results).map(|r| r.step_file.as_str()), Some("a"));
    }

    #[tokio::test]
    async fn message_only_sequences_always_succeed() {
        let runner = FakeRunner {
            failing: vec![],
            calls: Mutex::new(Vec::new()),
        };
        let steps = vec![
            Step::message(""),
            Step::message("FAIL"),
            Step::message("exit 1"),
        ];
        let results = runner.execute_steps(&steps, &[]).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(results[1].output, "FAIL");
        assert!(runner.calls.lock().unwrap().is_empty());
    }
}
