//! Code-execution collaborator.
//!
//! The sync core never interprets source text. A `run` request is handed to
//! a [`CodeExecutor`] outside the hub, and whatever it returns is delivered
//! only to the requesting connection. Room state is never touched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Source text and the numeric language identifier the editor selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub source: String,
    pub language_id: u32,
}

/// What an executor produced. Absent streams serialize as `null`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
}

impl ExecutionOutput {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self { stdout: Some(text.into()), ..Self::default() }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { error: Some(error.into()), ..Self::default() }
    }

    /// Reply for a `run` request that lacks source text or a language.
    pub fn rejected() -> Self {
        Self::failed("Code and languageId are required")
    }
}

/// Runs source text somewhere else.
#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionOutput;
}

/// Executor used when no execution backend is configured.
///
/// Runs nothing; explains to the user how to enable execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredExecutor;

#[async_trait]
impl CodeExecutor for UnconfiguredExecutor {
    async fn execute(&self, request: ExecutionRequest) -> ExecutionOutput {
        ExecutionOutput::stdout(format!(
            "Language ID {} execution requires an execution backend.\n\n\
             Configure a CodeExecutor on the server to run code in this language.",
            request.language_id
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_executor_mentions_language() {
        let output = UnconfiguredExecutor
            .execute(ExecutionRequest { source: "print(1)".into(), language_id: 71 })
            .await;

        let stdout = output.stdout.unwrap();
        assert!(stdout.starts_with("Language ID 71"));
        assert!(output.stderr.is_none());
        assert!(output.error.is_none());
    }

    #[test]
    fn test_rejected_output() {
        let output = ExecutionOutput::rejected();
        assert_eq!(output.error.as_deref(), Some("Code and languageId are required"));
        assert!(output.stdout.is_none());
    }

    #[test]
    fn test_request_wire_names() {
        let request = ExecutionRequest { source: "x".into(), language_id: 63 };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["languageId"], 63);
        assert_eq!(value["source"], "x");
    }
}
