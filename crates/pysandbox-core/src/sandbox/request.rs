//! Execution request and result types.

use serde::{Deserialize, Serialize};

/// A request to run a script for one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub session_id: String,
    /// Arbitrary script text, not pre-validated.
    pub code: String,
    /// Wall-clock budget in milliseconds; must be positive.
    pub timeout_ms: u64,
}

impl ExecutionRequest {
    pub fn new(session_id: impl Into<String>, code: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            session_id: session_id.into(),
            code: code.into(),
            timeout_ms,
        }
    }
}

/// Outcome of one script execution.
///
/// On success `value` carries the stringified trailing expression and `error`
/// is empty; on failure `error` is non-empty and `value` is empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExecutionResult {
    pub success: bool,
    /// Captured stdout, possibly empty.
    pub output: String,
    pub value: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    /// Guest paths of figures saved during the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plots: Vec<String>,
    /// One line per package install attempt made before the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install_log: Vec<String>,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            error: if error.is_empty() {
                "Unknown error".to_string()
            } else {
                error
            },
            ..Default::default()
        }
    }

    /// Keep whatever stdout was captured before the failure.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_install_log(mut self, log: Vec<String>) -> Self {
        self.install_log = log;
        self
    }
}

impl From<crate::error::SandboxError> for ExecutionResult {
    fn from(err: crate::error::SandboxError) -> Self {
        ExecutionResult::failure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;

    #[test]
    fn test_success_and_failure_branches_are_exclusive() {
        let ok = ExecutionResult::success("hi\n", "2");
        assert!(ok.success && ok.error.is_empty() && ok.value == "2");

        let err = ExecutionResult::failure("boom");
        assert!(!err.success && err.value.is_empty() && err.error == "boom");
    }

    #[test]
    fn test_empty_failure_message_is_filled() {
        assert_eq!(ExecutionResult::failure("").error, "Unknown error");
    }

    #[test]
    fn test_from_sandbox_error() {
        let res: ExecutionResult = SandboxError::Timeout { limit_ms: 10 }.into();
        assert!(!res.success);
        assert!(res.error.contains("Execution timeout"));
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let json = serde_json::to_value(ExecutionResult::success("", "1")).unwrap();
        assert!(json.get("plots").is_none());
        assert!(json.get("install_log").is_none());
        assert_eq!(json["value"], "1");
    }
}
