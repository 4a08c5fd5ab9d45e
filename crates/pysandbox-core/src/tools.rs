//! Tool surface: `python_execute` and `list_mounted_directory`.
//!
//! Renders sandbox results into the text-content shape a tool-calling
//! protocol layer returns to its client. Argument decoding from JSON is
//! included so a protocol server only has to route by tool name.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::SandboxError;
use crate::sandbox::mount::validate_session_id;
use crate::sandbox::{ExecutionResult, SessionRegistry, WorkerExecutor};

pub const PYTHON_EXECUTE: &str = "python_execute";
pub const LIST_MOUNTED_DIRECTORY: &str = "list_mounted_directory";

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const MAX_TIMEOUT_MS: u64 = 30_000;

/// One content block of a tool response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: text.into(),
        }
    }
}

/// `{ content: [...], isError }` as returned to the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl ToolResponse {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::text(text)],
            is_error: true,
        }
    }

    /// All text blocks joined by newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Advertised tool metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub required: Vec<String>,
}

/// Argument decoding failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("missing required argument '{field}' for {tool}")]
    MissingArgument { tool: String, field: String },

    #[error("argument '{field}' for {tool} must be {expected}")]
    InvalidArgument {
        tool: String,
        field: String,
        expected: &'static str,
    },
}

/// Clamp a requested timeout into `DEFAULT_TIMEOUT_MS..=MAX_TIMEOUT_MS`.
pub fn clamp_timeout(requested: Option<u64>) -> u64 {
    requested
        .unwrap_or(DEFAULT_TIMEOUT_MS)
        .clamp(DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS)
}

/// Render an execution result as tool response text.
pub fn render_execution(result: &ExecutionResult) -> ToolResponse {
    let mut blocks = Vec::new();
    if !result.install_log.is_empty() {
        blocks.push(ToolContent::text(format!(
            "Packages:\n{}",
            result.install_log.join("\n")
        )));
    }

    if result.success {
        let mut text = format!("Output:\n{}\nResult:\n{}", result.output, result.value);
        if !result.plots.is_empty() {
            text.push_str(&format!("\nPlots:\n{}", result.plots.join("\n")));
        }
        blocks.push(ToolContent::text(text));
        ToolResponse {
            content: blocks,
            is_error: false,
        }
    } else {
        let mut text = format!("Error: {}", result.error);
        if !result.output.is_empty() {
            text.push_str(&format!("\nOutput:\n{}", result.output));
        }
        blocks.push(ToolContent::text(text));
        ToolResponse {
            content: blocks,
            is_error: true,
        }
    }
}

/// The two sandbox tools over a shared registry.
#[derive(Debug, Clone)]
pub struct SandboxTools {
    registry: Arc<SessionRegistry>,
    executor: WorkerExecutor,
}

impl SandboxTools {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        let executor = WorkerExecutor::new(Arc::clone(&registry));
        Self { registry, executor }
    }

    pub fn executor(&self) -> &WorkerExecutor {
        &self.executor
    }

    pub fn definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: PYTHON_EXECUTE.to_string(),
                description: "Execute Python code in the session's sandbox. Returns captured \
                              stdout and the value of the final expression."
                    .to_string(),
                required: vec!["sessionId".to_string(), "code".to_string()],
            },
            ToolDefinition {
                name: LIST_MOUNTED_DIRECTORY.to_string(),
                description: "List files in the session's mounted directory.".to_string(),
                required: vec!["sessionId".to_string()],
            },
        ]
    }

    pub async fn python_execute(
        &self,
        session_id: &str,
        code: &str,
        timeout_ms: Option<u64>,
    ) -> ToolResponse {
        let result = self
            .executor
            .run_code(session_id, code, clamp_timeout(timeout_ms))
            .await;
        render_execution(&result)
    }

    /// List the session's mount as it stands; never creates the mount or a
    /// registry entry.
    pub async fn list_mounted_directory(&self, session_id: &str) -> ToolResponse {
        if validate_session_id(session_id).is_err() {
            let err = SandboxError::InvalidSession(session_id.to_string());
            return ToolResponse::error(format!("Error: {err}"));
        }
        let listing = match self.registry.get(session_id) {
            Some(runtime) => runtime.list_mounted_directory(),
            None => Err(SandboxError::MountPointAbsent(
                self.registry.context().config.sandbox_path_for(session_id),
            )),
        };

        match listing {
            Ok(entries) => {
                let lines: Vec<String> = entries
                    .iter()
                    .map(|e| {
                        let kind = if e.is_dir { "DIR" } else { "FILE" };
                        format!("{kind}: {}", e.name)
                    })
                    .collect();
                ToolResponse::ok(lines.join("\n"))
            }
            Err(e) => ToolResponse::error(format!("Error: {e}")),
        }
    }

    /// Dispatch a call by tool name with JSON arguments.
    pub async fn call(&self, name: &str, args: &Value) -> ToolResponse {
        match self.dispatch(name, args).await {
            Ok(response) => response,
            Err(e) => ToolResponse::error(format!("Error: {e}")),
        }
    }

    async fn dispatch(&self, name: &str, args: &Value) -> Result<ToolResponse, ToolError> {
        match name {
            PYTHON_EXECUTE => {
                let session_id = string_arg(name, args, "sessionId")?;
                let code = string_arg(name, args, "code")?;
                let timeout = match args.get("timeout") {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(v.as_f64().filter(|t| *t > 0.0).map(|t| t as u64).ok_or_else(
                        || ToolError::InvalidArgument {
                            tool: name.to_string(),
                            field: "timeout".to_string(),
                            expected: "a positive number",
                        },
                    )?),
                };
                Ok(self.python_execute(session_id, code, timeout).await)
            }
            LIST_MOUNTED_DIRECTORY => {
                let session_id = string_arg(name, args, "sessionId")?;
                Ok(self.list_mounted_directory(session_id).await)
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }
}

fn string_arg<'a>(tool: &str, args: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    match args.get(field) {
        None | Some(Value::Null) => Err(ToolError::MissingArgument {
            tool: tool.to_string(),
            field: field.to_string(),
        }),
        Some(v) => v.as_str().ok_or_else(|| ToolError::InvalidArgument {
            tool: tool.to_string(),
            field: field.to_string(),
            expected: "a string",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_timeout() {
        assert_eq!(clamp_timeout(None), 5_000);
        assert_eq!(clamp_timeout(Some(10)), 5_000);
        assert_eq!(clamp_timeout(Some(12_000)), 12_000);
        assert_eq!(clamp_timeout(Some(90_000)), 30_000);
    }

    #[test]
    fn test_render_success() {
        let result = ExecutionResult::success("hi\n", "2");
        let response = render_execution(&result);
        assert!(!response.is_error);
        assert_eq!(response.text(), "Output:\nhi\n\nResult:\n2");
    }

    #[test]
    fn test_render_failure_with_packages() {
        let result = ExecutionResult::failure("ModuleNotFoundError: No module named 'yaml'")
            .with_install_log(vec!["yaml: install failed: boom".to_string()]);
        let response = render_execution(&result);
        assert!(response.is_error);
        assert_eq!(response.content.len(), 2);
        assert_eq!(response.content[0].text, "Packages:\nyaml: install failed: boom");
        assert!(response.content[1].text.starts_with("Error: ModuleNotFoundError"));
    }

    #[test]
    fn test_response_wire_format() {
        let json = serde_json::to_value(ToolResponse::ok("x")).unwrap();
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["isError"], false);
    }

    #[test]
    fn test_string_arg_errors() {
        let args = serde_json::json!({"sessionId": 3});
        assert!(matches!(
            string_arg("t", &args, "code"),
            Err(ToolError::MissingArgument { .. })
        ));
        assert!(matches!(
            string_arg("t", &args, "sessionId"),
            Err(ToolError::InvalidArgument { .. })
        ));
    }
}
