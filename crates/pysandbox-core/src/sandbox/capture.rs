//! Output capture: decoding what a guest run wrote.
//!
//! Inside the guest the driver redirects stdout and stderr for exactly one
//! execution and then prints a single marker-prefixed JSON envelope to the real
//! stdout. On the host side this module finds that envelope, keeps any stray
//! stdout as raw output, and caps everything at the configured size.

use serde::{Deserialize, Serialize};

use super::request::ExecutionResult;
use crate::guest::GuestOutcome;

/// Prefix of the result line written by the in-guest driver.
pub const MARKER: &str = "\u{1e}__PYSANDBOX_RESULT__";

/// Appended when output exceeds the capture cap.
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Result envelope emitted by the driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GuestEnvelope {
    pub success: bool,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub plots: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
}

impl GuestEnvelope {
    pub fn ok(value: impl Into<String>) -> Self {
        Self {
            success: true,
            value: Some(value.into()),
            ..Default::default()
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    /// Render the envelope as the driver would print it.
    pub fn encode(&self) -> String {
        // serialization of plain strings cannot fail
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("{MARKER}{json}\n")
    }

    /// Convert into the public result shape, capping text at `limit` bytes.
    pub fn into_result(self, limit: usize) -> ExecutionResult {
        let output = clip(&self.output, limit);
        let mut result = if self.success {
            ExecutionResult::success(output, self.value.unwrap_or_default())
        } else {
            ExecutionResult::failure(self.error.unwrap_or_default()).with_output(output)
        };
        result.stderr = clip(&self.stderr, limit);
        result.plots = self.plots;
        result
    }
}

/// Stdout/stderr of a guest run, split into the envelope and everything else.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CapturedRun {
    pub envelope: Option<GuestEnvelope>,
    /// Stdout lines that were not an envelope.
    pub raw_stdout: String,
    pub stderr: String,
}

impl CapturedRun {
    /// Decode a finished guest run.
    pub fn parse(outcome: &GuestOutcome) -> Self {
        let stdout = String::from_utf8_lossy(&outcome.stdout);
        let stderr = String::from_utf8_lossy(&outcome.stderr).into_owned();

        let mut envelope = None;
        let mut raw = String::new();
        for line in stdout.split_inclusive('\n') {
            match line.strip_prefix(MARKER) {
                Some(json) => match serde_json::from_str::<GuestEnvelope>(json.trim_end()) {
                    Ok(parsed) => envelope = Some(parsed),
                    Err(e) => {
                        tracing::debug!(error = %e, "discarding malformed result envelope");
                    }
                },
                None => raw.push_str(line),
            }
        }

        Self {
            envelope,
            raw_stdout: raw,
            stderr,
        }
    }

    /// Build the execution result, capping output at `limit` bytes.
    ///
    /// With no envelope the guest died before reporting; the failure carries
    /// the tail of stderr and the exit code.
    pub fn into_result(self, exit_code: i32, limit: usize) -> ExecutionResult {
        match self.envelope {
            Some(mut envelope) => {
                if !self.raw_stdout.is_empty() {
                    envelope.output = format!("{}{}", self.raw_stdout, envelope.output);
                }
                envelope.into_result(limit)
            }
            None => {
                let tail = self.stderr.trim_end();
                let error = if tail.is_empty() {
                    format!("interpreter exited with code {exit_code} without a result")
                } else {
                    last_lines(tail, 20)
                };
                ExecutionResult::failure(error).with_output(clip(&self.raw_stdout, limit))
            }
        }
    }
}

/// Cap `text` at `limit` bytes on a char boundary, appending [`TRUNCATION_MARKER`].
///
/// A zero limit disables the cap.
pub fn clip(text: &str, limit: usize) -> String {
    if limit == 0 || text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], TRUNCATION_MARKER)
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(stdout: &str, stderr: &str) -> GuestOutcome {
        GuestOutcome {
            exit_code: 0,
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_marker_matches_driver() {
        assert!(crate::guest::DRIVER_SOURCE.contains("__PYSANDBOX_RESULT__"));
    }

    #[test]
    fn test_parses_last_envelope_and_keeps_raw_stdout() {
        let stdout = format!(
            "stray line\n{}{}",
            GuestEnvelope::ok("1").encode(),
            GuestEnvelope::ok("2").with_output("hi\n").encode()
        );
        let run = CapturedRun::parse(&outcome(&stdout, ""));
        assert_eq!(run.raw_stdout, "stray line\n");

        let result = run.into_result(0, 0);
        assert!(result.success);
        assert_eq!(result.value, "2");
        assert_eq!(result.output, "stray line\nhi\n");
    }

    #[test]
    fn test_failure_envelope_keeps_output() {
        let env = GuestEnvelope::err("OSError: Network access disabled").with_output("before\n");
        let result = CapturedRun::parse(&outcome(&env.encode(), "")).into_result(0, 0);
        assert!(!result.success);
        assert_eq!(result.output, "before\n");
        assert!(result.error.ends_with("Network access disabled"));
        assert!(result.value.is_empty());
    }

    #[test]
    fn test_missing_envelope_reports_stderr_tail() {
        let result = CapturedRun::parse(&outcome("", "Fatal Python error: init\n"))
            .into_result(1, 0);
        assert!(!result.success);
        assert_eq!(result.error, "Fatal Python error: init");

        let silent = CapturedRun::parse(&outcome("", "")).into_result(3, 0);
        assert!(silent.error.contains("code 3"));
    }

    #[test]
    fn test_clip_respects_char_boundaries() {
        assert_eq!(clip("abc", 0), "abc");
        assert_eq!(clip("abc", 3), "abc");
        assert_eq!(clip("abcdef", 3), format!("abc{TRUNCATION_MARKER}"));
        // 'é' is two bytes; cutting inside it backs off to the boundary
        assert_eq!(clip("aé", 2), format!("a{TRUNCATION_MARKER}"));
    }

    #[test]
    fn test_malformed_envelope_is_ignored() {
        let stdout = format!("{MARKER}{{not json\n");
        let run = CapturedRun::parse(&outcome(&stdout, "boom"));
        assert!(run.envelope.is_none());
        assert!(run.raw_stdout.is_empty());
    }

    #[test]
    fn test_probe_info_round_trips() {
        let mut env = GuestEnvelope::ok("3.12.0");
        env.info = Some(serde_json::json!({"platform": "wasi", "rules": 4}));
        let run = CapturedRun::parse(&outcome(&env.encode(), ""));
        let info = run.envelope.unwrap().info.unwrap();
        assert_eq!(info["platform"], "wasi");
    }
}
