//! Host bridge: the fixed set of host capabilities handed to the guest.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What the embedded interpreter may reach on the host side.
///
/// Built once per runtime and passed to every guest invocation. Neither
/// variant grants network access or inherits the host environment; the
/// `Restricted` variant only adds an explicit set of environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostBridge {
    /// No host capabilities beyond what the interpreter needs to start.
    #[default]
    Disabled,
    /// Expose the listed environment variables, nothing else.
    Restricted { env: BTreeMap<String, String> },
}

/// Variables every guest receives so the interpreter behaves deterministically.
const INTERPRETER_ENV: &[(&str, &str)] = &[
    ("PYTHONDONTWRITEBYTECODE", "1"),
    ("PYTHONHASHSEED", "0"),
    ("PYTHONIOENCODING", "utf-8"),
    ("MPLBACKEND", "Agg"),
    ("HOME", "/tmp"),
];

/// Names the guest can never be handed through a bridge.
const RESERVED_ENV: &[&str] = &["PYTHONPATH", "PYTHONHOME", "PYTHONSTARTUP"];

impl HostBridge {
    /// Environment for a guest invocation.
    pub fn guest_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = INTERPRETER_ENV
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if let HostBridge::Restricted { env: extra } = self {
            for (k, v) in extra {
                let taken = env.iter().any(|(existing, _)| existing == k);
                if taken || RESERVED_ENV.contains(&k.as_str()) {
                    continue;
                }
                env.push((k.clone(), v.clone()));
            }
        }
        env
    }
}

impl std::fmt::Display for HostBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostBridge::Disabled => write!(f, "disabled"),
            HostBridge::Restricted { env } => write!(f, "restricted({} vars)", env.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_bridge_only_carries_interpreter_env() {
        let env = HostBridge::Disabled.guest_env();
        assert_eq!(env.len(), INTERPRETER_ENV.len());
        assert!(env.iter().any(|(k, v)| k == "MPLBACKEND" && v == "Agg"));
    }

    #[test]
    fn test_restricted_bridge_never_overrides_reserved_names() {
        let mut extra = BTreeMap::new();
        extra.insert("PYTHONPATH".to_string(), "/evil".to_string());
        extra.insert("HOME".to_string(), "/root".to_string());
        extra.insert("TZ".to_string(), "UTC".to_string());
        let env = HostBridge::Restricted { env: extra }.guest_env();

        assert!(!env.iter().any(|(k, _)| k == "PYTHONPATH"));
        assert!(env.iter().any(|(k, v)| k == "HOME" && v == "/tmp"));
        assert!(env.iter().any(|(k, v)| k == "TZ" && v == "UTC"));
    }

    #[test]
    fn test_display() {
        assert_eq!(HostBridge::Disabled.to_string(), "disabled");
        assert_eq!(
            HostBridge::Restricted { env: BTreeMap::new() }.to_string(),
            "restricted(0 vars)"
        );
    }
}
