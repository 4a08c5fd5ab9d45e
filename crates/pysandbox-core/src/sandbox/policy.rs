//! Declarative capability policy applied inside the guest before untrusted code runs.
//!
//! The policy is plain data: the host serializes it to `/.runtime/policy.json`
//! and the in-guest driver walks the rules in order. Nothing else patches the
//! interpreter.

use serde::{Deserialize, Serialize};

/// Error text raised by every network primitive.
pub const NETWORK_DISABLED: &str = "Network access disabled";
/// Error text raised by every installer entry point.
pub const INSTALL_DISABLED: &str = "Package installation disabled";
/// In-guest module that performs wheel installs during the install phase.
pub const INSTALLER_MODULE: &str = "_sandbox_installer";

/// Tokens that make `execute_script` refuse a script before it reaches the guest.
pub const INSTALLER_TOKENS: &[&str] = &["micropip", INSTALLER_MODULE];

/// A single interception rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityRule {
    /// Replace `module.attribute` (dotted attribute paths allowed) with a
    /// callable raising `error(message)`.
    DenyCall {
        module: String,
        attribute: String,
        error: String,
        message: String,
    },
    /// Replace the whole module with a stub whose attributes raise.
    DenyModule {
        module: String,
        error: String,
        message: String,
    },
    /// Drop a module from `sys.modules` once setup is complete.
    ForgetModule { module: String },
}

impl CapabilityRule {
    pub fn deny_network(module: &str, attribute: &str) -> Self {
        CapabilityRule::DenyCall {
            module: module.to_string(),
            attribute: attribute.to_string(),
            error: "OSError".to_string(),
            message: NETWORK_DISABLED.to_string(),
        }
    }

    pub fn deny_install(module: &str) -> Self {
        CapabilityRule::DenyModule {
            module: module.to_string(),
            error: "PermissionError".to_string(),
            message: INSTALL_DISABLED.to_string(),
        }
    }

    /// Module this rule touches.
    pub fn module(&self) -> &str {
        match self {
            CapabilityRule::DenyCall { module, .. }
            | CapabilityRule::DenyModule { module, .. }
            | CapabilityRule::ForgetModule { module } => module,
        }
    }
}

/// An ordered rule list, applied first to last.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityPolicy {
    pub rules: Vec<CapabilityRule>,
}

impl CapabilityPolicy {
    /// A policy that intercepts nothing.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule and return `self` (builder pattern).
    pub fn with_rule(mut self, rule: CapabilityRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// The default policy: no network, no dynamic installs, no FFI.
    pub fn standard() -> Self {
        let mut rules = Vec::new();

        for attr in [
            "socket.connect",
            "socket.connect_ex",
            "socket.bind",
            "socket.sendto",
            "create_connection",
            "create_server",
            "getaddrinfo",
            "gethostbyname",
            "gethostbyname_ex",
            "gethostbyaddr",
            "getnameinfo",
        ] {
            rules.push(CapabilityRule::deny_network("socket", attr));
        }
        rules.push(CapabilityRule::deny_network("urllib.request", "urlopen"));
        rules.push(CapabilityRule::deny_network("urllib.request", "OpenerDirector.open"));
        rules.push(CapabilityRule::deny_network("http.client", "HTTPConnection.connect"));
        rules.push(CapabilityRule::deny_network("http.client", "HTTPSConnection.connect"));
        rules.push(CapabilityRule::deny_network("ssl", "SSLContext.wrap_socket"));
        rules.push(CapabilityRule::DenyModule {
            module: "_socket".to_string(),
            error: "OSError".to_string(),
            message: NETWORK_DISABLED.to_string(),
        });

        for module in ["micropip", "pip", "ensurepip", INSTALLER_MODULE] {
            rules.push(CapabilityRule::deny_install(module));
        }

        rules.push(CapabilityRule::DenyModule {
            module: "ctypes".to_string(),
            error: "PermissionError".to_string(),
            message: "Foreign function interface disabled".to_string(),
        });

        Self { rules }
    }

    /// Serialized form consumed by the guest driver.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// First installer token present in `code`, if any.
pub fn find_installer_token(code: &str) -> Option<&'static str> {
    INSTALLER_TOKENS.iter().copied().find(|t| code.contains(t))
}
