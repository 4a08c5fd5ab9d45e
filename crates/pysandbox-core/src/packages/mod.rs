//! Package resolution for sandbox sessions.
//!
//! Scripts are scanned for top-level imports, filtered through an allow-list,
//! and each surviving package is either copied in from the bundled native
//! repository or fetched from a package index as a pure-Python wheel and
//! installed through the in-guest fallback installer.

pub mod cache;
pub mod index;
pub mod resolver;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub use cache::WheelCache;
pub use index::{PackageIndex, PypiIndex, WheelRelease};
pub use resolver::{NativeRepository, PackageResolver, SessionPaths, WheelInstaller};

/// Import names allowed by default, with the distribution each resolves to.
const DEFAULT_ALLOWED: &[(&str, &str)] = &[
    ("numpy", "numpy"),
    ("pandas", "pandas"),
    ("matplotlib", "matplotlib"),
    ("scipy", "scipy"),
    ("sklearn", "scikit-learn"),
    ("sympy", "sympy"),
    ("networkx", "networkx"),
    ("seaborn", "seaborn"),
    ("bs4", "beautifulsoup4"),
    ("yaml", "pyyaml"),
    ("PIL", "pillow"),
    ("dateutil", "python-dateutil"),
    ("pytz", "pytz"),
    ("six", "six"),
    ("tabulate", "tabulate"),
    ("attrs", "attrs"),
    ("more_itertools", "more-itertools"),
    ("toolz", "toolz"),
    ("mpmath", "mpmath"),
];

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("{0} is not on the allow-list")]
    NotAllowed(String),

    #[error("no bundled package for {0}")]
    NativeUnavailable(String),

    #[error("index lookup for {package} failed: {reason}")]
    Index { package: String, reason: String },

    #[error("no pure-Python wheel published for {0}")]
    NoPureWheel(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("digest mismatch for {file}: expected {expected}, got {actual}")]
    DigestMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("invalid wheel filename {0:?}")]
    InvalidFilename(String),

    #[error("installer failed for {package}: {reason}")]
    Install { package: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for PackageError {
    fn from(err: reqwest::Error) -> Self {
        PackageError::Http(err.to_string())
    }
}

/// Import name → distribution name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowList {
    entries: BTreeMap<String, String>,
}

impl Default for AllowList {
    fn default() -> Self {
        Self {
            entries: DEFAULT_ALLOWED
                .iter()
                .map(|(import, dist)| (import.to_string(), dist.to_string()))
                .collect(),
        }
    }
}

impl AllowList {
    /// Parse `import=distribution` or bare `name` entries separated by commas.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut entries = BTreeMap::new();
        for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (import, dist) = match item.split_once('=') {
                Some((i, d)) => (i.trim(), d.trim()),
                None => (item, item),
            };
            if !is_identifier(import) {
                return Err(format!("{import:?} is not a valid import name"));
            }
            if dist.is_empty() || dist.contains(['/', '\\', ' ']) {
                return Err(format!("{dist:?} is not a valid distribution name"));
            }
            entries.insert(import.to_string(), dist.to_string());
        }
        if entries.is_empty() {
            return Err("allow-list is empty".to_string());
        }
        Ok(Self { entries })
    }

    pub fn distribution(&self, import: &str) -> Option<&str> {
        self.entries.get(import).map(String::as_str)
    }

    pub fn contains(&self, import: &str) -> bool {
        self.entries.contains_key(import)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(i, d)| (i.as_str(), d.as_str()))
    }
}

/// A package referenced by a script and admitted by the allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    /// Top-level import name.
    pub name: String,
    /// Distribution name on the index.
    pub distribution: String,
    /// Whether the bundled repository can load it without the wheel pipeline.
    pub is_native: bool,
}

static IMPORT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*import[ \t]+([^#;\n]+)").expect("import pattern is valid")
});
static FROM_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*from[ \t]+([A-Za-z_][A-Za-z0-9_]*)[A-Za-z0-9_.]*[ \t]+import\b")
        .expect("from-import pattern is valid")
});

/// Top-level module names imported by `code`, in first-seen order.
///
/// Line-anchored `import X` / `from X import` only; relative, indirect and
/// dynamically constructed imports are not seen.
pub fn scan_imports(code: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();

    for caps in IMPORT_LINE.captures_iter(code) {
        let Some(list) = caps.get(1) else { continue };
        for item in list.as_str().split(',') {
            let module = item.split_whitespace().next().unwrap_or_default();
            let top = module.split('.').next().unwrap_or_default();
            if is_identifier(top) {
                found.push((list.start(), top.to_string()));
            }
        }
    }
    for caps in FROM_LINE.captures_iter(code) {
        if let Some(m) = caps.get(1) {
            found.push((m.start(), m.as_str().to_string()));
        }
    }

    found.sort_by_key(|(pos, _)| *pos);
    let mut names: Vec<String> = Vec::new();
    for (_, name) in found {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// How a package was (or was attempted to be) provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStrategy {
    /// Already present in the session's site-packages.
    Present,
    /// Copied from the bundled native repository.
    Native,
    /// Downloaded wheel installed by the in-guest installer.
    Fallback,
}

impl InstallStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallStrategy::Present => "present",
            InstallStrategy::Native => "native",
            InstallStrategy::Fallback => "fallback",
        }
    }
}

/// One settled install attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallAttempt {
    pub package: String,
    pub strategy: InstallStrategy,
    pub success: bool,
    pub detail: String,
}

impl fmt::Display for InstallAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.strategy, self.success) {
            (InstallStrategy::Present, _) => write!(f, "{}: already installed", self.package),
            (InstallStrategy::Native, true) => write!(f, "{}: loaded natively", self.package),
            (InstallStrategy::Native, false) => write!(
                f,
                "{}: native load failed ({}), trying wheel fallback",
                self.package, self.detail
            ),
            (InstallStrategy::Fallback, true) => {
                write!(f, "{}: installed {}", self.package, self.detail)
            }
            (InstallStrategy::Fallback, false) => {
                write!(f, "{}: install failed: {}", self.package, self.detail)
            }
        }
    }
}

/// Ordered log of install attempts for one resolve pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOutcome {
    attempts: Vec<InstallAttempt>,
}

impl InstallOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, attempt: InstallAttempt) {
        crate::obs::emit_package_attempt(
            &attempt.package,
            attempt.strategy.as_str(),
            attempt.success,
        );
        self.attempts.push(attempt);
    }

    pub fn extend(&mut self, other: InstallOutcome) {
        self.attempts.extend(other.attempts);
    }

    pub fn attempts(&self) -> &[InstallAttempt] {
        &self.attempts
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    /// True when the last attempt for `package` succeeded.
    pub fn succeeded(&self, package: &str) -> bool {
        self.attempts
            .iter()
            .rev()
            .find(|a| a.package == package)
            .is_some_and(|a| a.success)
    }

    /// Packages whose final attempt failed.
    pub fn failed_packages(&self) -> Vec<&str> {
        let mut failed: Vec<&str> = Vec::new();
        for attempt in &self.attempts {
            if !failed.contains(&attempt.package.as_str()) && !self.succeeded(&attempt.package) {
                failed.push(&attempt.package);
            }
        }
        failed
    }

    /// One human-readable line per attempt.
    pub fn lines(&self) -> Vec<String> {
        self.attempts.iter().map(ToString::to_string).collect()
    }
}
