//! Package index client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::PackageError;

/// A downloadable pure-Python wheel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WheelRelease {
    pub distribution: String,
    pub version: String,
    pub filename: String,
    pub url: String,
    /// Hex SHA-256 published by the index, when available.
    pub sha256: Option<String>,
}

/// Source of wheel metadata and bytes.
#[async_trait]
pub trait PackageIndex: Send + Sync {
    /// Latest release's pure-Python wheel for `distribution`.
    async fn latest_wheel(&self, distribution: &str) -> Result<WheelRelease, PackageError>;

    /// Download the wheel's bytes.
    async fn download(&self, release: &WheelRelease) -> Result<Vec<u8>, PackageError>;
}

/// PyPI-compatible JSON API (`{base}/pypi/{name}/json`).
#[derive(Debug, Clone)]
pub struct PypiIndex {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ProjectResponse {
    info: ProjectInfo,
    #[serde(default)]
    urls: Vec<ReleaseFile>,
}

#[derive(Debug, Deserialize)]
struct ProjectInfo {
    version: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseFile {
    filename: String,
    url: String,
    #[serde(default)]
    packagetype: String,
    #[serde(default)]
    digests: Digests,
    #[serde(default)]
    yanked: bool,
}

#[derive(Debug, Default, Deserialize)]
struct Digests {
    sha256: Option<String>,
}

impl PypiIndex {
    pub fn new(base_url: &str) -> Result<Self, PackageError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("pysandbox/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn project_url(&self, distribution: &str) -> String {
        format!("{}/pypi/{}/json", self.base_url, distribution)
    }
}

#[async_trait]
impl PackageIndex for PypiIndex {
    async fn latest_wheel(&self, distribution: &str) -> Result<WheelRelease, PackageError> {
        let url = self.project_url(distribution);
        debug!(url = %url, "querying package index");

        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(PackageError::Index {
                package: distribution.to_string(),
                reason: format!("index returned {}", response.status()),
            });
        }
        let project: ProjectResponse = response.json().await?;
        select_pure_wheel(distribution, project)
    }

    async fn download(&self, release: &WheelRelease) -> Result<Vec<u8>, PackageError> {
        debug!(url = %release.url, "downloading wheel");
        let response = self.http.get(&release.url).send().await?;
        if !response.status().is_success() {
            return Err(PackageError::Index {
                package: release.distribution.clone(),
                reason: format!("download returned {}", response.status()),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Pick the release's `*-none-any.whl`, preferring a `py3` tag.
fn select_pure_wheel(
    distribution: &str,
    project: ProjectResponse,
) -> Result<WheelRelease, PackageError> {
    let mut candidates: Vec<ReleaseFile> = project
        .urls
        .into_iter()
        .filter(|f| !f.yanked)
        .filter(|f| f.packagetype.is_empty() || f.packagetype == "bdist_wheel")
        .filter(|f| f.filename.ends_with("-none-any.whl"))
        .collect();
    candidates.sort_by_key(|f| !f.filename.contains("-py3-"));

    let file = candidates
        .into_iter()
        .next()
        .ok_or_else(|| PackageError::NoPureWheel(distribution.to_string()))?;

    Ok(WheelRelease {
        distribution: distribution.to_string(),
        version: project.info.version,
        filename: file.filename,
        url: file.url,
        sha256: file.digests.sha256,
    })
}
