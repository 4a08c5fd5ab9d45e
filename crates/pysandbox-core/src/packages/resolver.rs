//! `PackageResolver`: turns a script's imports into installed packages.
//!
//! Natively loadable packages and wheel-fallback packages are processed
//! concurrently; a package whose native load fails is retried through the
//! wheel pipeline once both branches settle. Every attempt is recorded in the
//! returned [`InstallOutcome`] and one package's failure never stops the rest.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{
    scan_imports, AllowList, InstallAttempt, InstallOutcome, InstallStrategy, PackageError,
    PackageIndex, PackageSpec, PypiIndex, WheelCache,
};
use crate::config::SandboxConfig;
use crate::guest::WHEELS_GUEST_DIR;
use crate::metrics::METRICS;

/// Host directories backing a session's package locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    /// Exposed to the guest as `/site-packages`.
    pub site_packages: PathBuf,
    /// Exposed to the guest as `/tmp/wheels`.
    pub wheels: PathBuf,
}

/// Installs staged wheels inside a session.
#[async_trait]
pub trait WheelInstaller: Send + Sync {
    /// Make the fallback installer loadable. Called at most once per resolve pass.
    async fn prepare(&self) -> Result<(), PackageError>;

    /// Install the wheel staged at guest path `wheel`; returns installed top-level names.
    async fn install(&self, package: &str, wheel: &str) -> Result<Vec<String>, PackageError>;
}

/// Bundled packages: `<root>/<distribution>/` holds importable top-level entries.
#[derive(Debug, Clone, Default)]
pub struct NativeRepository {
    root: Option<PathBuf>,
}

impl NativeRepository {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    pub fn has(&self, distribution: &str) -> bool {
        self.root
            .as_ref()
            .is_some_and(|root| root.join(distribution).is_dir())
    }

    /// Copy `distribution` into `target`, returning the copied top-level names.
    pub fn load(&self, distribution: &str, target: &Path) -> Result<Vec<String>, PackageError> {
        let source = match &self.root {
            Some(root) if root.join(distribution).is_dir() => root.join(distribution),
            _ => return Err(PackageError::NativeUnavailable(distribution.to_string())),
        };

        fs::create_dir_all(target)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(&source)? {
            let entry = entry?;
            let name = entry.file_name();
            copy_tree(&entry.path(), &target.join(&name))?;
            names.push(name.to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.is_dir() {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else if meta.is_file() {
        fs::copy(src, dst)?;
    }
    // symlinks are not followed out of the repository
    Ok(())
}

/// Resolves and installs the allow-listed packages a script imports.
pub struct PackageResolver {
    allow: AllowList,
    native: NativeRepository,
    index: Arc<dyn PackageIndex>,
    cache: WheelCache,
}

impl std::fmt::Debug for PackageResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageResolver")
            .field("allowed", &self.allow.len())
            .field("native", &self.native)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl PackageResolver {
    pub fn new(
        allow: AllowList,
        native: NativeRepository,
        index: Arc<dyn PackageIndex>,
        cache: WheelCache,
    ) -> Self {
        Self {
            allow,
            native,
            index,
            cache,
        }
    }

    /// Resolver backed by the configured index, cache, and bundled packages.
    pub fn from_config(config: &SandboxConfig) -> Result<Self, PackageError> {
        Ok(Self::new(
            config.allowed_packages.clone(),
            NativeRepository::new(config.packages_dir.clone()),
            Arc::new(PypiIndex::new(&config.index_url)?),
            WheelCache::new(&config.cache_dir)?,
        ))
    }

    pub fn cache(&self) -> &WheelCache {
        &self.cache
    }

    /// Allow-listed packages imported by `code`, in import order.
    pub fn plan(&self, code: &str) -> Vec<PackageSpec> {
        scan_imports(code)
            .into_iter()
            .filter_map(|name| {
                let distribution = self.allow.distribution(&name)?.to_string();
                let is_native = self.native.has(&distribution);
                Some(PackageSpec {
                    name,
                    distribution,
                    is_native,
                })
            })
            .collect()
    }

    /// Install every allow-listed package `code` imports into the session.
    pub async fn install_packages(
        &self,
        code: &str,
        paths: &SessionPaths,
        installer: &dyn WheelInstaller,
    ) -> InstallOutcome {
        let mut outcome = InstallOutcome::new();
        let mut native = Vec::new();
        let mut wheels = Vec::new();

        for spec in self.plan(code) {
            if is_present(&paths.site_packages, &spec.name) {
                outcome.push(InstallAttempt {
                    package: spec.name.clone(),
                    strategy: InstallStrategy::Present,
                    success: true,
                    detail: String::new(),
                });
            } else if spec.is_native {
                native.push(spec);
            } else {
                wheels.push(spec);
            }
        }
        if native.is_empty() && wheels.is_empty() {
            return outcome;
        }
        debug!(
            native = native.len(),
            fallback = wheels.len(),
            "resolving packages"
        );

        let prepared = OnceCell::new();
        let ((native_outcome, retry), wheel_outcome) = tokio::join!(
            self.load_native(&native, paths),
            self.install_wheels(&wheels, paths, installer, &prepared),
        );
        outcome.extend(native_outcome);
        outcome.extend(wheel_outcome);

        if !retry.is_empty() {
            outcome.extend(
                self.install_wheels(&retry, paths, installer, &prepared)
                    .await,
            );
        }
        outcome
    }

    async fn load_native(
        &self,
        specs: &[PackageSpec],
        paths: &SessionPaths,
    ) -> (InstallOutcome, Vec<PackageSpec>) {
        let mut outcome = InstallOutcome::new();
        let mut retry = Vec::new();

        for spec in specs {
            let repo = self.native.clone();
            let dist = spec.distribution.clone();
            let target = paths.site_packages.clone();
            let result = tokio::task::spawn_blocking(move || repo.load(&dist, &target))
                .await
                .map_err(|e| PackageError::Io(std::io::Error::other(e)))
                .and_then(|r| r);

            match result {
                Ok(names) => {
                    METRICS.inc_packages_installed();
                    outcome.push(InstallAttempt {
                        package: spec.name.clone(),
                        strategy: InstallStrategy::Native,
                        success: true,
                        detail: names.join(", "),
                    });
                }
                Err(e) => {
                    warn!(package = %spec.name, error = %e, "native load failed");
                    outcome.push(InstallAttempt {
                        package: spec.name.clone(),
                        strategy: InstallStrategy::Native,
                        success: false,
                        detail: e.to_string(),
                    });
                    retry.push(spec.clone());
                }
            }
        }
        (outcome, retry)
    }

    async fn install_wheels(
        &self,
        specs: &[PackageSpec],
        paths: &SessionPaths,
        installer: &dyn WheelInstaller,
        prepared: &OnceCell<Result<(), String>>,
    ) -> InstallOutcome {
        let mut outcome = InstallOutcome::new();

        for spec in specs {
            let ready = prepared
                .get_or_init(|| async { installer.prepare().await.map_err(|e| e.to_string()) })
                .await;

            let result = match ready {
                Ok(()) => self.install_wheel(spec, paths, installer).await,
                Err(reason) => Err(PackageError::Install {
                    package: spec.name.clone(),
                    reason: format!("fallback installer unavailable: {reason}"),
                }),
            };

            let attempt = match result {
                Ok(filename) => {
                    METRICS.inc_packages_installed();
                    InstallAttempt {
                        package: spec.name.clone(),
                        strategy: InstallStrategy::Fallback,
                        success: true,
                        detail: filename,
                    }
                }
                Err(e) => {
                    METRICS.inc_package_failures();
                    warn!(package = %spec.name, error = %e, "wheel install failed");
                    InstallAttempt {
                        package: spec.name.clone(),
                        strategy: InstallStrategy::Fallback,
                        success: false,
                        detail: e.to_string(),
                    }
                }
            };
            outcome.push(attempt);
        }
        outcome
    }

    async fn install_wheel(
        &self,
        spec: &PackageSpec,
        paths: &SessionPaths,
        installer: &dyn WheelInstaller,
    ) -> Result<String, PackageError> {
        let release = self.index.latest_wheel(&spec.distribution).await?;
        let (cached, hit) = self.cache.fetch(self.index.as_ref(), &release).await?;
        debug!(package = %spec.name, wheel = %release.filename, cache_hit = hit, "wheel ready");

        tokio::fs::create_dir_all(&paths.wheels).await?;
        let staged = paths.wheels.join(&release.filename);
        tokio::fs::copy(&cached, &staged).await?;

        let guest_path = format!("{WHEELS_GUEST_DIR}/{}", release.filename);
        let installed = installer.install(&spec.name, &guest_path).await;
        // the cache keeps the original; the staged copy is only for this install
        if let Err(e) = tokio::fs::remove_file(&staged).await {
            warn!(wheel = %staged.display(), error = %e, "staged wheel not removed");
        }
        installed?;
        Ok(release.filename)
    }
}

fn is_present(site_packages: &Path, name: &str) -> bool {
    site_packages.join(name).is_dir() || site_packages.join(format!("{name}.py")).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_repository_copies_tree() {
        let dir = tempfile::tempdir().unwrap();
        let repo_root = dir.path().join("repo");
        std::fs::create_dir_all(repo_root.join("six")).unwrap();
        std::fs::write(repo_root.join("six").join("six.py"), "X = 1\n").unwrap();
        std::fs::create_dir_all(repo_root.join("attrs").join("attr")).unwrap();
        std::fs::write(repo_root.join("attrs").join("attr").join("__init__.py"), "").unwrap();

        let repo = NativeRepository::new(Some(repo_root));
        assert!(repo.has("six") && repo.has("attrs"));
        assert!(!repo.has("numpy"));

        let target = dir.path().join("site");
        assert_eq!(repo.load("attrs", &target).unwrap(), vec!["attr"]);
        assert!(target.join("attr").join("__init__.py").is_file());
        assert!(matches!(
            repo.load("numpy", &target),
            Err(PackageError::NativeUnavailable(_))
        ));
    }

    #[test]
    fn test_no_repository_has_nothing() {
        assert!(!NativeRepository::default().has("numpy"));
    }

    #[test]
    fn test_is_present_checks_package_and_module() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bs4")).unwrap();
        std::fs::write(dir.path().join("six.py"), "").unwrap();
        assert!(is_present(dir.path(), "bs4"));
        assert!(is_present(dir.path(), "six"));
        assert!(!is_present(dir.path(), "yaml"));
    }
}
