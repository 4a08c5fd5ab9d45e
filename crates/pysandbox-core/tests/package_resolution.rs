//! Package resolution: native loads, wheel fallback, caching and partial failure.

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pysandbox_core::fakes::{RecordingInstaller, ScriptedGuest, StaticPackageIndex};
use pysandbox_core::packages::{NativeRepository, SessionPaths};
use pysandbox_core::{
    AllowList, InstallStrategy, PackageIndex, PackageResolver, SandboxError, WheelCache,
};
use tempfile::TempDir;

use common::Harness;

struct Fixture {
    dir: TempDir,
    index: Arc<StaticPackageIndex>,
    resolver: PackageResolver,
}

impl Fixture {
    /// `native` distributions are bundled; `index` serves the rest.
    fn new(native: &[&str], index: StaticPackageIndex) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        for dist in native {
            let pkg = repo.join(dist).join(dist.replace('-', "_"));
            std::fs::create_dir_all(&pkg).unwrap();
            std::fs::write(pkg.join("__init__.py"), "").unwrap();
        }
        let index = Arc::new(index);
        let resolver = PackageResolver::new(
            AllowList::default(),
            NativeRepository::new(Some(repo)),
            Arc::clone(&index) as Arc<dyn PackageIndex>,
            WheelCache::new(dir.path().join("cache")).unwrap(),
        );
        Self {
            dir,
            index,
            resolver,
        }
    }

    fn session(&self, name: &str) -> SessionPaths {
        let root = self.dir.path().join(name);
        std::fs::create_dir_all(root.join("site-packages")).unwrap();
        SessionPaths {
            site_packages: root.join("site-packages"),
            wheels: root.join("tmp").join("wheels"),
        }
    }
}

fn staged(paths: &SessionPaths, filename: &str) -> PathBuf {
    paths.wheels.join(filename)
}

#[tokio::test]
async fn test_native_and_fallback_packages_install_together() {
    let fx = Fixture::new(
        &["six"],
        StaticPackageIndex::new()
            .with_wheel("pyyaml", "6.0.1")
            .with_delay("pyyaml", Duration::from_millis(100)),
    );
    let paths = fx.session("s1");
    let installer = RecordingInstaller::new().with_staging(&paths.wheels);

    let outcome = fx
        .resolver
        .install_packages("import six\nimport yaml\n", &paths, &installer)
        .await;

    assert!(outcome.succeeded("six"));
    assert!(outcome.succeeded("yaml"));
    assert!(outcome.failed_packages().is_empty());
    let lines = outcome.lines();
    assert!(lines.contains(&"six: loaded natively".to_string()));
    assert!(lines.contains(&"yaml: installed pyyaml-6.0.1-py3-none-any.whl".to_string()));

    assert!(paths.site_packages.join("six").join("__init__.py").is_file());
    assert_eq!(
        installer.staged_at_install(),
        vec!["pyyaml-6.0.1-py3-none-any.whl"]
    );
    assert!(!staged(&paths, "pyyaml-6.0.1-py3-none-any.whl").exists());
    assert_eq!(
        installer.installs(),
        vec![(
            "yaml".to_string(),
            "/tmp/wheels/pyyaml-6.0.1-py3-none-any.whl".to_string()
        )]
    );
}

#[tokio::test]
async fn test_unlisted_imports_are_ignored() {
    let fx = Fixture::new(&[], StaticPackageIndex::new());
    let paths = fx.session("s1");
    let installer = RecordingInstaller::new();

    let outcome = fx
        .resolver
        .install_packages("import os\nimport requests\nfrom . import x\n", &paths, &installer)
        .await;

    assert!(outcome.is_empty());
    assert_eq!(installer.prepare_count(), 0);
    assert!(fx.index.downloads().is_empty());
}

#[tokio::test]
async fn test_one_failure_does_not_stop_the_rest() {
    let fx = Fixture::new(
        &[],
        StaticPackageIndex::new()
            .with_wheel("pyyaml", "6.0.1")
            .with_wheel("tabulate", "0.9.0"),
    );
    let paths = fx.session("s1");
    let installer = RecordingInstaller::new().failing("yaml");

    let outcome = fx
        .resolver
        .install_packages("import yaml\nimport tabulate\nimport pytz\n", &paths, &installer)
        .await;

    assert!(outcome.succeeded("tabulate"));
    // yaml fails in the installer, pytz has no published wheel
    assert_eq!(outcome.failed_packages(), vec!["yaml", "pytz"]);
    let lines = outcome.lines();
    assert!(lines
        .iter()
        .any(|l| l.starts_with("yaml: install failed:") && l.contains("BadZipFile")));
    assert!(lines
        .iter()
        .any(|l| l.starts_with("pytz: install failed:")));
}

#[tokio::test]
async fn test_failed_install_still_clears_staged_wheel() {
    let fx = Fixture::new(&[], StaticPackageIndex::new().with_wheel("pyyaml", "6.0.1"));
    let paths = fx.session("s1");
    let installer = RecordingInstaller::new()
        .with_staging(&paths.wheels)
        .failing("yaml");

    let outcome = fx
        .resolver
        .install_packages("import yaml\n", &paths, &installer)
        .await;

    assert_eq!(outcome.failed_packages(), vec!["yaml"]);
    assert_eq!(installer.staged_at_install().len(), 1);
    assert!(!staged(&paths, "pyyaml-6.0.1-py3-none-any.whl").exists());
    assert!(fx
        .resolver
        .cache()
        .lookup("pyyaml-6.0.1-py3-none-any.whl")
        .is_some());
}

#[tokio::test]
async fn test_installer_is_prepared_once_per_pass() {
    let fx = Fixture::new(
        &[],
        StaticPackageIndex::new()
            .with_wheel("pyyaml", "6.0.1")
            .with_wheel("tabulate", "0.9.0")
            .with_wheel("toolz", "0.12.1"),
    );
    let paths = fx.session("s1");
    let installer = RecordingInstaller::new();

    fx.resolver
        .install_packages("import yaml, tabulate, toolz\n", &paths, &installer)
        .await;

    assert_eq!(installer.prepare_count(), 1);
    assert_eq!(installer.installs().len(), 3);
}

#[tokio::test]
async fn test_unavailable_installer_fails_every_fallback() {
    let fx = Fixture::new(&["six"], StaticPackageIndex::new().with_wheel("pyyaml", "6.0.1"));
    let paths = fx.session("s1");
    let installer = RecordingInstaller::new().unavailable();

    let outcome = fx
        .resolver
        .install_packages("import six\nimport yaml\n", &paths, &installer)
        .await;

    assert!(outcome.succeeded("six"));
    assert_eq!(outcome.failed_packages(), vec!["yaml"]);
    assert!(installer.installs().is_empty());
}

#[tokio::test]
async fn test_wheel_cache_is_reused_across_sessions() {
    let fx = Fixture::new(&[], StaticPackageIndex::new().with_wheel("pyyaml", "6.0.1"));
    let installer = RecordingInstaller::new();

    for session in ["s1", "s2"] {
        let paths = fx.session(session);
        let outcome = fx
            .resolver
            .install_packages("import yaml\n", &paths, &installer)
            .await;
        assert!(outcome.succeeded("yaml"));
        assert!(!staged(&paths, "pyyaml-6.0.1-py3-none-any.whl").exists());
    }

    assert_eq!(fx.index.downloads(), vec!["pyyaml-6.0.1-py3-none-any.whl"]);
    assert!(fx
        .resolver
        .cache()
        .lookup("pyyaml-6.0.1-py3-none-any.whl")
        .is_some());
}

#[tokio::test]
async fn test_already_present_packages_are_skipped() {
    let fx = Fixture::new(&[], StaticPackageIndex::new().with_wheel("pyyaml", "6.0.1"));
    let paths = fx.session("s1");
    std::fs::create_dir_all(paths.site_packages.join("yaml")).unwrap();
    let installer = RecordingInstaller::new();

    let outcome = fx
        .resolver
        .install_packages("import yaml\n", &paths, &installer)
        .await;

    assert_eq!(outcome.attempts().len(), 1);
    assert_eq!(outcome.attempts()[0].strategy, InstallStrategy::Present);
    assert_eq!(outcome.lines(), vec!["yaml: already installed"]);
    assert!(fx.index.downloads().is_empty());
}

#[tokio::test]
async fn test_failed_native_load_retries_through_wheels() {
    let fx = Fixture::new(&["six"], StaticPackageIndex::new().with_wheel("six", "1.16.0"));
    let mut paths = fx.session("s1");
    // a file where the directory should be makes the native copy fail
    let blocked = fx.dir.path().join("blocked");
    std::fs::write(&blocked, "").unwrap();
    paths.site_packages = blocked.join("site-packages");
    let installer = RecordingInstaller::new();

    let outcome = fx
        .resolver
        .install_packages("import six\n", &paths, &installer)
        .await;

    let strategies: Vec<_> = outcome
        .attempts()
        .iter()
        .map(|a| (a.strategy, a.success))
        .collect();
    assert_eq!(
        strategies,
        vec![
            (InstallStrategy::Native, false),
            (InstallStrategy::Fallback, true)
        ]
    );
    assert!(outcome.succeeded("six"));
    assert!(outcome.lines()[0].contains("trying wheel fallback"));
}

// -------------------------------------------------------------------------
// Through a session runtime
// -------------------------------------------------------------------------

fn runtime_harness() -> Harness {
    Harness::build(
        ScriptedGuest::returning("2"),
        StaticPackageIndex::new().with_wheel("six", "1.16.0"),
        None,
        |c| c,
    )
}

#[tokio::test]
async fn test_runtime_installs_through_guest_installer() {
    let h = runtime_harness();
    let runtime = h.registry.get_initialized("s1").await.unwrap();

    let outcome = runtime.install_package("six").await.unwrap();
    assert!(outcome.succeeded("six"));
    assert_eq!(h.guest.count("install"), 1);

    let install = h
        .guest
        .invocations()
        .into_iter()
        .find(|i| i.request.mode() == "install")
        .unwrap();
    let runtime_dir = install
        .preopens
        .iter()
        .find(|p| p.guest == "/.runtime")
        .unwrap();
    assert!(runtime_dir.host.join("_sandbox_installer.py").is_file());

    // the guest unpacked it, so the next pass finds it in place
    let again = runtime.install_packages("import six\n").await.unwrap();
    assert_eq!(again.lines(), vec!["six: already installed"]);
    assert_eq!(h.guest.count("install"), 1);
}

#[tokio::test]
async fn test_runtime_refuses_unlisted_package() {
    let h = runtime_harness();
    let runtime = h.registry.get_initialized("s1").await.unwrap();

    let err = runtime.install_package("requests").await.unwrap_err();
    assert!(matches!(err, SandboxError::PackageResolution { .. }));
    assert_eq!(h.guest.count("install"), 0);
}

#[tokio::test]
async fn test_worker_attaches_install_log() {
    let h = runtime_harness();
    let executor = pysandbox_core::WorkerExecutor::new(h.registry.clone());

    let result = executor.run_code("s1", "import six\nsix.PY3", 5_000).await;
    assert!(result.success);
    assert_eq!(
        result.install_log,
        vec!["six: installed six-1.16.0-py3-none-any.whl"]
    );
}

#[test]
fn test_fixture_paths_are_isolated() {
    let fx = Fixture::new(&[], StaticPackageIndex::new());
    let a = fx.session("a");
    let b = fx.session("b");
    assert_ne!(a.site_packages, b.site_packages);
    assert!(Path::new(&a.site_packages).starts_with(fx.dir.path()));
}
