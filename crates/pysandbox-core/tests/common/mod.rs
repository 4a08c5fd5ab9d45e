//! Shared wiring for integration tests: a registry over the in-memory fakes.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use pysandbox_core::fakes::{ScriptedGuest, StaticPackageIndex};
use pysandbox_core::packages::NativeRepository;
use pysandbox_core::{
    AllowList, GuestEngine, PackageIndex, PackageResolver, SandboxConfig, SandboxContext,
    SessionRegistry, WheelCache,
};
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub guest: Arc<ScriptedGuest>,
    pub index: Arc<StaticPackageIndex>,
    pub registry: Arc<SessionRegistry>,
}

impl Harness {
    pub fn new(guest: ScriptedGuest) -> Self {
        Self::build(guest, StaticPackageIndex::new(), None, |c| c)
    }

    pub fn build(
        guest: ScriptedGuest,
        index: StaticPackageIndex,
        native: Option<PathBuf>,
        tweak: impl FnOnce(SandboxConfig) -> SandboxConfig,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = tweak(config_in(dir.path()));
        let guest = Arc::new(guest);
        let index = Arc::new(index);

        let resolver = PackageResolver::new(
            AllowList::default(),
            NativeRepository::new(native),
            Arc::clone(&index) as Arc<dyn PackageIndex>,
            WheelCache::new(&config.cache_dir).unwrap(),
        );
        let context = SandboxContext::new(
            config,
            Arc::clone(&guest) as Arc<dyn GuestEngine>,
            Arc::new(resolver),
        );
        Self {
            dir,
            guest,
            index,
            registry: Arc::new(SessionRegistry::new(context)),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }
}

/// Config rooted in `dir` with everything else at defaults.
pub fn config_in(dir: &Path) -> SandboxConfig {
    SandboxConfig {
        cache_dir: dir.join("cache"),
        data_dir: dir.join("data"),
        ..SandboxConfig::default()
    }
}
