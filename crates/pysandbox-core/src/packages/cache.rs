//! Wheel cache: downloaded wheels kept on disk under their filenames.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{PackageError, PackageIndex, WheelRelease};

/// Flat on-disk wheel cache shared by every session.
///
/// Layout: `<root>/<wheel filename>`. Entries are never rewritten once present;
/// concurrent writers of the same filename each stage their own temp file and
/// the last rename wins, so a race costs a redundant download but never a
/// torn file.
#[derive(Debug, Clone)]
pub struct WheelCache {
    root: PathBuf,
}

impl WheelCache {
    /// Create a cache rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, PackageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a wheel with `filename` is stored at.
    pub fn path_for(&self, filename: &str) -> Result<PathBuf, PackageError> {
        let valid = filename.ends_with(".whl")
            && !filename.starts_with('.')
            && !filename.contains(['/', '\\', '\0'])
            && !filename.contains("..");
        if !valid {
            return Err(PackageError::InvalidFilename(filename.to_string()));
        }
        Ok(self.root.join(filename))
    }

    /// Cached path for `filename`, if present.
    pub fn lookup(&self, filename: &str) -> Option<PathBuf> {
        self.path_for(filename).ok().filter(|p| p.is_file())
    }

    /// Store `data` under `filename`, verifying `sha256` when given.
    pub fn store(
        &self,
        filename: &str,
        data: &[u8],
        sha256: Option<&str>,
    ) -> Result<PathBuf, PackageError> {
        let path = self.path_for(filename)?;

        if let Some(expected) = sha256 {
            let actual = hex::encode(Sha256::digest(data));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(PackageError::DigestMismatch {
                    file: filename.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        // Atomic write: temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| e.error)?;

        Ok(path)
    }

    /// Return the cached wheel for `release`, downloading it on a miss.
    ///
    /// The boolean is `true` when the file came from the cache.
    pub async fn fetch(
        &self,
        index: &dyn PackageIndex,
        release: &WheelRelease,
    ) -> Result<(PathBuf, bool), PackageError> {
        if let Some(path) = self.lookup(&release.filename) {
            debug!(wheel = %release.filename, "wheel cache hit");
            return Ok((path, true));
        }

        let data = index.download(release).await?;
        let cache = self.clone();
        let filename = release.filename.clone();
        let sha256 = release.sha256.clone();
        let path = tokio::task::spawn_blocking(move || {
            cache.store(&filename, &data, sha256.as_deref())
        })
        .await
        .map_err(|e| PackageError::Io(std::io::Error::other(e)))??;

        info!(wheel = %release.filename, "wheel downloaded into cache");
        Ok((path, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cache() -> (tempfile::TempDir, WheelCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = WheelCache::new(dir.path().join("cache")).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_store_and_lookup() {
        let (_dir, cache) = make_cache();
        assert!(cache.lookup("six-1.0-py3-none-any.whl").is_none());

        let path = cache
            .store("six-1.0-py3-none-any.whl", b"PK", None)
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"PK");
        assert_eq!(cache.lookup("six-1.0-py3-none-any.whl"), Some(path));
    }

    #[test]
    fn test_layout_is_flat() {
        let (_dir, cache) = make_cache();
        let path = cache.store("a-1-py3-none-any.whl", b"x", None).unwrap();
        assert_eq!(path.parent().unwrap(), cache.root());
        let entries: Vec<_> = std::fs::read_dir(cache.root()).unwrap().collect();
        assert_eq!(entries.len(), 1, "temp file must not linger");
    }

    #[test]
    fn test_digest_is_verified() {
        let (_dir, cache) = make_cache();
        let good = hex::encode(Sha256::digest(b"wheel"));
        assert!(cache.store("w-1-py3-none-any.whl", b"wheel", Some(&good)).is_ok());

        let err = cache
            .store("v-1-py3-none-any.whl", b"wheel", Some("00"))
            .unwrap_err();
        assert!(matches!(err, PackageError::DigestMismatch { .. }));
        assert!(cache.lookup("v-1-py3-none-any.whl").is_none());
    }

    #[test]
    fn test_rejects_path_like_filenames() {
        let (_dir, cache) = make_cache();
        for bad in ["../x.whl", "a/b.whl", ".hidden.whl", "x.tar.gz", "a\\b.whl"] {
            assert!(
                matches!(cache.path_for(bad), Err(PackageError::InvalidFilename(_))),
                "{bad} should be rejected"
            );
        }
    }
}
