//! On-disk artifact storage
//!
//! Artifacts live at `root/<package>/<version>/<package>-<version>.crate`
//! with a JSON sidecar (`.meta` suffix) carrying the checksum, byte length
//! and fetch timestamp. Writes go through a temp file plus rename so a
//! reader never observes a half-written entry.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::error::StoreError;
use crate::checksum::sha256_hex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub package: String,
    pub version: String,
}

impl ArtifactKey {
    pub fn new(package: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.package, self.version)
    }
}

/// Sidecar metadata persisted next to each artifact file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactMeta {
    checksum: String,
    size: u64,
    fetched_at: i64,
}

/// One cached artifact, as visible to callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactEntry {
    pub package: String,
    pub version: String,
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
    pub fetched_at: i64,
}

impl ArtifactEntry {
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey::new(self.package.clone(), self.version.clone())
    }

    /// An entry is fresh while its age does not exceed the TTL.
    pub fn is_fresh(&self, ttl_ms: i64, now_ms: i64) -> bool {
        now_ms - self.fetched_at <= ttl_ms
    }
}

const META_SUFFIX: &str = ".meta";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!("artifact store rooted at {:?}", root);
        Ok(Self { root })
    }

    /// Reject key components that would escape the storage subtree.
    fn validate_component(component: &str) -> Result<(), StoreError> {
        if component.is_empty()
            || component == "."
            || component == ".."
            || component.contains('/')
            || component.contains('\\')
        {
            return Err(StoreError::InvalidKey(component.to_string()));
        }
        Ok(())
    }

    fn file_name(package: &str, version: &str) -> String {
        format!("{package}-{version}.crate")
    }

    fn artifact_path(&self, package: &str, version: &str) -> Result<PathBuf, StoreError> {
        Self::validate_component(package)?;
        Self::validate_component(version)?;
        Ok(self
            .root
            .join(package)
            .join(version)
            .join(Self::file_name(package, version)))
    }

    fn meta_path(artifact_path: &Path) -> PathBuf {
        let mut name = artifact_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(META_SUFFIX);
        artifact_path.with_file_name(name)
    }

    /// Look up the entry for (package, version). Reading never mutates the
    /// stored timestamp, so repeated lookups are idempotent.
    pub fn get(&self, package: &str, version: &str) -> Result<Option<ArtifactEntry>, StoreError> {
        let path = self.artifact_path(package, version)?;
        let meta_path = Self::meta_path(&path);

        if !meta_path.exists() || !path.exists() {
            return Ok(None);
        }

        let meta: ArtifactMeta = serde_json::from_slice(&fs::read(&meta_path)?)?;

        Ok(Some(ArtifactEntry {
            package: package.to_string(),
            version: version.to_string(),
            path,
            size: meta.size,
            checksum: meta.checksum,
            fetched_at: meta.fetched_at,
        }))
    }

    /// Read the artifact bytes for an entry.
    pub fn read_bytes(&self, entry: &ArtifactEntry) -> Result<Vec<u8>, StoreError> {
        Ok(fs::read(&entry.path)?)
    }

    /// Recompute the on-disk digest and compare against the recorded
    /// checksum. A mismatch means the entry is corrupt and must be
    /// treated as a miss.
    pub fn verify(&self, entry: &ArtifactEntry) -> Result<bool, StoreError> {
        let bytes = fs::read(&entry.path)?;
        Ok(sha256_hex(&bytes) == entry.checksum)
    }

    /// Write an artifact, replacing any prior entry for the same key.
    ///
    /// The artifact and its sidecar are each written to a temp file and
    /// renamed into place. Concurrent puts for the same key must be
    /// serialized by the caller.
    pub fn put(
        &self,
        package: &str,
        version: &str,
        bytes: &[u8],
        checksum: &str,
        now_ms: i64,
    ) -> Result<ArtifactEntry, StoreError> {
        let path = self.artifact_path(package, version)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension(format!("crate{TMP_SUFFIX}"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;

        let meta = ArtifactMeta {
            checksum: checksum.to_string(),
            size: bytes.len() as u64,
            fetched_at: now_ms,
        };
        let meta_path = Self::meta_path(&path);
        let meta_tmp = meta_path.with_extension(format!("meta{TMP_SUFFIX}"));
        fs::write(&meta_tmp, serde_json::to_vec(&meta)?)?;
        fs::rename(&meta_tmp, &meta_path)?;

        debug!("stored {}@{} ({} bytes)", package, version, bytes.len());

        Ok(ArtifactEntry {
            package: package.to_string(),
            version: version.to_string(),
            path,
            size: meta.size,
            checksum: meta.checksum,
            fetched_at: meta.fetched_at,
        })
    }

    /// Remove the entry and any directories left empty by the removal.
    /// The sidecar goes first so readers see the key disappear atomically.
    pub fn delete(&self, package: &str, version: &str) -> Result<(), StoreError> {
        let path = self.artifact_path(package, version)?;
        let meta_path = Self::meta_path(&path);

        if meta_path.exists() {
            fs::remove_file(&meta_path)?;
        }
        if path.exists() {
            fs::remove_file(&path)?;
        }

        // Prune the version directory, then the package directory
        if let Some(version_dir) = path.parent() {
            Self::remove_if_empty(version_dir)?;
            if let Some(package_dir) = version_dir.parent() {
                if package_dir != self.root {
                    Self::remove_if_empty(package_dir)?;
                }
            }
        }

        Ok(())
    }

    fn remove_if_empty(dir: &Path) -> Result<(), StoreError> {
        if dir.exists() && fs::read_dir(dir)?.next().is_none() {
            fs::remove_dir(dir)?;
        }
        Ok(())
    }

    /// True if any entry exists for the package.
    pub fn has_entries(&self, package: &str) -> Result<bool, StoreError> {
        Self::validate_component(package)?;
        let package_dir = self.root.join(package);
        if !package_dir.exists() {
            return Ok(false);
        }
        for version_dir in fs::read_dir(&package_dir)? {
            let version_dir = version_dir?.path();
            if version_dir.is_dir() && fs::read_dir(&version_dir)?.next().is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Enumerate every entry in the store.
    pub fn list(&self) -> Result<Vec<ArtifactEntry>, StoreError> {
        let mut entries = Vec::new();

        for package_dir in fs::read_dir(&self.root)? {
            let package_dir = package_dir?.path();
            if !package_dir.is_dir() {
                continue;
            }
            let Some(package) = package_dir.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };

            for version_dir in fs::read_dir(&package_dir)? {
                let version_dir = version_dir?.path();
                if !version_dir.is_dir() {
                    continue;
                }
                let Some(version) =
                    version_dir.file_name().map(|n| n.to_string_lossy().into_owned())
                else {
                    continue;
                };

                match self.get(&package, &version) {
                    Ok(Some(entry)) => entries.push(entry),
                    Ok(None) => {}
                    Err(e) => warn!("skipping unreadable entry {}@{}: {}", package, version, e),
                }
            }
        }

        Ok(entries)
    }
}
