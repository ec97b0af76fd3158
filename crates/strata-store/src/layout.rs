use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout for the strata layer cache.
///
/// Manages paths for layer archives (objects), layer records, step-key
/// bindings, access times, image records, and overlay staging. All
/// subdirectories are created lazily on [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    #[inline]
    pub fn objects_dir(&self) -> PathBuf {
        self.store_dir().join("objects")
    }

    #[inline]
    pub fn layers_dir(&self) -> PathBuf {
        self.store_dir().join("layers")
    }

    /// Step-key bindings: one file per step id holding the bound layer id.
    #[inline]
    pub fn index_dir(&self) -> PathBuf {
        self.store_dir().join("index")
    }

    /// Last-lookup timestamps used for LRU eviction.
    #[inline]
    pub fn access_dir(&self) -> PathBuf {
        self.store_dir().join("access")
    }

    #[inline]
    pub fn images_dir(&self) -> PathBuf {
        self.store_dir().join("images")
    }

    /// Disposable overlays for in-flight build steps.
    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.store_dir().join("staging")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.store_dir().join(".lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.objects_dir())?;
        fs::create_dir_all(self.layers_dir())?;
        fs::create_dir_all(self.index_dir())?;
        fs::create_dir_all(self.access_dir())?;
        fs::create_dir_all(self.images_dir())?;
        fs::create_dir_all(self.staging_dir())?;

        let version_path = self.store_dir().join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let store_dir = self.store_dir();
            let mut tmp = NamedTempFile::new_in(&store_dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            // Concurrent initializers race here; any winner writes the same content.
            if let Err(e) = tmp.persist_noclobber(&version_path) {
                if e.error.kind() != std::io::ErrorKind::AlreadyExists {
                    return Err(StoreError::Io(e.error));
                }
            }
            crate::fsync_dir(&store_dir)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.store_dir().join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
