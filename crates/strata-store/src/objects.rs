use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use std::fs;
use std::io::Write;
use strata_schema::ObjectHash;
use tempfile::NamedTempFile;

/// Content-addressable blob store for layer archives.
///
/// Blobs are stored as files named by their blake3 hash. Writes are atomic
/// via `NamedTempFile`, and reads verify integrity by recomputing the hash.
pub struct ObjectStore {
    layout: StoreLayout,
}

impl ObjectStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn hash_of(data: &[u8]) -> ObjectHash {
        ObjectHash::new(blake3::hash(data).to_hex().to_string())
    }

    /// Store data and return its hash. Existing objects are left untouched.
    pub fn put(&self, data: &[u8]) -> Result<ObjectHash, StoreError> {
        let hash = Self::hash_of(data);
        let dest = self.layout.objects_dir().join(hash.as_str());

        if dest.exists() {
            return Ok(hash);
        }

        let dir = self.layout.objects_dir();
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        // Racing writers of the same hash write identical bytes; either may win.
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;

        Ok(hash)
    }

    /// Retrieve data by hash, verifying integrity on read.
    pub fn get(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.layout.objects_dir().join(hash);
        if !path.exists() {
            return Err(StoreError::ObjectNotFound(hash.to_owned()));
        }
        let data = fs::read(&path)?;

        let actual = blake3::hash(&data).to_hex();
        if actual.as_str() != hash {
            return Err(StoreError::IntegrityFailure {
                hash: hash.to_owned(),
                expected: hash.to_owned(),
                actual: actual.to_string(),
            });
        }

        Ok(data)
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.layout.objects_dir().join(hash).exists()
    }

    pub fn size(&self, hash: &str) -> Result<u64, StoreError> {
        let path = self.layout.objects_dir().join(hash);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::ObjectNotFound(hash.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn remove(&self, hash: &str) -> Result<(), StoreError> {
        let path = self.layout.objects_dir().join(hash);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<ObjectHash>, StoreError> {
        let dir = self.layout.objects_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut hashes = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    hashes.push(ObjectHash::new(name));
                }
            }
        }
        hashes.sort();
        Ok(hashes)
    }
}
