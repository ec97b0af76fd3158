use crate::cache::LayerCache;
use crate::layers::{Layer, LayerSource};
use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use strata_schema::{image_digest, ImageDigest, LayerId, ManifestHash};
use tempfile::NamedTempFile;

/// One entry in an image's lineage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageLayer {
    pub layer_id: LayerId,
    pub parent: Option<LayerId>,
    /// Manifest that produced the layer; `None` for the base.
    pub manifest_hash: Option<ManifestHash>,
    pub size: u64,
}

impl From<&Layer> for ImageLayer {
    fn from(layer: &Layer) -> Self {
        Self {
            layer_id: layer.id.clone(),
            parent: layer.parent.clone(),
            manifest_hash: layer.manifest_hash().cloned(),
            size: layer.size,
        }
    }
}

/// An assembled environment: a base layer followed by one layer per manifest.
///
/// Holds no wall-clock data, so equal inputs serialize to identical bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Image {
    pub digest: ImageDigest,
    pub base_ref: String,
    pub layers: Vec<ImageLayer>,
}

impl Image {
    pub fn layer_ids(&self) -> impl Iterator<Item = &LayerId> {
        self.layers.iter().map(|l| &l.layer_id)
    }

    pub fn top_layer(&self) -> Option<&LayerId> {
        self.layers.last().map(|l| &l.layer_id)
    }

    pub fn total_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Walk the chain from the top layer down through `cache` and check it
    /// matches this image exactly, ending at the declared base.
    pub fn verify_lineage(&self, cache: &dyn LayerCache) -> Result<(), StoreError> {
        let broken = |layer: &str, reason: String| StoreError::BrokenChain {
            layer: layer.to_owned(),
            reason,
        };
        let top = self
            .top_layer()
            .ok_or_else(|| broken(&self.digest, "image has no layers".to_owned()))?;

        let expected = image_digest(&self.base_ref, self.layer_ids());
        if expected != self.digest {
            return Err(broken(
                &self.digest,
                format!("digest does not match layers (expected {expected})"),
            ));
        }

        let chain = cache.chain(top)?;
        if chain.len() != self.layers.len() {
            return Err(broken(
                top,
                format!(
                    "cache chain has {} layers, image declares {}",
                    chain.len(),
                    self.layers.len()
                ),
            ));
        }
        match chain.first().map(|l| &l.source) {
            Some(LayerSource::Base { reference }) if *reference == self.base_ref => {}
            _ => {
                return Err(broken(
                    top,
                    format!("chain does not end at base '{}'", self.base_ref),
                ))
            }
        }
        for (declared, cached) in self.layers.iter().zip(&chain) {
            if *declared != ImageLayer::from(cached) {
                return Err(broken(
                    &declared.layer_id,
                    "image entry disagrees with cached layer".to_owned(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImageRecord {
    #[serde(flatten)]
    image: Image,
    recorded_at: String,
    /// blake3 over the record with this field unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<String>,
}

impl ImageRecord {
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

/// Registry of assembled images, keyed by digest.
pub struct ImageStore {
    layout: StoreLayout,
}

impl ImageStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    /// Record `image`. Re-recording an existing digest keeps the first record.
    pub fn put(&self, image: &Image) -> Result<(), StoreError> {
        let dir = self.layout.images_dir();
        let dest = dir.join(image.digest.as_str());
        if dest.exists() {
            return Ok(());
        }

        let mut record = ImageRecord {
            image: image.clone(),
            recorded_at: chrono::Utc::now().to_rfc3339(),
            checksum: None,
        };
        record.checksum = Some(record.compute_checksum()?);
        let content = serde_json::to_string_pretty(&record)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        if let Err(e) = tmp.persist_noclobber(&dest) {
            if e.error.kind() != std::io::ErrorKind::AlreadyExists {
                return Err(StoreError::Io(e.error));
            }
        }
        fsync_dir(&dir)?;
        Ok(())
    }

    pub fn get(&self, digest: &str) -> Result<Image, StoreError> {
        self.get_record(digest).map(|r| r.image)
    }

    /// When `digest` was first recorded, as RFC 3339.
    pub fn recorded_at(&self, digest: &str) -> Result<String, StoreError> {
        self.get_record(digest).map(|r| r.recorded_at)
    }

    fn get_record(&self, digest: &str) -> Result<ImageRecord, StoreError> {
        let path = self.layout.images_dir().join(digest);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ImageNotFound(digest.to_owned()))
            }
            Err(e) => return Err(e.into()),
        };
        let record: ImageRecord = serde_json::from_str(&content)?;
        if let Some(ref expected) = record.checksum {
            let actual = record.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    hash: digest.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(record)
    }

    pub fn exists(&self, digest: &str) -> bool {
        !digest.is_empty() && self.layout.images_dir().join(digest).is_file()
    }

    pub fn remove(&self, digest: &str) -> Result<(), StoreError> {
        let path = self.layout.images_dir().join(digest);
        if path.is_file() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Resolve a full digest or a unique prefix of one.
    pub fn resolve(&self, prefix: &str) -> Result<Image, StoreError> {
        if !prefix.is_empty() && self.exists(prefix) {
            return self.get(prefix);
        }
        let matches: Vec<String> = self
            .digests()?
            .into_iter()
            .filter(|d| d.starts_with(prefix))
            .collect();
        match matches.as_slice() {
            [] => Err(StoreError::ImageNotFound(prefix.to_owned())),
            [only] => self.get(only),
            many => Err(StoreError::AmbiguousImage {
                prefix: prefix.to_owned(),
                count: many.len(),
            }),
        }
    }

    fn digests(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.layout.images_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn list(&self) -> Result<Vec<Image>, StoreError> {
        let mut results = Vec::new();
        for entry in self.list_with_errors()? {
            match entry {
                Ok(image) => results.push(image),
                Err((digest, e)) => {
                    tracing::warn!("skipping corrupted image record '{digest}': {e}");
                }
            }
        }
        Ok(results)
    }

    /// Like `list()`, but returns per-entry `Result`s so callers can surface
    /// individual corruption errors.
    #[allow(clippy::type_complexity)]
    pub fn list_with_errors(&self) -> Result<Vec<Result<Image, (String, StoreError)>>, StoreError> {
        Ok(self
            .digests()?
            .into_iter()
            .map(|d| self.get(&d).map_err(|e| (d, e)))
            .collect())
    }
}
