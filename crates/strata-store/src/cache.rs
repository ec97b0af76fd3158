use crate::layers::Layer;
use crate::layout::StoreLayout;
use crate::objects::ObjectStore;
use crate::{fsync_dir, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use strata_schema::{base_step_id, step_id, LayerId, ManifestHash, StepId};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// What a cached layer is looked up by.
///
/// A key is a pure function of the build inputs upstream of a step, so two
/// builds that agree on everything up to a step agree on its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Base {
        reference: String,
    },
    Step {
        parent: LayerId,
        manifest: ManifestHash,
    },
}

impl CacheKey {
    pub fn base(reference: impl Into<String>) -> Self {
        Self::Base {
            reference: reference.into(),
        }
    }

    pub fn step(parent: LayerId, manifest: ManifestHash) -> Self {
        Self::Step { parent, manifest }
    }

    pub fn step_id(&self) -> StepId {
        match self {
            Self::Base { reference } => base_step_id(reference),
            Self::Step { parent, manifest } => step_id(parent, manifest),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base { reference } => write!(f, "base:{reference}"),
            Self::Step { parent, manifest } => {
                write!(f, "step:{}+{}", parent.short(), manifest.short())
            }
        }
    }
}

/// A cached layer together with its last-lookup time.
///
/// `last_used` is monotonic within one cache; the disk cache uses Unix
/// milliseconds, the memory cache a logical clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub layer: Layer,
    pub last_used: i64,
}

/// Content-addressed store of immutable layers keyed by build step.
pub trait LayerCache: Send + Sync {
    /// Find the layer bound to `key`, marking it as recently used.
    fn lookup(&self, key: &CacheKey) -> Result<Option<Layer>, StoreError>;

    /// Bind `key` to `layer` with archive `content`.
    ///
    /// If the key is already bound, the existing layer is returned unchanged
    /// and the new one is discarded.
    fn store(&self, key: &CacheKey, layer: Layer, content: &[u8]) -> Result<Layer, StoreError>;

    fn get(&self, id: &LayerId) -> Result<Layer, StoreError>;

    /// Archive bytes of a layer, verified against its recorded hash.
    fn content(&self, id: &LayerId) -> Result<Vec<u8>, StoreError>;

    fn entries(&self) -> Result<Vec<CacheEntry>, StoreError>;

    /// Drop a layer and its key binding. Callers keep lineage intact.
    fn remove(&self, id: &LayerId) -> Result<(), StoreError>;

    /// Layers from the base up to and including `id`.
    fn chain(&self, id: &LayerId) -> Result<Vec<Layer>, StoreError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(id.clone());
        while let Some(current) = next {
            if !seen.insert(current.clone()) {
                return Err(StoreError::BrokenChain {
                    layer: current.to_string(),
                    reason: "parent links form a cycle".to_owned(),
                });
            }
            let layer = match self.get(&current) {
                Ok(layer) => layer,
                Err(StoreError::LayerNotFound(_)) => {
                    return Err(StoreError::BrokenChain {
                        layer: current.to_string(),
                        reason: "layer is missing from the cache".to_owned(),
                    })
                }
                Err(e) => return Err(e),
            };
            next = layer.parent.clone();
            chain.push(layer);
        }
        chain.reverse();
        Ok(chain)
    }
}

/// Checks shared by every cache implementation before a layer is bound.
pub(crate) fn validate_for_key(
    key: &CacheKey,
    layer: &Layer,
    content: &[u8],
) -> Result<(), StoreError> {
    layer.validate()?;
    layer.verify_content(content)?;
    let expected = key.step_id();
    if layer.step_id != expected {
        return Err(StoreError::KeyMismatch {
            layer: layer.id.to_string(),
            expected: expected.to_string(),
            found: layer.step_id.to_string(),
        });
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct LayerRecord {
    #[serde(flatten)]
    layer: Layer,
    checksum: String,
}

fn record_checksum(layer: &Layer) -> Result<String, StoreError> {
    let json = serde_json::to_string_pretty(layer)?;
    Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
}

/// Write `bytes` to `dest` atomically.
///
/// With `clobber == false` the write fails with `AlreadyExists` if `dest` is
/// already present, which makes the first writer the only winner.
fn write_atomic(dir: &Path, dest: &Path, bytes: &[u8], clobber: bool) -> std::io::Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    if clobber {
        tmp.persist(dest).map_err(|e| e.error)?;
    } else {
        tmp.persist_noclobber(dest).map_err(|e| e.error)?;
    }
    fsync_dir(dir)
}

/// On-disk layer cache shared between processes.
///
/// Layer records live under `layers/`, archives in the object store, and
/// step-key bindings under `index/`, one file per step id holding the bound
/// layer id. Bindings are created with a no-clobber rename, so concurrent
/// stores of one key converge on whichever binding landed first.
pub struct DiskLayerCache {
    layout: StoreLayout,
    objects: ObjectStore,
}

impl DiskLayerCache {
    /// Open the cache at `layout`, creating the directory tree if needed.
    pub fn open(layout: StoreLayout) -> Result<Self, StoreError> {
        layout.initialize()?;
        Ok(Self {
            objects: ObjectStore::new(layout.clone()),
            layout,
        })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    /// Layer id bound to `step`, if any.
    pub fn binding(&self, step: &StepId) -> Result<Option<LayerId>, StoreError> {
        let path = self.layout.index_dir().join(step.as_str());
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(LayerId::new(s.trim()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All bindings as `(step id, layer id)` pairs, sorted by step id.
    pub fn bindings(&self) -> Result<Vec<(StepId, LayerId)>, StoreError> {
        let mut out = Vec::new();
        for name in list_names(&self.layout.index_dir())? {
            let step = StepId::new(name);
            if let Some(id) = self.binding(&step)? {
                out.push((step, id));
            }
        }
        Ok(out)
    }

    /// Ids of every layer record, sorted.
    pub fn layer_ids(&self) -> Result<Vec<LayerId>, StoreError> {
        Ok(list_names(&self.layout.layers_dir())?
            .into_iter()
            .map(LayerId::new)
            .collect())
    }

    pub fn contains(&self, id: &LayerId) -> bool {
        self.layout.layers_dir().join(id.as_str()).exists()
    }

    fn put_record(&self, layer: &Layer) -> Result<(), StoreError> {
        let record = LayerRecord {
            checksum: record_checksum(layer)?,
            layer: layer.clone(),
        };
        let content = serde_json::to_string_pretty(&record)?;
        let dir = self.layout.layers_dir();
        let dest = dir.join(layer.id.as_str());
        match write_atomic(&dir, &dest, content.as_bytes(), false) {
            Ok(()) => Ok(()),
            // Same id means same step and same content; the existing record stands.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn touch(&self, id: &LayerId) {
        let dir = self.layout.access_dir();
        let now = chrono::Utc::now().timestamp_millis().to_string();
        if let Err(e) = write_atomic(&dir, &dir.join(id.as_str()), now.as_bytes(), true) {
            warn!("failed to record access time for layer {}: {e}", id.short());
        }
    }

    fn last_used(&self, layer: &Layer) -> i64 {
        let path = self.layout.access_dir().join(layer.id.as_str());
        fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .or_else(|| {
                chrono::DateTime::parse_from_rfc3339(&layer.created_at)
                    .ok()
                    .map(|t| t.timestamp_millis())
            })
            .unwrap_or(0)
    }

    fn remove_file_if_exists(path: &Path) -> Result<(), StoreError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn object_referenced(&self, tar_hash: &str, except: &LayerId) -> Result<bool, StoreError> {
        for id in self.layer_ids()? {
            if &id == except {
                continue;
            }
            match self.get(&id) {
                Ok(layer) if layer.tar_hash.as_str() == tar_hash => return Ok(true),
                Ok(_) => {}
                Err(e) => warn!("skipping unreadable layer record {}: {e}", id.short()),
            }
        }
        Ok(false)
    }
}

impl LayerCache for DiskLayerCache {
    fn lookup(&self, key: &CacheKey) -> Result<Option<Layer>, StoreError> {
        let step = key.step_id();
        let Some(id) = self.binding(&step)? else {
            debug!("cache miss for {key}");
            return Ok(None);
        };
        let layer = self.get(&id)?;
        if layer.step_id != step {
            return Err(StoreError::KeyMismatch {
                layer: layer.id.to_string(),
                expected: step.to_string(),
                found: layer.step_id.to_string(),
            });
        }
        if !self.objects.exists(&layer.tar_hash) {
            return Err(StoreError::ObjectNotFound(layer.tar_hash.to_string()));
        }
        self.touch(&layer.id);
        debug!("cache hit for {key}: layer {}", layer.id.short());
        Ok(Some(layer))
    }

    fn store(&self, key: &CacheKey, layer: Layer, content: &[u8]) -> Result<Layer, StoreError> {
        validate_for_key(key, &layer, content)?;
        let step = key.step_id();

        if let Some(existing) = self.binding(&step)? {
            debug!("{key} already bound to {}", existing.short());
            return self.get(&existing);
        }
        if let Some(parent) = &layer.parent {
            if !self.contains(parent) {
                return Err(StoreError::BrokenChain {
                    layer: layer.id.to_string(),
                    reason: format!("parent {} is not cached", parent.short()),
                });
            }
        }

        self.objects.put(content)?;
        self.put_record(&layer)?;

        let dir = self.layout.index_dir();
        let binding = dir.join(step.as_str());
        match write_atomic(&dir, &binding, layer.id.as_bytes(), false) {
            Ok(()) => {
                self.touch(&layer.id);
                debug!("stored layer {} for {key}", layer.id.short());
                Ok(layer)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let winner = self
                    .binding(&step)?
                    .ok_or_else(|| StoreError::LayerNotFound(step.to_string()))?;
                if winner != layer.id {
                    debug!(
                        "lost binding race for {key}; discarding {} in favour of {}",
                        layer.id.short(),
                        winner.short()
                    );
                    let record = self.layout.layers_dir().join(layer.id.as_str());
                    if let Err(e) = fs::remove_file(&record) {
                        warn!("failed to discard losing layer record: {e}");
                    }
                }
                self.get(&winner)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, id: &LayerId) -> Result<Layer, StoreError> {
        let path = self.layout.layers_dir().join(id.as_str());
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::LayerNotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let record: LayerRecord = serde_json::from_str(&content)?;
        let actual = record_checksum(&record.layer)?;
        if actual != record.checksum {
            return Err(StoreError::IntegrityFailure {
                hash: id.to_string(),
                expected: record.checksum,
                actual,
            });
        }
        if &record.layer.id != id {
            return Err(StoreError::InvalidLayer {
                layer: id.to_string(),
                reason: format!("record holds layer {}", record.layer.id),
            });
        }
        record.layer.validate()?;
        Ok(record.layer)
    }

    fn content(&self, id: &LayerId) -> Result<Vec<u8>, StoreError> {
        let layer = self.get(id)?;
        self.objects.get(&layer.tar_hash)
    }

    fn entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let mut out = Vec::new();
        for id in self.layer_ids()? {
            match self.get(&id) {
                Ok(layer) => {
                    let last_used = self.last_used(&layer);
                    out.push(CacheEntry { layer, last_used });
                }
                Err(e) => warn!("skipping unreadable layer record {}: {e}", id.short()),
            }
        }
        Ok(out)
    }

    fn remove(&self, id: &LayerId) -> Result<(), StoreError> {
        let layer = self.get(id)?;

        // Unbind first so a concurrent lookup never sees a binding to a
        // record that is about to disappear.
        if self.binding(&layer.step_id)?.as_ref() == Some(id) {
            Self::remove_file_if_exists(&self.layout.index_dir().join(layer.step_id.as_str()))?;
        }
        Self::remove_file_if_exists(&self.layout.layers_dir().join(id.as_str()))?;
        Self::remove_file_if_exists(&self.layout.access_dir().join(id.as_str()))?;

        if !self.object_referenced(&layer.tar_hash, id)? {
            self.objects.remove(&layer.tar_hash)?;
        }
        debug!("removed layer {}", id.short());
        Ok(())
    }
}

fn list_names(dir: &Path) -> Result<Vec<String>, StoreError> {
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
