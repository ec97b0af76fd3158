use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use strata_schema::{base_step_id, layer_id, step_id, LayerId, ManifestHash, ObjectHash, StepId};
use tracing::warn;

/// Marker prefix for deletions recorded in a layer delta.
///
/// A file named `.wh.<name>` in a layer removes `<name>` from the layers
/// below it when the layer is applied.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// What produced a layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerSource {
    /// Full snapshot of an external base image.
    Base { reference: String },
    /// Delta produced by installing one manifest atop the parent layer.
    Install { manifest_hash: ManifestHash },
}

/// An immutable filesystem delta plus its lineage metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Layer {
    pub id: LayerId,
    pub step_id: StepId,
    pub parent: Option<LayerId>,
    pub source: LayerSource,
    /// blake3 hash of the tar archive holding this layer's content.
    pub tar_hash: ObjectHash,
    pub size: u64,
    pub created_at: String,
}

impl Layer {
    /// Describe the base layer for `reference` whose snapshot archive is `content`.
    pub fn base(reference: &str, content: &[u8]) -> Self {
        let step = base_step_id(reference);
        Self::from_parts(
            step,
            None,
            LayerSource::Base {
                reference: reference.to_owned(),
            },
            content,
        )
    }

    /// Describe the delta `content` produced by applying `manifest` atop `parent`.
    pub fn install(parent: &LayerId, manifest: &ManifestHash, content: &[u8]) -> Self {
        let step = step_id(parent, manifest);
        Self::from_parts(
            step,
            Some(parent.clone()),
            LayerSource::Install {
                manifest_hash: manifest.clone(),
            },
            content,
        )
    }

    fn from_parts(
        step: StepId,
        parent: Option<LayerId>,
        source: LayerSource,
        content: &[u8],
    ) -> Self {
        let tar_hash = ObjectHash::new(blake3::hash(content).to_hex().to_string());
        Self {
            id: layer_id(&step, &tar_hash),
            step_id: step,
            parent,
            source,
            tar_hash,
            size: content.len() as u64,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn is_base(&self) -> bool {
        matches!(self.source, LayerSource::Base { .. })
    }

    pub fn manifest_hash(&self) -> Option<&ManifestHash> {
        match &self.source {
            LayerSource::Install { manifest_hash } => Some(manifest_hash),
            LayerSource::Base { .. } => None,
        }
    }

    /// Check that the id, step, and parent fields agree with each other.
    pub fn validate(&self) -> Result<(), StoreError> {
        let invalid = |reason: &str| StoreError::InvalidLayer {
            layer: self.id.to_string(),
            reason: reason.to_owned(),
        };
        let expected_step = match (&self.source, &self.parent) {
            (LayerSource::Base { reference }, None) => base_step_id(reference),
            (LayerSource::Install { manifest_hash }, Some(parent)) => {
                step_id(parent, manifest_hash)
            }
            (LayerSource::Base { .. }, Some(_)) => return Err(invalid("base layer has a parent")),
            (LayerSource::Install { .. }, None) => {
                return Err(invalid("install layer has no parent"))
            }
        };
        if expected_step != self.step_id {
            return Err(invalid("step id does not match source and parent"));
        }
        if layer_id(&self.step_id, &self.tar_hash) != self.id {
            return Err(invalid("layer id does not match step and content hash"));
        }
        Ok(())
    }

    /// Check that `content` is the archive this layer describes.
    pub fn verify_content(&self, content: &[u8]) -> Result<(), StoreError> {
        let actual = blake3::hash(content).to_hex();
        if actual.as_str() != self.tar_hash.as_str() {
            return Err(StoreError::IntegrityFailure {
                hash: self.id.to_string(),
                expected: self.tar_hash.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

/// Create a deterministic tar archive from a directory.
///
/// Supports regular files, directories, and symlinks. Device nodes,
/// sockets, and FIFOs are skipped with warnings.
///
/// Determinism guarantees:
/// - Entries sorted bytewise by relative path (names need not be UTF-8)
/// - All timestamps set to 0 (Unix epoch)
/// - All ownership set to 0:0 (root:root)
/// - Permissions preserved as-is from source
pub fn pack_layer(source_dir: &Path) -> Result<Vec<u8>, StoreError> {
    let mut entries = collect_entries(source_dir, source_dir)?;
    entries.sort_by(|a, b| {
        a.0.as_os_str()
            .as_bytes()
            .cmp(b.0.as_os_str().as_bytes())
    });

    let mut ar = tar::Builder::new(Vec::new());
    ar.follow_symlinks(false);

    for (rel_path, full_path) in &entries {
        let ft = match full_path.symlink_metadata() {
            Ok(m) => m.file_type(),
            Err(e) => {
                warn!("skipping {}: metadata error: {e}", rel_path.display());
                continue;
            }
        };

        if ft.is_file() {
            append_file(&mut ar, rel_path, full_path)?;
        } else if ft.is_dir() {
            append_dir(&mut ar, rel_path, full_path)?;
        } else if ft.is_symlink() {
            append_symlink(&mut ar, rel_path, full_path)?;
        } else {
            warn!("skipping unsupported file type: {}", rel_path.display());
        }
    }

    let data = ar.into_inner()?;
    Ok(data)
}

/// Extract a layer archive on top of `target`.
///
/// Whiteout entries are processed first and remove the named paths; all
/// other entries are then unpacked, replacing whatever lower layers left at
/// the same path.
pub fn apply_layer(tar_data: &[u8], target: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(target)?;

    let mut ar = tar::Archive::new(tar_data);
    for entry in ar.entries()? {
        let entry = entry?;
        let path = entry.path()?.into_owned();
        if let Some(victim) = whiteout_target(&path)? {
            remove_path(&target.join(victim))?;
        }
    }

    let mut ar = tar::Archive::new(tar_data);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(false);
    ar.set_unpack_xattrs(false);
    ar.set_overwrite(true);
    for entry in ar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if whiteout_target(&path)?.is_some() {
            continue;
        }
        let dest = target.join(&path);
        if let Ok(meta) = dest.symlink_metadata() {
            let entry_is_dir = entry.header().entry_type().is_dir();
            if meta.is_dir() && !entry_is_dir {
                fs::remove_dir_all(&dest)?;
            } else if !meta.is_dir() && entry_is_dir {
                fs::remove_file(&dest)?;
            }
        }
        entry.unpack_in(target)?;
    }
    Ok(())
}

/// Path removed by a whiteout entry, or `None` for ordinary entries.
fn whiteout_target(path: &Path) -> Result<Option<PathBuf>, StoreError> {
    let Some(name) = path.file_name() else {
        return Ok(None);
    };
    let Some(victim) = name
        .as_bytes()
        .strip_prefix(WHITEOUT_PREFIX.as_bytes())
        .map(OsStr::from_bytes)
    else {
        return Ok(None);
    };
    if !path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        || victim.is_empty()
    {
        return Err(StoreError::InvalidLayer {
            layer: path.display().to_string(),
            reason: "whiteout escapes the layer root".to_owned(),
        });
    }
    let parent = path.parent().unwrap_or(Path::new(""));
    Ok(Some(parent.join(victim)))
}

fn remove_path(path: &Path) -> Result<(), StoreError> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Recursively collect (relative_path, full_path) pairs from a directory tree.
fn collect_entries(root: &Path, current: &Path) -> Result<Vec<(PathBuf, PathBuf)>, StoreError> {
    let mut result = Vec::new();
    if !current.exists() {
        return Ok(result);
    }
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let full = entry.path();
        let rel = full
            .strip_prefix(root)
            .map_err(|e| StoreError::Io(std::io::Error::other(format!("path strip: {e}"))))?
            .to_path_buf();

        let meta = full.symlink_metadata()?;
        if meta.is_dir() {
            result.push((rel.clone(), full.clone()));
            result.extend(collect_entries(root, &full)?);
        } else {
            result.push((rel, full));
        }
    }
    Ok(result)
}

fn make_header(full_path: &Path, entry_type: tar::EntryType) -> Result<tar::Header, StoreError> {
    let meta = full_path.symlink_metadata()?;
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(meta.permissions().mode());
    Ok(header)
}

fn append_file(
    ar: &mut tar::Builder<Vec<u8>>,
    rel_path: &Path,
    full_path: &Path,
) -> Result<(), StoreError> {
    let data = fs::read(full_path)?;
    let mut header = make_header(full_path, tar::EntryType::Regular)?;
    header.set_size(data.len() as u64);
    header.set_cksum();
    ar.append_data(&mut header, rel_path, data.as_slice())?;
    Ok(())
}

fn append_dir(
    ar: &mut tar::Builder<Vec<u8>>,
    rel_path: &Path,
    full_path: &Path,
) -> Result<(), StoreError> {
    let mut header = make_header(full_path, tar::EntryType::Directory)?;
    header.set_size(0);
    header.set_cksum();
    let mut path = OsString::from(rel_path.as_os_str());
    if !path.as_bytes().ends_with(b"/") {
        path.push("/");
    }
    ar.append_data(&mut header, Path::new(&path), &[] as &[u8])?;
    Ok(())
}

fn append_symlink(
    ar: &mut tar::Builder<Vec<u8>>,
    rel_path: &Path,
    full_path: &Path,
) -> Result<(), StoreError> {
    let target = fs::read_link(full_path)?;
    let mut header = make_header(full_path, tar::EntryType::Symlink)?;
    header.set_size(0);
    header.set_cksum();
    ar.append_link(&mut header, rel_path, &target)?;
    Ok(())
}
