use crate::RuntimeError;
use fs2::FileExt;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use strata_store::{apply_layer, pack_layer, WHITEOUT_PREFIX};
use tracing::{debug, warn};

const OVERLAY_PREFIX: &str = "overlay-";
const LOCK_SUFFIX: &str = ".lock";
const PENDING_PREFIX: &str = ".pending-";

/// Age after which an unrenamed pending lock is considered abandoned.
const PENDING_GRACE: Duration = Duration::from_secs(60);

static NEXT_OVERLAY: AtomicU64 = AtomicU64::new(0);

/// Disposable scratch filesystem for one build step.
///
/// `lower/` holds the parent chain as it was before the step; `root/` starts
/// as an identical copy and receives the installs. [`diff`](Self::diff)
/// turns the difference into a layer archive. The whole directory is
/// removed when the guard is dropped.
///
/// While alive, the overlay holds an exclusive lock on
/// `<staging>/overlay-<id>.lock`. The lock is taken on a pending file that
/// is then renamed into place, and the directory is created only after that,
/// so an overlay whose lock can be taken belongs to a dead process.
#[derive(Debug)]
pub struct Overlay {
    dir: PathBuf,
    lock_path: PathBuf,
    lock: File,
}

impl Overlay {
    pub fn acquire(staging: &Path) -> Result<Self, RuntimeError> {
        fs::create_dir_all(staging)?;
        let name = format!(
            "{OVERLAY_PREFIX}{}-{}",
            std::process::id(),
            NEXT_OVERLAY.fetch_add(1, Ordering::Relaxed)
        );
        let lock_path = staging.join(format!("{name}{LOCK_SUFFIX}"));
        let pending = staging.join(format!("{PENDING_PREFIX}{name}{LOCK_SUFFIX}"));
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&pending)?;
        FileExt::try_lock_exclusive(&lock)?;
        fs::rename(&pending, &lock_path)?;

        let dir = staging.join(&name);
        if dir.exists() {
            force_remove(&dir)?;
        }
        let overlay = Self {
            dir,
            lock_path,
            lock,
        };
        fs::create_dir_all(overlay.lower())?;
        fs::create_dir_all(overlay.root())?;
        debug!("acquired overlay {}", overlay.dir.display());
        Ok(overlay)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn lower(&self) -> PathBuf {
        self.dir.join("lower")
    }

    /// Writable root the installer works in.
    pub fn root(&self) -> PathBuf {
        self.dir.join("root")
    }

    /// Apply the parent chain, base first, to both `lower/` and `root/`.
    pub fn materialize<'a>(
        &self,
        layers: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<(), RuntimeError> {
        let (lower, root) = (self.lower(), self.root());
        for content in layers {
            apply_layer(content, &lower)?;
            apply_layer(content, &root)?;
        }
        Ok(())
    }

    /// Deterministic tar of everything that changed from `lower/` to `root/`.
    ///
    /// Added and modified entries are stored as-is; removed entries become
    /// `.wh.<name>` markers. Children of a removed directory are covered by
    /// the directory's marker.
    pub fn diff(&self) -> Result<Vec<u8>, RuntimeError> {
        let capture = |e: &dyn std::fmt::Display| RuntimeError::Capture(e.to_string());
        let (lower_dir, root_dir) = (self.lower(), self.root());
        let lower = scan(&lower_dir).map_err(|e| capture(&e))?;
        let upper = scan(&root_dir).map_err(|e| capture(&e))?;

        let delta = self.dir.join("delta");
        if delta.exists() {
            force_remove(&delta)?;
        }
        fs::create_dir_all(&delta)?;

        for (rel, node) in &upper {
            if lower.get(rel) == Some(node) {
                continue;
            }
            ensure_parents(&root_dir, &delta, rel)?;
            let from = root_dir.join(rel);
            let to = delta.join(rel);
            match node {
                Node::Dir { mode } => {
                    fs::create_dir_all(&to)?;
                    fs::set_permissions(&to, fs::Permissions::from_mode(*mode))?;
                }
                Node::File { .. } => {
                    fs::copy(&from, &to)?;
                }
                Node::Symlink(target) => {
                    std::os::unix::fs::symlink(target, &to)?;
                }
            }
        }

        for rel in lower.keys() {
            if upper.contains_key(rel) || removed_ancestor(rel, &lower, &upper) {
                continue;
            }
            ensure_parents(&root_dir, &delta, rel)?;
            File::create(delta.join(whiteout_for(rel)))?;
        }

        let tar = pack_layer(&delta).map_err(|e| capture(&e))?;
        force_remove(&delta)?;
        Ok(tar)
    }
}

impl Drop for Overlay {
    fn drop(&mut self) {
        if let Err(e) = force_remove(&self.dir) {
            warn!("failed to remove overlay {}: {e}", self.dir.display());
        }
        if let Err(e) = fs::remove_file(&self.lock_path) {
            warn!("failed to remove overlay lock {}: {e}", self.lock_path.display());
        }
        let _ = FileExt::unlock(&self.lock);
    }
}

/// Remove overlays left behind by processes that no longer hold their lock.
/// Returns the number removed.
///
/// Safe to run while other processes acquire and drop overlays in the same
/// staging directory: each overlay's liveness is decided by its lock file
/// alone, and entries that vanish mid-sweep count as already gone.
pub fn sweep_stale_overlays(staging: &Path) -> Result<usize, RuntimeError> {
    let entries = match fs::read_dir(staging) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut stems = BTreeSet::new();
    let mut pending = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.starts_with(PENDING_PREFIX) && name.ends_with(LOCK_SUFFIX) {
            pending.push(entry.path());
        } else if name.starts_with(OVERLAY_PREFIX) {
            let stem = name.strip_suffix(LOCK_SUFFIX).unwrap_or(name);
            stems.insert(stem.to_owned());
        }
    }

    let mut removed = 0;
    for stem in stems {
        let lock_path = staging.join(format!("{stem}{LOCK_SUFFIX}"));
        let lock = match claim(&lock_path)? {
            Claim::Held => continue,
            Claim::Free(file) => Some(file),
            // A live overlay creates its lock before its directory and
            // removes it after, so a bare directory is always dead.
            Claim::Missing => None,
        };
        let dir = staging.join(&stem);
        if dir.exists() {
            force_remove(&dir)?;
            removed += 1;
            debug!("swept stale overlay {}", dir.display());
        }
        if let Some(file) = lock {
            remove_if_present(&lock_path)?;
            let _ = FileExt::unlock(&file);
        }
    }

    for path in pending {
        sweep_pending(&path)?;
    }
    Ok(removed)
}

enum Claim {
    Held,
    Free(File),
    Missing,
}

fn claim(lock_path: &Path) -> std::io::Result<Claim> {
    let file = match OpenOptions::new().write(true).open(lock_path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Claim::Missing),
        Err(e) => return Err(e),
    };
    if FileExt::try_lock_exclusive(&file).is_ok() {
        Ok(Claim::Free(file))
    } else {
        Ok(Claim::Held)
    }
}

/// Remove a pending lock file abandoned between creation and rename.
///
/// Only files older than [`PENDING_GRACE`] are touched: a fresh one may
/// belong to an `acquire` that has opened it but not locked it yet.
fn sweep_pending(path: &Path) -> std::io::Result<bool> {
    let modified = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let fresh = modified
        .elapsed()
        .map_or(true, |age| age < PENDING_GRACE);
    if fresh {
        return Ok(false);
    }
    let Claim::Free(file) = claim(path)? else {
        return Ok(false);
    };
    remove_if_present(path)?;
    let _ = FileExt::unlock(&file);
    debug!("swept abandoned overlay lock {}", path.display());
    Ok(true)
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Node {
    Dir { mode: u32 },
    File { mode: u32, hash: blake3::Hash },
    Symlink(PathBuf),
}

/// Every entry under `root` keyed by relative path.
fn scan(root: &Path) -> std::io::Result<BTreeMap<PathBuf, Node>> {
    let mut out = BTreeMap::new();
    scan_into(root, root, &mut out)?;
    Ok(out)
}

fn scan_into(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, Node>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = path.symlink_metadata()?;
        let rel = path
            .strip_prefix(root)
            .map_err(std::io::Error::other)?
            .to_path_buf();
        let mode = meta.permissions().mode();
        let ft = meta.file_type();
        if ft.is_dir() {
            out.insert(rel, Node::Dir { mode });
            scan_into(root, &path, out)?;
        } else if ft.is_symlink() {
            out.insert(rel, Node::Symlink(fs::read_link(&path)?));
        } else if ft.is_file() {
            let hash = blake3::hash(&fs::read(&path)?);
            out.insert(rel, Node::File { mode, hash });
        } else {
            warn!("ignoring unsupported file type: {}", path.display());
        }
    }
    Ok(())
}

/// True when some ancestor of `rel` was removed as a whole, so its own
/// whiteout already covers `rel`.
fn removed_ancestor(
    rel: &Path,
    lower: &BTreeMap<PathBuf, Node>,
    upper: &BTreeMap<PathBuf, Node>,
) -> bool {
    rel.ancestors()
        .skip(1)
        .filter(|a| !a.as_os_str().is_empty())
        .any(|a| lower.contains_key(a) && !matches!(upper.get(a), Some(Node::Dir { .. })))
}

/// `dir/.wh.name` for `dir/name`, keeping the name's exact bytes.
fn whiteout_for(rel: &Path) -> PathBuf {
    let parent = rel.parent().unwrap_or(Path::new(""));
    let mut name = OsString::from(WHITEOUT_PREFIX);
    if let Some(file_name) = rel.file_name() {
        name.push(file_name);
    }
    parent.join(name)
}

/// Create the parent directories of `rel` inside `delta`, copying each
/// one's mode from `root`.
fn ensure_parents(root: &Path, delta: &Path, rel: &Path) -> Result<(), RuntimeError> {
    let Some(parent) = rel.parent() else {
        return Ok(());
    };
    let mut current = PathBuf::new();
    for component in parent.components() {
        current.push(component);
        let target = delta.join(&current);
        if target.exists() {
            continue;
        }
        fs::create_dir(&target)?;
        if let Ok(meta) = root.join(&current).symlink_metadata() {
            if meta.is_dir() {
                fs::set_permissions(&target, fs::Permissions::from_mode(meta.permissions().mode()))?;
            }
        }
    }
    Ok(())
}

/// Remove a directory tree, first making read-only directories writable.
/// A tree that disappears underneath, e.g. to a concurrent sweep, counts
/// as removed.
fn force_remove(path: &Path) -> std::io::Result<()> {
    let gone = |result: std::io::Result<()>| match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    };
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(_) => {
            gone(make_writable(path))?;
            gone(fs::remove_dir_all(path))
        }
    }
}

fn make_writable(path: &Path) -> std::io::Result<()> {
    let meta = path.symlink_metadata()?;
    if meta.is_dir() {
        let mode = meta.permissions().mode() | 0o700;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        for entry in fs::read_dir(path)? {
            make_writable(&entry?.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(dir: &Path) -> Vec<u8> {
        pack_layer(dir).unwrap()
    }

    fn base_tar() -> Vec<u8> {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("etc")).unwrap();
        fs::write(src.path().join("etc/os-release"), "base").unwrap();
        fs::create_dir_all(src.path().join("pkg/old")).unwrap();
        fs::write(src.path().join("pkg/old/mod.py"), "old").unwrap();
        fs::write(src.path().join("pkg/keep.py"), "keep").unwrap();
        snapshot(src.path())
    }

    #[test]
    fn acquire_creates_and_drop_removes() {
        let staging = tempfile::tempdir().unwrap();
        let path;
        {
            let overlay = Overlay::acquire(staging.path()).unwrap();
            path = overlay.path().to_path_buf();
            assert!(overlay.lower().is_dir());
            assert!(overlay.root().is_dir());
        }
        assert!(!path.exists());
        assert_eq!(fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[test]
    fn materialize_populates_both_sides() {
        let staging = tempfile::tempdir().unwrap();
        let overlay = Overlay::acquire(staging.path()).unwrap();
        let base = base_tar();
        overlay.materialize([base.as_slice()]).unwrap();
        assert!(overlay.lower().join("etc/os-release").is_file());
        assert!(overlay.root().join("etc/os-release").is_file());
    }

    #[test]
    fn unchanged_root_gives_empty_delta() {
        let staging = tempfile::tempdir().unwrap();
        let overlay = Overlay::acquire(staging.path()).unwrap();
        let base = base_tar();
        overlay.materialize([base.as_slice()]).unwrap();
        let delta = overlay.diff().unwrap();

        let empty = tempfile::tempdir().unwrap();
        assert_eq!(delta, snapshot(empty.path()));
    }

    #[test]
    fn delta_replays_changes() {
        let staging = tempfile::tempdir().unwrap();
        let overlay = Overlay::acquire(staging.path()).unwrap();
        let base = base_tar();
        overlay.materialize([base.as_slice()]).unwrap();

        let root = overlay.root();
        fs::write(root.join("etc/os-release"), "modified").unwrap();
        fs::create_dir_all(root.join("pkg/new")).unwrap();
        fs::write(root.join("pkg/new/mod.py"), "new").unwrap();
        fs::remove_dir_all(root.join("pkg/old")).unwrap();
        let delta = overlay.diff().unwrap();

        let replay = tempfile::tempdir().unwrap();
        apply_layer(&base, replay.path()).unwrap();
        apply_layer(&delta, replay.path()).unwrap();

        assert_eq!(
            fs::read_to_string(replay.path().join("etc/os-release")).unwrap(),
            "modified"
        );
        assert_eq!(
            fs::read_to_string(replay.path().join("pkg/new/mod.py")).unwrap(),
            "new"
        );
        assert!(!replay.path().join("pkg/old").exists());
        assert_eq!(
            fs::read_to_string(replay.path().join("pkg/keep.py")).unwrap(),
            "keep"
        );
    }

    #[test]
    fn removed_directory_gets_single_whiteout() {
        let staging = tempfile::tempdir().unwrap();
        let overlay = Overlay::acquire(staging.path()).unwrap();
        let base = base_tar();
        overlay.materialize([base.as_slice()]).unwrap();
        fs::remove_dir_all(overlay.root().join("pkg/old")).unwrap();

        let delta = overlay.diff().unwrap();
        let mut ar = tar::Archive::new(delta.as_slice());
        let names: Vec<String> = ar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"pkg/.wh.old".to_owned()), "{names:?}");
        assert!(!names.iter().any(|n| n.contains("mod.py")), "{names:?}");
    }

    #[test]
    fn deleted_non_utf8_name_gets_exact_whiteout() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let name = OsStr::from_bytes(b"caf\xe9.py");
        let lower = tempfile::tempdir().unwrap();
        fs::create_dir(lower.path().join("pkg")).unwrap();
        fs::write(lower.path().join("pkg").join(name), "x").unwrap();
        let base = pack_layer(lower.path()).unwrap();

        let staging = tempfile::tempdir().unwrap();
        let overlay = Overlay::acquire(staging.path()).unwrap();
        overlay.materialize([base.as_slice()]).unwrap();
        fs::remove_file(overlay.root().join("pkg").join(name)).unwrap();

        let delta = overlay.diff().unwrap();
        let mut ar = tar::Archive::new(delta.as_slice());
        let names: Vec<Vec<u8>> = ar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path_bytes().into_owned())
            .collect();
        assert!(names.contains(&b"pkg/.wh.caf\xe9.py".to_vec()), "{names:?}");

        let target = tempfile::tempdir().unwrap();
        apply_layer(&base, target.path()).unwrap();
        apply_layer(&delta, target.path()).unwrap();
        assert!(!target.path().join("pkg").join(name).exists());
        assert!(target.path().join("pkg").is_dir());
    }

    #[test]
    fn diff_is_deterministic() {
        let base = base_tar();
        let run = || {
            let staging = tempfile::tempdir().unwrap();
            let overlay = Overlay::acquire(staging.path()).unwrap();
            overlay.materialize([base.as_slice()]).unwrap();
            fs::write(overlay.root().join("pkg/added.py"), "x").unwrap();
            overlay.diff().unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn sweep_skips_live_and_removes_dead() {
        let staging = tempfile::tempdir().unwrap();
        let live = Overlay::acquire(staging.path()).unwrap();

        let dead_dir = staging.path().join("overlay-999999-0");
        fs::create_dir_all(dead_dir.join("root")).unwrap();
        File::create(staging.path().join("overlay-999999-0.lock")).unwrap();
        let orphan_dir = staging.path().join("overlay-999999-1");
        fs::create_dir_all(&orphan_dir).unwrap();

        let removed = sweep_stale_overlays(staging.path()).unwrap();
        assert_eq!(removed, 2);
        assert!(!dead_dir.exists());
        assert!(!orphan_dir.exists());
        assert!(live.path().exists());
    }

    #[test]
    fn sweep_of_missing_staging_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(sweep_stale_overlays(&dir.path().join("staging")).unwrap(), 0);
    }

    #[test]
    fn sweep_tolerates_overlays_coming_and_going() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;

        let staging = tempfile::tempdir().unwrap();
        let path = staging.path().to_path_buf();
        let done = Arc::new(AtomicBool::new(false));
        let worker = {
            let path = path.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    let overlay = Overlay::acquire(&path).unwrap();
                    fs::write(overlay.root().join("f"), "x").unwrap();
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let mut sweeps = 0;
        loop {
            sweep_stale_overlays(&path).unwrap();
            sweeps += 1;
            if done.load(Ordering::SeqCst) {
                break;
            }
        }
        worker.join().unwrap();
        assert!(sweeps > 0);
        assert_eq!(sweep_stale_overlays(&path).unwrap(), 0);
        assert_eq!(fs::read_dir(&path).unwrap().count(), 0);
    }

    #[test]
    fn sweep_removes_abandoned_pending_locks() {
        use std::time::SystemTime;

        let staging = tempfile::tempdir().unwrap();
        let long_ago = SystemTime::now() - Duration::from_secs(3600);

        let abandoned = staging.path().join(".pending-overlay-999999-0.lock");
        File::create(&abandoned)
            .unwrap()
            .set_modified(long_ago)
            .unwrap();
        let fresh = staging.path().join(".pending-overlay-999999-1.lock");
        File::create(&fresh).unwrap();
        let held = staging.path().join(".pending-overlay-999999-2.lock");
        let held_file = File::create(&held).unwrap();
        held_file.set_modified(long_ago).unwrap();
        FileExt::lock_exclusive(&held_file).unwrap();

        sweep_stale_overlays(staging.path()).unwrap();
        assert!(!abandoned.exists());
        assert!(fresh.exists());
        assert!(held.exists());
    }

    #[test]
    fn read_only_tree_is_still_removed() {
        let staging = tempfile::tempdir().unwrap();
        let path = {
            let overlay = Overlay::acquire(staging.path()).unwrap();
            let ro = overlay.root().join("ro");
            fs::create_dir_all(&ro).unwrap();
            fs::write(ro.join("f"), "x").unwrap();
            fs::set_permissions(&ro, fs::Permissions::from_mode(0o555)).unwrap();
            overlay.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
