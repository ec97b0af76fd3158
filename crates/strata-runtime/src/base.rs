use crate::backend::BaseResolver;
use crate::RuntimeError;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolves base references against a local directory of unpacked root
/// filesystems or tar snapshots.
///
/// A reference such as `tf:19.11` is looked up as `tf_19.11.tar` and then as
/// the directory `tf_19.11/` under the bases directory.
pub struct DirectoryResolver {
    bases_dir: PathBuf,
}

impl DirectoryResolver {
    pub fn new(bases_dir: impl Into<PathBuf>) -> Self {
        Self {
            bases_dir: bases_dir.into(),
        }
    }

    /// File-system safe name for a base reference.
    pub fn entry_name(reference: &str) -> String {
        reference
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
                _ => '_',
            })
            .collect()
    }
}

impl BaseResolver for DirectoryResolver {
    fn name(&self) -> &'static str {
        "directory"
    }

    fn resolve_base(&self, reference: &str, dest: &Path) -> Result<(), RuntimeError> {
        let name = Self::entry_name(reference);
        let tarball = self.bases_dir.join(format!("{name}.tar"));
        let tree = self.bases_dir.join(&name);

        if tarball.is_file() {
            debug!("unpacking base {reference} from {}", tarball.display());
            let data = fs::read(&tarball)?;
            strata_store::apply_layer(&data, dest)?;
            return Ok(());
        }
        if tree.is_dir() && !name.starts_with('.') {
            debug!("copying base {reference} from {}", tree.display());
            fs::create_dir_all(dest)?;
            copy_tree(&tree, dest)?;
            return Ok(());
        }
        Err(RuntimeError::BaseNotFound {
            reference: reference.to_owned(),
            searched: self.bases_dir.display().to_string(),
        })
    }
}

/// Copy the contents of `src` into `dst`, keeping permissions and symlinks.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<(), RuntimeError> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = from.symlink_metadata()?;
        let ft = meta.file_type();
        if ft.is_dir() {
            fs::create_dir_all(&to)?;
            copy_tree(&from, &to)?;
            fs::set_permissions(&to, fs::Permissions::from_mode(meta.permissions().mode()))?;
        } else if ft.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(&from)?, &to)?;
        } else if ft.is_file() {
            fs::copy(&from, &to)?;
        } else {
            tracing::warn!("skipping unsupported file type: {}", from.display());
        }
    }
    Ok(())
}
