use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How a [`StoreLock`] holds the store.
///
/// Builds take the lock shared, so any number can run at once; eviction and
/// gc take it exclusive, so no layer disappears under a running build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

pub struct StoreLock {
    lock_file: File,
    mode: LockMode,
}

impl StoreLock {
    pub fn acquire(lock_path: &Path, mode: LockMode) -> Result<Self, CoreError> {
        let file = open_lock_file(lock_path)?;
        let locked = match mode {
            LockMode::Shared => FileExt::lock_shared(&file),
            LockMode::Exclusive => FileExt::lock_exclusive(&file),
        };
        locked?;
        Ok(Self {
            lock_file: file,
            mode,
        })
    }

    pub fn try_acquire(lock_path: &Path, mode: LockMode) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(lock_path)?;
        let locked = match mode {
            LockMode::Shared => FileExt::try_lock_shared(&file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
        };
        match locked {
            Ok(()) => Ok(Some(Self {
                lock_file: file,
                mode,
            })),
            Err(_) => Ok(None),
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

fn open_lock_file(lock_path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock_file);
    }
}

/// Shared cancellation flag, checked by a build before each step and
/// between installs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancel `token` on SIGINT/SIGTERM. A second signal exits immediately
/// with status 130.
pub fn install_signal_handler(token: &CancelToken) {
    let token = token.clone();
    let _ = ctrlc::set_handler(move || {
        if token.is_cancelled() {
            std::process::exit(130);
        }
        token.cancel();
        eprintln!("\ncancellation requested, stopping after the current install...");
    });
}
