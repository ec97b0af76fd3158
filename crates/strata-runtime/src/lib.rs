//! External services and scratch filesystems for strata builds.
//!
//! This crate implements the execution layer: the narrow `BaseResolver` and
//! `Installer` traits with a pip backend (host interpreter, `--root`
//! installs) and a deterministic mock backend, base image resolution from a
//! local bases directory, prerequisite checking, and the disposable
//! `Overlay` in which each build step runs and whose delta becomes a layer.

pub mod backend;
pub mod base;
pub mod mock;
pub mod overlay;
pub mod pip;
pub mod prereq;

pub use backend::{select_backend, Backend, BaseResolver, ExitInfo, InstallOutput, Installer};
pub use base::DirectoryResolver;
pub use mock::{MockInstaller, MockResolver, SITE_PACKAGES};
pub use overlay::{sweep_stale_overlays, Overlay};
pub use pip::{Isolation, PipInstaller};
pub use prereq::{check_pip_prereqs, format_missing, MissingPrereq};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available (expected 'pip' or 'mock')")]
    BackendUnavailable(String),
    #[error("base image '{reference}' not found under {searched}")]
    BaseNotFound { reference: String, searched: String },
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
    #[error("filesystem capture failed: {0}")]
    Capture(String),
    #[error(transparent)]
    Store(#[from] strata_store::StoreError),
}
