//! Build orchestration for strata.
//!
//! This crate ties together manifest parsing, the layer cache, and the
//! execution backends into a [`Builder`] that turns a base reference plus an
//! ordered list of requirement manifests into an [`Image`](strata_store::Image),
//! and an [`Engine`] facade over an on-disk store for building, listing,
//! inspecting, evicting, and verifying. It also provides the build state
//! machine, store locking, cancellation, and configuration loading.

pub mod assembler;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod executor;
pub mod lifecycle;

pub use assembler::assemble;
pub use concurrency::{install_signal_handler, CancelToken, LockMode, StoreLock};
pub use config::{parse_size, StrataConfig};
pub use engine::{BuildOutcome, BuildReport, Builder, Engine, StepReport};
pub use executor::{BuildExecutor, StepResult};
pub use lifecycle::{validate_transition, BuildState};

use strata_runtime::ExitInfo;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] strata_schema::ManifestError),
    #[error("store error: {0}")]
    Store(#[from] strata_store::StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] strata_runtime::RuntimeError),
    #[error("install of '{specifier}' failed with {exit}:\n{output}")]
    InstallFailure {
        specifier: String,
        exit: ExitInfo,
        output: String,
    },
    #[error("filesystem capture failed: {0}")]
    FilesystemCapture(String),
    #[error("broken lineage at layer {position}: expected parent {expected}, found {found}")]
    BrokenLineage {
        position: usize,
        expected: String,
        found: String,
    },
    #[error("invalid build state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("build cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
