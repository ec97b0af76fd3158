pub mod build;
pub mod completions;
pub mod gc;
pub mod images;
pub mod inspect;
pub mod man_pages;
pub mod rmi;
pub mod verify_store;

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use strata_core::CoreError;
use strata_runtime::RuntimeError;
use strata_store::StoreError;
use thiserror::Error;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
/// sysexits `EX_DATAERR`; 2 is taken by clap for usage errors.
pub const EXIT_MANIFEST_ERROR: u8 = 65;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_INSTALL_FAILURE: u8 = 4;
pub const EXIT_BROKEN_LINEAGE: u8 = 5;
pub const EXIT_CANCELLED: u8 = 130;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("{0}")]
    Other(String),
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        Self::Core(CoreError::Store(err))
    }
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Core(err) => exit_code_for(err),
            Self::Other(_) => EXIT_FAILURE,
        }
    }
}

fn store_exit_code(err: &StoreError) -> u8 {
    match err {
        StoreError::BrokenChain { .. } => EXIT_BROKEN_LINEAGE,
        _ => EXIT_STORE_ERROR,
    }
}

pub fn exit_code_for(err: &CoreError) -> u8 {
    match err {
        CoreError::Manifest(_) => EXIT_MANIFEST_ERROR,
        CoreError::Store(e) | CoreError::Runtime(RuntimeError::Store(e)) => store_exit_code(e),
        CoreError::InstallFailure { .. } => EXIT_INSTALL_FAILURE,
        CoreError::BrokenLineage { .. } => EXIT_BROKEN_LINEAGE,
        CoreError::Cancelled => EXIT_CANCELLED,
        _ => EXIT_FAILURE,
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, CliError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| CliError::Other(format!("JSON serialization failed: {e}")))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .map(|s| s.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]))
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

pub fn colorize_step(cached: bool) -> String {
    use console::Style;
    if cached {
        Style::new().green().apply_to("cached").to_string()
    } else {
        Style::new().cyan().bold().apply_to("built").to_string()
    }
}

/// Binary-unit size for tables, e.g. `1.5 MiB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
