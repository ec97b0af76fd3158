use crate::RuntimeError;
use serde::Serialize;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use strata_schema::Specifier;

/// How an installer process ended.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub const SUCCESS: Self = Self {
        code: Some(0),
        signal: None,
    };

    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "killed by signal {sig}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Captured result of one installer invocation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InstallOutput {
    pub exit: ExitInfo,
    pub stdout: String,
    pub stderr: String,
}

impl InstallOutput {
    pub fn success(&self) -> bool {
        self.exit.success()
    }

    /// Stdout followed by stderr, for error reports.
    pub fn combined(&self) -> String {
        match (self.stdout.trim_end(), self.stderr.trim_end()) {
            ("", err) => err.to_owned(),
            (out, "") => out.to_owned(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

/// Materializes an opaque base image reference into a directory.
pub trait BaseResolver: Send + Sync {
    fn name(&self) -> &str;

    /// Populate the empty directory `dest` with the contents of `reference`.
    fn resolve_base(&self, reference: &str, dest: &Path) -> Result<(), RuntimeError>;
}

/// Installs one requirement into a filesystem root.
pub trait Installer: Send + Sync {
    fn name(&self) -> &str;

    /// Install `specifier` into `root`.
    ///
    /// A non-zero exit is reported through [`InstallOutput::exit`], not as an
    /// error; `Err` means the installer could not be run at all.
    fn install(&self, specifier: &Specifier, root: &Path) -> Result<InstallOutput, RuntimeError>;
}

/// A matched resolver and installer pair.
#[derive(Clone)]
pub struct Backend {
    pub resolver: Arc<dyn BaseResolver>,
    pub installer: Arc<dyn Installer>,
}

pub fn select_backend(name: &str, bases_dir: &Path) -> Result<Backend, RuntimeError> {
    match name {
        "pip" => Ok(Backend {
            resolver: Arc::new(crate::base::DirectoryResolver::new(bases_dir)),
            installer: Arc::new(crate::pip::PipInstaller::new()),
        }),
        "mock" => Ok(Backend {
            resolver: Arc::new(crate::mock::MockResolver),
            installer: Arc::new(crate::mock::MockInstaller::new()),
        }),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_valid_backends() {
        let pip = select_backend("pip", Path::new("/tmp/strata-bases")).unwrap();
        assert_eq!(pip.installer.name(), "pip");
        assert_eq!(pip.resolver.name(), "directory");
        let mock = select_backend("mock", Path::new("/tmp/strata-bases")).unwrap();
        assert_eq!(mock.installer.name(), "mock");
    }

    #[test]
    fn select_invalid_backend_fails() {
        assert!(matches!(
            select_backend("conda", Path::new("/tmp")),
            Err(RuntimeError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn exit_info_display() {
        assert_eq!(ExitInfo::code(1).to_string(), "exit code 1");
        let killed = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert_eq!(killed.to_string(), "killed by signal 9");
        assert!(!killed.success());
        assert!(ExitInfo::SUCCESS.success());
    }

    #[test]
    fn exit_info_from_real_status() {
        let status = std::process::Command::new("false").status().unwrap();
        let info = ExitInfo::from(status);
        assert_eq!(info.code, Some(1));
        assert!(!info.success());
    }

    #[test]
    fn combined_output_joins_streams() {
        let out = InstallOutput {
            exit: ExitInfo::code(1),
            stdout: "Collecting gym\n".to_owned(),
            stderr: "ERROR: no match\n".to_owned(),
        };
        assert_eq!(out.combined(), "Collecting gym\nERROR: no match");
        let only_err = InstallOutput {
            stdout: String::new(),
            ..out
        };
        assert_eq!(only_err.combined(), "ERROR: no match");
    }
}
