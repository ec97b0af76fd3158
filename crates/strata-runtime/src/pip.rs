use crate::backend::{ExitInfo, InstallOutput, Installer};
use crate::RuntimeError;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Command;
use strata_schema::Specifier;
use tracing::debug;

/// Interpreter locations looked up inside a root, in order.
const ROOT_INTERPRETERS: [&str; 3] = ["usr/local/bin/python3", "usr/bin/python3", "bin/python3"];

const CHROOT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Where pip runs for one install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Isolation {
    /// [`Namespace`](Self::Namespace) when the root ships its own
    /// interpreter, [`Host`](Self::Host) otherwise.
    #[default]
    Auto,
    /// The root's interpreter, chrooted into the overlay inside a user and
    /// mount namespace. pip sees exactly the parent chain and nothing else.
    Namespace,
    /// The host interpreter writing into the overlay with `--root`. Host
    /// packages are ignored so they never suppress an install.
    Host,
}

/// Installs requirements with pip into an overlay root.
pub struct PipInstaller {
    python: String,
    isolation: Isolation,
}

impl Default for PipInstaller {
    fn default() -> Self {
        Self {
            python: "python3".to_owned(),
            isolation: Isolation::Auto,
        }
    }
}

impl PipInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `python` as the host interpreter.
    pub fn with_python(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn python(&self) -> &str {
        &self.python
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    /// Arguments given to the host interpreter for one install into `root`.
    pub fn install_args(specifier: &Specifier, root: &Path) -> Vec<String> {
        let mut args: Vec<String> = ["-m", "pip", "install", "--root"]
            .into_iter()
            .map(str::to_owned)
            .collect();
        args.push(root.to_string_lossy().into_owned());
        args.push("--ignore-installed".to_owned());
        args.extend(pip_flags(specifier));
        args
    }

    fn host_command(&self, specifier: &Specifier, root: &Path) -> Command {
        let mut cmd = Command::new(&self.python);
        cmd.args(Self::install_args(specifier, root))
            .env("PIP_NO_CACHE_DIR", "1")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PYTHONNOUSERSITE", "1");
        let sites = site_dirs(root);
        if let Ok(path) = std::env::join_paths(&sites) {
            if !sites.is_empty() {
                cmd.env("PYTHONPATH", path);
            }
        }
        cmd
    }

    fn command(&self, specifier: &Specifier, root: &Path) -> Result<Command, RuntimeError> {
        match (self.isolation, root_interpreter(root)) {
            (Isolation::Host, _) | (Isolation::Auto, None) => {
                Ok(self.host_command(specifier, root))
            }
            (Isolation::Namespace | Isolation::Auto, Some(interpreter)) => {
                Ok(namespace_command(specifier, root, &interpreter))
            }
            (Isolation::Namespace, None) => Err(RuntimeError::ExecFailed(format!(
                "no python3 interpreter inside {}",
                root.display()
            ))),
        }
    }
}

impl Installer for PipInstaller {
    fn name(&self) -> &'static str {
        "pip"
    }

    fn install(&self, specifier: &Specifier, root: &Path) -> Result<InstallOutput, RuntimeError> {
        let mut cmd = self.command(specifier, root)?;
        debug!("running {cmd:?}");
        let output = cmd.output().map_err(|e| {
            RuntimeError::ExecFailed(format!(
                "failed to run {}: {e}",
                cmd.get_program().to_string_lossy()
            ))
        })?;
        Ok(InstallOutput {
            exit: ExitInfo::from(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Flags shared by both isolation modes. `--no-compile` keeps bytecode,
/// which embeds source mtimes, out of layers.
fn pip_flags(specifier: &Specifier) -> Vec<String> {
    [
        "--no-input",
        "--disable-pip-version-check",
        "--no-warn-script-location",
        "--no-compile",
        "--progress-bar",
        "off",
    ]
    .into_iter()
    .map(str::to_owned)
    .chain(std::iter::once(specifier.to_string()))
    .collect()
}

/// Absolute in-root path of the root's own interpreter, if it has one.
///
/// Uses `symlink_metadata` because `python3` is usually an absolute symlink
/// that only resolves inside the root.
fn root_interpreter(root: &Path) -> Option<String> {
    ROOT_INTERPRETERS
        .iter()
        .find(|rel| root.join(rel).symlink_metadata().is_ok())
        .map(|rel| format!("/{rel}"))
}

/// `site-packages` and `dist-packages` directories already in `root`.
fn site_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for prefix in ["usr/lib", "usr/local/lib"] {
        let Ok(entries) = std::fs::read_dir(root.join(prefix)) else {
            continue;
        };
        let mut versions: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("python3"))
            .map(|e| e.path())
            .collect();
        versions.sort();
        for version in versions {
            for leaf in ["site-packages", "dist-packages"] {
                let dir = version.join(leaf);
                if dir.is_dir() {
                    dirs.push(dir);
                }
            }
        }
    }
    dirs
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn shell_quote_path(p: &Path) -> String {
    shell_quote(&p.to_string_lossy())
}

fn namespace_command(specifier: &Specifier, root: &Path, interpreter: &str) -> Command {
    let mut cmd = Command::new("unshare");
    cmd.args([
        "--user",
        "--map-root-user",
        "--mount",
        "--pid",
        "--fork",
        "--kill-child=SIGTERM",
    ]);
    cmd.arg("/bin/sh")
        .arg("-c")
        .arg(namespace_script(specifier, root, interpreter));
    cmd
}

/// Mounts only onto paths the root already has, so nothing but the install
/// itself ends up in the delta. The mounts vanish with the namespace.
fn namespace_script(specifier: &Specifier, root: &Path, interpreter: &str) -> String {
    let qr = shell_quote_path(root);
    let mut script = String::new();
    let _ = writeln!(
        script,
        "[ -d {qr}/proc ] && mount -t proc proc {qr}/proc 2>/dev/null || true"
    );
    let _ = writeln!(
        script,
        "[ -d {qr}/dev ] && mount --rbind /dev {qr}/dev 2>/dev/null || true"
    );
    let _ = writeln!(
        script,
        "[ -d {qr}/tmp ] && mount -t tmpfs tmpfs {qr}/tmp 2>/dev/null || true"
    );
    let _ = writeln!(
        script,
        "[ -f {qr}/etc/resolv.conf ] && mount --bind /etc/resolv.conf {qr}/etc/resolv.conf 2>/dev/null || true"
    );

    let args: Vec<String> = ["-m", "pip", "install"]
        .into_iter()
        .map(str::to_owned)
        .chain(pip_flags(specifier))
        .map(|a| shell_quote(&a))
        .collect();
    let _ = write!(
        script,
        "exec chroot {qr} /usr/bin/env -i PATH={CHROOT_PATH} HOME=/root LANG=C.UTF-8 \
         PIP_NO_CACHE_DIR=1 PYTHONDONTWRITEBYTECODE=1 {} {}",
        shell_quote(interpreter),
        args.join(" ")
    );
    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn spec(s: &str) -> Specifier {
        s.parse().unwrap()
    }

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn install_args_target_root() {
        let args = PipInstaller::install_args(&spec("numpy==1.17"), Path::new("/tmp/overlay/root"));
        assert_eq!(&args[..3], ["-m", "pip", "install"]);
        let root = args.iter().position(|a| a == "--root").unwrap();
        assert_eq!(args[root + 1], "/tmp/overlay/root");
        assert_eq!(args.last().unwrap(), "numpy==1.17");
    }

    #[test]
    fn host_install_ignores_host_packages() {
        let root = tempfile::tempdir().unwrap();
        let cmd = PipInstaller::new().host_command(&spec("annotated-types==0.7.0"), root.path());
        let args = args_of(&cmd);
        assert!(args.contains(&"--ignore-installed".to_owned()), "{args:?}");
        assert!(args.contains(&"--no-compile".to_owned()));
        let envs: Vec<_> = cmd.get_envs().collect();
        assert!(envs
            .iter()
            .any(|(k, v)| *k == "PYTHONNOUSERSITE" && v.is_some()));
    }

    #[test]
    fn host_install_sees_parent_site_packages() {
        let root = tempfile::tempdir().unwrap();
        let site = root.path().join("usr/lib/python3.11/site-packages");
        fs::create_dir_all(&site).unwrap();
        let cmd = PipInstaller::new().host_command(&spec("gym"), root.path());
        let pythonpath = cmd
            .get_envs()
            .find(|(k, _)| *k == "PYTHONPATH")
            .and_then(|(_, v)| v)
            .map(|v| v.to_string_lossy().into_owned())
            .unwrap();
        assert_eq!(pythonpath, site.to_string_lossy());
    }

    #[test]
    fn root_without_interpreter_installs_from_host() {
        let root = tempfile::tempdir().unwrap();
        let cmd = PipInstaller::new()
            .command(&spec("gym"), root.path())
            .unwrap();
        assert_eq!(cmd.get_program(), "python3");
    }

    #[test]
    fn root_with_interpreter_installs_inside_it() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("usr/bin")).unwrap();
        std::os::unix::fs::symlink("/usr/bin/python3.11", root.path().join("usr/bin/python3"))
            .unwrap();

        let cmd = PipInstaller::new()
            .command(&spec("gym==0.15"), root.path())
            .unwrap();
        assert_eq!(cmd.get_program(), "unshare");
        let args = args_of(&cmd);
        assert!(args.contains(&"--map-root-user".to_owned()));
        let script = args.last().unwrap();
        assert!(script.contains("chroot"), "{script}");
        assert!(script.contains("'/usr/bin/python3'"), "{script}");
        assert!(script.contains("'gym==0.15'"), "{script}");
        assert!(!script.contains("--root"), "{script}");
    }

    #[test]
    fn forced_namespace_needs_interpreter() {
        let root = tempfile::tempdir().unwrap();
        let pip = PipInstaller::new().with_isolation(Isolation::Namespace);
        assert!(matches!(
            pip.command(&spec("gym"), root.path()),
            Err(RuntimeError::ExecFailed(_))
        ));
    }

    #[test]
    fn forced_host_skips_root_interpreter() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("usr/bin")).unwrap();
        fs::write(root.path().join("usr/bin/python3"), "").unwrap();
        let pip = PipInstaller::new().with_isolation(Isolation::Host);
        assert_eq!(pip.isolation(), Isolation::Host);
        let cmd = pip.command(&spec("gym"), root.path()).unwrap();
        assert_eq!(cmd.get_program(), "python3");
    }

    #[test]
    fn script_quotes_root_path() {
        let script = namespace_script(&spec("gym"), Path::new("/tmp/it's here"), "/usr/bin/python3");
        assert!(script.contains("'/tmp/it'\\''s here'"), "{script}");
    }

    #[test]
    fn missing_interpreter_is_exec_failure() {
        let pip = PipInstaller::with_python("/nonexistent/python-for-strata-tests");
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            pip.install(&spec("gym"), dir.path()),
            Err(RuntimeError::ExecFailed(_))
        ));
        assert_eq!(pip.python(), "/nonexistent/python-for-strata-tests");
    }
}
