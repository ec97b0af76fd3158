use crate::backend::{BaseResolver, ExitInfo, InstallOutput, Installer};
use crate::RuntimeError;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use strata_schema::{Specifier, VersionOp};

/// Where the mock backend places installed packages inside a root.
pub const SITE_PACKAGES: &str = "usr/lib/python3/site-packages";

/// Resolves any reference to a tiny deterministic root filesystem.
pub struct MockResolver;

impl BaseResolver for MockResolver {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn resolve_base(&self, reference: &str, dest: &Path) -> Result<(), RuntimeError> {
        fs::create_dir_all(dest.join("etc"))?;
        fs::create_dir_all(dest.join(SITE_PACKAGES))?;
        fs::write(dest.join("etc/strata-base"), format!("{reference}\n"))?;
        Ok(())
    }
}

type InstallHook = Box<dyn Fn(&Specifier) + Send + Sync>;

/// Installer that writes a fake distribution per requirement.
///
/// Each install replaces any earlier `<name>-*.dist-info` directory, so
/// upgrading a package in a later manifest produces deletions in the delta
/// the way a real installer does.
#[derive(Default)]
pub struct MockInstaller {
    fail_on: HashSet<String>,
    installs: AtomicUsize,
    hook: Option<InstallHook>,
}

impl MockInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make installs of the (normalized) package `name` exit with status 1.
    #[must_use]
    pub fn fail_on(mut self, name: &str) -> Self {
        self.fail_on.insert(name.to_owned());
        self
    }

    /// Run `hook` at the start of every install.
    #[must_use]
    pub fn with_hook(mut self, hook: impl Fn(&Specifier) + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Number of install calls made so far.
    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    fn pinned_version(specifier: &Specifier) -> &str {
        specifier
            .constraints
            .iter()
            .find(|c| matches!(c.op, VersionOp::Equal | VersionOp::Arbitrary))
            .map_or("0.0.0", |c| c.version.as_str())
    }
}

impl Installer for MockInstaller {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn install(&self, specifier: &Specifier, root: &Path) -> Result<InstallOutput, RuntimeError> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.hook {
            hook(specifier);
        }

        if self.fail_on.contains(&specifier.name) {
            return Ok(InstallOutput {
                exit: ExitInfo::code(1),
                stdout: format!("Collecting {specifier}\n"),
                stderr: format!(
                    "ERROR: No matching distribution found for {specifier}\n"
                ),
            });
        }

        let site = root.join(SITE_PACKAGES);
        fs::create_dir_all(&site)?;
        let prefix = format!("{}-", specifier.name);
        for entry in fs::read_dir(&site)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&prefix) && name.ends_with(".dist-info") {
                fs::remove_dir_all(entry.path())?;
            }
        }

        let version = Self::pinned_version(specifier);
        let pkg = site.join(&specifier.name);
        fs::create_dir_all(&pkg)?;
        fs::write(
            pkg.join("__init__.py"),
            format!("__version__ = \"{version}\"\n"),
        )?;
        let dist_info = site.join(format!("{}-{version}.dist-info", specifier.name));
        fs::create_dir_all(&dist_info)?;
        fs::write(
            dist_info.join("METADATA"),
            format!(
                "Metadata-Version: 2.1\nName: {}\nVersion: {version}\nRequested: {specifier}\n",
                specifier.name
            ),
        )?;

        Ok(InstallOutput {
            exit: ExitInfo::SUCCESS,
            stdout: format!("Successfully installed {}-{version}\n", specifier.name),
            stderr: String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn spec(s: &str) -> Specifier {
        s.parse().unwrap()
    }

    #[test]
    fn resolver_is_deterministic() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        MockResolver.resolve_base("tf:19.11", a.path()).unwrap();
        MockResolver.resolve_base("tf:19.11", b.path()).unwrap();
        assert_eq!(
            fs::read(a.path().join("etc/strata-base")).unwrap(),
            fs::read(b.path().join("etc/strata-base")).unwrap()
        );
        assert!(a.path().join(SITE_PACKAGES).is_dir());
    }

    #[test]
    fn install_writes_distribution() {
        let root = tempfile::tempdir().unwrap();
        let installer = MockInstaller::new();
        let out = installer.install(&spec("numpy==1.17"), root.path()).unwrap();
        assert!(out.success());
        let site = root.path().join(SITE_PACKAGES);
        assert!(site.join("numpy/__init__.py").is_file());
        let meta = fs::read_to_string(site.join("numpy-1.17.dist-info/METADATA")).unwrap();
        assert!(meta.contains("Version: 1.17"));
        assert_eq!(installer.install_count(), 1);
    }

    #[test]
    fn upgrade_replaces_dist_info() {
        let root = tempfile::tempdir().unwrap();
        let installer = MockInstaller::new();
        installer.install(&spec("numpy==1.17"), root.path()).unwrap();
        installer.install(&spec("numpy==1.18"), root.path()).unwrap();
        let site = root.path().join(SITE_PACKAGES);
        assert!(!site.join("numpy-1.17.dist-info").exists());
        assert!(site.join("numpy-1.18.dist-info").exists());
    }

    #[test]
    fn unpinned_install_uses_placeholder_version() {
        let root = tempfile::tempdir().unwrap();
        MockInstaller::new()
            .install(&spec("gym>=0.15"), root.path())
            .unwrap();
        assert!(root
            .path()
            .join(SITE_PACKAGES)
            .join("gym-0.0.0.dist-info")
            .is_dir());
    }

    #[test]
    fn fail_on_reports_nonzero_exit() {
        let root = tempfile::tempdir().unwrap();
        let installer = MockInstaller::new().fail_on("gym");
        let out = installer.install(&spec("gym==0.15"), root.path()).unwrap();
        assert!(!out.success());
        assert_eq!(out.exit, ExitInfo::code(1));
        assert!(out.stderr.contains("gym==0.15"));
        assert!(!root.path().join(SITE_PACKAGES).join("gym").exists());
    }

    #[test]
    fn hook_runs_before_install() {
        let seen = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen);
        let installer = MockInstaller::new().with_hook(move |_| flag.store(true, Ordering::SeqCst));
        let root = tempfile::tempdir().unwrap();
        installer.install(&spec("gym"), root.path()).unwrap();
        assert!(seen.load(Ordering::SeqCst));
    }
}
