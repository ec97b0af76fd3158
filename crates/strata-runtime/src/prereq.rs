use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn pip_works(python: &str) -> bool {
    Command::new(python)
        .args(["-m", "pip", "--version"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn user_namespaces_work() -> bool {
    Command::new("unshare")
        .args(["--user", "--map-root-user", "--fork", "true"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check prerequisites for the pip backend using interpreter `python`.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_pip_prereqs(python: &str) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_exists(python) {
        missing.push(MissingPrereq {
            name: python.to_owned(),
            purpose: "running the package installer",
            install_hint:
                "zypper install python3 | apt install python3 | dnf install python3 | pacman -S python",
        });
    } else if !pip_works(python) {
        missing.push(MissingPrereq {
            name: format!("{python} -m pip"),
            purpose: "installing requirements into layers",
            install_hint: "python3 -m ensurepip --upgrade | apt install python3-pip",
        });
    }

    if !user_namespaces_work() {
        missing.push(MissingPrereq {
            name: "unshare --user".to_owned(),
            purpose: "running a base's own interpreter inside the build overlay",
            install_hint: "install util-linux and enable unprivileged user namespaces \
                 (sysctl kernel.unprivileged_userns_clone=1)",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str(
        "\nstrata needs these tools to build layers with the pip backend \
         (set STRATA_SKIP_PREREQS=1 to skip this check).",
    );
    msg
}
