use crate::types::ManifestHash;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Source name used for manifests parsed from an in-memory string.
pub const INLINE_SOURCE: &str = "<inline>";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("failed to read manifest {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest {}:{line}: '{text}': {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        text: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VersionOp {
    #[serde(rename = "===")]
    Arbitrary,
    #[serde(rename = "~=")]
    Compatible,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "<=")]
    LessEqual,
    #[serde(rename = ">=")]
    GreaterEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = ">")]
    Greater,
}

impl VersionOp {
    // Longest operators first so prefix matching is unambiguous.
    const ALL: [VersionOp; 8] = [
        VersionOp::Arbitrary,
        VersionOp::Compatible,
        VersionOp::Equal,
        VersionOp::NotEqual,
        VersionOp::LessEqual,
        VersionOp::GreaterEqual,
        VersionOp::Less,
        VersionOp::Greater,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VersionOp::Arbitrary => "===",
            VersionOp::Compatible => "~=",
            VersionOp::Equal => "==",
            VersionOp::NotEqual => "!=",
            VersionOp::LessEqual => "<=",
            VersionOp::GreaterEqual => ">=",
            VersionOp::Less => "<",
            VersionOp::Greater => ">",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionConstraint {
    pub op: VersionOp,
    pub version: String,
}

/// One package requirement: `name[extras]<constraints>; marker`.
///
/// Names and extras are normalized (lowercase, runs of `-_.` collapsed to
/// `-`); constraint order is preserved as written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Specifier {
    pub name: String,
    pub extras: Vec<String>,
    pub constraints: Vec<VersionConstraint>,
    pub marker: Option<String>,
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        for (i, c) in self.constraints.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}{}", c.op.as_str(), c.version)?;
        }
        if let Some(ref marker) = self.marker {
            write!(f, "; {marker}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Specifier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_specifier(s)
    }
}

/// An ordered, canonicalized dependency manifest.
///
/// Immutable once loaded. The hash covers only the canonical specifier text,
/// so whitespace and comment edits do not change it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    source: PathBuf,
    specifiers: Vec<Specifier>,
    hash: ManifestHash,
}

impl Manifest {
    pub fn new(source: impl Into<PathBuf>, specifiers: Vec<Specifier>) -> Self {
        let hash = ManifestHash::new(
            blake3::hash(canonical_text(&specifiers).as_bytes())
                .to_hex()
                .to_string(),
        );
        Self {
            source: source.into(),
            specifiers,
            hash,
        }
    }

    #[inline]
    pub fn source(&self) -> &Path {
        &self.source
    }

    #[inline]
    pub fn specifiers(&self) -> &[Specifier] {
        &self.specifiers
    }

    #[inline]
    pub fn hash(&self) -> &ManifestHash {
        &self.hash
    }

    pub fn is_empty(&self) -> bool {
        self.specifiers.is_empty()
    }

    /// One specifier per line, each `\n`-terminated. This is what gets hashed.
    pub fn canonical_text(&self) -> String {
        canonical_text(&self.specifiers)
    }
}

fn canonical_text(specifiers: &[Specifier]) -> String {
    let mut out = String::new();
    for spec in specifiers {
        out.push_str(&spec.to_string());
        out.push('\n');
    }
    out
}

pub fn parse_manifest_str(input: &str) -> Result<Manifest, ManifestError> {
    parse_manifest(Path::new(INLINE_SOURCE), input)
}

/// Parse manifest text, attributing errors to `source`.
pub fn parse_manifest(source: &Path, input: &str) -> Result<Manifest, ManifestError> {
    let mut specifiers = Vec::new();
    for (line, text) in logical_lines(input) {
        let cleaned = strip_comment(&text).trim().to_owned();
        if cleaned.is_empty() {
            continue;
        }
        let spec = parse_specifier(&cleaned).map_err(|reason| ManifestError::Parse {
            path: source.to_path_buf(),
            line,
            text: text.trim().to_owned(),
            reason,
        })?;
        specifiers.push(spec);
    }
    Ok(Manifest::new(source, specifiers))
}

pub fn load_manifest(path: impl AsRef<Path>) -> Result<Manifest, ManifestError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ManifestError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            ManifestError::Io {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;
    parse_manifest(path, &content)
}

/// Load manifests in the given order. Fails on the first missing or malformed one.
pub fn load_manifests<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Manifest>, ManifestError> {
    paths.iter().map(load_manifest).collect()
}

/// Join `\`-continued physical lines. Yields (1-based start line, text).
fn logical_lines(input: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut pending: Option<(usize, String)> = None;
    for (idx, raw) in input.lines().enumerate() {
        let (start, mut buf) = pending.take().unwrap_or((idx + 1, String::new()));
        if let Some(head) = raw.strip_suffix('\\') {
            buf.push_str(head);
            buf.push(' ');
            pending = Some((start, buf));
        } else {
            buf.push_str(raw);
            out.push((start, buf));
        }
    }
    if let Some(last) = pending {
        out.push(last);
    }
    out
}

/// `#` starts a comment at line start or after whitespace.
fn strip_comment(line: &str) -> &str {
    let mut prev_ws = true;
    for (i, c) in line.char_indices() {
        if c == '#' && prev_ws {
            return &line[..i];
        }
        prev_ws = c.is_whitespace();
    }
    line
}

fn parse_specifier(text: &str) -> Result<Specifier, String> {
    let (req, marker) = match text.split_once(';') {
        Some((req, marker)) => {
            let marker = marker.split_whitespace().collect::<Vec<_>>().join(" ");
            if marker.is_empty() {
                return Err("empty environment marker after ';'".to_owned());
            }
            (req.trim(), Some(marker))
        }
        None => (text.trim(), None),
    };

    if req.starts_with('-') {
        return Err("pip options are not supported in manifests".to_owned());
    }
    if req.contains('@') || req.contains("://") || req.starts_with('.') || req.contains('/') {
        return Err("direct URL and path references are not supported".to_owned());
    }

    let name_end = req
        .find(|c: char| !is_name_char(c))
        .unwrap_or(req.len());
    let name = normalize_name(&req[..name_end])?;
    let mut rest = req[name_end..].trim_start();

    let mut extras = Vec::new();
    if let Some(after) = rest.strip_prefix('[') {
        let Some(close) = after.find(']') else {
            return Err("unterminated extras list".to_owned());
        };
        for extra in after[..close].split(',') {
            let extra = extra.trim();
            if !extra.is_empty() {
                extras.push(normalize_name(extra)?);
            }
        }
        extras.sort();
        extras.dedup();
        rest = after[close + 1..].trim_start();
    }

    if let Some(inner) = rest.strip_prefix('(') {
        let Some(inner) = inner.trim_end().strip_suffix(')') else {
            return Err("unbalanced parenthesis around version constraints".to_owned());
        };
        rest = inner;
    }

    let constraints = if rest.trim().is_empty() {
        Vec::new()
    } else {
        rest.split(',')
            .map(parse_constraint)
            .collect::<Result<Vec<_>, _>>()?
    };

    Ok(Specifier {
        name,
        extras,
        constraints,
        marker,
    })
}

fn parse_constraint(raw: &str) -> Result<VersionConstraint, String> {
    let raw = raw.trim();
    let Some(op) = VersionOp::ALL
        .into_iter()
        .find(|op| raw.starts_with(op.as_str()))
    else {
        return Err(format!("expected a version operator, found '{raw}'"));
    };
    let version = raw[op.as_str().len()..].trim();
    if version.is_empty() {
        return Err(format!("missing version after '{}'", op.as_str()));
    }
    let valid = if op == VersionOp::Arbitrary {
        !version.contains(char::is_whitespace)
    } else {
        version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '*' | '+' | '!' | '_' | '-'))
    };
    if !valid {
        return Err(format!("invalid version '{version}'"));
    }
    Ok(VersionConstraint {
        op,
        version: version.to_owned(),
    })
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// PEP 503 style: lowercase, runs of `-_.` collapse to a single `-`.
fn normalize_name(raw: &str) -> Result<String, String> {
    let valid = !raw.is_empty()
        && raw.chars().all(is_name_char)
        && raw.starts_with(|c: char| c.is_ascii_alphanumeric())
        && raw.ends_with(|c: char| c.is_ascii_alphanumeric());
    if !valid {
        return Err(format!("invalid package name '{raw}'"));
    }
    let mut out = String::with_capacity(raw.len());
    let mut in_sep = false;
    for c in raw.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_sep {
                out.push('-');
            }
            in_sep = true;
        } else {
            out.push(c.to_ascii_lowercase());
            in_sep = false;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pinned_and_bare_specifiers() {
        let m = parse_manifest_str("numpy==1.17\ngym\n").unwrap();
        assert_eq!(m.specifiers().len(), 2);
        assert_eq!(m.specifiers()[0].name, "numpy");
        assert_eq!(m.specifiers()[0].constraints[0].op, VersionOp::Equal);
        assert_eq!(m.specifiers()[0].constraints[0].version, "1.17");
        assert!(m.specifiers()[1].constraints.is_empty());
    }

    #[test]
    fn preserves_manifest_order() {
        let m = parse_manifest_str("zeta\nalpha\nmid\n").unwrap();
        let names: Vec<_> = m.specifiers().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let m = parse_manifest_str(
            "# general deps\n\n   \nnumpy==1.17  # pinned for tf\n\t# indented comment\n",
        )
        .unwrap();
        assert_eq!(m.specifiers().len(), 1);
        assert_eq!(m.canonical_text(), "numpy==1.17\n");
    }

    #[test]
    fn hash_ignores_whitespace_and_comments() {
        let a = parse_manifest_str("numpy==1.17\ngym==0.15\n").unwrap();
        let b = parse_manifest_str("# header\n  numpy == 1.17\n\ngym==0.15   # rl\n").unwrap();
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn hash_is_order_sensitive() {
        let a = parse_manifest_str("numpy\ngym\n").unwrap();
        let b = parse_manifest_str("gym\nnumpy\n").unwrap();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn hash_changes_with_version() {
        let a = parse_manifest_str("gym==0.15\n").unwrap();
        let b = parse_manifest_str("gym==0.16\n").unwrap();
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn normalizes_names_and_extras() {
        let m = parse_manifest_str("Py_Yaml[Security , CLI]>=5.1,<6\n").unwrap();
        let spec = &m.specifiers()[0];
        assert_eq!(spec.name, "py-yaml");
        assert_eq!(spec.extras, ["cli", "security"]);
        assert_eq!(spec.to_string(), "py-yaml[cli,security]>=5.1,<6");
    }

    #[test]
    fn parses_parenthesized_constraints_and_markers() {
        let m = parse_manifest_str("tensorflow (>=1.14, <2.0) ; python_version < \"3.8\"\n")
            .unwrap();
        let spec = &m.specifiers()[0];
        assert_eq!(spec.constraints.len(), 2);
        assert_eq!(spec.marker.as_deref(), Some("python_version < \"3.8\""));
        assert_eq!(
            spec.to_string(),
            "tensorflow>=1.14,<2.0; python_version < \"3.8\""
        );
    }

    #[test]
    fn joins_line_continuations() {
        let m = parse_manifest_str("gym>=0.15,\\\n    <0.16\nnumpy\n").unwrap();
        assert_eq!(m.specifiers().len(), 2);
        assert_eq!(m.specifiers()[0].to_string(), "gym>=0.15,<0.16");
    }

    #[test]
    fn empty_manifest_is_valid() {
        let m = parse_manifest_str("# nothing here\n\n").unwrap();
        assert!(m.is_empty());
        assert_eq!(m.canonical_text(), "");
    }

    #[test]
    fn reports_line_number_and_text() {
        let err = parse_manifest_str("numpy==1.17\n\ngym=0.15\n").unwrap_err();
        match err {
            ManifestError::Parse { line, text, .. } => {
                assert_eq!(line, 3);
                assert_eq!(text, "gym=0.15");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_version() {
        assert!(parse_manifest_str("numpy==\n").is_err());
    }

    #[test]
    fn rejects_pip_options() {
        let err = parse_manifest_str("-r other.txt\n").unwrap_err();
        assert!(err.to_string().contains("pip options"));
    }

    #[test]
    fn rejects_url_requirements() {
        assert!(parse_manifest_str("pkg @ https://example.invalid/pkg.whl\n").is_err());
        assert!(parse_manifest_str("./local/pkg\n").is_err());
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(parse_manifest_str("-numpy\n").is_err());
        assert!(parse_manifest_str("numpy_\n").is_err());
        assert!(parse_manifest_str("[extra]\n").is_err());
    }

    #[test]
    fn rejects_unterminated_extras() {
        assert!(parse_manifest_str("numpy[dev\n").is_err());
    }

    #[test]
    fn specifier_from_str() {
        let spec: Specifier = "Gym ~= 0.15".parse().unwrap();
        assert_eq!(spec.to_string(), "gym~=0.15");
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_manifest(dir.path().join("absent.txt")).unwrap_err();
        assert!(matches!(err, ManifestError::NotFound { .. }));
    }

    #[test]
    fn load_attributes_errors_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requirements.txt");
        fs::write(&path, "numpy\nnot a spec!\n").unwrap();
        let err = load_manifest(&path).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("requirements.txt:2"), "{msg}");
    }

    #[test]
    fn rereading_identical_bytes_gives_identical_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requirements.txt");
        fs::write(&path, "numpy==1.17\ngym==0.15\n").unwrap();
        let a = load_manifest(&path).unwrap();
        let b = load_manifest(&path).unwrap();
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn load_manifests_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let general = dir.path().join("general.txt");
        let control = dir.path().join("control.txt");
        fs::write(&general, "numpy\n").unwrap();
        fs::write(&control, "gym\n").unwrap();
        let loaded = load_manifests(&[&general, &control]).unwrap();
        assert_eq!(loaded[0].source(), general.as_path());
        assert_eq!(loaded[1].source(), control.as_path());
    }
}
