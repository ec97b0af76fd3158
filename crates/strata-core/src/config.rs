use crate::CoreError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_STORE: &str = "~/.local/share/strata";

/// Settings as written in `config.toml`; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    store: Option<String>,
    cache_budget: Option<String>,
    bases: Option<String>,
}

/// Resolved configuration: config file, then environment.
///
/// Command-line flags are applied on top by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrataConfig {
    pub store: PathBuf,
    /// Cache size budget in bytes; `None` means unbounded.
    pub cache_budget: Option<u64>,
    /// Directory of base root filesystems for the pip backend.
    pub bases: PathBuf,
}

impl StrataConfig {
    /// Load `path`, or `~/.config/strata/config.toml` if it exists, then
    /// apply `STRATA_STORE`, `STRATA_CACHE_BUDGET`, and `STRATA_BASES`.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        let file = match path {
            Some(path) => Some(read_config_file(path)?),
            None => match default_config_path() {
                Some(path) if path.is_file() => Some(read_config_file(&path)?),
                _ => None,
            },
        };
        Self::resolve(file.unwrap_or_default(), |key| std::env::var(key).ok())
    }

    /// Parse config file text without consulting the environment.
    pub fn from_toml(input: &str) -> Result<Self, CoreError> {
        Self::resolve(parse_config(input)?, |_| None)
    }

    fn resolve(
        file: ConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CoreError> {
        let store = env("STRATA_STORE")
            .or(file.store)
            .unwrap_or_else(|| DEFAULT_STORE.to_owned());
        let store = expand_tilde(&store);

        let cache_budget = match env("STRATA_CACHE_BUDGET").or(file.cache_budget) {
            Some(raw) if !raw.trim().is_empty() => Some(parse_size(&raw)?),
            _ => None,
        };

        let bases = env("STRATA_BASES")
            .or(file.bases)
            .map_or_else(|| store.join("bases"), |b| expand_tilde(&b));

        Ok(Self {
            store,
            cache_budget,
            bases,
        })
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, CoreError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CoreError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    parse_config(&content)
        .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
}

fn parse_config(input: &str) -> Result<ConfigFile, CoreError> {
    toml::from_str(input).map_err(|e| CoreError::Config(format!("invalid config: {e}")))
}

fn default_config_path() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".config/strata/config.toml"))
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Parse a human-readable size such as `512M`, `20G`, or `1.5GiB`.
///
/// Suffixes are binary multiples; a bare number is bytes.
pub fn parse_size(input: &str) -> Result<u64, CoreError> {
    let invalid = || CoreError::Config(format!("invalid size '{input}'"));
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() {
        return Err(invalid());
    }

    let shift = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        "T" | "TB" | "TIB" => 40,
        _ => return Err(invalid()),
    };

    if let Ok(whole) = number.parse::<u64>() {
        return whole.checked_shl(shift).filter(|v| v >> shift == whole).ok_or_else(invalid);
    }
    let value: f64 = number.parse().map_err(|_| invalid())?;
    let bytes = value * f64::from(1u32 << (shift / 2)) * f64::from(1u32 << (shift - shift / 2));
    if !bytes.is_finite() || bytes < 0.0 || bytes >= u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("512M").unwrap(), 512 << 20);
        assert_eq!(parse_size("20G").unwrap(), 20 << 30);
        assert_eq!(parse_size("20gib").unwrap(), 20 << 30);
        assert_eq!(parse_size(" 1T ").unwrap(), 1 << 40);
        assert_eq!(parse_size("1.5G").unwrap(), 3 << 29);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        for bad in ["", "G", "12X", "-5M", "1.2.3G", "99999999999999999999T"] {
            assert!(parse_size(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn from_toml_reads_all_keys() {
        let config = StrataConfig::from_toml(
            r#"
store = "/var/cache/strata"
cache_budget = "20G"
bases = "/srv/bases"
"#,
        )
        .unwrap();
        assert_eq!(config.store, PathBuf::from("/var/cache/strata"));
        assert_eq!(config.cache_budget, Some(20 << 30));
        assert_eq!(config.bases, PathBuf::from("/srv/bases"));
    }

    #[test]
    fn bases_default_to_store_subdir() {
        let config = StrataConfig::from_toml("store = \"/tmp/strata-store\"\n").unwrap();
        assert_eq!(config.bases, PathBuf::from("/tmp/strata-store/bases"));
        assert_eq!(config.cache_budget, None);
    }

    #[test]
    fn environment_overrides_file() {
        let file = parse_config("store = \"/from/file\"\ncache_budget = \"1G\"\n").unwrap();
        let config = StrataConfig::resolve(file, |key| match key {
            "STRATA_STORE" => Some("/from/env".to_owned()),
            "STRATA_CACHE_BUDGET" => Some("2G".to_owned()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.store, PathBuf::from("/from/env"));
        assert_eq!(config.cache_budget, Some(2 << 30));
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(matches!(
            StrataConfig::from_toml("budget = \"1G\"\n"),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn invalid_budget_is_config_error() {
        assert!(matches!(
            StrataConfig::from_toml("cache_budget = \"lots\"\n"),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StrataConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
