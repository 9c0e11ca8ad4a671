use facevault_core::DEFAULT_MATCH_THRESHOLD;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("invalid config file {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
    #[error("match_threshold must be a non-negative finite number, got {0}")]
    InvalidThreshold(f32),
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// SQLite database file. `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
    /// Root of the shared remote directory. `None` disables replication.
    pub remote_dir: Option<PathBuf>,
    /// Maximum descriptor distance accepted as a match.
    pub match_threshold: f32,
}

/// On-disk TOML shape; every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_path: Option<PathBuf>,
    remote_dir: Option<PathBuf>,
    match_threshold: Option<f32>,
    in_memory: Option<bool>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: Some(default_db_path()),
            remote_dir: None,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl StoreConfig {
    /// Fully in-memory store with no remote tier.
    pub fn ephemeral() -> Self {
        Self {
            db_path: None,
            remote_dir: None,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }

    /// Defaults, then the TOML file named by `FACEVAULT_CONFIG` (if set),
    /// then `FACEVAULT_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("FACEVAULT_CONFIG") {
            config = config.merge_file(Path::new(&path))?;
        }
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay the keys present in a TOML file.
    pub fn merge_file(self, path: &Path) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let file: FileConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        self.merge(file)
    }

    fn merge(mut self, file: FileConfig) -> Result<Self, ConfigError> {
        if let Some(db_path) = file.db_path {
            self.db_path = Some(db_path);
        }
        if file.in_memory == Some(true) {
            self.db_path = None;
        }
        if let Some(remote_dir) = file.remote_dir {
            self.remote_dir = Some(remote_dir);
        }
        if let Some(threshold) = file.match_threshold {
            if !valid_threshold(threshold) {
                return Err(ConfigError::InvalidThreshold(threshold));
            }
            self.match_threshold = threshold;
        }
        Ok(self)
    }

    /// Apply `FACEVAULT_*` overrides. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("FACEVAULT_DB_PATH") {
            self.db_path = Some(PathBuf::from(path));
        }
        if var("FACEVAULT_IN_MEMORY").is_some_and(|v| v != "0") {
            self.db_path = None;
        }
        if let Some(dir) = var("FACEVAULT_REMOTE_DIR").filter(|d| !d.is_empty()) {
            self.remote_dir = Some(PathBuf::from(dir));
        }
        if let Some(threshold) = var("FACEVAULT_MATCH_THRESHOLD")
            .and_then(|v| v.parse::<f32>().ok())
            .filter(|&t| valid_threshold(t))
        {
            self.match_threshold = threshold;
        }
    }
}

fn valid_threshold(threshold: f32) -> bool {
    threshold.is_finite() && threshold >= 0.0
}

fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facevault")
        .join("biometrics.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.match_threshold, 0.45);
        assert!(config.remote_dir.is_none());
        assert!(config.db_path.unwrap().ends_with("facevault/biometrics.db"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = StoreConfig::default();
        config.apply_overrides(vars(&[
            ("FACEVAULT_DB_PATH", "/var/lib/facevault/db.sqlite"),
            ("FACEVAULT_REMOTE_DIR", "/mnt/shared"),
            ("FACEVAULT_MATCH_THRESHOLD", "0.5"),
        ]));
        assert_eq!(config.db_path, Some(PathBuf::from("/var/lib/facevault/db.sqlite")));
        assert_eq!(config.remote_dir, Some(PathBuf::from("/mnt/shared")));
        assert_eq!(config.match_threshold, 0.5);
    }

    #[test]
    fn test_bad_env_values_keep_defaults() {
        let mut config = StoreConfig::default();
        config.apply_overrides(vars(&[
            ("FACEVAULT_MATCH_THRESHOLD", "loose"),
            ("FACEVAULT_REMOTE_DIR", ""),
        ]));
        assert_eq!(config.match_threshold, DEFAULT_MATCH_THRESHOLD);
        assert!(config.remote_dir.is_none());

        config.apply_overrides(vars(&[("FACEVAULT_MATCH_THRESHOLD", "-1")]));
        assert_eq!(config.match_threshold, DEFAULT_MATCH_THRESHOLD);
    }

    #[test]
    fn test_in_memory_override() {
        let mut config = StoreConfig::default();
        config.apply_overrides(vars(&[("FACEVAULT_IN_MEMORY", "1")]));
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facevault.toml");
        std::fs::write(
            &path,
            "db_path = \"/data/fv.db\"\nremote_dir = \"/mnt/fv\"\nmatch_threshold = 0.4\n",
        )
        .unwrap();

        let config = StoreConfig::ephemeral().merge_file(&path).unwrap();
        assert_eq!(config.db_path, Some(PathBuf::from("/data/fv.db")));
        assert_eq!(config.remote_dir, Some(PathBuf::from("/mnt/fv")));
        assert_eq!(config.match_threshold, 0.4);
    }

    #[test]
    fn test_toml_rejects_unknown_keys_and_bad_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facevault.toml");

        std::fs::write(&path, "db = \"/x\"\n").unwrap();
        assert!(matches!(
            StoreConfig::ephemeral().merge_file(&path),
            Err(ConfigError::Parse(..))
        ));

        std::fs::write(&path, "match_threshold = -0.1\n").unwrap();
        assert!(matches!(
            StoreConfig::ephemeral().merge_file(&path),
            Err(ConfigError::InvalidThreshold(_))
        ));
    }
}
