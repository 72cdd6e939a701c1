//! Runner configuration
//!
//! ## Priority Order (highest to lowest)
//!
//! 1. CLI flags (applied by the binary on top of the loaded config)
//! 2. Environment variables (`TRAKT_INPUT_DIR`, `TRAKT_OUTPUT_DIR`, ...)
//! 3. Config file (`--config PATH`, or `trakt.toml` in the working directory)
//! 4. Defaults

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::artifact::DEFAULT_KIND;
use crate::error::TraktError;

/// Config file picked up from the working directory when present
pub const DEFAULT_CONFIG_FILE: &str = "trakt.toml";

pub const DEFAULT_CHUNK_SIZE: usize = 50_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    /// Root for relative input uris
    pub input_dir: PathBuf,

    /// Root for relative output uris
    pub output_dir: PathBuf,

    /// Output kind when an output declares none
    pub output_kind: String,

    /// Rows per chunk in stream mode
    pub stream_chunk_size: usize,

    /// Defaults to `<output_dir>/manifest.json`
    pub manifest_path: Option<PathBuf>,

    pub strict: bool,

    /// Artifact name -> source spec, replacing the declared uri
    pub input_overrides: IndexMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("."),
            output_dir: PathBuf::from("outputs"),
            output_kind: DEFAULT_KIND.to_string(),
            stream_chunk_size: DEFAULT_CHUNK_SIZE,
            manifest_path: None,
            strict: false,
            input_overrides: IndexMap::new(),
        }
    }
}

fn config_error(reason: impl Into<String>) -> TraktError {
    TraktError::Config {
        reason: reason.into(),
    }
}

impl RunnerConfig {
    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self, TraktError> {
        let content = fs::read_to_string(path).map_err(|e| {
            config_error(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, TraktError> {
        let config: RunnerConfig = toml::from_str(content)
            .map_err(|e| config_error(format!("Failed to parse config file: {e}")))?;
        config.check()?;
        Ok(config)
    }

    /// Load the explicit file, else `trakt.toml` in `cwd` if present, else defaults
    pub fn load(explicit: Option<&Path>, cwd: &Path) -> Result<Self, TraktError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let candidate = cwd.join(DEFAULT_CONFIG_FILE);
                if candidate.is_file() {
                    Self::from_file(&candidate)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Merge `TRAKT_*` environment variables
    pub fn with_env(self) -> Result<Self, TraktError> {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    /// Merge variables from any lookup (tests pass a map here)
    pub fn with_env_from<F>(mut self, lookup: F) -> Result<Self, TraktError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = get("TRAKT_INPUT_DIR") {
            self.input_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("TRAKT_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(dir);
        }
        if let Some(kind) = get("TRAKT_OUTPUT_KIND") {
            self.output_kind = kind.trim().to_ascii_lowercase();
        }
        if let Some(size) = get("TRAKT_STREAM_CHUNK_SIZE") {
            self.stream_chunk_size = size.trim().parse().map_err(|_| {
                config_error(format!("TRAKT_STREAM_CHUNK_SIZE must be a positive integer, got '{size}'"))
            })?;
        }
        if let Some(path) = get("TRAKT_MANIFEST_PATH") {
            self.manifest_path = Some(PathBuf::from(path));
        }
        if let Some(flag) = get("TRAKT_STRICT") {
            self.strict = parse_flag(&flag)
                .ok_or_else(|| config_error(format!("TRAKT_STRICT must be a boolean, got '{flag}'")))?;
        }

        self.check()?;
        Ok(self)
    }

    pub fn check(&self) -> Result<(), TraktError> {
        if self.stream_chunk_size == 0 {
            return Err(config_error("stream_chunk_size must be at least 1"));
        }
        if self.output_kind.trim().is_empty() {
            return Err(config_error("output_kind cannot be empty"));
        }
        Ok(())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.manifest_path
            .clone()
            .unwrap_or_else(|| self.output_dir.join("manifest.json"))
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.output_kind, "csv");
        assert_eq!(config.stream_chunk_size, 50_000);
        assert_eq!(config.manifest_path(), PathBuf::from("outputs/manifest.json"));
    }

    #[test]
    fn test_toml_partial_file() {
        let config = RunnerConfig::from_toml_str(
            "output_dir = \"build\"\nstream_chunk_size = 10\n[input_overrides]\norders = \"fixtures/*.csv\"\n",
        )
        .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("build"));
        assert_eq!(config.stream_chunk_size, 10);
        assert_eq!(config.input_overrides["orders"], "fixtures/*.csv");
        assert_eq!(config.input_dir, PathBuf::from("."));
        assert_eq!(config.manifest_path(), PathBuf::from("build/manifest.json"));
    }

    #[test]
    fn test_toml_rejects_unknown_keys_and_zero_chunks() {
        assert!(RunnerConfig::from_toml_str("outptu_dir = \"x\"").is_err());
        assert!(RunnerConfig::from_toml_str("stream_chunk_size = 0").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let config = RunnerConfig::from_toml_str("output_dir = \"build\"\nstrict = false\n")
            .unwrap()
            .with_env_from(env(&[
                ("TRAKT_OUTPUT_DIR", "env-out"),
                ("TRAKT_STRICT", "yes"),
                ("TRAKT_STREAM_CHUNK_SIZE", "7"),
                ("TRAKT_INPUT_DIR", ""),
            ]))
            .unwrap();
        assert_eq!(config.output_dir, PathBuf::from("env-out"));
        assert!(config.strict);
        assert_eq!(config.stream_chunk_size, 7);
        assert_eq!(config.input_dir, PathBuf::from("."));
    }

    #[test]
    fn test_env_rejects_bad_values() {
        let bad_size = RunnerConfig::default().with_env_from(env(&[("TRAKT_STREAM_CHUNK_SIZE", "lots")]));
        assert!(bad_size.is_err());
        let bad_flag = RunnerConfig::default().with_env_from(env(&[("TRAKT_STRICT", "maybe")]));
        assert!(bad_flag.is_err());
    }

    #[test]
    fn test_load_picks_up_working_directory_file() {
        let dir = TempDir::new().unwrap();
        assert_eq!(RunnerConfig::load(None, dir.path()).unwrap(), RunnerConfig::default());
        std::fs::write(dir.path().join(DEFAULT_CONFIG_FILE), "output_kind = \"CSV\"\n").unwrap();
        let config = RunnerConfig::load(None, dir.path()).unwrap();
        assert_eq!(config.output_kind, "CSV");
        assert!(RunnerConfig::load(Some(&dir.path().join("missing.toml")), dir.path()).is_err());
    }
}
