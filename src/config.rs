//! Configuration management module
//!
//! Defaults, then an optional config file, then `RN_BRIDGE__*` environment
//! variables (e.g. `RN_BRIDGE__PRELUDE_LINE_COUNT=11`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::errors::BridgeResult;

/// Maps a directory as it appears in source maps (`alias`) to the absolute
/// directory on disk the client uses (`path`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMapAlias {
    pub alias: String,
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Lines injected ahead of the entry bundle that its source map does not describe.
    pub prelude_line_count: u32,
    pub source_map_aliases: Vec<SourceMapAlias>,
    pub lines_start_at1: bool,
    pub columns_start_at1: bool,
    pub command_timeout_ms: Option<u64>,
    pub source_map_fetch_timeout_ms: u64,
    pub event_buffer: usize,
    pub log_level: String,
    /// Where finished CPU profiles are written; the system temp dir when unset.
    pub profile_dir: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            prelude_line_count: 0,
            source_map_aliases: Vec::new(),
            lines_start_at1: true,
            columns_start_at1: true,
            command_timeout_ms: Some(10_000),
            source_map_fetch_timeout_ms: 5_000,
            event_buffer: 256,
            log_level: "info".to_string(),
            profile_dir: None,
        }
    }
}

impl BridgeConfig {
    pub fn load(path: Option<&Path>) -> BridgeResult<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        let loaded = builder
            .add_source(
                Environment::with_prefix("RN_BRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<BridgeConfig>()?;
        Ok(loaded)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    pub fn source_map_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.source_map_fetch_timeout_ms)
    }

    pub fn profile_dir(&self) -> PathBuf {
        self.profile_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};
    use tempfile::tempdir;

    #[test]
    fn loads_file_over_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        fs::write(
            &path,
            r#"
log_level = "debug"
columns_start_at1 = false

[[source_map_aliases]]
alias = "/app"
path = "/home/dev/project"
"#,
        )
        .unwrap();

        let cfg = BridgeConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert!(!cfg.columns_start_at1);
        assert!(cfg.lines_start_at1);
        assert_eq!(
            cfg.source_map_aliases,
            vec![SourceMapAlias {
                alias: "/app".into(),
                path: "/home/dev/project".into()
            }]
        );
        assert_eq!(cfg.source_map_fetch_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let cfg = BridgeConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert!(cfg.source_map_aliases.is_empty());
        assert_eq!(cfg.command_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn environment_overrides_prelude_lines() {
        let original = env::var("RN_BRIDGE__PRELUDE_LINE_COUNT").ok();
        env::set_var("RN_BRIDGE__PRELUDE_LINE_COUNT", "11");
        let cfg = BridgeConfig::load(None);
        match original {
            Some(value) => env::set_var("RN_BRIDGE__PRELUDE_LINE_COUNT", value),
            None => env::remove_var("RN_BRIDGE__PRELUDE_LINE_COUNT"),
        }
        assert_eq!(cfg.unwrap().prelude_line_count, 11);
    }
}
