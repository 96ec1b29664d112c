//! Engine configuration.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::EngineResult;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Engine configuration loaded from environment variables.
///
/// Environment variables are prefixed with `SOP_`:
/// - `SOP_JOURNAL_DIR`: Directory of the file journal (optional)
/// - `SOP_SYNC_WRITES`: fsync each journal append (default: true)
/// - `SOP_SLOW_REPLAY_MS`: Replay time that triggers a warning (default: 100)
/// - `SOP_LOG_FORMAT`: `pretty` or `json` (default: pretty)
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Journal directory. Executions stay in memory when unset.
    #[serde(default)]
    pub journal_dir: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub sync_writes: bool,

    #[serde(default = "default_slow_replay_ms")]
    pub slow_replay_ms: u64,

    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_true() -> bool {
    true
}

fn default_slow_replay_ms() -> u64 {
    100
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> EngineResult<Self> {
        Ok(envy::prefixed("SOP_").from_env::<EngineConfig>()?)
    }

    /// Load configuration from key/value pairs, keys carrying the `SOP_`
    /// prefix.
    pub fn from_iter<I>(vars: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::prefixed("SOP_").from_iter::<_, EngineConfig>(vars)?)
    }

    pub fn with_journal_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.journal_dir = Some(dir.into());
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            journal_dir: None,
            sync_writes: default_true(),
            slow_replay_ms: default_slow_replay_ms(),
            log_format: LogFormat::Pretty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert!(config.journal_dir.is_none());
        assert!(config.sync_writes);
        assert_eq!(config.slow_replay_ms, 100);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_defaults_from_empty_env() {
        let config = EngineConfig::from_iter(Vec::new()).unwrap();
        assert!(config.sync_writes);
        assert_eq!(config.slow_replay_ms, 100);
    }

    #[test]
    fn test_from_vars() {
        let config = EngineConfig::from_iter(vars(&[
            ("SOP_JOURNAL_DIR", "/var/lib/sop"),
            ("SOP_SYNC_WRITES", "false"),
            ("SOP_SLOW_REPLAY_MS", "250"),
            ("SOP_LOG_FORMAT", "json"),
            ("OTHER_VAR", "ignored"),
        ]))
        .unwrap();
        assert_eq!(config.journal_dir, Some(PathBuf::from("/var/lib/sop")));
        assert!(!config.sync_writes);
        assert_eq!(config.slow_replay_ms, 250);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_bad_value_is_config_error() {
        let err = EngineConfig::from_iter(vars(&[("SOP_SLOW_REPLAY_MS", "soon")])).unwrap_err();
        assert!(matches!(err, crate::EngineError::Config(_)));
    }
}
