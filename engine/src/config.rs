use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::util::parse_env_bool;

pub const DRY_RUN_ENV: &str = "BIMLINK_DRY_RUN";
pub const SKIP_CONFIRMATIONS_ENV: &str = "BIMLINK_SKIP_CONFIRMATIONS";

#[derive(Debug, Default, Clone, Deserialize)]
pub struct BimlinkConfig {
    pub safety: Option<SafetyConfig>,
    pub marshal: Option<MarshalConfig>,
    /// Execution limits for tool calls.
    pub tools: Option<ToolsConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct SafetyConfig {
    /// Describe mutating tools instead of running them.
    #[serde(default)]
    pub dry_run: bool,
    /// Approve every tool without prompting.
    #[serde(default)]
    pub skip_confirmations: bool,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct MarshalConfig {
    /// Commands drained per wakeup before the signal is re-raised.
    pub max_commands_per_signal: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ToolsConfig {
    pub max_tool_calls_per_batch: Option<usize>,
    pub max_tool_args_bytes: Option<usize>,
    pub default_timeout_secs: Option<u64>,
    pub max_output_bytes: Option<usize>,
    pub validate_args: Option<bool>,
}

impl BimlinkConfig {
    /// Load `~/.bimlink/config.toml`. A missing file is not an error.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// Apply `BIMLINK_DRY_RUN` / `BIMLINK_SKIP_CONFIRMATIONS` from the process environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut safety = self.safety.take().unwrap_or_default();
        if let Some(value) = env_flag(&lookup, DRY_RUN_ENV) {
            safety.dry_run = value;
        }
        if let Some(value) = env_flag(&lookup, SKIP_CONFIRMATIONS_ENV) {
            safety.skip_confirmations = value;
        }
        self.safety = Some(safety);
        self
    }
}

fn env_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    let parsed = parse_env_bool(&raw);
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "ignoring unrecognised boolean override");
    }
    parsed
}

pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".bimlink").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parses_full_config() {
        let config: BimlinkConfig = toml::from_str(
            r"
            [safety]
            dry_run = true

            [marshal]
            max_commands_per_signal = 4

            [tools]
            max_tool_calls_per_batch = 10
            default_timeout_secs = 5
            validate_args = false
            ",
        )
        .unwrap();
        let safety = config.safety.unwrap();
        assert!(safety.dry_run);
        assert!(!safety.skip_confirmations);
        assert_eq!(config.marshal.unwrap().max_commands_per_signal, Some(4));
        let tools = config.tools.unwrap();
        assert_eq!(tools.max_tool_calls_per_batch, Some(10));
        assert_eq!(tools.default_timeout_secs, Some(5));
        assert_eq!(tools.validate_args, Some(false));
        assert_eq!(tools.max_output_bytes, None);
    }

    #[test]
    fn empty_config_is_all_defaults() {
        let config: BimlinkConfig = toml::from_str("").unwrap();
        assert!(config.safety.is_none());
        assert!(config.marshal.is_none());
        assert!(config.tools.is_none());
    }

    #[test]
    fn load_from_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[safety\ndry_run = ").unwrap();
        let err = BimlinkConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), &path);
    }

    #[test]
    fn load_from_reports_read_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let err = BimlinkConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("missing.toml"));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> =
            HashMap::from([(DRY_RUN_ENV, "yes"), (SKIP_CONFIRMATIONS_ENV, "0")]);
        let config = BimlinkConfig {
            safety: Some(SafetyConfig {
                dry_run: false,
                skip_confirmations: true,
            }),
            ..Default::default()
        }
        .with_overrides(|key| env.get(key).map(ToString::to_string));
        let safety = config.safety.unwrap();
        assert!(safety.dry_run);
        assert!(!safety.skip_confirmations);
    }

    #[test]
    fn unrecognised_override_is_ignored() {
        let config = BimlinkConfig::default().with_overrides(|key| {
            (key == DRY_RUN_ENV).then(|| "sometimes".to_string())
        });
        assert!(!config.safety.unwrap().dry_run);
    }
}
