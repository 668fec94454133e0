//! Resolve configuration into runtime settings.

use std::sync::Arc;
use std::time::Duration;

use crate::config::BimlinkConfig;
use crate::marshal::{DEFAULT_MAX_COMMANDS_PER_SIGNAL, MarshalSettings};
use crate::safety::SafetyFlags;

pub(crate) const DEFAULT_MAX_TOOL_CALLS_PER_BATCH: usize = 32;
pub(crate) const DEFAULT_MAX_TOOL_ARGS_BYTES: usize = 64 * 1024;
pub(crate) const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;
pub(crate) const DEFAULT_MAX_TOOL_OUTPUT_BYTES: usize = 102_400;

/// Per-batch execution limits applied by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolLimits {
    pub max_tool_calls_per_batch: usize,
    pub max_tool_args_bytes: usize,
    pub default_timeout: Duration,
    pub max_output_bytes: usize,
    pub validate_args: bool,
}

impl Default for ToolLimits {
    fn default() -> Self {
        Self {
            max_tool_calls_per_batch: DEFAULT_MAX_TOOL_CALLS_PER_BATCH,
            max_tool_args_bytes: DEFAULT_MAX_TOOL_ARGS_BYTES,
            default_timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
            max_output_bytes: DEFAULT_MAX_TOOL_OUTPUT_BYTES,
            validate_args: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineSettings {
    pub tools: ToolLimits,
    pub marshal: MarshalSettings,
    pub dry_run: bool,
    pub skip_confirmations: bool,
}

impl EngineSettings {
    #[must_use]
    pub fn from_config(config: Option<&BimlinkConfig>) -> Self {
        let tools_cfg = config.and_then(|cfg| cfg.tools.as_ref());
        let safety_cfg = config.and_then(|cfg| cfg.safety.as_ref());

        let tools = ToolLimits {
            max_tool_calls_per_batch: tools_cfg
                .and_then(|cfg| cfg.max_tool_calls_per_batch)
                .unwrap_or(DEFAULT_MAX_TOOL_CALLS_PER_BATCH),
            max_tool_args_bytes: tools_cfg
                .and_then(|cfg| cfg.max_tool_args_bytes)
                .unwrap_or(DEFAULT_MAX_TOOL_ARGS_BYTES),
            default_timeout: Duration::from_secs(
                tools_cfg
                    .and_then(|cfg| cfg.default_timeout_secs)
                    .unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS),
            ),
            max_output_bytes: tools_cfg
                .and_then(|cfg| cfg.max_output_bytes)
                .unwrap_or(DEFAULT_MAX_TOOL_OUTPUT_BYTES),
            validate_args: tools_cfg.and_then(|cfg| cfg.validate_args).unwrap_or(true),
        };

        let marshal = MarshalSettings {
            max_commands_per_signal: config
                .and_then(|cfg| cfg.marshal.as_ref())
                .and_then(|cfg| cfg.max_commands_per_signal)
                .filter(|max| *max > 0)
                .unwrap_or(DEFAULT_MAX_COMMANDS_PER_SIGNAL),
        };

        Self {
            tools,
            marshal,
            dry_run: safety_cfg.is_some_and(|cfg| cfg.dry_run),
            skip_confirmations: safety_cfg.is_some_and(|cfg| cfg.skip_confirmations),
        }
    }

    /// Fresh shared flags seeded from the resolved settings.
    #[must_use]
    pub fn safety_flags(&self) -> Arc<SafetyFlags> {
        Arc::new(SafetyFlags::new(self.dry_run, self.skip_confirmations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MarshalConfig, SafetyConfig, ToolsConfig};

    #[test]
    fn missing_config_yields_defaults() {
        let settings = EngineSettings::from_config(None);
        assert_eq!(settings, EngineSettings::default());
        assert_eq!(settings.tools.max_tool_calls_per_batch, 32);
        assert_eq!(settings.marshal.max_commands_per_signal, 16);
        assert!(settings.tools.validate_args);
    }

    #[test]
    fn config_values_override_defaults() {
        let config = BimlinkConfig {
            safety: Some(SafetyConfig {
                dry_run: true,
                skip_confirmations: false,
            }),
            marshal: Some(MarshalConfig {
                max_commands_per_signal: Some(2),
            }),
            tools: Some(ToolsConfig {
                default_timeout_secs: Some(3),
                validate_args: Some(false),
                ..Default::default()
            }),
        };
        let settings = EngineSettings::from_config(Some(&config));
        assert!(settings.dry_run);
        assert!(!settings.skip_confirmations);
        assert_eq!(settings.marshal.max_commands_per_signal, 2);
        assert_eq!(settings.tools.default_timeout, Duration::from_secs(3));
        assert!(!settings.tools.validate_args);
        assert_eq!(
            settings.tools.max_tool_args_bytes,
            DEFAULT_MAX_TOOL_ARGS_BYTES
        );

        let flags = settings.safety_flags();
        assert!(flags.dry_run());
    }

    #[test]
    fn zero_commands_per_signal_falls_back_to_default() {
        let config = BimlinkConfig {
            marshal: Some(MarshalConfig {
                max_commands_per_signal: Some(0),
            }),
            ..Default::default()
        };
        let settings = EngineSettings::from_config(Some(&config));
        assert_eq!(
            settings.marshal.max_commands_per_signal,
            DEFAULT_MAX_COMMANDS_PER_SIGNAL
        );
    }
}
