//! Scanner configuration
//!
//! Merges command-line overrides with the TOML bootstrap config and the
//! compiled defaults into one resolved [`ScannerConfig`].

use std::path::PathBuf;

use rollscan_common::config::{
    clamp_history_cap, CompiledDefaults, DataFolderResolver, DeliveryConfig, LoggingConfig,
    TomlConfig,
};

use crate::{Error, Result};

/// Default tracing filter when neither RUST_LOG nor a level is configured
pub const DEFAULT_LOG_FILTER: &str = "rollscan_sc=info,rollscan=info";

/// Values given on the command line (or through their env fallbacks)
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub data_folder: Option<PathBuf>,
    pub endpoint_url: Option<String>,
    pub operator: Option<String>,
    pub history_cap: Option<usize>,
    pub log_level: Option<String>,
}

/// Fully resolved configuration
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub data_folder: PathBuf,
    pub endpoint_url: Option<String>,
    pub operator: Option<String>,
    pub history_cap: usize,
    pub delivery: DeliveryConfig,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl ScannerConfig {
    pub fn resolve(overrides: Overrides, toml: &TomlConfig) -> Self {
        let defaults = CompiledDefaults::for_current_platform();

        let data_folder = DataFolderResolver::new("rollscan")
            .with_cli_arg(overrides.data_folder)
            .with_toml(toml)
            .resolve();

        let endpoint_url =
            non_blank(overrides.endpoint_url).or_else(|| non_blank(toml.endpoint_url.clone()));
        let operator = non_blank(overrides.operator).or_else(|| non_blank(toml.operator.clone()));

        let history_cap = clamp_history_cap(
            overrides
                .history_cap
                .or(toml.history_cap)
                .unwrap_or(defaults.history_cap),
        );

        let log_level = overrides
            .log_level
            .unwrap_or_else(|| toml.logging.level.clone());

        Self {
            data_folder,
            endpoint_url,
            operator,
            history_cap,
            delivery: toml.delivery.clone(),
            log_level,
            log_file: toml.logging.file.clone().or(defaults.log_file),
        }
    }

    /// Endpoint for commands that talk to the remote
    pub fn require_endpoint(&self) -> Result<&str> {
        self.endpoint_url.as_deref().ok_or_else(|| {
            Error::Config(
                "No endpoint configured (use --endpoint, ROLLSCAN_ENDPOINT or endpoint_url)"
                    .to_string(),
            )
        })
    }

    /// TOML form of the resolved settings, for `rollscan save-config`
    pub fn to_toml(&self) -> TomlConfig {
        TomlConfig {
            data_folder: Some(self.data_folder.clone()),
            endpoint_url: self.endpoint_url.clone(),
            operator: self.operator.clone(),
            history_cap: Some(self.history_cap),
            delivery: self.delivery.clone(),
            logging: LoggingConfig {
                level: self.log_level.clone(),
                file: self.log_file.clone(),
            },
        }
    }

    /// tracing filter directive for the configured level
    pub fn log_filter(&self) -> String {
        let level = self.log_level.trim();
        if level.is_empty() || level.eq_ignore_ascii_case("info") {
            DEFAULT_LOG_FILTER.to_string()
        } else if level.contains('=') {
            level.to_string()
        } else {
            format!("rollscan_sc={level},rollscan={level}")
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        std::env::remove_var(rollscan_common::config::DATA_FOLDER_ENV);
        std::env::remove_var(rollscan_common::config::DATA_FOLDER_ENV_ALIAS);
    }

    #[test]
    #[serial]
    fn test_overrides_win_over_toml() {
        clear_env();
        let toml = TomlConfig {
            data_folder: Some(PathBuf::from("/from/toml")),
            endpoint_url: Some("https://toml.example/exec".to_string()),
            operator: Some("toml-desk".to_string()),
            history_cap: Some(12),
            ..Default::default()
        };
        let overrides = Overrides {
            data_folder: Some(PathBuf::from("/from/cli")),
            endpoint_url: Some("https://cli.example/exec".to_string()),
            history_cap: Some(15),
            ..Default::default()
        };

        let config = ScannerConfig::resolve(overrides, &toml);

        assert_eq!(config.data_folder, PathBuf::from("/from/cli"));
        assert_eq!(config.endpoint_url.as_deref(), Some("https://cli.example/exec"));
        assert_eq!(config.operator.as_deref(), Some("toml-desk"));
        assert_eq!(config.history_cap, 15);
    }

    #[test]
    #[serial]
    fn test_defaults_and_clamping() {
        clear_env();
        let config = ScannerConfig::resolve(
            Overrides {
                history_cap: Some(3),
                ..Default::default()
            },
            &TomlConfig::default(),
        );

        assert_eq!(config.history_cap, 10);
        assert_eq!(config.delivery, DeliveryConfig::default());
        assert!(config.require_endpoint().is_err());
        assert_eq!(config.log_filter(), DEFAULT_LOG_FILTER);
    }

    #[test]
    #[serial]
    fn test_blank_endpoint_is_missing() {
        clear_env();
        let config = ScannerConfig::resolve(
            Overrides {
                endpoint_url: Some("   ".to_string()),
                ..Default::default()
            },
            &TomlConfig::default(),
        );
        assert!(matches!(config.require_endpoint(), Err(Error::Config(_))));
    }

    #[test]
    #[serial]
    fn test_to_toml_round_trips_resolved_values() {
        clear_env();
        let overrides = Overrides {
            data_folder: Some(PathBuf::from("/srv/rollscan")),
            endpoint_url: Some("https://cli.example/exec".to_string()),
            operator: Some("desk-2".to_string()),
            history_cap: Some(99),
            ..Default::default()
        };
        let config = ScannerConfig::resolve(overrides, &TomlConfig::default());

        let toml = config.to_toml();
        assert_eq!(toml.history_cap, Some(20));
        assert_eq!(toml.operator.as_deref(), Some("desk-2"));

        let reloaded = ScannerConfig::resolve(Overrides::default(), &toml);
        assert_eq!(reloaded.data_folder, PathBuf::from("/srv/rollscan"));
        assert_eq!(reloaded.endpoint_url, config.endpoint_url);
        assert_eq!(reloaded.history_cap, 20);
    }

    #[test]
    #[serial]
    fn test_log_filter_levels() {
        clear_env();
        let mut config = ScannerConfig::resolve(Overrides::default(), &TomlConfig::default());

        config.log_level = "debug".to_string();
        assert_eq!(config.log_filter(), "rollscan_sc=debug,rollscan=debug");

        config.log_level = "warn,reqwest=debug".to_string();
        assert_eq!(config.log_filter(), "warn,reqwest=debug");
    }
}
