//! Configuration loading and data folder resolution
//!
//! Bootstrap configuration comes from three layers, highest priority first:
//! 1. Command-line argument / environment variable (resolved by the caller)
//! 2. TOML config file
//! 3. OS-dependent compiled defaults
//!
//! A missing TOML file is never fatal: the loader logs a warning and falls
//! back to defaults so the scanner still starts.

use crate::{fs, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Primary environment variable for the data folder
pub const DATA_FOLDER_ENV: &str = "ROLLSCAN_DATA_FOLDER";

/// Short alias for [`DATA_FOLDER_ENV`]
pub const DATA_FOLDER_ENV_ALIAS: &str = "ROLLSCAN_DATA";

/// Smallest history cap the ledger accepts
pub const MIN_HISTORY_CAP: usize = 10;

/// Largest history cap the ledger accepts
pub const MAX_HISTORY_CAP: usize = 20;

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Form field names used when posting a scan to the remote sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Value of the `action` field sent with batch admissions
    #[serde(default = "default_action")]
    pub action: String,

    /// Field carrying the JSON record for batch admissions
    #[serde(default = "default_payload_field")]
    pub payload_field: String,

    /// Field carrying the JSON record for inline admissions
    #[serde(default = "default_inline_payload_field")]
    pub inline_payload_field: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            action: default_action(),
            payload_field: default_payload_field(),
            inline_payload_field: default_inline_payload_field(),
        }
    }
}

/// Bootstrap configuration loaded from TOML
///
/// Every field is optional; absent values fall through to compiled defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Folder holding the persisted scan state and history
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_folder: Option<PathBuf>,

    /// Remote spreadsheet endpoint (roster GET + scan POST)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,

    /// Operator name attached to history entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,

    /// Number of history entries kept (clamped to 10..=20)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_cap: Option<usize>,

    /// Delivery form field names
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_action() -> String {
    "record_scan".to_string()
}

fn default_payload_field() -> String {
    "data".to_string()
}

fn default_inline_payload_field() -> String {
    "barcode_data".to_string()
}

/// OS-dependent compiled defaults (lowest priority layer)
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub data_folder: PathBuf,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub history_cap: usize,
}

impl CompiledDefaults {
    /// Defaults for the platform this binary was built for
    pub fn for_current_platform() -> Self {
        Self {
            data_folder: default_data_folder(),
            log_level: default_log_level(),
            log_file: None,
            history_cap: MAX_HISTORY_CAP,
        }
    }
}

/// Get OS-dependent default data folder path
fn default_data_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/rollscan (or /var/lib/rollscan for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("rollscan"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/rollscan"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("rollscan"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/rollscan"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("rollscan"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\rollscan"))
    } else {
        PathBuf::from("./rollscan_data")
    }
}

/// Clamp a requested history cap into the supported range
pub fn clamp_history_cap(requested: usize) -> usize {
    let clamped = requested.clamp(MIN_HISTORY_CAP, MAX_HISTORY_CAP);
    if clamped != requested {
        warn!(
            requested,
            clamped, "history_cap outside {}..={}, clamping", MIN_HISTORY_CAP, MAX_HISTORY_CAP
        );
    }
    clamped
}

/// Resolves the data folder following the layer priority
///
/// 1. Command-line argument
/// 2. `ROLLSCAN_DATA_FOLDER`, then `ROLLSCAN_DATA`
/// 3. `data_folder` from the TOML config
/// 4. Compiled default
#[derive(Debug, Clone)]
pub struct DataFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
    toml_value: Option<PathBuf>,
}

impl DataFolderResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            cli_arg: None,
            toml_value: None,
        }
    }

    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    pub fn with_toml(mut self, config: &TomlConfig) -> Self {
        self.toml_value = config.data_folder.clone();
        self
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        for var in [DATA_FOLDER_ENV, DATA_FOLDER_ENV_ALIAS] {
            if let Ok(path) = std::env::var(var) {
                if !path.trim().is_empty() {
                    return PathBuf::from(path);
                }
            }
        }

        if let Some(path) = &self.toml_value {
            return path.clone();
        }

        let default = CompiledDefaults::for_current_platform().data_folder;
        info!(
            module = %self.module_name,
            "No data folder configured, using default {}",
            default.display()
        );
        default
    }
}

/// Creates the data folder on first start
#[derive(Debug, Clone)]
pub struct DataFolderInitializer {
    data_folder: PathBuf,
}

impl DataFolderInitializer {
    pub fn new(data_folder: PathBuf) -> Self {
        Self { data_folder }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.data_folder.exists() {
            info!("Creating data folder {}", self.data_folder.display());
            std::fs::create_dir_all(&self.data_folder)?;
        }
        Ok(())
    }

    pub fn data_folder(&self) -> &Path {
        &self.data_folder
    }
}

/// Per-user config file location, whether or not it exists yet
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("rollscan").join("config.toml"))
}

/// Locate the default config file for this platform, if one exists
///
/// On Linux `~/.config/rollscan/config.toml` wins over `/etc/rollscan/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    if let Some(path) = user_config_path() {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/rollscan/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Load a TOML config file
///
/// A missing file is [`Error::NotFound`]; a malformed one is a parse error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        return Err(Error::NotFound(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    Ok(config)
}

/// Load config from `explicit` or the platform default location
///
/// Missing files degrade to defaults with a warning. An explicitly named file
/// that fails to parse is still an error: silently ignoring it would send
/// scans to the wrong endpoint.
pub fn load_toml_config_or_default(explicit: Option<&Path>) -> Result<TomlConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) => path,
            None => {
                warn!("No config file found, using defaults");
                return Ok(TomlConfig::default());
            }
        },
    };

    match load_toml_config(&path) {
        Ok(config) => {
            info!("Loaded config from {}", path.display());
            Ok(config)
        }
        Err(Error::NotFound(msg)) => {
            warn!("{}, using defaults", msg);
            Ok(TomlConfig::default())
        }
        Err(e) => Err(e),
    }
}

/// Write a TOML config atomically with owner-only permissions
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    fs::write_atomic(path, content.as_bytes())?;
    fs::set_owner_only(path)?;
    Ok(())
}
