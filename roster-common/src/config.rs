//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration only: where the database lives, logging level and
//! import tuning. Settings sources, highest priority first:
//!
//! 1. Command-line arguments
//! 2. Environment variables (`ROSTER_CONFIG`, `ROSTER_ROOT_FOLDER`)
//! 3. TOML configuration file
//! 4. Built-in defaults (code constants)
//!
//! A missing or unreadable TOML file never aborts startup; it is logged and
//! the built-in defaults are used instead.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV: &str = "ROSTER_ROOT_FOLDER";

/// Environment variable naming the TOML config file
pub const CONFIG_FILE_ENV: &str = "ROSTER_CONFIG";

/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "roster.db";

/// Bootstrap configuration loaded from TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder holding the database (optional)
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Explicit database file; relative paths are resolved against the root folder
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Bulk import configuration
    #[serde(default)]
    pub import: ImportConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Bulk import configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Header labels for the student import sheet
    #[serde(default)]
    pub columns: ColumnLabels,

    /// Header label of the class-name column in a class-list sheet
    #[serde(default = "default_class_column")]
    pub class_column: String,

    /// Rows bound into a single INSERT statement
    ///
    /// Keeps every statement well below SQLite's bound-parameter limit.
    #[serde(default = "default_max_rows_per_statement")]
    pub max_rows_per_statement: usize,

    /// Maximum time to wait for the import transaction to start
    ///
    /// `None` waits indefinitely. Once the transaction started it always
    /// runs to commit or rollback.
    #[serde(default)]
    pub start_timeout_ms: Option<u64>,

    /// Capacity of the in-process event bus
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            columns: ColumnLabels::default(),
            class_column: default_class_column(),
            max_rows_per_statement: default_max_rows_per_statement(),
            start_timeout_ms: None,
            event_capacity: default_event_capacity(),
        }
    }
}

/// Header labels of the student import columns
///
/// Matched trimmed and case-insensitively against the first row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnLabels {
    #[serde(default = "default_name_label")]
    pub name: String,
    #[serde(default = "default_national_id_label")]
    pub national_id: String,
    #[serde(default = "default_local_id_label")]
    pub local_id: String,
    #[serde(default = "default_group_name_label")]
    pub group_name: String,
}

impl Default for ColumnLabels {
    fn default() -> Self {
        Self {
            name: default_name_label(),
            national_id: default_national_id_label(),
            local_id: default_local_id_label(),
            group_name: default_group_name_label(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_class_column() -> String {
    "GroupName".to_string()
}

fn default_max_rows_per_statement() -> usize {
    500
}

fn default_event_capacity() -> usize {
    100
}

fn default_name_label() -> String {
    "Name".to_string()
}

fn default_national_id_label() -> String {
    "NationalId".to_string()
}

fn default_local_id_label() -> String {
    "LocalId".to_string()
}

fn default_group_name_label() -> String {
    "GroupName".to_string()
}

impl TomlConfig {
    /// Parse a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Parse TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file with graceful degradation
    ///
    /// Priority: explicit path → `ROSTER_CONFIG` → platform config dir.
    /// Falls back to defaults (with a warning) when nothing usable is found.
    pub fn load_or_default(cli_path: Option<&Path>) -> Self {
        let candidate = cli_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from))
            .or_else(default_config_path);

        let Some(path) = candidate else {
            info!("No config file location available, using built-in defaults");
            return Self::default();
        };

        if !path.exists() {
            info!("Config file {} not found, using built-in defaults", path.display());
            return Self::default();
        }

        match Self::load(&path) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                config
            }
            Err(e) => {
                warn!("Ignoring config file {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Resolve the database file for the given root folder
    pub fn resolve_database_path(&self, root_folder: &Path) -> PathBuf {
        match &self.database_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => root_folder.join(path),
            None => root_folder.join(DATABASE_FILE_NAME),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.import.max_rows_per_statement == 0 {
            return Err(Error::Config(
                "import.max_rows_per_statement must be greater than zero".to_string(),
            ));
        }
        if self.import.event_capacity == 0 {
            return Err(Error::Config(
                "import.event_capacity must be greater than zero".to_string(),
            ));
        }
        let labels = &self.import.columns;
        for (key, label) in [
            ("name", &labels.name),
            ("national_id", &labels.national_id),
            ("local_id", &labels.local_id),
            ("group_name", &labels.group_name),
        ] {
            if label.trim().is_empty() {
                return Err(Error::Config(format!("import.columns.{} must not be empty", key)));
            }
        }
        if self.import.class_column.trim().is_empty() {
            return Err(Error::Config("import.class_column must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Default configuration file path for the platform (`<config dir>/roster/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("roster").join("config.toml"))
}

/// Root folder resolution
///
/// 1. Command-line argument (highest priority)
/// 2. `ROSTER_ROOT_FOLDER` environment variable
/// 3. TOML config `root_folder`
/// 4. OS-dependent default (fallback)
#[derive(Debug, Clone, Default)]
pub struct RootFolderResolver {
    cli_arg: Option<PathBuf>,
    toml_root: Option<PathBuf>,
}

impl RootFolderResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    pub fn with_toml(mut self, config: &TomlConfig) -> Self {
        self.toml_root = config.root_folder.clone();
        self
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(path) = &self.toml_root {
            return path.clone();
        }

        default_root_folder()
    }
}

/// Creates the root folder on first run
#[derive(Debug, Clone)]
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    /// Create the root folder if it does not exist
    pub fn ensure_directory_exists(&self) -> Result<()> {
        if !self.root_folder.exists() {
            std::fs::create_dir_all(&self.root_folder)?;
            info!("Created root folder: {}", self.root_folder.display());
        }
        Ok(())
    }

    /// Default database path inside the root folder
    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE_NAME)
    }
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/roster (or /var/lib/roster for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("roster"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/roster"))
    } else if cfg!(target_os = "macos") {
        // ~/Library/Application Support/roster
        dirs::data_dir()
            .map(|d| d.join("roster"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/roster"))
    } else if cfg!(target_os = "windows") {
        // %LOCALAPPDATA%\roster
        dirs::data_local_dir()
            .map(|d| d.join("roster"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\roster"))
    } else {
        PathBuf::from("./roster_data")
    }
}
