//! Application configuration loading and validation.
//!
//! The top-level [`Config`] aggregates the logger, transport, session and
//! discovery sections. It is read once at startup from TOML and stays
//! immutable afterwards.
//!
//! ```toml
//! [logger]
//! level = "debug"
//!
//! [transport]
//! host = "192.168.1.24"
//! sn = "24400102L8HO5227"
//!
//! [session]
//! auto_controller = true
//!
//! [discovery]
//! target = "auto"
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use time::format_description::{self, FormatItem};
use validator::Validate;

use self::{discovery::DiscoveryConfig, logger::LoggerConfig, session::SessionConfig};

pub mod discovery;
pub mod logger;
pub mod session;

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "YARDLINK_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/yardlink/config.toml";

static CONSOLE_TIME_FORMAT: Lazy<Option<Vec<FormatItem<'static>>>> = Lazy::new(|| {
    format_description::parse("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z")
        .ok()
});

/// Timestamp for the pre-subscriber console macros.
#[doc(hidden)]
pub fn console_timestamp() -> String {
    let now = time::OffsetDateTime::now_utc();
    CONSOLE_TIME_FORMAT
        .as_ref()
        .and_then(|format| now.format(format).ok())
        .unwrap_or_else(|| now.unix_timestamp().to_string())
}

/// Timestamped console output for use before the tracing subscriber exists.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::console_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type TransportConfig = yardlink_mqtt::Config;

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Broker connection and device addressing.
    #[validate(nested)]
    pub transport: TransportConfig,

    #[validate(nested)]
    pub session: SessionConfig,

    #[validate(nested)]
    pub discovery: DiscoveryConfig,
}

impl Config {
    /// Loads the file named by `YARDLINK_CONFIG`, else the system path, else
    /// built-in defaults.
    ///
    /// # Errors
    ///
    /// A file that exists but cannot be read, parsed or validated is an error.
    /// Only a missing file falls back to defaults.
    pub fn new() -> Result<Self, ConfigError> {
        match Self::get_config_path() {
            Some(path) => Self::load(&path),
            None => {
                print_warn!("No configuration file found, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    fn get_config_path() -> Option<PathBuf> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Some(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Some(fallback.to_path_buf());
        }

        None
    }

    /// Loads and validates configuration from `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let config_str = fs::read_to_string(path)?;
        let config = Self::from_toml(&config_str)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.transport.host, "192.168.1.24");
        assert_eq!(config.transport.port, 1883);
        assert!(config.session.auto_controller);
        assert_eq!(config.discovery.concurrency, 50);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.logger.level, "info");
        assert_eq!(config.transport.namespace, "snowbot");
    }

    #[test]
    fn test_load_sections() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[logger]
level = "debug"

[transport]
host = "10.0.0.5"
sn = "24400102L8HO5227"
command_timeout_ms = 2000

[session]
auto_controller = false
settle_delay_ms = 100

[discovery]
target = "192.168.1.0/24"
concurrency = 8
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.logger.level, "debug");
        assert_eq!(config.transport.host, "10.0.0.5");
        assert_eq!(config.transport.sn, "24400102L8HO5227");
        assert_eq!(config.transport.command_timeout_ms, 2000);
        assert!(!config.session.auto_controller);
        assert_eq!(config.session.settle_delay_ms, 100);
        assert_eq!(config.discovery.target, "192.168.1.0/24");
        assert_eq!(config.discovery.concurrency, 8);
        // Untouched keys keep their defaults.
        assert_eq!(config.transport.port, 1883);
    }

    #[test]
    fn test_invalid_level_rejected() {
        let err = Config::from_toml("[logger]\nlevel = \"loud\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_malformed_toml_rejected() {
        let err = Config::from_toml("[transport\nhost = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/nonexistent/yardlink.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Config(_)));
    }

    #[test]
    fn test_console_timestamp_format() {
        let ts = console_timestamp();
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }
}
