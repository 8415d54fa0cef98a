//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/veil/config.toml)
//! 3. Environment variables (VEIL_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable prefix
const ENV_PREFIX: &str = "VEIL";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the production filter database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Path to the bundled read-only default catalog database
    #[serde(default = "default_db_path")]
    pub default_db_path: PathBuf,

    /// Base URL of the filter catalog backend
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Locale used for display strings and filter auto-detection
    #[serde(default = "default_locale")]
    pub locale: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            default_db_path: default_db_path(),
            backend_url: default_backend_url(),
            locale: default_locale(),
        }
    }
}

impl Config {
    /// Load configuration from the default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (VEIL_DATA_DIR, VEIL_DEFAULT_DB, VEIL_BACKEND_URL, VEIL_LOCALE)
    /// 2. Config file (~/.config/veil/config.toml or VEIL_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Path of the production filter database
    pub fn production_db_path(&self) -> PathBuf {
        self.data_dir.join("filters.db")
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var(format!("{}_DATA_DIR", ENV_PREFIX)) {
            self.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_DEFAULT_DB", ENV_PREFIX)) {
            self.default_db_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var(format!("{}_BACKEND_URL", ENV_PREFIX)) {
            if !val.is_empty() {
                self.backend_url = val;
            }
        }

        if let Ok(val) = std::env::var(format!("{}_LOCALE", ENV_PREFIX)) {
            if !val.is_empty() {
                self.locale = val;
            }
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Default config file location, honoring VEIL_CONFIG
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("veil")
            .join("config.toml")
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("veil")
}

fn default_db_path() -> PathBuf {
    default_data_dir().join("default.db")
}

fn default_backend_url() -> String {
    "https://filters.veil-project.org/api/v1".to_string()
}

fn default_locale() -> String {
    "en".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.data_dir.ends_with("veil"));
        assert_eq!(config.locale, "en");
        assert!(config.backend_url.starts_with("https://"));
        assert!(config.production_db_path().ends_with("filters.db"));
    }

    #[test]
    fn test_load_from_str() {
        let config = Config::load_from_str(
            r#"
            data_dir = "/tmp/veil-test"
            backend_url = "https://filters.example.org"
            locale = "de-DE"
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/veil-test"));
        assert_eq!(config.backend_url, "https://filters.example.org");
        assert_eq!(config.locale, "de-DE");
        // Missing keys fall back to defaults.
        assert!(config.default_db_path.ends_with("default.db"));
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(Config::load_from_str("data_dir = [nonsense").is_err());
    }
}
