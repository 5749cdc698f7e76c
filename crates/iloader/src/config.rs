//! Configuration file handling.
//!
//! Settings live in `config.toml` under the platform configuration
//! directory. Every field has a default, so a missing file or a partial one
//! is valid.
//!
//! ```toml
//! anisette_server = "ani.sidestore.io"
//! allow_app_id_deletion = false
//! compression_level = 6
//!
//! [timeouts]
//! anisette_secs = 15
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ipa::CompressionLevel;
use crate::{Error, Result};

pub const DEFAULT_ANISETTE_SERVER: &str = "ani.sidestore.io";
pub const DEFAULT_GSA_URL: &str = "https://gsa.apple.com/grandslam/GsService2";
pub const DEFAULT_DEVELOPER_SERVICES_URL: &str = "https://developerservices2.apple.com/services/v1";

const APP_DIR: &str = "iloader";
const CONFIG_FILE: &str = "config.toml";

/// Network deadlines in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub anisette_secs: u64,
    pub gsa_secs: u64,
    pub developer_services_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            anisette_secs: 15,
            gsa_secs: 30,
            developer_services_secs: 30,
        }
    }
}

impl Timeouts {
    pub fn anisette(&self) -> Duration {
        Duration::from_secs(self.anisette_secs)
    }

    pub fn gsa(&self) -> Duration {
        Duration::from_secs(self.gsa_secs)
    }

    pub fn developer_services(&self) -> Duration {
        Duration::from_secs(self.developer_services_secs)
    }
}

/// Application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Anisette server used when a caller does not name one
    pub anisette_server: String,
    /// App IDs may only be deleted when this is set
    pub allow_app_id_deletion: bool,
    /// Keep the Apple ID password in the secret vault after sign-in
    pub remember_password: bool,
    pub gsa_url: String,
    pub developer_services_url: String,
    /// Account metadata and the secret vault
    pub data_dir: PathBuf,
    /// Where signed IPAs are written when no output path is given
    pub output_dir: PathBuf,
    pub compression_level: u32,
    pub timeouts: Timeouts,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_DIR);
        Self {
            anisette_server: DEFAULT_ANISETTE_SERVER.into(),
            allow_app_id_deletion: false,
            remember_password: false,
            gsa_url: DEFAULT_GSA_URL.into(),
            developer_services_url: DEFAULT_DEVELOPER_SERVICES_URL.into(),
            output_dir: data_dir.join("signed"),
            data_dir,
            compression_level: CompressionLevel::DEFAULT.level(),
            timeouts: Timeouts::default(),
        }
    }
}

impl Config {
    /// `<config dir>/iloader/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Read `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                debug!(path = %path.display(), "loading configuration");
                Self::from_toml(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Load from [`Config::default_path`], or defaults when there is none.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn compression(&self) -> CompressionLevel {
        CompressionLevel::new(self.compression_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.anisette_server, "ani.sidestore.io");
        assert!(!config.allow_app_id_deletion);
        assert_eq!(config.timeouts.anisette(), Duration::from_secs(15));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = Config::from_toml(
            "allow_app_id_deletion = true\n[timeouts]\ngsa_secs = 5\n",
        )
        .unwrap();
        assert!(config.allow_app_id_deletion);
        assert_eq!(config.timeouts.gsa(), Duration::from_secs(5));
        assert_eq!(config.timeouts.developer_services_secs, 30);
        assert_eq!(config.gsa_url, DEFAULT_GSA_URL);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        assert!(matches!(
            Config::from_toml("compression_level = \"high\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.compression_level = 42;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.compression(), CompressionLevel::MAX);
    }
}
