//! Configuration file support for canflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (CANFLASH_*)
//! 3. Local config file (./canflash.toml)
//! 4. Global config file (~/.config/canflash/config.toml)
//!
//! ```toml
//! [connection]
//! interface = "socketcan"
//! channel = "can0"
//! bitrate = 500
//!
//! [timeouts]
//! erase_ms = 10000
//! confirm_ms = 60000
//!
//! [flash]
//! chunk_size = 256
//! test_mode = false
//! ```

use canflash::{LinkParams, TimeoutPolicy, UpgradeConfig};
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local configuration file name, looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "canflash.toml";

/// CAN link configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Transport plugin ("socketcan" or "virtual").
    pub interface: Option<String>,
    /// Channel name on the plugin (e.g., "can0").
    pub channel: Option<String>,
    /// Bus bitrate in kbit/s.
    pub bitrate: Option<u32>,
}

/// Per-phase timeouts in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Version query and pending link bring-up.
    pub receive_ms: Option<u64>,
    /// Erase acknowledgement.
    pub erase_ms: Option<u64>,
    /// Each chunk acknowledgement.
    pub upload_ms: Option<u64>,
    /// Confirm acknowledgement.
    pub confirm_ms: Option<u64>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Bytes per acknowledged chunk.
    pub chunk_size: Option<usize>,
    /// Confirm images in test mode by default.
    #[serde(default)]
    pub test_mode: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// CAN link settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Timeout overrides.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Flash settings.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    ///
    /// Unreadable or invalid files are reported and skipped.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "canflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        if other.connection.interface.is_some() {
            self.connection.interface = other.connection.interface;
        }
        if other.connection.channel.is_some() {
            self.connection.channel = other.connection.channel;
        }
        if other.connection.bitrate.is_some() {
            self.connection.bitrate = other.connection.bitrate;
        }

        let timeouts = &mut self.timeouts;
        timeouts.receive_ms = other.timeouts.receive_ms.or(timeouts.receive_ms);
        timeouts.erase_ms = other.timeouts.erase_ms.or(timeouts.erase_ms);
        timeouts.upload_ms = other.timeouts.upload_ms.or(timeouts.upload_ms);
        timeouts.confirm_ms = other.timeouts.confirm_ms.or(timeouts.confirm_ms);

        if other.flash.chunk_size.is_some() {
            self.flash.chunk_size = other.flash.chunk_size;
        }
        if other.flash.test_mode {
            self.flash.test_mode = true;
        }
    }

    /// Resolve link parameters, letting command-line values override the file.
    pub fn link_params(
        &self,
        interface: Option<&str>,
        channel: Option<&str>,
        bitrate: Option<u32>,
    ) -> LinkParams {
        let defaults = LinkParams::default();
        let pick = |cli: Option<&str>, file: Option<&str>, fallback: String| {
            cli.or(file)
                .map_or(fallback, str::to_string)
        };
        LinkParams::new(
            pick(interface, self.connection.interface.as_deref(), defaults.interface),
            pick(channel, self.connection.channel.as_deref(), defaults.channel),
            bitrate
                .or(self.connection.bitrate)
                .unwrap_or(defaults.bitrate_kbps),
        )
    }

    /// Timeout policy with configured overrides applied.
    pub fn timeout_policy(&self) -> TimeoutPolicy {
        let defaults = TimeoutPolicy::default();
        let ms = |value: Option<u64>, fallback: Duration| value.map_or(fallback, Duration::from_millis);
        TimeoutPolicy {
            receive: ms(self.timeouts.receive_ms, defaults.receive),
            erase: ms(self.timeouts.erase_ms, defaults.erase),
            upload: ms(self.timeouts.upload_ms, defaults.upload),
            confirm: ms(self.timeouts.confirm_ms, defaults.confirm),
        }
    }

    /// Engine configuration; `chunk_size` from the command line wins.
    pub fn upgrade_config(&self, chunk_size: Option<usize>) -> UpgradeConfig {
        let mut upgrade = UpgradeConfig::default().with_timeouts(self.timeout_policy());
        if let Some(size) = chunk_size.or(self.flash.chunk_size) {
            upgrade = upgrade.with_chunk_size(size);
        }
        upgrade
    }
}
