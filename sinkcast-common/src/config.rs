//! Configuration loading and config file resolution
//!
//! Settings are resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default (fallback)
//!
//! Steps 1 and 2 are handled by the binary's argument parser; this module
//! covers the TOML file and the compiled defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "SINKCAST_CONFIG";

/// Default volume percentage applied to the local sink and the speaker
pub const DEFAULT_VOLUME: u8 = 60;

/// Name (and description) of the virtual combined sink
pub const DEFAULT_SINK_NAME: &str = "Sonos";

/// Port the transcoder serves the stream on
pub const DEFAULT_HTTP_PORT: u16 = 8888;

/// Path component of the served stream
pub const DEFAULT_STREAM_NAME: &str = "linux_to_sonos.flac";

pub const DEFAULT_TRANSCODER_BINARY: &str = "/usr/bin/cvlc";
pub const DEFAULT_NOISE_BINARY: &str = "ffplay";

/// Pink noise amplitude; low enough to be inaudible, high enough to keep
/// the speaker out of standby
pub const DEFAULT_NOISE_AMPLITUDE: f64 = 0.001;

pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 3000;

/// Bootstrap configuration loaded from TOML file
///
/// Every field has a compiled default, so an empty file (or no file at all)
/// yields a usable configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Preferred speaker IP address (None = first discovered)
    pub device: Option<String>,

    /// Volume percentage, 0-100
    pub volume: u8,

    /// Virtual sink name
    pub sink_name: String,

    /// HTTP port for the served stream
    pub http_port: u16,

    /// Path of the served stream
    pub stream_name: String,

    /// Transcoder executable (VLC console interface)
    pub transcoder_binary: String,

    /// Keep-alive noise executable
    pub noise_binary: String,

    /// Keep-alive noise amplitude, 0.0 < a <= 1.0
    pub noise_amplitude: f64,

    /// How long to listen for speaker discovery responses
    pub discovery_timeout_ms: u64,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            device: None,
            volume: DEFAULT_VOLUME,
            sink_name: DEFAULT_SINK_NAME.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            stream_name: DEFAULT_STREAM_NAME.to_string(),
            transcoder_binary: DEFAULT_TRANSCODER_BINARY.to_string(),
            noise_binary: DEFAULT_NOISE_BINARY.to_string(),
            noise_amplitude: DEFAULT_NOISE_AMPLITUDE,
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            logging: LoggingConfig::default(),
        }
    }
}

impl TomlConfig {
    /// Reject values the external tools cannot use
    pub fn validate(&self) -> Result<()> {
        validate_volume(self.volume)?;

        if self.sink_name.trim().is_empty() || self.sink_name.contains(char::is_whitespace) {
            return Err(Error::Config(format!(
                "sink_name must be a single non-empty word, got {:?}",
                self.sink_name
            )));
        }
        if self.http_port == 0 {
            return Err(Error::Config("http_port must be nonzero".to_string()));
        }
        if self.stream_name.trim().is_empty() || self.stream_name.contains('/') {
            return Err(Error::Config(format!(
                "stream_name must be a bare file name, got {:?}",
                self.stream_name
            )));
        }
        if !(self.noise_amplitude > 0.0 && self.noise_amplitude <= 1.0) {
            return Err(Error::Config(format!(
                "noise_amplitude must be in (0, 1], got {}",
                self.noise_amplitude
            )));
        }
        Ok(())
    }
}

/// Check a volume percentage is within 0-100
pub fn validate_volume(volume: u8) -> Result<()> {
    if volume > 100 {
        return Err(Error::InvalidInput(format!(
            "volume must be between 0 and 100, got {}",
            volume
        )));
    }
    Ok(())
}

/// Per-user config file path (`~/.config/sinkcast/config.toml` on Linux)
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("sinkcast").join("config.toml"))
}

/// System-wide config file path
pub fn system_config_path() -> PathBuf {
    PathBuf::from("/etc/sinkcast/config.toml")
}

/// Outcome of the config file search
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigLocation {
    /// File to load, if any was found
    pub path: Option<PathBuf>,
    /// `SINKCAST_CONFIG` value that was skipped because the file is missing
    pub skipped_env_path: Option<PathBuf>,
}

/// Locate the config file to load
///
/// An explicit path must exist. A path from `SINKCAST_CONFIG` that does not
/// exist is skipped and reported in [`ConfigLocation::skipped_env_path`], since
/// this runs before logging is set up. Finding no file at all is not an error.
pub fn locate_config_file(explicit: Option<&Path>) -> Result<ConfigLocation> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(ConfigLocation {
                path: Some(path.to_path_buf()),
                skipped_env_path: None,
            });
        }
        return Err(Error::Config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    let mut location = ConfigLocation::default();

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let path = PathBuf::from(path);
        if path.exists() {
            location.path = Some(path);
            return Ok(location);
        }
        location.skipped_env_path = Some(path);
    }

    location.path = user_config_path()
        .filter(|path| path.exists())
        .or_else(|| Some(system_config_path()).filter(|path| path.exists()));
    Ok(location)
}

/// Parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: TomlConfig = toml::from_str(&content)?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// A loaded config and where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedConfig {
    pub config: TomlConfig,
    pub location: ConfigLocation,
}

/// Locate and load the config, falling back to compiled defaults
///
/// Nothing is logged here; the caller reports the location once tracing is up.
pub fn load_or_default(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let location = locate_config_file(explicit)?;
    let config = match &location.path {
        Some(path) => load_toml_config(path)?,
        None => TomlConfig::default(),
    };
    Ok(LoadedConfig { config, location })
}

/// Write a config file via temp file + rename
///
/// Parent directories are created as needed. On Unix the file is left with
/// mode 0600.
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let content = toml::to_string_pretty(config)?;
    let tmp_path = path.with_extension("toml.tmp");

    std::fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    Ok(())
}
