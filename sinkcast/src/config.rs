//! Session configuration
//!
//! Merges command-line overrides (which already include environment
//! variables) over the TOML bootstrap config.

use std::time::Duration;

use sinkcast_common::config::{validate_volume, TomlConfig};

use crate::error::Result;

/// Values given on the command line or via environment
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub device: Option<String>,
    pub volume: Option<u8>,
    pub port: Option<u16>,
    pub discovery_timeout_ms: Option<u64>,
}

/// Fully resolved settings for one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Speaker address to prefer; empty = first discovered
    pub preferred_device: String,
    pub volume: u8,
    pub sink_name: String,
    pub http_port: u16,
    pub stream_name: String,
    pub transcoder_binary: String,
    pub noise_binary: String,
    pub noise_amplitude: f64,
    pub discovery_timeout: Duration,
}

impl SessionConfig {
    /// CLI > environment > TOML > compiled default
    pub fn resolve(cli: CliOverrides, toml: TomlConfig) -> Result<Self> {
        toml.validate()?;

        let volume = cli.volume.unwrap_or(toml.volume);
        validate_volume(volume)?;

        Ok(Self {
            preferred_device: cli.device.or(toml.device).unwrap_or_default(),
            volume,
            sink_name: toml.sink_name,
            http_port: cli.port.unwrap_or(toml.http_port),
            stream_name: toml.stream_name,
            transcoder_binary: toml.transcoder_binary,
            noise_binary: toml.noise_binary,
            noise_amplitude: toml.noise_amplitude,
            discovery_timeout: Duration::from_millis(
                cli.discovery_timeout_ms.unwrap_or(toml.discovery_timeout_ms),
            ),
        })
    }
}
