//! Pump configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Pipeline configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Preferred frame size in bytes for the file source (0 = fill the
    /// sink buffer).
    /// Override: `RIVULET_FRAME_SIZE`
    pub frame_size: usize,

    /// Destination buffer size handed to the source chain.
    /// Override: `RIVULET_BUFFER_SIZE`
    pub buffer_size: usize,

    /// Per-frame play time in microseconds (0 = unpaced).
    /// Override: `RIVULET_PLAY_TIME_US`
    pub play_time_us: u64,

    /// Hex-encoded header prepended to every frame (empty = none).
    pub frame_header_hex: String,

    /// Gather upstream frames into chunks of at least this many bytes
    /// before writing (0 = no accumulation).
    pub accumulate_bytes: usize,

    /// Stop after this many input bytes (0 = whole file).
    pub byte_limit: u64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            frame_size: 4096,
            buffer_size: 20_000,
            play_time_us: 0,
            frame_header_hex: String::new(),
            accumulate_bytes: 0,
            byte_limit: 0,
        }
    }
}

impl PumpConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("RIVULET_FRAME_SIZE") {
            if let Ok(size) = val.parse() {
                self.frame_size = size;
            }
        }

        if let Ok(val) = std::env::var("RIVULET_BUFFER_SIZE") {
            if let Ok(size) = val.parse() {
                self.buffer_size = size;
            }
        }

        if let Ok(val) = std::env::var("RIVULET_PLAY_TIME_US") {
            if let Ok(us) = val.parse() {
                self.play_time_us = us;
            }
        }
    }

    /// Decodes `frame_header_hex` into bytes.
    pub fn frame_header(&self) -> Result<Vec<u8>> {
        let hex = self.frame_header_hex.trim();
        if hex.is_empty() {
            return Ok(Vec::new());
        }
        anyhow::ensure!(
            hex.len() % 2 == 0,
            "frame_header_hex must have an even number of hex digits"
        );
        (0..hex.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&hex[i..i + 2], 16)
                    .with_context(|| format!("invalid hex byte at offset {i}"))
            })
            .collect()
    }
}
