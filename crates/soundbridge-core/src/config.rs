//! Persistent backend configuration
//!
//! Stores the user's target parameters (driver, device, rates, channels,
//! latencies, MIDI option) in a JSON file at
//! `<config_dir>/soundbridge/config.json` so a host application can restore
//! them before the first start.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_sample_rate() -> u32 {
    48000
}

fn default_buffer_size() -> u32 {
    1024
}

fn default_periods() -> u32 {
    2
}

/// Persistent target parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Selected driver (None = platform default)
    #[serde(default)]
    pub driver: Option<String>,
    /// Selected device name (None = no device remembered)
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u32,
    #[serde(default = "default_periods")]
    pub num_periods: u32,
    #[serde(default)]
    pub input_channels: u32,
    #[serde(default)]
    pub output_channels: u32,
    #[serde(default)]
    pub systemic_input_latency: u32,
    #[serde(default)]
    pub systemic_output_latency: u32,
    /// Pretty name of the MIDI option, empty for none
    #[serde(default)]
    pub midi_option: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            driver: None,
            device: None,
            sample_rate: default_sample_rate(),
            buffer_size: default_buffer_size(),
            num_periods: default_periods(),
            input_channels: 0,
            output_channels: 0,
            systemic_input_latency: 0,
            systemic_output_latency: 0,
            midi_option: String::new(),
        }
    }
}

impl BackendConfig {
    /// Config file path: `<config_dir>/soundbridge/config.json`
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("soundbridge")
            .join("config.json")
    }

    /// Load from disk, falling back to defaults on any error
    pub fn load() -> Self {
        Self::load_from(&Self::path())
    }

    pub fn load_from(path: &std::path::Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => {
                    tracing::info!(path = %path.display(), "loaded backend config");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot parse backend config, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Write to disk, creating the parent directory if needed
    pub fn save(&self) -> std::io::Result<()> {
        self.save_to(&Self::path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = BackendConfig::default();
        config.device = Some("USB Interface".to_string());
        config.sample_rate = 96000;
        config.save_to(&path).unwrap();

        let loaded = BackendConfig::load_from(&path);
        assert_eq!(loaded.device.as_deref(), Some("USB Interface"));
        assert_eq!(loaded.sample_rate, 96000);
        assert_eq!(loaded.buffer_size, 1024);
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        let loaded = BackendConfig::load_from(&path);
        assert_eq!(loaded.sample_rate, 48000);
        assert!(loaded.device.is_none());
    }

    #[test]
    fn missing_fields_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"device": "hw:0"}"#).unwrap();

        let loaded = BackendConfig::load_from(&path);
        assert_eq!(loaded.device.as_deref(), Some("hw:0"));
        assert_eq!(loaded.num_periods, 2);
    }
}
