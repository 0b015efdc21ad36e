//! Runtime configuration.
//!
//! All tuning constants (grace period, poll interval, framing bounds,
//! telemetry delimiters) live here as bounded values instead of being
//! hardcoded at the use sites.

use crate::device::board::{default_boards, BoardProfile};
use crate::error::{CoreError, CoreResult};
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const GRACE_PERIOD_MS: (u64, u64) = (50, 60_000);
const HOTPLUG_INTERVAL_MS: (u64, u64) = (50, 60_000);
const SERIAL_READ_TIMEOUT_MS: (u64, u64) = (1, 1_000);
const BAUD_RATE: (u32, u32) = (300, 4_000_000);
const MAX_FRAME_LEN: (u32, u32) = (1, 64 * 1024 * 1024);
const MAX_SAMPLE_LEN: (usize, usize) = (1, 65_536);
const FLOOD_THRESHOLD: (u32, u32) = (1, 100_000);

/// Top-level configuration of the communication core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Bounded wait before a non-responsive runner or device is forcibly
    /// terminated.
    pub grace_period_ms: u64,
    /// How often the hot-plug watcher lists serial ports.
    pub hotplug_interval_ms: u64,
    /// Read timeout of the serial pump; bounds how long a pump takes to notice
    /// a stop request.
    pub serial_read_timeout_ms: u64,
    /// Used when `open` is not given an explicit baud rate.
    pub default_baud_rate: u32,
    /// Sanity bound on a single channel frame.
    pub max_frame_len: u32,
    /// Telemetry parser settings.
    pub telemetry: TelemetryConfig,
    /// Board catalog consulted when a port is listed.
    pub boards: Vec<BoardProfile>,
}

/// Delimiters and limits of the telemetry parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Opens a sample. Must be non-empty.
    pub start_marker: String,
    /// Closes a sample. Must be non-empty.
    pub end_marker: String,
    /// Only recognise the start marker at the beginning of a line. A newline
    /// inside an open sample then aborts it back to text.
    pub line_start_only: bool,
    /// An open sample longer than this falls back to text.
    pub max_sample_len: usize,
    /// Samples per second above which one `DataFlood` event is raised.
    pub flood_threshold: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            start_marker: "(".to_string(),
            end_marker: ")".to_string(),
            line_start_only: true,
            max_sample_len: 256,
            flood_threshold: 200,
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 2_000,
            hotplug_interval_ms: 1_000,
            serial_read_timeout_ms: 20,
            default_baud_rate: 115_200,
            max_frame_len: 1024 * 1024,
            telemetry: TelemetryConfig::default(),
            boards: default_boards(),
        }
    }
}

fn check_range<T: PartialOrd + std::fmt::Display + Copy>(name: &str, value: T, bounds: (T, T)) -> CoreResult<()> {
    if value < bounds.0 || value > bounds.1 {
        return Err(CoreError::InvalidConfig(format!(
            "{name} = {value} is outside {}..={}",
            bounds.0, bounds.1
        )));
    }
    Ok(())
}

fn check_marker(name: &str, marker: &str) -> CoreResult<()> {
    if marker.is_empty() || !marker.is_ascii() {
        return Err(CoreError::InvalidConfig(format!("{name} must be non-empty ASCII")));
    }
    Ok(())
}

impl CoreConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?;
        Self::from_json_str(&text)
    }

    /// Reject values outside their bounds.
    /// Reject empty markers and out-of-range limits.
    pub fn validate(&self) -> CoreResult<()> {
        check_range("grace_period_ms", self.grace_period_ms, GRACE_PERIOD_MS)?;
        check_range("hotplug_interval_ms", self.hotplug_interval_ms, HOTPLUG_INTERVAL_MS)?;
        check_range("serial_read_timeout_ms", self.serial_read_timeout_ms, SERIAL_READ_TIMEOUT_MS)?;
        check_range("default_baud_rate", self.default_baud_rate, BAUD_RATE)?;
        check_range("max_frame_len", self.max_frame_len, MAX_FRAME_LEN)?;
        self.telemetry.validate()
    }

    /// `grace_period_ms` as a `Duration`.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// `hotplug_interval_ms` as a `Duration`.
    pub fn hotplug_interval(&self) -> Duration {
        Duration::from_millis(self.hotplug_interval_ms)
    }

    /// `serial_read_timeout_ms` as a `Duration`.
    pub fn serial_read_timeout(&self) -> Duration {
        Duration::from_millis(self.serial_read_timeout_ms)
    }
}

impl TelemetryConfig {
    pub fn validate(&self) -> CoreResult<()> {
        check_marker("telemetry.start_marker", &self.start_marker)?;
        check_marker("telemetry.end_marker", &self.end_marker)?;
        check_range("telemetry.max_sample_len", self.max_sample_len, MAX_SAMPLE_LEN)?;
        check_range("telemetry.flood_threshold", self.flood_threshold, FLOOD_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grace_period(), Duration::from_secs(2));
        assert!(!config.boards.is_empty());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = CoreConfig::from_json_str(r#"{ "grace_period_ms": 500, "telemetry": { "flood_threshold": 10 } }"#)
            .unwrap();
        assert_eq!(config.grace_period_ms, 500);
        assert_eq!(config.telemetry.flood_threshold, 10);
        assert_eq!(config.telemetry.start_marker, "(");
        assert_eq!(config.default_baud_rate, 115_200);
    }

    #[test]
    fn test_out_of_bounds_grace_period() {
        let config = CoreConfig { grace_period_ms: 10, ..CoreConfig::default() };
        match config.validate() {
            Err(CoreError::InvalidConfig(msg)) => assert!(msg.contains("grace_period_ms")),
            other => panic!("Expected InvalidConfig, got {:?}", other),
        }
        assert!(CoreConfig::from_json_str(r#"{ "grace_period_ms": 999999 }"#).is_err());
    }

    #[test]
    fn test_empty_marker_rejected() {
        let mut config = CoreConfig::default();
        config.telemetry.end_marker = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = CoreConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let decoded: CoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, decoded);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("minnow.json");
        std::fs::write(&path, r#"{ "hotplug_interval_ms": 250 }"#).unwrap();
        let config = CoreConfig::load(&path).unwrap();
        assert_eq!(config.hotplug_interval(), Duration::from_millis(250));
        assert!(CoreConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
