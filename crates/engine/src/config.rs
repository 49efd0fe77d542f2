//! Engine configuration.
//!
//! Every section and field is optional; an empty file yields the defaults.
//!
//! # Example
//!
//! ```toml
//! [retry]
//! max_attempts = 8
//! base_delay_ms = 250
//!
//! [capture]
//! enabled = true
//! latitude = -7.25
//! longitude = 112.75
//! timeout_ms = 2000
//!
//! [reconciler]
//! interval_ms = 1000
//! ```

use std::path::Path;
use std::time::Duration;

use lotline_core::Location;
use serde::{Deserialize, Serialize};

pub const DEFAULT_WEATHER_URL: &str = "https://api.open-meteo.com/v1/forecast";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub retry: RetryConfig,
    pub capture: CaptureConfig,
    pub reconciler: ReconcilerConfig,
}

/// `[retry]`: backoff for ledger writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts per ledger task before it is marked exhausted.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// `[capture]`: location and weather evidence sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    pub enabled: bool,
    /// Per-reading timeout.
    pub timeout_ms: u64,
    /// Fixed site coordinates used as the location reading.
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub weather_url: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_ms: 3_000,
            latitude: None,
            longitude: None,
            weather_url: DEFAULT_WEATHER_URL.to_string(),
        }
    }
}

impl CaptureConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The configured site, when both coordinates are set.
    pub fn site(&self) -> Option<Location> {
        Some(Location {
            latitude: self.latitude?,
            longitude: self.longitude?,
        })
    }
}

/// `[reconciler]`: background ledger synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcilerConfig {
    pub interval_ms: u64,
    /// Tasks processed per pass.
    pub batch_limit: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            batch_limit: 50,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<EngineConfig, String> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| format!("could not parse config: {e}"))?;
        config.validate().map_err(|errors| errors.join("; "))?;
        Ok(config)
    }

    /// Check value ranges. Returns every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }
        if self.retry.multiplier < 1.0 {
            errors.push("retry.multiplier must be >= 1.0".to_string());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push("retry.base_delay_ms must not exceed retry.max_delay_ms".to_string());
        }
        if self.reconciler.interval_ms == 0 {
            errors.push("reconciler.interval_ms must be positive".to_string());
        }
        match (self.capture.latitude, self.capture.longitude) {
            (Some(lat), Some(lon)) => {
                if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                    errors.push("capture coordinates out of range".to_string());
                }
            }
            (None, None) => {}
            _ => errors.push("capture.latitude and capture.longitude go together".to_string()),
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Read and parse an engine config TOML file from `path`.
///
/// Returns a human-readable error string on failure.
pub fn read_engine_config(path: &Path) -> Result<EngineConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("could not read '{}': {}", path.display(), e))?;
    EngineConfig::from_toml_str(&content).map_err(|e| format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.capture.weather_url, DEFAULT_WEATHER_URL);
        assert_eq!(config.reconciler.interval(), Duration::from_secs(2));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = EngineConfig::from_toml_str(
            "[retry]\nmax_attempts = 8\n\n[capture]\nenabled = true\nlatitude = -7.25\nlongitude = 112.75\n",
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 8);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert!(config.capture.enabled);
        assert_eq!(config.capture.latitude, Some(-7.25));
        assert_eq!(config.capture.timeout(), Duration::from_secs(3));
        assert_eq!(
            config.capture.site(),
            Some(Location {
                latitude: -7.25,
                longitude: 112.75
            })
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = EngineConfig::from_toml_str("[retry]\nmax_retries = 3\n").unwrap_err();
        assert!(err.contains("max_retries"), "{err}");
    }

    #[test]
    fn validate_reports_all_problems() {
        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        config.capture.latitude = Some(10.0);
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2, "{errors:?}");
    }
}
