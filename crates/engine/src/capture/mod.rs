//! Provenance capture: location and weather readings attached as evidence.
//!
//! Capture is best-effort. Each reading is independently timed out and a
//! failed reading leaves the corresponding evidence field empty; it never
//! fails the decision it belongs to.

pub mod open_meteo;
pub mod static_capture;

use std::time::Duration;

use async_trait::async_trait;
use lotline_core::{Evidence, Location, WeatherReading};

use crate::error::EngineError;

pub use open_meteo::OpenMeteoCapture;
pub use static_capture::StaticCapture;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("timed out after {0} ms")]
    TimedOut(u128),
}

/// Source of location and weather readings.
#[async_trait]
pub trait ProvenanceCapture: Send + Sync {
    async fn current_location(&self) -> Result<Location, CaptureError>;

    async fn current_weather(&self, location: Location) -> Result<WeatherReading, CaptureError>;

    /// Short name used in logs.
    fn source_id(&self) -> &str;
}

/// Evidence after capture, with an `EvidenceUnavailable` for every reading
/// that failed.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutcome {
    pub evidence: Evidence,
    pub warnings: Vec<EngineError>,
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T, CaptureError>>,
) -> Result<T, CaptureError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CaptureError::TimedOut(limit.as_millis())),
    }
}

/// Fill the location and weather fields the caller left empty.
///
/// Fields already supplied are kept as is. Weather is only fetched when a
/// location is known.
pub async fn gather(
    capture: &dyn ProvenanceCapture,
    limit: Duration,
    mut evidence: Evidence,
) -> CaptureOutcome {
    let mut warnings = Vec::new();

    if evidence.location.is_none() {
        match with_timeout(limit, capture.current_location()).await {
            Ok(location) => evidence.location = Some(location),
            Err(e) => {
                tracing::warn!(source = capture.source_id(), error = %e, "location capture failed");
                warnings.push(EngineError::EvidenceUnavailable(format!("location: {e}")));
            }
        }
    }

    if evidence.weather.is_none() {
        if let Some(location) = evidence.location {
            match with_timeout(limit, capture.current_weather(location)).await {
                Ok(reading) => evidence.weather = Some(reading),
                Err(e) => {
                    tracing::warn!(source = capture.source_id(), error = %e, "weather capture failed");
                    warnings.push(EngineError::EvidenceUnavailable(format!("weather: {e}")));
                }
            }
        }
    }

    CaptureOutcome { evidence, warnings }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> WeatherReading {
        WeatherReading {
            temperature: 27.5,
            humidity: 80.0,
            conditions: "Rainy".to_string(),
            description: "Slight rain".to_string(),
            wind_speed: None,
            pressure: None,
            observed_at: "2025-03-01T06:00".to_string(),
            source: "static".to_string(),
        }
    }

    struct SlowCapture;

    #[async_trait]
    impl ProvenanceCapture for SlowCapture {
        async fn current_location(&self) -> Result<Location, CaptureError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Location {
                latitude: 0.0,
                longitude: 0.0,
            })
        }

        async fn current_weather(&self, _: Location) -> Result<WeatherReading, CaptureError> {
            Err(CaptureError::Unavailable("unused".to_string()))
        }

        fn source_id(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn fills_missing_fields() {
        let capture = StaticCapture::new(
            Some(Location {
                latitude: -7.2,
                longitude: 112.7,
            }),
            Some(reading()),
        );
        let outcome = gather(&capture, Duration::from_secs(1), Evidence::default()).await;
        assert!(outcome.warnings.is_empty());
        assert!(outcome.evidence.location.is_some());
        assert_eq!(outcome.evidence.weather, Some(reading()));
    }

    #[tokio::test]
    async fn keeps_supplied_fields() {
        let supplied = Location {
            latitude: 1.0,
            longitude: 2.0,
        };
        let capture = StaticCapture::new(
            Some(Location {
                latitude: 9.0,
                longitude: 9.0,
            }),
            None,
        );
        let evidence = Evidence {
            location: Some(supplied),
            ..Evidence::default()
        };
        let outcome = gather(&capture, Duration::from_secs(1), evidence).await;
        assert_eq!(outcome.evidence.location, Some(supplied));
        assert_eq!(outcome.warnings.len(), 1);
        assert!(matches!(
            &outcome.warnings[0],
            EngineError::EvidenceUnavailable(m) if m.starts_with("weather")
        ));
    }

    #[tokio::test]
    async fn unavailable_location_skips_weather() {
        let capture = StaticCapture::new(None, Some(reading()));
        let outcome = gather(&capture, Duration::from_secs(1), Evidence::default()).await;
        assert!(outcome.evidence.location.is_none());
        assert!(outcome.evidence.weather.is_none());
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[tokio::test]
    async fn slow_source_times_out() {
        let outcome = gather(&SlowCapture, Duration::from_millis(20), Evidence::default()).await;
        assert!(outcome.evidence.location.is_none());
        assert_eq!(
            outcome.warnings,
            vec![EngineError::EvidenceUnavailable(
                "location: timed out after 20 ms".to_string()
            )]
        );
    }
}
