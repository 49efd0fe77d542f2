//! Fixed readings, for fixed sites and tests.

use async_trait::async_trait;
use lotline_core::{Location, WeatherReading};

use super::{CaptureError, ProvenanceCapture};

/// Returns the configured readings; a missing reading is `Unavailable`.
#[derive(Debug, Clone, Default)]
pub struct StaticCapture {
    location: Option<Location>,
    weather: Option<WeatherReading>,
}

impl StaticCapture {
    pub fn new(location: Option<Location>, weather: Option<WeatherReading>) -> Self {
        StaticCapture { location, weather }
    }

    /// A source where every reading fails.
    pub fn unavailable() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProvenanceCapture for StaticCapture {
    async fn current_location(&self) -> Result<Location, CaptureError> {
        self.location
            .ok_or_else(|| CaptureError::Unavailable("no location configured".to_string()))
    }

    async fn current_weather(&self, _location: Location) -> Result<WeatherReading, CaptureError> {
        self.weather
            .clone()
            .ok_or_else(|| CaptureError::Unavailable("no weather configured".to_string()))
    }

    fn source_id(&self) -> &str {
        "static"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unavailable_fails_both_readings() {
        let capture = StaticCapture::unavailable();
        assert!(capture.current_location().await.is_err());
        let loc = Location {
            latitude: 0.0,
            longitude: 0.0,
        };
        assert!(matches!(
            capture.current_weather(loc).await,
            Err(CaptureError::Unavailable(_))
        ));
    }
}
