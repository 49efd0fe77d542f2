//! Weather from the Open-Meteo forecast API, location from a fixed site.
//!
//! Uses `ureq` (sync) wrapped in `tokio::task::spawn_blocking` to avoid
//! blocking the async runtime.

use std::time::Duration;

use async_trait::async_trait;
use lotline_core::{Location, WeatherReading};
use serde::Deserialize;

use super::{CaptureError, ProvenanceCapture};

const CURRENT_FIELDS: &str =
    "temperature_2m,relative_humidity_2m,weather_code,wind_speed_10m,surface_pressure";

pub struct OpenMeteoCapture {
    site: Location,
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current: CurrentConditions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CurrentConditions {
    pub time: String,
    pub temperature_2m: f64,
    pub relative_humidity_2m: f64,
    pub weather_code: u16,
    #[serde(default)]
    pub wind_speed_10m: Option<f64>,
    #[serde(default)]
    pub surface_pressure: Option<f64>,
}

impl OpenMeteoCapture {
    pub fn new(site: Location, base_url: &str, timeout: Duration) -> Self {
        OpenMeteoCapture {
            site,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn forecast_url(&self, location: Location) -> String {
        format!(
            "{}?latitude={}&longitude={}&current={}&timezone=auto",
            self.base_url, location.latitude, location.longitude, CURRENT_FIELDS
        )
    }
}

/// WMO weather code to `(conditions, description)`.
pub fn describe_weather_code(code: u16) -> (&'static str, &'static str) {
    match code {
        0 => ("Clear", "Clear sky"),
        1 => ("Partly Cloudy", "Mainly clear"),
        2 => ("Partly Cloudy", "Partly cloudy"),
        3 => ("Cloudy", "Overcast"),
        45 => ("Foggy", "Foggy"),
        48 => ("Foggy", "Depositing rime fog"),
        51 => ("Drizzle", "Light drizzle"),
        53 => ("Drizzle", "Moderate drizzle"),
        55 => ("Drizzle", "Dense drizzle"),
        61 => ("Rainy", "Slight rain"),
        63 => ("Rainy", "Moderate rain"),
        65 => ("Rainy", "Heavy rain"),
        71 => ("Snowy", "Slight snow"),
        73 => ("Snowy", "Moderate snow"),
        75 => ("Snowy", "Heavy snow"),
        95 => ("Stormy", "Thunderstorm"),
        _ => ("Unknown", "Unknown conditions"),
    }
}

pub fn reading_from_current(current: &CurrentConditions) -> WeatherReading {
    let (conditions, description) = describe_weather_code(current.weather_code);
    WeatherReading {
        temperature: (current.temperature_2m * 10.0).round() / 10.0,
        humidity: current.relative_humidity_2m.round(),
        conditions: conditions.to_string(),
        description: description.to_string(),
        wind_speed: current.wind_speed_10m,
        pressure: current.surface_pressure,
        observed_at: current.time.clone(),
        source: "Open-Meteo".to_string(),
    }
}

#[async_trait]
impl ProvenanceCapture for OpenMeteoCapture {
    async fn current_location(&self) -> Result<Location, CaptureError> {
        Ok(self.site)
    }

    async fn current_weather(&self, location: Location) -> Result<WeatherReading, CaptureError> {
        let url = self.forecast_url(location);
        let timeout = self.timeout;

        let current = tokio::task::spawn_blocking(move || {
            let agent: ureq::Agent = ureq::Agent::config_builder()
                .timeout_global(Some(timeout))
                .build()
                .into();
            let response = agent
                .get(&url)
                .call()
                .map_err(|e| CaptureError::Unavailable(e.to_string()))?;
            let body: ForecastResponse = response.into_body().read_json().map_err(|e| {
                CaptureError::Unavailable(format!("failed to parse forecast: {e}"))
            })?;
            Ok::<_, CaptureError>(body.current)
        })
        .await
        .map_err(|e| CaptureError::Unavailable(format!("task join error: {e}")))??;

        Ok(reading_from_current(&current))
    }

    fn source_id(&self) -> &str {
        "open-meteo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_and_unknown_codes() {
        assert_eq!(describe_weather_code(0), ("Clear", "Clear sky"));
        assert_eq!(describe_weather_code(63), ("Rainy", "Moderate rain"));
        assert_eq!(describe_weather_code(95), ("Stormy", "Thunderstorm"));
        assert_eq!(describe_weather_code(99), ("Unknown", "Unknown conditions"));
    }

    #[test]
    fn reading_rounds_like_the_dashboard() {
        let current = CurrentConditions {
            time: "2025-03-01T06:00".to_string(),
            temperature_2m: 27.46,
            relative_humidity_2m: 80.6,
            weather_code: 61,
            wind_speed_10m: Some(4.3),
            surface_pressure: None,
        };
        let reading = reading_from_current(&current);
        assert_eq!(reading.temperature, 27.5);
        assert_eq!(reading.humidity, 81.0);
        assert_eq!(reading.conditions, "Rainy");
        assert_eq!(reading.source, "Open-Meteo");
        assert_eq!(reading.observed_at, "2025-03-01T06:00");
    }

    #[test]
    fn parses_forecast_body() {
        let body = r#"{"latitude":-7.25,"current":{"time":"2025-03-01T06:00","interval":900,
            "temperature_2m":26.1,"relative_humidity_2m":88,"weather_code":3,
            "wind_speed_10m":5.2,"surface_pressure":1008.4}}"#;
        let parsed: ForecastResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.current.weather_code, 3);
        assert_eq!(parsed.current.surface_pressure, Some(1008.4));
    }

    #[test]
    fn forecast_url_carries_coordinates() {
        let capture = OpenMeteoCapture::new(
            Location {
                latitude: -7.25,
                longitude: 112.75,
            },
            "https://api.open-meteo.com/v1/forecast/",
            Duration::from_secs(3),
        );
        let url = capture.forecast_url(Location {
            latitude: -7.25,
            longitude: 112.75,
        });
        assert!(url.starts_with("https://api.open-meteo.com/v1/forecast?latitude=-7.25&longitude=112.75"));
        assert!(url.contains("weather_code"));
    }
}
