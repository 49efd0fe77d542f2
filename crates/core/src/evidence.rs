//! Evidence attached to a phase decision and the Collection-phase details.
//!
//! Every evidence field is independently optional. Location and weather
//! come from external capture sources that may be unavailable; a decision
//! with partial evidence is still a valid decision.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::macros::format_description;

use crate::phase::Phase;

/// A geolocation reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A weather observation for a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    /// Degrees Celsius, one decimal place.
    pub temperature: f64,
    /// Relative humidity percentage.
    pub humidity: f64,
    pub conditions: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    /// Observation time as reported by the source.
    pub observed_at: String,
    /// Name of the source that produced the reading.
    pub source: String,
}

/// Reference to a supporting document held in external storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    /// Content address of the stored bytes.
    pub content_hash: String,
}

/// Supporting evidence for one decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weather: Option<WeatherReading>,
    /// Structured lab results. Only accepted at the Testing phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_results: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<DocumentRef>,
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

impl FieldIssue {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        FieldIssue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl Evidence {
    /// Check the evidence against the phase it is submitted for.
    pub fn validate(&self, phase: Phase) -> Vec<FieldIssue> {
        let mut issues = Vec::new();
        if let Some(location) = &self.location {
            if !location.is_valid() {
                issues.push(FieldIssue::new("location", "coordinates out of range"));
            }
        }
        if let Some(results) = &self.test_results {
            if phase != Phase::Testing {
                issues.push(FieldIssue::new(
                    "test_results",
                    format!("test results are only accepted at the testing phase, not {phase}"),
                ));
            } else if !results.is_object() {
                issues.push(FieldIssue::new("test_results", "must be a JSON object"));
            }
        }
        for (i, doc) in self.documents.iter().enumerate() {
            if doc.file_name.trim().is_empty() {
                issues.push(FieldIssue::new(&format!("documents[{i}].file_name"), "required"));
            }
            if doc.content_hash.trim().is_empty() {
                issues.push(FieldIssue::new(
                    &format!("documents[{i}].content_hash"),
                    "required",
                ));
            }
        }
        issues
    }
}

/// Details captured by the collector when a batch is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionDetails {
    /// `YYYY-MM-DD`.
    #[serde(default)]
    pub harvest_date: Option<String>,
    /// Seed or crop name.
    #[serde(default)]
    pub material_name: Option<String>,
    #[serde(default)]
    pub treatment_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatment_quantity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_weight: Option<Decimal>,
    /// `unit_price * total_weight`, filled in by [`CollectionDetails::validated`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_value: Option<Decimal>,
}

fn blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

impl CollectionDetails {
    /// Validate required fields and return a copy with `total_value`
    /// recomputed. Any client-supplied `total_value` is discarded.
    pub fn validated(&self) -> Result<CollectionDetails, Vec<FieldIssue>> {
        let mut issues = Vec::new();

        match self.harvest_date.as_deref().map(str::trim) {
            None | Some("") => issues.push(FieldIssue::new("harvest_date", "required")),
            Some(date) => {
                let format = format_description!("[year]-[month]-[day]");
                if time::Date::parse(date, &format).is_err() {
                    issues.push(FieldIssue::new("harvest_date", "expected YYYY-MM-DD"));
                }
            }
        }
        if blank(&self.material_name) {
            issues.push(FieldIssue::new("material_name", "required"));
        }
        if self.treatment_used {
            if blank(&self.treatment_name) {
                issues.push(FieldIssue::new(
                    "treatment_name",
                    "required when treatment_used is set",
                ));
            }
            if blank(&self.treatment_quantity) {
                issues.push(FieldIssue::new(
                    "treatment_quantity",
                    "required when treatment_used is set",
                ));
            }
        }
        if self.unit_price.is_some_and(|p| p.is_sign_negative()) {
            issues.push(FieldIssue::new("unit_price", "must not be negative"));
        }
        if self.total_weight.is_some_and(|w| w.is_sign_negative()) {
            issues.push(FieldIssue::new("total_weight", "must not be negative"));
        }

        let total_value = match (self.unit_price, self.total_weight) {
            (Some(price), Some(weight)) => {
                let product = price.checked_mul(weight);
                if product.is_none() {
                    issues.push(FieldIssue::new(
                        "total_value",
                        "unit_price * total_weight overflows",
                    ));
                }
                product
            }
            _ => None,
        };

        if !issues.is_empty() {
            return Err(issues);
        }
        Ok(CollectionDetails {
            total_value,
            ..self.clone()
        })
    }
}
