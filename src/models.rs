use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discretized severity of a continuous reading. Ordered `Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RiskLevel::Low => "Low Risk",
            RiskLevel::Medium => "Moderate Risk",
            RiskLevel::High => "High Risk",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a snapshot or history series came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataOrigin {
    Live,
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub temperature: f64,
    pub humidity: f64,
    pub air_quality: f64,
    pub heat_risk: RiskLevel,
    pub air_risk: RiskLevel,
    pub overall_risk: RiskLevel,
    pub health_score: u8,
    pub recommendation: String,
    pub timestamp: DateTime<Utc>,
    pub origin: DataOrigin,
}

impl MetricsSnapshot {
    pub fn health_band(&self) -> HealthBand {
        HealthBand::from_score(self.health_score)
    }
}

/// Gauge banding for the 0-100 health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthBand {
    Poor,
    Fair,
    Good,
}

impl HealthBand {
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=49 => HealthBand::Poor,
            50..=79 => HealthBand::Fair,
            _ => HealthBand::Good,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthBand::Poor => "poor",
            HealthBand::Fair => "fair",
            HealthBand::Good => "good",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    pub timestamp: String,
    pub temperature: f64,
    pub humidity: f64,
    pub air_quality: f64,
}

/// Chart-ready history, oldest point first.
#[derive(Debug, Clone, PartialEq)]
pub struct HistorySeries {
    pub points: Vec<HistoryPoint>,
    pub origin: DataOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum Severity {
    Mild,
    Moderate,
    Severe,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Mild => "Mild",
            Severity::Moderate => "Moderate",
            Severity::Severe => "Severe",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A symptom as entered by the user, before the journal assigns identity.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSymptom {
    pub symptom: String,
    pub severity: Severity,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedSymptom {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub symptom: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}
