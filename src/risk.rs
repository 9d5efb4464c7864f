use chrono::{DateTime, Utc};

use crate::models::{DataOrigin, MetricsSnapshot, RiskLevel};

/// Heuristic scoring constants. These are product decisions, not a medical model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringConfig {
    pub heat_medium: f64,
    pub heat_high: f64,
    pub air_medium: f64,
    pub air_high: f64,
    /// Temperature above which the score starts losing points.
    pub comfort_temperature: f64,
    pub temperature_penalty: f64,
    /// AQI above which the score starts losing points.
    pub aqi_baseline: f64,
    pub aqi_penalty: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            heat_medium: 30.0,
            heat_high: 35.0,
            air_medium: 50.0,
            air_high: 100.0,
            comfort_temperature: 25.0,
            temperature_penalty: 2.0,
            aqi_baseline: 50.0,
            aqi_penalty: 0.4,
        }
    }
}

pub fn classify(value: f64, medium_threshold: f64, high_threshold: f64) -> RiskLevel {
    if value >= high_threshold {
        RiskLevel::High
    } else if value >= medium_threshold {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

pub fn recommendation_for(risk: RiskLevel) -> &'static str {
    match risk {
        RiskLevel::Low => "Optimal air and temperature. Safe for outdoor activities.",
        RiskLevel::Medium => {
            "Moderate conditions. Sensitive groups should exercise caution outdoors."
        }
        RiskLevel::High => "High stress risk. Hydrate and avoid outdoor activity.",
    }
}

pub fn health_score(config: &ScoringConfig, temperature: f64, air_quality: f64) -> u8 {
    let mut score = 100.0;
    score -= (temperature - config.comfort_temperature).max(0.0) * config.temperature_penalty;
    score -= (air_quality - config.aqi_baseline).max(0.0) * config.aqi_penalty;
    score.round().clamp(0.0, 100.0) as u8
}

#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    config: ScoringConfig,
}

impl Aggregator {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn aggregate(&self, temperature: f64, humidity: f64, air_quality: f64) -> MetricsSnapshot {
        self.aggregate_at(temperature, humidity, air_quality, Utc::now())
    }

    pub fn aggregate_at(
        &self,
        temperature: f64,
        humidity: f64,
        air_quality: f64,
        timestamp: DateTime<Utc>,
    ) -> MetricsSnapshot {
        let heat_risk = classify(temperature, self.config.heat_medium, self.config.heat_high);
        let air_risk = classify(air_quality, self.config.air_medium, self.config.air_high);
        let overall_risk = heat_risk.max(air_risk);

        MetricsSnapshot {
            temperature,
            humidity,
            air_quality,
            heat_risk,
            air_risk,
            overall_risk,
            health_score: health_score(&self.config, temperature, air_quality),
            recommendation: recommendation_for(overall_risk).to_string(),
            timestamp,
            origin: DataOrigin::Synthetic,
        }
    }
}

#[cfg(test)]
pub fn aggregate(temperature: f64, humidity: f64, air_quality: f64) -> MetricsSnapshot {
    Aggregator::default().aggregate(temperature, humidity, air_quality)
}
