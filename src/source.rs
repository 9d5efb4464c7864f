use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{DataOrigin, HistoryPoint, HistorySeries, MetricsSnapshot, RiskLevel, Severity};
use crate::synthetic::SyntheticSource;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_RECOMMENDATION: &str = "Conditions are stable. Maintain current activities.";

pub const COMMON_SYMPTOMS: [&str; 7] = [
    "Cough",
    "Wheezing",
    "Shortness of Breath",
    "Chest Tightness",
    "Asthma Attack",
    "Headache",
    "Fatigue",
];

#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn fetch_latest(&self) -> Result<MetricsSnapshot, SourceError>;
    async fn fetch_history(&self) -> Result<HistorySeries, SourceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("malformed payload from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// What to do when the backend cannot be reached or returns garbage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Serve synthetic data marked with [`DataOrigin::Synthetic`].
    #[default]
    Synthetic,
    /// Return the error to the caller.
    Surface,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub policy: FallbackPolicy,
    pub synthetic_delay: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_millis(5000),
            policy: FallbackPolicy::Synthetic,
            synthetic_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SensorReadings {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub aqi: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HealthAssessment {
    #[serde(default)]
    pub health_score: Option<f64>,
    #[serde(default)]
    pub overall_status: Option<String>,
    #[serde(default)]
    pub heat_stress_risk: Option<String>,
    #[serde(default)]
    pub asthma_attack_risk: Option<String>,
    #[serde(default)]
    pub recommendations: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LatestPayload {
    #[serde(default)]
    pub sensor_readings: Option<SensorReadings>,
    #[serde(default)]
    pub health_assessment: Option<HealthAssessment>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryReading {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub sensor_readings: Option<SensorReadings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryPayload {
    #[serde(default)]
    pub readings: Vec<HistoryReading>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiaryItem {
    pub name: String,
    pub severity: String,
}

/// Body of `POST /symptom-diary`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiaryEntry {
    pub symptoms: Vec<DiaryItem>,
    pub other_symptoms: Vec<DiaryItem>,
    pub notes: Option<String>,
}

/// Maps a backend status word onto a risk band. Unknown words are `Low`.
pub fn map_status(status: &str) -> RiskLevel {
    match status.trim().to_lowercase().as_str() {
        "caution" | "moderate" => RiskLevel::Medium,
        "alert" | "high" | "severe" => RiskLevel::High,
        _ => RiskLevel::Low,
    }
}

fn map_optional_status(status: Option<&str>) -> RiskLevel {
    status.map(map_status).unwrap_or(RiskLevel::Low)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

pub fn adapt_latest(payload: LatestPayload, received_at: DateTime<Utc>) -> MetricsSnapshot {
    let readings = payload.sensor_readings.unwrap_or_default();
    let assessment = payload.health_assessment.unwrap_or_default();

    let heat_risk = map_optional_status(assessment.heat_stress_risk.as_deref());
    let air_risk = map_optional_status(assessment.asthma_attack_risk.as_deref());
    // Backend statuses are not guaranteed consistent; never report an overall
    // band below either component.
    let overall_risk = map_optional_status(assessment.overall_status.as_deref())
        .max(heat_risk)
        .max(air_risk);

    let recommendation = assessment
        .recommendations
        .and_then(|list| list.into_iter().next())
        .unwrap_or_else(|| DEFAULT_RECOMMENDATION.to_string());

    let timestamp = payload
        .timestamp
        .as_deref()
        .and_then(parse_timestamp)
        .unwrap_or(received_at);

    MetricsSnapshot {
        temperature: readings.temperature.unwrap_or(0.0),
        humidity: readings.humidity.unwrap_or(0.0),
        air_quality: readings.aqi.unwrap_or(0.0),
        heat_risk,
        air_risk,
        overall_risk,
        health_score: assessment.health_score.unwrap_or(0.0).round().clamp(0.0, 100.0) as u8,
        recommendation,
        timestamp,
        origin: DataOrigin::Live,
    }
}

/// Converts newest-first backend readings into chart order (oldest first).
/// Readings with unparseable timestamps keep their raw text and sort first.
pub fn adapt_history(payload: HistoryPayload) -> Vec<HistoryPoint> {
    // Reversed first so ties, including unparseable timestamps, stay oldest first.
    let mut readings: Vec<(Option<DateTime<Utc>>, HistoryReading)> = payload
        .readings
        .into_iter()
        .rev()
        .map(|reading| {
            let parsed = reading.timestamp.as_deref().and_then(parse_timestamp);
            (parsed, reading)
        })
        .collect();

    readings.sort_by_key(|(parsed, _)| *parsed);

    readings
        .into_iter()
        .map(|(parsed, reading)| {
            let sensors = reading.sensor_readings.unwrap_or_default();
            let timestamp = match parsed {
                Some(at) => at.with_timezone(&Local).format("%H:%M").to_string(),
                None => reading.timestamp.unwrap_or_default(),
            };
            HistoryPoint {
                timestamp,
                temperature: sensors.temperature.unwrap_or(0.0),
                humidity: sensors.humidity.unwrap_or(0.0),
                air_quality: sensors.aqi.unwrap_or(0.0),
            }
        })
        .collect()
}

pub fn diary_entry(symptom: &str, severity: Severity, notes: Option<&str>) -> DiaryEntry {
    let symptom = symptom.trim();
    let severity = severity.as_str().to_lowercase();

    let mut entry = DiaryEntry {
        symptoms: Vec::new(),
        other_symptoms: Vec::new(),
        notes: notes
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string),
    };

    match COMMON_SYMPTOMS
        .iter()
        .find(|known| known.eq_ignore_ascii_case(symptom))
    {
        Some(known) => entry.symptoms.push(DiaryItem {
            name: known.to_string(),
            severity,
        }),
        None => entry.other_symptoms.push(DiaryItem {
            name: symptom.to_string(),
            severity,
        }),
    }

    entry
}

/// Sensor gateways usually run on the same machine; never route those through a proxy.
pub(crate) fn is_loopback(base_url: &str) -> bool {
    reqwest::Url::parse(base_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .is_some_and(|host| matches!(host.as_str(), "localhost" | "127.0.0.1" | "[::1]"))
}

pub struct RemoteSource {
    client: reqwest::Client,
    base_url: String,
    policy: FallbackPolicy,
    fallback: SyntheticSource,
}

impl RemoteSource {
    pub fn new(config: &SourceConfig, fallback: SyntheticSource) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if is_loopback(&config.base_url) {
            builder = builder.no_proxy();
        }
        let client = builder.build().map_err(SourceError::Client)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            policy: config.policy,
            fallback,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SourceError> {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| SourceError::Http {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status { url, status });
        }

        let body = response.bytes().await.map_err(|source| SourceError::Http {
            url: url.clone(),
            source,
        })?;
        serde_json::from_slice(&body).map_err(|source| SourceError::Decode { url, source })
    }

    /// Mirrors a symptom to the backend diary. Returns `false` on any failure.
    pub async fn post_log(&self, symptom: &str, severity: Severity, notes: Option<&str>) -> bool {
        let url = self.url("symptom-diary");
        let entry = diary_entry(symptom, severity, notes);

        match self.client.post(&url).json(&entry).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(symptom, "symptom posted to diary");
                true
            }
            Ok(response) => {
                warn!(status = %response.status(), "symptom diary rejected entry");
                false
            }
            Err(err) => {
                warn!(error = %err, "failed to post symptom to diary");
                false
            }
        }
    }
}

#[async_trait]
impl MetricsSource for RemoteSource {
    async fn fetch_latest(&self) -> Result<MetricsSnapshot, SourceError> {
        match self.get_json::<LatestPayload>("latest-data").await {
            Ok(payload) => Ok(adapt_latest(payload, Utc::now())),
            Err(err) if self.policy == FallbackPolicy::Synthetic => {
                warn!(error = %err, "metrics API unavailable, serving synthetic snapshot");
                Ok(self.fallback.generate_latest())
            }
            Err(err) => Err(err),
        }
    }

    async fn fetch_history(&self) -> Result<HistorySeries, SourceError> {
        match self.get_json::<HistoryPayload>("history").await {
            Ok(payload) => Ok(HistorySeries {
                points: adapt_history(payload),
                origin: DataOrigin::Live,
            }),
            Err(err) if self.policy == FallbackPolicy::Synthetic => {
                warn!(error = %err, "history API unavailable, serving synthetic history");
                Ok(self.fallback.generate_history())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::Aggregator;
    use crate::test_support::{closed_port_url, stub_server};
    use serde_json::json;

    fn latest(value: serde_json::Value) -> MetricsSnapshot {
        let payload: LatestPayload = serde_json::from_value(value).unwrap();
        adapt_latest(payload, Utc::now())
    }

    fn fallback() -> SyntheticSource {
        SyntheticSource::seeded(Aggregator::default(), Duration::ZERO, 11)
    }

    fn remote(base_url: String, policy: FallbackPolicy) -> RemoteSource {
        let config = SourceConfig {
            base_url,
            timeout: Duration::from_millis(2000),
            policy,
            synthetic_delay: Duration::ZERO,
        };
        RemoteSource::new(&config, fallback()).unwrap()
    }

    #[test]
    fn status_mapping_is_case_insensitive_and_total() {
        assert_eq!(map_status("ALERT"), RiskLevel::High);
        assert_eq!(map_status("alert"), RiskLevel::High);
        assert_eq!(map_status("Alert"), RiskLevel::High);
        assert_eq!(map_status("Severe"), RiskLevel::High);
        assert_eq!(map_status("High"), RiskLevel::High);
        assert_eq!(map_status("Caution"), RiskLevel::Medium);
        assert_eq!(map_status("moderate"), RiskLevel::Medium);
        assert_eq!(map_status("Safe"), RiskLevel::Low);
        assert_eq!(map_status("Pending"), RiskLevel::Low);
        assert_eq!(map_status(""), RiskLevel::Low);
    }

    #[test]
    fn adapts_full_backend_payload() {
        let snapshot = latest(json!({
            "sensor_readings": {"temperature": 33.5, "humidity": 72.0, "aqi": 88},
            "health_assessment": {
                "health_score": 60,
                "overall_status": "Caution",
                "heat_stress_risk": "High",
                "asthma_attack_risk": "Pending",
                "recommendations": ["Hydrate immediately.", "Stay indoors."]
            },
            "timestamp": "2026-03-01T10:15:00+00:00"
        }));

        assert_eq!(snapshot.temperature, 33.5);
        assert_eq!(snapshot.humidity, 72.0);
        assert_eq!(snapshot.air_quality, 88.0);
        assert_eq!(snapshot.heat_risk, RiskLevel::High);
        assert_eq!(snapshot.air_risk, RiskLevel::Low);
        // "Caution" alone is Medium, but heat is High.
        assert_eq!(snapshot.overall_risk, RiskLevel::High);
        assert_eq!(snapshot.health_score, 60);
        assert_eq!(snapshot.recommendation, "Hydrate immediately.");
        assert_eq!(snapshot.timestamp.to_rfc3339(), "2026-03-01T10:15:00+00:00");
        assert_eq!(snapshot.origin, DataOrigin::Live);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let received_at = Utc::now();
        let payload: LatestPayload = serde_json::from_value(json!({
            "health_assessment": {"recommendations": []}
        }))
        .unwrap();
        let snapshot = adapt_latest(payload, received_at);

        assert_eq!(snapshot.temperature, 0.0);
        assert_eq!(snapshot.humidity, 0.0);
        assert_eq!(snapshot.air_quality, 0.0);
        assert_eq!(snapshot.health_score, 0);
        assert_eq!(snapshot.overall_risk, RiskLevel::Low);
        assert_eq!(snapshot.recommendation, DEFAULT_RECOMMENDATION);
        assert_eq!(snapshot.timestamp, received_at);
    }

    #[test]
    fn health_score_from_backend_is_clamped() {
        let snapshot = latest(json!({"health_assessment": {"health_score": 140.2}}));
        assert_eq!(snapshot.health_score, 100);
        let snapshot = latest(json!({"health_assessment": {"health_score": -3}}));
        assert_eq!(snapshot.health_score, 0);
    }

    #[test]
    fn history_is_sorted_oldest_first() {
        let payload: HistoryPayload = serde_json::from_value(json!({
            "readings": [
                {"timestamp": "2026-03-01T10:30:00Z", "sensor_readings": {"temperature": 3.0, "humidity": 50, "aqi": 40}},
                {"timestamp": "2026-03-01T10:10:00Z", "sensor_readings": {"temperature": 1.0, "humidity": 50, "aqi": 40}},
                {"timestamp": "2026-03-01T10:20:00.250", "sensor_readings": {"temperature": 2.0}}
            ]
        }))
        .unwrap();

        let points = adapt_history(payload);
        let temperatures: Vec<f64> = points.iter().map(|p| p.temperature).collect();
        assert_eq!(temperatures, vec![1.0, 2.0, 3.0]);
        assert_eq!(points[1].humidity, 0.0);
        assert_eq!(points[1].air_quality, 0.0);
    }

    #[test]
    fn unparseable_history_timestamps_keep_raw_text() {
        let payload: HistoryPayload = serde_json::from_value(json!({
            "readings": [
                {"timestamp": "2026-03-01T10:30:00Z", "sensor_readings": {"temperature": 2.0}},
                {"timestamp": "yesterday", "sensor_readings": {"temperature": 1.0}}
            ]
        }))
        .unwrap();

        let points = adapt_history(payload);
        assert_eq!(points[0].timestamp, "yesterday");
        assert_eq!(points[1].temperature, 2.0);
    }

    #[test]
    fn history_without_usable_timestamps_is_reversed_to_oldest_first() {
        let payload: HistoryPayload = serde_json::from_value(json!({
            "readings": [
                {"timestamp": "late", "sensor_readings": {"temperature": 3.0}},
                {"sensor_readings": {"temperature": 2.0}},
                {"timestamp": "early", "sensor_readings": {"temperature": 1.0}}
            ]
        }))
        .unwrap();

        let points = adapt_history(payload);
        let temperatures: Vec<f64> = points.iter().map(|p| p.temperature).collect();
        assert_eq!(temperatures, vec![1.0, 2.0, 3.0]);
        assert_eq!(points[0].timestamp, "early");
        assert_eq!(points[2].timestamp, "late");
    }

    #[test]
    fn diary_entry_buckets_known_and_other_symptoms() {
        let entry = diary_entry("shortness of breath", Severity::Severe, Some("  after a run "));
        assert_eq!(
            entry.symptoms,
            vec![DiaryItem {
                name: "Shortness of Breath".to_string(),
                severity: "severe".to_string()
            }]
        );
        assert!(entry.other_symptoms.is_empty());
        assert_eq!(entry.notes.as_deref(), Some("after a run"));

        let entry = diary_entry("Itchy eyes", Severity::Mild, Some("   "));
        assert!(entry.symptoms.is_empty());
        assert_eq!(entry.other_symptoms[0].name, "Itchy eyes");
        assert_eq!(entry.other_symptoms[0].severity, "mild");
        assert_eq!(entry.notes, None);
    }

    #[tokio::test]
    async fn fetch_latest_reads_live_payload() {
        let body = json!({
            "sensor_readings": {"temperature": 28.0, "humidity": 65.0, "aqi": 42},
            "health_assessment": {"health_score": 85, "overall_status": "Safe", "recommendations": []}
        })
        .to_string();
        let (base_url, mut requests) = stub_server("200 OK", body).await;

        let snapshot = remote(base_url, FallbackPolicy::Surface)
            .fetch_latest()
            .await
            .unwrap();

        assert_eq!(snapshot.origin, DataOrigin::Live);
        assert_eq!(snapshot.temperature, 28.0);
        assert_eq!(snapshot.health_score, 85);
        let request = requests.recv().await.unwrap();
        assert!(request.starts_with("GET /latest-data "));
    }

    #[tokio::test]
    async fn unreachable_backend_resolves_with_synthetic_snapshot() {
        let source = remote(closed_port_url().await, FallbackPolicy::Synthetic);

        let snapshot = source.fetch_latest().await.unwrap();
        assert_eq!(snapshot.origin, DataOrigin::Synthetic);
        assert!(snapshot.overall_risk >= snapshot.heat_risk.max(snapshot.air_risk));

        let history = source.fetch_history().await.unwrap();
        assert_eq!(history.origin, DataOrigin::Synthetic);
        assert_eq!(history.points.len(), 12);
    }

    #[tokio::test]
    async fn malformed_payload_is_surfaced_under_strict_policy() {
        let (base_url, _requests) = stub_server("200 OK", "not json".to_string()).await;
        let err = remote(base_url, FallbackPolicy::Surface)
            .fetch_latest()
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Decode { .. }));
    }

    #[tokio::test]
    async fn server_error_falls_back_by_default() {
        let (base_url, _requests) =
            stub_server("503 Service Unavailable", "{}".to_string()).await;
        let source = remote(base_url.clone(), FallbackPolicy::Synthetic);
        assert_eq!(
            source.fetch_latest().await.unwrap().origin,
            DataOrigin::Synthetic
        );

        let err = remote(base_url, FallbackPolicy::Surface)
            .fetch_history()
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Status { .. }));
    }

    #[tokio::test]
    async fn post_log_sends_bucketed_diary_entry() {
        let (base_url, mut requests) =
            stub_server("200 OK", json!({"status": "success"}).to_string()).await;
        let source = remote(base_url, FallbackPolicy::Synthetic);

        assert!(source.post_log("Cough", Severity::Moderate, None).await);

        let request = requests.recv().await.unwrap();
        assert!(request.starts_with("POST /symptom-diary "));
        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let posted: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(
            posted,
            json!({
                "symptoms": [{"name": "Cough", "severity": "moderate"}],
                "other_symptoms": [],
                "notes": null
            })
        );
    }

    #[tokio::test]
    async fn post_log_reports_failure_without_panicking() {
        let source = remote(closed_port_url().await, FallbackPolicy::Synthetic);
        assert!(!source.post_log("Cough", Severity::Mild, Some("note")).await);
    }
}
