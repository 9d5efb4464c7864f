use std::fmt::Write;
use std::path::Path;

use crate::models::{DataOrigin, HistoryPoint, HistorySeries, LoggedSymptom, MetricsSnapshot};

#[derive(Debug, Clone, PartialEq)]
pub struct MetricRange {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistorySummary {
    pub count: usize,
    pub temperature: MetricRange,
    pub humidity: MetricRange,
    pub air_quality: MetricRange,
}

fn range(values: impl Iterator<Item = f64>) -> Option<MetricRange> {
    let mut count = 0usize;
    let mut total = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;

    for value in values {
        count += 1;
        total += value;
        min = min.min(value);
        max = max.max(value);
    }

    if count == 0 {
        return None;
    }

    Some(MetricRange {
        min,
        avg: total / count as f64,
        max,
    })
}

pub fn summarize_history(points: &[HistoryPoint]) -> Option<HistorySummary> {
    Some(HistorySummary {
        count: points.len(),
        temperature: range(points.iter().map(|p| p.temperature))?,
        humidity: range(points.iter().map(|p| p.humidity))?,
        air_quality: range(points.iter().map(|p| p.air_quality))?,
    })
}

pub fn write_history_csv(path: &Path, points: &[HistoryPoint]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for point in points {
        writer.serialize(point)?;
    }
    writer.flush()?;
    Ok(())
}

fn origin_note(origin: DataOrigin) -> Option<&'static str> {
    match origin {
        DataOrigin::Live => None,
        DataOrigin::Synthetic => {
            Some("> Backend unavailable: showing synthetic demo data, not live sensor readings.")
        }
    }
}

pub fn build_report(
    snapshot: &MetricsSnapshot,
    history: &HistorySeries,
    symptoms: &[LoggedSymptom],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# EcoBreath Dashboard");
    let _ = writeln!(
        output,
        "Observed at {}",
        snapshot.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(note) = origin_note(snapshot.origin) {
        let _ = writeln!(output);
        let _ = writeln!(output, "{note}");
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Current Conditions");
    let _ = writeln!(output, "- Temperature: {:.1} °C", snapshot.temperature);
    let _ = writeln!(output, "- Humidity: {:.0}%", snapshot.humidity);
    let _ = writeln!(output, "- Air quality: {:.0} AQI", snapshot.air_quality);
    let _ = writeln!(
        output,
        "- Health score: {}/100 ({})",
        snapshot.health_score,
        snapshot.health_band().as_str()
    );
    let _ = writeln!(output, "- Recommendation: {}", snapshot.recommendation);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Risk Assessment");
    let _ = writeln!(output, "- Heat stress: {}", snapshot.heat_risk.label());
    let _ = writeln!(output, "- Air quality: {}", snapshot.air_risk.label());
    let _ = writeln!(output, "- Overall: {}", snapshot.overall_risk.label());

    let _ = writeln!(output);
    let _ = writeln!(output, "## History");
    if let Some(note) = origin_note(history.origin) {
        let _ = writeln!(output, "{note}");
        let _ = writeln!(output);
    }

    match summarize_history(&history.points) {
        None => {
            let _ = writeln!(output, "No history available.");
        }
        Some(summary) => {
            let _ = writeln!(output, "{} readings (oldest first).", summary.count);
            let _ = writeln!(output);
            for (label, metric) in [
                ("Temperature", &summary.temperature),
                ("Humidity", &summary.humidity),
                ("Air quality", &summary.air_quality),
            ] {
                let _ = writeln!(
                    output,
                    "- {}: min {:.1}, avg {:.1}, max {:.1}",
                    label, metric.min, metric.avg, metric.max
                );
            }

            let _ = writeln!(output);
            let _ = writeln!(output, "| Time | Temp (°C) | Humidity (%) | AQI |");
            let _ = writeln!(output, "|------|-----------|--------------|-----|");
            for point in history.points.iter() {
                let _ = writeln!(
                    output,
                    "| {} | {:.1} | {:.0} | {:.0} |",
                    point.timestamp, point.temperature, point.humidity, point.air_quality
                );
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Symptoms");
    if symptoms.is_empty() {
        let _ = writeln!(output, "No symptoms logged yet.");
    } else {
        for symptom in symptoms.iter().take(5) {
            let _ = write!(
                output,
                "- {} ({}) on {}",
                symptom.symptom,
                symptom.severity,
                symptom.timestamp.format("%a %b %e %H:%M")
            );
            match &symptom.notes {
                Some(notes) => {
                    let _ = writeln!(output, ": {}", notes);
                }
                None => {
                    let _ = writeln!(output);
                }
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::models::Severity;
    use crate::risk;

    fn point(timestamp: &str, temperature: f64, humidity: f64, air_quality: f64) -> HistoryPoint {
        HistoryPoint {
            timestamp: timestamp.to_string(),
            temperature,
            humidity,
            air_quality,
        }
    }

    #[test]
    fn summary_tracks_min_avg_max() {
        let points = vec![
            point("10:00", 20.0, 40.0, 30.0),
            point("10:05", 30.0, 60.0, 90.0),
        ];
        let summary = summarize_history(&points).unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(
            summary.temperature,
            MetricRange {
                min: 20.0,
                avg: 25.0,
                max: 30.0
            }
        );
        assert_eq!(summary.air_quality.avg, 60.0);
        assert!(summarize_history(&[]).is_none());
    }

    #[test]
    fn report_flags_synthetic_data_and_lists_symptoms() {
        let snapshot = risk::aggregate(36.0, 45.0, 20.0);
        let history = HistorySeries {
            points: vec![point("09:55", 34.0, 45.0, 22.0), point("10:00", 36.0, 45.0, 20.0)],
            origin: DataOrigin::Synthetic,
        };
        let symptoms = vec![LoggedSymptom {
            id: "1".to_string(),
            timestamp: Utc::now(),
            symptom: "Wheezing".to_string(),
            severity: Severity::Severe,
            notes: Some("after walking outside".to_string()),
        }];

        let report = build_report(&snapshot, &history, &symptoms);
        assert!(report.contains("synthetic demo data"));
        assert!(report.contains("- Overall: High Risk"));
        assert!(report.contains("- Heat stress: High Risk"));
        assert!(report.contains("- Health score: 78/100 (fair)"));
        assert!(report.contains("| 10:00 | 36.0 | 45 | 20 |"));
        assert!(report.contains("Wheezing (Severe)"));
        assert!(report.contains(": after walking outside"));
    }

    #[test]
    fn live_report_without_history_or_symptoms() {
        let mut snapshot = risk::aggregate(22.0, 45.0, 20.0);
        snapshot.origin = DataOrigin::Live;
        let history = HistorySeries {
            points: Vec::new(),
            origin: DataOrigin::Live,
        };

        let report = build_report(&snapshot, &history, &[]);
        assert!(!report.contains("synthetic"));
        assert!(report.contains("No history available."));
        assert!(report.contains("No symptoms logged yet."));
    }

    #[test]
    fn history_csv_has_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.csv");
        write_history_csv(&path, &[point("10:00", 21.5, 40.0, 33.0)]).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let mut lines = written.lines();
        assert_eq!(lines.next(), Some("timestamp,temperature,humidity,airQuality"));
        assert_eq!(lines.next(), Some("10:00,21.5,40.0,33.0"));
    }
}
