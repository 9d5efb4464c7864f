use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::models::{DataOrigin, HistoryPoint, HistorySeries, MetricsSnapshot};
use crate::risk::Aggregator;
use crate::source::{MetricsSource, SourceError};

const HISTORY_POINTS: i64 = 12;
const HISTORY_SPACING_MINUTES: i64 = 5;

pub struct SyntheticSource {
    aggregator: Aggregator,
    rng: Mutex<StdRng>,
    delay: Duration,
}

impl SyntheticSource {
    pub fn new(aggregator: Aggregator, delay: Duration) -> Self {
        Self::with_rng(aggregator, delay, StdRng::from_entropy())
    }

    pub fn seeded(aggregator: Aggregator, delay: Duration, seed: u64) -> Self {
        Self::with_rng(aggregator, delay, StdRng::seed_from_u64(seed))
    }

    fn with_rng(aggregator: Aggregator, delay: Duration, rng: StdRng) -> Self {
        Self {
            aggregator,
            rng: Mutex::new(rng),
            delay,
        }
    }

    pub fn generate_latest(&self) -> MetricsSnapshot {
        let (temperature, humidity, air_quality) = {
            let mut rng = self.rng.lock();
            (
                reading(&mut *rng, 20.0, 38.0),
                reading(&mut *rng, 30.0, 80.0),
                reading(&mut *rng, 20.0, 180.0),
            )
        };
        self.aggregator.aggregate(temperature, humidity, air_quality)
    }

    pub fn generate_history(&self) -> HistorySeries {
        let now = Utc::now();
        let mut rng = self.rng.lock();
        let points = (0..HISTORY_POINTS)
            .rev()
            .map(|i| {
                let at = now - chrono::Duration::minutes(i * HISTORY_SPACING_MINUTES);
                HistoryPoint {
                    timestamp: at.with_timezone(&Local).format("%H:%M").to_string(),
                    temperature: reading(&mut *rng, 20.0, 38.0),
                    humidity: reading(&mut *rng, 30.0, 80.0),
                    air_quality: reading(&mut *rng, 20.0, 180.0),
                }
            })
            .collect();

        HistorySeries {
            points,
            origin: DataOrigin::Synthetic,
        }
    }
}

/// Uniform value in `[min, max)` rounded to one decimal place.
fn reading<R: Rng>(rng: &mut R, min: f64, max: f64) -> f64 {
    (rng.gen_range(min..max) * 10.0).round() / 10.0
}

#[async_trait]
impl MetricsSource for SyntheticSource {
    async fn fetch_latest(&self) -> Result<MetricsSnapshot, SourceError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.generate_latest())
    }

    async fn fetch_history(&self) -> Result<HistorySeries, SourceError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.generate_history())
    }
}
