use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::models::MetricsSnapshot;
use crate::source::MetricsSource;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(15_000);

#[derive(Debug, Clone, PartialEq)]
pub struct PollState {
    pub snapshot: Option<MetricsSnapshot>,
    pub loading: bool,
    pub error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    applied_seq: u64,
}

impl PollState {
    fn initial() -> Self {
        Self {
            snapshot: None,
            loading: true,
            error: None,
            last_updated: None,
            applied_seq: 0,
        }
    }

    /// Sequence number of the fetch that last changed this state.
    pub fn applied_sequence(&self) -> u64 {
        self.applied_seq
    }
}

struct Shared {
    source: Arc<dyn MetricsSource>,
    state: watch::Sender<PollState>,
    next_seq: AtomicU64,
    stopped: AtomicBool,
}

impl Shared {
    async fn poll_once(&self) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = self.source.fetch_latest().await;

        if self.stopped.load(Ordering::SeqCst) {
            debug!(seq, "discarding metrics fetch completed after shutdown");
            return;
        }

        self.state.send_if_modified(|state| {
            // Completions apply in issue order.
            if seq < state.applied_seq {
                debug!(seq, applied = state.applied_seq, "discarding stale metrics fetch");
                return false;
            }
            state.applied_seq = seq;
            state.loading = false;

            match outcome {
                Ok(snapshot) => {
                    debug!(seq, overall = %snapshot.overall_risk, score = snapshot.health_score, "metrics updated");
                    state.snapshot = Some(snapshot);
                    state.error = None;
                    state.last_updated = Some(Utc::now());
                }
                Err(err) => {
                    warn!(seq, error = %err, "metrics fetch failed, keeping previous snapshot");
                    state.error = Some(err.to_string());
                }
            }
            true
        });
    }
}

pub struct PollingController {
    shared: Arc<Shared>,
    ticker: JoinHandle<()>,
}

impl PollingController {
    /// Starts polling immediately, then every `period`.
    pub fn spawn(source: Arc<dyn MetricsSource>, period: Duration) -> Self {
        let (state, _) = watch::channel(PollState::initial());
        let shared = Arc::new(Shared {
            source,
            state,
            next_seq: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        });
        let ticker = tokio::spawn(run_ticker(shared.clone(), period.max(Duration::from_millis(1))));

        Self { shared, ticker }
    }

    /// A receiver created after a fetch was applied starts out changed, so
    /// `changed()` yields the current snapshot instead of waiting a full period.
    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        let mut updates = self.shared.state.subscribe();
        if updates.borrow().applied_sequence() > 0 {
            updates.mark_changed();
        }
        updates
    }

    #[cfg(test)]
    pub fn current(&self) -> PollState {
        self.shared.state.borrow().clone()
    }

    /// Fetches outside the regular schedule and waits for the result to be applied.
    pub async fn refetch(&self) {
        self.shared.poll_once().await;
    }

    /// Stops future ticks. Fetches already in flight finish but are not applied.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.ticker.abort();
    }
}

impl Drop for PollingController {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_ticker(shared: Arc<Shared>, period: Duration) {
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;
        let shared = shared.clone();
        tokio::spawn(async move { shared.poll_once().await });
    }
}
