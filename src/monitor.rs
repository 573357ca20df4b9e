//! Backpressure monitor.
//!
//! Looks at the claimed entries of one workflow and decides whether
//! processing is falling behind. An alert fires when the oldest claim is
//! older than `max_queue_age`, at most once per `alert_cooldown`; between
//! alerts the breach is logged as a reminder. Returning to an empty or
//! healthy queue after a breach logs a single recovery notice.

use crate::clock::Clock;
use crate::model::QueueEntry;
use crate::telemetry::metrics;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// Claim-age statistics for one scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClaimStats {
    pub len: usize,
    pub oldest: Duration,
    pub newest: Duration,
    pub mean: Duration,
}

/// What the monitor emitted for this evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    None,
    /// High-severity alert; first breach or cooldown elapsed.
    Alert,
    /// Breach persists inside the cooldown window.
    Reminder,
    /// Queue went back to normal after a breach.
    Recovered,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Health {
    /// `None` when no entry is claimed.
    pub stats: Option<ClaimStats>,
    pub backed_up: bool,
    pub signal: Signal,
}

#[derive(Debug, Default)]
struct MonitorState {
    backed_up: bool,
    last_alert: Option<DateTime<Utc>>,
}

pub struct BackpressureMonitor {
    workflow: String,
    max_queue_age: Duration,
    alert_cooldown: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<MonitorState>,
}

impl BackpressureMonitor {
    pub fn new(
        workflow: impl Into<String>,
        max_queue_age: Duration,
        alert_cooldown: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            workflow: workflow.into(),
            max_queue_age,
            alert_cooldown,
            clock,
            state: Mutex::new(MonitorState::default()),
        }
    }

    pub fn is_backed_up(&self) -> bool {
        self.state.lock().map(|s| s.backed_up).unwrap_or(false)
    }

    /// Evaluate the currently claimed entries.
    pub fn evaluate(&self, claimed: &[QueueEntry]) -> Health {
        let now = self.clock.now();
        let stats = claim_stats(claimed, now);
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let breached = stats.is_some_and(|s| s.oldest > self.max_queue_age);

        let signal = match stats {
            Some(stats) if breached => {
                state.backed_up = true;
                let cooled_down = state.last_alert.is_none_or(|at| {
                    (now - at).to_std().unwrap_or_default() >= self.alert_cooldown
                });
                if cooled_down {
                    state.last_alert = Some(now);
                    error!(
                        workflow = %self.workflow,
                        len = stats.len,
                        oldest_secs = stats.oldest.as_secs(),
                        "queue is backing up"
                    );
                    Signal::Alert
                } else {
                    warn!(
                        workflow = %self.workflow,
                        len = stats.len,
                        oldest_secs = stats.oldest.as_secs(),
                        "queue is backing up"
                    );
                    Signal::Reminder
                }
            }
            _ if state.backed_up => {
                state.backed_up = false;
                info!(workflow = %self.workflow, "queue is ok");
                Signal::Recovered
            }
            _ => Signal::None,
        };

        if let Some(stats) = stats {
            info!(
                workflow = %self.workflow,
                len = stats.len,
                oldest_secs = stats.oldest.as_secs(),
                newest_secs = stats.newest.as_secs(),
                mean_secs = stats.mean.as_secs(),
                "queue stats"
            );
        }

        let label = match signal {
            Signal::Alert => Some("alert"),
            Signal::Reminder => Some("reminder"),
            Signal::Recovered => Some("recovered"),
            Signal::None => None,
        };
        if let Some(label) = label {
            metrics::backpressure_signals().add(
                1,
                &[
                    KeyValue::new("workflow", self.workflow.clone()),
                    KeyValue::new("signal", label),
                ],
            );
        }

        Health {
            stats,
            backed_up: state.backed_up,
            signal,
        }
    }
}

/// Age statistics over entries that carry a claim timestamp.
pub fn claim_stats(entries: &[QueueEntry], now: DateTime<Utc>) -> Option<ClaimStats> {
    let ages: Vec<Duration> = entries
        .iter()
        .filter_map(|e| e.claimed_at)
        .map(|at| (now - at).to_std().unwrap_or_default())
        .collect();

    let oldest = ages.iter().max().copied()?;
    let newest = ages.iter().min().copied()?;
    let total: Duration = ages.iter().sum();
    let mean = total / ages.len() as u32;

    Some(ClaimStats {
        len: ages.len(),
        oldest,
        newest,
        mean,
    })
}
