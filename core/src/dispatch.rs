use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::schedule::Feature;

/// Delivery status of one recipient within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    /// Delivered to the gateway.
    Sent,
    /// The gateway rejected or failed the send.
    Failed,
    /// Already notified for the same reference date.
    Skipped,
}

/// Per-recipient line of a dispatch outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRecord {
    /// Member id.
    pub member_id: String,
    /// Normalized destination number.
    pub phone: String,
    /// Delivery status.
    pub status: SendStatus,
    /// Transport error text for failed sends.
    #[serde(default)]
    pub error: Option<String>,
    /// Local time of the attempt.
    pub at: NaiveDateTime,
    /// Date the send counts for in duplicate suppression.
    #[serde(default)]
    pub reference_date: Option<NaiveDate>,
}

/// Result of one bulk-send invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DispatchOutcome {
    /// Recipients a send was attempted for.
    pub attempted_count: u32,
    /// Sends that went through.
    pub succeeded_count: u32,
    /// Sends that failed.
    pub failed_count: u32,
    /// Recipients skipped as duplicates.
    #[serde(default)]
    pub skipped_count: u32,
    /// Completion time (ms since epoch).
    pub timestamp_ms: i64,
    /// Per-recipient detail.
    #[serde(default)]
    pub records: Vec<SendRecord>,
}

impl DispatchOutcome {
    /// Fold a record into the counters.
    pub fn push(&mut self, record: SendRecord) {
        match record.status {
            SendStatus::Sent => {
                self.attempted_count += 1;
                self.succeeded_count += 1;
            }
            SendStatus::Failed => {
                self.attempted_count += 1;
                self.failed_count += 1;
            }
            SendStatus::Skipped => self.skipped_count += 1,
        }
        self.records.push(record);
    }

    /// Stamp the completion time.
    pub fn finish(mut self) -> Self {
        self.timestamp_ms = Utc::now().timestamp_millis();
        self
    }
}

/// The bulk-send collaborator a feature area injects into the scheduler.
#[async_trait]
pub trait BulkSender: Send + Sync + 'static {
    /// Send to every recipient due within `lead_days`.
    async fn dispatch_all(&self, lead_days: u32) -> Result<DispatchOutcome, DispatchError>;
}

/// What started a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// The threshold timer reached the target time.
    Scheduled,
    /// An operator asked to run now.
    Manual,
}

/// What a dispatch request ended as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DispatchReport {
    /// The bulk send ran.
    Completed {
        /// Counters and records.
        outcome: DispatchOutcome,
    },
    /// The bulk send failed as a whole.
    Failed {
        /// Error text to surface.
        error: String,
    },
    /// Another dispatch for the same area was still running.
    Skipped,
}

/// Notification broadcast after every dispatch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    /// Area the dispatch belongs to.
    pub feature: Feature,
    /// What started it.
    pub trigger: Trigger,
    /// How it ended.
    pub report: DispatchReport,
}

/// Busy state of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    /// Ready to accept a trigger.
    Idle,
    /// A bulk send is in flight.
    Dispatching,
}

/// Runs the bulk send for one feature area, never two at once.
pub struct Dispatcher {
    feature: Feature,
    sender: Arc<dyn BulkSender>,
    phase: Mutex<DispatchPhase>,
    notices: broadcast::Sender<Notice>,
}

/// Holds [`DispatchPhase::Dispatching`]; back to idle on drop, panics included.
pub struct BusyGuard<'a> {
    phase: &'a Mutex<DispatchPhase>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        *lock(self.phase) = DispatchPhase::Idle;
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Dispatcher {
    /// Dispatcher for `feature` publishing notices on `notices`.
    pub fn new(feature: Feature, sender: Arc<dyn BulkSender>, notices: broadcast::Sender<Notice>) -> Self {
        Self { feature, sender, phase: Mutex::new(DispatchPhase::Idle), notices }
    }

    /// Current busy state.
    pub fn phase(&self) -> DispatchPhase {
        *lock(&self.phase)
    }

    /// Check-and-set `Idle -> Dispatching`; `None` while busy.
    pub fn try_begin(&self) -> Option<BusyGuard<'_>> {
        let mut phase = lock(&self.phase);
        match *phase {
            DispatchPhase::Dispatching => None,
            DispatchPhase::Idle => {
                *phase = DispatchPhase::Dispatching;
                Some(BusyGuard { phase: &self.phase })
            }
        }
    }

    /// Run one bulk send. Failures are reported, never propagated.
    pub async fn dispatch(&self, lead_days: u32, trigger: Trigger) -> DispatchReport {
        // The guard is taken before the first await.
        let report = match self.try_begin() {
            None => {
                debug!("dispatch skipped feature={} trigger={:?}: already running", self.feature, trigger);
                DispatchReport::Skipped
            }
            Some(_busy) => {
                info!("dispatch start feature={} trigger={:?} lead_days={}", self.feature, trigger, lead_days);
                match self.sender.dispatch_all(lead_days).await {
                    Ok(outcome) => {
                        info!(
                            "dispatch done feature={} attempted={} ok={} failed={} skipped={}",
                            self.feature,
                            outcome.attempted_count,
                            outcome.succeeded_count,
                            outcome.failed_count,
                            outcome.skipped_count
                        );
                        DispatchReport::Completed { outcome }
                    }
                    Err(e) => {
                        warn!("dispatch failed feature={} err={}", self.feature, e);
                        DispatchReport::Failed { error: e.to_string() }
                    }
                }
            }
        };
        let _ = self.notices.send(Notice { feature: self.feature, trigger, report: report.clone() });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct SlowSender {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BulkSender for SlowSender {
        async fn dispatch_all(&self, _lead_days: u32) -> Result<DispatchOutcome, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(DispatchOutcome::default().finish())
        }
    }

    struct BrokenSender;

    #[async_trait]
    impl BulkSender for BrokenSender {
        async fn dispatch_all(&self, _lead_days: u32) -> Result<DispatchOutcome, DispatchError> {
            Err(DispatchError::Backend("503 Service Unavailable".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_trigger_while_busy_is_ignored() {
        let sender = Arc::new(SlowSender { calls: AtomicUsize::new(0) });
        let (tx, mut rx) = broadcast::channel(8);
        let d = Arc::new(Dispatcher::new(Feature::Credits, sender.clone(), tx));

        let first = {
            let d = d.clone();
            tokio::spawn(async move { d.dispatch(1, Trigger::Scheduled).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(d.phase(), DispatchPhase::Dispatching);

        assert_eq!(d.dispatch(1, Trigger::Manual).await, DispatchReport::Skipped);
        assert!(matches!(first.await.unwrap(), DispatchReport::Completed { .. }));
        assert_eq!(sender.calls.load(Ordering::SeqCst), 1);
        assert_eq!(d.phase(), DispatchPhase::Idle);

        assert_eq!(rx.recv().await.unwrap().report, DispatchReport::Skipped);
        assert_eq!(rx.recv().await.unwrap().trigger, Trigger::Scheduled);
    }

    #[tokio::test]
    async fn failure_is_reported_and_releases_the_guard() {
        let (tx, _rx) = broadcast::channel(8);
        let d = Dispatcher::new(Feature::Reminders, Arc::new(BrokenSender), tx);
        match d.dispatch(3, Trigger::Manual).await {
            DispatchReport::Failed { error } => assert!(error.contains("503")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(d.phase(), DispatchPhase::Idle);
        assert!(d.try_begin().is_some());
    }

    #[test]
    fn outcome_counters_follow_records() {
        let mut o = DispatchOutcome::default();
        let at = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap().and_hms_opt(9, 0, 0).unwrap();
        for status in [SendStatus::Sent, SendStatus::Failed, SendStatus::Skipped, SendStatus::Sent] {
            o.push(SendRecord {
                member_id: "1".into(),
                phone: "59170000000".into(),
                status,
                error: None,
                at,
                reference_date: None,
            });
        }
        assert_eq!((o.attempted_count, o.succeeded_count, o.failed_count, o.skipped_count), (3, 2, 1, 1));
    }
}
