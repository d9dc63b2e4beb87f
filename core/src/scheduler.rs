//! Shared scheduler service.
//!
//! Each feature area registers its [`BulkSender`] once. Enabling an area
//! starts a timer pair: a threshold timer that fires the dispatch when the
//! target time arrives, and a countdown timer that republishes the remaining
//! time. Re-enabling always tears the previous pair down first, so an area
//! never has more than one pair.
//!
//! The threshold timer computes the absolute next-fire time once, sleeps
//! toward it in steps of at most the coarse period, fires, then recomputes.
//! It reads local wall-clock time: a clock jumped forward past the target
//! fires late (once); a clock moved backwards across a target that already
//! fired today does not refire, otherwise it fires again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::dispatch::{lock, BulkSender, DispatchReport, Dispatcher, Notice, Trigger};
use crate::error::SchedulerError;
use crate::schedule::{next_occurrence, Countdown, CountdownState, Feature, ScheduleConfig, TimeOfDay};

/// Timer periods.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// Longest sleep of the threshold timer between two clock reads.
    pub coarse_period: Duration,
    /// Countdown refresh period.
    pub countdown_period: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self { coarse_period: Duration::from_secs(60), countdown_period: Duration::from_secs(1) }
    }
}

/// Whether an area has live timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    /// No timers.
    Idle,
    /// Threshold and countdown timers running.
    Monitoring,
}

/// Owned threshold + countdown timers of one area.
///
/// Dropping the pair closes the gate and aborts both tasks; a tick already
/// in progress checks the gate under its lock before publishing anything,
/// so nothing is observed after the drop returns.
struct TimerPair {
    gate: Arc<Mutex<bool>>,
    threshold: JoinHandle<()>,
    countdown: JoinHandle<()>,
}

impl Drop for TimerPair {
    fn drop(&mut self) {
        *lock(&self.gate) = false;
        self.threshold.abort();
        self.countdown.abort();
    }
}

struct Area {
    dispatcher: Arc<Dispatcher>,
    config: Option<ScheduleConfig>,
    countdown: Arc<watch::Sender<CountdownState>>,
    timers: Option<TimerPair>,
}

/// One scheduler for every feature area.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    opts: SchedulerOptions,
    notices: broadcast::Sender<Notice>,
    areas: Mutex<HashMap<Feature, Area>>,
}

impl Scheduler {
    /// Empty scheduler reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>, opts: SchedulerOptions) -> Self {
        let (notices, _) = broadcast::channel(64);
        Self { clock, opts, notices, areas: Mutex::new(HashMap::new()) }
    }

    /// Register (or replace) the bulk sender of `feature`. Leaves it idle.
    pub fn register(&self, feature: Feature, sender: Arc<dyn BulkSender>) {
        let dispatcher = Arc::new(Dispatcher::new(feature, sender, self.notices.clone()));
        let (tx, _) = watch::channel(None);
        lock(&self.areas).insert(
            feature,
            Area { dispatcher, config: None, countdown: Arc::new(tx), timers: None },
        );
    }

    /// Dispatch notices from every area.
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Enable or disable `feature` according to `cfg.enabled`.
    pub fn apply(&self, feature: Feature, cfg: ScheduleConfig) -> Result<MonitorState, SchedulerError> {
        if cfg.enabled {
            self.enable(feature, cfg)?;
            Ok(MonitorState::Monitoring)
        } else {
            let mut areas = lock(&self.areas);
            let area = areas.get_mut(&feature).ok_or(SchedulerError::Unregistered(feature))?;
            area.config = Some(cfg);
            stop(feature, area);
            Ok(MonitorState::Idle)
        }
    }

    /// Start monitoring `feature`, replacing any running timer pair.
    pub fn enable(&self, feature: Feature, cfg: ScheduleConfig) -> Result<(), SchedulerError> {
        let tod = cfg.time_of_day()?;
        let mut areas = lock(&self.areas);
        let area = areas.get_mut(&feature).ok_or(SchedulerError::Unregistered(feature))?;
        stop(feature, area);

        let gate = Arc::new(Mutex::new(true));
        let threshold = tokio::spawn(run_threshold(
            self.clock.clone(),
            tod,
            cfg.lead_days,
            self.opts.coarse_period,
            area.dispatcher.clone(),
            gate.clone(),
        ));
        let countdown = tokio::spawn(run_countdown(
            self.clock.clone(),
            tod,
            self.opts.countdown_period,
            area.countdown.clone(),
            gate.clone(),
        ));
        info!("monitoring started feature={} at={}", feature, cfg.formatted_time());
        area.config = Some(cfg);
        area.timers = Some(TimerPair { gate, threshold, countdown });
        Ok(())
    }

    /// Stop monitoring `feature`. Returns whether timers were running.
    pub fn disable(&self, feature: Feature) -> bool {
        let mut areas = lock(&self.areas);
        match areas.get_mut(&feature) {
            Some(area) => {
                if let Some(cfg) = area.config.as_mut() {
                    cfg.enabled = false;
                }
                stop(feature, area)
            }
            None => false,
        }
    }

    /// Cancel every timer pair.
    pub fn shutdown(&self) {
        let mut areas = lock(&self.areas);
        for (feature, area) in areas.iter_mut() {
            stop(*feature, area);
        }
    }

    /// Monitoring state of `feature`.
    pub fn state(&self, feature: Feature) -> MonitorState {
        match lock(&self.areas).get(&feature) {
            Some(Area { timers: Some(_), .. }) => MonitorState::Monitoring,
            _ => MonitorState::Idle,
        }
    }

    /// Config last applied to `feature`.
    pub fn config(&self, feature: Feature) -> Option<ScheduleConfig> {
        lock(&self.areas).get(&feature).and_then(|a| a.config.clone())
    }

    /// Latest countdown of `feature`; `None` when idle.
    pub fn countdown(&self, feature: Feature) -> CountdownState {
        lock(&self.areas).get(&feature).and_then(|a| *a.countdown.borrow())
    }

    /// Subscribe to countdown updates of `feature`.
    pub fn watch_countdown(&self, feature: Feature) -> Option<watch::Receiver<CountdownState>> {
        lock(&self.areas).get(&feature).map(|a| a.countdown.subscribe())
    }

    /// Number of live timers across all areas (two per monitoring area).
    pub fn active_timer_count(&self) -> usize {
        lock(&self.areas).values().filter(|a| a.timers.is_some()).count() * 2
    }

    /// Manual "run now", sharing the busy guard with the scheduled path.
    pub async fn run_now(&self, feature: Feature) -> Result<DispatchReport, SchedulerError> {
        let (dispatcher, lead_days) = {
            let areas = lock(&self.areas);
            let area = areas.get(&feature).ok_or(SchedulerError::Unregistered(feature))?;
            let lead = area
                .config
                .as_ref()
                .map(|c| c.lead_days)
                .unwrap_or_else(|| ScheduleConfig::default_for(feature).lead_days);
            (area.dispatcher.clone(), lead)
        };
        Ok(dispatcher.dispatch(lead_days, Trigger::Manual).await)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn stop(feature: Feature, area: &mut Area) -> bool {
    match area.timers.take() {
        Some(pair) => {
            drop(pair);
            area.countdown.send_replace(None);
            info!("monitoring stopped feature={}", feature);
            true
        }
        None => false,
    }
}

async fn run_threshold(
    clock: Arc<dyn Clock>,
    tod: TimeOfDay,
    lead_days: u32,
    coarse: Duration,
    dispatcher: Arc<Dispatcher>,
    gate: Arc<Mutex<bool>>,
) {
    let mut target = next_occurrence(clock.now(), tod);
    let mut last_fired: Option<NaiveDateTime> = None;
    loop {
        let now = clock.now();
        if now >= target {
            if last_fired != Some(target) {
                let live = lock(&gate);
                if !*live {
                    return;
                }
                last_fired = Some(target);
                info!("target time {} reached; dispatching", target);
                let d = dispatcher.clone();
                // Spawned so a slow bulk send never holds up the timers.
                tokio::spawn(async move {
                    d.dispatch(lead_days, Trigger::Scheduled).await;
                });
            }
            target = next_occurrence(now.max(target), tod);
        } else if target - now > chrono::Duration::days(1) {
            debug!("clock moved backwards; recomputing target");
            target = next_occurrence(now, tod);
        }
        let wait = (target - now).to_std().unwrap_or_default().min(coarse);
        sleep(wait).await;
    }
}

async fn run_countdown(
    clock: Arc<dyn Clock>,
    tod: TimeOfDay,
    period: Duration,
    tx: Arc<watch::Sender<CountdownState>>,
    gate: Arc<Mutex<bool>>,
) {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        let now = clock.now();
        let live = lock(&gate);
        if !*live {
            return;
        }
        tx.send_replace(Some(Countdown::until(now, tod)));
    }
}
