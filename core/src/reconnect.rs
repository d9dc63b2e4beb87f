//! Gateway reconnect policy.
//!
//! Pure state machine: the gateway supervisor feeds it connection events and
//! executes the [`ReconnectPlan`] it returns (wipe the pairing session or
//! not, how long to wait before the next attempt).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cfg::ReconnectCfg;
use crate::error::ReconnectError;

/// Connection phase of the messaging transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// No socket.
    Disconnected,
    /// Attempt in flight.
    Connecting,
    /// A pairing code was issued and waits to be scanned.
    AwaitingScan,
    /// Ready to send.
    Connected,
}

/// Why the transport closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Device unlinked from the phone.
    LoggedOut,
    /// Socket closed or lost.
    ConnectionLost,
    /// Server asked for a restart.
    RestartRequired,
    /// The attempt timed out (also used when the bridge cannot be reached).
    TimedOut,
    /// Stored credentials are corrupt.
    BadSession,
    /// Any code not listed above.
    Unknown(u16),
}

impl DisconnectReason {
    /// Map a bridge status code (Baileys `DisconnectReason` values).
    pub fn from_status_code(code: u16) -> Self {
        match code {
            401 => DisconnectReason::LoggedOut,
            408 | 428 => DisconnectReason::ConnectionLost,
            515 => DisconnectReason::RestartRequired,
            500 => DisconnectReason::BadSession,
            other => DisconnectReason::Unknown(other),
        }
    }

    /// Whether stored credentials must be wiped before reconnecting.
    pub fn invalidates_session(self) -> bool {
        match self {
            DisconnectReason::LoggedOut | DisconnectReason::BadSession => true,
            DisconnectReason::ConnectionLost
            | DisconnectReason::RestartRequired
            | DisconnectReason::TimedOut
            | DisconnectReason::Unknown(_) => false,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::LoggedOut => f.write_str("logged out"),
            DisconnectReason::ConnectionLost => f.write_str("connection lost"),
            DisconnectReason::RestartRequired => f.write_str("restart required"),
            DisconnectReason::TimedOut => f.write_str("timed out"),
            DisconnectReason::BadSession => f.write_str("bad session"),
            DisconnectReason::Unknown(code) => write!(f, "unknown ({code})"),
        }
    }
}

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Linear step; attempt `n` waits `base * n`.
    pub base: Duration,
    /// Cap on a single delay.
    pub ceiling: Duration,
    /// Consecutive transient failures that force a fresh pairing.
    pub max_retries: u32,
    /// Wait after a session wipe.
    pub repair_delay: Duration,
    /// Wait after a manual reset.
    pub reset_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectCfg::default())
    }
}

impl From<&ReconnectCfg> for ReconnectPolicy {
    fn from(c: &ReconnectCfg) -> Self {
        Self {
            base: Duration::from_millis(c.base_ms),
            ceiling: Duration::from_millis(c.ceiling_ms),
            max_retries: c.max_retries.max(1),
            repair_delay: Duration::from_millis(c.repair_delay_ms),
            reset_delay: Duration::from_millis(c.reset_delay_ms),
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * attempt, ceiling)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt).min(self.ceiling)
    }
}

/// What the supervisor must do after a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconnectPlan {
    /// Wipe stored credentials first (a new pairing code will be issued).
    pub wipe_session: bool,
    /// Wait before the next attempt.
    pub delay: Duration,
    /// Retry counter after this event (0 after a wipe).
    pub attempt: u32,
    /// The wipe came from retry exhaustion rather than the reason itself.
    pub exhausted: bool,
}

/// Connection bookkeeping driven by [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    phase: ConnectionPhase,
    retry_count: u32,
    last_disconnect_reason: Option<DisconnectReason>,
    in_flight: bool,
}

impl ReconnectState {
    /// Disconnected, no retries used.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            phase: ConnectionPhase::Disconnected,
            retry_count: 0,
            last_disconnect_reason: None,
            in_flight: false,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ConnectionPhase { self.phase }
    /// Consecutive transient failures so far.
    pub fn retry_count(&self) -> u32 { self.retry_count }
    /// Reason of the last disconnect, if any.
    pub fn last_disconnect_reason(&self) -> Option<DisconnectReason> { self.last_disconnect_reason }
    /// Whether an attempt is in flight.
    pub fn is_connecting(&self) -> bool { self.in_flight }
    /// The policy in force.
    pub fn policy(&self) -> &ReconnectPolicy { &self.policy }

    /// Claim the single in-flight slot.
    pub fn begin_connect(&mut self) -> Result<(), ReconnectError> {
        if self.in_flight {
            return Err(ReconnectError::AlreadyConnecting);
        }
        self.in_flight = true;
        self.phase = ConnectionPhase::Connecting;
        Ok(())
    }

    /// The bridge issued a pairing code.
    pub fn on_pairing_code(&mut self) {
        self.phase = ConnectionPhase::AwaitingScan;
    }

    /// The transport is open.
    pub fn on_connected(&mut self) {
        self.phase = ConnectionPhase::Connected;
        self.in_flight = false;
        self.retry_count = 0;
    }

    /// Classify a disconnect and plan the next attempt.
    pub fn on_disconnect(&mut self, reason: DisconnectReason) -> ReconnectPlan {
        self.phase = ConnectionPhase::Disconnected;
        self.in_flight = false;
        self.last_disconnect_reason = Some(reason);

        if reason.invalidates_session() {
            warn!("disconnect: {}; wiping session and re-pairing", reason);
            self.retry_count = 0;
            return ReconnectPlan {
                wipe_session: true,
                delay: self.policy.repair_delay,
                attempt: 0,
                exhausted: false,
            };
        }

        if let DisconnectReason::Unknown(code) = reason {
            warn!("disconnect with unrecognised code {}; treating as transient", code);
        }
        self.retry_count += 1;
        if self.retry_count >= self.policy.max_retries {
            warn!(
                "disconnect: {}; {} consecutive failures, forcing a new pairing",
                reason, self.retry_count
            );
            self.retry_count = 0;
            return ReconnectPlan {
                wipe_session: true,
                delay: self.policy.repair_delay,
                attempt: 0,
                exhausted: true,
            };
        }
        let delay = self.policy.delay_for(self.retry_count);
        info!(
            "disconnect: {}; retry {}/{} in {:?}",
            reason, self.retry_count, self.policy.max_retries, delay
        );
        ReconnectPlan { wipe_session: false, delay, attempt: self.retry_count, exhausted: false }
    }

    /// Operator reset: wipe and re-pair regardless of state.
    pub fn force_reset(&mut self) -> ReconnectPlan {
        self.phase = ConnectionPhase::Disconnected;
        self.in_flight = false;
        self.retry_count = 0;
        ReconnectPlan { wipe_session: true, delay: self.policy.reset_delay, attempt: 0, exhausted: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ReconnectState {
        ReconnectState::new(ReconnectPolicy::default())
    }

    #[test]
    fn logged_out_wipes_and_resets_counter() {
        let mut s = state();
        s.begin_connect().unwrap();
        s.on_disconnect(DisconnectReason::ConnectionLost);
        assert_eq!(s.retry_count(), 1);

        s.begin_connect().unwrap();
        let plan = s.on_disconnect(DisconnectReason::LoggedOut);
        assert!(plan.wipe_session);
        assert_eq!(s.retry_count(), 0);

        s.begin_connect().unwrap();
        s.on_pairing_code();
        assert_eq!(s.phase(), ConnectionPhase::AwaitingScan);
    }

    #[test]
    fn third_consecutive_loss_forces_pairing() {
        let mut s = state();
        let mut plans = Vec::new();
        for _ in 0..3 {
            s.begin_connect().unwrap();
            plans.push(s.on_disconnect(DisconnectReason::ConnectionLost));
        }
        assert_eq!(plans[0].delay, Duration::from_secs(3));
        assert_eq!(plans[1].delay, Duration::from_secs(6));
        assert!(!plans[1].wipe_session);
        assert!(plans[2].wipe_session && plans[2].exhausted);
        assert_eq!(s.retry_count(), 0);
    }

    #[test]
    fn delay_is_capped_by_ceiling() {
        let p = ReconnectPolicy { max_retries: 10, ..ReconnectPolicy::default() };
        assert_eq!(p.delay_for(1), Duration::from_secs(3));
        assert_eq!(p.delay_for(3), Duration::from_secs(9));
        assert_eq!(p.delay_for(4), Duration::from_secs(10));
        assert_eq!(p.delay_for(9), Duration::from_secs(10));
    }

    #[test]
    fn success_clears_the_counter() {
        let mut s = state();
        s.begin_connect().unwrap();
        s.on_disconnect(DisconnectReason::TimedOut);
        s.begin_connect().unwrap();
        s.on_connected();
        assert_eq!(s.phase(), ConnectionPhase::Connected);
        assert_eq!(s.retry_count(), 0);
        assert!(!s.is_connecting());
    }

    #[test]
    fn only_one_attempt_in_flight() {
        let mut s = state();
        s.begin_connect().unwrap();
        assert_eq!(s.begin_connect(), Err(ReconnectError::AlreadyConnecting));
    }

    #[test]
    fn status_codes_map_to_reasons() {
        assert_eq!(DisconnectReason::from_status_code(401), DisconnectReason::LoggedOut);
        assert_eq!(DisconnectReason::from_status_code(500), DisconnectReason::BadSession);
        assert_eq!(DisconnectReason::from_status_code(515), DisconnectReason::RestartRequired);
        assert_eq!(DisconnectReason::from_status_code(440), DisconnectReason::Unknown(440));
        assert!(!DisconnectReason::Unknown(440).invalidates_session());
    }
}
