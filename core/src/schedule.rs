//! Schedule configuration and the time-to-target calculator.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Feature area owning a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Credit due-date reminders.
    Credits,
    /// Birthday greetings.
    Birthdays,
    /// Pending-balance reminders.
    Reminders,
}

impl Feature {
    /// Every feature area, in display order.
    pub const ALL: [Feature; 3] = [Feature::Credits, Feature::Birthdays, Feature::Reminders];

    /// Stable lowercase name used in keys and URLs.
    pub fn as_str(self) -> &'static str {
        match self {
            Feature::Credits => "credits",
            Feature::Birthdays => "birthdays",
            Feature::Reminders => "reminders",
        }
    }

    fn default_lead_days(self) -> u32 {
        match self {
            Feature::Credits => 1,
            Feature::Birthdays => 0,
            Feature::Reminders => 3,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "credits" | "creditos" => Ok(Feature::Credits),
            "birthdays" | "cumpleanos" => Ok(Feature::Birthdays),
            "reminders" | "recordatorios" => Ok(Feature::Reminders),
            other => Err(format!("unknown feature '{other}'")),
        }
    }
}

/// Target time of day plus lead time for one feature area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Hour of day, `0..=23`.
    pub target_hour: u32,
    /// Minute, `0..=59`.
    pub target_minute: u32,
    /// Whether the scheduler should monitor this area.
    pub enabled: bool,
    /// How many days before a deadline counts as due.
    pub lead_days: u32,
    /// Last save time (ms since epoch), assigned by the store.
    #[serde(default)]
    pub updated_at_ms: Option<i64>,
    /// Who saved it last, assigned by the store.
    #[serde(default)]
    pub modified_by: Option<String>,
}

impl ScheduleConfig {
    /// First-use defaults: 09:00, disabled.
    pub fn default_for(feature: Feature) -> Self {
        Self {
            target_hour: 9,
            target_minute: 0,
            enabled: false,
            lead_days: feature.default_lead_days(),
            updated_at_ms: None,
            modified_by: None,
        }
    }

    /// Validated target time.
    pub fn time_of_day(&self) -> Result<TimeOfDay, ConfigError> {
        TimeOfDay::new(self.target_hour, self.target_minute)
    }

    /// Reject out-of-range hour/minute.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.time_of_day().map(|_| ())
    }

    /// `HH:MM`.
    pub fn formatted_time(&self) -> String {
        format!("{:02}:{:02}", self.target_hour, self.target_minute)
    }

    /// Whether the user-editable fields match, ignoring store metadata.
    pub fn same_settings(&self, other: &ScheduleConfig) -> bool {
        self.target_hour == other.target_hour
            && self.target_minute == other.target_minute
            && self.enabled == other.enabled
            && self.lead_days == other.lead_days
    }
}

/// A validated `hour:minute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    /// Build from hour and minute, rejecting out-of-range values.
    pub fn new(hour: u32, minute: u32) -> Result<Self, ConfigError> {
        if hour > 23 {
            return Err(ConfigError::Hour(hour));
        }
        if minute > 59 {
            return Err(ConfigError::Minute(minute));
        }
        NaiveTime::from_hms_opt(hour, minute, 0)
            .map(TimeOfDay)
            .ok_or(ConfigError::Hour(hour))
    }

    /// Hour component.
    pub fn hour(self) -> u32 { self.0.hour() }
    /// Minute component.
    pub fn minute(self) -> u32 { self.0.minute() }
}

/// Next instant whose clock time is `tod`, strictly after `now`.
///
/// A target equal to `now` counts as already passed and rolls to tomorrow,
/// which keeps a boundary tick from firing twice.
pub fn next_occurrence(now: NaiveDateTime, tod: TimeOfDay) -> NaiveDateTime {
    let today = now.date().and_time(tod.0);
    if today <= now {
        today + chrono::Duration::days(1)
    } else {
        today
    }
}

/// Remaining time until the next occurrence of `tod`. Always in `(0, 24h]`.
pub fn time_to_target(now: NaiveDateTime, tod: TimeOfDay) -> Duration {
    (next_occurrence(now, tod) - now).to_std().unwrap_or_default()
}

/// Human-facing remaining time until the next trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Countdown {
    /// Whole days.
    pub days: u64,
    /// Hours within the day.
    pub hours: u64,
    /// Minutes within the hour.
    pub minutes: u64,
    /// Seconds within the minute.
    pub seconds: u64,
}

impl Countdown {
    /// Split a duration into days/hours/minutes/seconds (sub-second dropped).
    pub fn from_duration(d: Duration) -> Self {
        let s = d.as_secs();
        Self {
            days: s / 86_400,
            hours: (s / 3_600) % 24,
            minutes: (s / 60) % 60,
            seconds: s % 60,
        }
    }

    /// Countdown from `now` to the next `tod`.
    pub fn until(now: NaiveDateTime, tod: TimeOfDay) -> Self {
        Self::from_duration(time_to_target(now, tod))
    }
}

impl fmt::Display for Countdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}d {}h {}m {}s", self.days, self.hours, self.minutes, self.seconds)
    }
}

/// Countdown published for a schedule; `None` while scheduling is disabled.
pub type CountdownState = Option<Countdown>;
