use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

use crate::dispatch::{SendRecord, SendStatus};
use crate::persist::history;
use crate::schedule::Feature;
use crate::store::DefaultKv;

/// One recipient line of the history, tagged with its feature area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendEntry {
    /// Area that sent it.
    pub feature: Feature,
    /// Member id.
    pub member_id: String,
    /// Destination number.
    pub phone: String,
    /// Delivery status.
    pub status: SendStatus,
    /// Error text of a failed send.
    pub error: Option<String>,
    /// Local time of the attempt.
    pub at: NaiveDateTime,
    /// Date the send counts for.
    pub reference_date: Option<NaiveDate>,
}

impl SendEntry {
    fn new(feature: Feature, r: SendRecord) -> Self {
        Self {
            feature,
            member_id: r.member_id,
            phone: r.phone,
            status: r.status,
            error: r.error,
            at: r.at,
            reference_date: r.reference_date,
        }
    }
}

/// Counters of one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayStats {
    /// The day.
    pub date: NaiveDate,
    /// Sends attempted (sent + failed).
    pub total: u32,
    /// Delivered.
    pub sent: u32,
    /// Failed.
    pub failed: u32,
    /// Skipped as already notified.
    pub skipped: u32,
}

/// Totals over the whole stored history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    /// Sends attempted (sent + failed).
    pub total: u32,
    /// Delivered.
    pub sent: u32,
    /// Failed.
    pub failed: u32,
    /// Skipped as already notified.
    pub skipped: u32,
    /// `sent` over `total` in percent; 0 without attempts.
    pub success_rate: f64,
}

/// Every stored recipient line across all areas, newest first.
pub fn all_sends(kv: &DefaultKv) -> Result<Vec<SendEntry>> {
    let mut out = Vec::new();
    for feature in Feature::ALL {
        for outcome in history(kv, feature)? {
            out.extend(outcome.records.into_iter().map(|r| SendEntry::new(feature, r)));
        }
    }
    out.sort_by(|a, b| b.at.cmp(&a.at));
    Ok(out)
}

/// Lines addressed to one member, newest first.
pub fn member_sends(kv: &DefaultKv, member_id: &str) -> Result<Vec<SendEntry>> {
    Ok(all_sends(kv)?.into_iter().filter(|e| e.member_id == member_id).collect())
}

/// Lines attempted between `from` and `to` (both days inclusive), optionally
/// narrowed to one status.
pub fn sends_between(
    kv: &DefaultKv,
    from: NaiveDate,
    to: NaiveDate,
    status: Option<SendStatus>,
) -> Result<Vec<SendEntry>> {
    Ok(all_sends(kv)?
        .into_iter()
        .filter(|e| (from..=to).contains(&e.at.date()))
        .filter(|e| status.map_or(true, |s| e.status == s))
        .collect())
}

/// One entry per day from `from` to `to`, days without sends included.
pub fn daily_stats(kv: &DefaultKv, from: NaiveDate, to: NaiveDate) -> Result<Vec<DayStats>> {
    let entries = sends_between(kv, from, to, None)?;
    let mut out = Vec::new();
    let mut day = from;
    while day <= to {
        let mut stats = DayStats { date: day, total: 0, sent: 0, failed: 0, skipped: 0 };
        for e in entries.iter().filter(|e| e.at.date() == day) {
            match e.status {
                SendStatus::Sent => stats.sent += 1,
                SendStatus::Failed => stats.failed += 1,
                SendStatus::Skipped => stats.skipped += 1,
            }
        }
        stats.total = stats.sent + stats.failed;
        out.push(stats);
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    Ok(out)
}

/// Totals over everything stored.
pub fn summary(kv: &DefaultKv) -> Result<Summary> {
    let mut s = Summary { total: 0, sent: 0, failed: 0, skipped: 0, success_rate: 0.0 };
    for e in all_sends(kv)? {
        match e.status {
            SendStatus::Sent => s.sent += 1,
            SendStatus::Failed => s.failed += 1,
            SendStatus::Skipped => s.skipped += 1,
        }
    }
    s.total = s.sent + s.failed;
    if s.total > 0 {
        s.success_rate = f64::from(s.sent) * 100.0 / f64::from(s.total);
    }
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchOutcome;
    use crate::persist::record_outcome;
    use crate::store::open_default;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
    }

    fn rec(member: &str, status: SendStatus, day: u32, hour: u32) -> SendRecord {
        SendRecord {
            member_id: member.into(),
            phone: format!("5917000000{member}"),
            status,
            error: (status == SendStatus::Failed).then(|| "timeout".to_string()),
            at: d(day).and_hms_opt(hour, 0, 0).unwrap(),
            reference_date: Some(d(day + 1)),
        }
    }

    fn seeded() -> (tempfile::TempDir, DefaultKv) {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_default(dir.path()).unwrap();
        let mut credits = DispatchOutcome::default();
        credits.push(rec("1", SendStatus::Sent, 10, 9));
        credits.push(rec("2", SendStatus::Failed, 10, 9));
        record_outcome(&kv, Feature::Credits, &credits.finish()).unwrap();
        let mut retry = DispatchOutcome::default();
        retry.push(rec("1", SendStatus::Skipped, 11, 9));
        retry.push(rec("2", SendStatus::Sent, 11, 9));
        record_outcome(&kv, Feature::Credits, &retry.finish()).unwrap();
        let mut bday = DispatchOutcome::default();
        bday.push(rec("1", SendStatus::Sent, 12, 8));
        record_outcome(&kv, Feature::Birthdays, &bday.finish()).unwrap();
        (dir, kv)
    }

    #[test]
    fn member_history_spans_areas_newest_first() {
        let (_dir, kv) = seeded();
        let h = member_sends(&kv, "1").unwrap();
        assert_eq!(h.len(), 3);
        assert_eq!(h[0].feature, Feature::Birthdays);
        assert_eq!(h[2].status, SendStatus::Sent);
        assert!(member_sends(&kv, "9").unwrap().is_empty());
    }

    #[test]
    fn range_query_is_inclusive_and_filters_status() {
        let (_dir, kv) = seeded();
        assert_eq!(sends_between(&kv, d(10), d(11), None).unwrap().len(), 4);
        let failed = sends_between(&kv, d(1), d(30), Some(SendStatus::Failed)).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error.as_deref(), Some("timeout"));
        assert!(sends_between(&kv, d(13), d(20), None).unwrap().is_empty());
    }

    #[test]
    fn daily_stats_fill_empty_days() {
        let (_dir, kv) = seeded();
        let days = daily_stats(&kv, d(9), d(12)).unwrap();
        assert_eq!(days.len(), 4);
        assert_eq!((days[0].total, days[0].sent), (0, 0));
        assert_eq!((days[1].total, days[1].sent, days[1].failed), (2, 1, 1));
        assert_eq!((days[2].total, days[2].skipped), (1, 1));
        assert_eq!(days[3].date, d(12));
        assert!(daily_stats(&kv, d(12), d(9)).unwrap().is_empty());
    }

    #[test]
    fn summary_rate_ignores_skips() {
        let (_dir, kv) = seeded();
        let s = summary(&kv).unwrap();
        assert_eq!((s.total, s.sent, s.failed, s.skipped), (4, 3, 1, 1));
        assert!((s.success_rate - 75.0).abs() < 1e-9);

        let empty = tempfile::tempdir().unwrap();
        assert_eq!(summary(&open_default(empty.path()).unwrap()).unwrap().success_rate, 0.0);
    }
}
