use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info};

use crate::dispatch::DispatchOutcome;
use crate::schedule::{Feature, ScheduleConfig};
use crate::store::{ns, DefaultKv, KvSerde};

/// Number of outcomes kept per feature area.
pub const HISTORY_CAP: usize = 200;

/// Load/save collaborator for schedule configs.
pub trait ConfigStore: Send + Sync + 'static {
    /// Stored config, or first-use defaults (persisted on the way out).
    fn load_config(&self, feature: Feature) -> Result<ScheduleConfig>;
    /// Validate and persist; returns the config with store metadata filled in.
    fn save_config(&self, feature: Feature, cfg: ScheduleConfig, by: &str) -> Result<ScheduleConfig>;
}

/// [`ConfigStore`] over the KV store.
#[derive(Clone)]
pub struct KvConfigStore {
    kv: DefaultKv,
}

impl KvConfigStore {
    /// Wrap a KV handle.
    pub fn new(kv: DefaultKv) -> Self { Self { kv } }
}

fn config_key(feature: Feature) -> Vec<u8> {
    ns("schedule", feature.as_str())
}

impl ConfigStore for KvConfigStore {
    fn load_config(&self, feature: Feature) -> Result<ScheduleConfig> {
        if let Some(cfg) = self.kv.get_t::<ScheduleConfig>(&config_key(feature))? {
            return Ok(cfg);
        }
        debug!("no stored schedule for {}; using defaults", feature);
        self.save_config(feature, ScheduleConfig::default_for(feature), "system")
    }

    fn save_config(&self, feature: Feature, mut cfg: ScheduleConfig, by: &str) -> Result<ScheduleConfig> {
        cfg.validate()?;
        cfg.updated_at_ms = Some(Utc::now().timestamp_millis());
        cfg.modified_by = Some(by.to_string());
        self.kv.put_t(&config_key(feature), &cfg)?;
        info!(
            "schedule saved feature={} at={} enabled={} lead_days={}",
            feature, cfg.formatted_time(), cfg.enabled, cfg.lead_days
        );
        Ok(cfg)
    }
}

/// Append one dispatch outcome to the feature's bounded history.
pub fn record_outcome(kv: &DefaultKv, feature: Feature, outcome: &DispatchOutcome) -> Result<()> {
    kv.append_bounded(&ns("history", feature.as_str()), outcome.clone(), HISTORY_CAP)
}

/// Stored outcomes, oldest first.
pub fn history(kv: &DefaultKv, feature: Feature) -> Result<Vec<DispatchOutcome>> {
    Ok(kv.get_t(&ns("history", feature.as_str()))?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::store::open_default;

    fn store() -> (tempfile::TempDir, KvConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let kv = open_default(dir.path()).unwrap();
        (dir, KvConfigStore::new(kv))
    }

    #[test]
    fn first_load_persists_defaults() {
        let (_dir, s) = store();
        let cfg = s.load_config(Feature::Credits).unwrap();
        assert_eq!((cfg.target_hour, cfg.target_minute, cfg.enabled, cfg.lead_days), (9, 0, false, 1));
        assert_eq!(cfg.modified_by.as_deref(), Some("system"));
        assert_eq!(s.load_config(Feature::Credits).unwrap(), cfg);
    }

    #[test]
    fn resaving_unmodified_config_only_touches_metadata() {
        let (_dir, s) = store();
        let loaded = s.load_config(Feature::Birthdays).unwrap();
        let saved = s.save_config(Feature::Birthdays, loaded.clone(), "admin").unwrap();
        assert!(saved.same_settings(&loaded));
        assert!(saved.updated_at_ms >= loaded.updated_at_ms);
        assert_eq!(saved.modified_by.as_deref(), Some("admin"));
        let again = s.save_config(Feature::Birthdays, s.load_config(Feature::Birthdays).unwrap(), "admin").unwrap();
        assert!(again.same_settings(&saved));
    }

    #[test]
    fn invalid_config_never_reaches_the_store() {
        let (_dir, s) = store();
        let before = s.load_config(Feature::Reminders).unwrap();
        let mut bad = before.clone();
        bad.target_hour = 25;
        let err = s.save_config(Feature::Reminders, bad, "admin").unwrap_err();
        assert_eq!(err.downcast_ref::<ConfigError>(), Some(&ConfigError::Hour(25)));
        assert_eq!(s.load_config(Feature::Reminders).unwrap(), before);
    }
}
