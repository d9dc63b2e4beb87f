use anyhow::Result;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::schedule::Feature;
use crate::store::{ns, DefaultKv, Kv, KvSerde};

/// A member ("socio") of the organisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Stable id.
    pub id: String,
    /// Membership number printed on reminders.
    pub member_no: String,
    /// Given name used in greetings.
    pub first_name: String,
    /// Full name.
    pub full_name: String,
    /// Phone as entered (any formatting).
    pub phone: String,
    /// Next payment due date.
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    /// Date of birth.
    #[serde(default)]
    pub birthday: Option<NaiveDate>,
    /// Outstanding balance in cents.
    #[serde(default)]
    pub pending_cents: u64,
    /// Inactive members never receive messages.
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool { true }

impl Member {
    /// Whether this member is due for `feature` on `today` with `lead_days` of notice.
    pub fn is_due(&self, feature: Feature, today: NaiveDate, lead_days: u32) -> bool {
        if !self.active {
            return false;
        }
        let horizon = today + chrono::Duration::days(i64::from(lead_days));
        match feature {
            Feature::Credits => self.due_date == Some(horizon),
            Feature::Birthdays => self.birthday.is_some_and(|b| birthday_falls_on(b, horizon)),
            Feature::Reminders => self.pending_cents > 0 && self.due_date.is_some_and(|d| d <= horizon),
        }
    }

    /// Date a send is attributed to, for duplicate suppression.
    pub fn reference_date(&self, feature: Feature, today: NaiveDate, lead_days: u32) -> NaiveDate {
        match feature {
            Feature::Credits => self.due_date.unwrap_or(today),
            Feature::Birthdays => today + chrono::Duration::days(i64::from(lead_days)),
            Feature::Reminders => today,
        }
    }

    /// Message text for `feature`.
    pub fn message(&self, feature: Feature) -> String {
        let due = self
            .due_date
            .map(|d| d.format("%d/%m/%Y").to_string())
            .unwrap_or_else(|| "-".to_string());
        match feature {
            Feature::Credits => format!(
                "🔔 *Recordatorio de Pago*\n\nHola *{}*,\n\nTe recordamos que tu cuota vence el *{}*.\n\n\
                 📋 Número de socio: *{}*\n\nPor favor, realiza tu pago a tiempo para evitar cargos adicionales.\n\n\
                 Gracias por tu preferencia. 🙏",
                self.first_name, due, self.member_no
            ),
            Feature::Birthdays => format!(
                "🎉 ¡Feliz cumpleaños, *{}*! 🎂\n\nDe parte de toda la familia San Martín te deseamos un día lleno de alegría.",
                self.first_name
            ),
            Feature::Reminders => format!(
                "📌 Hola *{}*, tienes un saldo pendiente de *Bs. {}.{:02}* con vencimiento el *{}*.\n\n\
                 📋 Número de socio: *{}*",
                self.first_name,
                self.pending_cents / 100,
                self.pending_cents % 100,
                due,
                self.member_no
            ),
        }
    }
}

fn birthday_falls_on(birthday: NaiveDate, day: NaiveDate) -> bool {
    if birthday.month() == 2 && birthday.day() == 29 && !is_leap(day.year()) {
        return day.month() == 2 && day.day() == 28;
    }
    birthday.month() == day.month() && birthday.day() == day.day()
}

/// Keep digits only and prepend `prefix` when missing. `None` without digits.
pub fn normalize_phone(raw: &str, prefix: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    if digits.starts_with(prefix) {
        Some(digits)
    } else {
        Some(format!("{prefix}{digits}"))
    }
}

fn is_leap(year: i32) -> bool {
    NaiveDate::from_ymd_opt(year, 2, 29).is_some()
}

/// Member roster persisted in the KV store.
#[derive(Clone)]
pub struct MemberRegistry {
    kv: DefaultKv,
}

fn registry_key() -> Vec<u8> { ns("members", "registry") }
fn member_key(id: &str) -> Vec<u8> { ns("members", &format!("id:{id}")) }

impl MemberRegistry {
    /// Roster over `kv`.
    pub fn new(kv: DefaultKv) -> Self { Self { kv } }

    fn ids(&self) -> Result<Vec<String>> {
        Ok(self.kv.get_t(&registry_key())?.unwrap_or_default())
    }

    /// Every stored member, in insertion order.
    pub fn list(&self) -> Result<Vec<Member>> {
        let mut out = Vec::new();
        for id in self.ids()? {
            if let Some(m) = self.get(&id)? {
                out.push(m);
            }
        }
        Ok(out)
    }

    /// Member by id.
    pub fn get(&self, id: &str) -> Result<Option<Member>> {
        self.kv.get_t(&member_key(id))
    }

    /// Insert or replace.
    pub fn upsert(&self, member: &Member) -> Result<()> {
        let mut ids = self.ids()?;
        if !ids.iter().any(|i| i == &member.id) {
            ids.push(member.id.clone());
            self.kv.put_t(&registry_key(), &ids)?;
        }
        self.kv.put_t(&member_key(&member.id), member)
    }

    /// Remove; returns whether it existed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut ids = self.ids()?;
        let before = ids.len();
        ids.retain(|i| i != id);
        self.kv.put_t(&registry_key(), &ids)?;
        let existed = self.kv.delete(&member_key(id));
        Ok(existed || ids.len() < before)
    }

    /// Switch a member's active flag. `None` when the id is unknown.
    pub fn set_active(&self, id: &str, active: bool) -> Result<Option<Member>> {
        let Some(mut member) = self.get(id)? else {
            return Ok(None);
        };
        member.active = active;
        self.kv.put_t(&member_key(id), &member)?;
        Ok(Some(member))
    }

    /// Members due for `feature`.
    pub fn due(&self, feature: Feature, today: NaiveDate, lead_days: u32) -> Result<Vec<Member>> {
        Ok(self.list()?.into_iter().filter(|m| m.is_due(feature, today, lead_days)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_default;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn member(id: &str) -> Member {
        Member {
            id: id.to_string(),
            member_no: format!("SM-{id}"),
            first_name: "Ana".into(),
            full_name: "Ana Quispe Mamani".into(),
            phone: "7012-3456".into(),
            due_date: Some(d(2024, 6, 11)),
            birthday: Some(d(1990, 6, 10)),
            pending_cents: 15_050,
            active: true,
        }
    }

    #[test]
    fn credits_due_exactly_lead_days_ahead() {
        let m = member("1");
        assert!(m.is_due(Feature::Credits, d(2024, 6, 10), 1));
        assert!(!m.is_due(Feature::Credits, d(2024, 6, 9), 1));
        let inactive = Member { active: false, ..m };
        assert!(!inactive.is_due(Feature::Credits, d(2024, 6, 10), 1));
    }

    #[test]
    fn birthdays_match_month_and_day() {
        let m = member("1");
        assert!(m.is_due(Feature::Birthdays, d(2024, 6, 10), 0));
        assert!(m.is_due(Feature::Birthdays, d(2024, 6, 8), 2));
        let leap = Member { birthday: Some(d(2000, 2, 29)), ..member("2") };
        assert!(leap.is_due(Feature::Birthdays, d(2023, 2, 28), 0));
        assert!(!leap.is_due(Feature::Birthdays, d(2024, 2, 28), 0));
        assert!(leap.is_due(Feature::Birthdays, d(2024, 2, 29), 0));
    }

    #[test]
    fn reminders_cover_window_and_overdue() {
        let m = member("1");
        assert!(m.is_due(Feature::Reminders, d(2024, 6, 8), 3));
        assert!(m.is_due(Feature::Reminders, d(2024, 7, 1), 0));
        assert!(!m.is_due(Feature::Reminders, d(2024, 6, 1), 3));
        let paid = Member { pending_cents: 0, ..m };
        assert!(!paid.is_due(Feature::Reminders, d(2024, 7, 1), 0));
    }

    #[test]
    fn phone_numbers_get_country_prefix() {
        assert_eq!(normalize_phone("7012-3456", "591").as_deref(), Some("59170123456"));
        assert_eq!(normalize_phone("+591 70123456", "591").as_deref(), Some("59170123456"));
        assert_eq!(normalize_phone("n/a", "591"), None);
    }

    #[test]
    fn messages_carry_member_details() {
        let m = member("7");
        assert!(m.message(Feature::Credits).contains("11/06/2024"));
        assert!(m.message(Feature::Credits).contains("SM-7"));
        assert!(m.message(Feature::Reminders).contains("Bs. 150.50"));
    }

    #[test]
    fn registry_upsert_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let reg = MemberRegistry::new(open_default(dir.path()).unwrap());
        reg.upsert(&member("1")).unwrap();
        reg.upsert(&member("2")).unwrap();
        reg.upsert(&Member { first_name: "Luis".into(), ..member("1") }).unwrap();

        let all = reg.list().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].first_name, "Luis");
        assert_eq!(reg.due(Feature::Credits, d(2024, 6, 10), 1).unwrap().len(), 2);

        assert!(reg.remove("1").unwrap());
        assert!(!reg.remove("1").unwrap());
        assert_eq!(reg.list().unwrap().len(), 1);
        assert_eq!(reg.get("1").unwrap(), None);
    }

    #[test]
    fn deactivated_members_drop_out_of_due_lists() {
        let dir = tempfile::tempdir().unwrap();
        let reg = MemberRegistry::new(open_default(dir.path()).unwrap());
        reg.upsert(&member("1")).unwrap();

        let off = reg.set_active("1", false).unwrap().unwrap();
        assert!(!off.active);
        assert!(reg.due(Feature::Credits, d(2024, 6, 10), 1).unwrap().is_empty());
        assert!(reg.set_active("1", true).unwrap().unwrap().active);
        assert_eq!(reg.due(Feature::Credits, d(2024, 6, 10), 1).unwrap().len(), 1);
        assert_eq!(reg.set_active("9", false).unwrap(), None);
    }
}
