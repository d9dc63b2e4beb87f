use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::dispatch::{BulkSender, DispatchOutcome, SendRecord, SendStatus};
use crate::error::DispatchError;
use crate::members::{normalize_phone, MemberRegistry};
use crate::persist::record_outcome;
use crate::schedule::Feature;
use crate::store::{ns, DefaultKv, Kv};

/// The messaging gateway as seen from the dispatch side.
///
/// Callers check [`is_connected`](MessagingTransport::is_connected) before
/// sending and fail fast with [`DispatchError::TransportNotReady`].
#[async_trait]
pub trait MessagingTransport: Send + Sync + 'static {
    /// Whether the gateway reports an open session.
    async fn is_connected(&self) -> bool;
    /// Send `text` to a normalized phone number.
    async fn send(&self, phone: &str, text: &str) -> Result<(), DispatchError>;
}

/// Result of the single-send path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOneResult {
    /// Whether the message went out.
    pub success: bool,
    /// Error text when it did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl SendOneResult {
    fn failed(detail: impl Into<String>) -> Self {
        Self { success: false, error_detail: Some(detail.into()) }
    }
}

fn sent_key(feature: Feature, member_id: &str, reference: NaiveDate) -> Vec<u8> {
    ns("sent", &format!("{}:{}:{}", feature, member_id, reference))
}

/// A member the next run would message, with what it would say.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upcoming {
    /// Member id.
    pub member_id: String,
    /// Full name.
    pub full_name: String,
    /// Membership number.
    pub member_no: String,
    /// Phone as stored.
    pub phone: String,
    /// Date the send would count for.
    pub reference_date: NaiveDate,
    /// Message text.
    pub message: String,
}

/// Bulk sender for one feature area on top of a [`MessagingTransport`].
pub struct TransportBulkSender {
    feature: Feature,
    transport: Arc<dyn MessagingTransport>,
    members: MemberRegistry,
    kv: DefaultKv,
    clock: Arc<dyn Clock>,
    country_prefix: String,
    pause: Duration,
}

impl TransportBulkSender {
    /// Sender for `feature`, reading the roster from `kv`.
    pub fn new(
        feature: Feature,
        transport: Arc<dyn MessagingTransport>,
        kv: DefaultKv,
        clock: Arc<dyn Clock>,
        country_prefix: impl Into<String>,
        pause: Duration,
    ) -> Self {
        Self {
            feature,
            transport,
            members: MemberRegistry::new(kv.clone()),
            kv,
            clock,
            country_prefix: country_prefix.into(),
            pause,
        }
    }

    /// Feature area this sender serves.
    pub fn feature(&self) -> Feature {
        self.feature
    }

    /// Send the `feature` message to one member right away.
    ///
    /// A successful send is marked like a batch send, so the next scheduled
    /// run skips the member for the same reference date. Attempts that reach
    /// the gateway are appended to the history as a one-record outcome.
    pub async fn send_one(&self, member_id: &str, lead_days: u32) -> SendOneResult {
        if !self.transport.is_connected().await {
            return SendOneResult::failed(DispatchError::TransportNotReady.to_string());
        }
        let member = match self.members.get(member_id) {
            Ok(Some(m)) => m,
            Ok(None) => return SendOneResult::failed(format!("member {member_id} not found")),
            Err(e) => return SendOneResult::failed(e.to_string()),
        };
        let Some(phone) = normalize_phone(&member.phone, &self.country_prefix) else {
            return SendOneResult::failed(format!("member {member_id} has no usable phone number"));
        };
        let reference = member.reference_date(self.feature, self.clock.now().date(), lead_days);
        let record = self.deliver(&member.id, phone, &member.message(self.feature), reference).await;
        let result = match &record.error {
            None => SendOneResult { success: true, error_detail: None },
            Some(e) => SendOneResult::failed(e.clone()),
        };
        let mut outcome = DispatchOutcome::default();
        outcome.push(record);
        self.save_history(&outcome.finish());
        result
    }

    /// Members the next run would message: due today and not yet notified.
    pub fn upcoming(&self, lead_days: u32) -> anyhow::Result<Vec<Upcoming>> {
        let today = self.clock.now().date();
        let mut out = Vec::new();
        for m in self.members.due(self.feature, today, lead_days)? {
            let reference = m.reference_date(self.feature, today, lead_days);
            if self.kv.contains(&sent_key(self.feature, &m.id, reference)) {
                continue;
            }
            out.push(Upcoming {
                message: m.message(self.feature),
                member_id: m.id,
                full_name: m.full_name,
                member_no: m.member_no,
                phone: m.phone,
                reference_date: reference,
            });
        }
        Ok(out)
    }

    async fn deliver(&self, member_id: &str, phone: String, text: &str, reference: NaiveDate) -> SendRecord {
        let result = self.transport.send(&phone, text).await;
        let at = self.clock.now();
        match result {
            Ok(()) => {
                let key = sent_key(self.feature, member_id, reference);
                if let Err(e) = self.kv.put(&key, reference.to_string().as_bytes()) {
                    warn!("could not mark member={} as notified: {}", member_id, e);
                }
                SendRecord {
                    member_id: member_id.to_string(),
                    phone,
                    status: SendStatus::Sent,
                    error: None,
                    at,
                    reference_date: Some(reference),
                }
            }
            Err(e) => {
                warn!("send failed member={} phone={} err={}", member_id, phone, e);
                SendRecord {
                    member_id: member_id.to_string(),
                    phone,
                    status: SendStatus::Failed,
                    error: Some(e.to_string()),
                    at,
                    reference_date: Some(reference),
                }
            }
        }
    }

    fn save_history(&self, outcome: &DispatchOutcome) {
        if let Err(e) = record_outcome(&self.kv, self.feature, outcome) {
            warn!("could not append dispatch history feature={}: {}", self.feature, e);
        }
    }
}

#[async_trait]
impl BulkSender for TransportBulkSender {
    async fn dispatch_all(&self, lead_days: u32) -> Result<DispatchOutcome, DispatchError> {
        if !self.transport.is_connected().await {
            return Err(DispatchError::TransportNotReady);
        }
        let today = self.clock.now().date();
        let due = self.members.due(self.feature, today, lead_days)?;
        debug!("{} members due feature={} lead_days={}", due.len(), self.feature, lead_days);

        let mut outcome = DispatchOutcome::default();
        let mut sent_any = false;
        for member in due {
            let reference = member.reference_date(self.feature, today, lead_days);
            let Some(phone) = normalize_phone(&member.phone, &self.country_prefix) else {
                outcome.push(SendRecord {
                    member_id: member.id.clone(),
                    phone: member.phone.clone(),
                    status: SendStatus::Failed,
                    error: Some("no usable phone number".into()),
                    at: self.clock.now(),
                    reference_date: Some(reference),
                });
                continue;
            };
            if self.kv.contains(&sent_key(self.feature, &member.id, reference)) {
                debug!("already notified member={} feature={} ref={}", member.id, self.feature, reference);
                outcome.push(SendRecord {
                    member_id: member.id,
                    phone,
                    status: SendStatus::Skipped,
                    error: None,
                    at: self.clock.now(),
                    reference_date: Some(reference),
                });
                continue;
            }
            if sent_any && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
            sent_any = true;
            let record = self.deliver(&member.id, phone, &member.message(self.feature), reference).await;
            outcome.push(record);
        }

        let outcome = outcome.finish();
        self.save_history(&outcome);
        Ok(outcome)
    }
}
