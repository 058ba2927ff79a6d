//! Collaborator seams — everything the core consumes but does not own.
//!
//! Durable storage, the delivery channel, the recipient directory, and the
//! clock are all injected behind these traits so the engines can be driven
//! deterministically in tests and swapped per deployment.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    Contact, DeliveryRecord, DmsConfig, DmsCycle, Message, MessageStatus, SendOutcome,
    SendRequest,
};

/// Time source. Injectable so tests never wait on the wall clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Durable storage for DMS configs and cycles.
///
/// `upsert_*` are compare-and-swap writes: they succeed only when the stored
/// version still equals `expected_version` (0 means "must not exist yet"),
/// and return `false` on a lost race. This is the sole mechanism serializing
/// a check-in against a concurrently-evaluated release.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_config(&self, user_id: &str) -> Result<Option<DmsConfig>>;
    async fn upsert_config(&self, config: &DmsConfig, expected_version: u64) -> Result<bool>;
    /// All configs the cycle engine must evaluate on a poll.
    async fn list_active_configs(&self) -> Result<Vec<DmsConfig>>;
    async fn get_latest_cycle(&self, config_id: &str) -> Result<Option<DmsCycle>>;
    async fn upsert_cycle(&self, cycle: &DmsCycle, expected_version: u64) -> Result<bool>;
}

/// Durable storage for messages and the claim/finalize lifecycle.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Scheduled messages with `scheduled_for <= now`. Catch-up semantics:
    /// arbitrarily overdue messages are still returned.
    async fn list_due_messages(&self, now: DateTime<Utc>) -> Result<Vec<Message>>;
    /// Conditional Scheduled → Dispatching flip. Returns false when another
    /// dispatcher already holds the claim.
    async fn claim(&self, message_id: &str) -> Result<bool>;
    /// Conditional Draft → Scheduled("now") flip for a released DMS message.
    async fn promote(&self, message_id: &str, now: DateTime<Utc>) -> Result<bool>;
    /// Final status write; also releases the Dispatching claim.
    async fn finalize(
        &self,
        message_id: &str,
        status: MessageStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    /// Return every Dispatching row to Scheduled. Run once at startup to
    /// recover claims a crashed run left behind; redispatch may duplicate
    /// sends (at-least-once). Returns how many rows were recovered.
    async fn recover_claims(&self) -> Result<usize>;
    /// The user's DMS-scope messages still awaiting release.
    async fn list_dms_messages(&self, user_id: &str) -> Result<Vec<Message>>;
}

/// Durable storage for per-recipient delivery records.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn record(&self, record: &DeliveryRecord) -> Result<()>;
}

/// Sends one rendered message to one recipient address.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, request: SendRequest) -> Result<SendOutcome>;
}

/// Resolves recipient ids to contact details.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn resolve(&self, recipient_id: &str) -> Result<Contact>;
}
