//! Data model — DMS configs and cycles, messages, and delivery records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ─── Time spans ───────────────────────────────────────────

/// Unit for user-configured intervals (check-in frequency, grace, lead time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

/// A user-configured interval: value + unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub value: i64,
    pub unit: TimeUnit,
}

impl TimeSpan {
    pub fn minutes(value: i64) -> Self {
        Self { value, unit: TimeUnit::Minutes }
    }

    pub fn hours(value: i64) -> Self {
        Self { value, unit: TimeUnit::Hours }
    }

    pub fn days(value: i64) -> Self {
        Self { value, unit: TimeUnit::Days }
    }

    pub fn weeks(value: i64) -> Self {
        Self { value, unit: TimeUnit::Weeks }
    }

    /// Convert to a chrono duration.
    pub fn to_duration(self) -> Duration {
        match self.unit {
            TimeUnit::Minutes => Duration::minutes(self.value),
            TimeUnit::Hours => Duration::hours(self.value),
            TimeUnit::Days => Duration::days(self.value),
            TimeUnit::Weeks => Duration::weeks(self.value),
        }
    }
}

// ─── Dead Man's Switch ────────────────────────────────────

/// Config status — independent of cycle state, but must agree with it
/// (Active config implies a live cycle, Paused config a paused one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DmsStatus {
    Inactive,
    Active,
    Paused,
}

/// Which notification channels the user opted into for reminders.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DmsChannels {
    pub email: bool,
    pub sms: bool,
    pub push: bool,
}

impl Default for DmsChannels {
    fn default() -> Self {
        Self { email: true, sms: false, push: false }
    }
}

/// User-editable DMS settings, applied at activation or via settings edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmsSettings {
    /// Check-in interval.
    pub frequency: TimeSpan,
    /// Buffer after a missed check-in before release.
    pub grace: TimeSpan,
    /// Overall DMS lifetime in days.
    pub duration_days: u32,
    /// How long before the check-in deadline the reminder fires.
    pub reminder_lead_time: TimeSpan,
    #[serde(default)]
    pub channels: DmsChannels,
    #[serde(default)]
    pub escalation_contact_id: Option<String>,
    #[serde(default)]
    pub emergency_instructions: Option<String>,
}

/// One DMS configuration per user. Never hard-deleted — deactivation
/// sets status to Inactive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmsConfig {
    pub id: String,
    pub user_id: String,
    pub frequency: TimeSpan,
    pub grace: TimeSpan,
    pub duration_days: u32,
    pub reminder_lead_time: TimeSpan,
    pub channels: DmsChannels,
    pub escalation_contact_id: Option<String>,
    pub emergency_instructions: Option<String>,
    pub status: DmsStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Re-activation embargo after a release.
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token; bumped on every write.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl DmsConfig {
    /// Create a config from settings at first activation.
    pub fn new(user_id: &str, settings: &DmsSettings, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id("dmscfg"),
            user_id: user_id.to_string(),
            frequency: settings.frequency,
            grace: settings.grace,
            duration_days: settings.duration_days,
            reminder_lead_time: settings.reminder_lead_time,
            channels: settings.channels,
            escalation_contact_id: settings.escalation_contact_id.clone(),
            emergency_instructions: settings.emergency_instructions.clone(),
            status: DmsStatus::Active,
            start_date: now,
            end_date: now + Duration::days(settings.duration_days as i64),
            cooldown_until: None,
            version: 1,
            updated_at: now,
        }
    }
}

/// Cycle state — Released is terminal; a new cycle must be created to
/// resume monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Active,
    Grace,
    PendingRelease,
    Released,
    Paused,
}

/// One check-in-to-check-in monitoring window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmsCycle {
    pub id: String,
    pub config_id: String,
    pub user_id: String,
    /// Deadline for the next check-in. Only advances, except via an
    /// explicit check-in.
    pub next_checkin_at: DateTime<Utc>,
    pub state: CycleState,
    pub reminder_lead_times: Vec<TimeSpan>,
    pub checkin_reminder_sent: bool,
    pub last_reminder_sent: Option<DateTime<Utc>>,
    /// Seconds left on the frozen countdown while paused.
    pub paused_remaining_secs: Option<i64>,
    /// State the cycle was in when paused (Active or Grace).
    pub paused_from: Option<CycleState>,
    /// Optimistic-concurrency token; bumped on every write.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl DmsCycle {
    /// Start a fresh cycle for a config.
    pub fn start(config: &DmsConfig, now: DateTime<Utc>) -> Self {
        Self {
            id: new_id("cycle"),
            config_id: config.id.clone(),
            user_id: config.user_id.clone(),
            next_checkin_at: now + config.frequency.to_duration(),
            state: CycleState::Active,
            reminder_lead_times: vec![config.reminder_lead_time],
            checkin_reminder_sent: false,
            last_reminder_sent: None,
            paused_remaining_secs: None,
            paused_from: None,
            version: 1,
            updated_at: now,
        }
    }
}

/// Release event — emitted exactly once per cycle, when the grace
/// period lapses. Carries the user's DMS-scope messages.
#[derive(Debug, Clone)]
pub struct ReleaseEvent {
    pub user_id: String,
    pub cycle_id: String,
    pub messages: Vec<Message>,
}

// ─── Messages ─────────────────────────────────────────────

/// Whether a message is user-scheduled or held under DMS protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageScope {
    Normal,
    Dms,
}

/// Content type tag — selects how the body/attachments are assembled,
/// not the transport. Everything ships through the one email-style channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Email,
    Video,
    Voice,
    File,
}

/// Message delivery lifecycle. Dispatching is the transient claim status
/// held while one dispatcher instance processes the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Draft,
    Scheduled,
    Dispatching,
    Sent,
    Failed,
}

/// A stored media/file reference attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageAttachment {
    pub filename: String,
    pub content_type: String,
    /// Local path or URL into external file storage.
    pub location: String,
}

/// Authored content plus delivery intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub user_id: String,
    pub scope: MessageScope,
    pub types: Vec<MessageType>,
    pub status: MessageStatus,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<MessageAttachment>,
    /// Unset for DMS-scope messages — they are scheduled "now" at release.
    pub scheduled_for: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub recipient_ids: Vec<String>,
}

impl Message {
    /// A normal message becomes dispatch-eligible once scheduled and due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Scheduled
            && self.scheduled_for.is_some_and(|at| at <= now)
    }
}

// ─── Delivery tracking ────────────────────────────────────

/// Per-recipient delivery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Bounced,
    Opened,
    Failed,
}

impl DeliveryState {
    /// Transition DAG: Pending → {Delivered, Bounced, Failed},
    /// Delivered → Opened. Everything else is a no-op.
    pub fn permits(self, next: DeliveryState) -> bool {
        matches!(
            (self, next),
            (DeliveryState::Pending, DeliveryState::Delivered)
                | (DeliveryState::Pending, DeliveryState::Bounced)
                | (DeliveryState::Pending, DeliveryState::Failed)
                | (DeliveryState::Delivered, DeliveryState::Opened)
        )
    }
}

/// Delivery record keyed by (message, recipient).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message_id: String,
    pub recipient_id: String,
    pub status: DeliveryState,
    pub delivered_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub bounce_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn pending(message_id: &str, recipient_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            message_id: message_id.to_string(),
            recipient_id: recipient_id.to_string(),
            status: DeliveryState::Pending,
            delivered_at: None,
            bounced_at: None,
            opened_at: None,
            bounce_reason: None,
            updated_at: now,
        }
    }
}

// ─── Channel payloads ─────────────────────────────────────

/// A resolved recipient contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub email: String,
    pub name: String,
}

/// One send to one recipient address.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub to_email: String,
    pub to_name: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<MessageAttachment>,
}

/// Result of a channel send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub success: bool,
    pub provider_id: Option<String>,
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn ok(provider_id: Option<String>) -> Self {
        Self { success: true, provider_id, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, provider_id: None, error: Some(error.into()) }
    }
}

/// Prefixed UUID v4 id.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespan_conversions() {
        assert_eq!(TimeSpan::minutes(90).to_duration(), Duration::minutes(90));
        assert_eq!(TimeSpan::hours(2).to_duration(), Duration::hours(2));
        assert_eq!(TimeSpan::days(7).to_duration(), Duration::days(7));
        assert_eq!(TimeSpan::weeks(1).to_duration(), Duration::days(7));
    }

    #[test]
    fn delivery_dag() {
        use DeliveryState::*;
        assert!(Pending.permits(Delivered));
        assert!(Pending.permits(Bounced));
        assert!(Pending.permits(Failed));
        assert!(Delivered.permits(Opened));
        // Terminal repeats and backwards edges are rejected.
        assert!(!Delivered.permits(Delivered));
        assert!(!Failed.permits(Delivered));
        assert!(!Opened.permits(Pending));
        assert!(!Pending.permits(Opened));
    }

    #[test]
    fn message_due_check() {
        let now = Utc::now();
        let mut msg = Message {
            id: new_id("msg"),
            user_id: "u1".into(),
            scope: MessageScope::Normal,
            types: vec![MessageType::Email],
            status: MessageStatus::Scheduled,
            subject: "s".into(),
            body: "b".into(),
            attachments: vec![],
            scheduled_for: Some(now - Duration::minutes(5)),
            sent_at: None,
            recipient_ids: vec!["r1".into()],
        };
        assert!(msg.is_due(now));
        msg.status = MessageStatus::Draft;
        assert!(!msg.is_due(now));
        msg.status = MessageStatus::Scheduled;
        msg.scheduled_for = Some(now + Duration::minutes(5));
        assert!(!msg.is_due(now));
    }
}
