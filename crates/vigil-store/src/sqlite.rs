//! SQLite-backed stores — survives restarts, supports concurrent access.
//!
//! Key columns (id, user, status, version) are authoritative and drive the
//! conditional updates; the full record rides along as a JSON blob in the
//! `data` column. Claim, promote, and finalize touch only the key columns,
//! so reads overlay them onto the parsed blob.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use vigil_core::error::{Result, VigilError};
use vigil_core::traits::{ConfigStore, DeliveryStore, MessageStore, RecipientDirectory};
use vigil_core::types::{
    Contact, CycleState, DeliveryRecord, DmsConfig, DmsCycle, DmsStatus, Message,
    MessageStatus,
};

/// SQLite store backing all three store traits plus the recipient directory.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| VigilError::Store(format!("DB open: {e}")))?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| VigilError::Store(format!("DB open: {e}")))?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute_batch(
                "
            -- DMS configuration, one row per user
            CREATE TABLE IF NOT EXISTS dms_configs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,            -- 'inactive', 'active', 'paused'
                version INTEGER NOT NULL,
                data TEXT NOT NULL               -- full JSON record
            );

            -- DMS cycles; the latest row per config is the live one
            CREATE TABLE IF NOT EXISTS dms_cycles (
                id TEXT PRIMARY KEY,
                config_id TEXT NOT NULL,
                state TEXT NOT NULL,             -- 'active', 'grace', 'pending_release', 'released', 'paused'
                version INTEGER NOT NULL,
                data TEXT NOT NULL,
                FOREIGN KEY (config_id) REFERENCES dms_configs(id)
            );

            -- Messages with delivery intent
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                scope TEXT NOT NULL,             -- 'normal', 'dms'
                status TEXT NOT NULL,            -- 'draft', 'scheduled', 'dispatching', 'sent', 'failed'
                scheduled_for TEXT,
                sent_at TEXT,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_due
                ON messages(status, scheduled_for);

            -- Per-recipient delivery records
            CREATE TABLE IF NOT EXISTS deliveries (
                message_id TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (message_id, recipient_id)
            );

            -- Recipient directory
            CREATE TABLE IF NOT EXISTS recipients (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                name TEXT NOT NULL
            );
         ",
            )
            .map_err(|e| VigilError::Store(format!("Migration: {e}")))?;
        Ok(())
    }

    /// Insert or replace a message. Used at authoring time and by tests;
    /// the dispatcher itself only mutates via claim/promote/finalize.
    pub fn save_message(&self, message: &Message) -> Result<()> {
        let data = serde_json::to_string(message)
            .map_err(|e| VigilError::Store(format!("Serialize message: {e}")))?;
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT OR REPLACE INTO messages (id, user_id, scope, status, scheduled_for, sent_at, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    message.id,
                    message.user_id,
                    scope_str(message.scope),
                    message_status_str(message.status),
                    message.scheduled_for.map(|t| t.to_rfc3339()),
                    message.sent_at.map(|t| t.to_rfc3339()),
                    data,
                ],
            )
            .map_err(|e| VigilError::Store(format!("Save message: {e}")))?;
        Ok(())
    }

    /// Fetch one message by id.
    pub fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT status, scheduled_for, sent_at, data FROM messages WHERE id = ?1")
            .map_err(|e| VigilError::Store(format!("Get message: {e}")))?;
        let mut rows = stmt
            .query_map([id], row_to_message_parts)
            .map_err(|e| VigilError::Store(format!("Get message: {e}")))?;
        match rows.next() {
            Some(parts) => {
                let parts = parts.map_err(|e| VigilError::Store(format!("Get message: {e}")))?;
                Ok(Some(overlay_message(parts)?))
            }
            None => Ok(None),
        }
    }

    /// Register a recipient in the directory.
    pub fn add_recipient(&self, id: &str, contact: &Contact) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT OR REPLACE INTO recipients (id, email, name) VALUES (?1, ?2, ?3)",
                rusqlite::params![id, contact.email, contact.name],
            )
            .map_err(|e| VigilError::Store(format!("Add recipient: {e}")))?;
        Ok(())
    }

    fn load_messages(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| VigilError::Store(format!("Query messages: {e}")))?;
        let rows = stmt
            .query_map(params, row_to_message_parts)
            .map_err(|e| VigilError::Store(format!("Query messages: {e}")))?;
        let mut out = Vec::new();
        for parts in rows {
            let parts = parts.map_err(|e| VigilError::Store(format!("Query messages: {e}")))?;
            out.push(overlay_message(parts)?);
        }
        Ok(out)
    }
}

/// Raw key columns + JSON blob for a message row.
type MessageParts = (String, Option<String>, Option<String>, String);

fn row_to_message_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageParts> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

/// Parse the blob, then overlay the authoritative key columns.
fn overlay_message((status, scheduled_for, sent_at, data): MessageParts) -> Result<Message> {
    let mut message: Message = serde_json::from_str(&data)
        .map_err(|e| VigilError::Store(format!("Parse message: {e}")))?;
    message.status = parse_message_status(&status)?;
    message.scheduled_for = scheduled_for.as_deref().map(parse_ts).transpose()?;
    message.sent_at = sent_at.as_deref().map(parse_ts).transpose()?;
    Ok(message)
}

#[async_trait]
impl ConfigStore for SqliteStore {
    async fn get_config(&self, user_id: &str) -> Result<Option<DmsConfig>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT data FROM dms_configs WHERE user_id = ?1")
            .map_err(|e| VigilError::Store(format!("Get config: {e}")))?;
        let mut rows = stmt
            .query_map([user_id], |row| row.get::<_, String>(0))
            .map_err(|e| VigilError::Store(format!("Get config: {e}")))?;
        match rows.next() {
            Some(data) => {
                let data = data.map_err(|e| VigilError::Store(format!("Get config: {e}")))?;
                let config = serde_json::from_str(&data)
                    .map_err(|e| VigilError::Store(format!("Parse config: {e}")))?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    async fn upsert_config(&self, config: &DmsConfig, expected_version: u64) -> Result<bool> {
        let data = serde_json::to_string(config)
            .map_err(|e| VigilError::Store(format!("Serialize config: {e}")))?;
        let conn = self.conn.lock().unwrap();
        let changed = if expected_version == 0 {
            conn.execute(
                "INSERT INTO dms_configs (id, user_id, status, version, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO NOTHING",
                rusqlite::params![
                    config.id,
                    config.user_id,
                    dms_status_str(config.status),
                    config.version,
                    data,
                ],
            )
        } else {
            conn.execute(
                "UPDATE dms_configs SET status = ?1, version = ?2, data = ?3
                 WHERE id = ?4 AND version = ?5",
                rusqlite::params![
                    dms_status_str(config.status),
                    config.version,
                    data,
                    config.id,
                    expected_version,
                ],
            )
        }
        .map_err(|e| VigilError::Store(format!("Upsert config: {e}")))?;
        Ok(changed == 1)
    }

    async fn list_active_configs(&self) -> Result<Vec<DmsConfig>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT data FROM dms_configs WHERE status = 'active'")
            .map_err(|e| VigilError::Store(format!("List configs: {e}")))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| VigilError::Store(format!("List configs: {e}")))?;
        let mut out = Vec::new();
        for data in rows {
            let data = data.map_err(|e| VigilError::Store(format!("List configs: {e}")))?;
            out.push(
                serde_json::from_str(&data)
                    .map_err(|e| VigilError::Store(format!("Parse config: {e}")))?,
            );
        }
        Ok(out)
    }

    async fn get_latest_cycle(&self, config_id: &str) -> Result<Option<DmsCycle>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT data FROM dms_cycles WHERE config_id = ?1 ORDER BY rowid DESC LIMIT 1",
            )
            .map_err(|e| VigilError::Store(format!("Get cycle: {e}")))?;
        let mut rows = stmt
            .query_map([config_id], |row| row.get::<_, String>(0))
            .map_err(|e| VigilError::Store(format!("Get cycle: {e}")))?;
        match rows.next() {
            Some(data) => {
                let data = data.map_err(|e| VigilError::Store(format!("Get cycle: {e}")))?;
                let cycle = serde_json::from_str(&data)
                    .map_err(|e| VigilError::Store(format!("Parse cycle: {e}")))?;
                Ok(Some(cycle))
            }
            None => Ok(None),
        }
    }

    async fn upsert_cycle(&self, cycle: &DmsCycle, expected_version: u64) -> Result<bool> {
        let data = serde_json::to_string(cycle)
            .map_err(|e| VigilError::Store(format!("Serialize cycle: {e}")))?;
        let conn = self.conn.lock().unwrap();
        let changed = if expected_version == 0 {
            conn.execute(
                "INSERT INTO dms_cycles (id, config_id, state, version, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO NOTHING",
                rusqlite::params![
                    cycle.id,
                    cycle.config_id,
                    cycle_state_str(cycle.state),
                    cycle.version,
                    data,
                ],
            )
        } else {
            conn.execute(
                "UPDATE dms_cycles SET state = ?1, version = ?2, data = ?3
                 WHERE id = ?4 AND version = ?5",
                rusqlite::params![
                    cycle_state_str(cycle.state),
                    cycle.version,
                    data,
                    cycle.id,
                    expected_version,
                ],
            )
        }
        .map_err(|e| VigilError::Store(format!("Upsert cycle: {e}")))?;
        Ok(changed == 1)
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn list_due_messages(&self, now: DateTime<Utc>) -> Result<Vec<Message>> {
        // RFC 3339 UTC timestamps compare correctly as text.
        self.load_messages(
            "SELECT status, scheduled_for, sent_at, data FROM messages
             WHERE status = 'scheduled' AND scheduled_for IS NOT NULL AND scheduled_for <= ?1
             ORDER BY scheduled_for",
            &[&now.to_rfc3339()],
        )
    }

    async fn claim(&self, message_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE messages SET status = 'dispatching'
                 WHERE id = ?1 AND status = 'scheduled'",
                [message_id],
            )
            .map_err(|e| VigilError::Store(format!("Claim: {e}")))?;
        Ok(changed == 1)
    }

    async fn promote(&self, message_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE messages SET status = 'scheduled', scheduled_for = ?2
                 WHERE id = ?1 AND status = 'draft'",
                rusqlite::params![message_id, now.to_rfc3339()],
            )
            .map_err(|e| VigilError::Store(format!("Promote: {e}")))?;
        Ok(changed == 1)
    }

    async fn finalize(
        &self,
        message_id: &str,
        status: MessageStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE messages SET status = ?2, sent_at = ?3 WHERE id = ?1",
                rusqlite::params![
                    message_id,
                    message_status_str(status),
                    sent_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(|e| VigilError::Store(format!("Finalize: {e}")))?;
        Ok(())
    }

    async fn list_dms_messages(&self, user_id: &str) -> Result<Vec<Message>> {
        self.load_messages(
            "SELECT status, scheduled_for, sent_at, data FROM messages
             WHERE user_id = ?1 AND scope = 'dms' AND status = 'draft'",
            &[&user_id],
        )
    }

    async fn recover_claims(&self) -> Result<usize> {
        let changed = self
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE messages SET status = 'scheduled' WHERE status = 'dispatching'",
                [],
            )
            .map_err(|e| VigilError::Store(format!("Recover claims: {e}")))?;
        Ok(changed)
    }
}

#[async_trait]
impl DeliveryStore for SqliteStore {
    async fn record(&self, record: &DeliveryRecord) -> Result<()> {
        let data = serde_json::to_string(record)
            .map_err(|e| VigilError::Store(format!("Serialize delivery: {e}")))?;
        self.conn
            .lock()
            .unwrap()
            .execute(
                "INSERT OR REPLACE INTO deliveries (message_id, recipient_id, status, data)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    record.message_id,
                    record.recipient_id,
                    delivery_state_str(record),
                    data,
                ],
            )
            .map_err(|e| VigilError::Store(format!("Record delivery: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl RecipientDirectory for SqliteStore {
    async fn resolve(&self, recipient_id: &str) -> Result<Contact> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT email, name FROM recipients WHERE id = ?1")
            .map_err(|e| VigilError::Store(format!("Resolve: {e}")))?;
        let mut rows = stmt
            .query_map([recipient_id], |row| {
                Ok(Contact { email: row.get(0)?, name: row.get(1)? })
            })
            .map_err(|e| VigilError::Store(format!("Resolve: {e}")))?;
        match rows.next() {
            Some(contact) => contact.map_err(|e| VigilError::Store(format!("Resolve: {e}"))),
            None => Err(VigilError::NotFound(format!("recipient {recipient_id}"))),
        }
    }
}

// ─── Column mapping helpers ───────────────────────────────

fn dms_status_str(status: DmsStatus) -> &'static str {
    match status {
        DmsStatus::Inactive => "inactive",
        DmsStatus::Active => "active",
        DmsStatus::Paused => "paused",
    }
}

fn cycle_state_str(state: CycleState) -> &'static str {
    match state {
        CycleState::Active => "active",
        CycleState::Grace => "grace",
        CycleState::PendingRelease => "pending_release",
        CycleState::Released => "released",
        CycleState::Paused => "paused",
    }
}

fn scope_str(scope: vigil_core::types::MessageScope) -> &'static str {
    match scope {
        vigil_core::types::MessageScope::Normal => "normal",
        vigil_core::types::MessageScope::Dms => "dms",
    }
}

fn message_status_str(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Draft => "draft",
        MessageStatus::Scheduled => "scheduled",
        MessageStatus::Dispatching => "dispatching",
        MessageStatus::Sent => "sent",
        MessageStatus::Failed => "failed",
    }
}

fn parse_message_status(s: &str) -> Result<MessageStatus> {
    match s {
        "draft" => Ok(MessageStatus::Draft),
        "scheduled" => Ok(MessageStatus::Scheduled),
        "dispatching" => Ok(MessageStatus::Dispatching),
        "sent" => Ok(MessageStatus::Sent),
        "failed" => Ok(MessageStatus::Failed),
        other => Err(VigilError::Store(format!("Unknown message status '{other}'"))),
    }
}

fn delivery_state_str(record: &DeliveryRecord) -> &'static str {
    use vigil_core::types::DeliveryState::*;
    match record.status {
        Pending => "pending",
        Delivered => "delivered",
        Bounced => "bounced",
        Opened => "opened",
        Failed => "failed",
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| VigilError::Store(format!("Bad timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use vigil_core::types::{MessageScope, MessageType};

    fn message(id: &str, status: MessageStatus, scheduled_for: Option<DateTime<Utc>>) -> Message {
        Message {
            id: id.into(),
            user_id: "u1".into(),
            scope: MessageScope::Normal,
            types: vec![MessageType::Email],
            status,
            subject: "subject".into(),
            body: "body".into(),
            attachments: vec![],
            scheduled_for,
            sent_at: None,
            recipient_ids: vec!["r1".into()],
        }
    }

    #[tokio::test]
    async fn due_scan_has_catchup_semantics() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        // Five minutes overdue and a month overdue both fire.
        store
            .save_message(&message("m1", MessageStatus::Scheduled, Some(now - Duration::minutes(5))))
            .unwrap();
        store
            .save_message(&message("m2", MessageStatus::Scheduled, Some(now - Duration::days(30))))
            .unwrap();
        store
            .save_message(&message("m3", MessageStatus::Scheduled, Some(now + Duration::minutes(5))))
            .unwrap();

        let due = store.list_due_messages(now).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .save_message(&message("m1", MessageStatus::Scheduled, Some(now)))
            .unwrap();

        assert!(store.claim("m1").await.unwrap());
        assert!(!store.claim("m1").await.unwrap());
        let msg = store.get_message("m1").unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Dispatching);
    }

    #[tokio::test]
    async fn promote_only_moves_drafts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let mut draft = message("m1", MessageStatus::Draft, None);
        draft.scope = MessageScope::Dms;
        store.save_message(&draft).unwrap();

        assert!(store.promote("m1", now).await.unwrap());
        assert!(!store.promote("m1", now).await.unwrap());
        let due = store.list_due_messages(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "m1");
    }

    #[tokio::test]
    async fn recover_claims_releases_interrupted_dispatches() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        store
            .save_message(&message("m1", MessageStatus::Dispatching, Some(now)))
            .unwrap();
        store
            .save_message(&message("m2", MessageStatus::Sent, Some(now)))
            .unwrap();

        assert_eq!(store.recover_claims().await.unwrap(), 1);
        assert_eq!(store.get_message("m1").unwrap().unwrap().status, MessageStatus::Scheduled);
        assert_eq!(store.get_message("m2").unwrap().unwrap().status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn config_cas_rejects_stale_version() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let settings = vigil_core::types::DmsSettings {
            frequency: vigil_core::types::TimeSpan::days(7),
            grace: vigil_core::types::TimeSpan::days(3),
            duration_days: 365,
            reminder_lead_time: vigil_core::types::TimeSpan::days(1),
            channels: Default::default(),
            escalation_contact_id: None,
            emergency_instructions: None,
        };
        let mut config = DmsConfig::new("u1", &settings, now);
        assert!(store.upsert_config(&config, 0).await.unwrap());

        config.version = 2;
        assert!(store.upsert_config(&config, 1).await.unwrap());
        // Stale writer still thinks version is 1.
        let mut stale = config.clone();
        stale.version = 2;
        assert!(!store.upsert_config(&stale, 1).await.unwrap());

        let loaded = store.get_config("u1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
    }

    #[tokio::test]
    async fn latest_cycle_wins() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let settings = vigil_core::types::DmsSettings {
            frequency: vigil_core::types::TimeSpan::days(7),
            grace: vigil_core::types::TimeSpan::days(3),
            duration_days: 365,
            reminder_lead_time: vigil_core::types::TimeSpan::days(1),
            channels: Default::default(),
            escalation_contact_id: None,
            emergency_instructions: None,
        };
        let config = DmsConfig::new("u1", &settings, now);
        store.upsert_config(&config, 0).await.unwrap();

        let first = DmsCycle::start(&config, now);
        store.upsert_cycle(&first, 0).await.unwrap();
        let second = DmsCycle::start(&config, now + Duration::days(10));
        store.upsert_cycle(&second, 0).await.unwrap();

        let latest = store.get_latest_cycle(&config.id).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
    }

    #[tokio::test]
    async fn directory_resolves_known_recipients() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .add_recipient("r1", &Contact { email: "a@example.com".into(), name: "Ada".into() })
            .unwrap();
        let contact = store.resolve("r1").await.unwrap();
        assert_eq!(contact.email, "a@example.com");
        assert!(matches!(
            store.resolve("missing").await,
            Err(VigilError::NotFound(_))
        ));
    }
}
