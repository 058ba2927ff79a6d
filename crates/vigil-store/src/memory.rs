//! In-memory stores — deterministic fixtures for engine and dispatcher tests.
//!
//! Same CAS and conditional-update contracts as the SQLite store, minus the
//! durability.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vigil_core::error::{Result, VigilError};
use vigil_core::traits::{ConfigStore, DeliveryStore, MessageStore, RecipientDirectory};
use vigil_core::types::{
    Contact, DeliveryRecord, DmsConfig, DmsCycle, Message, MessageStatus,
};

/// In-memory config + message + delivery store.
#[derive(Default)]
pub struct MemoryStore {
    configs: Mutex<HashMap<String, DmsConfig>>,
    cycles: Mutex<Vec<DmsCycle>>,
    messages: Mutex<HashMap<String, Message>>,
    deliveries: Mutex<Vec<DeliveryRecord>>,
    /// When set, finalize returns an error — exercises the at-least-once
    /// retry path.
    pub fail_finalize: Mutex<bool>,
    /// When set, every finalize fails, the claim revert included.
    pub fail_finalize_all: Mutex<bool>,
    /// When set, claiming this message id returns a store error.
    pub fail_claim: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_message(&self, message: Message) {
        self.messages.lock().unwrap().insert(message.id.clone(), message);
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.messages.lock().unwrap().get(id).cloned()
    }

    pub fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn set_fail_finalize(&self, fail: bool) {
        *self.fail_finalize.lock().unwrap() = fail;
    }

    pub fn set_fail_finalize_all(&self, fail: bool) {
        *self.fail_finalize_all.lock().unwrap() = fail;
    }

    pub fn set_fail_claim(&self, id: Option<&str>) {
        *self.fail_claim.lock().unwrap() = id.map(String::from);
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_config(&self, user_id: &str) -> Result<Option<DmsConfig>> {
        Ok(self
            .configs
            .lock()
            .unwrap()
            .values()
            .find(|c| c.user_id == user_id)
            .cloned())
    }

    async fn upsert_config(&self, config: &DmsConfig, expected_version: u64) -> Result<bool> {
        let mut configs = self.configs.lock().unwrap();
        match configs.get(&config.id) {
            None if expected_version == 0 => {
                configs.insert(config.id.clone(), config.clone());
                Ok(true)
            }
            Some(existing) if existing.version == expected_version && expected_version > 0 => {
                configs.insert(config.id.clone(), config.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_active_configs(&self) -> Result<Vec<DmsConfig>> {
        Ok(self
            .configs
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.status == vigil_core::types::DmsStatus::Active)
            .cloned()
            .collect())
    }

    async fn get_latest_cycle(&self, config_id: &str) -> Result<Option<DmsCycle>> {
        Ok(self
            .cycles
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.config_id == config_id)
            .cloned())
    }

    async fn upsert_cycle(&self, cycle: &DmsCycle, expected_version: u64) -> Result<bool> {
        let mut cycles = self.cycles.lock().unwrap();
        match cycles.iter_mut().find(|c| c.id == cycle.id) {
            None if expected_version == 0 => {
                cycles.push(cycle.clone());
                Ok(true)
            }
            Some(existing) if existing.version == expected_version && expected_version > 0 => {
                *existing = cycle.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn list_due_messages(&self, now: DateTime<Utc>) -> Result<Vec<Message>> {
        let mut due: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|m| m.scheduled_for);
        Ok(due)
    }

    async fn claim(&self, message_id: &str) -> Result<bool> {
        if self.fail_claim.lock().unwrap().as_deref() == Some(message_id) {
            return Err(VigilError::Store("claim unavailable".into()));
        }
        let mut messages = self.messages.lock().unwrap();
        match messages.get_mut(message_id) {
            Some(m) if m.status == MessageStatus::Scheduled => {
                m.status = MessageStatus::Dispatching;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn promote(&self, message_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut messages = self.messages.lock().unwrap();
        match messages.get_mut(message_id) {
            Some(m) if m.status == MessageStatus::Draft => {
                m.status = MessageStatus::Scheduled;
                m.scheduled_for = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize(
        &self,
        message_id: &str,
        status: MessageStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if *self.fail_finalize_all.lock().unwrap() {
            return Err(VigilError::Store("finalize unavailable".into()));
        }
        // The narrower flag blocks terminal writes only, so the dispatcher's
        // claim-revert (back to Scheduled) still lands.
        if *self.fail_finalize.lock().unwrap() && status != MessageStatus::Scheduled {
            return Err(VigilError::Store("finalize unavailable".into()));
        }
        let mut messages = self.messages.lock().unwrap();
        let message = messages
            .get_mut(message_id)
            .ok_or_else(|| VigilError::NotFound(format!("message {message_id}")))?;
        message.status = status;
        message.sent_at = sent_at;
        Ok(())
    }

    async fn list_dms_messages(&self, user_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .values()
            .filter(|m| {
                m.user_id == user_id
                    && m.scope == vigil_core::types::MessageScope::Dms
                    && m.status == MessageStatus::Draft
            })
            .cloned()
            .collect())
    }

    async fn recover_claims(&self) -> Result<usize> {
        let mut recovered = 0;
        for message in self.messages.lock().unwrap().values_mut() {
            if message.status == MessageStatus::Dispatching {
                message.status = MessageStatus::Scheduled;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn record(&self, record: &DeliveryRecord) -> Result<()> {
        let mut deliveries = self.deliveries.lock().unwrap();
        if let Some(existing) = deliveries
            .iter_mut()
            .find(|d| d.message_id == record.message_id && d.recipient_id == record.recipient_id)
        {
            *existing = record.clone();
        } else {
            deliveries.push(record.clone());
        }
        Ok(())
    }
}

/// In-memory recipient directory.
#[derive(Default)]
pub struct MemoryDirectory {
    contacts: Mutex<HashMap<String, Contact>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: &str, email: &str, name: &str) {
        self.contacts
            .lock()
            .unwrap()
            .insert(id.to_string(), Contact { email: email.into(), name: name.into() });
    }
}

#[async_trait]
impl RecipientDirectory for MemoryDirectory {
    async fn resolve(&self, recipient_id: &str) -> Result<Contact> {
        self.contacts
            .lock()
            .unwrap()
            .get(recipient_id)
            .cloned()
            .ok_or_else(|| VigilError::NotFound(format!("recipient {recipient_id}")))
    }
}
