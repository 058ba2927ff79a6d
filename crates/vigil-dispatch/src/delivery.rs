//! Delivery tracker — the per-recipient ledger behind message dispatch.
//!
//! Pure data operations: record a transition (the DAG makes illegal and
//! repeated-terminal updates no-ops) and summarize per-message counts for
//! the UI layer. Every accepted transition is written through to the
//! delivery store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use vigil_core::error::Result;
use vigil_core::traits::DeliveryStore;
use vigil_core::types::{DeliveryRecord, DeliveryState};

/// Counts by delivery state for one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    pub pending: usize,
    pub delivered: usize,
    pub bounced: usize,
    pub opened: usize,
    pub failed: usize,
}

impl DeliverySummary {
    pub fn total(&self) -> usize {
        self.pending + self.delivered + self.bounced + self.opened + self.failed
    }
}

/// In-core ledger mapping (message, recipient) → delivery status.
pub struct DeliveryTracker {
    store: Arc<dyn DeliveryStore>,
    ledger: Mutex<HashMap<(String, String), DeliveryRecord>>,
}

impl DeliveryTracker {
    pub fn new(store: Arc<dyn DeliveryStore>) -> Self {
        Self { store, ledger: Mutex::new(HashMap::new()) }
    }

    /// Record a delivery transition. Returns whether it was applied; illegal
    /// transitions (per the DAG) and repeats of terminal states return false
    /// without touching the store.
    pub async fn record(
        &self,
        message_id: &str,
        recipient_id: &str,
        status: DeliveryState,
        ts: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<bool> {
        let updated = {
            let mut ledger = self.ledger.lock().unwrap();
            let key = (message_id.to_string(), recipient_id.to_string());
            match ledger.get_mut(&key) {
                None => {
                    // A record begins life Pending, when dispatch starts.
                    if status != DeliveryState::Pending {
                        return Ok(false);
                    }
                    let record = DeliveryRecord::pending(message_id, recipient_id, ts);
                    ledger.insert(key, record.clone());
                    record
                }
                Some(record) => {
                    if !record.status.permits(status) {
                        return Ok(false);
                    }
                    record.status = status;
                    record.updated_at = ts;
                    match status {
                        DeliveryState::Delivered => record.delivered_at = Some(ts),
                        DeliveryState::Opened => record.opened_at = Some(ts),
                        DeliveryState::Bounced => {
                            record.bounced_at = Some(ts);
                            record.bounce_reason = reason.map(String::from);
                        }
                        // Failure reasons share the reason column.
                        DeliveryState::Failed => {
                            record.bounce_reason = reason.map(String::from);
                        }
                        DeliveryState::Pending => {}
                    }
                    record.clone()
                }
            }
        };
        self.store.record(&updated).await?;
        Ok(true)
    }

    /// Current status for one (message, recipient) pair.
    pub fn status(&self, message_id: &str, recipient_id: &str) -> Option<DeliveryState> {
        self.ledger
            .lock()
            .unwrap()
            .get(&(message_id.to_string(), recipient_id.to_string()))
            .map(|r| r.status)
    }

    /// Counts by status for one message.
    pub fn summarize(&self, message_id: &str) -> DeliverySummary {
        let ledger = self.ledger.lock().unwrap();
        let mut summary = DeliverySummary::default();
        for record in ledger.values().filter(|r| r.message_id == message_id) {
            match record.status {
                DeliveryState::Pending => summary.pending += 1,
                DeliveryState::Delivered => summary.delivered += 1,
                DeliveryState::Bounced => summary.bounced += 1,
                DeliveryState::Opened => summary.opened += 1,
                DeliveryState::Failed => summary.failed += 1,
            }
        }
        summary
    }
}
