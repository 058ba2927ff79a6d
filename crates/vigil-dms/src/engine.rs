//! DMS cycle engine — the stateful service around the pure cycle math.
//!
//! All mutations are optimistic-concurrency read-modify-writes against the
//! config store: a check-in racing a concurrently-evaluated release cannot
//! both win, whichever loses the version CAS re-reads and re-validates.

use std::sync::Arc;

use chrono::Duration;

use vigil_core::error::{Result, VigilError};
use vigil_core::traits::{ChannelSender, Clock, ConfigStore, MessageStore, RecipientDirectory};
use vigil_core::types::{
    CycleState, DmsConfig, DmsCycle, DmsSettings, DmsStatus, ReleaseEvent, SendRequest,
};

use crate::cycle;

/// Attempts before a CAS loop gives up with a Conflict error.
const CAS_ATTEMPTS: u32 = 3;

/// Re-activation embargo after a release fires.
const RELEASE_COOLDOWN_HOURS: i64 = 24;

/// The DMS cycle engine. One instance serves all users; per-user
/// serialization is the store's version CAS.
pub struct DmsEngine {
    configs: Arc<dyn ConfigStore>,
    messages: Arc<dyn MessageStore>,
    sender: Arc<dyn ChannelSender>,
    directory: Arc<dyn RecipientDirectory>,
    clock: Arc<dyn Clock>,
}

impl DmsEngine {
    pub fn new(
        configs: Arc<dyn ConfigStore>,
        messages: Arc<dyn MessageStore>,
        sender: Arc<dyn ChannelSender>,
        directory: Arc<dyn RecipientDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { configs, messages, sender, directory, clock }
    }

    /// Activate DMS protection for a user. First activation creates the
    /// config; re-activation reuses it and starts a fresh cycle (Released
    /// cycles are terminal).
    pub async fn activate(
        &self,
        user_id: &str,
        settings: &DmsSettings,
    ) -> Result<(DmsConfig, DmsCycle)> {
        let now = self.clock.now();
        let config = match self.configs.get_config(user_id).await? {
            None => {
                let config = DmsConfig::new(user_id, settings, now);
                if !self.configs.upsert_config(&config, 0).await? {
                    return Err(VigilError::Conflict(format!(
                        "config for {user_id} created concurrently"
                    )));
                }
                config
            }
            Some(mut config) => {
                if config.status != DmsStatus::Inactive {
                    return Err(VigilError::InvalidTransition(format!(
                        "DMS already {:?} for {user_id}",
                        config.status
                    )));
                }
                if let Some(until) = config.cooldown_until {
                    if now < until {
                        return Err(VigilError::InvalidTransition(format!(
                            "DMS cooling down until {until}"
                        )));
                    }
                }
                let expected = config.version;
                apply_settings(&mut config, settings);
                config.status = DmsStatus::Active;
                config.start_date = now;
                config.end_date = now + Duration::days(settings.duration_days as i64);
                config.cooldown_until = None;
                config.version += 1;
                config.updated_at = now;
                if !self.configs.upsert_config(&config, expected).await? {
                    return Err(VigilError::Conflict(format!(
                        "config for {user_id} changed concurrently"
                    )));
                }
                config
            }
        };

        let cycle = DmsCycle::start(&config, now);
        if !self.configs.upsert_cycle(&cycle, 0).await? {
            return Err(VigilError::Conflict(format!(
                "cycle for {user_id} created concurrently"
            )));
        }
        tracing::info!("🛡️ DMS activated for {user_id}, first check-in due {}", cycle.next_checkin_at);
        Ok((config, cycle))
    }

    /// Deactivate monitoring. The config is kept (Inactive), never deleted.
    pub async fn deactivate(&self, user_id: &str) -> Result<DmsConfig> {
        let config = self.set_config_status(user_id, DmsStatus::Inactive, None).await?;
        tracing::info!("DMS deactivated for {user_id}");
        Ok(config)
    }

    /// Apply edited settings. The live deadline is never moved earlier; a
    /// new frequency takes effect from the next check-in.
    pub async fn update_settings(
        &self,
        user_id: &str,
        settings: &DmsSettings,
    ) -> Result<DmsConfig> {
        for _ in 0..CAS_ATTEMPTS {
            let now = self.clock.now();
            let mut config = self.require_config(user_id).await?;
            if config.status == DmsStatus::Inactive {
                return Err(VigilError::InvalidTransition(format!(
                    "DMS inactive for {user_id}"
                )));
            }
            let expected = config.version;
            apply_settings(&mut config, settings);
            config.end_date = config.start_date + Duration::days(settings.duration_days as i64);
            config.version += 1;
            config.updated_at = now;
            if self.configs.upsert_config(&config, expected).await? {
                return Ok(config);
            }
        }
        Err(VigilError::Conflict(format!("settings update for {user_id} kept losing")))
    }

    /// Record a check-in: deadline moves to now + frequency, reminder
    /// bookkeeping resets. Applied as a single atomic read-modify-write.
    pub async fn check_in(&self, user_id: &str) -> Result<DmsCycle> {
        for _ in 0..CAS_ATTEMPTS {
            let now = self.clock.now();
            let (config, mut cycle) = self.require_pair(user_id).await?;
            let expected = cycle.version;
            cycle::apply_check_in(&config, &mut cycle, now)?;
            cycle.version += 1;
            cycle.updated_at = now;
            if self.configs.upsert_cycle(&cycle, expected).await? {
                tracing::info!("✅ Check-in for {user_id}, next due {}", cycle.next_checkin_at);
                return Ok(cycle);
            }
            // Lost the race — re-read; a concurrent release will fail
            // re-validation above.
        }
        Err(VigilError::Conflict(format!("check-in for {user_id} kept losing")))
    }

    /// Freeze the countdown.
    pub async fn pause(&self, user_id: &str) -> Result<DmsCycle> {
        for _ in 0..CAS_ATTEMPTS {
            let now = self.clock.now();
            let (config, mut cycle) = self.require_pair(user_id).await?;
            let expected = cycle.version;
            cycle::apply_pause(&config, &mut cycle, now)?;
            cycle.version += 1;
            cycle.updated_at = now;
            if self.configs.upsert_cycle(&cycle, expected).await? {
                self.set_config_status(user_id, DmsStatus::Paused, None).await?;
                tracing::info!("⏸️ DMS paused for {user_id}");
                return Ok(cycle);
            }
        }
        Err(VigilError::Conflict(format!("pause for {user_id} kept losing")))
    }

    /// Thaw a paused cycle, restoring the remaining time.
    pub async fn resume(&self, user_id: &str) -> Result<DmsCycle> {
        for _ in 0..CAS_ATTEMPTS {
            let now = self.clock.now();
            let (config, mut cycle) = self.require_pair(user_id).await?;
            let expected = cycle.version;
            cycle::apply_resume(&config, &mut cycle, now)?;
            cycle.version += 1;
            cycle.updated_at = now;
            if self.configs.upsert_cycle(&cycle, expected).await? {
                self.set_config_status(user_id, DmsStatus::Active, None).await?;
                tracing::info!("▶️ DMS resumed for {user_id}, next due {}", cycle.next_checkin_at);
                return Ok(cycle);
            }
        }
        Err(VigilError::Conflict(format!("resume for {user_id} kept losing")))
    }

    /// One evaluation pass over every active config. Driven by the
    /// dispatcher's poll; returns the release events fired this pass.
    pub async fn poll(&self) -> Result<Vec<ReleaseEvent>> {
        let mut events = Vec::new();
        for config in self.configs.list_active_configs().await? {
            match self.poll_config(&config).await {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("⚠️ DMS evaluation failed for {}: {e}", config.user_id);
                }
            }
        }
        Ok(events)
    }

    async fn poll_config(&self, config: &DmsConfig) -> Result<Option<ReleaseEvent>> {
        let now = self.clock.now();

        // Overall DMS lifetime elapsed — monitoring winds down quietly.
        if now >= config.end_date {
            tracing::info!("DMS lifetime ended for {}", config.user_id);
            self.set_config_status(&config.user_id, DmsStatus::Inactive, None).await?;
            return Ok(None);
        }

        let Some(mut cycle) = self.configs.get_latest_cycle(&config.id).await? else {
            tracing::warn!("⚠️ Active config {} has no cycle", config.id);
            return Ok(None);
        };
        if cycle.state == CycleState::Released {
            // The config only reaches this point when an earlier retirement
            // write failed; finish it so the config stops being polled.
            if let Err(e) = self.retire_after_release(&config.user_id).await {
                tracing::warn!("⚠️ Post-release retirement failed for {}: {e}", config.user_id);
            }
            return Ok(None);
        }
        if cycle.state == CycleState::Paused {
            return Ok(None);
        }

        let state = cycle::evaluate(config, &cycle, now);
        if state != cycle.state {
            let expected = cycle.version;
            cycle.state = state;
            cycle.version += 1;
            cycle.updated_at = now;
            if !self.configs.upsert_cycle(&cycle, expected).await? {
                // A concurrent check-in won; pick the cycle up next tick.
                tracing::debug!("Evaluation for {} lost to a concurrent write", config.user_id);
                return Ok(None);
            }
        }

        match state {
            CycleState::Active => {
                self.maybe_send_reminder(config, &cycle).await;
                Ok(None)
            }
            CycleState::PendingRelease => {
                let event = self.maybe_release(&cycle).await?;
                if let Some(event) = &event {
                    self.send_escalation_notice(config).await;
                    // Bookkeeping after the terminal flip must never drop the
                    // event; a failed retirement is retried on later polls.
                    if let Err(e) = self.retire_after_release(&config.user_id).await {
                        tracing::warn!(
                            "⚠️ Post-release retirement failed for {}: {e}",
                            config.user_id
                        );
                    }
                    tracing::info!(
                        "🔓 DMS released for {}: {} message(s) enqueued",
                        event.user_id,
                        event.messages.len()
                    );
                }
                Ok(event)
            }
            _ => Ok(None),
        }
    }

    /// Transition a pending-release cycle to Released and emit the release
    /// event. Idempotent: once Released, it never fires again; under a race
    /// only the CAS winner emits.
    ///
    /// The protected messages are durably promoted to Scheduled before the
    /// event is returned, so the handoff survives even if the event itself
    /// is dropped downstream — the due-scan will still pick them up.
    pub async fn maybe_release(&self, cycle: &DmsCycle) -> Result<Option<ReleaseEvent>> {
        if cycle.state != CycleState::PendingRelease {
            return Ok(None);
        }
        let now = self.clock.now();
        // Collect before the terminal flip: a store error here leaves the
        // cycle PendingRelease and the next poll retries.
        let messages = self.messages.list_dms_messages(&cycle.user_id).await?;
        let mut released = cycle.clone();
        let expected = released.version;
        released.state = CycleState::Released;
        released.version += 1;
        released.updated_at = now;
        if !self.configs.upsert_cycle(&released, expected).await? {
            return Ok(None);
        }
        for message in &messages {
            match self.messages.promote(&message.id, now).await {
                Ok(_) => {}
                Err(e) => tracing::warn!("⚠️ Promote failed for {}: {e}", message.id),
            }
        }
        Ok(Some(ReleaseEvent {
            user_id: cycle.user_id.clone(),
            cycle_id: cycle.id.clone(),
            messages,
        }))
    }

    /// Send the check-in reminder if the lead-time window is open and it has
    /// not fired this cycle. The sent flag is committed before the send, so
    /// the reminder fires at most once per cycle.
    async fn maybe_send_reminder(&self, config: &DmsConfig, cycle: &DmsCycle) {
        let now = self.clock.now();
        if !cycle::reminder_due(config, cycle, now) {
            return;
        }
        if !config.channels.email {
            // SMS/push have no transport here; everything ships email-style.
            tracing::debug!("Reminder for {} skipped: email channel disabled", config.user_id);
            return;
        }

        let mut marked = cycle.clone();
        let expected = marked.version;
        marked.checkin_reminder_sent = true;
        marked.last_reminder_sent = Some(now);
        marked.version += 1;
        marked.updated_at = now;
        match self.configs.upsert_cycle(&marked, expected).await {
            Ok(true) => {}
            Ok(false) => return, // raced a check-in; window no longer applies
            Err(e) => {
                tracing::warn!("⚠️ Failed to mark reminder for {}: {e}", config.user_id);
                return;
            }
        }

        let contact = match self.directory.resolve(&config.user_id).await {
            Ok(contact) => contact,
            Err(e) => {
                tracing::warn!("⚠️ No contact for {}: {e}", config.user_id);
                return;
            }
        };
        let request = SendRequest {
            to_email: contact.email,
            to_name: contact.name.clone(),
            subject: "Vigil check-in reminder".into(),
            body: format!(
                "Hi {},\n\nYour next check-in is due by {}. If you miss it, your \
                 grace period starts and your protected messages will be released \
                 once it lapses.\n\n— Vigil",
                contact.name,
                cycle.next_checkin_at.format("%Y-%m-%d %H:%M UTC"),
            ),
            attachments: vec![],
        };
        match self.sender.send(request).await {
            Ok(outcome) if outcome.success => {
                tracing::info!("📤 Check-in reminder sent to {}", config.user_id);
            }
            Ok(outcome) => {
                tracing::warn!(
                    "⚠️ Reminder send failed for {}: {}",
                    config.user_id,
                    outcome.error.unwrap_or_default()
                );
            }
            Err(e) => tracing::warn!("⚠️ Reminder send failed for {}: {e}", config.user_id),
        }
    }

    /// Notify the escalation contact with the user's emergency instructions.
    /// Failures are logged and never block the release.
    async fn send_escalation_notice(&self, config: &DmsConfig) {
        let Some(contact_id) = &config.escalation_contact_id else {
            return;
        };
        let contact = match self.directory.resolve(contact_id).await {
            Ok(contact) => contact,
            Err(e) => {
                tracing::warn!("⚠️ Escalation contact {contact_id} unresolvable: {e}");
                return;
            }
        };
        let instructions = config
            .emergency_instructions
            .as_deref()
            .unwrap_or("No further instructions were left.");
        let request = SendRequest {
            to_email: contact.email,
            to_name: contact.name.clone(),
            subject: "Vigil: emergency instructions released".into(),
            body: format!(
                "Hi {},\n\nA Dead Man's Switch you were named on has been \
                 triggered. The owner left the following instructions:\n\n{}\n\n— Vigil",
                contact.name, instructions,
            ),
            attachments: vec![],
        };
        if let Err(e) = self.sender.send(request).await {
            tracing::warn!("⚠️ Escalation notice to {contact_id} failed: {e}");
        }
    }

    /// After a release the config goes Inactive with a re-activation embargo.
    async fn retire_after_release(&self, user_id: &str) -> Result<()> {
        let cooldown = self.clock.now() + Duration::hours(RELEASE_COOLDOWN_HOURS);
        self.set_config_status(user_id, DmsStatus::Inactive, Some(cooldown)).await?;
        Ok(())
    }

    async fn set_config_status(
        &self,
        user_id: &str,
        status: DmsStatus,
        cooldown_until: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<DmsConfig> {
        for _ in 0..CAS_ATTEMPTS {
            let mut config = self.require_config(user_id).await?;
            let expected = config.version;
            config.status = status;
            if cooldown_until.is_some() {
                config.cooldown_until = cooldown_until;
            }
            config.version += 1;
            config.updated_at = self.clock.now();
            if self.configs.upsert_config(&config, expected).await? {
                return Ok(config);
            }
        }
        Err(VigilError::Conflict(format!("status update for {user_id} kept losing")))
    }

    async fn require_config(&self, user_id: &str) -> Result<DmsConfig> {
        self.configs
            .get_config(user_id)
            .await?
            .ok_or_else(|| VigilError::NotFound(format!("DMS config for {user_id}")))
    }

    async fn require_pair(&self, user_id: &str) -> Result<(DmsConfig, DmsCycle)> {
        let config = self.require_config(user_id).await?;
        let cycle = self
            .configs
            .get_latest_cycle(&config.id)
            .await?
            .ok_or_else(|| VigilError::NotFound(format!("DMS cycle for {user_id}")))?;
        Ok((config, cycle))
    }
}

fn apply_settings(config: &mut DmsConfig, settings: &DmsSettings) {
    config.frequency = settings.frequency;
    config.grace = settings.grace;
    config.duration_days = settings.duration_days;
    config.reminder_lead_time = settings.reminder_lead_time;
    config.channels = settings.channels;
    config.escalation_contact_id = settings.escalation_contact_id.clone();
    config.emergency_instructions = settings.emergency_instructions.clone();
}
