//! Scheduled dispatcher — the periodic task that turns due messages into
//! per-recipient delivery attempts.
//!
//! Each tick: drive the DMS engine's evaluation (promoting released
//! messages), discover due messages, claim each one with a conditional
//! store update, fan out to recipients, and finalize under the
//! at-least-one-success policy. The claim is the sole concurrency control:
//! a second dispatcher instance losing it skips the message silently.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use vigil_core::config::DispatcherConfig;
use vigil_core::error::{Result, VigilError};
use vigil_core::traits::{ChannelSender, Clock, MessageStore, RecipientDirectory};
use vigil_core::types::{DeliveryState, Message, MessageStatus, SendOutcome, SendRequest};
use vigil_dms::DmsEngine;

use crate::content::{self, RenderedContent};
use crate::delivery::DeliveryTracker;

/// The dispatcher. Construct once at bootstrap, `start()` the polling loop,
/// `stop()` on shutdown; both are idempotent. `run_once` executes a single
/// tick and is what tests and cron-style deployments call directly.
pub struct ScheduledDispatcher {
    messages: Arc<dyn MessageStore>,
    tracker: Arc<DeliveryTracker>,
    sender: Arc<dyn ChannelSender>,
    directory: Arc<dyn RecipientDirectory>,
    clock: Arc<dyn Clock>,
    dms: Option<Arc<DmsEngine>>,
    poll_interval: Duration,
    send_timeout: Duration,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Messages whose claim could not be released after a finalize failure;
    /// the release is retried at the top of each tick.
    stuck: Mutex<Vec<String>>,
}

impl ScheduledDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        messages: Arc<dyn MessageStore>,
        tracker: Arc<DeliveryTracker>,
        sender: Arc<dyn ChannelSender>,
        directory: Arc<dyn RecipientDirectory>,
        clock: Arc<dyn Clock>,
        dms: Option<Arc<DmsEngine>>,
        config: &DispatcherConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            messages,
            tracker,
            sender,
            directory,
            clock,
            dms,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            send_timeout: Duration::from_secs(config.send_timeout_secs),
            shutdown,
            task: Mutex::new(None),
            stuck: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the polling loop. A second start while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap();
        if task.is_some() {
            tracing::debug!("Dispatcher already running");
            return;
        }
        tracing::info!("⏰ Dispatcher started (poll every {:?})", self.poll_interval);
        let this = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            // Claims left Dispatching by an interrupted run would otherwise
            // never be retried; returning them to Scheduled may duplicate
            // sends, the usual at-least-once trade-off.
            match this.messages.recover_claims().await {
                Ok(0) => {}
                Ok(n) => tracing::info!("♻️ Recovered {n} stale dispatch claim(s)"),
                Err(e) => tracing::warn!("⚠️ Claim recovery failed: {e}"),
            }
            let mut interval = tokio::time::interval(this.poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = this.run_once().await {
                            tracing::warn!("⚠️ Dispatch tick failed: {e}");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::info!("Dispatcher stopped");
        }));
    }

    /// Signal the loop and wait for it to exit. Safe to call repeatedly.
    pub async fn stop(&self) {
        let task = { self.task.lock().unwrap().take() };
        if let Some(task) = task {
            let _ = self.shutdown.send(true);
            let _ = task.await;
        }
    }

    /// One full tick. Returns how many messages this instance dispatched.
    pub async fn run_once(&self) -> Result<usize> {
        let now = self.clock.now();

        // DMS evaluation rides the dispatch poll. Released messages are
        // durably promoted to Scheduled("now") so the uniform claim path
        // picks them up, this tick or any later one.
        if let Some(dms) = &self.dms {
            for event in dms.poll().await? {
                for message in &event.messages {
                    match self.messages.promote(&message.id, now).await {
                        Ok(true) => {
                            tracing::debug!("Promoted released message {}", message.id);
                        }
                        Ok(false) => {} // already promoted by a peer
                        Err(e) => {
                            tracing::warn!("⚠️ Promote failed for {}: {e}", message.id);
                        }
                    }
                }
            }
        }

        // Retry claim releases that failed in an earlier tick, so those
        // messages re-enter the due scan as soon as the store recovers.
        let held = { std::mem::take(&mut *self.stuck.lock().unwrap()) };
        for id in held {
            if let Err(e) = self.messages.finalize(&id, MessageStatus::Scheduled, None).await {
                tracing::warn!("⚠️ Claim release retry failed for {id}: {e}");
                self.stuck.lock().unwrap().push(id);
            }
        }

        let due = self.messages.list_due_messages(now).await?;
        let mut dispatched = 0;
        for message in due {
            match self.messages.claim(&message.id).await {
                Ok(true) => {}
                // Claimed by a concurrent tick or another instance. Expected,
                // not an error.
                Ok(false) => continue,
                // One message's store trouble must not starve its siblings.
                Err(e) => {
                    tracing::warn!("⚠️ Claim failed for {}: {e}", message.id);
                    continue;
                }
            }
            self.dispatch_message(&message).await;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Fan out one claimed message to all its recipients, then finalize.
    async fn dispatch_message(&self, message: &Message) {
        tracing::info!(
            "📨 Dispatching '{}' to {} recipient(s)",
            message.subject,
            message.recipient_ids.len()
        );
        let rendered = content::render(message);

        let mut any_ok = false;
        for recipient_id in &message.recipient_ids {
            // Each recipient is independent; one failure never blocks the rest.
            any_ok |= self.send_to_recipient(message, recipient_id, &rendered).await;
        }

        let now = self.clock.now();
        let (status, sent_at) = if any_ok {
            (MessageStatus::Sent, Some(now))
        } else {
            (MessageStatus::Failed, None)
        };
        if let Err(e) = self.messages.finalize(&message.id, status, sent_at).await {
            tracing::warn!("⚠️ Finalize failed for {}, will retry next tick: {e}", message.id);
            // Best-effort claim release so the next tick sees the message as
            // still Scheduled. Retrying may duplicate sends; that is the
            // documented at-least-once trade-off.
            if let Err(e) = self
                .messages
                .finalize(&message.id, MessageStatus::Scheduled, None)
                .await
            {
                tracing::warn!("⚠️ Claim release failed for {}: {e}", message.id);
                self.stuck.lock().unwrap().push(message.id.clone());
            }
        }
    }

    async fn send_to_recipient(
        &self,
        message: &Message,
        recipient_id: &str,
        rendered: &RenderedContent,
    ) -> bool {
        let now = self.clock.now();
        if let Err(e) = self
            .tracker
            .record(&message.id, recipient_id, DeliveryState::Pending, now, None)
            .await
        {
            tracing::warn!("⚠️ Delivery record for {recipient_id} failed: {e}");
        }

        let result = self.try_send(recipient_id, rendered).await;
        let now = self.clock.now();
        let (state, reason, delivered) = match result {
            Ok(outcome) if outcome.success => (DeliveryState::Delivered, None, true),
            Ok(outcome) => (
                DeliveryState::Failed,
                outcome.error.or_else(|| Some("send rejected".into())),
                false,
            ),
            Err(e) => (DeliveryState::Failed, Some(e.to_string()), false),
        };
        if let Some(reason) = &reason {
            tracing::warn!("Send to {recipient_id} failed: {reason}");
        }
        if let Err(e) = self
            .tracker
            .record(&message.id, recipient_id, state, now, reason.as_deref())
            .await
        {
            tracing::warn!("⚠️ Delivery record for {recipient_id} failed: {e}");
        }
        delivered
    }

    async fn try_send(&self, recipient_id: &str, rendered: &RenderedContent) -> Result<SendOutcome> {
        let contact = self.directory.resolve(recipient_id).await?;
        let request = SendRequest {
            to_email: contact.email,
            to_name: contact.name,
            subject: rendered.subject.clone(),
            body: rendered.body.clone(),
            attachments: rendered.attachments.clone(),
        };
        match tokio::time::timeout(self.send_timeout, self.sender.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(VigilError::Channel(format!("send to {recipient_id} timed out"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::collections::HashSet;
    use vigil_core::clock::ManualClock;
    use vigil_core::types::{
        DmsSettings, MessageScope, MessageType, TimeSpan,
    };
    use vigil_store::{MemoryDirectory, MemoryStore};

    /// Sender that records every request and fails for scripted addresses.
    struct ScriptedSender {
        sent: Mutex<Vec<SendRequest>>,
        fail_for: HashSet<String>,
        delay: Option<Duration>,
    }

    impl ScriptedSender {
        fn new() -> Self {
            Self { sent: Mutex::new(Vec::new()), fail_for: HashSet::new(), delay: None }
        }

        fn failing_for(addresses: &[&str]) -> Self {
            let mut sender = Self::new();
            sender.fail_for = addresses.iter().map(|s| s.to_string()).collect();
            sender
        }

        fn sent(&self) -> Vec<SendRequest> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChannelSender for ScriptedSender {
        async fn send(&self, request: SendRequest) -> vigil_core::Result<SendOutcome> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let fail = self.fail_for.contains(&request.to_email);
            self.sent.lock().unwrap().push(request);
            if fail {
                Ok(SendOutcome::failed("smtp rejected"))
            } else {
                Ok(SendOutcome::ok(Some("provider-1".into())))
            }
        }
    }

    fn scheduled_message(id: &str, recipients: &[&str], now: chrono::DateTime<Utc>) -> Message {
        Message {
            id: id.into(),
            user_id: "u1".into(),
            scope: MessageScope::Normal,
            types: vec![MessageType::Email],
            status: MessageStatus::Scheduled,
            subject: "Scheduled note".into(),
            body: "Hello there".into(),
            attachments: vec![],
            scheduled_for: Some(now - ChronoDuration::minutes(5)),
            sent_at: None,
            recipient_ids: recipients.iter().map(|s| s.to_string()).collect(),
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        sender: Arc<ScriptedSender>,
        tracker: Arc<DeliveryTracker>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new(sender: ScriptedSender) -> Self {
            let store = Arc::new(MemoryStore::new());
            let tracker = Arc::new(DeliveryTracker::new(store.clone()));
            let clock =
                Arc::new(ManualClock::at(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()));
            Self { store, sender: Arc::new(sender), tracker, clock }
        }

        fn directory(&self) -> Arc<MemoryDirectory> {
            let directory = Arc::new(MemoryDirectory::new());
            directory.add("r1", "r1@example.com", "Recipient One");
            directory.add("r2", "r2@example.com", "Recipient Two");
            directory.add("u1", "owner@example.com", "Owner");
            directory
        }

        fn dispatcher(&self, dms: Option<Arc<DmsEngine>>) -> Arc<ScheduledDispatcher> {
            let config = DispatcherConfig { poll_interval_secs: 1, send_timeout_secs: 5 };
            Arc::new(ScheduledDispatcher::new(
                self.store.clone(),
                self.tracker.clone(),
                self.sender.clone(),
                self.directory(),
                self.clock.clone(),
                dms,
                &config,
            ))
        }
    }

    #[tokio::test]
    async fn partial_failure_still_counts_as_sent() {
        // Scenario: r1 succeeds, r2 fails — message is Sent, the per-recipient
        // truth lives in the tracker.
        let h = Harness::new(ScriptedSender::failing_for(&["r2@example.com"]));
        let now = h.clock.now();
        h.store.insert_message(scheduled_message("m1", &["r1", "r2"], now));

        let dispatcher = h.dispatcher(None);
        assert_eq!(dispatcher.run_once().await.unwrap(), 1);

        let message = h.store.message("m1").unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.sent_at, Some(now));
        assert_eq!(h.tracker.status("m1", "r1"), Some(DeliveryState::Delivered));
        assert_eq!(h.tracker.status("m1", "r2"), Some(DeliveryState::Failed));

        let summary = h.tracker.summarize("m1");
        assert_eq!(summary.delivered, 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn all_failures_finalize_as_failed() {
        let h = Harness::new(ScriptedSender::failing_for(&["r1@example.com", "r2@example.com"]));
        let now = h.clock.now();
        h.store.insert_message(scheduled_message("m1", &["r1", "r2"], now));

        let dispatcher = h.dispatcher(None);
        dispatcher.run_once().await.unwrap();

        let message = h.store.message("m1").unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
        assert!(message.sent_at.is_none());
        // No automatic retry: the next tick finds nothing due.
        assert_eq!(dispatcher.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_ticks_claim_exclusively() {
        // Scenario: two dispatcher instances share the store; only one wins
        // the claim, and each recipient sees exactly one send.
        let h = Harness::new(ScriptedSender::new());
        let now = h.clock.now();
        h.store.insert_message(scheduled_message("m1", &["r1", "r2"], now));

        let a = h.dispatcher(None);
        let b = h.dispatcher(None);
        let (ra, rb) = tokio::join!(a.run_once(), b.run_once());
        assert_eq!(ra.unwrap() + rb.unwrap(), 1);

        let sent = h.sender.sent();
        assert_eq!(sent.len(), 2);
        let addresses: HashSet<&str> = sent.iter().map(|r| r.to_email.as_str()).collect();
        assert_eq!(addresses.len(), 2);
        assert_eq!(h.store.message("m1").unwrap().status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn unresolvable_recipient_is_a_recipient_level_failure() {
        let h = Harness::new(ScriptedSender::new());
        let now = h.clock.now();
        h.store.insert_message(scheduled_message("m1", &["r1", "ghost"], now));

        h.dispatcher(None).run_once().await.unwrap();
        assert_eq!(h.tracker.status("m1", "r1"), Some(DeliveryState::Delivered));
        assert_eq!(h.tracker.status("m1", "ghost"), Some(DeliveryState::Failed));
        assert_eq!(h.store.message("m1").unwrap().status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn slow_sends_time_out_as_failures() {
        let mut sender = ScriptedSender::new();
        sender.delay = Some(Duration::from_secs(60));
        let h = Harness::new(sender);
        let now = h.clock.now();
        h.store.insert_message(scheduled_message("m1", &["r1"], now));

        let config = DispatcherConfig { poll_interval_secs: 1, send_timeout_secs: 0 };
        let dispatcher = Arc::new(ScheduledDispatcher::new(
            h.store.clone(),
            h.tracker.clone(),
            h.sender.clone(),
            h.directory(),
            h.clock.clone(),
            None,
            &config,
        ));
        dispatcher.run_once().await.unwrap();

        assert_eq!(h.tracker.status("m1", "r1"), Some(DeliveryState::Failed));
        assert_eq!(h.store.message("m1").unwrap().status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn failed_finalize_retries_next_tick() {
        let h = Harness::new(ScriptedSender::new());
        let now = h.clock.now();
        h.store.insert_message(scheduled_message("m1", &["r1"], now));
        h.store.set_fail_finalize(true);

        let dispatcher = h.dispatcher(None);
        dispatcher.run_once().await.unwrap();
        // Finalize failed; the claim was released, the message is still due.
        assert_eq!(h.store.message("m1").unwrap().status, MessageStatus::Scheduled);
        assert_eq!(h.sender.sent().len(), 1);

        h.store.set_fail_finalize(false);
        dispatcher.run_once().await.unwrap();
        // At-least-once: the retry duplicates the send, then lands Sent.
        assert_eq!(h.sender.sent().len(), 2);
        assert_eq!(h.store.message("m1").unwrap().status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn claim_error_does_not_starve_other_messages() {
        let h = Harness::new(ScriptedSender::new());
        let now = h.clock.now();
        let mut first = scheduled_message("m1", &["r1"], now);
        first.scheduled_for = Some(now - ChronoDuration::minutes(10));
        h.store.insert_message(first);
        h.store.insert_message(scheduled_message("m2", &["r2"], now));
        h.store.set_fail_claim(Some("m1"));

        // m1 sorts first; its store error must not abort the tick.
        let dispatcher = h.dispatcher(None);
        assert_eq!(dispatcher.run_once().await.unwrap(), 1);
        assert_eq!(h.store.message("m2").unwrap().status, MessageStatus::Sent);
        assert_eq!(h.store.message("m1").unwrap().status, MessageStatus::Scheduled);

        // The troubled message is picked up once the store recovers.
        h.store.set_fail_claim(None);
        assert_eq!(dispatcher.run_once().await.unwrap(), 1);
        assert_eq!(h.store.message("m1").unwrap().status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn stranded_claim_is_released_on_a_later_tick() {
        let h = Harness::new(ScriptedSender::new());
        let now = h.clock.now();
        h.store.insert_message(scheduled_message("m1", &["r1"], now));
        h.store.set_fail_finalize_all(true);

        let dispatcher = h.dispatcher(None);
        dispatcher.run_once().await.unwrap();
        // Both the finalize and the revert failed; the claim is still held.
        assert_eq!(h.store.message("m1").unwrap().status, MessageStatus::Dispatching);

        h.store.set_fail_finalize_all(false);
        dispatcher.run_once().await.unwrap();
        // The held claim is released first, so the same tick redispatches.
        assert_eq!(h.store.message("m1").unwrap().status, MessageStatus::Sent);
        assert_eq!(h.sender.sent().len(), 2);
    }

    #[tokio::test]
    async fn released_dms_messages_flow_through_the_same_path() {
        let h = Harness::new(ScriptedSender::new());
        let directory = h.directory();
        let dms = Arc::new(DmsEngine::new(
            h.store.clone(),
            h.store.clone(),
            h.sender.clone(),
            directory,
            h.clock.clone(),
        ));
        let settings = DmsSettings {
            frequency: TimeSpan::days(7),
            grace: TimeSpan::days(3),
            duration_days: 365,
            reminder_lead_time: TimeSpan::days(1),
            channels: Default::default(),
            escalation_contact_id: None,
            emergency_instructions: None,
        };
        dms.activate("u1", &settings).await.unwrap();

        let mut protected = scheduled_message("m1", &["r1"], h.clock.now());
        protected.scope = MessageScope::Dms;
        protected.status = MessageStatus::Draft;
        protected.scheduled_for = None;
        h.store.insert_message(protected);

        let dispatcher = h.dispatcher(Some(dms));

        // Before release nothing is due.
        assert_eq!(dispatcher.run_once().await.unwrap(), 0);

        // Grace lapses; the release promotes and dispatches in one tick.
        h.clock.advance(ChronoDuration::days(11));
        assert_eq!(dispatcher.run_once().await.unwrap(), 1);
        let message = h.store.message("m1").unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(h.tracker.status("m1", "r1"), Some(DeliveryState::Delivered));

        // Terminal release: later ticks stay quiet.
        assert_eq!(dispatcher.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let h = Harness::new(ScriptedSender::new());
        let dispatcher = h.dispatcher(None);

        dispatcher.start();
        dispatcher.start();
        dispatcher.stop().await;
        dispatcher.stop().await;

        // A fresh start after stop works too.
        dispatcher.start();
        dispatcher.stop().await;
    }
}
