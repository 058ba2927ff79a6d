//! Pure cycle math — deadline banding, check-in, pause/resume arithmetic.
//!
//! Everything here is a function of (config, cycle, now); persistence and
//! concurrency live in the engine.

use chrono::{DateTime, Duration, Utc};

use vigil_core::error::{Result, VigilError};
use vigil_core::types::{CycleState, DmsConfig, DmsCycle, DmsStatus};

/// Compute the cycle state at `now`.
///
/// Paused configs/cycles are frozen: evaluation returns Paused unchanged.
/// Released is terminal. Otherwise the state is a pure band of `now`
/// against the check-in deadline and the grace deadline.
pub fn evaluate(config: &DmsConfig, cycle: &DmsCycle, now: DateTime<Utc>) -> CycleState {
    if config.status == DmsStatus::Paused || cycle.state == CycleState::Paused {
        return CycleState::Paused;
    }
    if cycle.state == CycleState::Released {
        return CycleState::Released;
    }
    let deadline = cycle.next_checkin_at;
    let grace_deadline = deadline + config.grace.to_duration();
    if now < deadline {
        CycleState::Active
    } else if now < grace_deadline {
        CycleState::Grace
    } else {
        CycleState::PendingRelease
    }
}

/// Apply a check-in: push the deadline a full frequency out from `now`,
/// reset to Active, clear reminder bookkeeping.
///
/// Valid only while the cycle evaluates to Active or Grace.
pub fn apply_check_in(config: &DmsConfig, cycle: &mut DmsCycle, now: DateTime<Utc>) -> Result<()> {
    match evaluate(config, cycle, now) {
        CycleState::Active | CycleState::Grace => {}
        other => {
            return Err(VigilError::InvalidTransition(format!(
                "cannot check in from {other:?}"
            )))
        }
    }
    cycle.next_checkin_at = now + config.frequency.to_duration();
    cycle.state = CycleState::Active;
    cycle.checkin_reminder_sent = false;
    cycle.last_reminder_sent = None;
    Ok(())
}

/// Freeze the countdown. While Active the remaining time to the check-in
/// deadline is stored; while in Grace the remaining grace is stored instead,
/// so a user paused mid-grace does not come back to a fresh window.
pub fn apply_pause(config: &DmsConfig, cycle: &mut DmsCycle, now: DateTime<Utc>) -> Result<()> {
    let remaining = match evaluate(config, cycle, now) {
        CycleState::Active => {
            cycle.paused_from = Some(CycleState::Active);
            cycle.next_checkin_at - now
        }
        CycleState::Grace => {
            cycle.paused_from = Some(CycleState::Grace);
            cycle.next_checkin_at + config.grace.to_duration() - now
        }
        other => {
            return Err(VigilError::InvalidTransition(format!(
                "cannot pause from {other:?}"
            )))
        }
    };
    cycle.paused_remaining_secs = Some(remaining.num_seconds());
    cycle.state = CycleState::Paused;
    Ok(())
}

/// Thaw a paused cycle, preserving the remaining time and restoring the
/// pre-pause state.
pub fn apply_resume(config: &DmsConfig, cycle: &mut DmsCycle, now: DateTime<Utc>) -> Result<()> {
    if cycle.state != CycleState::Paused {
        return Err(VigilError::InvalidTransition(format!(
            "cannot resume from {:?}",
            cycle.state
        )));
    }
    let remaining = cycle
        .paused_remaining_secs
        .map(Duration::seconds)
        .ok_or_else(|| {
            VigilError::InvalidTransition("paused cycle has no remaining time".into())
        })?;
    match cycle.paused_from {
        Some(CycleState::Grace) => {
            // Re-derive the deadline so the grace deadline lands at
            // now + remaining.
            cycle.next_checkin_at = now + remaining - config.grace.to_duration();
            cycle.state = CycleState::Grace;
        }
        _ => {
            cycle.next_checkin_at = now + remaining;
            cycle.state = CycleState::Active;
        }
    }
    cycle.paused_remaining_secs = None;
    cycle.paused_from = None;
    Ok(())
}

/// Whether the check-in reminder should fire at `now`: cycle Active, inside
/// the lead-time window, not already sent this cycle.
pub fn reminder_due(config: &DmsConfig, cycle: &DmsCycle, now: DateTime<Utc>) -> bool {
    evaluate(config, cycle, now) == CycleState::Active
        && !cycle.checkin_reminder_sent
        && now >= cycle.next_checkin_at - config.reminder_lead_time.to_duration()
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::types::{DmsSettings, TimeSpan};

    fn fixture(now: DateTime<Utc>) -> (DmsConfig, DmsCycle) {
        let settings = DmsSettings {
            frequency: TimeSpan::days(7),
            grace: TimeSpan::days(3),
            duration_days: 365,
            reminder_lead_time: TimeSpan::days(1),
            channels: Default::default(),
            escalation_contact_id: None,
            emergency_instructions: None,
        };
        let config = DmsConfig::new("u1", &settings, now);
        let cycle = DmsCycle::start(&config, now);
        (config, cycle)
    }

    #[test]
    fn evaluate_bands() {
        let now = Utc::now();
        let (config, mut cycle) = fixture(now);

        // Before the deadline.
        assert_eq!(evaluate(&config, &cycle, now), CycleState::Active);

        // One day past the deadline, inside the 3-day grace.
        cycle.next_checkin_at = now - Duration::days(1);
        assert_eq!(evaluate(&config, &cycle, now), CycleState::Grace);

        // Four days past the deadline, grace lapsed.
        cycle.next_checkin_at = now - Duration::days(4);
        assert_eq!(evaluate(&config, &cycle, now), CycleState::PendingRelease);
    }

    #[test]
    fn evaluate_respects_pause_and_release() {
        let now = Utc::now();
        let (mut config, mut cycle) = fixture(now);

        cycle.next_checkin_at = now - Duration::days(30);
        cycle.state = CycleState::Paused;
        assert_eq!(evaluate(&config, &cycle, now), CycleState::Paused);

        cycle.state = CycleState::Active;
        config.status = DmsStatus::Paused;
        assert_eq!(evaluate(&config, &cycle, now), CycleState::Paused);

        config.status = DmsStatus::Active;
        cycle.state = CycleState::Released;
        assert_eq!(evaluate(&config, &cycle, now), CycleState::Released);
    }

    #[test]
    fn check_in_resets_window_and_reminders() {
        let now = Utc::now();
        let (config, mut cycle) = fixture(now);
        cycle.checkin_reminder_sent = true;
        cycle.last_reminder_sent = Some(now - Duration::hours(12));

        let later = now + Duration::days(3);
        apply_check_in(&config, &mut cycle, later).unwrap();
        assert_eq!(cycle.next_checkin_at, later + Duration::days(7));
        assert_eq!(cycle.state, CycleState::Active);
        assert!(!cycle.checkin_reminder_sent);
        assert!(cycle.last_reminder_sent.is_none());
    }

    #[test]
    fn check_in_works_from_grace() {
        let now = Utc::now();
        let (config, mut cycle) = fixture(now);
        cycle.next_checkin_at = now - Duration::days(1);

        apply_check_in(&config, &mut cycle, now).unwrap();
        assert_eq!(cycle.next_checkin_at, now + Duration::days(7));
        assert_eq!(cycle.state, CycleState::Active);
    }

    #[test]
    fn check_in_rejected_after_grace_lapses() {
        let now = Utc::now();
        let (config, mut cycle) = fixture(now);
        cycle.next_checkin_at = now - Duration::days(4);

        let err = apply_check_in(&config, &mut cycle, now).unwrap_err();
        assert!(matches!(err, VigilError::InvalidTransition(_)));
    }

    #[test]
    fn pause_resume_preserves_remaining_time() {
        let now = Utc::now();
        let (config, mut cycle) = fixture(now);

        // Two days into a 7-day window.
        let pause_at = now + Duration::days(2);
        apply_pause(&config, &mut cycle, pause_at).unwrap();
        assert_eq!(cycle.state, CycleState::Paused);
        assert_eq!(cycle.paused_remaining_secs, Some(Duration::days(5).num_seconds()));

        // Resumed a day later: 5 days remain, not a fresh 7.
        let resume_at = pause_at + Duration::days(1);
        apply_resume(&config, &mut cycle, resume_at).unwrap();
        assert_eq!(cycle.state, CycleState::Active);
        assert_eq!(cycle.next_checkin_at, resume_at + Duration::days(5));
        assert!(cycle.paused_remaining_secs.is_none());
    }

    #[test]
    fn pause_in_grace_stores_remaining_grace() {
        let now = Utc::now();
        let (config, mut cycle) = fixture(now);
        // One day into the 3-day grace.
        cycle.next_checkin_at = now - Duration::days(1);

        apply_pause(&config, &mut cycle, now).unwrap();
        assert_eq!(cycle.paused_from, Some(CycleState::Grace));
        assert_eq!(cycle.paused_remaining_secs, Some(Duration::days(2).num_seconds()));

        let resume_at = now + Duration::days(10);
        apply_resume(&config, &mut cycle, resume_at).unwrap();
        assert_eq!(cycle.state, CycleState::Grace);
        // Still 2 days of grace before release.
        assert_eq!(
            evaluate(&config, &cycle, resume_at + Duration::days(1)),
            CycleState::Grace
        );
        assert_eq!(
            evaluate(&config, &cycle, resume_at + Duration::days(2)),
            CycleState::PendingRelease
        );
    }

    #[test]
    fn evaluate_does_not_advance_while_paused() {
        let now = Utc::now();
        let (config, mut cycle) = fixture(now);
        apply_pause(&config, &mut cycle, now).unwrap();

        // A month passes; the frozen cycle never reaches release.
        assert_eq!(
            evaluate(&config, &cycle, now + Duration::days(30)),
            CycleState::Paused
        );
    }

    #[test]
    fn reminder_window() {
        let now = Utc::now();
        let (config, mut cycle) = fixture(now);

        // Outside the 1-day lead window.
        assert!(!reminder_due(&config, &cycle, now + Duration::days(5)));
        // Inside it.
        assert!(reminder_due(&config, &cycle, now + Duration::days(6) + Duration::hours(1)));
        // Already sent.
        cycle.checkin_reminder_sent = true;
        assert!(!reminder_due(&config, &cycle, now + Duration::days(6) + Duration::hours(1)));
        // Past the deadline the cycle is in Grace, no reminder.
        cycle.checkin_reminder_sent = false;
        assert!(!reminder_due(&config, &cycle, now + Duration::days(8)));
    }
}
