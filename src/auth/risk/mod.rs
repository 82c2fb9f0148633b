//! Pre-authentication risk gate.
//!
//! Evaluates every credential-check attempt against the subject's failure
//! history: progressive delay on consecutive failures, CAPTCHA once the
//! window accumulates enough of them, escalating lockout at the threshold,
//! and anomaly scoring on success. Security state is a narrow per-subject
//! record reachable only through this module.

pub mod anomaly;
pub mod history;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use super::clock::Clock;
use super::directory::{ClientContext, GeoPoint};
use super::rate_limit::{RateAction, RateLimiter};
use anomaly::{AnomalyReport, AnomalyScorer};
use history::{AttemptOutcome, AttemptRecord, FailureReason, HistoryStore};

/// Tunables for delay, CAPTCHA, lockout, and anomaly scoring.
#[derive(Clone, Debug)]
pub struct RiskPolicy {
    /// Cumulative windowed failures after which CAPTCHA becomes mandatory.
    pub captcha_threshold: u64,
    /// Cumulative windowed failures that lock the account.
    pub lockout_threshold: u64,
    pub delay_base_ms: u64,
    pub delay_cap_ms: u64,
    /// Lockout durations indexed by tier; the last entry is the ceiling.
    pub lockout_durations_ms: Vec<i64>,
    /// A re-lock within this span of the previous one escalates the tier.
    pub lockout_cooldown_ms: i64,
    pub anomaly_threshold: f32,
    pub travel_window_ms: i64,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            captcha_threshold: 3,
            lockout_threshold: 10,
            delay_base_ms: 1_000,
            delay_cap_ms: 16_000,
            lockout_durations_ms: vec![30 * 60 * 1000, 60 * 60 * 1000, 24 * 60 * 60 * 1000],
            lockout_cooldown_ms: 24 * 60 * 60 * 1000,
            anomaly_threshold: 0.3,
            travel_window_ms: 60 * 60 * 1000,
        }
    }
}

/// Per-subject lockout record. Tier survives an expired lockout so repeat
/// offenders escalate; only a successful authentication clears it.
#[derive(Clone, Copy, Debug, Default)]
struct SecurityState {
    lockout_tier: usize,
    locked_until_ms: Option<i64>,
    last_locked_at_ms: Option<i64>,
}

/// What the gate decided about one failed attempt.
#[derive(Clone, Copy, Debug)]
pub struct FailureAssessment {
    /// Server-side wait before responding; never disclosed to the client.
    pub delay_ms: u64,
    /// The next attempt must carry a verified CAPTCHA token.
    pub captcha_required: bool,
    pub locked_until_ms: Option<i64>,
    /// This failure is the one that tripped the lockout.
    pub newly_locked: bool,
    pub failures_in_window: u64,
}

pub struct RiskGate {
    clock: Arc<dyn Clock>,
    limiter: Arc<RateLimiter>,
    policy: RiskPolicy,
    scorer: AnomalyScorer,
    states: Mutex<HashMap<String, SecurityState>>,
    history: HistoryStore,
}

impl RiskGate {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, limiter: Arc<RateLimiter>, policy: RiskPolicy) -> Self {
        let scorer = AnomalyScorer::new(policy.anomaly_threshold, policy.travel_window_ms);
        Self {
            clock,
            limiter,
            policy,
            scorer,
            states: Mutex::new(HashMap::new()),
            history: HistoryStore::new(),
        }
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, HashMap<String, SecurityState>> {
        self.states
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Still-active lockout deadline for the subject, if any.
    ///
    /// Lockout wins over everything: while it holds, even correct
    /// credentials are rejected and no delay/CAPTCHA state is consumed.
    #[must_use]
    pub fn locked_until(&self, subject: &str) -> Option<i64> {
        let now = self.clock.now_ms();
        self.lock_states()
            .get(subject)
            .and_then(|state| state.locked_until_ms)
            .filter(|until| *until > now)
    }

    /// Has the subject crossed the CAPTCHA threshold in the active window?
    #[must_use]
    pub fn captcha_needed(&self, subject: &str) -> bool {
        self.limiter.count(RateAction::FailedLogins, subject) >= self.policy.captcha_threshold
    }

    /// Record a failed credential or second-factor check and decide the
    /// consequences. Failures of both kinds feed the same window.
    pub fn assess_failure(
        &self,
        subject: &str,
        user_id: Option<Uuid>,
        ctx: &ClientContext,
        reason: FailureReason,
    ) -> FailureAssessment {
        let window = self.limiter.record(RateAction::FailedLogins, subject);
        let failures = window.count;
        let delay_ms = progressive_delay_ms(
            failures,
            self.policy.delay_base_ms,
            self.policy.delay_cap_ms,
        );
        let captcha_required = failures >= self.policy.captcha_threshold;

        let mut locked_until_ms = None;
        let mut newly_locked = false;
        if failures >= self.policy.lockout_threshold {
            locked_until_ms = Some(self.lock_subject(subject));
            newly_locked = true;
        }

        self.history.append(AttemptRecord {
            subject: subject.to_string(),
            user_id,
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            device_fingerprint: ctx.device_fingerprint.clone(),
            outcome: AttemptOutcome::Failure,
            failure_reason: Some(reason),
            anomalous: false,
            anomaly_signals: Vec::new(),
            location: None,
            at_ms: self.clock.now_ms(),
        });

        if newly_locked {
            warn!(subject, failures, "Account locked after repeated failures");
        }

        FailureAssessment {
            delay_ms,
            captcha_required,
            locked_until_ms,
            newly_locked,
            failures_in_window: failures,
        }
    }

    /// Record an attempt rejected before credentials were checked
    /// (missing or failed CAPTCHA). Audit only; no counter side effects.
    pub fn record_rejection(&self, subject: &str, ctx: &ClientContext, reason: FailureReason) {
        self.history.append(AttemptRecord {
            subject: subject.to_string(),
            user_id: None,
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            device_fingerprint: ctx.device_fingerprint.clone(),
            outcome: AttemptOutcome::Failure,
            failure_reason: Some(reason),
            anomalous: false,
            anomaly_signals: Vec::new(),
            location: None,
            at_ms: self.clock.now_ms(),
        });
    }

    /// Score a successful password check against the subject's history,
    /// append the attempt, and extend the known profile.
    pub fn score_success(
        &self,
        subject: &str,
        user_id: Uuid,
        ctx: &ClientContext,
        location: Option<&GeoPoint>,
    ) -> AnomalyReport {
        let now = self.clock.now_ms();
        let profile = self.history.profile(user_id);
        let report = self.scorer.score(&profile, ctx, location, now);

        self.history.append(AttemptRecord {
            subject: subject.to_string(),
            user_id: Some(user_id),
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            device_fingerprint: ctx.device_fingerprint.clone(),
            outcome: AttemptOutcome::Success,
            failure_reason: None,
            anomalous: report.anomalous,
            anomaly_signals: report.signals.clone(),
            location: location.cloned(),
            at_ms: now,
        });
        self.history.absorb(user_id, ctx, location, now);

        if report.anomalous {
            info!(subject, score = report.score, "Anomalous login flagged");
        }
        report
    }

    /// Full reset after a completed authentication: failure window, delay
    /// tier, CAPTCHA requirement, and lockout tier all clear.
    pub fn on_authenticated(&self, subject: &str) {
        self.limiter.reset(RateAction::FailedLogins, subject);
        self.lock_states().remove(subject);
    }

    #[must_use]
    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    /// Lock the subject and return the (monotonically non-decreasing)
    /// deadline. Escalates the tier when the previous lockout was recent.
    fn lock_subject(&self, subject: &str) -> i64 {
        let now = self.clock.now_ms();
        let mut states = self.lock_states();
        let state = states.entry(subject.to_string()).or_default();

        let max_tier = self.policy.lockout_durations_ms.len().saturating_sub(1);
        if let Some(previous) = state.last_locked_at_ms {
            if now.saturating_sub(previous) <= self.policy.lockout_cooldown_ms {
                state.lockout_tier = (state.lockout_tier + 1).min(max_tier);
            }
        }

        let duration = self
            .policy
            .lockout_durations_ms
            .get(state.lockout_tier)
            .copied()
            .unwrap_or(30 * 60 * 1000);
        let candidate = now.saturating_add(duration);
        let deadline = state
            .locked_until_ms
            .map_or(candidate, |current| current.max(candidate));
        state.locked_until_ms = Some(deadline);
        state.last_locked_at_ms = Some(now);
        deadline
    }
}

/// Delay before answering the Nth consecutive windowed failure.
#[must_use]
pub fn progressive_delay_ms(failures: u64, base_ms: u64, cap_ms: u64) -> u64 {
    if failures == 0 || base_ms == 0 {
        return 0;
    }
    let shift = u32::try_from(failures.saturating_sub(1).min(20)).unwrap_or(20);
    base_ms.saturating_mul(1u64 << shift).min(cap_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::auth::counter::MemoryCounterStore;
    use crate::auth::rate_limit::RateRule;
    use std::time::Duration;

    fn gate() -> (Arc<ManualClock>, RiskGate) {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let limiter = Arc::new(RateLimiter::new(
            store,
            RateRule::new(10, Duration::from_secs(900)),
            RateRule::new(5, Duration::from_secs(900)),
            RateRule::new(3, Duration::from_secs(900)),
            RateRule::new(10, Duration::from_secs(900)),
        ));
        let gate = RiskGate::new(clock.clone(), limiter, RiskPolicy::default());
        (clock, gate)
    }

    fn fail(gate: &RiskGate, subject: &str) -> FailureAssessment {
        gate.assess_failure(
            subject,
            None,
            &ClientContext::default(),
            FailureReason::InvalidCredentials,
        )
    }

    #[test]
    fn delay_schedule_doubles_and_caps() {
        assert_eq!(progressive_delay_ms(1, 1_000, 16_000), 1_000);
        assert_eq!(progressive_delay_ms(2, 1_000, 16_000), 2_000);
        assert_eq!(progressive_delay_ms(3, 1_000, 16_000), 4_000);
        assert_eq!(progressive_delay_ms(4, 1_000, 16_000), 8_000);
        assert_eq!(progressive_delay_ms(5, 1_000, 16_000), 16_000);
        assert_eq!(progressive_delay_ms(9, 1_000, 16_000), 16_000);
        assert_eq!(progressive_delay_ms(63, 1_000, 16_000), 16_000);
    }

    #[test]
    fn captcha_required_from_third_windowed_failure() {
        let (_clock, gate) = gate();
        assert!(!fail(&gate, "alice").captcha_required);
        assert!(!fail(&gate, "alice").captcha_required);
        assert!(!gate.captcha_needed("alice"));
        let third = fail(&gate, "alice");
        assert!(third.captcha_required);
        assert!(gate.captcha_needed("alice"));
    }

    #[test]
    fn tenth_failure_locks_the_subject() {
        let (clock, gate) = gate();
        for n in 1..=9 {
            let assessment = fail(&gate, "alice");
            assert!(!assessment.newly_locked, "locked too early at {n}");
        }
        assert!(gate.locked_until("alice").is_none());

        let tenth = fail(&gate, "alice");
        assert!(tenth.newly_locked);
        assert_eq!(tenth.locked_until_ms, Some(30 * 60 * 1000));
        assert_eq!(gate.locked_until("alice"), Some(30 * 60 * 1000));
        clock.advance_ms(30 * 60 * 1000);
        assert!(gate.locked_until("alice").is_none());
    }

    #[test]
    fn repeated_lockout_escalates_and_success_resets_tier() {
        let (clock, gate) = gate();

        for _ in 0..10 {
            fail(&gate, "alice");
        }
        assert_eq!(gate.locked_until("alice"), Some(30 * 60 * 1000));

        // Wait out the lockout and the failure window, then relock within
        // the cooldown: tier escalates to one hour.
        clock.advance_ms(31 * 60 * 1000);
        for _ in 0..10 {
            fail(&gate, "alice");
        }
        let second = gate.locked_until("alice");
        assert_eq!(second, Some(clock.now_ms() + 60 * 60 * 1000));

        // Success clears the tier; the next lockout is back at the base.
        clock.advance_ms(61 * 60 * 1000);
        gate.on_authenticated("alice");
        for _ in 0..10 {
            fail(&gate, "alice");
        }
        assert_eq!(gate.locked_until("alice"), Some(clock.now_ms() + 30 * 60 * 1000));
    }

    #[test]
    fn authenticated_reset_clears_window_and_captcha() {
        let (_clock, gate) = gate();
        for _ in 0..4 {
            fail(&gate, "alice");
        }
        assert!(gate.captcha_needed("alice"));
        gate.on_authenticated("alice");
        assert!(!gate.captcha_needed("alice"));
        let next = fail(&gate, "alice");
        assert_eq!(next.failures_in_window, 1);
        assert_eq!(next.delay_ms, 1_000);
    }

    #[test]
    fn subjects_do_not_contend() {
        let (_clock, gate) = gate();
        for _ in 0..10 {
            fail(&gate, "alice");
        }
        assert!(gate.locked_until("alice").is_some());
        assert!(gate.locked_until("bob").is_none());
        assert!(!fail(&gate, "bob").captcha_required);
    }

    #[test]
    fn every_failure_is_appended_to_history() {
        let (_clock, gate) = gate();
        fail(&gate, "alice");
        gate.record_rejection(
            "alice",
            &ClientContext::default(),
            FailureReason::CaptchaMissing,
        );
        let attempts = gate.history().attempts_for("alice");
        assert_eq!(attempts.len(), 2);
        assert_eq!(
            attempts.first().and_then(|record| record.failure_reason),
            Some(FailureReason::InvalidCredentials)
        );
    }

    #[test]
    fn success_scoring_extends_profile_and_flags_anomalies() {
        let (clock, gate) = gate();
        let user = Uuid::new_v4();
        let ctx = ClientContext {
            device_fingerprint: Some("device-1".to_string()),
            ..ClientContext::default()
        };
        let geneva = GeoPoint {
            country: "CH".to_string(),
            region: None,
            city: None,
        };
        let first = gate.score_success("alice", user, &ctx, Some(&geneva));
        assert!(!first.anomalous);

        clock.advance_ms(10 * 60 * 1000);
        let tokyo = GeoPoint {
            country: "JP".to_string(),
            region: None,
            city: None,
        };
        let second = gate.score_success("alice", user, &ctx, Some(&tokyo));
        assert!(second.anomalous);
        assert!(second
            .signals
            .contains(&anomaly::AnomalySignal::ImpossibleTravel));

        // The anomalous location still joins the profile.
        let third = gate.score_success("alice", user, &ctx, Some(&tokyo));
        assert!(!third.anomalous);
    }
}
