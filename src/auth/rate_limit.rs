//! Named rate-limit actions over the counter store.
//!
//! Each action carries its own limit and window and is keyed independently
//! (client IP, user id, or challenge id), so unrelated subjects never
//! contend. Checks are side-effect free; `record` increments and is called
//! only when the underlying action is actually attempted. Store failures
//! deny the action: every quota here gates something security-critical.

use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use super::counter::CounterStore;

/// Quota-governed actions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateAction {
    /// Challenge issuance, keyed by client IP.
    ChallengeStart,
    /// Second-factor verification attempts, keyed by user id.
    Verification,
    /// SMS code resends, keyed by user id.
    Resend,
    /// Failed login attempts feeding the CAPTCHA and lockout thresholds,
    /// keyed by login subject.
    FailedLogins,
}

impl RateAction {
    fn prefix(self) -> &'static str {
        match self {
            Self::ChallengeStart => "challenge-start",
            Self::Verification => "verify",
            Self::Resend => "resend",
            Self::FailedLogins => "failed-logins",
        }
    }
}

/// Limit/window pair for one action.
#[derive(Clone, Copy, Debug)]
pub struct RateRule {
    pub limit: u64,
    pub window: Duration,
}

impl RateRule {
    #[must_use]
    pub const fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// Outcome of a quota check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Attempts counted in the live window, including this one for `record`.
    pub count: u64,
    pub remaining: u64,
    /// When the current window resets; absent when no window is live.
    pub resets_at_ms: Option<i64>,
}

impl RateDecision {
    fn denied() -> Self {
        Self {
            allowed: false,
            count: u64::MAX,
            remaining: 0,
            resets_at_ms: None,
        }
    }
}

/// Per-action quotas over a shared counter store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    challenge_start: RateRule,
    verification: RateRule,
    resend: RateRule,
    failed_logins: RateRule,
}

impl RateLimiter {
    #[must_use]
    pub fn new(
        store: Arc<dyn CounterStore>,
        challenge_start: RateRule,
        verification: RateRule,
        resend: RateRule,
        failed_logins: RateRule,
    ) -> Self {
        Self {
            store,
            challenge_start,
            verification,
            resend,
            failed_logins,
        }
    }

    fn rule(&self, action: RateAction) -> RateRule {
        match action {
            RateAction::ChallengeStart => self.challenge_start,
            RateAction::Verification => self.verification,
            RateAction::Resend => self.resend,
            RateAction::FailedLogins => self.failed_logins,
        }
    }

    fn key(action: RateAction, subject: &str) -> String {
        format!("{}:{subject}", action.prefix())
    }

    /// Would the action be allowed right now? Does not count an attempt.
    pub fn check(&self, action: RateAction, subject: &str) -> RateDecision {
        let rule = self.rule(action);
        match self.store.get(&Self::key(action, subject)) {
            Ok(value) => RateDecision {
                allowed: value.count < rule.limit,
                count: value.count,
                remaining: rule.limit.saturating_sub(value.count),
                resets_at_ms: value.resets_at_ms,
            },
            Err(err) => {
                error!(action = action.prefix(), "Counter store check failed: {err}");
                RateDecision::denied()
            }
        }
    }

    /// Count one attempt and report the quota state after it.
    pub fn record(&self, action: RateAction, subject: &str) -> RateDecision {
        let rule = self.rule(action);
        match self.store.increment(&Self::key(action, subject), rule.window) {
            Ok(value) => RateDecision {
                allowed: value.count <= rule.limit,
                count: value.count,
                remaining: rule.limit.saturating_sub(value.count),
                resets_at_ms: value.resets_at_ms,
            },
            Err(err) => {
                error!(action = action.prefix(), "Counter store increment failed: {err}");
                RateDecision::denied()
            }
        }
    }

    /// Current count for an action without deciding anything.
    pub fn count(&self, action: RateAction, subject: &str) -> u64 {
        match self.store.get(&Self::key(action, subject)) {
            Ok(value) => value.count,
            Err(err) => {
                error!(action = action.prefix(), "Counter store read failed: {err}");
                0
            }
        }
    }

    /// Forget the window, e.g. after a successful terminal outcome.
    pub fn reset(&self, action: RateAction, subject: &str) {
        if let Err(err) = self.store.reset(&Self::key(action, subject)) {
            error!(action = action.prefix(), "Counter store reset failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use crate::auth::counter::MemoryCounterStore;

    fn limiter() -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        let limiter = RateLimiter::new(
            store,
            RateRule::new(10, Duration::from_secs(900)),
            RateRule::new(5, Duration::from_secs(900)),
            RateRule::new(3, Duration::from_secs(900)),
            RateRule::new(10, Duration::from_secs(900)),
        );
        (clock, limiter)
    }

    #[test]
    fn check_does_not_consume_quota() {
        let (_clock, limiter) = limiter();
        for _ in 0..20 {
            assert!(limiter.check(RateAction::Resend, "u1").allowed);
        }
        assert_eq!(limiter.check(RateAction::Resend, "u1").remaining, 3);
    }

    #[test]
    fn record_denies_past_the_limit() {
        let (_clock, limiter) = limiter();
        assert!(limiter.record(RateAction::Resend, "u1").allowed);
        assert!(limiter.record(RateAction::Resend, "u1").allowed);
        let third = limiter.record(RateAction::Resend, "u1");
        assert!(third.allowed);
        assert_eq!(third.remaining, 0);
        assert!(!limiter.record(RateAction::Resend, "u1").allowed);
        assert!(!limiter.check(RateAction::Resend, "u1").allowed);
    }

    #[test]
    fn windows_are_independent_per_action_and_subject() {
        let (_clock, limiter) = limiter();
        for _ in 0..3 {
            limiter.record(RateAction::Resend, "u1");
        }
        assert!(!limiter.check(RateAction::Resend, "u1").allowed);
        assert!(limiter.check(RateAction::Resend, "u2").allowed);
        assert!(limiter.check(RateAction::Verification, "u1").allowed);
    }

    #[test]
    fn window_expiry_restores_quota() {
        let (clock, limiter) = limiter();
        for _ in 0..3 {
            limiter.record(RateAction::Resend, "u1");
        }
        assert!(!limiter.check(RateAction::Resend, "u1").allowed);
        clock.advance_ms(900_000);
        assert!(limiter.check(RateAction::Resend, "u1").allowed);
    }

    #[test]
    fn reset_clears_the_window() {
        let (_clock, limiter) = limiter();
        for _ in 0..5 {
            limiter.record(RateAction::Verification, "u1");
        }
        assert!(!limiter.check(RateAction::Verification, "u1").allowed);
        limiter.reset(RateAction::Verification, "u1");
        let decision = limiter.check(RateAction::Verification, "u1");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
    }
}
