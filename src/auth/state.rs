//! Auth configuration.
//!
//! One builder-style surface for every tunable the login and challenge
//! flows consume. Defaults are the defensive variants; deployments override
//! through the `with_*` methods at startup.

use std::sync::Arc;
use std::time::Duration;

use super::challenge::ChallengePolicy;
use super::rate_limit::RateRule;
use super::risk::RiskPolicy;

const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(15 * 60);
const DEFAULT_CHALLENGE_START_LIMIT: u64 = 10;
const DEFAULT_VERIFICATION_LIMIT: u64 = 5;
const DEFAULT_RESEND_LIMIT: u64 = 3;
const DEFAULT_SMS_RETRY_BACKOFF_MS: u64 = 250;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    risk: RiskPolicy,
    challenge: ChallengePolicy,
    challenge_start: RateRule,
    verification: RateRule,
    resend: RateRule,
    backup_pepper: Option<Arc<[u8]>>,
    sms_retry_backoff_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        let risk = RiskPolicy::default();
        Self {
            challenge_start: RateRule::new(DEFAULT_CHALLENGE_START_LIMIT, DEFAULT_RATE_WINDOW),
            verification: RateRule::new(DEFAULT_VERIFICATION_LIMIT, DEFAULT_RATE_WINDOW),
            resend: RateRule::new(DEFAULT_RESEND_LIMIT, DEFAULT_RATE_WINDOW),
            challenge: ChallengePolicy::default(),
            backup_pepper: None,
            sms_retry_backoff_ms: DEFAULT_SMS_RETRY_BACKOFF_MS,
            risk,
        }
    }

    #[must_use]
    pub fn with_risk_policy(mut self, risk: RiskPolicy) -> Self {
        self.risk = risk;
        self
    }

    #[must_use]
    pub fn with_challenge_policy(mut self, challenge: ChallengePolicy) -> Self {
        self.challenge = challenge;
        self
    }

    #[must_use]
    pub fn with_challenge_start_rule(mut self, rule: RateRule) -> Self {
        self.challenge_start = rule;
        self
    }

    #[must_use]
    pub fn with_verification_rule(mut self, rule: RateRule) -> Self {
        self.verification = rule;
        self
    }

    #[must_use]
    pub fn with_resend_rule(mut self, rule: RateRule) -> Self {
        self.resend = rule;
        self
    }

    #[must_use]
    pub fn with_backup_pepper(mut self, pepper: Arc<[u8]>) -> Self {
        self.backup_pepper = Some(pepper);
        self
    }

    #[must_use]
    pub fn with_sms_retry_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.sms_retry_backoff_ms = backoff_ms;
        self
    }

    /// Disable the progressive failure delay, mainly for tests.
    #[must_use]
    pub fn without_failure_delay(mut self) -> Self {
        self.risk.delay_base_ms = 0;
        self
    }

    #[must_use]
    pub fn risk_policy(&self) -> &RiskPolicy {
        &self.risk
    }

    #[must_use]
    pub fn challenge_policy(&self) -> ChallengePolicy {
        self.challenge
    }

    #[must_use]
    pub fn challenge_start_rule(&self) -> RateRule {
        self.challenge_start
    }

    #[must_use]
    pub fn verification_rule(&self) -> RateRule {
        self.verification
    }

    #[must_use]
    pub fn resend_rule(&self) -> RateRule {
        self.resend
    }

    /// The failure window doubles as the lockout-threshold rule: the risk
    /// gate reads the raw count, the limit mirrors the lockout threshold.
    #[must_use]
    pub fn failed_logins_rule(&self) -> RateRule {
        RateRule::new(self.risk.lockout_threshold, DEFAULT_RATE_WINDOW)
    }

    #[must_use]
    pub fn backup_pepper(&self) -> Option<Arc<[u8]>> {
        self.backup_pepper.clone()
    }

    #[must_use]
    pub fn sms_retry_backoff_ms(&self) -> u64 {
        self.sms_retry_backoff_ms
    }
}
