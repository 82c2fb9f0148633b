//! The auth facade: login, challenge verification, method switching,
//! resend, and status, wired through the risk gate and quotas.
//!
//! Session issuance stays outside; success results carry a completed-auth
//! signal (the user id) for the caller to act on. Notifications are
//! fire-and-forget and never block a response.

use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::challenge::{ChallengeService, ChallengeStatusView};
use super::clock::Clock;
use super::counter::{CounterStore, MemoryCounterStore};
use super::directory::{
    CaptchaVerifier, ChallengeMethod, ClientContext, CredentialStore, GeoLocator, GeoPoint,
    Notifier, SecondFactorProfile, SecurityEvent, SmsSender, UserDirectory,
};
use super::error::AuthError;
use super::rate_limit::{RateAction, RateDecision, RateLimiter};
use super::risk::history::FailureReason;
use super::risk::{FailureAssessment, RiskGate};
use super::state::AuthConfig;

/// External collaborators the service consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialStore>,
    pub directory: Arc<dyn UserDirectory>,
    pub sms: Arc<dyn SmsSender>,
    pub notifier: Arc<dyn Notifier>,
    pub geo: Arc<dyn GeoLocator>,
    pub captcha: Arc<dyn CaptchaVerifier>,
}

/// Outcome of a login call that did not error.
#[derive(Clone, Debug)]
pub enum LoginOutcome {
    /// Fully authenticated; the caller finalizes the session.
    Completed(CompletedAuth),
    /// Password accepted, second factor pending.
    ChallengeIssued(PendingChallenge),
}

#[derive(Clone, Debug)]
pub struct CompletedAuth {
    pub user_id: Uuid,
}

#[derive(Clone, Debug)]
pub struct PendingChallenge {
    pub token: String,
    pub method: ChallengeMethod,
    pub expires_at_ms: i64,
    /// Disclosed for SMS challenges so clients can hint at the target.
    pub masked_phone: Option<String>,
}

#[derive(Clone, Debug)]
pub struct VerifiedLogin {
    pub user_id: Uuid,
    pub backup_code_consumed: bool,
    pub backup_codes_remaining: Option<u32>,
}

#[derive(Clone, Copy, Debug)]
pub struct ResendReceipt {
    pub resends_remaining: u64,
}

pub struct AuthService {
    clock: Arc<dyn Clock>,
    config: AuthConfig,
    limiter: Arc<RateLimiter>,
    risk: RiskGate,
    challenges: ChallengeService,
    deps: Collaborators,
}

impl AuthService {
    /// Build a service over a process-local counter store.
    #[must_use]
    pub fn new(config: AuthConfig, deps: Collaborators, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(MemoryCounterStore::new(clock.clone()));
        Self::with_counter_store(config, deps, clock, store)
    }

    /// Build a service over an external counter store.
    #[must_use]
    pub fn with_counter_store(
        config: AuthConfig,
        deps: Collaborators,
        clock: Arc<dyn Clock>,
        store: Arc<dyn CounterStore>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(
            store,
            config.challenge_start_rule(),
            config.verification_rule(),
            config.resend_rule(),
            config.failed_logins_rule(),
        ));
        let risk = RiskGate::new(clock.clone(), limiter.clone(), config.risk_policy().clone());
        let challenges = ChallengeService::new(
            clock.clone(),
            config.challenge_policy(),
            config.backup_pepper(),
        );
        Self {
            clock,
            config,
            limiter,
            risk,
            challenges,
            deps,
        }
    }

    /// Authenticate with identifier + secret, optionally carrying a CAPTCHA
    /// token once the gate demands one.
    ///
    /// # Errors
    /// Every failure maps to a taxonomy member; unknown identifiers are
    /// indistinguishable from wrong secrets.
    pub async fn login(
        &self,
        identifier: &str,
        secret: &str,
        captcha_token: Option<&str>,
        ctx: &ClientContext,
    ) -> Result<LoginOutcome, AuthError> {
        let subject = normalize_subject(identifier);

        // Lockout wins before anything else; a locked subject consumes no
        // further delay or CAPTCHA state.
        if let Some(locked_until_ms) = self.risk.locked_until(&subject) {
            return Err(AuthError::AccountLocked { locked_until_ms });
        }

        if self.risk.captcha_needed(&subject) {
            let Some(token) = captcha_token else {
                self.risk
                    .record_rejection(&subject, ctx, FailureReason::CaptchaMissing);
                return Err(AuthError::CaptchaRequired);
            };
            let human = self.deps.captcha.verify(token).await.map_err(|err| {
                error!("CAPTCHA verification unavailable: {err}");
                AuthError::DownstreamUnavailable
            })?;
            if !human {
                self.risk
                    .record_rejection(&subject, ctx, FailureReason::CaptchaFailed);
                return Err(AuthError::CaptchaFailed);
            }
        }

        let verified = self
            .deps
            .credentials
            .verify(identifier, secret)
            .await
            .map_err(|err| {
                error!("Credential store unavailable: {err}");
                AuthError::DownstreamUnavailable
            })?;

        let Some(user_id) = verified else {
            let assessment = self.risk.assess_failure(
                &subject,
                None,
                ctx,
                FailureReason::InvalidCredentials,
            );
            self.settle_failure(None, &assessment).await;
            if let Some(locked_until_ms) = assessment.locked_until_ms {
                return Err(AuthError::AccountLocked { locked_until_ms });
            }
            return Err(AuthError::InvalidCredentials {
                captcha_required: assessment.captcha_required,
            });
        };

        let location = self.resolve_location(ctx).await;
        let report = self.risk.score_success(&subject, user_id, ctx, location.as_ref());
        if report.anomalous {
            let signals: Vec<&str> = report.signals.iter().map(|signal| signal.label()).collect();
            self.spawn_notify(
                user_id,
                SecurityEvent::AnomalousLogin,
                json!({ "score": report.score, "signals": signals }),
            );
        }

        let profile = self.profile_for(user_id).await?;
        if !profile.has_second_factor() {
            self.complete(&subject, user_id);
            return Ok(LoginOutcome::Completed(CompletedAuth { user_id }));
        }

        let ip_key = ctx.ip.clone().unwrap_or_else(|| "unknown".to_string());
        let initiation = self.limiter.record(RateAction::ChallengeStart, &ip_key);
        if !initiation.allowed {
            return Err(self.rate_limited(initiation));
        }

        let issued = self.challenges.issue(user_id, &subject, &profile)?;
        if let Some(code) = issued.dispatch_code.as_deref() {
            self.dispatch_sms(&profile, code).await?;
        }
        info!(%user_id, method = issued.method.as_str(), "Second-factor challenge issued");
        Ok(LoginOutcome::ChallengeIssued(PendingChallenge {
            token: issued.token,
            method: issued.method,
            expires_at_ms: issued.expires_at_ms,
            masked_phone: if issued.method == ChallengeMethod::Sms {
                profile.masked_phone.clone()
            } else {
                None
            },
        }))
    }

    /// Resolve a pending challenge with a method code or a backup code.
    pub async fn verify_challenge(
        &self,
        token: &str,
        code: &str,
        ctx: &ClientContext,
    ) -> Result<VerifiedLogin, AuthError> {
        let record = self.challenges.peek(token)?;

        if let Some(locked_until_ms) = self.risk.locked_until(&record.subject) {
            return Err(AuthError::AccountLocked { locked_until_ms });
        }

        // Quota gate runs before any cryptographic work.
        let user_key = record.user_id.to_string();
        let quota = self.limiter.check(RateAction::Verification, &user_key);
        if !quota.allowed {
            return Err(self.rate_limited(quota));
        }

        let profile = self.profile_for(record.user_id).await?;
        self.limiter.record(RateAction::Verification, &user_key);

        match self.challenges.verify(token, code, &profile) {
            Ok(success) => {
                self.complete(&success.subject, success.user_id);
                info!(user_id = %success.user_id, "Second factor verified");
                Ok(VerifiedLogin {
                    user_id: success.user_id,
                    backup_code_consumed: success.backup_code_consumed,
                    backup_codes_remaining: success.backup_codes_remaining,
                })
            }
            Err(failure) => {
                if let Some(counted) = failure.counted {
                    // A replayed one-time code is a strong abuse signal.
                    if failure.error == AuthError::CodeAlreadyUsed {
                        self.spawn_notify(
                            counted.user_id,
                            SecurityEvent::SuspiciousActivity,
                            json!({ "reason": "replayed_code" }),
                        );
                    }
                    let assessment = self.risk.assess_failure(
                        &counted.subject,
                        Some(counted.user_id),
                        ctx,
                        FailureReason::SecondFactor,
                    );
                    self.settle_failure(Some(counted.user_id), &assessment).await;
                    if let Some(locked_until_ms) = assessment.locked_until_ms {
                        return Err(AuthError::AccountLocked { locked_until_ms });
                    }
                }
                Err(failure.error)
            }
        }
    }

    /// Move a pending challenge to another enabled method.
    pub async fn switch_method(
        &self,
        token: &str,
        new_method: ChallengeMethod,
    ) -> Result<PendingChallenge, AuthError> {
        let record = self.challenges.peek(token)?;
        let profile = self.profile_for(record.user_id).await?;

        let issued = self.challenges.switch(token, new_method, &profile)?;
        if let Some(code) = issued.dispatch_code.as_deref() {
            self.dispatch_sms(&profile, code).await?;
        }
        info!(user_id = %record.user_id, method = new_method.as_str(), "Challenge method switched");
        Ok(PendingChallenge {
            token: issued.token,
            method: issued.method,
            expires_at_ms: issued.expires_at_ms,
            masked_phone: if issued.method == ChallengeMethod::Sms {
                profile.masked_phone.clone()
            } else {
                None
            },
        })
    }

    /// Issue a replacement SMS code for a pending SMS challenge.
    pub async fn resend_code(&self, token: &str) -> Result<ResendReceipt, AuthError> {
        let record = self.challenges.peek(token)?;
        if record.method != ChallengeMethod::Sms {
            return Err(AuthError::ChallengeInvalid);
        }

        let user_key = record.user_id.to_string();
        let quota = self.limiter.check(RateAction::Resend, &user_key);
        if !quota.allowed {
            return Err(self.rate_limited(quota));
        }

        let profile = self.profile_for(record.user_id).await?;
        let redispatch = self.challenges.resend(token)?;
        let decision = self.limiter.record(RateAction::Resend, &user_key);
        self.dispatch_sms(&profile, &redispatch.dispatch_code).await?;

        Ok(ResendReceipt {
            resends_remaining: decision.remaining,
        })
    }

    /// Pending-challenge status for clients.
    pub fn challenge_status(&self, token: &str) -> Result<ChallengeStatusView, AuthError> {
        self.challenges.status(token)
    }

    #[must_use]
    pub fn risk(&self) -> &RiskGate {
        &self.risk
    }

    async fn profile_for(&self, user_id: Uuid) -> Result<SecondFactorProfile, AuthError> {
        self.deps
            .directory
            .second_factor_profile(user_id)
            .await
            .map_err(|err| {
                error!("User directory unavailable: {err}");
                AuthError::DownstreamUnavailable
            })
    }

    /// Lockout notification plus the progressive delay. The sleep blocks
    /// only this request and holds no lock on shared state.
    async fn settle_failure(&self, user_id: Option<Uuid>, assessment: &FailureAssessment) {
        if assessment.newly_locked {
            if let (Some(user_id), Some(locked_until_ms)) = (user_id, assessment.locked_until_ms) {
                self.spawn_notify(
                    user_id,
                    SecurityEvent::AccountLocked,
                    json!({ "locked_until_ms": locked_until_ms }),
                );
            }
        }
        if assessment.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(assessment.delay_ms)).await;
        }
    }

    /// One jittered short-backoff retry for the non-idempotent send, then
    /// fail closed.
    async fn dispatch_sms(
        &self,
        profile: &SecondFactorProfile,
        code: &str,
    ) -> Result<(), AuthError> {
        let Some(phone) = profile.phone_number.as_deref() else {
            return Err(AuthError::NoSecondFactor);
        };
        for attempt in 1..=2u32 {
            match self.deps.sms.send(phone, code).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(attempt, "SMS dispatch failed: {err}");
                    if attempt == 1 {
                        let base = self.config.sms_retry_backoff_ms();
                        let factor = rand::thread_rng().gen_range(70..130);
                        tokio::time::sleep(Duration::from_millis(base * factor / 100)).await;
                    }
                }
            }
        }
        error!("SMS dispatch failed after retry");
        Err(AuthError::DownstreamUnavailable)
    }

    /// A successful terminal outcome: failure window, CAPTCHA, lockout
    /// tier, and the user's verification quota all reset.
    fn complete(&self, subject: &str, user_id: Uuid) {
        self.risk.on_authenticated(subject);
        self.limiter
            .reset(RateAction::Verification, &user_id.to_string());
    }

    fn rate_limited(&self, decision: RateDecision) -> AuthError {
        let now = self.clock.now_ms();
        AuthError::RateLimited {
            retry_after_ms: decision
                .resets_at_ms
                .map(|resets_at| resets_at.saturating_sub(now).max(0)),
        }
    }

    fn spawn_notify(&self, user_id: Uuid, event: SecurityEvent, context: serde_json::Value) {
        let notifier = self.deps.notifier.clone();
        tokio::spawn(async move {
            notifier.notify(user_id, event, context).await;
        });
    }

    async fn resolve_location(&self, ctx: &ClientContext) -> Option<GeoPoint> {
        let ip = ctx.ip.as_deref()?;
        match self.deps.geo.locate(ip).await {
            Ok(location) => location,
            Err(err) => {
                // Unknown location is never itself anomalous.
                warn!("Geolocation lookup failed: {err}");
                None
            }
        }
    }
}

/// Login subject key: the normalized identifier, so attempts against
/// unknown identifiers are tracked the same way as real ones.
#[must_use]
pub fn normalize_subject(identifier: &str) -> String {
    identifier.trim().to_lowercase()
}
