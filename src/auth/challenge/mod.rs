//! Second-factor challenge orchestration.
//!
//! A challenge is issued when the password check succeeds for a user with a
//! second factor, then resolved by code verification, retired by method
//! switching, or left to expire. Switch budget is tracked across the whole
//! lineage. The store lock arbitrates every transition, so concurrent
//! submissions of one valid code produce exactly one `Verified`.

pub mod store;

use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use super::clock::Clock;
use super::directory::{ChallengeMethod, SecondFactorProfile};
use super::error::AuthError;
use super::otp::{backup, BackupLedger, CodeOutcome, SmsCode, TotpVerifier};
use store::{hash_token, ChallengeRecord, ChallengeStatus, ChallengeStore, SupersedeError};

/// Challenge lifecycle tunables.
#[derive(Clone, Copy, Debug)]
pub struct ChallengePolicy {
    pub ttl_ms: i64,
    pub sms_code_ttl_ms: i64,
    pub max_attempts: u32,
    pub max_switches: u32,
}

impl Default for ChallengePolicy {
    fn default() -> Self {
        Self {
            ttl_ms: 10 * 60 * 1000,
            sms_code_ttl_ms: 5 * 60 * 1000,
            max_attempts: 5,
            max_switches: 3,
        }
    }
}

/// A freshly issued (or re-issued) challenge.
#[derive(Clone, Debug)]
pub struct IssuedChallenge {
    pub token: String,
    pub challenge_id: Uuid,
    pub method: ChallengeMethod,
    pub expires_at_ms: i64,
    /// Plaintext SMS code destined for the dispatcher, dropped after send.
    pub dispatch_code: Option<String>,
}

/// A verified challenge, ready for session finalization by the caller.
#[derive(Clone, Debug)]
pub struct ChallengeSuccess {
    pub user_id: Uuid,
    pub subject: String,
    pub method: ChallengeMethod,
    pub backup_code_consumed: bool,
    pub backup_codes_remaining: Option<u32>,
}

/// Who to charge a failed verification to.
#[derive(Clone, Debug)]
pub struct AttemptContext {
    pub user_id: Uuid,
    pub subject: String,
}

/// A failed verification, with lockout attribution when the failure was an
/// actual wrong/replayed code rather than a dead challenge.
#[derive(Clone, Debug)]
pub struct ChallengeFailure {
    pub error: AuthError,
    pub counted: Option<AttemptContext>,
}

impl ChallengeFailure {
    fn plain(error: AuthError) -> Self {
        Self {
            error,
            counted: None,
        }
    }

    fn counted(error: AuthError, record: &ChallengeRecord) -> Self {
        Self {
            error,
            counted: Some(AttemptContext {
                user_id: record.user_id,
                subject: record.subject.clone(),
            }),
        }
    }
}

/// A replacement SMS code for an existing challenge.
#[derive(Clone, Debug)]
pub struct SmsRedispatch {
    pub user_id: Uuid,
    pub dispatch_code: String,
}

/// Client-visible view of a pending challenge.
#[derive(Clone, Debug)]
pub struct ChallengeStatusView {
    pub method: ChallengeMethod,
    pub expires_at_ms: i64,
    pub attempts_remaining: u32,
}

pub struct ChallengeService {
    clock: Arc<dyn Clock>,
    store: ChallengeStore,
    totp: TotpVerifier,
    backup: BackupLedger,
    policy: ChallengePolicy,
    backup_pepper: Option<Arc<[u8]>>,
}

impl ChallengeService {
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        policy: ChallengePolicy,
        backup_pepper: Option<Arc<[u8]>>,
    ) -> Self {
        Self {
            store: ChallengeStore::new(clock.clone()),
            clock,
            totp: TotpVerifier::new(),
            backup: BackupLedger::new(),
            policy,
            backup_pepper,
        }
    }

    /// Issue a challenge bound to the user's preferred (or only) method.
    /// Any still-pending challenge for the user is retired first.
    pub fn issue(
        &self,
        user_id: Uuid,
        subject: &str,
        profile: &SecondFactorProfile,
    ) -> Result<IssuedChallenge, AuthError> {
        let method = profile.initial_method().ok_or(AuthError::NoSecondFactor)?;
        self.store.expire_pending_for_user(user_id);

        let (token, record, dispatch_code) = self.build(user_id, subject, method, profile, 0)?;
        let issued = IssuedChallenge {
            challenge_id: record.id,
            method,
            expires_at_ms: record.expires_at_ms,
            dispatch_code,
            token: token.clone(),
        };
        self.store.insert(&hash_token(&token), record);
        Ok(issued)
    }

    /// Verify a submitted code against the challenge behind `token`.
    ///
    /// Backup codes are recognized by shape and may substitute for the
    /// bound method's code.
    pub fn verify(
        &self,
        token: &str,
        code: &str,
        profile: &SecondFactorProfile,
    ) -> Result<ChallengeSuccess, ChallengeFailure> {
        let hash = hash_token(token);
        let now = self.clock.now_ms();

        // Pre-flight and attempt accounting happen in one guarded step; the
        // attempt is only counted once we are committed to checking a code.
        let gate = self.store.update(&hash, |record| {
            if record.status != ChallengeStatus::Pending {
                return Err(AuthError::ChallengeInvalid);
            }
            if record.is_expired(now) {
                record.status = ChallengeStatus::Expired;
                return Err(AuthError::ChallengeExpired);
            }
            if record.attempts_used >= self.policy.max_attempts {
                record.status = ChallengeStatus::Exhausted;
                return Err(AuthError::ChallengeExhausted);
            }
            record.attempts_used += 1;
            Ok(record.clone())
        });
        let snapshot = match gate {
            None | Some(Err(AuthError::ChallengeInvalid)) => {
                return Err(ChallengeFailure::plain(AuthError::ChallengeInvalid))
            }
            Some(Err(error)) => return Err(ChallengeFailure::plain(error)),
            Some(Ok(snapshot)) => snapshot,
        };
        let attempts_remaining = self.policy.max_attempts - snapshot.attempts_used;

        if backup::looks_like_backup_code(code) {
            return self.verify_backup(&hash, &snapshot, code, profile, attempts_remaining, now);
        }

        // The expensive code check runs outside the store lock; the success
        // transition below re-validates under it.
        let outcome = match snapshot.method {
            ChallengeMethod::Totp => {
                let Some(secret) = profile.totp_secret.as_ref() else {
                    error!(user_id = %snapshot.user_id, "TOTP challenge without a stored secret");
                    return Err(ChallengeFailure::plain(AuthError::DownstreamUnavailable));
                };
                match self.totp.verify(snapshot.user_id, secret, code, now) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        error!(user_id = %snapshot.user_id, "TOTP verification error: {err}");
                        return Err(ChallengeFailure::plain(AuthError::DownstreamUnavailable));
                    }
                }
            }
            ChallengeMethod::Sms => snapshot
                .sms_code
                .as_ref()
                .map_or(CodeOutcome::Mismatch, |sms| sms.verify(code, now)),
        };

        match outcome {
            CodeOutcome::Verified => {
                self.finalize(&hash, now).map_err(ChallengeFailure::plain)?;
                Ok(ChallengeSuccess {
                    user_id: snapshot.user_id,
                    subject: snapshot.subject.clone(),
                    method: snapshot.method,
                    backup_code_consumed: false,
                    backup_codes_remaining: None,
                })
            }
            CodeOutcome::Mismatch => Err(ChallengeFailure::counted(
                AuthError::CodeMismatch { attempts_remaining },
                &snapshot,
            )),
            CodeOutcome::AlreadyUsed => {
                Err(ChallengeFailure::counted(AuthError::CodeAlreadyUsed, &snapshot))
            }
            // An expired code is not a wrong guess; the client resends.
            CodeOutcome::Expired => Err(ChallengeFailure::plain(AuthError::ChallengeExpired)),
            CodeOutcome::Exhausted => Err(ChallengeFailure::plain(AuthError::ChallengeExhausted)),
        }
    }

    /// Switch a pending challenge to another enabled method. The current
    /// challenge is retired atomically and linked to its replacement.
    pub fn switch(
        &self,
        token: &str,
        new_method: ChallengeMethod,
        profile: &SecondFactorProfile,
    ) -> Result<IssuedChallenge, AuthError> {
        let hash = hash_token(token);
        let now = self.clock.now_ms();

        let snapshot = self.pending_snapshot(&hash, now)?;
        if profile.methods.len() < 2 || !profile.supports(new_method) {
            return Err(AuthError::NoSecondFactor);
        }
        if new_method == snapshot.method {
            return Err(AuthError::ChallengeInvalid);
        }
        if snapshot.switches_used >= self.policy.max_switches {
            return Err(AuthError::ChallengeExhausted);
        }

        let (token_new, record, dispatch_code) = self.build(
            snapshot.user_id,
            &snapshot.subject,
            new_method,
            profile,
            snapshot.switches_used + 1,
        )?;
        let issued = IssuedChallenge {
            challenge_id: record.id,
            method: new_method,
            expires_at_ms: record.expires_at_ms,
            dispatch_code,
            token: token_new.clone(),
        };

        match self.store.supersede(&hash, &hash_token(&token_new), record) {
            Ok(()) => Ok(issued),
            Err(SupersedeError::Expired) => Err(AuthError::ChallengeExpired),
            Err(SupersedeError::Missing | SupersedeError::NotPending) => {
                Err(AuthError::ChallengeInvalid)
            }
        }
    }

    /// Replace the SMS code on a pending SMS challenge. The prior code is
    /// invalidated even inside its own expiry; the challenge's expiry and
    /// attempt budget are untouched.
    pub fn resend(&self, token: &str) -> Result<SmsRedispatch, AuthError> {
        let hash = hash_token(token);
        let now = self.clock.now_ms();

        let snapshot = self.pending_snapshot(&hash, now)?;
        if snapshot.method != ChallengeMethod::Sms {
            return Err(AuthError::ChallengeInvalid);
        }

        let (code, stored) = SmsCode::generate(now + self.policy.sms_code_ttl_ms)
            .map_err(|err| {
                error!("Failed to generate SMS code: {err}");
                AuthError::DownstreamUnavailable
            })?;

        let swapped = self.store.update(&hash, |record| {
            if record.status != ChallengeStatus::Pending {
                return Err(AuthError::ChallengeInvalid);
            }
            if record.is_expired(now) {
                record.status = ChallengeStatus::Expired;
                return Err(AuthError::ChallengeExpired);
            }
            record.sms_code = Some(stored.clone());
            Ok(())
        });
        match swapped {
            Some(Ok(())) => Ok(SmsRedispatch {
                user_id: snapshot.user_id,
                dispatch_code: code,
            }),
            Some(Err(error)) => Err(error),
            None => Err(AuthError::ChallengeInvalid),
        }
    }

    /// Pending-challenge view for the status endpoint.
    pub fn status(&self, token: &str) -> Result<ChallengeStatusView, AuthError> {
        let now = self.clock.now_ms();
        let snapshot = self.pending_snapshot(&hash_token(token), now)?;
        Ok(ChallengeStatusView {
            method: snapshot.method,
            expires_at_ms: snapshot.expires_at_ms,
            attempts_remaining: self
                .policy
                .max_attempts
                .saturating_sub(snapshot.attempts_used),
        })
    }

    /// Lightweight lookup used by callers for fail-fast quota checks.
    pub fn peek(&self, token: &str) -> Result<ChallengeRecord, AuthError> {
        self.pending_snapshot(&hash_token(token), self.clock.now_ms())
    }

    fn pending_snapshot(&self, hash: &str, now: i64) -> Result<ChallengeRecord, AuthError> {
        let Some(record) = self.store.get(hash) else {
            return Err(AuthError::ChallengeInvalid);
        };
        if record.status != ChallengeStatus::Pending {
            return Err(AuthError::ChallengeInvalid);
        }
        if record.is_expired(now) {
            self.store.update(hash, |record| {
                if record.status == ChallengeStatus::Pending {
                    record.status = ChallengeStatus::Expired;
                }
            });
            return Err(AuthError::ChallengeExpired);
        }
        Ok(record)
    }

    fn verify_backup(
        &self,
        hash: &str,
        snapshot: &ChallengeRecord,
        code: &str,
        profile: &SecondFactorProfile,
        attempts_remaining: u32,
        now: i64,
    ) -> Result<ChallengeSuccess, ChallengeFailure> {
        let Some(pepper) = self.backup_pepper.as_deref() else {
            error!("Backup code submitted but no pepper is configured");
            return Err(ChallengeFailure::plain(AuthError::DownstreamUnavailable));
        };

        let (outcome, matched_hash) = self.backup.check(
            snapshot.user_id,
            code,
            &profile.backup_code_hashes,
            pepper,
        );
        match outcome {
            CodeOutcome::Verified => {
                let Some(matched_hash) = matched_hash else {
                    return Err(ChallengeFailure::plain(AuthError::DownstreamUnavailable));
                };
                // The challenge transition decides the race; only the winner
                // burns the code.
                self.finalize(hash, now).map_err(ChallengeFailure::plain)?;
                if !self.backup.consume(snapshot.user_id, &matched_hash) {
                    return Err(ChallengeFailure::plain(AuthError::CodeAlreadyUsed));
                }
                let remaining = self
                    .backup
                    .remaining(snapshot.user_id, profile.backup_code_hashes.len());
                Ok(ChallengeSuccess {
                    user_id: snapshot.user_id,
                    subject: snapshot.subject.clone(),
                    method: snapshot.method,
                    backup_code_consumed: true,
                    backup_codes_remaining: Some(remaining),
                })
            }
            CodeOutcome::Mismatch => Err(ChallengeFailure::counted(
                AuthError::CodeMismatch { attempts_remaining },
                snapshot,
            )),
            CodeOutcome::AlreadyUsed => {
                Err(ChallengeFailure::counted(AuthError::CodeAlreadyUsed, snapshot))
            }
            CodeOutcome::Exhausted => {
                Err(ChallengeFailure::plain(AuthError::ChallengeExhausted))
            }
            CodeOutcome::Expired => Err(ChallengeFailure::plain(AuthError::ChallengeExpired)),
        }
    }

    /// The single atomic success transition: pending → verified, SMS code
    /// consumed with it. Losers observe the terminal state.
    fn finalize(&self, hash: &str, now: i64) -> Result<(), AuthError> {
        let result = self.store.update(hash, |record| {
            if record.status == ChallengeStatus::Verified {
                return Err(AuthError::CodeAlreadyUsed);
            }
            if record.status != ChallengeStatus::Pending {
                return Err(AuthError::ChallengeInvalid);
            }
            if record.is_expired(now) {
                record.status = ChallengeStatus::Expired;
                return Err(AuthError::ChallengeExpired);
            }
            record.status = ChallengeStatus::Verified;
            record.sms_code = None;
            Ok(())
        });
        match result {
            Some(result) => result,
            None => Err(AuthError::ChallengeInvalid),
        }
    }

    fn build(
        &self,
        user_id: Uuid,
        subject: &str,
        method: ChallengeMethod,
        profile: &SecondFactorProfile,
        switches_used: u32,
    ) -> Result<(String, ChallengeRecord, Option<String>), AuthError> {
        match method {
            ChallengeMethod::Totp if profile.totp_secret.is_none() => {
                return Err(AuthError::NoSecondFactor)
            }
            ChallengeMethod::Sms if profile.phone_number.is_none() => {
                return Err(AuthError::NoSecondFactor)
            }
            _ => {}
        }

        let token = store::generate_token().map_err(|err| {
            error!("Failed to generate challenge token: {err}");
            AuthError::DownstreamUnavailable
        })?;
        let now = self.clock.now_ms();

        let (sms_code, dispatch_code) = if method == ChallengeMethod::Sms {
            let (code, stored) = SmsCode::generate(now + self.policy.sms_code_ttl_ms)
                .map_err(|err| {
                    error!("Failed to generate SMS code: {err}");
                    AuthError::DownstreamUnavailable
                })?;
            (Some(stored), Some(code))
        } else {
            (None, None)
        };

        let record = ChallengeRecord {
            id: Uuid::new_v4(),
            user_id,
            subject: subject.to_string(),
            method,
            status: ChallengeStatus::Pending,
            created_at_ms: now,
            expires_at_ms: now + self.policy.ttl_ms,
            attempts_used: 0,
            switches_used,
            superseded_by: None,
            sms_code,
        };
        Ok((token, record, dispatch_code))
    }
}
