//! TOTP verification with replay protection.
//!
//! Codes are derived from a per-user base32 secret over 30-second steps; the
//! current step and its two neighbours are accepted. An accepted (user, step)
//! pair is remembered for as long as the step could still be accepted, so a
//! code cannot be replayed inside its own tolerance window.

use anyhow::{anyhow, Result};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashSet;
use std::sync::Mutex;
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use super::CodeOutcome;

const TOTP_DIGITS: usize = 6;
const TOTP_STEP_SECONDS: u64 = 30;
const TOTP_SKEW_STEPS: u64 = 1;

/// Stateful TOTP checker; the state is the used-step ledger.
pub struct TotpVerifier {
    used_steps: Mutex<HashSet<(Uuid, u64)>>,
}

impl Default for TotpVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl TotpVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self {
            used_steps: Mutex::new(HashSet::new()),
        }
    }

    /// Check `code` for `user` against `secret` at `now_ms`.
    ///
    /// # Errors
    /// Returns an error when the stored secret is not valid base32 or is too
    /// short for RFC 6238.
    pub fn verify(
        &self,
        user_id: Uuid,
        secret: &SecretString,
        code: &str,
        now_ms: i64,
    ) -> Result<CodeOutcome> {
        let secret_bytes = Secret::Encoded(secret.expose_secret().to_string())
            .to_bytes()
            .map_err(|err| anyhow!("invalid TOTP secret: {err:?}"))?;

        let totp = TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            u8::try_from(TOTP_SKEW_STEPS).unwrap_or(1),
            TOTP_STEP_SECONDS,
            secret_bytes,
        )
        .map_err(|err| anyhow!("TOTP init error: {err}"))?;

        let timestamp = u64::try_from(now_ms / 1000).unwrap_or(0);
        let current_step = timestamp / TOTP_STEP_SECONDS;

        let first = current_step.saturating_sub(TOTP_SKEW_STEPS);
        let mut matched_step = None;
        for step in first..=current_step + TOTP_SKEW_STEPS {
            let expected = totp.generate(step * TOTP_STEP_SECONDS);
            if bool::from(expected.as_bytes().ct_eq(code.as_bytes())) {
                matched_step = Some(step);
                // No break: the scan stays fixed-length regardless of where
                // the match lands.
            }
        }

        let Some(step) = matched_step else {
            return Ok(CodeOutcome::Mismatch);
        };

        if self.mark_used(user_id, step, current_step) {
            Ok(CodeOutcome::Verified)
        } else {
            Ok(CodeOutcome::AlreadyUsed)
        }
    }

    /// Record (user, step) as consumed; `false` means it already was.
    /// Entries older than the tolerance window are pruned on the way in.
    fn mark_used(&self, user_id: Uuid, step: u64, current_step: u64) -> bool {
        let mut used = self
            .used_steps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let horizon = current_step.saturating_sub(TOTP_SKEW_STEPS);
        used.retain(|(_, used_step)| *used_step >= horizon);
        used.insert((user_id, step))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SECRET_B32: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    fn code_at(now_ms: i64) -> String {
        let bytes = Secret::Encoded(SECRET_B32.to_string()).to_bytes().unwrap();
        let totp = TOTP::new(Algorithm::SHA1, TOTP_DIGITS, 1, TOTP_STEP_SECONDS, bytes).unwrap();
        totp.generate(u64::try_from(now_ms / 1000).unwrap())
    }

    fn secret() -> SecretString {
        SecretString::from(SECRET_B32.to_string())
    }

    #[test]
    fn current_step_code_is_accepted() {
        let verifier = TotpVerifier::new();
        let now_ms = 1_700_000_000_000;
        let outcome = verifier
            .verify(Uuid::new_v4(), &secret(), &code_at(now_ms), now_ms)
            .unwrap();
        assert_eq!(outcome, CodeOutcome::Verified);
    }

    #[test]
    fn adjacent_step_codes_are_accepted() {
        let verifier = TotpVerifier::new();
        let now_ms = 1_700_000_000_000;
        let user = Uuid::new_v4();
        let behind = verifier
            .verify(user, &secret(), &code_at(now_ms - 30_000), now_ms)
            .unwrap();
        assert_eq!(behind, CodeOutcome::Verified);
        let ahead = verifier
            .verify(user, &secret(), &code_at(now_ms + 30_000), now_ms)
            .unwrap();
        assert_eq!(ahead, CodeOutcome::Verified);
    }

    #[test]
    fn two_steps_away_is_a_mismatch() {
        let verifier = TotpVerifier::new();
        let now_ms = 1_700_000_000_000;
        let outcome = verifier
            .verify(Uuid::new_v4(), &secret(), &code_at(now_ms - 90_000), now_ms)
            .unwrap();
        assert_eq!(outcome, CodeOutcome::Mismatch);
    }

    #[test]
    fn accepted_code_cannot_be_replayed_within_tolerance() {
        let verifier = TotpVerifier::new();
        let now_ms = 1_700_000_000_000;
        let user = Uuid::new_v4();
        let code = code_at(now_ms);
        assert_eq!(
            verifier.verify(user, &secret(), &code, now_ms).unwrap(),
            CodeOutcome::Verified
        );
        // Same code, still nominally inside the ±1-step window.
        assert_eq!(
            verifier.verify(user, &secret(), &code, now_ms + 20_000).unwrap(),
            CodeOutcome::AlreadyUsed
        );
    }

    #[test]
    fn replay_ledger_is_per_user() {
        let verifier = TotpVerifier::new();
        let now_ms = 1_700_000_000_000;
        let code = code_at(now_ms);
        assert_eq!(
            verifier
                .verify(Uuid::new_v4(), &secret(), &code, now_ms)
                .unwrap(),
            CodeOutcome::Verified
        );
        assert_eq!(
            verifier
                .verify(Uuid::new_v4(), &secret(), &code, now_ms)
                .unwrap(),
            CodeOutcome::Verified
        );
    }

    #[test]
    fn garbage_secret_is_an_error() {
        let verifier = TotpVerifier::new();
        let bad = SecretString::from("not base32 at all!!".to_string());
        assert!(verifier
            .verify(Uuid::new_v4(), &bad, "000000", 1_700_000_000_000)
            .is_err());
    }
}
