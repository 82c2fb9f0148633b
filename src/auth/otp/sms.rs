//! SMS one-time codes.
//!
//! Codes are six cryptographically random digits. Only a salted SHA-256
//! digest is kept; the plaintext exists just long enough to hand to the SMS
//! dispatcher. Expiry is carried on the code itself and checked against the
//! clock at verification time.

use anyhow::{Context, Result};
use rand::{rngs::OsRng, Rng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::CodeOutcome;

const SMS_CODE_DIGITS: u32 = 6;
const SALT_LEN: usize = 16;

/// Hashed-at-rest SMS code bound to one challenge.
#[derive(Clone, Debug)]
pub struct SmsCode {
    salt: [u8; SALT_LEN],
    digest: [u8; 32],
    expires_at_ms: i64,
}

impl SmsCode {
    /// Generate a fresh code expiring at `expires_at_ms`.
    ///
    /// Returns the plaintext (for dispatch only) alongside the stored form.
    ///
    /// # Errors
    /// Returns an error when the system RNG fails.
    pub fn generate(expires_at_ms: i64) -> Result<(String, Self)> {
        let modulus = 10u32.pow(SMS_CODE_DIGITS);
        let value = OsRng.gen_range(0..modulus);
        let code = format!("{value:0width$}", width = SMS_CODE_DIGITS as usize);

        let mut salt = [0u8; SALT_LEN];
        OsRng
            .try_fill_bytes(&mut salt)
            .context("failed to generate SMS code salt")?;

        Ok((
            code.clone(),
            Self {
                salt,
                digest: salted_digest(&salt, &code),
                expires_at_ms,
            },
        ))
    }

    /// Check a submitted code at `now_ms`. Consumption is the caller's
    /// concern: the challenge transition owns that step so it stays atomic.
    #[must_use]
    pub fn verify(&self, submitted: &str, now_ms: i64) -> CodeOutcome {
        if now_ms >= self.expires_at_ms {
            return CodeOutcome::Expired;
        }
        let candidate = salted_digest(&self.salt, submitted);
        if bool::from(candidate.ct_eq(&self.digest)) {
            CodeOutcome::Verified
        } else {
            CodeOutcome::Mismatch
        }
    }

    #[must_use]
    pub fn expires_at_ms(&self) -> i64 {
        self.expires_at_ms
    }
}

fn salted_digest(salt: &[u8], code: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(code.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn generated_code_is_six_digits() {
        let (code, _stored) = SmsCode::generate(60_000).unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn correct_code_verifies_until_expiry() {
        let (code, stored) = SmsCode::generate(60_000).unwrap();
        assert_eq!(stored.verify(&code, 59_999), CodeOutcome::Verified);
        assert_eq!(stored.verify(&code, 60_000), CodeOutcome::Expired);
    }

    #[test]
    fn wrong_code_is_a_mismatch() {
        let (code, stored) = SmsCode::generate(60_000).unwrap();
        let wrong = if code == "000000" { "000001" } else { "000000" };
        assert_eq!(stored.verify(wrong, 0), CodeOutcome::Mismatch);
    }

    #[test]
    fn salts_differ_between_codes() {
        let (_a_code, a) = SmsCode::generate(60_000).unwrap();
        let (_b_code, b) = SmsCode::generate(60_000).unwrap();
        assert_ne!(a.salt, b.salt);
    }
}
