//! One-time code generation and verification.
//!
//! Three code families share the same outcome vocabulary: TOTP (shared
//! secret, 30-second steps, ±1 step tolerance, replay-protected), SMS OTP
//! (random 6 digits, salted hash at rest, 5-minute expiry), and backup codes
//! (pre-generated, Argon2id-hashed, single use). All comparisons are
//! constant time.

pub(crate) mod backup;
pub(crate) mod sms;
pub(crate) mod totp;

pub use backup::{BackupCodeBatch, BackupLedger};
pub use sms::SmsCode;
pub use totp::TotpVerifier;

/// Result of checking a submitted code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeOutcome {
    Verified,
    /// The code's own validity window has elapsed.
    Expired,
    Mismatch,
    /// The code was valid but has already been consumed.
    AlreadyUsed,
    /// No usable codes remain (backup codes depleted).
    Exhausted,
}
