//! Backup codes: pre-generated single-use stand-ins for a second factor.
//!
//! Codes are twelve characters from an ambiguity-free alphabet, displayed in
//! dash-grouped form, and Argon2id-hashed with a server-side pepper. The
//! directory owns the stored hashes; the ledger here tracks which of them a
//! user has burned so a code can never be accepted twice.

use anyhow::{anyhow, Context, Result};
use argon2::{password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rand::{rngs::OsRng, RngCore};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use super::CodeOutcome;

const BACKUP_CODE_COUNT: usize = 10;
const BACKUP_CODE_LEN: usize = 12;
const BACKUP_CODE_GROUP_SIZE: usize = 4;
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// A freshly generated batch of backup codes (plaintext + hashes).
///
/// The plaintext leaves the process exactly once, toward the user; callers
/// persist only `code_hashes`.
#[derive(Debug)]
pub struct BackupCodeBatch {
    pub codes: Vec<String>,
    pub code_hashes: Vec<String>,
}

impl BackupCodeBatch {
    /// Generate a new batch hashed with `pepper`.
    ///
    /// # Errors
    /// Returns an error when the RNG or Argon2id hashing fails.
    pub fn generate(pepper: &[u8]) -> Result<Self> {
        let mut codes = Vec::with_capacity(BACKUP_CODE_COUNT);
        let mut code_hashes = Vec::with_capacity(BACKUP_CODE_COUNT);
        for _ in 0..BACKUP_CODE_COUNT {
            let code = generate_code()?;
            let hash = hash_backup_code(&code, pepper)?;
            codes.push(code);
            code_hashes.push(hash);
        }
        Ok(Self { codes, code_hashes })
    }
}

/// Does the submitted string even look like a backup code?
///
/// Used to route a challenge submission to the backup path: dynamic codes
/// are six digits, backup codes are twelve letters/digits with optional
/// dashes, so the shapes never collide.
#[must_use]
pub fn looks_like_backup_code(input: &str) -> bool {
    normalize_backup_code(input).is_ok()
}

/// Normalize a submitted backup code for verification.
pub fn normalize_backup_code(input: &str) -> Result<String> {
    let normalized: String = input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect();

    if normalized.len() != BACKUP_CODE_LEN {
        return Err(anyhow!("invalid backup code length"));
    }

    if !normalized
        .as_bytes()
        .iter()
        .all(|ch| BACKUP_CODE_ALPHABET.contains(ch))
    {
        return Err(anyhow!("invalid backup code characters"));
    }

    Ok(normalized)
}

/// Format a normalized backup code for display.
pub fn format_backup_code(normalized: &str) -> Result<String> {
    if normalized.len() != BACKUP_CODE_LEN {
        return Err(anyhow!("invalid backup code length"));
    }
    let mut out = String::with_capacity(BACKUP_CODE_LEN + 2);
    for (idx, chunk) in normalized
        .as_bytes()
        .chunks(BACKUP_CODE_GROUP_SIZE)
        .enumerate()
    {
        if idx > 0 {
            out.push('-');
        }
        out.push_str(std::str::from_utf8(chunk).context("invalid backup code chunk")?);
    }
    Ok(out)
}

/// Verify a backup code against one stored hash.
pub fn verify_backup_code(code: &str, stored_hash: &str, pepper: &[u8]) -> Result<bool> {
    let normalized = normalize_backup_code(code)?;
    let parsed =
        PasswordHash::new(stored_hash).map_err(|_| anyhow!("invalid backup code hash"))?;
    Ok(peppered_argon2(pepper)?
        .verify_password(normalized.as_bytes(), &parsed)
        .is_ok())
}

/// Per-user record of consumed backup-code hashes.
///
/// Consumption happens here in one guarded step: the first submission of a
/// valid code wins, a concurrent duplicate observes `AlreadyUsed`.
#[derive(Default)]
pub struct BackupLedger {
    consumed: Mutex<HashMap<Uuid, HashSet<String>>>,
}

impl BackupLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Match `code` against the user's stored hashes without consuming.
    ///
    /// Returns the matched hash on `Verified` so the caller can consume it
    /// once its own success transition has won.
    pub fn check(
        &self,
        user_id: Uuid,
        code: &str,
        stored_hashes: &[String],
        pepper: &[u8],
    ) -> (CodeOutcome, Option<String>) {
        let consumed = self
            .consumed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let used = consumed.get(&user_id);
        let used_len = used.map_or(0, HashSet::len);

        if stored_hashes.is_empty() || used_len >= stored_hashes.len() {
            return (CodeOutcome::Exhausted, None);
        }

        for hash in stored_hashes {
            if !verify_backup_code(code, hash, pepper).unwrap_or(false) {
                continue;
            }
            if used.is_some_and(|set| set.contains(hash)) {
                return (CodeOutcome::AlreadyUsed, None);
            }
            return (CodeOutcome::Verified, Some(hash.clone()));
        }

        (CodeOutcome::Mismatch, None)
    }

    /// Consume a matched hash; `false` means a concurrent submission beat
    /// this one to it.
    pub fn consume(&self, user_id: Uuid, hash: &str) -> bool {
        self.consumed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(user_id)
            .or_default()
            .insert(hash.to_string())
    }

    /// Codes the user has left out of `total` issued.
    #[must_use]
    pub fn remaining(&self, user_id: Uuid, total: usize) -> u32 {
        let consumed = self
            .consumed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let used = consumed.get(&user_id).map_or(0, HashSet::len);
        u32::try_from(total.saturating_sub(used)).unwrap_or(u32::MAX)
    }
}

fn generate_code() -> Result<String> {
    let mut raw = [0u8; BACKUP_CODE_LEN];
    OsRng
        .try_fill_bytes(&mut raw)
        .context("failed to generate backup code")?;
    let mut normalized = String::with_capacity(BACKUP_CODE_LEN);
    for byte in raw {
        let idx = usize::from(byte) % BACKUP_CODE_ALPHABET.len();
        if let Some(&char_byte) = BACKUP_CODE_ALPHABET.get(idx) {
            normalized.push(char_byte as char);
        }
    }
    format_backup_code(&normalized)
}

fn hash_backup_code(code: &str, pepper: &[u8]) -> Result<String> {
    let normalized = normalize_backup_code(code)?;
    let salt = SaltString::generate(&mut OsRng);
    let hash = peppered_argon2(pepper)?
        .hash_password(normalized.as_bytes(), &salt)
        .map_err(|_| anyhow!("failed to hash backup code"))?
        .to_string();
    Ok(hash)
}

fn peppered_argon2(pepper: &[u8]) -> Result<Argon2<'_>> {
    Argon2::new_with_secret(
        pepper,
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::default(),
    )
    .map_err(|_| anyhow!("failed to initialize Argon2id"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    const PEPPER: &[u8] = b"pepper";

    #[test]
    fn normalize_trims_and_uppercases() {
        let normalized = normalize_backup_code("abcd-efgh-jklm").unwrap();
        assert_eq!(normalized, "ABCDEFGHJKLM");
    }

    #[test]
    fn format_groups_with_dashes() {
        let formatted = format_backup_code("ABCDEFGHJKLM").unwrap();
        assert_eq!(formatted, "ABCD-EFGH-JKLM");
    }

    #[test]
    fn shape_detection_separates_backup_from_dynamic_codes() {
        assert!(looks_like_backup_code("ABCD-EFGH-JKLM"));
        assert!(looks_like_backup_code("abcdefghjklm"));
        assert!(!looks_like_backup_code("123456"));
        assert!(!looks_like_backup_code("ABCD-EFGH"));
    }

    #[test]
    fn hash_and_verify_round_trip() {
        let batch = BackupCodeBatch::generate(PEPPER).unwrap();
        let code = batch.codes.first().unwrap();
        let hash = batch.code_hashes.first().unwrap();
        assert!(verify_backup_code(code, hash, PEPPER).unwrap());
        assert!(!verify_backup_code("ABCD-EFGH-9999", hash, PEPPER).unwrap());
    }

    #[test]
    fn consumed_code_reports_already_used() {
        let batch = BackupCodeBatch::generate(PEPPER).unwrap();
        let ledger = BackupLedger::new();
        let user = Uuid::new_v4();

        let (first, matched) = ledger.check(user, &batch.codes[0], &batch.code_hashes, PEPPER);
        assert_eq!(first, CodeOutcome::Verified);
        let hash = matched.unwrap();
        assert!(ledger.consume(user, &hash));
        assert!(!ledger.consume(user, &hash));

        let (second, _) = ledger.check(user, &batch.codes[0], &batch.code_hashes, PEPPER);
        assert_eq!(second, CodeOutcome::AlreadyUsed);
    }

    #[test]
    fn check_alone_does_not_consume() {
        let batch = BackupCodeBatch::generate(PEPPER).unwrap();
        let ledger = BackupLedger::new();
        let user = Uuid::new_v4();

        for _ in 0..2 {
            let (outcome, _) = ledger.check(user, &batch.codes[0], &batch.code_hashes, PEPPER);
            assert_eq!(outcome, CodeOutcome::Verified);
        }
        assert_eq!(ledger.remaining(user, BACKUP_CODE_COUNT), 10);
    }

    #[test]
    fn remaining_decreases_by_one_per_use() {
        let batch = BackupCodeBatch::generate(PEPPER).unwrap();
        let ledger = BackupLedger::new();
        let user = Uuid::new_v4();

        for (idx, code) in batch.codes.iter().take(3).enumerate() {
            let (outcome, matched) = ledger.check(user, code, &batch.code_hashes, PEPPER);
            assert_eq!(outcome, CodeOutcome::Verified);
            assert!(ledger.consume(user, &matched.unwrap()));
            assert_eq!(
                ledger.remaining(user, BACKUP_CODE_COUNT) as usize,
                BACKUP_CODE_COUNT - idx - 1
            );
        }
        assert_eq!(ledger.remaining(user, BACKUP_CODE_COUNT), 7);
    }

    #[test]
    fn depleted_ledger_reports_exhausted() {
        let batch = BackupCodeBatch::generate(PEPPER).unwrap();
        let ledger = BackupLedger::new();
        let user = Uuid::new_v4();

        for code in &batch.codes {
            let (outcome, matched) = ledger.check(user, code, &batch.code_hashes, PEPPER);
            assert_eq!(outcome, CodeOutcome::Verified);
            ledger.consume(user, &matched.unwrap());
        }

        let (outcome, matched) = ledger.check(user, &batch.codes[0], &batch.code_hashes, PEPPER);
        assert_eq!(outcome, CodeOutcome::Exhausted);
        assert!(matched.is_none());
    }

    #[test]
    fn wrong_code_is_a_mismatch() {
        let batch = BackupCodeBatch::generate(PEPPER).unwrap();
        let ledger = BackupLedger::new();
        let user = Uuid::new_v4();

        let (outcome, matched) = ledger.check(user, "ZZZZ-ZZZZ-ZZZZ", &batch.code_hashes, PEPPER);
        assert_eq!(outcome, CodeOutcome::Mismatch);
        assert!(matched.is_none());
        assert_eq!(ledger.remaining(user, BACKUP_CODE_COUNT), 10);
    }
}
