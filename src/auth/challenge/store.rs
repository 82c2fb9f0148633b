//! In-memory challenge storage.
//!
//! Challenges are keyed by the SHA-256 of their opaque token; the raw token
//! never rests anywhere server-side. Expiry is lazy: stale entries are
//! pruned opportunistically on insert and judged against the clock on every
//! read. All state transitions run under the store lock, which is what makes
//! verification races resolve to exactly one winner.

use anyhow::{Context, Result};
use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::auth::clock::Clock;
use crate::auth::directory::ChallengeMethod;
use crate::auth::otp::SmsCode;

/// How long a terminal/expired record lingers for audit-friendly reads
/// before pruning reclaims it.
const RETENTION_MS: i64 = 60 * 60 * 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Verified,
    Expired,
    Exhausted,
}

impl ChallengeStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// One second-factor challenge. `switches_used` counts the whole lineage,
/// not this hop.
#[derive(Clone, Debug)]
pub struct ChallengeRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Login subject the challenge belongs to, for failure accounting.
    pub subject: String,
    pub method: ChallengeMethod,
    pub status: ChallengeStatus,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub attempts_used: u32,
    pub switches_used: u32,
    pub superseded_by: Option<Uuid>,
    pub sms_code: Option<SmsCode>,
}

impl ChallengeRecord {
    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Create a fresh opaque challenge token.
///
/// The raw value goes to the client once; storage only ever sees its hash.
pub fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate challenge token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a challenge token for storage and lookup.
#[must_use]
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
}

pub struct ChallengeStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, ChallengeRecord>>,
}

impl ChallengeStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ChallengeRecord>> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Insert a record, pruning entries past retention on the way.
    pub fn insert(&self, token_hash: &str, record: ChallengeRecord) {
        let now = self.clock.now_ms();
        let mut entries = self.lock();
        entries.retain(|_, entry| entry.expires_at_ms.saturating_add(RETENTION_MS) > now);
        entries.insert(token_hash.to_string(), record);
    }

    /// Snapshot of a record by token hash.
    #[must_use]
    pub fn get(&self, token_hash: &str) -> Option<ChallengeRecord> {
        self.lock().get(token_hash).cloned()
    }

    /// Run `apply` on the record under the store lock.
    pub fn update<R>(
        &self,
        token_hash: &str,
        apply: impl FnOnce(&mut ChallengeRecord) -> R,
    ) -> Option<R> {
        self.lock().get_mut(token_hash).map(apply)
    }

    /// Expire every still-pending challenge for a user. Called at issuance
    /// so at most one non-terminal challenge exists per login session.
    pub fn expire_pending_for_user(&self, user_id: Uuid) {
        let mut entries = self.lock();
        for entry in entries.values_mut() {
            if entry.user_id == user_id && entry.status == ChallengeStatus::Pending {
                entry.status = ChallengeStatus::Expired;
            }
        }
    }

    /// Atomically retire `old_hash` in favour of a new challenge record.
    ///
    /// Fails when the old record is gone or no longer pending; the new
    /// record is only inserted when the supersede succeeds.
    pub fn supersede(
        &self,
        old_hash: &str,
        new_hash: &str,
        new_record: ChallengeRecord,
    ) -> std::result::Result<(), SupersedeError> {
        let now = self.clock.now_ms();
        let mut entries = self.lock();

        let old = entries.get_mut(old_hash).ok_or(SupersedeError::Missing)?;
        if old.status != ChallengeStatus::Pending {
            return Err(SupersedeError::NotPending);
        }
        if old.is_expired(now) {
            old.status = ChallengeStatus::Expired;
            return Err(SupersedeError::Expired);
        }
        old.status = ChallengeStatus::Expired;
        old.superseded_by = Some(new_record.id);

        entries.insert(new_hash.to_string(), new_record);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupersedeError {
    Missing,
    NotPending,
    Expired,
}
