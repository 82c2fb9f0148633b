//! Append-only login history and per-user known profiles.
//!
//! Attempts are keyed by login subject (the normalized identifier) so that
//! attempts against unknown identifiers are recorded too. Known profiles are
//! keyed by user id and only ever grow; anomaly scoring compares a fresh
//! attempt against them before they absorb it.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use uuid::Uuid;

use super::anomaly::AnomalySignal;
use crate::auth::directory::{ClientContext, GeoPoint};

const MAX_ATTEMPTS_PER_SUBJECT: usize = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// Why an attempt failed; audit-internal, never exposed to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    InvalidCredentials,
    SecondFactor,
    CaptchaMissing,
    CaptchaFailed,
}

/// One completed login attempt. Written exactly once, never mutated.
#[derive(Clone, Debug)]
pub struct AttemptRecord {
    pub subject: String,
    pub user_id: Option<Uuid>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
    pub outcome: AttemptOutcome,
    pub failure_reason: Option<FailureReason>,
    pub anomalous: bool,
    pub anomaly_signals: Vec<AnomalySignal>,
    pub location: Option<GeoPoint>,
    pub at_ms: i64,
}

/// What the system has previously seen for a user.
#[derive(Clone, Debug, Default)]
pub struct KnownProfile {
    pub countries: HashSet<String>,
    /// `country|region|city` composites for region/city-level comparison.
    pub region_keys: HashSet<String>,
    pub devices: HashSet<String>,
    pub last_seen: Option<(GeoPoint, i64)>,
}

impl KnownProfile {
    /// A profile with no observations yet; scoring treats it as baseline.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.countries.is_empty() && self.devices.is_empty() && self.last_seen.is_none()
    }
}

pub(crate) fn region_key(location: &GeoPoint) -> String {
    format!(
        "{}|{}|{}",
        location.country,
        location.region.as_deref().unwrap_or(""),
        location.city.as_deref().unwrap_or("")
    )
}

/// In-memory attempt log + profile store.
#[derive(Default)]
pub struct HistoryStore {
    attempts: Mutex<HashMap<String, Vec<AttemptRecord>>>,
    profiles: Mutex<HashMap<Uuid, KnownProfile>>,
}

impl HistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one attempt record, dropping the oldest past the cap.
    pub fn append(&self, record: AttemptRecord) {
        let mut attempts = self
            .attempts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let log = attempts.entry(record.subject.clone()).or_default();
        if log.len() >= MAX_ATTEMPTS_PER_SUBJECT {
            let overflow = log.len() - MAX_ATTEMPTS_PER_SUBJECT + 1;
            log.drain(..overflow);
        }
        log.push(record);
    }

    #[must_use]
    pub fn attempts_for(&self, subject: &str) -> Vec<AttemptRecord> {
        self.attempts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(subject)
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of the user's known profile.
    #[must_use]
    pub fn profile(&self, user_id: Uuid) -> KnownProfile {
        self.profiles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Fold a successful attempt's signals into the known profile.
    /// Anomalous logins extend the profile too; only the flag differs.
    pub fn absorb(
        &self,
        user_id: Uuid,
        ctx: &ClientContext,
        location: Option<&GeoPoint>,
        at_ms: i64,
    ) {
        let mut profiles = self
            .profiles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let profile = profiles.entry(user_id).or_default();
        if let Some(location) = location {
            profile.countries.insert(location.country.clone());
            profile.region_keys.insert(region_key(location));
            profile.last_seen = Some((location.clone(), at_ms));
        }
        if let Some(device) = ctx.device_fingerprint.as_deref() {
            profile.devices.insert(device.to_string());
        }
    }
}
