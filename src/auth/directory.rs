//! External collaborators and the data they exchange with the core.
//!
//! Credential checking, user second-factor profiles, SMS dispatch,
//! notifications, IP geolocation, and CAPTCHA validation all live outside
//! this crate; the traits here are the narrow seams. In-memory
//! implementations back the test suite and local runs.

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use utoipa::ToSchema;
use uuid::Uuid;

/// Second-factor method a challenge can be bound to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChallengeMethod {
    Totp,
    Sms,
}

impl ChallengeMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Totp => "TOTP",
            Self::Sms => "SMS",
        }
    }
}

/// Request-scoped client signals used for risk decisions and audit.
#[derive(Clone, Debug, Default)]
pub struct ClientContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
}

/// Coarse location resolved from a client IP.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeoPoint {
    pub country: String,
    pub region: Option<String>,
    pub city: Option<String>,
}

/// Per-user second-factor material exposed by the user-record source.
///
/// The TOTP secret stays opaque here; only the code verifier looks inside.
#[derive(Clone, Debug, Default)]
pub struct SecondFactorProfile {
    pub methods: Vec<ChallengeMethod>,
    pub preferred: Option<ChallengeMethod>,
    pub totp_secret: Option<SecretString>,
    pub phone_number: Option<String>,
    pub masked_phone: Option<String>,
    pub backup_code_hashes: Vec<String>,
}

impl SecondFactorProfile {
    #[must_use]
    pub fn has_second_factor(&self) -> bool {
        !self.methods.is_empty()
    }

    #[must_use]
    pub fn supports(&self, method: ChallengeMethod) -> bool {
        self.methods.contains(&method)
    }

    /// The method a fresh challenge binds to.
    #[must_use]
    pub fn initial_method(&self) -> Option<ChallengeMethod> {
        self.preferred
            .filter(|method| self.supports(*method))
            .or_else(|| self.methods.first().copied())
    }
}

/// Security events pushed to the notification collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityEvent {
    AccountLocked,
    AnomalousLogin,
    SuspiciousActivity,
}

impl SecurityEvent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccountLocked => "account_locked",
            Self::AnomalousLogin => "anomalous_login",
            Self::SuspiciousActivity => "suspicious_activity",
        }
    }
}

/// Password verification. Hashing and storage live behind this seam; an
/// unknown identifier and a wrong secret are indistinguishable on purpose.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn verify(&self, identifier: &str, secret: &str) -> anyhow::Result<Option<Uuid>>;
}

/// User-record source for second-factor material.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn second_factor_profile(&self, user_id: Uuid) -> anyhow::Result<SecondFactorProfile>;
}

/// Outbound SMS dispatch.
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, phone_number: &str, code: &str) -> anyhow::Result<()>;
}

/// Fire-and-forget security notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: Uuid, event: SecurityEvent, context: serde_json::Value);
}

/// Best-effort IP geolocation; `None` means unknown.
#[async_trait]
pub trait GeoLocator: Send + Sync {
    async fn locate(&self, ip: &str) -> anyhow::Result<Option<GeoPoint>>;
}

/// Validates client CAPTCHA tokens when the risk gate demands one.
#[async_trait]
pub trait CaptchaVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> anyhow::Result<bool>;
}

#[derive(Clone, Debug)]
struct MemoryUser {
    user_id: Uuid,
    secret: String,
    profile: SecondFactorProfile,
}

/// In-memory credential store + user directory.
#[derive(Default)]
pub struct MemoryDirectory {
    users: Mutex<HashMap<String, MemoryUser>>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user; returns the assigned id.
    pub fn add_user(
        &self,
        identifier: &str,
        secret: &str,
        profile: SecondFactorProfile,
    ) -> Uuid {
        let user_id = Uuid::new_v4();
        self.lock().insert(
            identifier.trim().to_lowercase(),
            MemoryUser {
                user_id,
                secret: secret.to_string(),
                profile,
            },
        );
        user_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryUser>> {
        self.users
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl CredentialStore for MemoryDirectory {
    async fn verify(&self, identifier: &str, secret: &str) -> anyhow::Result<Option<Uuid>> {
        let users = self.lock();
        Ok(users
            .get(&identifier.trim().to_lowercase())
            .filter(|user| user.secret == secret)
            .map(|user| user.user_id))
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn second_factor_profile(&self, user_id: Uuid) -> anyhow::Result<SecondFactorProfile> {
        let users = self.lock();
        Ok(users
            .values()
            .find(|user| user.user_id == user_id)
            .map(|user| user.profile.clone())
            .unwrap_or_default())
    }
}

/// SMS sender that records messages and can fail on demand.
#[derive(Default)]
pub struct MemorySmsSender {
    sent: Mutex<Vec<(String, String)>>,
    failures_remaining: Mutex<u32>,
}

impl MemorySmsSender {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` sends fail, to exercise the retry path.
    pub fn fail_next(&self, count: u32) {
        *self
            .failures_remaining
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = count;
    }

    #[must_use]
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// The most recently dispatched code, if any.
    #[must_use]
    pub fn last_code(&self) -> Option<String> {
        self.sent().last().map(|(_, code)| code.clone())
    }
}

#[async_trait]
impl SmsSender for MemorySmsSender {
    async fn send(&self, phone_number: &str, code: &str) -> anyhow::Result<()> {
        {
            let mut failures = self
                .failures_remaining
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if *failures > 0 {
                *failures -= 1;
                anyhow::bail!("sms gateway unavailable");
            }
        }
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((phone_number.to_string(), code.to_string()));
        Ok(())
    }
}

/// Notifier that records every event.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(Uuid, SecurityEvent, serde_json::Value)>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<(Uuid, SecurityEvent, serde_json::Value)> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_id: Uuid, event: SecurityEvent, context: serde_json::Value) {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((user_id, event, context));
    }
}

/// Geolocator answering from a fixed IP table; unmapped IPs are unknown.
#[derive(Default)]
pub struct TableGeoLocator {
    table: Mutex<HashMap<String, GeoPoint>>,
}

impl TableGeoLocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&self, ip: &str, location: GeoPoint) {
        self.table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(ip.to_string(), location);
    }
}

#[async_trait]
impl GeoLocator for TableGeoLocator {
    async fn locate(&self, ip: &str) -> anyhow::Result<Option<GeoPoint>> {
        Ok(self
            .table
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(ip)
            .cloned())
    }
}

/// CAPTCHA verifier accepting one well-known token; everything else fails.
#[derive(Clone, Debug)]
pub struct StaticCaptchaVerifier {
    accepted: String,
}

impl StaticCaptchaVerifier {
    #[must_use]
    pub fn new(accepted: &str) -> Self {
        Self {
            accepted: accepted.to_string(),
        }
    }
}

impl Default for StaticCaptchaVerifier {
    fn default() -> Self {
        Self::new("captcha-ok")
    }
}

#[async_trait]
impl CaptchaVerifier for StaticCaptchaVerifier {
    async fn verify(&self, token: &str) -> anyhow::Result<bool> {
        Ok(token == self.accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_identifier_and_wrong_secret_look_identical() -> anyhow::Result<()> {
        let directory = MemoryDirectory::new();
        directory.add_user("alice@example.com", "hunter2", SecondFactorProfile::default());

        let wrong_secret = directory.verify("alice@example.com", "nope").await?;
        let unknown_user = directory.verify("bob@example.com", "hunter2").await?;
        assert_eq!(wrong_secret, None);
        assert_eq!(unknown_user, None);
        Ok(())
    }

    #[tokio::test]
    async fn identifier_lookup_is_case_insensitive() -> anyhow::Result<()> {
        let directory = MemoryDirectory::new();
        let id = directory.add_user("Alice@Example.COM", "hunter2", SecondFactorProfile::default());
        let found = directory.verify(" alice@example.com ", "hunter2").await?;
        assert_eq!(found, Some(id));
        Ok(())
    }

    #[tokio::test]
    async fn sms_sender_failure_injection_is_consumed() {
        let sender = MemorySmsSender::new();
        sender.fail_next(1);
        assert!(sender.send("+15551234567", "123456").await.is_err());
        assert!(sender.send("+15551234567", "123456").await.is_ok());
        assert_eq!(sender.sent().len(), 1);
    }

    #[test]
    fn initial_method_prefers_the_preferred_method() {
        let profile = SecondFactorProfile {
            methods: vec![ChallengeMethod::Totp, ChallengeMethod::Sms],
            preferred: Some(ChallengeMethod::Sms),
            ..SecondFactorProfile::default()
        };
        assert_eq!(profile.initial_method(), Some(ChallengeMethod::Sms));

        let no_preference = SecondFactorProfile {
            methods: vec![ChallengeMethod::Totp, ChallengeMethod::Sms],
            ..SecondFactorProfile::default()
        };
        assert_eq!(no_preference.initial_method(), Some(ChallengeMethod::Totp));
    }

    #[test]
    fn challenge_method_serializes_uppercase() {
        let value = serde_json::to_value(ChallengeMethod::Sms).ok();
        assert_eq!(value, Some(serde_json::json!("SMS")));
    }
}
