//! Error taxonomy for the auth surface.
//!
//! Every fallible path in the login and challenge flows resolves to one of
//! these members; nothing else reaches the caller. Identifier-existence
//! failures collapse into `InvalidCredentials` so responses cannot be used
//! to enumerate accounts.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials {
        /// Set once the CAPTCHA threshold has been reached for the subject,
        /// so the client knows the next attempt must carry a token.
        captcha_required: bool,
    },
    #[error("captcha required")]
    CaptchaRequired,
    #[error("captcha failed")]
    CaptchaFailed,
    #[error("account locked")]
    AccountLocked { locked_until_ms: i64 },
    #[error("challenge expired")]
    ChallengeExpired,
    #[error("challenge invalid")]
    ChallengeInvalid,
    #[error("challenge exhausted")]
    ChallengeExhausted,
    #[error("code mismatch")]
    CodeMismatch { attempts_remaining: u32 },
    #[error("code already used")]
    CodeAlreadyUsed,
    #[error("rate limited")]
    RateLimited { retry_after_ms: Option<i64> },
    #[error("no second factor available")]
    NoSecondFactor,
    #[error("downstream unavailable")]
    DownstreamUnavailable,
}

impl AuthError {
    /// Stable wire identifier for the error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials { .. } => "INVALID_CREDENTIALS",
            Self::CaptchaRequired => "CAPTCHA_REQUIRED",
            Self::CaptchaFailed => "CAPTCHA_FAILED",
            Self::AccountLocked { .. } => "ACCOUNT_LOCKED",
            Self::ChallengeExpired => "CHALLENGE_EXPIRED",
            Self::ChallengeInvalid => "CHALLENGE_INVALID",
            Self::ChallengeExhausted => "CHALLENGE_EXHAUSTED",
            Self::CodeMismatch { .. } => "CODE_MISMATCH",
            Self::CodeAlreadyUsed => "CODE_ALREADY_USED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::NoSecondFactor => "NO_SECOND_FACTOR_AVAILABLE",
            Self::DownstreamUnavailable => "DOWNSTREAM_UNAVAILABLE",
        }
    }
}

/// JSON body returned for every taxonomy member.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captcha_required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts_remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<i64>,
}

impl From<&AuthError> for ErrorBody {
    fn from(err: &AuthError) -> Self {
        let mut body = Self {
            error: err.code(),
            message: err.to_string(),
            captcha_required: None,
            attempts_remaining: None,
            locked_until_ms: None,
            retry_after_ms: None,
        };
        match err {
            AuthError::InvalidCredentials { captcha_required } if *captcha_required => {
                body.captcha_required = Some(true);
            }
            AuthError::CodeMismatch { attempts_remaining } => {
                body.attempts_remaining = Some(*attempts_remaining);
            }
            AuthError::AccountLocked { locked_until_ms } => {
                body.locked_until_ms = Some(*locked_until_ms);
            }
            AuthError::RateLimited { retry_after_ms } => {
                body.retry_after_ms = *retry_after_ms;
            }
            _ => {}
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            AuthError::InvalidCredentials {
                captcha_required: false
            }
            .code(),
            "INVALID_CREDENTIALS"
        );
        assert_eq!(AuthError::NoSecondFactor.code(), "NO_SECOND_FACTOR_AVAILABLE");
        assert_eq!(
            AuthError::RateLimited {
                retry_after_ms: None
            }
            .code(),
            "RATE_LIMITED"
        );
    }

    #[test]
    fn body_carries_structured_context() -> Result<()> {
        let body = ErrorBody::from(&AuthError::CodeMismatch {
            attempts_remaining: 2,
        });
        let value = serde_json::to_value(&body)?;
        assert_eq!(
            value.get("error").and_then(serde_json::Value::as_str),
            Some("CODE_MISMATCH")
        );
        assert_eq!(
            value
                .get("attempts_remaining")
                .and_then(serde_json::Value::as_u64),
            Some(2)
        );
        assert!(value.get("locked_until_ms").is_none());
        Ok(())
    }

    #[test]
    fn captcha_flag_only_serialized_when_set() -> Result<()> {
        let without = serde_json::to_value(ErrorBody::from(&AuthError::InvalidCredentials {
            captcha_required: false,
        }))?;
        assert!(without.get("captcha_required").is_none());

        let with = serde_json::to_value(ErrorBody::from(&AuthError::InvalidCredentials {
            captcha_required: true,
        }))?;
        let flagged = with
            .get("captcha_required")
            .and_then(serde_json::Value::as_bool)
            .context("missing captcha_required")?;
        assert!(flagged);
        Ok(())
    }
}
