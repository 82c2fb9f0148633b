//! Login risk assessment and second-factor verification core.
//!
//! Layered bottom-up: windowed counters feed named quotas, the risk gate
//! decides delay/CAPTCHA/lockout around the credential check, and the
//! challenge orchestrator runs the second-factor exchange (TOTP, SMS,
//! backup codes). `AuthService` ties the layers together behind the
//! method-agnostic login/verify/switch/resend/status contract.

pub mod challenge;
pub mod clock;
pub mod counter;
pub mod directory;
pub mod error;
pub mod otp;
pub mod rate_limit;
pub mod risk;
pub mod service;
pub mod state;

pub use challenge::{ChallengePolicy, ChallengeStatusView};
pub use clock::{Clock, ManualClock, SystemClock};
pub use directory::{ChallengeMethod, ClientContext, SecondFactorProfile, SecurityEvent};
pub use error::{AuthError, ErrorBody};
pub use rate_limit::{RateAction, RateRule};
pub use risk::RiskPolicy;
pub use service::{
    AuthService, Collaborators, CompletedAuth, LoginOutcome, PendingChallenge, ResendReceipt,
    VerifiedLogin,
};
pub use state::AuthConfig;
