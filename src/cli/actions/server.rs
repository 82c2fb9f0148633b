use crate::api;
use crate::auth::directory::{
    MemoryDirectory, MemorySmsSender, RecordingNotifier, StaticCaptchaVerifier, TableGeoLocator,
};
use crate::auth::{AuthConfig, AuthService, Collaborators, SystemClock};
use crate::cli::{actions::Action, globals::GlobalArgs};
use anyhow::Result;
use secrecy::ExposeSecret;
use std::sync::Arc;

/// Handle the server action.
///
/// Collaborators default to the in-memory implementations; deployments
/// embedding the crate wire real credential stores, SMS gateways, and
/// notification sinks through `Collaborators` instead.
pub async fn handle(action: Action, globals: &GlobalArgs) -> Result<()> {
    match action {
        Action::Server {
            port,
            frontend_origin,
        } => {
            let mut config = AuthConfig::new();
            let pepper = globals.mfa_pepper.expose_secret();
            if !pepper.is_empty() {
                config = config
                    .with_backup_pepper(Arc::from(pepper.as_bytes().to_vec().into_boxed_slice()));
            }

            let directory = Arc::new(MemoryDirectory::new());
            let deps = Collaborators {
                credentials: directory.clone(),
                directory,
                sms: Arc::new(MemorySmsSender::new()),
                notifier: Arc::new(RecordingNotifier::new()),
                geo: Arc::new(TableGeoLocator::new()),
                captcha: Arc::new(StaticCaptchaVerifier::default()),
            };

            let service = Arc::new(AuthService::new(config, deps, Arc::new(SystemClock)));
            api::new(port, frontend_origin, service).await?;
        }
    }

    Ok(())
}
