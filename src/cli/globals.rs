use secrecy::SecretString;

/// Shared runtime state derived from the command line and environment.
#[derive(Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Server-side pepper for backup-code hashing; empty disables the
    /// backup-code path.
    pub mfa_pepper: SecretString,
}

impl GlobalArgs {
    #[must_use]
    pub fn from_matches(matches: &clap::ArgMatches) -> Self {
        Self {
            mfa_pepper: matches
                .get_one::<String>("mfa-pepper")
                .map(|pepper| SecretString::from(pepper.clone()))
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;
    use secrecy::ExposeSecret;

    #[test]
    fn test_global_args() {
        let matches =
            commands::new().get_matches_from(vec!["presidio", "--mfa-pepper", "pepper"]);
        let args = GlobalArgs::from_matches(&matches);
        assert_eq!(args.mfa_pepper.expose_secret(), "pepper");

        let matches = commands::new().get_matches_from(vec!["presidio"]);
        let args = GlobalArgs::from_matches(&matches);
        assert_eq!(args.mfa_pepper.expose_secret(), "");
    }
}
