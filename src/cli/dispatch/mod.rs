use crate::cli::actions::Action;
use anyhow::Result;

pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    Ok(Action::Server {
        port: matches.get_one::<u16>("port").copied().unwrap_or(8080),
        frontend_origin: matches
            .get_one::<String>("frontend-origin")
            .map(ToString::to_string),
    })
}
