//! Anomaly scoring for successful password checks.
//!
//! Each unmatched signal contributes a fixed confidence weight; the attempt
//! is flagged once the sum reaches the threshold. Flagging never blocks the
//! login. A user with no recorded history establishes a baseline instead of
//! tripping every signal, and an unknown location contributes nothing.

use regex::Regex;
use serde::Serialize;

use super::history::{region_key, KnownProfile};
use crate::auth::directory::{ClientContext, GeoPoint};

const BOT_AGENT_PATTERN: &str =
    r"(?i)\b(bot|crawler|spider|scrapy|curl|wget|python-requests|httpclient|headless)\b";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySignal {
    NewCountry,
    NewRegion,
    NewDevice,
    ImpossibleTravel,
    BotUserAgent,
}

impl AnomalySignal {
    #[must_use]
    pub fn weight(self) -> f32 {
        match self {
            Self::NewCountry => 0.4,
            Self::NewRegion => 0.2,
            Self::NewDevice => 0.3,
            Self::ImpossibleTravel => 0.5,
            Self::BotUserAgent => 0.3,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::NewCountry => "new_country",
            Self::NewRegion => "new_region",
            Self::NewDevice => "new_device",
            Self::ImpossibleTravel => "impossible_travel",
            Self::BotUserAgent => "bot_user_agent",
        }
    }
}

/// Scoring result for one successful attempt.
#[derive(Clone, Debug, Default)]
pub struct AnomalyReport {
    pub score: f32,
    pub signals: Vec<AnomalySignal>,
    pub anomalous: bool,
}

pub struct AnomalyScorer {
    bot_agents: Option<Regex>,
    threshold: f32,
    travel_window_ms: i64,
}

impl AnomalyScorer {
    #[must_use]
    pub fn new(threshold: f32, travel_window_ms: i64) -> Self {
        Self {
            bot_agents: Regex::new(BOT_AGENT_PATTERN).ok(),
            threshold,
            travel_window_ms,
        }
    }

    /// Compare an attempt against the user's known profile.
    #[must_use]
    pub fn score(
        &self,
        profile: &KnownProfile,
        ctx: &ClientContext,
        location: Option<&GeoPoint>,
        now_ms: i64,
    ) -> AnomalyReport {
        let mut signals = Vec::new();

        // History comparisons only make sense once there is history; the
        // first successful login seeds the profile instead.
        if !profile.is_empty() {
            if let Some(location) = location {
                if !profile.countries.contains(&location.country) {
                    signals.push(AnomalySignal::NewCountry);
                } else if !profile.region_keys.contains(&region_key(location)) {
                    signals.push(AnomalySignal::NewRegion);
                }

                if let Some((last_location, last_at_ms)) = &profile.last_seen {
                    let elapsed = now_ms.saturating_sub(*last_at_ms);
                    if last_location.country != location.country
                        && elapsed < self.travel_window_ms
                    {
                        signals.push(AnomalySignal::ImpossibleTravel);
                    }
                }
            }

            if let Some(device) = ctx.device_fingerprint.as_deref() {
                if !profile.devices.contains(device) {
                    signals.push(AnomalySignal::NewDevice);
                }
            }
        }

        if let (Some(pattern), Some(agent)) = (&self.bot_agents, ctx.user_agent.as_deref()) {
            if pattern.is_match(agent) {
                signals.push(AnomalySignal::BotUserAgent);
            }
        }

        let score: f32 = signals.iter().map(|signal| signal.weight()).sum();
        AnomalyReport {
            score,
            anomalous: score >= self.threshold,
            signals,
        }
    }
}
