//! Upstream feeds and their raw payload shapes.
//!
//! Payloads are untrusted: every field the normalizer needs is optional or
//! defaulted here, and validation happens in `normalize`.

mod http;

pub use http::HttpFeedProvider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::League;
use crate::error::Result;
use crate::model::Period;

pub const ODDS_API_FEED: &str = "the_odds_api";
pub const SCOREBOARD_FEED: &str = "espn";

/// The Odds API event structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct OddsApiEvent {
    pub id: String,
    pub sport_key: String,
    pub sport_title: String,
    pub commence_time: Option<DateTime<Utc>>,
    pub home_team: String,
    pub away_team: String,
    pub bookmakers: Vec<Bookmaker>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Bookmaker {
    pub key: String,
    pub title: String,
    pub last_update: Option<DateTime<Utc>>,
    pub markets: Vec<Market>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Market {
    pub key: String,
    pub last_update: Option<DateTime<Utc>>,
    pub outcomes: Vec<Outcome>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Outcome {
    pub name: String,
    pub price: Option<i32>,
    pub point: Option<f64>,
}

/// Scoreboard payload (ESPN site API shape).
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Scoreboard {
    pub events: Vec<ScoreboardEvent>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ScoreboardEvent {
    pub id: String,
    /// Minute-precision timestamps such as `2026-01-09T00:30Z` are common, so kept raw.
    pub date: String,
    pub competitions: Vec<Competition>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Competition {
    pub competitors: Vec<Competitor>,
    pub status: CompetitionStatus,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Competitor {
    pub home_away: String,
    pub score: Option<String>,
    pub team: CompetitorTeam,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct CompetitorTeam {
    pub display_name: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CompetitionStatus {
    #[serde(rename = "type")]
    pub kind: StatusType,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StatusType {
    pub name: String,
    pub state: String,
    pub completed: bool,
}

/// A provider payload, tagged by shape. Anything that fails to deserialize
/// into one of these never leaves the provider boundary.
#[derive(Debug, Clone)]
pub enum RawFeed {
    /// Full-game odds listing for a sport.
    OddsApiEvents(Vec<OddsApiEvent>),
    /// Period odds for a single event.
    OddsApiEvent { period: Period, event: OddsApiEvent },
    /// Results scoreboard.
    Scoreboard(Scoreboard),
}

impl RawFeed {
    pub fn feed_name(&self) -> &'static str {
        match self {
            RawFeed::OddsApiEvents(_) | RawFeed::OddsApiEvent { .. } => ODDS_API_FEED,
            RawFeed::Scoreboard(_) => SCOREBOARD_FEED,
        }
    }
}

/// Per-league market and result feeds.
///
/// Every call observes `cancel` and returns `EngineError::Cancelled` once it fires.
#[async_trait]
pub trait FeedProvider: Send + Sync {
    /// Full-game odds for every listed event of the league.
    async fn fetch_odds(&self, league: &League, cancel: &CancellationToken) -> Result<RawFeed>;

    /// Half-game odds for one event; `None` when the provider has none for it.
    async fn fetch_period_odds(
        &self,
        league: &League,
        event_id: &str,
        period: Period,
        cancel: &CancellationToken,
    ) -> Result<Option<RawFeed>>;

    /// Results scoreboard; `None` when the league has no results feed.
    async fn fetch_results(
        &self,
        league: &League,
        cancel: &CancellationToken,
    ) -> Result<Option<RawFeed>>;
}
