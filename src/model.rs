//! Canonical entities, snapshots and picks shared by every component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type TeamId = Uuid;
pub type MatchId = Uuid;

/// Which kind of canonical entity an external identifier points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Team,
    Match,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Team => "team",
            EntityKind::Match => "match",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "team" => Some(EntityKind::Team),
            "match" => Some(EntityKind::Match),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalTeam {
    pub id: TeamId,
    pub league: String,
    pub display_name: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Scheduled,
    Live,
    Final,
    Cancelled,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Scheduled => "scheduled",
            MatchStatus::Live => "live",
            MatchStatus::Final => "final",
            MatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(MatchStatus::Scheduled),
            "live" => Some(MatchStatus::Live),
            "final" => Some(MatchStatus::Final),
            "cancelled" => Some(MatchStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchStatus::Final | MatchStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalScore {
    pub home: u32,
    pub away: u32,
}

impl FinalScore {
    /// Home margin of victory (negative when the away side won).
    pub fn home_margin(&self) -> f64 {
        self.home as f64 - self.away as f64
    }

    pub fn total(&self) -> f64 {
        (self.home + self.away) as f64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalMatch {
    pub id: MatchId,
    pub league: String,
    pub home_team_id: TeamId,
    pub away_team_id: TeamId,
    /// Scheduled start. Corrections go through `SnapshotService::correct_start_time`.
    pub start_time: DateTime<Utc>,
    pub status: MatchStatus,
    pub final_score: Option<FinalScore>,
    pub verified: bool,
}

/// (provider, kind, external_id) -> canonical id. Rows are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityMapping {
    pub provider: String,
    pub kind: EntityKind,
    pub external_id: String,
    pub canonical_id: Uuid,
    /// Canonical id this mapping replaced, if it superseded an earlier one.
    pub supersedes: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Full,
    FirstHalf,
    SecondHalf,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Full => "full",
            Period::FirstHalf => "1h",
            Period::SecondHalf => "2h",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Period::Full),
            "1h" => Some(Period::FirstHalf),
            "2h" => Some(Period::SecondHalf),
            _ => None,
        }
    }

    /// Suffix appended to a provider string for half-game prices.
    pub fn provider_suffix(&self) -> Option<&'static str> {
        match self {
            Period::Full => None,
            Period::FirstHalf => Some("h1"),
            Period::SecondHalf => Some("h2"),
        }
    }

    /// Derives the period from a provider string such as `the_odds_api:bovada:h1`.
    pub fn from_provider(provider: &str) -> Self {
        match provider.rsplit(':').next() {
            Some("h1") => Period::FirstHalf,
            Some("h2") => Period::SecondHalf,
            _ => Period::Full,
        }
    }

    /// Provider string for prices of this period from `feed` / `bookmaker`.
    pub fn provider_key(&self, feed: &str, bookmaker: &str) -> String {
        match self.provider_suffix() {
            Some(suffix) => format!("{}:{}:{}", feed, bookmaker, suffix),
            None => format!("{}:{}", feed, bookmaker),
        }
    }
}

/// Prices for one match from one provider at one instant. Lines are points,
/// prices are American odds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketPrices {
    pub home_moneyline: Option<i32>,
    pub away_moneyline: Option<i32>,
    pub home_spread: Option<f64>,
    pub away_spread: Option<f64>,
    pub home_spread_price: Option<i32>,
    pub away_spread_price: Option<i32>,
    pub total_line: Option<f64>,
    pub over_price: Option<i32>,
    pub under_price: Option<i32>,
}

impl MarketPrices {
    pub fn has_moneyline(&self) -> bool {
        self.home_moneyline.is_some() || self.away_moneyline.is_some()
    }

    pub fn has_spread(&self) -> bool {
        self.home_spread.is_some() || self.away_spread.is_some()
    }

    pub fn has_total(&self) -> bool {
        self.total_line.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_moneyline() && !self.has_spread() && !self.has_total()
    }

    /// Spread line for `side`, falling back to the negated opposite line.
    pub fn spread_for(&self, side: PickSide) -> Option<f64> {
        match side {
            PickSide::Home => self.home_spread.or(self.away_spread.map(|l| -l)),
            PickSide::Away => self.away_spread.or(self.home_spread.map(|l| -l)),
            _ => None,
        }
    }

    pub fn carries(&self, pick_type: PickType) -> bool {
        match pick_type {
            PickType::Moneyline => self.has_moneyline(),
            PickType::Spread => self.has_spread(),
            PickType::Total => self.has_total(),
        }
    }
}

/// One timestamped price record for a match from one provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarketSnapshot {
    pub id: Uuid,
    pub match_id: MatchId,
    pub provider: String,
    pub period: Period,
    pub timestamp: DateTime<Utc>,
    pub prices: MarketPrices,
    pub is_live: bool,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PickType {
    Moneyline,
    Spread,
    Total,
}

impl PickType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PickType::Moneyline => "MONEYLINE",
            PickType::Spread => "SPREAD",
            PickType::Total => "TOTAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MONEYLINE" => Some(PickType::Moneyline),
            "SPREAD" => Some(PickType::Spread),
            "TOTAL" => Some(PickType::Total),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickSide {
    Home,
    Away,
    Over,
    Under,
}

impl PickSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PickSide::Home => "home",
            PickSide::Away => "away",
            PickSide::Over => "over",
            PickSide::Under => "under",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "home" => Some(PickSide::Home),
            "away" => Some(PickSide::Away),
            "over" => Some(PickSide::Over),
            "under" => Some(PickSide::Under),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PickOutcome {
    Ungraded,
    Win,
    Loss,
    Push,
    Void,
}

impl PickOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PickOutcome::Ungraded => "UNGRADED",
            PickOutcome::Win => "WIN",
            PickOutcome::Loss => "LOSS",
            PickOutcome::Push => "PUSH",
            PickOutcome::Void => "VOID",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNGRADED" => Some(PickOutcome::Ungraded),
            "WIN" => Some(PickOutcome::Win),
            "LOSS" => Some(PickOutcome::Loss),
            "PUSH" => Some(PickOutcome::Push),
            "VOID" => Some(PickOutcome::Void),
            _ => None,
        }
    }
}

/// A stored recommendation and its grading metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pick {
    pub id: Uuid,
    pub match_id: MatchId,
    pub pick_type: PickType,
    pub side: PickSide,
    /// Line quoted when the pick was made (informational; grading uses the reference snapshot).
    pub line: Option<f64>,
    pub recommended_at: DateTime<Utc>,
    pub outcome: PickOutcome,
    pub graded_at: Option<DateTime<Utc>>,
    pub reference_snapshot: Option<Uuid>,
    pub reference_line: Option<f64>,
    pub regrade_count: u32,
}

impl Pick {
    pub fn new(
        match_id: MatchId,
        pick_type: PickType,
        side: PickSide,
        line: Option<f64>,
        recommended_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            match_id,
            pick_type,
            side,
            line,
            recommended_at,
            outcome: PickOutcome::Ungraded,
            graded_at: None,
            reference_snapshot: None,
            reference_line: None,
            regrade_count: 0,
        }
    }

    pub fn is_graded(&self) -> bool {
        self.outcome != PickOutcome::Ungraded
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub canonical_id: Uuid,
    pub score: f64,
}

/// A resolver miss that had several plausible candidates. Kept for offline review.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AmbiguityRecord {
    pub id: Uuid,
    pub provider: String,
    pub kind: EntityKind,
    pub external_id: String,
    pub name_hint: String,
    pub league: String,
    pub candidates: Vec<Candidate>,
    pub created_id: Uuid,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_round_trips_through_provider_key() {
        let key = Period::FirstHalf.provider_key("the_odds_api", "bovada");
        assert_eq!(key, "the_odds_api:bovada:h1");
        assert_eq!(Period::from_provider(&key), Period::FirstHalf);
        assert_eq!(
            Period::from_provider(&Period::Full.provider_key("the_odds_api", "pinnacle")),
            Period::Full
        );
    }

    #[test]
    fn test_spread_for_falls_back_to_opposite_line() {
        let prices = MarketPrices {
            away_spread: Some(3.5),
            ..Default::default()
        };
        assert_eq!(prices.spread_for(PickSide::Home), Some(-3.5));
        assert_eq!(prices.spread_for(PickSide::Away), Some(3.5));
        assert_eq!(prices.spread_for(PickSide::Over), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(MatchStatus::Final.is_terminal());
        assert!(MatchStatus::Cancelled.is_terminal());
        assert!(!MatchStatus::Live.is_terminal());
    }
}
