#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use market_ingestion::config::{Config, League};
use market_ingestion::engine::Engine;
use market_ingestion::error::{EngineError, Result};
use market_ingestion::model::Period;
use market_ingestion::provider::{
    Bookmaker, Competition, CompetitionStatus, Competitor, CompetitorTeam, FeedProvider, Market,
    OddsApiEvent, Outcome, RawFeed, Scoreboard, ScoreboardEvent, StatusType,
};
use market_ingestion::publish::NoopPublisher;
use market_ingestion::store::MemoryStore;

pub const TRIGGER_SECRET: &str = "trigger-test-secret";
pub const ADMIN_SECRET: &str = "admin-test-secret";

pub fn ts(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 9, h, m, 0).unwrap()
}

fn outcome(name: &str, price: i32, point: Option<f64>) -> Outcome {
    Outcome {
        name: name.to_string(),
        price: Some(price),
        point,
    }
}

fn market(key: &str, outcomes: Vec<Outcome>) -> Market {
    Market {
        key: key.to_string(),
        last_update: None,
        outcomes,
    }
}

/// Full-game event with moneyline, spread and total from one bookmaker.
pub fn odds_event(
    id: &str,
    home: &str,
    away: &str,
    commence: DateTime<Utc>,
    quoted_at: DateTime<Utc>,
    home_spread: f64,
) -> OddsApiEvent {
    OddsApiEvent {
        id: id.to_string(),
        sport_key: "basketball_nba".to_string(),
        sport_title: "NBA".to_string(),
        commence_time: Some(commence),
        home_team: home.to_string(),
        away_team: away.to_string(),
        bookmakers: vec![Bookmaker {
            key: "pinnacle".to_string(),
            title: "Pinnacle".to_string(),
            last_update: Some(quoted_at),
            markets: vec![
                market("h2h", vec![outcome(home, -160, None), outcome(away, 140, None)]),
                market(
                    "spreads",
                    vec![
                        outcome(home, -110, Some(home_spread)),
                        outcome(away, -110, Some(-home_spread)),
                    ],
                ),
                market(
                    "totals",
                    vec![outcome("Over", -110, Some(221.5)), outcome("Under", -110, Some(221.5))],
                ),
            ],
        }],
    }
}

/// First-half spread for an event from a second bookmaker.
fn first_half_event(event: &OddsApiEvent) -> OddsApiEvent {
    OddsApiEvent {
        bookmakers: vec![Bookmaker {
            key: "bovada".to_string(),
            title: "Bovada".to_string(),
            last_update: event.bookmakers.first().and_then(|b| b.last_update),
            markets: vec![market(
                "spreads_h1",
                vec![
                    outcome(&event.home_team, -115, Some(-1.5)),
                    outcome(&event.away_team, -105, Some(1.5)),
                ],
            )],
        }],
        ..event.clone()
    }
}

pub fn final_result(id: &str, home: &str, away: &str, date: &str, home_score: u32, away_score: u32) -> ScoreboardEvent {
    let competitor = |tag: &str, name: &str, score: u32| Competitor {
        home_away: tag.to_string(),
        score: Some(score.to_string()),
        team: CompetitorTeam {
            display_name: name.to_string(),
        },
    };
    ScoreboardEvent {
        id: id.to_string(),
        date: date.to_string(),
        competitions: vec![Competition {
            competitors: vec![competitor("home", home, home_score), competitor("away", away, away_score)],
            status: CompetitionStatus {
                kind: StatusType {
                    name: "STATUS_FINAL".to_string(),
                    state: "post".to_string(),
                    completed: true,
                },
            },
        }],
    }
}

pub enum OddsStep {
    Events(Vec<OddsApiEvent>),
    Quota,
    Malformed(u16, String),
    /// Never answers until the run is cancelled.
    Hang,
}

pub enum PeriodStep {
    Unavailable,
    Available,
    /// Serves this many period requests, then reports exhausted quota.
    QuotaAfter(usize),
    /// Every period request answers with this unparseable body.
    Broken(u16, String),
}

pub struct LeagueScript {
    pub odds: OddsStep,
    pub period: PeriodStep,
    pub results: Option<Scoreboard>,
    period_calls: AtomicUsize,
}

impl LeagueScript {
    pub fn events(events: Vec<OddsApiEvent>) -> Self {
        Self::new(OddsStep::Events(events))
    }

    pub fn new(odds: OddsStep) -> Self {
        Self {
            odds,
            period: PeriodStep::Unavailable,
            results: None,
            period_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_period(mut self, period: PeriodStep) -> Self {
        self.period = period;
        self
    }

    pub fn with_results(mut self, events: Vec<ScoreboardEvent>) -> Self {
        self.results = Some(Scoreboard { events });
        self
    }
}

/// Feed provider replaying fixed payloads per league.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: HashMap<String, LeagueScript>,
    odds_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn league(mut self, id: &str, script: LeagueScript) -> Self {
        self.scripts.insert(id.to_string(), script);
        self
    }

    pub fn odds_calls(&self) -> usize {
        self.odds_calls.load(Ordering::SeqCst)
    }

    fn script(&self, league: &League) -> Result<&LeagueScript> {
        self.scripts
            .get(&league.id)
            .ok_or_else(|| EngineError::NotFound(format!("no script for {}", league.id)))
    }
}

#[async_trait]
impl FeedProvider for ScriptedProvider {
    async fn fetch_odds(&self, league: &League, cancel: &CancellationToken) -> Result<RawFeed> {
        self.odds_calls.fetch_add(1, Ordering::SeqCst);
        match &self.script(league)?.odds {
            OddsStep::Events(events) => Ok(RawFeed::OddsApiEvents(events.clone())),
            OddsStep::Quota => Err(EngineError::QuotaExceeded("status 429".to_string())),
            OddsStep::Malformed(status, body) => Err(EngineError::malformed(*status, body)),
            OddsStep::Hang => {
                cancel.cancelled().await;
                Err(EngineError::Cancelled)
            }
        }
    }

    async fn fetch_period_odds(
        &self,
        league: &League,
        event_id: &str,
        period: Period,
        _cancel: &CancellationToken,
    ) -> Result<Option<RawFeed>> {
        let script = self.script(league)?;
        let served = script.period_calls.fetch_add(1, Ordering::SeqCst);
        match &script.period {
            PeriodStep::Unavailable => return Ok(None),
            PeriodStep::QuotaAfter(n) if served >= *n => {
                return Err(EngineError::QuotaExceeded("usage credits exhausted".to_string()))
            }
            PeriodStep::Broken(status, body) => return Err(EngineError::malformed(*status, body)),
            _ => {}
        }
        if period != Period::FirstHalf {
            return Ok(None);
        }
        let OddsStep::Events(events) = &script.odds else {
            return Ok(None);
        };
        Ok(events
            .iter()
            .find(|e| e.id == event_id)
            .map(|e| RawFeed::OddsApiEvent {
                period,
                event: first_half_event(e),
            }))
    }

    async fn fetch_results(&self, league: &League, _cancel: &CancellationToken) -> Result<Option<RawFeed>> {
        Ok(self.script(league)?.results.clone().map(RawFeed::Scoreboard))
    }
}

pub fn test_config(league_ids: &[&str]) -> Config {
    Config {
        trigger_secret: TRIGGER_SECRET.to_string(),
        admin_secret: Some(ADMIN_SECRET.to_string()),
        leagues: league_ids
            .iter()
            .map(|id| League::new(id, &format!("basketball_{}", id)))
            .collect(),
        ..Config::default()
    }
}

pub fn with_budget(mut config: Config, budget: Duration) -> Config {
    config.run_budget = budget;
    config
}

/// Engine over an in-memory store; the store handle is returned for inspection.
pub fn engine(config: Config, provider: ScriptedProvider) -> (Arc<Engine>, MemoryStore, Arc<ScriptedProvider>) {
    engine_with_store(config, provider, MemoryStore::new())
}

/// Engine over an existing store, for runs that see a changed feed.
pub fn engine_with_store(
    config: Config,
    provider: ScriptedProvider,
    store: MemoryStore,
) -> (Arc<Engine>, MemoryStore, Arc<ScriptedProvider>) {
    let provider = Arc::new(provider);
    let engine = Engine::new(
        config,
        Arc::new(store.clone()),
        provider.clone(),
        Arc::new(NoopPublisher),
    );
    (Arc::new(engine), store, provider)
}
