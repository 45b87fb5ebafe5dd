//! Feed Normalizer: raw provider payloads into canonical intermediate records.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use tracing::warn;

use crate::model::{FinalScore, MarketPrices, MatchStatus, Period};
use crate::provider::{Bookmaker, Market, OddsApiEvent, RawFeed, Scoreboard, ScoreboardEvent};

/// Prices for one event from one bookmaker in one period.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedQuote {
    /// Snapshot provider key, e.g. `the_odds_api:pinnacle` or `the_odds_api:bovada:h1`.
    pub provider: String,
    pub period: Period,
    pub timestamp: DateTime<Utc>,
    pub prices: MarketPrices,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub feed: String,
    pub external_id: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: DateTime<Utc>,
    pub quotes: Vec<NormalizedQuote>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedResult {
    pub feed: String,
    pub external_id: String,
    pub home_team: String,
    pub away_team: String,
    pub start_time: DateTime<Utc>,
    pub status: MatchStatus,
    pub score: Option<FinalScore>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Quarantined {
    pub external_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub events: Vec<NormalizedEvent>,
    pub results: Vec<NormalizedResult>,
    pub quarantined: Vec<Quarantined>,
}

/// Normalizes a raw payload. Records failing validation are quarantined, never
/// passed downstream. `observed_at` stamps quotes that carry no update time.
pub fn normalize(feed: RawFeed, observed_at: DateTime<Utc>) -> NormalizedBatch {
    let feed_name = feed.feed_name();
    let mut batch = NormalizedBatch::default();
    match feed {
        RawFeed::OddsApiEvents(events) => {
            for event in events {
                push_event(&mut batch, feed_name, event, None, observed_at);
            }
        }
        RawFeed::OddsApiEvent { period, event } => {
            push_event(&mut batch, feed_name, event, Some(period), observed_at);
        }
        RawFeed::Scoreboard(scoreboard) => normalize_scoreboard(&mut batch, feed_name, scoreboard),
    }
    for q in &batch.quarantined {
        warn!(feed = feed_name, external_id = %q.external_id, reason = %q.reason, "Quarantined event");
    }
    batch
}

fn push_event(
    batch: &mut NormalizedBatch,
    feed: &str,
    event: OddsApiEvent,
    period: Option<Period>,
    observed_at: DateTime<Utc>,
) {
    match validate_event(&event) {
        Ok(start_time) => {
            let quotes = event
                .bookmakers
                .iter()
                .flat_map(|b| extract_quotes(feed, b, &event.home_team, &event.away_team, period, observed_at))
                .collect();
            batch.events.push(NormalizedEvent {
                feed: feed.to_string(),
                external_id: event.id.trim().to_string(),
                home_team: event.home_team.trim().to_string(),
                away_team: event.away_team.trim().to_string(),
                start_time,
                quotes,
            });
        }
        Err(reason) => batch.quarantined.push(Quarantined {
            external_id: event.id.clone(),
            reason,
        }),
    }
}

fn validate_event(event: &OddsApiEvent) -> Result<DateTime<Utc>, String> {
    if event.id.trim().is_empty() {
        return Err("missing event id".to_string());
    }
    validate_pairing(&event.home_team, &event.away_team)?;
    event
        .commence_time
        .ok_or_else(|| "missing commence_time".to_string())
}

fn validate_pairing(home: &str, away: &str) -> Result<(), String> {
    if home.trim().is_empty() || away.trim().is_empty() {
        return Err("missing team name".to_string());
    }
    if home.trim().eq_ignore_ascii_case(away.trim()) {
        return Err(format!("home and away are the same team ('{}')", home.trim()));
    }
    Ok(())
}

/// Maps a market key to its type and period (`spreads_h1` -> spreads, first half).
fn market_kind(key: &str) -> Option<(&'static str, Period)> {
    let (base, period) = match key.split_once('_') {
        Some((base, "h1")) => (base, Period::FirstHalf),
        Some((base, "h2")) => (base, Period::SecondHalf),
        Some(_) => return None,
        None => (key, Period::Full),
    };
    let base = match base {
        "spreads" => "spreads",
        "totals" => "totals",
        "h2h" => "h2h",
        _ => return None,
    };
    Some((base, period))
}

/// One quote per period present in a bookmaker's markets.
fn extract_quotes(
    feed: &str,
    bookmaker: &Bookmaker,
    home_team: &str,
    away_team: &str,
    expected_period: Option<Period>,
    observed_at: DateTime<Utc>,
) -> Vec<NormalizedQuote> {
    if bookmaker.key.trim().is_empty() {
        return Vec::new();
    }
    let mut by_period: BTreeMap<&'static str, (Period, MarketPrices)> = BTreeMap::new();
    for market in &bookmaker.markets {
        let Some((kind, period)) = market_kind(&market.key) else {
            continue;
        };
        if expected_period.map_or(false, |p| p != period) {
            continue;
        }
        let entry = by_period
            .entry(period.as_str())
            .or_insert_with(|| (period, MarketPrices::default()));
        apply_market(&mut entry.1, kind, market, home_team, away_team);
    }

    let timestamp = bookmaker.last_update.unwrap_or(observed_at);
    by_period
        .into_values()
        .filter(|(_, prices)| !prices.is_empty())
        .map(|(period, prices)| NormalizedQuote {
            provider: period.provider_key(feed, bookmaker.key.trim()),
            period,
            timestamp,
            prices,
        })
        .collect()
}

fn apply_market(prices: &mut MarketPrices, kind: &str, market: &Market, home_team: &str, away_team: &str) {
    for outcome in &market.outcomes {
        let name = outcome.name.trim();
        match kind {
            "spreads" => {
                if name == home_team {
                    prices.home_spread = outcome.point;
                    prices.home_spread_price = outcome.price;
                } else if name == away_team {
                    prices.away_spread = outcome.point;
                    prices.away_spread_price = outcome.price;
                }
            }
            "totals" => {
                if name.eq_ignore_ascii_case("over") {
                    prices.total_line = outcome.point.or(prices.total_line);
                    prices.over_price = outcome.price;
                } else if name.eq_ignore_ascii_case("under") {
                    prices.total_line = prices.total_line.or(outcome.point);
                    prices.under_price = outcome.price;
                }
            }
            "h2h" => {
                if name == home_team {
                    prices.home_moneyline = outcome.price;
                } else if name == away_team {
                    prices.away_moneyline = outcome.price;
                }
            }
            _ => {}
        }
    }
}

fn normalize_scoreboard(batch: &mut NormalizedBatch, feed: &str, scoreboard: Scoreboard) {
    for event in scoreboard.events {
        match normalize_result(feed, &event) {
            Ok(result) => batch.results.push(result),
            Err(reason) => batch.quarantined.push(Quarantined {
                external_id: event.id.clone(),
                reason,
            }),
        }
    }
}

fn normalize_result(feed: &str, event: &ScoreboardEvent) -> Result<NormalizedResult, String> {
    if event.id.trim().is_empty() {
        return Err("missing event id".to_string());
    }
    let start_time = parse_scoreboard_date(&event.date)
        .ok_or_else(|| format!("unparseable date '{}'", event.date))?;
    let competition = event
        .competitions
        .first()
        .ok_or_else(|| "no competition".to_string())?;
    let side = |tag: &str| {
        competition
            .competitors
            .iter()
            .find(|c| c.home_away.eq_ignore_ascii_case(tag))
    };
    let home = side("home").ok_or_else(|| "no home competitor".to_string())?;
    let away = side("away").ok_or_else(|| "no away competitor".to_string())?;
    validate_pairing(&home.team.display_name, &away.team.display_name)?;

    let state = &competition.status.kind;
    let status = if state.name.contains("CANCELED") || state.name.contains("POSTPONED") {
        MatchStatus::Cancelled
    } else if state.state == "post" && state.completed {
        MatchStatus::Final
    } else if state.state == "in" {
        MatchStatus::Live
    } else {
        MatchStatus::Scheduled
    };

    let score = if status == MatchStatus::Final {
        let parse = |s: &Option<String>| s.as_deref().and_then(|v| v.trim().parse::<u32>().ok());
        match (parse(&home.score), parse(&away.score)) {
            (Some(home), Some(away)) => Some(FinalScore { home, away }),
            _ => return Err("final without a numeric score".to_string()),
        }
    } else {
        None
    };

    Ok(NormalizedResult {
        feed: feed.to_string(),
        external_id: event.id.trim().to_string(),
        home_team: home.team.display_name.trim().to_string(),
        away_team: away.team.display_name.trim().to_string(),
        start_time,
        status,
        score,
    })
}

/// Accepts RFC 3339 and the minute-precision `YYYY-MM-DDTHH:MMZ` form.
fn parse_scoreboard_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%MZ")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Outcome;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
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

    fn event() -> OddsApiEvent {
        OddsApiEvent {
            id: "evt-1".to_string(),
            sport_key: "basketball_nba".to_string(),
            sport_title: "NBA".to_string(),
            commence_time: Some(ts(0, 30)),
            home_team: "Boston Celtics".to_string(),
            away_team: "Miami Heat".to_string(),
            bookmakers: vec![Bookmaker {
                key: "pinnacle".to_string(),
                title: "Pinnacle".to_string(),
                last_update: Some(ts(0, 10)),
                markets: vec![
                    market("h2h", vec![outcome("Boston Celtics", -180, None), outcome("Miami Heat", 155, None)]),
                    market(
                        "spreads",
                        vec![
                            outcome("Boston Celtics", -110, Some(-3.5)),
                            outcome("Miami Heat", -110, Some(3.5)),
                        ],
                    ),
                    market(
                        "totals",
                        vec![outcome("Over", -105, Some(221.5)), outcome("Under", -115, Some(221.5))],
                    ),
                ],
            }],
        }
    }

    #[test]
    fn test_full_game_markets_merge_into_one_quote() {
        let batch = normalize(RawFeed::OddsApiEvents(vec![event()]), ts(0, 15));
        assert!(batch.quarantined.is_empty());
        assert_eq!(batch.events.len(), 1);

        let quotes = &batch.events[0].quotes;
        assert_eq!(quotes.len(), 1);
        let quote = &quotes[0];
        assert_eq!(quote.provider, "the_odds_api:pinnacle");
        assert_eq!(quote.period, Period::Full);
        assert_eq!(quote.timestamp, ts(0, 10));
        assert_eq!(quote.prices.home_moneyline, Some(-180));
        assert_eq!(quote.prices.away_moneyline, Some(155));
        assert_eq!(quote.prices.home_spread, Some(-3.5));
        assert_eq!(quote.prices.away_spread, Some(3.5));
        assert_eq!(quote.prices.total_line, Some(221.5));
        assert_eq!(quote.prices.under_price, Some(-115));
    }

    #[test]
    fn test_period_feed_uses_suffixed_provider() {
        let mut evt = event();
        evt.bookmakers[0].key = "bovada".to_string();
        evt.bookmakers[0].markets = vec![market(
            "totals_h1",
            vec![outcome("Over", -110, Some(110.5)), outcome("Under", -110, Some(110.5))],
        )];
        let batch = normalize(
            RawFeed::OddsApiEvent {
                period: Period::FirstHalf,
                event: evt,
            },
            ts(0, 15),
        );
        let quote = &batch.events[0].quotes[0];
        assert_eq!(quote.provider, "the_odds_api:bovada:h1");
        assert_eq!(quote.period, Period::FirstHalf);
        assert_eq!(quote.prices.total_line, Some(110.5));
    }

    #[test]
    fn test_invalid_events_are_quarantined() {
        let mut same_team = event();
        same_team.id = "evt-2".to_string();
        same_team.away_team = "Boston Celtics".to_string();

        let mut no_start = event();
        no_start.id = "evt-3".to_string();
        no_start.commence_time = None;

        let batch = normalize(RawFeed::OddsApiEvents(vec![event(), same_team, no_start]), ts(0, 15));
        assert_eq!(batch.events.len(), 1);
        let ids: Vec<&str> = batch.quarantined.iter().map(|q| q.external_id.as_str()).collect();
        assert_eq!(ids, vec!["evt-2", "evt-3"]);
    }

    #[test]
    fn test_unknown_markets_and_outcomes_are_ignored() {
        let mut evt = event();
        evt.bookmakers[0].markets = vec![
            market("player_points", vec![outcome("Jayson Tatum", -110, Some(27.5))]),
            market("h2h", vec![outcome("Draw", 900, None)]),
        ];
        let batch = normalize(RawFeed::OddsApiEvents(vec![evt]), ts(0, 15));
        assert!(batch.events[0].quotes.is_empty());
    }

    #[test]
    fn test_scoreboard_final_and_cancelled() {
        let raw = r#"{
            "events": [
                {"id": "401", "date": "2026-01-09T00:30Z", "competitions": [{
                    "competitors": [
                        {"homeAway": "home", "score": "112", "team": {"displayName": "Boston Celtics"}},
                        {"homeAway": "away", "score": "104", "team": {"displayName": "Miami Heat"}}
                    ],
                    "status": {"type": {"name": "STATUS_FINAL", "state": "post", "completed": true}}
                }]},
                {"id": "402", "date": "2026-01-09T01:00:00Z", "competitions": [{
                    "competitors": [
                        {"homeAway": "home", "score": "0", "team": {"displayName": "Utah Jazz"}},
                        {"homeAway": "away", "score": "0", "team": {"displayName": "Denver Nuggets"}}
                    ],
                    "status": {"type": {"name": "STATUS_POSTPONED", "state": "post", "completed": false}}
                }]},
                {"id": "403", "date": "yesterday", "competitions": []}
            ]
        }"#;
        let scoreboard: Scoreboard = serde_json::from_str(raw).unwrap();
        let batch = normalize(RawFeed::Scoreboard(scoreboard), ts(3, 0));

        assert_eq!(batch.results.len(), 2);
        assert_eq!(batch.results[0].start_time, ts(0, 30));
        assert_eq!(batch.results[0].status, MatchStatus::Final);
        assert_eq!(batch.results[0].score, Some(FinalScore { home: 112, away: 104 }));
        assert_eq!(batch.results[1].status, MatchStatus::Cancelled);
        assert_eq!(batch.results[1].score, None);
        assert_eq!(batch.quarantined.len(), 1);
        assert_eq!(batch.quarantined[0].external_id, "403");
    }
}
