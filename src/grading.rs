//! Grading Engine: WIN / LOSS / PUSH / VOID for stored picks.
//!
//! The line a pick is graded against comes from a reference snapshot, not
//! from the pick itself: the latest snapshot at or before `recommended_at`
//! carrying the pick's market (pregame preferred), else the earliest snapshot
//! carrying it.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{
    CanonicalMatch, MarketSnapshot, MatchStatus, Period, Pick, PickOutcome, PickSide, PickType,
};
use crate::store::{EntityStore, GradeRecord, PickStore, SnapshotFilter, SnapshotStore, Store};

/// Who asked for a regrade and why. Logged with the new outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegradeAuthorization {
    pub operator: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GradeSummary {
    pub examined: usize,
    pub graded: usize,
    pub ungraded: usize,
    pub failed: usize,
}

fn sign_outcome(value: f64) -> PickOutcome {
    if value > 0.0 {
        PickOutcome::Win
    } else if value < 0.0 {
        PickOutcome::Loss
    } else {
        PickOutcome::Push
    }
}

/// Moneyline from the home margin. `None` for sides that are not home/away.
pub fn moneyline_outcome(side: PickSide, home_margin: f64) -> Option<PickOutcome> {
    match side {
        PickSide::Home => Some(sign_outcome(home_margin)),
        PickSide::Away => Some(sign_outcome(-home_margin)),
        PickSide::Over | PickSide::Under => None,
    }
}

/// Spread: the picked side's margin plus its line. Zero is a push.
pub fn spread_outcome(side_margin: f64, line: f64) -> PickOutcome {
    sign_outcome(side_margin + line)
}

pub fn total_outcome(side: PickSide, combined: f64, line: f64) -> Option<PickOutcome> {
    match side {
        PickSide::Over => Some(sign_outcome(combined - line)),
        PickSide::Under => Some(sign_outcome(line - combined)),
        PickSide::Home | PickSide::Away => None,
    }
}

/// Picks the reference snapshot from `history` (ascending by timestamp).
pub fn reference_snapshot<'a>(pick: &Pick, history: &'a [MarketSnapshot]) -> Option<&'a MarketSnapshot> {
    let carrying: Vec<&MarketSnapshot> = history
        .iter()
        .filter(|s| s.period == Period::Full && s.prices.carries(pick.pick_type))
        .collect();
    let before: Vec<&MarketSnapshot> = carrying
        .iter()
        .copied()
        .filter(|s| s.timestamp <= pick.recommended_at)
        .collect();

    before
        .iter()
        .rev()
        .find(|s| !s.is_live)
        .or_else(|| before.last())
        .or_else(|| carrying.first())
        .copied()
}

fn missing(pick: &Pick, reason: impl Into<String>) -> EngineError {
    EngineError::GradingDataMissing {
        pick_id: pick.id,
        reason: reason.into(),
    }
}

/// Grades `pick` against the match and its reference snapshot.
fn evaluate(pick: &Pick, m: &CanonicalMatch, reference: &MarketSnapshot) -> Result<(PickOutcome, Option<f64>)> {
    let prices = &reference.prices;
    let line = match pick.pick_type {
        PickType::Moneyline => None,
        PickType::Spread => Some(
            prices
                .spread_for(pick.side)
                .ok_or_else(|| missing(pick, "spread pick on a non-team side"))?,
        ),
        PickType::Total => Some(
            prices
                .total_line
                .ok_or_else(|| missing(pick, "reference snapshot has no total line"))?,
        ),
    };

    if m.status == MatchStatus::Cancelled {
        let outcome = match pick.pick_type {
            PickType::Moneyline => PickOutcome::Push,
            PickType::Spread | PickType::Total => PickOutcome::Void,
        };
        return Ok((outcome, line));
    }

    let score = m
        .final_score
        .ok_or_else(|| missing(pick, "match is final without a score"))?;

    let outcome = match (pick.pick_type, line) {
        (PickType::Moneyline, _) => moneyline_outcome(pick.side, score.home_margin()),
        (PickType::Spread, Some(line)) => {
            let side_margin = match pick.side {
                PickSide::Away => -score.home_margin(),
                _ => score.home_margin(),
            };
            Some(spread_outcome(side_margin, line))
        }
        (PickType::Total, Some(line)) => total_outcome(pick.side, score.total(), line),
        _ => None,
    };
    outcome
        .map(|o| (o, line))
        .ok_or_else(|| missing(pick, format!("side {} does not fit {}", pick.side.as_str(), pick.pick_type.as_str())))
}

#[derive(Clone)]
pub struct GradingEngine {
    store: Arc<dyn Store>,
}

impl GradingEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Grades a pick once. An already graded pick is returned unchanged; a pick
    /// whose data is not ready stays `UNGRADED` with the reason logged.
    pub async fn grade(&self, pick_id: Uuid) -> Result<Pick> {
        let pick = self.require_pick(pick_id).await?;
        if pick.is_graded() {
            return Ok(pick);
        }

        match self.compute(&pick).await {
            Ok(record) => {
                let stored = self.store.record_grade(&record, false).await?;
                info!(
                    pick_id = %pick_id,
                    outcome = stored.outcome.as_str(),
                    reference_snapshot = ?stored.reference_snapshot,
                    "Pick graded"
                );
                Ok(stored)
            }
            Err(EngineError::GradingDataMissing { reason, .. }) => {
                warn!(pick_id = %pick_id, reason = %reason, "Pick left ungraded");
                Ok(pick)
            }
            Err(e) => Err(e),
        }
    }

    /// Re-evaluates a pick and overwrites its stored grade.
    pub async fn regrade(&self, pick_id: Uuid, authorization: &RegradeAuthorization) -> Result<Pick> {
        if authorization.operator.trim().is_empty() {
            return Err(EngineError::Auth("regrade requires an operator".to_string()));
        }
        let pick = self.require_pick(pick_id).await?;
        let record = self.compute(&pick).await?;
        let stored = self.store.record_grade(&record, true).await?;

        warn!(
            pick_id = %pick_id,
            operator = %authorization.operator,
            reason = %authorization.reason,
            previous = pick.outcome.as_str(),
            outcome = stored.outcome.as_str(),
            regrade_count = stored.regrade_count,
            "Pick regraded"
        );
        Ok(stored)
    }

    /// Grades every ungraded pick. One pick failing does not stop the rest.
    pub async fn grade_pending(&self) -> Result<GradeSummary> {
        let picks = self.store.ungraded_picks().await?;
        let mut summary = GradeSummary {
            examined: picks.len(),
            ..Default::default()
        };

        for pick in picks {
            match self.grade(pick.id).await {
                Ok(p) if p.is_graded() => summary.graded += 1,
                Ok(_) => summary.ungraded += 1,
                Err(e) => {
                    warn!(pick_id = %pick.id, error = %e, "Grading failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            examined = summary.examined,
            graded = summary.graded,
            ungraded = summary.ungraded,
            failed = summary.failed,
            "Pending picks graded"
        );
        Ok(summary)
    }

    async fn compute(&self, pick: &Pick) -> Result<GradeRecord> {
        let m = self
            .store
            .get_match(pick.match_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("match {}", pick.match_id)))?;
        if !m.status.is_terminal() {
            return Err(missing(pick, format!("match is {}", m.status.as_str())));
        }

        let history = self
            .store
            .snapshots_for_match(pick.match_id, &SnapshotFilter::default())
            .await?;
        let reference = reference_snapshot(pick, &history)
            .ok_or_else(|| missing(pick, format!("no snapshot carries {}", pick.pick_type.as_str())))?;

        let (outcome, reference_line) = evaluate(pick, &m, reference)?;
        Ok(GradeRecord {
            pick_id: pick.id,
            outcome,
            graded_at: Utc::now(),
            reference_snapshot: reference.id,
            reference_line,
        })
    }

    async fn require_pick(&self, pick_id: Uuid) -> Result<Pick> {
        self.store
            .get_pick(pick_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("pick {}", pick_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FinalScore, MarketPrices};
    use crate::snapshots::{LiveClassifier, SnapshotService};
    use crate::store::MemoryStore;
    use chrono::{DateTime, TimeZone};

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 9, h, m, 0).unwrap()
    }

    struct Fixture {
        store: MemoryStore,
        snapshots: SnapshotService,
        engine: GradingEngine,
        match_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let m = CanonicalMatch {
            id: Uuid::new_v4(),
            league: "ncaab".to_string(),
            home_team_id: Uuid::new_v4(),
            away_team_id: Uuid::new_v4(),
            start_time: at(0, 30),
            status: MatchStatus::Scheduled,
            final_score: None,
            verified: true,
        };
        let match_id = m.id;
        store.insert_match(m).await.unwrap();
        let shared: Arc<dyn Store> = Arc::new(store.clone());
        Fixture {
            snapshots: SnapshotService::new(shared.clone(), LiveClassifier::default()),
            engine: GradingEngine::new(shared),
            store,
            match_id,
        }
    }

    fn full_market(home_spread: f64, total: f64) -> MarketPrices {
        MarketPrices {
            home_moneyline: Some(-160),
            away_moneyline: Some(140),
            home_spread: Some(home_spread),
            away_spread: Some(-home_spread),
            home_spread_price: Some(-110),
            away_spread_price: Some(-110),
            total_line: Some(total),
            over_price: Some(-110),
            under_price: Some(-110),
        }
    }

    async fn finish(f: &Fixture, home: u32, away: u32) {
        f.store
            .update_match_result(f.match_id, MatchStatus::Final, Some(FinalScore { home, away }))
            .await
            .unwrap();
    }

    async fn pick(f: &Fixture, pick_type: PickType, side: PickSide, at_time: DateTime<Utc>) -> Uuid {
        let p = Pick::new(f.match_id, pick_type, side, None, at_time);
        let id = p.id;
        f.store.insert_pick(p).await.unwrap();
        id
    }

    #[test]
    fn test_pure_rules() {
        assert_eq!(spread_outcome(3.5, -3.5), PickOutcome::Push);
        assert_eq!(spread_outcome(4.0, -3.5), PickOutcome::Win);
        assert_eq!(spread_outcome(-2.0, 3.5), PickOutcome::Win);
        assert_eq!(spread_outcome(-4.0, 3.5), PickOutcome::Loss);
        assert_eq!(moneyline_outcome(PickSide::Away, -3.0), Some(PickOutcome::Win));
        assert_eq!(moneyline_outcome(PickSide::Home, 0.0), Some(PickOutcome::Push));
        assert_eq!(moneyline_outcome(PickSide::Over, 5.0), None);
        assert_eq!(total_outcome(PickSide::Over, 145.0, 144.5), Some(PickOutcome::Win));
        assert_eq!(total_outcome(PickSide::Under, 144.0, 144.0), Some(PickOutcome::Push));
    }

    #[tokio::test]
    async fn test_spread_uses_pregame_reference_line() {
        let f = fixture().await;
        f.snapshots
            .append(f.match_id, "the_odds_api:pinnacle", at(0, 10), full_market(-3.5, 141.5))
            .await
            .unwrap();
        // Live line after the pick; must not be used.
        f.snapshots
            .append(f.match_id, "the_odds_api:pinnacle", at(0, 50), full_market(-9.5, 150.5))
            .await
            .unwrap();
        let id = pick(&f, PickType::Spread, PickSide::Home, at(0, 20)).await;
        finish(&f, 75, 71).await;

        let graded = f.engine.grade(id).await.unwrap();
        assert_eq!(graded.outcome, PickOutcome::Win);
        assert_eq!(graded.reference_line, Some(-3.5));
    }

    #[tokio::test]
    async fn test_falls_back_to_earliest_snapshot_after_recommendation() {
        let f = fixture().await;
        f.snapshots
            .append(f.match_id, "the_odds_api:pinnacle", at(0, 25), full_market(-2.0, 140.0))
            .await
            .unwrap();
        f.snapshots
            .append(f.match_id, "the_odds_api:pinnacle", at(0, 28), full_market(-1.0, 139.0))
            .await
            .unwrap();
        let id = pick(&f, PickType::Total, PickSide::Under, at(0, 0)).await;
        finish(&f, 70, 70).await;

        let graded = f.engine.grade(id).await.unwrap();
        assert_eq!(graded.reference_line, Some(140.0));
        assert_eq!(graded.outcome, PickOutcome::Push);
    }

    #[tokio::test]
    async fn test_not_final_stays_ungraded() {
        let f = fixture().await;
        f.snapshots
            .append(f.match_id, "the_odds_api:pinnacle", at(0, 10), full_market(-3.5, 141.5))
            .await
            .unwrap();
        let id = pick(&f, PickType::Moneyline, PickSide::Home, at(0, 20)).await;

        let pick = f.engine.grade(id).await.unwrap();
        assert_eq!(pick.outcome, PickOutcome::Ungraded);
        assert!(pick.graded_at.is_none());
    }

    #[tokio::test]
    async fn test_missing_market_stays_ungraded() {
        let f = fixture().await;
        let moneyline_only = MarketPrices {
            home_moneyline: Some(-150),
            away_moneyline: Some(130),
            ..Default::default()
        };
        f.snapshots
            .append(f.match_id, "the_odds_api:pinnacle", at(0, 10), moneyline_only)
            .await
            .unwrap();
        let id = pick(&f, PickType::Total, PickSide::Over, at(0, 20)).await;
        finish(&f, 80, 60).await;

        assert_eq!(f.engine.grade(id).await.unwrap().outcome, PickOutcome::Ungraded);
    }

    #[tokio::test]
    async fn test_cancelled_match_pushes_moneyline_and_voids_spread() {
        let f = fixture().await;
        f.snapshots
            .append(f.match_id, "the_odds_api:pinnacle", at(0, 10), full_market(-3.5, 141.5))
            .await
            .unwrap();
        let ml = pick(&f, PickType::Moneyline, PickSide::Away, at(0, 20)).await;
        let spread = pick(&f, PickType::Spread, PickSide::Away, at(0, 20)).await;
        f.store
            .update_match_result(f.match_id, MatchStatus::Cancelled, None)
            .await
            .unwrap();

        assert_eq!(f.engine.grade(ml).await.unwrap().outcome, PickOutcome::Push);
        assert_eq!(f.engine.grade(spread).await.unwrap().outcome, PickOutcome::Void);
    }

    #[tokio::test]
    async fn test_grade_twice_is_noop_and_regrade_counts() {
        let f = fixture().await;
        f.snapshots
            .append(f.match_id, "the_odds_api:pinnacle", at(0, 10), full_market(-3.5, 141.5))
            .await
            .unwrap();
        let id = pick(&f, PickType::Moneyline, PickSide::Home, at(0, 20)).await;
        finish(&f, 60, 64).await;

        let first = f.engine.grade(id).await.unwrap();
        let second = f.engine.grade(id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.outcome, PickOutcome::Loss);

        // Score correction, then an authorized regrade.
        finish(&f, 66, 64).await;
        let auth = RegradeAuthorization {
            operator: "ops".to_string(),
            reason: "stat correction".to_string(),
        };
        let regraded = f.engine.regrade(id, &auth).await.unwrap();
        assert_eq!(regraded.outcome, PickOutcome::Win);
        assert_eq!(regraded.regrade_count, 1);

        let anonymous = RegradeAuthorization {
            operator: " ".to_string(),
            reason: String::new(),
        };
        assert!(matches!(
            f.engine.regrade(id, &anonymous).await,
            Err(EngineError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_grade_pending_isolates_picks() {
        let f = fixture().await;
        f.snapshots
            .append(f.match_id, "the_odds_api:pinnacle", at(0, 10), full_market(-3.5, 141.5))
            .await
            .unwrap();
        pick(&f, PickType::Spread, PickSide::Away, at(0, 20)).await;
        pick(&f, PickType::Total, PickSide::Over, at(0, 20)).await;
        // Nonsense pick: moneyline on "over".
        pick(&f, PickType::Moneyline, PickSide::Over, at(0, 20)).await;
        finish(&f, 72, 70).await;

        let summary = f.engine.grade_pending().await.unwrap();
        assert_eq!(summary.examined, 3);
        assert_eq!(summary.graded, 2);
        assert_eq!(summary.ungraded, 1);
        assert_eq!(summary.failed, 0);
    }
}
