mod common;

use std::time::Duration;

use common::*;
use market_ingestion::grading::RegradeAuthorization;
use market_ingestion::model::{MatchStatus, Pick, PickOutcome, PickSide, PickType};
use market_ingestion::orchestrator::{LeagueStatus, RunState};
use market_ingestion::store::{EntityStore, PickStore, SnapshotFilter};

fn two_games() -> Vec<market_ingestion::provider::OddsApiEvent> {
    vec![
        odds_event("evt-1", "Boston Celtics", "Miami Heat", ts(0, 30), ts(0, 10), -3.5),
        odds_event("evt-2", "Denver Nuggets", "Utah Jazz", ts(2, 0), ts(0, 10), -9.0),
    ]
}

#[tokio::test]
async fn test_quota_exhaustion_is_isolated_to_one_league() {
    let provider = ScriptedProvider::new()
        .league("a", LeagueScript::events(two_games()))
        .league("b", LeagueScript::new(OddsStep::Quota))
        .league("c", LeagueScript::events(vec![odds_event(
            "evt-9",
            "Duke",
            "North Carolina",
            ts(1, 0),
            ts(0, 15),
            -4.5,
        )]));
    let (engine, store, _) = engine(test_config(&["a", "b", "c"]), provider);

    let result = engine.run_ingestion(None).await.unwrap();

    assert_eq!(result.state, RunState::Partial);
    assert!(!result.timed_out);
    let a = result.league("a").unwrap();
    let b = result.league("b").unwrap();
    let c = result.league("c").unwrap();
    assert_eq!(a.status, LeagueStatus::Completed);
    assert_eq!(b.status, LeagueStatus::Partial);
    assert_eq!(c.status, LeagueStatus::Completed);
    assert!(b.error.as_deref().unwrap().contains("quota"));

    assert_eq!(a.counts.events_fetched, 2);
    assert_eq!(a.counts.matches_resolved, 2);
    assert_eq!(a.counts.snapshots_appended, 2);
    assert_eq!(c.counts.snapshots_appended, 1);
    assert_eq!(store.snapshot_count().await, 3);
}

#[tokio::test]
async fn test_rerun_produces_no_duplicates() {
    let provider = ScriptedProvider::new().league("a", LeagueScript::events(two_games()));
    let (engine, store, _) = engine(test_config(&["a"]), provider);

    let first = engine.run_ingestion(None).await.unwrap();
    let mappings = store.mapping_count().await;
    let teams = store.team_count().await;
    let second = engine.run_ingestion(None).await.unwrap();

    assert_eq!(first.state, RunState::Completed);
    assert_eq!(second.state, RunState::Completed);
    let counts = &second.league("a").unwrap().counts;
    assert_eq!(counts.snapshots_appended, 0);
    assert_eq!(counts.duplicates_skipped, 2);
    assert_eq!(store.snapshot_count().await, 2);
    assert_eq!(store.mapping_count().await, mappings);
    assert_eq!(store.team_count().await, teams);
    assert_eq!(store.matches().await.len(), 2);
}

#[tokio::test]
async fn test_invalid_events_are_quarantined_and_league_continues() {
    let mut broken = odds_event("evt-3", "Chicago Bulls", "Chicago Bulls", ts(1, 0), ts(0, 10), -1.0);
    broken.bookmakers.clear();
    let mut undated = odds_event("evt-4", "Phoenix Suns", "Dallas Mavericks", ts(1, 0), ts(0, 10), -2.0);
    undated.commence_time = None;

    let mut events = two_games();
    events.push(broken);
    events.push(undated);
    let provider = ScriptedProvider::new().league("a", LeagueScript::events(events));
    let (engine, _store, _) = engine(test_config(&["a"]), provider);

    let result = engine.run_ingestion(None).await.unwrap();
    let a = result.league("a").unwrap();
    assert_eq!(a.status, LeagueStatus::Completed);
    assert_eq!(a.counts.events_fetched, 4);
    assert_eq!(a.counts.events_quarantined, 2);
    assert_eq!(a.counts.snapshots_appended, 2);
}

#[tokio::test]
async fn test_malformed_upstream_fails_league_with_preview() {
    let body = format!("<html>{}</html>", "x".repeat(500));
    let provider = ScriptedProvider::new().league("a", LeagueScript::new(OddsStep::Malformed(200, body)));
    let (engine, _store, _) = engine(test_config(&["a"]), provider);

    let result = engine.run_ingestion(None).await.unwrap();
    let a = result.league("a").unwrap();

    assert_eq!(result.state, RunState::Failed);
    assert_eq!(a.status, LeagueStatus::Failed);
    assert_eq!(a.upstream_status, Some(200));
    let preview = a.preview.as_deref().unwrap();
    assert!(preview.starts_with("<html>"));
    assert!(preview.chars().count() <= 201);
}

#[tokio::test]
async fn test_deadline_cancels_slow_league_and_keeps_finished_work() {
    let provider = ScriptedProvider::new()
        .league("a", LeagueScript::events(two_games()))
        .league("slow", LeagueScript::new(OddsStep::Hang));
    let config = with_budget(test_config(&["a", "slow"]), Duration::from_millis(300));
    let (engine, store, _) = engine(config, provider);

    let result = engine.run_ingestion(None).await.unwrap();

    assert!(result.timed_out);
    assert_eq!(result.state, RunState::Partial);
    assert_eq!(result.league("a").unwrap().status, LeagueStatus::Completed);
    assert_eq!(result.league("slow").unwrap().status, LeagueStatus::TimedOut);
    assert_eq!(store.snapshot_count().await, 2);
}

#[tokio::test]
async fn test_period_quota_keeps_full_game_snapshots() {
    let provider = ScriptedProvider::new().league(
        "b",
        LeagueScript::events(two_games()).with_period(PeriodStep::QuotaAfter(1)),
    );
    let mut config = test_config(&["b"]);
    config.period_markets = true;
    let (engine, store, _) = engine(config, provider);

    let result = engine.run_ingestion(None).await.unwrap();
    let b = result.league("b").unwrap();

    assert_eq!(b.status, LeagueStatus::Partial);
    assert!(b.error.as_deref().unwrap().contains("period markets"));
    // Two full-game snapshots plus the one first-half quote served before the quota ran out.
    assert_eq!(b.counts.snapshots_appended, 3);
    assert_eq!(store.snapshot_count().await, 3);
}

#[tokio::test]
async fn test_period_fetch_failures_mark_league_partial() {
    let provider = ScriptedProvider::new().league(
        "a",
        LeagueScript::events(two_games())
            .with_period(PeriodStep::Broken(200, "<html>maintenance</html>".to_string())),
    );
    let mut config = test_config(&["a"]);
    config.period_markets = true;
    let (engine, store, _) = engine(config, provider);

    let result = engine.run_ingestion(None).await.unwrap();
    let a = result.league("a").unwrap();

    assert_eq!(result.state, RunState::Partial);
    assert_eq!(a.status, LeagueStatus::Partial);
    // Two events, two halves each.
    assert_eq!(a.counts.period_fetch_failures, 4);
    assert!(a.error.as_deref().unwrap().contains("period odds"));
    assert_eq!(a.upstream_status, Some(200));
    assert_eq!(a.preview.as_deref(), Some("<html>maintenance</html>"));
    assert_eq!(a.counts.snapshots_appended, 2);
    assert_eq!(store.snapshot_count().await, 2);
}

#[tokio::test]
async fn test_moved_start_reclassifies_earlier_snapshots() {
    // Quoted ten minutes after the announced start: live on the first run.
    let first_feed = ScriptedProvider::new().league(
        "a",
        LeagueScript::events(vec![odds_event("evt-1", "Boston Celtics", "Miami Heat", ts(0, 30), ts(0, 40), -3.5)]),
    );
    let (first, store, _) = engine(test_config(&["a"]), first_feed);
    let result = first.run_ingestion(None).await.unwrap();
    assert_eq!(result.league("a").unwrap().counts.snapshots_appended, 1);

    let game = store.matches().await.remove(0);
    let live = first.snapshots().history(game.id, &SnapshotFilter::live(true)).await.unwrap();
    assert_eq!(live.len(), 1);

    // The feed now reports tip-off thirty minutes later.
    let second_feed = ScriptedProvider::new().league(
        "a",
        LeagueScript::events(vec![odds_event("evt-1", "Boston Celtics", "Miami Heat", ts(1, 0), ts(0, 50), -3.0)]),
    );
    let (second, store, _) = engine_with_store(test_config(&["a"]), second_feed, store);
    let result = second.run_ingestion(None).await.unwrap();
    let counts = &result.league("a").unwrap().counts;

    assert_eq!(counts.snapshots_reclassified, 1);
    assert_eq!(counts.snapshots_appended, 1);
    assert_eq!(store.matches().await.len(), 1);
    assert_eq!(store.get_match(game.id).await.unwrap().unwrap().start_time, ts(1, 0));

    let pregame = second.snapshots().history(game.id, &SnapshotFilter::live(false)).await.unwrap();
    assert_eq!(pregame.len(), 2);
    assert_eq!(pregame[0].id, live[0].id);
    assert!(second.snapshots().history(game.id, &SnapshotFilter::live(true)).await.unwrap().is_empty());

    // Same start again: nothing left to correct.
    let third = second.run_ingestion(None).await.unwrap();
    assert_eq!(third.league("a").unwrap().counts.snapshots_reclassified, 0);
}

#[tokio::test]
async fn test_results_feed_enables_grading() {
    let provider = ScriptedProvider::new().league(
        "a",
        LeagueScript::events(two_games()).with_results(vec![final_result(
            "401",
            "Boston Celtics",
            "Miami Heat",
            "2026-01-09T00:30Z",
            112,
            101,
        )]),
    );
    let (engine, store, _) = engine(test_config(&["a"]), provider);

    let result = engine.run_ingestion(None).await.unwrap();
    assert_eq!(result.league("a").unwrap().counts.results_applied, 1);

    let finished: Vec<_> = store
        .matches()
        .await
        .into_iter()
        .filter(|m| m.status == MatchStatus::Final)
        .collect();
    assert_eq!(finished.len(), 1);
    let game = &finished[0];

    let history = engine
        .snapshots()
        .history(game.id, &SnapshotFilter::live(false))
        .await
        .unwrap();
    assert_eq!(history.len(), 1);

    let pick = Pick::new(game.id, PickType::Spread, PickSide::Home, Some(-3.5), ts(0, 20));
    let pick_id = pick.id;
    store.insert_pick(pick).await.unwrap();

    let graded = engine.grading().grade(pick_id).await.unwrap();
    assert_eq!(graded.outcome, PickOutcome::Win);
    assert_eq!(graded.reference_snapshot, Some(history[0].id));

    // Re-grading without override is a no-op.
    let again = engine.grading().grade(pick_id).await.unwrap();
    assert_eq!(again, graded);

    let summary = engine.grading().grade_pending().await.unwrap();
    assert_eq!(summary.examined, 0);

    let regraded = engine
        .grading()
        .regrade(
            pick_id,
            &RegradeAuthorization {
                operator: "ops".to_string(),
                reason: "audit".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(regraded.outcome, PickOutcome::Win);
    assert_eq!(regraded.regrade_count, 1);
    assert_eq!(store.get_match(game.id).await.unwrap().unwrap().final_score.unwrap().home, 112);
}

#[tokio::test]
async fn test_overlapping_runs_are_refused() {
    let provider = ScriptedProvider::new().league("slow", LeagueScript::new(OddsStep::Hang));
    let config = with_budget(test_config(&["slow"]), Duration::from_millis(300));
    let (engine, _store, _) = engine(config, provider);

    let background = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_ingestion(None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let refused = engine.run_ingestion(None).await;
    tokio_test::assert_err!(refused);
    let finished = background.await.unwrap();
    tokio_test::assert_ok!(finished);
}
