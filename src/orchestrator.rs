//! Ingestion Orchestrator: one bounded, cancellable run over a set of leagues.
//!
//! Leagues are isolated from each other. A league that fails, runs out of
//! provider quota or is cut off by the deadline is reported as such and the
//! others carry on; whatever a league committed before stopping stays valid.

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{Config, League};
use crate::error::{EngineError, Result};
use crate::model::{MarketSnapshot, MatchId, MatchStatus, Period};
use crate::normalize::{normalize, NormalizedQuote};
use crate::provider::{FeedProvider, ODDS_API_FEED};
use crate::publish::SnapshotPublisher;
use crate::resolver::EntityResolver;
use crate::snapshots::{AppendOutcome, SnapshotService};
use crate::store::{EntityStore, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Partial,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Running => "RUNNING",
            RunState::Completed => "COMPLETED",
            RunState::Partial => "PARTIAL",
            RunState::Failed => "FAILED",
        }
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Pending, RunState::Running)
                | (RunState::Running, RunState::Completed)
                | (RunState::Running, RunState::Partial)
                | (RunState::Running, RunState::Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionRun {
    pub run_id: Uuid,
    pub state: RunState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl IngestionRun {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            state: RunState::Pending,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.state.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        match next {
            RunState::Running => self.started_at = Some(Utc::now()),
            RunState::Completed | RunState::Partial | RunState::Failed => {
                self.finished_at = Some(Utc::now())
            }
            RunState::Pending => {}
        }
        self.state = next;
        Ok(())
    }
}

impl Default for IngestionRun {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeagueStatus {
    Completed,
    Partial,
    Failed,
    /// Cut off by the run deadline. Counts as partial.
    TimedOut,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeagueCounts {
    pub events_fetched: usize,
    pub events_quarantined: usize,
    pub matches_resolved: usize,
    pub snapshots_appended: usize,
    pub duplicates_skipped: usize,
    pub ambiguities_recorded: usize,
    pub snapshots_reclassified: usize,
    pub results_applied: usize,
    pub period_fetch_failures: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeagueReport {
    pub league: String,
    pub status: LeagueStatus,
    pub counts: LeagueCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

impl LeagueReport {
    fn new(league: &str, status: LeagueStatus, counts: LeagueCounts) -> Self {
        Self {
            league: league.to_string(),
            status,
            counts,
            error: None,
            upstream_status: None,
            preview: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub state: RunState,
    pub timed_out: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub leagues: Vec<LeagueReport>,
}

impl RunResult {
    pub fn league(&self, id: &str) -> Option<&LeagueReport> {
        self.leagues.iter().find(|l| l.league == id)
    }
}

/// Overall state from per-league outcomes.
pub fn fold_state(reports: &[LeagueReport]) -> RunState {
    if reports.iter().all(|r| r.status == LeagueStatus::Completed) {
        RunState::Completed
    } else if reports.iter().all(|r| r.status == LeagueStatus::Failed) {
        RunState::Failed
    } else {
        RunState::Partial
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub run_budget: Duration,
    /// How long cancelled leagues get to report after the deadline.
    pub shutdown_grace: Duration,
    pub max_parallel_leagues: usize,
    pub period_markets: bool,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            run_budget: config.run_budget,
            shutdown_grace: config.shutdown_grace(),
            max_parallel_leagues: config.max_parallel_leagues,
            period_markets: config.period_markets,
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What one league has done so far; survives an early return.
#[derive(Default)]
struct LeagueProgress {
    counts: LeagueCounts,
    appended: Vec<MarketSnapshot>,
    partial: Option<String>,
    /// First malformed upstream answer seen by a step that carried on.
    upstream: Option<(u16, String)>,
}

impl LeagueProgress {
    fn mark_partial(&mut self, reason: String) {
        self.partial.get_or_insert(reason);
    }
}

pub struct Orchestrator {
    provider: Arc<dyn FeedProvider>,
    store: Arc<dyn Store>,
    resolver: EntityResolver,
    snapshots: SnapshotService,
    publisher: Arc<dyn SnapshotPublisher>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn FeedProvider>,
        store: Arc<dyn Store>,
        resolver: EntityResolver,
        snapshots: SnapshotService,
        publisher: Arc<dyn SnapshotPublisher>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            provider,
            store,
            resolver,
            snapshots,
            publisher,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Runs every league once within the run budget.
    pub async fn run(&self, leagues: &[League]) -> Result<RunResult> {
        let mut run = IngestionRun::new();
        run.transition(RunState::Running)?;
        info!(
            run_id = %run.run_id,
            leagues = leagues.len(),
            budget_secs = self.settings.run_budget.as_secs_f64(),
            "Ingestion run started"
        );

        let cancel = CancellationToken::new();
        // Owned leagues keep the stream's futures free of a borrowed lifetime.
        let pending = futures::stream::iter(leagues.to_vec())
            .map(|league| {
                let cancel = cancel.clone();
                async move { self.run_league(&league, &cancel).await }
            })
            .buffer_unordered(self.settings.max_parallel_leagues.max(1));
        tokio::pin!(pending);

        let mut reports: Vec<LeagueReport> = Vec::with_capacity(leagues.len());
        let finished = tokio::select! {
            _ = drain(pending.as_mut(), &mut reports) => true,
            _ = tokio::time::sleep(self.settings.run_budget) => false,
        };

        let timed_out = !finished;
        if timed_out {
            warn!(
                run_id = %run.run_id,
                reported = reports.len(),
                "Run budget elapsed; cancelling in-flight leagues"
            );
            cancel.cancel();
            let drained =
                tokio::time::timeout(self.settings.shutdown_grace, drain(pending.as_mut(), &mut reports)).await;
            if drained.is_err() {
                warn!(run_id = %run.run_id, "Leagues still running after shutdown grace");
            }
        }

        // Report in the order leagues were requested; unreported ones timed out.
        let mut ordered = Vec::with_capacity(leagues.len());
        for league in leagues {
            match reports.iter().position(|r| r.league == league.id) {
                Some(i) => ordered.push(reports.swap_remove(i)),
                None => ordered.push(LeagueReport {
                    error: Some("no report before shutdown".to_string()),
                    ..LeagueReport::new(&league.id, LeagueStatus::TimedOut, LeagueCounts::default())
                }),
            }
        }

        run.transition(fold_state(&ordered))?;
        info!(
            run_id = %run.run_id,
            state = run.state.as_str(),
            timed_out,
            "Ingestion run finished"
        );

        Ok(RunResult {
            run_id: run.run_id,
            state: run.state,
            timed_out,
            started_at: run.started_at,
            finished_at: run.finished_at,
            leagues: ordered,
        })
    }

    async fn run_league(&self, league: &League, cancel: &CancellationToken) -> LeagueReport {
        let mut progress = LeagueProgress::default();
        let outcome = self.ingest_league(league, cancel, &mut progress).await;

        if !progress.appended.is_empty() {
            if let Err(e) = self.publisher.publish(&progress.appended).await {
                warn!(league = %league.id, error = %e, "Snapshot publish failed");
            }
        }

        let counts = progress.counts;
        let (upstream_status, preview) = progress.upstream.unzip();
        let report = match outcome {
            Ok(()) => match progress.partial {
                None => LeagueReport::new(&league.id, LeagueStatus::Completed, counts),
                Some(reason) => LeagueReport {
                    error: Some(reason),
                    upstream_status,
                    preview,
                    ..LeagueReport::new(&league.id, LeagueStatus::Partial, counts)
                },
            },
            Err(EngineError::Cancelled) => LeagueReport {
                error: Some("cancelled at run deadline".to_string()),
                ..LeagueReport::new(&league.id, LeagueStatus::TimedOut, counts)
            },
            Err(e @ EngineError::QuotaExceeded(_)) => LeagueReport {
                error: Some(e.to_string()),
                ..LeagueReport::new(&league.id, LeagueStatus::Partial, counts)
            },
            Err(EngineError::UpstreamMalformed { status, preview }) => LeagueReport {
                error: Some("malformed upstream response".to_string()),
                upstream_status: Some(status),
                preview: Some(preview),
                ..LeagueReport::new(&league.id, LeagueStatus::Failed, counts)
            },
            Err(e) => LeagueReport {
                error: Some(e.to_string()),
                ..LeagueReport::new(&league.id, LeagueStatus::Failed, counts)
            },
        };

        match report.status {
            LeagueStatus::Completed => info!(league = %league.id, counts = ?report.counts, "League completed"),
            LeagueStatus::Failed => error!(
                league = %league.id,
                error = ?report.error,
                upstream_status = ?report.upstream_status,
                preview = ?report.preview,
                "League failed"
            ),
            _ => warn!(
                league = %league.id,
                status = ?report.status,
                error = ?report.error,
                counts = ?report.counts,
                "League finished early"
            ),
        }
        report
    }

    async fn ingest_league(
        &self,
        league: &League,
        cancel: &CancellationToken,
        progress: &mut LeagueProgress,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let raw = self.provider.fetch_odds(league, cancel).await?;
        let batch = normalize(raw, Utc::now());
        progress.counts.events_fetched = batch.events.len() + batch.quarantined.len();
        progress.counts.events_quarantined = batch.quarantined.len();

        let mut resolved: Vec<(String, MatchId)> = Vec::with_capacity(batch.events.len());
        for event in batch.events {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let match_id = match self
                .resolve_event(
                    league,
                    &event.feed,
                    &event.external_id,
                    &event.home_team,
                    &event.away_team,
                    event.start_time,
                    progress,
                )
                .await
            {
                Ok(id) => id,
                Err(EngineError::EntityAmbiguous { provider, external_id }) => {
                    warn!(league = %league.id, %provider, %external_id, "Event skipped: both sides resolved to one team");
                    progress.counts.events_quarantined += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            // Corrections come from the odds feed only; results feeds may report a different kickoff.
            if event.feed == ODDS_API_FEED {
                if let Some(report) = self.snapshots.correct_start_time(match_id, event.start_time).await? {
                    progress.counts.snapshots_reclassified += report.corrected.len();
                }
            }

            self.append_quotes(match_id, event.quotes, progress).await?;
            resolved.push((event.external_id, match_id));
        }

        if self.settings.period_markets {
            self.ingest_period_markets(league, &resolved, cancel, progress).await?;
        }

        self.ingest_results(league, cancel, progress).await
    }

    /// Half-game prices per event. Quota exhaustion keeps what the full-game
    /// pass committed and marks the league partial. Other fetch failures skip
    /// the event, are counted and also mark the league partial.
    async fn ingest_period_markets(
        &self,
        league: &League,
        resolved: &[(String, MatchId)],
        cancel: &CancellationToken,
        progress: &mut LeagueProgress,
    ) -> Result<()> {
        for period in [Period::FirstHalf, Period::SecondHalf] {
            for (event_id, match_id) in resolved {
                let raw = match self.provider.fetch_period_odds(league, event_id, period, cancel).await {
                    Ok(Some(raw)) => raw,
                    Ok(None) => continue,
                    Err(EngineError::QuotaExceeded(reason)) => {
                        warn!(league = %league.id, period = period.as_str(), %reason, "Quota exhausted during period markets");
                        progress.mark_partial(format!("period markets halted: {}", reason));
                        return Ok(());
                    }
                    Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                    Err(e) => {
                        warn!(league = %league.id, %event_id, period = period.as_str(), error = %e, "Period odds fetch failed");
                        progress.counts.period_fetch_failures += 1;
                        if let EngineError::UpstreamMalformed { status, preview } = &e {
                            progress.upstream.get_or_insert((*status, preview.clone()));
                        }
                        progress.mark_partial(format!("period odds fetch failed: {}", e));
                        continue;
                    }
                };

                let batch = normalize(raw, Utc::now());
                progress.counts.events_quarantined += batch.quarantined.len();
                for event in batch.events {
                    self.append_quotes(*match_id, event.quotes, progress).await?;
                }
            }
        }
        Ok(())
    }

    /// Moves matches reported live, final or cancelled by the results feed.
    async fn ingest_results(
        &self,
        league: &League,
        cancel: &CancellationToken,
        progress: &mut LeagueProgress,
    ) -> Result<()> {
        let raw = match self.provider.fetch_results(league, cancel).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(()),
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) => {
                warn!(league = %league.id, error = %e, "Results fetch failed");
                if let EngineError::UpstreamMalformed { status, preview } = &e {
                    progress.upstream.get_or_insert((*status, preview.clone()));
                }
                progress.mark_partial(format!("results feed: {}", e));
                return Ok(());
            }
        };

        let batch = normalize(raw, Utc::now());
        progress.counts.events_quarantined += batch.quarantined.len();
        for result in batch.results {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if result.status == MatchStatus::Scheduled {
                continue;
            }
            let match_id = match self
                .resolve_event(
                    league,
                    &result.feed,
                    &result.external_id,
                    &result.home_team,
                    &result.away_team,
                    result.start_time,
                    progress,
                )
                .await
            {
                Ok(id) => id,
                Err(EngineError::EntityAmbiguous { provider, external_id }) => {
                    warn!(league = %league.id, %provider, %external_id, "Result skipped: both sides resolved to one team");
                    progress.counts.events_quarantined += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let current = self.store.get_match(match_id).await?;
            if current.map_or(false, |m| m.status == result.status && m.final_score == result.score) {
                continue;
            }
            self.store
                .update_match_result(match_id, result.status, result.score)
                .await?;
            if result.status.is_terminal() {
                progress.counts.results_applied += 1;
                info!(
                    league = %league.id,
                    match_id = %match_id,
                    status = result.status.as_str(),
                    score = ?result.score,
                    "Match result recorded"
                );
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn resolve_event(
        &self,
        league: &League,
        feed: &str,
        external_id: &str,
        home_team: &str,
        away_team: &str,
        start_time: DateTime<Utc>,
        progress: &mut LeagueProgress,
    ) -> Result<MatchId> {
        // Providers without team ids: the raw name is the external id.
        let home = self.resolver.resolve_team(feed, home_team, home_team, &league.id).await?;
        let away = self.resolver.resolve_team(feed, away_team, away_team, &league.id).await?;
        progress.counts.ambiguities_recorded +=
            usize::from(home.is_ambiguous()) + usize::from(away.is_ambiguous());

        if home.canonical_id == away.canonical_id {
            return Err(EngineError::EntityAmbiguous {
                provider: feed.to_string(),
                external_id: external_id.to_string(),
            });
        }

        let m = self
            .resolver
            .resolve_match(
                feed,
                external_id,
                &league.id,
                home.canonical_id,
                away.canonical_id,
                start_time,
            )
            .await?;
        progress.counts.ambiguities_recorded += usize::from(m.is_ambiguous());
        progress.counts.matches_resolved += 1;
        Ok(m.canonical_id)
    }

    async fn append_quotes(
        &self,
        match_id: MatchId,
        quotes: Vec<NormalizedQuote>,
        progress: &mut LeagueProgress,
    ) -> Result<()> {
        for quote in quotes {
            match self
                .snapshots
                .append(match_id, &quote.provider, quote.timestamp, quote.prices)
                .await?
            {
                AppendOutcome::Inserted(snapshot) => {
                    progress.counts.snapshots_appended += 1;
                    progress.appended.push(snapshot);
                }
                AppendOutcome::Duplicate => progress.counts.duplicates_skipped += 1,
            }
        }
        Ok(())
    }
}

async fn drain<S>(mut stream: S, reports: &mut Vec<LeagueReport>)
where
    S: Stream<Item = LeagueReport> + Unpin,
{
    while let Some(report) = stream.next().await {
        reports.push(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: LeagueStatus) -> LeagueReport {
        LeagueReport::new("x", status, LeagueCounts::default())
    }

    #[test]
    fn test_run_state_transitions() {
        let mut run = IngestionRun::new();
        assert!(matches!(
            run.transition(RunState::Completed),
            Err(EngineError::InvalidTransition { .. })
        ));
        run.transition(RunState::Running).unwrap();
        assert!(run.started_at.is_some());
        run.transition(RunState::Partial).unwrap();
        assert!(run.finished_at.is_some());
        assert!(run.transition(RunState::Running).is_err());
        assert!(run.transition(RunState::Completed).is_err());
    }

    #[test]
    fn test_fold_state() {
        assert_eq!(fold_state(&[]), RunState::Completed);
        assert_eq!(
            fold_state(&[report(LeagueStatus::Completed), report(LeagueStatus::Completed)]),
            RunState::Completed
        );
        assert_eq!(
            fold_state(&[report(LeagueStatus::Failed), report(LeagueStatus::Failed)]),
            RunState::Failed
        );
        assert_eq!(
            fold_state(&[report(LeagueStatus::Completed), report(LeagueStatus::TimedOut)]),
            RunState::Partial
        );
        assert_eq!(
            fold_state(&[report(LeagueStatus::Failed), report(LeagueStatus::Partial)]),
            RunState::Partial
        );
    }

    #[test]
    fn test_report_serializes_status_and_skips_empty_fields() {
        let json = serde_json::to_value(report(LeagueStatus::TimedOut)).unwrap();
        assert_eq!(json["status"], "TIMED_OUT");
        assert!(json.get("preview").is_none());
    }
}
