//! Persistence seams.
//!
//! Every shared write goes through a unique-key upsert so concurrent writers
//! need no external locks: `insert_mapping` returns whichever row owns the key,
//! `insert_snapshot` reports a duplicate instead of writing twice, and
//! `record_grade` refuses to overwrite a graded pick unless told to.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    AmbiguityRecord, CanonicalMatch, CanonicalTeam, EntityKind, EntityMapping, FinalScore,
    MarketSnapshot, MatchId, MatchStatus, Period, Pick, TeamId,
};

/// Read filter for snapshot history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotFilter {
    pub is_live: Option<bool>,
    pub provider: Option<String>,
    pub period: Option<Period>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl SnapshotFilter {
    pub fn live(is_live: bool) -> Self {
        Self {
            is_live: Some(is_live),
            ..Default::default()
        }
    }

    pub fn matches(&self, snapshot: &MarketSnapshot) -> bool {
        self.is_live.map_or(true, |live| snapshot.is_live == live)
            && self.provider.as_deref().map_or(true, |p| snapshot.provider == p)
            && self.period.map_or(true, |p| snapshot.period == p)
            && self.from.map_or(true, |from| snapshot.timestamp >= from)
            && self.to.map_or(true, |to| snapshot.timestamp <= to)
    }
}

/// Grading result to persist on a pick.
#[derive(Debug, Clone, PartialEq)]
pub struct GradeRecord {
    pub pick_id: Uuid,
    pub outcome: crate::model::PickOutcome,
    pub graded_at: DateTime<Utc>,
    pub reference_snapshot: Uuid,
    pub reference_line: Option<f64>,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_mapping(
        &self,
        provider: &str,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<Option<EntityMapping>>;

    /// Inserts the mapping unless its key is taken; returns the row that owns the key.
    async fn insert_mapping(&self, mapping: EntityMapping) -> Result<EntityMapping>;

    /// Points an existing mapping at a new canonical id, recording the id it replaced.
    async fn supersede_mapping(
        &self,
        provider: &str,
        kind: EntityKind,
        external_id: &str,
        canonical_id: Uuid,
    ) -> Result<EntityMapping>;

    async fn teams_in_league(&self, league: &str) -> Result<Vec<CanonicalTeam>>;

    /// External team names recorded by any provider for teams of `league`.
    async fn team_aliases(&self, league: &str) -> Result<Vec<(TeamId, String)>>;

    async fn insert_team(&self, team: CanonicalTeam) -> Result<()>;

    async fn get_team(&self, id: TeamId) -> Result<Option<CanonicalTeam>>;

    /// Removes a team that nothing maps to. Returns whether it was removed.
    async fn discard_team(&self, id: TeamId) -> Result<bool>;

    async fn set_team_verified(&self, id: TeamId) -> Result<bool>;

    /// Matches in `league` with the given home/away teams starting within `[from, to]`.
    async fn matches_between(
        &self,
        league: &str,
        home: TeamId,
        away: TeamId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CanonicalMatch>>;

    async fn insert_match(&self, m: CanonicalMatch) -> Result<()>;

    async fn get_match(&self, id: MatchId) -> Result<Option<CanonicalMatch>>;

    /// Removes a match with no mappings and no snapshots. Returns whether it was removed.
    async fn discard_match(&self, id: MatchId) -> Result<bool>;

    async fn set_match_verified(&self, id: MatchId) -> Result<bool>;

    async fn update_start_time(&self, id: MatchId, start_time: DateTime<Utc>) -> Result<()>;

    async fn update_match_result(
        &self,
        id: MatchId,
        status: MatchStatus,
        score: Option<FinalScore>,
    ) -> Result<()>;

    async fn record_ambiguity(&self, record: AmbiguityRecord) -> Result<()>;

    async fn pending_ambiguities(&self) -> Result<Vec<AmbiguityRecord>>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Returns `false` when a snapshot with the same (match, provider, timestamp) exists.
    /// Fails with `NotFound` if the match does not exist.
    async fn insert_snapshot(&self, snapshot: MarketSnapshot) -> Result<bool>;

    /// Snapshots of a match in ascending (timestamp, provider) order.
    async fn snapshots_for_match(
        &self,
        match_id: MatchId,
        filter: &SnapshotFilter,
    ) -> Result<Vec<MarketSnapshot>>;

    async fn set_live_flags(&self, updates: &[(Uuid, bool)]) -> Result<()>;
}

#[async_trait]
pub trait PickStore: Send + Sync {
    async fn insert_pick(&self, pick: Pick) -> Result<()>;

    async fn get_pick(&self, id: Uuid) -> Result<Option<Pick>>;

    /// Persists a grade. Without `overwrite` a pick that is already graded is
    /// left untouched. Returns the pick as stored afterwards.
    async fn record_grade(&self, grade: &GradeRecord, overwrite: bool) -> Result<Pick>;

    async fn ungraded_picks(&self) -> Result<Vec<Pick>>;
}

/// Everything the engine persists.
pub trait Store: EntityStore + SnapshotStore + PickStore {}

impl<T: EntityStore + SnapshotStore + PickStore> Store for T {}
