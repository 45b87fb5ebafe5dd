use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{EntityStore, GradeRecord, PickStore, SnapshotFilter, SnapshotStore};
use crate::error::{EngineError, Result};
use crate::model::{
    AmbiguityRecord, CanonicalMatch, CanonicalTeam, EntityKind, EntityMapping, FinalScore,
    MarketSnapshot, MatchId, MatchStatus, Pick, PickOutcome, TeamId,
};

type MappingKey = (String, EntityKind, String);

#[derive(Default)]
struct State {
    teams: HashMap<TeamId, CanonicalTeam>,
    matches: HashMap<MatchId, CanonicalMatch>,
    mappings: HashMap<MappingKey, EntityMapping>,
    /// Per match, keyed by (timestamp, provider) so iteration is already in read order.
    snapshots: HashMap<MatchId, BTreeMap<(DateTime<Utc>, String), MarketSnapshot>>,
    picks: HashMap<Uuid, Pick>,
    ambiguities: Vec<AmbiguityRecord>,
}

impl State {
    fn is_mapped(&self, id: Uuid) -> bool {
        self.mappings.values().any(|m| m.canonical_id == id)
    }
}

/// Thread-safe in-process store. Used by tests and `STORE=memory` dry runs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots across all matches.
    pub async fn snapshot_count(&self) -> usize {
        let state = self.inner.read().await;
        state.snapshots.values().map(|s| s.len()).sum()
    }

    pub async fn mapping_count(&self) -> usize {
        self.inner.read().await.mappings.len()
    }

    pub async fn team_count(&self) -> usize {
        self.inner.read().await.teams.len()
    }

    pub async fn matches(&self) -> Vec<CanonicalMatch> {
        self.inner.read().await.matches.values().cloned().collect()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn find_mapping(
        &self,
        provider: &str,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<Option<EntityMapping>> {
        let state = self.inner.read().await;
        let key = (provider.to_string(), kind, external_id.to_string());
        Ok(state.mappings.get(&key).cloned())
    }

    async fn insert_mapping(&self, mapping: EntityMapping) -> Result<EntityMapping> {
        let mut state = self.inner.write().await;
        let key = (
            mapping.provider.clone(),
            mapping.kind,
            mapping.external_id.clone(),
        );
        match state.mappings.entry(key) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => Ok(slot.insert(mapping).clone()),
        }
    }

    async fn supersede_mapping(
        &self,
        provider: &str,
        kind: EntityKind,
        external_id: &str,
        canonical_id: Uuid,
    ) -> Result<EntityMapping> {
        let mut state = self.inner.write().await;
        let key = (provider.to_string(), kind, external_id.to_string());
        let mapping = state.mappings.get_mut(&key).ok_or_else(|| {
            EngineError::NotFound(format!("mapping {}/{}/{}", provider, kind.as_str(), external_id))
        })?;
        if mapping.canonical_id != canonical_id {
            mapping.supersedes = Some(mapping.canonical_id);
            mapping.canonical_id = canonical_id;
        }
        Ok(mapping.clone())
    }

    async fn teams_in_league(&self, league: &str) -> Result<Vec<CanonicalTeam>> {
        let state = self.inner.read().await;
        let mut teams: Vec<CanonicalTeam> = state
            .teams
            .values()
            .filter(|t| t.league == league)
            .cloned()
            .collect();
        teams.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(teams)
    }

    async fn team_aliases(&self, league: &str) -> Result<Vec<(TeamId, String)>> {
        let state = self.inner.read().await;
        Ok(state
            .mappings
            .values()
            .filter(|m| m.kind == EntityKind::Team)
            .filter(|m| {
                state
                    .teams
                    .get(&m.canonical_id)
                    .map_or(false, |t| t.league == league)
            })
            .map(|m| (m.canonical_id, m.external_id.clone()))
            .collect())
    }

    async fn insert_team(&self, team: CanonicalTeam) -> Result<()> {
        self.inner.write().await.teams.insert(team.id, team);
        Ok(())
    }

    async fn get_team(&self, id: TeamId) -> Result<Option<CanonicalTeam>> {
        Ok(self.inner.read().await.teams.get(&id).cloned())
    }

    async fn discard_team(&self, id: TeamId) -> Result<bool> {
        let mut state = self.inner.write().await;
        let referenced = state
            .matches
            .values()
            .any(|m| m.home_team_id == id || m.away_team_id == id);
        if state.is_mapped(id) || referenced {
            return Ok(false);
        }
        Ok(state.teams.remove(&id).is_some())
    }

    async fn set_team_verified(&self, id: TeamId) -> Result<bool> {
        let mut state = self.inner.write().await;
        Ok(match state.teams.get_mut(&id) {
            Some(team) => {
                team.verified = true;
                true
            }
            None => false,
        })
    }

    async fn matches_between(
        &self,
        league: &str,
        home: TeamId,
        away: TeamId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CanonicalMatch>> {
        let state = self.inner.read().await;
        let mut found: Vec<CanonicalMatch> = state
            .matches
            .values()
            .filter(|m| {
                m.league == league
                    && m.home_team_id == home
                    && m.away_team_id == away
                    && m.start_time >= from
                    && m.start_time <= to
            })
            .cloned()
            .collect();
        found.sort_by_key(|m| m.start_time);
        Ok(found)
    }

    async fn insert_match(&self, m: CanonicalMatch) -> Result<()> {
        self.inner.write().await.matches.insert(m.id, m);
        Ok(())
    }

    async fn get_match(&self, id: MatchId) -> Result<Option<CanonicalMatch>> {
        Ok(self.inner.read().await.matches.get(&id).cloned())
    }

    async fn discard_match(&self, id: MatchId) -> Result<bool> {
        let mut state = self.inner.write().await;
        let has_snapshots = state.snapshots.get(&id).map_or(false, |s| !s.is_empty());
        if state.is_mapped(id) || has_snapshots {
            return Ok(false);
        }
        Ok(state.matches.remove(&id).is_some())
    }

    async fn set_match_verified(&self, id: MatchId) -> Result<bool> {
        let mut state = self.inner.write().await;
        Ok(match state.matches.get_mut(&id) {
            Some(m) => {
                m.verified = true;
                true
            }
            None => false,
        })
    }

    async fn update_start_time(&self, id: MatchId, start_time: DateTime<Utc>) -> Result<()> {
        let mut state = self.inner.write().await;
        let m = state
            .matches
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("match {}", id)))?;
        m.start_time = start_time;
        Ok(())
    }

    async fn update_match_result(
        &self,
        id: MatchId,
        status: MatchStatus,
        score: Option<FinalScore>,
    ) -> Result<()> {
        let mut state = self.inner.write().await;
        let m = state
            .matches
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("match {}", id)))?;
        m.status = status;
        if score.is_some() {
            m.final_score = score;
        }
        Ok(())
    }

    async fn record_ambiguity(&self, record: AmbiguityRecord) -> Result<()> {
        self.inner.write().await.ambiguities.push(record);
        Ok(())
    }

    async fn pending_ambiguities(&self) -> Result<Vec<AmbiguityRecord>> {
        let state = self.inner.read().await;
        Ok(state
            .ambiguities
            .iter()
            .filter(|rec| match rec.kind {
                EntityKind::Team => state.teams.get(&rec.created_id).map_or(false, |t| !t.verified),
                EntityKind::Match => state
                    .matches
                    .get(&rec.created_id)
                    .map_or(false, |m| !m.verified),
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn insert_snapshot(&self, snapshot: MarketSnapshot) -> Result<bool> {
        let mut state = self.inner.write().await;
        if !state.matches.contains_key(&snapshot.match_id) {
            return Err(EngineError::NotFound(format!("match {}", snapshot.match_id)));
        }
        let series = state.snapshots.entry(snapshot.match_id).or_default();
        let key = (snapshot.timestamp, snapshot.provider.clone());
        if series.contains_key(&key) {
            return Ok(false);
        }
        series.insert(key, snapshot);
        Ok(true)
    }

    async fn snapshots_for_match(
        &self,
        match_id: MatchId,
        filter: &SnapshotFilter,
    ) -> Result<Vec<MarketSnapshot>> {
        let state = self.inner.read().await;
        Ok(state
            .snapshots
            .get(&match_id)
            .map(|series| {
                series
                    .values()
                    .filter(|s| filter.matches(s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_live_flags(&self, updates: &[(Uuid, bool)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let flags: HashMap<Uuid, bool> = updates.iter().copied().collect();
        let mut state = self.inner.write().await;
        for series in state.snapshots.values_mut() {
            for snapshot in series.values_mut() {
                if let Some(&live) = flags.get(&snapshot.id) {
                    snapshot.is_live = live;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PickStore for MemoryStore {
    async fn insert_pick(&self, pick: Pick) -> Result<()> {
        self.inner.write().await.picks.insert(pick.id, pick);
        Ok(())
    }

    async fn get_pick(&self, id: Uuid) -> Result<Option<Pick>> {
        Ok(self.inner.read().await.picks.get(&id).cloned())
    }

    async fn record_grade(&self, grade: &GradeRecord, overwrite: bool) -> Result<Pick> {
        let mut state = self.inner.write().await;
        let pick = state
            .picks
            .get_mut(&grade.pick_id)
            .ok_or_else(|| EngineError::NotFound(format!("pick {}", grade.pick_id)))?;
        if pick.is_graded() && !overwrite {
            return Ok(pick.clone());
        }
        if pick.is_graded() {
            pick.regrade_count += 1;
        }
        pick.outcome = grade.outcome;
        pick.graded_at = Some(grade.graded_at);
        pick.reference_snapshot = Some(grade.reference_snapshot);
        pick.reference_line = grade.reference_line;
        Ok(pick.clone())
    }

    async fn ungraded_picks(&self) -> Result<Vec<Pick>> {
        let state = self.inner.read().await;
        let mut picks: Vec<Pick> = state
            .picks
            .values()
            .filter(|p| p.outcome == PickOutcome::Ungraded)
            .cloned()
            .collect();
        picks.sort_by_key(|p| p.recommended_at);
        Ok(picks)
    }
}
