//! Snapshot Store & Live Classifier.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{CanonicalMatch, MarketPrices, MarketSnapshot, MatchId, Period};
use crate::store::{EntityStore, SnapshotFilter, SnapshotStore, Store};

/// Start-time drift below this is treated as the same kickoff.
const START_CORRECTION_TOLERANCE_SECS: i64 = 60;

/// `is_live = timestamp > start_time + threshold`.
#[derive(Debug, Clone, Copy)]
pub struct LiveClassifier {
    threshold: Duration,
}

impl LiveClassifier {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn is_live(&self, start_time: DateTime<Utc>, timestamp: DateTime<Utc>) -> bool {
        timestamp > start_time + self.threshold
    }
}

impl Default for LiveClassifier {
    fn default() -> Self {
        Self::new(Duration::minutes(5))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Inserted(MarketSnapshot),
    /// A snapshot with the same (match, provider, timestamp) was already stored.
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReclassifyReport {
    pub match_id: MatchId,
    pub examined: usize,
    pub corrected: Vec<Uuid>,
}

/// Appends and reclassifies snapshots for canonical matches.
///
/// `append` classifies against the start time it reads before inserting, so
/// callers must not run `correct_start_time` for the same match concurrently
/// with an append. The orchestrator corrects a match's start before appending
/// its quotes, one event at a time, and leagues never share a match.
#[derive(Clone)]
pub struct SnapshotService {
    store: Arc<dyn Store>,
    classifier: LiveClassifier,
}

impl SnapshotService {
    pub fn new(store: Arc<dyn Store>, classifier: LiveClassifier) -> Self {
        Self { store, classifier }
    }

    pub fn classifier(&self) -> LiveClassifier {
        self.classifier
    }

    /// Stores one snapshot, deriving `is_live` from the match's current start
    /// time and the period from the provider string.
    pub async fn append(
        &self,
        match_id: MatchId,
        provider: &str,
        timestamp: DateTime<Utc>,
        prices: MarketPrices,
    ) -> Result<AppendOutcome> {
        let canonical = self.require_match(match_id).await?;
        let snapshot = MarketSnapshot {
            id: Uuid::new_v4(),
            match_id,
            provider: provider.to_string(),
            period: Period::from_provider(provider),
            timestamp,
            prices,
            is_live: self.classifier.is_live(canonical.start_time, timestamp),
            recorded_at: Utc::now(),
        };

        if self.store.insert_snapshot(snapshot.clone()).await? {
            Ok(AppendOutcome::Inserted(snapshot))
        } else {
            debug!(match_id = %match_id, provider, %timestamp, "Duplicate snapshot skipped");
            Ok(AppendOutcome::Duplicate)
        }
    }

    /// Re-evaluates `is_live` for every snapshot of the match against its
    /// current start time and flips the flags that disagree.
    pub async fn reclassify(&self, match_id: MatchId) -> Result<ReclassifyReport> {
        let canonical = self.require_match(match_id).await?;
        let snapshots = self
            .store
            .snapshots_for_match(match_id, &SnapshotFilter::default())
            .await?;

        let updates: Vec<(Uuid, bool)> = snapshots
            .iter()
            .filter_map(|s| {
                let live = self.classifier.is_live(canonical.start_time, s.timestamp);
                (live != s.is_live).then_some((s.id, live))
            })
            .collect();
        self.store.set_live_flags(&updates).await?;

        if !updates.is_empty() {
            info!(
                match_id = %match_id,
                examined = snapshots.len(),
                corrected = updates.len(),
                "Reclassified snapshots"
            );
        }
        Ok(ReclassifyReport {
            match_id,
            examined: snapshots.len(),
            corrected: updates.into_iter().map(|(id, _)| id).collect(),
        })
    }

    /// Moves the match's start time and reclassifies its snapshots. Returns
    /// `None` when the stored start is already within tolerance.
    pub async fn correct_start_time(
        &self,
        match_id: MatchId,
        start_time: DateTime<Utc>,
    ) -> Result<Option<ReclassifyReport>> {
        let canonical = self.require_match(match_id).await?;
        let drift = (canonical.start_time - start_time).num_seconds().abs();
        if drift < START_CORRECTION_TOLERANCE_SECS {
            return Ok(None);
        }

        info!(
            match_id = %match_id,
            old_start = %canonical.start_time,
            new_start = %start_time,
            "Correcting match start time"
        );
        self.store.update_start_time(match_id, start_time).await?;
        self.reclassify(match_id).await.map(Some)
    }

    /// Snapshots of the match in ascending (timestamp, provider) order.
    pub async fn history(&self, match_id: MatchId, filter: &SnapshotFilter) -> Result<Vec<MarketSnapshot>> {
        self.store.snapshots_for_match(match_id, filter).await
    }

    async fn require_match(&self, match_id: MatchId) -> Result<CanonicalMatch> {
        self.store
            .get_match(match_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("match {}", match_id)))
    }
}
