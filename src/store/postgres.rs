use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use super::{EntityStore, GradeRecord, PickStore, SnapshotFilter, SnapshotStore};
use crate::error::{EngineError, Result};
use crate::model::{
    AmbiguityRecord, CanonicalMatch, CanonicalTeam, Candidate, EntityKind, EntityMapping,
    FinalScore, MarketPrices, MarketSnapshot, MatchId, MatchStatus, Period, Pick, PickOutcome,
    PickSide, PickType, TeamId,
};

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect_with_retry(url: &str, max_retries: u32) -> Result<Self> {
        let mut attempt = 0;
        loop {
            match PgPoolOptions::new()
                .max_connections(10)
                .acquire_timeout(Duration::from_secs(10))
                .connect(url)
                .await
            {
                Ok(pool) => {
                    info!("Connected to PostgreSQL");
                    return Ok(Self { pool });
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_retries {
                        return Err(e.into());
                    }
                    warn!("Database connection attempt {} failed: {}. Retrying...", attempt, e);
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
            }
        }
    }

    /// Applies the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn corrupt(what: &str, value: &str) -> EngineError {
    EngineError::Database(sqlx::Error::Decode(
        format!("unexpected {} value '{}'", what, value).into(),
    ))
}

fn team_from_row(row: &PgRow) -> Result<CanonicalTeam> {
    Ok(CanonicalTeam {
        id: row.try_get("id")?,
        league: row.try_get("league")?,
        display_name: row.try_get("display_name")?,
        verified: row.try_get("verified")?,
        created_at: row.try_get("created_at")?,
    })
}

fn match_from_row(row: &PgRow) -> Result<CanonicalMatch> {
    let status: String = row.try_get("status")?;
    let home_score: Option<i32> = row.try_get("home_score")?;
    let away_score: Option<i32> = row.try_get("away_score")?;
    Ok(CanonicalMatch {
        id: row.try_get("id")?,
        league: row.try_get("league")?,
        home_team_id: row.try_get("home_team_id")?,
        away_team_id: row.try_get("away_team_id")?,
        start_time: row.try_get("start_time")?,
        status: MatchStatus::parse(&status).ok_or_else(|| corrupt("match status", &status))?,
        final_score: match (home_score, away_score) {
            (Some(home), Some(away)) => Some(FinalScore {
                home: home.max(0) as u32,
                away: away.max(0) as u32,
            }),
            _ => None,
        },
        verified: row.try_get("verified")?,
    })
}

fn mapping_from_row(row: &PgRow) -> Result<EntityMapping> {
    let kind: String = row.try_get("kind")?;
    Ok(EntityMapping {
        provider: row.try_get("provider")?,
        kind: EntityKind::parse(&kind).ok_or_else(|| corrupt("entity kind", &kind))?,
        external_id: row.try_get("external_id")?,
        canonical_id: row.try_get("canonical_id")?,
        supersedes: row.try_get("supersedes")?,
        created_at: row.try_get("created_at")?,
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<MarketSnapshot> {
    let period: String = row.try_get("period")?;
    Ok(MarketSnapshot {
        id: row.try_get("id")?,
        match_id: row.try_get("match_id")?,
        provider: row.try_get("provider")?,
        period: Period::parse(&period).ok_or_else(|| corrupt("period", &period))?,
        timestamp: row.try_get("ts")?,
        prices: MarketPrices {
            home_moneyline: row.try_get("home_moneyline")?,
            away_moneyline: row.try_get("away_moneyline")?,
            home_spread: row.try_get("home_spread")?,
            away_spread: row.try_get("away_spread")?,
            home_spread_price: row.try_get("home_spread_price")?,
            away_spread_price: row.try_get("away_spread_price")?,
            total_line: row.try_get("total_line")?,
            over_price: row.try_get("over_price")?,
            under_price: row.try_get("under_price")?,
        },
        is_live: row.try_get("is_live")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn pick_from_row(row: &PgRow) -> Result<Pick> {
    let pick_type: String = row.try_get("pick_type")?;
    let side: String = row.try_get("recommended_pick")?;
    let outcome: String = row.try_get("pick_result")?;
    let regrade_count: i32 = row.try_get("regrade_count")?;
    Ok(Pick {
        id: row.try_get("id")?,
        match_id: row.try_get("match_id")?,
        pick_type: PickType::parse(&pick_type).ok_or_else(|| corrupt("pick type", &pick_type))?,
        side: PickSide::parse(&side).ok_or_else(|| corrupt("pick side", &side))?,
        line: row.try_get("recommended_line")?,
        recommended_at: row.try_get("recommended_at")?,
        outcome: PickOutcome::parse(&outcome).ok_or_else(|| corrupt("pick result", &outcome))?,
        graded_at: row.try_get("graded_at")?,
        reference_snapshot: row.try_get("reference_snapshot_id")?,
        reference_line: row.try_get("reference_line")?,
        regrade_count: regrade_count.max(0) as u32,
    })
}

fn ambiguity_from_row(row: &PgRow) -> Result<AmbiguityRecord> {
    let kind: String = row.try_get("kind")?;
    let candidates: serde_json::Value = row.try_get("candidates")?;
    Ok(AmbiguityRecord {
        id: row.try_get("id")?,
        provider: row.try_get("provider")?,
        kind: EntityKind::parse(&kind).ok_or_else(|| corrupt("entity kind", &kind))?,
        external_id: row.try_get("external_id")?,
        name_hint: row.try_get("name_hint")?,
        league: row.try_get("league")?,
        candidates: serde_json::from_value::<Vec<Candidate>>(candidates)?,
        created_id: row.try_get("created_id")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

const MATCH_COLUMNS: &str =
    "id, league, home_team_id, away_team_id, start_time, status, home_score, away_score, verified";

const SNAPSHOT_COLUMNS: &str = "id, match_id, provider, period, ts, is_live, recorded_at, \
     home_moneyline, away_moneyline, home_spread, away_spread, home_spread_price, \
     away_spread_price, total_line, over_price, under_price";

const PICK_COLUMNS: &str = "id, match_id, pick_type, recommended_pick, recommended_line, \
     recommended_at, pick_result, graded_at, reference_snapshot_id, reference_line, regrade_count";

#[async_trait]
impl EntityStore for PgStore {
    async fn find_mapping(
        &self,
        provider: &str,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<Option<EntityMapping>> {
        let row = sqlx::query(
            r#"
            SELECT provider, kind, external_id, canonical_id, supersedes, created_at
            FROM entity_mappings
            WHERE provider = $1 AND kind = $2 AND external_id = $3
            "#,
        )
        .bind(provider)
        .bind(kind.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(mapping_from_row).transpose()
    }

    async fn insert_mapping(&self, mapping: EntityMapping) -> Result<EntityMapping> {
        // If the insert conflicts, DO NOT return our canonical id: re-read the row that won.
        let inserted = sqlx::query(
            r#"
            INSERT INTO entity_mappings (provider, kind, external_id, canonical_id, supersedes, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (provider, kind, external_id) DO NOTHING
            RETURNING provider, kind, external_id, canonical_id, supersedes, created_at
            "#,
        )
        .bind(&mapping.provider)
        .bind(mapping.kind.as_str())
        .bind(&mapping.external_id)
        .bind(mapping.canonical_id)
        .bind(mapping.supersedes)
        .bind(mapping.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return mapping_from_row(&row);
        }

        self.find_mapping(&mapping.provider, mapping.kind, &mapping.external_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "mapping {}/{} vanished after conflict",
                    mapping.provider, mapping.external_id
                ))
            })
    }

    async fn supersede_mapping(
        &self,
        provider: &str,
        kind: EntityKind,
        external_id: &str,
        canonical_id: Uuid,
    ) -> Result<EntityMapping> {
        let row = sqlx::query(
            r#"
            UPDATE entity_mappings SET
                supersedes = CASE WHEN canonical_id <> $4 THEN canonical_id ELSE supersedes END,
                canonical_id = $4
            WHERE provider = $1 AND kind = $2 AND external_id = $3
            RETURNING provider, kind, external_id, canonical_id, supersedes, created_at
            "#,
        )
        .bind(provider)
        .bind(kind.as_str())
        .bind(external_id)
        .bind(canonical_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => mapping_from_row(&row),
            None => Err(EngineError::NotFound(format!(
                "mapping {}/{}/{}",
                provider,
                kind.as_str(),
                external_id
            ))),
        }
    }

    async fn teams_in_league(&self, league: &str) -> Result<Vec<CanonicalTeam>> {
        let rows = sqlx::query(
            "SELECT id, league, display_name, verified, created_at FROM teams WHERE league = $1 ORDER BY display_name",
        )
        .bind(league)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(team_from_row).collect()
    }

    async fn team_aliases(&self, league: &str) -> Result<Vec<(TeamId, String)>> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT m.canonical_id, m.external_id
            FROM entity_mappings m
            JOIN teams t ON t.id = m.canonical_id
            WHERE m.kind = 'team' AND t.league = $1
            "#,
        )
        .bind(league)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_team(&self, team: CanonicalTeam) -> Result<()> {
        sqlx::query(
            "INSERT INTO teams (id, league, display_name, verified, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(team.id)
        .bind(&team.league)
        .bind(&team.display_name)
        .bind(team.verified)
        .bind(team.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_team(&self, id: TeamId) -> Result<Option<CanonicalTeam>> {
        let row = sqlx::query(
            "SELECT id, league, display_name, verified, created_at FROM teams WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(team_from_row).transpose()
    }

    async fn discard_team(&self, id: TeamId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM teams t
            WHERE t.id = $1
              AND NOT EXISTS (SELECT 1 FROM entity_mappings m WHERE m.canonical_id = t.id)
              AND NOT EXISTS (SELECT 1 FROM matches g WHERE g.home_team_id = t.id OR g.away_team_id = t.id)
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_team_verified(&self, id: TeamId) -> Result<bool> {
        let result = sqlx::query("UPDATE teams SET verified = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn matches_between(
        &self,
        league: &str,
        home: TeamId,
        away: TeamId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CanonicalMatch>> {
        let sql = format!(
            "SELECT {} FROM matches WHERE league = $1 AND home_team_id = $2 AND away_team_id = $3 \
             AND start_time BETWEEN $4 AND $5 ORDER BY start_time",
            MATCH_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(league)
            .bind(home)
            .bind(away)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(match_from_row).collect()
    }

    async fn insert_match(&self, m: CanonicalMatch) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO matches (id, league, home_team_id, away_team_id, start_time, status,
                                 home_score, away_score, verified)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(m.id)
        .bind(&m.league)
        .bind(m.home_team_id)
        .bind(m.away_team_id)
        .bind(m.start_time)
        .bind(m.status.as_str())
        .bind(m.final_score.map(|s| s.home as i32))
        .bind(m.final_score.map(|s| s.away as i32))
        .bind(m.verified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_match(&self, id: MatchId) -> Result<Option<CanonicalMatch>> {
        let sql = format!("SELECT {} FROM matches WHERE id = $1", MATCH_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(match_from_row).transpose()
    }

    async fn discard_match(&self, id: MatchId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM matches g
            WHERE g.id = $1
              AND NOT EXISTS (SELECT 1 FROM entity_mappings m WHERE m.canonical_id = g.id)
              AND NOT EXISTS (SELECT 1 FROM market_history h WHERE h.match_id = g.id)
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_match_verified(&self, id: MatchId) -> Result<bool> {
        let result = sqlx::query("UPDATE matches SET verified = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_start_time(&self, id: MatchId, start_time: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE matches SET start_time = $2 WHERE id = $1")
            .bind(id)
            .bind(start_time)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("match {}", id)));
        }
        Ok(())
    }

    async fn update_match_result(
        &self,
        id: MatchId,
        status: MatchStatus,
        score: Option<FinalScore>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE matches SET
                status = $2,
                home_score = COALESCE($3, home_score),
                away_score = COALESCE($4, away_score)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(score.map(|s| s.home as i32))
        .bind(score.map(|s| s.away as i32))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("match {}", id)));
        }
        Ok(())
    }

    async fn record_ambiguity(&self, record: AmbiguityRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entity_ambiguities (id, provider, kind, external_id, name_hint, league,
                                            candidates, created_id, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(&record.provider)
        .bind(record.kind.as_str())
        .bind(&record.external_id)
        .bind(&record.name_hint)
        .bind(&record.league)
        .bind(serde_json::to_value(&record.candidates)?)
        .bind(record.created_id)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_ambiguities(&self) -> Result<Vec<AmbiguityRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.provider, a.kind, a.external_id, a.name_hint, a.league,
                   a.candidates, a.created_id, a.recorded_at
            FROM entity_ambiguities a
            LEFT JOIN teams t ON a.kind = 'team' AND t.id = a.created_id
            LEFT JOIN matches g ON a.kind = 'match' AND g.id = a.created_id
            WHERE COALESCE(t.verified, g.verified) = FALSE
            ORDER BY a.recorded_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ambiguity_from_row).collect()
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn insert_snapshot(&self, snapshot: MarketSnapshot) -> Result<bool> {
        let p = &snapshot.prices;
        let result = sqlx::query(
            r#"
            INSERT INTO market_history (
                id, match_id, provider, period, ts, is_live, recorded_at,
                home_moneyline, away_moneyline, home_spread, away_spread,
                home_spread_price, away_spread_price, total_line, over_price, under_price
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (match_id, provider, ts) DO NOTHING
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.match_id)
        .bind(&snapshot.provider)
        .bind(snapshot.period.as_str())
        .bind(snapshot.timestamp)
        .bind(snapshot.is_live)
        .bind(snapshot.recorded_at)
        .bind(p.home_moneyline)
        .bind(p.away_moneyline)
        .bind(p.home_spread)
        .bind(p.away_spread)
        .bind(p.home_spread_price)
        .bind(p.away_spread_price)
        .bind(p.total_line)
        .bind(p.over_price)
        .bind(p.under_price)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if matches!(&e, sqlx::Error::Database(db) if db.is_foreign_key_violation()) {
                EngineError::NotFound(format!("match {}", snapshot.match_id))
            } else {
                EngineError::Database(e)
            }
        })?;
        Ok(result.rows_affected() > 0)
    }

    async fn snapshots_for_match(
        &self,
        match_id: MatchId,
        filter: &SnapshotFilter,
    ) -> Result<Vec<MarketSnapshot>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM market_history
            WHERE match_id = $1
              AND ($2::BOOLEAN IS NULL OR is_live = $2)
              AND ($3::TEXT IS NULL OR provider = $3)
              AND ($4::TEXT IS NULL OR period = $4)
              AND ($5::TIMESTAMPTZ IS NULL OR ts >= $5)
              AND ($6::TIMESTAMPTZ IS NULL OR ts <= $6)
            ORDER BY ts ASC, provider ASC
            "#,
            SNAPSHOT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(match_id)
            .bind(filter.is_live)
            .bind(filter.provider.as_deref())
            .bind(filter.period.map(|p| p.as_str()))
            .bind(filter.from)
            .bind(filter.to)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn set_live_flags(&self, updates: &[(Uuid, bool)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (id, is_live) in updates {
            sqlx::query("UPDATE market_history SET is_live = $2 WHERE id = $1")
                .bind(id)
                .bind(is_live)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl PickStore for PgStore {
    async fn insert_pick(&self, pick: Pick) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO picks (id, match_id, pick_type, recommended_pick, recommended_line,
                               recommended_at, pick_result, graded_at, reference_snapshot_id,
                               reference_line, regrade_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(pick.id)
        .bind(pick.match_id)
        .bind(pick.pick_type.as_str())
        .bind(pick.side.as_str())
        .bind(pick.line)
        .bind(pick.recommended_at)
        .bind(pick.outcome.as_str())
        .bind(pick.graded_at)
        .bind(pick.reference_snapshot)
        .bind(pick.reference_line)
        .bind(pick.regrade_count as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_pick(&self, id: Uuid) -> Result<Option<Pick>> {
        let sql = format!("SELECT {} FROM picks WHERE id = $1", PICK_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(pick_from_row).transpose()
    }

    async fn record_grade(&self, grade: &GradeRecord, overwrite: bool) -> Result<Pick> {
        // Conditional update: a concurrent grader that lost the race reads the stored grade.
        let sql = format!(
            r#"
            UPDATE picks SET
                pick_result = $2,
                graded_at = $3,
                reference_snapshot_id = $4,
                reference_line = $5,
                regrade_count = regrade_count + CASE WHEN pick_result <> 'UNGRADED' THEN 1 ELSE 0 END
            WHERE id = $1 AND (pick_result = 'UNGRADED' OR $6)
            RETURNING {}
            "#,
            PICK_COLUMNS
        );
        let updated = sqlx::query(&sql)
            .bind(grade.pick_id)
            .bind(grade.outcome.as_str())
            .bind(grade.graded_at)
            .bind(grade.reference_snapshot)
            .bind(grade.reference_line)
            .bind(overwrite)
            .fetch_optional(&self.pool)
            .await?;

        match updated {
            Some(row) => pick_from_row(&row),
            None => self
                .get_pick(grade.pick_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("pick {}", grade.pick_id))),
        }
    }

    async fn ungraded_picks(&self) -> Result<Vec<Pick>> {
        let sql = format!(
            "SELECT {} FROM picks WHERE pick_result = 'UNGRADED' ORDER BY recommended_at",
            PICK_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(pick_from_row).collect()
    }
}
