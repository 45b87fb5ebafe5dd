//! Entity Resolver: (provider, external id) -> canonical team/match id.
//!
//! Exact mapping hits return immediately. Misses are matched against canonical
//! entities of the same league and either mapped, or answered with a freshly
//! created *unverified* entity. Ambiguity never fails the caller; it is
//! recorded for offline review instead.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use strsim::jaro_winkler;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::model::{
    AmbiguityRecord, CanonicalMatch, CanonicalTeam, Candidate, EntityKind, EntityMapping,
    MatchId, MatchStatus, TeamId,
};
use crate::store::{EntityStore, Store};

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Minimum similarity to map a name onto an existing team.
    pub accept_threshold: f64,
    /// Candidates within this distance of the threshold (or of the best score) compete.
    pub ambiguity_margin: f64,
    /// Start-time window for matching a provider event onto an existing match.
    pub match_window: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            accept_threshold: 0.92,
            ambiguity_margin: 0.05,
            match_window: Duration::hours(6),
        }
    }
}

impl ResolverSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            accept_threshold: config.fuzzy_accept_threshold,
            ambiguity_margin: config.fuzzy_ambiguity_margin,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolveOutcome {
    /// An existing mapping answered the lookup.
    Mapped,
    /// The miss was matched onto an existing entity.
    Matched { score: f64 },
    /// No plausible candidate; a new unverified entity was created.
    Created,
    /// Several plausible candidates; a new unverified entity was created and the
    /// ambiguity recorded.
    Ambiguous,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub canonical_id: Uuid,
    pub outcome: ResolveOutcome,
}

impl Resolution {
    pub fn is_ambiguous(&self) -> bool {
        self.outcome == ResolveOutcome::Ambiguous
    }
}

/// A resolver miss about to become a mapping.
struct Miss<'a> {
    provider: &'a str,
    kind: EntityKind,
    external_id: &'a str,
    name_hint: &'a str,
    league: &'a str,
}

enum Decision {
    Accept(Uuid, f64),
    Create,
    Ambiguous(Vec<Candidate>),
}

#[derive(Clone)]
pub struct EntityResolver {
    store: Arc<dyn Store>,
    settings: ResolverSettings,
}

impl EntityResolver {
    pub fn new(store: Arc<dyn Store>, settings: ResolverSettings) -> Self {
        Self { store, settings }
    }

    /// Resolves a provider's team name. Providers without team ids pass the
    /// raw name as `external_id`.
    pub async fn resolve_team(
        &self,
        provider: &str,
        external_id: &str,
        name_hint: &str,
        league: &str,
    ) -> Result<Resolution> {
        if let Some(mapping) = self.store.find_mapping(provider, EntityKind::Team, external_id).await? {
            return Ok(Resolution {
                canonical_id: mapping.canonical_id,
                outcome: ResolveOutcome::Mapped,
            });
        }

        let miss = Miss {
            provider,
            kind: EntityKind::Team,
            external_id,
            name_hint,
            league,
        };
        let teams = self.store.teams_in_league(league).await?;
        let aliases = self.store.team_aliases(league).await?;
        let decision = self.score_team(name_hint, &teams, &aliases);

        match decision {
            Decision::Accept(id, score) => self.map_existing(&miss, id, score).await,
            Decision::Create => self.create_team(&miss, None).await,
            Decision::Ambiguous(candidates) => self.create_team(&miss, Some(candidates)).await,
        }
    }

    /// Resolves a provider event onto a canonical match between two already
    /// resolved teams.
    pub async fn resolve_match(
        &self,
        provider: &str,
        external_id: &str,
        league: &str,
        home_team_id: TeamId,
        away_team_id: TeamId,
        start_time: DateTime<Utc>,
    ) -> Result<Resolution> {
        if let Some(mapping) = self.store.find_mapping(provider, EntityKind::Match, external_id).await? {
            return Ok(Resolution {
                canonical_id: mapping.canonical_id,
                outcome: ResolveOutcome::Mapped,
            });
        }

        let window = self.settings.match_window;
        let candidates = self
            .store
            .matches_between(
                league,
                home_team_id,
                away_team_id,
                start_time - window,
                start_time + window,
            )
            .await?;

        let name_hint = format!("{} vs {} @ {}", home_team_id, away_team_id, start_time.to_rfc3339());
        let miss = Miss {
            provider,
            kind: EntityKind::Match,
            external_id,
            name_hint: &name_hint,
            league,
        };
        let new_match = CanonicalMatch {
            id: Uuid::new_v4(),
            league: league.to_string(),
            home_team_id,
            away_team_id,
            start_time,
            status: MatchStatus::Scheduled,
            final_score: None,
            verified: false,
        };

        match candidates.as_slice() {
            [] => self.create_match(&miss, new_match, None).await,
            [only] => {
                let score = time_proximity(only.start_time, start_time, window);
                self.map_existing(&miss, only.id, score).await
            }
            several => {
                let candidates = several
                    .iter()
                    .map(|m| Candidate {
                        canonical_id: m.id,
                        score: time_proximity(m.start_time, start_time, window),
                    })
                    .collect();
                self.create_match(&miss, new_match, Some(candidates)).await
            }
        }
    }

    /// Ambiguity records whose created entity has not been verified yet.
    pub async fn pending_reviews(&self) -> Result<Vec<AmbiguityRecord>> {
        self.store.pending_ambiguities().await
    }

    pub async fn verify_team(&self, id: TeamId) -> Result<bool> {
        let verified = self.store.set_team_verified(id).await?;
        if verified {
            info!(team_id = %id, "Team marked verified");
        }
        Ok(verified)
    }

    pub async fn verify_match(&self, id: MatchId) -> Result<bool> {
        let verified = self.store.set_match_verified(id).await?;
        if verified {
            info!(match_id = %id, "Match marked verified");
        }
        Ok(verified)
    }

    /// Points a provider identifier at a different canonical entity. The
    /// mapping row is kept and records the id it replaced.
    pub async fn remap(
        &self,
        provider: &str,
        kind: EntityKind,
        external_id: &str,
        canonical_id: Uuid,
    ) -> Result<EntityMapping> {
        let mapping = self
            .store
            .supersede_mapping(provider, kind, external_id, canonical_id)
            .await?;
        info!(
            provider,
            kind = kind.as_str(),
            external_id,
            canonical_id = %canonical_id,
            supersedes = ?mapping.supersedes,
            "Mapping superseded"
        );
        Ok(mapping)
    }

    fn score_team(&self, name_hint: &str, teams: &[CanonicalTeam], aliases: &[(TeamId, String)]) -> Decision {
        let input = NameKeys::of(name_hint);
        if input.whole.is_empty() {
            return Decision::Create;
        }

        let team_keys = |team: &CanonicalTeam| -> Vec<String> {
            std::iter::once(lookup_key(&team.display_name))
                .chain(
                    aliases
                        .iter()
                        .filter(|(id, _)| *id == team.id)
                        .map(|(_, alias)| lookup_key(alias)),
                )
                .filter(|k| !k.is_empty())
                .collect()
        };

        // Only the whole name wins outright, and only if unique.
        let exact: Vec<&CanonicalTeam> = teams
            .iter()
            .filter(|t| team_keys(t).iter().any(|k| input.whole.contains(k)))
            .collect();
        match exact.as_slice() {
            [only] => return Decision::Accept(only.id, 1.0),
            [] => {}
            several => {
                return Decision::Ambiguous(
                    several
                        .iter()
                        .map(|t| Candidate {
                            canonical_id: t.id,
                            score: 1.0,
                        })
                        .collect(),
                )
            }
        }

        let threshold = self.settings.accept_threshold;
        let margin = self.settings.ambiguity_margin;
        // "North Carolina Central Eagles" shortens to "North Carolina": at best a review case.
        let shortened_cap = threshold - margin / 2.0;
        let best = |inputs: &[String], keys: &[String]| {
            inputs
                .iter()
                .flat_map(|i| keys.iter().map(move |k| jaro_winkler(i, k)))
                .fold(0.0_f64, f64::max)
        };

        let mut via_shortened: HashSet<TeamId> = HashSet::new();
        let mut contenders: Vec<Candidate> = teams
            .iter()
            .filter_map(|t| {
                let keys = team_keys(t);
                let whole = best(&input.whole, &keys);
                let shortened = best(&input.shortened, &keys).min(shortened_cap);
                if shortened > whole {
                    via_shortened.insert(t.id);
                }
                let score = whole.max(shortened);
                (score >= threshold - margin).then_some(Candidate {
                    canonical_id: t.id,
                    score,
                })
            })
            .collect();
        contenders.sort_by(|a, b| b.score.total_cmp(&a.score));

        if contenders
            .first()
            .map_or(false, |c| via_shortened.contains(&c.canonical_id))
        {
            return Decision::Ambiguous(contenders);
        }
        decide(contenders, threshold, margin)
    }

    async fn map_existing(&self, miss: &Miss<'_>, canonical_id: Uuid, score: f64) -> Result<Resolution> {
        let winner = self.store.insert_mapping(new_mapping(miss, canonical_id)).await?;
        debug!(
            provider = miss.provider,
            kind = miss.kind.as_str(),
            external_id = miss.external_id,
            canonical_id = %winner.canonical_id,
            score,
            "Mapped onto existing entity"
        );
        Ok(Resolution {
            canonical_id: winner.canonical_id,
            outcome: if winner.canonical_id == canonical_id {
                ResolveOutcome::Matched { score }
            } else {
                ResolveOutcome::Mapped
            },
        })
    }

    async fn create_team(&self, miss: &Miss<'_>, ambiguity: Option<Vec<Candidate>>) -> Result<Resolution> {
        let team = CanonicalTeam {
            id: Uuid::new_v4(),
            league: miss.league.to_string(),
            display_name: clean_team_name(miss.name_hint),
            verified: false,
            created_at: Utc::now(),
        };
        let team_id = team.id;
        self.store.insert_team(team).await?;
        let winner = self.store.insert_mapping(new_mapping(miss, team_id)).await?;

        if winner.canonical_id != team_id {
            // Another caller won the mapping race; drop our orphan and use theirs.
            self.store.discard_team(team_id).await?;
            return Ok(Resolution {
                canonical_id: winner.canonical_id,
                outcome: ResolveOutcome::Mapped,
            });
        }
        self.finish_creation(miss, team_id, ambiguity).await
    }

    async fn create_match(
        &self,
        miss: &Miss<'_>,
        new_match: CanonicalMatch,
        ambiguity: Option<Vec<Candidate>>,
    ) -> Result<Resolution> {
        let match_id = new_match.id;
        self.store.insert_match(new_match).await?;
        let winner = self.store.insert_mapping(new_mapping(miss, match_id)).await?;

        if winner.canonical_id != match_id {
            self.store.discard_match(match_id).await?;
            return Ok(Resolution {
                canonical_id: winner.canonical_id,
                outcome: ResolveOutcome::Mapped,
            });
        }
        self.finish_creation(miss, match_id, ambiguity).await
    }

    async fn finish_creation(
        &self,
        miss: &Miss<'_>,
        created_id: Uuid,
        ambiguity: Option<Vec<Candidate>>,
    ) -> Result<Resolution> {
        let Some(candidates) = ambiguity else {
            info!(
                provider = miss.provider,
                kind = miss.kind.as_str(),
                external_id = miss.external_id,
                league = miss.league,
                canonical_id = %created_id,
                "Created unverified entity"
            );
            return Ok(Resolution {
                canonical_id: created_id,
                outcome: ResolveOutcome::Created,
            });
        };

        warn!(
            provider = miss.provider,
            kind = miss.kind.as_str(),
            external_id = miss.external_id,
            name_hint = miss.name_hint,
            league = miss.league,
            candidates = candidates.len(),
            canonical_id = %created_id,
            "Ambiguous entity; created unverified entity for review"
        );
        self.store
            .record_ambiguity(AmbiguityRecord {
                id: Uuid::new_v4(),
                provider: miss.provider.to_string(),
                kind: miss.kind,
                external_id: miss.external_id.to_string(),
                name_hint: miss.name_hint.to_string(),
                league: miss.league.to_string(),
                candidates,
                created_id,
                recorded_at: Utc::now(),
            })
            .await?;
        Ok(Resolution {
            canonical_id: created_id,
            outcome: ResolveOutcome::Ambiguous,
        })
    }
}

fn new_mapping(miss: &Miss<'_>, canonical_id: Uuid) -> EntityMapping {
    EntityMapping {
        provider: miss.provider.to_string(),
        kind: miss.kind,
        external_id: miss.external_id.to_string(),
        canonical_id,
        supersedes: None,
        created_at: Utc::now(),
    }
}

/// Accept a clear winner above the threshold; otherwise several contenders
/// are ambiguous and a single sub-threshold contender is a plain miss.
fn decide(contenders: Vec<Candidate>, threshold: f64, margin: f64) -> Decision {
    match contenders.as_slice() {
        [] => Decision::Create,
        [best] if best.score >= threshold => Decision::Accept(best.canonical_id, best.score),
        [_] => Decision::Create,
        [best, second, ..] if best.score >= threshold && best.score - second.score > margin => {
            Decision::Accept(best.canonical_id, best.score)
        }
        _ => Decision::Ambiguous(contenders),
    }
}

fn time_proximity(a: DateTime<Utc>, b: DateTime<Utc>, window: Duration) -> f64 {
    let window_secs = window.num_seconds().max(1) as f64;
    let diff = (a - b).num_seconds().abs() as f64;
    (1.0 - diff / window_secs).clamp(0.0, 1.0)
}

/// Comparison key: lowercase ASCII alphanumerics only.
pub fn lookup_key(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Leading abbreviations feeds use for directional and "Mount" schools.
const LEADING_ABBREVIATIONS: &[(&str, &str)] = &[
    ("E", "Eastern"),
    ("W", "Western"),
    ("N", "Northern"),
    ("S", "Southern"),
    ("C", "Central"),
    ("Mt", "Mount"),
];

/// Display form of a provider team name: parenthesised qualifiers and
/// periods dropped, curly quotes straightened, dashes read as spaces.
pub fn clean_team_name(name: &str) -> String {
    let mut depth = 0usize;
    let kept: String = name
        .chars()
        .filter_map(|ch| match ch {
            '(' => {
                depth += 1;
                None
            }
            ')' => {
                depth = depth.saturating_sub(1);
                None
            }
            _ if depth > 0 => None,
            '.' => None,
            '\u{2018}' | '\u{2019}' => Some('\''),
            '-' | '\u{2013}' | '\u{2014}' => Some(' '),
            other => Some(other),
        })
        .collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn expand_leading_abbreviation(name: &str) -> Option<String> {
    let (first, rest) = name.split_once(' ')?;
    LEADING_ABBREVIATIONS
        .iter()
        .find(|(short, _)| *short == first)
        .map(|(long, _)| format!("{} {}", long, rest))
}

/// Lookup keys derived from a provider team name.
#[derive(Debug, Default, PartialEq)]
pub struct NameKeys {
    /// The whole name and its respellings. An exact hit is decisive.
    pub whole: Vec<String>,
    /// The name with one or two trailing words (usually a mascot) dropped.
    /// Never decisive on its own.
    pub shortened: Vec<String>,
}

impl NameKeys {
    pub fn of(name: &str) -> Self {
        let cleaned = clean_team_name(name);
        let mut spellings = vec![cleaned.clone()];
        spellings.extend(expand_leading_abbreviation(&cleaned));
        let state_short: Vec<String> = spellings
            .iter()
            .filter(|s| s.contains(" State"))
            .map(|s| s.replace(" State", " St"))
            .collect();
        spellings.extend(state_short);

        let mut keys = NameKeys::default();
        push_key(&mut keys.whole, name);
        for spelling in &spellings {
            push_key(&mut keys.whole, spelling);
            let words: Vec<&str> = spelling.split_whitespace().collect();
            for keep in words.len().saturating_sub(2).max(1)..words.len() {
                push_key(&mut keys.shortened, &words[..keep].join(" "));
            }
        }
        keys.shortened.retain(|k| !keys.whole.contains(k));
        keys
    }
}

fn push_key(keys: &mut Vec<String>, name: &str) {
    let key = lookup_key(name);
    if !key.is_empty() && !keys.contains(&key) {
        keys.push(key);
    }
}
