//! Service configuration, built once at startup and passed to every component.

use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::time::Duration;

/// A league ingested by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct League {
    /// Short tag stored on canonical entities (e.g. `ncaab`).
    pub id: String,
    /// The Odds API sport key (e.g. `basketball_ncaab`).
    pub sport_key: String,
    /// Scoreboard path for final results (e.g. `basketball/nba`), if any.
    pub scoreboard_path: Option<String>,
}

impl League {
    pub fn new(id: &str, sport_key: &str) -> Self {
        Self {
            id: id.to_string(),
            sport_key: sport_key.to_string(),
            scoreboard_path: None,
        }
    }

    pub fn with_scoreboard(mut self, path: &str) -> Self {
        self.scoreboard_path = Some(path.to_string());
        self
    }

    /// Parses `id=sport_key[@scoreboard/path]`.
    pub fn parse(entry: &str) -> Result<Self> {
        let (id, rest) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("league entry '{}' must look like id=sport_key", entry))?;
        let (sport_key, scoreboard) = match rest.split_once('@') {
            Some((key, path)) => (key, Some(path)),
            None => (rest, None),
        };
        let id = id.trim();
        let sport_key = sport_key.trim();
        if id.is_empty() || sport_key.is_empty() {
            bail!("league entry '{}' has an empty id or sport key", entry);
        }
        let mut league = League::new(id, sport_key);
        if let Some(path) = scoreboard.map(str::trim).filter(|p| !p.is_empty()) {
            league = league.with_scoreboard(path);
        }
        Ok(league)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub odds_api_key: String,
    pub odds_api_base_url: String,
    pub scoreboard_base_url: String,
    pub store_backend: StoreBackend,
    pub database_url: String,
    /// Snapshot notifications are disabled when unset.
    pub redis_url: Option<String>,
    pub trigger_secret: String,
    /// Admin endpoints are disabled when unset.
    pub admin_secret: Option<String>,
    pub leagues: Vec<League>,
    pub live_threshold: Duration,
    /// Wall-clock budget for one run; must stay below `host_ceiling`.
    pub run_budget: Duration,
    pub host_ceiling: Duration,
    pub max_parallel_leagues: usize,
    pub requests_per_minute: u32,
    pub fuzzy_accept_threshold: f64,
    pub fuzzy_ambiguity_margin: f64,
    /// Also fetch first/second-half markets per event (premium endpoint).
    pub period_markets: bool,
    pub http_port: u16,
    /// Seconds between scheduled runs; 0 leaves scheduling to the external trigger.
    pub schedule_interval_seconds: u64,
    /// If true, run once and exit (no polling loop)
    pub run_once: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            odds_api_key: String::new(),
            odds_api_base_url: "https://api.the-odds-api.com/v4".to_string(),
            scoreboard_base_url: "https://site.api.espn.com/apis/site/v2/sports".to_string(),
            store_backend: StoreBackend::Memory,
            database_url: String::new(),
            redis_url: None,
            trigger_secret: String::new(),
            admin_secret: None,
            leagues: Vec::new(),
            live_threshold: Duration::from_secs(5 * 60),
            run_budget: Duration::from_secs(50),
            host_ceiling: Duration::from_secs(60),
            max_parallel_leagues: 4,
            requests_per_minute: 45,
            fuzzy_accept_threshold: 0.92,
            fuzzy_ambiguity_margin: 0.05,
            period_markets: false,
            http_port: 8083,
            schedule_interval_seconds: 0,
            run_once: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // Secrets:
        // - Docker Compose: read from /run/secrets/*
        // - Container platforms without a secrets mount: read from env vars

        let odds_api_key = match env::var("THE_ODDS_API_KEY") {
            Ok(v) if !v.trim().is_empty() => v,
            Ok(_) => return Err(anyhow!("THE_ODDS_API_KEY is set but empty")),
            Err(_) => read_secret_file("/run/secrets/odds_api_key", "odds_api_key")?,
        };
        reject_placeholder("THE_ODDS_API_KEY", &odds_api_key)?;

        let trigger_secret = match env::var("TRIGGER_SECRET") {
            Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
            Ok(_) => return Err(anyhow!("TRIGGER_SECRET is set but empty")),
            Err(_) => read_secret_file("/run/secrets/trigger_secret", "trigger_secret")?,
        };
        reject_placeholder("TRIGGER_SECRET", &trigger_secret)?;

        let admin_secret = env::var("ADMIN_SECRET")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let store_backend = match env::var("STORE")
            .unwrap_or_else(|_| "postgres".to_string())
            .to_lowercase()
            .as_str()
        {
            "postgres" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => return Err(anyhow!("STORE must be 'postgres' or 'memory', got '{}'", other)),
        };

        let database_url = match (store_backend, env::var("DATABASE_URL")) {
            (StoreBackend::Memory, _) => String::new(),
            (_, Ok(v)) if !v.trim().is_empty() => v,
            (_, Ok(_)) => return Err(anyhow!("DATABASE_URL is set but empty")),
            (_, Err(_)) => {
                let db_user = env::var("DB_USER").unwrap_or_else(|_| "markets".to_string());
                let db_name = env::var("DB_NAME").unwrap_or_else(|_| "markets".to_string());
                let db_host = env::var("DB_HOST").unwrap_or_else(|_| "postgres".to_string());
                let db_port = env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());
                let db_password = read_secret_file("/run/secrets/db_password", "db_password")?;
                format!(
                    "postgresql://{}:{}@{}:{}/{}",
                    db_user, db_password, db_host, db_port, db_name
                )
            }
        };

        let redis_url = env::var("REDIS_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let leagues = env::var("LEAGUES")
            .unwrap_or_else(|_| {
                "ncaab=basketball_ncaab@basketball/mens-college-basketball,nba=basketball_nba@basketball/nba"
                    .to_string()
            })
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(League::parse)
            .collect::<Result<Vec<_>>>()
            .context("Failed to parse LEAGUES")?;

        let defaults = Config::default();
        let config = Self {
            odds_api_key,
            odds_api_base_url: env::var("ODDS_API_BASE_URL").unwrap_or(defaults.odds_api_base_url),
            scoreboard_base_url: env::var("SCOREBOARD_BASE_URL")
                .unwrap_or(defaults.scoreboard_base_url),
            store_backend,
            database_url,
            redis_url,
            trigger_secret,
            admin_secret,
            leagues,
            live_threshold: Duration::from_secs(60 * env_parse("LIVE_THRESHOLD_MINUTES", 5u64)),
            run_budget: Duration::from_secs(env_parse("RUN_BUDGET_SECONDS", 50u64)),
            host_ceiling: Duration::from_secs(env_parse("HOST_CEILING_SECONDS", 60u64)),
            max_parallel_leagues: env_parse("MAX_PARALLEL_LEAGUES", 4usize),
            requests_per_minute: env_parse("REQUESTS_PER_MINUTE", 45u32),
            fuzzy_accept_threshold: env_parse("FUZZY_ACCEPT_THRESHOLD", 0.92f64),
            fuzzy_ambiguity_margin: env_parse("FUZZY_AMBIGUITY_MARGIN", 0.05f64),
            period_markets: env_flag("PERIOD_MARKETS"),
            http_port: env_parse("HTTP_PORT", 8083u16),
            schedule_interval_seconds: env_parse("SCHEDULE_INTERVAL_SECONDS", 0u64),
            run_once: env_flag("RUN_ONCE"),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.run_budget >= self.host_ceiling {
            bail!(
                "run budget ({:?}) must be strictly below the host ceiling ({:?})",
                self.run_budget,
                self.host_ceiling
            );
        }
        if self.max_parallel_leagues == 0 {
            bail!("MAX_PARALLEL_LEAGUES must be at least 1");
        }
        if self.requests_per_minute == 0 {
            bail!("REQUESTS_PER_MINUTE must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.fuzzy_accept_threshold) {
            bail!("FUZZY_ACCEPT_THRESHOLD must be within [0, 1]");
        }
        if self.fuzzy_ambiguity_margin < 0.0 || self.fuzzy_ambiguity_margin >= self.fuzzy_accept_threshold {
            bail!("FUZZY_AMBIGUITY_MARGIN must be within [0, threshold)");
        }
        if self.trigger_secret.is_empty() {
            bail!("trigger secret must not be empty");
        }
        Ok(())
    }

    /// Time left between the run budget and the hard ceiling; used as the drain grace.
    pub fn shutdown_grace(&self) -> Duration {
        self.host_ceiling.saturating_sub(self.run_budget) / 2
    }

    pub fn live_threshold_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.live_threshold).unwrap_or_else(|_| chrono::Duration::minutes(5))
    }

    pub fn league(&self, id: &str) -> Option<&League> {
        self.leagues.iter().find(|l| l.id == id)
    }
}

/// Read a secret from Docker secret file - REQUIRED, NO fallbacks
fn read_secret_file(file_path: &str, secret_name: &str) -> Result<String> {
    std::fs::read_to_string(file_path)
        .map(|s| s.trim().to_string())
        .context(format!(
            "CRITICAL: Secret file not found at {} ({}). Container must have secrets mounted.",
            file_path, secret_name
        ))
}

/// Prevent accidental use of sample/placeholder values
fn reject_placeholder(name: &str, value: &str) -> Result<()> {
    let lower = value.trim().to_lowercase();
    if lower.contains("change_me") || lower.contains("your_") || lower.starts_with("sample") {
        return Err(anyhow!(
            "{} appears to be a placeholder value; replace with your real value",
            name
        ));
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            trigger_secret: "s3cret".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_league_entry_parsing() {
        let league = League::parse("nba=basketball_nba@basketball/nba").unwrap();
        assert_eq!(league.id, "nba");
        assert_eq!(league.sport_key, "basketball_nba");
        assert_eq!(league.scoreboard_path.as_deref(), Some("basketball/nba"));

        let bare = League::parse(" ncaab = basketball_ncaab ").unwrap();
        assert_eq!(bare.id, "ncaab");
        assert!(bare.scoreboard_path.is_none());

        assert!(League::parse("nba").is_err());
        assert!(League::parse("=basketball_nba").is_err());
    }

    #[test]
    fn test_budget_must_stay_below_ceiling() {
        assert!(valid().validate().is_ok());

        let config = Config {
            run_budget: Duration::from_secs(60),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shutdown_grace_is_half_the_margin() {
        assert_eq!(valid().shutdown_grace(), Duration::from_secs(5));
    }

    #[test]
    fn test_placeholder_rejected() {
        assert!(reject_placeholder("KEY", "your_api_key_here").is_err());
        assert!(reject_placeholder("KEY", "CHANGE_ME").is_err());
        assert!(reject_placeholder("KEY", "d41d8cd98f00").is_ok());
    }
}
