//! Wires the components together from one `Config`.

use anyhow::Context;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info};

use crate::config::{Config, League, StoreBackend};
use crate::error::{EngineError, Result};
use crate::grading::GradingEngine;
use crate::orchestrator::{Orchestrator, OrchestratorSettings, RunResult, RunState};
use crate::provider::{FeedProvider, HttpFeedProvider};
use crate::publish::{NoopPublisher, RedisPublisher, SnapshotPublisher};
use crate::resolver::{EntityResolver, ResolverSettings};
use crate::snapshots::{LiveClassifier, SnapshotService};
use crate::store::{MemoryStore, PgStore, Store};

/// Service health state
#[derive(Clone, Default)]
pub struct HealthState {
    pub last_run_time: Arc<RwLock<Option<DateTime<Utc>>>>,
    pub last_run_state: Arc<RwLock<Option<RunState>>>,
    pub last_run_snapshots: Arc<RwLock<usize>>,
    pub consecutive_failures: Arc<RwLock<usize>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_run(&self, result: &RunResult) {
        let appended: usize = result.leagues.iter().map(|l| l.counts.snapshots_appended).sum();
        *self.last_run_time.write().await = result.finished_at;
        *self.last_run_state.write().await = Some(result.state);
        *self.last_run_snapshots.write().await = appended;
        if result.state == RunState::Failed {
            *self.consecutive_failures.write().await += 1;
        } else {
            *self.consecutive_failures.write().await = 0;
        }
    }

    pub async fn record_error(&self) {
        *self.consecutive_failures.write().await += 1;
    }
}

pub struct Engine {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    resolver: EntityResolver,
    snapshots: SnapshotService,
    grading: GradingEngine,
    orchestrator: Orchestrator,
    health: HealthState,
    run_lock: Mutex<()>,
}

impl Engine {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        provider: Arc<dyn FeedProvider>,
        publisher: Arc<dyn SnapshotPublisher>,
    ) -> Self {
        let resolver = EntityResolver::new(store.clone(), ResolverSettings::from_config(&config));
        let snapshots = SnapshotService::new(
            store.clone(),
            LiveClassifier::new(config.live_threshold_chrono()),
        );
        let orchestrator = Orchestrator::new(
            provider,
            store.clone(),
            resolver.clone(),
            snapshots.clone(),
            publisher,
            OrchestratorSettings::from_config(&config),
        );

        Self {
            grading: GradingEngine::new(store.clone()),
            config: Arc::new(config),
            store,
            resolver,
            snapshots,
            orchestrator,
            health: HealthState::new(),
            run_lock: Mutex::new(()),
        }
    }

    /// Connects the configured store backend, the HTTP feeds and, when a
    /// Redis URL is set, the snapshot stream.
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let store: Arc<dyn Store> = match config.store_backend {
            StoreBackend::Postgres => {
                let pg = PgStore::connect_with_retry(&config.database_url, 5)
                    .await
                    .context("Failed to connect to database")?;
                pg.migrate().await.context("Failed to run migrations")?;
                Arc::new(pg)
            }
            StoreBackend::Memory => {
                info!("Using in-memory store; nothing will be persisted");
                Arc::new(MemoryStore::new())
            }
        };

        let publisher: Arc<dyn SnapshotPublisher> = match config.redis_url.as_deref() {
            Some(url) => Arc::new(
                RedisPublisher::connect_with_retry(url, 5)
                    .await
                    .context("Failed to connect to Redis")?,
            ),
            None => Arc::new(NoopPublisher),
        };

        let provider = HttpFeedProvider::new(&config).context("Failed to create HTTP client")?;
        Ok(Self::new(config, store, Arc::new(provider), publisher))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn resolver(&self) -> &EntityResolver {
        &self.resolver
    }

    pub fn snapshots(&self) -> &SnapshotService {
        &self.snapshots
    }

    pub fn grading(&self) -> &GradingEngine {
        &self.grading
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    /// Configured leagues, optionally narrowed to `ids`.
    pub fn select_leagues(&self, ids: Option<&[String]>) -> Result<Vec<League>> {
        let Some(ids) = ids.filter(|ids| !ids.is_empty()) else {
            return Ok(self.config.leagues.clone());
        };
        ids.iter()
            .map(|id| {
                self.config
                    .league(id)
                    .cloned()
                    .ok_or_else(|| EngineError::NotFound(format!("league {}", id)))
            })
            .collect()
    }

    /// One ingestion run. Overlapping runs are refused rather than queued.
    pub async fn run_ingestion(&self, league_ids: Option<&[String]>) -> Result<RunResult> {
        let _guard = self.run_lock.try_lock().map_err(|_| EngineError::RunInProgress)?;
        let leagues = self.select_leagues(league_ids)?;

        match self.orchestrator.run(&leagues).await {
            Ok(result) => {
                self.health.record_run(&result).await;
                Ok(result)
            }
            Err(e) => {
                self.health.record_error().await;
                error!(error = %e, "Ingestion run aborted");
                Err(e)
            }
        }
    }
}
