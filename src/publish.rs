//! Downstream notification of newly appended snapshots.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::MarketSnapshot;

/// Redis stream new snapshots are appended to.
pub const SNAPSHOT_STREAM: &str = "odds.snapshots";

#[async_trait]
pub trait SnapshotPublisher: Send + Sync {
    async fn publish(&self, snapshots: &[MarketSnapshot]) -> Result<()>;
}

/// Used when no Redis URL is configured.
#[derive(Debug, Clone, Default)]
pub struct NoopPublisher;

#[async_trait]
impl SnapshotPublisher for NoopPublisher {
    async fn publish(&self, snapshots: &[MarketSnapshot]) -> Result<()> {
        debug!(count = snapshots.len(), "Snapshot publishing disabled");
        Ok(())
    }
}

#[derive(Clone)]
pub struct RedisPublisher {
    conn: redis::aio::ConnectionManager,
}

impl RedisPublisher {
    pub async fn connect_with_retry(url: &str, max_retries: u32) -> Result<Self> {
        let mut attempt = 0;
        loop {
            let connected = match redis::Client::open(url) {
                Ok(client) => redis::aio::ConnectionManager::new(client).await,
                Err(e) => Err(e),
            };
            match connected {
                Ok(conn) => {
                    info!("Connected to Redis");
                    return Ok(Self { conn });
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_retries {
                        return Err(e.into());
                    }
                    warn!("Redis connection attempt {} failed: {}. Retrying...", attempt, e);
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
            }
        }
    }
}

#[async_trait]
impl SnapshotPublisher for RedisPublisher {
    async fn publish(&self, snapshots: &[MarketSnapshot]) -> Result<()> {
        if snapshots.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        for snapshot in snapshots {
            let payload = serde_json::to_string(snapshot)?;
            let _: String = conn
                .xadd(
                    SNAPSHOT_STREAM,
                    "*",
                    &[
                        ("match_id", snapshot.match_id.to_string()),
                        ("provider", snapshot.provider.clone()),
                        ("period", snapshot.period.as_str().to_string()),
                        ("is_live", snapshot.is_live.to_string()),
                        ("data", payload),
                    ],
                )
                .await?;
        }

        info!(count = snapshots.len(), stream = SNAPSHOT_STREAM, "Published snapshots to Redis");
        Ok(())
    }
}
