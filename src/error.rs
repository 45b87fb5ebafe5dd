use thiserror::Error;
use uuid::Uuid;

/// Maximum number of characters of an upstream body kept for diagnosis.
pub const PREVIEW_CHARS: usize = 200;

/// Engine error taxonomy.
///
/// Only `Auth` and `Config` are fatal to a whole run; everything else is
/// contained at league or pick granularity by the callers.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Malformed upstream response (status {status}): {preview}")]
    UpstreamMalformed { status: u16, preview: String },

    #[error("Provider quota exhausted: {0}")]
    QuotaExceeded(String),

    #[error("Ambiguous entity for {provider}/{external_id}")]
    EntityAmbiguous { provider: String, external_id: String },

    #[error("Grading data missing for pick {pick_id}: {reason}")]
    GradingDataMissing { pick_id: Uuid, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("An ingestion run is already in progress")]
    RunInProgress,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Builds an `UpstreamMalformed` error, keeping only a bounded preview of the body.
    pub fn malformed(status: u16, body: &str) -> Self {
        EngineError::UpstreamMalformed {
            status,
            preview: truncate_preview(body),
        }
    }
}

/// Truncates a body to `PREVIEW_CHARS` characters on a char boundary.
pub fn truncate_preview(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= PREVIEW_CHARS {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(PREVIEW_CHARS).collect();
    out.push('…');
    out
}
