//! Market ingestion engine: provider feeds in, one deduplicated history of
//! market snapshots per canonical match out, plus grading of stored picks.

pub mod config;
pub mod engine;
pub mod error;
pub mod grading;
pub mod model;
pub mod normalize;
pub mod orchestrator;
pub mod provider;
pub mod publish;
pub mod resolver;
pub mod server;
pub mod snapshots;
pub mod store;

pub use config::{Config, League};
pub use engine::Engine;
pub use error::{EngineError, Result};
