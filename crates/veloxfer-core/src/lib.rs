//! Veloxfer Core Library
//!
//! This crate provides the adaptive transfer engine: strategy planning,
//! bounded-concurrency execution, circuit breaking, DNS caching and live
//! speed/ETA monitoring. It is transport-agnostic and UI-agnostic; bot
//! frontends, HTTP services and CLIs consume it through `TransferEngine`
//! and the event bus.

pub mod breaker;
pub mod cache;
pub mod db;
pub mod dns;
pub mod engine;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod network;
pub mod oracle;
pub mod planner;
pub mod service;
pub mod types;
pub mod utils;

// Re-exports for convenience
pub use breaker::{BreakerConfig, BreakerState, CircuitBreakerRegistry};
pub use cache::{CacheEntry, CacheManager, DiskCache, NoopCache};
pub use db::{get_db_path, init_database, init_database_at, Database, StatsDb, StatsTotals};
pub use dns::{DnsCache, Resolver, SystemResolver};
pub use engine::{
    DownloadRequest, PerformanceReport, TransferEngine, TransferReport, UploadRequest,
};
pub use error::{Error, Result};
pub use executor::{
    CancelToken, ChunkManifestEntry, DownloadOutcome, ProgressUpdate, TransferExecutor,
    UploadOutcome,
};
pub use monitor::{
    AdaptiveSpeedMonitor, LiveStats, OptimizationReport, Recommendation, SpeedGraphData,
    SystemOverview,
};
pub use network::{FixedAnalyzer, NetworkAnalyzer, PassiveNetworkAnalyzer};
pub use oracle::{HistoryOracle, NoopOracle, Prediction, SpeedOracle};
pub use planner::TransferPlanner;
pub use service::{EventBus, TransferEvent};
pub use types::*;
pub use utils::{calculate_progress, format_bytes, format_eta, format_speed};
