//! Transfer engine facade
//!
//! Wires planner, executor, monitor, breaker, DNS cache and the cache
//! manager together behind one surface: check the breaker, consult the
//! cache, plan, register, execute with progress wiring, finalize. Owns
//! the per-user usage ledger and the background maintenance loop.

use crate::breaker::{BreakerConfig, CircuitBreakerRegistry};
use crate::cache::{CacheManager, NoopCache};
use crate::db::{init_database_at, Database, StatsDb};
use crate::dns::DnsCache;
use crate::error::{Error, Result};
use crate::executor::{host_of, CancelToken, ProgressUpdate, TransferExecutor};
use crate::monitor::{
    AdaptiveSpeedMonitor, LiveStats, OptimizationReport, SpeedGraphData, SystemOverview,
};
use crate::network::{NetworkAnalyzer, PassiveNetworkAnalyzer};
use crate::oracle::{HistoryOracle, SpeedOracle};
use crate::planner::TransferPlanner;
use crate::service::{EventBus, TransferEvent};
use crate::types::{PlanHints, Settings, TransferStats, TransferType};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A download job handed to the engine
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: PathBuf,
    pub user_id: String,
    pub priority: u8,
    pub tags: Vec<String>,
    pub hints: Option<PlanHints>,
}

/// An upload job handed to the engine
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub source: PathBuf,
    pub upload_url: String,
    pub user_id: String,
    pub priority: u8,
    pub tags: Vec<String>,
    pub hints: Option<PlanHints>,
}

/// Stats for a transfer, live or already finished
#[derive(Debug, Clone, Serialize)]
pub enum TransferReport {
    Live(LiveStats),
    Finished(TransferStats),
}

/// Snapshot of engine internals for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub overview: SystemOverview,
    pub dns_cache_entries: usize,
    pub circuit_breakers: usize,
    pub learning_records: usize,
}

#[derive(Default)]
struct UserUsage {
    reserved: u64,
    used: u64,
}

/// Per-user byte accounting. Reservations are taken before a transfer
/// starts, committed on success and rolled back on failure.
struct UsageLedger {
    quota: u64,
    users: Mutex<HashMap<String, UserUsage>>,
}

impl UsageLedger {
    fn new(quota: u64) -> Self {
        Self {
            quota,
            users: Mutex::new(HashMap::new()),
        }
    }

    fn reserve(&self, user: &str, bytes: u64) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        let usage = users.entry(user.to_string()).or_default();
        if self.quota > 0 && usage.used + usage.reserved + bytes > self.quota {
            return Err(Error::QuotaExceeded {
                user: user.to_string(),
                requested: bytes,
            });
        }
        usage.reserved += bytes;
        Ok(())
    }

    fn commit(&self, user: &str, bytes: u64) {
        let mut users = self.users.lock().unwrap();
        if let Some(usage) = users.get_mut(user) {
            usage.reserved = usage.reserved.saturating_sub(bytes);
            usage.used += bytes;
        }
    }

    fn rollback(&self, user: &str, bytes: u64) {
        let mut users = self.users.lock().unwrap();
        if let Some(usage) = users.get_mut(user) {
            usage.reserved = usage.reserved.saturating_sub(bytes);
        }
    }

    fn usage_of(&self, user: &str) -> (u64, u64) {
        let users = self.users.lock().unwrap();
        users
            .get(user)
            .map(|u| (u.reserved, u.used))
            .unwrap_or((0, 0))
    }
}

pub struct TransferEngine {
    settings: Settings,
    planner: TransferPlanner,
    executor: TransferExecutor,
    monitor: Arc<AdaptiveSpeedMonitor>,
    breaker: Arc<CircuitBreakerRegistry>,
    dns: Arc<DnsCache>,
    analyzer: Arc<PassiveNetworkAnalyzer>,
    cache: Arc<dyn CacheManager>,
    bus: Arc<EventBus>,
    usage: UsageLedger,
    cancels: Mutex<HashMap<String, CancelToken>>,
}

impl TransferEngine {
    /// Engine with the default oracle and no transfer cache, persisting
    /// stats under `settings.data_dir`.
    pub fn new(settings: Settings) -> Result<Self> {
        let db_path = PathBuf::from(&settings.data_dir).join("veloxfer.db");
        let db = init_database_at(&db_path)?;
        Ok(Self::with_components(
            settings,
            Arc::new(HistoryOracle::new()),
            Arc::new(NoopCache),
            Some(db),
        ))
    }

    /// Full-control constructor for callers that bring their own oracle,
    /// cache or database.
    pub fn with_components(
        settings: Settings,
        oracle: Arc<dyn SpeedOracle>,
        cache: Arc<dyn CacheManager>,
        db: Option<Database>,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let analyzer = Arc::new(PassiveNetworkAnalyzer::new());
        let breaker = Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: settings.breaker_failure_threshold,
            reset_timeout: Duration::from_secs(settings.breaker_reset_timeout_secs),
            half_open_successes: settings.breaker_half_open_successes,
            idle_gc_after: Duration::from_secs(settings.breaker_idle_gc_secs),
        }));
        let dns = Arc::new(DnsCache::new(
            Duration::from_secs(settings.dns_ttl_secs),
            Duration::from_millis(settings.dns_timeout_ms),
        ));

        let planner = TransferPlanner::new(settings.clone(), oracle.clone());
        let executor = TransferExecutor::new(
            settings.clone(),
            dns.clone(),
            breaker.clone(),
            analyzer.clone(),
        );
        let monitor = Arc::new(AdaptiveSpeedMonitor::new(
            &settings,
            bus.clone(),
            oracle,
            analyzer.clone(),
            db,
        ));
        let usage = UsageLedger::new(settings.user_quota_bytes);

        Self {
            settings,
            planner,
            executor,
            monitor,
            breaker,
            dns,
            analyzer,
            cache,
            bus,
            usage,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Download a file. Returns the final stats on success; failures
    /// carry a human-readable reason and a machine-readable kind.
    pub async fn download(&self, request: DownloadRequest) -> Result<TransferStats> {
        let host = host_of(&request.url)?;
        // Fail fast before any network attempt while the host is blocked
        self.breaker.check(&host)?;

        let info = self.executor.analyze_file(&request.url).await;
        let snapshot = self.analyzer.analyze();
        let history = self.planner.history_for(&host, info.size);
        let hints = request.hints.clone().unwrap_or(PlanHints {
            priority: Some(request.priority),
            prefer_strategy: None,
        });
        let plan = self.planner.plan(&info, &snapshot, &history, Some(&hints));

        self.usage.reserve(&request.user_id, info.size)?;

        let transfer_id = format!("dl_{}", uuid::Uuid::new_v4().simple());
        let file_name = request
            .destination
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| request.url.clone());

        if let Err(e) = self
            .monitor
            .register_transfer(
                &transfer_id,
                &request.user_id,
                &file_name,
                info.size,
                TransferType::Download,
                plan.priority,
                request.tags.clone(),
            )
            .await
        {
            self.usage.rollback(&request.user_id, info.size);
            return Err(e);
        }

        // Cache hit skips the network entirely
        if let Some(entry) = self.cache.get(&request.url).await {
            log::info!("cache hit for {}, skipping transfer", request.url);
            match tokio::fs::copy(&entry.path, &request.destination).await {
                Ok(copied) => {
                    self.monitor
                        .update_progress(&transfer_id, copied, Some(copied), None, None)
                        .await;
                    self.usage.commit(&request.user_id, info.size);
                    return self
                        .monitor
                        .complete_transfer(&transfer_id, true, None)
                        .await
                        .ok_or_else(|| Error::NotFound(transfer_id));
                }
                Err(e) => {
                    log::warn!("cache copy failed, transferring instead: {}", e);
                }
            }
        }

        let cancel = CancelToken::new();
        self.cancels
            .lock()
            .unwrap()
            .insert(transfer_id.clone(), cancel.clone());

        let (tx, rx) = async_channel::unbounded::<ProgressUpdate>();
        let forwarder = self.spawn_progress_forwarder(transfer_id.clone(), rx);

        let result = self
            .executor
            .download(&request.url, &request.destination, &plan, tx, cancel)
            .await;
        let _ = forwarder.await;
        self.cancels.lock().unwrap().remove(&transfer_id);

        match result {
            Ok(outcome) => {
                let speed = outcome.bytes as f64 / outcome.duration.as_secs_f64().max(1e-6);
                if let Err(e) = self
                    .cache
                    .put(&request.url, &request.destination, &outcome.checksum)
                    .await
                {
                    log::warn!("cache store for {} failed: {}", request.url, e);
                }
                self.planner.record_outcome(
                    &host,
                    plan.strategy,
                    outcome.bytes,
                    speed,
                    outcome.duration.as_secs_f64(),
                    true,
                    &snapshot,
                );
                self.usage.commit(&request.user_id, info.size);
                self.monitor
                    .complete_transfer(&transfer_id, true, None)
                    .await
                    .ok_or_else(|| Error::NotFound(transfer_id))
            }
            Err(e) => {
                self.planner.record_outcome(
                    &host,
                    plan.strategy,
                    info.size,
                    0.0,
                    0.0,
                    false,
                    &snapshot,
                );
                self.usage.rollback(&request.user_id, info.size);
                self.monitor
                    .complete_transfer(
                        &transfer_id,
                        false,
                        Some(format!("{} ({})", e, e.kind())),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Upload a file, multipart for anything beyond the single strategy
    pub async fn upload(&self, request: UploadRequest) -> Result<TransferStats> {
        let host = host_of(&request.upload_url)?;
        self.breaker.check(&host)?;

        let meta = tokio::fs::metadata(&request.source).await?;
        let file_size = meta.len();
        let snapshot = self.analyzer.analyze();
        let history = self.planner.history_for(&host, file_size);

        let info = crate::types::FileInfo {
            size: file_size,
            content_type: String::new(),
            supports_range: true,
        };
        let hints = request.hints.clone().unwrap_or(PlanHints {
            priority: Some(request.priority),
            prefer_strategy: None,
        });
        let plan = self.planner.plan(&info, &snapshot, &history, Some(&hints));

        self.usage.reserve(&request.user_id, file_size)?;

        let transfer_id = format!("ul_{}", uuid::Uuid::new_v4().simple());
        let file_name = request
            .source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload.bin".to_string());

        if let Err(e) = self
            .monitor
            .register_transfer(
                &transfer_id,
                &request.user_id,
                &file_name,
                file_size,
                TransferType::Upload,
                plan.priority,
                request.tags.clone(),
            )
            .await
        {
            self.usage.rollback(&request.user_id, file_size);
            return Err(e);
        }

        let cancel = CancelToken::new();
        self.cancels
            .lock()
            .unwrap()
            .insert(transfer_id.clone(), cancel.clone());

        let (tx, rx) = async_channel::unbounded::<ProgressUpdate>();
        let forwarder = self.spawn_progress_forwarder(transfer_id.clone(), rx);

        let result = self
            .executor
            .upload(&request.source, &request.upload_url, &plan, tx, cancel)
            .await;
        let _ = forwarder.await;
        self.cancels.lock().unwrap().remove(&transfer_id);

        match result {
            Ok(outcome) => {
                let speed = outcome.bytes as f64 / outcome.duration.as_secs_f64().max(1e-6);
                self.planner.record_outcome(
                    &host,
                    plan.strategy,
                    outcome.bytes,
                    speed,
                    outcome.duration.as_secs_f64(),
                    true,
                    &snapshot,
                );
                self.usage.commit(&request.user_id, file_size);
                self.monitor
                    .complete_transfer(&transfer_id, true, None)
                    .await
                    .ok_or_else(|| Error::NotFound(transfer_id))
            }
            Err(e) => {
                self.planner.record_outcome(
                    &host,
                    plan.strategy,
                    file_size,
                    0.0,
                    0.0,
                    false,
                    &snapshot,
                );
                self.usage.rollback(&request.user_id, file_size);
                self.monitor
                    .complete_transfer(
                        &transfer_id,
                        false,
                        Some(format!("{} ({})", e, e.kind())),
                    )
                    .await;
                Err(e)
            }
        }
    }

    fn spawn_progress_forwarder(
        &self,
        transfer_id: String,
        rx: async_channel::Receiver<ProgressUpdate>,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = self.monitor.clone();
        tokio::spawn(async move {
            while let Ok(update) = rx.recv().await {
                match update {
                    ProgressUpdate::Bytes {
                        bytes_transferred,
                        total_bytes,
                    } => {
                        monitor
                            .update_progress(&transfer_id, bytes_transferred, total_bytes, None, None)
                            .await;
                    }
                    ProgressUpdate::Retry => {
                        monitor.record_retry(&transfer_id).await;
                    }
                }
            }
        })
    }

    /// Flip a transfer's cancellation flag. The executor notices between
    /// chunks; in-flight chunk requests run to completion or timeout.
    pub fn cancel_transfer(&self, transfer_id: &str) -> bool {
        let cancels = self.cancels.lock().unwrap();
        match cancels.get(transfer_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Background maintenance: DNS purge, breaker GC, stale-transfer
    /// cleanup. No lock is held across an await point.
    pub fn spawn_maintenance(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = self;
        let interval = Duration::from_secs(engine.settings.maintenance_interval_secs.max(1));
        let stale = Duration::from_secs(engine.settings.stale_timeout_secs);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                engine.dns.purge_expired();
                engine.breaker.gc();
                let failed = engine.monitor.cleanup_stale(stale).await;
                if !failed.is_empty() {
                    log::info!("maintenance failed {} stale transfers", failed.len());
                }
            }
        })
    }

    // Pass-through surface

    pub fn subscribe(&self) -> async_channel::Receiver<TransferEvent> {
        self.bus.subscribe()
    }

    pub fn subscribe_transfer(&self, transfer_id: &str) -> async_channel::Receiver<TransferEvent> {
        self.bus.subscribe_transfer(transfer_id)
    }

    /// Live snapshot for an active transfer, or the persisted record for
    /// a finished one.
    pub async fn get_transfer_stats(&self, transfer_id: &str) -> Option<TransferReport> {
        if let Some(live) = self.monitor.live_stats(transfer_id).await {
            return Some(TransferReport::Live(live));
        }
        let db = self.monitor.database()?;
        match StatsDb::get_by_id(&db, transfer_id) {
            Ok(found) => found.map(TransferReport::Finished),
            Err(e) => {
                log::error!("stats lookup for {} failed: {}", transfer_id, e);
                None
            }
        }
    }

    pub async fn get_speed_graph_data(
        &self,
        transfer_id: &str,
        points: Option<usize>,
        time_range: Option<(f64, f64)>,
    ) -> Option<SpeedGraphData> {
        self.monitor
            .speed_graph_data(transfer_id, points, time_range)
            .await
    }

    pub async fn optimize_transfer(&self, transfer_id: &str) -> Option<OptimizationReport> {
        self.monitor.optimize_transfer(transfer_id).await
    }

    pub async fn get_system_overview(&self) -> SystemOverview {
        self.monitor.system_overview().await
    }

    pub async fn performance_report(&self) -> PerformanceReport {
        PerformanceReport {
            overview: self.monitor.system_overview().await,
            dns_cache_entries: self.dns.len(),
            circuit_breakers: self.breaker.len(),
            learning_records: self.planner.learning_len(),
        }
    }

    /// Serialized learning ring for external consumers
    pub fn export_learning(&self) -> Result<String> {
        self.planner.export_learning()
    }

    /// (reserved, used) bytes for a user
    pub fn usage_of(&self, user: &str) -> (u64, u64) {
        self.usage.usage_of(user)
    }

    pub fn breaker(&self) -> &CircuitBreakerRegistry {
        &self.breaker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerState;
    use crate::oracle::NoopOracle;

    fn engine() -> TransferEngine {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut settings = Settings::default();
        settings.user_quota_bytes = 0;
        TransferEngine::with_components(
            settings,
            Arc::new(NoopOracle),
            Arc::new(NoopCache),
            Some(Database::open_in_memory().unwrap()),
        )
    }

    #[test]
    fn test_ledger_reserve_commit_rollback() {
        let ledger = UsageLedger::new(0);
        ledger.reserve("u1", 100).unwrap();
        assert_eq!(ledger.usage_of("u1"), (100, 0));

        ledger.commit("u1", 100);
        assert_eq!(ledger.usage_of("u1"), (0, 100));

        ledger.reserve("u1", 50).unwrap();
        ledger.rollback("u1", 50);
        assert_eq!(ledger.usage_of("u1"), (0, 100));
    }

    #[test]
    fn test_ledger_enforces_quota() {
        let ledger = UsageLedger::new(150);
        ledger.reserve("u1", 100).unwrap();
        let err = ledger.reserve("u1", 100).unwrap_err();
        assert_eq!(err.kind(), "quota_exceeded");
        // Another user has their own budget
        ledger.reserve("u2", 100).unwrap();
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast_without_network() {
        let engine = engine();
        for _ in 0..6 {
            engine.breaker.record_failure("x.example.com");
        }
        assert_eq!(engine.breaker.state("x.example.com"), BreakerState::Open);

        let started = std::time::Instant::now();
        let err = engine
            .download(DownloadRequest {
                url: "https://x.example.com/big.bin".into(),
                destination: std::env::temp_dir().join("veloxfer-test-never-written.bin"),
                user_id: "u1".into(),
                priority: 5,
                tags: vec![],
                hints: None,
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "circuit_open");
        // No network attempt: this returns in microseconds, not timeouts
        assert!(started.elapsed() < Duration::from_secs(1));
        // Nothing was registered or reserved
        assert_eq!(engine.monitor.active_count().await, 0);
        assert_eq!(engine.usage_of("u1"), (0, 0));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let engine = engine();
        let err = engine
            .download(DownloadRequest {
                url: "nonsense".into(),
                destination: std::env::temp_dir().join("x.bin"),
                user_id: "u1".into(),
                priority: 5,
                tags: vec![],
                hints: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn test_finished_stats_come_from_store() {
        let engine = engine();
        let db = engine.monitor.database().unwrap();
        let stats = TransferStats {
            transfer_id: "dl_done".into(),
            user_id: "u1".into(),
            file_name: "a.bin".into(),
            file_size: 10,
            transfer_type: TransferType::Download,
            duration_seconds: 1.0,
            avg_speed_bps: 10.0,
            max_speed_bps: 10.0,
            min_speed_bps: 10.0,
            success: true,
            error_message: None,
            retry_count: 0,
            tags: vec![],
            started_at: "2026-08-05T10:00:00+00:00".into(),
            finished_at: "2026-08-05T10:00:01+00:00".into(),
        };
        StatsDb::save(&db, &stats).unwrap();

        match engine.get_transfer_stats("dl_done").await {
            Some(TransferReport::Finished(found)) => assert_eq!(found.file_size, 10),
            other => panic!("unexpected report: {:?}", other),
        }
        assert!(engine.get_transfer_stats("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_unknown_transfer_is_false() {
        let engine = engine();
        assert!(!engine.cancel_transfer("ghost"));
    }
}
