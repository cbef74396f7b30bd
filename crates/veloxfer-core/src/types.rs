//! Types module - data structures for Veloxfer
//!
//! These types define the data models shared across the engine.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

/// How a transfer is carried out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransferStrategy {
    Single,
    MultiConnection,
    #[default]
    Adaptive,
    Streaming,
}

impl std::fmt::Display for TransferStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStrategy::Single => write!(f, "single"),
            TransferStrategy::MultiConnection => write!(f, "multi_connection"),
            TransferStrategy::Adaptive => write!(f, "adaptive"),
            TransferStrategy::Streaming => write!(f, "streaming"),
        }
    }
}

impl From<&str> for TransferStrategy {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "single" => TransferStrategy::Single,
            "multi_connection" => TransferStrategy::MultiConnection,
            "adaptive" => TransferStrategy::Adaptive,
            "streaming" => TransferStrategy::Streaming,
            _ => TransferStrategy::Adaptive,
        }
    }
}

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransferType {
    #[default]
    Download,
    Upload,
}

impl std::fmt::Display for TransferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferType::Download => write!(f, "download"),
            TransferType::Upload => write!(f, "upload"),
        }
    }
}

impl From<&str> for TransferType {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "upload" => TransferType::Upload,
            _ => TransferType::Download,
        }
    }
}

/// Lifecycle state of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransferStatus {
    #[default]
    Pending,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferStatus::Pending => write!(f, "pending"),
            TransferStatus::Transferring => write!(f, "transferring"),
            TransferStatus::Completed => write!(f, "completed"),
            TransferStatus::Failed => write!(f, "failed"),
            TransferStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-chunk compression algorithm for multipart uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionAlgorithm {
    None,
    Gzip,
    #[default]
    Zstd,
    Lz4,
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompressionAlgorithm::None => write!(f, "none"),
            CompressionAlgorithm::Gzip => write!(f, "gzip"),
            CompressionAlgorithm::Zstd => write!(f, "zstd"),
            CompressionAlgorithm::Lz4 => write!(f, "lz4"),
        }
    }
}

impl From<&str> for CompressionAlgorithm {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "gzip" => CompressionAlgorithm::Gzip,
            "zstd" => CompressionAlgorithm::Zstd,
            "lz4" => CompressionAlgorithm::Lz4,
            _ => CompressionAlgorithm::None,
        }
    }
}

/// The plan produced by the optimizer for one transfer attempt.
///
/// Immutable per attempt; the adaptive strategy swaps in a revised
/// instance for subsequent chunk rounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOptimization {
    pub strategy: TransferStrategy,
    pub chunk_size: u64,
    pub connections: u32,
    pub buffer_size: u64,
    pub compression_enabled: bool,
    pub encryption_enabled: bool,
    pub resume_enabled: bool,
    /// 1 (lowest) to 10 (highest)
    pub priority: u8,
    /// Bytes per second
    pub estimated_speed: f64,
    /// 0.0 to 1.0
    pub confidence: f64,
}

impl Default for TransferOptimization {
    fn default() -> Self {
        Self {
            strategy: TransferStrategy::Single,
            chunk_size: 1024 * 1024,
            connections: 1,
            buffer_size: 2 * 1024 * 1024,
            compression_enabled: false,
            encryption_enabled: false,
            resume_enabled: true,
            priority: 5,
            estimated_speed: 0.0,
            confidence: 0.5,
        }
    }
}

/// File metadata fed into the planner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInfo {
    pub size: u64,
    pub content_type: String,
    pub supports_range: bool,
}

/// Caller-supplied hints for planning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanHints {
    pub priority: Option<u8>,
    pub prefer_strategy: Option<TransferStrategy>,
}

/// Point-in-time view of network quality, pull-based
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub latency_ms: f64,
    pub bandwidth_bps: f64,
    /// Ratio 0.0 to 1.0
    pub packet_loss: f64,
    /// 0.0 (unusable) to 1.0 (excellent)
    pub quality_score: f64,
}

impl Default for NetworkSnapshot {
    fn default() -> Self {
        // Unknown network: assume a mediocre link so plans stay conservative
        Self {
            latency_ms: 100.0,
            bandwidth_bps: 0.0,
            packet_loss: 0.0,
            quality_score: 0.5,
        }
    }
}

/// Immutable per-update speed snapshot handed to progress subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedData {
    /// Unix seconds
    pub timestamp: f64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// Bytes per second
    pub speed: f64,
    pub progress_percent: f64,
    pub eta_seconds: f64,
    pub transfer_id: String,
}

/// Live state of one transfer, exclusively owned by the monitor
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub transfer_id: String,
    pub user_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub transfer_type: TransferType,
    pub started_at: Instant,
    /// Unix seconds, kept for persisted records
    pub start_time: f64,
    pub status: TransferStatus,
    pub priority: u8,
    pub tags: Vec<String>,
    pub speed_samples: VecDeque<f64>,
    pub error_count: u32,
    pub retry_count: u32,
    pub last_checkpoint: Option<Instant>,
    pub last_checkpoint_bytes: u64,
    /// Oracle seed, bytes per second
    pub predicted_speed: Option<f64>,
}

impl TransferContext {
    pub fn new(
        transfer_id: String,
        user_id: String,
        file_name: String,
        file_size: u64,
        transfer_type: TransferType,
        priority: u8,
    ) -> Self {
        Self {
            transfer_id,
            user_id,
            file_name,
            file_size,
            transfer_type,
            started_at: Instant::now(),
            start_time: unix_now(),
            status: TransferStatus::Pending,
            priority: priority.clamp(1, 10),
            tags: Vec::new(),
            speed_samples: VecDeque::new(),
            error_count: 0,
            retry_count: 0,
            last_checkpoint: None,
            last_checkpoint_bytes: 0,
            predicted_speed: None,
        }
    }

    /// Append a speed sample, keeping the history bounded
    pub fn push_sample(&mut self, speed: f64, cap: usize) {
        self.speed_samples.push_back(speed);
        while self.speed_samples.len() > cap {
            self.speed_samples.pop_front();
        }
    }
}

/// Final record for one completed (or failed) transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferStats {
    pub transfer_id: String,
    pub user_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub transfer_type: TransferType,
    pub duration_seconds: f64,
    pub avg_speed_bps: f64,
    pub max_speed_bps: f64,
    pub min_speed_bps: f64,
    pub success: bool,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub tags: Vec<String>,
    pub started_at: String,
    pub finished_at: String,
}

/// One observed transfer outcome, appended to the learning ring buffer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRecord {
    /// Unix seconds
    pub timestamp: f64,
    pub host: String,
    pub strategy: TransferStrategy,
    pub file_size: u64,
    pub speed_bps: f64,
    pub duration_seconds: f64,
    pub success: bool,
    pub snapshot: NetworkSnapshot,
}

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Base download chunk size in bytes
    pub chunk_size: u64,
    pub max_connections: u32,
    /// Ceiling for chunk_size * connections and for buffer sizing
    pub buffer_ceiling: u64,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub upload_chunk_size: u64,
    pub parallel_uploads: u32,
    pub compression_algorithm: CompressionAlgorithm,
    pub compression_level: i32,
    pub compression_min_size: u64,
    pub adaptive_compression: bool,
    pub encryption_enabled: bool,
    pub adaptive_interval_secs: u64,
    /// Halve connections when observed speed falls below this fraction
    /// of the plan estimate
    pub low_speed_factor: f64,
    /// Double chunk size when stability exceeds this
    pub stability_threshold: f64,
    pub dns_ttl_secs: u64,
    pub dns_timeout_ms: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout_secs: u64,
    pub breaker_half_open_successes: u32,
    pub breaker_idle_gc_secs: u64,
    pub history_size: usize,
    pub speed_sample_cap: usize,
    pub stale_timeout_secs: u64,
    pub maintenance_interval_secs: u64,
    pub learning_capacity: usize,
    /// 0 = unlimited
    pub user_quota_bytes: u64,
    pub data_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("veloxfer")
            .to_string_lossy()
            .to_string();

        Self {
            chunk_size: 5 * 1024 * 1024,
            max_connections: 16,
            buffer_ceiling: 64 * 1024 * 1024,
            timeout_secs: 30,
            retry_attempts: 3,
            upload_chunk_size: 2 * 1024 * 1024,
            parallel_uploads: 5,
            compression_algorithm: CompressionAlgorithm::Zstd,
            compression_level: 3,
            compression_min_size: 1024 * 1024,
            adaptive_compression: true,
            encryption_enabled: false,
            adaptive_interval_secs: 5,
            low_speed_factor: 0.5,
            stability_threshold: 0.9,
            dns_ttl_secs: 300,
            dns_timeout_ms: 2000,
            breaker_failure_threshold: 5,
            breaker_reset_timeout_secs: 60,
            breaker_half_open_successes: 3,
            breaker_idle_gc_secs: 3600,
            history_size: 500,
            speed_sample_cap: 100,
            stale_timeout_secs: 3600,
            maintenance_interval_secs: 300,
            learning_capacity: 1000,
            user_quota_bytes: 0,
            data_dir,
        }
    }
}

/// Current unix time in fractional seconds
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_round_trip() {
        for s in [
            TransferStrategy::Single,
            TransferStrategy::MultiConnection,
            TransferStrategy::Adaptive,
            TransferStrategy::Streaming,
        ] {
            assert_eq!(TransferStrategy::from(s.to_string().as_str()), s);
        }
        assert_eq!(
            TransferStrategy::from("garbage"),
            TransferStrategy::Adaptive
        );
    }

    #[test]
    fn test_sample_history_is_bounded() {
        let mut ctx = TransferContext::new(
            "t1".into(),
            "u1".into(),
            "f.bin".into(),
            1024,
            TransferType::Download,
            5,
        );
        for i in 0..250 {
            ctx.push_sample(i as f64, 100);
        }
        assert_eq!(ctx.speed_samples.len(), 100);
        assert_eq!(*ctx.speed_samples.back().unwrap(), 249.0);
        assert_eq!(*ctx.speed_samples.front().unwrap(), 150.0);
    }

    #[test]
    fn test_priority_is_clamped() {
        let ctx = TransferContext::new(
            "t1".into(),
            "u1".into(),
            "f.bin".into(),
            0,
            TransferType::Upload,
            42,
        );
        assert_eq!(ctx.priority, 10);
    }
}
