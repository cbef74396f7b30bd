//! Transfer optimization planner
//!
//! Combines file metadata, a network snapshot, learning history and the
//! optional speed oracle into a `TransferOptimization`. Planning never
//! fails: missing or nonsensical inputs degrade to a conservative plan.

use crate::oracle::SpeedOracle;
use crate::types::{
    unix_now, FileInfo, LearningRecord, NetworkSnapshot, PlanHints, Settings,
    TransferOptimization, TransferStrategy,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const MIB: u64 = 1024 * 1024;
const MIN_CHUNK: u64 = 64 * 1024;
const MAX_CHUNK: u64 = 50 * MIB;
/// Oracle recommendations below this confidence do not override the rules
const ORACLE_OVERRIDE_CONFIDENCE: f64 = 0.75;

pub struct TransferPlanner {
    settings: Settings,
    oracle: Arc<dyn SpeedOracle>,
    learning: Mutex<VecDeque<LearningRecord>>,
}

impl TransferPlanner {
    pub fn new(settings: Settings, oracle: Arc<dyn SpeedOracle>) -> Self {
        Self {
            settings,
            oracle,
            learning: Mutex::new(VecDeque::new()),
        }
    }

    /// Produce a plan for one transfer attempt. Pure in its inputs.
    pub fn plan(
        &self,
        file: &FileInfo,
        snapshot: &NetworkSnapshot,
        history: &[LearningRecord],
        hints: Option<&PlanHints>,
    ) -> TransferOptimization {
        let (mut strategy, rule_confidence, mut estimated_speed) =
            self.rule_based_strategy(file, snapshot);
        let mut confidence = rule_confidence;

        // A confident oracle recommendation overrides the rule result
        if let Some(prediction) = self.oracle.predict_speed(file.size, snapshot, history) {
            estimated_speed = prediction.speed_bps;
            if prediction.confidence >= ORACLE_OVERRIDE_CONFIDENCE {
                if let Some(hint) = prediction.strategy_hint {
                    strategy = hint;
                }
                confidence = (0.6 * prediction.confidence + 0.4 * rule_confidence).clamp(0.0, 1.0);
            }
        }

        if let Some(preferred) = hints.and_then(|h| h.prefer_strategy) {
            strategy = preferred;
        }

        let mut connections = self.optimal_connections(file.size, snapshot, strategy);
        let mut chunk_size = self.optimal_chunk_size(file.size, snapshot, strategy);

        // Invariant: chunk_size * connections stays under the buffer ceiling
        let ceiling = self.settings.buffer_ceiling.max(MIN_CHUNK);
        if chunk_size * connections as u64 > ceiling {
            chunk_size = (ceiling / connections as u64).max(MIN_CHUNK);
        }
        while chunk_size * connections as u64 > ceiling && connections > 1 {
            connections -= 1;
        }

        let buffer_size = (chunk_size * connections as u64 * 2).min(ceiling);

        TransferOptimization {
            strategy,
            chunk_size,
            connections,
            buffer_size,
            compression_enabled: self.should_compress(file),
            encryption_enabled: self.settings.encryption_enabled,
            resume_enabled: true,
            priority: hints
                .and_then(|h| h.priority)
                .unwrap_or(5)
                .clamp(1, 10),
            estimated_speed,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Rule ladder. Returns (strategy, confidence, estimated bytes/s).
    ///
    /// Huge files normally go multi-connection, but on a demonstrably
    /// good link the adaptive strategy is picked instead: it starts as
    /// multi-connection and keeps the option of re-tuning mid-flight.
    fn rule_based_strategy(
        &self,
        file: &FileInfo,
        snapshot: &NetworkSnapshot,
    ) -> (TransferStrategy, f64, f64) {
        let bandwidth_known = snapshot.bandwidth_bps > 0.0;
        let poor_network =
            snapshot.latency_ms > 200.0 || (bandwidth_known && snapshot.bandwidth_bps < MIB as f64);
        let good_link = snapshot.latency_ms < 50.0
            && bandwidth_known
            && snapshot.bandwidth_bps >= 10.0 * MIB as f64;

        let (strategy, confidence) = if file.size < 2 * MIB {
            (TransferStrategy::Single, 0.9)
        } else if poor_network {
            (TransferStrategy::Single, 0.8)
        } else if file.size > 100 * MIB && !good_link {
            (TransferStrategy::MultiConnection, 0.85)
        } else if file.size > 100 * MIB {
            (TransferStrategy::Adaptive, 0.85)
        } else {
            (TransferStrategy::Adaptive, 0.7)
        };

        let estimated_speed = if bandwidth_known {
            snapshot.bandwidth_bps.min(100.0 * MIB as f64)
        } else if snapshot.latency_ms < 50.0 {
            50.0 * MIB as f64
        } else if snapshot.latency_ms < 100.0 {
            20.0 * MIB as f64
        } else if snapshot.latency_ms < 200.0 {
            10.0 * MIB as f64
        } else {
            5.0 * MIB as f64
        };

        (strategy, confidence, estimated_speed)
    }

    fn optimal_chunk_size(
        &self,
        file_size: u64,
        snapshot: &NetworkSnapshot,
        strategy: TransferStrategy,
    ) -> u64 {
        let base = self.settings.chunk_size.max(MIN_CHUNK);

        if strategy == TransferStrategy::Single {
            return if file_size > 0 { base.min(file_size) } else { base };
        }

        if snapshot.latency_ms > 100.0 {
            (base / 2).max(256 * 1024)
        } else if snapshot.packet_loss > 0.1 {
            (base / 4).max(128 * 1024)
        } else {
            (base * 2).min(MAX_CHUNK)
        }
    }

    fn optimal_connections(
        &self,
        file_size: u64,
        snapshot: &NetworkSnapshot,
        strategy: TransferStrategy,
    ) -> u32 {
        if strategy == TransferStrategy::Single {
            return 1;
        }

        let max_conn = self.settings.max_connections.max(1);
        let by_size = (file_size / (10 * MIB)).max(2) as u32;
        let base = by_size.min(max_conn);

        if snapshot.latency_ms > 150.0 {
            (base / 2).max(2)
        } else {
            base
        }
    }

    fn should_compress(&self, file: &FileInfo) -> bool {
        let content_type = file.content_type.to_lowercase();
        if ["text", "json", "xml", "javascript"]
            .iter()
            .any(|t| content_type.contains(t))
        {
            return true;
        }

        if file.size < self.settings.compression_min_size {
            return false;
        }

        self.settings.adaptive_compression
    }

    /// Record an observed outcome into the learning ring and feed the
    /// oracle. The ring is bounded; old records fall off the head.
    pub fn record_outcome(
        &self,
        host: &str,
        strategy: TransferStrategy,
        file_size: u64,
        speed_bps: f64,
        duration_seconds: f64,
        success: bool,
        snapshot: &NetworkSnapshot,
    ) {
        let record = LearningRecord {
            timestamp: unix_now(),
            host: host.to_string(),
            strategy,
            file_size,
            speed_bps,
            duration_seconds,
            success,
            snapshot: snapshot.clone(),
        };

        {
            let mut learning = self.learning.lock().unwrap();
            learning.push_back(record);
            while learning.len() > self.settings.learning_capacity {
                learning.pop_front();
            }
        }

        if success {
            self.oracle.update_model(speed_bps, file_size, snapshot);
        }
    }

    /// Last 10 records relevant to the given host or file size
    pub fn history_for(&self, host: &str, file_size: u64) -> Vec<LearningRecord> {
        let learning = self.learning.lock().unwrap();
        learning
            .iter()
            .filter(|r| r.host == host || r.file_size == file_size)
            .rev()
            .take(10)
            .cloned()
            .collect()
    }

    /// Serialize the ring buffer for external consumers
    pub fn export_learning(&self) -> crate::error::Result<String> {
        let learning = self.learning.lock().unwrap();
        let records: Vec<&LearningRecord> = learning.iter().collect();
        Ok(serde_json::to_string(&records)?)
    }

    pub fn learning_len(&self) -> usize {
        self.learning.lock().unwrap().len()
    }
}
