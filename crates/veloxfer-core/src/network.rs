//! Network quality analysis
//!
//! The planner pulls a `NetworkSnapshot` before producing a plan. The
//! default implementation is passive: it derives latency, bandwidth and a
//! loss proxy from request outcomes the executor feeds back, so no probe
//! traffic is generated.

use crate::types::NetworkSnapshot;
use std::sync::Mutex;
use std::time::Duration;

/// Pull-based network quality source
pub trait NetworkAnalyzer: Send + Sync {
    fn analyze(&self) -> NetworkSnapshot;
}

/// Fixed snapshot, for tests and for callers with out-of-band knowledge
pub struct FixedAnalyzer(pub NetworkSnapshot);

impl NetworkAnalyzer for FixedAnalyzer {
    fn analyze(&self) -> NetworkSnapshot {
        self.0.clone()
    }
}

const EWMA_ALPHA: f64 = 0.3;

#[derive(Default)]
struct PassiveInner {
    latency_ms: Option<f64>,
    bandwidth_bps: Option<f64>,
    /// EWMA of the failure ratio, used as a packet-loss proxy
    loss: f64,
    observations: u64,
}

/// Analyzer fed by observed request outcomes
#[derive(Default)]
pub struct PassiveNetworkAnalyzer {
    inner: Mutex<PassiveInner>,
}

impl PassiveNetworkAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one request outcome. `latency` is time to first byte,
    /// `elapsed` the full transfer duration for `bytes` payload bytes.
    pub fn record_request(
        &self,
        latency: Duration,
        bytes: u64,
        elapsed: Duration,
        success: bool,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.observations += 1;

        let latency_ms = latency.as_secs_f64() * 1000.0;
        inner.latency_ms = Some(match inner.latency_ms {
            Some(prev) => prev * (1.0 - EWMA_ALPHA) + latency_ms * EWMA_ALPHA,
            None => latency_ms,
        });

        if success && bytes > 0 && elapsed > Duration::ZERO {
            let bps = bytes as f64 / elapsed.as_secs_f64();
            inner.bandwidth_bps = Some(match inner.bandwidth_bps {
                Some(prev) => prev * (1.0 - EWMA_ALPHA) + bps * EWMA_ALPHA,
                None => bps,
            });
        }

        let outcome = if success { 0.0 } else { 1.0 };
        inner.loss = inner.loss * (1.0 - EWMA_ALPHA) + outcome * EWMA_ALPHA;
    }

    pub fn observations(&self) -> u64 {
        self.inner.lock().unwrap().observations
    }
}

impl NetworkAnalyzer for PassiveNetworkAnalyzer {
    fn analyze(&self) -> NetworkSnapshot {
        let inner = self.inner.lock().unwrap();
        if inner.observations == 0 {
            return NetworkSnapshot::default();
        }

        let latency_ms = inner.latency_ms.unwrap_or(100.0);
        let bandwidth_bps = inner.bandwidth_bps.unwrap_or(0.0);
        let packet_loss = inner.loss.clamp(0.0, 1.0);

        // Latency above ~500ms scores zero; 0ms scores one
        let latency_score = (1.0 - latency_ms / 500.0).clamp(0.0, 1.0);
        let loss_score = 1.0 - packet_loss;
        let bandwidth_score = if bandwidth_bps >= 10.0 * 1024.0 * 1024.0 {
            1.0
        } else {
            bandwidth_bps / (10.0 * 1024.0 * 1024.0)
        };

        let quality_score =
            (latency_score * 0.5 + loss_score * 0.3 + bandwidth_score * 0.2).clamp(0.0, 1.0);

        NetworkSnapshot {
            latency_ms,
            bandwidth_bps,
            packet_loss,
            quality_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_observations_yields_default() {
        let analyzer = PassiveNetworkAnalyzer::new();
        let snapshot = analyzer.analyze();
        assert_eq!(snapshot.latency_ms, 100.0);
        assert_eq!(snapshot.bandwidth_bps, 0.0);
    }

    #[test]
    fn test_good_link_scores_high() {
        let analyzer = PassiveNetworkAnalyzer::new();
        for _ in 0..20 {
            analyzer.record_request(
                Duration::from_millis(15),
                50 * 1024 * 1024,
                Duration::from_secs(1),
                true,
            );
        }
        let snapshot = analyzer.analyze();
        assert!(snapshot.latency_ms < 20.0);
        assert!(snapshot.bandwidth_bps > 40.0 * 1024.0 * 1024.0);
        assert!(snapshot.quality_score > 0.9, "score {}", snapshot.quality_score);
    }

    #[test]
    fn test_failures_raise_loss_proxy() {
        let analyzer = PassiveNetworkAnalyzer::new();
        for _ in 0..10 {
            analyzer.record_request(Duration::from_millis(300), 0, Duration::ZERO, false);
        }
        let snapshot = analyzer.analyze();
        assert!(snapshot.packet_loss > 0.9);
        assert!(snapshot.quality_score < 0.4);
    }
}
