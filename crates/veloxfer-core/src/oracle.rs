//! Speed oracle capability
//!
//! The planner and monitor consult an optional predictor for speed
//! estimates. The engine must behave identically whether the oracle is a
//! real model, the bounded statistical estimator below, or the no-op
//! default, so the capability is injected at construction.

use crate::types::{LearningRecord, NetworkSnapshot, TransferStrategy};
use std::sync::Mutex;

/// Output of a prediction query
#[derive(Debug, Clone)]
pub struct Prediction {
    /// Bytes per second
    pub speed_bps: f64,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub strategy_hint: Option<TransferStrategy>,
}

/// Optional predictor consulted by planner and monitor
pub trait SpeedOracle: Send + Sync {
    /// Estimate the achievable speed for a transfer. `None` means the
    /// oracle has nothing to say; callers fall back to rules.
    fn predict_speed(
        &self,
        file_size: u64,
        snapshot: &NetworkSnapshot,
        history: &[LearningRecord],
    ) -> Option<Prediction>;

    /// Project the near-future speed from recent samples (bytes/s).
    fn predict_future_speed(&self, samples: &[f64]) -> Option<f64>;

    /// Feed an observed outcome back into the model.
    fn update_model(&self, observed_speed_bps: f64, file_size: u64, snapshot: &NetworkSnapshot);
}

/// Default oracle: always absent
pub struct NoopOracle;

impl SpeedOracle for NoopOracle {
    fn predict_speed(
        &self,
        _file_size: u64,
        _snapshot: &NetworkSnapshot,
        _history: &[LearningRecord],
    ) -> Option<Prediction> {
        None
    }

    fn predict_future_speed(&self, _samples: &[f64]) -> Option<f64> {
        None
    }

    fn update_model(&self, _observed: f64, _file_size: u64, _snapshot: &NetworkSnapshot) {}
}

const MIN_OBSERVATIONS: u64 = 3;
const MAX_CONFIDENCE: f64 = 0.85;

#[derive(Default)]
struct HistoryInner {
    ewma_bps: Option<f64>,
    observations: u64,
}

/// Bounded statistical estimator: an EWMA over observed speeds, with
/// confidence growing in the number of observations. Not a trained
/// model; just enough signal to beat the bare rule ladder.
#[derive(Default)]
pub struct HistoryOracle {
    inner: Mutex<HistoryInner>,
}

impl HistoryOracle {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SpeedOracle for HistoryOracle {
    fn predict_speed(
        &self,
        file_size: u64,
        snapshot: &NetworkSnapshot,
        history: &[LearningRecord],
    ) -> Option<Prediction> {
        let inner = self.inner.lock().unwrap();

        let history_avg = {
            let speeds: Vec<f64> = history
                .iter()
                .filter(|r| r.success && r.speed_bps > 0.0)
                .map(|r| r.speed_bps)
                .collect();
            if speeds.is_empty() {
                None
            } else {
                Some(speeds.iter().sum::<f64>() / speeds.len() as f64)
            }
        };

        let speed_bps = match (inner.ewma_bps, history_avg) {
            (Some(ewma), Some(avg)) => ewma * 0.6 + avg * 0.4,
            (Some(ewma), None) => ewma,
            (None, Some(avg)) => avg,
            (None, None) => return None,
        };

        if inner.observations < MIN_OBSERVATIONS && history.is_empty() {
            return None;
        }

        // A lossy link caps how far we trust past throughput
        let speed_bps = if snapshot.packet_loss > 0.1 {
            speed_bps * 0.5
        } else {
            speed_bps
        };

        let confidence =
            ((inner.observations as f64 + history.len() as f64) / 20.0).min(MAX_CONFIDENCE);

        let strategy_hint = if speed_bps < 1024.0 * 1024.0 {
            Some(TransferStrategy::Single)
        } else if file_size > 100 * 1024 * 1024 && speed_bps > 5.0 * 1024.0 * 1024.0 {
            Some(TransferStrategy::MultiConnection)
        } else {
            None
        };

        Some(Prediction {
            speed_bps,
            confidence,
            strategy_hint,
        })
    }

    fn predict_future_speed(&self, samples: &[f64]) -> Option<f64> {
        if samples.len() < 5 {
            return None;
        }
        // Recency-weighted mean over the tail, weights 1..n
        let tail = &samples[samples.len().saturating_sub(10)..];
        let mut weighted = 0.0;
        let mut total = 0.0;
        for (i, speed) in tail.iter().enumerate() {
            let w = (i + 1) as f64;
            weighted += speed * w;
            total += w;
        }
        Some(weighted / total)
    }

    fn update_model(&self, observed: f64, _file_size: u64, _snapshot: &NetworkSnapshot) {
        if observed <= 0.0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.observations += 1;
        inner.ewma_bps = Some(match inner.ewma_bps {
            Some(prev) => prev * 0.8 + observed * 0.2,
            None => observed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(speed: f64, success: bool) -> LearningRecord {
        LearningRecord {
            timestamp: 0.0,
            host: "example.com".into(),
            strategy: TransferStrategy::Adaptive,
            file_size: 10 * 1024 * 1024,
            speed_bps: speed,
            duration_seconds: 1.0,
            success,
            snapshot: NetworkSnapshot::default(),
        }
    }

    #[test]
    fn test_noop_oracle_is_always_absent() {
        let oracle = NoopOracle;
        assert!(oracle
            .predict_speed(1024, &NetworkSnapshot::default(), &[])
            .is_none());
        assert!(oracle.predict_future_speed(&[1.0; 20]).is_none());
    }

    #[test]
    fn test_cold_history_oracle_declines() {
        let oracle = HistoryOracle::new();
        assert!(oracle
            .predict_speed(1024, &NetworkSnapshot::default(), &[])
            .is_none());
    }

    #[test]
    fn test_predictions_converge_on_observations() {
        let oracle = HistoryOracle::new();
        let snapshot = NetworkSnapshot::default();
        for _ in 0..10 {
            oracle.update_model(8.0 * 1024.0 * 1024.0, 1024, &snapshot);
        }

        let prediction = oracle.predict_speed(1024, &snapshot, &[]).unwrap();
        let mb = 1024.0 * 1024.0;
        assert!(prediction.speed_bps > 7.0 * mb && prediction.speed_bps < 9.0 * mb);
        assert!(prediction.confidence > 0.0 && prediction.confidence <= MAX_CONFIDENCE);
    }

    #[test]
    fn test_failed_history_records_are_ignored() {
        let oracle = HistoryOracle::new();
        let history = vec![record(100.0 * 1024.0 * 1024.0, false), record(2.0 * 1024.0 * 1024.0, true)];
        let prediction = oracle
            .predict_speed(1024, &NetworkSnapshot::default(), &history)
            .unwrap();
        assert!((prediction.speed_bps - 2.0 * 1024.0 * 1024.0).abs() < 1.0);
    }

    #[test]
    fn test_large_file_fast_link_hints_multi_connection() {
        let oracle = HistoryOracle::new();
        let snapshot = NetworkSnapshot::default();
        for _ in 0..10 {
            oracle.update_model(20.0 * 1024.0 * 1024.0, 1024, &snapshot);
        }
        let prediction = oracle
            .predict_speed(500 * 1024 * 1024, &snapshot, &[])
            .unwrap();
        assert_eq!(
            prediction.strategy_hint,
            Some(TransferStrategy::MultiConnection)
        );
    }

    #[test]
    fn test_future_speed_weights_recent_samples() {
        let oracle = HistoryOracle::new();
        let mut samples = vec![1.0; 10];
        samples.extend([100.0; 5]);
        let projected = oracle.predict_future_speed(&samples).unwrap();
        // Recent fast samples dominate the projection
        assert!(projected > 50.0, "projected {}", projected);
        assert!(oracle.predict_future_speed(&[1.0, 2.0]).is_none());
    }
}
