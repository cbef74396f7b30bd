//! Adaptive speed monitor
//!
//! Owns the live transfer registry. Ingests byte progress, computes
//! speed and a deliberately conservative ETA, keeps bounded per-transfer
//! history, and publishes events through the bus. Completion converts
//! the live context into a persisted `TransferStats` record.

use crate::db::{Database, StatsDb};
use crate::network::NetworkAnalyzer;
use crate::oracle::SpeedOracle;
use crate::service::{EventBus, TransferEvent};
use crate::types::{
    unix_now, NetworkSnapshot, Settings, SpeedData, TransferContext, TransferStats,
    TransferStatus, TransferType,
};
use chrono::{TimeZone, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Live view of an in-flight transfer
#[derive(Debug, Clone, Serialize)]
pub struct LiveStats {
    pub transfer_id: String,
    pub user_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub transfer_type: TransferType,
    pub status: TransferStatus,
    pub priority: u8,
    pub progress_percent: f64,
    pub transferred_bytes: u64,
    pub remaining_bytes: u64,
    pub elapsed_seconds: f64,
    pub avg_speed_bps: f64,
    pub current_speed_bps: f64,
    pub eta_seconds: f64,
    pub tags: Vec<String>,
}

/// Chart-ready series for one transfer
#[derive(Debug, Clone, Serialize)]
pub struct SpeedGraphData {
    pub transfer_id: String,
    /// Seconds relative to the first kept point
    pub timestamps: Vec<f64>,
    pub speeds_bps: Vec<f64>,
    pub progress_percent: Vec<f64>,
    pub data_points: usize,
    pub duration_seconds: f64,
    pub avg_bps: f64,
    pub max_bps: f64,
    pub min_bps: f64,
}

/// One live re-tuning suggestion
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub kind: String,
    pub action: String,
    pub reason: String,
    pub suggested_value: String,
}

/// Output of `optimize_transfer`
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub transfer_id: String,
    pub recommendations: Vec<Recommendation>,
    /// 1.0 means nothing to improve
    pub optimization_score: f64,
}

/// Aggregate view across all transfers
#[derive(Debug, Clone, Serialize)]
pub struct SystemOverview {
    pub active_transfers: usize,
    pub unique_users: usize,
    pub avg_download_bps: f64,
    pub avg_upload_bps: f64,
    pub peak_download_bps: f64,
    pub peak_upload_bps: f64,
    pub total_throughput_bps: f64,
    pub total_downloaded_bytes: u64,
    pub total_uploaded_bytes: u64,
    pub user_activity: HashMap<String, usize>,
}

#[derive(Default)]
struct MonitorState {
    active: HashMap<String, TransferContext>,
    history: HashMap<String, VecDeque<SpeedData>>,
    /// Completion instants, so history sticks around briefly after the
    /// live context is dropped
    finished: HashMap<String, Instant>,
    total_downloaded: u64,
    total_uploaded: u64,
    avg_download_bps: f64,
    avg_upload_bps: f64,
    peak_download_bps: f64,
    peak_upload_bps: f64,
}

pub struct AdaptiveSpeedMonitor {
    state: Mutex<MonitorState>,
    bus: Arc<EventBus>,
    oracle: Arc<dyn SpeedOracle>,
    analyzer: Arc<dyn NetworkAnalyzer>,
    db: Option<Database>,
    sample_cap: usize,
    history_size: usize,
    history_retention: Duration,
}

impl AdaptiveSpeedMonitor {
    pub fn new(
        settings: &Settings,
        bus: Arc<EventBus>,
        oracle: Arc<dyn SpeedOracle>,
        analyzer: Arc<dyn NetworkAnalyzer>,
        db: Option<Database>,
    ) -> Self {
        Self {
            state: Mutex::new(MonitorState::default()),
            bus,
            oracle,
            analyzer,
            db,
            sample_cap: settings.speed_sample_cap,
            history_size: settings.history_size,
            history_retention: Duration::from_secs(3600),
        }
    }

    /// Register a new transfer. One active context per id.
    pub async fn register_transfer(
        &self,
        transfer_id: &str,
        user_id: &str,
        file_name: &str,
        file_size: u64,
        transfer_type: TransferType,
        priority: u8,
        tags: Vec<String>,
    ) -> crate::error::Result<TransferContext> {
        let predicted = self
            .oracle
            .predict_speed(file_size, &self.analyzer.analyze(), &[])
            .map(|p| p.speed_bps);

        let context = {
            let mut state = self.state.lock().await;
            if state.active.contains_key(transfer_id) {
                return Err(crate::error::Error::InvalidInput(format!(
                    "transfer already active: {}",
                    transfer_id
                )));
            }

            let mut context = TransferContext::new(
                transfer_id.to_string(),
                user_id.to_string(),
                file_name.to_string(),
                file_size,
                transfer_type,
                priority,
            );
            context.tags = tags;
            context.predicted_speed = predicted;

            state.active.insert(transfer_id.to_string(), context.clone());
            state.history.entry(transfer_id.to_string()).or_default();
            context
        };

        log::info!(
            "transfer registered: {} ({}, {} bytes, predicted {:?} B/s)",
            transfer_id,
            transfer_type,
            file_size,
            predicted
        );

        self.bus.publish(TransferEvent::Started {
            transfer_id: transfer_id.to_string(),
            user_id: user_id.to_string(),
            file_name: file_name.to_string(),
            file_size,
            predicted_speed: predicted,
        });

        Ok(context)
    }

    /// Ingest a progress report. Unknown ids are logged and swallowed so
    /// racing updates never error into the transfer hot path.
    pub async fn update_progress(
        &self,
        transfer_id: &str,
        bytes_transferred: u64,
        total_bytes: Option<u64>,
        speed_bps: Option<f64>,
        snapshot: Option<&NetworkSnapshot>,
    ) -> Option<SpeedData> {
        let (data, samples_for_oracle, file_size) = {
            let mut state = self.state.lock().await;
            let sample_cap = self.sample_cap;
            let history_size = self.history_size;

            let context = match state.active.get_mut(transfer_id) {
                Some(context) => context,
                None => {
                    log::warn!("progress for unknown transfer: {}", transfer_id);
                    return None;
                }
            };

            context.status = TransferStatus::Transferring;
            let now = Instant::now();
            let total_elapsed = context.started_at.elapsed().as_secs_f64();

            let delta_bytes = bytes_transferred.saturating_sub(context.last_checkpoint_bytes);
            let instantaneous = speed_bps.or_else(|| {
                context.last_checkpoint.map(|checkpoint| {
                    let elapsed = now.duration_since(checkpoint).as_secs_f64();
                    if elapsed > 0.0 {
                        delta_bytes as f64 / elapsed
                    } else {
                        0.0
                    }
                })
            });

            let total = match total_bytes {
                Some(total) if total > 0 => total,
                _ => context.file_size,
            };
            if context.file_size == 0 && total > 0 {
                context.file_size = total;
            }
            let session_avg = if total_elapsed > 0.0 {
                bytes_transferred as f64 / total_elapsed
            } else {
                0.0
            };
            let speed = instantaneous.unwrap_or(session_avg);

            context.push_sample(speed, sample_cap);
            context.last_checkpoint = Some(now);
            context.last_checkpoint_bytes = bytes_transferred;

            let remaining = total.saturating_sub(bytes_transferred);
            let samples: Vec<f64> = context.speed_samples.iter().copied().collect();
            let eta_seconds =
                conservative_eta(remaining, &samples, session_avg, self.oracle.as_ref());

            let progress_percent = if total > 0 {
                (bytes_transferred as f64 / total as f64 * 100.0).min(100.0)
            } else {
                0.0
            };

            let data = SpeedData {
                timestamp: unix_now(),
                bytes_transferred,
                total_bytes: total,
                speed,
                progress_percent,
                eta_seconds,
                transfer_id: transfer_id.to_string(),
            };

            let file_size = context.file_size;
            let transfer_type = context.transfer_type;
            let sample_count = context.speed_samples.len();

            // Aggregate gauges, EWMA-smoothed like a long-running average
            match transfer_type {
                TransferType::Download => {
                    state.total_downloaded += delta_bytes;
                    state.avg_download_bps = state.avg_download_bps * 0.9 + speed * 0.1;
                    state.peak_download_bps = state.peak_download_bps.max(speed);
                }
                TransferType::Upload => {
                    state.total_uploaded += delta_bytes;
                    state.avg_upload_bps = state.avg_upload_bps * 0.9 + speed * 0.1;
                    state.peak_upload_bps = state.peak_upload_bps.max(speed);
                }
            }

            let history = state.history.entry(transfer_id.to_string()).or_default();
            history.push_back(data.clone());
            while history.len() > history_size {
                history.pop_front();
            }

            let samples_for_oracle = if sample_count > 10 { Some(samples) } else { None };
            (data, samples_for_oracle, file_size)
        };

        // Model feedback and publication happen outside the registry lock
        if samples_for_oracle.is_some() {
            let snap = snapshot.cloned().unwrap_or_default();
            self.oracle.update_model(data.speed, file_size, &snap);
        }
        self.bus.publish(TransferEvent::Progress(data.clone()));

        Some(data)
    }

    /// Finalize a transfer. Idempotent: a second call for the same id is
    /// a no-op returning `None`.
    pub async fn complete_transfer(
        &self,
        transfer_id: &str,
        success: bool,
        error_message: Option<String>,
    ) -> Option<TransferStats> {
        let stats = {
            let mut state = self.state.lock().await;
            let mut context = state.active.remove(transfer_id)?;

            context.status = if success {
                TransferStatus::Completed
            } else {
                TransferStatus::Failed
            };

            let duration = context.started_at.elapsed().as_secs_f64();
            let transferred = if success && context.file_size > 0 {
                context.file_size
            } else {
                context.last_checkpoint_bytes
            };
            let avg = if duration > 0.0 {
                transferred as f64 / duration
            } else {
                0.0
            };
            let max = context
                .speed_samples
                .iter()
                .copied()
                .fold(0.0_f64, f64::max);
            let min = context
                .speed_samples
                .iter()
                .copied()
                .fold(f64::INFINITY, f64::min);

            state.finished.insert(transfer_id.to_string(), Instant::now());

            TransferStats {
                transfer_id: context.transfer_id.clone(),
                user_id: context.user_id.clone(),
                file_name: context.file_name.clone(),
                file_size: context.file_size,
                transfer_type: context.transfer_type,
                duration_seconds: duration,
                avg_speed_bps: avg,
                max_speed_bps: max,
                min_speed_bps: if min.is_finite() { min } else { 0.0 },
                success,
                error_message: error_message.clone(),
                retry_count: context.retry_count,
                tags: context.tags.clone(),
                started_at: rfc3339(context.start_time),
                finished_at: rfc3339(unix_now()),
            }
        };

        if let Some(db) = &self.db {
            if let Err(e) = StatsDb::save(db, &stats) {
                log::error!("failed to persist stats for {}: {}", transfer_id, e);
            }
        }

        log::info!(
            "transfer {} {}: {:.1}s, avg {:.0} B/s",
            transfer_id,
            if success { "completed" } else { "failed" },
            stats.duration_seconds,
            stats.avg_speed_bps
        );

        if success {
            self.bus.publish(TransferEvent::Completed(stats.clone()));
        } else {
            self.bus.publish(TransferEvent::Failed {
                transfer_id: transfer_id.to_string(),
                reason: error_message.unwrap_or_else(|| "unknown error".to_string()),
                kind: "transfer_failed".to_string(),
            });
        }

        Some(stats)
    }

    /// Bump the retry counter for an active transfer
    pub async fn record_retry(&self, transfer_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(context) = state.active.get_mut(transfer_id) {
            context.retry_count += 1;
            context.error_count += 1;
        }
    }

    /// Live snapshot for an active transfer
    pub async fn live_stats(&self, transfer_id: &str) -> Option<LiveStats> {
        let state = self.state.lock().await;
        let context = state.active.get(transfer_id)?;

        let elapsed = context.started_at.elapsed().as_secs_f64();
        let transferred = context.last_checkpoint_bytes;
        let avg = if elapsed > 0.0 {
            transferred as f64 / elapsed
        } else {
            0.0
        };
        let current = context.speed_samples.back().copied().unwrap_or(0.0);
        let remaining = context.file_size.saturating_sub(transferred);
        let samples: Vec<f64> = context.speed_samples.iter().copied().collect();

        Some(LiveStats {
            transfer_id: context.transfer_id.clone(),
            user_id: context.user_id.clone(),
            file_name: context.file_name.clone(),
            file_size: context.file_size,
            transfer_type: context.transfer_type,
            status: context.status,
            priority: context.priority,
            progress_percent: if context.file_size > 0 {
                (transferred as f64 / context.file_size as f64 * 100.0).min(100.0)
            } else {
                0.0
            },
            transferred_bytes: transferred,
            remaining_bytes: remaining,
            elapsed_seconds: elapsed,
            avg_speed_bps: avg,
            current_speed_bps: current,
            eta_seconds: conservative_eta(remaining, &samples, avg, self.oracle.as_ref()),
            tags: context.tags.clone(),
        })
    }

    /// Chart series with smart downsampling. Spikes survive decimation:
    /// the points with the largest delta to their neighbor are kept.
    pub async fn speed_graph_data(
        &self,
        transfer_id: &str,
        points: Option<usize>,
        time_range: Option<(f64, f64)>,
    ) -> Option<SpeedGraphData> {
        let state = self.state.lock().await;
        let history = state.history.get(transfer_id)?;

        let mut series: Vec<SpeedData> = history.iter().cloned().collect();
        if let Some((start, end)) = time_range {
            series.retain(|d| d.timestamp >= start && d.timestamp <= end);
        }
        if series.is_empty() {
            return Some(SpeedGraphData {
                transfer_id: transfer_id.to_string(),
                timestamps: Vec::new(),
                speeds_bps: Vec::new(),
                progress_percent: Vec::new(),
                data_points: 0,
                duration_seconds: 0.0,
                avg_bps: 0.0,
                max_bps: 0.0,
                min_bps: 0.0,
            });
        }

        if let Some(target) = points {
            if series.len() > target {
                let speeds: Vec<f64> = series.iter().map(|d| d.speed).collect();
                let keep = smart_sample_indices(&speeds, target);
                series = keep.into_iter().map(|i| series[i].clone()).collect();
            }
        }

        let t0 = series[0].timestamp;
        let speeds: Vec<f64> = series.iter().map(|d| d.speed).collect();
        let avg = speeds.iter().sum::<f64>() / speeds.len() as f64;

        Some(SpeedGraphData {
            transfer_id: transfer_id.to_string(),
            timestamps: series.iter().map(|d| d.timestamp - t0).collect(),
            progress_percent: series.iter().map(|d| d.progress_percent).collect(),
            data_points: series.len(),
            duration_seconds: series.last().unwrap().timestamp - t0,
            avg_bps: avg,
            max_bps: speeds.iter().copied().fold(0.0, f64::max),
            min_bps: speeds.iter().copied().fold(f64::INFINITY, f64::min),
            speeds_bps: speeds,
        })
    }

    /// Suggest live re-tuning for a running transfer
    pub async fn optimize_transfer(&self, transfer_id: &str) -> Option<OptimizationReport> {
        let snapshot = self.analyzer.analyze();
        let state = self.state.lock().await;
        let context = state.active.get(transfer_id)?;

        let mut recommendations = Vec::new();

        if snapshot.latency_ms > 100.0 {
            recommendations.push(Recommendation {
                kind: "connection".into(),
                action: "reduce_connections".into(),
                reason: "high latency detected".into(),
                suggested_value: "halve".into(),
            });
        }
        if snapshot.packet_loss > 0.05 {
            recommendations.push(Recommendation {
                kind: "chunk".into(),
                action: "reduce_chunk_size".into(),
                reason: "high packet loss".into(),
                suggested_value: "halve".into(),
            });
        }

        if !context.speed_samples.is_empty() {
            let tail: Vec<f64> = context
                .speed_samples
                .iter()
                .rev()
                .take(10)
                .copied()
                .collect();
            let recent_avg = tail.iter().sum::<f64>() / tail.len() as f64;
            if recent_avg < 1024.0 * 1024.0 {
                recommendations.push(Recommendation {
                    kind: "compression".into(),
                    action: "enable_compression".into(),
                    reason: "low observed speed".into(),
                    suggested_value: "true".into(),
                });
            }
        }

        if context.file_size > 100 * 1024 * 1024 {
            recommendations.push(Recommendation {
                kind: "strategy".into(),
                action: "enable_resume".into(),
                reason: "large file".into(),
                suggested_value: "true".into(),
            });
        }

        let score = optimization_score(&recommendations);

        Some(OptimizationReport {
            transfer_id: transfer_id.to_string(),
            recommendations,
            optimization_score: score,
        })
    }

    /// Aggregate view of everything in flight
    pub async fn system_overview(&self) -> SystemOverview {
        let state = self.state.lock().await;

        let mut user_activity: HashMap<String, usize> = HashMap::new();
        for context in state.active.values() {
            *user_activity.entry(context.user_id.clone()).or_default() += 1;
        }

        let mut down = 0.0;
        let mut up = 0.0;
        for context in state.active.values() {
            let last = context.speed_samples.back().copied().unwrap_or(0.0);
            match context.transfer_type {
                TransferType::Download => down += last,
                TransferType::Upload => up += last,
            }
        }

        SystemOverview {
            active_transfers: state.active.len(),
            unique_users: user_activity.len(),
            avg_download_bps: state.avg_download_bps,
            avg_upload_bps: state.avg_upload_bps,
            peak_download_bps: state.peak_download_bps,
            peak_upload_bps: state.peak_upload_bps,
            total_throughput_bps: down + up,
            total_downloaded_bytes: state.total_downloaded,
            total_uploaded_bytes: state.total_uploaded,
            user_activity,
        }
    }

    /// Fail transfers idle past `stale_timeout` and purge expired
    /// history of finished transfers. Called by engine maintenance.
    pub async fn cleanup_stale(&self, stale_timeout: Duration) -> Vec<String> {
        let stale: Vec<String> = {
            let state = self.state.lock().await;
            state
                .active
                .iter()
                .filter(|(_, context)| {
                    let idle = context
                        .last_checkpoint
                        .unwrap_or(context.started_at)
                        .elapsed();
                    idle > stale_timeout
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in &stale {
            log::warn!("failing stale transfer {}", id);
            self.complete_transfer(id, false, Some("transfer timeout".to_string()))
                .await;
        }

        let retention = self.history_retention;
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .finished
            .iter()
            .filter(|(_, at)| at.elapsed() > retention)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            state.finished.remove(&id);
            state.history.remove(&id);
        }

        stale
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }

    /// Handle to the stats store, when one is attached
    pub fn database(&self) -> Option<Database> {
        self.db.clone()
    }
}

fn rfc3339(unix_seconds: f64) -> String {
    Utc.timestamp_opt(unix_seconds as i64, 0)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

/// ETA as the max of up to four estimators. Conservative on purpose: a
/// shrinking ETA that keeps jumping back up is worse than one that only
/// melts down. Before any usable speed exists, a 1 B/s floor keeps the
/// value finite and strictly positive while bytes remain.
fn conservative_eta(
    remaining: u64,
    samples: &[f64],
    session_avg: f64,
    oracle: &dyn SpeedOracle,
) -> f64 {
    if remaining == 0 {
        return 0.0;
    }
    let remaining = remaining as f64;

    let mut estimates: Vec<f64> = Vec::with_capacity(4);

    if let Some(last) = samples.last() {
        if *last > 0.0 {
            estimates.push(remaining / last);
        }
    }

    if session_avg > 0.0 {
        estimates.push(remaining / session_avg);
    }

    if samples.len() >= 5 {
        let tail = &samples[samples.len() - 5..];
        let weights = [0.5, 0.625, 0.75, 0.875, 1.0];
        let weighted: f64 = tail.iter().zip(weights).map(|(s, w)| s * w).sum();
        let weight_sum: f64 = weights.iter().sum();
        let weighted_avg = weighted / weight_sum;
        if weighted_avg > 0.0 {
            estimates.push(remaining / weighted_avg);
        }
    }

    if samples.len() >= 10 {
        if let Some(future) = oracle.predict_future_speed(samples) {
            if future > 0.0 {
                estimates.push(remaining / future);
            }
        }
    }

    estimates
        .into_iter()
        .fold(None::<f64>, |acc, e| Some(acc.map_or(e, |a| a.max(e))))
        .unwrap_or(remaining)
}

/// Downsampling that preserves spikes: always keep the endpoints, then
/// the points with the largest delta to their predecessor, then fill any
/// remaining slots evenly.
fn smart_sample_indices(speeds: &[f64], target: usize) -> Vec<usize> {
    let n = speeds.len();
    let target = target.clamp(2, n.max(2));
    if n <= target {
        return (0..n).collect();
    }

    let mut selected = BTreeSet::new();
    selected.insert(0);
    selected.insert(n - 1);

    let mut deltas: Vec<(usize, f64)> = (1..n - 1)
        .map(|i| (i, (speeds[i] - speeds[i - 1]).abs()))
        .collect();
    deltas.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    for (i, _) in deltas {
        if selected.len() >= target {
            break;
        }
        selected.insert(i);
    }

    if selected.len() < target {
        let step = (n / (target - selected.len() + 1)).max(1);
        for i in (step..n).step_by(step) {
            if selected.len() >= target {
                break;
            }
            selected.insert(i);
        }
    }

    selected.into_iter().collect()
}

fn optimization_score(recommendations: &[Recommendation]) -> f64 {
    if recommendations.is_empty() {
        return 1.0;
    }
    let mut score: f64 = 1.0;
    for rec in recommendations {
        let weight = match rec.kind.as_str() {
            "connection" => 0.3,
            "chunk" => 0.25,
            "compression" => 0.2,
            "strategy" => 0.15,
            _ => 0.1,
        };
        score -= weight * 0.1;
    }
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::FixedAnalyzer;
    use crate::oracle::NoopOracle;

    const MB: u64 = 1024 * 1024;

    fn monitor() -> AdaptiveSpeedMonitor {
        AdaptiveSpeedMonitor::new(
            &Settings::default(),
            Arc::new(EventBus::new()),
            Arc::new(NoopOracle),
            Arc::new(FixedAnalyzer(NetworkSnapshot::default())),
            None,
        )
    }

    async fn register(m: &AdaptiveSpeedMonitor, id: &str, size: u64) {
        m.register_transfer(id, "u1", "file.bin", size, TransferType::Download, 5, vec![])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let m = monitor();
        register(&m, "t1", 100).await;
        let err = m
            .register_transfer("t1", "u1", "f", 100, TransferType::Download, 5, vec![])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn test_unknown_id_returns_none_quietly() {
        let m = monitor();
        assert!(m.update_progress("ghost", 10, None, None, None).await.is_none());
    }

    #[tokio::test]
    async fn test_eta_scenario_50mb_at_5mbps() {
        let m = monitor();
        register(&m, "t1", 100 * MB).await;

        let data = m
            .update_progress("t1", 50 * MB, Some(100 * MB), Some(5.0 * MB as f64), None)
            .await
            .unwrap();
        assert!(
            (data.eta_seconds - 10.0).abs() < 0.2,
            "eta {}",
            data.eta_seconds
        );
        assert_eq!(data.progress_percent, 50.0);
    }

    #[tokio::test]
    async fn test_eta_zero_exactly_at_completion() {
        let m = monitor();
        register(&m, "t1", 100).await;

        let partial = m
            .update_progress("t1", 99, Some(100), Some(10.0), None)
            .await
            .unwrap();
        assert!(partial.eta_seconds > 0.0);

        let done = m
            .update_progress("t1", 100, Some(100), Some(10.0), None)
            .await
            .unwrap();
        assert_eq!(done.eta_seconds, 0.0);
    }

    #[tokio::test]
    async fn test_eta_positive_without_speed_signal() {
        let m = monitor();
        register(&m, "t1", 100 * MB).await;
        let data = m
            .update_progress("t1", 0, Some(100 * MB), Some(0.0), None)
            .await
            .unwrap();
        assert!(data.eta_seconds > 0.0);
        assert!(data.eta_seconds.is_finite());
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let m = monitor();
        register(&m, "t1", 100).await;
        m.update_progress("t1", 100, None, Some(50.0), None).await;

        let first = m.complete_transfer("t1", true, None).await;
        assert!(first.is_some());
        let second = m.complete_transfer("t1", true, None).await;
        assert!(second.is_none());
        assert_eq!(m.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_completion_stats_aggregate_samples() {
        let m = monitor();
        register(&m, "t1", 300).await;
        m.update_progress("t1", 100, None, Some(10.0), None).await;
        m.update_progress("t1", 200, None, Some(30.0), None).await;
        m.update_progress("t1", 300, None, Some(20.0), None).await;

        let stats = m.complete_transfer("t1", true, None).await.unwrap();
        assert!(stats.success);
        assert_eq!(stats.max_speed_bps, 30.0);
        assert_eq!(stats.min_speed_bps, 10.0);
        assert_eq!(stats.file_size, 300);
    }

    #[tokio::test]
    async fn test_events_published_in_lifecycle_order() {
        let bus = Arc::new(EventBus::new());
        let m = AdaptiveSpeedMonitor::new(
            &Settings::default(),
            bus.clone(),
            Arc::new(NoopOracle),
            Arc::new(FixedAnalyzer(NetworkSnapshot::default())),
            None,
        );
        let rx = bus.subscribe();

        register(&m, "t1", 100).await;
        m.update_progress("t1", 50, None, Some(5.0), None).await;
        m.complete_transfer("t1", false, Some("disk full".into())).await;

        assert!(matches!(rx.recv().await.unwrap(), TransferEvent::Started { .. }));
        assert!(matches!(rx.recv().await.unwrap(), TransferEvent::Progress(_)));
        match rx.recv().await.unwrap() {
            TransferEvent::Failed { reason, .. } => assert_eq!(reason, "disk full"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_smart_sampling_keeps_endpoints_and_spikes() {
        let mut speeds = vec![10.0; 50];
        speeds[25] = 500.0; // spike

        let indices = smart_sample_indices(&speeds, 10);
        assert!(indices.len() <= 10);
        assert_eq!(indices[0], 0);
        assert_eq!(*indices.last().unwrap(), 49);
        assert!(indices.contains(&25), "spike dropped: {:?}", indices);
    }

    #[tokio::test]
    async fn test_smart_sampling_short_series_untouched() {
        let speeds = vec![1.0, 2.0, 3.0];
        assert_eq!(smart_sample_indices(&speeds, 10), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_graph_data_respects_point_budget() {
        let m = monitor();
        register(&m, "t1", 100 * MB).await;
        for i in 0..200u64 {
            m.update_progress("t1", i * 1024, None, Some(1000.0 + i as f64), None)
                .await;
        }

        let graph = m.speed_graph_data("t1", Some(20), None).await.unwrap();
        assert!(graph.data_points <= 20);
        assert_eq!(graph.speeds_bps.len(), graph.timestamps.len());
    }

    #[tokio::test]
    async fn test_stale_transfers_are_failed() {
        let m = monitor();
        register(&m, "t1", 100).await;

        let failed = m.cleanup_stale(Duration::from_millis(0)).await;
        assert_eq!(failed, vec!["t1".to_string()]);
        assert_eq!(m.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_overview_counts_users_and_transfers() {
        let m = monitor();
        register(&m, "t1", 100).await;
        register(&m, "t2", 100).await;
        m.register_transfer("t3", "u2", "g", 100, TransferType::Upload, 5, vec![])
            .await
            .unwrap();

        let overview = m.system_overview().await;
        assert_eq!(overview.active_transfers, 3);
        assert_eq!(overview.unique_users, 2);
        assert_eq!(overview.user_activity["u1"], 2);
    }

    #[tokio::test]
    async fn test_optimize_transfer_flags_bad_network() {
        let snapshot = NetworkSnapshot {
            latency_ms: 250.0,
            bandwidth_bps: 0.0,
            packet_loss: 0.2,
            quality_score: 0.1,
        };
        let m = AdaptiveSpeedMonitor::new(
            &Settings::default(),
            Arc::new(EventBus::new()),
            Arc::new(NoopOracle),
            Arc::new(FixedAnalyzer(snapshot)),
            None,
        );
        register(&m, "t1", 500 * MB).await;

        let report = m.optimize_transfer("t1").await.unwrap();
        let kinds: Vec<&str> = report
            .recommendations
            .iter()
            .map(|r| r.kind.as_str())
            .collect();
        assert!(kinds.contains(&"connection"));
        assert!(kinds.contains(&"chunk"));
        assert!(report.optimization_score < 1.0);
    }
}
