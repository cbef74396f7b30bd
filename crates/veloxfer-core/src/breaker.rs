//! Per-host circuit breakers
//!
//! Hosts that keep failing are blocked for a cool-down period so the
//! executor fails fast instead of piling retries onto a dead endpoint.
//! Transitions: closed -> open -> half-open -> closed or back to open.
//! A breaker never goes open -> closed without passing half-open.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_successes: u32,
    /// Breakers stuck open longer than this are garbage-collected
    pub idle_gc_after: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_successes: 3,
            idle_gc_after: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug)]
struct BreakerEntry {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    half_open_streak: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_streak: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    fn open(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_streak = 0;
        self.probe_in_flight = false;
    }
}

/// Registry of per-host breakers, created lazily on first failure
pub struct CircuitBreakerRegistry {
    entries: Mutex<HashMap<String, BreakerEntry>>,
    config: BreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Gate a request to `host`. Returns `Error::CircuitOpen` without any
    /// network attempt while the breaker is blocking. When the cool-down
    /// has elapsed, admits exactly one probe at a time in half-open.
    pub fn check(&self, host: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        let entry = match entries.get_mut(host) {
            Some(entry) => entry,
            None => return Ok(()),
        };

        match entry.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = entry.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    entry.state = BreakerState::HalfOpen;
                    entry.half_open_streak = 0;
                    entry.probe_in_flight = true;
                    log::info!("circuit breaker for {} moved to half-open", host);
                    Ok(())
                } else {
                    Err(Error::CircuitOpen {
                        host: host.to_string(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if entry.probe_in_flight {
                    Err(Error::CircuitOpen {
                        host: host.to_string(),
                    })
                } else {
                    entry.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self, host: &str) {
        let mut entries = self.entries.lock().unwrap();
        let entry = match entries.get_mut(host) {
            Some(entry) => entry,
            None => return,
        };

        match entry.state {
            BreakerState::HalfOpen => {
                entry.probe_in_flight = false;
                entry.half_open_streak += 1;
                if entry.half_open_streak >= self.config.half_open_successes {
                    entry.state = BreakerState::Closed;
                    entry.failure_count = 0;
                    entry.half_open_streak = 0;
                    entry.opened_at = None;
                    log::info!("circuit breaker for {} closed", host);
                }
            }
            BreakerState::Closed => {
                entry.success_count += 1;
                // Tolerate transient blips: one success pays off one failure
                entry.failure_count = entry.failure_count.saturating_sub(1);
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self, host: &str) {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .entry(host.to_string())
            .or_insert_with(BreakerEntry::new);

        match entry.state {
            BreakerState::HalfOpen => {
                entry.open();
                log::warn!("circuit breaker for {} re-opened from half-open", host);
            }
            BreakerState::Closed => {
                entry.failure_count += 1;
                entry.success_count = entry.success_count.saturating_sub(1);
                if entry.failure_count >= self.config.failure_threshold {
                    entry.open();
                    log::warn!("circuit breaker opened for {}", host);
                }
            }
            BreakerState::Open => {
                entry.failure_count += 1;
            }
        }
    }

    /// Current state; hosts without an entry report closed.
    pub fn state(&self, host: &str) -> BreakerState {
        self.entries
            .lock()
            .unwrap()
            .get(host)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Drop breakers that have sat open past the GC horizon
    pub fn gc(&self) {
        let mut entries = self.entries.lock().unwrap();
        let horizon = self.config.idle_gc_after;
        entries.retain(|_, e| {
            !(e.state == BreakerState::Open
                && e.opened_at.map(|t| t.elapsed() > horizon).unwrap_or(false))
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(30),
            half_open_successes: 3,
            idle_gc_after: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let registry = CircuitBreakerRegistry::new(BreakerConfig::default());
        for _ in 0..4 {
            registry.record_failure("x");
        }
        assert_eq!(registry.state("x"), BreakerState::Closed);
        registry.record_failure("x");
        assert_eq!(registry.state("x"), BreakerState::Open);

        // Next request fails fast without a network attempt
        let err = registry.check("x").unwrap_err();
        assert_eq!(err.kind(), "circuit_open");
    }

    #[test]
    fn test_success_decays_failure_count() {
        let registry = CircuitBreakerRegistry::new(BreakerConfig::default());
        for _ in 0..4 {
            registry.record_failure("x");
        }
        registry.record_success("x");
        registry.record_failure("x");
        // 4 - 1 + 1 = 4, still below threshold
        assert_eq!(registry.state("x"), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_admits_one_probe() {
        let registry = CircuitBreakerRegistry::new(quick_config());
        for _ in 0..5 {
            registry.record_failure("x");
        }
        assert_eq!(registry.state("x"), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(40));
        assert!(registry.check("x").is_ok());
        assert_eq!(registry.state("x"), BreakerState::HalfOpen);
        // Probe outstanding: further requests are still blocked
        assert!(registry.check("x").is_err());
    }

    #[test]
    fn test_three_half_open_successes_close() {
        let registry = CircuitBreakerRegistry::new(quick_config());
        for _ in 0..5 {
            registry.record_failure("x");
        }
        std::thread::sleep(Duration::from_millis(40));

        for _ in 0..3 {
            assert!(registry.check("x").is_ok());
            registry.record_success("x");
        }
        assert_eq!(registry.state("x"), BreakerState::Closed);
        assert!(registry.check("x").is_ok());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let registry = CircuitBreakerRegistry::new(quick_config());
        for _ in 0..5 {
            registry.record_failure("x");
        }
        std::thread::sleep(Duration::from_millis(40));

        assert!(registry.check("x").is_ok());
        registry.record_failure("x");
        assert_eq!(registry.state("x"), BreakerState::Open);
        assert!(registry.check("x").is_err());
    }

    #[test]
    fn test_gc_drops_stale_open_breakers() {
        let registry = CircuitBreakerRegistry::new(quick_config());
        for _ in 0..5 {
            registry.record_failure("stale");
        }
        registry.record_failure("young");
        assert_eq!(registry.len(), 2);

        std::thread::sleep(Duration::from_millis(60));
        registry.gc();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.state("young"), BreakerState::Closed);
    }
}
