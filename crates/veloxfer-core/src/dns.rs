//! DNS resolution cache
//!
//! Hostnames are resolved through an ordered resolver fallback chain and
//! cached with a TTL. Total resolution failure hands the original hostname
//! back so the caller can still attempt a direct connection.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A single upstream resolver in the fallback chain
pub trait Resolver: Send + Sync {
    fn name(&self) -> &str;

    fn resolve<'a>(
        &'a self,
        hostname: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<IpAddr>> + Send + 'a>>;
}

/// Platform resolver backed by the OS (tokio's `lookup_host`)
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn name(&self) -> &str {
        "system"
    }

    fn resolve<'a>(
        &'a self,
        hostname: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<IpAddr>> + Send + 'a>> {
        Box::pin(async move {
            let mut addrs = tokio::net::lookup_host((hostname, 0))
                .await
                .map_err(|e| Error::Dns(format!("{}: {}", hostname, e)))?;
            addrs
                .next()
                .map(|a| a.ip())
                .ok_or_else(|| Error::Dns(format!("no addresses for {}", hostname)))
        })
    }
}

/// TTL cache in front of the resolver chain
pub struct DnsCache {
    entries: Mutex<HashMap<String, (IpAddr, Instant)>>,
    ttl: Duration,
    timeout: Duration,
    resolvers: Vec<Arc<dyn Resolver>>,
}

impl DnsCache {
    pub fn new(ttl: Duration, timeout: Duration) -> Self {
        Self::with_resolvers(ttl, timeout, vec![Arc::new(SystemResolver)])
    }

    /// The chain is walked in order; the platform resolver should come last.
    pub fn with_resolvers(
        ttl: Duration,
        timeout: Duration,
        resolvers: Vec<Arc<dyn Resolver>>,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            timeout,
            resolvers,
        }
    }

    /// Resolve a hostname to an IP string. Falls back to the hostname
    /// itself when every resolver fails.
    pub async fn resolve(&self, hostname: &str) -> String {
        // Literal IPs skip the cache and the chain
        if hostname.parse::<IpAddr>().is_ok() {
            return hostname.to_string();
        }

        if let Some(ip) = self.cached(hostname) {
            return ip.to_string();
        }

        for resolver in &self.resolvers {
            match tokio::time::timeout(self.timeout, resolver.resolve(hostname)).await {
                Ok(Ok(ip)) => {
                    self.insert(hostname, ip);
                    return ip.to_string();
                }
                Ok(Err(e)) => {
                    log::debug!("resolver {} failed for {}: {}", resolver.name(), hostname, e);
                }
                Err(_) => {
                    log::debug!("resolver {} timed out for {}", resolver.name(), hostname);
                }
            }
        }

        log::warn!("DNS resolution failed for {}, using hostname directly", hostname);
        hostname.to_string()
    }

    fn cached(&self, hostname: &str) -> Option<IpAddr> {
        let entries = self.entries.lock().unwrap();
        entries.get(hostname).and_then(|(ip, expiry)| {
            if Instant::now() < *expiry {
                Some(*ip)
            } else {
                None
            }
        })
    }

    fn insert(&self, hostname: &str, ip: IpAddr) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(hostname.to_string(), (ip, Instant::now() + self.ttl));
    }

    /// Drop entries past their TTL
    pub fn purge_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, (_, expiry)| *expiry > now);
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: Arc<AtomicUsize>,
        answer: Option<IpAddr>,
    }

    impl Resolver for CountingResolver {
        fn name(&self) -> &str {
            "counting"
        }

        fn resolve<'a>(
            &'a self,
            hostname: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<IpAddr>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.answer
                    .ok_or_else(|| Error::Dns(format!("refused: {}", hostname)))
            })
        }
    }

    fn cache_with(answer: Option<IpAddr>, ttl: Duration) -> (DnsCache, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = Arc::new(CountingResolver {
            calls: calls.clone(),
            answer,
        });
        let cache = DnsCache::with_resolvers(ttl, Duration::from_millis(500), vec![resolver]);
        (cache, calls)
    }

    #[tokio::test]
    async fn test_hit_within_ttl_does_not_requery() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let (cache, calls) = cache_with(Some(ip), Duration::from_secs(300));

        assert_eq!(cache.resolve("example.com").await, "10.0.0.1");
        assert_eq!(cache.resolve("example.com").await, "10.0.0.1");
        assert_eq!(cache.resolve("example.com").await, "10.0.0.1");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expiry_triggers_exactly_one_fresh_resolution() {
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        let (cache, calls) = cache_with(Some(ip), Duration::from_millis(20));

        cache.resolve("example.com").await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.resolve("example.com").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_total_failure_returns_hostname() {
        let (cache, calls) = cache_with(None, Duration::from_secs(300));
        assert_eq!(cache.resolve("unreachable.test").await, "unreachable.test");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Failures are not cached
        cache.resolve("unreachable.test").await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fallback_chain_order() {
        let failing = Arc::new(CountingResolver {
            calls: Arc::new(AtomicUsize::new(0)),
            answer: None,
        });
        let backup_calls = Arc::new(AtomicUsize::new(0));
        let backup = Arc::new(CountingResolver {
            calls: backup_calls.clone(),
            answer: Some("10.0.0.3".parse().unwrap()),
        });

        let cache = DnsCache::with_resolvers(
            Duration::from_secs(300),
            Duration::from_millis(500),
            vec![failing, backup],
        );

        assert_eq!(cache.resolve("example.com").await, "10.0.0.3");
        assert_eq!(backup_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_literal_ip_short_circuits() {
        let (cache, calls) = cache_with(Some("10.0.0.4".parse().unwrap()), Duration::from_secs(300));
        assert_eq!(cache.resolve("192.168.1.5").await, "192.168.1.5");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        let (cache, _) = cache_with(Some(ip), Duration::from_millis(10));
        cache.resolve("example.com").await;
        assert_eq!(cache.len(), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.purge_expired();
        assert!(cache.is_empty());
    }
}
