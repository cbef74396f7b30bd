//! Transfer executor
//!
//! Runs a `TransferOptimization` against the network: single stream,
//! bounded multi-connection fan-out, adaptive re-tuning between chunk
//! rounds, streaming, and multipart upload with per-chunk compression.
//! Hosts are resolved through the DNS cache and every attempt is guarded
//! by the circuit breaker.

use crate::breaker::CircuitBreakerRegistry;
use crate::dns::DnsCache;
use crate::error::{Error, Result};
use crate::network::{NetworkAnalyzer, PassiveNetworkAnalyzer};
use crate::types::{
    CompressionAlgorithm, FileInfo, Settings, TransferOptimization, TransferStrategy,
};
use crate::utils::{backoff_delay, sha256_file, sha256_hex};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;

/// Cooperative cancellation flag, checked between chunks
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Updates streamed from the executor while a transfer runs
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    Bytes {
        bytes_transferred: u64,
        total_bytes: Option<u64>,
    },
    Retry,
}

pub type ProgressSender = async_channel::Sender<ProgressUpdate>;

/// Result of a finished download
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub bytes: u64,
    pub checksum: String,
    pub duration: Duration,
}

/// One entry of the multipart manifest committed on finalize
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkManifestEntry {
    pub index: usize,
    pub size: u64,
    pub uploaded_size: u64,
    pub checksum: String,
}

/// Result of a finished upload
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub bytes: u64,
    pub chunks: usize,
    pub upload_id: Option<String>,
    pub duration: Duration,
}

#[derive(Deserialize)]
struct InitiateResponse {
    upload_id: String,
}

pub struct TransferExecutor {
    client: reqwest::Client,
    settings: Settings,
    dns: Arc<DnsCache>,
    breaker: Arc<CircuitBreakerRegistry>,
    analyzer: Arc<PassiveNetworkAnalyzer>,
}

impl TransferExecutor {
    pub fn new(
        settings: Settings,
        dns: Arc<DnsCache>,
        breaker: Arc<CircuitBreakerRegistry>,
        analyzer: Arc<PassiveNetworkAnalyzer>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            settings,
            dns,
            breaker,
            analyzer,
        }
    }

    /// Probe a URL for size, content type and range support. Failures
    /// degrade to an empty `FileInfo` so planning still proceeds.
    pub async fn analyze_file(&self, url: &str) -> FileInfo {
        let request = self
            .client
            .head(url)
            .timeout(self.request_timeout())
            .send();

        match request.await {
            Ok(response) => {
                let headers = response.headers();
                FileInfo {
                    size: headers
                        .get(reqwest::header::CONTENT_LENGTH)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0),
                    content_type: headers
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string(),
                    supports_range: headers.contains_key(reqwest::header::ACCEPT_RANGES),
                }
            }
            Err(e) => {
                log::warn!("file analysis failed for {}: {}", url, e);
                FileInfo::default()
            }
        }
    }

    /// Run a download according to the plan
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        plan: &TransferOptimization,
        progress: ProgressSender,
        cancel: CancelToken,
    ) -> Result<DownloadOutcome> {
        let host = host_of(url)?;
        self.breaker.check(&host)?;

        // Warm the cache; a direct-connect fallback still uses the URL host
        let resolved = self.dns.resolve(&host).await;
        log::debug!("downloading {} via {}", url, resolved);

        let started = Instant::now();
        let result = match plan.strategy {
            TransferStrategy::Single | TransferStrategy::Streaming => {
                self.download_streamed(url, &host, destination, &progress, &cancel)
                    .await
            }
            TransferStrategy::MultiConnection => {
                self.download_multi(url, &host, destination, plan, &progress, &cancel, false)
                    .await
            }
            TransferStrategy::Adaptive => {
                self.download_multi(url, &host, destination, plan, &progress, &cancel, true)
                    .await
            }
        };

        match result {
            Ok(bytes) => {
                let path = destination.to_path_buf();
                let checksum = tokio::task::spawn_blocking(move || sha256_file(&path))
                    .await
                    .map_err(|e| Error::Io(std::io::Error::other(e)))??;
                Ok(DownloadOutcome {
                    bytes,
                    checksum,
                    duration: started.elapsed(),
                })
            }
            Err(e) => {
                if !plan.resume_enabled {
                    let _ = tokio::fs::remove_file(destination).await;
                }
                Err(e)
            }
        }
    }

    /// Sequential streamed fetch, used for both single and streaming
    async fn download_streamed(
        &self,
        url: &str,
        host: &str,
        destination: &Path,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let timeout = self.request_timeout();
        self.retry_request(host, progress, || async move {
            let started = Instant::now();
            let response = self.client.get(url).timeout(timeout).send().await?;
            let latency = started.elapsed();

            let status = response.status();
            if !status.is_success() {
                return Err(status_error(status));
            }
            let total = response.content_length();

            let mut file = tokio::fs::File::create(destination).await?;
            let mut stream = response.bytes_stream();
            let mut written: u64 = 0;

            while let Some(chunk) = stream.next().await {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled(url.to_string()));
                }
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
                let _ = progress.try_send(ProgressUpdate::Bytes {
                    bytes_transferred: written,
                    total_bytes: total,
                });
            }
            file.flush().await?;

            self.analyzer
                .record_request(latency, written, started.elapsed(), true);
            Ok(written)
        })
        .await
    }

    /// Bounded multi-connection fetch. With `adaptive` set, the file is
    /// pulled in rounds and the tuner may halve connections or double the
    /// chunk size between rounds; adjustments never touch in-flight work.
    #[allow(clippy::too_many_arguments)]
    async fn download_multi(
        &self,
        url: &str,
        host: &str,
        destination: &Path,
        plan: &TransferOptimization,
        progress: &ProgressSender,
        cancel: &CancelToken,
        adaptive: bool,
    ) -> Result<u64> {
        let info = self.analyze_file(url).await;
        if info.size == 0 || !info.supports_range {
            log::info!("{}: no range support, falling back to streamed fetch", url);
            return self
                .download_streamed(url, host, destination, progress, cancel)
                .await;
        }
        let total = info.size;

        // Pre-size the file so parts can land at their offsets
        {
            let file = tokio::fs::File::create(destination).await?;
            file.set_len(total).await?;
        }

        let transferred = Arc::new(AtomicU64::new(0));
        let mut connections = plan.connections.max(1);
        let mut chunk_size = plan.chunk_size.max(64 * 1024);
        let mut tuner = AdaptiveTuner::new(
            plan.estimated_speed,
            Duration::from_secs(self.settings.adaptive_interval_secs),
            self.settings.low_speed_factor,
            self.settings.stability_threshold,
        );

        let mut offset: u64 = 0;
        while offset < total {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(url.to_string()));
            }

            let round_len = if adaptive {
                (connections as u64 * chunk_size).min(total - offset)
            } else {
                total - offset
            };
            let ranges = split_ranges(offset, round_len, connections);

            let round_started = Instant::now();
            let semaphore = Arc::new(Semaphore::new(connections as usize));
            let mut tasks = Vec::with_capacity(ranges.len());

            for (start, end) in ranges {
                let semaphore = semaphore.clone();
                let client = self.client.clone();
                let url = url.to_string();
                let destination = destination.to_path_buf();
                let transferred = transferred.clone();
                let progress = progress.clone();
                let cancel = cancel.clone();
                let timeout = self.request_timeout();

                let retries = self.settings.retry_attempts;

                tasks.push(tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|e| Error::Channel(e.to_string()))?;

                    let mut attempt = 0u32;
                    loop {
                        match fetch_range(
                            &client,
                            &url,
                            &destination,
                            start,
                            end,
                            total,
                            &transferred,
                            &progress,
                            &cancel,
                            timeout,
                        )
                        .await
                        {
                            Ok(()) => return Ok(()),
                            Err((e, partial)) => {
                                // Roll the partial range back out of the counter
                                transferred.fetch_sub(partial, Ordering::SeqCst);
                                if e.is_transient() && attempt < retries {
                                    attempt += 1;
                                    let _ = progress.try_send(ProgressUpdate::Retry);
                                    tokio::time::sleep(backoff_delay(attempt - 1)).await;
                                } else {
                                    return Err(e);
                                }
                            }
                        }
                    }
                }));
            }

            let mut round_result: Result<()> = Ok(());
            for task in tasks {
                let joined = task
                    .await
                    .map_err(|e| Error::Channel(format!("task join: {}", e)))?;
                if let Err(e) = joined {
                    if round_result.is_ok() {
                        round_result = Err(e);
                    }
                }
            }

            match round_result {
                Ok(()) => {
                    self.breaker.record_success(host);
                    let elapsed = round_started.elapsed();
                    self.analyzer.record_request(
                        Duration::from_millis(0),
                        round_len,
                        elapsed,
                        true,
                    );

                    if adaptive {
                        let throughput = round_len as f64 / elapsed.as_secs_f64().max(1e-6);
                        match tuner.observe(throughput) {
                            Some(Adjustment::HalveConnections) => {
                                connections = (connections / 2).max(1);
                                log::info!(
                                    "{}: throughput below estimate, connections now {}",
                                    url,
                                    connections
                                );
                            }
                            Some(Adjustment::DoubleChunk) => {
                                chunk_size =
                                    (chunk_size * 2).min(self.settings.buffer_ceiling);
                                log::info!(
                                    "{}: stable link, chunk size now {}",
                                    url,
                                    chunk_size
                                );
                            }
                            None => {}
                        }
                    }
                }
                Err(e) => {
                    if e.is_transient() {
                        self.breaker.record_failure(host);
                    }
                    return Err(e);
                }
            }

            offset += round_len;
        }

        Ok(transferred.load(Ordering::SeqCst))
    }

    /// Run an upload according to the plan
    pub async fn upload(
        &self,
        source: &Path,
        upload_url: &str,
        plan: &TransferOptimization,
        progress: ProgressSender,
        cancel: CancelToken,
    ) -> Result<UploadOutcome> {
        let host = host_of(upload_url)?;
        self.breaker.check(&host)?;
        self.dns.resolve(&host).await;

        let meta = tokio::fs::metadata(source).await?;
        let file_size = meta.len();
        let started = Instant::now();

        if plan.strategy == TransferStrategy::Single {
            let bytes = self
                .upload_single(source, upload_url, &host, &progress, &cancel)
                .await?;
            return Ok(UploadOutcome {
                bytes,
                chunks: 1,
                upload_id: None,
                duration: started.elapsed(),
            });
        }

        self.upload_multipart(source, upload_url, &host, file_size, plan, progress, cancel)
            .await
            .map(|(chunks, upload_id)| UploadOutcome {
                bytes: file_size,
                chunks,
                upload_id: Some(upload_id),
                duration: started.elapsed(),
            })
    }

    async fn upload_single(
        &self,
        source: &Path,
        upload_url: &str,
        host: &str,
        progress: &ProgressSender,
        cancel: &CancelToken,
    ) -> Result<u64> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(upload_url.to_string()));
        }
        let data = tokio::fs::read(source).await?;
        let size = data.len() as u64;
        let timeout = self.request_timeout();

        self.retry_request(host, progress, || {
            let data = data.clone();
            async move {
                let response = self
                    .client
                    .post(upload_url)
                    .timeout(timeout)
                    .body(data)
                    .send()
                    .await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(status_error(status));
                }
                Ok(())
            }
        })
        .await?;

        let _ = progress.try_send(ProgressUpdate::Bytes {
            bytes_transferred: size,
            total_bytes: Some(size),
        });
        Ok(size)
    }

    /// Multipart path: initiate, push compressed chunks concurrently,
    /// abort the whole session if any chunk exhausts its retries, then
    /// commit the manifest.
    async fn upload_multipart(
        &self,
        source: &Path,
        upload_url: &str,
        host: &str,
        file_size: u64,
        plan: &TransferOptimization,
        progress: ProgressSender,
        cancel: CancelToken,
    ) -> Result<(usize, String)> {
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload.bin".to_string());

        let initiate: InitiateResponse = self
            .client
            .post(format!("{}/initiate", upload_url))
            .timeout(self.request_timeout())
            .json(&serde_json::json!({
                "file_name": file_name,
                "file_size": file_size,
                "compression": if plan.compression_enabled {
                    self.settings.compression_algorithm.to_string()
                } else {
                    CompressionAlgorithm::None.to_string()
                },
            }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Network(format!("initiate failed: {}", e)))?
            .json()
            .await?;
        let upload_id = initiate.upload_id;

        let chunk_size = plan.chunk_size.max(64 * 1024);
        let chunk_count = file_size.div_ceil(chunk_size) as usize;
        let semaphore = Arc::new(Semaphore::new(plan.connections.max(1) as usize));
        let uploaded = Arc::new(AtomicU64::new(0));
        let algorithm = if plan.compression_enabled {
            self.settings.compression_algorithm
        } else {
            CompressionAlgorithm::None
        };
        let level = self.settings.compression_level;

        let mut tasks = Vec::with_capacity(chunk_count);
        for index in 0..chunk_count {
            if cancel.is_cancelled() {
                self.abort_multipart(upload_url, &upload_id).await;
                return Err(Error::Cancelled(upload_url.to_string()));
            }

            let start = index as u64 * chunk_size;
            let len = chunk_size.min(file_size - start);
            let semaphore = semaphore.clone();
            let client = self.client.clone();
            let source = source.to_path_buf();
            let upload_url = upload_url.to_string();
            let upload_id = upload_id.clone();
            let uploaded = uploaded.clone();
            let progress = progress.clone();
            let retries = self.settings.retry_attempts;
            let timeout = self.request_timeout();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| Error::Channel(e.to_string()))?;

                let raw = read_slice(&source, start, len).await?;
                let checksum = sha256_hex(&raw);
                let body = tokio::task::spawn_blocking(move || {
                    compress_chunk(&raw, algorithm, level)
                })
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))??;
                let uploaded_size = body.len() as u64;

                let mut attempt = 0u32;
                loop {
                    let request = client
                        .post(format!("{}/chunk/{}", upload_url, index))
                        .timeout(timeout)
                        .header("x-upload-id", upload_id.as_str())
                        .header("x-chunk-checksum", checksum.as_str())
                        .body(body.clone())
                        .send()
                        .await;

                    match request {
                        Ok(response) if response.status().is_success() => break,
                        Ok(response) if response.status().is_client_error() => {
                            return Err(status_error(response.status()));
                        }
                        Ok(response) if attempt >= retries => {
                            return Err(status_error(response.status()));
                        }
                        Err(e) if attempt >= retries => return Err(e.into()),
                        _ => {
                            attempt += 1;
                            let _ = progress.try_send(ProgressUpdate::Retry);
                            tokio::time::sleep(backoff_delay(attempt - 1)).await;
                        }
                    }
                }

                let done = uploaded.fetch_add(len, Ordering::SeqCst) + len;
                let _ = progress.try_send(ProgressUpdate::Bytes {
                    bytes_transferred: done,
                    total_bytes: Some(file_size),
                });

                Ok(ChunkManifestEntry {
                    index,
                    size: len,
                    uploaded_size,
                    checksum,
                })
            }));
        }

        let mut manifest = Vec::with_capacity(chunk_count);
        let mut failure: Option<Error> = None;
        for task in tasks {
            match task.await {
                Ok(Ok(entry)) => manifest.push(entry),
                Ok(Err(e)) => failure = failure.or(Some(e)),
                Err(e) => {
                    failure = failure.or(Some(Error::Channel(format!("task join: {}", e))))
                }
            }
        }

        if let Some(e) = failure {
            self.abort_multipart(upload_url, &upload_id).await;
            if e.is_transient() {
                self.breaker.record_failure(host);
            }
            return Err(e);
        }

        manifest.sort_by_key(|entry| entry.index);
        self.client
            .post(format!("{}/complete", upload_url))
            .timeout(self.request_timeout())
            .header("x-upload-id", upload_id.as_str())
            .json(&manifest)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Network(format!("complete failed: {}", e)))?;

        self.breaker.record_success(host);
        Ok((chunk_count, upload_id))
    }

    async fn abort_multipart(&self, upload_url: &str, upload_id: &str) {
        let result = self
            .client
            .post(format!("{}/abort", upload_url))
            .timeout(self.request_timeout())
            .header("x-upload-id", upload_id)
            .send()
            .await;
        if let Err(e) = result {
            log::warn!("multipart abort for {} failed: {}", upload_id, e);
        }
    }

    /// Retry transient failures with exponential backoff, then record the
    /// final outcome against the breaker.
    async fn retry_request<F, Fut, T>(
        &self,
        host: &str,
        progress: &ProgressSender,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => {
                    self.breaker.record_success(host);
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.settings.retry_attempts => {
                    attempt += 1;
                    log::warn!(
                        "transient error from {} (attempt {}/{}): {}",
                        host,
                        attempt,
                        self.settings.retry_attempts,
                        e
                    );
                    let _ = progress.try_send(ProgressUpdate::Retry);
                    tokio::time::sleep(backoff_delay(attempt - 1)).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        self.breaker.record_failure(host);
                        self.analyzer.record_request(
                            Duration::from_millis(0),
                            0,
                            Duration::ZERO,
                            false,
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Request timeout scaled by observed latency, floor 10s
    fn request_timeout(&self) -> Duration {
        let latency_ms = self.analyzer.analyze().latency_ms;
        let scaled = self.settings.timeout_secs as f64 * (1.0 + latency_ms / 1000.0);
        Duration::from_secs_f64(scaled.max(10.0))
    }
}

/// Fetch one byte range and write it at its offset. On error, reports
/// how many bytes it had already added to the shared counter so the
/// caller can roll them back before retrying.
#[allow(clippy::too_many_arguments)]
async fn fetch_range(
    client: &reqwest::Client,
    url: &str,
    destination: &Path,
    start: u64,
    end: u64,
    total: u64,
    transferred: &AtomicU64,
    progress: &ProgressSender,
    cancel: &CancelToken,
    timeout: Duration,
) -> std::result::Result<(), (Error, u64)> {
    let mut written: u64 = 0;

    let inner = async {
        let response = client
            .get(url)
            .timeout(timeout)
            .header(reqwest::header::RANGE, format!("bytes={}-{}", start, end))
            .send()
            .await
            .map_err(Error::from)?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(destination)
            .await
            .map_err(Error::from)?;
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(Error::from)?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(url.to_string()));
            }
            let chunk = chunk.map_err(Error::from)?;
            file.write_all(&chunk).await.map_err(Error::from)?;
            written += chunk.len() as u64;
            let done = transferred.fetch_add(chunk.len() as u64, Ordering::SeqCst)
                + chunk.len() as u64;
            let _ = progress.try_send(ProgressUpdate::Bytes {
                bytes_transferred: done,
                total_bytes: Some(total),
            });
        }
        file.flush().await.map_err(Error::from)?;
        Ok(())
    };

    let result = inner.await;
    match result {
        Ok(()) => Ok(()),
        Err(e) => Err((e, written)),
    }
}

/// Read `len` bytes at `start` from a file
async fn read_slice(path: &Path, start: u64, len: u64) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

pub(crate) fn host_of(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::InvalidInput(format!("bad url {}: {}", url, e)))?;
    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidInput(format!("no host in url: {}", url)))
}

fn status_error(status: reqwest::StatusCode) -> Error {
    if status.is_client_error() {
        Error::InvalidInput(format!("HTTP {}", status))
    } else {
        Error::Network(format!("HTTP {}", status))
    }
}

/// Split `[offset, offset+len)` into up to `parts` inclusive byte ranges
fn split_ranges(offset: u64, len: u64, parts: u32) -> Vec<(u64, u64)> {
    if len == 0 {
        return Vec::new();
    }
    let parts = (parts as u64).clamp(1, len);
    let base = len / parts;
    let remainder = len % parts;

    let mut ranges = Vec::with_capacity(parts as usize);
    let mut start = offset;
    for i in 0..parts {
        let size = base + if i < remainder { 1 } else { 0 };
        ranges.push((start, start + size - 1));
        start += size;
    }
    ranges
}

/// Compress one chunk with the configured algorithm
fn compress_chunk(data: &[u8], algorithm: CompressionAlgorithm, level: i32) -> Result<Vec<u8>> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Gzip => {
            use flate2::write::GzEncoder;
            use std::io::Write;
            let mut encoder =
                GzEncoder::new(Vec::new(), flate2::Compression::new(level.clamp(0, 9) as u32));
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        CompressionAlgorithm::Zstd => {
            zstd::encode_all(data, level).map_err(Error::Io)
        }
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    HalveConnections,
    DoubleChunk,
}

/// Decides between-round adjustments for the adaptive strategy. Pure
/// bookkeeping; the executor applies whatever it returns to the next
/// round only.
pub struct AdaptiveTuner {
    estimated_bps: f64,
    interval: Duration,
    low_speed_factor: f64,
    stability_threshold: f64,
    throughputs: Vec<f64>,
    last_adjustment: Instant,
}

impl AdaptiveTuner {
    pub fn new(
        estimated_bps: f64,
        interval: Duration,
        low_speed_factor: f64,
        stability_threshold: f64,
    ) -> Self {
        Self {
            estimated_bps,
            interval,
            low_speed_factor,
            stability_threshold,
            throughputs: Vec::new(),
            last_adjustment: Instant::now(),
        }
    }

    /// Feed one observed round throughput. Returns an adjustment at most
    /// once per interval.
    pub fn observe(&mut self, throughput_bps: f64) -> Option<Adjustment> {
        self.throughputs.push(throughput_bps);
        if self.throughputs.len() > 20 {
            self.throughputs.remove(0);
        }

        if self.last_adjustment.elapsed() < self.interval {
            return None;
        }

        if self.estimated_bps > 0.0
            && throughput_bps < self.estimated_bps * self.low_speed_factor
        {
            self.last_adjustment = Instant::now();
            return Some(Adjustment::HalveConnections);
        }

        if self.stability() > self.stability_threshold {
            self.last_adjustment = Instant::now();
            return Some(Adjustment::DoubleChunk);
        }

        None
    }

    /// Inverse coefficient of variation over recent rounds, in [0, 1]
    fn stability(&self) -> f64 {
        if self.throughputs.len() < 3 {
            return 0.0;
        }
        let mean = self.throughputs.iter().sum::<f64>() / self.throughputs.len() as f64;
        if mean <= 0.0 {
            return 0.0;
        }
        let variance = self
            .throughputs
            .iter()
            .map(|t| (t - mean).powi(2))
            .sum::<f64>()
            / self.throughputs.len() as f64;
        (1.0 - variance.sqrt() / mean).clamp(0.0, 1.0)
    }
}
