use super::{OptimizerStats, TransferMethod, TransferReport, TransferStrategy};
use crate::cache::TtlCache;
use crate::client::{Connector, RemoteFile, ServerEndpoint, TransferMode};
use crate::config::{EngineConfig, OptimizerConfig};
use crate::error::{EngineError, EngineResult};
use crate::metrics::{CacheKind, MetricsSink, TransferRecord};
use crate::mode::{NetworkProbe, TransferModeSelector};
use crate::pool::{ConnectionPool, PooledSession};
use crate::progress::{ProgressCallback, ProgressReader, ProgressWriter};
use crate::retry::{OperationKind, RetryScheduler};
use anyhow::Context;
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::future::BoxFuture;
use std::io::{self, BufReader, BufWriter, Cursor, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// (server identity, remote directory)
type ListingKey = (String, String);

/// Write sink that collects a download in memory.
#[derive(Clone, Default)]
struct MemorySink(Arc<Mutex<Vec<u8>>>);

impl MemorySink {
    fn reset(&self) {
        if let Ok(mut buf) = self.0.lock() {
            buf.clear();
        }
    }

    fn take(&self) -> Vec<u8> {
        self.0
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }
}

impl Write for MemorySink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self
            .0
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "download buffer poisoned"))?;
        buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Baseline optimizations that work against any server: pooled sessions,
/// transfer-mode tuning, cached listings, streamed transfers and retries.
pub struct StandardOptimizer {
    config: OptimizerConfig,
    pool: ConnectionPool,
    selector: Arc<TransferModeSelector>,
    retry: RetryScheduler,
    listings: TtlCache<ListingKey, Vec<RemoteFile>>,
    metrics: Arc<dyn MetricsSink>,
}

impl StandardOptimizer {
    pub fn new(
        config: OptimizerConfig,
        pool: ConnectionPool,
        selector: Arc<TransferModeSelector>,
        retry: RetryScheduler,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            listings: TtlCache::new(config.listing_cache_ttl),
            config,
            pool,
            selector,
            retry,
            metrics,
        }
    }

    pub fn from_config(
        config: &EngineConfig,
        connector: Arc<dyn Connector>,
        probe: Arc<dyn NetworkProbe>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let pool = ConnectionPool::new(config.pool.clone(), connector, metrics.clone());
        let selector = Arc::new(TransferModeSelector::new(
            config.mode.clone(),
            probe,
            metrics.clone(),
        ));
        let retry = RetryScheduler::from_config(
            config.optimizer.intelligent_retry,
            &config.retry,
            metrics.clone(),
        );
        Self::new(config.optimizer.clone(), pool, selector, retry, metrics)
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn selector(&self) -> &TransferModeSelector {
        &self.selector
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub(crate) fn retry(&self) -> &RetryScheduler {
        &self.retry
    }

    pub(crate) fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Selects and applies a data-channel mode, once per session.
    async fn apply_transfer_mode(&self, session: &mut PooledSession, host: &str) {
        if !self.config.transfer_mode_optimization || session.transfer_mode().is_some() {
            return;
        }
        let mode = self.selector.select(Some(host)).await;
        match session.set_transfer_mode(mode).await {
            Ok(()) => {
                info!(session_id = %session.id(), %mode, "applied transfer mode");
                session.mark_transfer_mode(mode);
            }
            Err(e) if mode == TransferMode::Active => {
                warn!(session_id = %session.id(), "active mode rejected, re-selecting passive: {:#}", e);
                self.selector.invalidate();
                if session.set_transfer_mode(TransferMode::Passive).await.is_ok() {
                    session.mark_transfer_mode(TransferMode::Passive);
                }
            }
            Err(e) => warn!(session_id = %session.id(), "could not apply {} mode: {:#}", mode, e),
        }
    }

    /// Returns a session after an operation: pooled on success (when reuse
    /// is on), closed otherwise.
    pub(crate) async fn finish(&self, session: PooledSession, succeeded: bool) {
        if succeeded {
            self.release_session(session).await;
        } else {
            self.pool.discard(session).await;
        }
    }

    pub(crate) fn cached_listing(&self, identity: &str, path: &str) -> Option<Vec<RemoteFile>> {
        if !self.config.local_cache {
            return None;
        }
        let key = (identity.to_string(), path.to_string());
        match self.listings.get(&key) {
            Some(entries) => {
                self.metrics.cache_hit(CacheKind::Listing);
                debug!(identity, path, "listing served from cache");
                Some(entries)
            }
            None => {
                self.metrics.cache_miss(CacheKind::Listing);
                None
            }
        }
    }

    pub(crate) fn store_listing(&self, identity: &str, path: &str, entries: &[RemoteFile]) {
        if self.config.local_cache {
            self.listings
                .insert((identity.to_string(), path.to_string()), entries.to_vec());
        }
    }

    /// Drops every cached listing for `identity`.
    pub fn invalidate_listings(&self, identity: &str) -> usize {
        let evicted = self.listings.retain(|(cached, _)| cached != identity);
        if evicted > 0 {
            self.metrics.cache_eviction(CacheKind::Listing, evicted);
            debug!(identity, evicted, "invalidated cached listings");
        }
        evicted
    }

    pub(crate) async fn list_on(
        &self,
        session: &mut PooledSession,
        path: &str,
        machine: bool,
    ) -> EngineResult<Vec<RemoteFile>> {
        let target = path.to_string();
        self.retry
            .execute(OperationKind::List, path, session, |s| {
                let target = target.clone();
                Box::pin(async move {
                    if machine {
                        s.machine_list(&target).await
                    } else {
                        s.list(&target).await
                    }
                })
            })
            .await
            .map_err(|e| EngineError::transfer(format!("list {}", path), e))
    }

    fn should_stream(&self, size: u64) -> bool {
        (self.config.stream_processing && size > self.config.buffer_size as u64)
            || size > self.config.max_memory_usage
    }

    /// Whether client-side gzip applies to this file.
    pub fn compression_eligible(&self, local_path: &Path, size: u64) -> bool {
        if !self.config.client_compression {
            return false;
        }
        let allowed = local_path
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| {
                self.config
                    .compression_extensions
                    .iter()
                    .any(|candidate| candidate.eq_ignore_ascii_case(ext))
            });
        allowed
            && size >= self.config.compression_min_size
            && size <= self.config.max_memory_usage
    }

    /// Uploads over an already checked-out session, picking the stream
    /// pipeline or a single in-memory send by size.
    pub(crate) async fn upload_on(
        &self,
        session: &mut PooledSession,
        local_path: &Path,
        remote_path: &str,
        size: u64,
        progress: Option<ProgressCallback>,
    ) -> EngineResult<(u64, TransferMethod)> {
        let local = local_path.to_path_buf();
        let target = remote_path.to_string();

        if self.should_stream(size) {
            let capacity = self.config.buffer_size;
            let bytes = self
                .retry
                .execute(OperationKind::Upload, remote_path, session, |s| {
                    let local = local.clone();
                    let target = target.clone();
                    let progress = progress.clone();
                    Box::pin(async move {
                        let file = std::fs::File::open(&local)
                            .with_context(|| format!("failed to open {}", local.display()))?;
                        let reader = ProgressReader::new(
                            BufReader::with_capacity(capacity, file),
                            Some(size),
                            progress,
                        );
                        s.upload_from(Box::new(reader), &target, false).await
                    })
                })
                .await
                .map_err(|e| EngineError::transfer(format!("upload {}", remote_path), e))?;
            return Ok((bytes, TransferMethod::Streamed));
        }

        let data: Arc<[u8]> = tokio::fs::read(&local).await?.into();
        let bytes = self
            .send_bytes(session, data, remote_path, progress)
            .await?;
        Ok((bytes, TransferMethod::SingleShot))
    }

    async fn send_bytes(
        &self,
        session: &mut PooledSession,
        data: Arc<[u8]>,
        remote_path: &str,
        progress: Option<ProgressCallback>,
    ) -> EngineResult<u64> {
        let target = remote_path.to_string();
        let total = data.len() as u64;
        self.retry
            .execute(OperationKind::Upload, remote_path, session, |s| {
                let reader = ProgressReader::new(Cursor::new(data.clone()), Some(total), progress.clone());
                let target = target.clone();
                Box::pin(async move { s.upload_from(Box::new(reader), &target, false).await })
            })
            .await
            .map_err(|e| EngineError::transfer(format!("upload {}", remote_path), e))
    }

    /// Gzips `local_path` in memory and stores it as `<remote_path>.gz`.
    /// The server ends up holding different bytes than the local file.
    async fn upload_compressed(
        &self,
        session: &mut PooledSession,
        local_path: &Path,
        remote_path: &str,
        progress: Option<ProgressCallback>,
    ) -> EngineResult<(u64, String)> {
        let path = local_path.to_path_buf();
        let (original, compressed) = tokio::task::spawn_blocking(move || -> anyhow::Result<(u64, Vec<u8>)> {
            let input = std::fs::read(&path)?;
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&input)?;
            Ok((input.len() as u64, encoder.finish()?))
        })
        .await
        .map_err(|e| EngineError::transfer("compress", e.into()))?
        .map_err(|e| EngineError::transfer(format!("compress {}", local_path.display()), e))?;

        self.metrics
            .compression_ratio(original, compressed.len() as u64);
        let target = format!("{}.gz", remote_path);
        info!(
            path = %target,
            original,
            compressed = compressed.len(),
            "uploading gzip-compressed content; stored bytes differ from the local file"
        );
        let bytes = self
            .send_bytes(session, compressed.into(), &target, progress)
            .await?;
        Ok((bytes, target))
    }

    /// Downloads over an already checked-out session into `local_path`,
    /// replacing any existing file.
    pub(crate) async fn download_on(
        &self,
        session: &mut PooledSession,
        remote_path: &str,
        local_path: &Path,
        progress: Option<ProgressCallback>,
    ) -> EngineResult<(u64, TransferMethod)> {
        let expected = match session.size(remote_path).await {
            Ok(size) => Some(size),
            Err(e) => {
                debug!(path = remote_path, "size unavailable: {:#}", e);
                None
            }
        };
        if let Some(parent) = local_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let local = local_path.to_path_buf();
        let target = remote_path.to_string();
        let streamed = expected.map_or(true, |size| self.should_stream(size));

        let (bytes, method) = if streamed {
            let capacity = self.config.buffer_size;
            let bytes = self
                .retry
                .execute(OperationKind::Download, remote_path, session, |s| {
                    let local = local.clone();
                    let target = target.clone();
                    let progress = progress.clone();
                    Box::pin(async move {
                        let file = std::fs::File::create(&local)
                            .with_context(|| format!("failed to create {}", local.display()))?;
                        let writer = ProgressWriter::new(
                            BufWriter::with_capacity(capacity, file),
                            0,
                            expected,
                            progress,
                        );
                        s.download_to(Box::new(writer), &target, 0).await
                    })
                })
                .await
                .map_err(|e| EngineError::transfer(format!("download {}", remote_path), e))?;
            (bytes, TransferMethod::Streamed)
        } else {
            let sink = MemorySink::default();
            self.retry
                .execute(OperationKind::Download, remote_path, session, |s| {
                    sink.reset();
                    let writer = ProgressWriter::new(sink.clone(), 0, expected, progress.clone());
                    let target = target.clone();
                    Box::pin(async move { s.download_to(Box::new(writer), &target, 0).await })
                })
                .await
                .map_err(|e| EngineError::transfer(format!("download {}", remote_path), e))?;
            let data = sink.take();
            tokio::fs::write(&local, &data).await?;
            (data.len() as u64, TransferMethod::SingleShot)
        };

        if let Some(expected) = expected {
            if bytes != expected {
                warn!(path = remote_path, expected, bytes, "downloaded size differs from reported size");
            }
        }
        Ok((bytes, method))
    }

    /// `allow_compression` false keeps the bytes unmodified even when
    /// client-side gzip is configured.
    pub(crate) async fn upload_inner(
        &self,
        endpoint: &ServerEndpoint,
        local_path: &Path,
        remote_path: &str,
        progress: Option<ProgressCallback>,
        started: Instant,
        allow_compression: bool,
    ) -> EngineResult<TransferReport> {
        let size = tokio::fs::metadata(local_path).await?.len();
        let mut session = self.connect(endpoint).await?;
        let mode = session.transfer_mode();

        let result = if allow_compression && self.compression_eligible(local_path, size) {
            self.upload_compressed(&mut session, local_path, remote_path, progress)
                .await
                .map(|(bytes, target)| (bytes, target, TransferMethod::Compressed))
        } else {
            self.upload_on(&mut session, local_path, remote_path, size, progress)
                .await
                .map(|(bytes, method)| (bytes, remote_path.to_string(), method))
        };
        self.finish(session, result.is_ok()).await;
        let (bytes, target, method) = result?;

        self.invalidate_listings(&endpoint.identity());
        Ok(TransferReport {
            remote_path: target,
            local_path: local_path.to_path_buf(),
            bytes,
            total_size: bytes,
            resumed_from: 0,
            duration_ms: elapsed_ms(started),
            method,
            mode,
        })
    }

    pub(crate) async fn download_inner(
        &self,
        endpoint: &ServerEndpoint,
        remote_path: &str,
        local_path: &Path,
        progress: Option<ProgressCallback>,
        started: Instant,
    ) -> EngineResult<TransferReport> {
        let mut session = self.connect(endpoint).await?;
        let mode = session.transfer_mode();
        let result = self
            .download_on(&mut session, remote_path, local_path, progress)
            .await;
        self.finish(session, result.is_ok()).await;
        let (bytes, method) = result?;

        Ok(TransferReport {
            remote_path: remote_path.to_string(),
            local_path: local_path.to_path_buf(),
            bytes,
            total_size: bytes,
            resumed_from: 0,
            duration_ms: elapsed_ms(started),
            method,
            mode,
        })
    }

    pub(crate) fn record_transfer(
        &self,
        operation: &'static str,
        started: Instant,
        result: &EngineResult<TransferReport>,
    ) {
        self.metrics.transfer(TransferRecord {
            operation,
            bytes: result.as_ref().map_or(0, |report| report.bytes),
            duration: started.elapsed(),
            success: result.is_ok(),
        });
    }

    /// Runs a write command with retries and drops the cached listings it
    /// may have made stale.
    async fn write_command<F>(&self, endpoint: &ServerEndpoint, label: String, op: F) -> EngineResult<()>
    where
        F: for<'s> FnMut(&'s mut PooledSession) -> BoxFuture<'s, anyhow::Result<()>> + Send,
    {
        let mut session = self.connect(endpoint).await?;
        let result = self
            .retry
            .execute(OperationKind::Command, &label, &mut session, op)
            .await;
        self.finish(session, result.is_ok()).await;
        result.map_err(|e| EngineError::transfer(label, e))?;

        self.invalidate_listings(&endpoint.identity());
        Ok(())
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl TransferStrategy for StandardOptimizer {
    fn name(&self) -> &'static str {
        "standard"
    }

    async fn connect(&self, endpoint: &ServerEndpoint) -> EngineResult<PooledSession> {
        let mut session = self.pool.acquire(endpoint).await?;
        self.apply_transfer_mode(&mut session, &endpoint.host).await;
        Ok(session)
    }

    async fn release_session(&self, session: PooledSession) {
        if self.config.connection_reuse {
            self.pool.release(session).await;
        } else {
            self.pool.discard(session).await;
        }
    }

    async fn list_directory(
        &self,
        endpoint: &ServerEndpoint,
        path: &str,
    ) -> EngineResult<Vec<RemoteFile>> {
        let identity = endpoint.identity();
        if let Some(entries) = self.cached_listing(&identity, path) {
            return Ok(entries);
        }

        let mut session = self.connect(endpoint).await?;
        let result = self.list_on(&mut session, path, false).await;
        self.finish(session, result.is_ok()).await;
        let entries = result?;

        self.store_listing(&identity, path, &entries);
        Ok(entries)
    }

    async fn upload_file(
        &self,
        endpoint: &ServerEndpoint,
        local_path: &Path,
        remote_path: &str,
        progress: Option<ProgressCallback>,
    ) -> EngineResult<TransferReport> {
        let started = Instant::now();
        let result = self
            .upload_inner(endpoint, local_path, remote_path, progress, started, true)
            .await;
        self.record_transfer("upload", started, &result);
        result
    }

    async fn download_file(
        &self,
        endpoint: &ServerEndpoint,
        remote_path: &str,
        local_path: &Path,
        progress: Option<ProgressCallback>,
    ) -> EngineResult<TransferReport> {
        let started = Instant::now();
        let result = self
            .download_inner(endpoint, remote_path, local_path, progress, started)
            .await;
        self.record_transfer("download", started, &result);
        result
    }

    async fn delete_file(&self, endpoint: &ServerEndpoint, path: &str) -> EngineResult<()> {
        let target = path.to_string();
        self.write_command(endpoint, format!("delete {}", path), |s| {
            let target = target.clone();
            Box::pin(async move { s.remove(&target).await })
        })
        .await
    }

    async fn rename(&self, endpoint: &ServerEndpoint, from: &str, to: &str) -> EngineResult<()> {
        let (source, dest) = (from.to_string(), to.to_string());
        self.write_command(endpoint, format!("rename {} -> {}", from, to), |s| {
            let (source, dest) = (source.clone(), dest.clone());
            Box::pin(async move { s.rename(&source, &dest).await })
        })
        .await
    }

    async fn make_directory(&self, endpoint: &ServerEndpoint, path: &str) -> EngineResult<()> {
        let target = path.to_string();
        self.write_command(endpoint, format!("mkdir {}", path), |s| {
            let target = target.clone();
            Box::pin(async move { s.make_directory(&target).await })
        })
        .await
    }

    fn clear_cache(&self) {
        let evicted = self.listings.len();
        self.listings.clear();
        if evicted > 0 {
            self.metrics.cache_eviction(CacheKind::Listing, evicted);
        }
        self.selector.invalidate();
    }

    fn get_stats(&self) -> OptimizerStats {
        OptimizerStats {
            strategy: self.name(),
            pool: self.pool.stats(),
            listing_cache_entries: self.listings.len(),
            capability_cache_entries: 0,
            pending_continuations: 0,
            metrics: self.metrics.snapshot(),
        }
    }

    async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FtpSession;
    use crate::metrics::NoopMetrics;
    use crate::mode::SystemNetworkProbe;
    use anyhow::anyhow;
    use std::io::Read;

    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self, _: &ServerEndpoint) -> anyhow::Result<Box<dyn FtpSession>> {
            Err(anyhow!("connection refused"))
        }
    }

    fn build(config: OptimizerConfig) -> StandardOptimizer {
        let engine = EngineConfig {
            optimizer: config,
            ..EngineConfig::default()
        };
        StandardOptimizer::from_config(
            &engine,
            Arc::new(Unreachable),
            Arc::new(SystemNetworkProbe),
            Arc::new(NoopMetrics),
        )
    }

    #[test]
    fn test_compression_is_opt_in() {
        let optimizer = build(OptimizerConfig::default());
        assert!(!optimizer.compression_eligible(Path::new("notes.txt"), 10_000));
    }

    #[test]
    fn test_compression_eligibility() {
        let optimizer = build(OptimizerConfig {
            client_compression: true,
            ..OptimizerConfig::default()
        });
        assert!(optimizer.compression_eligible(Path::new("notes.TXT"), 10_000));
        assert!(!optimizer.compression_eligible(Path::new("notes.txt"), 100));
        assert!(!optimizer.compression_eligible(Path::new("photo.jpg"), 10_000));
        assert!(!optimizer.compression_eligible(Path::new("Makefile"), 10_000));
        assert!(!optimizer.compression_eligible(Path::new("huge.log"), 128 * 1024 * 1024));
    }

    #[test]
    fn test_stream_threshold() {
        let optimizer = build(OptimizerConfig {
            buffer_size: 1024,
            ..OptimizerConfig::default()
        });
        assert!(!optimizer.should_stream(1024));
        assert!(optimizer.should_stream(1025));

        let optimizer = build(OptimizerConfig {
            stream_processing: false,
            buffer_size: 1024,
            max_memory_usage: 4096,
            ..OptimizerConfig::default()
        });
        assert!(!optimizer.should_stream(2048));
        assert!(optimizer.should_stream(4097));
    }

    #[test]
    fn test_memory_sink_reset_between_attempts() {
        let sink = MemorySink::default();
        let mut writer = sink.clone();
        writer.write_all(b"partial").unwrap();
        sink.reset();
        writer.write_all(b"complete").unwrap();
        assert_eq!(sink.take(), b"complete");

        let mut empty = Vec::new();
        Cursor::new(sink.take()).read_to_end(&mut empty).unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_connection_failure_is_recorded() {
        let optimizer = build(OptimizerConfig::default());
        let endpoint = ServerEndpoint::parse("ftp://u@h:21").unwrap();
        let err = optimizer.list_directory(&endpoint, "/").await.unwrap_err();
        assert!(matches!(err, EngineError::Connection { .. }));
        assert_eq!(optimizer.get_stats().pool[0].failed_requests, 1);
    }
}
