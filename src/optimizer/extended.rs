//! Capability-gated transfers layered over [`StandardOptimizer`].
//!
//! Each gated feature is `on`, `off` or `auto`; `auto` trusts the detected
//! capability only when the profile is reliable enough. Whenever a gated
//! path is unavailable or fails at runtime, the standard path runs instead
//! and its result is returned. If that fails too, the original error wins.
//! Integrity failures are never retried through a fallback.

use super::standard::elapsed_ms;
use super::{OptimizerStats, StandardOptimizer, TransferMethod, TransferReport, TransferStrategy};
use crate::capability::{Capability, CapabilityDetector, ServerCapabilityProfile};
use crate::client::{RemoteFile, ServerEndpoint};
use crate::config::{DetectionConfig, ExtendedConfig, FeatureToggle};
use crate::error::{EngineError, EngineResult};
use crate::metrics::MetricsSink;
use crate::pool::PooledSession;
use crate::progress::{ProgressCallback, ProgressReader, ProgressWriter};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Local bookkeeping for an upload that may need continuing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumableTransferState {
    pub total_size: u64,
    pub transferred_size: u64,
    pub attempts: u32,
    pub started_at: DateTime<Local>,
    pub last_updated_at: DateTime<Local>,
    /// Whether `transferred_size` was confirmed by the server.
    pub validated: bool,
}

impl ResumableTransferState {
    fn new(total_size: u64) -> Self {
        let now = Local::now();
        Self {
            total_size,
            transferred_size: 0,
            attempts: 0,
            started_at: now,
            last_updated_at: now,
            validated: false,
        }
    }
}

fn continuation_key(identity: &str, remote_path: &str) -> String {
    format!("{}{}", identity, remote_path)
}

async fn local_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map_or(0, |meta| meta.len())
}

pub struct ExtendedOptimizer {
    config: ExtendedConfig,
    standard: Arc<StandardOptimizer>,
    detector: CapabilityDetector,
    continuations: DashMap<String, ResumableTransferState>,
}

impl ExtendedOptimizer {
    pub fn new(
        config: ExtendedConfig,
        detection: DetectionConfig,
        standard: Arc<StandardOptimizer>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            standard,
            detector: CapabilityDetector::new(detection, metrics),
            continuations: DashMap::new(),
        }
    }

    pub fn standard(&self) -> &StandardOptimizer {
        &self.standard
    }

    pub fn detector(&self) -> &CapabilityDetector {
        &self.detector
    }

    pub fn continuation(&self, endpoint: &ServerEndpoint, remote_path: &str) -> Option<ResumableTransferState> {
        self.continuations
            .get(&continuation_key(&endpoint.identity(), remote_path))
            .map(|state| state.clone())
    }

    async fn profile(&self, session: &mut PooledSession) -> Option<ServerCapabilityProfile> {
        let identity = session.identity().to_string();
        if self.config.auto_capability_detection {
            Some(self.detector.detect(session.transport(), &identity).await)
        } else {
            self.detector.cached(&identity)
        }
    }

    fn gate(
        &self,
        toggle: FeatureToggle,
        profile: Option<&ServerCapabilityProfile>,
        capability: Capability,
    ) -> bool {
        let detected = profile.map_or(false, |p| p.supports(capability));
        let reliable = profile.map_or(false, |p| p.is_reliable(self.config.min_reliability));
        toggle.resolve(detected, reliable)
    }

    /// Profile for `endpoint`, detecting over a pooled session if nothing
    /// is cached.
    pub async fn capabilities(&self, endpoint: &ServerEndpoint) -> EngineResult<ServerCapabilityProfile> {
        if let Some(profile) = self.detector.cached(&endpoint.identity()) {
            return Ok(profile);
        }
        let mut session = self.standard.connect(endpoint).await?;
        let identity = session.identity().to_string();
        let profile = self.detector.detect(session.transport(), &identity).await;
        self.standard.release_session(session).await;
        Ok(profile)
    }

    pub async fn refresh_capabilities(&self, session: &mut PooledSession) -> ServerCapabilityProfile {
        let identity = session.identity().to_string();
        self.detector.refresh(session.transport(), &identity).await
    }

    /// Link-level compression is never negotiated: the transport cannot
    /// decode MODE Z streams. The file is sent unmodified through the
    /// resumable upload path instead.
    pub async fn compression_transfer(
        &self,
        endpoint: &ServerEndpoint,
        local_path: &Path,
        remote_path: &str,
        progress: Option<ProgressCallback>,
    ) -> EngineResult<TransferReport> {
        warn!(
            path = remote_path,
            toggle = ?self.config.compression_transfer,
            "link-level compression is disabled, sending uncompressed"
        );
        let started = Instant::now();
        let result = self
            .upload_inner(endpoint, local_path, remote_path, progress, started, false)
            .await;
        self.standard.record_transfer("upload", started, &result);
        result
    }

    fn begin_continuation(&self, key: &str, total: u64) {
        self.continuations
            .insert(key.to_string(), ResumableTransferState::new(total));
    }

    fn note_remote_size(&self, key: &str, remote_size: Option<u64>) {
        if let Some(mut state) = self.continuations.get_mut(key) {
            state.attempts += 1;
            state.last_updated_at = Local::now();
            if let Some(size) = remote_size {
                state.transferred_size = size.min(state.total_size);
                state.validated = true;
            }
        }
    }

    /// Clears the record on success, keeps it for the next attempt otherwise.
    fn settle<T>(&self, key: &str, result: EngineResult<T>) -> EngineResult<T> {
        match &result {
            Ok(_) => {
                self.continuations.remove(key);
            }
            Err(_) => {
                if let Some(mut state) = self.continuations.get_mut(key) {
                    state.last_updated_at = Local::now();
                }
            }
        }
        result
    }

    /// Upload that continues a previous partial upload when possible.
    /// Returns bytes sent, the offset resumed from and how it went.
    async fn resumable_upload(
        &self,
        session: &mut PooledSession,
        local_path: &Path,
        remote_path: &str,
        total: u64,
        append_supported: bool,
        progress: Option<ProgressCallback>,
    ) -> EngineResult<(u64, u64, TransferMethod)> {
        let key = continuation_key(session.identity(), remote_path);
        let previous = self.continuations.get(&key).map(|state| state.total_size);

        let resuming = match previous {
            Some(size) if size == total => true,
            Some(size) => {
                debug!(path = remote_path, was = size, now = total, "local file changed since last attempt");
                false
            }
            None => false,
        };
        if !resuming {
            self.begin_continuation(&key, total);
            let result = self
                .standard
                .upload_on(session, local_path, remote_path, total, progress)
                .await
                .map(|(bytes, method)| (bytes, 0, method));
            return self.settle(&key, result);
        }

        let remote_size = match session.size(remote_path).await {
            Ok(size) => Some(size),
            Err(e) => {
                debug!(path = remote_path, "no remote partial size: {:#}", e);
                None
            }
        };
        self.note_remote_size(&key, remote_size);
        let offset = remote_size.unwrap_or(0);

        if offset == 0 {
            let result = self
                .standard
                .upload_on(session, local_path, remote_path, total, progress)
                .await
                .map(|(bytes, method)| (bytes, 0, method));
            return self.settle(&key, result);
        }

        if offset < total && append_supported {
            match self
                .append_remaining(session, local_path, remote_path, offset, total, progress.clone())
                .await
            {
                Ok(bytes) => {
                    info!(path = remote_path, offset, bytes, "resumed upload with APPE");
                    return self.settle(&key, Ok((bytes, offset, TransferMethod::Resumed)));
                }
                Err(e) => warn!(path = remote_path, "append failed, re-sending in full: {}", e),
            }
        }

        let result = self
            .replace_partial(session, local_path, remote_path, total, progress)
            .await
            .map(|bytes| (bytes, 0, TransferMethod::Replaced));
        self.settle(&key, result)
    }

    /// Sends bytes `offset..total` with APPE and checks the remote size
    /// afterwards. Not retried: a second append from a stale offset would
    /// duplicate data.
    async fn append_remaining(
        &self,
        session: &mut PooledSession,
        local_path: &Path,
        remote_path: &str,
        offset: u64,
        total: u64,
        progress: Option<ProgressCallback>,
    ) -> EngineResult<u64> {
        let mut file = File::open(local_path)?;
        file.seek(SeekFrom::Start(offset))?;
        let reader = ProgressReader::resuming(
            BufReader::with_capacity(self.standard.config().buffer_size, file),
            offset,
            Some(total),
            progress,
        );

        let sent = session
            .upload_from(Box::new(reader), remote_path, true)
            .await
            .map_err(|e| EngineError::transfer(format!("append {}", remote_path), e))?;
        let now_remote = session
            .size(remote_path)
            .await
            .map_err(|e| EngineError::transfer(format!("size {}", remote_path), e))?;
        if now_remote != total {
            return Err(EngineError::transfer(
                format!("append {}", remote_path),
                anyhow!("remote holds {} of {} bytes after append", now_remote, total),
            ));
        }
        Ok(sent)
    }

    /// Full re-upload that keeps the stale partial recoverable: it is
    /// renamed aside first, deleted only once the new copy is stored, and
    /// renamed back if the upload fails.
    async fn replace_partial(
        &self,
        session: &mut PooledSession,
        local_path: &Path,
        remote_path: &str,
        total: u64,
        progress: Option<ProgressCallback>,
    ) -> EngineResult<u64> {
        let suffix = Uuid::new_v4().simple().to_string();
        let stale = format!("{}.stale-{}", remote_path, &suffix[..8]);
        let set_aside = match session.rename(remote_path, &stale).await {
            Ok(()) => {
                debug!(path = remote_path, stale = %stale, "set stale partial aside");
                true
            }
            Err(e) => {
                warn!(path = remote_path, "could not set partial aside, overwriting in place: {:#}", e);
                false
            }
        };

        match self
            .standard
            .upload_on(session, local_path, remote_path, total, progress)
            .await
        {
            Ok((bytes, _)) => {
                if set_aside {
                    if let Err(e) = session.remove(&stale).await {
                        warn!(stale = %stale, "could not remove stale partial: {:#}", e);
                    }
                }
                Ok(bytes)
            }
            Err(e) => {
                if set_aside {
                    let _ = session.remove(remote_path).await;
                    if let Err(restore) = session.rename(&stale, remote_path).await {
                        warn!(stale = %stale, "could not restore stale partial: {:#}", restore);
                    }
                }
                Err(e)
            }
        }
    }

    /// Download that continues from the local partial file and verifies
    /// the final size. Returns bytes fetched, the first offset and the
    /// expected size.
    async fn resumable_download(
        &self,
        session: &mut PooledSession,
        remote_path: &str,
        local_path: &Path,
        progress: Option<ProgressCallback>,
    ) -> EngineResult<(u64, u64, u64)> {
        let expected = session
            .size(remote_path)
            .await
            .map_err(|e| EngineError::transfer(format!("size {}", remote_path), e))?;
        if let Some(parent) = local_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let capacity = self.standard.config().buffer_size;
        let max_attempts = self.config.max_resume_attempts.max(1);
        let existing = local_len(local_path).await;
        let first_offset = if existing < expected { existing } else { 0 };
        let mut offset = first_offset;
        let mut attempts = 0;
        let mut last_error = None;

        loop {
            attempts += 1;
            let file = if offset > 0 {
                OpenOptions::new().append(true).open(local_path)?
            } else {
                File::create(local_path)?
            };
            let writer = ProgressWriter::new(
                BufWriter::with_capacity(capacity, file),
                offset,
                Some(expected),
                progress.clone(),
            );

            match session.download_to(Box::new(writer), remote_path, offset).await {
                Ok(_) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    let on_disk = local_len(local_path).await;
                    if attempts >= max_attempts || on_disk >= expected {
                        last_error = Some(e);
                        break;
                    }
                    warn!(
                        path = remote_path,
                        attempt = attempts,
                        offset = on_disk,
                        "download interrupted, resuming: {:#}",
                        e
                    );
                    self.standard.metrics().retry("download", "resume");
                    offset = on_disk;
                }
            }
        }

        let actual = local_len(local_path).await;
        if let Some(e) = last_error {
            if actual <= first_offset {
                // Nothing arrived at all; let the caller fall back.
                return Err(EngineError::transfer(format!("download {}", remote_path), e));
            }
            // Bytes written before a reported failure are never trusted,
            // whatever their count.
            warn!(path = remote_path, attempts, "giving up on resumable download: {:#}", e);
            return Err(EngineError::Integrity {
                path: remote_path.to_string(),
                expected,
                actual,
                interrupted: true,
            });
        }
        if actual != expected {
            return Err(EngineError::Integrity {
                path: remote_path.to_string(),
                expected,
                actual,
                interrupted: false,
            });
        }
        Ok((actual.saturating_sub(first_offset), first_offset, expected))
    }

    async fn upload_inner(
        &self,
        endpoint: &ServerEndpoint,
        local_path: &Path,
        remote_path: &str,
        progress: Option<ProgressCallback>,
        started: Instant,
        allow_compression: bool,
    ) -> EngineResult<TransferReport> {
        let total = tokio::fs::metadata(local_path).await?.len();
        if allow_compression && self.standard.compression_eligible(local_path, total) {
            // The payload is rewritten, so partial remote bytes never line up.
            return self
                .standard
                .upload_inner(endpoint, local_path, remote_path, progress, started, true)
                .await;
        }

        let mut session = self.standard.connect(endpoint).await?;
        let profile = self.profile(&mut session).await;
        let mode = session.transfer_mode();
        let report = |bytes, resumed_from, method| TransferReport {
            remote_path: remote_path.to_string(),
            local_path: local_path.to_path_buf(),
            bytes,
            total_size: total,
            resumed_from,
            duration_ms: elapsed_ms(started),
            method,
            mode,
        };

        if !self.gate(self.config.resumable_transfer, profile.as_ref(), Capability::Size) {
            let result = self
                .standard
                .upload_on(&mut session, local_path, remote_path, total, progress)
                .await;
            self.standard.finish(session, result.is_ok()).await;
            let (bytes, method) = result?;
            self.standard.invalidate_listings(&endpoint.identity());
            return Ok(report(bytes, 0, method));
        }

        let append_supported = profile.as_ref().map_or(false, |p| p.supports_append);
        let result = self
            .resumable_upload(
                &mut session,
                local_path,
                remote_path,
                total,
                append_supported,
                progress.clone(),
            )
            .await;

        match result {
            Ok((bytes, resumed_from, method)) => {
                self.standard.finish(session, true).await;
                self.standard.invalidate_listings(&endpoint.identity());
                Ok(report(bytes, resumed_from, method))
            }
            Err(e) if e.is_fatal() => {
                self.standard.finish(session, false).await;
                Err(e)
            }
            Err(e) => {
                warn!(path = remote_path, "resumable upload failed, using standard upload: {}", e);
                self.standard.finish(session, false).await;
                match self
                    .standard
                    .upload_inner(endpoint, local_path, remote_path, progress, started, allow_compression)
                    .await
                {
                    Ok(fallback) => {
                        self.continuations
                            .remove(&continuation_key(&endpoint.identity(), remote_path));
                        Ok(fallback)
                    }
                    Err(fallback_err) => {
                        warn!(path = remote_path, "standard upload failed too: {}", fallback_err);
                        Err(e)
                    }
                }
            }
        }
    }

    async fn download_inner(
        &self,
        endpoint: &ServerEndpoint,
        remote_path: &str,
        local_path: &Path,
        progress: Option<ProgressCallback>,
        started: Instant,
    ) -> EngineResult<TransferReport> {
        let mut session = self.standard.connect(endpoint).await?;
        let profile = self.profile(&mut session).await;
        let mode = session.transfer_mode();

        if !self.gate(self.config.resumable_transfer, profile.as_ref(), Capability::Resume) {
            let result = self
                .standard
                .download_on(&mut session, remote_path, local_path, progress)
                .await;
            self.standard.finish(session, result.is_ok()).await;
            let (bytes, method) = result?;
            return Ok(TransferReport {
                remote_path: remote_path.to_string(),
                local_path: local_path.to_path_buf(),
                bytes,
                total_size: bytes,
                resumed_from: 0,
                duration_ms: elapsed_ms(started),
                method,
                mode,
            });
        }

        match self
            .resumable_download(&mut session, remote_path, local_path, progress.clone())
            .await
        {
            Ok((bytes, resumed_from, total)) => {
                self.standard.finish(session, true).await;
                if resumed_from > 0 {
                    info!(path = remote_path, resumed_from, bytes, "resumed download");
                }
                Ok(TransferReport {
                    remote_path: remote_path.to_string(),
                    local_path: local_path.to_path_buf(),
                    bytes,
                    total_size: total,
                    resumed_from,
                    duration_ms: elapsed_ms(started),
                    method: if resumed_from > 0 {
                        TransferMethod::Resumed
                    } else {
                        TransferMethod::Streamed
                    },
                    mode,
                })
            }
            Err(e) if e.is_fatal() => {
                self.standard.finish(session, false).await;
                Err(e)
            }
            Err(e) => {
                warn!(path = remote_path, "resumable download failed, using standard download: {}", e);
                self.standard.finish(session, false).await;
                self.standard
                    .download_inner(endpoint, remote_path, local_path, progress, started)
                    .await
                    .map_err(|fallback_err| {
                        warn!(path = remote_path, "standard download failed too: {}", fallback_err);
                        e
                    })
            }
        }
    }

    fn forget_continuation(&self, endpoint: &ServerEndpoint, remote_path: &str) {
        self.continuations
            .remove(&continuation_key(&endpoint.identity(), remote_path));
    }
}

#[async_trait]
impl TransferStrategy for ExtendedOptimizer {
    fn name(&self) -> &'static str {
        "extended"
    }

    async fn connect(&self, endpoint: &ServerEndpoint) -> EngineResult<PooledSession> {
        self.standard.connect(endpoint).await
    }

    async fn release_session(&self, session: PooledSession) {
        self.standard.release_session(session).await;
    }

    async fn list_directory(
        &self,
        endpoint: &ServerEndpoint,
        path: &str,
    ) -> EngineResult<Vec<RemoteFile>> {
        let identity = endpoint.identity();
        if let Some(entries) = self.standard.cached_listing(&identity, path) {
            return Ok(entries);
        }

        let mut session = self.standard.connect(endpoint).await?;
        let profile = self.profile(&mut session).await;
        let result = if self.gate(self.config.enhanced_listing, profile.as_ref(), Capability::Mlsd) {
            match self.standard.list_on(&mut session, path, true).await {
                Ok(entries) => Ok(entries),
                Err(e) => {
                    warn!(path, "MLSD listing failed, falling back to LIST: {}", e);
                    self.standard
                        .list_on(&mut session, path, false)
                        .await
                        .map_err(|fallback_err| {
                            warn!(path, "LIST failed too: {}", fallback_err);
                            e
                        })
                }
            }
        } else {
            self.standard.list_on(&mut session, path, false).await
        };
        self.standard.finish(session, result.is_ok()).await;
        let entries = result?;

        self.standard.store_listing(&identity, path, &entries);
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
        self.standard.record_transfer("upload", started, &result);
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
        self.standard.record_transfer("download", started, &result);
        result
    }

    async fn delete_file(&self, endpoint: &ServerEndpoint, path: &str) -> EngineResult<()> {
        self.standard.delete_file(endpoint, path).await?;
        self.forget_continuation(endpoint, path);
        Ok(())
    }

    async fn rename(&self, endpoint: &ServerEndpoint, from: &str, to: &str) -> EngineResult<()> {
        self.standard.rename(endpoint, from, to).await?;
        self.forget_continuation(endpoint, from);
        Ok(())
    }

    async fn make_directory(&self, endpoint: &ServerEndpoint, path: &str) -> EngineResult<()> {
        self.standard.make_directory(endpoint, path).await
    }

    fn clear_cache(&self) {
        self.standard.clear_cache();
        self.detector.clear();
    }

    fn get_stats(&self) -> OptimizerStats {
        OptimizerStats {
            strategy: self.name(),
            capability_cache_entries: self.detector.cached_count(),
            pending_continuations: self.continuations.len(),
            ..self.standard.get_stats()
        }
    }

    async fn shutdown(&self) {
        self.standard.shutdown().await;
    }
}
