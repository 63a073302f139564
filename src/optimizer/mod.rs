//! Transfer strategies.
//!
//! [`StandardOptimizer`] works against any server. [`ExtendedOptimizer`]
//! layers capability-gated behavior (resume, MLSD listings) over a standard
//! optimizer and falls back to it whenever the optimized path is unavailable
//! or fails. [`StrategyPolicy`] picks one from configuration.

pub mod extended;
pub mod standard;

pub use extended::{ExtendedOptimizer, ResumableTransferState};
pub use standard::StandardOptimizer;

use crate::client::{Connector, RemoteFile, ServerEndpoint, TransferMode};
use crate::config::{EngineConfig, FeatureToggle};
use crate::error::EngineResult;
use crate::metrics::{MetricsSink, MetricsSnapshot};
use crate::mode::{NetworkProbe, SystemNetworkProbe};
use crate::pool::{PoolStatsSnapshot, PooledSession};
use crate::progress::ProgressCallback;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// How a transfer was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMethod {
    /// Whole payload held in memory and sent in one call.
    SingleShot,
    /// Piped through a buffered stream with progress reporting.
    Streamed,
    /// Gzipped on the client before upload.
    Compressed,
    /// Continued from a byte offset (REST for downloads, APPE for uploads).
    Resumed,
    /// A stale remote partial was set aside and the file sent again in full.
    Replaced,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub remote_path: String,
    pub local_path: PathBuf,
    /// Bytes moved by this call.
    pub bytes: u64,
    /// Size of the finished file.
    pub total_size: u64,
    pub resumed_from: u64,
    pub duration_ms: u64,
    pub method: TransferMethod,
    pub mode: Option<TransferMode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizerStats {
    pub strategy: &'static str,
    pub pool: Vec<PoolStatsSnapshot>,
    pub listing_cache_entries: usize,
    pub capability_cache_entries: usize,
    pub pending_continuations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
}

/// The operations every strategy offers.
#[async_trait]
pub trait TransferStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Checks out a session with the transfer mode applied.
    async fn connect(&self, endpoint: &ServerEndpoint) -> EngineResult<PooledSession>;

    async fn release_session(&self, session: PooledSession);

    async fn list_directory(
        &self,
        endpoint: &ServerEndpoint,
        path: &str,
    ) -> EngineResult<Vec<RemoteFile>>;

    async fn upload_file(
        &self,
        endpoint: &ServerEndpoint,
        local_path: &Path,
        remote_path: &str,
        progress: Option<ProgressCallback>,
    ) -> EngineResult<TransferReport>;

    async fn download_file(
        &self,
        endpoint: &ServerEndpoint,
        remote_path: &str,
        local_path: &Path,
        progress: Option<ProgressCallback>,
    ) -> EngineResult<TransferReport>;

    async fn delete_file(&self, endpoint: &ServerEndpoint, path: &str) -> EngineResult<()>;

    async fn rename(&self, endpoint: &ServerEndpoint, from: &str, to: &str) -> EngineResult<()>;

    async fn make_directory(&self, endpoint: &ServerEndpoint, path: &str) -> EngineResult<()>;

    fn clear_cache(&self);

    fn get_stats(&self) -> OptimizerStats;

    async fn shutdown(&self);
}

/// Chooses between the standard and the capability-gated strategy.
pub struct StrategyPolicy;

impl StrategyPolicy {
    /// Whether any capability-gated feature can take effect under `config`.
    pub fn wants_extended(config: &EngineConfig) -> bool {
        let extended = &config.extended;
        [
            extended.resumable_transfer,
            extended.enhanced_listing,
            extended.compression_transfer,
        ]
        .iter()
        .any(|toggle| match toggle {
            FeatureToggle::Enabled => true,
            FeatureToggle::Auto => extended.auto_capability_detection,
            FeatureToggle::Disabled => false,
        })
    }

    /// Builds the strategy for `config` over an existing standard optimizer.
    pub fn select_with(
        config: &EngineConfig,
        standard: Arc<StandardOptimizer>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<dyn TransferStrategy> {
        if Self::wants_extended(config) {
            info!("using capability-gated transfer strategy");
            Arc::new(ExtendedOptimizer::new(
                config.extended.clone(),
                config.detection.clone(),
                standard,
                metrics,
            ))
        } else {
            info!("using standard transfer strategy");
            standard
        }
    }

    pub fn select_with_probe(
        config: &EngineConfig,
        connector: Arc<dyn Connector>,
        probe: Arc<dyn NetworkProbe>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<dyn TransferStrategy> {
        let standard = Arc::new(StandardOptimizer::from_config(
            config,
            connector,
            probe,
            metrics.clone(),
        ));
        Self::select_with(config, standard, metrics)
    }

    pub fn select(
        config: &EngineConfig,
        connector: Arc<dyn Connector>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<dyn TransferStrategy> {
        Self::select_with_probe(config, connector, Arc::new(SystemNetworkProbe), metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults_to_extended() {
        assert!(StrategyPolicy::wants_extended(&EngineConfig::default()));
    }

    #[test]
    fn test_policy_standard_when_features_off() {
        let mut config = EngineConfig::default();
        config.extended.resumable_transfer = FeatureToggle::Disabled;
        config.extended.enhanced_listing = FeatureToggle::Disabled;
        config.extended.compression_transfer = FeatureToggle::Disabled;
        assert!(!StrategyPolicy::wants_extended(&config));

        config.extended.enhanced_listing = FeatureToggle::Enabled;
        assert!(StrategyPolicy::wants_extended(&config));
    }

    #[test]
    fn test_policy_auto_needs_detection() {
        let mut config = EngineConfig::default();
        config.extended.auto_capability_detection = false;
        assert!(!StrategyPolicy::wants_extended(&config));
    }
}
