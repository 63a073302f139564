//! Server capability detection with a reliability score.
//!
//! A FEAT reply is authoritative and yields a profile with reliability of at
//! least 0.8. Without one, each capability is probed with its own command and
//! the reliability reflects how many probes gave a clear answer. Anything
//! inconclusive resolves to unsupported.

use crate::cache::TtlCache;
use crate::client::{CommandReply, FtpSession};
use crate::config::DetectionConfig;
use crate::metrics::{CacheKind, MetricsSink};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

const FEATURE_RELIABILITY_FLOOR: f64 = 0.8;
const PROBE_RELIABILITY_SCALE: f64 = 0.5;
const DEFAULT_MAX_CONNECTIONS: u32 = 2;
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
const FAST_BUFFER_SIZE: usize = 256 * 1024;
const PERF_SAMPLES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Passive,
    ExtendedPassive,
    Resume,
    Size,
    Mdtm,
    ModeZ,
    Mlsd,
    Site,
    Utf8,
    Append,
}

impl Capability {
    pub const ALL: [Self; 10] = [
        Self::Passive,
        Self::ExtendedPassive,
        Self::Resume,
        Self::Size,
        Self::Mdtm,
        Self::ModeZ,
        Self::Mlsd,
        Self::Site,
        Self::Utf8,
        Self::Append,
    ];

    /// Whether a normalized (upper-cased, trimmed) FEAT line advertises this
    /// capability.
    fn advertised_by(self, feature: &str) -> bool {
        let word = feature.split_whitespace().next().unwrap_or("");
        match self {
            Self::Passive => word == "PASV" || word == "EPSV",
            Self::ExtendedPassive => word == "EPSV",
            Self::Resume => word == "REST",
            Self::Size => word == "SIZE",
            Self::Mdtm => word == "MDTM",
            Self::ModeZ => feature.starts_with("MODE Z"),
            Self::Mlsd => word == "MLST" || word == "MLSD",
            Self::Site => word == "SITE",
            Self::Utf8 => word == "UTF8",
            Self::Append => word == "APPE",
        }
    }

    /// Command used to probe for the capability, if it can be probed
    /// without touching remote files.
    const fn probe_command(self) -> Option<&'static str> {
        match self {
            Self::Passive => Some("PASV"),
            Self::ExtendedPassive => Some("EPSV"),
            Self::Resume => Some("REST 0"),
            Self::Size => Some("SIZE /"),
            Self::Mdtm => Some("MDTM /"),
            Self::ModeZ => Some("MODE Z"),
            Self::Mlsd => Some("MLST /"),
            Self::Site => Some("SITE HELP"),
            Self::Utf8 => Some("OPTS UTF8 ON"),
            Self::Append => None,
        }
    }
}

/// How a profile was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    FeatureList,
    Probing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilityProfile {
    pub identity: String,
    pub supports_passive: bool,
    pub supports_epsv: bool,
    pub supports_rest: bool,
    pub supports_size: bool,
    pub supports_mdtm: bool,
    pub supports_mode_z: bool,
    pub supports_mlsd: bool,
    pub supports_site: bool,
    pub supports_utf8: bool,
    pub supports_append: bool,
    pub max_connections: u32,
    pub transfer_buffer_size: usize,
    pub command_response_ms: Option<u64>,
    pub server_software: Option<String>,
    pub server_features: Vec<String>,
    pub protocol_version: String,
    pub source: DetectionSource,
    detection_reliability: f64,
    pub detected_at: DateTime<Local>,
}

impl ServerCapabilityProfile {
    fn empty(identity: &str, source: DetectionSource) -> Self {
        Self {
            identity: identity.to_string(),
            supports_passive: false,
            supports_epsv: false,
            supports_rest: false,
            supports_size: false,
            supports_mdtm: false,
            supports_mode_z: false,
            supports_mlsd: false,
            supports_site: false,
            supports_utf8: false,
            supports_append: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            transfer_buffer_size: DEFAULT_BUFFER_SIZE,
            command_response_ms: None,
            server_software: None,
            server_features: Vec::new(),
            protocol_version: "FTP".to_string(),
            source,
            detection_reliability: 0.0,
            detected_at: Local::now(),
        }
    }

    pub const fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Passive => self.supports_passive,
            Capability::ExtendedPassive => self.supports_epsv,
            Capability::Resume => self.supports_rest,
            Capability::Size => self.supports_size,
            Capability::Mdtm => self.supports_mdtm,
            Capability::ModeZ => self.supports_mode_z,
            Capability::Mlsd => self.supports_mlsd,
            Capability::Site => self.supports_site,
            Capability::Utf8 => self.supports_utf8,
            Capability::Append => self.supports_append,
        }
    }

    fn set(&mut self, capability: Capability, value: bool) {
        let flag = match capability {
            Capability::Passive => &mut self.supports_passive,
            Capability::ExtendedPassive => &mut self.supports_epsv,
            Capability::Resume => &mut self.supports_rest,
            Capability::Size => &mut self.supports_size,
            Capability::Mdtm => &mut self.supports_mdtm,
            Capability::ModeZ => &mut self.supports_mode_z,
            Capability::Mlsd => &mut self.supports_mlsd,
            Capability::Site => &mut self.supports_site,
            Capability::Utf8 => &mut self.supports_utf8,
            Capability::Append => &mut self.supports_append,
        };
        *flag = value;
    }

    pub const fn reliability(&self) -> f64 {
        self.detection_reliability
    }

    pub fn is_reliable(&self, min_reliability: f64) -> bool {
        self.detection_reliability >= min_reliability
    }

    fn positive_count(&self) -> usize {
        Capability::ALL
            .iter()
            .filter(|capability| self.supports(**capability))
            .count()
    }
}

/// Outcome of probing one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    Supported,
    Unsupported,
    Inconclusive,
}

/// Extracts advertised features from a FEAT reply, dropping the numbered
/// framing lines.
pub fn parse_feature_lines(message: &str) -> Vec<String> {
    message
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !is_reply_framing(line))
        .map(str::to_ascii_uppercase)
        .collect()
}

fn is_reply_framing(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 3
        && bytes[..3].iter().all(u8::is_ascii_digit)
        && matches!(bytes.get(3), None | Some(b' ' | b'-'))
}

pub struct CapabilityDetector {
    config: DetectionConfig,
    cache: TtlCache<String, ServerCapabilityProfile>,
    metrics: Arc<dyn MetricsSink>,
}

impl CapabilityDetector {
    pub fn new(config: DetectionConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            cache: TtlCache::new(config.cache_ttl),
            config,
            metrics,
        }
    }

    /// Returns the cached profile for `identity`, or detects one over
    /// `session`. Never fails: detection problems degrade into an
    /// all-unsupported profile.
    pub async fn detect(
        &self,
        session: &mut dyn FtpSession,
        identity: &str,
    ) -> ServerCapabilityProfile {
        let key = identity.to_string();
        if let Some(profile) = self.cache.get(&key) {
            self.metrics.cache_hit(CacheKind::Capability);
            return profile;
        }
        self.metrics.cache_miss(CacheKind::Capability);

        let mut profile = match self.query_features(session).await {
            Some(features) => from_features(identity, features),
            None => {
                debug!(identity, "no usable FEAT reply, probing commands individually");
                self.probe_commands(session, identity).await
            }
        };
        profile.server_software = self.query_system(session).await;
        if self.config.performance_probing {
            self.probe_performance(session, &mut profile).await;
        }

        info!(
            identity,
            source = ?profile.source,
            reliability = profile.detection_reliability,
            rest = profile.supports_rest,
            mlsd = profile.supports_mlsd,
            append = profile.supports_append,
            "capability profile detected"
        );
        self.cache.insert(key, profile.clone());
        profile
    }

    /// Drops any cached profile and detects again.
    pub async fn refresh(
        &self,
        session: &mut dyn FtpSession,
        identity: &str,
    ) -> ServerCapabilityProfile {
        self.invalidate(identity);
        self.detect(session, identity).await
    }

    pub fn cached(&self, identity: &str) -> Option<ServerCapabilityProfile> {
        self.cache.get(&identity.to_string())
    }

    pub fn invalidate(&self, identity: &str) {
        if self.cache.invalidate(&identity.to_string()) {
            self.metrics.cache_eviction(CacheKind::Capability, 1);
        }
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    pub fn clear(&self) {
        let evicted = self.cache.len();
        self.cache.clear();
        if evicted > 0 {
            self.metrics.cache_eviction(CacheKind::Capability, evicted);
        }
    }

    async fn command(&self, session: &mut dyn FtpSession, command: &str) -> Option<CommandReply> {
        match time::timeout(self.config.probe_timeout, session.send_command(command)).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(e)) => {
                debug!(command, "probe failed: {:#}", e);
                None
            }
            Err(_) => {
                debug!(command, "probe timed out");
                None
            }
        }
    }

    async fn query_features(&self, session: &mut dyn FtpSession) -> Option<Vec<String>> {
        let reply = self.command(session, "FEAT").await?;
        if !reply.is_success() {
            return None;
        }
        let features = parse_feature_lines(&reply.message);
        (!features.is_empty()).then_some(features)
    }

    async fn query_system(&self, session: &mut dyn FtpSession) -> Option<String> {
        let reply = self.command(session, "SYST").await?;
        if reply.code != 215 {
            return None;
        }
        let software = reply
            .message
            .trim()
            .trim_start_matches("215")
            .trim()
            .to_string();
        (!software.is_empty()).then_some(software)
    }

    async fn probe(&self, session: &mut dyn FtpSession, command: &str) -> ProbeOutcome {
        match self.command(session, command).await {
            Some(reply) if reply.is_success() => ProbeOutcome::Supported,
            Some(reply) if reply.is_rejection() => ProbeOutcome::Unsupported,
            _ => ProbeOutcome::Inconclusive,
        }
    }

    async fn probe_commands(
        &self,
        session: &mut dyn FtpSession,
        identity: &str,
    ) -> ServerCapabilityProfile {
        let mut profile = ServerCapabilityProfile::empty(identity, DetectionSource::Probing);
        let mut conclusive = 0_usize;

        for capability in Capability::ALL {
            let outcome = match capability.probe_command() {
                Some(command) => self.probe(session, command).await,
                None => ProbeOutcome::Inconclusive,
            };
            if outcome != ProbeOutcome::Inconclusive {
                conclusive += 1;
            }
            profile.set(capability, outcome == ProbeOutcome::Supported);

            if capability == Capability::ModeZ && outcome == ProbeOutcome::Supported {
                // Leave the session in stream mode.
                if self.probe(session, "MODE S").await != ProbeOutcome::Supported {
                    warn!(identity, "server accepted MODE Z but not MODE S");
                }
            }
        }

        profile.detection_reliability = (PROBE_RELIABILITY_SCALE * conclusive as f64
            / Capability::ALL.len() as f64)
            .clamp(0.0, 1.0);
        profile
    }

    async fn probe_performance(
        &self,
        session: &mut dyn FtpSession,
        profile: &mut ServerCapabilityProfile,
    ) {
        let mut total = Duration::ZERO;
        for _ in 0..PERF_SAMPLES {
            let started = Instant::now();
            if self.command(session, "NOOP").await.is_none() {
                debug!(identity = %profile.identity, "performance probe failed, keeping defaults");
                return;
            }
            total += started.elapsed();
        }

        let average = total / PERF_SAMPLES;
        profile.command_response_ms = Some(u64::try_from(average.as_millis()).unwrap_or(u64::MAX));
        if average > Duration::from_secs(1) {
            profile.max_connections = 1;
        } else if average < Duration::from_millis(200) {
            profile.max_connections = 4;
            profile.transfer_buffer_size = FAST_BUFFER_SIZE;
        }
    }
}

fn from_features(identity: &str, features: Vec<String>) -> ServerCapabilityProfile {
    let mut profile = ServerCapabilityProfile::empty(identity, DetectionSource::FeatureList);
    for capability in Capability::ALL {
        let advertised = features.iter().any(|f| capability.advertised_by(f));
        profile.set(capability, advertised);
    }
    let positives = profile.positive_count() as f64;
    profile.detection_reliability = (FEATURE_RELIABILITY_FLOOR
        + (1.0 - FEATURE_RELIABILITY_FLOOR) * positives / Capability::ALL.len() as f64)
        .clamp(0.0, 1.0);
    profile.server_features = features;
    profile
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{RemoteFile, TransferMode};
    use crate::metrics::InMemoryMetrics;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use mockall::mock;
    use mockall::predicate::eq;
    use std::io::{Read, Write};

    mock! {
        Session {}

        #[async_trait]
        impl FtpSession for Session {
            async fn send_command(&mut self, command: &str) -> Result<CommandReply>;
            async fn list(&mut self, path: &str) -> Result<Vec<RemoteFile>>;
            async fn machine_list(&mut self, path: &str) -> Result<Vec<RemoteFile>>;
            async fn upload_from(&mut self, source: Box<dyn Read + Send>, remote_path: &str, append: bool) -> Result<u64>;
            async fn download_to(&mut self, sink: Box<dyn Write + Send>, remote_path: &str, offset: u64) -> Result<u64>;
            async fn remove(&mut self, path: &str) -> Result<()>;
            async fn rename(&mut self, from: &str, to: &str) -> Result<()>;
            async fn make_directory(&mut self, path: &str) -> Result<()>;
            async fn set_transfer_mode(&mut self, mode: TransferMode) -> Result<()>;
            async fn close(&mut self) -> Result<()>;
        }
    }

    fn detector() -> CapabilityDetector {
        CapabilityDetector::new(DetectionConfig::default(), Arc::new(InMemoryMetrics::new()))
    }

    #[test]
    fn test_parse_feature_lines() {
        let reply = "211-Features:\r\n SIZE\r\n MDTM\r\n REST STREAM\r\n MLST type*;size*;\r\n211 End";
        assert_eq!(
            parse_feature_lines(reply),
            vec!["SIZE", "MDTM", "REST STREAM", "MLST TYPE*;SIZE*;"]
        );
        assert!(parse_feature_lines("211 End").is_empty());
    }

    #[tokio::test]
    async fn test_feature_list_profile() {
        let mut session = MockSession::new();
        session
            .expect_send_command()
            .with(eq("FEAT"))
            .times(1)
            .returning(|_| Ok(CommandReply::new(211, "211-Features:\n SIZE\n MDTM\n REST STREAM\n211 End")));
        session
            .expect_send_command()
            .with(eq("SYST"))
            .returning(|_| Ok(CommandReply::new(215, "UNIX Type: L8")));

        let profile = detector().detect(&mut session, "ftp://u@h:21").await;
        assert!(profile.supports_size);
        assert!(profile.supports_mdtm);
        assert!(profile.supports_rest);
        assert!(!profile.supports_mlsd);
        assert!(!profile.supports_mode_z);
        assert!(profile.reliability() >= 0.8);
        assert_eq!(profile.source, DetectionSource::FeatureList);
        assert_eq!(profile.server_software.as_deref(), Some("UNIX Type: L8"));
    }

    #[tokio::test]
    async fn test_profile_is_cached_per_identity() {
        let mut session = MockSession::new();
        session
            .expect_send_command()
            .with(eq("FEAT"))
            .times(1)
            .returning(|_| Ok(CommandReply::new(211, "211-Features:\n MLSD\n211 End")));
        session
            .expect_send_command()
            .with(eq("SYST"))
            .times(1)
            .returning(|_| Ok(CommandReply::new(502, "SYST not implemented")));

        let detector = detector();
        let first = detector.detect(&mut session, "ftp://u@h:21").await;
        let second = detector.detect(&mut session, "ftp://u@h:21").await;
        assert_eq!(first, second);
        assert!(second.supports_mlsd);
        assert!(second.server_software.is_none());
    }

    #[tokio::test]
    async fn test_probing_when_feat_missing() {
        let mut session = MockSession::new();
        session
            .expect_send_command()
            .returning(|command| match command {
                "FEAT" => Ok(CommandReply::new(502, "Command not implemented")),
                "PASV" => Ok(CommandReply::new(227, "Entering Passive Mode (10,0,0,1,4,1)")),
                "REST 0" => Ok(CommandReply::new(350, "Restarting at 0")),
                "SIZE /" => Ok(CommandReply::new(550, "Not a plain file")),
                "MODE Z" => Ok(CommandReply::new(504, "Unsupported mode")),
                "SYST" => Ok(CommandReply::new(215, "UNIX")),
                _ => Err(anyhow!("connection reset")),
            });

        let profile = detector().detect(&mut session, "ftp://u@h:21").await;
        assert_eq!(profile.source, DetectionSource::Probing);
        assert!(profile.supports_passive);
        assert!(profile.supports_rest);
        assert!(!profile.supports_size);
        assert!(!profile.supports_mode_z);
        // Inconclusive probes resolve to unsupported.
        assert!(!profile.supports_epsv);
        assert!(!profile.supports_append);
        // 4 of 10 probes were conclusive.
        assert!((profile.reliability() - 0.2).abs() < 1e-9);
        assert!(profile.reliability() < 0.8);
    }

    #[tokio::test]
    async fn test_all_probes_inconclusive() {
        let mut session = MockSession::new();
        session
            .expect_send_command()
            .returning(|_| Err(anyhow!("control connection closed")));

        let profile = detector().detect(&mut session, "ftp://u@h:21").await;
        assert_eq!(profile.reliability(), 0.0);
        for capability in Capability::ALL {
            assert!(!profile.supports(capability), "{:?} should be off", capability);
        }
    }

    #[tokio::test]
    async fn test_mode_z_probe_restores_stream_mode() {
        let mut session = MockSession::new();
        session
            .expect_send_command()
            .with(eq("MODE S"))
            .times(1)
            .returning(|_| Ok(CommandReply::new(200, "Mode S ok")));
        session.expect_send_command().returning(|command| match command {
            "MODE Z" => Ok(CommandReply::new(200, "Mode Z ok")),
            _ => Ok(CommandReply::new(500, "Unknown command")),
        });

        let profile = detector().detect(&mut session, "ftp://u@h:21").await;
        assert!(profile.supports_mode_z);
    }

    #[tokio::test]
    async fn test_performance_probing_sets_limits() {
        let config = DetectionConfig {
            performance_probing: true,
            ..DetectionConfig::default()
        };
        let detector = CapabilityDetector::new(config, Arc::new(InMemoryMetrics::new()));
        let mut session = MockSession::new();
        session.expect_send_command().returning(|command| match command {
            "FEAT" => Ok(CommandReply::new(211, "211-Features:\n EPSV\n211 End")),
            "NOOP" => Ok(CommandReply::new(200, "NOOP ok")),
            _ => Ok(CommandReply::new(500, "Unknown command")),
        });

        let profile = detector.detect(&mut session, "ftp://u@h:21").await;
        assert!(profile.supports_passive);
        assert_eq!(profile.max_connections, 4);
        assert_eq!(profile.transfer_buffer_size, FAST_BUFFER_SIZE);
        assert!(profile.command_response_ms.is_some());
    }

    #[tokio::test]
    async fn test_refresh_bypasses_cache() {
        let mut session = MockSession::new();
        session
            .expect_send_command()
            .with(eq("FEAT"))
            .times(2)
            .returning(|_| Ok(CommandReply::new(211, "211-Features:\n SIZE\n211 End")));
        session
            .expect_send_command()
            .with(eq("SYST"))
            .returning(|_| Ok(CommandReply::new(215, "UNIX")));

        let detector = detector();
        detector.detect(&mut session, "ftp://u@h:21").await;
        detector.refresh(&mut session, "ftp://u@h:21").await;
        assert!(detector.cached("ftp://u@h:21").is_some());
    }
}
