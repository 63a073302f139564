//! Passive/active mode selection from local network topology.

use crate::cache::TtlCache;
use crate::client::{FtpSession, TransferMode};
use crate::config::ModeConfig;
use crate::metrics::{CacheKind, MetricsSink};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const PROFILE_KEY: &str = "local";
const SIGNAL_COUNT: f64 = 3.0;
const MIN_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkProfile {
    pub behind_nat: bool,
    pub has_public_ip: bool,
    pub can_bind_port: bool,
    pub preferred_mode: TransferMode,
    /// Share of the three signals that completed without error.
    pub confidence: f64,
    pub detected_at: DateTime<Local>,
}

/// Source of local network facts. Swapped out in tests.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// Addresses of non-loopback interfaces.
    async fn local_addresses(&self) -> Result<Vec<IpAddr>>;
    /// Whether an ephemeral port can be bound for listening.
    async fn can_bind_port(&self, timeout: Duration) -> Result<bool>;
}

pub struct SystemNetworkProbe;

#[async_trait]
impl NetworkProbe for SystemNetworkProbe {
    async fn local_addresses(&self) -> Result<Vec<IpAddr>> {
        let interfaces = tokio::task::spawn_blocking(get_if_addrs::get_if_addrs)
            .await?
            .context("failed to enumerate network interfaces")?;
        Ok(interfaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .map(|iface| iface.ip())
            .collect())
    }

    async fn can_bind_port(&self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, TcpListener::bind(("0.0.0.0", 0))).await {
            Ok(Ok(listener)) => {
                debug!("bind probe succeeded on {:?}", listener.local_addr().ok());
                Ok(true)
            }
            Ok(Err(e)) => {
                debug!("bind probe failed: {}", e);
                Ok(false)
            }
            Err(_) => Err(anyhow!("bind probe timed out after {:?}", timeout)),
        }
    }
}

/// Private IPv4 ranges, including link-local.
pub fn is_private_v4(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(_) => false,
    }
}

/// Applies the selection rule to gathered signals.
fn preferred_mode(behind_nat: bool, has_public_ip: bool, can_bind: bool, confidence: f64) -> TransferMode {
    if confidence < MIN_CONFIDENCE || behind_nat || !can_bind {
        return TransferMode::Passive;
    }
    if has_public_ip {
        TransferMode::Active
    } else {
        TransferMode::Passive
    }
}

pub struct TransferModeSelector {
    config: ModeConfig,
    probe: Arc<dyn NetworkProbe>,
    cache: TtlCache<&'static str, NetworkProfile>,
    metrics: Arc<dyn MetricsSink>,
}

impl TransferModeSelector {
    pub fn new(config: ModeConfig, probe: Arc<dyn NetworkProbe>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            cache: TtlCache::new(config.cache_ttl),
            config,
            probe,
            metrics,
        }
    }

    pub fn with_system_probe(config: ModeConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self::new(config, Arc::new(SystemNetworkProbe), metrics)
    }

    /// Recommended data-channel mode. A configured mode always wins.
    pub async fn select(&self, host: Option<&str>) -> TransferMode {
        if let Some(mode) = self.config.forced_mode {
            debug!(host, %mode, "using configured transfer mode");
            return mode;
        }
        let profile = self.network_profile().await;
        debug!(
            host,
            mode = %profile.preferred_mode,
            confidence = profile.confidence,
            "selected transfer mode"
        );
        profile.preferred_mode
    }

    /// Cached network profile, rebuilt once its TTL lapses.
    pub async fn network_profile(&self) -> NetworkProfile {
        if let Some(profile) = self.cache.get(&PROFILE_KEY) {
            self.metrics.cache_hit(CacheKind::Network);
            return profile;
        }
        self.metrics.cache_miss(CacheKind::Network);

        let profile = self.build_profile().await;
        info!(
            behind_nat = profile.behind_nat,
            has_public_ip = profile.has_public_ip,
            can_bind_port = profile.can_bind_port,
            confidence = profile.confidence,
            "network profile: prefer {} mode",
            profile.preferred_mode
        );
        self.cache.insert(PROFILE_KEY, profile.clone());
        profile
    }

    pub fn invalidate(&self) {
        if self.cache.invalidate(&PROFILE_KEY) {
            self.metrics.cache_eviction(CacheKind::Network, 1);
        }
    }

    async fn build_profile(&self) -> NetworkProfile {
        let nat = async {
            let addrs = self.probe.local_addresses().await?;
            Ok::<_, anyhow::Error>(addrs.iter().any(is_private_v4))
        };
        let public = async {
            let addrs = self.probe.local_addresses().await?;
            Ok::<_, anyhow::Error>(!addrs.iter().any(is_private_v4))
        };
        let bind = self.probe.can_bind_port(self.config.bind_probe_timeout);
        let (nat, public, bind) = tokio::join!(nat, public, bind);

        let completed = [nat.is_ok(), public.is_ok(), bind.is_ok()]
            .iter()
            .filter(|ok| **ok)
            .count();
        let confidence = completed as f64 / SIGNAL_COUNT;

        let behind_nat = signal_or_default("nat detection", nat);
        let has_public_ip = signal_or_default("public address inference", public);
        let can_bind_port = signal_or_default("port bind", bind);

        NetworkProfile {
            behind_nat,
            has_public_ip,
            can_bind_port,
            preferred_mode: preferred_mode(behind_nat, has_public_ip, can_bind_port, confidence),
            confidence,
            detected_at: Local::now(),
        }
    }

    /// Whether `mode` works on `session`. Active mode is never reported
    /// usable; passive mode is confirmed with a listing of the current
    /// directory.
    pub async fn test_mode(&self, session: &mut dyn FtpSession, mode: TransferMode) -> bool {
        match mode {
            TransferMode::Active => {
                debug!("active mode is not available from this client");
                false
            }
            TransferMode::Passive => {
                if let Err(e) = session.set_transfer_mode(TransferMode::Passive).await {
                    warn!("could not switch to passive mode: {:#}", e);
                    return false;
                }
                match session.list(".").await {
                    Ok(_) => true,
                    Err(e) => {
                        warn!("passive listing failed: {:#}", e);
                        false
                    }
                }
            }
        }
    }
}

fn signal_or_default(name: &str, signal: Result<bool>) -> bool {
    signal.unwrap_or_else(|e| {
        warn!("{} failed, assuming the conservative answer: {:#}", name, e);
        false
    })
}
