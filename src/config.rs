use crate::client::{ServerEndpoint, TransferMode, DEFAULT_FTP_PORT};
use crate::error::{EngineError, EngineResult};
use anyhow::Result;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Durations are stored as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_ip: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub configured: bool,
    pub engine: EngineConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_ip: String::new(),
            port: DEFAULT_FTP_PORT,
            username: String::new(),
            password: None,
            configured: false,
            engine: EngineConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Three-state switch for capability-gated features: force on, force off,
/// or trust what detection found. Serialized as `true`, `false` or `"auto"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "ToggleRepr", into = "ToggleRepr")]
pub enum FeatureToggle {
    Enabled,
    Disabled,
    #[default]
    Auto,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ToggleRepr {
    Flag(bool),
    Word(String),
}

impl TryFrom<ToggleRepr> for FeatureToggle {
    type Error = String;

    fn try_from(repr: ToggleRepr) -> Result<Self, Self::Error> {
        match repr {
            ToggleRepr::Flag(true) => Ok(Self::Enabled),
            ToggleRepr::Flag(false) => Ok(Self::Disabled),
            ToggleRepr::Word(word) => match word.to_ascii_lowercase().as_str() {
                "auto" => Ok(Self::Auto),
                "true" | "on" => Ok(Self::Enabled),
                "false" | "off" => Ok(Self::Disabled),
                other => Err(format!("expected true, false or \"auto\", got \"{}\"", other)),
            },
        }
    }
}

impl From<FeatureToggle> for ToggleRepr {
    fn from(toggle: FeatureToggle) -> Self {
        match toggle {
            FeatureToggle::Enabled => Self::Flag(true),
            FeatureToggle::Disabled => Self::Flag(false),
            FeatureToggle::Auto => Self::Word("auto".to_string()),
        }
    }
}

impl FeatureToggle {
    /// Effective state given what detection reported and whether the
    /// detection itself is trustworthy.
    pub const fn resolve(self, detected: bool, reliable: bool) -> bool {
        match self {
            Self::Enabled => true,
            Self::Disabled => false,
            Self::Auto => detected && reliable,
        }
    }
}

/// Hand-tuned adaptive-scaling thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingThresholds {
    /// Scale up when more than this many requests are queued.
    pub queue_length: usize,
    /// Scale up when the average queue wait exceeds this share of `max_queue_wait_time`.
    pub scale_up_wait_ratio: f64,
    /// Scale down only while the average queue wait is below this share.
    pub scale_down_wait_ratio: f64,
    /// Scale down only while the error rate is below this share of `target_error_rate`.
    pub scale_down_error_ratio: f64,
}

impl Default for ScalingThresholds {
    fn default() -> Self {
        Self {
            queue_length: 2,
            scale_up_wait_ratio: 0.5,
            scale_down_wait_ratio: 0.2,
            scale_down_error_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub min_connections: usize,
    #[serde(with = "duration_ms", rename = "max_idle_time_ms")]
    pub max_idle_time: Duration,
    #[serde(with = "duration_ms", rename = "connection_timeout_ms")]
    pub connection_timeout: Duration,
    pub enable_adaptive_scaling: bool,
    /// Queue requests when saturated instead of failing them.
    pub adaptive_queueing: bool,
    #[serde(with = "duration_ms", rename = "max_queue_wait_time_ms")]
    pub max_queue_wait_time: Duration,
    pub target_error_rate: f64,
    #[serde(with = "duration_ms", rename = "scaling_check_interval_ms")]
    pub scaling_check_interval: Duration,
    #[serde(with = "duration_ms", rename = "idle_sweep_interval_ms")]
    pub idle_sweep_interval: Duration,
    /// Probe idle sessions with NOOP before handing them out.
    pub health_check: bool,
    pub queue_history_size: usize,
    pub thresholds: ScalingThresholds,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            max_idle_time: Duration::from_secs(300),
            connection_timeout: Duration::from_secs(30),
            enable_adaptive_scaling: true,
            adaptive_queueing: true,
            max_queue_wait_time: Duration::from_secs(30),
            target_error_rate: 0.05,
            scaling_check_interval: Duration::from_secs(60),
            idle_sweep_interval: Duration::from_secs(60),
            health_check: true,
            queue_history_size: 100,
            thresholds: ScalingThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub connection_reuse: bool,
    pub stream_processing: bool,
    pub local_cache: bool,
    /// Gzips eligible uploads before sending. This changes the bytes stored
    /// on the server and adds a `.gz` suffix; it is never enabled implicitly.
    pub client_compression: bool,
    pub intelligent_retry: bool,
    pub transfer_mode_optimization: bool,
    /// Payloads above this size go through the streaming pipeline.
    pub buffer_size: usize,
    /// Upper bound for anything held fully in memory (single-shot
    /// transfers, client-side compression).
    pub max_memory_usage: u64,
    #[serde(with = "duration_ms", rename = "listing_cache_ttl_ms")]
    pub listing_cache_ttl: Duration,
    pub compression_min_size: u64,
    pub compression_extensions: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            connection_reuse: true,
            stream_processing: true,
            local_cache: true,
            client_compression: false,
            intelligent_retry: true,
            transfer_mode_optimization: true,
            buffer_size: 64 * 1024,
            max_memory_usage: 64 * 1024 * 1024,
            listing_cache_ttl: Duration::from_secs(30),
            compression_min_size: 1024,
            compression_extensions: ["txt", "log", "csv", "json", "xml", "html", "css", "js", "md"]
                .iter()
                .map(|ext| (*ext).to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtendedConfig {
    pub resumable_transfer: FeatureToggle,
    /// Always redirected to the resumable upload path.
    pub compression_transfer: FeatureToggle,
    pub enhanced_listing: FeatureToggle,
    pub auto_capability_detection: bool,
    /// Profiles below this reliability are not trusted in `auto` mode.
    pub min_reliability: f64,
    pub max_resume_attempts: u32,
}

impl Default for ExtendedConfig {
    fn default() -> Self {
        Self {
            resumable_transfer: FeatureToggle::Auto,
            compression_transfer: FeatureToggle::Auto,
            enhanced_listing: FeatureToggle::Auto,
            auto_capability_detection: true,
            min_reliability: 0.5,
            max_resume_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub performance_probing: bool,
    #[serde(with = "duration_ms", rename = "cache_ttl_ms")]
    pub cache_ttl: Duration,
    #[serde(with = "duration_ms", rename = "probe_timeout_ms")]
    pub probe_timeout: Duration,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            performance_probing: false,
            cache_ttl: Duration::from_secs(3600),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConfig {
    pub forced_mode: Option<TransferMode>,
    #[serde(with = "duration_ms", rename = "cache_ttl_ms")]
    pub cache_ttl: Duration,
    #[serde(with = "duration_ms", rename = "bind_probe_timeout_ms")]
    pub bind_probe_timeout: Duration,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            forced_mode: None,
            cache_ttl: Duration::from_secs(300),
            bind_probe_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub optimizer: OptimizerConfig,
    pub extended: ExtendedConfig,
    pub detection: DetectionConfig,
    pub mode: ModeConfig,
    pub retry: RetryConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        let pool = &self.pool;
        if pool.max_connections == 0 {
            return Err(EngineError::Config("max_connections must be at least 1".into()));
        }
        if pool.min_connections > pool.max_connections {
            return Err(EngineError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                pool.min_connections, pool.max_connections
            )));
        }
        if !(0.0..=1.0).contains(&pool.target_error_rate) {
            return Err(EngineError::Config(format!(
                "target_error_rate {} is outside [0, 1]",
                pool.target_error_rate
            )));
        }
        if self.optimizer.buffer_size == 0 {
            return Err(EngineError::Config("buffer_size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.extended.min_reliability) {
            return Err(EngineError::Config(format!(
                "min_reliability {} is outside [0, 1]",
                self.extended.min_reliability
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// When set, logs are also written to daily-rolling files here.
    pub file_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_dir: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.engine.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        if let Some(path) = Self::config_path() {
            self.save_to(&path)?;
        }
        Ok(())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "ftp-turbo", "ftp-turbo")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    pub fn is_configured(&self) -> bool {
        self.configured && !self.server_ip.is_empty() && !self.username.is_empty()
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint::new(self.server_ip.clone(), self.port, self.username.clone())
            .with_password(self.password.clone().unwrap_or_default())
    }

    pub fn interactive_setup(&mut self) -> Result<()> {
        println!("\nLet's configure the default FTP server:\n");

        self.server_ip = prompt("Server host: ")?;
        let port = prompt(&format!("Port [default: {}]: ", DEFAULT_FTP_PORT))?;
        self.port = port.parse().unwrap_or(DEFAULT_FTP_PORT);
        self.username = prompt("Username: ")?;
        self.password = Some(rpassword::prompt_password("Password: ").unwrap_or_default());
        self.configured = true;

        self.save()?;
        println!("\nSettings saved to: {:?}", Self::config_path());
        Ok(())
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server_ip, "");
        assert_eq!(config.port, 21);
        assert_eq!(config.password, None);
        assert!(!config.configured);
        assert!(config.engine.validate().is_ok());
        assert!(!config.engine.optimizer.client_compression);
    }

    #[test]
    fn test_feature_toggle_serialization() {
        let json = serde_json::to_string(&FeatureToggle::Auto).unwrap();
        assert_eq!(json, "\"auto\"");
        assert_eq!(serde_json::to_string(&FeatureToggle::Enabled).unwrap(), "true");

        let decoded: FeatureToggle = serde_json::from_str("false").unwrap();
        assert_eq!(decoded, FeatureToggle::Disabled);
        assert!(serde_json::from_str::<FeatureToggle>("\"sometimes\"").is_err());
    }

    #[test]
    fn test_feature_toggle_resolve() {
        assert!(FeatureToggle::Enabled.resolve(false, false));
        assert!(!FeatureToggle::Disabled.resolve(true, true));
        assert!(FeatureToggle::Auto.resolve(true, true));
        assert!(!FeatureToggle::Auto.resolve(true, false));
    }

    #[test]
    fn test_durations_serialized_as_millis() {
        let json = serde_json::to_value(PoolConfig::default()).unwrap();
        assert_eq!(json["max_queue_wait_time_ms"], 30_000);
        assert_eq!(json["thresholds"]["queue_length"], 2);

        let pool: PoolConfig =
            serde_json::from_str(r#"{"max_connections":2,"max_queue_wait_time_ms":500}"#).unwrap();
        assert_eq!(pool.max_connections, 2);
        assert_eq!(pool.max_queue_wait_time, Duration::from_millis(500));
        assert_eq!(pool.min_connections, 1);
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut engine = EngineConfig::default();
        engine.pool.min_connections = 6;
        assert!(engine.validate().is_err());

        let mut engine = EngineConfig::default();
        engine.pool.target_error_rate = 1.5;
        assert!(engine.validate().is_err());

        let mut engine = EngineConfig::default();
        engine.optimizer.buffer_size = 0;
        assert!(engine.validate().is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.server_ip = "10.0.0.1".to_string();
        config.username = "testuser".to_string();
        config.password = Some("testpass".to_string());
        config.configured = true;
        config.engine.extended.resumable_transfer = FeatureToggle::Disabled;
        config.save_to(&path).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("testpass")); // Password should be skipped

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.server_ip, "10.0.0.1");
        assert_eq!(loaded.password, None);
        assert!(loaded.is_configured());
        assert_eq!(
            loaded.engine.extended.resumable_transfer,
            FeatureToggle::Disabled
        );
    }

    #[test]
    fn test_is_configured() {
        let mut config = Config::default();
        assert!(!config.is_configured());

        config.server_ip = "192.168.1.1".to_string();
        config.username = "user".to_string();
        assert!(!config.is_configured());

        config.configured = true;
        assert!(config.is_configured());
    }
}
