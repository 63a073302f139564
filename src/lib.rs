#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

//! Transfer optimization for FTP servers: a bounded per-server session
//! pool, server capability detection, data-channel mode selection and
//! capability-gated resumable transfers with fallback.

pub mod cache;
pub mod capability;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod mode;
pub mod optimizer;
pub mod pool;
pub mod progress;
pub mod retry;

pub use capability::{Capability, CapabilityDetector, ServerCapabilityProfile};
pub use client::{Connector, FtpSession, RemoteFile, ServerEndpoint, TransferMode};
pub use config::{Config, EngineConfig, FeatureToggle};
pub use error::{EngineError, EngineResult, ErrorKind, OperationResult};
pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics};
pub use mode::{NetworkProbe, NetworkProfile, TransferModeSelector};
pub use optimizer::{
    ExtendedOptimizer, StandardOptimizer, StrategyPolicy, TransferReport, TransferStrategy,
};
pub use pool::{ConnectionPool, PooledSession};
