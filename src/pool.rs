//! Keyed pool of reusable FTP sessions with FIFO queueing and adaptive
//! capacity.
//!
//! All bookkeeping for a server key (idle sessions, in-use and connecting
//! counts, waiters, stats) sits behind one lock that is never held across an
//! await. A new connection reserves its slot under that lock before dialing,
//! so concurrent acquisitions cannot race past the capacity check.

use crate::client::{Connector, FtpSession, ServerEndpoint, TransferMode};
use crate::config::PoolConfig;
use crate::error::{EngineError, EngineResult};
use crate::metrics::MetricsSink;
use anyhow::anyhow;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A session checked out of the pool. Return it with
/// [`ConnectionPool::release`] or [`ConnectionPool::discard`]; dropping it
/// instead frees its slot but loses the connection.
pub struct PooledSession {
    id: String,
    server_key: String,
    identity: String,
    created_at: Instant,
    last_used_at: Instant,
    transfer_mode: Option<TransferMode>,
    lease: Option<Weak<PoolShared>>,
    session: Box<dyn FtpSession>,
}

impl PooledSession {
    fn new(endpoint: &ServerEndpoint, session: Box<dyn FtpSession>) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            server_key: endpoint.server_key(),
            identity: endpoint.identity(),
            created_at: now,
            last_used_at: now,
            transfer_mode: None,
            lease: None,
            session,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server_key(&self) -> &str {
        &self.server_key
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub const fn created_at(&self) -> Instant {
        self.created_at
    }

    pub const fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// Mode already applied to this session, if any.
    pub const fn transfer_mode(&self) -> Option<TransferMode> {
        self.transfer_mode
    }

    pub fn mark_transfer_mode(&mut self, mode: TransferMode) {
        self.transfer_mode = Some(mode);
    }

    pub fn transport(&mut self) -> &mut dyn FtpSession {
        self.session.as_mut()
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.id)
            .field("server_key", &self.server_key)
            .field("transfer_mode", &self.transfer_mode)
            .finish_non_exhaustive()
    }
}

impl Deref for PooledSession {
    type Target = dyn FtpSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let Some(shared) = self.lease.take().and_then(|weak| weak.upgrade()) else {
            return;
        };
        warn!(
            session_id = %self.id,
            server_key = %self.server_key,
            "session dropped without release, freeing its slot"
        );
        let pool = ConnectionPool { shared };
        {
            let mut state = pool.state();
            if let Some(key) = state.keys.get_mut(&self.server_key) {
                key.in_use = key.in_use.saturating_sub(1);
            }
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            pool.refill_for_waiters(&self.server_key);
        }
    }
}

type Delivery = EngineResult<PooledSession>;

struct Waiter {
    tx: oneshot::Sender<Delivery>,
    enqueued_at: Instant,
}

#[derive(Debug, Clone)]
struct KeyStats {
    total_requests: u64,
    failed_requests: u64,
    queue_waits: VecDeque<Duration>,
    current_max_connections: usize,
    last_scaling_check_at: Option<Instant>,
}

impl KeyStats {
    fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }

    fn avg_queue_wait(&self) -> Duration {
        if self.queue_waits.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.queue_waits.iter().sum();
        total / u32::try_from(self.queue_waits.len()).unwrap_or(u32::MAX)
    }

    fn record_wait(&mut self, waited: Duration, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.queue_waits.len() >= capacity {
            self.queue_waits.pop_front();
        }
        self.queue_waits.push_back(waited);
    }
}

struct KeyState {
    endpoint: ServerEndpoint,
    /// Back is the most recently released.
    idle: VecDeque<PooledSession>,
    in_use: usize,
    connecting: usize,
    waiters: VecDeque<Waiter>,
    stats: KeyStats,
}

impl KeyState {
    fn new(endpoint: ServerEndpoint, initial_max: usize) -> Self {
        Self {
            endpoint,
            idle: VecDeque::new(),
            in_use: 0,
            connecting: 0,
            waiters: VecDeque::new(),
            stats: KeyStats {
                total_requests: 0,
                failed_requests: 0,
                queue_waits: VecDeque::new(),
                current_max_connections: initial_max,
                last_scaling_check_at: None,
            },
        }
    }

    fn live(&self) -> usize {
        self.idle.len() + self.in_use + self.connecting
    }

    fn prune_waiters(&mut self) {
        self.waiters.retain(|w| !w.tx.is_closed());
    }
}

#[derive(Default)]
struct PoolState {
    keys: HashMap<String, KeyState>,
    shutdown: bool,
}

struct PoolShared {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<PoolState>,
    shutdown_tx: watch::Sender<bool>,
}

/// Point-in-time view of one server key.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatsSnapshot {
    pub server_key: String,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub error_rate: f64,
    pub avg_queue_wait_ms: f64,
    pub current_max_connections: usize,
    pub live: usize,
    pub idle: usize,
    pub in_use: usize,
    pub queued: usize,
}

/// Direction of an adaptive scaling step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    Up,
    Down,
    Hold,
}

enum Step {
    Reuse(PooledSession),
    Connect(ServerEndpoint),
    Wait(oneshot::Receiver<Delivery>),
}

#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(PoolShared {
                config,
                connector,
                metrics,
                state: Mutex::new(PoolState::default()),
                shutdown_tx,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lease(&self, mut session: PooledSession) -> PooledSession {
        session.lease = Some(Arc::downgrade(&self.shared));
        session
    }

    /// Checks out a session for `endpoint`: a healthy idle one if available,
    /// a new one if under capacity, otherwise waits in FIFO order (or fails
    /// when queueing is off).
    pub async fn acquire(&self, endpoint: &ServerEndpoint) -> EngineResult<PooledSession> {
        let server_key = endpoint.server_key();
        let mut counted = false;

        loop {
            let step = {
                let mut state = self.state();
                if state.shutdown {
                    return Err(EngineError::PoolShutdown);
                }
                let initial_max = self.initial_max();
                let key = state
                    .keys
                    .entry(server_key.clone())
                    .or_insert_with(|| KeyState::new(endpoint.clone(), initial_max));
                // Credentials may have changed since the key was first seen.
                key.endpoint = endpoint.clone();
                if !counted {
                    key.stats.total_requests += 1;
                    counted = true;
                }

                if let Some(session) = key.idle.pop_back() {
                    key.in_use += 1;
                    Step::Reuse(session)
                } else if key.live() < key.stats.current_max_connections {
                    key.connecting += 1;
                    Step::Connect(key.endpoint.clone())
                } else if self.shared.config.adaptive_queueing {
                    let (tx, rx) = oneshot::channel();
                    key.waiters.push_back(Waiter {
                        tx,
                        enqueued_at: Instant::now(),
                    });
                    debug!(server_key = %server_key, queued = key.waiters.len(), "pool saturated, queueing request");
                    Step::Wait(rx)
                } else {
                    key.stats.failed_requests += 1;
                    return Err(EngineError::CapacityExceeded {
                        server_key,
                        max: key.stats.current_max_connections,
                    });
                }
            };

            match step {
                Step::Reuse(session) => {
                    if let Some(session) = self.check_health(session).await {
                        self.shared.metrics.pool_hit(&server_key);
                        debug!(server_key = %server_key, session_id = %session.id, "reusing idle session");
                        return Ok(self.lease(session));
                    }
                }
                Step::Connect(endpoint) => return self.open(&endpoint, true).await,
                Step::Wait(rx) => return self.wait_in_queue(&server_key, rx).await,
            }
        }
    }

    fn initial_max(&self) -> usize {
        let config = &self.shared.config;
        config.max_connections.max(config.min_connections)
    }

    /// Probes a checked-out idle session. A failing session is closed and its
    /// slot freed; `None` tells the caller to look again.
    async fn check_health(&self, mut session: PooledSession) -> Option<PooledSession> {
        if !self.shared.config.health_check {
            return Some(session);
        }
        let probe = time::timeout(self.shared.config.connection_timeout, session.noop()).await;
        if matches!(probe, Ok(Ok(()))) {
            return Some(session);
        }

        warn!(server_key = %session.server_key, session_id = %session.id, "idle session failed health check, evicting");
        let server_key = session.server_key.clone();
        let _ = session.close().await;
        drop(session);
        {
            let mut state = self.state();
            if let Some(key) = state.keys.get_mut(&server_key) {
                key.in_use = key.in_use.saturating_sub(1);
            }
        }
        None
    }

    /// Dials a new session. The caller has already reserved a connecting slot.
    /// With `refill_on_error` a failed dial hands its freed slot to the queue.
    async fn open(&self, endpoint: &ServerEndpoint, refill_on_error: bool) -> EngineResult<PooledSession> {
        let server_key = endpoint.server_key();
        self.shared.metrics.pool_miss(&server_key);
        let timeout = self.shared.config.connection_timeout;

        let result = match time::timeout(timeout, self.shared.connector.connect(endpoint)).await {
            Ok(Ok(session)) => Ok(PooledSession::new(endpoint, session)),
            Ok(Err(e)) => Err(EngineError::connection(&server_key, e)),
            Err(_) => Err(EngineError::connection(
                &server_key,
                anyhow!("connect timed out after {:?}", timeout),
            )),
        };

        let shutdown = {
            let mut state = self.state();
            if let Some(key) = state.keys.get_mut(&server_key) {
                key.connecting = key.connecting.saturating_sub(1);
                match &result {
                    Ok(_) => key.in_use += 1,
                    Err(_) => key.stats.failed_requests += 1,
                }
            }
            state.shutdown
        };

        match result {
            Ok(mut session) if shutdown => {
                let _ = session.close().await;
                Err(EngineError::PoolShutdown)
            }
            Ok(session) => {
                info!(server_key = %server_key, session_id = %session.id, "opened new session");
                Ok(self.lease(session))
            }
            Err(e) => {
                warn!(server_key = %server_key, "connection failed: {}", e);
                if refill_on_error {
                    // The reserved slot is free again; someone queued may use it.
                    self.refill_for_waiters(&server_key);
                }
                Err(e)
            }
        }
    }

    async fn wait_in_queue(
        &self,
        server_key: &str,
        mut rx: oneshot::Receiver<Delivery>,
    ) -> EngineResult<PooledSession> {
        let max_wait = self.shared.config.max_queue_wait_time;
        match time::timeout(max_wait, &mut rx).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => Err(EngineError::PoolShutdown),
            Err(_) => {
                rx.close();
                // A release may have landed in the same instant as the deadline.
                if let Ok(delivery) = rx.try_recv() {
                    return delivery;
                }
                {
                    let mut state = self.state();
                    if let Some(key) = state.keys.get_mut(server_key) {
                        key.prune_waiters();
                        key.stats.failed_requests += 1;
                    }
                }
                warn!(server_key = %server_key, "queued acquisition timed out after {:?}", max_wait);
                Err(EngineError::QueueTimeout {
                    server_key: server_key.to_string(),
                    waited: max_wait,
                })
            }
        }
    }

    /// Returns a session to the pool, handing it straight to the oldest live
    /// waiter when there is one.
    pub async fn release(&self, mut session: PooledSession) {
        session.lease = None;
        session.last_used_at = Instant::now();

        let mut to_close = None;
        {
            let mut state = self.state();
            let shutdown = state.shutdown;
            match state.keys.get_mut(&session.server_key) {
                Some(key) if !shutdown => {
                    let mut candidate = Some(session);
                    while let Some(waiter) = key.waiters.pop_front() {
                        let Some(mut next) = candidate.take() else {
                            break;
                        };
                        let waited = waiter.enqueued_at.elapsed();
                        next.lease = Some(Arc::downgrade(&self.shared));
                        match waiter.tx.send(Ok(next)) {
                            Ok(()) => {
                                key.stats
                                    .record_wait(waited, self.shared.config.queue_history_size);
                                self.shared.metrics.queue_wait(&key.endpoint.server_key(), waited);
                                return;
                            }
                            Err(returned) => {
                                candidate = returned.ok().map(|mut s| {
                                    s.lease = None;
                                    s
                                });
                            }
                        }
                    }

                    if let Some(session) = candidate {
                        key.in_use = key.in_use.saturating_sub(1);
                        if key.live() >= key.stats.current_max_connections {
                            // Over the cap after a scale-down.
                            to_close = Some(session);
                        } else {
                            key.idle.push_back(session);
                        }
                    }
                }
                Some(key) => {
                    key.in_use = key.in_use.saturating_sub(1);
                    to_close = Some(session);
                }
                None => to_close = Some(session),
            }
        }

        if let Some(mut session) = to_close {
            debug!(session_id = %session.id, "closing released session");
            let _ = session.close().await;
        }
    }

    /// Closes a session that is no longer trustworthy and frees its slot.
    pub async fn discard(&self, mut session: PooledSession) {
        session.lease = None;
        let server_key = session.server_key.clone();
        let _ = session.close().await;
        drop(session);
        {
            let mut state = self.state();
            if let Some(key) = state.keys.get_mut(&server_key) {
                key.in_use = key.in_use.saturating_sub(1);
            }
        }
        self.refill_for_waiters(&server_key);
    }

    /// Opens new sessions for queued requests while there is room.
    fn refill_for_waiters(&self, server_key: &str) {
        let mut reserved = Vec::new();
        {
            let mut state = self.state();
            if state.shutdown {
                return;
            }
            let Some(key) = state.keys.get_mut(server_key) else {
                return;
            };
            key.prune_waiters();
            let mut spare = key
                .stats
                .current_max_connections
                .saturating_sub(key.live())
                .min(key.waiters.len().saturating_sub(key.connecting));
            while spare > 0 {
                key.connecting += 1;
                reserved.push(key.endpoint.clone());
                spare -= 1;
            }
        }

        for endpoint in reserved {
            let pool = self.clone();
            tokio::spawn(async move {
                let server_key = endpoint.server_key();
                let delivery = pool.open(&endpoint, false).await;
                let failed = delivery.is_err();
                pool.deliver(&server_key, delivery).await;
                if failed {
                    // Only after the error reached its waiter.
                    pool.refill_for_waiters(&server_key);
                }
            });
        }
    }

    /// Hands a freshly opened session (or the error opening it) to the
    /// oldest waiter; parks the session idle if nobody is waiting anymore.
    async fn deliver(&self, server_key: &str, delivery: Delivery) {
        let mut delivery = Some(delivery);
        let leftover = {
            let mut state = self.state();
            let shutdown = state.shutdown;
            let Some(key) = state.keys.get_mut(server_key) else {
                return;
            };
            while let Some(waiter) = key.waiters.pop_front() {
                let Some(next) = delivery.take() else {
                    break;
                };
                let waited = waiter.enqueued_at.elapsed();
                match waiter.tx.send(next) {
                    Ok(()) => {
                        key.stats
                            .record_wait(waited, self.shared.config.queue_history_size);
                        self.shared.metrics.queue_wait(server_key, waited);
                        break;
                    }
                    Err(returned) => delivery = Some(returned),
                }
            }
            match delivery {
                Some(Ok(mut session)) => {
                    session.lease = None;
                    key.in_use = key.in_use.saturating_sub(1);
                    if shutdown {
                        Some(session)
                    } else {
                        key.idle.push_back(session);
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(mut session) = leftover {
            let _ = session.close().await;
        }
    }

    /// Closes idle sessions unused for longer than `max_idle_time`.
    pub async fn sweep_idle(&self) -> usize {
        let max_idle = self.shared.config.max_idle_time;
        let mut expired = Vec::new();
        {
            let mut state = self.state();
            for key in state.keys.values_mut() {
                let mut kept = VecDeque::with_capacity(key.idle.len());
                while let Some(session) = key.idle.pop_front() {
                    if session.last_used_at.elapsed() > max_idle {
                        expired.push(session);
                    } else {
                        kept.push_back(session);
                    }
                }
                key.idle = kept;
            }
        }

        let count = expired.len();
        for mut session in expired {
            debug!(session_id = %session.id, server_key = %session.server_key, "evicting idle session");
            let _ = session.close().await;
        }
        if count > 0 {
            info!("idle sweep closed {} session(s)", count);
        }
        count
    }

    /// Runs one adaptive-scaling pass over every server key.
    pub async fn check_scaling(&self) -> HashMap<String, ScalingDecision> {
        let config = &self.shared.config;
        let thresholds = &config.thresholds;
        let max_wait = config.max_queue_wait_time;
        let mut decisions = HashMap::new();
        let mut to_close = Vec::new();
        let mut grown = Vec::new();

        {
            let mut state = self.state();
            for (server_key, key) in &mut state.keys {
                key.prune_waiters();
                let error_rate = key.stats.error_rate();
                let avg_wait = key.stats.avg_queue_wait();
                let queued = key.waiters.len();
                let live = key.live();
                let current = key.stats.current_max_connections;

                let wants_up = avg_wait > max_wait.mul_f64(thresholds.scale_up_wait_ratio)
                    || queued > thresholds.queue_length
                    || error_rate > config.target_error_rate;
                let wants_down = error_rate
                    < config.target_error_rate * thresholds.scale_down_error_ratio
                    && queued == 0
                    && avg_wait < max_wait.mul_f64(thresholds.scale_down_wait_ratio)
                    && live > config.min_connections;

                let decision = if wants_up && current < config.max_connections {
                    key.stats.current_max_connections = current + 1;
                    grown.push(server_key.clone());
                    ScalingDecision::Up
                } else if wants_down && current > config.min_connections {
                    let new_max = current - 1;
                    key.stats.current_max_connections = new_max;
                    // Longest idle first; sessions still in use are closed by
                    // `release` once they come back over the cap.
                    let excess = live.saturating_sub(new_max).min(key.idle.len());
                    to_close.extend(key.idle.drain(..excess));
                    ScalingDecision::Down
                } else {
                    ScalingDecision::Hold
                };

                if decision != ScalingDecision::Hold {
                    info!(
                        server_key = %server_key,
                        error_rate,
                        avg_queue_wait_ms = avg_wait.as_millis() as u64,
                        queued,
                        "scaled {:?} to {} connection(s)",
                        decision,
                        key.stats.current_max_connections
                    );
                }
                key.stats.last_scaling_check_at = Some(Instant::now());
                decisions.insert(server_key.clone(), decision);
            }
        }

        for mut session in to_close {
            let _ = session.close().await;
        }
        for server_key in grown {
            self.refill_for_waiters(&server_key);
        }
        decisions
    }

    /// Starts the periodic idle sweep and (when enabled) scaling checks.
    /// The task ends on [`shutdown`](Self::shutdown) or when the pool is dropped.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        let config = self.shared.config.clone();
        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut sweep = time::interval(config.idle_sweep_interval);
            let mut scaling = time::interval(config.scaling_check_interval);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            scaling.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Both intervals fire immediately on the first tick.
            sweep.tick().await;
            scaling.tick().await;

            loop {
                tokio::select! {
                    _ = sweep.tick() => {
                        let Some(shared) = weak.upgrade() else { break };
                        ConnectionPool { shared }.sweep_idle().await;
                    }
                    _ = scaling.tick(), if config.enable_adaptive_scaling => {
                        let Some(shared) = weak.upgrade() else { break };
                        ConnectionPool { shared }.check_scaling().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("pool maintenance stopped");
        })
    }

    /// Rejects every queued request, closes idle sessions and refuses new
    /// acquisitions. Checked-out sessions are closed as they come back.
    pub async fn shutdown(&self) {
        let mut idle = Vec::new();
        {
            let mut state = self.state();
            state.shutdown = true;
            for key in state.keys.values_mut() {
                for waiter in key.waiters.drain(..) {
                    let _ = waiter.tx.send(Err(EngineError::PoolShutdown));
                }
                idle.extend(key.idle.drain(..));
            }
        }
        let _ = self.shared.shutdown_tx.send(true);

        for mut session in idle {
            let _ = session.close().await;
        }
        info!("connection pool shut down");
    }

    pub fn stats(&self) -> Vec<PoolStatsSnapshot> {
        let state = self.state();
        let mut snapshots: Vec<PoolStatsSnapshot> = state
            .keys
            .iter()
            .map(|(server_key, key)| PoolStatsSnapshot {
                server_key: server_key.clone(),
                total_requests: key.stats.total_requests,
                failed_requests: key.stats.failed_requests,
                error_rate: key.stats.error_rate(),
                avg_queue_wait_ms: key.stats.avg_queue_wait().as_secs_f64() * 1000.0,
                current_max_connections: key.stats.current_max_connections,
                live: key.live(),
                idle: key.idle.len(),
                in_use: key.in_use,
                queued: key.waiters.iter().filter(|w| !w.tx.is_closed()).count(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.server_key.cmp(&b.server_key));
        snapshots
    }

    pub fn stats_for(&self, server_key: &str) -> Option<PoolStatsSnapshot> {
        self.stats().into_iter().find(|s| s.server_key == server_key)
    }
}
