use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::connection::{secs, Connection, ConnectionConfig};
use super::error::{ErrorKind, NntpError, Result};

const DEFAULT_MAX_SIZE: usize = 10;
const MAX_ACQUIRE_ATTEMPTS: usize = 3;
const WARM_UP_TIMEOUT: Duration = Duration::from_secs(15);
const DISCARD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Connecting,
    Online,
    Offline,
    AuthFailed,
    Disabled,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolState::Connecting => "connecting",
            PoolState::Online => "online",
            PoolState::Offline => "offline",
            PoolState::AuthFailed => "auth_failed",
            PoolState::Disabled => "disabled",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    pub min_size: usize,
    /// 0 means the default of 10.
    pub max_size: usize,
    #[serde(with = "secs")]
    pub health_check_timeout: Duration,
    #[serde(with = "secs")]
    pub reconnect_timeout: Duration,
    /// First back-off interval of the reconnect loop. Doubles per failed
    /// attempt up to 16x.
    #[serde(with = "secs")]
    pub reconnect_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            min_size: 0,
            max_size: DEFAULT_MAX_SIZE,
            health_check_timeout: Duration::from_secs(10),
            reconnect_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    pub fn id(&self) -> String {
        self.connection.id()
    }

    fn normalized(mut self) -> Self {
        let defaults = PoolConfig::default();
        if self.max_size == 0 {
            self.max_size = DEFAULT_MAX_SIZE;
        }
        self.min_size = self.min_size.min(self.max_size);
        if self.health_check_timeout.is_zero() {
            self.health_check_timeout = defaults.health_check_timeout;
        }
        if self.reconnect_timeout.is_zero() {
            self.reconnect_timeout = defaults.reconnect_timeout;
        }
        if self.reconnect_delay.is_zero() {
            self.reconnect_delay = defaults.reconnect_delay;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub acquired: usize,
    pub idle: usize,
    pub total: usize,
    pub max: usize,
}

struct PoolInner {
    id: String,
    config: PoolConfig,
    state: RwLock<PoolState>,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    acquired: AtomicUsize,
    total: AtomicUsize,
    closed: AtomicBool,
    reconnect_scheduled: AtomicBool,
    cancel: CancellationToken,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

/// A bounded set of health-checked connections to one provider account.
///
/// Cloning is cheap and every clone refers to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates the pool and, when `min_size > 0`, opens that many
    /// connections up front. A failed warm-up is only logged.
    pub async fn new(config: PoolConfig) -> Result<Self> {
        if config.connection.host.is_empty() {
            return Err(NntpError::Config("missing host".into()));
        }
        let config = config.normalized();

        let inner = Arc::new(PoolInner {
            id: config.id(),
            permits: Arc::new(Semaphore::new(config.max_size)),
            config,
            state: RwLock::new(PoolState::Online),
            idle: Mutex::new(Vec::new()),
            acquired: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            reconnect_scheduled: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            reconnect_task: Mutex::new(None),
        });
        let pool = ConnectionPool { inner };

        if pool.min_size() > 0 {
            match tokio::time::timeout(WARM_UP_TIMEOUT, pool.ensure_min_size()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("failed to ensure min size at startup for {}: {}", pool.id(), e),
                Err(_) => warn!("failed to ensure min size at startup for {}: timed out", pool.id()),
            }
        }

        Ok(pool)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn max_size(&self) -> usize {
        self.inner.config.max_size
    }

    pub fn min_size(&self) -> usize {
        self.inner.config.min_size
    }

    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    pub fn set_state(&self, state: PoolState) {
        self.inner.set_state(state);
    }

    pub fn is_online(&self) -> bool {
        self.state() == PoolState::Online
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            acquired: self.inner.acquired.load(Ordering::SeqCst),
            idle: self.inner.idle.lock().len(),
            total: self.inner.total.load(Ordering::SeqCst),
            max: self.inner.config.max_size,
        }
    }

    async fn ensure_min_size(&self) -> Result<()> {
        let missing = self.min_size().saturating_sub(self.stats().total);
        let mut warm = Vec::with_capacity(missing);
        for _ in 0..missing {
            warm.push(self.acquire().await?);
        }
        for mut conn in warm {
            conn.release();
        }
        Ok(())
    }

    /// Checks out a connection that just answered a `DATE` health check.
    ///
    /// Raw socket failures are retried on a fresh connection. Classified
    /// failures (and exhausted retries) mark the pool offline, or
    /// `auth_failed` for credential rejections.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let mut errs = Vec::new();

        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            let state = self.state();
            if state != PoolState::Online && state != PoolState::Connecting {
                return Err(NntpError::PoolNotOnline);
            }
            trace!(pool = %self.id(), %state, attempt, "acquiring connection");

            let err = match self.inner.checkout().await {
                Ok(mut conn) => match self.health_check(&mut conn).await {
                    Ok(()) => return Ok(conn),
                    Err(e) => {
                        conn.destroy();
                        e
                    }
                },
                Err(e) => e,
            };

            if err.kind() == ErrorKind::PoolClosed {
                return Err(err);
            }
            if err.is_raw() && err.is_transient() {
                trace!(pool = %self.id(), attempt, "connection error, retrying: {}", err);
                errs.push(err);
                continue;
            }
            self.inner.handle_failure(std::iter::once(&err));
            return Err(err);
        }

        self.inner.handle_failure(&errs);
        let cause = errs
            .pop()
            .map(io::Error::from)
            .unwrap_or_else(|| io::Error::other("no attempts made"));
        Err(NntpError::connection(
            "failed to acquire healthy connection after max retries",
            cause,
        ))
    }

    /// Like [`acquire`](Self::acquire) but with `group` selected. `GROUP` is
    /// only sent when the connection has a different group selected.
    pub async fn acquire_for_group(&self, group: &str) -> Result<PooledConnection> {
        let mut conn = self.acquire().await?;
        if conn.current_group() == group {
            return Ok(conn);
        }
        let selected = conn.connection()?.group(group).await;
        if let Err(e) = selected {
            conn.destroy();
            return Err(e);
        }
        Ok(conn)
    }

    /// `DATE` is optional in RFC 3977, so a 5xx reply still proves the
    /// session is alive.
    async fn health_check(&self, conn: &mut PooledConnection) -> Result<()> {
        let timeout = self.inner.config.health_check_timeout;
        match tokio::time::timeout(timeout, conn.connection()?.date()).await {
            Err(_) => Err(NntpError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "health check timed out",
            ))),
            Ok(Ok(_)) => Ok(()),
            Ok(Err(NntpError::Command { status, .. })) if (500..600).contains(&status) => Ok(()),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Stops the reconnect loop and closes idle connections. Connections
    /// still checked out are discarded when returned.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();

        let task = self.inner.reconnect_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.inner.permits.close();
        let idle = std::mem::take(&mut *self.inner.idle.lock());
        for mut conn in idle {
            self.inner.total.fetch_sub(1, Ordering::SeqCst);
            let _ = tokio::time::timeout(DISCARD_TIMEOUT, conn.close()).await;
        }
        debug!(pool = %self.id(), "pool closed");
    }
}

impl PoolInner {
    fn state(&self) -> PoolState {
        *self.state.read()
    }

    fn set_state(&self, state: PoolState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(pool = %self.id, from = %previous, to = %state, "pool state changed");
        }
    }

    async fn checkout(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NntpError::PoolClosed);
        }
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| NntpError::PoolClosed)?;

        loop {
            let idle = self.idle.lock().pop();
            match idle {
                Some(conn) if conn.is_stale() || !conn.is_clean() => {
                    self.total.fetch_sub(1, Ordering::SeqCst);
                    discard(conn);
                }
                Some(conn) => return Ok(PooledConnection::new(self.clone(), conn, permit)),
                None => break,
            }
        }

        let conn = Connection::connect(&self.config.connection).await?;
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConnection::new(self.clone(), conn, permit))
    }

    fn handle_failure<'a>(self: &Arc<Self>, errs: impl IntoIterator<Item = &'a NntpError>) {
        if let Some(err) = errs.into_iter().find(|e| e.is_auth_error()) {
            warn!(pool = %self.id, "authentication rejected: {}", err);
            self.set_state(PoolState::AuthFailed);
            return;
        }

        let current = self.state();
        if current == PoolState::Online || current == PoolState::Connecting {
            self.set_state(PoolState::Offline);
            if current == PoolState::Online {
                self.destroy_idle();
            }
            self.schedule_reconnect();
        }
    }

    fn destroy_idle(&self) {
        let idle = std::mem::take(&mut *self.idle.lock());
        for conn in idle {
            self.total.fetch_sub(1, Ordering::SeqCst);
            discard(conn);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self
            .reconnect_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let handle = tokio::spawn(reconnect_loop(
            Arc::downgrade(self),
            self.cancel.clone(),
            self.config.reconnect_delay,
            self.id.clone(),
        ));
        if let Some(previous) = self.reconnect_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Clears the scheduled flag at the end of a reconnection loop. Returns
    /// true when the pool went offline again while the flag was still set,
    /// in which case the flag is re-taken and the caller keeps looping.
    fn finish_reconnect(&self) -> bool {
        self.reconnect_scheduled.store(false, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
            return false;
        }
        self.state() == PoolState::Offline
            && self
                .reconnect_scheduled
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    async fn do_reconnect(self: &Arc<Self>) -> bool {
        match self.state() {
            PoolState::Disabled | PoolState::AuthFailed => return false,
            _ => {}
        }
        self.set_state(PoolState::Connecting);

        let attempt = tokio::time::timeout(self.config.reconnect_timeout, self.checkout());
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            res = attempt => res,
        };

        match result {
            Ok(Ok(mut conn)) => {
                conn.release();
                self.set_state(PoolState::Online);
                true
            }
            Ok(Err(e)) => {
                warn!("reconnection attempt failed for {}: {}", self.config.connection.host, e);
                if e.is_auth_error() {
                    self.set_state(PoolState::AuthFailed);
                } else {
                    self.set_state(PoolState::Offline);
                }
                false
            }
            Err(_) => {
                warn!("reconnection attempt failed for {}: timed out", self.config.connection.host);
                self.set_state(PoolState::Offline);
                false
            }
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn reconnect_loop(
    pool: Weak<PoolInner>,
    cancel: CancellationToken,
    delay: Duration,
    id: String,
) {
    loop {
        reconnect_attempts(&pool, &cancel, delay, &id).await;
        let Some(inner) = pool.upgrade() else {
            return;
        };
        if !inner.finish_reconnect() {
            return;
        }
        debug!(pool = %id, "pool went offline again, resuming reconnection loop");
    }
}

async fn reconnect_attempts(
    pool: &Weak<PoolInner>,
    cancel: &CancellationToken,
    delay: Duration,
    id: &str,
) {
    let max_interval = delay * 16;
    let mut interval = delay;
    let mut attempt = 0u32;
    debug!(pool = %id, "starting reconnection loop");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(pool = %id, reason = "stop signal", "reconnection loop stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(inner) = pool.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::SeqCst) {
            debug!(pool = %id, reason = "pool closed", "reconnection loop stopped");
            return;
        }
        let state = inner.state();
        if state != PoolState::Offline {
            debug!(pool = %id, reason = "state changed", %state, "reconnection loop stopped");
            return;
        }

        attempt += 1;
        debug!(pool = %id, attempt, backoff = ?interval, "attempting reconnection");
        if inner.do_reconnect().await {
            debug!(pool = %id, "reconnection successful");
            return;
        }
        interval = (interval * 2).min(max_interval);
        debug!(pool = %id, backoff = ?interval, "reconnection failed, backing off");
    }
}

/// QUITs a connection in the background without holding up the caller.
fn discard(mut conn: Connection) {
    tokio::spawn(async move {
        let _ = tokio::time::timeout(DISCARD_TIMEOUT, conn.close()).await;
    });
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Exactly one of [`release`](Self::release), [`destroy`](Self::destroy) or
/// [`hijack`](Self::hijack) takes effect; later calls are no-ops. Dropping
/// the handle releases it.
pub struct PooledConnection {
    conn: Option<Connection>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection, permit: OwnedSemaphorePermit) -> Self {
        pool.acquired.fetch_add(1, Ordering::SeqCst);
        Self {
            conn: Some(conn),
            permit: Some(permit),
            pool,
        }
    }

    pub fn connection(&mut self) -> Result<&mut Connection> {
        self.conn.as_mut().ok_or_else(|| {
            NntpError::connection(
                "connection already returned to the pool",
                io::ErrorKind::NotConnected.into(),
            )
        })
    }

    pub fn current_group(&self) -> &str {
        self.conn.as_ref().map(|c| c.current_group()).unwrap_or("")
    }

    pub fn provider_id(&self) -> &str {
        &self.pool.id
    }

    /// Returns the connection to the idle list. A connection with a reply
    /// still on the wire is closed instead.
    pub fn release(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        self.pool.acquired.fetch_sub(1, Ordering::SeqCst);
        if self.pool.closed.load(Ordering::SeqCst) || !conn.is_clean() {
            self.pool.total.fetch_sub(1, Ordering::SeqCst);
            discard(conn);
        } else {
            self.pool.idle.lock().push(conn);
        }
        self.permit.take();
    }

    pub fn destroy(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        self.pool.acquired.fetch_sub(1, Ordering::SeqCst);
        self.pool.total.fetch_sub(1, Ordering::SeqCst);
        self.permit.take();
        discard(conn);
    }

    /// Detaches the connection from the pool. The caller owns it from now on.
    pub fn hijack(&mut self) -> Option<Connection> {
        let conn = self.conn.take()?;
        self.pool.acquired.fetch_sub(1, Ordering::SeqCst);
        self.pool.total.fetch_sub(1, Ordering::SeqCst);
        self.permit.take();
        Some(conn)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.release();
    }
}
