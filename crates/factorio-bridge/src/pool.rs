//! Connection pool of RCON sessions per server
//!
//! Each server gets a bounded set of sessions guarded by a semaphore. A
//! caller holds a [`PooledSession`] for one request/response exchange (or a
//! run of them) and the session returns to the idle list when the guard is
//! dropped, unless it failed or was abandoned mid-request, in which case it
//! is discarded and a fresh one is opened on the next acquisition.

use crate::backoff::Backoff;
use crate::config::BridgeConfig;
use crate::rcon::{AuthState, Session};
use crate::transport::Connector;
use agent_bridge_core::{BridgeError, Response, Result, ServerEndpoint, ServerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Snapshot of one server's pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Maximum sessions
    pub capacity: usize,
    /// Authenticated sessions waiting for a caller
    pub idle: usize,
    /// Sessions currently handed out
    pub in_use: usize,
    /// Sessions opened over the pool's lifetime
    pub opened: u64,
    /// Whether the server is inside its unreachable cooldown
    pub unreachable: bool,
}

/// Per-server bookkeeping
#[derive(Debug)]
struct ServerSlot {
    id: ServerId,
    capacity: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Session>>,
    unreachable_until: Mutex<Option<Instant>>,
    opened: AtomicU64,
}

impl ServerSlot {
    fn new(id: ServerId, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(Vec::new()),
            unreachable_until: Mutex::new(None),
            opened: AtomicU64::new(0),
        }
    }

    fn take_idle(&self) -> Option<Session> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(session) = idle.pop() {
            if session.is_reusable() {
                return Some(session);
            }
        }
        None
    }

    fn return_idle(&self, session: Session) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(session);
    }

    fn drain_idle(&self) -> Vec<Session> {
        std::mem::take(&mut *self.idle.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Remaining cooldown, if the server is marked unreachable
    fn cooldown_remaining(&self) -> Option<Duration> {
        let until = *self
            .unreachable_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        until.and_then(|until| until.checked_duration_since(Instant::now()))
    }

    fn mark_unreachable(&self, cooldown: Duration) {
        *self
            .unreachable_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + cooldown);
    }

    fn mark_reachable(&self) {
        *self
            .unreachable_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }
}

struct PoolInner {
    config: BridgeConfig,
    connector: Arc<dyn Connector>,
    slots: Mutex<HashMap<ServerId, Arc<ServerSlot>>>,
}

/// Bounded set of authenticated sessions per server
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let servers = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("ConnectionPool")
            .field("pool_size", &self.inner.config.pool_size)
            .field("servers", &servers)
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(config: BridgeConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn slot(&self, server: &ServerId) -> Arc<ServerSlot> {
        let mut slots = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        slots
            .entry(server.clone())
            .or_insert_with(|| {
                Arc::new(ServerSlot::new(
                    server.clone(),
                    self.inner.config.pool_size,
                ))
            })
            .clone()
    }

    /// Hand out a session for `server`.
    ///
    /// Prefers an idle authenticated session, otherwise opens a new one while
    /// under capacity, otherwise waits up to the acquire timeout.
    pub async fn acquire(&self, server: &ServerEndpoint) -> Result<PooledSession> {
        let slot = self.slot(&server.id);

        if let Some(remaining) = slot.cooldown_remaining() {
            return Err(BridgeError::unavailable(
                &server.id,
                format!("marked unreachable for another {:?}", remaining),
            ));
        }

        let started = Instant::now();
        let timeout = self.inner.config.acquire_timeout;
        let permit = match tokio::time::timeout(timeout, slot.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(BridgeError::unavailable(&server.id, "pool shut down")),
            Err(_) => {
                warn!(
                    "All {} sessions for {} busy for {:?}",
                    slot.capacity, server.id, timeout
                );
                return Err(BridgeError::PoolExhausted {
                    server: server.id.clone(),
                    waited: started.elapsed(),
                });
            }
        };

        if let Some(session) = slot.take_idle() {
            debug!("Reusing session {} for {}", session.id(), server.id);
            return Ok(PooledSession::new(session, slot, permit));
        }

        let session = self.open_session(&slot, server).await?;
        Ok(PooledSession::new(session, slot, permit))
    }

    /// Return a healthy session to the idle list
    pub fn release(&self, session: PooledSession) {
        session.release();
    }

    /// Discard a session so it is never handed out again
    pub fn invalidate(&self, session: PooledSession) {
        session.invalidate();
    }

    /// Connect and authenticate, retrying with backoff
    async fn open_session(&self, slot: &ServerSlot, server: &ServerEndpoint) -> Result<Session> {
        let mut backoff = Backoff::new(self.inner.config.backoff.clone());

        loop {
            match self.connect_once(server).await {
                Ok(session) => {
                    slot.mark_reachable();
                    slot.opened.fetch_add(1, Ordering::Relaxed);
                    return Ok(session);
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            "Connecting to {} failed (retry {} in {:?}): {}",
                            server.id,
                            backoff.retries(),
                            delay,
                            e
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        let cooldown = self.inner.config.unreachable_cooldown;
                        error!(
                            "Server {} unreachable after {} retries, cooling down for {:?}: {}",
                            server.id,
                            backoff.retries(),
                            cooldown,
                            e
                        );
                        slot.mark_unreachable(cooldown);
                        return Err(BridgeError::unavailable(
                            &server.id,
                            format!("unreachable after {} retries: {}", backoff.retries(), e),
                        ));
                    }
                },
            }
        }
    }

    async fn connect_once(&self, server: &ServerEndpoint) -> Result<Session> {
        let timeout = self.inner.config.connect_timeout;
        let stream = tokio::time::timeout(timeout, self.inner.connector.connect(server))
            .await
            .map_err(|_| BridgeError::Timeout(timeout))??;

        let mut session = Session::new(server.id.clone(), stream);
        session.authenticate(&server.password, timeout).await?;
        info!("Opened session {} to {}", session.id(), server.id);
        Ok(session)
    }

    /// Whether `server` is inside its unreachable cooldown
    pub fn is_unreachable(&self, server: &ServerId) -> bool {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(server)
            .is_some_and(|slot| slot.cooldown_remaining().is_some())
    }

    /// Pool statistics for one server
    pub fn stats(&self, server: &ServerId) -> Option<PoolStats> {
        let slots = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = slots.get(server)?;
        let idle = slot
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();

        Some(PoolStats {
            capacity: slot.capacity,
            idle,
            in_use: slot.capacity - slot.permits.available_permits(),
            opened: slot.opened.load(Ordering::Relaxed),
            unreachable: slot.cooldown_remaining().is_some(),
        })
    }

    /// Close every idle session and refuse further acquisitions
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<ServerSlot>> = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for slot in slots {
            slot.permits.close();
            for mut session in slot.drain_idle() {
                session.disconnect().await;
            }
            info!("Closed pool for {}", slot.id);
        }
    }
}

/// A session checked out of the pool.
///
/// Dropping the guard returns the session to the pool if it is still
/// healthy and has no request in flight; otherwise the session is discarded.
pub struct PooledSession {
    session: Option<Session>,
    slot: Arc<ServerSlot>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("session", &self.session)
            .finish()
    }
}

impl PooledSession {
    fn new(session: Session, slot: Arc<ServerSlot>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            session: Some(session),
            slot,
            _permit: permit,
        }
    }

    /// Id of the underlying session
    pub fn session_id(&self) -> u64 {
        self.session.as_ref().map(Session::id).unwrap_or_default()
    }

    pub fn server(&self) -> &ServerId {
        &self.slot.id
    }

    pub fn state(&self) -> AuthState {
        self.session
            .as_ref()
            .map(Session::state)
            .unwrap_or(AuthState::Closed)
    }

    /// Send one request and wait for its complete response
    pub async fn exchange(&mut self, body: &str, timeout: Duration) -> Result<Response> {
        match self.session.as_mut() {
            Some(session) => session.exchange(body, timeout).await,
            None => Err(BridgeError::unavailable(&self.slot.id, "session released")),
        }
    }

    /// Return the session to the pool
    pub fn release(self) {
        drop(self);
    }

    /// Discard the session
    pub fn invalidate(mut self) {
        if let Some(session) = self.session.as_mut() {
            debug!("Invalidating session {}", session.id());
            session.close();
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        // Runs before the permit field drops, so a waiter finds this session idle
        if let Some(session) = self.session.take() {
            if session.is_reusable() {
                self.slot.return_idle(session);
            } else {
                debug!(
                    "Discarding session {} ({:?})",
                    session.id(),
                    session.state()
                );
            }
        }
    }
}
