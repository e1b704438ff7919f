//! A blocking connection pool, bounded by the `[database]` pool options.
use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use rusqlite::Connection;

use super::DbError;
use crate::config::DatabaseConfig;

const DEFAULT_POOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens new connections on behalf of a pool.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Connection, DbError>;

    /// Human-readable description of the target, used in log messages.
    fn describe(&self) -> String;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    pub max_overflow: usize,
    pub timeout: Duration,
    pub idle_timeout: Duration,
    /// Negative means retry forever.
    pub max_retries: i32,
    pub retry_interval: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self {
            min_size: config.min_pool_size,
            max_size: config.max_pool_size,
            max_overflow: config.max_overflow.unwrap_or(0),
            timeout: config
                .pool_timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_POOL_TIMEOUT),
            idle_timeout: Duration::from_secs(config.idle_timeout),
            max_retries: config.max_retries,
            retry_interval: Duration::from_secs(config.retry_interval),
        }
    }
}

/// A snapshot of pool usage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub checked_out: usize,
}

struct IdleConnection {
    connection: Connection,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleConnection>,
    checked_out: usize,
}

struct PoolInner {
    connector: Box<dyn Connector>,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PoolInner {
    fn release(&self, connection: Connection) {
        let mut state = self.state.lock().expect("Poisoned");
        state.checked_out -= 1;
        if state.idle.len() < self.settings.max_size {
            state.idle.push_back(IdleConnection {
                connection,
                since: Instant::now(),
            });
        } else {
            tracing::debug!("Closing overflow connection to {}", self.connector.describe());
        }
        self.available.notify_one();
    }
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool, eagerly opening `min_size` connections. The first connection is retried according to
    /// `max_retries` and `retry_interval`, so a database that is still starting up can be waited for.
    pub fn new<C: Connector + 'static>(connector: C, settings: PoolSettings) -> Result<Self, DbError> {
        let first = Self::connect_with_retries(&connector, &settings)?;
        let mut state = PoolState::default();
        let now = Instant::now();
        state.idle.push_back(IdleConnection {
            connection: first,
            since: now,
        });
        for _ in 1..settings.min_size {
            state.idle.push_back(IdleConnection {
                connection: connector.connect()?,
                since: now,
            });
        }
        // We may have opened one more than the pool wants to keep
        state.idle.truncate(settings.max_size.max(settings.min_size));
        tracing::debug!(
            "Opened connection pool to {} with {} idle connection(s)",
            connector.describe(),
            state.idle.len()
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                connector: Box::new(connector),
                settings,
                state: Mutex::new(state),
                available: Condvar::new(),
            }),
        })
    }

    fn connect_with_retries(
        connector: &dyn Connector,
        settings: &PoolSettings,
    ) -> Result<Connection, DbError> {
        let mut attempt = 0;
        loop {
            match connector.connect() {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    if settings.max_retries >= 0 && attempt >= settings.max_retries {
                        tracing::error!(
                            "Giving up on {} after {} attempt(s): {:?}",
                            connector.describe(),
                            attempt + 1,
                            e
                        );
                        return Err(e);
                    }
                    attempt += 1;
                    tracing::warn!(
                        "Connection to {} failed ({:?}), retrying in {}s",
                        connector.describe(),
                        e,
                        settings.retry_interval.as_secs()
                    );
                    std::thread::sleep(settings.retry_interval);
                }
            }
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock().expect("Poisoned");
        PoolStatus {
            idle: state.idle.len(),
            checked_out: state.checked_out,
        }
    }

    /// Check out a connection, waiting up to the pool timeout for one to become available.
    pub fn get(&self) -> Result<PooledConnection, DbError> {
        let settings = &self.inner.settings;
        let limit = settings.max_size + settings.max_overflow;
        let deadline = Instant::now() + settings.timeout;
        let mut state = self.inner.state.lock().expect("Poisoned");
        loop {
            // Most recently returned first, so the oldest ones age out
            while let Some(idle) = state.idle.pop_back() {
                if idle.since.elapsed() >= settings.idle_timeout {
                    tracing::debug!("Discarding idle connection to {}", self.inner.connector.describe());
                    continue;
                }
                state.checked_out += 1;
                return Ok(PooledConnection::new(self.inner.clone(), idle.connection));
            }

            if state.checked_out < limit {
                state.checked_out += 1;
                drop(state);
                return match self.inner.connector.connect() {
                    Ok(connection) => Ok(PooledConnection::new(self.inner.clone(), connection)),
                    Err(e) => {
                        let mut state = self.inner.state.lock().expect("Poisoned");
                        state.checked_out -= 1;
                        self.inner.available.notify_one();
                        Err(e)
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(
                    "Timed out waiting for a connection to {} ({} checked out)",
                    self.inner.connector.describe(),
                    state.checked_out
                );
                return Err(DbError::PoolTimeout(settings.timeout));
            }
            let (guard, _) = self
                .inner
                .available
                .wait_timeout(state, deadline - now)
                .expect("Poisoned");
            state = guard;
        }
    }
}

/// A connection on loan from a pool. It goes back to the pool when dropped.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    connection: Option<Connection>,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, connection: Connection) -> Self {
        Self {
            pool,
            connection: Some(connection),
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref().expect("Connection already returned")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut().expect("Connection already returned")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}
