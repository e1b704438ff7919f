use std::{
    borrow::Cow,
    panic::Location,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use rusqlite::{Connection, OpenFlags};

use super::{
    pool::{ConnectionPool, Connector, PoolSettings, PooledConnection},
    DatabaseUrl, DbError, Dialect, SqliteLocation,
};
use crate::config::DatabaseConfig;

static MEMORY_DB_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Opens SQLite connections configured the way the service expects.
pub struct SqliteConnector {
    target: SqliteTarget,
    synchronous: bool,
    /// In-memory databases vanish with their last connection, so we hold one open for the engine's lifetime.
    _keeper: Option<Mutex<Connection>>,
}

enum SqliteTarget {
    SharedMemory(String),
    File(PathBuf),
}

impl SqliteConnector {
    pub fn new(location: &SqliteLocation, synchronous: bool) -> Result<Self, DbError> {
        let (target, keeper) = match location {
            SqliteLocation::Memory => {
                let name = format!(
                    "file:stories-memory-{}-{}?mode=memory&cache=shared",
                    std::process::id(),
                    MEMORY_DB_COUNTER.fetch_add(1, Ordering::SeqCst)
                );
                let target = SqliteTarget::SharedMemory(name);
                let keeper = Self::open(&target, synchronous)?;
                (target, Some(Mutex::new(keeper)))
            }
            SqliteLocation::Path(path) => (SqliteTarget::File(path.clone()), None),
        };
        Ok(Self {
            target,
            synchronous,
            _keeper: keeper,
        })
    }

    fn open(target: &SqliteTarget, synchronous: bool) -> Result<Connection, DbError> {
        let connection = match target {
            SqliteTarget::SharedMemory(uri) => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?,
            SqliteTarget::File(path) => {
                let connection = Connection::open(path)?;
                // Force each on-disk DB into WAL mode
                let _mode: String = connection.pragma_update_and_check(
                    None,
                    "journal_mode",
                    "WAL",
                    |row| row.get(0),
                )?;
                connection
            }
        };
        connection.pragma_update(None, "foreign_keys", true)?;
        connection.pragma_update(None, "synchronous", if synchronous { 2 } else { 0 })?;
        Ok(connection)
    }
}

impl Connector for SqliteConnector {
    fn connect(&self) -> Result<Connection, DbError> {
        Self::open(&self.target, self.synchronous)
    }

    fn describe(&self) -> String {
        match &self.target {
            SqliteTarget::SharedMemory(..) => "sqlite in-memory database".into(),
            SqliteTarget::File(path) => format!("sqlite database {}", path.to_string_lossy()),
        }
    }
}

/// How loudly executed SQL is echoed to the log, from `connection_debug`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SqlEcho {
    Off,
    Info,
    Debug,
}

impl SqlEcho {
    pub fn from_connection_debug(level: u8) -> Self {
        match level {
            100.. => Self::Debug,
            50..=99 => Self::Info,
            _ => Self::Off,
        }
    }
}

/// Decorates and echoes SQL statements according to `connection_debug` and `connection_trace`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatementLog {
    pub echo: SqlEcho,
    pub trace: bool,
}

impl StatementLog {
    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self {
            echo: SqlEcho::from_connection_debug(config.connection_debug),
            trace: config.connection_trace,
        }
    }

    /// Append the originating source location as a comment, if tracing is on.
    pub fn annotate<'a>(&self, sql: &'a str, location: &Location<'_>) -> Cow<'a, str> {
        if self.trace {
            Cow::Owned(format!(
                "{} /* {}:{} */",
                sql.trim_end().trim_end_matches(';'),
                location.file(),
                location.line()
            ))
        } else {
            Cow::Borrowed(sql)
        }
    }

    pub fn echo(&self, sql: &str) {
        match self.echo {
            SqlEcho::Off => {}
            SqlEcho::Info => tracing::info!("{}", sql),
            SqlEcho::Debug => tracing::debug!("{}", sql),
        }
    }
}

/// Connection pools for the primary database and, optionally, a read-only replica.
pub struct Engine {
    url: DatabaseUrl,
    pool: ConnectionPool,
    reader: Option<ConnectionPool>,
    statements: StatementLog,
    mysql_engine: String,
}

impl Engine {
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, DbError> {
        let url = DatabaseUrl::parse(&config.connection)?;
        tracing::info!("Connecting to {}", url);
        let settings = PoolSettings::from_config(config);
        let pool = Self::open_pool(&url, config, settings.clone())?;
        let reader = match &config.slave_connection {
            Some(slave) => {
                let slave_url = DatabaseUrl::parse(slave)?;
                tracing::info!("Connecting to slave database {}", slave_url);
                Some(Self::open_pool(&slave_url, config, settings)?)
            }
            None => None,
        };
        Ok(Self {
            url,
            pool,
            reader,
            statements: StatementLog::from_config(config),
            mysql_engine: config.mysql_engine.clone(),
        })
    }

    fn open_pool(
        url: &DatabaseUrl,
        config: &DatabaseConfig,
        settings: PoolSettings,
    ) -> Result<ConnectionPool, DbError> {
        match url.sqlite_location() {
            Some(location) => ConnectionPool::new(
                SqliteConnector::new(location, config.sqlite_synchronous)?,
                settings,
            ),
            None => Err(DbError::NotConnectable(url.dialect())),
        }
    }

    pub fn url(&self) -> &DatabaseUrl {
        &self.url
    }

    pub fn dialect(&self) -> Dialect {
        self.url.dialect()
    }

    pub fn statements(&self) -> StatementLog {
        self.statements
    }

    pub fn mysql_engine(&self) -> &str {
        &self.mysql_engine
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// A read-write connection to the primary database.
    pub fn connect(&self) -> Result<PooledConnection, DbError> {
        self.pool.get()
    }

    /// A connection for reads, from the slave database if one is configured.
    pub fn reader(&self) -> Result<PooledConnection, DbError> {
        self.reader.as_ref().unwrap_or(&self.pool).get()
    }
}
