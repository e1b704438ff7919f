use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

mod engine;
pub mod migration;
mod models;
mod pool;
mod schema;
mod store;
mod url;

pub use engine::{Engine, SqlEcho, SqliteConnector, StatementLog};
pub use models::{
    Branch, BranchStatus, Comment, Group, Milestone, Model, Project, Story, StoryPriority, StoryTag,
    Task, TaskStatus, Team, User,
};
pub use pool::{ConnectionPool, Connector, PoolSettings, PoolStatus, PooledConnection};
pub use schema::{Column, ColumnType, ForeignKey, Table, UniqueConstraint};
pub use store::ModelStore;
pub use url::{DatabaseUrl, Dialect, SqliteLocation};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error")]
    SQLiteError(#[from] rusqlite::Error),
    #[error("Serialize/deserialize error")]
    SerdeError(#[from] serde_rusqlite::Error),
    #[error("JSON error")]
    JsonError(#[from] serde_json::Error),
    #[error("I/O error")]
    IOError(#[from] std::io::Error),
    #[error("Configuration error")]
    ConfigError(#[from] ConfigError),
    #[error("Invalid database URL {0:?}: {1}")]
    InvalidUrl(String, String),
    #[error("Unsupported database backend {0:?}")]
    UnsupportedBackend(String),
    #[error("Cannot open a connection to a {0} database, only sqlite is supported online")]
    NotConnectable(Dialect),
    #[error("Timed out after {0:?} waiting for a database connection")]
    PoolTimeout(Duration),
    #[error("Unexpected error")]
    UnexpectedError(String),
}
