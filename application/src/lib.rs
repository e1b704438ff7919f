pub mod config;
pub mod db;

#[cfg(test)]
mod test;

pub use config::{ConfigError, DatabaseConfig, StoriesConfig};
pub use db::migration::{MigrationError, Migrator, OfflineScript, ScriptDirectory};
pub use db::{DbError, Engine, ModelStore};
