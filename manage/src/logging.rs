use std::{fs::OpenOptions, sync::Mutex};

use stories_application::config::DefaultConfig;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::ManageError;

/// The environment variable consulted when `--log` is not given.
pub const LOG_ENV_VAR: &str = "STORIES_LOG";

pub fn default_level(config: &DefaultConfig) -> LevelFilter {
    if config.debug {
        LevelFilter::DEBUG
    } else if config.verbose {
        LevelFilter::INFO
    } else {
        LevelFilter::WARN
    }
}

pub fn env_filter(log: Option<&str>, config: &DefaultConfig) -> Result<EnvFilter, ManageError> {
    let default_directive = default_level(config).into();
    let filter = if let Some(log) = log {
        EnvFilter::builder()
            .with_default_directive(default_directive)
            .parse(log)?
    } else {
        EnvFilter::builder()
            .with_default_directive(default_directive)
            .with_env_var(LOG_ENV_VAR)
            .from_env()?
    };
    Ok(filter)
}

/// Initialize logging using either the environment variable or --log option, writing to `log_file` if one
/// is configured.
pub fn init(log: Option<&str>, config: &DefaultConfig) -> Result<(), ManageError> {
    let env_filter = env_filter(log, config)?;
    match config.log_path() {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
            tracing::info!("Logging initialized, writing to {}", path.to_string_lossy());
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
            tracing::info!("Logging initialized");
        }
    }
    Ok(())
}
