//! Runtime configuration, read from `stories.conf`.
use std::{
    fmt::{Debug, Display},
    path::{Path, PathBuf},
    str::FromStr,
};

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

mod ini;
mod opts;

pub use ini::{Ini, IniSection, DEFAULT_SECTION};
pub use opts::{render_sample, OptDef, OptKind, DATABASE_SECTION, KEYSTONE_SECTION, OPTIONS};

use crate::db::DatabaseUrl;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {0}")]
    ReadError(PathBuf, #[source] std::io::Error),
    #[error("{source_name}:{line}: {message}")]
    ParseError {
        source_name: String,
        line: usize,
        message: String,
    },
    #[error("Invalid value {value:?} for option {option} in group [{section}]: {reason}")]
    InvalidValue {
        section: String,
        option: String,
        value: String,
        reason: String,
    },
    #[error("Could not interpolate option {option} in group [{section}]: {reason}")]
    InterpolationError {
        section: String,
        option: String,
        reason: String,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A string that must never end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("****")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthStrategy {
    Keystone,
    NoAuth,
}

impl FromStr for AuthStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keystone" => Ok(Self::Keystone),
            "noauth" => Ok(Self::NoAuth),
            _ => Err("expected one of: keystone, noauth".into()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthProtocol {
    Http,
    Https,
}

impl FromStr for AuthProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            _ => Err("expected one of: http, https".into()),
        }
    }
}

impl Display for AuthProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Http => "http",
            Self::Https => "https",
        })
    }
}

/// Options from the `[DEFAULT]` group.
#[derive(Clone, Debug)]
pub struct DefaultConfig {
    pub verbose: bool,
    pub debug: bool,
    pub log_file: Option<String>,
    pub log_dir: Option<String>,
    pub state_path: PathBuf,
    pub bind_host: String,
    pub bind_port: u16,
    pub auth_strategy: AuthStrategy,
    pub lock_path: Option<PathBuf>,
}

impl DefaultConfig {
    /// The full path of the log file, if logging to a file was requested.
    pub fn log_path(&self) -> Option<PathBuf> {
        let file = self.log_file.as_ref()?;
        Some(match &self.log_dir {
            Some(dir) => Path::new(dir).join(file),
            None => PathBuf::from(file),
        })
    }
}

/// Options from the `[keystone_authtoken]` group.
#[derive(Clone, Debug)]
pub struct KeystoneAuthConfig {
    pub auth_host: String,
    pub auth_port: u16,
    pub auth_protocol: AuthProtocol,
    pub admin_tenant_name: Option<String>,
    pub admin_user: Option<String>,
    pub admin_password: Option<Secret>,
    pub signing_dir: Option<PathBuf>,
}

impl KeystoneAuthConfig {
    pub fn identity_uri(&self) -> String {
        format!("{}://{}:{}", self.auth_protocol, self.auth_host, self.auth_port)
    }
}

/// Options from the `[database]` group.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub connection: String,
    pub slave_connection: Option<String>,
    pub sqlite_synchronous: bool,
    pub mysql_engine: String,
    /// Negative means retry forever.
    pub max_retries: i32,
    pub retry_interval: u64,
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub max_overflow: Option<usize>,
    pub pool_timeout: Option<u64>,
    pub idle_timeout: u64,
    pub connection_debug: u8,
    pub connection_trace: bool,
}

/// Show a connection string with its password masked.
fn mask_connection(connection: &str) -> String {
    DatabaseUrl::parse(connection)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| "****".to_owned())
}

impl Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("connection", &mask_connection(&self.connection))
            .field(
                "slave_connection",
                &self.slave_connection.as_deref().map(mask_connection),
            )
            .field("sqlite_synchronous", &self.sqlite_synchronous)
            .field("mysql_engine", &self.mysql_engine)
            .field("max_retries", &self.max_retries)
            .field("retry_interval", &self.retry_interval)
            .field("min_pool_size", &self.min_pool_size)
            .field("max_pool_size", &self.max_pool_size)
            .field("max_overflow", &self.max_overflow)
            .field("pool_timeout", &self.pool_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("connection_debug", &self.connection_debug)
            .field("connection_trace", &self.connection_trace)
            .finish()
    }
}

impl DatabaseConfig {
    /// Database settings for a connection string, with every other option at its default.
    pub fn for_connection(connection: &str) -> Result<Self, ConfigError> {
        let mut config = StoriesConfig::from_ini(&Ini::default())?.database;
        config.connection = connection.to_owned();
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pool_size == 0 {
            return Err(ConfigError::Invalid("max_pool_size must be at least 1".into()));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(ConfigError::Invalid(format!(
                "min_pool_size ({}) must not exceed max_pool_size ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.connection_debug > 100 {
            return Err(ConfigError::Invalid(
                "connection_debug must be between 0 and 100".into(),
            ));
        }
        Ok(())
    }
}

/// The complete service configuration.
#[derive(Clone)]
pub struct StoriesConfig {
    pub default: DefaultConfig,
    pub keystone_authtoken: KeystoneAuthConfig,
    pub database: DatabaseConfig,
    /// Effective value of every registered option, for logging.
    values: Vec<(&'static OptDef, Option<String>)>,
    /// `(group, option)` pairs present in the files but not registered.
    unknown_options: Vec<(String, String)>,
    /// Files the configuration was read from, in override order.
    sources: Vec<PathBuf>,
}

lazy_static! {
    static ref INTERPOLATION: Regex =
        Regex::new(r"\$(\$|\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
            .expect("Invalid interpolation regex");
}

const BOOL_TRUE: &[&str] = &["true", "yes", "on", "1"];
const BOOL_FALSE: &[&str] = &["false", "no", "off", "0"];

/// Reads typed, interpolated option values from parsed INI data plus registry defaults.
struct OptionReader<'a> {
    ini: &'a Ini,
}

impl<'a> OptionReader<'a> {
    fn raw(&self, section: &str, name: &str) -> Option<String> {
        if let Some(value) = self.ini.get(section, name) {
            return Some(value.to_owned());
        }
        opts::lookup(section, name)
            .or_else(|| opts::lookup(DEFAULT_SECTION, name))
            .and_then(|opt| opt.default)
            .map(|s| s.to_owned())
    }

    fn interpolate(
        &self,
        section: &str,
        name: &str,
        value: &str,
        stack: &mut Vec<String>,
    ) -> Result<String, ConfigError> {
        let error = |reason: String| ConfigError::InterpolationError {
            section: section.to_owned(),
            option: name.to_owned(),
            reason,
        };

        let mut out = String::new();
        let mut last = 0;
        for captures in INTERPOLATION.captures_iter(value) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            out.push_str(&value[last..whole.start()]);
            last = whole.end();
            let Some(reference) = captures.get(2).or_else(|| captures.get(3)) else {
                out.push('$');
                continue;
            };
            let reference = reference.as_str();
            if stack.iter().any(|s| s == reference) {
                return Err(error(format!("interpolation cycle through ${}", reference)));
            }
            let Some(referenced) = self.raw(section, reference) else {
                return Err(error(format!("unknown option ${}", reference)));
            };
            stack.push(reference.to_owned());
            let resolved = self.interpolate(section, reference, &referenced, stack)?;
            stack.pop();
            out.push_str(&resolved);
        }
        out.push_str(&value[last..]);
        Ok(out)
    }

    fn string(&self, section: &str, name: &str) -> Result<Option<String>, ConfigError> {
        match self.raw(section, name) {
            Some(value) => {
                let mut stack = vec![name.to_owned()];
                Ok(Some(self.interpolate(section, name, &value, &mut stack)?))
            }
            None => Ok(None),
        }
    }

    fn required(&self, section: &str, name: &str) -> Result<String, ConfigError> {
        self.string(section, name)?.ok_or_else(|| ConfigError::InvalidValue {
            section: section.to_owned(),
            option: name.to_owned(),
            value: String::new(),
            reason: "a value is required".into(),
        })
    }

    fn invalid(section: &str, name: &str, value: &str, reason: impl Display) -> ConfigError {
        ConfigError::InvalidValue {
            section: section.to_owned(),
            option: name.to_owned(),
            value: value.to_owned(),
            reason: reason.to_string(),
        }
    }

    fn parsed<T: FromStr>(&self, section: &str, name: &str) -> Result<Option<T>, ConfigError>
    where
        T::Err: Display,
    {
        match self.string(section, name)? {
            Some(value) if value.is_empty() => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|e| Self::invalid(section, name, &value, e)),
            None => Ok(None),
        }
    }

    fn parsed_required<T: FromStr>(&self, section: &str, name: &str) -> Result<T, ConfigError>
    where
        T::Err: Display,
    {
        let value = self.required(section, name)?;
        value
            .parse()
            .map_err(|e| Self::invalid(section, name, &value, e))
    }

    fn bool(&self, section: &str, name: &str) -> Result<bool, ConfigError> {
        let value = self.required(section, name)?;
        let lower = value.to_ascii_lowercase();
        if BOOL_TRUE.contains(&lower.as_str()) {
            Ok(true)
        } else if BOOL_FALSE.contains(&lower.as_str()) {
            Ok(false)
        } else {
            Err(Self::invalid(section, name, &value, "expected a boolean"))
        }
    }

    /// Unset and empty both mean "no value".
    fn optional(&self, section: &str, name: &str) -> Result<Option<String>, ConfigError> {
        Ok(self.string(section, name)?.filter(|s| !s.is_empty()))
    }
}

impl StoriesConfig {
    /// Default locations searched when no configuration file is given, in priority order.
    pub fn default_config_files() -> Vec<PathBuf> {
        let mut files = vec![PathBuf::from("stories.conf")];
        if let Some(home) = std::env::var_os("HOME") {
            let home = PathBuf::from(home);
            files.push(home.join(".stories").join("stories.conf"));
            files.push(home.join("stories.conf"));
        }
        files.push(PathBuf::from("/etc/stories/stories.conf"));
        files.push(PathBuf::from("/etc/stories.conf"));
        files
    }

    pub fn find_config_file() -> Option<PathBuf> {
        Self::default_config_files()
            .into_iter()
            .find(|path| path.is_file())
    }

    /// Load and overlay the given files, in order. With no files, the default locations are searched.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ConfigError> {
        let sources = if paths.is_empty() {
            Self::find_config_file().into_iter().collect::<Vec<_>>()
        } else {
            paths.iter().map(|p| p.as_ref().to_owned()).collect()
        };
        let mut ini = Ini::default();
        for path in &sources {
            ini.merge(Ini::load(path)?);
        }
        let mut config = Self::from_ini(&ini)?;
        config.sources = sources;
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Self::from_ini(&Ini::parse("<string>", text)?)
    }

    /// Build the configuration from parsed INI data. Nothing is logged here since this usually runs before
    /// logging is set up; see [`StoriesConfig::log_values`].
    pub fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut unknown_options = vec![];
        for section in ini.sections() {
            if !opts::is_known_section(section.name()) {
                continue;
            }
            for key in section.keys() {
                // DEFAULT options are visible from every group, so only flag truly unknown names
                if opts::lookup(section.name(), key).is_none()
                    && opts::lookup(DEFAULT_SECTION, key).is_none()
                {
                    unknown_options.push((section.name().to_owned(), key.to_owned()));
                }
            }
        }

        let r = OptionReader { ini };

        let d = DEFAULT_SECTION;
        let default = DefaultConfig {
            verbose: r.bool(d, "verbose")?,
            debug: r.bool(d, "debug")?,
            log_file: r.optional(d, "log_file")?,
            log_dir: r.optional(d, "log_dir")?,
            state_path: PathBuf::from(r.required(d, "state_path")?),
            bind_host: r.required(d, "bind_host")?,
            bind_port: r.parsed_required(d, "bind_port")?,
            auth_strategy: r.parsed_required(d, "auth_strategy")?,
            lock_path: r.optional(d, "lock_path")?.map(PathBuf::from),
        };

        let k = KEYSTONE_SECTION;
        let keystone_authtoken = KeystoneAuthConfig {
            auth_host: r.required(k, "auth_host")?,
            auth_port: r.parsed_required(k, "auth_port")?,
            auth_protocol: r.parsed_required(k, "auth_protocol")?,
            admin_tenant_name: r.optional(k, "admin_tenant_name")?,
            admin_user: r.optional(k, "admin_user")?,
            admin_password: r.optional(k, "admin_password")?.map(Secret::new),
            signing_dir: r.optional(k, "signing_dir")?.map(PathBuf::from),
        };

        let db = DATABASE_SECTION;
        let database = DatabaseConfig {
            connection: r.required(db, "connection")?,
            slave_connection: r.optional(db, "slave_connection")?,
            sqlite_synchronous: r.bool(db, "sqlite_synchronous")?,
            mysql_engine: r.required(db, "mysql_engine")?,
            max_retries: r.parsed_required(db, "max_retries")?,
            retry_interval: r.parsed_required(db, "retry_interval")?,
            min_pool_size: r.parsed_required(db, "min_pool_size")?,
            max_pool_size: r.parsed_required(db, "max_pool_size")?,
            max_overflow: r.parsed(db, "max_overflow")?,
            pool_timeout: r.parsed(db, "pool_timeout")?,
            idle_timeout: r.parsed_required(db, "idle_timeout")?,
            connection_debug: r.parsed_required(db, "connection_debug")?,
            connection_trace: r.bool(db, "connection_trace")?,
        };
        database.validate()?;

        let mut values = vec![];
        for opt in OPTIONS {
            values.push((opt, r.optional(opt.section, opt.name)?));
        }

        Ok(Self {
            default,
            keystone_authtoken,
            database,
            values,
            unknown_options,
            sources: vec![],
        })
    }

    pub fn unknown_options(&self) -> &[(String, String)] {
        &self.unknown_options
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Replace `[database] connection`, keeping the logged values in step.
    pub fn set_database_connection(&mut self, connection: impl Into<String>) {
        let connection = connection.into();
        for (opt, value) in &mut self.values {
            if opt.section == DATABASE_SECTION && opt.name == "connection" {
                *value = Some(connection.clone());
            }
        }
        self.database.connection = connection;
    }

    /// Effective option values, with secrets masked.
    pub fn option_values(&self) -> Vec<(String, String)> {
        self.values
            .iter()
            .map(|(opt, value)| {
                let shown = match value {
                    None => "None".to_owned(),
                    // Connection strings are only partly secret: show everything but the password
                    Some(v) if opt.section == DATABASE_SECTION && opt.name.ends_with("connection") => {
                        mask_connection(v)
                    }
                    Some(_) if opt.secret => "****".to_owned(),
                    Some(v) => v.clone(),
                };
                (format!("{}.{}", opt.section, opt.name), shown)
            })
            .collect()
    }

    /// Report where the configuration came from and any unknown options, then log every option value at
    /// debug level.
    pub fn log_values(&self) {
        if self.sources.is_empty() {
            tracing::info!("No configuration file found, using defaults");
        }
        for path in &self.sources {
            tracing::info!("Read configuration file {}", path.to_string_lossy());
        }
        for (section, key) in &self.unknown_options {
            tracing::warn!("Ignoring unknown option {} in group [{}]", key, section);
        }
        tracing::debug!("{}", "*".repeat(60));
        tracing::debug!("Configuration options:");
        for (name, value) in self.option_values() {
            tracing::debug!("{:<40} = {}", name, value);
        }
        tracing::debug!("{}", "*".repeat(60));
    }
}

impl Debug for StoriesConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.option_values()).finish()
    }
}
