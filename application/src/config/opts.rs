//! The registry of every option the service understands, and the sample configuration rendered from it.
use itertools::Itertools;

use super::ini::DEFAULT_SECTION;

pub const KEYSTONE_SECTION: &str = "keystone_authtoken";
pub const DATABASE_SECTION: &str = "database";

/// Sections we know about, in the order they appear in the sample config.
pub const SECTIONS: &[&str] = &[DEFAULT_SECTION, KEYSTONE_SECTION, DATABASE_SECTION];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptKind {
    Str,
    Int,
    Bool,
    Choice(&'static [&'static str]),
}

impl OptKind {
    fn describe(&self) -> String {
        match self {
            OptKind::Str => "string value".into(),
            OptKind::Int => "integer value".into(),
            OptKind::Bool => "boolean value".into(),
            OptKind::Choice(choices) => format!("string value, one of: {}", choices.join(", ")),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct OptDef {
    pub section: &'static str,
    pub name: &'static str,
    pub kind: OptKind,
    pub default: Option<&'static str>,
    pub help: &'static str,
    /// Secret values are masked whenever they are logged.
    pub secret: bool,
}

macro_rules! opts {
    (@secret secret) => { true };
    (@secret) => { false };
    ($( $section:expr => [ $( ($name:literal, $kind:expr, $default:expr, $help:literal $(, $secret:ident)?) ),* $(,)? ] ),* $(,)?) => {
        &[ $( $( OptDef {
            section: $section,
            name: $name,
            kind: $kind,
            default: $default,
            help: $help,
            secret: opts!(@secret $($secret)?),
        }, )* )* ]
    };
}

pub const OPTIONS: &[OptDef] = opts!(
    DEFAULT_SECTION => [
        ("verbose", OptKind::Bool, Some("false"), "Print more verbose output (set logging level to INFO instead of the default WARNING level)."),
        ("debug", OptKind::Bool, Some("false"), "Print debugging output (set logging level to DEBUG instead of the default WARNING level)."),
        ("log_file", OptKind::Str, None, "Name of the log file to send logging output to. If no default is set, logging will go to stderr."),
        ("log_dir", OptKind::Str, None, "Directory in which log_file is placed."),
        ("state_path", OptKind::Str, Some("."), "Top-level directory for maintaining service state."),
        ("bind_host", OptKind::Str, Some("0.0.0.0"), "Address to bind the API server to."),
        ("bind_port", OptKind::Int, Some("8080"), "Port to bind the API server to."),
        ("auth_strategy", OptKind::Choice(&["keystone", "noauth"]), Some("keystone"), "The strategy to use for authentication."),
        ("lock_path", OptKind::Str, None, "Directory to use for lock files."),
    ],
    KEYSTONE_SECTION => [
        ("auth_host", OptKind::Str, Some("127.0.0.1"), "Host providing the admin Identity API endpoint."),
        ("auth_port", OptKind::Int, Some("35357"), "Port of the admin Identity API endpoint."),
        ("auth_protocol", OptKind::Choice(&["http", "https"]), Some("http"), "Protocol of the admin Identity API endpoint."),
        ("admin_tenant_name", OptKind::Str, None, "Keystone service account tenant name to validate user tokens."),
        ("admin_user", OptKind::Str, None, "Keystone account username."),
        ("admin_password", OptKind::Str, None, "Keystone account password.", secret),
        ("signing_dir", OptKind::Str, None, "Directory used to cache files related to PKI tokens."),
    ],
    DATABASE_SECTION => [
        ("connection", OptKind::Str, Some("sqlite:///$state_path/stories.sqlite"), "The connection string used to connect to the database.", secret),
        ("slave_connection", OptKind::Str, None, "The connection string used to connect to the slave database.", secret),
        ("sqlite_synchronous", OptKind::Bool, Some("true"), "If true, use synchronous mode for sqlite."),
        ("mysql_engine", OptKind::Str, Some("InnoDB"), "MySQL storage engine used when creating tables."),
        ("max_retries", OptKind::Int, Some("10"), "Maximum db connection retries during startup (setting -1 implies an infinite retry count)."),
        ("retry_interval", OptKind::Int, Some("10"), "Interval between retries of opening a database connection, in seconds."),
        ("min_pool_size", OptKind::Int, Some("1"), "Minimum number of SQL connections to keep open in a pool."),
        ("max_pool_size", OptKind::Int, Some("5"), "Maximum number of SQL connections to keep open in a pool."),
        ("max_overflow", OptKind::Int, None, "If set, use this value for max_overflow with the connection pool."),
        ("pool_timeout", OptKind::Int, None, "If set, use this value for pool_timeout with the connection pool, in seconds."),
        ("idle_timeout", OptKind::Int, Some("3600"), "Timeout before idle SQL connections are reaped, in seconds."),
        ("connection_debug", OptKind::Int, Some("0"), "Verbosity of SQL debugging information. 0=None, 100=Everything."),
        ("connection_trace", OptKind::Bool, Some("false"), "Add the calling source location to SQL statements as a comment."),
    ],
);

pub fn lookup(section: &str, name: &str) -> Option<&'static OptDef> {
    OPTIONS
        .iter()
        .find(|opt| opt.section == section && opt.name == name)
}

pub fn is_known_section(section: &str) -> bool {
    SECTIONS.contains(&section)
}

fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = vec![];
    let mut line = String::new();
    for word in text.split_whitespace() {
        if !line.is_empty() && line.len() + word.len() + 1 > width {
            lines.push(std::mem::take(&mut line));
        }
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(word);
    }
    if !line.is_empty() {
        lines.push(line);
    }
    lines
}

/// Render a configuration file with every option commented out at its default.
pub fn render_sample() -> String {
    let mut out = String::new();
    for section in SECTIONS {
        out += &format!("[{}]\n\n", section);
        let body = OPTIONS
            .iter()
            .filter(|opt| opt.section == *section)
            .map(|opt| {
                let help = format!("{} ({})", opt.help, opt.kind.describe());
                let mut s = wrap(&help, 70)
                    .into_iter()
                    .map(|line| format!("# {}\n", line))
                    .join("");
                s += &format!("#{}={}\n", opt.name, opt.default.unwrap_or(""));
                s
            })
            .join("\n");
        out += &body;
        out += "\n";
    }
    out.truncate(out.trim_end().len());
    out.push('\n');
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Ini;

    #[test]
    fn options_are_unique() {
        for (i, a) in OPTIONS.iter().enumerate() {
            for b in &OPTIONS[i + 1..] {
                assert!(
                    a.section != b.section || a.name != b.name,
                    "duplicate option {}.{}",
                    a.section,
                    a.name
                );
            }
        }
    }

    #[test]
    fn every_option_in_known_section() {
        for opt in OPTIONS {
            assert!(is_known_section(opt.section), "{} has an unknown section", opt.name);
        }
    }

    #[test]
    fn sample_is_all_comments() -> Result<(), Box<dyn std::error::Error>> {
        let sample = render_sample();
        let ini = Ini::parse("sample", &sample)?;
        let names = ini.sections().iter().map(|s| s.name()).collect::<Vec<_>>();
        assert_eq!(names, SECTIONS.to_vec());
        assert!(ini.sections().iter().all(|s| s.keys().next().is_none()));
        assert!(sample.contains("#max_pool_size=5\n"));
        assert!(sample.contains("#admin_password=\n"));
        Ok(())
    }

    #[test]
    fn shipped_sample_matches_registry() {
        let shipped = include_str!("../../../etc/stories.conf");
        assert_eq!(shipped, render_sample());
    }

    #[test]
    fn wrap_respects_width() {
        let lines = wrap("one two three four five six seven", 10);
        assert_eq!(lines, vec!["one two", "three four", "five six", "seven"]);
    }
}
