//! Schema migrations: an ordered chain of revisions, each able to upgrade and downgrade the schema, and a
//! version table recording which revision a database is at.
use std::fmt::Display;

use itertools::Itertools;
use thiserror::Error;

use super::DbError;

mod ops;
mod runner;
mod versions;

pub use ops::{Operations, ScriptSink, SqlSink};
pub use runner::{Migrator, OfflineScript, VERSION_TABLE};

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Database error")]
    DbError(#[from] DbError),
    #[error("SQLite error")]
    SQLiteError(#[from] rusqlite::Error),
    #[error("No revisions are defined")]
    NoRevisions,
    #[error("Revision {0} is defined more than once")]
    DuplicateRevision(String),
    #[error("Revision {revision} revises unknown revision {down_revision}")]
    MissingDownRevision {
        revision: String,
        down_revision: String,
    },
    #[error("Revision chain has multiple bases: {0:?}")]
    MultipleBases(Vec<String>),
    #[error("Revision chain branches after {0}: {1:?}")]
    MultipleHeads(String, Vec<String>),
    #[error("Revision chain contains a cycle")]
    Cycle,
    #[error("Can't locate revision identified by {0:?}")]
    UnknownRevision(String),
    #[error("Multiple revisions start with {0:?}: {1:?}")]
    AmbiguousRevision(String, Vec<String>),
    #[error("Invalid revision target {0:?}: {1}")]
    InvalidTarget(String, String),
    #[error("Cannot {direction} from {current} to {target}")]
    WrongDirection {
        direction: &'static str,
        current: String,
        target: String,
    },
    #[error(
        "Database is not under version control but already contains tables; use 'stamp' to mark its revision"
    )]
    NotControlled,
    #[error("Offline {0} requires a revision range of the form <start>:<end>")]
    RangeRequired(&'static str),
}

/// A single schema revision.
pub trait Migration: Send + Sync {
    fn revision(&self) -> &'static str;

    /// The revision this one applies on top of, `None` for the first revision.
    fn down_revision(&self) -> Option<&'static str>;

    fn message(&self) -> &'static str;

    fn create_date(&self) -> &'static str;

    fn upgrade(&self, op: &mut Operations) -> Result<(), MigrationError>;

    fn downgrade(&self, op: &mut Operations) -> Result<(), MigrationError>;
}

/// Shows a position in the chain: `base` or a revision id.
fn position_name(revision: Option<&dyn Migration>) -> String {
    revision
        .map(|r| r.revision().to_owned())
        .unwrap_or_else(|| "base".to_owned())
}

/// One line of `history` output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    pub down_revision: Option<String>,
    pub revision: String,
    pub message: String,
    pub create_date: String,
    pub is_head: bool,
    pub is_current: bool,
}

impl Display for HistoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.down_revision.as_deref().unwrap_or("<base>"),
            self.revision
        )?;
        if self.is_head {
            f.write_str(" (head)")?;
        }
        if self.is_current {
            f.write_str(" (current)")?;
        }
        write!(f, ", {}", self.message)
    }
}

/// A validated, linear chain of revisions.
///
/// Positions in the chain count applied revisions: position 0 is `base`, and position `n` means the first `n`
/// revisions are applied.
pub struct ScriptDirectory {
    revisions: Vec<Box<dyn Migration>>,
}

impl ScriptDirectory {
    /// Validate and order a set of revisions from base to head.
    pub fn new(migrations: Vec<Box<dyn Migration>>) -> Result<Self, MigrationError> {
        if migrations.is_empty() {
            return Err(MigrationError::NoRevisions);
        }
        if let Some(duplicate) = migrations
            .iter()
            .map(|m| m.revision())
            .duplicates()
            .next()
        {
            return Err(MigrationError::DuplicateRevision(duplicate.to_owned()));
        }
        for m in &migrations {
            if let Some(down) = m.down_revision() {
                if !migrations.iter().any(|other| other.revision() == down) {
                    return Err(MigrationError::MissingDownRevision {
                        revision: m.revision().to_owned(),
                        down_revision: down.to_owned(),
                    });
                }
            }
        }
        let bases = migrations
            .iter()
            .filter(|m| m.down_revision().is_none())
            .map(|m| m.revision().to_owned())
            .collect::<Vec<_>>();
        match bases.len() {
            0 => return Err(MigrationError::Cycle),
            1 => {}
            _ => return Err(MigrationError::MultipleBases(bases)),
        }

        let mut remaining = migrations;
        let mut ordered: Vec<Box<dyn Migration>> = vec![];
        let mut parent: Option<&'static str> = None;
        loop {
            let children = remaining
                .iter()
                .positions(|m| m.down_revision() == parent)
                .collect::<Vec<_>>();
            match children.as_slice() {
                [] => break,
                [index] => {
                    let next = remaining.remove(*index);
                    parent = Some(next.revision());
                    ordered.push(next);
                }
                _ => {
                    return Err(MigrationError::MultipleHeads(
                        position_name(ordered.last().map(|m| m.as_ref())),
                        children
                            .iter()
                            .map(|i| remaining[*i].revision().to_owned())
                            .collect(),
                    ));
                }
            }
        }
        // With one base and no branches, anything unreachable must loop back on itself
        if !remaining.is_empty() {
            return Err(MigrationError::Cycle);
        }
        Ok(Self { revisions: ordered })
    }

    /// The revisions shipped with the service.
    pub fn stories() -> Result<Self, MigrationError> {
        Self::new(versions::all())
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    /// Revisions in order from base to head.
    pub fn revisions(&self) -> impl DoubleEndedIterator<Item = &dyn Migration> {
        self.revisions.iter().map(|m| m.as_ref())
    }

    pub fn head(&self) -> &dyn Migration {
        // Construction guarantees at least one revision
        self.revisions[self.revisions.len() - 1].as_ref()
    }

    /// The revision that is current at `position`, `None` at base.
    pub fn at(&self, position: usize) -> Option<&dyn Migration> {
        position
            .checked_sub(1)
            .and_then(|i| self.revisions.get(i))
            .map(|m| m.as_ref())
    }

    /// Find a revision by full id or unique prefix, returning its position.
    pub fn position_of(&self, id: &str) -> Result<usize, MigrationError> {
        if let Some(index) = self.revisions.iter().position(|m| m.revision() == id) {
            return Ok(index + 1);
        }
        let candidates = self
            .revisions
            .iter()
            .enumerate()
            .filter(|(_, m)| m.revision().starts_with(id))
            .collect::<Vec<_>>();
        match candidates.as_slice() {
            [] => Err(MigrationError::UnknownRevision(id.to_owned())),
            [(index, _)] => Ok(index + 1),
            _ => Err(MigrationError::AmbiguousRevision(
                id.to_owned(),
                candidates
                    .iter()
                    .map(|(_, m)| m.revision().to_owned())
                    .collect(),
            )),
        }
    }

    fn relative(&self, target: &str, from: usize, delta: &str, negative: bool) -> Result<usize, MigrationError> {
        let steps = delta.parse::<usize>().map_err(|_| {
            MigrationError::InvalidTarget(target.to_owned(), "expected a number of steps".into())
        })?;
        let position = if negative {
            from.checked_sub(steps)
        } else {
            from.checked_add(steps).filter(|p| *p <= self.len())
        };
        position.ok_or_else(|| {
            MigrationError::InvalidTarget(
                target.to_owned(),
                format!("relative step moves outside base..head from {}", position_name(self.at(from))),
            )
        })
    }

    /// Resolve a target (`head`, `base`, a revision id or prefix, `+N`, `-N`, `head-N`) to a position.
    /// Relative targets count from `current`.
    pub fn resolve(&self, target: &str, current: usize) -> Result<usize, MigrationError> {
        let target = target.trim();
        match target {
            "" => Err(MigrationError::InvalidTarget(target.to_owned(), "empty target".into())),
            "base" => Ok(0),
            "head" | "heads" => Ok(self.len()),
            _ => {
                if let Some(delta) = target.strip_prefix('+') {
                    self.relative(target, current, delta, false)
                } else if let Some(delta) = target.strip_prefix('-') {
                    self.relative(target, current, delta, true)
                } else if let Some(delta) = target.strip_prefix("head-") {
                    self.relative(target, self.len(), delta, true)
                } else {
                    self.position_of(target)
                }
            }
        }
    }

    /// Every revision, head first.
    pub fn history(&self, current: Option<usize>) -> Vec<HistoryEntry> {
        self.revisions
            .iter()
            .enumerate()
            .rev()
            .map(|(index, m)| HistoryEntry {
                down_revision: m.down_revision().map(|s| s.to_owned()),
                revision: m.revision().to_owned(),
                message: m.message().to_owned(),
                create_date: m.create_date().to_owned(),
                is_head: index + 1 == self.len(),
                is_current: current == Some(index + 1),
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use rstest::*;

    use super::*;
    use crate::db::{Column, ColumnType, Table};

    /// A revision that creates (and drops) a single table named after itself.
    pub struct TableRevision {
        pub revision: &'static str,
        pub down_revision: Option<&'static str>,
        pub table: &'static str,
    }

    impl Migration for TableRevision {
        fn revision(&self) -> &'static str {
            self.revision
        }

        fn down_revision(&self) -> Option<&'static str> {
            self.down_revision
        }

        fn message(&self) -> &'static str {
            "create a table"
        }

        fn create_date(&self) -> &'static str {
            "2014-01-01 00:00:00"
        }

        fn upgrade(&self, op: &mut Operations) -> Result<(), MigrationError> {
            op.create_table(
                Table::new(self.table)
                    .column(Column::new("id", ColumnType::Integer).not_null())
                    .primary_key(&["id"]),
            )
        }

        fn downgrade(&self, op: &mut Operations) -> Result<(), MigrationError> {
            op.drop_table(self.table)
        }
    }

    pub fn revision(
        revision: &'static str,
        down_revision: Option<&'static str>,
        table: &'static str,
    ) -> Box<dyn Migration> {
        Box::new(TableRevision {
            revision,
            down_revision,
            table,
        })
    }

    /// Three revisions, deliberately out of order.
    #[fixture]
    pub fn chain() -> ScriptDirectory {
        ScriptDirectory::new(vec![
            revision("c3000000", Some("b2000000"), "third"),
            revision("a1000000", None, "first"),
            revision("b2000000", Some("a1000000"), "second"),
        ])
        .expect("Invalid chain")
    }

    #[rstest]
    fn orders_from_base(chain: ScriptDirectory) {
        let ids = chain.revisions().map(|m| m.revision()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a1000000", "b2000000", "c3000000"]);
        assert_eq!(chain.head().revision(), "c3000000");
        assert_eq!(chain.at(0).map(|m| m.revision()), None);
        assert_eq!(chain.at(1).map(|m| m.revision()), Some("a1000000"));
    }

    #[rstest]
    #[case("base", 1, 0)]
    #[case("head", 0, 3)]
    #[case("heads", 0, 3)]
    #[case("a1000000", 3, 1)]
    #[case("b2", 0, 2)]
    #[case("+1", 1, 2)]
    #[case("+2", 1, 3)]
    #[case("-1", 3, 2)]
    #[case("-3", 3, 0)]
    #[case("head-1", 0, 2)]
    fn resolve_targets(
        chain: ScriptDirectory,
        #[case] target: &str,
        #[case] current: usize,
        #[case] expected: usize,
    ) -> Result<(), MigrationError> {
        assert_eq!(chain.resolve(target, current)?, expected);
        Ok(())
    }

    #[rstest]
    #[case("+3", 1)]
    #[case("-2", 1)]
    #[case("+x", 0)]
    #[case("head-4", 0)]
    #[case("", 0)]
    fn invalid_targets(chain: ScriptDirectory, #[case] target: &str, #[case] current: usize) {
        assert!(matches!(
            chain.resolve(target, current),
            Err(MigrationError::InvalidTarget(..))
        ));
    }

    #[rstest]
    fn unknown_and_ambiguous(chain: ScriptDirectory) {
        assert!(matches!(
            chain.resolve("ffff", 0),
            Err(MigrationError::UnknownRevision(..))
        ));
        let chain = ScriptDirectory::new(vec![
            revision("abc1", None, "a"),
            revision("abc2", Some("abc1"), "b"),
        ])
        .expect("Invalid chain");
        assert!(matches!(
            chain.resolve("abc", 0),
            Err(MigrationError::AmbiguousRevision(..))
        ));
    }

    #[test]
    fn invalid_chains() {
        assert!(matches!(
            ScriptDirectory::new(vec![]),
            Err(MigrationError::NoRevisions)
        ));
        assert!(matches!(
            ScriptDirectory::new(vec![revision("a", None, "a"), revision("a", None, "b")]),
            Err(MigrationError::DuplicateRevision(..))
        ));
        assert!(matches!(
            ScriptDirectory::new(vec![revision("a", None, "a"), revision("b", Some("x"), "b")]),
            Err(MigrationError::MissingDownRevision { .. })
        ));
        assert!(matches!(
            ScriptDirectory::new(vec![revision("a", None, "a"), revision("b", None, "b")]),
            Err(MigrationError::MultipleBases(..))
        ));
        assert!(matches!(
            ScriptDirectory::new(vec![
                revision("a", None, "a"),
                revision("b", Some("a"), "b"),
                revision("c", Some("a"), "c"),
            ]),
            Err(MigrationError::MultipleHeads(..))
        ));
        assert!(matches!(
            ScriptDirectory::new(vec![
                revision("a", None, "a"),
                revision("b", Some("c"), "b"),
                revision("c", Some("b"), "c"),
            ]),
            Err(MigrationError::Cycle)
        ));
    }

    #[rstest]
    fn history_marks_head_and_current(chain: ScriptDirectory) {
        let history = chain.history(Some(2));
        let lines = history.iter().map(|h| h.to_string()).collect::<Vec<_>>();
        assert_eq!(
            lines,
            vec![
                "b2000000 -> c3000000 (head), create a table",
                "a1000000 -> b2000000 (current), create a table",
                "<base> -> a1000000, create a table",
            ]
        );
    }

    #[test]
    fn shipped_revisions_are_valid() -> Result<(), MigrationError> {
        let scripts = ScriptDirectory::stories()?;
        assert_eq!(scripts.revisions().next().map(|m| m.revision()), Some("18708bcdc0fe"));
        Ok(())
    }
}
