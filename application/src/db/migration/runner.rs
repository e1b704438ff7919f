use rusqlite::{Connection, OptionalExtension};

use super::{
    ops::{ScriptSink, TransactionSink},
    position_name, HistoryEntry, Migration, MigrationError, Operations, ScriptDirectory,
};
use crate::db::{Column, ColumnType, Dialect, Engine, StatementLog, Table};

/// Table recording the revision a database is at.
pub const VERSION_TABLE: &str = "alembic_version";

fn version_table() -> Table {
    Table::new(VERSION_TABLE)
        .column(Column::new("version_num", ColumnType::String(32)).not_null())
        .primary_key(&["version_num"])
}

/// The statement moving the version table from one revision to another.
fn version_change_sql(from: Option<&str>, to: Option<&str>) -> Option<String> {
    match (from, to) {
        (None, None) => None,
        (None, Some(to)) => Some(format!(
            "INSERT INTO {} (version_num) VALUES ('{}')",
            VERSION_TABLE, to
        )),
        (Some(from), Some(to)) => Some(format!(
            "UPDATE {0} SET version_num='{1}' WHERE {0}.version_num = '{2}'",
            VERSION_TABLE, to, from
        )),
        (Some(from), None) => Some(format!(
            "DELETE FROM {0} WHERE {0}.version_num = '{1}'",
            VERSION_TABLE, from
        )),
    }
}

fn revision_id(revision: Option<&dyn Migration>) -> Option<&'static str> {
    revision.map(|r| r.revision())
}

/// Applies revisions to a live database.
pub struct Migrator<'a> {
    engine: &'a Engine,
    scripts: ScriptDirectory,
}

impl<'a> Migrator<'a> {
    pub fn new(engine: &'a Engine, scripts: ScriptDirectory) -> Self {
        Self { engine, scripts }
    }

    pub fn scripts(&self) -> &ScriptDirectory {
        &self.scripts
    }

    fn has_table(conn: &Connection, name: &str) -> Result<bool, MigrationError> {
        let count: i64 = conn.query_row(
            "select count(*) from sqlite_master where type = 'table' and name = ?",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// The position recorded in the version table, without checking whether the database is controlled.
    fn recorded_position(&self, conn: &Connection) -> Result<Option<usize>, MigrationError> {
        if !Self::has_table(conn, VERSION_TABLE)? {
            return Ok(None);
        }
        let version: Option<String> = conn
            .query_row(&format!("select version_num from {}", VERSION_TABLE), [], |row| {
                row.get(0)
            })
            .optional()?;
        match version {
            Some(version) => Ok(Some(self.scripts.position_of(&version)?)),
            None => Ok(Some(0)),
        }
    }

    fn current_position(&self, conn: &Connection) -> Result<usize, MigrationError> {
        if let Some(position) = self.recorded_position(conn)? {
            return Ok(position);
        }
        let tables: i64 = conn.query_row(
            "select count(*) from sqlite_master where type = 'table' and name not like 'sqlite_%'",
            [],
            |row| row.get(0),
        )?;
        if tables > 0 {
            Err(MigrationError::NotControlled)
        } else {
            Ok(0)
        }
    }

    /// The revision the database is at, `None` at base.
    pub fn current(&self) -> Result<Option<&'static str>, MigrationError> {
        let conn = self.engine.connect()?;
        let position = self.current_position(&conn)?;
        Ok(revision_id(self.scripts.at(position)))
    }

    pub fn history(&self) -> Result<Vec<HistoryEntry>, MigrationError> {
        let conn = self.engine.connect()?;
        let position = self.current_position(&conn)?;
        Ok(self.scripts.history(Some(position)))
    }

    /// Run `step` and move the version table from `from` to `to`, all in one transaction.
    fn run_step(
        &self,
        conn: &mut Connection,
        from: Option<&str>,
        to: Option<&str>,
        step: impl FnOnce(&mut Operations) -> Result<(), MigrationError>,
    ) -> Result<(), MigrationError> {
        let tx = conn.transaction()?;
        {
            let mut sink = TransactionSink {
                tx: &tx,
                statements: self.engine.statements(),
            };
            let mut op = Operations::new(&mut sink, self.engine.dialect(), self.engine.mysql_engine());
            step(&mut op)?;
            if let Some(sql) = version_change_sql(from, to) {
                op.execute(&sql)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn ensure_version_table(&self, conn: &mut Connection) -> Result<(), MigrationError> {
        if Self::has_table(conn, VERSION_TABLE)? {
            return Ok(());
        }
        tracing::info!("Creating version table {}", VERSION_TABLE);
        self.run_step(conn, None, None, |op| op.create_table(version_table()))
    }

    /// Apply revisions up to `target`. Returns the ids applied, in order.
    pub fn upgrade(&self, target: &str) -> Result<Vec<&'static str>, MigrationError> {
        let mut conn = self.engine.connect()?;
        let current = self.current_position(&conn)?;
        let destination = self.scripts.resolve(target, current)?;
        if destination < current {
            return Err(MigrationError::WrongDirection {
                direction: "upgrade",
                current: position_name(self.scripts.at(current)),
                target: target.to_owned(),
            });
        }
        self.ensure_version_table(&mut conn)?;
        let mut applied = vec![];
        for revision in self
            .scripts
            .revisions()
            .skip(current)
            .take(destination - current)
        {
            tracing::info!(
                "Running upgrade {} -> {}, {}",
                revision.down_revision().unwrap_or(""),
                revision.revision(),
                revision.message()
            );
            self.run_step(
                &mut conn,
                revision.down_revision(),
                Some(revision.revision()),
                |op| revision.upgrade(op),
            )?;
            applied.push(revision.revision());
        }
        Ok(applied)
    }

    /// Revert revisions down to `target`. Returns the ids reverted, newest first.
    pub fn downgrade(&self, target: &str) -> Result<Vec<&'static str>, MigrationError> {
        let mut conn = self.engine.connect()?;
        let current = self.current_position(&conn)?;
        let destination = self.scripts.resolve(target, current)?;
        if destination > current {
            return Err(MigrationError::WrongDirection {
                direction: "downgrade",
                current: position_name(self.scripts.at(current)),
                target: target.to_owned(),
            });
        }
        let steps = self
            .scripts
            .revisions()
            .skip(destination)
            .take(current - destination)
            .collect::<Vec<_>>();
        let mut reverted = vec![];
        for revision in steps.into_iter().rev() {
            tracing::info!(
                "Running downgrade {} -> {}, {}",
                revision.revision(),
                revision.down_revision().unwrap_or(""),
                revision.message()
            );
            self.run_step(
                &mut conn,
                Some(revision.revision()),
                revision.down_revision(),
                |op| revision.downgrade(op),
            )?;
            reverted.push(revision.revision());
        }
        Ok(reverted)
    }

    /// Record `target` as the current revision without running anything. Works on databases that are not
    /// yet under version control.
    pub fn stamp(&self, target: &str) -> Result<Option<&'static str>, MigrationError> {
        let mut conn = self.engine.connect()?;
        let current = self.recorded_position(&conn)?.unwrap_or(0);
        let destination = self.scripts.resolve(target, current)?;
        self.ensure_version_table(&mut conn)?;
        let to = revision_id(self.scripts.at(destination));
        tracing::info!("Stamping {} as {}", VERSION_TABLE, position_name(self.scripts.at(destination)));
        self.run_step(&mut conn, None, None, |op| {
            op.execute(&format!("DELETE FROM {}", VERSION_TABLE))?;
            if let Some(sql) = version_change_sql(None, to) {
                op.execute(&sql)?;
            }
            Ok(())
        })?;
        Ok(to)
    }
}

/// Renders migrations as a SQL script for a database we cannot (or should not) connect to.
pub struct OfflineScript<'a> {
    scripts: &'a ScriptDirectory,
    dialect: Dialect,
    mysql_engine: &'a str,
    statements: Option<StatementLog>,
}

impl<'a> OfflineScript<'a> {
    pub fn new(scripts: &'a ScriptDirectory, dialect: Dialect, mysql_engine: &'a str) -> Self {
        Self {
            scripts,
            dialect,
            mysql_engine,
            statements: None,
        }
    }

    /// Annotate statements with their source location when the log asks for it.
    pub fn with_statements(mut self, statements: StatementLog) -> Self {
        self.statements = Some(statements);
        self
    }

    /// Split `start:end`. Without a colon, `default_start` is used, or the range is rejected.
    fn range(
        &self,
        range: &str,
        default_start: Option<usize>,
        direction: &'static str,
    ) -> Result<(usize, usize), MigrationError> {
        let (start, end) = match range.split_once(':') {
            Some((start, end)) => (self.scripts.resolve(start, 0)?, end),
            None => (default_start.ok_or(MigrationError::RangeRequired(direction))?, range),
        };
        let end = self.scripts.resolve(end, start)?;
        let backwards = match direction {
            "downgrade" => end > start,
            _ => end < start,
        };
        if backwards {
            return Err(MigrationError::WrongDirection {
                direction,
                current: position_name(self.scripts.at(start)),
                target: range.to_owned(),
            });
        }
        Ok((start, end))
    }

    fn sink(&self) -> ScriptSink {
        let mut sink = ScriptSink {
            statements: self.statements,
            ..Default::default()
        };
        sink.script += "BEGIN;\n\n";
        sink
    }

    fn finish(mut sink: ScriptSink) -> String {
        sink.script += "COMMIT;\n";
        sink.script
    }

    fn operations<'s>(&'s self, sink: &'s mut ScriptSink) -> Operations<'s> {
        Operations::new(sink, self.dialect, self.mysql_engine)
    }

    fn version_change(
        &self,
        sink: &mut ScriptSink,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<(), MigrationError> {
        match version_change_sql(from, to) {
            Some(sql) => self.operations(sink).execute(&sql),
            None => Ok(()),
        }
    }

    /// The script for `range`, either `end` (from base) or `start:end`.
    pub fn upgrade(&self, range: &str) -> Result<String, MigrationError> {
        let (start, end) = self.range(range, Some(0), "upgrade")?;
        let mut sink = self.sink();
        if start == 0 {
            self.operations(&mut sink).create_table(version_table())?;
        }
        for revision in self.scripts.revisions().skip(start).take(end - start) {
            sink.comment(&format!(
                "Running upgrade {} -> {}",
                revision.down_revision().unwrap_or(""),
                revision.revision()
            ));
            revision.upgrade(&mut self.operations(&mut sink))?;
            self.version_change(&mut sink, revision.down_revision(), Some(revision.revision()))?;
        }
        Ok(Self::finish(sink))
    }

    /// The script for `start:end`. A start is required since nothing can be assumed about the database.
    pub fn downgrade(&self, range: &str) -> Result<String, MigrationError> {
        let (start, end) = self.range(range, None, "downgrade")?;
        let steps = self
            .scripts
            .revisions()
            .skip(end)
            .take(start - end)
            .collect::<Vec<_>>();
        let mut sink = self.sink();
        for revision in steps.into_iter().rev() {
            sink.comment(&format!(
                "Running downgrade {} -> {}",
                revision.revision(),
                revision.down_revision().unwrap_or("")
            ));
            revision.downgrade(&mut self.operations(&mut sink))?;
            self.version_change(&mut sink, Some(revision.revision()), revision.down_revision())?;
        }
        if end == 0 {
            self.operations(&mut sink).drop_table(VERSION_TABLE)?;
        }
        Ok(Self::finish(sink))
    }

    /// The script recording `range`'s end as current, without running any revision.
    pub fn stamp(&self, range: &str) -> Result<String, MigrationError> {
        let (start, end) = match range.split_once(':') {
            Some((start, end)) => {
                let start = self.scripts.resolve(start, 0)?;
                (start, self.scripts.resolve(end, start)?)
            }
            None => (0, self.scripts.resolve(range, 0)?),
        };
        let mut sink = self.sink();
        if start == 0 {
            self.operations(&mut sink).create_table(version_table())?;
        }
        self.version_change(
            &mut sink,
            revision_id(self.scripts.at(start)),
            revision_id(self.scripts.at(end)),
        )?;
        Ok(Self::finish(sink))
    }
}
