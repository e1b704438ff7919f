use std::{collections::HashSet, panic::Location};

use rusqlite::Transaction;

use super::MigrationError;
use crate::db::{
    schema::{create_enum_sql, drop_enum_sql, drop_table_sql},
    Dialect, StatementLog, Table,
};

/// Destination for the statements a revision issues.
pub trait SqlSink {
    fn execute(&mut self, sql: &str, location: &Location<'_>) -> Result<(), MigrationError>;
}

/// Runs statements inside an open transaction.
pub(super) struct TransactionSink<'a, 'c> {
    pub tx: &'a Transaction<'c>,
    pub statements: StatementLog,
}

impl SqlSink for TransactionSink<'_, '_> {
    fn execute(&mut self, sql: &str, location: &Location<'_>) -> Result<(), MigrationError> {
        let sql = self.statements.annotate(sql, location);
        self.statements.echo(&sql);
        self.tx.execute_batch(&sql)?;
        Ok(())
    }
}

/// Collects statements into a script instead of running them.
#[derive(Default)]
pub struct ScriptSink {
    pub script: String,
    pub statements: Option<StatementLog>,
}

impl ScriptSink {
    pub fn comment(&mut self, text: &str) {
        self.script += &format!("-- {}\n\n", text);
    }
}

impl SqlSink for ScriptSink {
    fn execute(&mut self, sql: &str, location: &Location<'_>) -> Result<(), MigrationError> {
        let sql = match &self.statements {
            Some(statements) => statements.annotate(sql, location),
            None => sql.into(),
        };
        self.script += sql.trim_end().trim_end_matches(';');
        self.script += ";\n\n";
        Ok(())
    }
}

/// The schema operations available to a revision.
pub struct Operations<'a> {
    sink: &'a mut dyn SqlSink,
    dialect: Dialect,
    mysql_engine: &'a str,
    created_enums: HashSet<&'static str>,
}

impl<'a> Operations<'a> {
    pub fn new(sink: &'a mut dyn SqlSink, dialect: Dialect, mysql_engine: &'a str) -> Self {
        Self {
            sink,
            dialect,
            mysql_engine,
            created_enums: HashSet::new(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Create a table, first creating any named enum types it needs that do not exist yet.
    #[track_caller]
    pub fn create_table(&mut self, table: Table) -> Result<(), MigrationError> {
        let location = Location::caller();
        for (name, values) in table.enum_types() {
            if !self.created_enums.insert(name) {
                continue;
            }
            if let Some(sql) = create_enum_sql(self.dialect, name, values) {
                self.sink.execute(&sql, location)?;
            }
        }
        let sql = table.create_sql(self.dialect, self.mysql_engine);
        self.sink.execute(&sql, location)
    }

    #[track_caller]
    pub fn drop_table(&mut self, name: &str) -> Result<(), MigrationError> {
        self.sink
            .execute(&drop_table_sql(self.dialect, name), Location::caller())
    }

    /// Drop a named enum type. Does nothing on dialects without standalone enum types.
    #[track_caller]
    pub fn drop_enum(&mut self, name: &str) -> Result<(), MigrationError> {
        match drop_enum_sql(self.dialect, name) {
            Some(sql) => self.sink.execute(&sql, Location::caller()),
            None => Ok(()),
        }
    }

    #[track_caller]
    pub fn execute(&mut self, sql: &str) -> Result<(), MigrationError> {
        self.sink.execute(sql, Location::caller())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::{Column, ColumnType, SqlEcho};

    const LEVELS: &[&str] = &["low", "high"];

    fn table(name: &'static str) -> Table {
        Table::new(name)
            .column(Column::new("id", ColumnType::Integer).not_null())
            .column(Column::new(
                "level",
                ColumnType::Enum {
                    name: Some("level"),
                    values: LEVELS,
                },
            ))
            .primary_key(&["id"])
    }

    #[test]
    fn postgresql_enum_created_once() -> Result<(), MigrationError> {
        let mut sink = ScriptSink::default();
        let mut op = Operations::new(&mut sink, Dialect::PostgreSql, "InnoDB");
        op.create_table(table("a"))?;
        op.create_table(table("b"))?;
        op.drop_table("b")?;
        op.drop_table("a")?;
        op.drop_enum("level")?;
        assert_eq!(sink.script.matches("CREATE TYPE level AS ENUM ('low', 'high');").count(), 1);
        assert!(sink.script.ends_with("DROP TABLE a;\n\nDROP TYPE level;\n\n"));
        Ok(())
    }

    #[test]
    fn sqlite_has_no_enum_types() -> Result<(), MigrationError> {
        let mut sink = ScriptSink::default();
        let mut op = Operations::new(&mut sink, Dialect::Sqlite, "InnoDB");
        op.create_table(table("a"))?;
        op.drop_enum("level")?;
        assert!(!sink.script.contains("TYPE"));
        assert!(sink.script.starts_with("CREATE TABLE a (\n"));
        Ok(())
    }

    #[test]
    fn traced_script_names_the_caller() -> Result<(), MigrationError> {
        let mut sink = ScriptSink {
            statements: Some(StatementLog {
                echo: SqlEcho::Off,
                trace: true,
            }),
            ..Default::default()
        };
        let mut op = Operations::new(&mut sink, Dialect::Sqlite, "InnoDB");
        op.execute("DELETE FROM a;")?;
        assert!(sink.script.starts_with("DELETE FROM a /* "));
        assert!(sink.script.contains("ops.rs:"));
        Ok(())
    }

    #[test]
    fn transaction_sink_executes() -> Result<(), Box<dyn std::error::Error>> {
        let mut conn = rusqlite::Connection::open_in_memory()?;
        let tx = conn.transaction()?;
        {
            let mut sink = TransactionSink {
                tx: &tx,
                statements: StatementLog {
                    echo: SqlEcho::Info,
                    trace: true,
                },
            };
            let mut op = Operations::new(&mut sink, Dialect::Sqlite, "InnoDB");
            op.create_table(table("a"))?;
            op.execute("INSERT INTO a (id, level) VALUES (1, 'low')")?;
        }
        tx.commit()?;
        let count: i64 = conn.query_row("select count(*) from a", [], |row| row.get(0))?;
        assert_eq!(count, 1);
        Ok(())
    }
}
