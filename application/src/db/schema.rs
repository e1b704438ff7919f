//! Table definitions as data, rendered to DDL for each SQL dialect.
use itertools::Itertools;

use super::Dialect;

/// Words that must be quoted when used as identifiers.
const RESERVED_WORDS: &[&str] = &["group", "groups", "order", "select", "table", "user"];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    DateTime,
    String(usize),
    Unicode(usize),
    UnicodeText,
    Boolean,
    /// An enumerated string. Named enums become a database type where the dialect supports it.
    Enum {
        name: Option<&'static str>,
        values: &'static [&'static str],
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForeignKey {
    pub columns: Vec<&'static str>,
    pub references: &'static str,
    pub referenced_columns: Vec<&'static str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UniqueConstraint {
    pub name: &'static str,
    pub columns: Vec<&'static str>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Table {
    pub name: &'static str,
    pub columns: Vec<Column>,
    pub primary_key: Vec<&'static str>,
    pub foreign_keys: Vec<ForeignKey>,
    pub unique_constraints: Vec<UniqueConstraint>,
}

pub(crate) fn quote(dialect: Dialect, identifier: &str) -> String {
    if RESERVED_WORDS.contains(&identifier.to_ascii_lowercase().as_str()) {
        match dialect {
            Dialect::MySql => format!("`{}`", identifier),
            Dialect::Sqlite | Dialect::PostgreSql => format!("\"{}\"", identifier),
        }
    } else {
        identifier.to_owned()
    }
}

fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn literal_list(values: &[&str]) -> String {
    values.iter().map(|v| literal(v)).join(", ")
}

impl Table {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn primary_key(mut self, columns: &[&'static str]) -> Self {
        self.primary_key = columns.to_vec();
        self
    }

    pub fn foreign_key(
        mut self,
        columns: &[&'static str],
        references: &'static str,
        referenced_columns: &[&'static str],
    ) -> Self {
        self.foreign_keys.push(ForeignKey {
            columns: columns.to_vec(),
            references,
            referenced_columns: referenced_columns.to_vec(),
        });
        self
    }

    pub fn unique(mut self, name: &'static str, columns: &[&'static str]) -> Self {
        self.unique_constraints.push(UniqueConstraint {
            name,
            columns: columns.to_vec(),
        });
        self
    }

    /// Named enum types used by this table, in column order.
    pub fn enum_types(&self) -> Vec<(&'static str, &'static [&'static str])> {
        self.columns
            .iter()
            .filter_map(|c| match c.ty {
                ColumnType::Enum {
                    name: Some(name),
                    values,
                } => Some((name, values)),
                _ => None,
            })
            .collect()
    }

    fn column_type_sql(dialect: Dialect, ty: &ColumnType) -> String {
        match (ty, dialect) {
            (ColumnType::Integer, _) => "INTEGER".into(),
            (ColumnType::DateTime, Dialect::PostgreSql) => "TIMESTAMP WITHOUT TIME ZONE".into(),
            (ColumnType::DateTime, _) => "DATETIME".into(),
            (ColumnType::String(n) | ColumnType::Unicode(n), _) => format!("VARCHAR({})", n),
            (ColumnType::UnicodeText, _) => "TEXT".into(),
            (ColumnType::Boolean, Dialect::MySql) => "BOOL".into(),
            (ColumnType::Boolean, _) => "BOOLEAN".into(),
            (ColumnType::Enum { values, .. }, Dialect::MySql) => {
                format!("ENUM({})", literal_list(values))
            }
            (
                ColumnType::Enum {
                    name: Some(name), ..
                },
                Dialect::PostgreSql,
            ) => (*name).to_owned(),
            (ColumnType::Enum { values, .. }, _) => {
                let width = values.iter().map(|v| v.len()).max().unwrap_or(1);
                format!("VARCHAR({})", width)
            }
        }
    }

    /// CHECK constraints emulating types the dialect lacks.
    fn check_constraints(&self, dialect: Dialect) -> Vec<String> {
        let mut checks = vec![];
        for column in &self.columns {
            let name = quote(dialect, column.name);
            match (&column.ty, dialect) {
                (ColumnType::Boolean, Dialect::Sqlite) => {
                    checks.push(format!("CHECK ({} IN (0, 1))", name));
                }
                (ColumnType::Enum { name: enum_name, values }, Dialect::Sqlite)
                | (
                    ColumnType::Enum {
                        name: enum_name @ None,
                        values,
                    },
                    Dialect::PostgreSql,
                ) => {
                    let check = format!("CHECK ({} IN ({}))", name, literal_list(values));
                    checks.push(match enum_name {
                        Some(enum_name) => format!("CONSTRAINT {} {}", enum_name, check),
                        None => check,
                    });
                }
                _ => {}
            }
        }
        checks
    }

    /// The `CREATE TABLE` statement for this table.
    pub fn create_sql(&self, dialect: Dialect, mysql_engine: &str) -> String {
        let q = |s: &str| quote(dialect, s);
        let mut lines = vec![];
        for column in &self.columns {
            let mut line = format!("{} {}", q(column.name), Self::column_type_sql(dialect, &column.ty));
            if !column.nullable {
                line += " NOT NULL";
            }
            lines.push(line);
        }
        if !self.primary_key.is_empty() {
            lines.push(format!(
                "PRIMARY KEY ({})",
                self.primary_key.iter().map(|c| q(c)).join(", ")
            ));
        }
        for fk in &self.foreign_keys {
            lines.push(format!(
                "FOREIGN KEY({}) REFERENCES {} ({})",
                fk.columns.iter().map(|c| q(c)).join(", "),
                q(fk.references),
                fk.referenced_columns.iter().map(|c| q(c)).join(", ")
            ));
        }
        for unique in &self.unique_constraints {
            lines.push(format!(
                "CONSTRAINT {} UNIQUE ({})",
                unique.name,
                unique.columns.iter().map(|c| q(c)).join(", ")
            ));
        }
        lines.extend(self.check_constraints(dialect));

        let mut sql = format!("CREATE TABLE {} (\n    {}\n)", q(self.name), lines.join(",\n    "));
        if dialect == Dialect::MySql {
            sql += &format!("ENGINE={} CHARSET=utf8", mysql_engine);
        }
        sql
    }
}

pub fn drop_table_sql(dialect: Dialect, name: &str) -> String {
    format!("DROP TABLE {}", quote(dialect, name))
}

/// Only PostgreSQL has standalone enum types, other dialects get `None`.
pub fn create_enum_sql(dialect: Dialect, name: &str, values: &[&str]) -> Option<String> {
    (dialect == Dialect::PostgreSql)
        .then(|| format!("CREATE TYPE {} AS ENUM ({})", name, literal_list(values)))
}

pub fn drop_enum_sql(dialect: Dialect, name: &str) -> Option<String> {
    (dialect == Dialect::PostgreSql).then(|| format!("DROP TYPE {}", name))
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    const STATUSES: &[&str] = &["master", "release", "stable", "unsupported"];

    #[fixture]
    fn branches() -> Table {
        Table::new("branches")
            .column(Column::new("id", ColumnType::Integer).not_null())
            .column(Column::new("name", ColumnType::String(50)))
            .column(Column::new(
                "status",
                ColumnType::Enum {
                    name: Some("branch_status"),
                    values: STATUSES,
                },
            ))
            .column(Column::new("released", ColumnType::Boolean))
            .primary_key(&["id"])
            .unique("uniq_branch0name", &["name"])
    }

    #[rstest]
    fn sqlite_ddl(branches: Table) {
        assert_eq!(
            branches.create_sql(Dialect::Sqlite, "InnoDB"),
            "CREATE TABLE branches (
    id INTEGER NOT NULL,
    name VARCHAR(50),
    status VARCHAR(11),
    released BOOLEAN,
    PRIMARY KEY (id),
    CONSTRAINT uniq_branch0name UNIQUE (name),
    CONSTRAINT branch_status CHECK (status IN ('master', 'release', 'stable', 'unsupported')),
    CHECK (released IN (0, 1))
)"
        );
    }

    #[rstest]
    fn mysql_ddl(branches: Table) {
        let sql = branches.create_sql(Dialect::MySql, "InnoDB");
        assert!(sql.contains("status ENUM('master', 'release', 'stable', 'unsupported')"));
        assert!(sql.contains("released BOOL,"));
        assert!(sql.ends_with(")ENGINE=InnoDB CHARSET=utf8"));
        assert!(!sql.contains("CHECK"));
    }

    #[rstest]
    fn postgresql_ddl(branches: Table) {
        let sql = branches.create_sql(Dialect::PostgreSql, "InnoDB");
        assert!(sql.contains("status branch_status,"));
        assert_eq!(branches.enum_types(), vec![("branch_status", STATUSES)]);
        assert_eq!(
            create_enum_sql(Dialect::PostgreSql, "branch_status", STATUSES).as_deref(),
            Some("CREATE TYPE branch_status AS ENUM ('master', 'release', 'stable', 'unsupported')")
        );
        assert_eq!(create_enum_sql(Dialect::Sqlite, "branch_status", STATUSES), None);
    }

    #[test]
    fn reserved_words_are_quoted() {
        let groups = Table::new("groups").column(Column::new("id", ColumnType::Integer));
        assert!(groups.create_sql(Dialect::MySql, "InnoDB").starts_with("CREATE TABLE `groups` ("));
        assert!(groups.create_sql(Dialect::Sqlite, "InnoDB").starts_with("CREATE TABLE \"groups\" ("));
        assert_eq!(drop_table_sql(Dialect::Sqlite, "groups"), "DROP TABLE \"groups\"");
        assert_eq!(drop_table_sql(Dialect::Sqlite, "teams"), "DROP TABLE teams");
    }

    #[test]
    fn literals_are_escaped() {
        assert_eq!(literal_list(&["it's", "fine"]), "'it''s', 'fine'");
    }

    #[rstest]
    fn sqlite_ddl_executes(branches: Table) -> Result<(), Box<dyn std::error::Error>> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch(&branches.create_sql(Dialect::Sqlite, "InnoDB"))?;
        conn.execute("insert into branches(name, status) values ('trunk', 'master')", ())?;
        assert!(conn
            .execute("insert into branches(name, status) values ('other', 'bogus')", ())
            .is_err());
        assert!(conn
            .execute("insert into branches(name, status) values ('trunk', 'stable')", ())
            .is_err());
        Ok(())
    }
}
