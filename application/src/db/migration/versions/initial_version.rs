//! initial version
//!
//! Created 2013-12-10 00:35:55.
use crate::db::{
    migration::{Migration, MigrationError, Operations},
    Column, ColumnType, Table,
};

const BRANCH_STATUS: ColumnType = ColumnType::Enum {
    name: Some("branch_status"),
    values: &["master", "release", "stable", "unsupported"],
};

const PRIORITY: ColumnType = ColumnType::Enum {
    name: Some("priority"),
    values: &["Undefined", "Low", "Medium", "High", "Critical"],
};

const TASK_STATUS: ColumnType = ColumnType::Enum {
    name: None,
    values: &["Todo", "In review", "Landed"],
};

/// A table with the `id`, `created_at` and `updated_at` columns every entity has.
fn entity(name: &'static str) -> Table {
    Table::new(name)
        .column(Column::new("id", ColumnType::Integer).not_null())
        .column(Column::new("created_at", ColumnType::DateTime))
        .column(Column::new("updated_at", ColumnType::DateTime))
}

pub struct InitialVersion;

impl Migration for InitialVersion {
    fn revision(&self) -> &'static str {
        "18708bcdc0fe"
    }

    fn down_revision(&self) -> Option<&'static str> {
        None
    }

    fn message(&self) -> &'static str {
        "initial version"
    }

    fn create_date(&self) -> &'static str {
        "2013-12-10 00:35:55.327593"
    }

    fn upgrade(&self, op: &mut Operations) -> Result<(), MigrationError> {
        op.create_table(
            entity("branches")
                .column(Column::new("name", ColumnType::String(50)))
                .column(Column::new("status", BRANCH_STATUS))
                .column(Column::new("release_date", ColumnType::DateTime))
                .primary_key(&["id"])
                .unique("uniq_branch0name", &["name"]),
        )?;
        op.create_table(
            entity("groups")
                .column(Column::new("name", ColumnType::String(50)))
                .column(Column::new("title", ColumnType::Unicode(100)))
                .primary_key(&["id"])
                .unique("uniq_group0name", &["name"]),
        )?;
        op.create_table(
            entity("users")
                .column(Column::new("name", ColumnType::Unicode(255)))
                .column(Column::new("email", ColumnType::String(255)))
                .primary_key(&["id"])
                .unique("uniq_user0email", &["email"])
                .unique("uniq_user0name", &["name"]),
        )?;
        op.create_table(
            entity("teams")
                .column(Column::new("name", ColumnType::Unicode(255)))
                .primary_key(&["id"])
                .unique("uniq_team0name", &["name"]),
        )?;
        op.create_table(
            Table::new("team_membership")
                .column(Column::new("user_id", ColumnType::Integer))
                .column(Column::new("team_id", ColumnType::Integer))
                .foreign_key(&["team_id"], "teams", &["id"])
                .foreign_key(&["user_id"], "users", &["id"]),
        )?;
        op.create_table(
            entity("stories")
                .column(Column::new("creator_id", ColumnType::Integer))
                .column(Column::new("title", ColumnType::Unicode(100)))
                .column(Column::new("description", ColumnType::UnicodeText))
                .column(Column::new("is_bug", ColumnType::Boolean))
                .column(Column::new("priority", PRIORITY))
                .foreign_key(&["creator_id"], "users", &["id"])
                .primary_key(&["id"]),
        )?;
        op.create_table(
            entity("milestones")
                .column(Column::new("name", ColumnType::String(50)))
                .column(Column::new("branch_id", ColumnType::Integer))
                .column(Column::new("released", ColumnType::Boolean))
                .column(Column::new("undefined", ColumnType::Boolean))
                .foreign_key(&["branch_id"], "branches", &["id"])
                .primary_key(&["id"])
                .unique("uniq_milestone0name", &["name"]),
        )?;
        op.create_table(
            entity("projects")
                .column(Column::new("name", ColumnType::String(50)))
                .column(Column::new("description", ColumnType::Unicode(100)))
                .column(Column::new("team_id", ColumnType::Integer))
                .foreign_key(&["team_id"], "teams", &["id"])
                .primary_key(&["id"])
                .unique("uniq_project0name", &["name"]),
        )?;
        op.create_table(
            Table::new("project_groups")
                .column(Column::new("project_id", ColumnType::Integer))
                .column(Column::new("keyword_id", ColumnType::Integer))
                .foreign_key(&["keyword_id"], "groups", &["id"])
                .foreign_key(&["project_id"], "projects", &["id"]),
        )?;
        op.create_table(
            entity("tasks")
                .column(Column::new("title", ColumnType::Unicode(100)))
                .column(Column::new("status", TASK_STATUS))
                .column(Column::new("story_id", ColumnType::Integer))
                .column(Column::new("project_id", ColumnType::Integer))
                .column(Column::new("assignee_id", ColumnType::Integer))
                .column(Column::new("milestone_id", ColumnType::Integer))
                .foreign_key(&["assignee_id"], "users", &["id"])
                .foreign_key(&["milestone_id"], "milestones", &["id"])
                .foreign_key(&["project_id"], "projects", &["id"])
                .foreign_key(&["story_id"], "stories", &["id"])
                .primary_key(&["id"]),
        )?;
        op.create_table(
            entity("comments")
                .column(Column::new("action", ColumnType::String(150)))
                .column(Column::new("comment_type", ColumnType::String(20)))
                .column(Column::new("content", ColumnType::UnicodeText))
                .column(Column::new("story_id", ColumnType::Integer))
                .column(Column::new("author_id", ColumnType::Integer))
                .foreign_key(&["author_id"], "users", &["id"])
                .foreign_key(&["story_id"], "stories", &["id"])
                .primary_key(&["id"]),
        )?;
        op.create_table(
            entity("storytags")
                .column(Column::new("name", ColumnType::String(20)))
                .column(Column::new("story_id", ColumnType::Integer))
                .foreign_key(&["story_id"], "stories", &["id"])
                .primary_key(&["id"])
                .unique("uniq_story_tags0name", &["name"]),
        )
    }

    fn downgrade(&self, op: &mut Operations) -> Result<(), MigrationError> {
        for table in [
            "storytags",
            "comments",
            "tasks",
            "project_groups",
            "projects",
            "milestones",
            "stories",
            "team_membership",
            "teams",
            "users",
            "groups",
            "branches",
        ] {
            op.drop_table(table)?;
        }
        op.drop_enum("branch_status")?;
        op.drop_enum("priority")
    }
}
