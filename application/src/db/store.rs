use chrono::Utc;
use rusqlite::ToSql;

use super::{
    schema::quote, Comment, DbError, Dialect, Engine, Model, Project, StoryTag, Task, Team, User,
};

/// Reads and writes models through an [`Engine`]'s connection pool.
pub struct ModelStore<'a> {
    engine: &'a Engine,
}

fn table<T: Model>() -> String {
    quote(Dialect::Sqlite, T::TABLE)
}

impl<'a> ModelStore<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    /// Insert a new model, filling in defaults and timestamps. Returns the new id.
    pub fn insert<T: Model>(&self, model: &mut T) -> Result<i64, DbError> {
        model.apply_defaults();
        model.touch(Utc::now(), true);
        let params = serde_rusqlite::to_params_named(&*model)?;
        // The id is assigned by the database
        let params_slice = params
            .to_slice()
            .into_iter()
            .filter(|(name, _)| *name != ":id")
            .collect::<Vec<(&str, &dyn ToSql)>>();
        let columns = params_slice
            .iter()
            .map(|f| f.0.trim_start_matches(':'))
            .collect::<Vec<_>>()
            .join(",");
        let values = params_slice
            .iter()
            .map(|f| f.0)
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!("insert into {}({}) values ({})", table::<T>(), columns, values);
        let conn = self.engine.connect()?;
        conn.execute(&sql, params_slice.as_slice())?;
        let id = conn.last_insert_rowid();
        model.set_id(id);
        tracing::debug!("Inserted {} id={}", T::TABLE, id);
        Ok(id)
    }

    /// Write every column of an existing model, refreshing `updated_at`. Returns false if no such row exists.
    pub fn update<T: Model>(&self, model: &mut T) -> Result<bool, DbError> {
        if model.id().is_none() {
            return Err(DbError::UnexpectedError(format!(
                "Cannot update an unsaved row in {}",
                T::TABLE
            )));
        }
        model.touch(Utc::now(), false);
        let params = serde_rusqlite::to_params_named(&*model)?;
        let params_slice = params.to_slice();
        let assignments = params_slice
            .iter()
            .map(|f| f.0)
            .filter(|name| *name != ":id")
            .map(|name| format!("{} = {}", name.trim_start_matches(':'), name))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!("update {} set {} where id = :id", table::<T>(), assignments);
        let updated = self
            .engine
            .connect()?
            .execute(&sql, params_slice.as_slice())?;
        Ok(updated > 0)
    }

    /// Delete by id. Returns false if no such row exists.
    pub fn delete<T: Model>(&self, id: i64) -> Result<bool, DbError> {
        let sql = format!("delete from {} where id = ?", table::<T>());
        let deleted = self.engine.connect()?.execute(&sql, [id])?;
        Ok(deleted > 0)
    }

    pub fn get<T: Model>(&self, id: i64) -> Result<Option<T>, DbError> {
        let sql = format!("select * from {} where id = ?", table::<T>());
        match self
            .engine
            .reader()?
            .query_row_and_then(&sql, [id], |row| serde_rusqlite::from_row::<T>(row))
        {
            Err(serde_rusqlite::Error::Rusqlite(rusqlite::Error::QueryReturnedNoRows)) => Ok(None),
            Err(x) => Err(DbError::SerdeError(x)),
            Ok(x) => Ok(Some(x)),
        }
    }

    pub fn list<T: Model>(&self) -> Result<Vec<T>, DbError> {
        let sql = format!("select * from {} order by id", table::<T>());
        self.query(&sql, &[])
    }

    /// Rows of `T` whose foreign key `column` points at `id`.
    fn children<T: Model>(&self, column: &str, id: i64) -> Result<Vec<T>, DbError> {
        let sql = format!("select * from {} where {} = ? order by id", table::<T>(), column);
        self.query(&sql, &[&id])
    }

    fn query<T: Model>(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<T>, DbError> {
        let conn = self.engine.reader()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query(params)?;
        let mut out = vec![];
        for row in serde_rusqlite::from_rows::<T>(rows) {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn story_tasks(&self, story_id: i64) -> Result<Vec<Task>, DbError> {
        self.children("story_id", story_id)
    }

    pub fn story_comments(&self, story_id: i64) -> Result<Vec<Comment>, DbError> {
        self.children("story_id", story_id)
    }

    pub fn story_tags(&self, story_id: i64) -> Result<Vec<StoryTag>, DbError> {
        self.children("story_id", story_id)
    }

    pub fn project_tasks(&self, project_id: i64) -> Result<Vec<Task>, DbError> {
        self.children("project_id", project_id)
    }

    pub fn milestone_tasks(&self, milestone_id: i64) -> Result<Vec<Task>, DbError> {
        self.children("milestone_id", milestone_id)
    }

    /// Tasks assigned to a user.
    pub fn user_tasks(&self, user_id: i64) -> Result<Vec<Task>, DbError> {
        self.children("assignee_id", user_id)
    }

    pub fn add_team_member(&self, team_id: i64, user_id: i64) -> Result<(), DbError> {
        self.engine.connect()?.execute(
            "insert into team_membership(user_id, team_id) values (?, ?)",
            [user_id, team_id],
        )?;
        Ok(())
    }

    pub fn remove_team_member(&self, team_id: i64, user_id: i64) -> Result<bool, DbError> {
        let removed = self.engine.connect()?.execute(
            "delete from team_membership where user_id = ? and team_id = ?",
            [user_id, team_id],
        )?;
        Ok(removed > 0)
    }

    pub fn team_users(&self, team_id: i64) -> Result<Vec<User>, DbError> {
        self.query(
            "select users.* from users join team_membership on users.id = team_membership.user_id \
             where team_membership.team_id = ? order by users.id",
            &[&team_id],
        )
    }

    pub fn user_teams(&self, user_id: i64) -> Result<Vec<Team>, DbError> {
        self.query(
            "select teams.* from teams join team_membership on teams.id = team_membership.team_id \
             where team_membership.user_id = ? order by teams.id",
            &[&user_id],
        )
    }

    pub fn add_project_to_group(&self, group_id: i64, project_id: i64) -> Result<(), DbError> {
        self.engine.connect()?.execute(
            "insert into project_groups(project_id, keyword_id) values (?, ?)",
            [project_id, group_id],
        )?;
        Ok(())
    }

    pub fn group_projects(&self, group_id: i64) -> Result<Vec<Project>, DbError> {
        self.query(
            "select projects.* from projects join project_groups on projects.id = project_groups.project_id \
             where project_groups.keyword_id = ? order by projects.id",
            &[&group_id],
        )
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::migration::{Migrator, ScriptDirectory};
    use crate::db::{Group, Milestone, Story, StoryPriority, TaskStatus};
    use crate::test::enable_tracing;

    #[fixture]
    fn engine(_enable_tracing: &bool) -> Engine {
        let mut config = DatabaseConfig::for_connection("sqlite://").expect("Invalid config");
        config.max_retries = 0;
        let engine = Engine::from_config(&config).expect("Failed to open engine");
        Migrator::new(&engine, ScriptDirectory::stories().expect("Invalid scripts"))
            .upgrade("head")
            .expect("Failed to migrate");
        engine
    }

    #[rstest]
    fn insert_and_get(engine: Engine) -> Result<(), Box<dyn std::error::Error>> {
        let store = ModelStore::new(&engine);
        let mut user = User {
            name: Some("Thierry".into()),
            email: Some("thierry@example.com".into()),
            ..Default::default()
        };
        let id = store.insert(&mut user)?;
        assert_eq!(user.id, Some(id));
        assert!(user.created_at.is_some());

        let loaded: User = store.get(id)?.expect("Missing user");
        assert_eq!(loaded, user);
        assert_eq!(store.get::<User>(id + 100)?, None);
        Ok(())
    }

    #[rstest]
    fn defaults_and_enums_round_trip(engine: Engine) -> Result<(), Box<dyn std::error::Error>> {
        let store = ModelStore::new(&engine);
        let mut story = Story {
            title: Some("Rewrite the tracker".into()),
            priority: Some(StoryPriority::High),
            ..Default::default()
        };
        let story_id = store.insert(&mut story)?;
        let loaded: Story = store.get(story_id)?.expect("Missing story");
        assert_eq!(loaded.is_bug, Some(true));
        assert_eq!(loaded.priority, Some(StoryPriority::High));

        let mut task = Task {
            title: Some("Write migrations".into()),
            story_id: Some(story_id),
            ..Default::default()
        };
        store.insert(&mut task)?;
        task.status = Some(TaskStatus::InReview);
        assert!(store.update(&mut task)?);

        let tasks = store.story_tasks(story_id)?;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, Some(TaskStatus::InReview));
        Ok(())
    }

    #[rstest]
    fn unique_constraints(engine: Engine) -> Result<(), Box<dyn std::error::Error>> {
        let store = ModelStore::new(&engine);
        store.insert(&mut Team {
            name: Some("infra".into()),
            ..Default::default()
        })?;
        let duplicate = store.insert(&mut Team {
            name: Some("infra".into()),
            ..Default::default()
        });
        assert!(matches!(duplicate, Err(DbError::SQLiteError(..))));
        Ok(())
    }

    #[rstest]
    fn foreign_keys_are_enforced(engine: Engine) {
        let store = ModelStore::new(&engine);
        let result = store.insert(&mut Comment {
            content: Some("orphan".into()),
            story_id: Some(12345),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[rstest]
    fn team_membership(engine: Engine) -> Result<(), Box<dyn std::error::Error>> {
        let store = ModelStore::new(&engine);
        let team = store.insert(&mut Team {
            name: Some("stories-core".into()),
            ..Default::default()
        })?;
        let mut users = vec![];
        for name in ["a", "b", "c"] {
            users.push(store.insert(&mut User {
                name: Some(name.into()),
                ..Default::default()
            })?);
        }
        store.add_team_member(team, users[0])?;
        store.add_team_member(team, users[2])?;
        let members = store
            .team_users(team)?
            .into_iter()
            .filter_map(|u| u.id)
            .collect::<Vec<_>>();
        assert_eq!(members, vec![users[0], users[2]]);
        assert_eq!(store.user_teams(users[2])?.len(), 1);
        assert!(store.remove_team_member(team, users[2])?);
        assert!(store.user_teams(users[2])?.is_empty());
        Ok(())
    }

    #[rstest]
    fn group_projects(engine: Engine) -> Result<(), Box<dyn std::error::Error>> {
        let store = ModelStore::new(&engine);
        let group = store.insert(&mut Group {
            name: Some("infra".into()),
            title: Some("Infrastructure".into()),
            ..Default::default()
        })?;
        let project = store.insert(&mut Project {
            name: Some("stories".into()),
            ..Default::default()
        })?;
        store.add_project_to_group(group, project)?;
        let projects = store.group_projects(group)?;
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name.as_deref(), Some("stories"));
        Ok(())
    }

    #[rstest]
    fn milestone_tasks_and_delete(engine: Engine) -> Result<(), Box<dyn std::error::Error>> {
        let store = ModelStore::new(&engine);
        let mut milestone = Milestone {
            name: Some("icehouse-1".into()),
            ..Default::default()
        };
        let milestone_id = store.insert(&mut milestone)?;
        assert_eq!(milestone.released, Some(false));
        let task_id = store.insert(&mut Task {
            milestone_id: Some(milestone_id),
            ..Default::default()
        })?;
        assert_eq!(store.milestone_tasks(milestone_id)?.len(), 1);
        assert!(store.delete::<Task>(task_id)?);
        assert!(!store.delete::<Task>(task_id)?);
        assert!(store.list::<Task>()?.is_empty());
        assert_eq!(store.list::<Milestone>()?.len(), 1);
        Ok(())
    }
}
