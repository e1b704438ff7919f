//! The story tracking data model. Every entity carries an integer id and creation/update timestamps.
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::DbError;

/// A persistent entity stored in its own table.
pub trait Model: Serialize + DeserializeOwned {
    const TABLE: &'static str;

    fn id(&self) -> Option<i64>;

    fn set_id(&mut self, id: i64);

    /// Stamp `updated_at`, and `created_at` too when `creating`.
    fn touch(&mut self, now: DateTime<Utc>, creating: bool);

    /// Fill in column defaults for unset fields.
    fn apply_defaults(&mut self) {}

    /// Every column, keyed by column name.
    fn as_dict(&self) -> Result<serde_json::Map<String, serde_json::Value>, DbError> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(DbError::UnexpectedError(format!(
                "Model serialized to a non-object: {}",
                other
            ))),
        }
    }
}

/// An enumerated column stored as its display string.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $( $variant:ident => $s:literal ),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(into = "String", try_from = "String")]
        pub enum $name {
            $( $variant ),*
        }

        impl $name {
            pub const ALL: &'static [&'static str] = &[ $( $s ),* ];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $s ),*
                }
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $s => Ok(Self::$variant), )*
                    _ => Err(format!("{:?} is not a valid {}", s, stringify!($name))),
                }
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_owned()
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }
    };
}

string_enum!(
    /// Lifecycle of a release branch.
    BranchStatus {
        Master => "master",
        Release => "release",
        Stable => "stable",
        Unsupported => "unsupported",
    }
);

string_enum!(
    StoryPriority {
        Undefined => "Undefined",
        Low => "Low",
        Medium => "Medium",
        High => "High",
        Critical => "Critical",
    }
);

string_enum!(
    TaskStatus {
        Todo => "Todo",
        InReview => "In review",
        Landed => "Landed",
    }
);

/// Declares a model struct with the common id and timestamp columns.
macro_rules! model {
    (
        $(#[$meta:meta])*
        $name:ident => $table:literal {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),* $(,)?
        }
        $( defaults { $( $dfield:ident = $dvalue:expr ),* $(,)? } )?
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
        pub struct $name {
            pub id: Option<i64>,
            pub created_at: Option<DateTime<Utc>>,
            pub updated_at: Option<DateTime<Utc>>,
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl Model for $name {
            const TABLE: &'static str = $table;

            fn id(&self) -> Option<i64> {
                self.id
            }

            fn set_id(&mut self, id: i64) {
                self.id = Some(id);
            }

            fn touch(&mut self, now: DateTime<Utc>, creating: bool) {
                if creating {
                    self.created_at = Some(now);
                }
                self.updated_at = Some(now);
            }

            $(
                fn apply_defaults(&mut self) {
                    $(
                        if self.$dfield.is_none() {
                            self.$dfield = Some($dvalue);
                        }
                    )*
                }
            )?
        }
    };
}

model!(
    User => "users" {
        name: Option<String>,
        email: Option<String>,
    }
);

model!(
    Team => "teams" {
        name: Option<String>,
    }
);

model!(
    /// Represents a software project.
    Project => "projects" {
        name: Option<String>,
        description: Option<String>,
        team_id: Option<i64>,
    }
);

model!(
    /// A named collection of projects.
    Group => "groups" {
        name: Option<String>,
        title: Option<String>,
    }
);

model!(
    Branch => "branches" {
        name: Option<String>,
        status: Option<BranchStatus>,
        release_date: Option<DateTime<Utc>>,
    }
);

model!(
    Milestone => "milestones" {
        name: Option<String>,
        branch_id: Option<i64>,
        released: Option<bool>,
        undefined: Option<bool>,
    }
    defaults {
        released = false,
        undefined = false,
    }
);

model!(
    Story => "stories" {
        creator_id: Option<i64>,
        title: Option<String>,
        description: Option<String>,
        is_bug: Option<bool>,
        priority: Option<StoryPriority>,
    }
    defaults {
        is_bug = true,
    }
);

model!(
    /// One unit of work on a story, in a single project.
    Task => "tasks" {
        title: Option<String>,
        status: Option<TaskStatus>,
        story_id: Option<i64>,
        project_id: Option<i64>,
        assignee_id: Option<i64>,
        milestone_id: Option<i64>,
    }
    defaults {
        status = TaskStatus::Todo,
    }
);

model!(
    Comment => "comments" {
        action: Option<String>,
        comment_type: Option<String>,
        content: Option<String>,
        story_id: Option<i64>,
        author_id: Option<i64>,
    }
);

model!(
    StoryTag => "storytags" {
        name: Option<String>,
        story_id: Option<i64>,
    }
);

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    #[case(TaskStatus::Todo, "Todo")]
    #[case(TaskStatus::InReview, "In review")]
    #[case(TaskStatus::Landed, "Landed")]
    fn task_status_strings(#[case] status: TaskStatus, #[case] s: &str) {
        assert_eq!(status.to_string(), s);
        assert_eq!(s.parse::<TaskStatus>(), Ok(status));
    }

    #[test]
    fn invalid_enum_string() {
        assert!("Blocker".parse::<StoryPriority>().is_err());
        assert!(serde_json::from_str::<BranchStatus>("\"trunk\"").is_err());
    }

    #[test]
    fn enum_serializes_as_string() -> Result<(), serde_json::Error> {
        assert_eq!(serde_json::to_string(&TaskStatus::InReview)?, "\"In review\"");
        assert_eq!(serde_json::from_str::<StoryPriority>("\"High\"")?, StoryPriority::High);
        Ok(())
    }

    #[test]
    fn defaults_fill_unset_fields() {
        let mut story = Story::default();
        story.apply_defaults();
        assert_eq!(story.is_bug, Some(true));

        let mut story = Story {
            is_bug: Some(false),
            ..Default::default()
        };
        story.apply_defaults();
        assert_eq!(story.is_bug, Some(false));

        let mut task = Task::default();
        task.apply_defaults();
        assert_eq!(task.status, Some(TaskStatus::Todo));

        let mut milestone = Milestone::default();
        milestone.apply_defaults();
        assert_eq!((milestone.released, milestone.undefined), (Some(false), Some(false)));
    }

    #[test]
    fn as_dict_has_every_column() -> Result<(), DbError> {
        let project = Project {
            name: Some("stories".into()),
            ..Default::default()
        };
        let dict = project.as_dict()?;
        let mut keys = dict.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        assert_eq!(
            keys,
            vec!["created_at", "description", "id", "name", "team_id", "updated_at"]
        );
        assert_eq!(dict["name"], serde_json::json!("stories"));
        assert_eq!(dict["id"], serde_json::Value::Null);
        Ok(())
    }

    #[test]
    fn touch_sets_timestamps() {
        let mut team = Team::default();
        let created = Utc::now();
        team.touch(created, true);
        assert_eq!(team.created_at, Some(created));
        let later = created + chrono::Duration::seconds(5);
        team.touch(later, false);
        assert_eq!(team.created_at, Some(created));
        assert_eq!(team.updated_at, Some(later));
    }
}
