use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tag present on every installation; excluded from "user-created"
/// counts when deciding whether a snapshot is worth migrating.
pub const TODAY_TAG_ID: &str = "TODAY";
/// Default project seeded on first run, likewise system-reserved.
pub const INBOX_PROJECT_ID: &str = "INBOX";

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_ids: Vec<String>,
    #[serde(default)]
    pub done: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub title: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub title: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Application-level settings that sync along with the data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub schema_version: u32,
    #[serde(default)]
    pub misc: serde_json::Value,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            misc: serde_json::Value::Null,
        }
    }
}

/// The complete application state: every entity collection, including
/// the cold-storage archive. Collections are keyed by entity ID so
/// serialization order is deterministic across devices.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AppStateSnapshot {
    pub tasks: BTreeMap<String, Task>,
    pub projects: BTreeMap<String, Project>,
    pub tags: BTreeMap<String, Tag>,
    pub config: AppConfig,
    #[serde(default)]
    pub archived_tasks: BTreeMap<String, Task>,
}

impl AppStateSnapshot {
    /// Fresh-install state: only the system-reserved project and tag.
    pub fn seeded(now_ms: i64) -> Self {
        let mut state = Self::default();
        state.projects.insert(
            INBOX_PROJECT_ID.to_string(),
            Project {
                id: INBOX_PROJECT_ID.to_string(),
                title: "Inbox".to_string(),
                created_at_ms: now_ms,
                updated_at_ms: now_ms,
            },
        );
        state.tags.insert(
            TODAY_TAG_ID.to_string(),
            Tag {
                id: TODAY_TAG_ID.to_string(),
                title: "Today".to_string(),
                created_at_ms: now_ms,
                updated_at_ms: now_ms,
            },
        );
        state
    }

    /// True when nothing user-created exists: no live or archived tasks,
    /// no projects beyond the seeded inbox, no tags beyond the system
    /// ones. Migration skips seeding a server from such a state.
    pub fn is_effectively_empty(&self) -> bool {
        if !self.tasks.is_empty() || !self.archived_tasks.is_empty() {
            return false;
        }
        let user_projects = self
            .projects
            .keys()
            .filter(|id| id.as_str() != INBOX_PROJECT_ID)
            .count();
        let user_tags = self
            .tags
            .keys()
            .filter(|id| id.as_str() != TODAY_TAG_ID)
            .count();
        user_projects == 0 && user_tags == 0
    }
}
