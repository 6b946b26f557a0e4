use anyhow::{anyhow, Result};
use rusqlite::Connection;

use crate::crypto::Key;
use crate::db;
use crate::model::{AppConfig, AppStateSnapshot, Project, Tag, Task};
use crate::op::Operation;

/// The local application state: the hot entity collections plus a
/// mirror of the cold-storage archive. The sync core mutates it only by
/// applying operations or loading a full snapshot, never field by field.
#[derive(Clone, Debug, Default)]
pub struct StateStore {
    snapshot: AppStateSnapshot,
}

impl StateStore {
    pub fn new(snapshot: AppStateSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn seeded(now_ms: i64) -> Self {
        Self {
            snapshot: AppStateSnapshot::seeded(now_ms),
        }
    }

    pub fn current(&self) -> &AppStateSnapshot {
        &self.snapshot
    }
}

/// Assembles the complete snapshot for export or migration: the hot
/// state plus every archived task loaded from cold storage. Archived
/// rows win nothing over live ones here; validation resolves overlaps.
pub fn full_state_snapshot(
    conn: &Connection,
    db_key: &Key,
    store: &StateStore,
) -> Result<AppStateSnapshot> {
    let mut snapshot = store.snapshot.clone();
    let archived = db::load_archived_tasks(conn, db_key)?;
    for (id, task) in archived {
        snapshot.archived_tasks.entry(id).or_insert(task);
    }
    Ok(snapshot)
}

/// Replaces the whole local state with `snapshot`, persisting its
/// archive collection to cold storage. Used after a repair reload and
/// when a remote full-state import is applied.
pub fn load_full_state(
    conn: &Connection,
    db_key: &Key,
    store: &mut StateStore,
    snapshot: AppStateSnapshot,
) -> Result<()> {
    db::replace_archive(conn, db_key, &snapshot.archived_tasks)?;
    store.snapshot = snapshot;
    Ok(())
}

/// Applies one operation to the local state. Dispatch is by action
/// type; unknown actions are an error so schema drift surfaces instead
/// of being silently dropped. Full-state imports do not pass through
/// here; the orchestrator routes them to `load_full_state`.
pub fn apply_operation(
    conn: &Connection,
    db_key: &Key,
    store: &mut StateStore,
    op: &Operation,
) -> Result<()> {
    if op.is_import() {
        return Err(anyhow!("state imports are applied via load_full_state"));
    }

    let state = &mut store.snapshot;
    match op.action_type.as_str() {
        "task.upsert.v1" => {
            let task: Task = serde_json::from_value(op.payload.clone())?;
            if task.id.is_empty() {
                return Err(anyhow!("task upsert missing id"));
            }
            let newer = state
                .tasks
                .get(&task.id)
                .map_or(true, |existing| task.updated_at_ms >= existing.updated_at_ms);
            if newer {
                state.archived_tasks.remove(&task.id);
                state.tasks.insert(task.id.clone(), task);
            }
        }
        "task.delete.v1" => {
            let id = required_str(&op.payload, "id")?;
            state.tasks.remove(id);
            if state.archived_tasks.remove(id).is_some() {
                db::replace_archive(conn, db_key, &state.archived_tasks)?;
            }
        }
        "task.archive.v1" => {
            let id = required_str(&op.payload, "id")?;
            if let Some(task) = state.tasks.remove(id) {
                db::archive_task(conn, db_key, &task)?;
                state.archived_tasks.insert(task.id.clone(), task);
            }
        }
        "project.upsert.v1" => {
            let project: Project = serde_json::from_value(op.payload.clone())?;
            if project.id.is_empty() {
                return Err(anyhow!("project upsert missing id"));
            }
            state.projects.insert(project.id.clone(), project);
        }
        "project.delete.v1" => {
            let id = required_str(&op.payload, "id")?;
            state.projects.remove(id);
            for task in state.tasks.values_mut() {
                if task.project_id.as_deref() == Some(id) {
                    task.project_id = None;
                }
            }
        }
        "tag.upsert.v1" => {
            let tag: Tag = serde_json::from_value(op.payload.clone())?;
            if tag.id.is_empty() {
                return Err(anyhow!("tag upsert missing id"));
            }
            state.tags.insert(tag.id.clone(), tag);
        }
        "tag.delete.v1" => {
            let id = required_str(&op.payload, "id")?;
            state.tags.remove(id);
            for task in state.tasks.values_mut() {
                task.tag_ids.retain(|t| t != id);
            }
        }
        "config.update.v1" => {
            let config: AppConfig = serde_json::from_value(op.payload.clone())?;
            state.config = config;
        }
        other => return Err(anyhow!("unsupported sync op type: {other}")),
    }

    Ok(())
}

fn required_str<'a>(payload: &'a serde_json::Value, field: &str) -> Result<&'a str> {
    payload[field]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("op payload missing {field}"))
}
