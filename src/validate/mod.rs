use std::collections::BTreeSet;

use crate::error::ValidationError;
use crate::model::AppStateSnapshot;

/// Result of the structural-integrity pass over a snapshot.
#[derive(Clone, Debug)]
pub enum RepairOutcome {
    /// Every invariant holds; use the snapshot as-is.
    Valid,
    /// Defects were found and fixed; callers must use `state` (and, if
    /// they keep local state, reload it) instead of the original.
    Repaired {
        state: AppStateSnapshot,
        summary: Vec<String>,
    },
    /// Unrepairable. The snapshot must not be used as an import payload.
    Invalid { error: ValidationError },
}

impl RepairOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, RepairOutcome::Valid)
    }
}

/// Checks referential integrity across the snapshot and either passes it
/// through, returns a repaired copy with a human-readable summary, or
/// fails closed. Pure: the input is never mutated, callers decide
/// whether to persist the repaired copy.
///
/// Unrepairable defects are those where identity itself is unknowable
/// (blank IDs, a collection key disagreeing with the entity's own ID).
/// Everything referential is repaired by detaching the dangling edge.
pub fn validate_and_repair(snapshot: &AppStateSnapshot) -> RepairOutcome {
    if let Some(error) = find_terminal_defect(snapshot) {
        return RepairOutcome::Invalid { error };
    }

    let mut state = snapshot.clone();
    let mut summary: Vec<String> = Vec::new();

    // Archived copy of a live task: the live one wins.
    let duplicate_ids: Vec<String> = state
        .archived_tasks
        .keys()
        .filter(|id| state.tasks.contains_key(*id))
        .cloned()
        .collect();
    for id in duplicate_ids {
        state.archived_tasks.remove(&id);
        summary.push(format!("dropped archived duplicate of live task {id}"));
    }

    let project_ids: BTreeSet<String> = state.projects.keys().cloned().collect();
    let tag_ids: BTreeSet<String> = state.tags.keys().cloned().collect();
    let live_task_ids: BTreeSet<String> = state.tasks.keys().cloned().collect();

    for task in state.tasks.values_mut() {
        repair_task_refs(task, &project_ids, &tag_ids, &live_task_ids, &mut summary);
    }
    for task in state.archived_tasks.values_mut() {
        // Archived tasks keep no parent links; their project/tag refs
        // are cleaned the same way as live ones.
        if task.parent_id.take().is_some() {
            summary.push(format!("detached archived task {} from its parent", task.id));
        }
        repair_task_refs(task, &project_ids, &tag_ids, &BTreeSet::new(), &mut summary);
    }

    break_parent_cycles(&mut state, &mut summary);

    if summary.is_empty() {
        RepairOutcome::Valid
    } else {
        RepairOutcome::Repaired { state, summary }
    }
}

fn find_terminal_defect(snapshot: &AppStateSnapshot) -> Option<ValidationError> {
    for (key, task) in &snapshot.tasks {
        if key.is_empty() || task.id.is_empty() {
            return Some(ValidationError::new("task with blank id"));
        }
        if key != &task.id {
            return Some(ValidationError::new(format!(
                "task keyed {key} carries id {}",
                task.id
            )));
        }
    }
    for (key, project) in &snapshot.projects {
        if key.is_empty() || project.id.is_empty() || key != &project.id {
            return Some(ValidationError::new("project with blank or mismatched id"));
        }
    }
    for (key, tag) in &snapshot.tags {
        if key.is_empty() || tag.id.is_empty() || key != &tag.id {
            return Some(ValidationError::new("tag with blank or mismatched id"));
        }
    }
    for (key, task) in &snapshot.archived_tasks {
        if key.is_empty() || task.id.is_empty() || key != &task.id {
            return Some(ValidationError::with_cross_model(
                "archived task with blank or mismatched id",
                "cold-storage archive disagrees with live model",
            ));
        }
    }
    None
}

fn repair_task_refs(
    task: &mut crate::model::Task,
    project_ids: &BTreeSet<String>,
    tag_ids: &BTreeSet<String>,
    live_task_ids: &BTreeSet<String>,
    summary: &mut Vec<String>,
) {
    if let Some(project_id) = task.project_id.clone() {
        if !project_ids.contains(&project_id) {
            task.project_id = None;
            summary.push(format!(
                "cleared missing project {project_id} from task {}",
                task.id
            ));
        }
    }

    if let Some(parent_id) = task.parent_id.clone() {
        if parent_id == task.id || !live_task_ids.contains(&parent_id) {
            task.parent_id = None;
            summary.push(format!(
                "detached task {} from missing parent {parent_id}",
                task.id
            ));
        }
    }

    let before = task.tag_ids.len();
    task.tag_ids.retain(|tag_id| tag_ids.contains(tag_id));
    if task.tag_ids.len() != before {
        summary.push(format!("stripped stale tags from task {}", task.id));
    }
}

fn break_parent_cycles(state: &mut AppStateSnapshot, summary: &mut Vec<String>) {
    let ids: Vec<String> = state.tasks.keys().cloned().collect();
    for start in ids {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut current = start.clone();
        loop {
            if !seen.insert(current.clone()) {
                // Walked back onto a visited node; that node is inside
                // the cycle (the start may only be a tail leading into
                // it), so the cycle is broken there.
                if let Some(task) = state.tasks.get_mut(&current) {
                    if task.parent_id.take().is_some() {
                        summary.push(format!("broke parent cycle at task {current}"));
                    }
                }
                break;
            }
            match state.tasks.get(&current).and_then(|t| t.parent_id.clone()) {
                Some(parent) => current = parent,
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppStateSnapshot, Task};

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            title: id.to_string(),
            created_at_ms: 1,
            updated_at_ms: 1,
            ..Task::default()
        }
    }

    fn snapshot_with_tasks(tasks: &[Task]) -> AppStateSnapshot {
        let mut snapshot = AppStateSnapshot::seeded(0);
        for t in tasks {
            snapshot.tasks.insert(t.id.clone(), t.clone());
        }
        snapshot
    }

    #[test]
    fn clean_snapshot_passes_through() {
        let snapshot = snapshot_with_tasks(&[task("t1")]);
        assert!(validate_and_repair(&snapshot).is_valid());
    }

    #[test]
    fn orphaned_project_reference_is_cleared() {
        let mut broken = task("t1");
        broken.project_id = Some("ghost".to_string());
        let snapshot = snapshot_with_tasks(&[broken]);

        match validate_and_repair(&snapshot) {
            RepairOutcome::Repaired { state, summary } => {
                assert!(state.tasks["t1"].project_id.is_none());
                assert_eq!(summary.len(), 1);
                assert!(summary[0].contains("ghost"));
            }
            other => panic!("expected repair, got {other:?}"),
        }
    }

    #[test]
    fn missing_parent_is_detached() {
        let mut child = task("child");
        child.parent_id = Some("nonexistent".to_string());
        let snapshot = snapshot_with_tasks(&[child]);

        match validate_and_repair(&snapshot) {
            RepairOutcome::Repaired { state, .. } => {
                assert!(state.tasks["child"].parent_id.is_none());
            }
            other => panic!("expected repair, got {other:?}"),
        }
    }

    #[test]
    fn self_parent_is_detached() {
        let mut looped = task("t1");
        looped.parent_id = Some("t1".to_string());
        let snapshot = snapshot_with_tasks(&[looped]);

        match validate_and_repair(&snapshot) {
            RepairOutcome::Repaired { state, .. } => {
                assert!(state.tasks["t1"].parent_id.is_none());
            }
            other => panic!("expected repair, got {other:?}"),
        }
    }

    #[test]
    fn parent_cycle_is_broken() {
        let mut a = task("a");
        a.parent_id = Some("b".to_string());
        let mut b = task("b");
        b.parent_id = Some("a".to_string());
        let snapshot = snapshot_with_tasks(&[a, b]);

        match validate_and_repair(&snapshot) {
            RepairOutcome::Repaired { state, summary } => {
                let detached = state
                    .tasks
                    .values()
                    .filter(|t| t.parent_id.is_none())
                    .count();
                assert!(detached >= 1, "cycle must be broken: {summary:?}");
            }
            other => panic!("expected repair, got {other:?}"),
        }
    }

    #[test]
    fn stale_tag_references_are_stripped() {
        let mut tagged = task("t1");
        tagged.tag_ids = vec!["TODAY".to_string(), "deleted-tag".to_string()];
        let snapshot = snapshot_with_tasks(&[tagged]);

        match validate_and_repair(&snapshot) {
            RepairOutcome::Repaired { state, .. } => {
                assert_eq!(state.tasks["t1"].tag_ids, vec!["TODAY".to_string()]);
            }
            other => panic!("expected repair, got {other:?}"),
        }
    }

    #[test]
    fn archived_duplicate_of_live_task_is_dropped() {
        let mut snapshot = snapshot_with_tasks(&[task("t1")]);
        snapshot.archived_tasks.insert("t1".to_string(), task("t1"));

        match validate_and_repair(&snapshot) {
            RepairOutcome::Repaired { state, .. } => {
                assert!(state.tasks.contains_key("t1"));
                assert!(!state.archived_tasks.contains_key("t1"));
            }
            other => panic!("expected repair, got {other:?}"),
        }
    }

    #[test]
    fn blank_task_id_fails_closed() {
        let mut snapshot = AppStateSnapshot::seeded(0);
        snapshot.tasks.insert(String::new(), task(""));

        match validate_and_repair(&snapshot) {
            RepairOutcome::Invalid { error } => {
                assert!(error.message.contains("blank"));
                assert!(error.cross_model.is_none());
            }
            other => panic!("expected invalid, got {other:?}"),
        }
    }

    #[test]
    fn blank_archive_id_carries_cross_model_detail() {
        let mut snapshot = AppStateSnapshot::seeded(0);
        snapshot.archived_tasks.insert(String::new(), task(""));

        match validate_and_repair(&snapshot) {
            RepairOutcome::Invalid { error } => {
                assert!(error.cross_model.is_some());
            }
            other => panic!("expected invalid, got {other:?}"),
        }
    }
}
