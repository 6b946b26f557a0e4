use taskloop::db;
use taskloop::error::ValidationError;
use taskloop::model::{AppStateSnapshot, Task};
use taskloop::op::EntityType;
use taskloop::oplog;
use taskloop::provider::{EnvelopeKind, InMemorySyncProvider, SyncProvider};
use taskloop::state::{self, StateStore};
use taskloop::sync::SyncEngine;

fn task(id: &str, title: &str) -> Task {
    Task {
        id: id.to_string(),
        title: title.to_string(),
        created_at_ms: 1,
        updated_at_ms: 1,
        ..Task::default()
    }
}

/// Builds a client whose op history already counts as synced, so a
/// subsequent empty remote triggers the migration path.
fn synced_client() -> (tempfile::TempDir, rusqlite::Connection, [u8; 32], StateStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let conn = db::open(dir.path()).expect("open");
    let db_key = [6u8; 32];
    let mut store = StateStore::seeded(0);

    let client_id = db::get_or_create_client_id(&conn).expect("client id");
    let op = oplog::record_local_op(
        &conn,
        &db_key,
        &client_id,
        "task.upsert.v1",
        EntityType::Task,
        serde_json::json!({"id": "t1", "title": "real work", "created_at_ms": 1, "updated_at_ms": 1}),
    )
    .expect("record");
    state::apply_operation(&conn, &db_key, &mut store, &op).expect("apply");

    let first_server = SyncEngine::new(InMemorySyncProvider::new());
    first_server
        .sync_once(&conn, &db_key, &mut store, None)
        .expect("initial sync");

    (dir, conn, db_key, store)
}

#[test]
fn unrepairable_state_aborts_migration_and_surfaces_validation_error() {
    let (_dir, conn, db_key, _store) = synced_client();

    // Simulated disk corruption: a task with no identity.
    let mut corrupt = AppStateSnapshot::seeded(0);
    corrupt.tasks.insert(String::new(), task("", "ghost"));
    let mut store = StateStore::new(corrupt);

    let new_server = SyncEngine::new(InMemorySyncProvider::new());
    let err = new_server
        .sync_once(&conn, &db_key, &mut store, None)
        .expect_err("migration must fail closed");
    assert!(err.is::<ValidationError>(), "got: {err:#}");

    // Nothing was created locally or remotely.
    let pending = oplog::pending_local_ops(&conn, &db_key).expect("pending");
    assert!(pending.iter().all(|s| !s.op.is_import()));
    let probe = new_server
        .provider()
        .download_ops(0, Some(1))
        .expect("probe");
    assert_eq!(probe.latest_seq, 0);
}

#[test]
fn repairable_state_migrates_with_the_repaired_payload() {
    let (_dir, conn, db_key, _store) = synced_client();

    // The live task points at a project that no longer exists.
    let mut damaged = AppStateSnapshot::seeded(0);
    let mut broken = task("t1", "real work");
    broken.project_id = Some("deleted-project".to_string());
    damaged.tasks.insert("t1".to_string(), broken);
    let mut store = StateStore::new(damaged);

    let new_server = SyncEngine::new(InMemorySyncProvider::new());
    let summary = new_server
        .sync_once(&conn, &db_key, &mut store, None)
        .expect("migration sync");
    assert!(summary.import_created);

    // The local client was reloaded with the repaired state.
    assert!(store.current().tasks["t1"].project_id.is_none());

    // The uploaded payload is the repaired snapshot, not the original:
    // a fresh device importing it sees the cleared reference too.
    let dir_b = tempfile::tempdir().expect("tempdir b");
    let conn_b = db::open(dir_b.path()).expect("open b");
    let mut store_b = StateStore::seeded(0);
    new_server
        .sync_once(&conn_b, &db_key, &mut store_b, None)
        .expect("b sync");
    assert!(store_b.current().tasks["t1"].project_id.is_none());

    let remote = new_server
        .provider()
        .download_ops(0, None)
        .expect("download");
    assert_eq!(
        remote
            .ops
            .iter()
            .filter(|o| o.envelope.kind == EnvelopeKind::Snapshot)
            .count(),
        1
    );
}
