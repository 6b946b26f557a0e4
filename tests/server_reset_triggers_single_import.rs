use taskloop::clock::ClockOrdering;
use taskloop::db;
use taskloop::op::EntityType;
use taskloop::oplog;
use taskloop::provider::{EnvelopeKind, InMemorySyncProvider, SyncProvider};
use taskloop::state::{self, StateStore};
use taskloop::sync::SyncEngine;

fn record_task(
    conn: &rusqlite::Connection,
    db_key: &[u8; 32],
    store: &mut StateStore,
    id: &str,
) {
    let client_id = db::get_or_create_client_id(conn).expect("client id");
    let op = oplog::record_local_op(
        conn,
        db_key,
        &client_id,
        "task.upsert.v1",
        EntityType::Task,
        serde_json::json!({"id": id, "title": id, "created_at_ms": 1, "updated_at_ms": 1}),
    )
    .expect("record");
    state::apply_operation(conn, db_key, store, &op).expect("apply");
}

#[test]
fn synced_client_reseeds_an_emptied_server_with_one_import() {
    let dir = tempfile::tempdir().expect("tempdir");
    let conn = db::open(dir.path()).expect("open");
    let db_key = [1u8; 32];
    let mut store = StateStore::seeded(0);
    let client_id = db::get_or_create_client_id(&conn).expect("client id");

    record_task(&conn, &db_key, &mut store, "t1");
    record_task(&conn, &db_key, &mut store, "t2");
    record_task(&conn, &db_key, &mut store, "t3");

    // First life: normal sync against the old server.
    let old_server = SyncEngine::new(InMemorySyncProvider::new());
    old_server
        .sync_once(&conn, &db_key, &mut store, None)
        .expect("initial sync");
    assert!(oplog::has_synced_ops(&conn).expect("synced"));

    let pre_import_clocks: Vec<_> = oplog::all_ops(&conn, &db_key)
        .expect("all ops")
        .into_iter()
        .map(|s| s.op.vector_clock)
        .collect();
    assert_eq!(pre_import_clocks.len(), 3);

    // The admin replaced the server; this client connects to the new,
    // empty instance (a provider it has no cursor for).
    let new_server = SyncEngine::new(InMemorySyncProvider::new());
    let summary = new_server
        .sync_once(&conn, &db_key, &mut store, None)
        .expect("migration sync");

    assert!(summary.import_created);

    // Exactly one snapshot envelope reached the new server.
    let remote = new_server
        .provider()
        .download_ops(0, None)
        .expect("download");
    let snapshots: Vec<_> = remote
        .ops
        .iter()
        .filter(|o| o.envelope.kind == EnvelopeKind::Snapshot)
        .collect();
    assert_eq!(snapshots.len(), 1);

    let import_clock = snapshots[0]
        .envelope
        .vector_clock
        .clone()
        .expect("clock metadata");

    // The import dominates every pre-existing operation.
    for clock in &pre_import_clocks {
        assert_eq!(import_clock.compare(clock), ClockOrdering::GreaterThan);
    }

    // Protected IDs cover the import's clock keys (here: this client).
    let protected = oplog::get_protected_client_ids(&conn).expect("protected");
    assert!(protected.contains(&client_id));
    for id in import_clock.client_ids() {
        assert!(protected.contains(id), "unprotected clock key {id}");
    }

    // A repeat cycle must not create a second import.
    let again = new_server
        .sync_once(&conn, &db_key, &mut store, None)
        .expect("repeat sync");
    assert!(!again.import_created);
    let remote = new_server
        .provider()
        .download_ops(0, None)
        .expect("download");
    let snapshot_count = remote
        .ops
        .iter()
        .filter(|o| o.envelope.kind == EnvelopeKind::Snapshot)
        .count();
    assert_eq!(snapshot_count, 1);
}
