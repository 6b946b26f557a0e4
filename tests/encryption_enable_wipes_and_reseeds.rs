use taskloop::crypto::KdfParams;
use taskloop::db;
use taskloop::error::ConfigError;
use taskloop::op::EntityType;
use taskloop::oplog;
use taskloop::provider::{InMemorySyncProvider, SyncProvider};
use taskloop::state::{self, StateStore};
use taskloop::sync::SyncEngine;

fn client_with_data() -> (tempfile::TempDir, rusqlite::Connection, [u8; 32], StateStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let conn = db::open(dir.path()).expect("open");
    let db_key = [9u8; 32];
    let mut store = StateStore::seeded(0);

    let client_id = db::get_or_create_client_id(&conn).expect("client id");
    let op = oplog::record_local_op(
        &conn,
        &db_key,
        &client_id,
        "task.upsert.v1",
        EntityType::Task,
        serde_json::json!({"id": "t1", "title": "secret plan", "created_at_ms": 1, "updated_at_ms": 1}),
    )
    .expect("record");
    state::apply_operation(&conn, &db_key, &mut store, &op).expect("apply");

    (dir, conn, db_key, store)
}

#[test]
fn enabling_encryption_reseeds_the_remote_encrypted() {
    let (_dir, conn, db_key, mut store) = client_with_data();

    let engine = SyncEngine::new(InMemorySyncProvider::new());
    engine
        .sync_once(&conn, &db_key, &mut store, None)
        .expect("plaintext sync");

    let wire_key = engine
        .enable_encryption(&conn, &db_key, &mut store, "hunter2", &KdfParams::for_test())
        .expect("enable encryption");

    // The remote holds exactly one envelope now, and it is encrypted.
    let remote = engine.provider().download_ops(0, None).expect("download");
    assert_eq!(remote.ops.len(), 1);
    assert!(remote.ops[0].envelope.is_encrypted);
    let raw = remote.ops[0].envelope.body().expect("body");
    assert!(!String::from_utf8_lossy(&raw).contains("secret plan"));

    // Local config records the switch.
    let cfg = oplog::get_private_cfg(&conn, &db_key, engine.provider().provider_id())
        .expect("cfg");
    assert!(cfg.is_encryption_enabled);
    assert!(cfg.encrypt_key_fingerprint.is_some());

    // A fresh device with the same passphrase-derived key can join.
    let dir_b = tempfile::tempdir().expect("tempdir b");
    let conn_b = db::open(dir_b.path()).expect("open b");
    let mut store_b = StateStore::seeded(0);
    let summary_b = engine
        .sync_once(&conn_b, &db_key, &mut store_b, Some(&wire_key))
        .expect("b sync");
    assert_eq!(summary_b.applied, 1);
    assert!(store_b.current().tasks.contains_key("t1"));

    // Without the key the cycle fails with a config error, not a crash.
    let dir_c = tempfile::tempdir().expect("tempdir c");
    let conn_c = db::open(dir_c.path()).expect("open c");
    let mut store_c = StateStore::seeded(0);
    let err = engine
        .sync_once(&conn_c, &db_key, &mut store_c, None)
        .expect_err("must fail without key");
    assert!(err.is::<ConfigError>(), "got: {err:#}");
}
