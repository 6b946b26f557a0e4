use taskloop::clock::VectorClock;
use taskloop::crypto::KdfParams;
use taskloop::db;
use taskloop::error::TransportError;
use taskloop::op::EntityType;
use taskloop::oplog;
use taskloop::provider::{
    DownloadedOps, InMemorySyncProvider, OpEnvelope, SyncProvider, UploadOutcome,
};
use taskloop::state::{self, StateStore};
use taskloop::sync::SyncEngine;

/// Remote that accepts everything except snapshot uploads, simulating a
/// server that dies right after the destructive wipe.
struct SnapshotRejectingRemote {
    inner: InMemorySyncProvider,
}

impl SyncProvider for SnapshotRejectingRemote {
    fn provider_id(&self) -> &str {
        self.inner.provider_id()
    }
    fn download_ops(&self, since_seq: i64, limit: Option<usize>) -> anyhow::Result<DownloadedOps> {
        self.inner.download_ops(since_seq, limit)
    }
    fn upload_ops(&self, envelopes: &[OpEnvelope]) -> anyhow::Result<UploadOutcome> {
        self.inner.upload_ops(envelopes)
    }
    fn upload_snapshot(
        &self,
        _payload: &[u8],
        _op_id: &str,
        _client_id: &str,
        _vector_clock: &VectorClock,
        _is_encrypted: bool,
    ) -> anyhow::Result<UploadOutcome> {
        Err(TransportError::fatal("snapshot endpoint unavailable").into())
    }
    fn delete_all_data(&self) -> anyhow::Result<()> {
        self.inner.delete_all_data()
    }
}

#[test]
fn failed_reupload_rolls_back_the_encryption_config() {
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
        serde_json::json!({"id": "t1", "title": "x", "created_at_ms": 1, "updated_at_ms": 1}),
    )
    .expect("record");
    state::apply_operation(&conn, &db_key, &mut store, &op).expect("apply");

    let engine = SyncEngine::new(SnapshotRejectingRemote {
        inner: InMemorySyncProvider::new(),
    });
    engine
        .sync_once(&conn, &db_key, &mut store, None)
        .expect("plaintext sync");
    let provider_id = engine.provider().provider_id().to_string();
    let cursor_before = oplog::get_last_server_seq(&conn, &db_key, &provider_id)
        .expect("cursor");
    assert!(cursor_before > 0);

    let err = engine
        .enable_encryption(&conn, &db_key, &mut store, "hunter2", &KdfParams::for_test())
        .expect_err("snapshot upload must fail");
    assert!(err.is::<TransportError>(), "got: {err:#}");

    // Local config must not claim encryption the remote does not hold.
    let cfg = oplog::get_private_cfg(&conn, &db_key, &provider_id).expect("cfg");
    assert!(!cfg.is_encryption_enabled);
    assert!(cfg.encrypt_key_fingerprint.is_none());
    assert_eq!(cfg.last_server_seq, cursor_before);

    // The re-seed import survived locally, pending upload, so the next
    // healthy cycle can restore the wiped remote.
    let pending = oplog::pending_local_ops(&conn, &db_key).expect("pending");
    assert!(pending.iter().any(|s| s.op.is_import()));
}
