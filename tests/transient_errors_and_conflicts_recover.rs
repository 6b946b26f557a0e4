use std::sync::atomic::{AtomicU32, Ordering};

use taskloop::clock::VectorClock;
use taskloop::db;
use taskloop::error::TransportError;
use taskloop::op::EntityType;
use taskloop::oplog;
use taskloop::provider::{
    DownloadedOps, InMemorySyncProvider, OpEnvelope, SyncProvider, UploadOutcome,
};
use taskloop::state::{self, StateStore};
use taskloop::sync::SyncEngine;

struct FlakyRemote {
    inner: InMemorySyncProvider,
    download_failures: AtomicU32,
    upload_rejections: AtomicU32,
}

impl FlakyRemote {
    fn new(download_failures: u32, upload_rejections: u32) -> Self {
        Self {
            inner: InMemorySyncProvider::new(),
            download_failures: AtomicU32::new(download_failures),
            upload_rejections: AtomicU32::new(upload_rejections),
        }
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl SyncProvider for FlakyRemote {
    fn provider_id(&self) -> &str {
        self.inner.provider_id()
    }
    fn download_ops(&self, since_seq: i64, limit: Option<usize>) -> anyhow::Result<DownloadedOps> {
        if Self::take(&self.download_failures) {
            return Err(TransportError::retryable("connection reset").into());
        }
        self.inner.download_ops(since_seq, limit)
    }
    fn upload_ops(&self, envelopes: &[OpEnvelope]) -> anyhow::Result<UploadOutcome> {
        if Self::take(&self.upload_rejections) {
            return Ok(UploadOutcome::rejected(
                self.inner.download_ops(0, Some(1))?.latest_seq,
                "sequence mismatch",
            ));
        }
        self.inner.upload_ops(envelopes)
    }
    fn upload_snapshot(
        &self,
        payload: &[u8],
        op_id: &str,
        client_id: &str,
        vector_clock: &VectorClock,
        is_encrypted: bool,
    ) -> anyhow::Result<UploadOutcome> {
        self.inner
            .upload_snapshot(payload, op_id, client_id, vector_clock, is_encrypted)
    }
    fn delete_all_data(&self) -> anyhow::Result<()> {
        self.inner.delete_all_data()
    }
}

fn client_with_task(id: &str) -> (tempfile::TempDir, rusqlite::Connection, [u8; 32], StateStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let conn = db::open(dir.path()).expect("open");
    let db_key = [7u8; 32];
    let mut store = StateStore::seeded(0);
    let client_id = db::get_or_create_client_id(&conn).expect("client id");
    let op = oplog::record_local_op(
        &conn,
        &db_key,
        &client_id,
        "task.upsert.v1",
        EntityType::Task,
        serde_json::json!({"id": id, "title": id, "created_at_ms": 1, "updated_at_ms": 1}),
    )
    .expect("record");
    state::apply_operation(&conn, &db_key, &mut store, &op).expect("apply");
    (dir, conn, db_key, store)
}

#[test]
fn transient_download_failures_are_retried_with_backoff() {
    let (_dir, conn, db_key, mut store) = client_with_task("t1");

    // Two failures fit inside the retry budget.
    let engine = SyncEngine::new(FlakyRemote::new(2, 0));
    let summary = engine
        .sync_once(&conn, &db_key, &mut store, None)
        .expect("sync survives transient failures");
    assert_eq!(summary.uploaded, 1);
}

#[test]
fn upload_rejection_triggers_redownload_then_retry() {
    let (_dir, conn, db_key, mut store) = client_with_task("t1");

    let engine = SyncEngine::new(FlakyRemote::new(0, 1));
    let summary = engine
        .sync_once(&conn, &db_key, &mut store, None)
        .expect("sync recovers from one rejection");
    assert_eq!(summary.uploaded, 1);
    assert!(oplog::pending_local_ops(&conn, &db_key)
        .expect("pending")
        .is_empty());

    let remote = engine.provider().download_ops(0, None).expect("download");
    assert_eq!(remote.ops.len(), 1);
}

#[test]
fn persistent_rejection_surfaces_a_conflict_error() {
    let (_dir, conn, db_key, mut store) = client_with_task("t1");

    let engine = SyncEngine::new(FlakyRemote::new(0, u32::MAX));
    let err = engine
        .sync_once(&conn, &db_key, &mut store, None)
        .expect_err("must give up after one recovery attempt");
    assert!(err.is::<taskloop::error::ConflictError>(), "got: {err:#}");

    // The op stays pending for the next cycle; nothing was lost.
    assert_eq!(
        oplog::pending_local_ops(&conn, &db_key)
            .expect("pending")
            .len(),
        1
    );
}
