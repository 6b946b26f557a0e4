pub mod files;
pub mod hosted;
pub mod webdav;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as B64_STD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Op,
    /// Full-state import seeding or resynchronizing the remote.
    Snapshot,
}

/// Wire unit exchanged with a provider. The body is an opaque serialized
/// operation (ciphertext when encryption is enabled); `op_id`,
/// `client_id` and (for snapshots) the vector clock ride alongside in
/// plaintext so backends can store and serve them as metadata without
/// decrypting anything.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpEnvelope {
    pub op_id: String,
    pub client_id: String,
    pub kind: EnvelopeKind,
    pub body_b64: String,
    pub is_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_clock: Option<VectorClock>,
}

impl OpEnvelope {
    pub fn new(
        op_id: &str,
        client_id: &str,
        kind: EnvelopeKind,
        body: &[u8],
        is_encrypted: bool,
    ) -> Self {
        Self {
            op_id: op_id.to_string(),
            client_id: client_id.to_string(),
            kind,
            body_b64: B64_STD.encode(body),
            is_encrypted,
            vector_clock: None,
        }
    }

    pub fn body(&self) -> Result<Vec<u8>> {
        Ok(B64_STD.decode(&self.body_b64)?)
    }
}

/// One remote log entry: the server-assigned sequence number plus the
/// envelope as uploaded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteOp {
    pub server_seq: i64,
    pub envelope: OpEnvelope,
}

#[derive(Clone, Debug, Default)]
pub struct DownloadedOps {
    pub ops: Vec<RemoteOp>,
    /// Highest sequence the remote holds, regardless of `limit`.
    /// `0` means the remote is empty; migration relies on this probe.
    pub latest_seq: i64,
}

#[derive(Clone, Debug)]
pub struct UploadOutcome {
    pub accepted: bool,
    pub server_seq: i64,
    pub error: Option<String>,
}

impl UploadOutcome {
    pub fn accepted(server_seq: i64) -> Self {
        Self {
            accepted: true,
            server_seq,
            error: None,
        }
    }

    pub fn rejected(server_seq: i64, error: impl Into<String>) -> Self {
        Self {
            accepted: false,
            server_seq,
            error: Some(error.into()),
        }
    }
}

/// Remote operation transport. Implementations must keep one totally
/// ordered log per sync scope: sequence numbers are assigned by the
/// backend, start at 1, and never repeat.
pub trait SyncProvider: Send + Sync {
    /// Stable identifier for local bookkeeping (cursor and config keys).
    fn provider_id(&self) -> &str;

    /// Ops with sequence number greater than `since_seq`, oldest first.
    /// Must be cheap with `limit = Some(1)`: that call is used purely to
    /// probe emptiness without pulling history.
    fn download_ops(&self, since_seq: i64, limit: Option<usize>) -> Result<DownloadedOps>;

    /// Appends envelopes in the given order. All-or-nothing: a rejection
    /// applies to the whole batch.
    fn upload_ops(&self, envelopes: &[OpEnvelope]) -> Result<UploadOutcome>;

    /// Appends a full-state snapshot envelope. `is_encrypted` and the
    /// clock are stored as plaintext metadata so decryption context is
    /// recoverable without guessing.
    fn upload_snapshot(
        &self,
        payload: &[u8],
        op_id: &str,
        client_id: &str,
        vector_clock: &VectorClock,
        is_encrypted: bool,
    ) -> Result<UploadOutcome>;

    /// Destructive: wipes the remote log. Only invoked after the caller
    /// verified it can re-seed the remote (crypto self-test, forced
    /// local-wins resolution).
    fn delete_all_data(&self) -> Result<()>;
}

/// Emptiness probe per the provider contract.
pub fn remote_is_empty(provider: &dyn SyncProvider) -> Result<bool> {
    let probe = provider.download_ops(0, Some(1))?;
    Ok(probe.latest_seq == 0)
}

static INMEM_NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct InMemoryLog {
    ops: Vec<RemoteOp>,
    latest_seq: i64,
}

/// Test double keeping the remote log in memory. Sequence numbers are
/// server-assigned, mirroring the hosted backend.
pub struct InMemorySyncProvider {
    provider_id: String,
    log: Mutex<InMemoryLog>,
}

impl InMemorySyncProvider {
    pub fn new() -> Self {
        let id = INMEM_NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            provider_id: format!("inmem:{id}"),
            log: Mutex::new(InMemoryLog::default()),
        }
    }

    pub fn op_count(&self) -> usize {
        self.log.lock().expect("provider lock").ops.len()
    }
}

impl Default for InMemorySyncProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncProvider for InMemorySyncProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn download_ops(&self, since_seq: i64, limit: Option<usize>) -> Result<DownloadedOps> {
        let log = self.log.lock().map_err(|_| anyhow!("poisoned lock"))?;
        let mut ops: Vec<RemoteOp> = log
            .ops
            .iter()
            .filter(|entry| entry.server_seq > since_seq)
            .cloned()
            .collect();
        ops.sort_by_key(|entry| entry.server_seq);
        if let Some(limit) = limit {
            ops.truncate(limit);
        }
        Ok(DownloadedOps {
            ops,
            latest_seq: log.latest_seq,
        })
    }

    fn upload_ops(&self, envelopes: &[OpEnvelope]) -> Result<UploadOutcome> {
        let mut log = self.log.lock().map_err(|_| anyhow!("poisoned lock"))?;
        for envelope in envelopes {
            let seq = log.latest_seq + 1;
            log.ops.push(RemoteOp {
                server_seq: seq,
                envelope: envelope.clone(),
            });
            log.latest_seq = seq;
        }
        Ok(UploadOutcome::accepted(log.latest_seq))
    }

    fn upload_snapshot(
        &self,
        payload: &[u8],
        op_id: &str,
        client_id: &str,
        vector_clock: &VectorClock,
        is_encrypted: bool,
    ) -> Result<UploadOutcome> {
        let mut envelope = OpEnvelope::new(
            op_id,
            client_id,
            EnvelopeKind::Snapshot,
            payload,
            is_encrypted,
        );
        envelope.vector_clock = Some(vector_clock.clone());

        let mut log = self.log.lock().map_err(|_| anyhow!("poisoned lock"))?;
        let seq = log.latest_seq + 1;
        log.ops.push(RemoteOp {
            server_seq: seq,
            envelope,
        });
        log.latest_seq = seq;
        Ok(UploadOutcome::accepted(seq))
    }

    fn delete_all_data(&self) -> Result<()> {
        let mut log = self.log.lock().map_err(|_| anyhow!("poisoned lock"))?;
        log.ops.clear();
        log.latest_seq = 0;
        Ok(())
    }
}
