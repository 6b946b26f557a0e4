use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::clock::{ClockOrdering, VectorClock};
use crate::crypto::{self, Key};
use crate::db;
use crate::error::{is_retryable, ConfigError, ConflictError};
use crate::migrate::{self, MigrationDecision};
use crate::op::{Operation, Origin};
use crate::oplog;
use crate::provider::{EnvelopeKind, OpEnvelope, RemoteOp, SyncProvider};
use crate::state::{self, StateStore};
use crate::validate::{validate_and_repair, RepairOutcome};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 250;

/// Fixed application salt for deriving the wire key from a passphrase.
/// Every device of one user must derive the same key.
const WIRE_KEY_SALT: &[u8] = b"taskloop-sync-wire-v1";

/// Stages of one sync cycle; any failure returns the engine to idle
/// with the error surfaced and no partially applied operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncPhase {
    Idle,
    CheckingMigration,
    Downloading,
    Applying,
    Uploading,
}

#[derive(Clone, Debug, Default)]
pub struct SyncSummary {
    pub downloaded: u64,
    pub applied: u64,
    pub conflicts: u64,
    pub uploaded: u64,
    pub import_created: bool,
    /// Set when the provider generation changed mid-cycle (the user
    /// switched providers); results of in-flight calls were discarded.
    pub aborted: bool,
}

/// Drives the steady-state loop against one provider. One local log,
/// one writer: the upload lock serializes full cycles with the
/// encryption-enable flow, both of which can be triggered independently.
pub struct SyncEngine<P: SyncProvider> {
    provider: P,
    upload_lock: Mutex<()>,
    generation: AtomicU64,
    last_cycle_started: Mutex<Option<Instant>>,
}

impl<P: SyncProvider> SyncEngine<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            upload_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            last_cycle_started: Mutex::new(None),
        }
    }

    /// Coalesces bursty triggers (every keystroke can request a sync):
    /// a cycle runs only when none started within `min_interval`.
    /// Returns `None` when the trigger was absorbed.
    pub fn sync_debounced(
        &self,
        conn: &Connection,
        db_key: &Key,
        store: &mut StateStore,
        wire_key: Option<&Key>,
        min_interval: Duration,
    ) -> Result<Option<SyncSummary>> {
        {
            let mut last = self
                .last_cycle_started
                .lock()
                .map_err(|_| anyhow!("sync engine lock poisoned"))?;
            if let Some(started) = *last {
                if started.elapsed() < min_interval {
                    return Ok(None);
                }
            }
            *last = Some(Instant::now());
        }
        self.sync_once(conn, db_key, store, wire_key).map(Some)
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Called when the user switches providers or rewrites credentials.
    /// In-flight provider calls are not hard-cancelled; the running
    /// cycle notices the bump and discards their results.
    pub fn invalidate_in_flight(&self) {
        self.generation.fetch_add(1, AtomicOrdering::SeqCst);
    }

    fn generation_now(&self) -> u64 {
        self.generation.load(AtomicOrdering::SeqCst)
    }
}

fn with_retries<T>(what: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if attempt < RETRY_ATTEMPTS && is_retryable(&e) => {
                debug!(what, attempt, "transient failure, backing off");
                thread::sleep(Duration::from_millis(RETRY_BACKOFF_MS * u64::from(attempt)));
            }
            Err(e) => return Err(e),
        }
    }
}

fn wire_aad(op_id: &str) -> String {
    format!("sync.op:{op_id}")
}

/// Serializes an operation into its transport envelope, encrypting the
/// body when a wire key is configured.
fn seal_op(op: &Operation, wire_key: Option<&Key>) -> Result<OpEnvelope> {
    let plaintext = op.to_wire_bytes()?;
    let kind = if op.is_import() {
        EnvelopeKind::Snapshot
    } else {
        EnvelopeKind::Op
    };

    let mut envelope = match wire_key {
        Some(key) => {
            let body = crypto::encrypt_bytes(key, &plaintext, wire_aad(&op.op_id).as_bytes())?;
            OpEnvelope::new(&op.op_id, &op.client_id, kind, &body, true)
        }
        None => OpEnvelope::new(&op.op_id, &op.client_id, kind, &plaintext, false),
    };
    if kind == EnvelopeKind::Snapshot {
        envelope.vector_clock = Some(op.vector_clock.clone());
    }
    Ok(envelope)
}

/// Reverses `seal_op`. An encrypted envelope without a configured wire
/// key is a configuration error, not a transport one: retrying cannot
/// help until the user supplies the passphrase.
fn open_envelope(envelope: &OpEnvelope, wire_key: Option<&Key>) -> Result<Operation> {
    let body = envelope.body()?;
    let plaintext = if envelope.is_encrypted {
        let Some(key) = wire_key else {
            return Err(ConfigError::new(format!(
                "remote op {} is encrypted but no sync passphrase is configured",
                envelope.op_id
            ))
            .into());
        };
        crypto::decrypt_bytes(key, &body, wire_aad(&envelope.op_id).as_bytes())?
    } else {
        body
    };

    let op = Operation::from_wire_bytes(&plaintext)?;
    if op.op_id != envelope.op_id {
        return Err(anyhow!(
            "envelope {} carries operation {}",
            envelope.op_id,
            op.op_id
        ));
    }
    Ok(op)
}
