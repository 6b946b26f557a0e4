use std::collections::BTreeSet;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as B64_STD;
use base64::Engine as _;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::clock::{ClockOrdering, VectorClock};
use crate::crypto::{decrypt_bytes, encrypt_bytes, Key};
use crate::db::{kv_get_string, kv_set_string, now_ms};
use crate::op::{EntityType, Operation, Origin};

/// Cap on vector-clock entries carried by newly created operations.
/// Pruning below this never touches protected IDs or the local client.
pub const MAX_CLOCK_ENTRIES: usize = 50;

/// An operation as stored locally: the store-wide insertion sequence
/// number plus the origin tag.
#[derive(Clone, Debug)]
pub struct StoredOp {
    pub seq: i64,
    pub origin: Origin,
    pub op: Operation,
}

/// Per-provider local configuration. Persisted encrypted at rest, keyed
/// by the provider's stable ID. Survives process restart.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PrivateCfg {
    #[serde(default)]
    pub last_server_seq: i64,
    #[serde(default)]
    pub is_encryption_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt_key_fingerprint: Option<String>,
}

/// Appends an operation. Idempotent on `op_id`: re-appending an
/// operation already in the log is a no-op, which makes at-least-once
/// delivery from providers safe. Returns whether a row was inserted.
pub fn append(conn: &Connection, db_key: &Key, op: &Operation, origin: Origin) -> Result<bool> {
    let plaintext = op.to_wire_bytes()?;
    let blob = encrypt_bytes(
        db_key,
        &plaintext,
        format!("oplog.op_json:{}", op.op_id).as_bytes(),
    )?;

    let mut stmt = conn.prepare_cached(
        r#"INSERT OR IGNORE INTO oplog(op_id, client_id, origin, op_json, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5)"#,
    )?;
    let changed = stmt.execute(params![
        op.op_id,
        op.client_id,
        origin.as_str(),
        blob,
        now_ms()
    ])?;
    Ok(changed > 0)
}

fn decode_row(db_key: &Key, op_id: &str, blob: &[u8]) -> Result<Operation> {
    let plaintext = decrypt_bytes(db_key, blob, format!("oplog.op_json:{op_id}").as_bytes())?;
    Operation::from_wire_bytes(&plaintext)
}

/// All locally stored ops with sequence number greater than `seq`, in
/// insertion order.
pub fn ops_after_seq(conn: &Connection, db_key: &Key, seq: i64) -> Result<Vec<StoredOp>> {
    let mut stmt = conn.prepare_cached(
        r#"SELECT seq, op_id, origin, op_json FROM oplog WHERE seq > ?1 ORDER BY seq ASC"#,
    )?;
    let mut rows = stmt.query(params![seq])?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let row_seq: i64 = row.get(0)?;
        let op_id: String = row.get(1)?;
        let origin: String = row.get(2)?;
        let blob: Vec<u8> = row.get(3)?;
        out.push(StoredOp {
            seq: row_seq,
            origin: Origin::parse(&origin)?,
            op: decode_row(db_key, &op_id, &blob)?,
        });
    }
    Ok(out)
}

pub fn all_ops(conn: &Connection, db_key: &Key) -> Result<Vec<StoredOp>> {
    ops_after_seq(conn, db_key, 0)
}

/// Ops produced here and not yet acknowledged by the remote, in strict
/// insertion order. Later ops presuppose earlier ones advanced this
/// client's counter, so upload must preserve this order.
pub fn pending_local_ops(conn: &Connection, db_key: &Key) -> Result<Vec<StoredOp>> {
    let mut stmt = conn.prepare_cached(
        r#"SELECT seq, op_id, origin, op_json FROM oplog
           WHERE origin = 'local' ORDER BY seq ASC"#,
    )?;
    let mut rows = stmt.query([])?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let seq: i64 = row.get(0)?;
        let op_id: String = row.get(1)?;
        let origin: String = row.get(2)?;
        let blob: Vec<u8> = row.get(3)?;
        out.push(StoredOp {
            seq,
            origin: Origin::parse(&origin)?,
            op: decode_row(db_key, &op_id, &blob)?,
        });
    }
    Ok(out)
}

/// True if any stored operation has been exchanged with a remote.
/// Distinguishes "fresh client" from "client with sync history" during
/// migration detection.
pub fn has_synced_ops(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row(
        r#"SELECT count(*) FROM oplog WHERE origin = 'synced'"#,
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn contains_op(conn: &Connection, op_id: &str) -> Result<bool> {
    let existing: Option<i64> = conn
        .query_row(
            r#"SELECT seq FROM oplog WHERE op_id = ?1"#,
            params![op_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(existing.is_some())
}

/// Flips ops to `synced` after the remote acknowledged them.
pub fn mark_synced(conn: &Connection, op_ids: &[String]) -> Result<()> {
    let mut stmt =
        conn.prepare_cached(r#"UPDATE oplog SET origin = 'synced' WHERE op_id = ?1"#)?;
    for op_id in op_ids {
        stmt.execute(params![op_id])?;
    }
    Ok(())
}

/// Marks pending local ops whose clocks are dominated by `import_clock`
/// as synced: their effects are contained in the full-state import the
/// remote already holds, so uploading them would be redundant. Ops
/// concurrent with the import stay pending and upload normally.
pub fn retire_dominated_pending(
    conn: &Connection,
    db_key: &Key,
    import_clock: &VectorClock,
) -> Result<u64> {
    let pending = pending_local_ops(conn, db_key)?;
    let mut retired: Vec<String> = Vec::new();
    for stored in pending {
        if stored.op.vector_clock.compare(import_clock) == ClockOrdering::LessThan {
            retired.push(stored.op.op_id);
        }
    }
    let count = retired.len() as u64;
    mark_synced(conn, &retired)?;
    Ok(count)
}

const PROTECTED_IDS_KEY: &str = "sync.protected_client_ids";
const LOCAL_CLOCK_KEY: &str = "sync.vector_clock";

pub fn get_protected_client_ids(conn: &Connection) -> Result<BTreeSet<String>> {
    match kv_get_string(conn, PROTECTED_IDS_KEY)? {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(BTreeSet::new()),
    }
}

pub fn set_protected_client_ids(conn: &Connection, ids: &BTreeSet<String>) -> Result<()> {
    kv_set_string(conn, PROTECTED_IDS_KEY, &serde_json::to_string(ids)?)
}

/// The clock after the latest locally applied operation.
pub fn get_local_clock(conn: &Connection) -> Result<VectorClock> {
    match kv_get_string(conn, LOCAL_CLOCK_KEY)? {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(VectorClock::new()),
    }
}

pub fn set_local_clock(conn: &Connection, clock: &VectorClock) -> Result<()> {
    kv_set_string(conn, LOCAL_CLOCK_KEY, &serde_json::to_string(clock)?)
}

fn private_cfg_key(provider_id: &str) -> String {
    format!("sync.private_cfg:{provider_id}")
}

pub fn get_private_cfg(conn: &Connection, db_key: &Key, provider_id: &str) -> Result<PrivateCfg> {
    let Some(raw) = kv_get_string(conn, &private_cfg_key(provider_id))? else {
        return Ok(PrivateCfg::default());
    };
    let blob = B64_STD.decode(raw.as_bytes())?;
    let plaintext = decrypt_bytes(
        db_key,
        &blob,
        format!("sync.private_cfg:{provider_id}").as_bytes(),
    )?;
    Ok(serde_json::from_slice(&plaintext)?)
}

pub fn set_private_cfg(
    conn: &Connection,
    db_key: &Key,
    provider_id: &str,
    cfg: &PrivateCfg,
) -> Result<()> {
    let plaintext = serde_json::to_vec(cfg)?;
    let blob = encrypt_bytes(
        db_key,
        &plaintext,
        format!("sync.private_cfg:{provider_id}").as_bytes(),
    )?;
    let raw = B64_STD.encode(blob);
    kv_set_string(conn, &private_cfg_key(provider_id), &raw)
}

pub fn get_last_server_seq(conn: &Connection, db_key: &Key, provider_id: &str) -> Result<i64> {
    Ok(get_private_cfg(conn, db_key, provider_id)?.last_server_seq)
}

pub fn set_last_server_seq(
    conn: &Connection,
    db_key: &Key,
    provider_id: &str,
    seq: i64,
) -> Result<()> {
    let mut cfg = get_private_cfg(conn, db_key, provider_id)?;
    cfg.last_server_seq = seq;
    set_private_cfg(conn, db_key, provider_id, &cfg)
}

/// Records a user action as a new local operation: bumps this client's
/// counter, prunes the clock within the protected-ID exemptions, appends
/// the op tagged `local`, and persists the advanced clock.
pub fn record_local_op(
    conn: &Connection,
    db_key: &Key,
    client_id: &str,
    action_type: &str,
    entity_type: EntityType,
    payload: serde_json::Value,
) -> Result<Operation> {
    if client_id.is_empty() {
        return Err(anyhow!("cannot record operation without a client id"));
    }

    let mut protected = get_protected_client_ids(conn)?;
    protected.insert(client_id.to_string());

    let clock = get_local_clock(conn)?
        .increment(client_id)
        .limit_size(&protected, MAX_CLOCK_ENTRIES);

    let op = Operation::normal(
        action_type,
        entity_type,
        payload,
        client_id,
        clock.clone(),
        now_ms(),
    );
    append(conn, db_key, &op, Origin::Local)?;
    set_local_clock(conn, &clock)?;
    Ok(op)
}
