use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::crypto::{decrypt_bytes, encrypt_bytes, Key};
use crate::error::ConfigError;
use crate::model::Task;

fn db_path(app_dir: &Path) -> PathBuf {
    app_dir.join("taskloop.sqlite3")
}

pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

fn migrate(conn: &Connection) -> Result<()> {
    let user_version: i64 =
        conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if user_version < 1 {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS oplog (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  op_id TEXT NOT NULL UNIQUE,
  client_id TEXT NOT NULL,
  origin TEXT NOT NULL CHECK (origin IN ('local', 'synced')),
  op_json BLOB NOT NULL,
  created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_oplog_origin ON oplog(origin);
CREATE INDEX IF NOT EXISTS idx_oplog_client ON oplog(client_id);

CREATE TABLE IF NOT EXISTS archive_tasks (
  task_id TEXT PRIMARY KEY,
  task_json BLOB NOT NULL,
  archived_at INTEGER NOT NULL
);

PRAGMA user_version = 1;
"#,
        )?;
    }

    Ok(())
}

pub fn open(app_dir: &Path) -> Result<Connection> {
    fs::create_dir_all(app_dir)?;
    let conn = Connection::open(db_path(app_dir))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    migrate(&conn)?;
    Ok(conn)
}

pub fn with_immediate_transaction<T>(
    conn: &Connection,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE;")?;
    match f() {
        Ok(v) => {
            conn.execute_batch("COMMIT;")?;
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK;");
            Err(e)
        }
    }
}

pub fn kv_get_string(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        r#"SELECT value FROM kv WHERE key = ?1"#,
        params![key],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

pub fn kv_set_string(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        r#"INSERT INTO kv(key, value) VALUES (?1, ?2)
           ON CONFLICT(key) DO UPDATE SET value = excluded.value"#,
        params![key, value],
    )?;
    Ok(())
}

pub fn kv_get_i64(conn: &Connection, key: &str) -> Result<Option<i64>> {
    Ok(kv_get_string(conn, key)?.and_then(|v| v.parse::<i64>().ok()))
}

pub fn kv_set_i64(conn: &Connection, key: &str, value: i64) -> Result<()> {
    kv_set_string(conn, key, &value.to_string())
}

pub fn kv_delete(conn: &Connection, key: &str) -> Result<()> {
    conn.execute(r#"DELETE FROM kv WHERE key = ?1"#, params![key])?;
    Ok(())
}

/// Stable per-installation identifier, created once and reused for every
/// operation this device originates. Callers load it once and pass it
/// explicitly; there is no ambient lookup.
pub fn get_or_create_client_id(conn: &Connection) -> Result<String> {
    if let Some(client_id) = kv_get_string(conn, "client_id")? {
        if client_id.is_empty() {
            return Err(ConfigError::new("stored client_id is empty").into());
        }
        return Ok(client_id);
    }

    let client_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        r#"INSERT INTO kv(key, value) VALUES ('client_id', ?1)"#,
        params![client_id],
    )?;
    Ok(client_id)
}

/// Cold storage: done tasks moved out of the hot state. Stored encrypted
/// at rest; loaded only when a full snapshot (export, migration) needs
/// the complete history.
pub fn archive_task(conn: &Connection, db_key: &Key, task: &Task) -> Result<()> {
    if task.id.is_empty() {
        return Err(anyhow!("cannot archive task without an id"));
    }
    let plaintext = serde_json::to_vec(task)?;
    let blob = encrypt_bytes(
        db_key,
        &plaintext,
        format!("archive.task:{}", task.id).as_bytes(),
    )?;
    conn.execute(
        r#"INSERT INTO archive_tasks(task_id, task_json, archived_at)
           VALUES (?1, ?2, ?3)
           ON CONFLICT(task_id) DO UPDATE SET
             task_json = excluded.task_json,
             archived_at = excluded.archived_at"#,
        params![task.id, blob, now_ms()],
    )?;
    Ok(())
}

pub fn load_archived_tasks(conn: &Connection, db_key: &Key) -> Result<BTreeMap<String, Task>> {
    let mut stmt =
        conn.prepare(r#"SELECT task_id, task_json FROM archive_tasks ORDER BY task_id ASC"#)?;
    let mut rows = stmt.query([])?;

    let mut out = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let task_id: String = row.get(0)?;
        let blob: Vec<u8> = row.get(1)?;
        let plaintext = decrypt_bytes(
            db_key,
            &blob,
            format!("archive.task:{task_id}").as_bytes(),
        )?;
        let task: Task = serde_json::from_slice(&plaintext)?;
        out.insert(task_id, task);
    }
    Ok(out)
}

/// Replaces the whole archive, used when a full-state load (remote
/// import or post-repair reload) carries its own archive collection.
pub fn replace_archive(
    conn: &Connection,
    db_key: &Key,
    tasks: &BTreeMap<String, Task>,
) -> Result<()> {
    with_immediate_transaction(conn, || {
        conn.execute(r#"DELETE FROM archive_tasks"#, [])?;
        for task in tasks.values() {
            archive_task(conn, db_key, task)?;
        }
        Ok(())
    })
}
