//! Server migration: a client that has synced before connects to an
//! empty remote (new server, wiped storage). Instead of replaying its
//! whole op history, it seeds the remote with one full-state import
//! whose vector clock dominates everything that came before it locally.

use std::collections::BTreeSet;

use anyhow::Result;
use rusqlite::Connection;
use tracing::{debug, warn};

use crate::crypto::Key;
use crate::db;
use crate::op::{Operation, Origin};
use crate::oplog;
use crate::provider::{remote_is_empty, SyncProvider};
use crate::state::{self, StateStore};
use crate::validate::{validate_and_repair, RepairOutcome};

/// Why migration did or did not produce an import.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MigrationDecision {
    /// This provider has synced before (`last_server_seq != 0`).
    AlreadySynced,
    /// The remote holds data; normal download/merge applies.
    RemoteHasData,
    /// Nothing here has ever synced; a fresh client uploads normally.
    FreshClient,
    /// Local state holds nothing user-created worth seeding.
    NothingToMigrate,
    /// A `SyncImport` was appended to the local log, pending upload.
    ImportCreated,
}

/// Detection per the migration state machine. Returns the created
/// import operation when migration ran, the skip reason otherwise.
pub fn check_and_handle_migration(
    conn: &Connection,
    db_key: &Key,
    store: &mut StateStore,
    provider: &dyn SyncProvider,
) -> Result<(MigrationDecision, Option<Operation>)> {
    if oplog::get_last_server_seq(conn, db_key, provider.provider_id())? != 0 {
        return Ok((MigrationDecision::AlreadySynced, None));
    }

    if !remote_is_empty(provider)? {
        return Ok((MigrationDecision::RemoteHasData, None));
    }

    if !oplog::has_synced_ops(conn)? {
        debug!("remote empty but no synced history; fresh client uploads normally");
        return Ok((MigrationDecision::FreshClient, None));
    }

    handle_server_migration(conn, db_key, store, provider, false)
}

/// Execution. `skip_reprobe` is set only by forced local-wins conflict
/// resolution, where the caller has already decided the local state
/// should overwrite the remote.
///
/// The emptiness re-probe guards the window between detection and
/// execution, but only best-effort: two clients racing the same empty
/// server can still both seed an import. A provider-side conditional
/// write on first upload would close this; the transport contract does
/// not offer one today.
pub fn handle_server_migration(
    conn: &Connection,
    db_key: &Key,
    store: &mut StateStore,
    provider: &dyn SyncProvider,
    skip_reprobe: bool,
) -> Result<(MigrationDecision, Option<Operation>)> {
    if !skip_reprobe && !remote_is_empty(provider)? {
        debug!("remote gained data between detection and execution; aborting migration");
        return Ok((MigrationDecision::RemoteHasData, None));
    }

    // Full snapshot, cold storage included: seeding a server from hot
    // state alone would silently drop the archive on every other device.
    let snapshot = state::full_state_snapshot(conn, db_key, store)?;
    if snapshot.is_effectively_empty() {
        debug!("local state effectively empty; nothing to migrate");
        return Ok((MigrationDecision::NothingToMigrate, None));
    }

    let snapshot = match validate_and_repair(&snapshot) {
        RepairOutcome::Valid => snapshot,
        RepairOutcome::Repaired {
            state: repaired,
            summary,
        } => {
            warn!(repairs = summary.len(), "state repaired before migration");
            // Keep the local client consistent with what gets uploaded.
            state::load_full_state(conn, db_key, store, repaired.clone())?;
            repaired
        }
        RepairOutcome::Invalid { error } => {
            // Corruption must never propagate to other devices.
            return Err(error.into());
        }
    };

    let client_id = db::get_or_create_client_id(conn)?;

    // Merge every stored operation's clock, not just the latest: local
    // history may contain synced ops from other clients whose counters
    // the current clock alone might have pruned. The import must
    // dominate all of them.
    let mut clock = oplog::get_local_clock(conn)?;
    for stored in oplog::all_ops(conn, db_key)? {
        clock = clock.merge(&stored.op.vector_clock);
    }
    let clock = clock.increment(&client_id);

    let op = Operation::sync_import(&snapshot, &client_id, clock.clone(), db::now_ms())?;

    db::with_immediate_transaction(conn, || {
        oplog::append(conn, db_key, &op, Origin::Local)?;
        oplog::set_local_clock(conn, &clock)?;

        // Every key the import's dominance depends on becomes exempt
        // from clock pruning; dropping one later would make
        // post-migration ops classify as concurrent with the import on
        // other devices and get filtered out there.
        let protected: BTreeSet<String> =
            clock.client_ids().map(str::to_string).collect();
        oplog::set_protected_client_ids(conn, &protected)?;
        Ok(())
    })?;

    debug!(op_id = %op.op_id, "migration import created");
    Ok((MigrationDecision::ImportCreated, Some(op)))
}
