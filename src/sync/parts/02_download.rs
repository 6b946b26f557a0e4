impl<P: SyncProvider> SyncEngine<P> {
    /// Runs one full cycle: migration check, download, classify/apply,
    /// upload. Any error surfaces immediately and leaves the engine
    /// idle; per-operation effects are transactional, so a failed cycle
    /// never leaves a half-applied operation behind.
    pub fn sync_once(
        &self,
        conn: &Connection,
        db_key: &Key,
        store: &mut StateStore,
        wire_key: Option<&Key>,
    ) -> Result<SyncSummary> {
        let _guard = self
            .upload_lock
            .lock()
            .map_err(|_| anyhow!("sync engine lock poisoned"))?;
        let generation = self.generation_now();
        let mut summary = SyncSummary::default();

        let client_id = db::get_or_create_client_id(conn)?;
        let provider_id = self.provider.provider_id().to_string();

        let cfg = oplog::get_private_cfg(conn, db_key, &provider_id)?;
        if cfg.is_encryption_enabled && wire_key.is_none() {
            return Err(ConfigError::new(
                "encryption is enabled for this provider but no sync passphrase is configured",
            )
            .into());
        }

        let mut phase = SyncPhase::CheckingMigration;
        debug!(?phase, %provider_id, "sync cycle started");
        // Transport failures here can only come from the emptiness
        // probes, which mutate nothing, so the whole check retries.
        let (decision, _import) = with_retries("check_migration", || {
            migrate::check_and_handle_migration(conn, db_key, store, &self.provider)
        })?;
        summary.import_created = decision == MigrationDecision::ImportCreated;

        phase = SyncPhase::Downloading;
        let since = oplog::get_last_server_seq(conn, db_key, &provider_id)?;
        let downloaded =
            with_retries("download_ops", || self.provider.download_ops(since, None))?;
        summary.downloaded = downloaded.ops.len() as u64;

        if self.generation_now() != generation {
            warn!(?phase, "provider changed mid-cycle, discarding results");
            summary.aborted = true;
            return Ok(summary);
        }

        phase = SyncPhase::Applying;
        apply_remote_ops(
            conn,
            db_key,
            store,
            &client_id,
            &provider_id,
            wire_key,
            &downloaded.ops,
            &mut summary,
        )?;

        if self.generation_now() != generation {
            warn!(?phase, "provider changed mid-cycle, skipping upload");
            summary.aborted = true;
            return Ok(summary);
        }

        phase = SyncPhase::Uploading;
        self.upload_pending(conn, db_key, store, &client_id, &provider_id, wire_key, &mut summary)?;

        phase = SyncPhase::Idle;
        debug!(
            ?phase,
            downloaded = summary.downloaded,
            applied = summary.applied,
            uploaded = summary.uploaded,
            "sync cycle finished"
        );
        Ok(summary)
    }
}

/// Applies downloaded envelopes in server order. Each operation's
/// effects (log append, clock merge, cursor advance) commit atomically;
/// the in-memory state mutation follows the commit.
#[allow(clippy::too_many_arguments)]
fn apply_remote_ops(
    conn: &Connection,
    db_key: &Key,
    store: &mut StateStore,
    client_id: &str,
    provider_id: &str,
    wire_key: Option<&Key>,
    ops: &[RemoteOp],
    summary: &mut SyncSummary,
) -> Result<()> {
    for remote in ops {
        let cursor = remote.server_seq;

        // Our own ops echoed back: already in the log, just advance.
        if remote.envelope.client_id == client_id {
            oplog::set_last_server_seq(conn, db_key, provider_id, cursor)?;
            continue;
        }

        let op = open_envelope(&remote.envelope, wire_key)?;

        // At-least-once delivery: replays advance the cursor only.
        if oplog::contains_op(conn, &op.op_id)? {
            oplog::set_last_server_seq(conn, db_key, provider_id, cursor)?;
            continue;
        }

        let local_clock = oplog::get_local_clock(conn)?;
        let ordering = op.vector_clock.compare(&local_clock);

        if op.is_import() {
            apply_remote_import(conn, db_key, store, &op, &local_clock, ordering, provider_id, cursor, summary)?;
            continue;
        }

        match ordering {
            ClockOrdering::LessThan | ClockOrdering::Equal => {
                // Already contained in local state (e.g. via an import
                // that superseded it); record without applying.
                db::with_immediate_transaction(conn, || {
                    oplog::append(conn, db_key, &op, Origin::Synced)?;
                    oplog::set_last_server_seq(conn, db_key, provider_id, cursor)?;
                    Ok(())
                })?;
            }
            ClockOrdering::GreaterThan | ClockOrdering::Concurrent => {
                if ordering == ClockOrdering::Concurrent {
                    // Concurrent edits are preserved, never dropped:
                    // both sides' operations apply and the merged clock
                    // records that this client has seen both histories.
                    summary.conflicts += 1;
                    warn!(op_id = %op.op_id, "concurrent remote operation, applying without overwrite");
                }
                let merged = local_clock.merge(&op.vector_clock);
                db::with_immediate_transaction(conn, || {
                    oplog::append(conn, db_key, &op, Origin::Synced)?;
                    oplog::set_local_clock(conn, &merged)?;
                    oplog::set_last_server_seq(conn, db_key, provider_id, cursor)?;
                    Ok(())
                })?;
                state::apply_operation(conn, db_key, store, &op)?;
                summary.applied += 1;
            }
        }
    }
    Ok(())
}

/// A remote full-state import replaces local state wholesale unless the
/// local clock already dominates it. Pending local ops the import
/// contains are retired; concurrent ones stay pending and are re-applied
/// on top of the imported state so nothing the user did here is lost.
#[allow(clippy::too_many_arguments)]
fn apply_remote_import(
    conn: &Connection,
    db_key: &Key,
    store: &mut StateStore,
    op: &Operation,
    local_clock: &VectorClock,
    ordering: ClockOrdering,
    provider_id: &str,
    cursor: i64,
    summary: &mut SyncSummary,
) -> Result<()> {
    if matches!(ordering, ClockOrdering::LessThan | ClockOrdering::Equal) {
        // Stale import: local history already dominates it.
        db::with_immediate_transaction(conn, || {
            oplog::append(conn, db_key, op, Origin::Synced)?;
            oplog::set_last_server_seq(conn, db_key, provider_id, cursor)?;
            Ok(())
        })?;
        return Ok(());
    }

    if ordering == ClockOrdering::Concurrent {
        summary.conflicts += 1;
        warn!(op_id = %op.op_id, "remote import concurrent with local history");
    }

    let snapshot = op.import_snapshot()?;
    state::load_full_state(conn, db_key, store, snapshot)?;

    let merged = local_clock.merge(&op.vector_clock);
    db::with_immediate_transaction(conn, || {
        oplog::append(conn, db_key, op, Origin::Synced)?;
        oplog::set_local_clock(conn, &merged)?;
        oplog::set_last_server_seq(conn, db_key, provider_id, cursor)?;

        // The import's clock keys now govern pruning exemptions here
        // too, until a newer import supersedes them.
        let protected: std::collections::BTreeSet<String> =
            op.vector_clock.client_ids().map(str::to_string).collect();
        oplog::set_protected_client_ids(conn, &protected)?;
        Ok(())
    })?;

    let retired = oplog::retire_dominated_pending(conn, db_key, &op.vector_clock)?;
    if retired > 0 {
        debug!(retired, "pending ops contained in remote import retired");
    }

    // Concurrent local work survives: replay what is still pending onto
    // the imported state.
    for stored in oplog::pending_local_ops(conn, db_key)? {
        if !stored.op.is_import() {
            state::apply_operation(conn, db_key, store, &stored.op)?;
        }
    }

    summary.applied += 1;
    Ok(())
}
