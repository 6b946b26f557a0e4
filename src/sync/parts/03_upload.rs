impl<P: SyncProvider> SyncEngine<P> {
    /// Pushes pending local ops in strict insertion order: later ops'
    /// clocks presuppose earlier ones already advanced this client's
    /// counter, so reordering is never allowed. Imports travel through
    /// `upload_snapshot`, runs of normal ops as one batch.
    ///
    /// A sequence-mismatch rejection triggers one re-download-and-apply
    /// pass, then a single retry; a second rejection propagates.
    #[allow(clippy::too_many_arguments)]
    fn upload_pending(
        &self,
        conn: &Connection,
        db_key: &Key,
        store: &mut StateStore,
        client_id: &str,
        provider_id: &str,
        wire_key: Option<&Key>,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let mut recovered_from_conflict = false;
        loop {
            let pending = oplog::pending_local_ops(conn, db_key)?;
            if pending.is_empty() {
                return Ok(());
            }

            match self.push_in_order(conn, db_key, provider_id, wire_key, &pending, summary) {
                Ok(()) => return Ok(()),
                Err(e) if e.is::<ConflictError>() && !recovered_from_conflict => {
                    recovered_from_conflict = true;
                    debug!("upload conflict, re-downloading before retry");
                    let since = oplog::get_last_server_seq(conn, db_key, provider_id)?;
                    let downloaded =
                        with_retries("download_ops", || self.provider.download_ops(since, None))?;
                    summary.downloaded += downloaded.ops.len() as u64;
                    apply_remote_ops(
                        conn,
                        db_key,
                        store,
                        client_id,
                        provider_id,
                        wire_key,
                        &downloaded.ops,
                        summary,
                    )?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn push_in_order(
        &self,
        conn: &Connection,
        db_key: &Key,
        provider_id: &str,
        wire_key: Option<&Key>,
        pending: &[oplog::StoredOp],
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let mut batch: Vec<(String, OpEnvelope)> = Vec::new();

        for stored in pending {
            if stored.op.is_import() {
                self.flush_op_batch(conn, db_key, provider_id, &mut batch, summary)?;
                self.push_snapshot(conn, db_key, provider_id, wire_key, &stored.op, summary)?;
            } else {
                let envelope = seal_op(&stored.op, wire_key)?;
                batch.push((stored.op.op_id.clone(), envelope));
            }
        }
        self.flush_op_batch(conn, db_key, provider_id, &mut batch, summary)
    }

    fn flush_op_batch(
        &self,
        conn: &Connection,
        db_key: &Key,
        provider_id: &str,
        batch: &mut Vec<(String, OpEnvelope)>,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let (op_ids, envelopes): (Vec<String>, Vec<OpEnvelope>) = batch.drain(..).unzip();

        let cursor_before = oplog::get_last_server_seq(conn, db_key, provider_id)?;
        let outcome =
            with_retries("upload_ops", || self.provider.upload_ops(&envelopes))?;
        if !outcome.accepted {
            return Err(ConflictError {
                server_seq: outcome.server_seq,
            }
            .into());
        }

        db::with_immediate_transaction(conn, || {
            oplog::mark_synced(conn, &op_ids)?;
            // Only fast-forward the cursor when nothing else landed
            // between our last download and this upload; otherwise the
            // next download must still fetch the interleaved ops.
            if outcome.server_seq == cursor_before + envelopes.len() as i64 {
                oplog::set_last_server_seq(conn, db_key, provider_id, outcome.server_seq)?;
            }
            Ok(())
        })?;

        summary.uploaded += op_ids.len() as u64;
        Ok(())
    }

    fn push_snapshot(
        &self,
        conn: &Connection,
        db_key: &Key,
        provider_id: &str,
        wire_key: Option<&Key>,
        op: &Operation,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let envelope = seal_op(op, wire_key)?;
        let payload = envelope.body()?;

        let cursor_before = oplog::get_last_server_seq(conn, db_key, provider_id)?;
        let outcome = with_retries("upload_snapshot", || {
            self.provider.upload_snapshot(
                &payload,
                &op.op_id,
                &op.client_id,
                &op.vector_clock,
                envelope.is_encrypted,
            )
        })?;
        if !outcome.accepted {
            return Err(ConflictError {
                server_seq: outcome.server_seq,
            }
            .into());
        }

        let ids = [op.op_id.clone()];
        db::with_immediate_transaction(conn, || {
            oplog::mark_synced(conn, &ids)?;
            if outcome.server_seq == cursor_before + 1 {
                oplog::set_last_server_seq(conn, db_key, provider_id, outcome.server_seq)?;
            }
            Ok(())
        })?;

        summary.uploaded += 1;
        debug!(op_id = %op.op_id, "snapshot import uploaded");
        Ok(())
    }
}
