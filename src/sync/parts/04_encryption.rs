impl<P: SyncProvider> SyncEngine<P> {
    /// Turns on payload encryption for this provider: wipes the remote,
    /// re-seeds it with one encrypted full-state import, and persists
    /// the new config. Returns the derived wire key for the caller to
    /// cache for subsequent cycles.
    ///
    /// Order matters. The AEAD self-test runs before the destructive
    /// wipe: a stack that cannot encrypt must never delete data it
    /// cannot replace. If the re-upload fails after the wipe, the local
    /// config is rolled back so it never claims encryption the remote
    /// does not hold; the pending import stays in the log and re-seeds
    /// the remote on the next successful cycle under the rolled-back
    /// config.
    pub fn enable_encryption(
        &self,
        conn: &Connection,
        db_key: &Key,
        store: &mut StateStore,
        passphrase: &str,
        kdf: &crypto::KdfParams,
    ) -> Result<Key> {
        let _guard = self
            .upload_lock
            .lock()
            .map_err(|_| anyhow!("sync engine lock poisoned"))?;

        crypto::self_test()?;
        let wire_key = crypto::derive_sync_key(passphrase, WIRE_KEY_SALT, kdf)?;

        // Fail closed before touching the remote: a snapshot that cannot
        // pass validation cannot re-seed the server we are about to wipe.
        let snapshot = state::full_state_snapshot(conn, db_key, store)?;
        if let RepairOutcome::Invalid { error } = validate_and_repair(&snapshot) {
            return Err(error.into());
        }

        let provider_id = self.provider.provider_id().to_string();
        let client_id = db::get_or_create_client_id(conn)?;
        let cfg_backup = oplog::get_private_cfg(conn, db_key, &provider_id)?;

        let new_cfg = oplog::PrivateCfg {
            last_server_seq: 0,
            is_encryption_enabled: true,
            encrypt_key_fingerprint: Some(crypto::key_fingerprint(&wire_key)),
        };
        oplog::set_private_cfg(conn, db_key, &provider_id, &new_cfg)?;

        let result = (|| -> Result<()> {
            self.provider.delete_all_data()?;

            // Re-seeding a wiped remote is structurally the migration
            // path; the emptiness probe is skipped because we just
            // emptied it ourselves.
            let (decision, _) =
                migrate::handle_server_migration(conn, db_key, store, &self.provider, true)?;
            debug!(?decision, "encryption re-seed migration decision");

            let mut summary = SyncSummary::default();
            self.upload_pending(
                conn,
                db_key,
                store,
                &client_id,
                &provider_id,
                Some(&wire_key),
                &mut summary,
            )?;
            Ok(())
        })();

        if let Err(e) = result {
            warn!("encryption enable failed after wipe, rolling back local config");
            oplog::set_private_cfg(conn, db_key, &provider_id, &cfg_backup)?;
            return Err(e);
        }

        Ok(wire_key)
    }
}
