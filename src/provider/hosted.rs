//! Client for the hosted sync service: one totally ordered op log per
//! vault, server-assigned sequence numbers, bearer-token auth. Payloads
//! travel base64-encoded inside JSON; the server never sees plaintext
//! when encryption is enabled.

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64_URL;
use base64::Engine as _;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::error::{ConflictError, TransportError};
use crate::provider::{
    DownloadedOps, EnvelopeKind, OpEnvelope, RemoteOp, SyncProvider, UploadOutcome,
};

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    client_id: &'a str,
    ops: &'a [OpEnvelope],
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    accepted: bool,
    server_seq: i64,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    ops: Vec<RemoteOp>,
    latest_seq: i64,
}

#[derive(Debug, Serialize)]
struct SnapshotRequest<'a> {
    op_id: &'a str,
    client_id: &'a str,
    vector_clock: &'a VectorClock,
    is_encrypted: bool,
    body_b64: String,
}

pub struct HostedSyncProvider {
    http: Client,
    provider_id: String,
    base_url: String,
    vault_id: String,
    access_token: String,
}

impl HostedSyncProvider {
    pub fn new(base_url: String, vault_id: String, access_token: String) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(anyhow!("missing_base_url"));
        }
        if vault_id.trim().is_empty() {
            return Err(anyhow!("missing_vault_id"));
        }
        let scope = format!(
            "hosted|{}|{}",
            base_url.trim().trim_end_matches('/'),
            vault_id.trim()
        );
        Ok(Self {
            http: Client::builder().build()?,
            provider_id: format!("hosted:{}", B64_URL.encode(scope.as_bytes())),
            base_url,
            vault_id,
            access_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v1/vaults/{}{path}",
            self.base_url.trim_end_matches('/'),
            self.vault_id
        )
    }

    fn check_status(resp: &reqwest::blocking::Response, what: &str) -> Result<()> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        if status.as_u16() == 409 {
            return Err(ConflictError { server_seq: -1 }.into());
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(TransportError::fatal(format!("{what}: HTTP {status}")).into());
        }
        Err(TransportError::retryable(format!("{what}: HTTP {status}")).into())
    }
}

impl SyncProvider for HostedSyncProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn download_ops(&self, since_seq: i64, limit: Option<usize>) -> Result<DownloadedOps> {
        let mut url = format!("{}?since={since_seq}", self.url("/ops"));
        if let Some(limit) = limit {
            url.push_str(&format!("&limit={limit}"));
        }

        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .map_err(|e| TransportError::retryable(format!("pull: {e}")))?;
        Self::check_status(&resp, "pull")?;

        let parsed: PullResponse = resp
            .json()
            .map_err(|e| TransportError::retryable(format!("pull decode: {e}")))?;
        Ok(DownloadedOps {
            ops: parsed.ops,
            latest_seq: parsed.latest_seq,
        })
    }

    fn upload_ops(&self, envelopes: &[OpEnvelope]) -> Result<UploadOutcome> {
        let Some(first) = envelopes.first() else {
            return Ok(UploadOutcome::accepted(0));
        };

        let resp = self
            .http
            .post(self.url("/ops"))
            .bearer_auth(&self.access_token)
            .json(&PushRequest {
                client_id: &first.client_id,
                ops: envelopes,
            })
            .send()
            .map_err(|e| TransportError::retryable(format!("push: {e}")))?;
        Self::check_status(&resp, "push")?;

        let parsed: PushResponse = resp
            .json()
            .map_err(|e| TransportError::retryable(format!("push decode: {e}")))?;
        if !parsed.accepted {
            return Ok(UploadOutcome::rejected(
                parsed.server_seq,
                parsed.error.unwrap_or_else(|| "rejected".to_string()),
            ));
        }
        Ok(UploadOutcome::accepted(parsed.server_seq))
    }

    fn upload_snapshot(
        &self,
        payload: &[u8],
        op_id: &str,
        client_id: &str,
        vector_clock: &VectorClock,
        is_encrypted: bool,
    ) -> Result<UploadOutcome> {
        let envelope = OpEnvelope::new(op_id, client_id, EnvelopeKind::Snapshot, payload, is_encrypted);
        let resp = self
            .http
            .post(self.url("/snapshot"))
            .bearer_auth(&self.access_token)
            .json(&SnapshotRequest {
                op_id,
                client_id,
                vector_clock,
                is_encrypted,
                body_b64: envelope.body_b64,
            })
            .send()
            .map_err(|e| TransportError::retryable(format!("snapshot: {e}")))?;
        Self::check_status(&resp, "snapshot")?;

        let parsed: PushResponse = resp
            .json()
            .map_err(|e| TransportError::retryable(format!("snapshot decode: {e}")))?;
        if !parsed.accepted {
            return Ok(UploadOutcome::rejected(
                parsed.server_seq,
                parsed.error.unwrap_or_else(|| "rejected".to_string()),
            ));
        }
        Ok(UploadOutcome::accepted(parsed.server_seq))
    }

    fn delete_all_data(&self) -> Result<()> {
        let resp = self
            .http
            .delete(self.url("/data"))
            .bearer_auth(&self.access_token)
            .send()
            .map_err(|e| TransportError::retryable(format!("reset: {e}")))?;
        Self::check_status(&resp, "reset")
    }
}
