//! File-backed sync provider: maps the op transport onto a dumb file
//! store (`ops/op_{seq}.json` plus a `meta.json` cursor). Works against
//! any `RemoteStore`: a local directory, WebDAV, anything that can
//! list/get/put/delete files.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64_URL;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::provider::{
    DownloadedOps, EnvelopeKind, OpEnvelope, RemoteOp, SyncProvider, UploadOutcome,
};

/// Marker error for a missing remote file; callers branch on it via
/// downcast, everything else propagates as-is.
#[derive(Debug)]
pub struct NotFound {
    pub path: String,
}

impl std::fmt::Display for NotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "not found: {}", self.path)
    }
}

impl std::error::Error for NotFound {}

/// Minimal file-level remote contract.
pub trait RemoteStore: Send + Sync {
    fn target_id(&self) -> &str;
    fn mkdir_all(&self, path: &str) -> Result<()>;
    fn list(&self, dir: &str) -> Result<Vec<String>>;
    fn get(&self, path: &str) -> Result<Vec<u8>>;
    fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()>;
    fn delete(&self, path: &str) -> Result<()>;
}

pub(crate) fn normalize_dir(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    format!("/{trimmed}/")
}

pub(crate) fn normalize_file(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{trimmed}")
}

fn virtual_to_local(root: &Path, virtual_path: &str) -> PathBuf {
    let relative = virtual_path.trim_start_matches('/');
    root.join(relative)
}

/// Local-directory remote, used for USB-stick style sync targets and as
/// the reference `RemoteStore` in tests.
#[derive(Clone, Debug)]
pub struct LocalDirStore {
    root: PathBuf,
    target_id: String,
}

impl LocalDirStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        let canonical = root.canonicalize().unwrap_or_else(|_| root.clone());
        let target_id = format!("localdir:{}", canonical.to_string_lossy());
        Ok(Self { root, target_id })
    }
}

impl RemoteStore for LocalDirStore {
    fn target_id(&self) -> &str {
        &self.target_id
    }

    fn mkdir_all(&self, path: &str) -> Result<()> {
        let dir = normalize_dir(path);
        if dir == "/" {
            return Ok(());
        }
        fs::create_dir_all(virtual_to_local(&self.root, dir.trim_end_matches('/')))?;
        Ok(())
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let dir = normalize_dir(dir);
        let local = virtual_to_local(&self.root, dir.trim_end_matches('/'));
        if !local.exists() {
            return Ok(vec![]);
        }

        let mut out: BTreeSet<String> = BTreeSet::new();
        for entry in fs::read_dir(local)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let name_os = entry.file_name();
            let Some(name) = name_os.to_str() else {
                continue;
            };
            if file_type.is_dir() {
                out.insert(format!("{dir}{name}/"));
            } else {
                out.insert(format!("{dir}{name}"));
            }
        }
        Ok(out.into_iter().collect())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        let file = normalize_file(path);
        let local = virtual_to_local(&self.root, &file);
        match fs::read(&local) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NotFound { path: file }.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let file = normalize_file(path);
        let local = virtual_to_local(&self.root, &file);
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(local, bytes)?;
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        let local_file = virtual_to_local(&self.root, &normalize_file(path));
        if local_file.is_dir() {
            fs::remove_dir_all(&local_file)?;
            return Ok(());
        }
        match fs::remove_file(&local_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(NotFound {
                path: normalize_file(path),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RemoteMeta {
    latest_seq: i64,
}

/// Provider over any `RemoteStore`. Sequence numbers are assigned by
/// read-modify-write on `meta.json`; on stores without atomic writes
/// two concurrent writers can race, which is the documented best-effort
/// limit of file-based targets.
pub struct FileSyncProvider<R: RemoteStore> {
    store: R,
    root_dir: String,
    provider_id: String,
}

impl<R: RemoteStore> FileSyncProvider<R> {
    pub fn new(store: R, remote_root: &str) -> Self {
        let root_dir = normalize_dir(remote_root);
        let scope = format!("{}|{root_dir}", store.target_id());
        let provider_id = format!("file:{}", B64_URL.encode(scope.as_bytes()));
        Self {
            store,
            root_dir,
            provider_id,
        }
    }

    fn meta_path(&self) -> String {
        format!("{}meta.json", self.root_dir)
    }

    fn op_path(&self, seq: i64) -> String {
        format!("{}ops/op_{seq}.json", self.root_dir)
    }

    fn read_meta(&self) -> Result<RemoteMeta> {
        match self.store.get(&self.meta_path()) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.is::<NotFound>() => Ok(RemoteMeta::default()),
            Err(e) => Err(e),
        }
    }

    fn write_meta(&self, meta: &RemoteMeta) -> Result<()> {
        self.store
            .put(&self.meta_path(), serde_json::to_vec(meta)?)
    }

    fn append_envelopes(&self, envelopes: &[OpEnvelope]) -> Result<UploadOutcome> {
        let mut meta = self.read_meta()?;
        self.store.mkdir_all(&format!("{}ops/", self.root_dir))?;

        for envelope in envelopes {
            let seq = meta.latest_seq + 1;
            self.store
                .put(&self.op_path(seq), serde_json::to_vec(envelope)?)?;
            meta.latest_seq = seq;
        }
        self.write_meta(&meta)?;
        Ok(UploadOutcome::accepted(meta.latest_seq))
    }
}

impl<R: RemoteStore> SyncProvider for FileSyncProvider<R> {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn download_ops(&self, since_seq: i64, limit: Option<usize>) -> Result<DownloadedOps> {
        let meta = self.read_meta()?;
        let mut ops: Vec<RemoteOp> = Vec::new();

        let mut seq = since_seq + 1;
        while seq <= meta.latest_seq {
            if let Some(limit) = limit {
                if ops.len() >= limit {
                    break;
                }
            }
            let bytes = match self.store.get(&self.op_path(seq)) {
                Ok(bytes) => bytes,
                // Ops are contiguous; a hole means the remote was pruned
                // or is mid-write, so stop rather than skip.
                Err(e) if e.is::<NotFound>() => break,
                Err(e) => return Err(e),
            };
            let envelope: OpEnvelope = serde_json::from_slice(&bytes)?;
            ops.push(RemoteOp {
                server_seq: seq,
                envelope,
            });
            seq += 1;
        }

        Ok(DownloadedOps {
            ops,
            latest_seq: meta.latest_seq,
        })
    }

    fn upload_ops(&self, envelopes: &[OpEnvelope]) -> Result<UploadOutcome> {
        self.append_envelopes(envelopes)
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
        self.append_envelopes(std::slice::from_ref(&envelope))
    }

    fn delete_all_data(&self) -> Result<()> {
        if self.root_dir == "/" {
            return Err(anyhow!("refusing to clear remote root '/'"));
        }
        match self.store.delete(&self.root_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.is::<NotFound>() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
