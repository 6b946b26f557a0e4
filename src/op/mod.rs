use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::model::{AppStateSnapshot, SCHEMA_VERSION};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Normal,
    /// Full-state snapshot superseding all prior history.
    SyncImport,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
    Project,
    Tag,
    Config,
    All,
}

/// Where an operation in the local log came from. `Local` ops are
/// pending upload; `Synced` ops have been exchanged with a remote.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Origin {
    Local,
    Synced,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Synced => "synced",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "local" => Ok(Origin::Local),
            "synced" => Ok(Origin::Synced),
            other => Err(anyhow!("unknown op origin: {other}")),
        }
    }
}

/// The atomic, immutable unit of change. The vector clock is the
/// originating client's clock *after* the operation was applied there;
/// `ts_ms` is advisory only, causal order comes from the clock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op_id: String,
    pub action_type: String,
    pub op_type: OpType,
    pub entity_type: EntityType,
    pub payload: serde_json::Value,
    pub client_id: String,
    pub vector_clock: VectorClock,
    pub ts_ms: i64,
    pub schema_version: u32,
}

impl Operation {
    pub fn normal(
        action_type: &str,
        entity_type: EntityType,
        payload: serde_json::Value,
        client_id: &str,
        vector_clock: VectorClock,
        ts_ms: i64,
    ) -> Self {
        Self {
            op_id: uuid::Uuid::now_v7().to_string(),
            action_type: action_type.to_string(),
            op_type: OpType::Normal,
            entity_type,
            payload,
            client_id: client_id.to_string(),
            vector_clock,
            ts_ms,
            schema_version: SCHEMA_VERSION,
        }
    }

    /// Wraps a full snapshot. The caller supplies a clock already merged
    /// over all prior local history and incremented, so this operation
    /// dominates everything that came before it.
    pub fn sync_import(
        snapshot: &AppStateSnapshot,
        client_id: &str,
        vector_clock: VectorClock,
        ts_ms: i64,
    ) -> Result<Self> {
        Ok(Self {
            op_id: uuid::Uuid::now_v7().to_string(),
            action_type: "state.import.v1".to_string(),
            op_type: OpType::SyncImport,
            entity_type: EntityType::All,
            payload: serde_json::to_value(snapshot)?,
            client_id: client_id.to_string(),
            vector_clock,
            ts_ms,
            schema_version: SCHEMA_VERSION,
        })
    }

    pub fn is_import(&self) -> bool {
        self.op_type == OpType::SyncImport
    }

    pub fn import_snapshot(&self) -> Result<AppStateSnapshot> {
        if !self.is_import() {
            return Err(anyhow!("operation {} is not a state import", self.op_id));
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn to_wire_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
