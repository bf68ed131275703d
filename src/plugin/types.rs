//! Plugin record/handle data model shared by the manager, invoker, and hook.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Persistent-facing metadata for a known decoder plugin, independent of
/// whether it is currently loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRecord {
    pub name: String,
    pub path: String,
    pub status: PluginStatus,
    pub last_error: Option<String>,
    pub loaded_at: Option<u64>,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    Registered,
    Running,
    Stopped,
    Error,
}

/// Result of a `Decode` call: `is_client` mirrors the direction the plugin
/// was asked to decode, `time` is epoch millis, `data` is plugin-produced JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodeResult {
    pub is_client: bool,
    pub time: i64,
    pub data: Value,
}

/// Seed record fed in at boot by an external storage collaborator. The core
/// never reads or writes storage itself, it only consumes this trait.
#[derive(Debug, Clone)]
pub struct PluginRecordSeed {
    pub name: String,
    pub path: String,
}

/// One method an external store implements to feed boot-time plugin records
/// without this crate depending on any particular database.
pub trait PluginRecordSource: Send + Sync {
    fn load_records(&self) -> Vec<PluginRecordSeed>;
}
