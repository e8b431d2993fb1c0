pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Closed error taxonomy a backend surfaces, mirroring
/// `storage/errors.py` (§4.5 last paragraph).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage connection error: {0}")]
    Connection(String),
    #[error("storage query error: {0}")]
    Query(String),
    #[error("{resource} {id} not found")]
    NotFound { resource: String, id: String },
    #[error("storage conflict: {0}")]
    Conflict(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentState {
    pub id: String,
    pub state: Map<String, Value>,
    pub version: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct DeltaEntry {
    pub document_id: String,
    pub changes: Map<String, Value>,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: String,
    pub user_id: String,
    pub last_seen_ms: i64,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub id: String,
    pub document_id: String,
    pub state: Map<String, Value>,
    pub created_at_ms: i64,
}

/// Text-document envelope: `{type: "text", content, crdt, clock}` stored
/// inside the generic document table (Open Question 1, DESIGN.md).
#[derive(Debug, Clone)]
pub struct TextDocumentState {
    pub id: String,
    pub content: Vec<u8>,
    pub crdt_state: Vec<u8>,
    pub clock: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub old_sessions_hours: i64,
    pub old_deltas_days: i64,
    pub old_snapshots_days: i64,
    pub max_snapshots_per_document: usize,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            old_sessions_hours: 24,
            old_deltas_days: 30,
            old_snapshots_days: 7,
            max_snapshots_per_document: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CleanupResult {
    pub sessions_deleted: u64,
    pub deltas_deleted: u64,
    pub snapshots_deleted: u64,
}

/// The hub depends on this interface, never on a concrete backend
/// (§4.5). `synckit-server` ships two implementations: `postgres::PgStorage`
/// and `memory::MemoryStorage`.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn connect(&self) -> StorageResult<()>;
    async fn disconnect(&self) -> StorageResult<()>;
    async fn is_connected(&self) -> bool;
    async fn health_check(&self) -> StorageResult<()>;

    async fn get_document(&self, id: &str) -> StorageResult<Option<DocumentState>>;
    async fn save_document(&self, id: &str, state: Map<String, Value>) -> StorageResult<DocumentState>;
    async fn update_document(&self, id: &str, state: Map<String, Value>) -> StorageResult<DocumentState>;
    async fn delete_document(&self, id: &str) -> StorageResult<()>;
    async fn list_documents(&self, limit: i64, offset: i64) -> StorageResult<Vec<DocumentState>>;

    async fn get_vector_clock(&self, document_id: &str) -> StorageResult<Map<String, Value>>;
    async fn update_vector_clock(
        &self,
        document_id: &str,
        client_id: &str,
        value: i64,
    ) -> StorageResult<()>;
    async fn merge_vector_clock(
        &self,
        document_id: &str,
        incoming: Map<String, Value>,
    ) -> StorageResult<Map<String, Value>>;

    async fn save_delta(&self, entry: DeltaEntry) -> StorageResult<()>;
    async fn get_deltas(&self, document_id: &str, limit: i64) -> StorageResult<Vec<DeltaEntry>>;

    async fn save_session(&self, entry: SessionEntry) -> StorageResult<()>;
    async fn update_session(
        &self,
        id: &str,
        last_seen_ms: i64,
        metadata: Option<Value>,
    ) -> StorageResult<()>;
    async fn delete_session(&self, id: &str) -> StorageResult<()>;
    async fn get_sessions(&self, user_id: &str) -> StorageResult<Vec<SessionEntry>>;

    async fn save_snapshot(&self, entry: SnapshotEntry) -> StorageResult<()>;
    async fn get_snapshot(&self, id: &str) -> StorageResult<Option<SnapshotEntry>>;
    async fn get_latest_snapshot(&self, document_id: &str) -> StorageResult<Option<SnapshotEntry>>;
    async fn list_snapshots(&self, document_id: &str, limit: i64) -> StorageResult<Vec<SnapshotEntry>>;
    async fn delete_snapshot(&self, id: &str) -> StorageResult<()>;

    async fn save_text_document(&self, doc: TextDocumentState) -> StorageResult<()>;
    async fn get_text_document(&self, id: &str) -> StorageResult<Option<TextDocumentState>>;

    async fn cleanup(&self, options: CleanupOptions) -> StorageResult<CleanupResult>;
}

/// Pointwise-maximum merge used by every backend's `merge_vector_clock`
/// (§3 invariant, §8 idempotence property).
#[must_use]
pub fn merge_clocks(base: &Map<String, Value>, incoming: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (client_id, value) in incoming {
        let incoming_n = value.as_i64().unwrap_or(0);
        let merged_n = merged.get(client_id).and_then(Value::as_i64).unwrap_or(0);
        merged.insert(client_id.clone(), Value::from(incoming_n.max(merged_n)));
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_is_pointwise_maximum() {
        let base: Map<String, Value> = json!({"a": 1, "b": 5}).as_object().unwrap().clone();
        let incoming: Map<String, Value> = json!({"a": 3, "b": 2, "c": 9}).as_object().unwrap().clone();
        let merged = merge_clocks(&base, &incoming);
        assert_eq!(merged.get("a").unwrap(), &json!(3));
        assert_eq!(merged.get("b").unwrap(), &json!(5));
        assert_eq!(merged.get("c").unwrap(), &json!(9));
    }

    #[test]
    fn merging_the_same_map_twice_is_idempotent() {
        let base: Map<String, Value> = json!({"a": 1}).as_object().unwrap().clone();
        let incoming: Map<String, Value> = json!({"a": 4, "b": 2}).as_object().unwrap().clone();
        let once = merge_clocks(&base, &incoming);
        let twice = merge_clocks(&once, &incoming);
        assert_eq!(once, twice);
    }
}
