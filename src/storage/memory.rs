use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::{
    CleanupOptions, CleanupResult, DeltaEntry, DocumentState, SessionEntry, SnapshotEntry,
    Storage, StorageError, StorageResult, TextDocumentState,
};

/// In-memory `Storage` implementation used when `DATABASE_URL` is unset;
/// backs the `storage: "memory-only"` health value (§6). Not durable
/// across restarts, matching the Python reference's behavior with no
/// persistence configured.
#[derive(Default)]
pub struct MemoryStorage {
    documents: RwLock<HashMap<String, DocumentState>>,
    clocks: RwLock<HashMap<String, Map<String, Value>>>,
    deltas: RwLock<HashMap<String, Vec<DeltaEntry>>>,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    snapshots: RwLock<HashMap<String, SnapshotEntry>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn connect(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        true
    }

    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn get_document(&self, id: &str) -> StorageResult<Option<DocumentState>> {
        Ok(self.documents.read().await.get(id).cloned())
    }

    async fn save_document(&self, id: &str, state: Map<String, Value>) -> StorageResult<DocumentState> {
        let mut documents = self.documents.write().await;
        let entry = documents
            .entry(id.to_string())
            .and_modify(|d| {
                d.state = state.clone();
                d.updated_at_ms = now_ms();
            })
            .or_insert_with(|| DocumentState {
                id: id.to_string(),
                state,
                version: 1,
                updated_at_ms: now_ms(),
            });
        Ok(entry.clone())
    }

    async fn update_document(&self, id: &str, state: Map<String, Value>) -> StorageResult<DocumentState> {
        let mut documents = self.documents.write().await;
        let document = documents
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound {
                resource: "document".to_string(),
                id: id.to_string(),
            })?;
        document.state = state;
        document.updated_at_ms = now_ms();
        Ok(document.clone())
    }

    async fn delete_document(&self, id: &str) -> StorageResult<()> {
        self.documents.write().await.remove(id);
        Ok(())
    }

    async fn list_documents(&self, limit: i64, offset: i64) -> StorageResult<Vec<DocumentState>> {
        let mut docs: Vec<DocumentState> = self.documents.read().await.values().cloned().collect();
        docs.sort_by(|a, b| b.updated_at_ms.cmp(&a.updated_at_ms));
        Ok(docs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn get_vector_clock(&self, document_id: &str) -> StorageResult<Map<String, Value>> {
        Ok(self
            .clocks
            .read()
            .await
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_vector_clock(
        &self,
        document_id: &str,
        client_id: &str,
        value: i64,
    ) -> StorageResult<()> {
        let mut clocks = self.clocks.write().await;
        clocks
            .entry(document_id.to_string())
            .or_default()
            .insert(client_id.to_string(), Value::from(value));
        Ok(())
    }

    async fn merge_vector_clock(
        &self,
        document_id: &str,
        incoming: Map<String, Value>,
    ) -> StorageResult<Map<String, Value>> {
        let mut clocks = self.clocks.write().await;
        let current = clocks.entry(document_id.to_string()).or_default();
        let merged = super::merge_clocks(current, &incoming);
        *current = merged.clone();
        Ok(merged)
    }

    async fn save_delta(&self, entry: DeltaEntry) -> StorageResult<()> {
        self.deltas
            .write()
            .await
            .entry(entry.document_id.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn get_deltas(&self, document_id: &str, limit: i64) -> StorageResult<Vec<DeltaEntry>> {
        let deltas = self.deltas.read().await;
        let mut entries = deltas.get(document_id).cloned().unwrap_or_default();
        entries.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn save_session(&self, entry: SessionEntry) -> StorageResult<()> {
        self.sessions.write().await.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn update_session(
        &self,
        id: &str,
        last_seen_ms: i64,
        metadata: Option<Value>,
    ) -> StorageResult<()> {
        if let Some(session) = self.sessions.write().await.get_mut(id) {
            session.last_seen_ms = last_seen_ms;
            if metadata.is_some() {
                session.metadata = metadata;
            }
        }
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> StorageResult<()> {
        self.sessions.write().await.remove(id);
        Ok(())
    }

    async fn get_sessions(&self, user_id: &str) -> StorageResult<Vec<SessionEntry>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn save_snapshot(&self, entry: SnapshotEntry) -> StorageResult<()> {
        self.snapshots.write().await.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn get_snapshot(&self, id: &str) -> StorageResult<Option<SnapshotEntry>> {
        Ok(self.snapshots.read().await.get(id).cloned())
    }

    async fn get_latest_snapshot(&self, document_id: &str) -> StorageResult<Option<SnapshotEntry>> {
        Ok(self
            .snapshots
            .read()
            .await
            .values()
            .filter(|s| s.document_id == document_id)
            .max_by_key(|s| s.created_at_ms)
            .cloned())
    }

    async fn list_snapshots(&self, document_id: &str, limit: i64) -> StorageResult<Vec<SnapshotEntry>> {
        let mut entries: Vec<SnapshotEntry> = self
            .snapshots
            .read()
            .await
            .values()
            .filter(|s| s.document_id == document_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn delete_snapshot(&self, id: &str) -> StorageResult<()> {
        self.snapshots.write().await.remove(id);
        Ok(())
    }

    async fn save_text_document(&self, doc: TextDocumentState) -> StorageResult<()> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;
        let mut envelope = Map::new();
        envelope.insert("type".to_string(), Value::from("text"));
        envelope.insert("content".to_string(), Value::from(BASE64.encode(&doc.content)));
        envelope.insert("crdt".to_string(), Value::from(BASE64.encode(&doc.crdt_state)));
        envelope.insert("clock".to_string(), Value::Object(doc.clock));
        self.save_document(&doc.id, envelope).await?;
        Ok(())
    }

    async fn get_text_document(&self, id: &str) -> StorageResult<Option<TextDocumentState>> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;
        let Some(document) = self.get_document(id).await? else {
            return Ok(None);
        };
        if document.state.get("type").and_then(Value::as_str) != Some("text") {
            return Ok(None);
        }
        let content = document
            .state
            .get("content")
            .and_then(Value::as_str)
            .and_then(|s| BASE64.decode(s).ok())
            .unwrap_or_default();
        let crdt_state = document
            .state
            .get("crdt")
            .and_then(Value::as_str)
            .and_then(|s| BASE64.decode(s).ok())
            .unwrap_or_default();
        let clock = document
            .state
            .get("clock")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Ok(Some(TextDocumentState {
            id: document.id,
            content,
            crdt_state,
            clock,
        }))
    }

    async fn cleanup(&self, options: CleanupOptions) -> StorageResult<CleanupResult> {
        let now = now_ms();
        let sessions_cutoff = now - options.old_sessions_hours * 3_600_000;
        let deltas_cutoff = now - options.old_deltas_days * 86_400_000;
        let snapshots_cutoff = now - options.old_snapshots_days * 86_400_000;

        let sessions_deleted = {
            let mut sessions = self.sessions.write().await;
            let before = sessions.len();
            sessions.retain(|_, s| s.last_seen_ms >= sessions_cutoff);
            (before - sessions.len()) as u64
        };

        let deltas_deleted = {
            let mut deltas = self.deltas.write().await;
            let mut removed = 0u64;
            for entries in deltas.values_mut() {
                let before = entries.len();
                entries.retain(|d| d.created_at_ms >= deltas_cutoff);
                removed += (before - entries.len()) as u64;
            }
            removed
        };

        let snapshots_deleted = {
            let mut snapshots = self.snapshots.write().await;
            let mut by_document: HashMap<String, Vec<(String, i64)>> = HashMap::new();
            for s in snapshots.values() {
                by_document
                    .entry(s.document_id.clone())
                    .or_default()
                    .push((s.id.clone(), s.created_at_ms));
            }
            let mut to_remove = Vec::new();
            for entries in by_document.values_mut() {
                entries.sort_by(|a, b| b.1.cmp(&a.1));
                for (rank, (id, created_at_ms)) in entries.iter().enumerate() {
                    if rank >= options.max_snapshots_per_document || *created_at_ms < snapshots_cutoff
                    {
                        to_remove.push(id.clone());
                    }
                }
            }
            for id in &to_remove {
                snapshots.remove(id);
            }
            to_remove.len() as u64
        };

        Ok(CleanupResult {
            sessions_deleted,
            deltas_deleted,
            snapshots_deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn save_then_get_document_round_trips() {
        let storage = MemoryStorage::new();
        let state: Map<String, Value> = json!({"title": "hello"}).as_object().unwrap().clone();
        storage.save_document("doc-1", state.clone()).await.unwrap();
        let fetched = storage.get_document("doc-1").await.unwrap().unwrap();
        assert_eq!(fetched.state, state);
        assert_eq!(fetched.version, 1);
    }

    #[tokio::test]
    async fn update_on_absent_document_is_not_found() {
        let storage = MemoryStorage::new();
        let err = storage
            .update_document("missing", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn merge_vector_clock_is_idempotent() {
        let storage = MemoryStorage::new();
        let incoming: Map<String, Value> = json!({"client-a": 3}).as_object().unwrap().clone();
        let once = storage
            .merge_vector_clock("doc-1", incoming.clone())
            .await
            .unwrap();
        let twice = storage.merge_vector_clock("doc-1", incoming).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn text_document_round_trips_through_the_envelope() {
        let storage = MemoryStorage::new();
        let doc = TextDocumentState {
            id: "text-1".to_string(),
            content: b"hello world".to_vec(),
            crdt_state: b"crdt-bytes".to_vec(),
            clock: json!({"a": 1}).as_object().unwrap().clone(),
        };
        storage.save_text_document(doc.clone()).await.unwrap();
        let fetched = storage.get_text_document("text-1").await.unwrap().unwrap();
        assert_eq!(fetched.content, doc.content);
        assert_eq!(fetched.crdt_state, doc.crdt_state);
    }

    #[tokio::test]
    async fn non_text_document_is_not_returned_as_text() {
        let storage = MemoryStorage::new();
        let state: Map<String, Value> = json!({"title": "hi"}).as_object().unwrap().clone();
        storage.save_document("doc-1", state).await.unwrap();
        assert!(storage.get_text_document("doc-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_prunes_snapshots_beyond_the_per_document_cap() {
        let storage = MemoryStorage::new();
        let base = now_ms();
        for i in 0..15 {
            storage
                .save_snapshot(SnapshotEntry {
                    id: format!("snap-{i}"),
                    document_id: "doc-1".to_string(),
                    state: Map::new(),
                    created_at_ms: base - i,
                })
                .await
                .unwrap();
        }
        let result = storage.cleanup(CleanupOptions::default()).await.unwrap();
        assert_eq!(result.snapshots_deleted, 5);
        let remaining = storage.list_snapshots("doc-1", 100).await.unwrap();
        assert_eq!(remaining.len(), 10);
    }
}
