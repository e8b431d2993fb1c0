use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use std::time::Duration;

use super::{
    CleanupOptions, CleanupResult, DeltaEntry, DocumentState, SessionEntry, SnapshotEntry,
    Storage, StorageError, StorageResult, TextDocumentState,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Matches §5's documented storage command timeout default; sqlx applies
/// this per-statement via `sqlx::query(..).execute(&pool)`'s own pool
/// checkout rather than a single knob, so it is informational here.
#[allow(dead_code)]
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Postgres-backed storage, grounded on the teacher's `db.rs`/`repo/events.rs`
/// for pool construction and upsert shape. Uses runtime-checked
/// `sqlx::query`/`query_as` rather than the teacher's compile-time `query!`
/// macros — see DESIGN.md for why.
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub async fn connect(url: &str, min: u32, max: u32) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(min)
            .max_connections(max)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect(url)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }
}

#[derive(FromRow)]
struct DocumentRow {
    id: String,
    state: Value,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl From<DocumentRow> for DocumentState {
    fn from(row: DocumentRow) -> Self {
        DocumentState {
            id: row.id,
            state: row.state.as_object().cloned().unwrap_or_default(),
            version: row.version,
            updated_at_ms: row.updated_at.timestamp_millis(),
        }
    }
}

#[derive(FromRow)]
struct DeltaRow {
    document_id: String,
    changes: Value,
    created_at: DateTime<Utc>,
}

impl From<DeltaRow> for DeltaEntry {
    fn from(row: DeltaRow) -> Self {
        DeltaEntry {
            document_id: row.document_id,
            changes: row.changes.as_object().cloned().unwrap_or_default(),
            created_at_ms: row.created_at.timestamp_millis(),
        }
    }
}

#[derive(FromRow)]
struct SessionRow {
    id: String,
    user_id: String,
    last_seen: DateTime<Utc>,
    metadata: Option<Value>,
}

impl From<SessionRow> for SessionEntry {
    fn from(row: SessionRow) -> Self {
        SessionEntry {
            id: row.id,
            user_id: row.user_id,
            last_seen_ms: row.last_seen.timestamp_millis(),
            metadata: row.metadata,
        }
    }
}

#[derive(FromRow)]
struct SnapshotRow {
    id: String,
    document_id: String,
    state: Value,
    created_at: DateTime<Utc>,
}

impl From<SnapshotRow> for SnapshotEntry {
    fn from(row: SnapshotRow) -> Self {
        SnapshotEntry {
            id: row.id,
            document_id: row.document_id,
            state: row.state.as_object().cloned().unwrap_or_default(),
            created_at_ms: row.created_at.timestamp_millis(),
        }
    }
}

fn query_err(e: sqlx::Error) -> StorageError {
    StorageError::Query(e.to_string())
}

#[async_trait]
impl Storage for PgStorage {
    async fn connect(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> StorageResult<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn health_check(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> StorageResult<Option<DocumentState>> {
        let row: Option<DocumentRow> =
            sqlx::query_as("SELECT id, state, version, updated_at FROM documents WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(query_err)?;
        Ok(row.map(Into::into))
    }

    async fn save_document(&self, id: &str, state: Map<String, Value>) -> StorageResult<DocumentState> {
        let row: DocumentRow = sqlx::query_as(
            "INSERT INTO documents (id, state, version, updated_at)
             VALUES ($1, $2, 1, now())
             ON CONFLICT (id) DO UPDATE
               SET state = EXCLUDED.state, updated_at = now()
             RETURNING id, state, version, updated_at",
        )
        .bind(id)
        .bind(Value::Object(state))
        .fetch_one(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(row.into())
    }

    async fn update_document(&self, id: &str, state: Map<String, Value>) -> StorageResult<DocumentState> {
        let row: Option<DocumentRow> = sqlx::query_as(
            "UPDATE documents SET state = $2, updated_at = now()
             WHERE id = $1
             RETURNING id, state, version, updated_at",
        )
        .bind(id)
        .bind(Value::Object(state))
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        row.map(Into::into).ok_or_else(|| StorageError::NotFound {
            resource: "document".to_string(),
            id: id.to_string(),
        })
    }

    async fn delete_document(&self, id: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn list_documents(&self, limit: i64, offset: i64) -> StorageResult<Vec<DocumentState>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            "SELECT id, state, version, updated_at FROM documents
             ORDER BY updated_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_vector_clock(&self, document_id: &str) -> StorageResult<Map<String, Value>> {
        let row: Option<(Value,)> =
            sqlx::query_as("SELECT clock FROM vector_clocks WHERE document_id = $1")
                .bind(document_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(query_err)?;
        Ok(row
            .and_then(|(v,)| v.as_object().cloned())
            .unwrap_or_default())
    }

    async fn update_vector_clock(
        &self,
        document_id: &str,
        client_id: &str,
        value: i64,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO vector_clocks (document_id, clock)
             VALUES ($1, jsonb_build_object($2::text, $3::bigint))
             ON CONFLICT (document_id) DO UPDATE
               SET clock = vector_clocks.clock || jsonb_build_object($2::text, $3::bigint)",
        )
        .bind(document_id)
        .bind(client_id)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    /// Runs the whole read-merge-write under one row lock so two
    /// concurrent mergers of the same document's clock can't compute
    /// divergent merges and clobber each other (§4.5: merge is atomic).
    async fn merge_vector_clock(
        &self,
        document_id: &str,
        incoming: Map<String, Value>,
    ) -> StorageResult<Map<String, Value>> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        sqlx::query(
            "INSERT INTO vector_clocks (document_id, clock) VALUES ($1, '{}'::jsonb)
             ON CONFLICT (document_id) DO NOTHING",
        )
        .bind(document_id)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        let (current,): (Value,) =
            sqlx::query_as("SELECT clock FROM vector_clocks WHERE document_id = $1 FOR UPDATE")
                .bind(document_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(query_err)?;
        let current = current.as_object().cloned().unwrap_or_default();
        let merged = super::merge_clocks(&current, &incoming);

        sqlx::query("UPDATE vector_clocks SET clock = $2 WHERE document_id = $1")
            .bind(document_id)
            .bind(Value::Object(merged.clone()))
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(merged)
    }

    async fn save_delta(&self, entry: DeltaEntry) -> StorageResult<()> {
        sqlx::query("INSERT INTO deltas (document_id, changes) VALUES ($1, $2)")
            .bind(&entry.document_id)
            .bind(Value::Object(entry.changes))
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_deltas(&self, document_id: &str, limit: i64) -> StorageResult<Vec<DeltaEntry>> {
        let rows: Vec<DeltaRow> = sqlx::query_as(
            "SELECT document_id, changes, created_at FROM deltas
             WHERE document_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(document_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn save_session(&self, entry: SessionEntry) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, last_seen, metadata)
             VALUES ($1, $2, to_timestamp($3::double precision / 1000.0), $4)
             ON CONFLICT (id) DO UPDATE
               SET last_seen = EXCLUDED.last_seen, metadata = EXCLUDED.metadata",
        )
        .bind(&entry.id)
        .bind(&entry.user_id)
        .bind(entry.last_seen_ms as f64)
        .bind(entry.metadata)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn update_session(
        &self,
        id: &str,
        last_seen_ms: i64,
        metadata: Option<Value>,
    ) -> StorageResult<()> {
        sqlx::query(
            "UPDATE sessions SET last_seen = to_timestamp($2::double precision / 1000.0),
               metadata = COALESCE($3, metadata)
             WHERE id = $1",
        )
        .bind(id)
        .bind(last_seen_ms as f64)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_sessions(&self, user_id: &str) -> StorageResult<Vec<SessionEntry>> {
        let rows: Vec<SessionRow> = sqlx::query_as(
            "SELECT id, user_id, last_seen, metadata FROM sessions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn save_snapshot(&self, entry: SnapshotEntry) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO snapshots (id, document_id, state, created_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (id) DO UPDATE SET state = EXCLUDED.state",
        )
        .bind(&entry.id)
        .bind(&entry.document_id)
        .bind(Value::Object(entry.state))
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_snapshot(&self, id: &str) -> StorageResult<Option<SnapshotEntry>> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT id, document_id, state, created_at FROM snapshots WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(row.map(Into::into))
    }

    async fn get_latest_snapshot(&self, document_id: &str) -> StorageResult<Option<SnapshotEntry>> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT id, document_id, state, created_at FROM snapshots
             WHERE document_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(row.map(Into::into))
    }

    async fn list_snapshots(&self, document_id: &str, limit: i64) -> StorageResult<Vec<SnapshotEntry>> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(
            "SELECT id, document_id, state, created_at FROM snapshots
             WHERE document_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(document_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn delete_snapshot(&self, id: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM snapshots WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn save_text_document(&self, doc: TextDocumentState) -> StorageResult<()> {
        let envelope = Value::Object(
            serde_json::json!({
                "type": "text",
                "content": BASE64.encode(&doc.content),
                "crdt": BASE64.encode(&doc.crdt_state),
                "clock": Value::Object(doc.clock),
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        );
        sqlx::query(
            "INSERT INTO documents (id, state, version, updated_at)
             VALUES ($1, $2, 1, now())
             ON CONFLICT (id) DO UPDATE SET state = EXCLUDED.state, updated_at = now()",
        )
        .bind(&doc.id)
        .bind(envelope)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_text_document(&self, id: &str) -> StorageResult<Option<TextDocumentState>> {
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
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        let sessions_deleted = sqlx::query(
            "DELETE FROM sessions WHERE last_seen < now() - ($1 || ' hours')::interval",
        )
        .bind(options.old_sessions_hours.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?
        .rows_affected();

        let deltas_deleted = sqlx::query(
            "DELETE FROM deltas WHERE created_at < now() - ($1 || ' days')::interval",
        )
        .bind(options.old_deltas_days.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?
        .rows_affected();

        let snapshots_deleted = sqlx::query(
            "DELETE FROM snapshots WHERE id IN (
                SELECT id FROM (
                    SELECT id,
                           created_at < now() - ($2 || ' days')::interval AS too_old,
                           row_number() OVER (PARTITION BY document_id ORDER BY created_at DESC) AS rank
                    FROM snapshots
                ) ranked
                WHERE too_old OR rank > $1
            )",
        )
        .bind(options.max_snapshots_per_document as i64)
        .bind(options.old_snapshots_days.to_string())
        .execute(&mut *tx)
        .await
        .map_err(query_err)?
        .rows_affected();

        tx.commit().await.map_err(query_err)?;

        Ok(CleanupResult {
            sessions_deleted,
            deltas_deleted,
            snapshots_deleted,
        })
    }
}
