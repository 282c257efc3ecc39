//! Vector store adapter.
//!
//! Rows and embedding blobs live in SQLite; the full embedding table is kept
//! resident in memory and mirrored into a USearch HNSW index when the
//! `vector-search` feature is enabled. Without the feature, queries fall back
//! to an exact cosine scan over the resident table.
//!
//! Metadata values are scalar; structured sub-objects are serialized to a
//! canonical JSON string before storage.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use super::{lock_poisoned, migrations, open_pair, StoreError, StoreHealth, StoreResult};
use crate::memory::{MemoryLayer, MemoryType};

/// Oversampling factor applied before metadata filtering
const QUERY_OVERSAMPLE: usize = 4;

// ============================================================================
// ROWS & FILTERS
// ============================================================================

/// One stored vector record (embedding kept separately)
#[derive(Debug, Clone)]
pub struct VectorRow {
    pub id: String,
    pub user_id: String,
    pub document: String,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl VectorRow {
    /// String metadata accessor
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Numeric metadata accessor
    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(|v| v.as_f64())
    }

    /// Integer metadata accessor
    pub fn meta_i64(&self, key: &str) -> Option<i64> {
        self.metadata.get(key).and_then(|v| v.as_i64())
    }

    /// Boolean metadata accessor
    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(|v| v.as_bool())
    }

    /// Decode a JSON-encoded string list (tags, persona tags)
    pub fn meta_string_list(&self, key: &str) -> Vec<String> {
        self.meta_str(key)
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .unwrap_or_default()
    }
}

/// Structured filter applied to queries and scans
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub user_id: Option<String>,
    pub layer: Option<MemoryLayer>,
    pub memory_type: Option<MemoryType>,
    pub tag: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl VectorFilter {
    /// Filter scoped to one user
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    /// Whether a row satisfies every supplied criterion
    pub fn matches(&self, row: &VectorRow) -> bool {
        if let Some(user_id) = &self.user_id {
            if row.user_id != *user_id {
                return false;
            }
        }
        if let Some(layer) = &self.layer {
            if row.meta_str("layer") != Some(layer.as_str()) {
                return false;
            }
        }
        if let Some(memory_type) = &self.memory_type {
            if row.meta_str("type") != Some(memory_type.as_str()) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !row.meta_string_list("tags").iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if row.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if row.created_at > before {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// EMBEDDING BLOBS
// ============================================================================

/// Encode an embedding as little-endian f32 bytes
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes back into an embedding
pub fn embedding_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}

// ============================================================================
// HNSW INDEX (feature-gated)
// ============================================================================

#[cfg(feature = "vector-search")]
mod hnsw {
    use std::collections::HashMap;
    use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

    use crate::stores::{StoreError, StoreResult};

    /// HNSW index keyed by string ids
    pub struct HnswIndex {
        index: Index,
        dimensions: usize,
        key_to_id: HashMap<String, u64>,
        id_to_key: HashMap<u64, String>,
        next_id: u64,
    }

    impl HnswIndex {
        pub fn new(dimensions: usize) -> StoreResult<Self> {
            let options = IndexOptions {
                dimensions,
                metric: MetricKind::Cos,
                quantization: ScalarKind::F32,
                connectivity: 16,
                expansion_add: 128,
                expansion_search: 64,
                multi: false,
            };
            let index = Index::new(&options)
                .map_err(|e| StoreError::Init(format!("hnsw index creation failed: {e}")))?;
            Ok(Self {
                index,
                dimensions,
                key_to_id: HashMap::new(),
                id_to_key: HashMap::new(),
                next_id: 0,
            })
        }

        pub fn add(&mut self, key: &str, vector: &[f32]) -> StoreResult<()> {
            if vector.len() != self.dimensions {
                return Err(StoreError::InvalidInput(format!(
                    "expected {} dimensions, got {}",
                    self.dimensions,
                    vector.len()
                )));
            }

            if let Some(&existing) = self.key_to_id.get(key) {
                self.index
                    .remove(existing)
                    .map_err(|e| StoreError::Unavailable(format!("hnsw remove failed: {e}")))?;
                self.reserve(self.index.size() + 1)?;
                self.index
                    .add(existing, vector)
                    .map_err(|e| StoreError::Unavailable(format!("hnsw add failed: {e}")))?;
                return Ok(());
            }

            // usearch requires reserve() before add()
            if self.index.size() >= self.index.capacity() {
                let capacity = std::cmp::max(self.index.capacity() * 2, 64);
                self.reserve(capacity)?;
            }

            let id = self.next_id;
            self.next_id += 1;
            self.index
                .add(id, vector)
                .map_err(|e| StoreError::Unavailable(format!("hnsw add failed: {e}")))?;
            self.key_to_id.insert(key.to_string(), id);
            self.id_to_key.insert(id, key.to_string());
            Ok(())
        }

        pub fn remove(&mut self, key: &str) -> StoreResult<bool> {
            if let Some(id) = self.key_to_id.remove(key) {
                self.id_to_key.remove(&id);
                self.index
                    .remove(id)
                    .map_err(|e| StoreError::Unavailable(format!("hnsw remove failed: {e}")))?;
                Ok(true)
            } else {
                Ok(false)
            }
        }

        /// Top-k search returning (key, cosine similarity)
        pub fn search(&self, query: &[f32], limit: usize) -> StoreResult<Vec<(String, f32)>> {
            if self.index.size() == 0 {
                return Ok(vec![]);
            }
            let matches = self
                .index
                .search(query, limit)
                .map_err(|e| StoreError::Unavailable(format!("hnsw search failed: {e}")))?;
            let mut results = Vec::with_capacity(matches.keys.len());
            for (id, distance) in matches.keys.iter().zip(matches.distances.iter()) {
                if let Some(key) = self.id_to_key.get(id) {
                    results.push((key.clone(), 1.0 - distance));
                }
            }
            Ok(results)
        }

        fn reserve(&self, capacity: usize) -> StoreResult<()> {
            self.index
                .reserve(capacity)
                .map_err(|e| StoreError::Init(format!("hnsw reserve failed: {e}")))
        }
    }
}

// ============================================================================
// VECTOR STORE
// ============================================================================

/// The vector store adapter
pub struct VectorStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    dimension: usize,
    /// Resident embedding table; authoritative for similarity math
    embeddings: RwLock<HashMap<String, Vec<f32>>>,
    #[cfg(feature = "vector-search")]
    index: Mutex<hnsw::HnswIndex>,
}

impl VectorStore {
    /// Open (or create) the vector store at `path`
    pub fn open(path: &Path, dimension: usize) -> StoreResult<Self> {
        if dimension == 0 {
            return Err(StoreError::InvalidInput("dimension must be > 0".into()));
        }
        let (writer, reader) = open_pair(path, "vector", migrations::VECTOR_MIGRATIONS)?;

        let store = Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            dimension,
            embeddings: RwLock::new(HashMap::new()),
            #[cfg(feature = "vector-search")]
            index: Mutex::new(hnsw::HnswIndex::new(dimension)?),
        };
        store.load_resident_embeddings()?;
        Ok(store)
    }

    /// Configured embedding dimension
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn load_resident_embeddings(&self) -> StoreResult<()> {
        let rows: Vec<(String, Vec<u8>)> = {
            let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
            let mut stmt = reader.prepare("SELECT id, embedding FROM vector_embeddings")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            rows
        };

        let mut resident = self
            .embeddings
            .write()
            .map_err(|_| lock_poisoned("embeddings"))?;
        #[cfg(feature = "vector-search")]
        let mut index = self.index.lock().map_err(|_| lock_poisoned("index"))?;

        for (id, bytes) in rows {
            match embedding_from_bytes(&bytes) {
                Some(embedding) if embedding.len() == self.dimension => {
                    #[cfg(feature = "vector-search")]
                    if let Err(e) = index.add(&id, &embedding) {
                        tracing::warn!("failed to index embedding for {id}: {e}");
                    }
                    resident.insert(id, embedding);
                }
                _ => tracing::warn!("skipping malformed embedding blob for {id}"),
            }
        }
        Ok(())
    }

    /// Upsert a record. Nested metadata values are JSON-encoded to keep the
    /// stored map scalar-only.
    pub fn upsert(
        &self,
        id: &str,
        embedding: &[f32],
        document: &str,
        metadata: &Map<String, Value>,
    ) -> StoreResult<()> {
        if embedding.len() != self.dimension {
            return Err(StoreError::InvalidInput(format!(
                "expected {} dimensions, got {}",
                self.dimension,
                embedding.len()
            )));
        }

        let canonical = canonicalize_metadata(metadata);
        let metadata_json = serde_json::to_string(&canonical)
            .map_err(|e| StoreError::InvalidInput(format!("metadata not serializable: {e}")))?;
        let user_id = canonical
            .get("user_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StoreError::InvalidInput("metadata.user_id is required".into()))?
            .to_string();
        let created_at = canonical
            .get("created_at")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().to_rfc3339());

        {
            let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
            writer.execute(
                "INSERT INTO vector_records (id, user_id, document, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    user_id = excluded.user_id,
                    document = excluded.document,
                    metadata = excluded.metadata",
                params![id, user_id, document, metadata_json, created_at],
            )?;
            writer.execute(
                "INSERT OR REPLACE INTO vector_embeddings (id, embedding, dimensions)
                 VALUES (?1, ?2, ?3)",
                params![id, embedding_to_bytes(embedding), self.dimension as i64],
            )?;
        }

        self.embeddings
            .write()
            .map_err(|_| lock_poisoned("embeddings"))?
            .insert(id.to_string(), embedding.to_vec());

        #[cfg(feature = "vector-search")]
        self.index
            .lock()
            .map_err(|_| lock_poisoned("index"))?
            .add(id, embedding)?;

        Ok(())
    }

    /// Delete a record; true when a row existed
    pub fn delete(&self, id: &str) -> StoreResult<bool> {
        let deleted = {
            let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
            writer.execute("DELETE FROM vector_embeddings WHERE id = ?1", [id])?;
            writer.execute("DELETE FROM vector_records WHERE id = ?1", [id])?
        };

        self.embeddings
            .write()
            .map_err(|_| lock_poisoned("embeddings"))?
            .remove(id);

        #[cfg(feature = "vector-search")]
        self.index
            .lock()
            .map_err(|_| lock_poisoned("index"))?
            .remove(id)?;

        Ok(deleted > 0)
    }

    /// Fetch rows by id, preserving input order for ids that exist
    pub fn get(&self, ids: &[String]) -> StoreResult<Vec<VectorRow>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = query_row_by_id(&reader, id)? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Fetch one row by id
    pub fn get_one(&self, id: &str) -> StoreResult<Option<VectorRow>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        query_row_by_id(&reader, id)
    }

    /// Resident embedding for an id
    pub fn get_embedding(&self, id: &str) -> StoreResult<Option<Vec<f32>>> {
        Ok(self
            .embeddings
            .read()
            .map_err(|_| lock_poisoned("embeddings"))?
            .get(id)
            .cloned())
    }

    /// Similarity query: top-k rows passing the filter, with cosine scores
    pub fn query(
        &self,
        embedding: &[f32],
        filter: &VectorFilter,
        top_k: usize,
    ) -> StoreResult<Vec<(VectorRow, f32)>> {
        if embedding.len() != self.dimension {
            return Err(StoreError::InvalidInput(format!(
                "expected {} dimensions, got {}",
                self.dimension,
                embedding.len()
            )));
        }
        if top_k == 0 {
            return Ok(vec![]);
        }

        let candidates = self.candidate_ids(embedding, top_k * QUERY_OVERSAMPLE)?;

        let mut results = Vec::with_capacity(top_k);
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        for (id, similarity) in candidates {
            if results.len() >= top_k {
                break;
            }
            if let Some(row) = query_row_by_id(&reader, &id)? {
                if filter.matches(&row) {
                    results.push((row, similarity));
                }
            }
        }
        Ok(results)
    }

    #[cfg(feature = "vector-search")]
    fn candidate_ids(&self, embedding: &[f32], limit: usize) -> StoreResult<Vec<(String, f32)>> {
        self.index
            .lock()
            .map_err(|_| lock_poisoned("index"))?
            .search(embedding, limit)
    }

    #[cfg(not(feature = "vector-search"))]
    fn candidate_ids(&self, embedding: &[f32], limit: usize) -> StoreResult<Vec<(String, f32)>> {
        // Exact scan fallback
        let resident = self
            .embeddings
            .read()
            .map_err(|_| lock_poisoned("embeddings"))?;
        let mut scored: Vec<(String, f32)> = resident
            .iter()
            .map(|(id, vec)| (id.clone(), crate::oracle::cosine_similarity(embedding, vec)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Offset/limit scan with an explicit post-filter total.
    ///
    /// `oldest_first` flips the timestamp ordering for `sort=oldest` listings.
    pub fn scan(
        &self,
        filter: &VectorFilter,
        offset: usize,
        limit: usize,
        oldest_first: bool,
    ) -> StoreResult<(Vec<VectorRow>, u64)> {
        let rows = self.scan_all(filter, oldest_first)?;
        let total = rows.len() as u64;
        let page = rows.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    fn scan_all(&self, filter: &VectorFilter, oldest_first: bool) -> StoreResult<Vec<VectorRow>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let order = if oldest_first { "ASC" } else { "DESC" };

        let (sql, bind): (String, Vec<String>) = match &filter.user_id {
            Some(user_id) => (
                format!(
                    "SELECT id, user_id, document, metadata, created_at
                     FROM vector_records WHERE user_id = ?1 ORDER BY created_at {order}"
                ),
                vec![user_id.clone()],
            ),
            None => (
                format!(
                    "SELECT id, user_id, document, metadata, created_at
                     FROM vector_records ORDER BY created_at {order}"
                ),
                vec![],
            ),
        };

        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(bind.iter()), row_from_sql)?
            .collect::<rusqlite::Result<Vec<VectorRow>>>()?;
        Ok(rows.into_iter().filter(|row| filter.matches(row)).collect())
    }

    /// Merge a metadata patch into an existing row
    pub fn update_metadata(&self, id: &str, patch: &Map<String, Value>) -> StoreResult<()> {
        let writer = self.writer.lock().map_err(|_| lock_poisoned("writer"))?;
        let existing: Option<String> = writer
            .query_row(
                "SELECT metadata FROM vector_records WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(existing) = existing else {
            return Err(StoreError::NotFound(format!("vector record {id}")));
        };

        let mut metadata: Map<String, Value> =
            serde_json::from_str(&existing).unwrap_or_default();
        for (key, value) in canonicalize_metadata(patch) {
            metadata.insert(key, value);
        }
        let metadata_json = serde_json::to_string(&metadata)
            .map_err(|e| StoreError::InvalidInput(format!("metadata not serializable: {e}")))?;
        writer.execute(
            "UPDATE vector_records SET metadata = ?1 WHERE id = ?2",
            params![metadata_json, id],
        )?;
        Ok(())
    }

    /// Distinct users with at least one record
    pub fn list_users(&self) -> StoreResult<Vec<String>> {
        let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
        let mut stmt =
            reader.prepare("SELECT DISTINCT user_id FROM vector_records ORDER BY user_id")?;
        let users = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(users)
    }

    /// Health probe
    pub fn health(&self) -> StoreHealth {
        StoreHealth::probe(|| {
            let reader = self.reader.lock().map_err(|_| lock_poisoned("reader"))?;
            reader.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }
}

fn row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<VectorRow> {
    let metadata_json: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(VectorRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        document: row.get(2)?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn query_row_by_id(conn: &Connection, id: &str) -> StoreResult<Option<VectorRow>> {
    let row = conn
        .query_row(
            "SELECT id, user_id, document, metadata, created_at
             FROM vector_records WHERE id = ?1",
            [id],
            row_from_sql,
        )
        .optional()?;
    Ok(row)
}

/// Replace nested objects/arrays with canonical JSON strings; scalars pass
/// through untouched.
fn canonicalize_metadata(metadata: &Map<String, Value>) -> Map<String, Value> {
    let mut canonical = Map::new();
    for (key, value) in metadata {
        let flattened = match value {
            Value::Object(_) | Value::Array(_) => {
                Value::String(serde_json::to_string(value).unwrap_or_default())
            }
            other => other.clone(),
        };
        canonical.insert(key.clone(), flattened);
    }
    canonical
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DIM: usize = 8;

    fn open_store() -> (TempDir, VectorStore) {
        let dir = TempDir::new().unwrap();
        let store = VectorStore::open(&dir.path().join("vector.db"), DIM).unwrap();
        (dir, store)
    }

    fn vec_for(seed: f32) -> Vec<f32> {
        (0..DIM).map(|i| ((i as f32 + seed) * 0.37).sin()).collect()
    }

    fn meta_for(user: &str, layer: &str) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert("user_id".into(), Value::String(user.into()));
        meta.insert("layer".into(), Value::String(layer.into()));
        meta.insert("type".into(), Value::String("explicit".into()));
        meta.insert(
            "tags".into(),
            serde_json::json!(["alpha", "beta"]),
        );
        meta
    }

    #[test]
    fn test_upsert_get_roundtrip() {
        let (_dir, store) = open_store();
        store
            .upsert("m1", &vec_for(1.0), "hello world", &meta_for("u1", "semantic"))
            .unwrap();

        let row = store.get_one("m1").unwrap().unwrap();
        assert_eq!(row.user_id, "u1");
        assert_eq!(row.document, "hello world");
        assert_eq!(row.meta_str("layer"), Some("semantic"));
        // Nested array was canonicalized to a JSON string
        assert_eq!(row.meta_string_list("tags"), vec!["alpha", "beta"]);
    }

    #[test]
    fn test_upsert_rejects_wrong_dimension() {
        let (_dir, store) = open_store();
        let err = store
            .upsert("m1", &[1.0, 2.0], "short", &meta_for("u1", "semantic"))
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn test_query_respects_filter_and_ranks_by_similarity() {
        let (_dir, store) = open_store();
        store
            .upsert("m1", &vec_for(1.0), "about rust", &meta_for("u1", "semantic"))
            .unwrap();
        store
            .upsert("m2", &vec_for(1.05), "about rust too", &meta_for("u1", "episodic"))
            .unwrap();
        store
            .upsert("m3", &vec_for(9.0), "about cooking", &meta_for("u2", "semantic"))
            .unwrap();

        let filter = VectorFilter::for_user("u1");
        let results = store.query(&vec_for(1.0), &filter, 10).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0.id, "m1");
        assert!(results[0].1 >= results[1].1);

        let mut layered = VectorFilter::for_user("u1");
        layered.layer = Some(MemoryLayer::Episodic);
        let results = store.query(&vec_for(1.0), &layered, 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, "m2");
    }

    #[test]
    fn test_delete_removes_everywhere() {
        let (_dir, store) = open_store();
        store
            .upsert("m1", &vec_for(1.0), "doc", &meta_for("u1", "semantic"))
            .unwrap();
        assert!(store.delete("m1").unwrap());
        assert!(!store.delete("m1").unwrap());
        assert!(store.get_one("m1").unwrap().is_none());
        assert!(store.get_embedding("m1").unwrap().is_none());
        let results = store
            .query(&vec_for(1.0), &VectorFilter::for_user("u1"), 5)
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_scan_pagination_and_total() {
        let (_dir, store) = open_store();
        for i in 0..5 {
            store
                .upsert(
                    &format!("m{i}"),
                    &vec_for(i as f32),
                    &format!("doc {i}"),
                    &meta_for("u1", "semantic"),
                )
                .unwrap();
        }
        let (page, total) = store
            .scan(&VectorFilter::for_user("u1"), 1, 2, false)
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn test_update_metadata_merges() {
        let (_dir, store) = open_store();
        store
            .upsert("m1", &vec_for(1.0), "doc", &meta_for("u1", "semantic"))
            .unwrap();
        let mut patch = Map::new();
        patch.insert("stored_in_episodic".into(), Value::Bool(true));
        store.update_metadata("m1", &patch).unwrap();

        let row = store.get_one("m1").unwrap().unwrap();
        assert_eq!(row.meta_bool("stored_in_episodic"), Some(true));
        assert_eq!(row.meta_str("layer"), Some("semantic"));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vector.db");
        {
            let store = VectorStore::open(&path, DIM).unwrap();
            store
                .upsert("m1", &vec_for(1.0), "doc", &meta_for("u1", "semantic"))
                .unwrap();
        }
        let store = VectorStore::open(&path, DIM).unwrap();
        let results = store
            .query(&vec_for(1.0), &VectorFilter::for_user("u1"), 5)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, "m1");
    }

    #[test]
    fn test_embedding_bytes_roundtrip() {
        let original = vec_for(3.0);
        let bytes = embedding_to_bytes(&original);
        let decoded = embedding_from_bytes(&bytes).unwrap();
        assert_eq!(original, decoded);
        assert!(embedding_from_bytes(&bytes[..5]).is_none());
    }
}
