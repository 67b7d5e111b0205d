//! Per-source chunk storage with hybrid (semantic + lexical) search
//!
//! Each indexed source owns an independent collection: one SQLite table for
//! the chunk rows, one tantivy directory for the lexical index, and an
//! in-memory similarity index rebuilt lazily after each write. A crawl is a
//! full snapshot: `replace_all` drops and recreates the collection as one
//! logical write, serialized per source, so readers never observe a
//! half-replaced collection.

mod database;
mod fusion;
mod keyword_index;
mod vector_index;

pub use database::{Database, DbPool};
pub use fusion::{reciprocal_rank_fusion, FusionConfig, FusionError};
pub use keyword_index::{KeywordIndex, KeywordIndexError};
pub use vector_index::{exact_top_k, AnnParams, VectorIndex, VectorIndexError};

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::chunk::{ObjectType, SchemaChunk};
use crate::error::{Result, SkemaError};

/// Vector store tuning knobs.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for the database and keyword indexes
    pub data_dir: PathBuf,
    /// HNSW parameters, including the exact-scan cutoff
    pub ann: AnnParams,
    /// Rank-fusion parameters for hybrid search
    pub fusion: FusionConfig,
    /// Each hybrid branch retrieves max(multiplier * top_k, floor) candidates
    pub candidate_multiplier: usize,
    pub candidate_floor: usize,
}

impl StoreConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ann: AnnParams::default(),
            fusion: FusionConfig::default(),
            candidate_multiplier: 2,
            candidate_floor: 60,
        }
    }
}

/// Search parameters for one query.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    /// When present, lexical search runs too and results are rank-fused
    pub query_text: Option<String>,
    pub type_filter: Option<ObjectType>,
}

impl SearchOptions {
    pub fn new(top_k: usize) -> Self {
        Self {
            top_k,
            query_text: None,
            type_filter: None,
        }
    }

    pub fn with_query_text(mut self, text: impl Into<String>) -> Self {
        self.query_text = Some(text.into());
        self
    }

    pub fn with_type_filter(mut self, object_type: ObjectType) -> Self {
        self.type_filter = Some(object_type);
        self
    }
}

/// A chunk with its search score.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: SchemaChunk,
    pub score: f32,
}

/// Aggregate view over a source's stored chunks. Always recomputed by
/// scanning; never stored independently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStats {
    pub source_id: String,
    pub total_chunks: usize,
    pub table_chunks: usize,
    pub view_chunks: usize,
    pub procedure_chunks: usize,
    pub function_chunks: usize,
    pub chunks_with_summary: usize,
    pub chunks_with_embedding: usize,
    pub last_indexed_at: Option<DateTime<Utc>>,
}

/// Derive a collection key from an arbitrary source id.
///
/// Non-alphanumeric characters become underscores; a short content digest of
/// the raw id is appended so ids that sanitize identically cannot collide.
pub fn collection_key(source_id: &str) -> String {
    let mut sanitized: String = source_id
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    sanitized.truncate(40);

    let digest = blake3::hash(source_id.as_bytes()).to_hex();
    format!("src_{}_{}", sanitized, &digest[..8])
}

/// Durable, queryable chunk storage, one independent collection per source.
pub struct VectorStore {
    db: Database,
    keywords_dir: PathBuf,
    config: StoreConfig,
    collection_locks: StdMutex<AHashMap<String, Arc<RwLock<()>>>>,
    vector_cache: RwLock<AHashMap<String, Arc<VectorIndex>>>,
}

impl VectorStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        let keywords_dir = config.data_dir.join("keywords");
        std::fs::create_dir_all(&keywords_dir).map_err(|e| SkemaError::Io {
            source: e,
            context: format!(
                "Failed to create keyword index directory: {}",
                keywords_dir.display()
            ),
        })?;

        let db = Database::new(&config.data_dir.join("db.sqlite"))?;

        Ok(Self {
            db,
            keywords_dir,
            config,
            collection_locks: StdMutex::new(AHashMap::new()),
            vector_cache: RwLock::new(AHashMap::new()),
        })
    }

    /// Per-source lock: writes exclusive, reads shared.
    fn collection_lock(&self, source_id: &str) -> Arc<RwLock<()>> {
        let mut locks = self.collection_locks.lock().expect("lock poisoned");
        locks
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn lookup_key(&self, source_id: &str) -> Result<Option<String>> {
        let conn = self.db.get_conn()?;
        let key = conn
            .query_row(
                "SELECT collection_key FROM collections WHERE source_id = ?1",
                params![source_id],
                |row| row.get::<_, String>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(key)
    }

    /// Atomically replace the source's collection with the given chunks.
    pub async fn replace_all(&self, source_id: &str, chunks: &[SchemaChunk]) -> Result<()> {
        let lock = self.collection_lock(source_id);
        let _guard = lock.write().await;

        let key = collection_key(source_id);
        info!(
            "Replacing collection for source '{}' with {} chunks",
            source_id,
            chunks.len()
        );

        {
            let mut conn = self.db.get_conn()?;
            let tx = conn.transaction()?;

            tx.execute_batch(&format!(
                r#"
                DROP TABLE IF EXISTS "{key}";
                CREATE TABLE "{key}" (
                    id TEXT PRIMARY KEY,
                    source_id TEXT NOT NULL,
                    object_type TEXT NOT NULL,
                    object_name TEXT NOT NULL,
                    schema_name TEXT NOT NULL,
                    content TEXT NOT NULL,
                    summary TEXT NOT NULL,
                    embedding BLOB NOT NULL,
                    indexed_at INTEGER NOT NULL
                );
                "#
            ))?;

            {
                let mut stmt = tx.prepare(&format!(
                    r#"INSERT INTO "{key}"
                       (id, source_id, object_type, object_name, schema_name,
                        content, summary, embedding, indexed_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#
                ))?;
                for chunk in chunks {
                    stmt.execute(params![
                        chunk.id,
                        chunk.source_id,
                        chunk.object_type.as_str(),
                        chunk.object_name,
                        chunk.schema_name,
                        chunk.content,
                        chunk.summary,
                        vec_to_blob(&chunk.embedding),
                        chunk.indexed_at.timestamp(),
                    ])?;
                }
            }

            tx.execute(
                "INSERT INTO collections (source_id, collection_key, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(source_id) DO UPDATE SET
                     collection_key = excluded.collection_key,
                     created_at = excluded.created_at",
                params![source_id, key, Utc::now().timestamp()],
            )?;

            tx.commit()?;
        }

        let mut keyword_index = KeywordIndex::create(self.keywords_dir.join(&key))
            .map_err(|e| SkemaError::Index(e.to_string()))?;
        for chunk in chunks {
            keyword_index
                .insert(&chunk.id, &chunk.content)
                .map_err(|e| SkemaError::Index(e.to_string()))?;
        }
        keyword_index
            .commit()
            .map_err(|e| SkemaError::Index(e.to_string()))?;

        self.vector_cache.write().await.remove(source_id);

        Ok(())
    }

    /// Return up to `limit` chunks with no ranking. A missing collection is
    /// an empty result, not an error.
    pub async fn get_all(&self, source_id: &str, limit: usize) -> Result<Vec<SchemaChunk>> {
        let lock = self.collection_lock(source_id);
        let _guard = lock.read().await;

        let Some(key) = self.lookup_key(source_id)? else {
            return Ok(Vec::new());
        };
        self.load_chunks(&key, Some(limit))
    }

    /// Similarity / hybrid search over the source's collection.
    pub async fn search(
        &self,
        source_id: &str,
        query_vector: &[f32],
        options: &SearchOptions,
    ) -> Result<Vec<ScoredChunk>> {
        let lock = self.collection_lock(source_id);
        let _guard = lock.read().await;

        let Some(key) = self.lookup_key(source_id)? else {
            return Ok(Vec::new());
        };

        let chunks = self.load_chunks(&key, None)?;
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let by_id: AHashMap<&str, &SchemaChunk> =
            chunks.iter().map(|c| (c.id.as_str(), c)).collect();

        let hybrid = options.query_text.is_some();
        let candidate_count = if hybrid {
            (options.top_k * self.config.candidate_multiplier).max(self.config.candidate_floor)
        } else {
            options.top_k
        };

        let semantic = self
            .semantic_candidates(source_id, &chunks, query_vector, candidate_count, options)
            .await?;

        if !hybrid {
            return Ok(hydrate(&by_id, semantic));
        }

        let query_text = options.query_text.as_deref().unwrap_or_default();
        let lexical = self.lexical_candidates(&key, query_text, candidate_count, options, &by_id);

        // Lexical failure or an empty term match falls back to vector-only
        if lexical.is_empty() {
            let mut results = semantic;
            results.truncate(options.top_k);
            return Ok(hydrate(&by_id, results));
        }

        let semantic_ids: Vec<String> = semantic.into_iter().map(|(id, _)| id).collect();
        let mut fused = reciprocal_rank_fusion(&semantic_ids, &lexical, &self.config.fusion);
        fused.truncate(options.top_k);

        Ok(hydrate(&by_id, fused))
    }

    async fn semantic_candidates(
        &self,
        source_id: &str,
        chunks: &[SchemaChunk],
        query_vector: &[f32],
        candidate_count: usize,
        options: &SearchOptions,
    ) -> Result<Vec<(String, f32)>> {
        // A type filter narrows the corpus before scoring, so that path
        // always scans exactly
        if let Some(filter) = options.type_filter {
            let items: Vec<(String, Vec<f32>)> = chunks
                .iter()
                .filter(|c| c.object_type == filter)
                .map(|c| (c.id.clone(), c.embedding.clone()))
                .collect();
            return Ok(exact_top_k(query_vector, &items, candidate_count));
        }

        let index = self.vector_index(source_id, chunks).await;
        index
            .search(query_vector, candidate_count)
            .map_err(|e| SkemaError::Index(e.to_string()))
    }

    fn lexical_candidates(
        &self,
        key: &str,
        query_text: &str,
        candidate_count: usize,
        options: &SearchOptions,
        by_id: &AHashMap<&str, &SchemaChunk>,
    ) -> Vec<String> {
        let results = KeywordIndex::open(self.keywords_dir.join(key))
            .and_then(|index| index.search(query_text, candidate_count));

        match results {
            Ok(hits) => hits
                .into_iter()
                .map(|(id, _)| id)
                .filter(|id| match options.type_filter {
                    Some(filter) => by_id
                        .get(id.as_str())
                        .is_some_and(|c| c.object_type == filter),
                    None => true,
                })
                .collect(),
            Err(e) => {
                warn!("Keyword search failed, falling back to vector-only: {}", e);
                Vec::new()
            }
        }
    }

    /// Cached per-source similarity index, rebuilt after every write.
    async fn vector_index(&self, source_id: &str, chunks: &[SchemaChunk]) -> Arc<VectorIndex> {
        if let Some(index) = self.vector_cache.read().await.get(source_id) {
            return index.clone();
        }

        let dimension = chunks
            .iter()
            .find(|c| !c.embedding.is_empty())
            .map(|c| c.embedding.len())
            .unwrap_or(0);
        let items: Vec<(String, Vec<f32>)> = chunks
            .iter()
            .map(|c| (c.id.clone(), c.embedding.clone()))
            .collect();

        let index = Arc::new(VectorIndex::build(dimension, items, &self.config.ann));
        debug!(
            "Built {} vector index for '{}' ({} vectors)",
            if index.is_approximate() { "HNSW" } else { "exact" },
            source_id,
            index.len()
        );

        self.vector_cache
            .write()
            .await
            .insert(source_id.to_string(), index.clone());
        index
    }

    /// Drop the source's collection. Idempotent on a missing collection.
    pub async fn clear(&self, source_id: &str) -> Result<()> {
        let lock = self.collection_lock(source_id);
        let _guard = lock.write().await;

        let Some(key) = self.lookup_key(source_id)? else {
            return Ok(());
        };

        {
            let conn = self.db.get_conn()?;
            conn.execute_batch(&format!(r#"DROP TABLE IF EXISTS "{key}";"#))?;
            conn.execute(
                "DELETE FROM collections WHERE source_id = ?1",
                params![source_id],
            )?;
        }

        let keyword_path = self.keywords_dir.join(&key);
        if keyword_path.exists() {
            std::fs::remove_dir_all(&keyword_path).map_err(|e| SkemaError::Io {
                source: e,
                context: format!("Failed to remove keyword index: {}", keyword_path.display()),
            })?;
        }

        self.vector_cache.write().await.remove(source_id);
        info!("Cleared collection for source '{}'", source_id);

        Ok(())
    }

    /// Aggregate stats, computed by a full scan.
    pub async fn stats(&self, source_id: &str) -> Result<IndexStats> {
        let lock = self.collection_lock(source_id);
        let _guard = lock.read().await;

        let mut stats = IndexStats {
            source_id: source_id.to_string(),
            ..IndexStats::default()
        };

        let Some(key) = self.lookup_key(source_id)? else {
            return Ok(stats);
        };

        for chunk in self.load_chunks(&key, None)? {
            stats.total_chunks += 1;
            match chunk.object_type {
                ObjectType::Table => stats.table_chunks += 1,
                ObjectType::View => stats.view_chunks += 1,
                ObjectType::StoredProcedure => stats.procedure_chunks += 1,
                ObjectType::Function => stats.function_chunks += 1,
            }
            if !chunk.summary.is_empty() {
                stats.chunks_with_summary += 1;
            }
            if !chunk.embedding.is_empty() {
                stats.chunks_with_embedding += 1;
            }
            stats.last_indexed_at = match stats.last_indexed_at {
                Some(prev) if prev >= chunk.indexed_at => Some(prev),
                _ => Some(chunk.indexed_at),
            };
        }

        Ok(stats)
    }

    /// All source ids with an indexed collection.
    pub fn list_sources(&self) -> Result<Vec<String>> {
        let conn = self.db.get_conn()?;
        let mut stmt = conn.prepare("SELECT source_id FROM collections ORDER BY source_id")?;
        let sources = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(sources)
    }

    fn load_chunks(&self, key: &str, limit: Option<usize>) -> Result<Vec<SchemaChunk>> {
        let conn = self.db.get_conn()?;

        let sql = match limit {
            Some(_) => format!(
                r#"SELECT id, source_id, object_type, object_name, schema_name,
                          content, summary, embedding, indexed_at
                   FROM "{key}" LIMIT ?1"#
            ),
            None => format!(
                r#"SELECT id, source_id, object_type, object_name, schema_name,
                          content, summary, embedding, indexed_at
                   FROM "{key}""#
            ),
        };

        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(
            String,
            String,
            String,
            String,
            String,
            String,
            String,
            Vec<u8>,
            i64,
        )> {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
            ))
        };

        let rows = match limit {
            Some(n) => stmt
                .query_map(params![n as i64], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], map_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };

        rows.into_iter()
            .map(
                |(id, source_id, ty, object_name, schema_name, content, summary, blob, ts)| {
                    let object_type = ObjectType::parse(&ty)
                        .ok_or_else(|| SkemaError::Index(format!("unknown object type: {}", ty)))?;
                    Ok(SchemaChunk {
                        id,
                        source_id,
                        object_type,
                        object_name,
                        schema_name,
                        content,
                        summary,
                        embedding: blob_to_vec(&blob),
                        indexed_at: DateTime::from_timestamp(ts, 0).unwrap_or_default(),
                    })
                },
            )
            .collect()
    }
}

fn hydrate(by_id: &AHashMap<&str, &SchemaChunk>, ranked: Vec<(String, f32)>) -> Vec<ScoredChunk> {
    ranked
        .into_iter()
        .filter_map(|(id, score)| {
            by_id.get(id.as_str()).map(|chunk| ScoredChunk {
                chunk: (*chunk).clone(),
                score,
            })
        })
        .collect()
}

/// Encode an embedding as little-endian bytes for BLOB storage.
fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a BLOB back into an embedding.
fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}
