//! Tantivy full-text index over chunk content, one directory per collection

use std::path::PathBuf;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::*;
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeywordIndexError {
    #[error("Index initialization failed: {0}")]
    InitializationError(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Insert failed: {0}")]
    InsertError(String),

    #[error("Search failed: {0}")]
    SearchError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Tantivy error: {0}")]
    TantivyError(#[from] TantivyError),

    #[error("Query parsing error: {0}")]
    QueryParseError(String),
}

/// Full-text index wrapper with BM25 ranking.
///
/// Collections are rebuilt wholesale on every crawl, so the writer only
/// exists during [`KeywordIndex::create`]; searches open read-only.
pub struct KeywordIndex {
    index: Index,
    reader: IndexReader,
    writer: Option<IndexWriter>,
    id_field: Field,
    content_field: Field,
    #[allow(dead_code)]
    index_path: PathBuf,
}

impl KeywordIndex {
    /// Create a fresh index, wiping any previous directory contents.
    pub fn create(index_path: PathBuf) -> Result<Self, KeywordIndexError> {
        if index_path.exists() {
            std::fs::remove_dir_all(&index_path)?;
        }
        std::fs::create_dir_all(&index_path)?;

        let mut schema_builder = Schema::builder();
        let id_field = schema_builder.add_text_field("id", STRING | STORED);
        let content_field = schema_builder.add_text_field("content", TEXT);
        let schema = schema_builder.build();

        let index = Index::create_in_dir(&index_path, schema)
            .map_err(|e| KeywordIndexError::InitializationError(e.to_string()))?;

        let writer = index
            .writer(50_000_000) // 50MB buffer
            .map_err(|e| KeywordIndexError::InitializationError(e.to_string()))?;

        let reader = Self::build_reader(&index)?;

        Ok(Self {
            index,
            reader,
            writer: Some(writer),
            id_field,
            content_field,
            index_path,
        })
    }

    /// Open an existing index read-only.
    pub fn open(index_path: PathBuf) -> Result<Self, KeywordIndexError> {
        if !index_path.join("meta.json").exists() {
            return Err(KeywordIndexError::IndexNotFound(
                index_path.display().to_string(),
            ));
        }

        let index = Index::open_in_dir(&index_path)
            .map_err(|e| KeywordIndexError::InitializationError(e.to_string()))?;
        let schema = index.schema();

        let id_field = schema.get_field("id").map_err(|_| {
            KeywordIndexError::InitializationError("Missing 'id' field in schema".to_string())
        })?;
        let content_field = schema.get_field("content").map_err(|_| {
            KeywordIndexError::InitializationError("Missing 'content' field in schema".to_string())
        })?;

        let reader = Self::build_reader(&index)?;

        Ok(Self {
            index,
            reader,
            writer: None,
            id_field,
            content_field,
            index_path,
        })
    }

    fn build_reader(index: &Index) -> Result<IndexReader, KeywordIndexError> {
        index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .map_err(|e: TantivyError| KeywordIndexError::InitializationError(e.to_string()))
    }

    /// Index one document. Only valid on an index created in this process.
    pub fn insert(&mut self, id: &str, content: &str) -> Result<(), KeywordIndexError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| KeywordIndexError::InsertError("index opened read-only".to_string()))?;

        writer
            .add_document(doc!(
                self.id_field => id,
                self.content_field => content,
            ))
            .map_err(|e| KeywordIndexError::InsertError(e.to_string()))?;

        Ok(())
    }

    /// Commit all pending inserts and reload the reader.
    pub fn commit(&mut self) -> Result<(), KeywordIndexError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| KeywordIndexError::InsertError("index opened read-only".to_string()))?;

        writer
            .commit()
            .map_err(|e| KeywordIndexError::InsertError(e.to_string()))?;

        self.reader
            .reload()
            .map_err(|e| KeywordIndexError::SearchError(e.to_string()))?;

        Ok(())
    }

    /// Term search over chunk content. Returns (chunk id, BM25 score) pairs
    /// sorted by relevance.
    pub fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(String, f32)>, KeywordIndexError> {
        let searcher = self.reader.searcher();

        let query_parser = QueryParser::for_index(&self.index, vec![self.content_field]);
        // Questions are free text, not query syntax; parse leniently
        let (query, _errors) = query_parser.parse_query_lenient(query);

        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(limit))
            .map_err(|e| KeywordIndexError::SearchError(e.to_string()))?;

        let mut results = Vec::new();
        for (score, doc_address) in top_docs {
            let retrieved: tantivy::TantivyDocument = searcher
                .doc(doc_address)
                .map_err(|e| KeywordIndexError::SearchError(e.to_string()))?;

            let id = retrieved
                .get_first(self.id_field)
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    KeywordIndexError::SearchError("Missing or invalid id field".to_string())
                })?;

            results.push((id.to_string(), score));
        }

        Ok(results)
    }

    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }
}
