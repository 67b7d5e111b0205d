//! Schema chunks and the chunk builder
//!
//! A chunk is one retrievable text unit representing a single schema object.
//! [`build_chunks`] is pure: for a fixed metadata input and crawl timestamp
//! it produces byte-identical `content` strings across runs. Summaries and
//! embeddings stay empty here; the enrichment pipeline fills them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::schema::{ColumnMeta, ParameterMeta, RoutineMeta, SchemaMetadata, TableMeta, ViewMeta};

/// Kind of schema object a chunk represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Table,
    View,
    StoredProcedure,
    Function,
}

impl ObjectType {
    /// Stable identifier used as the storage/type-filter value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Table => "table",
            ObjectType::View => "view",
            ObjectType::StoredProcedure => "stored_procedure",
            ObjectType::Function => "function",
        }
    }

    /// Human-facing label used in rendered content and prompts.
    pub fn label(&self) -> &'static str {
        match self {
            ObjectType::Table => "Table",
            ObjectType::View => "View",
            ObjectType::StoredProcedure => "Stored procedure",
            ObjectType::Function => "Function",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "table" => Some(ObjectType::Table),
            "view" => Some(ObjectType::View),
            "stored_procedure" => Some(ObjectType::StoredProcedure),
            "function" => Some(ObjectType::Function),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One retrievable unit of schema knowledge.
///
/// A fresh crawl fully replaces all chunks for a source; chunks are never
/// patched individually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaChunk {
    pub id: String,
    pub source_id: String,
    pub object_type: ObjectType,
    pub object_name: String,
    pub schema_name: String,
    /// Deterministic textual rendering of the object; summarization input
    /// and lexical-search corpus.
    pub content: String,
    /// Model-generated summary, empty until enrichment runs.
    pub summary: String,
    /// Embedding vector, empty until enrichment runs.
    pub embedding: Vec<f32>,
    pub indexed_at: DateTime<Utc>,
}

impl SchemaChunk {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.object_name)
    }

    /// Text handed to the embedding service: the summary once enrichment
    /// produced one, the raw rendering otherwise.
    pub fn embedding_text(&self) -> &str {
        if self.summary.is_empty() {
            &self.content
        } else {
            &self.summary
        }
    }
}

/// Build one chunk per schema object, in catalog order: tables, views,
/// stored procedures, functions.
pub fn build_chunks(
    source_id: &str,
    metadata: &SchemaMetadata,
    indexed_at: DateTime<Utc>,
) -> Vec<SchemaChunk> {
    let mut chunks = Vec::with_capacity(metadata.object_count());

    for table in &metadata.tables {
        chunks.push(make_chunk(
            source_id,
            ObjectType::Table,
            &table.schema,
            &table.name,
            render_table(table),
            indexed_at,
        ));
    }
    for view in &metadata.views {
        chunks.push(make_chunk(
            source_id,
            ObjectType::View,
            &view.schema,
            &view.name,
            render_view(view),
            indexed_at,
        ));
    }
    for proc in &metadata.procedures {
        chunks.push(make_chunk(
            source_id,
            ObjectType::StoredProcedure,
            &proc.schema,
            &proc.name,
            render_routine(ObjectType::StoredProcedure, proc),
            indexed_at,
        ));
    }
    for func in &metadata.functions {
        chunks.push(make_chunk(
            source_id,
            ObjectType::Function,
            &func.schema,
            &func.name,
            render_routine(ObjectType::Function, func),
            indexed_at,
        ));
    }

    chunks
}

fn make_chunk(
    source_id: &str,
    object_type: ObjectType,
    schema_name: &str,
    object_name: &str,
    content: String,
    indexed_at: DateTime<Utc>,
) -> SchemaChunk {
    SchemaChunk {
        id: Uuid::new_v4().to_string(),
        source_id: source_id.to_string(),
        object_type,
        object_name: object_name.to_string(),
        schema_name: schema_name.to_string(),
        content,
        summary: String::new(),
        embedding: Vec::new(),
        indexed_at,
    }
}

fn render_column(column: &ColumnMeta) -> String {
    let mut rendered = if column.nullable {
        format!("{} ({}, nullable)", column.name, column.data_type)
    } else {
        format!("{} ({})", column.name, column.data_type)
    };
    if column.primary_key {
        rendered.push_str(" PK");
    }
    if let Some(fk) = &column.foreign_key {
        rendered.push_str(&format!(" FK -> {}.{}", fk.table, fk.column));
    }
    rendered
}

fn render_columns(columns: &[ColumnMeta]) -> String {
    columns
        .iter()
        .map(render_column)
        .collect::<Vec<_>>()
        .join("; ")
}

fn render_table(table: &TableMeta) -> String {
    format!(
        "Table {}.{}\nColumns: {}",
        table.schema,
        table.name,
        render_columns(&table.columns)
    )
}

fn render_view(view: &ViewMeta) -> String {
    format!(
        "View {}.{}\nColumns: {}\n\nDefinition:\n{}",
        view.schema,
        view.name,
        render_columns(&view.columns),
        view.definition
    )
}

fn render_parameters(parameters: &[ParameterMeta]) -> String {
    if parameters.is_empty() {
        return "none".to_string();
    }
    parameters
        .iter()
        .map(|p| format!("{} ({}, {})", p.name, p.data_type, p.direction))
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_routine(object_type: ObjectType, routine: &RoutineMeta) -> String {
    format!(
        "{} {}.{}\nParameters: {}\n\nDefinition:\n{}",
        object_type.label(),
        routine.schema,
        routine.name,
        render_parameters(&routine.parameters),
        routine.definition
    )
}
