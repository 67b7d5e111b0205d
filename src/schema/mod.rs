//! Crawled schema metadata and the crawler contract
//!
//! Database-specific catalog extraction lives outside this crate; it is
//! consumed through the [`SchemaCrawler`] trait as a single crawl operation
//! that yields [`SchemaMetadata`] and reports [`ProgressEvent`]s. The
//! in-tree [`JsonFileCrawler`] replays the same phase protocol from a JSON
//! snapshot so the pipeline can be driven from the CLI and from tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::error::{Result, SkemaError};

/// Everything a crawl extracted from one database.
///
/// Missing fields deserialize as empty lists; the chunk builder treats
/// malformed input the same way.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaMetadata {
    #[serde(default)]
    pub tables: Vec<TableMeta>,
    #[serde(default)]
    pub views: Vec<ViewMeta>,
    #[serde(default)]
    pub procedures: Vec<RoutineMeta>,
    #[serde(default)]
    pub functions: Vec<RoutineMeta>,
}

impl SchemaMetadata {
    /// Total number of schema objects across all kinds.
    pub fn object_count(&self) -> usize {
        self.tables.len() + self.views.len() + self.procedures.len() + self.functions.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub schema: String,
    pub name: String,
    #[serde(default)]
    pub columns: Vec<ColumnMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewMeta {
    pub schema: String,
    pub name: String,
    #[serde(default)]
    pub columns: Vec<ColumnMeta>,
    #[serde(default)]
    pub definition: String,
}

/// A stored procedure or function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutineMeta {
    pub schema: String,
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<ParameterMeta>,
    #[serde(default)]
    pub definition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub foreign_key: Option<ForeignKeyRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterMeta {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_direction")]
    pub direction: String,
}

fn default_direction() -> String {
    "IN".to_string()
}

/// Phases of one crawl-and-index run, in the order they occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlPhase {
    Connecting,
    CrawlingTables,
    CrawlingViews,
    CrawlingProcedures,
    CrawlingFunctions,
    Summarizing,
    Embedding,
    Storing,
}

impl fmt::Display for CrawlPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CrawlPhase::Connecting => "connecting",
            CrawlPhase::CrawlingTables => "crawling tables",
            CrawlPhase::CrawlingViews => "crawling views",
            CrawlPhase::CrawlingProcedures => "crawling procedures",
            CrawlPhase::CrawlingFunctions => "crawling functions",
            CrawlPhase::Summarizing => "summarizing",
            CrawlPhase::Embedding => "embedding",
            CrawlPhase::Storing => "storing",
        };
        write!(f, "{}", label)
    }
}

/// One progress report from the crawl/enrichment pipeline.
///
/// Within a phase `current` is monotonically non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub source_id: String,
    pub phase: CrawlPhase,
    pub current: usize,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_object: Option<String>,
}

impl ProgressEvent {
    pub fn new(source_id: &str, phase: CrawlPhase, current: usize, total: usize) -> Self {
        Self {
            source_id: source_id.to_string(),
            phase,
            current,
            total,
            current_object: None,
        }
    }

    pub fn with_object(mut self, name: impl Into<String>) -> Self {
        self.current_object = Some(name.into());
        self
    }
}

/// Contract for schema extraction backends.
///
/// Implementations must emit `connecting` followed by the four `crawling_*`
/// phases in order, and must answer a cancel request with
/// [`SkemaError::Cancelled`] rather than a generic failure.
#[async_trait]
pub trait SchemaCrawler: Send + Sync {
    async fn crawl(
        &self,
        source_id: &str,
        progress: &mpsc::Sender<ProgressEvent>,
        cancel: &CancelToken,
    ) -> Result<SchemaMetadata>;
}

/// Crawler that replays a previously exported schema snapshot from JSON.
pub struct JsonFileCrawler {
    path: PathBuf,
}

impl JsonFileCrawler {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn report_kind(
        source_id: &str,
        phase: CrawlPhase,
        names: Vec<String>,
        progress: &mpsc::Sender<ProgressEvent>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let total = names.len();
        for (i, name) in names.into_iter().enumerate() {
            cancel.check()?;
            let event = ProgressEvent::new(source_id, phase, i + 1, total).with_object(name);
            let _ = progress.send(event).await;
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaCrawler for JsonFileCrawler {
    async fn crawl(
        &self,
        source_id: &str,
        progress: &mpsc::Sender<ProgressEvent>,
        cancel: &CancelToken,
    ) -> Result<SchemaMetadata> {
        cancel.check()?;
        let _ = progress
            .send(ProgressEvent::new(source_id, CrawlPhase::Connecting, 1, 1))
            .await;

        let content = std::fs::read_to_string(&self.path).map_err(|e| SkemaError::Io {
            source: e,
            context: format!("Failed to read schema snapshot: {}", self.path.display()),
        })?;
        let metadata: SchemaMetadata =
            serde_json::from_str(&content).map_err(|e| SkemaError::Json {
                source: e,
                context: format!("Failed to parse schema snapshot: {}", self.path.display()),
            })?;

        let qualified = |schema: &str, name: &str| format!("{}.{}", schema, name);

        Self::report_kind(
            source_id,
            CrawlPhase::CrawlingTables,
            metadata
                .tables
                .iter()
                .map(|t| qualified(&t.schema, &t.name))
                .collect(),
            progress,
            cancel,
        )
        .await?;
        Self::report_kind(
            source_id,
            CrawlPhase::CrawlingViews,
            metadata
                .views
                .iter()
                .map(|v| qualified(&v.schema, &v.name))
                .collect(),
            progress,
            cancel,
        )
        .await?;
        Self::report_kind(
            source_id,
            CrawlPhase::CrawlingProcedures,
            metadata
                .procedures
                .iter()
                .map(|p| qualified(&p.schema, &p.name))
                .collect(),
            progress,
            cancel,
        )
        .await?;
        Self::report_kind(
            source_id,
            CrawlPhase::CrawlingFunctions,
            metadata
                .functions
                .iter()
                .map(|f| qualified(&f.schema, &f.name))
                .collect(),
            progress,
            cancel,
        )
        .await?;

        Ok(metadata)
    }
}
