//! Enrichment pipeline: summarize, embed, store
//!
//! Fills `summary` and `embedding` for every chunk of one crawl.
//! Summarization fans out over a fixed-size worker pool pulling from a
//! shared queue; embedding runs afterwards in sequential batches; the
//! enriched snapshot is handed to the store as one atomic replace.
//! Cancellation is checked before every unit of work and before the store
//! write, so a cancelled crawl never persists anything.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::chunk::SchemaChunk;
use crate::embed::EmbeddingService;
use crate::error::{Result, SkemaError};
use crate::llm::GenerationService;
use crate::schema::{CrawlPhase, ProgressEvent};
use crate::store::VectorStore;

const SUMMARY_SYSTEM_PROMPT: &str = "You are a database documentation assistant. \
Summarize schema objects in one short paragraph of plain prose. Mention the \
object's purpose, its key columns or parameters, and any relationships. \
Do not use markdown.";

/// Enrichment tuning knobs.
#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    /// Width of the summarization worker pool
    pub concurrency: usize,
    /// Texts per embedding call
    pub batch_size: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            batch_size: 32,
        }
    }
}

/// Drives the two enrichment phases over a crawl's chunk list and persists
/// the result.
pub struct EnrichmentPipeline {
    generator: Arc<dyn GenerationService>,
    embedder: Arc<dyn EmbeddingService>,
    store: Arc<VectorStore>,
    config: EnrichmentConfig,
}

struct SummaryJob {
    index: usize,
    object_name: String,
    prompt: String,
}

impl EnrichmentPipeline {
    pub fn new(
        generator: Arc<dyn GenerationService>,
        embedder: Arc<dyn EmbeddingService>,
        store: Arc<VectorStore>,
        config: EnrichmentConfig,
    ) -> Self {
        Self {
            generator,
            embedder,
            store,
            config,
        }
    }

    /// Enrich `chunks` and atomically replace the source's collection.
    pub async fn run(
        &self,
        source_id: &str,
        mut chunks: Vec<SchemaChunk>,
        progress: &mpsc::Sender<ProgressEvent>,
        cancel: &CancelToken,
    ) -> Result<()> {
        if chunks.is_empty() {
            let _ = progress
                .send(ProgressEvent::new(source_id, CrawlPhase::Storing, 0, 1))
                .await;
            self.store.replace_all(source_id, &[]).await?;
            return Ok(());
        }

        info!("Enriching {} chunks for source '{}'", chunks.len(), source_id);

        cancel.check()?;
        self.summarize_all(source_id, &mut chunks, progress, cancel)
            .await?;

        cancel.check()?;
        self.embed_all(source_id, &mut chunks, progress, cancel)
            .await?;

        // Persistence only happens on a fully-enriched, non-cancelled crawl
        cancel.check()?;
        self.store.replace_all(source_id, &chunks).await?;
        let _ = progress
            .send(ProgressEvent::new(source_id, CrawlPhase::Storing, 1, 1))
            .await;

        Ok(())
    }

    async fn summarize_all(
        &self,
        source_id: &str,
        chunks: &mut [SchemaChunk],
        progress: &mpsc::Sender<ProgressEvent>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let total = chunks.len();
        let width = self.config.concurrency.min(total).max(1);
        debug!("Summarizing {} chunks with {} workers", total, width);

        let queue: Arc<StdMutex<VecDeque<SummaryJob>>> = Arc::new(StdMutex::new(
            chunks
                .iter()
                .enumerate()
                .map(|(index, chunk)| SummaryJob {
                    index,
                    object_name: chunk.qualified_name(),
                    prompt: summary_prompt(chunk),
                })
                .collect(),
        ));
        let failed = Arc::new(AtomicBool::new(false));
        let (result_tx, mut result_rx) =
            mpsc::channel::<Result<(usize, String, String)>>(total);

        let mut handles = Vec::with_capacity(width);
        for _ in 0..width {
            let generator = self.generator.clone();
            let queue = queue.clone();
            let failed = failed.clone();
            let cancel = cancel.clone();
            let result_tx = result_tx.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    // Checked before taking the next item: a cancel request
                    // stops the pool within one unit of work
                    if cancel.is_cancelled() || failed.load(Ordering::SeqCst) {
                        break;
                    }
                    let Some(job) = queue.lock().expect("queue poisoned").pop_front() else {
                        break;
                    };

                    match generator.generate(&job.prompt, SUMMARY_SYSTEM_PROMPT).await {
                        Ok(text) => {
                            if cancel.is_cancelled() {
                                break;
                            }
                            let item = (job.index, text.trim().to_string(), job.object_name);
                            if result_tx.send(Ok(item)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            failed.store(true, Ordering::SeqCst);
                            let _ = result_tx.send(Err(e)).await;
                            break;
                        }
                    }
                }
            }));
        }
        drop(result_tx);

        let mut completed = 0usize;
        let mut first_error: Option<SkemaError> = None;
        while let Some(item) = result_rx.recv().await {
            match item {
                Ok((index, summary, object_name)) => {
                    chunks[index].summary = summary;
                    completed += 1;
                    let _ = progress
                        .send(
                            ProgressEvent::new(
                                source_id,
                                CrawlPhase::Summarizing,
                                completed,
                                total,
                            )
                            .with_object(object_name),
                        )
                        .await;
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        for handle in handles {
            handle
                .await
                .map_err(|e| anyhow::anyhow!("summarization worker panicked: {}", e))?;
        }

        cancel.check()?;
        if let Some(error) = first_error {
            return Err(error);
        }
        Ok(())
    }

    async fn embed_all(
        &self,
        source_id: &str,
        chunks: &mut [SchemaChunk],
        progress: &mpsc::Sender<ProgressEvent>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let total = chunks.len();
        let batch_size = self.config.batch_size.max(1);
        debug!("Embedding {} chunks in batches of {}", total, batch_size);

        let mut offset = 0;
        while offset < total {
            cancel.check()?;
            let end = (offset + batch_size).min(total);

            let texts: Vec<String> = chunks[offset..end]
                .iter()
                .map(|c| c.embedding_text().to_string())
                .collect();
            let vectors = self.embedder.embed_batch(&texts).await?;

            if vectors.len() != texts.len() {
                return Err(SkemaError::MalformedResponse {
                    service: "embedding".to_string(),
                    detail: format!(
                        "batch count mismatch: expected {}, got {}",
                        texts.len(),
                        vectors.len()
                    ),
                });
            }

            // Positional assignment keeps chunk-to-vector order intact
            for (chunk, vector) in chunks[offset..end].iter_mut().zip(vectors) {
                chunk.embedding = vector;
            }

            let _ = progress
                .send(ProgressEvent::new(
                    source_id,
                    CrawlPhase::Embedding,
                    end,
                    total,
                ))
                .await;
            offset = end;
        }

        Ok(())
    }
}

fn summary_prompt(chunk: &SchemaChunk) -> String {
    format!(
        "Summarize this database {} for a search index.\n\nObject: {}\n\n{}",
        chunk.object_type.label().to_lowercase(),
        chunk.qualified_name(),
        chunk.content
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ObjectType;
    use chrono::Utc;

    #[test]
    fn test_summary_prompt_names_the_object() {
        let chunk = SchemaChunk {
            id: "c1".to_string(),
            source_id: "db1".to_string(),
            object_type: ObjectType::StoredProcedure,
            object_name: "GetOrderTotal".to_string(),
            schema_name: "dbo".to_string(),
            content: "Stored procedure dbo.GetOrderTotal\nParameters: none\n\nDefinition:\n"
                .to_string(),
            summary: String::new(),
            embedding: Vec::new(),
            indexed_at: Utc::now(),
        };

        let prompt = summary_prompt(&chunk);
        assert!(prompt.contains("stored procedure"));
        assert!(prompt.contains("dbo.GetOrderTotal"));
        assert!(prompt.contains(&chunk.content));
    }

    #[test]
    fn test_default_config() {
        let config = EnrichmentConfig::default();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.batch_size, 32);
    }
}
