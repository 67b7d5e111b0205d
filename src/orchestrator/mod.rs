//! Per-turn retrieval orchestration and crawl coordination
//!
//! The read path of a chat turn: classify the question, optionally rewrite
//! a follow-up into a standalone query, retrieve context (full scan for
//! broad questions, hybrid search otherwise), build the system prompt, fit
//! the history through the context manager, and stream the generation,
//! reporting each step as a thinking-trace event. The write path wraps
//! crawl + chunk building + enrichment behind an active-crawl registry so
//! each source has at most one crawl and one cancel handle in flight.

use ahash::AHashMap;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::chunk::{build_chunks, SchemaChunk};
use crate::context::{estimate_tokens, ContextConfig, ContextManager};
use crate::embed::EmbeddingService;
use crate::enrich::{EnrichmentConfig, EnrichmentPipeline};
use crate::error::{Result, SkemaError};
use crate::llm::{ChatMessage, GenerationService};
use crate::schema::{ProgressEvent, SchemaCrawler};
use crate::store::{SearchOptions, VectorStore};

const ANSWER_SYSTEM_HEADER: &str = "You are a database schema assistant. Answer \
questions about the indexed schema using only the context below. Refer to \
objects by their qualified names. If the context does not contain the answer, \
say so plainly.";

const EMPTY_INDEX_NOTICE: &str = "The schema index returned no results for this \
question. The index may be empty or not yet built. Tell the user that instead \
of guessing an answer.";

const REWRITE_SYSTEM_PROMPT: &str = "You rewrite follow-up questions into \
standalone search queries. Resolve pronouns and references using the \
conversation. Reply with only the rewritten query, nothing else.";

/// Cap on `content` excerpts shown in the prompt when a chunk has no summary.
const EXCERPT_CHARS: usize = 300;

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Results per hybrid search
    pub top_k: usize,
    /// Chunk cap for broad (full-corpus) questions
    pub broad_limit: usize,
    /// Turns of history given to the query rewriter
    pub rewrite_window: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            top_k: 30,
            broad_limit: 500,
            rewrite_window: 6,
        }
    }
}

/// Pipeline step reported in the thinking trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingStep {
    Embedding,
    Searching,
    Context,
    Generating,
}

/// What one turn retrieved, for the thinking trace. Ephemeral, never stored.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalContext {
    pub chunks: Vec<SchemaChunk>,
    pub type_counts: BTreeMap<String, usize>,
    pub object_names: Vec<String>,
    pub search_ms: u64,
    pub estimated_tokens: usize,
}

impl RetrievalContext {
    fn from_chunks(chunks: Vec<SchemaChunk>, search_ms: u64, estimated_tokens: usize) -> Self {
        let mut type_counts = BTreeMap::new();
        let mut object_names = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            *type_counts
                .entry(chunk.object_type.as_str().to_string())
                .or_insert(0) += 1;
            object_names.push(chunk.qualified_name());
        }
        Self {
            chunks,
            type_counts,
            object_names,
            search_ms,
            estimated_tokens,
        }
    }
}

/// Events of one chat turn, drained by the caller.
#[derive(Debug)]
pub enum TurnEvent {
    Thinking {
        step: ThinkingStep,
        detail: String,
        elapsed_ms: u64,
    },
    Token(String),
    Done {
        summary: Option<String>,
        history_tail: Vec<ChatMessage>,
        retrieval: RetrievalContext,
    },
    Error(SkemaError),
}

/// One chat turn's input. Conversation state lives in the caller.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub source_id: String,
    pub message: String,
    pub history: Vec<ChatMessage>,
    pub carried_summary: Option<String>,
}

/// Composes store, model services, enrichment and context management.
pub struct Orchestrator {
    store: Arc<VectorStore>,
    generator: Arc<dyn GenerationService>,
    embedder: Arc<dyn EmbeddingService>,
    context: ContextManager,
    pipeline: EnrichmentPipeline,
    config: OrchestratorConfig,
    active_crawls: StdMutex<AHashMap<String, CancelToken>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<VectorStore>,
        generator: Arc<dyn GenerationService>,
        embedder: Arc<dyn EmbeddingService>,
        enrichment: EnrichmentConfig,
        context: ContextConfig,
        config: OrchestratorConfig,
    ) -> Self {
        let pipeline = EnrichmentPipeline::new(
            generator.clone(),
            embedder.clone(),
            store.clone(),
            enrichment,
        );
        let context = ContextManager::new(generator.clone(), context);

        Self {
            store,
            generator,
            embedder,
            context,
            pipeline,
            config,
            active_crawls: StdMutex::new(AHashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Crawl a source and rebuild its collection. At most one crawl per
    /// source may be in flight; the registry holds its cancel handle.
    pub async fn index_source(
        &self,
        source_id: &str,
        crawler: &dyn SchemaCrawler,
        progress: &mpsc::Sender<ProgressEvent>,
        cancel: CancelToken,
    ) -> Result<()> {
        {
            let mut active = self.active_crawls.lock().expect("registry poisoned");
            if active.contains_key(source_id) {
                return Err(SkemaError::CrawlInProgress {
                    source_id: source_id.to_string(),
                });
            }
            active.insert(source_id.to_string(), cancel.clone());
        }

        info!("Starting crawl for source '{}'", source_id);
        let result = self
            .crawl_and_enrich(source_id, crawler, progress, &cancel)
            .await;

        self.active_crawls
            .lock()
            .expect("registry poisoned")
            .remove(source_id);

        match &result {
            Ok(()) => info!("Crawl finished for source '{}'", source_id),
            Err(e) if e.is_cancelled() => info!("Crawl cancelled for source '{}'", source_id),
            Err(e) => warn!("Crawl failed for source '{}': {}", source_id, e),
        }
        result
    }

    async fn crawl_and_enrich(
        &self,
        source_id: &str,
        crawler: &dyn SchemaCrawler,
        progress: &mpsc::Sender<ProgressEvent>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let metadata = crawler.crawl(source_id, progress, cancel).await?;
        let chunks = build_chunks(source_id, &metadata, Utc::now());
        self.pipeline.run(source_id, chunks, progress, cancel).await
    }

    /// Cancel an in-flight crawl. Returns false if none is active.
    pub fn cancel_crawl(&self, source_id: &str) -> bool {
        let active = self.active_crawls.lock().expect("registry poisoned");
        match active.get(source_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run one chat turn, emitting thinking/token events and a terminal
    /// done or error event.
    pub async fn chat_turn(&self, request: ChatRequest, events: mpsc::Sender<TurnEvent>) {
        if let Err(e) = self.run_turn(&request, &events).await {
            let _ = events.send(TurnEvent::Error(e)).await;
        }
    }

    async fn run_turn(
        &self,
        request: &ChatRequest,
        events: &mpsc::Sender<TurnEvent>,
    ) -> Result<()> {
        let broad = is_broad_question(&request.message);

        let (chunks, search_ms) = if broad {
            debug!("Broad question, scanning full index");
            let started = Instant::now();
            let chunks = self
                .store
                .get_all(&request.source_id, self.config.broad_limit)
                .await?;
            let search_ms = started.elapsed().as_millis() as u64;
            let _ = events
                .send(TurnEvent::Thinking {
                    step: ThinkingStep::Searching,
                    detail: format!("broad question, scanned {} chunks", chunks.len()),
                    elapsed_ms: search_ms,
                })
                .await;
            (chunks, search_ms)
        } else {
            let query = self.standalone_query(request).await;

            let started = Instant::now();
            let query_vector = self.embedder.embed(&query).await?;
            let _ = events
                .send(TurnEvent::Thinking {
                    step: ThinkingStep::Embedding,
                    detail: format!("embedded query ({} dims)", query_vector.len()),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
                .await;

            let started = Instant::now();
            let options =
                SearchOptions::new(self.config.top_k).with_query_text(query.clone());
            let scored = self
                .store
                .search(&request.source_id, &query_vector, &options)
                .await?;
            let search_ms = started.elapsed().as_millis() as u64;
            let _ = events
                .send(TurnEvent::Thinking {
                    step: ThinkingStep::Searching,
                    detail: format!("hybrid search returned {} chunks", scored.len()),
                    elapsed_ms: search_ms,
                })
                .await;

            let chunks = scored.into_iter().map(|s| s.chunk).collect();
            (chunks, search_ms)
        };

        let system_prompt = build_system_prompt(&chunks);
        let retrieval =
            RetrievalContext::from_chunks(chunks, search_ms, estimate_tokens(&system_prompt));

        let started = Instant::now();
        let budget = self.generator.context_length().await?;
        let prepared = self
            .context
            .prepare(
                &system_prompt,
                &request.history,
                request.carried_summary.as_deref(),
                &request.message,
                budget,
            )
            .await?;
        let _ = events
            .send(TurnEvent::Thinking {
                step: ThinkingStep::Context,
                detail: format!(
                    "{} messages in context, budget {} tokens",
                    prepared.api_history.len() + 1,
                    budget
                ),
                elapsed_ms: started.elapsed().as_millis() as u64,
            })
            .await;

        let mut messages = prepared.api_history.clone();
        messages.push(ChatMessage::user(request.message.clone()));

        let started = Instant::now();
        let _ = events
            .send(TurnEvent::Thinking {
                step: ThinkingStep::Generating,
                detail: "streaming answer".to_string(),
                elapsed_ms: 0,
            })
            .await;

        let mut stream = self.generator.chat_stream(&system_prompt, messages);
        while let Some(item) = stream.next().await {
            let token = item?;
            let _ = events.send(TurnEvent::Token(token)).await;
        }
        debug!(
            "Generation finished in {} ms",
            started.elapsed().as_millis()
        );

        let _ = events
            .send(TurnEvent::Done {
                summary: prepared.summary,
                history_tail: prepared.history_tail,
                retrieval,
            })
            .await;

        Ok(())
    }

    /// Rewrite a follow-up into a standalone query. Rewrite failures never
    /// block the turn; the raw message is used instead.
    async fn standalone_query(&self, request: &ChatRequest) -> String {
        if request.history.is_empty() {
            return request.message.clone();
        }

        let window_start = request
            .history
            .len()
            .saturating_sub(self.config.rewrite_window);
        let transcript = request.history[window_start..]
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Conversation:\n{}\n\nFollow-up question: {}\n\nStandalone search query:",
            transcript, request.message
        );

        match self.generator.generate(&prompt, REWRITE_SYSTEM_PROMPT).await {
            Ok(rewritten) => {
                let rewritten = rewritten.trim().trim_matches('"').trim();
                if rewritten.is_empty() {
                    request.message.clone()
                } else {
                    debug!("Rewrote question to: {}", rewritten);
                    rewritten.to_string()
                }
            }
            Err(e) => {
                warn!("Query rewrite failed, using raw message: {}", e);
                request.message.clone()
            }
        }
    }
}

/// Does the question ask to list/count whole object kinds? Broad questions
/// bypass similarity search and read the entire corpus.
pub fn is_broad_question(question: &str) -> bool {
    static INTENT: OnceLock<regex::Regex> = OnceLock::new();
    static NOUN: OnceLock<regex::Regex> = OnceLock::new();

    let intent = INTENT.get_or_init(|| {
        regex::Regex::new(r"\b(list|show|count|enumerate|how many|what are|give me|all)\b")
            .expect("intent regex")
    });
    let noun = NOUN.get_or_init(|| {
        regex::Regex::new(r"\b(tables?|views?|stored procedures?|procedures?|procs?|functions?|objects?)\b")
            .expect("noun regex")
    });

    let question = question.to_lowercase();
    intent.is_match(&question) && noun.is_match(&question)
}

/// Render the retrieved chunks into the generation system prompt.
pub fn build_system_prompt(chunks: &[SchemaChunk]) -> String {
    if chunks.is_empty() {
        return format!("{}\n\n{}", ANSWER_SYSTEM_HEADER, EMPTY_INDEX_NOTICE);
    }

    let mut prompt = String::from(ANSWER_SYSTEM_HEADER);
    prompt.push_str("\n\nSchema context:\n");
    for chunk in chunks {
        prompt.push_str(&format!(
            "\n[{}] {}\n{}\n",
            chunk.object_type,
            chunk.qualified_name(),
            describe_chunk(chunk)
        ));
    }
    prompt
}

fn describe_chunk(chunk: &SchemaChunk) -> String {
    if !chunk.summary.is_empty() {
        return chunk.summary.clone();
    }
    let excerpt: String = chunk.content.chars().take(EXCERPT_CHARS).collect();
    if chunk.content.chars().count() > EXCERPT_CHARS {
        format!("{}...", excerpt)
    } else {
        excerpt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ObjectType;

    fn chunk_with(summary: &str, content: &str) -> SchemaChunk {
        SchemaChunk {
            id: "c1".to_string(),
            source_id: "db1".to_string(),
            object_type: ObjectType::Table,
            object_name: "Orders".to_string(),
            schema_name: "dbo".to_string(),
            content: content.to_string(),
            summary: summary.to_string(),
            embedding: Vec::new(),
            indexed_at: Utc::now(),
        }
    }

    #[test]
    fn test_broad_question_classification() {
        assert!(is_broad_question("How many stored procedures are there?"));
        assert!(is_broad_question("list all tables"));
        assert!(is_broad_question("Show me the views in this database"));
        assert!(is_broad_question("What are the functions?"));

        assert!(!is_broad_question("what does GetOrderTotal do?"));
        assert!(!is_broad_question("which table stores customer emails?"));
        assert!(!is_broad_question("explain the Orders table"));
    }

    #[test]
    fn test_system_prompt_uses_summary() {
        let chunk = chunk_with("Stores customer orders.", "Table dbo.Orders\nColumns: ...");
        let prompt = build_system_prompt(std::slice::from_ref(&chunk));

        assert!(prompt.contains("[table] dbo.Orders"));
        assert!(prompt.contains("Stores customer orders."));
        assert!(!prompt.contains("Columns: ..."));
    }

    #[test]
    fn test_system_prompt_excerpts_unsummarized_content() {
        let long_content = "x".repeat(400);
        let chunk = chunk_with("", &long_content);
        let prompt = build_system_prompt(std::slice::from_ref(&chunk));

        assert!(prompt.contains(&format!("{}...", "x".repeat(300))));
        assert!(!prompt.contains(&"x".repeat(301)));
    }

    #[test]
    fn test_system_prompt_flags_empty_index() {
        let prompt = build_system_prompt(&[]);
        assert!(prompt.contains("may be empty"));
    }

    #[test]
    fn test_retrieval_context_counts_types() {
        let mut proc = chunk_with("", "body");
        proc.object_type = ObjectType::StoredProcedure;
        proc.object_name = "GetOrderTotal".to_string();

        let ctx = RetrievalContext::from_chunks(
            vec![chunk_with("", "body"), chunk_with("", "body"), proc],
            12,
            80,
        );

        assert_eq!(ctx.type_counts.get("table"), Some(&2));
        assert_eq!(ctx.type_counts.get("stored_procedure"), Some(&1));
        assert_eq!(ctx.object_names.len(), 3);
        assert!(ctx.object_names.contains(&"dbo.GetOrderTotal".to_string()));
        assert_eq!(ctx.search_ms, 12);
    }
}
