//! Shared mock model services for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use skema::cancel::CancelToken;
use skema::embed::EmbeddingService;
use skema::error::{Result, SkemaError};
use skema::llm::{ChatMessage, GenerationService, TokenStream};

/// Scriptable generation service: counts calls, can fail or trigger a
/// cancel token at a given call number, streams fixed chat tokens.
pub struct MockGenerator {
    pub generate_calls: AtomicUsize,
    pub last_chat_system: Mutex<String>,
    fail_at_call: Option<usize>,
    cancel_at_call: Mutex<Option<(usize, CancelToken)>>,
    chat_tokens: Vec<String>,
    context_length: usize,
}

impl MockGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            generate_calls: AtomicUsize::new(0),
            last_chat_system: Mutex::new(String::new()),
            fail_at_call: None,
            cancel_at_call: Mutex::new(None),
            chat_tokens: vec!["The ".to_string(), "answer".to_string(), ".".to_string()],
            context_length: 4096,
        })
    }

    pub fn failing_at(call: usize) -> Arc<Self> {
        let mut this = Self::unwrapped();
        this.fail_at_call = Some(call);
        Arc::new(this)
    }

    pub fn cancelling_at(call: usize, token: CancelToken) -> Arc<Self> {
        let this = Self::unwrapped();
        *this.cancel_at_call.lock().unwrap() = Some((call, token));
        Arc::new(this)
    }

    pub fn with_context_length(context_length: usize) -> Arc<Self> {
        let mut this = Self::unwrapped();
        this.context_length = context_length;
        Arc::new(this)
    }

    fn unwrapped() -> Self {
        Self {
            generate_calls: AtomicUsize::new(0),
            last_chat_system: Mutex::new(String::new()),
            fail_at_call: None,
            cancel_at_call: Mutex::new(None),
            chat_tokens: vec!["The ".to_string(), "answer".to_string(), ".".to_string()],
            context_length: 4096,
        }
    }

    pub fn call_count(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationService for MockGenerator {
    async fn generate(&self, prompt: &str, _system: &str) -> Result<String> {
        let call = self.generate_calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some((at, token)) = self.cancel_at_call.lock().unwrap().as_ref() {
            if call >= *at {
                token.cancel();
            }
        }

        if self.fail_at_call == Some(call) {
            return Err(SkemaError::Upstream {
                service: "mock".to_string(),
                detail: format!("scripted failure on call {}", call),
            });
        }

        let first_line = prompt.lines().next().unwrap_or_default();
        Ok(format!("summary {} of: {}", call, first_line))
    }

    fn chat_stream(&self, system: &str, _messages: Vec<ChatMessage>) -> TokenStream {
        *self.last_chat_system.lock().unwrap() = system.to_string();
        let tokens = self.chat_tokens.clone();
        Box::pin(futures::stream::iter(tokens.into_iter().map(Ok)))
    }

    async fn context_length(&self) -> Result<usize> {
        Ok(self.context_length)
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn has_model(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Deterministic embedding service: a text always maps to the same unit
/// vector, and batch calls are counted.
pub struct MockEmbedder {
    pub batch_calls: AtomicUsize,
    pub single_calls: AtomicUsize,
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Arc<Self> {
        Arc::new(Self {
            batch_calls: AtomicUsize::new(0),
            single_calls: AtomicUsize::new(0),
            dimension,
        })
    }

    pub fn vector_for(text: &str, dimension: usize) -> Vec<f32> {
        let seed: usize = text.bytes().map(|b| b as usize).sum();
        let mut vector: Vec<f32> = (0..dimension)
            .map(|i| ((seed + i * 7) % 13) as f32 + 1.0)
            .collect();
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        for value in &mut vector {
            *value /= norm;
        }
        vector
    }
}

#[async_trait]
impl EmbeddingService for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::vector_for(text, self.dimension))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| Self::vector_for(t, self.dimension))
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "mock-embed"
    }
}
