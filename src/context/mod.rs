//! Context window management with progressive summarization
//!
//! Keeps a chat request inside the model's token budget. Under 90% of the
//! budget history passes through verbatim; between 90% and 100% older turns
//! are folded into a running summary that preserves referenced schema
//! objects; at or over budget the turn fails fast with a distinct error so
//! the caller can ask the user to reset the conversation.

use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, SkemaError};
use crate::llm::{ChatMessage, GenerationService};

const HISTORY_SYSTEM_PROMPT: &str = "You compress chat transcripts about a database \
schema. Write a dense plain-text summary. You must keep the exact names of every \
schema object mentioned (tables, views, stored procedures, functions) and what was \
said about them, so that later references like 'it' or 'that procedure' remain \
resolvable.";

const SUMMARY_MESSAGE_PREFIX: &str = "Summary of the conversation so far:";

/// Separator between an existing summary and a newly summarized span.
const SUMMARY_MERGE_SEPARATOR: &str = "\n---\n";

/// Context manager tuning knobs.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Fraction of the budget above which summarization kicks in
    pub soft_limit_ratio: f32,
    /// Turns kept verbatim on the first summarization
    pub first_pass_keep: usize,
    /// Turns kept verbatim on subsequent summarizations
    pub later_pass_keep: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            soft_limit_ratio: 0.9,
            first_pass_keep: 10,
            later_pass_keep: 5,
        }
    }
}

/// The history to send, plus what the caller should persist for next turn.
#[derive(Debug, Clone)]
pub struct PreparedContext {
    /// Messages to send to the model (summary message first, if any)
    pub api_history: Vec<ChatMessage>,
    /// Running summary to carry forward, if one exists after this turn
    pub summary: Option<String>,
    /// Turns retained verbatim
    pub history_tail: Vec<ChatMessage>,
}

/// Cheap token proxy: one token per four characters, rounded up. Not a real
/// tokenizer.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Decides, per turn, whether history fits verbatim or must be compressed.
pub struct ContextManager {
    generator: Arc<dyn GenerationService>,
    config: ContextConfig,
}

impl ContextManager {
    pub fn new(generator: Arc<dyn GenerationService>, config: ContextConfig) -> Self {
        Self { generator, config }
    }

    /// Fit `history` plus the new message into `token_budget`.
    pub async fn prepare(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        carried_summary: Option<&str>,
        new_message: &str,
        token_budget: usize,
    ) -> Result<PreparedContext> {
        let mut estimated = estimate_tokens(system_prompt) + estimate_tokens(new_message);
        if let Some(summary) = carried_summary {
            estimated += estimate_tokens(&summary_message(summary).content);
        }
        estimated += history
            .iter()
            .map(|m| estimate_tokens(&m.content))
            .sum::<usize>();

        if estimated >= token_budget {
            return Err(SkemaError::BudgetExceeded {
                estimated,
                budget: token_budget,
            });
        }

        let soft_limit = token_budget as f32 * self.config.soft_limit_ratio;
        if (estimated as f32) < soft_limit {
            return Ok(passthrough(history, carried_summary));
        }

        debug!(
            "History at {}/{} estimated tokens, summarizing older turns",
            estimated, token_budget
        );

        let keep = match carried_summary {
            None => self.config.first_pass_keep,
            Some(_) => self.config.later_pass_keep,
        };

        if history.len() <= keep {
            // Nothing precedes the retained tail
            return Ok(passthrough(history, carried_summary));
        }

        let (span, tail) = history.split_at(history.len() - keep);
        let fresh = self
            .generator
            .generate(&span_prompt(span), HISTORY_SYSTEM_PROMPT)
            .await?;
        let fresh = fresh.trim().to_string();

        let summary = match carried_summary {
            Some(existing) => format!("{}{}{}", existing, SUMMARY_MERGE_SEPARATOR, fresh),
            None => fresh,
        };

        let mut api_history = vec![summary_message(&summary)];
        api_history.extend_from_slice(tail);

        Ok(PreparedContext {
            api_history,
            summary: Some(summary),
            history_tail: tail.to_vec(),
        })
    }
}

fn passthrough(history: &[ChatMessage], carried_summary: Option<&str>) -> PreparedContext {
    let mut api_history = Vec::with_capacity(history.len() + 1);
    if let Some(summary) = carried_summary {
        api_history.push(summary_message(summary));
    }
    api_history.extend_from_slice(history);

    PreparedContext {
        api_history,
        summary: carried_summary.map(|s| s.to_string()),
        history_tail: history.to_vec(),
    }
}

fn summary_message(summary: &str) -> ChatMessage {
    ChatMessage::user(format!("{}\n{}", SUMMARY_MESSAGE_PREFIX, summary))
}

fn span_prompt(span: &[ChatMessage]) -> String {
    let transcript = span
        .iter()
        .map(|m| {
            let speaker = match m.role {
                crate::llm::ChatRole::User => "User",
                crate::llm::ChatRole::Assistant => "Assistant",
            };
            format!("{}: {}", speaker, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!("Summarize this conversation span:\n\n{}", transcript)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingGenerator {
        calls: AtomicUsize,
        last_prompt: Mutex<String>,
    }

    impl RecordingGenerator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(String::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationService for RecordingGenerator {
        async fn generate(&self, prompt: &str, _system: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = prompt.to_string();
            Ok("FRESH-SUMMARY".to_string())
        }

        fn chat_stream(
            &self,
            _system: &str,
            _messages: Vec<ChatMessage>,
        ) -> crate::llm::TokenStream {
            Box::pin(futures::stream::empty())
        }

        async fn context_length(&self) -> Result<usize> {
            Ok(4096)
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn has_model(&self) -> Result<bool> {
            Ok(true)
        }
    }

    fn manager(generator: Arc<RecordingGenerator>) -> ContextManager {
        ContextManager::new(generator, ContextConfig::default())
    }

    fn message_of_tokens(role_user: bool, tokens: usize) -> ChatMessage {
        let content = "x".repeat(tokens * 4);
        if role_user {
            ChatMessage::user(content)
        } else {
            ChatMessage::assistant(content)
        }
    }

    fn history_of(turns: usize, tokens_each: usize) -> Vec<ChatMessage> {
        (0..turns)
            .map(|i| message_of_tokens(i % 2 == 0, tokens_each))
            .collect()
    }

    #[test]
    fn test_token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[tokio::test]
    async fn test_under_soft_limit_passes_through() {
        let generator = RecordingGenerator::new();
        let mgr = manager(generator.clone());

        // 100 + 12 * 50 + 100 = 800 of 1000 tokens (80%)
        let system = "s".repeat(400);
        let history = history_of(12, 50);
        let new_message = "n".repeat(400);

        let prepared = mgr
            .prepare(&system, &history, None, &new_message, 1000)
            .await
            .unwrap();

        assert_eq!(prepared.api_history.len(), 12);
        assert_eq!(prepared.history_tail.len(), 12);
        assert!(prepared.summary.is_none());
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_first_summarization_keeps_last_ten() {
        let generator = RecordingGenerator::new();
        let mgr = manager(generator.clone());

        // 100 + 12 * 66 + 58 = 950 of 1000 tokens (95%)
        let system = "s".repeat(400);
        let history = history_of(12, 66);
        let new_message = "n".repeat(232);

        let prepared = mgr
            .prepare(&system, &history, None, &new_message, 1000)
            .await
            .unwrap();

        // Exactly the first 2 turns are summarized, last 10 kept verbatim
        assert_eq!(generator.call_count(), 1);
        assert_eq!(prepared.history_tail.len(), 10);
        assert_eq!(prepared.history_tail, history[2..].to_vec());
        assert_eq!(prepared.api_history.len(), 11);
        assert!(prepared.api_history[0].content.contains("FRESH-SUMMARY"));
        assert_eq!(prepared.summary.as_deref(), Some("FRESH-SUMMARY"));
    }

    #[tokio::test]
    async fn test_over_budget_fails_without_generating() {
        let generator = RecordingGenerator::new();
        let mgr = manager(generator.clone());

        // 100 + 12 * 71 + 58 = 1010 of 1000 tokens (101%)
        let system = "s".repeat(400);
        let history = history_of(12, 71);
        let new_message = "n".repeat(232);

        let err = mgr
            .prepare(&system, &history, None, &new_message, 1000)
            .await
            .unwrap_err();

        assert!(matches!(err, SkemaError::BudgetExceeded { .. }));
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_subsequent_summarization_merges_and_keeps_five() {
        let generator = RecordingGenerator::new();
        let mgr = manager(generator.clone());

        // Carried summary plus history lands in the 90-100% band:
        // 100 + ceil(55/4) + 8 * 104 + 4 = 950 of 1000
        let system = "s".repeat(400);
        let carried = "x".repeat(55 - SUMMARY_MESSAGE_PREFIX.chars().count() - 1);
        let history = history_of(8, 104);
        let new_message = "n".repeat(16);

        let prepared = mgr
            .prepare(&system, &history, Some(&carried), &new_message, 1000)
            .await
            .unwrap();

        assert_eq!(generator.call_count(), 1);
        assert_eq!(prepared.history_tail.len(), 5);
        assert_eq!(prepared.history_tail, history[3..].to_vec());

        let summary = prepared.summary.unwrap();
        assert!(summary.starts_with(&carried));
        assert!(summary.ends_with("FRESH-SUMMARY"));
    }

    #[tokio::test]
    async fn test_nothing_to_summarize_passes_through() {
        let generator = RecordingGenerator::new();
        let mgr = manager(generator.clone());

        // In the band, but only 4 turns exist (fewer than the retained tail)
        let system = "s".repeat(400);
        let history = history_of(4, 200);
        let new_message = "n".repeat(200);

        let prepared = mgr
            .prepare(&system, &history, None, &new_message, 1000)
            .await
            .unwrap();

        assert_eq!(generator.call_count(), 0);
        assert_eq!(prepared.api_history.len(), 4);
        assert!(prepared.summary.is_none());
    }

    #[tokio::test]
    async fn test_carried_summary_leads_api_history() {
        let generator = RecordingGenerator::new();
        let mgr = manager(generator.clone());

        let history = history_of(2, 10);
        let prepared = mgr
            .prepare("sys", &history, Some("earlier context"), "hello", 1000)
            .await
            .unwrap();

        assert_eq!(prepared.api_history.len(), 3);
        assert!(prepared.api_history[0]
            .content
            .starts_with(SUMMARY_MESSAGE_PREFIX));
        assert!(prepared.api_history[0].content.contains("earlier context"));
        assert_eq!(prepared.summary.as_deref(), Some("earlier context"));
    }

    #[tokio::test]
    async fn test_summarization_prompt_covers_only_the_span() {
        let generator = RecordingGenerator::new();
        let mgr = manager(generator.clone());

        let system = "s".repeat(400);
        let mut history = history_of(12, 66);
        history[0].content = format!("FIRST {}", "x".repeat(258));
        history[11].content = format!("LAST {}", "x".repeat(259));
        let new_message = "n".repeat(232);

        mgr.prepare(&system, &history, None, &new_message, 1000)
            .await
            .unwrap();

        let prompt = generator.last_prompt.lock().unwrap().clone();
        assert!(prompt.contains("FIRST"));
        assert!(!prompt.contains("LAST"));
    }
}
