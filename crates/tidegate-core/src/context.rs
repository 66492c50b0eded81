//! Context assembly under a token budget.
//!
//! History that does not fit the budget is compressed with a sliding
//! window over the most recent turns, optionally prefixed by a one-entry
//! summary of what was dropped.

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::message::{ChatRole, ChatTurn};

/// Default token budget for one generation.
pub const DEFAULT_CONTEXT_BUDGET: usize = 4000;

/// How many turns must be dropped before a summary entry is synthesized.
const SUMMARY_THRESHOLD: usize = 4;

/// Rough token estimate: one token per four characters.
///
/// This is a deliberate approximation, not a tokenizer. It undercounts for
/// dense non-ASCII text; compression behavior depends on it, so it must not
/// be swapped for a real tokenizer without revisiting the budget tests.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Produces a short summary of dropped turns.
///
/// Implementations may call back into the gateway; failures are tolerated
/// by the builder, which simply omits the summary entry.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, turns: &[ChatTurn]) -> Result<String, GatewayError>;
}

/// Builds the bounded message list handed to a backend.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    budget: usize,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            budget: DEFAULT_CONTEXT_BUDGET,
        }
    }
}

impl ContextBuilder {
    pub fn new(budget: usize) -> Self {
        Self { budget }
    }

    /// Assemble the context window for one generation.
    ///
    /// When the system prompt plus all turns fit the budget, the output is
    /// the input unchanged (prefixed by the system entry, if any). On
    /// overflow the most recent turns that fit are kept in chronological
    /// order; if more than four turns were dropped and a summarizer is
    /// available, one synthetic system entry summarizing them is inserted
    /// after the original system entry. Summarization failure is logged
    /// and never fails the build.
    pub async fn build(
        &self,
        turns: &[ChatTurn],
        system_prompt: Option<&str>,
        summarizer: Option<&dyn Summarizer>,
    ) -> Vec<ChatTurn> {
        let system_entry = system_prompt.map(ChatTurn::system);
        let system_tokens = system_entry
            .as_ref()
            .map(|t| estimate_tokens(&t.content))
            .unwrap_or(0);

        let total: usize = system_tokens
            + turns
                .iter()
                .map(|t| estimate_tokens(&t.content))
                .sum::<usize>();

        if total <= self.budget {
            let mut context = Vec::with_capacity(turns.len() + 1);
            context.extend(system_entry);
            context.extend_from_slice(turns);
            return context;
        }

        self.compress(turns, system_entry, system_tokens, summarizer)
            .await
    }

    async fn compress(
        &self,
        turns: &[ChatTurn],
        system_entry: Option<ChatTurn>,
        system_tokens: usize,
        summarizer: Option<&dyn Summarizer>,
    ) -> Vec<ChatTurn> {
        // The system prompt is counted up front but never dropped, even
        // when it alone exceeds the budget. Soft budget, no truncation of
        // any single entry.
        let mut tokens_used = system_tokens;
        let mut kept = 0usize;

        for (i, turn) in turns.iter().rev().enumerate() {
            let turn_tokens = estimate_tokens(&turn.content);
            if tokens_used + turn_tokens > self.budget {
                // The newest turn is what the caller is asking about; it
                // goes in whole even when it alone overflows.
                if i == 0 {
                    tokens_used += turn_tokens;
                    kept = 1;
                }
                break;
            }
            tokens_used += turn_tokens;
            kept = i + 1;
        }

        let excluded = turns.len() - kept;
        tracing::debug!(
            excluded,
            kept,
            tokens_used,
            budget = self.budget,
            "compressed context window"
        );

        let mut context = Vec::with_capacity(kept + 2);
        context.extend(system_entry);

        if excluded > SUMMARY_THRESHOLD {
            if let Some(summarizer) = summarizer {
                match summarizer.summarize(&turns[..excluded]).await {
                    Ok(summary) => context.push(ChatTurn::system(format!(
                        "Previous conversation summary: {summary}"
                    ))),
                    Err(e) => {
                        tracing::warn!(error = %e, "summarization failed, omitting summary entry");
                    }
                }
            }
        }

        context.extend_from_slice(&turns[turns.len() - kept..]);
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSummarizer;

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, _turns: &[ChatTurn]) -> Result<String, GatewayError> {
            Ok("earlier discussion about tides".to_string())
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _turns: &[ChatTurn]) -> Result<String, GatewayError> {
            Err(GatewayError::NoEndpoints)
        }
    }

    fn turn_of_tokens(role: ChatRole, tokens: usize) -> ChatTurn {
        ChatTurn::new(role, "x".repeat(tokens * 4))
    }

    #[test]
    fn test_estimate_tokens_integer_division() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(4000)), 1000);
        // Counted per character, not per byte.
        assert_eq!(estimate_tokens("日本語あ"), 1);
    }

    #[tokio::test]
    async fn test_under_budget_is_identity() {
        let turns = vec![
            ChatTurn::user("hello"),
            ChatTurn::assistant("hi"),
            ChatTurn::user("how are you"),
        ];
        let builder = ContextBuilder::new(4000);
        let context = builder.build(&turns, Some("be terse"), None).await;

        assert_eq!(context.len(), 4);
        assert_eq!(context[0].role, ChatRole::System);
        assert_eq!(context[0].content, "be terse");
        assert_eq!(&context[1..], &turns[..]);
    }

    #[tokio::test]
    async fn test_no_system_prompt_no_entry() {
        let turns = vec![ChatTurn::user("hello")];
        let context = ContextBuilder::new(4000).build(&turns, None, None).await;
        assert_eq!(context, turns);
    }

    #[tokio::test]
    async fn test_overflow_keeps_longest_trailing_run() {
        // 10 turns of 100 tokens each against a 350-token budget: the last
        // three fit, the fourth-from-last would overflow.
        let turns: Vec<_> = (0..10).map(|_| turn_of_tokens(ChatRole::User, 100)).collect();
        let builder = ContextBuilder::new(350);
        let context = builder.build(&turns, None, None).await;

        assert_eq!(context.len(), 3);
        assert_eq!(&context[..], &turns[7..]);
    }

    #[tokio::test]
    async fn test_few_exclusions_produce_no_summary() {
        // 6 turns of 100 tokens, budget 200: keeps 2, excludes 4 — at the
        // threshold, so no summary even with a summarizer available.
        let turns: Vec<_> = (0..6).map(|_| turn_of_tokens(ChatRole::User, 100)).collect();
        let builder = ContextBuilder::new(200);
        let context = builder
            .build(&turns, None, Some(&FixedSummarizer))
            .await;

        assert_eq!(context.len(), 2);
        assert!(context.iter().all(|t| t.role == ChatRole::User));
    }

    #[tokio::test]
    async fn test_many_exclusions_produce_one_summary() {
        // 8 turns of 100 tokens, budget 300: keeps 3, excludes 5.
        let turns: Vec<_> = (0..8).map(|_| turn_of_tokens(ChatRole::User, 100)).collect();
        let builder = ContextBuilder::new(300);
        let context = builder
            .build(&turns, Some("sys"), Some(&FixedSummarizer))
            .await;

        assert_eq!(context[0].content, "sys");
        assert_eq!(
            context[1].content,
            "Previous conversation summary: earlier discussion about tides"
        );
        assert_eq!(context[1].role, ChatRole::System);
        assert_eq!(&context[2..], &turns[5..]);
    }

    #[tokio::test]
    async fn test_summarizer_failure_omits_entry() {
        let turns: Vec<_> = (0..8).map(|_| turn_of_tokens(ChatRole::User, 100)).collect();
        let builder = ContextBuilder::new(300);
        let context = builder
            .build(&turns, None, Some(&FailingSummarizer))
            .await;

        assert_eq!(context.len(), 3);
        assert_eq!(&context[..], &turns[5..]);
    }

    #[tokio::test]
    async fn test_no_summarizer_omits_entry() {
        let turns: Vec<_> = (0..8).map(|_| turn_of_tokens(ChatRole::User, 100)).collect();
        let context = ContextBuilder::new(300).build(&turns, None, None).await;
        assert_eq!(context.len(), 3);
    }

    #[tokio::test]
    async fn test_oversized_system_prompt_still_included() {
        let system = "s".repeat(5000 * 4);
        let turns = vec![turn_of_tokens(ChatRole::User, 10)];
        let context = ContextBuilder::new(4000)
            .build(&turns, Some(&system), None)
            .await;

        assert_eq!(context[0].content, system);
        // The newest turn survives as well; the budget is soft.
        assert_eq!(context.len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_newest_turn_still_included() {
        let turns = vec![
            turn_of_tokens(ChatRole::User, 50),
            turn_of_tokens(ChatRole::User, 9000),
        ];
        let context = ContextBuilder::new(4000).build(&turns, None, None).await;

        assert_eq!(context.len(), 1);
        assert_eq!(context[0], turns[1]);
    }
}
