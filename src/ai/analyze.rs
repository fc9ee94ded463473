//! Chat-provider-backed analysis of stored memories

use tokio_util::sync::CancellationToken;

use super::{AiManager, ChatMessage};
use crate::error::{MycelicError, Result};
use crate::search::SearchEngine;
use crate::types::{SearchMode, SearchOptions};

/// How many memories feed one analysis prompt
const ANALYSIS_CONTEXT_LIMIT: i64 = 10;

/// Answer a question over the most relevant stored memories.
///
/// Runs a search for context, builds one prompt, and asks the chat
/// provider. Without a configured chat provider this is `Unavailable`.
pub async fn analyze(
    ai: &AiManager,
    search: &SearchEngine,
    question: &str,
    session_id: Option<&str>,
    cancel: &CancellationToken,
) -> Result<String> {
    let question = question.trim();
    if question.is_empty() {
        return Err(MycelicError::invalid("question", "must not be empty"));
    }
    let chat = ai
        .chat_provider()
        .ok_or_else(|| MycelicError::Unavailable("no chat provider configured".to_string()))?;

    let mut options = SearchOptions {
        mode: SearchMode::Hybrid,
        limit: Some(ANALYSIS_CONTEXT_LIMIT),
        ..Default::default()
    };
    options.filters.session_id = session_id.map(String::from);

    let context = search.search(question, &options, cancel).await?;

    let mut prompt = String::from(
        "You are analyzing an agent's stored memories. Use only the numbered \
         memories below to answer the question. Cite memory numbers inline.\n\n",
    );
    if context.results.is_empty() {
        prompt.push_str("(no matching memories found)\n");
    }
    for (i, result) in context.results.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] (importance {}, relevance {:.2}) {}\n",
            i + 1,
            result.memory.importance,
            result.relevance,
            result.memory.content
        ));
    }
    prompt.push_str(&format!("\nQuestion: {}\n", question));

    let messages = vec![
        ChatMessage::system("You analyze agent memories concisely and factually."),
        ChatMessage::user(prompt),
    ];

    tokio::select! {
        reply = chat.chat(&messages) => reply,
        _ = cancel.cancelled() => Err(MycelicError::Cancelled),
    }
}
