//! Tier 3: replace the oldest span of the log with one LLM-written summary.
//!
//! The most expensive tier and the only one that performs I/O. The span is
//! everything before the protected window, pulled back if needed so that a
//! tool result kept in the tail never loses its tool call. An existing summary
//! inside the span is handed to the model as `EXISTING SUMMARY` and merged, so
//! the log never carries more than one summary at its head.
//!
//! The work is split in three steps so the orchestrator can cancel between
//! them:
//!
//! 1. [`Summarizer::prepare`]: pick the span and build the prompt. Pure; also picks
//!    the model.
//! 2. [`Summarizer::request`]: the provider call, retried on transient
//!    errors. Does not touch the log.
//! 3. [`Summarizer::commit`]: validate the response and splice it in, in one
//!    synchronous step.
//!
//! Any error leaves the log exactly as it was.

use crate::api::catalog::{ModelCatalog, provider_of};
use crate::api::retry::{RetryConfig, with_backoff};
use crate::api::{CompletionPrompt, ModelProvider};
use crate::context::budget::{TokenAccountant, TokenCount};
use crate::conversation::Conversation;
use crate::error::SummarizationError;
use crate::{BlockKind, Message};
use std::collections::HashSet;
use std::ops::Range;
use tracing::{debug, info, warn};

/// Default cap on summary length.
pub const DEFAULT_MAX_SUMMARY_TOKENS: u32 = 2048;

/// Files listed in the preservation note.
const MAX_PRESERVED_FILES: usize = 20;

/// System prompt for summarization. The section headings are fixed so later
/// merges can update each one in place.
const SUMMARIZATION_PROMPT: &str = "\
You are compacting the history of a coding agent's session. Summarize the \
conversation below so the agent can continue the task from the summary alone.

Use exactly these sections, in this order:
## Task State
What the user asked for and how far along it is.
## Files Touched
Every file read, created or modified, with what was done to it.
## Tool History
Notable tool calls and what they returned.
## Errors and Resolutions
Errors hit, what caused them, and how (or whether) they were fixed.
## Decisions
Design choices made and the reasons given.
## User Guidance
Instructions, preferences and corrections from the user. Quote them verbatim.
## Next Steps
What remains to be done.

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve file paths, function names, and error messages verbatim.
- Be concise. Write \"none\" under a section with nothing to report.
- If there is an existing summary, merge the new information into it to produce a single \
  cohesive summary. Do not simply append: integrate, deduplicate, and update. The result \
  must be a standalone summary that replaces the existing one entirely.";

/// Configuration for Tier 3.
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    /// Explicit summarization model. When unset, the cheapest catalog model
    /// of the active provider is used, else the conversation's own model.
    pub model: Option<String>,
    /// Maximum tokens for the summarization response.
    pub max_summary_tokens: u32,
    /// Retry policy for transient provider errors.
    pub retry: RetryConfig,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_summary_tokens: DEFAULT_MAX_SUMMARY_TOKENS,
            retry: RetryConfig::with_retries(2),
        }
    }
}

/// A span ready to be sent to the provider.
#[derive(Debug, Clone)]
pub struct PreparedSummary {
    /// Leading range of the log that the summary will replace.
    pub span: Range<usize>,
    /// Estimated tokens of the span.
    pub span_tokens: TokenCount,
    pub prompt: CompletionPrompt,
    /// Model the request goes to.
    pub model: String,
    /// Turn stamped on the summary message.
    turn: u64,
}

/// Result of a successful Tier 3 pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryReport {
    /// Messages replaced by the summary.
    pub messages_replaced: usize,
    pub span_tokens: TokenCount,
    pub summary_tokens: TokenCount,
    pub model: String,
    /// Turn of the oldest message left after the summary.
    pub first_kept_turn: Option<u64>,
}

impl SummaryReport {
    pub fn tokens_freed(&self) -> TokenCount {
        self.span_tokens.saturating_sub(self.summary_tokens)
    }
}

/// Tier 3 summarizer.
#[derive(Debug, Clone)]
pub struct Summarizer {
    config: SummarizerConfig,
    catalog: ModelCatalog,
}

impl Default for Summarizer {
    fn default() -> Self {
        Self::new(SummarizerConfig::default())
    }
}

impl Summarizer {
    /// A summarizer using the built-in model catalog.
    pub fn new(config: SummarizerConfig) -> Self {
        Self {
            config,
            catalog: ModelCatalog::builtin(),
        }
    }

    /// Replace the model catalog used for model selection.
    pub fn with_catalog(mut self, catalog: ModelCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn config(&self) -> &SummarizerConfig {
        &self.config
    }

    /// Model that summarizes a conversation driven by `current_model`.
    pub fn summary_model(&self, current_model: &str) -> String {
        select_summary_model(self.config.model.as_deref(), &self.catalog, current_model)
    }

    /// Pick the span and build the request. Does not touch the log.
    pub fn prepare(
        &self,
        log: &Conversation,
        protected_messages: usize,
        accountant: &TokenAccountant,
        current_model: &str,
    ) -> Result<PreparedSummary, SummarizationError> {
        let span = select_span(log, protected_messages).ok_or(SummarizationError::EmptySpan)?;
        let messages = &log.messages()[span.clone()];
        let span_tokens = accountant.estimate_messages(messages);
        let turn = messages.last().map_or(0, |m| m.turn);
        let (system, user) = build_summarization_request(messages);
        let model = self.summary_model(current_model);

        debug!(
            "tier 3: span of {} message(s), ~{span_tokens} tokens, model {model}",
            span.len()
        );
        Ok(PreparedSummary {
            span,
            span_tokens,
            prompt: CompletionPrompt {
                system,
                user,
                max_tokens: self.config.max_summary_tokens,
            },
            model,
            turn,
        })
    }

    /// Call the provider, retrying transient failures.
    pub async fn request(
        &self,
        prepared: &PreparedSummary,
        provider: &dyn ModelProvider,
    ) -> Result<String, SummarizationError> {
        let text = with_backoff(&self.config.retry, |_| {
            provider.complete(&prepared.prompt, &prepared.model)
        })
        .await?;
        Ok(text)
    }

    /// Validate `response` and splice it over the prepared span.
    ///
    /// Fails without touching the log if the response is empty, if it is not
    /// smaller than the span, or if the log no longer holds the span.
    pub fn commit(
        &self,
        log: &mut Conversation,
        prepared: PreparedSummary,
        response: &str,
        accountant: &TokenAccountant,
    ) -> Result<SummaryReport, SummarizationError> {
        let text = strip_summary_tags(response);
        if text.is_empty() {
            return Err(SummarizationError::MalformedResponse(
                "empty summary".into(),
            ));
        }
        if prepared.span.end > log.len() {
            warn!(
                "log shrank to {} messages since the span was prepared",
                log.len()
            );
            return Err(SummarizationError::EmptySpan);
        }

        let summary = Message::summary(text, prepared.turn);
        let summary_tokens = accountant.estimate(&summary);
        if summary_tokens >= prepared.span_tokens {
            return Err(SummarizationError::NoReduction {
                span_tokens: prepared.span_tokens,
                summary_tokens,
            });
        }

        let replaced = log.splice_prefix(prepared.span, summary);
        if replaced.is_empty() {
            return Err(SummarizationError::EmptySpan);
        }

        let report = SummaryReport {
            messages_replaced: replaced.len(),
            span_tokens: prepared.span_tokens,
            summary_tokens,
            model: prepared.model,
            first_kept_turn: log.get(1).map(|m| m.turn),
        };
        info!(
            "tier 3: summarized {} message(s) with {}, freed ~{} tokens",
            report.messages_replaced,
            report.model,
            report.tokens_freed()
        );
        Ok(report)
    }

    /// Prepare, request and commit in one call.
    pub async fn apply(
        &self,
        log: &mut Conversation,
        protected_messages: usize,
        provider: &dyn ModelProvider,
        current_model: &str,
        accountant: &TokenAccountant,
    ) -> Result<SummaryReport, SummarizationError> {
        let prepared = self.prepare(log, protected_messages, accountant, current_model)?;
        let response = self.request(&prepared, provider).await?;
        self.commit(log, prepared, &response, accountant)
    }
}

/// The span Tier 3 would replace, or `None` when there is nothing worth
/// summarizing.
///
/// Starts as everything before the protected window, then moves its end back
/// until no tool result at or after the end refers to a tool call inside the
/// span. A span that is only the existing summary is not summarized again.
pub fn select_span(log: &Conversation, protected_messages: usize) -> Option<Range<usize>> {
    let messages = log.messages();
    let mut end = log.protected_start(protected_messages);

    loop {
        let kept_calls: HashSet<&str> = messages[end..]
            .iter()
            .flat_map(|m| m.blocks.iter())
            .filter_map(|b| match b.kind() {
                BlockKind::ToolResult { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();
        let split_at = messages[..end].iter().position(|m| {
            m.blocks.iter().any(|b| {
                matches!(b.kind(), BlockKind::ToolCall { id, .. } if kept_calls.contains(id.as_str()))
            })
        });
        match split_at {
            Some(i) => {
                debug!("span end pulled back from {end} to {i} to keep a tool call with its result");
                end = i;
            }
            None => break,
        }
    }

    match end {
        0 => None,
        1 if messages[0].is_summary() => None,
        _ => Some(0..end),
    }
}

/// Build the (system, user) pair for summarizing `span`.
pub fn build_summarization_request(span: &[Message]) -> (String, String) {
    let mut content = String::new();

    let existing: Vec<&str> = span.iter().filter_map(Message::summary_text).collect();
    if !existing.is_empty() {
        content.push_str("=== EXISTING SUMMARY ===\n");
        content.push_str(&existing.join("\n\n"));
        content.push_str("\n\n=== NEW MESSAGES TO SUMMARIZE ===\n");
    }

    for msg in span.iter().filter(|m| !m.is_summary()) {
        content.push_str(&format!("(turn {}) {}\n\n", msg.turn, msg.render()));
    }

    let note = files_touched_note(span);
    if !note.is_empty() {
        content.push_str(&note);
    }

    (SUMMARIZATION_PROMPT.to_string(), content)
}

/// List of file paths found in tool call arguments, newest last, so the
/// summary keeps them even if the model skims.
fn files_touched_note(span: &[Message]) -> String {
    let mut files: Vec<(String, &str, u64)> = Vec::new();
    for msg in span {
        for block in &msg.blocks {
            if let BlockKind::ToolCall {
                name, arguments, ..
            } = block.kind()
                && let Some(path) = extract_path(arguments)
            {
                files.retain(|(p, _, _)| *p != path);
                files.push((path, name.as_str(), msg.turn));
            }
        }
    }
    if files.len() > MAX_PRESERVED_FILES {
        files.drain(..files.len() - MAX_PRESERVED_FILES);
    }
    if files.is_empty() {
        return String::new();
    }

    let mut note = String::from("=== FILES TOUCHED (preserve these paths) ===\n");
    for (path, tool, turn) in files {
        note.push_str(&format!("- {path} ({tool}, turn {turn})\n"));
    }
    note
}

/// Extract a file path from JSON tool arguments.
///
/// Tries common keys: `path`, `file_path`, `file`, `pattern` (for grep/search).
fn extract_path(arguments: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(arguments).ok()?;
    let obj = value.as_object()?;

    for key in &["path", "file_path", "file", "pattern"] {
        if let Some(v) = obj.get(*key).and_then(|v| v.as_str())
            && !v.is_empty()
        {
            return Some(v.to_string());
        }
    }
    None
}

/// Trim the response and drop `<context_summary>` tags the model may echo.
fn strip_summary_tags(response: &str) -> &str {
    let trimmed = response.trim();
    trimmed
        .strip_prefix("<context_summary>")
        .and_then(|t| t.strip_suffix("</context_summary>"))
        .map_or(trimmed, str::trim)
}

/// Choose the summarization model.
///
/// Explicit configuration wins; otherwise the cheapest catalog model for the
/// current model's provider; otherwise the current model itself.
pub fn select_summary_model(
    explicit: Option<&str>,
    catalog: &ModelCatalog,
    current_model: &str,
) -> String {
    if let Some(model) = explicit.map(str::trim).filter(|m| !m.is_empty()) {
        return model.to_string();
    }
    provider_of(current_model)
        .and_then(|provider| catalog.cheapest_for(provider))
        .map_or_else(|| current_model.to_string(), |m| m.id.clone())
}
