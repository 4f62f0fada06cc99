//! Cascading context compaction for tool-using LLM agents.
//!
//! `ctx-cascade` keeps a growing agent conversation inside a bounded token
//! budget. It sits between the agent loop and the model provider: before each
//! turn the [`CompactionOrchestrator`](context::orchestrator::CompactionOrchestrator)
//! measures occupancy and, when it is at or above the trigger, runs three
//! increasingly expensive tiers until the log is back under target:
//!
//! 1. **Truncation**: oversized tool outputs are cut to head + tail.
//! 2. **Pruning**: old tool outputs are replaced with one-line placeholders.
//! 3. **Summarization**: the oldest span is replaced by one LLM-written
//!    summary message.
//!
//! A [`FailureTracker`](context::failures::FailureTracker) remembers recent
//! tool failures independently of the log, so the agent still knows what went
//! wrong after the raw error output has been compacted away.
//!
//! # Getting started
//!
//! ```ignore
//! use ctx_cascade::prelude::*;
//!
//! let config = CompactionConfig::default().with_protected_messages(8);
//! let orchestrator = CompactionOrchestrator::new(config.clone());
//! let mut session = Session::new(&config);
//!
//! session.push(Message::user("Fix the failing test in src/lib.rs", session.turn()));
//! // ... agent loop appends assistant/tool messages ...
//!
//! let report = orchestrator
//!     .run_cycle(&mut session, &provider, "anthropic/claude-sonnet-4")
//!     .await;
//! println!("{}", report.to_log_string());
//!
//! let system_prompt = session.assemble("You are a coding agent.");
//! ```
//!
//! # Where to find things
//!
//! - **Data model:** [`Message`], [`ContentBlock`], [`Role`] live here;
//!   [`Conversation`](conversation::Conversation) is the append-only log.
//! - **Token accounting:** [`TokenAccountant`](context::budget::TokenAccountant).
//! - **Tiers:** [`context::truncation`], [`context::eviction`],
//!   [`context::summarizer`].
//! - **Running a cycle:** [`context::orchestrator`] and [`session::Session`].
//! - **Prompt rendering:** [`context::assembler`].
//! - **Provider seam:** [`api::ModelProvider`], with
//!   [`OpenRouterClient`](api::openrouter::OpenRouterClient) as the bundled
//!   implementation.
//! - **Configuration:** [`config::CompactionConfig`].
//! - **Observability:** [`events::EventHandler`] and
//!   [`events::LoggingHandler`].
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`context`] | Token accounting, the three tiers, failure memory, orchestration, rendering |
//! | [`conversation`] | Append-only message log with in-place rewrite and prefix splice |
//! | [`session`] | Per-session state: log, failure tracker, compaction counters |
//! | [`api`] | Provider trait, OpenRouter client, retry, model catalog |
//! | [`config`] | `CompactionConfig` with JSON and `key=value` loading |
//! | [`events`] | Compaction events and handlers |
//! | [`error`] | Error types |

pub mod api;
pub mod config;
pub mod context;
pub mod conversation;
pub mod error;
pub mod events;
pub mod prelude;
pub mod session;

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

// ── Constants ──────────────────────────────────────────────────────

/// Default model driving the conversation when none is given.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

// ── Roles ──────────────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// Where a message came from.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrigin {
    /// Appended by the agent loop.
    #[default]
    Live,
    /// Inserted by summarization in place of an older span.
    Summary,
}

// ── Content blocks ─────────────────────────────────────────────────

/// The payload of a [`ContentBlock`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// Lazily computed token estimate, keyed by the estimator that produced it.
///
/// Not serialized and ignored by equality.
#[derive(Debug, Default, Clone)]
pub(crate) struct TokenCell(OnceLock<(u64, usize)>);

impl TokenCell {
    fn get_or_compute(&self, fingerprint: u64, compute: impl FnOnce() -> usize) -> usize {
        match self.0.get() {
            Some(&(fp, tokens)) if fp == fingerprint => tokens,
            Some(_) => compute(),
            None => {
                let tokens = compute();
                // Another caller may have raced us; either value is valid.
                let _ = self.0.set((fingerprint, tokens));
                tokens
            }
        }
    }
}

/// One block of message content.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ContentBlock {
    #[serde(flatten)]
    kind: BlockKind,
    #[serde(skip)]
    tokens: TokenCell,
}

impl PartialEq for ContentBlock {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl From<BlockKind> for ContentBlock {
    fn from(kind: BlockKind) -> Self {
        Self {
            kind,
            tokens: TokenCell::default(),
        }
    }
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        BlockKind::Text { text: text.into() }.into()
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        BlockKind::Thinking { text: text.into() }.into()
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        BlockKind::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
        .into()
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        BlockKind::ToolResult {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            content: content.into(),
            is_error: false,
        }
        .into()
    }

    /// A tool result the tool layer flagged as an error.
    pub fn tool_error(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        BlockKind::ToolResult {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            content: content.into(),
            is_error: true,
        }
        .into()
    }

    pub fn kind(&self) -> &BlockKind {
        &self.kind
    }

    /// Body of a tool result, `None` for every other block.
    pub fn tool_output(&self) -> Option<&str> {
        match &self.kind {
            BlockKind::ToolResult { content, .. } => Some(content),
            _ => None,
        }
    }

    /// Tool name for tool calls and tool results.
    pub fn tool_name(&self) -> Option<&str> {
        match &self.kind {
            BlockKind::ToolCall { name, .. } => Some(name),
            BlockKind::ToolResult { tool_name, .. } => Some(tool_name),
            _ => None,
        }
    }

    /// Whether this is a tool result flagged as an error.
    pub fn is_error(&self) -> bool {
        matches!(self.kind, BlockKind::ToolResult { is_error: true, .. })
    }

    /// Replace the body of a tool result. No-op for other blocks.
    pub(crate) fn set_tool_output(&mut self, new_content: String) {
        if let BlockKind::ToolResult { content, .. } = &mut self.kind {
            *content = new_content;
            self.tokens = TokenCell::default();
        }
    }

    pub(crate) fn cached_tokens(&self, fingerprint: u64, compute: impl FnOnce() -> usize) -> usize {
        self.tokens.get_or_compute(fingerprint, compute)
    }

    /// One-line-per-block rendering used in transcripts and summary prompts.
    pub fn render(&self) -> String {
        match &self.kind {
            BlockKind::Text { text } => text.clone(),
            BlockKind::Thinking { text } => format!("(thinking) {text}"),
            BlockKind::ToolCall {
                name, arguments, ..
            } => format!("-> {name}({arguments})"),
            BlockKind::ToolResult {
                tool_name,
                content,
                is_error,
                ..
            } => {
                if *is_error {
                    format!("<- {tool_name} [error]: {content}")
                } else {
                    format!("<- {tool_name}: {content}")
                }
            }
        }
    }
}

// ── Messages ───────────────────────────────────────────────────────

/// A message in the conversation log.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
    /// Agent turn that produced this message. Non-decreasing along the log.
    pub turn: u64,
    #[serde(default)]
    pub origin: MessageOrigin,
}

impl Message {
    pub fn new(role: Role, blocks: Vec<ContentBlock>, turn: u64) -> Self {
        Self {
            role,
            blocks,
            turn,
            origin: MessageOrigin::Live,
        }
    }

    pub fn user(text: impl Into<String>, turn: u64) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)], turn)
    }

    pub fn assistant_text(text: impl Into<String>, turn: u64) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(text)], turn)
    }

    pub fn assistant(blocks: Vec<ContentBlock>, turn: u64) -> Self {
        Self::new(Role::Assistant, blocks, turn)
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        turn: u64,
    ) -> Self {
        Self::new(
            Role::Tool,
            vec![ContentBlock::tool_result(call_id, tool_name, content)],
            turn,
        )
    }

    pub fn tool_error(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        turn: u64,
    ) -> Self {
        Self::new(
            Role::Tool,
            vec![ContentBlock::tool_error(call_id, tool_name, content)],
            turn,
        )
    }

    /// The synthetic message that replaces a summarized span.
    pub fn summary(summary: &str, turn: u64) -> Self {
        Self {
            role: Role::User,
            blocks: vec![ContentBlock::text(format!(
                "{SUMMARY_OPEN_TAG}\n{summary}\n{SUMMARY_CLOSE_TAG}"
            ))],
            turn,
            origin: MessageOrigin::Summary,
        }
    }

    pub fn is_summary(&self) -> bool {
        self.origin == MessageOrigin::Summary
    }

    /// Inner text of a summary message, without the wrapping tags.
    pub fn summary_text(&self) -> Option<&str> {
        if !self.is_summary() {
            return None;
        }
        let text = match self.blocks.first()?.kind() {
            BlockKind::Text { text } => text.as_str(),
            _ => return None,
        };
        Some(
            text.strip_prefix(SUMMARY_OPEN_TAG)
                .and_then(|t| t.strip_suffix(SUMMARY_CLOSE_TAG))
                .map(str::trim)
                .unwrap_or(text),
        )
    }

    /// Whether any block is a tool result.
    pub fn has_tool_results(&self) -> bool {
        self.blocks.iter().any(|b| b.tool_output().is_some())
    }

    /// Render the message as `[role]: block / block` for transcripts.
    pub fn render(&self) -> String {
        let body: Vec<String> = self.blocks.iter().map(ContentBlock::render).collect();
        if body.is_empty() {
            format!("[{}]: [no content]", self.role)
        } else {
            format!("[{}]: {}", self.role, body.join("\n"))
        }
    }
}

const SUMMARY_OPEN_TAG: &str = "<context_summary>";
const SUMMARY_CLOSE_TAG: &str = "</context_summary>";

/// Truncate `s` to at most `max_bytes`, backing off to a char boundary.
pub(crate) fn clip(s: &str, max_bytes: usize) -> &str {
    let end = s.floor_char_boundary(max_bytes);
    s.get(..end).unwrap_or(s)
}
