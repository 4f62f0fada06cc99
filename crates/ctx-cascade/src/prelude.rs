//! Convenience re-exports for common `ctx-cascade` types.
//!
//! Meant to be glob-imported by an agent loop:
//!
//! ```
//! use ctx_cascade::prelude::*;
//!
//! let config = CompactionConfig::default();
//! let mut session = Session::new(&config);
//! session.push(Message::user("hello", 0));
//! ```
//!
//! Tier functions, report types and the model catalog are left out; import
//! those from their modules directly.

// ── Data model ──────────────────────────────────────────────────────
pub use crate::conversation::Conversation;
pub use crate::session::{CompactionState, Session};
pub use crate::{ContentBlock, Message, Role};

// ── Compaction ──────────────────────────────────────────────────────
pub use crate::config::CompactionConfig;
pub use crate::context::{
    CompactionOrchestrator, CompactionOutcome, CompactionReport, FailureCategory, FailureRecord,
    TokenAccountant,
};

// ── Providers ───────────────────────────────────────────────────────
pub use crate::api::{CompletionPrompt, ModelProvider, OfflineProvider, OpenRouterClient, RetryConfig};

// ── Events ──────────────────────────────────────────────────────────
pub use crate::events::{
    CompactionEvent, CompositeEventHandler, EventHandler, EventResponse, FnEventHandler,
    LoggingHandler, NoopHandler,
};

// ── Errors ──────────────────────────────────────────────────────────
pub use crate::error::{ConfigError, ProviderError, SummarizationError};
