//! Events and handlers for compaction cycles.
//!
//! The [`CompactionOrchestrator`](crate::context::orchestrator::CompactionOrchestrator)
//! reports every step of a cycle through [`CompactionEvent`] variants. Callers
//! implement [`EventHandler`] to observe them for logging, metrics, UI status
//! lines, or to veto the expensive summarization step.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |
//! | Custom `impl EventHandler` | Full control (metrics, budget gates) |

use crate::context::budget::Occupancy;
use crate::context::eviction::PruneReport;
use crate::context::orchestrator::CompactionReport;
use crate::context::summarizer::SummaryReport;
use crate::context::truncation::TruncationReport;
use crate::error::SummarizationError;
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Events emitted by the orchestrator during a cycle.
#[derive(Debug)]
pub enum CompactionEvent<'a> {
    /// Occupancy was at or above the trigger; the cascade is starting.
    CycleStarted {
        turn: u64,
        occupancy: &'a Occupancy,
    },
    /// Tier 1 finished.
    Truncated {
        report: &'a TruncationReport,
        occupancy: &'a Occupancy,
    },
    /// Tier 2 finished.
    Pruned {
        report: &'a PruneReport,
        occupancy: &'a Occupancy,
    },
    /// Tier 3 is about to call the provider. A handler may answer
    /// [`EventResponse::SkipSummarization`].
    SummarizationStarting {
        span_messages: usize,
        span_tokens: usize,
        model: &'a str,
    },
    /// Tier 3 replaced a span with a summary.
    Summarized {
        report: &'a SummaryReport,
        occupancy: &'a Occupancy,
    },
    /// Tier 3 failed; the log keeps the Tier 1/2 results.
    SummarizationFailed {
        error: &'a SummarizationError,
        consecutive_failures: u32,
    },
    /// The cycle ended.
    CycleFinished { report: &'a CompactionReport },
}

/// Response from an event handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventResponse {
    /// Do not run Tier 3 this cycle. Only meaningful for
    /// [`CompactionEvent::SummarizationStarting`].
    SkipSummarization,
}

// ── Handlers ───────────────────────────────────────────────────────

/// Observer for compaction events.
///
/// The default implementation returns `None` (no side effects, no veto).
///
/// ```
/// use ctx_cascade::events::{CompactionEvent, EventHandler, EventResponse};
///
/// /// Never pay for a summary with an expensive model.
/// struct BudgetGate;
///
/// impl EventHandler for BudgetGate {
///     fn on_event(&self, event: &CompactionEvent<'_>) -> Option<EventResponse> {
///         match event {
///             CompactionEvent::SummarizationStarting { model, .. } if model.contains("opus") => {
///                 Some(EventResponse::SkipSummarization)
///             }
///             _ => None,
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &CompactionEvent<'_>) -> Option<EventResponse> {
        let _ = event;
        None
    }
}

/// No-op event handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// Closure-based event handler.
///
/// ```
/// use ctx_cascade::events::{CompactionEvent, FnEventHandler};
///
/// let handler = FnEventHandler::new(|event: &CompactionEvent<'_>| {
///     if let CompactionEvent::CycleFinished { report } = event {
///         eprintln!("{}", report.to_log_string());
///     }
///     None
/// });
/// # let _ = handler;
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&CompactionEvent<'_>) -> Option<EventResponse> + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&CompactionEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&CompactionEvent<'_>) -> Option<EventResponse> + Send + Sync,
{
    fn on_event(&self, event: &CompactionEvent<'_>) -> Option<EventResponse> {
        (self.0)(event)
    }
}

/// Runs handlers in order; the first `Some` response wins and stops the
/// chain.
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Append a handler.
    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Append a handler only when `condition` holds.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &CompactionEvent<'_>) -> Option<EventResponse> {
        for handler in &self.handlers {
            if let Some(response) = handler.on_event(event) {
                return Some(response);
            }
        }
        None
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &CompactionEvent<'_>) -> Option<EventResponse> {
        match event {
            CompactionEvent::CycleStarted { turn, occupancy } => {
                info!("[turn {turn}] compaction triggered, {}", occupancy.to_log_string());
            }
            CompactionEvent::Truncated { report, occupancy } => {
                debug!(
                    "truncated {} block(s), freed ~{} tokens; {}",
                    report.truncated_blocks,
                    report.tokens_freed(),
                    occupancy.to_log_string()
                );
            }
            CompactionEvent::Pruned { report, occupancy } => {
                debug!(
                    "pruned {} block(s), freed ~{} tokens; {}",
                    report.pruned_blocks,
                    report.tokens_freed,
                    occupancy.to_log_string()
                );
            }
            CompactionEvent::SummarizationStarting {
                span_messages,
                span_tokens,
                model,
            } => {
                debug!("summarizing {span_messages} message(s) (~{span_tokens} tokens) with {model}");
            }
            CompactionEvent::Summarized { report, occupancy } => {
                info!(
                    "summarized {} message(s): {} -> {} tokens; {}",
                    report.messages_replaced,
                    report.span_tokens,
                    report.summary_tokens,
                    occupancy.to_log_string()
                );
            }
            CompactionEvent::SummarizationFailed {
                error,
                consecutive_failures,
            } => {
                warn!("summarization failed ({consecutive_failures} in a row): {error}");
            }
            CompactionEvent::CycleFinished { report } => {
                info!("{}", report.to_log_string());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn starting() -> CompactionEvent<'static> {
        CompactionEvent::SummarizationStarting {
            span_messages: 3,
            span_tokens: 900,
            model: "anthropic/claude-3.5-haiku",
        }
    }

    #[test]
    fn noop_returns_none() {
        assert!(NoopHandler.on_event(&starting()).is_none());
        assert!(LoggingHandler.on_event(&starting()).is_none());
    }

    #[test]
    fn fn_handler_can_veto() {
        let handler = FnEventHandler::new(|e: &CompactionEvent<'_>| match e {
            CompactionEvent::SummarizationStarting { .. } => Some(EventResponse::SkipSummarization),
            _ => None,
        });
        assert_eq!(
            handler.on_event(&starting()),
            Some(EventResponse::SkipSummarization)
        );
    }

    #[test]
    fn composite_stops_at_first_response() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = |seen: Arc<AtomicUsize>| {
            FnEventHandler::new(move |_: &CompactionEvent<'_>| {
                seen.fetch_add(1, Ordering::SeqCst);
                None
            })
        };
        let handler = CompositeEventHandler::new()
            .with(counter(seen.clone()))
            .with(FnEventHandler::new(|_: &CompactionEvent<'_>| {
                Some(EventResponse::SkipSummarization)
            }))
            .with(counter(seen.clone()))
            .with_if(false, LoggingHandler);

        assert!(handler.on_event(&starting()).is_some());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
