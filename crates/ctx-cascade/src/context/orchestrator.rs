//! The compaction cycle: measure, then cascade through the tiers until the
//! log is back under target.
//!
//! ```text
//! Idle ──► Tier1Applied ──► Tier2Applied ──► Tier3Applied ──► Idle
//!   │            │                │                │
//!   └─ below     └─ at/below      └─ at/below      └─ Satisfied, or Degraded
//!      trigger      target            target          when still over target
//! ```
//!
//! Each step re-measures the log and stops as soon as occupancy is at or
//! below the target. Tier 3 is the only step that suspends; a cancelled or
//! failed Tier 3 leaves the log exactly as Tier 2 left it.

use crate::api::ModelProvider;
use crate::config::CompactionConfig;
use crate::context::budget::{Occupancy, TokenAccountant, TokenCount};
use crate::context::eviction::{PruneReport, prune_tool_outputs};
use crate::context::summarizer::{SummaryReport, Summarizer};
use crate::context::truncation::{TruncationReport, truncate_tool_outputs};
use crate::error::{ConfigError, SummarizationError};
use crate::events::{CompactionEvent, EventHandler, EventResponse, NoopHandler};
use crate::session::{CompactionState, Session};
use std::future::Future;
use tracing::{debug, trace};

/// Where a cycle is in the cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionPhase {
    Idle,
    Tier1Applied,
    Tier2Applied,
    Tier3Applied,
}

impl CompactionPhase {
    /// The step after this one. `Tier3Applied` wraps back to `Idle`.
    pub fn next(self) -> Self {
        match self {
            Self::Idle => Self::Tier1Applied,
            Self::Tier1Applied => Self::Tier2Applied,
            Self::Tier2Applied => Self::Tier3Applied,
            Self::Tier3Applied => Self::Idle,
        }
    }
}

/// How a cycle ended.
#[derive(Debug)]
pub enum CompactionOutcome {
    /// Occupancy was below the trigger; nothing ran.
    NotTriggered,
    /// Occupancy is at or below the target.
    Satisfied,
    /// Every applicable tier ran and the log is still over target. The
    /// agent proceeds anyway.
    Degraded,
    /// Tier 3 failed. Tier 1/2 results are kept; Tier 3 is retried next
    /// cycle.
    SummarizationFailed(SummarizationError),
    /// The cancel signal fired while Tier 3 was in flight. The summary was
    /// discarded.
    Cancelled,
}

impl CompactionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotTriggered => "not triggered",
            Self::Satisfied => "satisfied",
            Self::Degraded => "degraded",
            Self::SummarizationFailed(_) => "summarization failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Everything one cycle did.
#[derive(Debug)]
pub struct CompactionReport {
    pub outcome: CompactionOutcome,
    /// Last phase entered.
    pub phase: CompactionPhase,
    pub before: Occupancy,
    pub after: Occupancy,
    pub truncation: Option<TruncationReport>,
    pub pruning: Option<PruneReport>,
    pub summary: Option<SummaryReport>,
    /// The log no longer fits the effective window at all.
    pub over_hard_limit: bool,
    /// Tier 3 failures in a row, including this cycle's.
    pub consecutive_summarization_failures: u32,
}

impl CompactionReport {
    pub fn tokens_freed(&self) -> TokenCount {
        self.before
            .estimated_tokens
            .saturating_sub(self.after.estimated_tokens)
    }

    /// Whether any tier changed the log.
    pub fn mutated(&self) -> bool {
        self.truncation.as_ref().is_some_and(|r| !r.is_noop())
            || self.pruning.as_ref().is_some_and(|r| !r.is_noop())
            || self.summary.is_some()
    }

    /// Summarization keeps failing and the log no longer fits. The agent
    /// loop should warn the user.
    pub fn degraded_mode_warning(&self) -> bool {
        self.over_hard_limit && self.consecutive_summarization_failures >= 2
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        let mut tiers = Vec::new();
        if let Some(t) = self.truncation.as_ref().filter(|t| !t.is_noop()) {
            tiers.push(format!("truncated {}", t.truncated_blocks));
        }
        if let Some(p) = self.pruning.as_ref().filter(|p| !p.is_noop()) {
            tiers.push(format!("pruned {}", p.pruned_blocks));
        }
        if let Some(s) = &self.summary {
            tiers.push(format!("summarized {} message(s)", s.messages_replaced));
        }
        let mut line = format!(
            "compaction {}: ~{} -> ~{} tokens ({:.0}% -> {:.0}%)",
            self.outcome.label(),
            self.before.estimated_tokens,
            self.after.estimated_tokens,
            self.before.fraction * 100.0,
            self.after.fraction * 100.0,
        );
        if !tiers.is_empty() {
            line.push_str(&format!(", {}", tiers.join(", ")));
        }
        if let CompactionOutcome::SummarizationFailed(e) = &self.outcome {
            line.push_str(&format!(" [{e}]"));
        }
        if self.over_hard_limit {
            line.push_str(" [over context window]");
        }
        line
    }
}

/// Runs compaction cycles against a session.
pub struct CompactionOrchestrator {
    config: CompactionConfig,
    accountant: TokenAccountant,
    summarizer: Summarizer,
    handler: Box<dyn EventHandler>,
}

impl std::fmt::Debug for CompactionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompactionOrchestrator")
            .field("config", &self.config)
            .field("accountant", &self.accountant)
            .finish_non_exhaustive()
    }
}

impl CompactionOrchestrator {
    /// Build from a config. The config is assumed valid; use
    /// [`try_new`](Self::try_new) to check it.
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            accountant: config.accountant(),
            summarizer: Summarizer::new(config.summarizer_config()),
            handler: Box::new(NoopHandler),
            config,
        }
    }

    /// Validate `config`, then build.
    pub fn try_new(config: CompactionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn with_event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handler = Box::new(handler);
        self
    }

    /// Replace the accountant, e.g. to plug in a real tokenizer.
    pub fn with_accountant(mut self, accountant: TokenAccountant) -> Self {
        self.accountant = accountant;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Summarizer) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn accountant(&self) -> &TokenAccountant {
        &self.accountant
    }

    /// Run one cycle. `model` is the model driving the conversation.
    pub async fn run_cycle(
        &self,
        session: &mut Session,
        provider: &dyn ModelProvider,
        model: &str,
    ) -> CompactionReport {
        self.run_cycle_until(session, provider, model, std::future::pending::<()>())
            .await
    }

    /// Run one cycle, abandoning Tier 3 if `cancel` completes first.
    ///
    /// On cancellation the in-flight summary is dropped and the log keeps
    /// its Tier 1/2 state. Dropping the returned future has the same effect.
    pub async fn run_cycle_until(
        &self,
        session: &mut Session,
        provider: &dyn ModelProvider,
        model: &str,
        cancel: impl Future<Output = ()>,
    ) -> CompactionReport {
        let mut cancel = std::pin::pin!(cancel);
        let (log, failures, state) = session.parts_mut();
        let turn = state.turn_counter;
        let protected = self.config.protected_messages;

        let before = self.accountant.occupancy(log);
        let mut report = CompactionReport {
            outcome: CompactionOutcome::NotTriggered,
            phase: CompactionPhase::Idle,
            before,
            after: before,
            truncation: None,
            pruning: None,
            summary: None,
            over_hard_limit: before.fraction > 1.0,
            consecutive_summarization_failures: state.consecutive_summarization_failures,
        };
        if !before.at_or_above(self.config.trigger_threshold) {
            trace!("[turn {turn}] {}; below trigger", before.to_log_string());
            return report;
        }

        self.handler.on_event(&CompactionEvent::CycleStarted {
            turn,
            occupancy: &before,
        });
        let target_tokens = self.accountant.tokens_at(self.config.target_threshold);

        let outcome = loop {
            report.phase = report.phase.next();
            match report.phase {
                CompactionPhase::Tier1Applied => {
                    let tr = truncate_tool_outputs(
                        log,
                        self.config.max_tool_output_tokens,
                        protected,
                        &self.accountant,
                    );
                    report.after = self.accountant.occupancy(log);
                    self.handler.on_event(&CompactionEvent::Truncated {
                        report: &tr,
                        occupancy: &report.after,
                    });
                    report.truncation = Some(tr);
                }
                CompactionPhase::Tier2Applied => {
                    let pr = prune_tool_outputs(log, protected, target_tokens, &self.accountant);
                    if let Some(floor) = pr.visible_floor() {
                        failures.mark_visible_from(floor);
                    }
                    report.after = self.accountant.occupancy(log);
                    self.handler.on_event(&CompactionEvent::Pruned {
                        report: &pr,
                        occupancy: &report.after,
                    });
                    report.pruning = Some(pr);
                }
                CompactionPhase::Tier3Applied => {
                    let prepared =
                        match self
                            .summarizer
                            .prepare(log, protected, &self.accountant, model)
                        {
                            Ok(p) => p,
                            Err(SummarizationError::EmptySpan) => {
                                debug!("tier 3: nothing outside the protected window to summarize");
                                break CompactionOutcome::Degraded;
                            }
                            Err(e) => break self.summarization_failed(e, state),
                        };

                    let veto = self.handler.on_event(&CompactionEvent::SummarizationStarting {
                        span_messages: prepared.span.len(),
                        span_tokens: prepared.span_tokens,
                        model: &prepared.model,
                    });
                    if veto == Some(EventResponse::SkipSummarization) {
                        debug!("tier 3: skipped by event handler");
                        break CompactionOutcome::Degraded;
                    }

                    let response = tokio::select! {
                        biased;
                        () = &mut cancel => None,
                        r = self.summarizer.request(&prepared, provider) => Some(r),
                    };
                    let result = match response {
                        None => {
                            debug!("tier 3: cancelled; discarding in-flight summary");
                            break CompactionOutcome::Cancelled;
                        }
                        Some(r) => r.and_then(|text| {
                            self.summarizer
                                .commit(log, prepared, &text, &self.accountant)
                        }),
                    };

                    match result {
                        Ok(sr) => {
                            state.consecutive_summarization_failures = 0;
                            if let Some(t) = sr.first_kept_turn {
                                failures.mark_visible_from(t);
                            }
                            report.after = self.accountant.occupancy(log);
                            self.handler.on_event(&CompactionEvent::Summarized {
                                report: &sr,
                                occupancy: &report.after,
                            });
                            report.summary = Some(sr);
                        }
                        Err(e) => break self.summarization_failed(e, state),
                    }
                }
                CompactionPhase::Idle => break CompactionOutcome::Degraded,
            }

            if report.after.estimated_tokens <= target_tokens {
                break CompactionOutcome::Satisfied;
            }
        };

        if report.mutated() {
            state.has_compacted_at_least_once = true;
            state.compaction_count += 1;
        }
        report.outcome = outcome;
        report.over_hard_limit = report.after.fraction > 1.0;
        report.consecutive_summarization_failures = state.consecutive_summarization_failures;

        self.handler
            .on_event(&CompactionEvent::CycleFinished { report: &report });
        report
    }

    fn summarization_failed(
        &self,
        error: SummarizationError,
        state: &mut CompactionState,
    ) -> CompactionOutcome {
        state.consecutive_summarization_failures += 1;
        self.handler.on_event(&CompactionEvent::SummarizationFailed {
            error: &error,
            consecutive_failures: state.consecutive_summarization_failures,
        });
        CompactionOutcome::SummarizationFailed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CompletionPrompt;
    use crate::context::summarizer::SummarizerConfig;
    use crate::error::ProviderError;
    use crate::events::FnEventHandler;
    use crate::{ContentBlock, Message};
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a short summary, or fails, or never answers.
    enum TestProvider {
        Summary,
        Fail,
        Hang,
    }

    impl ModelProvider for TestProvider {
        fn complete<'a>(
            &'a self,
            _prompt: &'a CompletionPrompt,
            _model: &'a str,
        ) -> BoxFuture<'a, Result<String, ProviderError>> {
            match self {
                TestProvider::Summary => Box::pin(async { Ok("## Task State\nWorking.".into()) }),
                TestProvider::Fail => {
                    Box::pin(async { Err(ProviderError::Http { status: 400, body: "bad".into() }) })
                }
                TestProvider::Hang => Box::pin(futures::future::pending()),
            }
        }
    }

    fn config() -> CompactionConfig {
        CompactionConfig::default()
            .with_context_window(10_000)
            .with_protected_messages(4)
            .with_max_tool_output_tokens(500)
    }

    fn orchestrator(config: CompactionConfig) -> CompactionOrchestrator {
        let summarizer = Summarizer::new(SummarizerConfig {
            retry: crate::api::RetryConfig::immediate(0),
            ..config.summarizer_config()
        });
        CompactionOrchestrator::new(config).with_summarizer(summarizer)
    }

    /// `n` user messages of ~`tokens` each.
    fn chatty_session(config: &CompactionConfig, n: usize, tokens: usize) -> Session {
        let mut session = Session::new(config);
        for i in 0..n {
            session.push(Message::user("w".repeat(tokens * 7 / 2), i as u64));
        }
        session
    }

    #[test]
    fn phases_cycle() {
        let mut phase = CompactionPhase::Idle;
        let mut seen = Vec::new();
        for _ in 0..4 {
            phase = phase.next();
            seen.push(phase);
        }
        assert_eq!(
            seen,
            [
                CompactionPhase::Tier1Applied,
                CompactionPhase::Tier2Applied,
                CompactionPhase::Tier3Applied,
                CompactionPhase::Idle
            ]
        );
    }

    #[tokio::test]
    async fn below_trigger_does_nothing() {
        let config = config();
        let mut session = chatty_session(&config, 5, 100);
        let before = session.conversation().clone();
        let report = orchestrator(config)
            .run_cycle(&mut session, &TestProvider::Fail, "m")
            .await;
        assert!(matches!(report.outcome, CompactionOutcome::NotTriggered));
        assert_eq!(session.conversation(), &before);
        assert!(!session.state().has_compacted_at_least_once);
    }

    #[tokio::test]
    async fn truncation_alone_can_satisfy() {
        let config = config();
        let mut session = Session::new(&config);
        session.push(Message::user("task", 0));
        session.push(Message::tool_result("c1", "shell", "x".repeat(30_000), 1));
        for i in 0..4 {
            session.push(Message::user("recent", 2 + i));
        }

        let report = orchestrator(config)
            .run_cycle(&mut session, &TestProvider::Fail, "m")
            .await;
        assert!(matches!(report.outcome, CompactionOutcome::Satisfied));
        assert_eq!(report.phase, CompactionPhase::Tier1Applied);
        assert!(report.pruning.is_none());
        assert!(session.state().has_compacted_at_least_once);
        assert_eq!(session.state().compaction_count, 1);
    }

    #[tokio::test]
    async fn summarization_reaches_target() {
        let config = config();
        let mut session = chatty_session(&config, 20, 450);
        let report = orchestrator(config)
            .run_cycle(&mut session, &TestProvider::Summary, "m")
            .await;
        assert!(matches!(report.outcome, CompactionOutcome::Satisfied));
        assert!(report.after.fraction <= 0.60);
        assert_eq!(session.conversation().summary_count(), 1);
        assert_eq!(session.conversation().len(), 5);
    }

    #[tokio::test]
    async fn failed_summary_is_counted() {
        let config = config();
        let mut session = chatty_session(&config, 20, 450);
        let before = session.conversation().clone();
        let orch = orchestrator(config);

        let report = orch.run_cycle(&mut session, &TestProvider::Fail, "m").await;
        assert!(matches!(
            report.outcome,
            CompactionOutcome::SummarizationFailed(SummarizationError::Provider(_))
        ));
        assert_eq!(session.conversation(), &before);
        assert_eq!(report.consecutive_summarization_failures, 1);

        let report = orch.run_cycle(&mut session, &TestProvider::Fail, "m").await;
        assert_eq!(report.consecutive_summarization_failures, 2);
        assert!(!report.degraded_mode_warning());

        let report = orch.run_cycle(&mut session, &TestProvider::Summary, "m").await;
        assert!(matches!(report.outcome, CompactionOutcome::Satisfied));
        assert_eq!(session.state().consecutive_summarization_failures, 0);
    }

    #[tokio::test]
    async fn cancellation_discards_summary() {
        let config = config();
        let mut session = chatty_session(&config, 20, 450);
        let before = session.conversation().clone();

        let report = orchestrator(config)
            .run_cycle_until(&mut session, &TestProvider::Hang, "m", async {})
            .await;
        assert!(matches!(report.outcome, CompactionOutcome::Cancelled));
        assert_eq!(session.conversation(), &before);
        assert_eq!(session.state().consecutive_summarization_failures, 0);
    }

    #[tokio::test]
    async fn everything_protected_is_degraded() {
        let config = config().with_protected_messages(50);
        let mut session = chatty_session(&config, 20, 450);
        let report = orchestrator(config)
            .run_cycle(&mut session, &TestProvider::Summary, "m")
            .await;
        assert!(matches!(report.outcome, CompactionOutcome::Degraded));
        assert!(!report.mutated());
        assert!(!session.state().has_compacted_at_least_once);
    }

    #[tokio::test]
    async fn handler_can_skip_summarization() {
        let config = config();
        let mut session = chatty_session(&config, 20, 450);
        let events = std::sync::Arc::new(AtomicUsize::new(0));
        let seen = events.clone();
        let handler = FnEventHandler::new(move |e: &CompactionEvent<'_>| {
            seen.fetch_add(1, Ordering::SeqCst);
            matches!(e, CompactionEvent::SummarizationStarting { .. })
                .then_some(EventResponse::SkipSummarization)
        });

        let report = orchestrator(config)
            .with_event_handler(handler)
            .run_cycle(&mut session, &TestProvider::Summary, "m")
            .await;
        assert!(matches!(report.outcome, CompactionOutcome::Degraded));
        assert_eq!(session.conversation().summary_count(), 0);
        // started, truncated, pruned, summarization starting, finished
        assert_eq!(events.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn over_window_is_flagged() {
        let config = config();
        let mut session = chatty_session(&config, 30, 450);
        let report = orchestrator(config)
            .run_cycle(&mut session, &TestProvider::Fail, "m")
            .await;
        assert!(report.before.fraction > 1.0);
        assert!(report.over_hard_limit);
        assert!(report.to_log_string().contains("over context window"));
    }

    #[tokio::test]
    async fn summary_hides_old_failures_until_repeated() {
        let config = config();
        let mut session = Session::new(&config);
        session.push(Message::assistant(
            vec![ContentBlock::tool_call("c1", "edit", r#"{"path":"a.rs"}"#)],
            1,
        ));
        session.push(Message::tool_error("c1", "edit", "old_string not found", 1));
        for i in 0..20 {
            session.push(Message::user("w".repeat(1575), 2 + i));
        }

        orchestrator(config)
            .run_cycle(&mut session, &TestProvider::Summary, "m")
            .await;
        assert!(session.state().has_compacted_at_least_once);
        assert!(session.assemble("sys").contains("## Recent Failures"));

        let again = session.push(Message::tool_error("c2", "edit", "old_string not found", 30));
        assert_eq!(again.len(), 1, "failure was compacted away, so it is signaled again");
    }

    #[tokio::test]
    async fn short_errors_left_by_pruning_stay_deduplicated() {
        let config = config();
        let mut session = Session::new(&config);
        session.push(Message::user("w".repeat(21_000), 0));
        session.push(Message::assistant(
            vec![ContentBlock::tool_call("c1", "edit", r#"{"path":"a.rs"}"#)],
            3,
        ));
        assert_eq!(
            session
                .push(Message::tool_error("c1", "edit", "old_string not found", 3))
                .len(),
            1
        );
        session.push(Message::assistant(
            vec![ContentBlock::tool_call("c2", "read_file", r#"{"path":"b.rs"}"#)],
            5,
        ));
        session.push(Message::tool_result("c2", "read_file", "r".repeat(1_600), 5));
        for i in 0..4 {
            session.push(Message::user("w".repeat(1575), 6 + i));
        }

        let report = orchestrator(config)
            .run_cycle(&mut session, &TestProvider::Fail, "m")
            .await;
        let pruning = report.pruning.expect("tier 2 ran");
        assert_eq!(pruning.last_pruned_turn, Some(5));
        assert_eq!(
            session.conversation().messages()[2].blocks[0].tool_output(),
            Some("old_string not found")
        );

        let again = session.push(Message::tool_error("c3", "edit", "old_string not found", 10));
        assert!(again.is_empty(), "the earlier error is still in the log");
    }
}
