//! Per-session state: the log, the failure tracker and compaction counters.
//!
//! Everything a compaction cycle reads or writes hangs off one [`Session`],
//! so several sessions can live in the same process without sharing state.
//! The orchestrator takes `&mut Session` for the whole cycle, which is what
//! keeps the agent loop from reading the log mid-pass.

use crate::config::CompactionConfig;
use crate::context::assembler;
use crate::context::failures::{FailureRecord, FailureTracker};
use crate::conversation::Conversation;
use crate::Message;
use serde::{Deserialize, Serialize};

/// Counters that survive compaction.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionState {
    /// Set the first time any tier actually changes the log. Gates the
    /// "Recent Failures" prompt section.
    pub has_compacted_at_least_once: bool,
    /// Monotonic agent turn. Orders failure records instead of wall-clock time.
    pub turn_counter: u64,
    /// Cycles that changed the log.
    pub compaction_count: u32,
    /// Tier 3 failures since the last successful summary.
    pub consecutive_summarization_failures: u32,
}

/// One agent session.
#[derive(Debug, Clone)]
pub struct Session {
    conversation: Conversation,
    failures: FailureTracker,
    state: CompactionState,
}

impl Session {
    pub fn new(config: &CompactionConfig) -> Self {
        Self::from_conversation(Conversation::new(), config)
    }

    /// Resume from an existing log. The turn counter starts at the log's
    /// last turn.
    pub fn from_conversation(conversation: Conversation, config: &CompactionConfig) -> Self {
        let state = CompactionState {
            has_compacted_at_least_once: conversation.summary_count() > 0,
            turn_counter: conversation.last_turn(),
            ..Default::default()
        };
        Self {
            conversation,
            failures: FailureTracker::new(config.failure_capacity),
            state,
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn into_conversation(self) -> Conversation {
        self.conversation
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    pub fn state(&self) -> &CompactionState {
        &self.state
    }

    /// Current turn.
    pub fn turn(&self) -> u64 {
        self.state.turn_counter
    }

    /// Start a new turn and return it.
    pub fn advance_turn(&mut self) -> u64 {
        self.state.turn_counter += 1;
        self.state.turn_counter
    }

    /// Append a message. Tool results flagged as errors are fed to the
    /// failure tracker; successful ones end that tool's run of failed exits.
    ///
    /// Returns the failures this message recorded.
    pub fn push(&mut self, msg: Message) -> Vec<FailureRecord> {
        let turn = self
            .state
            .turn_counter
            .max(msg.turn)
            .max(self.conversation.last_turn());
        self.state.turn_counter = turn;

        let mut recorded = Vec::new();
        for block in &msg.blocks {
            if block.is_error() {
                recorded.extend(self.failures.record_result(block, turn));
            } else if let Some(tool) = block.tool_output().and(block.tool_name()) {
                self.failures.note_success(tool);
            }
        }
        self.conversation.push(msg);
        recorded
    }

    /// Record a tool failure that never reached the log (e.g. a tool that
    /// crashed before producing a result).
    pub fn record_failure(&mut self, tool_name: &str, error_text: &str) -> Option<FailureRecord> {
        self.failures.record(tool_name, error_text, self.state.turn_counter)
    }

    /// Render the system prompt for the next model call.
    pub fn assemble(&self, system_template: &str) -> String {
        let failure_section = self.failures.render_section(&self.state);
        assembler::render(
            system_template,
            failure_section.as_deref(),
            self.conversation.summary().and_then(Message::summary_text),
            self.conversation.survivors(),
        )
    }

    /// Split borrows for the orchestrator.
    pub(crate) fn parts_mut(
        &mut self,
    ) -> (&mut Conversation, &mut FailureTracker, &mut CompactionState) {
        (&mut self.conversation, &mut self.failures, &mut self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::failures::FailureCategory;

    #[test]
    fn push_feeds_failure_tracker() {
        let mut session = Session::new(&CompactionConfig::default());
        session.push(Message::user("fix it", 1));
        let recorded = session.push(Message::tool_error("c1", "edit", "old_string not found", 2));
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].category, FailureCategory::EditMismatch);

        // Text mentioning an error is not an error result.
        session.push(Message::tool_result("c2", "grep", "error: 3 matches", 3));
        assert_eq!(session.failures().len(), 1);
        assert_eq!(session.turn(), 3);
    }

    #[test]
    fn success_resets_exit_streak() {
        let mut session = Session::new(&CompactionConfig::default());
        session.push(Message::tool_error("c1", "shell", "exit code 1", 1));
        session.push(Message::tool_result("c2", "shell", "ok", 2));
        let recorded = session.push(Message::tool_error("c3", "shell", "exit code 2", 3));
        assert_eq!(recorded[0].category, FailureCategory::ToolError);
    }

    #[test]
    fn stale_tool_errors_are_recorded_at_the_current_turn() {
        let mut session = Session::new(&CompactionConfig::default());
        session.push(Message::user("fix it", 1));
        for _ in 0..4 {
            session.advance_turn();
        }
        assert_eq!(session.turn(), 5);

        let recorded = session.push(Message::tool_error("c1", "edit", "old_string not found", 2));
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].turn, 5);
        assert_eq!(session.turn(), 5);
    }

    #[test]
    fn advance_turn_is_monotonic() {
        let mut session = Session::new(&CompactionConfig::default());
        assert_eq!(session.advance_turn(), 1);
        assert_eq!(session.advance_turn(), 2);
        session.push(Message::user("late", 0));
        assert_eq!(session.turn(), 2);
    }

    #[test]
    fn resumed_session_continues_turns() {
        let log = Conversation::from_messages([Message::user("a", 7)]);
        let session = Session::from_conversation(log, &CompactionConfig::default());
        assert_eq!(session.turn(), 7);
        assert!(!session.state().has_compacted_at_least_once);
    }

    #[test]
    fn assemble_hides_failures_before_compaction() {
        let mut session = Session::new(&CompactionConfig::default());
        session.push(Message::tool_error("c1", "edit", "old_string not found", 1));
        let prompt = session.assemble("You are a coding agent.");
        assert!(prompt.starts_with("You are a coding agent."));
        assert!(!prompt.contains("## Recent Failures"));
        assert!(prompt.contains("old_string not found"));
    }
}
