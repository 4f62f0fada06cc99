//! Append-only conversation log.
//!
//! The log is split into two zones by position:
//! 1. **Compactable prefix**: everything before the protected window. Tiers
//!    may rewrite tool output here, and summarization may replace a leading
//!    span of it with one synthetic message.
//! 2. **Protected window**: the last N messages. Never modified.
//!
//! Messages are never reordered and never deleted individually. The only
//! structural change is [`Conversation::splice_prefix`], which swaps a
//! contiguous leading span for a single summary message.

use crate::{ContentBlock, Message};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::warn;

/// Ordered message log owned by a session.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(from = "Vec<Message>", into = "Vec<Message>")]
pub struct Conversation {
    messages: Vec<Message>,
}

impl From<Vec<Message>> for Conversation {
    fn from(msgs: Vec<Message>) -> Self {
        Self::from_messages(msgs)
    }
}

impl From<Conversation> for Vec<Message> {
    fn from(log: Conversation) -> Self {
        log.messages
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a log from existing messages, normalizing turns so they never
    /// decrease.
    pub fn from_messages(msgs: impl IntoIterator<Item = Message>) -> Self {
        let mut log = Self::new();
        for msg in msgs {
            log.push(msg);
        }
        log
    }

    /// Append a message and return its index.
    ///
    /// A message whose turn is older than the last message's turn is clamped
    /// forward; turn order is what failure records and summaries rely on.
    pub fn push(&mut self, mut msg: Message) -> usize {
        if let Some(last) = self.messages.last()
            && msg.turn < last.turn
        {
            warn!(
                "message turn {} precedes last turn {}; clamping",
                msg.turn, last.turn
            );
            msg.turn = last.turn;
        }
        self.messages.push(msg);
        self.messages.len() - 1
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, index: usize) -> Option<&Message> {
        self.messages.get(index)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Turn of the newest message, or 0 for an empty log.
    pub fn last_turn(&self) -> u64 {
        self.messages.last().map_or(0, |m| m.turn)
    }

    /// Index of the first protected message. Everything at or after this
    /// index is off limits to every tier.
    pub fn protected_start(&self, protected_messages: usize) -> usize {
        self.messages.len().saturating_sub(protected_messages)
    }

    /// The protected tail.
    pub fn protected_tail(&self, protected_messages: usize) -> &[Message] {
        &self.messages[self.protected_start(protected_messages)..]
    }

    /// The leading summary message, if the log has been summarized.
    pub fn summary(&self) -> Option<&Message> {
        self.messages.first().filter(|m| m.is_summary())
    }

    /// Every message after the leading summary (or all of them).
    pub fn survivors(&self) -> &[Message] {
        let skip = usize::from(self.summary().is_some());
        &self.messages[skip..]
    }

    /// Number of synthetic summary messages anywhere in the log.
    pub fn summary_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_summary()).count()
    }

    /// Positions `(message, block)` of every tool result before `end`,
    /// oldest first.
    pub(crate) fn tool_result_positions(&self, end: usize) -> Vec<(usize, usize)> {
        self.messages
            .iter()
            .take(end)
            .enumerate()
            .flat_map(|(mi, msg)| {
                msg.blocks
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| b.tool_output().is_some())
                    .map(move |(bi, _)| (mi, bi))
            })
            .collect()
    }

    /// Mutable access to one block, refusing anything in the protected window.
    pub(crate) fn block_mut(
        &mut self,
        index: usize,
        block: usize,
        protected_messages: usize,
    ) -> Option<&mut ContentBlock> {
        if index >= self.protected_start(protected_messages) {
            return None;
        }
        self.messages.get_mut(index)?.blocks.get_mut(block)
    }

    /// Replace `range` (which must start at 0) with a single summary message.
    ///
    /// Returns the replaced messages. Leaves the log untouched and returns
    /// an empty vec if the range is empty, does not start at 0, or reaches
    /// past the end.
    pub(crate) fn splice_prefix(&mut self, range: Range<usize>, summary: Message) -> Vec<Message> {
        if range.start != 0 || range.is_empty() || range.end > self.messages.len() {
            warn!(
                "refusing to splice invalid range {:?} (log has {} messages)",
                range,
                self.messages.len()
            );
            return Vec::new();
        }
        self.messages.splice(range, std::iter::once(summary)).collect()
    }

    /// Locate the arguments of the tool call with `call_id`, searching
    /// backwards from `before`.
    pub(crate) fn tool_call_arguments(&self, call_id: &str, before: usize) -> Option<&str> {
        self.messages[..before.min(self.messages.len())]
            .iter()
            .rev()
            .flat_map(|m| m.blocks.iter())
            .find_map(|b| match b.kind() {
                crate::BlockKind::ToolCall { id, arguments, .. } if id == call_id => {
                    Some(arguments.as_str())
                }
                _ => None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: usize) -> Conversation {
        Conversation::from_messages((0..n).map(|i| Message::user(format!("msg {i}"), i as u64)))
    }

    #[test]
    fn new_log_empty() {
        let log = Conversation::new();
        assert!(log.is_empty());
        assert_eq!(log.last_turn(), 0);
        assert!(log.summary().is_none());
    }

    #[test]
    fn push_clamps_decreasing_turns() {
        let mut log = Conversation::new();
        log.push(Message::user("a", 5));
        let idx = log.push(Message::user("b", 3));
        assert_eq!(idx, 1);
        assert_eq!(log.get(1).unwrap().turn, 5);
    }

    #[test]
    fn protected_start_saturates() {
        let log = sample(3);
        assert_eq!(log.protected_start(10), 0);
        assert_eq!(log.protected_start(1), 2);
        assert_eq!(log.protected_tail(1).len(), 1);
    }

    #[test]
    fn block_mut_refuses_protected_window() {
        let mut log = Conversation::new();
        log.push(Message::tool_result("c1", "grep", "old", 1));
        log.push(Message::tool_result("c2", "grep", "new", 2));
        assert!(log.block_mut(0, 0, 1).is_some());
        assert!(log.block_mut(1, 0, 1).is_none());
    }

    #[test]
    fn splice_prefix_replaces_span() {
        let mut log = sample(6);
        let removed = log.splice_prefix(0..4, Message::summary("first four", 3));
        assert_eq!(removed.len(), 4);
        assert_eq!(log.len(), 3);
        assert!(log.summary().is_some());
        assert_eq!(log.survivors().len(), 2);
    }

    #[test]
    fn splice_prefix_rejects_invalid_ranges() {
        let mut log = sample(3);
        assert!(log.splice_prefix(1..2, Message::summary("x", 0)).is_empty());
        assert!(log.splice_prefix(0..0, Message::summary("x", 0)).is_empty());
        assert!(log.splice_prefix(0..9, Message::summary("x", 0)).is_empty());
        assert_eq!(log, sample(3));
    }

    #[test]
    fn finds_tool_call_arguments() {
        let mut log = Conversation::new();
        log.push(Message::assistant(
            vec![ContentBlock::tool_call("c1", "read_file", r#"{"path":"a.rs"}"#)],
            1,
        ));
        log.push(Message::tool_result("c1", "read_file", "fn a() {}", 1));
        assert_eq!(
            log.tool_call_arguments("c1", 1),
            Some(r#"{"path":"a.rs"}"#)
        );
        assert_eq!(log.tool_call_arguments("c2", 2), None);
    }

    #[test]
    fn tool_result_positions_in_order() {
        let mut log = Conversation::new();
        log.push(Message::user("task", 0));
        log.push(Message::tool_result("c1", "grep", "a", 1));
        log.push(Message::tool_result("c2", "grep", "b", 2));
        assert_eq!(log.tool_result_positions(3), vec![(1, 0), (2, 0)]);
        assert_eq!(log.tool_result_positions(2), vec![(1, 0)]);
    }
}
