//! Tier 2: replace old tool outputs with one-line placeholders.
//!
//! Tool results are the single largest context consumer in any agent loop.
//! A `read_file` can inject 30KB; a `grep` can return hundreds of lines.
//! Most of it is irrelevant once the model has acted on it. This tier walks
//! the unprotected part of the log oldest first and swaps tool output bodies
//! for a placeholder naming the tool and its arguments, until the log is back
//! under target. The surrounding message (role, text, tool calls) stays.

use crate::context::budget::{TokenAccountant, TokenCount};
use crate::conversation::Conversation;
use tracing::{debug, info};

/// Prefix used for pruned tool result placeholders.
///
/// Both the placeholder writer and the "already pruned?" check reference
/// this constant so they can't drift out of sync.
pub const PRUNED_PREFIX: &str = "[Pruned:";

/// Longest argument summary kept in a placeholder.
const MAX_ARGS_SUMMARY: usize = 80;

/// Result of one Tier 2 pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Tool results replaced with placeholders.
    pub pruned_blocks: usize,
    /// Estimated tokens freed.
    pub tokens_freed: TokenCount,
    /// Whether the pass stopped because the log reached the target.
    pub reached_target: bool,
    /// Turn of the newest message whose output was pruned.
    pub last_pruned_turn: Option<u64>,
    /// Turn of the oldest error output still in the log after the pass.
    pub oldest_kept_error_turn: Option<u64>,
}

impl PruneReport {
    pub fn is_noop(&self) -> bool {
        self.pruned_blocks == 0
    }

    /// First turn whose failures are certainly still readable in the log,
    /// or `None` if nothing was pruned.
    ///
    /// Error outputs too short to be worth a placeholder survive the pass,
    /// so the floor stops at the oldest of them.
    pub fn visible_floor(&self) -> Option<u64> {
        let past_pruned = self.last_pruned_turn? + 1;
        Some(self.oldest_kept_error_turn.map_or(past_pruned, |t| t.min(past_pruned)))
    }
}

/// Whether `content` is a pruning placeholder.
pub fn is_pruned(content: &str) -> bool {
    content.starts_with(PRUNED_PREFIX)
}

/// Prune unprotected tool outputs, oldest first, until the log estimate is
/// at or below `target_tokens` or no candidates remain.
///
/// Already pruned blocks are skipped, as are blocks the placeholder would
/// not make smaller, so the total estimate never grows and a second pass is
/// a no-op.
pub fn prune_tool_outputs(
    log: &mut Conversation,
    protected_messages: usize,
    target_tokens: TokenCount,
    accountant: &TokenAccountant,
) -> PruneReport {
    let mut report = PruneReport::default();
    let mut total = accountant.estimate_total(log);
    let end = log.protected_start(protected_messages);

    for (mi, bi) in log.tool_result_positions(end) {
        if total <= target_tokens {
            report.reached_target = true;
            break;
        }

        let Some(placeholder) = placeholder_for(log, mi, bi, accountant) else {
            continue;
        };
        let turn = log.get(mi).map(|m| m.turn);
        let Some(block) = log.block_mut(mi, bi, protected_messages) else {
            continue;
        };
        let before = accountant.estimate_block(block);
        block.set_tool_output(placeholder);
        let after = accountant.estimate_block(block);
        let freed = before.saturating_sub(after);

        debug!("pruned tool output at message {mi}: freed ~{freed} tokens");
        total = total.saturating_sub(freed);
        report.pruned_blocks += 1;
        report.tokens_freed += freed;
        report.last_pruned_turn = turn;
    }
    if total <= target_tokens {
        report.reached_target = true;
    }
    report.oldest_kept_error_turn = log
        .messages()
        .iter()
        .filter(|m| {
            m.blocks
                .iter()
                .any(|b| b.is_error() && b.tool_output().is_some_and(|c| !is_pruned(c)))
        })
        .map(|m| m.turn)
        .min();

    if !report.is_noop() {
        info!(
            "tier 2: pruned {} tool output(s), freed ~{} tokens",
            report.pruned_blocks, report.tokens_freed
        );
    }
    report
}

/// Placeholder for the tool result at `(mi, bi)`, or `None` if the block is
/// already pruned or the placeholder would not shrink it.
fn placeholder_for(
    log: &Conversation,
    mi: usize,
    bi: usize,
    accountant: &TokenAccountant,
) -> Option<String> {
    let msg = log.get(mi)?;
    let block = msg.blocks.get(bi)?;
    let crate::BlockKind::ToolResult {
        call_id,
        tool_name,
        content,
        is_error,
    } = block.kind()
    else {
        return None;
    };
    if is_pruned(content) {
        return None;
    }

    let content_tokens = accountant.estimate_text(content);
    let args = log
        .tool_call_arguments(call_id, mi)
        .map(|a| summarize_args(a, MAX_ARGS_SUMMARY))
        .unwrap_or_default();
    let status = if *is_error { "error output" } else { "output" };
    let placeholder = format!(
        "{PRUNED_PREFIX} {tool_name}({args}) {status} elided, {content_tokens} tokens, turn {}]",
        msg.turn
    );

    (accountant.estimate_text(&placeholder) < content_tokens).then_some(placeholder)
}

/// Extract a short argument summary from raw JSON arguments for use in
/// placeholders.
pub fn summarize_args(arguments: &str, max_len: usize) -> String {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(arguments)
        && let Some(obj) = v.as_object()
    {
        let parts: Vec<String> = obj
            .iter()
            .take(3)
            .map(|(k, v)| {
                let val = match v {
                    serde_json::Value::String(s) => format!("\"{}\"", shorten(s, 40)),
                    other => shorten(&other.to_string(), 40),
                };
                format!("{k}={val}")
            })
            .collect();
        return shorten(&parts.join(", "), max_len);
    }

    shorten(arguments, max_len)
}

/// Shorten `s` to at most `max_len` bytes, ending in `...` when cut.
fn shorten(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", crate::clip(s, max_len.saturating_sub(3)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContentBlock, Message};

    fn call(id: &str, tool: &str, args: &str, turn: u64) -> Message {
        Message::assistant(vec![ContentBlock::tool_call(id, tool, args)], turn)
    }

    fn build_log() -> Conversation {
        Conversation::from_messages([
            Message::user("task", 0),
            call("c1", "read_file", r#"{"path":"src/main.rs"}"#, 1),
            Message::tool_result("c1", "read_file", "a".repeat(10_000), 1),
            call("c2", "grep", r#"{"pattern":"TODO"}"#, 2),
            Message::tool_result("c2", "grep", "b".repeat(10_000), 2),
            call("c3", "read_file", r#"{"path":"src/lib.rs"}"#, 3),
            Message::tool_result("c3", "read_file", "c".repeat(10_000), 3),
        ])
    }

    fn output(log: &Conversation, index: usize) -> &str {
        log.get(index).unwrap().blocks[0].tool_output().unwrap()
    }

    #[test]
    fn prunes_oldest_first_until_target() {
        let accountant = TokenAccountant::default();
        let mut log = build_log();
        let total = accountant.estimate_total(&log);
        // One block's worth of headroom: only the oldest needs to go.
        let target = total - 2_000;

        let report = prune_tool_outputs(&mut log, 1, target, &accountant);
        assert_eq!(report.pruned_blocks, 1);
        assert!(report.reached_target);
        assert!(is_pruned(output(&log, 2)));
        assert!(!is_pruned(output(&log, 4)));
        assert_eq!(report.last_pruned_turn, Some(1));
        assert!(accountant.estimate_total(&log) <= target);
    }

    #[test]
    fn placeholder_names_tool_and_args() {
        let accountant = TokenAccountant::default();
        let mut log = build_log();
        prune_tool_outputs(&mut log, 0, 0, &accountant);
        let placeholder = output(&log, 2);
        assert!(placeholder.contains("read_file"));
        assert!(placeholder.contains("src/main.rs"));
        assert!(placeholder.contains("turn 1"));
        // Tool call message stays intact.
        assert_eq!(log.get(1).unwrap(), build_log().get(1).unwrap());
    }

    #[test]
    fn protected_window_never_pruned() {
        let accountant = TokenAccountant::default();
        let mut log = build_log();
        let report = prune_tool_outputs(&mut log, 2, 0, &accountant);
        assert_eq!(report.pruned_blocks, 2);
        assert!(!report.reached_target);
        assert!(!is_pruned(output(&log, 6)));
    }

    #[test]
    fn idempotent() {
        let accountant = TokenAccountant::default();
        let mut log = build_log();
        prune_tool_outputs(&mut log, 1, 0, &accountant);
        let once = log.clone();
        let report = prune_tool_outputs(&mut log, 1, 0, &accountant);
        assert!(report.is_noop());
        assert_eq!(log, once);
    }

    #[test]
    fn small_outputs_are_kept() {
        let accountant = TokenAccountant::default();
        let mut log = Conversation::from_messages([
            Message::tool_result("c1", "pwd", "/tmp", 1),
            Message::user("recent", 2),
        ]);
        let before = accountant.estimate_total(&log);
        let report = prune_tool_outputs(&mut log, 1, 0, &accountant);
        assert!(report.is_noop());
        assert_eq!(accountant.estimate_total(&log), before);
    }

    #[test]
    fn short_errors_hold_the_visible_floor() {
        let accountant = TokenAccountant::default();
        let mut log = Conversation::from_messages([
            Message::user("task", 0),
            call("c1", "edit", r#"{"path":"src/lib.rs"}"#, 3),
            Message::tool_error("c1", "edit", "old_string not found", 3),
            call("c2", "read_file", r#"{"path":"src/main.rs"}"#, 5),
            Message::tool_result("c2", "read_file", "a".repeat(10_000), 5),
            Message::user("recent", 6),
        ]);

        let report = prune_tool_outputs(&mut log, 1, 0, &accountant);

        assert_eq!(report.pruned_blocks, 1);
        assert_eq!(report.last_pruned_turn, Some(5));
        assert_eq!(report.oldest_kept_error_turn, Some(3));
        assert_eq!(report.visible_floor(), Some(3));
        assert_eq!(output(&log, 2), "old_string not found");
    }

    #[test]
    fn no_op_when_already_under_target() {
        let accountant = TokenAccountant::default();
        let mut log = build_log();
        let report = prune_tool_outputs(&mut log, 1, usize::MAX, &accountant);
        assert!(report.is_noop());
        assert!(report.reached_target);
    }

    #[test]
    fn summarize_args_json() {
        let args = r#"{"path": "src/main.rs", "encoding": "utf-8"}"#;
        let summary = summarize_args(args, 100);
        assert!(summary.contains("path="));
        assert!(summary.contains("src/main.rs"));
    }

    #[test]
    fn summarize_args_truncates_long_values() {
        let args = format!(r#"{{"query": "{}"}}"#, "x".repeat(100));
        let summary = summarize_args(&args, 100);
        assert!(summary.contains("..."));
    }

    #[test]
    fn summarize_args_raw_fallback_is_char_safe() {
        let summary = summarize_args(&"é".repeat(100), 11);
        assert!(summary.ends_with("..."));
        assert!(summary.len() <= 11);
    }
}
