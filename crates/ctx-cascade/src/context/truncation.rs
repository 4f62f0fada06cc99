//! Tier 1: cut oversized tool outputs down to head + tail.
//!
//! A single `cat` of a generated file or a verbose build log can eat a
//! tenth of the window on its own. The start and end of such output usually
//! carry what matters (the command echo, the final error, the summary line),
//! so this tier keeps both ends and replaces the middle with a marker that
//! records how much was dropped. Cheap, lossy, no I/O.

use crate::context::budget::{TokenAccountant, TokenCount};
use crate::conversation::Conversation;
use tracing::{debug, info};

/// Start of the marker that replaces the elided middle.
///
/// Both the writer and the "already truncated?" check reference this
/// constant so they can't drift out of sync.
pub const TRUNCATION_MARKER_PREFIX: &str = "...[truncated ";
const TRUNCATION_MARKER_SUFFIX: &str = " tokens]...";

/// Share of the cutoff given to each of head and tail.
const KEEP_FRACTION: f64 = 0.45;

/// Smallest head/tail before the halving loop gives up.
const MIN_KEEP_BYTES: usize = 16;

/// Result of one Tier 1 pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TruncationReport {
    /// Tool results that were cut.
    pub truncated_blocks: usize,
    /// Content tokens of the cut blocks before truncation.
    pub tokens_before: TokenCount,
    /// Content tokens of the cut blocks after truncation.
    pub tokens_after: TokenCount,
}

impl TruncationReport {
    pub fn tokens_freed(&self) -> TokenCount {
        self.tokens_before.saturating_sub(self.tokens_after)
    }

    /// Nothing was over the cutoff.
    pub fn is_noop(&self) -> bool {
        self.truncated_blocks == 0
    }
}

/// Whether `content` carries a marker line written by this tier.
///
/// Only a whole line of the exact form `...[truncated N tokens]...` counts;
/// the same words quoted inside ordinary output do not.
pub fn is_truncated(content: &str) -> bool {
    content.lines().any(|line| {
        line.strip_prefix(TRUNCATION_MARKER_PREFIX)
            .and_then(|rest| rest.strip_suffix(TRUNCATION_MARKER_SUFFIX))
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    })
}

/// Truncate every unprotected tool output above `max_tool_output_tokens`.
///
/// Messages in the last `protected_messages` positions are never touched.
/// Blocks that are already truncated, or at or under the cutoff, are left
/// exactly as they are, so applying this twice is the same as applying it
/// once.
pub fn truncate_tool_outputs(
    log: &mut Conversation,
    max_tool_output_tokens: TokenCount,
    protected_messages: usize,
    accountant: &TokenAccountant,
) -> TruncationReport {
    let mut report = TruncationReport::default();
    let end = log.protected_start(protected_messages);

    for (mi, bi) in log.tool_result_positions(end) {
        let Some(block) = log.block_mut(mi, bi, protected_messages) else {
            continue;
        };
        let Some(content) = block.tool_output() else {
            continue;
        };
        let before = accountant.estimate_text(content);
        let Some(replacement) = head_tail(content, max_tool_output_tokens, accountant) else {
            continue;
        };
        let after = accountant.estimate_text(&replacement);
        debug!(
            "truncated {} output at message {mi}: {before} -> {after} tokens",
            block.tool_name().unwrap_or("tool"),
        );
        block.set_tool_output(replacement);

        report.truncated_blocks += 1;
        report.tokens_before += before;
        report.tokens_after += after;
    }

    if !report.is_noop() {
        info!(
            "tier 1: truncated {} tool output(s), freed ~{} tokens",
            report.truncated_blocks,
            report.tokens_freed()
        );
    }
    report
}

/// Build the head + marker + tail replacement for `content`.
///
/// Returns `None` when the content is within `max_tokens` or cannot be made
/// smaller. Output that already went through this tier is only cut again if
/// that brings it under the cutoff, so a cutoff too small to reach leaves it
/// as it is.
pub fn head_tail(content: &str, max_tokens: TokenCount, accountant: &TokenAccountant) -> Option<String> {
    let total = accountant.estimate_text(content);
    if total <= max_tokens {
        return None;
    }

    let mut keep = accountant
        .bytes_for_tokens((max_tokens as f64 * KEEP_FRACTION) as usize)
        .max(MIN_KEEP_BYTES);

    loop {
        let head_end = content.floor_char_boundary(keep);
        let tail_start = content.ceil_char_boundary(content.len().saturating_sub(keep));
        if head_end >= tail_start {
            // Both ends overlap: nothing in the middle to drop at this size.
            if keep <= MIN_KEEP_BYTES {
                return None;
            }
            keep /= 2;
            continue;
        }

        let (head, rest) = content.split_at(head_end);
        let (middle, tail) = rest.split_at(tail_start - head_end);
        let elided = accountant.estimate_text(middle);
        let replacement =
            format!("{head}\n{TRUNCATION_MARKER_PREFIX}{elided}{TRUNCATION_MARKER_SUFFIX}\n{tail}");
        let replacement_tokens = accountant.estimate_text(&replacement);

        if replacement_tokens < max_tokens {
            return Some(replacement);
        }
        if keep <= MIN_KEEP_BYTES {
            let shrinks = replacement_tokens < total && !is_truncated(content);
            return shrinks.then_some(replacement);
        }
        keep /= 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;

    fn log_with_output(len: usize) -> Conversation {
        Conversation::from_messages([
            Message::user("task", 0),
            Message::tool_result("c1", "shell", "x".repeat(len), 1),
            Message::user("recent", 2),
        ])
    }

    fn output(log: &Conversation, index: usize) -> &str {
        log.get(index).unwrap().blocks[0].tool_output().unwrap()
    }

    #[test]
    fn truncates_oversized_output() {
        let accountant = TokenAccountant::default();
        let mut log = log_with_output(35_000);
        let report = truncate_tool_outputs(&mut log, 1000, 1, &accountant);

        assert_eq!(report.truncated_blocks, 1);
        assert!(report.tokens_after < 1000);
        let content = output(&log, 1);
        assert!(is_truncated(content));
        assert!(content.starts_with("xxx"));
        assert!(content.ends_with("xxx"));
    }

    #[test]
    fn leaves_small_outputs_alone() {
        let accountant = TokenAccountant::default();
        let mut log = log_with_output(100);
        let before = log.clone();
        let report = truncate_tool_outputs(&mut log, 1000, 1, &accountant);
        assert!(report.is_noop());
        assert_eq!(log, before);
    }

    #[test]
    fn idempotent() {
        let accountant = TokenAccountant::default();
        let mut log = log_with_output(35_000);
        truncate_tool_outputs(&mut log, 1000, 1, &accountant);
        let once = log.clone();
        let report = truncate_tool_outputs(&mut log, 1000, 1, &accountant);
        assert!(report.is_noop());
        assert_eq!(log, once);
    }

    #[test]
    fn protected_window_untouched() {
        let accountant = TokenAccountant::default();
        let mut log = log_with_output(35_000);
        let report = truncate_tool_outputs(&mut log, 1000, 2, &accountant);
        assert!(report.is_noop());
        assert_eq!(output(&log, 1).len(), 35_000);
    }

    #[test]
    fn never_increases_total() {
        let accountant = TokenAccountant::default();
        for len in [0, 10, 3_500, 3_600, 7_000, 50_000] {
            let mut log = log_with_output(len);
            let before = accountant.estimate_total(&log);
            truncate_tool_outputs(&mut log, 1000, 1, &accountant);
            assert!(accountant.estimate_total(&log) <= before, "len={len}");
        }
    }

    #[test]
    fn multibyte_content_is_cut_on_char_boundaries() {
        let accountant = TokenAccountant::default();
        let content = "é漢🙂".repeat(5_000);
        let out = head_tail(&content, 200, &accountant).expect("should truncate");
        assert!(is_truncated(&out));
        assert!(accountant.estimate_text(&out) < 200);
    }

    #[test]
    fn marker_records_elided_tokens() {
        let accountant = TokenAccountant::with_calibration(Some(1.0));
        let content = "a".repeat(1_000);
        let out = head_tail(&content, 100, &accountant).unwrap();
        let marker_at = out.find(TRUNCATION_MARKER_PREFIX).unwrap();
        let digits: String = out[marker_at + TRUNCATION_MARKER_PREFIX.len()..]
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        let elided: usize = digits.parse().unwrap();
        assert!(elided > 800);
    }

    #[test]
    fn is_truncated_needs_a_marker_line() {
        assert!(!is_truncated("...[truncated but not really"));
        assert!(!is_truncated("see ...[truncated here and 5 tokens]... there"));
        assert!(!is_truncated("a ...[truncated 5 tokens]... b"));
        assert!(is_truncated("a\n...[truncated 5 tokens]...\nb"));
    }

    #[test]
    fn output_quoting_marker_text_is_still_cut() {
        let accountant = TokenAccountant::default();
        let mut source = String::from("//! Mentions \"...[truncated \" and \" tokens]...\" in docs.\n");
        while source.len() < 35_000 {
            source.push_str("let value = compute(input, offset);\n");
        }
        let mut log = Conversation::from_messages([
            Message::user("task", 0),
            Message::tool_result("c1", "read_file", source, 1),
            Message::user("recent", 2),
        ]);

        let report = truncate_tool_outputs(&mut log, 2000, 1, &accountant);

        assert_eq!(report.truncated_blocks, 1);
        assert!(accountant.estimate_text(output(&log, 1)) <= 2000);
        assert!(is_truncated(output(&log, 1)));
    }

    #[test]
    fn unreachable_cutoff_does_not_recut() {
        let accountant = TokenAccountant::with_calibration(Some(1.0));
        let content = "b".repeat(500);
        let once = head_tail(&content, 3, &accountant).unwrap();
        assert!(head_tail(&once, 3, &accountant).is_none());
    }
}
