//! Failure memory that survives compaction.
//!
//! Tool failures are the first thing pruning and summarization throw away,
//! and the thing the agent most needs to remember ("that edit already failed
//! twice"). The tracker keeps a small, bounded set of classified failures
//! outside the conversation log and renders them into the prompt once the log
//! has actually been compacted.
//!
//! Records are keyed by `(tool_name, category)`. Recording the same pair
//! again replaces the old record and moves it to the most recent position;
//! when capacity is exceeded the oldest key is dropped.

use crate::session::CompactionState;
use crate::{BlockKind, ContentBlock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// Default number of records kept.
pub const DEFAULT_FAILURE_CAPACITY: usize = 10;

/// Longest description kept on a record, in characters.
pub const MAX_DESCRIPTION_CHARS: usize = 200;

/// Failure taxonomy. Deterministic and pattern based.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// A string-replace edit did not find its target text.
    EditMismatch,
    FileNotFound,
    /// Test runner reported failures.
    TestFailure,
    /// Compiler or linker errors.
    BuildFailure,
    /// Repeated non-zero exits from the same tool with no build or test
    /// signature: the agent keeps trying something that does not work.
    WrongApproach,
    /// Any other error result.
    ToolError,
}

impl FailureCategory {
    pub fn label(&self) -> &'static str {
        match self {
            Self::EditMismatch => "edit mismatch",
            Self::FileNotFound => "file not found",
            Self::TestFailure => "test failure",
            Self::BuildFailure => "build failure",
            Self::WrongApproach => "wrong approach",
            Self::ToolError => "tool error",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One remembered failure.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FailureRecord {
    pub tool_name: String,
    pub category: FailureCategory,
    /// First informative line of the error, at most
    /// [`MAX_DESCRIPTION_CHARS`] characters.
    pub description: String,
    pub turn: u64,
}

type FailureKey = (String, FailureCategory);

/// Bounded, deduplicated failure memory.
///
/// Storage is an ordered map: `slots` holds the record and its insertion
/// sequence, `order` maps sequence back to key so the oldest entry is the
/// first key of a `BTreeMap`.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    capacity: usize,
    slots: HashMap<FailureKey, (FailureRecord, u64)>,
    order: BTreeMap<u64, FailureKey>,
    next_seq: u64,
    /// Consecutive non-zero exits per tool.
    exit_streaks: HashMap<String, u32>,
    /// Records from turns before this one are no longer in the live log.
    visible_from: u64,
}

impl Default for FailureTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_CAPACITY)
    }
}

impl FailureTracker {
    /// A tracker holding at most `capacity` records (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
            exit_streaks: HashMap::new(),
            visible_from: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Classify and remember a tool error.
    ///
    /// Returns `None` when the error is benign or unclassifiable, and also
    /// when the same failure (same tool, category and description) is already
    /// visible in the live part of the log. In the latter case the stored
    /// record is still refreshed to `turn`.
    pub fn record(
        &mut self,
        tool_name: &str,
        raw_error_text: &str,
        turn: u64,
    ) -> Option<FailureRecord> {
        let Some(mut category) = classify(raw_error_text) else {
            trace!("{tool_name}: error not tracked");
            return None;
        };

        let lower = raw_error_text.to_lowercase();
        if category == FailureCategory::ToolError && is_nonzero_exit(&lower) {
            let streak = self.exit_streaks.entry(tool_name.to_string()).or_insert(0);
            *streak += 1;
            if *streak >= 2 {
                category = FailureCategory::WrongApproach;
            }
        } else {
            self.exit_streaks.remove(tool_name);
        }

        let record = FailureRecord {
            tool_name: tool_name.to_string(),
            category,
            description: describe(raw_error_text),
            turn,
        };
        let key = (record.tool_name.clone(), category);

        let already_visible = self.slots.get(&key).is_some_and(|(prev, _)| {
            prev.description == record.description && prev.turn >= self.visible_from
        });

        self.insert(key, record.clone());
        self.evict_over_capacity();

        if already_visible {
            debug!("{tool_name}: {category} already visible; refreshed to turn {turn}");
            None
        } else {
            debug!("{tool_name}: recorded {category} at turn {turn}");
            Some(record)
        }
    }

    /// Record a tool result block if, and only if, the tool layer flagged it
    /// as an error.
    pub fn record_result(&mut self, block: &ContentBlock, turn: u64) -> Option<FailureRecord> {
        match block.kind() {
            BlockKind::ToolResult {
                tool_name,
                content,
                is_error: true,
                ..
            } => self.record(tool_name, content, turn),
            _ => None,
        }
    }

    /// A tool succeeded: its run of non-zero exits is over.
    pub fn note_success(&mut self, tool_name: &str) {
        self.exit_streaks.remove(tool_name);
    }

    /// Records from turns before `turn` are no longer visible in the log.
    /// Never moves backwards.
    pub fn mark_visible_from(&mut self, turn: u64) {
        self.visible_from = self.visible_from.max(turn);
    }

    /// Snapshot in insertion order, oldest first.
    pub fn recent_failures(&self) -> Vec<FailureRecord> {
        self.order
            .values()
            .filter_map(|key| self.slots.get(key).map(|(record, _)| record.clone()))
            .collect()
    }

    /// The "Recent Failures" prompt section.
    ///
    /// `None` until the log has been compacted at least once, since before
    /// that every failure is still in the live conversation.
    pub fn render_section(&self, state: &CompactionState) -> Option<String> {
        if !state.has_compacted_at_least_once || self.is_empty() {
            return None;
        }
        let mut out = String::from(
            "## Recent Failures\n\
             Earlier tool failures; their raw output may no longer be in the conversation.\n",
        );
        for r in self.recent_failures() {
            out.push_str(&format!(
                "- turn {}: {} ({}): {}\n",
                r.turn, r.tool_name, r.category, r.description
            ));
        }
        Some(out)
    }

    fn insert(&mut self, key: FailureKey, record: FailureRecord) {
        if let Some((_, old_seq)) = self.slots.remove(&key) {
            self.order.remove(&old_seq);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.slots.insert(key, (record, seq));
    }

    fn evict_over_capacity(&mut self) {
        while self.slots.len() > self.capacity {
            let Some((_, key)) = self.order.pop_first() else {
                break;
            };
            if let Some((dropped, _)) = self.slots.remove(&key) {
                debug!(
                    "failure tracker full; dropped {} ({}) from turn {}",
                    dropped.tool_name, dropped.category, dropped.turn
                );
            }
        }
    }
}

// ── Classification ─────────────────────────────────────────────────

const BENIGN_PATTERNS: &[&str] = &[
    "no matches found",
    "no matches",
    "0 matches",
    "no results found",
    "no files found",
];

const EDIT_MISMATCH_PATTERNS: &[&str] = &[
    "old_string not found",
    "old_string was not found",
    "string to replace not found",
    "not found in file",
    "no match for old_string",
    "could not find the text to replace",
    "old_string is not unique",
    "found multiple matches",
];

const FILE_NOT_FOUND_PATTERNS: &[&str] = &[
    "no such file or directory",
    "file not found",
    "enoent",
    "does not exist",
    "cannot find the path",
    "path not found",
];

const TEST_FAILURE_PATTERNS: &[&str] = &[
    "test result: failed",
    "tests failed",
    "failures:",
    "assertion failed",
    "assertionerror",
    "panicked at",
    "failed tests",
    "test failed",
];

const BUILD_FAILURE_PATTERNS: &[&str] = &[
    "error[e",
    "could not compile",
    "compilation failed",
    "build failed",
    "syntaxerror",
    "syntax error",
    "undefined reference",
    "linker",
    "cannot find type",
    "cannot find value",
    "unresolved import",
    "mismatched types",
];

const EXIT_MARKERS: &[&str] = &["exit code", "exit status", "exited with code", "exited with status"];

/// Classify raw error text. `None` for benign or empty output.
///
/// Compiler signatures are checked first since rustc output routinely quotes
/// paths and "not found". Benign phrases only count when nothing else
/// matched, and only as whole words, so "(10 matches)" inside an edit error
/// is not mistaken for "0 matches".
///
/// Non-zero exits without a build or test signature classify as
/// [`FailureCategory::ToolError`] here; the tracker upgrades repeats to
/// [`FailureCategory::WrongApproach`].
pub fn classify(raw_error_text: &str) -> Option<FailureCategory> {
    let lower = raw_error_text.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches(EDIT_MISMATCH_PATTERNS) {
        return Some(FailureCategory::EditMismatch);
    }
    if matches(BUILD_FAILURE_PATTERNS) {
        return Some(FailureCategory::BuildFailure);
    }
    if matches(TEST_FAILURE_PATTERNS) {
        return Some(FailureCategory::TestFailure);
    }
    if matches(FILE_NOT_FOUND_PATTERNS) {
        return Some(FailureCategory::FileNotFound);
    }
    if BENIGN_PATTERNS.iter().any(|p| contains_phrase(&lower, p)) {
        return None;
    }
    Some(FailureCategory::ToolError)
}

/// `phrase` occurs in `text` with no alphanumeric character on either side.
fn contains_phrase(text: &str, phrase: &str) -> bool {
    text.match_indices(phrase).any(|(at, m)| {
        let before = text.get(..at).and_then(|s| s.chars().next_back());
        let after = text.get(at + m.len()..).and_then(|s| s.chars().next());
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// Whether lowercased text reports a non-zero process exit.
fn is_nonzero_exit(lower: &str) -> bool {
    if lower.contains("non-zero exit") || lower.contains("nonzero exit") {
        return true;
    }
    EXIT_MARKERS.iter().any(|marker| {
        lower.match_indices(marker).any(|(at, m)| {
            let code: String = lower[at + m.len()..]
                .trim_start_matches([':', ' ', '='])
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '-')
                .collect();
            !code.is_empty() && code != "0"
        })
    })
}

/// One-line description: the first line mentioning an error, else the first
/// non-empty line, whitespace collapsed and clipped.
fn describe(raw_error_text: &str) -> String {
    let mut lines = raw_error_text.lines().map(str::trim).filter(|l| !l.is_empty());
    let line = raw_error_text
        .lines()
        .map(str::trim)
        .find(|l| l.to_lowercase().contains("error"))
        .or_else(|| lines.next())
        .unwrap_or("");
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= MAX_DESCRIPTION_CHARS {
        collapsed
    } else {
        let cut: String = collapsed.chars().take(MAX_DESCRIPTION_CHARS - 3).collect();
        format!("{cut}...")
    }
}
