//! Context compaction: token accounting, the three tiers, failure memory,
//! orchestration and prompt rendering.
//!
//! The tiers are ordered by cost and by how much they lose:
//!
//! 1. **[`truncation`]**: cut oversized tool outputs to head + tail. Local,
//!    cheap, keeps the start and end of every output.
//! 2. **[`eviction`]**: replace old tool outputs with one-line placeholders,
//!    oldest first, until the target is met. No LLM call.
//! 3. **[`summarizer`]**: replace the oldest span of the log with one
//!    LLM-written summary. The only tier that suspends or can fail.
//!
//! [`orchestrator`] runs them in order after measuring with [`budget`];
//! [`failures`] keeps a record of tool failures that outlives all three;
//! [`assembler`] renders the prompt from what is left.

pub mod assembler;
pub mod budget;
pub mod eviction;
pub mod failures;
pub mod orchestrator;
pub mod summarizer;
pub mod truncation;

pub use budget::{DEFAULT_CHARS_PER_TOKEN, Occupancy, TokenAccountant, TokenCount, TokenCounter};
pub use eviction::{PruneReport, prune_tool_outputs};
pub use failures::{FailureCategory, FailureRecord, FailureTracker};
pub use orchestrator::{CompactionOrchestrator, CompactionOutcome, CompactionPhase, CompactionReport};
pub use summarizer::{Summarizer, SummarizerConfig, SummaryReport};
pub use truncation::{TruncationReport, truncate_tool_outputs};
