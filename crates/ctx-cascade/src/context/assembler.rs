//! Renders the system prompt for the next model call.
//!
//! The prompt is laid out in fixed zones, most stable first so the prefix
//! stays cache friendly:
//! 1. **System template**: never modified.
//! 2. **Recent Failures**: present only after the first compaction.
//! 3. **Conversation Summary**: the running summary, if the log has one.
//! 4. **Conversation**: transcript of the surviving messages.
//!
//! Rendering is pure and runs every turn, whether or not a cycle ran.

use crate::Message;

/// Heading of the summary zone.
pub const SUMMARY_HEADING: &str = "## Conversation Summary";

/// Heading of the transcript zone.
pub const CONVERSATION_HEADING: &str = "## Conversation";

/// Render the prompt.
///
/// `failure_section` is inserted as given (it carries its own
/// `## Recent Failures` heading); `summary` is the inner text of the
/// summary message. Empty zones are left out.
pub fn render(
    system_template: &str,
    failure_section: Option<&str>,
    summary: Option<&str>,
    survivors: &[Message],
) -> String {
    let mut zones: Vec<String> = Vec::with_capacity(4);

    let template = system_template.trim_end();
    if !template.is_empty() {
        zones.push(template.to_string());
    }
    if let Some(section) = failure_section.map(str::trim).filter(|s| !s.is_empty()) {
        zones.push(section.to_string());
    }
    if let Some(summary) = summary.map(str::trim).filter(|s| !s.is_empty()) {
        zones.push(format!("{SUMMARY_HEADING}\n{summary}"));
    }
    if !survivors.is_empty() {
        let transcript: Vec<String> = survivors.iter().map(Message::render).collect();
        zones.push(format!("{CONVERSATION_HEADING}\n{}", transcript.join("\n\n")));
    }

    let mut out = zones.join("\n\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContentBlock;

    #[test]
    fn renders_all_zones_in_order() {
        let survivors = vec![
            Message::user("Run the tests", 5),
            Message::assistant(vec![ContentBlock::tool_call("c1", "shell", r#"{"cmd":"cargo test"}"#)], 5),
            Message::tool_error("c1", "shell", "test result: FAILED", 5),
        ];
        let out = render(
            "You are a coding agent.",
            Some("## Recent Failures\n- turn 3: edit (edit mismatch): old_string not found\n"),
            Some("## Task State\nFixing the parser."),
            &survivors,
        );

        let template = out.find("You are a coding agent.").unwrap();
        let failures = out.find("## Recent Failures").unwrap();
        let summary = out.find(SUMMARY_HEADING).unwrap();
        let conversation = out.find("## Conversation\n").unwrap();
        assert!(template < failures && failures < summary && summary < conversation);
        assert!(out.contains("[user]: Run the tests"));
        assert!(out.contains("-> shell("));
        assert!(out.contains("<- shell [error]: test result: FAILED"));
    }

    #[test]
    fn empty_zones_are_omitted() {
        let out = render("System.", None, None, &[]);
        assert_eq!(out, "System.\n");

        let out = render("System.", Some("  "), Some(""), &[Message::user("hi", 0)]);
        assert!(!out.contains(SUMMARY_HEADING));
        assert!(out.contains("## Conversation\n[user]: hi"));
    }

    #[test]
    fn pure_and_deterministic() {
        let survivors = vec![Message::user("a", 0)];
        assert_eq!(
            render("t", None, Some("s"), &survivors),
            render("t", None, Some("s"), &survivors)
        );
    }
}
