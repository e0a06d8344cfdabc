//! Context shaping -- keep the outbound context within a backend's budget.
//!
//! Three cheap tools, used by the runner on every turn:
//!
//! 1. [`estimate_tokens`] approximates size as characters / 4.
//! 2. [`synthesize_summary`] condenses the user side of messages about to be
//!    compacted into a summary the store keeps on the session.
//! 3. [`truncate_tool_results`] caps tool-result bodies outside the most
//!    recent messages so one huge output cannot crowd out the conversation.

use steward_store::{Message, Role};

/// Characters per estimated token.
const CHARS_PER_TOKEN: usize = 4;

/// Longest excerpt of a single user message kept in a summary.
const SUMMARY_EXCERPT_CHARS: usize = 200;

/// Upper bound on a synthesized summary.
const SUMMARY_MAX_CHARS: usize = 4_000;

// ---------------------------------------------------------------------------
// Estimation
// ---------------------------------------------------------------------------

/// Rough token count for `messages`.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    let chars: usize = messages.iter().map(Message::char_len).sum();
    chars.div_ceil(CHARS_PER_TOKEN)
}

// ---------------------------------------------------------------------------
// Summaries
// ---------------------------------------------------------------------------

/// Build a compaction summary from the user-authored messages in `messages`.
///
/// A previous summary is carried forward so repeated compactions do not lose
/// what earlier ones recorded.
pub fn synthesize_summary(previous: Option<&str>, messages: &[Message]) -> String {
    let mut out = format!("[Conversation summary of {} earlier messages]", messages.len());

    if let Some(prev) = previous.map(str::trim).filter(|p| !p.is_empty()) {
        out.push_str("\nPreviously: ");
        out.push_str(&excerpt(prev, SUMMARY_MAX_CHARS / 2));
    }

    let requests: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.trim())
        .filter(|c| !c.is_empty())
        .map(|c| excerpt(c, SUMMARY_EXCERPT_CHARS))
        .collect();

    if !requests.is_empty() {
        out.push_str("\nThe user asked:");
        for request in requests {
            if out.len() + request.len() + 3 > SUMMARY_MAX_CHARS {
                out.push_str("\n- ...");
                break;
            }
            out.push_str("\n- ");
            out.push_str(&request);
        }
    }
    out
}

/// System message carrying a session summary at the head of the context.
pub fn summary_message(summary: &str) -> Message {
    Message::system(format!("Summary of the conversation so far:\n{summary}"))
}

// ---------------------------------------------------------------------------
// Truncation
// ---------------------------------------------------------------------------

/// Cap tool-result bodies in all but the newest `keep_full` messages.
///
/// Truncated bodies keep their first `cap` characters followed by a
/// `[truncated N chars]` marker. Returns the number of bodies truncated.
pub fn truncate_tool_results(messages: &mut [Message], keep_full: usize, cap: usize) -> usize {
    let older = messages.len().saturating_sub(keep_full);
    let mut truncated = 0;

    for msg in &mut messages[..older] {
        for result in &mut msg.tool_results {
            let total = result.content.chars().count();
            if total <= cap {
                continue;
            }
            let kept: String = result.content.chars().take(cap).collect();
            result.content = format!("{kept}\n[truncated {} chars]", total - cap);
            truncated += 1;
        }
    }
    truncated
}

/// Assemble the outbound context: summary, stored window, then messages that
/// could not be persisted, with older tool output capped.
pub fn assemble(
    summary: Option<&str>,
    window: Vec<Message>,
    carried: impl IntoIterator<Item = Message>,
    keep_full: usize,
    cap: usize,
) -> Vec<Message> {
    let mut messages: Vec<Message> = window.into_iter().chain(carried).collect();
    messages = steward_store::sanitize_messages(messages);
    truncate_tool_results(&mut messages, keep_full, cap);

    if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
        messages.insert(0, summary_message(summary));
    }
    messages
}

fn excerpt(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max).collect();
    cut.push_str("...");
    cut
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
