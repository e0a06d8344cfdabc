//! Tool-pairing repair for outbound context.
//!
//! Backends reject a tool result whose originating call is not in the
//! context. That happens when a compaction or a window limit cuts between
//! an assistant message and the message answering it. [`sanitize_messages`]
//! strips such orphans before the history leaves the store.

use std::collections::HashSet;

use tracing::debug;

use crate::message::{Message, Role};

/// Drop tool results that reference no earlier tool call in `messages`.
///
/// Walks forward remembering every call id issued by assistant messages. A
/// result is kept only if its id was already seen. A message left with
/// neither results nor any other content is removed entirely.
///
/// Works on plain [`Message`]s and on [`crate::SessionMessage`] rows alike.
pub fn sanitize_messages<T>(messages: Vec<T>) -> Vec<T>
where
    T: AsRef<Message> + AsMut<Message>,
{
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(messages.len());
    let mut stripped = 0usize;

    for mut item in messages {
        let msg = item.as_mut();

        if !msg.tool_results.is_empty() {
            let before = msg.tool_results.len();
            msg.tool_results
                .retain(|r| seen.contains(r.tool_call_id.as_str()));
            let dropped = before - msg.tool_results.len();
            stripped += dropped;

            if msg.tool_results.is_empty() && msg.has_no_other_content() {
                continue;
            }
        }

        if msg.role == Role::Assistant {
            seen.extend(msg.tool_calls.iter().map(|c| c.id.clone()));
        }

        out.push(item);
    }

    if stripped > 0 {
        debug!(stripped, kept = out.len(), "removed orphaned tool results");
    }
    out
}

impl AsRef<Message> for Message {
    fn as_ref(&self) -> &Message {
        self
    }
}

impl AsMut<Message> for Message {
    fn as_mut(&mut self) -> &mut Message {
        self
    }
}
