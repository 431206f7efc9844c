//! Context compression
//!
//! When a request's estimated input exceeds the compression threshold, old
//! turns are folded into a summary so the conversation still fits upstream.
//! Tool-mode requests never compress (dropping tool context breaks the
//! tool-use/tool-result pairing) and are rejected instead.

use crate::core::tokenizer::budget_estimate;

/// A role/content pair independent of the inbound dialect
#[derive(Debug, Clone)]
pub struct PlainMessage {
    pub role: String,
    pub content: String,
}

/// Number of recent turns preserved verbatim
const KEEP_RECENT: usize = 5;

/// Estimated token budget of a message list. Stops early once the limit is
/// crossed so huge payloads are not fully tokenized.
pub fn estimate_total(messages: &[PlainMessage], limit: usize) -> usize {
    let mut total = 0;
    for msg in messages {
        total += budget_estimate(&msg.content);
        if total > limit {
            break;
        }
    }
    total
}

/// Compress a message list under the token limit.
///
/// System messages are always kept; older non-system turns collapse into a
/// single summary message; the last `KEEP_RECENT` turns stay verbatim.
pub fn compress_messages(messages: Vec<PlainMessage>, max_tokens: usize) -> Vec<PlainMessage> {
    if messages.is_empty() {
        return messages;
    }
    if estimate_total(&messages, max_tokens) <= max_tokens {
        return messages;
    }

    let (system_msgs, other_msgs): (Vec<_>, Vec<_>) =
        messages.into_iter().partition(|m| m.role == "system");

    if other_msgs.len() <= KEEP_RECENT {
        let mut out = system_msgs;
        out.extend(other_msgs);
        return out;
    }

    let split = other_msgs.len() - KEEP_RECENT;
    let (old_msgs, recent_msgs) = other_msgs.split_at(split);

    let summary = create_summary(old_msgs);
    let mut out = system_msgs;
    out.push(PlainMessage {
        role: "system".to_string(),
        content: summary,
    });
    out.extend_from_slice(recent_msgs);
    out
}

fn create_summary(messages: &[PlainMessage]) -> String {
    let mut parts = Vec::with_capacity(messages.len());
    for msg in messages {
        let preview: String = msg.content.chars().take(150).collect();
        let ellipsis = if msg.content.chars().count() > 150 {
            "..."
        } else {
            ""
        };
        parts.push(format!("- {}: {}{}", msg.role, preview, ellipsis));
    }
    format!(
        "Summary of the earlier conversation ({} messages compressed to save context space):\n\n{}\n\nContinue the conversation based on this summary.",
        messages.len(),
        parts.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> PlainMessage {
        PlainMessage {
            role: role.into(),
            content: content.into(),
        }
    }

    #[test]
    fn test_under_limit_untouched() {
        let messages = vec![msg("user", "hi"), msg("assistant", "hello")];
        let out = compress_messages(messages.clone(), 1000);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_over_limit_compresses_old_turns() {
        let big = "word ".repeat(30_000); // crosses the short-circuit path
        let mut messages = vec![msg("system", "rules")];
        for i in 0..10 {
            messages.push(msg("user", &format!("{} question {}", big, i)));
            messages.push(msg("assistant", &format!("answer {}", i)));
        }

        let out = compress_messages(messages, 10_000);
        // system + summary + 5 recent
        assert_eq!(out.len(), 7);
        assert_eq!(out[0].role, "system");
        assert_eq!(out[1].role, "system");
        assert!(out[1].content.contains("compressed"));
    }

    #[test]
    fn test_few_messages_kept_even_over_limit() {
        let big = "a".repeat(100_000);
        let messages = vec![msg("user", &big), msg("assistant", "ok")];
        let out = compress_messages(messages, 10);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_estimate_stops_early() {
        let big = "a".repeat(50_000);
        let messages: Vec<_> = (0..100).map(|_| msg("user", &big)).collect();
        let total = estimate_total(&messages, 60_000);
        // stopped after crossing the limit rather than summing all 100
        assert!(total >= 60_000);
        assert!(total < 50_000 * 100);
    }
}
