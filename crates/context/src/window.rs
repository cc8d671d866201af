//! Rolling-window truncation and defensive pruning.

use ghost_domain::chat::{Message, Role};

use crate::tokens::TokenEstimator;

/// Tokens reserved for the model's own output when pruning.
const SAFETY_BUFFER: usize = 500;

/// Characters of the surviving tool result after an emergency prune.
const EMERGENCY_TOOL_CAP: usize = 1000;

fn msg_tokens(est: &dyn TokenEstimator, msg: &Message) -> usize {
    est.estimate(msg.text())
}

/// Pure sliding window: every system message survives verbatim, then the
/// non-system tail is walked newest-to-oldest and included while the
/// cumulative estimate stays within budget. Historical strings are never
/// mutated; old messages are only dropped.
pub fn rolling_window(
    messages: &[Message],
    max_tokens: usize,
    est: &dyn TokenEstimator,
) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }

    let system_msgs: Vec<Message> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .cloned()
        .collect();

    let mut used: usize = system_msgs.iter().map(|m| msg_tokens(est, m)).sum();
    let mut tail: Vec<Message> = Vec::new();

    for msg in messages.iter().rev().filter(|m| m.role != Role::System) {
        let cost = msg_tokens(est, msg);
        if used + cost > max_tokens {
            break;
        }
        tail.push(msg.clone());
        used += cost;
    }
    tail.reverse();

    let mut out = system_msgs;
    out.extend(tail);
    out
}

/// Defensive prune applied before every upstream call.
///
/// Guarantees: all system messages kept, the most recent user message
/// kept, a 500-token safety buffer reserved, the remaining budget filled
/// with recent history in reverse chronological order, and a strictly
/// chronological result.
pub fn prune(messages: &[Message], max_tokens: usize, est: &dyn TokenEstimator) -> Vec<Message> {
    let total: usize = messages.iter().map(|m| msg_tokens(est, m)).sum();
    if total < max_tokens {
        return messages.to_vec();
    }

    tracing::info!(from = total, to = max_tokens, "pruning context");

    let system_msgs: Vec<Message> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .cloned()
        .collect();
    let last_user_idx = messages.iter().rposition(|m| m.role == Role::User);

    let mut base: usize = system_msgs.iter().map(|m| msg_tokens(est, m)).sum();
    if let Some(idx) = last_user_idx {
        base += msg_tokens(est, &messages[idx]);
    }

    if (base + SAFETY_BUFFER) > max_tokens {
        let mut out = system_msgs;
        if let Some(idx) = last_user_idx {
            out.push(messages[idx].clone());
        }
        return out;
    }
    let mut remaining = max_tokens - base - SAFETY_BUFFER;

    // Newest first; the last user message rides along for free since its
    // budget is already reserved.
    let mut kept_rev: Vec<&Message> = Vec::new();
    for (idx, msg) in messages.iter().enumerate().rev() {
        if msg.role == Role::System {
            continue;
        }
        if Some(idx) == last_user_idx {
            kept_rev.push(msg);
            continue;
        }
        let cost = msg_tokens(est, msg);
        if remaining >= cost {
            kept_rev.push(msg);
            remaining -= cost;
        } else {
            break;
        }
    }

    let mut out = system_msgs;
    out.extend(kept_rev.into_iter().rev().cloned());
    out
}

/// Last-resort recovery after the upstream rejects the prompt for length:
/// keep system messages, the last user message, and at most one heavily
/// truncated tool result, then append a truncation notice. The caller
/// retries exactly once with the result.
pub fn emergency_prune(messages: &[Message], last_tool: Option<&Message>) -> Vec<Message> {
    let mut out: Vec<Message> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .cloned()
        .collect();

    if let Some(last_user) = messages.iter().rev().find(|m| m.role == Role::User) {
        out.push(last_user.clone());
    }

    if let Some(tool) = last_tool {
        let mut kept = tool.clone();
        let text = kept.text();
        if text.len() > EMERGENCY_TOOL_CAP {
            let cut = crate::shrink::floor_char_boundary(text, EMERGENCY_TOOL_CAP);
            let truncated = format!("{}\n... [EMERGENCY TRUNCATION] ...", &text[..cut]);
            kept.set_text(truncated);
        }
        out.push(kept);
    }

    out.push(Message::user(
        "SYSTEM ALERT: The conversation history was truncated to fit within \
         context limits. Continue task. Assume previous context has been handled.",
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::CharEstimator;

    fn msgs(specs: &[(&str, &str)]) -> Vec<Message> {
        specs
            .iter()
            .map(|(role, text)| match *role {
                "system" => Message::system(*text),
                "user" => Message::user(*text),
                "assistant" => Message::assistant(*text),
                _ => Message::tool_result("c1", "t", *text),
            })
            .collect()
    }

    #[test]
    fn rolling_window_keeps_system_and_recent_tail() {
        let history = msgs(&[
            ("system", "sys"),
            ("user", "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            ("assistant", "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"),
            ("user", "ccc"),
        ]);
        let out = rolling_window(&history, 5, &CharEstimator);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, Role::System);
        assert_eq!(out[1].text(), "ccc");
    }

    #[test]
    fn rolling_window_is_monotone_in_budget() {
        // For m1 <= m2 the smaller window is a subsequence of the larger.
        let history = msgs(&[
            ("system", "sys"),
            ("user", "111111111"),
            ("assistant", "222222222"),
            ("user", "333333333"),
            ("assistant", "444444444"),
        ]);
        for m1 in 0..30 {
            for m2 in m1..30 {
                let small = rolling_window(&history, m1, &CharEstimator);
                let large = rolling_window(&history, m2, &CharEstimator);
                let mut it = large.iter();
                for msg in &small {
                    assert!(
                        it.any(|l| l.text() == msg.text()),
                        "window({m1}) not a subsequence of window({m2})"
                    );
                }
            }
        }
    }

    #[test]
    fn prune_noop_under_budget() {
        let history = msgs(&[("system", "s"), ("user", "hello")]);
        let out = prune(&history, 10_000, &CharEstimator);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn prune_keeps_first_system_and_last_user() {
        // Order preserved, first system + last user always present.
        let mut history = msgs(&[("system", "sys prompt")]);
        for i in 0..50 {
            history.push(Message::user(format!("question number {i} padding padding")));
            history.push(Message::assistant(format!("answer number {i} padding padding")));
        }
        let out = prune(&history, 100, &CharEstimator);
        assert_eq!(out[0].role, Role::System);
        let last_user_text = history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .unwrap()
            .text()
            .to_string();
        assert!(out.iter().any(|m| m.text() == last_user_text));

        // Retained non-system messages appear in their original order.
        let order: Vec<&str> = out
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| m.text())
            .collect();
        let mut source = history.iter().filter(|m| m.role != Role::System);
        for text in order {
            assert!(source.any(|m| m.text() == text), "order violated at {text}");
        }
    }

    #[test]
    fn prune_degenerate_budget_returns_system_plus_user() {
        let history = msgs(&[
            ("system", "a very long system prompt that dominates the budget"),
            ("user", "short"),
            ("assistant", "reply"),
            ("user", "final question"),
        ]);
        let out = prune(&history, 1, &CharEstimator);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, Role::System);
        assert_eq!(out[1].text(), "final question");
    }

    #[test]
    fn emergency_prune_shape() {
        let history = msgs(&[
            ("system", "sys"),
            ("user", "do the thing"),
            ("assistant", "working"),
        ]);
        let big = "x".repeat(5000);
        let tool = Message::tool_result("c9", "execute", big);
        let out = emergency_prune(&history, Some(&tool));

        assert_eq!(out[0].role, Role::System);
        assert_eq!(out[1].text(), "do the thing");
        assert_eq!(out[2].role, Role::Tool);
        assert!(out[2].text().contains("[EMERGENCY TRUNCATION]"));
        assert!(out[2].text().len() < 1100);
        assert_eq!(out.last().unwrap().role, Role::User);
        assert!(out.last().unwrap().text().contains("truncated"));
    }
}
