//! Tool-call pairing checks for message histories.
//!
//! Providers reject a history in which an assistant tool call is not answered by
//! the very next message. The agent runs [`validate`] (or [`repair`], depending on
//! its [`HistoryPolicy`]) before every model call so a malformed history is caught
//! locally instead of surfacing as an opaque HTTP 400.

use crate::error::{AgentError, Result};
use crate::message::{Message, Role};

/// What to do with a history that breaks tool-call pairing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HistoryPolicy {
    /// Fail the run with [`AgentError::InvalidHistory`].
    #[default]
    Reject,
    /// Drop dangling tool calls and orphan tool results, then continue.
    Repair,
}

fn invalid(index: usize, reason: impl Into<String>) -> AgentError {
    AgentError::InvalidHistory {
        index,
        reason: reason.into(),
    }
}

/// Checks that every tool call is immediately followed by its matching tool result
/// and that no tool result appears on its own.
pub fn validate(messages: &[Message]) -> Result<()> {
    let mut index = 0;
    while index < messages.len() {
        let message = &messages[index];

        if let Some(call) = &message.tool_call {
            if message.role != Role::Assistant {
                return Err(invalid(
                    index,
                    format!("tool call `{}` attached to a {:?} message", call.name, message.role),
                ));
            }
            let call_id = call.id.as_deref().ok_or_else(|| {
                invalid(index, format!("tool call `{}` has no call id", call.name))
            })?;
            let Some(next) = messages.get(index + 1) else {
                return Err(invalid(
                    index,
                    format!("tool call `{}` ({call_id}) is not followed by a tool response", call.name),
                ));
            };
            if next.role != Role::Tool {
                return Err(invalid(
                    index + 1,
                    format!(
                        "expected tool response for `{}` ({call_id}), found a {:?} message",
                        call.name, next.role
                    ),
                ));
            }
            let answered = next
                .tool_result
                .as_ref()
                .and_then(|result| result.tool_call_id.as_deref());
            if answered != Some(call_id) {
                return Err(invalid(
                    index + 1,
                    format!(
                        "tool response answers `{}` but the preceding call is `{call_id}`",
                        answered.unwrap_or("<none>")
                    ),
                ));
            }
            index += 2;
            continue;
        }

        if message.role == Role::Tool {
            return Err(invalid(
                index,
                "tool response without a preceding tool call",
            ));
        }

        index += 1;
    }
    Ok(())
}

fn is_answered_by(call: &Message, next: Option<&Message>) -> bool {
    let Some(call_id) = call.tool_call.as_ref().and_then(|c| c.id.as_deref()) else {
        return false;
    };
    call.role == Role::Assistant
        && next.is_some_and(|next| {
            next.role == Role::Tool
                && next
                    .tool_result
                    .as_ref()
                    .and_then(|result| result.tool_call_id.as_deref())
                    == Some(call_id)
        })
}

/// Returns a copy of `messages` with unpaired tool calls and tool results removed,
/// along with the number of messages dropped.
pub fn repair(messages: &[Message]) -> (Vec<Message>, usize) {
    let mut kept = Vec::with_capacity(messages.len());
    let mut index = 0;
    while index < messages.len() {
        let message = &messages[index];
        if message.tool_call.is_some() {
            if is_answered_by(message, messages.get(index + 1)) {
                kept.push(message.clone());
                kept.push(messages[index + 1].clone());
                index += 2;
            } else {
                index += 1;
            }
            continue;
        }
        if message.role != Role::Tool {
            kept.push(message.clone());
        }
        index += 1;
    }
    let dropped = messages.len() - kept.len();
    (kept, dropped)
}

/// Applies `policy` to `messages`, returning the history that may be sent.
pub fn enforce(policy: HistoryPolicy, messages: Vec<Message>) -> Result<Vec<Message>> {
    match policy {
        HistoryPolicy::Reject => {
            validate(&messages)?;
            Ok(messages)
        }
        HistoryPolicy::Repair => {
            let (repaired, dropped) = repair(&messages);
            if dropped > 0 {
                tracing::warn!(dropped, "dropped unpaired tool messages from history");
            }
            Ok(repaired)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;
    use serde_json::json;

    fn call(id: &str) -> Message {
        Message::tool_call(ToolCall {
            id: Some(id.into()),
            name: "get_shipping_info".into(),
            arguments: json!({}),
        })
    }

    fn answer(id: &str) -> Message {
        Message::tool("get_shipping_info", json!("Shipped on 2024-12-01"), Some(id.into()))
    }

    #[test]
    fn accepts_paired_history() {
        let history = vec![
            Message::user("where is my order?"),
            call("call_1"),
            answer("call_1"),
            Message::assistant("It shipped."),
        ];
        assert!(validate(&history).is_ok());
    }

    #[test]
    fn rejects_dangling_tool_call() {
        let history = vec![
            Message::user("where is my order?"),
            call("call_1"),
            Message::user("what was my previous question?"),
        ];
        let err = validate(&history).unwrap_err();
        match err {
            AgentError::InvalidHistory { index, reason } => {
                assert_eq!(index, 2);
                assert!(reason.contains("call_1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_trailing_tool_call() {
        let history = vec![Message::user("hi"), call("call_1")];
        assert!(matches!(
            validate(&history),
            Err(AgentError::InvalidHistory { index: 1, .. })
        ));
    }

    #[test]
    fn rejects_mismatched_call_id() {
        let history = vec![call("call_1"), answer("call_2")];
        let err = validate(&history).unwrap_err();
        assert!(err.to_string().contains("call_2"));
    }

    #[test]
    fn rejects_orphan_tool_response() {
        let history = vec![Message::user("hi"), answer("call_1")];
        assert!(matches!(
            validate(&history),
            Err(AgentError::InvalidHistory { index: 1, .. })
        ));
    }

    #[test]
    fn rejects_call_without_id() {
        let mut message = call("call_1");
        message.tool_call.as_mut().unwrap().id = None;
        let history = vec![message, answer("call_1")];
        assert!(validate(&history).is_err());
    }

    #[test]
    fn repair_drops_unpaired_messages() {
        let history = vec![
            Message::user("first"),
            call("call_1"),
            Message::assistant("interrupted"),
            answer("call_9"),
            call("call_2"),
            answer("call_2"),
        ];
        let (repaired, dropped) = repair(&history);
        assert_eq!(dropped, 2);
        assert_eq!(repaired.len(), 4);
        assert!(validate(&repaired).is_ok());
    }

    #[test]
    fn enforce_follows_policy() {
        let history = vec![Message::user("hi"), call("call_1")];
        assert!(enforce(HistoryPolicy::Reject, history.clone()).is_err());
        let repaired = enforce(HistoryPolicy::Repair, history).unwrap();
        assert_eq!(repaired, vec![Message::user("hi")]);
    }
}
