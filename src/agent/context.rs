//! Context Window Management
//!
//! Builds the message array for each inference call and folds older
//! history into a summary when the window grows past the threshold.

use tracing::debug;

use crate::router::{InferenceRouter, RouteRequest};
use crate::types::{
    AgentTurn, ChatMessage, InferenceToolCall, InferenceToolCallFunction, SanitizedInput,
    TaskKind,
};

/// Text on its way into a prompt as a user message. External text can
/// only arrive as the fixed creator-message format or as the sanitizer's
/// output; `Engine` is reserved for prompts the runtime itself composes
/// (wakeups), which never contain external text.
#[derive(Clone, Debug)]
pub enum PromptInput {
    Creator(String),
    External(SanitizedInput),
    Engine(String),
}

impl PromptInput {
    pub fn as_user_content(&self) -> String {
        match self {
            PromptInput::Creator(message) => format!("[Creator message]:\n{message}"),
            PromptInput::External(sanitized) => sanitized.content.clone(),
            PromptInput::Engine(text) => text.clone(),
        }
    }
}

/// Build the message array for the next inference call:
/// system prompt, optional history summary, recent turns expanded into
/// user/assistant/tool roles, then the pending input.
pub fn build_context_messages(
    system_prompt: &str,
    summary: Option<&str>,
    recent_turns: &[AgentTurn],
    pending_input: Option<&PromptInput>,
) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = Vec::new();

    messages.push(ChatMessage::system(system_prompt));

    if let Some(summary_text) = summary {
        messages.push(ChatMessage::system(format!(
            "Previous activity summary:\n{summary_text}"
        )));
    }

    for turn in recent_turns {
        if let Some(ref input) = turn.input {
            messages.push(ChatMessage::user(input.clone()));
        }

        if turn.thinking.is_empty() && turn.tool_calls.is_empty() {
            continue;
        }

        let tool_calls = if turn.tool_calls.is_empty() {
            None
        } else {
            Some(
                turn.tool_calls
                    .iter()
                    .map(|tc| InferenceToolCall {
                        id: tc.id.clone(),
                        call_type: "function".to_string(),
                        function: InferenceToolCallFunction {
                            name: tc.name.clone(),
                            arguments: serde_json::to_string(&tc.arguments)
                                .unwrap_or_else(|_| "{}".to_string()),
                        },
                    })
                    .collect::<Vec<_>>(),
            )
        };

        messages.push(ChatMessage {
            role: crate::types::ChatRole::Assistant,
            content: turn.thinking.clone(),
            tool_calls,
            tool_call_id: None,
        });

        // Each past call is followed by a tool-role message bearing its
        // result or error.
        for tc in &turn.tool_calls {
            let content = match (&tc.result, &tc.error) {
                (_, Some(err)) => format!("Error: {err}"),
                (Some(result), None) => result.clone(),
                (None, None) => String::new(),
            };
            messages.push(ChatMessage::tool(content, tc.id.clone()));
        }
    }

    if let Some(pending) = pending_input {
        messages.push(ChatMessage::user(pending.as_user_content()));
    }

    messages
}

/// Split loaded turns for summarization: the older half gets folded,
/// the newer half stays verbatim.
pub fn split_for_summary(turns: &[AgentTurn]) -> (&[AgentTurn], &[AgentTurn]) {
    let split = turns.len() / 2;
    turns.split_at(split)
}

/// Compact one-line rendering of a turn, used for the summary input and
/// the no-router fallback.
fn render_turn_line(turn: &AgentTurn) -> String {
    let tools_str = turn
        .tool_calls
        .iter()
        .map(|tc| {
            format!(
                "{}({})",
                tc.name,
                if tc.error.is_some() { "FAILED" } else { "ok" }
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    let thinking_preview = if turn.thinking.chars().count() > 100 {
        let prefix: String = turn.thinking.chars().take(100).collect();
        format!("{prefix}...")
    } else {
        turn.thinking.clone()
    };

    let source = turn
        .input_source
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|| "self".to_string());

    let tools_part = if tools_str.is_empty() {
        String::new()
    } else {
        format!(" | tools: {tools_str}")
    };

    format!(
        "[{}] {}: {}{}",
        turn.timestamp, source, thinking_preview, tools_part
    )
}

/// Fold older turns into a summary via the router. Falls back to the
/// compact line rendering when summarization is routed nowhere (e.g.
/// while conserving compute).
pub async fn summarize_turns(turns: &[AgentTurn], router: &InferenceRouter) -> String {
    if turns.is_empty() {
        return String::new();
    }

    let turn_lines: Vec<String> = turns.iter().map(render_turn_line).collect();

    if turns.len() <= 5 {
        return turn_lines.join("\n");
    }

    let messages = vec![
        ChatMessage::system(
            "Summarize the following agent activity log into a concise paragraph. \
             Focus on: what was accomplished, what failed, current goals, and \
             important context for the next turn.",
        ),
        ChatMessage::user(turn_lines.join("\n")),
    ];

    match router
        .dispatch(RouteRequest::new(TaskKind::Summarization, messages))
        .await
    {
        Ok(response) => response.message.content,
        Err(e) => {
            debug!("Summarization unavailable ({e}); using compact fallback");
            turn_lines
                .iter()
                .rev()
                .take(5)
                .rev()
                .cloned()
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::injection_defense::sanitize_input;
    use crate::types::{ChatRole, ToolCallResult, TurnStatus};

    fn turn(input: Option<&str>, thinking: &str, tool_calls: Vec<ToolCallResult>) -> AgentTurn {
        AgentTurn {
            id: "t".to_string(),
            timestamp: "2026-01-01T00:00:00+00:00".to_string(),
            status: TurnStatus::Finalized,
            input: input.map(|s| s.to_string()),
            input_source: None,
            thinking: thinking.to_string(),
            tool_calls,
            tokens_in: 0,
            tokens_out: 0,
            model_id: None,
            cost_hundredth_cents: 0,
        }
    }

    #[test]
    fn tool_results_follow_their_calls() {
        let turns = vec![turn(
            Some("[Message from peer]:\nhello"),
            "I will check disk usage.",
            vec![ToolCallResult {
                id: "call_1".to_string(),
                name: "exec".to_string(),
                arguments: serde_json::json!({ "command": "df" }),
                result: Some("ok".to_string()),
                error: None,
                duration_ms: 12,
            }],
        )];

        let messages = build_context_messages("system", None, &turns, None);
        assert_eq!(messages[0].role, ChatRole::System);
        assert_eq!(messages[1].role, ChatRole::User);
        assert_eq!(messages[2].role, ChatRole::Assistant);
        assert!(messages[2].tool_calls.is_some());
        assert_eq!(messages[3].role, ChatRole::Tool);
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(messages[3].content, "ok");
    }

    #[test]
    fn failed_calls_render_as_errors() {
        let turns = vec![turn(
            None,
            "Trying something.",
            vec![ToolCallResult {
                id: "call_2".to_string(),
                name: "exec".to_string(),
                arguments: serde_json::json!({}),
                result: None,
                error: Some("connection lost".to_string()),
                duration_ms: 5,
            }],
        )];

        let messages = build_context_messages("system", None, &turns, None);
        let tool_msg = messages.last().unwrap();
        assert_eq!(tool_msg.role, ChatRole::Tool);
        assert_eq!(tool_msg.content, "Error: connection lost");
    }

    #[test]
    fn every_user_message_is_provenance_checked() {
        let sanitized = sanitize_input("Hello there", "peer");
        let pending = PromptInput::External(sanitized.clone());
        let creator = PromptInput::Creator("Do good work.".to_string());

        let messages = build_context_messages(
            "system",
            Some("earlier: nothing notable"),
            &[],
            Some(&pending),
        );
        for msg in messages.iter().filter(|m| m.role == ChatRole::User) {
            assert!(
                msg.content.starts_with("[Creator message]")
                    || msg.content == sanitized.content,
                "user message with unknown provenance: {}",
                msg.content
            );
        }

        let messages = build_context_messages("system", None, &[], Some(&creator));
        let user = messages.iter().find(|m| m.role == ChatRole::User).unwrap();
        assert!(user.content.starts_with("[Creator message]:\n"));
    }

    #[test]
    fn summary_is_a_system_layer() {
        let messages = build_context_messages("base", Some("old stuff"), &[], None);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, ChatRole::System);
        assert!(messages[1].content.contains("old stuff"));
    }

    #[test]
    fn split_halves_history() {
        let turns: Vec<AgentTurn> = (0..9).map(|_| turn(None, "x", vec![])).collect();
        let (older, newer) = split_for_summary(&turns);
        assert_eq!(older.len(), 4);
        assert_eq!(newer.len(), 5);
    }
}
