//! HTTP Inference Provider
//!
//! Wraps an OpenAI-compatible /v1/chat/completions endpoint. Errors are
//! classified so the router can tell retryable failures from permanent
//! ones; no raw provider error text ever reaches a prompt.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::types::{
    ChatMessage, ChatRole, InferenceError, InferenceOptions, InferenceProvider,
    InferenceResponse, InferenceToolCall, InferenceToolCallFunction, TokenUsage,
};

/// Inference client for OpenAI-compatible chat completions.
pub struct HttpInferenceProvider {
    api_url: String,
    api_key: String,
    http: Client,
}

impl HttpInferenceProvider {
    /// * `api_url` - Base URL for the inference API.
    /// * `api_key` - Authorization header value.
    pub fn new(api_url: String, api_key: String) -> Self {
        Self {
            api_url,
            api_key,
            http: Client::new(),
        }
    }
}

#[async_trait]
impl InferenceProvider for HttpInferenceProvider {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        options: InferenceOptions,
    ) -> Result<InferenceResponse, InferenceError> {
        let model = options.model.clone().unwrap_or_default();

        let formatted_messages: Vec<Value> = messages.iter().map(format_message).collect();

        let mut body = serde_json::json!({
            "model": model,
            "messages": formatted_messages,
            "stream": false,
        });

        // Newer models use max_completion_tokens.
        let uses_completion_tokens = model.starts_with("o4")
            || model.starts_with("o3")
            || model.starts_with("gpt-5")
            || model.starts_with("gpt-4.1");

        if let Some(limit) = options.max_tokens {
            if uses_completion_tokens {
                body["max_completion_tokens"] = serde_json::json!(limit);
            } else {
                body["max_tokens"] = serde_json::json!(limit);
            }
        }

        if let Some(temp) = options.temperature {
            body["temperature"] = serde_json::json!(temp);
        }

        if let Some(ref tool_defs) = options.tools {
            if !tool_defs.is_empty() {
                body["tools"] = serde_json::json!(tool_defs);
                body["tool_choice"] = serde_json::json!("auto");
            }
        }

        let url = format!("{}/v1/chat/completions", self.api_url);
        let resp = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Authorization", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Network(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(InferenceError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(InferenceError::Http {
                status: status.as_u16(),
                message: text,
            });
        }

        let data: Value = resp
            .json()
            .await
            .map_err(|e| InferenceError::Malformed(e.to_string()))?;

        parse_completion(&data, &model)
    }
}

/// Decode a chat-completions body into an `InferenceResponse`.
fn parse_completion(data: &Value, requested_model: &str) -> Result<InferenceResponse, InferenceError> {
    let choice = data["choices"]
        .get(0)
        .ok_or_else(|| InferenceError::Malformed("no completion choice returned".into()))?;

    let message = &choice["message"];

    let usage = TokenUsage {
        prompt_tokens: data["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
        completion_tokens: data["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        total_tokens: data["usage"]["total_tokens"].as_u64().unwrap_or(0),
    };

    let tool_calls: Option<Vec<InferenceToolCall>> = message["tool_calls"].as_array().map(|tcs| {
        tcs.iter()
            .map(|tc| InferenceToolCall {
                id: tc["id"].as_str().unwrap_or("").to_string(),
                call_type: "function".to_string(),
                function: InferenceToolCallFunction {
                    name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                    arguments: tc["function"]["arguments"]
                        .as_str()
                        .unwrap_or("{}")
                        .to_string(),
                },
            })
            .collect()
    });

    let role = match message["role"].as_str().unwrap_or("assistant") {
        "system" => ChatRole::System,
        "user" => ChatRole::User,
        "tool" => ChatRole::Tool,
        _ => ChatRole::Assistant,
    };

    let response_message = ChatMessage {
        role,
        content: message["content"].as_str().unwrap_or("").to_string(),
        tool_calls: tool_calls.clone(),
        tool_call_id: message["tool_call_id"].as_str().map(|s| s.to_string()),
    };

    Ok(InferenceResponse {
        id: data["id"].as_str().unwrap_or("").to_string(),
        model: data["model"].as_str().unwrap_or(requested_model).to_string(),
        message: response_message,
        tool_calls,
        usage,
        finish_reason: choice["finish_reason"].as_str().unwrap_or("stop").to_string(),
    })
}

/// Format a ChatMessage into the JSON shape the endpoint expects.
fn format_message(msg: &ChatMessage) -> Value {
    let role = match msg.role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    };

    let mut formatted = serde_json::json!({
        "role": role,
        "content": msg.content,
    });

    if let Some(ref tool_calls) = msg.tool_calls {
        let tc_json: Vec<Value> = tool_calls
            .iter()
            .map(|tc| {
                serde_json::json!({
                    "id": tc.id,
                    "type": tc.call_type,
                    "function": {
                        "name": tc.function.name,
                        "arguments": tc.function.arguments,
                    }
                })
            })
            .collect();
        formatted["tool_calls"] = serde_json::json!(tc_json);
    }

    if let Some(ref tool_call_id) = msg.tool_call_id {
        formatted["tool_call_id"] = serde_json::json!(tool_call_id);
    }

    formatted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tool_call_response() {
        let body = serde_json::json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{
                        "id": "call_1",
                        "function": { "name": "exec", "arguments": "{\"command\":\"ls\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16 }
        });

        let response = parse_completion(&body, "gpt-4o").unwrap();
        assert_eq!(response.finish_reason, "tool_calls");
        let calls = response.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "exec");
        assert_eq!(response.usage.total_tokens, 16);
    }

    #[test]
    fn missing_choices_is_malformed() {
        let body = serde_json::json!({ "id": "x", "choices": [] });
        let err = parse_completion(&body, "gpt-4o").unwrap_err();
        assert!(matches!(err, InferenceError::Malformed(_)));
    }

    #[test]
    fn tool_role_round_trips_to_wire_format() {
        let msg = ChatMessage::tool("Error: connection lost", "call_9");
        let wire = format_message(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["tool_call_id"], "call_9");
    }
}
