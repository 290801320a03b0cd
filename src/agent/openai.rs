//! OpenAI-compatible chat completions provider
//!
//! Single-shot calls use a plain JSON response; streaming calls read the SSE
//! stream, forward content deltas as they arrive and assemble tool calls from
//! their indexed fragments.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{ChatMessage, ModelProvider, ModelRequest, ModelResponse, Role, ToolCall};
use crate::error::{Result, StewardError};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAIChatProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

/// Tool call fragment from one stream chunk
#[derive(Debug, Default)]
struct ToolCallDelta {
    index: usize,
    id: Option<String>,
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates a streamed response
#[derive(Debug, Default)]
struct StreamAssembler {
    text: String,
    calls: BTreeMap<usize, PartialToolCall>,
}

impl StreamAssembler {
    fn push(&mut self, delta_text: Option<String>, deltas: Vec<ToolCallDelta>) -> Option<String> {
        for delta in deltas {
            let entry = self.calls.entry(delta.index).or_default();
            if let Some(id) = delta.id {
                entry.id = id;
            }
            if let Some(name) = delta.name {
                entry.name.push_str(&name);
            }
            if let Some(arguments) = delta.arguments {
                entry.arguments.push_str(&arguments);
            }
        }
        let text = delta_text.filter(|t| !t.is_empty())?;
        self.text.push_str(&text);
        Some(text)
    }

    fn finish(self) -> Result<ModelResponse> {
        let tool_calls = self
            .calls
            .into_values()
            .map(|partial| {
                Ok(ToolCall {
                    id: partial.id,
                    arguments: parse_arguments(&partial.name, &partial.arguments)?,
                    name: partial.name,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ModelResponse {
            text: self.text,
            tool_calls,
        })
    }
}

impl OpenAIChatProvider {
    pub fn with_config(api_key: String, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    fn format_messages(system_prompt: &str, messages: &[ChatMessage]) -> Vec<Value> {
        let mut out = vec![json!({"role": "system", "content": system_prompt})];
        out.extend(messages.iter().map(|msg| {
            let mut m = json!({
                "role": msg.role,
                "content": msg.content,
            });
            if msg.role == Role::Assistant && !msg.tool_calls.is_empty() {
                m["tool_calls"] = msg
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
            }
            if let Some(id) = &msg.tool_call_id {
                m["tool_call_id"] = json!(id);
            }
            m
        }));
        out
    }

    fn body(&self, request: &ModelRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": Self::format_messages(&request.system_prompt, &request.messages),
            "max_tokens": request.max_tokens,
            "stream": stream,
        });
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!(url = %url, model = %self.model, "chat completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| StewardError::Model(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!(%status, body = %truncate(&text, 500), "chat completion error");
            return Err(StewardError::Model(format!(
                "API error {}: {}",
                status,
                truncate(&text, 200)
            )));
        }
        Ok(response)
    }

    /// Parse one SSE `data:` payload. `None` for `[DONE]` and unparseable lines.
    fn parse_sse_chunk(data: &str) -> Option<(Option<String>, Vec<ToolCallDelta>)> {
        if data == "[DONE]" {
            return None;
        }
        let v: Value = serde_json::from_str(data).ok()?;
        let delta = &v["choices"].get(0)?["delta"];

        let text = delta["content"].as_str().map(str::to_string);
        let calls = delta["tool_calls"]
            .as_array()
            .map(|tcs| {
                tcs.iter()
                    .map(|tc| ToolCallDelta {
                        index: tc["index"].as_u64().unwrap_or(0) as usize,
                        id: tc["id"].as_str().map(str::to_string),
                        name: tc["function"]["name"].as_str().map(str::to_string),
                        arguments: tc["function"]["arguments"].as_str().map(str::to_string),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some((text, calls))
    }
}

#[async_trait]
impl ModelProvider for OpenAIChatProvider {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let response = self.post(&self.body(request, false)).await?;
        let v: Value = response
            .json()
            .await
            .map_err(|e| StewardError::Model(format!("malformed response: {}", e)))?;

        let message = v["choices"]
            .get(0)
            .map(|c| &c["message"])
            .ok_or_else(|| StewardError::Model("response has no choices".to_string()))?;

        let tool_calls = message["tool_calls"]
            .as_array()
            .map(|tcs| {
                tcs.iter()
                    .map(|tc| {
                        let name = tc["function"]["name"].as_str().unwrap_or_default().to_string();
                        let raw = tc["function"]["arguments"].as_str().unwrap_or("{}");
                        Ok(ToolCall {
                            id: tc["id"].as_str().unwrap_or_default().to_string(),
                            arguments: parse_arguments(&name, raw)?,
                            name,
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(ModelResponse {
            text: message["content"].as_str().unwrap_or_default().to_string(),
            tool_calls,
        })
    }

    async fn complete_streaming(
        &self,
        request: &ModelRequest,
        deltas: &mpsc::UnboundedSender<String>,
    ) -> Result<ModelResponse> {
        let response = self.post(&self.body(request, true)).await?;
        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut assembler = StreamAssembler::default();

        while let Some(chunk) = byte_stream.next().await {
            let bytes = chunk.map_err(|e| StewardError::Model(format!("stream read error: {}", e)))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim().to_string();
                buffer = buffer[line_end + 1..].to_string();

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    return assembler.finish();
                }
                if let Some((text, calls)) = Self::parse_sse_chunk(data) {
                    if let Some(text) = assembler.push(text, calls) {
                        let _ = deltas.send(text);
                    }
                }
            }
        }

        assembler.finish()
    }
}

fn parse_arguments(name: &str, raw: &str) -> Result<Value> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| {
        StewardError::Model(format!("malformed arguments for tool call {}: {}", name, e))
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembles_fragmented_tool_calls() {
        let mut assembler = StreamAssembler::default();
        let chunks = [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"read_platform","arguments":"{\"platform\":"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"slack\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"read_system_state","arguments":""}}]}}]}"#,
        ];
        for chunk in chunks {
            let (text, calls) = OpenAIChatProvider::parse_sse_chunk(chunk).unwrap();
            assembler.push(text, calls);
        }

        let response = assembler.finish().unwrap();
        assert_eq!(response.tool_calls.len(), 2);
        assert_eq!(response.tool_calls[0].id, "call_a");
        assert_eq!(response.tool_calls[0].arguments, json!({"platform": "slack"}));
        assert_eq!(response.tool_calls[1].arguments, json!({}));
    }

    #[test]
    fn test_text_deltas_accumulate() {
        let mut assembler = StreamAssembler::default();
        for chunk in [
            r#"{"choices":[{"delta":{"content":"Hello"}}]}"#,
            r#"{"choices":[{"delta":{"content":", world"}}]}"#,
        ] {
            let (text, calls) = OpenAIChatProvider::parse_sse_chunk(chunk).unwrap();
            assert!(assembler.push(text, calls).is_some());
        }
        assert!(OpenAIChatProvider::parse_sse_chunk("[DONE]").is_none());
        assert_eq!(assembler.finish().unwrap(), ModelResponse::text("Hello, world"));
    }

    #[test]
    fn test_malformed_arguments_are_fatal() {
        assert!(matches!(
            parse_arguments("search_memory", "{not json"),
            Err(StewardError::Model(_))
        ));
    }

    #[test]
    fn test_format_messages_prepends_system() {
        let messages = vec![
            ChatMessage::user("hi"),
            ChatMessage::assistant_with_tools(
                "",
                vec![ToolCall {
                    id: "c1".to_string(),
                    name: "read_system_state".to_string(),
                    arguments: json!({}),
                }],
            ),
            ChatMessage::tool_result("c1", &json!({"ok": true})),
        ];
        let formatted = OpenAIChatProvider::format_messages("be brief", &messages);
        assert_eq!(formatted.len(), 4);
        assert_eq!(formatted[0]["role"], "system");
        assert_eq!(formatted[2]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(formatted[3]["tool_call_id"], "c1");
    }
}
