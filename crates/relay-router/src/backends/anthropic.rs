use super::sse::{self, SseDecoder};
use super::{merge_provider_options, post_json, ClientSettings, LlmBackend};
use async_trait::async_trait;
use relay_core::{
    ChatCompletion, ChatRequest, ChunkStream, ContentBlock, FinishReason, RelayError,
    RelayResult, Role, StreamEvent, ToolChoice, Usage,
};
use serde::Serialize;
use std::collections::HashMap;

/// Vendor key of the Anthropic messages dialect.
pub const VENDOR: &str = "anthropic";
/// Public API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
/// Value of the `anthropic-version` header.
pub const API_VERSION: &str = "2023-06-01";
/// The messages API requires `max_tokens`; used when neither caller nor config set one.
const FALLBACK_MAX_TOKENS: u32 = 4096;

/// Anthropic messages API backend.
pub struct AnthropicBackend {
    settings: ClientSettings,
}

impl AnthropicBackend {
    /// Creates a backend from composed connection settings.
    pub fn new(settings: ClientSettings) -> Self {
        Self { settings }
    }

    fn url(&self) -> String {
        format!("{}/v1/messages", self.settings.base_url.trim_end_matches('/'))
    }

    /// Builds the `/v1/messages` request body.
    ///
    /// The caller's system prompt and any system-role messages are joined into
    /// the top-level `system` field.
    pub fn build_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let api_messages: Vec<AnthropicMessage> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| AnthropicMessage {
                role: match m.role {
                    Role::Assistant => "assistant",
                    _ => "user",
                },
                content: &m.content,
            })
            .collect();

        let system: Vec<&str> = request
            .system
            .as_deref()
            .into_iter()
            .chain(
                request
                    .messages
                    .iter()
                    .filter(|m| m.role == Role::System)
                    .map(|m| m.content.as_str()),
            )
            .collect();

        let mut body = serde_json::json!({
            "model": self.settings.model,
            "max_tokens": request.max_output_tokens.unwrap_or(FALLBACK_MAX_TOKENS),
            "messages": api_messages,
        });

        if !system.is_empty() {
            body["system"] = serde_json::json!(system.join("\n\n"));
        }
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = request.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        if let Some(k) = request.top_k {
            body["top_k"] = serde_json::json!(k);
        }
        if !request.stop.is_empty() {
            body["stop_sequences"] = serde_json::json!(request.stop);
        }

        if !request.tools.is_empty() {
            let tools: Vec<AnthropicTool> = request
                .tools
                .iter()
                .map(|t| AnthropicTool {
                    name: &t.name,
                    description: &t.description,
                    input_schema: &t.parameters,
                })
                .collect();
            body["tools"] = serde_json::json!(tools);

            if let Some(choice) = &request.tool_choice {
                body["tool_choice"] = match choice {
                    ToolChoice::Auto => serde_json::json!({"type": "auto"}),
                    ToolChoice::None => serde_json::json!({"type": "none"}),
                    ToolChoice::Required => serde_json::json!({"type": "any"}),
                    ToolChoice::Tool(name) => serde_json::json!({"type": "tool", "name": name}),
                };
            }
        }

        if stream {
            body["stream"] = serde_json::json!(true);
        }

        merge_provider_options(&mut body, request.options_for(VENDOR));
        body
    }
}

#[async_trait]
impl LlmBackend for AnthropicBackend {
    fn vendor(&self) -> &str {
        VENDOR
    }

    async fn chat(&self, request: &ChatRequest) -> RelayResult<ChatCompletion> {
        let body = self.build_body(request, false);
        let resp = post_json(&self.settings, &self.url(), &body).await?;
        let resp_body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RelayError::Http(e.to_string()))?;

        let mut completion = parse_anthropic_response(&resp_body)?;
        completion.raw_request = body;
        completion.raw_response = resp_body;
        Ok(completion)
    }

    async fn chat_stream(&self, request: &ChatRequest) -> RelayResult<ChunkStream> {
        let body = self.build_body(request, true);
        let resp = post_json(&self.settings, &self.url(), &body).await?;
        Ok(sse::spawn_reader(
            resp,
            request.cancel.clone(),
            AnthropicStreamDecoder::default(),
        ))
    }
}

// -- Anthropic wire types --

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct AnthropicTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a serde_json::Value,
}

/// Maps an Anthropic `stop_reason`.
pub fn finish_reason(stop_reason: &str) -> FinishReason {
    match stop_reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

fn error_message(body: &serde_json::Value) -> String {
    body["error"]["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| body["error"].to_string())
}

/// Parses a non-streaming messages response.
pub fn parse_anthropic_response(body: &serde_json::Value) -> RelayResult<ChatCompletion> {
    if body["type"].as_str() == Some("error") {
        return Err(RelayError::Backend(error_message(body)));
    }

    let blocks = body["content"]
        .as_array()
        .ok_or_else(|| RelayError::Backend("Missing content in Anthropic response".into()))?;

    let content = blocks
        .iter()
        .filter_map(|block| match block["type"].as_str() {
            Some("text") => Some(ContentBlock::Text {
                text: block["text"].as_str().unwrap_or_default().to_string(),
            }),
            Some("tool_use") => Some(ContentBlock::ToolUse {
                id: block["id"].as_str().unwrap_or_default().to_string(),
                name: block["name"].as_str().unwrap_or_default().to_string(),
                input: block["input"].clone(),
            }),
            _ => None,
        })
        .collect();

    Ok(ChatCompletion {
        content,
        finish_reason: finish_reason(body["stop_reason"].as_str().unwrap_or("end_turn")),
        usage: Usage {
            input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
        },
        raw_request: serde_json::Value::Null,
        raw_response: serde_json::Value::Null,
    })
}

/// Decodes Anthropic `message_*` / `content_block_*` events.
#[derive(Debug, Default)]
pub(crate) struct AnthropicStreamDecoder {
    /// Content block index -> tool call id.
    tool_blocks: HashMap<u64, String>,
    stop_reason: Option<String>,
    input_tokens: u64,
}

impl SseDecoder for AnthropicStreamDecoder {
    fn decode(&mut self, data: &str) -> Vec<StreamEvent> {
        let event: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };

        let mut out = Vec::new();
        match event["type"].as_str().unwrap_or("") {
            "message_start" => {
                self.input_tokens = event["message"]["usage"]["input_tokens"]
                    .as_u64()
                    .unwrap_or(0);
            }

            "content_block_start" => {
                let index = event["index"].as_u64().unwrap_or(0);
                let block = &event["content_block"];
                match block["type"].as_str() {
                    Some("tool_use") => {
                        let id = block["id"].as_str().unwrap_or_default().to_string();
                        let name = block["name"].as_str().unwrap_or_default().to_string();
                        self.tool_blocks.insert(index, id.clone());
                        out.push(StreamEvent::ToolCallStart { id, name });
                    }
                    Some("text") => {
                        if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty()) {
                            out.push(StreamEvent::TextDelta {
                                text: text.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }

            "content_block_delta" => {
                let index = event["index"].as_u64().unwrap_or(0);
                let delta = &event["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        if let Some(text) = delta["text"].as_str() {
                            out.push(StreamEvent::TextDelta {
                                text: text.to_string(),
                            });
                        }
                    }
                    Some("input_json_delta") => {
                        if let (Some(partial), Some(id)) =
                            (delta["partial_json"].as_str(), self.tool_blocks.get(&index))
                        {
                            out.push(StreamEvent::ToolCallDelta {
                                id: id.clone(),
                                arguments_delta: partial.to_string(),
                            });
                        }
                    }
                    _ => {}
                }
            }

            "content_block_stop" => {
                let index = event["index"].as_u64().unwrap_or(0);
                if let Some(id) = self.tool_blocks.remove(&index) {
                    out.push(StreamEvent::ToolCallEnd { id });
                }
            }

            "message_delta" => {
                if let Some(sr) = event["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(sr.to_string());
                }
                if let Some(output_tokens) = event["usage"]["output_tokens"].as_u64() {
                    out.push(StreamEvent::Usage {
                        usage: Usage {
                            input_tokens: self.input_tokens,
                            output_tokens,
                        },
                    });
                }
            }

            "message_stop" => {
                out.push(StreamEvent::Finish {
                    reason: finish_reason(self.stop_reason.as_deref().unwrap_or("end_turn")),
                });
            }

            "error" => {
                out.push(StreamEvent::Error {
                    message: error_message(&event),
                });
            }

            _ => {}
        }
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use relay_core::{Message, ToolDefinition};

    fn backend() -> AnthropicBackend {
        AnthropicBackend::new(ClientSettings {
            model: "claude-test".into(),
            base_url: DEFAULT_BASE_URL.into(),
            headers: reqwest::header::HeaderMap::new(),
            http: reqwest::Client::new(),
        })
    }

    #[test]
    fn test_body_moves_system_messages_out_of_turns() {
        let mut request = ChatRequest::new(vec![
            Message::system("rule two"),
            Message::user("hi"),
            Message::assistant("hello"),
        ])
        .with_system("rule one");
        request.stop = vec!["END".into()];
        request.top_k = Some(5);

        let body = backend().build_body(&request, true);
        assert_eq!(body["system"], "rule one\n\nrule two");
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["messages"][1]["role"], "assistant");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["stop_sequences"][0], "END");
        assert_eq!(body["top_k"], 5);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn test_body_tools_and_choice() {
        let mut request = ChatRequest::new(vec![Message::user("weather?")]);
        request.tools.push(ToolDefinition {
            name: "weather".into(),
            description: "Get weather".into(),
            parameters: serde_json::json!({"type": "object"}),
        });
        request.tool_choice = Some(ToolChoice::Required);
        let mut opts = serde_json::Map::new();
        opts.insert("metadata".into(), serde_json::json!({"user_id": "u1"}));
        request.provider_options.insert(VENDOR.into(), opts);

        let body = backend().build_body(&request, false);
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["tool_choice"]["type"], "any");
        assert_eq!(body["metadata"]["user_id"], "u1");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn test_parse_response_with_tool_use() {
        let body = serde_json::json!({
            "content": [
                {"type": "text", "text": "Checking."},
                {"type": "tool_use", "id": "toolu_1", "name": "weather", "input": {"city": "Oslo"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 11, "output_tokens": 7}
        });
        let completion = parse_anthropic_response(&body).unwrap();
        assert_eq!(completion.first_text(), Some("Checking."));
        assert_eq!(completion.content.len(), 2);
        assert_eq!(completion.finish_reason, FinishReason::ToolCalls);
        assert_eq!(completion.usage.output_tokens, 7);
    }

    #[test]
    fn test_parse_error_body() {
        let body = serde_json::json!({
            "type": "error",
            "error": {"type": "overloaded_error", "message": "Overloaded"}
        });
        let err = parse_anthropic_response(&body).unwrap_err();
        assert!(matches!(err, RelayError::Backend(ref m) if m == "Overloaded"));
    }

    #[test]
    fn test_stream_decoder_full_message() {
        let mut decoder = AnthropicStreamDecoder::default();
        let events: Vec<StreamEvent> = [
            r#"{"type":"message_start","message":{"usage":{"input_tokens":9}}}"#,
            r#"{"type":"ping"}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"t1","name":"calc"}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"x\":1}"}}"#,
            r#"{"type":"content_block_stop","index":1}"#,
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":4}}"#,
            r#"{"type":"message_stop"}"#,
        ]
        .iter()
        .flat_map(|data| decoder.decode(data))
        .collect();

        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta { text: "Hi".into() },
                StreamEvent::ToolCallStart {
                    id: "t1".into(),
                    name: "calc".into()
                },
                StreamEvent::ToolCallDelta {
                    id: "t1".into(),
                    arguments_delta: "{\"x\":1}".into()
                },
                StreamEvent::ToolCallEnd { id: "t1".into() },
                StreamEvent::Usage {
                    usage: Usage {
                        input_tokens: 9,
                        output_tokens: 4
                    }
                },
                StreamEvent::Finish {
                    reason: FinishReason::ToolCalls
                },
            ]
        );
    }

    #[test]
    fn test_stream_decoder_in_band_error() {
        let mut decoder = AnthropicStreamDecoder::default();
        let events = decoder.decode(
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                message: "Overloaded".into()
            }]
        );
    }
}
