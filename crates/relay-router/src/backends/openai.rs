use super::sse::{self, SseDecoder};
use super::{merge_provider_options, post_json, ClientSettings, LlmBackend};
use async_trait::async_trait;
use relay_core::{
    ChatCompletion, ChatRequest, ChunkStream, ContentBlock, FinishReason, RelayError,
    RelayResult, Role, StreamEvent, ToolChoice, Usage,
};
use std::collections::BTreeMap;
use tracing::debug;

/// Public API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
/// Azure `api-version` used when the backend does not set one.
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-10-21";

/// Which flavor of the chat-completions wire shape to speak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenAiDialect {
    /// api.openai.com: `max_completion_tokens`, streamed usage, no `top_k`.
    Native,
    /// Hosted or self-hosted services that mirror the OpenAI API.
    Compatible,
    /// Azure OpenAI: deployment-scoped URL with an `api-version` query.
    Azure {
        /// Value of the `api-version` query parameter.
        api_version: String,
    },
}

/// OpenAI chat-completions backend.
///
/// Works with OpenAI, Azure OpenAI, OpenRouter, Groq, DeepSeek, Ollama and any
/// other provider that implements the chat completions API.
pub struct OpenAiBackend {
    settings: ClientSettings,
    dialect: OpenAiDialect,
    vendor: String,
}

impl OpenAiBackend {
    /// Creates a backend. `vendor` is the key reported by [`LlmBackend::vendor`].
    pub fn new(settings: ClientSettings, dialect: OpenAiDialect, vendor: impl Into<String>) -> Self {
        Self {
            settings,
            dialect,
            vendor: vendor.into(),
        }
    }

    /// The wire flavor this client speaks.
    pub fn dialect(&self) -> &OpenAiDialect {
        &self.dialect
    }

    /// Full chat-completions URL for this dialect.
    pub fn url(&self) -> String {
        let base = self.settings.base_url.trim_end_matches('/');
        match &self.dialect {
            OpenAiDialect::Azure { api_version } => format!(
                "{base}/openai/deployments/{}/chat/completions?api-version={api_version}",
                self.settings.model
            ),
            _ => format!("{base}/v1/chat/completions"),
        }
    }

    fn build_messages(&self, request: &ChatRequest) -> Vec<serde_json::Value> {
        let mut api_messages: Vec<serde_json::Value> = Vec::new();

        if let Some(sys) = &request.system {
            api_messages.push(serde_json::json!({
                "role": "system",
                "content": sys
            }));
        }

        for m in &request.messages {
            api_messages.push(serde_json::json!({
                "role": match m.role {
                    Role::User | Role::Tool => "user",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                },
                "content": m.content
            }));
        }

        api_messages
    }

    /// Builds the request body, including only the fields this dialect accepts.
    pub fn build_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "messages": self.build_messages(request),
        });

        if !matches!(self.dialect, OpenAiDialect::Azure { .. }) {
            body["model"] = serde_json::json!(self.settings.model);
        }

        if let Some(max) = request.max_output_tokens {
            let key = match self.dialect {
                OpenAiDialect::Native => "max_completion_tokens",
                _ => "max_tokens",
            };
            body[key] = serde_json::json!(max);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = request.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        if let Some(k) = request.top_k {
            if self.dialect == OpenAiDialect::Compatible {
                body["top_k"] = serde_json::json!(k);
            } else {
                debug!(vendor = %self.vendor, "top_k is not supported by this dialect, dropping");
            }
        }
        if !request.stop.is_empty() {
            body["stop"] = serde_json::json!(request.stop);
        }

        if !request.tools.is_empty() {
            let tools: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(tools);

            if let Some(choice) = &request.tool_choice {
                body["tool_choice"] = match choice {
                    ToolChoice::Auto => serde_json::json!("auto"),
                    ToolChoice::None => serde_json::json!("none"),
                    ToolChoice::Required => serde_json::json!("required"),
                    ToolChoice::Tool(name) => serde_json::json!({
                        "type": "function",
                        "function": {"name": name}
                    }),
                };
            }
        }

        if stream {
            body["stream"] = serde_json::json!(true);
            if self.dialect == OpenAiDialect::Native {
                body["stream_options"] = serde_json::json!({"include_usage": true});
            }
        }

        merge_provider_options(&mut body, request.options_for(&self.vendor));
        body
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn vendor(&self) -> &str {
        &self.vendor
    }

    async fn chat(&self, request: &ChatRequest) -> RelayResult<ChatCompletion> {
        let body = self.build_body(request, false);
        let resp = post_json(&self.settings, &self.url(), &body).await?;
        let resp_body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RelayError::Http(e.to_string()))?;

        let mut completion = parse_openai_response(&resp_body)?;
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
            OpenAiStreamDecoder::default(),
        ))
    }
}

/// Maps an OpenAI `finish_reason`.
pub fn finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

fn error_message(error: &serde_json::Value) -> String {
    error["message"]
        .as_str()
        .or_else(|| error.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

fn parse_usage(usage: &serde_json::Value) -> Usage {
    Usage {
        input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
        output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
    }
}

/// Parses a non-streaming chat-completions response.
pub fn parse_openai_response(body: &serde_json::Value) -> RelayResult<ChatCompletion> {
    if !body["error"].is_null() {
        return Err(RelayError::Backend(error_message(&body["error"])));
    }

    let choice = body["choices"]
        .get(0)
        .ok_or_else(|| RelayError::Backend("Missing choices in OpenAI response".into()))?;
    let message = &choice["message"];

    let mut content = Vec::new();
    if let Some(text) = message["content"].as_str().filter(|t| !t.is_empty()) {
        content.push(ContentBlock::Text {
            text: text.to_string(),
        });
    }

    if let Some(tool_calls) = message["tool_calls"].as_array() {
        content.extend(tool_calls.iter().filter_map(|tc| {
            let id = tc["id"].as_str()?.to_string();
            let name = tc["function"]["name"].as_str()?.to_string();
            let input = serde_json::from_str(tc["function"]["arguments"].as_str()?)
                .unwrap_or_default();
            Some(ContentBlock::ToolUse { id, name, input })
        }));
    }

    Ok(ChatCompletion {
        content,
        finish_reason: finish_reason(choice["finish_reason"].as_str().unwrap_or("stop")),
        usage: parse_usage(&body["usage"]),
        raw_request: serde_json::Value::Null,
        raw_response: serde_json::Value::Null,
    })
}

/// Decodes `chat.completion.chunk` payloads.
#[derive(Debug, Default)]
pub(crate) struct OpenAiStreamDecoder {
    /// Tool call index -> tool call id.
    tool_calls: BTreeMap<u64, String>,
    finish_reason: Option<FinishReason>,
    finished: bool,
}

impl SseDecoder for OpenAiStreamDecoder {
    fn decode(&mut self, data: &str) -> Vec<StreamEvent> {
        if data == "[DONE]" {
            if self.finished {
                return Vec::new();
            }
            self.finished = true;
            // A bare [DONE] with no finish_reason produced nothing to finish.
            return self
                .finish_reason
                .clone()
                .map(|reason| StreamEvent::Finish { reason })
                .into_iter()
                .collect();
        }

        let event: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };

        if !event["error"].is_null() {
            return vec![StreamEvent::Error {
                message: error_message(&event["error"]),
            }];
        }

        let mut out = Vec::new();
        let choice = &event["choices"][0];
        let delta = &choice["delta"];

        if let Some(content) = delta["content"].as_str() {
            if !content.is_empty() {
                out.push(StreamEvent::TextDelta {
                    text: content.to_string(),
                });
            }
        }

        if let Some(tc_array) = delta["tool_calls"].as_array() {
            for tc in tc_array {
                let idx = tc["index"].as_u64().unwrap_or(0);

                // Some compatible servers repeat the id on every fragment.
                if let Some(id) = tc["id"].as_str().filter(|_| !self.tool_calls.contains_key(&idx)) {
                    let name = tc["function"]["name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    self.tool_calls.insert(idx, id.to_string());
                    out.push(StreamEvent::ToolCallStart {
                        id: id.to_string(),
                        name,
                    });
                }

                if let Some(args_delta) = tc["function"]["arguments"].as_str() {
                    if let Some(id) = self.tool_calls.get(&idx).filter(|_| !args_delta.is_empty()) {
                        out.push(StreamEvent::ToolCallDelta {
                            id: id.clone(),
                            arguments_delta: args_delta.to_string(),
                        });
                    }
                }
            }
        }

        if let Some(fr) = choice["finish_reason"].as_str() {
            let reason = finish_reason(fr);
            if reason == FinishReason::ToolCalls {
                out.extend(
                    std::mem::take(&mut self.tool_calls)
                        .into_values()
                        .map(|id| StreamEvent::ToolCallEnd { id }),
                );
            }
            self.finish_reason = Some(reason);
        }

        if event["usage"].is_object() {
            out.push(StreamEvent::Usage {
                usage: parse_usage(&event["usage"]),
            });
        }

        out
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        match (&self.finish_reason, self.finished) {
            (Some(reason), false) => {
                self.finished = true;
                vec![StreamEvent::Finish {
                    reason: reason.clone(),
                }]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use relay_core::{Message, ToolDefinition};

    fn backend(dialect: OpenAiDialect) -> OpenAiBackend {
        OpenAiBackend::new(
            ClientSettings {
                model: "gpt-test".into(),
                base_url: "https://example.test/".into(),
                headers: reqwest::header::HeaderMap::new(),
                http: reqwest::Client::new(),
            },
            dialect,
            "openai",
        )
    }

    fn request() -> ChatRequest {
        let mut request = ChatRequest::new(vec![Message::user("hi")])
            .with_system("be brief")
            .with_max_output_tokens(100);
        request.top_k = Some(40);
        request
    }

    #[test]
    fn test_native_body() {
        let body = backend(OpenAiDialect::Native).build_body(&request(), true);
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["max_completion_tokens"], 100);
        assert!(body.get("max_tokens").is_none());
        assert!(body.get("top_k").is_none());
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_compatible_body() {
        let body = backend(OpenAiDialect::Compatible).build_body(&request(), true);
        assert_eq!(body["max_tokens"], 100);
        assert_eq!(body["top_k"], 40);
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn test_azure_url_and_body() {
        let azure = backend(OpenAiDialect::Azure {
            api_version: DEFAULT_AZURE_API_VERSION.into(),
        });
        assert_eq!(
            azure.url(),
            "https://example.test/openai/deployments/gpt-test/chat/completions?api-version=2024-10-21"
        );
        let body = azure.build_body(&request(), false);
        assert!(body.get("model").is_none());
        assert_eq!(body["max_tokens"], 100);
    }

    #[test]
    fn test_named_tool_choice() {
        let mut req = request();
        req.tools.push(ToolDefinition {
            name: "lookup".into(),
            description: "Lookup".into(),
            parameters: serde_json::json!({"type": "object"}),
        });
        req.tool_choice = Some(ToolChoice::Tool("lookup".into()));
        let body = backend(OpenAiDialect::Compatible).build_body(&req, false);
        assert_eq!(body["tools"][0]["function"]["name"], "lookup");
        assert_eq!(body["tool_choice"]["function"]["name"], "lookup");
    }

    #[test]
    fn test_parse_response() {
        let body = serde_json::json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "lookup", "arguments": "{\"q\":\"rust\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 5}
        });
        let completion = parse_openai_response(&body).unwrap();
        assert_eq!(completion.first_text(), None);
        assert_eq!(
            completion.content,
            vec![ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "lookup".into(),
                input: serde_json::json!({"q": "rust"}),
            }]
        );
        assert_eq!(completion.finish_reason, FinishReason::ToolCalls);
        assert_eq!(completion.usage.total(), 8);
    }

    #[test]
    fn test_parse_error_body() {
        let body = serde_json::json!({"error": {"message": "model overloaded"}});
        let err = parse_openai_response(&body).unwrap_err();
        assert!(err.to_string().contains("model overloaded"));
    }

    #[test]
    fn test_stream_decoder_text_and_usage() {
        let mut decoder = OpenAiStreamDecoder::default();
        let events: Vec<StreamEvent> = [
            r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#,
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"length"}]}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":2,"completion_tokens":2}}"#,
            "[DONE]",
        ]
        .iter()
        .flat_map(|data| decoder.decode(data))
        .collect();

        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta { text: "Hel".into() },
                StreamEvent::TextDelta { text: "lo".into() },
                StreamEvent::Usage {
                    usage: Usage {
                        input_tokens: 2,
                        output_tokens: 2
                    }
                },
                StreamEvent::Finish {
                    reason: FinishReason::Length
                },
            ]
        );
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_stream_decoder_tool_calls() {
        let mut decoder = OpenAiStreamDecoder::default();
        let events: Vec<StreamEvent> = [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"f","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ]
        .iter()
        .flat_map(|data| decoder.decode(data))
        .collect();

        assert_eq!(
            events,
            vec![
                StreamEvent::ToolCallStart {
                    id: "c1".into(),
                    name: "f".into()
                },
                StreamEvent::ToolCallDelta {
                    id: "c1".into(),
                    arguments_delta: "{}".into()
                },
                StreamEvent::ToolCallEnd { id: "c1".into() },
            ]
        );
        // No [DONE]: the end of the body still yields a finish chunk.
        assert_eq!(
            decoder.finish(),
            vec![StreamEvent::Finish {
                reason: FinishReason::ToolCalls
            }]
        );
    }

    #[test]
    fn test_stream_decoder_repeated_tool_call_id_starts_once() {
        let mut decoder = OpenAiStreamDecoder::default();
        let events: Vec<StreamEvent> = [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"f","arguments":"{\"q\""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"arguments":":1}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        ]
        .iter()
        .flat_map(|data| decoder.decode(data))
        .collect();

        let starts = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ToolCallStart { .. }))
            .count();
        assert_eq!(starts, 1, "events: {events:?}");
        assert_eq!(
            events[1..],
            [
                StreamEvent::ToolCallDelta {
                    id: "c1".into(),
                    arguments_delta: "{\"q\"".into()
                },
                StreamEvent::ToolCallDelta {
                    id: "c1".into(),
                    arguments_delta: ":1}".into()
                },
                StreamEvent::ToolCallEnd { id: "c1".into() },
            ]
        );
    }

    #[test]
    fn test_bare_done_yields_no_finish() {
        let mut decoder = OpenAiStreamDecoder::default();
        assert!(decoder.decode("[DONE]").is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_stream_decoder_in_band_error() {
        let mut decoder = OpenAiStreamDecoder::default();
        let events = decoder.decode(r#"{"error":{"message":"rate limit exceeded","code":429}}"#);
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                message: "rate limit exceeded".into()
            }]
        );
    }
}
