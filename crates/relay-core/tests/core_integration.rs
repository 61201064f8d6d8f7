#![allow(clippy::unwrap_used, clippy::expect_used)]

use relay_core::*;

// ---------------------------------------------------------------------------
// 1. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    assert_eq!(RelayError::Cancelled.to_string(), "Request cancelled");
    assert_eq!(
        RelayError::Http("connection refused".into()).to_string(),
        "HTTP error: connection refused"
    );
    assert_eq!(
        RelayError::Backend("overloaded".into()).to_string(),
        "Backend error: overloaded"
    );
    assert_eq!(
        RelayError::NoBackendAvailable.to_string(),
        "No backend available"
    );
    assert_eq!(
        RelayError::Config("missing default".into()).to_string(),
        "Config error: missing default"
    );

    let serde_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
    let relay_err: RelayError = serde_err.into();
    assert!(relay_err.to_string().starts_with("JSON error:"));

    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
    let relay_err: RelayError = io_err.into();
    assert!(relay_err.to_string().starts_with("IO error:"));
}

// ---------------------------------------------------------------------------
// 2. Stream events use a tagged wire form
// ---------------------------------------------------------------------------

#[test]
fn stream_event_tagged_serialization() {
    let event = StreamEvent::TextDelta {
        text: "hel".into(),
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json, serde_json::json!({"type": "text_delta", "text": "hel"}));

    let finish = StreamEvent::Finish {
        reason: FinishReason::Length,
    };
    let json = serde_json::to_value(&finish).unwrap();
    assert_eq!(json, serde_json::json!({"type": "finish", "reason": "length"}));

    assert!(StreamEvent::Error {
        message: "boom".into()
    }
    .is_error());
    assert!(!event.is_error());
}

// ---------------------------------------------------------------------------
// 3. Content blocks keep vendor-neutral tags
// ---------------------------------------------------------------------------

#[test]
fn content_block_serialization() {
    let block = ContentBlock::ToolUse {
        id: "toolu_1".into(),
        name: "weather".into(),
        input: serde_json::json!({"city": "Lisbon"}),
    };
    let json = serde_json::to_value(&block).unwrap();
    assert_eq!(json["type"], "tool_use");
    assert_eq!(json["input"]["city"], "Lisbon");

    let back: ContentBlock = serde_json::from_value(json).unwrap();
    assert_eq!(back, block);
}

// ---------------------------------------------------------------------------
// 4. Request builders and provider option lookup
// ---------------------------------------------------------------------------

#[test]
fn request_builders_and_options() {
    let mut req = ChatRequest::new(vec![Message::user("hi"), Message::assistant("hello")])
        .with_system("be terse")
        .with_max_output_tokens(64);
    let mut opts = serde_json::Map::new();
    opts.insert("service_tier".into(), serde_json::json!("flex"));
    req.provider_options.insert("openai".into(), opts);

    assert_eq!(req.system.as_deref(), Some("be terse"));
    assert_eq!(req.max_output_tokens, Some(64));
    assert_eq!(req.messages[1].role, Role::Assistant);
    assert_eq!(
        req.options_for("openai").and_then(|o| o.get("service_tier")),
        Some(&serde_json::json!("flex"))
    );
    assert!(req.options_for("anthropic").is_none());
}
