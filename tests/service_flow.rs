mod common;

use std::sync::Arc;
use std::time::Duration;

use common::ScriptedTransport;
use kagi_llm::extract::{extract, extract_answer};
use kagi_llm::retry::{RetryPolicy, retry};
use kagi_llm::{
    ChatOptions, ConversationStore, KeyStore, LLMError, Message, ServiceClient, SupplierKind,
};
use serde_json::json;

const OPENAI_ANSWER: &str = r#"{
    "id": "chatcmpl-1",
    "choices": [{"index": 0, "message": {"role": "assistant", "content": "4"}}],
    "usage": {"prompt_tokens": 12, "completion_tokens": 1, "total_tokens": 13}
}"#;

fn keys() -> KeyStore {
    KeyStore::from_keys([("openai", "sk-test"), ("anthropic", "sk-ant-test")])
        .with_env_lookup(|_| None)
}

#[tokio::test]
async fn chat_returns_raw_response_and_charges_reported_usage() {
    let transport = Arc::new(ScriptedTransport::new(&[(200, OPENAI_ANSWER)]));
    let client = ServiceClient::builder("openai", "gpt-4o-mini")
        .token_budget(100)
        .transport(transport.clone())
        .build(&keys());

    let response = client
        .chat_complete(&[Message::user("2+2?")], &ChatOptions::default())
        .await
        .expect("chat");
    assert_eq!(extract(&response, "id", None).expect("id"), json!("chatcmpl-1"));
    assert_eq!(
        extract_answer(&response, SupplierKind::OpenAiLike).expect("answer"),
        "4"
    );

    let status = client.status();
    assert_eq!(status.token_budget, 87);
    assert_eq!((status.tokens_in, status.tokens_out), (12, 1));
    assert_eq!(
        transport.requests()[0].headers.get("Authorization").map(String::as_str),
        Some("Bearer sk-test")
    );
}

#[tokio::test]
async fn retry_recovers_from_rate_limit() {
    let transport = Arc::new(ScriptedTransport::new(&[
        (429, r#"{"error":{"message":"Rate limit reached"}}"#),
        (503, "service unavailable"),
        (200, OPENAI_ANSWER),
    ]));
    let client = ServiceClient::builder("openai", "gpt-4o-mini")
        .transport(transport.clone())
        .build(&keys());
    let messages = vec![Message::user("2+2?")];
    let options = ChatOptions::default();

    let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
    let response = retry(&policy, || client.chat_complete(&messages, &options))
        .await
        .expect("third attempt succeeds");
    assert_eq!(response["choices"][0]["message"]["content"], "4");
    assert_eq!(transport.requests().len(), 3);
}

#[tokio::test]
async fn retry_stops_at_max_attempts_and_on_auth_errors() {
    let transport = Arc::new(ScriptedTransport::new(&[
        (500, "boom"),
        (500, "boom"),
        (401, r#"{"error":{"message":"bad key"}}"#),
    ]));
    let client = ServiceClient::builder("openai", "gpt-4o-mini")
        .transport(transport.clone())
        .build(&keys());
    let messages = vec![Message::user("hi")];
    let options = ChatOptions::default();

    let policy = RetryPolicy::exponential(2, Duration::from_millis(1), 2.0);
    let err = retry(&policy, || client.chat_complete(&messages, &options))
        .await
        .expect_err("both attempts fail");
    assert!(matches!(err, LLMError::ServiceError { status: 500, .. }));
    assert_eq!(transport.requests().len(), 2);

    let err = retry(&policy, || client.chat_complete(&messages, &options))
        .await
        .expect_err("auth failure");
    assert!(matches!(err, LLMError::Unauthorized { .. }));
    assert_eq!(transport.requests().len(), 3);
}

#[tokio::test]
async fn conversation_over_anthropic_with_streaming_turn() {
    let transport = Arc::new(ScriptedTransport::new(&[
        (
            200,
            r#"{"content":[{"type":"text","text":"Hello!"}],"usage":{"input_tokens":10,"output_tokens":2}}"#,
        ),
        (
            200,
            concat!(
                "event: message_start\n",
                "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\"}}\n\n",
                "event: content_block_delta\n",
                "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Rust is \"}}\n\n",
                "event: ping\n",
                "data: {\"type\":\"ping\"}\n\n",
                "event: content_block_delta\n",
                "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"fast.\"}}\n\n",
                "event: message_stop\n",
                "data: {\"type\":\"message_stop\"}\n\n",
            ),
        ),
    ]));
    let client = ServiceClient::builder("anthropic", "claude-3-haiku")
        .transport(transport.clone())
        .build(&keys());
    let mut conversation = ConversationStore::new(client, Some("Be brief."));

    assert_eq!(conversation.ask("Hi").await.expect("ask"), "Hello!");

    let mut printed = String::new();
    let answer = conversation
        .stream_ask("Describe Rust.", |delta| printed.push_str(delta))
        .await
        .expect("stream");
    assert_eq!(answer, "Rust is fast.");
    assert_eq!(printed, answer);
    assert_eq!(conversation.len(), 5);

    let requests = transport.requests();
    let body: serde_json::Value =
        serde_json::from_slice(requests[1].body.as_deref().expect("body")).expect("json");
    assert_eq!(body["system"], "Be brief.");
    assert_eq!(body["stream"], true);
    assert_eq!(body["messages"].as_array().expect("messages").len(), 3);

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("session.json");
    conversation.save(&path).expect("save");
    let restored = ConversationStore::load(
        &path,
        ServiceClient::builder("openai", "gpt-4o-mini")
            .transport(transport.clone())
            .build(&keys()),
    )
    .expect("load");
    assert_eq!(restored.history(), conversation.history());
    assert_eq!(
        restored.stored_service().map(|s| s.service.as_str()),
        Some("anthropic")
    );
}

#[tokio::test]
async fn generic_service_posts_to_model_url() {
    let transport = Arc::new(ScriptedTransport::new(&[(
        200,
        r#"[{"generated_text": "User: Hi\nAssistant: Hello there"}]"#,
    )]));
    let keys = KeyStore::new().with_env_lookup(|name| {
        (name == "HF_API_KEY").then(|| "hf_env".to_string())
    });
    let client = ServiceClient::builder("huggingface", "gpt2")
        .transport(transport.clone())
        .build(&keys);
    assert_eq!(client.supplier(), SupplierKind::Generic);

    let response = client
        .chat_complete(&[Message::user("Hi")], &ChatOptions::default().with_max_tokens(20))
        .await
        .expect("generation");
    assert!(
        extract_answer(&response, SupplierKind::Generic)
            .expect("text")
            .ends_with("Hello there")
    );

    let request = &transport.requests()[0];
    assert_eq!(request.url, "https://api-inference.huggingface.co/models/gpt2");
    assert_eq!(
        request.headers.get("Authorization").map(String::as_str),
        Some("Bearer hf_env")
    );
    assert!(client.status().tokens_in > 0);
}

#[tokio::test]
async fn unsupported_operations_are_typed() {
    let transport = Arc::new(ScriptedTransport::new(&[]));
    let client = ServiceClient::builder("anthropic", "claude-3-haiku")
        .transport(transport.clone())
        .build(&keys());

    let err = client
        .generate_image("a lighthouse", &Default::default())
        .await
        .expect_err("anthropic has no image endpoint");
    assert!(matches!(
        err,
        LLMError::UnsupportedFeature {
            feature: "generate_image"
        }
    ));
    assert!(transport.requests().is_empty());
    assert!(!client.capabilities().expect("caps").supports_image_generation);
}
