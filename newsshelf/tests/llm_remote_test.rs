use std::time::Duration;

use newsshelf::http::RetryPolicy;
use newsshelf::llm::anthropic::AnthropicProvider;
use newsshelf::llm::remote::RemoteLlmProvider;
use newsshelf::llm::{LlmProvider, LlmRequest};

fn request(prompt: &str, timeout_seconds: Option<u64>) -> LlmRequest {
    LlmRequest {
        prompt: prompt.to_string(),
        max_tokens: None,
        temperature: None,
        timeout_seconds,
    }
}

#[tokio::test]
async fn test_remote_provider_with_mock() {
    let mut server = mockito::Server::new_async().await;

    // Mock successful OpenAI response
    let mock = server
        .mock("POST", "/")
        .match_header("authorization", "Bearer fake-api-key")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "model": "gpt-4o-mini",
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": "{\"is_relevant\": true, \"relevance_score\": 0.9}"
                    },
                    "finish_reason": "stop"
                }],
                "usage": {
                    "prompt_tokens": 10,
                    "completion_tokens": 5,
                    "total_tokens": 15
                }
            }"#,
        )
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini");

    let response = provider
        .generate(LlmRequest {
            prompt: "Test prompt".to_string(),
            max_tokens: Some(100),
            temperature: Some(0.0),
            timeout_seconds: Some(10),
        })
        .await
        .expect("generate succeeds");

    assert!(response.content.contains("relevance_score"));
    assert_eq!(response.usage.prompt_tokens, 10);
    assert_eq!(response.usage.total_tokens, 15);
    assert_eq!(response.model, "gpt-4o-mini");

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_error_handling() {
    let mut server = mockito::Server::new_async().await;

    // Mock API error
    let mock = server
        .mock("POST", "/")
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": {"message": "Rate limit exceeded"}}"#)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini");

    let result = provider.generate(request("Test", None)).await;

    assert!(result.is_err());
    let err = result.unwrap_err();
    assert!(err.to_string().contains("429"));

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_retries_server_errors() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(503)
        .with_body("upstream overloaded")
        .expect(3)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini").with_retry(RetryPolicy {
        max_attempts: 3,
        base_backoff: Duration::ZERO,
    });

    let err = provider.generate(request("Test", None)).await.unwrap_err();
    assert!(err.to_string().contains("503"));

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_does_not_retry_client_errors() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(401)
        .with_body(r#"{"error": "bad key"}"#)
        .expect(1)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "wrong-key", "gpt-4o-mini").with_retry(RetryPolicy {
        max_attempts: 3,
        base_backoff: Duration::ZERO,
    });

    let err = provider.generate(request("Test", None)).await.unwrap_err();
    assert!(err.to_string().contains("401"));

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_empty_choices() {
    let mut server = mockito::Server::new_async().await;

    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"model": "gpt-4o-mini", "choices": []}"#)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini");
    let err = provider.generate(request("Test", None)).await.unwrap_err();
    assert!(err.to_string().contains("no choices"));
}

#[tokio::test]
async fn test_remote_provider_timeout() {
    let mut server = mockito::Server::new_async().await;

    // Mock slow response
    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_chunked_body(|w| {
            std::thread::sleep(std::time::Duration::from_secs(3));
            w.write_all(b"too late")
        })
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini");

    let result = provider.generate(request("Test", Some(1))).await;

    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("timed out"));
}

#[tokio::test]
async fn test_anthropic_provider_with_mock() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/v1/messages")
        .match_header("x-api-key", "fake-api-key")
        .match_header("anthropic-version", "2023-06-01")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{
                "model": "claude-3-5-sonnet-20241022",
                "content": [
                    {"type": "text", "text": "{\"relevance_score\": "},
                    {"type": "text", "text": "0.85}"}
                ],
                "usage": {"input_tokens": 20, "output_tokens": 7}
            }"#,
        )
        .create_async()
        .await;

    let provider = AnthropicProvider::new(
        format!("{}/v1/messages", server.url()),
        "fake-api-key",
        "claude-3-5-sonnet-20241022",
    );

    let response = provider.generate(request("Rank this", None)).await.expect("generate succeeds");
    assert_eq!(response.content, "{\"relevance_score\": 0.85}");
    assert_eq!(response.usage.total_tokens, 27);
    assert_eq!(provider.model(), "claude-3-5-sonnet-20241022");

    mock.assert_async().await;
}
