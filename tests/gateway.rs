use axum::http::{ HeaderMap, StatusCode };
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{ Json, Router };
use chatdesk::error::ChatError;
use chatdesk::llm::chat::{ new_client, GatewayMessage };
use chatdesk::llm::{ LlmConfig, LlmType };
use chatdesk::models::chat::Role;
use futures::StreamExt;
use serde_json::{ json, Value };
use std::sync::{ Arc, Mutex };

#[derive(Clone, Default)]
struct Seen {
    requests: Arc<Mutex<Vec<(HeaderMap, Value)>>>,
}

async fn completions(
    axum::extract::State(seen): axum::extract::State<Seen>,
    headers: HeaderMap,
    Json(body): Json<Value>
) -> axum::response::Response {
    seen.requests.lock().unwrap().push((headers, body.clone()));
    if body["messages"][0]["content"] == "boom" {
        return (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response();
    }
    if body["messages"][0]["content"] == "silent" {
        if body["stream"] == true {
            let sse = concat!(
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hal\"},\"finish_reason\":null}]}\n\n",
                "data: {\"error\":{\"message\":\"Provider returned error\",\"code\":502}}\n\n"
            );
            return ([("content-type", "text/event-stream")], sse).into_response();
        }
        return Json(json!({ "choices": [{ "message": { "role": "assistant", "content": null } }] })).into_response();
    }
    if body["stream"] == true {
        let sse = concat!(
            ": keep-alive\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":null}]}\n\n",
            "data: [DONE]\n\n"
        );
        return ([("content-type", "text/event-stream")], sse).into_response();
    }
    Json(json!({ "choices": [{ "message": { "role": "assistant", "content": "Hi there" } }] })).into_response()
}

async fn spawn_gateway() -> (String, Seen) {
    let seen = Seen::default();
    let app = Router::new().route("/v1/chat/completions", post(completions)).with_state(seen.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/v1", addr), seen)
}

fn config(base_url: String) -> LlmConfig {
    LlmConfig {
        llm_type: LlmType::OpenRouter,
        api_key: Some("sk-test".to_string()),
        completion_model: Some("default/model".to_string()),
        base_url: Some(base_url),
        site_url: Some("http://localhost:4001".to_string()),
        site_name: Some("AI Chat Assistant".to_string()),
    }
}

#[tokio::test]
async fn completion_sends_openrouter_headers_and_model() {
    let (base_url, seen) = spawn_gateway().await;
    let client = new_client(&config(base_url)).unwrap();

    let messages = vec![GatewayMessage::new(Role::User, "hello")];
    let reply = client.complete(&messages, Some("openai/gpt-4")).await.unwrap();
    assert_eq!(reply, "Hi there");

    let requests = seen.requests.lock().unwrap();
    let (headers, body) = &requests[0];
    assert_eq!(headers["authorization"], "Bearer sk-test");
    assert_eq!(headers["x-title"], "AI Chat Assistant");
    assert_eq!(headers["http-referer"], "http://localhost:4001");
    assert_eq!(body["model"], "openai/gpt-4");
    assert_eq!(body["messages"], json!([{ "role": "user", "content": "hello" }]));
    assert!(body.get("stream").is_none());
}

#[tokio::test]
async fn non_success_status_is_a_gateway_error() {
    let (base_url, _) = spawn_gateway().await;
    let client = new_client(&config(base_url)).unwrap();

    let err = client.complete(&[GatewayMessage::new(Role::User, "boom")], None).await.unwrap_err();
    match err {
        ChatError::Gateway(message) => assert_eq!(message, "HTTP error! status: 429"),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn streaming_yields_tokens_until_done() {
    let (base_url, seen) = spawn_gateway().await;
    let client = new_client(&config(base_url)).unwrap();

    let stream = client.complete_stream(&[GatewayMessage::new(Role::User, "hi")], None).await.unwrap();
    let tokens: Vec<String> = stream.map(|t| t.unwrap()).collect().await;
    assert_eq!(tokens, vec!["Hel", "lo"]);

    let requests = seen.requests.lock().unwrap();
    assert_eq!(requests[0].1["stream"], true);
    assert_eq!(requests[0].1["model"], "default/model");
}

#[tokio::test]
async fn null_content_and_stream_errors_are_gateway_errors() {
    let (base_url, _) = spawn_gateway().await;
    let client = new_client(&config(base_url)).unwrap();
    let messages = vec![GatewayMessage::new(Role::User, "silent")];

    let err = client.complete(&messages, None).await.unwrap_err();
    assert!(matches!(err, ChatError::Gateway(_)), "{:?}", err);

    let results: Vec<_> = client.complete_stream(&messages, None).await.unwrap().collect().await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_deref().unwrap(), "Hal");
    match &results[1] {
        Err(ChatError::Gateway(message)) => assert!(message.contains("Provider returned error")),
        other => panic!("unexpected item: {:?}", other),
    }
}

#[test]
fn hosted_gateways_need_a_key() {
    let mut cfg = config("http://unused".to_string());
    cfg.api_key = None;
    assert!(matches!(new_client(&cfg), Err(ChatError::Config(_))));

    cfg.llm_type = LlmType::Ollama;
    assert!(new_client(&cfg).is_ok());
}
