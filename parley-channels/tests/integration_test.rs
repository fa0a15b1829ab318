//! Integration tests for the Telegram transport and the webhook pipeline.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use parley_channels::routes::SECRET_HEADER;
use parley_channels::{build_router, create_state, spawn_processor, TelegramChannel};
use parley_common::Config;
use parley_gateway::OpenAiCompatibleProvider;
use parley_memory::{build_handler, DeliveryError, MessageHandle, SessionStore, SystemClock, Transport};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "123:ABC";

fn channel(server: &MockServer) -> TelegramChannel {
    TelegramChannel::new(TOKEN.into()).with_api_base(&server.uri())
}

fn api_path(method: &str) -> String {
    format!("/bot{TOKEN}/{method}")
}

fn sent(message_id: i64) -> Value {
    json!({
        "ok": true,
        "result": {
            "message_id": message_id,
            "date": 1700000000,
            "chat": {"id": 42, "type": "private"},
            "text": "ignored"
        }
    })
}

async fn request_json(app: axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn webhook_request(update: &Value, secret: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json");
    if let Some(secret) = secret {
        builder = builder.header(SECRET_HEADER, secret);
    }
    builder.body(Body::from(update.to_string())).unwrap()
}

fn text_update(user_id: i64, chat_id: i64, text: &str) -> Value {
    json!({
        "update_id": 1,
        "message": {
            "message_id": 10,
            "date": 1700000000,
            "chat": {"id": chat_id, "type": "private"},
            "from": {"id": user_id, "is_bot": false, "first_name": "Ada"},
            "text": text
        }
    })
}

// ============================================================================
// Routes
// ============================================================================

#[tokio::test]
async fn health_reports_service() {
    let (state, _rx) = create_state(None);
    let (status, body) = request_json(
        build_router(state),
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "parley");
}

#[tokio::test]
async fn ready_while_queue_open() {
    let (state, _rx) = create_state(None);
    let (status, body) = request_json(
        build_router(state),
        Request::builder().uri("/ready").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
}

#[tokio::test]
async fn webhook_rejects_bad_secret_with_body() {
    let (state, mut rx) = create_state(Some("s3cret".into()));
    let (status, body) = request_json(
        build_router(state),
        webhook_request(&text_update(1, 1, "hi"), Some("nope")),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn empty_secret_disables_check() {
    let (state, mut rx) = create_state(Some(String::new()));
    let (status, _) = request_json(
        build_router(state),
        webhook_request(&text_update(7, 8, "hi"), None),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let msg = rx.try_recv().unwrap();
    assert_eq!(msg.user_id, "7");
    assert_eq!(msg.chat_id, 8);
}

#[tokio::test]
async fn webhook_accepts_updates_without_message() {
    let (state, mut rx) = create_state(None);
    let (status, body) = request_json(
        build_router(state),
        webhook_request(&json!({"update_id": 5, "edited_message": {}}), None),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn webhook_rejects_malformed_json() {
    let (state, _rx) = create_state(None);
    let req = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = build_router(state).oneshot(req).await.unwrap();

    assert!(response.status().is_client_error());
}

// ============================================================================
// Telegram transport
// ============================================================================

#[tokio::test]
async fn send_message_posts_plain_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("sendMessage")))
        .and(body_partial_json(json!({
            "chat_id": 42,
            "text": "hello",
            "disable_web_page_preview": true
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(sent(77)))
        .expect(1)
        .mount(&server)
        .await;

    let handle = channel(&server).deliver_text(42, "hello").await.unwrap();
    assert_eq!(
        handle,
        MessageHandle {
            chat_id: 42,
            message_id: 77
        }
    );
}

#[tokio::test]
async fn edit_message_targets_handle() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("editMessageText")))
        .and(body_partial_json(json!({
            "chat_id": 42,
            "message_id": 77,
            "text": "hello world"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(sent(77)))
        .expect(1)
        .mount(&server)
        .await;

    let handle = MessageHandle {
        chat_id: 42,
        message_id: 77,
    };
    let next = channel(&server)
        .deliver_incremental_text(&handle, "hello world")
        .await
        .unwrap();
    assert_eq!(next, handle);
}

#[tokio::test]
async fn unchanged_edit_is_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("editMessageText")))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "ok": false,
            "error_code": 400,
            "description": "Bad Request: message is not modified: specified new message content and reply markup are exactly the same"
        })))
        .mount(&server)
        .await;

    let result = channel(&server).edit_message_text(42, 77, "same").await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("sendMessage")))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "ok": false,
            "error_code": 429,
            "description": "Too Many Requests: retry after 9",
            "parameters": {"retry_after": 9}
        })))
        .mount(&server)
        .await;

    let err = channel(&server).send_message(42, "hi").await.unwrap_err();
    assert_eq!(err, DeliveryError::RateLimited { retry_after_secs: 9 });
}

#[tokio::test]
async fn rejected_send_keeps_description() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("sendMessage")))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "ok": false,
            "error_code": 400,
            "description": "Bad Request: chat not found"
        })))
        .mount(&server)
        .await;

    match channel(&server).send_message(1, "hi").await {
        Err(DeliveryError::Rejected(description)) => {
            assert!(description.contains("chat not found"));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn get_me_reads_bot_user() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("getMe")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {"id": 123, "is_bot": true, "first_name": "Parley", "username": "parley_bot"}
        })))
        .mount(&server)
        .await;

    let me = channel(&server).get_me().await.unwrap();
    assert_eq!(me.id, 123);
    assert_eq!(me.username.as_deref(), Some("parley_bot"));
}

#[tokio::test]
async fn set_webhook_sends_secret() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("setWebhook")))
        .and(body_partial_json(json!({
            "url": "https://bot.example.com/webhook",
            "secret_token": "s3cret"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": true})))
        .expect(1)
        .mount(&server)
        .await;

    channel(&server)
        .set_webhook("https://bot.example.com/webhook", Some("s3cret"))
        .await
        .unwrap();
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn webhook_update_is_answered_through_telegram() {
    let llm = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": false})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hi Ada!"},
                "finish_reason": "stop"
            }]
        })))
        .expect(1)
        .mount(&llm)
        .await;

    let telegram = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(api_path("sendMessage")))
        .and(body_partial_json(json!({"chat_id": 555, "text": "Hi Ada!"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(sent(1)))
        .expect(1)
        .mount(&telegram)
        .await;

    let mut config = Config::default();
    config.llm.base_url = format!("{}/v1", llm.uri());
    config.llm.api_key = Some("sk-test".into());
    config.llm.stream = false;

    let store = Arc::new(SessionStore::new(Arc::new(SystemClock)));
    let handler = Arc::new(build_handler(
        &config,
        store.clone(),
        Arc::new(OpenAiCompatibleProvider::from_config(&config.llm)),
        Arc::new(channel(&telegram)),
    ));

    let (state, rx) = create_state(None);
    let processor = spawn_processor(handler, rx);

    let (status, _) = request_json(
        build_router(state),
        webhook_request(&text_update(987, 555, "hello"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // wait for the reply to reach Telegram
    let mut answered = false;
    for _ in 0..100 {
        let requests = telegram.received_requests().await.unwrap_or_default();
        if requests.iter().any(|r| r.url.path().ends_with("/sendMessage")) {
            answered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    processor.abort();

    assert!(answered, "reply was not delivered");
    assert!(store.contains("987"));
    telegram.verify().await;
    llm.verify().await;
}
