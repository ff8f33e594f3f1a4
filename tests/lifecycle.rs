//! End-to-end tests over a live HTTP server.
//!
//! The WeCom upstream is replaced with a recording double; everything else
//! (router, service, cipher, SQLite) is the real stack.

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use workpush::crypto::{CallbackCrypto, SecretCipher};
use workpush::db;
use workpush::error::AppResult;
use workpush::service::NotifyService;
use workpush::web;
use workpush::wecom::{MemberInfo, PlatformApi};

const AES_KEY: &str = "jWmYm7qr5nMoAUwZRjGtBxmz3KA1tkAj3ykkR6q2B2C";

#[derive(Debug, Clone)]
struct SentMessage {
    agent_id: i64,
    recipients: String,
    content: String,
}

/// Recording double for the WeCom API
#[derive(Default)]
struct MockPlatform {
    sent: Mutex<Vec<SentMessage>>,
}

#[async_trait]
impl PlatformApi for MockPlatform {
    async fn get_token(&self, _corp_id: &str, _corp_secret: &str) -> AppResult<String> {
        Ok("mock-token".to_string())
    }

    async fn send_text(
        &self,
        _token: &str,
        agent_id: i64,
        recipients: &str,
        content: &str,
    ) -> AppResult<Value> {
        self.sent.lock().unwrap().push(SentMessage {
            agent_id,
            recipients: recipients.to_string(),
            content: content.to_string(),
        });
        Ok(json!({"errcode": 0, "errmsg": "ok", "msgid": "m1"}))
    }

    async fn list_members(&self, _token: &str) -> AppResult<Vec<MemberInfo>> {
        Ok(vec![MemberInfo {
            userid: "u1".to_string(),
            name: "User One".to_string(),
            department: "Ops".to_string(),
        }])
    }
}

/// Start the app on a random port; returns its base URL and the platform double
async fn spawn_app() -> (String, Arc<MockPlatform>) {
    // In-memory SQLite is per-connection, so the pool must stay at one
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::init_db(&pool).await.unwrap();

    let cipher = SecretCipher::new("integration-test-key").unwrap();
    let platform = Arc::new(MockPlatform::default());
    let service = Arc::new(NotifyService::new(pool, cipher, platform.clone()));
    let app = web::create_router(web::AppState { service });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), platform)
}

#[tokio::test]
async fn test_health() {
    let (base, _) = spawn_app().await;
    let response = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_two_phase_lifecycle() {
    let (base, platform) = spawn_app().await;
    let client = reqwest::Client::new();

    // Phase 1: register callback credentials
    let response = client
        .post(format!("{base}/api/generate-callback"))
        .json(&json!({
            "corpid": "wx1",
            "callback_token": "tok",
            "encoding_aes_key": AES_KEY,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    let code = body["code"].as_str().unwrap().to_string();
    assert_eq!(
        body["callbackUrl"].as_str().unwrap(),
        format!("/api/callback/{code}")
    );

    // Registering the same pair again returns the same code
    let response = client
        .post(format!("{base}/api/generate-callback"))
        .json(&json!({
            "corpid": "wx1",
            "callback_token": "tok",
            "encoding_aes_key": AES_KEY,
        }))
        .send()
        .await
        .unwrap();
    let again: Value = response.json().await.unwrap();
    assert_eq!(again["code"].as_str().unwrap(), code);
    assert_eq!(again["updated"], json!(true));

    // Notify before completion is rejected, nothing is sent
    let response = client
        .post(format!("{base}/api/notify/{code}"))
        .json(&json!({"content": "too early"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert!(platform.sent.lock().unwrap().is_empty());

    // Phase 2: attach send credentials
    let response = client
        .post(format!("{base}/api/complete-config"))
        .json(&json!({
            "code": code,
            "corpsecret": "s3cr3t",
            "agentid": 1000002,
            "touser": ["u1", "u2"],
            "description": "ops alerts",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body["apiUrl"].as_str().unwrap(),
        format!("/api/notify/{code}")
    );

    // Notify goes through exactly once, title joined with a line break
    let response = client
        .post(format!("{base}/api/notify/{code}"))
        .json(&json!({"title": "Alert", "content": "CPU high"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["response"]["errcode"], 0);

    let sent = platform.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].content, "Alert\nCPU high");
    assert_eq!(sent[0].recipients, "u1|u2");
    assert_eq!(sent[0].agent_id, 1000002);
}

#[tokio::test]
async fn test_complete_config_unknown_code() {
    let (base, _) = spawn_app().await;
    let response = reqwest::Client::new()
        .post(format!("{base}/api/complete-config"))
        .json(&json!({
            "code": "no-such-code",
            "corpsecret": "s3cr3t",
            "agentid": 1,
            "touser": ["u1"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_notify_validation_and_missing_code() {
    let (base, platform) = spawn_app().await;
    let client = reqwest::Client::new();

    // Empty content is rejected before anything else happens
    let response = client
        .post(format!("{base}/api/notify/whatever"))
        .json(&json!({"title": "t"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert!(platform.sent.lock().unwrap().is_empty());

    // Unknown code with real content is a 404
    let response = client
        .post(format!("{base}/api/notify/whatever"))
        .json(&json!({"content": "body"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_legacy_configure_and_public_view() {
    let (base, _) = spawn_app().await;
    let client = reqwest::Client::new();

    // Recipients arrive as a joined string here
    let response = client
        .post(format!("{base}/api/configure"))
        .json(&json!({
            "corpid": "wx1",
            "corpsecret": "s3cr3t",
            "agentid": 7,
            "touser": "u1|u2",
            "description": "legacy",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let body: Value = response.json().await.unwrap();
    let code = body["code"].as_str().unwrap().to_string();
    assert!(body.get("callbackUrl").is_none());

    let response = client
        .get(format!("{base}/api/configuration/{code}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let config: Value = response.json().await.unwrap();
    assert_eq!(config["corpid"], "wx1");
    assert_eq!(config["touser"], json!(["u1", "u2"]));
    assert_eq!(config["callback_enabled"], json!(false));
    // No ciphertext or secret ever leaves the store
    let raw = config.to_string();
    assert!(!raw.contains("s3cr3t"));

    let response = client
        .get(format!("{base}/api/configuration/missing"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_update_configuration() {
    let (base, platform) = spawn_app().await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base}/api/configure"))
        .json(&json!({
            "corpid": "wx1",
            "corpsecret": "s3cr3t",
            "agentid": 7,
            "touser": ["u1"],
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let code = body["code"].as_str().unwrap().to_string();

    let response = client
        .put(format!("{base}/api/configuration/{code}"))
        .json(&json!({"touser": ["u3"], "description": "updated"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // The untouched secret still works for sending
    client
        .post(format!("{base}/api/notify/{code}"))
        .json(&json!({"content": "after update"}))
        .send()
        .await
        .unwrap()
        .error_for_status()
        .unwrap();
    let sent = platform.sent.lock().unwrap();
    assert_eq!(sent[0].recipients, "u3");
}

#[tokio::test]
async fn test_validate_endpoint() {
    let (base, _) = spawn_app().await;
    let response = reqwest::Client::new()
        .post(format!("{base}/api/validate"))
        .json(&json!({"corpid": "wx1", "corpsecret": "s3cr3t"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["users"][0]["userid"], "u1");
}

#[tokio::test]
async fn test_callback_verification_over_http() {
    let (base, _) = spawn_app().await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base}/api/generate-callback"))
        .json(&json!({
            "corpid": "wx1",
            "callback_token": "tok",
            "encoding_aes_key": AES_KEY,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let code = body["code"].as_str().unwrap().to_string();

    // Platform side of the handshake
    let crypto = CallbackCrypto::new("tok", AES_KEY, "wx1").unwrap();
    let (echostr, signature) = crypto
        .encrypt_msg("echo-payload", "1409659813", "1372623149")
        .unwrap();

    let response = client
        .get(format!("{base}/api/callback/{code}"))
        .query(&[
            ("msg_signature", signature.as_str()),
            ("timestamp", "1409659813"),
            ("nonce", "1372623149"),
            ("echostr", echostr.as_str()),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "echo-payload");

    // Forged signature gets an opaque failure
    let response = client
        .get(format!("{base}/api/callback/{code}"))
        .query(&[
            ("msg_signature", "deadbeef"),
            ("timestamp", "1409659813"),
            ("nonce", "1372623149"),
            ("echostr", echostr.as_str()),
        ])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.unwrap(), "failed");
}

#[tokio::test]
async fn test_callback_message_over_http() {
    let (base, _) = spawn_app().await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base}/api/generate-callback"))
        .json(&json!({
            "corpid": "wx1",
            "callback_token": "tok",
            "encoding_aes_key": AES_KEY,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let code = body["code"].as_str().unwrap().to_string();

    let xml = "<xml><FromUserName><![CDATA[zhangsan]]></FromUserName><MsgType><![CDATA[text]]></MsgType><Content><![CDATA[hello]]></Content></xml>";
    let crypto = CallbackCrypto::new("tok", AES_KEY, "wx1").unwrap();
    let (encrypted, signature) = crypto
        .encrypt_msg(xml, "1409659813", "1372623149")
        .unwrap();

    let response = client
        .post(format!("{base}/api/callback/{code}"))
        .query(&[
            ("msg_signature", signature.as_str()),
            ("timestamp", "1409659813"),
            ("nonce", "1372623149"),
        ])
        .body(encrypted)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");

    // Unknown code is rejected without leaking anything
    let response = client
        .post(format!("{base}/api/callback/unknown"))
        .query(&[
            ("msg_signature", "x"),
            ("timestamp", "1"),
            ("nonce", "2"),
        ])
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    assert_eq!(response.text().await.unwrap(), "failed");
}
