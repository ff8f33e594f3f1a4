use crate::db::{split_recipients, PublicConfiguration};
use crate::error::{AppError, AppResult};
use crate::service::{CallbackVerdict, LegacyRequest, NotifyService, UpdateRequest};
use crate::wecom::{MemberInfo, PlatformApi};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::error;

/// Application state for web handlers
pub struct AppState<P: PlatformApi> {
    pub service: Arc<NotifyService<P>>,
}

impl<P: PlatformApi> Clone for AppState<P> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
        }
    }
}

/// Recipient list on the wire: either a JSON array or a `|`-joined string
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RecipientsField {
    List(Vec<String>),
    Joined(String),
}

impl RecipientsField {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::List(list) => list,
            Self::Joined(joined) => split_recipients(&joined),
        }
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Deserialize)]
pub struct ValidateRequest {
    corpid: String,
    corpsecret: String,
}

#[derive(Serialize)]
pub struct ValidateResponse {
    users: Vec<MemberInfo>,
}

/// Validate credentials and list the members they can reach
pub async fn validate<P: PlatformApi + 'static>(
    State(state): State<AppState<P>>,
    Json(request): Json<ValidateRequest>,
) -> AppResult<Json<ValidateResponse>> {
    let users = state
        .service
        .validate_credentials(&request.corpid, &request.corpsecret)
        .await?;
    Ok(Json(ValidateResponse { users }))
}

#[derive(Deserialize)]
pub struct GenerateCallbackRequest {
    corpid: String,
    callback_token: String,
    encoding_aes_key: String,
}

#[derive(Serialize)]
pub struct GenerateCallbackResponse {
    code: String,
    #[serde(rename = "callbackUrl")]
    callback_url: String,
    updated: bool,
}

/// Phase 1: register callback credentials, returning the code and URL
pub async fn generate_callback<P: PlatformApi + 'static>(
    State(state): State<AppState<P>>,
    Json(request): Json<GenerateCallbackRequest>,
) -> AppResult<Json<GenerateCallbackResponse>> {
    let registration = state
        .service
        .register_callback(
            &request.corpid,
            &request.callback_token,
            &request.encoding_aes_key,
        )
        .await?;
    Ok(Json(GenerateCallbackResponse {
        code: registration.code,
        callback_url: registration.callback_url,
        updated: registration.updated,
    }))
}

#[derive(Deserialize)]
pub struct CompleteConfigRequest {
    code: String,
    corpsecret: String,
    agentid: i64,
    touser: RecipientsField,
    #[serde(default)]
    description: String,
}

#[derive(Serialize)]
pub struct ConfigUrlsResponse {
    code: String,
    #[serde(rename = "apiUrl")]
    api_url: String,
    #[serde(rename = "callbackUrl", skip_serializing_if = "Option::is_none")]
    callback_url: Option<String>,
}

/// Phase 2: attach send credentials to a registered code
pub async fn complete_config<P: PlatformApi + 'static>(
    State(state): State<AppState<P>>,
    Json(request): Json<CompleteConfigRequest>,
) -> AppResult<(StatusCode, Json<ConfigUrlsResponse>)> {
    let completed = state
        .service
        .complete_configuration(
            &request.code,
            &request.corpsecret,
            request.agentid,
            &request.touser.into_vec(),
            &request.description,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ConfigUrlsResponse {
            code: completed.code,
            api_url: completed.notify_url,
            callback_url: Some(completed.callback_url),
        }),
    ))
}

#[derive(Deserialize)]
pub struct ConfigureRequest {
    corpid: String,
    corpsecret: String,
    agentid: i64,
    touser: RecipientsField,
    #[serde(default)]
    description: String,
    #[serde(default)]
    callback_token: Option<String>,
    #[serde(default)]
    encoding_aes_key: Option<String>,
    #[serde(default)]
    callback_enabled: bool,
}

/// Single-step registration, kept for pre-two-phase clients
pub async fn configure<P: PlatformApi + 'static>(
    State(state): State<AppState<P>>,
    Json(request): Json<ConfigureRequest>,
) -> AppResult<(StatusCode, Json<ConfigUrlsResponse>)> {
    let created = state
        .service
        .create_legacy(LegacyRequest {
            corp_id: request.corpid,
            corp_secret: request.corpsecret,
            agent_id: request.agentid,
            recipients: request.touser.into_vec(),
            description: request.description,
            callback_token: request.callback_token,
            encoding_aes_key: request.encoding_aes_key,
            callback_enabled: request.callback_enabled,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ConfigUrlsResponse {
            code: created.code,
            api_url: created.notify_url,
            callback_url: created.callback_url,
        }),
    ))
}

#[derive(Deserialize)]
pub struct NotifyRequest {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: String,
}

#[derive(Serialize)]
pub struct NotifyResponse {
    message: String,
    response: serde_json::Value,
}

/// Send a notification through a stored configuration
pub async fn notify<P: PlatformApi + 'static>(
    Path(code): Path<String>,
    State(state): State<AppState<P>>,
    Json(request): Json<NotifyRequest>,
) -> AppResult<Json<NotifyResponse>> {
    let response = state
        .service
        .notify(&code, request.title.as_deref(), &request.content)
        .await?;
    Ok(Json(NotifyResponse {
        message: "Message sent".to_string(),
        response,
    }))
}

#[derive(Serialize)]
pub struct ConfigurationResponse {
    code: String,
    corpid: String,
    agentid: Option<i64>,
    touser: Vec<String>,
    description: String,
    callback_enabled: bool,
    created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_token: Option<String>,
    #[serde(rename = "callbackUrl", skip_serializing_if = "Option::is_none")]
    callback_url: Option<String>,
}

impl From<PublicConfiguration> for ConfigurationResponse {
    fn from(config: PublicConfiguration) -> Self {
        Self {
            code: config.code,
            corpid: config.corp_id,
            agentid: config.agent_id,
            touser: config.recipients,
            description: config.description,
            callback_enabled: config.callback_enabled,
            created_at: config.created_at.to_rfc3339(),
            callback_token: config.callback_token,
            callback_url: config.callback_url,
        }
    }
}

/// Read the public view of a configuration
pub async fn get_configuration<P: PlatformApi + 'static>(
    Path(code): Path<String>,
    State(state): State<AppState<P>>,
) -> AppResult<Json<ConfigurationResponse>> {
    let config = state
        .service
        .get_public_configuration(&code)
        .await?
        .ok_or(AppError::NotFound(code))?;
    Ok(Json(config.into()))
}

#[derive(Deserialize, Default)]
pub struct UpdateConfigRequest {
    #[serde(default)]
    corpid: Option<String>,
    #[serde(default)]
    corpsecret: Option<String>,
    #[serde(default)]
    agentid: Option<i64>,
    #[serde(default)]
    touser: Option<RecipientsField>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    callback_token: Option<String>,
    #[serde(default)]
    encoding_aes_key: Option<String>,
    #[serde(default)]
    callback_enabled: Option<bool>,
}

#[derive(Serialize)]
pub struct UpdateConfigResponse {
    message: String,
    code: String,
    #[serde(rename = "callbackUrl", skip_serializing_if = "Option::is_none")]
    callback_url: Option<String>,
}

/// Partially update a configuration
pub async fn update_configuration<P: PlatformApi + 'static>(
    Path(code): Path<String>,
    State(state): State<AppState<P>>,
    Json(request): Json<UpdateConfigRequest>,
) -> AppResult<Json<UpdateConfigResponse>> {
    let updated = state
        .service
        .update_configuration(
            &code,
            UpdateRequest {
                corp_id: request.corpid,
                corp_secret: request.corpsecret,
                agent_id: request.agentid,
                recipients: request.touser.map(RecipientsField::into_vec),
                description: request.description,
                callback_token: request.callback_token,
                encoding_aes_key: request.encoding_aes_key,
                callback_enabled: request.callback_enabled,
            },
        )
        .await?;
    Ok(Json(UpdateConfigResponse {
        message: "Configuration updated".to_string(),
        code: updated.code,
        callback_url: updated.callback_url,
    }))
}

#[derive(Deserialize)]
pub struct VerifyParams {
    msg_signature: String,
    timestamp: String,
    nonce: String,
    echostr: String,
}

/// Callback URL verification handshake.
///
/// On success the decrypted echo string is returned as the plain-text body;
/// any rejection is an opaque `failed`.
pub async fn callback_verify<P: PlatformApi + 'static>(
    Path(code): Path<String>,
    Query(params): Query<VerifyParams>,
    State(state): State<AppState<P>>,
) -> Response {
    let verdict = state
        .service
        .handle_callback_verification(
            &code,
            &params.msg_signature,
            &params.timestamp,
            &params.nonce,
            &params.echostr,
        )
        .await;

    match verdict {
        Ok(CallbackVerdict::Accepted(echo)) => echo.into_response(),
        Ok(CallbackVerdict::Rejected) => (StatusCode::BAD_REQUEST, "failed").into_response(),
        Err(e) => {
            error!("Callback verification error for code {}: {}", code, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "failed").into_response()
        }
    }
}

#[derive(Deserialize)]
pub struct MessageParams {
    msg_signature: String,
    timestamp: String,
    nonce: String,
}

/// Inbound callback message delivery.
///
/// The platform expects a literal `ok` acknowledgement; it retries on
/// anything else.
pub async fn callback_message<P: PlatformApi + 'static>(
    Path(code): Path<String>,
    Query(params): Query<MessageParams>,
    State(state): State<AppState<P>>,
    body: String,
) -> Response {
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "failed").into_response();
    }

    let verdict = state
        .service
        .handle_callback_message(
            &code,
            &body,
            &params.msg_signature,
            &params.timestamp,
            &params.nonce,
        )
        .await;

    match verdict {
        Ok(CallbackVerdict::Accepted(_)) => "ok".into_response(),
        Ok(CallbackVerdict::Rejected) => (StatusCode::BAD_REQUEST, "failed").into_response(),
        Err(e) => {
            error!("Callback message error for code {}: {}", code, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "failed").into_response()
        }
    }
}

/// Create the web router
pub fn create_router<P: PlatformApi + 'static>(state: AppState<P>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/validate", post(validate))
        .route("/api/generate-callback", post(generate_callback))
        .route("/api/complete-config", post(complete_config))
        .route("/api/configure", post(configure))
        .route("/api/notify/{code}", post(notify))
        .route(
            "/api/configuration/{code}",
            get(get_configuration).put(update_configuration),
        )
        .route(
            "/api/callback/{code}",
            get(callback_verify).post(callback_message),
        )
        .with_state(state)
        .fallback_service(ServeDir::new("static"))
        .layer(cors)
}
