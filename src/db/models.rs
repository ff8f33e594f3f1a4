use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Recipients are stored as a '|'-delimited string, the separator the WeCom
/// send API itself uses.
pub const RECIPIENT_SEPARATOR: char = '|';

pub fn join_recipients(recipients: &[String]) -> String {
    recipients.join(&RECIPIENT_SEPARATOR.to_string())
}

pub fn split_recipients(joined: &str) -> Vec<String> {
    joined
        .split(RECIPIENT_SEPARATOR)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// A stored notification configuration.
///
/// Phase 1 (callback registration) creates the row with only the callback
/// columns set; phase 2 fills in the send credentials. Secrets are only ever
/// stored as SecretCipher envelopes.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Configuration {
    pub id: i64,
    pub code: String,
    pub corp_id: String,
    pub encrypted_corp_secret: Option<String>,
    pub agent_id: Option<i64>,
    pub recipients: Option<String>, // '|'-delimited user ids
    pub description: String,
    pub callback_token: Option<String>,
    pub encrypted_aes_key: Option<String>,
    pub callback_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Configuration {
    /// Whether phase 2 has completed and the record can send notifications.
    pub fn is_complete(&self) -> bool {
        self.encrypted_corp_secret.is_some()
            && self.agent_id.is_some()
            && self.recipients.is_some()
    }

    /// Whether the record has everything needed to serve callbacks.
    pub fn has_callback_material(&self) -> bool {
        self.callback_enabled
            && self.callback_token.is_some()
            && self.encrypted_aes_key.is_some()
    }

    pub fn generate_code() -> String {
        Uuid::new_v4().to_string()
    }
}

/// Client-facing projection of a configuration. Never carries ciphertext.
#[derive(Debug, Clone, Serialize)]
pub struct PublicConfiguration {
    pub code: String,
    pub corp_id: String,
    pub agent_id: Option<i64>,
    pub recipients: Vec<String>,
    pub description: String,
    pub callback_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Configuration> for PublicConfiguration {
    fn from(config: Configuration) -> Self {
        let callback_url = config
            .callback_enabled
            .then(|| format!("/api/callback/{}", config.code));
        let callback_token = if config.callback_enabled {
            config.callback_token
        } else {
            None
        };
        Self {
            code: config.code,
            corp_id: config.corp_id,
            agent_id: config.agent_id,
            recipients: config
                .recipients
                .as_deref()
                .map(split_recipients)
                .unwrap_or_default(),
            description: config.description,
            callback_enabled: config.callback_enabled,
            callback_token,
            callback_url,
            created_at: config.created_at,
        }
    }
}

/// Phase-1 row: callback credentials only
#[derive(Debug, Clone)]
pub struct NewCallbackConfiguration {
    pub code: String,
    pub corp_id: String,
    pub callback_token: String,
    pub encrypted_aes_key: String,
}

/// Fully-populated row for the single-step registration path
#[derive(Debug, Clone)]
pub struct NewConfiguration {
    pub code: String,
    pub corp_id: String,
    pub encrypted_corp_secret: String,
    pub agent_id: i64,
    pub recipients: String,
    pub description: String,
    pub callback_token: Option<String>,
    pub encrypted_aes_key: Option<String>,
    pub callback_enabled: bool,
}

/// Full overwrite of a record's mutable columns (code and created_at are
/// immutable)
#[derive(Debug, Clone)]
pub struct ConfigurationUpdate {
    pub corp_id: String,
    pub encrypted_corp_secret: Option<String>,
    pub agent_id: Option<i64>,
    pub recipients: Option<String>,
    pub description: String,
    pub callback_token: Option<String>,
    pub encrypted_aes_key: Option<String>,
    pub callback_enabled: bool,
}
