//! Configuration lifecycle: two-phase registration, notification dispatch,
//! and callback handling.
//!
//! All upserts go through read-then-branch under a per-key async lock so two
//! concurrent identical registrations cannot both miss the lookup and insert
//! duplicate rows.

use crate::crypto::callback::{self, CallbackCrypto, CallbackMessage};
use crate::crypto::secret::SecretCipher;
use crate::db::{
    ConfigRepo, Configuration, ConfigurationUpdate, DbPool, NewCallbackConfiguration,
    NewConfiguration, PublicConfiguration,
};
use crate::error::{AppError, AppResult};
use crate::wecom::{MemberInfo, PlatformApi};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

fn notify_path(code: &str) -> String {
    format!("/api/notify/{code}")
}

fn callback_path(code: &str) -> String {
    format!("/api/callback/{code}")
}

/// Result of a callback registration (phase 1)
#[derive(Debug, Clone, Serialize)]
pub struct CallbackRegistration {
    pub code: String,
    pub callback_url: String,
    pub updated: bool,
}

/// Result of phase-2 completion
#[derive(Debug, Clone, Serialize)]
pub struct CompletedConfiguration {
    pub code: String,
    pub notify_url: String,
    pub callback_url: String,
}

/// Result of the single-step (legacy) registration
#[derive(Debug, Clone, Serialize)]
pub struct LegacyRegistration {
    pub code: String,
    pub notify_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub updated: bool,
}

/// Parameters for the single-step registration path
#[derive(Debug, Clone)]
pub struct LegacyRequest {
    pub corp_id: String,
    pub corp_secret: String,
    pub agent_id: i64,
    pub recipients: Vec<String>,
    pub description: String,
    pub callback_token: Option<String>,
    pub encoding_aes_key: Option<String>,
    pub callback_enabled: bool,
}

/// Partial update; absent fields keep their stored values
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub corp_id: Option<String>,
    pub corp_secret: Option<String>,
    pub agent_id: Option<i64>,
    pub recipients: Option<Vec<String>>,
    pub description: Option<String>,
    pub callback_token: Option<String>,
    pub encoding_aes_key: Option<String>,
    pub callback_enabled: Option<bool>,
}

/// Result of a partial update
#[derive(Debug, Clone, Serialize)]
pub struct UpdatedConfiguration {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

/// Outcome of an inbound callback exchange.
///
/// Forged, disabled, or undecryptable traffic is `Rejected` with no further
/// detail; the wire response must not reveal why decryption failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackVerdict<T> {
    Accepted(T),
    Rejected,
}

impl<T> CallbackVerdict<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Orchestrates configuration records, the secret cipher, and the platform
/// client.
pub struct NotifyService<P: PlatformApi> {
    pool: DbPool,
    cipher: SecretCipher,
    platform: Arc<P>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Holds one key's write lock; evicts the map entry on release once no other
/// task references it, so the lock map does not grow with the key space.
struct WriteLockGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    inner: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for WriteLockGuard<'_> {
    fn drop(&mut self) {
        self.inner.take();
        // A waiter holds its own Arc clone, which keeps the count above one
        // and the entry alive
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl<P: PlatformApi> NotifyService<P> {
    pub fn new(pool: DbPool, cipher: SecretCipher, platform: Arc<P>) -> Self {
        Self {
            pool,
            cipher,
            platform,
            write_locks: DashMap::new(),
        }
    }

    /// Acquire the write lock serializing mutations for one dedup key.
    async fn acquire_write_lock(&self, key: String) -> WriteLockGuard<'_> {
        let lock = self
            .write_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let inner = lock.lock_owned().await;
        WriteLockGuard {
            locks: &self.write_locks,
            key,
            inner: Some(inner),
        }
    }

    fn validate_encoding_key(encoding_aes_key: &str) -> AppResult<()> {
        callback::validate_encoding_key(encoding_aes_key).map_err(|_| {
            AppError::validation(format!(
                "EncodingAESKey must be {} base64 characters",
                callback::ENCODING_AES_KEY_LEN
            ))
        })
    }

    /// Phase 1: register callback credentials and hand out a code.
    ///
    /// Idempotent over (corp_id, callback_token): re-registration re-encrypts
    /// the key material in place and returns the existing code.
    pub async fn register_callback(
        &self,
        corp_id: &str,
        callback_token: &str,
        encoding_aes_key: &str,
    ) -> AppResult<CallbackRegistration> {
        if corp_id.is_empty() || callback_token.is_empty() {
            return Err(AppError::validation("corp_id and callback_token are required"));
        }
        Self::validate_encoding_key(encoding_aes_key)?;

        let _guard = self
            .acquire_write_lock(format!("cb:{corp_id}:{callback_token}"))
            .await;

        let encrypted_aes_key = self.cipher.encrypt(encoding_aes_key)?;

        if let Some(existing) =
            ConfigRepo::find_by_callback_key(&self.pool, corp_id, callback_token).await?
        {
            info!("Callback re-registered for corp {}, code {}", corp_id, existing.code);
            ConfigRepo::update_callback_key(
                &self.pool,
                &existing.code,
                callback_token,
                &encrypted_aes_key,
            )
            .await?;
            return Ok(CallbackRegistration {
                callback_url: callback_path(&existing.code),
                code: existing.code,
                updated: true,
            });
        }

        let code = Configuration::generate_code();
        ConfigRepo::insert_callback_only(
            &self.pool,
            NewCallbackConfiguration {
                code: code.clone(),
                corp_id: corp_id.to_string(),
                callback_token: callback_token.to_string(),
                encrypted_aes_key,
            },
        )
        .await?;

        info!("Callback registered for corp {}, code {}", corp_id, code);
        Ok(CallbackRegistration {
            callback_url: callback_path(&code),
            code,
            updated: false,
        })
    }

    /// Phase 2: attach send credentials to a previously registered code.
    pub async fn complete_configuration(
        &self,
        code: &str,
        corp_secret: &str,
        agent_id: i64,
        recipients: &[String],
        description: &str,
    ) -> AppResult<CompletedConfiguration> {
        if corp_secret.is_empty() || recipients.is_empty() {
            return Err(AppError::validation("corp_secret and recipients are required"));
        }

        let _guard = self.acquire_write_lock(format!("code:{code}")).await;

        ConfigRepo::find_by_code(&self.pool, code)
            .await?
            .ok_or_else(|| AppError::NotFound(code.to_string()))?;

        let encrypted_corp_secret = self.cipher.encrypt(corp_secret)?;
        let joined = crate::db::join_recipients(recipients);
        ConfigRepo::complete(
            &self.pool,
            code,
            &encrypted_corp_secret,
            agent_id,
            &joined,
            description,
        )
        .await?;

        info!("Configuration completed, code {}", code);
        Ok(CompletedConfiguration {
            notify_url: notify_path(code),
            callback_url: callback_path(code),
            code: code.to_string(),
        })
    }

    /// Single-step registration, kept for pre-two-phase clients.
    ///
    /// Idempotent over the full dedup key (corp_id, agent_id, recipients,
    /// callback_enabled, callback_token); a matching record is updated in
    /// place, description included.
    pub async fn create_legacy(&self, request: LegacyRequest) -> AppResult<LegacyRegistration> {
        if request.corp_id.is_empty() || request.corp_secret.is_empty() {
            return Err(AppError::validation("corp_id and corp_secret are required"));
        }
        if request.recipients.is_empty() {
            return Err(AppError::validation("recipients must not be empty"));
        }
        if request.callback_enabled {
            match (&request.callback_token, &request.encoding_aes_key) {
                (Some(token), Some(key)) if !token.is_empty() => {
                    Self::validate_encoding_key(key)?;
                }
                _ => {
                    return Err(AppError::validation(
                        "callback_token and encoding_aes_key are required when callback is enabled",
                    ));
                }
            }
        }

        let joined = crate::db::join_recipients(&request.recipients);
        let token = request
            .callback_enabled
            .then(|| request.callback_token.clone())
            .flatten();

        let _guard = self
            .acquire_write_lock(format!(
                "full:{}:{}:{}:{}:{}",
                request.corp_id,
                request.agent_id,
                joined,
                request.callback_enabled,
                token.as_deref().unwrap_or("")
            ))
            .await;

        let encrypted_corp_secret = self.cipher.encrypt(&request.corp_secret)?;
        let encrypted_aes_key = match request.callback_enabled {
            true => match &request.encoding_aes_key {
                Some(key) => Some(self.cipher.encrypt(key)?),
                None => None,
            },
            false => None,
        };

        if let Some(existing) = ConfigRepo::find_by_full_key(
            &self.pool,
            &request.corp_id,
            request.agent_id,
            &joined,
            request.callback_enabled,
            token.as_deref(),
        )
        .await?
        {
            info!("Duplicate configuration, updating code {}", existing.code);
            ConfigRepo::update(
                &self.pool,
                &existing.code,
                ConfigurationUpdate {
                    corp_id: request.corp_id,
                    encrypted_corp_secret: Some(encrypted_corp_secret),
                    agent_id: Some(request.agent_id),
                    recipients: Some(joined),
                    description: request.description,
                    callback_token: token,
                    encrypted_aes_key,
                    callback_enabled: request.callback_enabled,
                },
            )
            .await?;
            return Ok(LegacyRegistration {
                notify_url: notify_path(&existing.code),
                callback_url: request
                    .callback_enabled
                    .then(|| callback_path(&existing.code)),
                code: existing.code,
                updated: true,
            });
        }

        let code = Configuration::generate_code();
        ConfigRepo::insert(
            &self.pool,
            NewConfiguration {
                code: code.clone(),
                corp_id: request.corp_id,
                encrypted_corp_secret,
                agent_id: request.agent_id,
                recipients: joined,
                description: request.description,
                callback_token: token,
                encrypted_aes_key,
                callback_enabled: request.callback_enabled,
            },
        )
        .await?;

        info!("Configuration created, code {}", code);
        Ok(LegacyRegistration {
            notify_url: notify_path(&code),
            callback_url: request.callback_enabled.then(|| callback_path(&code)),
            code,
            updated: false,
        })
    }

    /// Send a notification through a stored configuration.
    ///
    /// Title and content are joined with a line break when a title is
    /// present. The platform result is returned verbatim.
    pub async fn notify(
        &self,
        code: &str,
        title: Option<&str>,
        content: &str,
    ) -> AppResult<serde_json::Value> {
        if content.is_empty() {
            return Err(AppError::validation("content must not be empty"));
        }

        let config = ConfigRepo::find_by_code(&self.pool, code)
            .await?
            .ok_or_else(|| AppError::NotFound(code.to_string()))?;

        let (encrypted_secret, agent_id, recipients) =
            match (&config.encrypted_corp_secret, config.agent_id, &config.recipients) {
                (Some(secret), Some(agent_id), Some(recipients)) => {
                    (secret, agent_id, recipients.clone())
                }
                _ => {
                    return Err(AppError::validation(
                        "configuration is incomplete; complete it before sending",
                    ));
                }
            };

        let corp_secret = self.cipher.decrypt(encrypted_secret)?;
        let token = self.platform.get_token(&config.corp_id, &corp_secret).await?;

        let message = match title {
            Some(title) if !title.is_empty() => format!("{title}\n{content}"),
            _ => content.to_string(),
        };

        let result = self
            .platform
            .send_text(&token, agent_id, &recipients, &message)
            .await?;
        info!("Notification sent, code {}", code);
        Ok(result)
    }

    /// Read the public (non-secret) view of a configuration.
    pub async fn get_public_configuration(
        &self,
        code: &str,
    ) -> AppResult<Option<PublicConfiguration>> {
        Ok(ConfigRepo::find_by_code(&self.pool, code)
            .await?
            .map(Into::into))
    }

    /// Partially update a configuration; only supplied fields are
    /// re-encrypted or changed.
    pub async fn update_configuration(
        &self,
        code: &str,
        request: UpdateRequest,
    ) -> AppResult<UpdatedConfiguration> {
        // Serialize read-modify-write per code; two concurrent partial
        // updates must not clobber each other's fields
        let _guard = self.acquire_write_lock(format!("code:{code}")).await;

        let existing = ConfigRepo::find_by_code(&self.pool, code)
            .await?
            .ok_or_else(|| AppError::NotFound(code.to_string()))?;

        let encrypted_corp_secret = match &request.corp_secret {
            Some(secret) => Some(self.cipher.encrypt(secret)?),
            None => existing.encrypted_corp_secret.clone(),
        };
        let encrypted_aes_key = match &request.encoding_aes_key {
            Some(key) => {
                Self::validate_encoding_key(key)?;
                Some(self.cipher.encrypt(key)?)
            }
            None => existing.encrypted_aes_key.clone(),
        };
        let callback_enabled = request.callback_enabled.unwrap_or(existing.callback_enabled);

        ConfigRepo::update(
            &self.pool,
            code,
            ConfigurationUpdate {
                corp_id: request.corp_id.unwrap_or(existing.corp_id),
                encrypted_corp_secret,
                agent_id: request.agent_id.or(existing.agent_id),
                recipients: request
                    .recipients
                    .map(|r| crate::db::join_recipients(&r))
                    .or(existing.recipients),
                description: request.description.unwrap_or(existing.description),
                callback_token: request.callback_token.or(existing.callback_token),
                encrypted_aes_key,
                callback_enabled,
            },
        )
        .await?;

        info!("Configuration updated, code {}", code);
        Ok(UpdatedConfiguration {
            code: code.to_string(),
            callback_url: callback_enabled.then(|| callback_path(code)),
        })
    }

    /// Validate a credential pair against the platform and list the members
    /// it can message.
    pub async fn validate_credentials(
        &self,
        corp_id: &str,
        corp_secret: &str,
    ) -> AppResult<Vec<MemberInfo>> {
        if corp_id.is_empty() || corp_secret.is_empty() {
            return Err(AppError::validation("corp_id and corp_secret are required"));
        }
        let token = self.platform.get_token(corp_id, corp_secret).await?;
        self.platform.list_members(&token).await
    }

    /// Build the per-request callback crypto context, or None when the record
    /// cannot serve callbacks.
    async fn callback_context(&self, code: &str) -> AppResult<Option<CallbackCrypto>> {
        let Some(config) = ConfigRepo::find_by_code(&self.pool, code).await? else {
            return Ok(None);
        };
        if !config.has_callback_material() {
            return Ok(None);
        }
        let (Some(token), Some(encrypted_key)) =
            (&config.callback_token, &config.encrypted_aes_key)
        else {
            return Ok(None);
        };

        let encoding_aes_key = self.cipher.decrypt(encrypted_key)?;
        match CallbackCrypto::new(token, &encoding_aes_key, &config.corp_id) {
            Ok(crypto) => Ok(Some(crypto)),
            Err(e) => {
                warn!("Stored callback key for code {} is unusable: {}", code, e);
                Ok(None)
            }
        }
    }

    /// URL verification handshake (GET callback).
    pub async fn handle_callback_verification(
        &self,
        code: &str,
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
        echostr: &str,
    ) -> AppResult<CallbackVerdict<String>> {
        let Some(crypto) = self.callback_context(code).await? else {
            warn!("Callback verification for code {} without usable callback config", code);
            return Ok(CallbackVerdict::Rejected);
        };

        match crypto.verify_url(msg_signature, timestamp, nonce, echostr) {
            Ok(echo) => {
                info!("Callback URL verified, code {}", code);
                Ok(CallbackVerdict::Accepted(echo))
            }
            Err(e) => {
                warn!("Callback verification rejected for code {}: {}", code, e);
                Ok(CallbackVerdict::Rejected)
            }
        }
    }

    /// Inbound message delivery (POST callback).
    pub async fn handle_callback_message(
        &self,
        code: &str,
        encrypted_body: &str,
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
    ) -> AppResult<CallbackVerdict<CallbackMessage>> {
        let Some(crypto) = self.callback_context(code).await? else {
            warn!("Callback message for code {} without usable callback config", code);
            return Ok(CallbackVerdict::Rejected);
        };

        let xml = match crypto.decrypt_msg(msg_signature, timestamp, nonce, encrypted_body) {
            Ok(xml) => xml,
            Err(e) => {
                warn!("Callback message rejected for code {}: {}", code, e);
                return Ok(CallbackVerdict::Rejected);
            }
        };

        match CallbackCrypto::parse_message(&xml) {
            Ok(message) => {
                info!(
                    "Callback message, code {}: from={} type={}",
                    code, message.from_user, message.msg_type
                );
                Ok(CallbackVerdict::Accepted(message))
            }
            Err(e) => {
                warn!("Callback payload unparseable for code {}: {}", code, e);
                Ok(CallbackVerdict::Rejected)
            }
        }
    }
}
