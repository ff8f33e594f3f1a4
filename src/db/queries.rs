use crate::db::models::*;
use crate::error::{AppError, AppResult};
use chrono::Utc;
use sqlx::{Pool, Sqlite};
use tracing::info;

pub type DbPool = Pool<Sqlite>;

/// Database operations for notification configurations
pub struct ConfigRepo;

impl ConfigRepo {
    /// Look up a configuration by its opaque code
    pub async fn find_by_code(pool: &DbPool, code: &str) -> AppResult<Option<Configuration>> {
        let config =
            sqlx::query_as::<_, Configuration>("SELECT * FROM configurations WHERE code = ?")
                .bind(code)
                .fetch_optional(pool)
                .await?;

        Ok(config)
    }

    /// Look up by the callback dedup key (corp_id, callback_token)
    pub async fn find_by_callback_key(
        pool: &DbPool,
        corp_id: &str,
        callback_token: &str,
    ) -> AppResult<Option<Configuration>> {
        let config = sqlx::query_as::<_, Configuration>(
            "SELECT * FROM configurations WHERE corp_id = ? AND callback_token = ? AND callback_enabled = true",
        )
        .bind(corp_id)
        .bind(callback_token)
        .fetch_optional(pool)
        .await?;

        Ok(config)
    }

    /// Look up by the full-configuration dedup key
    pub async fn find_by_full_key(
        pool: &DbPool,
        corp_id: &str,
        agent_id: i64,
        recipients: &str,
        callback_enabled: bool,
        callback_token: Option<&str>,
    ) -> AppResult<Option<Configuration>> {
        let config = sqlx::query_as::<_, Configuration>(
            r#"
            SELECT * FROM configurations
            WHERE corp_id = ? AND agent_id = ? AND recipients = ? AND callback_enabled = ?
              AND (callback_token = ? OR (callback_token IS NULL AND ? IS NULL))
            "#,
        )
        .bind(corp_id)
        .bind(agent_id)
        .bind(recipients)
        .bind(callback_enabled)
        .bind(callback_token)
        .bind(callback_token)
        .fetch_optional(pool)
        .await?;

        Ok(config)
    }

    /// Insert a phase-1 record carrying only callback credentials
    pub async fn insert_callback_only(
        pool: &DbPool,
        new: NewCallbackConfiguration,
    ) -> AppResult<Configuration> {
        sqlx::query(
            r#"
            INSERT INTO configurations (
                code, corp_id, description, callback_token, encrypted_aes_key,
                callback_enabled, created_at
            )
            VALUES (?, ?, '', ?, ?, true, ?)
            "#,
        )
        .bind(&new.code)
        .bind(&new.corp_id)
        .bind(&new.callback_token)
        .bind(&new.encrypted_aes_key)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        Self::find_by_code(pool, &new.code)
            .await?
            .ok_or_else(|| AppError::internal("Failed to retrieve created callback configuration"))
    }

    /// Insert a fully-populated record (single-step registration)
    pub async fn insert(pool: &DbPool, new: NewConfiguration) -> AppResult<Configuration> {
        sqlx::query(
            r#"
            INSERT INTO configurations (
                code, corp_id, encrypted_corp_secret, agent_id, recipients, description,
                callback_token, encrypted_aes_key, callback_enabled, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.code)
        .bind(&new.corp_id)
        .bind(&new.encrypted_corp_secret)
        .bind(new.agent_id)
        .bind(&new.recipients)
        .bind(&new.description)
        .bind(&new.callback_token)
        .bind(&new.encrypted_aes_key)
        .bind(new.callback_enabled)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        Self::find_by_code(pool, &new.code)
            .await?
            .ok_or_else(|| AppError::internal("Failed to retrieve created configuration"))
    }

    /// Re-key an existing callback registration in place
    pub async fn update_callback_key(
        pool: &DbPool,
        code: &str,
        callback_token: &str,
        encrypted_aes_key: &str,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE configurations SET callback_token = ?, encrypted_aes_key = ?, callback_enabled = true WHERE code = ?",
        )
        .bind(callback_token)
        .bind(encrypted_aes_key)
        .bind(code)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Phase 2: attach send credentials to a callback-only record
    pub async fn complete(
        pool: &DbPool,
        code: &str,
        encrypted_corp_secret: &str,
        agent_id: i64,
        recipients: &str,
        description: &str,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE configurations
            SET encrypted_corp_secret = ?, agent_id = ?, recipients = ?, description = ?
            WHERE code = ?
            "#,
        )
        .bind(encrypted_corp_secret)
        .bind(agent_id)
        .bind(recipients)
        .bind(description)
        .bind(code)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Overwrite every mutable column of a record
    pub async fn update(pool: &DbPool, code: &str, update: ConfigurationUpdate) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE configurations
            SET corp_id = ?, encrypted_corp_secret = ?, agent_id = ?, recipients = ?,
                description = ?, callback_token = ?, encrypted_aes_key = ?, callback_enabled = ?
            WHERE code = ?
            "#,
        )
        .bind(&update.corp_id)
        .bind(&update.encrypted_corp_secret)
        .bind(update.agent_id)
        .bind(&update.recipients)
        .bind(&update.description)
        .bind(&update.callback_token)
        .bind(&update.encrypted_aes_key)
        .bind(update.callback_enabled)
        .bind(code)
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// Initialize database with migrations
pub async fn init_db(pool: &DbPool) -> AppResult<()> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS configurations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT UNIQUE NOT NULL,
            corp_id TEXT NOT NULL,
            encrypted_corp_secret TEXT,
            agent_id INTEGER,
            recipients TEXT,
            description TEXT NOT NULL DEFAULT '',
            callback_token TEXT,
            encrypted_aes_key TEXT,
            callback_enabled BOOLEAN NOT NULL DEFAULT false,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_configurations_code ON configurations(code)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_configurations_callback_key ON configurations(corp_id, callback_token)",
    )
    .execute(pool)
    .await?;

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
pub async fn setup_test_db() -> DbPool {
    use sqlx::sqlite::SqlitePoolOptions;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    init_db(&pool).await.expect("Failed to init database");
    pool
}
