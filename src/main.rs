use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use workpush::crypto::SecretCipher;
use workpush::service::NotifyService;
use workpush::wecom::WecomClient;
use workpush::{config::AppConfig, db, web};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging first
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workpush=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Pick up a .env file if one exists
    dotenvy::dotenv().ok();

    info!("Starting Workpush v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::init()?;
    info!("Configuration loaded");

    // Refuse to start without a storage encryption key; everything written
    // under a wrong key is unreadable later.
    if config.security.encryption_key.is_empty() {
        error!("Storage encryption key not configured!");
        error!("Set security.encryption_key in config/local.toml or the WORKPUSH_SECURITY__ENCRYPTION_KEY env var");
        return Err(anyhow::anyhow!("Storage encryption key not configured"));
    }
    let cipher = SecretCipher::new(&config.security.encryption_key)?;

    // Initialize database
    let pool = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await?;
    info!("Database connected: {}", config.database.url);

    db::init_db(&pool).await?;

    let platform = Arc::new(WecomClient::new(config));
    let service = Arc::new(NotifyService::new(pool, cipher, platform));

    let app = web::create_router(web::AppState { service });

    let addr = format!("{}:{}", config.web.host, config.web.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Web server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
