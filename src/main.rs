use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rkeatlas_backend::{build_router, AppState, Config, EncryptionService, JobManager, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first: log level comes from it
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with_target(false)
        .init();

    info!("🚀 Starting RKE Atlas Backend...");
    info!("✅ Configuration loaded");

    // Database
    let pool = match rkeatlas_backend::db::init_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("❌ Failed to open database: {}", e);
            return Err(e.into());
        }
    };
    rkeatlas_backend::db::init_schema(&pool).await?;
    info!("✅ Database ready");

    let store = Store::new(pool);

    // Восстановление после рестарта: висящие локи и их джобы
    match store.reconcile_orphaned_locks().await {
        Ok(0) => {}
        Ok(count) => warn!("⚠️ Reconciled {} orphaned cluster lock(s)", count),
        Err(e) => {
            eprintln!("❌ Startup reconciliation failed: {}", e);
            return Err(e.into());
        }
    }

    // Шифрование секретов опционально, но без него недоступны учётки
    let encryption = match EncryptionService::new(&config.encryption_key) {
        Ok(encryption) => Some(encryption),
        Err(e) => {
            warn!("⚠️ Credential encryption disabled: {}", e);
            None
        }
    };

    if config.analyzer_enabled() {
        info!("✅ Analyzer endpoint configured");
    } else {
        info!("ℹ️ Analyzer endpoint not configured, preflight summaries disabled");
    }

    let jobs = JobManager::new(config.clone(), store.clone(), encryption.clone());

    let app_state = AppState {
        config: config.clone(),
        store,
        jobs,
        encryption,
    };

    // Build the application router
    let app = build_router(app_state).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
    );

    // Start the server
    let listener = match tokio::net::TcpListener::bind(&config.server_address).await {
        Ok(listener) => {
            info!("🌐 Server listening on {}", config.server_address);
            listener
        }
        Err(e) => {
            eprintln!("❌ Failed to bind to {}: {}", config.server_address, e);
            return Err(e.into());
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("❌ Server error: {}", e);
        return Err(e.into());
    }

    info!("✅ Server stopped gracefully");
    Ok(())
}
