use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Открывает пул SQLite. Файл базы создаётся при первом запуске.
///
/// Единственное соединение в пуле: несколько sqlite-соединений к одному
/// файлу без общего кэша страниц дают гонки видимости между ними
/// (commit на одном соединении не сразу виден на другом), поэтому пул
/// сериализует доступ через одно соединение.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .context("invalid DATABASE_URL")?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("failed to open database")?;

    Ok(pool)
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS credentials (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        username TEXT NOT NULL,
        kind TEXT NOT NULL,
        encrypted_secret TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS clusters (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        kind TEXT NOT NULL,
        version TEXT NOT NULL,
        credential_id INTEGER REFERENCES credentials(id),
        data_dir TEXT NOT NULL DEFAULT '/var/lib/rancher/rke2',
        api_ip TEXT,
        token TEXT,
        additional_sans TEXT,
        cni TEXT NOT NULL DEFAULT 'canal',
        custom_registry TEXT NOT NULL DEFAULT 'deactive',
        custom_mirror TEXT NOT NULL DEFAULT 'deactive',
        registry_address TEXT,
        registry_user TEXT,
        registry_password TEXT,
        image_overrides TEXT,
        custom_config TEXT,
        kubeconfig TEXT,
        cluster_vars TEXT,
        installation_stage TEXT,
        operation_status TEXT NOT NULL DEFAULT 'idle',
        current_job_id INTEGER,
        operation_locked_by TEXT,
        operation_started_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cluster_id INTEGER NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
        hostname TEXT NOT NULL,
        internal_ip TEXT NOT NULL,
        external_ip TEXT,
        use_external_ip INTEGER NOT NULL DEFAULT 0,
        role TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        node_vars TEXT,
        installation_started_at TEXT,
        installation_completed_at TEXT,
        installation_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (cluster_id, hostname)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cluster_id INTEGER NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        output TEXT,
        readiness_json TEXT,
        analysis_summary TEXT,
        analysis_model TEXT,
        analysis_token_count INTEGER,
        target_version TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS cluster_status_cache (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cluster_id INTEGER NOT NULL UNIQUE REFERENCES clusters(id) ON DELETE CASCADE,
        cached_data TEXT NOT NULL,
        collected_at TEXT NOT NULL,
        expires_at TEXT NOT NULL,
        collection_duration_secs INTEGER NOT NULL
    )
    "#,
];

/// Создаёт схему, если её ещё нет. Выполняется один раз на старте.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("failed to initialize schema")?;
    }
    Ok(())
}
