// Integration tests for the RKE2 automation backend
//
// Этот файл содержит интеграционные тесты, которые проверяют
// взаимодействие между компонентами системы

mod test_config;
mod test_inventory;
mod test_models;
mod test_orchestrator;

use std::sync::Once;

use rkeatlas_backend::{AppState, Config, EncryptionService, JobManager, Store};

static INIT: Once = Once::new();

/// Инициализация логгирования для тестов (вызывается один раз)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .init();
    });
}

/// Создает тестовую конфигурацию для интеграционных тестов
pub fn create_integration_test_config(work_dir: &std::path::Path) -> Config {
    Config {
        server_address: "127.0.0.1:0".to_string(),
        database_url: "sqlite://data/test.db".to_string(),
        encryption_key: "integration-test-key".to_string(),
        log_level: "info".to_string(),
        playbook_dir: "/ansible/playbooks".to_string(),
        ansible_playbook_bin: "ansible-playbook".to_string(),
        kubectl_bin: "kubectl".to_string(),
        work_dir: work_dir.display().to_string(),
        join_port: 9345,
        cancel_grace_secs: 2,
        status_cache_ttl_secs: 300,
        analyzer_endpoint: None,
        analyzer_model: None,
    }
}

#[tokio::test]
async fn test_integration_basic_setup() {
    // Базовый интеграционный тест: все компоненты AppState собираются
    init_test_logging();

    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("test.db").display());
    let pool = rkeatlas_backend::db::init_pool(&url).await.unwrap();
    rkeatlas_backend::db::init_schema(&pool).await.unwrap();
    let store = Store::new(pool);

    let config = create_integration_test_config(dir.path());
    let encryption = EncryptionService::new(&config.encryption_key).unwrap();
    let jobs = JobManager::new(config.clone(), store.clone(), Some(encryption.clone()));

    let app_state = AppState {
        config,
        store,
        jobs,
        encryption: Some(encryption),
    };

    assert_eq!(app_state.config.join_port, 9345);
    assert!(app_state.encryption.is_some());
}

#[tokio::test]
async fn test_integration_schema_is_idempotent() {
    // Повторная инициализация схемы не должна падать
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("test.db").display());
    let pool = rkeatlas_backend::db::init_pool(&url).await.unwrap();
    rkeatlas_backend::db::init_schema(&pool).await.unwrap();
    rkeatlas_backend::db::init_schema(&pool).await.unwrap();
}

#[tokio::test]
async fn test_integration_startup_reconciliation_on_fresh_database() {
    // На чистой базе реконсиляция ничего не делает
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("test.db").display());
    let pool = rkeatlas_backend::db::init_pool(&url).await.unwrap();
    rkeatlas_backend::db::init_schema(&pool).await.unwrap();
    let store = Store::new(pool);

    assert_eq!(store.reconcile_orphaned_locks().await.unwrap(), 0);
}
