// RKE2 Automation Backend Library
// Экспортируем публичные модули для использования в тестах

use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod services;

// Экспортируем основные типы
pub use config::Config;
pub use errors::AppError;
pub use services::encryption_service::EncryptionService;
pub use services::orchestrator::JobManager;
pub use services::store::Store;

// Основная структура состояния приложения
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub jobs: Arc<JobManager>,
    pub encryption: Option<EncryptionService>,
}

/// Собирает маршруты API. Используется и сервером, и интеграционными тестами.
pub fn build_router(state: AppState) -> Router {
    use handlers::{cluster_handler, credential_handler, health_handler, job_handler};

    Router::new()
        .route("/health", get(health_handler::health_check))
        // Clusters
        .route("/api/clusters", get(cluster_handler::list_clusters))
        .route("/api/clusters/new", post(cluster_handler::create_cluster))
        .route("/api/clusters/register", post(cluster_handler::register_cluster))
        .route("/api/clusters/:id", get(cluster_handler::get_cluster))
        .route("/api/clusters/:id", put(cluster_handler::update_cluster))
        .route("/api/clusters/:id", delete(cluster_handler::delete_cluster))
        .route("/api/clusters/:id/scale/add", post(cluster_handler::add_nodes))
        .route("/api/clusters/:id/scale/remove", post(cluster_handler::remove_nodes))
        .route("/api/clusters/:id/preflight-check", post(cluster_handler::preflight_check))
        .route("/api/clusters/:id/status", get(cluster_handler::get_cluster_status))
        .route("/api/clusters/:id/refresh", post(cluster_handler::refresh_cluster_status))
        .route("/api/clusters/:id/sync-nodes", post(cluster_handler::sync_nodes))
        .route("/api/clusters/:id/fetch-kubeconfig", post(cluster_handler::fetch_kubeconfig))
        .route("/api/clusters/:id/upload-kubeconfig", post(cluster_handler::upload_kubeconfig))
        // Credentials
        .route("/api/credentials", post(credential_handler::create_credential))
        .route("/api/credentials", get(credential_handler::list_credentials))
        .route("/api/credentials/:id", get(credential_handler::get_credential))
        .route("/api/credentials/:id", delete(credential_handler::delete_credential))
        .route("/api/credentials/test-access", post(credential_handler::test_access))
        // Jobs
        .route("/api/jobs", get(job_handler::list_jobs))
        .route("/api/jobs/install/:cluster_id", post(job_handler::install_cluster))
        .route("/api/jobs/uninstall/:cluster_id", post(job_handler::uninstall_cluster))
        .route("/api/jobs/:id", get(job_handler::get_job))
        .route("/api/jobs/:id/terminate", post(job_handler::terminate_job))
        .route("/api/jobs/:id/stream", get(job_handler::stream_job_output))
        .with_state(state)
}
