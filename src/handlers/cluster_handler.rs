use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use rand::{distributions::Alphanumeric, Rng};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::errors::AppError;
use crate::models::{
    Cluster, ClusterKind, ClusterResponse, CreateClusterRequest, JobKind, LockStatus, NodeInput,
    NodeRole, NodeStatus, PreflightQuery, RegisterClusterRequest, ScaleAddResponse,
    ScaleRemoveQuery, ScaleRemoveResponse, ScaleRequest, ScaleRole, UpdateClusterRequest,
    UploadKubeconfigRequest,
};
use crate::services::guardrails;
use crate::services::lock_service::{acquire_cluster_lock, release_cluster_lock, LockAcquire};
use crate::services::orchestrator::Operation;
use crate::services::runner_service::fetch_remote_file;
use crate::services::status_service;
use crate::AppState;

const KUBECONFIG_REMOTE_PATH: &str = "/etc/rancher/rke2/rke2.yaml";

fn generate_cluster_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(43)
        .map(char::from)
        .collect()
}

async fn load_cluster(state: &AppState, cluster_id: i64) -> Result<Cluster, AppError> {
    state
        .store
        .get_cluster(cluster_id)
        .await?
        .ok_or_else(|| AppError::not_found("Cluster"))
}

fn require_fresh(cluster: &Cluster, action: &str) -> Result<(), AppError> {
    if cluster.kind != ClusterKind::Fresh {
        return Err(AppError::Validation(format!(
            "Can only {} 'fresh' type clusters",
            action
        )));
    }
    Ok(())
}

pub async fn create_cluster(
    State(state): State<AppState>,
    Json(payload): Json<CreateClusterRequest>,
) -> Result<Json<ClusterResponse>, AppError> {
    info!("Create cluster '{}' ({} nodes)", payload.name, payload.nodes.len());

    if payload.nodes.is_empty() {
        return Err(AppError::Validation("No nodes provided".to_string()));
    }
    if state.store.cluster_name_exists(&payload.name).await? {
        return Err(AppError::Validation("Cluster name already exists".to_string()));
    }
    if let Some(credential_id) = payload.credential_id {
        if state.store.get_credential(credential_id).await?.is_none() {
            return Err(AppError::Validation(format!(
                "Credential {} does not exist",
                credential_id
            )));
        }
    }
    // Дубликаты hostname/IP внутри запроса
    guardrails::check_node_identity(&[], &payload.nodes)
        .map_err(|rejection| AppError::Validation(rejection.to_string()))?;

    // api_ip по умолчанию — адрес первого server-узла
    let first_server_ip = payload
        .nodes
        .iter()
        .find(|n| n.role == ScaleRole::Server)
        .map(|n| n.ip.clone());
    let api_ip = match payload.api_ip.clone().or(first_server_ip) {
        Some(ip) => ip,
        None => {
            return Err(AppError::Validation(
                "Cluster needs at least one server node or an explicit api_ip".to_string(),
            ))
        }
    };
    let token = payload.token.clone().unwrap_or_else(generate_cluster_token);

    let cluster = state.store.create_cluster(&payload, &api_ip, &token).await?;
    let nodes = state.store.nodes_for_cluster(cluster.id).await?;
    Ok(Json(ClusterResponse::from_parts(cluster, nodes)))
}

pub async fn register_cluster(
    State(state): State<AppState>,
    Json(payload): Json<RegisterClusterRequest>,
) -> Result<Json<ClusterResponse>, AppError> {
    info!("Register existing cluster '{}'", payload.name);

    if state.store.cluster_name_exists(&payload.name).await? {
        return Err(AppError::Validation("Cluster name already exists".to_string()));
    }
    let cluster = state
        .store
        .register_cluster(&payload.name, &payload.target_version, &payload.kubeconfig)
        .await?;
    Ok(Json(ClusterResponse::from_parts(cluster, Vec::new())))
}

pub async fn list_clusters(
    State(state): State<AppState>,
) -> Result<Json<Vec<ClusterResponse>>, AppError> {
    let clusters = state.store.list_clusters().await?;
    let mut responses = Vec::with_capacity(clusters.len());
    for cluster in clusters {
        let nodes = state.store.nodes_for_cluster(cluster.id).await?;
        responses.push(ClusterResponse::from_parts(cluster, nodes));
    }
    Ok(Json(responses))
}

pub async fn get_cluster(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
) -> Result<Json<ClusterResponse>, AppError> {
    let cluster = load_cluster(&state, cluster_id).await?;
    let nodes = state.store.nodes_for_cluster(cluster.id).await?;
    Ok(Json(ClusterResponse::from_parts(cluster, nodes)))
}

pub async fn update_cluster(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
    Json(payload): Json<UpdateClusterRequest>,
) -> Result<Json<ClusterResponse>, AppError> {
    let cluster = load_cluster(&state, cluster_id).await?;

    if let Some(new_name) = &payload.name {
        if new_name != &cluster.name && state.store.cluster_name_exists(new_name).await? {
            return Err(AppError::Validation("Cluster name already exists".to_string()));
        }
    }

    state.store.update_cluster(cluster_id, &payload).await?;
    let cluster = load_cluster(&state, cluster_id).await?;
    let nodes = state.store.nodes_for_cluster(cluster.id).await?;
    Ok(Json(ClusterResponse::from_parts(cluster, nodes)))
}

pub async fn delete_cluster(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let cluster = load_cluster(&state, cluster_id).await?;
    if cluster.operation_status == LockStatus::Running {
        return Err(AppError::Conflict(
            "Cannot delete a cluster while an operation is running".to_string(),
        ));
    }

    state.store.delete_cluster(cluster_id).await?;
    info!("Deleted cluster '{}'", cluster.name);
    Ok(Json(json!({ "message": "Cluster deleted" })))
}

// ==================== Scale ====================

fn validate_scale_nodes(nodes: &[NodeInput]) -> Result<(), AppError> {
    if nodes.is_empty() {
        return Err(AppError::Validation("No nodes provided".to_string()));
    }
    for node in nodes {
        if node.hostname.is_empty() || node.ip.is_empty() {
            return Err(AppError::Validation(
                "Each node must have hostname, ip, and role".to_string(),
            ));
        }
    }
    Ok(())
}

/// Добавление узлов. Порядок строгий: джоба → лок → guardrails → мутация.
/// Отказ guardrail возвращает лок в idle и удаляет несостоявшуюся джобу.
pub async fn add_nodes(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
    Json(payload): Json<ScaleRequest>,
) -> Result<Json<ScaleAddResponse>, AppError> {
    let cluster = load_cluster(&state, cluster_id).await?;
    require_fresh(&cluster, "scale")?;
    validate_scale_nodes(&payload.nodes)?;

    let (masters, workers) = guardrails::split_role_additions(&payload.nodes);
    let mixed = !masters.is_empty() && !workers.is_empty();

    // G3: при смешанном запросе сначала только мастера
    let (batch, kind) = if mixed || !masters.is_empty() {
        (masters.clone(), JobKind::ScaleAddMasters)
    } else {
        (workers.clone(), JobKind::ScaleAddWorkers)
    };

    let job = state.store.create_job(cluster_id, kind, None).await?;

    match acquire_cluster_lock(&state.store, cluster_id, job.id, kind.as_str()).await? {
        LockAcquire::Acquired => {}
        LockAcquire::Busy { operation, job_id } => {
            state.store.delete_job(job.id).await?;
            return Err(AppError::Conflict(LockAcquire::conflict_detail(
                &operation, job_id,
            )));
        }
        LockAcquire::NotFound => {
            state.store.delete_job(job.id).await?;
            return Err(AppError::not_found("Cluster"));
        }
    }

    // Guardrails после лока, до любой мутации
    let guard_result = async {
        let existing = state.store.nodes_for_cluster(cluster_id).await?;

        guardrails::check_node_identity(&existing, &payload.nodes)
            .map_err(|rejection| AppError::Guardrail(rejection.to_string()))?;

        let has_initial_master = existing
            .iter()
            .any(|n| n.role == NodeRole::InitialMaster && n.status != NodeStatus::Removed);
        let adding_workers = kind == JobKind::ScaleAddWorkers;
        let adding_joining_masters = kind == JobKind::ScaleAddMasters && has_initial_master;

        if adding_workers || adding_joining_masters {
            let probe = match &cluster.api_ip {
                Some(api_ip) => {
                    Some(guardrails::probe_join_port(api_ip, state.config.join_port).await)
                }
                None => None,
            };
            guardrails::check_bootstrap_prerequisite(&existing, probe)
                .map_err(|rejection| AppError::Guardrail(rejection.to_string()))?;
        }

        Ok::<bool, AppError>(has_initial_master)
    }
    .await;

    let has_initial_master = match guard_result {
        Ok(has_initial_master) => has_initial_master,
        Err(err) => {
            release_cluster_lock(&state.store, cluster_id).await?;
            state.store.delete_job(job.id).await?;
            return Err(err);
        }
    };

    // Мутация: заводим строки узлов под взятым локом
    let mut node_ids = Vec::with_capacity(batch.len());
    let mut first_server = !has_initial_master;
    for input in &batch {
        let role = match input.role {
            ScaleRole::Server if first_server => {
                first_server = false;
                NodeRole::InitialMaster
            }
            ScaleRole::Server => NodeRole::Master,
            ScaleRole::Agent => NodeRole::Worker,
        };
        let node = state.store.insert_node(cluster_id, input, role).await?;
        node_ids.push(node.id);
    }

    state.store.invalidate_status_cache(cluster_id).await?;
    state
        .jobs
        .launch(job.clone(), cluster, Operation::ScaleAdd { node_ids });

    let message = if mixed {
        format!(
            "Adding {} master(s) first; {} worker(s) pending a follow-up request",
            batch.len(),
            workers.len()
        )
    } else {
        format!("Adding {} node(s)", batch.len())
    };

    Ok(Json(ScaleAddResponse {
        job_id: job.id,
        message,
        status: job.status,
        warning: None,
        sequenced: mixed,
        workers_pending: if mixed { Some(workers.len()) } else { None },
    }))
}

/// Удаление узлов с проверкой безопасности кворума (G2)
pub async fn remove_nodes(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
    Query(query): Query<ScaleRemoveQuery>,
    Json(payload): Json<ScaleRequest>,
) -> Result<Json<ScaleRemoveResponse>, AppError> {
    let cluster = load_cluster(&state, cluster_id).await?;
    require_fresh(&cluster, "scale")?;
    validate_scale_nodes(&payload.nodes)?;

    let job = state
        .store
        .create_job(cluster_id, JobKind::ScaleRemove, None)
        .await?;

    match acquire_cluster_lock(&state.store, cluster_id, job.id, JobKind::ScaleRemove.as_str())
        .await?
    {
        LockAcquire::Acquired => {}
        LockAcquire::Busy { operation, job_id } => {
            state.store.delete_job(job.id).await?;
            return Err(AppError::Conflict(LockAcquire::conflict_detail(
                &operation, job_id,
            )));
        }
        LockAcquire::NotFound => {
            state.store.delete_job(job.id).await?;
            return Err(AppError::not_found("Cluster"));
        }
    }

    let guard_result = async {
        let existing = state.store.nodes_for_cluster(cluster_id).await?;

        // Ссылки должны указывать на живые узлы кластера
        let mut node_ids = Vec::with_capacity(payload.nodes.len());
        for target in &payload.nodes {
            let node = existing
                .iter()
                .find(|n| n.hostname == target.hostname && n.status != NodeStatus::Removed)
                .ok_or_else(|| {
                    AppError::Validation(format!(
                        "Node '{}' does not exist in cluster",
                        target.hostname
                    ))
                })?;
            node_ids.push(node.id);
        }

        let outcome =
            guardrails::check_safe_removal(&existing, &payload.nodes, query.confirm_master_removal)
                .map_err(|rejection| AppError::Guardrail(rejection.to_string()))?;

        Ok::<(Vec<i64>, Option<String>), AppError>((node_ids, outcome.warning))
    }
    .await;

    let (node_ids, warning) = match guard_result {
        Ok(result) => result,
        Err(err) => {
            release_cluster_lock(&state.store, cluster_id).await?;
            state.store.delete_job(job.id).await?;
            return Err(err);
        }
    };

    if let Some(warning) = &warning {
        warn!("Scale-remove on cluster {}: {}", cluster_id, warning);
    }

    let removed_count = node_ids.len();
    state.store.invalidate_status_cache(cluster_id).await?;
    state
        .jobs
        .launch(job.clone(), cluster, Operation::ScaleRemove { node_ids });

    Ok(Json(ScaleRemoveResponse {
        job_id: job.id,
        message: format!("Removing {} node(s)", removed_count),
        status: job.status,
        warning,
    }))
}

// ==================== Preflight ====================

pub async fn preflight_check(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
    Query(query): Query<PreflightQuery>,
) -> Result<Json<crate::models::JobResponse>, AppError> {
    let cluster = load_cluster(&state, cluster_id).await?;

    let kind = match cluster.kind {
        ClusterKind::Fresh => JobKind::PreflightCheck,
        ClusterKind::Registered => JobKind::UpgradeCheck,
    };
    let job = state
        .store
        .create_job(cluster_id, kind, query.target_version.as_deref())
        .await?;

    info!(
        "Starting {} job {} for cluster '{}'",
        kind.as_str(),
        job.id,
        cluster.name
    );
    state
        .jobs
        .launch_preflight(job.clone(), cluster, query.analyze);

    Ok(Json(job.into()))
}

// ==================== Status ====================

#[derive(Debug, Default, serde::Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub force_refresh: bool,
}

pub async fn get_cluster_status(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Value>, AppError> {
    let cluster = load_cluster(&state, cluster_id).await?;
    let status =
        status_service::get_status_cached(&state.config, &state.store, &cluster, query.force_refresh)
            .await
            .map_err(|err| AppError::Validation(format!("{:#}", err)))?;
    Ok(Json(status))
}

pub async fn refresh_cluster_status(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let cluster = load_cluster(&state, cluster_id).await?;
    let status = status_service::get_status_cached(&state.config, &state.store, &cluster, true)
        .await
        .map_err(|err| AppError::Validation(format!("{:#}", err)))?;
    Ok(Json(status))
}

pub async fn sync_nodes(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let cluster = load_cluster(&state, cluster_id).await?;
    require_fresh(&cluster, "sync")?;

    let status = status_service::collect_status(&state.config, &cluster)
        .await
        .map_err(|err| AppError::Validation(format!("{:#}", err)))?;
    let report = status_service::sync_node_statuses(&state.store, &cluster, &status).await?;
    state.store.invalidate_status_cache(cluster_id).await?;

    Ok(Json(serde_json::to_value(report).map_err(anyhow::Error::from)?))
}

// ==================== Kubeconfig ====================

pub async fn fetch_kubeconfig(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let cluster = load_cluster(&state, cluster_id).await?;
    require_fresh(&cluster, "fetch kubeconfig for")?;

    let nodes = state.store.nodes_for_cluster(cluster_id).await?;
    let master = nodes
        .iter()
        .find(|n| n.role == NodeRole::InitialMaster && n.status == NodeStatus::Active)
        .ok_or_else(|| {
            AppError::Validation("Cluster has no active initial master".to_string())
        })?;

    let credential_id = cluster
        .credential_id
        .ok_or_else(|| AppError::Validation("Cluster has no credential".to_string()))?;
    let credential = state
        .store
        .get_credential(credential_id)
        .await?
        .ok_or_else(|| AppError::not_found("Credential"))?;
    let encryption = state
        .encryption
        .as_ref()
        .ok_or_else(|| AppError::Validation("ENCRYPTION_KEY is not configured".to_string()))?;

    let raw = fetch_remote_file(
        &state.config,
        encryption,
        &credential,
        master.connect_ip(),
        KUBECONFIG_REMOTE_PATH,
    )
    .await
    .map_err(|err| AppError::Validation(format!("Failed to fetch kubeconfig: {:#}", err)))?;

    // kubeconfig с узла указывает на loopback; подставляем адрес API
    let kubeconfig = match &cluster.api_ip {
        Some(api_ip) => raw.replace("127.0.0.1", api_ip),
        None => raw,
    };

    state.store.set_kubeconfig(cluster_id, &kubeconfig).await?;
    Ok(Json(json!({
        "message": "Kubeconfig fetched successfully",
        "kubeconfig": kubeconfig,
    })))
}

pub async fn upload_kubeconfig(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
    Json(payload): Json<UploadKubeconfigRequest>,
) -> Result<Json<Value>, AppError> {
    load_cluster(&state, cluster_id).await?;
    if payload.content.is_empty() {
        return Err(AppError::Validation("Kubeconfig content is required".to_string()));
    }

    state.store.set_kubeconfig(cluster_id, &payload.content).await?;
    Ok(Json(json!({ "message": "Kubeconfig uploaded successfully" })))
}
