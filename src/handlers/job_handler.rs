use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
};
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::errors::AppError;
use crate::models::{
    ClusterKind, JobDetailResponse, JobKind, JobResponse, JobStatus, ListJobsQuery, UninstallQuery,
};
use crate::services::event_bus::BusEvent;
use crate::services::lock_service::{acquire_cluster_lock, LockAcquire};
use crate::services::orchestrator::Operation;
use crate::AppState;

/// Запуск установки кластера: джоба → лок → оркестратор
pub async fn install_cluster(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
) -> Result<Json<JobResponse>, AppError> {
    let cluster = state
        .store
        .get_cluster(cluster_id)
        .await?
        .ok_or_else(|| AppError::not_found("Cluster"))?;

    if cluster.kind != ClusterKind::Fresh {
        return Err(AppError::Validation(
            "Can only install fresh clusters".to_string(),
        ));
    }

    let job = state
        .store
        .create_job(cluster_id, JobKind::Install, None)
        .await?;

    match acquire_cluster_lock(&state.store, cluster_id, job.id, JobKind::Install.as_str()).await? {
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

    info!("Starting install job {} for cluster '{}'", job.id, cluster.name);
    state.jobs.launch(job.clone(), cluster, Operation::Install);

    Ok(Json(job.into()))
}

/// Снос кластера. Требует подтверждения точным именем кластера.
pub async fn uninstall_cluster(
    State(state): State<AppState>,
    Path(cluster_id): Path<i64>,
    Query(query): Query<UninstallQuery>,
) -> Result<Json<JobResponse>, AppError> {
    let cluster = state
        .store
        .get_cluster(cluster_id)
        .await?
        .ok_or_else(|| AppError::not_found("Cluster"))?;

    if cluster.kind != ClusterKind::Fresh {
        return Err(AppError::Validation(
            "Can only uninstall fresh clusters".to_string(),
        ));
    }
    if query.confirmation != cluster.name {
        return Err(AppError::Validation(format!(
            "Confirmation failed. Please type the exact cluster name: {}",
            cluster.name
        )));
    }

    let job = state
        .store
        .create_job(cluster_id, JobKind::Uninstall, None)
        .await?;

    match acquire_cluster_lock(&state.store, cluster_id, job.id, JobKind::Uninstall.as_str())
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

    info!("Starting uninstall job {} for cluster '{}'", job.id, cluster.name);
    state.jobs.launch(job.clone(), cluster, Operation::Uninstall);

    Ok(Json(job.into()))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobResponse>>, AppError> {
    let jobs = state.store.list_jobs(query.cluster_id).await?;
    Ok(Json(jobs.into_iter().map(JobResponse::from).collect()))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> Result<Json<JobDetailResponse>, AppError> {
    let job = state
        .store
        .get_job(job_id)
        .await?
        .ok_or_else(|| AppError::not_found("Job"))?;
    Ok(Json(job.into()))
}

/// Кооперативная отмена работающей джобы
pub async fn terminate_job(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let job = state
        .store
        .get_job(job_id)
        .await?
        .ok_or_else(|| AppError::not_found("Job"))?;

    if job.status != JobStatus::Running {
        return Err(AppError::Validation("Job is not running".to_string()));
    }
    if !state.jobs.cancel(job_id) {
        return Err(AppError::Validation(
            "Job is not running in this process".to_string(),
        ));
    }

    info!("Termination requested for job {}", job_id);
    Ok(Json(json!({
        "message": format!("Job {} termination requested", job_id)
    })))
}

fn bus_event_to_sse(event: BusEvent) -> Result<Event, Infallible> {
    Ok(match event {
        BusEvent::Chunk { index, line } => Event::default().id(index.to_string()).data(line),
        BusEvent::Closed { status } => Event::default()
            .event("terminal")
            .data(format!("[Job {}]", status.as_str())),
    })
}

/// SSE-стрим вывода джобы: сначала снапшот накопленного буфера, затем
/// живые чанки до терминального события. Для завершённых джоб отдаётся
/// персистентный буфер целиком.
pub async fn stream_job_output(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let job = state
        .store
        .get_job(job_id)
        .await?
        .ok_or_else(|| AppError::not_found("Job"))?;

    let stream: futures::stream::BoxStream<'static, Result<Event, Infallible>> =
        match state.jobs.buses().get(job_id) {
            Some(bus) => {
                let rx = bus.subscribe();
                ReceiverStream::new(rx).map(bus_event_to_sse).boxed()
            }
            None => {
                // Джоба уже не живёт в этом процессе: реплей из стора
                let mut events: Vec<Result<Event, Infallible>> = job
                    .output
                    .as_deref()
                    .unwrap_or("")
                    .lines()
                    .enumerate()
                    .map(|(index, line)| {
                        Ok(Event::default().id(index.to_string()).data(line.to_string()))
                    })
                    .collect();
                events.push(Ok(Event::default()
                    .event("terminal")
                    .data(format!("[Job {}]", job.status.as_str()))));
                stream::iter(events).boxed()
            }
        };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
