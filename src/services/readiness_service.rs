//! Preflight/upgrade-check: read-only джоба, не трогающая ни лок,
//! ни статусы узлов. Результат — структурированный readiness-документ
//! на джобе плюс опциональная сводка анализатора.

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::Config;
use crate::models::{Cluster, Job, JobStatus};
use crate::services::analyzer_service::{self, AnalyzerClient};
use crate::services::event_bus::JobEventBus;
use crate::services::status_service;
use crate::services::store::Store;

async fn emit(store: &Store, bus: &JobEventBus, job_id: i64, line: &str) -> Result<()> {
    bus.publish(line);
    let mut chunk = line.to_string();
    chunk.push('\n');
    store.append_job_output(job_id, &chunk).await
}

/// Одна проверка readiness-документа. Категории: os, rke2, kubernetes,
/// network, storage; severity: OK, WARN, CRITICAL.
fn check(
    check_id: &str,
    category: &str,
    severity: &str,
    message: String,
    node_name: Option<&str>,
) -> Value {
    json!({
        "check_id": check_id,
        "category": category,
        "severity": severity,
        "message": message,
        "node_name": node_name,
    })
}

/// Выполняет все проверки и собирает readiness-документ
async fn build_readiness(
    config: &Config,
    cluster: &Cluster,
    target_version: Option<&str>,
) -> Result<Value> {
    let status = status_service::collect_status(config, cluster).await?;

    let total = status["nodes"]["total"].as_u64().unwrap_or(0);
    let not_ready = status["nodes"]["not_ready"].as_u64().unwrap_or(0);
    let control_plane = status["roles"]["control_plane"].as_u64().unwrap_or(0);
    let current_version = status["cluster_metadata"]["kubernetes_version"]
        .as_str()
        .unwrap_or("unknown")
        .to_string();

    let mut checks = Vec::new();
    checks.push(check(
        "nodes_ready",
        "kubernetes",
        if not_ready == 0 { "OK" } else { "CRITICAL" },
        format!("{} nodes, {} not ready", total, not_ready),
        None,
    ));
    checks.push(check(
        "control_plane_present",
        "kubernetes",
        if control_plane >= 1 { "OK" } else { "CRITICAL" },
        format!("{} control-plane node(s) observed", control_plane),
        None,
    ));
    // Кворум консенсуса: чётное число серверов допустимо, но рискованно
    checks.push(check(
        "etcd_quorum",
        "rke2",
        if control_plane % 2 == 1 { "OK" } else { "WARN" },
        format!(
            "{} control-plane node(s); odd count recommended for consensus",
            control_plane
        ),
        None,
    ));
    checks.push(check(
        "cni_plugin",
        "network",
        "OK",
        format!("CNI plugin: {}", cluster.cni),
        None,
    ));
    checks.push(check(
        "disk_usage",
        "storage",
        "WARN",
        "Disk usage check placeholder - integrate with monitoring".to_string(),
        None,
    ));
    checks.push(check(
        "certificates",
        "rke2",
        "OK",
        "Certificate expiration check placeholder".to_string(),
        None,
    ));

    // Поузловые проверки
    let empty = Vec::new();
    for detail in status["nodes"]["details"].as_array().unwrap_or(&empty) {
        let name = detail["name"].as_str().unwrap_or("unknown");
        checks.push(check(
            "node_os_release",
            "os",
            "OK",
            format!("OS image: {}", detail["os_image"].as_str().unwrap_or("unknown")),
            Some(name),
        ));
        if detail["status"].as_str() == Some("NotReady") {
            checks.push(check(
                "node_not_ready",
                "kubernetes",
                "CRITICAL",
                "Node is not in Ready condition".to_string(),
                Some(name),
            ));
        }
    }

    let ready = checks.iter().all(|c| c["severity"] != "CRITICAL");

    Ok(json!({
        "cluster_name": cluster.name,
        "current_version": current_version,
        "target_version": target_version.unwrap_or(&cluster.version),
        "timestamp": Utc::now().to_rfc3339(),
        "checks": checks,
        "ready": ready,
    }))
}

/// Тело preflight-джобы; терминальный статус проставляет вызывающий
/// супервизор в оркестраторе
pub async fn run_preflight_job(
    config: &Config,
    store: &Store,
    bus: &JobEventBus,
    job: Job,
    cluster: Cluster,
    analyze: bool,
) -> Result<JobStatus> {
    store.mark_job_running(job.id).await?;
    emit(
        store,
        bus,
        job.id,
        &format!("Collecting readiness data for cluster '{}'", cluster.name),
    )
    .await?;

    let readiness = build_readiness(config, &cluster, job.target_version.as_deref()).await?;
    store.set_job_readiness(job.id, &readiness).await?;

    let ready = readiness["ready"].as_bool().unwrap_or(false);
    emit(
        store,
        bus,
        job.id,
        &format!("Readiness checks complete (ready: {})", ready),
    )
    .await?;

    if analyze {
        match AnalyzerClient::from_config(config) {
            Some(client) => match client.analyze(&readiness).await {
                Ok(report) => {
                    let summary = analyzer_service::render_summary(&report);
                    store
                        .set_job_analysis(
                            job.id,
                            &summary,
                            report.model_id.as_deref(),
                            report.token_count,
                        )
                        .await?;
                    emit(
                        store,
                        bus,
                        job.id,
                        &format!("Analyzer verdict: {}", report.verdict),
                    )
                    .await?;
                }
                // Ошибка анализатора — предупреждение, не провал джобы
                Err(err) => {
                    warn!("Analyzer failed for job {}: {:#}", job.id, err);
                    emit(
                        store,
                        bus,
                        job.id,
                        &format!("Warning: analyzer unavailable: {:#}", err),
                    )
                    .await?;
                }
            },
            None => {
                emit(
                    store,
                    bus,
                    job.id,
                    "Warning: analyzer requested but ANALYZER_ENDPOINT is not configured",
                )
                .await?;
            }
        }
    }

    Ok(JobStatus::Success)
}
