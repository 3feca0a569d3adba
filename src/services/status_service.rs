//! Сборщик статуса кластера через kubectl.
//!
//! Используется UI и preflight-проверками; путь корректности оркестратора
//! от него не зависит. Результат кэшируется в сторе с TTL.

use std::io::Write;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::Config;
use crate::models::{Cluster, NodeStatus};
use crate::services::store::Store;

async fn run_kubectl(config: &Config, kubeconfig_path: &std::path::Path, args: &[&str]) -> Result<String> {
    let mut command = Command::new(&config.kubectl_bin);
    command
        .arg("--kubeconfig")
        .arg(kubeconfig_path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(Duration::from_secs(30), command.output())
        .await
        .map_err(|_| anyhow!("kubectl timed out"))?
        .context("failed to run kubectl")?;

    if !output.status.success() {
        return Err(anyhow!(
            "kubectl {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Собирает агрегированный статус кластера. Детерминированная структура,
/// пригодная и для UI, и как вход анализатора.
pub async fn collect_status(config: &Config, cluster: &Cluster) -> Result<Value> {
    let kubeconfig = cluster
        .kubeconfig
        .as_ref()
        .ok_or_else(|| anyhow!("cluster not yet installed or kubeconfig not available"))?;

    let started = Instant::now();
    let mut kubeconfig_file = tempfile::NamedTempFile::new()?;
    kubeconfig_file.write_all(kubeconfig.as_bytes())?;

    let nodes_raw = run_kubectl(
        config,
        kubeconfig_file.path(),
        &["get", "nodes", "-o", "json"],
    )
    .await?;
    let nodes_doc: Value = serde_json::from_str(&nodes_raw).context("malformed kubectl output")?;

    let mut details = Vec::new();
    let mut ready = 0usize;
    let mut not_ready = 0usize;
    let mut control_plane = 0usize;
    let mut workers = 0usize;
    let mut kubernetes_version = "unknown".to_string();

    for item in nodes_doc["items"].as_array().unwrap_or(&Vec::new()) {
        let name = item["metadata"]["name"].as_str().unwrap_or("unknown");
        let labels = &item["metadata"]["labels"];
        let is_control_plane = labels["node-role.kubernetes.io/control-plane"].is_string()
            || labels["node-role.kubernetes.io/master"].is_string();
        if is_control_plane {
            control_plane += 1;
        } else {
            workers += 1;
        }

        let node_ready = item["status"]["conditions"]
            .as_array()
            .map(|conditions| {
                conditions.iter().any(|c| {
                    c["type"].as_str() == Some("Ready") && c["status"].as_str() == Some("True")
                })
            })
            .unwrap_or(false);
        if node_ready {
            ready += 1;
        } else {
            not_ready += 1;
        }

        let internal_ip = item["status"]["addresses"]
            .as_array()
            .and_then(|addresses| {
                addresses
                    .iter()
                    .find(|a| a["type"].as_str() == Some("InternalIP"))
            })
            .and_then(|a| a["address"].as_str())
            .unwrap_or("");

        let version = item["status"]["nodeInfo"]["kubeletVersion"]
            .as_str()
            .unwrap_or("unknown");
        if kubernetes_version == "unknown" {
            kubernetes_version = version.to_string();
        }

        details.push(json!({
            "name": name,
            "status": if node_ready { "Ready" } else { "NotReady" },
            "roles": if is_control_plane { "control-plane" } else { "worker" },
            "internal_ip": internal_ip,
            "version": version,
            "os_image": item["status"]["nodeInfo"]["osImage"].as_str().unwrap_or("unknown"),
        }));
    }

    let total = ready + not_ready;
    Ok(json!({
        "cluster_metadata": {
            "cluster_id": cluster.id,
            "name": cluster.name,
            "kubernetes_version": kubernetes_version,
            "rke2_version": cluster.version,
            "collected_at": Utc::now().to_rfc3339(),
        },
        "nodes": {
            "total": total,
            "ready": ready,
            "not_ready": not_ready,
            "details": details,
        },
        "roles": {
            "control_plane": control_plane,
            "worker": workers,
        },
        "_collection_duration_secs": started.elapsed().as_secs(),
    }))
}

/// Статус с кэшом: валидный кэш отдаётся как есть, иначе свежая сборка
/// с сохранением и синхронизацией статусов узлов.
pub async fn get_status_cached(
    config: &Config,
    store: &Store,
    cluster: &Cluster,
    force_refresh: bool,
) -> Result<Value> {
    if !force_refresh {
        if let Some(cache) = store.get_status_cache(cluster.id).await? {
            if cache.expires_at > Utc::now() {
                let mut data = cache.data;
                if let Some(map) = data.as_object_mut() {
                    map.insert(
                        "_cache_metadata".to_string(),
                        json!({
                            "collected_at": cache.collected_at.to_rfc3339(),
                            "expires_at": cache.expires_at.to_rfc3339(),
                            "collection_duration_secs": cache.collection_duration_secs,
                            "is_cached": true,
                        }),
                    );
                }
                return Ok(data);
            }
        }
    }

    let mut status = collect_status(config, cluster).await?;
    let duration = status
        .as_object_mut()
        .and_then(|map| map.remove("_collection_duration_secs"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    store
        .save_status_cache(cluster.id, &status, duration, config.status_cache_ttl_secs)
        .await?;

    if let Err(err) = sync_node_statuses(store, cluster, &status).await {
        warn!("Node status sync for cluster {} failed: {:#}", cluster.id, err);
    }

    Ok(status)
}

#[derive(Debug, serde::Serialize)]
pub struct SyncReport {
    pub synced: usize,
    pub errors: Vec<String>,
}

/// Подтягивает статусы узлов в БД к фактическому состоянию кластера:
/// pending-узел, чей хост отчитался Ready, становится active. Переходные
/// статусы (installing/draining) не трогаются — ими владеет оркестратор.
pub async fn sync_node_statuses(
    store: &Store,
    cluster: &Cluster,
    status: &Value,
) -> Result<SyncReport> {
    let mut report = SyncReport {
        synced: 0,
        errors: Vec::new(),
    };

    let empty = Vec::new();
    let details = status["nodes"]["details"].as_array().unwrap_or(&empty);
    let db_nodes = store.nodes_for_cluster(cluster.id).await?;

    for node in &db_nodes {
        if node.status != NodeStatus::Pending {
            continue;
        }
        let observed_ready = details.iter().any(|d| {
            d["internal_ip"].as_str() == Some(node.internal_ip.as_str())
                && d["status"].as_str() == Some("Ready")
        });
        if observed_ready {
            store.set_node_status(node.id, NodeStatus::Active).await?;
            info!(
                "Synced node '{}' of cluster {} to active",
                node.hostname, cluster.id
            );
            report.synced += 1;
        }
    }

    Ok(report)
}
