use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::models::LockStatus;
use crate::services::store::Store;

/// Исход попытки захвата лока кластера
#[derive(Debug)]
pub enum LockAcquire {
    Acquired,
    /// Кластер занят другой операцией
    Busy {
        operation: String,
        job_id: Option<i64>,
    },
    NotFound,
}

impl LockAcquire {
    /// Текст 409-ответа, который видит клиент
    pub fn conflict_detail(operation: &str, job_id: Option<i64>) -> String {
        format!(
            "Cluster is busy with operation '{}' (job {}). Please wait for it to complete.",
            operation,
            job_id.map(|id| id.to_string()).unwrap_or_else(|| "?".to_string())
        )
    }
}

/// Захват эксклюзивного лока: единственный UPDATE с предикатом
/// `operation_status = 'idle'` — атомарный compare-and-swap, никакого
/// окна между чтением и записью. Не блокирует: занято — значит отказ.
pub async fn acquire_cluster_lock(
    store: &Store,
    cluster_id: i64,
    job_id: i64,
    operation: &str,
) -> Result<LockAcquire> {
    let result = sqlx::query(
        r#"
        UPDATE clusters SET
            operation_status = ?1,
            current_job_id = ?2,
            operation_locked_by = ?3,
            operation_started_at = ?4,
            updated_at = ?4
        WHERE id = ?5 AND operation_status = 'idle'
        "#,
    )
    .bind(LockStatus::Running)
    .bind(job_id)
    .bind(operation)
    .bind(Utc::now())
    .bind(cluster_id)
    .execute(store.pool())
    .await?;

    if result.rows_affected() > 0 {
        info!(
            "Acquired lock on cluster {} for operation '{}' (job {})",
            cluster_id, operation, job_id
        );
        return Ok(LockAcquire::Acquired);
    }

    // CAS не прошёл: либо кластера нет, либо лок занят
    let cluster = match store.get_cluster(cluster_id).await? {
        Some(cluster) => cluster,
        None => return Ok(LockAcquire::NotFound),
    };

    Ok(LockAcquire::Busy {
        operation: cluster
            .operation_locked_by
            .unwrap_or_else(|| "unknown".to_string()),
        job_id: cluster.current_job_id,
    })
}

/// Сброс лока. Идемпотентен: повторный вызов на idle-кластере безвреден.
/// Все четыре поля лока очищаются одним коммитом.
pub async fn release_cluster_lock(store: &Store, cluster_id: i64) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE clusters SET
            operation_status = 'idle',
            current_job_id = NULL,
            operation_locked_by = NULL,
            operation_started_at = NULL,
            updated_at = ?1
        WHERE id = ?2 AND operation_status = 'running'
        "#,
    )
    .bind(Utc::now())
    .bind(cluster_id)
    .execute(store.pool())
    .await?;

    if result.rows_affected() > 0 {
        info!("Released lock on cluster {}", cluster_id);
    } else {
        warn!(
            "Lock release on cluster {} was a no-op (already idle or cluster gone)",
            cluster_id
        );
    }
    Ok(())
}
