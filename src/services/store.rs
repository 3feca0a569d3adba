use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePool;
use tracing::info;

use crate::models::{
    Cluster, ClusterKind, CreateClusterRequest, Credential, CredentialKind, Job, JobKind,
    JobStatus, Node, NodeInput, NodeRole, NodeStatus, ScaleRole, UpdateClusterRequest,
};

/// Единственный источник правды о топологии: кластеры, узлы, учётки, джобы.
/// Все мутации идут через это хранилище; конкурентные читатели не ограничены.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ==================== Clusters ====================

    pub async fn cluster_name_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM clusters WHERE name = ?1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn create_cluster(
        &self,
        req: &CreateClusterRequest,
        api_ip: &str,
        token: &str,
    ) -> Result<Cluster> {
        let now = Utc::now();
        let additional_sans = req
            .additional_sans
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let registry_address = req
            .registry_address
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let image_overrides = req
            .image_overrides
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO clusters (
                name, kind, version, credential_id, data_dir, api_ip, token,
                additional_sans, cni, custom_registry, custom_mirror,
                registry_address, registry_user, registry_password,
                image_overrides, custom_config, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            RETURNING id
            "#,
        )
        .bind(&req.name)
        .bind(ClusterKind::Fresh)
        .bind(&req.version)
        .bind(req.credential_id)
        .bind(&req.data_dir)
        .bind(api_ip)
        .bind(token)
        .bind(additional_sans)
        .bind(&req.cni)
        .bind(&req.custom_registry)
        .bind(&req.custom_mirror)
        .bind(registry_address)
        .bind(&req.registry_user)
        .bind(&req.registry_password)
        .bind(image_overrides)
        .bind(&req.custom_config)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        // Первый server становится initial_master, остальные присоединяются
        let mut first_server = true;
        for node in &req.nodes {
            let role = match node.role {
                ScaleRole::Server if first_server => {
                    first_server = false;
                    NodeRole::InitialMaster
                }
                ScaleRole::Server => NodeRole::Master,
                ScaleRole::Agent => NodeRole::Worker,
            };
            self.insert_node(id, node, role).await?;
        }

        self.get_cluster(id)
            .await?
            .context("cluster vanished after insert")
    }

    pub async fn register_cluster(
        &self,
        name: &str,
        target_version: &str,
        kubeconfig: &str,
    ) -> Result<Cluster> {
        let now = Utc::now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO clusters (name, kind, version, kubeconfig, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(ClusterKind::Registered)
        .bind(target_version)
        .bind(kubeconfig)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        self.get_cluster(id)
            .await?
            .context("cluster vanished after insert")
    }

    pub async fn get_cluster(&self, id: i64) -> Result<Option<Cluster>> {
        let cluster = sqlx::query_as::<_, Cluster>("SELECT * FROM clusters WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(cluster)
    }

    pub async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let clusters = sqlx::query_as::<_, Cluster>("SELECT * FROM clusters ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(clusters)
    }

    pub async fn update_cluster(&self, id: i64, update: &UpdateClusterRequest) -> Result<()> {
        let additional_sans = update
            .additional_sans
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            UPDATE clusters SET
                name = COALESCE(?1, name),
                version = COALESCE(?2, version),
                cni = COALESCE(?3, cni),
                data_dir = COALESCE(?4, data_dir),
                api_ip = COALESCE(?5, api_ip),
                token = COALESCE(?6, token),
                additional_sans = COALESCE(?7, additional_sans),
                updated_at = ?8
            WHERE id = ?9
            "#,
        )
        .bind(&update.name)
        .bind(&update.version)
        .bind(&update.cni)
        .bind(&update.data_dir)
        .bind(&update.api_ip)
        .bind(&update.token)
        .bind(additional_sans)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_kubeconfig(&self, id: i64, kubeconfig: &str) -> Result<()> {
        sqlx::query("UPDATE clusters SET kubeconfig = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(kubeconfig)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_installation_stage(&self, id: i64, stage: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE clusters SET installation_stage = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(stage)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Удаление кластера каскадно уносит узлы, джобы и кэш статуса
    pub async fn delete_cluster(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM clusters WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ==================== Nodes ====================

    pub async fn insert_node(
        &self,
        cluster_id: i64,
        input: &NodeInput,
        role: NodeRole,
    ) -> Result<Node> {
        let now = Utc::now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO nodes (
                cluster_id, hostname, internal_ip, external_ip, use_external_ip,
                role, status, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            RETURNING id
            "#,
        )
        .bind(cluster_id)
        .bind(&input.hostname)
        .bind(&input.ip)
        .bind(&input.external_ip)
        .bind(input.use_external_ip)
        .bind(role)
        .bind(NodeStatus::Pending)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let node = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = ?1")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(node)
    }

    pub async fn nodes_for_cluster(&self, cluster_id: i64) -> Result<Vec<Node>> {
        let nodes =
            sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE cluster_id = ?1 ORDER BY id")
                .bind(cluster_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(nodes)
    }

    /// Переводит набор узлов в новый статус, проставляя таймстемпы установки.
    /// Вызывается только задачей, владеющей локом кластера.
    pub async fn transition_nodes(
        &self,
        node_ids: &[i64],
        status: NodeStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        for id in node_ids {
            match status {
                NodeStatus::Installing | NodeStatus::Draining => {
                    sqlx::query(
                        r#"
                        UPDATE nodes SET status = ?1, installation_started_at = ?2,
                            installation_error = NULL, updated_at = ?2
                        WHERE id = ?3
                        "#,
                    )
                    .bind(status)
                    .bind(now)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                }
                NodeStatus::Active | NodeStatus::Removed => {
                    sqlx::query(
                        r#"
                        UPDATE nodes SET status = ?1, installation_completed_at = ?2,
                            installation_error = NULL, updated_at = ?2
                        WHERE id = ?3
                        "#,
                    )
                    .bind(status)
                    .bind(now)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                }
                NodeStatus::Failed => {
                    sqlx::query(
                        r#"
                        UPDATE nodes SET status = ?1, installation_completed_at = ?2,
                            installation_error = ?3, updated_at = ?2
                        WHERE id = ?4
                        "#,
                    )
                    .bind(status)
                    .bind(now)
                    .bind(error)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                }
                NodeStatus::Pending => {
                    sqlx::query("UPDATE nodes SET status = ?1, updated_at = ?2 WHERE id = ?3")
                        .bind(status)
                        .bind(now)
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Все узлы кластера, застрявшие в переходных статусах, помечаются
    /// failed. Вызывается терминальным путём операции.
    pub async fn fail_transitioning_nodes(&self, cluster_id: i64, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE nodes SET status = ?1, installation_error = ?2,
                installation_completed_at = ?3, updated_at = ?3
            WHERE cluster_id = ?4 AND status IN ('installing', 'draining')
            "#,
        )
        .bind(NodeStatus::Failed)
        .bind(reason)
        .bind(Utc::now())
        .bind(cluster_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_node_status(&self, node_id: i64, status: NodeStatus) -> Result<()> {
        sqlx::query("UPDATE nodes SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status)
            .bind(Utc::now())
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Jobs ====================

    pub async fn create_job(
        &self,
        cluster_id: i64,
        kind: JobKind,
        target_version: Option<&str>,
    ) -> Result<Job> {
        let now = Utc::now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (cluster_id, kind, status, target_version, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING id
            "#,
        )
        .bind(cluster_id)
        .bind(kind)
        .bind(JobStatus::Pending)
        .bind(target_version)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        self.get_job(id).await?.context("job vanished after insert")
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn list_jobs(&self, cluster_id: Option<i64>) -> Result<Vec<Job>> {
        let jobs = match cluster_id {
            Some(cluster_id) => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM jobs WHERE cluster_id = ?1 ORDER BY created_at DESC, id DESC",
                )
                .bind(cluster_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY created_at DESC, id DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(jobs)
    }

    /// Убирает джобу, которая так и не стартовала (лок не взялся)
    pub async fn delete_job(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_job_running(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = ?1, started_at = ?2 WHERE id = ?3")
            .bind(JobStatus::Running)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_job_terminal(&self, id: i64, status: JobStatus) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = ?1, completed_at = ?2 WHERE id = ?3")
            .bind(status)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn append_job_output(&self, id: i64, chunk: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET output = COALESCE(output, '') || ?1 WHERE id = ?2")
            .bind(chunk)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_job_readiness(&self, id: i64, readiness: &serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE jobs SET readiness_json = ?1 WHERE id = ?2")
            .bind(serde_json::to_string(readiness)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_job_analysis(
        &self,
        id: i64,
        summary: &str,
        model: Option<&str>,
        token_count: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET analysis_summary = ?1, analysis_model = ?2,
                analysis_token_count = ?3
            WHERE id = ?4
            "#,
        )
        .bind(summary)
        .bind(model)
        .bind(token_count)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Credentials ====================

    pub async fn credential_name_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM credentials WHERE name = ?1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn create_credential(
        &self,
        name: &str,
        username: &str,
        kind: CredentialKind,
        encrypted_secret: &str,
    ) -> Result<Credential> {
        let now = Utc::now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO credentials (name, username, kind, encrypted_secret, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(username)
        .bind(kind)
        .bind(encrypted_secret)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        self.get_credential(id)
            .await?
            .context("credential vanished after insert")
    }

    pub async fn get_credential(&self, id: i64) -> Result<Option<Credential>> {
        let credential =
            sqlx::query_as::<_, Credential>("SELECT * FROM credentials WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(credential)
    }

    pub async fn list_credentials(&self) -> Result<Vec<Credential>> {
        let credentials =
            sqlx::query_as::<_, Credential>("SELECT * FROM credentials ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(credentials)
    }

    pub async fn clusters_using_credential(&self, credential_id: i64) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM clusters WHERE credential_id = ?1")
                .bind(credential_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn delete_credential(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM credentials WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ==================== Status cache ====================

    pub async fn get_status_cache(&self, cluster_id: i64) -> Result<Option<CachedStatus>> {
        let row = sqlx::query_as::<_, CachedStatusRow>(
            "SELECT cached_data, collected_at, expires_at, collection_duration_secs
             FROM cluster_status_cache WHERE cluster_id = ?1",
        )
        .bind(cluster_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(CachedStatus {
                data: serde_json::from_str(&row.cached_data)?,
                collected_at: row.collected_at,
                expires_at: row.expires_at,
                collection_duration_secs: row.collection_duration_secs,
            })),
            None => Ok(None),
        }
    }

    pub async fn save_status_cache(
        &self,
        cluster_id: i64,
        data: &serde_json::Value,
        collection_duration_secs: i64,
        ttl_secs: i64,
    ) -> Result<()> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(ttl_secs);
        sqlx::query(
            r#"
            INSERT INTO cluster_status_cache
                (cluster_id, cached_data, collected_at, expires_at, collection_duration_secs)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (cluster_id) DO UPDATE SET
                cached_data = excluded.cached_data,
                collected_at = excluded.collected_at,
                expires_at = excluded.expires_at,
                collection_duration_secs = excluded.collection_duration_secs
            "#,
        )
        .bind(cluster_id)
        .bind(serde_json::to_string(data)?)
        .bind(now)
        .bind(expires_at)
        .bind(collection_duration_secs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn invalidate_status_cache(&self, cluster_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM cluster_status_cache WHERE cluster_id = ?1")
            .bind(cluster_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Startup reconciliation ====================

    /// Восстановление после рестарта: кластер с висящим локом, чья джоба
    /// на самом деле не выполняется, возвращается в idle, джоба помечается
    /// проваленной. Выполняется один раз на старте процесса.
    pub async fn reconcile_orphaned_locks(&self) -> Result<u64> {
        let orphans = sqlx::query_as::<_, OrphanRow>(
            r#"
            SELECT c.id AS cluster_id, c.current_job_id
            FROM clusters c
            WHERE c.operation_status = 'running'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut reconciled = 0;
        for orphan in orphans {
            if let Some(job_id) = orphan.current_job_id {
                sqlx::query(
                    r#"
                    UPDATE jobs SET status = ?1, completed_at = ?2,
                        output = COALESCE(output, '') || ?3
                    WHERE id = ?4 AND status IN ('pending', 'running')
                    "#,
                )
                .bind(JobStatus::Failed)
                .bind(Utc::now())
                .bind("\n[Job failed: orphaned by restart]\n")
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            }

            // Узлы, застрявшие в переходных статусах, тоже считаются проваленными
            sqlx::query(
                r#"
                UPDATE nodes SET status = ?1, installation_error = ?2, updated_at = ?3
                WHERE cluster_id = ?4 AND status IN ('installing', 'draining')
                "#,
            )
            .bind(NodeStatus::Failed)
            .bind("orphaned by restart")
            .bind(Utc::now())
            .bind(orphan.cluster_id)
            .execute(&self.pool)
            .await?;

            sqlx::query(
                r#"
                UPDATE clusters SET operation_status = 'idle', current_job_id = NULL,
                    operation_locked_by = NULL, operation_started_at = NULL, updated_at = ?1
                WHERE id = ?2
                "#,
            )
            .bind(Utc::now())
            .bind(orphan.cluster_id)
            .execute(&self.pool)
            .await?;

            info!(
                "Reconciled orphaned lock on cluster {} (job {:?})",
                orphan.cluster_id, orphan.current_job_id
            );
            reconciled += 1;
        }

        Ok(reconciled)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanRow {
    cluster_id: i64,
    current_job_id: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct CachedStatusRow {
    cached_data: String,
    collected_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    collection_duration_secs: i64,
}

#[derive(Debug, Clone)]
pub struct CachedStatus {
    pub data: serde_json::Value,
    pub collected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub collection_duration_secs: i64,
}
