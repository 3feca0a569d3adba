//! Оркестратор операций над кластером.
//!
//! Каждая мутирующая операция выполняется одной задачей, владеющей локом
//! кластера. Супервизор ждёт её через JoinHandle и является единственным
//! местом, где джоба получает терминальный статус, застрявшие узлы
//! помечаются failed, шина закрывается и лок снимается — на успехе,
//! ошибке, отмене и панике одинаково.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::models::{Cluster, Job, JobKind, JobStatus, Node, NodeRole, NodeStatus};
use crate::services::encryption_service::EncryptionService;
use crate::services::event_bus::{EventBusRegistry, JobEventBus};
use crate::services::inventory_service::{self, Stage};
use crate::services::lock_service::release_cluster_lock;
use crate::services::readiness_service;
use crate::services::runner_service::{run_playbook, PlaybookRun, PreparedCredential};
use crate::services::store::Store;

/// Интент, уже прошедший guardrails и владеющий локом
#[derive(Debug, Clone)]
pub enum Operation {
    Install,
    Uninstall,
    /// Явный список новых узлов
    ScaleAdd { node_ids: Vec<i64> },
    /// Явный список удаляемых узлов
    ScaleRemove { node_ids: Vec<i64> },
}

/// Источник инвентаря стадии
enum InventorySource {
    Stage(Stage),
    ScaleAdd,
    Remove,
}

/// Одна стадия: фильтрованное подмножество узлов под один вызов плейбука
struct StagePlan {
    tag: &'static str,
    playbook: &'static str,
    participants: Vec<i64>,
    begin: NodeStatus,
    done: NodeStatus,
    inventory: InventorySource,
    extra_args: Vec<String>,
}

pub struct JobManager {
    config: Config,
    store: Store,
    encryption: Option<EncryptionService>,
    buses: EventBusRegistry,
    cancels: Mutex<HashMap<i64, CancellationToken>>,
}

impl JobManager {
    pub fn new(config: Config, store: Store, encryption: Option<EncryptionService>) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            encryption,
            buses: EventBusRegistry::new(),
            cancels: Mutex::new(HashMap::new()),
        })
    }

    pub fn buses(&self) -> &EventBusRegistry {
        &self.buses
    }

    /// Сигнал отмены работающей джобе. false — джоба этому процессу
    /// не принадлежит (или уже завершилась).
    pub fn cancel(&self, job_id: i64) -> bool {
        let cancels = self.cancels.lock().expect("cancel map mutex poisoned");
        match cancels.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Публикует строку в шину и дописывает её в персистентный буфер
    async fn emit(&self, bus: &JobEventBus, job_id: i64, line: &str) -> Result<()> {
        bus.publish(line);
        let mut chunk = line.to_string();
        chunk.push('\n');
        self.store.append_job_output(job_id, &chunk).await
    }

    /// Запускает мутирующую операцию. Вызывающий уже создал джобу и взял
    /// лок; с этого момента терминальное состояние и снятие лока —
    /// ответственность супервизора, на любом пути выхода.
    pub fn launch(self: &Arc<Self>, job: Job, cluster: Cluster, operation: Operation) {
        let bus = self.buses.create(job.id);
        let cancel = CancellationToken::new();
        self.cancels
            .lock()
            .expect("cancel map mutex poisoned")
            .insert(job.id, cancel.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            let job_id = job.id;
            let cluster_id = cluster.id;
            let kind = job.kind;

            let body = {
                let manager = manager.clone();
                let bus = bus.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    manager
                        .run_operation(job, cluster, operation, &bus, &cancel)
                        .await
                })
            };

            let status = match body.await {
                Ok(Ok(status)) => status,
                Ok(Err(err)) => {
                    error!("Job {} failed: {:#}", job_id, err);
                    let line = format!("Execution failed: {:#}", err);
                    if let Err(emit_err) = manager.emit(&bus, job_id, &line).await {
                        warn!("Job {}: failed to persist error line: {}", job_id, emit_err);
                    }
                    JobStatus::Failed
                }
                Err(join_err) => {
                    error!("Job {} task aborted: {}", job_id, join_err);
                    JobStatus::Failed
                }
            };

            manager.finish_job(job_id, cluster_id, kind, status, &bus).await;
        });
    }

    /// Единственный терминальный путь мутирующей операции
    async fn finish_job(
        &self,
        job_id: i64,
        cluster_id: i64,
        kind: JobKind,
        status: JobStatus,
        bus: &JobEventBus,
    ) {
        let trailer = format!("\n[Job {}]", status.as_str());
        if let Err(err) = self.emit(bus, job_id, &trailer).await {
            warn!("Job {}: failed to persist trailer: {}", job_id, err);
        }

        if let Err(err) = self.store.mark_job_terminal(job_id, status).await {
            error!("Job {}: failed to mark terminal: {:#}", job_id, err);
        }

        if status != JobStatus::Success {
            let reason = if status == JobStatus::Cancelled {
                "cancelled"
            } else {
                "operation failed"
            };
            if let Err(err) = self
                .store
                .fail_transitioning_nodes(cluster_id, reason)
                .await
            {
                error!(
                    "Job {}: failed to fail transitioning nodes: {:#}",
                    job_id, err
                );
            }
        }

        if kind.requires_lock() {
            if let Err(err) = release_cluster_lock(&self.store, cluster_id).await {
                error!("Job {}: failed to release lock: {:#}", job_id, err);
            }
        }

        bus.close(status);
        self.buses.remove(job_id);
        self.cancels
            .lock()
            .expect("cancel map mutex poisoned")
            .remove(&job_id);

        info!("Job {} finished with status {}", job_id, status.as_str());
    }

    async fn run_operation(
        &self,
        job: Job,
        cluster: Cluster,
        operation: Operation,
        bus: &JobEventBus,
        cancel: &CancellationToken,
    ) -> Result<JobStatus> {
        self.store.mark_job_running(job.id).await?;

        std::fs::create_dir_all(&self.config.work_dir)
            .with_context(|| format!("failed to create work dir {}", self.config.work_dir))?;
        let workdir = tempfile::Builder::new()
            .prefix(&format!("job-{}-", job.id))
            .tempdir_in(&self.config.work_dir)
            .context("failed to create job working directory")?;

        let nodes = self.store.nodes_for_cluster(cluster.id).await?;
        let plan = self.plan_stages(&cluster, &nodes, &operation, workdir.path())?;

        // Учётка нужна только если она назначена кластеру; секрет живёт
        // в рабочем каталоге и удаляется вместе с ним
        let credential = match cluster.credential_id {
            Some(credential_id) => {
                let credential = self
                    .store
                    .get_credential(credential_id)
                    .await?
                    .ok_or_else(|| anyhow!("credential {} not found", credential_id))?;
                let encryption = self
                    .encryption
                    .as_ref()
                    .ok_or_else(|| anyhow!("ENCRYPTION_KEY is not configured"))?;
                Some(PreparedCredential::prepare(
                    &credential,
                    encryption,
                    workdir.path(),
                )?)
            }
            None => None,
        };
        let username = credential
            .as_ref()
            .map(|c| c.username.clone())
            .unwrap_or_else(|| "root".to_string());

        for stage in &plan {
            if cancel.is_cancelled() {
                return Ok(JobStatus::Cancelled);
            }

            self.emit(bus, job.id, &format!("==> Running stage '{}'", stage.tag))
                .await?;
            self.store
                .set_installation_stage(cluster.id, Some(stage.tag))
                .await?;
            self.store
                .transition_nodes(&stage.participants, stage.begin, None)
                .await?;

            let run =
                self.render_stage(&cluster, &nodes, stage, &username, workdir.path(), &credential)?;
            let outcome = run_playbook(&self.config, &self.store, bus, job.id, &run, cancel).await?;

            if outcome.cancelled {
                self.emit(bus, job.id, "[Job terminated by user]").await?;
                return Ok(JobStatus::Cancelled);
            }
            if !outcome.succeeded() {
                let reason = format!(
                    "stage '{}' failed with exit code {}",
                    stage.tag,
                    outcome
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string())
                );
                self.store
                    .transition_nodes(&stage.participants, NodeStatus::Failed, Some(&reason))
                    .await?;
                self.emit(bus, job.id, &reason).await?;
                return Ok(JobStatus::Failed);
            }

            self.store
                .transition_nodes(&stage.participants, stage.done, None)
                .await?;
        }

        if matches!(operation, Operation::Install) {
            self.store
                .set_installation_stage(cluster.id, Some("completed"))
                .await?;
        }

        Ok(JobStatus::Success)
    }

    /// Последовательность стадий операции. Порядок строгий: следующая
    /// стадия не начнётся, пока предыдущая не завершилась успешно.
    fn plan_stages(
        &self,
        cluster: &Cluster,
        nodes: &[Node],
        operation: &Operation,
        workdir: &Path,
    ) -> Result<Vec<StagePlan>> {
        let alive: Vec<&Node> = nodes
            .iter()
            .filter(|n| n.status != NodeStatus::Removed)
            .collect();

        let plan = match operation {
            Operation::Install => {
                let initial: Vec<i64> = alive
                    .iter()
                    .filter(|n| n.role == NodeRole::InitialMaster)
                    .map(|n| n.id)
                    .collect();
                if initial.len() != 1 {
                    return Err(anyhow!(
                        "install requires exactly one initial master, found {}",
                        initial.len()
                    ));
                }
                let joining: Vec<i64> = alive
                    .iter()
                    .filter(|n| n.role == NodeRole::Master)
                    .map(|n| n.id)
                    .collect();
                let workers: Vec<i64> = alive
                    .iter()
                    .filter(|n| n.role == NodeRole::Worker)
                    .map(|n| n.id)
                    .collect();

                let mut plan = vec![StagePlan {
                    tag: "initial_master",
                    playbook: "install_rke2.yml",
                    participants: initial,
                    begin: NodeStatus::Installing,
                    done: NodeStatus::Active,
                    inventory: InventorySource::Stage(Stage::InitialMaster),
                    extra_args: Vec::new(),
                }];
                if !joining.is_empty() {
                    plan.push(StagePlan {
                        tag: "joining_masters",
                        playbook: "install_rke2.yml",
                        participants: joining,
                        begin: NodeStatus::Installing,
                        done: NodeStatus::Active,
                        inventory: InventorySource::Stage(Stage::JoiningMasters),
                        extra_args: Vec::new(),
                    });
                }
                if !workers.is_empty() {
                    plan.push(StagePlan {
                        tag: "workers",
                        playbook: "install_rke2.yml",
                        participants: workers,
                        begin: NodeStatus::Installing,
                        done: NodeStatus::Active,
                        inventory: InventorySource::Stage(Stage::Workers),
                        extra_args: Vec::new(),
                    });
                }
                plan
            }
            Operation::Uninstall => {
                let participants: Vec<i64> = alive.iter().map(|n| n.id).collect();
                vec![StagePlan {
                    tag: "uninstall",
                    playbook: "uninstall_rke2.yml",
                    participants,
                    begin: NodeStatus::Draining,
                    done: NodeStatus::Removed,
                    inventory: InventorySource::Stage(Stage::All),
                    extra_args: Vec::new(),
                }]
            }
            Operation::ScaleAdd { node_ids } => vec![StagePlan {
                tag: "scale_add",
                playbook: "add_node.yml",
                participants: node_ids.clone(),
                begin: NodeStatus::Installing,
                done: NodeStatus::Active,
                inventory: InventorySource::ScaleAdd,
                extra_args: Vec::new(),
            }],
            Operation::ScaleRemove { node_ids } => {
                let targets: Vec<&&Node> =
                    alive.iter().filter(|n| node_ids.contains(&n.id)).collect();
                let hostnames: Vec<&str> =
                    targets.iter().map(|n| n.hostname.as_str()).collect();

                // remove_node.yml дренирует узлы через kubectl, ему нужен kubeconfig
                let mut extra_args =
                    vec![format!("nodes_to_remove={}", serde_json::to_string(&hostnames)?)];
                if let Some(kubeconfig) = &cluster.kubeconfig {
                    let path = workdir.join("kubeconfig.yaml");
                    std::fs::write(&path, kubeconfig)
                        .context("failed to write kubeconfig for removal")?;
                    extra_args.push(format!("kubeconfig_path={}", path.display()));
                }

                vec![StagePlan {
                    tag: "scale_remove",
                    playbook: "remove_node.yml",
                    participants: node_ids.clone(),
                    begin: NodeStatus::Draining,
                    done: NodeStatus::Removed,
                    inventory: InventorySource::Remove,
                    extra_args,
                }]
            }
        };

        Ok(plan)
    }

    fn render_stage(
        &self,
        cluster: &Cluster,
        nodes: &[Node],
        stage: &StagePlan,
        username: &str,
        workdir: &Path,
        credential: &Option<PreparedCredential>,
    ) -> Result<PlaybookRun> {
        let inventory_content = match &stage.inventory {
            InventorySource::Stage(variant) => {
                inventory_service::render_for_stage(cluster, nodes, *variant, username)?
            }
            InventorySource::ScaleAdd => {
                let selected: Vec<Node> = nodes
                    .iter()
                    .filter(|n| stage.participants.contains(&n.id))
                    .cloned()
                    .collect();
                inventory_service::render_for_scale_add(&selected, username)
            }
            InventorySource::Remove => {
                let selected: Vec<Node> = nodes
                    .iter()
                    .filter(|n| stage.participants.contains(&n.id))
                    .cloned()
                    .collect();
                inventory_service::render_for_scale_remove(&selected, username)
            }
        };
        let extras_variant = match &stage.inventory {
            InventorySource::Stage(variant) => *variant,
            InventorySource::ScaleAdd => Stage::ScaleAdd,
            InventorySource::Remove => Stage::All,
        };
        let extras_content = inventory_service::render_extra_vars(cluster, extras_variant)?;

        let inventory_path = workdir.join(format!("inventory_{}.ini", stage.tag));
        let extras_path = workdir.join(format!("extravars_{}.yml", stage.tag));
        std::fs::write(&inventory_path, inventory_content)
            .context("failed to write inventory")?;
        std::fs::write(&extras_path, extras_content).context("failed to write extra vars")?;

        Ok(PlaybookRun {
            playbook: self.config.playbook_path(stage.playbook),
            inventory: inventory_path,
            extra_vars: extras_path,
            private_key: credential
                .as_ref()
                .and_then(|c| c.key_path().map(|p| p.to_path_buf())),
            password_file: credential
                .as_ref()
                .and_then(|c| c.password_path().map(|p| p.to_path_buf())),
            extra_args: stage.extra_args.clone(),
        })
    }

    /// Read-only проверка готовности: лок не берётся, узлы не трогаются.
    /// Терминальный статус и закрытие шины — в том же духе, что и у
    /// мутирующих операций, но без снятия лока.
    pub fn launch_preflight(self: &Arc<Self>, job: Job, cluster: Cluster, analyze: bool) {
        let bus = self.buses.create(job.id);
        let manager = self.clone();

        tokio::spawn(async move {
            let job_id = job.id;
            let body = {
                let manager = manager.clone();
                let bus = bus.clone();
                tokio::spawn(async move {
                    readiness_service::run_preflight_job(
                        &manager.config,
                        &manager.store,
                        &bus,
                        job,
                        cluster,
                        analyze,
                    )
                    .await
                })
            };

            let status = match body.await {
                Ok(Ok(status)) => status,
                Ok(Err(err)) => {
                    error!("Preflight job {} failed: {:#}", job_id, err);
                    let line = format!("Readiness check failed: {:#}", err);
                    bus.publish(&line);
                    let mut chunk = line;
                    chunk.push('\n');
                    if let Err(store_err) =
                        manager.store.append_job_output(job_id, &chunk).await
                    {
                        warn!("Job {}: failed to persist error: {}", job_id, store_err);
                    }
                    JobStatus::Failed
                }
                Err(join_err) => {
                    error!("Preflight job {} task aborted: {}", job_id, join_err);
                    JobStatus::Failed
                }
            };

            if let Err(err) = manager.store.mark_job_terminal(job_id, status).await {
                error!("Job {}: failed to mark terminal: {:#}", job_id, err);
            }
            bus.close(status);
            manager.buses.remove(job_id);
            info!("Preflight job {} finished with status {}", job_id, status.as_str());
        });
    }
}
