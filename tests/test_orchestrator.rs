use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rkeatlas_backend::models::{
    CreateClusterRequest, Job, JobKind, JobStatus, LockStatus, NodeInput, NodeRole, NodeStatus,
    ScaleRole,
};
use rkeatlas_backend::services::lock_service::{acquire_cluster_lock, LockAcquire};
use rkeatlas_backend::services::orchestrator::Operation;
use rkeatlas_backend::{Config, EncryptionService, JobManager, Store};

async fn test_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("test.db").display());
    let pool = rkeatlas_backend::db::init_pool(&url).await.unwrap();
    rkeatlas_backend::db::init_schema(&pool).await.unwrap();
    (Store::new(pool), dir)
}

/// Исполняемый стаб вместо ansible-playbook
fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn test_config(work_dir: &Path, playbook_bin: &Path) -> Config {
    Config {
        server_address: "127.0.0.1:0".to_string(),
        database_url: String::new(),
        encryption_key: "test-key".to_string(),
        log_level: "info".to_string(),
        playbook_dir: "/ansible/playbooks".to_string(),
        ansible_playbook_bin: playbook_bin.display().to_string(),
        kubectl_bin: "kubectl".to_string(),
        work_dir: work_dir.display().to_string(),
        join_port: 9345,
        cancel_grace_secs: 2,
        status_cache_ttl_secs: 300,
        analyzer_endpoint: None,
        analyzer_model: None,
    }
}

fn node_input(hostname: &str, ip: &str, role: ScaleRole) -> NodeInput {
    NodeInput {
        hostname: hostname.to_string(),
        ip: ip.to_string(),
        role,
        external_ip: None,
        use_external_ip: false,
    }
}

fn cluster_request(name: &str, nodes: Vec<NodeInput>) -> CreateClusterRequest {
    CreateClusterRequest {
        name: name.to_string(),
        version: "v1.28.9+rke2r1".to_string(),
        credential_id: None,
        nodes,
        data_dir: "/var/lib/rancher/rke2".to_string(),
        api_ip: None,
        token: None,
        additional_sans: None,
        cni: "canal".to_string(),
        custom_registry: "deactive".to_string(),
        custom_mirror: "deactive".to_string(),
        registry_address: None,
        registry_user: None,
        registry_password: None,
        image_overrides: None,
        custom_config: None,
    }
}

async fn wait_for_terminal(store: &Store, job_id: i64) -> Job {
    for _ in 0..300 {
        let job = store.get_job(job_id).await.unwrap().unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {} never reached a terminal state", job_id);
}

async fn wait_for_idle(store: &Store, cluster_id: i64) {
    for _ in 0..100 {
        let cluster = store.get_cluster(cluster_id).await.unwrap().unwrap();
        if cluster.operation_status == LockStatus::Idle {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("cluster {} lock never returned to idle", cluster_id);
}

async fn wait_for_output(store: &Store, job_id: i64, needle: &str) {
    for _ in 0..200 {
        let job = store.get_job(job_id).await.unwrap().unwrap();
        if job.output.as_deref().unwrap_or("").contains(needle) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {} output never contained '{}'", job_id, needle);
}

struct Harness {
    store: Store,
    manager: Arc<JobManager>,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
}

async fn harness(stub_body: &str) -> Harness {
    let (store, db_dir) = test_store().await;
    let stub_dir = tempfile::tempdir().unwrap();
    let stub = write_stub(stub_dir.path(), "playbook-stub.sh", stub_body);
    let config = test_config(stub_dir.path(), &stub);
    let encryption = EncryptionService::new("test-key").unwrap();
    let manager = JobManager::new(config, store.clone(), Some(encryption));
    Harness {
        store,
        manager,
        _dirs: (db_dir, stub_dir),
    }
}

const OK_STUB: &str = "#!/bin/sh\necho \"PLAY [stub] $1\"\necho \"TASK [apply] ok\"\nexit 0\n";
const FAIL_STUB: &str = "#!/bin/sh\necho \"fatal: host unreachable\"\nexit 2\n";
const SLOW_STUB: &str = "#!/bin/sh\necho started\nexec sleep 30\n";

async fn launch_locked(
    harness: &Harness,
    cluster_id: i64,
    kind: JobKind,
    operation: Operation,
) -> Job {
    let cluster = harness.store.get_cluster(cluster_id).await.unwrap().unwrap();
    let job = harness.store.create_job(cluster_id, kind, None).await.unwrap();
    let acquired = acquire_cluster_lock(&harness.store, cluster_id, job.id, kind.as_str())
        .await
        .unwrap();
    assert!(matches!(acquired, LockAcquire::Acquired));
    harness.manager.launch(job.clone(), cluster, operation);
    job
}

#[tokio::test]
async fn test_fresh_install_runs_all_three_stages_in_order() {
    // Полная установка: initial master, затем присоединяющиеся мастера, затем воркеры
    let h = harness(OK_STUB).await;
    let request = cluster_request(
        "c1",
        vec![
            node_input("m1", "10.0.0.1", ScaleRole::Server),
            node_input("m2", "10.0.0.2", ScaleRole::Server),
            node_input("w1", "10.0.0.3", ScaleRole::Agent),
        ],
    );
    let cluster = h.store.create_cluster(&request, "10.0.0.1", "tok").await.unwrap();

    let job = launch_locked(&h, cluster.id, JobKind::Install, Operation::Install).await;
    let job = wait_for_terminal(&h.store, job.id).await;
    assert_eq!(job.status, JobStatus::Success);

    // Стадии строго упорядочены в выводе
    let output = job.output.unwrap();
    let first = output.find("==> Running stage 'initial_master'").unwrap();
    let second = output.find("==> Running stage 'joining_masters'").unwrap();
    let third = output.find("==> Running stage 'workers'").unwrap();
    assert!(first < second && second < third);
    assert!(output.contains("[Job success]"));

    wait_for_idle(&h.store, cluster.id).await;
    let cluster = h.store.get_cluster(cluster.id).await.unwrap().unwrap();
    assert_eq!(cluster.current_job_id, None);
    assert_eq!(cluster.installation_stage.as_deref(), Some("completed"));

    let nodes = h.store.nodes_for_cluster(cluster.id).await.unwrap();
    assert!(nodes.iter().all(|n| n.status == NodeStatus::Active));
    assert!(nodes
        .iter()
        .all(|n| n.installation_completed_at.is_some()));
}

#[tokio::test]
async fn test_failed_stage_aborts_and_releases_lock() {
    // Любой терминальный исход оставляет лок в idle
    let h = harness(FAIL_STUB).await;
    let request = cluster_request(
        "c1",
        vec![
            node_input("m1", "10.0.0.1", ScaleRole::Server),
            node_input("w1", "10.0.0.2", ScaleRole::Agent),
        ],
    );
    let cluster = h.store.create_cluster(&request, "10.0.0.1", "tok").await.unwrap();

    let job = launch_locked(&h, cluster.id, JobKind::Install, Operation::Install).await;
    let job = wait_for_terminal(&h.store, job.id).await;
    assert_eq!(job.status, JobStatus::Failed);

    let output = job.output.unwrap();
    assert!(output.contains("fatal: host unreachable"));
    assert!(output.contains("exit code 2"));
    assert!(output.contains("[Job failed]"));

    wait_for_idle(&h.store, cluster.id).await;

    let nodes = h.store.nodes_for_cluster(cluster.id).await.unwrap();
    let m1 = nodes.iter().find(|n| n.hostname == "m1").unwrap();
    assert_eq!(m1.status, NodeStatus::Failed);
    assert!(m1.installation_error.as_deref().unwrap().contains("exit code 2"));
    // Воркер так и не стартовал: первая стадия провалилась, остальные отменены
    let w1 = nodes.iter().find(|n| n.hostname == "w1").unwrap();
    assert_eq!(w1.status, NodeStatus::Pending);
}

#[tokio::test]
async fn test_cancellation_terminates_subprocess_and_marks_cancelled() {
    // Отмена во время установки
    let h = harness(SLOW_STUB).await;
    let request = cluster_request("c1", vec![node_input("m1", "10.0.0.1", ScaleRole::Server)]);
    let cluster = h.store.create_cluster(&request, "10.0.0.1", "tok").await.unwrap();

    let job = launch_locked(&h, cluster.id, JobKind::Install, Operation::Install).await;
    wait_for_output(&h.store, job.id, "started").await;

    assert!(h.manager.cancel(job.id));
    let job = wait_for_terminal(&h.store, job.id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.output.unwrap().contains("[Job terminated by user]"));

    wait_for_idle(&h.store, cluster.id).await;
    let nodes = h.store.nodes_for_cluster(cluster.id).await.unwrap();
    assert_eq!(nodes[0].status, NodeStatus::Failed);
    assert_eq!(nodes[0].installation_error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn test_cancel_unknown_job_is_rejected() {
    let h = harness(OK_STUB).await;
    assert!(!h.manager.cancel(12345));
}

#[tokio::test]
async fn test_uninstall_removes_all_nodes() {
    let h = harness(OK_STUB).await;
    let request = cluster_request(
        "c1",
        vec![
            node_input("m1", "10.0.0.1", ScaleRole::Server),
            node_input("w1", "10.0.0.2", ScaleRole::Agent),
        ],
    );
    let cluster = h.store.create_cluster(&request, "10.0.0.1", "tok").await.unwrap();
    let nodes = h.store.nodes_for_cluster(cluster.id).await.unwrap();
    let node_ids: Vec<i64> = nodes.iter().map(|n| n.id).collect();
    h.store
        .transition_nodes(&node_ids, NodeStatus::Active, None)
        .await
        .unwrap();

    let job = launch_locked(&h, cluster.id, JobKind::Uninstall, Operation::Uninstall).await;
    let job = wait_for_terminal(&h.store, job.id).await;
    assert_eq!(job.status, JobStatus::Success);

    wait_for_idle(&h.store, cluster.id).await;
    let nodes = h.store.nodes_for_cluster(cluster.id).await.unwrap();
    assert!(nodes.iter().all(|n| n.status == NodeStatus::Removed));
}

#[tokio::test]
async fn test_scale_remove_only_touches_targets() {
    let h = harness(OK_STUB).await;
    let request = cluster_request(
        "c1",
        vec![
            node_input("m1", "10.0.0.1", ScaleRole::Server),
            node_input("m2", "10.0.0.2", ScaleRole::Server),
            node_input("m3", "10.0.0.3", ScaleRole::Server),
            node_input("w1", "10.0.0.4", ScaleRole::Agent),
        ],
    );
    let cluster = h.store.create_cluster(&request, "10.0.0.1", "tok").await.unwrap();
    let nodes = h.store.nodes_for_cluster(cluster.id).await.unwrap();
    let all_ids: Vec<i64> = nodes.iter().map(|n| n.id).collect();
    h.store
        .transition_nodes(&all_ids, NodeStatus::Active, None)
        .await
        .unwrap();
    let worker_id = nodes.iter().find(|n| n.hostname == "w1").unwrap().id;

    let job = launch_locked(
        &h,
        cluster.id,
        JobKind::ScaleRemove,
        Operation::ScaleRemove {
            node_ids: vec![worker_id],
        },
    )
    .await;
    let job = wait_for_terminal(&h.store, job.id).await;
    assert_eq!(job.status, JobStatus::Success);

    wait_for_idle(&h.store, cluster.id).await;
    let nodes = h.store.nodes_for_cluster(cluster.id).await.unwrap();
    for node in &nodes {
        if node.id == worker_id {
            assert_eq!(node.status, NodeStatus::Removed);
        } else {
            assert_eq!(node.status, NodeStatus::Active);
            // Активный узел не откатывается назад
            assert_ne!(node.role, NodeRole::Worker);
        }
    }
}

#[tokio::test]
async fn test_scale_add_installs_only_new_nodes() {
    let h = harness(OK_STUB).await;
    let request = cluster_request("c1", vec![node_input("m1", "10.0.0.1", ScaleRole::Server)]);
    let cluster = h.store.create_cluster(&request, "10.0.0.1", "tok").await.unwrap();
    let nodes = h.store.nodes_for_cluster(cluster.id).await.unwrap();
    h.store
        .transition_nodes(&[nodes[0].id], NodeStatus::Active, None)
        .await
        .unwrap();

    let new_node = h
        .store
        .insert_node(
            cluster.id,
            &node_input("w1", "10.0.0.2", ScaleRole::Agent),
            NodeRole::Worker,
        )
        .await
        .unwrap();

    let job = launch_locked(
        &h,
        cluster.id,
        JobKind::ScaleAddWorkers,
        Operation::ScaleAdd {
            node_ids: vec![new_node.id],
        },
    )
    .await;
    let job = wait_for_terminal(&h.store, job.id).await;
    assert_eq!(job.status, JobStatus::Success);

    wait_for_idle(&h.store, cluster.id).await;
    let nodes = h.store.nodes_for_cluster(cluster.id).await.unwrap();
    assert!(nodes.iter().all(|n| n.status == NodeStatus::Active));
}
