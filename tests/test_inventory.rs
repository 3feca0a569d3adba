use chrono::Utc;
use rkeatlas_backend::models::{Cluster, ClusterKind, LockStatus, Node, NodeRole, NodeStatus};
use rkeatlas_backend::services::inventory_service::{self, Stage};

/// Кластер с типовой конфигурацией для рендера
fn make_cluster() -> Cluster {
    let now = Utc::now();
    Cluster {
        id: 1,
        name: "prod".to_string(),
        kind: ClusterKind::Fresh,
        version: "v1.28.9+rke2r1".to_string(),
        credential_id: Some(1),
        data_dir: "/var/lib/rancher/rke2".to_string(),
        api_ip: Some("10.0.0.1".to_string()),
        token: Some("join-token".to_string()),
        additional_sans: None,
        cni: "canal".to_string(),
        custom_registry: "deactive".to_string(),
        custom_mirror: "deactive".to_string(),
        registry_address: None,
        registry_user: None,
        registry_password: None,
        image_overrides: None,
        custom_config: None,
        kubeconfig: None,
        cluster_vars: None,
        installation_stage: None,
        operation_status: LockStatus::Idle,
        current_job_id: None,
        operation_locked_by: None,
        operation_started_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn make_node(id: i64, hostname: &str, ip: &str, role: NodeRole, status: NodeStatus) -> Node {
    let now = Utc::now();
    Node {
        id,
        cluster_id: 1,
        hostname: hostname.to_string(),
        internal_ip: ip.to_string(),
        external_ip: None,
        use_external_ip: false,
        role,
        status,
        node_vars: None,
        installation_started_at: None,
        installation_completed_at: None,
        installation_error: None,
        created_at: now,
        updated_at: now,
    }
}

fn sample_nodes() -> Vec<Node> {
    vec![
        make_node(1, "m1", "10.0.0.1", NodeRole::InitialMaster, NodeStatus::Pending),
        make_node(2, "m2", "10.0.0.2", NodeRole::Master, NodeStatus::Pending),
        make_node(3, "w1", "10.0.0.3", NodeRole::Worker, NodeStatus::Pending),
        make_node(4, "w2", "10.0.0.4", NodeRole::Worker, NodeStatus::Removed),
    ]
}

#[test]
fn test_initial_master_stage() {
    let inventory = inventory_service::render_for_stage(
        &make_cluster(),
        &sample_nodes(),
        Stage::InitialMaster,
        "ubuntu",
    )
    .unwrap();

    assert!(inventory.starts_with("[initial_master]"));
    assert!(inventory.contains("m1 ansible_host=10.0.0.1 ansible_user=ubuntu"));
    assert!(inventory.contains("rke2_type=server"));
    assert!(inventory.contains("node_role=initial_master"));
    assert!(!inventory.contains("m2"));
    assert!(!inventory.contains("w1"));
}

#[test]
fn test_initial_master_stage_requires_exactly_one() {
    let nodes = vec![make_node(1, "w1", "10.0.0.3", NodeRole::Worker, NodeStatus::Pending)];
    assert!(inventory_service::render_for_stage(
        &make_cluster(),
        &nodes,
        Stage::InitialMaster,
        "ubuntu"
    )
    .is_err());
}

#[test]
fn test_joining_masters_stage() {
    let inventory = inventory_service::render_for_stage(
        &make_cluster(),
        &sample_nodes(),
        Stage::JoiningMasters,
        "ubuntu",
    )
    .unwrap();

    assert!(inventory.starts_with("[joining_masters]"));
    assert!(inventory.contains("m2"));
    assert!(inventory.contains("node_role=joining_master"));
    assert!(!inventory.contains("m1 "));
}

#[test]
fn test_workers_stage_excludes_removed() {
    let inventory = inventory_service::render_for_stage(
        &make_cluster(),
        &sample_nodes(),
        Stage::Workers,
        "ubuntu",
    )
    .unwrap();

    assert!(inventory.contains("w1"));
    // Удалённые узлы никогда не попадают в инвентарь
    assert!(!inventory.contains("w2"));
    assert!(inventory.contains("rke2_type=agent"));
}

#[test]
fn test_all_stage_groups_masters_and_workers() {
    let inventory = inventory_service::render_for_stage(
        &make_cluster(),
        &sample_nodes(),
        Stage::All,
        "ubuntu",
    )
    .unwrap();

    assert!(inventory.contains("[masters]"));
    assert!(inventory.contains("[workers]"));
    assert!(inventory.contains("[k8s_cluster:children]"));
    assert!(inventory.contains("node_role=initial_master"));
    assert!(inventory.contains("node_role=joining_master"));
}

#[test]
fn test_external_ip_preference() {
    let mut node = make_node(1, "w1", "10.0.0.3", NodeRole::Worker, NodeStatus::Pending);
    node.external_ip = Some("203.0.113.5".to_string());
    node.use_external_ip = true;

    let inventory =
        inventory_service::render_for_stage(&make_cluster(), &[node], Stage::Workers, "ubuntu")
            .unwrap();
    assert!(inventory.contains("ansible_host=203.0.113.5"));
}

#[test]
fn test_scale_add_inventory_treats_servers_as_joining() {
    let nodes = vec![
        make_node(10, "m3", "10.0.0.5", NodeRole::Master, NodeStatus::Pending),
        make_node(11, "w3", "10.0.0.6", NodeRole::Worker, NodeStatus::Pending),
    ];
    let inventory = inventory_service::render_for_scale_add(&nodes, "ubuntu");

    assert!(inventory.starts_with("[new_nodes]"));
    // Присоединение к живому кластеру: серверы всегда joining, не initial
    assert!(inventory.contains("node_role=joining_master"));
    assert!(!inventory.contains("node_role=initial_master"));
    assert!(inventory.contains("[new_servers]\nm3"));
    assert!(inventory.contains("[new_agents]\nw3"));
}

#[test]
fn test_scale_remove_inventory() {
    let nodes = vec![
        make_node(2, "m2", "10.0.0.2", NodeRole::Master, NodeStatus::Active),
        make_node(3, "w1", "10.0.0.3", NodeRole::Worker, NodeStatus::Active),
    ];
    let inventory = inventory_service::render_for_scale_remove(&nodes, "ubuntu");
    assert!(inventory.starts_with("[removed_servers]"));
    assert!(inventory.contains("m2"));
    assert!(inventory.contains("[removed_agents]"));
    assert!(inventory.contains("w1"));
}

mod extra_vars {
    use super::*;

    #[test]
    fn initial_master_variant_has_no_join_endpoint() {
        // Инвариант: первый мастер не должен указывать server на самого себя
        let extras =
            inventory_service::render_extra_vars(&make_cluster(), Stage::InitialMaster).unwrap();
        assert!(!extras.contains("server_url"));
        assert!(extras.contains("rke2_version: v1.28.9+rke2r1"));
        assert!(extras.contains("rke2_token: join-token"));
        assert!(extras.contains("rke2_data_dir: /var/lib/rancher/rke2"));
        assert!(extras.contains("cni: canal"));
    }

    #[test]
    fn joining_variants_always_carry_join_endpoint() {
        for stage in [Stage::JoiningMasters, Stage::Workers, Stage::ScaleAdd, Stage::All] {
            let extras = inventory_service::render_extra_vars(&make_cluster(), stage).unwrap();
            assert!(
                extras.contains("server_url") && extras.contains("10.0.0.1:9345"),
                "stage {:?} must include the join endpoint",
                stage
            );
        }
    }

    #[test]
    fn registry_settings_rendered_only_when_mirror_active() {
        let mut cluster = make_cluster();
        cluster.registry_address =
            Some(sqlx::types::Json(vec!["registry.local:5000".to_string()]));
        cluster.registry_user = Some("admin".to_string());

        let extras = inventory_service::render_extra_vars(&cluster, Stage::Workers).unwrap();
        assert!(!extras.contains("registry.local"));

        cluster.custom_mirror = "active".to_string();
        let extras = inventory_service::render_extra_vars(&cluster, Stage::Workers).unwrap();
        assert!(extras.contains("registry.local"));
        assert!(extras.contains("registry_user: admin"));
    }

    #[test]
    fn image_overrides_and_cluster_vars_are_merged() {
        let mut cluster = make_cluster();
        let mut images = std::collections::BTreeMap::new();
        images.insert(
            "pause_image".to_string(),
            "registry.local/pause:3.9".to_string(),
        );
        cluster.image_overrides = Some(sqlx::types::Json(images));

        let mut vars = serde_json::Map::new();
        vars.insert("custom_flag".to_string(), serde_json::Value::from(true));
        cluster.cluster_vars = Some(sqlx::types::Json(vars));

        let extras = inventory_service::render_extra_vars(&cluster, Stage::Workers).unwrap();
        assert!(extras.contains("pause_image") && extras.contains("registry.local/pause"));
        assert!(extras.contains("custom_flag: true"));
    }

    #[test]
    fn additional_sans_rendered_as_list() {
        let mut cluster = make_cluster();
        cluster.additional_sans =
            Some(sqlx::types::Json(vec!["api.example.com".to_string()]));
        let extras = inventory_service::render_extra_vars(&cluster, Stage::Workers).unwrap();
        assert!(extras.contains("rke2_additional_sans"));
        assert!(extras.contains("api.example.com"));
    }
}
