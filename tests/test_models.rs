use rkeatlas_backend::models::{
    ClusterKind, CredentialKind, JobKind, JobStatus, NodeInput, NodeRole, NodeStatus, ScaleRole,
};

#[test]
fn test_node_role_serde() {
    // Теговые варианты: неизвестные значения отклоняются на границе
    let role: NodeRole = serde_json::from_str("\"initial_master\"").unwrap();
    assert_eq!(role, NodeRole::InitialMaster);
    assert_eq!(
        serde_json::to_string(&NodeRole::InitialMaster).unwrap(),
        "\"initial_master\""
    );

    assert!(serde_json::from_str::<NodeRole>("\"boss_node\"").is_err());
}

#[test]
fn test_node_status_serde() {
    let status: NodeStatus = serde_json::from_str("\"draining\"").unwrap();
    assert_eq!(status, NodeStatus::Draining);
    assert!(serde_json::from_str::<NodeStatus>("\"DRAINING\"").is_err());
}

#[test]
fn test_job_kind_serde_and_lock_requirements() {
    let kind: JobKind = serde_json::from_str("\"scale_add_masters\"").unwrap();
    assert_eq!(kind, JobKind::ScaleAddMasters);

    // Только read-only проверки обходятся без эксклюзивного лока
    assert!(JobKind::Install.requires_lock());
    assert!(JobKind::Uninstall.requires_lock());
    assert!(JobKind::ScaleAddMasters.requires_lock());
    assert!(JobKind::ScaleAddWorkers.requires_lock());
    assert!(JobKind::ScaleRemove.requires_lock());
    assert!(!JobKind::PreflightCheck.requires_lock());
    assert!(!JobKind::UpgradeCheck.requires_lock());
}

#[test]
fn test_job_status_terminal() {
    assert!(!JobStatus::Pending.is_terminal());
    assert!(!JobStatus::Running.is_terminal());
    assert!(JobStatus::Success.is_terminal());
    assert!(JobStatus::Failed.is_terminal());
    assert!(JobStatus::Cancelled.is_terminal());
    assert_eq!(JobStatus::Cancelled.as_str(), "cancelled");
}

#[test]
fn test_cluster_kind_serde() {
    let kind: ClusterKind = serde_json::from_str("\"fresh\"").unwrap();
    assert_eq!(kind, ClusterKind::Fresh);
    let kind: ClusterKind = serde_json::from_str("\"registered\"").unwrap();
    assert_eq!(kind, ClusterKind::Registered);
    assert!(serde_json::from_str::<ClusterKind>("\"imported\"").is_err());
}

#[test]
fn test_credential_kind_serde() {
    let kind: CredentialKind = serde_json::from_str("\"key\"").unwrap();
    assert_eq!(kind, CredentialKind::Key);
    assert!(serde_json::from_str::<CredentialKind>("\"certificate\"").is_err());
}

#[test]
fn test_node_input_parsing() {
    // Роль в запросах — в терминах RKE2 (server/agent)
    let input: NodeInput = serde_json::from_str(
        r#"{"hostname": "worker-02", "ip": "10.0.0.5", "role": "agent"}"#,
    )
    .unwrap();
    assert_eq!(input.role, ScaleRole::Agent);
    assert_eq!(input.external_ip, None);
    assert!(!input.use_external_ip);

    assert!(serde_json::from_str::<NodeInput>(
        r#"{"hostname": "w", "ip": "10.0.0.5", "role": "manager"}"#
    )
    .is_err());
}
