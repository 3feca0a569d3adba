use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Тип кластера: создаваемый с нуля или зарегистрированный по kubeconfig
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ClusterKind {
    Fresh,
    Registered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum LockStatus {
    Idle,
    Running,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Cluster {
    pub id: i64,
    pub name: String,
    pub kind: ClusterKind,
    pub version: String,
    pub credential_id: Option<i64>,

    // RKE2 configuration
    pub data_dir: String,
    pub api_ip: Option<String>,
    pub token: Option<String>,
    pub additional_sans: Option<sqlx::types::Json<Vec<String>>>,
    pub cni: String,

    // Registry settings
    pub custom_registry: String,
    pub custom_mirror: String,
    pub registry_address: Option<sqlx::types::Json<Vec<String>>>,
    pub registry_user: Option<String>,
    pub registry_password: Option<String>,

    // Custom container images keyed by component name
    pub image_overrides: Option<sqlx::types::Json<std::collections::BTreeMap<String, String>>>,

    pub custom_config: Option<String>,
    pub kubeconfig: Option<String>,
    pub cluster_vars: Option<sqlx::types::Json<serde_json::Map<String, serde_json::Value>>>,

    /// Current installation stage, visible without reading job output
    pub installation_stage: Option<String>,

    // Operation lock record (single writer per cluster)
    pub operation_status: LockStatus,
    pub current_job_id: Option<i64>,
    pub operation_locked_by: Option<String>,
    pub operation_started_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Cluster {
    /// Join endpoint handed to joining masters and workers. The initial
    /// master must never receive this value.
    pub fn join_url(&self) -> Option<String> {
        self.api_ip.as_ref().map(|ip| format!("https://{}:9345", ip))
    }
}
