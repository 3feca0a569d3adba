use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Cluster, ClusterKind, CredentialKind, Job, JobKind, JobStatus, LockStatus, Node};

/// Роль узла в запросах на масштабирование, в терминах RKE2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleRole {
    Server,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInput {
    pub hostname: String,
    pub ip: String,
    pub role: ScaleRole,
    #[serde(default)]
    pub external_ip: Option<String>,
    #[serde(default)]
    pub use_external_ip: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateClusterRequest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub credential_id: Option<i64>,
    pub nodes: Vec<NodeInput>,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub api_ip: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub additional_sans: Option<Vec<String>>,
    #[serde(default = "default_cni")]
    pub cni: String,
    #[serde(default = "default_deactive")]
    pub custom_registry: String,
    #[serde(default = "default_deactive")]
    pub custom_mirror: String,
    #[serde(default)]
    pub registry_address: Option<Vec<String>>,
    #[serde(default)]
    pub registry_user: Option<String>,
    #[serde(default)]
    pub registry_password: Option<String>,
    #[serde(default)]
    pub image_overrides: Option<std::collections::BTreeMap<String, String>>,
    #[serde(default)]
    pub custom_config: Option<String>,
}

fn default_data_dir() -> String {
    "/var/lib/rancher/rke2".to_string()
}

fn default_cni() -> String {
    "canal".to_string()
}

fn default_deactive() -> String {
    "deactive".to_string()
}

#[derive(Debug, Deserialize)]
pub struct RegisterClusterRequest {
    pub name: String,
    pub kubeconfig: String,
    pub target_version: String,
}

/// Обновляется только белый список полей
#[derive(Debug, Default, Deserialize)]
pub struct UpdateClusterRequest {
    pub name: Option<String>,
    pub version: Option<String>,
    pub cni: Option<String>,
    pub data_dir: Option<String>,
    pub api_ip: Option<String>,
    pub token: Option<String>,
    pub additional_sans: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub nodes: Vec<NodeInput>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ScaleRemoveQuery {
    #[serde(default)]
    pub confirm_master_removal: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct PreflightQuery {
    #[serde(default)]
    pub analyze: bool,
    #[serde(default)]
    pub target_version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UninstallQuery {
    pub confirmation: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default)]
    pub cluster_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UploadKubeconfigRequest {
    pub content: String,
}

// Credential payloads

#[derive(Debug, Deserialize)]
pub struct CreateCredentialRequest {
    pub name: String,
    pub username: String,
    pub kind: CredentialKind,
    /// Plaintext key or password; encrypted before it reaches the store
    pub secret: String,
}

#[derive(Debug, Serialize)]
pub struct CredentialResponse {
    pub id: i64,
    pub name: String,
    pub username: String,
    pub kind: CredentialKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostInput {
    pub hostname: String,
    pub ip: String,
}

#[derive(Debug, Deserialize)]
pub struct AccessCheckRequest {
    pub credential_id: i64,
    pub hosts: Vec<HostInput>,
}

#[derive(Debug, Serialize)]
pub struct HostCheckResult {
    pub hostname: String,
    pub ip: String,
    pub status: String,
    pub ssh_reachable: bool,
    pub sudo_available: bool,
    pub os_compatible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AccessCheckResponse {
    pub overall_status: String,
    pub results: Vec<HostCheckResult>,
}

// Entity responses

#[derive(Debug, Serialize)]
pub struct ClusterResponse {
    pub id: i64,
    pub name: String,
    pub kind: ClusterKind,
    pub version: String,
    pub credential_id: Option<i64>,
    pub cni: String,
    pub data_dir: String,
    pub api_ip: Option<String>,
    pub token: Option<String>,
    pub additional_sans: Option<Vec<String>>,
    pub installation_stage: Option<String>,
    pub kubeconfig: Option<String>,
    pub operation_status: LockStatus,
    pub current_job_id: Option<i64>,
    pub operation_locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub nodes: Vec<Node>,
}

impl ClusterResponse {
    pub fn from_parts(cluster: Cluster, nodes: Vec<Node>) -> Self {
        Self {
            id: cluster.id,
            name: cluster.name,
            kind: cluster.kind,
            version: cluster.version,
            credential_id: cluster.credential_id,
            cni: cluster.cni,
            data_dir: cluster.data_dir,
            api_ip: cluster.api_ip,
            token: cluster.token,
            additional_sans: cluster.additional_sans.map(|s| s.0),
            installation_stage: cluster.installation_stage,
            kubeconfig: cluster.kubeconfig,
            operation_status: cluster.operation_status,
            current_job_id: cluster.current_job_id,
            operation_locked_by: cluster.operation_locked_by,
            created_at: cluster.created_at,
            nodes,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: i64,
    pub cluster_id: i64,
    pub kind: JobKind,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub analysis_summary: Option<String>,
    pub analysis_model: Option<String>,
    pub analysis_token_count: Option<i64>,
    pub target_version: Option<String>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            cluster_id: job.cluster_id,
            kind: job.kind,
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            analysis_summary: job.analysis_summary,
            analysis_model: job.analysis_model,
            analysis_token_count: job.analysis_token_count,
            target_version: job.target_version,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobDetailResponse {
    #[serde(flatten)]
    pub job: JobResponse,
    pub output: Option<String>,
    pub readiness_json: Option<serde_json::Value>,
}

impl From<Job> for JobDetailResponse {
    fn from(job: Job) -> Self {
        let output = job.output.clone();
        let readiness_json = job.readiness_json.clone().map(|j| j.0);
        Self {
            job: JobResponse::from(job),
            output,
            readiness_json,
        }
    }
}

/// Ответ scale/add: при смешанном запросе создаётся только мастер-джоба,
/// воркеры остаются за повторным вызовом клиента
#[derive(Debug, Serialize)]
pub struct ScaleAddResponse {
    pub job_id: i64,
    pub message: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub sequenced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers_pending: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ScaleRemoveResponse {
    pub job_id: i64,
    pub message: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}
