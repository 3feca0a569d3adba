use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum JobKind {
    Install,
    Uninstall,
    ScaleAddMasters,
    ScaleAddWorkers,
    ScaleRemove,
    PreflightCheck,
    UpgradeCheck,
}

impl JobKind {
    /// Только мутирующие операции берут эксклюзивный лок кластера
    pub fn requires_lock(&self) -> bool {
        !matches!(self, JobKind::PreflightCheck | JobKind::UpgradeCheck)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Install => "install",
            JobKind::Uninstall => "uninstall",
            JobKind::ScaleAddMasters => "scale_add_masters",
            JobKind::ScaleAddWorkers => "scale_add_workers",
            JobKind::ScaleRemove => "scale_remove",
            JobKind::PreflightCheck => "preflight_check",
            JobKind::UpgradeCheck => "upgrade_check",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub id: i64,
    pub cluster_id: i64,
    pub kind: JobKind,
    pub status: JobStatus,

    /// Appended-to output buffer (merged stdout/stderr of the playbook runs)
    pub output: Option<String>,

    /// Structured readiness result for preflight/upgrade checks
    pub readiness_json: Option<sqlx::types::Json<serde_json::Value>>,
    pub analysis_summary: Option<String>,
    pub analysis_model: Option<String>,
    pub analysis_token_count: Option<i64>,

    pub target_version: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
