use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum NodeRole {
    InitialMaster,
    Master,
    Worker,
}

impl NodeRole {
    pub fn is_control_plane(&self) -> bool {
        matches!(self, NodeRole::InitialMaster | NodeRole::Master)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Installing,
    Active,
    Failed,
    Draining,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Node {
    pub id: i64,
    pub cluster_id: i64,

    pub hostname: String,
    pub internal_ip: String,
    pub external_ip: Option<String>,
    /// Which address the execution tool connects to
    pub use_external_ip: bool,

    pub role: NodeRole,
    pub status: NodeStatus,

    pub node_vars: Option<sqlx::types::Json<serde_json::Map<String, serde_json::Value>>>,

    pub installation_started_at: Option<DateTime<Utc>>,
    pub installation_completed_at: Option<DateTime<Utc>>,
    pub installation_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// IP the remote-execution tool should connect to
    pub fn connect_ip(&self) -> &str {
        match (&self.external_ip, self.use_external_ip) {
            (Some(external), true) => external,
            _ => &self.internal_ip,
        }
    }
}
