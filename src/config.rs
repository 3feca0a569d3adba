use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server_address: String,
    pub database_url: String,
    pub encryption_key: String,
    pub log_level: String,

    /// Directory with the RKE2 playbooks
    pub playbook_dir: String,
    /// Binary used to run playbooks
    pub ansible_playbook_bin: String,
    /// Binary used by the cluster-status probe
    pub kubectl_bin: String,
    /// Per-job working directories are created under this path
    pub work_dir: String,

    /// RKE2 supervisor port probed by the bootstrap guardrail
    pub join_port: u16,
    /// Grace period between SIGTERM and SIGKILL on cancellation
    pub cancel_grace_secs: u64,
    /// TTL of the cluster status cache
    pub status_cache_ttl_secs: i64,

    // Optional analyzer; absent values disable the feature
    pub analyzer_endpoint: Option<String>,
    pub analyzer_model: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Опциональная загрузка .env только если явно указано USE_DOTENV=true
        if env::var("USE_DOTENV").ok().as_deref() == Some("true") {
            dotenv::dotenv().ok();
        }

        let config = Config {
            server_address: env::var("SERVER_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/rkeatlas.db".to_string()),
            encryption_key: env::var("ENCRYPTION_KEY").unwrap_or_default(),
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            playbook_dir: env::var("PLAYBOOK_DIR")
                .unwrap_or_else(|_| "/ansible/playbooks".to_string()),
            ansible_playbook_bin: env::var("ANSIBLE_PLAYBOOK_BIN")
                .unwrap_or_else(|_| "ansible-playbook".to_string()),
            kubectl_bin: env::var("KUBECTL_BIN").unwrap_or_else(|_| "kubectl".to_string()),
            work_dir: env::var("WORK_DIR").unwrap_or_else(|_| "/tmp/rkeatlas".to_string()),
            join_port: env::var("RKE2_JOIN_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(9345),
            cancel_grace_secs: env::var("CANCEL_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            status_cache_ttl_secs: env::var("CLUSTER_CACHE_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            analyzer_endpoint: env::var("ANALYZER_ENDPOINT").ok(),
            analyzer_model: env::var("ANALYZER_MODEL").ok(),
        };

        Ok(config)
    }

    pub fn playbook_path(&self, name: &str) -> String {
        format!("{}/{}", self.playbook_dir.trim_end_matches('/'), name)
    }

    pub fn analyzer_enabled(&self) -> bool {
        self.analyzer_endpoint.is_some()
    }
}
