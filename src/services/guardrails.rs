//! Защитные проверки перед мутирующими операциями.
//!
//! Все предикаты чистые: на вход снимок узлов и запрос, на выход решение.
//! Сетевой probe вынесен в отдельную async-функцию, его результат
//! передаётся в предикат параметром.

use std::collections::HashSet;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::warn;

use crate::models::{Node, NodeInput, NodeRole, NodeStatus, ScaleRole};

/// Положительное решение. `warning` заполняется, когда операция разрешена,
/// но оставляет кластер в нерекомендуемой конфигурации.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardrailOk {
    pub warning: Option<String>,
}

impl GuardrailOk {
    fn clean() -> Self {
        Self { warning: None }
    }
}

/// Отказ с точной причиной, возвращается клиенту как 400
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct GuardrailRejection(pub String);

pub type GuardrailResult = Result<GuardrailOk, GuardrailRejection>;

/// G1: перед присоединением новых узлов initial_master обязан быть active.
/// `probe` — результат TCP-проверки join-порта: Some(false) означает, что
/// порт недоступен и операция отклоняется; None — проверка не выполнялась.
pub fn check_bootstrap_prerequisite(nodes: &[Node], probe: Option<bool>) -> GuardrailResult {
    let initial_master = nodes
        .iter()
        .find(|n| n.role == NodeRole::InitialMaster && n.status != NodeStatus::Removed);

    let initial_master = match initial_master {
        Some(node) => node,
        None => {
            return Err(GuardrailRejection(
                "No initial master found. Cannot add joining masters or workers until \
                 initial master is created."
                    .to_string(),
            ))
        }
    };

    if initial_master.status != NodeStatus::Active {
        return Err(GuardrailRejection(format!(
            "Initial master '{}' is not active (status: {}). Cannot add nodes until \
             initial master is fully operational.",
            initial_master.hostname,
            status_label(initial_master.status)
        )));
    }

    if probe == Some(false) {
        return Err(GuardrailRejection(format!(
            "Initial master '{}' is active but its join port is not reachable. \
             Verify the control-plane endpoint before adding nodes.",
            initial_master.hostname
        )));
    }

    Ok(GuardrailOk::clean())
}

/// G2: удаление не должно оставить кластер без control-plane или сломать
/// кворум консенсуса. Чётное оставшееся число серверов разрешено,
/// но помечается предупреждением.
pub fn check_safe_removal(
    nodes: &[Node],
    removals: &[NodeInput],
    confirm_master_removal: bool,
) -> GuardrailResult {
    let current_servers: Vec<&Node> = nodes
        .iter()
        .filter(|n| n.role.is_control_plane() && n.status != NodeStatus::Removed)
        .collect();
    let removing_servers = removals
        .iter()
        .filter(|n| n.role == ScaleRole::Server)
        .count();

    if removing_servers == 0 {
        return Ok(GuardrailOk::clean());
    }

    if !confirm_master_removal {
        return Err(GuardrailRejection(
            "Removing control-plane nodes requires explicit confirmation. Add \
             'confirm_master_removal=true' to your request."
                .to_string(),
        ));
    }

    let total = current_servers.len();
    let remaining = total.saturating_sub(removing_servers);

    if remaining < 1 {
        return Err(GuardrailRejection(
            "Cannot remove all control-plane nodes. At least 1 required.".to_string(),
        ));
    }

    // Большинство считается от состава до удаления
    let majority = total / 2 + 1;
    if total > 1 && remaining < majority {
        return Err(GuardrailRejection(format!(
            "Removing {} server(s) would break consensus quorum: {} of {} would remain, \
             need at least {}.",
            removing_servers, remaining, total, majority
        )));
    }

    let warning = if remaining % 2 == 0 {
        Some(format!(
            "{} control-plane node(s) would remain — an even count is not recommended \
             for consensus. Consider adding or removing one more master.",
            remaining
        ))
    } else {
        None
    };

    Ok(GuardrailOk { warning })
}

/// G3: смешанный запрос делится на серверную и агентскую части;
/// оркестратор создаёт только мастер-джобу, воркеры ждут второго вызова
pub fn split_role_additions(additions: &[NodeInput]) -> (Vec<NodeInput>, Vec<NodeInput>) {
    let masters = additions
        .iter()
        .filter(|n| n.role == ScaleRole::Server)
        .cloned()
        .collect();
    let workers = additions
        .iter()
        .filter(|n| n.role == ScaleRole::Agent)
        .cloned()
        .collect();
    (masters, workers)
}

/// G4: ни hostname, ни один из адресов не должен совпадать с живым узлом
/// кластера; дубликаты внутри самого запроса тоже отклоняются
pub fn check_node_identity(existing: &[Node], additions: &[NodeInput]) -> GuardrailResult {
    let mut hostnames: HashSet<&str> = HashSet::new();
    let mut ips: HashSet<&str> = HashSet::new();

    for node in existing.iter().filter(|n| n.status != NodeStatus::Removed) {
        hostnames.insert(node.hostname.as_str());
        ips.insert(node.internal_ip.as_str());
        if let Some(external) = &node.external_ip {
            ips.insert(external.as_str());
        }
    }

    for addition in additions {
        if !hostnames.insert(addition.hostname.as_str()) {
            return Err(GuardrailRejection(format!(
                "Node with hostname '{}' already exists in cluster",
                addition.hostname
            )));
        }
        if !ips.insert(addition.ip.as_str()) {
            return Err(GuardrailRejection(format!(
                "Node with IP '{}' already exists in cluster",
                addition.ip
            )));
        }
        if let Some(external) = &addition.external_ip {
            if !ips.insert(external.as_str()) {
                return Err(GuardrailRejection(format!(
                    "Node with IP '{}' already exists in cluster",
                    external
                )));
            }
        }
    }

    Ok(GuardrailOk::clean())
}

/// Best-effort TCP-проверка join-порта control-plane. Таймаут короткий:
/// проверка не должна задерживать отказ.
pub async fn probe_join_port(api_ip: &str, port: u16) -> bool {
    let addr = format!("{}:{}", api_ip, port);
    match tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(addr.as_str())).await {
        Ok(Ok(_)) => true,
        Ok(Err(err)) => {
            warn!("Join port probe to {} failed: {}", addr, err);
            false
        }
        Err(_) => {
            warn!("Join port probe to {} timed out", addr);
            false
        }
    }
}

fn status_label(status: NodeStatus) -> &'static str {
    match status {
        NodeStatus::Pending => "pending",
        NodeStatus::Installing => "installing",
        NodeStatus::Active => "active",
        NodeStatus::Failed => "failed",
        NodeStatus::Draining => "draining",
        NodeStatus::Removed => "removed",
    }
}
