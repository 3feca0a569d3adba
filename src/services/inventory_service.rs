//! Рендер инвентаря и extra-vars из топологии в БД.
//!
//! Инвентарь генерируется на лету для конкретной стадии установки, чтобы
//! плейбук видел только нужные узлы. Файлы живут в рабочем каталоге джобы
//! и удаляются вместе с ним.

use anyhow::{anyhow, Result};
use serde_yaml::{Mapping, Value};

use crate::models::{Cluster, Node, NodeRole, NodeStatus};

/// Стадия, под которую рендерится инвентарь
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    InitialMaster,
    JoiningMasters,
    Workers,
    All,
    ScaleAdd,
}

fn host_line(node: &Node, username: &str, rke2_type: &str, node_role: &str) -> String {
    format!(
        "{} ansible_host={} ansible_user={} rke2_type={} node_role={}",
        node.hostname,
        node.connect_ip(),
        username,
        rke2_type,
        node_role
    )
}

/// Рендерит INI-инвентарь для стадии. Фильтрация строгая: узлы со статусом
/// removed никогда не попадают в инвентарь.
pub fn render_for_stage(
    cluster: &Cluster,
    nodes: &[Node],
    stage: Stage,
    username: &str,
) -> Result<String> {
    let alive: Vec<&Node> = nodes.iter().filter(|n| n.status != NodeStatus::Removed).collect();
    let mut lines = Vec::new();

    match stage {
        Stage::InitialMaster => {
            let initial: Vec<&&Node> = alive
                .iter()
                .filter(|n| n.role == NodeRole::InitialMaster)
                .collect();
            if initial.len() != 1 {
                return Err(anyhow!(
                    "cluster '{}' must have exactly one initial master, found {}",
                    cluster.name,
                    initial.len()
                ));
            }
            lines.push("[initial_master]".to_string());
            for node in initial {
                lines.push(host_line(node, username, "server", "initial_master"));
            }
        }
        Stage::JoiningMasters => {
            lines.push("[joining_masters]".to_string());
            for node in alive.iter().filter(|n| n.role == NodeRole::Master) {
                lines.push(host_line(node, username, "server", "joining_master"));
            }
        }
        Stage::Workers => {
            lines.push("[workers]".to_string());
            for node in alive.iter().filter(|n| n.role == NodeRole::Worker) {
                lines.push(host_line(node, username, "agent", "worker"));
            }
        }
        Stage::All => {
            lines.push("[masters]".to_string());
            for node in alive.iter().filter(|n| n.role.is_control_plane()) {
                let role_var = if node.role == NodeRole::InitialMaster {
                    "initial_master"
                } else {
                    "joining_master"
                };
                lines.push(host_line(node, username, "server", role_var));
            }
            lines.push(String::new());
            lines.push("[workers]".to_string());
            for node in alive.iter().filter(|n| n.role == NodeRole::Worker) {
                lines.push(host_line(node, username, "agent", "worker"));
            }
            lines.push(String::new());
            lines.push("[k8s_cluster:children]".to_string());
            lines.push("masters".to_string());
            lines.push("workers".to_string());
        }
        Stage::ScaleAdd => {
            // Явный список передаётся через render_for_scale_add
            return Err(anyhow!("scale_add requires an explicit node list"));
        }
    }

    Ok(lines.join("\n") + "\n")
}

/// Инвентарь для добавления узлов в работающий кластер. Все server-узлы
/// здесь присоединяющиеся: initial_master уже существует.
pub fn render_for_scale_add(nodes: &[Node], username: &str) -> String {
    let mut lines = vec!["[new_nodes]".to_string()];
    let mut servers = Vec::new();
    let mut agents = Vec::new();

    for node in nodes {
        if node.role.is_control_plane() {
            servers.push(node.hostname.clone());
            lines.push(host_line(node, username, "server", "joining_master"));
        } else {
            agents.push(node.hostname.clone());
            lines.push(host_line(node, username, "agent", "worker"));
        }
    }

    lines.push(String::new());
    lines.push("[new_servers]".to_string());
    lines.extend(servers);
    lines.push(String::new());
    lines.push("[new_agents]".to_string());
    lines.extend(agents);

    lines.join("\n") + "\n"
}

/// Инвентарь для удаления узлов: отдельные группы для серверов и агентов
pub fn render_for_scale_remove(nodes: &[Node], username: &str) -> String {
    let mut lines = vec!["[removed_servers]".to_string()];
    for node in nodes.iter().filter(|n| n.role.is_control_plane()) {
        lines.push(host_line(node, username, "server", "removed"));
    }
    lines.push(String::new());
    lines.push("[removed_agents]".to_string());
    for node in nodes.iter().filter(|n| !n.role.is_control_plane()) {
        lines.push(host_line(node, username, "agent", "removed"));
    }
    lines.join("\n") + "\n"
}

/// Одноразовый инвентарь для проверки SSH-доступа
pub fn render_for_access_check(hosts: &[NodeInputHost], username: &str) -> String {
    let mut lines = vec!["[check_hosts]".to_string()];
    for host in hosts {
        lines.push(format!(
            "{} ansible_host={} ansible_user={}",
            host.hostname, host.ip, username
        ));
    }
    lines.join("\n") + "\n"
}

/// Минимальный хост для access-check (hostname + ip)
pub struct NodeInputHost {
    pub hostname: String,
    pub ip: String,
}

/// Рендерит документ extra-vars (YAML) для стадии.
///
/// Инвариант: вариант для initial_master не содержит поля server_url —
/// первый мастер поднимает консенсус сам и не должен указывать join-адрес
/// на самого себя. Все присоединяющиеся варианты это поле получают.
pub fn render_extra_vars(cluster: &Cluster, stage: Stage) -> Result<String> {
    let mut vars = Mapping::new();

    vars.insert(
        Value::from("rke2_version"),
        Value::from(cluster.version.clone()),
    );
    vars.insert(
        Value::from("rke2_data_dir"),
        Value::from(cluster.data_dir.clone()),
    );
    if let Some(api_ip) = &cluster.api_ip {
        vars.insert(Value::from("rke2_api_ip"), Value::from(api_ip.clone()));
    }
    if let Some(token) = &cluster.token {
        vars.insert(Value::from("rke2_token"), Value::from(token.clone()));
    }
    vars.insert(Value::from("cni"), Value::from(cluster.cni.clone()));
    vars.insert(
        Value::from("custom_registry"),
        Value::from(cluster.custom_registry.clone()),
    );
    vars.insert(
        Value::from("custom_mirror"),
        Value::from(cluster.custom_mirror.clone()),
    );

    if stage != Stage::InitialMaster {
        if let Some(join_url) = cluster.join_url() {
            vars.insert(Value::from("server_url"), Value::from(join_url));
        }
    }

    if let Some(sans) = &cluster.additional_sans {
        vars.insert(
            Value::from("rke2_additional_sans"),
            serde_yaml::to_value(&sans.0)?,
        );
    }

    if cluster.custom_mirror == "active" {
        if let Some(addresses) = &cluster.registry_address {
            vars.insert(
                Value::from("registry_address"),
                serde_yaml::to_value(&addresses.0)?,
            );
            vars.insert(
                Value::from("registry_user"),
                Value::from(cluster.registry_user.clone().unwrap_or_default()),
            );
            vars.insert(
                Value::from("registry_password"),
                Value::from(cluster.registry_password.clone().unwrap_or_default()),
            );
        }
    }

    if let Some(images) = &cluster.image_overrides {
        for (component, image) in &images.0 {
            vars.insert(Value::from(component.clone()), Value::from(image.clone()));
        }
    }

    // cluster_vars перекрывают всё выше
    if let Some(extra) = &cluster.cluster_vars {
        for (key, value) in &extra.0 {
            vars.insert(Value::from(key.clone()), serde_yaml::to_value(value)?);
        }
    }

    Ok(serde_yaml::to_string(&Value::Mapping(vars))?)
}
