//! Проверка SSH-доступа до хостов по выбранной учётке.
//!
//! Гоняет check_access.yml через тот же контракт раннера: одноразовый
//! инвентарь, секрет файлом 0600, таймаут на весь прогон. По выводу
//! плейбука для каждого хоста оцениваются три факта: SSH доступен,
//! sudo работает, ОС совместима.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::info;

use crate::config::Config;
use crate::models::{AccessCheckResponse, Credential, HostCheckResult, HostInput};
use crate::services::encryption_service::EncryptionService;
use crate::services::inventory_service::{self, NodeInputHost};
use crate::services::runner_service::PreparedCredential;

pub async fn run_access_check(
    config: &Config,
    encryption: &EncryptionService,
    credential: &Credential,
    hosts: &[HostInput],
) -> Result<AccessCheckResponse> {
    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("failed to create work dir {}", config.work_dir))?;
    let workdir = tempfile::Builder::new()
        .prefix("access-check-")
        .tempdir_in(&config.work_dir)?;

    let prepared = PreparedCredential::prepare(credential, encryption, workdir.path())?;

    let inventory_hosts: Vec<NodeInputHost> = hosts
        .iter()
        .map(|h| NodeInputHost {
            hostname: h.hostname.clone(),
            ip: h.ip.clone(),
        })
        .collect();
    let inventory_content =
        inventory_service::render_for_access_check(&inventory_hosts, &prepared.username);
    let inventory_path = workdir.path().join("inventory.ini");
    std::fs::write(&inventory_path, inventory_content)?;

    let mut command = Command::new(&config.ansible_playbook_bin);
    command
        .arg(config.playbook_path("check_access.yml"))
        .arg("-i")
        .arg(&inventory_path);
    if let Some(key) = prepared.key_path() {
        command.arg("--private-key").arg(key);
    }
    if let Some(password_file) = prepared.password_path() {
        command.arg("--connection-password-file").arg(password_file);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(Duration::from_secs(60), command.output())
        .await
        .context("access check timed out")?
        .context("failed to run access check playbook")?;

    let combined = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    let playbook_ok = output.status.success();
    info!(
        "Access check for credential '{}' over {} host(s): {}",
        credential.name,
        hosts.len(),
        if playbook_ok { "ok" } else { "failed" }
    );

    let results: Vec<HostCheckResult> = hosts
        .iter()
        .map(|host| parse_host_result(&combined, playbook_ok, host))
        .collect();

    let overall_status = if results.iter().all(|r| r.status == "ok") {
        "success"
    } else {
        "failed"
    };

    Ok(AccessCheckResponse {
        overall_status: overall_status.to_string(),
        results,
    })
}

/// Восстанавливает результат по хосту из вывода плейбука
fn parse_host_result(output: &str, playbook_ok: bool, host: &HostInput) -> HostCheckResult {
    let mut ssh_reachable = false;
    let mut sudo_available = false;
    let mut os_compatible = false;
    let mut error: Option<String> = None;

    let mentioned = output.contains(&host.hostname) || output.contains(&host.ip);
    let lower = output.to_lowercase();

    if !mentioned {
        error = Some("Host not processed by the playbook".to_string());
    } else if host_recap_flag(output, &host.hostname, "unreachable")
        || output.contains("UNREACHABLE!")
    {
        error = Some("Host unreachable - check network connectivity".to_string());
    } else if output.contains("Authentication failed") || output.contains("Permission denied") {
        error = Some("SSH authentication failed - verify credentials".to_string());
    } else {
        ssh_reachable = true;

        // Задача whoami под become обязана вернуть root
        if lower.contains("whoami") && (output.contains("root") || output.contains("ok=")) {
            sudo_available = true;
        } else if output.contains("FAILED") && lower.contains("become") {
            error = Some("Sudo not available or password required".to_string());
        } else if playbook_ok && !host_recap_flag(output, &host.hostname, "failed") {
            // Все задачи прошли, включая выполняемые под become
            sudo_available = true;
        }

        // Явная проверка совместимости ОС; без неё считаем ОС пригодной
        if lower.contains("compatible") {
            if lower.contains("success") || lower.contains("ok") {
                os_compatible = true;
            } else {
                error = Some("OS not compatible".to_string());
            }
        } else {
            os_compatible = true;
        }
    }

    let tasks_failed = host_recap_flag(output, &host.hostname, "failed");
    let ok = ssh_reachable && sudo_available && os_compatible && !tasks_failed;

    let error = if ok {
        None
    } else {
        error.or_else(|| {
            Some(format!(
                "Checks: SSH={}, Sudo={}, OS={}",
                ssh_reachable, sudo_available, os_compatible
            ))
        })
    };

    HostCheckResult {
        hostname: host.hostname.clone(),
        ip: host.ip.clone(),
        status: if ok { "ok" } else { "failed" }.to_string(),
        ssh_reachable,
        sudo_available,
        os_compatible,
        error,
    }
}

/// Ищет в PLAY RECAP строку хоста и проверяет счётчик вида `failed=N`
fn host_recap_flag(output: &str, hostname: &str, counter: &str) -> bool {
    for line in output.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with(hostname) {
            continue;
        }
        let needle = format!("{}=", counter);
        if let Some(pos) = trimmed.find(&needle) {
            let rest = &trimmed[pos + needle.len()..];
            let count: u32 = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            if count > 0 {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::{host_recap_flag, parse_host_result};
    use crate::models::HostInput;

    fn host(hostname: &str, ip: &str) -> HostInput {
        HostInput {
            hostname: hostname.to_string(),
            ip: ip.to_string(),
        }
    }

    #[test]
    fn recap_parsing() {
        let recap = "PLAY RECAP *****\n\
            node-1 : ok=3 changed=0 unreachable=0 failed=0\n\
            node-2 : ok=0 changed=0 unreachable=1 failed=0\n";
        assert!(!host_recap_flag(recap, "node-1", "unreachable"));
        assert!(host_recap_flag(recap, "node-2", "unreachable"));
        assert!(!host_recap_flag(recap, "node-2", "failed"));
        assert!(!host_recap_flag(recap, "node-3", "failed"));
    }

    #[test]
    fn clean_run_passes_all_three_checks() {
        let output = "TASK [whoami] *****\n\
            ok: [node-1] => root\n\
            PLAY RECAP *****\n\
            node-1 : ok=3 changed=0 unreachable=0 failed=0\n";
        let result = parse_host_result(output, true, &host("node-1", "10.0.0.1"));
        assert_eq!(result.status, "ok");
        assert!(result.ssh_reachable);
        assert!(result.sudo_available);
        assert!(result.os_compatible);
        assert!(result.error.is_none());
    }

    #[test]
    fn unreachable_host_fails_every_check() {
        let output = "node-1 | UNREACHABLE! => ssh timeout\n\
            PLAY RECAP *****\n\
            node-1 : ok=0 changed=0 unreachable=1 failed=0\n";
        let result = parse_host_result(output, false, &host("node-1", "10.0.0.1"));
        assert_eq!(result.status, "failed");
        assert!(!result.ssh_reachable);
        assert!(!result.sudo_available);
        assert!(!result.os_compatible);
        assert!(result.error.unwrap().contains("unreachable"));
    }

    #[test]
    fn become_failure_marks_sudo_unavailable() {
        let output = "TASK [check access] *****\n\
            FAILED! => Missing sudo password (become)\n\
            fatal: [node-1]: FAILED!\n\
            PLAY RECAP *****\n\
            node-1 : ok=1 changed=0 unreachable=0 failed=1\n";
        let result = parse_host_result(output, false, &host("node-1", "10.0.0.1"));
        assert_eq!(result.status, "failed");
        assert!(result.ssh_reachable);
        assert!(!result.sudo_available);
        assert_eq!(
            result.error.as_deref(),
            Some("Sudo not available or password required")
        );
    }

    #[test]
    fn absent_host_is_reported_unprocessed() {
        let result = parse_host_result("PLAY RECAP *****\n", false, &host("node-9", "10.0.0.9"));
        assert_eq!(result.status, "failed");
        assert_eq!(
            result.error.as_deref(),
            Some("Host not processed by the playbook")
        );
    }
}
