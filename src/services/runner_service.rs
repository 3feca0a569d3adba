//! Запуск плейбуков и стрим их вывода.
//!
//! Раннер порождает подпроцесс, читает слитый stdout/stderr построчно,
//! публикует каждую строку в шину джобы и дописывает её в персистентный
//! буфер. Секрет учётки существует только как файл 0600 в рабочем каталоге
//! джобы и удаляется на любом пути выхода.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::models::{Credential, CredentialKind};
use crate::services::encryption_service::{prepare_ssh_key, EncryptionService};
use crate::services::event_bus::JobEventBus;
use crate::services::store::Store;

/// Файл с секретом, гарантированно удаляемый при выходе из скоупа
pub struct SecretFile {
    path: PathBuf,
}

impl SecretFile {
    /// Пишет секрет с правами 0600 внутри каталога джобы
    pub fn create(dir: &Path, name: &str, contents: &str) -> Result<Self> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let path = dir.join(name);
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .with_context(|| format!("failed to create secret file {}", path.display()))?;
        file.write_all(contents.as_bytes())?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SecretFile {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove secret file {}: {}", self.path.display(), err);
            }
        }
    }
}

/// Расшифрованная учётка, готовая к передаче подпроцессу через файлы
pub struct PreparedCredential {
    pub username: String,
    key_file: Option<SecretFile>,
    password_file: Option<SecretFile>,
}

impl PreparedCredential {
    pub fn prepare(
        credential: &Credential,
        encryption: &EncryptionService,
        workdir: &Path,
    ) -> Result<Self> {
        let secret = encryption.decrypt(&credential.encrypted_secret)?;
        let (key_file, password_file) = match credential.kind {
            CredentialKind::Key => (
                Some(SecretFile::create(
                    workdir,
                    "ssh_key.pem",
                    &prepare_ssh_key(&secret),
                )?),
                None,
            ),
            CredentialKind::Password => (
                None,
                Some(SecretFile::create(workdir, "ssh_password", &secret)?),
            ),
        };
        Ok(Self {
            username: credential.username.clone(),
            key_file,
            password_file,
        })
    }

    pub fn key_path(&self) -> Option<&Path> {
        self.key_file.as_ref().map(|f| f.path())
    }

    pub fn password_path(&self) -> Option<&Path> {
        self.password_file.as_ref().map(|f| f.path())
    }
}

/// Параметры одного запуска плейбука
pub struct PlaybookRun {
    pub playbook: String,
    pub inventory: PathBuf,
    pub extra_vars: PathBuf,
    pub private_key: Option<PathBuf>,
    pub password_file: Option<PathBuf>,
    /// Дополнительные -e key=value аргументы
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub cancelled: bool,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

fn spawn_line_reader(
    stream: impl AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<String>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

/// Читает файл с удалённого хоста по SSH той же учёткой, которой ходят
/// плейбуки. Используется для забора kubeconfig с initial master.
pub async fn fetch_remote_file(
    config: &Config,
    encryption: &EncryptionService,
    credential: &Credential,
    host_ip: &str,
    remote_path: &str,
) -> Result<String> {
    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("failed to create work dir {}", config.work_dir))?;
    let workdir = tempfile::Builder::new()
        .prefix("fetch-")
        .tempdir_in(&config.work_dir)?;
    let prepared = PreparedCredential::prepare(credential, encryption, workdir.path())?;

    let mut command = Command::new("ssh");
    if let Some(key) = prepared.key_path() {
        command.arg("-i").arg(key);
    }
    command
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("UserKnownHostsFile=/dev/null")
        .arg("-o")
        .arg("ConnectTimeout=10")
        .arg(format!("{}@{}", prepared.username, host_ip))
        .arg(format!("sudo cat {}", remote_path))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(Duration::from_secs(30), command.output())
        .await
        .context("remote fetch timed out")?
        .context("failed to run ssh")?;

    if !output.status.success() {
        anyhow::bail!(
            "fetching {} from {} failed: {}",
            remote_path,
            host_ip,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Запускает плейбук и стримит вывод до завершения подпроцесса.
///
/// Кооперативная отмена: по сигналу токена подпроцесс получает SIGTERM,
/// после grace-периода — SIGKILL. Вывод продолжает вычитываться до конца,
/// чтобы буфер джобы содержал последние строки для диагностики.
pub async fn run_playbook(
    config: &Config,
    store: &Store,
    bus: &JobEventBus,
    job_id: i64,
    run: &PlaybookRun,
    cancel: &CancellationToken,
) -> Result<RunOutcome> {
    let mut command = Command::new(&config.ansible_playbook_bin);
    command
        .arg(&run.playbook)
        .arg("-i")
        .arg(&run.inventory)
        .arg("-e")
        .arg(format!("@{}", run.extra_vars.display()));

    for extra in &run.extra_args {
        command.arg("-e").arg(extra);
    }
    if let Some(key) = &run.private_key {
        command.arg("--private-key").arg(key);
    }
    if let Some(password_file) = &run.password_file {
        command.arg("--connection-password-file").arg(password_file);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", config.ansible_playbook_bin))?;

    info!("Job {}: started playbook {}", job_id, run.playbook);

    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, line_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, line_tx.clone());
    }
    drop(line_tx);

    let grace = Duration::from_secs(config.cancel_grace_secs);
    let mut cancelled = false;
    let mut kill_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            maybe_line = line_rx.recv() => {
                match maybe_line {
                    Some(line) => {
                        bus.publish(&line);
                        let mut chunk = line;
                        chunk.push('\n');
                        store.append_job_output(job_id, &chunk).await?;
                    }
                    // Оба потока закрыты: подпроцесс завершается
                    None => break,
                }
            }
            _ = cancel.cancelled(), if !cancelled => {
                cancelled = true;
                kill_deadline = Some(Instant::now() + grace);
                if let Some(pid) = child.id() {
                    info!("Job {}: sending SIGTERM to playbook process {}", job_id, pid);
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
            }
            _ = tokio::time::sleep_until(kill_deadline.unwrap_or_else(Instant::now)),
                if kill_deadline.is_some() =>
            {
                warn!("Job {}: grace period elapsed, force-killing playbook", job_id);
                child.start_kill().ok();
                kill_deadline = None;
            }
        }
    }

    // Потоки закрыты; сам exit не должен занять заметного времени,
    // но после SIGKILL подстрахуемся таймаутом
    let status = match tokio::time::timeout(Duration::from_secs(30), child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            child.start_kill().ok();
            child.wait().await?
        }
    };

    let outcome = RunOutcome {
        exit_code: status.code(),
        cancelled,
    };
    info!(
        "Job {}: playbook {} finished (exit code {:?}, cancelled: {})",
        job_id, run.playbook, outcome.exit_code, outcome.cancelled
    );
    Ok(outcome)
}
