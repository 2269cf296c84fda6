//! SyncCoordinator — the top-level `perform_sync` entry point: owns the
//! worker pool, schedules tasks through the RetryEngine/GitRunner pair,
//! and aggregates results into a Report (spec.md §4.1, §5).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::info;

use crate::config::{Config, GithubConfig};
use crate::credential::{CredentialSource, CredentialVault};
use crate::forge::ForgeClient;
use crate::git_runner::{GitRunner, SslOptions};
use crate::planner::{resolve_destination_root, TaskPlanner};
use crate::retry::{AttemptError, CancellationToken, RetryEngine, RetryPolicy};
use crate::types::{ErrorCategory, FinalStatus, Report, RepoCategory, SyncError, SyncMode, SyncResult, SyncTask};

/// Concretizes spec.md §6's abstract environment collaborator contract.
/// The outer CLI binds these to actual environment variable names; the
/// core never touches `std::env` itself.
#[derive(Debug, Clone, Default)]
pub struct EnvInputs {
    pub forge_token_file: Option<PathBuf>,
    pub forge_token_env: Option<String>,
    pub git_operation_timeout: Option<Duration>,
    pub worker_count: Option<usize>,
}

const DEFAULT_GIT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// `PerformSync(config, destinationRoot, dryRun) → Report | Error`.
pub async fn perform_sync(
    config: &Config,
    destination_root: &Path,
    dry_run: bool,
    env: &EnvInputs,
    cancellation: &CancellationToken,
) -> Result<Report, SyncError> {
    let start = Instant::now();

    if config.version != 0 {
        return Err(SyncError::ConfigError(format!(
            "unsupported config version {} (expected 0)",
            config.version
        )));
    }
    if !dry_run && !destination_root.is_dir() {
        return Err(SyncError::DestinationError(format!(
            "destination root {} does not exist or is not a directory",
            destination_root.display()
        )));
    }

    let destination_root = resolve_destination_root(destination_root);

    let resolved_token = match &config.github {
        Some(github) => Some(resolve_forge_token(github, env)?),
        None => None,
    };

    let retry_engine = RetryEngine::new(RetryPolicy::default());
    let discovery = match (&config.github, &resolved_token) {
        (Some(github), Some((token, _source))) => {
            let client = ForgeClient::new(token.clone());
            let result = retry_engine
                .execute("forge discovery", cancellation, |_ctx| {
                    let client = &client;
                    let user = &github.user;
                    async move {
                        client.load_repositories(user).await.map_err(|e| {
                            if let crate::forge::ForgeError::RateLimited { retry_after } = &e {
                                if let Some(delay) = retry_after {
                                    let delay = *delay;
                                    return AttemptError::new(format!(
                                        "forge rate limited, retry-after={}s: {e}",
                                        delay.as_secs()
                                    ));
                                }
                            }
                            AttemptError::new(e.to_string())
                        })
                    }
                })
                .await
                .map_err(|e| SyncError::DiscoveryError(e.to_string()))?;
            Some(result)
        }
        _ => None,
    };

    let planner = TaskPlanner::new(config, &destination_root);
    let mut tasks = planner.plan(discovery.as_ref()).await;

    if dry_run {
        for task in &tasks {
            info!(task = %task.repo.name, command = %describe_command(task), "dry-run");
        }
        let results = tasks
            .into_iter()
            .map(|task| SyncResult {
                name: task.repo.name,
                remote_url: task.repo.remote_url,
                final_status: FinalStatus::Succeeded,
                attempts: 0,
                total_duration: Duration::ZERO,
                final_error_category: None,
                final_error_message: None,
            })
            .collect::<Vec<_>>();
        return Ok(Report::from_results(results, start.elapsed()));
    }

    let needs_credential = tasks.iter().any(|t| t.repo.category != RepoCategory::FreeformGit);
    let needs_gist_credential = tasks.iter().any(|t| t.repo.category == RepoCategory::Gist);
    let vault = if needs_credential {
        let (token, source) = resolved_token
            .ok_or_else(|| SyncError::AuthSetupError("forge tasks present without a resolved token".into()))?;
        let mut entries = vec![(crate::forge::GITHUB_HOST, "x-access-token", token.as_str())];
        if needs_gist_credential {
            entries.push((crate::forge::GIST_HOST, "x-access-token", token.as_str()));
        }
        let vault = CredentialVault::create(&entries, source)
            .map_err(|e| SyncError::AuthSetupError(e.to_string()))?;
        let handle = vault.handle();
        for task in tasks.iter_mut() {
            if task.repo.category != RepoCategory::FreeformGit {
                task.credential = Some(handle.clone());
            }
        }
        Some(vault)
    } else {
        None
    };

    let ssl = SslOptions {
        verify_certificates: config.ssl.verify_certificates,
        cert_file: config.ssl.cert_file.as_ref().map(PathBuf::from),
        cert_dir: None,
    };
    let timeout = env.git_operation_timeout.unwrap_or(DEFAULT_GIT_OPERATION_TIMEOUT);
    let git_runner = Arc::new(GitRunner::new(ssl, timeout));
    let retry_engine = Arc::new(retry_engine);

    let worker_count = config.resolve_worker_count(env.worker_count);
    let semaphore = Arc::new(Semaphore::new(worker_count));

    let mut futures = FuturesUnordered::new();
    for task in tasks {
        let semaphore = semaphore.clone();
        let git_runner = git_runner.clone();
        let retry_engine = retry_engine.clone();
        let cancellation = cancellation.clone();

        futures.push(async move {
            let permit = semaphore.acquire().await;
            if permit.is_err() || cancellation.is_cancelled() {
                return cancelled_result(&task);
            }
            let _permit = permit.unwrap();
            run_task(&task, &retry_engine, &git_runner, &cancellation).await
        });
    }

    let mut results = Vec::new();
    while let Some(result) = futures.next().await {
        results.push(result);
    }

    // Unconditional teardown: the vault's Drop zeroes and removes the
    // credential file even if this function returns early above or the
    // worker loop panics mid-iteration.
    drop(vault);

    let wall_duration = start.elapsed();

    if cancellation.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    let report = Report::from_results(results, wall_duration);
    if report.failed > 0 {
        Err(SyncError::PartialFailure(report))
    } else {
        Ok(report)
    }
}

fn resolve_forge_token(
    github: &GithubConfig,
    env: &EnvInputs,
) -> Result<(String, CredentialSource), SyncError> {
    if let Some(token) = &github.token {
        if !token.is_empty() {
            return Ok((token.clone(), CredentialSource::Inline));
        }
    }
    if let Some(path) = &env.forge_token_file {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                return Ok((trimmed.to_string(), CredentialSource::TokenFile));
            }
        }
    }
    if let Some(token) = &env.forge_token_env {
        if !token.is_empty() {
            return Ok((token.clone(), CredentialSource::Env));
        }
    }
    Err(SyncError::AuthSetupError(
        "no forge token resolvable from config, token file, or environment".into(),
    ))
}

async fn run_task(
    task: &SyncTask,
    retry_engine: &RetryEngine,
    git_runner: &GitRunner,
    cancellation: &CancellationToken,
) -> SyncResult {
    let start = Instant::now();
    let last_attempt = std::cell::Cell::new(0u32);
    let description = format!("sync {}", task.repo.name);

    let during_clone = task.mode == SyncMode::Clone;
    let outcome = retry_engine
        .execute(&description, cancellation, |ctx| {
            last_attempt.set(ctx.attempt);
            let use_http1_fallback = ctx.use_http1_fallback;
            async move {
                git_runner
                    .run(task, use_http1_fallback, cancellation)
                    .await
                    .map_err(|e| {
                        if during_clone {
                            AttemptError::during_clone(e.to_string())
                        } else {
                            AttemptError::new(e.to_string())
                        }
                    })
            }
        })
        .await;

    let total_duration = start.elapsed();

    match outcome {
        Ok(_) => {
            git_runner.preserve_commit_timestamp(&task.absolute_destination).await;
            SyncResult {
                name: task.repo.name.clone(),
                remote_url: task.repo.remote_url.clone(),
                final_status: FinalStatus::Succeeded,
                attempts: last_attempt.get().max(1),
                total_duration,
                final_error_category: None,
                final_error_message: None,
            }
        }
        Err(exhausted) => SyncResult {
            name: task.repo.name.clone(),
            remote_url: task.repo.remote_url.clone(),
            final_status: FinalStatus::Failed,
            attempts: exhausted.attempts,
            total_duration,
            final_error_category: Some(exhausted.final_category),
            final_error_message: Some(exhausted.final_message),
        },
    }
}

fn cancelled_result(task: &SyncTask) -> SyncResult {
    SyncResult {
        name: task.repo.name.clone(),
        remote_url: task.repo.remote_url.clone(),
        final_status: FinalStatus::Failed,
        attempts: 0,
        total_duration: Duration::ZERO,
        final_error_category: Some(ErrorCategory::Unknown),
        final_error_message: Some("cancelled".into()),
    }
}

fn describe_command(task: &SyncTask) -> String {
    match task.mode {
        SyncMode::Clone => {
            let basename = task
                .absolute_destination
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("git clone --mirror {} {}", task.repo.remote_url, basename)
        }
        SyncMode::Update => "git remote update --prune".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RepoRef;
    use tempfile::TempDir;

    #[tokio::test]
    async fn empty_config_yields_empty_report() {
        let config = Config::default();
        let tmp = TempDir::new().unwrap();
        let env = EnvInputs::default();
        let token = CancellationToken::new();

        let report = perform_sync(&config, tmp.path(), false, &env, &token).await.unwrap();
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn rejects_unsupported_config_version() {
        let mut config = Config::default();
        config.version = 1;
        let tmp = TempDir::new().unwrap();
        let env = EnvInputs::default();
        let token = CancellationToken::new();

        let err = perform_sync(&config, tmp.path(), false, &env, &token).await.unwrap_err();
        assert!(matches!(err, SyncError::ConfigError(_)));
    }

    #[tokio::test]
    async fn missing_destination_root_fails_fast_unless_dry_run() {
        let config = Config::default();
        let env = EnvInputs::default();
        let token = CancellationToken::new();
        let missing = PathBuf::from("/nonexistent/path/for/gitmirror/tests");

        let err = perform_sync(&config, &missing, false, &env, &token).await.unwrap_err();
        assert!(matches!(err, SyncError::DestinationError(_)));

        let report = perform_sync(&config, &missing, true, &env, &token).await.unwrap();
        assert_eq!(report.succeeded, 0);
    }

    #[tokio::test]
    async fn dry_run_single_freeform_repo_reports_success_with_zero_duration() {
        let mut config = Config::default();
        config
            .git
            .repos
            .insert("demo".into(), "https://example.test/x.git".into());
        let tmp = TempDir::new().unwrap();
        let env = EnvInputs::default();
        let token = CancellationToken::new();

        let report = perform_sync(&config, tmp.path(), true, &env, &token).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failures.len(), 0);
    }

    #[test]
    fn describe_command_for_clone_matches_construction_order() {
        let task = SyncTask {
            repo: RepoRef::new("demo", "https://example.test/x.git", RepoCategory::FreeformGit),
            absolute_destination: PathBuf::from("/root/git/demo"),
            credential: None,
            mode: SyncMode::Clone,
        };
        assert_eq!(
            describe_command(&task),
            "git clone --mirror https://example.test/x.git demo"
        );
    }
}
