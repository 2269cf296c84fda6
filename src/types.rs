//! Shared data model for the synchronization engine.
//!
//! These types flow between every core component: ForgeClient discovers
//! `RepoRef`s, TaskPlanner turns them into `SyncTask`s, the coordinator
//! drives each through the RetryEngine/GitRunner pair and collects
//! `SyncResult`s into a final `Report`.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// The category that caused a RepoRef to appear in the discovered set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepoCategory {
    Owned,
    Starred,
    Watching,
    Gist,
    ExplicitExtra,
    FreeformGit,
}

/// Identity of a single mirror target.
#[derive(Debug, Clone, Serialize)]
pub struct RepoRef {
    /// Stable, relative path beneath the destination root.
    pub name: String,
    pub remote_url: String,
    pub category: RepoCategory,
    /// Every category that caused this ref to appear, retained for logging.
    pub reasons: BTreeSet<RepoCategory>,
}

impl RepoRef {
    pub fn new(name: impl Into<String>, remote_url: impl Into<String>, category: RepoCategory) -> Self {
        let mut reasons = BTreeSet::new();
        reasons.insert(category);
        Self {
            name: name.into(),
            remote_url: remote_url.into(),
            category,
            reasons,
        }
    }

    /// Merge another occurrence of the same repository into this one.
    ///
    /// Only the `reasons` set changes; `remote_url` and `category` are
    /// assumed to already agree (callers enforce this before merging).
    pub fn merge_reasons(&mut self, other: &RepoRef) {
        self.reasons.extend(other.reasons.iter().copied());
    }
}

/// The operation a GitRunner invocation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Clone,
    Update,
}

/// A RepoRef paired with a resolved destination and credential.
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub repo: RepoRef,
    pub absolute_destination: PathBuf,
    pub credential: Option<CredentialHandle>,
    pub mode: SyncMode,
}

/// Final outcome of a single task.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub name: String,
    pub remote_url: String,
    pub final_status: FinalStatus,
    pub attempts: u32,
    #[serde(with = "duration_secs")]
    pub total_duration: Duration,
    pub final_error_category: Option<ErrorCategory>,
    pub final_error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    Succeeded,
    Failed,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// The closed error taxonomy used to classify a failed git or forge
/// operation and decide retry behavior (spec §4.3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorCategory {
    Http2,
    Network,
    Timeout,
    Auth,
    Ssl,
    Storage,
    Repository,
    Unknown,
}

/// Per-category retry attributes.
#[derive(Debug, Clone, Copy)]
pub struct CategoryAttributes {
    pub retryable: bool,
    pub suggests_http1_fallback: bool,
    pub delay_multiplier: f64,
}

impl ErrorCategory {
    pub fn attributes(self) -> CategoryAttributes {
        match self {
            ErrorCategory::Http2 => CategoryAttributes {
                retryable: true,
                suggests_http1_fallback: true,
                delay_multiplier: 1.0,
            },
            ErrorCategory::Timeout => CategoryAttributes {
                retryable: true,
                suggests_http1_fallback: false,
                delay_multiplier: 1.5,
            },
            ErrorCategory::Network => CategoryAttributes {
                retryable: true,
                suggests_http1_fallback: true,
                delay_multiplier: 2.0,
            },
            ErrorCategory::Auth => CategoryAttributes {
                retryable: false,
                suggests_http1_fallback: false,
                delay_multiplier: 0.0,
            },
            ErrorCategory::Ssl => CategoryAttributes {
                retryable: false,
                suggests_http1_fallback: false,
                delay_multiplier: 0.0,
            },
            ErrorCategory::Storage => CategoryAttributes {
                retryable: false,
                suggests_http1_fallback: false,
                delay_multiplier: 0.0,
            },
            ErrorCategory::Repository => CategoryAttributes {
                retryable: false,
                suggests_http1_fallback: false,
                delay_multiplier: 0.0,
            },
            ErrorCategory::Unknown => CategoryAttributes {
                retryable: true,
                suggests_http1_fallback: false,
                delay_multiplier: 1.0,
            },
        }
    }
}

/// The closed taxonomy surfaced by `perform_sync` (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    ConfigError(String),
    #[error("credential setup error: {0}")]
    AuthSetupError(String),
    #[error("destination error: {0}")]
    DestinationError(String),
    #[error("discovery error: {0}")]
    DiscoveryError(String),
    #[error("{} task(s) failed", .0.failed)]
    PartialFailure(Report),
    #[error("synchronization cancelled")]
    Cancelled,
}

/// An opaque reference to a short-lived on-disk credential file.
#[derive(Debug, Clone)]
pub struct CredentialHandle {
    pub path: PathBuf,
}

/// Aggregate percentile/summary durations over successful tasks.
#[derive(Debug, Clone, Serialize)]
pub struct DurationStats {
    #[serde(with = "duration_secs")]
    pub min: Duration,
    #[serde(with = "duration_secs")]
    pub max: Duration,
    #[serde(with = "duration_secs")]
    pub mean: Duration,
    #[serde(with = "duration_secs")]
    pub p50: Duration,
    #[serde(with = "duration_secs")]
    pub p95: Duration,
    #[serde(with = "duration_secs")]
    pub p99: Duration,
}

/// Aggregate report over a complete `perform_sync` run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub succeeded: usize,
    pub failed: usize,
    #[serde(with = "duration_secs")]
    pub wall_duration: Duration,
    pub duration_stats: Option<DurationStats>,
    pub failures: Vec<SyncResult>,
}

impl Report {
    pub fn from_results(results: Vec<SyncResult>, wall_duration: Duration) -> Self {
        let succeeded = results
            .iter()
            .filter(|r| r.final_status == FinalStatus::Succeeded)
            .count();
        let failed = results.len() - succeeded;

        let mut success_durations: Vec<Duration> = results
            .iter()
            .filter(|r| r.final_status == FinalStatus::Succeeded)
            .map(|r| r.total_duration)
            .collect();
        success_durations.sort();

        let duration_stats = if success_durations.is_empty() {
            None
        } else {
            Some(compute_duration_stats(&success_durations))
        };

        let failures = results
            .into_iter()
            .filter(|r| r.final_status == FinalStatus::Failed)
            .collect();

        Self {
            succeeded,
            failed,
            wall_duration,
            duration_stats,
            failures,
        }
    }
}

fn compute_duration_stats(sorted: &[Duration]) -> DurationStats {
    let percentile = |p: f64| -> Duration {
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    };

    let sum: Duration = sorted.iter().sum();
    let mean = sum / sorted.len() as u32;

    DurationStats {
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        mean,
        p50: percentile(0.50),
        p95: percentile(0.95),
        p99: percentile(0.99),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_ref_merge_unions_reasons() {
        let mut a = RepoRef::new("owner/repo", "https://forge.test/owner/repo.git", RepoCategory::Owned);
        let b = RepoRef::new("owner/repo", "https://forge.test/owner/repo.git", RepoCategory::Starred);
        a.merge_reasons(&b);
        assert_eq!(a.reasons.len(), 2);
        assert!(a.reasons.contains(&RepoCategory::Owned));
        assert!(a.reasons.contains(&RepoCategory::Starred));
    }

    #[test]
    fn error_category_attributes_match_classification_table() {
        let http2 = ErrorCategory::Http2.attributes();
        assert!(http2.retryable);
        assert!(http2.suggests_http1_fallback);

        let auth = ErrorCategory::Auth.attributes();
        assert!(!auth.retryable);

        let network = ErrorCategory::Network.attributes();
        assert_eq!(network.delay_multiplier, 2.0);
    }

    #[test]
    fn report_from_results_splits_success_and_failure() {
        let results = vec![
            SyncResult {
                name: "a".into(),
                remote_url: "https://forge.test/a.git".into(),
                final_status: FinalStatus::Succeeded,
                attempts: 1,
                total_duration: Duration::from_secs(2),
                final_error_category: None,
                final_error_message: None,
            },
            SyncResult {
                name: "b".into(),
                remote_url: "https://forge.test/b.git".into(),
                final_status: FinalStatus::Failed,
                attempts: 6,
                total_duration: Duration::from_secs(90),
                final_error_category: Some(ErrorCategory::Auth),
                final_error_message: Some("authentication failed".into()),
            },
        ];

        let report = Report::from_results(results, Duration::from_secs(100));
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.duration_stats.is_some());
    }

    #[test]
    fn report_with_no_successes_has_no_duration_stats() {
        let results = vec![SyncResult {
            name: "a".into(),
            remote_url: "https://forge.test/a.git".into(),
            final_status: FinalStatus::Failed,
            attempts: 1,
            total_duration: Duration::from_secs(1),
            final_error_category: Some(ErrorCategory::Unknown),
            final_error_message: Some("boom".into()),
        }];
        let report = Report::from_results(results, Duration::from_secs(1));
        assert!(report.duration_stats.is_none());
    }
}
