//! gitmirror — unattended backup agent that mirrors Git repositories as
//! bare clones.
//!
//! The synchronization engine is assembled from six cooperating
//! components, leaves first: [`credential`], [`git_runner`], [`retry`],
//! [`forge`], [`planner`], and [`coordinator`], whose `perform_sync` is the
//! crate's single entry point.
//!
//! ## Modules
//!
//! - [`config`]: TOML-backed configuration model.
//! - [`types`]: shared data model and the closed `SyncError` taxonomy.
//! - [`credential`]: short-lived on-disk credential materialization.
//! - [`git_runner`]: `git` subprocess construction and execution.
//! - [`retry`]: bounded retry loop with error-category-adaptive backoff.
//! - [`forge`]: code-forge GraphQL discovery client.
//! - [`planner`]: merges discovery and config into an ordered task list.
//! - [`coordinator`]: the worker pool and `perform_sync` entry point.

pub mod config;
pub mod coordinator;
pub mod credential;
pub mod forge;
pub mod git_runner;
pub mod planner;
pub mod retry;
pub mod types;

pub use config::Config;
pub use coordinator::{perform_sync, EnvInputs};
pub use credential::{CredentialSource, CredentialVault};
pub use forge::{Discovery, ForgeClient, ForgeError};
pub use git_runner::{GitRunner, RunError, SslOptions};
pub use planner::TaskPlanner;
pub use retry::{CancellationToken, RetryEngine, RetryPolicy};
pub use types::{ErrorCategory, Report, RepoRef, SyncError, SyncResult, SyncTask};
