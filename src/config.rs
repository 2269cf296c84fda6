//! Configuration model — TOML-backed, one struct per recognized section
//! (spec.md §6). Unknown keys are ignored, not errors; every optional
//! section defaults away cleanly when absent from the file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dirs::config_dir;
use indexmap::IndexMap;
use serde::Deserialize;

/// Top-level configuration document.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub version: u32,

    #[serde(default)]
    pub github: Option<GithubConfig>,

    #[serde(default)]
    pub git: GitConfig,

    #[serde(default)]
    pub ssl: SslConfig,

    #[serde(default)]
    pub parallelism: ParallelismConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GithubConfig {
    pub user: String,

    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub archive: GithubArchive,

    #[serde(default)]
    pub clone: GithubClone,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct GithubArchive {
    #[serde(default)]
    pub owned: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GithubClone {
    #[serde(default)]
    pub starred: bool,

    #[serde(default)]
    pub watched: bool,

    #[serde(default = "default_true")]
    pub gists: bool,

    #[serde(default)]
    pub repos: Vec<String>,

    #[serde(default)]
    pub ignore: Vec<String>,
}

impl Default for GithubClone {
    fn default() -> Self {
        Self {
            starred: false,
            watched: false,
            gists: true,
            repos: Vec::new(),
            ignore: Vec::new(),
        }
    }
}

/// `repos` is an `IndexMap` rather than a sorted map because spec.md §4.1's
/// tie-break orders freeform tasks by configuration insertion order, which
/// a sorted map cannot preserve.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct GitConfig {
    #[serde(default)]
    pub repos: IndexMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SslConfig {
    #[serde(default)]
    pub cert_file: Option<String>,

    #[serde(default = "default_true")]
    pub verify_certificates: bool,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            cert_file: None,
            verify_certificates: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ParallelismConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for ParallelismConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

impl Config {
    /// Load and parse a TOML config file from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// The XDG-compliant default config path, used by the CLI when no
    /// explicit `--config` path is given.
    pub fn default_config_path() -> Result<PathBuf> {
        let dir = config_dir().context("failed to resolve user config directory")?;
        Ok(dir.join("gitmirror").join("config.toml"))
    }

    /// Expand `~` and environment variables in path-like fields.
    pub fn expand_paths(&mut self) -> Result<()> {
        if let Some(cert_file) = &self.ssl.cert_file {
            let expanded = shellexpand::full(cert_file)
                .with_context(|| format!("failed to expand ssl.cert_file: {cert_file}"))?;
            self.ssl.cert_file = Some(expanded.into_owned());
        }
        Ok(())
    }

    /// Resolve the worker count per spec.md §5's precedence: explicit
    /// argument override → config `parallelism.workers` → default of 4,
    /// clamped to `[1, 64]`.
    pub fn resolve_worker_count(&self, explicit: Option<usize>) -> usize {
        explicit.unwrap_or(self.parallelism.workers).clamp(1, 64)
    }
}
