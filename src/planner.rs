//! TaskPlanner — merges forge discovery, explicit extras, ignores, and
//! freeform Git URLs into a deduplicated, ordered `SyncTask` list
//! (spec.md §4.2).

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use path_clean::PathClean;
use tracing::warn;

use crate::config::Config;
use crate::forge::Discovery;
use crate::types::{RepoCategory, RepoRef, SyncMode, SyncTask};

pub struct TaskPlanner<'a> {
    config: &'a Config,
    destination_root: &'a Path,
}

impl<'a> TaskPlanner<'a> {
    pub fn new(config: &'a Config, destination_root: &'a Path) -> Self {
        Self {
            config,
            destination_root,
        }
    }

    /// Build the ordered, deduplicated task list. `discovery` is `None`
    /// when no forge section is configured.
    pub async fn plan(&self, discovery: Option<&Discovery>) -> Vec<SyncTask> {
        let mapping = self.build_mapping(discovery);
        let mapping = self.apply_ignores(mapping);
        let mut tasks = Vec::with_capacity(mapping.len());

        for repo in mapping.into_values() {
            let task = self.resolve_task(repo).await;
            tasks.push(task);
        }

        self.order_tasks(tasks)
    }

    fn build_mapping(&self, discovery: Option<&Discovery>) -> IndexMap<String, RepoRef> {
        let mut mapping: IndexMap<String, RepoRef> = IndexMap::new();

        let mut insert = |name: String, url: String, category: RepoCategory| {
            let entry = RepoRef::new(name.clone(), url, category);
            mapping
                .entry(name)
                .and_modify(|existing| existing.merge_reasons(&entry))
                .or_insert(entry);
        };

        if let (Some(discovery), Some(github)) = (discovery, &self.config.github) {
            let host = crate::forge::GITHUB_HOST;
            for name in &discovery.owned {
                insert(name.clone(), format!("https://{host}/{name}.git"), RepoCategory::Owned);
            }
            if github.clone.starred {
                for name in &discovery.starred {
                    insert(name.clone(), format!("https://{host}/{name}.git"), RepoCategory::Starred);
                }
            }
            if github.clone.watched {
                for name in &discovery.watching {
                    insert(name.clone(), format!("https://{host}/{name}.git"), RepoCategory::Watching);
                }
            }
            if github.clone.gists {
                let gist_host = crate::forge::GIST_HOST;
                for gist_id in &discovery.gists {
                    insert(
                        gist_id.clone(),
                        format!("https://{gist_host}/{gist_id}.git"),
                        RepoCategory::Gist,
                    );
                }
            }
            for name in &github.clone.repos {
                insert(name.clone(), format!("https://{host}/{name}.git"), RepoCategory::ExplicitExtra);
            }
        }

        for (local_name, url) in &self.config.git.repos {
            insert(local_name.clone(), url.clone(), RepoCategory::FreeformGit);
        }

        mapping
    }

    fn apply_ignores(&self, mut mapping: IndexMap<String, RepoRef>) -> IndexMap<String, RepoRef> {
        let Some(github) = &self.config.github else {
            return mapping;
        };

        for ignore in &github.clone.ignore {
            // shift_remove rather than swap_remove: preserves the
            // remaining entries' relative order.
            if mapping.shift_remove(ignore).is_none() {
                warn!(ignore, "ignore entry matched no discovered repository");
            }
        }

        mapping
    }

    async fn resolve_task(&self, repo: RepoRef) -> SyncTask {
        let absolute_destination = match repo.category {
            RepoCategory::Gist => self
                .destination_root
                .join("github")
                .join("gists")
                .join(&repo.name),
            RepoCategory::FreeformGit => self.destination_root.join("git").join(&repo.name),
            _ => self.destination_root.join("github").join("clone").join(&repo.name),
        };

        let mode = destination_mode(&absolute_destination);

        SyncTask {
            repo,
            absolute_destination,
            credential: None,
            mode,
        }
    }

    /// Freeform tasks sort before forge tasks but keep their relative
    /// (configuration-insertion) order among themselves, since `sort_by`
    /// is stable and `build_mapping` preserves that order via `IndexMap`.
    /// Forge tasks among themselves are ordered alphabetically.
    fn order_tasks(&self, mut tasks: Vec<SyncTask>) -> Vec<SyncTask> {
        tasks.sort_by(|a, b| {
            let a_freeform = a.repo.category == RepoCategory::FreeformGit;
            let b_freeform = b.repo.category == RepoCategory::FreeformGit;
            match (a_freeform, b_freeform) {
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                (true, true) => std::cmp::Ordering::Equal,
                (false, false) => a.repo.name.to_lowercase().cmp(&b.repo.name.to_lowercase()),
            }
        });
        tasks
    }
}

fn destination_mode(destination: &Path) -> SyncMode {
    let head = destination.join("HEAD");
    if destination.is_dir() && head.exists() {
        SyncMode::Update
    } else {
        SyncMode::Clone
    }
}

/// Resolve the destination root to an absolute, canonical-ish path.
pub fn resolve_destination_root(root: &Path) -> PathBuf {
    root.clean()
}
