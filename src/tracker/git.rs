use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::{Repository, ResetType, Signature, Status, StatusOptions};
use std::path::{Path, PathBuf};

use crate::config::STATE_DIR;
use crate::runner::{RevisionRef, VersionControl};

/// Version control over the project's git repository.
///
/// Holds only the path: `git2::Repository` is not `Sync`, so each operation
/// opens the repository inside `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct GitTracker {
    repo_path: PathBuf,
}

impl GitTracker {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            repo_path: project_dir.to_path_buf(),
        }
    }

    fn open(&self) -> Result<Repository> {
        Repository::open(&self.repo_path).with_context(|| {
            format!(
                "Failed to open git repository at {}",
                self.repo_path.display()
            )
        })
    }

    /// Commit every non-ignored file and return the new commit SHA.
    pub fn snapshot(&self, message: &str) -> Result<String> {
        let repo = self.open()?;
        let mut index = repo.index()?;

        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        let sig = repo
            .signature()
            .or_else(|_| Signature::now("gantry", "gantry@localhost"))?;

        // Unborn branch: first commit has no parent
        let parent = Self::head_commit(&repo);
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;

        tracing::debug!(sha = %commit_id, message, "git snapshot committed");
        Ok(commit_id.to_string())
    }

    /// Hard-reset to `sha` and delete untracked files outside the state dir.
    pub fn reset_to(&self, sha: &str) -> Result<()> {
        let repo = self.open()?;
        let oid = git2::Oid::from_str(sha).with_context(|| format!("Invalid revision '{sha}'"))?;
        let commit = repo
            .find_commit(oid)
            .with_context(|| format!("Revision {sha} not found"))?;
        repo.reset(commit.as_object(), ResetType::Hard, None)?;

        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut opts))?;
        let workdir = repo
            .workdir()
            .context("Repository has no working directory")?
            .to_path_buf();

        for entry in statuses.iter() {
            if !entry.status().contains(Status::WT_NEW) {
                continue;
            }
            let Some(rel) = entry.path() else {
                continue;
            };
            if Path::new(rel).starts_with(STATE_DIR) {
                continue;
            }
            let path = workdir.join(rel);
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove untracked file {}", path.display()))?;
        }

        tracing::info!(sha, "workspace reset");
        Ok(())
    }

    fn head_commit(repo: &Repository) -> Option<git2::Commit<'_>> {
        repo.head().ok().and_then(|head| head.peel_to_commit().ok())
    }
}

#[async_trait]
impl VersionControl for GitTracker {
    async fn checkpoint(&self, label: &str) -> Result<RevisionRef> {
        let tracker = self.clone();
        let message = format!("[gantry] checkpoint {label}");
        let sha = tokio::task::spawn_blocking(move || tracker.snapshot(&message))
            .await
            .context("git checkpoint task failed")??;
        Ok(RevisionRef(sha))
    }

    async fn revert(&self, rev: &RevisionRef) -> Result<()> {
        let tracker = self.clone();
        let sha = rev.0.clone();
        tokio::task::spawn_blocking(move || tracker.reset_to(&sha))
            .await
            .context("git revert task failed")?
    }

    async fn commit(&self, message: &str) -> Result<RevisionRef> {
        let tracker = self.clone();
        let message = message.to_string();
        let sha = tokio::task::spawn_blocking(move || tracker.snapshot(&message))
            .await
            .context("git commit task failed")??;
        Ok(RevisionRef(sha))
    }
}
