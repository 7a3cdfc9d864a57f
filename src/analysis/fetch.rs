//! Repository acquisition.

use async_trait::async_trait;
use git2::build::RepoBuilder;
use git2::{FetchOptions, RemoteCallbacks};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::errors::StageError;

#[async_trait]
pub trait RepoFetcher: Send + Sync {
    /// Clone `url` at `branch` into `dest`, replacing anything already there.
    async fn fetch(&self, url: &str, branch: &str, dest: &Path) -> Result<(), StageError>;
}

pub struct GitFetcher {
    timeout: Duration,
}

impl GitFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// libgit2's local transport cannot do shallow fetches.
fn is_local(url: &str) -> bool {
    url.starts_with("file://") || (!url.contains("://") && !url.contains('@'))
}

fn clone_blocking(url: &str, branch: &str, dest: &Path, deadline: Instant) -> Result<(), git2::Error> {
    let mut callbacks = RemoteCallbacks::new();
    // Returning false aborts the transfer.
    callbacks.transfer_progress(move |_| Instant::now() < deadline);

    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(callbacks);
    fetch_options.download_tags(git2::AutotagOption::None);
    if !is_local(url) {
        fetch_options.depth(1);
    }

    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch_options);
    if !branch.is_empty() {
        builder.branch(branch);
    }
    builder.clone(url, dest)?;
    Ok(())
}

#[async_trait]
impl RepoFetcher for GitFetcher {
    async fn fetch(&self, url: &str, branch: &str, dest: &Path) -> Result<(), StageError> {
        if tokio::fs::try_exists(dest).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(dest)
                .await
                .map_err(|source| StageError::Workspace {
                    path: dest.to_path_buf(),
                    source,
                })?;
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StageError::Workspace {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        tracing::info!(repository = %url, branch = %branch, "cloning repository");
        let deadline = Instant::now() + self.timeout;
        let (url_owned, branch_owned, dest_owned) =
            (url.to_string(), branch.to_string(), dest.to_path_buf());
        let clone = tokio::task::spawn_blocking(move || {
            clone_blocking(&url_owned, &branch_owned, &dest_owned, deadline)
        });

        match tokio::time::timeout(self.timeout, clone).await {
            Ok(Ok(Ok(()))) => {
                tracing::debug!(path = %dest.display(), "clone complete");
                Ok(())
            }
            Ok(Ok(Err(e))) if Instant::now() >= deadline => Err(StageError::Clone(format!(
                "{url} timed out after {}s ({})",
                self.timeout.as_secs(),
                e.message()
            ))),
            Ok(Ok(Err(e))) => Err(StageError::Clone(format!(
                "{url} (branch {branch}): {}",
                e.message()
            ))),
            Ok(Err(join)) => Err(StageError::Clone(format!("clone task failed: {join}"))),
            Err(_) => Err(StageError::Clone(format!(
                "{url} timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use std::fs;
    use tempfile::tempdir;

    fn commit_all(repo: &Repository, msg: &str) {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        let parents = match repo.head() {
            Ok(head) => vec![head.peel_to_commit().unwrap()],
            Err(_) => vec![],
        };
        let parents: Vec<&git2::Commit> = parents.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &parents)
            .unwrap();
    }

    /// Origin with `main` holding docs/index.md and `next` adding docs/next.md.
    fn origin() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let mut opts = git2::RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(dir.path(), &opts).unwrap();
        fs::create_dir_all(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/index.md"), "# Index").unwrap();
        commit_all(&repo, "init");
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("next", &head, false).unwrap();
        repo.set_head("refs/heads/next").unwrap();
        repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))
            .unwrap();
        fs::write(dir.path().join("docs/next.md"), "# Next").unwrap();
        commit_all(&repo, "next");
        dir
    }

    #[test]
    fn test_is_local() {
        assert!(is_local("/tmp/repo"));
        assert!(is_local("file:///tmp/repo"));
        assert!(!is_local("https://github.com/acme/widgets"));
        assert!(!is_local("git@github.com:acme/widgets.git"));
    }

    #[tokio::test]
    async fn test_clones_requested_branch() {
        let origin = origin();
        let work = tempdir().unwrap();
        let dest = work.path().join("job/repo");
        let url = origin.path().to_string_lossy().to_string();

        let fetcher = GitFetcher::new(Duration::from_secs(30));
        fetcher.fetch(&url, "main", &dest).await.unwrap();
        assert!(dest.join("docs/index.md").exists());
        assert!(!dest.join("docs/next.md").exists());

        // re-fetching replaces the previous checkout
        fetcher.fetch(&url, "next", &dest).await.unwrap();
        assert!(dest.join("docs/next.md").exists());
    }

    #[tokio::test]
    async fn test_missing_branch_is_clone_error() {
        let origin = origin();
        let work = tempdir().unwrap();
        let url = origin.path().to_string_lossy().to_string();
        let err = GitFetcher::new(Duration::from_secs(30))
            .fetch(&url, "does-not-exist", &work.path().join("repo"))
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Clone(_)));
    }

    #[tokio::test]
    async fn test_missing_repository_is_clone_error() {
        let work = tempdir().unwrap();
        let url = work.path().join("nothing-here").to_string_lossy().to_string();
        let err = GitFetcher::new(Duration::from_secs(30))
            .fetch(&url, "main", &work.path().join("repo"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nothing-here"));
    }
}
