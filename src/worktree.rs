//! Worktree manager: bare-repo clone/fetch, per-run worktree checkout, and the janitor
//! reconciliation sweep (§4.10).
//!
//! Git plumbing follows the teacher's `tracker::git` module — an `anyhow`-context-wrapped
//! wrapper around `git2::Repository`, each operation pushed onto a blocking thread since
//! `git2` is synchronous. Port bookkeeping and worktree rows live in
//! `crate::store::db_worktrees`; this module only owns the filesystem/git side.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use conductor_common::{ProjectId, RepoId, RunId};
use fs2::FileExt;
use git2::{Cred, FetchOptions, RemoteCallbacks, Repository};

use crate::errors::ConductorError;
use crate::store::StoreHandle;
use crate::store::models::Worktree;

fn credentials_callback(token: String) -> impl Fn(&str, Option<&str>, git2::CredentialType) -> Result<Cred, git2::Error> {
    move |_url, _username, _allowed| Cred::userpass_plaintext("x-access-token", &token)
}

fn fetch_options(installation_token: &str) -> FetchOptions<'_> {
    let mut callbacks = RemoteCallbacks::new();
    let token = installation_token.to_string();
    callbacks.credentials(credentials_callback(token));
    let mut opts = FetchOptions::new();
    opts.remote_callbacks(callbacks);
    opts
}

pub fn bare_repo_path(repo_store_dir: &Path, owner: &str, name: &str) -> PathBuf {
    repo_store_dir.join(owner).join(format!("{name}.git"))
}

/// Idempotent bare-clone-or-fetch into the project's repo store, authenticated with a
/// short-lived installation token (§4.10 `cloneOrFetchRepo`).
pub async fn clone_or_fetch_repo(
    repo_store_dir: PathBuf,
    owner: String,
    name: String,
    installation_token: String,
) -> Result<PathBuf, ConductorError> {
    tokio::task::spawn_blocking(move || -> Result<PathBuf> {
        let path = bare_repo_path(&repo_store_dir, &owner, &name);
        if path.exists() {
            let repo = Repository::open_bare(&path).context("failed to open bare repo store")?;
            let mut remote = repo.find_remote("origin").context("repo store missing origin remote")?;
            remote
                .fetch(&["+refs/heads/*:refs/heads/*"], Some(&mut fetch_options(&installation_token)), None)
                .context("fetch failed")?;
        } else {
            std::fs::create_dir_all(path.parent().unwrap()).context("failed to create repo store directory")?;
            let url = format!("https://github.com/{owner}/{name}.git");
            git2::build::RepoBuilder::new()
                .bare(true)
                .fetch_options(fetch_options(&installation_token))
                .clone(&url, &path)
                .context("bare clone failed")?;
        }
        Ok(path)
    })
    .await
    .map_err(|e| ConductorError::Internal(anyhow::anyhow!("clone_or_fetch_repo task panicked: {e}")))?
    .map_err(ConductorError::Internal)
}

/// Checks out a worktree for `run_id` at `base_commit` on `branch_name`, then records the
/// row and allocates ports in the same logical operation (§4.10 `createWorktree`).
pub async fn create_worktree(
    store: &StoreHandle,
    bare_repo_path: PathBuf,
    worktree_path: PathBuf,
    run_id: RunId,
    project_id: ProjectId,
    repo_id: RepoId,
    branch_name: String,
    base_commit: String,
    port_count: usize,
) -> Result<Worktree, ConductorError> {
    let path_for_git = worktree_path.clone();
    let branch_for_git = branch_name.clone();
    let commit_for_git = base_commit.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let repo = Repository::open_bare(&bare_repo_path).context("failed to open bare repo store")?;
        let oid = git2::Oid::from_str(&commit_for_git).context("invalid base commit sha")?;
        let commit = repo.find_commit(oid).context("base commit not found in repo store")?;
        let reference = repo
            .reference(&format!("refs/heads/{branch_for_git}"), oid, true, "conductor worktree branch")
            .context("failed to create worktree branch ref")?;
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        repo.worktree(&branch_for_git, &path_for_git, Some(&opts)).context("worktree checkout failed")?;
        let _ = commit;
        Ok(())
    })
    .await
    .map_err(|e| ConductorError::Internal(anyhow::anyhow!("create_worktree task panicked: {e}")))?
    .map_err(ConductorError::Internal)?;

    let path_str = worktree_path.to_string_lossy().into_owned();
    store
        .call(move |db| db.create_worktree(&run_id, &project_id, &repo_id, &path_str, &branch_name, &base_commit, port_count))
        .await
        .map_err(crate::runs::downcast_conductor_error)
}

/// Resolves the tip commit of `branch` in the bare repo store, used by the `runs` worker
/// to pick a `base_commit` before checking out a worktree (§4.11 `start`).
pub async fn resolve_branch_head(bare_repo_path: PathBuf, branch: String) -> Result<String, ConductorError> {
    tokio::task::spawn_blocking(move || -> Result<String> {
        let repo = Repository::open_bare(&bare_repo_path).context("failed to open bare repo store")?;
        let reference = repo
            .find_reference(&format!("refs/heads/{branch}"))
            .context("base branch not found in repo store")?;
        let oid = reference.target().context("branch reference has no direct target")?;
        Ok(oid.to_string())
    })
    .await
    .map_err(|e| ConductorError::Internal(anyhow::anyhow!("resolve_branch_head task panicked: {e}")))?
    .map_err(ConductorError::Internal)
}

pub async fn get_worktree_for_run(store: &StoreHandle, run_id: &RunId) -> Result<Option<Worktree>, ConductorError> {
    let run_id = run_id.clone();
    store
        .call(move |db| db.get_active_worktree_for_run(&run_id))
        .await
        .map_err(crate::runs::downcast_conductor_error)
}

/// Best-effort, never-throws teardown (§4.10): the worktree row is marked `cleaned`
/// regardless of whether the filesystem removal succeeds, so a flaky disk never blocks
/// the state machine. Filesystem failures are logged, not surfaced.
pub async fn cleanup_worktree(store: &StoreHandle, run_id: &RunId) -> Result<bool, ConductorError> {
    let Some(worktree) = get_worktree_for_run(store, run_id).await? else {
        return Ok(false);
    };
    let path = PathBuf::from(&worktree.path);
    let removed = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&path)).await;
    match removed {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(worktree_id = %worktree.id, error = %err, "worktree directory removal failed"),
        Err(err) => tracing::warn!(worktree_id = %worktree.id, error = %err, "worktree removal task panicked"),
    }
    let run_id = run_id.clone();
    store
        .call(move |db| db.mark_worktree_cleaned(&run_id))
        .await
        .map_err(crate::runs::downcast_conductor_error)
}

/// Three-part reconciliation sweep (§4.10c): orphan detection, stray-directory removal,
/// and releasing ports held by worktrees that are no longer active.
#[derive(Debug, Default, Clone, Copy)]
pub struct JanitorReport {
    pub orphaned: usize,
    pub stray_dirs_removed: usize,
    pub ports_released: usize,
}

/// Serializes the janitor across worker processes sharing a repo store, via an
/// exclusive `fs2` file lock (§4.10 — "do not let two worker processes run the janitor
/// concurrently over the same repo store"). Returns `None` without running if another
/// process currently holds the lock.
pub async fn run_janitor(store: &StoreHandle, repo_store_dir: PathBuf) -> Result<Option<JanitorReport>, ConductorError> {
    let lock_path = repo_store_dir.join(".janitor.lock");
    let lock_dir = repo_store_dir.clone();
    let lock_file = tokio::task::spawn_blocking(move || -> Result<Option<std::fs::File>> {
        std::fs::create_dir_all(&lock_dir).context("failed to create repo store directory")?;
        let file = std::fs::OpenOptions::new().create(true).write(true).open(&lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(_) => Ok(None),
        }
    })
    .await
    .map_err(|e| ConductorError::Internal(anyhow::anyhow!("janitor lock task panicked: {e}")))?
    .map_err(ConductorError::Internal)?;

    let Some(lock_file) = lock_file else {
        return Ok(None);
    };

    let active = store
        .call(|db| db.list_active_worktrees())
        .await
        .map_err(crate::runs::downcast_conductor_error)?;

    let mut orphaned = 0;
    let mut active_paths = Vec::with_capacity(active.len());
    for worktree in &active {
        let path = PathBuf::from(&worktree.path);
        active_paths.push(path.clone());
        if !path.exists() {
            let id = worktree.id.clone();
            store
                .call(move |db| db.mark_worktree_orphaned(&id))
                .await
                .map_err(crate::runs::downcast_conductor_error)?;
            orphaned += 1;
        }
    }

    let repo_store_dir_for_walk = repo_store_dir.clone();
    let stray_dirs_removed = tokio::task::spawn_blocking(move || -> usize {
        // Active worktree checkouts live at `<projectId>/<repoId>/<runId>` (depth 3);
        // bare mirrors live at `<owner>/<name>.git` (depth 2). Only depth-3 run-leaf
        // directories nested under a `proj_*/repo_*` namespace are candidates for
        // removal — `filter_entry` prunes recursion before it ever descends into an
        // owner directory or a bare repo, so those are never even considered.
        let project_prefix = format!("{}_", ProjectId::PREFIX);
        let repo_prefix = format!("{}_", RepoId::PREFIX);
        let mut removed = 0;
        let walker = walkdir::WalkDir::new(&repo_store_dir_for_walk)
            .min_depth(1)
            .max_depth(3)
            .into_iter()
            .filter_entry(|entry| {
                let depth = entry.depth();
                if depth == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                let Some(name) = entry.file_name().to_str() else { return false };
                match depth {
                    1 => name.starts_with(&project_prefix),
                    2 => name.starts_with(&repo_prefix),
                    _ => true,
                }
            });
        for entry in walker {
            let Ok(entry) = entry else { continue };
            if entry.depth() != 3 || !entry.file_type().is_dir() {
                continue;
            }
            let path = entry.path();
            if active_paths.iter().any(|active| active == path) {
                continue;
            }
            if std::fs::remove_dir_all(path).is_ok() {
                removed += 1;
            }
        }
        removed
    })
    .await
    .map_err(|e| ConductorError::Internal(anyhow::anyhow!("stray directory sweep panicked: {e}")))?;

    let ports_released = store
        .call(|db| db.release_ports_for_inactive_worktrees())
        .await
        .map_err(crate::runs::downcast_conductor_error)?;

    drop(lock_file);
    Ok(Some(JanitorReport { orphaned, stray_dirs_removed, ports_released }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use tempfile::tempdir;

    fn init_bare_with_commit() -> (tempfile::TempDir, String) {
        let dir = tempdir().unwrap();
        let scratch = tempdir().unwrap();
        let scratch_repo = Repository::init(scratch.path()).unwrap();
        std::fs::write(scratch.path().join("a.txt"), "hello").unwrap();
        let mut index = scratch_repo.index().unwrap();
        index.add_path(Path::new("a.txt")).unwrap();
        index.write().unwrap();
        let tree = scratch_repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("conductor", "conductor@localhost").unwrap();
        let commit = scratch_repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[]).unwrap();

        let bare_path = dir.path().join("octocat").join("hello.git");
        std::fs::create_dir_all(bare_path.parent().unwrap()).unwrap();
        Repository::init_bare(&bare_path).unwrap();
        {
            let bare = Repository::open_bare(&bare_path).unwrap();
            let mut remote = bare.remote("origin", scratch.path().to_str().unwrap()).unwrap();
            remote.fetch(&["+refs/heads/*:refs/heads/*"], None, None).unwrap();
        }
        (dir, commit.to_string())
    }

    #[test]
    fn bare_repo_path_nests_under_owner() {
        let root = Path::new("/data/repos");
        let path = bare_repo_path(root, "octocat", "hello");
        assert_eq!(path, root.join("octocat").join("hello.git"));
    }

    #[tokio::test]
    async fn janitor_marks_missing_worktree_dirs_orphaned() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let (repo_dir, base_commit) = init_bare_with_commit();
        let (project_id, repo_id) = store
            .call(|db| {
                let user = db.upsert_user_by_forge_id(1, "octocat", "t")?;
                let project = db.create_project(&user.id, 1, 2, "main", (20000, 20010))?;
                let repo = db.create_repo(&project.id, 3, "node", "octocat", "hello", "main")?;
                Ok((project.id, repo.id))
            })
            .await
            .unwrap();
        let run_id = RunId::new();
        let missing_path = repo_dir.path().join("gone");
        store
            .call({
                let project_id = project_id.clone();
                let repo_id = repo_id.clone();
                let run_id = run_id.clone();
                let path = missing_path.to_string_lossy().into_owned();
                move |db| db.create_worktree(&run_id, &project_id, &repo_id, &path, "br", &base_commit, 1)
            })
            .await
            .unwrap();

        let report = run_janitor(&store, repo_dir.path().to_path_buf()).await.unwrap().unwrap();
        assert_eq!(report.orphaned, 1);
        assert_eq!(report.ports_released, 1);

        let active = store.call(|db| db.list_active_worktrees()).await.unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn janitor_never_removes_bare_repo_or_namespace_directories() {
        let store = StoreHandle::open_in_memory().await.unwrap();
        let (repo_dir, base_commit) = init_bare_with_commit();
        let bare_path = repo_dir.path().join("octocat").join("hello.git");
        assert!(bare_path.exists());

        let (project_id, repo_id) = store
            .call(|db| {
                let user = db.upsert_user_by_forge_id(1, "octocat", "t")?;
                let project = db.create_project(&user.id, 1, 2, "main", (20000, 20010))?;
                let repo = db.create_repo(&project.id, 3, "node", "octocat", "hello", "main")?;
                Ok((project.id, repo.id))
            })
            .await
            .unwrap();
        let run_id = RunId::new();
        let active_path = repo_dir.path().join(project_id.as_str()).join(repo_id.as_str()).join(run_id.as_str());
        std::fs::create_dir_all(&active_path).unwrap();
        store
            .call({
                let project_id = project_id.clone();
                let repo_id = repo_id.clone();
                let run_id = run_id.clone();
                let path = active_path.to_string_lossy().into_owned();
                move |db| db.create_worktree(&run_id, &project_id, &repo_id, &path, "br", &base_commit, 1)
            })
            .await
            .unwrap();

        let report = run_janitor(&store, repo_dir.path().to_path_buf()).await.unwrap().unwrap();
        assert_eq!(report.orphaned, 0);
        assert_eq!(report.stray_dirs_removed, 0);

        assert!(bare_path.exists(), "bare repo mirror must survive the janitor sweep");
        assert!(active_path.exists(), "active worktree checkout must survive the janitor sweep");
    }
}
