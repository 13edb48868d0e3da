//! [`VersionedStore`] over a local git repository.
//!
//! Queries and index/HEAD manipulation go through `git2`. Anything that talks
//! to the remote or rewrites history with user-visible state (fetch, pull
//! --rebase, stash, push) runs the `git` binary, so credential helpers, SSH
//! config and hooks behave exactly as they do for the user.

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use git2::{
    build::CheckoutBuilder, ErrorCode, IndexAddOption, Oid, Repository, RepositoryState,
    ResetType, Signature, Status, StatusOptions,
};
use tracing::{debug, info, instrument, warn};

use super::{CommitId, DiffScope, StashRestore, VersionedStore};
use crate::classify::ChangeSet;
use crate::errors::GitError;

const STASH_REF: &str = "refs/stash";
const FALLBACK_AUTHOR: (&str, &str) = ("autosync", "autosync@localhost");

/// Git-backed source tree.
///
/// The repository is reopened for every call so state written by the `git`
/// binary in between is always observed.
#[derive(Debug, Clone)]
pub struct GitStore {
    root: PathBuf,
    author: Option<(String, String)>,
}

impl GitStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            author: None,
        }
    }

    /// Use this author and committer instead of the repository's git config.
    pub fn with_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author = Some((name.into(), email.into()));
        self
    }

    fn open(&self) -> Result<Repository, GitError> {
        Repository::open(&self.root)
            .map_err(|_| GitError::RepositoryNotFound(self.root.display().to_string()))
    }

    fn oid(id: &CommitId) -> Result<Oid, GitError> {
        Ok(Oid::from_str(id.as_str())?)
    }

    fn signature(&self, repo: &Repository) -> Result<Signature<'static>, GitError> {
        if let Some((name, email)) = &self.author {
            return Ok(Signature::now(name, email)?);
        }
        match repo.signature() {
            Ok(sig) => Ok(sig),
            Err(e) if e.code() == ErrorCode::NotFound => {
                debug!("no user.name/user.email configured, using fallback author");
                Ok(Signature::now(FALLBACK_AUTHOR.0, FALLBACK_AUTHOR.1)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // git CLI
    // -----------------------------------------------------------------------

    fn git_output(&self, args: &[&str]) -> Result<Output, GitError> {
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.root)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(cmd = ?format!("git {}", args.join(" ")), "running git command");
        cmd.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GitError::BinaryNotFound
            } else {
                GitError::IoError(e)
            }
        })
    }

    fn run_git(&self, args: &[&str]) -> Result<String, GitError> {
        let output = self.git_output(args)?;
        if !output.status.success() {
            return Err(command_failed(args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn stash_tip(&self, repo: &Repository) -> Option<Oid> {
        repo.refname_to_id(STASH_REF).ok()
    }
}

fn command_failed(args: &[&str], output: &Output) -> GitError {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let exit_code = output.status.code().unwrap_or(-1);
    let command = args.first().copied().unwrap_or_default().to_string();
    warn!(command = %command, exit_code, %stderr, "git command failed");
    GitError::CommandFailed {
        command,
        exit_code,
        stderr,
    }
}

fn is_missing_remote_ref(err: &GitError) -> bool {
    matches!(err, GitError::CommandFailed { stderr, .. }
        if stderr.contains("couldn't find remote ref"))
}

fn status_matches(status: Status, scope: DiffScope) -> bool {
    match scope {
        DiffScope::Unstaged => status.intersects(
            Status::WT_NEW
                | Status::WT_MODIFIED
                | Status::WT_DELETED
                | Status::WT_RENAMED
                | Status::WT_TYPECHANGE
                | Status::CONFLICTED,
        ),
        DiffScope::Staged => status.intersects(
            Status::INDEX_NEW
                | Status::INDEX_MODIFIED
                | Status::INDEX_DELETED
                | Status::INDEX_RENAMED
                | Status::INDEX_TYPECHANGE,
        ),
    }
}

impl VersionedStore for GitStore {
    fn root(&self) -> &Path {
        &self.root
    }

    fn is_repository(&self) -> bool {
        self.root.is_dir() && self.open().is_ok()
    }

    fn current_commit(&self) -> Result<CommitId, GitError> {
        let repo = self.open()?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                return Err(GitError::RefNotFound("HEAD".into()));
            }
            Err(e) => return Err(e.into()),
        };
        let id = head.peel_to_commit()?.id();
        Ok(id.into())
    }

    fn has_remote(&self, remote: &str) -> Result<bool, GitError> {
        let repo = self.open()?;
        let found = match repo.find_remote(remote) {
            Ok(_) => true,
            Err(e) if matches!(e.code(), ErrorCode::NotFound | ErrorCode::InvalidSpec) => false,
            Err(e) => return Err(e.into()),
        };
        Ok(found)
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    fn fetch(&self, remote: &str, branch: &str) -> Result<CommitId, GitError> {
        let tracking = format!("refs/remotes/{remote}/{branch}");
        let refspec = format!("+refs/heads/{branch}:{tracking}");
        match self.run_git(&["fetch", "--quiet", remote, &refspec]) {
            Ok(_) => {}
            Err(e) if is_missing_remote_ref(&e) => {
                return Err(GitError::RefNotFound(format!("{remote}/{branch}")));
            }
            Err(e) => return Err(e),
        }

        let repo = self.open()?;
        let oid = repo
            .refname_to_id(&tracking)
            .map_err(|_| GitError::RefNotFound(tracking.clone()))?;
        debug!(tracking = %tracking, commit = %oid, "fetch completed");
        Ok(oid.into())
    }

    fn ahead_behind(
        &self,
        local: &CommitId,
        upstream: &CommitId,
    ) -> Result<(usize, usize), GitError> {
        let repo = self.open()?;
        Ok(repo.graph_ahead_behind(Self::oid(local)?, Self::oid(upstream)?)?)
    }

    fn merge_base(&self, a: &CommitId, b: &CommitId) -> Result<Option<CommitId>, GitError> {
        let repo = self.open()?;
        match repo.merge_base(Self::oid(a)?, Self::oid(b)?) {
            Ok(oid) => Ok(Some(oid.into())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn diff_names(&self, scope: DiffScope) -> Result<ChangeSet, GitError> {
        let repo = self.open()?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);

        let statuses = repo.statuses(Some(&mut opts))?;
        let paths: ChangeSet = statuses
            .iter()
            .filter(|entry| status_matches(entry.status(), scope))
            .filter_map(|entry| entry.path().map(str::to_string))
            .collect();
        debug!(?scope, count = paths.len(), "collected changed paths");
        Ok(paths)
    }

    fn diff_between(&self, from: &CommitId, to: &CommitId) -> Result<ChangeSet, GitError> {
        let repo = self.open()?;
        let old_tree = repo.find_commit(Self::oid(from)?)?.tree()?;
        let new_tree = repo.find_commit(Self::oid(to)?)?.tree()?;
        let diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)?;

        let paths = diff
            .deltas()
            .filter_map(|delta| delta.new_file().path().or_else(|| delta.old_file().path()))
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect();
        Ok(paths)
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    fn rebase_pull(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        let args = ["pull", "--rebase", "--autostash", "--quiet", remote, branch];
        let output = self.git_output(&args)?;
        if output.status.success() {
            info!(remote, branch, "rebased onto remote branch");
            return Ok(());
        }

        let err = command_failed(&args, &output);
        if is_missing_remote_ref(&err) {
            return Err(GitError::RefNotFound(format!("{remote}/{branch}")));
        }

        let repo = self.open()?;
        if repo.state() != RepositoryState::Clean {
            warn!(state = ?repo.state(), "aborting unfinished rebase");
            self.run_git(&["rebase", "--abort"])?;
            let detail = match err {
                GitError::CommandFailed { stderr, .. } => stderr,
                other => other.to_string(),
            };
            return Err(GitError::RebaseAborted {
                onto: format!("{remote}/{branch}"),
                detail,
            });
        }
        Err(err)
    }

    fn stash_push(&self, message: &str) -> Result<bool, GitError> {
        let before = self.stash_tip(&self.open()?);
        self.run_git(&["stash", "push", "--include-untracked", "--message", message])?;
        let after = self.stash_tip(&self.open()?);

        let created = after.is_some() && after != before;
        if created {
            info!(message, "stashed local changes");
        }
        Ok(created)
    }

    fn stash_pop(&self) -> Result<StashRestore, GitError> {
        let args = ["stash", "pop"];
        let output = self.git_output(&args)?;
        if output.status.success() {
            info!("restored stashed changes");
            return Ok(StashRestore::Restored);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let detail = [stdout, stderr]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        warn!(%detail, "stash did not apply cleanly, kept in stash list");
        Ok(StashRestore::Conflicted(detail))
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    fn reset_hard(&self, commit: &CommitId) -> Result<(), GitError> {
        let repo = self.open()?;
        let target = repo.find_commit(Self::oid(commit)?)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.reset(target.as_object(), ResetType::Hard, Some(&mut checkout))?;
        info!(commit = %commit.short(), "reset working tree");
        Ok(())
    }

    fn undo_last_commit(&self) -> Result<(), GitError> {
        let repo = self.open()?;
        let head = repo.head()?.peel_to_commit()?;
        let parent = head
            .parent(0)
            .map_err(|_| GitError::RefNotFound(format!("{}^", head.id())))?;
        repo.reset(parent.as_object(), ResetType::Mixed, None)?;
        info!(undone = %head.id(), head = %parent.id(), "undid local commit");
        Ok(())
    }

    fn stage_all(&self) -> Result<(), GitError> {
        let repo = self.open()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        Ok(())
    }

    #[instrument(skip(self, message), fields(root = %self.root.display()))]
    fn commit(&self, message: &str) -> Result<CommitId, GitError> {
        let repo = self.open()?;
        let mut index = repo.index()?;
        let tree = repo.find_tree(index.write_tree()?)?;
        let signature = self.signature(&repo)?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;
        info!(sha = %oid, "created commit");
        Ok(oid.into())
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    fn push(&self, remote: &str, branch: &str) -> Result<(), GitError> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        self.run_git(&["push", "--force", "--quiet", remote, &refspec])?;
        info!(remote, branch, "push completed");
        Ok(())
    }
}
