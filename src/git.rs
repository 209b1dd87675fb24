//! Publish-stage git operations.
//!
//! Everything goes through libgit2. Credentials are only ever placed in an
//! in-memory anonymous remote; nothing touches `.git/config`.

use std::cell::Cell;
use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{
    Cred, ErrorCode, FetchOptions, IndexAddOption, Oid, PushOptions, RebaseOptions,
    RemoteCallbacks, Repository, Signature, StatusOptions,
};
use serde::{Deserialize, Serialize};

use crate::config::PublishConfig;
use crate::{clog, clog_debug, clog_warn, Error, Result};

/// Username GitHub expects alongside an installation or workflow token.
const TOKEN_USER: &str = "x-access-token";

/// Committer identity used for publish commits and passed to the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(name: &str, email: &str) -> Self {
        Self {
            name: name.to_string(),
            email: email.to_string(),
        }
    }

    pub fn from_config(config: &PublishConfig) -> Self {
        Self::new(&config.author_name, &config.author_email)
    }

    fn signature(&self) -> Result<Signature<'static>> {
        Ok(Signature::now(&self.name, &self.email)?)
    }
}

/// Embed `token` into an HTTP(S) remote URL. Other URLs are returned as-is.
pub fn authenticated_url(url: &str, token: Option<&str>) -> String {
    let Some(token) = token else {
        return url.to_string();
    };
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    if scheme != "https" && scheme != "http" {
        return url.to_string();
    }
    // Drop any userinfo already present.
    let host_and_path = match rest.split_once('/') {
        Some((authority, path)) => {
            let host = authority.rsplit_once('@').map_or(authority, |(_, h)| h);
            format!("{}/{}", host, path)
        }
        None => rest.rsplit_once('@').map_or(rest, |(_, h)| h).to_string(),
    };
    format!("{}://{}:{}@{}", scheme, TOKEN_USER, token, host_and_path)
}

/// Replace the password part of a URL with `***` for logging.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let (authority, path) = match rest.split_once('/') {
        Some((a, p)) => (a, Some(p)),
        None => (rest, None),
    };
    let authority = match authority.rsplit_once('@') {
        Some((userinfo, host)) => match userinfo.split_once(':') {
            Some((user, _)) => format!("{}:***@{}", user, host),
            None => format!("***@{}", host),
        },
        None => authority.to_string(),
    };
    match path {
        Some(p) => format!("{}://{}/{}", scheme, authority, p),
        None => format!("{}://{}", scheme, authority),
    }
}

/// What the publish stage did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    /// Commit created from working-tree changes, if any.
    pub committed: Option<String>,
    /// Head pushed to the remote, if a push happened.
    pub pushed: Option<String>,
    /// Whether local commits were rebased onto the remote first.
    pub rebased: bool,
}

impl PublishOutcome {
    pub fn is_noop(&self) -> bool {
        self.committed.is_none() && self.pushed.is_none()
    }
}

/// Relationship between the local branch and its remote counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    RemoteMissing,
    UpToDate,
    Behind,
    Ahead,
    Diverged,
}

pub struct Publisher {
    repo_path: PathBuf,
    config: PublishConfig,
    identity: Identity,
    push_token: Option<String>,
}

impl Publisher {
    pub fn new(repo_path: &Path, config: &PublishConfig, push_token: Option<&str>) -> Result<Self> {
        clog_debug!("Publisher::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            config: config.clone(),
            identity: Identity::from_config(config),
            push_token: push_token.map(str::to_string),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    /// The branch being published: configured, or the checked-out one.
    pub fn branch(&self) -> Result<String> {
        if let Some(branch) = &self.config.branch {
            return Ok(branch.clone());
        }
        let repo = self.repo()?;
        let head = match repo.head() {
            Ok(head) => head,
            Err(e) if e.code() == ErrorCode::UnbornBranch => {
                // Unborn: HEAD is symbolic to refs/heads/<name>.
                let head_ref = repo.find_reference("HEAD")?;
                let target = head_ref.symbolic_target().unwrap_or("refs/heads/main");
                return Ok(target.trim_start_matches("refs/heads/").to_string());
            }
            Err(e) => return Err(e.into()),
        };
        if !head.is_branch() {
            return Err(Error::Validation(
                "HEAD is detached; set publish.branch".to_string(),
            ));
        }
        head.shorthand()
            .map(str::to_string)
            .ok_or_else(|| Error::Validation("branch name is not valid UTF-8".to_string()))
    }

    /// Whether the working tree differs from HEAD (untracked files count).
    pub fn has_changes(&self) -> Result<bool> {
        let repo = self.repo()?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(!statuses.is_empty())
    }

    /// Stage the whole working tree, deletions included, and commit it.
    ///
    /// Returns `None` when the resulting tree equals HEAD's tree; an empty
    /// commit is never created.
    pub fn commit_all(&self) -> Result<Option<Oid>> {
        let repo = self.repo()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(parent) = &parent {
            if parent.tree_id() == tree_id {
                clog_debug!("commit_all: tree unchanged, no commit");
                return Ok(None);
            }
        } else if index.is_empty() {
            clog_debug!("commit_all: unborn branch and empty index, no commit");
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = self.identity.signature()?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &self.config.message,
            &tree,
            &parents,
        )?;
        clog!("publish: committed {}", commit_id);
        Ok(Some(commit_id))
    }

    fn remote_url(&self, repo: &Repository) -> Result<String> {
        let remote = repo.find_remote(&self.config.remote)?;
        let url = remote.url().ok_or_else(|| {
            Error::Validation(format!("remote '{}' has no valid URL", self.config.remote))
        })?;
        Ok(authenticated_url(url, self.push_token.as_deref()))
    }

    fn callbacks<'a>(&'a self, attempts: &'a Cell<u32>) -> RemoteCallbacks<'a> {
        let mut callbacks = RemoteCallbacks::new();
        if let Some(token) = self.push_token.as_deref() {
            callbacks.credentials(move |_url, username, _allowed| {
                attempts.set(attempts.get() + 1);
                // libgit2 keeps asking while the server says 401.
                if attempts.get() > 1 {
                    return Err(git2::Error::from_str("push credential was rejected"));
                }
                Cred::userpass_plaintext(username.unwrap_or(TOKEN_USER), token)
            });
        }
        callbacks
    }

    /// Fetch `branch` into its tracking ref and return the remote head, or
    /// `None` when the remote has no such branch (a new, empty store).
    fn fetch(&self, repo: &Repository, url: &str, branch: &str) -> Result<Option<Oid>> {
        let refname = format!("refs/heads/{}", branch);
        let tracking = format!("refs/remotes/{}/{}", self.config.remote, branch);

        // A missing remote branch writes no tracking ref, so clear the old one.
        match repo.find_reference(&tracking) {
            Ok(mut reference) => reference.delete()?,
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let attempts = Cell::new(0);
        let mut remote = repo.remote_anonymous(url)?;
        let mut opts = FetchOptions::new();
        opts.remote_callbacks(self.callbacks(&attempts));
        let refspec = format!("{}:{}", refname, tracking);
        remote.fetch(&[refspec.as_str()], Some(&mut opts), Some("cinecron: fetch"))?;

        match repo.find_reference(&tracking) {
            Ok(reference) => {
                let oid = reference.peel_to_commit()?.id();
                clog_debug!("fetched {} at {}", tracking, oid);
                Ok(Some(oid))
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                clog_debug!("fetch: remote has no {}", refname);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn sync_state(repo: &Repository, local: Option<Oid>, remote: Option<Oid>) -> Result<SyncState> {
        let Some(remote) = remote else {
            return Ok(SyncState::RemoteMissing);
        };
        let Some(local) = local else {
            return Ok(SyncState::Behind);
        };
        if local == remote {
            return Ok(SyncState::UpToDate);
        }
        let (ahead, behind) = repo.graph_ahead_behind(local, remote)?;
        Ok(match (ahead, behind) {
            (0, 0) => SyncState::UpToDate,
            (0, _) => SyncState::Behind,
            (_, 0) => SyncState::Ahead,
            _ => SyncState::Diverged,
        })
    }

    fn local_head(repo: &Repository, branch: &str) -> Result<Option<Oid>> {
        match repo.find_reference(&format!("refs/heads/{}", branch)) {
            Ok(reference) => Ok(Some(reference.peel_to_commit()?.id())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn fast_forward(repo: &Repository, branch: &str, oid: Oid) -> Result<()> {
        let refname = format!("refs/heads/{}", branch);
        match repo.find_reference(&refname) {
            Ok(mut reference) => {
                reference.set_target(oid, "cinecron: fast-forward")?;
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                repo.reference(&refname, oid, false, "cinecron: fast-forward")?;
            }
            Err(e) => return Err(e.into()),
        }
        repo.set_head(&refname)?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
        clog_debug!("fast-forwarded {} to {}", branch, oid);
        Ok(())
    }

    /// Replay local commits on top of `upstream`. On any conflict the rebase
    /// is aborted and the branch is left where it was.
    fn rebase_onto(&self, repo: &Repository, branch: &str, upstream: Oid) -> Result<Oid> {
        let reference = repo.find_reference(&format!("refs/heads/{}", branch))?;
        let local = repo.reference_to_annotated_commit(&reference)?;
        let upstream_commit = repo.find_annotated_commit(upstream)?;
        let sig = self.identity.signature()?;

        let mut opts = RebaseOptions::new();
        let mut rebase = repo.rebase(Some(&local), Some(&upstream_commit), None, Some(&mut opts))?;

        let conflict = |detail: String| Error::SyncConflict {
            branch: branch.to_string(),
            detail,
        };

        while let Some(op) = rebase.next() {
            let applying = match op.map(|op| op.id()) {
                Ok(id) => id,
                Err(e) => {
                    rebase.abort()?;
                    return Err(conflict(e.message().to_string()));
                }
            };
            if repo.index()?.has_conflicts() {
                rebase.abort()?;
                return Err(conflict(format!("conflict applying {}", applying)));
            }
            match rebase.commit(None, &sig, None) {
                Ok(_) => {}
                // Patch already upstream; nothing to record.
                Err(e) if e.code() == ErrorCode::Applied => {}
                Err(e) => {
                    rebase.abort()?;
                    return Err(conflict(e.message().to_string()));
                }
            }
        }
        rebase.finish(Some(&sig))?;

        let head = Self::local_head(repo, branch)?
            .ok_or_else(|| conflict("branch vanished during rebase".to_string()))?;
        clog!("publish: rebased {} onto {} -> {}", branch, upstream, head);
        Ok(head)
    }

    fn push(&self, repo: &Repository, url: &str, branch: &str) -> Result<()> {
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        let attempts = Cell::new(0);
        let mut rejection: Option<String> = None;
        {
            let mut callbacks = self.callbacks(&attempts);
            callbacks.push_update_reference(|refname, status| {
                if let Some(msg) = status {
                    rejection = Some(format!("{}: {}", refname, msg));
                }
                Ok(())
            });
            let mut opts = PushOptions::new();
            opts.remote_callbacks(callbacks);
            let mut remote = repo.remote_anonymous(url)?;
            remote
                .push(&[refspec.as_str()], Some(&mut opts))
                .map_err(|e| Error::PushRejected(e.message().to_string()))?;
        }
        if let Some(reason) = rejection {
            return Err(Error::PushRejected(reason));
        }
        Ok(())
    }

    /// Commit, synchronize and push. See the crate docs for the sequence.
    pub fn publish(&self) -> Result<PublishOutcome> {
        let branch = self.branch()?;
        clog!(
            "publish: branch={} author={} <{}>",
            branch,
            self.identity.name,
            self.identity.email
        );

        let committed = self.commit_all()?;
        let repo = self.repo()?;
        let url = self.remote_url(&repo)?;
        clog_debug!("publish: remote {} -> {}", self.config.remote, redact_url(&url));

        let remote_head = self.fetch(&repo, &url, &branch)?;

        let local_head = Self::local_head(&repo, &branch)?;
        let state = Self::sync_state(&repo, local_head, remote_head)?;
        clog_debug!(
            "publish: local={:?} remote={:?} state={:?}",
            local_head,
            remote_head,
            state
        );

        let mut rebased = false;
        let to_push = match (state, remote_head) {
            (SyncState::UpToDate, _) => None,
            (SyncState::Behind, Some(remote)) => {
                Self::fast_forward(&repo, &branch, remote)?;
                None
            }
            (SyncState::Ahead, _) | (SyncState::RemoteMissing, _) => local_head,
            (SyncState::Diverged, Some(remote)) => {
                rebased = true;
                Some(self.rebase_onto(&repo, &branch, remote)?)
            }
            (SyncState::Behind, None) | (SyncState::Diverged, None) => None,
        };

        let pushed = match to_push {
            Some(head) => {
                if let Err(e) = self.push(&repo, &url, &branch) {
                    clog_warn!("publish: push of {} failed; it stays pending locally", head);
                    return Err(e);
                }
                let tracking = format!("refs/remotes/{}/{}", self.config.remote, branch);
                repo.reference(&tracking, head, true, "cinecron: push")?;
                clog!("publish: pushed {} to {}/{}", head, self.config.remote, branch);
                Some(head.to_string())
            }
            None => None,
        };

        Ok(PublishOutcome {
            committed: committed.map(|c| c.to_string()),
            pushed,
            rebased,
        })
    }
}
