//! Git persistence layer
//!
//! Hydrates the virtual root from the configured remote on boot and
//! publishes every write-pipeline commit back to it. All repository access
//! is serialized behind one mutex and performed on blocking threads;
//! libgit2 is not safe under concurrent index writes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use git2::{
    build::RepoBuilder, Cred, ErrorClass, ErrorCode, FetchOptions, IndexEntry, PushOptions,
    RemoteCallbacks, Repository, Signature,
};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, WriteStrategy};
use crate::error::{KernelError, PersistFailure, Result};

/// Push retry policy for non-fast-forward rejections.
const PUSH_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_JITTER_MS: i64 = 25;

/// Stage bits of `IndexEntry.flags` (GIT_INDEX_ENTRY_STAGE).
const INDEX_STAGE_MASK: u16 = 0x3000;

/// What `persist` did with the commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Commit published to the configured branch.
    Pushed,
    /// Commit parked on a working branch; the embedder opens the PR.
    PrRequested { branch: String },
}

pub struct GitStore {
    root: PathBuf,
    remote_url: String,
    branch: String,
    token: String,
    author_name: String,
    author_email: String,
    write_strategy: WriteStrategy,
    op_timeout: Duration,
    lock: Mutex<()>,
}

impl GitStore {
    pub fn from_config(config: &Config, root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            remote_url: config.remote_url(),
            branch: config.git.branch.clone(),
            token: config.git.auth.token.clone(),
            author_name: config.git.auth.user.clone(),
            author_email: config.git.auth.email.clone(),
            write_strategy: config.git.write_strategy,
            op_timeout: Duration::from_millis(config.git.op_timeout_ms),
            lock: Mutex::new(()),
        }
    }

    /// Ensure `<root>/.git` exists and matches the remote branch tip.
    ///
    /// Missing remote branch or unreachable remote is fatal; a local branch
    /// that has diverged is kept as-is and reconciled by the next persist.
    pub async fn hydrate(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let root = self.root.clone();
        let url = self.remote_url.clone();
        let branch = self.branch.clone();
        let token = self.token.clone();

        self.deadline(tokio::task::spawn_blocking(move || {
            if root.join(".git").exists() {
                fetch_fast_forward(&root, &url, &branch, &token)
            } else {
                clone_branch(&root, &url, &branch, &token)
            }
        }))
        .await?
    }

    /// Stage `files`, commit with the configured identity, and publish.
    ///
    /// Direct strategy pushes the branch, recovering from non-fast-forward
    /// rejections by fetching and replaying the commit onto the remote tip,
    /// up to three attempts with exponential backoff. Pr strategy parks the
    /// commit on a fresh `tgp/` branch and pushes only that.
    pub async fn persist(&self, message: &str, files: &[String]) -> Result<PersistOutcome> {
        let _guard = self.lock.lock().await;

        let root = self.root.clone();
        let branch = self.branch.clone();
        let author = (self.author_name.clone(), self.author_email.clone());
        let msg = message.to_string();
        let file_list: Vec<String> = files.to_vec();
        let strategy = self.write_strategy;

        let commit_id = self
            .deadline(tokio::task::spawn_blocking({
                let root = root.clone();
                let branch = branch.clone();
                move || {
                    commit_files(
                        &root,
                        &branch,
                        &author.0,
                        &author.1,
                        &msg,
                        &file_list,
                        strategy,
                    )
                }
            }))
            .await??;

        match strategy {
            WriteStrategy::Pr => {
                let pr_branch = pr_branch_name(commit_id);
                let token = self.token.clone();
                let name = pr_branch.clone();
                self.deadline(tokio::task::spawn_blocking(move || {
                    push_branch(&root, &token, &name, commit_id)
                }))
                .await??;
                info!(branch = %pr_branch, "persist parked commit for PR");
                Ok(PersistOutcome::PrRequested { branch: pr_branch })
            }
            WriteStrategy::Direct => self.push_with_recovery().await,
        }
    }

    async fn push_with_recovery(&self) -> Result<PersistOutcome> {
        let mut last_error = String::new();

        for attempt in 1..=PUSH_ATTEMPTS {
            let root = self.root.clone();
            let branch = self.branch.clone();
            let token = self.token.clone();

            let outcome = self
                .deadline(tokio::task::spawn_blocking(move || {
                    push_current_branch(&root, &token, &branch)
                }))
                .await?;

            match outcome {
                Ok(()) => {
                    debug!(attempt, "push succeeded");
                    return Ok(PersistOutcome::Pushed);
                }
                Err(err) => {
                    if classify(&err) == PersistFailure::Auth {
                        return Err(KernelError::persist_error(
                            PersistFailure::Auth,
                            err.message().to_string(),
                        ));
                    }
                    last_error = err.message().to_string();
                    warn!(attempt, error = %last_error, "push rejected, replaying onto remote tip");
                }
            }

            if attempt == PUSH_ATTEMPTS {
                break;
            }

            let root = self.root.clone();
            let branch = self.branch.clone();
            let token = self.token.clone();
            let author = (self.author_name.clone(), self.author_email.clone());
            self.deadline(tokio::task::spawn_blocking(move || {
                replay_onto_remote(&root, &token, &branch, &author.0, &author.1)
            }))
            .await??;

            tokio::time::sleep(backoff_delay(attempt)).await;
        }

        Err(KernelError::PersistConflict(format!(
            "push to '{}' still rejected after {} attempts: {}",
            self.branch, PUSH_ATTEMPTS, last_error
        )))
    }

    /// Apply the per-call deadline to a blocking git task.
    async fn deadline<T>(&self, task: tokio::task::JoinHandle<T>) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, task).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(join)) => Err(KernelError::persist_error(
                PersistFailure::Repository,
                format!("git worker panicked: {}", join),
            )),
            Err(_) => Err(KernelError::persist_error(
                PersistFailure::Network,
                format!(
                    "git operation exceeded {}ms deadline",
                    self.op_timeout.as_millis()
                ),
            )),
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS * 2u64.pow(attempt - 1);
    let jitter = rand::thread_rng().gen_range(-BACKOFF_JITTER_MS..=BACKOFF_JITTER_MS);
    Duration::from_millis(base.saturating_add_signed(jitter))
}

fn pr_branch_name(commit: git2::Oid) -> String {
    let epoch_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let short: String = commit.to_string().chars().take(8).collect();
    format!("tgp/{}-{}", epoch_ms, short)
}

/// Token-as-username HTTPS auth, per provider PAT conventions.
fn auth_callbacks(token: &str) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, _username_from_url, _allowed| {
        Cred::userpass_plaintext(token, "")
    });
    callbacks
}

fn map_git_err(err: git2::Error) -> KernelError {
    KernelError::persist_error(classify(&err), err.message().to_string())
}

fn classify(err: &git2::Error) -> PersistFailure {
    match err.class() {
        ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssl => {
            if err.code() == ErrorCode::Auth
                || err.message().contains("401")
                || err.message().contains("403")
            {
                PersistFailure::Auth
            } else {
                PersistFailure::Network
            }
        }
        _ if err.code() == ErrorCode::Auth => PersistFailure::Auth,
        _ => PersistFailure::Repository,
    }
}

fn clone_branch(root: &Path, url: &str, branch: &str, token: &str) -> Result<()> {
    info!(%url, %branch, "hydrating by shallow clone");

    let is_empty = std::fs::read_dir(root)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true);

    if is_empty {
        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(auth_callbacks(token));
        // Shallow fetch is an HTTP(S) transport feature; local-path
        // remotes (air-gapped, tests) get a full clone.
        if url.starts_with("https://") {
            fetch_options.depth(1);
        }

        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch_options);
        builder.branch(branch);
        builder.clone(url, root).map_err(map_git_err)?;
        return Ok(());
    }

    // Root already holds scaffolded files; initialize in place instead of
    // cloning into a non-empty directory.
    let repo = Repository::init(root).map_err(map_git_err)?;
    repo.remote("origin", url).map_err(map_git_err)?;
    fetch_branch(&repo, branch, token)?;

    let tip = remote_branch_tip(&repo, branch)?;
    let commit = repo.find_commit(tip).map_err(map_git_err)?;
    repo.branch(branch, &commit, true).map_err(map_git_err)?;
    repo.set_head(&format!("refs/heads/{}", branch))
        .map_err(map_git_err)?;
    repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))
        .map_err(map_git_err)?;
    Ok(())
}

fn fetch_fast_forward(root: &Path, url: &str, branch: &str, token: &str) -> Result<()> {
    let repo = Repository::open(root).map_err(map_git_err)?;

    if repo.find_remote("origin").is_err() {
        repo.remote("origin", url).map_err(map_git_err)?;
    }
    fetch_branch(&repo, branch, token)?;

    let remote_tip = remote_branch_tip(&repo, branch)?;
    let annotated = repo
        .find_annotated_commit(remote_tip)
        .map_err(map_git_err)?;
    let (analysis, _) = repo.merge_analysis(&[&annotated]).map_err(map_git_err)?;

    if analysis.is_up_to_date() {
        debug!(%branch, "already at remote tip");
        return Ok(());
    }

    if analysis.is_fast_forward() || repo.head().is_err() {
        let refname = format!("refs/heads/{}", branch);
        repo.reference(&refname, remote_tip, true, "tgp: fast-forward hydrate")
            .map_err(map_git_err)?;
        repo.set_head(&refname).map_err(map_git_err)?;
        repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))
            .map_err(map_git_err)?;
        info!(%branch, tip = %remote_tip, "fast-forwarded to remote");
        return Ok(());
    }

    // Divergence at boot: a previous persist committed but failed to push.
    // Keep local history; the next persist replays it onto the remote tip.
    warn!(%branch, "local branch diverged from remote; keeping local commits");
    Ok(())
}

fn fetch_branch(repo: &Repository, branch: &str, token: &str) -> Result<()> {
    let mut remote = repo.find_remote("origin").map_err(map_git_err)?;
    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(auth_callbacks(token));
    let refspec = format!("refs/heads/{0}:refs/remotes/origin/{0}", branch);
    remote
        .fetch(&[refspec.as_str()], Some(&mut fetch_options), None)
        .map_err(map_git_err)?;
    Ok(())
}

fn remote_branch_tip(repo: &Repository, branch: &str) -> Result<git2::Oid> {
    repo.refname_to_id(&format!("refs/remotes/origin/{}", branch))
        .map_err(|_| {
            KernelError::persist_error(
                PersistFailure::Repository,
                format!("remote branch '{}' not found", branch),
            )
        })
}

/// Stage the listed files and commit. Direct strategy advances the branch
/// ref; Pr strategy leaves refs untouched and returns a dangling commit id
/// for the working branch.
fn commit_files(
    root: &Path,
    branch: &str,
    author_name: &str,
    author_email: &str,
    message: &str,
    files: &[String],
    strategy: WriteStrategy,
) -> Result<git2::Oid> {
    let repo = Repository::open(root).map_err(map_git_err)?;
    let mut index = repo.index().map_err(map_git_err)?;

    for file in files {
        let rel = Path::new(file);
        if root.join(rel).exists() {
            index.add_path(rel).map_err(map_git_err)?;
        } else {
            // Deleted through the VFS; stage the removal.
            index.remove_path(rel).map_err(map_git_err)?;
        }
    }
    index.write().map_err(map_git_err)?;

    let tree_id = index.write_tree().map_err(map_git_err)?;
    let tree = repo.find_tree(tree_id).map_err(map_git_err)?;

    let parent = repo
        .head()
        .and_then(|head| head.peel_to_commit())
        .map_err(map_git_err)?;
    let signature = Signature::now(author_name, author_email).map_err(map_git_err)?;

    let update_ref = match strategy {
        WriteStrategy::Direct => Some(format!("refs/heads/{}", branch)),
        WriteStrategy::Pr => None,
    };

    let commit_id = repo
        .commit(
            update_ref.as_deref(),
            &signature,
            &signature,
            message,
            &tree,
            &[&parent],
        )
        .map_err(map_git_err)?;

    debug!(commit = %commit_id, %message, "created commit");
    Ok(commit_id)
}

fn push_current_branch(
    root: &Path,
    token: &str,
    branch: &str,
) -> std::result::Result<(), git2::Error> {
    let repo = Repository::open(root)?;
    let mut remote = repo.find_remote("origin")?;

    let mut callbacks = auth_callbacks(token);
    callbacks.push_update_reference(|refname, status| {
        if let Some(msg) = status {
            Err(git2::Error::from_str(&format!(
                "failed to push {}: {}",
                refname, msg
            )))
        } else {
            Ok(())
        }
    });

    let mut push_options = PushOptions::new();
    push_options.remote_callbacks(callbacks);

    let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
    remote.push(&[refspec.as_str()], Some(&mut push_options))
}

fn push_branch(root: &Path, token: &str, branch: &str, commit: git2::Oid) -> Result<()> {
    let repo = Repository::open(root).map_err(map_git_err)?;
    let commit = repo.find_commit(commit).map_err(map_git_err)?;
    repo.branch(branch, &commit, false).map_err(map_git_err)?;

    push_current_branch(root, token, branch).map_err(map_git_err)
}

/// Fetch the remote tip and replay the local head commit onto it, then move
/// the branch to the result. Content conflicts on `meta.json` resolve to
/// the local value (last writer wins at key granularity happens at the
/// registry layer); any other conflicted path aborts the attempt.
fn replay_onto_remote(
    root: &Path,
    token: &str,
    branch: &str,
    author_name: &str,
    author_email: &str,
) -> Result<()> {
    let repo = Repository::open(root).map_err(map_git_err)?;
    fetch_branch(&repo, branch, token)?;

    let remote_tip = remote_branch_tip(&repo, branch)?;
    let local = repo
        .head()
        .and_then(|head| head.peel_to_commit())
        .map_err(map_git_err)?;

    if local.id() == remote_tip {
        return Ok(());
    }

    let remote_commit = repo.find_commit(remote_tip).map_err(map_git_err)?;
    let mut picked = repo
        .cherrypick_commit(&local, &remote_commit, 0, None)
        .map_err(map_git_err)?;

    if picked.has_conflicts() {
        resolve_conflicts_local_wins(&mut picked)?;
    }

    let tree_id = picked.write_tree_to(&repo).map_err(map_git_err)?;
    let tree = repo.find_tree(tree_id).map_err(map_git_err)?;
    let signature = Signature::now(author_name, author_email).map_err(map_git_err)?;
    let message = local.message().unwrap_or("tgp: replayed commit").to_string();

    let replayed = repo
        .commit(None, &signature, &signature, &message, &tree, &[&remote_commit])
        .map_err(map_git_err)?;

    let refname = format!("refs/heads/{}", branch);
    repo.reference(&refname, replayed, true, "tgp: replay onto remote tip")
        .map_err(map_git_err)?;
    repo.set_head(&refname).map_err(map_git_err)?;
    repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))
        .map_err(map_git_err)?;

    info!(commit = %replayed, onto = %remote_tip, "replayed local commit onto remote tip");
    Ok(())
}

/// Resolve index conflicts by taking the local ("their" in a cherry-pick
/// onto the remote) side for `meta.json`; anything else is a real conflict.
fn resolve_conflicts_local_wins(index: &mut git2::Index) -> Result<()> {
    let mut resolutions: Vec<IndexEntry> = Vec::new();
    let mut blocked: Vec<String> = Vec::new();

    for conflict in index.conflicts().map_err(map_git_err)? {
        let conflict = conflict.map_err(map_git_err)?;
        let path_bytes = conflict
            .their
            .as_ref()
            .or(conflict.our.as_ref())
            .or(conflict.ancestor.as_ref())
            .map(|entry| entry.path.clone())
            .unwrap_or_default();
        let path = String::from_utf8_lossy(&path_bytes).to_string();

        match (path.as_str(), conflict.their) {
            ("meta.json", Some(mut theirs)) => {
                theirs.flags &= !INDEX_STAGE_MASK;
                resolutions.push(theirs);
            }
            _ => blocked.push(path),
        }
    }

    if !blocked.is_empty() {
        return Err(KernelError::persist_error(
            PersistFailure::Repository,
            format!("unresolvable conflicts on: {}", blocked.join(", ")),
        ));
    }

    for entry in resolutions {
        let path = String::from_utf8_lossy(&entry.path).to_string();
        index.remove_path(Path::new(&path)).map_err(map_git_err)?;
        index.add(&entry).map_err(map_git_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pr_branch_names_are_prefixed_and_short_sha_suffixed() {
        let oid = git2::Oid::from_str("0123456789abcdef0123456789abcdef01234567")
            .expect("valid oid");
        let name = pr_branch_name(oid);
        assert!(name.starts_with("tgp/"));
        assert!(name.ends_with("-01234567"));
    }

    #[test]
    fn backoff_grows_exponentially_within_jitter() {
        let first = backoff_delay(1).as_millis() as i64;
        let second = backoff_delay(2).as_millis() as i64;
        assert!((first - 200).abs() <= BACKOFF_JITTER_MS);
        assert!((second - 400).abs() <= BACKOFF_JITTER_MS);
    }

    #[test]
    fn classify_distinguishes_network_from_repository() {
        let net = git2::Error::new(ErrorCode::GenericError, ErrorClass::Net, "down");
        assert_eq!(classify(&net), PersistFailure::Network);
        let repo = git2::Error::new(ErrorCode::NotFound, ErrorClass::Reference, "no ref");
        assert_eq!(classify(&repo), PersistFailure::Repository);
        let auth = git2::Error::new(ErrorCode::Auth, ErrorClass::Http, "denied");
        assert_eq!(classify(&auth), PersistFailure::Auth);
    }
}
