// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Directory sync: one `<NodeId>.md` file per node, reconciled with the
//! store through a git fetch/merge/push loop.
//!
//! Git runs as a subprocess on purpose: the repository relies on
//! `.gitattributes` (`*.md merge=union`) during merges, which only the real
//! git merge machinery honors. A cycle is:
//!
//! 1. commit local divergence, fetch, merge (union driver absorbs
//!    line-level conflicts; a real merge failure aborts the cycle before
//!    any store write);
//! 2. parse changed node files and fold them into the store — unsynced
//!    local values merge through the conflict primitive, everything else
//!    overwrites;
//! 3. drain the unsynced tables back out as regenerated files;
//! 4. commit and push (push failures wait for the next cycle).

use crate::epoch_secs;
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use trellis_ident::NodeId;
use trellis_merge::{merge_children, merge_content};
use trellis_store::{Client, RwTxn, Store, StoreError};

/// Marker file flagging an encrypted repository.
pub const ENCRYPTION_MARKER_FILE: &str = ".db_encryption_enabled";

/// Lock file guarding the working directory, kept inside `.git` so it never
/// syncs.
const LOCK_FILE: &str = "trellis.lock";

/// Lock acquisition schedule: 5 tries, 10 s apart.
const LOCK_TRIES: u32 = 5;
const LOCK_RETRY: Duration = Duration::from_secs(10);

/// Directory sync failures.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// A git subprocess exited non-zero.
    #[error("git {args}: {output}")]
    Command {
        /// The invoked arguments.
        args: String,
        /// Combined stdout/stderr of the failed command.
        output: String,
    },
    /// `git merge` failed; the cycle aborts and the repository is left for
    /// manual inspection.
    #[error("merging fetched changes failed, inspect the repository: {0}")]
    Merge(String),
    /// The working-directory lock stayed held across every retry.
    #[error(
        "could not acquire the git lock at {} (a previous crash may have left it; \
         verify the repository, then delete the lock file manually)",
        .0.display()
    )]
    LockNotAcquired(PathBuf),
    /// A node file's children section did not parse.
    #[error("invalid node-file children line: {0:?}")]
    InvalidFileChildrenLine(String),
    /// Store layer failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Filesystem failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Content transformation applied to node files at the repository boundary.
///
/// The backend is opaque to the sync engine; the default passes lines
/// through unchanged. An encrypting implementation typically collapses the
/// lines into one ciphertext line and back.
pub trait ContentCipher: Send + Sync {
    /// Store lines → repository lines.
    fn encrypt(&self, lines: &[String]) -> Vec<String>;
    /// Repository lines → store lines.
    fn decrypt(&self, lines: &[String]) -> Result<Vec<String>, GitError>;
}

/// The no-op cipher.
pub struct IdentityCipher;

impl ContentCipher for IdentityCipher {
    fn encrypt(&self, lines: &[String]) -> Vec<String> {
        lines.to_vec()
    }

    fn decrypt(&self, lines: &[String]) -> Result<Vec<String>, GitError> {
        Ok(lines.to_vec())
    }
}

/// Runs one git command in `dir`, returning trimmed combined output.
fn run_git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let result = Command::new("git").args(args).current_dir(dir).output()?;
    let output = format!(
        "{}{}",
        String::from_utf8_lossy(&result.stdout),
        String::from_utf8_lossy(&result.stderr)
    )
    .trim()
    .to_owned();
    if result.status.success() {
        debug!(args = args.join(" "), "git ok");
        Ok(output)
    } else {
        Err(GitError::Command {
            args: args.join(" "),
            output,
        })
    }
}

/// Exclusive session over the working directory: advisory lock plus branch
/// pinning. Dropping the session restores the previous branch (with its
/// stash) and releases the lock.
pub struct GitSession {
    dir: PathBuf,
    lock: File,
    previous_branch: Option<String>,
}

impl GitSession {
    /// Acquires the lock (retrying on contention) and switches to `branch`.
    pub fn acquire(dir: &Path, branch: &str) -> Result<Self, GitError> {
        Self::acquire_with(dir, branch, LOCK_TRIES, LOCK_RETRY)
    }

    /// [`GitSession::acquire`] with an explicit retry schedule.
    pub fn acquire_with(
        dir: &Path,
        branch: &str,
        tries: u32,
        retry: Duration,
    ) -> Result<Self, GitError> {
        let lock_path = dir.join(".git").join(LOCK_FILE);
        let lock = File::create(&lock_path)?;
        let mut acquired = false;
        for attempt in 1..=tries {
            if lock.try_lock_exclusive().is_ok() {
                acquired = true;
                break;
            }
            if attempt < tries {
                std::thread::sleep(retry);
            }
        }
        if !acquired {
            return Err(GitError::LockNotAcquired(lock_path));
        }

        let current = run_git(dir, &["branch", "--show-current"])?;
        let previous_branch = if current == branch {
            None
        } else {
            run_git(dir, &["stash"])?;
            if run_git(dir, &["switch", branch]).is_err() {
                run_git(dir, &["switch", "-c", branch])?;
            }
            Some(current)
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            lock,
            previous_branch,
        })
    }
}

impl Drop for GitSession {
    fn drop(&mut self) {
        if let Some(branch) = self.previous_branch.take() {
            if !branch.is_empty() {
                if let Err(err) = run_git(&self.dir, &["checkout", &branch]) {
                    warn!(?err, "could not restore previous branch");
                }
                if let Err(err) = run_git(&self.dir, &["stash", "pop"]) {
                    debug!(?err, "no stash to restore");
                }
            }
        }
        if let Err(err) = self.lock.unlock() {
            warn!(?err, "git lock release failed");
        }
    }
}

/// The directory sync loop body and its configuration.
pub struct GitSync {
    store: Store,
    dir: PathBuf,
    remote: Option<String>,
    branch: String,
    search_url: String,
    sort_children: bool,
    cipher: Arc<dyn ContentCipher>,
}

impl GitSync {
    /// Creates the loop over `dir`, pushing to `remote` when configured.
    pub fn new(
        store: Store,
        dir: PathBuf,
        remote: Option<String>,
        branch: String,
        sort_children: bool,
    ) -> Self {
        let search_url = remote
            .as_deref()
            .map_or_else(|| "trellis://search?q=".to_owned(), |r| format!("{r}/search?q="));
        Self {
            store,
            dir,
            remote,
            branch,
            search_url,
            sort_children,
            cipher: Arc::new(IdentityCipher),
        }
    }

    /// Replaces the repository content cipher.
    #[must_use]
    pub fn with_cipher(mut self, cipher: Arc<dyn ContentCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    /// Working directory path of one node's file.
    #[must_use]
    pub fn node_path(&self, node: NodeId) -> PathBuf {
        self.dir.join(format!("{node}.md"))
    }

    /// Initializes the repository on first run: init, branch, best-effort
    /// pull, union merge attributes, committer identity.
    pub fn bootstrap(&self, client: &Client) -> Result<(), GitError> {
        fs::create_dir_all(&self.dir)?;
        if run_git(&self.dir, &["rev-parse", "--is-inside-work-tree"]).is_err() {
            run_git(&self.dir, &["init"])?;
            run_git(&self.dir, &["checkout", "-b", &self.branch])?;
        }
        run_git(&self.dir, &["config", "user.name", &client.client_name])?;
        run_git(
            &self.dir,
            &[
                "config",
                "user.email",
                &format!("{}@trellis.client", client.client_id),
            ],
        )?;
        if run_git(&self.dir, &["rev-parse", "HEAD"]).is_err() {
            if let Some(remote) = &self.remote {
                let started = epoch_secs();
                match run_git(&self.dir, &["pull", remote, &self.branch]) {
                    Ok(_) => debug!(secs = epoch_secs() - started, "initial pull"),
                    Err(err) => warn!(?err, "could not pull {remote}:{}", self.branch),
                }
            }
        }
        let attributes = self.dir.join(".gitattributes");
        if !attributes.exists() {
            fs::write(&attributes, "*.md merge=union\n* text=auto eol=lf\n")?;
            run_git(&self.dir, &["add", "-A"])?;
            run_git(&self.dir, &["commit", "-m", "bootstrap"])?;
        }
        Ok(())
    }

    /// One full sync cycle. Returns `true` when remote changes reached the
    /// store (the caller should re-render open buffers).
    pub fn sync(&self) -> Result<bool, GitError> {
        let _session = GitSession::acquire(&self.dir, &self.branch)?;

        let changed_files = self.fetch_from_remote()?;
        let repository_encrypted = self.dir.join(ENCRYPTION_MARKER_FILE).is_file();

        let changed = !changed_files.is_empty();
        self.store.with_write(|txn| {
            if changed {
                self.directory_to_store(txn, &changed_files, repository_encrypted)
                    .map_err(store_boundary)?;
            }
            self.store_to_directory(txn, repository_encrypted)
                .map_err(store_boundary)?;
            Ok(())
        })?;

        self.push_to_remote()?;
        Ok(changed)
    }

    /// Commits local state, fetches, merges, and lists the node files the
    /// merge brought in.
    fn fetch_from_remote(&self) -> Result<Vec<String>, GitError> {
        run_git(&self.dir, &["add", "-A"])?;
        if let Err(err) = run_git(&self.dir, &["commit", "-am", "local changes"]) {
            debug!(?err, "nothing to commit");
        }
        let Some(remote) = &self.remote else {
            return Ok(Vec::new());
        };
        if let Err(err) = run_git(&self.dir, &["fetch", remote, &self.branch]) {
            debug!(?err, "could not fetch");
            return Ok(Vec::new());
        }
        if run_git(
            &self.dir,
            &["merge-base", "--is-ancestor", "FETCH_HEAD", "HEAD"],
        )
        .is_ok()
        {
            return Ok(Vec::new());
        }

        let pre_merge_head = run_git(&self.dir, &["rev-parse", "HEAD"]).ok();
        run_git(
            &self.dir,
            &["merge", "FETCH_HEAD", "--no-edit", "--allow-unrelated-histories"],
        )
        .map_err(|err| GitError::Merge(err.to_string()))?;

        match pre_merge_head {
            Some(head) => {
                let diff = run_git(&self.dir, &["diff", "--name-only", &head, "FETCH_HEAD"])?;
                Ok(diff.lines().map(str::to_owned).collect())
            }
            None => {
                let mut names = Vec::new();
                for entry in fs::read_dir(&self.dir)? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.ends_with(".md") {
                        names.push(name);
                    }
                }
                Ok(names)
            }
        }
    }

    /// Folds changed node files into the store.
    fn directory_to_store(
        &self,
        txn: &mut RwTxn<'_>,
        changed_files: &[String],
        encrypted: bool,
    ) -> Result<(), GitError> {
        let mut pending: Vec<(NodeId, Vec<String>, Vec<NodeId>)> = Vec::new();
        for name in changed_files {
            let relative = Path::new(name);
            if relative.components().count() != 1 {
                continue;
            }
            let path = self.dir.join(relative);
            if !path.is_file() {
                continue;
            }
            let Some(node) = file_name_to_node_id(name) else {
                warn!(name, "ignoring non-node file in sync set");
                continue;
            };
            let text = fs::read_to_string(&path)?;
            let (content, children) =
                parse_node_file(&text, encrypted.then_some(self.cipher.as_ref()))?;
            pending.push((node, content, children));
        }

        for (node, mut content, mut children) in pending {
            if self.store.is_unsynced_children(txn, node)? {
                let local = self.store.valid_descendants(txn, node, false)?;
                children = merge_children(&children, &local);
            }
            self.store.set_descendants(txn, node, &children, false)?;

            if self.store.is_unsynced_content(txn, node)? {
                if let Some(local) = self.store.content_opt(txn, node)? {
                    content = merge_content(&content, &local);
                }
            }
            self.store.set_content(txn, node, &content)?;
        }
        Ok(())
    }

    /// Drains the unsynced tables into regenerated node files. Invalid
    /// nodes lose their file; their parents' files regenerate without them.
    fn store_to_directory(
        &self,
        txn: &mut RwTxn<'_>,
        encrypted: bool,
    ) -> Result<(), GitError> {
        let mut modified: Vec<NodeId> = Vec::new();
        for node in self.store.pop_unsynced_ids(txn)? {
            if self.store.is_valid(txn, node)? {
                modified.push(node);
            } else {
                let path = self.node_path(node);
                if path.exists() {
                    fs::remove_file(&path)?;
                }
                for parent in self.store.valid_descendants(txn, node, true)? {
                    if !modified.contains(&parent) {
                        modified.push(parent);
                    }
                }
            }
        }
        for node in modified {
            let content = self.store.content_or_default(txn, node)?;
            let children = self.store.valid_descendants(txn, node, false)?;
            let lines = node_file_lines(
                &content,
                &children,
                node,
                &self.search_url,
                self.sort_children,
                encrypted.then_some(self.cipher.as_ref()),
            );
            fs::write(self.node_path(node), lines.join("\n") + "\n")?;
        }
        Ok(())
    }

    /// Commits and pushes local changes; push failures are deferred to the
    /// next cycle.
    fn push_to_remote(&self) -> Result<(), GitError> {
        run_git(&self.dir, &["add", "-A"])?;
        if run_git(&self.dir, &["status", "--porcelain"])?.is_empty() {
            return Ok(());
        }
        run_git(&self.dir, &["commit", "-m", "sync"])?;
        if let Some(remote) = &self.remote {
            if let Err(err) = run_git(&self.dir, &["push", "-u", remote, &self.branch]) {
                debug!(?err, "could not push, retrying next cycle");
            }
        }
        Ok(())
    }
}

/// `<uuid>.md` → node id.
fn file_name_to_node_id(name: &str) -> Option<NodeId> {
    let stem = name.strip_suffix(".md")?;
    NodeId::from_str(stem).ok()
}

/// Renders one node's repository file.
///
/// Format: content lines, the backlink separator, a blank line, then one
/// numbered child link per line.
#[must_use]
pub fn node_file_lines(
    content: &[String],
    children: &[NodeId],
    node: NodeId,
    search_url: &str,
    sort_children: bool,
    cipher: Option<&dyn ContentCipher>,
) -> Vec<String> {
    let mut lines = match cipher {
        Some(cipher) => cipher.encrypt(content),
        None => content.to_vec(),
    };
    lines.push(format!(
        "<hr><ol start=0><li><a href='{search_url}{node}+md'>Backlinks</a></li></ol>)"
    ));
    lines.push(String::new());

    let mut ordered: Vec<NodeId> = children.to_vec();
    if sort_children {
        ordered.sort();
    }
    for (index, child) in ordered.iter().enumerate() {
        lines.push(format!("{}. [`{child}`]({child}.md)", index + 1));
    }
    lines
}

/// Parses one node's repository file, bottom-up: child links until the
/// first blank line, the separator line, then content.
pub fn parse_node_file(
    text: &str,
    cipher: Option<&dyn ContentCipher>,
) -> Result<(Vec<String>, Vec<NodeId>), GitError> {
    let mut lines: Vec<String> = text.lines().map(str::to_owned).collect();
    let mut children: Vec<NodeId> = Vec::new();
    while let Some(line) = lines.pop() {
        if line.is_empty() {
            // Blank line ends the children block; the separator above it is
            // dropped too.
            lines.pop();
            break;
        }
        children.push(file_children_line_to_node_id(&line)?);
    }
    children.reverse();

    let content = match cipher {
        Some(cipher) => cipher.decrypt(&lines)?,
        None => lines,
    };
    Ok((content, children))
}

/// Extracts the child id from a `N. [`<id>`](<id>.md)` line.
fn file_children_line_to_node_id(line: &str) -> Result<NodeId, GitError> {
    let invalid = || GitError::InvalidFileChildrenLine(line.to_owned());
    let target_start = line.rfind("](").ok_or_else(invalid)? + 2;
    let target = line
        .get(target_start..)
        .and_then(|t| t.strip_suffix(".md)"))
        .ok_or_else(invalid)?;
    NodeId::from_str(target).map_err(|_| invalid())
}

/// Adapts directory-sync errors to the store's write loop, preserving
/// `MapFull` retry behavior for genuine store errors.
fn store_boundary(err: GitError) -> StoreError {
    match err {
        GitError::Store(inner) => inner,
        other => StoreError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    fn node(tag: u8) -> NodeId {
        NodeId::from_parts(u128::from(tag), [tag; 10])
    }

    #[test]
    fn node_file_round_trips() {
        let (a, b) = (node(1), node(2));
        let content = lines(&["First line", "second line", "", "fourth"]);
        let file = node_file_lines(&content, &[a, b], node(9), "https://e/search?q=", false, None);
        let text = file.join("\n") + "\n";

        let (back_content, back_children) = parse_node_file(&text, None).unwrap();
        assert_eq!(back_content, content);
        assert_eq!(back_children, vec![a, b]);
    }

    #[test]
    fn zero_children_round_trips() {
        let content = lines(&["only content"]);
        let file = node_file_lines(&content, &[], node(9), "https://e/search?q=", false, None);
        let (back_content, back_children) =
            parse_node_file(&(file.join("\n") + "\n"), None).unwrap();
        assert_eq!(back_content, content);
        assert!(back_children.is_empty());
    }

    #[test]
    fn sorted_children_are_a_rendering_choice() {
        let (a, b) = (node(2), node(1));
        let file = node_file_lines(
            &lines(&["x"]),
            &[a, b],
            node(9),
            "https://e/search?q=",
            true,
            None,
        );
        let (_, children) = parse_node_file(&(file.join("\n") + "\n"), None).unwrap();
        assert_eq!(children, vec![b, a], "sorted by id, not insertion");
    }

    #[test]
    fn malformed_children_lines_are_rejected() {
        let text = "content\n<hr>sep)\n\n1. not a link\n";
        assert!(matches!(
            parse_node_file(text, None),
            Err(GitError::InvalidFileChildrenLine(_))
        ));
    }

    #[test]
    fn file_names_gate_node_ids() {
        let id = node(3);
        assert_eq!(file_name_to_node_id(&format!("{id}.md")), Some(id));
        assert_eq!(file_name_to_node_id("README.md"), None);
        assert_eq!(file_name_to_node_id(&id.to_string()), None);
    }
}
