use git2::{DiffFormat, DiffOptions, Oid, Repository, Status, StatusOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{GitError, GitSnapshot, Probe};

/// Read-only view of the repository enclosing a local path.
///
/// Every query is independent and best-effort: failures come back as
/// [`Probe::Failed`] or [`Probe::NotApplicable`], never as errors. Only
/// locating the repository itself is fatal.
pub struct GitInspector {
    repo: Repository,
}

impl GitInspector {
    /// Locate the repository containing `path`, searching parent directories.
    ///
    /// # Errors
    /// Returns [`GitError::NotARepository`] if no repository encloses `path`.
    pub fn discover(path: &Path) -> Result<Self, GitError> {
        let repo = Repository::discover(path).map_err(|e| {
            debug!("discover {}: {}", path.display(), e.message());
            GitError::NotARepository {
                path: path.to_path_buf(),
            }
        })?;
        Ok(Self { repo })
    }

    /// Top-level work directory, `None` for bare repositories.
    pub fn root(&self) -> Option<&Path> {
        self.repo.workdir()
    }

    /// URL configured for the named remote.
    pub fn remote_url(&self, remote: &str) -> Probe<String> {
        let res = self.repo.find_remote(remote).and_then(|r| {
            r.url()
                .map(str::to_string)
                .ok_or_else(|| git2::Error::from_str("remote url is not valid utf-8"))
        });
        Probe::from_git("remote_url", res)
    }

    /// Whether tracked files differ from HEAD, in the index or the worktree.
    /// Untracked files do not count.
    pub fn is_dirty(&self) -> Probe<bool> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(false)
            .include_ignored(false)
            .include_unmodified(false);
        let res = self.repo.statuses(Some(&mut opts)).map(|statuses| {
            statuses
                .iter()
                .any(|e| !e.status().is_empty() && e.status() != Status::IGNORED)
        });
        Probe::from_git("is_dirty", res)
    }

    /// Short name of the checked-out branch; detached HEAD is not applicable.
    pub fn current_branch(&self) -> Probe<String> {
        let head = match self.repo.head() {
            Ok(h) => h,
            Err(e) => return Probe::from_git("current_branch", Err(e)),
        };
        if !head.is_branch() {
            return Probe::NotApplicable;
        }
        match head.shorthand() {
            Some(name) => Probe::Value(name.to_string()),
            None => Probe::Failed("branch name is not valid utf-8".into()),
        }
    }

    /// Full hash of the commit HEAD points at.
    pub fn current_commit(&self) -> Probe<String> {
        let res = self
            .repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .map(|c| c.id().to_string());
        Probe::from_git("current_commit", res)
    }

    /// Expand any revision (short hash, ref name) to a full commit hash.
    pub fn resolve_commit(&self, rev: &str) -> Probe<String> {
        let res = self
            .repo
            .revparse_single(rev)
            .and_then(|o| o.peel_to_commit())
            .map(|c| c.id().to_string());
        Probe::from_git("resolve_commit", res)
    }

    /// Tip of `branch` as last seen on `remote` (`refs/remotes/<remote>/<branch>`).
    /// With `branch = None` the current branch is used.
    pub fn remote_tip(&self, remote: &str, branch: Option<&str>) -> Probe<String> {
        let branch = match branch {
            Some(b) => b.to_string(),
            None => match self.current_branch() {
                Probe::Value(b) => b,
                Probe::NotApplicable => return Probe::NotApplicable,
                Probe::Failed(e) => return Probe::Failed(e),
            },
        };
        let res = self
            .repo
            .find_reference(&format!("refs/remotes/{}/{}", remote, branch))
            .and_then(|r| r.peel_to_commit())
            .map(|c| c.id().to_string());
        Probe::from_git("remote_tip", res)
    }

    /// Patch between `base` and the working tree (index included), in the
    /// format `git apply` consumes. File contents are kept byte for byte.
    ///
    /// Without an explicit `base` the remote tracking branch of the current
    /// branch on `remote` is used.
    pub fn diff(&self, base: Option<&str>, remote: &str) -> Probe<Vec<u8>> {
        let base = match base {
            Some(b) => b.to_string(),
            None => match self.remote_tip(remote, None) {
                Probe::Value(tip) => tip,
                Probe::NotApplicable => return Probe::NotApplicable,
                Probe::Failed(e) => return Probe::Failed(e),
            },
        };
        Probe::from_git("diff", self.patch_against(&base))
    }

    fn patch_against(&self, base: &str) -> Result<Vec<u8>, git2::Error> {
        let commit = self.repo.revparse_single(base)?.peel_to_commit()?;
        let tree = commit.tree()?;
        let mut opts = DiffOptions::new();
        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&tree), Some(&mut opts))?;

        let mut out = Vec::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            if let origin @ ('+' | '-' | ' ') = line.origin() {
                out.push(origin as u8);
            }
            out.extend_from_slice(line.content());
            true
        })?;
        Ok(out)
    }

    /// Whether `branch` is among the refs tracked for `remote`.
    pub fn branch_on_remote(&self, remote: &str, branch: &str) -> Probe<bool> {
        if self.repo.find_remote(remote).is_err() {
            return Probe::NotApplicable;
        }
        let wanted = format!("refs/remotes/{}/{}", remote, branch);
        let res = self
            .repo
            .references_glob(&format!("refs/remotes/{}/*", remote))
            .map(|refs| refs.flatten().any(|r| r.name() == Some(wanted.as_str())));
        Probe::from_git("branch_on_remote", res)
    }

    /// Whether `commit` is the tip of, or an ancestor of, any ref under
    /// `refs/remotes/<remote>/`.
    pub fn commit_on_remote(&self, remote: &str, commit: &str) -> Probe<bool> {
        let oid = match Oid::from_str(commit) {
            Ok(o) => o,
            Err(e) => return Probe::from_git("commit_on_remote", Err(e)),
        };
        Probe::from_git("commit_on_remote", self.reachable_from_remote(remote, oid))
    }

    fn reachable_from_remote(&self, remote: &str, oid: Oid) -> Result<bool, git2::Error> {
        for reference in self
            .repo
            .references_glob(&format!("refs/remotes/{}/*", remote))?
        {
            let tip = match reference.and_then(|r| r.peel_to_commit()) {
                Ok(c) => c.id(),
                Err(_) => continue,
            };
            if tip == oid || self.repo.graph_descendant_of(tip, oid)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// `path` relative to the top-level work directory.
    pub fn relative_to_root(&self, path: &Path) -> Probe<PathBuf> {
        let Some(root) = self.root() else {
            return Probe::NotApplicable;
        };
        let canon = |p: &Path| p.canonicalize().map_err(|e| e.to_string());
        match (canon(root), canon(path)) {
            (Ok(root), Ok(path)) => match path.strip_prefix(&root) {
                Ok(rel) => Probe::Value(rel.to_path_buf()),
                Err(_) => Probe::NotApplicable,
            },
            (Err(e), _) | (_, Err(e)) => Probe::Failed(e),
        }
    }

    /// Gather the git-derived facts used as defaults for a submission.
    /// Always computed from the live repository.
    pub fn snapshot(&self, remote: &str) -> GitSnapshot {
        GitSnapshot {
            remote_url: self.remote_url(remote),
            branch: self.current_branch(),
            commit: self.current_commit(),
            dirty: self.is_dirty().value_or(false),
            diff: self.diff(None, remote),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::fixture::{Fixture, REMOTE_URL};
    use std::fs;

    fn inspector(fx: &Fixture) -> GitInspector {
        GitInspector::discover(fx.path()).unwrap()
    }

    #[test]
    fn discover_searches_parent_directories() {
        let fx = Fixture::pushed();
        fx.write("pkg/sub/model.py", "x = 1\n");
        let gi = GitInspector::discover(&fx.path().join("pkg/sub")).unwrap();
        assert_eq!(
            gi.relative_to_root(&fx.path().join("pkg/sub")),
            Probe::Value(PathBuf::from("pkg/sub"))
        );
    }

    #[test]
    fn discover_fails_outside_a_repository() {
        let td = tempfile::tempdir().unwrap();
        let err = GitInspector::discover(td.path()).err().unwrap();
        assert!(matches!(err, GitError::NotARepository { .. }));
    }

    #[test]
    fn remote_url_and_unknown_remote() {
        let fx = Fixture::pushed();
        let gi = inspector(&fx);
        assert_eq!(gi.remote_url("origin"), Probe::Value(REMOTE_URL.to_string()));
        assert_eq!(gi.remote_url("upstream"), Probe::NotApplicable);
    }

    #[test]
    fn branch_and_commit_follow_head() {
        let fx = Fixture::pushed();
        let gi = inspector(&fx);
        let head = fx.repo.head().unwrap().peel_to_commit().unwrap().id();
        assert_eq!(gi.current_branch(), Probe::Value("main".to_string()));
        assert_eq!(gi.current_commit(), Probe::Value(head.to_string()));
        assert_eq!(gi.remote_tip("origin", None), Probe::Value(head.to_string()));

        fx.repo.set_head_detached(head).unwrap();
        assert_eq!(gi.current_branch(), Probe::NotApplicable);
    }

    #[test]
    fn dirty_ignores_untracked_files() {
        let fx = Fixture::pushed();
        let gi = inspector(&fx);
        assert_eq!(gi.is_dirty(), Probe::Value(false));

        fx.write("scratch.txt", "untracked\n");
        assert_eq!(gi.is_dirty(), Probe::Value(false));

        fx.write("train.py", "print('changed')\n");
        assert_eq!(gi.is_dirty(), Probe::Value(true));
    }

    #[test]
    fn diff_against_remote_tracking_branch() {
        let fx = Fixture::pushed();
        let gi = inspector(&fx);
        assert_eq!(gi.diff(None, "origin"), Probe::Value(Vec::new()));

        fx.write("train.py", "print('changed')\n");
        let patch = String::from_utf8(gi.diff(None, "origin").value().unwrap()).unwrap();
        assert!(patch.contains("diff --git a/train.py b/train.py"));
        assert!(patch.contains("-print('hello')"));
        assert!(patch.contains("+print('changed')"));
    }

    #[test]
    fn branch_on_remote_checks_tracked_refs() {
        let fx = Fixture::pushed();
        let gi = inspector(&fx);
        assert_eq!(gi.branch_on_remote("origin", "main"), Probe::Value(true));
        assert_eq!(gi.branch_on_remote("origin", "feature"), Probe::Value(false));
        assert_eq!(gi.branch_on_remote("upstream", "main"), Probe::NotApplicable);
    }

    #[test]
    fn commit_on_remote_includes_ancestors() {
        let fx = Fixture::pushed();
        let gi = inspector(&fx);
        let first = gi.current_commit().value().unwrap();

        fx.write("train.py", "print('second')\n");
        let second = fx.commit("second").to_string();
        assert_eq!(gi.commit_on_remote("origin", &second), Probe::Value(false));
        assert_eq!(gi.commit_on_remote("origin", &first), Probe::Value(true));

        fx.publish("main", git2::Oid::from_str(&second).unwrap());
        assert_eq!(gi.commit_on_remote("origin", &second), Probe::Value(true));
        assert_eq!(gi.commit_on_remote("origin", &first), Probe::Value(true));
    }

    #[test]
    fn commit_on_remote_rejects_malformed_hash() {
        let fx = Fixture::pushed();
        assert!(matches!(
            inspector(&fx).commit_on_remote("origin", "not-a-hash"),
            Probe::Failed(_)
        ));
    }

    #[test]
    fn snapshot_reflects_live_state() {
        let fx = Fixture::pushed();
        let gi = inspector(&fx);
        let before = gi.snapshot("origin");
        assert!(!before.dirty);
        assert_eq!(before.branch, Probe::Value("main".to_string()));

        fx.write("train.py", "print('later on')\n");
        let after = gi.snapshot("origin");
        assert!(after.dirty);
        let patch = String::from_utf8(after.diff.value().unwrap()).unwrap();
        assert!(patch.contains("+print('later on')"));
    }

    #[test]
    fn diff_keeps_non_utf8_bytes() {
        let fx = Fixture::pushed();
        fs::write(fx.path().join("data.txt"), b"caf\xe9\n").unwrap();
        let id = fx.commit("latin-1 data");
        fx.publish("main", id);

        fs::write(fx.path().join("data.txt"), b"caf\xe9 au lait\n").unwrap();
        let patch = inspector(&fx).diff(None, "origin").value().unwrap();
        let has = |needle: &[u8]| patch.windows(needle.len()).any(|w| w == needle);
        assert!(has(&b"-caf\xe9\n"[..]));
        assert!(has(&b"+caf\xe9 au lait\n"[..]));
        assert!(String::from_utf8(patch).is_err());
    }
}
