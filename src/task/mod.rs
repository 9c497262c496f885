//! Task descriptor: the fully resolved, validated configuration of one
//! submission.
//!
//! [`TaskDescriptor::assemble`] applies the reconciliation policy. Values are
//! resolved as explicit option > git-derived value > built-in default, and
//! a diff is embedded only when the remote cannot reproduce the local tree
//! on its own.

mod arguments;

use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::Endpoint;
use crate::diff::{MAX_ENCODED_DIFF_LEN, check_ceiling, encode_diff};
use crate::git::{GitError, GitInspector, Probe};
use crate::pipeline::bootstrap::APP_DIR;

pub use arguments::PipelineArguments;

/// Package the pod installs so it can re-invoke a wrapped callable.
pub const BOOTSTRAP_STUB_PACKAGE: &str = "simple-kfp-task-stub";

pub const DEFAULT_REMOTE: &str = "origin";
pub const DEFAULT_CONTAINER_IMAGE: &str = "python:3.12.3-slim";

/// What the pod should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    /// A script path, relative to the local directory.
    Command(PathBuf),
    /// A callable living in `source_file`. The file is shipped as the command
    /// and the bootstrap stub package is installed alongside it.
    Callable { source_file: PathBuf },
}

/// CPU/memory/GPU requests and limits for the step.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub cpu_limit: String,
    pub cpu_request: String,
    pub memory_limit: String,
    pub memory_request: String,
    pub gpu_limit: u32,
    pub gpu_vendor: String,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpu_limit: "1".into(),
            cpu_request: "0.5".into(),
            memory_limit: "2Gi".into(),
            memory_request: "1Gi".into(),
            gpu_limit: 0,
            gpu_vendor: "nvidia.com/gpu".into(),
        }
    }
}

/// Caller-supplied inputs. `None` means "derive it".
#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub namespace: Option<String>,
    pub run_name: Option<String>,
    pub experiment_name: Option<String>,
    pub entry: Entry,
    pub args: Vec<String>,
    /// Working directory inside the container.
    pub cwd: Option<String>,
    pub remote: String,
    pub remote_url: Option<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub requirements: Option<String>,
    pub packages: Vec<String>,
    pub container_image: String,
    pub resources: Resources,
    pub volume_name: Option<String>,
    pub endpoint: Endpoint,
    /// When false no repository is opened; remote URL, branch and commit
    /// must then be given explicitly.
    pub detect_git: bool,
}

impl TaskOptions {
    pub fn new(entry: Entry) -> Self {
        Self {
            namespace: None,
            run_name: None,
            experiment_name: None,
            entry,
            args: Vec::new(),
            cwd: None,
            remote: DEFAULT_REMOTE.to_string(),
            remote_url: None,
            branch: None,
            commit: None,
            requirements: None,
            packages: Vec::new(),
            container_image: DEFAULT_CONTAINER_IMAGE.to_string(),
            resources: Resources::default(),
            volume_name: None,
            endpoint: Endpoint::default(),
            detect_git: true,
        }
    }
}

/// Fatal preconditions. Any of these aborts before anything is submitted.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("namespace is required")]
    MissingNamespace,
    #[error("command is required")]
    MissingCommand,
    #[error("command {} does not exist", .0.display())]
    CommandNotFound(PathBuf),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("cannot resolve URL of remote {remote}: {reason}")]
    RemoteUrlUnresolved { remote: String, reason: String },
    #[error("cannot determine branch: {reason}")]
    BranchUnresolved { reason: String },
    #[error("branch {branch} is not available on remote {remote}")]
    BranchNotOnRemote { branch: String, remote: String },
    #[error("cannot resolve commit {rev}: {reason}")]
    CommitUnresolved { rev: String, reason: String },
    #[error("cannot compute git diff: {reason}")]
    DiffUnavailable { reason: String },
    #[error("git diff is too long ({len} > {max}). Please commit and push your changes first.")]
    DiffTooLarge { len: usize, max: usize },
}

/// Validated configuration for a single submission. Read-only once built.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    namespace: String,
    run_name: String,
    experiment_name: Option<String>,
    command: PathBuf,
    args: Vec<String>,
    cwd: String,
    remote: String,
    remote_url: String,
    branch: String,
    commit: String,
    checkout_commit: String,
    requirements: Option<String>,
    packages: Vec<String>,
    container_image: String,
    resources: Resources,
    volume_name: Option<String>,
    git_diff: Option<String>,
    endpoint: Endpoint,
}

/// Git-derived part of a descriptor.
struct SourceState {
    cwd: String,
    remote_url: String,
    branch: String,
    commit: String,
    checkout_commit: String,
    git_diff: Option<String>,
}

impl TaskDescriptor {
    /// Resolve defaults and validate. `local_dir` is the directory commands
    /// are resolved against and the starting point of the repository search.
    ///
    /// # Errors
    /// Returns a [`TaskError`] for any failed precondition; nothing is
    /// submitted in that case.
    pub fn assemble(opts: TaskOptions, local_dir: &Path) -> Result<Self, TaskError> {
        let namespace = opts
            .namespace
            .clone()
            .filter(|n| !n.trim().is_empty())
            .ok_or(TaskError::MissingNamespace)?;

        let mut packages: Vec<String> = Vec::new();
        for p in &opts.packages {
            push_unique(&mut packages, p);
        }

        let command = match &opts.entry {
            Entry::Command(path) => path.clone(),
            Entry::Callable { source_file } => {
                push_unique(&mut packages, BOOTSTRAP_STUB_PACKAGE);
                relative_path(local_dir, source_file)
            }
        };
        if command.as_os_str().is_empty() {
            return Err(TaskError::MissingCommand);
        }
        if !local_dir.join(&command).exists() {
            return Err(TaskError::CommandNotFound(command));
        }

        let source = if opts.detect_git {
            let inspector = GitInspector::discover(local_dir)?;
            reconcile(&inspector, &opts, local_dir)?
        } else {
            explicit_source(&opts)?
        };

        let run_name = opts
            .run_name
            .clone()
            .unwrap_or_else(|| default_run_name(&command));

        Ok(Self {
            namespace,
            run_name,
            experiment_name: opts.experiment_name,
            command,
            args: opts.args,
            cwd: source.cwd,
            remote: opts.remote,
            remote_url: source.remote_url,
            branch: source.branch,
            commit: source.commit,
            checkout_commit: source.checkout_commit,
            requirements: opts.requirements,
            packages,
            container_image: opts.container_image,
            resources: opts.resources,
            volume_name: opts.volume_name.filter(|v| !v.is_empty()),
            git_diff: source.git_diff,
            endpoint: opts.endpoint,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn experiment_name(&self) -> Option<&str> {
        self.experiment_name.as_deref()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn command(&self) -> &Path {
        &self.command
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Commit the descriptor was built for.
    pub fn commit(&self) -> &str {
        &self.commit
    }

    /// Commit the pod fetches. Differs from [`Self::commit`] only when that
    /// commit is not on the remote; the diff then starts from the remote tip.
    pub fn checkout_commit(&self) -> &str {
        &self.checkout_commit
    }

    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn git_diff(&self) -> Option<&str> {
        self.git_diff.as_deref()
    }

    pub fn render_arguments(&self) -> PipelineArguments {
        PipelineArguments {
            command: self.command.to_string_lossy().into_owned(),
            args: self.args.join(" "),
            cwd: self.cwd.clone(),
            remote_url: self.remote_url.clone(),
            branch: self.branch.clone(),
            commit: self.checkout_commit.clone(),
            git_diff: self.git_diff.clone().unwrap_or_default(),
            requirements: self.requirements.clone().unwrap_or_default(),
            packages: self.packages.join(" "),
            gpu_limit: self.resources.gpu_limit.to_string(),
            gpu_vendor: self.resources.gpu_vendor.clone(),
            cpu_limit: self.resources.cpu_limit.clone(),
            cpu_request: self.resources.cpu_request.clone(),
            memory_limit: self.resources.memory_limit.clone(),
            memory_request: self.resources.memory_request.clone(),
            volume_name: self.volume_name.clone().unwrap_or_default(),
            container_image: self.container_image.clone(),
        }
    }
}

/// Fill remote URL, branch, commit and diff from the live repository.
fn reconcile(
    inspector: &GitInspector,
    opts: &TaskOptions,
    local_dir: &Path,
) -> Result<SourceState, TaskError> {
    let remote = opts.remote.as_str();
    let snap = inspector.snapshot(remote);

    let cwd = match &opts.cwd {
        Some(c) => c.clone(),
        None => match inspector.relative_to_root(local_dir) {
            Probe::Value(rel) => container_path(&rel),
            other => {
                warn!(
                    "cannot place {} in repository ({})",
                    local_dir.display(),
                    other.describe()
                );
                APP_DIR.to_string()
            }
        },
    };

    let remote_url = match &opts.remote_url {
        Some(u) => u.clone(),
        None => snap
            .remote_url
            .clone()
            .value()
            .ok_or_else(|| TaskError::RemoteUrlUnresolved {
                remote: remote.to_string(),
                reason: snap.remote_url.describe(),
            })?,
    };

    let branch = match &opts.branch {
        Some(b) => b.clone(),
        None => snap
            .branch
            .clone()
            .value()
            .ok_or_else(|| TaskError::BranchUnresolved {
                reason: snap.branch.describe(),
            })?,
    };
    if !inspector.branch_on_remote(remote, &branch).value_or(false) {
        return Err(TaskError::BranchNotOnRemote {
            branch,
            remote: remote.to_string(),
        });
    }

    let commit = match &opts.commit {
        Some(rev) => {
            let resolved = inspector.resolve_commit(rev);
            resolved.clone().value().ok_or_else(|| TaskError::CommitUnresolved {
                rev: rev.clone(),
                reason: resolved.describe(),
            })?
        }
        None => snap
            .commit
            .clone()
            .value()
            .ok_or_else(|| TaskError::CommitUnresolved {
                rev: "HEAD".into(),
                reason: snap.commit.describe(),
            })?,
    };

    let on_remote = inspector.commit_on_remote(remote, &commit).value_or(false);
    debug!(%branch, %commit, on_remote, dirty = snap.dirty, "git state");

    if on_remote && !snap.dirty {
        info!("commit {} is on {}, no diff needed", short(&commit), remote);
        return Ok(SourceState {
            cwd,
            remote_url,
            branch,
            checkout_commit: commit.clone(),
            commit,
            git_diff: None,
        });
    }

    let base = if on_remote {
        commit.clone()
    } else {
        let tip = inspector.remote_tip(remote, Some(&branch));
        tip.clone().value().ok_or_else(|| TaskError::DiffUnavailable {
            reason: format!("no tip for {}/{}: {}", remote, branch, tip.describe()),
        })?
    };

    // The snapshot already holds the diff against the tracking tip of the
    // current branch; reuse it when that is the base we need.
    let tracking_tip = inspector.remote_tip(remote, None).value();
    let patch = if tracking_tip.as_deref() == Some(base.as_str()) {
        snap.diff
    } else {
        inspector.diff(Some(&base), remote)
    };
    let bytes = match patch {
        Probe::Value(b) => b,
        other => {
            return Err(TaskError::DiffUnavailable {
                reason: other.describe(),
            });
        }
    };

    // Checking out the base already reproduces the tree.
    if bytes.is_empty() {
        info!("tree matches {}, no diff needed", short(&base));
        return Ok(SourceState {
            cwd,
            remote_url,
            branch,
            commit,
            checkout_commit: base,
            git_diff: None,
        });
    }

    let encoded = encode_diff(&bytes).map_err(|e| TaskError::DiffUnavailable {
        reason: e.to_string(),
    })?;
    check_ceiling(&encoded).map_err(|len| TaskError::DiffTooLarge {
        len,
        max: MAX_ENCODED_DIFF_LEN,
    })?;
    info!(
        "embedding diff against {} ({} encoded bytes)",
        short(&base),
        encoded.len()
    );

    Ok(SourceState {
        cwd,
        remote_url,
        branch,
        commit,
        checkout_commit: base,
        git_diff: Some(encoded),
    })
}

/// Source state when git detection is disabled: everything must be explicit.
fn explicit_source(opts: &TaskOptions) -> Result<SourceState, TaskError> {
    const REASON: &str = "git detection is disabled";
    let remote_url = opts
        .remote_url
        .clone()
        .ok_or_else(|| TaskError::RemoteUrlUnresolved {
            remote: opts.remote.clone(),
            reason: REASON.into(),
        })?;
    let branch = opts
        .branch
        .clone()
        .ok_or_else(|| TaskError::BranchUnresolved {
            reason: REASON.into(),
        })?;
    let commit = opts
        .commit
        .clone()
        .ok_or_else(|| TaskError::CommitUnresolved {
            rev: "HEAD".into(),
            reason: REASON.into(),
        })?;
    Ok(SourceState {
        cwd: opts.cwd.clone().unwrap_or_else(|| APP_DIR.to_string()),
        remote_url,
        branch,
        checkout_commit: commit.clone(),
        commit,
        git_diff: None,
    })
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|p| p == item) {
        list.push(item.to_string());
    }
}

/// `/app/<rel>` with forward slashes; `/app` for the repository root.
fn container_path(rel: &Path) -> String {
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        APP_DIR.to_string()
    } else {
        format!("{}/{}", APP_DIR, parts.join("/"))
    }
}

/// `target` expressed relative to `base`, climbing with `..` when needed.
fn relative_path(base: &Path, target: &Path) -> PathBuf {
    let target = if target.is_absolute() {
        target.to_path_buf()
    } else {
        base.join(target)
    };
    let base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let target = target.canonicalize().unwrap_or(target);

    let b: Vec<Component> = base.components().collect();
    let t: Vec<Component> = target.components().collect();
    let common = b.iter().zip(&t).take_while(|(x, y)| x == y).count();

    let mut out = PathBuf::new();
    for _ in common..b.len() {
        out.push("..");
    }
    for c in &t[common..] {
        out.push(c.as_os_str());
    }
    out
}

fn default_run_name(command: &Path) -> String {
    let stem = command
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "task".to_string());
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("{} {}", stem, secs)
}

fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}
