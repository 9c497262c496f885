//! Git integration layer.
//!
//! The actual queries live in `git2_backend`; the rest of the crate only sees
//! [`GitInspector`], the [`Probe`] result type and the [`GitSnapshot`] bundle.
//! Keeping `git2` behind this module means another backend (e.g. shelling out
//! to `git`) could be swapped in without touching the task assembly code.

mod git2_backend;
mod probe;

use std::path::PathBuf;
use thiserror::Error;

pub use git2_backend::GitInspector;
pub use probe::Probe;

/// Fatal git failures. Everything else degrades to a [`Probe`].
#[derive(Debug, Error)]
pub enum GitError {
    #[error("{} is not a Git repository", path.display())]
    NotARepository { path: PathBuf },
}

/// Git-derived facts gathered at construction time. Never cached.
#[derive(Debug, Clone)]
pub struct GitSnapshot {
    pub remote_url: Probe<String>,
    pub branch: Probe<String>,
    pub commit: Probe<String>,
    pub dirty: bool,
    pub diff: Probe<Vec<u8>>,
}
