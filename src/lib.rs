//! Crate entry point for **kfp-task**.
//!
//! Submits a local script, together with the git state needed to reproduce
//! it, as a single-step Kubeflow Pipelines run. The pod clones the remote at
//! the resolved commit, applies any uncommitted changes shipped as a
//! compressed diff, installs dependencies and runs the command.
//!
//! Library users build a [`TaskOptions`], turn it into a validated
//! [`TaskDescriptor`] and hand that to [`submit`].

pub mod client;
pub mod config;
pub mod diff;
pub mod git;
pub mod pipeline;
pub mod task;

mod paths;
mod progress;
mod submit;

pub use client::{Endpoint, KfpClient, RunHandle};
pub use config::{Settings, load_settings};
pub use paths::kfp_task_home;
pub use pipeline::PipelineOptions;
pub use submit::{SubmitMode, cmd_submit, submit};
pub use task::{Entry, Resources, TaskDescriptor, TaskError, TaskOptions};
