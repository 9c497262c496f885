//! Submission client for the Kubeflow Pipelines REST API.
//!
//! Only what a one-shot submission needs: resolve an experiment, create a run
//! from a workflow manifest, and optionally poll it to a terminal state.

mod kfp;

pub use kfp::{ApiRun, KfpClient, RunHandle, RunRequest};

pub const DEFAULT_HOST: &str = "http://localhost:8080";

/// Where and how to reach the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub verify_ssl: bool,
    /// Sent as `Authorization: Bearer <token>` when present.
    pub token: Option<String>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            verify_ssl: false,
            token: None,
        }
    }
}
