use anyhow::{Context, Result, bail};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::client::{KfpClient, RunHandle, RunRequest};
use crate::pipeline::{PipelineOptions, RUN_TIMEOUT_SECS, simple_task_pipeline, to_manifest};
use crate::progress;
use crate::task::{TaskDescriptor, TaskOptions};

/// How far a submission goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitMode {
    /// Print the resolved arguments and stop before contacting the platform.
    pub dry_run: bool,
    pub wait: bool,
    pub wait_timeout: Duration,
}

impl Default for SubmitMode {
    fn default() -> Self {
        Self {
            dry_run: false,
            wait: false,
            wait_timeout: Duration::from_secs(RUN_TIMEOUT_SECS),
        }
    }
}

/// Create one run for an assembled task.
pub fn submit(task: &TaskDescriptor, pipeline: &PipelineOptions) -> Result<(KfpClient, RunHandle)> {
    let arguments = task.render_arguments();
    let manifest = to_manifest(&simple_task_pipeline(pipeline))
        .context("failed to serialize workflow manifest")?;

    let client = KfpClient::connect(task.endpoint(), task.namespace())?;

    let pb = progress::step(format!(
        "resolving experiment {}",
        task.experiment_name().unwrap_or("Default")
    ));
    let experiment = client.ensure_experiment(task.experiment_name());
    progress::finish(&pb, &experiment, "experiment ready");
    let experiment_id = experiment?;

    let pb = progress::step(format!("submitting {}", task.run_name()));
    let handle = client.create_run(&RunRequest {
        name: task.run_name(),
        experiment_id: &experiment_id,
        workflow_manifest: manifest,
        parameters: arguments.to_parameters(),
    });
    let done = match &handle {
        Ok(h) => format!("submitted {}: {}", task.run_name(), h.url),
        Err(_) => String::new(),
    };
    progress::finish(&pb, &handle, done);
    Ok((client, handle?))
}

/// CLI command: assemble, submit and optionally wait.
///
/// # Errors
/// - Any failed precondition while assembling the task.
/// - Platform errors while submitting or polling.
/// - With `wait`, a run that ends in any state but `Succeeded`.
pub fn cmd_submit(
    opts: TaskOptions,
    local_dir: &Path,
    pipeline: &PipelineOptions,
    mode: &SubmitMode,
) -> Result<()> {
    let task = TaskDescriptor::assemble(opts, local_dir)?;
    info!(
        run = task.run_name(),
        namespace = task.namespace(),
        branch = task.branch(),
        commit = task.checkout_commit(),
        diff = task.git_diff().is_some(),
        "task assembled"
    );

    if mode.dry_run {
        let args = task.render_arguments();
        println!("{}", serde_json::to_string_pretty(&args)?);
        return Ok(());
    }

    let (client, handle) = submit(&task, pipeline)?;
    println!("{}", handle.url);
    if !mode.wait {
        return Ok(());
    }

    let pb = progress::step(format!("waiting for {}", task.run_name()));
    let run = client.wait_for_run_completion(&handle.id, mode.wait_timeout);
    let status = match &run {
        Ok(r) => r.status.clone().unwrap_or_default(),
        Err(_) => String::new(),
    };
    progress::finish(&pb, &run, format!("{} finished: {}", task.run_name(), status));
    let run = run?;
    debug!(id = %run.id, error = ?run.error, "run finished");
    if !run.succeeded() {
        match run.error.as_deref().filter(|e| !e.is_empty()) {
            Some(e) => bail!("run {} finished with status {}: {}", handle.id, status, e),
            None => bail!("run {} finished with status {}", handle.id, status),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Endpoint;
    use crate::git::fixture::{Fixture, REMOTE_URL};
    use crate::task::Entry;
    use httpmock::prelude::*;
    use serde_json::json;

    fn options(server: &MockServer) -> TaskOptions {
        let mut opts = TaskOptions::new(Entry::Command("train.py".into()));
        opts.namespace = Some("team-ml".into());
        opts.run_name = Some("train nightly".into());
        opts.endpoint = Endpoint {
            host: server.base_url(),
            ..Endpoint::default()
        };
        opts
    }

    fn mock_experiment(server: &MockServer) {
        server.mock(|when, then| {
            when.method(GET).path("/apis/v1beta1/experiments");
            then.status(200)
                .json_body(json!({"experiments": [{"id": "exp-1", "name": "Default"}]}));
        });
    }

    #[test]
    fn submits_clean_pushed_checkout() {
        let fx = Fixture::pushed();
        let server = MockServer::start();
        mock_experiment(&server);
        let runs = server.mock(|when, then| {
            when.method(POST)
                .path("/apis/v1beta1/runs")
                .body_contains("\"name\":\"train nightly\"")
                .body_contains(format!("{{\"name\":\"remote_url\",\"value\":\"{}\"}}", REMOTE_URL))
                .body_contains("{\"name\":\"git_diff\",\"value\":\"\"}")
                .body_contains("Simple Task Pipeline");
            then.status(200)
                .json_body(json!({"run": {"id": "run-1", "name": "train nightly"}}));
        });

        let task = TaskDescriptor::assemble(options(&server), fx.path()).unwrap();
        let (_, handle) = submit(&task, &PipelineOptions::default()).unwrap();
        runs.assert();
        assert_eq!(handle.id, "run-1");
    }

    #[test]
    fn dry_run_never_contacts_platform() {
        let fx = Fixture::pushed();
        let server = MockServer::start();
        let any = server.mock(|when, then| {
            when.any_request();
            then.status(500);
        });

        let mode = SubmitMode {
            dry_run: true,
            ..SubmitMode::default()
        };
        cmd_submit(options(&server), fx.path(), &PipelineOptions::default(), &mode).unwrap();
        assert_eq!(any.hits(), 0);
    }

    #[test]
    fn failed_precondition_submits_nothing() {
        let fx = Fixture::pushed();
        let server = MockServer::start();
        let any = server.mock(|when, then| {
            when.any_request();
            then.status(200);
        });

        let mut opts = options(&server);
        opts.namespace = None;
        let err = cmd_submit(opts, fx.path(), &PipelineOptions::default(), &SubmitMode::default())
            .unwrap_err();
        assert!(err.to_string().contains("namespace is required"));
        assert_eq!(any.hits(), 0);
    }

    #[test]
    fn wait_reports_failed_run() {
        let fx = Fixture::pushed();
        let server = MockServer::start();
        mock_experiment(&server);
        server.mock(|when, then| {
            when.method(POST).path("/apis/v1beta1/runs");
            then.status(200)
                .json_body(json!({"run": {"id": "run-2", "name": "train nightly"}}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/apis/v1beta1/runs/run-2");
            then.status(200).json_body(json!({
                "run": {"id": "run-2", "status": "Failed", "error": "exit code 1"}
            }));
        });

        let mode = SubmitMode {
            wait: true,
            ..SubmitMode::default()
        };
        let err = cmd_submit(options(&server), fx.path(), &PipelineOptions::default(), &mode)
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("status Failed"));
        assert!(msg.contains("exit code 1"));
    }

    #[test]
    fn wait_accepts_succeeded_run() {
        let fx = Fixture::pushed();
        let server = MockServer::start();
        mock_experiment(&server);
        server.mock(|when, then| {
            when.method(POST).path("/apis/v1beta1/runs");
            then.status(200)
                .json_body(json!({"run": {"id": "run-3", "name": "train nightly"}}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/apis/v1beta1/runs/run-3");
            then.status(200)
                .json_body(json!({"run": {"id": "run-3", "status": "Succeeded"}}));
        });

        let mode = SubmitMode {
            wait: true,
            ..SubmitMode::default()
        };
        cmd_submit(options(&server), fx.path(), &PipelineOptions::default(), &mode).unwrap();
    }
}
