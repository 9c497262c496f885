use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::Endpoint;
use crate::pipeline::workflow::Parameter;

const API_PREFIX: &str = "/apis/v1beta1";
const DEFAULT_EXPERIMENT: &str = "Default";
const TERMINAL_STATES: &[&str] = &["Succeeded", "Failed", "Error", "Skipped", "Terminated"];

#[derive(Debug, Deserialize)]
struct ExperimentList {
    #[serde(default)]
    experiments: Vec<Experiment>,
}

#[derive(Debug, Deserialize)]
struct Experiment {
    id: String,
}

#[derive(Debug, Serialize)]
struct ResourceReference {
    key: ResourceKey,
    relationship: &'static str,
}

#[derive(Debug, Serialize)]
struct ResourceKey {
    #[serde(rename = "type")]
    kind: &'static str,
    id: String,
}

impl ResourceReference {
    fn owner(kind: &'static str, id: &str) -> Self {
        Self {
            key: ResourceKey {
                kind,
                id: id.to_string(),
            },
            relationship: "OWNER",
        }
    }
}

#[derive(Debug, Serialize)]
struct NewExperiment<'a> {
    name: &'a str,
    resource_references: Vec<ResourceReference>,
}

#[derive(Debug, Serialize)]
struct NewRun<'a> {
    name: &'a str,
    pipeline_spec: PipelineSpec,
    resource_references: Vec<ResourceReference>,
}

#[derive(Debug, Serialize)]
struct PipelineSpec {
    workflow_manifest: String,
    parameters: Vec<Parameter>,
}

#[derive(Debug, Deserialize)]
struct RunDetail {
    run: ApiRun,
}

/// Run record as reported by the platform.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiRun {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ApiRun {
    pub fn is_finished(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| TERMINAL_STATES.contains(&s))
    }

    pub fn succeeded(&self) -> bool {
        self.status.as_deref() == Some("Succeeded")
    }
}

/// Everything needed to create one run.
#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub name: &'a str,
    pub experiment_id: &'a str,
    pub workflow_manifest: String,
    pub parameters: Vec<(&'static str, String)>,
}

/// Opaque reference to a created run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub id: String,
    pub name: String,
    /// Link to the run in the KFP UI.
    pub url: String,
}

/// Authenticated session against one KFP endpoint and namespace.
pub struct KfpClient {
    http: Client,
    host: String,
    namespace: String,
    poll_interval: Duration,
}

impl KfpClient {
    pub fn connect(endpoint: &Endpoint, namespace: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("kfp-task/", env!("CARGO_PKG_VERSION"))),
        );
        if let Some(tok) = &endpoint.token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", tok))?,
            );
        }
        if !endpoint.verify_ssl && endpoint.host.starts_with("https://") {
            warn!("TLS certificate verification is disabled for {}", endpoint.host);
        }
        let http = Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(!endpoint.verify_ssl)
            .build()?;
        Ok(Self {
            http,
            host: endpoint.host.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            poll_interval: Duration::from_secs(5),
        })
    }

    pub fn with_poll_interval(mut self, every: Duration) -> Self {
        self.poll_interval = every;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.host, API_PREFIX, path)
    }

    /// Id of the named experiment in this namespace, creating it if needed.
    /// `None` selects the platform's `Default` experiment.
    pub fn ensure_experiment(&self, name: Option<&str>) -> Result<String> {
        let name = name.unwrap_or(DEFAULT_EXPERIMENT);
        let filter = serde_json::json!({
            "predicates": [{"key": "name", "op": "EQUALS", "string_value": name}]
        })
        .to_string();

        let found: ExperimentList = self
            .http
            .get(self.url("/experiments"))
            .query(&[
                ("filter", filter.as_str()),
                ("resource_reference_key.type", "NAMESPACE"),
                ("resource_reference_key.id", self.namespace.as_str()),
            ])
            .send()?
            .error_for_status()
            .with_context(|| format!("failed to look up experiment {}", name))?
            .json()?;
        if let Some(exp) = found.experiments.into_iter().next() {
            debug!(experiment = name, id = %exp.id, "experiment exists");
            return Ok(exp.id);
        }

        let body = NewExperiment {
            name,
            resource_references: vec![ResourceReference::owner("NAMESPACE", &self.namespace)],
        };
        let created: Experiment = self
            .http
            .post(self.url("/experiments"))
            .json(&body)
            .send()?
            .error_for_status()
            .with_context(|| format!("failed to create experiment {}", name))?
            .json()?;
        info!(experiment = name, id = %created.id, "created experiment");
        Ok(created.id)
    }

    pub fn create_run(&self, req: &RunRequest<'_>) -> Result<RunHandle> {
        let body = NewRun {
            name: req.name,
            pipeline_spec: PipelineSpec {
                workflow_manifest: req.workflow_manifest.clone(),
                parameters: req
                    .parameters
                    .iter()
                    .map(|(name, value)| Parameter {
                        name: name.to_string(),
                        value: value.clone(),
                    })
                    .collect(),
            },
            resource_references: vec![ResourceReference::owner("EXPERIMENT", req.experiment_id)],
        };
        let detail: RunDetail = self
            .http
            .post(self.url("/runs"))
            .json(&body)
            .send()?
            .error_for_status()
            .with_context(|| format!("failed to create run {}", req.name))?
            .json()?;

        let handle = RunHandle {
            url: format!("{}/#/runs/details/{}", self.host, detail.run.id),
            name: detail.run.name,
            id: detail.run.id,
        };
        info!(run = %handle.name, id = %handle.id, "created run");
        Ok(handle)
    }

    pub fn get_run(&self, id: &str) -> Result<ApiRun> {
        let detail: RunDetail = self
            .http
            .get(self.url(&format!("/runs/{}", id)))
            .send()?
            .error_for_status()
            .with_context(|| format!("failed to fetch run {}", id))?
            .json()?;
        Ok(detail.run)
    }

    /// Poll until the run reaches a terminal state or `timeout` elapses.
    pub fn wait_for_run_completion(&self, id: &str, timeout: Duration) -> Result<ApiRun> {
        let deadline = Instant::now() + timeout;
        loop {
            let run = self.get_run(id)?;
            debug!(id, status = ?run.status, "polled run");
            if run.is_finished() {
                return Ok(run);
            }
            if Instant::now() >= deadline {
                bail!(
                    "timed out after {}s waiting for run {} (last status: {})",
                    timeout.as_secs(),
                    id,
                    run.status.as_deref().unwrap_or("unknown")
                );
            }
            thread::sleep(self.poll_interval);
        }
    }
}
