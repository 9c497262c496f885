//! Pipeline template.
//!
//! Builds the single-step Argo `Workflow` that KFP runs. All task values are
//! workflow parameters, so the manifest is the same for every submission and
//! only the parameter list changes. The step has two mutually exclusive
//! branches, selected by the platform on whether `volume_name` is empty.

pub mod bootstrap;
pub mod workflow;

use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

use bootstrap::{
    APP_DIR, ENV_ARGS, ENV_BRANCH, ENV_COMMAND, ENV_COMMIT, ENV_CWD, ENV_GIT_DIFF, ENV_PACKAGES,
    ENV_REMOTE_URL, ENV_REQUIREMENTS, IPC_DIR, Layout, VOLUME_DIR, main_script, sidecar_script,
};
use workflow::{
    Arguments, Container, Dag, DagTask, EnvVar, Metadata, Parameter, Template, Volume,
    VolumeMount, Workflow, WorkflowSpec,
};

pub const PIPELINE_NAME: &str = "Simple Task Pipeline";
pub const PIPELINE_DESCRIPTION: &str = "A simple pipeline that clones a Git repository, \
    installs Python dependencies, and executes a script.";

/// Upper bound on a whole run, in seconds.
pub const RUN_TIMEOUT_SECS: u64 = 3600;
/// Cache staleness tolerance for the step: never reuse a cached result.
pub const MAX_CACHE_STALENESS: &str = "P0D";
pub const SIDECAR_IMAGE: &str = "alpine/git:2.43.0";
pub const DEFAULT_TRACKING_URI: &str = "http://mlflow-server:5000";
/// Set in the main container so user code can tell it runs remotely.
pub const INSIDE_CONTAINER_ENV: &str = "INSIDE_KFP_FUNC_CONTAINER";

const ENTRYPOINT: &str = "simple-task-pipeline";
const SERVICE_ACCOUNT: &str = "pipeline-runner";
const CACHE_ANNOTATION: &str = "pipelines.kubeflow.org/max_cache_staleness";
const SPEC_ANNOTATION: &str = "pipelines.kubeflow.org/pipeline_spec";

/// Declared parameters with their defaults.
pub const PARAMETERS: [(&str, &str); 17] = [
    ("remote_url", "https://github.com/your/repo.git"),
    ("branch", "main"),
    ("commit", "HEAD"),
    ("command", "script.py"),
    ("args", ""),
    ("cwd", APP_DIR),
    ("requirements", ""),
    ("packages", ""),
    ("gpu_limit", "0"),
    ("gpu_vendor", "nvidia.com/gpu"),
    ("cpu_limit", "1"),
    ("cpu_request", "0.5"),
    ("memory_limit", "2Gi"),
    ("memory_request", "1Gi"),
    ("git_diff", ""),
    ("container_image", "python:3.12.3-slim"),
    ("volume_name", ""),
];

/// Knobs that are fixed per installation rather than per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub tracking_uri: String,
    pub interpreter: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            tracking_uri: DEFAULT_TRACKING_URI.to_string(),
            interpreter: "python".to_string(),
        }
    }
}

/// The two execution branches of the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeBranch {
    Ephemeral,
    Persistent,
}

impl VolumeBranch {
    pub const ALL: [VolumeBranch; 2] = [VolumeBranch::Ephemeral, VolumeBranch::Persistent];

    /// Branch the platform will take for a given `volume_name` argument.
    pub fn select(volume_name: &str) -> Self {
        if volume_name.is_empty() {
            VolumeBranch::Ephemeral
        } else {
            VolumeBranch::Persistent
        }
    }

    pub fn template_name(self) -> &'static str {
        match self {
            VolumeBranch::Ephemeral => "run-command-without-volume",
            VolumeBranch::Persistent => "run-command-with-volume",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            VolumeBranch::Ephemeral => "Run Command Without Volume",
            VolumeBranch::Persistent => "Run Command With Volume",
        }
    }

    fn condition(self) -> String {
        let op = match self {
            VolumeBranch::Ephemeral => "==",
            VolumeBranch::Persistent => "!=",
        };
        format!("\"{}\" {} \"\"", param("volume_name"), op)
    }
}

/// Build the reusable workflow manifest.
pub fn simple_task_pipeline(opts: &PipelineOptions) -> Workflow {
    let layout = Layout::default();

    let mut templates = vec![Template {
        name: ENTRYPOINT.to_string(),
        dag: Some(Dag {
            tasks: VolumeBranch::ALL
                .iter()
                .map(|b| DagTask {
                    name: b.template_name().to_string(),
                    template: b.template_name().to_string(),
                    when: b.condition(),
                })
                .collect(),
        }),
        ..Default::default()
    }];
    templates.extend(
        VolumeBranch::ALL
            .iter()
            .map(|b| run_command_template(*b, &layout, opts)),
    );

    let mut annotations = BTreeMap::new();
    annotations.insert(SPEC_ANNOTATION.to_string(), pipeline_spec_annotation());

    Workflow {
        api_version: "argoproj.io/v1alpha1".to_string(),
        kind: "Workflow".to_string(),
        metadata: Metadata {
            generate_name: Some(format!("{}-", ENTRYPOINT)),
            annotations,
            labels: BTreeMap::new(),
        },
        spec: WorkflowSpec {
            entrypoint: ENTRYPOINT.to_string(),
            active_deadline_seconds: RUN_TIMEOUT_SECS,
            service_account_name: SERVICE_ACCOUNT.to_string(),
            arguments: Arguments {
                parameters: PARAMETERS
                    .iter()
                    .map(|(name, value)| Parameter {
                        name: name.to_string(),
                        value: value.to_string(),
                    })
                    .collect(),
            },
            templates,
        },
    }
}

/// Serialize a workflow the way the run API expects it (a JSON string).
pub fn to_manifest(workflow: &Workflow) -> serde_json::Result<String> {
    serde_json::to_string(workflow)
}

fn run_command_template(branch: VolumeBranch, layout: &Layout, opts: &PipelineOptions) -> Template {
    let mut mounts = vec![
        VolumeMount::new("app-volume", APP_DIR),
        VolumeMount::new("ipc-volume", IPC_DIR),
    ];
    let mut volumes = vec![
        Volume::empty_dir("app-volume"),
        Volume::empty_dir("ipc-volume"),
    ];
    if branch == VolumeBranch::Persistent {
        volumes.push(Volume::claim("data-volume", &param("volume_name")));
        mounts.push(VolumeMount::new("data-volume", VOLUME_DIR));
    }

    let main = Container {
        name: None,
        image: param("container_image"),
        command: vec!["sh".into(), "-c".into()],
        args: vec![main_script(layout, &opts.interpreter)],
        env: vec![
            EnvVar::new("MLFLOW_TRACKING_URI", opts.tracking_uri.clone()),
            EnvVar::new("MLFLOW_REGISTRY_URI", opts.tracking_uri.clone()),
            EnvVar::new(INSIDE_CONTAINER_ENV, "true"),
            EnvVar::new(ENV_COMMAND, param("command")),
            EnvVar::new(ENV_ARGS, param("args")),
            EnvVar::new(ENV_CWD, param("cwd")),
            EnvVar::new(ENV_REQUIREMENTS, param("requirements")),
            EnvVar::new(ENV_PACKAGES, param("packages")),
            EnvVar::new(ENV_GIT_DIFF, param("git_diff")),
        ],
        volume_mounts: mounts,
        working_dir: Some(APP_DIR.to_string()),
    };

    let sidecar = Container {
        name: Some("git-clone".to_string()),
        image: SIDECAR_IMAGE.to_string(),
        command: vec!["sh".into(), "-c".into()],
        args: vec![sidecar_script(layout)],
        env: vec![
            EnvVar::new(ENV_BRANCH, param("branch")),
            EnvVar::new(ENV_REMOTE_URL, param("remote_url")),
            EnvVar::new(ENV_COMMIT, param("commit")),
            EnvVar::new(ENV_GIT_DIFF, param("git_diff")),
        ],
        volume_mounts: vec![
            VolumeMount::new("app-volume", APP_DIR),
            VolumeMount::new("ipc-volume", IPC_DIR),
        ],
        working_dir: None,
    };

    let mut annotations = BTreeMap::new();
    annotations.insert(CACHE_ANNOTATION.to_string(), MAX_CACHE_STALENESS.to_string());
    annotations.insert(
        "pipelines.kubeflow.org/task_display_name".to_string(),
        branch.display_name().to_string(),
    );

    Template {
        name: branch.template_name().to_string(),
        metadata: Some(Metadata {
            generate_name: None,
            annotations,
            labels: BTreeMap::new(),
        }),
        dag: None,
        container: Some(main),
        sidecars: vec![sidecar],
        volumes,
        pod_spec_patch: Some(resources_patch()),
    }
}

/// Resource requests/limits for the main container. They are parameters
/// (including the GPU vendor key), which Argo only resolves inside
/// `podSpecPatch`.
fn resources_patch() -> String {
    let amounts = |cpu: &str, memory: &str| {
        let mut m = Map::new();
        m.insert(param("gpu_vendor"), Value::String(param("gpu_limit")));
        m.insert("cpu".to_string(), Value::String(param(cpu)));
        m.insert("memory".to_string(), Value::String(param(memory)));
        Value::Object(m)
    };
    json!({
        "containers": [{
            "name": "main",
            "resources": {
                "requests": amounts("cpu_request", "memory_request"),
                "limits": amounts("cpu_limit", "memory_limit"),
            }
        }]
    })
    .to_string()
}

fn pipeline_spec_annotation() -> String {
    let inputs: Vec<Value> = PARAMETERS
        .iter()
        .map(|(name, default)| json!({"name": name, "default": default, "type": "String"}))
        .collect();
    json!({
        "name": PIPELINE_NAME,
        "description": PIPELINE_DESCRIPTION,
        "inputs": inputs,
    })
    .to_string()
}

fn param(name: &str) -> String {
    format!("{{{{workflow.parameters.{}}}}}", name)
}
