//! # kfp-task
//!
//! Run a local script on Kubeflow Pipelines without building an image.
//!
//! - Settings are read from `$(kfp-task --home)/config.toml`
//! - Flags override settings, settings override built-in defaults
//! - `--dry-run` prints the resolved pipeline arguments and exits
//! - `--wait-for-run` blocks until the run ends and fails unless it succeeded
//!
//! Logging goes to stderr and honours `RUST_LOG`.

use anyhow::Result;
use clap::Parser;
use kfp_task::{
    Entry, PipelineOptions, Settings, SubmitMode, TaskOptions, cmd_submit, kfp_task_home,
    load_settings,
};
use std::{env, path::PathBuf, time::Duration};
use tracing_subscriber::EnvFilter;

/// Command-line interface definition.
#[derive(Parser, Debug)]
#[command(
    name = "kfp-task",
    version,
    about = "kfp-task - run a local script as a Kubeflow Pipelines task",
    arg_required_else_help = true
)]
struct Cli {
    /// Script to run, relative to the current directory
    #[arg(required_unless_present = "home")]
    command: Option<PathBuf>,

    /// Arguments passed to the script
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Kubernetes namespace that owns the run
    #[arg(long)]
    namespace: Option<String>,
    /// Experiment to file the run under (default: "Default")
    #[arg(long)]
    experiment_name: Option<String>,
    /// Run name (default: "<script stem> <unix time>")
    #[arg(long)]
    run_name: Option<String>,

    /// Git remote to resolve URL, branch and reachability against
    #[arg(long)]
    remote: Option<String>,
    #[arg(long)]
    remote_url: Option<String>,
    #[arg(long)]
    branch: Option<String>,
    #[arg(long)]
    commit: Option<String>,
    /// Do not inspect the local repository; requires --remote-url, --branch and --commit
    #[arg(long)]
    disable_git_detection: bool,

    /// requirements.txt to install, relative to the working directory
    #[arg(long)]
    requirements: Option<String>,
    /// Extra packages to pip install
    #[arg(long, num_args = 1..)]
    packages: Vec<String>,
    #[arg(long)]
    container_image: Option<String>,
    /// Persistent volume claim mounted at /volume
    #[arg(long)]
    volume_name: Option<String>,

    #[arg(long)]
    gpu_limit: Option<u32>,
    #[arg(long)]
    gpu_vendor: Option<String>,
    #[arg(long)]
    cpu_limit: Option<String>,
    #[arg(long)]
    cpu_request: Option<String>,
    #[arg(long)]
    memory_limit: Option<String>,
    #[arg(long)]
    memory_request: Option<String>,

    /// KFP API endpoint
    #[arg(long)]
    host: Option<String>,
    /// Verify the endpoint's TLS certificate
    #[arg(long, overrides_with = "no_verify_ssl")]
    verify_ssl: bool,
    /// Skip TLS certificate verification, even if the config enables it
    #[arg(long, overrides_with = "verify_ssl")]
    no_verify_ssl: bool,

    /// Print the resolved arguments instead of submitting
    #[arg(long)]
    dry_run: bool,
    /// Block until the run finishes
    #[arg(long)]
    wait_for_run: bool,
    /// Seconds to wait with --wait-for-run
    #[arg(long, default_value_t = kfp_task::pipeline::RUN_TIMEOUT_SECS)]
    timeout: u64,

    /// Print the settings directory and exit
    #[arg(long)]
    home: bool,
    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    /// Merge flags over settings.
    fn into_parts(self, settings: &Settings) -> (TaskOptions, PipelineOptions, SubmitMode) {
        let command = self.command.unwrap_or_default();
        let mut opts = TaskOptions::new(Entry::Command(command));
        opts.args = self.args;
        opts.namespace = self.namespace.or_else(|| settings.namespace.clone());
        opts.experiment_name = self.experiment_name;
        opts.run_name = self.run_name;
        opts.remote = self.remote.unwrap_or_else(|| settings.remote.clone());
        opts.remote_url = self.remote_url;
        opts.branch = self.branch;
        opts.commit = self.commit;
        opts.detect_git = !self.disable_git_detection;
        opts.requirements = self.requirements;
        opts.packages = self.packages;
        opts.container_image = self
            .container_image
            .unwrap_or_else(|| settings.container_image.clone());
        opts.volume_name = self.volume_name;

        let mut res = settings.resources.clone();
        if let Some(v) = self.gpu_limit {
            res.gpu_limit = v;
        }
        if let Some(v) = self.gpu_vendor {
            res.gpu_vendor = v;
        }
        if let Some(v) = self.cpu_limit {
            res.cpu_limit = v;
        }
        if let Some(v) = self.cpu_request {
            res.cpu_request = v;
        }
        if let Some(v) = self.memory_limit {
            res.memory_limit = v;
        }
        if let Some(v) = self.memory_request {
            res.memory_request = v;
        }
        opts.resources = res;

        let mut endpoint = settings.endpoint();
        if let Some(h) = self.host {
            endpoint.host = h;
        }
        if self.verify_ssl {
            endpoint.verify_ssl = true;
        } else if self.no_verify_ssl {
            endpoint.verify_ssl = false;
        }
        opts.endpoint = endpoint;

        let pipeline = PipelineOptions {
            tracking_uri: settings.tracking_uri.clone(),
            ..PipelineOptions::default()
        };
        let mode = SubmitMode {
            dry_run: self.dry_run,
            wait: self.wait_for_run,
            wait_timeout: Duration::from_secs(self.timeout),
        };
        (opts, pipeline, mode)
    }
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "kfp_task=debug" } else { "kfp_task=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// CLI entry point.
fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.home {
        println!("{}", kfp_task_home()?.display());
        return Ok(());
    }

    let settings = load_settings()?;
    let local_dir = env::current_dir()?;
    let (opts, pipeline, mode) = cli.into_parts(&settings);
    cmd_submit(opts, &local_dir, &pipeline, &mode)
}
