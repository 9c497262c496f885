use serde::Serialize;

/// Flat string map handed to the pipeline as workflow parameters.
///
/// Field names are the parameter names declared by
/// [`crate::pipeline::simple_task_pipeline`]; optional values render as `""`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineArguments {
    pub command: String,
    pub args: String,
    pub cwd: String,
    pub remote_url: String,
    pub branch: String,
    pub commit: String,
    pub git_diff: String,
    pub requirements: String,
    pub packages: String,
    pub gpu_limit: String,
    pub gpu_vendor: String,
    pub cpu_limit: String,
    pub cpu_request: String,
    pub memory_limit: String,
    pub memory_request: String,
    pub volume_name: String,
    pub container_image: String,
}

impl PipelineArguments {
    /// Name/value pairs in declaration order.
    pub fn to_parameters(&self) -> Vec<(&'static str, String)> {
        vec![
            ("command", self.command.clone()),
            ("args", self.args.clone()),
            ("cwd", self.cwd.clone()),
            ("remote_url", self.remote_url.clone()),
            ("branch", self.branch.clone()),
            ("commit", self.commit.clone()),
            ("git_diff", self.git_diff.clone()),
            ("requirements", self.requirements.clone()),
            ("packages", self.packages.clone()),
            ("gpu_limit", self.gpu_limit.clone()),
            ("gpu_vendor", self.gpu_vendor.clone()),
            ("cpu_limit", self.cpu_limit.clone()),
            ("cpu_request", self.cpu_request.clone()),
            ("memory_limit", self.memory_limit.clone()),
            ("memory_request", self.memory_request.clone()),
            ("volume_name", self.volume_name.clone()),
            ("container_image", self.container_image.clone()),
        ]
    }
}
