use anyhow::{Context, Result};
use serde::Deserialize;
use std::{env, fs, io, path::Path};
use tracing::debug;

use crate::client::{DEFAULT_HOST, Endpoint};
use crate::paths::paths;
use crate::pipeline::DEFAULT_TRACKING_URI;
use crate::task::{DEFAULT_CONTAINER_IMAGE, DEFAULT_REMOTE, Resources};

/// Overrides the `token` key.
pub const TOKEN_ENV: &str = "KFP_TOKEN";

/// User defaults loaded from `config.toml`. Command-line flags win over
/// anything set here.
///
/// Example TOML:
/// ```toml
/// host      = "https://kubeflow.example.com/pipeline"
/// namespace = "team-ml"
///
/// [resources]
/// memory_limit = "8Gi"
/// gpu_limit    = 1
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub host: String,
    pub verify_ssl: bool,
    pub token: Option<String>,
    pub namespace: Option<String>,
    pub remote: String,
    pub container_image: String,
    pub tracking_uri: String,
    pub resources: Resources,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            verify_ssl: false,
            token: None,
            namespace: None,
            remote: DEFAULT_REMOTE.to_string(),
            container_image: DEFAULT_CONTAINER_IMAGE.to_string(),
            tracking_uri: DEFAULT_TRACKING_URI.to_string(),
            resources: Resources::default(),
        }
    }
}

impl Settings {
    /// Connection settings, with `KFP_TOKEN` taking precedence over the file.
    pub fn endpoint(&self) -> Endpoint {
        let token = env::var(TOKEN_ENV)
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| self.token.clone());
        Endpoint {
            host: self.host.clone(),
            verify_ssl: self.verify_ssl,
            token,
        }
    }
}

/// Load settings from the default location. A missing file yields defaults.
pub fn load_settings() -> Result<Settings> {
    let p = paths()?;
    load_settings_from(&p.config)
}

/// # Errors
/// - The file exists but cannot be read.
/// - The file is not valid TOML or has unknown keys.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    let txt = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("no config at {}, using defaults", path.display());
            return Ok(Settings::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let settings: Settings =
        toml::from_str(&txt).with_context(|| format!("failed to parse {}", path.display()))?;
    debug!("loaded settings from {}", path.display());
    Ok(settings)
}
