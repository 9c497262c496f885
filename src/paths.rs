use anyhow::{Result, bail};
use std::{env, path::PathBuf};

#[derive(Debug, Clone)]
pub struct Paths {
    pub home: PathBuf,
    pub config: PathBuf,
}

/// `$XDG_CONFIG_HOME/kfp-task`, falling back to `$HOME/.config/kfp-task`.
pub fn kfp_task_home() -> Result<PathBuf> {
    let base = match env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        Some(xdg) => PathBuf::from(xdg),
        None => match env::var_os("HOME").filter(|v| !v.is_empty()) {
            Some(home) => PathBuf::from(home).join(".config"),
            None => bail!("neither XDG_CONFIG_HOME nor HOME is set"),
        },
    };
    Ok(base.join("kfp-task"))
}

pub fn paths() -> Result<Paths> {
    let home = kfp_task_home()?;
    Ok(Paths {
        config: home.join("config.toml"),
        home,
    })
}
