//! In-container bootstrap protocol.
//!
//! Two processes share a pod: the `git-clone` sidecar and the main container.
//! They never talk directly. The sidecar writes exit codes into signal files
//! on a shared emptyDir; the main container polls for them once per second
//! and only runs the user command when every code is zero.
//!
//! ```text
//! sidecar:  Clone ──(git-clone)──> [Apply ──(git-apply)──>] exit
//! main:     WaitForClone -> [WaitForApply] -> InstallDependencies -> Execute
//! ```
//!
//! Parameters reach the scripts through `KFP_TASK_*` environment variables,
//! so no user value is ever spliced into shell text.

/// Shared checkout of the target repository.
pub const APP_DIR: &str = "/app";
/// Shared signal/log area.
pub const IPC_DIR: &str = "/ipc";
/// Mount point of the optional persistent volume.
pub const VOLUME_DIR: &str = "/volume";

/// Seconds between signal file polls.
pub const POLL_INTERVAL_SECS: u32 = 1;

pub const ENV_COMMAND: &str = "KFP_TASK_COMMAND";
pub const ENV_ARGS: &str = "KFP_TASK_ARGS";
pub const ENV_CWD: &str = "KFP_TASK_CWD";
pub const ENV_REQUIREMENTS: &str = "KFP_TASK_REQUIREMENTS";
pub const ENV_PACKAGES: &str = "KFP_TASK_PACKAGES";
pub const ENV_GIT_DIFF: &str = "KFP_TASK_GIT_DIFF";
pub const ENV_BRANCH: &str = "KFP_TASK_BRANCH";
pub const ENV_REMOTE_URL: &str = "KFP_TASK_REMOTE_URL";
pub const ENV_COMMIT: &str = "KFP_TASK_COMMIT";

/// Filesystem locations both processes agree on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub ipc_dir: String,
    pub app_dir: String,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            ipc_dir: IPC_DIR.to_string(),
            app_dir: APP_DIR.to_string(),
        }
    }
}

impl Layout {
    pub fn log_file(&self) -> String {
        format!("{}/log", self.ipc_dir)
    }

    pub fn signal_file(&self, signal: Signal) -> String {
        format!("{}/{}", self.ipc_dir, signal.file_name())
    }
}

/// One-shot completion signals written by the sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Clone,
    Apply,
}

impl Signal {
    pub fn file_name(self) -> &'static str {
        match self {
            Signal::Clone => "git-clone",
            Signal::Apply => "git-apply",
        }
    }
}

/// Sidecar states, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarStage {
    Clone,
    Apply,
}

impl SidecarStage {
    pub const ORDER: [SidecarStage; 2] = [SidecarStage::Clone, SidecarStage::Apply];

    fn render(self, layout: &Layout) -> String {
        let log = layout.log_file();
        match self {
            SidecarStage::Clone => format!(
                r#"# clone
{{
  git clone --progress --single-branch --branch "${ENV_BRANCH}" "${ENV_REMOTE_URL}" {app} --depth=1 &&
  cd {app} &&
  git fetch --depth=1 origin "${ENV_COMMIT}" &&
  git checkout "${ENV_COMMIT}"
}} >> {log} 2>&1
code=$?
{signal}
if [ $code -ne 0 ]; then
  exit 1
fi
"#,
                app = layout.app_dir,
                log = log,
                signal = write_signal(layout, Signal::Clone),
            ),
            SidecarStage::Apply => format!(
                r#"# apply
if [ -n "${ENV_GIT_DIFF}" ]; then
  cd {app} &&
  printf '%s' "${ENV_GIT_DIFF}" | base64 -d | gunzip | git apply --verbose - >> {log} 2>&1
  code=$?
  {signal}
  if [ $code -ne 0 ]; then
    exit 1
  fi
fi
"#,
                app = layout.app_dir,
                log = log,
                signal = write_signal(layout, Signal::Apply),
            ),
        }
    }
}

/// Main container states, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainStage {
    WaitForClone,
    WaitForApply,
    InstallDependencies,
    Execute,
}

impl MainStage {
    pub const ORDER: [MainStage; 4] = [
        MainStage::WaitForClone,
        MainStage::WaitForApply,
        MainStage::InstallDependencies,
        MainStage::Execute,
    ];

    fn render(self, layout: &Layout, interpreter: &str) -> String {
        match self {
            MainStage::WaitForClone => format!(
                "# wait for clone\n{}",
                await_signal(layout, Signal::Clone)
            ),
            MainStage::WaitForApply => format!(
                "# wait for apply\nif [ -n \"${ENV_GIT_DIFF}\" ]; then\n{}fi\n",
                indent(&await_signal(layout, Signal::Apply))
            ),
            MainStage::InstallDependencies => format!(
                r#"# install dependencies
kill $TAIL_PID 2>/dev/null
cd "${ENV_CWD}" || exit 1
if [ -n "${ENV_REQUIREMENTS}" ]; then
  pip install -r "${ENV_REQUIREMENTS}" || exit 1
fi
if [ -n "${ENV_PACKAGES}" ]; then
  echo "${ENV_PACKAGES}" | xargs pip install || exit 1
fi
"#
            ),
            MainStage::Execute => format!(
                "# execute\n{} \"${ENV_COMMAND}\" ${ENV_ARGS}\n",
                interpreter
            ),
        }
    }
}

/// Script run by the `git-clone` sidecar.
pub fn sidecar_script(layout: &Layout) -> String {
    let mut s = format!("touch {}\n", layout.log_file());
    for stage in SidecarStage::ORDER {
        s.push('\n');
        s.push_str(&stage.render(layout));
    }
    s
}

/// Script run by the main container. The log follower is stopped on every
/// exit path.
pub fn main_script(layout: &Layout, interpreter: &str) -> String {
    let log = layout.log_file();
    let mut s = format!(
        "touch {log}\ntail -F {log} &\nTAIL_PID=$!\ntrap 'kill $TAIL_PID 2>/dev/null' EXIT\n"
    );
    for stage in MainStage::ORDER {
        s.push('\n');
        s.push_str(&stage.render(layout, interpreter));
    }
    s
}

/// Write `$code` to the signal file via rename so readers never see a
/// partial file.
fn write_signal(layout: &Layout, signal: Signal) -> String {
    let path = layout.signal_file(signal);
    format!("echo $code > {path}.tmp && mv {path}.tmp {path}")
}

fn await_signal(layout: &Layout, signal: Signal) -> String {
    let path = layout.signal_file(signal);
    format!(
        r#"until [ -f {path} ]; do sleep {POLL_INTERVAL_SECS}; done
if [ "$(cat {path})" -ne 0 ]; then
  echo "{name} failed, see {log}" >&2
  exit 1
fi
"#,
        name = signal.file_name(),
        log = layout.log_file(),
    )
}

fn indent(block: &str) -> String {
    block
        .lines()
        .map(|l| format!("  {}\n", l))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::encode_diff;
    use crate::git::GitInspector;
    use crate::git::fixture::Fixture;
    use std::fs;
    use std::path::Path;
    use std::process::{Command, Stdio};

    fn layout_in(dir: &Path) -> Layout {
        Layout {
            ipc_dir: dir.join("ipc").to_string_lossy().into_owned(),
            app_dir: dir.join("app").to_string_lossy().into_owned(),
        }
    }

    fn run_main(dir: &Path, layout: &Layout, diff: &str) -> i32 {
        let script = main_script(layout, "sh");
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .env(ENV_COMMAND, "job.sh")
            .env(ENV_ARGS, "first second")
            .env(ENV_CWD, dir.join("app"))
            .env(ENV_REQUIREMENTS, "")
            .env(ENV_PACKAGES, "")
            .env(ENV_GIT_DIFF, diff)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap()
            .code()
            .unwrap_or(-1)
    }

    fn prepare(dir: &Path) -> Layout {
        let layout = layout_in(dir);
        fs::create_dir_all(&layout.ipc_dir).unwrap();
        fs::create_dir_all(&layout.app_dir).unwrap();
        fs::write(
            dir.join("app/job.sh"),
            "echo \"$@\" > ran.txt\n",
        )
        .unwrap();
        layout
    }

    #[test]
    fn signal_paths_live_under_ipc() {
        let l = Layout::default();
        assert_eq!(l.log_file(), "/ipc/log");
        assert_eq!(l.signal_file(Signal::Clone), "/ipc/git-clone");
        assert_eq!(l.signal_file(Signal::Apply), "/ipc/git-apply");
        assert_ne!(l.app_dir, l.ipc_dir);
    }

    #[test]
    fn main_script_stages_are_ordered() {
        let s = main_script(&Layout::default(), "python");
        let pos = |needle: &str| s.find(needle).unwrap();
        assert!(pos("until [ -f /ipc/git-clone ]") < pos("until [ -f /ipc/git-apply ]"));
        assert!(pos("until [ -f /ipc/git-apply ]") < pos("pip install -r"));
        assert!(pos("pip install -r") < pos("python \"$KFP_TASK_COMMAND\" $KFP_TASK_ARGS"));
        assert!(s.contains("sleep 1"));
    }

    #[test]
    fn sidecar_clones_then_applies() {
        let s = sidecar_script(&Layout::default());
        let pos = |needle: &str| s.find(needle).unwrap();
        assert!(pos("git clone --progress --single-branch") < pos("git fetch --depth=1 origin"));
        assert!(pos("git checkout") < pos("mv /ipc/git-clone.tmp /ipc/git-clone"));
        assert!(pos("mv /ipc/git-clone.tmp /ipc/git-clone") < pos("base64 -d | gunzip | git apply"));
        assert!(s.contains("mv /ipc/git-apply.tmp /ipc/git-apply"));
        assert!(!s.contains("{{"));
    }

    /// Serve the fixture repository over `file://` and return its URL and
    /// HEAD commit.
    fn served(fx: &Fixture) -> (String, String) {
        fx.repo
            .config()
            .unwrap()
            .set_bool("uploadpack.allowAnySHA1InWant", true)
            .unwrap();
        let head = fx.repo.head().unwrap().peel_to_commit().unwrap().id();
        (format!("file://{}", fx.path().display()), head.to_string())
    }

    fn run_sidecar(layout: &Layout, url: &str, branch: &str, commit: &str, diff: &str) -> i32 {
        Command::new("sh")
            .arg("-c")
            .arg(sidecar_script(layout))
            .env(ENV_REMOTE_URL, url)
            .env(ENV_BRANCH, branch)
            .env(ENV_COMMIT, commit)
            .env(ENV_GIT_DIFF, diff)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap()
            .code()
            .unwrap_or(-1)
    }

    fn signal_code(layout: &Layout, signal: Signal) -> Option<String> {
        fs::read_to_string(layout.signal_file(signal))
            .ok()
            .map(|s| s.trim().to_string())
    }

    #[cfg(unix)]
    #[test]
    fn sidecar_clones_and_applies_patch() {
        let fx = Fixture::pushed();
        let (url, head) = served(&fx);
        fx.write("train.py", "print('patched')\n");
        let patch = GitInspector::discover(fx.path())
            .unwrap()
            .diff(None, "origin")
            .value()
            .unwrap();
        let encoded = encode_diff(&patch).unwrap();

        let td = tempfile::tempdir().unwrap();
        let layout = layout_in(td.path());
        fs::create_dir_all(&layout.ipc_dir).unwrap();

        assert_eq!(run_sidecar(&layout, &url, "main", &head, &encoded), 0);
        assert_eq!(signal_code(&layout, Signal::Clone).as_deref(), Some("0"));
        assert_eq!(signal_code(&layout, Signal::Apply).as_deref(), Some("0"));
        assert_eq!(
            fs::read_to_string(td.path().join("app/train.py")).unwrap(),
            "print('patched')\n"
        );
        assert!(!Path::new(&format!("{}.tmp", layout.signal_file(Signal::Clone))).exists());
    }

    #[cfg(unix)]
    #[test]
    fn sidecar_skips_apply_without_diff() {
        let fx = Fixture::pushed();
        let (url, head) = served(&fx);

        let td = tempfile::tempdir().unwrap();
        let layout = layout_in(td.path());
        fs::create_dir_all(&layout.ipc_dir).unwrap();

        assert_eq!(run_sidecar(&layout, &url, "main", &head, ""), 0);
        assert_eq!(signal_code(&layout, Signal::Clone).as_deref(), Some("0"));
        assert_eq!(signal_code(&layout, Signal::Apply), None);
        assert_eq!(
            fs::read_to_string(td.path().join("app/train.py")).unwrap(),
            "print('hello')\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn sidecar_reports_failed_clone() {
        let fx = Fixture::pushed();
        let (url, head) = served(&fx);
        let encoded = encode_diff(b"diff --git a/x b/x\n").unwrap();

        let td = tempfile::tempdir().unwrap();
        let layout = layout_in(td.path());
        fs::create_dir_all(&layout.ipc_dir).unwrap();

        assert_eq!(run_sidecar(&layout, &url, "no-such-branch", &head, &encoded), 1);
        let code = signal_code(&layout, Signal::Clone).unwrap();
        assert_ne!(code, "0");
        assert!(!code.is_empty());
        assert_eq!(signal_code(&layout, Signal::Apply), None);
    }

    #[cfg(unix)]
    #[test]
    fn main_aborts_on_failed_clone() {
        let td = tempfile::tempdir().unwrap();
        let layout = prepare(td.path());
        fs::write(layout.signal_file(Signal::Clone), "128\n").unwrap();

        assert_eq!(run_main(td.path(), &layout, ""), 1);
        assert!(!td.path().join("app/ran.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn main_aborts_on_failed_apply() {
        let td = tempfile::tempdir().unwrap();
        let layout = prepare(td.path());
        fs::write(layout.signal_file(Signal::Clone), "0\n").unwrap();
        fs::write(layout.signal_file(Signal::Apply), "1\n").unwrap();

        assert_eq!(run_main(td.path(), &layout, "H4sIAAAA"), 1);
        assert!(!td.path().join("app/ran.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn main_runs_command_after_signals() {
        let td = tempfile::tempdir().unwrap();
        let layout = prepare(td.path());
        fs::write(layout.signal_file(Signal::Clone), "0\n").unwrap();

        // No diff: the apply signal is never awaited.
        assert_eq!(run_main(td.path(), &layout, ""), 0);
        let ran = fs::read_to_string(td.path().join("app/ran.txt")).unwrap();
        assert_eq!(ran.trim(), "first second");
    }
}
