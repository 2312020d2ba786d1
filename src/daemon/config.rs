//! Supervisor configuration and worker interpreter resolution.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

/// Sentinel filename a handshake-capable worker writes into its response
/// directory once its model is loaded.
pub const READY_SENTINEL: &str = ".ready";

/// Interpreter preferred over the system `python3`, relative to the project root.
const VENV_INTERPRETER: &str = "scripts/ocr/venv/bin/python3";

const DEFAULT_SETTLE_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_READY_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60); // first model load is slow
const DEFAULT_PUBLISH_YIELD: Duration = Duration::from_millis(200);
const DEFAULT_RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_DIAGNOSTIC_CAPACITY: usize = 1000; // chars kept per worker stream

/// How the supervisor decides a freshly spawned worker finished loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessProbe {
    /// Ready once the worker survives [`SupervisorConfig::settle_window`]
    /// after spawn. The stock daemons log readiness to stderr but write no
    /// sentinel, so this is the default.
    SettleWindow,
    /// Ready once the worker creates [`READY_SENTINEL`] in the response
    /// directory. The supervisor deletes any stale sentinel before spawning
    /// and consumes the fresh one.
    ReadyFile,
}

/// Configuration for one [`WorkerSupervisor`](super::WorkerSupervisor).
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Short worker name used in logs.
    pub name: String,
    /// Directory the venv interpreter and worker scripts live under.
    pub project_root: PathBuf,
    /// Worker script passed to the interpreter.
    pub script: PathBuf,
    /// Directory request artifacts are dropped into.
    pub request_dir: PathBuf,
    /// Directory the worker writes response artifacts into.
    pub response_dir: PathBuf,
    /// Arguments appended after the request and response directories.
    pub extra_args: Vec<String>,
    /// Interpreter override. `None` resolves the project venv interpreter,
    /// falling back to `python3` on PATH.
    pub interpreter: Option<PathBuf>,
    pub readiness: ReadinessProbe,
    /// How long a worker must stay alive post-spawn to count as ready.
    pub settle_window: Duration,
    /// Poll interval of the readiness wait.
    pub ready_poll_interval: Duration,
    /// Upper bound on the readiness wait.
    pub ready_timeout: Duration,
    /// Pause after publishing a request, before the first response poll.
    pub publish_yield: Duration,
    /// Poll interval of the response wait.
    pub response_poll_interval: Duration,
    /// Upper bound on the response wait.
    pub response_timeout: Duration,
    /// Restart a live but unresponsive worker after this many consecutive
    /// response timeouts. `None` leaves restarts to the caller.
    pub restart_after_timeouts: Option<u32>,
    /// Most recent chars kept per captured worker stream.
    pub diagnostic_capacity: usize,
}

impl SupervisorConfig {
    /// Configuration with the stock daemon timings.
    pub fn new(
        name: impl Into<String>,
        project_root: impl Into<PathBuf>,
        script: impl Into<PathBuf>,
        request_dir: impl Into<PathBuf>,
        response_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            project_root: project_root.into(),
            script: script.into(),
            request_dir: request_dir.into(),
            response_dir: response_dir.into(),
            extra_args: Vec::new(),
            interpreter: None,
            readiness: ReadinessProbe::SettleWindow,
            settle_window: DEFAULT_SETTLE_WINDOW,
            ready_poll_interval: DEFAULT_READY_POLL_INTERVAL,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            publish_yield: DEFAULT_PUBLISH_YIELD,
            response_poll_interval: DEFAULT_RESPONSE_POLL_INTERVAL,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            restart_after_timeouts: None,
            diagnostic_capacity: DEFAULT_DIAGNOSTIC_CAPACITY,
        }
    }

    /// Interpreter the worker is spawned with.
    ///
    /// Prefers the project venv interpreter; falls back to `python3` on PATH
    /// with a warning when the venv is absent.
    pub fn resolve_interpreter(&self) -> PathBuf {
        if let Some(interpreter) = &self.interpreter {
            return interpreter.clone();
        }
        let venv = self.project_root.join(VENV_INTERPRETER);
        if venv.is_file() {
            venv
        } else {
            warn!(
                worker = %self.name,
                venv = %venv.display(),
                "venv interpreter not found, falling back to system python3"
            );
            PathBuf::from("python3")
        }
    }

    /// Path of the readiness sentinel for this worker.
    pub(crate) fn ready_sentinel(&self) -> PathBuf {
        self.response_dir.join(READY_SENTINEL)
    }
}

/// Detection model weights: `best.pt` at the project root wins over the
/// checked-in copy under `scripts/ocr/models/`.
pub fn resolve_model_path(project_root: &Path) -> PathBuf {
    let root_model = project_root.join("best.pt");
    let scripts_model = project_root.join("scripts/ocr/models/best.pt");
    if root_model.is_file() {
        root_model
    } else if scripts_model.is_file() {
        scripts_model
    } else {
        warn!(
            model = %root_model.display(),
            "detection model not found on disk, the worker will fail to load it"
        );
        root_model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config_at(root: &Path) -> SupervisorConfig {
        SupervisorConfig::new(
            "test",
            root,
            root.join("daemon.py"),
            root.join("requests"),
            root.join("responses"),
        )
    }

    #[test]
    fn test_defaults_match_stock_daemon_timings() {
        let config = config_at(Path::new("/nonexistent"));

        assert_eq!(config.readiness, ReadinessProbe::SettleWindow);
        assert_eq!(config.settle_window, Duration::from_secs(5));
        assert_eq!(config.ready_timeout, Duration::from_secs(60));
        assert_eq!(config.response_poll_interval, Duration::from_millis(200));
        assert_eq!(config.response_timeout, Duration::from_secs(60));
        assert_eq!(config.restart_after_timeouts, None);
        assert_eq!(config.diagnostic_capacity, 1000);
    }

    #[test]
    fn test_interpreter_prefers_project_venv() {
        let root = tempfile::tempdir().unwrap();
        let venv = root.path().join(VENV_INTERPRETER);
        fs::create_dir_all(venv.parent().unwrap()).unwrap();
        fs::write(&venv, "#!/bin/sh\n").unwrap();

        let config = config_at(root.path());
        assert_eq!(config.resolve_interpreter(), venv);
    }

    #[test]
    fn test_interpreter_falls_back_to_system_python() {
        let root = tempfile::tempdir().unwrap();

        let config = config_at(root.path());
        assert_eq!(config.resolve_interpreter(), PathBuf::from("python3"));
    }

    #[test]
    fn test_interpreter_override_wins() {
        let root = tempfile::tempdir().unwrap();
        let mut config = config_at(root.path());
        config.interpreter = Some(PathBuf::from("/bin/sh"));

        assert_eq!(config.resolve_interpreter(), PathBuf::from("/bin/sh"));
    }

    #[test]
    fn test_model_path_prefers_project_root_copy() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("best.pt"), b"weights").unwrap();
        let scripts_model = root.path().join("scripts/ocr/models/best.pt");
        fs::create_dir_all(scripts_model.parent().unwrap()).unwrap();
        fs::write(&scripts_model, b"weights").unwrap();

        assert_eq!(
            resolve_model_path(root.path()),
            root.path().join("best.pt")
        );
    }

    #[test]
    fn test_model_path_falls_back_to_scripts_copy() {
        let root = tempfile::tempdir().unwrap();
        let scripts_model = root.path().join("scripts/ocr/models/best.pt");
        fs::create_dir_all(scripts_model.parent().unwrap()).unwrap();
        fs::write(&scripts_model, b"weights").unwrap();

        assert_eq!(resolve_model_path(root.path()), scripts_model);
    }

    #[test]
    fn test_model_path_defaults_to_project_root_when_missing() {
        let root = tempfile::tempdir().unwrap();

        assert_eq!(
            resolve_model_path(root.path()),
            root.path().join("best.pt")
        );
    }
}
