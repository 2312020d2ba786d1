//! Lifecycle and request/response exchange for one worker process.
//!
//! The supervisor spawns the worker once, keeps it alive across many calls,
//! and talks to it purely through the filesystem: a request is published as
//! `{uuid}.json` in the request directory, the worker answers with
//! `{uuid}.json` in the response directory. Initialization is single-flight;
//! concurrent cold-start callers await one shared attempt and succeed or fail
//! together.

use std::io::ErrorKind;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::{ReadinessProbe, SupervisorConfig};
use super::diagnostics::DiagnosticBuffer;
use crate::error::SupervisorError;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500); // exit monitor cadence
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5); // "still waiting" log cadence

type SharedDiagnostics = Arc<Mutex<DiagnosticBuffer>>;
type InitShared = Shared<BoxFuture<'static, Result<(), InitFailure>>>;

/// Supervises one long-lived worker process.
///
/// Cloning yields another handle to the same worker; whatever wires up the
/// application constructs one supervisor per daemon and passes clones around.
#[derive(Clone)]
pub struct WorkerSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: SupervisorConfig,
    state: Mutex<SupervisorState>,
    consecutive_timeouts: AtomicU32,
}

#[derive(Default)]
struct SupervisorState {
    worker: Option<WorkerHandle>,
    init: Option<InFlight>,
    /// Bumped whenever the owned worker generation changes; an in-flight
    /// initialization aborts when it no longer matches.
    epoch: u64,
    last_exit: Option<ExitRecord>,
}

struct WorkerHandle {
    child: Child,
    pid: u32,
    gen: u64,
    spawned_at: DateTime<Utc>,
    response_notify: Arc<Notify>,
    _watcher: Option<RecommendedWatcher>,
}

struct InFlight {
    gen: u64,
    fut: InitShared,
}

struct ExitRecord {
    gen: u64,
    status: String,
}

/// Initialization failure shared between all coalesced waiters.
#[derive(Debug, Clone)]
struct InitFailure {
    reason: String,
    diagnostics: String,
}

impl InitFailure {
    fn new(reason: impl Into<String>, diagnostics: String) -> Self {
        Self {
            reason: reason.into(),
            diagnostics,
        }
    }

    fn superseded() -> Self {
        Self::new(
            "initialization superseded by restart or shutdown",
            String::new(),
        )
    }

    fn died(status: Option<String>, diagnostics: String) -> Self {
        let reason = match status {
            Some(status) => format!("worker exited during startup ({status})"),
            None => "worker exited during startup".to_string(),
        };
        Self::new(reason, diagnostics)
    }
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(SupervisorState::default()),
                consecutive_timeouts: AtomicU32::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Whether a live worker is currently owned. Makes no spawn attempt.
    pub fn is_alive(&self) -> bool {
        let mut st = self.inner.lock_state();
        worker_is_live(&mut st, &self.inner.config)
    }

    /// Guarantee a live, ready worker.
    ///
    /// Returns immediately when one is owned. When an initialization is
    /// already in flight the call awaits its shared outcome instead of
    /// spawning a second worker. Otherwise a fresh initialization runs:
    /// directories are created, the worker is spawned, its stderr is drained
    /// into a bounded buffer, and readiness is awaited per the configured
    /// probe. A failed attempt releases the single-flight guard so the next
    /// call can retry.
    pub async fn ensure_ready(&self) -> Result<(), SupervisorError> {
        let init = {
            let mut st = self.inner.lock_state();
            if let Some(inflight) = &st.init {
                inflight.fut.clone()
            } else if worker_is_live(&mut st, &self.inner.config) {
                return Ok(());
            } else {
                st.epoch += 1;
                let gen = st.epoch;
                let fut = run_init(Arc::clone(&self.inner), gen).boxed().shared();
                st.init = Some(InFlight {
                    gen,
                    fut: fut.clone(),
                });
                fut
            }
        };

        init.await
            .map_err(|failure| SupervisorError::Initialization {
                reason: failure.reason,
                diagnostics: failure.diagnostics,
            })
    }

    /// Send one request through the file-drop protocol and await its typed
    /// response.
    ///
    /// The request is published atomically (temp file, then rename) under a
    /// fresh UUID; the response artifact with the same UUID is polled for
    /// until it parses or the deadline passes. Both artifacts are deleted on
    /// every exit path.
    pub async fn process<Req, Resp>(&self, request: &Req) -> Result<Resp, SupervisorError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.ensure_ready().await?;

        // The worker can die between readiness and use.
        let wake = {
            let mut st = self.inner.lock_state();
            if !worker_is_live(&mut st, &self.inner.config) {
                return Err(SupervisorError::WorkerNotRunning);
            }
            st.worker
                .as_ref()
                .map(|worker| Arc::clone(&worker.response_notify))
        };

        let config = &self.inner.config;
        for dir in [&config.request_dir, &config.response_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|source| SupervisorError::ArtifactIo {
                    path: (*dir).clone(),
                    source,
                })?;
        }

        let artifact_id = Uuid::new_v4().to_string();
        let request_path = config.request_dir.join(format!("{artifact_id}.json"));
        let response_path = config.response_dir.join(format!("{artifact_id}.json"));

        let outcome = self
            .publish_and_wait(
                request,
                &artifact_id,
                &request_path,
                &response_path,
                wake.as_ref(),
            )
            .await;

        // Both artifacts go on every path; stragglers would otherwise pile up
        // in the shared directories.
        remove_artifact(&request_path).await;
        remove_artifact(&response_path).await;

        self.track_for_restart_policy(&outcome);
        outcome
    }

    /// Kill the current worker (if any) and run a full initialization.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        info!(worker = %self.inner.config.name, "restarting worker");
        self.kill_current("restart").await;
        self.ensure_ready().await
    }

    /// Kill the current worker and await its exit. Safe to call repeatedly
    /// and with no worker running.
    pub async fn shutdown(&self) {
        self.kill_current("shutdown").await;
    }

    async fn publish_and_wait<Req, Resp>(
        &self,
        request: &Req,
        artifact_id: &str,
        request_path: &Path,
        response_path: &Path,
        wake: Option<&Arc<Notify>>,
    ) -> Result<Resp, SupervisorError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let config = &self.inner.config;
        let payload = serde_json::to_vec(request)?;

        publish_atomic(&payload, request_path).await?;
        debug!(worker = %config.name, artifact = artifact_id, "request artifact published");

        // Give the worker a beat to notice the file before the first poll.
        sleep(config.publish_yield).await;

        self.wait_for_response(artifact_id, response_path, wake)
            .await
    }

    async fn wait_for_response<Resp>(
        &self,
        artifact_id: &str,
        response_path: &Path,
        wake: Option<&Arc<Notify>>,
    ) -> Result<Resp, SupervisorError>
    where
        Resp: DeserializeOwned,
    {
        let config = &self.inner.config;
        let started = Instant::now();
        let deadline = started + config.response_timeout;
        let mut next_progress = started + PROGRESS_INTERVAL;

        loop {
            if let Ok(bytes) = fs::read(response_path).await {
                // A half-written artifact parses as garbage; treat it as not
                // ready and pick it up complete on a later tick.
                if let Ok(response) = serde_json::from_slice::<Resp>(&bytes) {
                    return Ok(response);
                }
            }

            if !self.worker_alive() {
                warn!(
                    worker = %config.name,
                    artifact = artifact_id,
                    "worker died while a call was waiting"
                );
                return Err(SupervisorError::WorkerNotRunning);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SupervisorError::ResponseTimeout {
                    artifact_id: artifact_id.to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            if now >= next_progress {
                info!(
                    worker = %config.name,
                    artifact = artifact_id,
                    elapsed_s = started.elapsed().as_secs(),
                    "still waiting for worker response"
                );
                next_progress = now + PROGRESS_INTERVAL;
            }

            // The directory watcher wakes us as soon as the worker writes;
            // the sleep keeps the wait correct when no watcher is running.
            match wake {
                Some(wake) => {
                    tokio::select! {
                        _ = wake.notified() => {}
                        _ = sleep(config.response_poll_interval) => {}
                    }
                }
                None => sleep(config.response_poll_interval).await,
            }
        }
    }

    fn worker_alive(&self) -> bool {
        let mut st = self.inner.lock_state();
        worker_is_live(&mut st, &self.inner.config)
    }

    async fn kill_current(&self, cause: &'static str) {
        let worker = {
            let mut st = self.inner.lock_state();
            st.epoch += 1; // invalidates any in-flight initialization
            st.init = None;
            st.worker.take()
        };
        if let Some(mut worker) = worker {
            info!(
                worker = %self.inner.config.name,
                pid = worker.pid,
                cause,
                "killing worker process"
            );
            if let Err(err) = worker.child.kill().await {
                debug!(
                    worker = %self.inner.config.name,
                    error = %err,
                    "kill failed, process already gone"
                );
            }
        }
    }

    /// Count consecutive response timeouts against a live worker and restart
    /// it in the background once the configured limit is hit. The timed-out
    /// call still returns its error; a dead worker needs no policy because
    /// the next `ensure_ready` re-initializes.
    fn track_for_restart_policy<T>(&self, outcome: &Result<T, SupervisorError>) {
        let Some(limit) = self.inner.config.restart_after_timeouts else {
            return;
        };
        if matches!(outcome, Err(SupervisorError::ResponseTimeout { .. })) {
            let strikes = self.inner.consecutive_timeouts.fetch_add(1, Ordering::Relaxed) + 1;
            if strikes < limit {
                return;
            }
            self.inner.consecutive_timeouts.store(0, Ordering::Relaxed);
            warn!(
                worker = %self.inner.config.name,
                strikes,
                "worker unresponsive, scheduling automatic restart"
            );
            let supervisor = self.clone();
            tokio::spawn(async move {
                if let Err(err) = supervisor.restart().await {
                    error!(
                        worker = %supervisor.inner.config.name,
                        error = %err,
                        "automatic restart failed"
                    );
                }
            });
        } else {
            self.inner.consecutive_timeouts.store(0, Ordering::Relaxed);
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SupervisorState {
    fn last_exit_status(&self, gen: u64) -> Option<String> {
        self.last_exit
            .as_ref()
            .filter(|record| record.gen == gen)
            .map(|record| record.status.clone())
    }
}

/// One full initialization attempt. Always releases the single-flight guard
/// and tears down a partially started worker on failure.
async fn run_init(inner: Arc<Inner>, gen: u64) -> Result<(), InitFailure> {
    let result = spawn_and_wait_ready(&inner, gen).await;

    {
        let mut st = inner.lock_state();
        if st.init.as_ref().map(|inflight| inflight.gen) == Some(gen) {
            st.init = None;
        }
    }

    if result.is_err() {
        let worker = {
            let mut st = inner.lock_state();
            match st.worker.as_ref() {
                Some(worker) if worker.gen == gen => st.worker.take(),
                _ => None,
            }
        };
        if let Some(mut worker) = worker {
            let _ = worker.child.start_kill();
        }
    }
    result
}

async fn spawn_and_wait_ready(inner: &Arc<Inner>, gen: u64) -> Result<(), InitFailure> {
    let config = &inner.config;
    info!(
        worker = %config.name,
        script = %config.script.display(),
        "initializing worker"
    );

    for dir in [&config.request_dir, &config.response_dir] {
        fs::create_dir_all(dir).await.map_err(|err| {
            let dir = dir.display();
            InitFailure::new(
                format!("could not create artifact directory {dir}: {err}"),
                String::new(),
            )
        })?;
    }
    if config.readiness == ReadinessProbe::ReadyFile {
        // A sentinel left over from a previous run must not satisfy this
        // handshake.
        let _ = fs::remove_file(config.ready_sentinel()).await;
    }

    let interpreter = config.resolve_interpreter();
    let mut command = Command::new(&interpreter);
    command
        .arg(&config.script)
        .arg(&config.request_dir)
        .arg(&config.response_dir)
        .args(&config.extra_args)
        .env("SUPPRESS_OCR_LOGS", "1")
        .env("PYTHONUNBUFFERED", "1")
        .env("DISABLE_MODEL_SOURCE_CHECK", "True")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|err| {
        let interpreter = interpreter.display();
        InitFailure::new(format!("failed to spawn {interpreter}: {err}"), String::new())
    })?;
    let pid = child.id().unwrap_or(0);

    let stderr_tail: SharedDiagnostics = Arc::new(Mutex::new(DiagnosticBuffer::new(
        config.diagnostic_capacity,
    )));
    if let Some(stream) = child.stderr.take() {
        drain_stream(
            stream,
            Some(Arc::clone(&stderr_tail)),
            config.name.clone(),
            "stderr",
        );
    }
    if let Some(stream) = child.stdout.take() {
        drain_stream(stream, None, config.name.clone(), "stdout");
    }

    let response_notify = Arc::new(Notify::new());
    let ready_wake = Arc::clone(&response_notify);
    let watcher = watch_response_dir(
        &config.response_dir,
        Arc::clone(&response_notify),
        &config.name,
    );

    info!(
        worker = %config.name,
        pid,
        interpreter = %interpreter.display(),
        "worker spawned"
    );

    {
        let mut st = inner.lock_state();
        if st.epoch != gen {
            drop(st);
            let _ = child.start_kill();
            return Err(InitFailure::superseded());
        }
        st.worker = Some(WorkerHandle {
            child,
            pid,
            gen,
            spawned_at: Utc::now(),
            response_notify,
            _watcher: watcher,
        });
    }
    spawn_exit_monitor(Arc::clone(inner), gen);

    match config.readiness {
        ReadinessProbe::SettleWindow => wait_for_settle(inner, gen, &stderr_tail).await?,
        ReadinessProbe::ReadyFile => {
            wait_for_sentinel(inner, gen, &stderr_tail, &ready_wake).await?;
        }
    }

    info!(worker = %config.name, pid, "worker ready");
    Ok(())
}

/// Readiness by survival: the worker is ready once it outlives the settle
/// window without exiting.
async fn wait_for_settle(
    inner: &Arc<Inner>,
    gen: u64,
    stderr_tail: &SharedDiagnostics,
) -> Result<(), InitFailure> {
    let config = &inner.config;
    let started = Instant::now();
    loop {
        sleep(config.ready_poll_interval).await;

        check_generation_live(inner, gen, stderr_tail)?;

        if started.elapsed() >= config.settle_window {
            return Ok(());
        }
        if started.elapsed() >= config.ready_timeout {
            let secs = config.ready_timeout.as_secs();
            return Err(InitFailure::new(
                format!("worker not ready after {secs}s"),
                snapshot(stderr_tail),
            ));
        }
    }
}

/// Readiness by handshake: the worker announces itself by creating the
/// sentinel file in the response directory.
async fn wait_for_sentinel(
    inner: &Arc<Inner>,
    gen: u64,
    stderr_tail: &SharedDiagnostics,
    wake: &Notify,
) -> Result<(), InitFailure> {
    let config = &inner.config;
    let sentinel = config.ready_sentinel();
    let started = Instant::now();
    loop {
        if fs::try_exists(&sentinel).await.unwrap_or(false) {
            let _ = fs::remove_file(&sentinel).await; // consume the handshake
            return Ok(());
        }

        check_generation_live(inner, gen, stderr_tail)?;

        if started.elapsed() >= config.ready_timeout {
            let secs = config.ready_timeout.as_secs();
            return Err(InitFailure::new(
                format!("worker wrote no ready sentinel within {secs}s"),
                snapshot(stderr_tail),
            ));
        }
        // The directory watcher fires when the sentinel lands; the sleep
        // keeps this loop correct without one.
        tokio::select! {
            _ = wake.notified() => {}
            _ = sleep(config.ready_poll_interval) => {}
        }
    }
}

/// Fail initialization when this generation was superseded or its worker
/// already exited.
fn check_generation_live(
    inner: &Arc<Inner>,
    gen: u64,
    stderr_tail: &SharedDiagnostics,
) -> Result<(), InitFailure> {
    let mut st = inner.lock_state();
    if st.epoch != gen {
        return Err(InitFailure::superseded());
    }
    let owned = matches!(st.worker.as_ref(), Some(worker) if worker.gen == gen);
    if !owned || !worker_is_live(&mut st, &inner.config) {
        return Err(InitFailure::died(
            st.last_exit_status(gen),
            snapshot(stderr_tail),
        ));
    }
    Ok(())
}

/// Clears the handle and records the exit as soon as the worker terminates,
/// so calls between polls see the death without waiting out their timeout.
fn spawn_exit_monitor(inner: Arc<Inner>, gen: u64) {
    tokio::spawn(async move {
        loop {
            sleep(EXIT_POLL_INTERVAL).await;
            let mut st = inner.lock_state();
            match st.worker.as_ref() {
                Some(worker) if worker.gen == gen => {}
                _ => break, // replaced or already cleared
            }
            if !worker_is_live(&mut st, &inner.config) {
                break;
            }
        }
    });
}

fn worker_is_live(st: &mut SupervisorState, config: &SupervisorConfig) -> bool {
    let Some(worker) = st.worker.as_mut() else {
        return false;
    };
    match worker.child.try_wait() {
        Ok(None) => true,
        Ok(Some(status)) => {
            record_worker_exit(st, &status, config);
            false
        }
        Err(err) => {
            debug!(worker = %config.name, error = %err, "could not poll worker status");
            true
        }
    }
}

fn record_worker_exit(st: &mut SupervisorState, status: &ExitStatus, config: &SupervisorConfig) {
    if let Some(worker) = st.worker.take() {
        let uptime = Utc::now().signed_duration_since(worker.spawned_at);
        warn!(
            worker = %config.name,
            pid = worker.pid,
            %status,
            uptime_s = uptime.num_seconds(),
            "worker process exited"
        );
        st.last_exit = Some(ExitRecord {
            gen: worker.gen,
            status: status.to_string(),
        });
    }
}

/// Forward a worker output stream into the bounded tail buffer (when given
/// one) and the debug log. Runs until the pipe closes.
fn drain_stream<R>(
    stream: R,
    tail: Option<SharedDiagnostics>,
    worker: String,
    stream_name: &'static str,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut stream = stream;
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]);
                    if !chunk.trim().is_empty() {
                        debug!(worker = %worker, stream = stream_name, "{}", chunk.trim_end());
                    }
                    if let Some(tail) = &tail {
                        if let Ok(mut tail) = tail.lock() {
                            tail.push(&chunk);
                        }
                    }
                }
            }
        }
    });
}

/// Watch the response directory so waiting calls wake as soon as the worker
/// writes. Failure to set the watcher up only costs latency; the poll loop
/// stays correct without it.
fn watch_response_dir(
    dir: &Path,
    wake: Arc<Notify>,
    worker: &str,
) -> Option<RecommendedWatcher> {
    let handler = move |event: notify::Result<Event>| {
        if event.is_ok() {
            wake.notify_waiters();
        }
    };
    let mut watcher = match notify::recommended_watcher(handler) {
        Ok(watcher) => watcher,
        Err(err) => {
            warn!(worker, error = %err, "response watcher unavailable, polling only");
            return None;
        }
    };
    if let Err(err) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        warn!(worker, error = %err, "could not watch response directory, polling only");
        return None;
    }
    Some(watcher)
}

fn snapshot(tail: &SharedDiagnostics) -> String {
    tail.lock()
        .map(|buf| buf.tail().to_string())
        .unwrap_or_default()
}

/// Write the payload next to its final path, then move it into place; the
/// rename is the publication point, so the worker never observes a partial
/// request. A failed write or move must not strand the staging file.
async fn publish_atomic(payload: &[u8], request_path: &Path) -> Result<(), SupervisorError> {
    let staging_path = request_path.with_extension("json.tmp");
    if let Err(source) = fs::write(&staging_path, payload).await {
        remove_artifact(&staging_path).await;
        return Err(SupervisorError::ArtifactIo {
            path: staging_path,
            source,
        });
    }
    if let Err(source) = fs::rename(&staging_path, request_path).await {
        remove_artifact(&staging_path).await;
        return Err(SupervisorError::ArtifactIo {
            path: request_path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

async fn remove_artifact(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != ErrorKind::NotFound {
            debug!(path = %path.display(), error = %err, "artifact cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_publish_never_strands_the_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let request_path = dir.path().join("abc.json");
        // A directory squatting on the final path makes the rename fail.
        std::fs::create_dir(&request_path).unwrap();

        let err = publish_atomic(b"{}", &request_path).await.unwrap_err();

        assert!(matches!(err, SupervisorError::ArtifactIo { .. }));
        assert!(!request_path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_publish_lands_the_complete_artifact_only() {
        let dir = tempfile::tempdir().unwrap();
        let request_path = dir.path().join("abc.json");

        publish_atomic(br#"{"image":"x"}"#, &request_path)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&request_path).unwrap(), br#"{"image":"x"}"#);
        assert!(!request_path.with_extension("json.tmp").exists());
    }
}
