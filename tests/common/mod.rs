//! Shared fixtures: throwaway artifact directories plus shell scripts that
//! stand in for the Python daemons. Each script receives the request and
//! response directories as its first two arguments, exactly like the real
//! workers.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ktp_ocr::SupervisorConfig;

/// Write a stand-in worker script and make it executable.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Supervisor configuration with timings tightened for tests. `/bin/sh` runs
/// the stand-in scripts directly, skipping interpreter resolution.
pub fn test_config(name: &str, root: &Path, script: PathBuf) -> SupervisorConfig {
    let mut config = SupervisorConfig::new(
        name,
        root,
        script,
        root.join("requests"),
        root.join("responses"),
    );
    config.interpreter = Some(PathBuf::from("/bin/sh"));
    config.settle_window = Duration::from_millis(300);
    config.ready_poll_interval = Duration::from_millis(50);
    config.ready_timeout = Duration::from_secs(10);
    config.publish_yield = Duration::from_millis(20);
    config.response_poll_interval = Duration::from_millis(25);
    config.response_timeout = Duration::from_secs(2);
    config
}

/// Number of `.json` artifacts currently in `dir`. Missing directories count
/// as empty.
pub fn json_artifacts(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
        .count()
}

/// Lines written to a worker-side counter file so far.
pub fn counted_lines(path: &Path) -> usize {
    fs::read_to_string(path)
        .map(|contents| contents.lines().count())
        .unwrap_or(0)
}

/// Serves forever: consumes each request, extracts its `image` field into
/// `$img`, and answers with the output of `respond` (one shell command).
pub fn serving_worker(respond: &str) -> String {
    format!(
        r#"#!/bin/sh
req="$1"; resp="$2"
while :; do
  for f in "$req"/*.json; do
    [ -f "$f" ] || continue
    id=$(basename "$f" .json)
    img=$(sed 's/.*"image":"\([^"]*\)".*/\1/' "$f")
    rm -f "$f"
    {respond} > "$resp/$id.json.part"
    mv "$resp/$id.json.part" "$resp/$id.json"
  done
  sleep 0.05
done
"#
    )
}

/// Echoes the request's `image` field back as `combined_text`.
pub fn echo_worker() -> String {
    serving_worker(r#"printf '{"success":true,"combined_text":"%s"}' "$img""#)
}

/// Reports a worker-level failure for every request.
pub fn failing_worker() -> String {
    serving_worker(r#"printf '{"success":false,"error":"no text found"}'"#)
}

/// Starts, then never consumes or answers anything.
pub fn silent_worker() -> String {
    "#!/bin/sh\nwhile :; do sleep 0.1; done\n".to_string()
}

/// Appends one line to the counter file (third argument) per spawn, then
/// serves like the echo worker.
pub fn counting_echo_worker() -> String {
    echo_worker().replacen("#!/bin/sh\n", "#!/bin/sh\necho spawned >> \"$3\"\n", 1)
}

/// Appends one line to the counter file per spawn, then idles silently.
pub fn counting_silent_worker() -> String {
    "#!/bin/sh\necho spawned >> \"$3\"\nwhile :; do sleep 0.1; done\n".to_string()
}

/// Consumes the first request and exits without answering it.
pub fn consume_then_exit_worker() -> String {
    r#"#!/bin/sh
req="$1"
while :; do
  for f in "$req"/*.json; do
    [ -f "$f" ] || continue
    rm -f "$f"
    exit 3
  done
  sleep 0.05
done
"#
    .to_string()
}

/// Prints to stderr and dies immediately, long before any settle window.
pub fn early_exit_worker(stderr_message: &str) -> String {
    format!("#!/bin/sh\necho '{stderr_message}' >&2\nexit 7\n")
}

/// Writes its own pid to the file given as third argument, then serves like
/// the echo worker; lets a test kill the worker out from under the
/// supervisor.
pub fn pid_reporting_echo_worker() -> String {
    echo_worker().replacen("#!/bin/sh\n", "#!/bin/sh\necho $$ > \"$3\"\n", 1)
}

/// Sleeps briefly, announces readiness through the sentinel file, then serves
/// like the echo worker.
pub fn ready_file_worker() -> String {
    echo_worker().replacen("#!/bin/sh\n", "#!/bin/sh\nsleep 0.2\n: > \"$2/.ready\"\n", 1)
}

/// Answers the first request with a truncated artifact written in place, then
/// replaces it with the complete response shortly after.
pub fn partial_then_complete_worker() -> String {
    r#"#!/bin/sh
req="$1"; resp="$2"
while :; do
  for f in "$req"/*.json; do
    [ -f "$f" ] || continue
    id=$(basename "$f" .json)
    rm -f "$f"
    printf '{"success":tr' > "$resp/$id.json"
    sleep 0.3
    printf '{"success":true,"combined_text":"late"}' > "$resp/$id.json.part"
    mv "$resp/$id.json.part" "$resp/$id.json"
  done
  sleep 0.05
done
"#
    .to_string()
}
