//! Worker daemon supervision.
//!
//! A [`WorkerSupervisor`] owns one long-lived external worker process with an
//! expensive one-time model load and mediates all traffic with it through a
//! file-drop protocol: requests are `{uuid}.json` artifacts in a request
//! directory, responses are `{uuid}.json` artifacts in a response directory.

mod config;
mod diagnostics;
mod supervisor;

pub use config::{resolve_model_path, ReadinessProbe, SupervisorConfig, READY_SENTINEL};
pub use diagnostics::DiagnosticBuffer;
pub use supervisor::WorkerSupervisor;
