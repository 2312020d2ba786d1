//! Supervision of long-lived OCR worker processes.
//!
//! A worker is an external daemon that loads its models once and then serves
//! requests over a file-drop protocol: the supervisor writes `{uuid}.json`
//! into a request directory and polls a response directory for the matching
//! reply. [`daemon::WorkerSupervisor`] owns one such process per service and
//! handles spawning, readiness, crash detection and restarts; [`OcrService`]
//! and [`DetectionService`] wrap it with typed requests and responses.

pub mod daemon;
pub mod detection;
pub mod error;
pub mod ocr;
pub mod session;

pub use daemon::{ReadinessProbe, SupervisorConfig, WorkerSupervisor};
pub use detection::{Detection, DetectionOptions, DetectionService};
pub use error::SupervisorError;
pub use ocr::{OcrResult, OcrService};
pub use session::CropStore;
