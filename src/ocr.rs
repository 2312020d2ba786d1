//! KTP OCR daemon front end.
//!
//! Wraps a [`WorkerSupervisor`] around `scripts/ocr/ocr_daemon.py`, which
//! extracts identity-card fields from an image. The daemon answers either
//! `{success: true, data, raw}` or `{success: false, error}`; that loose
//! shape is validated here into [`OcrResult`] or a typed error.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::daemon::{SupervisorConfig, WorkerSupervisor};
use crate::error::SupervisorError;

/// Fields the daemon extracts from a KTP card. All nullable: a blurry card
/// can yield any subset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrData {
    #[serde(rename = "identityNumber")]
    pub identity_number: Option<String>,
    pub name: Option<String>,
    pub gender: Option<String>,
    pub alamat: Option<String>,
}

/// Raw extraction diagnostics reported alongside the parsed fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OcrRaw {
    pub text_blocks_count: u32,
    pub combined_text: String,
}

/// A successful OCR pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrResult {
    pub data: OcrData,
    pub raw: OcrRaw,
}

#[derive(Debug, Serialize)]
struct OcrRequest<'a> {
    image: &'a str,
}

/// Response artifact as the daemon writes it.
#[derive(Debug, Deserialize)]
struct OcrWire {
    success: bool,
    #[serde(default)]
    data: Option<OcrData>,
    #[serde(default)]
    raw: Option<OcrRaw>,
    #[serde(default)]
    error: Option<String>,
}

impl OcrWire {
    fn into_result(self) -> Result<OcrResult, SupervisorError> {
        if !self.success {
            return Err(SupervisorError::Worker(
                self.error
                    .unwrap_or_else(|| "unknown worker error".to_string()),
            ));
        }
        match (self.data, self.raw) {
            (Some(data), Some(raw)) => Ok(OcrResult { data, raw }),
            _ => Err(SupervisorError::Worker(
                "success response missing data/raw fields".to_string(),
            )),
        }
    }
}

/// OCR service over one supervised daemon.
#[derive(Clone)]
pub struct OcrService {
    supervisor: WorkerSupervisor,
}

impl OcrService {
    /// Service with the stock daemon layout under `project_root`.
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        let root = project_root.as_ref();
        Self::with_config(SupervisorConfig::new(
            "ocr",
            root,
            root.join("scripts/ocr/ocr_daemon.py"),
            std::env::temp_dir().join("ocr_requests"),
            std::env::temp_dir().join("ocr_responses"),
        ))
    }

    /// Service over an explicitly configured supervisor.
    pub fn with_config(config: SupervisorConfig) -> Self {
        Self {
            supervisor: WorkerSupervisor::new(config),
        }
    }

    /// Run OCR over raw image bytes.
    pub async fn process_image(&self, image: &[u8]) -> Result<OcrResult, SupervisorError> {
        let encoded = BASE64.encode(image);
        let request = OcrRequest { image: &encoded };
        let wire: OcrWire = self.supervisor.process(&request).await?;
        wire.into_result()
    }

    /// Spawn the daemon ahead of the first request.
    pub async fn ensure_ready(&self) -> Result<(), SupervisorError> {
        self.supervisor.ensure_ready().await
    }

    /// Kill and re-initialize the daemon.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        self.supervisor.restart().await
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }
}
