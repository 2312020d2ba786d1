//! KTP detection daemon front end.
//!
//! Wraps a [`WorkerSupervisor`] around `scripts/ocr/ktp_detection_daemon.py`,
//! a YOLO worker that locates the identity card in a photo and returns the
//! cropped card. Unlike the OCR daemon it takes a third startup argument, the
//! model weights path, and a request can ask for every detection above a
//! confidence threshold instead of just the best one.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::daemon::{resolve_model_path, SupervisorConfig, WorkerSupervisor};
use crate::error::SupervisorError;

/// Per-request knobs for [`DetectionService::detect`].
#[derive(Debug, Clone, Default)]
pub struct DetectionOptions {
    /// Return every detection instead of only the most confident one.
    pub return_multiple: bool,
    /// Confidence floor; the daemon defaults to 0.5 when unset.
    pub min_confidence: Option<f64>,
}

/// One cropped card from a multi-detection response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crop {
    /// JPEG crop, base64 encoded.
    pub cropped_image: String,
    /// Bounding box in original-image pixels, `[x1, y1, x2, y2]`.
    pub bbox: [f64; 4],
    pub confidence: f64,
}

/// The best detection in the image.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleDetection {
    pub cropped_image: String,
    pub bbox: [f64; 4],
    /// `[width, height]` of the input image.
    pub original_size: [u32; 2],
    pub confidence: Option<f64>,
}

/// Every detection above the confidence floor.
#[derive(Debug, Clone, PartialEq)]
pub struct MultipleDetections {
    pub crops: Vec<Crop>,
    pub original_size: [u32; 2],
}

/// A validated detection response.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Single(SingleDetection),
    Multiple(MultipleDetections),
}

#[derive(Debug, Serialize)]
struct DetectionRequest<'a> {
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    return_multiple: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_confidence: Option<f64>,
}

/// Response artifact as the daemon writes it.
#[derive(Debug, Deserialize)]
struct DetectionWire {
    success: bool,
    #[serde(default)]
    cropped_image: Option<String>,
    #[serde(default)]
    cropped_images: Option<Vec<Crop>>,
    #[serde(default)]
    bbox: Option<[f64; 4]>,
    #[serde(default)]
    original_size: Option<[u32; 2]>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

impl DetectionWire {
    fn into_result(self) -> Result<Detection, SupervisorError> {
        if !self.success {
            return Err(SupervisorError::Worker(
                self.error
                    .unwrap_or_else(|| "unknown worker error".to_string()),
            ));
        }
        if let Some(crops) = self.cropped_images {
            let original_size = self.original_size.ok_or_else(|| {
                SupervisorError::Worker("success response missing original_size".to_string())
            })?;
            return Ok(Detection::Multiple(MultipleDetections {
                crops,
                original_size,
            }));
        }
        match (self.cropped_image, self.bbox, self.original_size) {
            (Some(cropped_image), Some(bbox), Some(original_size)) => {
                Ok(Detection::Single(SingleDetection {
                    cropped_image,
                    bbox,
                    original_size,
                    confidence: self.confidence,
                }))
            }
            _ => Err(SupervisorError::Worker(
                "invalid detection result format".to_string(),
            )),
        }
    }
}

/// Card detection service over one supervised daemon.
#[derive(Clone)]
pub struct DetectionService {
    supervisor: WorkerSupervisor,
}

impl DetectionService {
    /// Service with the stock daemon layout under `project_root`. The model
    /// weights path is resolved here and handed to the worker at spawn.
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        let root = project_root.as_ref();
        let mut config = SupervisorConfig::new(
            "ktp-detection",
            root,
            root.join("scripts/ocr/ktp_detection_daemon.py"),
            std::env::temp_dir().join("ktp_detection_requests"),
            std::env::temp_dir().join("ktp_detection_responses"),
        );
        config.extra_args = vec![resolve_model_path(root).to_string_lossy().into_owned()];
        Self::with_config(config)
    }

    /// Service over an explicitly configured supervisor.
    pub fn with_config(config: SupervisorConfig) -> Self {
        Self {
            supervisor: WorkerSupervisor::new(config),
        }
    }

    /// Locate the card in raw image bytes.
    pub async fn detect(
        &self,
        image: &[u8],
        options: DetectionOptions,
    ) -> Result<Detection, SupervisorError> {
        let encoded = BASE64.encode(image);
        let request = DetectionRequest {
            image: &encoded,
            return_multiple: options.return_multiple.then_some(true),
            min_confidence: options.min_confidence,
        };
        let wire: DetectionWire = self.supervisor.process(&request).await?;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_detection_parses() {
        let wire: DetectionWire = serde_json::from_str(
            r#"{
                "success": true,
                "cropped_image": "aW1n",
                "bbox": [100.5, 220.0, 860.25, 640.0],
                "original_size": [1280, 960],
                "confidence": 0.91
            }"#,
        )
        .unwrap();

        match wire.into_result().unwrap() {
            Detection::Single(single) => {
                assert_eq!(single.bbox, [100.5, 220.0, 860.25, 640.0]);
                assert_eq!(single.original_size, [1280, 960]);
                assert_eq!(single.confidence, Some(0.91));
            }
            other => panic!("expected single detection, got {other:?}"),
        }
    }

    #[test]
    fn test_confidence_is_optional_on_single_detection() {
        let wire: DetectionWire = serde_json::from_str(
            r#"{
                "success": true,
                "cropped_image": "aW1n",
                "bbox": [0.0, 0.0, 10.0, 10.0],
                "original_size": [100, 100]
            }"#,
        )
        .unwrap();

        match wire.into_result().unwrap() {
            Detection::Single(single) => assert_eq!(single.confidence, None),
            other => panic!("expected single detection, got {other:?}"),
        }
    }

    #[test]
    fn test_multiple_detections_parse() {
        let wire: DetectionWire = serde_json::from_str(
            r#"{
                "success": true,
                "cropped_images": [
                    {"cropped_image": "YQ==", "bbox": [1.0, 2.0, 3.0, 4.0], "confidence": 0.8},
                    {"cropped_image": "Yg==", "bbox": [5.0, 6.0, 7.0, 8.0], "confidence": 0.7}
                ],
                "original_size": [640, 480]
            }"#,
        )
        .unwrap();

        match wire.into_result().unwrap() {
            Detection::Multiple(multiple) => {
                assert_eq!(multiple.crops.len(), 2);
                assert_eq!(multiple.crops[1].confidence, 0.7);
                assert_eq!(multiple.original_size, [640, 480]);
            }
            other => panic!("expected multiple detections, got {other:?}"),
        }
    }

    #[test]
    fn test_failure_maps_to_worker_error() {
        let wire: DetectionWire =
            serde_json::from_str(r#"{"success": false, "error": "No KTP detected in image"}"#)
                .unwrap();

        match wire.into_result() {
            Err(SupervisorError::Worker(message)) => {
                assert_eq!(message, "No KTP detected in image");
            }
            other => panic!("expected worker error, got {other:?}"),
        }
    }

    #[test]
    fn test_success_without_crop_is_rejected() {
        let wire: DetectionWire = serde_json::from_str(r#"{"success": true}"#).unwrap();

        assert!(matches!(
            wire.into_result(),
            Err(SupervisorError::Worker(_))
        ));
    }

    #[test]
    fn test_request_omits_unset_options() {
        let request = DetectionRequest {
            image: "aW1n",
            return_multiple: None,
            min_confidence: None,
        };
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json, serde_json::json!({"image": "aW1n"}));
    }

    #[test]
    fn test_request_carries_options_when_set() {
        let request = DetectionRequest {
            image: "aW1n",
            return_multiple: Some(true),
            min_confidence: Some(0.25),
        };
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(
            json,
            serde_json::json!({"image": "aW1n", "return_multiple": true, "min_confidence": 0.25})
        );
    }
}
