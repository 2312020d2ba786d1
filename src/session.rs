//! Short-lived storage for detection crops.
//!
//! The detect and OCR steps are separate calls, so crops wait on disk between
//! them under a session id, each session expiring after a TTL. Reads of
//! missing, expired or unreadable sessions all come back `None`; the sweep
//! deletes whatever is expired or unparseable.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// One crop plus its detection geometry, as stored inside a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CropEntry {
    pub cropped_image: String,
    pub bbox: [f64; 4],
    pub original_size: [u32; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// A single-crop session as persisted on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCrop {
    pub session_id: String,
    pub cropped_image: String,
    pub bbox: [f64; 4],
    pub original_size: [u32; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

/// A multi-crop session as persisted on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCropSet {
    pub session_id: String,
    pub images: Vec<CropEntry>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

/// Either stored shape; sessions written by older callers may be single-crop
/// where the reader expects a set, and vice versa.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredFormat {
    Multi(StoredCropSet),
    Single(StoredCrop),
}

impl StoredFormat {
    fn expires_at(&self) -> DateTime<Utc> {
        match self {
            Self::Multi(set) => set.expires_at,
            Self::Single(crop) => crop.expires_at,
        }
    }
}

/// TTL store for crops awaiting a follow-up OCR call.
#[derive(Debug, Clone)]
pub struct CropStore {
    dir: PathBuf,
    ttl: Duration,
}

impl CropStore {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    /// Store under `ktp_cropped_images` in the platform temp root, 30 minute
    /// TTL.
    pub fn in_temp() -> Self {
        Self::new(std::env::temp_dir().join("ktp_cropped_images"), DEFAULT_TTL)
    }

    pub fn generate_session_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Persist a single crop under `session_id`, replacing any previous
    /// session with that id.
    pub async fn store_crop(&self, session_id: &str, crop: CropEntry) -> io::Result<()> {
        let now = Utc::now();
        let stored = StoredCrop {
            session_id: session_id.to_string(),
            cropped_image: crop.cropped_image,
            bbox: crop.bbox,
            original_size: crop.original_size,
            confidence: crop.confidence,
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.write_session(session_id, &stored).await
    }

    /// Persist a set of crops under `session_id`.
    pub async fn store_crops(&self, session_id: &str, images: Vec<CropEntry>) -> io::Result<()> {
        let now = Utc::now();
        let stored = StoredCropSet {
            session_id: session_id.to_string(),
            images,
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.write_session(session_id, &stored).await
    }

    /// The session's crop, or its first crop for a multi-crop session.
    /// Expired sessions are deleted and read as `None`.
    pub async fn get_crop(&self, session_id: &str) -> Option<StoredCrop> {
        match self.read_session(session_id).await? {
            StoredFormat::Single(crop) => Some(crop),
            StoredFormat::Multi(set) => {
                let first = set.images.into_iter().next()?;
                Some(StoredCrop {
                    session_id: set.session_id,
                    cropped_image: first.cropped_image,
                    bbox: first.bbox,
                    original_size: first.original_size,
                    confidence: first.confidence,
                    created_at: set.created_at,
                    expires_at: set.expires_at,
                })
            }
        }
    }

    /// Every crop in the session; a single-crop session reads as a one-entry
    /// set.
    pub async fn get_crops(&self, session_id: &str) -> Option<StoredCropSet> {
        match self.read_session(session_id).await? {
            StoredFormat::Multi(set) => Some(set),
            StoredFormat::Single(crop) => Some(StoredCropSet {
                session_id: crop.session_id,
                images: vec![CropEntry {
                    cropped_image: crop.cropped_image,
                    bbox: crop.bbox,
                    original_size: crop.original_size,
                    confidence: crop.confidence,
                }],
                created_at: crop.created_at,
                expires_at: crop.expires_at,
            }),
        }
    }

    /// Best-effort delete of a session.
    pub async fn delete(&self, session_id: &str) {
        let _ = fs::remove_file(self.session_path(session_id)).await;
    }

    /// Delete every expired or unparseable session file. Returns how many
    /// files were removed.
    pub async fn sweep_expired(&self) -> usize {
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return 0;
        };
        let now = Utc::now();
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if session_is_expired(&path, now).await
                && fs::remove_file(&path).await.is_ok()
            {
                removed += 1;
            }
        }
        removed
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    async fn write_session<T: Serialize>(&self, session_id: &str, stored: &T) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let payload = serde_json::to_vec(stored).map_err(io::Error::other)?;
        fs::write(self.session_path(session_id), payload).await
    }

    async fn read_session(&self, session_id: &str) -> Option<StoredFormat> {
        let path = self.session_path(session_id);
        let bytes = fs::read(&path).await.ok()?;
        let stored: StoredFormat = serde_json::from_slice(&bytes).ok()?;
        if stored.expires_at() < Utc::now() {
            self.delete(session_id).await;
            return None;
        }
        Some(stored)
    }
}

async fn session_is_expired(path: &Path, now: DateTime<Utc>) -> bool {
    let Ok(bytes) = fs::read(path).await else {
        // unreadable files are swept too
        return true;
    };
    match serde_json::from_slice::<StoredFormat>(&bytes) {
        Ok(stored) => stored.expires_at() < now,
        Err(_) => true, // corrupted
    }
}
