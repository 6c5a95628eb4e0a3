//! In-memory image records and the conversion lifecycle around the pipeline.
//!
//! A record moves `uploading -> processing -> completed | error`. Conversions are
//! started once per record (on entering `processing`) and run on tokio's blocking pool.
//! Terminal states are never left again; there is no retry.

use crate::pipeline::{self, ConversionError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::{Rng, rng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    Uploading,
    Processing,
    Completed,
    Error,
}

impl ConversionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConversionStatus::Completed | ConversionStatus::Error)
    }

    pub fn can_transition_to(self, next: ConversionStatus) -> bool {
        use ConversionStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Uploading, Processing) | (Processing, Completed) | (Processing, Error)
        )
    }
}

impl fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConversionStatus::Uploading => "uploading",
            ConversionStatus::Processing => "processing",
            ConversionStatus::Completed => "completed",
            ConversionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("image '{0}' not found")]
    NotFound(String),
    #[error("image '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ConversionStatus,
        to: ConversionStatus,
    },
    #[error("image '{0}' has no original bytes")]
    MissingOriginal(String),
}

#[derive(Clone)]
pub struct ImageRecord {
    pub id: String,
    pub filename: String,
    pub pixel_size: u32,
    pub status: ConversionStatus,
    pub created_at: DateTime<Utc>,
    pub content_type: Option<String>,
    pub original: Option<Arc<Vec<u8>>>,
    pub pixel_art: Option<Arc<Vec<u8>>>,
    pub error: Option<String>,
    seq: u64,
}

impl fmt::Debug for ImageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRecord")
            .field("id", &self.id)
            .field("filename", &self.filename)
            .field("pixel_size", &self.pixel_size)
            .field("status", &self.status)
            .finish()
    }
}

/// Byte-free view of a record returned by listing endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ImageSummary {
    pub id: String,
    pub filename: String,
    pub pixel_size: u32,
    pub status: ConversionStatus,
    pub created_at: DateTime<Utc>,
    pub original_bytes: Option<usize>,
    pub pixel_art_bytes: Option<usize>,
    pub error: Option<String>,
}

impl ImageRecord {
    pub fn summary(&self) -> ImageSummary {
        ImageSummary {
            id: self.id.clone(),
            filename: self.filename.clone(),
            pixel_size: self.pixel_size,
            status: self.status,
            created_at: self.created_at,
            original_bytes: self.original.as_ref().map(|b| b.len()),
            pixel_art_bytes: self.pixel_art.as_ref().map(|b| b.len()),
            error: self.error.clone(),
        }
    }
}

/// Outcome written when a record leaves `processing`.
pub enum Outcome {
    Completed(Vec<u8>),
    Failed(String),
}

/// In-memory store of image records. Originals and results stay resident until the
/// record is removed.
#[derive(Default)]
pub struct ImageStore {
    records: RwLock<HashMap<String, ImageRecord>>,
    seq: AtomicU64,
}

fn new_id() -> String {
    format!("{:016x}", rng().random::<u64>())
}

impl ImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, mut record: ImageRecord) -> ImageSummary {
        let mut guard = self.records.write();
        while guard.contains_key(&record.id) {
            record.id = new_id();
        }
        let summary = record.summary();
        guard.insert(record.id.clone(), record);
        summary
    }

    fn blank(&self, filename: &str, pixel_size: u32, status: ConversionStatus) -> ImageRecord {
        ImageRecord {
            id: new_id(),
            filename: filename.to_string(),
            pixel_size,
            status,
            created_at: Utc::now(),
            content_type: None,
            original: None,
            pixel_art: None,
            error: None,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Reserve a record whose bytes arrive later via [`ImageStore::attach_original`].
    pub fn create_upload(&self, filename: &str, pixel_size: u32) -> ImageSummary {
        let record = self.blank(filename, pixel_size, ConversionStatus::Uploading);
        let summary = self.insert(record);
        tracing::debug!(image=%summary.id, filename=%filename, pixel_size, "reserved upload");
        summary
    }

    /// Store original bytes for an `uploading` record and move it to `processing`.
    pub fn attach_original(
        &self,
        id: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
    ) -> Result<ImageSummary, JobError> {
        let mut guard = self.records.write();
        let rec = guard
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        if !rec.status.can_transition_to(ConversionStatus::Processing) {
            return Err(JobError::InvalidTransition {
                id: id.to_string(),
                from: rec.status,
                to: ConversionStatus::Processing,
            });
        }
        rec.original = Some(Arc::new(bytes));
        rec.content_type = content_type;
        rec.status = ConversionStatus::Processing;
        Ok(rec.summary())
    }

    /// Insert a record that already has its bytes; it starts out `processing`.
    pub fn save_image(
        &self,
        filename: &str,
        pixel_size: u32,
        bytes: Vec<u8>,
        content_type: Option<String>,
    ) -> ImageSummary {
        let mut record = self.blank(filename, pixel_size, ConversionStatus::Processing);
        record.original = Some(Arc::new(bytes));
        record.content_type = content_type;
        self.insert(record)
    }

    pub fn get(&self, id: &str) -> Option<ImageRecord> {
        self.records.read().get(id).cloned()
    }

    /// All records, newest first.
    pub fn list(&self) -> Vec<ImageSummary> {
        let guard = self.records.read();
        let mut recs: Vec<&ImageRecord> = guard.values().collect();
        recs.sort_by(|a, b| b.seq.cmp(&a.seq));
        recs.into_iter().map(ImageRecord::summary).collect()
    }

    /// Move a `processing` record to its terminal state.
    pub fn finish(&self, id: &str, outcome: Outcome) -> Result<ConversionStatus, JobError> {
        let next = match outcome {
            Outcome::Completed(_) => ConversionStatus::Completed,
            Outcome::Failed(_) => ConversionStatus::Error,
        };
        let mut guard = self.records.write();
        let rec = guard
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        if !rec.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                id: id.to_string(),
                from: rec.status,
                to: next,
            });
        }
        match outcome {
            Outcome::Completed(bytes) => rec.pixel_art = Some(Arc::new(bytes)),
            Outcome::Failed(msg) => rec.error = Some(msg),
        }
        rec.status = next;
        Ok(next)
    }

    pub fn remove(&self, id: &str) -> Result<(), JobError> {
        self.records
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Convert a `processing` record and record the result.
    ///
    /// Conversion failures land the record in `error` and are reported as
    /// `Ok(ConversionStatus::Error)`; `Err` is reserved for store misuse.
    pub async fn run_conversion(self: Arc<Self>, id: String) -> Result<ConversionStatus, JobError> {
        let (bytes, pixel_size) = {
            let guard = self.records.read();
            let rec = guard.get(&id).ok_or_else(|| JobError::NotFound(id.clone()))?;
            if rec.status != ConversionStatus::Processing {
                return Err(JobError::InvalidTransition {
                    id: id.clone(),
                    from: rec.status,
                    to: ConversionStatus::Completed,
                });
            }
            let bytes = rec
                .original
                .clone()
                .ok_or_else(|| JobError::MissingOriginal(id.clone()))?;
            (bytes, rec.pixel_size)
        };
        tracing::debug!(image=%id, pixel_size, "starting conversion");
        let result: Result<Result<Vec<u8>, ConversionError>, _> =
            tokio::task::spawn_blocking(move || pipeline::convert(&bytes, pixel_size)).await;
        let outcome = match result {
            Ok(Ok(png)) => {
                tracing::info!(image=%id, bytes = png.len(), "conversion completed");
                Outcome::Completed(png)
            }
            Ok(Err(e)) => {
                tracing::warn!(image=%id, error=%e, "conversion failed");
                Outcome::Failed(e.to_string())
            }
            Err(e) => {
                tracing::error!(image=%id, error=%e, "conversion task aborted");
                Outcome::Failed(format!("conversion task aborted: {e}"))
            }
        };
        self.finish(&id, outcome)
    }

    /// Start the conversion for `id` in the background.
    pub fn schedule(self: &Arc<Self>, id: String) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = store.run_conversion(id.clone()).await {
                tracing::warn!(image=%id, error=%e, "conversion could not be recorded");
            }
        });
    }
}
