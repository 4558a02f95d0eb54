//! Error types for the reconstruction-and-merge pipeline.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::dataset::DatasetId;
use crate::environment::Region;
use crate::image::ImageId;
use crate::job::JobError;
use crate::state::{AttemptId, AttemptState};

#[derive(Debug, Error)]
pub enum Error {
    #[error("No resolved group lies within {threshold} of the batch position")]
    NoRelevantGroup { threshold: f64 },

    #[error("Batch of {count} images exceeds the staging cap of {cap}")]
    BatchTooLarge { count: usize, cap: usize },

    #[error("Reconstruction failed for attempt {attempt_id}: {reason}")]
    ReconstructionFailed { attempt_id: AttemptId, reason: String },

    #[error("Splat training failed for attempt {attempt_id}: {reason}")]
    TrainingFailed { attempt_id: AttemptId, reason: String },

    #[error("Attempt {attempt_id} rejected by the quality gate: {reason}")]
    QualityRejected { attempt_id: AttemptId, reason: String },

    #[error("Commit of staging dataset {staging_id} failed and was rolled back: {reason}")]
    CommitFailed { staging_id: DatasetId, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("Batch contains no images")]
    EmptyBatch,

    #[error("Region {0} already has a staging attempt in flight")]
    RegionBusy(Region),

    #[error("Illegal attempt transition {from} -> {to}")]
    InvalidTransition {
        from: AttemptState,
        to: AttemptState,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Pipeline halted after a failed commit; clear the halt once diagnosed")]
    Halted,

    #[error("Image {0} is already indexed at a different position")]
    PoseConflict(ImageId),

    #[error("Image {0} is already part of the dataset")]
    DuplicateImage(ImageId),

    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read or write '{path}': {message}")]
    Format { path: PathBuf, message: String },

    #[error("Malformed sparse model at '{path}': {message}")]
    Model { path: PathBuf, message: String },

    #[error(transparent)]
    Job(#[from] JobError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn format(path: &Path, err: anyhow::Error) -> Self {
        Error::Format {
            path: path.to_path_buf(),
            message: format!("{err:#}"),
        }
    }

    /// Expected pipeline outcomes a caller may retry with different
    /// parameters. `CommitFailed` is the one fatal pipeline error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NoRelevantGroup { .. }
                | Error::BatchTooLarge { .. }
                | Error::ReconstructionFailed { .. }
                | Error::TrainingFailed { .. }
                | Error::QualityRejected { .. }
                | Error::RegionBusy(_)
        )
    }
}

pub trait IoResultExt<T> {
    fn at_path(self, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at_path(self, path: &Path) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
