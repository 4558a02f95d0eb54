//! Assembles bounded staging datasets and drives the external jobs on them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::file_utils::{recreate_dir, remove_dir_if_exists};
use common::CancelToken;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::dataset::{Dataset, DatasetKind, DatasetStatus};
use crate::error::{Error, IoResultExt, Result};
use crate::image::Image;
use crate::job::{
    JobKind, JobParams, JobRequest, JobResult, ReconstructionEngine, ReconstructionRun,
    SplatTrainer,
};
use crate::quality::{Evaluation, ReviewDecision};
use crate::state::{Attempt, AttemptKind, AttemptState};

pub const ATTEMPT_FILE: &str = "attempt.yaml";

/// One staging attempt: its state machine, its dataset and everything the
/// external jobs and the gate reported. Persisted as `attempt.yaml` in the
/// staging directory after every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingAttempt {
    pub attempt: Attempt,
    pub dataset: Dataset,
    #[serde(default)]
    pub runs: Vec<ReconstructionRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<Evaluation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewDecision>,
}

impl StagingAttempt {
    pub fn dir(&self) -> &Path {
        &self.dataset.root
    }

    pub fn state(&self) -> AttemptState {
        self.attempt.state
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(ATTEMPT_FILE);
        common::serde::read_file(&path).map_err(|err| Error::format(&path, err))
    }

    pub fn persist(&self) -> Result<()> {
        let path = self.dir().join(ATTEMPT_FILE);
        common::serde::write_file_atomic(&path, self).map_err(|err| Error::format(&path, err))
    }

    /// Moves the attempt forward and records the new state on disk.
    pub fn advance(&mut self, to: AttemptState, note: Option<String>) -> Result<()> {
        self.attempt.advance(to, note)?;
        self.persist()
    }

    /// The pipeline error matching a terminal failure state.
    pub fn failure(&self) -> Option<Error> {
        let attempt_id = self.attempt.id;
        let reason = self
            .attempt
            .last_note()
            .unwrap_or("no detail recorded")
            .to_string();

        match self.attempt.state {
            AttemptState::ReconstructionFailed => {
                Some(Error::ReconstructionFailed { attempt_id, reason })
            }
            AttemptState::TrainingFailed => Some(Error::TrainingFailed { attempt_id, reason }),
            AttemptState::Rejected => Some(Error::QualityRejected { attempt_id, reason }),
            _ => None,
        }
    }

    /// Deletes the staging files once the attempt was merged or rejected.
    pub fn discard(&mut self) -> Result<()> {
        remove_dir_if_exists(&self.dataset.root).at_path(&self.dataset.root)?;
        self.dataset.status = DatasetStatus::Discarded;
        Ok(())
    }
}

pub struct StagingOrchestrator {
    staging_root: PathBuf,
    engine: Arc<dyn ReconstructionEngine>,
    trainer: Arc<dyn SplatTrainer>,
    params: JobParams,
    timeout: Duration,
}

impl StagingOrchestrator {
    pub fn new(
        staging_root: impl Into<PathBuf>,
        engine: Arc<dyn ReconstructionEngine>,
        trainer: Arc<dyn SplatTrainer>,
        params: JobParams,
        timeout: Duration,
    ) -> Self {
        Self {
            staging_root: staging_root.into(),
            engine,
            trainer,
            params,
            timeout,
        }
    }

    /// Builds a fresh staging dataset from `neighbors` (copied, still owned by
    /// main) and `new_images` (owned by staging from here on), reconstructs it
    /// and trains a splat from it.
    ///
    /// Job failures end the attempt in `reconstruction_failed` or
    /// `training_failed` with the staging directory left for inspection; only
    /// errors recording the attempt itself are returned as `Err`.
    pub async fn stage(
        &self,
        kind: AttemptKind,
        neighbors: &[Image],
        new_images: Vec<Image>,
        cancel: &CancelToken,
    ) -> Result<StagingAttempt> {
        let attempt = Attempt::new(kind);
        let root = self.staging_root.join(attempt.id.simple());
        // a directory left by an earlier attempt must never feed this one
        recreate_dir(&root).at_path(&root)?;

        let mut staging = StagingAttempt {
            attempt,
            dataset: Dataset::new(DatasetKind::Staging, root),
            runs: Vec::new(),
            evaluation: None,
            review: None,
        };
        staging.persist()?;

        info!(
            attempt = %staging.attempt.id,
            "Staging {} new images with {} neighbours",
            new_images.len(),
            neighbors.len()
        );

        staging.advance(AttemptState::Copying, None)?;
        if let Err(err) = Self::copy_inputs(&mut staging.dataset, neighbors, new_images) {
            warn!(attempt = %staging.attempt.id, "Copying inputs failed: {err}");
            staging.advance(AttemptState::ReconstructionFailed, Some(err.to_string()))?;
            return Ok(staging);
        }

        staging.advance(AttemptState::Reconstructing, None)?;
        let result = self
            .run_job(&mut staging, JobKind::Reconstruction, cancel)
            .await;
        match result {
            Ok(model) => {
                staging.dataset.artifacts.sparse_model = Some(model);
                staging.dataset.status = DatasetStatus::Reconstructed;
                staging.advance(AttemptState::Reconstructed, None)?;
            }
            Err(err) => {
                error!(attempt = %staging.attempt.id, "Reconstruction failed: {err}");
                staging.advance(AttemptState::ReconstructionFailed, Some(err.to_string()))?;
                return Ok(staging);
            }
        }

        staging.advance(AttemptState::Training, None)?;
        let result = self.run_job(&mut staging, JobKind::Training, cancel).await;
        match result {
            Ok(splat) => {
                staging.dataset.artifacts.splat = Some(splat);
                staging.dataset.status = DatasetStatus::Trained;
                staging.advance(AttemptState::Trained, None)?;
            }
            Err(err) => {
                error!(attempt = %staging.attempt.id, "Training failed: {err}");
                staging.advance(AttemptState::TrainingFailed, Some(err.to_string()))?;
            }
        }

        Ok(staging)
    }

    /// On failure every image of the batch is still recorded in the staging
    /// dataset, copied or not, so none is lost.
    fn copy_inputs(dataset: &mut Dataset, neighbors: &[Image], new_images: Vec<Image>) -> Result<()> {
        for neighbor in neighbors {
            if let Err(err) = dataset.copy_neighbor(neighbor) {
                for image in new_images {
                    dataset.insert_image(image);
                }
                return Err(err);
            }
        }

        let mut pending = new_images.into_iter();
        while let Some(image) = pending.next() {
            let fallback = image.clone();
            if let Err(err) = dataset.adopt_image(image) {
                dataset.insert_image(fallback);
                for image in pending {
                    dataset.insert_image(image);
                }
                return Err(err);
            }
        }

        Ok(())
    }

    async fn run_job(
        &self,
        staging: &mut StagingAttempt,
        kind: JobKind,
        cancel: &CancelToken,
    ) -> JobResult<PathBuf> {
        let mut run = ReconstructionRun::new(kind, staging.dataset.id, self.params.clone());
        run.start();

        let request = JobRequest {
            dataset_dir: staging.dataset.root.clone(),
            params: self.params.clone(),
            timeout: self.timeout,
            cancel: cancel.clone(),
        };
        let result = match kind {
            JobKind::Reconstruction => self.engine.reconstruct(request).await,
            JobKind::Training => self.trainer.train(request).await,
        };

        run.finish(&result);
        staging.runs.push(run);
        result
    }
}
