//! End-to-end handling of one batch: select, stage, gate, merge.

use std::path::PathBuf;
use std::sync::Arc;

use common::CancelToken;
use tracing::{info, warn};

use crate::batch::Batch;
use crate::config::GateMode;
use crate::environment::{Environment, Region};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::job::{ColmapEngine, JobParams, OpenSplatTrainer, ReconstructionEngine, SplatTrainer};
use crate::merge::{MergeCommitter, MergeOutcome, MergeRecord};
use crate::quality::{QualityGate, ReviewDecision, Reviewer, Verdict};
use crate::selector::{CandidateSelector, Selection};
use crate::staging::{StagingAttempt, StagingOrchestrator};
use crate::state::{AttemptKind, AttemptState};

/// How a batch ended once it reached staging.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub staging: StagingAttempt,
    pub merge: Option<MergeRecord>,
}

impl AttemptOutcome {
    pub fn state(&self) -> AttemptState {
        self.staging.state()
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging.dir().to_path_buf()
    }

    pub fn is_merged(&self) -> bool {
        matches!(&self.merge, Some(record) if record.outcome == MergeOutcome::Committed)
    }

    /// The committed merge, or the error describing why there is none.
    pub fn into_result(self) -> Result<MergeRecord> {
        match self.merge {
            Some(record) if record.outcome == MergeOutcome::Committed => Ok(record),
            _ => Err(self.staging.failure().unwrap_or_else(|| {
                Error::NotFound(format!(
                    "terminal state of attempt {}",
                    self.staging.attempt.id
                ))
            })),
        }
    }
}

enum Decision {
    Commit,
    Reject(String),
}

pub struct Pipeline {
    environment: Arc<Environment>,
    engine: Arc<dyn ReconstructionEngine>,
    trainer: Arc<dyn SplatTrainer>,
    reviewer: Option<Arc<dyn Reviewer>>,
}

impl Pipeline {
    pub fn new(
        environment: Arc<Environment>,
        engine: Arc<dyn ReconstructionEngine>,
        trainer: Arc<dyn SplatTrainer>,
    ) -> Self {
        Self {
            environment,
            engine,
            trainer,
            reviewer: None,
        }
    }

    /// COLMAP and OpenSplat at the binaries named in the environment config.
    pub fn with_external_tools(environment: Arc<Environment>) -> Self {
        let config = environment.config();
        let engine = Arc::new(ColmapEngine::new(&config.colmap_binary));
        let trainer = Arc::new(OpenSplatTrainer::new(&config.opensplat_binary));
        Self::new(environment, engine, trainer)
    }

    pub fn with_reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    pub async fn run(&self, batch: Batch) -> Result<AttemptOutcome> {
        self.run_with_cancel(batch, &CancelToken::new()).await
    }

    /// Folds `batch` into the environment.
    ///
    /// Selection problems (`EmptyBatch`, `BatchTooLarge`, `NoRelevantGroup`)
    /// and a busy region are returned before any job runs. Once staging
    /// started, job failures and rejections end up in the returned outcome;
    /// `CommitFailed` is returned as an error and halts the pipeline.
    pub async fn run_with_cancel(
        &self,
        batch: Batch,
        cancel: &CancelToken,
    ) -> Result<AttemptOutcome> {
        let env = &*self.environment;
        let config = env.config();
        if env.is_halted() {
            return Err(Error::Halted);
        }
        if config.gate_mode != GateMode::Automatic && self.reviewer.is_none() {
            return Err(Error::InvalidConfig(format!(
                "gate mode {} needs a reviewer",
                config.gate_mode
            )));
        }

        let main = env.snapshot();
        let selection =
            CandidateSelector::from(config).select_candidates(&batch, &main.poses, &main.catalog)?;

        let (kind, neighbors) = match selection {
            Selection::Bootstrap => (AttemptKind::Bootstrap, Vec::new()),
            Selection::Expand(plan) => {
                let neighbors = plan
                    .neighbors
                    .iter()
                    .map(|neighbor| {
                        main.dataset
                            .image(&neighbor.image_id)
                            .cloned()
                            .ok_or_else(|| Error::NotFound(format!("main image {}", neighbor.image_id)))
                    })
                    .collect::<Result<Vec<Image>>>()?;
                let kind = AttemptKind::Expansion {
                    base_group: plan.base_group,
                };
                (kind, neighbors)
            }
        };

        let region = match kind.base_group() {
            Some(group) => Region::Group(group),
            None => Region::Bootstrap,
        };
        let _claim = env.claim(region)?;
        // another bootstrap may have committed between snapshot and claim
        if kind == AttemptKind::Bootstrap && !env.snapshot().is_empty() {
            return Err(Error::RegionBusy(region));
        }

        let orchestrator = StagingOrchestrator::new(
            env.staging_dir(),
            self.engine.clone(),
            self.trainer.clone(),
            JobParams::from(config),
            config.job_timeout(),
        );
        let mut staging = orchestrator
            .stage(kind, &neighbors, batch.images, cancel)
            .await?;
        if staging.attempt.is_terminal() {
            warn!(
                attempt = %staging.attempt.id,
                "Attempt ended in {}; staging kept at {}",
                staging.state(),
                staging.dir().display()
            );
            return Ok(AttemptOutcome {
                staging,
                merge: None,
            });
        }

        staging.advance(AttemptState::Gated, None)?;
        let committer = MergeCommitter::new(env);
        let evaluation =
            match QualityGate::from(config).evaluate(&staging.dataset, kind, &env.snapshot().poses) {
                Ok(evaluation) => evaluation,
                Err(err) => {
                    let record =
                        committer.reject(&mut staging, format!("quality evaluation failed: {err}"))?;
                    return Ok(AttemptOutcome {
                        staging,
                        merge: Some(record),
                    });
                }
            };
        staging.evaluation = Some(evaluation.clone());
        staging.persist()?;

        let decision = match evaluation.verdict {
            Verdict::Accept => Decision::Commit,
            Verdict::Reject => Decision::Reject(evaluation.summary()),
            Verdict::NeedsReview => {
                let reviewer = self.reviewer.as_ref().ok_or_else(|| {
                    Error::InvalidConfig("needs_review verdict without a reviewer".to_string())
                })?;
                info!(attempt = %staging.attempt.id, "Waiting for review: {}", evaluation.summary());
                let review = reviewer.review(&staging.dataset, &evaluation).await;
                staging.review = Some(review.clone());
                staging.persist()?;
                match review {
                    ReviewDecision::Accept => Decision::Commit,
                    ReviewDecision::Reject(reason) => Decision::Reject(reason),
                }
            }
        };

        let record = match decision {
            Decision::Commit => committer.commit(&mut staging)?,
            Decision::Reject(reason) => committer.reject(&mut staging, reason)?,
        };

        Ok(AttemptOutcome {
            staging,
            merge: Some(record),
        })
    }
}

#[cfg(test)]
mod tests;
