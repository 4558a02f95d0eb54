//! Folds accepted staging results into the main dataset.
//!
//! A commit prepares the next main state on a copy, copies files into
//! `main/`, and becomes real only when `state.yaml` is replaced. Anything
//! failing before that point removes the files it created, leaves main as it
//! was and halts the pipeline: a failed commit means the merge step itself is
//! broken.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use common::file_utils::{copy_dir_recursive, remove_dir_if_exists};
use common::id_type;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::{error, info, warn};

use crate::catalog::GroupId;
use crate::dataset::{DatasetId, SPARSE_DIR, SPLAT_FILE};
use crate::environment::{Environment, MainState};
use crate::error::{Error, IoResultExt, Result};
use crate::image::ImageId;
use crate::quality::{Evaluation, PlacedImage, ReviewDecision, Verdict};
use crate::staging::StagingAttempt;
use crate::state::{AttemptId, AttemptKind, AttemptState};

id_type!(MergeId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MergeOutcome {
    Committed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub id: MergeId,
    pub attempt_id: AttemptId,
    pub staging_id: DatasetId,
    pub main_id: DatasetId,
    pub outcome: MergeOutcome,
    pub at: DateTime<Utc>,
    /// Heuristic verdict before any review.
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_group: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<ImageId>,
    /// Already in main from an earlier run of the same commit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub duplicates: Vec<ImageId>,
    /// New images the reconstruction could not place; left out of main.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unplaced: Vec<ImageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Files and directories created by a commit in progress.
#[derive(Debug, Default)]
struct CreatedFiles {
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
}

impl CreatedFiles {
    fn roll_back(self) {
        for file in self.files.iter().rev() {
            if let Err(err) = fs::remove_file(file) {
                warn!("Rollback could not remove {}: {err}", file.display());
            }
        }
        for dir in self.dirs.iter().rev() {
            if let Err(err) = remove_dir_if_exists(dir) {
                warn!("Rollback could not remove {}: {err}", dir.display());
            }
        }
    }
}

pub struct MergeCommitter<'a> {
    environment: &'a Environment,
}

impl<'a> MergeCommitter<'a> {
    pub fn new(environment: &'a Environment) -> Self {
        Self { environment }
    }

    /// Moves the placed new images of an accepted attempt into main, indexes
    /// their positions, updates the catalog and records the merge.
    ///
    /// The attempt must be `gated` with an evaluation that accepts it, either
    /// outright or through an accepting review. Nothing in main changes
    /// otherwise. Re-running a commit that already went through returns the
    /// original record and changes nothing.
    pub fn commit(&self, staging: &mut StagingAttempt) -> Result<MergeRecord> {
        let env = self.environment;
        let _lock = env.lock_commits();
        if env.is_halted() {
            return Err(Error::Halted);
        }

        let current = env.snapshot();
        if let Some(existing) = current.merges.iter().find(|record| {
            record.staging_id == staging.dataset.id && record.outcome == MergeOutcome::Committed
        }) {
            if !matches!(staging.state(), AttemptState::Gated | AttemptState::Merged) {
                return Err(Error::InvalidTransition {
                    from: staging.state(),
                    to: AttemptState::Merged,
                });
            }
            info!(
                attempt = %staging.attempt.id,
                "Staging dataset {} was already committed as {}",
                staging.dataset.id,
                existing.id
            );
            let existing = existing.clone();
            self.finish(staging, AttemptState::Merged)?;
            return Ok(existing);
        }

        require_gated(staging, AttemptState::Merged)?;
        let evaluation = approved_evaluation(staging)?;

        let mut next = MainState::clone(&current);
        let mut created = CreatedFiles::default();
        let merge_id = MergeId::unique();

        let prepared = self.prepare(staging, &evaluation.placed, merge_id, &mut next, &mut created);
        let mut record = match prepared {
            Ok(record) => record,
            Err(err) => return Err(self.fail(staging, created, err)),
        };
        record.verdict = evaluation.verdict;
        record.review = staging.review.clone();
        next.merges.push(record.clone());

        if let Err(err) = env.publish(next) {
            return Err(self.fail(staging, created, err));
        }

        info!(
            attempt = %staging.attempt.id,
            "Committed {} images from staging {} as merge {}",
            record.added.len(),
            staging.dataset.id,
            record.id
        );
        env.announce(&record);
        self.finish(staging, AttemptState::Merged)?;

        Ok(record)
    }

    /// Records a rejection and discards the staging dataset. Main images,
    /// poses and groups are untouched.
    pub fn reject(&self, staging: &mut StagingAttempt, reason: String) -> Result<MergeRecord> {
        let env = self.environment;
        let _lock = env.lock_commits();
        if env.is_halted() {
            return Err(Error::Halted);
        }

        require_gated(staging, AttemptState::Rejected)?;

        let current = env.snapshot();
        let record = MergeRecord {
            id: MergeId::unique(),
            attempt_id: staging.attempt.id,
            staging_id: staging.dataset.id,
            main_id: current.dataset.id,
            outcome: MergeOutcome::Rejected,
            at: Utc::now(),
            verdict: staging
                .evaluation
                .as_ref()
                .map(|evaluation| evaluation.verdict)
                .unwrap_or(Verdict::Reject),
            review: staging.review.clone(),
            base_group: staging.attempt.kind.base_group(),
            added: Vec::new(),
            duplicates: Vec::new(),
            unplaced: staging.dataset.image_ids(),
            model_dir: None,
            reason: Some(reason.clone()),
        };

        let mut next = MainState::clone(&current);
        next.merges.push(record.clone());
        env.publish(next)?;

        info!(attempt = %staging.attempt.id, "Rejected staging {}: {reason}", staging.dataset.id);
        env.announce(&record);

        staging.attempt.advance(AttemptState::Rejected, Some(reason))?;
        if let Err(err) = staging.discard() {
            warn!(attempt = %staging.attempt.id, "Could not remove staging files: {err}");
        }

        Ok(record)
    }

    fn prepare(
        &self,
        staging: &StagingAttempt,
        placed: &[PlacedImage],
        merge_id: MergeId,
        next: &mut MainState,
        created: &mut CreatedFiles,
    ) -> Result<MergeRecord> {
        let config = self.environment.config();
        let kind = staging.attempt.kind;
        let images_dir = next.dataset.images_dir();

        if kind == AttemptKind::Bootstrap && !next.is_empty() {
            return Err(Error::CommitFailed {
                staging_id: staging.dataset.id,
                reason: "main dataset is no longer empty for a bootstrap commit".to_string(),
            });
        }
        // a bootstrap reconstruction is one connected model, so one group
        let mut target_group = kind.base_group();
        if let Some(base_group) = target_group {
            if next.catalog.group(base_group).is_none() {
                return Err(Error::NotFound(format!("base group {base_group}")));
            }
        }

        let mut added = Vec::new();
        let mut duplicates = Vec::new();
        let mut poses = Vec::new();

        for placement in placed {
            if next.dataset.contains(&placement.image_id) {
                duplicates.push(placement.image_id);
                continue;
            }
            let mut image = staging
                .dataset
                .image(&placement.image_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("staged image {}", placement.image_id)))?;

            let target = images_dir.join(image.stored_name());
            if !target.exists() {
                fs::copy(&image.file, &target).at_path(&image.file)?;
                created.files.push(target.clone());
            }

            image.file = target;
            image.position = Some(placement.position);
            let group = match target_group {
                Some(group) => {
                    next.catalog.join_group(group, &image)?;
                    group
                }
                None => {
                    let group = next.catalog.assign_group(
                        &image,
                        image.hint,
                        config.group_proximity_threshold,
                        config.distance_metric,
                    );
                    target_group = Some(group);
                    group
                }
            };
            image.group = Some(group);

            poses.push((image.id, placement.position));
            added.push(image.id);
            next.dataset.insert_image(image);
        }
        next.poses.bulk_insert(poses)?;

        let unplaced: Vec<ImageId> = staging
            .dataset
            .images()
            .map(|image| image.id)
            .filter(|id| !added.contains(id) && !duplicates.contains(id))
            .collect();
        if !unplaced.is_empty() {
            warn!(
                attempt = %staging.attempt.id,
                "{} new images were not placed and stay out of main",
                unplaced.len()
            );
        }

        let model_dir = self.archive_artifacts(staging, merge_id, created)?;
        // only the bootstrap model is in the main frame; expansion models stay
        // in their own frame and are kept as per-merge archives
        if kind == AttemptKind::Bootstrap {
            next.dataset.artifacts.sparse_model = Some(model_dir.join(SPARSE_DIR));
            next.dataset.artifacts.splat = staging
                .dataset
                .artifacts
                .splat
                .as_ref()
                .map(|_| model_dir.join(SPLAT_FILE));
        }

        Ok(MergeRecord {
            id: merge_id,
            attempt_id: staging.attempt.id,
            staging_id: staging.dataset.id,
            main_id: next.dataset.id,
            outcome: MergeOutcome::Committed,
            at: Utc::now(),
            verdict: Verdict::Accept,
            review: None,
            base_group: target_group,
            added,
            duplicates,
            unplaced,
            model_dir: Some(model_dir),
            reason: None,
        })
    }

    /// Copies the staging model and splat to `main/models/<merge-id>/`, the
    /// archive referenced by the merge record.
    fn archive_artifacts(
        &self,
        staging: &StagingAttempt,
        merge_id: MergeId,
        created: &mut CreatedFiles,
    ) -> Result<PathBuf> {
        let model_dir = self.environment.models_dir().join(merge_id.simple());
        fs::create_dir(&model_dir).at_path(&model_dir)?;
        created.dirs.push(model_dir.clone());

        if let Some(sparse) = &staging.dataset.artifacts.sparse_model {
            let target = model_dir.join(SPARSE_DIR);
            copy_dir_recursive(sparse, &target).at_path(sparse)?;
        }
        if let Some(splat) = &staging.dataset.artifacts.splat {
            let target = model_dir.join(SPLAT_FILE);
            fs::copy(splat, &target).at_path(splat)?;
        }

        Ok(model_dir)
    }

    fn fail(&self, staging: &StagingAttempt, created: CreatedFiles, err: Error) -> Error {
        created.roll_back();
        self.environment.halt(&err.to_string());
        error!(
            attempt = %staging.attempt.id,
            "Commit of staging {} failed and was rolled back: {err}",
            staging.dataset.id
        );

        match err {
            err @ Error::CommitFailed { .. } => err,
            err => Error::CommitFailed {
                staging_id: staging.dataset.id,
                reason: err.to_string(),
            },
        }
    }

    fn finish(&self, staging: &mut StagingAttempt, state: AttemptState) -> Result<()> {
        if staging.attempt.state != state {
            staging.attempt.advance(state, None)?;
        }
        if let Err(err) = staging.discard() {
            warn!(attempt = %staging.attempt.id, "Could not remove staging files: {err}");
        }
        Ok(())
    }
}

fn require_gated(staging: &StagingAttempt, to: AttemptState) -> Result<()> {
    let from = staging.state();
    if from != AttemptState::Gated {
        return Err(Error::InvalidTransition { from, to });
    }
    Ok(())
}

/// The evaluation of `staging` if the gate, or a reviewer it deferred to,
/// accepted the attempt.
fn approved_evaluation(staging: &StagingAttempt) -> Result<Evaluation> {
    let attempt_id = staging.attempt.id;
    let evaluation = staging.evaluation.clone().ok_or_else(|| Error::QualityRejected {
        attempt_id,
        reason: "attempt has no quality evaluation".to_string(),
    })?;

    let refusal = match (evaluation.verdict, &staging.review) {
        (Verdict::Accept, _) => None,
        (Verdict::NeedsReview, Some(ReviewDecision::Accept)) => None,
        (Verdict::NeedsReview, Some(ReviewDecision::Reject(reason))) => Some(reason.clone()),
        (Verdict::NeedsReview, None) => Some("awaiting review".to_string()),
        (Verdict::Reject, _) => Some(evaluation.summary()),
    };
    match refusal {
        Some(reason) => Err(Error::QualityRejected { attempt_id, reason }),
        None => Ok(evaluation),
    }
}
