//! Quality gate for staged reconstructions.
//!
//! The heuristic looks at how many new images the engine registered, the
//! mean reprojection error and, for expansions, how well the staging frame
//! aligns onto the main frame through neighbour anchors. Failures that leave
//! no way to place the new images (nothing registered, no usable alignment)
//! reject in every mode; threshold misses are the part a reviewer may judge.

use std::future::Future;
use std::pin::Pin;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::{debug, info};

use crate::alignment::{estimate_similarity, Similarity};
use crate::colmap::{ModelStats, SparseModel};
use crate::config::{GateMode, PipelineConfig};
use crate::dataset::Dataset;
use crate::error::Result;
use crate::image::ImageId;
use crate::pose_index::PoseIndex;
use crate::state::AttemptKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Verdict {
    Accept,
    Reject,
    NeedsReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlacedImage {
    pub image_id: ImageId,
    /// Camera centre mapped into the main frame.
    pub position: DVec3,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlignmentSummary {
    pub anchors: usize,
    pub scale: f64,
    pub rms_residual: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub new_images: usize,
    pub recovered_new: usize,
    pub recovered_ratio: f64,
    pub model: ModelStats,
    pub quality_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alignment: Option<AlignmentSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub verdict: Verdict,
    /// Why the heuristic would not accept; empty on a clean pass.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<String>,
    pub metrics: QualityMetrics,
    /// New images with a recovered position, in main-frame coordinates.
    #[serde(default)]
    pub placed: Vec<PlacedImage>,
}

impl Evaluation {
    pub fn summary(&self) -> String {
        if self.findings.is_empty() {
            format!(
                "{} of {} new images recovered, score {:.1}",
                self.metrics.recovered_new, self.metrics.new_images, self.metrics.quality_score
            )
        } else {
            self.findings.join("; ")
        }
    }
}

// === Review ===

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum ReviewDecision {
    Accept,
    Reject(String),
}

pub type ReviewFuture<'a> = Pin<Box<dyn Future<Output = ReviewDecision> + Send + 'a>>;

/// External decision maker for `needs_review` verdicts. The pipeline blocks
/// on it with the attempt held in `gated`.
pub trait Reviewer: Send + Sync {
    fn review<'a>(&'a self, staging: &'a Dataset, evaluation: &'a Evaluation) -> ReviewFuture<'a>;
}

// === Gate ===

#[derive(Debug, Clone, PartialEq)]
pub struct QualityGate {
    pub mode: GateMode,
    pub accept_ratio: f64,
    pub max_reprojection_error: f64,
    pub min_anchors: usize,
    pub max_alignment_residual: f64,
}

impl From<&PipelineConfig> for QualityGate {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            mode: config.gate_mode,
            accept_ratio: config.quality_accept_ratio,
            max_reprojection_error: config.max_reprojection_error,
            min_anchors: config.min_alignment_anchors,
            max_alignment_residual: config.max_alignment_residual,
        }
    }
}

impl QualityGate {
    /// Judges a reconstructed staging dataset. `main_poses` supplies anchor
    /// positions for expansions; bootstrap output defines the main frame.
    pub fn evaluate(
        &self,
        staging: &Dataset,
        kind: AttemptKind,
        main_poses: &PoseIndex,
    ) -> Result<Evaluation> {
        let model = match &staging.artifacts.sparse_model {
            Some(dir) => SparseModel::load(dir)?,
            None => SparseModel::default(),
        };
        let stats = model.stats();

        let mut recovered: Vec<(ImageId, DVec3)> = Vec::new();
        let mut anchor_source: Vec<DVec3> = Vec::new();
        let mut anchor_target: Vec<DVec3> = Vec::new();
        for registered in model.images.iter() {
            let Some(image_id) = staging.image_by_stored_name(&registered.name) else {
                debug!("Ignoring unknown image '{}' in sparse model", registered.name);
                continue;
            };
            if staging.contains(&image_id) {
                recovered.push((image_id, registered.center()));
            } else if let Some(main_position) = main_poses.position(&image_id) {
                anchor_source.push(registered.center());
                anchor_target.push(main_position);
            }
        }

        let new_images = staging.len();
        let recovered_ratio = if new_images == 0 {
            0.0
        } else {
            recovered.len() as f64 / new_images as f64
        };
        let mut metrics = QualityMetrics {
            new_images,
            recovered_new: recovered.len(),
            recovered_ratio,
            model: stats,
            quality_score: stats.quality_score(staging.input_len()),
            alignment: None,
        };

        let mut fatal: Vec<String> = Vec::new();
        let mut findings: Vec<String> = Vec::new();

        if recovered.is_empty() {
            fatal.push("no new image was registered".to_string());
        }

        let transform = match kind {
            AttemptKind::Bootstrap => Some(Similarity::IDENTITY),
            AttemptKind::Expansion { .. } => {
                if anchor_source.len() < self.min_anchors {
                    fatal.push(format!(
                        "{} alignment anchors, need {}",
                        anchor_source.len(),
                        self.min_anchors
                    ));
                    None
                } else {
                    match estimate_similarity(&anchor_source, &anchor_target) {
                        None => {
                            fatal.push("alignment anchors are degenerate".to_string());
                            None
                        }
                        Some(alignment) => {
                            metrics.alignment = Some(AlignmentSummary {
                                anchors: alignment.anchors,
                                scale: alignment.transform.scale,
                                rms_residual: alignment.rms_residual,
                            });
                            if alignment.rms_residual > self.max_alignment_residual {
                                fatal.push(format!(
                                    "alignment residual {:.3} exceeds {:.3}",
                                    alignment.rms_residual, self.max_alignment_residual
                                ));
                                None
                            } else {
                                Some(alignment.transform)
                            }
                        }
                    }
                }
            }
        };

        // bootstrap output defines the frame and has no baseline to hold it to
        if matches!(kind, AttemptKind::Expansion { .. }) {
            if recovered_ratio < self.accept_ratio {
                findings.push(format!(
                    "recovered {} of {} new images ({:.0}%), need {:.0}%",
                    recovered.len(),
                    new_images,
                    recovered_ratio * 100.0,
                    self.accept_ratio * 100.0
                ));
            }
            if stats.mean_reprojection_error > self.max_reprojection_error {
                findings.push(format!(
                    "mean reprojection error {:.2}px exceeds {:.2}px",
                    stats.mean_reprojection_error, self.max_reprojection_error
                ));
            }
        }

        let placed = match transform {
            Some(transform) => recovered
                .iter()
                .map(|(image_id, center)| PlacedImage {
                    image_id: *image_id,
                    position: transform.apply(*center),
                })
                .collect(),
            None => Vec::new(),
        };

        let verdict = if !fatal.is_empty() {
            Verdict::Reject
        } else if kind == AttemptKind::Bootstrap {
            // the first batch is committed directly
            Verdict::Accept
        } else {
            match (findings.is_empty(), self.mode) {
                (_, GateMode::Manual) => Verdict::NeedsReview,
                (false, _) => Verdict::Reject,
                (true, GateMode::Assisted) => Verdict::NeedsReview,
                (true, GateMode::Automatic) => Verdict::Accept,
            }
        };

        fatal.extend(findings);
        let evaluation = Evaluation {
            verdict,
            findings: fatal,
            metrics,
            placed,
        };
        info!(
            dataset = %staging.id,
            "Quality gate: {verdict} ({})",
            evaluation.summary()
        );

        Ok(evaluation)
    }
}
