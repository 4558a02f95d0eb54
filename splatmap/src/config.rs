//! Pipeline configuration.
//!
//! A single `PipelineConfig` carries the external-job parameters, the spatial
//! thresholds used by grouping and candidate selection, and the quality-gate
//! policy. Missing fields in a config file fall back to the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use glam::DVec3;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};
use crate::geo::GeoFrame;

/// Feature matching strategy passed to the reconstruction engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MatcherMode {
    /// Every image against every other. Best for small staging sets.
    #[default]
    Exhaustive,
    /// Images matched against their capture-order neighbours.
    Sequential,
    /// Vocabulary-tree retrieval. Needs `vocab_tree_path`.
    VocabTree,
}

/// How the quality gate reaches a verdict.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GateMode {
    /// Heuristic only: accept or reject.
    #[default]
    Automatic,
    /// Every staging result goes to a reviewer.
    Manual,
    /// Heuristic rejects are final; heuristic passes go to a reviewer.
    Assisted,
}

/// Distance used for grouping and nearest-neighbour queries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    /// Ignores the vertical (y) axis.
    Horizontal,
}

impl DistanceMetric {
    pub fn distance(&self, a: DVec3, b: DVec3) -> f64 {
        match self {
            DistanceMetric::Euclidean => a.distance(b),
            DistanceMetric::Horizontal => {
                let d = a - b;
                (d.x * d.x + d.z * d.z).sqrt()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Cap on features extracted per image.
    pub max_features: u32,
    pub matcher_mode: MatcherMode,
    /// Splat training iterations.
    pub training_iterations: u32,

    /// Existing images pulled into each staging set.
    pub neighbor_count: usize,
    /// Upper bound on neighbours plus new images in one staging set.
    pub staging_size_cap: usize,
    /// Maximum distance from a group centroid for an image to join it.
    pub group_proximity_threshold: f64,
    pub distance_metric: DistanceMetric,

    pub gate_mode: GateMode,
    /// Fraction of new images whose pose must be recovered.
    pub quality_accept_ratio: f64,
    /// Mean reprojection error bound in pixels.
    pub max_reprojection_error: f64,
    /// Neighbours registered in both frames needed to align staging into main.
    pub min_alignment_anchors: usize,
    /// RMS alignment residual bound, in main-frame units.
    pub max_alignment_residual: f64,

    /// Per external job.
    pub timeout_seconds: u64,

    pub colmap_binary: PathBuf,
    pub opensplat_binary: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vocab_tree_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geo_frame: Option<GeoFrame>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_features: 1024,
            matcher_mode: MatcherMode::Exhaustive,
            training_iterations: 2000,
            neighbor_count: 20,
            staging_size_cap: 100,
            group_proximity_threshold: 10.0,
            distance_metric: DistanceMetric::Euclidean,
            gate_mode: GateMode::Automatic,
            quality_accept_ratio: 0.8,
            max_reprojection_error: 2.0,
            min_alignment_anchors: 3,
            max_alignment_residual: 0.5,
            timeout_seconds: 3600,
            colmap_binary: PathBuf::from("colmap"),
            opensplat_binary: PathBuf::from("opensplat"),
            vocab_tree_path: None,
            geo_frame: None,
        }
    }
}

impl PipelineConfig {
    /// Loads a `.yaml`, `.yml` or `.json` file and validates it.
    pub fn load(path: &Path) -> Result<Self> {
        let config: PipelineConfig =
            common::serde::read_file(path).map_err(|err| Error::format(path, err))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        common::serde::write_file_atomic(path, self).map_err(|err| Error::format(path, err))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(Error::InvalidConfig(message.to_string()));

        if self.max_features == 0 {
            return invalid("max_features must be positive");
        }
        if self.training_iterations == 0 {
            return invalid("training_iterations must be positive");
        }
        if self.staging_size_cap == 0 {
            return invalid("staging_size_cap must be positive");
        }
        if !(self.group_proximity_threshold > 0.0) {
            return invalid("group_proximity_threshold must be positive");
        }
        if !(0.0..=1.0).contains(&self.quality_accept_ratio) {
            return invalid("quality_accept_ratio must be in [0, 1]");
        }
        if !(self.max_reprojection_error > 0.0) {
            return invalid("max_reprojection_error must be positive");
        }
        if self.min_alignment_anchors < 3 {
            return invalid("min_alignment_anchors must be at least 3");
        }
        if !(self.max_alignment_residual > 0.0) {
            return invalid("max_alignment_residual must be positive");
        }
        if self.timeout_seconds == 0 {
            return invalid("timeout_seconds must be positive");
        }
        if self.matcher_mode == MatcherMode::VocabTree && self.vocab_tree_path.is_none() {
            return invalid("vocab_tree matcher requires vocab_tree_path");
        }
        if let Some(frame) = &self.geo_frame {
            if !(frame.meters_per_unit > 0.0) {
                return invalid("geo_frame.meters_per_unit must be positive");
            }
        }

        Ok(())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.neighbor_count, 20);
        assert_eq!(config.staging_size_cap, 100);
        assert_eq!(config.quality_accept_ratio, 0.8);
        assert_eq!(config.job_timeout(), Duration::from_secs(3600));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let config = PipelineConfig {
            quality_accept_ratio: 1.5,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = PipelineConfig {
            group_proximity_threshold: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PipelineConfig {
            matcher_mode: MatcherMode::VocabTree,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_file_falls_back_to_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pipeline.yaml");
        std::fs::write(
            &path,
            "neighbor_count: 12\nmatcher_mode: sequential\ngate_mode: assisted\n",
        )?;

        let config = PipelineConfig::load(&path)?;
        assert_eq!(config.neighbor_count, 12);
        assert_eq!(config.matcher_mode, MatcherMode::Sequential);
        assert_eq!(config.gate_mode, GateMode::Assisted);
        assert_eq!(config.staging_size_cap, 100);
        Ok(())
    }

    #[test]
    fn save_then_load_json() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pipeline.json");
        let config = PipelineConfig {
            timeout_seconds: 60,
            distance_metric: DistanceMetric::Horizontal,
            ..Default::default()
        };

        config.save(&path)?;
        assert_eq!(PipelineConfig::load(&path)?, config);
        Ok(())
    }

    #[test]
    fn enum_names_parse() {
        assert_eq!(
            MatcherMode::from_str("vocab_tree").unwrap(),
            MatcherMode::VocabTree
        );
        assert_eq!(GateMode::Manual.to_string(), "manual");
    }

    #[test]
    fn horizontal_metric_ignores_height() {
        let a = DVec3::new(0.0, 0.0, 0.0);
        let b = DVec3::new(3.0, 100.0, 4.0);
        assert_eq!(DistanceMetric::Horizontal.distance(a, b), 5.0);
        assert!(DistanceMetric::Euclidean.distance(a, b) > 100.0);
    }
}
