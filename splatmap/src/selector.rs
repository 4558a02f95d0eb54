use glam::DVec3;
use tracing::{debug, info};

use crate::batch::Batch;
use crate::catalog::{GroupCatalog, GroupId};
use crate::config::{DistanceMetric, PipelineConfig};
use crate::error::{Error, Result};
use crate::geo::GeoFrame;
use crate::pose_index::{Nearest, PoseIndex};

#[derive(Debug, Clone, PartialEq)]
pub struct ExpansionPlan {
    pub base_group: GroupId,
    /// Point the neighbours were chosen around, in the main frame.
    pub query_point: DVec3,
    pub neighbors: Nearest,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// Main dataset is empty; the batch is reconstructed alone.
    Bootstrap,
    Expand(ExpansionPlan),
}

/// Picks the existing images a new batch is reconstructed together with.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSelector {
    pub neighbor_count: usize,
    pub staging_size_cap: usize,
    pub proximity_threshold: f64,
    pub metric: DistanceMetric,
    pub geo_frame: Option<GeoFrame>,
}

impl From<&PipelineConfig> for CandidateSelector {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            neighbor_count: config.neighbor_count,
            staging_size_cap: config.staging_size_cap,
            proximity_threshold: config.group_proximity_threshold,
            metric: config.distance_metric,
            geo_frame: config.geo_frame,
        }
    }
}

impl CandidateSelector {
    /// Neighbours are the images nearest the batch's position signal, or
    /// nearest the relevant group's centroid when the batch has none. The
    /// neighbour count shrinks so that neighbours plus the batch stay within
    /// the staging cap. No relevant group is an error, never a guess.
    pub fn select_candidates(
        &self,
        batch: &Batch,
        poses: &PoseIndex,
        catalog: &GroupCatalog,
    ) -> Result<Selection> {
        if batch.is_empty() {
            return Err(Error::EmptyBatch);
        }
        if batch.len() > self.staging_size_cap {
            return Err(Error::BatchTooLarge {
                count: batch.len(),
                cap: self.staging_size_cap,
            });
        }
        if poses.is_empty() {
            info!("Main dataset is empty, bootstrapping from {} images", batch.len());
            return Ok(Selection::Bootstrap);
        }

        let signal = batch.signal_position(self.geo_frame.as_ref());
        let base_group =
            catalog.lookup_relevant_group(signal, self.proximity_threshold, self.metric)?;
        let query_point = match signal {
            Some(position) => position,
            None => catalog
                .group(base_group)
                .and_then(|group| group.centroid())
                .ok_or_else(|| Error::NotFound(format!("centroid of {base_group}")))?,
        };

        let k = self
            .neighbor_count
            .min(self.staging_size_cap - batch.len());
        let neighbors = poses.query_nearest(query_point, k, self.metric)?;
        debug!(
            "Selected {} neighbours around {query_point} in {base_group}",
            neighbors.len()
        );

        Ok(Selection::Expand(ExpansionPlan {
            base_group,
            query_point,
            neighbors,
        }))
    }
}
