//! Image position index for the main dataset.

use common::key_index_vec::{KeyIndexKey, KeyIndexVec};
use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::config::DistanceMetric;
use crate::error::{Error, Result};
use crate::image::ImageId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseEntry {
    pub image_id: ImageId,
    pub position: DVec3,
}

impl KeyIndexKey<ImageId> for PoseEntry {
    fn key(&self) -> &ImageId {
        &self.image_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub image_id: ImageId,
    pub position: DVec3,
    pub distance: f64,
}

/// Result of a nearest-neighbour query, closest first.
///
/// Owns its results, so it can be iterated any number of times.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Nearest {
    neighbors: Vec<Neighbor>,
}

impl Nearest {
    pub fn iter(&self) -> std::slice::Iter<'_, Neighbor> {
        self.neighbors.iter()
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    pub fn image_ids(&self) -> Vec<ImageId> {
        self.neighbors.iter().map(|n| n.image_id).collect()
    }

    pub fn into_vec(self) -> Vec<Neighbor> {
        self.neighbors
    }
}

impl<'a> IntoIterator for &'a Nearest {
    type Item = &'a Neighbor;
    type IntoIter = std::slice::Iter<'a, Neighbor>;

    fn into_iter(self) -> Self::IntoIter {
        self.neighbors.iter()
    }
}

/// Positions of main-dataset images in the main reconstruction frame.
///
/// Entries are never moved or removed; insertion order breaks distance ties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoseIndex {
    entries: KeyIndexVec<ImageId, PoseEntry>,
}

impl PoseIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, image_id: &ImageId) -> bool {
        self.entries.contains_key(image_id)
    }

    pub fn position(&self, image_id: &ImageId) -> Option<DVec3> {
        self.entries.by_key(image_id).map(|entry| entry.position)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PoseEntry> {
        self.entries.iter()
    }

    /// Adds one image. Re-inserting the same position is a no-op and returns
    /// `false`; a different position for a known image is a conflict.
    pub fn insert(&mut self, image_id: ImageId, position: DVec3) -> Result<bool> {
        if let Some(existing) = self.entries.by_key(&image_id) {
            if existing.position == position {
                return Ok(false);
            }
            return Err(Error::PoseConflict(image_id));
        }

        self.entries.push(PoseEntry { image_id, position });
        Ok(true)
    }

    /// Adds many images, all or nothing. Returns how many were new.
    pub fn bulk_insert<I>(&mut self, poses: I) -> Result<usize>
    where
        I: IntoIterator<Item = (ImageId, DVec3)>,
    {
        let poses: Vec<(ImageId, DVec3)> = poses.into_iter().collect();

        let mut staged = self.clone();
        let mut inserted = 0;
        for (image_id, position) in poses {
            if staged.insert(image_id, position)? {
                inserted += 1;
            }
        }

        *self = staged;
        Ok(inserted)
    }

    /// The `k` indexed images closest to `position`, closest first, ties in
    /// insertion order. Fails with `NotFound` when the index is empty.
    pub fn query_nearest(
        &self,
        position: DVec3,
        k: usize,
        metric: DistanceMetric,
    ) -> Result<Nearest> {
        if self.entries.is_empty() {
            return Err(Error::NotFound("pose index entries".to_string()));
        }

        let mut scored: Vec<(usize, Neighbor)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(order, entry)| {
                let neighbor = Neighbor {
                    image_id: entry.image_id,
                    position: entry.position,
                    distance: metric.distance(position, entry.position),
                };
                (order, neighbor)
            })
            .collect();

        scored.sort_by(|(order_a, a), (order_b, b)| {
            a.distance
                .total_cmp(&b.distance)
                .then(order_a.cmp(order_b))
        });
        scored.truncate(k);

        Ok(Nearest {
            neighbors: scored.into_iter().map(|(_, n)| n).collect(),
        })
    }
}
