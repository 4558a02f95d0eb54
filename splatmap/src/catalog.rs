//! Partition of images into object/location-focused groups.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use glam::DVec3;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

use crate::config::DistanceMetric;
use crate::error::{Error, Result};
use crate::image::{Image, ImageId};

/// Sequential group identifier; lower ids were created earlier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(u32);

impl GroupId {
    pub const fn new(index: u32) -> Self {
        GroupId(index)
    }

    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group_{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GroupState {
    /// No member has a reconstructed position yet; there is no centroid.
    #[default]
    Unresolved,
    Resolved { centroid: DVec3 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub state: GroupState,
    pub members: BTreeSet<ImageId>,
    /// Members whose reconstructed position is folded into the centroid.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub positioned: BTreeSet<ImageId>,
}

impl Group {
    fn new(id: GroupId) -> Self {
        Self {
            id,
            state: GroupState::Unresolved,
            members: BTreeSet::new(),
            positioned: BTreeSet::new(),
        }
    }

    pub fn centroid(&self) -> Option<DVec3> {
        match self.state {
            GroupState::Resolved { centroid } => Some(centroid),
            GroupState::Unresolved => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, GroupState::Resolved { .. })
    }

    /// Running mean over positioned members. Each member counts once.
    fn add_position(&mut self, image_id: ImageId, position: DVec3) {
        if !self.positioned.insert(image_id) {
            return;
        }
        let count = self.positioned.len() as f64;
        self.state = match self.state {
            GroupState::Unresolved => GroupState::Resolved { centroid: position },
            GroupState::Resolved { centroid } => GroupState::Resolved {
                centroid: centroid + (position - centroid) / count,
            },
        };
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogData {
    next_id: u32,
    groups: Vec<Group>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "CatalogData", into = "CatalogData")]
pub struct GroupCatalog {
    next_id: u32,
    groups: BTreeMap<GroupId, Group>,
    membership: HashMap<ImageId, GroupId>,
}

impl From<CatalogData> for GroupCatalog {
    fn from(data: CatalogData) -> Self {
        let mut membership = HashMap::new();
        for group in data.groups.iter() {
            for image_id in group.members.iter() {
                membership.insert(*image_id, group.id);
            }
        }
        let next_id = data
            .groups
            .iter()
            .map(|group| group.id.0 + 1)
            .max()
            .unwrap_or(0)
            .max(data.next_id);

        Self {
            next_id,
            groups: data.groups.into_iter().map(|g| (g.id, g)).collect(),
            membership,
        }
    }
}

impl From<GroupCatalog> for CatalogData {
    fn from(catalog: GroupCatalog) -> Self {
        Self {
            next_id: catalog.next_id,
            groups: catalog.groups.into_values().collect(),
        }
    }
}

impl GroupCatalog {
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn group(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn resolved_groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values().filter(|group| group.is_resolved())
    }

    pub fn group_of(&self, image_id: &ImageId) -> Option<GroupId> {
        self.membership.get(image_id).copied()
    }

    /// Places `image` into a group and returns its id.
    ///
    /// The image's reconstructed position is preferred over `signal`. With a
    /// position, the closest resolved group within `threshold` is joined (ties
    /// go to the lower id); otherwise a new group holding only this image is
    /// created. An image that already belongs to a group keeps it.
    pub fn assign_group(
        &mut self,
        image: &Image,
        signal: Option<DVec3>,
        threshold: f64,
        metric: DistanceMetric,
    ) -> GroupId {
        if let Some(existing) = self.group_of(&image.id) {
            if let Some(position) = image.position {
                self.record_position(existing, image.id, position);
            }
            return existing;
        }

        let query = image.position.or(signal);
        let group_id = match query.and_then(|p| self.nearest_resolved(p, threshold, metric)) {
            Some((group_id, _)) => group_id,
            None => {
                let group_id = GroupId(self.next_id);
                self.next_id += 1;
                self.groups.insert(group_id, Group::new(group_id));
                group_id
            }
        };

        if let Some(group) = self.groups.get_mut(&group_id) {
            group.members.insert(image.id);
        }
        self.membership.insert(image.id, group_id);

        if let Some(position) = image.position {
            self.record_position(group_id, image.id, position);
        }

        group_id
    }

    /// Adds `image` to an existing group, folding its position into the
    /// centroid. Used when a reconstruction placed the image relative to that
    /// group's members.
    pub fn join_group(&mut self, group_id: GroupId, image: &Image) -> Result<()> {
        if let Some(existing) = self.group_of(&image.id) {
            if existing != group_id {
                return Err(Error::DuplicateImage(image.id));
            }
        }
        let group = self
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| Error::NotFound(group_id.to_string()))?;

        group.members.insert(image.id);
        if let Some(position) = image.position {
            group.add_position(image.id, position);
        }
        self.membership.insert(image.id, group_id);

        Ok(())
    }

    /// Finds the resolved group nearest to the batch position signal.
    ///
    /// Without a signal there is no position to measure "closest" from, so
    /// this is narrower than a closest-group fallback: the lone resolved group
    /// is used, and when several exist the lookup refuses to guess and reports
    /// `NoRelevantGroup`. Callers wanting a specific group supply a hint.
    pub fn lookup_relevant_group(
        &self,
        signal: Option<DVec3>,
        threshold: f64,
        metric: DistanceMetric,
    ) -> Result<GroupId> {
        let no_group = Error::NoRelevantGroup { threshold };

        match signal {
            Some(position) => self
                .nearest_resolved(position, threshold, metric)
                .map(|(group_id, _)| group_id)
                .ok_or(no_group),
            None => {
                let mut resolved = self.resolved_groups();
                match (resolved.next(), resolved.next()) {
                    (Some(group), None) => Ok(group.id),
                    _ => Err(no_group),
                }
            }
        }
    }

    fn nearest_resolved(
        &self,
        position: DVec3,
        threshold: f64,
        metric: DistanceMetric,
    ) -> Option<(GroupId, f64)> {
        self.groups
            .values()
            .filter_map(|group| {
                let centroid = group.centroid()?;
                Some((group.id, metric.distance(position, centroid)))
            })
            .filter(|(_, distance)| *distance <= threshold)
            // groups iterate in id order, so min_by keeps the lowest id on ties
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    fn record_position(&mut self, group_id: GroupId, image_id: ImageId, position: DVec3) {
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.add_position(image_id, position);
        }
    }
}
