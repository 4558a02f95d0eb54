use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use common::id_type;
use common::key_index_vec::KeyIndexKey;
use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::catalog::GroupId;
use crate::geo::{GeoCoord, PositionSignal};

id_type!(ImageId);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    /// Name the photo was captured or uploaded under.
    pub file_name: String,
    /// Current location of the image file.
    pub file: PathBuf,
    pub captured_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<GeoCoord>,
    /// Position hint in the main frame, supplied by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<DVec3>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupId>,
    /// Camera centre in the main frame, set once a reconstruction recovered it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<DVec3>,
}

impl KeyIndexKey<ImageId> for Image {
    fn key(&self) -> &ImageId {
        &self.id
    }
}

impl Image {
    pub fn new(file_name: impl Into<String>, file: impl Into<PathBuf>, captured_at: DateTime<Utc>) -> Self {
        Self {
            id: ImageId::unique(),
            file_name: file_name.into(),
            file: file.into(),
            captured_at,
            geo: None,
            hint: None,
            group: None,
            position: None,
        }
    }

    /// File name used inside dataset `images/` directories. Unique per image,
    /// so neighbours and new images never collide.
    pub fn stored_name(&self) -> String {
        match Path::new(&self.file_name)
            .extension()
            .and_then(|ext| ext.to_str())
        {
            Some(ext) => format!("{}.{}", self.id.simple(), ext.to_ascii_lowercase()),
            None => self.id.simple(),
        }
    }

    pub fn signal(&self) -> PositionSignal {
        if let Some(hint) = self.hint {
            PositionSignal::Local(hint)
        } else if let Some(geo) = self.geo {
            PositionSignal::Geographic(geo)
        } else {
            PositionSignal::None
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.position.is_some()
    }
}
