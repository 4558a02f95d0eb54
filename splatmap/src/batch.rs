use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use common::file_utils::image_files;
use glam::DVec3;
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::geo::{GeoCoord, GeoFrame};
use crate::image::Image;
use crate::metadata::CaptureMetadata;

/// A set of freshly captured images waiting to be folded into the environment.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub images: Vec<Image>,
}

impl Batch {
    pub fn new(images: Vec<Image>) -> Self {
        Self { images }
    }

    /// Ingests every jpg/jpeg/png file in `dir`. Capture time and location
    /// come from EXIF; capture time falls back to the file modification time.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let files = image_files(dir).at_path(dir)?;
        let mut images = Vec::with_capacity(files.len());

        for file in files {
            let metadata = CaptureMetadata::read(&file);
            let captured_at: DateTime<Utc> = match metadata.captured_at {
                Some(captured_at) => captured_at,
                None => fs::metadata(&file)
                    .and_then(|meta| meta.modified())
                    .at_path(&file)?
                    .into(),
            };
            let file_name = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| Error::NotFound(format!("file name of {}", file.display())))?;

            let mut image = Image::new(file_name, file, captured_at);
            image.geo = metadata.geo;
            images.push(image);
        }

        let located = images.iter().filter(|image| image.geo.is_some()).count();
        debug!(
            "Ingested {} images from {} ({located} with EXIF location)",
            images.len(),
            dir.display()
        );

        Ok(Self { images })
    }

    /// Sets a position hint on every image that has none.
    pub fn with_hint(mut self, hint: DVec3) -> Self {
        for image in self.images.iter_mut().filter(|image| image.hint.is_none()) {
            image.hint = Some(hint);
        }
        self
    }

    /// Sets a geographic coordinate on every image that has none.
    pub fn with_geo(mut self, geo: GeoCoord) -> Self {
        for image in self.images.iter_mut().filter(|image| image.geo.is_none()) {
            image.geo = Some(geo);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Mean of the per-image signals that resolve into the main frame.
    pub fn signal_position(&self, geo_frame: Option<&GeoFrame>) -> Option<DVec3> {
        let positions: Vec<DVec3> = self
            .images
            .iter()
            .filter_map(|image| image.signal().resolve(geo_frame))
            .collect();

        if positions.is_empty() {
            return None;
        }
        Some(positions.iter().copied().sum::<DVec3>() / positions.len() as f64)
    }
}
