//! Datasets: a directory of images plus the reconstruction artifacts built
//! from them.
//!
//! Layout on disk:
//!
//! ```text
//! <root>/images/<stored-name>
//! <root>/sparse/0/{cameras,images,points3D}.txt
//! <root>/splat.ply
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use common::id_type;
use common::key_index_vec::KeyIndexVec;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::image::{Image, ImageId};

id_type!(DatasetId);

pub const IMAGES_DIR: &str = "images";
pub const SPARSE_DIR: &str = "sparse";
pub const SPLAT_FILE: &str = "splat.ply";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DatasetKind {
    Main,
    Staging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DatasetStatus {
    #[default]
    Open,
    Reconstructed,
    Trained,
    /// Staging only: folded into main or rejected, files removed.
    Discarded,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    /// Directory holding the text sparse model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sparse_model: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splat: Option<PathBuf>,
}

/// A main-dataset image whose file was copied into a staging dataset.
///
/// The image itself stays owned by main; staging only holds the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborCopy {
    pub image_id: ImageId,
    pub stored_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub kind: DatasetKind,
    pub root: PathBuf,
    pub status: DatasetStatus,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default)]
    images: KeyIndexVec<ImageId, Image>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    neighbors: Vec<NeighborCopy>,
}

impl Dataset {
    pub fn new(kind: DatasetKind, root: impl Into<PathBuf>) -> Self {
        Self {
            id: DatasetId::unique(),
            kind,
            root: root.into(),
            status: DatasetStatus::Open,
            artifacts: Artifacts::default(),
            images: KeyIndexVec::default(),
            neighbors: Vec::new(),
        }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    pub fn sparse_dir(&self) -> PathBuf {
        self.root.join(SPARSE_DIR)
    }

    pub fn splat_path(&self) -> PathBuf {
        self.root.join(SPLAT_FILE)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn contains(&self, image_id: &ImageId) -> bool {
        self.images.contains_key(image_id)
    }

    pub fn image(&self, image_id: &ImageId) -> Option<&Image> {
        self.images.by_key(image_id)
    }

    pub fn image_mut(&mut self, image_id: &ImageId) -> Option<&mut Image> {
        self.images.by_key_mut(image_id)
    }

    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.images.iter()
    }

    pub fn image_ids(&self) -> Vec<ImageId> {
        self.images.keys().collect()
    }

    pub fn neighbors(&self) -> &[NeighborCopy] {
        &self.neighbors
    }

    /// Images plus neighbour copies, the size of the reconstruction input.
    pub fn input_len(&self) -> usize {
        self.images.len() + self.neighbors.len()
    }

    /// Maps a file name inside `images/` back to the image it was stored for.
    pub fn image_by_stored_name(&self, name: &str) -> Option<ImageId> {
        self.images
            .iter()
            .find(|image| image.stored_name() == name)
            .map(|image| image.id)
            .or_else(|| {
                self.neighbors
                    .iter()
                    .find(|copy| copy.stored_name == name)
                    .map(|copy| copy.image_id)
            })
    }

    /// Takes ownership of `image`, copying its file into `images/`. The image
    /// record is updated to point at the copy. Fails without side effects if
    /// the image is already part of this dataset.
    pub fn adopt_image(&mut self, mut image: Image) -> Result<ImageId> {
        if self.images.contains_key(&image.id) {
            return Err(Error::DuplicateImage(image.id));
        }

        let target = self.copy_into_images(&image.file, &image.stored_name())?;
        image.file = target;
        let image_id = image.id;
        self.images.push(image);

        Ok(image_id)
    }

    /// Copies the file of a main-dataset image without taking ownership.
    pub fn copy_neighbor(&mut self, image: &Image) -> Result<()> {
        if self.neighbors.iter().any(|copy| copy.image_id == image.id) {
            return Ok(());
        }

        let stored_name = image.stored_name();
        self.copy_into_images(&image.file, &stored_name)?;
        self.neighbors.push(NeighborCopy {
            image_id: image.id,
            stored_name,
        });

        Ok(())
    }

    /// Points the dataset at `root`, rewriting image and artifact paths to
    /// match. Used when an environment directory was moved since it was last
    /// written.
    pub fn rebase(&mut self, root: impl Into<PathBuf>) {
        let old_root = std::mem::replace(&mut self.root, root.into());
        let images_dir = self.images_dir();
        for image in self.images.iter_mut() {
            image.file = images_dir.join(image.stored_name());
        }
        for path in [&mut self.artifacts.sparse_model, &mut self.artifacts.splat]
            .into_iter()
            .flatten()
        {
            *path = rebased_path(path, &old_root, &self.root);
        }
    }

    /// Inserts an image whose file already lives in `images/`.
    pub fn insert_image(&mut self, image: Image) -> bool {
        self.images.push(image)
    }

    pub fn remove_image(&mut self, image_id: &ImageId) -> Option<Image> {
        self.images.remove_by_key(image_id)
    }

    fn copy_into_images(&self, source: &Path, stored_name: &str) -> Result<PathBuf> {
        let images_dir = self.images_dir();
        fs::create_dir_all(&images_dir).at_path(&images_dir)?;

        let target = images_dir.join(stored_name);
        fs::copy(source, &target).at_path(source)?;
        debug!("Copied {} -> {}", source.display(), target.display());

        Ok(target)
    }
}

/// `path` moved from under `from` to under `to`; paths outside `from` are
/// returned unchanged.
pub fn rebased_path(path: &Path, from: &Path, to: &Path) -> PathBuf {
    match path.strip_prefix(from) {
        Ok(relative) => to.join(relative),
        Err(_) => path.to_path_buf(),
    }
}
