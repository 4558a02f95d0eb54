//! Reader for COLMAP text sparse models (`images.txt`, `points3D.txt`).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const IMAGES_FILE: &str = "images.txt";
pub const POINTS_FILE: &str = "points3D.txt";

/// An image the mapper registered, with its pose.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredImage {
    pub colmap_id: u32,
    /// Path relative to the dataset `images/` directory.
    pub name: String,
    /// World-to-camera rotation.
    pub rotation: DQuat,
    /// World-to-camera translation.
    pub translation: DVec3,
    /// 2D keypoints that triangulated into a 3D point.
    pub observations: usize,
}

impl RegisteredImage {
    /// Camera centre in model coordinates, `C = -R^T t`.
    pub fn center(&self) -> DVec3 {
        -(self.rotation.conjugate() * self.translation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelStats {
    pub registered_images: usize,
    pub points: usize,
    pub mean_track_length: f64,
    pub mean_reprojection_error: f64,
    pub mean_observations_per_image: f64,
}

impl ModelStats {
    /// Heuristic 0-100 score: registration 30, track length 25, reprojection
    /// error 25 and observations per image 20.
    pub fn quality_score(&self, total_images: usize) -> f64 {
        if total_images == 0 || self.registered_images == 0 {
            return 0.0;
        }

        let registration = (self.registered_images as f64 / total_images as f64 * 30.0).min(30.0);
        // 3 observations per point scores nothing, 10 or more scores full
        let track = ((self.mean_track_length - 3.0) * (25.0 / 7.0)).clamp(0.0, 25.0);
        // 1 px scores full, every extra pixel costs 15
        let reprojection = (25.0 - (self.mean_reprojection_error - 1.0) * 15.0).clamp(0.0, 25.0);
        // 1000 observations per image scores 10, 5000 or more scores 20
        let observations =
            (10.0 + (self.mean_observations_per_image - 1000.0) * (10.0 / 4000.0)).clamp(0.0, 20.0);

        ((registration + track + reprojection + observations) * 10.0).round() / 10.0
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SparseModel {
    pub images: Vec<RegisteredImage>,
    pub point_count: usize,
    total_track_length: usize,
    total_error: f64,
}

impl SparseModel {
    /// Loads the text model in `dir`. A directory without `images.txt` holds
    /// no registered images and yields an empty model.
    pub fn load(dir: &Path) -> Result<Self> {
        let images_path = dir.join(IMAGES_FILE);
        let Some(images_text) = read_optional(&images_path)? else {
            return Ok(Self::default());
        };

        let mut model = Self {
            images: parse_images(&images_text, &images_path)?,
            ..Self::default()
        };

        let points_path = dir.join(POINTS_FILE);
        if let Some(points_text) = read_optional(&points_path)? {
            model.read_points(&points_text, &points_path)?;
        }

        Ok(model)
    }

    pub fn image_by_name(&self, name: &str) -> Option<&RegisteredImage> {
        self.images.iter().find(|image| image.name == name)
    }

    pub fn stats(&self) -> ModelStats {
        let registered_images = self.images.len();
        let points = self.point_count;

        let mean = |total: f64, count: usize| {
            if count == 0 {
                0.0
            } else {
                total / count as f64
            }
        };

        ModelStats {
            registered_images,
            points,
            mean_track_length: mean(self.total_track_length as f64, points),
            mean_reprojection_error: mean(self.total_error, points),
            mean_observations_per_image: mean(self.total_track_length as f64, registered_images),
        }
    }

    fn read_points(&mut self, text: &str, path: &Path) -> Result<()> {
        for (line_no, line) in data_lines(text) {
            if line.is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 8 || (parts.len() - 8) % 2 != 0 {
                return Err(model_error(path, line_no, "expected ID X Y Z R G B ERROR TRACK[]"));
            }
            let error: f64 = parts[7]
                .parse()
                .map_err(|_| model_error(path, line_no, "invalid reprojection error"))?;

            self.point_count += 1;
            self.total_track_length += (parts.len() - 8) / 2;
            self.total_error += error;
        }
        Ok(())
    }
}

fn parse_images(text: &str, path: &Path) -> Result<Vec<RegisteredImage>> {
    let mut images = Vec::new();
    let mut lines = data_lines(text);

    while let Some((line_no, line)) = lines.next() {
        if line.is_empty() {
            continue;
        }
        let mut image = parse_image_line(line, path, line_no)?;

        // the keypoint line follows every image line and may be empty
        if let Some((_, points)) = lines.next() {
            image.observations = count_observations(points);
        }
        images.push(image);
    }

    Ok(images)
}

fn parse_image_line(line: &str, path: &Path, line_no: usize) -> Result<RegisteredImage> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return Err(model_error(
            path,
            line_no,
            "expected IMAGE_ID QW QX QY QZ TX TY TZ CAMERA_ID NAME",
        ));
    }

    let number = |index: usize| -> Result<f64> {
        parts[index]
            .parse::<f64>()
            .map_err(|_| model_error(path, line_no, "invalid pose value"))
    };

    let colmap_id: u32 = parts[0]
        .parse()
        .map_err(|_| model_error(path, line_no, "invalid image id"))?;
    let rotation = DQuat::from_xyzw(number(2)?, number(3)?, number(4)?, number(1)?);
    if !rotation.is_finite() || rotation.length_squared() == 0.0 {
        return Err(model_error(path, line_no, "degenerate rotation"));
    }
    let translation = DVec3::new(number(5)?, number(6)?, number(7)?);

    Ok(RegisteredImage {
        colmap_id,
        name: parts[9..].join(" "),
        rotation: rotation.normalize(),
        translation,
        observations: 0,
    })
}

/// Counts `X Y POINT3D_ID` triplets whose point id is not -1.
fn count_observations(line: &str) -> usize {
    line.split_whitespace()
        .skip(2)
        .step_by(3)
        .filter(|id| *id != "-1")
        .count()
}

fn data_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.starts_with('#'))
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(Error::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn model_error(path: &Path, line_no: usize, message: &str) -> Error {
    Error::Model {
        path: PathBuf::from(path),
        message: format!("line {line_no}: {message}"),
    }
}
