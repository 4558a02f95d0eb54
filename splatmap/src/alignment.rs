//! Similarity alignment between a staging reconstruction frame and the main
//! frame, estimated from images registered in both (anchors).

use glam::{DMat3, DVec3};
use nalgebra::{Matrix3, Vector3};

/// Singular values below this fraction of the largest mean the anchors are
/// collinear and the rotation is not determined.
const DEGENERATE_RATIO: f64 = 1e-9;

/// `p' = scale * rotation * p + translation`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub scale: f64,
    pub rotation: DMat3,
    pub translation: DVec3,
}

impl Default for Similarity {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Similarity {
    pub const IDENTITY: Similarity = Similarity {
        scale: 1.0,
        rotation: DMat3::IDENTITY,
        translation: DVec3::ZERO,
    };

    pub fn apply(&self, point: DVec3) -> DVec3 {
        self.scale * (self.rotation * point) + self.translation
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alignment {
    pub transform: Similarity,
    /// Root mean square distance between mapped source and target anchors.
    pub rms_residual: f64,
    pub anchors: usize,
}

/// Least-squares similarity mapping `source[i]` onto `target[i]` (Umeyama).
///
/// Returns `None` for fewer than three pairs, mismatched lengths, or
/// anchors that are coincident or collinear.
pub fn estimate_similarity(source: &[DVec3], target: &[DVec3]) -> Option<Alignment> {
    if source.len() != target.len() || source.len() < 3 {
        return None;
    }
    let n = source.len() as f64;

    let mu_s = source.iter().copied().sum::<DVec3>() / n;
    let mu_t = target.iter().copied().sum::<DVec3>() / n;

    let mut covariance = Matrix3::<f64>::zeros();
    let mut source_variance = 0.0;
    for (s, t) in source.iter().zip(target) {
        let ds = to_na(*s - mu_s);
        let dt = to_na(*t - mu_t);
        covariance += dt * ds.transpose();
        source_variance += ds.norm_squared();
    }
    covariance /= n;
    source_variance /= n;

    if source_variance <= f64::EPSILON {
        return None;
    }

    let svd = covariance.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let singular = svd.singular_values;

    // sorted descending; a vanishing second value means a line, not a plane
    let largest = singular.max();
    let mut sorted = [singular[0], singular[1], singular[2]];
    sorted.sort_by(|a, b| b.total_cmp(a));
    if largest <= 0.0 || sorted[1] <= largest * DEGENERATE_RATIO {
        return None;
    }

    let mut reflection = Matrix3::<f64>::identity();
    if (u.determinant() * v_t.determinant()) < 0.0 {
        reflection[(2, 2)] = -1.0;
    }

    let rotation = u * reflection * v_t;
    let scale = (Matrix3::from_diagonal(&singular) * reflection).trace() / source_variance;
    let rotation = DMat3::from_cols_slice(rotation.as_slice());
    let translation = mu_t - scale * (rotation * mu_s);

    let transform = Similarity {
        scale,
        rotation,
        translation,
    };
    let squared_error: f64 = source
        .iter()
        .zip(target)
        .map(|(s, t)| transform.apply(*s).distance_squared(*t))
        .sum();

    Some(Alignment {
        transform,
        rms_residual: (squared_error / n).sqrt(),
        anchors: source.len(),
    })
}

fn to_na(v: DVec3) -> Vector3<f64> {
    Vector3::new(v.x, v.y, v.z)
}
