//! Rigid and similarity transforms, and their least-squares fit to
//! corresponding point sets.

use nalgebra::{Matrix3, Matrix4, Point3, Rotation3, UnitQuaternion, Vector3};

use crate::error::{CorrespondError, CorrespondResult};
use crate::types::{LandmarkSet, Mesh};

/// A rigid transformation (rotation + translation, optionally with uniform scale).
///
/// Points map as `p' = R * (s * p) + t`.
#[derive(Debug, Clone, PartialEq)]
pub struct RigidTransform {
    /// Rotation quaternion.
    pub rotation: UnitQuaternion<f64>,
    /// Translation vector.
    pub translation: Vector3<f64>,
    /// Uniform scale factor (1.0 = no scaling).
    pub scale: f64,
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl RigidTransform {
    /// Create an identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    /// Create a pure translation.
    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            translation,
            ..Self::identity()
        }
    }

    /// Create a transformation from rotation and translation.
    pub fn from_rotation_translation(
        rotation: UnitQuaternion<f64>,
        translation: Vector3<f64>,
    ) -> Self {
        Self {
            rotation,
            translation,
            scale: 1.0,
        }
    }

    /// Apply the transformation to a point.
    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        Point3::from(self.rotation * (point.coords * self.scale) + self.translation)
    }

    /// Apply the transformation to a vector (no translation).
    pub fn transform_vector(&self, vector: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * (vector * self.scale)
    }

    /// Apply the transformation to every vertex, keeping connectivity.
    pub fn transform_mesh(&self, mesh: &Mesh) -> Mesh {
        mesh.map_positions(|p| self.transform_point(p))
    }

    /// Apply the transformation to every landmark, keeping labels.
    pub fn transform_landmarks(&self, landmarks: &LandmarkSet) -> LandmarkSet {
        landmarks.map_points(|p| self.transform_point(p))
    }

    /// Compose with another transformation (self applied first, then other).
    pub fn then(&self, other: &RigidTransform) -> RigidTransform {
        RigidTransform {
            rotation: other.rotation * self.rotation,
            translation: other.rotation * (self.translation * other.scale) + other.translation,
            scale: self.scale * other.scale,
        }
    }

    /// Get the inverse transformation.
    pub fn inverse(&self) -> RigidTransform {
        let inv_rotation = self.rotation.inverse();
        let inv_scale = 1.0 / self.scale;
        RigidTransform {
            rotation: inv_rotation,
            translation: inv_rotation * (-self.translation * inv_scale),
            scale: inv_scale,
        }
    }

    /// Rotation angle in radians.
    pub fn rotation_angle(&self) -> f64 {
        self.rotation.angle()
    }

    /// True if rotation, translation and scale are all within `tolerance` of identity.
    pub fn is_identity(&self, tolerance: f64) -> bool {
        self.rotation_angle().abs() <= tolerance
            && self.translation.norm() <= tolerance
            && (self.scale - 1.0).abs() <= tolerance
    }

    /// Convert to a 4x4 homogeneous transformation matrix.
    pub fn to_matrix4(&self) -> Matrix4<f64> {
        let rotation_matrix = self.rotation.to_rotation_matrix();
        let mut result = Matrix4::identity();
        for i in 0..3 {
            for j in 0..3 {
                result[(i, j)] = rotation_matrix[(i, j)] * self.scale;
            }
            result[(i, 3)] = self.translation[i];
        }
        result
    }
}

/// Which degrees of freedom a landmark fit may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitMode {
    /// Rotation and translation.
    RigidBody,
    /// Rotation, translation and uniform scale.
    Similarity,
}

/// Least-squares fit of `source` onto `target` (Kabsch with optional scale).
///
/// Minimizes `Σ |T(source_i) - target_i|²`. Reflections are never returned.
pub fn fit_transform(
    source: &[Point3<f64>],
    target: &[Point3<f64>],
    mode: FitMode,
) -> CorrespondResult<RigidTransform> {
    if source.is_empty() {
        return Err(CorrespondError::empty_group("no points to fit"));
    }
    if source.len() != target.len() {
        return Err(CorrespondError::landmark_count_mismatch(
            "fit target",
            source.len(),
            target.len(),
        ));
    }

    let n = source.len() as f64;
    let source_centroid: Vector3<f64> = source.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n;
    let target_centroid: Vector3<f64> = target.iter().map(|p| p.coords).sum::<Vector3<f64>>() / n;

    let centered_source: Vec<Vector3<f64>> =
        source.iter().map(|p| p.coords - source_centroid).collect();
    let centered_target: Vec<Vector3<f64>> =
        target.iter().map(|p| p.coords - target_centroid).collect();

    // Cross-covariance H = Σ s_i t_iᵀ
    let mut h = Matrix3::zeros();
    for (s, t) in centered_source.iter().zip(&centered_target) {
        h += s * t.transpose();
    }

    let svd = h.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => {
            return Err(CorrespondError::SingularSystem {
                details: "SVD of landmark cross-covariance did not converge".to_string(),
            });
        }
    };

    let mut v = v_t.transpose();
    let mut rotation_matrix = v * u.transpose();
    if rotation_matrix.determinant() < 0.0 {
        // Flip the axis with the smallest singular value.
        for i in 0..3 {
            v[(i, 2)] = -v[(i, 2)];
        }
        rotation_matrix = v * u.transpose();
    }

    let rotation =
        UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation_matrix));

    let scale = match mode {
        FitMode::RigidBody => 1.0,
        FitMode::Similarity => optimal_scale(&centered_source, &centered_target, &rotation),
    };

    let translation = target_centroid - rotation * (source_centroid * scale);

    Ok(RigidTransform {
        rotation,
        translation,
        scale,
    })
}

/// Fit one landmark set onto another and report the residual sum of squares.
pub fn fit_landmarks(
    source: &LandmarkSet,
    target: &LandmarkSet,
    mode: FitMode,
) -> CorrespondResult<(RigidTransform, f64)> {
    let transform = fit_transform(source.points(), target.points(), mode)?;
    let residual = source
        .points()
        .iter()
        .zip(target.points())
        .map(|(s, t)| (transform.transform_point(s) - t).norm_squared())
        .sum();
    Ok((transform, residual))
}

fn optimal_scale(
    source_centered: &[Vector3<f64>],
    target_centered: &[Vector3<f64>],
    rotation: &UnitQuaternion<f64>,
) -> f64 {
    let mut source_variance = 0.0;
    let mut cross_variance = 0.0;
    for (s, t) in source_centered.iter().zip(target_centered) {
        source_variance += s.norm_squared();
        cross_variance += (rotation * s).dot(t);
    }
    if source_variance > 1e-12 {
        cross_variance / source_variance
    } else {
        1.0
    }
}
