//! Bilateral mirror transform for symmetry studies.
//!
//! Reflecting a specimen across a plane swaps the identities of its left
//! and right landmarks. [`mirror`] reflects the mesh and landmarks, relabels
//! the reflected landmarks through a [`BilateralMap`], and then rigidly
//! registers the result back onto the original landmarks so the mirrored
//! copy lies over the original.

use std::fmt;
use std::str::FromStr;

use hashbrown::HashSet;
use nalgebra::Point3;
use tracing::debug;

use crate::error::{CorrespondError, CorrespondResult};
use crate::transform::{FitMode, RigidTransform, fit_transform};
use crate::types::{LandmarkSet, Mesh};

/// Coordinate axis negated by the reflection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "pipeline-config",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum MirrorAxis {
    /// Reflect across the YZ plane.
    #[default]
    X,
    /// Reflect across the XZ plane.
    Y,
    /// Reflect across the XY plane.
    Z,
}

impl MirrorAxis {
    fn index(self) -> usize {
        match self {
            MirrorAxis::X => 0,
            MirrorAxis::Y => 1,
            MirrorAxis::Z => 2,
        }
    }

    /// Reflect a point across the plane normal to this axis.
    pub fn reflect(self, point: &Point3<f64>) -> Point3<f64> {
        let mut p = *point;
        p[self.index()] = -p[self.index()];
        p
    }
}

/// Permutation pairing each landmark with its mirror-image counterpart.
///
/// Entry `i` names the reflected landmark that becomes landmark `i` after
/// mirroring. Midline landmarks map to themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BilateralMap {
    indices: Vec<usize>,
}

impl BilateralMap {
    /// Wrap a permutation, checking that every index appears exactly once.
    pub fn new(indices: Vec<usize>) -> CorrespondResult<Self> {
        let len = indices.len();
        let mut seen = HashSet::with_capacity(len);
        for &i in &indices {
            if i >= len {
                return Err(CorrespondError::InvalidBilateralMap {
                    details: format!("index {} out of range for {} landmarks", i, len),
                });
            }
            if !seen.insert(i) {
                return Err(CorrespondError::InvalidBilateralMap {
                    details: format!("index {} appears more than once", i),
                });
            }
        }
        Ok(Self { indices })
    }

    /// The map that leaves every landmark in place.
    pub fn identity(len: usize) -> Self {
        Self {
            indices: (0..len).collect(),
        }
    }

    /// Number of landmarks covered.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// True if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Permutation entries.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Reorder `points` so that `out[i] = points[map[i]]`.
    pub fn permute<T: Copy>(&self, points: &[T]) -> Vec<T> {
        self.indices.iter().map(|&i| points[i]).collect()
    }
}

/// Parses comma-separated zero-based indices, e.g. `"1,0,2"`.
impl FromStr for BilateralMap {
    type Err = CorrespondError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let indices = s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| {
                t.parse::<usize>()
                    .map_err(|e| CorrespondError::InvalidBilateralMap {
                        details: format!("'{}' is not an index: {}", t, e),
                    })
            })
            .collect::<CorrespondResult<Vec<_>>>()?;
        Self::new(indices)
    }
}

impl fmt::Display for BilateralMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (n, i) in self.indices.iter().enumerate() {
            if n > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", i)?;
        }
        Ok(())
    }
}

/// Output of [`mirror`].
#[derive(Debug, Clone)]
pub struct MirrorResult {
    /// Reflected mesh, winding reversed, registered onto the original.
    pub mesh: Mesh,
    /// Relabelled reflected landmarks, registered onto the original.
    pub landmarks: LandmarkSet,
    /// Rigid registration applied after the reflection.
    pub transform: RigidTransform,
    /// Residual sum of squares of the landmark registration.
    pub residual: f64,
}

/// Reflect a specimen across `axis` and register it back onto itself.
///
/// Face winding is reversed so the mirrored surface keeps outward normals.
///
/// # Errors
///
/// - [`CorrespondError::InvalidBilateralMap`] if the map length differs
///   from the landmark count
/// - [`CorrespondError::EmptyGroup`] if there are no landmarks
pub fn mirror(
    mesh: &Mesh,
    landmarks: &LandmarkSet,
    axis: MirrorAxis,
    map: &BilateralMap,
) -> CorrespondResult<MirrorResult> {
    if map.len() != landmarks.len() {
        return Err(CorrespondError::InvalidBilateralMap {
            details: format!(
                "map covers {} landmarks but the set has {}",
                map.len(),
                landmarks.len()
            ),
        });
    }

    let reflected_points: Vec<Point3<f64>> =
        landmarks.points().iter().map(|p| axis.reflect(p)).collect();
    let relabelled = map.permute(&reflected_points);
    let transform = fit_transform(&relabelled, landmarks.points(), FitMode::RigidBody)?;

    let positions = mesh
        .positions
        .iter()
        .map(|p| transform.transform_point(&axis.reflect(p)))
        .collect();
    let mirrored_mesh = Mesh::from_parts(positions, mesh.connectivity().reversed())?;

    let mirrored_points: Vec<Point3<f64>> = relabelled
        .iter()
        .map(|p| transform.transform_point(p))
        .collect();
    let residual = mirrored_points
        .iter()
        .zip(landmarks.points())
        .map(|(a, b)| (a - b).norm_squared())
        .sum();

    debug!(
        axis = ?axis,
        rotation_deg = transform.rotation_angle().to_degrees(),
        residual = residual,
        "Mirrored specimen"
    );

    Ok(MirrorResult {
        mesh: mirrored_mesh,
        landmarks: landmarks.with_points(mirrored_points),
        transform,
        residual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    /// Shape symmetric about x = 0: left/right pairs plus midline points.
    fn symmetric_specimen() -> (Mesh, LandmarkSet, BilateralMap) {
        let positions = vec![
            Point3::new(-1.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 2.0, 0.0),
            Point3::new(0.0, 0.5, 1.5),
            Point3::new(-0.5, 1.0, 0.3),
            Point3::new(0.5, 1.0, 0.3),
        ];
        let faces = vec![vec![0, 1, 3], vec![0, 4, 2], vec![1, 2, 5]];
        let landmarks = LandmarkSet::from_points(positions.clone());
        let map: BilateralMap = "1,0,2,3,5,4".parse().unwrap();
        (Mesh::new(positions, faces), landmarks, map)
    }

    #[test]
    fn test_parse_and_display() {
        let map: BilateralMap = " 1, 0 ,2".parse().unwrap();
        assert_eq!(map.indices(), &[1, 0, 2]);
        assert_eq!(map.to_string(), "1,0,2");
    }

    #[test]
    fn test_rejects_non_permutation() {
        assert!(matches!(
            "0,0,1".parse::<BilateralMap>(),
            Err(CorrespondError::InvalidBilateralMap { .. })
        ));
        assert!(matches!(
            "0,3,1".parse::<BilateralMap>(),
            Err(CorrespondError::InvalidBilateralMap { .. })
        ));
        assert!(matches!(
            "0,x".parse::<BilateralMap>(),
            Err(CorrespondError::InvalidBilateralMap { .. })
        ));
    }

    #[test]
    fn test_symmetric_shape_mirrors_onto_itself() {
        let (mesh, landmarks, map) = symmetric_specimen();
        let result = mirror(&mesh, &landmarks, MirrorAxis::X, &map).unwrap();

        assert!(result.transform.is_identity(1e-6));
        assert!(result.residual < 1e-18);
        for (got, expected) in result.landmarks.points().iter().zip(landmarks.points()) {
            assert_relative_eq!(*got, *expected, epsilon = 1e-9);
        }
        assert_eq!(result.mesh.faces()[0], vec![3, 1, 0]);
        // Reflected vertex 0 now sits where vertex 1 was.
        assert_relative_eq!(result.mesh.positions[0], mesh.positions[1], epsilon = 1e-9);
    }

    #[test]
    fn test_translated_shape_registers_back() {
        let (mesh, landmarks, map) = symmetric_specimen();
        let offset = Vector3::new(3.0, -1.0, 2.0);
        let moved_mesh = mesh.map_positions(|p| p + offset);
        let moved_landmarks = landmarks.map_points(|p| p + offset);

        let result = mirror(&moved_mesh, &moved_landmarks, MirrorAxis::X, &map).unwrap();
        assert!(result.residual < 1e-12);
        for (got, expected) in result.landmarks.points().iter().zip(moved_landmarks.points()) {
            assert_relative_eq!(*got, *expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_map_length_checked() {
        let (mesh, landmarks, _) = symmetric_specimen();
        let err = mirror(&mesh, &landmarks, MirrorAxis::Y, &BilateralMap::identity(3)).unwrap_err();
        assert!(matches!(err, CorrespondError::InvalidBilateralMap { .. }));
    }
}
