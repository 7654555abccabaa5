//! Generalized Procrustes superimposition of landmark configurations.
//!
//! Every configuration is centered on its centroid (and, in similarity mode,
//! scaled to unit centroid size), then repeatedly fitted onto the running
//! consensus until the consensus stops moving. The first configuration seeds
//! the consensus and fixes the orientation of the shared frame.
//!
//! # Example
//!
//! ```
//! use mesh_correspond::{LandmarkSet, SampleGroup};
//! use mesh_correspond::procrustes::{ProcrustesParams, procrustes_align};
//! use nalgebra::Point3;
//!
//! let base = vec![
//!     Point3::new(0.0, 0.0, 0.0),
//!     Point3::new(1.0, 0.0, 0.0),
//!     Point3::new(0.0, 2.0, 0.0),
//!     Point3::new(0.0, 0.0, 3.0),
//! ];
//! let shifted: Vec<_> = base.iter().map(|p| p + nalgebra::Vector3::new(5.0, 5.0, 5.0)).collect();
//!
//! let group: SampleGroup<LandmarkSet> = [
//!     ("a", LandmarkSet::from_points(base)),
//!     ("b", LandmarkSet::from_points(shifted)),
//! ]
//! .into_iter()
//! .collect();
//!
//! let result = procrustes_align(&group, &ProcrustesParams::default()).unwrap();
//! assert!(result.converged);
//! assert!(result.residual < 1e-12);
//! assert_eq!(result.closest_to_mean(), Some((0, "a")));
//! ```

use nalgebra::{Point3, Vector3};
use tracing::{debug, info, trace, warn};

use crate::error::{CorrespondError, CorrespondResult};
use crate::tracing_ext::OperationTimer;
use crate::transform::{FitMode, fit_transform};
use crate::types::{LandmarkSet, SampleGroup, centroid_of};

/// Relative slack under which two Procrustes distances are considered equal.
const TIE_TOLERANCE: f64 = 1e-9;

/// Parameters for generalized Procrustes alignment.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "pipeline-config",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct ProcrustesParams {
    /// Remove size differences (similarity fit, unit centroid size consensus).
    /// Default: true
    pub remove_scale: bool,
    /// Iteration cap. Default: 100
    pub max_iterations: usize,
    /// Stop when the summed squared consensus change falls to this. Default: 1e-10
    pub tolerance: f64,
}

impl Default for ProcrustesParams {
    fn default() -> Self {
        Self {
            remove_scale: true,
            max_iterations: 100,
            tolerance: 1e-10,
        }
    }
}

impl ProcrustesParams {
    /// Rigid-body alignment (sizes kept).
    pub fn rigid() -> Self {
        Self {
            remove_scale: false,
            ..Self::default()
        }
    }

    /// Similarity alignment (sizes removed). Same as the default.
    pub fn similarity() -> Self {
        Self::default()
    }

    /// Set maximum iterations.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Set the convergence tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance.max(0.0);
        self
    }

    fn fit_mode(&self) -> FitMode {
        if self.remove_scale {
            FitMode::Similarity
        } else {
            FitMode::RigidBody
        }
    }
}

/// Consensus shape and per-sample aligned configurations.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentResult {
    /// Mean shape in the shared centered frame.
    pub consensus: LandmarkSet,

    /// Every input configuration fitted onto the consensus, in input order.
    pub aligned: SampleGroup<LandmarkSet>,

    /// Iterations performed.
    pub iterations: usize,

    /// Whether the consensus change dropped below tolerance.
    pub converged: bool,

    /// Summed squared distance of all aligned landmarks to the consensus.
    pub residual: f64,
}

impl AlignmentResult {
    /// Per-sample summed Euclidean landmark distance to the consensus.
    pub fn procrustes_distances(&self) -> SampleGroup<f64> {
        self.aligned.map(|_, lms| {
            lms.points()
                .iter()
                .zip(self.consensus.points())
                .map(|(p, m)| (p - m).norm())
                .sum()
        })
    }

    /// The sample closest to the consensus as `(position, id)`.
    ///
    /// Closeness is the summed per-landmark Euclidean distance. Ties go to
    /// the earliest sample in iteration order; distances closer than
    /// `TIE_TOLERANCE` times the consensus centroid size count as ties.
    pub fn closest_to_mean(&self) -> Option<(usize, &str)> {
        let distances = self.procrustes_distances();
        let tie = TIE_TOLERANCE * self.consensus.centroid_size();
        let mut best: Option<(usize, f64)> = None;
        for (i, (_, &d)) in distances.iter().enumerate() {
            if best.is_none_or(|(_, current)| d < current - tie) {
                best = Some((i, d));
            }
        }
        let (index, _) = best?;
        self.aligned.get_index(index).map(|(id, _)| (index, id))
    }
}

/// Check that every configuration has the same number of landmarks.
///
/// Returns the common count.
pub fn check_landmark_counts(group: &SampleGroup<LandmarkSet>) -> CorrespondResult<usize> {
    let Some((_, first)) = group.get_index(0) else {
        return Err(CorrespondError::empty_group("no landmark sets to align"));
    };
    let expected = first.len();
    for (id, lms) in group.iter() {
        if lms.len() != expected {
            return Err(CorrespondError::landmark_count_mismatch(
                id,
                expected,
                lms.len(),
            ));
        }
    }
    Ok(expected)
}

/// Superimpose a group of landmark configurations.
///
/// # Errors
///
/// - [`CorrespondError::EmptyGroup`] for an empty group or zero landmarks
/// - [`CorrespondError::LandmarkCountMismatch`] if lengths differ
/// - [`CorrespondError::DegenerateLandmarkConfiguration`] if scale removal
///   meets a configuration of zero size
pub fn procrustes_align(
    group: &SampleGroup<LandmarkSet>,
    params: &ProcrustesParams,
) -> CorrespondResult<AlignmentResult> {
    let k = check_landmark_counts(group)?;
    if k == 0 {
        return Err(CorrespondError::empty_group("landmark sets are empty"));
    }
    let _timer = OperationTimer::with_context("procrustes_align", group.len(), k);

    let mut shapes: Vec<Vec<Point3<f64>>> = Vec::with_capacity(group.len());
    for (id, lms) in group.iter() {
        let centered = center(lms.points());
        let shape = if params.remove_scale {
            normalize_size(&centered).ok_or_else(|| {
                CorrespondError::degenerate(format!("sample '{}' has zero centroid size", id))
            })?
        } else {
            centered
        };
        shapes.push(shape);
    }

    let labels = group
        .get_index(0)
        .map(|(_, lms)| lms.clone())
        .unwrap_or_default();

    if shapes.len() == 1 {
        debug!("Single configuration, consensus is the centered sample");
        let consensus = labels.with_points(shapes.remove(0));
        let aligned = group.map(|_, _| consensus.clone());
        return Ok(AlignmentResult {
            consensus,
            aligned,
            iterations: 0,
            converged: true,
            residual: 0.0,
        });
    }

    let mode = params.fit_mode();
    let reference = shapes[0].clone();
    let mut mean = reference.clone();
    let mut iterations = 0;
    let mut converged = false;

    while iterations < params.max_iterations {
        iterations += 1;

        for shape in shapes.iter_mut() {
            let fit = fit_transform(shape, &mean, mode)?;
            for p in shape.iter_mut() {
                *p = fit.transform_point(p);
            }
        }

        let mut next = elementwise_mean(&shapes);
        if params.remove_scale {
            next = normalize_size(&next).unwrap_or(next);
        }
        // Keep the frame anchored to the seed so the consensus cannot drift.
        let anchor = fit_transform(&next, &reference, FitMode::RigidBody)?;
        for p in next.iter_mut() {
            *p = anchor.transform_point(p);
        }

        let change: f64 = next
            .iter()
            .zip(&mean)
            .map(|(a, b)| (a - b).norm_squared())
            .sum();
        trace!(iteration = iterations, change = change, "Procrustes iteration");
        mean = next;

        if change <= params.tolerance {
            converged = true;
            break;
        }
    }

    // Final fit against the settled consensus.
    for shape in shapes.iter_mut() {
        let fit = fit_transform(shape, &mean, mode)?;
        for p in shape.iter_mut() {
            *p = fit.transform_point(p);
        }
    }

    let residual: f64 = shapes
        .iter()
        .flat_map(|s| s.iter().zip(&mean).map(|(a, b)| (a - b).norm_squared()))
        .sum();

    if !converged {
        warn!(
            iterations = iterations,
            "Procrustes alignment reached the iteration cap before converging"
        );
    }
    info!(
        samples = shapes.len(),
        landmarks = k,
        iterations = iterations,
        residual = residual,
        "Procrustes alignment complete"
    );

    let consensus = labels.with_points(mean);
    let aligned = group
        .iter()
        .zip(shapes)
        .map(|((id, lms), shape)| (id.to_string(), lms.with_points(shape)))
        .collect();

    Ok(AlignmentResult {
        consensus,
        aligned,
        iterations,
        converged,
        residual,
    })
}

fn center(points: &[Point3<f64>]) -> Vec<Point3<f64>> {
    let c = centroid_of(points).unwrap_or_else(Point3::origin);
    points.iter().map(|p| Point3::from(p - c)).collect()
}

/// Scale a centered configuration to unit centroid size.
fn normalize_size(points: &[Point3<f64>]) -> Option<Vec<Point3<f64>>> {
    let size = points
        .iter()
        .map(|p| p.coords.norm_squared())
        .sum::<f64>()
        .sqrt();
    if size <= f64::EPSILON {
        return None;
    }
    Some(points.iter().map(|p| p / size).collect())
}

fn elementwise_mean(shapes: &[Vec<Point3<f64>>]) -> Vec<Point3<f64>> {
    let n = shapes.len() as f64;
    let k = shapes.first().map_or(0, Vec::len);
    (0..k)
        .map(|j| {
            let sum: Vector3<f64> = shapes.iter().map(|s| s[j].coords).sum();
            Point3::from(sum / n)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::RigidTransform;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn shape() -> Vec<Point3<f64>> {
        vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(4.0, 0.0, 0.0),
            Point3::new(0.0, 3.0, 0.0),
            Point3::new(0.0, 0.0, 2.0),
            Point3::new(1.0, 1.0, 1.0),
        ]
    }

    fn moved(points: &[Point3<f64>], t: &RigidTransform) -> Vec<Point3<f64>> {
        points.iter().map(|p| t.transform_point(p)).collect()
    }

    fn group_of(shapes: Vec<Vec<Point3<f64>>>) -> SampleGroup<LandmarkSet> {
        shapes
            .into_iter()
            .enumerate()
            .map(|(i, s)| (format!("s{}", i), LandmarkSet::from_points(s)))
            .collect()
    }

    #[test]
    fn test_congruent_configurations_have_zero_residual() {
        let t = RigidTransform::from_rotation_translation(
            UnitQuaternion::from_euler_angles(0.3, -0.2, 1.1),
            Vector3::new(10.0, -4.0, 2.0),
        );
        let group = group_of(vec![shape(), moved(&shape(), &t)]);
        let result = procrustes_align(&group, &ProcrustesParams::rigid()).unwrap();

        assert!(result.converged);
        assert!(result.residual < 1e-12);
        let centered = center(&shape());
        for (c, expected) in result.consensus.points().iter().zip(&centered) {
            assert_relative_eq!(*c, *expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_closest_to_mean_tie_goes_to_first() {
        let t = RigidTransform::from_translation(Vector3::new(0.0, 0.0, 7.0));
        let group = group_of(vec![shape(), moved(&shape(), &t), shape()]);
        let result = procrustes_align(&group, &ProcrustesParams::default()).unwrap();
        assert_eq!(result.closest_to_mean(), Some((0, "s0")));
    }

    #[test]
    fn test_closest_to_mean_picks_typical_sample() {
        let mut outlier = shape();
        outlier[4] = Point3::new(3.0, 3.0, 3.0);
        let mut slight = shape();
        slight[4] = Point3::new(1.1, 1.0, 1.0);
        let group = group_of(vec![outlier, shape(), slight]);
        let result = procrustes_align(&group, &ProcrustesParams::default()).unwrap();
        let (index, id) = result.closest_to_mean().unwrap();
        assert_ne!(index, 0);
        assert_ne!(id, "s0");
    }

    #[test]
    fn test_single_sample_is_its_own_consensus() {
        let group = group_of(vec![shape()]);
        let result = procrustes_align(&group, &ProcrustesParams::default()).unwrap();
        assert_eq!(result.residual, 0.0);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.aligned.get("s0"), Some(&result.consensus));
        assert_relative_eq!(
            result.consensus.centroid().unwrap(),
            Point3::origin(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_similarity_mode_removes_size() {
        let doubled: Vec<_> = shape().iter().map(|p| Point3::from(p.coords * 2.0)).collect();
        let group = group_of(vec![shape(), doubled]);
        let result = procrustes_align(&group, &ProcrustesParams::similarity()).unwrap();
        assert_relative_eq!(result.consensus.centroid_size(), 1.0, epsilon = 1e-9);
        assert!(result.residual < 1e-12);
    }

    #[test]
    fn test_default_removes_size() {
        assert!(ProcrustesParams::default().remove_scale);
        assert!(!ProcrustesParams::rigid().remove_scale);
    }

    #[test]
    fn test_size_only_differences_tie_in_similarity_mode() {
        let scaled = |f: f64| -> Vec<Point3<f64>> {
            shape().iter().map(|p| Point3::from(p.coords * f)).collect()
        };
        let group = group_of(vec![scaled(1.0), scaled(2.0), scaled(3.0)]);

        let similar = procrustes_align(&group, &ProcrustesParams::default()).unwrap();
        assert!(similar.residual < 1e-12);
        assert_eq!(similar.closest_to_mean(), Some((0, "s0")));

        let rigid = procrustes_align(&group, &ProcrustesParams::rigid()).unwrap();
        assert_eq!(rigid.closest_to_mean(), Some((1, "s1")));
    }

    #[test]
    fn test_count_mismatch_rejected() {
        let mut group = group_of(vec![shape()]);
        group.insert("short", LandmarkSet::from_points(shape()[..4].to_vec()));
        let err = procrustes_align(&group, &ProcrustesParams::default()).unwrap_err();
        match err {
            CorrespondError::LandmarkCountMismatch {
                sample_id,
                expected,
                found,
            } => {
                assert_eq!(sample_id, "short");
                assert_eq!(expected, 5);
                assert_eq!(found, 4);
            }
            other => panic!("Expected LandmarkCountMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_group_rejected() {
        let group: SampleGroup<LandmarkSet> = SampleGroup::new();
        let err = procrustes_align(&group, &ProcrustesParams::default()).unwrap_err();
        assert!(matches!(err, CorrespondError::EmptyGroup { .. }));
    }
}
