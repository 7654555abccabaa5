//! Thin-plate-spline space warping.
//!
//! A [`WarpField`] binds a source landmark configuration to a target one and
//! maps arbitrary points with the minimal-bending-energy interpolant that is
//! exact at every control point. The 3D kernel is `U(r) = r` (no log term)
//! plus an affine part:
//!
//! ```text
//! f(p) = p + c + A·q + Σ w_i |q - q_i|,   q = (p - o) / s
//! ```
//!
//! where `o` and `s` are the source centroid and radius, used only to keep
//! the linear system well conditioned.
//!
//! Points far outside the convex hull of the source landmarks are
//! extrapolated by the affine and radial terms and can move a long way; keep
//! warped point sets within a comparable extent of the landmarks.
//!
//! # Example
//!
//! ```
//! use mesh_correspond::{LandmarkSet, WarpField};
//! use nalgebra::Point3;
//!
//! let source = LandmarkSet::from_points(vec![
//!     Point3::new(0.0, 0.0, 0.0),
//!     Point3::new(1.0, 0.0, 0.0),
//!     Point3::new(0.0, 1.0, 0.0),
//!     Point3::new(0.0, 0.0, 1.0),
//! ]);
//! let target = source.map_points(|p| Point3::new(p.x * 2.0, p.y, p.z + 1.0));
//!
//! let warp = WarpField::build(&source, &target).unwrap();
//! let moved = warp.apply(&Point3::new(1.0, 0.0, 0.0));
//! assert!((moved - Point3::new(2.0, 0.0, 1.0)).norm() < 1e-9);
//! ```

use nalgebra::{DMatrix, Matrix3, Point3, Vector3};
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::error::{CorrespondError, CorrespondResult};
use crate::types::{LandmarkSet, Mesh};

/// Relative tolerance for coincident landmarks.
const COINCIDENT_TOLERANCE: f64 = 1e-9;

/// Relative singular-value ratio below which a spread direction is considered absent.
const FLATNESS_TOLERANCE: f64 = 1e-10;

/// A thin-plate-spline warp from one landmark configuration onto another.
#[derive(Debug, Clone)]
pub struct WarpField {
    source: Vec<Point3<f64>>,
    target: Vec<Point3<f64>>,
    /// Source landmarks in normalized coordinates.
    control: Vec<Vector3<f64>>,
    origin: Vector3<f64>,
    radius: f64,
    radial: Vec<Vector3<f64>>,
    linear: Matrix3<f64>,
    offset: Vector3<f64>,
    coplanar: bool,
}

impl WarpField {
    /// Build the warp mapping `source[i]` onto `target[i]`.
    ///
    /// # Errors
    ///
    /// - [`CorrespondError::LandmarkCountMismatch`] if the sets differ in length
    /// - [`CorrespondError::DegenerateLandmarkConfiguration`] for fewer than 4
    ///   landmarks, non-finite, coincident or collinear source landmarks
    /// - [`CorrespondError::SingularSystem`] if the spline system cannot be solved
    pub fn build(source: &LandmarkSet, target: &LandmarkSet) -> CorrespondResult<Self> {
        Self::from_points(source.points(), target.points())
    }

    /// Build from raw point slices.
    pub fn from_points(source: &[Point3<f64>], target: &[Point3<f64>]) -> CorrespondResult<Self> {
        if source.len() != target.len() {
            return Err(CorrespondError::landmark_count_mismatch(
                "warp target",
                source.len(),
                target.len(),
            ));
        }
        let layout = check_configuration(source)?;
        if target.iter().any(|p| !p.coords.iter().all(|c| c.is_finite())) {
            return Err(CorrespondError::degenerate(
                "target landmarks contain non-finite coordinates",
            ));
        }

        let k = source.len();
        let control: Vec<Vector3<f64>> = source
            .iter()
            .map(|p| (p.coords - layout.origin) / layout.radius)
            .collect();

        // [ K  P ] [ w ]   [ d ]
        // [ Pᵀ 0 ] [ a ] = [ 0 ]
        let n = k + 4;
        let mut system = DMatrix::<f64>::zeros(n, n);
        for i in 0..k {
            for j in (i + 1)..k {
                let r = (control[i] - control[j]).norm();
                system[(i, j)] = r;
                system[(j, i)] = r;
            }
            let q = control[i];
            let row = [1.0, q.x, q.y, q.z];
            for (c, value) in row.into_iter().enumerate() {
                system[(i, k + c)] = value;
                system[(k + c, i)] = value;
            }
        }

        let mut rhs = DMatrix::<f64>::zeros(n, 3);
        for i in 0..k {
            let d = target[i] - source[i];
            rhs[(i, 0)] = d.x;
            rhs[(i, 1)] = d.y;
            rhs[(i, 2)] = d.z;
        }

        let solution = if layout.coplanar {
            // Rank-deficient affine block: take the minimum-norm solution,
            // which leaves displacement constant along the plane normal.
            let svd = system.svd(true, true);
            let largest = svd.singular_values.max();
            svd.solve(&rhs, largest * FLATNESS_TOLERANCE)
                .map_err(|e| CorrespondError::SingularSystem {
                    details: format!("thin-plate-spline system (coplanar landmarks): {}", e),
                })?
        } else {
            system
                .lu()
                .solve(&rhs)
                .ok_or_else(|| CorrespondError::SingularSystem {
                    details: "thin-plate-spline system is singular".to_string(),
                })?
        };

        let radial = (0..k)
            .map(|i| Vector3::new(solution[(i, 0)], solution[(i, 1)], solution[(i, 2)]))
            .collect();
        let offset = Vector3::new(solution[(k, 0)], solution[(k, 1)], solution[(k, 2)]);
        // linear[(out, in)] multiplies normalized input coordinate `in`
        let mut linear = Matrix3::zeros();
        for input in 0..3 {
            for out in 0..3 {
                linear[(out, input)] = solution[(k + 1 + input, out)];
            }
        }

        debug!(
            landmarks = k,
            coplanar = layout.coplanar,
            radius = layout.radius,
            "Built thin-plate-spline warp"
        );

        Ok(Self {
            source: source.to_vec(),
            target: target.to_vec(),
            control,
            origin: layout.origin,
            radius: layout.radius,
            radial,
            linear,
            offset,
            coplanar: layout.coplanar,
        })
    }

    /// Number of control landmarks.
    #[inline]
    pub fn len(&self) -> usize {
        self.source.len()
    }

    /// Always false; a warp has at least four control points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    /// Source control points.
    pub fn source(&self) -> &[Point3<f64>] {
        &self.source
    }

    /// Target control points.
    pub fn target(&self) -> &[Point3<f64>] {
        &self.target
    }

    /// True if the source landmarks lie in a plane.
    pub fn is_coplanar(&self) -> bool {
        self.coplanar
    }

    /// Warp a single point.
    pub fn apply(&self, point: &Point3<f64>) -> Point3<f64> {
        let q = (point.coords - self.origin) / self.radius;
        let mut displacement = self.offset + self.linear * q;
        for (c, w) in self.control.iter().zip(&self.radial) {
            displacement += w * (q - c).norm();
        }
        point + displacement
    }

    /// Warp a point array, preserving order.
    pub fn apply_points(&self, points: &[Point3<f64>]) -> Vec<Point3<f64>> {
        points.par_iter().map(|p| self.apply(p)).collect()
    }

    /// Warp every mesh vertex. Connectivity is shared, not copied.
    pub fn apply_mesh(&self, mesh: &Mesh) -> Mesh {
        trace!(vertices = mesh.vertex_count(), "Warping mesh");
        mesh.replaced_positions(self.apply_points(&mesh.positions))
    }

    /// Warp a landmark set, keeping labels.
    pub fn apply_landmarks(&self, landmarks: &LandmarkSet) -> LandmarkSet {
        landmarks.with_points(self.apply_points(landmarks.points()))
    }

    /// The warp in the opposite direction (target onto source).
    ///
    /// Exact at the control points; elsewhere it is the spline of the
    /// reversed correspondence, not a functional inverse.
    pub fn reversed(&self) -> CorrespondResult<WarpField> {
        WarpField::from_points(&self.target, &self.source)
    }
}

struct Layout {
    origin: Vector3<f64>,
    radius: f64,
    coplanar: bool,
}

/// Reject configurations that cannot carry a 3D spline.
fn check_configuration(points: &[Point3<f64>]) -> CorrespondResult<Layout> {
    if points.len() < 4 {
        return Err(CorrespondError::degenerate(format!(
            "{} landmarks given, at least 4 required",
            points.len()
        )));
    }
    if let Some(i) = points
        .iter()
        .position(|p| !p.coords.iter().all(|c| c.is_finite()))
    {
        return Err(CorrespondError::degenerate(format!(
            "landmark {} has a non-finite coordinate",
            i
        )));
    }

    let origin: Vector3<f64> =
        points.iter().map(|p| p.coords).sum::<Vector3<f64>>() / points.len() as f64;
    let radius = points
        .iter()
        .map(|p| (p.coords - origin).norm())
        .fold(0.0, f64::max);
    if radius <= 0.0 {
        return Err(CorrespondError::degenerate("all landmarks coincide"));
    }

    let tolerance = radius * COINCIDENT_TOLERANCE;
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            if (points[i] - points[j]).norm() <= tolerance {
                return Err(CorrespondError::degenerate(format!(
                    "landmarks {} and {} coincide",
                    i, j
                )));
            }
        }
    }

    let mut scatter = Matrix3::zeros();
    for p in points {
        let c = (p.coords - origin) / radius;
        scatter += c * c.transpose();
    }
    let spread = scatter.singular_values();
    let mut sorted = [spread[0], spread[1], spread[2]];
    sorted.sort_by(|a, b| b.total_cmp(a));
    if sorted[1] <= sorted[0] * FLATNESS_TOLERANCE {
        return Err(CorrespondError::degenerate("landmarks are collinear"));
    }
    let coplanar = sorted[2] <= sorted[0] * FLATNESS_TOLERANCE;

    Ok(Layout {
        origin,
        radius,
        coplanar,
    })
}
