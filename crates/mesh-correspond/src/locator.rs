//! Nearest-point-on-surface queries.
//!
//! [`SurfaceLocator`] indexes the fan-triangulated faces of a mesh with a
//! k-d tree over triangle centroids. A query first takes the triangle whose
//! centroid is nearest, measures the exact distance `d` to it, then examines
//! every triangle whose centroid lies within `d + r_max` (`r_max` being the
//! largest centroid-to-corner radius in the mesh), which cannot miss the true
//! closest triangle.
//!
//! The tree is built once from the full centroid slice, so flat patches with
//! many centroids sharing a coordinate are indexed like any other surface.
//!
//! Among triangles at exactly the same distance the lowest polygon index
//! wins, so results are deterministic for a fixed mesh and query.

use kiddo::{ImmutableKdTree, SquaredEuclidean};
use nalgebra::{Point3, Vector3};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{CorrespondError, CorrespondResult};
use crate::types::Mesh;

/// Result of a closest-point query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosestPoint {
    /// Point on the surface.
    pub point: Point3<f64>,
    /// Index of the polygon containing `point`.
    pub face_id: usize,
    /// Euclidean distance from the query.
    pub distance: f64,
}

#[derive(Debug, Clone)]
struct Triangle {
    face_id: usize,
    corners: [Point3<f64>; 3],
}

/// Spatial index over a mesh surface.
#[derive(Debug)]
pub struct SurfaceLocator {
    triangles: Vec<Triangle>,
    tree: ImmutableKdTree<f64, 3>,
    max_radius: f64,
}

impl SurfaceLocator {
    /// Index the faces of `mesh`.
    ///
    /// # Errors
    ///
    /// - [`CorrespondError::InvalidFaceIndex`] if a face references a missing vertex
    /// - [`CorrespondError::EmptyMesh`] if the mesh has no triangulable faces
    pub fn build(mesh: &Mesh) -> CorrespondResult<Self> {
        mesh.validate()?;

        let triangles: Vec<Triangle> = mesh
            .triangles()
            .map(|(face_id, corners)| Triangle { face_id, corners })
            .collect();
        if triangles.is_empty() {
            return Err(CorrespondError::empty_mesh(format!(
                "no surface to project onto ({} vertices, {} faces)",
                mesh.vertex_count(),
                mesh.face_count()
            )));
        }

        let mut max_radius: f64 = 0.0;
        let centroids: Vec<[f64; 3]> = triangles
            .iter()
            .map(|tri| {
                let c = triangle_centroid(&tri.corners);
                for corner in &tri.corners {
                    max_radius = max_radius.max((corner - c).norm());
                }
                [c.x, c.y, c.z]
            })
            .collect();
        // Items are positions in `centroids`, which match `triangles`.
        let tree: ImmutableKdTree<f64, 3> = ImmutableKdTree::new_from_slice(&centroids);

        debug!(
            triangles = triangles.len(),
            max_radius = max_radius,
            "Built surface locator"
        );

        Ok(Self {
            triangles,
            tree,
            max_radius,
        })
    }

    /// Number of indexed triangles.
    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// Closest point on the surface to `query`.
    pub fn closest_point(&self, query: &Point3<f64>) -> ClosestPoint {
        let q = [query.x, query.y, query.z];
        let seed = self.tree.nearest_one::<SquaredEuclidean>(&q).item as usize;
        let seed_point = closest_point_on_triangle(query, &self.triangles[seed].corners);
        let bound = (seed_point - query).norm() + self.max_radius;
        // Slack so rounding in the tree's distances cannot drop a candidate.
        let radius = bound * (1.0 + 1e-9) + 1e-12;

        let mut best = self.evaluate(seed, query);
        for candidate in self
            .tree
            .within_unsorted::<SquaredEuclidean>(&q, radius * radius)
        {
            let hit = self.evaluate(candidate.item as usize, query);
            if is_better(&hit, &best) {
                best = hit;
            }
        }

        ClosestPoint {
            point: best.point,
            face_id: best.face_id,
            distance: best.distance_sq.sqrt(),
        }
    }

    /// Project every point onto the surface, preserving order.
    pub fn project_points(&self, points: &[Point3<f64>]) -> Vec<Point3<f64>> {
        points
            .par_iter()
            .map(|p| self.closest_point(p).point)
            .collect()
    }

    fn evaluate(&self, index: usize, query: &Point3<f64>) -> Hit {
        let tri = &self.triangles[index];
        let point = closest_point_on_triangle(query, &tri.corners);
        Hit {
            point,
            face_id: tri.face_id,
            distance_sq: (point - query).norm_squared(),
        }
    }
}

struct Hit {
    point: Point3<f64>,
    face_id: usize,
    distance_sq: f64,
}

fn is_better(candidate: &Hit, current: &Hit) -> bool {
    candidate.distance_sq < current.distance_sq
        || (candidate.distance_sq == current.distance_sq && candidate.face_id < current.face_id)
}

fn triangle_centroid(corners: &[Point3<f64>; 3]) -> Point3<f64> {
    let sum: Vector3<f64> = corners.iter().map(|p| p.coords).sum();
    Point3::from(sum / 3.0)
}

/// Closest point on triangle `abc` to `p` (Voronoi-region walk).
pub(crate) fn closest_point_on_triangle(p: &Point3<f64>, corners: &[Point3<f64>; 3]) -> Point3<f64> {
    let [a, b, c] = *corners;
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;

    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return a;
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return a + ab * v;
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * w;
    }

    let denom = va + vb + vc;
    if denom.abs() <= f64::MIN_POSITIVE {
        // Zero-area triangle; its corners are the only reliable candidates.
        return *corners
            .iter()
            .min_by(|x, y| (*x - p).norm_squared().total_cmp(&(*y - p).norm_squared()))
            .unwrap_or(&a);
    }
    let v = vb / denom;
    let w = vc / denom;
    a + ab * v + ac * w
}
