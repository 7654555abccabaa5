//! Property-based tests for warps, alignment and surface queries.
//!
//! These tests use proptest to generate random configurations and verify
//! invariants.
//!
//! Run with: cargo test -p mesh-correspond -- proptest

use mesh_correspond::{
    BilateralMap, LandmarkSet, Mesh, ProcrustesParams, SampleGroup, SubsetParams, SurfaceLocator,
    WarpField, landmark_subset, procrustes_align, sample_id,
};
use nalgebra::{Matrix3, Point3, UnitQuaternion, Vector3};
use proptest::prelude::*;

// =============================================================================
// Strategies
// =============================================================================

/// Corners of a 2x2x2 cube: a well-spread, non-coplanar base configuration.
fn cube_corners() -> Vec<Point3<f64>> {
    let mut corners = Vec::with_capacity(8);
    for &x in &[-1.0, 1.0] {
        for &y in &[-1.0, 1.0] {
            for &z in &[-1.0, 1.0] {
                corners.push(Point3::new(x, y, z));
            }
        }
    }
    corners
}

fn arb_offset(range: f64) -> impl Strategy<Value = Vector3<f64>> {
    prop::array::uniform3(-range..range).prop_map(|[x, y, z]| Vector3::new(x, y, z))
}

fn arb_point(range: f64) -> impl Strategy<Value = Point3<f64>> {
    arb_offset(range).prop_map(Point3::from)
}

/// Cube corners jittered by up to 0.3 per axis.
fn arb_landmarks() -> impl Strategy<Value = Vec<Point3<f64>>> {
    prop::collection::vec(arb_offset(0.3), 8).prop_map(|jitter| {
        cube_corners()
            .into_iter()
            .zip(jitter)
            .map(|(p, j)| p + j)
            .collect()
    })
}

/// An invertible linear map near the identity.
fn arb_linear() -> impl Strategy<Value = Matrix3<f64>> {
    prop::array::uniform9(-0.3..0.3f64)
        .prop_map(|e| Matrix3::identity() + Matrix3::from_row_slice(&e))
}

fn arb_rotation() -> impl Strategy<Value = UnitQuaternion<f64>> {
    prop::array::uniform3(-std::f64::consts::PI..std::f64::consts::PI)
        .prop_map(|[r, p, y]| UnitQuaternion::from_euler_angles(r, p / 2.0, y))
}

/// Closed unit cube centred on the origin, quad faces.
fn cube_mesh() -> Mesh {
    let positions = cube_corners().into_iter().map(|p| p * 0.5).collect();
    // Corner index = 4x + 2y + z over {0, 1}.
    let faces = vec![
        vec![0, 1, 3, 2],
        vec![4, 6, 7, 5],
        vec![0, 4, 5, 1],
        vec![2, 3, 7, 6],
        vec![0, 2, 6, 4],
        vec![1, 5, 7, 3],
    ];
    Mesh::new(positions, faces)
}

/// Exact distance from `q` to the surface of the cube `[-0.5, 0.5]^3`.
fn cube_surface_distance(q: &Point3<f64>) -> f64 {
    let d = q.coords.abs().add_scalar(-0.5);
    let outside = d.map(|c| c.max(0.0)).norm();
    if outside > 0.0 { outside } else { -d.max() }
}

// =============================================================================
// Property Tests: Warps
// =============================================================================

proptest! {
    /// A warp reproduces every target landmark.
    #[test]
    fn proptest_warp_exact_at_landmarks(
        source in arb_landmarks(),
        displacement in prop::collection::vec(arb_offset(0.5), 8),
    ) {
        let target: Vec<Point3<f64>> = source
            .iter()
            .zip(&displacement)
            .map(|(p, d)| p + d)
            .collect();
        let warp = WarpField::from_points(&source, &target).unwrap();
        for (s, t) in source.iter().zip(&target) {
            let got = warp.apply(s);
            prop_assert!((got - t).norm() < 1e-6, "{} != {}", got, t);
        }
    }

    /// Under an affine relation the reverse warp undoes the forward warp
    /// everywhere.
    #[test]
    fn proptest_affine_round_trip(
        source in arb_landmarks(),
        linear in arb_linear(),
        shift in arb_offset(5.0),
        queries in prop::collection::vec(arb_point(2.0), 1..20),
    ) {
        let target: Vec<Point3<f64>> = source.iter().map(|p| linear * p + shift).collect();
        let forward = WarpField::from_points(&source, &target).unwrap();
        let back = forward.reversed().unwrap();
        for q in &queries {
            let round = back.apply(&forward.apply(q));
            prop_assert!((round - q).norm() < 1e-6, "{} -> {}", q, round);
        }
    }
}

// =============================================================================
// Property Tests: Alignment
// =============================================================================

proptest! {
    /// Rigidly moved copies of one configuration superimpose exactly.
    #[test]
    fn proptest_congruent_copies_align(
        points in arb_landmarks(),
        rotation in arb_rotation(),
        shift in arb_offset(10.0),
    ) {
        let base = LandmarkSet::from_points(points);
        let moved = base.map_points(|p| rotation * p + shift);
        let group: SampleGroup<LandmarkSet> =
            [("base", base), ("moved", moved)].into_iter().collect();

        let result = procrustes_align(&group, &ProcrustesParams::rigid()).unwrap();
        prop_assert!(result.residual < 1e-9, "residual {}", result.residual);
        prop_assert_eq!(result.closest_to_mean(), Some((0, "base")));
    }
}

// =============================================================================
// Property Tests: Surface Queries
// =============================================================================

proptest! {
    /// The closest point is on the surface and no vertex is closer.
    #[test]
    fn proptest_closest_point_matches_cube_distance(query in arb_point(3.0)) {
        let mesh = cube_mesh();
        let locator = SurfaceLocator::build(&mesh).unwrap();
        let hit = locator.closest_point(&query);

        prop_assert!((hit.distance - cube_surface_distance(&query)).abs() < 1e-9);
        prop_assert!(((hit.point - query).norm() - hit.distance).abs() < 1e-9);
        prop_assert!(cube_surface_distance(&hit.point) < 1e-9);
        for v in &mesh.positions {
            prop_assert!(hit.distance <= (v - query).norm() + 1e-9);
        }
    }

    /// Subsets are sorted, unique and in range.
    #[test]
    fn proptest_subset_indices_valid(
        points in prop::collection::vec(arb_point(5.0), 1..200),
        spacing in 0.1..4.0f64,
    ) {
        let mesh = Mesh::point_cloud(points);
        let kept = landmark_subset(&mesh, &SubsetParams::with_spacing(spacing)).unwrap();
        prop_assert!(!kept.is_empty());
        prop_assert!(kept.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(kept.iter().all(|&i| i < mesh.vertex_count()));
    }
}

// =============================================================================
// Property Tests: Identity and Relabelling
// =============================================================================

proptest! {
    /// Every shuffle of 0..n is a valid bilateral map.
    #[test]
    fn proptest_permutations_accepted(
        indices in (1usize..30).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle()),
    ) {
        let map = BilateralMap::new(indices.clone()).unwrap();
        let permuted = map.permute(&(0..indices.len()).collect::<Vec<_>>());
        prop_assert_eq!(permuted, indices);
    }

    /// Stripping a suffix never empties a sample ID.
    #[test]
    fn proptest_sample_id_never_empty(stem in "[a-z0-9_]{1,12}") {
        let name = format!("dir/{}.ply", stem);
        let id = sample_id(&name, &["_align", "_mirror", "_"]);
        prop_assert!(!id.is_empty());
        prop_assert!(stem.starts_with(&id));
    }
}
