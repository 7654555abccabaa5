//! Sparse landmark subsets drawn from a dense reference.
//!
//! Decimates the reference vertex set on a voxel grid and keeps one
//! original vertex per occupied voxel. Because every correspondence result
//! shares the reference vertex order, the same index list selects the same
//! surface points from every sample.

use hashbrown::HashMap;
use nalgebra::{Point3, Vector3};
use tracing::debug;

use crate::error::{CorrespondError, CorrespondResult};
use crate::types::{Landmark, LandmarkSet, Mesh};

/// Parameters for [`landmark_subset`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "pipeline-config",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct SubsetParams {
    /// Voxel edge length, in mesh units.
    pub spacing: f64,
}

impl Default for SubsetParams {
    fn default() -> Self {
        Self { spacing: 1.0 }
    }
}

impl SubsetParams {
    /// Subset with the given voxel edge length.
    pub fn with_spacing(spacing: f64) -> Self {
        Self { spacing }
    }
}

/// Voxel-grid decimation of the mesh's vertices.
///
/// For each occupied voxel the vertex nearest the voxel's vertex centroid is
/// kept (lowest index on ties). Returns the retained vertex indices sorted
/// ascending.
///
/// # Errors
///
/// - [`CorrespondError::InvalidParameter`] if `spacing` is not positive and finite
/// - [`CorrespondError::EmptyMesh`] if the mesh has no vertices
pub fn landmark_subset(mesh: &Mesh, params: &SubsetParams) -> CorrespondResult<Vec<usize>> {
    if !(params.spacing.is_finite() && params.spacing > 0.0) {
        return Err(CorrespondError::invalid_parameter(
            "spacing",
            format!("must be positive and finite, got {}", params.spacing),
        ));
    }
    let Some((min_bound, _)) = mesh.bounds() else {
        return Err(CorrespondError::empty_mesh("no vertices to subsample"));
    };

    // Voxel data: (position_sum, member indices)
    let mut voxels: HashMap<(i64, i64, i64), (Vector3<f64>, Vec<usize>)> = HashMap::new();
    for (i, p) in mesh.positions.iter().enumerate() {
        let key = (
            ((p.x - min_bound.x) / params.spacing).floor() as i64,
            ((p.y - min_bound.y) / params.spacing).floor() as i64,
            ((p.z - min_bound.z) / params.spacing).floor() as i64,
        );
        let entry = voxels.entry(key).or_insert_with(|| (Vector3::zeros(), Vec::new()));
        entry.0 += p.coords;
        entry.1.push(i);
    }

    let mut kept: Vec<usize> = voxels
        .values()
        .filter_map(|(sum, members)| {
            let centroid = Point3::from(sum / members.len() as f64);
            // Members are in ascending order, so min_by keeps the first tie.
            members.iter().copied().min_by(|&a, &b| {
                let da = (mesh.positions[a] - centroid).norm_squared();
                let db = (mesh.positions[b] - centroid).norm_squared();
                da.total_cmp(&db)
            })
        })
        .collect();
    kept.sort_unstable();

    debug!(
        vertices = mesh.vertex_count(),
        kept = kept.len(),
        spacing = params.spacing,
        "Selected landmark subset"
    );
    Ok(kept)
}

/// Read the positions at `indices` out of a mesh as a landmark set.
///
/// Labels are the vertex indices, `V-{index}`.
///
/// # Errors
///
/// - [`CorrespondError::InvalidParameter`] if an index is out of range
pub fn select_points(mesh: &Mesh, indices: &[usize]) -> CorrespondResult<LandmarkSet> {
    indices
        .iter()
        .map(|&i| {
            mesh.positions
                .get(i)
                .map(|p| Landmark::new(format!("V-{}", i), *p))
                .ok_or_else(|| {
                    CorrespondError::invalid_parameter(
                        "indices",
                        format!("vertex {} out of range for {} vertices", i, mesh.vertex_count()),
                    )
                })
        })
        .collect::<CorrespondResult<Vec<_>>>()
        .map(LandmarkSet::new)
}
