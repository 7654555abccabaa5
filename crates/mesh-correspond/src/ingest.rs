//! Sample identity and in-memory landmark import.
//!
//! Meshes and landmark sets arrive separately and are paired by sample ID,
//! which is derived from a file name by [`sample_id`]. Anything that fails
//! to pair is reported as [`CorrespondError::MissingPair`] and left out of
//! the run.

use std::path::Path;

use nalgebra::{DMatrix, Point3};
use tracing::{debug, warn};

use crate::error::{CorrespondError, CorrespondResult};
use crate::types::{Landmark, LandmarkSet, Mesh, SampleGroup, Specimen};

/// Derive a sample ID from a file name.
///
/// Directory components and the final extension are removed, then the
/// first entry of `suffixes` that ends the remaining name is stripped.
///
/// ```
/// use mesh_correspond::ingest::sample_id;
///
/// assert_eq!(sample_id("scans/skull_07_align.ply", &["_align", "_mirror"]), "skull_07");
/// assert_eq!(sample_id("skull_07.fcsv", &["_align"]), "skull_07");
/// ```
pub fn sample_id(file_name: &str, suffixes: &[&str]) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    suffixes
        .iter()
        .find_map(|suffix| stem.strip_suffix(suffix).filter(|s| !s.is_empty()))
        .unwrap_or(stem)
        .to_string()
}

/// Pair meshes with landmark sets by sample ID.
///
/// The output follows the mesh group's order. Every ID present on only
/// one side is logged and returned as a [`CorrespondError::MissingPair`].
pub fn pair_samples(
    meshes: SampleGroup<Mesh>,
    mut landmarks: SampleGroup<LandmarkSet>,
) -> (SampleGroup<Specimen>, Vec<CorrespondError>) {
    let mut paired = SampleGroup::with_capacity(meshes.len());
    let mut missing = Vec::new();

    for (id, mesh) in meshes {
        match landmarks.get(&id) {
            Some(set) => {
                paired.insert(id, Specimen::new(mesh, set.clone()));
            }
            None => {
                warn!(sample = %id, "Mesh has no matching landmarks, skipping");
                missing.push(CorrespondError::missing_pair(id, "landmarks"));
            }
        }
    }

    landmarks.retain(|id, _| !paired.contains(id));
    for id in landmarks.ids() {
        warn!(sample = %id, "Landmarks have no matching mesh, skipping");
        missing.push(CorrespondError::missing_pair(id, "mesh"));
    }

    debug!(
        paired = paired.len(),
        missing = missing.len(),
        "Paired samples"
    );
    (paired, missing)
}

/// Build a landmark set from a 3×N coordinate matrix, one landmark per column.
///
/// Keeps the 1-based inclusive range `first..=last`, labelled
/// `{prefix}_{index}`. With `flip_xy` the X and Y coordinates are negated,
/// converting between RAS and LPS conventions.
///
/// # Errors
///
/// - [`CorrespondError::InvalidParameter`] if the matrix is not 3 rows or
///   the range is empty or out of bounds
pub fn landmarks_from_columns(
    prefix: &str,
    columns: &DMatrix<f64>,
    first: usize,
    last: usize,
    flip_xy: bool,
) -> CorrespondResult<LandmarkSet> {
    if columns.nrows() != 3 {
        return Err(CorrespondError::invalid_parameter(
            "columns",
            format!("expected 3 rows, found {}", columns.nrows()),
        ));
    }
    if first == 0 || first > last || last > columns.ncols() {
        return Err(CorrespondError::invalid_parameter(
            "range",
            format!(
                "{}..={} is not within 1..={}",
                first,
                last,
                columns.ncols()
            ),
        ));
    }

    let sign = if flip_xy { -1.0 } else { 1.0 };
    Ok(LandmarkSet::new((first..=last).map(|index| {
        let c = columns.column(index - 1);
        Landmark::new(
            format!("{}_{}", prefix, index),
            Point3::new(sign * c[0], sign * c[1], c[2]),
        )
    })))
}
