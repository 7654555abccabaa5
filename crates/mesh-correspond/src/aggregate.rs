//! Reductions over a group of correspondence results.
//!
//! Every input mesh is expected to carry the reference's vertex layout, so
//! vertex `j` means the same surface location in every sample. The
//! functions here check that the vertex counts agree and reduce across
//! samples one vertex at a time.

use nalgebra::{Point3, Vector3};
use tracing::{debug, info};

use crate::error::{CorrespondError, CorrespondResult};
use crate::types::{Connectivity, LandmarkSet, Mesh, SampleGroup};

/// Per-vertex distance statistics across a sample group.
#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    /// Mean distance per vertex.
    pub mean: Vec<f64>,
    /// Population standard deviation per vertex.
    pub std_dev: Vec<f64>,
    /// Distance per vertex for each sample, keyed by sample ID.
    pub magnitudes: SampleGroup<Vec<f64>>,
}

impl Statistics {
    /// Number of vertices described.
    pub fn vertex_count(&self) -> usize {
        self.mean.len()
    }

    /// Number of samples reduced.
    pub fn sample_count(&self) -> usize {
        self.magnitudes.len()
    }

    /// Largest mean distance and its vertex index.
    pub fn max_mean(&self) -> Option<(usize, f64)> {
        self.mean
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }
}

/// Elementwise mean of the positions of every mesh in the group.
///
/// The result carries `connectivity` unchanged.
///
/// # Errors
///
/// - [`CorrespondError::EmptyGroup`] if the group is empty
/// - [`CorrespondError::VertexCountMismatch`] if the meshes differ in size
/// - [`CorrespondError::InvalidFaceIndex`] if `connectivity` does not fit
pub fn mean_mesh(group: &SampleGroup<Mesh>, connectivity: &Connectivity) -> CorrespondResult<Mesh> {
    let vertex_count = check_vertex_counts(group)?;
    let mut sums = vec![Vector3::zeros(); vertex_count];
    for mesh in group.values() {
        for (sum, p) in sums.iter_mut().zip(&mesh.positions) {
            *sum += p.coords;
        }
    }
    let n = group.len() as f64;
    let positions = sums.into_iter().map(|s| Point3::from(s / n)).collect();

    debug!(
        samples = group.len(),
        vertices = vertex_count,
        "Computed mean mesh"
    );
    Mesh::from_parts(positions, connectivity.clone())
}

/// Elementwise mean of a landmark group, labelled like the first sample.
///
/// # Errors
///
/// - [`CorrespondError::EmptyGroup`] if the group is empty
/// - [`CorrespondError::LandmarkCountMismatch`] if the sets differ in length
pub fn mean_landmarks(group: &SampleGroup<LandmarkSet>) -> CorrespondResult<LandmarkSet> {
    let Some((_, first)) = group.get_index(0) else {
        return Err(CorrespondError::empty_group("no landmark sets to average"));
    };
    let mut sums = vec![Vector3::zeros(); first.len()];
    for (id, landmarks) in group.iter() {
        if landmarks.len() != first.len() {
            return Err(CorrespondError::landmark_count_mismatch(
                id,
                first.len(),
                landmarks.len(),
            ));
        }
        for (sum, p) in sums.iter_mut().zip(landmarks.points()) {
            *sum += p.coords;
        }
    }
    let n = group.len() as f64;
    Ok(first.with_points(sums.into_iter().map(|s| Point3::from(s / n)).collect()))
}

/// Per-vertex distance from `anchor` to every sample.
///
/// `magnitudes[i][j]` is the distance between `anchor` vertex `j` and
/// sample `i` vertex `j`. Mean and population standard deviation are taken
/// over the samples.
///
/// # Errors
///
/// - [`CorrespondError::EmptyGroup`] if the group is empty
/// - [`CorrespondError::VertexCountMismatch`] if a sample or the anchor
///   differs in size
pub fn point_statistics(group: &SampleGroup<Mesh>, anchor: &Mesh) -> CorrespondResult<Statistics> {
    let vertex_count = check_vertex_counts(group)?;
    if anchor.vertex_count() != vertex_count {
        return Err(CorrespondError::vertex_count_mismatch(
            "anchor",
            vertex_count,
            anchor.vertex_count(),
        ));
    }

    let magnitudes = group.map(|_, mesh| distances(&anchor.positions, &mesh.positions));
    let stats = reduce(magnitudes, vertex_count);
    info!(
        samples = stats.sample_count(),
        vertices = vertex_count,
        "Computed point statistics"
    );
    Ok(stats)
}

/// Per-vertex left/right distance for bilateral comparisons.
///
/// Samples are matched by ID. `magnitudes[i][j]` is the distance between
/// vertex `j` of `left[i]` and vertex `j` of `right[i]`. Left samples with
/// no right counterpart are reported as [`CorrespondError::MissingPair`].
///
/// # Errors
///
/// - [`CorrespondError::MissingPair`] for the first unmatched ID
/// - [`CorrespondError::EmptyGroup`] if the groups are empty
/// - [`CorrespondError::VertexCountMismatch`] if any mesh differs in size
pub fn symmetry_statistics(
    left: &SampleGroup<Mesh>,
    right: &SampleGroup<Mesh>,
) -> CorrespondResult<Statistics> {
    let vertex_count = check_vertex_counts(left)?;
    let mut magnitudes = SampleGroup::with_capacity(left.len());
    for (id, l) in left.iter() {
        let r = right
            .get(id)
            .ok_or_else(|| CorrespondError::missing_pair(id, "mirrored counterpart"))?;
        if r.vertex_count() != vertex_count {
            return Err(CorrespondError::vertex_count_mismatch(
                id,
                vertex_count,
                r.vertex_count(),
            ));
        }
        magnitudes.insert(id, distances(&l.positions, &r.positions));
    }
    let stats = reduce(magnitudes, vertex_count);
    info!(
        samples = stats.sample_count(),
        vertices = vertex_count,
        "Computed symmetry statistics"
    );
    Ok(stats)
}

fn check_vertex_counts(group: &SampleGroup<Mesh>) -> CorrespondResult<usize> {
    let Some((_, first)) = group.get_index(0) else {
        return Err(CorrespondError::empty_group("no meshes to aggregate"));
    };
    let expected = first.vertex_count();
    for (id, mesh) in group.iter() {
        if mesh.vertex_count() != expected {
            return Err(CorrespondError::vertex_count_mismatch(
                id,
                expected,
                mesh.vertex_count(),
            ));
        }
    }
    Ok(expected)
}

fn distances(a: &[Point3<f64>], b: &[Point3<f64>]) -> Vec<f64> {
    a.iter().zip(b).map(|(p, q)| (p - q).norm()).collect()
}

fn reduce(magnitudes: SampleGroup<Vec<f64>>, vertex_count: usize) -> Statistics {
    let n = magnitudes.len() as f64;
    let mut mean = vec![0.0; vertex_count];
    for values in magnitudes.values() {
        for (m, v) in mean.iter_mut().zip(values) {
            *m += v;
        }
    }
    for m in &mut mean {
        *m /= n;
    }

    let mut std_dev = vec![0.0; vertex_count];
    for values in magnitudes.values() {
        for ((s, v), m) in std_dev.iter_mut().zip(values).zip(&mean) {
            *s += (v - m) * (v - m);
        }
    }
    for s in &mut std_dev {
        *s = (*s / n).sqrt();
    }

    Statistics {
        mean,
        std_dev,
        magnitudes,
    }
}
