//! Core geometric value types.

use std::sync::Arc;

use hashbrown::HashMap;
use nalgebra::{Point3, Vector3};

use crate::error::{CorrespondError, CorrespondResult};

/// A polygon as indices into a mesh's position array.
///
/// Triangles are the common case; quads and larger polygons are accepted and
/// fan-triangulated from their first vertex wherever surface queries need it.
pub type Face = Vec<u32>;

/// Immutable, shareable face connectivity.
///
/// Cloning is cheap (reference counted). Every correspondence result for a
/// run shares the reference mesh's `Connectivity`, which is what makes
/// per-vertex aggregation across samples well-defined.
#[derive(Debug, Clone)]
pub struct Connectivity {
    faces: Arc<[Face]>,
}

impl Connectivity {
    /// Wrap a face list.
    pub fn new(faces: Vec<Face>) -> Self {
        Self {
            faces: faces.into(),
        }
    }

    /// Connectivity without faces (bare point sets).
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// The polygons, in order.
    #[inline]
    pub fn faces(&self) -> &[Face] {
        &self.faces
    }

    /// Number of polygons.
    #[inline]
    pub fn len(&self) -> usize {
        self.faces.len()
    }

    /// True if there are no polygons.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// True if both handles point at the same face storage.
    #[inline]
    pub fn shares_storage(&self, other: &Connectivity) -> bool {
        Arc::ptr_eq(&self.faces, &other.faces)
    }

    /// Fan triangulation of every polygon, tagged with its polygon index.
    ///
    /// Polygons with fewer than three indices yield nothing.
    pub fn triangles(&self) -> impl Iterator<Item = (usize, [u32; 3])> + '_ {
        self.faces.iter().enumerate().flat_map(|(face_id, face)| {
            let first = face.first().copied();
            face.windows(2)
                .skip(1)
                .filter_map(move |w| first.map(|f| (face_id, [f, w[0], w[1]])))
        })
    }

    /// Check every index against a vertex count.
    pub fn validate(&self, vertex_count: usize) -> CorrespondResult<()> {
        for (face_index, face) in self.faces.iter().enumerate() {
            if let Some(&bad) = face.iter().find(|&&i| i as usize >= vertex_count) {
                return Err(CorrespondError::InvalidFaceIndex {
                    face_index,
                    vertex_index: bad,
                    vertex_count,
                });
            }
        }
        Ok(())
    }

    /// Same polygons with every index order reversed (flips orientation).
    pub fn reversed(&self) -> Connectivity {
        Connectivity::new(
            self.faces
                .iter()
                .map(|f| f.iter().rev().copied().collect())
                .collect(),
        )
    }
}

impl PartialEq for Connectivity {
    fn eq(&self, other: &Self) -> bool {
        self.shares_storage(other) || self.faces == other.faces
    }
}

impl From<Vec<Face>> for Connectivity {
    fn from(faces: Vec<Face>) -> Self {
        Self::new(faces)
    }
}

/// A polygon mesh: ordered vertex positions plus immutable connectivity.
///
/// Only positions change when a mesh is warped, projected or mirrored by
/// translation; connectivity is carried along untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    /// Vertex positions.
    pub positions: Vec<Point3<f64>>,

    connectivity: Connectivity,
}

impl Mesh {
    /// Create a mesh from positions and polygons without validation.
    ///
    /// Use [`Mesh::validate`] or [`Mesh::from_parts`] when indices come from
    /// untrusted input.
    pub fn new(positions: Vec<Point3<f64>>, faces: Vec<Face>) -> Self {
        Self {
            positions,
            connectivity: Connectivity::new(faces),
        }
    }

    /// Create a mesh from positions and shared connectivity, checking indices.
    pub fn from_parts(
        positions: Vec<Point3<f64>>,
        connectivity: Connectivity,
    ) -> CorrespondResult<Self> {
        connectivity.validate(positions.len())?;
        Ok(Self {
            positions,
            connectivity,
        })
    }

    /// A mesh with no faces.
    pub fn point_cloud(positions: Vec<Point3<f64>>) -> Self {
        Self {
            positions,
            connectivity: Connectivity::empty(),
        }
    }

    /// Face connectivity.
    #[inline]
    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// Polygons, in order.
    #[inline]
    pub fn faces(&self) -> &[Face] {
        self.connectivity.faces()
    }

    /// Number of vertices.
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Number of polygons.
    #[inline]
    pub fn face_count(&self) -> usize {
        self.connectivity.len()
    }

    /// True if the mesh has no vertices.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Check face indices against the vertex count.
    pub fn validate(&self) -> CorrespondResult<()> {
        self.connectivity.validate(self.positions.len())
    }

    /// Replace positions, keeping this mesh's connectivity.
    pub fn with_positions(&self, positions: Vec<Point3<f64>>) -> CorrespondResult<Mesh> {
        Mesh::from_parts(positions, self.connectivity.clone())
    }

    /// Replace positions without re-checking indices. Callers guarantee the
    /// vertex count is unchanged.
    pub(crate) fn replaced_positions(&self, positions: Vec<Point3<f64>>) -> Mesh {
        debug_assert_eq!(positions.len(), self.positions.len());
        Mesh {
            positions,
            connectivity: self.connectivity.clone(),
        }
    }

    /// Apply a function to every position, keeping connectivity.
    pub fn map_positions(&self, f: impl Fn(&Point3<f64>) -> Point3<f64>) -> Mesh {
        Mesh {
            positions: self.positions.iter().map(f).collect(),
            connectivity: self.connectivity.clone(),
        }
    }

    /// Compute the axis-aligned bounding box.
    /// Returns (min_corner, max_corner) or None if mesh is empty.
    pub fn bounds(&self) -> Option<(Point3<f64>, Point3<f64>)> {
        bounds_of(&self.positions)
    }

    /// Mean of all vertex positions.
    pub fn centroid(&self) -> Option<Point3<f64>> {
        centroid_of(&self.positions)
    }

    /// Iterate over fan-triangulated faces as `(polygon index, corner positions)`.
    pub fn triangles(&self) -> impl Iterator<Item = (usize, [Point3<f64>; 3])> + '_ {
        self.connectivity.triangles().map(|(face_id, [a, b, c])| {
            (
                face_id,
                [
                    self.positions[a as usize],
                    self.positions[b as usize],
                    self.positions[c as usize],
                ],
            )
        })
    }

    /// Translate mesh by the given vector.
    pub fn translate(&mut self, offset: Vector3<f64>) {
        for p in &mut self.positions {
            *p += offset;
        }
    }

    /// Scale mesh uniformly around the origin.
    pub fn scale(&mut self, factor: f64) {
        for p in &mut self.positions {
            p.coords *= factor;
        }
    }
}

/// A named, homologous 3D point.
#[derive(Debug, Clone, PartialEq)]
pub struct Landmark {
    /// Label, e.g. `"nasion"` or `"F-3"`.
    pub label: String,
    /// Position.
    pub position: Point3<f64>,
}

impl Landmark {
    /// Create a landmark.
    pub fn new(label: impl Into<String>, position: Point3<f64>) -> Self {
        Self {
            label: label.into(),
            position,
        }
    }
}

/// An ordered set of named landmarks.
///
/// Order is semantic: index `i` denotes the same anatomical point in every
/// sample of an analysis.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LandmarkSet {
    labels: Vec<String>,
    points: Vec<Point3<f64>>,
}

impl LandmarkSet {
    /// Build from labelled landmarks.
    pub fn new(landmarks: impl IntoIterator<Item = Landmark>) -> Self {
        let (labels, points) = landmarks
            .into_iter()
            .map(|l| (l.label, l.position))
            .unzip();
        Self { labels, points }
    }

    /// Build from bare points, labelled `F-1`, `F-2`, ...
    pub fn from_points(points: Vec<Point3<f64>>) -> Self {
        let labels = (1..=points.len()).map(|i| format!("F-{}", i)).collect();
        Self { labels, points }
    }

    /// Number of landmarks.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True if there are no landmarks.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Landmark positions in order.
    #[inline]
    pub fn points(&self) -> &[Point3<f64>] {
        &self.points
    }

    /// Landmark labels in order.
    #[inline]
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Landmark at `index`.
    pub fn get(&self, index: usize) -> Option<Landmark> {
        Some(Landmark::new(
            self.labels.get(index)?.clone(),
            *self.points.get(index)?,
        ))
    }

    /// Iterate over `(label, position)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Point3<f64>)> {
        self.labels
            .iter()
            .map(String::as_str)
            .zip(self.points.iter())
    }

    /// Same labels, new positions. `points` must have the same length.
    pub(crate) fn with_points(&self, points: Vec<Point3<f64>>) -> LandmarkSet {
        debug_assert_eq!(points.len(), self.points.len());
        LandmarkSet {
            labels: self.labels.clone(),
            points,
        }
    }

    /// Apply a function to every position, keeping labels.
    pub fn map_points(&self, f: impl Fn(&Point3<f64>) -> Point3<f64>) -> LandmarkSet {
        self.with_points(self.points.iter().map(f).collect())
    }

    /// Mean landmark position.
    pub fn centroid(&self) -> Option<Point3<f64>> {
        centroid_of(&self.points)
    }

    /// Square root of the summed squared distances to the centroid.
    pub fn centroid_size(&self) -> f64 {
        match self.centroid() {
            Some(c) => self
                .points
                .iter()
                .map(|p| (p - c).norm_squared())
                .sum::<f64>()
                .sqrt(),
            None => 0.0,
        }
    }
}

/// Insertion-ordered collection of same-kind values keyed by sample ID.
///
/// Iteration order is insertion order, which keeps every downstream
/// reduction deterministic.
#[derive(Debug, Clone)]
pub struct SampleGroup<T> {
    entries: Vec<(String, T)>,
    index: HashMap<String, usize>,
}

impl<T> SampleGroup<T> {
    /// Create an empty group.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Create an empty group with room for `capacity` samples.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    /// Insert a sample. An existing ID keeps its position and its value is
    /// replaced; the previous value is returned.
    pub fn insert(&mut self, id: impl Into<String>, value: T) -> Option<T> {
        let id = id.into();
        match self.index.get(&id) {
            Some(&pos) => Some(std::mem::replace(&mut self.entries[pos].1, value)),
            None => {
                self.index.insert(id.clone(), self.entries.len());
                self.entries.push((id, value));
                None
            }
        }
    }

    /// Value for a sample ID.
    pub fn get(&self, id: &str) -> Option<&T> {
        self.index.get(id).map(|&pos| &self.entries[pos].1)
    }

    /// Entry at an iteration position.
    pub fn get_index(&self, position: usize) -> Option<(&str, &T)> {
        self.entries
            .get(position)
            .map(|(id, value)| (id.as_str(), value))
    }

    /// Iteration position of a sample ID.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// True if the ID is present.
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Number of samples.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no samples.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(id, value)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(id, value)| (id.as_str(), value))
    }

    /// Sample IDs in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(id, _)| id.as_str())
    }

    /// Values in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, value)| value)
    }

    /// Ordered entries as a slice.
    pub fn as_slice(&self) -> &[(String, T)] {
        &self.entries
    }

    /// Keep only the samples for which `keep` returns true, preserving order.
    pub fn retain(&mut self, mut keep: impl FnMut(&str, &T) -> bool) {
        self.entries.retain(|(id, value)| keep(id, value));
        self.reindex();
    }

    /// Transform every value, preserving IDs and order.
    pub fn map<U>(&self, mut f: impl FnMut(&str, &T) -> U) -> SampleGroup<U> {
        self.iter().map(|(id, v)| (id.to_string(), f(id, v))).collect()
    }

    fn reindex(&mut self) {
        self.index.clear();
        for (pos, (id, _)) in self.entries.iter().enumerate() {
            self.index.insert(id.clone(), pos);
        }
    }
}

impl<T> Default for SampleGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PartialEq> PartialEq for SampleGroup<T> {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl<T, S: Into<String>> FromIterator<(S, T)> for SampleGroup<T> {
    fn from_iter<I: IntoIterator<Item = (S, T)>>(iter: I) -> Self {
        let mut group = SampleGroup::new();
        for (id, value) in iter {
            group.insert(id, value);
        }
        group
    }
}

impl<T> IntoIterator for SampleGroup<T> {
    type Item = (String, T);
    type IntoIter = std::vec::IntoIter<(String, T)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// A mesh with its landmark set, the unit every pipeline stage consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct Specimen {
    /// Surface.
    pub mesh: Mesh,
    /// Homologous landmarks placed on the surface.
    pub landmarks: LandmarkSet,
}

impl Specimen {
    /// Pair a mesh with its landmarks.
    pub fn new(mesh: Mesh, landmarks: LandmarkSet) -> Self {
        Self { mesh, landmarks }
    }
}

pub(crate) fn bounds_of(points: &[Point3<f64>]) -> Option<(Point3<f64>, Point3<f64>)> {
    let first = points.first()?;
    let mut min = *first;
    let mut max = *first;
    for p in &points[1..] {
        min = min.inf(p);
        max = max.sup(p);
    }
    Some((min, max))
}

pub(crate) fn centroid_of(points: &[Point3<f64>]) -> Option<Point3<f64>> {
    if points.is_empty() {
        return None;
    }
    let sum: Vector3<f64> = points.iter().map(|p| p.coords).sum();
    Some(Point3::from(sum / points.len() as f64))
}
