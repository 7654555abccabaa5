//! Batch correspondence runs.
//!
//! [`CorrespondencePipeline`] takes a reference specimen and a group of
//! samples through the whole analysis:
//!
//! 1. Samples whose landmark count differs from the reference are skipped.
//! 2. Optional rigid pre-alignment onto the reference landmarks.
//! 3. Generalized Procrustes alignment of the sample landmarks.
//! 4. Per-sample correspondence with the configured [`Strategy`], in parallel.
//! 5. Mean mesh and per-point distance statistics against the reference.
//!
//! Per-sample failures are logged and returned in `skipped`; only problems
//! with the run as a whole abort it.
//!
//! # Example
//!
//! ```no_run
//! use mesh_correspond::pipeline::{CorrespondenceConfig, CorrespondencePipeline};
//! use mesh_correspond::{SampleGroup, Specimen};
//!
//! # fn load() -> (Specimen, SampleGroup<Specimen>) { unimplemented!() }
//! let (reference, samples) = load();
//! let output = CorrespondencePipeline::new(CorrespondenceConfig::default())
//!     .run(&reference, &samples)
//!     .unwrap();
//! println!(
//!     "{} samples corresponded, {} skipped",
//!     output.correspondences.len(),
//!     output.skipped.len()
//! );
//! ```

use rayon::prelude::*;
use tracing::{info, warn};

use crate::aggregate::{Statistics, mean_landmarks, mean_mesh, point_statistics, symmetry_statistics};
use crate::correspondence::{CorrespondenceStrategy, DeformableStrategy, WarpProject};
use crate::deformable::DeformableParams;
use crate::error::{CorrespondError, CorrespondResult};
use crate::mirror::{BilateralMap, MirrorAxis, mirror};
use crate::procrustes::{AlignmentResult, ProcrustesParams, procrustes_align};
use crate::progress::{CancelToken, ProgressCallback, ProgressTracker, StopReason};
use crate::subset::{SubsetParams, landmark_subset};
use crate::tracing_ext::{OperationTimer, log_mesh_stats};
use crate::transform::{FitMode, RigidTransform, fit_landmarks};
use crate::types::{LandmarkSet, Mesh, SampleGroup, Specimen};

/// Key suffix given to mirrored copies inside a symmetry run.
const MIRROR_SUFFIX: &str = "_mirror";

// =========================================================================
// Configuration
// =========================================================================

/// How each sample is brought onto the reference topology.
#[derive(Debug, Clone, Default)]
#[cfg_attr(
    feature = "pipeline-config",
    derive(serde::Serialize, serde::Deserialize),
    serde(tag = "kind", rename_all = "snake_case")
)]
pub enum Strategy {
    /// Landmark-driven warp to the consensus, projection, inverse warp.
    #[default]
    WarpProject,
    /// Landmark-free coherent point drift.
    Deformable(DeformableParams),
}

impl Strategy {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::WarpProject => "warp-project",
            Strategy::Deformable(_) => "deformable",
        }
    }
}

/// Everything a correspondence run needs besides its data.
///
/// # Example TOML
///
/// ```toml
/// name = "skulls"
/// rigid_prealign = true
///
/// [strategy]
/// kind = "deformable"
/// max_iterations = 50
/// beta = 3.0
///
/// [procrustes]
/// remove_scale = true
///
/// [subset]
/// spacing = 2.5
/// ```
#[derive(Debug, Clone, Default)]
#[cfg_attr(
    feature = "pipeline-config",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct CorrespondenceConfig {
    /// Optional name for this analysis.
    pub name: Option<String>,
    /// Correspondence strategy. Default: warp-project
    pub strategy: Strategy,
    /// Landmark superimposition parameters.
    pub procrustes: ProcrustesParams,
    /// Rigidly move every sample onto the reference landmarks before
    /// superimposition. Default: false
    pub rigid_prealign: bool,
    /// When set, also decimate the reference into a sparse landmark subset.
    pub subset: Option<SubsetParams>,
}

impl CorrespondenceConfig {
    /// Create a default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration with a name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Set the strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set Procrustes parameters.
    pub fn with_procrustes(mut self, procrustes: ProcrustesParams) -> Self {
        self.procrustes = procrustes;
        self
    }

    /// Enable or disable rigid pre-alignment.
    pub fn with_rigid_prealign(mut self, enabled: bool) -> Self {
        self.rigid_prealign = enabled;
        self
    }

    /// Request a landmark subset of the reference.
    pub fn with_subset(mut self, subset: SubsetParams) -> Self {
        self.subset = Some(subset);
        self
    }

    /// Load configuration from a TOML string.
    #[cfg(feature = "pipeline-config")]
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Serialize to TOML string.
    #[cfg(feature = "pipeline-config")]
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Load configuration from a JSON string.
    #[cfg(feature = "pipeline-config")]
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// Serialize to JSON string.
    #[cfg(feature = "pipeline-config")]
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

// =========================================================================
// Outputs
// =========================================================================

/// Result of [`CorrespondencePipeline::run`].
#[derive(Debug)]
pub struct PipelineOutput {
    /// Per-sample meshes on the reference topology, in sample order.
    pub correspondences: SampleGroup<Mesh>,
    /// Elementwise mean of the correspondences.
    pub mean_mesh: Mesh,
    /// Per-vertex distance from the reference to each correspondence.
    pub statistics: Statistics,
    /// Landmark superimposition of the admitted samples.
    pub alignment: AlignmentResult,
    /// Retained reference vertex indices, when a subset was requested.
    pub subset: Option<Vec<usize>>,
    /// Samples left out, with the reason.
    pub skipped: Vec<CorrespondError>,
}

/// Result of [`CorrespondencePipeline::generate_mean`].
#[derive(Debug)]
pub struct MeanTemplate {
    /// Mean mesh on the chosen reference's topology.
    pub mesh: Mesh,
    /// Elementwise mean of the sample landmarks.
    pub landmarks: LandmarkSet,
    /// ID of the sample closest to the consensus, used as reference.
    pub reference_id: String,
    /// Position of that sample among the admitted samples.
    pub reference_index: usize,
    /// The full run against that reference.
    pub output: PipelineOutput,
}

/// Result of [`CorrespondencePipeline::run_symmetry`].
#[derive(Debug)]
pub struct SymmetryOutput {
    /// Correspondences of the original samples.
    pub left: SampleGroup<Mesh>,
    /// Correspondences of the mirrored samples, same IDs as `left`.
    pub right: SampleGroup<Mesh>,
    /// Per-vertex left/right distance statistics.
    pub statistics: Statistics,
    /// Landmark superimposition of originals and mirrored copies together.
    pub alignment: AlignmentResult,
    /// Samples left out, with the reason.
    pub skipped: Vec<CorrespondError>,
}

// =========================================================================
// Pipeline
// =========================================================================

/// Runs correspondence analyses with a fixed configuration.
pub struct CorrespondencePipeline {
    config: CorrespondenceConfig,
    progress: Option<ProgressCallback>,
    cancel: CancelToken,
}

impl CorrespondencePipeline {
    /// Create a pipeline.
    pub fn new(config: CorrespondenceConfig) -> Self {
        Self {
            config,
            progress: None,
            cancel: CancelToken::new(),
        }
    }

    /// Report per-sample progress. Returning `false` cancels the run.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Observe an external cancellation token.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// The configuration.
    pub fn config(&self) -> &CorrespondenceConfig {
        &self.config
    }

    /// Bring every sample onto the reference topology and aggregate.
    ///
    /// # Errors
    ///
    /// - [`CorrespondError::EmptyMesh`] if the reference mesh is empty
    /// - [`CorrespondError::EmptyGroup`] if no sample survives admission or
    ///   correspondence
    /// - [`CorrespondError::RegistrationCancelled`] if the run was cancelled,
    ///   through the pipeline's token or one set on the strategy parameters
    /// - any reference-side failure (degenerate reference landmarks)
    pub fn run(
        &self,
        reference: &Specimen,
        samples: &SampleGroup<Specimen>,
    ) -> CorrespondResult<PipelineOutput> {
        let _timer = OperationTimer::with_context(
            "correspondence_pipeline",
            samples.len(),
            reference.mesh.vertex_count(),
        );
        check_reference(reference)?;
        log_mesh_stats(&reference.mesh, "reference");

        let mut skipped = Vec::new();
        let prealigned;
        let samples = if self.config.rigid_prealign {
            let (aligned, failed) = rigid_align_group(samples, &reference.landmarks);
            skipped.extend(failed);
            prealigned = aligned;
            &prealigned
        } else {
            samples
        };

        let admitted = admit(
            reference.landmarks.len(),
            samples.iter().map(|(id, s)| (id.to_string(), s)),
            &mut skipped,
        )?;
        let alignment = self.align(&admitted)?;
        self.finish(reference, &admitted, alignment, skipped)
    }

    /// Build a mean template from the samples alone.
    ///
    /// The sample whose aligned landmarks lie closest to the consensus
    /// becomes the reference; every sample is then corresponded onto it.
    /// The landmark count of the first sample is taken as authoritative.
    pub fn generate_mean(&self, samples: &SampleGroup<Specimen>) -> CorrespondResult<MeanTemplate> {
        let _timer = OperationTimer::with_context("generate_mean", samples.len(), 0);
        let Some((_, first)) = samples.get_index(0) else {
            return Err(CorrespondError::empty_group("no samples to average"));
        };

        let mut skipped = Vec::new();
        let admitted = admit(
            first.landmarks.len(),
            samples.iter().map(|(id, s)| (id.to_string(), s)),
            &mut skipped,
        )?;
        let alignment = self.align(&admitted)?;
        let (index, reference_id) = alignment
            .closest_to_mean()
            .ok_or_else(|| CorrespondError::empty_group("no aligned samples"))?;
        let reference_id = reference_id.to_string();
        let reference = admitted[index].1.clone();
        info!(reference = %reference_id, "Selected sample closest to consensus as reference");

        let landmark_group: SampleGroup<LandmarkSet> = admitted
            .iter()
            .map(|(id, s)| (id.clone(), s.landmarks.clone()))
            .collect();
        let landmarks = mean_landmarks(&landmark_group)?;

        let output = if self.config.rigid_prealign {
            let admitted_group: SampleGroup<Specimen> = admitted
                .iter()
                .map(|(id, s)| (id.clone(), (*s).clone()))
                .collect();
            let (aligned, failed) = rigid_align_group(&admitted_group, &reference.landmarks);
            skipped.extend(failed);
            let realigned = admit(
                reference.landmarks.len(),
                aligned.iter().map(|(id, s)| (id.to_string(), s)),
                &mut skipped,
            )?;
            let alignment = self.align(&realigned)?;
            self.finish(&reference, &realigned, alignment, skipped)?
        } else {
            self.finish(&reference, &admitted, alignment, skipped)?
        };

        Ok(MeanTemplate {
            mesh: output.mean_mesh.clone(),
            landmarks,
            reference_id,
            reference_index: index,
            output,
        })
    }

    /// Correspond originals and their mirrored copies and compare them.
    ///
    /// Samples are matched to `mirrored` by ID; unmatched IDs on either side
    /// are skipped as [`CorrespondError::MissingPair`]. Both groups share one
    /// Procrustes consensus, so the numbers differ from two independent
    /// [`run`](Self::run) calls, one per group.
    pub fn run_symmetry(
        &self,
        reference: &Specimen,
        samples: &SampleGroup<Specimen>,
        mirrored: &SampleGroup<Specimen>,
    ) -> CorrespondResult<SymmetryOutput> {
        let _timer = OperationTimer::with_context(
            "symmetry_run",
            samples.len(),
            reference.mesh.vertex_count(),
        );
        check_reference(reference)?;

        let mut skipped = Vec::new();
        let mut pairs = Vec::with_capacity(samples.len());
        let mut entries = Vec::with_capacity(samples.len() * 2);
        for (id, sample) in samples.iter() {
            match mirrored.get(id) {
                Some(copy) => {
                    pairs.push(id);
                    entries.push((id.to_string(), sample));
                    entries.push((mirror_key(id), copy));
                }
                None => {
                    warn!(sample = id, "No mirrored counterpart, skipping");
                    skipped.push(CorrespondError::missing_pair(id, "mirrored counterpart"));
                }
            }
        }
        for id in mirrored.ids().filter(|id| !samples.contains(id)) {
            warn!(sample = id, "Mirrored copy has no original, skipping");
            skipped.push(CorrespondError::missing_pair(id, "original sample"));
        }

        let admitted = admit(reference.landmarks.len(), entries.into_iter(), &mut skipped)?;
        let alignment = self.align(&admitted)?;
        let strategy = self.build_strategy(reference, &alignment.consensus)?;
        let all = self.correspond_all(strategy.as_ref(), &admitted, &mut skipped)?;

        let mut left = SampleGroup::with_capacity(pairs.len());
        let mut right = SampleGroup::with_capacity(pairs.len());
        for id in pairs {
            // A side that failed earlier is already in `skipped`.
            if let (Some(original), Some(copy)) = (all.get(id), all.get(&mirror_key(id))) {
                left.insert(id, original.clone());
                right.insert(id, copy.clone());
            }
        }

        let statistics = symmetry_statistics(&left, &right)?;
        info!(
            pairs = left.len(),
            skipped = skipped.len(),
            "Symmetry run complete"
        );
        Ok(SymmetryOutput {
            left,
            right,
            statistics,
            alignment,
            skipped,
        })
    }

    fn align(&self, admitted: &[(String, &Specimen)]) -> CorrespondResult<AlignmentResult> {
        let group: SampleGroup<LandmarkSet> = admitted
            .iter()
            .map(|(id, s)| (id.clone(), s.landmarks.clone()))
            .collect();
        procrustes_align(&group, &self.config.procrustes)
    }

    fn finish(
        &self,
        reference: &Specimen,
        admitted: &[(String, &Specimen)],
        alignment: AlignmentResult,
        mut skipped: Vec<CorrespondError>,
    ) -> CorrespondResult<PipelineOutput> {
        let strategy = self.build_strategy(reference, &alignment.consensus)?;
        let correspondences = self.correspond_all(strategy.as_ref(), admitted, &mut skipped)?;

        let mean_mesh = mean_mesh(&correspondences, reference.mesh.connectivity())?;
        let statistics = point_statistics(&correspondences, &reference.mesh)?;
        let subset = self
            .config
            .subset
            .as_ref()
            .map(|params| landmark_subset(&reference.mesh, params))
            .transpose()?;

        info!(
            strategy = strategy.name(),
            corresponded = correspondences.len(),
            skipped = skipped.len(),
            "Correspondence run complete"
        );
        Ok(PipelineOutput {
            correspondences,
            mean_mesh,
            statistics,
            alignment,
            subset,
            skipped,
        })
    }

    fn build_strategy(
        &self,
        reference: &Specimen,
        consensus: &LandmarkSet,
    ) -> CorrespondResult<Box<dyn CorrespondenceStrategy>> {
        match &self.config.strategy {
            Strategy::WarpProject => Ok(Box::new(WarpProject::prepare(reference, consensus)?)),
            Strategy::Deformable(params) => {
                let mut params = params.clone();
                if params.cancel.is_none() {
                    params.cancel = Some(self.cancel.clone());
                }
                Ok(Box::new(DeformableStrategy::prepare(&reference.mesh, params)?))
            }
        }
    }

    /// Correspond every admitted sample in parallel, collected in input order.
    fn correspond_all(
        &self,
        strategy: &dyn CorrespondenceStrategy,
        admitted: &[(String, &Specimen)],
        skipped: &mut Vec<CorrespondError>,
    ) -> CorrespondResult<SampleGroup<Mesh>> {
        let tracker = ProgressTracker::with_token(admitted.len() as u64, self.cancel.clone());
        let callback = self.progress.as_ref();

        let results: Vec<(&str, CorrespondResult<Mesh>)> = admitted
            .par_iter()
            .map(|(id, sample)| {
                if tracker.is_cancelled() {
                    return (id.as_str(), Err(cancelled(tracker.current())));
                }
                let result = strategy.correspond(id, sample);
                tracker.finish_one(callback, id);
                (id.as_str(), result)
            })
            .collect();

        if tracker.is_cancelled() {
            return Err(cancelled(tracker.current()));
        }

        let mut correspondences = SampleGroup::with_capacity(results.len());
        for (id, result) in results {
            match result {
                Ok(mesh) => {
                    correspondences.insert(id, mesh);
                }
                Err(e) if e.is_per_sample() => {
                    warn!(sample = id, error = %e, "Correspondence failed, skipping sample");
                    skipped.push(e.in_sample(id));
                }
                Err(e) => return Err(e),
            }
        }

        if correspondences.is_empty() {
            return Err(CorrespondError::empty_group("every sample failed correspondence"));
        }
        Ok(correspondences)
    }
}

fn mirror_key(id: &str) -> String {
    format!("{}{}", id, MIRROR_SUFFIX)
}

fn cancelled(finished: u64) -> CorrespondError {
    CorrespondError::RegistrationCancelled {
        iterations: finished as usize,
        reason: StopReason::Cancelled,
    }
}

fn check_reference(reference: &Specimen) -> CorrespondResult<()> {
    if reference.mesh.is_empty() {
        return Err(CorrespondError::empty_mesh("reference mesh has no vertices"));
    }
    if reference.landmarks.is_empty() {
        return Err(CorrespondError::empty_group("reference has no landmarks"));
    }
    reference.mesh.validate()
}

/// Keep the entries with `expected` landmarks; record the rest in `skipped`.
fn admit<'a>(
    expected: usize,
    entries: impl Iterator<Item = (String, &'a Specimen)>,
    skipped: &mut Vec<CorrespondError>,
) -> CorrespondResult<Vec<(String, &'a Specimen)>> {
    let mut admitted = Vec::new();
    for (id, specimen) in entries {
        if specimen.landmarks.len() == expected {
            admitted.push((id, specimen));
        } else {
            warn!(
                sample = %id,
                expected = expected,
                found = specimen.landmarks.len(),
                "Landmark count mismatch, skipping sample"
            );
            skipped.push(CorrespondError::landmark_count_mismatch(
                id,
                expected,
                specimen.landmarks.len(),
            ));
        }
    }
    if admitted.is_empty() {
        return Err(CorrespondError::empty_group(format!(
            "no sample has the expected {} landmarks",
            expected
        )));
    }
    Ok(admitted)
}

// =========================================================================
// Group preprocessing
// =========================================================================

/// Rigidly fit a specimen's landmarks onto `base` and move it there.
///
/// Rotation and translation only; size is kept.
pub fn rigid_align_to_base(
    mesh: &Mesh,
    landmarks: &LandmarkSet,
    base: &LandmarkSet,
) -> CorrespondResult<(Mesh, LandmarkSet, RigidTransform)> {
    if landmarks.len() != base.len() {
        return Err(CorrespondError::landmark_count_mismatch(
            "sample",
            base.len(),
            landmarks.len(),
        ));
    }
    let (transform, _) = fit_landmarks(landmarks, base, FitMode::RigidBody)?;
    Ok((
        transform.transform_mesh(mesh),
        transform.transform_landmarks(landmarks),
        transform,
    ))
}

/// [`rigid_align_to_base`] over a group, skipping samples that fail.
pub fn rigid_align_group(
    group: &SampleGroup<Specimen>,
    base: &LandmarkSet,
) -> (SampleGroup<Specimen>, Vec<CorrespondError>) {
    let mut aligned = SampleGroup::with_capacity(group.len());
    let mut failed = Vec::new();
    for (id, specimen) in group.iter() {
        match rigid_align_to_base(&specimen.mesh, &specimen.landmarks, base) {
            Ok((mesh, landmarks, _)) => {
                aligned.insert(id, Specimen::new(mesh, landmarks));
            }
            Err(e) => {
                let e = match e {
                    CorrespondError::LandmarkCountMismatch {
                        expected, found, ..
                    } => CorrespondError::landmark_count_mismatch(id, expected, found),
                    other => other.in_sample(id),
                };
                warn!(sample = id, error = %e, "Rigid alignment failed, skipping sample");
                failed.push(e);
            }
        }
    }
    (aligned, failed)
}

/// Mirror every specimen in a group, skipping samples that fail.
pub fn mirror_group(
    group: &SampleGroup<Specimen>,
    axis: MirrorAxis,
    map: &BilateralMap,
) -> (SampleGroup<Specimen>, Vec<CorrespondError>) {
    let mut mirrored = SampleGroup::with_capacity(group.len());
    let mut failed = Vec::new();
    for (id, specimen) in group.iter() {
        match mirror(&specimen.mesh, &specimen.landmarks, axis, map) {
            Ok(result) => {
                mirrored.insert(id, Specimen::new(result.mesh, result.landmarks));
            }
            Err(e) => {
                warn!(sample = id, error = %e, "Mirroring failed, skipping sample");
                failed.push(e.in_sample(id));
            }
        }
    }
    (mirrored, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::Progress;
    use approx::assert_relative_eq;
    use nalgebra::{Point3, UnitQuaternion, Vector3};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Pyramid over a square; all five vertices are landmarks.
    fn pyramid(offset: Vector3<f64>, height: f64) -> Specimen {
        let positions: Vec<Point3<f64>> = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(2.0, 0.0, 0.0),
            Point3::new(2.0, 2.0, 0.0),
            Point3::new(0.0, 2.0, 0.0),
            Point3::new(1.0, 1.0, height),
        ]
        .into_iter()
        .map(|p| p + offset)
        .collect();
        let faces = vec![
            vec![0, 1, 4],
            vec![1, 2, 4],
            vec![2, 3, 4],
            vec![3, 0, 4],
            vec![0, 3, 2, 1],
        ];
        let landmarks = LandmarkSet::from_points(positions.clone());
        Specimen::new(Mesh::new(positions, faces), landmarks)
    }

    fn group() -> SampleGroup<Specimen> {
        [
            ("a", pyramid(Vector3::new(1.0, 0.0, 0.0), 1.0)),
            ("b", pyramid(Vector3::new(0.0, 3.0, 0.0), 1.2)),
            ("c", pyramid(Vector3::new(-2.0, 0.0, 1.0), 0.9)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_run_produces_reference_topology_for_every_sample() {
        let reference = pyramid(Vector3::zeros(), 1.0);
        let output = CorrespondencePipeline::new(CorrespondenceConfig::default())
            .run(&reference, &group())
            .unwrap();

        assert_eq!(output.correspondences.ids().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        for mesh in output.correspondences.values() {
            assert_eq!(mesh.vertex_count(), 5);
            assert!(mesh.connectivity().shares_storage(reference.mesh.connectivity()));
        }
        assert!(output.mean_mesh.connectivity().shares_storage(reference.mesh.connectivity()));
        assert_eq!(output.statistics.vertex_count(), 5);
        assert_eq!(output.statistics.sample_count(), 3);
        assert!(output.skipped.is_empty());
        assert!(output.subset.is_none());
    }

    #[test]
    fn test_flat_reference_grid() {
        // 12 x 12 quads in the z = 0 plane, split into triangles.
        let n = 12u32;
        let stride = n + 1;
        let positions: Vec<Point3<f64>> = (0..=n)
            .flat_map(|j| (0..=n).map(move |i| Point3::new(i as f64, j as f64, 0.0)))
            .collect();
        let mut faces = Vec::new();
        for j in 0..n {
            for i in 0..n {
                let v0 = j * stride + i;
                faces.push(vec![v0, v0 + 1, v0 + stride + 1]);
                faces.push(vec![v0, v0 + stride + 1, v0 + stride]);
            }
        }
        let landmarks = LandmarkSet::from_points(vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(12.0, 0.0, 0.0),
            Point3::new(12.0, 12.0, 0.0),
            Point3::new(0.0, 12.0, 0.0),
            Point3::new(5.0, 4.0, 0.0),
        ]);
        let reference = Specimen::new(Mesh::new(positions, faces), landmarks);
        let samples: SampleGroup<Specimen> = [("copy", reference.clone())].into_iter().collect();

        let output = CorrespondencePipeline::new(CorrespondenceConfig::default())
            .run(&reference, &samples)
            .unwrap();
        let mesh = output.correspondences.get("copy").unwrap();
        for (got, expected) in mesh.positions.iter().zip(&reference.mesh.positions) {
            assert_relative_eq!(*got, *expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_landmark_mismatch_is_skipped_not_fatal() {
        let reference = pyramid(Vector3::zeros(), 1.0);
        let mut samples = group();
        let short = pyramid(Vector3::zeros(), 1.0);
        samples.insert(
            "short",
            Specimen::new(
                short.mesh,
                LandmarkSet::from_points(short.landmarks.points()[..4].to_vec()),
            ),
        );

        let output = CorrespondencePipeline::new(CorrespondenceConfig::default())
            .run(&reference, &samples)
            .unwrap();
        assert_eq!(output.correspondences.len(), 3);
        assert_eq!(output.skipped.len(), 1);
        assert!(matches!(
            &output.skipped[0],
            CorrespondError::LandmarkCountMismatch { sample_id, .. } if sample_id == "short"
        ));
    }

    #[test]
    fn test_all_samples_mismatched_aborts() {
        let reference = pyramid(Vector3::zeros(), 1.0);
        let samples: SampleGroup<Specimen> = [(
            "x",
            Specimen::new(reference.mesh.clone(), LandmarkSet::default()),
        )]
        .into_iter()
        .collect();
        let err = CorrespondencePipeline::new(CorrespondenceConfig::default())
            .run(&reference, &samples)
            .unwrap_err();
        assert!(matches!(err, CorrespondError::EmptyGroup { .. }));
    }

    #[test]
    fn test_empty_group_aborts() {
        let reference = pyramid(Vector3::zeros(), 1.0);
        let err = CorrespondencePipeline::new(CorrespondenceConfig::default())
            .run(&reference, &SampleGroup::new())
            .unwrap_err();
        assert!(matches!(err, CorrespondError::EmptyGroup { .. }));
    }

    #[test]
    fn test_generate_mean_picks_typical_sample() {
        let samples: SampleGroup<Specimen> = [
            ("tall", pyramid(Vector3::zeros(), 2.0)),
            ("mid", pyramid(Vector3::new(5.0, 0.0, 0.0), 1.5)),
            ("flat", pyramid(Vector3::new(0.0, 5.0, 0.0), 1.0)),
        ]
        .into_iter()
        .collect();

        let config = CorrespondenceConfig::default().with_procrustes(ProcrustesParams::rigid());
        let template = CorrespondencePipeline::new(config)
            .generate_mean(&samples)
            .unwrap();
        assert_eq!(template.reference_id, "mid");
        assert_eq!(template.reference_index, 1);
        assert_eq!(template.mesh.vertex_count(), 5);
        assert_eq!(template.landmarks.len(), 5);
        // Mean apex height of the raw landmarks.
        assert_relative_eq!(template.landmarks.points()[4].z, 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_generate_mean_ignores_size_by_default() {
        let scaled = |f: f64| {
            let base = pyramid(Vector3::zeros(), 1.0);
            Specimen::new(
                base.mesh.map_positions(|p| Point3::from(p.coords * f)),
                base.landmarks.map_points(|p| Point3::from(p.coords * f)),
            )
        };
        let samples: SampleGroup<Specimen> =
            [("s1", scaled(1.0)), ("s2", scaled(2.0)), ("s3", scaled(3.0))]
                .into_iter()
                .collect();

        // Same shape at three sizes: a three-way tie, resolved to the first.
        let template = CorrespondencePipeline::new(CorrespondenceConfig::default())
            .generate_mean(&samples)
            .unwrap();
        assert_eq!(template.reference_id, "s1");
        assert_eq!(template.reference_index, 0);

        let rigid = CorrespondenceConfig::default().with_procrustes(ProcrustesParams::rigid());
        let template = CorrespondencePipeline::new(rigid)
            .generate_mean(&samples)
            .unwrap();
        assert_eq!(template.reference_id, "s2");
    }

    #[test]
    fn test_rigid_prealign_moves_samples_onto_reference() {
        let reference = pyramid(Vector3::zeros(), 1.0);
        let rotation = UnitQuaternion::from_euler_angles(0.0, 0.0, 0.7);
        let turned = Specimen::new(
            reference.mesh.map_positions(|p| rotation * p + Vector3::new(4.0, 1.0, 0.0)),
            reference
                .landmarks
                .map_points(|p| rotation * p + Vector3::new(4.0, 1.0, 0.0)),
        );
        let samples: SampleGroup<Specimen> = [("turned", turned)].into_iter().collect();

        let output = CorrespondencePipeline::new(
            CorrespondenceConfig::default().with_rigid_prealign(true),
        )
        .run(&reference, &samples)
        .unwrap();
        let mesh = output.correspondences.get("turned").unwrap();
        for (got, expected) in mesh.positions.iter().zip(&reference.mesh.positions) {
            assert_relative_eq!(*got, *expected, epsilon = 1e-6);
        }
        assert!(output.statistics.mean.iter().all(|&d| d < 1e-6));
    }

    #[test]
    fn test_rigid_align_group_skips_mismatch() {
        let base = pyramid(Vector3::zeros(), 1.0).landmarks;
        let mut samples = group();
        samples.insert(
            "bad",
            Specimen::new(Mesh::point_cloud(Vec::new()), LandmarkSet::default()),
        );
        let (aligned, failed) = rigid_align_group(&samples, &base);
        assert_eq!(aligned.len(), 3);
        assert!(matches!(
            &failed[0],
            CorrespondError::LandmarkCountMismatch { sample_id, .. } if sample_id == "bad"
        ));
    }

    #[test]
    fn test_subset_reported_when_configured() {
        let reference = pyramid(Vector3::zeros(), 1.0);
        let config = CorrespondenceConfig::default().with_subset(SubsetParams::with_spacing(10.0));
        let output = CorrespondencePipeline::new(config)
            .run(&reference, &group())
            .unwrap();
        assert_eq!(output.subset.map(|s| s.len()), Some(1));
    }

    #[test]
    fn test_progress_callback_can_cancel() {
        let reference = pyramid(Vector3::zeros(), 1.0);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let pipeline = CorrespondencePipeline::new(CorrespondenceConfig::default()).with_progress(
            Box::new(move |_: &Progress| {
                seen.fetch_add(1, Ordering::SeqCst);
                false
            }),
        );
        let err = pipeline.run(&reference, &group()).unwrap_err();
        assert!(matches!(err, CorrespondError::RegistrationCancelled { .. }));
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_pre_cancelled_token_aborts() {
        let reference = pyramid(Vector3::zeros(), 1.0);
        let token = CancelToken::new();
        token.cancel();
        let err = CorrespondencePipeline::new(CorrespondenceConfig::default())
            .with_cancel_token(token)
            .run(&reference, &group())
            .unwrap_err();
        assert!(matches!(err, CorrespondError::RegistrationCancelled { .. }));
    }

    #[test]
    fn test_strategy_cancel_token_aborts_run() {
        let reference = pyramid(Vector3::zeros(), 1.0);
        let token = CancelToken::new();
        token.cancel();
        let strategy = Strategy::Deformable(DeformableParams::default().with_cancel_token(token));
        let config = CorrespondenceConfig::default().with_strategy(strategy);
        let err = CorrespondencePipeline::new(config)
            .run(&reference, &group())
            .unwrap_err();
        assert!(err.is_cancellation(), "unexpected error: {:?}", err);
    }

    #[test]
    fn test_deadline_skips_samples() {
        let reference = pyramid(Vector3::zeros(), 1.0);
        let strategy = Strategy::Deformable(
            DeformableParams::default().with_deadline(std::time::Duration::ZERO),
        );
        let config = CorrespondenceConfig::default().with_strategy(strategy);
        let err = CorrespondencePipeline::new(config)
            .run(&reference, &group())
            .unwrap_err();
        // Every sample ran out of time, none was cancelled.
        assert!(matches!(err, CorrespondError::EmptyGroup { .. }));
    }

    #[test]
    fn test_symmetry_run_of_symmetric_samples_is_near_zero() {
        let reference = pyramid(Vector3::new(-1.0, -1.0, 0.0), 1.0);
        let samples: SampleGroup<Specimen> = [
            ("p", pyramid(Vector3::new(-1.0, -1.0, 0.0), 1.3)),
            ("q", pyramid(Vector3::new(-1.0, -1.0, 0.0), 0.8)),
        ]
        .into_iter()
        .collect();
        // Pyramid centred on the origin is symmetric across x = 0:
        // corners 0<->1 and 2<->3 swap, apex stays.
        let map: BilateralMap = "1,0,3,2,4".parse().unwrap();
        let (mirrored, failed) = mirror_group(&samples, MirrorAxis::X, &map);
        assert!(failed.is_empty());

        let output = CorrespondencePipeline::new(CorrespondenceConfig::default())
            .run_symmetry(&reference, &samples, &mirrored)
            .unwrap();
        assert_eq!(output.left.len(), 2);
        assert_eq!(output.right.len(), 2);
        assert!(output.skipped.is_empty());
        assert!(output.statistics.mean.iter().all(|&d| d < 1e-6));
    }

    #[test]
    fn test_symmetry_run_reports_unmatched() {
        let reference = pyramid(Vector3::zeros(), 1.0);
        let samples = group();
        let mirrored: SampleGroup<Specimen> = [
            ("a", pyramid(Vector3::new(1.0, 0.0, 0.0), 1.0)),
            ("b", pyramid(Vector3::new(0.0, 3.0, 0.0), 1.2)),
            ("z", pyramid(Vector3::zeros(), 1.0)),
        ]
        .into_iter()
        .collect();
        let output = CorrespondencePipeline::new(CorrespondenceConfig::default())
            .run_symmetry(&reference, &samples, &mirrored)
            .unwrap();
        assert_eq!(output.left.ids().collect::<Vec<_>>(), vec!["a", "b"]);
        let missing: Vec<&str> = output
            .skipped
            .iter()
            .filter_map(|e| match e {
                CorrespondError::MissingPair { sample_id, .. } => Some(sample_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(missing, vec!["c", "z"]);
    }

    #[cfg(feature = "pipeline-config")]
    #[test]
    fn test_config_json_roundtrip() {
        let config = CorrespondenceConfig::with_name("json-test")
            .with_strategy(Strategy::Deformable(
                DeformableParams::new().with_max_iterations(40),
            ))
            .with_procrustes(ProcrustesParams::similarity());

        let json = config.to_json().unwrap();
        let parsed = CorrespondenceConfig::from_json(&json).unwrap();
        assert_eq!(parsed.name.as_deref(), Some("json-test"));
        assert!(parsed.procrustes.remove_scale);
        match parsed.strategy {
            Strategy::Deformable(params) => assert_eq!(params.max_iterations, 40),
            other => panic!("Expected deformable strategy, got {:?}", other),
        }
    }

    #[cfg(feature = "pipeline-config")]
    #[test]
    fn test_config_toml_roundtrip() {
        let config = CorrespondenceConfig::with_name("toml-test")
            .with_rigid_prealign(true)
            .with_subset(SubsetParams::with_spacing(2.0));
        let toml_str = config.to_toml().unwrap();
        let parsed = CorrespondenceConfig::from_toml(&toml_str).unwrap();
        assert_eq!(parsed.name, config.name);
        assert!(parsed.rigid_prealign);
        assert_eq!(parsed.subset, Some(SubsetParams::with_spacing(2.0)));
        assert_eq!(parsed.strategy.name(), "warp-project");
    }

    #[cfg(feature = "pipeline-config")]
    #[test]
    fn test_config_from_toml_string() {
        let toml = r#"
            name = "skulls"

            [strategy]
            kind = "deformable"
            max_iterations = 50
            beta = 3.0

            [procrustes]
            remove_scale = true
        "#;
        let config = CorrespondenceConfig::from_toml(toml).unwrap();
        assert_eq!(config.name.as_deref(), Some("skulls"));
        assert!(config.procrustes.remove_scale);
        assert_eq!(config.procrustes.max_iterations, 100);
        match config.strategy {
            Strategy::Deformable(params) => {
                assert_eq!(params.max_iterations, 50);
                assert_relative_eq!(params.beta, 3.0);
                assert_relative_eq!(params.alpha, 2.0);
            }
            other => panic!("Expected deformable strategy, got {:?}", other),
        }
    }
}
