//! Dense correspondence of samples onto a reference topology.
//!
//! A [`CorrespondenceStrategy`] is prepared once per run against a fixed
//! reference and then maps each sample to a mesh that carries the
//! reference's connectivity and vertex order, with positions lying on the
//! sample's own surface. Strategies hold only immutable state after
//! preparation, so samples can be processed in parallel.
//!
//! Two strategies are provided:
//!
//! - [`WarpProject`]: landmark-driven thin-plate-spline warp into the
//!   consensus frame, projection of the reference vertices onto the warped
//!   sample surface, and the inverse warp back to the sample frame.
//! - [`DeformableStrategy`]: landmark-free coherent point drift of the
//!   reference vertices onto the sample vertices.

use tracing::{debug, warn};

use crate::deformable::{DeformableParams, register_deformable};
use crate::error::{CorrespondError, CorrespondResult};
use crate::locator::SurfaceLocator;
use crate::tps::WarpField;
use crate::tracing_ext::OperationTimer;
use crate::types::{LandmarkSet, Mesh, Specimen};

/// Produces per-sample correspondence against a prepared reference.
pub trait CorrespondenceStrategy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// The reference whose connectivity every output carries.
    fn reference(&self) -> &Mesh;

    /// Map one sample onto the reference topology.
    ///
    /// The returned mesh has the reference's vertex count and connectivity
    /// and is expressed in the sample's native frame.
    fn correspond(&self, sample_id: &str, sample: &Specimen) -> CorrespondResult<Mesh>;
}

/// Warp to the consensus, project, warp back.
#[derive(Debug, Clone)]
pub struct WarpProject {
    reference: Mesh,
    consensus: LandmarkSet,
    /// Reference mesh warped into the consensus frame, computed once.
    warped_reference: Mesh,
}

impl WarpProject {
    /// Warp the reference into the consensus frame.
    ///
    /// # Errors
    ///
    /// - [`CorrespondError::EmptyMesh`] if the reference has no vertices
    /// - [`CorrespondError::LandmarkCountMismatch`] if the reference landmark
    ///   count differs from the consensus
    /// - [`CorrespondError::DegenerateLandmarkConfiguration`] for unusable
    ///   reference landmarks
    pub fn prepare(reference: &Specimen, consensus: &LandmarkSet) -> CorrespondResult<Self> {
        if reference.mesh.is_empty() {
            return Err(CorrespondError::empty_mesh("reference mesh has no vertices"));
        }
        reference.mesh.validate()?;
        if reference.landmarks.len() != consensus.len() {
            return Err(CorrespondError::landmark_count_mismatch(
                "reference",
                consensus.len(),
                reference.landmarks.len(),
            ));
        }
        let to_consensus = WarpField::build(&reference.landmarks, consensus)?;
        let warped_reference = to_consensus.apply_mesh(&reference.mesh);
        debug!(
            vertices = warped_reference.vertex_count(),
            "Warped reference into consensus frame"
        );
        Ok(Self {
            reference: reference.mesh.clone(),
            consensus: consensus.clone(),
            warped_reference,
        })
    }

    /// Consensus shape the warps go through.
    pub fn consensus(&self) -> &LandmarkSet {
        &self.consensus
    }

    /// The reference as warped into the consensus frame.
    pub fn warped_reference(&self) -> &Mesh {
        &self.warped_reference
    }
}

impl CorrespondenceStrategy for WarpProject {
    fn name(&self) -> &'static str {
        "warp-project"
    }

    fn reference(&self) -> &Mesh {
        &self.reference
    }

    fn correspond(&self, sample_id: &str, sample: &Specimen) -> CorrespondResult<Mesh> {
        if sample.landmarks.len() != self.consensus.len() {
            return Err(CorrespondError::landmark_count_mismatch(
                sample_id,
                self.consensus.len(),
                sample.landmarks.len(),
            ));
        }

        let to_consensus = WarpField::build(&sample.landmarks, &self.consensus)?;
        let warped_sample = to_consensus.apply_mesh(&sample.mesh);
        let locator = SurfaceLocator::build(&warped_sample)?;
        let projected = locator.project_points(&self.warped_reference.positions);

        let back = to_consensus.reversed()?;
        let positions = back.apply_points(&projected);
        Ok(self.reference.replaced_positions(positions))
    }
}

/// Coherent point drift of the reference vertices onto each sample.
#[derive(Debug, Clone)]
pub struct DeformableStrategy {
    reference: Mesh,
    params: DeformableParams,
}

impl DeformableStrategy {
    /// Bind a reference mesh and registration parameters.
    pub fn prepare(reference: &Mesh, params: DeformableParams) -> CorrespondResult<Self> {
        if reference.is_empty() {
            return Err(CorrespondError::empty_mesh("reference mesh has no vertices"));
        }
        reference.validate()?;
        params.validate()?;
        Ok(Self {
            reference: reference.clone(),
            params,
        })
    }

    /// Registration parameters.
    pub fn params(&self) -> &DeformableParams {
        &self.params
    }
}

impl CorrespondenceStrategy for DeformableStrategy {
    fn name(&self) -> &'static str {
        "deformable"
    }

    fn reference(&self) -> &Mesh {
        &self.reference
    }

    fn correspond(&self, sample_id: &str, sample: &Specimen) -> CorrespondResult<Mesh> {
        let result = register_deformable(
            &sample.mesh.positions,
            &self.reference.positions,
            &self.params,
        )?;
        if !result.converged {
            warn!(
                sample = sample_id,
                iterations = result.iterations,
                "Using non-converged deformable registration"
            );
        }
        Ok(self.reference.replaced_positions(result.positions))
    }
}

/// Transfer one sample onto the reference topology by warp-and-project.
///
/// Convenience for single pairs; batch runs prepare a [`WarpProject`] once
/// and reuse the warped reference.
pub fn transfer(
    reference_mesh: &Mesh,
    reference_landmarks: &LandmarkSet,
    sample_mesh: &Mesh,
    sample_landmarks: &LandmarkSet,
    consensus: &LandmarkSet,
) -> CorrespondResult<Mesh> {
    let _timer = OperationTimer::new("transfer");
    let reference = Specimen::new(reference_mesh.clone(), reference_landmarks.clone());
    let strategy = WarpProject::prepare(&reference, consensus)?;
    let sample = Specimen::new(sample_mesh.clone(), sample_landmarks.clone());
    strategy.correspond("sample", &sample)
}
