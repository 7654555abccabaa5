//! Dense point correspondence across landmarked surface meshes.
//!
//! Given a collection of similar surfaces (skulls, teeth, leaves...) that
//! differ in vertex count and connectivity but share a small set of
//! hand-placed homologous landmarks, this crate maps every surface onto one
//! reference mesh's topology. Vertex `j` of every result then denotes the
//! same location on every specimen, which makes vertex-wise means and
//! statistics meaningful.
//!
//! # Features
//!
//! - **Procrustes**: generalized superimposition to a consensus shape
//! - **Thin-plate splines**: exact-at-landmarks 3D warps
//! - **Surface projection**: k-d tree accelerated closest-point queries
//! - **Correspondence**: warp, project and warp back, or landmark-free
//!   coherent point drift
//! - **Aggregation**: mean mesh, mean landmarks, per-vertex distance statistics
//! - **Symmetry**: bilateral mirroring with landmark relabelling
//!
//! # Coordinate System
//!
//! Meshes are kept in each sample's native frame. The consensus shape lives
//! in a centered frame; warps carry samples into it and back, so
//! correspondence results come out in the sample's own coordinates and
//! units.
//!
//! # Quick Start
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
//!     Point3::new(1.0, 1.0, 1.0),
//! ]);
//! let target = source.map_points(|p| Point3::new(p.x * 2.0, p.y, p.z + 0.5));
//!
//! let warp = WarpField::build(&source, &target).unwrap();
//! let moved = warp.apply(&Point3::new(1.0, 1.0, 1.0));
//! assert!((moved - Point3::new(2.0, 1.0, 1.5)).norm() < 1e-9);
//! ```
//!
//! ## Batch Runs
//!
//! ```no_run
//! use mesh_correspond::pipeline::{CorrespondenceConfig, CorrespondencePipeline, Strategy};
//! use mesh_correspond::deformable::DeformableParams;
//! use mesh_correspond::{SampleGroup, Specimen};
//!
//! # fn load() -> SampleGroup<Specimen> { unimplemented!() }
//! let samples = load();
//! let config = CorrespondenceConfig::with_name("molars")
//!     .with_strategy(Strategy::Deformable(DeformableParams::default()));
//!
//! let template = CorrespondencePipeline::new(config)
//!     .generate_mean(&samples)
//!     .unwrap();
//! println!("reference: {}", template.reference_id);
//! for (i, (mean, sd)) in template
//!     .output
//!     .statistics
//!     .mean
//!     .iter()
//!     .zip(&template.output.statistics.std_dev)
//!     .enumerate()
//!     .take(5)
//! {
//!     println!("vertex {}: {:.3} ± {:.3}", i, mean, sd);
//! }
//! ```
//!
//! # Logging
//!
//! All operations emit `tracing` events; see [`tracing_ext`] for levels and
//! subscriber setup.

mod error;
mod types;

pub mod aggregate;
pub mod correspondence;
pub mod deformable;
pub mod ingest;
pub mod locator;
pub mod mirror;
pub mod pipeline;
pub mod procrustes;
pub mod progress;
pub mod subset;
pub mod tps;
pub mod tracing_ext;
pub mod transform;

// Re-export core types at crate root
pub use error::{CorrespondError, CorrespondResult, ErrorCode, RecoverySuggestion};
pub use types::{Connectivity, Face, Landmark, LandmarkSet, Mesh, SampleGroup, Specimen};

pub use aggregate::{
    Statistics, mean_landmarks, mean_mesh, point_statistics, symmetry_statistics,
};
pub use correspondence::{CorrespondenceStrategy, DeformableStrategy, WarpProject, transfer};
pub use deformable::{DeformableParams, DeformableResult, register_deformable};
pub use ingest::{landmarks_from_columns, pair_samples, sample_id};
pub use locator::{ClosestPoint, SurfaceLocator};
pub use mirror::{BilateralMap, MirrorAxis, MirrorResult, mirror};
pub use pipeline::{
    CorrespondenceConfig, CorrespondencePipeline, MeanTemplate, PipelineOutput, Strategy,
    SymmetryOutput, mirror_group, rigid_align_group, rigid_align_to_base,
};
pub use procrustes::{AlignmentResult, ProcrustesParams, check_landmark_counts, procrustes_align};
pub use progress::{
    CancelToken, Progress, ProgressCallback, ProgressTracker, StopCondition, StopReason,
};
pub use subset::{SubsetParams, landmark_subset, select_points};
pub use tps::WarpField;
pub use transform::{FitMode, RigidTransform, fit_landmarks, fit_transform};
