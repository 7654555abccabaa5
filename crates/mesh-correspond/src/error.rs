//! Error types for correspondence operations with rich diagnostics.
//!
//! Every error carries:
//! - A machine-readable code in the format `CORR-XXXX`
//! - Context naming the sample, landmark or face involved
//! - A recovery suggestion for the common failure modes
//! - Terminal rendering via miette
//!
//! # Error Codes
//!
//! - `CORR-1xxx`: Input validation (pairing, landmark counts, mesh indices)
//! - `CORR-2xxx`: Numerical/geometric failures (degenerate landmarks, singular systems)
//! - `CORR-3xxx`: Registration (cancellation)
//! - `CORR-4xxx`: Pipeline (empty groups, per-sample failures)
//!
//! # Example
//!
//! ```
//! use mesh_correspond::{CorrespondError, ErrorCode};
//!
//! let err = CorrespondError::landmark_count_mismatch("sample_07", 12, 11);
//! assert_eq!(err.code(), ErrorCode::LandmarkCountMismatch);
//! assert_eq!(err.code().as_str(), "CORR-1002");
//! ```

use miette::Diagnostic;
use thiserror::Error;

use crate::progress::StopReason;

/// Result type alias for correspondence operations.
pub type CorrespondResult<T> = Result<T, CorrespondError>;

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Input validation (1xxx)
    /// CORR-1001: Mesh and landmark samples could not be paired
    MissingPair = 1001,
    /// CORR-1002: Landmark set length differs from the group's
    LandmarkCountMismatch = 1002,
    /// CORR-1003: Mesh has no vertices
    EmptyMesh = 1003,
    /// CORR-1004: Face references a vertex that does not exist
    InvalidFaceIndex = 1004,
    /// CORR-1005: Bilateral index map is not a permutation
    InvalidBilateralMap = 1005,
    /// CORR-1006: Parameter out of range
    InvalidParameter = 1006,
    /// CORR-1007: Mesh vertex count differs from the reference's
    VertexCountMismatch = 1007,

    // Numerical (2xxx)
    /// CORR-2001: Landmarks too few, coincident or collinear
    DegenerateLandmarks = 2001,
    /// CORR-2002: Linear system could not be solved
    SingularSystem = 2002,

    // Registration (3xxx)
    /// CORR-3001: Registration stopped by cancellation or deadline
    RegistrationCancelled = 3001,

    // Pipeline (4xxx)
    /// CORR-4001: Nothing to process
    EmptyGroup = 4001,
    /// CORR-4002: A single sample failed inside a batch
    SampleFailed = 4002,
}

impl ErrorCode {
    /// Returns the error code as a string in the format `CORR-XXXX`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingPair => "CORR-1001",
            ErrorCode::LandmarkCountMismatch => "CORR-1002",
            ErrorCode::EmptyMesh => "CORR-1003",
            ErrorCode::InvalidFaceIndex => "CORR-1004",
            ErrorCode::InvalidBilateralMap => "CORR-1005",
            ErrorCode::InvalidParameter => "CORR-1006",
            ErrorCode::VertexCountMismatch => "CORR-1007",
            ErrorCode::DegenerateLandmarks => "CORR-2001",
            ErrorCode::SingularSystem => "CORR-2002",
            ErrorCode::RegistrationCancelled => "CORR-3001",
            ErrorCode::EmptyGroup => "CORR-4001",
            ErrorCode::SampleFailed => "CORR-4002",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recovery suggestions for correspondence errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySuggestion {
    /// Check the named inputs.
    CheckInputs { checks: Vec<String> },
    /// Adjust parameters for the operation.
    AdjustParameters { parameters: Vec<(String, String)> },
    /// Re-place or add landmarks.
    RevisitLandmarks { description: String },
    /// Drop the offending sample and rerun.
    ExcludeSample { sample_id: String },
    /// No automatic recovery available.
    None,
}

impl std::fmt::Display for RecoverySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoverySuggestion::CheckInputs { checks } => {
                write!(f, "Check the inputs for: {}", checks.join(", "))
            }
            RecoverySuggestion::AdjustParameters { parameters } => {
                let params: Vec<String> = parameters
                    .iter()
                    .map(|(k, v)| format!("{} = {}", k, v))
                    .collect();
                write!(f, "Try adjusting: {}", params.join(", "))
            }
            RecoverySuggestion::RevisitLandmarks { description } => {
                write!(f, "{}", description)
            }
            RecoverySuggestion::ExcludeSample { sample_id } => {
                write!(f, "Exclude sample '{}' and rerun", sample_id)
            }
            RecoverySuggestion::None => write!(f, "No automatic recovery available"),
        }
    }
}

/// Errors that can occur during correspondence operations.
#[derive(Debug, Error, Diagnostic)]
pub enum CorrespondError {
    /// A sample exists on one side of the mesh/landmark pairing only.
    #[error("sample '{sample_id}' has no matching {missing}")]
    #[diagnostic(
        code(correspond::input::missing_pair),
        help("Every mesh needs a landmark set with the same sample ID after suffix stripping.")
    )]
    MissingPair {
        sample_id: String,
        missing: &'static str,
    },

    /// Landmark set length differs from the expected count.
    #[error("sample '{sample_id}' has {found} landmarks, expected {expected}")]
    #[diagnostic(
        code(correspond::input::landmark_count),
        help("All landmark sets in one analysis must list the same landmarks in the same order.")
    )]
    LandmarkCountMismatch {
        sample_id: String,
        expected: usize,
        found: usize,
    },

    /// Mesh has no vertices.
    #[error("mesh is empty: {details}")]
    #[diagnostic(code(correspond::input::empty_mesh))]
    EmptyMesh { details: String },

    /// Face references a vertex outside the position array.
    #[error(
        "invalid face index: face {face_index} references vertex {vertex_index}, but mesh only has {vertex_count} vertices"
    )]
    #[diagnostic(code(correspond::input::face_index))]
    InvalidFaceIndex {
        face_index: usize,
        vertex_index: u32,
        vertex_count: usize,
    },

    /// Bilateral index map is not a permutation of the landmark indices.
    #[error("invalid bilateral index map: {details}")]
    #[diagnostic(
        code(correspond::input::bilateral_map),
        help("The map must list every landmark index exactly once, e.g. \"1,0,2,4,3\".")
    )]
    InvalidBilateralMap { details: String },

    /// Correspondence mesh does not share the reference vertex layout.
    #[error("sample '{sample_id}' has {found} vertices, expected {expected}")]
    #[diagnostic(
        code(correspond::input::vertex_count),
        help("Only meshes produced against the same reference can be aggregated.")
    )]
    VertexCountMismatch {
        sample_id: String,
        expected: usize,
        found: usize,
    },

    /// Parameter out of range.
    #[error("invalid parameter {name}: {details}")]
    #[diagnostic(code(correspond::input::parameter))]
    InvalidParameter { name: &'static str, details: String },

    /// Landmarks cannot support a thin-plate-spline warp.
    #[error("degenerate landmark configuration: {details}")]
    #[diagnostic(
        code(correspond::numeric::degenerate_landmarks),
        help("At least 4 distinct, non-collinear landmarks are required.")
    )]
    DegenerateLandmarkConfiguration { details: String },

    /// Linear system could not be solved.
    #[error("singular system: {details}")]
    #[diagnostic(code(correspond::numeric::singular))]
    SingularSystem { details: String },

    /// Registration stopped before completion.
    #[error("registration cancelled after {iterations} iterations: {reason}")]
    #[diagnostic(
        code(correspond::registration::cancelled),
        help("Raise the deadline or lower max_iterations.")
    )]
    RegistrationCancelled {
        iterations: usize,
        reason: StopReason,
    },

    /// Nothing to process.
    #[error("empty group: {details}")]
    #[diagnostic(code(correspond::pipeline::empty_group))]
    EmptyGroup { details: String },

    /// A sample failed inside a batch run.
    #[error("sample '{sample_id}' failed")]
    #[diagnostic(code(correspond::pipeline::sample_failed))]
    SampleFailed {
        sample_id: String,
        #[source]
        source: Box<CorrespondError>,
    },
}

impl CorrespondError {
    /// Returns the machine-readable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            CorrespondError::MissingPair { .. } => ErrorCode::MissingPair,
            CorrespondError::LandmarkCountMismatch { .. } => ErrorCode::LandmarkCountMismatch,
            CorrespondError::EmptyMesh { .. } => ErrorCode::EmptyMesh,
            CorrespondError::InvalidFaceIndex { .. } => ErrorCode::InvalidFaceIndex,
            CorrespondError::InvalidBilateralMap { .. } => ErrorCode::InvalidBilateralMap,
            CorrespondError::InvalidParameter { .. } => ErrorCode::InvalidParameter,
            CorrespondError::VertexCountMismatch { .. } => ErrorCode::VertexCountMismatch,
            CorrespondError::DegenerateLandmarkConfiguration { .. } => {
                ErrorCode::DegenerateLandmarks
            }
            CorrespondError::SingularSystem { .. } => ErrorCode::SingularSystem,
            CorrespondError::RegistrationCancelled { .. } => ErrorCode::RegistrationCancelled,
            CorrespondError::EmptyGroup { .. } => ErrorCode::EmptyGroup,
            CorrespondError::SampleFailed { .. } => ErrorCode::SampleFailed,
        }
    }

    /// Returns a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self {
            CorrespondError::MissingPair { sample_id, .. } => RecoverySuggestion::ExcludeSample {
                sample_id: sample_id.clone(),
            },
            CorrespondError::LandmarkCountMismatch { sample_id, .. }
            | CorrespondError::VertexCountMismatch { sample_id, .. } => {
                RecoverySuggestion::ExcludeSample {
                    sample_id: sample_id.clone(),
                }
            }
            CorrespondError::EmptyMesh { .. } | CorrespondError::InvalidFaceIndex { .. } => {
                RecoverySuggestion::CheckInputs {
                    checks: vec!["mesh has geometry".into(), "face indices in range".into()],
                }
            }
            CorrespondError::InvalidBilateralMap { .. } => RecoverySuggestion::CheckInputs {
                checks: vec!["bilateral index map covers every landmark once".into()],
            },
            CorrespondError::InvalidParameter { name, .. } => {
                RecoverySuggestion::AdjustParameters {
                    parameters: vec![((*name).into(), "use a positive, finite value".into())],
                }
            }
            CorrespondError::DegenerateLandmarkConfiguration { .. } => {
                RecoverySuggestion::RevisitLandmarks {
                    description: "Place landmarks that span the structure in 3D".into(),
                }
            }
            CorrespondError::SingularSystem { .. } => RecoverySuggestion::RevisitLandmarks {
                description: "Check for duplicated or nearly coincident landmarks".into(),
            },
            CorrespondError::RegistrationCancelled { .. } => {
                RecoverySuggestion::AdjustParameters {
                    parameters: vec![
                        ("deadline".into(), "try a longer duration".into()),
                        ("max_iterations".into(), "try a lower value".into()),
                    ],
                }
            }
            CorrespondError::EmptyGroup { .. } => RecoverySuggestion::CheckInputs {
                checks: vec!["at least one paired sample".into()],
            },
            CorrespondError::SampleFailed { sample_id, .. } => RecoverySuggestion::ExcludeSample {
                sample_id: sample_id.clone(),
            },
        }
    }

    /// Whether a batch run may skip the affected sample and continue.
    pub fn is_per_sample(&self) -> bool {
        matches!(
            self,
            CorrespondError::MissingPair { .. }
                | CorrespondError::LandmarkCountMismatch { .. }
                | CorrespondError::DegenerateLandmarkConfiguration { .. }
                | CorrespondError::SingularSystem { .. }
                | CorrespondError::EmptyMesh { .. }
                | CorrespondError::InvalidFaceIndex { .. }
                | CorrespondError::RegistrationCancelled {
                    reason: StopReason::DeadlineExceeded,
                    ..
                }
                | CorrespondError::SampleFailed { .. }
        )
    }

    /// Whether this error comes from a tripped [`CancelToken`](crate::CancelToken).
    ///
    /// Cancellation ends the whole run, whichever sample observed it first.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            CorrespondError::RegistrationCancelled {
                reason: StopReason::Cancelled,
                ..
            }
        )
    }

    // Constructor helpers for common error patterns

    /// Create a MissingPair error.
    pub fn missing_pair(sample_id: impl Into<String>, missing: &'static str) -> Self {
        CorrespondError::MissingPair {
            sample_id: sample_id.into(),
            missing,
        }
    }

    /// Create a LandmarkCountMismatch error.
    pub fn landmark_count_mismatch(
        sample_id: impl Into<String>,
        expected: usize,
        found: usize,
    ) -> Self {
        CorrespondError::LandmarkCountMismatch {
            sample_id: sample_id.into(),
            expected,
            found,
        }
    }

    /// Create a VertexCountMismatch error.
    pub fn vertex_count_mismatch(
        sample_id: impl Into<String>,
        expected: usize,
        found: usize,
    ) -> Self {
        CorrespondError::VertexCountMismatch {
            sample_id: sample_id.into(),
            expected,
            found,
        }
    }

    /// Create an EmptyMesh error.
    pub fn empty_mesh(details: impl Into<String>) -> Self {
        CorrespondError::EmptyMesh {
            details: details.into(),
        }
    }

    /// Create an InvalidParameter error.
    pub fn invalid_parameter(name: &'static str, details: impl Into<String>) -> Self {
        CorrespondError::InvalidParameter {
            name,
            details: details.into(),
        }
    }

    /// Create a DegenerateLandmarkConfiguration error.
    pub fn degenerate(details: impl Into<String>) -> Self {
        CorrespondError::DegenerateLandmarkConfiguration {
            details: details.into(),
        }
    }

    /// Create an EmptyGroup error.
    pub fn empty_group(details: impl Into<String>) -> Self {
        CorrespondError::EmptyGroup {
            details: details.into(),
        }
    }

    /// Wrap an error with the sample it came from.
    pub fn in_sample(self, sample_id: impl Into<String>) -> Self {
        match self {
            already @ CorrespondError::SampleFailed { .. } => already,
            other => CorrespondError::SampleFailed {
                sample_id: sample_id.into(),
                source: Box::new(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = CorrespondError::landmark_count_mismatch("s1", 10, 9);
        assert_eq!(err.code(), ErrorCode::LandmarkCountMismatch);
        assert_eq!(err.code().as_str(), "CORR-1002");
        assert_eq!(
            CorrespondError::degenerate("collinear").code().as_str(),
            "CORR-2001"
        );
    }

    #[test]
    fn test_error_display() {
        let err = CorrespondError::landmark_count_mismatch("sample_3", 12, 11);
        let display = format!("{}", err);
        assert!(display.contains("sample_3"));
        assert!(display.contains("11 landmarks"));
        assert!(display.contains("expected 12"));
    }

    #[test]
    fn test_recovery_suggestions() {
        let err = CorrespondError::missing_pair("s9", "landmark set");
        match err.recovery_suggestion() {
            RecoverySuggestion::ExcludeSample { sample_id } => assert_eq!(sample_id, "s9"),
            other => panic!("Expected ExcludeSample, got {:?}", other),
        }
    }

    #[test]
    fn test_deadline_skips_but_cancellation_aborts() {
        let deadline = CorrespondError::RegistrationCancelled {
            iterations: 3,
            reason: StopReason::DeadlineExceeded,
        };
        assert!(deadline.is_per_sample());
        assert!(!deadline.is_cancellation());
        assert!(deadline.to_string().contains("deadline exceeded"));

        let cancelled = CorrespondError::RegistrationCancelled {
            iterations: 0,
            reason: StopReason::Cancelled,
        };
        assert!(!cancelled.is_per_sample());
        assert!(cancelled.is_cancellation());
    }

    #[test]
    fn test_in_sample_wraps_once() {
        let err = CorrespondError::degenerate("coincident")
            .in_sample("a")
            .in_sample("b");
        match &err {
            CorrespondError::SampleFailed { sample_id, source } => {
                assert_eq!(sample_id, "a");
                assert_eq!(source.code(), ErrorCode::DegenerateLandmarks);
            }
            other => panic!("Expected SampleFailed, got {:?}", other),
        }
        assert!(err.is_per_sample());
        assert!(!CorrespondError::empty_group("none").is_per_sample());
    }
}
