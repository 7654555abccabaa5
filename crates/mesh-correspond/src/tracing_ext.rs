//! Tracing helpers for correspondence operations.
//!
//! The library only emits events; install a subscriber in the application:
//!
//! ```rust,ignore
//! use tracing_subscriber::{fmt, prelude::*, EnvFilter};
//!
//! tracing_subscriber::registry()
//!     .with(fmt::layer())
//!     .with(EnvFilter::from_default_env())
//!     .init();
//! // RUST_LOG=mesh_correspond=debug
//! ```
//!
//! # Log Levels
//!
//! - **WARN**: Skipped samples, non-converged registration
//! - **INFO**: Operation summaries, timing
//! - **DEBUG**: Intermediate state (warps built, iterations used)
//! - **TRACE**: Per-iteration values

use nalgebra::Point3;
use std::time::Instant;
use tracing::span::EnteredSpan;
use tracing::{Span, debug, info};

use crate::types::Mesh;

/// A performance timer that logs duration on drop.
///
/// The timer's span stays entered until it is dropped, so every event the
/// operation emits on this thread nests under it. Drop it on the thread that
/// created it.
///
/// ```rust,ignore
/// fn transfer_all() {
///     let _timer = OperationTimer::new("transfer_all");
///     // ...
/// } // logs elapsed_ms here
/// ```
pub struct OperationTimer {
    name: &'static str,
    start: Instant,
    span: EnteredSpan,
}

impl OperationTimer {
    /// Create a new operation timer.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!("correspond_operation", operation = name).entered();
        debug!(target: "mesh_correspond::timing", operation = name, "Starting operation");
        Self {
            name,
            start: Instant::now(),
            span,
        }
    }

    /// Create a timer tagged with the number of samples and reference vertices.
    pub fn with_context(name: &'static str, samples: usize, vertices: usize) -> Self {
        let span = tracing::info_span!(
            "correspond_operation",
            operation = name,
            samples = samples,
            vertices = vertices
        )
        .entered();
        debug!(
            target: "mesh_correspond::timing",
            operation = name,
            samples = samples,
            vertices = vertices,
            "Starting operation"
        );
        Self {
            name,
            start: Instant::now(),
            span,
        }
    }

    /// Get the elapsed time.
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Get the span for this timer.
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let elapsed_ms = self.elapsed_ms();
        info!(
            target: "mesh_correspond::timing",
            operation = self.name,
            elapsed_ms = format!("{:.2}", elapsed_ms),
            "Operation completed"
        );
    }
}

/// Log mesh dimensions at debug level.
pub fn log_mesh_stats(mesh: &Mesh, context: &str) {
    let (min_bounds, max_bounds) = mesh
        .bounds()
        .unwrap_or((Point3::origin(), Point3::origin()));
    let dims = max_bounds - min_bounds;

    debug!(
        target: "mesh_correspond::mesh_state",
        context = context,
        vertices = mesh.vertex_count(),
        faces = mesh.face_count(),
        dimensions = format!("{:.2} x {:.2} x {:.2}", dims.x, dims.y, dims.z),
        "Mesh state"
    );
}
