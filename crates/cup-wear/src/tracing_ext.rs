//! Tracing extensions for wear analysis.
//!
//! The library only emits events; installing a subscriber is up to the
//! application:
//!
//! ```rust,ignore
//! use tracing_subscriber::{fmt, prelude::*, EnvFilter};
//!
//! tracing_subscriber::registry()
//!     .with(fmt::layer())
//!     .with(EnvFilter::from_default_env())
//!     .init();
//!
//! // RUST_LOG=cup_wear=debug for per-stage detail
//! ```
//!
//! # Targets
//!
//! - `cup_wear::timing`: stage durations (INFO)
//! - `cup_wear::fit`: sphere/ellipsoid fit summaries (INFO), recovered singular solves (WARN)
//! - `cup_wear::pipeline`: stage transitions and mesh sizes (DEBUG/INFO)
//! - `cup_wear::progress`: per-meridian progress (TRACE)

use std::time::Instant;
use tracing::{Span, debug, info};

use crate::pipeline::PipelineStage;
use crate::types::Mesh;

/// A performance timer that logs its duration, inside its span, on drop.
///
/// ```rust,ignore
/// fn expensive_stage() {
///     let _timer = OperationTimer::new("expensive_stage");
///     // ... do work ...
/// } // logs elapsed_ms here
/// ```
pub struct OperationTimer {
    name: &'static str,
    start: Instant,
    span: Span,
}

impl OperationTimer {
    /// Create a new operation timer.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!("wear_operation", operation = name);
        debug!(target: "cup_wear::timing", operation = name, "Starting operation");
        Self {
            name,
            start: Instant::now(),
            span,
        }
    }

    /// Create a timer that also records the size of the mesh being processed.
    pub fn with_mesh(name: &'static str, mesh: &Mesh) -> Self {
        let span = tracing::info_span!(
            "wear_operation",
            operation = name,
            faces = mesh.face_count(),
            vertices = mesh.vertex_count()
        );
        debug!(
            target: "cup_wear::timing",
            operation = name,
            faces = mesh.face_count(),
            vertices = mesh.vertex_count(),
            "Starting operation"
        );
        Self {
            name,
            start: Instant::now(),
            span,
        }
    }

    /// Elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let _entered = self.span.enter();
        info!(
            target: "cup_wear::timing",
            operation = self.name,
            elapsed_ms = format!("{:.2}", self.elapsed_ms()),
            "Operation completed"
        );
    }
}

/// Log mesh statistics at debug level.
pub fn log_mesh_stats(mesh: &Mesh, context: &str) {
    let dims = mesh
        .bounds()
        .map(|(lo, hi)| hi - lo)
        .unwrap_or_else(nalgebra::Vector3::zeros);

    debug!(
        target: "cup_wear::pipeline",
        context = context,
        vertices = mesh.vertex_count(),
        faces = mesh.face_count(),
        dimensions = format!("{:.2} x {:.2} x {:.2}", dims.x, dims.y, dims.z),
        "Mesh state"
    );
}

/// Log a committed stage transition.
pub fn log_stage_committed(stage: PipelineStage, version: u64) {
    info!(
        target: "cup_wear::pipeline",
        stage = %stage,
        version = version,
        "Stage committed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_timer() {
        let timer = OperationTimer::new("test_operation");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 10.0);
    }

    #[test]
    fn test_log_mesh_stats_empty_mesh() {
        let mesh = Mesh::new();
        log_mesh_stats(&mesh, "test");
        let _timer = OperationTimer::with_mesh("empty", &mesh);
        log_stage_committed(PipelineStage::Separated, 1);
    }
}
