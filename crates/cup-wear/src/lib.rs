//! Wear and deviation analysis of scanned hemispherical bearing surfaces.
//!
//! Given a triangle mesh of a scanned cup, this crate measures how far the
//! bearing surface deviates from an ideal sphere, finds and sizes the worn
//! (dip) and raised (bump) regions, and reports the dominant wear direction.
//!
//! # Features
//!
//! - **Separation**: split the scan into concave inner and convex outer surfaces, find the cup axis
//! - **Trimming**: drop a rim band of the inner surface by height along the axis
//! - **Fitting**: algebraic sphere fit with IRLS re-weighting, general ellipsoid fit
//! - **Meridians**: Dijkstra distances from the pole, binned into angular meridians
//! - **Anomalies**: per-vertex deviation, DBSCAN clustering of bumps and dips
//! - **Volume**: prism integration between the surface and the reference sphere, mass, wear vector
//!
//! # Units and Conventions
//!
//! **Coordinates are in millimeters; deviations are in micrometers (µm).**
//!
//! - Volumes are in mm³; with density in g/cm³, mass comes out in mg
//! - The cup axis points from the rim (opening) toward the pole (deepest point)
//! - Positive deviation is outward from the sphere center (bump), negative is inward (dip)
//!
//! # Quick Start
//!
//! ```
//! use cup_wear::synthetic::{apply_radial_defect, hemisphere_cap, RadialDefect};
//! use cup_wear::{analyze, AnalysisParams};
//! use nalgebra::Point3;
//!
//! let mut cup = hemisphere_cap(14.0, 0.5, 90.0);
//! apply_radial_defect(&mut cup, &Point3::origin(), &RadialDefect::dent(30.0, 45.0, 3.0, 8.0));
//!
//! let results = analyze(cup, AnalysisParams::quick())?;
//! println!("{}", results);
//! # Ok::<(), cup_wear::WearError>(())
//! ```
//!
//! # Step-wise Operation
//!
//! [`AnalysisPipeline`] exposes every stage individually for interactive
//! use, and [`AnalysisJob`] runs a whole analysis on a worker thread while
//! streaming [`ProgressEvent`]s.
//!
//! # Feature Flags
//!
//! - `config`: serde support for parameters and results, TOML/JSON helpers on [`AnalysisParams`]

mod error;
mod params;
mod types;

pub mod clustering;
pub mod deviation;
pub mod fitting;
pub mod geodesic;
pub mod graph;
pub mod pipeline;
pub mod progress;
pub mod separate;
pub mod synthetic;
pub mod tracing_ext;
pub mod trim;
pub mod volume;

// Core types
pub use error::{ErrorCode, WearError, WearResult};
pub use params::AnalysisParams;
pub use types::Mesh;

// Pipeline
pub use pipeline::{
    AnalysisJob, AnalysisPipeline, AnalysisResults, PendingGeodesics, PipelineStage, analyze,
};

// Components
pub use clustering::{AnomalyCluster, ClusterSet, cluster_anomalies};
pub use deviation::{AnomalyKind, AnomalyPoint, DeviationAnalysis, DeviationStats};
pub use fitting::{
    EllipsoidFit, RobustSphereFit, ShapeClass, SphereFit, fit_ellipsoid, fit_sphere,
    fit_sphere_robust,
};
pub use geodesic::{Geodesic, GeodesicJob, GeodesicPoint, GeodesicSolver, ShortestPaths, dijkstra};
pub use graph::{MeshGraph, find_boundary_edges, find_boundary_vertices};
pub use separate::{SurfaceSeparation, separate_faces};
pub use trim::trim_rim;
pub use volume::{VolumeReport, WearVector, compute_volumes};

// Progress
pub use progress::{
    CallbackProgressReporter, ChannelProgressReporter, NoOpProgressReporter, ProgressCallback,
    ProgressEvent, ProgressReporter, progress_channel,
};
