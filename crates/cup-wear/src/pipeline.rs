//! Stage-sequential analysis pipeline.
//!
//! The pipeline walks a fixed sequence of stages:
//!
//! ```text
//! Idle -> Separated -> Trimmed -> SphereFit -> EllipsoidFit -> GraphBuilt
//!      -> GeodesicsComputed -> DeviationsAnalyzed -> VolumesComputed
//! ```
//!
//! Each stage reads the outputs of earlier stages, computes a self-contained
//! increment, and only then commits it into the pipeline state. A failing
//! stage leaves the state exactly as it was. Re-running a stage discards the
//! outputs of every later stage, and every commit bumps
//! [`AnalysisPipeline::state_version`].
//!
//! # Example
//!
//! ```
//! use cup_wear::synthetic::hemisphere_cap;
//! use cup_wear::{AnalysisParams, AnalysisPipeline, PipelineStage};
//!
//! let cap = hemisphere_cap(14.0, 0.7, 90.0);
//! let mut pipeline = AnalysisPipeline::new(cap, AnalysisParams::quick())?;
//!
//! // Step by step...
//! pipeline.separate()?;
//! pipeline.trim()?;
//! assert_eq!(pipeline.stage(), PipelineStage::Trimmed);
//!
//! // ...or everything at once.
//! let results = pipeline.run_full_analysis()?;
//! assert!(results.clusters.is_empty());
//! # Ok::<(), cup_wear::WearError>(())
//! ```

use std::fmt;
use std::sync::mpsc::{self, Receiver};
use std::thread::JoinHandle;
use std::time::Instant;

use nalgebra::{Point3, Vector3};
use tracing::{info, warn};

use crate::clustering::{cluster_anomalies, AnomalyCluster, ClusterSet};
use crate::deviation::{DeviationAnalysis, DeviationStats};
use crate::error::{WearError, WearResult};
use crate::fitting::{fit_ellipsoid, fit_sphere_robust, EllipsoidFit, RobustSphereFit, SphereFit};
use crate::geodesic::{Geodesic, GeodesicJob, GeodesicSolver};
use crate::graph::MeshGraph;
use crate::params::AnalysisParams;
use crate::progress::{
    ChannelProgressReporter, NoOpProgressReporter, ProgressEvent, ProgressReporter,
};
use crate::separate::{separate_faces, SurfaceSeparation};
use crate::tracing_ext::{log_mesh_stats, log_stage_committed, OperationTimer};
use crate::trim::trim_rim;
use crate::types::Mesh;
use crate::volume::{compute_volumes, with_cluster_volumes, VolumeReport, WearVector};

/// A pipeline stage, named after the state it leaves the pipeline in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(rename_all = "snake_case"))]
pub enum PipelineStage {
    Idle,
    Separated,
    Trimmed,
    SphereFit,
    EllipsoidFit,
    GraphBuilt,
    GeodesicsComputed,
    DeviationsAnalyzed,
    VolumesComputed,
}

impl PipelineStage {
    /// Every stage in execution order.
    pub const ALL: [PipelineStage; 9] = [
        PipelineStage::Idle,
        PipelineStage::Separated,
        PipelineStage::Trimmed,
        PipelineStage::SphereFit,
        PipelineStage::EllipsoidFit,
        PipelineStage::GraphBuilt,
        PipelineStage::GeodesicsComputed,
        PipelineStage::DeviationsAnalyzed,
        PipelineStage::VolumesComputed,
    ];

    /// Human-readable name of the work that produces this stage.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::Idle => "idle",
            PipelineStage::Separated => "face separation",
            PipelineStage::Trimmed => "rim trimming",
            PipelineStage::SphereFit => "sphere fit",
            PipelineStage::EllipsoidFit => "ellipsoid fit",
            PipelineStage::GraphBuilt => "graph construction",
            PipelineStage::GeodesicsComputed => "geodesic computation",
            PipelineStage::DeviationsAnalyzed => "deviation analysis",
            PipelineStage::VolumesComputed => "volume computation",
        }
    }

    /// The stage whose output this stage consumes.
    pub fn previous(&self) -> Option<PipelineStage> {
        let i = *self as usize;
        i.checked_sub(1).map(|p| Self::ALL[p])
    }

    /// The stage that follows this one.
    pub fn next(&self) -> Option<PipelineStage> {
        Self::ALL.get(*self as usize + 1).copied()
    }

    /// Precondition message for running this stage out of order.
    pub fn requirement(&self) -> &'static str {
        match self {
            PipelineStage::Idle | PipelineStage::Separated => "no prerequisites",
            PipelineStage::Trimmed => "run face separation first",
            PipelineStage::SphereFit => "run rim trimming first",
            PipelineStage::EllipsoidFit => "run sphere fit first",
            PipelineStage::GraphBuilt => "run ellipsoid fit first",
            PipelineStage::GeodesicsComputed => "run graph construction first",
            PipelineStage::DeviationsAnalyzed => "run geodesic computation first",
            PipelineStage::VolumesComputed => "run deviation analysis first",
        }
    }

    /// Check if this is the terminal stage.
    pub fn is_complete(&self) -> bool {
        *self == PipelineStage::VolumesComputed
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Aggregate output of a complete analysis.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct AnalysisResults {
    /// Robust reference sphere.
    pub sphere: SphereFit,
    pub ellipsoid: EllipsoidFit,
    /// Cup axis, from rim to pole.
    pub axis: Vector3<f64>,
    /// Meridians in bearing order.
    pub geodesics: Vec<Geodesic>,
    pub deviation_stats: DeviationStats,
    /// Distinct bump anomaly points.
    pub bump_points: usize,
    /// Distinct dip anomaly points.
    pub dip_points: usize,
    /// Clusters with their volumes filled in.
    pub clusters: ClusterSet,
    pub volumes: VolumeReport,
    /// Pole to deepest wear, if any dip cluster exists.
    pub wear_vector: Option<WearVector>,
    /// Sum of committed stage durations (ms).
    pub processing_time_ms: f64,
    /// Working mesh size.
    pub vertex_count: usize,
    pub face_count: usize,
    /// Reporting threshold the run used (µm).
    pub threshold_microns: f64,
}

impl AnalysisResults {
    /// Total number of anomaly points.
    pub fn anomaly_count(&self) -> usize {
        self.bump_points + self.dip_points
    }

    /// The deepest dip cluster.
    pub fn primary_wear_zone(&self) -> Option<&AnomalyCluster> {
        self.clusters.primary_wear_zone()
    }

    /// Bump plus dip mass (mg).
    pub fn total_mass_mg(&self) -> f64 {
        self.volumes.total_mass_mg()
    }

    /// Bump plus dip volume (mm³).
    pub fn total_volume(&self) -> f64 {
        self.volumes.total_volume()
    }
}

impl fmt::Display for AnalysisResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Wear Analysis Report:")?;
        writeln!(
            f,
            "  Working mesh: {} vertices, {} faces",
            self.vertex_count, self.face_count
        )?;
        let c = &self.sphere.center;
        writeln!(
            f,
            "  Sphere: center [{:.4}, {:.4}, {:.4}], radius {:.4} mm, RMS {:.2} µm",
            c.x,
            c.y,
            c.z,
            self.sphere.radius,
            self.sphere.rms_error * 1000.0
        )?;
        let a = &self.ellipsoid.semi_axes;
        writeln!(
            f,
            "  Ellipsoid: semi-axes {:.4} / {:.4} / {:.4} mm, sphericity {:.2}% ({})",
            a.x, a.y, a.z, self.ellipsoid.sphericity, self.ellipsoid.shape
        )?;

        let s = &self.deviation_stats;
        writeln!(
            f,
            "  Deviation: mean {:.2} µm, std {:.2} µm, range [{:.2}, {:.2}] µm",
            s.mean, s.std_dev, s.max_dip, s.max_bump
        )?;
        writeln!(
            f,
            "  Within ±{} µm: {:.1}%",
            self.threshold_microns, s.within_tolerance_percent
        )?;
        writeln!(
            f,
            "  Anomalies: {} points ({} bump, {} dip) in {} meridians",
            self.anomaly_count(),
            self.bump_points,
            self.dip_points,
            self.geodesics.len()
        )?;
        writeln!(
            f,
            "  Clusters: {} bump, {} dip",
            self.clusters.bumps.len(),
            self.clusters.dips.len()
        )?;
        writeln!(
            f,
            "  Volume: bump {:.5} mm³, dip {:.5} mm³",
            self.volumes.bump_volume, self.volumes.dip_volume
        )?;
        writeln!(
            f,
            "  Mass: {:.4} mg at {} g/cm³",
            self.total_mass_mg(),
            self.volumes.density_g_cm3
        )?;

        match &self.wear_vector {
            Some(w) => writeln!(
                f,
                "  Wear vector: {:.1}° from axis, {:.3} mm from pole, depth {:.2} µm",
                w.angle_deg, w.distance, w.max_depth_um
            )?,
            None => writeln!(f, "  Wear vector: none (no dip clusters)")?,
        }

        write!(f, "  Processing time: {:.0} ms", self.processing_time_ms)
    }
}

/// Meridians plus the pole they start from.
#[derive(Debug, Clone)]
struct MeridianSet {
    pole: usize,
    pole_position: Point3<f64>,
    geodesics: Vec<Geodesic>,
}

/// What a stage produced, before it is committed.
enum StageOutput {
    Separated(SurfaceSeparation),
    Trimmed(Mesh),
    SphereFit(RobustSphereFit),
    EllipsoidFit(EllipsoidFit),
    GraphBuilt(MeshGraph),
    GeodesicsComputed(MeridianSet),
    DeviationsAnalyzed(DeviationAnalysis, ClusterSet),
    VolumesComputed(Box<AnalysisResults>),
}

impl StageOutput {
    fn stage(&self) -> PipelineStage {
        match self {
            StageOutput::Separated(_) => PipelineStage::Separated,
            StageOutput::Trimmed(_) => PipelineStage::Trimmed,
            StageOutput::SphereFit(_) => PipelineStage::SphereFit,
            StageOutput::EllipsoidFit(_) => PipelineStage::EllipsoidFit,
            StageOutput::GraphBuilt(_) => PipelineStage::GraphBuilt,
            StageOutput::GeodesicsComputed(_) => PipelineStage::GeodesicsComputed,
            StageOutput::DeviationsAnalyzed(..) => PipelineStage::DeviationsAnalyzed,
            StageOutput::VolumesComputed(_) => PipelineStage::VolumesComputed,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PipelineState {
    separation: Option<SurfaceSeparation>,
    working_mesh: Option<Mesh>,
    sphere: Option<RobustSphereFit>,
    ellipsoid: Option<EllipsoidFit>,
    graph: Option<MeshGraph>,
    meridians: Option<MeridianSet>,
    deviations: Option<DeviationAnalysis>,
    clusters: Option<ClusterSet>,
    results: Option<AnalysisResults>,
    timings_ms: Vec<(PipelineStage, f64)>,
}

impl PipelineState {
    /// Drop the outputs of `stage` and every later stage.
    fn discard_from(&mut self, stage: PipelineStage) {
        use PipelineStage::*;
        if stage <= Separated {
            self.separation = None;
        }
        if stage <= Trimmed {
            self.working_mesh = None;
        }
        if stage <= SphereFit {
            self.sphere = None;
        }
        if stage <= EllipsoidFit {
            self.ellipsoid = None;
        }
        if stage <= GraphBuilt {
            self.graph = None;
        }
        if stage <= GeodesicsComputed {
            self.meridians = None;
        }
        if stage <= DeviationsAnalyzed {
            self.deviations = None;
            self.clusters = None;
        }
        self.results = None;
        self.timings_ms.retain(|(s, _)| *s < stage);
    }

    fn total_ms(&self) -> f64 {
        self.timings_ms.iter().map(|(_, ms)| ms).sum()
    }
}

/// Wear analysis of one mesh.
///
/// The pipeline owns its input and every intermediate output. Each
/// instance is independent, so separate meshes can be analyzed on separate
/// threads; a single instance runs one stage at a time.
#[derive(Debug, Clone)]
pub struct AnalysisPipeline {
    input: Mesh,
    params: AnalysisParams,
    stage: PipelineStage,
    version: u64,
    state: PipelineState,
}

impl AnalysisPipeline {
    /// Create a pipeline for `mesh`.
    ///
    /// Parameters are clamped into their documented ranges.
    ///
    /// # Errors
    ///
    /// Returns [`WearError::InvalidMesh`] or [`WearError::InvalidVertexIndex`]
    /// if the mesh is empty, has out-of-range indices or non-finite
    /// coordinates.
    pub fn new(mesh: Mesh, params: AnalysisParams) -> WearResult<Self> {
        mesh.validate()?;
        log_mesh_stats(&mesh, "input");
        Ok(Self {
            input: mesh,
            params: params.validated(),
            stage: PipelineStage::Idle,
            version: 0,
            state: PipelineState::default(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The mesh the pipeline was created with.
    pub fn input(&self) -> &Mesh {
        &self.input
    }

    /// Parameters in effect.
    pub fn params(&self) -> &AnalysisParams {
        &self.params
    }

    /// The last committed stage.
    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Number of commits so far; changes whenever any output changes.
    pub fn state_version(&self) -> u64 {
        self.version
    }

    /// Inner/outer face split and cup axis.
    pub fn separation(&self) -> Option<&SurfaceSeparation> {
        self.state.separation.as_ref()
    }

    /// Cup axis from the separation stage.
    pub fn axis(&self) -> Option<Vector3<f64>> {
        self.state.separation.as_ref().map(|s| s.axis)
    }

    /// The trimmed inner surface every later stage works on.
    pub fn working_mesh(&self) -> Option<&Mesh> {
        self.state.working_mesh.as_ref()
    }

    /// Reference sphere from the robust fit.
    pub fn sphere_fit(&self) -> Option<&SphereFit> {
        self.state.sphere.as_ref().map(|r| &r.fit)
    }

    /// Robust fit including IRLS weights.
    pub fn robust_sphere_fit(&self) -> Option<&RobustSphereFit> {
        self.state.sphere.as_ref()
    }

    /// General quadric fit used for the sphericity check.
    pub fn ellipsoid_fit(&self) -> Option<&EllipsoidFit> {
        self.state.ellipsoid.as_ref()
    }

    /// Adjacency graph of the working mesh.
    pub fn graph(&self) -> Option<&MeshGraph> {
        self.state.graph.as_ref()
    }

    /// Meridians in bearing order.
    pub fn geodesics(&self) -> Option<&[Geodesic]> {
        self.state.meridians.as_ref().map(|m| m.geodesics.as_slice())
    }

    /// Working-mesh index of the pole vertex.
    pub fn pole(&self) -> Option<usize> {
        self.state.meridians.as_ref().map(|m| m.pole)
    }

    /// Deviation map, statistics and anomaly points.
    pub fn deviation_analysis(&self) -> Option<&DeviationAnalysis> {
        self.state.deviations.as_ref()
    }

    /// Per-vertex deviation of the working mesh (µm), for heat-map colouring.
    pub fn deviation_map(&self) -> Option<&[f64]> {
        self.state.deviations.as_ref().map(|d| d.deviations.as_slice())
    }

    /// Clusters; volumes are filled in once volume computation has run.
    pub fn clusters(&self) -> Option<&ClusterSet> {
        match &self.state.results {
            Some(results) => Some(&results.clusters),
            None => self.state.clusters.as_ref(),
        }
    }

    /// Published results; `None` until volume computation has run.
    pub fn results(&self) -> Option<&AnalysisResults> {
        self.state.results.as_ref()
    }

    /// Consume the pipeline, keeping only the final results.
    pub fn into_results(self) -> Option<AnalysisResults> {
        self.state.results
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run every stage from face separation onward.
    pub fn run_full_analysis(&mut self) -> WearResult<&AnalysisResults> {
        self.run_full_analysis_with_progress(&NoOpProgressReporter)
    }

    /// Run every stage from face separation onward, reporting progress.
    ///
    /// On failure, the stages before the failing one stay committed.
    pub fn run_full_analysis_with_progress(
        &mut self,
        reporter: &dyn ProgressReporter,
    ) -> WearResult<&AnalysisResults> {
        let _timer = OperationTimer::with_mesh("full_analysis", &self.input);
        for stage in &PipelineStage::ALL[1..] {
            self.run_stage(*stage, reporter)?;
        }
        self.state
            .results
            .as_ref()
            .ok_or_else(|| WearError::precondition(PipelineStage::VolumesComputed, "run deviation analysis first"))
    }

    /// Run the stage after the current one.
    ///
    /// Returns the stage that ran, or `None` if the pipeline is complete.
    pub fn step(&mut self, reporter: &dyn ProgressReporter) -> WearResult<Option<PipelineStage>> {
        match self.stage.next() {
            Some(stage) => {
                self.run_stage(stage, reporter)?;
                Ok(Some(stage))
            }
            None => Ok(None),
        }
    }

    /// Run one stage.
    ///
    /// Running [`PipelineStage::Idle`] resets the pipeline.
    ///
    /// # Errors
    ///
    /// [`WearError::PreconditionViolation`] if the previous stage's output is
    /// missing; any other error is wrapped in [`WearError::Stage`]. The
    /// pipeline state is unchanged on error.
    pub fn run_stage(&mut self, stage: PipelineStage, reporter: &dyn ProgressReporter) -> WearResult<()> {
        if stage == PipelineStage::Idle {
            self.reset();
            return Ok(());
        }

        reporter.report(&ProgressEvent::within(stage, 0.0, format!("{}...", stage)));
        let timer = OperationTimer::new(stage.name());

        let output = match stage {
            PipelineStage::Idle => return Ok(()),
            PipelineStage::Separated => self.compute_separation(),
            PipelineStage::Trimmed => self.compute_trim(),
            PipelineStage::SphereFit => self.compute_sphere_fit(),
            PipelineStage::EllipsoidFit => self.compute_ellipsoid_fit(),
            PipelineStage::GraphBuilt => self.compute_graph(),
            PipelineStage::GeodesicsComputed => self.compute_meridians(reporter),
            PipelineStage::DeviationsAnalyzed => self.compute_deviations(),
            PipelineStage::VolumesComputed => self.compute_volume_results(),
        }
        .map_err(|e| e.in_stage(stage))?;

        self.commit(output, timer.elapsed_ms());
        reporter.report(&ProgressEvent::within(stage, 1.0, format!("{} complete", stage)));
        Ok(())
    }

    /// Discard every output and return to [`PipelineStage::Idle`].
    pub fn reset(&mut self) {
        self.state = PipelineState::default();
        self.stage = PipelineStage::Idle;
        self.version += 1;
        log_stage_committed(self.stage, self.version);
    }

    pub fn separate(&mut self) -> WearResult<()> {
        self.run_stage(PipelineStage::Separated, &NoOpProgressReporter)
    }

    pub fn trim(&mut self) -> WearResult<()> {
        self.run_stage(PipelineStage::Trimmed, &NoOpProgressReporter)
    }

    pub fn fit_sphere(&mut self) -> WearResult<()> {
        self.run_stage(PipelineStage::SphereFit, &NoOpProgressReporter)
    }

    pub fn fit_ellipsoid(&mut self) -> WearResult<()> {
        self.run_stage(PipelineStage::EllipsoidFit, &NoOpProgressReporter)
    }

    pub fn build_graph(&mut self) -> WearResult<()> {
        self.run_stage(PipelineStage::GraphBuilt, &NoOpProgressReporter)
    }

    /// Extract meridians on the calling thread.
    pub fn compute_geodesics(&mut self, reporter: &dyn ProgressReporter) -> WearResult<()> {
        self.run_stage(PipelineStage::GeodesicsComputed, reporter)
    }

    /// Analyze deviations and cluster the anomalies.
    pub fn analyze_deviations(&mut self) -> WearResult<()> {
        self.run_stage(PipelineStage::DeviationsAnalyzed, &NoOpProgressReporter)
    }

    /// Integrate wear volumes and publish [`AnalysisResults`].
    pub fn compute_volumes(&mut self) -> WearResult<()> {
        self.run_stage(PipelineStage::VolumesComputed, &NoOpProgressReporter)
    }

    /// A meridian solver for the current state.
    ///
    /// # Errors
    ///
    /// [`WearError::PreconditionViolation`] unless the graph has been built.
    pub fn geodesic_solver(&self) -> WearResult<GeodesicSolver> {
        let stage = PipelineStage::GeodesicsComputed;
        let graph = self.require(stage, self.state.graph.as_ref())?;
        let mesh = self.require(stage, self.state.working_mesh.as_ref())?;
        let sphere = self.require(stage, self.state.sphere.as_ref())?;
        let axis = self.require(stage, self.state.separation.as_ref())?.axis;

        GeodesicSolver::new(
            mesh,
            graph,
            &sphere.fit,
            &axis,
            self.params.geodesic_count,
            self.params.max_points_per_meridian,
        )
        .map_err(|e| e.in_stage(stage))
    }

    /// Start meridian extraction on a worker thread.
    ///
    /// The pipeline is not borrowed while the job runs. Hand the job back to
    /// [`finish_geodesics`](Self::finish_geodesics) to commit its output.
    pub fn spawn_geodesics(&self) -> WearResult<PendingGeodesics> {
        let solver = self.geodesic_solver()?;
        let pole = solver.pole();
        let pole_position = solver.pole_position();
        Ok(PendingGeodesics {
            job: GeodesicJob::spawn(solver),
            version: self.version,
            pole,
            pole_position,
            started: Instant::now(),
        })
    }

    /// Commit the output of a background meridian job.
    ///
    /// # Errors
    ///
    /// [`WearError::PreconditionViolation`] if the pipeline state changed
    /// after the job was spawned, or the worker's error.
    pub fn finish_geodesics(&mut self, pending: PendingGeodesics) -> WearResult<()> {
        let stage = PipelineStage::GeodesicsComputed;
        if pending.version != self.version {
            return Err(WearError::precondition(
                stage,
                "pipeline state changed while geodesics were computing",
            ));
        }
        let started = pending.started;
        let geodesics = pending.job.join().map_err(|e| e.in_stage(stage))?;
        let set = MeridianSet {
            pole: pending.pole,
            pole_position: pending.pole_position,
            geodesics,
        };
        self.commit(
            StageOutput::GeodesicsComputed(set),
            started.elapsed().as_secs_f64() * 1000.0,
        );
        Ok(())
    }

    // =========================================================================
    // Stage computations (read-only)
    // =========================================================================

    fn require<'a, T>(&self, stage: PipelineStage, value: Option<&'a T>) -> WearResult<&'a T> {
        value.ok_or_else(|| WearError::precondition(stage, stage.requirement()))
    }

    fn compute_separation(&self) -> WearResult<StageOutput> {
        let separation = separate_faces(&self.input);
        if separation.is_inner_empty() {
            return Err(WearError::invalid_mesh(
                "no concave inner surface found; is this a closed convex mesh?",
            ));
        }
        if separation.swapped {
            warn!(
                target: "cup_wear::pipeline",
                "Inner and outer labels were swapped by the radius check"
            );
        }
        log_mesh_stats(&separation.inner, "inner surface");
        Ok(StageOutput::Separated(separation))
    }

    fn compute_trim(&self) -> WearResult<StageOutput> {
        let separation = self.require(PipelineStage::Trimmed, self.state.separation.as_ref())?;
        let trimmed = trim_rim(&separation.inner, &separation.axis, self.params.rim_trim_percent);
        if trimmed.faces.is_empty() {
            return Err(WearError::invalid_mesh("rim trimming removed every face"));
        }
        log_mesh_stats(&trimmed, "working mesh");
        Ok(StageOutput::Trimmed(trimmed))
    }

    fn compute_sphere_fit(&self) -> WearResult<StageOutput> {
        let mesh = self.require(PipelineStage::SphereFit, self.state.working_mesh.as_ref())?;
        let robust = fit_sphere_robust(&mesh.positions, self.params.robust_iterations)?;
        Ok(StageOutput::SphereFit(robust))
    }

    fn compute_ellipsoid_fit(&self) -> WearResult<StageOutput> {
        let stage = PipelineStage::EllipsoidFit;
        self.require(stage, self.state.sphere.as_ref())?;
        let mesh = self.require(stage, self.state.working_mesh.as_ref())?;
        Ok(StageOutput::EllipsoidFit(fit_ellipsoid(&mesh.positions)?))
    }

    fn compute_graph(&self) -> WearResult<StageOutput> {
        let stage = PipelineStage::GraphBuilt;
        self.require(stage, self.state.ellipsoid.as_ref())?;
        let mesh = self.require(stage, self.state.working_mesh.as_ref())?;
        Ok(StageOutput::GraphBuilt(MeshGraph::build(mesh)?))
    }

    fn compute_meridians(&self, reporter: &dyn ProgressReporter) -> WearResult<StageOutput> {
        let solver = self.geodesic_solver()?;
        let geodesics = solver.compute_all(reporter);
        Ok(StageOutput::GeodesicsComputed(MeridianSet {
            pole: solver.pole(),
            pole_position: solver.pole_position(),
            geodesics,
        }))
    }

    fn compute_deviations(&self) -> WearResult<StageOutput> {
        let stage = PipelineStage::DeviationsAnalyzed;
        let meridians = self.require(stage, self.state.meridians.as_ref())?;
        let mesh = self.require(stage, self.state.working_mesh.as_ref())?;
        let sphere = self.require(stage, self.state.sphere.as_ref())?;

        let analysis = DeviationAnalysis::compute(
            mesh,
            &sphere.fit,
            &meridians.geodesics,
            self.params.threshold_microns,
        );
        let clusters = cluster_anomalies(
            &analysis.anomalies,
            self.params.dbscan_eps_mm,
            self.params.dbscan_min_points,
        );

        info!(
            target: "cup_wear::pipeline",
            mean_um = format!("{:.3}", analysis.stats.mean),
            std_um = format!("{:.3}", analysis.stats.std_dev),
            anomalies = analysis.anomalies.len(),
            bump_clusters = clusters.bumps.len(),
            dip_clusters = clusters.dips.len(),
            "Analyzed deviations"
        );
        Ok(StageOutput::DeviationsAnalyzed(analysis, clusters))
    }

    fn compute_volume_results(&self) -> WearResult<StageOutput> {
        let stage = PipelineStage::VolumesComputed;
        let analysis = self.require(stage, self.state.deviations.as_ref())?;
        let clusters = self.require(stage, self.state.clusters.as_ref())?;
        let mesh = self.require(stage, self.state.working_mesh.as_ref())?;
        let sphere = self.require(stage, self.state.sphere.as_ref())?;
        let ellipsoid = self.require(stage, self.state.ellipsoid.as_ref())?;
        let meridians = self.require(stage, self.state.meridians.as_ref())?;
        let axis = self.require(stage, self.state.separation.as_ref())?.axis;

        let volumes = compute_volumes(
            mesh,
            &sphere.fit,
            &analysis.deviations,
            clusters,
            self.params.threshold_microns,
            self.params.density_g_cm3,
        );
        let clusters = with_cluster_volumes(clusters, &volumes);
        let wear_vector = clusters
            .primary_wear_zone()
            .map(|zone| WearVector::new(meridians.pole_position, zone, &axis));

        Ok(StageOutput::VolumesComputed(Box::new(AnalysisResults {
            sphere: sphere.fit.clone(),
            ellipsoid: ellipsoid.clone(),
            axis,
            geodesics: meridians.geodesics.clone(),
            deviation_stats: analysis.stats,
            bump_points: analysis.bump_count(),
            dip_points: analysis.dip_count(),
            clusters,
            volumes,
            wear_vector,
            processing_time_ms: 0.0,
            vertex_count: mesh.vertex_count(),
            face_count: mesh.face_count(),
            threshold_microns: self.params.threshold_microns,
        })))
    }

    // =========================================================================
    // Commit
    // =========================================================================

    fn commit(&mut self, output: StageOutput, elapsed_ms: f64) {
        let stage = output.stage();
        self.state.discard_from(stage);
        self.state.timings_ms.push((stage, elapsed_ms));

        match output {
            StageOutput::Separated(s) => self.state.separation = Some(s),
            StageOutput::Trimmed(m) => self.state.working_mesh = Some(m),
            StageOutput::SphereFit(s) => self.state.sphere = Some(s),
            StageOutput::EllipsoidFit(e) => self.state.ellipsoid = Some(e),
            StageOutput::GraphBuilt(g) => self.state.graph = Some(g),
            StageOutput::GeodesicsComputed(m) => self.state.meridians = Some(m),
            StageOutput::DeviationsAnalyzed(d, c) => {
                self.state.deviations = Some(d);
                self.state.clusters = Some(c);
            }
            StageOutput::VolumesComputed(mut results) => {
                results.processing_time_ms = self.state.total_ms();
                self.state.results = Some(*results);
            }
        }

        self.stage = stage;
        self.version += 1;
        log_stage_committed(stage, self.version);
    }
}

/// Meridian extraction spawned from a pipeline, waiting to be committed.
#[derive(Debug)]
pub struct PendingGeodesics {
    job: GeodesicJob,
    version: u64,
    pole: usize,
    pole_position: Point3<f64>,
    started: Instant,
}

impl PendingGeodesics {
    /// Blocking iterator over per-meridian progress.
    pub fn progress(&self) -> mpsc::Iter<'_, ProgressEvent> {
        self.job.progress()
    }

    /// Check if the worker has finished.
    pub fn is_finished(&self) -> bool {
        self.job.is_finished()
    }

    /// State version of the pipeline the job was spawned from.
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// A full analysis running on a worker thread.
///
/// ```no_run
/// use cup_wear::synthetic::hemisphere_cap;
/// use cup_wear::{AnalysisJob, AnalysisParams};
///
/// let job = AnalysisJob::spawn(hemisphere_cap(14.0, 0.25, 90.0), AnalysisParams::default());
/// for event in job.progress() {
///     println!("{:>3}% {}", event.percent(), event.message);
/// }
/// let pipeline = job.join()?;
/// if let Some(results) = pipeline.results() {
///     println!("{}", results);
/// }
/// # Ok::<(), cup_wear::WearError>(())
/// ```
#[derive(Debug)]
pub struct AnalysisJob {
    handle: JoinHandle<WearResult<AnalysisPipeline>>,
    events: Receiver<ProgressEvent>,
}

impl AnalysisJob {
    /// Start analyzing `mesh` in the background.
    pub fn spawn(mesh: Mesh, params: AnalysisParams) -> Self {
        let (sender, events) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            let reporter = ChannelProgressReporter::new(sender);
            let mut pipeline = AnalysisPipeline::new(mesh, params)?;
            pipeline.run_full_analysis_with_progress(&reporter)?;
            Ok(pipeline)
        });
        Self { handle, events }
    }

    /// Blocking iterator over progress events; ends when the worker finishes.
    pub fn progress(&self) -> mpsc::Iter<'_, ProgressEvent> {
        self.events.iter()
    }

    /// Check if the worker has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the completed pipeline.
    ///
    /// # Errors
    ///
    /// The first fatal stage error, or [`WearError::InvalidMesh`] if the
    /// worker panicked.
    pub fn join(self) -> WearResult<AnalysisPipeline> {
        self.handle
            .join()
            .map_err(|_| WearError::invalid_mesh("analysis worker panicked"))?
    }
}

/// Run a complete analysis and return its results.
pub fn analyze(mesh: Mesh, params: AnalysisParams) -> WearResult<AnalysisResults> {
    let mut pipeline = AnalysisPipeline::new(mesh, params)?;
    pipeline.run_full_analysis()?;
    pipeline
        .into_results()
        .ok_or_else(|| WearError::precondition(PipelineStage::VolumesComputed, "run deviation analysis first"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::synthetic::{hemisphere_cap, uv_sphere};

    fn small_cap_pipeline() -> AnalysisPipeline {
        let cap = hemisphere_cap(14.0, 0.7, 90.0);
        AnalysisPipeline::new(cap, AnalysisParams::quick()).unwrap()
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(PipelineStage::Idle.previous(), None);
        assert_eq!(PipelineStage::Trimmed.previous(), Some(PipelineStage::Separated));
        assert_eq!(PipelineStage::Separated.next(), Some(PipelineStage::Trimmed));
        assert_eq!(PipelineStage::VolumesComputed.next(), None);
        assert!(PipelineStage::VolumesComputed.is_complete());
        for pair in PipelineStage::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[1].previous(), Some(pair[0]));
        }
    }

    #[test]
    fn test_requirements_name_previous_stage() {
        for stage in &PipelineStage::ALL[2..] {
            let previous = stage.previous().unwrap();
            assert!(
                stage.requirement().contains(previous.name()),
                "{} should mention {}",
                stage.requirement(),
                previous
            );
        }
    }

    #[test]
    fn test_out_of_order_stage_is_rejected() {
        let mut pipeline = small_cap_pipeline();
        let err = pipeline.trim().unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreconditionViolation);
        assert_eq!(err.stage(), Some(PipelineStage::Trimmed));
        assert!(err.to_string().contains("run face separation first"));
        assert_eq!(pipeline.stage(), PipelineStage::Idle);
        assert_eq!(pipeline.state_version(), 0);

        pipeline.separate().unwrap();
        let err = pipeline.build_graph().unwrap_err();
        assert!(err.to_string().contains("run ellipsoid fit first"));
        assert_eq!(pipeline.stage(), PipelineStage::Separated);
    }

    #[test]
    fn test_manual_stepping() {
        let mut pipeline = small_cap_pipeline();
        let mut ran = Vec::new();
        while let Some(stage) = pipeline.step(&NoOpProgressReporter).unwrap() {
            ran.push(stage);
            assert_eq!(pipeline.stage(), stage);
        }
        assert_eq!(ran, PipelineStage::ALL[1..].to_vec());
        assert_eq!(pipeline.state_version(), 8);
        assert!(pipeline.results().is_some());
        assert!(pipeline.deviation_map().is_some());
    }

    #[test]
    fn test_rerun_discards_downstream() {
        let mut pipeline = small_cap_pipeline();
        pipeline.separate().unwrap();
        pipeline.trim().unwrap();
        pipeline.fit_sphere().unwrap();
        assert!(pipeline.sphere_fit().is_some());

        let before = pipeline.state_version();
        pipeline.separate().unwrap();
        assert_eq!(pipeline.stage(), PipelineStage::Separated);
        assert!(pipeline.working_mesh().is_none());
        assert!(pipeline.sphere_fit().is_none());
        assert_eq!(pipeline.state_version(), before + 1);
    }

    #[test]
    fn test_failed_stage_leaves_state_untouched() {
        let sphere = uv_sphere(10.0, 16, 32);
        let mut pipeline = AnalysisPipeline::new(sphere, AnalysisParams::quick()).unwrap();
        let err = pipeline.separate().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMesh);
        assert_eq!(err.stage(), Some(PipelineStage::Separated));
        assert_eq!(pipeline.stage(), PipelineStage::Idle);
        assert_eq!(pipeline.state_version(), 0);
        assert!(pipeline.separation().is_none());
    }

    #[test]
    fn test_empty_mesh_rejected() {
        let err = AnalysisPipeline::new(Mesh::new(), AnalysisParams::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMesh);
    }

    #[test]
    fn test_clean_cap_has_no_wear() {
        let mut pipeline = small_cap_pipeline();
        let results = pipeline.run_full_analysis().unwrap();
        assert!(results.clusters.is_empty());
        assert!(results.wear_vector.is_none());
        assert!(results.primary_wear_zone().is_none());
        assert_eq!(results.anomaly_count(), 0);
        assert_eq!(results.total_volume(), 0.0);
        assert_eq!(results.geodesics.len(), 72);
        assert!((results.sphere.radius - 14.0).abs() < 1e-6);
        assert!(results.axis.z > 0.999);

        let report = results.to_string();
        assert!(report.contains("Wear Analysis Report"));
        assert!(report.contains("Wear vector: none"));
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut pipeline = small_cap_pipeline();
        pipeline.separate().unwrap();
        pipeline.reset();
        assert_eq!(pipeline.stage(), PipelineStage::Idle);
        assert!(pipeline.separation().is_none());
        assert_eq!(pipeline.state_version(), 2);
    }

    #[test]
    fn test_stale_background_geodesics_rejected() {
        let mut pipeline = small_cap_pipeline();
        for _ in 0..5 {
            pipeline.step(&NoOpProgressReporter).unwrap();
        }
        assert_eq!(pipeline.stage(), PipelineStage::GraphBuilt);

        let pending = pipeline.spawn_geodesics().unwrap();
        pipeline.build_graph().unwrap();
        let err = pipeline.finish_geodesics(pending).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreconditionViolation);
        assert_eq!(pipeline.stage(), PipelineStage::GraphBuilt);
    }

    #[test]
    fn test_background_geodesics_commit() {
        let mut pipeline = small_cap_pipeline();
        for _ in 0..5 {
            pipeline.step(&NoOpProgressReporter).unwrap();
        }
        let pending = pipeline.spawn_geodesics().unwrap();
        let events: Vec<ProgressEvent> = pending.progress().collect();
        assert_eq!(events.len(), 72);
        assert!(events.windows(2).all(|w| w[0].fraction <= w[1].fraction));

        pipeline.finish_geodesics(pending).unwrap();
        assert_eq!(pipeline.stage(), PipelineStage::GeodesicsComputed);
        assert_eq!(pipeline.geodesics().map(|g| g.len()), Some(72));
        pipeline.analyze_deviations().unwrap();
        pipeline.compute_volumes().unwrap();
        assert!(pipeline.results().is_some());
    }
}
