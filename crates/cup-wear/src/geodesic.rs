//! Meridian extraction from the pole over the mesh graph.
//!
//! Distances from the pole come from Dijkstra's algorithm on the edge graph,
//! so a "geodesic" here is a graph-shortest-path approximation. Vertices are
//! binned by their bearing around the cup axis; each bin, sorted by distance
//! from the pole, forms one meridian running from the pole to the rim.
//!
//! # Performance
//!
//! Dijkstra is `O((V + E) log V)` and runs once per solver. Each meridian
//! is then a binary search into the bearing-sorted vertex list plus a sort
//! of its band.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::f64::consts::TAU;
use std::sync::mpsc::{self, Receiver};
use std::thread::JoinHandle;

use nalgebra::{Point3, Vector3};
use tracing::{debug, trace};

use crate::error::{WearError, WearResult};
use crate::fitting::SphereFit;
use crate::graph::MeshGraph;
use crate::pipeline::PipelineStage;
use crate::progress::{ChannelProgressReporter, ProgressEvent, ProgressReporter};
use crate::types::Mesh;

/// Predecessor of the source and of unreachable vertices.
pub const NO_PREDECESSOR: u32 = u32::MAX;

/// Deviation above which a meridian point counts toward its anomaly count (µm).
pub const MERIDIAN_SCREENING_UM: f64 = 1.0;

/// Angular band around each meridian, as a multiple of the angular step.
const BAND_WIDTH_STEPS: f64 = 1.5;

/// State for the priority queue in Dijkstra's algorithm.
#[derive(Debug, Clone, Copy)]
struct State {
    vertex: u32,
    distance: f64,
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for State {}

impl PartialOrd for State {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for State {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; ties pop the lower vertex index first.
        other
            .distance
            .total_cmp(&self.distance)
            .then_with(|| other.vertex.cmp(&self.vertex))
    }
}

/// Single-source shortest-path tree.
#[derive(Debug, Clone)]
pub struct ShortestPaths {
    /// Source vertex.
    pub source: usize,
    /// Distance from the source; `f64::INFINITY` if unreachable.
    pub distances: Vec<f64>,
    /// Previous vertex on the shortest path; [`NO_PREDECESSOR`] for the
    /// source and unreachable vertices.
    pub predecessors: Vec<u32>,
}

impl ShortestPaths {
    /// Distance to a vertex (`INFINITY` if unreachable or out of range).
    #[inline]
    pub fn distance(&self, vertex: usize) -> f64 {
        self.distances.get(vertex).copied().unwrap_or(f64::INFINITY)
    }

    /// Check if a vertex is reachable from the source.
    #[inline]
    pub fn is_reachable(&self, vertex: usize) -> bool {
        self.distance(vertex).is_finite()
    }

    /// Number of vertices with a finite distance, the source included.
    pub fn reachable_count(&self) -> usize {
        self.distances.iter().filter(|d| d.is_finite()).count()
    }

    /// Vertices on the shortest path from the source to `target`, inclusive.
    ///
    /// Returns `None` if `target` is unreachable.
    pub fn path_to(&self, target: usize) -> Option<Vec<u32>> {
        if !self.is_reachable(target) {
            return None;
        }
        let mut path = vec![target as u32];
        let mut current = target;
        while current != self.source {
            let prev = self.predecessors[current];
            if prev == NO_PREDECESSOR {
                return None;
            }
            path.push(prev);
            current = prev as usize;
        }
        path.reverse();
        Some(path)
    }
}

/// Dijkstra's algorithm from one source vertex.
///
/// An out-of-range source leaves every vertex unreachable.
pub fn dijkstra(graph: &MeshGraph, source: usize) -> ShortestPaths {
    let n = graph.vertex_count();
    let mut distances = vec![f64::INFINITY; n];
    let mut predecessors = vec![NO_PREDECESSOR; n];

    if source >= n {
        return ShortestPaths {
            source,
            distances,
            predecessors,
        };
    }

    let mut heap = BinaryHeap::with_capacity(n);
    distances[source] = 0.0;
    heap.push(State {
        vertex: source as u32,
        distance: 0.0,
    });

    while let Some(State { vertex, distance }) = heap.pop() {
        let u = vertex as usize;
        if distance > distances[u] {
            continue;
        }

        for (neighbor, weight) in graph.edges(u) {
            let v = neighbor as usize;
            let candidate = distance + weight;
            if candidate < distances[v] {
                distances[v] = candidate;
                predecessors[v] = vertex;
                heap.push(State {
                    vertex: neighbor,
                    distance: candidate,
                });
            }
        }
    }

    ShortestPaths {
        source,
        distances,
        predecessors,
    }
}

/// Vertex farthest along `axis` from `center`, the deepest point of the cup.
///
/// Ties go to the lowest index. Returns `None` for an empty mesh.
pub fn find_pole(mesh: &Mesh, center: &Point3<f64>, axis: &Vector3<f64>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, p) in mesh.positions.iter().enumerate() {
        let h = (p - center).dot(axis);
        match best {
            Some((_, b)) if h <= b => {}
            _ => best = Some((i, h)),
        }
    }
    best.map(|(i, _)| i)
}

/// Orthonormal frame `{u, v, w}` with `w` along the cup axis.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct LocalFrame {
    /// Zero-bearing direction.
    pub u: Vector3<f64>,
    /// 90° bearing direction.
    pub v: Vector3<f64>,
    /// Cup axis.
    pub w: Vector3<f64>,
}

impl LocalFrame {
    /// Build a frame around an axis.
    ///
    /// `u` is `w` crossed with whichever global axis is least parallel to
    /// `w`, and `v = w x u`.
    pub fn from_axis(axis: &Vector3<f64>) -> Self {
        let w = axis.try_normalize(1e-15).unwrap_or_else(Vector3::z);
        let a = w.abs();
        let global = if a.x <= a.y && a.x <= a.z {
            Vector3::x()
        } else if a.y <= a.z {
            Vector3::y()
        } else {
            Vector3::z()
        };
        let u = w.cross(&global).normalize();
        let v = w.cross(&u);
        Self { u, v, w }
    }

    /// Bearing of an offset around `w`, in `[0, 2π)`.
    pub fn bearing(&self, offset: &Vector3<f64>) -> f64 {
        let angle = offset.dot(&self.v).atan2(offset.dot(&self.u));
        let wrapped = angle.rem_euclid(TAU);
        if wrapped >= TAU { 0.0 } else { wrapped }
    }
}

/// One sample along a meridian.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct GeodesicPoint {
    /// Vertex index in the working mesh.
    pub vertex: u32,
    /// Vertex position.
    pub position: Point3<f64>,
    /// Graph distance from the pole (mm).
    pub arc_length: f64,
    /// Signed radial deviation from the mean surface radius (µm).
    pub deviation: f64,
    /// d(deviation)/d(arc length) (µm/mm).
    pub derivative: f64,
    /// Second derivative of deviation along arc length (µm/mm²).
    pub second_derivative: f64,
}

/// A meridian from the pole toward the rim at a fixed bearing.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct Geodesic {
    /// Bearing in degrees, `[0, 360)`.
    pub angle_deg: f64,
    /// Samples ordered by arc length, starting at the pole.
    pub points: Vec<GeodesicPoint>,
    /// Arc length of the last sample (mm).
    pub total_length: f64,
    /// Largest deviation along the meridian (µm).
    pub max_deviation: f64,
    /// Smallest deviation along the meridian (µm).
    pub min_deviation: f64,
    /// Samples with |deviation| above [`MERIDIAN_SCREENING_UM`].
    pub anomaly_count: usize,
}

/// Precomputed state for extracting meridians from one working mesh.
///
/// The solver owns copies of everything it needs, so it can be moved to a
/// worker thread (see [`GeodesicJob`]).
#[derive(Debug, Clone)]
pub struct GeodesicSolver {
    positions: Vec<Point3<f64>>,
    center: Point3<f64>,
    mean_radius: f64,
    frame: LocalFrame,
    pole: usize,
    paths: ShortestPaths,
    /// Reachable non-pole vertices as `(bearing, vertex)`, sorted.
    by_bearing: Vec<(f64, u32)>,
    count: usize,
    max_points: usize,
}

impl GeodesicSolver {
    /// Prepare meridian extraction on `mesh`.
    ///
    /// Finds the pole, runs Dijkstra from it and bins vertices by bearing.
    /// `count` is the number of evenly spaced meridians and `max_points`
    /// caps the samples per meridian, the pole included.
    ///
    /// # Errors
    ///
    /// Returns [`WearError::InvalidMesh`] if the mesh is empty or the graph
    /// does not match it, or [`WearError::InvalidParameter`] if `count` is 0
    /// or `max_points` is below 2.
    pub fn new(
        mesh: &Mesh,
        graph: &MeshGraph,
        sphere: &SphereFit,
        axis: &Vector3<f64>,
        count: usize,
        max_points: usize,
    ) -> WearResult<Self> {
        if mesh.positions.is_empty() {
            return Err(WearError::invalid_mesh("cannot extract meridians from an empty mesh"));
        }
        if graph.vertex_count() != mesh.vertex_count() {
            return Err(WearError::invalid_mesh(format!(
                "graph has {} vertices but mesh has {}",
                graph.vertex_count(),
                mesh.vertex_count()
            )));
        }
        if count == 0 {
            return Err(WearError::invalid_parameter(
                "geodesic_count",
                0.0,
                "at least one meridian is required",
            ));
        }
        if max_points < 2 {
            return Err(WearError::invalid_parameter(
                "max_points_per_meridian",
                max_points as f64,
                "a meridian needs the pole plus at least one sample",
            ));
        }

        let frame = LocalFrame::from_axis(axis);
        let pole = find_pole(mesh, &sphere.center, &frame.w)
            .ok_or_else(|| WearError::invalid_mesh("mesh has no vertices"))?;
        let paths = dijkstra(graph, pole);

        let mean_radius = mesh
            .positions
            .iter()
            .map(|p| (p - sphere.center).norm())
            .sum::<f64>()
            / mesh.vertex_count() as f64;

        let pole_position = mesh.positions[pole];
        let mut by_bearing: Vec<(f64, u32)> = mesh
            .positions
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != pole && paths.is_reachable(i))
            .map(|(i, p)| (frame.bearing(&(p - pole_position)), i as u32))
            .collect();
        by_bearing.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        debug!(
            target: "cup_wear::pipeline",
            pole = pole,
            reachable = paths.reachable_count(),
            mean_radius = mean_radius,
            meridians = count,
            "Prepared geodesic solver"
        );

        Ok(Self {
            positions: mesh.positions.clone(),
            center: sphere.center,
            mean_radius,
            frame,
            pole,
            paths,
            by_bearing,
            count,
            max_points,
        })
    }

    /// Index of the pole vertex.
    pub fn pole(&self) -> usize {
        self.pole
    }

    /// Position of the pole vertex.
    pub fn pole_position(&self) -> Point3<f64> {
        self.positions[self.pole]
    }

    /// Mean distance of all vertices from the sphere center (mm).
    pub fn mean_radius(&self) -> f64 {
        self.mean_radius
    }

    /// The frame used for bearings.
    pub fn frame(&self) -> &LocalFrame {
        &self.frame
    }

    /// Shortest-path tree from the pole.
    pub fn paths(&self) -> &ShortestPaths {
        &self.paths
    }

    /// Number of meridians.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Lazily build the meridians in bearing order.
    pub fn meridians(&self) -> Meridians<'_> {
        Meridians {
            solver: self,
            next: 0,
        }
    }

    /// Build every meridian, reporting progress after each one.
    pub fn compute_all(&self, reporter: &dyn ProgressReporter) -> Vec<Geodesic> {
        let mut out = Vec::with_capacity(self.count);
        for (i, geodesic) in self.meridians().enumerate() {
            let done = i + 1;
            trace!(
                target: "cup_wear::progress",
                meridian = done,
                total = self.count,
                points = geodesic.points.len(),
                "Meridian extracted"
            );
            reporter.report(&ProgressEvent::within(
                PipelineStage::GeodesicsComputed,
                done as f64 / self.count as f64,
                format!("meridian {}/{}", done, self.count),
            ));
            out.push(geodesic);
        }
        out
    }

    /// Build meridian `index` (bearing `index * 360 / count` degrees).
    pub fn meridian(&self, index: usize) -> Geodesic {
        let step = TAU / self.count as f64;
        let target = index as f64 * step;
        let half_band = 0.5 * BAND_WIDTH_STEPS * step;

        let mut members: Vec<u32> = self.vertices_near_bearing(target, half_band);
        members.sort_by(|&a, &b| {
            self.paths.distances[a as usize]
                .total_cmp(&self.paths.distances[b as usize])
                .then(a.cmp(&b))
        });

        let budget = self.max_points - 1;
        if members.len() > budget {
            let stride = members.len().div_ceil(budget);
            members = members.into_iter().step_by(stride).collect();
        }

        let mut vertices = Vec::with_capacity(members.len() + 1);
        vertices.push(self.pole as u32);
        vertices.extend(members);

        let arc: Vec<f64> = vertices
            .iter()
            .map(|&v| self.paths.distances[v as usize])
            .collect();
        let deviation: Vec<f64> = vertices
            .iter()
            .map(|&v| ((self.positions[v as usize] - self.center).norm() - self.mean_radius) * 1000.0)
            .collect();
        let first = finite_differences(&arc, &deviation);
        let second = finite_differences(&arc, &first);

        let points: Vec<GeodesicPoint> = vertices
            .iter()
            .enumerate()
            .map(|(i, &v)| GeodesicPoint {
                vertex: v,
                position: self.positions[v as usize],
                arc_length: arc[i],
                deviation: deviation[i],
                derivative: first[i],
                second_derivative: second[i],
            })
            .collect();

        let max_deviation = deviation.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min_deviation = deviation.iter().copied().fold(f64::INFINITY, f64::min);
        let anomaly_count = deviation
            .iter()
            .filter(|d| d.abs() > MERIDIAN_SCREENING_UM)
            .count();

        Geodesic {
            angle_deg: target.to_degrees(),
            total_length: arc.last().copied().unwrap_or(0.0),
            points,
            max_deviation,
            min_deviation,
            anomaly_count,
        }
    }

    /// Vertices whose bearing is within `half_band` of `target` (wrapped).
    fn vertices_near_bearing(&self, target: f64, half_band: f64) -> Vec<u32> {
        if half_band * 2.0 >= TAU {
            return self.by_bearing.iter().map(|&(_, v)| v).collect();
        }

        let lo = target - half_band;
        let hi = target + half_band;
        let mut out = Vec::new();
        let mut take = |from: f64, to: f64| {
            let start = self.by_bearing.partition_point(|&(a, _)| a < from);
            let end = self.by_bearing.partition_point(|&(a, _)| a <= to);
            if start < end {
                out.extend(self.by_bearing[start..end].iter().map(|&(_, v)| v));
            }
        };

        take(lo.max(0.0), hi.min(TAU));
        if lo < 0.0 {
            take(lo + TAU, TAU);
        }
        if hi > TAU {
            take(0.0, hi - TAU);
        }
        out
    }
}

/// Lazy, finite iterator over a solver's meridians.
#[derive(Debug)]
pub struct Meridians<'a> {
    solver: &'a GeodesicSolver,
    next: usize,
}

impl Iterator for Meridians<'_> {
    type Item = Geodesic;

    fn next(&mut self) -> Option<Geodesic> {
        if self.next >= self.solver.count {
            return None;
        }
        let geodesic = self.solver.meridian(self.next);
        self.next += 1;
        Some(geodesic)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.solver.count - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Meridians<'_> {}

/// Derivative of `values` with respect to `s`.
///
/// Central differences inside, one-sided at the ends. A zero step gives 0.
fn finite_differences(s: &[f64], values: &[f64]) -> Vec<f64> {
    let n = values.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let slope = |i: usize, j: usize| {
        let ds = s[j] - s[i];
        if ds.abs() > f64::EPSILON {
            (values[j] - values[i]) / ds
        } else {
            0.0
        }
    };
    (0..n)
        .map(|i| {
            if i == 0 {
                slope(0, 1)
            } else if i == n - 1 {
                slope(n - 2, n - 1)
            } else {
                slope(i - 1, i + 1)
            }
        })
        .collect()
}

/// Meridian extraction running on a worker thread.
///
/// ```no_run
/// # use cup_wear::geodesic::{GeodesicJob, GeodesicSolver};
/// # fn demo(solver: GeodesicSolver) -> cup_wear::WearResult<()> {
/// let job = GeodesicJob::spawn(solver);
/// for event in job.progress() {
///     println!("{:>3}% {}", event.percent(), event.message);
/// }
/// let meridians = job.join()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct GeodesicJob {
    handle: JoinHandle<Vec<Geodesic>>,
    events: Receiver<ProgressEvent>,
}

impl GeodesicJob {
    /// Start building all meridians of `solver` in the background.
    pub fn spawn(solver: GeodesicSolver) -> Self {
        let (sender, events) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            let reporter = ChannelProgressReporter::new(sender);
            solver.compute_all(&reporter)
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

    /// Wait for the meridians.
    ///
    /// # Errors
    ///
    /// Returns [`WearError::InvalidMesh`] if the worker panicked.
    pub fn join(self) -> WearResult<Vec<Geodesic>> {
        self.handle
            .join()
            .map_err(|_| WearError::invalid_mesh("geodesic worker panicked"))
    }
}
