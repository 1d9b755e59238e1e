//! Density-based clustering of anomaly points into bump and dip regions.
//!
//! Bumps and dips are clustered separately with DBSCAN over 3-D Euclidean
//! distance. Points are put into a canonical order (vertex index, then
//! position) first, so the partition does not depend on input order.

use hashbrown::HashMap;
use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Point3, Vector3};
use tracing::debug;

use crate::deviation::{AnomalyKind, AnomalyPoint};

/// Noise points deviating more than this (µm) become singleton clusters.
pub const SINGLETON_PROMOTION_UM: f64 = 5.0;

/// A connected region of same-kind anomaly points.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct AnomalyCluster {
    /// Unique within one run. Bump clusters are numbered before dip clusters.
    pub id: usize,
    pub kind: AnomalyKind,
    /// Members in canonical order; never empty.
    pub points: Vec<AnomalyPoint>,
    /// Mean member position.
    pub centroid: Point3<f64>,
    /// `π r²` with `r` the largest centroid-to-member distance (mm²).
    pub area: f64,
    /// Material volume between surface and sphere (mm³). `None` until the
    /// volume stage has run.
    pub volume: Option<f64>,
    /// Mean member deviation (µm).
    pub avg_deviation: f64,
    /// Smallest member deviation (µm).
    pub min_deviation: f64,
    /// Largest member deviation (µm).
    pub max_deviation: f64,
    /// Deviation of the extreme member: the maximum for bumps, the minimum for dips (µm).
    pub extreme_deviation: f64,
    /// Position of the extreme member.
    pub extreme_position: Point3<f64>,
}

impl AnomalyCluster {
    fn from_points(id: usize, kind: AnomalyKind, points: Vec<AnomalyPoint>) -> Self {
        let n = points.len() as f64;
        let centroid = Point3::from(
            points.iter().map(|p| p.position.coords).sum::<Vector3<f64>>() / n,
        );
        let r_max = points
            .iter()
            .map(|p| (p.position - centroid).norm())
            .fold(0.0_f64, f64::max);

        let avg_deviation = points.iter().map(|p| p.deviation).sum::<f64>() / n;
        let min_deviation = points.iter().map(|p| p.deviation).fold(f64::INFINITY, f64::min);
        let max_deviation = points.iter().map(|p| p.deviation).fold(f64::NEG_INFINITY, f64::max);

        let mut extreme = &points[0];
        for p in &points[1..] {
            let better = match kind {
                AnomalyKind::Bump => p.deviation > extreme.deviation,
                AnomalyKind::Dip => p.deviation < extreme.deviation,
            };
            if better {
                extreme = p;
            }
        }
        let extreme_deviation = extreme.deviation;
        let extreme_position = extreme.position;

        Self {
            id,
            kind,
            centroid,
            area: std::f64::consts::PI * r_max * r_max,
            volume: None,
            avg_deviation,
            min_deviation,
            max_deviation,
            extreme_deviation,
            extreme_position,
            points,
        }
    }

    /// Number of member points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True if the cluster has no members; clusters built by
    /// [`cluster_anomalies`] never are.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Volume converted to mass in milligrams.
    pub fn mass_mg(&self, density_g_cm3: f64) -> Option<f64> {
        self.volume.map(|v| v * density_g_cm3)
    }
}

/// All clusters of one run.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterSet {
    pub bumps: Vec<AnomalyCluster>,
    pub dips: Vec<AnomalyCluster>,
}

impl ClusterSet {
    /// Every cluster in id order.
    pub fn iter(&self) -> impl Iterator<Item = &AnomalyCluster> {
        self.bumps.iter().chain(self.dips.iter())
    }

    /// Mutable access to every cluster in id order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut AnomalyCluster> {
        self.bumps.iter_mut().chain(self.dips.iter_mut())
    }

    /// Total number of clusters.
    pub fn len(&self) -> usize {
        self.bumps.len() + self.dips.len()
    }

    /// Check if there are no clusters.
    pub fn is_empty(&self) -> bool {
        self.bumps.is_empty() && self.dips.is_empty()
    }

    /// Cluster with the given id.
    pub fn get(&self, id: usize) -> Option<&AnomalyCluster> {
        self.iter().find(|c| c.id == id)
    }

    /// The deepest dip cluster (most negative minimum deviation).
    ///
    /// Ties go to the lower id. `None` if there are no dips.
    pub fn primary_wear_zone(&self) -> Option<&AnomalyCluster> {
        let mut best: Option<&AnomalyCluster> = None;
        for c in &self.dips {
            match best {
                Some(b) if c.min_deviation >= b.min_deviation => {}
                _ => best = Some(c),
            }
        }
        best
    }
}

/// Cluster anomaly points into bump and dip regions.
///
/// A point with at least `min_points` points within `eps` mm (itself
/// included) is a core point. Points reachable from no core point are
/// noise; noise deviating more than [`SINGLETON_PROMOTION_UM`] becomes a
/// cluster of its own.
pub fn cluster_anomalies(points: &[AnomalyPoint], eps: f64, min_points: usize) -> ClusterSet {
    let mut bumps: Vec<AnomalyPoint> = points
        .iter()
        .filter(|p| p.kind == AnomalyKind::Bump)
        .cloned()
        .collect();
    let mut dips: Vec<AnomalyPoint> = points
        .iter()
        .filter(|p| p.kind == AnomalyKind::Dip)
        .cloned()
        .collect();
    canonical_sort(&mut bumps);
    canonical_sort(&mut dips);

    let bump_groups = dbscan_with_promotion(&bumps, eps, min_points);
    let dip_groups = dbscan_with_promotion(&dips, eps, min_points);

    let mut next_id = 0;
    let mut build = |groups: Vec<Vec<usize>>, source: &[AnomalyPoint], kind: AnomalyKind| {
        groups
            .into_iter()
            .map(|members| {
                let pts = members.into_iter().map(|i| source[i].clone()).collect();
                let cluster = AnomalyCluster::from_points(next_id, kind, pts);
                next_id += 1;
                cluster
            })
            .collect::<Vec<_>>()
    };
    let bump_clusters = build(bump_groups, &bumps, AnomalyKind::Bump);
    let dip_clusters = build(dip_groups, &dips, AnomalyKind::Dip);

    debug!(
        target: "cup_wear::pipeline",
        bump_points = bumps.len(),
        dip_points = dips.len(),
        bump_clusters = bump_clusters.len(),
        dip_clusters = dip_clusters.len(),
        "Clustered anomalies"
    );

    ClusterSet {
        bumps: bump_clusters,
        dips: dip_clusters,
    }
}

/// Sort by vertex index, then by position.
fn canonical_sort(points: &mut [AnomalyPoint]) {
    points.sort_by(|a, b| {
        a.vertex
            .cmp(&b.vertex)
            .then(a.position.x.total_cmp(&b.position.x))
            .then(a.position.y.total_cmp(&b.position.y))
            .then(a.position.z.total_cmp(&b.position.z))
    });
}

/// DBSCAN plus singleton promotion.
///
/// Returns member index lists ordered by their lowest member index, each
/// list sorted ascending.
fn dbscan_with_promotion(points: &[AnomalyPoint], eps: f64, min_points: usize) -> Vec<Vec<usize>> {
    let labels = dbscan(points, eps, min_points);

    let cluster_count = labels.iter().flatten().copied().max().map_or(0, |m| m + 1);
    let mut groups: Vec<Vec<usize>> = vec![Vec::new(); cluster_count];
    for (i, label) in labels.iter().enumerate() {
        match label {
            Some(c) => groups[*c].push(i),
            None if points[i].deviation.abs() > SINGLETON_PROMOTION_UM => groups.push(vec![i]),
            None => {}
        }
    }

    groups.sort_by_key(|g| g[0]);
    groups
}

/// Plain DBSCAN over point positions; `None` marks noise.
///
/// Cluster labels are assigned in order of the first core point found.
fn dbscan(points: &[AnomalyPoint], eps: f64, min_points: usize) -> Vec<Option<usize>> {
    let n = points.len();
    let mut labels: Vec<Option<usize>> = vec![None; n];
    if n == 0 {
        return labels;
    }

    let index = NeighborIndex::build(points, eps);
    let neighbors = |i: usize| index.within(points, i, eps);

    let mut visited = vec![false; n];
    let mut next_label = 0;

    for start in 0..n {
        if visited[start] {
            continue;
        }
        visited[start] = true;

        let seeds = neighbors(start);
        if seeds.len() < min_points {
            continue;
        }

        let label = next_label;
        next_label += 1;
        labels[start] = Some(label);

        let mut queue: Vec<usize> = seeds;
        let mut head = 0;
        while head < queue.len() {
            let q = queue[head];
            head += 1;

            if labels[q].is_none() {
                labels[q] = Some(label);
            }
            if visited[q] {
                continue;
            }
            visited[q] = true;

            let expansion = neighbors(q);
            if expansion.len() >= min_points {
                queue.extend(expansion.into_iter().filter(|&j| labels[j].is_none()));
            }
        }
    }

    labels
}

/// Longest run of equal values on one axis the k-d tree accepts.
///
/// The mutable tree cannot split a bucket whose items all share the split
/// coordinate, so heavily snapped input goes to the hash grid instead.
const MAX_SHARED_COORDINATE: usize = 16;

/// ε-neighbourhood lookup over anomaly positions.
enum NeighborIndex {
    Tree(KdTree<f64, 3>),
    Grid {
        cells: HashMap<(i64, i64, i64), Vec<usize>>,
        cell_size: f64,
    },
}

impl NeighborIndex {
    fn build(points: &[AnomalyPoint], eps: f64) -> Self {
        let shared = longest_shared_coordinate(points);
        if shared <= MAX_SHARED_COORDINATE {
            let mut tree: KdTree<f64, 3> = KdTree::new();
            for (i, p) in points.iter().enumerate() {
                tree.add(&[p.position.x, p.position.y, p.position.z], i as u64);
            }
            return Self::Tree(tree);
        }

        debug!(
            target: "cup_wear::pipeline",
            shared_coordinate = shared,
            "Using hash grid for neighbour queries"
        );
        Self::grid(points, eps)
    }

    fn grid(points: &[AnomalyPoint], eps: f64) -> Self {
        let cell_size = eps.max(1e-9);
        let mut cells: HashMap<(i64, i64, i64), Vec<usize>> = HashMap::new();
        for (i, p) in points.iter().enumerate() {
            cells.entry(grid_cell(&p.position, cell_size)).or_default().push(i);
        }
        Self::Grid { cells, cell_size }
    }

    /// Indices within `eps` of point `i`, including `i`, ascending.
    fn within(&self, points: &[AnomalyPoint], i: usize, eps: f64) -> Vec<usize> {
        let p = &points[i].position;
        let radius_sq = eps * eps;
        let mut found: Vec<usize> = match self {
            Self::Tree(tree) => tree
                .within::<SquaredEuclidean>(&[p.x, p.y, p.z], radius_sq)
                .into_iter()
                .map(|nn| nn.item as usize)
                .collect(),
            Self::Grid { cells, cell_size } => {
                let (cx, cy, cz) = grid_cell(p, *cell_size);
                let mut found = Vec::new();
                for dx in -1..=1 {
                    for dy in -1..=1 {
                        for dz in -1..=1 {
                            let Some(candidates) = cells.get(&(cx + dx, cy + dy, cz + dz)) else {
                                continue;
                            };
                            found.extend(candidates.iter().copied().filter(|&j| {
                                (points[j].position - p).norm_squared() <= radius_sq
                            }));
                        }
                    }
                }
                found
            }
        };
        if !found.contains(&i) {
            found.push(i);
        }
        found.sort_unstable();
        found
    }
}

fn grid_cell(p: &Point3<f64>, cell_size: f64) -> (i64, i64, i64) {
    (
        (p.x / cell_size).floor() as i64,
        (p.y / cell_size).floor() as i64,
        (p.z / cell_size).floor() as i64,
    )
}

/// Largest number of points sharing one coordinate value on any axis.
fn longest_shared_coordinate(points: &[AnomalyPoint]) -> usize {
    let mut longest = 0;
    let mut values: Vec<f64> = Vec::with_capacity(points.len());
    for axis in 0..3 {
        values.clear();
        values.extend(points.iter().map(|p| p.position[axis]));
        values.sort_by(f64::total_cmp);
        let mut run = 0;
        for (k, v) in values.iter().enumerate() {
            if k > 0 && v.total_cmp(&values[k - 1]).is_eq() {
                run += 1;
            } else {
                run = 1;
            }
            longest = longest.max(run);
        }
    }
    longest
}
