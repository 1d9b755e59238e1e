//! Per-vertex deviation from the reference sphere and anomaly extraction.

use hashbrown::HashSet;
use nalgebra::Point3;
use rayon::prelude::*;

use crate::fitting::SphereFit;
use crate::geodesic::Geodesic;
use crate::types::Mesh;

/// Direction of a deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(rename_all = "snake_case"))]
pub enum AnomalyKind {
    /// Outward deviation, excess material.
    Bump,
    /// Inward deviation, worn or missing material.
    Dip,
}

impl AnomalyKind {
    /// Kind of a signed deviation; `None` for exactly zero.
    pub fn of(deviation: f64) -> Option<Self> {
        if deviation > 0.0 {
            Some(AnomalyKind::Bump)
        } else if deviation < 0.0 {
            Some(AnomalyKind::Dip)
        } else {
            None
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnomalyKind::Bump => write!(f, "bump"),
            AnomalyKind::Dip => write!(f, "dip"),
        }
    }
}

/// A meridian sample whose deviation exceeds the reporting threshold.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct AnomalyPoint {
    /// Working-mesh vertex position.
    pub position: Point3<f64>,
    /// Signed deviation (µm).
    pub deviation: f64,
    /// Bump or dip, from the sign of `deviation`.
    pub kind: AnomalyKind,
    /// Bearing of the meridian the point was first seen on (degrees).
    pub geodesic_angle: f64,
    /// Distance from the pole along that meridian (mm).
    pub arc_length: f64,
    /// Deviation slope along the meridian (µm/mm).
    pub derivative: f64,
    /// Working-mesh vertex index.
    pub vertex: u32,
}

/// Summary statistics of a deviation map.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviationStats {
    /// Mean deviation (µm).
    pub mean: f64,
    /// Population standard deviation (µm).
    pub std_dev: f64,
    /// Largest positive deviation, 0 if none (µm).
    pub max_bump: f64,
    /// Most negative deviation, 0 if none (µm).
    pub max_dip: f64,
    /// Percentage of vertices with |deviation| <= threshold.
    pub within_tolerance_percent: f64,
}

/// Output of the deviation analysis stage.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviationAnalysis {
    /// Deviation of every working-mesh vertex (µm).
    pub deviations: Vec<f64>,
    pub stats: DeviationStats,
    /// Distinct meridian samples above the threshold, in meridian order.
    pub anomalies: Vec<AnomalyPoint>,
}

impl DeviationAnalysis {
    /// Run the full deviation analysis.
    pub fn compute(mesh: &Mesh, sphere: &SphereFit, geodesics: &[Geodesic], threshold_um: f64) -> Self {
        let deviations = vertex_deviations(mesh, sphere);
        let stats = deviation_stats(&deviations, threshold_um);
        let anomalies = extract_anomaly_points(geodesics, threshold_um);
        Self {
            deviations,
            stats,
            anomalies,
        }
    }

    /// Number of bump anomaly points.
    pub fn bump_count(&self) -> usize {
        self.anomalies.iter().filter(|a| a.kind == AnomalyKind::Bump).count()
    }

    /// Number of dip anomaly points.
    pub fn dip_count(&self) -> usize {
        self.anomalies.iter().filter(|a| a.kind == AnomalyKind::Dip).count()
    }
}

/// Signed deviation of each vertex from the sphere surface, in micrometres.
pub fn vertex_deviations(mesh: &Mesh, sphere: &SphereFit) -> Vec<f64> {
    mesh.positions
        .par_iter()
        .map(|p| sphere.signed_distance(p) * 1000.0)
        .collect()
}

/// Summary statistics of a deviation map.
///
/// An empty map yields all-zero statistics.
pub fn deviation_stats(deviations: &[f64], threshold_um: f64) -> DeviationStats {
    if deviations.is_empty() {
        return DeviationStats::default();
    }
    let n = deviations.len() as f64;
    let mean = deviations.iter().sum::<f64>() / n;
    let variance = deviations.iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / n;
    let max_bump = deviations.iter().copied().fold(0.0_f64, f64::max);
    let max_dip = deviations.iter().copied().fold(0.0_f64, f64::min);
    let within = deviations.iter().filter(|d| d.abs() <= threshold_um).count();

    DeviationStats {
        mean,
        std_dev: variance.max(0.0).sqrt(),
        max_bump,
        max_dip,
        within_tolerance_percent: 100.0 * within as f64 / n,
    }
}

/// Meridian samples with |deviation| above `threshold_um`.
///
/// Meridian bands overlap, so a vertex can appear on several meridians; only
/// its first occurrence (in meridian order) is kept.
pub fn extract_anomaly_points(geodesics: &[Geodesic], threshold_um: f64) -> Vec<AnomalyPoint> {
    let mut seen: HashSet<u32> = HashSet::new();
    let mut out = Vec::new();

    for geodesic in geodesics {
        for point in &geodesic.points {
            if !seen.insert(point.vertex) {
                continue;
            }
            if point.deviation.abs() <= threshold_um {
                continue;
            }
            let Some(kind) = AnomalyKind::of(point.deviation) else {
                continue;
            };
            out.push(AnomalyPoint {
                position: point.position,
                deviation: point.deviation,
                kind,
                geodesic_angle: geodesic.angle_deg,
                arc_length: point.arc_length,
                derivative: point.derivative,
                vertex: point.vertex,
            });
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geodesic::GeodesicPoint;
    use approx::assert_relative_eq;

    fn point(vertex: u32, deviation: f64) -> GeodesicPoint {
        GeodesicPoint {
            vertex,
            position: Point3::new(vertex as f64, 0.0, 0.0),
            arc_length: vertex as f64,
            deviation,
            derivative: 0.0,
            second_derivative: 0.0,
        }
    }

    fn geodesic(angle_deg: f64, points: Vec<GeodesicPoint>) -> Geodesic {
        Geodesic {
            angle_deg,
            total_length: points.last().map_or(0.0, |p| p.arc_length),
            max_deviation: 0.0,
            min_deviation: 0.0,
            anomaly_count: 0,
            points,
        }
    }

    #[test]
    fn test_vertex_deviations_in_microns() {
        let mesh = Mesh::from_parts(
            vec![
                Point3::new(10.001, 0.0, 0.0),
                Point3::new(0.0, 9.998, 0.0),
                Point3::new(0.0, 0.0, 10.0),
            ],
            vec![[0, 1, 2]],
        );
        let sphere = SphereFit {
            center: Point3::origin(),
            radius: 10.0,
            rms_error: 0.0,
            max_error: 0.0,
            residuals: Vec::new(),
        };
        let d = vertex_deviations(&mesh, &sphere);
        assert_relative_eq!(d[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(d[1], -2.0, epsilon = 1e-6);
        assert_relative_eq!(d[2], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_deviation_stats() {
        let stats = deviation_stats(&[1.0, -3.0, 0.5, 1.5], 1.0);
        assert_relative_eq!(stats.mean, 0.0);
        assert_relative_eq!(stats.std_dev, (12.5_f64 / 4.0).sqrt(), epsilon = 1e-12);
        assert_eq!(stats.max_bump, 1.5);
        assert_eq!(stats.max_dip, -3.0);
        assert_relative_eq!(stats.within_tolerance_percent, 50.0);
    }

    #[test]
    fn test_constant_deviation_has_zero_std() {
        let stats = deviation_stats(&[0.3; 1000], 1.0);
        assert!(stats.std_dev >= 0.0);
        assert!(stats.std_dev < 1e-9);
        assert_eq!(stats.max_dip, 0.0);
        assert_relative_eq!(stats.within_tolerance_percent, 100.0);
    }

    #[test]
    fn test_empty_stats() {
        assert_eq!(deviation_stats(&[], 1.0), DeviationStats::default());
    }

    #[test]
    fn test_extract_first_seen_wins() {
        let geodesics = vec![
            geodesic(0.0, vec![point(0, 0.0), point(1, 3.0), point(2, -4.0)]),
            geodesic(10.0, vec![point(0, 0.0), point(2, -4.0), point(3, 0.5), point(4, -1.5)]),
        ];
        let anomalies = extract_anomaly_points(&geodesics, 1.0);

        let vertices: Vec<u32> = anomalies.iter().map(|a| a.vertex).collect();
        assert_eq!(vertices, vec![1, 2, 4]);
        assert_eq!(anomalies[0].kind, AnomalyKind::Bump);
        assert_eq!(anomalies[1].kind, AnomalyKind::Dip);
        assert_eq!(anomalies[1].geodesic_angle, 0.0);
        assert_eq!(anomalies[2].geodesic_angle, 10.0);
    }

    #[test]
    fn test_no_anomalies_is_empty() {
        let geodesics = vec![geodesic(0.0, vec![point(0, 0.2), point(1, -0.9)])];
        assert!(extract_anomaly_points(&geodesics, 1.0).is_empty());
    }

    #[test]
    fn test_kind_of() {
        assert_eq!(AnomalyKind::of(0.1), Some(AnomalyKind::Bump));
        assert_eq!(AnomalyKind::of(-0.1), Some(AnomalyKind::Dip));
        assert_eq!(AnomalyKind::of(0.0), None);
    }
}
