//! Wear volume between the surface and the reference sphere.
//!
//! Each anomalous face and its radial projection onto the sphere bound a
//! triangular prism. The prism is split into three tetrahedra
//! `{v0,v1,v2,s0}`, `{s0,v1,v2,s1}`, `{s0,s1,v2,s2}` and their volumes are
//! summed.

use hashbrown::HashMap;
use nalgebra::{Point3, Vector3};
use tracing::info;

use crate::clustering::{AnomalyCluster, ClusterSet};
use crate::fitting::SphereFit;
use crate::types::Mesh;

/// Volume totals of one run.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct VolumeReport {
    /// Excess material outside the sphere (mm³).
    pub bump_volume: f64,
    /// Missing material inside the sphere (mm³).
    pub dip_volume: f64,
    /// Faces counted toward `bump_volume`.
    pub bump_faces: usize,
    /// Faces counted toward `dip_volume`.
    pub dip_faces: usize,
    /// Volume attributed to each cluster, indexed by cluster id (mm³).
    pub cluster_volumes: Vec<f64>,
    /// Density used for mass conversion (g/cm³).
    pub density_g_cm3: f64,
}

impl VolumeReport {
    /// Sum of bump and dip volumes (mm³).
    pub fn total_volume(&self) -> f64 {
        self.bump_volume + self.dip_volume
    }

    /// Bump mass (mg).
    pub fn bump_mass_mg(&self) -> f64 {
        volume_to_mass_mg(self.bump_volume, self.density_g_cm3)
    }

    /// Dip mass, i.e. worn material (mg).
    pub fn dip_mass_mg(&self) -> f64 {
        volume_to_mass_mg(self.dip_volume, self.density_g_cm3)
    }

    /// Total mass (mg).
    pub fn total_mass_mg(&self) -> f64 {
        volume_to_mass_mg(self.total_volume(), self.density_g_cm3)
    }
}

/// Direction and size of the main wear relative to the pole.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct WearVector {
    /// Extreme point of the primary wear zone.
    pub deepest_point: Point3<f64>,
    /// Pole of the cup.
    pub pole_point: Point3<f64>,
    /// Unit vector from pole to deepest point (zero if they coincide).
    pub direction: Vector3<f64>,
    /// Angle between `direction` and the cup axis (degrees).
    pub angle_deg: f64,
    /// Distance from pole to deepest point (mm).
    pub distance: f64,
    /// Depth of the primary wear zone (µm).
    pub max_depth_um: f64,
}

impl WearVector {
    /// Wear vector from the pole toward a wear zone's extreme point.
    pub fn new(pole_point: Point3<f64>, zone: &AnomalyCluster, axis: &Vector3<f64>) -> Self {
        let offset = zone.extreme_position - pole_point;
        let distance = offset.norm();
        let direction = offset.try_normalize(1e-15).unwrap_or_else(Vector3::zeros);
        let cos = direction.dot(axis).clamp(-1.0, 1.0);

        Self {
            deepest_point: zone.extreme_position,
            pole_point,
            direction,
            angle_deg: cos.acos().to_degrees(),
            distance,
            max_depth_um: zone.min_deviation.abs(),
        }
    }
}

/// Convert a volume in mm³ to a mass in mg (1 g/cm³ = 1 mg/mm³).
#[inline]
pub fn volume_to_mass_mg(volume_mm3: f64, density_g_cm3: f64) -> f64 {
    volume_mm3 * density_g_cm3
}

/// Unsigned volume of a tetrahedron.
#[inline]
pub fn tetrahedron_volume(a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>, d: &Point3<f64>) -> f64 {
    ((b - a).dot(&(c - a).cross(&(d - a))) / 6.0).abs()
}

/// Volume between a triangle and its radial projection onto the sphere.
pub fn prism_volume(triangle: &[Point3<f64>; 3], sphere: &SphereFit) -> f64 {
    let [v0, v1, v2] = triangle;
    let s0 = sphere.project(v0);
    let s1 = sphere.project(v1);
    let s2 = sphere.project(v2);

    let sum = tetrahedron_volume(v0, v1, v2, &s0)
        + tetrahedron_volume(&s0, v1, v2, &s1)
        + tetrahedron_volume(&s0, &s1, v2, &s2);
    sum.abs()
}

/// Integrate bump/dip volume over anomalous faces.
///
/// A face is anomalous if the mean deviation of its vertices exceeds
/// `threshold_um` in magnitude; its sign picks the bucket. The face's volume
/// is also credited to the cluster owning its first vertex found in a
/// cluster, checking `v0`, then `v1`, then `v2`.
pub fn compute_volumes(
    mesh: &Mesh,
    sphere: &SphereFit,
    deviations: &[f64],
    clusters: &ClusterSet,
    threshold_um: f64,
    density_g_cm3: f64,
) -> VolumeReport {
    let mut owner: HashMap<u32, usize> = HashMap::new();
    let mut max_id = None;
    for cluster in clusters.iter() {
        for p in &cluster.points {
            owner.entry(p.vertex).or_insert(cluster.id);
        }
        max_id = max_id.max(Some(cluster.id));
    }

    let mut report = VolumeReport {
        cluster_volumes: vec![0.0; max_id.map_or(0, |m| m + 1)],
        density_g_cm3,
        ..VolumeReport::default()
    };

    for (f, face) in mesh.faces.iter().enumerate() {
        let mean = face
            .iter()
            .map(|&v| deviations.get(v as usize).copied().unwrap_or(0.0))
            .sum::<f64>()
            / 3.0;
        if mean.abs() <= threshold_um {
            continue;
        }

        let volume = prism_volume(&mesh.face_positions(f), sphere);
        if mean > 0.0 {
            report.bump_volume += volume;
            report.bump_faces += 1;
        } else {
            report.dip_volume += volume;
            report.dip_faces += 1;
        }

        if let Some(&id) = face.iter().find_map(|v| owner.get(v)) {
            report.cluster_volumes[id] += volume;
        }
    }

    info!(
        target: "cup_wear::pipeline",
        bump_mm3 = format!("{:.6}", report.bump_volume),
        dip_mm3 = format!("{:.6}", report.dip_volume),
        dip_mg = format!("{:.4}", report.dip_mass_mg()),
        "Computed wear volumes"
    );

    report
}

/// Copy of `clusters` with each cluster's volume filled in from `report`.
pub fn with_cluster_volumes(clusters: &ClusterSet, report: &VolumeReport) -> ClusterSet {
    let mut out = clusters.clone();
    for cluster in out.iter_mut() {
        cluster.volume = Some(report.cluster_volumes.get(cluster.id).copied().unwrap_or(0.0));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clustering::cluster_anomalies;
    use crate::deviation::{AnomalyKind, AnomalyPoint};
    use approx::assert_relative_eq;

    fn unit_sphere_fit(radius: f64) -> SphereFit {
        SphereFit {
            center: Point3::origin(),
            radius,
            rms_error: 0.0,
            max_error: 0.0,
            residuals: Vec::new(),
        }
    }

    /// Small triangle around the +Z pole at height `z`.
    fn cap_triangle(z: f64) -> [Point3<f64>; 3] {
        [
            Point3::new(0.1, 0.0, z),
            Point3::new(-0.05, 0.0866, z),
            Point3::new(-0.05, -0.0866, z),
        ]
    }

    #[test]
    fn test_tetrahedron_volume() {
        let v = tetrahedron_volume(
            &Point3::origin(),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(0.0, 1.0, 0.0),
            &Point3::new(0.0, 0.0, 1.0),
        );
        assert_relative_eq!(v, 1.0 / 6.0, epsilon = 1e-15);
    }

    #[test]
    fn test_prism_volume_matches_area_times_height() {
        let sphere = unit_sphere_fit(10.0);
        let outside = cap_triangle(10.05);
        let v = prism_volume(&outside, &sphere);
        let area = (outside[1] - outside[0]).cross(&(outside[2] - outside[0])).norm() / 2.0;
        // Nearly flat at the pole: prism height ~ 0.05 mm.
        assert_relative_eq!(v, area * 0.05, max_relative = 0.02);
    }

    #[test]
    fn test_surface_on_sphere_has_zero_volume() {
        let sphere = unit_sphere_fit(10.0);
        let on: [Point3<f64>; 3] = [
            Point3::new(0.0, 0.0, 10.0),
            Point3::new(10.0 * 0.01_f64.sin(), 0.0, 10.0 * 0.01_f64.cos()),
            Point3::new(0.0, 10.0 * 0.01_f64.sin(), 10.0 * 0.01_f64.cos()),
        ];
        assert!(prism_volume(&on, &sphere) < 1e-15);
    }

    #[test]
    fn test_volume_sign_buckets() {
        let sphere = unit_sphere_fit(10.0);
        let mut positions = Vec::new();
        positions.extend_from_slice(&cap_triangle(10.01));
        positions.extend(cap_triangle(9.9).iter().map(|p| Point3::new(p.x + 1.0, p.y, p.z)));
        let mesh = Mesh::from_parts(positions, vec![[0, 1, 2], [3, 4, 5]]);
        let deviations: Vec<f64> = mesh
            .positions
            .iter()
            .map(|p| sphere.signed_distance(p) * 1000.0)
            .collect();

        let report = compute_volumes(&mesh, &sphere, &deviations, &ClusterSet::default(), 1.0, 0.935);
        assert!(report.bump_volume > 0.0);
        assert!(report.dip_volume > 0.0);
        assert_eq!(report.bump_faces, 1);
        assert_eq!(report.dip_faces, 1);
        assert_relative_eq!(report.total_volume(), report.bump_volume + report.dip_volume);
        assert_relative_eq!(report.dip_mass_mg(), report.dip_volume * 0.935);
        assert!(report.cluster_volumes.is_empty());
    }

    #[test]
    fn test_below_threshold_ignored() {
        let sphere = unit_sphere_fit(10.0);
        let mesh = Mesh::from_parts(cap_triangle(10.0005).to_vec(), vec![[0, 1, 2]]);
        let deviations = vec![0.5; 3];
        let report = compute_volumes(&mesh, &sphere, &deviations, &ClusterSet::default(), 1.0, 1.0);
        assert_eq!(report.total_volume(), 0.0);
    }

    #[test]
    fn test_cluster_attribution_prefers_first_vertex() {
        let sphere = unit_sphere_fit(10.0);
        let mesh = Mesh::from_parts(cap_triangle(9.99).to_vec(), vec![[0, 1, 2]]);
        let deviations = vec![-10.0; 3];

        let dip = |vertex: u32, x: f64| AnomalyPoint {
            position: Point3::new(x, 0.0, 0.0),
            deviation: -10.0,
            kind: AnomalyKind::Dip,
            geodesic_angle: 0.0,
            arc_length: 0.0,
            derivative: 0.0,
            vertex,
        };
        // Vertices 2 and 1 are separate singleton clusters (ids 0 and 1 in canonical order).
        let clusters = cluster_anomalies(&[dip(2, 50.0), dip(1, -50.0)], 0.5, 3);
        assert_eq!(clusters.dips.len(), 2);
        let owner_of_v1 = clusters.dips.iter().find(|c| c.points[0].vertex == 1).unwrap().id;

        let report = compute_volumes(&mesh, &sphere, &deviations, &clusters, 1.0, 1.0);
        assert!(report.cluster_volumes[owner_of_v1] > 0.0);
        assert_eq!(report.cluster_volumes.iter().filter(|&&v| v > 0.0).count(), 1);

        let filled = with_cluster_volumes(&clusters, &report);
        assert!(filled.iter().all(|c| c.volume.is_some()));
        assert_relative_eq!(
            filled.get(owner_of_v1).unwrap().volume.unwrap(),
            report.dip_volume
        );
    }

    #[test]
    fn test_wear_vector_angle() {
        let theta = 30.0_f64.to_radians();
        let r = 14.0;
        let zone = {
            let p = AnomalyPoint {
                position: Point3::new(r * theta.sin(), 0.0, r * theta.cos()),
                deviation: -6.0,
                kind: AnomalyKind::Dip,
                geodesic_angle: 0.0,
                arc_length: 0.0,
                derivative: 0.0,
                vertex: 7,
            };
            cluster_anomalies(&[p], 0.5, 3).dips.remove(0)
        };
        let wv = WearVector::new(Point3::new(0.0, 0.0, r), &zone, &Vector3::z());
        assert_relative_eq!(wv.angle_deg, 105.0, epsilon = 1e-9);
        assert_relative_eq!(wv.distance, 2.0 * r * (theta / 2.0).sin(), epsilon = 1e-9);
        assert_relative_eq!(wv.max_depth_um, 6.0);
        assert_relative_eq!(wv.direction.norm(), 1.0, epsilon = 1e-12);
    }
}
