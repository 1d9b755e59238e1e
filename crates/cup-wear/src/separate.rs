//! Inner/outer surface separation and cup axis estimation.
//!
//! A scanned cup contains both the concave bearing surface and the convex
//! back side. Faces whose normal points toward the mesh centroid are
//! candidates for the inner surface; the largest vertex-connected group of
//! candidates is kept as the inner surface and everything else is outer.

use std::collections::VecDeque;

use nalgebra::{Matrix3, Point3, Vector3};
use tracing::{debug, info, warn};

use crate::trim::percentile;
use crate::types::Mesh;

/// Minimum normal/centroid-direction agreement for a strongly concave face.
const CONCAVITY_DOT: f64 = 0.5;

/// Face-centroid distance percentile used to reject far outliers.
const DISTANCE_PERCENTILE: f64 = 75.0;

const POWER_ITERATIONS: usize = 200;
const POWER_TOLERANCE: f64 = 1e-12;

/// Result of surface separation.
#[derive(Debug, Clone)]
pub struct SurfaceSeparation {
    /// Concave inner surface, the analysis target.
    pub inner: Mesh,
    /// Everything that is not the inner surface.
    pub outer: Mesh,
    /// Source face indices of the inner surface, ascending.
    pub inner_faces: Vec<u32>,
    /// Source face indices of the outer surface, ascending.
    pub outer_faces: Vec<u32>,
    /// Unit cup axis, pointing from the rim toward the pole.
    pub axis: Vector3<f64>,
    /// Number of faces that passed the concavity test.
    pub candidate_count: usize,
    /// True if no face passed the strict test and the relaxed test was used.
    pub relaxed: bool,
    /// True if the inner/outer labels were swapped by the distance check.
    pub swapped: bool,
}

impl SurfaceSeparation {
    /// Check if no inner surface was found.
    pub fn is_inner_empty(&self) -> bool {
        self.inner_faces.is_empty()
    }
}

/// Split a mesh into its inner (concave) and outer surfaces.
///
/// A closed convex mesh such as a full sphere has no concave faces; it
/// yields an empty inner surface and the +Z axis.
pub fn separate_faces(mesh: &Mesh) -> SurfaceSeparation {
    let centroid = mesh.centroid();
    let face_count = mesh.face_count();

    let face_centroids: Vec<Point3<f64>> = (0..face_count).map(|f| mesh.face_centroid(f)).collect();
    let distances: Vec<f64> = face_centroids.iter().map(|c| (c - centroid).norm()).collect();
    let distance_cutoff = percentile(&distances, DISTANCE_PERCENTILE);

    let dots: Vec<f64> = (0..face_count)
        .map(|f| {
            let to_centroid = (centroid - face_centroids[f])
                .try_normalize(1e-15)
                .unwrap_or_else(Vector3::zeros);
            mesh.face_normal(f).dot(&to_centroid)
        })
        .collect();

    let mut candidates: Vec<bool> = (0..face_count)
        .map(|f| dots[f] > CONCAVITY_DOT && distances[f] <= distance_cutoff)
        .collect();
    let mut relaxed = false;
    if !candidates.iter().any(|&c| c) {
        candidates = dots.iter().map(|&d| d > 0.0).collect();
        relaxed = true;
        debug!(target: "cup_wear::pipeline", "No strongly concave faces, relaxing candidate test");
    }
    let candidate_count = candidates.iter().filter(|&&c| c).count();

    let component = largest_vertex_connected_component(mesh, &candidates);
    let mut in_inner = vec![false; face_count];
    for &f in &component {
        in_inner[f as usize] = true;
    }

    let mut inner_faces: Vec<u32> = Vec::with_capacity(component.len());
    let mut outer_faces: Vec<u32> = Vec::with_capacity(face_count - component.len());
    for (f, &inner) in in_inner.iter().enumerate() {
        if inner {
            inner_faces.push(f as u32);
        } else {
            outer_faces.push(f as u32);
        }
    }

    let mut swapped = false;
    if !inner_faces.is_empty() && !outer_faces.is_empty() {
        let inner_dist = mean_vertex_distance(mesh, &inner_faces, &centroid);
        let outer_dist = mean_vertex_distance(mesh, &outer_faces, &centroid);
        if inner_dist > outer_dist {
            warn!(
                target: "cup_wear::pipeline",
                inner_dist = inner_dist,
                outer_dist = outer_dist,
                "Inner surface lies outside outer surface, swapping labels"
            );
            std::mem::swap(&mut inner_faces, &mut outer_faces);
            swapped = true;
        }
    }

    let inner = mesh.submesh(&inner_faces);
    let outer = mesh.submesh(&outer_faces);
    let axis = compute_axis(&inner);

    info!(
        target: "cup_wear::pipeline",
        inner_faces = inner_faces.len(),
        outer_faces = outer_faces.len(),
        candidates = candidate_count,
        axis = format!("({:.4}, {:.4}, {:.4})", axis.x, axis.y, axis.z),
        "Separated surfaces"
    );

    SurfaceSeparation {
        inner,
        outer,
        inner_faces,
        outer_faces,
        axis,
        candidate_count,
        relaxed,
        swapped,
    }
}

/// Largest group of flagged faces connected through shared vertices.
///
/// Ties go to the group containing the lowest face index. The result is
/// sorted ascending.
fn largest_vertex_connected_component(mesh: &Mesh, flagged: &[bool]) -> Vec<u32> {
    let mut vertex_faces: Vec<Vec<u32>> = vec![Vec::new(); mesh.vertex_count()];
    for (f, face) in mesh.faces.iter().enumerate() {
        if flagged[f] {
            for &v in face {
                vertex_faces[v as usize].push(f as u32);
            }
        }
    }

    let mut visited = vec![false; mesh.face_count()];
    let mut best: Vec<u32> = Vec::new();
    let mut queue = VecDeque::new();

    for start in 0..mesh.face_count() {
        if !flagged[start] || visited[start] {
            continue;
        }

        let mut component = Vec::new();
        visited[start] = true;
        queue.push_back(start as u32);

        while let Some(f) = queue.pop_front() {
            component.push(f);
            for &v in &mesh.faces[f as usize] {
                for &neighbor in &vertex_faces[v as usize] {
                    if !visited[neighbor as usize] {
                        visited[neighbor as usize] = true;
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        if component.len() > best.len() {
            best = component;
        }
    }

    best.sort_unstable();
    best
}

/// Mean distance from `centroid` of the distinct vertices used by `faces`.
fn mean_vertex_distance(mesh: &Mesh, faces: &[u32], centroid: &Point3<f64>) -> f64 {
    let mut seen = vec![false; mesh.vertex_count()];
    let mut sum = 0.0;
    let mut count = 0usize;
    for &f in faces {
        for &v in &mesh.faces[f as usize] {
            if !seen[v as usize] {
                seen[v as usize] = true;
                sum += (mesh.positions[v as usize] - centroid).norm();
                count += 1;
            }
        }
    }
    if count == 0 { 0.0 } else { sum / count as f64 }
}

/// Cup axis of a surface: the direction of least spread, oriented toward the pole.
///
/// The two dominant covariance eigenvectors come from power iteration with
/// deflation; the axis is their cross product. It is then oriented against
/// the mean face normal, since the normals of a concave cap face the
/// opening. If that signal is too weak, the axis points toward the side
/// holding the majority of vertices. An empty surface gives +Z.
pub fn compute_axis(surface: &Mesh) -> Vector3<f64> {
    if surface.positions.is_empty() {
        return Vector3::z();
    }

    let centroid = surface.centroid();
    let n = surface.vertex_count() as f64;
    let mut covariance = Matrix3::zeros();
    for p in &surface.positions {
        let d = p - centroid;
        covariance += d * d.transpose();
    }
    covariance /= n;

    let (lambda1, v1) = power_iteration(&covariance, None);
    let deflated = covariance - v1 * v1.transpose() * lambda1;
    let (_, v2_raw) = power_iteration(&deflated, Some(&v1));

    let v2 = (v2_raw - v1 * v1.dot(&v2_raw))
        .try_normalize(1e-12)
        .unwrap_or_else(|| any_orthogonal(&v1));
    let mut axis = v1.cross(&v2).try_normalize(1e-12).unwrap_or_else(Vector3::z);

    let mean_normal: Vector3<f64> = (0..surface.face_count())
        .map(|f| surface.face_normal(f))
        .sum::<Vector3<f64>>()
        / surface.face_count().max(1) as f64;
    let signal = mean_normal.dot(&axis);

    if signal.abs() >= 1e-6 {
        if signal > 0.0 {
            axis = -axis;
        }
    } else {
        let above = surface
            .positions
            .iter()
            .filter(|p| (*p - centroid).dot(&axis) > 0.0)
            .count();
        if above * 2 < surface.vertex_count() {
            axis = -axis;
        }
    }

    debug!(
        target: "cup_wear::pipeline",
        eigenvalue = lambda1,
        normal_signal = signal,
        "Computed cup axis"
    );

    axis
}

/// Dominant eigenpair of a symmetric positive semi-definite matrix.
///
/// The start vector is the matrix column with the largest norm, which is
/// non-zero unless the matrix is. A zero matrix yields an arbitrary unit
/// vector orthogonal to `avoid` (or +X).
fn power_iteration(m: &Matrix3<f64>, avoid: Option<&Vector3<f64>>) -> (f64, Vector3<f64>) {
    let fallback = || match avoid {
        Some(a) => any_orthogonal(a),
        None => Vector3::x(),
    };

    let start = (0..3)
        .map(|i| m.column(i).into_owned())
        .max_by(|a, b| a.norm_squared().total_cmp(&b.norm_squared()))
        .and_then(|c| c.try_normalize(1e-300));
    let Some(mut v) = start else {
        return (0.0, fallback());
    };

    for _ in 0..POWER_ITERATIONS {
        let Some(next) = (m * v).try_normalize(1e-300) else {
            return (0.0, fallback());
        };
        let converged = (next - v).norm() < POWER_TOLERANCE;
        v = next;
        if converged {
            break;
        }
    }

    ((m * v).dot(&v), v)
}

/// Some unit vector orthogonal to `v`.
pub(crate) fn any_orthogonal(v: &Vector3<f64>) -> Vector3<f64> {
    let abs = v.abs();
    let reference = if abs.x <= abs.y && abs.x <= abs.z {
        Vector3::x()
    } else if abs.y <= abs.z {
        Vector3::y()
    } else {
        Vector3::z()
    };
    v.cross(&reference).try_normalize(1e-15).unwrap_or_else(Vector3::x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{cup_shell, hemisphere_cap, uv_sphere};
    use approx::assert_relative_eq;

    #[test]
    fn test_cap_axis_points_to_pole() {
        let cap = hemisphere_cap(14.0, 0.8, 80.0);
        let axis = compute_axis(&cap);
        assert!(axis.z > 0.999, "axis {:?}", axis);
    }

    #[test]
    fn test_axis_of_flipped_cap() {
        let mut cap = hemisphere_cap(14.0, 0.8, 80.0);
        for p in &mut cap.positions {
            p.z = -p.z;
            p.x = -p.x;
        }
        let axis = compute_axis(&cap);
        assert!(axis.z < -0.999, "axis {:?}", axis);
    }

    #[test]
    fn test_empty_surface_axis_defaults_to_z() {
        assert_eq!(compute_axis(&Mesh::new()), Vector3::z());
    }

    #[test]
    fn test_single_cap_is_mostly_inner() {
        let cap = hemisphere_cap(14.0, 0.8, 90.0);
        let sep = separate_faces(&cap);

        assert!(!sep.relaxed);
        assert!(!sep.swapped);
        // The distance filter drops the outermost quarter of faces near the rim.
        let fraction = sep.inner_faces.len() as f64 / cap.face_count() as f64;
        assert!(fraction > 0.6 && fraction < 0.85, "inner fraction {}", fraction);
        assert_eq!(sep.inner_faces.len() + sep.outer_faces.len(), cap.face_count());
        assert!(sep.axis.z > 0.99);
    }

    #[test]
    fn test_shell_inner_surface_is_concave_cap() {
        let shell = cup_shell(14.0, 16.0, 0.8);
        let sep = separate_faces(&shell);

        assert!(!sep.inner.is_empty());
        let center = Point3::origin();
        for p in &sep.inner.positions {
            let r = (p - center).norm();
            assert!((r - 14.0).abs() < 1e-6, "inner vertex at radius {}", r);
        }
        assert!(sep.axis.z > 0.99);
    }

    #[test]
    fn test_full_sphere_has_no_inner_surface() {
        let sphere = uv_sphere(10.0, 24, 48);
        let sep = separate_faces(&sphere);
        assert!(sep.is_inner_empty());
        assert!(sep.relaxed);
        assert_eq!(sep.outer_faces.len(), sphere.face_count());
        assert_eq!(sep.axis, Vector3::z());
    }

    #[test]
    fn test_power_iteration_diagonal() {
        let m = Matrix3::from_diagonal(&Vector3::new(1.0, 5.0, 2.0));
        let (lambda, v) = power_iteration(&m, None);
        assert_relative_eq!(lambda, 5.0, epsilon = 1e-9);
        assert_relative_eq!(v.y.abs(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_any_orthogonal() {
        for v in [Vector3::x(), Vector3::y(), Vector3::z(), Vector3::new(1.0, 2.0, 3.0).normalize()] {
            let o = any_orthogonal(&v);
            assert_relative_eq!(o.norm(), 1.0, epsilon = 1e-12);
            assert!(o.dot(&v).abs() < 1e-12);
        }
    }
}
