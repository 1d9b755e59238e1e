//! Rim trimming.
//!
//! Scan data is least reliable at the open rim of the cup. Trimming removes
//! the lowest band of the surface measured along the cup axis.

use nalgebra::Vector3;
use tracing::debug;

use crate::types::Mesh;

/// Value at a percentile of `values`, linearly interpolated between order
/// statistics at rank `p / 100 * (n - 1)`.
///
/// `percent` is clamped to `[0, 100]`. Returns 0 for an empty slice.
pub fn percentile(values: &[f64], percent: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    percentile_sorted(&sorted, percent)
}

/// [`percentile`] on values that are already sorted ascending.
pub fn percentile_sorted(sorted: &[f64], percent: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = percent.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let t = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * t
}

/// Remove the lowest `percent` of the surface along `axis`.
///
/// Heights are measured along `axis` from the mesh centroid. Faces with any
/// vertex at or below the height at the given percentile are dropped; the
/// kept faces are rebuilt into a compact mesh. `percent` is clamped to
/// `[0, 100)`; zero returns an identical copy.
pub fn trim_rim(mesh: &Mesh, axis: &Vector3<f64>, percent: f64) -> Mesh {
    let percent = if percent.is_finite() {
        percent.clamp(0.0, 100.0 - f64::EPSILON * 100.0)
    } else {
        0.0
    };
    if percent <= 0.0 || mesh.positions.is_empty() {
        return mesh.clone();
    }

    let centroid = mesh.centroid();
    let heights: Vec<f64> = mesh
        .positions
        .iter()
        .map(|p| (p - centroid).dot(axis))
        .collect();
    let threshold = percentile(&heights, percent);

    let kept: Vec<u32> = mesh
        .faces
        .iter()
        .enumerate()
        .filter(|(_, face)| face.iter().all(|&v| heights[v as usize] > threshold))
        .map(|(f, _)| f as u32)
        .collect();

    debug!(
        target: "cup_wear::pipeline",
        percent = percent,
        threshold = threshold,
        kept_faces = kept.len(),
        removed_faces = mesh.face_count() - kept.len(),
        "Trimmed rim"
    );

    mesh.submesh(&kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::hemisphere_cap;
    use approx::assert_relative_eq;

    #[test]
    fn test_percentile_interpolates() {
        let values = [4.0, 1.0, 3.0, 2.0];
        assert_relative_eq!(percentile(&values, 0.0), 1.0);
        assert_relative_eq!(percentile(&values, 100.0), 4.0);
        assert_relative_eq!(percentile(&values, 50.0), 2.5);
        assert_relative_eq!(percentile(&values, 75.0), 3.25);
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert_relative_eq!(percentile(&[7.0], 30.0), 7.0);
    }

    #[test]
    fn test_zero_percent_is_identity() {
        let cap = hemisphere_cap(14.0, 1.0, 80.0);
        let trimmed = trim_rim(&cap, &Vector3::z(), 0.0);
        assert_eq!(trimmed.faces, cap.faces);
        assert_eq!(trimmed.positions, cap.positions);
    }

    #[test]
    fn test_trim_removes_rim_band() {
        let cap = hemisphere_cap(14.0, 0.5, 80.0);
        let trimmed = trim_rim(&cap, &Vector3::z(), 10.0);

        assert!(trimmed.face_count() < cap.face_count());
        let min_z_before = cap.positions.iter().map(|p| p.z).fold(f64::INFINITY, f64::min);
        let min_z_after = trimmed.positions.iter().map(|p| p.z).fold(f64::INFINITY, f64::min);
        assert!(min_z_after > min_z_before);

        // The pole survives.
        let max_z = trimmed.positions.iter().map(|p| p.z).fold(f64::NEG_INFINITY, f64::max);
        assert_relative_eq!(max_z, 14.0, epsilon = 1e-9);
    }

    #[test]
    fn test_trim_with_reversed_axis_removes_pole() {
        let cap = hemisphere_cap(14.0, 0.5, 80.0);
        let trimmed = trim_rim(&cap, &(-Vector3::z()), 10.0);
        let max_z = trimmed.positions.iter().map(|p| p.z).fold(f64::NEG_INFINITY, f64::max);
        assert!(max_z < 14.0);
    }

    #[test]
    fn test_trim_is_monotone() {
        let cap = hemisphere_cap(14.0, 0.7, 80.0);
        let mut previous = cap.face_count();
        for percent in [2.0, 5.0, 7.0, 12.0, 20.0] {
            let count = trim_rim(&cap, &Vector3::z(), percent).face_count();
            assert!(count <= previous);
            previous = count;
        }
    }

    #[test]
    fn test_trim_clamps_percent() {
        let cap = hemisphere_cap(14.0, 1.0, 80.0);
        let all_gone = trim_rim(&cap, &Vector3::z(), 250.0);
        assert_eq!(all_gone.face_count(), 0);
        let negative = trim_rim(&cap, &Vector3::z(), -5.0);
        assert_eq!(negative.face_count(), cap.face_count());
    }
}
