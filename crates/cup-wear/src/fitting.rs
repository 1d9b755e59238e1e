//! Least-squares reference surfaces: sphere (plain and robust) and ellipsoid.
//!
//! The sphere fit is algebraic: each point gives one row of
//! `[x y z 1] . [a b c d]^T = x^2 + y^2 + z^2`, solved through the 4x4
//! normal equations. The robust variant re-weights rows with Tukey's
//! bisquare (IRLS). The ellipsoid fit solves a general 9-coefficient
//! quadric with a minimum-norm solve and reads the semi-axes off the
//! eigen-decomposition of its shape matrix.

use nalgebra::{Matrix3, Matrix4, Point3, SMatrix, SVector, Vector3, Vector4};
use tracing::{debug, info, warn};

use crate::error::{WearError, WearResult};

/// Reciprocal condition number below which a system is treated as singular.
const SINGULAR_RCOND: f64 = 1e-14;

/// IRLS weights at or below this value are excluded from the error metric.
const INLIER_WEIGHT: f64 = 0.01;

/// Tukey cutoff as a multiple of the current RMS error.
const TUKEY_SCALE: f64 = 3.0;

/// Fitted reference sphere.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct SphereFit {
    /// Sphere center.
    pub center: Point3<f64>,
    /// Sphere radius (mm).
    pub radius: f64,
    /// RMS of the radial residuals (mm).
    pub rms_error: f64,
    /// Largest absolute radial residual (mm).
    pub max_error: f64,
    /// Per-point signed residual: distance to center minus radius (mm).
    pub residuals: Vec<f64>,
}

impl SphereFit {
    /// Signed radial distance of a point from the sphere surface (mm).
    #[inline]
    pub fn signed_distance(&self, p: &Point3<f64>) -> f64 {
        (p - self.center).norm() - self.radius
    }

    /// Radially project a point onto the sphere surface.
    pub fn project(&self, p: &Point3<f64>) -> Point3<f64> {
        let d = p - self.center;
        match d.try_normalize(1e-15) {
            Some(dir) => self.center + dir * self.radius,
            None => *p,
        }
    }
}

/// Result of the iteratively re-weighted sphere fit.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct RobustSphereFit {
    /// Final fit. `rms_error` and `max_error` cover only points whose
    /// final weight exceeds 0.01; `residuals` cover every point.
    pub fit: SphereFit,
    /// Final Tukey weight per point, in [0, 1].
    pub weights: Vec<f64>,
    /// Number of re-weighting iterations completed.
    pub iterations: usize,
    /// True if a weighted solve was singular and the loop stopped early.
    pub stopped_early: bool,
}

impl RobustSphereFit {
    /// Number of points with a weight above the inlier cutoff.
    pub fn inlier_count(&self) -> usize {
        self.weights.iter().filter(|&&w| w > INLIER_WEIGHT).count()
    }
}

/// Shape class of a fitted ellipsoid, from its sphericity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(rename_all = "snake_case"))]
pub enum ShapeClass {
    /// Sphericity at least 98%.
    Sphere,
    /// Sphericity at least 90%.
    SlightEllipsoid,
    /// Sphericity below 90%.
    SignificantEllipsoid,
}

impl ShapeClass {
    /// Classify a sphericity percentage.
    pub fn from_sphericity(percent: f64) -> Self {
        if percent >= 98.0 {
            ShapeClass::Sphere
        } else if percent >= 90.0 {
            ShapeClass::SlightEllipsoid
        } else {
            ShapeClass::SignificantEllipsoid
        }
    }
}

impl std::fmt::Display for ShapeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShapeClass::Sphere => write!(f, "sphere"),
            ShapeClass::SlightEllipsoid => write!(f, "slight ellipsoid"),
            ShapeClass::SignificantEllipsoid => write!(f, "significant ellipsoid"),
        }
    }
}

/// Fitted general ellipsoid.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
pub struct EllipsoidFit {
    /// Ellipsoid center.
    pub center: Point3<f64>,
    /// Semi-axis lengths, ascending (mm).
    pub semi_axes: Vector3<f64>,
    /// Orthonormal basis; column `i` is the direction of `semi_axes[i]`.
    pub rotation: Matrix3<f64>,
    /// `100 * min / max` semi-axis.
    pub sphericity: f64,
    /// Shape class derived from sphericity.
    pub shape: ShapeClass,
    /// Quadric coefficients `A..I` in input coordinates.
    pub coefficients: [f64; 9],
    /// RMS of `quadric(p) - 1` over the input points, in input coordinates.
    pub rms_error: f64,
}

/// Fit a sphere to points by algebraic least squares.
///
/// A singular normal matrix falls back to a pseudo-inverse solve.
///
/// # Errors
///
/// Returns [`WearError::InvalidMesh`] with fewer than 4 points.
pub fn fit_sphere(points: &[Point3<f64>]) -> WearResult<SphereFit> {
    if points.len() < 4 {
        return Err(WearError::invalid_mesh(format!(
            "sphere fit needs at least 4 points, got {}",
            points.len()
        )));
    }

    let (ata, atb) = sphere_normal_equations(points, None);
    let solution = match solve_normal_equations(&ata, &atb, "sphere fit") {
        Ok(p) => p,
        Err(e) => {
            warn!(target: "cup_wear::fit", error = %e, "Falling back to pseudo-inverse");
            pseudo_inverse_solve(&ata, &atb)
        }
    };

    let (center, radius) = sphere_from_solution(&solution);
    let residuals = sphere_residuals(points, &center, radius);
    let (rms_error, max_error) = error_metrics(&residuals, None);

    debug!(
        target: "cup_wear::fit",
        radius = radius,
        rms_error = rms_error,
        "Sphere fit"
    );

    Ok(SphereFit {
        center,
        radius,
        rms_error,
        max_error,
        residuals,
    })
}

/// Fit a sphere with Tukey-bisquare IRLS.
///
/// Each iteration weights points by `(1 - u^2)^2` with
/// `u = |residual| / (3 * max(rms, 1e-6))` (zero beyond the cutoff) and
/// re-solves. The error metric only counts points with weight above 0.01.
/// If a weighted solve is singular the previous iterate is kept and the
/// loop stops.
pub fn fit_sphere_robust(points: &[Point3<f64>], iterations: usize) -> WearResult<RobustSphereFit> {
    let mut fit = fit_sphere(points)?;
    let mut weights = vec![1.0; points.len()];
    let mut completed = 0;
    let mut stopped_early = false;

    for iteration in 0..iterations {
        let cutoff = TUKEY_SCALE * fit.rms_error.max(1e-6);
        let next_weights: Vec<f64> = fit
            .residuals
            .iter()
            .map(|r| tukey_bisquare(*r, cutoff))
            .collect();

        let (ata, atb) = sphere_normal_equations(points, Some(&next_weights));
        let solution = match solve_normal_equations(&ata, &atb, "weighted sphere fit") {
            Ok(p) => p,
            Err(e) => {
                warn!(
                    target: "cup_wear::fit",
                    iteration = iteration,
                    error = %e,
                    "Keeping previous IRLS iterate"
                );
                stopped_early = true;
                break;
            }
        };

        let (center, radius) = sphere_from_solution(&solution);
        let residuals = sphere_residuals(points, &center, radius);
        let (rms_error, max_error) = error_metrics(&residuals, Some(&next_weights));

        fit = SphereFit {
            center,
            radius,
            rms_error,
            max_error,
            residuals,
        };
        weights = next_weights;
        completed += 1;
    }

    let result = RobustSphereFit {
        fit,
        weights,
        iterations: completed,
        stopped_early,
    };

    info!(
        target: "cup_wear::fit",
        radius = format!("{:.4}", result.fit.radius),
        rms_um = format!("{:.3}", result.fit.rms_error * 1000.0),
        inliers = result.inlier_count(),
        iterations = completed,
        "Robust sphere fit"
    );

    Ok(result)
}

/// Fit a general ellipsoid `Ax^2+By^2+Cz^2+2Dxy+2Exz+2Fyz+2Gx+2Hy+2Iz = 1`.
///
/// # Errors
///
/// Returns [`WearError::InvalidMesh`] with fewer than 9 points.
pub fn fit_ellipsoid(points: &[Point3<f64>]) -> WearResult<EllipsoidFit> {
    if points.len() < 9 {
        return Err(WearError::invalid_mesh(format!(
            "ellipsoid fit needs at least 9 points, got {}",
            points.len()
        )));
    }

    // Pure scaling keeps the constant-1 right-hand side, so the scaled
    // problem has the same minimizer as the raw one. A shift would not.
    let n = points.len() as f64;
    let scale = points
        .iter()
        .map(|p| p.coords.norm())
        .fold(0.0_f64, f64::max)
        .max(1e-12);

    let mut ata = SMatrix::<f64, 9, 9>::zeros();
    let mut atb = SVector::<f64, 9>::zeros();
    for p in points {
        let row = quadric_row(&(p.coords / scale));
        ata += row * row.transpose();
        atb += row;
    }

    // Minimum-norm least squares: pinv(A^T A) A^T b.
    let scaled = ata
        .svd(true, true)
        .solve(&atb, 1e-15)
        .unwrap_or_else(|_| SVector::<f64, 9>::zeros());
    let coefficients = unscale_quadric(&scaled, scale);
    let coeffs = SVector::<f64, 9>::from_column_slice(&coefficients);

    let q = Matrix3::new(
        coeffs[0], coeffs[3], coeffs[4], //
        coeffs[3], coeffs[1], coeffs[5], //
        coeffs[4], coeffs[5], coeffs[2],
    );
    let g = Vector3::new(coeffs[6], coeffs[7], coeffs[8]);

    let q_inv = match q.try_inverse() {
        Some(inv) => inv,
        None => {
            warn!(target: "cup_wear::fit", "Ellipsoid shape matrix singular, using pseudo-inverse");
            q.pseudo_inverse(1e-15).unwrap_or_else(|_| Matrix3::zeros())
        }
    };

    let center = -(q_inv * g);
    let scale_factor = 1.0 + g.dot(&(q_inv * g));
    let normalized = if scale_factor.abs() > 1e-300 {
        q / scale_factor
    } else {
        q
    };

    let eigen = normalized.symmetric_eigen();
    let mut axes: Vec<(f64, Vector3<f64>)> = (0..3)
        .map(|i| {
            let lambda = eigen.eigenvalues[i].abs();
            let axis = if lambda > 0.0 {
                1.0 / lambda.sqrt()
            } else {
                f64::INFINITY
            };
            (axis, eigen.eigenvectors.column(i).into_owned())
        })
        .collect();
    axes.sort_by(|a, b| a.0.total_cmp(&b.0));

    let semi_axes = Vector3::new(axes[0].0, axes[1].0, axes[2].0);
    let rotation = Matrix3::from_columns(&[axes[0].1, axes[1].1, axes[2].1]);
    let sphericity = if semi_axes[2].is_finite() && semi_axes[2] > 0.0 {
        100.0 * semi_axes[0] / semi_axes[2]
    } else {
        0.0
    };

    let sum_sq: f64 = points
        .iter()
        .map(|p| {
            let r = quadric_row(&p.coords).dot(&coeffs) - 1.0;
            r * r
        })
        .sum();
    let rms_error = (sum_sq / n).sqrt();

    let fit = EllipsoidFit {
        center: Point3::from(center),
        semi_axes,
        rotation,
        sphericity,
        shape: ShapeClass::from_sphericity(sphericity),
        coefficients,
        rms_error,
    };

    info!(
        target: "cup_wear::fit",
        axes = format!("{:.4} / {:.4} / {:.4}", semi_axes[0], semi_axes[1], semi_axes[2]),
        sphericity = format!("{:.3}", sphericity),
        shape = %fit.shape,
        "Ellipsoid fit"
    );

    Ok(fit)
}

/// Tukey bisquare weight.
#[inline]
fn tukey_bisquare(residual: f64, cutoff: f64) -> f64 {
    let u = residual.abs() / cutoff;
    if u >= 1.0 {
        0.0
    } else {
        let t = 1.0 - u * u;
        t * t
    }
}

/// Coefficients solved on `p / scale`, expressed for `p`.
fn unscale_quadric(scaled: &SVector<f64, 9>, scale: f64) -> [f64; 9] {
    let s2 = scale * scale;
    let mut raw = [0.0; 9];
    for (i, c) in scaled.iter().enumerate() {
        raw[i] = if i < 6 { c / s2 } else { c / scale };
    }
    raw
}

/// Design row `[x^2, y^2, z^2, 2xy, 2xz, 2yz, 2x, 2y, 2z]`.
#[inline]
fn quadric_row(p: &Vector3<f64>) -> SVector<f64, 9> {
    SVector::<f64, 9>::from_column_slice(&[
        p.x * p.x,
        p.y * p.y,
        p.z * p.z,
        2.0 * p.x * p.y,
        2.0 * p.x * p.z,
        2.0 * p.y * p.z,
        2.0 * p.x,
        2.0 * p.y,
        2.0 * p.z,
    ])
}

fn sphere_normal_equations(
    points: &[Point3<f64>],
    weights: Option<&[f64]>,
) -> (Matrix4<f64>, Vector4<f64>) {
    let mut ata = Matrix4::zeros();
    let mut atb = Vector4::zeros();
    for (i, p) in points.iter().enumerate() {
        let w = weights.map_or(1.0, |w| w[i]);
        if w == 0.0 {
            continue;
        }
        let row = Vector4::new(p.x, p.y, p.z, 1.0);
        let rhs = p.coords.norm_squared();
        ata += row * row.transpose() * w;
        atb += row * (rhs * w);
    }
    (ata, atb)
}

/// Solve a 4x4 normal system, refusing ill-conditioned matrices.
fn solve_normal_equations(
    ata: &Matrix4<f64>,
    atb: &Vector4<f64>,
    operation: &'static str,
) -> WearResult<Vector4<f64>> {
    let svd = ata.svd(true, true);
    let max_sv = svd.singular_values.max();
    let min_sv = svd.singular_values.min();
    if !(max_sv > 0.0) || min_sv / max_sv < SINGULAR_RCOND {
        return Err(WearError::singular(operation));
    }

    ata.cholesky()
        .map(|c| c.solve(atb))
        .or_else(|| ata.lu().solve(atb))
        .ok_or_else(|| WearError::singular(operation))
}

fn pseudo_inverse_solve(ata: &Matrix4<f64>, atb: &Vector4<f64>) -> Vector4<f64> {
    ata.svd(true, true)
        .solve(atb, 1e-12)
        .unwrap_or_else(|_| Vector4::zeros())
}

fn sphere_from_solution(p: &Vector4<f64>) -> (Point3<f64>, f64) {
    let center = Point3::new(p[0] / 2.0, p[1] / 2.0, p[2] / 2.0);
    let radius = (p[3] + center.coords.norm_squared()).max(0.0).sqrt();
    (center, radius)
}

fn sphere_residuals(points: &[Point3<f64>], center: &Point3<f64>, radius: f64) -> Vec<f64> {
    points.iter().map(|p| (p - center).norm() - radius).collect()
}

/// RMS and max-abs residual, optionally restricted to points with weight above 0.01.
fn error_metrics(residuals: &[f64], weights: Option<&[f64]>) -> (f64, f64) {
    let mut sum_sq = 0.0;
    let mut max_abs: f64 = 0.0;
    let mut count = 0usize;
    for (i, r) in residuals.iter().enumerate() {
        if weights.is_some_and(|w| w[i] <= INLIER_WEIGHT) {
            continue;
        }
        sum_sq += r * r;
        max_abs = max_abs.max(r.abs());
        count += 1;
    }
    if count == 0 {
        return (0.0, 0.0);
    }
    ((sum_sq / count as f64).sqrt(), max_abs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Points on a sphere from a golden-angle spiral.
    fn sphere_points(center: Point3<f64>, radius: f64, n: usize, hemisphere: bool) -> Vec<Point3<f64>> {
        let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
        (0..n)
            .map(|i| {
                let t = (i as f64 + 0.5) / n as f64;
                let z = if hemisphere { t } else { 1.0 - 2.0 * t };
                let r = (1.0 - z * z).sqrt();
                let phi = golden * i as f64;
                center + Vector3::new(r * phi.cos(), r * phi.sin(), z) * radius
            })
            .collect()
    }

    #[test]
    fn test_fit_sphere_exact() {
        let center = Point3::new(1.0, -2.0, 3.5);
        let points = sphere_points(center, 14.0, 500, true);
        let fit = fit_sphere(&points).unwrap();

        assert_relative_eq!(fit.center, center, epsilon = 1e-8);
        assert_relative_eq!(fit.radius, 14.0, epsilon = 1e-8);
        assert!(fit.rms_error < 1e-9);
        assert!(fit.max_error < 1e-8);
        assert_eq!(fit.residuals.len(), points.len());
    }

    #[test]
    fn test_fit_sphere_too_few_points() {
        let points = vec![Point3::origin(); 3];
        assert!(fit_sphere(&points).is_err());
    }

    #[test]
    fn test_fit_sphere_degenerate_does_not_fail() {
        // Coplanar points make the normal matrix singular.
        let points: Vec<Point3<f64>> = (0..20)
            .map(|i| {
                let a = i as f64 * 0.3;
                Point3::new(a.cos() * 5.0, a.sin() * 5.0, 0.0)
            })
            .collect();
        let fit = fit_sphere(&points).unwrap();
        assert!(fit.radius.is_finite());
    }

    #[test]
    fn test_robust_fit_rejects_outliers() {
        let center = Point3::new(0.5, 0.25, -1.0);
        let radius = 14.0;
        let mut points = sphere_points(center, radius, 1000, true);
        let mut outliers = Vec::new();
        for i in (0..points.len()).step_by(20) {
            let dir = (points[i] - center).normalize();
            points[i] += dir * 5.0;
            outliers.push(i);
        }

        let plain = fit_sphere(&points).unwrap();
        let robust = fit_sphere_robust(&points, 5).unwrap();

        let plain_err = (plain.center - center).norm() + (plain.radius - radius).abs();
        let robust_err = (robust.fit.center - center).norm() + (robust.fit.radius - radius).abs();
        assert!(
            robust_err < plain_err,
            "robust error {} should beat plain error {}",
            robust_err,
            plain_err
        );
        assert_relative_eq!(robust.fit.radius, radius, epsilon = 1e-6);

        for &i in &outliers {
            assert!(robust.weights[i] < 1e-6, "outlier {} kept weight {}", i, robust.weights[i]);
        }
        assert_eq!(robust.inlier_count(), points.len() - outliers.len());
        assert!(robust.fit.rms_error < 1e-6);
    }

    #[test]
    fn test_robust_fit_zero_iterations_is_plain_fit() {
        let points = sphere_points(Point3::origin(), 10.0, 200, false);
        let robust = fit_sphere_robust(&points, 0).unwrap();
        let plain = fit_sphere(&points).unwrap();
        assert_eq!(robust.iterations, 0);
        assert_relative_eq!(robust.fit.radius, plain.radius, epsilon = 1e-12);
        assert!(robust.weights.iter().all(|&w| w == 1.0));
    }

    #[test]
    fn test_tukey_weight() {
        assert_relative_eq!(tukey_bisquare(0.0, 1.0), 1.0);
        assert_relative_eq!(tukey_bisquare(0.5, 1.0), 0.5625);
        assert_eq!(tukey_bisquare(1.0, 1.0), 0.0);
        assert_eq!(tukey_bisquare(-3.0, 1.0), 0.0);
    }

    #[test]
    fn test_fit_ellipsoid_on_sphere() {
        let points = sphere_points(Point3::new(1.0, 2.0, 3.0), 14.0, 800, true);
        let fit = fit_ellipsoid(&points).unwrap();

        assert!(fit.sphericity >= 99.9, "sphericity {}", fit.sphericity);
        assert_eq!(fit.shape, ShapeClass::Sphere);
        assert_relative_eq!(fit.center, Point3::new(1.0, 2.0, 3.0), epsilon = 1e-5);
        assert_relative_eq!(fit.semi_axes[0], 14.0, epsilon = 1e-5);
        assert!(fit.rms_error < 1e-8);
    }

    #[test]
    fn test_fit_ellipsoid_stretched() {
        let points: Vec<Point3<f64>> = sphere_points(Point3::origin(), 1.0, 800, false)
            .into_iter()
            .map(|p| Point3::new(p.x * 10.0, p.y * 12.0, p.z * 15.0))
            .collect();
        let fit = fit_ellipsoid(&points).unwrap();

        assert_relative_eq!(fit.semi_axes[0], 10.0, epsilon = 1e-5);
        assert_relative_eq!(fit.semi_axes[1], 12.0, epsilon = 1e-5);
        assert_relative_eq!(fit.semi_axes[2], 15.0, epsilon = 1e-5);
        assert_relative_eq!(fit.sphericity, 100.0 * 10.0 / 15.0, epsilon = 1e-3);
        assert_eq!(fit.shape, ShapeClass::SignificantEllipsoid);

        // Shortest axis lies along x.
        assert_relative_eq!(fit.rotation.column(0).x.abs(), 1.0, epsilon = 1e-6);
        let rtr = fit.rotation.transpose() * fit.rotation;
        assert_relative_eq!(rtr, Matrix3::identity(), epsilon = 1e-9);
    }

    fn quadric_rms(points: &[Point3<f64>], c: &[f64; 9]) -> f64 {
        let sum_sq: f64 = points
            .iter()
            .map(|p| {
                let (x, y, z) = (p.x, p.y, p.z);
                let q = c[0] * x * x
                    + c[1] * y * y
                    + c[2] * z * z
                    + 2.0 * (c[3] * x * y + c[4] * x * z + c[5] * y * z)
                    + 2.0 * (c[6] * x + c[7] * y + c[8] * z);
                (q - 1.0) * (q - 1.0)
            })
            .sum();
        (sum_sq / points.len() as f64).sqrt()
    }

    #[test]
    fn test_fit_ellipsoid_residual_in_input_coordinates() {
        let center = Point3::new(3.0, -2.0, 5.0);
        let radius = 14.0;
        let points: Vec<Point3<f64>> = sphere_points(center, radius, 600, true)
            .into_iter()
            .enumerate()
            .map(|(i, p)| center + (p - center) * (1.0 + 0.002 * (i as f64 * 0.7).sin()))
            .collect();
        let fit = fit_ellipsoid(&points).unwrap();

        let by_hand = quadric_rms(&points, &fit.coefficients);
        assert!(by_hand > 1e-6, "perturbation should leave a residual, got {}", by_hand);
        assert_relative_eq!(fit.rms_error, by_hand, max_relative = 1e-9);

        // The least-squares solution cannot lose to the unperturbed sphere.
        let k = radius * radius - center.coords.norm_squared();
        let ideal = [
            1.0 / k,
            1.0 / k,
            1.0 / k,
            0.0,
            0.0,
            0.0,
            -center.x / k,
            -center.y / k,
            -center.z / k,
        ];
        assert!(fit.rms_error <= quadric_rms(&points, &ideal) + 1e-12);
        assert_relative_eq!(fit.center, center, epsilon = 0.05);
    }

    #[test]
    fn test_shape_class_thresholds() {
        assert_eq!(ShapeClass::from_sphericity(99.0), ShapeClass::Sphere);
        assert_eq!(ShapeClass::from_sphericity(98.0), ShapeClass::Sphere);
        assert_eq!(ShapeClass::from_sphericity(95.0), ShapeClass::SlightEllipsoid);
        assert_eq!(ShapeClass::from_sphericity(89.9), ShapeClass::SignificantEllipsoid);
    }

    #[test]
    fn test_project_onto_sphere() {
        let fit = SphereFit {
            center: Point3::origin(),
            radius: 2.0,
            rms_error: 0.0,
            max_error: 0.0,
            residuals: Vec::new(),
        };
        let p = fit.project(&Point3::new(0.0, 0.0, 5.0));
        assert_relative_eq!(p, Point3::new(0.0, 0.0, 2.0), epsilon = 1e-12);
        assert_relative_eq!(fit.signed_distance(&Point3::new(3.0, 0.0, 0.0)), 1.0);
    }
}
