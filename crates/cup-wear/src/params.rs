//! Analysis parameters.
//!
//! [`AnalysisParams`] collects every tunable of a run. Out-of-range values
//! are clamped by [`AnalysisParams::validated`] (with a warning) or rejected
//! by [`AnalysisParams::validate`].
//!
//! With the `config` feature the parameters can be loaded from and saved to
//! TOML or JSON. Missing keys take their defaults:
//!
//! ```toml
//! geodesic_count = 180
//! rim_trim_percent = 5.0
//! threshold_microns = 2.0
//! ```

use std::ops::RangeInclusive;

use tracing::warn;

use crate::error::{WearError, WearResult};

const GEODESIC_COUNT: RangeInclusive<usize> = 36..=720;
const RIM_TRIM_PERCENT: RangeInclusive<f64> = 0.0..=20.0;
const THRESHOLD_MICRONS: RangeInclusive<f64> = 0.1..=10.0;
const DENSITY_G_CM3: RangeInclusive<f64> = 0.8..=1.1;
const DBSCAN_EPS_MM: RangeInclusive<f64> = 0.01..=10.0;
const DBSCAN_MIN_POINTS: RangeInclusive<usize> = 1..=100;
const ROBUST_ITERATIONS: RangeInclusive<usize> = 0..=50;
const MAX_POINTS_PER_MERIDIAN: RangeInclusive<usize> = 2..=10_000;

/// Parameters for one wear analysis.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(default))]
pub struct AnalysisParams {
    /// Number of meridians (36–720).
    pub geodesic_count: usize,

    /// Percentage of the surface removed at the rim (0–20).
    pub rim_trim_percent: f64,

    /// Deviation threshold for anomalies and volumes, in µm (0.1–10).
    pub threshold_microns: f64,

    /// Material density in g/cm³ (0.8–1.1). The default is UHMWPE.
    pub density_g_cm3: f64,

    /// DBSCAN neighbourhood radius in mm.
    pub dbscan_eps_mm: f64,

    /// DBSCAN core-point threshold, the point itself included.
    pub dbscan_min_points: usize,

    /// IRLS iterations of the robust sphere fit.
    pub robust_iterations: usize,

    /// Sample cap per meridian, the pole included.
    pub max_points_per_meridian: usize,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            geodesic_count: 360,
            rim_trim_percent: 7.0,
            threshold_microns: 1.0,
            density_g_cm3: 0.935,
            dbscan_eps_mm: 0.5,
            dbscan_min_points: 3,
            robust_iterations: 5,
            max_points_per_meridian: 500,
        }
    }
}

impl AnalysisParams {
    /// Create parameters with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Coarse preset for interactive preview (72 meridians).
    pub fn quick() -> Self {
        Self {
            geodesic_count: 72,
            ..Self::default()
        }
    }

    /// Fine preset: 720 meridians and a 0.5 µm threshold.
    pub fn high_resolution() -> Self {
        Self {
            geodesic_count: 720,
            threshold_microns: 0.5,
            ..Self::default()
        }
    }

    /// Set the number of meridians.
    pub fn with_geodesic_count(mut self, count: usize) -> Self {
        self.geodesic_count = count;
        self
    }

    /// Set the rim trim percentage.
    pub fn with_rim_trim_percent(mut self, percent: f64) -> Self {
        self.rim_trim_percent = percent;
        self
    }

    /// Set the deviation threshold in µm.
    pub fn with_threshold_microns(mut self, threshold: f64) -> Self {
        self.threshold_microns = threshold;
        self
    }

    /// Set the material density in g/cm³.
    pub fn with_density(mut self, density: f64) -> Self {
        self.density_g_cm3 = density;
        self
    }

    /// Set the DBSCAN radius and core-point threshold.
    pub fn with_dbscan(mut self, eps_mm: f64, min_points: usize) -> Self {
        self.dbscan_eps_mm = eps_mm;
        self.dbscan_min_points = min_points;
        self
    }

    /// Set the IRLS iteration count.
    pub fn with_robust_iterations(mut self, iterations: usize) -> Self {
        self.robust_iterations = iterations;
        self
    }

    /// Set the per-meridian sample cap.
    pub fn with_max_points_per_meridian(mut self, max_points: usize) -> Self {
        self.max_points_per_meridian = max_points;
        self
    }

    /// Clamp every field into its documented range.
    ///
    /// Each adjustment is logged at WARN. Non-finite floats fall back to the
    /// default value.
    pub fn validated(self) -> Self {
        let defaults = Self::default();
        Self {
            geodesic_count: clamp_count("geodesic_count", self.geodesic_count, GEODESIC_COUNT),
            rim_trim_percent: clamp_float(
                "rim_trim_percent",
                self.rim_trim_percent,
                defaults.rim_trim_percent,
                RIM_TRIM_PERCENT,
            ),
            threshold_microns: clamp_float(
                "threshold_microns",
                self.threshold_microns,
                defaults.threshold_microns,
                THRESHOLD_MICRONS,
            ),
            density_g_cm3: clamp_float(
                "density_g_cm3",
                self.density_g_cm3,
                defaults.density_g_cm3,
                DENSITY_G_CM3,
            ),
            dbscan_eps_mm: clamp_float(
                "dbscan_eps_mm",
                self.dbscan_eps_mm,
                defaults.dbscan_eps_mm,
                DBSCAN_EPS_MM,
            ),
            dbscan_min_points: clamp_count(
                "dbscan_min_points",
                self.dbscan_min_points,
                DBSCAN_MIN_POINTS,
            ),
            robust_iterations: clamp_count(
                "robust_iterations",
                self.robust_iterations,
                ROBUST_ITERATIONS,
            ),
            max_points_per_meridian: clamp_count(
                "max_points_per_meridian",
                self.max_points_per_meridian,
                MAX_POINTS_PER_MERIDIAN,
            ),
        }
    }

    /// Check every field against its documented range.
    ///
    /// # Errors
    ///
    /// Returns [`WearError::InvalidParameter`] for the first field that is
    /// non-finite or out of range.
    pub fn validate(&self) -> WearResult<()> {
        check_count("geodesic_count", self.geodesic_count, GEODESIC_COUNT)?;
        check_float("rim_trim_percent", self.rim_trim_percent, RIM_TRIM_PERCENT)?;
        check_float("threshold_microns", self.threshold_microns, THRESHOLD_MICRONS)?;
        check_float("density_g_cm3", self.density_g_cm3, DENSITY_G_CM3)?;
        check_float("dbscan_eps_mm", self.dbscan_eps_mm, DBSCAN_EPS_MM)?;
        check_count("dbscan_min_points", self.dbscan_min_points, DBSCAN_MIN_POINTS)?;
        check_count("robust_iterations", self.robust_iterations, ROBUST_ITERATIONS)?;
        check_count(
            "max_points_per_meridian",
            self.max_points_per_meridian,
            MAX_POINTS_PER_MERIDIAN,
        )
    }
}

#[cfg(feature = "config")]
impl AnalysisParams {
    /// Load parameters from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`WearError::Config`] if the TOML is invalid or doesn't match the schema.
    pub fn from_toml(toml_str: &str) -> WearResult<Self> {
        toml::from_str(toml_str).map_err(|e| WearError::config(e.to_string()))
    }

    /// Load parameters from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`WearError::Config`] if the file cannot be read or parsed.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> WearResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| WearError::config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&contents)
    }

    /// Serialize parameters to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`WearError::Config`] if serialization fails.
    pub fn to_toml(&self) -> WearResult<String> {
        toml::to_string_pretty(self).map_err(|e| WearError::config(e.to_string()))
    }

    /// Load parameters from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`WearError::Config`] if the JSON is invalid.
    pub fn from_json(json_str: &str) -> WearResult<Self> {
        serde_json::from_str(json_str).map_err(|e| WearError::config(e.to_string()))
    }

    /// Serialize parameters to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`WearError::Config`] if serialization fails.
    pub fn to_json(&self) -> WearResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| WearError::config(e.to_string()))
    }
}

fn clamp_count(name: &'static str, value: usize, range: RangeInclusive<usize>) -> usize {
    let clamped = value.clamp(*range.start(), *range.end());
    if clamped != value {
        warn!(
            target: "cup_wear::pipeline",
            parameter = name,
            value = value,
            clamped = clamped,
            "Parameter out of range, clamped"
        );
    }
    clamped
}

fn clamp_float(name: &'static str, value: f64, default: f64, range: RangeInclusive<f64>) -> f64 {
    if !value.is_finite() {
        warn!(
            target: "cup_wear::pipeline",
            parameter = name,
            value = value,
            default = default,
            "Parameter not finite, using default"
        );
        return default;
    }
    let clamped = value.clamp(*range.start(), *range.end());
    if clamped != value {
        warn!(
            target: "cup_wear::pipeline",
            parameter = name,
            value = value,
            clamped = clamped,
            "Parameter out of range, clamped"
        );
    }
    clamped
}

fn check_count(name: &'static str, value: usize, range: RangeInclusive<usize>) -> WearResult<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(WearError::invalid_parameter(name, value as f64, "outside the documented range"))
    }
}

fn check_float(name: &'static str, value: f64, range: RangeInclusive<f64>) -> WearResult<()> {
    if !value.is_finite() {
        Err(WearError::invalid_parameter(name, value, "must be finite"))
    } else if !range.contains(&value) {
        Err(WearError::invalid_parameter(name, value, "outside the documented range"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let p = AnalysisParams::default();
        assert_eq!(p.geodesic_count, 360);
        assert_eq!(p.rim_trim_percent, 7.0);
        assert_eq!(p.threshold_microns, 1.0);
        assert_eq!(p.density_g_cm3, 0.935);
        assert_eq!(p.dbscan_eps_mm, 0.5);
        assert_eq!(p.dbscan_min_points, 3);
        assert_eq!(p.robust_iterations, 5);
        assert_eq!(p.max_points_per_meridian, 500);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        assert_eq!(AnalysisParams::quick().geodesic_count, 72);
        let hi = AnalysisParams::high_resolution();
        assert_eq!(hi.geodesic_count, 720);
        assert_eq!(hi.threshold_microns, 0.5);
        assert!(AnalysisParams::quick().validate().is_ok());
        assert!(hi.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let p = AnalysisParams::new()
            .with_geodesic_count(90)
            .with_rim_trim_percent(3.0)
            .with_threshold_microns(2.0)
            .with_density(1.0)
            .with_dbscan(0.8, 4)
            .with_robust_iterations(2)
            .with_max_points_per_meridian(100);
        assert_eq!(p.geodesic_count, 90);
        assert_eq!(p.dbscan_min_points, 4);
        assert_eq!(p.max_points_per_meridian, 100);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_validated_clamps() {
        let p = AnalysisParams::new()
            .with_geodesic_count(5000)
            .with_rim_trim_percent(-3.0)
            .with_threshold_microns(f64::NAN)
            .with_density(2.0)
            .with_max_points_per_meridian(0)
            .validated();
        assert_eq!(p.geodesic_count, 720);
        assert_eq!(p.rim_trim_percent, 0.0);
        assert_eq!(p.threshold_microns, 1.0);
        assert_eq!(p.density_g_cm3, 1.1);
        assert_eq!(p.max_points_per_meridian, 2);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        let err = AnalysisParams::new().with_geodesic_count(0).validate().unwrap_err();
        assert!(matches!(
            err,
            WearError::InvalidParameter {
                name: "geodesic_count",
                ..
            }
        ));

        let err = AnalysisParams::new()
            .with_density(f64::INFINITY)
            .validate()
            .unwrap_err();
        assert!(format!("{}", err).contains("must be finite"));

        assert!(AnalysisParams::new().with_rim_trim_percent(25.0).validate().is_err());
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_toml_partial() {
        let p = AnalysisParams::from_toml("geodesic_count = 180\nthreshold_microns = 2.5\n").unwrap();
        assert_eq!(p.geodesic_count, 180);
        assert_eq!(p.threshold_microns, 2.5);
        assert_eq!(p.rim_trim_percent, 7.0);
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_toml_and_json_roundtrip() {
        let p = AnalysisParams::high_resolution().with_density(0.95);
        assert_eq!(AnalysisParams::from_toml(&p.to_toml().unwrap()).unwrap(), p);
        assert_eq!(AnalysisParams::from_json(&p.to_json().unwrap()).unwrap(), p);
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_bad_toml_is_config_error() {
        let err = AnalysisParams::from_toml("geodesic_count = \"many\"").unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::Config);
        assert!(AnalysisParams::from_toml_file("/nonexistent/params.toml").is_err());
    }
}
