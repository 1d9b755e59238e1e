//! Report rendering for text and JSON output.

use colored::Colorize;
use cup_wear::{AnalysisResults, AnomalyCluster, AnomalyKind};
use serde::Serialize;

use crate::OutputFormat;

/// Print a serializable value as pretty JSON (text mode is handled by callers).
pub fn print<T: Serialize>(value: &T, format: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    if let OutputFormat::Json = format {
        match serde_json::to_string_pretty(value) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{}: failed to serialize output: {}", "Error".red().bold(), e),
        }
    }
}

/// Compact summary of an analysis, without per-meridian samples.
#[derive(Serialize)]
pub struct ReportSummary {
    pub source: String,
    pub vertices: usize,
    pub faces: usize,
    pub sphere_center: [f64; 3],
    pub sphere_radius_mm: f64,
    pub sphere_rms_um: f64,
    pub sphericity_percent: f64,
    pub shape: String,
    pub axis: [f64; 3],
    pub geodesic_count: usize,
    pub mean_deviation_um: f64,
    pub std_deviation_um: f64,
    pub max_bump_um: f64,
    pub max_dip_um: f64,
    pub within_tolerance_percent: f64,
    pub bump_points: usize,
    pub dip_points: usize,
    pub clusters: Vec<ClusterSummary>,
    pub bump_volume_mm3: f64,
    pub dip_volume_mm3: f64,
    pub total_mass_mg: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wear_vector: Option<WearVectorSummary>,
    pub processing_time_ms: f64,
}

#[derive(Serialize)]
pub struct ClusterSummary {
    pub id: usize,
    pub kind: AnomalyKind,
    pub points: usize,
    pub centroid: [f64; 3],
    pub extreme_deviation_um: f64,
    pub area_mm2: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_mm3: Option<f64>,
}

#[derive(Serialize)]
pub struct WearVectorSummary {
    pub direction: [f64; 3],
    pub angle_deg: f64,
    pub distance_mm: f64,
    pub max_depth_um: f64,
}

impl ReportSummary {
    pub fn new(source: &str, results: &AnalysisResults) -> Self {
        let c = &results.sphere.center;
        let s = &results.deviation_stats;
        Self {
            source: source.to_string(),
            vertices: results.vertex_count,
            faces: results.face_count,
            sphere_center: [c.x, c.y, c.z],
            sphere_radius_mm: results.sphere.radius,
            sphere_rms_um: results.sphere.rms_error * 1000.0,
            sphericity_percent: results.ellipsoid.sphericity,
            shape: results.ellipsoid.shape.to_string(),
            axis: [results.axis.x, results.axis.y, results.axis.z],
            geodesic_count: results.geodesics.len(),
            mean_deviation_um: s.mean,
            std_deviation_um: s.std_dev,
            max_bump_um: s.max_bump,
            max_dip_um: s.max_dip,
            within_tolerance_percent: s.within_tolerance_percent,
            bump_points: results.bump_points,
            dip_points: results.dip_points,
            clusters: results.clusters.iter().map(ClusterSummary::new).collect(),
            bump_volume_mm3: results.volumes.bump_volume,
            dip_volume_mm3: results.volumes.dip_volume,
            total_mass_mg: results.total_mass_mg(),
            wear_vector: results.wear_vector.as_ref().map(|w| WearVectorSummary {
                direction: [w.direction.x, w.direction.y, w.direction.z],
                angle_deg: w.angle_deg,
                distance_mm: w.distance,
                max_depth_um: w.max_depth_um,
            }),
            processing_time_ms: results.processing_time_ms,
        }
    }
}

impl ClusterSummary {
    fn new(cluster: &AnomalyCluster) -> Self {
        let c = &cluster.centroid;
        Self {
            id: cluster.id,
            kind: cluster.kind,
            points: cluster.points.len(),
            centroid: [c.x, c.y, c.z],
            extreme_deviation_um: cluster.extreme_deviation,
            area_mm2: cluster.area,
            volume_mm3: cluster.volume,
        }
    }
}

/// Print the human-readable report.
pub fn print_report_text(summary: &ReportSummary, density_g_cm3: f64) {
    println!("{}", "Wear Analysis".bold().underline());
    println!("  {}: {}", "Source".cyan(), summary.source);
    println!(
        "  {}: {} vertices, {} faces",
        "Working mesh".cyan(),
        summary.vertices,
        summary.faces
    );

    println!();
    println!("{}", "Reference Geometry".bold());
    let c = summary.sphere_center;
    println!(
        "  {}: radius {:.4} mm at ({:.4}, {:.4}, {:.4})",
        "Sphere".cyan(),
        summary.sphere_radius_mm,
        c[0],
        c[1],
        c[2]
    );
    println!("  {}: {:.2} µm", "Fit RMS".cyan(), summary.sphere_rms_um);
    println!(
        "  {}: {:.2}% ({})",
        "Sphericity".cyan(),
        summary.sphericity_percent,
        summary.shape
    );
    let a = summary.axis;
    println!(
        "  {}: ({:.4}, {:.4}, {:.4})",
        "Cup axis".cyan(),
        a[0],
        a[1],
        a[2]
    );

    println!();
    println!("{}", "Deviation".bold());
    println!(
        "  {}: {:.2} ± {:.2} µm",
        "Mean".cyan(),
        summary.mean_deviation_um,
        summary.std_deviation_um
    );
    println!(
        "  {}: {} / {}",
        "Range".cyan(),
        format!("{:.2} µm", summary.max_dip_um).red(),
        format!("+{:.2} µm", summary.max_bump_um).yellow()
    );
    println!(
        "  {}: {:.1}%",
        "Within tolerance".cyan(),
        summary.within_tolerance_percent
    );
    println!(
        "  {}: {} bump, {} dip over {} meridians",
        "Anomaly points".cyan(),
        summary.bump_points,
        summary.dip_points,
        summary.geodesic_count
    );

    println!();
    println!("{}", "Clusters".bold());
    if summary.clusters.is_empty() {
        println!("  {}", "No anomalies above threshold".green());
    }
    for cluster in &summary.clusters {
        let label = match cluster.kind {
            AnomalyKind::Bump => "bump".yellow(),
            AnomalyKind::Dip => "dip".red(),
        };
        let volume = cluster
            .volume_mm3
            .map(|v| format!(", {:.4} mm³", v))
            .unwrap_or_default();
        println!(
            "  #{} {}: {} points, extreme {:+.2} µm, area {:.2} mm²{}",
            cluster.id, label, cluster.points, cluster.extreme_deviation_um, cluster.area_mm2, volume
        );
    }

    println!();
    println!("{}", "Volume".bold());
    println!("  {}: {:.4} mm³", "Bump volume".cyan(), summary.bump_volume_mm3);
    println!("  {}: {:.4} mm³", "Dip volume".cyan(), summary.dip_volume_mm3);
    println!(
        "  {}: {:.3} mg at {} g/cm³",
        "Total mass".cyan(),
        summary.total_mass_mg,
        density_g_cm3
    );

    println!();
    match &summary.wear_vector {
        Some(w) => {
            println!("{}", "Wear Vector".bold());
            println!(
                "  {}: ({:.4}, {:.4}, {:.4})",
                "Direction".cyan(),
                w.direction[0],
                w.direction[1],
                w.direction[2]
            );
            println!("  {}: {:.2}°", "Angle to axis".cyan(), w.angle_deg);
            println!("  {}: {:.3} mm", "Distance from pole".cyan(), w.distance_mm);
            println!("  {}: {:.2} µm", "Max depth".cyan(), w.max_depth_um);
        }
        None => println!("{}: none (no dip clusters)", "Wear Vector".bold()),
    }

    println!();
    println!(
        "{}",
        format!("Completed in {:.1} ms", summary.processing_time_ms).dimmed()
    );
}
