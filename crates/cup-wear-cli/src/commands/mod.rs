//! Subcommand implementations.

pub mod analyze;
pub mod demo;
pub mod params;

use std::sync::Mutex;

use anyhow::{Context, Result};
use colored::Colorize;
use cup_wear::{
    AnalysisParams, AnalysisPipeline, AnalysisResults, CallbackProgressReporter, Mesh,
    PipelineStage, ProgressCallback, ProgressEvent,
};

use crate::{Cli, OutputFormat, ParamOverrides};

/// Start from the config file (or defaults) and apply command-line overrides.
pub(crate) fn resolve_params(overrides: &ParamOverrides) -> Result<AnalysisParams> {
    let mut params = match &overrides.config {
        Some(path) => AnalysisParams::from_toml_file(path)
            .with_context(|| format!("Failed to load parameters from {:?}", path))?,
        None => AnalysisParams::default(),
    };

    if let Some(count) = overrides.geodesics {
        params = params.with_geodesic_count(count);
    }
    if let Some(trim) = overrides.trim {
        params = params.with_rim_trim_percent(trim);
    }
    if let Some(threshold) = overrides.threshold {
        params = params.with_threshold_microns(threshold);
    }
    if let Some(density) = overrides.density {
        params = params.with_density(density);
    }

    Ok(params)
}

/// Run every stage, printing one line per stage to stderr in text mode.
pub(crate) fn run_pipeline(mesh: Mesh, params: AnalysisParams, cli: &Cli) -> Result<AnalysisResults> {
    let show_progress = !cli.quiet && matches!(cli.format, OutputFormat::Text);
    let last_stage: Mutex<Option<PipelineStage>> = Mutex::new(None);

    let callback: ProgressCallback = Box::new(move |event: &ProgressEvent| {
        if !show_progress {
            return;
        }
        let Ok(mut last) = last_stage.lock() else {
            return;
        };
        if *last != Some(event.stage) {
            *last = Some(event.stage);
            eprintln!(
                "{} {}",
                format!("[{:>3}%]", event.percent()).dimmed(),
                event.stage
            );
        }
    });
    let reporter = CallbackProgressReporter::new(&callback);

    let mut pipeline = AnalysisPipeline::new(mesh, params)?;
    pipeline.run_full_analysis_with_progress(&reporter)?;
    pipeline
        .into_results()
        .context("Pipeline finished without producing results")
}
