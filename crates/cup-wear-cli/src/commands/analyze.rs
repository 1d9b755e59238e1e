//! cupwear analyze command - run the full pipeline on a scanned mesh.

use std::path::Path;

use anyhow::Result;

use super::{resolve_params, run_pipeline};
use crate::output::{self, ReportSummary};
use crate::{Cli, OutputFormat, ParamOverrides, load};

pub fn run(input: &Path, overrides: &ParamOverrides, full: bool, cli: &Cli) -> Result<()> {
    let params = resolve_params(overrides)?;
    let density = params.density_g_cm3;
    let mesh = load::load_ply(input)?;

    let results = run_pipeline(mesh, params, cli)?;
    let source = input.display().to_string();

    match cli.format {
        OutputFormat::Json if full => output::print(&results, cli.format, cli.quiet),
        OutputFormat::Json => {
            output::print(&ReportSummary::new(&source, &results), cli.format, cli.quiet)
        }
        OutputFormat::Text => {
            if !cli.quiet {
                output::print_report_text(&ReportSummary::new(&source, &results), density);
            }
        }
    }

    Ok(())
}
