//! cupwear params command - print the default parameters.

use anyhow::Result;
use cup_wear::AnalysisParams;

use crate::{Cli, OutputFormat};

pub fn run(cli: &Cli) -> Result<()> {
    if cli.quiet {
        return Ok(());
    }

    let params = AnalysisParams::default();
    match cli.format {
        OutputFormat::Json => println!("{}", params.to_json()?),
        OutputFormat::Text => print!("{}", params.to_toml()?),
    }

    Ok(())
}
