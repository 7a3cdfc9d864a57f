//! Configuration view and validation: `doc-analyser config`.

use anyhow::{Context, Result, bail};
use std::path::Path;

use doc_analyser::config::{AnalyserConfig, CONFIG_FILE_NAME};

pub fn cmd_config(config: &AnalyserConfig, explicit: Option<&Path>, check: bool) -> Result<()> {
    let warnings = config.validate();

    if check {
        if warnings.is_empty() {
            println!("Configuration is valid.");
            return Ok(());
        }
        println!("Configuration warnings:");
        for warning in &warnings {
            println!("  - {}", warning);
        }
        bail!("{} configuration warning(s)", warnings.len());
    }

    match explicit {
        Some(path) => println!("# Config file: {}", path.display()),
        None if Path::new(CONFIG_FILE_NAME).exists() => {
            println!("# Config file: {}", CONFIG_FILE_NAME)
        }
        None => println!("# No {} found, defaults plus environment", CONFIG_FILE_NAME),
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("Failed to render config")?;
    println!("{}", rendered);

    if !warnings.is_empty() {
        println!("{}", console::style("Warnings:").yellow().bold());
        for warning in &warnings {
            println!("  - {}", warning);
        }
    }
    Ok(())
}
