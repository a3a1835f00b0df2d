use anyhow::{Context, Result};
use clap::Parser;
use cronometro::{
    cli::Cli,
    config::InstrumentConfig,
    pipeline::{BatchPipeline, PipelineError},
    report::BuildSummary,
};
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber; `--debug` raises the level to TRACE
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn write_report(path: &Path, summary: &BuildSummary) -> Result<()> {
    let json = summary.to_json().context("Failed to serialize build report")?;
    std::fs::write(path, json).with_context(|| format!("Failed to write report {}", path.display()))
}

fn run(args: &Cli) -> Result<bool> {
    let mut config = match &args.config {
        Some(path) => InstrumentConfig::from_file(path)?,
        None => InstrumentConfig::default(),
    };
    args.apply_to(&mut config);

    let inputs = args.inputs();
    if inputs.is_empty() {
        anyhow::bail!("Nothing to do. Usage: cronometro --dir SRC=DST | --jar SRC=DST");
    }

    let pipeline = BatchPipeline::from_config(&config)?;
    let (summary, ok) = match pipeline.run(&inputs) {
        Ok(summary) => (summary, true),
        Err(PipelineError::Failed { summary }) => (*summary, false),
        Err(e) => return Err(e.into()),
    };

    if let Some(path) = &args.report {
        write_report(path, &summary)?;
    }
    if !ok {
        eprintln!(
            "cronometro: build failed, see prior diagnostics ({} fatal)",
            summary.fatal_count()
        );
    }
    Ok(ok)
}

fn main() -> ExitCode {
    let args = Cli::parse();
    init_tracing(args.debug);

    match run(&args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
