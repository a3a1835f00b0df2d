//! CLI argument parsing for cronometro

use crate::config::InstrumentConfig;
use crate::pipeline::PipelineInputs;
use clap::Parser;
use std::path::PathBuf;

/// Parse a `SRC=DST` pair
fn parse_pair(value: &str) -> Result<(PathBuf, PathBuf), String> {
    match value.split_once('=') {
        Some((src, dst)) if !src.is_empty() && !dst.is_empty() => {
            Ok((PathBuf::from(src), PathBuf::from(dst)))
        }
        _ => Err(format!("expected SRC=DST, got `{}`", value)),
    }
}

#[derive(Parser, Debug)]
#[command(name = "cronometro")]
#[command(version)]
#[command(about = "Instrument JVM class files with method latency probes", long_about = None)]
pub struct Cli {
    /// Class directory to rewrite into a mirrored output directory
    #[arg(short = 'd', long = "dir", value_name = "SRC=DST", value_parser = parse_pair)]
    pub dirs: Vec<(PathBuf, PathBuf)>,

    /// Jar archive to rewrite into an output archive
    #[arg(short = 'j', long = "jar", value_name = "SRC=DST", value_parser = parse_pair)]
    pub jars: Vec<(PathBuf, PathBuf)>,

    /// Pre-transform to run on each class before instrumentation (repeatable, in order)
    #[arg(short = 't', long = "transform", value_name = "NAME")]
    pub transforms: Vec<String>,

    /// Skip structural verification of rewritten classes
    #[arg(long = "skip-check")]
    pub skip_check: bool,

    /// Worker threads (0 = available parallelism)
    #[arg(long = "threads", value_name = "N")]
    pub threads: Option<usize>,

    /// TOML configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write a JSON build report to FILE
    #[arg(long = "report", value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Fail the build when an archive entry would escape the output root
    #[arg(long = "fail-on-unsafe-entry")]
    pub fail_on_unsafe_entry: bool,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}

impl Cli {
    /// Override configuration values with the flags that were given
    pub fn apply_to(&self, config: &mut InstrumentConfig) {
        if self.skip_check {
            config.validate = false;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if self.fail_on_unsafe_entry {
            config.fail_on_unsafe_entry = true;
        }
        if !self.transforms.is_empty() {
            config.pre_transforms = self.transforms.clone();
        }
    }

    pub fn inputs(&self) -> PipelineInputs {
        PipelineInputs {
            dirs: self.dirs.clone(),
            jars: self.jars.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_pairs() {
        let cli = Cli::parse_from([
            "cronometro",
            "--dir",
            "build/classes=out/classes",
            "--jar",
            "lib/a.jar=out/a.jar",
            "-d",
            "x=y",
        ]);
        assert_eq!(
            cli.dirs,
            vec![
                (PathBuf::from("build/classes"), PathBuf::from("out/classes")),
                (PathBuf::from("x"), PathBuf::from("y")),
            ]
        );
        assert_eq!(cli.jars, vec![(PathBuf::from("lib/a.jar"), PathBuf::from("out/a.jar"))]);
    }

    #[test]
    fn test_cli_rejects_malformed_pair() {
        assert!(Cli::try_parse_from(["cronometro", "--dir", "only-src"]).is_err());
        assert!(Cli::try_parse_from(["cronometro", "--jar", "=out.jar"]).is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["cronometro"]);
        assert!(cli.dirs.is_empty());
        assert!(!cli.skip_check);
        assert!(!cli.debug);
        assert!(cli.threads.is_none());
        assert!(cli.inputs().is_empty());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::parse_from([
            "cronometro",
            "--skip-check",
            "--threads",
            "3",
            "--transform",
            "shrink",
            "--transform",
            "desugar",
        ]);
        let mut config = InstrumentConfig::default();
        cli.apply_to(&mut config);
        assert!(!config.validate);
        assert_eq!(config.threads, 3);
        assert_eq!(config.pre_transforms, vec!["shrink", "desugar"]);
    }

    #[test]
    fn test_absent_flags_keep_config() {
        let cli = Cli::parse_from(["cronometro"]);
        let mut config = InstrumentConfig {
            threads: 8,
            pre_transforms: vec!["shrink".to_string()],
            ..InstrumentConfig::default()
        };
        cli.apply_to(&mut config);
        assert!(config.validate);
        assert_eq!(config.threads, 8);
        assert_eq!(config.pre_transforms, vec!["shrink"]);
    }
}
