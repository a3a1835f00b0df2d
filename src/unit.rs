//! One input unit to one output, with verbatim fallback
//!
//! Whatever goes wrong while transforming, rewriting or verifying a class, the
//! output location still receives a usable file: the original bytes when the
//! rewrite failed, the rewritten bytes when only verification complained.

use crate::class_rewriter::{ClassOutcome, ClassRewriter};
use crate::method_rewriter::RewriteError;
use crate::report::{BuildReport, Diagnostic, DiagnosticKind, UnitFate};
use crate::transform::{TransformChain, TransformError};
use crate::verify::verify_bytes;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UnitError {
    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("refusing to overwrite input {}", .0.display())]
    SameFile(PathBuf),
}

impl UnitError {
    fn kind(&self) -> DiagnosticKind {
        match self {
            UnitError::Transform(_) => DiagnosticKind::Transform,
            UnitError::Rewrite(_) => DiagnosticKind::Rewrite,
            UnitError::Io { .. } | UnitError::SameFile(_) => DiagnosticKind::Output,
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> UnitError + '_ {
    move |source| UnitError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Convert a `*` wildcard file-name pattern into an anchored regex
fn wildcard(pattern: &str) -> Result<Regex, regex::Error> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    Regex::new(&format!("^{}$", escaped))
}

/// Rewrites single class units
#[derive(Debug, Clone)]
pub struct UnitProcessor {
    rewriter: ClassRewriter,
    chain: TransformChain,
    validate: bool,
    skip_files: Vec<Regex>,
}

impl UnitProcessor {
    pub fn new(
        rewriter: ClassRewriter,
        chain: TransformChain,
        validate: bool,
        skip_files: &[String],
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            rewriter,
            chain,
            validate,
            skip_files: skip_files
                .iter()
                .map(|p| wildcard(p))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    /// Whether a unit with this path or entry name goes through the rewriter
    pub fn is_rewrite_target(&self, name: &str) -> bool {
        if !name.ends_with(".class") {
            return false;
        }
        let file_name = name.rsplit(['/', '\\']).next().unwrap_or(name);
        !self.skip_files.iter().any(|re| re.is_match(file_name))
    }

    /// Produce the output bytes for one unit; never fails
    ///
    /// Errors are recorded in `report` and answered with `input` verbatim.
    pub fn process_bytes(&self, unit: &str, input: &[u8], report: &BuildReport) -> Vec<u8> {
        if !self.is_rewrite_target(unit) {
            report.record_unit(UnitFate::Copied);
            return input.to_vec();
        }

        match self.rewrite(unit, input, report) {
            Ok((bytes, fate)) => {
                report.record_unit(fate);
                bytes
            }
            Err(e) => {
                report.fail(Diagnostic::new(e.kind(), unit, e.to_string()));
                report.record_unit(UnitFate::Fallback);
                input.to_vec()
            }
        }
    }

    fn rewrite(
        &self,
        unit: &str,
        input: &[u8],
        report: &BuildReport,
    ) -> Result<(Vec<u8>, UnitFate), UnitError> {
        let transformed = if self.chain.is_empty() {
            input.to_vec()
        } else {
            self.chain.apply(input)?
        };

        let (class_name, bytes, stats, fate) = match self.rewriter.rewrite(&transformed)? {
            ClassOutcome::Unchanged {
                class_name,
                stats,
                ..
            } => (class_name, transformed, stats, UnitFate::Copied),
            ClassOutcome::Rewritten {
                class_name,
                bytes,
                stats,
            } => {
                let fate = UnitFate::Rewritten {
                    methods: stats.methods_instrumented,
                    exit_sites: stats.exit_sites,
                };
                (class_name, bytes, stats, fate)
            }
        };

        if stats.constructors_unanchored > 0 {
            report.warn(
                Diagnostic::new(
                    DiagnosticKind::UnanchoredConstructor,
                    unit,
                    format!(
                        "{} constructor(s) never call a superclass constructor, left untimed",
                        stats.constructors_unanchored
                    ),
                )
                .with_class(class_name.clone()),
            );
        }

        // Pre-transformed output is checked even when no timing code was added
        if self.validate && bytes != input {
            if let Err(e) = verify_bytes(&bytes) {
                // Still emitted: the failure flag stops the build
                report.fail(
                    Diagnostic::new(DiagnosticKind::Validation, unit, e.to_string())
                        .with_class(class_name),
                );
            }
        }
        Ok((bytes, fate))
    }

    /// Process a loose file from `src` into `dst`
    pub fn process_file(&self, src: &Path, dst: &Path, report: &BuildReport) {
        let unit = src.display().to_string();
        if let Err(e) = self.try_process_file(src, dst, &unit, report) {
            let kind = match &e {
                UnitError::Io { path, .. } if path == src => DiagnosticKind::Input,
                other => other.kind(),
            };
            report.fail(Diagnostic::new(kind, unit, e.to_string()));
        }
    }

    fn try_process_file(
        &self,
        src: &Path,
        dst: &Path,
        unit: &str,
        report: &BuildReport,
    ) -> Result<(), UnitError> {
        if same_file(src, dst) {
            return Err(UnitError::SameFile(src.to_path_buf()));
        }
        let input = fs::read(src).map_err(io_error(src))?;
        let output = self.process_bytes(unit, &input, report);

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        fs::write(dst, output).map_err(io_error(dst))?;
        tracing::trace!("{} -> {}", src.display(), dst.display());
        Ok(())
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
