//! Whole-archive rewriting with path traversal defense
//!
//! An archive is one task: its entries are read in order and written by a
//! single `ZipWriter`. Entry names are resolved lexically against the output
//! root before anything is written, and names that would land outside it
//! (`../../evil`, `/etc/passwd`, `C:\x`) are skipped.

use crate::report::{BuildReport, Diagnostic, DiagnosticKind};
use crate::unit::UnitProcessor;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: {source}", .path.display())]
    Zip {
        path: PathBuf,
        #[source]
        source: ZipError,
    },

    #[error("refusing to overwrite input archive {}", .0.display())]
    SameFile(PathBuf),
}

/// Per-archive counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub entries_written: usize,
    pub entries_rejected: usize,
    pub duplicates_skipped: usize,
}

/// Lexically normalize an entry name relative to the archive root
///
/// Returns the `/`-separated components, or `None` when the name is absolute,
/// carries a drive prefix, climbs above the root, or names the root itself.
pub fn normalize_entry_name(name: &str) -> Option<Vec<&str>> {
    if name.starts_with('/') || name.starts_with('\\') {
        return None;
    }
    let mut parts: Vec<&str> = Vec::new();
    for component in name.split(['/', '\\']) {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            c if c.contains(':') => return None,
            c => parts.push(c),
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

/// Where an entry would be extracted under `root`, if it stays inside it
pub fn resolve_entry_path(root: &Path, name: &str) -> Option<PathBuf> {
    let parts = normalize_entry_name(name)?;
    let mut path = root.to_path_buf();
    path.extend(parts);
    Some(path)
}

/// Rewrites every class inside an archive
#[derive(Debug, Clone, Copy)]
pub struct ArchiveRewriter<'a> {
    processor: &'a UnitProcessor,
    fail_on_unsafe_entry: bool,
}

impl<'a> ArchiveRewriter<'a> {
    pub fn new(processor: &'a UnitProcessor, fail_on_unsafe_entry: bool) -> Self {
        Self {
            processor,
            fail_on_unsafe_entry,
        }
    }

    /// Rewrite `src` into `dst`
    ///
    /// On failure `dst` is replaced by a verbatim copy of a non-empty `src`.
    pub fn rewrite(&self, src: &Path, dst: &Path, report: &BuildReport) {
        match self.try_rewrite(src, dst, report) {
            Ok(stats) => {
                tracing::debug!(
                    "{}: {} entries written, {} rejected, {} duplicates skipped",
                    src.display(),
                    stats.entries_written,
                    stats.entries_rejected,
                    stats.duplicates_skipped
                );
            }
            Err(ArchiveError::SameFile(path)) => {
                report.fail(Diagnostic::new(
                    DiagnosticKind::Output,
                    path.display().to_string(),
                    "refusing to overwrite input archive",
                ));
            }
            Err(e) => {
                report.fail(Diagnostic::new(
                    DiagnosticKind::Input,
                    src.display().to_string(),
                    e.to_string(),
                ));
                self.fallback_copy(src, dst, report);
            }
        }
    }

    fn fallback_copy(&self, src: &Path, dst: &Path, report: &BuildReport) {
        let non_empty = fs::metadata(src).map(|m| m.len() > 0).unwrap_or(false);
        if !non_empty {
            return;
        }
        if let Err(e) = fs::copy(src, dst) {
            report.fail(Diagnostic::new(
                DiagnosticKind::Output,
                dst.display().to_string(),
                format!("verbatim copy failed: {}", e),
            ));
        }
    }

    fn try_rewrite(
        &self,
        src: &Path,
        dst: &Path,
        report: &BuildReport,
    ) -> Result<ArchiveStats, ArchiveError> {
        if let (Ok(a), Ok(b)) = (fs::canonicalize(src), fs::canonicalize(dst)) {
            if a == b {
                return Err(ArchiveError::SameFile(src.to_path_buf()));
            }
        }
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ArchiveError::Io { path, source }
        };
        let zip_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ArchiveError::Zip { path, source }
        };

        let input = File::open(src).map_err(io(src))?;
        let mut archive = ZipArchive::new(BufReader::new(input)).map_err(zip_err(src))?;

        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(io(parent))?;
        }
        let output = File::create(dst).map_err(io(dst))?;
        let mut writer = ZipWriter::new(BufWriter::new(output));

        let mut stats = ArchiveStats::default();
        let mut seen = HashSet::new();

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(zip_err(src))?;
            let raw_name = entry.name().to_string();
            let unit = format!("{}!{}", src.display(), raw_name);

            let Some(parts) = normalize_entry_name(&raw_name) else {
                stats.entries_rejected += 1;
                report.record_rejected_entry();
                let diagnostic = Diagnostic::new(
                    DiagnosticKind::UnsafeEntry,
                    unit,
                    "entry resolves outside the output root; skipped",
                );
                if self.fail_on_unsafe_entry {
                    report.fail(diagnostic);
                } else {
                    report.warn(diagnostic);
                }
                continue;
            };
            let name = parts.join("/");

            let method = match entry.compression() {
                CompressionMethod::Stored => CompressionMethod::Stored,
                _ => CompressionMethod::Deflated,
            };
            let mut options = SimpleFileOptions::default().compression_method(method);
            if let Some(mode) = entry.unix_mode() {
                options = options.unix_permissions(mode);
            }

            if entry.is_dir() {
                let dir_name = format!("{}/", name);
                if seen.insert(dir_name.clone()) {
                    writer.add_directory(dir_name, options).map_err(zip_err(dst))?;
                }
                continue;
            }
            if !seen.insert(name.clone()) {
                stats.duplicates_skipped += 1;
                tracing::warn!("{}: duplicate entry `{}` skipped", src.display(), name);
                continue;
            }

            let mut input = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut input).map_err(io(src))?;
            let output = self.processor.process_bytes(&unit, &input, report);

            writer.start_file(name, options).map_err(zip_err(dst))?;
            writer.write_all(&output).map_err(io(dst))?;
            stats.entries_written += 1;
        }

        let mut inner = writer.finish().map_err(zip_err(dst))?;
        inner.flush().map_err(io(dst))?;
        Ok(stats)
    }
}
