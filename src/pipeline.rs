//! Parallel batch pipeline
//!
//! Enumerates every unit up front, then runs one task per loose file and one
//! task per archive on a bounded `rayon` pool. Tasks never abort the batch:
//! failures land in the shared [`BuildReport`] and are raised once, after the
//! scope has joined.

use crate::archive::ArchiveRewriter;
use crate::class_rewriter::ClassRewriter;
use crate::config::InstrumentConfig;
use crate::eligibility::EligibilityPolicy;
use crate::report::{BuildReport, BuildSummary, Diagnostic, DiagnosticKind};
use crate::transform::{TransformError, TransformRegistry};
use crate::unit::UnitProcessor;
use rayon::ThreadPoolBuilder;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("instrumentation failed with {} fatal diagnostics", .summary.fatal_count())]
    Failed { summary: Box<BuildSummary> },
}

/// Source/destination pairs to process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineInputs {
    pub dirs: Vec<(PathBuf, PathBuf)>,
    pub jars: Vec<(PathBuf, PathBuf)>,
}

impl PipelineInputs {
    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty() && self.jars.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Task {
    File { src: PathBuf, dst: PathBuf },
    Archive { src: PathBuf, dst: PathBuf },
}

impl Task {
    fn src(&self) -> &Path {
        match self {
            Task::File { src, .. } | Task::Archive { src, .. } => src,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchPipeline {
    processor: UnitProcessor,
    threads: usize,
    fail_on_unsafe_entry: bool,
}

impl BatchPipeline {
    pub fn new(processor: UnitProcessor, threads: usize, fail_on_unsafe_entry: bool) -> Self {
        Self {
            processor,
            threads,
            fail_on_unsafe_entry,
        }
    }

    /// Build from configuration, registering its `[[transform]]` commands
    pub fn from_config(config: &InstrumentConfig) -> Result<Self, PipelineError> {
        let registry = TransformRegistry::from_config(&config.transforms)?;
        Self::with_registry(config, &registry)
    }

    /// Build from configuration, resolving pre-transforms against `registry`
    pub fn with_registry(
        config: &InstrumentConfig,
        registry: &TransformRegistry,
    ) -> Result<Self, PipelineError> {
        config.validate().map_err(PipelineError::Config)?;
        let (clock, sink) = match (config.clock(), config.sink()) {
            (Some(clock), Some(sink)) => (clock, sink),
            _ => {
                return Err(PipelineError::Config(
                    "probe targets must be owner.name(descriptor)".to_string(),
                ))
            }
        };

        let runtime_owners = [clock.owner.as_str(), sink.owner.as_str()];
        let policy = EligibilityPolicy::from_config(&config.eligibility, &runtime_owners)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        let chain = registry.resolve(&config.pre_transforms)?;
        if !chain.is_empty() {
            tracing::debug!("pre-transforms: {:?}", chain);
        }

        let rewriter = ClassRewriter::new(policy, clock, sink);
        let skip_files = &config.units.skip_files;
        let processor = UnitProcessor::new(rewriter, chain, config.validate, skip_files)
            .map_err(|e| PipelineError::Config(format!("invalid skip pattern: {}", e)))?;

        Ok(Self::new(processor, config.threads, config.fail_on_unsafe_entry))
    }

    pub fn processor(&self) -> &UnitProcessor {
        &self.processor
    }

    /// Process every input, returning the summary of a successful build
    pub fn run(&self, inputs: &PipelineInputs) -> Result<BuildSummary, PipelineError> {
        let report = BuildReport::new();
        self.run_with_report(inputs, &report)?;

        let summary = report.summary();
        tracing::info!("{}", summary);
        if summary.failed {
            return Err(PipelineError::Failed {
                summary: Box::new(summary),
            });
        }
        Ok(summary)
    }

    /// Process every input into `report`; returns once all tasks finished
    pub fn run_with_report(
        &self,
        inputs: &PipelineInputs,
        report: &BuildReport,
    ) -> Result<(), PipelineError> {
        let tasks = collect_tasks(inputs, report);
        tracing::debug!("{} tasks queued", tasks.len());

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("cronometro-{}", i))
            .build()?;

        pool.scope(|s| {
            for task in &tasks {
                s.spawn(move |_| self.run_task(task, report));
            }
        });
        Ok(())
    }

    fn run_task(&self, task: &Task, report: &BuildReport) {
        let result = catch_unwind(AssertUnwindSafe(|| match task {
            Task::File { src, dst } => self.processor.process_file(src, dst, report),
            Task::Archive { src, dst } => {
                let archives = ArchiveRewriter::new(&self.processor, self.fail_on_unsafe_entry);
                archives.rewrite(src, dst, report)
            }
        }));
        if let Err(payload) = result {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            report.fail(Diagnostic::new(
                DiagnosticKind::Panic,
                task.src().display().to_string(),
                format!("task panicked: {}", message),
            ));
        }
    }
}

fn collect_tasks(inputs: &PipelineInputs, report: &BuildReport) -> Vec<Task> {
    let mut tasks = Vec::new();
    for (src, dst) in &inputs.dirs {
        match fs::metadata(src) {
            Ok(meta) if meta.is_dir() => walk_dir(src, dst, report, &mut tasks),
            Ok(_) => tasks.push(Task::File {
                src: src.clone(),
                dst: dst.clone(),
            }),
            Err(e) => report.fail(Diagnostic::new(
                DiagnosticKind::Input,
                src.display().to_string(),
                e.to_string(),
            )),
        }
    }
    for (src, dst) in &inputs.jars {
        tasks.push(Task::Archive {
            src: src.clone(),
            dst: dst.clone(),
        });
    }
    tasks
}

/// A directory waiting to be mirrored
struct PendingDir {
    src: PathBuf,
    dst: PathBuf,
    /// Canonical paths of this directory and everything above it
    ancestors: Vec<PathBuf>,
}

/// Mirror `src_root` under `dst_root`, queueing one task per file
///
/// Symlinked directories are followed; a link back into its own ancestry is
/// reported instead of being walked forever.
fn walk_dir(src_root: &Path, dst_root: &Path, report: &BuildReport, tasks: &mut Vec<Task>) {
    let root = fs::canonicalize(src_root).unwrap_or_else(|_| src_root.to_path_buf());
    let mut pending = vec![PendingDir {
        src: src_root.to_path_buf(),
        dst: dst_root.to_path_buf(),
        ancestors: vec![root],
    }];

    while let Some(dir) = pending.pop() {
        if let Err(e) = fs::create_dir_all(&dir.dst) {
            report.fail(Diagnostic::new(
                DiagnosticKind::Output,
                dir.dst.display().to_string(),
                e.to_string(),
            ));
            continue;
        }
        let entries = match fs::read_dir(&dir.src) {
            Ok(entries) => entries,
            Err(e) => {
                report.fail(Diagnostic::new(
                    DiagnosticKind::Input,
                    dir.src.display().to_string(),
                    e.to_string(),
                ));
                continue;
            }
        };

        let mut entries: Vec<_> = entries.filter_map(|entry| entry.ok()).collect();
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let src = entry.path();
            let dst = dir.dst.join(entry.file_name());
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(e) => {
                    report.fail(Diagnostic::new(
                        DiagnosticKind::Input,
                        src.display().to_string(),
                        e.to_string(),
                    ));
                    continue;
                }
            };
            if !(file_type.is_dir() || (file_type.is_symlink() && src.is_dir())) {
                tasks.push(Task::File { src, dst });
                continue;
            }

            match fs::canonicalize(&src) {
                Ok(real) if dir.ancestors.contains(&real) => {
                    report.fail(Diagnostic::new(
                        DiagnosticKind::Input,
                        src.display().to_string(),
                        format!("symlink cycle back to {}, not followed", real.display()),
                    ));
                }
                Ok(real) => {
                    let mut ancestors = dir.ancestors.clone();
                    ancestors.push(real);
                    pending.push(PendingDir { src, dst, ancestors });
                }
                Err(e) => report.fail(Diagnostic::new(
                    DiagnosticKind::Input,
                    src.display().to_string(),
                    e.to_string(),
                )),
            }
        }
    }
}
