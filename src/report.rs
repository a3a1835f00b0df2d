//! Build-wide result aggregation
//!
//! Every worker records into one shared [`BuildReport`]. The failure flag only
//! ever goes from `false` to `true`, so concurrent writers never need to
//! coordinate. The pipeline turns the report into a [`BuildSummary`] once all
//! tasks have finished.

use crossbeam::queue::SegQueue;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Category of a per-unit diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// Unit could not be read or parsed
    Input,
    /// A pre-transform failed
    Transform,
    /// The rewriter could not instrument the class
    Rewrite,
    /// The rewritten class failed structural verification
    Validation,
    /// Archive entry would have been written outside the output root
    UnsafeEntry,
    /// Writing the output failed
    Output,
    /// A worker task panicked
    Panic,
    /// Constructor left uninstrumented
    UnanchoredConstructor,
}

/// One message about one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Path of the unit (file, or `archive!entry`)
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    pub message: String,
    /// Whether this diagnostic failed the build
    pub fatal: bool,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, unit: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            unit: unit.into(),
            class_name: None,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn with_class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }
}

/// Shared, lock-free build state
#[derive(Debug, Default)]
pub struct BuildReport {
    failed: AtomicBool,
    units_seen: AtomicU64,
    units_rewritten: AtomicU64,
    units_copied: AtomicU64,
    units_fallback: AtomicU64,
    methods_instrumented: AtomicU64,
    exit_sites: AtomicU64,
    entries_rejected: AtomicU64,
    diagnostics: SegQueue<Diagnostic>,
}

/// What happened to one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitFate {
    /// Instrumented bytes were written
    Rewritten { methods: usize, exit_sites: usize },
    /// Written verbatim because nothing applied
    Copied,
    /// Written verbatim after an error
    Fallback,
}

impl BuildReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the build failed; returns the previous state
    pub fn mark_failed(&self) -> bool {
        self.failed.fetch_or(true, Ordering::AcqRel)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Record a diagnostic that fails the build
    pub fn fail(&self, mut diagnostic: Diagnostic) {
        diagnostic.fatal = true;
        tracing::error!(
            "{}{}: {}",
            diagnostic.unit,
            class_suffix(&diagnostic),
            diagnostic.message
        );
        self.mark_failed();
        self.diagnostics.push(diagnostic);
    }

    /// Record a diagnostic without failing the build
    pub fn warn(&self, mut diagnostic: Diagnostic) {
        diagnostic.fatal = false;
        tracing::warn!(
            "{}{}: {}",
            diagnostic.unit,
            class_suffix(&diagnostic),
            diagnostic.message
        );
        self.diagnostics.push(diagnostic);
    }

    pub fn record_unit(&self, fate: UnitFate) {
        self.units_seen.fetch_add(1, Ordering::Relaxed);
        match fate {
            UnitFate::Rewritten { methods, exit_sites } => {
                self.units_rewritten.fetch_add(1, Ordering::Relaxed);
                self.methods_instrumented
                    .fetch_add(methods as u64, Ordering::Relaxed);
                self.exit_sites.fetch_add(exit_sites as u64, Ordering::Relaxed);
            }
            UnitFate::Copied => {
                self.units_copied.fetch_add(1, Ordering::Relaxed);
            }
            UnitFate::Fallback => {
                self.units_fallback.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_rejected_entry(&self) {
        self.entries_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of counters and all diagnostics recorded so far
    ///
    /// Drains the diagnostic queue; call once after every task has finished.
    pub fn summary(&self) -> BuildSummary {
        let mut diagnostics = Vec::with_capacity(self.diagnostics.len());
        while let Some(diagnostic) = self.diagnostics.pop() {
            diagnostics.push(diagnostic);
        }
        diagnostics.sort_by(|a, b| a.unit.cmp(&b.unit).then(a.message.cmp(&b.message)));

        BuildSummary {
            failed: self.has_failed(),
            units_seen: self.units_seen.load(Ordering::Relaxed),
            units_rewritten: self.units_rewritten.load(Ordering::Relaxed),
            units_copied: self.units_copied.load(Ordering::Relaxed),
            units_fallback: self.units_fallback.load(Ordering::Relaxed),
            methods_instrumented: self.methods_instrumented.load(Ordering::Relaxed),
            exit_sites: self.exit_sites.load(Ordering::Relaxed),
            entries_rejected: self.entries_rejected.load(Ordering::Relaxed),
            diagnostics,
        }
    }
}

fn class_suffix(diagnostic: &Diagnostic) -> String {
    diagnostic
        .class_name
        .as_deref()
        .map(|c| format!(" ({})", c))
        .unwrap_or_default()
}

/// Serializable end-of-run summary (`--report`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSummary {
    pub failed: bool,
    pub units_seen: u64,
    pub units_rewritten: u64,
    pub units_copied: u64,
    pub units_fallback: u64,
    pub methods_instrumented: u64,
    pub exit_sites: u64,
    pub entries_rejected: u64,
    pub diagnostics: Vec<Diagnostic>,
}

impl BuildSummary {
    pub fn fatal_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.fatal).count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl std::fmt::Display for BuildSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} units ({} rewritten, {} copied, {} fallback), {} methods instrumented, {} exit sites, {} diagnostics ({} fatal)",
            self.units_seen,
            self.units_rewritten,
            self.units_copied,
            self.units_fallback,
            self.methods_instrumented,
            self.exit_sites,
            self.diagnostics.len(),
            self.fatal_count()
        )
    }
}
