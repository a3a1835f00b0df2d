//! Cronometro - method latency instrumentation for JVM class files
//!
//! This library rewrites compiled classes so that every eligible method
//! captures a clock reading on entry and reports the elapsed time to a
//! configurable sink at each exit. Class directories and jar archives are
//! processed in parallel, with verbatim fallback for anything that cannot be
//! rewritten.

pub mod archive;
pub mod class_rewriter;
pub mod classfile;
pub mod cli;
pub mod config;
pub mod eligibility;
pub mod method_rewriter;
pub mod pipeline;
pub mod report;
pub mod transform;
pub mod unit;
pub mod verify;

pub use class_rewriter::{ClassOutcome, ClassRewriter};
pub use config::InstrumentConfig;
pub use eligibility::EligibilityPolicy;
pub use pipeline::{BatchPipeline, PipelineError, PipelineInputs};
pub use report::{BuildReport, BuildSummary};
