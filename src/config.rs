//! Instrumentation configuration (`cronometro.toml`)
//!
//! Every section is optional; missing keys fall back to the defaults below.
//!
//! ```toml
//! threads = 4
//! validate = true
//! fail_on_unsafe_entry = false
//! pre_transforms = ["strip-debug"]
//!
//! [eligibility]
//! self_markers = ["cronometro/"]
//! include_suffixes = ["Activity", "Fragment"]
//! class_named_methods = "binary-suffix"
//!
//! [[eligibility.denylist]]
//! kind = "prefix"
//! pattern = "android.support."
//!
//! [probe]
//! clock = "java/lang/System.nanoTime()J"
//! sink = "cronometro/runtime/MethodTimer.record(J)V"
//!
//! [units]
//! skip_files = ["R.class", "R$*.class"]
//!
//! [[transform]]
//! name = "strip-debug"
//! command = ["strip-class", "--debug"]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Root configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub eligibility: EligibilityConfig,
    pub probe: ProbeConfig,
    pub units: UnitConfig,
    /// Run the structural verifier on every rewritten class
    pub validate: bool,
    /// Worker threads; 0 uses the available parallelism
    pub threads: usize,
    /// Treat archive entries escaping the output root as build failures
    pub fail_on_unsafe_entry: bool,
    /// Ordered pre-transform names applied before rewriting
    pub pre_transforms: Vec<String>,
    /// External command transforms available to `pre_transforms`
    #[serde(rename = "transform")]
    pub transforms: Vec<ExternalTransform>,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            eligibility: EligibilityConfig::default(),
            probe: ProbeConfig::default(),
            units: UnitConfig::default(),
            validate: true,
            threads: 0,
            fail_on_unsafe_entry: false,
            pre_transforms: Vec::new(),
            transforms: Vec::new(),
        }
    }
}

impl InstrumentConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse TOML")
    }

    /// Validate configuration parameters
    ///
    /// # Returns
    ///
    /// `Ok(())` if valid, `Err(String)` naming the first bad setting
    pub fn validate(&self) -> Result<(), String> {
        let clock = MethodTarget::parse(&self.probe.clock).ok_or_else(|| {
            format!(
                "probe.clock `{}` is not owner.name(descriptor)",
                self.probe.clock
            )
        })?;
        if clock.descriptor != "()J" {
            return Err(format!(
                "probe.clock must have descriptor ()J, got {}",
                clock.descriptor
            ));
        }

        let sink = MethodTarget::parse(&self.probe.sink).ok_or_else(|| {
            format!(
                "probe.sink `{}` is not owner.name(descriptor)",
                self.probe.sink
            )
        })?;
        if sink.descriptor != "(J)V" {
            return Err(format!(
                "probe.sink must have descriptor (J)V, got {}",
                sink.descriptor
            ));
        }

        for rule in &self.eligibility.denylist {
            if rule.pattern.is_empty() {
                return Err("eligibility.denylist patterns must not be empty".to_string());
            }
            if rule.kind == MatchKind::Regex {
                regex::Regex::new(&rule.pattern)
                    .map_err(|e| format!("invalid denylist regex `{}`: {}", rule.pattern, e))?;
            }
        }

        if self.eligibility.include_suffixes.iter().any(String::is_empty) {
            return Err("eligibility.include_suffixes must not contain empty entries".to_string());
        }

        let mut names = std::collections::HashSet::new();
        for transform in &self.transforms {
            if transform.name.is_empty() {
                return Err("transform name must not be empty".to_string());
            }
            if transform.command.is_empty() {
                return Err(format!("transform `{}` has an empty command", transform.name));
            }
            if !names.insert(transform.name.as_str()) {
                return Err(format!("transform `{}` is defined twice", transform.name));
            }
        }

        Ok(())
    }

    /// Parsed clock target; only meaningful after [`validate`](Self::validate)
    pub fn clock(&self) -> Option<MethodTarget> {
        MethodTarget::parse(&self.probe.clock)
    }

    /// Parsed sink target; only meaningful after [`validate`](Self::validate)
    pub fn sink(&self) -> Option<MethodTarget> {
        MethodTarget::parse(&self.probe.sink)
    }
}

/// Which classes and methods get instrumented
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EligibilityConfig {
    /// Name fragments identifying the engine's own runtime classes
    pub self_markers: Vec<String>,
    pub denylist: Vec<DenyRule>,
    /// When non-empty, only classes whose simple name ends with one of these
    pub include_suffixes: Vec<String>,
    pub class_named_methods: ClassNamedMethods,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            self_markers: vec!["cronometro/".to_string()],
            denylist: default_denylist(),
            include_suffixes: Vec::new(),
            class_named_methods: ClassNamedMethods::BinarySuffix,
        }
    }
}

/// Language-runtime and analytics namespaces left alone unless the
/// configuration supplies its own `[[eligibility.denylist]]`
fn default_denylist() -> Vec<DenyRule> {
    vec![
        DenyRule::new(MatchKind::Prefix, "kotlin/"),
        DenyRule::new(MatchKind::Prefix, "kotlinx/"),
        DenyRule::new(MatchKind::Contains, "org/jetbrains/kotlin"),
        DenyRule::new(MatchKind::Contains, "thinkingdata"),
    ]
}

/// One denylist entry, matched against the internal class name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenyRule {
    #[serde(default)]
    pub kind: MatchKind,
    pub pattern: String,
}

impl DenyRule {
    pub fn new(kind: MatchKind, pattern: impl Into<String>) -> Self {
        Self {
            kind,
            pattern: pattern.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchKind {
    #[default]
    Contains,
    Prefix,
    Exact,
    Suffix,
    Regex,
}

/// How to exclude methods named after their enclosing class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassNamedMethods {
    /// Skip when the binary class name ends with the method name
    #[default]
    BinarySuffix,
    /// Skip when the method name equals the simple class name
    SimpleName,
    Off,
}

/// Static methods called by the injected probes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// `owner.name()J` returning the current timestamp
    pub clock: String,
    /// `owner.name(J)V` receiving each elapsed duration
    pub sink: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            clock: "java/lang/System.nanoTime()J".to_string(),
            sink: "cronometro/runtime/MethodTimer.record(J)V".to_string(),
        }
    }
}

/// Per-file handling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    /// File-name patterns (`*` wildcard) copied without rewriting
    pub skip_files: Vec<String>,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            skip_files: [
                "R.class",
                "R$*.class",
                "BuildConfig.class",
                "module-info.class",
                "package-info.class",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// A pre-transform backed by an external command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalTransform {
    pub name: String,
    /// Program followed by its arguments
    pub command: Vec<String>,
}

/// A static method named `owner.name(descriptor)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodTarget {
    pub owner: String,
    pub name: String,
    pub descriptor: String,
}

impl MethodTarget {
    pub fn parse(value: &str) -> Option<Self> {
        let paren = value.find('(')?;
        let (path, descriptor) = value.split_at(paren);
        let dot = path.rfind('.')?;
        let (owner, name) = (&path[..dot], &path[dot + 1..]);
        if owner.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            owner: owner.replace('.', "/"),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        })
    }
}
