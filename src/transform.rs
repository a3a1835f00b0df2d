//! Pre-transforms applied to class bytes before instrumentation
//!
//! A transform is a named `bytes -> bytes` step. The registry resolves the
//! configured names once, before any unit is processed, so a typo fails the
//! run up front instead of once per class.

use crate::config::ExternalTransform;
use std::collections::HashMap;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("unknown pre-transform `{0}`")]
    Unknown(String),

    #[error("pre-transform `{0}` is registered twice")]
    Duplicate(String),

    #[error("pre-transform `{name}` could not run: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pre-transform `{name}` exited with {status}: {stderr}")]
    Failed {
        name: String,
        status: String,
        stderr: String,
    },

    #[error("pre-transform `{name}` rejected the class: {reason}")]
    Rejected { name: String, reason: String },
}

/// A named class-bytes rewrite run before timing instrumentation
pub trait ClassTransform: Send + Sync {
    fn name(&self) -> &str;

    fn transform(&self, class_bytes: &[u8]) -> Result<Vec<u8>, TransformError>;
}

/// Runs an external command per class: bytes on stdin, result on stdout
#[derive(Debug, Clone)]
pub struct ExecTransform {
    name: String,
    program: String,
    args: Vec<String>,
}

impl ExecTransform {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
        }
    }

    /// `None` when the configured command is empty
    pub fn from_config(config: &ExternalTransform) -> Option<Self> {
        let (program, args) = config.command.split_first()?;
        Some(Self::new(config.name.clone(), program.clone(), args.to_vec()))
    }

    fn io_error(&self, source: std::io::Error) -> TransformError {
        TransformError::Io {
            name: self.name.clone(),
            source,
        }
    }
}

impl ClassTransform for ExecTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn transform(&self, class_bytes: &[u8]) -> Result<Vec<u8>, TransformError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.io_error(e))?;

        // Feed stdin from a helper thread so a child that streams its output
        // while still reading cannot deadlock against us
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.io_error(std::io::Error::other("stdin not captured")))?;
        let output = std::thread::scope(|scope| {
            let writer = scope.spawn(move || stdin.write_all(class_bytes));
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
            (output, written)
        });
        let (output, written) = output;
        let output = output.map_err(|e| self.io_error(e))?;

        if !output.status.success() {
            return Err(TransformError::Failed {
                name: self.name.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        // A child may legitimately exit without draining stdin
        if let Err(e) = written {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(self.io_error(e));
            }
        }
        if output.stdout.is_empty() {
            return Err(TransformError::Rejected {
                name: self.name.clone(),
                reason: "empty output".to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Known transforms, keyed by name
#[derive(Default, Clone)]
pub struct TransformRegistry {
    transforms: HashMap<String, Arc<dyn ClassTransform>>,
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.transforms.keys().collect();
        names.sort();
        f.debug_struct("TransformRegistry").field("transforms", &names).finish()
    }
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every `[[transform]]` from the configuration
    pub fn from_config(transforms: &[ExternalTransform]) -> Result<Self, TransformError> {
        let mut registry = Self::new();
        for config in transforms {
            let exec = ExecTransform::from_config(config).ok_or_else(|| TransformError::Rejected {
                name: config.name.clone(),
                reason: "empty command".to_string(),
            })?;
            registry.register(Arc::new(exec))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, transform: Arc<dyn ClassTransform>) -> Result<(), TransformError> {
        let name = transform.name().to_string();
        if self.transforms.contains_key(&name) {
            return Err(TransformError::Duplicate(name));
        }
        self.transforms.insert(name, transform);
        Ok(())
    }

    /// Resolve an ordered list of names into a chain
    pub fn resolve(&self, names: &[String]) -> Result<TransformChain, TransformError> {
        let steps = names
            .iter()
            .map(|name| {
                self.transforms
                    .get(name)
                    .cloned()
                    .ok_or_else(|| TransformError::Unknown(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(TransformChain { steps })
    }
}

/// Transforms applied in order to every class unit
#[derive(Default, Clone)]
pub struct TransformChain {
    steps: Vec<Arc<dyn ClassTransform>>,
}

impl std::fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl TransformChain {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|t| t.name()).collect()
    }

    pub fn apply(&self, bytes: &[u8]) -> Result<Vec<u8>, TransformError> {
        let mut current = bytes.to_vec();
        for step in &self.steps {
            current = step.transform(&current)?;
        }
        Ok(current)
    }
}
