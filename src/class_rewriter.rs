//! Class-level driver for the method rewriter

use crate::classfile::{ClassFile, CodeAttribute, ACC_ABSTRACT, ACC_NATIVE};
use crate::config::MethodTarget;
use crate::eligibility::{EligibilityPolicy, Exclusion};
use crate::method_rewriter::{rewrite_method, MethodContext, MethodOutcome, ProbeRefs, Result};

/// Counters for one rewritten class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    pub methods_instrumented: usize,
    pub exit_sites: usize,
    /// Eligible methods left alone by policy or because they have no code
    pub methods_skipped: usize,
    /// Constructors with no initializing `<init>` call
    pub constructors_unanchored: usize,
}

/// Why a class came out byte-identical
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnchangedReason {
    Excluded(Exclusion),
    NoEligibleMethods,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassOutcome {
    Unchanged {
        class_name: String,
        reason: UnchangedReason,
        /// Why individual methods were passed over
        stats: ClassStats,
    },
    Rewritten {
        class_name: String,
        bytes: Vec<u8>,
        stats: ClassStats,
    },
}

impl ClassOutcome {
    pub fn class_name(&self) -> &str {
        match self {
            ClassOutcome::Unchanged { class_name, .. }
            | ClassOutcome::Rewritten { class_name, .. } => class_name,
        }
    }
}

/// Applies timing probes to every eligible method of a class
#[derive(Debug, Clone)]
pub struct ClassRewriter {
    policy: EligibilityPolicy,
    clock: MethodTarget,
    sink: MethodTarget,
}

impl ClassRewriter {
    pub fn new(policy: EligibilityPolicy, clock: MethodTarget, sink: MethodTarget) -> Self {
        Self { policy, clock, sink }
    }

    pub fn policy(&self) -> &EligibilityPolicy {
        &self.policy
    }

    /// Rewrite one class file
    ///
    /// Returns [`ClassOutcome::Unchanged`] when nothing was instrumented; the
    /// caller should then keep the input bytes as they are.
    pub fn rewrite(&self, bytes: &[u8]) -> Result<ClassOutcome> {
        let mut class = ClassFile::parse(bytes)?;
        let class_name = class.name()?.to_string();
        let super_name = class.super_name()?.map(str::to_string);

        if let Err(exclusion) = self.policy.check_class(&class_name) {
            tracing::debug!("{}: skipped ({})", class_name, exclusion);
            return Ok(ClassOutcome::Unchanged {
                class_name,
                reason: UnchangedReason::Excluded(exclusion),
                stats: ClassStats::default(),
            });
        }

        let refs = ProbeRefs::intern(&mut class.constant_pool, &self.clock, &self.sink)?;
        let mut stats = ClassStats::default();

        for index in 0..class.methods.len() {
            let method = &class.methods[index];
            if method.access_flags & (ACC_ABSTRACT | ACC_NATIVE) != 0 {
                continue;
            }
            let Some(code_index) = class.code_index(method) else {
                continue;
            };
            let access_flags = method.access_flags;
            let name = class.member_name(method)?.to_string();
            let descriptor = class.member_descriptor(method)?.to_string();

            if let Err(exclusion) = self.policy.check_method(&class_name, &name) {
                tracing::trace!("{}.{}{}: skipped ({})", class_name, name, descriptor, exclusion);
                stats.methods_skipped += 1;
                continue;
            }

            let code = CodeAttribute::parse(&method.attributes[code_index].info)?;
            let cx = MethodContext {
                class_name: &class_name,
                super_name: super_name.as_deref(),
                access_flags,
                name: &name,
                descriptor: &descriptor,
            };
            match rewrite_method(cx, &code, &mut class.constant_pool, refs)? {
                MethodOutcome::Instrumented { code, exits } => {
                    class.methods[index].attributes[code_index].info = code.to_bytes();
                    stats.methods_instrumented += 1;
                    stats.exit_sites += exits;
                }
                MethodOutcome::Unanchored => stats.constructors_unanchored += 1,
            }
        }

        if stats.methods_instrumented == 0 {
            return Ok(ClassOutcome::Unchanged {
                class_name,
                reason: UnchangedReason::NoEligibleMethods,
                stats,
            });
        }

        tracing::debug!(
            "{}: {} methods instrumented, {} exit sites",
            class_name,
            stats.methods_instrumented,
            stats.exit_sites
        );
        Ok(ClassOutcome::Rewritten {
            class_name,
            bytes: class.to_bytes(),
            stats,
        })
    }
}
