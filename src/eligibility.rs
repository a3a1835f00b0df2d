//! Class and method eligibility for timing instrumentation
//!
//! Rules are evaluated in order and the first match wins:
//! 1. the engine's own runtime classes are never touched
//! 2. denylisted classes are skipped
//! 3. with an inclusion filter, only classes whose simple name carries one of
//!    the configured suffixes remain
//! 4. methods named after their enclosing class are skipped
//!
//! The policy holds no mutable state, so the same inputs always give the same
//! answer and it can be shared freely between worker threads.

use crate::config::{ClassNamedMethods, DenyRule, EligibilityConfig, MatchKind};
use regex::Regex;

/// Why a class or method was left alone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    /// Belongs to the instrumentation runtime itself
    SelfClass,
    /// Matched this denylist pattern
    Denied(String),
    /// Simple name carries none of the inclusion suffixes
    NotIncluded,
    /// Method shares its name with the enclosing class
    ClassNamedMethod,
}

impl std::fmt::Display for Exclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exclusion::SelfClass => write!(f, "instrumentation runtime class"),
            Exclusion::Denied(pattern) => write!(f, "denylisted by `{}`", pattern),
            Exclusion::NotIncluded => write!(f, "no inclusion suffix matched"),
            Exclusion::ClassNamedMethod => write!(f, "method named after its class"),
        }
    }
}

#[derive(Debug, Clone)]
enum Matcher {
    Contains(String),
    Prefix(String),
    Exact(String),
    Suffix(String),
    Regex(Regex),
}

impl Matcher {
    fn compile(rule: &DenyRule) -> Result<Self, regex::Error> {
        let literal = || normalize(&rule.pattern);
        Ok(match rule.kind {
            MatchKind::Contains => Matcher::Contains(literal()),
            MatchKind::Prefix => Matcher::Prefix(literal()),
            MatchKind::Exact => Matcher::Exact(literal()),
            MatchKind::Suffix => Matcher::Suffix(literal()),
            MatchKind::Regex => Matcher::Regex(Regex::new(&rule.pattern)?),
        })
    }

    fn matches(&self, class_name: &str) -> bool {
        match self {
            Matcher::Contains(p) => class_name.contains(p.as_str()),
            Matcher::Prefix(p) => class_name.starts_with(p.as_str()),
            Matcher::Exact(p) => class_name == p,
            Matcher::Suffix(p) => class_name.ends_with(p.as_str()),
            Matcher::Regex(re) => re.is_match(class_name),
        }
    }

    fn pattern(&self) -> &str {
        match self {
            Matcher::Contains(p) | Matcher::Prefix(p) | Matcher::Exact(p) | Matcher::Suffix(p) => p,
            Matcher::Regex(re) => re.as_str(),
        }
    }
}

/// Dotted binary names and internal names are interchangeable in rules
fn normalize(name: &str) -> String {
    name.replace('.', "/")
}

/// Simple class name: the part after the last `/` and `$`
pub fn simple_name(internal_name: &str) -> &str {
    let start = internal_name
        .rfind(['/', '$'])
        .map(|i| i + 1)
        .unwrap_or(0);
    &internal_name[start..]
}

/// Decides which classes and methods receive timing probes
#[derive(Debug, Clone)]
pub struct EligibilityPolicy {
    self_markers: Vec<String>,
    denylist: Vec<Matcher>,
    include_suffixes: Vec<String>,
    class_named_methods: ClassNamedMethods,
}

impl EligibilityPolicy {
    /// Policy that instruments everything except class-named methods
    pub fn permissive() -> Self {
        Self {
            self_markers: Vec::new(),
            denylist: Vec::new(),
            include_suffixes: Vec::new(),
            class_named_methods: ClassNamedMethods::BinarySuffix,
        }
    }

    /// Build the policy; every class in `runtime_owners` (the clock and sink
    /// owners) is treated as a runtime class
    pub fn from_config(
        config: &EligibilityConfig,
        runtime_owners: &[&str],
    ) -> Result<Self, regex::Error> {
        let mut self_markers: Vec<String> = config
            .self_markers
            .iter()
            .filter(|m| !m.is_empty())
            .map(|m| normalize(m))
            .collect();
        for owner in runtime_owners.iter().map(|owner| normalize(owner)) {
            if !self_markers.contains(&owner) {
                self_markers.push(owner);
            }
        }

        let denylist = config
            .denylist
            .iter()
            .map(Matcher::compile)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            self_markers,
            denylist,
            include_suffixes: config.include_suffixes.clone(),
            class_named_methods: config.class_named_methods,
        })
    }

    /// Check a class by internal (or dotted binary) name
    pub fn check_class(&self, class_name: &str) -> Result<(), Exclusion> {
        let name = normalize(class_name);

        if self.self_markers.iter().any(|m| name.contains(m.as_str())) {
            return Err(Exclusion::SelfClass);
        }

        if let Some(rule) = self.denylist.iter().find(|m| m.matches(&name)) {
            return Err(Exclusion::Denied(rule.pattern().to_string()));
        }

        if !self.include_suffixes.is_empty() {
            let simple = simple_name(&name);
            if !self.include_suffixes.iter().any(|s| simple.ends_with(s.as_str())) {
                return Err(Exclusion::NotIncluded);
            }
        }

        Ok(())
    }

    /// Check one method of a class
    pub fn check_method(&self, class_name: &str, method_name: &str) -> Result<(), Exclusion> {
        self.check_class(class_name)?;

        let name = normalize(class_name);
        let class_named = match self.class_named_methods {
            ClassNamedMethods::BinarySuffix => name.ends_with(method_name),
            ClassNamedMethods::SimpleName => simple_name(&name) == method_name,
            ClassNamedMethods::Off => false,
        };
        if class_named {
            return Err(Exclusion::ClassNamedMethod);
        }

        Ok(())
    }

    pub fn is_eligible_class(&self, class_name: &str) -> bool {
        self.check_class(class_name).is_ok()
    }

    pub fn is_eligible_method(&self, class_name: &str, method_name: &str) -> bool {
        self.check_method(class_name, method_name).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(denylist: Vec<DenyRule>) -> EligibilityPolicy {
        let config = EligibilityConfig {
            denylist,
            ..EligibilityConfig::default()
        };
        EligibilityPolicy::from_config(&config, &["com/acme/Clock", "com/acme/Timer"]).unwrap()
    }

    #[test]
    fn test_plain_class_is_eligible() {
        let policy = policy(Vec::new());
        assert!(policy.is_eligible_class("com/example/Foo"));
        assert!(policy.is_eligible_method("com/example/Foo", "run"));
        assert!(policy.is_eligible_method("com/example/Foo", "<init>"));
    }

    #[test]
    fn test_self_markers_and_runtime_owners_excluded() {
        let policy = policy(Vec::new());
        assert_eq!(
            policy.check_class("cronometro/runtime/MethodTimer"),
            Err(Exclusion::SelfClass)
        );
        assert_eq!(policy.check_class("com/acme/Timer"), Err(Exclusion::SelfClass));
        assert_eq!(policy.check_class("com/acme/Clock"), Err(Exclusion::SelfClass));
        assert!(policy.is_eligible_class("com/acme/Calendar"));
    }

    #[test]
    fn test_default_denylist_skips_runtime_namespaces() {
        let policy = EligibilityPolicy::from_config(&EligibilityConfig::default(), &[]).unwrap();
        for name in [
            "kotlin/collections/CollectionsKt",
            "kotlinx/coroutines/Job",
            "org/jetbrains/kotlin/Metadata",
            "cn/thinkingdata/analytics/TDAnalytics",
        ] {
            assert!(
                matches!(policy.check_class(name), Err(Exclusion::Denied(_))),
                "{name}"
            );
        }
        assert!(policy.is_eligible_class("com/example/kotlinish/Foo"));
    }

    #[test]
    fn test_denylist_kinds() {
        let policy = policy(vec![
            DenyRule::new(MatchKind::Prefix, "android.support."),
            DenyRule::new(MatchKind::Exact, "com/example/Gen"),
            DenyRule::new(MatchKind::Suffix, "$$Lambda"),
            DenyRule::new(MatchKind::Contains, "kotlinx"),
            DenyRule::new(MatchKind::Regex, r"^com/example/\w+Binding$"),
        ]);
        assert!(!policy.is_eligible_class("android/support/v4/Fragment"));
        assert!(!policy.is_eligible_class("com/example/Gen"));
        assert!(policy.is_eligible_class("com/example/Generated"));
        assert!(!policy.is_eligible_class("com/example/Foo$$Lambda"));
        assert!(!policy.is_eligible_class("org/jetbrains/kotlinx/Flow"));
        assert!(!policy.is_eligible_class("com/example/MainBinding"));
        assert_eq!(
            policy.check_class("android.support.v4.Fragment"),
            Err(Exclusion::Denied("android/support/".to_string()))
        );
    }

    #[test]
    fn test_include_suffixes_use_simple_name() {
        let config = EligibilityConfig {
            include_suffixes: vec!["Activity".to_string()],
            ..EligibilityConfig::default()
        };
        let policy = EligibilityPolicy::from_config(&config, &[]).unwrap();
        assert!(policy.is_eligible_class("com/app/MainActivity"));
        assert!(policy.is_eligible_class("com/app/Outer$DetailActivity"));
        assert_eq!(
            policy.check_class("com/app/Activity/Helper"),
            Err(Exclusion::NotIncluded)
        );
    }

    #[test]
    fn test_class_named_methods_binary_suffix() {
        let policy = policy(Vec::new());
        // binary name ends with the method name
        assert_eq!(
            policy.check_method("com/example/Foo", "Foo"),
            Err(Exclusion::ClassNamedMethod)
        );
        assert_eq!(
            policy.check_method("com/example/Foo", "oo"),
            Err(Exclusion::ClassNamedMethod)
        );
        assert!(policy.is_eligible_method("com/example/Foo", "bar"));
    }

    #[test]
    fn test_class_named_methods_modes() {
        let mut config = EligibilityConfig {
            class_named_methods: ClassNamedMethods::SimpleName,
            ..EligibilityConfig::default()
        };
        let simple = EligibilityPolicy::from_config(&config, &[]).unwrap();
        assert!(!simple.is_eligible_method("com/example/Foo", "Foo"));
        assert!(simple.is_eligible_method("com/example/Foo", "oo"));

        config.class_named_methods = ClassNamedMethods::Off;
        let off = EligibilityPolicy::from_config(&config, &[]).unwrap();
        assert!(off.is_eligible_method("com/example/Foo", "Foo"));
    }

    #[test]
    fn test_repeat_evaluation_is_stable() {
        let policy = policy(vec![DenyRule::new(MatchKind::Contains, "Skip")]);
        for name in ["a/Skip", "a/Keep", "cronometro/X"] {
            let first = policy.check_method(name, "m");
            for _ in 0..3 {
                assert_eq!(policy.check_method(name, "m"), first);
            }
        }
    }

    #[test]
    fn test_simple_name() {
        assert_eq!(simple_name("a/b/C"), "C");
        assert_eq!(simple_name("a/b/C$D"), "D");
        assert_eq!(simple_name("Top"), "Top");
    }
}
