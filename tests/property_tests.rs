//! Property-based tests for eligibility, entry-name resolution and the
//! rewriter's treatment of ineligible classes

mod utils;

use cronometro::archive::normalize_entry_name;
use cronometro::class_rewriter::{ClassOutcome, ClassRewriter};
use cronometro::config::{DenyRule, EligibilityConfig, MatchKind, MethodTarget};
use cronometro::eligibility::EligibilityPolicy;
use cronometro::report::BuildReport;
use cronometro::transform::TransformChain;
use cronometro::unit::UnitProcessor;
use proptest::prelude::*;
use utils::*;

fn policy(denied: &[String]) -> EligibilityPolicy {
    let config = EligibilityConfig {
        denylist: denied
            .iter()
            .map(|p| DenyRule::new(MatchKind::Contains, p.clone()))
            .collect(),
        ..EligibilityConfig::default()
    };
    EligibilityPolicy::from_config(&config, &[SINK_OWNER]).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_eligibility_is_pure(
        class in "[a-z]{1,4}(/[A-Za-z$]{1,6}){1,3}",
        method in "[a-zA-Z<>]{1,8}",
        denied in prop::collection::vec("[a-z]{1,3}", 0..3),
    ) {
        let policy = policy(&denied);
        let first = (
            policy.check_class(&class),
            policy.check_method(&class, &method),
        );
        for _ in 0..3 {
            let again = (
                policy.check_class(&class),
                policy.check_method(&class, &method),
            );
            prop_assert_eq!(&first, &again);
        }
        // a clone of the policy agrees as well
        let clone = policy.clone();
        prop_assert_eq!(first.0, clone.check_class(&class));
    }

    #[test]
    fn prop_normalized_entries_stay_inside(name in "[a-z./\\\\:]{0,24}") {
        if let Some(parts) = normalize_entry_name(&name) {
            prop_assert!(!parts.is_empty());
            for part in parts {
                prop_assert!(part != ".." && part != "." && !part.is_empty());
                prop_assert!(!part.contains('/') && !part.contains('\\') && !part.contains(':'));
            }
        }
    }

    #[test]
    fn prop_denylisted_class_byte_identical(suffix in "[A-Z][a-z]{0,6}") {
        let name = format!("deny/{}", suffix);
        let bytes = pick_class(&name);
        let rewriter = ClassRewriter::new(
            EligibilityPolicy::from_config(
                &EligibilityConfig {
                    denylist: vec![DenyRule::new(MatchKind::Prefix, "deny/")],
                    ..EligibilityConfig::default()
                },
                &[SINK_OWNER],
            )
            .unwrap(),
            MethodTarget::parse("java/lang/System.nanoTime()J").unwrap(),
            MethodTarget::parse(SINK).unwrap(),
        );
        let outcome = rewriter.rewrite(&bytes).unwrap();
        let is_unchanged = matches!(outcome, ClassOutcome::Unchanged { .. });
        prop_assert!(is_unchanged);

        let processor = UnitProcessor::new(rewriter, TransformChain::default(), true, &[]).unwrap();
        let report = BuildReport::new();
        let out = processor.process_bytes(&format!("{}.class", name), &bytes, &report);
        prop_assert_eq!(out, bytes);
        prop_assert!(!report.has_failed());
    }
}
