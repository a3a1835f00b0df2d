#![no_main]

use cronometro::class_rewriter::{ClassOutcome, ClassRewriter};
use cronometro::config::MethodTarget;
use cronometro::eligibility::EligibilityPolicy;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let (Some(clock), Some(sink)) = (
        MethodTarget::parse("java/lang/System.nanoTime()J"),
        MethodTarget::parse("fuzz/Sink.record(J)V"),
    ) else {
        return;
    };
    let rewriter = ClassRewriter::new(EligibilityPolicy::permissive(), clock, sink);

    // Arbitrary bytes must never panic; anything rewritten must parse again
    if let Ok(ClassOutcome::Rewritten { bytes, .. }) = rewriter.rewrite(data) {
        let _ = cronometro::verify::verify_bytes(&bytes);
        assert!(cronometro::classfile::ClassFile::parse(&bytes).is_ok());
    }
});
