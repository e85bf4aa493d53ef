mod common;

use codecforge::ledger::Ledger;
use codecforge::license::Tier;
use codecforge::orchestrator::{Stage, TargetSelection, TargetState};
use codecforge::toolchain::Linkage;

use common::{AARCH64_OBJECT, Harness, X86_64_OBJECT, ctx, opts, settings};

const PLATFORM: &str = "linux-aarch64-musl";

#[test]
fn full_run_reaches_done_and_stamps_every_target() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), AARCH64_OBJECT);
    let report = h
        .pipeline(settings(tmp.path()))
        .run(&opts(PLATFORM, Tier::Free, TargetSelection::All), &ctx());

    assert!(report.is_success(), "{report}\n{:?}", report.error);
    assert_eq!(
        report.stages,
        vec![
            Stage::Idle,
            Stage::ResolvingActiveSet,
            Stage::BuildingDependencies,
            Stage::AggregateVerifying,
            Stage::BuildingConsumer,
            Stage::FinalVerifying,
            Stage::Done,
        ]
    );
    assert!(report.targets.values().all(|t| t.state == TargetState::Stamped));
    assert!(report.targets.contains_key("svt-av1"));
    assert!(report.binary.is_some());
    assert_eq!(h.consumer.call_count(), 1);
}

#[test]
fn mutable_ref_is_rejected_with_fix() {
    let err = Ledger::parse(
        "versions.env",
        "# Last updated: 2026-10-01\nX264_VERSION=stable\nX264_URL=https://code.videolan.org/videolan/x264.git\n",
    )
    .expect_err("stable is mutable");
    assert_eq!(err.kind(), "InvalidRefError");
    let text = err.to_string();
    assert!(text.contains("\"stable\""), "{text}");
    assert!(text.contains("commit hash"), "{text}");
}

#[test]
fn unsupported_encoder_is_dropped_with_its_switch() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), AARCH64_OBJECT);
    let plan = h
        .pipeline(settings(tmp.path()))
        .plan("linux-armv7-gnu", Tier::Free)
        .expect("plan");

    assert!(!plan.active.contains("svt-av1"));
    assert!(plan.active.is_dropped("svt-av1"));
    assert!(!plan.order.iter().any(|n| n == "svt-av1"));
    assert!(!plan.consumer_flags.iter().any(|f| f == "--enable-libsvtav1"));
    assert!(plan.consumer_flags.iter().any(|f| f == "--enable-libdav1d"));
}

#[test]
fn host_compiler_aborts_before_any_codec_build() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), X86_64_OBJECT);
    let report = h
        .pipeline(settings(tmp.path()))
        .run(&opts(PLATFORM, Tier::Free, TargetSelection::All), &ctx());

    assert_eq!(report.stage(), Stage::Failed);
    assert!(!report.stages.contains(&Stage::BuildingDependencies));
    assert!(h.builder.invoked().is_empty());
    let err = report.error.expect("error");
    assert_eq!(err.kind(), "ToolchainError");
    let text = err.to_string();
    assert!(text.contains("x86_64"), "{text}");
    assert!(text.contains("aarch64"), "{text}");
    assert!(text.contains("Root cause:"), "{text}");
}

#[test]
fn missing_descriptor_fails_only_that_target() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut h = Harness::new(tmp.path(), AARCH64_OBJECT);
    let builder = std::sync::Arc::get_mut(&mut h.builder).expect("unique builder");
    builder.skip_pc.push("opus".into());

    let report = h
        .pipeline(settings(tmp.path()))
        .run(&opts(PLATFORM, Tier::Free, TargetSelection::All), &ctx());

    assert_eq!(report.stage(), Stage::Failed);
    assert_eq!(report.targets["opus"].state, TargetState::Failed);
    for sibling in ["libogg", "libvorbis", "libvpx", "dav1d", "aom"] {
        assert_eq!(report.targets[sibling].state, TargetState::Stamped, "{sibling}");
    }
    assert!(!report.stages.contains(&Stage::AggregateVerifying));
    assert_eq!(h.consumer.call_count(), 0);

    let err = report.error.expect("error");
    assert_eq!(err.kind(), "ArtifactVerificationError");
    assert!(err.to_string().contains("opus.pc"), "{err}");
}

#[test]
fn unmapped_consumer_package_fails_before_consumer_build() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), AARCH64_OBJECT);
    let mut s = settings(tmp.path());
    s.consumer.extra_pkgconfig = vec!["zimg".into()];

    let report = h
        .pipeline(s)
        .run(&opts(PLATFORM, Tier::Free, TargetSelection::All), &ctx());

    assert_eq!(h.consumer.call_count(), 0);
    let err = report.error.expect("error");
    assert_eq!(err.kind(), "MissingDependencyError");
    let text = err.to_string();
    assert!(text.contains("zimg"), "{text}");
    assert!(text.contains("ogg, opus"), "present .pc files listed: {text}");
}

#[test]
fn static_binary_with_interpreter_is_a_linkage_violation() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut h = Harness::new(tmp.path(), AARCH64_OBJECT);
    std::sync::Arc::get_mut(&mut h.toolchain)
        .expect("unique toolchain")
        .linkage = Linkage {
        interpreter: Some("/lib/ld-musl-aarch64.so.1".into()),
        needed: vec!["libc.musl-aarch64.so.1".into()],
    };

    let report = h
        .pipeline(settings(tmp.path()))
        .run(&opts(PLATFORM, Tier::Free, TargetSelection::All), &ctx());

    assert_eq!(h.consumer.call_count(), 1);
    assert!(report.stages.contains(&Stage::FinalVerifying));
    let err = report.error.expect("error");
    assert_eq!(err.kind(), "LinkageViolationError");
    let text = err.to_string();
    assert!(text.contains("/lib/ld-musl-aarch64.so.1"), "{text}");
    assert!(text.contains("not fully static"), "{text}");
}

#[test]
fn leaking_pkg_config_is_a_warning_unless_strict() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut h = Harness::new(tmp.path(), AARCH64_OBJECT);
    std::sync::Arc::get_mut(&mut h.toolchain)
        .expect("unique toolchain")
        .leaks = vec!["glib-2.0".into()];

    let report = h
        .pipeline(settings(tmp.path()))
        .run(&opts(PLATFORM, Tier::Free, TargetSelection::Codecs), &ctx());
    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].kind, "IsolationLeakWarning");

    let mut strict = settings(tmp.path());
    strict.build.strict_isolation = true;
    let report = h
        .pipeline(strict)
        .run(&opts(PLATFORM, Tier::Free, TargetSelection::Codecs), &ctx());
    assert_eq!(report.error.expect("error").kind(), "IsolationLeakError");
}

#[test]
fn single_target_builds_only_its_prerequisites() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), AARCH64_OBJECT);
    let report = h.pipeline(settings(tmp.path())).run(
        &opts(PLATFORM, Tier::Free, TargetSelection::Only("libvorbis".into())),
        &ctx(),
    );

    assert!(report.is_success(), "{:?}", report.error);
    let names: Vec<&str> = report.targets.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["libogg", "libvorbis"]);
    assert!(!report.stages.contains(&Stage::AggregateVerifying));
    assert_eq!(h.consumer.call_count(), 0);
}

#[test]
fn target_outside_tier_is_explained() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let h = Harness::new(tmp.path(), AARCH64_OBJECT);
    let report = h.pipeline(settings(tmp.path())).run(
        &opts(PLATFORM, Tier::Free, TargetSelection::Only("x264".into())),
        &ctx(),
    );
    let err = report.error.expect("error");
    assert_eq!(err.kind(), "UnknownDependencyError");
    assert!(err.to_string().contains("--tier=gpl"), "{err}");
    assert!(h.builder.invoked().is_empty());
}

#[test]
fn triage_mode_collects_every_failure() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut h = Harness::new(tmp.path(), AARCH64_OBJECT);
    let builder = std::sync::Arc::get_mut(&mut h.builder).expect("unique builder");
    builder.fail = vec!["opus".into(), "dav1d".into()];
    builder.skip_pc.push("libogg".into());

    let mut o = opts(PLATFORM, Tier::Free, TargetSelection::All);
    o.mode = Some(codecforge::config::BuildMode::Triage);
    let report = h.pipeline(settings(tmp.path())).run(&o, &ctx());

    assert_eq!(report.targets["libvorbis"].blocked_by.as_deref(), Some("libogg"));
    assert!(!h.builder.invoked().contains(&"libvorbis".to_string()));
    assert_eq!(report.targets["libvpx"].state, TargetState::Stamped);
    match report.error.expect("error") {
        codecforge::Error::Batch(errors) => {
            let kinds: Vec<&str> = errors.iter().map(|e| e.kind()).collect();
            assert_eq!(kinds.len(), 3, "{kinds:?}");
            assert!(kinds.contains(&"BuildError"));
            assert!(kinds.contains(&"ArtifactVerificationError"));
        }
        other => panic!("expected a batch, got {other}"),
    }
}
