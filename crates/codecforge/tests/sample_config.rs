use std::path::PathBuf;

use codecforge::config;
use codecforge::license::Tier;
use codecforge::orchestrator::Pipeline;

fn sample_run_file() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../configs/codecforge.toml")
        .canonicalize()
        .expect("sample run file")
}

#[test]
fn sample_run_file_plans_the_free_tier() {
    let doc = config::load(&sample_run_file()).expect("load");
    let pipeline = Pipeline::from_config(&doc).expect("pipeline");
    let plan = pipeline.plan("linux-x86_64-gnu", Tier::Free).expect("plan");

    let libogg = plan.order.iter().position(|n| n == "libogg").expect("libogg");
    let libvorbis = plan.order.iter().position(|n| n == "libvorbis").expect("libvorbis");
    assert!(libogg < libvorbis);
    assert!(plan.consumer_flags.iter().any(|f| f == "--enable-libsvtav1"));
    assert!(plan.consumer_flags.iter().any(|f| f == "--disable-doc"));
    assert!(plan.dot.contains("\"libogg\" -> \"libvorbis\""), "{}", plan.dot);
}

#[test]
fn gpl_tier_needs_an_x264_pin() {
    let doc = config::load(&sample_run_file()).expect("load");
    let pipeline = Pipeline::from_config(&doc).expect("pipeline");
    let err = pipeline
        .plan("linux-x86_64-gnu", Tier::Gpl)
        .expect_err("x264 is not pinned");
    assert_eq!(err.kind(), "UnknownDependencyError");
    assert!(err.to_string().contains("X264_VERSION"), "{err}");

    let run_file = std::fs::read_to_string(sample_run_file()).expect("run file");
    assert!(
        run_file.contains("--tier gpl") && run_file.contains("X264_VERSION"),
        "run file should point at the missing x264 pin"
    );
}
