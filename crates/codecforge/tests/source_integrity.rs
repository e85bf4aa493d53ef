mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use codecforge::ledger::Ledger;
use codecforge::license::Tier;
use codecforge::orchestrator::{Pipeline, TargetSelection, TargetState};
use codecforge::platform::PlatformCatalog;
use codecforge::registry::Registry;
use codecforge::workspace::load_paths;

use common::{AARCH64_OBJECT, FakeToolchain, ctx, ledger_text, opts, settings};

const PLATFORM: &str = "linux-aarch64-musl";

fn entries(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| !n.starts_with('.'))
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn checksum_mismatch_leaves_no_source_tree_and_no_stamp() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mirror = tmp.path().join("mirror");
    fs::create_dir_all(&mirror).expect("mirror");
    let tarball = mirror.join("libogg-1.3.5.tar.gz");
    fs::write(&tarball, b"tampered bytes").expect("tarball");

    let mut raw = ledger_text();
    raw.push_str(&format!(
        "LIBOGG_VERSION=1.3.5\nLIBOGG_URL=file://{}\nLIBOGG_SHA256={}\n",
        tarball.display(),
        "0".repeat(64)
    ));
    let ledger = Ledger::parse("versions.env", &raw).expect("ledger");

    let s = settings(tmp.path());
    let paths = load_paths(&s.workspace, tmp.path()).expect("paths");
    let prefix = paths.prefix(PLATFORM, Tier::Free);
    let stamps = paths.stamps_dir();
    let downloads = paths.downloads_dir();
    let pipeline = Pipeline::new(
        s,
        paths,
        Registry::builtin(),
        ledger,
        PlatformCatalog::builtin(),
        tmp.path().to_path_buf(),
    )
    .with_toolchain(Arc::new(FakeToolchain::new(AARCH64_OBJECT)));

    let report = pipeline.run(
        &opts(PLATFORM, Tier::Free, TargetSelection::Only("libogg".into())),
        &ctx(),
    );

    assert_eq!(report.targets["libogg"].state, TargetState::Failed);
    let err = report.error.expect("error");
    assert_eq!(err.kind(), "SourceIntegrityError");
    assert!(err.to_string().contains("sha256"), "{err}");
    assert!(entries(&prefix.sources_dir()).is_empty(), "{:?}", entries(&prefix.sources_dir()));
    assert!(entries(&stamps).iter().all(|n| !n.ends_with(".json")));
    assert!(entries(&downloads).is_empty(), "{:?}", entries(&downloads));
    assert!(tarball.is_file(), "the mirror copy is untouched");
}
