#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use codecforge::adapter::{Artifact, BuildRequest, TargetBuilder, link_name, pkgconfig};
use codecforge::config::Settings;
use codecforge::consumer::{ConsumerBuilder, ConsumerRequest};
use codecforge::diagnostic::{Check, Diagnostic, Gate};
use codecforge::error::{Error, Result};
use codecforge::executor::{ExecCtx, NullSink};
use codecforge::ledger::Ledger;
use codecforge::orchestrator::{Pipeline, RunOptions, TargetSelection};
use codecforge::license::Tier;
use codecforge::platform::{PlatformCatalog, PlatformDescriptor};
use codecforge::registry::Registry;
use codecforge::toolchain::{Linkage, Toolchain};
use codecforge::workspace::load_paths;

pub const AARCH64_OBJECT: &str = "ELF 64-bit LSB relocatable, ARM aarch64, version 1 (SYSV)";
pub const X86_64_OBJECT: &str = "ELF 64-bit LSB relocatable, x86-64, version 1 (SYSV)";
pub const AARCH64_EXEC: &str = "ELF 64-bit LSB executable, ARM aarch64, statically linked";

/// Answers every query from the files on disk.
pub struct FakeToolchain {
    pub probe: String,
    /// Packages that resolve no matter where pkg-config is pointed.
    pub leaks: Vec<String>,
    pub linkage: Linkage,
}

impl FakeToolchain {
    pub fn new(probe: &str) -> Self {
        Self {
            probe: probe.to_string(),
            leaks: Vec::new(),
            linkage: Linkage::default(),
        }
    }
}

impl Toolchain for FakeToolchain {
    fn compile_probe(&self, _p: &PlatformDescriptor, scratch: &Path) -> Result<PathBuf> {
        fs::create_dir_all(scratch)?;
        let object = scratch.join("probe.o");
        fs::write(&object, &self.probe)?;
        Ok(object)
    }

    fn describe(&self, _p: &PlatformDescriptor, path: &Path) -> Result<String> {
        Ok(fs::read_to_string(path)?)
    }

    fn pkg_config_resolves(
        &self,
        _p: &PlatformDescriptor,
        name: &str,
        env: &[(String, String)],
    ) -> Result<bool> {
        if self.leaks.iter().any(|l| l == name) {
            return Ok(true);
        }
        let Some((_, dir)) = env.iter().find(|(k, _)| k == "PKG_CONFIG_LIBDIR") else {
            return Ok(false);
        };
        Ok(pkgconfig::unresolved_in_dir(Path::new(dir), name).is_empty())
    }

    fn linkage(&self, _p: &PlatformDescriptor, _binary: &Path) -> Result<Linkage> {
        Ok(self.linkage.clone())
    }
}

/// Installs fake archives and descriptors instead of running upstream builds.
#[derive(Default)]
pub struct FakeBuilder {
    pub object: String,
    /// Targets that "succeed" without installing a `.pc`.
    pub skip_pc: Vec<String>,
    pub fail: Vec<String>,
    pub stamps_dir: PathBuf,
    /// Each invocation with the stamp files present when it started.
    pub calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeBuilder {
    pub fn new(object: &str, stamps_dir: PathBuf) -> Self {
        Self {
            object: object.to_string(),
            stamps_dir,
            ..Self::default()
        }
    }

    pub fn invoked(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn stamps_seen_by(&self, name: &str) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls")
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s.clone())
            .unwrap_or_default()
    }
}

impl TargetBuilder for FakeBuilder {
    fn resolved_flags(&self, req: &BuildRequest<'_>) -> Vec<String> {
        vec![
            format!("prefix={}", req.prefix.root.display()),
            format!("debug={}", req.debug),
        ]
    }

    fn build(&self, req: &BuildRequest<'_>, _ctx: &mut ExecCtx) -> Result<Artifact> {
        let name = req.target.name().to_string();
        let stamps = list_dir(&self.stamps_dir);
        self.calls.lock().expect("calls").push((name.clone(), stamps));

        if self.fail.contains(&name) {
            return Err(Error::Build(
                Diagnostic::new(Gate::Build, format!("'{name}' failed to compile"))
                    .check(Check::fail("make").with_detail("exit status 2"))
                    .root_cause("injected failure")
                    .fix("none"),
            ));
        }

        let dep = &req.target.dependency;
        let lib_dir = req.prefix.lib_dir();
        fs::create_dir_all(&lib_dir)?;
        let mut static_libs = Vec::new();
        for lib in dep.static_libs {
            let path = lib_dir.join(lib);
            fs::write(&path, &self.object)?;
            static_libs.push(path);
        }

        let pc_dir = req.prefix.pkg_config_dir();
        fs::create_dir_all(&pc_dir)?;
        let pc_file = pkgconfig::pc_path(&pc_dir, dep.pkgconfig_name);
        if !self.skip_pc.contains(&name) {
            let libs: Vec<&str> = dep.static_libs.iter().map(|l| link_name(l)).collect();
            let body = pkgconfig::synthesize(
                dep.pkgconfig_name,
                &req.target.pin.git_ref,
                &req.prefix.root,
                &libs,
                &[],
            );
            fs::write(&pc_file, body)?;
        }
        Ok(Artifact {
            target: name,
            static_libs,
            pc_file,
            synthesized_pc: true,
        })
    }
}

fn list_dir(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    out.sort();
    out
}

/// Writes a binary whose description is `exec`.
pub struct FakeConsumer {
    pub exec: String,
    pub calls: AtomicUsize,
    pub flags: Mutex<Vec<String>>,
}

impl FakeConsumer {
    pub fn new(exec: &str) -> Self {
        Self {
            exec: exec.to_string(),
            calls: AtomicUsize::new(0),
            flags: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ConsumerBuilder for FakeConsumer {
    fn build(&self, req: &ConsumerRequest<'_>, _ctx: &mut ExecCtx) -> Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.flags.lock().expect("flags") = req.flags.to_vec();
        let bin_dir = req.prefix.bin_dir();
        fs::create_dir_all(&bin_dir)?;
        let bin = bin_dir.join(format!("ffmpeg{}", req.platform.executable_suffix()));
        fs::write(&bin, &self.exec)?;
        Ok(bin)
    }
}

pub const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";

/// Every builtin dependency pinned to a commit on a placeholder mirror.
pub fn ledger_text() -> String {
    let mut raw = String::from("# Last updated: 2026-10-01\n");
    for dep in Registry::builtin().all() {
        let stem = dep.ledger_stem();
        raw.push_str(&format!(
            "{stem}_VERSION={COMMIT}\n{stem}_URL=https://mirror.invalid/{}.tar.gz\n",
            dep.name
        ));
    }
    raw
}

pub fn ledger() -> Ledger {
    Ledger::parse("versions.env", &ledger_text()).expect("ledger")
}

/// Settings pointing the consumer at a local checkout inside `root`.
pub fn settings(root: &Path) -> Settings {
    let src = root.join("ffmpeg-src");
    fs::create_dir_all(&src).expect("consumer src");
    fs::write(src.join("configure"), "#!/bin/sh\n").expect("configure");
    let mut s = Settings::default();
    s.consumer.source_dir = Some(src.display().to_string());
    s
}

pub struct Harness {
    pub root: PathBuf,
    pub builder: Arc<FakeBuilder>,
    pub toolchain: Arc<FakeToolchain>,
    pub consumer: Arc<FakeConsumer>,
}

impl Harness {
    pub fn new(root: &Path, probe: &str) -> Self {
        let paths = load_paths(&Settings::default().workspace, root).expect("paths");
        Self {
            root: root.to_path_buf(),
            builder: Arc::new(FakeBuilder::new(AARCH64_OBJECT, paths.stamps_dir())),
            toolchain: Arc::new(FakeToolchain::new(probe)),
            consumer: Arc::new(FakeConsumer::new(AARCH64_EXEC)),
        }
    }

    pub fn pipeline(&self, settings: Settings) -> Pipeline {
        let paths = load_paths(&settings.workspace, &self.root).expect("paths");
        Pipeline::new(
            settings,
            paths,
            Registry::builtin(),
            ledger(),
            PlatformCatalog::builtin(),
            self.root.clone(),
        )
        .with_toolchain(self.toolchain.clone())
        .with_builder(self.builder.clone())
        .with_consumer(self.consumer.clone())
    }
}

pub fn ctx() -> ExecCtx {
    ExecCtx::new(false, Arc::new(NullSink))
}

pub fn opts(platform: &str, tier: Tier, selection: TargetSelection) -> RunOptions {
    RunOptions {
        platform_id: platform.to_string(),
        tier,
        selection,
        debug: false,
        max_parallel: Some(4),
        mode: None,
    }
}
