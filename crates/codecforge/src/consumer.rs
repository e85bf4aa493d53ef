//! The consumer program: configure flags derived from the active set, and its build.
//!
//! Enable switches come only from dependencies that are actually in the active
//! set, so a library dropped for a platform never leaves a dangling switch.

use std::fs;
use std::path::{Path, PathBuf};

use crate::adapter::Fetcher;
use crate::config::ConsumerSettings;
use crate::diagnostic::{Check, Diagnostic, Gate};
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::ledger::Ledger;
use crate::license::{ActiveSet, Tier};
use crate::platform::PlatformDescriptor;
use crate::workspace::{IsolatedPrefix, sanitize_component};

pub struct FlagInputs<'a> {
    pub active: &'a ActiveSet,
    pub platform: &'a PlatformDescriptor,
    pub tier: Tier,
    pub settings: &'a ConsumerSettings,
    pub prefix: &'a IsolatedPrefix,
    pub debug: bool,
}

pub fn consumer_flags(inp: &FlagInputs<'_>) -> Vec<String> {
    let p = inp.platform;
    let mut flags = vec![
        format!("--prefix={}", inp.prefix.root.display()),
        format!("--pkg-config={}", p.pkg_config),
        "--pkg-config-flags=--static".to_string(),
        format!("--cc={}", p.cc),
        format!("--cxx={}", p.cxx),
    ];

    let mut cflags = vec![format!("-I{}", inp.prefix.include_dir().display())];
    cflags.extend(p.cflags.iter().cloned());
    flags.push(format!("--extra-cflags={}", cflags.join(" ")));
    let mut ldflags = vec![format!("-L{}", inp.prefix.lib_dir().display())];
    ldflags.extend(p.ldflags.iter().cloned());
    flags.push(format!("--extra-ldflags={}", ldflags.join(" ")));

    let mut libs: Vec<&str> = Vec::new();
    for t in &inp.active.targets {
        for lib in t.dependency.private_libs {
            if p.extra_link_libs.iter().any(|a| a == lib) && !libs.contains(lib) {
                libs.push(lib);
            }
        }
    }
    if !libs.is_empty() {
        let libs: Vec<String> = libs.iter().map(|l| format!("-l{l}")).collect();
        flags.push(format!("--extra-libs={}", libs.join(" ")));
    }

    if p.is_cross() {
        flags.push("--enable-cross-compile".into());
        if let Some(prefix) = &p.cross_prefix {
            flags.push(format!("--cross-prefix={prefix}"));
        }
        flags.push(format!("--arch={}", p.consumer_arch()));
        flags.push(format!("--target-os={}", p.consumer_target_os()));
    }

    flags.extend(inp.tier.consumer_flags().iter().map(|s| s.to_string()));
    flags.extend(
        inp.active
            .targets
            .iter()
            .filter_map(|t| t.dependency.consumer_flag)
            .map(str::to_string),
    );
    flags.extend(inp.settings.configure_flags.iter().cloned());
    if inp.debug {
        flags.extend(inp.settings.debug_flags.iter().cloned());
    }
    flags
}

/// Locate the consumer source: a ledger pin (fetched like any dependency) or a local checkout.
pub fn resolve_source(
    settings: &ConsumerSettings,
    ledger: &Ledger,
    fetcher: &Fetcher,
    prefix: &IsolatedPrefix,
    base_dir: &Path,
    ctx: &ExecCtx,
) -> Result<PathBuf> {
    if let Some(name) = settings.pin.as_deref().filter(|s| !s.trim().is_empty()) {
        let pin = ledger.resolve(name)?;
        let dest = prefix.sources_dir().join(format!(
            "{}-{}",
            sanitize_component(name),
            sanitize_component(&pin.git_ref)
        ));
        return fetcher.fetch(&pin, &dest, ctx);
    }
    if let Some(dir) = settings.source_dir.as_deref().filter(|s| !s.trim().is_empty()) {
        let path = PathBuf::from(dir.trim());
        let path = if path.is_absolute() {
            path
        } else {
            base_dir.join(path)
        };
        if path.join("configure").is_file() || ctx.dry_run {
            return Ok(path);
        }
        return Err(Error::Config(
            Diagnostic::new(Gate::Parse, format!("{} source tree not usable", settings.name))
                .check(Check::fail("configure script present").with_detail(path.display().to_string()))
                .root_cause("consumer.source_dir does not point at a configured source checkout")
                .fix("point consumer.source_dir at the source root or pin it with consumer.pin"),
        ));
    }
    Err(Error::Config(
        Diagnostic::new(Gate::Parse, format!("no source for {}", settings.name))
            .check(Check::fail("consumer.pin or consumer.source_dir set"))
            .root_cause("the run file names neither a ledger pin nor a local checkout for the consumer")
            .fix("set consumer.pin to a ledger entry or consumer.source_dir to a checkout, or use --target=codecs"),
    ))
}

pub struct ConsumerRequest<'a> {
    pub platform: &'a PlatformDescriptor,
    pub prefix: &'a IsolatedPrefix,
    pub source: &'a Path,
    pub flags: &'a [String],
    pub jobs: usize,
}

pub trait ConsumerBuilder: Send + Sync {
    /// Build and install the consumer, returning the installed binary.
    fn build(&self, req: &ConsumerRequest<'_>, ctx: &mut ExecCtx) -> Result<PathBuf>;
}

/// `configure && make && make install`, out of tree.
pub struct ConfigureMakeConsumer {
    pub name: String,
    pub binary: String,
}

impl ConfigureMakeConsumer {
    pub fn new(settings: &ConsumerSettings) -> Self {
        Self {
            name: settings.name.clone(),
            binary: settings.binary_name().to_string(),
        }
    }
}

impl ConsumerBuilder for ConfigureMakeConsumer {
    fn build(&self, req: &ConsumerRequest<'_>, ctx: &mut ExecCtx) -> Result<PathBuf> {
        let build_dir = req.prefix.build_dir_for(&self.name);
        fs::create_dir_all(&build_dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", build_dir.display())))?;
        let env = req.prefix.pkg_config_env();

        let mut configure = std::process::Command::new(req.source.join("configure"));
        configure.current_dir(&build_dir).args(req.flags).envs(env.clone());
        ctx.run_cmd(configure)?;

        let mut make = std::process::Command::new("make");
        make.current_dir(&build_dir)
            .arg(format!("-j{}", req.jobs.max(1)))
            .envs(env.clone());
        ctx.run_cmd(make)?;

        let mut install = std::process::Command::new("make");
        install.current_dir(&build_dir).arg("install").envs(env);
        ctx.run_cmd(install)?;

        Ok(req
            .prefix
            .bin_dir()
            .join(format!("{}{}", self.binary, req.platform.executable_suffix())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::license::active_set;
    use crate::platform::PlatformCatalog;
    use crate::registry::Registry;
    use crate::workspace::{WorkspaceConfig, load_paths};

    fn ledger() -> Ledger {
        let mut raw = String::from("# Last updated: 2026-10-01\n");
        for dep in Registry::builtin().all() {
            let stem = dep.ledger_stem();
            raw.push_str(&format!(
                "{stem}_VERSION=1.0\n{stem}_URL=https://example.org/{}.tar.gz\n",
                dep.name
            ));
        }
        Ledger::parse("versions.env", &raw).expect("ledger")
    }

    fn flags_for(platform_id: &str, tier: Tier) -> Vec<String> {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cat = PlatformCatalog::builtin();
        let platform = cat.get(platform_id).expect("platform");
        let active = active_set(&Registry::builtin(), &ledger(), tier, platform).expect("active");
        let prefix = load_paths(&WorkspaceConfig::default(), tmp.path())
            .expect("paths")
            .prefix(platform_id, tier);
        consumer_flags(&FlagInputs {
            active: &active,
            platform,
            tier,
            settings: &ConsumerSettings::default(),
            prefix: &prefix,
            debug: false,
        })
    }

    #[test]
    fn dropped_dependency_leaves_no_enable_switch() {
        let armv7 = flags_for("linux-armv7-gnu", Tier::Free);
        assert!(!armv7.iter().any(|f| f == "--enable-libsvtav1"));
        assert!(!armv7.iter().any(|f| f == "--enable-ffnvcodec"));
        assert!(armv7.iter().any(|f| f == "--enable-libdav1d"));

        let x86 = flags_for("linux-x86_64-gnu", Tier::Free);
        assert!(x86.iter().any(|f| f == "--enable-libsvtav1"));
    }

    #[test]
    fn gpl_tier_adds_license_and_codec_switches() {
        let flags = flags_for("linux-x86_64-gnu", Tier::Gpl);
        assert!(flags.iter().any(|f| f == "--enable-gpl"));
        assert!(flags.iter().any(|f| f == "--enable-libx264"));
        assert!(!flags_for("linux-x86_64-gnu", Tier::Lgpl).iter().any(|f| f == "--enable-gpl"));
    }

    #[test]
    fn cross_platforms_get_cross_flags() {
        let flags = flags_for("windows-x86_64", Tier::Free);
        assert!(flags.iter().any(|f| f == "--enable-cross-compile"));
        assert!(flags.iter().any(|f| f == "--cross-prefix=x86_64-w64-mingw32-"));
        assert!(flags.iter().any(|f| f == "--target-os=mingw32"));
        assert!(flags.iter().any(|f| f == "--pkg-config-flags=--static"));
    }
}
