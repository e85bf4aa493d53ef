//! Build adapters: one contract over autotools, CMake, Meson and prebuilt trees.
//!
//! Every adapter fetches (and verifies) the pinned source first, drives the
//! upstream build system into the isolated prefix, then makes sure the
//! prefix holds a `.pc` descriptor for the library. A missing descriptor is
//! synthesized; the private link libraries the platform allows are appended.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::license::BuildTarget;
use crate::platform::PlatformDescriptor;
use crate::registry::BuildKind;
use crate::workspace::{IsolatedPrefix, sanitize_component};

pub mod autotools;
pub mod cmake;
pub mod download;
pub mod fetch;
pub mod meson;
pub mod pkgconfig;

pub use fetch::Fetcher;

/// What a successful adapter run left in the prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub target: String,
    pub static_libs: Vec<PathBuf>,
    pub pc_file: PathBuf,
    pub synthesized_pc: bool,
}

pub struct BuildRequest<'a> {
    pub target: &'a BuildTarget,
    pub platform: &'a PlatformDescriptor,
    pub prefix: &'a IsolatedPrefix,
    pub debug: bool,
    /// Parallel jobs handed to make/ninja for this one target.
    pub jobs: usize,
}

impl BuildRequest<'_> {
    pub fn source_dir(&self) -> PathBuf {
        self.prefix.sources_dir().join(format!(
            "{}-{}",
            sanitize_component(self.target.name()),
            sanitize_component(&self.target.pin.git_ref)
        ))
    }

    pub fn build_dir(&self) -> PathBuf {
        self.prefix.build_dir_for(self.target.name())
    }

    pub fn cflags(&self) -> Vec<String> {
        let mut out = self.platform.cflags.clone();
        if self.debug {
            out.push("-g".into());
        }
        out
    }

    pub fn build_type(&self) -> &'static str {
        if self.debug { "debug" } else { "release" }
    }

    /// Compiler and pkg-config environment shared by every adapter.
    pub fn env(&self) -> Vec<(String, String)> {
        let cflags = self.cflags().join(" ");
        let include = format!("-I{}", self.prefix.include_dir().display());
        let mut ldflags = self.platform.ldflags.clone();
        ldflags.push(format!("-L{}", self.prefix.lib_dir().display()));

        let mut env = vec![
            ("CC".to_string(), self.platform.cc.clone()),
            ("CXX".to_string(), self.platform.cxx.clone()),
            ("CFLAGS".to_string(), cflags.clone()),
            ("CXXFLAGS".to_string(), cflags),
            ("CPPFLAGS".to_string(), include),
            ("LDFLAGS".to_string(), ldflags.join(" ")),
            ("PKG_CONFIG".to_string(), self.platform.pkg_config.clone()),
        ];
        if self.platform.is_cross() {
            env.push(("AR".into(), self.platform.tool("ar")));
            env.push(("RANLIB".into(), self.platform.tool("ranlib")));
            env.push(("STRIP".into(), self.platform.tool("strip")));
        }
        env.extend(self.prefix.pkg_config_env());
        env
    }

    pub fn command(&self, program: impl AsRef<std::ffi::OsStr>, cwd: &Path) -> Command {
        let mut cmd = Command::new(program);
        cmd.current_dir(cwd);
        for (k, v) in self.env() {
            cmd.env(k, v);
        }
        cmd
    }
}

/// Builds one dependency into the isolated prefix.
pub trait TargetBuilder: Send + Sync {
    /// Everything about the build besides name, ref and platform that
    /// changes its output. Feeds the stamp key.
    fn resolved_flags(&self, req: &BuildRequest<'_>) -> Vec<String>;

    fn build(&self, req: &BuildRequest<'_>, ctx: &mut ExecCtx) -> Result<Artifact>;
}

/// The real adapters, dispatched on the dependency's [`BuildKind`].
pub struct SourceAdapters {
    fetcher: Fetcher,
}

impl SourceAdapters {
    pub fn new(downloads_dir: PathBuf, retries: u32, backoff: Duration) -> Self {
        Self {
            fetcher: Fetcher {
                downloads_dir,
                retries,
                backoff,
            },
        }
    }
}

impl TargetBuilder for SourceAdapters {
    fn resolved_flags(&self, req: &BuildRequest<'_>) -> Vec<String> {
        let dep = &req.target.dependency;
        let mut flags = vec![
            format!("kind={}", dep.kind),
            format!("prefix={}", req.prefix.root.display()),
            format!("cc={}", req.platform.cc),
            format!("cxx={}", req.platform.cxx),
            format!("cflags={}", req.cflags().join(" ")),
            format!("ldflags={}", req.platform.ldflags.join(" ")),
            format!("cross={}", req.platform.cross_prefix.as_deref().unwrap_or("")),
            format!("private={}", private_libs(req).join(" ")),
        ];
        flags.extend(match dep.kind {
            BuildKind::Autotools => autotools::configure_args(req),
            BuildKind::Cmake => cmake::configure_args(req, None),
            BuildKind::Meson => meson::setup_args(req, None),
            BuildKind::StaticDownload => Vec::new(),
        });
        flags.push(format!("url={}", req.target.pin.source_url));
        flags.push(format!(
            "sha256={}",
            req.target.pin.checksum.as_deref().unwrap_or("-")
        ));
        flags
    }

    fn build(&self, req: &BuildRequest<'_>, ctx: &mut ExecCtx) -> Result<Artifact> {
        let dep = &req.target.dependency;
        let root = self.fetcher.fetch(&req.target.pin, &req.source_dir(), ctx)?;
        let src = match dep.source_subdir {
            Some(sub) => root.join(sub),
            None => root,
        };
        ctx.log(&format!(
            "{} {} via {} in {}",
            dep.name,
            req.target.pin.git_ref,
            dep.kind,
            src.display()
        ));

        match dep.kind {
            BuildKind::Autotools => autotools::build(req, &src, ctx)?,
            BuildKind::Cmake => cmake::build(req, &src, ctx)?,
            BuildKind::Meson => meson::build(req, &src, ctx)?,
            BuildKind::StaticDownload => download::install(req, &src, ctx)?,
        }

        if ctx.dry_run {
            return Ok(expected_artifact(req, false));
        }
        finish_install(req, ctx)
    }
}

/// Private link libs for this target that the platform allows.
pub fn private_libs(req: &BuildRequest<'_>) -> Vec<String> {
    req.target
        .dependency
        .private_libs
        .iter()
        .filter(|l| req.platform.extra_link_libs.iter().any(|a| a == *l))
        .map(|l| l.to_string())
        .collect()
}

/// `libfoo.a` -> `foo`.
pub fn link_name(archive: &str) -> &str {
    let stem = archive.strip_suffix(".a").unwrap_or(archive);
    stem.strip_prefix("lib").unwrap_or(stem)
}

/// Where a completed build of `req` leaves its archives and descriptor.
pub fn expected_artifact(req: &BuildRequest<'_>, synthesized_pc: bool) -> Artifact {
    let dep = &req.target.dependency;
    Artifact {
        target: dep.name.to_string(),
        static_libs: dep
            .static_libs
            .iter()
            .map(|l| req.prefix.lib_dir().join(l))
            .collect(),
        pc_file: pkgconfig::pc_path(&req.prefix.pkg_config_dir(), dep.pkgconfig_name),
        synthesized_pc,
    }
}

/// Put the `.pc` where the isolated search path expects it, synthesizing it
/// when upstream installed none, and record the platform's private libs.
pub fn finish_install(req: &BuildRequest<'_>, ctx: &ExecCtx) -> Result<Artifact> {
    let dep = &req.target.dependency;
    let pc_dir = req.prefix.pkg_config_dir();
    fs::create_dir_all(&pc_dir)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", pc_dir.display())))?;
    let dest = pkgconfig::pc_path(&pc_dir, dep.pkgconfig_name);
    let private = private_libs(req);

    let mut synthesized = false;
    if !dest.is_file() {
        let elsewhere = [
            req.prefix.lib_dir().join("pkgconfig"),
            req.prefix.root.join("share").join("pkgconfig"),
        ]
        .into_iter()
        .map(|d| pkgconfig::pc_path(&d, dep.pkgconfig_name))
        .find(|p| p.is_file());
        match elsewhere {
            Some(found) => {
                debug!(from = %found.display(), to = %dest.display(), "moving .pc into the isolated search dir");
                fs::copy(&found, &dest).map_err(|e| {
                    Error::msg(format!(
                        "failed to copy {} -> {}: {e}",
                        found.display(),
                        dest.display()
                    ))
                })?;
            }
            None => {
                let libs: Vec<&str> = dep.static_libs.iter().map(|l| link_name(l)).collect();
                let body = pkgconfig::synthesize(
                    dep.pkgconfig_name,
                    &req.target.pin.git_ref,
                    &req.prefix.root,
                    &libs,
                    &private,
                );
                fs::write(&dest, body)
                    .map_err(|e| Error::msg(format!("failed to write {}: {e}", dest.display())))?;
                ctx.log(&format!("synthesized {}", dest.display()));
                synthesized = true;
            }
        }
    }
    if !synthesized && pkgconfig::append_private_libs(&dest, &private)? {
        ctx.log(&format!(
            "added Libs.private {} to {}",
            private.join(" "),
            dest.display()
        ));
    }
    Ok(expected_artifact(req, synthesized))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::ledger::VersionPin;
    use crate::license::Tier;
    use crate::registry::Registry;
    use crate::workspace::{WorkspaceConfig, load_paths};

    pub fn target(name: &str) -> BuildTarget {
        let dependency = Registry::builtin().get(name).expect("dep").clone();
        BuildTarget {
            pin: VersionPin {
                dependency_name: name.into(),
                git_ref: "1.2.3".into(),
                source_url: format!("https://example.org/{name}-1.2.3.tar.gz"),
                checksum: None,
            },
            platform_id: "linux-aarch64-gnu".into(),
            dependency,
        }
    }

    pub fn prefix(dir: &Path) -> IsolatedPrefix {
        load_paths(&WorkspaceConfig::default(), dir)
            .expect("paths")
            .prefix("linux-aarch64-gnu", Tier::Gpl)
    }
}
