//! Static catalog of buildable third-party libraries.

use std::collections::BTreeMap;
use std::fmt;

use crate::diagnostic::{Check, Diagnostic, Gate};
use crate::error::{Error, Result};
use crate::license::Tier;
use crate::platform::PlatformDescriptor;

/// Upstream build system family. Selects the adapter variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildKind {
    Autotools,
    Cmake,
    Meson,
    StaticDownload,
}

impl BuildKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildKind::Autotools => "autotools",
            BuildKind::Cmake => "cmake",
            BuildKind::Meson => "meson",
            BuildKind::StaticDownload => "static-download",
        }
    }
}

impl fmt::Display for BuildKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: &'static str,
    pub kind: BuildKind,
    pub license: Tier,
    /// `None` means every architecture.
    pub arches: Option<&'static [&'static str]>,
    pub pkgconfig_name: &'static str,
    pub rank: u32,
    /// Siblings that must be stamped before this one may start.
    pub requires: &'static [&'static str],
    /// Static archives expected under `<prefix>/lib`.
    pub static_libs: &'static [&'static str],
    pub configure_args: &'static [&'static str],
    pub source_subdir: Option<&'static str>,
    /// Link libraries the upstream `.pc` tends to omit.
    pub private_libs: &'static [&'static str],
    /// Consumer configure switch enabling this library, if any.
    pub consumer_flag: Option<&'static str>,
}

impl Dependency {
    /// Ledger key stem, e.g. `svt-av1` -> `SVT_AV1`.
    pub fn ledger_stem(&self) -> String {
        ledger_stem(self.name)
    }
}

pub fn ledger_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Registry {
    deps: Vec<Dependency>,
}

impl Registry {
    pub fn new(deps: Vec<Dependency>) -> Result<Self> {
        let mut by_name = BTreeMap::<&str, &Dependency>::new();
        for d in &deps {
            if d.pkgconfig_name.trim().is_empty() {
                return Err(Error::msg(format!(
                    "dependency '{}' has no pkg-config name",
                    d.name
                )));
            }
            if by_name.insert(d.name, d).is_some() {
                return Err(Error::msg(format!("duplicate dependency '{}'", d.name)));
            }
        }
        for d in &deps {
            for req in d.requires {
                let Some(pre) = by_name.get(req) else {
                    return Err(Error::msg(format!(
                        "dependency '{}' requires unknown dependency '{req}'",
                        d.name
                    )));
                };
                if pre.rank >= d.rank {
                    return Err(Error::msg(format!(
                        "dependency '{}' (rank {}) requires '{}' (rank {}); prerequisites must have a lower rank",
                        d.name, d.rank, pre.name, pre.rank
                    )));
                }
                if pre.license > d.license {
                    return Err(Error::msg(format!(
                        "dependency '{}' ({}) requires '{}' from the stricter tier {}",
                        d.name, d.license, pre.name, pre.license
                    )));
                }
            }
        }
        Ok(Self { deps })
    }

    pub fn builtin() -> Self {
        Self { deps: catalog() }
    }

    pub fn all(&self) -> &[Dependency] {
        &self.deps
    }

    pub fn get(&self, name: &str) -> Result<&Dependency> {
        self.deps.iter().find(|d| d.name == name).ok_or_else(|| {
            let known = self.deps.iter().map(|d| d.name).collect::<Vec<_>>().join(", ");
            Error::UnknownDependency(
                Diagnostic::new(Gate::Parse, format!("unknown dependency '{name}'"))
                    .check(Check::fail("registry lookup").with_detail(format!("known: {known}")))
                    .root_cause(format!("'{name}' is not in the dependency catalog"))
                    .fix("use one of the known dependency names, or add it to the registry"),
            )
        })
    }

    pub fn supported_on(&self, dep: &Dependency, platform: &PlatformDescriptor) -> bool {
        match dep.arches {
            None => true,
            Some(list) => list.iter().any(|a| *a == platform.arch),
        }
    }

    /// Dependencies licensed within `tier`, by rank then declaration order.
    pub fn by_tier(&self, tier: Tier) -> Vec<&Dependency> {
        let mut out: Vec<&Dependency> = self
            .deps
            .iter()
            .filter(|d| tier.includes(d.license))
            .collect();
        // Stable sort keeps declaration order within a rank.
        out.sort_by_key(|d| d.rank);
        out
    }

    /// `name` plus every transitive prerequisite, in build order.
    pub fn with_prerequisites(&self, name: &str) -> Result<Vec<&'static str>> {
        let mut seen = Vec::<&'static str>::new();
        let mut stack = vec![self.get(name)?.name];
        while let Some(n) = stack.pop() {
            if seen.contains(&n) {
                continue;
            }
            seen.push(n);
            stack.extend(self.get(n)?.requires.iter().copied());
        }
        let mut ordered: Vec<&Dependency> = self
            .deps
            .iter()
            .filter(|d| seen.contains(&d.name))
            .collect();
        ordered.sort_by_key(|d| d.rank);
        Ok(ordered.into_iter().map(|d| d.name).collect())
    }
}

const X86_ARM64: &[&str] = &["x86_64", "aarch64"];

fn catalog() -> Vec<Dependency> {
    vec![
        Dependency {
            name: "libogg",
            kind: BuildKind::Autotools,
            license: Tier::Free,
            arches: None,
            pkgconfig_name: "ogg",
            rank: 0,
            requires: &[],
            static_libs: &["libogg.a"],
            configure_args: &[],
            source_subdir: None,
            private_libs: &[],
            consumer_flag: None,
        },
        Dependency {
            name: "libvorbis",
            kind: BuildKind::Autotools,
            license: Tier::Free,
            arches: None,
            pkgconfig_name: "vorbis",
            rank: 1,
            requires: &["libogg"],
            static_libs: &["libvorbis.a", "libvorbisenc.a"],
            configure_args: &["--disable-examples", "--disable-docs"],
            source_subdir: None,
            private_libs: &["m"],
            consumer_flag: Some("--enable-libvorbis"),
        },
        Dependency {
            name: "opus",
            kind: BuildKind::Autotools,
            license: Tier::Free,
            arches: None,
            pkgconfig_name: "opus",
            rank: 0,
            requires: &[],
            static_libs: &["libopus.a"],
            configure_args: &["--disable-doc", "--disable-extra-programs"],
            source_subdir: None,
            private_libs: &["m"],
            consumer_flag: Some("--enable-libopus"),
        },
        Dependency {
            name: "libvpx",
            kind: BuildKind::Autotools,
            license: Tier::Free,
            arches: None,
            pkgconfig_name: "vpx",
            rank: 0,
            requires: &[],
            static_libs: &["libvpx.a"],
            configure_args: &[
                "--disable-examples",
                "--disable-tools",
                "--disable-docs",
                "--disable-unit-tests",
            ],
            source_subdir: None,
            private_libs: &["m", "pthread"],
            consumer_flag: Some("--enable-libvpx"),
        },
        Dependency {
            name: "dav1d",
            kind: BuildKind::Meson,
            license: Tier::Free,
            arches: None,
            pkgconfig_name: "dav1d",
            rank: 0,
            requires: &[],
            static_libs: &["libdav1d.a"],
            configure_args: &["-Denable_tools=false", "-Denable_tests=false"],
            source_subdir: None,
            private_libs: &["pthread", "dl"],
            consumer_flag: Some("--enable-libdav1d"),
        },
        Dependency {
            name: "aom",
            kind: BuildKind::Cmake,
            license: Tier::Free,
            arches: None,
            pkgconfig_name: "aom",
            rank: 0,
            requires: &[],
            static_libs: &["libaom.a"],
            configure_args: &[
                "-DENABLE_TESTS=0",
                "-DENABLE_DOCS=0",
                "-DENABLE_EXAMPLES=0",
                "-DENABLE_TOOLS=0",
            ],
            source_subdir: None,
            private_libs: &["m", "pthread"],
            consumer_flag: Some("--enable-libaom"),
        },
        Dependency {
            name: "svt-av1",
            kind: BuildKind::Cmake,
            license: Tier::Free,
            arches: Some(X86_ARM64),
            pkgconfig_name: "SvtAv1Enc",
            rank: 0,
            requires: &[],
            static_libs: &["libSvtAv1Enc.a"],
            configure_args: &["-DBUILD_APPS=OFF", "-DBUILD_TESTING=OFF"],
            source_subdir: None,
            private_libs: &["m", "pthread"],
            consumer_flag: Some("--enable-libsvtav1"),
        },
        Dependency {
            name: "nv-codec-headers",
            kind: BuildKind::StaticDownload,
            license: Tier::Free,
            arches: Some(X86_ARM64),
            pkgconfig_name: "ffnvcodec",
            rank: 0,
            requires: &[],
            static_libs: &[],
            configure_args: &[],
            source_subdir: None,
            private_libs: &[],
            consumer_flag: Some("--enable-ffnvcodec"),
        },
        Dependency {
            name: "lame",
            kind: BuildKind::Autotools,
            license: Tier::Lgpl,
            arches: None,
            pkgconfig_name: "mp3lame",
            rank: 0,
            requires: &[],
            static_libs: &["libmp3lame.a"],
            configure_args: &["--disable-frontend", "--disable-decoder"],
            source_subdir: None,
            private_libs: &["m"],
            consumer_flag: Some("--enable-libmp3lame"),
        },
        Dependency {
            name: "x264",
            kind: BuildKind::Autotools,
            license: Tier::Gpl,
            arches: None,
            pkgconfig_name: "x264",
            rank: 0,
            requires: &[],
            static_libs: &["libx264.a"],
            configure_args: &["--disable-cli", "--enable-pic"],
            source_subdir: None,
            private_libs: &["m", "pthread", "dl"],
            consumer_flag: Some("--enable-libx264"),
        },
        Dependency {
            name: "x265",
            kind: BuildKind::Cmake,
            license: Tier::Gpl,
            arches: Some(X86_ARM64),
            pkgconfig_name: "x265",
            rank: 0,
            requires: &[],
            static_libs: &["libx265.a"],
            configure_args: &["-DENABLE_SHARED=OFF", "-DENABLE_CLI=OFF"],
            source_subdir: Some("source"),
            private_libs: &["stdc++", "m", "pthread", "dl"],
            consumer_flag: Some("--enable-libx265"),
        },
    ]
}
