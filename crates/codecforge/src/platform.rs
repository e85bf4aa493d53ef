//! Per-platform toolchain records.
//!
//! Builtin records cover the supported targets; `[platforms.<id>]` tables in
//! the run file overlay a builtin record key-wise or define a new one.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::config::{self, ConfigDoc};
use crate::diagnostic::{Check, Diagnostic, Gate};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// No dynamic interpreter may be referenced by the final binary.
    #[default]
    Static,
    /// Only `allowed_system_libs` may appear as dynamic dependencies.
    Dynamic,
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkMode::Static => "static",
            LinkMode::Dynamic => "dynamic",
        })
    }
}

fn default_pkg_config() -> String {
    "pkg-config".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PlatformDescriptor {
    pub id: String,
    /// `linux`, `macos` or `windows`.
    pub os: String,
    /// `x86_64`, `aarch64` or `armv7`.
    pub arch: String,
    pub libc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cross_prefix: Option<String>,
    /// Value passed as `--host` to autotools; defaults to the cross prefix without its trailing dash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_triple: Option<String>,
    pub cc: String,
    pub cxx: String,
    pub cflags: Vec<String>,
    pub ldflags: Vec<String>,
    /// Regex matched against `file(1)` output for every produced object.
    pub arch_verify_pattern: String,
    /// Link libraries that may be appended to `Libs.private` of installed `.pc` files.
    pub extra_link_libs: Vec<String>,
    /// Dynamic libraries the final binary may need on a dynamic platform.
    /// An entry ending in `*` matches by prefix.
    pub allowed_system_libs: Vec<String>,
    pub link_mode: LinkMode,
    #[serde(default = "default_pkg_config")]
    pub pkg_config: String,
    /// Overrides `<prefix>/lib/pkgconfig` as the only pkg-config search dir.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pkg_config_search_dir: Option<String>,
}

impl PlatformDescriptor {
    pub fn is_cross(&self) -> bool {
        self.cross_prefix
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty())
    }

    /// Built natively for a foreign arch, i.e. under an emulator.
    pub fn is_emulated(&self) -> bool {
        !self.is_cross() && self.arch != host_arch()
    }

    pub fn host_triple(&self) -> Option<String> {
        if let Some(t) = self.host_triple.as_deref().filter(|t| !t.is_empty()) {
            return Some(t.to_string());
        }
        self.cross_prefix
            .as_deref()
            .map(|p| p.trim().trim_end_matches('-').to_string())
            .filter(|p| !p.is_empty())
    }

    /// A binutils-style tool name for this platform (`ar`, `strip`, `nm`).
    pub fn tool(&self, name: &str) -> String {
        match self.cross_prefix.as_deref().filter(|p| !p.is_empty()) {
            Some(prefix) => format!("{prefix}{name}"),
            None => name.to_string(),
        }
    }

    pub fn executable_suffix(&self) -> &'static str {
        if self.os == "windows" { ".exe" } else { "" }
    }

    /// `CMAKE_SYSTEM_NAME`.
    pub fn cmake_system_name(&self) -> &str {
        match self.os.as_str() {
            "linux" => "Linux",
            "macos" => "Darwin",
            "windows" => "Windows",
            other => other,
        }
    }

    /// Meson `cpu_family`.
    pub fn meson_cpu_family(&self) -> &str {
        match self.arch.as_str() {
            "armv7" => "arm",
            other => other,
        }
    }

    /// Meson `system`.
    pub fn meson_system(&self) -> &str {
        match self.os.as_str() {
            "macos" => "darwin",
            other => other,
        }
    }

    /// Consumer `--arch`.
    pub fn consumer_arch(&self) -> &str {
        match self.arch.as_str() {
            "armv7" => "arm",
            other => other,
        }
    }

    /// Consumer `--target-os`.
    pub fn consumer_target_os(&self) -> &str {
        match self.os.as_str() {
            "macos" => "darwin",
            "windows" => "mingw32",
            other => other,
        }
    }
}

/// The arch name of the machine running the orchestrator, in descriptor vocabulary.
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "arm" => "armv7",
        other => other,
    }
}

#[derive(Debug, Clone)]
pub struct PlatformCatalog {
    records: BTreeMap<String, PlatformDescriptor>,
}

impl PlatformCatalog {
    pub fn builtin() -> Self {
        let records = builtin_records()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        Self { records }
    }

    /// Builtin records with the run file's `[platforms.*]` overlays applied.
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let mut catalog = Self::builtin();
        let Some(tbl) = doc.table_path("platforms") else {
            return Ok(catalog);
        };
        for (id, overlay) in tbl {
            let mut base = match catalog.records.get(id) {
                Some(existing) => Value::try_from(existing).map_err(|e| {
                    Error::msg(format!("failed to encode platform '{id}': {e}"))
                })?,
                None => Value::Table(Default::default()),
            };
            config::merge(&mut base, overlay.clone());
            if let Value::Table(t) = &mut base {
                t.insert("id".into(), Value::String(id.clone()));
            }
            let desc: PlatformDescriptor = base.try_into().map_err(|e| {
                Error::Config(
                    Diagnostic::new(Gate::Parse, format!("invalid platform record '{id}'"))
                        .check(Check::fail("decode [platforms.*] table").with_detail(format!("{e}")))
                        .root_cause("the platform table does not match the descriptor schema")
                        .fix(format!(
                            "correct [platforms.{id}] in {}",
                            doc.path.display()
                        )),
                )
            })?;
            catalog.records.insert(id.clone(), desc);
        }
        Ok(catalog)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = &PlatformDescriptor> {
        self.records.values()
    }

    pub fn get(&self, id: &str) -> Result<&PlatformDescriptor> {
        self.records.get(id).ok_or_else(|| {
            let known = self.ids().collect::<Vec<_>>().join(", ");
            Error::Config(
                Diagnostic::new(Gate::Parse, format!("unknown platform '{id}'"))
                    .check(Check::fail("platform lookup").with_detail(format!("known: {known}")))
                    .root_cause(format!("no builtin or configured record is named '{id}'"))
                    .fix("pick a listed platform id or add a [platforms.<id>] table"),
            )
        })
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

const GLIBC_COMMON: &[&str] = &[
    "libc.so.6",
    "libm.so.6",
    "libpthread.so.0",
    "libdl.so.2",
    "librt.so.1",
    "libstdc++.so.6",
    "libgcc_s.so.1",
];

fn glibc_allowed(loader: &str) -> Vec<String> {
    let mut out = strings(GLIBC_COMMON);
    out.push(loader.to_string());
    out
}

fn linux_gnu(
    arch: &str,
    cross_prefix: Option<&str>,
    pattern: &str,
    cflags: &[&str],
    loader: &str,
) -> PlatformDescriptor {
    let prefix = cross_prefix.unwrap_or("");
    PlatformDescriptor {
        id: format!("linux-{arch}-gnu"),
        os: "linux".into(),
        arch: arch.into(),
        libc: "gnu".into(),
        cross_prefix: cross_prefix.map(str::to_string),
        host_triple: None,
        cc: format!("{prefix}gcc"),
        cxx: format!("{prefix}g++"),
        cflags: strings(cflags),
        ldflags: Vec::new(),
        arch_verify_pattern: pattern.into(),
        extra_link_libs: strings(&["pthread", "m", "dl", "stdc++"]),
        allowed_system_libs: glibc_allowed(loader),
        link_mode: LinkMode::Dynamic,
        pkg_config: default_pkg_config(),
        pkg_config_search_dir: None,
    }
}

fn linux_musl(arch: &str, pattern: &str) -> PlatformDescriptor {
    let prefix = format!("{arch}-linux-musl-");
    PlatformDescriptor {
        id: format!("linux-{arch}-musl"),
        os: "linux".into(),
        arch: arch.into(),
        libc: "musl".into(),
        cc: format!("{prefix}gcc"),
        cxx: format!("{prefix}g++"),
        cross_prefix: Some(prefix),
        host_triple: None,
        cflags: strings(&["-O2", "-fPIC"]),
        ldflags: strings(&["-static"]),
        arch_verify_pattern: pattern.into(),
        extra_link_libs: strings(&["pthread", "m", "stdc++"]),
        allowed_system_libs: Vec::new(),
        link_mode: LinkMode::Static,
        pkg_config: default_pkg_config(),
        pkg_config_search_dir: None,
    }
}

const X86_64_PATTERN: &str = "x86-64|x86_64";
const AARCH64_PATTERN: &str = "aarch64|ARM aarch64|arm64";

fn builtin_records() -> Vec<PlatformDescriptor> {
    vec![
        linux_gnu(
            "x86_64",
            None,
            X86_64_PATTERN,
            &["-O2", "-fPIC"],
            "ld-linux-x86-64.so.2",
        ),
        linux_gnu(
            "aarch64",
            Some("aarch64-linux-gnu-"),
            AARCH64_PATTERN,
            &["-O2", "-fPIC"],
            "ld-linux-aarch64.so.1",
        ),
        PlatformDescriptor {
            host_triple: Some("arm-linux-gnueabihf".into()),
            ..linux_gnu(
                "armv7",
                Some("arm-linux-gnueabihf-"),
                "ARM, EABI5|ARM,",
                &["-O2", "-fPIC", "-march=armv7-a", "-mfpu=neon", "-mfloat-abi=hard"],
                "ld-linux-armhf.so.3",
            )
        },
        linux_musl("x86_64", X86_64_PATTERN),
        linux_musl("aarch64", AARCH64_PATTERN),
        PlatformDescriptor {
            id: "macos-arm64".into(),
            os: "macos".into(),
            arch: "aarch64".into(),
            libc: "darwin".into(),
            cross_prefix: None,
            host_triple: Some("aarch64-apple-darwin".into()),
            cc: "clang".into(),
            cxx: "clang++".into(),
            cflags: strings(&["-O2", "-arch", "arm64", "-mmacosx-version-min=11.0"]),
            ldflags: strings(&["-arch", "arm64"]),
            arch_verify_pattern: "arm64".into(),
            extra_link_libs: strings(&["c++", "m"]),
            allowed_system_libs: strings(&[
                "/usr/lib/libSystem.B.dylib",
                "/usr/lib/libc++.1.dylib",
                "/usr/lib/libz.1.dylib",
                "/usr/lib/libiconv.2.dylib",
                "/System/Library/Frameworks/*",
            ]),
            link_mode: LinkMode::Dynamic,
            pkg_config: default_pkg_config(),
            pkg_config_search_dir: None,
        },
        PlatformDescriptor {
            id: "windows-x86_64".into(),
            os: "windows".into(),
            arch: "x86_64".into(),
            libc: "mingw".into(),
            cross_prefix: Some("x86_64-w64-mingw32-".into()),
            host_triple: None,
            cc: "x86_64-w64-mingw32-gcc".into(),
            cxx: "x86_64-w64-mingw32-g++".into(),
            cflags: strings(&["-O2"]),
            ldflags: strings(&["-static", "-static-libgcc", "-static-libstdc++"]),
            // probe objects and archive members are COFF, the final binary is PE32+
            arch_verify_pattern: "PE32\\+.*x86-64|(amd64|x86-64) COFF".into(),
            extra_link_libs: strings(&["ws2_32", "bcrypt", "stdc++", "pthread"]),
            allowed_system_libs: strings(&[
                "KERNEL32.dll",
                "msvcrt.dll",
                "USER32.dll",
                "ADVAPI32.dll",
                "bcrypt.dll",
                "WS2_32.dll",
                "SHELL32.dll",
                "ole32.dll",
                "api-ms-win-*",
            ]),
            link_mode: LinkMode::Dynamic,
            pkg_config: default_pkg_config(),
            pkg_config_search_dir: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_ids_are_present() {
        let cat = PlatformCatalog::builtin();
        let ids: Vec<_> = cat.ids().collect();
        for id in [
            "linux-x86_64-gnu",
            "linux-aarch64-gnu",
            "linux-armv7-gnu",
            "linux-x86_64-musl",
            "linux-aarch64-musl",
            "macos-arm64",
            "windows-x86_64",
        ] {
            assert!(ids.contains(&id), "missing {id}");
        }
    }

    #[test]
    fn overlay_replaces_fields_and_keeps_the_rest() {
        let doc = ConfigDoc::parse(
            "<mem>",
            "[platforms.linux-aarch64-gnu]\ncc = \"clang --target=aarch64-linux-gnu\"\n",
        )
        .expect("doc");
        let cat = PlatformCatalog::from_doc(&doc).expect("catalog");
        let p = cat.get("linux-aarch64-gnu").expect("platform");
        assert_eq!(p.cc, "clang --target=aarch64-linux-gnu");
        assert_eq!(p.cxx, "aarch64-linux-gnu-g++");
        assert_eq!(p.host_triple().as_deref(), Some("aarch64-linux-gnu"));
    }

    #[test]
    fn new_record_can_be_declared() {
        let doc = ConfigDoc::parse(
            "<mem>",
            r#"
[platforms.linux-riscv64-gnu]
os = "linux"
arch = "riscv64"
libc = "gnu"
cross_prefix = "riscv64-linux-gnu-"
cc = "riscv64-linux-gnu-gcc"
cxx = "riscv64-linux-gnu-g++"
arch_verify_pattern = "RISC-V"
link_mode = "dynamic"
"#,
        )
        .expect("doc");
        let cat = PlatformCatalog::from_doc(&doc).expect("catalog");
        let p = cat.get("linux-riscv64-gnu").expect("platform");
        assert_eq!(p.id, "linux-riscv64-gnu");
        assert_eq!(p.pkg_config, "pkg-config");
        assert_eq!(p.tool("ar"), "riscv64-linux-gnu-ar");
        assert!(!p.is_emulated());
    }

    #[test]
    fn unknown_platform_lists_known_ids() {
        let err = PlatformCatalog::builtin().get("beos-ppc").expect_err("unknown");
        assert!(err.to_string().contains("linux-x86_64-gnu"));
    }

    #[test]
    fn native_foreign_arch_is_emulated() {
        let p = PlatformDescriptor {
            arch: if host_arch() == "aarch64" { "x86_64" } else { "aarch64" }.into(),
            ..PlatformDescriptor::default()
        };
        assert!(p.is_emulated());
        let cross = PlatformDescriptor {
            cross_prefix: Some("aarch64-linux-gnu-".into()),
            ..p
        };
        assert!(!cross.is_emulated());
    }
}
