//! Gate 2: once per platform, before any dependency build.

use tracing::{info, warn};

use crate::diagnostic::{Check, Diagnostic, Gate};
use crate::error::{Error, Result};
use crate::platform::PlatformDescriptor;
use crate::toolchain::Toolchain;
use crate::verify::{Warning, arch_regex, detect_arch};
use crate::workspace::IsolatedPrefix;

/// Compile the probe and check that the compiler emits the platform's arch.
pub fn check_probe_arch(
    toolchain: &dyn Toolchain,
    platform: &PlatformDescriptor,
    prefix: &IsolatedPrefix,
) -> Result<()> {
    let pattern = arch_regex(platform, Gate::Preflight)?;
    let object = toolchain.compile_probe(platform, &prefix.scratch_dir())?;
    let description = toolchain.describe(platform, &object)?;
    if pattern.is_match(&description) {
        info!(platform = %platform.id, "preflight probe architecture ok");
        return Ok(());
    }

    let produced = detect_arch(&description);
    Err(Error::Toolchain(
        Diagnostic::new(
            Gate::Preflight,
            format!(
                "compiler for '{}' produces {produced} objects, expected {}",
                platform.id, platform.arch
            ),
        )
        .check(Check::pass(format!("compile probe with {}", platform.cc)))
        .check(
            Check::fail(format!("probe matches /{}/", platform.arch_verify_pattern))
                .with_detail(format!(
                    "expected {}, got {produced} ({description})",
                    platform.arch
                )),
        )
        .root_cause(if platform.is_cross() {
            format!(
                "'{}' is not a {} cross compiler (a host compiler is likely first on PATH)",
                platform.cc, platform.arch
            )
        } else {
            format!(
                "the native compiler targets {produced}; this platform needs a {} toolchain",
                platform.arch
            )
        })
        .fix(format!(
            "install the {} toolchain or set platforms.{}.cc/cxx to it; no dependency was built",
            platform.arch, platform.id
        )),
    ))
}

/// Any host-only package resolving through the isolated search path means the isolation leaks.
pub fn check_isolation(
    toolchain: &dyn Toolchain,
    platform: &PlatformDescriptor,
    prefix: &IsolatedPrefix,
    probes: &[String],
    strict: bool,
) -> Result<Option<Warning>> {
    let env = prefix.pkg_config_env();
    let mut checks = Vec::new();
    let mut leaked = Vec::new();
    for pkg in probes {
        if toolchain.pkg_config_resolves(platform, pkg, &env)? {
            checks.push(Check::fail(format!("'{pkg}' unresolvable")).with_detail("resolved"));
            leaked.push(pkg.as_str());
        } else {
            checks.push(Check::pass(format!("'{pkg}' unresolvable")));
        }
    }
    if leaked.is_empty() {
        return Ok(None);
    }

    let diagnostic = Diagnostic::new(
        Gate::Preflight,
        format!("pkg-config isolation leaks for '{}'", platform.id),
    )
    .check(Check::pass("search path").with_detail(prefix.pkg_config_dir().display().to_string()))
    .checks(checks)
    .root_cause(format!(
        "{} resolves host packages ({}) despite PKG_CONFIG_LIBDIR; its compiled-in search path or a wrapper script leaks",
        platform.pkg_config,
        leaked.join(", ")
    ))
    .fix("use a target-specific pkg-config (or set platforms.<id>.pkg_config) that honours PKG_CONFIG_LIBDIR");

    if strict {
        return Err(Error::IsolationLeak(diagnostic));
    }
    warn!(platform = %platform.id, leaked = %leaked.join(","), "pkg-config isolation leak");
    Ok(Some(Warning {
        kind: "IsolationLeakWarning",
        diagnostic,
    }))
}
