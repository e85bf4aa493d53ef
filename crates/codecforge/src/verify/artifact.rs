//! Gate 3: after each adapter call, before the target may be stamped.

use crate::adapter::Artifact;
use crate::adapter::pkgconfig;
use crate::diagnostic::{Check, Diagnostic, Gate};
use crate::error::{Error, Result};
use crate::platform::PlatformDescriptor;
use crate::toolchain::Toolchain;
use crate::verify::{arch_regex, detect_arch};
use crate::workspace::IsolatedPrefix;

pub fn verify_artifact(
    toolchain: &dyn Toolchain,
    platform: &PlatformDescriptor,
    prefix: &IsolatedPrefix,
    artifact: &Artifact,
    pkgconfig_name: &str,
) -> Result<()> {
    let pattern = arch_regex(platform, Gate::Artifact)?;
    let mut checks = Vec::new();
    let mut cause = None;

    for lib in &artifact.static_libs {
        if !lib.is_file() {
            checks.push(
                Check::fail(format!("{} exists", lib.display()))
                    .with_detail("expected a static archive, found nothing"),
            );
            cause.get_or_insert_with(|| {
                "the adapter reported success but did not install the static library (shared-only build or different libdir)".to_string()
            });
            continue;
        }
        checks.push(Check::pass(format!("{} exists", lib.display())));
        let description = toolchain.describe(platform, lib)?;
        if pattern.is_match(&description) {
            checks.push(Check::pass(format!("{} arch", lib.display())));
        } else {
            checks.push(Check::fail(format!("{} arch", lib.display())).with_detail(format!(
                "expected {} (/{}/), actual {} ({description})",
                platform.arch,
                platform.arch_verify_pattern,
                detect_arch(&description)
            )));
            cause.get_or_insert_with(|| {
                "the library was compiled by the wrong compiler; the cross environment did not reach the upstream build".to_string()
            });
        }
    }

    let pc = &artifact.pc_file;
    if pc.is_file() {
        checks.push(Check::pass(format!("{} exists", pc.display())));
        let unresolved = pkgconfig::unresolved_in_dir(&prefix.pkg_config_dir(), pkgconfig_name);
        if unresolved.is_empty() {
            checks.push(Check::pass(format!("'{pkgconfig_name}' resolves in the isolated dir")));
        } else {
            checks.push(
                Check::fail(format!("'{pkgconfig_name}' resolves in the isolated dir"))
                    .with_detail(format!("unresolved: {}", unresolved.join(", "))),
            );
            cause.get_or_insert_with(|| {
                format!("the descriptor requires packages not installed in the prefix ({})", unresolved.join(", "))
            });
        }
        if toolchain.pkg_config_resolves(platform, pkgconfig_name, &prefix.pkg_config_env())? {
            checks.push(Check::pass(format!("{} --exists {pkgconfig_name}", platform.pkg_config)));
        } else {
            checks.push(
                Check::fail(format!("{} --exists {pkgconfig_name}", platform.pkg_config))
                    .with_detail("expected resolution via PKG_CONFIG_LIBDIR only, got none"),
            );
            cause.get_or_insert_with(|| "pkg-config rejects the installed descriptor".to_string());
        }
    } else {
        checks.push(
            Check::fail(format!("{} exists", pc.display()))
                .with_detail("expected a pkg-config descriptor, found nothing"),
        );
        cause.get_or_insert_with(|| {
            "the adapter reported success but no descriptor reached the isolated pkg-config dir".to_string()
        });
    }

    let Some(cause) = cause else {
        return Ok(());
    };
    Err(Error::ArtifactVerification(
        Diagnostic::new(Gate::Artifact, format!("artifact check failed for '{}'", artifact.target))
            .checks(checks)
            .root_cause(cause)
            .fix(format!(
                "inspect the install step of '{}' in its build log; the target is not stamped and will rebuild",
                artifact.target
            )),
    ))
}
