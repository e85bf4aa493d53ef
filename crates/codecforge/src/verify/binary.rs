//! Gate 5: the consumer binary itself.

use std::path::Path;

use crate::diagnostic::{Check, Diagnostic, Gate};
use crate::error::{Error, Result};
use crate::platform::{LinkMode, PlatformDescriptor};
use crate::toolchain::Toolchain;
use crate::verify::{arch_regex, detect_arch};

/// Exact match ignoring case, or prefix match for entries ending in `*`.
pub fn is_allowed(lib: &str, allow: &[String]) -> bool {
    let lib = lib.to_ascii_lowercase();
    allow.iter().any(|a| {
        let a = a.to_ascii_lowercase();
        match a.strip_suffix('*') {
            Some(prefix) => lib.starts_with(prefix),
            None => lib == a,
        }
    })
}

pub fn verify_binary(
    toolchain: &dyn Toolchain,
    platform: &PlatformDescriptor,
    binary: &Path,
) -> Result<()> {
    if !binary.is_file() {
        return Err(Error::LinkageViolation(
            Diagnostic::new(Gate::FinalBinary, "consumer binary is missing")
                .check(Check::fail("binary exists").with_detail(binary.display().to_string()))
                .root_cause("the consumer build finished without installing the expected executable")
                .fix("check consumer.binary and the consumer's install step"),
        ));
    }

    let pattern = arch_regex(platform, Gate::FinalBinary)?;
    let description = toolchain.describe(platform, binary)?;
    let mut checks = vec![Check::pass("binary exists").with_detail(binary.display().to_string())];
    if !pattern.is_match(&description) {
        checks.push(Check::fail("architecture").with_detail(format!(
            "expected {}, actual {} ({description})",
            platform.arch,
            detect_arch(&description)
        )));
        return Err(Error::LinkageViolation(
            Diagnostic::new(Gate::FinalBinary, format!("consumer binary is not {}", platform.arch))
                .checks(checks)
                .root_cause("the consumer was configured for the build host instead of the target")
                .fix("check the --arch/--target-os/--cross-prefix flags in the consumer log"),
        ));
    }
    checks.push(Check::pass("architecture").with_detail(platform.arch.clone()));

    let linkage = toolchain.linkage(platform, binary)?;
    match platform.link_mode {
        LinkMode::Static => {
            let clean = linkage.interpreter.is_none() && linkage.needed.is_empty();
            if clean {
                return Ok(());
            }
            if let Some(interp) = &linkage.interpreter {
                checks.push(Check::fail("no dynamic interpreter").with_detail(interp.clone()));
            } else {
                checks.push(Check::pass("no dynamic interpreter"));
            }
            if !linkage.needed.is_empty() {
                checks.push(
                    Check::fail("no shared library dependencies").with_detail(linkage.needed.join(", ")),
                );
            }
            Err(Error::LinkageViolation(
                Diagnostic::new(
                    Gate::FinalBinary,
                    format!("'{}' build is not fully static", platform.id),
                )
                .checks(checks)
                .root_cause("the final link pulled in the dynamic loader (missing -static, or a shared library was found first)")
                .fix(format!(
                    "add -static to platforms.{}.ldflags and make sure only static archives are in the prefix; the binary may run here but not on the target",
                    platform.id
                )),
            ))
        }
        LinkMode::Dynamic => {
            let rejected: Vec<&str> = linkage
                .needed
                .iter()
                .filter(|l| !is_allowed(l, &platform.allowed_system_libs))
                .map(String::as_str)
                .collect();
            if rejected.is_empty() {
                return Ok(());
            }
            checks.push(
                Check::fail("dynamic deps within allow-list").with_detail(format!(
                    "not allowed: {}",
                    rejected.join(", ")
                )),
            );
            Err(Error::LinkageViolation(
                Diagnostic::new(
                    Gate::FinalBinary,
                    format!("consumer links non-system libraries: {}", rejected.join(", ")),
                )
                .checks(checks)
                .root_cause("a dependency was linked from a shared library instead of the isolated static archive")
                .fix(format!(
                    "remove the shared copies from the search path or extend platforms.{}.allowed_system_libs if they are genuine system libraries",
                    platform.id
                )),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_matches_case_insensitively_and_by_prefix() {
        let allow = vec!["KERNEL32.dll".to_string(), "api-ms-win-*".to_string()];
        assert!(is_allowed("kernel32.dll", &allow));
        assert!(is_allowed("api-ms-win-crt-runtime-l1-1-0.dll", &allow));
        assert!(!is_allowed("libx264-164.dll", &allow));
    }
}
