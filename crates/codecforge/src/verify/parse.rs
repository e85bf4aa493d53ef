//! Gate 1: record validation before any I/O.
//!
//! Ledger refs are checked when the ledger is parsed; this covers the
//! platform record and the pins the active set is about to use.

use crate::diagnostic::{Check, Diagnostic, Gate};
use crate::error::{Error, Result};
use crate::license::ActiveSet;
use crate::platform::{LinkMode, PlatformDescriptor};
use crate::verify::arch_regex;

const KNOWN_OS: &[&str] = &["linux", "macos", "windows"];

pub fn check_platform(platform: &PlatformDescriptor) -> Result<()> {
    let required = [
        ("id", &platform.id),
        ("os", &platform.os),
        ("arch", &platform.arch),
        ("libc", &platform.libc),
        ("cc", &platform.cc),
        ("cxx", &platform.cxx),
        ("arch_verify_pattern", &platform.arch_verify_pattern),
        ("pkg_config", &platform.pkg_config),
    ];
    let mut checks: Vec<Check> = required
        .iter()
        .map(|(field, value)| {
            if value.trim().is_empty() {
                Check::fail(format!("{field} is set")).with_detail("empty")
            } else {
                Check::pass(format!("{field} is set"))
            }
        })
        .collect();

    if !platform.os.is_empty() {
        checks.push(if KNOWN_OS.contains(&platform.os.as_str()) {
            Check::pass("os is known")
        } else {
            Check::fail("os is known").with_detail(format!(
                "'{}' (expected one of {})",
                platform.os,
                KNOWN_OS.join(", ")
            ))
        });
    }
    if !platform.arch_verify_pattern.is_empty() {
        checks.push(match arch_regex(platform, Gate::Parse) {
            Ok(_) => Check::pass("arch_verify_pattern compiles"),
            Err(e) => Check::fail("arch_verify_pattern compiles").with_detail(
                e.diagnostic()
                    .and_then(|d| d.checks.first())
                    .and_then(|c| c.detail.clone())
                    .unwrap_or_default(),
            ),
        });
    }
    if platform.link_mode == LinkMode::Dynamic {
        checks.push(if platform.allowed_system_libs.is_empty() {
            Check::fail("dynamic platform has a system lib allow-list").with_detail("empty")
        } else {
            Check::pass("dynamic platform has a system lib allow-list")
        });
    }

    if checks.iter().all(|c| c.passed) {
        return Ok(());
    }
    let failed: Vec<String> = checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| c.label.clone())
        .collect();
    Err(Error::Config(
        Diagnostic::new(Gate::Parse, format!("platform record '{}' is incomplete", platform.id))
            .checks(checks)
            .root_cause(format!("the record fails: {}", failed.join("; ")))
            .fix(format!(
                "complete [platforms.{}] in the run file or start from a builtin record",
                platform.id
            )),
    ))
}

/// Every active target must carry a pin for its own dependency.
pub fn check_pins(active: &ActiveSet) -> Result<()> {
    for t in &active.targets {
        if t.pin.dependency_name != t.dependency.name {
            return Err(Error::Config(
                Diagnostic::new(Gate::Parse, format!("pin mismatch for '{}'", t.name()))
                    .check(Check::fail("pin belongs to target").with_detail(format!(
                        "pin names '{}'",
                        t.pin.dependency_name
                    )))
                    .root_cause("the ledger key stem maps to a different dependency")
                    .fix(format!("rename the ledger keys to {}_*", t.dependency.ledger_stem())),
            ));
        }
    }
    Ok(())
}
