//! The five verification gates.
//!
//! Gates run in a fixed order: parse (before any I/O), preflight (once per
//! platform), artifact (after each adapter call), aggregate (before the
//! consumer build) and final binary (after it). All of them report through
//! [`Diagnostic`].

use std::fmt;

use regex::Regex;

use crate::diagnostic::{Check, Diagnostic, Gate};
use crate::error::{Error, Result};
use crate::platform::PlatformDescriptor;

pub mod aggregate;
pub mod artifact;
pub mod binary;
pub mod parse;
pub mod preflight;

/// A non-fatal finding surfaced in the run report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub kind: &'static str,
    pub diagnostic: Diagnostic,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "warning ({}): {}", self.kind, self.diagnostic)
    }
}

pub(crate) fn arch_regex(platform: &PlatformDescriptor, gate: Gate) -> Result<Regex> {
    Regex::new(&platform.arch_verify_pattern).map_err(|e| {
        Error::Config(
            Diagnostic::new(gate, format!("bad arch pattern for '{}'", platform.id))
                .check(Check::fail("compile arch_verify_pattern").with_detail(e.to_string()))
                .root_cause("the platform record carries an invalid regular expression")
                .fix(format!("fix platforms.{}.arch_verify_pattern", platform.id)),
        )
    })
}

/// Best-effort arch name from a `file(1)` description, for diagnostics.
pub fn detect_arch(description: &str) -> &'static str {
    let d = description.to_ascii_lowercase();
    if d.contains("aarch64") || d.contains("arm64") {
        "aarch64"
    } else if d.contains("x86-64") || d.contains("x86_64") || d.contains("amd64") {
        "x86_64"
    } else if d.contains("arm") {
        "armv7"
    } else if d.contains("80386") || d.contains("i386") {
        "x86"
    } else if d.contains("risc-v") {
        "riscv64"
    } else {
        "unknown"
    }
}
