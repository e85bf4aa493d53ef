//! Structured failure reports.
//!
//! Every gate reports failures the same way: what failed, the ordered list of
//! checks that were run (with pass/fail), the inferred root cause, and a
//! remediation. The rendered form is part of the public contract, so keep
//! `Display` stable.

use std::fmt;

/// The verification stage a diagnostic originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Gate {
    Parse,
    Preflight,
    Artifact,
    Aggregate,
    FinalBinary,
    /// Failures outside the five gates (fetch, adapter, scheduling).
    Build,
}

impl Gate {
    pub fn label(self) -> &'static str {
        match self {
            Gate::Parse => "gate 1/parse",
            Gate::Preflight => "gate 2/preflight",
            Gate::Artifact => "gate 3/artifact",
            Gate::Aggregate => "gate 4/pre-link",
            Gate::FinalBinary => "gate 5/final-binary",
            Gate::Build => "build",
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub label: String,
    pub passed: bool,
    pub detail: Option<String>,
}

impl Check {
    pub fn pass(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            passed: true,
            detail: None,
        }
    }

    pub fn fail(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            passed: false,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub gate: Gate,
    pub what: String,
    pub checks: Vec<Check>,
    pub root_cause: String,
    pub fix: String,
}

impl Diagnostic {
    pub fn new(gate: Gate, what: impl Into<String>) -> Self {
        Self {
            gate,
            what: what.into(),
            checks: Vec::new(),
            root_cause: String::new(),
            fix: String::new(),
        }
    }

    pub fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    pub fn checks(mut self, checks: impl IntoIterator<Item = Check>) -> Self {
        self.checks.extend(checks);
        self
    }

    pub fn root_cause(mut self, cause: impl Into<String>) -> Self {
        self.root_cause = cause.into();
        self
    }

    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = fix.into();
        self
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}] {}", self.gate, self.what)?;
        writeln!(f, "Diagnosis:")?;
        if self.checks.is_empty() {
            writeln!(f, "  (no checks recorded)")?;
        }
        for (i, c) in self.checks.iter().enumerate() {
            let mark = if c.passed { "PASS" } else { "FAIL" };
            match c.detail.as_deref().filter(|d| !d.is_empty()) {
                Some(d) => writeln!(f, "  {}. [{mark}] {}: {d}", i + 1, c.label)?,
                None => writeln!(f, "  {}. [{mark}] {}", i + 1, c.label)?,
            }
        }
        let cause = if self.root_cause.is_empty() {
            "unknown"
        } else {
            self.root_cause.as_str()
        };
        writeln!(f, "Root cause: {cause}")?;
        let fix = if self.fix.is_empty() {
            "none suggested"
        } else {
            self.fix.as_str()
        };
        write!(f, "Fix: {fix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_four_part_template() {
        let d = Diagnostic::new(Gate::Preflight, "probe architecture mismatch")
            .check(Check::pass("probe compiled"))
            .check(Check::fail("architecture").with_detail("expected aarch64, got x86_64"))
            .root_cause("host compiler used instead of cross compiler")
            .fix("set cc to aarch64-linux-gnu-gcc");
        let text = d.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "[gate 2/preflight] probe architecture mismatch");
        assert_eq!(lines[1], "Diagnosis:");
        assert_eq!(lines[2], "  1. [PASS] probe compiled");
        assert_eq!(
            lines[3],
            "  2. [FAIL] architecture: expected aarch64, got x86_64"
        );
        assert!(lines[4].starts_with("Root cause: host compiler"));
        assert!(lines[5].starts_with("Fix: set cc"));
    }

    #[test]
    fn failed_checks_filters_passes() {
        let d = Diagnostic::new(Gate::Artifact, "x")
            .check(Check::pass("a"))
            .check(Check::fail("b"));
        let failed: Vec<_> = d.failed_checks().map(|c| c.label.as_str()).collect();
        assert_eq!(failed, vec!["b"]);
    }
}
