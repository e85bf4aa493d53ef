//! Gate 4: everything the consumer needs must resolve before its build starts.

use std::collections::BTreeSet;

use tracing::info;

use crate::adapter::pkgconfig;
use crate::diagnostic::{Check, Diagnostic, Gate};
use crate::error::{Error, Result};
use crate::license::ActiveSet;
use crate::platform::PlatformDescriptor;
use crate::toolchain::Toolchain;
use crate::workspace::IsolatedPrefix;

/// pkg-config names of the active set followed by the consumer's extras, deduplicated.
pub fn required_names(active: &ActiveSet, extra: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    active
        .targets
        .iter()
        .map(|t| t.dependency.pkgconfig_name.to_string())
        .chain(extra.iter().map(|s| s.trim().to_string()))
        .filter(|n| !n.is_empty() && seen.insert(n.clone()))
        .collect()
}

pub fn verify_aggregate(
    toolchain: &dyn Toolchain,
    platform: &PlatformDescriptor,
    prefix: &IsolatedPrefix,
    required: &[String],
) -> Result<()> {
    let dir = prefix.pkg_config_dir();
    let env = prefix.pkg_config_env();
    let mut checks = Vec::new();
    let mut missing = Vec::new();
    for name in required {
        let unresolved = pkgconfig::unresolved_in_dir(&dir, name);
        let ok = unresolved.is_empty() && toolchain.pkg_config_resolves(platform, name, &env)?;
        if ok {
            checks.push(Check::pass(format!("'{name}' resolves")));
        } else {
            let detail = if unresolved.is_empty() {
                "pkg-config rejects the descriptor".to_string()
            } else {
                format!("unresolved: {}", unresolved.join(", "))
            };
            checks.push(Check::fail(format!("'{name}' resolves")).with_detail(detail));
            missing.push(name.as_str());
        }
    }
    if missing.is_empty() {
        info!(count = required.len(), "all consumer pkg-config names resolve");
        return Ok(());
    }

    let present = pkgconfig::list_pc_files(&dir);
    let present = if present.is_empty() {
        "none".to_string()
    } else {
        present.join(", ")
    };
    Err(Error::MissingDependency(
        Diagnostic::new(
            Gate::Aggregate,
            format!("consumer needs {} unavailable package(s): {}", missing.len(), missing.join(", ")),
        )
        .checks(checks)
        .check(Check::pass(format!("present in {}", dir.display())).with_detail(present))
        .root_cause("a required package has no registry entry active for this tier/platform, or its build did not install it")
        .fix(format!(
            "add the package to the registry and ledger, raise the tier, or drop it from consumer.extra_pkgconfig ({})",
            missing.join(", ")
        )),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extras_follow_active_names_without_duplicates() {
        let extra = vec!["ogg".to_string(), "zimg".to_string(), " ".to_string()];
        assert_eq!(required_names(&ActiveSet::default(), &extra), vec!["ogg", "zimg"]);
    }
}
