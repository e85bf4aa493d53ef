//! License tiers and active-set resolution.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ledger::{Ledger, VersionPin};
use crate::platform::PlatformDescriptor;
use crate::registry::{Dependency, Registry};

/// Tiers are cumulative: `Gpl` includes everything `Lgpl` does, which includes `Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Lgpl,
    Gpl,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Lgpl, Tier::Gpl];

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Lgpl => "lgpl",
            Tier::Gpl => "gpl",
        }
    }

    pub fn includes(self, license: Tier) -> bool {
        license <= self
    }

    /// Consumer configure switches a tier requires.
    pub fn consumer_flags(self) -> &'static [&'static str] {
        match self {
            Tier::Free | Tier::Lgpl => &[],
            Tier::Gpl => &["--enable-gpl"],
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "lgpl" => Ok(Tier::Lgpl),
            "gpl" => Ok(Tier::Gpl),
            other => Err(Error::msg(format!(
                "unknown tier '{other}' (expected free, lgpl or gpl)"
            ))),
        }
    }
}

/// A dependency resolved against a pin and a platform.
#[derive(Debug, Clone)]
pub struct BuildTarget {
    pub dependency: Dependency,
    pub pin: VersionPin,
    pub platform_id: String,
}

impl BuildTarget {
    pub fn name(&self) -> &str {
        self.dependency.name
    }
}

/// Result of resolving (tier, platform) into an ordered list of targets.
#[derive(Debug, Clone, Default)]
pub struct ActiveSet {
    pub targets: Vec<BuildTarget>,
    /// Dependencies that would be active for the tier but were dropped for the platform.
    pub dropped: Vec<DroppedDependency>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedDependency {
    pub name: &'static str,
    pub reason: String,
}

impl ActiveSet {
    pub fn names(&self) -> Vec<&str> {
        self.targets.iter().map(BuildTarget::name).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.targets.iter().any(|t| t.name() == name)
    }

    pub fn get(&self, name: &str) -> Option<&BuildTarget> {
        self.targets.iter().find(|t| t.name() == name)
    }

    pub fn is_dropped(&self, name: &str) -> bool {
        self.dropped.iter().any(|d| d.name == name)
    }
}

/// Compute the ordered active set for `tier` on `platform`.
///
/// Unsupported dependencies are dropped, not rejected. Dependents of a dropped
/// dependency are dropped with it, since they could not link.
pub fn active_set(
    registry: &Registry,
    ledger: &Ledger,
    tier: Tier,
    platform: &PlatformDescriptor,
) -> Result<ActiveSet> {
    let mut out = ActiveSet::default();
    let mut dropped_names = BTreeSet::<&str>::new();

    for dep in registry.by_tier(tier) {
        if !registry.supported_on(dep, platform) {
            debug!(dependency = dep.name, platform = %platform.id, "unsupported on platform; dropped");
            dropped_names.insert(dep.name);
            out.dropped.push(DroppedDependency {
                name: dep.name,
                reason: format!("not supported on arch '{}'", platform.arch),
            });
            continue;
        }
        if let Some(missing) = dep.requires.iter().find(|r| dropped_names.contains(*r)) {
            warn!(
                dependency = dep.name,
                prerequisite = *missing,
                platform = %platform.id,
                "prerequisite dropped for platform; dropping dependent"
            );
            dropped_names.insert(dep.name);
            out.dropped.push(DroppedDependency {
                name: dep.name,
                reason: format!("prerequisite '{missing}' is not available on this platform"),
            });
            continue;
        }
        let pin = ledger.resolve(dep.name)?;
        out.targets.push(BuildTarget {
            dependency: dep.clone(),
            pin,
            platform_id: platform.id.clone(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_ordered_and_cumulative() {
        assert!(Tier::Gpl.includes(Tier::Free));
        assert!(Tier::Gpl.includes(Tier::Lgpl));
        assert!(Tier::Lgpl.includes(Tier::Free));
        assert!(!Tier::Free.includes(Tier::Lgpl));
        assert!(!Tier::Lgpl.includes(Tier::Gpl));
    }

    #[test]
    fn parses_tier_names() {
        assert_eq!("GPL".parse::<Tier>().expect("gpl"), Tier::Gpl);
        assert!("nonfree".parse::<Tier>().is_err());
    }
}
