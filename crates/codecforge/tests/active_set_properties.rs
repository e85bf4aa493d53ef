mod common;

use codecforge::license::{Tier, active_set};
use codecforge::platform::PlatformCatalog;
use codecforge::registry::Registry;

use common::ledger;

#[test]
fn lower_tiers_are_subsets_on_every_platform() {
    let registry = Registry::builtin();
    let ledger = ledger();
    let catalog = PlatformCatalog::builtin();
    for platform in catalog.records() {
        for (i, lower) in Tier::ALL.iter().enumerate() {
            for higher in &Tier::ALL[i..] {
                let a = active_set(&registry, &ledger, *lower, platform).expect("lower");
                let b = active_set(&registry, &ledger, *higher, platform).expect("higher");
                for name in a.names() {
                    assert!(
                        b.contains(name),
                        "{name} in {lower} but not {higher} on {}",
                        platform.id
                    );
                }
            }
        }
    }
}

#[test]
fn unsupported_dependencies_never_appear() {
    let registry = Registry::builtin();
    let ledger = ledger();
    let catalog = PlatformCatalog::builtin();
    for platform in catalog.records() {
        let active = active_set(&registry, &ledger, Tier::Gpl, platform).expect("active");
        for dep in registry.all() {
            if !registry.supported_on(dep, platform) {
                assert!(!active.contains(dep.name), "{} on {}", dep.name, platform.id);
            }
        }
    }
}
