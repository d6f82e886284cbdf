// src/resolver.rs

//! Target resolution
//!
//! Turns requested package or group names into concrete packages:
//! - names resolve against sync databases in priority order, first match wins
//! - members of the exclusive-source groups resolve only from the exclusive
//!   repository, and stay unresolved if it lacks them
//! - a name that is not a package is tried as a group and expanded
//! - anything listed in `conflicts` is dropped
//!
//! Resolution has no side effects on any transaction and an unresolved name
//! never stops the remaining names from resolving.

use crate::config::ExclusiveSource;
use crate::engine::{Database, Package};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, warn};

/// A resolved package and the repository it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub package: Package,
    pub repository: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Resolved targets keyed by package name
    pub targets: BTreeMap<String, Target>,
    /// Requested names that matched neither a package nor a group
    pub unresolved: Vec<String>,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn names(&self) -> Vec<&str> {
        self.targets.keys().map(String::as_str).collect()
    }

    pub fn into_packages(self) -> Vec<Package> {
        self.targets.into_values().map(|t| t.package).collect()
    }
}

pub struct Resolver<'a> {
    databases: Vec<&'a dyn Database>,
    exclusive: Option<&'a ExclusiveSource>,
}

impl<'a> Resolver<'a> {
    /// Create a resolver over sync databases in priority order
    pub fn new(databases: Vec<&'a dyn Database>) -> Self {
        Self {
            databases,
            exclusive: None,
        }
    }

    pub fn with_exclusive(mut self, exclusive: Option<&'a ExclusiveSource>) -> Self {
        self.exclusive = exclusive;
        self
    }

    fn exclusive_database(&self) -> Option<&'a dyn Database> {
        let exclusive = self.exclusive?;
        self.databases
            .iter()
            .copied()
            .find(|db| db.name() == exclusive.repository)
    }

    /// Union of the exclusive groups' members, as defined by the exclusive repository
    pub fn exclusive_set(&self) -> BTreeSet<String> {
        let Some(exclusive) = self.exclusive else {
            return BTreeSet::new();
        };
        let Some(db) = self.exclusive_database() else {
            warn!(
                "Exclusive repository {} is not configured, ignoring exclusive groups",
                exclusive.repository
            );
            return BTreeSet::new();
        };

        exclusive
            .groups
            .iter()
            .filter_map(|group| db.group(group))
            .flat_map(|group| group.packages)
            .collect()
    }

    /// Resolve `names`, dropping anything listed in `conflicts`
    pub fn resolve(&self, names: &[String], conflicts: &HashSet<String>) -> Resolution {
        let exclusive_set = self.exclusive_set();
        let exclusive_db = self.exclusive_database();
        let mut resolution = Resolution::default();

        for name in names {
            let scope: Vec<&'a dyn Database> = if exclusive_set.contains(name) {
                debug!("{} must come from the exclusive repository", name);
                exclusive_db.into_iter().collect()
            } else {
                self.databases.clone()
            };

            if let Some((package, db)) = find_package(&scope, name) {
                add_target(&mut resolution, package, db, conflicts);
                continue;
            }

            let Some((group, db)) = scope
                .iter()
                .find_map(|db| db.group(name).map(|group| (group, *db)))
            else {
                warn!("Can't find a package or group called '{}'", name);
                resolution.unresolved.push(name.clone());
                continue;
            };

            debug!(
                "Expanding group {} from {} ({} members)",
                group.name,
                db.name(),
                group.packages.len()
            );
            for member in &group.packages {
                let member_db = if exclusive_set.contains(member) {
                    exclusive_db
                } else {
                    Some(db)
                };
                match member_db.and_then(|db| db.package(member).map(|pkg| (pkg, db))) {
                    Some((package, db)) => add_target(&mut resolution, package, db, conflicts),
                    None => {
                        warn!("Group {} member {} not found", group.name, member);
                        resolution.unresolved.push(member.clone());
                    }
                }
            }
        }

        resolution
    }
}

fn find_package<'a>(scope: &[&'a dyn Database], name: &str) -> Option<(Package, &'a dyn Database)> {
    scope
        .iter()
        .find_map(|db| db.package(name).map(|pkg| (pkg, *db)))
}

fn add_target(
    resolution: &mut Resolution,
    package: Package,
    db: &dyn Database,
    conflicts: &HashSet<String>,
) {
    if conflicts.contains(&package.name) {
        debug!("Skipping {}: listed as a conflict", package.name);
        return;
    }

    resolution
        .targets
        .entry(package.name.clone())
        .or_insert_with(|| Target {
            package,
            repository: db.name().to_string(),
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;
    use crate::engine::memory::{Catalog, MemoryEngine, RepositoryCatalog};
    use crate::engine::{Engine, Package};

    fn versioned(name: &str, version: &str) -> Package {
        Package::new(name, version)
    }

    fn catalog() -> Vec<RepositoryCatalog> {
        vec![
            RepositoryCatalog::new("core")
                .with_package(versioned("bash", "5.2-core"))
                .with_package(versioned("glibc", "2.39-core"))
                .with_package(versioned("vim", "9.1-core"))
                .with_group("base", ["bash", "glibc"]),
            RepositoryCatalog::new("extra")
                .with_package(versioned("vim", "9.1-extra"))
                .with_package(versioned("mate-panel", "1.28-extra"))
                .with_package(versioned("firefox", "130-extra"))
                .with_group("mate", ["mate-panel"]),
            RepositoryCatalog::new("desktop")
                .with_package(versioned("caja", "1.28-desktop"))
                .with_package(versioned("firefox", "130-desktop"))
                .with_group("mate", ["mate-panel", "caja"])
                .with_group("cinnamon", ["nemo"]),
        ]
    }

    fn engine(order: &[&str]) -> MemoryEngine {
        let mut engine = MemoryEngine::new(Catalog {
            repositories: catalog(),
            installed: Vec::new(),
        });
        for name in order {
            engine
                .register_sync_database(&RepositoryConfig::new(*name))
                .unwrap();
        }
        engine
    }

    fn exclusive() -> ExclusiveSource {
        ExclusiveSource {
            repository: "desktop".to_string(),
            groups: vec!["cinnamon".to_string(), "mate".to_string(), "mate-extra".to_string()],
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Every ordering of the three repositories
    fn orders() -> Vec<[&'static str; 3]> {
        let repos = ["core", "extra", "desktop"];
        let mut orders = Vec::new();
        for a in 0..3 {
            for b in 0..3 {
                for c in 0..3 {
                    if a != b && b != c && a != c {
                        orders.push([repos[a], repos[b], repos[c]]);
                    }
                }
            }
        }
        orders
    }

    #[test]
    fn test_priority_order_respected() {
        for order in orders() {
            let engine = engine(&order);
            let resolver = Resolver::new(engine.sync_databases());
            let resolution = resolver.resolve(&names(&["vim", "firefox"]), &HashSet::new());

            let first_with = |pkg: &str, candidates: &[&str]| {
                order
                    .iter()
                    .find(|repo| candidates.contains(repo))
                    .map(|repo| (pkg.to_string(), repo.to_string()))
            };
            let expected_vim = first_with("vim", &["core", "extra"]).unwrap();
            let expected_firefox = first_with("firefox", &["extra", "desktop"]).unwrap();

            assert_eq!(resolution.targets["vim"].repository, expected_vim.1);
            assert_eq!(resolution.targets["firefox"].repository, expected_firefox.1);
            assert!(resolution.unresolved.is_empty());
        }
    }

    #[test]
    fn test_exclusive_names_never_leave_exclusive_repository() {
        let exclusive = exclusive();
        for order in orders() {
            let engine = engine(&order);
            let resolver = Resolver::new(engine.sync_databases()).with_exclusive(Some(&exclusive));

            let resolution =
                resolver.resolve(&names(&["mate-panel", "caja", "nemo", "vim"]), &HashSet::new());

            // mate-panel is only in extra, but it belongs to desktop's mate group
            assert!(!resolution.targets.contains_key("mate-panel"));
            assert_eq!(resolution.targets["caja"].repository, "desktop");
            assert!(resolution.unresolved.contains(&"mate-panel".to_string()));
            assert!(resolution.unresolved.contains(&"nemo".to_string()));
            assert!(resolution.targets.contains_key("vim"));
        }
    }

    #[test]
    fn test_exclusive_set_unions_groups() {
        let engine = engine(&["core", "extra", "desktop"]);
        let exclusive = exclusive();
        let resolver = Resolver::new(engine.sync_databases()).with_exclusive(Some(&exclusive));

        let set = resolver.exclusive_set();
        let expected: BTreeSet<String> = ["caja", "mate-panel", "nemo"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(set, expected);
    }

    #[test]
    fn test_missing_exclusive_repository() {
        let engine = engine(&["core", "extra"]);
        let exclusive = exclusive();
        let resolver = Resolver::new(engine.sync_databases()).with_exclusive(Some(&exclusive));

        assert!(resolver.exclusive_set().is_empty());
        let resolution = resolver.resolve(&names(&["mate-panel"]), &HashSet::new());
        assert_eq!(resolution.targets["mate-panel"].repository, "extra");
    }

    #[test]
    fn test_conflicts_never_returned() {
        let engine = engine(&["core", "extra", "desktop"]);
        let resolver = Resolver::new(engine.sync_databases());
        let requested = names(&["base", "vim", "firefox", "caja"]);
        let all = ["bash", "glibc", "vim", "firefox", "caja"];

        for mask in 0..(1u32 << all.len()) {
            let conflicts: HashSet<String> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, name)| name.to_string())
                .collect();

            let resolution = resolver.resolve(&requested, &conflicts);
            for name in resolution.targets.keys() {
                assert!(!conflicts.contains(name));
            }
            assert_eq!(resolution.len(), all.len() - conflicts.len());
        }
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let engine = engine(&["extra", "core", "desktop"]);
        let exclusive = exclusive();
        let resolver = Resolver::new(engine.sync_databases()).with_exclusive(Some(&exclusive));
        let requested = names(&["base", "vim", "caja", "nope", "vim"]);
        let conflicts: HashSet<String> = ["glibc".to_string()].into_iter().collect();

        let first = resolver.resolve(&requested, &conflicts);
        let second = resolver.resolve(&requested, &conflicts);
        assert_eq!(first, second);
        assert_eq!(first.names(), vec!["bash", "caja", "vim"]);
    }

    #[test]
    fn test_group_expansion() {
        let engine = engine(&["core", "extra", "desktop"]);
        let resolver = Resolver::new(engine.sync_databases());
        let resolution = resolver.resolve(&names(&["base"]), &HashSet::new());

        assert_eq!(resolution.names(), vec!["bash", "glibc"]);
        assert!(resolution.targets.values().all(|t| t.repository == "core"));
    }

    #[test]
    fn test_unresolved_does_not_abort() {
        let engine = engine(&["core"]);
        let resolver = Resolver::new(engine.sync_databases());
        let resolution = resolver.resolve(&names(&["nope", "bash", "also-nope"]), &HashSet::new());

        assert_eq!(resolution.names(), vec!["bash"]);
        assert_eq!(resolution.unresolved, names(&["nope", "also-nope"]));
    }

    #[test]
    fn test_everything_filtered_is_empty() {
        let engine = engine(&["core"]);
        let resolver = Resolver::new(engine.sync_databases());
        let conflicts: HashSet<String> = ["bash".to_string()].into_iter().collect();
        let resolution = resolver.resolve(&names(&["bash", "nope"]), &conflicts);
        assert!(resolution.is_empty());
    }
}
