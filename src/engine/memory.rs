// src/engine/memory.rs

//! In-process transaction engine backed by a JSON catalog
//!
//! The catalog lists every repository the engine knows about and the
//! packages currently installed. Repositories become sync databases only
//! once registered, in registration order. Committed transactions update the
//! in-memory local database; nothing touches the filesystem.
//!
//! ```json
//! {
//!   "repositories": [
//!     {"name": "core", "packages": [{"name": "bash", "version": "5.2-1"}],
//!      "groups": {"base": ["bash"]}}
//!   ],
//!   "installed": []
//! }
//! ```

use super::{
    Database, Engine, EngineCallbacks, EngineError, EngineEvent, Group,
    InstallReason, LogLevel, Package, PackageOrigin, ProgressKind, Question, Transaction,
    TransactionFlags,
};
use crate::config::RepositoryConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the local database
pub const LOCAL_DB_NAME: &str = "local";

/// Everything the engine knows before any repository is registered
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub repositories: Vec<RepositoryCatalog>,
    #[serde(default)]
    pub installed: Vec<Package>,
}

impl Catalog {
    pub fn from_json_str(content: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }
}

/// One repository in the catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepositoryCatalog {
    pub name: String,
    #[serde(default)]
    pub packages: Vec<Package>,
    /// Explicit group tables, merged with each package's `groups`
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    /// Refreshing this repository always fails
    #[serde(default)]
    pub offline: bool,
}

impl RepositoryCatalog {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_package(mut self, package: Package) -> Self {
        self.packages.push(package);
        self
    }

    pub fn with_group<I, S>(mut self, name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups
            .entry(name.into())
            .or_default()
            .extend(members.into_iter().map(Into::into));
        self
    }

    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }
}

/// Failures to inject into the next engine calls
///
/// Injected failures stay in place until replaced with `set_failures`.
#[derive(Debug, Clone, Default)]
pub struct FailurePlan {
    pub init: Option<EngineError>,
    pub prepare: Option<EngineError>,
    pub commit: Option<EngineError>,
    /// Repositories whose refresh fails
    pub update: Vec<String>,
}

#[derive(Debug, Default)]
struct DbState {
    packages: BTreeMap<String, Package>,
    groups: BTreeMap<String, Vec<String>>,
}

struct MemoryDatabase {
    name: String,
    state: Mutex<DbState>,
    offline: bool,
    synced: AtomicBool,
    failures: Arc<Mutex<FailurePlan>>,
}

impl MemoryDatabase {
    fn new(
        name: &str,
        packages: Vec<Package>,
        groups: BTreeMap<String, Vec<String>>,
        origin: PackageOrigin,
        failures: Arc<Mutex<FailurePlan>>,
    ) -> Self {
        let packages = packages
            .into_iter()
            .map(|mut pkg| {
                pkg.origin = origin;
                (pkg.name.clone(), pkg)
            })
            .collect();

        Self {
            name: name.to_string(),
            state: Mutex::new(DbState { packages, groups }),
            offline: false,
            synced: AtomicBool::new(false),
            failures,
        }
    }

    fn insert(&self, package: Package) {
        self.state
            .lock()
            .packages
            .insert(package.name.clone(), package);
    }

    fn remove(&self, name: &str) -> Option<Package> {
        self.state.lock().packages.remove(name)
    }
}

impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn package(&self, name: &str) -> Option<Package> {
        self.state.lock().packages.get(name).cloned()
    }

    fn group(&self, name: &str) -> Option<Group> {
        let state = self.state.lock();

        let mut members: Vec<String> = state.groups.get(name).cloned().unwrap_or_default();
        for pkg in state.packages.values() {
            if pkg.groups.iter().any(|g| g == name) && !members.contains(&pkg.name) {
                members.push(pkg.name.clone());
            }
        }

        if members.is_empty() && !state.groups.contains_key(name) {
            return None;
        }

        Some(Group {
            name: name.to_string(),
            packages: members,
        })
    }

    fn packages(&self) -> Vec<Package> {
        self.state.lock().packages.values().cloned().collect()
    }

    fn search(&self, query: &str) -> Vec<Package> {
        self.state
            .lock()
            .packages
            .values()
            .filter(|pkg| {
                pkg.name.contains(query)
                    || pkg
                        .description
                        .as_deref()
                        .is_some_and(|desc| desc.contains(query))
            })
            .cloned()
            .collect()
    }

    fn update(&self, force: bool, callbacks: &mut dyn EngineCallbacks) -> Result<bool, EngineError> {
        if self.name == LOCAL_DB_NAME {
            return Ok(false);
        }

        if !force && self.synced.load(Ordering::SeqCst) {
            callbacks.log(LogLevel::Debug, &format!("{} is up to date", self.name));
            return Ok(false);
        }

        let filename = format!("{}.db", self.name);
        let failing = self.failures.lock().update.iter().any(|n| n == &self.name);
        if self.offline || failing {
            callbacks.log(
                LogLevel::Error,
                &format!("failed retrieving file '{}' from all mirrors", filename),
            );
            return Err(EngineError::Database {
                name: self.name.clone(),
                reason: "failed to retrieve database".to_string(),
            });
        }

        let size = 1024 * (self.state.lock().packages.len() as u64 + 1);
        callbacks.download(&filename, 0, size);
        callbacks.download(&filename, size / 2, size);
        callbacks.download(&filename, size, size);

        self.synced.store(true, Ordering::SeqCst);
        Ok(true)
    }
}

/// An engine holding every database in memory
pub struct MemoryEngine {
    available: Vec<RepositoryCatalog>,
    local: MemoryDatabase,
    sync: Vec<MemoryDatabase>,
    failures: Arc<Mutex<FailurePlan>>,
    locked: AtomicBool,
    releases: AtomicUsize,
}

impl MemoryEngine {
    pub fn new(catalog: Catalog) -> Self {
        let failures = Arc::new(Mutex::new(FailurePlan::default()));
        let local = MemoryDatabase::new(
            LOCAL_DB_NAME,
            catalog.installed,
            BTreeMap::new(),
            PackageOrigin::LocalDb,
            failures.clone(),
        );

        Self {
            available: catalog.repositories,
            local,
            sync: Vec::new(),
            failures,
            locked: AtomicBool::new(false),
            releases: AtomicUsize::new(0),
        }
    }

    /// Load the catalog from a JSON file
    pub fn from_catalog_file(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(crate::Error::Config(format!(
                "Package catalog not found: {}",
                path.display()
            )));
        }

        debug!("Loading package catalog from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Ok(Self::new(Catalog::from_json_str(&content)?))
    }

    /// Replace the injected failures
    pub fn set_failures(&self, plan: FailurePlan) {
        *self.failures.lock() = plan;
    }

    /// Number of transactions released so far
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Whether a transaction is currently open
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Names of installed packages, sorted
    pub fn installed_names(&self) -> Vec<String> {
        self.local.state.lock().packages.keys().cloned().collect()
    }

    /// First sync package called `name`, by priority
    fn find_sync(&self, name: &str) -> Option<Package> {
        self.sync.iter().find_map(|db| db.package(name))
    }
}

impl Engine for MemoryEngine {
    fn register_sync_database(&mut self, repository: &RepositoryConfig) -> Result<(), EngineError> {
        if self.sync.iter().any(|db| db.name == repository.name) {
            return Err(EngineError::Database {
                name: repository.name.clone(),
                reason: "already registered".to_string(),
            });
        }

        let Some(catalog) = self.available.iter().find(|r| r.name == repository.name) else {
            return Err(EngineError::Database {
                name: repository.name.clone(),
                reason: "not present in the package catalog".to_string(),
            });
        };

        let mut db = MemoryDatabase::new(
            &catalog.name,
            catalog.packages.clone(),
            catalog.groups.clone(),
            PackageOrigin::SyncDb,
            self.failures.clone(),
        );
        db.offline = catalog.offline;

        debug!(
            "Registered sync database {} ({} packages)",
            db.name,
            db.state.lock().packages.len()
        );
        self.sync.push(db);
        Ok(())
    }

    fn local_database(&self) -> &dyn Database {
        &self.local
    }

    fn sync_databases(&self) -> Vec<&dyn Database> {
        self.sync.iter().map(|db| db as &dyn Database).collect()
    }

    fn load_package(&self, path: &Path) -> Result<Package, EngineError> {
        crate::packages::arch::load(path)
    }

    fn init_transaction(&self, flags: TransactionFlags) -> Result<Box<dyn Transaction + '_>, EngineError> {
        if let Some(e) = self.failures.lock().init.clone() {
            return Err(e);
        }

        if self.locked.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Locked);
        }

        debug!("Transaction initialized with {:?}", flags);
        Ok(Box::new(MemoryTransaction {
            engine: self,
            flags,
            add: Vec::new(),
            remove: Vec::new(),
            prepared: false,
        }))
    }
}

struct MemoryTransaction<'a> {
    engine: &'a MemoryEngine,
    flags: TransactionFlags,
    add: Vec<Package>,
    remove: Vec<Package>,
    prepared: bool,
}

impl MemoryTransaction<'_> {
    fn is_added(&self, name: &str) -> bool {
        self.add.iter().any(|p| p.name == name)
    }

    fn is_removed(&self, name: &str) -> bool {
        self.remove.iter().any(|p| p.name == name)
    }

    fn is_satisfied(&self, name: &str) -> bool {
        self.is_added(name) || (!self.is_removed(name) && self.engine.local.package(name).is_some())
    }

    /// Pull missing dependencies of install targets in from the sync databases
    fn resolve_dependencies(&mut self) -> Result<(), EngineError> {
        let mut index = 0;
        while index < self.add.len() {
            let deps: Vec<String> = self.add[index]
                .dependency_names()
                .map(str::to_string)
                .collect();

            for dep in deps {
                if self.is_satisfied(&dep) {
                    continue;
                }
                match self.engine.find_sync(&dep) {
                    Some(mut pkg) => {
                        debug!("Pulling in dependency {} for {}", dep, self.add[index].name);
                        pkg.reason = InstallReason::Depend;
                        self.add.push(pkg);
                    }
                    None => {
                        return Err(EngineError::UnsatisfiedDependency {
                            package: self.add[index].name.clone(),
                            dependency: dep,
                        });
                    }
                }
            }
            index += 1;
        }
        Ok(())
    }

    fn check_conflicts(&mut self, callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError> {
        let mut displaced = Vec::new();

        for pkg in &self.add {
            for conflict in pkg.conflict_names() {
                if conflict == pkg.name {
                    continue;
                }
                if self.is_added(conflict) {
                    return Err(EngineError::Conflict {
                        package: pkg.name.clone(),
                        conflict: conflict.to_string(),
                    });
                }
                let Some(installed) = self.engine.local.package(conflict) else {
                    continue;
                };
                if self.is_removed(conflict) {
                    continue;
                }

                let question = Question::Conflict {
                    package: pkg.name.clone(),
                    conflict: conflict.to_string(),
                };
                if !callbacks.question(&question) {
                    return Err(EngineError::Conflict {
                        package: pkg.name.clone(),
                        conflict: conflict.to_string(),
                    });
                }
                displaced.push(installed);
            }
        }

        for pkg in displaced {
            if !self.is_removed(&pkg.name) {
                self.remove.push(pkg);
            }
        }
        Ok(())
    }

    /// Installed packages that depend on something being removed
    fn dependents(&self) -> Vec<Package> {
        self.engine
            .local
            .packages()
            .into_iter()
            .filter(|pkg| !self.is_removed(&pkg.name))
            .filter(|pkg| pkg.dependency_names().any(|dep| self.is_removed(dep)))
            .collect()
    }

    fn check_removals(&mut self) -> Result<(), EngineError> {
        if self.flags.cascade {
            loop {
                let dependents = self.dependents();
                if dependents.is_empty() {
                    break;
                }
                for pkg in dependents {
                    debug!("Cascading removal to {}", pkg.name);
                    self.remove.push(pkg);
                }
            }
        }

        if !self.flags.no_deps {
            if let Some(pkg) = self.dependents().into_iter().next() {
                let dependency = pkg
                    .dependency_names()
                    .find(|dep| self.is_removed(dep))
                    .unwrap_or_default()
                    .to_string();
                return Err(EngineError::UnsatisfiedDependency {
                    package: pkg.name,
                    dependency,
                });
            }
        }

        if self.flags.recurse {
            self.remove_unneeded_dependencies();
        }
        Ok(())
    }

    /// Add dependencies of removal targets that nothing else needs any more
    fn remove_unneeded_dependencies(&mut self) {
        let mut start = 0;
        loop {
            let candidates: BTreeSet<String> = self.remove[start..]
                .iter()
                .flat_map(|pkg| pkg.dependency_names().map(str::to_string))
                .collect();
            start = self.remove.len();

            for name in candidates {
                if self.is_removed(&name) {
                    continue;
                }
                let Some(pkg) = self.engine.local.package(&name) else {
                    continue;
                };
                if pkg.reason == InstallReason::Explicit && !self.flags.unneeded {
                    continue;
                }
                if self.dependents_of(&name) {
                    continue;
                }
                debug!("Removing unneeded dependency {}", name);
                self.remove.push(pkg);
            }

            if !self.flags.recurse_all || self.remove.len() == start {
                break;
            }
        }
    }

    /// Whether a package that stays installed still depends on `name`
    fn dependents_of(&self, name: &str) -> bool {
        self.engine
            .local
            .packages()
            .iter()
            .filter(|pkg| !self.is_removed(&pkg.name))
            .any(|pkg| pkg.dependency_names().any(|dep| dep == name))
    }

    fn apply(&self, callbacks: &mut dyn EngineCallbacks) {
        let total = self.remove.len();
        for (i, pkg) in self.remove.iter().enumerate() {
            callbacks.event(EngineEvent::PackageOperationStart);
            callbacks.progress(ProgressKind::Remove, Some(&pkg.name), 100, total, i + 1);
            self.engine.local.remove(&pkg.name);
            callbacks.event(EngineEvent::PackageOperationDone);
        }

        let total = self.add.len();
        for (i, pkg) in self.add.iter().enumerate() {
            let existing = self.engine.local.package(&pkg.name);
            let kind = match &existing {
                Some(old) if old.version == pkg.version => ProgressKind::Reinstall,
                Some(_) => ProgressKind::Upgrade,
                None => ProgressKind::Install,
            };

            let mut installed = pkg.clone();
            installed.origin = PackageOrigin::LocalDb;
            installed.reason = if self.flags.all_deps {
                InstallReason::Depend
            } else if self.flags.all_explicit {
                InstallReason::Explicit
            } else {
                existing.map_or(pkg.reason, |old| old.reason)
            };

            callbacks.event(EngineEvent::PackageOperationStart);
            callbacks.progress(kind, Some(&pkg.name), 100, total, i + 1);
            self.engine.local.insert(installed);
            callbacks.event(EngineEvent::PackageOperationDone);
        }
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn add_package(&mut self, package: Package) -> Result<(), EngineError> {
        if self.is_added(&package.name) {
            return Err(EngineError::DuplicateTarget(package.name));
        }
        self.add.push(package);
        Ok(())
    }

    fn remove_package(&mut self, package: Package) -> Result<(), EngineError> {
        if self.engine.local.package(&package.name).is_none() {
            return Err(EngineError::PackageNotFound(package.name));
        }
        if self.is_removed(&package.name) {
            return Err(EngineError::DuplicateTarget(package.name));
        }
        self.remove.push(package);
        Ok(())
    }

    fn prepare(&mut self, callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError> {
        if let Some(e) = self.engine.failures.lock().prepare.clone() {
            return Err(e);
        }

        if !self.add.is_empty() {
            callbacks.event(EngineEvent::CheckDepsStart);

            if self.flags.needed {
                let local = &self.engine.local;
                self.add.retain(|pkg| match local.package(&pkg.name) {
                    Some(installed) if installed.version == pkg.version => {
                        callbacks.log(
                            LogLevel::Warning,
                            &format!("{}-{} is up to date -- skipping", pkg.name, pkg.version),
                        );
                        false
                    }
                    _ => true,
                });
            }

            if !self.flags.no_deps {
                callbacks.event(EngineEvent::ResolveDepsStart);
                self.resolve_dependencies()?;
                callbacks.event(EngineEvent::ResolveDepsDone);
            }
            callbacks.event(EngineEvent::CheckDepsDone);

            callbacks.event(EngineEvent::InterConflictsStart);
            self.check_conflicts(callbacks)?;
            callbacks.event(EngineEvent::InterConflictsDone);
        }

        if !self.remove.is_empty() {
            callbacks.event(EngineEvent::CheckDepsStart);
            self.check_removals()?;
            callbacks.event(EngineEvent::CheckDepsDone);
        }

        self.prepared = true;
        Ok(())
    }

    fn commit(&mut self, callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError> {
        if !self.prepared {
            return Err(EngineError::InvalidState {
                expected: "prepared",
                found: "initialized",
            });
        }
        if let Some(e) = self.engine.failures.lock().commit.clone() {
            return Err(e);
        }

        callbacks.event(EngineEvent::TransactionStart);

        let downloads: Vec<&Package> = if self.flags.db_only {
            Vec::new()
        } else {
            self.add
                .iter()
                .filter(|pkg| pkg.origin == PackageOrigin::SyncDb)
                .collect()
        };

        let total_size: u64 = downloads.iter().map(|pkg| pkg.download_size).sum();
        callbacks.total_download(total_size);

        if !downloads.is_empty() {
            callbacks.event(EngineEvent::RetrieveStart);
            for pkg in &downloads {
                let filename = pkg.filename();
                let size = pkg.download_size;
                callbacks.download(&filename, 0, size);
                callbacks.download(&filename, size / 2, size);
                callbacks.download(&filename, size, size);
            }
            callbacks.event(EngineEvent::RetrieveDone);
        }

        if self.flags.download_only {
            info!("Download only, {} packages retrieved", downloads.len());
            callbacks.event(EngineEvent::TransactionDone);
            return Ok(());
        }

        let count = self.add.len();
        if count > 0 {
            callbacks.event(EngineEvent::IntegrityStart);
            callbacks.progress(ProgressKind::IntegrityCheck, None, 100, count, count);
            callbacks.event(EngineEvent::IntegrityDone);

            callbacks.event(EngineEvent::KeyringStart);
            callbacks.event(EngineEvent::KeyringDone);

            callbacks.event(EngineEvent::FileConflictsStart);
            callbacks.event(EngineEvent::FileConflictsDone);

            callbacks.event(EngineEvent::DiskspaceStart);
            callbacks.progress(ProgressKind::DiskspaceCheck, None, 100, count, count);
            callbacks.event(EngineEvent::DiskspaceDone);
        }

        self.apply(callbacks);
        callbacks.event(EngineEvent::TransactionDone);
        Ok(())
    }

    fn release(self: Box<Self>) -> Result<(), EngineError> {
        self.engine.releases.fetch_add(1, Ordering::SeqCst);
        if !self.engine.locked.swap(false, Ordering::SeqCst) {
            warn!("Released a transaction that did not hold the lock");
        }
        Ok(())
    }
}
