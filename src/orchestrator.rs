// src/orchestrator.rs

//! Transaction orchestration
//!
//! `Orchestrator` owns the engine and the callback bridge. Each public
//! operation runs one complete init, populate, prepare, commit and release
//! cycle before returning; refresh runs one short cycle per repository.

use crate::callbacks::{CallbackBridge, DiagnosticLog};
use crate::config::{Config, ExclusiveSource};
use crate::engine::{Engine, Package};
use crate::error::{Error, Result};
use crate::events::EventSender;
use crate::progress::ProgressTracker;
use crate::resolver::{Resolution, Resolver};
use crate::transaction::{finalize, with_transaction, TransactionOptions};
use serde::Serialize;
use std::collections::HashSet;
use std::hash::Hash;
use std::path::PathBuf;
use tracing::{debug, error, info};

/// Package details for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    pub repository: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    pub download_size: u64,
    pub installed_size: u64,
    pub depends: Vec<String>,
    pub conflicts: Vec<String>,
    pub groups: Vec<String>,
    pub installed: bool,
}

impl PackageInfo {
    fn new(package: Package, repository: &str, installed: bool) -> Self {
        Self {
            name: package.name,
            version: package.version,
            repository: repository.to_string(),
            description: package.description,
            architecture: package.architecture,
            download_size: package.download_size,
            installed_size: package.installed_size,
            depends: package.depends,
            conflicts: package.conflicts,
            groups: package.groups,
            installed,
        }
    }
}

/// Drop repeated entries, keeping the first occurrence
fn dedup<T: Clone + Eq + Hash>(items: &[T]) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter(|item| seen.insert(*item))
        .cloned()
        .collect()
}

pub struct Orchestrator<E: Engine> {
    engine: E,
    callbacks: CallbackBridge,
    exclusive: Option<ExclusiveSource>,
}

impl<E: Engine> Orchestrator<E> {
    /// Register the configured repositories with `engine` and open the diagnostic log
    pub fn new(mut engine: E, config: &Config, events: EventSender) -> Result<Self> {
        for repository in &config.repositories {
            engine.register_sync_database(repository).map_err(|e| {
                Error::Config(format!(
                    "Can't register repository {}: {}",
                    repository.name, e
                ))
            })?;
        }

        let diagnostics = match &config.diagnostic_log {
            Some(path) => DiagnosticLog::open(path)?,
            None => DiagnosticLog::disabled(),
        };

        info!(
            "Repositories in priority order: {}",
            config.repository_order().join(", ")
        );

        Ok(Self {
            engine,
            callbacks: CallbackBridge::new(events, diagnostics),
            exclusive: config.exclusive.clone(),
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn tracker(&self) -> &ProgressTracker {
        self.callbacks.tracker()
    }

    /// Report an unrecoverable error to the consumer and terminate
    #[track_caller]
    pub fn fatal(&mut self, text: impl Into<String>) {
        self.callbacks.fatal(text);
    }

    /// Resolve names against the sync databases without touching any transaction
    pub fn resolve(&self, names: &[String], conflicts: &HashSet<String>) -> Resolution {
        Resolver::new(self.engine.sync_databases())
            .with_exclusive(self.exclusive.as_ref())
            .resolve(names, conflicts)
    }

    /// Install packages or groups by name, skipping anything in `conflicts`
    pub fn install(
        &mut self,
        names: &[String],
        conflicts: &HashSet<String>,
        options: &TransactionOptions,
    ) -> Result<()> {
        if names.is_empty() {
            return Err(Error::EmptyRequest);
        }

        let names = dedup(names);
        let resolution = self.resolve(&names, conflicts);
        if resolution.is_empty() {
            error!("No targets found");
            return Err(Error::NoTargets);
        }

        debug!("Install targets: {}", resolution.names().join(", "));
        self.callbacks.tracker_mut().set_total_packages(resolution.len());

        let packages = resolution.into_packages();
        let callbacks = &mut self.callbacks;
        with_transaction(&self.engine, options, |tx| {
            for package in packages {
                tx.add(package)?;
            }
            finalize(tx, callbacks)
        })
    }

    /// Install or upgrade from package archives on disk
    ///
    /// Every archive is loaded before a transaction is opened; one unreadable
    /// archive fails the whole call.
    pub fn upgrade_from_archives(
        &mut self,
        paths: &[PathBuf],
        options: &TransactionOptions,
    ) -> Result<()> {
        if paths.is_empty() {
            return Err(Error::EmptyRequest);
        }

        let mut packages = Vec::new();
        for path in dedup(paths) {
            let package = self.engine.load_package(&path).map_err(|e| {
                error!("Can't load package {}: {}", path.display(), e);
                Error::Archive {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;
            packages.push(package);
        }

        let callbacks = &mut self.callbacks;
        with_transaction(&self.engine, options, |tx| {
            for package in packages {
                tx.add(package)?;
            }
            finalize(tx, callbacks)
        })
    }

    /// Remove installed packages
    ///
    /// Names are looked up in the local database only; any name that is not
    /// installed aborts the call before a transaction is opened.
    pub fn remove(&mut self, names: &[String], options: &TransactionOptions) -> Result<()> {
        if names.is_empty() {
            return Err(Error::EmptyRequest);
        }

        let local = self.engine.local_database();
        let mut packages = Vec::new();
        for name in dedup(names) {
            match local.package(&name) {
                Some(package) => packages.push(package),
                None => {
                    error!("Can't find package '{}' in the local database", name);
                    return Err(Error::TargetNotFound(name));
                }
            }
        }

        let callbacks = &mut self.callbacks;
        with_transaction(&self.engine, options, |tx| {
            for package in packages {
                tx.remove(package)?;
            }
            finalize(tx, callbacks)
        })
    }

    /// Force a refresh of every sync database, one transaction per database
    ///
    /// A failing database does not stop the others from refreshing.
    pub fn refresh(&mut self) -> Result<()> {
        let options = TransactionOptions::default();
        let callbacks = &mut self.callbacks;
        let mut failed = Vec::new();

        for db in self.engine.sync_databases() {
            let result = with_transaction(&self.engine, &options, |_tx| {
                Ok(db.update(true, &mut *callbacks)?)
            });

            match result {
                Ok(true) => debug!("{} database refreshed", db.name()),
                Ok(false) => debug!("{} database is up to date", db.name()),
                Err(e) => {
                    error!("Can't update {} database: {}", db.name(), e);
                    failed.push(db.name().to_string());
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::RefreshFailed(failed))
        }
    }

    /// Details of the first sync package called `name`, by priority
    pub fn package_info(&self, name: &str) -> Option<PackageInfo> {
        let installed = self.is_installed(name);
        self.engine.sync_databases().into_iter().find_map(|db| {
            db.package(name)
                .map(|package| PackageInfo::new(package, db.name(), installed))
        })
    }

    /// Details of every named package, or of every sync package when `names` is empty
    pub fn packages_info(&self, names: &[String]) -> Result<Vec<PackageInfo>> {
        if names.is_empty() {
            let mut infos = Vec::new();
            for db in self.engine.sync_databases() {
                for package in db.packages() {
                    let installed = self.is_installed(&package.name);
                    infos.push(PackageInfo::new(package, db.name(), installed));
                }
            }
            return Ok(infos);
        }

        names
            .iter()
            .map(|name| {
                self.package_info(name)
                    .ok_or_else(|| Error::TargetNotFound(name.clone()))
            })
            .collect()
    }

    /// Whether a package called exactly `name` is installed
    pub fn is_installed(&self, name: &str) -> bool {
        self.engine
            .local_database()
            .search(name)
            .iter()
            .any(|package| package.name == name)
    }
}
