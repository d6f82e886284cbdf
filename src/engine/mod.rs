// src/engine/mod.rs

//! Package database and transaction engine interface
//!
//! The orchestrator never talks to a concrete package database directly. It
//! drives anything implementing these traits:
//! - `Engine`: owns the local and sync databases and opens transactions
//! - `Database`: package and group lookup, search, and index refresh
//! - `Transaction`: add/remove targets, then prepare, commit and release
//! - `EngineCallbacks`: hooks the engine invokes synchronously while it works
//!
//! `memory` provides an in-process engine backed by a JSON catalog.

pub mod memory;

use crate::config::RepositoryConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors raised by a transaction engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine could not be reached or refused to open a transaction
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    /// Another transaction already holds the database lock
    #[error("Unable to lock database: another transaction is in progress")]
    Locked,

    /// A transaction step was called out of order
    #[error("Invalid transaction state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Package {0} not found")]
    PackageNotFound(String),

    #[error("Duplicate target: {0}")]
    DuplicateTarget(String),

    #[error("Unsatisfied dependency: {package} requires {dependency}")]
    UnsatisfiedDependency { package: String, dependency: String },

    #[error("Conflicting packages: {package} and {conflict} are in conflict")]
    Conflict { package: String, conflict: String },

    #[error("Failed to retrieve {0}")]
    Download(String),

    #[error("Integrity check failed for {0}")]
    Integrity(String),

    #[error("Not enough free disk space")]
    DiskSpace,

    #[error("Database {name}: {reason}")]
    Database { name: String, reason: String },

    #[error("Invalid package archive {path}: {reason}")]
    Archive { path: String, reason: String },
}

/// Why a package is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallReason {
    /// Requested by the user
    #[default]
    Explicit,
    /// Pulled in to satisfy another package
    Depend,
}

/// Where a package record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackageOrigin {
    #[default]
    SyncDb,
    LocalDb,
    File,
}

/// A package as seen by the orchestrator
///
/// Everything except the name is opaque to target resolution; the version
/// and sizes are carried through for reporting and the engine's own use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default)]
    pub download_size: u64,
    #[serde(default)]
    pub installed_size: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// Archive file name in the repository, derived when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default)]
    pub reason: InstallReason,
    #[serde(skip)]
    pub origin: PackageOrigin,
}

impl Package {
    /// Create a package with only a name and version set
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: None,
            architecture: None,
            download_size: 0,
            installed_size: 0,
            depends: Vec::new(),
            conflicts: Vec::new(),
            groups: Vec::new(),
            filename: None,
            reason: InstallReason::Explicit,
            origin: PackageOrigin::SyncDb,
        }
    }

    /// Archive file name used when this package is downloaded
    pub fn filename(&self) -> String {
        match &self.filename {
            Some(filename) => filename.clone(),
            None => format!(
                "{}-{}-{}.pkg.tar.zst",
                self.name,
                self.version,
                self.architecture.as_deref().unwrap_or("any")
            ),
        }
    }

    /// Names of the packages this one depends on, without version constraints
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.depends.iter().map(|dep| dependency_name(dep))
    }

    /// Names of the packages this one conflicts with
    pub fn conflict_names(&self) -> impl Iterator<Item = &str> {
        self.conflicts.iter().map(|dep| dependency_name(dep))
    }
}

/// Strip a version constraint or description from a dependency string
///
/// `"glibc>=2.34"` becomes `"glibc"`, `"python: for scripts"` becomes `"python"`.
pub fn dependency_name(dep: &str) -> &str {
    let dep = dep.split_once(':').map_or(dep, |(name, _)| name);
    match dep.find(['<', '>', '=']) {
        Some(pos) => dep[..pos].trim(),
        None => dep.trim(),
    }
}

/// A named set of packages defined by one repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub packages: Vec<String>,
}

/// Flags handed to the engine when a transaction is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionFlags {
    pub no_deps: bool,
    pub db_only: bool,
    pub force: bool,
    pub needed: bool,
    pub all_deps: bool,
    pub all_explicit: bool,
    pub cascade: bool,
    pub no_save: bool,
    pub recurse: bool,
    pub recurse_all: bool,
    pub unneeded: bool,
    pub download_only: bool,
}

/// Severity of an engine log line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Debug,
    Function,
}

/// Phase notifications emitted by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineEvent {
    CheckDepsStart,
    CheckDepsDone,
    FileConflictsStart,
    FileConflictsDone,
    ResolveDepsStart,
    ResolveDepsDone,
    InterConflictsStart,
    InterConflictsDone,
    TransactionStart,
    TransactionDone,
    PackageOperationStart,
    PackageOperationDone,
    IntegrityStart,
    IntegrityDone,
    LoadStart,
    LoadDone,
    DeltaIntegrityStart,
    DeltaPatchesStart,
    DeltaPatchStart,
    RetrieveStart,
    RetrieveDone,
    DiskspaceStart,
    DiskspaceDone,
    KeyringStart,
    KeyringDone,
    KeyDownloadStart,
    KeyDownloadDone,
}

/// Interactive questions the engine may ask mid-transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Question {
    /// A target is listed in IgnorePkg; install it anyway?
    InstallIgnored { package: String },
    /// Replace an installed package with one that obsoletes it?
    Replace { old: String, new: String },
    /// Remove an installed package that conflicts with a target?
    Conflict { package: String, conflict: String },
    /// Delete a corrupted archive from the cache?
    CorruptedPackage { filename: String },
    /// Skip targets whose dependencies cannot be resolved?
    RemoveUnresolvable { packages: Vec<String> },
    /// Import a missing signing key?
    ImportKey { fingerprint: String, uid: String },
}

impl Question {
    /// The answer the engine assumes when nobody is asked
    pub fn default_answer(&self) -> bool {
        match self {
            Question::InstallIgnored { .. } => false,
            Question::Replace { .. } => true,
            Question::Conflict { .. } => false,
            Question::CorruptedPackage { .. } => true,
            Question::RemoveUnresolvable { .. } => false,
            Question::ImportKey { .. } => true,
        }
    }
}

/// What the engine is doing when it reports per-operation progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    Install,
    Upgrade,
    Downgrade,
    Reinstall,
    Remove,
    ConflictsCheck,
    DiskspaceCheck,
    IntegrityCheck,
    Load,
    KeyringCheck,
}

impl ProgressKind {
    /// Present participle used in status lines
    pub fn verb(&self) -> &'static str {
        match self {
            ProgressKind::Install => "Installing",
            ProgressKind::Upgrade => "Upgrading",
            ProgressKind::Downgrade => "Downgrading",
            ProgressKind::Reinstall => "Reinstalling",
            ProgressKind::Remove => "Removing",
            ProgressKind::ConflictsCheck => "Checking conflicts for",
            ProgressKind::DiskspaceCheck => "Checking disk space for",
            ProgressKind::IntegrityCheck => "Checking integrity of",
            ProgressKind::Load => "Loading",
            ProgressKind::KeyringCheck => "Checking keys for",
        }
    }
}

/// Hooks the engine calls synchronously while a transaction runs
pub trait EngineCallbacks {
    /// A raw log line from the engine
    fn log(&mut self, level: LogLevel, line: &str);

    /// A phase notification
    fn event(&mut self, event: EngineEvent);

    /// An interactive question; returns the answer
    fn question(&mut self, question: &Question) -> bool;

    /// Per-operation progress. `target` is `None` for whole-transaction phases.
    fn progress(
        &mut self,
        kind: ProgressKind,
        target: Option<&str>,
        percent: u32,
        total: usize,
        current: usize,
    );

    /// Per-file download progress. `total` is 0 when the size is unknown.
    fn download(&mut self, filename: &str, transferred: u64, total: u64);

    /// Aggregate number of bytes this transaction will download
    fn total_download(&mut self, total: u64);
}

/// A local or sync package database
pub trait Database {
    fn name(&self) -> &str;

    /// Look up a package by exact name
    fn package(&self, name: &str) -> Option<Package>;

    /// Look up a group by exact name
    fn group(&self, name: &str) -> Option<Group>;

    /// Every package in the database
    fn packages(&self) -> Vec<Package>;

    /// Packages whose name or description contains `query`
    fn search(&self, query: &str) -> Vec<Package>;

    /// Refresh the database index; returns whether anything was fetched
    fn update(&self, force: bool, callbacks: &mut dyn EngineCallbacks) -> Result<bool, EngineError>;
}

/// An open engine transaction
///
/// `release` consumes the handle, so a released transaction cannot be used again.
pub trait Transaction {
    fn add_package(&mut self, package: Package) -> Result<(), EngineError>;

    fn remove_package(&mut self, package: Package) -> Result<(), EngineError>;

    fn prepare(&mut self, callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError>;

    fn commit(&mut self, callbacks: &mut dyn EngineCallbacks) -> Result<(), EngineError>;

    fn release(self: Box<Self>) -> Result<(), EngineError>;
}

/// A package management engine
pub trait Engine {
    /// Register a sync database; registration order is resolution priority
    fn register_sync_database(&mut self, repository: &RepositoryConfig) -> Result<(), EngineError>;

    fn local_database(&self) -> &dyn Database;

    /// Sync databases in priority order
    fn sync_databases(&self) -> Vec<&dyn Database>;

    /// Load a package straight from an archive on disk
    fn load_package(&self, path: &Path) -> Result<Package, EngineError>;

    /// Open a transaction with the given flags
    fn init_transaction(&self, flags: TransactionFlags) -> Result<Box<dyn Transaction + '_>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_name_strips_constraints() {
        assert_eq!(dependency_name("glibc>=2.34"), "glibc");
        assert_eq!(dependency_name("zlib"), "zlib");
        assert_eq!(dependency_name("bash=5.2"), "bash");
        assert_eq!(dependency_name("python: for scripts"), "python");
    }

    #[test]
    fn test_default_filename() {
        let mut pkg = Package::new("fish", "3.7.1-1");
        assert_eq!(pkg.filename(), "fish-3.7.1-1-any.pkg.tar.zst");

        pkg.architecture = Some("x86_64".to_string());
        assert_eq!(pkg.filename(), "fish-3.7.1-1-x86_64.pkg.tar.zst");

        pkg.filename = Some("fish.pkg.tar.xz".to_string());
        assert_eq!(pkg.filename(), "fish.pkg.tar.xz");
    }

    #[test]
    fn test_question_defaults() {
        assert!(!Question::Conflict {
            package: "a".to_string(),
            conflict: "b".to_string()
        }
        .default_answer());
        assert!(Question::CorruptedPackage {
            filename: "a.pkg.tar.zst".to_string()
        }
        .default_answer());
    }

    #[test]
    fn test_package_deserializes_with_defaults() {
        let pkg: Package = serde_json::from_str(r#"{"name": "vim", "version": "9.1-1"}"#).unwrap();
        assert_eq!(pkg.name, "vim");
        assert_eq!(pkg.reason, InstallReason::Explicit);
        assert!(pkg.depends.is_empty());
        assert_eq!(pkg.origin, PackageOrigin::SyncDb);
    }
}
