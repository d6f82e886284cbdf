// src/transaction.rs

//! Transaction options and scoped transaction lifecycle
//!
//! A transaction moves through `initialized -> prepared -> committed` and is
//! released exactly once whatever happens. `with_transaction` opens the
//! handle, runs a body against it and releases it; `ScopedTransaction` also
//! releases on drop so an early return or a panic cannot leak the handle.

use crate::engine::{
    Engine, EngineCallbacks, EngineError, InstallReason, Package, Transaction, TransactionFlags,
};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

/// Options recognized by every transaction-backed operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransactionOptions {
    /// Skip dependency checks
    pub no_deps: bool,
    /// Only touch the local database, never the filesystem
    pub db_only: bool,
    /// Bypass version checks
    pub force: bool,
    /// Skip targets that are already up to date
    pub needed: bool,
    /// Install reason recorded for every target
    pub mode: Option<InstallReason>,
    /// Remove packages that depend on removal targets
    pub cascade: bool,
    /// Do not keep backups of modified configuration files
    pub no_save: bool,
    /// 0: off, 1: remove now-unneeded direct dependencies, 2+: transitively
    pub recursive: u8,
    /// Also remove explicitly installed packages when recursing
    pub unneeded: bool,
    /// Fetch packages without applying them
    pub download_only: bool,
}

impl TransactionOptions {
    /// Engine flags derived from these options
    pub fn flags(&self) -> TransactionFlags {
        TransactionFlags {
            no_deps: self.no_deps,
            db_only: self.db_only,
            force: self.force,
            needed: self.needed,
            all_deps: self.mode == Some(InstallReason::Depend),
            all_explicit: self.mode == Some(InstallReason::Explicit),
            cascade: self.cascade,
            no_save: self.no_save,
            recurse: self.recursive > 0,
            recurse_all: self.recursive > 1,
            unneeded: self.unneeded,
            download_only: self.download_only,
        }
    }
}

/// Lifecycle position of an open transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Initialized,
    Prepared,
    Committed,
    Failed,
}

impl TransactionState {
    fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Initialized => "initialized",
            TransactionState::Prepared => "prepared",
            TransactionState::Committed => "committed",
            TransactionState::Failed => "failed",
        }
    }
}

/// An engine transaction that is released when it goes out of scope
pub struct ScopedTransaction<'a> {
    handle: Option<Box<dyn Transaction + 'a>>,
    state: TransactionState,
}

impl<'a> ScopedTransaction<'a> {
    fn new(handle: Box<dyn Transaction + 'a>) -> Self {
        Self {
            handle: Some(handle),
            state: TransactionState::Initialized,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn expect_state(&self, expected: TransactionState) -> std::result::Result<(), EngineError> {
        if self.state != expected {
            return Err(EngineError::InvalidState {
                expected: expected.as_str(),
                found: self.state.as_str(),
            });
        }
        Ok(())
    }

    fn handle(&mut self) -> std::result::Result<&mut (dyn Transaction + 'a), EngineError> {
        match self.handle.as_deref_mut() {
            Some(handle) => Ok(handle),
            None => Err(EngineError::InvalidState {
                expected: "open",
                found: "released",
            }),
        }
    }

    /// Add a package to install or upgrade
    pub fn add(&mut self, package: Package) -> std::result::Result<(), EngineError> {
        self.expect_state(TransactionState::Initialized)?;
        debug!("Adding package '{}' to transaction", package.name);
        self.handle()?.add_package(package)
    }

    /// Add a package to remove
    pub fn remove(&mut self, package: Package) -> std::result::Result<(), EngineError> {
        self.expect_state(TransactionState::Initialized)?;
        debug!("Adding package '{}' to remove transaction", package.name);
        self.handle()?.remove_package(package)
    }

    pub fn prepare(
        &mut self,
        callbacks: &mut dyn EngineCallbacks,
    ) -> std::result::Result<(), EngineError> {
        self.expect_state(TransactionState::Initialized)?;
        let result = self.handle()?.prepare(callbacks);
        self.state = match result {
            Ok(()) => TransactionState::Prepared,
            Err(_) => TransactionState::Failed,
        };
        result
    }

    pub fn commit(
        &mut self,
        callbacks: &mut dyn EngineCallbacks,
    ) -> std::result::Result<(), EngineError> {
        self.expect_state(TransactionState::Prepared)?;
        let result = self.handle()?.commit(callbacks);
        self.state = match result {
            Ok(()) => TransactionState::Committed,
            Err(_) => TransactionState::Failed,
        };
        result
    }

    /// Release the handle now instead of on drop
    pub fn release(mut self) -> std::result::Result<(), EngineError> {
        match self.handle.take() {
            Some(handle) => {
                debug!("Releasing transaction ({})", self.state.as_str());
                handle.release()
            }
            None => Ok(()),
        }
    }
}

impl Drop for ScopedTransaction<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            warn!("Transaction dropped in state {}, releasing", self.state.as_str());
            if let Err(e) = handle.release() {
                warn!("Failed to release transaction: {}", e);
            }
        }
    }
}

/// Open a transaction, run `body` against it, and release it
///
/// If the engine cannot open a transaction the error is returned and nothing
/// is released. Otherwise the handle is released exactly once, after `body`
/// returns, whether it succeeded or not. A release failure is only reported
/// when `body` succeeded; otherwise the body's error wins.
pub fn with_transaction<'e, E, T, F>(engine: &'e E, options: &TransactionOptions, body: F) -> Result<T>
where
    E: Engine + ?Sized,
    F: FnOnce(&mut ScopedTransaction<'e>) -> Result<T>,
{
    let handle = engine.init_transaction(options.flags()).inspect_err(|e| {
        error!("Can't init transaction: {}", e);
    })?;

    let mut transaction = ScopedTransaction::new(handle);
    let outcome = body(&mut transaction);
    let released = transaction.release();

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => {
            error!("Can't release transaction: {}", e);
            Err(e.into())
        }
        (Err(e), Err(release_err)) => {
            warn!("Can't release transaction after failure: {}", release_err);
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
    }
}

/// Prepare and commit a transaction
///
/// Engine errors are logged here and returned; release is left to the
/// enclosing `with_transaction`.
pub fn finalize(
    transaction: &mut ScopedTransaction<'_>,
    callbacks: &mut dyn EngineCallbacks,
) -> Result<()> {
    debug!("Prepare transaction...");
    let result = transaction.prepare(callbacks).and_then(|()| {
        debug!("Commit transaction...");
        transaction.commit(callbacks)
    });

    if let Err(e) = result {
        error!("Can't finalize transaction: {}", e);
        return Err(e.into());
    }

    debug!("Transaction done.");
    Ok(())
}
