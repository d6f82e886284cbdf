// src/lib.rs

//! Pacflow
//!
//! Transaction orchestration core for a package manager front end.
//!
//! # Architecture
//!
//! - Resolver: requested names to concrete packages, honoring repository
//!   priority, exclusive-source groups and caller conflicts
//! - Orchestrator: install, upgrade-from-archive, remove and refresh, each a
//!   scoped engine transaction released exactly once
//! - Callback bridge: engine callbacks turned into deduplicated events
//! - Event channel: bounded, non-blocking for progress, drain-then-exit for
//!   fatal errors
//! - Engine traits, with an in-memory engine driven by a JSON catalog

pub mod callbacks;
pub mod config;
pub mod engine;
mod error;
pub mod events;
pub mod orchestrator;
pub mod packages;
pub mod progress;
pub mod resolver;
pub mod transaction;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{event_channel, Event, EventKind, EventReceiver, EventSender};
pub use orchestrator::{Orchestrator, PackageInfo};
pub use transaction::TransactionOptions;
