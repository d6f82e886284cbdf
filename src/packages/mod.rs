// src/packages/mod.rs

//! Package archive support
//!
//! Loads package metadata straight from archives on disk, for upgrades from
//! local files that bypass repository resolution.

pub mod arch;
