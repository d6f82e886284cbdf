// src/error.rs

use crate::engine::EngineError;
use thiserror::Error;

/// Core error types for pacflow
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be read, parsed or applied
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed TOML configuration
    #[error("Invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    /// Malformed JSON catalog or options
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors raised by the transaction engine
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// A removal target is not installed, or a queried package does not exist
    #[error("Target {0} not found")]
    TargetNotFound(String),

    /// Every requested name was unresolved or filtered out as a conflict
    #[error("No targets found")]
    NoTargets,

    /// The caller passed an empty package list
    #[error("Package list is empty")]
    EmptyRequest,

    /// A package archive could not be loaded
    #[error("Failed to load package archive {path}: {reason}")]
    Archive { path: String, reason: String },

    /// One or more sync databases could not be refreshed
    #[error("Failed to refresh databases: {}", .0.join(", "))]
    RefreshFailed(Vec<String>),
}

/// Result type alias using pacflow's Error type
pub type Result<T> = std::result::Result<T, Error>;
