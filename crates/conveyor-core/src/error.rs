//! Error types for Conveyor

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using ConveyorError
pub type Result<T> = std::result::Result<T, ConveyorError>;

/// Main error type for Conveyor operations
#[derive(Debug, Error)]
pub enum ConveyorError {
    /// Configuration-related errors
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Workspace loading errors
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    /// Git-related errors
    #[error(transparent)]
    Git(#[from] GitError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-related errors
///
/// Everything in here is raised before any task is scheduled.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {message}")]
    InvalidValue { field: String, message: String },

    /// A package selection pattern could not be compiled
    #[error("Invalid package pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// A pipeline entry is malformed
    #[error("Invalid pipeline entry for task '{task}': {message}")]
    InvalidPipeline { task: String, message: String },

    /// YAML parsing error
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// IO error
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
}

/// Workspace discovery errors
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// No workspace manifest at the given root
    #[error("No workspace found at {0}")]
    NotFound(PathBuf),

    /// A package manifest could not be read or parsed
    #[error("Failed to parse manifest {path}: {message}")]
    ManifestParse { path: PathBuf, message: String },

    /// A manifest has no `name` field
    #[error("Package manifest {0} has no name")]
    MissingName(PathBuf),

    /// Two packages share a name
    #[error("Duplicate package name '{name}' at {first} and {second}")]
    DuplicatePackage {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
}

/// Git-related errors
#[derive(Debug, Error)]
pub enum GitError {
    /// Git could not be spawned
    #[error("Failed to run git: {0}")]
    SpawnFailed(String),

    /// Git exited with an error
    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

