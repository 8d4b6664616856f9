//! Conveyor Core - workspace model, configuration and package selection
//!
//! This crate provides the foundational types, error handling and
//! configuration for the Conveyor task runner, plus the package filter that
//! decides which workspace packages take part in a run.

pub mod config;
pub mod error;
pub mod filter;
pub mod monorepo;

pub use error::{ConfigError, ConveyorError, Result};
pub use filter::{filter_packages, FilterOptions};
pub use monorepo::{ChangeDetector, Package, Workspace};
