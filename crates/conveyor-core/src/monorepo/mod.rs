//! Monorepo support for multi-package workspaces
//!
//! - Workspace model with direct and transitive package dependencies
//! - Package discovery from npm, yarn and pnpm workspace manifests
//! - Change detection based on git diffs

pub mod changes;
pub mod discovery;
pub mod workspace;

pub use changes::ChangeDetector;
pub use discovery::PackageDiscovery;
pub use workspace::{Package, Workspace};
