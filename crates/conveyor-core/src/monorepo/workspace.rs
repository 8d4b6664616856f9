//! Workspace and package model

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, WorkspaceError};

/// A package in the workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Package name (unique within the workspace)
    pub name: String,
    /// Package root directory
    pub root: PathBuf,
    /// Direct dependencies on other workspace packages
    pub dependencies: BTreeSet<String>,
    /// Scripts declared in the manifest (name -> command)
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
}

impl Package {
    /// Create a package with no dependencies or scripts
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            dependencies: BTreeSet::new(),
            scripts: BTreeMap::new(),
        }
    }

    /// Add a direct workspace dependency
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.dependencies.insert(name.into());
        self
    }

    /// Add a script
    pub fn with_script(mut self, name: impl Into<String>, command: impl Into<String>) -> Self {
        self.scripts.insert(name.into(), command.into());
        self
    }

    /// Command for a script, if the package declares it
    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts.get(name).map(String::as_str)
    }
}

/// A loaded workspace. Read-only once built.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Root path of the workspace
    pub root: PathBuf,
    /// Packages keyed by name
    packages: BTreeMap<String, Package>,
}

impl Workspace {
    /// Build a workspace from already-loaded packages.
    ///
    /// Dependencies naming packages outside the workspace are dropped so
    /// every edge points at a known package.
    pub fn from_packages(
        root: impl Into<PathBuf>,
        packages: impl IntoIterator<Item = Package>,
    ) -> Result<Self> {
        let mut map: BTreeMap<String, Package> = BTreeMap::new();
        for pkg in packages {
            if let Some(existing) = map.get(&pkg.name) {
                return Err(WorkspaceError::DuplicatePackage {
                    name: pkg.name.clone(),
                    first: existing.root.clone(),
                    second: pkg.root.clone(),
                }
                .into());
            }
            map.insert(pkg.name.clone(), pkg);
        }

        let names: BTreeSet<String> = map.keys().cloned().collect();
        for pkg in map.values_mut() {
            pkg.dependencies.retain(|dep| names.contains(dep) && dep != &pkg.name);
        }

        debug!(packages = map.len(), "workspace assembled");
        Ok(Self {
            root: root.into(),
            packages: map,
        })
    }

    /// Discover packages from the manifests under `root`
    pub fn load(root: &Path) -> Result<Self> {
        super::discovery::PackageDiscovery::new(root.to_path_buf()).discover()
    }

    /// Get a package by name
    pub fn get(&self, name: &str) -> Option<&Package> {
        self.packages.get(name)
    }

    /// All packages, ordered by name
    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    /// All package names, ordered
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    /// Number of packages
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Whether the workspace has no packages
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Direct workspace dependencies of a package
    pub fn dependencies(&self, name: &str) -> impl Iterator<Item = &str> {
        self.packages
            .get(name)
            .into_iter()
            .flat_map(|p| p.dependencies.iter().map(String::as_str))
    }

    /// All packages `name` depends on, directly or transitively
    pub fn transitive_dependencies(&self, name: &str) -> BTreeSet<String> {
        let mut deps = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(name);

        while let Some(current) = queue.pop_front() {
            for dep in self.dependencies(current) {
                if deps.insert(dep.to_string()) {
                    queue.push_back(dep);
                }
            }
        }

        deps.remove(name);
        deps
    }

    /// Find the package whose root contains `path` (relative to the
    /// workspace root or absolute). The deepest root wins.
    pub fn package_for_path(&self, path: &Path) -> Option<&Package> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        self.packages
            .values()
            .filter(|pkg| {
                let root = if pkg.root.is_absolute() {
                    pkg.root.clone()
                } else {
                    self.root.join(&pkg.root)
                };
                absolute.starts_with(root)
            })
            .max_by_key(|pkg| pkg.root.components().count())
    }
}
