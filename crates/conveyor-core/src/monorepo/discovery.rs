//! Package discovery from npm/yarn/pnpm workspace manifests

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use glob::{glob, Pattern};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{ConfigError, Result, WorkspaceError};

use super::workspace::{Package, Workspace};

/// Fields of a `package.json` that matter for task orchestration
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageJson {
    name: Option<String>,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
    #[serde(default)]
    dependencies: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, serde_json::Value>,
    workspaces: Option<WorkspacesField>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WorkspacesField {
    Array(Vec<String>),
    Object { packages: Vec<String> },
}

#[derive(Debug, Deserialize)]
struct PnpmWorkspace {
    packages: Option<Vec<String>>,
}

/// Package discovery for a workspace root
pub struct PackageDiscovery {
    root: PathBuf,
}

impl PackageDiscovery {
    /// Create a new package discovery instance
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Discover every package and its workspace dependencies
    pub fn discover(&self) -> Result<Workspace> {
        let patterns = self.package_patterns()?;
        debug!(root = %self.root.display(), patterns = patterns.len(), "discovering packages");

        let (includes, excludes): (Vec<&String>, Vec<&String>) =
            patterns.iter().partition(|p| !p.starts_with('!'));
        let excludes = excludes
            .into_iter()
            .map(|p| {
                Pattern::new(&p[1..]).map_err(|e| ConfigError::InvalidPattern {
                    pattern: p.clone(),
                    message: e.to_string(),
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut manifests: BTreeSet<PathBuf> = BTreeSet::new();
        for pattern in includes {
            let candidates: Vec<PathBuf> = if pattern == "." {
                vec![self.root.clone()]
            } else {
                let full_pattern = self.root.join(pattern).to_string_lossy().to_string();
                glob(&full_pattern)
                    .map_err(|e| ConfigError::InvalidPattern {
                        pattern: pattern.clone(),
                        message: e.to_string(),
                    })?
                    .flatten()
                    .collect()
            };

            for path in candidates {
                let relative = path.strip_prefix(&self.root).unwrap_or(&path);
                if relative.components().any(|c| c.as_os_str() == "node_modules") {
                    continue;
                }
                if excludes.iter().any(|ex| ex.matches_path(relative)) {
                    continue;
                }
                let manifest = path.join("package.json");
                if path.is_dir() && manifest.exists() {
                    manifests.insert(manifest);
                }
            }
        }

        let mut parsed = Vec::new();
        for manifest in &manifests {
            let json = read_manifest(manifest)?;
            let name = json
                .name
                .clone()
                .ok_or_else(|| WorkspaceError::MissingName(manifest.clone()))?;
            parsed.push((name, manifest, json));
        }

        let packages = parsed.into_iter().map(|(name, manifest, json)| {
            let mut pkg = Package::new(
                name,
                manifest.parent().unwrap_or(self.root.as_path()).to_path_buf(),
            );
            pkg.scripts = json.scripts;
            // Non-workspace names are dropped by Workspace::from_packages
            pkg.dependencies = json
                .dependencies
                .into_keys()
                .chain(json.dev_dependencies.into_keys())
                .collect();
            pkg
        });

        let workspace = Workspace::from_packages(self.root.clone(), packages)?;
        info!(count = workspace.len(), "discovered packages");
        Ok(workspace)
    }

    /// Workspace globs from pnpm-workspace.yaml or the root package.json
    fn package_patterns(&self) -> Result<Vec<String>> {
        let pnpm_workspace = self.root.join("pnpm-workspace.yaml");
        if pnpm_workspace.exists() {
            let content = std::fs::read_to_string(&pnpm_workspace)?;
            let config: PnpmWorkspace =
                serde_yaml::from_str(&content).map_err(|e| WorkspaceError::ManifestParse {
                    path: pnpm_workspace.clone(),
                    message: e.to_string(),
                })?;
            return Ok(config
                .packages
                .unwrap_or_else(|| vec!["packages/*".to_string()]));
        }

        let package_json = self.root.join("package.json");
        if package_json.exists() {
            let root = read_manifest(&package_json)?;
            return match root.workspaces {
                Some(WorkspacesField::Array(arr)) => Ok(arr),
                Some(WorkspacesField::Object { packages }) => Ok(packages),
                // A lone package is a workspace of one
                None => Ok(vec![".".to_string()]),
            };
        }

        Err(WorkspaceError::NotFound(self.root.clone()).into())
    }
}

fn read_manifest(path: &Path) -> Result<PackageJson> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| {
        WorkspaceError::ManifestParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_discover_npm_workspaces() {
        let temp = TempDir::new().unwrap();
        write(
            temp.path(),
            "package.json",
            r#"{"name": "root", "workspaces": ["packages/*"]}"#,
        );
        write(
            temp.path(),
            "packages/core/package.json",
            r#"{"name": "core", "scripts": {"build": "tsc"}}"#,
        );
        write(
            temp.path(),
            "packages/app/package.json",
            r#"{"name": "app", "dependencies": {"core": "*", "react": "^18"}, "devDependencies": {"jest": "29"}}"#,
        );

        let ws = Workspace::load(temp.path()).unwrap();
        assert_eq!(ws.len(), 2);

        let core = ws.get("core").unwrap();
        assert_eq!(core.script("build"), Some("tsc"));

        let deps: Vec<&str> = ws.dependencies("app").collect();
        assert_eq!(deps, vec!["core"]);
    }

    #[test]
    fn test_discover_yarn_object_workspaces() {
        let temp = TempDir::new().unwrap();
        write(
            temp.path(),
            "package.json",
            r#"{"name": "root", "workspaces": {"packages": ["apps/*"]}}"#,
        );
        write(temp.path(), "apps/web/package.json", r#"{"name": "web"}"#);

        let ws = Workspace::load(temp.path()).unwrap();
        assert!(ws.get("web").is_some());
    }

    #[test]
    fn test_discover_pnpm_workspace() {
        let temp = TempDir::new().unwrap();
        write(
            temp.path(),
            "pnpm-workspace.yaml",
            "packages:\n  - 'packages/*'\n  - '!packages/legacy'\n",
        );
        write(temp.path(), "packages/a/package.json", r#"{"name": "a"}"#);
        write(temp.path(), "packages/legacy/package.json", r#"{"name": "legacy"}"#);

        let ws = Workspace::load(temp.path()).unwrap();
        assert!(ws.get("a").is_some());
        assert!(ws.get("legacy").is_none());
    }

    #[test]
    fn test_missing_name_is_error() {
        let temp = TempDir::new().unwrap();
        write(
            temp.path(),
            "package.json",
            r#"{"workspaces": ["packages/*"]}"#,
        );
        write(temp.path(), "packages/a/package.json", r#"{"version": "1.0.0"}"#);

        assert!(Workspace::load(temp.path()).is_err());
    }

    #[test]
    fn test_no_workspace() {
        let temp = TempDir::new().unwrap();
        assert!(Workspace::load(temp.path()).is_err());
    }
}
