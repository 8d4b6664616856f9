//! Package selection for a run

use std::collections::BTreeSet;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::ConfigError;
use crate::monorepo::{Package, Workspace};

/// Which packages take part in a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptions {
    /// Package name globs; empty selects every package
    pub scope: Vec<String>,
    /// Pull in the transitive dependencies of scoped packages
    pub deps: bool,
    /// Keep only packages changed since this git revision
    pub since: Option<String>,
    /// Package name globs to drop
    pub ignore: Vec<String>,
}

/// Select the packages for a run.
///
/// Steps, in order: match `scope` (or take everything), add the dependency
/// closure when `deps` is set, keep packages for which `changed` holds when
/// `since` is set, then drop anything matching `ignore`. The `changed`
/// predicate is only consulted when `since` is set.
#[instrument(skip_all, fields(packages = workspace.len(), scope = options.scope.len()))]
pub fn filter_packages<F>(
    workspace: &Workspace,
    options: &FilterOptions,
    changed: F,
) -> Result<BTreeSet<String>, ConfigError>
where
    F: Fn(&Package) -> bool,
{
    let scope = compile(&options.scope)?;
    let ignore = compile(&options.ignore)?;

    let mut selected: BTreeSet<String> = if options.scope.is_empty() {
        workspace.names().map(str::to_string).collect()
    } else {
        workspace
            .names()
            .filter(|name| scope.is_match(name))
            .map(str::to_string)
            .collect()
    };
    debug!(matched = selected.len(), "scope applied");

    if options.deps {
        let closure: BTreeSet<String> = selected
            .iter()
            .flat_map(|name| workspace.transitive_dependencies(name))
            .collect();
        selected.extend(closure);
        debug!(selected = selected.len(), "dependency closure added");
    }

    if options.since.is_some() {
        selected.retain(|name| workspace.get(name).is_some_and(&changed));
        debug!(selected = selected.len(), "unchanged packages removed");
    }

    if !options.ignore.is_empty() {
        selected.retain(|name| !ignore.is_match(name));
    }

    Ok(selected)
}

fn compile(patterns: &[String]) -> Result<GlobSet, ConfigError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.clone(),
            message: e.kind().to_string(),
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|e| ConfigError::InvalidPattern {
        pattern: patterns.join(", "),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> Workspace {
        Workspace::from_packages(
            "/repo",
            vec![
                Package::new("@acme/core", "/repo/packages/core"),
                Package::new("@acme/utils", "/repo/packages/utils").with_dependency("@acme/core"),
                Package::new("@acme/app", "/repo/apps/app").with_dependency("@acme/utils"),
                Package::new("docs", "/repo/docs"),
            ],
        )
        .unwrap()
    }

    fn names(set: &BTreeSet<String>) -> Vec<&str> {
        set.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_empty_scope_selects_everything() {
        let selected = filter_packages(&workspace(), &FilterOptions::default(), |_| false).unwrap();
        assert_eq!(selected.len(), 4);
    }

    #[test]
    fn test_scope_glob() {
        let options = FilterOptions {
            scope: vec!["@acme/*".to_string()],
            ..Default::default()
        };
        let selected = filter_packages(&workspace(), &options, |_| false).unwrap();
        assert_eq!(names(&selected), vec!["@acme/app", "@acme/core", "@acme/utils"]);
    }

    #[test]
    fn test_scope_without_deps() {
        let options = FilterOptions {
            scope: vec!["@acme/app".to_string()],
            ..Default::default()
        };
        let selected = filter_packages(&workspace(), &options, |_| false).unwrap();
        assert_eq!(names(&selected), vec!["@acme/app"]);
    }

    #[test]
    fn test_deps_adds_closure() {
        let options = FilterOptions {
            scope: vec!["@acme/app".to_string()],
            deps: true,
            ..Default::default()
        };
        let selected = filter_packages(&workspace(), &options, |_| false).unwrap();
        assert_eq!(names(&selected), vec!["@acme/app", "@acme/core", "@acme/utils"]);
    }

    #[test]
    fn test_since_intersects_with_changed() {
        let options = FilterOptions {
            since: Some("origin/main".to_string()),
            ..Default::default()
        };
        let selected =
            filter_packages(&workspace(), &options, |pkg| pkg.name == "docs").unwrap();
        assert_eq!(names(&selected), vec!["docs"]);
    }

    #[test]
    fn test_changed_ignored_without_since() {
        let selected = filter_packages(&workspace(), &FilterOptions::default(), |_| false).unwrap();
        assert_eq!(selected.len(), 4);
    }

    #[test]
    fn test_ignore_subtracts() {
        let options = FilterOptions {
            scope: vec!["@acme/app".to_string()],
            deps: true,
            ignore: vec!["@acme/core".to_string()],
            ..Default::default()
        };
        let selected = filter_packages(&workspace(), &options, |_| false).unwrap();
        assert_eq!(names(&selected), vec!["@acme/app", "@acme/utils"]);
    }

    #[test]
    fn test_malformed_scope_is_config_error() {
        let options = FilterOptions {
            scope: vec!["@acme/[core".to_string()],
            ..Default::default()
        };
        let err = filter_packages(&workspace(), &options, |_| panic!("not consulted")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn test_malformed_ignore_is_config_error() {
        let options = FilterOptions {
            ignore: vec!["{docs".to_string()],
            ..Default::default()
        };
        assert!(filter_packages(&workspace(), &options, |_| true).is_err());
    }
}
