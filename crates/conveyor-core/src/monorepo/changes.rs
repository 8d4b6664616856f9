//! Change detection for `--since`

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::error::{GitError, Result};

use super::workspace::{Package, Workspace};

/// Detects which packages changed relative to a git revision
pub struct ChangeDetector {
    /// Root path of the workspace
    root: PathBuf,
}

impl ChangeDetector {
    /// Create a new change detector
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Names of packages with changes since `since`.
    ///
    /// Covers committed and uncommitted edits to tracked files plus
    /// untracked files that are not ignored.
    pub fn changed_packages(&self, workspace: &Workspace, since: &str) -> Result<BTreeSet<String>> {
        let mut files = self.git_lines(&["diff", "--name-only", since])?;
        files.extend(self.git_lines(&["ls-files", "--others", "--exclude-standard"])?);
        debug!(since, files = files.len(), "collected changed files");

        let changed = Self::map_files_to_packages(workspace, &files);
        info!(since, changed_packages = changed.len(), "change detection complete");
        Ok(changed)
    }

    /// Map changed files to the packages that contain them
    pub fn map_files_to_packages(workspace: &Workspace, files: &[PathBuf]) -> BTreeSet<String> {
        files
            .iter()
            .filter_map(|file| workspace.package_for_path(file))
            .map(|pkg: &Package| pkg.name.clone())
            .collect()
    }

    fn git_lines(&self, args: &[&str]) -> Result<Vec<PathBuf>> {
        let output = Command::new("git")
            .current_dir(&self.root)
            .args(args)
            .output()
            .map_err(|e| GitError::SpawnFailed(e.to_string()))?;

        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// Workspace root this detector runs git in
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> Workspace {
        Workspace::from_packages(
            "/repo",
            vec![
                Package::new("pkg-a", "/repo/packages/pkg-a"),
                Package::new("pkg-b", "/repo/packages/pkg-b").with_dependency("pkg-a"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_map_files_to_packages() {
        let ws = workspace();
        let files = vec![
            PathBuf::from("packages/pkg-a/src/index.js"),
            PathBuf::from("packages/pkg-a/package.json"),
            PathBuf::from("README.md"),
        ];

        let changed = ChangeDetector::map_files_to_packages(&ws, &files);
        assert_eq!(changed.len(), 1);
        assert!(changed.contains("pkg-a"));
    }

    #[test]
    fn test_prefix_is_not_a_package_match() {
        let ws = workspace();
        let files = vec![PathBuf::from("packages/pkg-a-extra/index.js")];
        assert!(ChangeDetector::map_files_to_packages(&ws, &files).is_empty());
    }

    #[test]
    fn test_git_failure_outside_repo() {
        let temp = tempfile::TempDir::new().unwrap();
        let detector = ChangeDetector::new(temp.path().to_path_buf());
        let result = detector.changed_packages(&workspace(), "HEAD~1");
        assert!(result.is_err());
    }
}
