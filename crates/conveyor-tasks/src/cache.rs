//! Content-addressable package cache

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use conveyor_core::monorepo::{Package, Workspace};

/// Cache key, compared by equality only
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage behind the cache nodes of the task graph.
///
/// Errors never fail a run: the scheduler downgrades them to misses or
/// skipped stores and reports a warning.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Compute the key for a package's current inputs
    async fn hash(&self, package: &Package) -> Result<CacheKey, CacheError>;

    /// Restore outputs stored under `key`. `Ok(true)` is a hit.
    async fn fetch(&self, package: &Package, key: &CacheKey) -> Result<bool, CacheError>;

    /// Store the package's outputs under `key`
    async fn put(&self, package: &Package, key: &CacheKey) -> Result<(), CacheError>;
}

/// A stored cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cache key
    pub key: CacheKey,
    /// Package the outputs belong to
    pub package: String,
    /// Tasks that produced the outputs
    pub tasks: Vec<String>,
    /// Output file paths (relative to the package root)
    pub output_files: Vec<String>,
    /// When this entry was created
    pub created_at: DateTime<Utc>,
}

const METADATA_FILE: &str = "metadata.json";
const OUTPUTS_DIR: &str = "outputs";
const SKIPPED_DIRS: [&str; 2] = ["node_modules", ".git"];

/// On-disk cache directory: entry storage and maintenance
#[derive(Debug, Clone)]
pub struct TaskCache {
    /// Cache directory
    cache_dir: PathBuf,
}

impl TaskCache {
    /// Create a new task cache
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(&key.0)
    }

    /// Read the entry stored under `key`, if any
    pub fn read_entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let metadata_path = self.entry_dir(key).join(METADATA_FILE);
        if !metadata_path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&metadata_path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Copy an entry's outputs into `package_root`
    pub fn restore(&self, entry: &CacheEntry, package_root: &Path) -> Result<(), CacheError> {
        let outputs = self.entry_dir(&entry.key).join(OUTPUTS_DIR);
        for relative in &entry.output_files {
            let target = package_root.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(outputs.join(relative), &target)?;
        }
        Ok(())
    }

    /// Store `files` (relative to `package_root`) under the entry's key
    pub fn write_entry(&self, entry: &CacheEntry, package_root: &Path) -> Result<(), CacheError> {
        let entry_dir = self.entry_dir(&entry.key);
        let outputs = entry_dir.join(OUTPUTS_DIR);
        fs::create_dir_all(&outputs)?;

        for relative in &entry.output_files {
            let target = outputs.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(package_root.join(relative), &target)?;
        }

        // Metadata goes last; its presence marks a complete entry
        let json = serde_json::to_string_pretty(entry)?;
        fs::write(entry_dir.join(METADATA_FILE), json)?;
        Ok(())
    }

    /// Remove old cache entries
    pub fn prune(&self, max_age: Duration) -> Result<PruneStats, CacheError> {
        info!(max_age_secs = max_age.as_secs(), "pruning cache");
        let mut stats = PruneStats::default();

        if !self.cache_dir.exists() {
            return Ok(stats);
        }

        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();

        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }

            stats.total += 1;

            let created = fs::read_to_string(path.join(METADATA_FILE))
                .ok()
                .and_then(|contents| serde_json::from_str::<CacheEntry>(&contents).ok())
                .map(|entry| entry.created_at);

            // Entries without readable metadata are incomplete and go too
            let expired = created.map_or(true, |created| created <= cutoff);
            if expired && fs::remove_dir_all(&path).is_ok() {
                stats.removed += 1;
            } else {
                stats.kept += 1;
            }
        }

        info!(
            total = stats.total,
            removed = stats.removed,
            kept = stats.kept,
            "cache prune complete"
        );
        Ok(stats)
    }

    /// Remove every entry
    pub fn clean(&self) -> Result<usize, CacheError> {
        if !self.cache_dir.exists() {
            return Ok(0);
        }
        let entries = self.status()?.entries;
        fs::remove_dir_all(&self.cache_dir)?;
        info!(entries, "cache cleaned");
        Ok(entries)
    }

    /// Get cache statistics
    pub fn status(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();

        if !self.cache_dir.exists() {
            return Ok(stats);
        }

        for entry in fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }

            stats.entries += 1;
            stats.total_size += WalkDir::new(&path)
                .into_iter()
                .flatten()
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum::<u64>();
        }

        Ok(stats)
    }

    /// Get the cache directory
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

/// Statistics from a prune operation
#[derive(Debug, Default, Serialize)]
pub struct PruneStats {
    /// Total entries found
    pub total: usize,
    /// Entries removed
    pub removed: usize,
    /// Entries kept
    pub kept: usize,
}

/// Cache statistics
#[derive(Debug, Default, Serialize)]
pub struct CacheStats {
    /// Number of cache entries
    pub entries: usize,
    /// Total size in bytes
    pub total_size: u64,
}

impl CacheStats {
    /// Format total size in human-readable form
    pub fn formatted_size(&self) -> String {
        if self.total_size < 1024 {
            format!("{} B", self.total_size)
        } else if self.total_size < 1024 * 1024 {
            format!("{:.1} KB", self.total_size as f64 / 1024.0)
        } else if self.total_size < 1024 * 1024 * 1024 {
            format!("{:.1} MB", self.total_size as f64 / (1024.0 * 1024.0))
        } else {
            format!(
                "{:.1} GB",
                self.total_size as f64 / (1024.0 * 1024.0 * 1024.0)
            )
        }
    }
}

/// Filesystem-backed [`CacheBackend`].
///
/// The key of a package covers its name, the requested tasks and their
/// script commands, the contents of its files (minus outputs and excludes),
/// and the content hashes of its transitive workspace dependencies. Content
/// hashes are memoized for the lifetime of the value, so build one per run.
#[derive(Clone)]
pub struct LocalCache {
    store: TaskCache,
    workspace: Arc<Workspace>,
    tasks: Arc<Vec<String>>,
    outputs: Arc<Vec<Pattern>>,
    exclude: Arc<Vec<Pattern>>,
    content_hashes: Arc<Mutex<HashMap<String, String>>>,
}

impl LocalCache {
    /// Create a backend for a run of `tasks` over `workspace`
    pub fn new(
        store: TaskCache,
        workspace: Arc<Workspace>,
        tasks: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut tasks: Vec<String> = tasks.into_iter().map(Into::into).collect();
        tasks.sort();
        tasks.dedup();
        Self {
            store,
            workspace,
            tasks: Arc::new(tasks),
            outputs: Arc::new(Vec::new()),
            exclude: Arc::new(Vec::new()),
            content_hashes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Set the output globs (relative to each package root)
    pub fn with_outputs(mut self, globs: &[String]) -> Result<Self, CacheError> {
        self.outputs = Arc::new(compile_patterns(globs)?);
        Ok(self)
    }

    /// Set globs excluded from hashing
    pub fn with_exclude(mut self, globs: &[String]) -> Result<Self, CacheError> {
        self.exclude = Arc::new(compile_patterns(globs)?);
        Ok(self)
    }

    /// Underlying store
    pub fn store(&self) -> &TaskCache {
        &self.store
    }

    fn compute_key(&self, package: &Package) -> Result<CacheKey, CacheError> {
        let mut hasher = Sha256::new();
        hasher.update(package.name.as_bytes());

        for task in self.tasks.iter() {
            hasher.update(b"\0task:");
            hasher.update(task.as_bytes());
            if let Some(command) = package.script(task) {
                hasher.update(b"=");
                hasher.update(command.as_bytes());
            }
        }

        hasher.update(b"\0content:");
        hasher.update(self.content_hash(package)?.as_bytes());

        for dep in self.workspace.transitive_dependencies(&package.name) {
            if let Some(dep_pkg) = self.workspace.get(&dep) {
                hasher.update(b"\0dep:");
                hasher.update(dep.as_bytes());
                hasher.update(self.content_hash(dep_pkg)?.as_bytes());
            }
        }

        Ok(CacheKey(format!("{:x}", hasher.finalize())))
    }

    fn content_hash(&self, package: &Package) -> Result<String, CacheError> {
        if let Some(hash) = self.memo().get(&package.name) {
            return Ok(hash.clone());
        }

        let mut files: BTreeMap<String, String> = BTreeMap::new();
        for path in self.package_files(&package.root) {
            let relative = relative_path(&package.root, &path);
            if matches_any(&self.outputs, &relative) || matches_any(&self.exclude, &relative) {
                continue;
            }
            let contents = fs::read(&path)?;
            files.insert(relative, format!("{:x}", Sha256::digest(&contents)));
        }

        let mut hasher = Sha256::new();
        for (path, hash) in &files {
            hasher.update(path.as_bytes());
            hasher.update(b"\0");
            hasher.update(hash.as_bytes());
        }
        let hash = format!("{:x}", hasher.finalize());

        debug!(package = %package.name, files = files.len(), "hashed package contents");
        self.memo().insert(package.name.clone(), hash.clone());
        Ok(hash)
    }

    fn memo(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.content_hashes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Regular files under `root`, skipping dependency folders and the cache itself
    fn package_files(&self, root: &Path) -> Vec<PathBuf> {
        let cache_dir = self.store.cache_dir().to_path_buf();
        WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                let skipped = entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| SKIPPED_DIRS.contains(&name));
                !skipped && !entry.path().starts_with(&cache_dir)
            })
            .flatten()
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect()
    }

    fn output_files(&self, root: &Path) -> Vec<String> {
        self.package_files(root)
            .iter()
            .map(|path| relative_path(root, path))
            .filter(|relative| matches_any(&self.outputs, relative))
            .collect()
    }

    fn fetch_blocking(&self, package: &Package, key: &CacheKey) -> Result<bool, CacheError> {
        let Some(entry) = self.store.read_entry(key)? else {
            debug!(package = %package.name, "cache miss");
            return Ok(false);
        };
        self.store.restore(&entry, &package.root)?;
        debug!(package = %package.name, files = entry.output_files.len(), "cache hit");
        Ok(true)
    }

    fn put_blocking(&self, package: &Package, key: &CacheKey) -> Result<(), CacheError> {
        let entry = CacheEntry {
            key: key.clone(),
            package: package.name.clone(),
            tasks: self.tasks.to_vec(),
            output_files: self.output_files(&package.root),
            created_at: Utc::now(),
        };
        debug!(package = %package.name, files = entry.output_files.len(), "storing outputs");
        self.store.write_entry(&entry, &package.root)
    }
}

#[async_trait]
impl CacheBackend for LocalCache {
    #[instrument(skip_all, fields(package = %package.name))]
    async fn hash(&self, package: &Package) -> Result<CacheKey, CacheError> {
        let this = self.clone();
        let package = package.clone();
        tokio::task::spawn_blocking(move || this.compute_key(&package)).await?
    }

    #[instrument(skip_all, fields(package = %package.name))]
    async fn fetch(&self, package: &Package, key: &CacheKey) -> Result<bool, CacheError> {
        let this = self.clone();
        let package = package.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || this.fetch_blocking(&package, &key)).await?
    }

    #[instrument(skip_all, fields(package = %package.name))]
    async fn put(&self, package: &Package, key: &CacheKey) -> Result<(), CacheError> {
        let this = self.clone();
        let package = package.clone();
        let key = key.clone();
        tokio::task::spawn_blocking(move || this.put_blocking(&package, &key)).await?
    }
}

fn compile_patterns(globs: &[String]) -> Result<Vec<Pattern>, CacheError> {
    globs
        .iter()
        .map(|glob| {
            Pattern::new(glob).map_err(|e| CacheError::InvalidPattern {
                pattern: glob.clone(),
                message: e.msg.to_string(),
            })
        })
        .collect()
}

fn matches_any(patterns: &[Pattern], relative: &str) -> bool {
    patterns.iter().any(|p| p.matches(relative))
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Cache errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// IO error
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Cache serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bad output or exclude glob
    #[error("Invalid cache pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// Blocking cache work panicked or was cancelled
    #[error("Cache worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        workspace: Arc<Workspace>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let core = temp.path().join("packages/core");
            let app = temp.path().join("packages/app");
            for dir in [&core, &app] {
                fs::create_dir_all(dir.join("src")).unwrap();
            }
            fs::write(core.join("src/index.js"), "export const x = 1;").unwrap();
            fs::write(app.join("src/main.js"), "import { x } from 'core';").unwrap();

            let workspace = Workspace::from_packages(
                temp.path(),
                vec![
                    Package::new("core", &core).with_script("build", "tsc"),
                    Package::new("app", &app)
                        .with_dependency("core")
                        .with_script("build", "tsc"),
                ],
            )
            .unwrap();

            Self {
                temp,
                workspace: Arc::new(workspace),
            }
        }

        fn cache(&self) -> LocalCache {
            LocalCache::new(
                TaskCache::new(self.temp.path().join(".conveyor/cache")),
                self.workspace.clone(),
                ["build"],
            )
            .with_outputs(&["dist/**".to_string()])
            .unwrap()
        }

        fn package(&self, name: &str) -> Package {
            self.workspace.get(name).unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_hash_deterministic() {
        let fx = Fixture::new();
        let core = fx.package("core");

        let key1 = fx.cache().hash(&core).await.unwrap();
        let key2 = fx.cache().hash(&core).await.unwrap();
        assert_eq!(key1, key2);
    }

    #[tokio::test]
    async fn test_hash_differs_on_tasks() {
        let fx = Fixture::new();
        let core = fx.package("core");

        let build = fx.cache().hash(&core).await.unwrap();
        let test = LocalCache::new(
            TaskCache::new(fx.temp.path().join(".conveyor/cache")),
            fx.workspace.clone(),
            ["build", "test"],
        )
        .hash(&core)
        .await
        .unwrap();
        assert_ne!(build, test);
    }

    #[tokio::test]
    async fn test_dependency_change_changes_key() {
        let fx = Fixture::new();
        let app = fx.package("app");
        let before = fx.cache().hash(&app).await.unwrap();

        fs::write(
            fx.package("core").root.join("src/index.js"),
            "export const x = 2;",
        )
        .unwrap();

        let after = fx.cache().hash(&app).await.unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_outputs_not_hashed() {
        let fx = Fixture::new();
        let core = fx.package("core");
        let before = fx.cache().hash(&core).await.unwrap();

        fs::create_dir_all(core.root.join("dist")).unwrap();
        fs::write(core.root.join("dist/index.js"), "compiled").unwrap();
        fs::create_dir_all(core.root.join("node_modules/left-pad")).unwrap();
        fs::write(core.root.join("node_modules/left-pad/index.js"), "pad").unwrap();

        let after = fx.cache().hash(&core).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_fetch_miss() {
        let fx = Fixture::new();
        let core = fx.package("core");
        let cache = fx.cache();

        let key = cache.hash(&core).await.unwrap();
        assert!(!cache.fetch(&core, &key).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_then_fetch_restores_outputs() {
        let fx = Fixture::new();
        let core = fx.package("core");
        let cache = fx.cache();

        let key = cache.hash(&core).await.unwrap();
        fs::create_dir_all(core.root.join("dist/nested")).unwrap();
        fs::write(core.root.join("dist/nested/index.js"), "compiled").unwrap();
        cache.put(&core, &key).await.unwrap();

        fs::remove_dir_all(core.root.join("dist")).unwrap();
        assert!(cache.fetch(&core, &key).await.unwrap());
        assert_eq!(
            fs::read_to_string(core.root.join("dist/nested/index.js")).unwrap(),
            "compiled"
        );

        let entry = cache.store().read_entry(&key).unwrap().unwrap();
        assert_eq!(entry.package, "core");
        assert_eq!(entry.output_files, vec!["dist/nested/index.js".to_string()]);
    }

    #[test]
    fn test_invalid_output_pattern() {
        let fx = Fixture::new();
        let result = LocalCache::new(
            TaskCache::new(fx.temp.path().join("cache")),
            fx.workspace.clone(),
            ["build"],
        )
        .with_outputs(&["dist/[".to_string()]);
        assert!(matches!(result, Err(CacheError::InvalidPattern { .. })));
    }

    #[tokio::test]
    async fn test_status_prune_and_clean() {
        let fx = Fixture::new();
        let core = fx.package("core");
        let cache = fx.cache();

        let key = cache.hash(&core).await.unwrap();
        cache.put(&core, &key).await.unwrap();

        let store = cache.store();
        let stats = store.status().unwrap();
        assert_eq!(stats.entries, 1);
        assert!(stats.total_size > 0);

        let kept = store.prune(Duration::from_secs(3600)).unwrap();
        assert_eq!(kept.kept, 1);
        assert_eq!(kept.removed, 0);

        assert_eq!(store.clean().unwrap(), 1);
        assert_eq!(store.status().unwrap().entries, 0);
    }

    #[test]
    fn test_prune_removes_old_entries() {
        let temp = TempDir::new().unwrap();
        let store = TaskCache::new(temp.path().join("cache"));
        let entry = CacheEntry {
            key: CacheKey("old".to_string()),
            package: "core".to_string(),
            tasks: vec!["build".to_string()],
            output_files: Vec::new(),
            created_at: Utc::now() - chrono::Duration::days(30),
        };
        store.write_entry(&entry, temp.path()).unwrap();

        let stats = store.prune(Duration::from_secs(7 * 24 * 3600)).unwrap();
        assert_eq!(stats.removed, 1);
        assert!(store.read_entry(&entry.key).unwrap().is_none());
    }

    #[test]
    fn test_cache_status_empty() {
        let temp = TempDir::new().unwrap();
        let cache = TaskCache::new(temp.path().join("cache"));

        let stats = cache.status().unwrap();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_size, 0);
        assert_eq!(cache.clean().unwrap(), 0);
    }

    #[test]
    fn test_cache_stats_formatted_size() {
        let stats = CacheStats {
            entries: 0,
            total_size: 1536,
        };
        assert_eq!(stats.formatted_size(), "1.5 KB");

        let stats = CacheStats {
            entries: 0,
            total_size: 500,
        };
        assert_eq!(stats.formatted_size(), "500 B");
    }
}
