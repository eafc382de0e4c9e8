//! Tree versions
//!
//! The source-file discovery and content-hashing layer is an external
//! collaborator; the core consumes it as a provider returning
//! `(content_hash, files)` for a config, caches results by
//! `(config_file_path, base_path)`, and round-trips cache entries through
//! content-addressed files with POSIX-normalized paths.

use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::action::TreeVersion;
use crate::error::{Result, TrellisError};

/// What the provider scans
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TreeVersionRequest {
    pub config_file_path: Utf8PathBuf,
    pub scan_root: Utf8PathBuf,
}

impl TreeVersionRequest {
    /// Resource key for caching and content addressing
    pub fn resource_key(&self) -> String {
        format!("{:016x}", xxh3_64(
            format!("{}\n{}", self.config_file_path, self.scan_root).as_bytes(),
        ))
    }
}

/// Must be deterministic for a given tree
#[async_trait]
pub trait TreeVersionProvider: Send + Sync {
    async fn get_tree_version(&self, request: &TreeVersionRequest) -> Result<TreeVersion>;
}

/// Normalize a path to POSIX form; hashing and cache files always use
/// forward slashes so hashes agree across platforms.
pub fn to_posix(path: &str) -> String {
    path.replace('\\', "/")
}

/// Hash a set of (path, content) pairs into a stable content hash.
/// Paths are POSIX-normalized and sorted first.
pub fn hash_files<'a>(files: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> TreeVersion {
    let mut entries: Vec<(String, &[u8])> = files
        .into_iter()
        .map(|(path, content)| (to_posix(path), content))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher_input = Vec::new();
    for (path, content) in &entries {
        hasher_input.extend_from_slice(path.as_bytes());
        hasher_input.push(0);
        hasher_input.extend_from_slice(&xxh3_64(content).to_le_bytes());
    }

    TreeVersion {
        content_hash: format!("{:016x}", xxh3_64(&hasher_input)),
        files: entries.into_iter().map(|(path, _)| path).collect(),
    }
}

/// Caching wrapper over a tree version provider.
///
/// Keyed by `(config_file_path, base_path)`; safe to share across tasks.
/// Scans for the same key serialize through a named lock, and entries
/// optionally persist as content-addressed files under a cache dir.
pub struct CachingTreeVersions {
    inner: Arc<dyn TreeVersionProvider>,
    cache: DashMap<String, TreeVersion>,
    scan_locks: crate::util::NamedLock,
    cache_dir: Option<Utf8PathBuf>,
}

impl CachingTreeVersions {
    pub fn new(inner: Arc<dyn TreeVersionProvider>) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
            scan_locks: crate::util::NamedLock::new(),
            cache_dir: None,
        }
    }

    /// Persist entries under `dir/<resource_key>.json`
    pub fn with_cache_dir(mut self, dir: Utf8PathBuf) -> Self {
        self.cache_dir = Some(dir);
        self
    }

    fn entry_path(&self, key: &str) -> Option<Utf8PathBuf> {
        self.cache_dir.as_ref().map(|dir| dir.join(format!("{key}.json")))
    }
}

#[async_trait]
impl TreeVersionProvider for CachingTreeVersions {
    async fn get_tree_version(&self, request: &TreeVersionRequest) -> Result<TreeVersion> {
        let key = request.resource_key();
        let _guard = self.scan_locks.acquire(&key).await;

        if let Some(cached) = self.cache.get(&key) {
            return Ok(cached.clone());
        }
        if let Some(path) = self.entry_path(&key) {
            if let Ok(version) = read_tree_version(&path).await {
                self.cache.insert(key, version.clone());
                return Ok(version);
            }
        }

        let version = self.inner.get_tree_version(request).await?;
        if let Some(path) = self.entry_path(&key) {
            if let Err(error) = write_tree_version(&path, &version).await {
                tracing::debug!(%path, %error, "skipping tree version cache write");
            }
        }
        self.cache.insert(key, version.clone());
        Ok(version)
    }
}

/// Scans the local filesystem. Hidden directories, `.git` and the
/// trellis dot-directory are skipped; paths hash in POSIX form so
/// content hashes agree across platforms.
pub struct LocalTreeVersions;

const SKIPPED_DIRS: &[&str] = &[".git", ".trellis", "target", "node_modules"];

#[async_trait]
impl TreeVersionProvider for LocalTreeVersions {
    async fn get_tree_version(&self, request: &TreeVersionRequest) -> Result<TreeVersion> {
        let root = request.scan_root.clone();
        let entries = tokio::task::spawn_blocking(move || walk_tree(&root))
            .await
            .map_err(|e| TrellisError::internal(format!("tree scan task failed: {e}")))??;

        let version = hash_files(
            entries
                .iter()
                .map(|(path, content)| (path.as_str(), content.as_slice())),
        );
        Ok(version)
    }
}

fn walk_tree(root: &Utf8Path) -> Result<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|source| TrellisError::Filesystem {
            path: dir.to_string(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| TrellisError::Filesystem {
                path: dir.to_string(),
                source,
            })?;
            let path = entry.path();
            let Ok(path) = Utf8PathBuf::from_path_buf(path) else {
                continue;
            };
            let name = path.file_name().unwrap_or_default();
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                if !SKIPPED_DIRS.contains(&name) {
                    stack.push(path);
                }
                continue;
            }
            let content = std::fs::read(&path).map_err(|source| TrellisError::Filesystem {
                path: path.to_string(),
                source,
            })?;
            let relative = path
                .strip_prefix(root)
                .map(|p| p.to_string())
                .unwrap_or_else(|_| path.to_string());
            out.push((relative, content));
        }
    }

    Ok(out)
}

/// Fixed tree versions, for tests and for actions without sources
pub struct StaticTreeVersions {
    default: TreeVersion,
}

impl StaticTreeVersions {
    pub fn new(default: TreeVersion) -> Self {
        Self { default }
    }

    pub fn empty() -> Self {
        Self::new(TreeVersion::empty())
    }
}

#[async_trait]
impl TreeVersionProvider for StaticTreeVersions {
    async fn get_tree_version(&self, _request: &TreeVersionRequest) -> Result<TreeVersion> {
        Ok(self.default.clone())
    }
}

#[derive(Serialize, Deserialize)]
struct TreeVersionFile {
    content_hash: String,
    files: Vec<String>,
}

/// Write a tree version cache entry. Paths are stored in POSIX form.
pub async fn write_tree_version(path: &Utf8Path, version: &TreeVersion) -> Result<()> {
    let record = TreeVersionFile {
        content_hash: version.content_hash.clone(),
        files: version.files.iter().map(|f| to_posix(f)).collect(),
    };
    let text = serde_json::to_string_pretty(&record)
        .map_err(|e| TrellisError::internal(format!("tree version serialization: {e}")))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| TrellisError::Filesystem {
                path: parent.to_string(),
                source,
            })?;
    }
    tokio::fs::write(path, text)
        .await
        .map_err(|source| TrellisError::Filesystem {
            path: path.to_string(),
            source,
        })
}

/// Read a tree version cache entry back
pub async fn read_tree_version(path: &Utf8Path) -> Result<TreeVersion> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| TrellisError::Filesystem {
            path: path.to_string(),
            source,
        })?;
    let record: TreeVersionFile = serde_json::from_str(&text)
        .map_err(|e| TrellisError::internal(format!("corrupt tree version file {path}: {e}")))?;
    Ok(TreeVersion {
        content_hash: record.content_hash,
        files: record.files.into_iter().map(|f| to_posix(&f)).collect(),
    })
}
