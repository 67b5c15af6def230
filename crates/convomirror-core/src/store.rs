//! Local persistent store collaborator.
//!
//! The engine only sees [`LocalStore`]: a capability-scoped directory tree
//! with create-if-absent folders and idempotent file writes. [`FsStore`]
//! backs it with a filesystem root; [`MemoryStore`] keeps the same
//! contract in memory for tests and ephemeral mirrors.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Result, SyncError};

/// Hierarchical file store rooted at a user-granted directory. All paths
/// are relative to that root.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Verify the root is still present and writable. Called before every
    /// cycle; permission may be revoked between cycles.
    async fn verify_permission(&self) -> Result<()>;

    /// Create a directory chain, succeeding if it already exists.
    async fn ensure_dir(&self, dir: &Path) -> Result<()>;

    /// Write a file, replacing any previous content atomically.
    async fn write_file(&self, dir: &Path, name: &str, bytes: &[u8]) -> Result<()>;

    /// Read a file. A missing file is a normal condition, not an error.
    async fn read_file(&self, dir: &Path, name: &str) -> Result<Option<Vec<u8>>>;

    async fn file_exists(&self, dir: &Path, name: &str) -> Result<bool>;

    /// Names of the files directly inside `dir` (no recursion).
    async fn list_files(&self, dir: &Path) -> Result<Vec<String>>;
}

/// Filesystem-backed store.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, dir: &Path) -> PathBuf {
        self.root.join(dir)
    }
}

#[async_trait]
impl LocalStore for FsStore {
    async fn verify_permission(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            SyncError::Storage(format!("mirror root {} unavailable: {e}", self.root.display()))
        })?;
        let meta = tokio::fs::metadata(&self.root).await?;
        if meta.permissions().readonly() {
            return Err(SyncError::Storage(format!(
                "mirror root {} is read-only",
                self.root.display()
            )));
        }
        Ok(())
    }

    async fn ensure_dir(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(self.resolve(dir)).await?;
        Ok(())
    }

    async fn write_file(&self, dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
        let target = self.resolve(dir).join(name);
        // Write-then-rename so readers never observe a torn file.
        let tmp = self.resolve(dir).join(format!(".{name}.tmp"));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    async fn read_file(&self, dir: &Path, name: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.resolve(dir).join(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn file_exists(&self, dir: &Path, name: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(dir).join(name)).await?)
    }

    async fn list_files(&self, dir: &Path) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.resolve(dir)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                out.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        out.sort();
        Ok(out)
    }
}

fn normalize(path: &Path) -> String {
    let joined = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    joined.trim_matches('/').to_string()
}

/// In-memory store sharing the [`LocalStore`] contract. Interior mutability
/// keeps it usable behind a shared reference, like the filesystem one.
#[derive(Default)]
pub struct MemoryStore {
    dirs: Mutex<BTreeSet<String>>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(dir: &Path, name: &str) -> String {
        let dir = normalize(dir);
        if dir.is_empty() {
            name.to_string()
        } else {
            format!("{dir}/{name}")
        }
    }

    /// Snapshot of every stored path, for assertions.
    pub fn paths(&self) -> Vec<String> {
        self.files.lock().expect("store lock").keys().cloned().collect()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn verify_permission(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_dir(&self, dir: &Path) -> Result<()> {
        let mut dirs = self.dirs.lock().expect("store lock");
        let norm = normalize(dir);
        let mut cur = String::new();
        for part in norm.split('/').filter(|p| !p.is_empty()) {
            if !cur.is_empty() {
                cur.push('/');
            }
            cur.push_str(part);
            dirs.insert(cur.clone());
        }
        Ok(())
    }

    async fn write_file(&self, dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
        self.files
            .lock()
            .expect("store lock")
            .insert(Self::key(dir, name), bytes.to_vec());
        Ok(())
    }

    async fn read_file(&self, dir: &Path, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .files
            .lock()
            .expect("store lock")
            .get(&Self::key(dir, name))
            .cloned())
    }

    async fn file_exists(&self, dir: &Path, name: &str) -> Result<bool> {
        Ok(self
            .files
            .lock()
            .expect("store lock")
            .contains_key(&Self::key(dir, name)))
    }

    async fn list_files(&self, dir: &Path) -> Result<Vec<String>> {
        let prefix = {
            let norm = normalize(dir);
            if norm.is_empty() {
                norm
            } else {
                format!("{norm}/")
            }
        };
        let files = self.files.lock().expect("store lock");
        Ok(files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(|rest| rest.to_string())
            .collect())
    }
}
