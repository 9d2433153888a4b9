//! Handle-based access to the bundle's private storage.
//!
//! Entries are opened into an arena and addressed by a [`Handle`] until the
//! caller explicitly releases them. Nothing is released implicitly: every
//! handle obtained from [`ResourceStore::open`], [`ResourceStore::open_child`],
//! [`ResourceStore::create_child`] or [`ResourceStore::create_dir`] must be
//! passed to [`ResourceStore::release`]. The [`StoreExt`] helpers do this on
//! every path, including failures.
//!
//! Paths are `/`-separated and relative to the store root; the empty path is
//! the root itself.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use crate::error::StoreError;

/// Key of a live entry in a store's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Hierarchical file store addressed through explicitly released handles.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Open an existing file or directory by path.
    async fn open(&self, path: &str) -> Result<Handle, StoreError>;

    /// Open an existing child of `dir`.
    async fn open_child(&self, dir: Handle, name: &str) -> Result<Handle, StoreError>;

    /// Create (or with `exclusive == false`, reuse) a file under `dir`.
    /// Existing content is kept until the next write.
    async fn create_child(
        &self,
        dir: Handle,
        name: &str,
        exclusive: bool,
    ) -> Result<Handle, StoreError>;

    /// Create (or reuse) a directory under `dir`.
    async fn create_dir(&self, dir: Handle, name: &str, exclusive: bool)
        -> Result<Handle, StoreError>;

    /// Names of the direct children of `dir`, sorted.
    async fn list(&self, dir: Handle) -> Result<Vec<String>, StoreError>;

    async fn read(&self, file: Handle) -> Result<Vec<u8>, StoreError>;

    /// Replace the file's content, or append to it when `append` is set.
    async fn write(&self, file: Handle, bytes: &[u8], append: bool) -> Result<(), StoreError>;

    /// Delete the entry; directories are removed recursively. The handle
    /// still has to be released afterwards.
    async fn remove(&self, entry: Handle) -> Result<(), StoreError>;

    /// Drop the handle from the arena.
    fn release(&self, handle: Handle) -> Result<(), StoreError>;
}

/// Path-level conveniences built only on [`ResourceStore`].
#[async_trait]
pub trait StoreExt: ResourceStore {
    /// Read a whole file, `None` when it does not exist.
    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let handle = match self.open(path).await {
            Ok(handle) => handle,
            Err(StoreError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let result = self.read(handle).await;
        let released = self.release(handle);
        let bytes = result?;
        released?;
        Ok(Some(bytes))
    }

    /// Write a whole file, creating missing parent directories.
    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let (parent, name) = split_parent(path)?;
        let dir = self.ensure_dir(parent).await?;
        let created = self.create_child(dir, name, false).await;
        let released_dir = self.release(dir);
        let file = created?;
        released_dir?;

        let written = self.write(file, bytes, false).await;
        let released = self.release(file);
        written?;
        released
    }

    /// Remove an entry if present; reports whether something was removed.
    async fn remove_if_exists(&self, path: &str) -> Result<bool, StoreError> {
        let handle = match self.open(path).await {
            Ok(handle) => handle,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        let removed = match self.remove(handle).await {
            Ok(()) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        };
        let released = self.release(handle);
        let removed = removed?;
        released?;
        Ok(removed)
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        match self.open(path).await {
            Ok(handle) => {
                self.release(handle)?;
                Ok(true)
            }
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Open `path` as a directory, creating every missing component.
    /// The returned handle must be released by the caller.
    async fn ensure_dir(&self, path: &str) -> Result<Handle, StoreError> {
        let mut current = self.open("").await?;
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            let next = self.create_dir(current, segment, false).await;
            let released = self.release(current);
            current = next?;
            released?;
        }
        Ok(current)
    }
}

impl<S: ResourceStore + ?Sized> StoreExt for S {}

fn split_parent(path: &str) -> Result<(&str, &str), StoreError> {
    let trimmed = path.trim_matches('/');
    let (parent, name) = match trimmed.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", trimmed),
    };
    if name.is_empty() {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok((parent, name))
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\')
    {
        return Err(StoreError::InvalidPath(name.to_string()));
    }
    Ok(())
}

/// Normalise a store path, rejecting anything that could leave the root.
fn normalize(path: &str) -> Result<String, StoreError> {
    let mut segments = Vec::new();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => segments.push(
                part.to_str()
                    .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?
                    .to_string(),
            ),
            Component::CurDir => {}
            _ => return Err(StoreError::InvalidPath(path.to_string())),
        }
    }
    Ok(segments.join("/"))
}

/// Live entries keyed by generated handle ids.
struct Arena<T> {
    next: AtomicU64,
    entries: Mutex<HashMap<u64, T>>,
}

impl<T: Clone> Arena<T> {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, entry: T) -> Handle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, entry);
        Handle(id)
    }

    fn get(&self, handle: Handle) -> Result<T, StoreError> {
        self.entries
            .lock()
            .get(&handle.0)
            .cloned()
            .ok_or(StoreError::InvalidHandle(handle.0))
    }

    fn release(&self, handle: Handle) -> Result<(), StoreError> {
        self.entries
            .lock()
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(StoreError::InvalidHandle(handle.0))
    }

    fn live(&self) -> usize {
        self.entries.lock().len()
    }
}

#[derive(Clone)]
struct FsEntry {
    rel: String,
    path: PathBuf,
}

/// [`ResourceStore`] backed by a directory on the local filesystem.
pub struct FsStore {
    root: PathBuf,
    arena: Arena<FsEntry>,
}

impl FsStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|err| {
            tracing::error!(root = %root.display(), %err, "cannot open storage root");
            StoreError::StorageUnavailable(root.clone())
        })?;
        Ok(Self {
            root,
            arena: Arena::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of handles not yet released.
    pub fn live_handles(&self) -> usize {
        self.arena.live()
    }

    fn entry(&self, rel: String) -> FsEntry {
        let path = if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&rel)
        };
        FsEntry { rel, path }
    }

    async fn directory(&self, handle: Handle) -> Result<FsEntry, StoreError> {
        let entry = self.arena.get(handle)?;
        let metadata = tokio::fs::metadata(&entry.path)
            .await
            .map_err(|err| map_io(err, &entry.rel))?;
        if !metadata.is_dir() {
            return Err(StoreError::NotADirectory(entry.rel));
        }
        Ok(entry)
    }

    async fn file(&self, handle: Handle) -> Result<FsEntry, StoreError> {
        let entry = self.arena.get(handle)?;
        let metadata = tokio::fs::metadata(&entry.path)
            .await
            .map_err(|err| map_io(err, &entry.rel))?;
        if metadata.is_dir() {
            return Err(StoreError::NotAFile(entry.rel));
        }
        Ok(entry)
    }
}

fn map_io(err: std::io::Error, rel: &str) -> StoreError {
    match err.kind() {
        std::io::ErrorKind::NotFound => StoreError::NotFound(rel.to_string()),
        std::io::ErrorKind::AlreadyExists => StoreError::AlreadyExists(rel.to_string()),
        _ => StoreError::Io(err),
    }
}

#[async_trait]
impl ResourceStore for FsStore {
    async fn open(&self, path: &str) -> Result<Handle, StoreError> {
        let entry = self.entry(normalize(path)?);
        tokio::fs::metadata(&entry.path)
            .await
            .map_err(|err| map_io(err, &entry.rel))?;
        Ok(self.arena.insert(entry))
    }

    async fn open_child(&self, dir: Handle, name: &str) -> Result<Handle, StoreError> {
        validate_name(name)?;
        let parent = self.directory(dir).await?;
        let entry = self.entry(join(&parent.rel, name));
        tokio::fs::metadata(&entry.path)
            .await
            .map_err(|err| map_io(err, &entry.rel))?;
        Ok(self.arena.insert(entry))
    }

    async fn create_child(
        &self,
        dir: Handle,
        name: &str,
        exclusive: bool,
    ) -> Result<Handle, StoreError> {
        validate_name(name)?;
        let parent = self.directory(dir).await?;
        let entry = self.entry(join(&parent.rel, name));
        if let Ok(metadata) = tokio::fs::metadata(&entry.path).await {
            if metadata.is_dir() {
                return Err(StoreError::NotAFile(entry.rel));
            }
        }
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true);
        if exclusive {
            options.create_new(true);
        } else {
            options.create(true);
        }
        options
            .open(&entry.path)
            .await
            .map_err(|err| map_io(err, &entry.rel))?;
        Ok(self.arena.insert(entry))
    }

    async fn create_dir(
        &self,
        dir: Handle,
        name: &str,
        exclusive: bool,
    ) -> Result<Handle, StoreError> {
        validate_name(name)?;
        let parent = self.directory(dir).await?;
        let entry = self.entry(join(&parent.rel, name));
        match tokio::fs::create_dir(&entry.path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && !exclusive => {
                let metadata = tokio::fs::metadata(&entry.path)
                    .await
                    .map_err(|err| map_io(err, &entry.rel))?;
                if !metadata.is_dir() {
                    return Err(StoreError::NotADirectory(entry.rel));
                }
            }
            Err(err) => return Err(map_io(err, &entry.rel)),
        }
        Ok(self.arena.insert(entry))
    }

    async fn list(&self, dir: Handle) -> Result<Vec<String>, StoreError> {
        let entry = self.directory(dir).await?;
        let mut reader = tokio::fs::read_dir(&entry.path)
            .await
            .map_err(|err| map_io(err, &entry.rel))?;
        let mut names = Vec::new();
        while let Some(child) = reader.next_entry().await? {
            if let Some(name) = child.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read(&self, file: Handle) -> Result<Vec<u8>, StoreError> {
        let entry = self.file(file).await?;
        tokio::fs::read(&entry.path)
            .await
            .map_err(|err| map_io(err, &entry.rel))
    }

    async fn write(&self, file: Handle, bytes: &[u8], append: bool) -> Result<(), StoreError> {
        let entry = self.file(file).await?;
        let mut options = tokio::fs::OpenOptions::new();
        if append {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        let mut handle = options
            .open(&entry.path)
            .await
            .map_err(|err| map_io(err, &entry.rel))?;
        handle.write_all(bytes).await?;
        handle.flush().await?;
        handle.sync_all().await?;
        Ok(())
    }

    async fn remove(&self, entry: Handle) -> Result<(), StoreError> {
        let entry = self.arena.get(entry)?;
        if entry.rel.is_empty() {
            return Err(StoreError::InvalidPath("refusing to remove the store root".into()));
        }
        let metadata = tokio::fs::metadata(&entry.path)
            .await
            .map_err(|err| map_io(err, &entry.rel))?;
        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&entry.path).await
        } else {
            tokio::fs::remove_file(&entry.path).await
        };
        removed.map_err(|err| map_io(err, &entry.rel))
    }

    fn release(&self, handle: Handle) -> Result<(), StoreError> {
        self.arena.release(handle)
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

/// In-process [`ResourceStore`]; useful for embedding hosts and tests.
pub struct MemoryStore {
    nodes: Mutex<BTreeMap<String, Node>>,
    arena: Arena<String>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(String::new(), Node::Dir);
        Self {
            nodes: Mutex::new(nodes),
            arena: Arena::new(),
        }
    }

    /// Content of the file at `path`, if it is a file.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        let key = normalize(path).ok()?;
        match self.nodes.lock().get(&key) {
            Some(Node::File(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// Paths of every file currently stored.
    pub fn file_paths(&self) -> Vec<String> {
        self.nodes
            .lock()
            .iter()
            .filter(|(_, node)| matches!(node, Node::File(_)))
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Number of handles not yet released.
    pub fn live_handles(&self) -> usize {
        self.arena.live()
    }

    fn directory(&self, handle: Handle) -> Result<String, StoreError> {
        let path = self.arena.get(handle)?;
        match self.nodes.lock().get(&path) {
            Some(Node::Dir) => Ok(path),
            Some(Node::File(_)) => Err(StoreError::NotADirectory(path)),
            None => Err(StoreError::NotFound(path)),
        }
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn open(&self, path: &str) -> Result<Handle, StoreError> {
        let key = normalize(path)?;
        if !self.nodes.lock().contains_key(&key) {
            return Err(StoreError::NotFound(key));
        }
        Ok(self.arena.insert(key))
    }

    async fn open_child(&self, dir: Handle, name: &str) -> Result<Handle, StoreError> {
        validate_name(name)?;
        let key = join(&self.directory(dir)?, name);
        if !self.nodes.lock().contains_key(&key) {
            return Err(StoreError::NotFound(key));
        }
        Ok(self.arena.insert(key))
    }

    async fn create_child(
        &self,
        dir: Handle,
        name: &str,
        exclusive: bool,
    ) -> Result<Handle, StoreError> {
        validate_name(name)?;
        let key = join(&self.directory(dir)?, name);
        {
            let mut nodes = self.nodes.lock();
            match nodes.get(&key) {
                Some(Node::Dir) => return Err(StoreError::NotAFile(key)),
                Some(Node::File(_)) if exclusive => return Err(StoreError::AlreadyExists(key)),
                Some(Node::File(_)) => {}
                None => {
                    nodes.insert(key.clone(), Node::File(Vec::new()));
                }
            }
        }
        Ok(self.arena.insert(key))
    }

    async fn create_dir(
        &self,
        dir: Handle,
        name: &str,
        exclusive: bool,
    ) -> Result<Handle, StoreError> {
        validate_name(name)?;
        let key = join(&self.directory(dir)?, name);
        {
            let mut nodes = self.nodes.lock();
            match nodes.get(&key) {
                Some(Node::File(_)) => return Err(StoreError::NotADirectory(key)),
                Some(Node::Dir) if exclusive => return Err(StoreError::AlreadyExists(key)),
                Some(Node::Dir) => {}
                None => {
                    nodes.insert(key.clone(), Node::Dir);
                }
            }
        }
        Ok(self.arena.insert(key))
    }

    async fn list(&self, dir: Handle) -> Result<Vec<String>, StoreError> {
        let dir = self.directory(dir)?;
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let nodes = self.nodes.lock();
        Ok(nodes
            .keys()
            .filter(|key| !key.is_empty())
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    async fn read(&self, file: Handle) -> Result<Vec<u8>, StoreError> {
        let key = self.arena.get(file)?;
        match self.nodes.lock().get(&key) {
            Some(Node::File(bytes)) => Ok(bytes.clone()),
            Some(Node::Dir) => Err(StoreError::NotAFile(key)),
            None => Err(StoreError::NotFound(key)),
        }
    }

    async fn write(&self, file: Handle, bytes: &[u8], append: bool) -> Result<(), StoreError> {
        let key = self.arena.get(file)?;
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(&key) {
            Some(Node::File(existing)) => {
                if !append {
                    existing.clear();
                }
                existing.extend_from_slice(bytes);
                Ok(())
            }
            Some(Node::Dir) => Err(StoreError::NotAFile(key)),
            None => Err(StoreError::NotFound(key)),
        }
    }

    async fn remove(&self, entry: Handle) -> Result<(), StoreError> {
        let key = self.arena.get(entry)?;
        if key.is_empty() {
            return Err(StoreError::InvalidPath("refusing to remove the store root".into()));
        }
        let mut nodes = self.nodes.lock();
        if nodes.remove(&key).is_none() {
            return Err(StoreError::NotFound(key));
        }
        let prefix = format!("{key}/");
        nodes.retain(|path, _| !path.starts_with(&prefix));
        Ok(())
    }

    fn release(&self, handle: Handle) -> Result<(), StoreError> {
        self.arena.release(handle)
    }
}
