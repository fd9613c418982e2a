//! In-memory adapter with object-store semantics.
//!
//! Files are flat keys; directories exist implicitly as soon as something
//! is stored below them, or explicitly after `create_directory`. This is
//! the shape of a remote bucket, which makes the adapter a stand-in for
//! remote storage in tests and scratch mounts. All data is ephemeral.
//!
//! A path is never both a file and a directory: writes below a file are
//! rejected. Moving a file onto an existing file replaces it, as a rename
//! does on disk.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use parking_lot::RwLock;
use tokio::io::AsyncReadExt;

use super::{AdapterStream, StorageAdapter};
use crate::error::{StorageError, StorageResult};
use crate::path as vpath;
use crate::types::{ByteStream, FilesystemItem, Options, guess_mime_type};

#[derive(Debug, Clone)]
struct Object {
    data: Vec<u8>,
    last_modified: i64,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, Object>,
    directories: BTreeSet<String>,
}

impl State {
    fn is_dir(&self, path: &str) -> bool {
        if path.is_empty() || self.directories.contains(path) {
            return true;
        }
        let prefix = format!("{path}/");
        self.objects.keys().any(|k| k.starts_with(&prefix))
            || self.directories.iter().any(|d| d.starts_with(&prefix))
    }

    /// Fail if a file sits where `path` needs a directory.
    fn ensure_no_file_above(&self, path: &str) -> StorageResult<()> {
        match vpath::ancestors(path).find(|a| self.objects.contains_key(*a)) {
            Some(file) => Err(StorageError::not_a_directory(file)),
            None => Ok(()),
        }
    }

    fn keys_below(&self, path: &str) -> (Vec<String>, Vec<String>) {
        let objects = self
            .objects
            .keys()
            .filter(|k| k.as_str() != path && vpath::is_within(k, path))
            .cloned()
            .collect();
        let dirs = self
            .directories
            .iter()
            .filter(|d| d.as_str() != path && vpath::is_within(d, path))
            .cloned()
            .collect();
        (objects, dirs)
    }
}

/// In-memory adapter.
///
/// Thread-safe via an internal `RwLock`. All data is lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    state: RwLock<State>,
}

impl MemoryAdapter {
    /// Create a new empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the modification time of a stored file.
    pub fn touch(&self, path: &str, last_modified: i64) -> StorageResult<()> {
        let key = Self::key(path)?;
        let mut state = self.state.write();
        let object = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| StorageError::not_found(&key))?;
        object.last_modified = last_modified;
        Ok(())
    }

    fn key(path: &str) -> StorageResult<String> {
        let (normalized, escapes) = vpath::normalize(path);
        if escapes > 0 {
            return Err(StorageError::path_escapes_root(path));
        }
        Ok(normalized)
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    fn object(&self, path: &str) -> StorageResult<Object> {
        let key = Self::key(path)?;
        let state = self.state.read();
        match state.objects.get(&key) {
            Some(object) => Ok(object.clone()),
            None if state.is_dir(&key) => Err(StorageError::is_a_directory(key)),
            None => Err(StorageError::not_found(key)),
        }
    }

    fn put(&self, path: &str, data: Vec<u8>) -> StorageResult<()> {
        let key = Self::key(path)?;
        if key.is_empty() {
            return Err(StorageError::is_a_directory(key));
        }
        let mut state = self.state.write();
        if state.is_dir(&key) {
            return Err(StorageError::is_a_directory(key));
        }
        state.ensure_no_file_above(&key)?;
        state.objects.insert(
            key,
            Object {
                data,
                last_modified: Self::now(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn file_exists(&self, path: &str) -> StorageResult<bool> {
        let key = Self::key(path)?;
        Ok(self.state.read().objects.contains_key(&key))
    }

    async fn directory_exists(&self, path: &str) -> StorageResult<bool> {
        let key = Self::key(path)?;
        Ok(self.state.read().is_dir(&key))
    }

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        Ok(self.object(path)?.data)
    }

    async fn read_stream(&self, path: &str) -> StorageResult<ByteStream> {
        let data = self.object(path)?.data;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn list_contents(&self, path: &str, deep: bool) -> StorageResult<AdapterStream> {
        let key = Self::key(path)?;
        let state = self.state.read();
        let mut items: BTreeMap<String, FilesystemItem> = BTreeMap::new();

        let add_dirs = |relative: &str, items: &mut BTreeMap<String, FilesystemItem>| {
            let mut current = key.clone();
            let segments: Vec<&str> = relative.split('/').collect();
            let dir_segments = if deep { segments.len() } else { 1 };
            for segment in segments.iter().take(dir_segments) {
                current = vpath::join(&current, segment);
                items
                    .entry(current.clone())
                    .or_insert_with(|| FilesystemItem::directory(current.clone()));
            }
        };

        let (objects, dirs) = state.keys_below(&key);
        for dir in dirs {
            let relative = vpath::strip_prefix(&dir, &key).unwrap_or(&dir).to_string();
            add_dirs(&relative, &mut items);
        }
        for object_key in objects {
            let relative = vpath::strip_prefix(&object_key, &key)
                .unwrap_or(&object_key)
                .to_string();
            if let Some((dir, _)) = relative.rsplit_once('/') {
                add_dirs(dir, &mut items);
                if !deep {
                    continue;
                }
            }
            if let Some(object) = state.objects.get(&object_key) {
                let item = FilesystemItem::file(object_key.clone())
                    .with_last_modified(Some(object.last_modified))
                    .with_file_size(Some(object.data.len() as u64))
                    .with_mime_type(Some(guess_mime_type(&object_key)));
                items.insert(object_key, item);
            }
        }

        Ok(stream::iter(items.into_values().map(Ok)).boxed())
    }

    async fn write(&self, path: &str, contents: &[u8], _options: &Options) -> StorageResult<()> {
        self.put(path, contents.to_vec())
    }

    async fn write_stream(
        &self,
        path: &str,
        mut stream: ByteStream,
        _options: &Options,
    ) -> StorageResult<()> {
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await?;
        self.put(path, data)
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let key = Self::key(path)?;
        let mut state = self.state.write();
        match state.objects.remove(&key) {
            Some(_) => Ok(()),
            None if state.is_dir(&key) => Err(StorageError::is_a_directory(key)),
            None => Err(StorageError::not_found(key)),
        }
    }

    async fn delete_directory(&self, path: &str) -> StorageResult<()> {
        let key = Self::key(path)?;
        if key.is_empty() {
            return Err(StorageError::other("cannot remove root"));
        }
        let mut state = self.state.write();
        if !state.is_dir(&key) {
            return Err(StorageError::not_a_directory(key));
        }
        let (objects, dirs) = state.keys_below(&key);
        for object in objects {
            state.objects.remove(&object);
        }
        for dir in dirs {
            state.directories.remove(&dir);
        }
        state.directories.remove(&key);
        Ok(())
    }

    async fn create_directory(&self, path: &str, _options: &Options) -> StorageResult<()> {
        let key = Self::key(path)?;
        let mut state = self.state.write();
        if state.objects.contains_key(&key) {
            return Err(StorageError::already_exists(key));
        }
        state.ensure_no_file_above(&key)?;
        if !key.is_empty() {
            state.directories.insert(key);
        }
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str, _options: &Options) -> StorageResult<()> {
        let object = self.object(from)?;
        self.put(to, object.data)
    }

    async fn move_to(&self, from: &str, to: &str, _options: &Options) -> StorageResult<()> {
        let from_key = Self::key(from)?;
        let to_key = Self::key(to)?;
        let mut state = self.state.write();
        if to_key.is_empty() || state.is_dir(&to_key) {
            return Err(StorageError::is_a_directory(to_key));
        }
        state.ensure_no_file_above(&to_key)?;

        // An existing file at the target is replaced, like a rename.
        if let Some(object) = state.objects.remove(&from_key) {
            state.objects.insert(to_key, object);
            return Ok(());
        }
        if from_key.is_empty() || !state.is_dir(&from_key) {
            return Err(StorageError::not_found(from_key));
        }
        if vpath::is_within(&to_key, &from_key) || state.objects.contains_key(&to_key) {
            return Err(StorageError::already_exists(to_key));
        }

        // Directory: move everything below it.
        let (objects, dirs) = state.keys_below(&from_key);
        for old in objects {
            if let Some(object) = state.objects.remove(&old) {
                let rest = vpath::strip_prefix(&old, &from_key).unwrap_or(&old);
                state.objects.insert(vpath::join(&to_key, rest), object);
            }
        }
        for old in dirs {
            state.directories.remove(&old);
            let rest = vpath::strip_prefix(&old, &from_key).unwrap_or(&old);
            state.directories.insert(vpath::join(&to_key, rest));
        }
        state.directories.remove(&from_key);
        state.directories.insert(to_key);
        Ok(())
    }

    async fn last_modified(&self, path: &str) -> StorageResult<i64> {
        Ok(self.object(path)?.last_modified)
    }

    async fn file_size(&self, path: &str) -> StorageResult<u64> {
        Ok(self.object(path)?.data.len() as u64)
    }

    async fn mime_type(&self, path: &str) -> StorageResult<String> {
        let key = Self::key(path)?;
        self.object(&key)?;
        Ok(guess_mime_type(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn listing(adapter: &MemoryAdapter, path: &str, deep: bool) -> Vec<String> {
        let items: Vec<FilesystemItem> = adapter
            .list_contents(path, deep)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        items
            .iter()
            .map(|i| format!("{} ({})", i.path(), if i.is_file() { "file" } else { "dir" }))
            .collect()
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let adapter = MemoryAdapter::new();
        adapter.write("a/b.txt", b"hello", &Options::new()).await.unwrap();

        assert_eq!(adapter.read("a/b.txt").await.unwrap(), b"hello");
        assert!(adapter.file_exists("a/b.txt").await.unwrap());
        assert!(adapter.directory_exists("a").await.unwrap());
        assert!(adapter.directory_exists("").await.unwrap());
        assert!(!adapter.file_exists("a").await.unwrap());
        assert_eq!(adapter.file_size("a/b.txt").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_read_directory_fails() {
        let adapter = MemoryAdapter::new();
        adapter.write("a/b.txt", b"hello", &Options::new()).await.unwrap();

        assert!(matches!(adapter.read("a").await, Err(StorageError::IsADirectory(_))));
        assert!(adapter.read("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_listing_with_implicit_directories() {
        let adapter = MemoryAdapter::new();
        let opts = Options::new();
        adapter.write("foo/bar/file", b"1", &opts).await.unwrap();
        adapter.write("foo/bar/things/a", b"2", &opts).await.unwrap();
        adapter.write("foo/bar/things/b", b"3", &opts).await.unwrap();
        adapter.create_directory("foo/bar/empty", &opts).await.unwrap();

        assert_eq!(
            listing(&adapter, "foo/bar", false).await,
            vec!["foo/bar/empty (dir)", "foo/bar/file (file)", "foo/bar/things (dir)"]
        );
        assert_eq!(
            listing(&adapter, "foo/bar", true).await,
            vec![
                "foo/bar/empty (dir)",
                "foo/bar/file (file)",
                "foo/bar/things (dir)",
                "foo/bar/things/a (file)",
                "foo/bar/things/b (file)",
            ]
        );
        assert_eq!(listing(&adapter, "", false).await, vec!["foo (dir)"]);
    }

    #[tokio::test]
    async fn test_move_directory() {
        let adapter = MemoryAdapter::new();
        let opts = Options::new();
        adapter.write("old/a", b"1", &opts).await.unwrap();
        adapter.write("old/sub/b", b"2", &opts).await.unwrap();

        adapter.move_to("old", "new", &opts).await.unwrap();

        assert!(!adapter.directory_exists("old").await.unwrap());
        assert_eq!(adapter.read("new/a").await.unwrap(), b"1");
        assert_eq!(adapter.read("new/sub/b").await.unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_file_and_directory_never_share_a_path() {
        let adapter = MemoryAdapter::new();
        let opts = Options::new();
        adapter.write("a", b"file", &opts).await.unwrap();
        adapter.write("d/x", b"x", &opts).await.unwrap();

        assert!(matches!(
            adapter.write("a/b", b"below", &opts).await,
            Err(StorageError::NotADirectory(p)) if p == "a"
        ));
        assert!(matches!(
            adapter.create_directory("a/sub", &opts).await,
            Err(StorageError::NotADirectory(_))
        ));
        assert!(matches!(
            adapter.move_to("d/x", "a/x", &opts).await,
            Err(StorageError::NotADirectory(_))
        ));
        assert!(matches!(
            adapter.move_to("a", "d", &opts).await,
            Err(StorageError::IsADirectory(_))
        ));
        assert!(matches!(
            adapter.move_to("d", "d/inner", &opts).await,
            Err(StorageError::AlreadyExists(_))
        ));
        assert!(adapter.file_exists("a").await.unwrap());
        assert!(!adapter.directory_exists("a").await.unwrap());
        assert_eq!(adapter.read("d/x").await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_move_replaces_existing_file() {
        let adapter = MemoryAdapter::new();
        let opts = Options::new();
        adapter.write("src", b"new", &opts).await.unwrap();
        adapter.write("dst", b"old", &opts).await.unwrap();

        adapter.move_to("src", "dst", &opts).await.unwrap();
        assert_eq!(adapter.read("dst").await.unwrap(), b"new");
        assert!(!adapter.file_exists("src").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_directory() {
        let adapter = MemoryAdapter::new();
        let opts = Options::new();
        adapter.write("d/a", b"1", &opts).await.unwrap();
        adapter.create_directory("d/e", &opts).await.unwrap();

        adapter.delete_directory("d").await.unwrap();
        assert!(!adapter.directory_exists("d").await.unwrap());
        assert!(!adapter.file_exists("d/a").await.unwrap());
        assert!(adapter.delete_directory("").await.is_err());
    }

    #[tokio::test]
    async fn test_touch() {
        let adapter = MemoryAdapter::new();
        adapter.write("a", b"1", &Options::new()).await.unwrap();
        adapter.touch("a", 42).unwrap();
        assert_eq!(adapter.last_modified("a").await.unwrap(), 42);
    }
}
