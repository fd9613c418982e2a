//! Local disk adapter.
//!
//! Provides access to a directory on the local filesystem, with path
//! security to prevent escaping the root directory.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{AdapterStream, StorageAdapter};
use crate::error::{StorageError, StorageResult};
use crate::path as vpath;
use crate::types::{ByteStream, FilesystemItem, Options, guess_mime_type};

/// Local disk adapter.
///
/// All operations are relative to `root`. For example, if `root` is
/// `/srv/files`, then `read("img/a.png")` reads `/srv/files/img/a.png`.
///
/// Attempts to escape via `..` or symlinks pointing outside the root are
/// blocked.
#[derive(Debug, Clone)]
pub struct LocalAdapter {
    root: PathBuf,
}

impl LocalAdapter {
    /// Create an adapter rooted at the given directory.
    ///
    /// The root is canonicalized at construction time to handle symlinks
    /// (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = dunce::canonicalize(&root).unwrap_or(root);
        Self { root }
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path to an absolute path within the root.
    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        let (normalized, escapes) = vpath::normalize(path);
        if escapes > 0 {
            return Err(StorageError::path_escapes_root(path));
        }
        if normalized.is_empty() {
            return Ok(self.root.clone());
        }

        let full = self.root.join(&normalized);

        // Symlinks may still point outside. Check the deepest ancestor that
        // exists, since `create_dir_all` would follow it.
        let existing = full.ancestors().find(|p| p.symlink_metadata().is_ok());
        if let Some(existing) = existing {
            let canonical = dunce::canonicalize(existing)?;
            if !canonical.starts_with(&self.root) {
                return Err(StorageError::path_escapes_root(format!(
                    "{} is not under {}",
                    canonical.display(),
                    self.root.display()
                )));
            }
        }

        Ok(full)
    }

    async fn metadata(&self, path: &str) -> StorageResult<std::fs::Metadata> {
        let full = self.resolve(path)?;
        fs::metadata(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::not_found(path)
            } else {
                StorageError::Io(e)
            }
        })
    }

    async fn file_metadata(&self, path: &str) -> StorageResult<std::fs::Metadata> {
        let meta = self.metadata(path).await?;
        if meta.is_dir() {
            return Err(StorageError::is_a_directory(path));
        }
        Ok(meta)
    }

    async fn ensure_parent(full: &Path) -> StorageResult<()> {
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn exists_as(&self, path: &str, dir: bool) -> StorageResult<bool> {
        match self.metadata(path).await {
            Ok(meta) => Ok(meta.is_dir() == dir),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn epoch_seconds(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Depth-first walk state for [`LocalAdapter::list_contents`].
struct Walk {
    root: PathBuf,
    pending: Vec<PathBuf>,
    current: Option<fs::ReadDir>,
    deep: bool,
}

impl Walk {
    fn relative(&self, full: &Path) -> String {
        full.strip_prefix(&self.root)
            .unwrap_or(full)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

async fn next_item(mut walk: Walk) -> Option<(StorageResult<FilesystemItem>, Walk)> {
    loop {
        if walk.current.is_none() {
            let dir = walk.pending.pop()?;
            match fs::read_dir(&dir).await {
                Ok(read_dir) => walk.current = Some(read_dir),
                Err(e) => return Some((Err(e.into()), walk)),
            }
        }

        let next = walk.current.as_mut()?.next_entry().await;
        let entry = match next {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                walk.current = None;
                continue;
            }
            Err(e) => {
                walk.current = None;
                return Some((Err(e.into()), walk));
            }
        };

        let full = entry.path();
        let file_type = match entry.file_type().await {
            Ok(t) => t,
            Err(e) => return Some((Err(e.into()), walk)),
        };
        let meta = match entry.metadata().await {
            Ok(m) => m,
            Err(e) => return Some((Err(e.into()), walk)),
        };
        let relative = walk.relative(&full);
        let mtime = meta.modified().ok().map(epoch_seconds);

        let item = if file_type.is_dir() {
            if walk.deep {
                walk.pending.push(full);
            }
            FilesystemItem::directory(relative).with_last_modified(mtime)
        } else if file_type.is_file() {
            let mime = guess_mime_type(&relative);
            FilesystemItem::file(relative)
                .with_last_modified(mtime)
                .with_file_size(Some(meta.len()))
                .with_mime_type(Some(mime))
        } else {
            // symlinks and special files are not exposed
            continue;
        };

        return Some((Ok(item), walk));
    }
}

#[async_trait]
impl StorageAdapter for LocalAdapter {
    async fn file_exists(&self, path: &str) -> StorageResult<bool> {
        self.exists_as(path, false).await
    }

    async fn directory_exists(&self, path: &str) -> StorageResult<bool> {
        self.exists_as(path, true).await
    }

    async fn read(&self, path: &str) -> StorageResult<Vec<u8>> {
        self.file_metadata(path).await?;
        let full = self.resolve(path)?;
        Ok(fs::read(&full).await?)
    }

    async fn read_stream(&self, path: &str) -> StorageResult<ByteStream> {
        self.file_metadata(path).await?;
        let full = self.resolve(path)?;
        let file = fs::File::open(&full).await?;
        Ok(Box::new(file))
    }

    async fn list_contents(&self, path: &str, deep: bool) -> StorageResult<AdapterStream> {
        if !self.directory_exists(path).await? {
            return Ok(stream::empty().boxed());
        }

        let walk = Walk {
            root: self.root.clone(),
            pending: vec![self.resolve(path)?],
            current: None,
            deep,
        };
        Ok(stream::unfold(walk, next_item).boxed())
    }

    async fn write(&self, path: &str, contents: &[u8], _options: &Options) -> StorageResult<()> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full).await?;
        fs::write(&full, contents).await?;
        Ok(())
    }

    async fn write_stream(
        &self,
        path: &str,
        mut stream: ByteStream,
        _options: &Options,
    ) -> StorageResult<()> {
        let full = self.resolve(path)?;
        Self::ensure_parent(&full).await?;
        let mut file = fs::File::create(&full).await?;
        tokio::io::copy(&mut stream, &mut file).await?;
        file.flush().await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        self.file_metadata(path).await?;
        let full = self.resolve(path)?;
        fs::remove_file(&full).await?;
        Ok(())
    }

    async fn delete_directory(&self, path: &str) -> StorageResult<()> {
        let full = self.resolve(path)?;
        if full == self.root {
            return Err(StorageError::other("cannot remove root"));
        }
        if !self.directory_exists(path).await? {
            return Err(StorageError::not_a_directory(path));
        }
        fs::remove_dir_all(&full).await?;
        Ok(())
    }

    async fn create_directory(&self, path: &str, _options: &Options) -> StorageResult<()> {
        let full = self.resolve(path)?;
        if self.file_exists(path).await? {
            return Err(StorageError::already_exists(path));
        }
        fs::create_dir_all(&full).await?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str, _options: &Options) -> StorageResult<()> {
        self.file_metadata(from).await?;
        let from_path = self.resolve(from)?;
        let to_path = self.resolve(to)?;
        Self::ensure_parent(&to_path).await?;
        fs::copy(&from_path, &to_path).await?;
        Ok(())
    }

    async fn move_to(&self, from: &str, to: &str, _options: &Options) -> StorageResult<()> {
        self.metadata(from).await?;
        let from_path = self.resolve(from)?;
        let to_path = self.resolve(to)?;
        Self::ensure_parent(&to_path).await?;
        fs::rename(&from_path, &to_path).await?;
        Ok(())
    }

    async fn last_modified(&self, path: &str) -> StorageResult<i64> {
        let meta = self.metadata(path).await?;
        Ok(meta.modified().map(epoch_seconds)?)
    }

    async fn file_size(&self, path: &str) -> StorageResult<u64> {
        Ok(self.file_metadata(path).await?.len())
    }

    async fn mime_type(&self, path: &str) -> StorageResult<String> {
        self.file_metadata(path).await?;
        Ok(guess_mime_type(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn setup() -> (LocalAdapter, TempDir) {
        let dir = TempDir::new().unwrap();
        let adapter = LocalAdapter::new(dir.path());
        (adapter, dir)
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (adapter, _dir) = setup();

        adapter
            .write("nested/test.txt", b"hello world", &Options::new())
            .await
            .unwrap();

        assert!(adapter.file_exists("nested/test.txt").await.unwrap());
        assert!(adapter.directory_exists("nested").await.unwrap());
        assert!(!adapter.file_exists("nested").await.unwrap());
        assert_eq!(adapter.read("nested/test.txt").await.unwrap(), b"hello world");
        assert_eq!(adapter.file_size("nested/test.txt").await.unwrap(), 11);
        assert_eq!(adapter.mime_type("nested/test.txt").await.unwrap(), "text/plain");
        assert!(adapter.last_modified("nested/test.txt").await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_streams() {
        let (adapter, _dir) = setup();

        let source: ByteStream = Box::new(&b"streamed"[..]);
        adapter.write_stream("s.bin", source, &Options::new()).await.unwrap();

        let mut stream = adapter.read_stream("s.bin").await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"streamed");
    }

    #[tokio::test]
    async fn test_list_contents() {
        let (adapter, _dir) = setup();
        let opts = Options::new();
        adapter.write("foo/bar/file", b"1", &opts).await.unwrap();
        adapter.write("foo/bar/things/a", b"2", &opts).await.unwrap();
        adapter.write("foo/bar/things/b", b"3", &opts).await.unwrap();

        let shallow: Vec<_> = adapter
            .list_contents("foo/bar", false)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let mut names: Vec<_> = shallow.iter().map(|i| i.path().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["foo/bar/file", "foo/bar/things"]);

        let deep: Vec<_> = adapter
            .list_contents("foo/bar", true)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let mut names: Vec<_> = deep
            .iter()
            .map(|i| format!("{} ({})", i.path(), if i.is_file() { "file" } else { "dir" }))
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "foo/bar/file (file)",
                "foo/bar/things (dir)",
                "foo/bar/things/a (file)",
                "foo/bar/things/b (file)",
            ]
        );

        let missing: Vec<_> = adapter
            .list_contents("nope", true)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_copy_move_delete() {
        let (adapter, _dir) = setup();
        let opts = Options::new();
        adapter.write("a.txt", b"content", &opts).await.unwrap();

        adapter.copy("a.txt", "copy/b.txt", &opts).await.unwrap();
        adapter.move_to("a.txt", "moved/c.txt", &opts).await.unwrap();

        assert!(!adapter.file_exists("a.txt").await.unwrap());
        assert_eq!(adapter.read("copy/b.txt").await.unwrap(), b"content");
        assert_eq!(adapter.read("moved/c.txt").await.unwrap(), b"content");

        adapter.delete("copy/b.txt").await.unwrap();
        assert!(!adapter.file_exists("copy/b.txt").await.unwrap());

        adapter.delete_directory("moved").await.unwrap();
        assert!(!adapter.directory_exists("moved").await.unwrap());
    }

    #[tokio::test]
    async fn test_path_escape_blocked() {
        let (adapter, _dir) = setup();

        let result = adapter.read("../../../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::PathEscapesRoot(_))));
    }

    #[tokio::test]
    async fn test_symlink_escape_blocked() {
        let (adapter, dir) = setup();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), "x").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let result = adapter.read("link/secret").await;
        assert!(matches!(result, Err(StorageError::PathEscapesRoot(_))));
    }

    #[tokio::test]
    async fn test_symlink_escape_through_missing_dirs_blocked() {
        let (adapter, dir) = setup();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let result = adapter
            .write("link/newdir/file.txt", b"x", &Options::new())
            .await;
        assert!(matches!(result, Err(StorageError::PathEscapesRoot(_))));
        assert!(!outside.path().join("newdir").exists());

        let stream: ByteStream = Box::new(std::io::Cursor::new(b"x".to_vec()));
        let result = adapter
            .write_stream("link/s/file.txt", stream, &Options::new())
            .await;
        assert!(matches!(result, Err(StorageError::PathEscapesRoot(_))));
        assert!(!outside.path().join("s").exists());

        let result = adapter.create_directory("link/a/b", &Options::new()).await;
        assert!(matches!(result, Err(StorageError::PathEscapesRoot(_))));
        assert!(!outside.path().join("a").exists());

        // Missing directories below the root itself are still fine.
        adapter
            .write("plain/newdir/file.txt", b"x", &Options::new())
            .await
            .unwrap();
        assert!(dir.path().join("plain/newdir/file.txt").is_file());
    }

    #[tokio::test]
    async fn test_read_missing() {
        let (adapter, _dir) = setup();
        let err = adapter.read("missing.txt").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
