//! Storage adapters.
//!
//! Adapters implement [`StorageAdapter`] for one physical backend. Paths
//! handed to an adapter are always relative to the adapter's own root; the
//! [`MountManager`](crate::MountManager) handles routing and prefix
//! translation.

mod local;
mod memory;

pub use local::LocalAdapter;
pub use memory::MemoryAdapter;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::StorageResult;
use crate::types::{ByteStream, FilesystemItem, Options};

/// Listing produced by an adapter. Item paths are relative to the adapter
/// root.
pub type AdapterStream = BoxStream<'static, StorageResult<FilesystemItem>>;

/// Uniform contract over one storage backend.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    // ========================================================================
    // Reading
    // ========================================================================

    /// True if a file exists at `path`. Directories do not count.
    async fn file_exists(&self, path: &str) -> StorageResult<bool>;

    /// True if a directory exists at `path`. The root always exists.
    async fn directory_exists(&self, path: &str) -> StorageResult<bool>;

    /// Read an entire file.
    async fn read(&self, path: &str) -> StorageResult<Vec<u8>>;

    /// Open a file for streaming reads.
    async fn read_stream(&self, path: &str) -> StorageResult<ByteStream>;

    /// List the entries below `path`. With `deep`, descend into
    /// subdirectories.
    async fn list_contents(&self, path: &str, deep: bool) -> StorageResult<AdapterStream>;

    // ========================================================================
    // Writing
    // ========================================================================

    /// Create or replace a file. Missing parent directories are created.
    async fn write(&self, path: &str, contents: &[u8], options: &Options) -> StorageResult<()>;

    /// Create or replace a file from a stream.
    async fn write_stream(
        &self,
        path: &str,
        stream: ByteStream,
        options: &Options,
    ) -> StorageResult<()>;

    /// Delete a file.
    async fn delete(&self, path: &str) -> StorageResult<()>;

    /// Delete a directory and everything below it.
    async fn delete_directory(&self, path: &str) -> StorageResult<()>;

    /// Create a directory and any missing parents.
    async fn create_directory(&self, path: &str, options: &Options) -> StorageResult<()>;

    /// Copy a file within this adapter.
    async fn copy(&self, from: &str, to: &str, options: &Options) -> StorageResult<()>;

    /// Move a file within this adapter.
    async fn move_to(&self, from: &str, to: &str, options: &Options) -> StorageResult<()>;

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Modification time in seconds since the epoch.
    async fn last_modified(&self, path: &str) -> StorageResult<i64>;

    /// File size in bytes.
    async fn file_size(&self, path: &str) -> StorageResult<u64>;

    /// MIME type of a file.
    async fn mime_type(&self, path: &str) -> StorageResult<String>;
}
