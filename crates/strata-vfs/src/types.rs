//! Core value types shared by adapters, the mount manager, the DBAFS and
//! the facade.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::error::VfsResult;

/// Arbitrary per-resource attributes stored in the index.
pub type ExtraMetadata = BTreeMap<String, serde_json::Value>;

/// Adapter options passed through write/copy/move/create-directory calls.
pub type Options = BTreeMap<String, serde_json::Value>;

/// Readable byte stream handed out by `read_stream` and consumed by
/// `write_stream`.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Forward-only, single-pass listing.
pub type ItemStream = BoxStream<'static, VfsResult<FilesystemItem>>;

bitflags! {
    /// Per-call behaviour of facade operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u8 {
        /// Reconcile the index against live storage before answering.
        const FORCE_SYNC = 1;
        /// Skip the index and talk to the storage adapters directly.
        const BYPASS_DBAFS = 1 << 1;
    }
}

impl AccessFlags {
    /// Read metadata from the index, no sync.
    pub const NONE: Self = Self::empty();

    pub fn force_sync(self) -> bool {
        self.contains(Self::FORCE_SYNC)
    }

    pub fn bypass_dbafs(self) -> bool {
        self.contains(Self::BYPASS_DBAFS)
    }
}

/// Whether an item is a file or a directory.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ItemKind {
    File,
    Directory,
}

impl ItemKind {
    pub fn is_file(&self) -> bool {
        matches!(self, ItemKind::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, ItemKind::Directory)
    }
}

/// Address of a resource: a root-relative path or an index UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Path(String),
    Uuid(Uuid),
}

impl Location {
    pub fn is_uuid(&self) -> bool {
        matches!(self, Location::Uuid(_))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Path(p) => f.write_str(p),
            Location::Uuid(u) => write!(f, "{u}"),
        }
    }
}

impl From<&str> for Location {
    fn from(path: &str) -> Self {
        Location::Path(path.to_string())
    }
}

impl From<String> for Location {
    fn from(path: String) -> Self {
        Location::Path(path)
    }
}

impl From<&String> for Location {
    fn from(path: &String) -> Self {
        Location::Path(path.clone())
    }
}

impl From<Uuid> for Location {
    fn from(uuid: Uuid) -> Self {
        Location::Uuid(uuid)
    }
}

/// Source of extra metadata for items whose metadata is loaded on demand.
#[async_trait]
pub trait MetadataLoader: Send + Sync {
    /// Load the extra metadata stored for a global path.
    async fn load_extra_metadata(&self, path: &str) -> VfsResult<ExtraMetadata>;
}

struct DeferredMetadata {
    loader: Arc<dyn MetadataLoader>,
    path: String,
    cell: OnceCell<ExtraMetadata>,
}

#[derive(Clone)]
enum MetadataSlot {
    Ready(ExtraMetadata),
    Deferred(Arc<DeferredMetadata>),
}

/// One file or directory entry.
///
/// A read projection built per listing or stat call; never persisted.
/// Directories never carry a file size or MIME type.
#[derive(Clone)]
pub struct FilesystemItem {
    kind: ItemKind,
    path: String,
    last_modified: Option<i64>,
    file_size: Option<u64>,
    mime_type: Option<String>,
    extra_metadata: MetadataSlot,
}

impl FilesystemItem {
    pub fn new(kind: ItemKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            last_modified: None,
            file_size: None,
            mime_type: None,
            extra_metadata: MetadataSlot::Ready(ExtraMetadata::new()),
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self::new(ItemKind::File, path)
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self::new(ItemKind::Directory, path)
    }

    pub fn with_last_modified(mut self, last_modified: Option<i64>) -> Self {
        self.last_modified = last_modified;
        self
    }

    /// Ignored for directories.
    pub fn with_file_size(mut self, file_size: Option<u64>) -> Self {
        if self.kind.is_file() {
            self.file_size = file_size;
        }
        self
    }

    /// Ignored for directories.
    pub fn with_mime_type(mut self, mime_type: Option<String>) -> Self {
        if self.kind.is_file() {
            self.mime_type = mime_type;
        }
        self
    }

    pub fn with_extra_metadata(mut self, extra_metadata: ExtraMetadata) -> Self {
        self.extra_metadata = MetadataSlot::Ready(extra_metadata);
        self
    }

    /// Defer loading extra metadata until it is first asked for.
    ///
    /// `path` is the global path handed to the loader; it is kept even if
    /// the item is later re-prefixed with [`with_path`](Self::with_path).
    pub fn with_deferred_metadata(
        mut self,
        loader: Arc<dyn MetadataLoader>,
        path: impl Into<String>,
    ) -> Self {
        self.extra_metadata = MetadataSlot::Deferred(Arc::new(DeferredMetadata {
            loader,
            path: path.into(),
            cell: OnceCell::new(),
        }));
        self
    }

    /// Same item under a different path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn last_modified(&self) -> Option<i64> {
        self.last_modified
    }

    pub fn file_size(&self) -> Option<u64> {
        self.file_size
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// Extra metadata, loading it on first access if it was deferred.
    ///
    /// Clones share the loaded value.
    pub async fn extra_metadata(&self) -> VfsResult<ExtraMetadata> {
        match &self.extra_metadata {
            MetadataSlot::Ready(meta) => Ok(meta.clone()),
            MetadataSlot::Deferred(deferred) => deferred
                .cell
                .get_or_try_init(|| deferred.loader.load_extra_metadata(&deferred.path))
                .await
                .cloned(),
        }
    }

    /// Extra metadata if it is already available, without loading.
    pub fn loaded_extra_metadata(&self) -> Option<&ExtraMetadata> {
        match &self.extra_metadata {
            MetadataSlot::Ready(meta) => Some(meta),
            MetadataSlot::Deferred(deferred) => deferred.cell.get(),
        }
    }
}

impl fmt::Debug for FilesystemItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilesystemItem")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("last_modified", &self.last_modified)
            .field("file_size", &self.file_size)
            .field("mime_type", &self.mime_type)
            .field("extra_metadata", &self.loaded_extra_metadata())
            .finish()
    }
}

/// Guess a MIME type from a path's extension.
pub fn guess_mime_type(path: &str) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
