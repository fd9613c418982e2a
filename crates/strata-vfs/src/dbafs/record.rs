//! Index records.

use uuid::Uuid;

use crate::types::{ExtraMetadata, FilesystemItem, ItemKind, guess_mime_type};

/// One row of the metadata index.
///
/// `path` is relative to the root of the DBAFS area the record belongs to.
/// The UUID never changes for the lifetime of the resource; the path does
/// when the resource is moved.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub uuid: Uuid,
    pub path: String,
    pub kind: ItemKind,
    /// Content fingerprint (hex BLAKE3).
    pub hash: String,
    pub file_size: Option<u64>,
    pub last_modified: Option<i64>,
    pub extra_metadata: ExtraMetadata,
}

impl IndexRecord {
    /// A fresh record with a newly allocated UUID.
    pub fn new(kind: ItemKind, path: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::now_v7(),
            path: path.into(),
            kind,
            hash: hash.into(),
            file_size: None,
            last_modified: None,
            extra_metadata: ExtraMetadata::new(),
        }
    }

    pub fn with_file_size(mut self, file_size: Option<u64>) -> Self {
        self.file_size = file_size;
        self
    }

    pub fn with_last_modified(mut self, last_modified: Option<i64>) -> Self {
        self.last_modified = last_modified;
        self
    }

    pub fn with_extra_metadata(mut self, extra_metadata: ExtraMetadata) -> Self {
        self.extra_metadata = extra_metadata;
        self
    }

    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// MIME type guessed from the file name; `None` for directories.
    pub fn mime_type(&self) -> Option<String> {
        self.is_file().then(|| guess_mime_type(&self.path))
    }

    /// Project the record into a listing item at `path`.
    pub fn to_item(&self, path: impl Into<String>) -> FilesystemItem {
        FilesystemItem::new(self.kind, path)
            .with_last_modified(self.last_modified)
            .with_file_size(self.file_size)
            .with_mime_type(self.mime_type())
            .with_extra_metadata(self.extra_metadata.clone())
    }
}
