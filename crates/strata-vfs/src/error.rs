//! Error types.
//!
//! Three layers, from the bottom up:
//!
//! - [`StorageError`] is raised by storage adapters.
//! - [`IndexError`] is raised by index repositories.
//! - [`VfsError`] is what the mount manager, the DBAFS and the facade
//!   return. Adapter failures are wrapped together with the
//!   [`OperationKind`] and the offending path(s).

use std::io;

use thiserror::Error;
use uuid::Uuid;

/// The kind of storage operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum OperationKind {
    CheckExists,
    Read,
    Write,
    Delete,
    DeleteDirectory,
    CreateDirectory,
    Copy,
    Move,
    ListContents,
    RetrieveMetadata,
}

impl OperationKind {
    /// Human readable message for a failure of this kind.
    pub fn describe(&self, path: &str, target: Option<&str>) -> String {
        let target = target.unwrap_or_default();
        match self {
            OperationKind::CheckExists => format!("Unable to check if a file exists at '{path}'."),
            OperationKind::Read => format!("Unable to read from '{path}'."),
            OperationKind::Write => format!("Unable to write to '{path}'."),
            OperationKind::Delete => format!("Unable to delete file at '{path}'."),
            OperationKind::DeleteDirectory => format!("Unable to delete directory at '{path}'."),
            OperationKind::CreateDirectory => format!("Unable to create directory at '{path}'."),
            OperationKind::Copy => format!("Unable to copy file from '{path}' to '{target}'."),
            OperationKind::Move => format!("Unable to move file from '{path}' to '{target}'."),
            OperationKind::ListContents => format!("Unable to list contents from '{path}'."),
            OperationKind::RetrieveMetadata => {
                format!("Unable to retrieve metadata from '{path}'.")
            }
        }
    }
}

/// Adapter-level failure.
#[derive(Debug, Error)]
pub enum StorageError {
    /// File or directory not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Path escapes the adapter root.
    #[error("path escapes root: {0}")]
    PathEscapesRoot(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    pub fn path_escapes_root(path: impl Into<String>) -> Self {
        Self::PathEscapesRoot(path.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Returns true if this error means the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound(_) => true,
            StorageError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Index repository failure.
#[derive(Debug, Error)]
pub enum IndexError {
    /// SQLite error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Extra metadata could not be (de)serialized.
    #[error("metadata encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    /// A stored row could not be decoded.
    #[error("corrupt index record: {0}")]
    Corrupt(String),

    /// A unique key (path or UUID) is already taken.
    #[error("duplicate index record: {0}")]
    Duplicate(String),
}

/// Error returned by the mount manager, the DBAFS and the facade.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Invalid mount or DBAFS setup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No mount covers the path.
    #[error("no mount point for path '{0}'")]
    UnroutablePath(String),

    /// A storage adapter failed.
    #[error("{}", kind.describe(path, target.as_deref()))]
    Adapter {
        kind: OperationKind,
        path: String,
        target: Option<String>,
        #[source]
        source: StorageError,
    },

    /// The UUID has no index record.
    #[error("unable to resolve UUID {0}")]
    UnableToResolveUuid(Uuid),

    /// The path escaped the configured root or was absolute.
    #[error("{0}")]
    OutOfBounds(String),

    /// Caller misuse.
    #[error("{0}")]
    Logic(String),

    /// The index repository failed.
    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

impl VfsError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn unroutable(path: impl Into<String>) -> Self {
        Self::UnroutablePath(path.into())
    }

    pub fn out_of_bounds(msg: impl Into<String>) -> Self {
        Self::OutOfBounds(msg.into())
    }

    pub fn logic(msg: impl Into<String>) -> Self {
        Self::Logic(msg.into())
    }

    /// Wrap an adapter failure on a single path.
    pub fn adapter(kind: OperationKind, path: impl Into<String>, source: StorageError) -> Self {
        Self::Adapter {
            kind,
            path: path.into(),
            target: None,
            source,
        }
    }

    /// Wrap an adapter failure on a source/target pair (copy, move).
    pub fn adapter_pair(
        kind: OperationKind,
        from: impl Into<String>,
        to: impl Into<String>,
        source: StorageError,
    ) -> Self {
        Self::Adapter {
            kind,
            path: from.into(),
            target: Some(to.into()),
            source,
        }
    }

    /// The operation kind, if this is an adapter failure.
    pub fn operation_kind(&self) -> Option<OperationKind> {
        match self {
            VfsError::Adapter { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Adapter result type.
pub type StorageResult<T> = Result<T, StorageError>;

/// Index repository result type.
pub type IndexResult<T> = Result<T, IndexError>;

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;
