//! # strata-vfs
//!
//! Virtual filesystem over heterogeneous storage backends with a
//! database-backed metadata index.
//!
//! The pieces, leaf first:
//! - [`StorageAdapter`]s talk to one physical backend each (local disk,
//!   in-memory object store)
//! - the [`MountManager`] routes paths to adapters by longest prefix and
//!   merges them into one tree
//! - the [`DbafsManager`] keeps a metadata index (UUIDs, fingerprints,
//!   extra metadata) per DBAFS area and reconciles it with storage
//! - the [`VirtualFilesystem`] facade ties both together under one
//!   prefix, enforcing path bounds and access flags
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata_vfs::{
//!     AccessFlags, Dbafs, DbafsManager, MemoryAdapter, MemoryRepository, MountManager,
//!     Options, VirtualFilesystem,
//! };
//!
//! # async fn demo() -> strata_vfs::VfsResult<()> {
//! let mounts = Arc::new(MountManager::new());
//! mounts.mount(MemoryAdapter::new(), "files").await?;
//!
//! let dbafs = Arc::new(DbafsManager::new());
//! dbafs.register(Dbafs::new(MemoryRepository::new(), mounts.clone(), "files")?)?;
//!
//! let vfs = VirtualFilesystem::new(mounts, dbafs, "files")?;
//! vfs.write("hello.txt", b"hi", &Options::new()).await?;
//! let uuid = vfs.uuid_of("hello.txt").await?.expect("indexed on write");
//! assert_eq!(vfs.read(uuid).await?, b"hi");
//! assert!(vfs.file_exists("hello.txt", AccessFlags::FORCE_SYNC).await?);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod dbafs;
pub mod error;
pub mod mount;
pub mod path;
pub mod types;
pub mod vfs;

pub use adapter::{LocalAdapter, MemoryAdapter, StorageAdapter};
pub use config::VfsConfig;
pub use dbafs::{
    ChangeSet, Dbafs, DbafsManager, IndexRecord, IndexRepository, MemoryRepository,
    SqliteRepository,
};
pub use error::{IndexError, OperationKind, StorageError, VfsError, VfsResult};
pub use mount::MountManager;
pub use types::{
    AccessFlags, ByteStream, ExtraMetadata, FilesystemItem, ItemKind, ItemStream, Location,
    MetadataLoader, Options,
};
pub use vfs::VirtualFilesystem;
