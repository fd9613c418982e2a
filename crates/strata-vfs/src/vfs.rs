//! The virtual filesystem facade.
//!
//! A [`VirtualFilesystem`] is a view on the mount tree scoped to one
//! prefix. Callers address resources by a path relative to that prefix or
//! by UUID; the facade normalizes and bounds-checks the path, keeps the
//! DBAFS index in step with mutations, and decides per call whether
//! metadata comes from the index or straight from storage.

use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use tracing::debug;
use uuid::Uuid;

use crate::dbafs::{ChangeSet, DbafsManager};
use crate::error::{VfsError, VfsResult};
use crate::mount::MountManager;
use crate::path as vpath;
use crate::types::{AccessFlags, ByteStream, ExtraMetadata, ItemStream, Location, MetadataLoader, Options};

/// Prefix-scoped access to the mount tree and the metadata index.
#[derive(Debug, Clone)]
pub struct VirtualFilesystem {
    mounts: Arc<MountManager>,
    dbafs: Arc<DbafsManager>,
    prefix: String,
    read_only: bool,
}

impl VirtualFilesystem {
    /// Create a writable view below `prefix` (`""` for the whole tree).
    pub fn new(mounts: Arc<MountManager>, dbafs: Arc<DbafsManager>, prefix: &str) -> VfsResult<Self> {
        Ok(Self {
            mounts,
            dbafs,
            prefix: vpath::normalize_prefix(prefix)?,
            read_only: false,
        })
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn mount_manager(&self) -> &Arc<MountManager> {
        &self.mounts
    }

    pub fn dbafs_manager(&self) -> &Arc<DbafsManager> {
        &self.dbafs
    }

    // ========================================================================
    // Path handling
    // ========================================================================

    fn ensure_writable(&self) -> VfsResult<()> {
        if self.read_only {
            return Err(VfsError::logic("Tried to mutate a readonly filesystem instance."));
        }
        Ok(())
    }

    /// Global path for a caller supplied relative path.
    fn global_path(&self, relative: &str) -> VfsResult<String> {
        let normalized = vpath::normalize_bounded(relative)?;
        Ok(vpath::join(&self.prefix, &normalized))
    }

    /// Resolve a location to a global path. `operation` names the call in
    /// the error for a UUID combined with `BYPASS_DBAFS`.
    async fn resolve(&self, location: Location, flags: AccessFlags, operation: &str) -> VfsResult<String> {
        match location {
            Location::Path(path) => self.global_path(&path),
            Location::Uuid(uuid) => {
                if flags.bypass_dbafs() {
                    return Err(VfsError::logic(format!(
                        "Cannot use a UUID in combination with BYPASS_DBAFS to {operation}."
                    )));
                }
                let relative = self.dbafs.resolve_uuid(uuid, &self.prefix).await?;
                self.global_path(&relative)
            }
        }
    }

    fn uses_index(&self, path: &str, flags: AccessFlags) -> bool {
        !flags.bypass_dbafs() && self.dbafs.matches(path)
    }

    async fn sync_if_forced(&self, path: &str, flags: AccessFlags) -> VfsResult<()> {
        if flags.force_sync() {
            self.dbafs.sync(&[path]).await?;
        }
        Ok(())
    }

    /// Strip this instance's prefix from a global path.
    fn local_path(&self, global: &str) -> String {
        vpath::strip_prefix(global, &self.prefix)
            .unwrap_or(global)
            .to_string()
    }

    /// Resolve a UUID to a path relative to this instance.
    #[tracing::instrument(skip(self), name = "vfs.resolve_uuid")]
    pub async fn resolve_uuid(&self, uuid: Uuid) -> VfsResult<String> {
        let global = self.resolve(Location::Uuid(uuid), AccessFlags::NONE, "resolve a path").await?;
        Ok(self.local_path(&global))
    }

    /// The UUID of the resource at `location`, if it has an index record.
    #[tracing::instrument(skip_all, name = "vfs.uuid_of")]
    pub async fn uuid_of(&self, location: impl Into<Location>) -> VfsResult<Option<Uuid>> {
        let path = self.resolve(location.into(), AccessFlags::NONE, "look up a UUID").await?;
        Ok(self.dbafs.record(&path).await?.map(|r| r.uuid))
    }

    /// Sync the index for `location` and return what changed.
    #[tracing::instrument(skip_all, name = "vfs.sync")]
    pub async fn sync(&self, location: impl Into<Location>) -> VfsResult<ChangeSet> {
        let path = self.resolve(location.into(), AccessFlags::NONE, "sync").await?;
        self.dbafs.sync(&[path.as_str()]).await
    }

    // ========================================================================
    // Existence
    // ========================================================================

    /// True if a file exists at `location`.
    ///
    /// A UUID that does not resolve yields `false`. A UUID that does
    /// resolve is proof enough unless `FORCE_SYNC` asks for a fresh look.
    #[tracing::instrument(skip_all, name = "vfs.file_exists")]
    pub async fn file_exists(&self, location: impl Into<Location>, flags: AccessFlags) -> VfsResult<bool> {
        let location = location.into();
        let path = match location {
            Location::Uuid(_) => {
                let resolved = self.resolve(location, flags, "check if a file exists").await;
                let path = match resolved {
                    Ok(path) => path,
                    Err(VfsError::UnableToResolveUuid(_)) => return Ok(false),
                    Err(e) => return Err(e),
                };
                if !flags.force_sync() {
                    return Ok(true);
                }
                path
            }
            Location::Path(_) => self.resolve(location, flags, "check if a file exists").await?,
        };

        self.sync_if_forced(&path, flags).await?;
        if self.uses_index(&path, flags) {
            self.dbafs.file_exists(&path).await
        } else {
            self.mounts.file_exists(&path).await
        }
    }

    /// True if a directory exists at `location`.
    #[tracing::instrument(skip_all, name = "vfs.directory_exists")]
    pub async fn directory_exists(
        &self,
        location: impl Into<Location>,
        flags: AccessFlags,
    ) -> VfsResult<bool> {
        let path = self
            .resolve(location.into(), flags, "check if a directory exists")
            .await?;

        self.sync_if_forced(&path, flags).await?;
        if self.uses_index(&path, flags) {
            self.dbafs.directory_exists(&path).await
        } else {
            self.mounts.directory_exists(&path).await
        }
    }

    // ========================================================================
    // Reading
    // ========================================================================

    #[tracing::instrument(skip_all, name = "vfs.read")]
    pub async fn read(&self, location: impl Into<Location>) -> VfsResult<Vec<u8>> {
        let path = self.resolve(location.into(), AccessFlags::NONE, "read").await?;
        self.mounts.read(&path).await
    }

    #[tracing::instrument(skip_all, name = "vfs.read_stream")]
    pub async fn read_stream(&self, location: impl Into<Location>) -> VfsResult<ByteStream> {
        let path = self.resolve(location.into(), AccessFlags::NONE, "read").await?;
        self.mounts.read_stream(&path).await
    }

    /// List the contents of a directory.
    ///
    /// Inside a DBAFS area (and without `BYPASS_DBAFS`) the listing comes
    /// from the index and carries extra metadata. Otherwise it comes from
    /// the mount manager and extra metadata is loaded from the index only
    /// when an item is asked for it. Item paths are relative to this
    /// instance's prefix.
    #[tracing::instrument(skip_all, name = "vfs.list_contents")]
    pub async fn list_contents(
        &self,
        location: impl Into<Location>,
        deep: bool,
        flags: AccessFlags,
    ) -> VfsResult<ItemStream> {
        let path = self.resolve(location.into(), flags, "list contents").await?;
        self.sync_if_forced(&path, flags).await?;

        let items = if self.uses_index(&path, flags) {
            debug!(path = %path, "listing from index");
            self.dbafs.list_contents(&path, deep).await?
        } else if flags.bypass_dbafs() {
            self.mounts.list_contents(&path, deep).await?
        } else {
            let loader: Arc<dyn MetadataLoader> = self.dbafs.clone();
            self.mounts
                .list_contents(&path, deep)
                .await?
                .map_ok(move |item| {
                    let global = item.path().to_string();
                    item.with_deferred_metadata(Arc::clone(&loader), global)
                })
                .boxed()
        };

        let prefix = self.prefix.clone();
        Ok(items
            .map_ok(move |item| {
                let relative = vpath::strip_prefix(item.path(), &prefix)
                    .unwrap_or_default()
                    .to_string();
                item.with_path(relative)
            })
            .boxed())
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Modification time in seconds since the epoch.
    #[tracing::instrument(skip_all, name = "vfs.last_modified")]
    pub async fn last_modified(&self, location: impl Into<Location>, flags: AccessFlags) -> VfsResult<i64> {
        let path = self
            .resolve(location.into(), flags, "get last modified time")
            .await?;
        self.sync_if_forced(&path, flags).await?;

        if self.uses_index(&path, flags) {
            if let Some(value) = self.dbafs.last_modified(&path).await? {
                return Ok(value);
            }
        }
        self.mounts.last_modified(&path).await
    }

    #[tracing::instrument(skip_all, name = "vfs.file_size")]
    pub async fn file_size(&self, location: impl Into<Location>, flags: AccessFlags) -> VfsResult<u64> {
        let path = self.resolve(location.into(), flags, "get file size").await?;
        self.sync_if_forced(&path, flags).await?;

        if self.uses_index(&path, flags) {
            if let Some(value) = self.dbafs.file_size(&path).await? {
                return Ok(value);
            }
        }
        self.mounts.file_size(&path).await
    }

    #[tracing::instrument(skip_all, name = "vfs.mime_type")]
    pub async fn mime_type(&self, location: impl Into<Location>, flags: AccessFlags) -> VfsResult<String> {
        let path = self.resolve(location.into(), flags, "get mime type").await?;
        self.sync_if_forced(&path, flags).await?;

        if self.uses_index(&path, flags) {
            if let Some(value) = self.dbafs.mime_type(&path).await? {
                return Ok(value);
            }
        }
        self.mounts.mime_type(&path).await
    }

    /// Extra metadata from the index. Empty if the resource has no record
    /// or the index is bypassed.
    #[tracing::instrument(skip_all, name = "vfs.get_extra_metadata")]
    pub async fn get_extra_metadata(
        &self,
        location: impl Into<Location>,
        flags: AccessFlags,
    ) -> VfsResult<ExtraMetadata> {
        let path = self
            .resolve(location.into(), flags, "get extra metadata")
            .await?;
        self.sync_if_forced(&path, flags).await?;

        if flags.bypass_dbafs() {
            return Ok(ExtraMetadata::new());
        }
        self.dbafs.get_extra_metadata(&path).await
    }

    /// Replace the extra metadata of a resource. Does nothing if the
    /// resource has no index record yet.
    #[tracing::instrument(skip_all, name = "vfs.set_extra_metadata")]
    pub async fn set_extra_metadata(
        &self,
        location: impl Into<Location>,
        metadata: ExtraMetadata,
    ) -> VfsResult<()> {
        self.ensure_writable()?;
        let path = self
            .resolve(location.into(), AccessFlags::NONE, "set extra metadata")
            .await?;
        self.dbafs.set_extra_metadata(&path, metadata).await
    }

    // ========================================================================
    // Writing
    // ========================================================================

    #[tracing::instrument(skip_all, name = "vfs.write")]
    pub async fn write(
        &self,
        location: impl Into<Location>,
        contents: &[u8],
        options: &Options,
    ) -> VfsResult<()> {
        self.ensure_writable()?;
        let path = self.resolve(location.into(), AccessFlags::NONE, "write").await?;
        self.mounts.write(&path, contents, options).await?;
        self.dbafs.sync(&[path.as_str()]).await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, name = "vfs.write_stream")]
    pub async fn write_stream(
        &self,
        location: impl Into<Location>,
        stream: ByteStream,
        options: &Options,
    ) -> VfsResult<()> {
        self.ensure_writable()?;
        let path = self.resolve(location.into(), AccessFlags::NONE, "write").await?;
        self.mounts.write_stream(&path, stream, options).await?;
        self.dbafs.sync(&[path.as_str()]).await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, name = "vfs.delete")]
    pub async fn delete(&self, location: impl Into<Location>) -> VfsResult<()> {
        self.ensure_writable()?;
        let path = self.resolve(location.into(), AccessFlags::NONE, "delete").await?;
        self.mounts.delete(&path).await?;
        self.dbafs.sync(&[path.as_str()]).await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, name = "vfs.delete_directory")]
    pub async fn delete_directory(&self, location: impl Into<Location>) -> VfsResult<()> {
        self.ensure_writable()?;
        let path = self
            .resolve(location.into(), AccessFlags::NONE, "delete a directory")
            .await?;
        self.mounts.delete_directory(&path).await?;
        self.dbafs.sync(&[path.as_str()]).await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, name = "vfs.create_directory")]
    pub async fn create_directory(&self, location: impl Into<Location>, options: &Options) -> VfsResult<()> {
        self.ensure_writable()?;
        let path = self
            .resolve(location.into(), AccessFlags::NONE, "create a directory")
            .await?;
        self.mounts.create_directory(&path, options).await?;
        self.dbafs.sync(&[path.as_str()]).await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, name = "vfs.copy")]
    pub async fn copy(
        &self,
        from: impl Into<Location>,
        to: impl Into<Location>,
        options: &Options,
    ) -> VfsResult<()> {
        self.ensure_writable()?;
        let from = self.resolve(from.into(), AccessFlags::NONE, "copy").await?;
        let to = self.resolve(to.into(), AccessFlags::NONE, "copy").await?;
        self.mounts.copy(&from, &to, options).await?;
        self.dbafs.sync(&[from.as_str(), to.as_str()]).await?;
        Ok(())
    }

    /// Move a file. Its UUID is kept if the destination lies in the same
    /// DBAFS area.
    #[tracing::instrument(skip_all, name = "vfs.move")]
    pub async fn move_to(
        &self,
        from: impl Into<Location>,
        to: impl Into<Location>,
        options: &Options,
    ) -> VfsResult<()> {
        self.ensure_writable()?;
        let from = self.resolve(from.into(), AccessFlags::NONE, "move").await?;
        let to = self.resolve(to.into(), AccessFlags::NONE, "move").await?;
        self.mounts.move_to(&from, &to, options).await?;
        self.dbafs.sync(&[from.as_str(), to.as_str()]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::dbafs::{Dbafs, MemoryRepository};

    async fn setup(prefix: &str) -> VirtualFilesystem {
        let mounts = Arc::new(MountManager::new());
        mounts.mount(MemoryAdapter::new(), "").await.unwrap();
        let dbafs = Arc::new(DbafsManager::new());
        dbafs
            .register(Dbafs::new(MemoryRepository::new(), mounts.clone(), "files").unwrap())
            .unwrap();
        VirtualFilesystem::new(mounts, dbafs, prefix).unwrap()
    }

    #[tokio::test]
    async fn test_out_of_bounds_messages() {
        let vfs = setup("files/prefix").await;

        let err = vfs.read("../other/resource").await.unwrap_err();
        assert!(matches!(err, VfsError::OutOfBounds(_)));
        assert_eq!(
            err.to_string(),
            "Virtual filesystem path '../other/resource' must not escape the filesystem boundary."
        );

        let err = vfs.write("/some/place", b"x", &Options::new()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Virtual filesystem path '/some/place' cannot be absolute."
        );
    }

    #[tokio::test]
    async fn test_uuid_outside_prefix_is_out_of_bounds() {
        let vfs = setup("files/prefix").await;
        let root = VirtualFilesystem::new(
            vfs.mount_manager().clone(),
            vfs.dbafs_manager().clone(),
            "",
        )
        .unwrap();

        root.write("files/other/resource", b"data", &Options::new()).await.unwrap();
        let uuid = root.uuid_of("files/other/resource").await.unwrap().unwrap();

        let err = vfs.read(uuid).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Virtual filesystem path '../other/resource' must not escape the filesystem boundary."
        );
    }

    #[tokio::test]
    async fn test_uuid_with_bypass_is_logic_error() {
        let vfs = setup("files").await;
        let uuid = Uuid::now_v7();

        let err = vfs.file_exists(uuid, AccessFlags::BYPASS_DBAFS).await.unwrap_err();
        assert!(matches!(err, VfsError::Logic(_)));
        assert_eq!(
            err.to_string(),
            "Cannot use a UUID in combination with BYPASS_DBAFS to check if a file exists."
        );

        let err = vfs
            .get_extra_metadata(uuid, AccessFlags::BYPASS_DBAFS | AccessFlags::FORCE_SYNC)
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::Logic(_)));
    }

    #[tokio::test]
    async fn test_read_only_rejects_mutations() {
        let vfs = setup("files").await.with_read_only(true);
        let err = vfs.write("a.txt", b"x", &Options::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "Tried to mutate a readonly filesystem instance.");
        assert!(matches!(
            vfs.set_extra_metadata("a.txt", ExtraMetadata::new()).await,
            Err(VfsError::Logic(_))
        ));
    }

    #[tokio::test]
    async fn test_write_syncs_index() {
        let vfs = setup("files").await;
        vfs.write("docs/a.txt", b"hello", &Options::new()).await.unwrap();

        let uuid = vfs.uuid_of("docs/a.txt").await.unwrap().unwrap();
        assert_eq!(vfs.resolve_uuid(uuid).await.unwrap(), "docs/a.txt");
        assert_eq!(vfs.read(uuid).await.unwrap(), b"hello");
        assert!(vfs.file_exists(uuid, AccessFlags::NONE).await.unwrap());
        assert!(vfs.directory_exists("docs", AccessFlags::NONE).await.unwrap());

        vfs.move_to("docs/a.txt", "docs/b.txt", &Options::new()).await.unwrap();
        assert_eq!(vfs.resolve_uuid(uuid).await.unwrap(), "docs/b.txt");

        vfs.delete("docs/b.txt").await.unwrap();
        assert!(!vfs.file_exists(uuid, AccessFlags::NONE).await.unwrap());
    }
}
