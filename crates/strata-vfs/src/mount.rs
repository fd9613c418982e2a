//! Mount manager with longest-prefix routing.
//!
//! Routes storage operations to the adapter that owns a path and merges
//! the mounted adapters into one logical tree.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt, future, stream};
use tokio::sync::RwLock;
use tracing::debug;

use crate::adapter::StorageAdapter;
use crate::error::{OperationKind, StorageError, VfsError, VfsResult};
use crate::path as vpath;
use crate::types::{ByteStream, FilesystemItem, ItemStream, Options};

type MountMap = BTreeMap<String, Arc<dyn StorageAdapter>>;

/// A resolved route: owning mount prefix, its adapter, and the path
/// relative to the adapter root.
struct Route {
    prefix: String,
    adapter: Arc<dyn StorageAdapter>,
    relative: String,
}

/// Routes storage operations to mounted adapters.
///
/// Mount points are matched by longest prefix. If `files` and
/// `files/remote` are both mounted, `files/remote/a.png` is routed to the
/// `files/remote` mount.
pub struct MountManager {
    /// Adapters keyed by normalized prefix (`""` is the root mount).
    mounts: RwLock<MountMap>,
}

impl fmt::Debug for MountManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountManager")
            .field("mounts", &"<locked>")
            .finish()
    }
}

impl Default for MountManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Longest mount prefix covering `path`.
fn owner_of<'a>(prefixes: impl Iterator<Item = &'a String>, path: &str) -> Option<&'a String> {
    prefixes
        .filter(|prefix| vpath::is_within(path, prefix))
        .max_by_key(|prefix| prefix.len())
}

impl MountManager {
    /// Create a new empty mount manager.
    pub fn new() -> Self {
        Self {
            mounts: RwLock::new(BTreeMap::new()),
        }
    }

    /// Mount an adapter under a path prefix.
    ///
    /// Nested prefixes are allowed (longest prefix wins); mounting twice at
    /// the same prefix is ambiguous and fails with a configuration error.
    pub async fn mount(&self, adapter: impl StorageAdapter + 'static, prefix: &str) -> VfsResult<()> {
        self.mount_arc(Arc::new(adapter), prefix).await
    }

    /// Mount an adapter that is already wrapped in an `Arc`.
    pub async fn mount_arc(&self, adapter: Arc<dyn StorageAdapter>, prefix: &str) -> VfsResult<()> {
        let prefix = vpath::normalize_prefix(prefix)?;
        let mut mounts = self.mounts.write().await;
        if mounts.contains_key(&prefix) {
            return Err(VfsError::configuration(format!(
                "an adapter is already mounted at '{prefix}'"
            )));
        }
        debug!(prefix = %prefix, "mounted adapter");
        mounts.insert(prefix, adapter);
        Ok(())
    }

    /// Remove the mount at `prefix`. Returns `true` if something was mounted.
    pub async fn unmount(&self, prefix: &str) -> bool {
        let Ok(prefix) = vpath::normalize_prefix(prefix) else {
            return false;
        };
        self.mounts.write().await.remove(&prefix).is_some()
    }

    /// All mount prefixes, sorted.
    pub async fn list_mounts(&self) -> Vec<String> {
        self.mounts.read().await.keys().cloned().collect()
    }

    /// Find the adapter that owns `path` and the path relative to it.
    pub async fn resolve(&self, path: &str) -> VfsResult<(Arc<dyn StorageAdapter>, String)> {
        let route = self.route(path).await?;
        Ok((route.adapter, route.relative))
    }

    async fn route(&self, path: &str) -> VfsResult<Route> {
        let mounts = self.mounts.read().await;
        let prefix = owner_of(mounts.keys(), path).ok_or_else(|| VfsError::unroutable(path))?;
        let relative = vpath::strip_prefix(path, prefix).unwrap_or_default().to_string();
        Ok(Route {
            prefix: prefix.clone(),
            adapter: Arc::clone(&mounts[prefix]),
            relative,
        })
    }

    /// True if `path` is a mount point or lies above one.
    async fn is_virtual_directory(&self, path: &str) -> bool {
        let mounts = self.mounts.read().await;
        mounts.keys().any(|prefix| vpath::is_within(prefix, path))
    }

    // ========================================================================
    // Reading
    // ========================================================================

    #[tracing::instrument(skip(self), name = "mount.file_exists")]
    pub async fn file_exists(&self, path: &str) -> VfsResult<bool> {
        let route = self.route(path).await?;
        route
            .adapter
            .file_exists(&route.relative)
            .await
            .map_err(|e| VfsError::adapter(OperationKind::CheckExists, path, e))
    }

    #[tracing::instrument(skip(self), name = "mount.directory_exists")]
    pub async fn directory_exists(&self, path: &str) -> VfsResult<bool> {
        if self.is_virtual_directory(path).await {
            return Ok(true);
        }
        let route = self.route(path).await?;
        route
            .adapter
            .directory_exists(&route.relative)
            .await
            .map_err(|e| VfsError::adapter(OperationKind::CheckExists, path, e))
    }

    #[tracing::instrument(skip(self), name = "mount.read")]
    pub async fn read(&self, path: &str) -> VfsResult<Vec<u8>> {
        let route = self.route(path).await?;
        route
            .adapter
            .read(&route.relative)
            .await
            .map_err(|e| VfsError::adapter(OperationKind::Read, path, e))
    }

    #[tracing::instrument(skip(self), name = "mount.read_stream")]
    pub async fn read_stream(&self, path: &str) -> VfsResult<ByteStream> {
        let route = self.route(path).await?;
        route
            .adapter
            .read_stream(&route.relative)
            .await
            .map_err(|e| VfsError::adapter(OperationKind::Read, path, e))
    }

    /// List the merged tree below `path`.
    ///
    /// Item paths are global (they include mount prefixes). Mount points
    /// below `path` show up as directories, and deep listings descend into
    /// nested mounts. Entries of an adapter that are hidden by a nested
    /// mount are skipped.
    #[tracing::instrument(skip(self), name = "mount.list_contents")]
    pub async fn list_contents(&self, path: &str, deep: bool) -> VfsResult<ItemStream> {
        let mounts = self.mounts.read().await.clone();
        let prefixes: Arc<Vec<String>> = Arc::new(mounts.keys().cloned().collect());

        let owner = owner_of(prefixes.iter(), path).cloned();
        let children: Vec<&String> = prefixes
            .iter()
            .filter(|p| p.as_str() != path && vpath::is_within(p, path))
            .collect();

        if owner.is_none() && children.is_empty() {
            return Err(VfsError::unroutable(path));
        }

        // Mount points and their parents below `path`.
        let mut virtual_dirs = BTreeSet::new();
        for child in &children {
            let rest = vpath::strip_prefix(child, path).unwrap_or_default();
            let mut current = path.to_string();
            for segment in rest.split('/') {
                current = vpath::join(&current, segment);
                virtual_dirs.insert(current.clone());
                if !deep {
                    break;
                }
            }
        }
        debug!(virtual_dirs = virtual_dirs.len(), "merging mount listing");

        let synthetic: Vec<FilesystemItem> = virtual_dirs
            .iter()
            .map(|p| FilesystemItem::directory(p.clone()))
            .collect();
        let mut sources: Vec<ItemStream> = Vec::new();

        if let Some(owner) = owner {
            let relative = vpath::strip_prefix(path, &owner).unwrap_or_default().to_string();
            sources.push(adapter_listing(
                Arc::clone(&mounts[&owner]),
                owner,
                relative,
                deep,
                Arc::clone(&prefixes),
            ));
        }

        if deep {
            for child in children {
                sources.push(adapter_listing(
                    Arc::clone(&mounts[child]),
                    child.clone(),
                    String::new(),
                    true,
                    Arc::clone(&prefixes),
                ));
            }
        }

        // Adapters never overlap each other, only the synthetic directories.
        let adapters = stream::iter(sources)
            .flatten()
            .try_filter(move |item| future::ready(!virtual_dirs.contains(item.path())));
        Ok(stream::iter(synthetic.into_iter().map(Ok))
            .chain(adapters)
            .boxed())
    }

    // ========================================================================
    // Writing
    // ========================================================================

    #[tracing::instrument(skip(self, contents, options), name = "mount.write")]
    pub async fn write(&self, path: &str, contents: &[u8], options: &Options) -> VfsResult<()> {
        let route = self.route(path).await?;
        route
            .adapter
            .write(&route.relative, contents, options)
            .await
            .map_err(|e| VfsError::adapter(OperationKind::Write, path, e))
    }

    #[tracing::instrument(skip(self, stream, options), name = "mount.write_stream")]
    pub async fn write_stream(
        &self,
        path: &str,
        stream: ByteStream,
        options: &Options,
    ) -> VfsResult<()> {
        let route = self.route(path).await?;
        route
            .adapter
            .write_stream(&route.relative, stream, options)
            .await
            .map_err(|e| VfsError::adapter(OperationKind::Write, path, e))
    }

    #[tracing::instrument(skip(self), name = "mount.delete")]
    pub async fn delete(&self, path: &str) -> VfsResult<()> {
        let route = self.route(path).await?;
        route
            .adapter
            .delete(&route.relative)
            .await
            .map_err(|e| VfsError::adapter(OperationKind::Delete, path, e))
    }

    #[tracing::instrument(skip(self), name = "mount.delete_directory")]
    pub async fn delete_directory(&self, path: &str) -> VfsResult<()> {
        let route = self.route(path).await?;
        route
            .adapter
            .delete_directory(&route.relative)
            .await
            .map_err(|e| VfsError::adapter(OperationKind::DeleteDirectory, path, e))
    }

    #[tracing::instrument(skip(self, options), name = "mount.create_directory")]
    pub async fn create_directory(&self, path: &str, options: &Options) -> VfsResult<()> {
        let route = self.route(path).await?;
        route
            .adapter
            .create_directory(&route.relative, options)
            .await
            .map_err(|e| VfsError::adapter(OperationKind::CreateDirectory, path, e))
    }

    /// Copy a file. Across mounts this streams from one adapter into the
    /// other.
    #[tracing::instrument(skip(self, options), name = "mount.copy")]
    pub async fn copy(&self, from: &str, to: &str, options: &Options) -> VfsResult<()> {
        let source = self.route(from).await?;
        let target = self.route(to).await?;
        let fail = |e: StorageError| VfsError::adapter_pair(OperationKind::Copy, from, to, e);

        if source.prefix == target.prefix {
            return source
                .adapter
                .copy(&source.relative, &target.relative, options)
                .await
                .map_err(fail);
        }

        debug!("copying across mounts");
        transfer(&source, &target, options).await.map_err(fail)
    }

    /// Move a file. Across mounts this is copy then delete, which is not
    /// atomic.
    #[tracing::instrument(skip(self, options), name = "mount.move")]
    pub async fn move_to(&self, from: &str, to: &str, options: &Options) -> VfsResult<()> {
        let source = self.route(from).await?;
        let target = self.route(to).await?;
        let fail = |e: StorageError| VfsError::adapter_pair(OperationKind::Move, from, to, e);

        if source.prefix == target.prefix {
            return source
                .adapter
                .move_to(&source.relative, &target.relative, options)
                .await
                .map_err(fail);
        }

        debug!("moving across mounts");
        transfer(&source, &target, options).await.map_err(fail)?;
        source.adapter.delete(&source.relative).await.map_err(fail)
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    #[tracing::instrument(skip(self), name = "mount.last_modified")]
    pub async fn last_modified(&self, path: &str) -> VfsResult<i64> {
        let route = self.route(path).await?;
        route
            .adapter
            .last_modified(&route.relative)
            .await
            .map_err(|e| VfsError::adapter(OperationKind::RetrieveMetadata, path, e))
    }

    #[tracing::instrument(skip(self), name = "mount.file_size")]
    pub async fn file_size(&self, path: &str) -> VfsResult<u64> {
        let route = self.route(path).await?;
        route
            .adapter
            .file_size(&route.relative)
            .await
            .map_err(|e| VfsError::adapter(OperationKind::RetrieveMetadata, path, e))
    }

    #[tracing::instrument(skip(self), name = "mount.mime_type")]
    pub async fn mime_type(&self, path: &str) -> VfsResult<String> {
        let route = self.route(path).await?;
        route
            .adapter
            .mime_type(&route.relative)
            .await
            .map_err(|e| VfsError::adapter(OperationKind::RetrieveMetadata, path, e))
    }
}

/// Stream a file from one adapter into another.
async fn transfer(source: &Route, target: &Route, options: &Options) -> Result<(), StorageError> {
    if !source.adapter.file_exists(&source.relative).await? {
        return Err(StorageError::not_found(&source.relative));
    }
    let stream = source.adapter.read_stream(&source.relative).await?;
    target
        .adapter
        .write_stream(&target.relative, stream, options)
        .await
}

/// Lazily open one adapter's listing and translate it to global paths,
/// dropping entries that belong to a more specific mount.
fn adapter_listing(
    adapter: Arc<dyn StorageAdapter>,
    mount_prefix: String,
    relative: String,
    deep: bool,
    prefixes: Arc<Vec<String>>,
) -> ItemStream {
    let global = vpath::join(&mount_prefix, &relative);

    stream::once(async move {
        let listing = adapter
            .list_contents(&relative, deep)
            .await
            .map_err(|e| VfsError::adapter(OperationKind::ListContents, global.clone(), e))?;

        let owner = mount_prefix.clone();
        let items = listing
            .map(move |result| {
                result
                    .map(|item| {
                        let path = vpath::join(&mount_prefix, item.path());
                        item.with_path(path)
                    })
                    .map_err(|e| VfsError::adapter(OperationKind::ListContents, global.clone(), e))
            })
            .try_filter(move |item| {
                let visible = owner_of(prefixes.iter(), item.path()) == Some(&owner);
                future::ready(visible)
            });
        Ok::<_, VfsError>(items)
    })
    .try_flatten()
    .boxed()
}
