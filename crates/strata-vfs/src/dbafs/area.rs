//! One DBAFS area: an index covering the subtree below a prefix.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use futures::TryStreamExt;
use tracing::{debug, info};
use uuid::Uuid;

use super::hash::{hash_directory, hash_stream};
use super::record::IndexRecord;
use super::repository::IndexRepository;
use super::sync::{ChangeSet, Observed, SyncPlan, plan};
use crate::error::{OperationKind, StorageError, VfsError, VfsResult};
use crate::mount::MountManager;
use crate::path as vpath;
use crate::types::{ExtraMetadata, ItemKind};

/// Metadata index for the subtree below `prefix`.
///
/// Record paths are relative to the prefix. Physical state is read through
/// the shared [`MountManager`].
pub struct Dbafs {
    prefix: String,
    repository: Arc<dyn IndexRepository>,
    mounts: Arc<MountManager>,
    use_last_modified: bool,
}

impl fmt::Debug for Dbafs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dbafs")
            .field("prefix", &self.prefix)
            .field("use_last_modified", &self.use_last_modified)
            .finish_non_exhaustive()
    }
}

/// Drop duplicate scopes and scopes nested in another one.
fn reduce_scopes(scopes: &[String]) -> Vec<String> {
    let mut sorted = scopes.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut kept: Vec<String> = Vec::new();
    for scope in sorted {
        if !kept.iter().any(|k| vpath::is_within(&scope, k)) {
            kept.push(scope);
        }
    }
    kept
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

fn directory() -> Observed {
    Observed {
        kind: ItemKind::Directory,
        hash: String::new(),
        file_size: None,
        last_modified: None,
    }
}

impl Dbafs {
    pub fn new(
        repository: impl IndexRepository + 'static,
        mounts: Arc<MountManager>,
        prefix: &str,
    ) -> VfsResult<Self> {
        Self::with_repository(Arc::new(repository), mounts, prefix)
    }

    /// Create an area over a shared repository.
    pub fn with_repository(
        repository: Arc<dyn IndexRepository>,
        mounts: Arc<MountManager>,
        prefix: &str,
    ) -> VfsResult<Self> {
        Ok(Self {
            prefix: vpath::normalize_prefix(prefix)?,
            repository,
            mounts,
            use_last_modified: true,
        })
    }

    /// Whether an unchanged size and modification time is enough to reuse
    /// a file's stored hash. Enabled by default; when disabled every sync
    /// re-reads file contents.
    pub fn use_last_modified(mut self, enabled: bool) -> Self {
        self.use_last_modified = enabled;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn repository(&self) -> &Arc<dyn IndexRepository> {
        &self.repository
    }

    fn global(&self, relative: &str) -> String {
        vpath::join(&self.prefix, relative)
    }

    pub async fn record(&self, path: &str) -> VfsResult<Option<IndexRecord>> {
        Ok(self.repository.find_by_path(path).await?)
    }

    pub async fn record_by_uuid(&self, uuid: Uuid) -> VfsResult<Option<IndexRecord>> {
        Ok(self.repository.find_by_uuid(uuid).await?)
    }

    pub async fn records_under(&self, path: &str, deep: bool) -> VfsResult<Vec<IndexRecord>> {
        Ok(self.repository.list_under(path, deep).await?)
    }

    /// Replace the extra metadata of a record. Returns `false` if there is
    /// no record at `path`.
    pub async fn set_extra_metadata(&self, path: &str, metadata: ExtraMetadata) -> VfsResult<bool> {
        let Some(mut record) = self.repository.find_by_path(path).await? else {
            return Ok(false);
        };
        record.extra_metadata = metadata;
        self.repository.update(&record).await?;
        Ok(true)
    }

    /// Reconcile the index with storage for the given subtrees.
    ///
    /// `scopes` are relative to the area root; `""` is the whole area. All
    /// scopes are compared in one pass, so a move between two of them keeps
    /// its UUID.
    #[tracing::instrument(skip(self), name = "dbafs.sync", fields(prefix = %self.prefix))]
    pub async fn sync(&self, scopes: &[String]) -> VfsResult<ChangeSet> {
        let scopes = reduce_scopes(scopes);

        let mut indexed = BTreeMap::new();
        for scope in &scopes {
            if !scope.is_empty() {
                if let Some(record) = self.repository.find_by_path(scope).await? {
                    indexed.insert(record.path.clone(), record);
                }
            }
            for record in self.repository.list_under(scope, true).await? {
                indexed.insert(record.path.clone(), record);
            }
        }

        let mut observed = BTreeMap::new();
        for scope in &scopes {
            self.observe(scope, &mut observed).await?;
        }
        self.fingerprint(&mut observed, &indexed).await?;

        let mut changes = self.apply(plan(observed, indexed)).await?;
        changes.merge(self.refresh_ancestors(&scopes).await?);

        if changes.is_empty() {
            debug!("index up to date");
        } else {
            info!(
                created = changes.created.len(),
                updated = changes.updated.len(),
                moved = changes.moved.len(),
                deleted = changes.deleted.len(),
                "index synchronized"
            );
        }
        Ok(changes)
    }

    /// Record what currently exists at and below `scope`. Hashes are
    /// filled in later.
    async fn observe(&self, scope: &str, observed: &mut BTreeMap<String, Observed>) -> VfsResult<()> {
        let global = self.global(scope);

        if !scope.is_empty() && self.mounts.file_exists(&global).await? {
            let file_size = self.mounts.file_size(&global).await?;
            let last_modified = self.mounts.last_modified(&global).await?;
            observed.insert(
                scope.to_string(),
                Observed {
                    kind: ItemKind::File,
                    hash: String::new(),
                    file_size: Some(file_size),
                    last_modified: Some(last_modified),
                },
            );
            return Ok(());
        }

        if !self.mounts.directory_exists(&global).await? {
            debug!(path = %global, "sync scope does not exist");
            return Ok(());
        }
        if !scope.is_empty() {
            observed.insert(scope.to_string(), directory());
        }

        let mut listing = self.mounts.list_contents(&global, true).await?;
        while let Some(item) = listing.try_next().await? {
            let Some(relative) = vpath::strip_prefix(item.path(), &self.prefix) else {
                continue;
            };
            let entry = if item.is_file() {
                Observed {
                    kind: ItemKind::File,
                    hash: String::new(),
                    file_size: item.file_size(),
                    last_modified: item.last_modified(),
                }
            } else {
                directory()
            };
            observed.insert(relative.to_string(), entry);
        }
        Ok(())
    }

    /// Fill in hashes: files from content (or the stored hash if size and
    /// mtime are unchanged), then directories bottom-up from their
    /// children.
    async fn fingerprint(
        &self,
        observed: &mut BTreeMap<String, Observed>,
        indexed: &BTreeMap<String, IndexRecord>,
    ) -> VfsResult<()> {
        for (path, entry) in observed.iter_mut().filter(|(_, e)| e.kind.is_file()) {
            let reusable = indexed.get(path).filter(|record| {
                self.use_last_modified
                    && record.is_file()
                    && entry.file_size.is_some()
                    && entry.last_modified.is_some()
                    && record.file_size == entry.file_size
                    && record.last_modified == entry.last_modified
            });
            entry.hash = match reusable {
                Some(record) => record.hash.clone(),
                None => self.hash_file(path).await?,
            };
        }

        let mut dirs: Vec<String> = observed
            .iter()
            .filter(|(_, e)| e.kind.is_dir())
            .map(|(path, _)| path.clone())
            .collect();
        dirs.sort_by_key(|path| Reverse(depth(path)));

        for dir in dirs {
            let start = format!("{dir}/");
            let hash = hash_directory(
                observed
                    .range(start.clone()..)
                    .take_while(|(path, _)| path.starts_with(&start))
                    .filter(|(path, _)| vpath::parent(path) == Some(dir.as_str()))
                    .map(|(path, e)| (vpath::basename(path), e.hash.as_str())),
            );
            if let Some(entry) = observed.get_mut(&dir) {
                entry.hash = hash;
            }
        }
        Ok(())
    }

    async fn hash_file(&self, path: &str) -> VfsResult<String> {
        let global = self.global(path);
        let stream = self.mounts.read_stream(&global).await?;
        hash_stream(stream)
            .await
            .map_err(|e| VfsError::adapter(OperationKind::Read, global, StorageError::Io(e)))
    }

    async fn apply(&self, plan: SyncPlan) -> VfsResult<ChangeSet> {
        let mut changes = ChangeSet::default();

        for record in plan.deletes {
            self.repository.delete(record.uuid).await?;
            changes.deleted.push(self.global(&record.path));
        }
        for (from, record) in plan.moves {
            self.repository.update(&record).await?;
            debug!(from = %from, to = %record.path, uuid = %record.uuid, "detected move");
            changes.moved.push((self.global(&from), self.global(&record.path)));
        }
        for record in plan.updates {
            self.repository.update(&record).await?;
            changes.updated.push(self.global(&record.path));
        }
        for record in plan.inserts {
            self.repository.insert(&record).await?;
            changes.created.push(self.global(&record.path));
        }
        Ok(changes)
    }

    /// Insert missing ancestor directories of the synced scopes and
    /// recompute their hashes from the index, deepest first.
    async fn refresh_ancestors(&self, scopes: &[String]) -> VfsResult<ChangeSet> {
        let mut changes = ChangeSet::default();

        let ancestors: BTreeSet<&str> = scopes.iter().flat_map(|s| vpath::ancestors(s)).collect();
        let mut ancestors: Vec<&str> = ancestors.into_iter().collect();
        ancestors.sort_by_key(|path| Reverse(depth(path)));

        for dir in ancestors {
            let children = self.repository.list_under(dir, false).await?;
            let hash = hash_directory(children.iter().map(|r| (r.name(), r.hash.as_str())));

            match self.repository.find_by_path(dir).await? {
                Some(mut record) if record.is_dir() => {
                    if record.hash != hash {
                        record.hash = hash;
                        self.repository.update(&record).await?;
                        changes.updated.push(self.global(dir));
                    }
                }
                // Stale file record; replaced when that path is synced.
                Some(_) => {}
                None if !children.is_empty() => {
                    let record = IndexRecord::new(ItemKind::Directory, dir, hash);
                    self.repository.insert(&record).await?;
                    changes.created.push(self.global(dir));
                }
                None => {}
            }
        }
        Ok(changes)
    }
}
