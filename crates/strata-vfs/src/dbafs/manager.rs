//! Routing across DBAFS areas.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, stream};
use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::area::Dbafs;
use super::record::IndexRecord;
use super::sync::ChangeSet;
use crate::error::{VfsError, VfsResult};
use crate::path as vpath;
use crate::types::{ExtraMetadata, ItemStream, MetadataLoader};

/// Holds the registered DBAFS areas and answers index queries for global
/// paths.
///
/// Paths outside every area are simply not matched; callers fall back to
/// the mount manager for those.
#[derive(Default)]
pub struct DbafsManager {
    areas: RwLock<BTreeMap<String, Arc<Dbafs>>>,
}

impl fmt::Debug for DbafsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbafsManager")
            .field("areas", &self.prefixes())
            .finish()
    }
}

impl DbafsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an area. Areas may not overlap.
    pub fn register(&self, dbafs: Dbafs) -> VfsResult<()> {
        let mut areas = self.areas.write();
        let prefix = dbafs.prefix().to_string();
        if let Some(existing) = areas
            .keys()
            .find(|p| vpath::is_within(&prefix, p) || vpath::is_within(p, &prefix))
        {
            return Err(VfsError::configuration(format!(
                "DBAFS area '{prefix}' overlaps the area at '{existing}'"
            )));
        }
        debug!(prefix = %prefix, "registered DBAFS area");
        areas.insert(prefix, Arc::new(dbafs));
        Ok(())
    }

    /// Prefixes of all registered areas.
    pub fn prefixes(&self) -> Vec<String> {
        self.areas.read().keys().cloned().collect()
    }

    /// The area covering `path` and the path relative to it.
    fn area(&self, path: &str) -> Option<(Arc<Dbafs>, String)> {
        self.areas.read().iter().find_map(|(prefix, area)| {
            vpath::strip_prefix(path, prefix).map(|rel| (Arc::clone(area), rel.to_string()))
        })
    }

    fn all(&self) -> Vec<Arc<Dbafs>> {
        self.areas.read().values().cloned().collect()
    }

    /// True if `path` lies in a DBAFS area.
    pub fn matches(&self, path: &str) -> bool {
        self.area(path).is_some()
    }

    /// Index record for a global path.
    pub async fn record(&self, path: &str) -> VfsResult<Option<IndexRecord>> {
        match self.area(path) {
            Some((area, relative)) if !relative.is_empty() => area.record(&relative).await,
            _ => Ok(None),
        }
    }

    /// Resolve a UUID to a path relative to `root_prefix`.
    ///
    /// The result climbs with `..` if the resource lives outside
    /// `root_prefix`; bounds checking is left to the caller.
    #[tracing::instrument(skip(self), name = "dbafs.resolve_uuid")]
    pub async fn resolve_uuid(&self, uuid: Uuid, root_prefix: &str) -> VfsResult<String> {
        for area in self.all() {
            if let Some(record) = area.record_by_uuid(uuid).await? {
                let global = vpath::join(area.prefix(), &record.path);
                return Ok(vpath::relative_to(&global, root_prefix));
            }
        }
        Err(VfsError::UnableToResolveUuid(uuid))
    }

    /// Sync the given global paths.
    ///
    /// Paths are grouped per area and each area syncs its group in one
    /// pass. A path above an area syncs the whole area; paths outside
    /// every area are ignored.
    #[tracing::instrument(skip(self), name = "dbafs.sync_paths")]
    pub async fn sync(&self, paths: &[&str]) -> VfsResult<ChangeSet> {
        let mut changes = ChangeSet::default();

        for area in self.all() {
            let scopes: Vec<String> = paths
                .iter()
                .filter_map(|path| match vpath::strip_prefix(path, area.prefix()) {
                    Some(relative) => Some(relative.to_string()),
                    None if vpath::is_within(area.prefix(), path) => Some(String::new()),
                    None => None,
                })
                .collect();

            if !scopes.is_empty() {
                changes.merge(area.sync(&scopes).await?);
            }
        }
        Ok(changes)
    }

    pub async fn file_exists(&self, path: &str) -> VfsResult<bool> {
        Ok(self.record(path).await?.is_some_and(|r| r.is_file()))
    }

    /// True for directory records and for area roots.
    pub async fn directory_exists(&self, path: &str) -> VfsResult<bool> {
        match self.area(path) {
            Some((_, relative)) if relative.is_empty() => Ok(true),
            Some((area, relative)) => Ok(area.record(&relative).await?.is_some_and(|r| r.is_dir())),
            None => Ok(false),
        }
    }

    /// Extra metadata of a record; empty if there is none.
    pub async fn get_extra_metadata(&self, path: &str) -> VfsResult<ExtraMetadata> {
        Ok(self
            .record(path)
            .await?
            .map(|r| r.extra_metadata)
            .unwrap_or_default())
    }

    /// Replace the extra metadata of a record. Without a record this does
    /// nothing; a later sync creates the record with empty metadata.
    pub async fn set_extra_metadata(&self, path: &str, metadata: ExtraMetadata) -> VfsResult<()> {
        let stored = match self.area(path) {
            Some((area, relative)) if !relative.is_empty() => {
                area.set_extra_metadata(&relative, metadata).await?
            }
            _ => false,
        };
        if !stored {
            debug!(path, "no index record, extra metadata not stored");
        }
        Ok(())
    }

    /// List index records below a global path. Item paths are global.
    ///
    /// Deep listings walk the index one directory at a time, depth first,
    /// so only the records of the directories on the current branch are
    /// held in memory.
    pub async fn list_contents(&self, path: &str, deep: bool) -> VfsResult<ItemStream> {
        let Some((area, relative)) = self.area(path) else {
            return Ok(stream::empty().boxed());
        };
        let top: VecDeque<IndexRecord> = area.records_under(&relative, false).await?.into();

        let walk = stream::try_unfold((area, vec![top]), move |(area, mut stack)| async move {
            loop {
                let Some(level) = stack.last_mut() else {
                    return Ok::<_, VfsError>(None);
                };
                let Some(record) = level.pop_front() else {
                    stack.pop();
                    continue;
                };
                if deep && record.is_dir() {
                    stack.push(area.records_under(&record.path, false).await?.into());
                }
                let item = record.to_item(vpath::join(area.prefix(), &record.path));
                return Ok(Some((item, (area, stack))));
            }
        });
        Ok(walk.boxed())
    }

    pub async fn last_modified(&self, path: &str) -> VfsResult<Option<i64>> {
        Ok(self.record(path).await?.and_then(|r| r.last_modified))
    }

    pub async fn file_size(&self, path: &str) -> VfsResult<Option<u64>> {
        Ok(self.record(path).await?.and_then(|r| r.file_size))
    }

    pub async fn mime_type(&self, path: &str) -> VfsResult<Option<String>> {
        Ok(self.record(path).await?.and_then(|r| r.mime_type()))
    }
}

#[async_trait]
impl MetadataLoader for DbafsManager {
    async fn load_extra_metadata(&self, path: &str) -> VfsResult<ExtraMetadata> {
        self.get_extra_metadata(path).await
    }
}
