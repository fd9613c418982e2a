//! Index repository contract and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::record::IndexRecord;
use crate::error::{IndexError, IndexResult};
use crate::path as vpath;

/// Persistence for index records.
///
/// Paths and UUIDs are both unique keys. Paths are relative to the DBAFS
/// area root.
#[async_trait]
pub trait IndexRepository: Send + Sync {
    async fn find_by_path(&self, path: &str) -> IndexResult<Option<IndexRecord>>;

    async fn find_by_uuid(&self, uuid: Uuid) -> IndexResult<Option<IndexRecord>>;

    /// Insert a new record. Fails with [`IndexError::Duplicate`] if the
    /// UUID or path is taken.
    async fn insert(&self, record: &IndexRecord) -> IndexResult<()>;

    /// Replace the record with the same UUID. The path may change.
    async fn update(&self, record: &IndexRecord) -> IndexResult<()>;

    async fn delete(&self, uuid: Uuid) -> IndexResult<()>;

    /// Records strictly below `prefix` (`""` lists everything), sorted by
    /// path. Without `deep` only direct children are returned.
    async fn list_under(&self, prefix: &str, deep: bool) -> IndexResult<Vec<IndexRecord>>;
}

/// True if `path` lies strictly below `prefix` (directly, unless `deep`).
pub(crate) fn is_listed_under(path: &str, prefix: &str, deep: bool) -> bool {
    match vpath::strip_prefix(path, prefix) {
        Some("") | None => false,
        Some(rest) => deep || !rest.contains('/'),
    }
}

#[derive(Default)]
struct State {
    by_path: BTreeMap<String, IndexRecord>,
    paths: HashMap<Uuid, String>,
}

/// Index repository held entirely in memory.
#[derive(Default)]
pub struct MemoryRepository {
    state: RwLock<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.state.read().by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IndexRepository for MemoryRepository {
    async fn find_by_path(&self, path: &str) -> IndexResult<Option<IndexRecord>> {
        Ok(self.state.read().by_path.get(path).cloned())
    }

    async fn find_by_uuid(&self, uuid: Uuid) -> IndexResult<Option<IndexRecord>> {
        let state = self.state.read();
        Ok(state
            .paths
            .get(&uuid)
            .and_then(|path| state.by_path.get(path))
            .cloned())
    }

    async fn insert(&self, record: &IndexRecord) -> IndexResult<()> {
        let mut state = self.state.write();
        if state.paths.contains_key(&record.uuid) {
            return Err(IndexError::Duplicate(record.uuid.to_string()));
        }
        if state.by_path.contains_key(&record.path) {
            return Err(IndexError::Duplicate(record.path.clone()));
        }
        state.paths.insert(record.uuid, record.path.clone());
        state.by_path.insert(record.path.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, record: &IndexRecord) -> IndexResult<()> {
        let mut state = self.state.write();
        let Some(old_path) = state.paths.get(&record.uuid).cloned() else {
            return Err(IndexError::Corrupt(format!("no record with uuid {}", record.uuid)));
        };
        if old_path != record.path {
            if state.by_path.contains_key(&record.path) {
                return Err(IndexError::Duplicate(record.path.clone()));
            }
            state.by_path.remove(&old_path);
            state.paths.insert(record.uuid, record.path.clone());
        }
        state.by_path.insert(record.path.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, uuid: Uuid) -> IndexResult<()> {
        let mut state = self.state.write();
        if let Some(path) = state.paths.remove(&uuid) {
            state.by_path.remove(&path);
        }
        Ok(())
    }

    async fn list_under(&self, prefix: &str, deep: bool) -> IndexResult<Vec<IndexRecord>> {
        let state = self.state.read();
        Ok(state
            .by_path
            .values()
            .filter(|record| is_listed_under(&record.path, prefix, deep))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemKind;

    fn file(path: &str) -> IndexRecord {
        IndexRecord::new(ItemKind::File, path, "hash")
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let repo = MemoryRepository::new();
        let record = file("a/b.txt");
        repo.insert(&record).await.unwrap();

        assert_eq!(repo.find_by_path("a/b.txt").await.unwrap(), Some(record.clone()));
        assert_eq!(repo.find_by_uuid(record.uuid).await.unwrap(), Some(record));
        assert_eq!(repo.find_by_path("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_path_rejected() {
        let repo = MemoryRepository::new();
        repo.insert(&file("x")).await.unwrap();
        assert!(matches!(
            repo.insert(&file("x")).await,
            Err(IndexError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_update_moves_path_and_keeps_uuid() {
        let repo = MemoryRepository::new();
        let mut record = file("old.txt");
        repo.insert(&record).await.unwrap();

        record.path = "new.txt".into();
        repo.update(&record).await.unwrap();

        assert_eq!(repo.find_by_path("old.txt").await.unwrap(), None);
        assert_eq!(
            repo.find_by_uuid(record.uuid).await.unwrap().map(|r| r.path),
            Some("new.txt".to_string())
        );
    }

    #[tokio::test]
    async fn test_list_under() {
        let repo = MemoryRepository::new();
        for path in ["a", "a/x", "a/y", "a/y/z", "ab", "b"] {
            repo.insert(&file(path)).await.unwrap();
        }

        let paths = |records: Vec<IndexRecord>| records.into_iter().map(|r| r.path).collect::<Vec<_>>();

        assert_eq!(paths(repo.list_under("a", true).await.unwrap()), vec!["a/x", "a/y", "a/y/z"]);
        assert_eq!(paths(repo.list_under("a", false).await.unwrap()), vec!["a/x", "a/y"]);
        assert_eq!(paths(repo.list_under("", false).await.unwrap()), vec!["a", "ab", "b"]);
        assert_eq!(repo.list_under("", true).await.unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_delete() {
        let repo = MemoryRepository::new();
        let record = file("gone");
        repo.insert(&record).await.unwrap();
        repo.delete(record.uuid).await.unwrap();
        assert!(repo.is_empty());
    }
}
