//! Reconciliation of the index against observed storage.
//!
//! [`plan`] is pure: it compares one snapshot of the physical tree with one
//! snapshot of the index and decides what to insert, update, move and
//! delete. Applying the plan is up to the caller.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use super::record::IndexRecord;
use crate::path as vpath;
use crate::types::ItemKind;

/// Physical state of one path at sync time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Observed {
    pub kind: ItemKind,
    pub hash: String,
    pub file_size: Option<u64>,
    pub last_modified: Option<i64>,
}

impl Observed {
    fn matches(&self, record: &IndexRecord) -> bool {
        self.hash == record.hash
            && self.file_size == record.file_size
            && self.last_modified == record.last_modified
    }

    fn apply_to(&self, record: &mut IndexRecord) {
        record.kind = self.kind;
        record.hash = self.hash.clone();
        record.file_size = self.file_size;
        record.last_modified = self.last_modified;
    }

    fn into_record(self, path: &str) -> IndexRecord {
        IndexRecord::new(self.kind, path, self.hash)
            .with_file_size(self.file_size)
            .with_last_modified(self.last_modified)
    }
}

/// Index mutations computed by [`plan`].
#[derive(Debug, Default)]
pub(crate) struct SyncPlan {
    pub deletes: Vec<IndexRecord>,
    /// Old path and the record at its new location (same UUID).
    pub moves: Vec<(String, IndexRecord)>,
    pub updates: Vec<IndexRecord>,
    pub inserts: Vec<IndexRecord>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty()
            && self.moves.is_empty()
            && self.updates.is_empty()
            && self.inserts.is_empty()
    }
}

/// Drift found (and fixed) by a sync. Paths are global.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    /// `(from, to)` pairs.
    pub moved: Vec<(String, String)>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
            && self.updated.is_empty()
            && self.moved.is_empty()
            && self.deleted.is_empty()
    }

    /// Total number of changes.
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.moved.len() + self.deleted.len()
    }

    pub fn merge(&mut self, other: ChangeSet) {
        self.created.extend(other.created);
        self.updated.extend(other.updated);
        self.moved.extend(other.moved);
        self.deleted.extend(other.deleted);
    }
}

/// Pick the move target for a vanished record among same-hash candidates.
///
/// Preference: the path implied by an already detected parent move, then a
/// candidate with the same file name, then the first one.
fn pick_target<'a>(
    record: &IndexRecord,
    candidates: &[&'a String],
    rebases: &[(String, String)],
) -> Option<&'a String> {
    let rebased = rebases
        .iter()
        .filter_map(|(from, to)| {
            vpath::strip_prefix(&record.path, from).map(|rest| (from.len(), vpath::join(to, rest)))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, path)| path);

    if let Some(hit) = rebased.and_then(|rebased| candidates.iter().find(|c| ***c == rebased)) {
        return Some(*hit);
    }

    if candidates.len() > 1 {
        warn!(
            path = %record.path,
            candidates = candidates.len(),
            "ambiguous move detection, several new paths share the same hash"
        );
    }

    candidates
        .iter()
        .find(|c| vpath::basename(c) == record.name())
        .or_else(|| candidates.first())
        .copied()
}

/// Compare observed storage against indexed records.
///
/// Both maps are keyed by area-relative path and must cover the same
/// scope. A record whose path vanished is matched against new paths with
/// the same kind and hash to detect a move; this is a heuristic and two
/// unrelated resources with identical content may be confused.
pub(crate) fn plan(
    observed: BTreeMap<String, Observed>,
    indexed: BTreeMap<String, IndexRecord>,
) -> SyncPlan {
    let mut plan = SyncPlan::default();
    let mut vanished = Vec::new();

    for (path, record) in &indexed {
        match observed.get(path) {
            Some(seen) if seen.kind == record.kind => {
                if !seen.matches(record) {
                    let mut record = record.clone();
                    seen.apply_to(&mut record);
                    plan.updates.push(record);
                }
            }
            // Kind changed: the old resource is gone for good.
            Some(_) => plan.deletes.push(record.clone()),
            None => vanished.push(record),
        }
    }

    let mut unclaimed: BTreeSet<&String> = observed
        .iter()
        .filter(|(path, seen)| indexed.get(*path).is_none_or(|r| r.kind != seen.kind))
        .map(|(path, _)| path)
        .collect();

    // Parents come first (sorted by path), so directory moves are known
    // before their children are matched.
    let mut rebases: Vec<(String, String)> = Vec::new();
    for record in vanished {
        let candidates: Vec<&String> = unclaimed
            .iter()
            .copied()
            .filter(|path| {
                observed
                    .get(*path)
                    .is_some_and(|seen| seen.kind == record.kind && seen.hash == record.hash)
            })
            .collect();

        match pick_target(record, &candidates, &rebases) {
            Some(target) => {
                unclaimed.remove(target);
                let mut moved = record.clone();
                if let Some(seen) = observed.get(target) {
                    seen.apply_to(&mut moved);
                }
                moved.path = target.clone();
                if record.is_dir() {
                    rebases.push((record.path.clone(), target.clone()));
                }
                plan.moves.push((record.path.clone(), moved));
            }
            None => plan.deletes.push(record.clone()),
        }
    }

    let unclaimed: Vec<String> = unclaimed.into_iter().cloned().collect();
    let mut observed = observed;
    for path in unclaimed {
        if let Some(seen) = observed.remove(&path) {
            plan.inserts.push(seen.into_record(&path));
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbafs::hash::hash_bytes;

    fn file(content: &str) -> Observed {
        Observed {
            kind: ItemKind::File,
            hash: hash_bytes(content.as_bytes()),
            file_size: Some(content.len() as u64),
            last_modified: Some(100),
        }
    }

    fn dir(hash: &str) -> Observed {
        Observed {
            kind: ItemKind::Directory,
            hash: hash.to_string(),
            file_size: None,
            last_modified: None,
        }
    }

    fn index(entries: &[(&str, &Observed)]) -> BTreeMap<String, IndexRecord> {
        entries
            .iter()
            .map(|(path, seen)| (path.to_string(), (*seen).clone().into_record(path)))
            .collect()
    }

    fn observe(entries: &[(&str, &Observed)]) -> BTreeMap<String, Observed> {
        entries
            .iter()
            .map(|(path, seen)| (path.to_string(), (*seen).clone()))
            .collect()
    }

    #[test]
    fn test_unchanged_tree_plans_nothing() {
        let a = file("a");
        let d = dir("d");
        let entries = [("docs", &d), ("docs/a.txt", &a)];
        assert!(plan(observe(&entries), index(&entries)).is_empty());
    }

    #[test]
    fn test_create_update_delete() {
        let old = file("old");
        let new = file("newer");
        let gone = file("gone");

        let indexed = index(&[("keep.txt", &old), ("gone.txt", &gone)]);
        let uuid = indexed["keep.txt"].uuid;
        let observed = observe(&[("keep.txt", &new), ("fresh.txt", &file("fresh"))]);

        let plan = plan(observed, indexed);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].uuid, uuid);
        assert_eq!(plan.updates[0].hash, new.hash);
        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.inserts[0].path, "fresh.txt");
        assert_eq!(plan.deletes.len(), 1);
        assert_eq!(plan.deletes[0].path, "gone.txt");
        assert!(plan.moves.is_empty());
    }

    #[test]
    fn test_move_preserves_uuid() {
        let content = file("payload");
        let indexed = index(&[("a/file.txt", &content)]);
        let uuid = indexed["a/file.txt"].uuid;

        let plan = plan(observe(&[("b/file.txt", &content)]), indexed);
        assert_eq!(plan.moves.len(), 1);
        let (from, record) = &plan.moves[0];
        assert_eq!(from, "a/file.txt");
        assert_eq!(record.path, "b/file.txt");
        assert_eq!(record.uuid, uuid);
        assert!(plan.inserts.is_empty());
        assert!(plan.deletes.is_empty());
    }

    #[test]
    fn test_ambiguous_move_prefers_same_name() {
        let content = file("same");
        let indexed = index(&[("old/logo.png", &content)]);

        let observed = observe(&[("new/a.png", &content), ("new/logo.png", &content)]);
        let plan = plan(observed, indexed);

        assert_eq!(plan.moves[0].1.path, "new/logo.png");
        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.inserts[0].path, "new/a.png");
    }

    #[test]
    fn test_directory_move_carries_children() {
        let x = file("same");
        let y = file("same");
        let d = dir("tree");

        let indexed = index(&[("src", &d), ("src/x.txt", &x), ("src/y/x.txt", &y), ("other/x.txt", &x)]);
        let observed = observe(&[
            ("dst", &d),
            ("dst/x.txt", &x),
            ("dst/y", &dir("sub")),
            ("dst/y/x.txt", &y),
            ("other/x.txt", &x),
        ]);

        let plan = plan(observed, indexed);
        let moves: BTreeMap<_, _> = plan
            .moves
            .iter()
            .map(|(from, r)| (from.as_str(), r.path.as_str()))
            .collect();
        assert_eq!(moves.get("src"), Some(&"dst"));
        assert_eq!(moves.get("src/x.txt"), Some(&"dst/x.txt"));
        assert_eq!(moves.get("src/y/x.txt"), Some(&"dst/y/x.txt"));
        // "src/y" had no record of its own
        assert!(plan.inserts.iter().any(|r| r.path == "dst/y"));
    }

    #[test]
    fn test_kind_change_is_delete_and_create() {
        let indexed = index(&[("thing", &file("x"))]);
        let observed = observe(&[("thing", &dir("d"))]);

        let plan = plan(observed, indexed);
        assert_eq!(plan.deletes.len(), 1);
        assert_eq!(plan.inserts.len(), 1);
        assert!(plan.inserts[0].is_dir());
    }

    #[test]
    fn test_change_set_merge() {
        let mut a = ChangeSet {
            created: vec!["a".into()],
            ..Default::default()
        };
        a.merge(ChangeSet {
            moved: vec![("b".into(), "c".into())],
            ..Default::default()
        });
        assert_eq!(a.len(), 2);
        assert!(!a.is_empty());
    }
}
