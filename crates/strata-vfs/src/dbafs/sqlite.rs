//! SQLite-backed index repository.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, params};
use uuid::Uuid;

use super::record::IndexRecord;
use super::repository::{IndexRepository, is_listed_under};
use crate::error::{IndexError, IndexResult};
use crate::types::{ExtraMetadata, ItemKind};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dbafs_records (
    uuid TEXT PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    hash TEXT NOT NULL,
    file_size INTEGER,
    last_modified INTEGER,
    extra_metadata TEXT NOT NULL DEFAULT '{}'
);
"#;

const COLUMNS: &str = "uuid, path, kind, hash, file_size, last_modified, extra_metadata";

/// Columns as stored, before validation.
type RawRow = (String, String, String, String, Option<i64>, Option<i64>, String);

/// Index repository persisted in one SQLite table.
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> IndexResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> IndexResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query(&self, sql: &str, arg: &str) -> IndexResult<Vec<IndexRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![arg], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode).collect()
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode(row: RawRow) -> IndexResult<IndexRecord> {
    let (uuid, path, kind, hash, file_size, last_modified, extra) = row;
    let uuid = Uuid::parse_str(&uuid)
        .map_err(|e| IndexError::Corrupt(format!("bad uuid '{uuid}' at '{path}': {e}")))?;
    let kind: ItemKind = kind
        .parse()
        .map_err(|_| IndexError::Corrupt(format!("bad kind '{kind}' at '{path}'")))?;
    let extra_metadata: ExtraMetadata = serde_json::from_str(&extra)?;

    Ok(IndexRecord {
        uuid,
        path,
        kind,
        hash,
        file_size: file_size.map(|s| s as u64),
        last_modified,
        extra_metadata,
    })
}

/// Map unique constraint failures to [`IndexError::Duplicate`].
fn constraint(err: rusqlite::Error, key: &str) -> IndexError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            IndexError::Duplicate(key.to_string())
        }
        _ => IndexError::Sqlite(err),
    }
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl IndexRepository for SqliteRepository {
    async fn find_by_path(&self, path: &str) -> IndexResult<Option<IndexRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM dbafs_records WHERE path = ?1");
        Ok(self.query(&sql, path)?.into_iter().next())
    }

    async fn find_by_uuid(&self, uuid: Uuid) -> IndexResult<Option<IndexRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM dbafs_records WHERE uuid = ?1");
        Ok(self.query(&sql, &uuid.to_string())?.into_iter().next())
    }

    async fn insert(&self, record: &IndexRecord) -> IndexResult<()> {
        let extra = serde_json::to_string(&record.extra_metadata)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO dbafs_records (uuid, path, kind, hash, file_size, last_modified, extra_metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.uuid.to_string(),
                record.path,
                record.kind.as_ref(),
                record.hash,
                record.file_size.map(|s| s as i64),
                record.last_modified,
                extra,
            ],
        )
        .map_err(|e| constraint(e, &record.path))?;
        Ok(())
    }

    async fn update(&self, record: &IndexRecord) -> IndexResult<()> {
        let extra = serde_json::to_string(&record.extra_metadata)?;
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE dbafs_records
                 SET path = ?2, kind = ?3, hash = ?4, file_size = ?5, last_modified = ?6, extra_metadata = ?7
                 WHERE uuid = ?1",
                params![
                    record.uuid.to_string(),
                    record.path,
                    record.kind.as_ref(),
                    record.hash,
                    record.file_size.map(|s| s as i64),
                    record.last_modified,
                    extra,
                ],
            )
            .map_err(|e| constraint(e, &record.path))?;
        if changed == 0 {
            return Err(IndexError::Corrupt(format!("no record with uuid {}", record.uuid)));
        }
        Ok(())
    }

    async fn delete(&self, uuid: Uuid) -> IndexResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM dbafs_records WHERE uuid = ?1",
            params![uuid.to_string()],
        )?;
        Ok(())
    }

    async fn list_under(&self, prefix: &str, deep: bool) -> IndexResult<Vec<IndexRecord>> {
        let records = if prefix.is_empty() {
            let conn = self.conn.lock();
            let sql = format!("SELECT {COLUMNS} FROM dbafs_records ORDER BY path");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(decode).collect::<IndexResult<Vec<_>>>()?
        } else {
            let sql = format!(
                "SELECT {COLUMNS} FROM dbafs_records WHERE path LIKE ?1 ESCAPE '\\' ORDER BY path"
            );
            self.query(&sql, &format!("{}/%", escape_like(prefix)))?
        };

        Ok(records
            .into_iter()
            .filter(|record| is_listed_under(&record.path, prefix, deep))
            .collect())
    }
}
