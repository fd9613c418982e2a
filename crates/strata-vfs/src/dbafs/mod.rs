//! Database-backed filesystem (DBAFS).
//!
//! A DBAFS area keeps one [`IndexRecord`] per file and directory below its
//! prefix: a stable UUID, a content fingerprint and arbitrary extra
//! metadata. The index is brought up to date with [`Dbafs::sync`], which
//! compares the records with what the mount manager currently sees and
//! inserts, updates, moves or deletes records accordingly. Moves are
//! detected by fingerprint so UUIDs survive renames.
//!
//! [`DbafsManager`] routes global paths to the registered areas.

mod area;
pub mod hash;
mod manager;
mod record;
mod repository;
mod sqlite;
mod sync;

pub use area::Dbafs;
pub use manager::DbafsManager;
pub use record::IndexRecord;
pub use repository::{IndexRepository, MemoryRepository};
pub use sqlite::SqliteRepository;
pub use sync::ChangeSet;
