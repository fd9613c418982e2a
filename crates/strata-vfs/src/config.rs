//! TOML configuration.
//!
//! ```toml
//! prefix = ""
//! read_only = false
//!
//! [[mounts]]
//! prefix = "files"
//! adapter = { type = "local", root = "/srv/files" }
//!
//! [[mounts]]
//! prefix = "scratch"
//! adapter = { type = "memory" }
//!
//! [[dbafs]]
//! prefix = "files"
//! index = { type = "sqlite", path = "/var/lib/strata/index.db" }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::adapter::{LocalAdapter, MemoryAdapter, StorageAdapter};
use crate::dbafs::{Dbafs, DbafsManager, IndexRepository, MemoryRepository, SqliteRepository};
use crate::error::{VfsError, VfsResult};
use crate::mount::MountManager;
use crate::vfs::VirtualFilesystem;

/// Complete filesystem setup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VfsConfig {
    /// Namespace of the facade.
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
    #[serde(default)]
    pub dbafs: Vec<DbafsConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountConfig {
    pub prefix: String,
    pub adapter: AdapterConfig,
}

/// Storage backend of a mount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AdapterConfig {
    Local { root: PathBuf },
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DbafsConfig {
    pub prefix: String,
    pub index: IndexConfig,
    /// Reuse stored hashes for files whose size and mtime are unchanged.
    #[serde(default = "default_true")]
    pub use_last_modified: bool,
}

/// Persistence of a DBAFS index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IndexConfig {
    Sqlite { path: PathBuf },
    Memory,
}

fn default_true() -> bool {
    true
}

impl AdapterConfig {
    fn build(&self) -> VfsResult<Arc<dyn StorageAdapter>> {
        match self {
            AdapterConfig::Local { root } => {
                if !root.is_dir() {
                    return Err(VfsError::configuration(format!(
                        "local adapter root '{}' is not a directory",
                        root.display()
                    )));
                }
                Ok(Arc::new(LocalAdapter::new(root.clone())))
            }
            AdapterConfig::Memory => Ok(Arc::new(MemoryAdapter::new())),
        }
    }
}

impl IndexConfig {
    fn build(&self) -> VfsResult<Arc<dyn IndexRepository>> {
        match self {
            IndexConfig::Sqlite { path } => Ok(Arc::new(SqliteRepository::open(path)?)),
            IndexConfig::Memory => Ok(Arc::new(MemoryRepository::new())),
        }
    }
}

impl VfsConfig {
    pub fn from_toml_str(s: &str) -> VfsResult<Self> {
        toml::from_str(s).map_err(|e| VfsError::configuration(format!("invalid config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> VfsResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            VfsError::configuration(format!("cannot read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Wire up mounts, DBAFS areas and the facade.
    pub async fn build(&self) -> VfsResult<VirtualFilesystem> {
        let mounts = Arc::new(MountManager::new());
        for mount in &self.mounts {
            mounts.mount_arc(mount.adapter.build()?, &mount.prefix).await?;
        }

        let dbafs = Arc::new(DbafsManager::new());
        for area in &self.dbafs {
            let repository = area.index.build()?;
            let area_dbafs = Dbafs::with_repository(repository, Arc::clone(&mounts), &area.prefix)?
                .use_last_modified(area.use_last_modified);
            dbafs.register(area_dbafs)?;
        }

        info!(
            mounts = self.mounts.len(),
            dbafs = self.dbafs.len(),
            prefix = %self.prefix,
            "virtual filesystem configured"
        );
        Ok(VirtualFilesystem::new(mounts, dbafs, &self.prefix)?.with_read_only(self.read_only))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AccessFlags, Options};

    #[test]
    fn test_parse() {
        let config = VfsConfig::from_toml_str(
            r#"
            prefix = "files"
            read_only = true

            [[mounts]]
            prefix = "files"
            adapter = { type = "local", root = "/srv/files" }

            [[mounts]]
            prefix = "scratch"
            adapter = { type = "memory" }

            [[dbafs]]
            prefix = "files"
            index = { type = "sqlite", path = "/var/lib/strata/index.db" }
            "#,
        )
        .unwrap();

        assert_eq!(config.prefix, "files");
        assert!(config.read_only);
        assert_eq!(config.mounts.len(), 2);
        assert_eq!(
            config.mounts[0].adapter,
            AdapterConfig::Local {
                root: PathBuf::from("/srv/files")
            }
        );
        assert_eq!(config.mounts[1].adapter, AdapterConfig::Memory);
        assert!(config.dbafs[0].use_last_modified);
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            VfsConfig::from_toml_str("[[mounts]]\nprefix = \"x\"\nadapter = { type = \"ftp\" }"),
            Err(VfsError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_build() {
        let dir = tempfile::tempdir().unwrap();
        let files = dir.path().join("files");
        std::fs::create_dir(&files).unwrap();

        let config = VfsConfig {
            prefix: String::new(),
            read_only: false,
            mounts: vec![
                MountConfig {
                    prefix: "files".into(),
                    adapter: AdapterConfig::Local { root: files.clone() },
                },
                MountConfig {
                    prefix: "scratch".into(),
                    adapter: AdapterConfig::Memory,
                },
            ],
            dbafs: vec![DbafsConfig {
                prefix: "files".into(),
                index: IndexConfig::Sqlite {
                    path: dir.path().join("index.db"),
                },
                use_last_modified: true,
            }],
        };

        let vfs = config.build().await.unwrap();
        vfs.write("files/hello.txt", b"hi", &Options::new()).await.unwrap();
        assert!(files.join("hello.txt").is_file());
        assert!(vfs.uuid_of("files/hello.txt").await.unwrap().is_some());

        vfs.write("scratch/tmp", b"x", &Options::new()).await.unwrap();
        assert!(vfs.uuid_of("scratch/tmp").await.unwrap().is_none());
        assert!(vfs.file_exists("scratch/tmp", AccessFlags::NONE).await.unwrap());
    }

    #[tokio::test]
    async fn test_build_rejects_duplicate_mounts() {
        let config = VfsConfig::from_toml_str(
            r#"
            [[mounts]]
            prefix = "a"
            adapter = { type = "memory" }

            [[mounts]]
            prefix = "/a/"
            adapter = { type = "memory" }
            "#,
        )
        .unwrap();
        assert!(matches!(config.build().await, Err(VfsError::Configuration(_))));
    }
}
