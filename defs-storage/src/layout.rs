//! Directory layout under a node root
//!
//! ```text
//! <root>/files/uploads/<file_id>/                 staging copies
//! <root>/files/slices/<node_id>/<file_id>/<hash>  shard objects
//! <root>/files/downloads/                         reconstructed files
//! <root>/db/businessdbs/                          metadata store
//! ```

use defs_core::error::{DefsError, Result};
use std::path::{Path, PathBuf};

/// Resolves every well-known directory of a node root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRoots {
    root: PathBuf,
}

impl FileRoots {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uploads(&self) -> PathBuf {
        self.root.join("files").join("uploads")
    }

    pub fn upload_dir(&self, file_id: &str) -> Result<PathBuf> {
        Ok(self.uploads().join(component(file_id)?))
    }

    pub fn slices(&self) -> PathBuf {
        self.root.join("files").join("slices")
    }

    pub fn node_dir(&self, node_id: &str) -> Result<PathBuf> {
        Ok(self.slices().join(component(node_id)?))
    }

    pub fn file_dir(&self, node_id: &str, file_id: &str) -> Result<PathBuf> {
        Ok(self.node_dir(node_id)?.join(component(file_id)?))
    }

    pub fn shard_path(&self, node_id: &str, file_id: &str, shard_hash: &str) -> Result<PathBuf> {
        Ok(self.file_dir(node_id, file_id)?.join(component(shard_hash)?))
    }

    pub fn downloads(&self) -> PathBuf {
        self.root.join("files").join("downloads")
    }

    pub fn business_dbs(&self) -> PathBuf {
        self.root.join("db").join("businessdbs")
    }

    /// Create every fixed directory
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.uploads(),
            self.slices(),
            self.downloads(),
            self.business_dbs(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Reject ids that would escape their directory
fn component(id: &str) -> Result<&str> {
    let ok = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(id)
    } else {
        Err(DefsError::Storage(format!("invalid path component: {:?}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let roots = FileRoots::new("/data");
        assert_eq!(roots.uploads(), PathBuf::from("/data/files/uploads"));
        assert_eq!(
            roots.shard_path("node", "file", "hash").unwrap(),
            PathBuf::from("/data/files/slices/node/file/hash")
        );
        assert_eq!(roots.downloads(), PathBuf::from("/data/files/downloads"));
        assert_eq!(roots.business_dbs(), PathBuf::from("/data/db/businessdbs"));
    }

    #[test]
    fn test_rejects_traversal() {
        let roots = FileRoots::new("/data");
        assert!(roots.shard_path("node", "..", "hash").is_err());
        assert!(roots.shard_path("node", "a/b", "hash").is_err());
        assert!(roots.shard_path("", "file", "hash").is_err());
        assert!(roots.shard_path("node", "file", ".hidden").is_err());
        assert!(roots.upload_dir("abc123").is_ok());
    }

    #[test]
    fn test_ensure_creates_tree() {
        let dir = tempfile::tempdir().unwrap();
        let roots = FileRoots::new(dir.path());
        roots.ensure().unwrap();
        assert!(roots.slices().is_dir());
        assert!(roots.business_dbs().is_dir());
    }
}
