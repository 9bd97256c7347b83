//! Write-once, content-addressed storage for agent outputs.

use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::error::{OrchestratorError, Result};
use crate::model::ArtifactRef;

pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Store bytes under a generated id: compute the digest, write to a
    /// temp file, and rename into place. Overwriting is forbidden.
    pub fn put(&self, label: &str, bytes: &[u8], content_type: &str) -> Result<ArtifactRef> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let file_name = format!("{id}.{}", extension_for(content_type));
        let path = self.dir.join(&file_name);
        if path.exists() {
            return Err(OrchestratorError::Storage(format!(
                "artifact {file_name} already exists"
            )));
        }

        let digest = format!("sha256:{:x}", Sha256::digest(bytes));

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        std::io::Write::write_all(&mut tmp, bytes)?;
        tmp.as_file().sync_data()?;
        tmp.persist(&path)
            .map_err(|e| OrchestratorError::Storage(format!("artifact rename failed: {e}")))?;

        Ok(ArtifactRef {
            label: label.to_string(),
            uri: file_name,
            digest: Some(digest),
            content_type: content_type.to_string(),
            size_bytes: bytes.len() as u64,
        })
    }

    /// Read an artifact back by its URI (a bare file name; anything with a
    /// path separator is rejected).
    pub fn read(&self, uri: &str) -> Result<Vec<u8>> {
        if uri.contains('/') || uri.contains("..") {
            return Err(OrchestratorError::ValidationFailed(format!(
                "invalid artifact uri {uri:?}"
            )));
        }
        let path = self.dir.join(uri);
        if !path.exists() {
            return Err(OrchestratorError::NotFound(format!("artifact {uri}")));
        }
        Ok(std::fs::read(path)?)
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "text/markdown" => "md",
        "text/plain" => "txt",
        "application/json" => "json",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts")).unwrap();

        let reference = store.put("draft-t1", b"hello", "text/markdown").unwrap();
        assert!(reference.uri.ends_with(".md"));
        assert_eq!(reference.size_bytes, 5);
        assert!(reference.digest.as_deref().unwrap().starts_with("sha256:"));

        assert_eq!(store.read(&reference.uri).unwrap(), b"hello");
    }

    #[test]
    fn read_rejects_traversal() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts")).unwrap();
        assert!(store.read("../secrets.txt").is_err());
    }
}
