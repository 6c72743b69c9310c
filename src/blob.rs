//! Photograph blob storage.
//!
//! Bytes land under `{application_id}.{ext}` with owner-only permissions.
//! Blobs are best-effort side storage: a crash between blob write and store
//! update may orphan a file, which `remove_orphans` reclaims later.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob io failed: {0}")]
    Io(String),
    #[error("blob not found for {0}")]
    NotFound(Uuid),
}

impl From<std::io::Error> for BlobError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct StoredPhoto {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: u64,
}

pub struct PhotoBlobs {
    root: PathBuf,
}

impl PhotoBlobs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, application_id: Uuid, ext: &str) -> PathBuf {
        self.root.join(format!("{application_id}.{ext}"))
    }

    pub async fn save(
        &self,
        application_id: Uuid,
        bytes: &[u8],
        ext: &str,
    ) -> Result<StoredPhoto, BlobError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(application_id, ext);
        tokio::fs::write(&path, bytes).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        let sha256 = hex::encode(Sha256::digest(bytes));
        tracing::debug!(
            application_id = %application_id,
            path = %path.display(),
            bytes = bytes.len(),
            "photograph stored"
        );
        Ok(StoredPhoto {
            path,
            sha256,
            byte_size: bytes.len() as u64,
        })
    }

    pub async fn load(&self, application_id: Uuid, ext: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(application_id, ext);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(application_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, application_id: Uuid, ext: &str) -> bool {
        tokio::fs::try_exists(self.path_for(application_id, ext))
            .await
            .unwrap_or(false)
    }

    pub async fn remove(&self, application_id: Uuid, ext: &str) -> Result<(), BlobError> {
        match tokio::fs::remove_file(self.path_for(application_id, ext)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Janitor: delete blobs whose application id is not in `known`.
    /// Never runs as part of the pipeline.
    pub async fn remove_orphans(&self, known: &HashSet<Uuid>) -> Result<usize, BlobError> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !orphan_candidate(&path, known) {
                continue;
            }
            tokio::fs::remove_file(&path).await?;
            tracing::info!(path = %path.display(), "orphaned photograph removed");
            removed += 1;
        }
        Ok(removed)
    }
}

fn orphan_candidate(path: &Path, known: &HashSet<Uuid>) -> bool {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    match stem.parse::<Uuid>() {
        Ok(id) => !known.contains(&id),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_load_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = PhotoBlobs::new(dir.path());
        let id = Uuid::new_v4();

        let stored = blobs.save(id, b"jpeg bytes", "jpg").await.unwrap();
        assert_eq!(stored.byte_size, 10);
        assert!(blobs.exists(id, "jpg").await);
        assert_eq!(blobs.load(id, "jpg").await.unwrap(), b"jpeg bytes");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&stored.path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        blobs.remove(id, "jpg").await.unwrap();
        assert!(!blobs.exists(id, "jpg").await);
        assert!(matches!(
            blobs.load(id, "jpg").await,
            Err(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn digest_matches_content() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = PhotoBlobs::new(dir.path());
        let stored = blobs.save(Uuid::new_v4(), b"abc", "png").await.unwrap();
        assert_eq!(
            stored.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn orphan_sweep_keeps_known_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = PhotoBlobs::new(dir.path());
        let keep = Uuid::new_v4();
        let orphan = Uuid::new_v4();
        blobs.save(keep, b"keep", "jpg").await.unwrap();
        blobs.save(orphan, b"orphan", "jpg").await.unwrap();

        let known: HashSet<Uuid> = [keep].into_iter().collect();
        assert_eq!(blobs.remove_orphans(&known).await.unwrap(), 1);
        assert!(blobs.exists(keep, "jpg").await);
        assert!(!blobs.exists(orphan, "jpg").await);
    }
}
