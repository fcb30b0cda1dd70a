//! DirectoryUploader - delivery into a mounted remote directory
//!
//! Used when the uplink is an NFS/SMB/sshfs mount. Remote paths are relative to
//! the mount root; I/O failures are classified the same way a transfer client
//! would classify them.

use super::{UploadError, Uploader};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Uploader backed by a local mount point
pub struct DirectoryUploader {
    root: PathBuf,
}

impl DirectoryUploader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a remote path under the root, refusing escapes
    fn resolve(&self, remote: &str) -> Result<PathBuf, UploadError> {
        let relative = Path::new(remote.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(UploadError::Upload(format!("invalid remote path: {}", remote)));
        }
        Ok(self.root.join(relative))
    }

    /// An unmounted share shows up as a missing root
    async fn ensure_root(&self) -> Result<(), UploadError> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(UploadError::Connection(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(e) => Err(UploadError::from_io(&e)),
        }
    }
}

#[async_trait]
impl Uploader for DirectoryUploader {
    async fn upload(&self, path: &str, data: &[u8]) -> Result<(), UploadError> {
        self.ensure_root().await?;
        let target = self.resolve(path)?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| UploadError::from_io(&e))?;
        }

        let mut file = fs::File::create(&target)
            .await
            .map_err(|e| UploadError::from_io(&e))?;
        file.write_all(data).await.map_err(|e| UploadError::from_io(&e))?;
        file.sync_all().await.map_err(|e| UploadError::from_io(&e))?;

        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), UploadError> {
        self.ensure_root().await?;
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        fs::rename(&from, &to)
            .await
            .map_err(|e| UploadError::from_io(&e))
    }

    async fn remove(&self, path: &str) -> Result<(), UploadError> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::from_io(&e)),
        }
    }

    async fn test_connection(&self) -> Result<(), UploadError> {
        self.ensure_root().await?;
        let meta = fs::metadata(&self.root)
            .await
            .map_err(|e| UploadError::from_io(&e))?;
        if meta.permissions().readonly() {
            return Err(UploadError::Auth(format!(
                "{} is read-only",
                self.root.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::UploadErrorKind;

    #[tokio::test]
    async fn test_upload_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = DirectoryUploader::new(dir.path());

        uploader.upload("cam-001/a.jpg.tmp", b"jpeg").await.unwrap();
        uploader.rename("cam-001/a.jpg.tmp", "cam-001/a.jpg").await.unwrap();

        assert!(!dir.path().join("cam-001/a.jpg.tmp").exists());
        assert_eq!(std::fs::read(dir.path().join("cam-001/a.jpg")).unwrap(), b"jpeg");
    }

    #[tokio::test]
    async fn test_rejects_parent_escape() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = DirectoryUploader::new(dir.path());
        let err = uploader.upload("../outside.jpg", b"x").await.unwrap_err();
        assert_eq!(err.kind(), UploadErrorKind::Upload);
    }

    #[tokio::test]
    async fn test_missing_root_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = DirectoryUploader::new(dir.path().join("not-mounted"));
        let err = uploader.test_connection().await.unwrap_err();
        assert_eq!(err.kind(), UploadErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = DirectoryUploader::new(dir.path());
        uploader.remove("nothing-here.tmp").await.unwrap();
    }
}
