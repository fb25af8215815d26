use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Local directory where uploads wait for a worker.
pub struct UploadStaging {
    dir: PathBuf,
}

impl UploadStaging {
    /// Use `dir`, creating it if needed.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, StagingError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(StagingError::Io)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write an upload as `<job_id>_<filename>` and return its path.
    pub async fn stage(&self, job_id: Uuid, filename: &str, data: &[u8]) -> Result<PathBuf, StagingError> {
        let name = sanitize_filename(filename).ok_or(StagingError::InvalidName)?;
        let path = self.dir.join(format!("{job_id}_{name}"));
        tokio::fs::write(&path, data).await.map_err(StagingError::Io)?;
        Ok(path)
    }

    /// Delete a staged upload. A file that is already gone is not an error.
    pub async fn remove(&self, path: &Path) -> Result<(), StagingError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StagingError::Io(e)),
        }
    }
}

/// Final path component only, so client names cannot escape the staging dir.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    let name = Path::new(filename.trim()).file_name()?.to_str()?;
    (!name.is_empty()).then(|| name.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("Staging I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upload has no usable file name")]
    InvalidName,
}
