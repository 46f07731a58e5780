use crate::config::UploadConfig;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio::{sync::broadcast::Receiver, task::JoinHandle};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("File extension not allowed. Allowed extensions: {allowed}")]
    UnsupportedExtension { allowed: String },
    #[error("File too large. Maximum size: {limit} bytes")]
    TooLarge { limit: usize },
    #[error("Upload storage failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub file_name: String,
    pub path: PathBuf,
}

impl StoredUpload {
    pub fn url(&self) -> String {
        upload_url(&self.file_name)
    }
}

/// Path under which the router serves a stored upload.
pub fn upload_url(file_name: &str) -> String {
    format!("/uploads/{file_name}")
}

/// Directory holding uploaded scans under generated names.
#[derive(Debug, Clone)]
pub struct UploadStore {
    config: UploadConfig,
}

impl UploadStore {
    pub async fn create(config: UploadConfig) -> Result<Self, UploadError> {
        tokio::fs::create_dir_all(&config.upload_dir)
            .await
            .map_err(|source| UploadError::Io {
                path: config.upload_dir.clone(),
                source,
            })?;

        Ok(Self { config })
    }

    pub fn dir(&self) -> &Path {
        &self.config.upload_dir
    }

    pub fn max_file_size(&self) -> usize {
        self.config.max_file_size
    }

    /// Returns the lowercased extension of `file_name` when it is allowed.
    pub fn validate_extension(&self, file_name: Option<&str>) -> Result<String, UploadError> {
        let extension = file_name
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_lowercase());

        let allowed = |ext: &str| {
            self.config
                .allowed_extensions
                .iter()
                .any(|a| a.eq_ignore_ascii_case(ext))
        };

        match extension {
            Some(ext) if allowed(&ext) => Ok(ext),
            _ => Err(UploadError::UnsupportedExtension {
                allowed: self.config.allowed_extensions.join(", "),
            }),
        }
    }

    pub fn validate_size(&self, size: usize) -> Result<(), UploadError> {
        if size > self.config.max_file_size {
            return Err(UploadError::TooLarge {
                limit: self.config.max_file_size,
            });
        }
        Ok(())
    }

    pub async fn save(&self, extension: &str, bytes: &[u8]) -> Result<StoredUpload, UploadError> {
        let file_name = format!("{}.{}", Uuid::new_v4(), extension);
        let path = self.config.upload_dir.join(&file_name);

        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| UploadError::Io {
                path: path.clone(),
                source,
            })?;
        tracing::debug!("Stored upload {:?} ({} bytes)", path, bytes.len());

        Ok(StoredUpload { file_name, path })
    }

    pub async fn remove(&self, upload: &StoredUpload) {
        if let Err(e) = tokio::fs::remove_file(&upload.path).await {
            tracing::warn!("Failed to remove upload {:?}: {}", upload.path, e);
        }
    }

    /// Deletes regular files whose modification time is older than `max_age`. Files that cannot
    /// be inspected or removed are skipped.
    pub async fn clean_old_files(&self, max_age: Duration) -> Result<usize, UploadError> {
        let dir = self.dir();
        let io_error = |source| UploadError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let now = SystemTime::now();
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(dir).await.map_err(io_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let path = entry.path();
            let modified = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata.modified(),
                Ok(_) => continue,
                Err(e) => Err(e),
            };

            let age = match modified {
                Ok(modified) => now.duration_since(modified).unwrap_or_default(),
                Err(e) => {
                    tracing::warn!("Could not read modification time of {:?}: {}", path, e);
                    continue;
                }
            };
            if age <= max_age {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Failed to remove old upload {:?}: {}", path, e),
            }
        }

        Ok(removed)
    }

    /// Runs [`UploadStore::clean_old_files`] every `cleanup_interval_secs` until shutdown.
    pub fn spawn_cleanup(self: Arc<Self>, mut shutdown_rx: Receiver<()>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.cleanup_interval_secs.max(1));
        let max_age = Duration::from_secs(self.config.max_file_age_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match self.clean_old_files(max_age).await {
                            Ok(count) => tracing::info!("Cleaned {} old files from {:?}", count, self.dir()),
                            Err(e) => tracing::error!("Error cleaning old files: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Stopping upload cleanup task");
                        break;
                    }
                }
            }
        })
    }
}
