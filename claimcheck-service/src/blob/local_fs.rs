use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::pin;

use futures_util::StreamExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::{ReaderStream, StreamReader};
use uuid::Uuid;

use super::common::{BlobStore, PayloadStream, validate_name};
use crate::error::{BlobError, BlobResult};

/// A [`BlobStore`] on the local filesystem.
///
/// Containers are directories below the root path and blobs are files named after their key.
/// Blobs are written to a temporary file first and renamed into place, so readers never observe
/// a partial payload.
#[derive(Debug)]
pub struct LocalFsBlobStore {
    path: PathBuf,
}

impl LocalFsBlobStore {
    /// Creates a store rooted at `path`. The directory is created lazily.
    pub fn new(path: &Path) -> Self {
        Self { path: path.into() }
    }

    fn container_path(&self, container: &str) -> BlobResult<PathBuf> {
        validate_name(container)?;
        Ok(self.path.join(container))
    }

    fn blob_path(&self, container: &str, key: &str) -> BlobResult<PathBuf> {
        validate_name(key)?;
        Ok(self.container_path(container)?.join(key))
    }
}

#[async_trait::async_trait]
impl BlobStore for LocalFsBlobStore {
    fn name(&self) -> &'static str {
        "local-fs"
    }

    async fn ensure_container(&self, container: &str) -> BlobResult<()> {
        let path = self.container_path(container)?;
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn put_blob(
        &self,
        container: &str,
        key: &str,
        stream: PayloadStream,
    ) -> BlobResult<()> {
        let path = self.blob_path(container, key)?;
        let directory = self.container_path(container)?;
        if !tokio::fs::try_exists(&directory).await? {
            return Err(BlobError::ContainerNotFound {
                container: container.to_owned(),
            });
        }

        let temp_path = directory.join(format!(".{key}.{}.tmp", Uuid::new_v4()));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;

        let mut reader = pin!(StreamReader::new(stream));
        let mut writer = BufWriter::new(file);

        let written = async {
            tokio::io::copy(&mut reader, &mut writer).await?;
            writer.flush().await?;
            writer.get_ref().sync_data().await
        }
        .await;

        if let Err(err) = written {
            tokio::fs::remove_file(&temp_path).await.ok();
            return Err(err.into());
        }
        drop(writer);

        tokio::fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn blob_length(&self, container: &str, key: &str) -> BlobResult<Option<u64>> {
        let path = self.blob_path(container, key)?;
        match tokio::fs::metadata(path).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_blob(&self, container: &str, key: &str) -> BlobResult<Option<PayloadStream>> {
        let path = self.blob_path(container, key)?;
        let file = match OpenOptions::new().read(true).open(path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let stream = ReaderStream::new(file);
        Ok(Some(stream.boxed()))
    }
}
