use crate::{
    api::{self, B2Api, B2File, FileUpload},
    config::Config,
    hasher,
    large_file::{self, LargeFileOutcome, SourceFile},
    progress::ProgressListener,
};
use std::{io, path::Path, sync::Arc};
use thiserror::Error;
use tokio::task::JoinError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Hash error: {0}")]
    HashError(#[from] hasher::Error),
    #[error("Upload error: {0}")]
    ApiError(#[from] api::Error),
    #[error("Large file upload error: {0}")]
    LargeFileError(#[from] large_file::Error),
    #[error("Tokio task join error")]
    JoinError(#[from] JoinError),
}

#[derive(Debug)]
pub enum Uploaded {
    Standard(B2File),
    Large(LargeFileOutcome),
}

impl Uploaded {
    pub fn file(&self) -> &B2File {
        match self {
            Uploaded::Standard(file) => file,
            Uploaded::Large(outcome) => &outcome.file,
        }
    }
}

/// Uploads `path` to `bucket_id`, as a single request when it is smaller than
/// `config.large_file_threshold` and as a multi-part large file otherwise.
pub async fn upload_file(
    api: Arc<dyn B2Api>,
    config: &Config,
    bucket_id: &str,
    path: impl AsRef<Path>,
    progress_listener: Option<ProgressListener>,
) -> Result<Uploaded, Error> {
    let source = SourceFile::stat(path.as_ref())?;
    if source.size < config.large_file_threshold {
        tracing::info!(file = %source.name, size = source.size, "Starting standard upload");
        let file = upload_standard(api.as_ref(), bucket_id, &source, progress_listener).await?;
        Ok(Uploaded::Standard(file))
    } else {
        tracing::info!(file = %source.name, size = source.size, "Starting multi-part upload");
        let outcome =
            large_file::upload_large_file(api, config, bucket_id, &source.path, progress_listener)
                .await?;
        Ok(Uploaded::Large(outcome))
    }
}

/// Uploads a whole file in one request, verifying the SHA-1 the remote reports back.
pub async fn upload_standard(
    api: &dyn B2Api,
    bucket_id: &str,
    source: &SourceFile,
    progress_listener: Option<ProgressListener>,
) -> Result<B2File, Error> {
    let data = Arc::new(tokio::fs::read(&source.path).await?);
    let digests = {
        let data = data.clone();
        tokio::task::spawn_blocking(move || hasher::hash_bytes(&data)).await?
    };
    if digests.len != source.size {
        return Err(large_file::Error::SizeChanged {
            expected: source.size,
            actual: digests.len,
        }
        .into());
    }

    let auth = api.authorize().await?;
    let target = api.get_upload_url(&auth, bucket_id).await?;
    let uploaded = api
        .upload_file(
            &target,
            FileUpload {
                file_name: source.name.clone(),
                sha1: digests.sha1,
                blake2b: digests.blake2b,
                last_modified_millis: source.last_modified_millis,
                data,
                progress_listener,
            },
        )
        .await?;

    tracing::info!(
        file = %source.path.display(),
        file_id = %uploaded.file_id,
        "Upload file successful"
    );
    Ok(uploaded)
}
