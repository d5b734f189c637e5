use super::{
    piece::{Piece, PieceStatus},
    splitter::PieceSplitter,
    uploader::UploadCoordinator,
    Error, SourceFile,
};
use crate::{
    api::{Authorization, B2Api, B2File, FileInfo, StartLargeFile, AUTO_CONTENT_TYPE},
    config::Config,
    hasher::{self, Digests},
    progress::ProgressListener,
};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

/// `Created -> Started -> Split -> Uploading -> Uploaded -> Finalized`, or
/// `Abandoned` from any stage that fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Split,
    Uploading,
    Uploaded,
    Finalized,
    Abandoned,
}

/// What happened to the temp files after finishing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: Vec<PathBuf>,
    /// Temp files of pieces that were not uploaded, or could not be removed.
    pub retained: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct LargeFileOutcome {
    pub file: B2File,
    pub cleanup: CleanupReport,
}

/// One multi-part upload in progress.
pub struct LargeFileSession {
    api: Arc<dyn B2Api>,
    bucket_id: String,
    source: SourceFile,
    part_size: u64,
    large_file_threshold: u64,
    max_concurrent: usize,
    temp_dir: PathBuf,
    progress_listener: Option<ProgressListener>,

    state: SessionState,
    auth: Option<Authorization>,
    remote_file_id: Option<String>,
    whole_file: Option<Digests>,
    pieces: Vec<Piece>,
}

impl LargeFileSession {
    /// Captures the identity, size and modification time of `path`.
    pub fn new(
        api: Arc<dyn B2Api>,
        config: &Config,
        bucket_id: impl Into<String>,
        path: impl AsRef<Path>,
        progress_listener: Option<ProgressListener>,
    ) -> Result<Self, Error> {
        let source = SourceFile::stat(path)?;
        Ok(LargeFileSession {
            api,
            bucket_id: bucket_id.into(),
            source,
            part_size: config.part_size,
            large_file_threshold: config.large_file_threshold,
            max_concurrent: config.upload_concurrency,
            temp_dir: config.temp_dir.clone(),
            progress_listener,
            state: SessionState::Created,
            auth: None,
            remote_file_id: None,
            whole_file: None,
            pieces: vec![],
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn source(&self) -> &SourceFile {
        &self.source
    }

    pub fn remote_file_id(&self) -> Option<&str> {
        self.remote_file_id.as_deref()
    }

    pub fn whole_file_sha1(&self) -> Option<&str> {
        self.whole_file.as_ref().map(|d| d.sha1.as_str())
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), Error> {
        if self.state != expected {
            return Err(Error::OutOfOrder {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn abandon_on_err<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            tracing::error!(file = %self.source.name, state = ?self.state, error = %e, "Large file upload abandoned");
            self.state = SessionState::Abandoned;
        }
        result
    }

    /// Checks the part limits, hashes the whole file, authorizes and starts the remote large file.
    pub async fn start(&mut self) -> Result<(), Error> {
        self.expect_state(SessionState::Created)?;
        let result = self.try_start().await;
        self.abandon_on_err(result)
    }

    async fn try_start(&mut self) -> Result<(), Error> {
        PieceSplitter::plan(self.source.size, self.part_size, self.large_file_threshold)?;

        let digests = {
            let path = self.source.path.clone();
            tokio::task::spawn_blocking(move || hasher::hash_file(path)).await??
        };
        if digests.len != self.source.size {
            return Err(Error::SizeChanged {
                expected: self.source.size,
                actual: digests.len,
            });
        }

        let auth = self.api.authorize().await?;
        let request = StartLargeFile {
            bucket_id: self.bucket_id.clone(),
            file_name: self.source.name.clone(),
            content_type: AUTO_CONTENT_TYPE.to_owned(),
            file_info: FileInfo {
                large_file_sha1: Some(digests.sha1.clone()),
                src_last_modified_millis: Some(self.source.last_modified_millis.to_string()),
                content_blake2b: Some(digests.blake2b.clone()),
            },
        };
        let started = self.api.start_large_file(&auth, &request).await?;
        tracing::info!(
            file = %self.source.name,
            file_id = %started.file_id,
            size = self.source.size,
            "Started large file"
        );

        self.auth = Some(auth);
        self.remote_file_id = Some(started.file_id);
        self.whole_file = Some(digests);
        self.state = SessionState::Started;
        Ok(())
    }

    pub async fn split(&mut self) -> Result<(), Error> {
        self.expect_state(SessionState::Started)?;
        let result = match (&self.auth, &self.remote_file_id) {
            (Some(auth), Some(file_id)) => {
                PieceSplitter::new(
                    self.api.as_ref(),
                    auth,
                    self.part_size,
                    self.large_file_threshold,
                    &self.temp_dir,
                )
                .split(&self.source, file_id)
                .await
            }
            _ => Err(Error::OutOfOrder {
                expected: SessionState::Started,
                actual: SessionState::Created,
            }),
        };
        self.pieces = self.abandon_on_err(result)?;
        self.state = SessionState::Split;
        Ok(())
    }

    /// Uploads all pieces. Individual part failures are left on the pieces.
    pub async fn upload_all(&mut self) -> Result<(), Error> {
        self.expect_state(SessionState::Split)?;
        self.state = SessionState::Uploading;

        let coordinator = UploadCoordinator::new(
            self.api.clone(),
            self.source.name.clone(),
            self.max_concurrent,
            self.progress_listener.clone(),
        );
        let pieces = std::mem::take(&mut self.pieces);
        let result = coordinator.upload_all(pieces).await;
        self.pieces = self.abandon_on_err(result)?;
        self.state = SessionState::Uploaded;

        let failed = self.failed_parts();
        if !failed.is_empty() {
            tracing::warn!(file = %self.source.name, ?failed, "Some parts failed to upload");
        }
        Ok(())
    }

    pub fn failed_parts(&self) -> Vec<usize> {
        self.pieces
            .iter()
            .filter(|p| p.status() != PieceStatus::Success)
            .map(|p| p.part_number())
            .collect()
    }

    /// Asks the remote to assemble the parts, hashes in piece order.
    ///
    /// The call is made even when some parts failed; the remote rejects it then.
    /// When the remote answers, successfully uploaded temp files are removed
    /// either way. When it cannot be reached every temp file is kept.
    pub async fn finish(&mut self) -> Result<LargeFileOutcome, Error> {
        self.expect_state(SessionState::Uploaded)?;
        let (auth, file_id) = match (&self.auth, &self.remote_file_id) {
            (Some(auth), Some(file_id)) => (auth, file_id),
            _ => {
                return Err(Error::OutOfOrder {
                    expected: SessionState::Uploaded,
                    actual: SessionState::Created,
                })
            }
        };
        let part_sha1s: Vec<String> = self.pieces.iter().map(|p| p.sha1.clone()).collect();

        match self.api.finish_large_file(auth, file_id, &part_sha1s).await {
            Ok(file) => {
                tracing::info!(
                    path = %self.source.path.display(),
                    file_id = %file.file_id,
                    "Finish large file upload completed"
                );
                let cleanup = self.cleanup();
                self.state = SessionState::Finalized;
                Ok(LargeFileOutcome { file, cleanup })
            }
            Err(source @ crate::api::Error::Status { .. }) => {
                tracing::warn!(file = %self.source.name, error = %source, "Finish large file failed");
                let cleanup = self.cleanup();
                self.state = SessionState::Abandoned;
                Err(Error::FinishFailed {
                    source,
                    retained: cleanup.retained,
                })
            }
            Err(source) => {
                tracing::warn!(file = %self.source.name, error = %source, "Could not complete large file");
                self.state = SessionState::Abandoned;
                Err(Error::FinishFailed {
                    source,
                    retained: self.pieces.iter().map(|p| p.temp_path.clone()).collect(),
                })
            }
        }
    }

    /// Deletes the temp file of every uploaded piece and reports the rest.
    pub fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for piece in &self.pieces {
            if piece.status() != PieceStatus::Success {
                tracing::error!(
                    file = %self.source.name,
                    part = piece.part_number(),
                    path = %piece.temp_path.display(),
                    status = %piece.status(),
                    "Temp file of a part that was not uploaded is kept for manual attention"
                );
                report.retained.push(piece.temp_path.clone());
                continue;
            }
            match fs::remove_file(&piece.temp_path) {
                Ok(()) => {
                    tracing::info!(file = %self.source.name, path = %piece.temp_path.display(), "Temporary file deleted");
                    report.deleted.push(piece.temp_path.clone());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    report.deleted.push(piece.temp_path.clone());
                }
                Err(e) => {
                    tracing::warn!(path = %piece.temp_path.display(), error = %e, "Could not delete temp file");
                    report.retained.push(piece.temp_path.clone());
                }
            }
        }
        report
    }

    /// Runs every stage in order.
    pub async fn run(mut self) -> Result<LargeFileOutcome, Error> {
        self.start().await?;
        self.split().await?;
        self.upload_all().await?;
        self.finish().await
    }
}

/// Uploads `path` to `bucket_id` as a multi-part large file, blocking until it
/// is finished or abandoned.
pub async fn upload_large_file(
    api: Arc<dyn B2Api>,
    config: &Config,
    bucket_id: &str,
    path: impl AsRef<Path>,
    progress_listener: Option<ProgressListener>,
) -> Result<LargeFileOutcome, Error> {
    LargeFileSession::new(api, config, bucket_id, path, progress_listener)?
        .run()
        .await
}
