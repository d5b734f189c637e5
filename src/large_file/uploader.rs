use super::{
    piece::{Piece, PieceStatus},
    Error,
};
use crate::{
    api::{B2Api, PartUpload},
    progress::ProgressListener,
};
use std::{collections::VecDeque, path::PathBuf, sync::Arc};
use tokio::{sync::Mutex, task::JoinHandle};

/// Uploads pieces through a fixed pool of workers.
///
/// Workers take pieces from one shared FIFO queue. A piece is moved into the
/// worker that took it and moved back out once it reaches a terminal status,
/// so the queue is the only state the workers share. A failed piece is not
/// retried and does not stop its siblings.
pub struct UploadCoordinator {
    api: Arc<dyn B2Api>,
    name: Arc<String>,
    max_concurrent: usize,
    progress_listener: Option<ProgressListener>,
}

impl UploadCoordinator {
    pub fn new(
        api: Arc<dyn B2Api>,
        name: String,
        max_concurrent: usize,
        progress_listener: Option<ProgressListener>,
    ) -> Self {
        UploadCoordinator {
            api,
            name: Arc::new(name),
            max_concurrent: max_concurrent.max(1),
            progress_listener,
        }
    }

    /// Uploads every piece and returns them in piece order once all have finished.
    ///
    /// Only a panicking worker makes this fail, once every other worker has
    /// finished. No temp file is removed then. Upload failures are recorded
    /// on the pieces themselves.
    pub async fn upload_all(&self, pieces: Vec<Piece>) -> Result<Vec<Piece>, Error> {
        let total = pieces.len();
        let workers = self.max_concurrent.min(total);
        tracing::info!(file = %self.name, parts = total, workers, "Uploading file parts");

        let temp_paths: Vec<PathBuf> = pieces.iter().map(|p| p.temp_path.clone()).collect();
        let queue = Arc::new(Mutex::new(VecDeque::from(pieces)));
        let tasks: Vec<JoinHandle<Vec<Piece>>> = (0..workers)
            .map(|worker| {
                tokio::spawn(Self::work(
                    worker,
                    queue.clone(),
                    self.api.clone(),
                    self.name.clone(),
                    total,
                    self.progress_listener.clone(),
                ))
            })
            .collect();

        let mut finished = Vec::with_capacity(total);
        let mut panicked = None;
        for result in futures::future::join_all(tasks).await {
            match result {
                Ok(done) => finished.extend(done),
                Err(e) => {
                    tracing::error!(file = %self.name, error = %e, "Upload worker panicked");
                    panicked.get_or_insert(e);
                }
            }
        }
        if let Some(source) = panicked {
            return Err(Error::WorkerPanicked {
                source,
                retained: temp_paths,
            });
        }
        finished.sort_by_key(|p| p.piece_number);
        Ok(finished)
    }

    async fn work(
        worker: usize,
        queue: Arc<Mutex<VecDeque<Piece>>>,
        api: Arc<dyn B2Api>,
        name: Arc<String>,
        total: usize,
        progress_listener: Option<ProgressListener>,
    ) -> Vec<Piece> {
        let mut done = vec![];
        loop {
            let next = queue.lock().await.pop_front();
            let Some(mut piece) = next else {
                break;
            };
            tracing::debug!(worker, part = piece.part_number(), total, "Worker took part");
            upload_piece(api.as_ref(), &mut piece, name.clone(), progress_listener.clone()).await;
            done.push(piece);
        }
        done
    }
}

async fn upload_piece(
    api: &dyn B2Api,
    piece: &mut Piece,
    name: Arc<String>,
    progress_listener: Option<ProgressListener>,
) {
    piece.advance(PieceStatus::Uploading);
    tracing::info!(
        part = piece.part_number(),
        path = %piece.temp_path.display(),
        "Starting upload of part"
    );

    match send_piece(api, piece, name, progress_listener).await {
        Ok(()) => {
            piece.advance(PieceStatus::Success);
            tracing::info!(
                part = piece.part_number(),
                path = %piece.temp_path.display(),
                "Part uploaded successfully"
            );
        }
        Err(e) => {
            piece.advance(PieceStatus::Failed);
            tracing::warn!(
                part = piece.part_number(),
                path = %piece.temp_path.display(),
                error = %e,
                "Part upload failed"
            );
        }
    }
}

async fn send_piece(
    api: &dyn B2Api,
    piece: &Piece,
    name: Arc<String>,
    progress_listener: Option<ProgressListener>,
) -> Result<(), Error> {
    let data = tokio::fs::read(&piece.temp_path).await?;
    if data.len() as u64 != piece.size {
        return Err(Error::SizeChanged {
            expected: piece.size,
            actual: data.len() as u64,
        });
    }

    let part = PartUpload {
        name,
        part_number: piece.part_number(),
        sha1: piece.sha1.clone(),
        data: Arc::new(data),
        progress_listener,
    };
    api.upload_part(&piece.upload_url, part).await?;
    Ok(())
}
