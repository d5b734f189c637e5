use core::task::Poll;
use std::{
    cmp, io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::Context,
};

/// Called with `(file name, part number, bytes sent, part length)` as a body is streamed.
///
/// Part numbers are 1-indexed, the same numbering the remote API sees. A
/// standard single-request upload reports as part 1.
pub type ProgressListener =
    Arc<Mutex<dyn FnMut(Arc<String>, usize, usize, usize) + Send + Sync + 'static>>;

const STREAM_CHUNK_SIZE: usize = 1024 * 32;

/// A request body that reports how much of `data` has been handed to the transport.
#[derive(Clone)]
pub struct ProgressStream {
    name: Arc<String>,
    part: usize,
    data: Arc<Vec<u8>>,
    cursor: usize,
    progress_listener: Option<ProgressListener>,
}

impl ProgressStream {
    pub fn new(
        name: Arc<String>,
        part: usize,
        data: Arc<Vec<u8>>,
        progress_listener: Option<ProgressListener>,
    ) -> Self {
        ProgressStream {
            name,
            part,
            data,
            cursor: 0,
            progress_listener,
        }
    }

    fn report(&self) {
        let Some(listener) = &self.progress_listener else {
            return;
        };
        if let Ok(mut report) = listener.lock() {
            report(self.name.clone(), self.part, self.cursor, self.data.len());
        }
    }
}

impl futures::Stream for ProgressStream {
    type Item = io::Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let start = self.cursor;
        if start >= self.data.len() {
            return Poll::Ready(None);
        }
        let end = cmp::min(start + STREAM_CHUNK_SIZE, self.data.len());
        let chunk = self.data[start..end].to_vec();
        self.cursor = end;
        self.report();
        Poll::Ready(Some(Ok(chunk)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn reports_every_chunk_until_done() {
        let seen = Arc::new(Mutex::new(vec![]));
        let sink = seen.clone();
        let listener: ProgressListener = Arc::new(Mutex::new(
            move |name: Arc<String>, part: usize, pos: usize, total: usize| {
                sink.lock().unwrap().push((name.to_string(), part, pos, total));
            },
        ));

        let data = Arc::new(vec![7u8; STREAM_CHUNK_SIZE * 2 + 10]);
        let stream = ProgressStream::new(Arc::new("movie.mp4".into()), 3, data.clone(), Some(listener));
        let chunks: Vec<_> = stream.collect().await;

        let body: Vec<u8> = chunks.into_iter().flat_map(|c| c.unwrap()).collect();
        assert_eq!(body, *data);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], ("movie.mp4".into(), 3, STREAM_CHUNK_SIZE, data.len()));
        assert_eq!(seen[2].2, data.len());
    }
}
