//! Multi-part ("large file") uploads.
//!
//! A [`LargeFileSession`] drives one upload through
//! start, split, upload and finish:
//! * [`splitter::PieceSplitter`] cuts the source into fixed-size pieces, each
//!   written to its own temp file with its SHA-1 and one-time part credentials.
//! * [`uploader::UploadCoordinator`] sends every piece through a bounded pool
//!   of workers and waits for all of them.
//! * The session finalizes the remote file from the piece hashes in piece
//!   order and removes the temp files of pieces that were uploaded.

use crate::{api, hasher};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};
use thiserror::Error;
use tokio::task::JoinError;

pub mod piece;
pub mod session;
pub mod splitter;
pub mod uploader;

pub use piece::{Piece, PieceStatus};
pub use session::{upload_large_file, CleanupReport, LargeFileOutcome, LargeFileSession, SessionState};

/// The remote refuses to assemble more parts than this.
pub const MAX_PARTS: u64 = 10_000;

#[derive(Error, Debug)]
pub enum Error {
    #[error("File of {size} bytes needs {parts} parts of {part_size} bytes, more than the limit of {max}", max = MAX_PARTS)]
    TooManyParts { size: u64, part_size: u64, parts: u64 },
    #[error("Part size must be greater than zero")]
    ZeroPartSize,
    #[error("File of {size} bytes is below the large file threshold of {threshold} bytes, use a standard upload")]
    TooSmall { size: u64, threshold: u64 },
    #[error("Source file is {actual} bytes but the session was started for {expected} bytes")]
    SizeChanged { expected: u64, actual: u64 },
    #[error("Hash error: {0}")]
    HashError(#[from] hasher::Error),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Remote API error: {0}")]
    RemoteError(#[from] api::Error),
    #[error("Upload part URL was issued for file {echoed}, requested for {requested}")]
    FileIdMismatch { requested: String, echoed: String },
    #[error("Could not finish large file, {} temp files kept: {source}", .retained.len())]
    FinishFailed {
        #[source]
        source: api::Error,
        retained: Vec<PathBuf>,
    },
    #[error("An upload worker panicked, {} temp files kept: {source}", .retained.len())]
    WorkerPanicked {
        #[source]
        source: JoinError,
        retained: Vec<PathBuf>,
    },
    #[error("Session is {actual:?}, expected {expected:?}")]
    OutOfOrder {
        expected: SessionState,
        actual: SessionState,
    },
    #[error("Tokio task join error")]
    JoinError(#[from] JoinError),
}

/// Coarse classification of [`Error`], following how each failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Limits of the remote would be exceeded. Detected before any I/O.
    Configuration,
    /// The request does not fit the large file path or the bytes read are not the bytes expected.
    Validation,
    Io,
    Remote,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TooManyParts { .. } | Error::ZeroPartSize => ErrorKind::Configuration,
            Error::TooSmall { .. }
            | Error::SizeChanged { .. }
            | Error::OutOfOrder { .. }
            | Error::HashError(hasher::Error::Truncated { .. }) => ErrorKind::Validation,
            Error::HashError(hasher::Error::IoError(_))
            | Error::IoError(_)
            | Error::JoinError(_)
            | Error::WorkerPanicked { .. } => ErrorKind::Io,
            Error::RemoteError(_) | Error::FileIdMismatch { .. } | Error::FinishFailed { .. } => {
                ErrorKind::Remote
            }
        }
    }

    /// Temp files left on disk for manual attention by a failed upload.
    pub fn retained(&self) -> &[PathBuf] {
        match self {
            Error::FinishFailed { retained, .. } | Error::WorkerPanicked { retained, .. } => retained,
            _ => &[],
        }
    }
}

/// Identity and metadata of a local file, captured once before uploading.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub last_modified_millis: i64,
}

impl SourceFile {
    pub fn stat(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let meta = fs::metadata(path)?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|x| x.to_owned())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no UTF-8 file name", path.display()),
                )
            })?;
        let last_modified_millis = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        Ok(SourceFile {
            path: path.to_owned(),
            name,
            size: meta.len(),
            last_modified_millis,
        })
    }
}
