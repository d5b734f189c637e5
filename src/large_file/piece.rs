use super::{Error, MAX_PARTS};
use crate::api::UploadPartUrl;
use std::{
    fmt,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    NotStarted,
    Uploading,
    Success,
    Failed,
}

impl PieceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PieceStatus::Success | PieceStatus::Failed)
    }

    /// `NotStarted -> Uploading -> {Success, Failed}`; nothing leaves a terminal state.
    pub fn can_become(self, next: PieceStatus) -> bool {
        use PieceStatus::*;
        !self.is_terminal()
            && matches!(
                (self, next),
                (NotStarted, Uploading) | (Uploading, Success) | (Uploading, Failed)
            )
    }
}

impl fmt::Display for PieceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            PieceStatus::NotStarted => "not started",
            PieceStatus::Uploading => "uploading",
            PieceStatus::Success => "success",
            PieceStatus::Failed => "failed",
        };
        write!(f, "{}", result)
    }
}

/// A contiguous byte range of the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceRange {
    pub index: usize,
    pub offset: u64,
    pub size: u64,
}

/// One chunk of the source file, backed by its own temp file.
///
/// A piece is owned by its session and handed by value to exactly one upload
/// worker at a time, so its status needs no locking.
#[derive(Debug)]
pub struct Piece {
    pub piece_number: usize,
    pub offset: u64,
    pub size: u64,
    /// SHA-1 of exactly this piece's bytes, lowercase hex.
    pub sha1: String,
    pub temp_path: PathBuf,
    pub upload_url: UploadPartUrl,
    status: PieceStatus,
}

impl Piece {
    pub fn new(range: PieceRange, sha1: String, temp_path: PathBuf, upload_url: UploadPartUrl) -> Self {
        Piece {
            piece_number: range.index,
            offset: range.offset,
            size: range.size,
            sha1,
            temp_path,
            upload_url,
            status: PieceStatus::NotStarted,
        }
    }

    /// The 1-indexed number the remote API knows this piece by.
    pub fn part_number(&self) -> usize {
        self.piece_number + 1
    }

    pub fn status(&self) -> PieceStatus {
        self.status
    }

    /// Moves to `next` if the transition is allowed. Returns whether it moved.
    pub(crate) fn advance(&mut self, next: PieceStatus) -> bool {
        if self.status.can_become(next) {
            self.status = next;
            true
        } else {
            tracing::error!(
                part = self.part_number(),
                from = %self.status,
                to = %next,
                "Ignoring invalid piece status transition"
            );
            false
        }
    }
}

/// Number of parts needed for `total_size`, rounding up.
pub fn part_count(total_size: u64, part_size: u64) -> Result<u64, Error> {
    if part_size == 0 {
        return Err(Error::ZeroPartSize);
    }
    let parts = total_size.div_ceil(part_size);
    if parts > MAX_PARTS {
        return Err(Error::TooManyParts {
            size: total_size,
            part_size,
            parts,
        });
    }
    Ok(parts)
}

/// Lays out the pieces of a `total_size` file: every piece is `part_size`
/// except the last, which takes the remainder.
pub fn plan_pieces(total_size: u64, part_size: u64) -> Result<Vec<PieceRange>, Error> {
    let parts = part_count(total_size, part_size)?;
    Ok((0..parts)
        .map(|i| {
            let offset = i * part_size;
            PieceRange {
                index: i as usize,
                offset,
                size: part_size.min(total_size - offset),
            }
        })
        .collect())
}

/// `<dir>/<stem>_<index>.<ext>`, or `<dir>/<name>_<index>` when there is no extension.
///
/// The name carries no per-session token: two sessions uploading files with
/// the same name into the same temp dir at once write to the same paths.
pub fn temp_path(temp_dir: &Path, file_name: &str, index: usize) -> PathBuf {
    let name = Path::new(file_name);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_else(|| file_name.into());
    let piece_name = match name.extension() {
        Some(ext) => format!("{}_{}.{}", stem, index, ext.to_string_lossy()),
        None => format!("{}_{}", stem, index),
    };
    temp_dir.join(piece_name)
}
